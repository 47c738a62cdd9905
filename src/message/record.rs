//! DNS resource records and their wire codec.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use serde_json::Value;

use super::name::{pack_name, unpack_name};
use super::packer::{pack_str, pack_u16, pack_u32, unpack_str, unpack_u16, unpack_u32};
use super::{RecordType, CLASS_IN_FLUSH, CLASS_UNICAST_REPLY};
use crate::error::{Error, Result};

/// The contents of a TXT record: an insertion-ordered map from keys to
/// optional values. An entry with no value encodes as a bare `key`, one
/// with a value as `key=value`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TxtData(Vec<(String, Option<String>)>);

impl TxtData {
    pub fn new() -> Self {
        TxtData(Vec::new())
    }

    /// Insert or replace an entry, preserving the position of an existing
    /// key.
    pub fn insert(&mut self, key: impl Into<String>, value: Option<String>) {
        let key = key.into();
        for entry in &mut self.0 {
            if entry.0 == key {
                entry.1 = value;
                return;
            }
        }
        self.0.push((key, value));
    }

    pub fn get(&self, key: &str) -> Option<&Option<String>> {
        self.0.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, Option<&str>)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_deref()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for TxtData {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        let mut txt = TxtData::new();
        for (k, v) in iter {
            txt.insert(k, Some(v.into()));
        }
        txt
    }
}

/// The typed payload of a record. Questions carry no data.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RecordData {
    A(Ipv4Addr),
    Aaaa(Ipv6Addr),
    Ptr(String),
    Srv {
        priority: u16,
        weight: u16,
        port: u16,
        target: String,
    },
    Txt(TxtData),
    Nsec(Vec<u8>),
    Unknown(Vec<u8>),
}

/// A single DNS record; a [`Packet`](super::packet::Packet) holds several.
///
/// The name is kept exactly as heard, case and escapes included. The class
/// of records we create is always IN with the cache-flush bit
/// (`0x8001`); decoded records keep whatever class was on the wire.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Record {
    name: String,
    rtype: RecordType,
    class: u16,
    ttl: u32,
    data: Option<RecordData>,
}

impl Record {
    pub(crate) fn question(rtype: RecordType, name: impl Into<String>) -> Record {
        let name = name.into();
        debug_assert!(!name.is_empty());
        Record {
            name,
            rtype,
            class: CLASS_IN_FLUSH,
            ttl: 0,
            data: None,
        }
    }

    pub(crate) fn new_address(ttl: u32, name: impl Into<String>, addr: IpAddr) -> Record {
        let (rtype, data) = match addr {
            IpAddr::V4(a) => (RecordType::A, RecordData::A(a)),
            IpAddr::V6(a) => (RecordType::Aaaa, RecordData::Aaaa(a)),
        };
        Record {
            name: name.into(),
            rtype,
            class: CLASS_IN_FLUSH,
            ttl,
            data: Some(data),
        }
    }

    pub(crate) fn ptr(ttl: u32, name: impl Into<String>, value: impl Into<String>) -> Record {
        Record {
            name: name.into(),
            rtype: RecordType::Ptr,
            class: CLASS_IN_FLUSH,
            ttl,
            data: Some(RecordData::Ptr(value.into())),
        }
    }

    pub(crate) fn srv(
        ttl: u32,
        name: impl Into<String>,
        target: impl Into<String>,
        port: u16,
        weight: u16,
        priority: u16,
    ) -> Record {
        let target = target.into();
        debug_assert!(!target.is_empty());
        Record {
            name: name.into(),
            rtype: RecordType::Srv,
            class: CLASS_IN_FLUSH,
            ttl,
            data: Some(RecordData::Srv {
                priority,
                weight,
                port,
                target,
            }),
        }
    }

    pub(crate) fn txt(ttl: u32, name: impl Into<String>, text: TxtData) -> Record {
        Record {
            name: name.into(),
            rtype: RecordType::Txt,
            class: CLASS_IN_FLUSH,
            ttl,
            data: Some(RecordData::Txt(text)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn rtype(&self) -> RecordType {
        self.rtype
    }

    pub fn class(&self) -> u16 {
        self.class
    }

    pub fn ttl(&self) -> u32 {
        self.ttl
    }

    pub(crate) fn set_ttl(&mut self, ttl: u32) {
        self.ttl = ttl;
    }

    /// On a decoded question, whether the sender asked for a unicast reply.
    pub fn unicast_reply(&self) -> bool {
        self.class & CLASS_UNICAST_REPLY != 0
    }

    pub fn data(&self) -> Option<&RecordData> {
        self.data.as_ref()
    }

    pub fn address(&self) -> Option<IpAddr> {
        match self.data {
            Some(RecordData::A(a)) => Some(IpAddr::V4(a)),
            Some(RecordData::Aaaa(a)) => Some(IpAddr::V6(a)),
            _ => None,
        }
    }

    pub fn ptr_value(&self) -> Option<&str> {
        match &self.data {
            Some(RecordData::Ptr(v)) => Some(v),
            _ => None,
        }
    }

    pub fn srv_target(&self) -> Option<&str> {
        match &self.data {
            Some(RecordData::Srv { target, .. }) => Some(target),
            _ => None,
        }
    }

    pub fn srv_port(&self) -> Option<u16> {
        match &self.data {
            Some(RecordData::Srv { port, .. }) => Some(*port),
            _ => None,
        }
    }

    pub fn text(&self) -> Option<&TxtData> {
        match &self.data {
            Some(RecordData::Txt(t)) => Some(t),
            _ => None,
        }
    }

    // Wire format: name | type:u16 | class:u16 | ttl:u32 | rdlen:u16 | rdata.
    // Questions (no data) stop after the class.

    pub(crate) fn pack(&self, msg: &mut Vec<u8>) -> Result<()> {
        pack_name(msg, &self.name)?;
        pack_u16(msg, self.rtype.value());
        pack_u16(msg, self.class);
        let data = match &self.data {
            Some(d) => d,
            None => return Ok(()),
        };
        pack_u32(msg, self.ttl);
        let len_off = msg.len();
        pack_u16(msg, 0);
        match data {
            RecordData::A(a) => msg.extend_from_slice(&a.octets()),
            RecordData::Aaaa(a) => msg.extend_from_slice(&a.octets()),
            RecordData::Ptr(v) => pack_name(msg, v)?,
            RecordData::Srv {
                priority,
                weight,
                port,
                target,
            } => {
                pack_u16(msg, *priority);
                pack_u16(msg, *weight);
                pack_u16(msg, *port);
                pack_name(msg, target)?;
            }
            RecordData::Txt(text) => {
                if text.is_empty() {
                    msg.push(0);
                } else {
                    for (k, v) in text.iter() {
                        let entry = match v {
                            Some(v) => format!("{k}={v}"),
                            None => k.to_string(),
                        };
                        pack_str(msg, entry.as_bytes())?;
                    }
                }
            }
            RecordData::Nsec(b) | RecordData::Unknown(b) => msg.extend_from_slice(b),
        }
        let rdlen = msg.len() - len_off - 2;
        if rdlen > u16::MAX as usize {
            return Err(Error::ErrResourceLen);
        }
        msg[len_off] = (rdlen >> 8) as u8;
        msg[len_off + 1] = (rdlen & 0xFF) as u8;
        Ok(())
    }

    pub(crate) fn unpack_question(msg: &[u8], off: usize) -> Result<(Record, usize)> {
        let (name, off) = unpack_name(msg, off)?;
        let (rtype, off) = unpack_u16(msg, off)?;
        let (class, off) = unpack_u16(msg, off)?;
        Ok((
            Record {
                name,
                rtype: RecordType::from(rtype),
                class,
                ttl: 0,
                data: None,
            },
            off,
        ))
    }

    pub(crate) fn unpack_answer(msg: &[u8], off: usize) -> Result<(Record, usize)> {
        let (name, off) = unpack_name(msg, off)?;
        let (rtype, off) = unpack_u16(msg, off)?;
        let rtype = RecordType::from(rtype);
        let (class, off) = unpack_u16(msg, off)?;
        let (ttl, off) = unpack_u32(msg, off)?;
        let (rdlen, off) = unpack_u16(msg, off)?;
        let rdlen = rdlen as usize;
        let end = off + rdlen;
        if end > msg.len() {
            return Err(Error::ErrResourceLen);
        }
        let data = match rtype {
            RecordType::A => {
                if rdlen != 4 {
                    return Err(Error::ErrResourceLen);
                }
                let mut octets = [0u8; 4];
                octets.copy_from_slice(&msg[off..end]);
                RecordData::A(Ipv4Addr::from(octets))
            }
            RecordType::Aaaa => {
                if rdlen != 16 {
                    return Err(Error::ErrResourceLen);
                }
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&msg[off..end]);
                RecordData::Aaaa(Ipv6Addr::from(octets))
            }
            RecordType::Ptr => {
                let (value, _) = unpack_name(msg, off)?;
                RecordData::Ptr(value)
            }
            RecordType::Srv => {
                let (priority, o) = unpack_u16(msg, off)?;
                let (weight, o) = unpack_u16(msg, o)?;
                let (port, o) = unpack_u16(msg, o)?;
                let (target, _) = unpack_name(msg, o)?;
                RecordData::Srv {
                    priority,
                    weight,
                    port,
                    target,
                }
            }
            RecordType::Txt => {
                let mut text = TxtData::new();
                let mut o = off;
                while o < end {
                    let (entry, next) = unpack_str(msg, o)?;
                    o = next;
                    if entry.is_empty() {
                        continue;
                    }
                    match entry.find('=') {
                        Some(ix) if ix > 0 => {
                            text.insert(&entry[..ix], Some(entry[ix + 1..].to_string()))
                        }
                        _ => text.insert(entry, None),
                    }
                }
                RecordData::Txt(text)
            }
            RecordType::Nsec => RecordData::Nsec(msg[off..end].to_vec()),
            _ => RecordData::Unknown(msg[off..end].to_vec()),
        };
        Ok((
            Record {
                name,
                rtype,
                class,
                ttl,
                data: Some(data),
            },
            end,
        ))
    }

    // The JSON text form, shared with Packet. Display writes it and
    // from_json reads it back.

    pub(crate) fn from_json(v: &Value) -> Result<Record> {
        let obj = v
            .as_object()
            .ok_or_else(|| Error::ErrPacketParse("record is not an object".to_string()))?;
        let rtype = match obj.get("type") {
            Some(Value::String(s)) => match s.as_str() {
                "a" => RecordType::A,
                "aaaa" => RecordType::Aaaa,
                "ptr" => RecordType::Ptr,
                "srv" => RecordType::Srv,
                "txt" => RecordType::Txt,
                "cname" => RecordType::Cname,
                "nsec" => RecordType::Nsec,
                "any" => RecordType::Any,
                other => {
                    return Err(Error::ErrPacketParse(format!("invalid type \"{other}\"")));
                }
            },
            Some(Value::Number(n)) => RecordType::from(n.as_u64().unwrap_or(0) as u16),
            _ => return Err(Error::ErrPacketParse("missing record type".to_string())),
        };
        let name = obj
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::ErrPacketParse("missing record name".to_string()))?
            .to_string();
        let class = obj.get("class").and_then(Value::as_u64).unwrap_or(0) as u16;
        let ttl = obj.get("ttl").and_then(Value::as_u64).unwrap_or(0) as u32;
        let data = match rtype {
            RecordType::Ptr => obj
                .get("value")
                .and_then(Value::as_str)
                .map(|s| RecordData::Ptr(s.to_string())),
            RecordType::A | RecordType::Aaaa => match obj.get("address").and_then(Value::as_str) {
                Some(s) => {
                    let addr: IpAddr = s
                        .parse()
                        .map_err(|_| Error::ErrPacketParse(format!("invalid address \"{s}\"")))?;
                    Some(match addr {
                        IpAddr::V4(a) => RecordData::A(a),
                        IpAddr::V6(a) => RecordData::Aaaa(a),
                    })
                }
                None => None,
            },
            RecordType::Srv => match obj.get("host").and_then(Value::as_str) {
                Some(host) => Some(RecordData::Srv {
                    priority: obj.get("priority").and_then(Value::as_u64).unwrap_or(0) as u16,
                    weight: obj.get("weight").and_then(Value::as_u64).unwrap_or(0) as u16,
                    port: obj.get("port").and_then(Value::as_u64).unwrap_or(0) as u16,
                    target: host.to_string(),
                }),
                None => None,
            },
            RecordType::Txt => obj.get("data").and_then(Value::as_object).map(|m| {
                let mut text = TxtData::new();
                for (k, v) in m {
                    text.insert(k.clone(), v.as_str().map(str::to_string));
                }
                RecordData::Txt(text)
            }),
            _ => obj.get("bytes").and_then(Value::as_str).map(|hex| {
                let bytes = parse_hex(hex);
                if rtype == RecordType::Nsec {
                    RecordData::Nsec(bytes)
                } else {
                    RecordData::Unknown(bytes)
                }
            }),
        };
        Ok(Record {
            name,
            rtype,
            class,
            ttl,
            data,
        })
    }
}

fn parse_hex(s: &str) -> Vec<u8> {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len() / 2);
    let mut i = 0;
    while i + 1 < bytes.len() {
        let hi = (bytes[i] as char).to_digit(16).unwrap_or(0) as u8;
        let lo = (bytes[i + 1] as char).to_digit(16).unwrap_or(0) as u8;
        out.push(hi << 4 | lo);
        i += 2;
    }
    out
}

pub(crate) fn quote(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for c in s.chars() {
        match c {
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            c if c.is_control() => out.push_str(&format!("\\u{:04x}", c as u32)),
            c => out.push(c),
        }
    }
    out.push('"');
    out
}

impl fmt::Display for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{\"type\":")?;
        match self.rtype {
            RecordType::Other(v) => write!(f, "{v}")?,
            t => write!(f, "\"{t}\"")?,
        }
        write!(
            f,
            ",\"name\":{},\"class\":{},\"ttl\":{}",
            quote(&self.name),
            self.class,
            self.ttl
        )?;
        match &self.data {
            None => {}
            Some(RecordData::A(a)) => write!(f, ",\"address\":{}", quote(&a.to_string()))?,
            Some(RecordData::Aaaa(a)) => write!(f, ",\"address\":{}", quote(&a.to_string()))?,
            Some(RecordData::Ptr(v)) => write!(f, ",\"value\":{}", quote(v))?,
            Some(RecordData::Srv {
                priority,
                weight,
                port,
                target,
            }) => write!(
                f,
                ",\"host\":{},\"port\":{port},\"priority\":{priority},\"weight\":{weight}",
                quote(target)
            )?,
            Some(RecordData::Txt(text)) => {
                write!(f, ",\"data\":{{")?;
                for (i, (k, v)) in text.iter().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    match v {
                        Some(v) => write!(f, "{}:{}", quote(k), quote(v))?,
                        None => write!(f, "{}:null", quote(k))?,
                    }
                }
                write!(f, "}}")?;
            }
            Some(RecordData::Nsec(b)) | Some(RecordData::Unknown(b)) => {
                write!(f, ",\"bytes\":\"")?;
                for byte in b {
                    write!(f, "{byte:02x}")?;
                }
                write!(f, "\"")?;
            }
        }
        write!(f, "}}")
    }
}
