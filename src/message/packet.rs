//! Immutable DNS message containers.

use std::fmt;
use std::net::IpAddr;
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::Value;

use super::packer::{pack_u16, unpack_u16};
use super::record::{quote, Record};
use super::{RecordType, FLAG_AUTHORITATIVE, FLAG_RESPONSE};
use crate::error::{Error, Result};
use crate::iface::NicInfo;
use crate::service::Service;

/// A single mDNS message: a header plus four record sections. Packets are
/// immutable once built; deriving a new packet (for one interface, or as a
/// goodbye) clones the records it keeps.
///
/// The text form written by `Display` is JSON and [`Packet::parse`] reads
/// it back into an equivalent packet, which the property tests lean on.
#[derive(Clone, Debug)]
pub struct Packet {
    id: u16,
    flags: u16,
    questions: Vec<Record>,
    answers: Vec<Record>,
    authorities: Vec<Record>,
    additionals: Vec<Record>,
    nic: Option<String>,
    timestamp_ms: u64,
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

impl Packet {
    /// A query packet. If the question asks for A or AAAA the sibling
    /// family is added so one packet can return both.
    pub(crate) fn question(question: Record) -> Packet {
        let questions = match question.rtype() {
            RecordType::A => {
                let aaaa = Record::question(RecordType::Aaaa, question.name());
                vec![question, aaaa]
            }
            RecordType::Aaaa => {
                let a = Record::question(RecordType::A, question.name());
                vec![a, question]
            }
            _ => vec![question],
        };
        Packet {
            id: 0,
            flags: 0,
            questions,
            answers: Vec::new(),
            authorities: Vec::new(),
            additionals: Vec::new(),
            nic: None,
            timestamp_ms: now_ms(),
        }
    }

    /// A response to `question`, inheriting its id and interface and
    /// marked authoritative.
    pub(crate) fn response_to(
        question: &Packet,
        answers: Vec<Record>,
        additionals: Vec<Record>,
    ) -> Packet {
        Packet {
            id: question.id,
            flags: FLAG_RESPONSE | FLAG_AUTHORITATIVE,
            questions: Vec::new(),
            answers,
            authorities: Vec::new(),
            additionals,
            nic: question.nic.clone(),
            timestamp_ms: now_ms(),
        }
    }

    /// The full announcement for a service: PTR, SRV and TXT answers plus
    /// one address additional per service address.
    pub(crate) fn announcement(service: &Service) -> Packet {
        let fqdn = service.fqdn().to_string();
        let type_domain = format!("{}{}", service.service_type(), service.domain());
        let host = service.effective_host();
        let answers = vec![
            Record::ptr(service.ttl_ptr(), type_domain, fqdn.clone()),
            Record::srv(
                service.ttl_srv(),
                fqdn.clone(),
                host.clone(),
                service.port().unwrap_or(0),
                0,
                0,
            ),
            Record::txt(service.ttl_txt(), fqdn, service.text().unwrap_or_default()),
        ];
        let additionals = service
            .effective_addresses()
            .into_iter()
            .map(|addr| Record::new_address(service.ttl_a(), host.clone(), addr))
            .collect();
        Packet {
            id: 0,
            flags: FLAG_RESPONSE | FLAG_AUTHORITATIVE,
            questions: Vec::new(),
            answers,
            authorities: Vec::new(),
            additionals,
            nic: None,
            timestamp_ms: now_ms(),
        }
    }

    /// A placeholder for reporting errors about datagrams that never
    /// decoded into a packet.
    pub(crate) fn empty(nic: Option<String>) -> Packet {
        Packet {
            id: 0,
            flags: 0,
            questions: Vec::new(),
            answers: Vec::new(),
            authorities: Vec::new(),
            additionals: Vec::new(),
            nic,
            timestamp_ms: now_ms(),
        }
    }

    /// Decode a datagram: header counts first, then each section in order.
    pub(crate) fn decode(msg: &[u8], nic: Option<String>) -> Result<Packet> {
        let (id, off) = unpack_u16(msg, 0)?;
        let (flags, off) = unpack_u16(msg, off)?;
        let (qd, off) = unpack_u16(msg, off)?;
        let (an, off) = unpack_u16(msg, off)?;
        let (ns, off) = unpack_u16(msg, off)?;
        let (ar, mut off) = unpack_u16(msg, off)?;
        let mut questions = Vec::with_capacity(qd as usize);
        for _ in 0..qd {
            let (q, next) = Record::unpack_question(msg, off)?;
            questions.push(q);
            off = next;
        }
        let mut sections = [
            (an, Vec::with_capacity(an as usize)),
            (ns, Vec::with_capacity(ns as usize)),
            (ar, Vec::with_capacity(ar as usize)),
        ];
        for (count, records) in &mut sections {
            for _ in 0..*count {
                if off >= msg.len() {
                    break;
                }
                let (r, next) = Record::unpack_answer(msg, off)?;
                records.push(r);
                off = next;
            }
        }
        let [(_, answers), (_, authorities), (_, additionals)] = sections;
        Ok(Packet {
            id,
            flags,
            questions,
            answers,
            authorities,
            additionals,
            nic,
            timestamp_ms: now_ms(),
        })
    }

    pub(crate) fn encode(&self, msg: &mut Vec<u8>) -> Result<()> {
        pack_u16(msg, self.id);
        pack_u16(msg, self.flags);
        pack_u16(msg, self.questions.len() as u16);
        pack_u16(msg, self.answers.len() as u16);
        pack_u16(msg, self.authorities.len() as u16);
        pack_u16(msg, self.additionals.len() as u16);
        for r in self
            .questions
            .iter()
            .chain(&self.answers)
            .chain(&self.authorities)
            .chain(&self.additionals)
        {
            r.pack(msg)?;
        }
        Ok(())
    }

    pub fn id(&self) -> u16 {
        self.id
    }

    pub fn flags(&self) -> u16 {
        self.flags
    }

    pub fn is_response(&self) -> bool {
        self.flags & FLAG_RESPONSE != 0
    }

    pub fn is_authoritative(&self) -> bool {
        self.flags & FLAG_AUTHORITATIVE != 0
    }

    /// The interface the packet was heard on (or is targeted at), if any.
    pub fn nic(&self) -> Option<&str> {
        self.nic.as_deref()
    }

    pub fn timestamp_ms(&self) -> u64 {
        self.timestamp_ms
    }

    pub fn questions(&self) -> &[Record] {
        &self.questions
    }

    pub fn answers(&self) -> &[Record] {
        &self.answers
    }

    pub fn authorities(&self) -> &[Record] {
        &self.authorities
    }

    pub fn additionals(&self) -> &[Record] {
        &self.additionals
    }

    /// The same packet with every answer and additional re-labelled with
    /// TTL 0, which tells the link the records expire immediately.
    pub(crate) fn goodbye(&self) -> Packet {
        let mut dup = self.clone();
        for r in dup.answers.iter_mut().chain(dup.additionals.iter_mut()) {
            r.set_ttl(0);
        }
        dup.timestamp_ms = now_ms();
        dup
    }

    /// Restrict the packet to the records that apply to `nic`. A record
    /// applies when it carries no address, when its address falls inside
    /// one of `nic`'s subnets, or when its address matches no subnet of
    /// any known interface (then it goes everywhere). Returns `None` when
    /// nothing is left.
    pub(crate) fn applied_to(&self, nic: &NicInfo, all: &[NicInfo]) -> Option<Packet> {
        let keep = |r: &&Record| record_applies(r, nic, all);
        let questions: Vec<Record> = self.questions.iter().filter(keep).cloned().collect();
        let answers: Vec<Record> = self.answers.iter().filter(keep).cloned().collect();
        let authorities: Vec<Record> = self.authorities.iter().filter(keep).cloned().collect();
        let additionals: Vec<Record> = self.additionals.iter().filter(keep).cloned().collect();
        if questions.is_empty() && answers.is_empty() && authorities.is_empty() && additionals.is_empty()
        {
            return None;
        }
        Some(Packet {
            id: self.id,
            flags: self.flags,
            questions,
            answers,
            authorities,
            additionals,
            nic: Some(nic.name.clone()),
            timestamp_ms: self.timestamp_ms,
        })
    }

    /// Parse the text form written by `Display` back into a packet.
    pub fn parse(text: &str) -> Result<Packet> {
        let v: Value =
            serde_json::from_str(text).map_err(|e| Error::ErrPacketParse(e.to_string()))?;
        let obj = v
            .as_object()
            .ok_or_else(|| Error::ErrPacketParse("packet is not an object".to_string()))?;
        let id = obj.get("id").and_then(Value::as_u64).unwrap_or(0) as u16;
        let flags = obj.get("flags").and_then(Value::as_u64).unwrap_or(0) as u16;
        let timestamp_ms = obj.get("timestamp").and_then(Value::as_u64).unwrap_or(0);
        let nic = obj
            .get("nic")
            .and_then(Value::as_str)
            .map(str::to_string);
        let section = |key: &str| -> Result<Vec<Record>> {
            match obj.get(key) {
                Some(Value::Array(items)) => items.iter().map(Record::from_json).collect(),
                _ => Ok(Vec::new()),
            }
        };
        Ok(Packet {
            id,
            flags,
            questions: section("questions")?,
            answers: section("answers")?,
            authorities: section("authorities")?,
            additionals: section("additionals")?,
            nic,
            timestamp_ms,
        })
    }
}

fn addr_applies(addr: IpAddr, nic: &NicInfo) -> bool {
    for ia in &nic.addrs {
        let a0 = ip_octets(ia.addr);
        let a1 = ip_octets(addr);
        let mask = ip_octets(ia.netmask);
        if a0.len() != a1.len() {
            continue;
        }
        if a0
            .iter()
            .zip(&a1)
            .zip(&mask)
            .all(|((x, y), m)| x & m == y & m)
        {
            return true;
        }
    }
    false
}

fn record_applies(r: &Record, nic: &NicInfo, all: &[NicInfo]) -> bool {
    let addr = match r.address() {
        Some(addr) => addr,
        None => return true,
    };
    if addr_applies(addr, nic) {
        return true;
    }
    for other in all {
        if other.name != nic.name && addr_applies(addr, other) {
            return false;
        }
    }
    true
}

fn ip_octets(addr: IpAddr) -> Vec<u8> {
    match addr {
        IpAddr::V4(a) => a.octets().to_vec(),
        IpAddr::V6(a) => a.octets().to_vec(),
    }
}

impl fmt::Display for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{{\"id\":{},\"timestamp\":{},\"flags\":{}",
            self.id, self.timestamp_ms, self.flags
        )?;
        if let Some(nic) = &self.nic {
            write!(f, ",\"nic\":{}", quote(nic))?;
        }
        write!(f, ",\"response\":{}", self.is_response())?;
        for (key, records) in [
            ("questions", &self.questions),
            ("answers", &self.answers),
            ("additionals", &self.additionals),
            ("authorities", &self.authorities),
        ] {
            if records.is_empty() {
                continue;
            }
            write!(f, ",\"{key}\":[")?;
            for (i, r) in records.iter().enumerate() {
                if i > 0 {
                    write!(f, ",")?;
                }
                write!(f, "{r}")?;
            }
            write!(f, "]")?;
        }
        write!(f, "}}")
    }
}
