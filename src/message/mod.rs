
pub(crate) mod name;
pub(crate) mod packer;
pub mod packet;
pub mod record;

use std::fmt;

/// A `RecordType` identifies the kind of DNS resource record or question.
///
/// Only the DNS-SD record types are acted on by the engine; `Cname` and
/// `Nsec` are decoded but otherwise ignored, and anything else round-trips
/// through [`Other`](RecordType::Other).
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum RecordType {
    A,
    Cname,
    Ptr,
    Txt,
    Aaaa,
    Srv,
    Nsec,
    Any,
    Other(u16),
}

impl RecordType {
    pub(crate) fn value(self) -> u16 {
        match self {
            RecordType::A => 1,
            RecordType::Cname => 5,
            RecordType::Ptr => 12,
            RecordType::Txt => 16,
            RecordType::Aaaa => 28,
            RecordType::Srv => 33,
            RecordType::Nsec => 47,
            RecordType::Any => 255,
            RecordType::Other(v) => v,
        }
    }
}

impl From<u16> for RecordType {
    fn from(v: u16) -> Self {
        match v {
            1 => RecordType::A,
            5 => RecordType::Cname,
            12 => RecordType::Ptr,
            16 => RecordType::Txt,
            28 => RecordType::Aaaa,
            33 => RecordType::Srv,
            47 => RecordType::Nsec,
            255 => RecordType::Any,
            _ => RecordType::Other(v),
        }
    }
}

impl fmt::Display for RecordType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            RecordType::A => write!(f, "a"),
            RecordType::Cname => write!(f, "cname"),
            RecordType::Ptr => write!(f, "ptr"),
            RecordType::Txt => write!(f, "txt"),
            RecordType::Aaaa => write!(f, "aaaa"),
            RecordType::Srv => write!(f, "srv"),
            RecordType::Nsec => write!(f, "nsec"),
            RecordType::Any => write!(f, "any"),
            RecordType::Other(v) => write!(f, "{v}"),
        }
    }
}

/// Class written on every record the responder creates: IN with the
/// mDNS cache-flush bit set.
pub(crate) const CLASS_IN_FLUSH: u16 = 0x8001;

/// High bit of a question class: the sender asks for a unicast reply.
pub(crate) const CLASS_UNICAST_REPLY: u16 = 0x8000;

pub(crate) const FLAG_RESPONSE: u16 = 1 << 15;
pub(crate) const FLAG_AUTHORITATIVE: u16 = 1 << 10;
