use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    #[error("buffer too short")]
    ErrBufferShort,
    #[error("label exceeds 63 bytes")]
    ErrLabelTooLong,
    #[error("invalid label length byte")]
    ErrInvalidLabel,
    #[error("name compression loop")]
    ErrCompressionLoop,
    #[error("record data length out of range")]
    ErrResourceLen,
    #[error("character string exceeds 255 bytes")]
    ErrStringTooLong,
    #[error("name must not be empty")]
    ErrNameEmpty,
    #[error("service name contains invalid characters")]
    ErrInvalidServiceName,
    #[error("service type must contain service and protocol, both starting with an underscore")]
    ErrInvalidServiceType,
    #[error("domain must start with a dot")]
    ErrInvalidDomain,
    #[error("invalid port number")]
    ErrInvalidPortNumber,
    #[error("ttl out of range")]
    ErrTtlOutOfRange,
    #[error("can't split fully-qualified name")]
    ErrBadFqdn,
    #[error("engine closed")]
    ErrEngineClosed,
    #[error("invalid packet text form: {0}")]
    ErrPacketParse(String),
    #[error("io: {0}")]
    Io(String),
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e.to_string())
    }
}
