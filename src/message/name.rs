//! Label-sequence names on the wire.
//!
//! A name is a run of length-prefixed labels terminated by a zero byte. A
//! length byte with the top two bits set starts a 14-bit back-pointer into
//! the same datagram (RFC 1035 compression). The writer always emits full
//! labels; the reader honours pointers and bounds the number of
//! dereferences by the packet size so a pointer loop cannot hang it.
//!
//! Names are treated as UTF-8 transparent text with `.` separating labels;
//! a dot or backslash inside a label is escaped with a backslash, both on
//! the way in (writer splits only at unescaped dots) and on the way out
//! (reader re-escapes), so decoded names compare equal to written ones.

use crate::error::{Error, Result};

const MAX_LABEL_LEN: usize = 0x3F;
const POINTER_MASK: u8 = 0xC0;

pub(crate) fn pack_name(msg: &mut Vec<u8>, name: &str) -> Result<()> {
    let bytes = name.as_bytes();
    let mut label: Vec<u8> = Vec::new();
    let mut i = 0;
    while i <= bytes.len() {
        let done = i == bytes.len();
        let b = if done { b'.' } else { bytes[i] };
        if b == b'\\' && i + 1 < bytes.len() {
            label.push(bytes[i + 1]);
            i += 2;
            continue;
        }
        if b == b'.' {
            if !label.is_empty() {
                if label.len() > MAX_LABEL_LEN {
                    return Err(Error::ErrLabelTooLong);
                }
                msg.push(label.len() as u8);
                msg.extend_from_slice(&label);
                label.clear();
            }
            i += 1;
            continue;
        }
        label.push(b);
        i += 1;
    }
    msg.push(0);
    Ok(())
}

pub(crate) fn unpack_name(msg: &[u8], off: usize) -> Result<(String, usize)> {
    let mut name = String::new();
    let mut off = off;
    let mut end: Option<usize> = None;
    let mut hops = 0usize;
    loop {
        if off >= msg.len() {
            return Err(Error::ErrBufferShort);
        }
        let len = msg[off];
        if len == 0 {
            off += 1;
            break;
        }
        if len & POINTER_MASK == POINTER_MASK {
            if off + 1 >= msg.len() {
                return Err(Error::ErrBufferShort);
            }
            let ptr = (((len & !POINTER_MASK) as usize) << 8) | msg[off + 1] as usize;
            if end.is_none() {
                end = Some(off + 2);
            }
            hops += 1;
            if hops > msg.len() {
                return Err(Error::ErrCompressionLoop);
            }
            off = ptr;
            continue;
        }
        if len & POINTER_MASK != 0 {
            // 0x40 and 0x80 prefixes are reserved
            return Err(Error::ErrInvalidLabel);
        }
        let len = len as usize;
        if off + 1 + len > msg.len() {
            return Err(Error::ErrBufferShort);
        }
        if !name.is_empty() {
            name.push('.');
        }
        for c in String::from_utf8_lossy(&msg[off + 1..off + 1 + len]).chars() {
            if c == '.' || c == '\\' {
                name.push('\\');
            }
            name.push(c);
        }
        off += 1 + len;
    }
    Ok((name, end.unwrap_or(off)))
}
