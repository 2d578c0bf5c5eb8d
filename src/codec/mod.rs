//! Binary codec primitives shared by the wire protocol and cache records
//!
//! All values are read left-to-right off a [`Buf`], advancing the cursor so
//! reads chain. A truncated or malformed buffer surfaces as a [`CodecError`]
//! instead of garbage bytes.

use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Maximum number of bytes a varlong may occupy (u64 in 7-bit groups)
const VARLONG_MAX_BYTES: usize = 10;

/// Codec errors
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("Buffer ended mid-read (needed {needed} more bytes)")]
    Truncated { needed: usize },

    #[error("Varlong exceeds {VARLONG_MAX_BYTES} bytes")]
    VarlongTooLong,

    #[error("Declared length {0} exceeds remaining buffer")]
    LengthOverrun(u64),

    #[error("String is not valid UTF-8")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),
}

/// Write a non-negative integer as an unsigned LEB128 varlong.
pub fn write_varlong(buf: &mut BytesMut, mut value: u64) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            buf.put_u8(byte);
            return;
        }
        buf.put_u8(byte | 0x80);
    }
}

/// Read an unsigned LEB128 varlong, advancing the buffer past it.
pub fn read_varlong(buf: &mut impl Buf) -> Result<u64, CodecError> {
    let mut value: u64 = 0;
    for i in 0..VARLONG_MAX_BYTES {
        if !buf.has_remaining() {
            return Err(CodecError::Truncated { needed: 1 });
        }
        let byte = buf.get_u8();
        value |= u64::from(byte & 0x7f) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok(value);
        }
    }
    Err(CodecError::VarlongTooLong)
}

/// Write a length-prefixed UTF-8 string.
pub fn write_string(buf: &mut BytesMut, value: &str) {
    write_varlong(buf, value.len() as u64);
    buf.put_slice(value.as_bytes());
}

/// Read a length-prefixed UTF-8 string.
pub fn read_string(buf: &mut impl Buf) -> Result<String, CodecError> {
    let raw = read_bytes(buf)?;
    Ok(String::from_utf8(raw.to_vec())?)
}

/// Write a length-prefixed binary blob.
pub fn write_bytes(buf: &mut BytesMut, value: &[u8]) {
    write_varlong(buf, value.len() as u64);
    buf.put_slice(value);
}

/// Read a length-prefixed binary blob.
pub fn read_bytes(buf: &mut impl Buf) -> Result<Bytes, CodecError> {
    let len = read_varlong(buf)?;
    if len > buf.remaining() as u64 {
        return Err(CodecError::LengthOverrun(len));
    }
    Ok(buf.copy_to_bytes(len as usize))
}
