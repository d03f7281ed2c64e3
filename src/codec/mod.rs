//! MQTT wire codec
//!
//! Field-level readers and writers shared by the `Decoder` and `Encoder`.
//! Readers take a slice starting at the field and report how many bytes the
//! field occupied so callers can step a cursor through a packet.

mod decode;
mod encode;


pub use decode::Decoder;
pub use encode::Encoder;

use crate::protocol::{DecodeError, EncodeError};
use bytes::{BufMut, BytesMut};

/// Largest value a four-byte variable byte integer can carry
pub const MAX_REMAINING_LENGTH: usize = 268_435_455;

/// Limit applied by `Decoder::new` when none is configured
pub const DEFAULT_MAX_PACKET_SIZE: usize = 1024 * 1024;

/// Variable byte integer: `(value, width)`
pub fn read_variable_int(buf: &[u8]) -> Result<(u32, usize), DecodeError> {
    let mut value = 0u32;
    for (i, &byte) in buf.iter().take(4).enumerate() {
        value |= u32::from(byte & 0x7F) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok((value, i + 1));
        }
    }
    if buf.len() < 4 {
        Err(DecodeError::InsufficientData)
    } else {
        Err(DecodeError::InvalidRemainingLength)
    }
}

/// Write `value` as a variable byte integer, returning its width
pub fn write_variable_int(buf: &mut BytesMut, value: u32) -> Result<usize, EncodeError> {
    if value as usize > MAX_REMAINING_LENGTH {
        return Err(EncodeError::PacketTooLarge);
    }
    let mut rest = value;
    let mut width = 0;
    loop {
        let digit = (rest & 0x7F) as u8;
        rest >>= 7;
        width += 1;
        if rest == 0 {
            buf.put_u8(digit);
            return Ok(width);
        }
        buf.put_u8(digit | 0x80);
    }
}

/// Total size of the packet starting at `buf[0]`, once its fixed header is in
///
/// `None` while the remaining-length bytes are still arriving.
pub fn frame_length(buf: &[u8]) -> Result<Option<usize>, DecodeError> {
    let Some(header) = buf.get(1..) else {
        return Ok(None);
    };
    match read_variable_int(header) {
        Ok((remaining, width)) => Ok(Some(1 + width + remaining as usize)),
        Err(DecodeError::InsufficientData) => Ok(None),
        Err(e) => Err(e),
    }
}

/// Big-endian two byte integer
pub fn read_u16(buf: &[u8]) -> Result<u16, DecodeError> {
    match buf {
        [hi, lo, ..] => Ok(u16::from_be_bytes([*hi, *lo])),
        _ => Err(DecodeError::InsufficientData),
    }
}

/// Big-endian four byte integer
pub fn read_u32(buf: &[u8]) -> Result<u32, DecodeError> {
    match buf {
        [a, b, c, d, ..] => Ok(u32::from_be_bytes([*a, *b, *c, *d])),
        _ => Err(DecodeError::InsufficientData),
    }
}

/// Length-prefixed bytes: `(data, prefix + data width)`
pub fn read_binary(buf: &[u8]) -> Result<(&[u8], usize), DecodeError> {
    let len = usize::from(read_u16(buf)?);
    let data = buf.get(2..2 + len).ok_or(DecodeError::InsufficientData)?;
    Ok((data, 2 + len))
}

/// Length-prefixed UTF-8 without NUL characters
pub fn read_string(buf: &[u8]) -> Result<(&str, usize), DecodeError> {
    let (data, width) = read_binary(buf)?;
    let text = std::str::from_utf8(data).map_err(|_| DecodeError::InvalidUtf8)?;
    if text.contains('\0') {
        return Err(DecodeError::MalformedPacket("NUL in UTF-8 string"));
    }
    Ok((text, width))
}

/// Width of a v5.0 property block, length prefix included
pub fn skip_properties(buf: &[u8]) -> Result<usize, DecodeError> {
    let (len, width) = read_variable_int(buf)?;
    let total = width + len as usize;
    if total > buf.len() {
        return Err(DecodeError::InsufficientData);
    }
    Ok(total)
}

pub fn write_binary(buf: &mut BytesMut, data: &[u8]) -> Result<(), EncodeError> {
    let len = u16::try_from(data.len()).map_err(|_| EncodeError::StringTooLong)?;
    buf.put_u16(len);
    buf.put_slice(data);
    Ok(())
}

pub fn write_string(buf: &mut BytesMut, text: &str) -> Result<(), EncodeError> {
    write_binary(buf, text.as_bytes())
}
