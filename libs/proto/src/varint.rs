//! Variable-length integers.
//!
//! Seven payload bits per byte, least significant group first; the high bit
//! of each byte says another byte follows. An `i32` never needs more than
//! five bytes.

use bytes::{Buf, BufMut};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::DecodeError;

/// Longest encoding of a 32-bit varint.
pub const MAX_VARINT_LEN: usize = 5;

const SEGMENT_BITS: u8 = 0x7F;
const CONTINUE_BIT: u8 = 0x80;

/// Read a varint from an async source, one byte at a time.
pub async fn read_varint<R: AsyncRead + Unpin>(source: &mut R) -> Result<i32, DecodeError> {
    let mut result: u32 = 0;
    for index in 0..MAX_VARINT_LEN {
        let byte = source.read_u8().await?;
        result |= u32::from(byte & SEGMENT_BITS) << (7 * index);
        if byte & CONTINUE_BIT == 0 {
            return Ok(result as i32);
        }
    }
    Err(DecodeError::MalformedVarInt)
}

/// Read a varint from an in-memory buffer.
pub fn get_varint<B: Buf>(buf: &mut B) -> Result<i32, DecodeError> {
    let mut result: u32 = 0;
    for index in 0..MAX_VARINT_LEN {
        if !buf.has_remaining() {
            return Err(DecodeError::UnexpectedEof);
        }
        let byte = buf.get_u8();
        result |= u32::from(byte & SEGMENT_BITS) << (7 * index);
        if byte & CONTINUE_BIT == 0 {
            return Ok(result as i32);
        }
    }
    Err(DecodeError::MalformedVarInt)
}

/// Append the varint encoding of `value`.
///
/// Negative numbers take the full five bytes, as they do on the wire.
pub fn put_varint<B: BufMut>(buf: &mut B, value: i32) {
    let mut value = value as u32;
    loop {
        if value & !u32::from(SEGMENT_BITS) == 0 {
            buf.put_u8(value as u8);
            return;
        }
        buf.put_u8((value as u8 & SEGMENT_BITS) | CONTINUE_BIT);
        value >>= 7;
    }
}
