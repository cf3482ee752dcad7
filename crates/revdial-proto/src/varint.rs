//! Variable-length integer encoding
//!
//! Unsigned values use LEB128 (7 bits per byte, high bit = continuation).
//! Signed values are zig-zag mapped first so small negatives stay short.

use bytes::{Buf, BufMut};

use crate::frame::FrameError;

/// Maximum encoded length of a 64-bit varint
pub const MAX_VARINT_LEN: usize = 10;

/// Append an unsigned varint
pub fn put_uvarint<B: BufMut>(buf: &mut B, mut value: u64) {
    while value >= 0x80 {
        buf.put_u8((value as u8) | 0x80);
        value >>= 7;
    }
    buf.put_u8(value as u8);
}

/// Append a zig-zag encoded signed varint
pub fn put_varint<B: BufMut>(buf: &mut B, value: i64) {
    let mut ux = (value as u64) << 1;
    if value < 0 {
        ux = !ux;
    }
    put_uvarint(buf, ux);
}

/// Read an unsigned varint
pub fn get_uvarint<B: Buf>(buf: &mut B) -> Result<u64, FrameError> {
    let mut value: u64 = 0;
    let mut shift: u32 = 0;

    for i in 0..MAX_VARINT_LEN {
        if !buf.has_remaining() {
            return Err(FrameError::Truncated);
        }

        let byte = buf.get_u8();
        if byte < 0x80 {
            if i == MAX_VARINT_LEN - 1 && byte > 1 {
                return Err(FrameError::VarintOverflow);
            }
            return Ok(value | (u64::from(byte) << shift));
        }

        value |= u64::from(byte & 0x7f) << shift;
        shift += 7;
    }

    Err(FrameError::VarintOverflow)
}

/// Read a zig-zag encoded signed varint
pub fn get_varint<B: Buf>(buf: &mut B) -> Result<i64, FrameError> {
    let ux = get_uvarint(buf)?;
    let mut value = (ux >> 1) as i64;
    if ux & 1 != 0 {
        value = !value;
    }
    Ok(value)
}
