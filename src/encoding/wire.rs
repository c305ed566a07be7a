//! Wire is the hand-packed binary layout shared by chain messages, packed
//! attribute values, and map elements. All integers are little-endian. Byte
//! slices are framed with a u32 length prefix, except where a format says
//! otherwise (top-level string attributes are raw, since the attribute vector
//! already frames them).
//!
//! Decoding works on a `Bytes` cursor so that decoded slices share the
//! message buffer instead of copying it; a decoded key or attribute keeps the
//! whole receive buffer alive via its refcount.

use crate::errdata;
use crate::error::Result;

use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Decodes a u8 from the front of the buffer.
pub fn get_u8(buf: &mut Bytes) -> Result<u8> {
    if buf.remaining() < 1 {
        return errdata!("unexpected end of buffer");
    }
    Ok(buf.get_u8())
}

/// Decodes a little-endian u16 from the front of the buffer.
pub fn get_u16(buf: &mut Bytes) -> Result<u16> {
    if buf.remaining() < 2 {
        return errdata!("unexpected end of buffer");
    }
    Ok(buf.get_u16_le())
}

/// Decodes a little-endian u32 from the front of the buffer.
pub fn get_u32(buf: &mut Bytes) -> Result<u32> {
    if buf.remaining() < 4 {
        return errdata!("unexpected end of buffer");
    }
    Ok(buf.get_u32_le())
}

/// Decodes a little-endian u64 from the front of the buffer.
pub fn get_u64(buf: &mut Bytes) -> Result<u64> {
    if buf.remaining() < 8 {
        return errdata!("unexpected end of buffer");
    }
    Ok(buf.get_u64_le())
}

/// Decodes a u32-length-prefixed slice from the front of the buffer, without
/// copying the payload.
pub fn get_slice(buf: &mut Bytes) -> Result<Bytes> {
    let len = get_u32(buf)? as usize;
    if buf.remaining() < len {
        return errdata!("slice length {len} exceeds buffer");
    }
    Ok(buf.split_to(len))
}

/// Decodes a packed attribute vector: u32-length-prefixed slices back to back
/// until the buffer is exhausted.
pub fn get_value(buf: &mut Bytes) -> Result<Vec<Bytes>> {
    let mut value = Vec::new();
    while buf.has_remaining() {
        value.push(get_slice(buf)?);
    }
    Ok(value)
}

/// Encodes a u32-length-prefixed slice.
pub fn put_slice(buf: &mut BytesMut, slice: &[u8]) {
    buf.put_u32_le(slice.len() as u32);
    buf.put_slice(slice);
}

/// Encodes a packed attribute vector in schema order.
pub fn put_value(buf: &mut BytesMut, value: &[Bytes]) {
    for attr in value {
        put_slice(buf, attr);
    }
}

/// The encoded size of a packed attribute vector.
pub fn value_size(value: &[Bytes]) -> usize {
    value.iter().map(|attr| 4 + attr.len()).sum()
}
