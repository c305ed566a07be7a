//! Chain protocol messages.
//!
//! Payload layouts, after the transport's framing header (all integers
//! little-endian, slices u32-length-prefixed, packed values per
//! [`crate::encoding::wire`]):
//!
//! - CHAIN_PUT: u64 version, u8 flags (bit 0 = fresh), key, packed value.
//! - CHAIN_DEL: u64 version, key.
//! - CHAIN_SUBSPACE: u64 version, key, packed value, u64 next point.
//! - CHAIN_ACK: u64 version, key.
//! - Client response: u64 nonce, u16 return code.
//!
//! Pack functions reserve `header_size` zero bytes at the front for the
//! transport to fill; decode functions expect the header already stripped.

use crate::encoding::wire;
use crate::errdata;
use crate::error::Result;

use bytes::{BufMut, Bytes, BytesMut};

/// A message type, identifying the handler for a payload.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq)]
pub enum MsgType {
    /// A client mutation request. Decoded by the daemon front-end, not here.
    ReqAtomic,
    /// A client response.
    RespAtomic,
    ChainPut,
    ChainDel,
    ChainSubspace,
    ChainAck,
}

/// A client-visible return code. Wire values are stable.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ReturnCode {
    Success,
    NotFound,
    BadDimSpec,
    NotUs,
    CmpFail,
    Overflow,
    ReadOnly,
    ServerError,
}

impl ReturnCode {
    pub fn from_wire(code: u16) -> Option<Self> {
        Some(match code {
            0 => Self::Success,
            1 => Self::NotFound,
            2 => Self::BadDimSpec,
            3 => Self::NotUs,
            4 => Self::CmpFail,
            5 => Self::Overflow,
            6 => Self::ReadOnly,
            7 => Self::ServerError,
            _ => return None,
        })
    }

    pub fn to_wire(self) -> u16 {
        match self {
            Self::Success => 0,
            Self::NotFound => 1,
            Self::BadDimSpec => 2,
            Self::NotUs => 3,
            Self::CmpFail => 4,
            Self::Overflow => 5,
            Self::ReadOnly => 6,
            Self::ServerError => 7,
        }
    }
}

/// A decoded CHAIN_PUT payload.
#[derive(Clone, Debug, PartialEq)]
pub struct ChainPut {
    pub version: u64,
    pub fresh: bool,
    pub key: Bytes,
    pub value: Vec<Bytes>,
}

/// A decoded CHAIN_DEL payload.
#[derive(Clone, Debug, PartialEq)]
pub struct ChainDel {
    pub version: u64,
    pub key: Bytes,
}

/// A decoded CHAIN_SUBSPACE payload.
#[derive(Clone, Debug, PartialEq)]
pub struct ChainSubspace {
    pub version: u64,
    pub key: Bytes,
    pub value: Vec<Bytes>,
    pub next_point: u64,
}

/// A decoded CHAIN_ACK payload.
#[derive(Clone, Debug, PartialEq)]
pub struct ChainAck {
    pub version: u64,
    pub key: Bytes,
}

/// A decoded client response payload.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ClientResponse {
    pub nonce: u64,
    pub returncode: ReturnCode,
}

fn packer(header_size: usize, payload_size: usize) -> BytesMut {
    let mut buf = BytesMut::with_capacity(header_size + payload_size);
    buf.put_bytes(0, header_size);
    buf
}

pub fn pack_chain_put(
    header_size: usize,
    version: u64,
    fresh: bool,
    key: &[u8],
    value: &[Bytes],
) -> Bytes {
    let mut buf = packer(header_size, 8 + 1 + 4 + key.len() + wire::value_size(value));
    buf.put_u64_le(version);
    buf.put_u8(fresh as u8);
    wire::put_slice(&mut buf, key);
    wire::put_value(&mut buf, value);
    buf.freeze()
}

pub fn pack_chain_del(header_size: usize, version: u64, key: &[u8]) -> Bytes {
    let mut buf = packer(header_size, 8 + 4 + key.len());
    buf.put_u64_le(version);
    wire::put_slice(&mut buf, key);
    buf.freeze()
}

pub fn pack_chain_subspace(
    header_size: usize,
    version: u64,
    key: &[u8],
    value: &[Bytes],
    next_point: u64,
) -> Bytes {
    let mut buf = packer(header_size, 8 + 4 + key.len() + wire::value_size(value) + 8);
    buf.put_u64_le(version);
    wire::put_slice(&mut buf, key);
    wire::put_value(&mut buf, value);
    buf.put_u64_le(next_point);
    buf.freeze()
}

pub fn pack_chain_ack(header_size: usize, version: u64, key: &[u8]) -> Bytes {
    let mut buf = packer(header_size, 8 + 4 + key.len());
    buf.put_u64_le(version);
    wire::put_slice(&mut buf, key);
    buf.freeze()
}

pub fn pack_client_response(header_size: usize, nonce: u64, returncode: ReturnCode) -> Bytes {
    let mut buf = packer(header_size, 8 + 2);
    buf.put_u64_le(nonce);
    buf.put_u16_le(returncode.to_wire());
    buf.freeze()
}

pub fn decode_chain_put(mut buf: Bytes) -> Result<ChainPut> {
    let version = wire::get_u64(&mut buf)?;
    let flags = wire::get_u8(&mut buf)?;
    let key = wire::get_slice(&mut buf)?;
    let value = wire::get_value(&mut buf)?;
    Ok(ChainPut { version, fresh: flags & 1 != 0, key, value })
}

pub fn decode_chain_del(mut buf: Bytes) -> Result<ChainDel> {
    let version = wire::get_u64(&mut buf)?;
    let key = wire::get_slice(&mut buf)?;
    if !buf.is_empty() {
        return errdata!("trailing bytes after CHAIN_DEL payload");
    }
    Ok(ChainDel { version, key })
}

pub fn decode_chain_subspace(mut buf: Bytes) -> Result<ChainSubspace> {
    let version = wire::get_u64(&mut buf)?;
    let key = wire::get_slice(&mut buf)?;
    if buf.len() < 8 {
        return errdata!("CHAIN_SUBSPACE payload too short");
    }
    let mut value_bytes = buf.split_to(buf.len() - 8);
    let value = wire::get_value(&mut value_bytes)?;
    let next_point = wire::get_u64(&mut buf)?;
    Ok(ChainSubspace { version, key, value, next_point })
}

pub fn decode_chain_ack(mut buf: Bytes) -> Result<ChainAck> {
    let version = wire::get_u64(&mut buf)?;
    let key = wire::get_slice(&mut buf)?;
    if !buf.is_empty() {
        return errdata!("trailing bytes after CHAIN_ACK payload");
    }
    Ok(ChainAck { version, key })
}

pub fn decode_client_response(mut buf: Bytes) -> Result<ClientResponse> {
    let nonce = wire::get_u64(&mut buf)?;
    let code = wire::get_u16(&mut buf)?;
    let Some(returncode) = ReturnCode::from_wire(code) else {
        return errdata!("unknown return code {code}");
    };
    Ok(ClientResponse { nonce, returncode })
}
