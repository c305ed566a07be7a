//! Typed attribute values and the micro-operation engine.
//!
//! Every attribute in a space has a datatype. A client mutation is a batch of
//! micro-checks (equality preconditions) and micro-ops (typed primitive
//! mutations) that the point-leader applies atomically against the latest
//! value to produce the next version. Scalar types apply directly; container
//! types (maps) decode their byte form, apply a batch of element-level ops,
//! and re-encode canonically.
//!
//! - scalar: string/int64/float element operations.
//! - map: the sorted key→value container engine.

pub mod map;
pub mod scalar;

use crate::config::Schema;
use crate::encoding::wire;
use crate::errdata;
use crate::error::Result;

use bytes::{Bytes, BytesMut};
use serde_derive::{Deserialize, Serialize};

/// An attribute datatype. Map types exist for every (key, value) combination
/// of the three scalar types; `MapGeneric` is only valid as the type of an
/// empty map literal in a SET operand.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub enum DataType {
    /// An opaque byte string. Top-level attributes carry it raw; inside a map
    /// it is framed with a u32 length.
    String,
    /// A signed 64-bit integer, 8 bytes little-endian. The empty slice reads
    /// as zero.
    Int64,
    /// A 64-bit IEEE float, 8 bytes little-endian. The empty slice reads as
    /// zero.
    Float,
    MapStringString,
    MapStringInt64,
    MapStringFloat,
    MapInt64String,
    MapInt64Int64,
    MapInt64Float,
    MapFloatString,
    MapFloatInt64,
    MapFloatFloat,
    /// The type of the empty generic map literal.
    MapGeneric,
}

impl DataType {
    /// Decodes a wire tag.
    pub fn from_wire(tag: u16) -> Option<Self> {
        Some(match tag {
            1 => Self::String,
            2 => Self::Int64,
            3 => Self::Float,
            8 => Self::MapGeneric,
            16 => Self::MapStringString,
            17 => Self::MapStringInt64,
            18 => Self::MapStringFloat,
            19 => Self::MapInt64String,
            20 => Self::MapInt64Int64,
            21 => Self::MapInt64Float,
            22 => Self::MapFloatString,
            23 => Self::MapFloatInt64,
            24 => Self::MapFloatFloat,
            _ => return None,
        })
    }

    /// The wire tag. Tags are wire-stable; new types extend, never renumber.
    pub fn to_wire(self) -> u16 {
        match self {
            Self::String => 1,
            Self::Int64 => 2,
            Self::Float => 3,
            Self::MapGeneric => 8,
            Self::MapStringString => 16,
            Self::MapStringInt64 => 17,
            Self::MapStringFloat => 18,
            Self::MapInt64String => 19,
            Self::MapInt64Int64 => 20,
            Self::MapInt64Float => 21,
            Self::MapFloatString => 22,
            Self::MapFloatInt64 => 23,
            Self::MapFloatFloat => 24,
        }
    }

    /// The key type of a map type.
    pub fn key_type(self) -> Option<DataType> {
        Some(match self {
            Self::MapStringString | Self::MapStringInt64 | Self::MapStringFloat => Self::String,
            Self::MapInt64String | Self::MapInt64Int64 | Self::MapInt64Float => Self::Int64,
            Self::MapFloatString | Self::MapFloatInt64 | Self::MapFloatFloat => Self::Float,
            _ => return None,
        })
    }

    /// The value type of a map type.
    pub fn value_type(self) -> Option<DataType> {
        Some(match self {
            Self::MapStringString | Self::MapInt64String | Self::MapFloatString => Self::String,
            Self::MapStringInt64 | Self::MapInt64Int64 | Self::MapFloatInt64 => Self::Int64,
            Self::MapStringFloat | Self::MapInt64Float | Self::MapFloatFloat => Self::Float,
            _ => return None,
        })
    }

    pub fn is_map(self) -> bool {
        self.key_type().is_some()
    }
}

/// A micro-op action. The full opcode space is decodable for wire stability,
/// but list and set actions are not supported by any attribute type here and
/// always fail with `WrongAction`.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum Action {
    Fail,
    Set,
    StringAppend,
    StringPrepend,
    NumAdd,
    NumSub,
    NumMul,
    NumDiv,
    NumMod,
    NumAnd,
    NumOr,
    NumXor,
    ListLpush,
    ListRpush,
    SetAdd,
    SetRemove,
    SetIntersect,
    SetUnion,
    MapAdd,
    MapRemove,
}

impl Action {
    pub fn from_wire(tag: u8) -> Option<Self> {
        Some(match tag {
            0 => Self::Fail,
            1 => Self::Set,
            2 => Self::StringAppend,
            3 => Self::StringPrepend,
            4 => Self::NumAdd,
            5 => Self::NumSub,
            6 => Self::NumMul,
            7 => Self::NumDiv,
            8 => Self::NumMod,
            9 => Self::NumAnd,
            10 => Self::NumOr,
            11 => Self::NumXor,
            12 => Self::ListLpush,
            13 => Self::ListRpush,
            14 => Self::SetAdd,
            15 => Self::SetRemove,
            16 => Self::SetIntersect,
            17 => Self::SetUnion,
            18 => Self::MapAdd,
            19 => Self::MapRemove,
            _ => return None,
        })
    }

    pub fn to_wire(self) -> u8 {
        match self {
            Self::Fail => 0,
            Self::Set => 1,
            Self::StringAppend => 2,
            Self::StringPrepend => 3,
            Self::NumAdd => 4,
            Self::NumSub => 5,
            Self::NumMul => 6,
            Self::NumDiv => 7,
            Self::NumMod => 8,
            Self::NumAnd => 9,
            Self::NumOr => 10,
            Self::NumXor => 11,
            Self::ListLpush => 12,
            Self::ListRpush => 13,
            Self::SetAdd => 14,
            Self::SetRemove => 15,
            Self::SetIntersect => 16,
            Self::SetUnion => 17,
            Self::MapAdd => 18,
            Self::MapRemove => 19,
        }
    }
}

/// A micro-op failure. The client entry point translates these into wire
/// return codes: `Overflow` becomes OVERFLOW, everything else CMPFAIL.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum MicroError {
    /// An operand or stored value does not decode as its claimed type.
    Malformed,
    /// An operand's datatype does not match the attribute or element type.
    WrongType,
    /// The action is not supported by the attribute's type.
    WrongAction,
    /// Integer arithmetic overflowed, or divided by zero.
    Overflow,
    /// An equality check did not hold.
    CmpFailed,
}

impl std::fmt::Display for MicroError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.write_str(match self {
            Self::Malformed => "malformed",
            Self::WrongType => "wrong type",
            Self::WrongAction => "wrong action",
            Self::Overflow => "overflow",
            Self::CmpFailed => "comparison failed",
        })
    }
}

/// A typed primitive mutation of one attribute. `arg1` is the operand; for
/// map element actions `arg2` addresses the map key.
#[derive(Clone, Debug, PartialEq)]
pub struct MicroOp {
    pub attr: u16,
    pub action: Action,
    pub arg1: Bytes,
    pub arg1_datatype: DataType,
    pub arg2: Bytes,
    pub arg2_datatype: DataType,
}

impl MicroOp {
    /// Encodes the wire form: u16 attr, u8 action, then each argument as a
    /// u32-length-prefixed slice followed by its u16 datatype tag.
    pub fn encode(&self, buf: &mut BytesMut) {
        use bytes::BufMut;
        buf.put_u16_le(self.attr);
        buf.put_u8(self.action.to_wire());
        wire::put_slice(buf, &self.arg1);
        buf.put_u16_le(self.arg1_datatype.to_wire());
        wire::put_slice(buf, &self.arg2);
        buf.put_u16_le(self.arg2_datatype.to_wire());
    }

    /// Decodes the wire form from the front of the buffer.
    pub fn decode(buf: &mut Bytes) -> Result<Self> {
        let attr = wire::get_u16(buf)?;
        let tag = wire::get_u8(buf)?;
        let Some(action) = Action::from_wire(tag) else {
            return errdata!("unknown micro-op action {tag}");
        };
        let arg1 = wire::get_slice(buf)?;
        let tag = wire::get_u16(buf)?;
        let Some(arg1_datatype) = DataType::from_wire(tag) else {
            return errdata!("unknown datatype tag {tag}");
        };
        let arg2 = wire::get_slice(buf)?;
        let tag = wire::get_u16(buf)?;
        let Some(arg2_datatype) = DataType::from_wire(tag) else {
            return errdata!("unknown datatype tag {tag}");
        };
        Ok(Self { attr, action, arg1, arg1_datatype, arg2, arg2_datatype })
    }
}

/// An equality precondition on one attribute (attribute 0 checks the key).
#[derive(Clone, Debug, PartialEq)]
pub struct MicroCheck {
    pub attr: u16,
    pub value: Bytes,
    pub datatype: DataType,
}

impl MicroCheck {
    pub fn encode(&self, buf: &mut BytesMut) {
        use bytes::BufMut;
        buf.put_u16_le(self.attr);
        wire::put_slice(buf, &self.value);
        buf.put_u16_le(self.datatype.to_wire());
    }

    pub fn decode(buf: &mut Bytes) -> Result<Self> {
        let attr = wire::get_u16(buf)?;
        let value = wire::get_slice(buf)?;
        let tag = wire::get_u16(buf)?;
        let Some(datatype) = DataType::from_wire(tag) else {
            return errdata!("unknown datatype tag {tag}");
        };
        Ok(Self { attr, value, datatype })
    }
}

/// Validates a byte slice as a given type. Scalars validate by length; maps
/// validate framing, strict key order, and the absence of trailing bytes.
pub fn validate_as_type(value: &[u8], datatype: DataType) -> bool {
    match datatype {
        DataType::String => true,
        DataType::Int64 | DataType::Float => value.is_empty() || value.len() == 8,
        DataType::MapGeneric => value.is_empty(),
        t => map::validate_map(t, value),
    }
}

/// Applies a batch of micro-ops against one attribute's current value,
/// appending the new encoding to `out`.
fn apply_attribute(
    datatype: DataType,
    old: &[u8],
    ops: &[MicroOp],
    out: &mut Vec<u8>,
) -> std::result::Result<(), MicroError> {
    if datatype.is_map() {
        return map::apply_map(datatype, old, ops, out);
    }
    match scalar::element_ops(datatype) {
        Some(element) => (element.apply)(old, ops, out),
        None => Err(MicroError::WrongType),
    }
}

/// Validates a client's checks against the current object and applies its
/// micro-ops to produce the next value vector. Checks are equality
/// preconditions; ops are applied grouped per attribute, in ascending
/// attribute order (the client's relative order within one attribute is
/// preserved). Attribute 0 is the key and cannot be mutated.
pub fn apply_checks_and_ops(
    schema: &Schema,
    checks: &[MicroCheck],
    ops: &mut [MicroOp],
    key: &[u8],
    old_value: &[Bytes],
) -> std::result::Result<Vec<Bytes>, MicroError> {
    for check in checks {
        let attr = check.attr as usize;
        if attr >= schema.arity() || check.datatype != schema.attrs[attr].datatype {
            return Err(MicroError::CmpFailed);
        }
        let current: &[u8] = match attr {
            0 => key,
            i => old_value.get(i - 1).map(|b| b.as_ref()).unwrap_or(&[]),
        };
        if current != check.value.as_ref() {
            return Err(MicroError::CmpFailed);
        }
    }

    ops.sort_by_key(|op| op.attr);
    if ops.first().is_some_and(|op| op.attr == 0) {
        return Err(MicroError::WrongType);
    }
    if ops.last().is_some_and(|op| op.attr as usize >= schema.arity()) {
        return Err(MicroError::WrongType);
    }

    let mut new_value = Vec::with_capacity(schema.arity() - 1);
    let mut remaining = &ops[..];
    for attr in 1..schema.arity() {
        let count = remaining.iter().take_while(|op| op.attr as usize == attr).count();
        let (run, rest) = remaining.split_at(count);
        remaining = rest;
        let old_attr: &[u8] = old_value.get(attr - 1).map(|b| b.as_ref()).unwrap_or(&[]);
        if run.is_empty() {
            new_value.push(old_value.get(attr - 1).cloned().unwrap_or_default());
        } else {
            let mut out = Vec::new();
            apply_attribute(schema.attrs[attr].datatype, old_attr, run, &mut out)?;
            new_value.push(Bytes::from(out));
        }
    }
    Ok(new_value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Attribute;

    fn op(attr: u16, action: Action, arg1: &[u8], arg1_datatype: DataType) -> MicroOp {
        MicroOp {
            attr,
            action,
            arg1: Bytes::copy_from_slice(arg1),
            arg1_datatype,
            arg2: Bytes::new(),
            arg2_datatype: DataType::String,
        }
    }

    fn schema() -> Schema {
        Schema::new(vec![
            Attribute::new("key", DataType::String),
            Attribute::new("name", DataType::String),
            Attribute::new("count", DataType::Int64),
        ])
    }

    #[test]
    fn microop_wire_roundtrip() -> Result<()> {
        let original = MicroOp {
            attr: 3,
            action: Action::MapAdd,
            arg1: Bytes::copy_from_slice(&7i64.to_le_bytes()),
            arg1_datatype: DataType::Int64,
            arg2: Bytes::from_static(b"k"),
            arg2_datatype: DataType::String,
        };
        let mut buf = BytesMut::new();
        original.encode(&mut buf);
        assert_eq!(MicroOp::decode(&mut buf.freeze())?, original);
        Ok(())
    }

    #[test]
    fn microcheck_wire_roundtrip() -> Result<()> {
        let original =
            MicroCheck { attr: 1, value: Bytes::from_static(b"abc"), datatype: DataType::String };
        let mut buf = BytesMut::new();
        original.encode(&mut buf);
        assert_eq!(MicroCheck::decode(&mut buf.freeze())?, original);
        Ok(())
    }

    #[test]
    fn checks_gate_ops() {
        let schema = schema();
        let old = vec![Bytes::from_static(b"alice"), Bytes::copy_from_slice(&1i64.to_le_bytes())];

        // A passing check lets the op batch through.
        let checks = vec![MicroCheck {
            attr: 1,
            value: Bytes::from_static(b"alice"),
            datatype: DataType::String,
        }];
        let mut ops = vec![op(2, Action::NumAdd, &2i64.to_le_bytes(), DataType::Int64)];
        let new = apply_checks_and_ops(&schema, &checks, &mut ops, b"k", &old).unwrap();
        assert_eq!(new[1], Bytes::copy_from_slice(&3i64.to_le_bytes()));
        assert_eq!(new[0], old[0]);

        // A failing check rejects the whole batch.
        let checks = vec![MicroCheck {
            attr: 1,
            value: Bytes::from_static(b"bob"),
            datatype: DataType::String,
        }];
        let mut ops = vec![op(2, Action::NumAdd, &2i64.to_le_bytes(), DataType::Int64)];
        assert_eq!(
            apply_checks_and_ops(&schema, &checks, &mut ops, b"k", &old),
            Err(MicroError::CmpFailed)
        );
    }

    #[test]
    fn key_attribute_cannot_be_mutated() {
        let schema = schema();
        let mut ops = vec![op(0, Action::Set, b"new", DataType::String)];
        assert_eq!(
            apply_checks_and_ops(&schema, &[], &mut ops, b"k", &[]),
            Err(MicroError::WrongType)
        );
    }

    #[test]
    fn ops_are_grouped_by_attribute() {
        let schema = schema();
        // Out-of-attribute-order batch: the sort groups them, preserving
        // relative order within each attribute.
        let mut ops = vec![
            op(2, Action::Set, &10i64.to_le_bytes(), DataType::Int64),
            op(1, Action::Set, b"a", DataType::String),
            op(2, Action::NumMul, &3i64.to_le_bytes(), DataType::Int64),
            op(1, Action::StringAppend, b"b", DataType::String),
        ];
        let new = apply_checks_and_ops(&schema, &[], &mut ops, b"k", &[]).unwrap();
        assert_eq!(new[0], Bytes::from_static(b"ab"));
        assert_eq!(new[1], Bytes::copy_from_slice(&30i64.to_le_bytes()));
    }

    #[test]
    fn overflow_surfaces_as_overflow() {
        let schema = schema();
        let old = vec![Bytes::from_static(b""), Bytes::copy_from_slice(&i64::MAX.to_le_bytes())];
        let mut ops = vec![op(2, Action::NumAdd, &1i64.to_le_bytes(), DataType::Int64)];
        assert_eq!(
            apply_checks_and_ops(&schema, &[], &mut ops, b"k", &old),
            Err(MicroError::Overflow)
        );
    }

    #[test]
    fn untouched_attributes_pass_through() {
        let schema = schema();
        let old = vec![Bytes::from_static(b"alice"), Bytes::copy_from_slice(&5i64.to_le_bytes())];
        let mut ops = vec![op(1, Action::Set, b"bob", DataType::String)];
        let new = apply_checks_and_ops(&schema, &[], &mut ops, b"k", &old).unwrap();
        assert_eq!(new[0], Bytes::from_static(b"bob"));
        assert_eq!(new[1], old[1]);
    }
}
