//! Scalar element operations: the step/validate/compare/write/apply quintet
//! for strings, 64-bit integers, and 64-bit floats. Container engines compose
//! these per element; the attribute apply path uses the same `apply`
//! functions directly, which is what keeps top-level and in-map semantics
//! identical.
//!
//! Element encodings (map context): strings are u32-length-prefixed, ints and
//! floats are 8 bytes little-endian. Top-level string attributes omit the
//! prefix since the attribute vector already frames them; `step` and `write`
//! only ever see map context. An empty int or float slice reads as zero and
//! is normalized to its 8-byte form on write.

use super::{Action, DataType, MicroError, MicroOp};

use std::cmp::Ordering;

/// Per-element-type operations.
///
/// - `step` walks one encoded element off the front of a cursor, returning
///   its decoded form, or None on truncation.
/// - `validate` checks a decoded element.
/// - `compare` orders decoded elements by the type's comparator.
/// - `write` appends the canonical encoding of a decoded element.
/// - `apply` runs a batch of scalar micro-ops against a decoded value.
pub struct ElementOps {
    pub step: for<'a> fn(&mut &'a [u8]) -> Option<&'a [u8]>,
    pub validate: fn(&[u8]) -> bool,
    pub compare: fn(&[u8], &[u8]) -> Ordering,
    pub write: fn(&mut Vec<u8>, &[u8]),
    pub apply: fn(&[u8], &[MicroOp], &mut Vec<u8>) -> Result<(), MicroError>,
}

static STRING: ElementOps = ElementOps {
    step: step_string,
    validate: validate_string,
    compare: compare_string,
    write: write_string,
    apply: apply_string,
};

static INT64: ElementOps = ElementOps {
    step: step_int64,
    validate: validate_int64,
    compare: compare_int64,
    write: write_int64,
    apply: apply_int64,
};

static FLOAT: ElementOps = ElementOps {
    step: step_float,
    validate: validate_float,
    compare: compare_float,
    write: write_float,
    apply: apply_float,
};

/// Looks up the element operations for a scalar type.
pub fn element_ops(datatype: DataType) -> Option<&'static ElementOps> {
    match datatype {
        DataType::String => Some(&STRING),
        DataType::Int64 => Some(&INT64),
        DataType::Float => Some(&FLOAT),
        _ => None,
    }
}

fn step_string<'a>(input: &mut &'a [u8]) -> Option<&'a [u8]> {
    if input.len() < 4 {
        return None;
    }
    let len = u32::from_le_bytes(input[..4].try_into().expect("4-byte slice")) as usize;
    if input.len() - 4 < len {
        return None;
    }
    let elem = &input[4..4 + len];
    *input = &input[4 + len..];
    Some(elem)
}

fn step_fixed8<'a>(input: &mut &'a [u8]) -> Option<&'a [u8]> {
    if input.len() < 8 {
        return None;
    }
    let (elem, rest) = input.split_at(8);
    *input = rest;
    Some(elem)
}

fn step_int64<'a>(input: &mut &'a [u8]) -> Option<&'a [u8]> {
    step_fixed8(input)
}

fn step_float<'a>(input: &mut &'a [u8]) -> Option<&'a [u8]> {
    step_fixed8(input)
}

fn validate_string(_elem: &[u8]) -> bool {
    true
}

fn validate_int64(elem: &[u8]) -> bool {
    elem.is_empty() || elem.len() == 8
}

fn validate_float(elem: &[u8]) -> bool {
    elem.is_empty() || elem.len() == 8
}

/// Decodes an int64, treating the empty slice as zero.
fn decode_int64(elem: &[u8]) -> Option<i64> {
    match elem.len() {
        0 => Some(0),
        8 => Some(i64::from_le_bytes(elem.try_into().expect("8-byte slice"))),
        _ => None,
    }
}

/// Decodes a float, treating the empty slice as zero.
fn decode_float(elem: &[u8]) -> Option<f64> {
    match elem.len() {
        0 => Some(0.0),
        8 => Some(f64::from_le_bytes(elem.try_into().expect("8-byte slice"))),
        _ => None,
    }
}

fn compare_string(lhs: &[u8], rhs: &[u8]) -> Ordering {
    lhs.cmp(rhs)
}

fn compare_int64(lhs: &[u8], rhs: &[u8]) -> Ordering {
    decode_int64(lhs).unwrap_or(0).cmp(&decode_int64(rhs).unwrap_or(0))
}

fn compare_float(lhs: &[u8], rhs: &[u8]) -> Ordering {
    decode_float(lhs).unwrap_or(0.0).total_cmp(&decode_float(rhs).unwrap_or(0.0))
}

fn write_string(out: &mut Vec<u8>, elem: &[u8]) {
    out.extend_from_slice(&(elem.len() as u32).to_le_bytes());
    out.extend_from_slice(elem);
}

fn write_int64(out: &mut Vec<u8>, elem: &[u8]) {
    out.extend_from_slice(&decode_int64(elem).unwrap_or(0).to_le_bytes());
}

fn write_float(out: &mut Vec<u8>, elem: &[u8]) {
    out.extend_from_slice(&decode_float(elem).unwrap_or(0.0).to_le_bytes());
}

fn apply_string(old: &[u8], ops: &[MicroOp], out: &mut Vec<u8>) -> Result<(), MicroError> {
    let mut value = old.to_vec();
    for op in ops {
        if op.arg1_datatype != DataType::String {
            return Err(MicroError::WrongType);
        }
        match op.action {
            Action::Set => {
                value.clear();
                value.extend_from_slice(&op.arg1);
            }
            Action::StringAppend => value.extend_from_slice(&op.arg1),
            Action::StringPrepend => {
                let mut prepended = op.arg1.to_vec();
                prepended.extend_from_slice(&value);
                value = prepended;
            }
            _ => return Err(MicroError::WrongAction),
        }
    }
    out.extend_from_slice(&value);
    Ok(())
}

fn apply_int64(old: &[u8], ops: &[MicroOp], out: &mut Vec<u8>) -> Result<(), MicroError> {
    let mut value = decode_int64(old).ok_or(MicroError::Malformed)?;
    for op in ops {
        if op.arg1_datatype != DataType::Int64 {
            return Err(MicroError::WrongType);
        }
        let arg = decode_int64(&op.arg1).ok_or(MicroError::Malformed)?;
        value = match op.action {
            Action::Set => arg,
            Action::NumAdd => value.checked_add(arg).ok_or(MicroError::Overflow)?,
            Action::NumSub => value.checked_sub(arg).ok_or(MicroError::Overflow)?,
            Action::NumMul => value.checked_mul(arg).ok_or(MicroError::Overflow)?,
            // checked_div/rem also fail on a zero divisor.
            Action::NumDiv => value.checked_div(arg).ok_or(MicroError::Overflow)?,
            Action::NumMod => value.checked_rem(arg).ok_or(MicroError::Overflow)?,
            Action::NumAnd => value & arg,
            Action::NumOr => value | arg,
            Action::NumXor => value ^ arg,
            _ => return Err(MicroError::WrongAction),
        };
    }
    out.extend_from_slice(&value.to_le_bytes());
    Ok(())
}

fn apply_float(old: &[u8], ops: &[MicroOp], out: &mut Vec<u8>) -> Result<(), MicroError> {
    let mut value = decode_float(old).ok_or(MicroError::Malformed)?;
    for op in ops {
        if op.arg1_datatype != DataType::Float {
            return Err(MicroError::WrongType);
        }
        let arg = decode_float(&op.arg1).ok_or(MicroError::Malformed)?;
        value = match op.action {
            Action::Set => arg,
            Action::NumAdd => value + arg,
            Action::NumSub => value - arg,
            Action::NumMul => value * arg,
            Action::NumDiv => value / arg,
            _ => return Err(MicroError::WrongAction),
        };
    }
    out.extend_from_slice(&value.to_le_bytes());
    Ok(())
}
