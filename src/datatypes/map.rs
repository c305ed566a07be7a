//! The map micro-operation engine.
//!
//! A map-typed attribute's byte form is a concatenation of (key, value)
//! element pairs strictly sorted by the key type's comparator. Applying a
//! batch decodes the pairs into working storage, runs each op against it, and
//! re-emits the surviving entries in canonical sorted order, so a valid input
//! always produces a valid, byte-deterministic output.

use super::scalar::{element_ops, ElementOps};
use super::{Action, DataType, MicroError, MicroOp};

use itertools::Itertools as _;
use std::cmp::Ordering;
use std::collections::HashMap;

/// The element operations for a map type's key and value.
fn pair_ops(container: DataType) -> Option<(&'static ElementOps, &'static ElementOps)> {
    let key = element_ops(container.key_type()?)?;
    let value = element_ops(container.value_type()?)?;
    Some((key, value))
}

/// Validates a map encoding: every pair must decode, keys must be strictly
/// increasing, and no bytes may trail the last pair.
pub fn validate_map(container: DataType, map: &[u8]) -> bool {
    let Some((key_ops, value_ops)) = pair_ops(container) else {
        return false;
    };
    let mut rest = map;
    let mut prev: Option<&[u8]> = None;
    while !rest.is_empty() {
        let Some(key) = (key_ops.step)(&mut rest) else {
            return false;
        };
        if (value_ops.step)(&mut rest).is_none() {
            return false;
        }
        if let Some(prev) = prev {
            if (key_ops.compare)(prev, key) != Ordering::Less {
                return false;
            }
        }
        prev = Some(key);
    }
    true
}

/// Decodes map pairs into working storage. Ordering is not enforced here,
/// since SET operands arrive unsorted and stored values were validated at
/// write time. On a duplicate key the first occurrence wins.
fn decode_into(
    key_ops: &ElementOps,
    value_ops: &ElementOps,
    mut rest: &[u8],
    map: &mut HashMap<Vec<u8>, Vec<u8>>,
) -> Result<(), MicroError> {
    while !rest.is_empty() {
        let key = (key_ops.step)(&mut rest).ok_or(MicroError::Malformed)?;
        let value = (value_ops.step)(&mut rest).ok_or(MicroError::Malformed)?;
        map.entry(key.to_vec()).or_insert_with(|| value.to_vec());
    }
    Ok(())
}

/// Applies a batch of micro-ops to a map attribute, appending the canonical
/// re-encoding to `out`.
pub fn apply_map(
    container: DataType,
    old: &[u8],
    ops: &[MicroOp],
    out: &mut Vec<u8>,
) -> Result<(), MicroError> {
    let (key_ops, value_ops) = pair_ops(container).ok_or(MicroError::WrongType)?;
    let key_type = container.key_type().ok_or(MicroError::WrongType)?;
    let value_type = container.value_type().ok_or(MicroError::WrongType)?;

    let mut map = HashMap::new();
    decode_into(key_ops, value_ops, old, &mut map)?;

    for op in ops {
        match op.action {
            Action::Set => {
                // The empty generic-map literal clears regardless of the
                // container's concrete type.
                if op.arg1_datatype == DataType::MapGeneric {
                    if !op.arg1.is_empty() {
                        return Err(MicroError::Malformed);
                    }
                    map.clear();
                    continue;
                }
                if op.arg1_datatype != container {
                    return Err(MicroError::WrongType);
                }
                map.clear();
                decode_into(key_ops, value_ops, &op.arg1, &mut map)?;
            }
            Action::MapAdd => {
                check_element(key_ops, key_type, &op.arg2, op.arg2_datatype)?;
                check_element(value_ops, value_type, &op.arg1, op.arg1_datatype)?;
                map.insert(op.arg2.to_vec(), op.arg1.to_vec());
            }
            Action::MapRemove => {
                check_element(key_ops, key_type, &op.arg2, op.arg2_datatype)?;
                map.remove(op.arg2.as_ref());
            }
            Action::StringAppend
            | Action::StringPrepend
            | Action::NumAdd
            | Action::NumSub
            | Action::NumMul
            | Action::NumDiv
            | Action::NumMod
            | Action::NumAnd
            | Action::NumOr
            | Action::NumXor => {
                check_element(key_ops, key_type, &op.arg2, op.arg2_datatype)?;
                // A missing entry behaves as the value type's zero, so
                // arithmetic against an absent key inserts a fresh entry.
                let entry = map.get(op.arg2.as_ref()).cloned().unwrap_or_default();
                let mut scratch = Vec::new();
                (value_ops.apply)(&entry, std::slice::from_ref(op), &mut scratch)?;
                map.insert(op.arg2.to_vec(), scratch);
            }
            _ => return Err(MicroError::WrongAction),
        }
    }

    for (key, value) in map.into_iter().sorted_by(|(a, _), (b, _)| (key_ops.compare)(a, b)) {
        (key_ops.write)(out, &key);
        (value_ops.write)(out, &value);
    }
    Ok(())
}

/// Type-checks and validates one element operand.
fn check_element(
    ops: &ElementOps,
    expected: DataType,
    elem: &[u8],
    datatype: DataType,
) -> Result<(), MicroError> {
    if datatype != expected {
        return Err(MicroError::WrongType);
    }
    if !(ops.validate)(elem) {
        return Err(MicroError::Malformed);
    }
    Ok(())
}
