// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Value-only payload boundary.
//!
//! Nothing with identity crosses between the dispatcher and a worker: no
//! handles, no closures, no live references. Payloads are converted to plain
//! JSON values here, before anything is sent, so that a non-value argument
//! fails fast on the caller's side with a clear error instead of surfacing as
//! a confusing failure inside a worker.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

/// Maximum nesting depth accepted for a payload.
///
/// JSON values cannot be cyclic, but unbounded nesting would let a caller
/// blow the stack of whichever side deserializes the payload next.
pub const MAX_VALUE_DEPTH: usize = 64;

/// Errors raised at the value boundary.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("payload is not a plain value: {0}")]
    NotAValue(String),

    #[error("payload nesting exceeds {MAX_VALUE_DEPTH} levels")]
    TooDeep,

    #[error("payload does not match the expected shape: {0}")]
    Shape(String),
}

/// Convert a payload into its wire form, rejecting non-value data.
pub fn to_wire_value<T: Serialize>(payload: &T) -> Result<Value, CodecError> {
    let value = serde_json::to_value(payload).map_err(|e| CodecError::NotAValue(e.to_string()))?;
    check_depth(&value, 0)?;
    Ok(value)
}

/// Decode a wire value into a typed payload.
pub fn from_wire_value<T: DeserializeOwned>(value: Value) -> Result<T, CodecError> {
    serde_json::from_value(value).map_err(|e| CodecError::Shape(e.to_string()))
}

fn check_depth(value: &Value, depth: usize) -> Result<(), CodecError> {
    if depth > MAX_VALUE_DEPTH {
        return Err(CodecError::TooDeep);
    }
    match value {
        Value::Array(items) => {
            for item in items {
                check_depth(item, depth + 1)?;
            }
        }
        Value::Object(fields) => {
            for field in fields.values() {
                check_depth(field, depth + 1)?;
            }
        }
        _ => {}
    }
    Ok(())
}
