//! MessagePack wire encoding.
//!
//! Every payload on a channel is a MessagePack map keyed by field name
//! (`rmp_serde::to_vec_named`), so any producer able to write a MessagePack
//! map can feed the pipeline. Control payloads are a single-entry map under
//! [`CONTROL_KEY`], which no task field uses.

use std::collections::BTreeMap;

use serde_json::Value;

use crate::error::CodecError;
use crate::message::{ControlMessage, Envelope, TaskMessage, CONTROL_KEY};

/// Default per-message size limit (1 MiB), matching common broker defaults.
pub const DEFAULT_MAX_MESSAGE_BYTES: usize = 1_048_576;

/// Encodes an envelope, rejecting payloads larger than `limit` bytes.
///
/// # Errors
///
/// - [`CodecError::Encode`] if serialization fails.
/// - [`CodecError::TooLarge`] if the encoded payload exceeds `limit`.
///
/// # Examples
///
/// ```
/// use flowtrace::codec::{decode, encode, DEFAULT_MAX_MESSAGE_BYTES};
/// use flowtrace::{Envelope, TaskMessage};
///
/// let env = Envelope::Task(TaskMessage::new("t-1"));
/// let bytes = encode(&env, DEFAULT_MAX_MESSAGE_BYTES).unwrap();
/// assert_eq!(decode(&bytes).unwrap(), env);
/// ```
pub fn encode(envelope: &Envelope, limit: usize) -> Result<Vec<u8>, CodecError> {
    let bytes = match envelope {
        Envelope::Task(message) => rmp_serde::to_vec_named(message)?,
        Envelope::Control(control) => {
            let mut map = BTreeMap::new();
            map.insert(CONTROL_KEY, control);
            rmp_serde::to_vec_named(&map)?
        },
    };
    if bytes.len() > limit {
        return Err(CodecError::TooLarge {
            size: bytes.len(),
            limit,
        });
    }
    Ok(bytes)
}

/// Decodes a payload into a task or control envelope.
///
/// # Errors
///
/// - [`CodecError::Decode`] if the bytes are not valid MessagePack.
/// - [`CodecError::Shape`] if the payload is not a map, or a declared field
///   has the wrong type for [`TaskMessage`]. Undeclared top-level keys are
///   kept in [`TaskMessage::extra`].
pub fn decode(bytes: &[u8]) -> Result<Envelope, CodecError> {
    let value: Value = rmp_serde::from_slice(bytes)?;
    let mut map = match value {
        Value::Object(map) => map,
        other => {
            return Err(CodecError::Shape(format!(
                "expected a map, found {}",
                type_name(&other)
            )))
        },
    };

    if map.len() == 1 {
        if let Some(control) = map.remove(CONTROL_KEY) {
            let control: ControlMessage = serde_json::from_value(control)
                .map_err(|e| CodecError::Shape(format!("bad control payload: {e}")))?;
            return Ok(Envelope::Control(control));
        }
    }

    let message: TaskMessage = serde_json::from_value(Value::Object(map))
        .map_err(|e| CodecError::Shape(e.to_string()))?;
    Ok(Envelope::Task(message))
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "nil",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "map",
    }
}
