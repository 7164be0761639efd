//! Storage encoding for configuration values.
//!
//! Payloads are JSON text, so every stored string describes its own shape and
//! decoding needs no type hint.

use serde_json::Value;

use crate::error::CodecError;

/// Encode a value into its stored representation.
///
/// # Errors
///
/// Returns [`CodecError::Encode`] if the value cannot be represented as JSON.
pub fn serialize(value: &Value) -> Result<String, CodecError> {
    serde_json::to_string(value).map_err(|source| CodecError::Encode { source })
}

/// Decode a stored payload back into a value.
///
/// # Errors
///
/// Returns [`CodecError::Decode`] when the payload is not valid JSON.
pub fn deserialize(payload: &str) -> Result<Value, CodecError> {
    serde_json::from_str(payload).map_err(|source| CodecError::Decode { source })
}
