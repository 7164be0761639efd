//! Declared value types and the conversions tied to each of them.

use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Number, Value};

use crate::codec;
use crate::error::{ConfigError, ConfigResult};

/// Closed set of value types a schema entry may declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfigType {
    /// Free-form text.
    Str,
    /// Signed 64-bit integer.
    Int,
    /// Double-precision float.
    Float,
    /// Boolean flag.
    Bool,
    /// Arbitrary JSON document.
    Json,
}

impl ConfigType {
    /// Tag used in schema documents.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Str => "str",
            Self::Int => "int",
            Self::Float => "float",
            Self::Bool => "bool",
            Self::Json => "json",
        }
    }

    /// Convert raw form input into a typed value.
    ///
    /// Malformed JSON yields `null` rather than an error.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidValue`] when numeric input does not parse.
    pub fn parse_raw(self, key: &str, raw: &str) -> ConfigResult<Value> {
        match self {
            Self::Str => Ok(Value::String(raw.to_string())),
            Self::Int => raw
                .trim()
                .parse::<i64>()
                .map(Value::from)
                .map_err(|_| ConfigError::invalid_value(key, self, raw)),
            Self::Float => raw
                .trim()
                .parse::<f64>()
                .ok()
                .and_then(Number::from_f64)
                .map(Value::Number)
                .ok_or_else(|| ConfigError::invalid_value(key, self, raw)),
            Self::Bool => Ok(Value::Bool(parse_flag(raw))),
            Self::Json => Ok(codec::deserialize(raw).unwrap_or(Value::Null)),
        }
    }

    /// Conform an update value to this type.
    ///
    /// Strings are treated as raw input for every non-text type.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidValue`] when the value has the wrong shape.
    pub fn coerce(self, key: &str, value: Value) -> ConfigResult<Value> {
        match (self, value) {
            (Self::Json, Value::String(raw)) => self.parse_raw(key, &raw),
            (Self::Json, other) => Ok(other),
            (Self::Str, Value::String(text)) => Ok(Value::String(text)),
            (Self::Str, Value::Null) => Ok(Value::String(String::new())),
            (Self::Str, Value::Number(number)) => Ok(Value::String(number.to_string())),
            (Self::Str, Value::Bool(flag)) => Ok(Value::String(flag.to_string())),
            (_, Value::String(raw)) => self.parse_raw(key, &raw),
            (Self::Int, Value::Number(number)) => number
                .as_i64()
                .or_else(|| integral_float(&number))
                .map(Value::from)
                .ok_or_else(|| ConfigError::invalid_value(key, self, number.to_string())),
            (Self::Float, Value::Number(number)) => number
                .as_f64()
                .and_then(Number::from_f64)
                .map(Value::Number)
                .ok_or_else(|| ConfigError::invalid_value(key, self, number.to_string())),
            (Self::Bool, Value::Bool(flag)) => Ok(Value::Bool(flag)),
            (Self::Bool, Value::Number(number)) => Ok(Value::Bool(number.as_f64() != Some(0.0))),
            (_, other) => Err(ConfigError::invalid_value(key, self, other.to_string())),
        }
    }

    /// Decode a stored payload for a key of this type.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Codec`] for malformed payloads of non-JSON types and
    /// [`ConfigError::InvalidValue`] when the decoded value has the wrong shape.
    pub fn decode_stored(self, key: &str, payload: &str) -> ConfigResult<Value> {
        match (self, codec::deserialize(payload)) {
            (Self::Json, Ok(value)) => Ok(value),
            (Self::Json, Err(_)) => Ok(Value::Null),
            (_, Ok(value)) => self.coerce(key, value),
            (_, Err(source)) => Err(ConfigError::codec(key, source)),
        }
    }

    /// Text shown in the editing form.
    #[must_use]
    pub fn render(self, value: &Value) -> String {
        match (self, value) {
            (Self::Str, Value::String(text)) => text.clone(),
            (Self::Json, other) => other.to_string(),
            (_, Value::String(text)) => text.clone(),
            (_, Value::Null) => String::new(),
            (_, other) => other.to_string(),
        }
    }
}

impl Display for ConfigType {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> fmt::Result {
        formatter.write_str(self.as_str())
    }
}

impl FromStr for ConfigType {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "str" | "string" => Ok(Self::Str),
            "int" | "integer" => Ok(Self::Int),
            "float" => Ok(Self::Float),
            "bool" | "boolean" => Ok(Self::Bool),
            "json" => Ok(Self::Json),
            other => Err(other.to_string()),
        }
    }
}

/// Interpret a textual flag; `0`, `false`, `off`, `no` and empty input are false.
#[must_use]
pub fn parse_flag(raw: &str) -> bool {
    !matches!(
        raw.trim().to_ascii_lowercase().as_str(),
        "" | "0" | "false" | "off" | "no"
    )
}

#[allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]
fn integral_float(number: &Number) -> Option<i64> {
    let value = number.as_f64()?;
    (value.fract() == 0.0 && value.abs() < i64::MAX as f64).then_some(value as i64)
}
