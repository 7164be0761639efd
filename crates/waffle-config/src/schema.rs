//! Schema registry and the reserved-key filter.
//!
//! # Design
//! - The registry is supplied by the host and never mutated by the core.
//! - Defaults are conformed to their declared type when the registry is built.

use std::collections::{BTreeMap, BTreeSet};

use serde_json::{Map, Value};

use crate::error::{ConfigError, ConfigResult};
use crate::kind::ConfigType;

/// Prefix marking keys that belong to the overlay itself.
pub const DEFAULT_RESERVED_PREFIX: &str = "WAFFLE_";

/// Declared configuration variable.
#[derive(Debug, Clone, PartialEq)]
pub struct SchemaEntry {
    /// Variable name.
    pub key: String,
    /// Declared value type.
    pub kind: ConfigType,
    /// Human-readable description shown next to the form field.
    pub description: String,
    /// Value seeded into the store when no record exists.
    pub default: Value,
}

impl SchemaEntry {
    /// Build an entry, conforming `default` to `kind`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidValue`] when the default does not fit the type.
    pub fn new(
        key: impl Into<String>,
        kind: ConfigType,
        description: impl Into<String>,
        default: Value,
    ) -> ConfigResult<Self> {
        let key = key.into();
        let default = kind.coerce(&key, default)?;
        Ok(Self {
            key,
            kind,
            description: description.into(),
            default,
        })
    }

    fn from_declaration(key: &str, declaration: &Value) -> ConfigResult<Self> {
        let Value::Object(fields) = declaration else {
            return Err(ConfigError::InvalidSchema {
                key: key.to_string(),
                reason: "declaration must be an object",
            });
        };
        let tag = fields
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| ConfigError::InvalidSchema {
                key: key.to_string(),
                reason: "missing type tag",
            })?;
        let kind = tag
            .parse::<ConfigType>()
            .map_err(|value| ConfigError::UnknownType {
                key: key.to_string(),
                value,
            })?;
        let description = fields
            .get("desc")
            .or_else(|| fields.get("description"))
            .and_then(Value::as_str)
            .unwrap_or_default();
        let default = fields.get("default").cloned().unwrap_or(Value::Null);
        Self::new(key, kind, description, default)
    }
}

/// Read-only map of declared variables keyed by name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SchemaRegistry {
    entries: BTreeMap<String, SchemaEntry>,
}

impl SchemaRegistry {
    /// Build a registry from already-validated entries.
    #[must_use]
    pub fn new(entries: impl IntoIterator<Item = SchemaEntry>) -> Self {
        Self {
            entries: entries
                .into_iter()
                .map(|entry| (entry.key.clone(), entry))
                .collect(),
        }
    }

    /// Build a registry from a `{KEY: {type, desc, default}}` document.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::UnknownType`] for unsupported type tags and
    /// [`ConfigError::InvalidSchema`] for malformed declarations.
    pub fn from_value(document: &Value) -> ConfigResult<Self> {
        let Value::Object(declarations) = document else {
            return Err(ConfigError::InvalidSchema {
                key: String::new(),
                reason: "schema document must be an object",
            });
        };
        Self::from_map(declarations)
    }

    /// Parse a JSON schema document.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::SchemaDocument`] when the text is not JSON, plus the
    /// errors of [`SchemaRegistry::from_value`].
    pub fn from_json_str(text: &str) -> ConfigResult<Self> {
        let document: Value =
            serde_json::from_str(text).map_err(|source| ConfigError::SchemaDocument { source })?;
        Self::from_value(&document)
    }

    fn from_map(declarations: &Map<String, Value>) -> ConfigResult<Self> {
        let mut entries = BTreeMap::new();
        for (key, declaration) in declarations {
            let entry = SchemaEntry::from_declaration(key, declaration)?;
            entries.insert(key.clone(), entry);
        }
        Ok(Self { entries })
    }

    /// Look up a declared variable.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&SchemaEntry> {
        self.entries.get(key)
    }

    /// Whether `key` is declared.
    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Declared names in sorted order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Declared entries in key order.
    pub fn iter(&self) -> impl Iterator<Item = &SchemaEntry> {
        self.entries.values()
    }

    /// Number of declared variables.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is declared.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Decides which declared keys are user-editable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyFilter {
    reserved_prefix: String,
    excluded: BTreeSet<String>,
}

impl Default for KeyFilter {
    fn default() -> Self {
        Self::new(DEFAULT_RESERVED_PREFIX)
    }
}

impl KeyFilter {
    /// Filter reserving every key that starts with `prefix`.
    ///
    /// An empty prefix reserves nothing.
    #[must_use]
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            reserved_prefix: prefix.into(),
            excluded: BTreeSet::new(),
        }
    }

    /// Additionally reserve an exact key.
    #[must_use]
    pub fn exclude(mut self, key: impl Into<String>) -> Self {
        self.excluded.insert(key.into());
        self
    }

    /// Configured reserved prefix.
    #[must_use]
    pub fn reserved_prefix(&self) -> &str {
        &self.reserved_prefix
    }

    /// Whether `key` is owned by the overlay and must not be edited.
    #[must_use]
    pub fn is_reserved(&self, key: &str) -> bool {
        (!self.reserved_prefix.is_empty() && key.starts_with(&self.reserved_prefix))
            || self.excluded.contains(key)
    }
}
