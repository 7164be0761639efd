//! Editing-form adapter: renders editable keys and applies posted raw strings.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ConfigResult;
use crate::kind::ConfigType;
use crate::state::{LiveConfig, WaffleState};

/// One row of the editing form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenderedEntry {
    /// Variable name.
    pub key: String,
    /// Declared type tag.
    #[serde(rename = "type")]
    pub kind: ConfigType,
    /// Description shown next to the field.
    pub desc: String,
    /// Current value rendered as text.
    pub value: String,
}

impl WaffleState {
    /// Render every editable key; keys missing from the live configuration
    /// render as an empty string.
    pub async fn render(&self) -> Vec<RenderedEntry> {
        let live = self.live().await;
        self.editable_entries()
            .map(|entry| RenderedEntry {
                key: entry.key.clone(),
                kind: entry.kind,
                desc: entry.description.clone(),
                value: live
                    .get(&entry.key)
                    .map(|value| entry.kind.render(value))
                    .unwrap_or_default(),
            })
            .collect()
    }

    /// Apply posted raw strings, keeping only values that differ from the live
    /// configuration, then render the refreshed form.
    ///
    /// Returns the applied values alongside the refreshed rows.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidValue`](crate::ConfigError::InvalidValue) for
    /// unparsable input and any [`WaffleState::update_db`] failure.
    pub async fn apply_form(
        &self,
        raw: BTreeMap<String, String>,
    ) -> ConfigResult<(LiveConfig, Vec<RenderedEntry>)> {
        let live = self.live().await;
        let mut changed = BTreeMap::<String, Value>::new();
        for (key, text) in raw {
            if self.key_filter().is_reserved(&key) {
                continue;
            }
            let Some(entry) = self.schema().get(&key) else {
                continue;
            };
            let value = entry.kind.parse_raw(&key, &text)?;
            if live.get(&key) != Some(&value) {
                changed.insert(key, value);
            }
        }
        let applied = self.update_db(changed).await?;
        Ok((applied, self.render().await))
    }
}
