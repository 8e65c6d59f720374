use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::record::RecordBody;
use crate::SyncError;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EngineConfig {
    pub config_version: u32,
    /// Intents allowed to wait behind one in-flight mutation key.
    pub max_queued_per_key: usize,
    pub max_comment_chars: usize,
    /// Accepted reaction emojis. Empty accepts any non-blank emoji.
    pub reaction_palette: Vec<String>,
    pub feed_poll_limit: usize,
}

impl EngineConfig {
    #[must_use]
    pub fn v1() -> Self {
        Self {
            config_version: 1,
            max_queued_per_key: 8,
            max_comment_chars: 500,
            reaction_palette: ["❤️", "👍", "😂", "🎉", "😍", "🔥"]
                .iter()
                .map(ToString::to_string)
                .collect(),
            feed_poll_limit: 256,
        }
    }

    /// Validates numeric bounds and the palette.
    ///
    /// # Errors
    /// Returns [`SyncError::Configuration`] when a field is out of bounds.
    pub fn validate(&self) -> Result<(), SyncError> {
        if self.config_version == 0 {
            return Err(SyncError::Configuration(
                "config_version MUST be >= 1".to_string(),
            ));
        }

        for (name, value) in [
            ("max_queued_per_key", self.max_queued_per_key),
            ("max_comment_chars", self.max_comment_chars),
            ("feed_poll_limit", self.feed_poll_limit),
        ] {
            if value == 0 {
                return Err(SyncError::Configuration(format!("{name} MUST be >= 1")));
            }
        }

        if self
            .reaction_palette
            .iter()
            .any(|emoji| emoji.trim().is_empty())
        {
            return Err(SyncError::Configuration(
                "reaction_palette entries MUST be non-empty".to_string(),
            ));
        }

        Ok(())
    }

    /// Decodes and validates a config from JSON.
    ///
    /// # Errors
    /// Returns [`SyncError::Configuration`] when decoding fails or decoded
    /// values violate config constraints.
    pub fn from_json(value: &Value) -> Result<Self, SyncError> {
        let config: Self = serde_json::from_value(value.clone()).map_err(|err| {
            SyncError::Configuration(format!("invalid engine config JSON payload: {err}"))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Normalizes a record body and checks it against configured limits.
    ///
    /// # Errors
    /// Returns [`SyncError::Validation`] for blank or oversized comments and
    /// for emojis outside the palette.
    pub fn normalize_body(&self, body: RecordBody) -> Result<RecordBody, SyncError> {
        match body {
            RecordBody::Reaction { emoji } => {
                let emoji = emoji.trim();
                if emoji.is_empty() {
                    return Err(SyncError::Validation(
                        "reaction emoji MUST be non-empty".to_string(),
                    ));
                }
                if !self.reaction_palette.is_empty()
                    && !self.reaction_palette.iter().any(|entry| entry == emoji)
                {
                    return Err(SyncError::Validation(format!(
                        "reaction emoji {emoji} is not in the configured palette"
                    )));
                }
                Ok(RecordBody::Reaction {
                    emoji: emoji.to_string(),
                })
            }
            RecordBody::Comment { text } => {
                let text = text.trim();
                if text.is_empty() {
                    return Err(SyncError::Validation(
                        "comment text MUST be non-empty".to_string(),
                    ));
                }
                if text.chars().count() > self.max_comment_chars {
                    return Err(SyncError::Validation(format!(
                        "comment text MUST be at most {} characters",
                        self.max_comment_chars
                    )));
                }
                Ok(RecordBody::Comment {
                    text: text.to_string(),
                })
            }
            vote @ RecordBody::Vote { .. } => Ok(vote),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::v1()
    }
}
