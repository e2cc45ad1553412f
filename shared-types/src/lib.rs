use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Metadata describing a single stored key.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct KeyInfo {
    /// Physical key, including the storage prefix.
    pub key: String,
    pub modified: DateTime<Utc>,
    pub size: u64,
    /// Object stores have no directory objects, so every existing key is terminal.
    pub is_terminal: bool,
}

impl KeyInfo {
    pub fn new(key: impl Into<String>, modified: DateTime<Utc>, size: u64) -> Self {
        Self {
            key: key.into(),
            modified,
            size,
            is_terminal: true,
        }
    }
}

impl fmt::Display for KeyInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({} bytes, modified {})",
            self.key,
            self.size,
            self.modified.to_rfc3339()
        )
    }
}
