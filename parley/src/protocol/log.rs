//! Entries of the assistant's on-disk conversation log.
//!
//! The log is append-only JSONL. A file whose first entry is a `summary` was
//! produced by resuming a condensed earlier conversation.

use chrono::{DateTime, Utc};
use serde::Deserialize;

use super::events::WireMessage;

/// Entry type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogEntryKind {
    User,
    Assistant,
    /// Condensed prior conversation, not a turn.
    Summary,
    #[serde(other)]
    Other,
}

/// One log line.
#[derive(Debug, Clone, Deserialize)]
pub struct LogEntry {
    #[serde(rename = "type")]
    pub kind: LogEntryKind,
    #[serde(default)]
    pub message: Option<WireMessage>,
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(rename = "sessionId")]
    pub session_id: Option<String>,
    pub uuid: Option<String>,
}

impl LogEntry {
    /// Parse one log line. Blank lines yield `Ok(None)`.
    pub fn parse(line: &str) -> Result<Option<Self>, serde_json::Error> {
        let line = line.trim();
        if line.is_empty() {
            return Ok(None);
        }
        serde_json::from_str(line).map(Some)
    }
}
