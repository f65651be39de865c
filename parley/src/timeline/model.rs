//! Session and timeline types.

use std::collections::HashMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use crate::protocol::Usage;

/// Lifecycle of a session's backing process slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Creating,
    Starting,
    Ready,
    Error,
    Closed,
}

impl SessionStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Creating => "creating",
            Self::Starting => "starting",
            Self::Ready => "ready",
            Self::Error => "error",
            Self::Closed => "closed",
        }
    }

    /// Whether a message may be sent. `Error` is admitted so a failed
    /// invocation can be retried.
    pub const fn accepts_messages(self) -> bool {
        matches!(self, Self::Ready | Self::Error)
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-turn progress derived from the event stream, for display.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnStatus {
    Initializing,
    Processing,
    Completed,
    Error,
}

impl TurnStatus {
    /// Move to `next` unless that would fall back to `Initializing` once the
    /// turn has started.
    #[must_use]
    pub fn advance(self, next: Self) -> Self {
        if next == Self::Initializing && self != Self::Initializing {
            self
        } else {
            next
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Initializing => "initializing",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Error => "error",
        }
    }
}

impl std::fmt::Display for TurnStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of a tool call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolStatus {
    Pending,
    Running,
    Completed,
    Error,
}

/// A tool call issued by the assistant, tracked until its result arrives or
/// the invocation ends.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolCallState {
    pub id: String,
    pub name: String,
    pub input: Value,
    pub status: ToolStatus,
    pub result: Option<String>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl ToolCallState {
    pub fn running(id: String, name: String, input: Value) -> Self {
        Self {
            id,
            name,
            input,
            status: ToolStatus::Running,
            result: None,
            started_at: Utc::now(),
            ended_at: None,
        }
    }

    /// Wall time between start and end, once ended.
    pub fn duration_ms(&self) -> Option<i64> {
        self.ended_at
            .map(|end| (end - self.started_at).num_milliseconds())
    }
}

/// Usage snapshot plus derived turn status.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServiceInfo {
    pub usage: Usage,
    pub status: TurnStatus,
    pub cost_usd: Option<f64>,
}

/// One timeline entry.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Message {
    User { text: String, at: DateTime<Utc> },
    AssistantText { text: String, at: DateTime<Utc> },
    ToolCall(ToolCallState),
    Service { info: ServiceInfo, at: DateTime<Utc> },
}

impl Message {
    pub fn user(text: impl Into<String>) -> Self {
        Self::User {
            text: text.into(),
            at: Utc::now(),
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::AssistantText {
            text: text.into(),
            at: Utc::now(),
        }
    }

    /// Tool call id when this is a tool call entry.
    pub fn tool_id(&self) -> Option<&str> {
        match self {
            Self::ToolCall(state) => Some(&state.id),
            _ => None,
        }
    }
}

/// A conversation slot.
#[derive(Debug, Clone, Serialize)]
pub struct Session {
    pub id: String,
    pub name: String,
    pub status: SessionStatus,
    pub working_dir: PathBuf,
    pub timeline: Vec<Message>,
    pub pending_tools: HashMap<String, ToolCallState>,
    /// Continuation token revealed by the assistant; passed on every later
    /// invocation.
    pub resume_token: Option<String>,
    /// Last nonzero usage report.
    pub last_usage: Option<Usage>,
    /// Derived status of the latest turn.
    pub turn: TurnStatus,
    pub total_cost_usd: f64,
    pub invocations: u32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,
}

impl Session {
    pub fn new(id: String, name: String, working_dir: PathBuf) -> Self {
        let now = Utc::now();
        Self {
            id,
            name,
            status: SessionStatus::Creating,
            working_dir,
            timeline: Vec::new(),
            pending_tools: HashMap::new(),
            resume_token: None,
            last_usage: None,
            turn: TurnStatus::Initializing,
            total_cost_usd: 0.0,
            invocations: 0,
            last_error: None,
            created_at: now,
            last_active_at: now,
        }
    }

    /// First eight characters of the id, for display.
    pub fn short_id(&self) -> &str {
        &self.id[..8.min(self.id.len())]
    }

    pub fn touch(&mut self) {
        self.last_active_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn turn_status_never_falls_back_to_initializing() {
        let status = TurnStatus::Initializing.advance(TurnStatus::Processing);
        assert_eq!(status, TurnStatus::Processing);
        assert_eq!(status.advance(TurnStatus::Initializing), TurnStatus::Processing);
        assert_eq!(
            TurnStatus::Completed.advance(TurnStatus::Initializing),
            TurnStatus::Completed
        );
        assert_eq!(
            TurnStatus::Completed.advance(TurnStatus::Processing),
            TurnStatus::Processing
        );
    }

    #[test]
    fn error_sessions_accept_retries() {
        assert!(SessionStatus::Ready.accepts_messages());
        assert!(SessionStatus::Error.accepts_messages());
        assert!(!SessionStatus::Starting.accepts_messages());
        assert!(!SessionStatus::Closed.accepts_messages());
    }

    #[test]
    fn message_serializes_with_kind_tag() {
        let json = serde_json::to_value(Message::assistant("hi")).unwrap();
        assert_eq!(json["kind"], "assistant_text");
        assert_eq!(json["text"], "hi");
    }
}
