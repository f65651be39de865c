//! Error taxonomy for the session engine.
//!
//! Parse-level failures never show up here: malformed stream lines and log
//! entries are logged and skipped where they occur.

use std::path::PathBuf;

use crate::timeline::SessionStatus;

/// Result alias used throughout the library.
pub type Result<T> = std::result::Result<T, Error>;

/// Failures surfaced to pool callers.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The pool already holds its maximum number of sessions.
    #[error("session pool is full ({max} sessions)")]
    Capacity { max: usize },

    /// No session with this id.
    #[error("unknown session: {0}")]
    NotFound(String),

    /// The session cannot accept a message in its current state.
    #[error("session {id} is not ready (status: {status})")]
    NotReady { id: String, status: SessionStatus },

    /// The runner already has an invocation in flight.
    #[error("an invocation is already in flight for this session")]
    Busy,

    /// The assistant binary could not be started.
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// The assistant process exited unsuccessfully.
    #[error("assistant process exited with {}: {stderr}", exit_label(.code))]
    Process { code: Option<i32>, stderr: String },

    /// The assistant reported that the conversation hit its context limit.
    #[error("context limit reached: {0}")]
    ContextLimit(String),

    /// Log root could not be watched.
    #[error("failed to watch {}: {source}", .path.display())]
    Watch {
        path: PathBuf,
        #[source]
        source: notify::Error,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether the failure happened at the process level, which flips the
    /// session into `error`.
    pub const fn is_process_level(&self) -> bool {
        matches!(self, Self::Spawn { .. } | Self::Process { .. } | Self::Io(_))
    }
}

#[allow(clippy::ref_option)]
fn exit_label(code: &Option<i32>) -> String {
    code.map_or_else(|| "signal".to_string(), |c| format!("code {c}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn process_error_mentions_exit_code_and_stderr() {
        let err = Error::Process {
            code: Some(2),
            stderr: "boom".into(),
        };
        assert_eq!(err.to_string(), "assistant process exited with code 2: boom");
    }

    #[test]
    fn context_limit_is_not_process_level() {
        assert!(!Error::ContextLimit("too long".into()).is_process_level());
        assert!(Error::Process {
            code: None,
            stderr: String::new()
        }
        .is_process_level());
    }
}
