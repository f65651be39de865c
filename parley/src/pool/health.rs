//! Health snapshot of the pool.

use std::fmt;

use serde::Serialize;

use crate::timeline::{SessionStatus, TurnStatus};

/// Liveness of one session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionHealth {
    pub id: String,
    pub name: String,
    pub status: SessionStatus,
    pub turn: TurnStatus,
    /// An invocation process is running right now.
    pub invoking: bool,
    /// The log monitor task is alive.
    pub monitoring: bool,
    pub invocations: u32,
    pub last_error: Option<String>,
}

/// Per-session liveness plus the recent diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub active: Option<String>,
    pub capacity: usize,
    pub sessions: Vec<SessionHealth>,
    pub diagnostics: String,
}

impl fmt::Display for HealthReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "sessions: {}/{}", self.sessions.len(), self.capacity)?;
        for session in &self.sessions {
            let marker = if self.active.as_deref() == Some(session.id.as_str()) {
                "*"
            } else {
                " "
            };
            write!(
                f,
                "{marker} {} {:<20} {:<8} turn={:<12} invoking={} monitor={} invocations={}",
                &session.id[..8.min(session.id.len())],
                session.name,
                session.status,
                session.turn,
                session.invoking,
                session.monitoring,
                session.invocations,
            )?;
            if let Some(err) = &session.last_error {
                write!(f, " last_error={err}")?;
            }
            writeln!(f)?;
        }
        if !self.diagnostics.is_empty() {
            writeln!(f, "diagnostics:")?;
            f.write_str(&self.diagnostics)?;
        }
        Ok(())
    }
}
