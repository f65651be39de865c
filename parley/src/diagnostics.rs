//! Bounded diagnostics sink.
//!
//! One instance is created per process and handed to the pool, which passes
//! it on to every runner and monitor. It keeps the most recent lines for the
//! health dump; structured logging still goes through `tracing`.

use std::collections::VecDeque;
use std::fmt::Write as _;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};

/// A single recorded diagnostic line.
#[derive(Debug, Clone)]
pub struct DiagnosticLine {
    pub at: DateTime<Utc>,
    pub scope: String,
    pub text: String,
}

/// Shared ring buffer of diagnostic lines.
#[derive(Debug, Clone)]
pub struct Diagnostics {
    inner: Arc<Mutex<VecDeque<DiagnosticLine>>>,
    capacity: usize,
}

impl Diagnostics {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(VecDeque::with_capacity(capacity.min(1024)))),
            capacity: capacity.max(1),
        }
    }

    /// Record a line under a scope (usually a short session id).
    pub fn record(&self, scope: impl Into<String>, text: impl Into<String>) {
        let mut lines = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if lines.len() == self.capacity {
            lines.pop_front();
        }
        lines.push_back(DiagnosticLine {
            at: Utc::now(),
            scope: scope.into(),
            text: text.into(),
        });
    }

    /// Copy of the retained lines, oldest first.
    pub fn lines(&self) -> Vec<DiagnosticLine> {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    /// Render the retained lines as text.
    pub fn dump(&self) -> String {
        let mut out = String::new();
        for line in self.lines() {
            let _ = writeln!(
                out,
                "{} [{}] {}",
                line.at.format("%H:%M:%S%.3f"),
                line.scope,
                line.text
            );
        }
        out
    }
}
