//! Outbound events fanned out to subscribers.

use serde::Serialize;
use tokio::sync::broadcast;

use crate::timeline::{Message, ServiceInfo, SessionStatus};

/// Where a message or service snapshot was observed.
///
/// The live stream and the on-disk log race each other, so the same content
/// may arrive once from each. Consumers must treat re-delivery as idempotent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    Stream,
    Log,
}

/// Lifecycle and timeline events emitted by the pool.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PoolEvent {
    SessionCreated {
        session_id: String,
        name: String,
    },
    SessionSwitched {
        session_id: String,
    },
    SessionClosed {
        session_id: String,
    },
    SessionStatusChanged {
        session_id: String,
        status: SessionStatus,
    },
    MessageReceived {
        session_id: String,
        source: Source,
        message: Message,
    },
    ServiceInfoReceived {
        session_id: String,
        source: Source,
        info: ServiceInfo,
    },
}

impl PoolEvent {
    /// Session this event concerns.
    pub fn session_id(&self) -> &str {
        match self {
            Self::SessionCreated { session_id, .. }
            | Self::SessionSwitched { session_id }
            | Self::SessionClosed { session_id }
            | Self::SessionStatusChanged { session_id, .. }
            | Self::MessageReceived { session_id, .. }
            | Self::ServiceInfoReceived { session_id, .. } => session_id,
        }
    }
}

/// Broadcast channel for [`PoolEvent`]s.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<PoolEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish an event. Having no subscribers is not an error.
    pub fn emit(&self, event: PoolEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.tx.subscribe()
    }
}
