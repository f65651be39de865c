//! Parley - run several conversations with a command-line AI assistant at once.
//!
//! Each message is answered by a one-shot `claude -p --output-format
//! stream-json` invocation that resumes the conversation by token. The stream
//! is projected onto a per-session timeline while a background monitor tails
//! the assistant's own conversation log as a second source.
//!
//! Layout:
//! - [`protocol`]: wire and log formats, line buffering
//! - [`runner`]: one subprocess per message
//! - [`timeline`]: session model and the stream projector
//! - [`monitor`]: log discovery, cached reads, debounced tailing
//! - [`pool`]: bounded session pool and its event fan-out

pub mod config;
pub mod diagnostics;
pub mod error;
pub mod events;
pub mod monitor;
pub mod names;
pub mod pool;
pub mod protocol;
pub mod runner;
pub mod timeline;

pub use config::Settings;
pub use diagnostics::Diagnostics;
pub use error::{Error, Result};
pub use events::{EventBus, PoolEvent, Source};
pub use pool::{HealthReport, SessionPool};
pub use timeline::{Message, Session, SessionStatus, TurnStatus};
