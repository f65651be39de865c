//! Wire model for the assistant's stream output and conversation logs.
//!
//! Both sources are newline-delimited JSON. Lines are parsed at the boundary
//! into closed tagged unions; shapes we do not know collapse into an
//! `Unknown`/`Other` variant instead of travelling around as raw JSON.

mod buffer;
mod events;
mod log;

pub use buffer::LineBuffer;
pub use events::{
    tool_result_text, AssistantEvent, ContentBlock, MessageContent, ProtocolEvent, ResultEvent,
    SystemEvent, Usage, UserEvent, WireMessage,
};
pub use log::{LogEntry, LogEntryKind};
