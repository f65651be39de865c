//! Session timelines and the projector that builds them from stream events.

mod model;
mod projector;

pub use model::{
    Message, ServiceInfo, Session, SessionStatus, ToolCallState, ToolStatus, TurnStatus,
};
pub use projector::{
    strip_noise, truncate_result, TimelineProjector, Update, FORCED_COMPLETION_MARKER,
};
