//! Streaming invocation of the assistant CLI.
//!
//! Each outbound message spawns one short-lived process that resumes the
//! conversation by token and streams its reply as NDJSON on stdout.

mod invocation;

pub use invocation::{InvocationOutcome, InvocationRunner, RunnerHandle};
