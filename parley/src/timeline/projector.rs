//! Projects stream events onto a session's timeline.
//!
//! Tool calls are opened by `tool_use` blocks and closed only by a matching
//! `tool_result` or by [`TimelineProjector::finish_invocation`]. A later
//! content block never closes an earlier tool call.

use std::sync::LazyLock;

use chrono::Utc;
use regex::Regex;
use tracing::{debug, trace};

use crate::config::Settings;
use crate::protocol::{tool_result_text, ContentBlock, ProtocolEvent, ResultEvent, Usage, WireMessage};

use super::model::{Message, ServiceInfo, Session, ToolCallState, ToolStatus, TurnStatus};

/// Result text recorded for tool calls still open when the invocation ended.
pub const FORCED_COMPLETION_MARKER: &str = "(no result reported before the invocation ended)";

static SYSTEM_REMINDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)<system-reminder>.*?</system-reminder>").expect("valid regex")
});

/// A change produced by projecting an event.
#[derive(Debug, Clone, PartialEq)]
pub enum Update {
    /// A message was appended or updated in place.
    Message(Message),
    /// Usage or derived status changed.
    Service(ServiceInfo),
}

/// Applies protocol events to a [`Session`].
#[derive(Debug, Clone)]
pub struct TimelineProjector {
    result_max_lines: usize,
    result_max_chars: usize,
    history_limit: usize,
}

impl TimelineProjector {
    pub fn new(settings: &Settings) -> Self {
        Self {
            result_max_lines: settings.result_max_lines,
            result_max_chars: settings.result_max_chars,
            history_limit: settings.history_limit.max(1),
        }
    }

    /// Record an outbound user message.
    pub fn record_user(&self, session: &mut Session, text: &str) -> Message {
        let message = Message::user(text);
        self.push(session, message.clone());
        session.touch();
        message
    }

    /// Append assistant-visible text produced locally (e.g. a limit notice).
    pub fn record_assistant(&self, session: &mut Session, text: &str) -> Message {
        let message = Message::assistant(text);
        self.push(session, message.clone());
        message
    }

    /// Reset per-turn state before an invocation starts.
    pub fn begin_invocation(&self, session: &mut Session) {
        session.turn = TurnStatus::Initializing;
        session.invocations += 1;
        session.touch();
    }

    /// Apply one event and report what changed.
    pub fn apply(&self, session: &mut Session, event: &ProtocolEvent) -> Vec<Update> {
        if let Some(token) = event.session_id() {
            if session.resume_token.as_deref() != Some(token) {
                debug!(session = session.short_id(), token, "resume token updated");
                session.resume_token = Some(token.to_string());
            }
        }

        let updates = match event {
            ProtocolEvent::System(system) => {
                trace!(subtype = ?system.subtype, "system event");
                Vec::new()
            }
            ProtocolEvent::Assistant(assistant) => self.apply_assistant(session, &assistant.message),
            ProtocolEvent::User(user) => self.apply_tool_results(session, &user.message),
            ProtocolEvent::Result(result) => self.apply_result(session, result),
            ProtocolEvent::Unknown => Vec::new(),
        };

        session.touch();
        updates
    }

    /// Close the invocation: force-complete open tools and emit the final
    /// service snapshot.
    ///
    /// `failed` marks invocations that ended without a usable terminal
    /// result (nonzero exit, spawn failure).
    pub fn finish_invocation(
        &self,
        session: &mut Session,
        terminal: Option<&ResultEvent>,
        failed: bool,
    ) -> Vec<Update> {
        let mut updates = Vec::new();

        let mut open: Vec<ToolCallState> = session.pending_tools.drain().map(|(_, t)| t).collect();
        open.sort_by_key(|tool| tool.started_at);
        for mut tool in open {
            debug!(
                session = session.short_id(),
                tool = %tool.name,
                id = %tool.id,
                "force-completing tool at invocation end"
            );
            tool.status = ToolStatus::Completed;
            tool.result = Some(FORCED_COMPLETION_MARKER.to_string());
            tool.ended_at = Some(Utc::now());
            updates.push(Update::Message(self.replace_tool(session, tool)));
        }

        if let Some(result) = terminal {
            record_usage(session, result.usage.as_ref());
        }
        let cost = terminal.and_then(|result| result.total_cost_usd);
        if let Some(cost) = cost {
            session.total_cost_usd += cost;
        }

        let errored = failed || terminal.is_some_and(|result| result.is_error);
        session.turn = if errored {
            TurnStatus::Error
        } else {
            TurnStatus::Completed
        };

        let info = ServiceInfo {
            usage: session.last_usage.clone().unwrap_or_default(),
            status: session.turn,
            cost_usd: cost,
        };
        self.push(
            session,
            Message::Service {
                info: info.clone(),
                at: Utc::now(),
            },
        );
        updates.push(Update::Service(info));
        session.touch();
        updates
    }

    fn apply_assistant(&self, session: &mut Session, message: &WireMessage) -> Vec<Update> {
        let mut updates = Vec::new();

        for block in message.blocks() {
            match block {
                ContentBlock::Text { text } => {
                    let cleaned = strip_noise(&text);
                    if cleaned.is_empty() {
                        continue;
                    }
                    let message = Message::assistant(cleaned);
                    self.push(session, message.clone());
                    updates.push(Update::Message(message));
                }
                ContentBlock::ToolUse { id, name, input } => {
                    let state = ToolCallState::running(id.clone(), name, input);
                    session.pending_tools.insert(id, state.clone());
                    let message = Message::ToolCall(state);
                    self.push(session, message.clone());
                    updates.push(Update::Message(message));
                }
                ContentBlock::Thinking { thinking } => {
                    trace!(len = thinking.len(), "thinking block");
                }
                ContentBlock::ToolResult { .. } | ContentBlock::Other => {}
            }
        }

        let usage_changed = record_usage(session, message.usage.as_ref());

        let derived = if message.ends_turn() && session.pending_tools.is_empty() {
            TurnStatus::Completed
        } else {
            TurnStatus::Processing
        };
        let status_changed = self.set_turn(session, derived);

        if usage_changed || status_changed {
            updates.push(Update::Service(service_snapshot(session)));
        }
        updates
    }

    fn apply_tool_results(&self, session: &mut Session, message: &WireMessage) -> Vec<Update> {
        let mut updates = Vec::new();

        for block in message.blocks() {
            let ContentBlock::ToolResult {
                tool_use_id,
                content,
                is_error,
            } = block
            else {
                continue;
            };

            let Some(mut tool) = session.pending_tools.remove(&tool_use_id) else {
                debug!(id = %tool_use_id, "tool result without an open tool call");
                continue;
            };

            tool.status = if is_error.unwrap_or(false) {
                ToolStatus::Error
            } else {
                ToolStatus::Completed
            };
            tool.result = Some(truncate_result(
                &tool_result_text(&content),
                self.result_max_lines,
                self.result_max_chars,
            ));
            tool.ended_at = Some(Utc::now());
            updates.push(Update::Message(self.replace_tool(session, tool)));
        }

        if !updates.is_empty() && self.set_turn(session, TurnStatus::Processing) {
            updates.push(Update::Service(service_snapshot(session)));
        }
        updates
    }

    fn apply_result(&self, session: &mut Session, result: &ResultEvent) -> Vec<Update> {
        let usage_changed = record_usage(session, result.usage.as_ref());
        let derived = if result.is_error {
            TurnStatus::Error
        } else if session.pending_tools.is_empty() {
            TurnStatus::Completed
        } else {
            TurnStatus::Processing
        };

        let status_changed = self.set_turn(session, derived);
        if usage_changed || status_changed {
            vec![Update::Service(service_snapshot(session))]
        } else {
            Vec::new()
        }
    }

    fn set_turn(&self, session: &mut Session, next: TurnStatus) -> bool {
        let advanced = session.turn.advance(next);
        let changed = advanced != session.turn;
        session.turn = advanced;
        changed
    }

    /// Update the timeline entry for a tool in place, returning the new
    /// message. Entries already trimmed from history are not re-added.
    fn replace_tool(&self, session: &mut Session, tool: ToolCallState) -> Message {
        let message = Message::ToolCall(tool);
        let id = message.tool_id().unwrap_or_default().to_string();
        if let Some(slot) = session
            .timeline
            .iter_mut()
            .rev()
            .find(|entry| entry.tool_id() == Some(id.as_str()))
        {
            *slot = message.clone();
        }
        message
    }

    fn push(&self, session: &mut Session, message: Message) {
        session.timeline.push(message);
        let excess = session.timeline.len().saturating_sub(self.history_limit);
        if excess > 0 {
            session.timeline.drain(..excess);
        }
    }
}

fn service_snapshot(session: &Session) -> ServiceInfo {
    ServiceInfo {
        usage: session.last_usage.clone().unwrap_or_default(),
        status: session.turn,
        cost_usd: None,
    }
}

/// Remove injected `<system-reminder>` blocks and surrounding whitespace.
pub fn strip_noise(text: &str) -> String {
    SYSTEM_REMINDER.replace_all(text, "").trim().to_string()
}

/// Elide long tool output.
///
/// Keeps the first `max_lines` lines and replaces the rest with a count,
/// then cuts the remainder at `max_chars` characters.
pub fn truncate_result(text: &str, max_lines: usize, max_chars: usize) -> String {
    let lines: Vec<&str> = text.lines().collect();
    let mut out = if lines.len() > max_lines {
        let hidden = lines.len() - max_lines;
        format!("{}\n… ({hidden} more lines)", lines[..max_lines].join("\n"))
    } else {
        text.to_string()
    };

    if out.chars().count() > max_chars {
        out = out.chars().take(max_chars).collect::<String>() + "…";
    }
    out
}

/// Keep `usage` as the latest snapshot unless it is all zeros.
fn record_usage(session: &mut Session, usage: Option<&Usage>) -> bool {
    match usage {
        Some(usage) if !usage.is_zero() => {
            session.last_usage = Some(usage.clone());
            true
        }
        _ => false,
    }
}
