//! Incremental reading of one conversation log.
//!
//! Files are append-only, so the reader remembers how many complete lines it
//! has consumed and only looks at what follows. Entries at or before the
//! watermark still feed the usage snapshot but are not surfaced as new
//! responses and do not open tools.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use tracing::{debug, trace};

use crate::protocol::{ContentBlock, LogEntry, LogEntryKind, Usage, WireMessage};
use crate::timeline::{strip_noise, Message, ServiceInfo, TurnStatus, Update};

/// Per-monitor reading state.
#[derive(Debug)]
pub struct TailReader {
    path: Option<PathBuf>,
    consumed: usize,
    non_resumable: bool,
    watermark: DateTime<Utc>,
    open_tools: HashSet<String>,
    last_usage: Option<Usage>,
    turn: TurnStatus,
}

impl TailReader {
    /// Reader that surfaces entries stamped after `watermark`.
    pub fn new(watermark: DateTime<Utc>) -> Self {
        Self {
            path: None,
            consumed: 0,
            non_resumable: false,
            watermark,
            open_tools: HashSet::new(),
            last_usage: None,
            turn: TurnStatus::Initializing,
        }
    }

    pub const fn watermark(&self) -> DateTime<Utc> {
        self.watermark
    }

    pub const fn last_usage(&self) -> Option<&Usage> {
        self.last_usage.as_ref()
    }

    pub const fn turn(&self) -> TurnStatus {
        self.turn
    }

    /// Whether the current file starts with a summary entry.
    pub const fn is_non_resumable(&self) -> bool {
        self.non_resumable
    }

    /// Snapshot of the latest usage tagged `processing`, for priming right
    /// after a send. The derived status restarts with it.
    pub fn prime(&mut self) -> Option<ServiceInfo> {
        self.turn = TurnStatus::Processing;
        self.open_tools.clear();
        self.last_usage.clone().map(|usage| ServiceInfo {
            usage,
            status: TurnStatus::Processing,
            cost_usd: None,
        })
    }

    /// Process the current content of `path`.
    ///
    /// Switching to a different file restarts line counting and the open
    /// tool set; the watermark and usage carry over.
    pub fn ingest(&mut self, path: &Path, content: &str) -> Vec<Update> {
        if self.path.as_deref() != Some(path) {
            debug!(path = %path.display(), "following log file");
            self.path = Some(path.to_path_buf());
            self.consumed = 0;
            self.non_resumable = false;
            self.open_tools.clear();
        }

        // Only newline-terminated lines are complete.
        let complete = content.rfind('\n').map_or("", |end| &content[..end]);
        let lines: Vec<&str> = complete.split('\n').collect();
        let total = if complete.is_empty() { 0 } else { lines.len() };

        if total < self.consumed {
            debug!(path = %path.display(), "log file shrank, rereading");
            self.consumed = 0;
            self.non_resumable = false;
            self.open_tools.clear();
        }

        // Novelty within a file is tracked by line count; the watermark only
        // filters against what was known before this pass.
        let floor = self.watermark;
        let mut updates = Vec::new();
        for (index, line) in lines.iter().enumerate().take(total).skip(self.consumed) {
            let entry = match LogEntry::parse(line) {
                Ok(Some(entry)) => entry,
                Ok(None) => continue,
                Err(err) => {
                    debug!(path = %path.display(), line = index + 1, %err, "skipping malformed log entry");
                    continue;
                }
            };
            if index == 0 && entry.kind == LogEntryKind::Summary {
                debug!(path = %path.display(), "log starts with a summary, not surfacing it");
                self.non_resumable = true;
            }
            self.apply(entry, floor, &mut updates);
        }
        self.consumed = total;
        updates
    }

    fn apply(&mut self, entry: LogEntry, floor: DateTime<Utc>, updates: &mut Vec<Update>) {
        let fresh = entry.timestamp.is_some_and(|at| at > floor);
        if let Some(at) = entry.timestamp {
            self.watermark = self.watermark.max(at);
        }
        if self.non_resumable {
            return;
        }

        let Some(message) = entry.message else {
            return;
        };
        match entry.kind {
            LogEntryKind::Assistant => self.apply_assistant(&message, fresh, updates),
            LogEntryKind::User => self.close_tools(&message),
            LogEntryKind::Summary | LogEntryKind::Other => {
                trace!(kind = ?entry.kind, "ignoring log entry");
            }
        }
    }

    fn apply_assistant(&mut self, message: &WireMessage, fresh: bool, updates: &mut Vec<Update>) {
        for block in message.blocks() {
            match block {
                ContentBlock::Text { text } if fresh => {
                    let cleaned = strip_noise(&text);
                    if !cleaned.is_empty() {
                        updates.push(Update::Message(Message::assistant(cleaned)));
                    }
                }
                ContentBlock::ToolUse { id, .. } if fresh => {
                    self.open_tools.insert(id);
                }
                _ => {}
            }
        }

        if let Some(usage) = message.usage.as_ref().filter(|usage| !usage.is_zero()) {
            self.last_usage = Some(usage.clone());
        }

        let derived = if message.ends_turn() && self.open_tools.is_empty() {
            TurnStatus::Completed
        } else {
            TurnStatus::Processing
        };
        let next = self.turn.advance(derived);
        let status_changed = next != self.turn;
        self.turn = next;

        if fresh && (status_changed || self.last_usage.is_some()) {
            updates.push(Update::Service(ServiceInfo {
                usage: self.last_usage.clone().unwrap_or_default(),
                status: self.turn,
                cost_usd: None,
            }));
        }
    }

    fn close_tools(&mut self, message: &WireMessage) {
        for block in message.blocks() {
            if let ContentBlock::ToolResult { tool_use_id, .. } = block {
                self.open_tools.remove(&tool_use_id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const OLD: &str = "2020-01-01T00:00:00Z";
    const NEW: &str = "2030-01-01T00:00:00Z";

    fn watermark() -> DateTime<Utc> {
        "2025-01-01T00:00:00Z".parse().unwrap()
    }

    fn assistant(at: &str, content: &str, stop: &str, cache_read: u64) -> String {
        format!(
            r#"{{"type":"assistant","timestamp":"{at}","message":{{"content":{content},"stop_reason":{stop},"usage":{{"input_tokens":0,"output_tokens":0,"cache_read_input_tokens":{cache_read}}}}}}}"#
        )
    }

    fn text(at: &str, body: &str) -> String {
        assistant(at, &format!(r#"[{{"type":"text","text":"{body}"}}]"#), r#""end_turn""#, 100)
    }

    fn surfaced_texts(updates: &[Update]) -> Vec<String> {
        updates
            .iter()
            .filter_map(|update| match update {
                Update::Message(Message::AssistantText { text, .. }) => Some(text.clone()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn only_entries_after_watermark_surface() {
        let mut reader = TailReader::new(watermark());
        let content = format!("{}\n{}\n", text(OLD, "before"), text(NEW, "after"));
        let updates = reader.ingest(Path::new("a.jsonl"), &content);

        assert_eq!(surfaced_texts(&updates), vec!["after".to_string()]);
        assert!(matches!(
            updates.last(),
            Some(Update::Service(info)) if info.status == TurnStatus::Completed
        ));
        assert_eq!(reader.watermark(), NEW.parse::<DateTime<Utc>>().unwrap());
    }

    #[test]
    fn old_entries_seed_usage_silently() {
        let mut reader = TailReader::new(watermark());
        let updates = reader.ingest(Path::new("a.jsonl"), &format!("{}\n", text(OLD, "before")));
        assert!(updates.is_empty());
        assert_eq!(reader.last_usage().map(Usage::cache_tokens), Some(100));

        let primed = reader.prime().unwrap();
        assert_eq!(primed.status, TurnStatus::Processing);
        assert_eq!(primed.usage.cache_tokens(), 100);
    }

    #[test]
    fn summary_led_files_never_surface() {
        let mut reader = TailReader::new(watermark());
        let content = format!(
            "{}\n{}\n",
            r#"{"type":"summary","summary":"Earlier work","leafUuid":"x"}"#,
            text(NEW, "from a condensed conversation")
        );
        let updates = reader.ingest(Path::new("s.jsonl"), &content);

        assert!(updates.is_empty());
        assert!(reader.is_non_resumable());
        assert!(reader.last_usage().is_none());
        assert_eq!(reader.watermark(), NEW.parse::<DateTime<Utc>>().unwrap());
    }

    #[test]
    fn lines_are_consumed_once() {
        let mut reader = TailReader::new(watermark());
        let first = format!("{}\n", text(NEW, "one"));
        assert_eq!(surfaced_texts(&reader.ingest(Path::new("a.jsonl"), &first)).len(), 1);

        let appended = format!("{first}{}\n", text("2030-01-01T00:00:01Z", "two"));
        assert_eq!(
            surfaced_texts(&reader.ingest(Path::new("a.jsonl"), &appended)),
            vec!["two".to_string()]
        );
    }

    #[test]
    fn partial_trailing_line_waits() {
        let mut reader = TailReader::new(watermark());
        let line = text(NEW, "whole");
        let (head, _) = line.split_at(line.len() / 2);
        assert!(reader.ingest(Path::new("a.jsonl"), head).is_empty());
        assert_eq!(
            surfaced_texts(&reader.ingest(Path::new("a.jsonl"), &format!("{line}\n"))),
            vec!["whole".to_string()]
        );
    }

    #[test]
    fn open_tool_keeps_turn_processing() {
        let mut reader = TailReader::new(watermark());
        let tool = assistant(
            NEW,
            r#"[{"type":"tool_use","id":"t1","name":"search","input":{}}]"#,
            "null",
            50,
        );
        let premature_end = assistant("2030-01-01T00:00:01Z", "[]", r#""end_turn""#, 60);
        reader.ingest(Path::new("a.jsonl"), &format!("{tool}\n{premature_end}\n"));
        assert_eq!(reader.turn(), TurnStatus::Processing);

        let result = r#"{"type":"user","timestamp":"2030-01-01T00:00:02Z","message":{"content":[{"type":"tool_result","tool_use_id":"t1","content":"ok"}]}}"#;
        let done = assistant("2030-01-01T00:00:03Z", "[]", r#""end_turn""#, 70);
        reader.ingest(
            Path::new("a.jsonl"),
            &format!("{tool}\n{premature_end}\n{result}\n{done}\n"),
        );
        assert_eq!(reader.turn(), TurnStatus::Completed);
    }

    #[test]
    fn zero_usage_is_ignored() {
        let mut reader = TailReader::new(watermark());
        let content = format!(
            "{}\n{}\n",
            assistant(NEW, "[]", "null", 400),
            assistant("2030-01-01T00:00:01Z", "[]", "null", 0)
        );
        let updates = reader.ingest(Path::new("a.jsonl"), &content);

        assert_eq!(reader.last_usage().map(Usage::cache_tokens), Some(400));
        for update in &updates {
            if let Update::Service(info) = update {
                assert_eq!(info.usage.cache_tokens(), 400);
            }
        }
    }

    #[test]
    fn switching_files_restarts_line_count() {
        let mut reader = TailReader::new(watermark());
        reader.ingest(Path::new("a.jsonl"), &format!("{}\n", text(NEW, "one")));
        let updates = reader.ingest(
            Path::new("b.jsonl"),
            &format!("{}\n{}\n", text(NEW, "copied"), text("2030-01-02T00:00:00Z", "fresh")),
        );
        assert_eq!(surfaced_texts(&updates), vec!["fresh".to_string()]);
    }

    #[test]
    fn entries_sharing_a_timestamp_all_surface() {
        let mut reader = TailReader::new(watermark());
        let at = "2030-01-01T00:00:00.123Z";
        let content = format!("{}\n{}\n", text(at, "first block"), text(at, "second block"));
        let updates = reader.ingest(Path::new("a.jsonl"), &content);

        assert_eq!(
            surfaced_texts(&updates),
            vec!["first block".to_string(), "second block".to_string()]
        );
        assert_eq!(reader.watermark(), at.parse::<DateTime<Utc>>().unwrap());
    }

    #[test]
    fn stale_open_tool_does_not_block_completion() {
        let mut reader = TailReader::new(watermark());
        let orphan = assistant(
            OLD,
            r#"[{"type":"tool_use","id":"t0","name":"search","input":{}}]"#,
            "null",
            30,
        );
        let content = format!("{orphan}\n{}\n", text(NEW, "all done"));
        let updates = reader.ingest(Path::new("a.jsonl"), &content);

        assert_eq!(surfaced_texts(&updates), vec!["all done".to_string()]);
        assert_eq!(reader.turn(), TurnStatus::Completed);
    }

    #[test]
    fn prime_starts_a_turn_without_open_tools() {
        let mut reader = TailReader::new(watermark());
        let tool = assistant(
            NEW,
            r#"[{"type":"tool_use","id":"t1","name":"search","input":{}}]"#,
            "null",
            50,
        );
        reader.ingest(Path::new("a.jsonl"), &format!("{tool}\n"));
        assert_eq!(reader.turn(), TurnStatus::Processing);

        reader.prime();
        let reply = text("2030-01-01T00:00:05Z", "next answer");
        reader.ingest(Path::new("a.jsonl"), &format!("{tool}\n{reply}\n"));
        assert_eq!(reader.turn(), TurnStatus::Completed);
    }
}
