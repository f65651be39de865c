//! Stream events emitted by the assistant in `stream-json` mode.
//!
//! Every stdout line is one JSON object whose `type` selects the variant.
//! `session_id` may appear on any of them and is the continuation token for
//! the next invocation.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One parsed line of the output stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProtocolEvent {
    /// Session bookkeeping (`init`, hook responses).
    System(SystemEvent),
    /// A complete assistant message: text, tool calls, thinking.
    Assistant(AssistantEvent),
    /// Tool results fed back to the model.
    User(UserEvent),
    /// Terminal summary of the invocation.
    Result(ResultEvent),
    /// Any other `type` (e.g. partial `stream_event` deltas).
    #[serde(other)]
    Unknown,
}

/// System event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemEvent {
    pub subtype: Option<String>,
    pub session_id: Option<String>,
    pub model: Option<String>,
    pub cwd: Option<String>,
}

/// Assistant message event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssistantEvent {
    pub message: WireMessage,
    pub session_id: Option<String>,
    /// Set when the message belongs to a sub-agent spawned by a tool call.
    pub parent_tool_use_id: Option<String>,
}

/// User message event (tool results during an invocation).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserEvent {
    pub message: WireMessage,
    pub session_id: Option<String>,
}

/// Terminal result event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultEvent {
    pub subtype: Option<String>,
    #[serde(default)]
    pub is_error: bool,
    /// Final response text (or the error description).
    pub result: Option<String>,
    pub session_id: Option<String>,
    pub total_cost_usd: Option<f64>,
    pub duration_ms: Option<u64>,
    pub num_turns: Option<u32>,
    pub usage: Option<Usage>,
}

/// The `message` object shared by assistant/user events and log entries.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WireMessage {
    pub id: Option<String>,
    pub role: Option<String>,
    pub model: Option<String>,
    #[serde(default)]
    pub content: MessageContent,
    pub stop_reason: Option<String>,
    pub usage: Option<Usage>,
}

impl WireMessage {
    /// Content blocks; a bare string is treated as a single text block.
    pub fn blocks(&self) -> Vec<ContentBlock> {
        match &self.content {
            MessageContent::Text(text) => vec![ContentBlock::Text { text: text.clone() }],
            MessageContent::Blocks(blocks) => blocks.clone(),
        }
    }

    /// Concatenated text blocks.
    pub fn text(&self) -> Option<String> {
        let texts: Vec<String> = self
            .blocks()
            .into_iter()
            .filter_map(|block| match block {
                ContentBlock::Text { text } if !text.trim().is_empty() => Some(text),
                _ => None,
            })
            .collect();

        if texts.is_empty() {
            None
        } else {
            Some(texts.join("\n"))
        }
    }

    /// Whether the model signalled the end of its turn.
    pub fn ends_turn(&self) -> bool {
        self.stop_reason.as_deref() == Some("end_turn")
    }
}

/// Message content: either a plain string or a list of blocks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

impl Default for MessageContent {
    fn default() -> Self {
        Self::Blocks(Vec::new())
    }
}

/// A content block inside a message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        /// Unique id linking the eventual `tool_result`.
        id: String,
        name: String,
        #[serde(default)]
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        #[serde(default)]
        content: Value,
        #[serde(default)]
        is_error: Option<bool>,
    },
    Thinking {
        #[serde(default)]
        thinking: String,
    },
    #[serde(other)]
    Other,
}

/// Token usage as reported on assistant messages and result events.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default, alias = "cache_creation_input_tokens")]
    pub cache_creation_tokens: u64,
    #[serde(default, alias = "cache_read_input_tokens")]
    pub cache_read_tokens: u64,
    #[serde(default, alias = "service_tier")]
    pub tier: Option<String>,
}

impl Usage {
    /// All counters are zero. Such reports are intermediate and carry no
    /// information.
    pub const fn is_zero(&self) -> bool {
        self.input_tokens == 0
            && self.output_tokens == 0
            && self.cache_creation_tokens == 0
            && self.cache_read_tokens == 0
    }

    /// Tokens occupying the context window: fresh input plus both cache
    /// counters.
    pub const fn context_tokens(&self) -> u64 {
        self.input_tokens + self.cache_creation_tokens + self.cache_read_tokens
    }

    /// Cache tokens (created + read).
    pub const fn cache_tokens(&self) -> u64 {
        self.cache_creation_tokens + self.cache_read_tokens
    }
}

impl ProtocolEvent {
    /// Parse one stream line. Blank lines yield `Ok(None)`.
    pub fn parse(line: &str) -> Result<Option<Self>, serde_json::Error> {
        let line = line.trim();
        if line.is_empty() {
            return Ok(None);
        }
        serde_json::from_str(line).map(Some)
    }

    /// Continuation token carried by this event, if any.
    pub fn session_id(&self) -> Option<&str> {
        match self {
            Self::System(e) => e.session_id.as_deref(),
            Self::Assistant(e) => e.session_id.as_deref(),
            Self::User(e) => e.session_id.as_deref(),
            Self::Result(e) => e.session_id.as_deref(),
            Self::Unknown => None,
        }
    }

    /// Event type label for logging.
    pub const fn type_label(&self) -> &'static str {
        match self {
            Self::System(_) => "system",
            Self::Assistant(_) => "assistant",
            Self::User(_) => "user",
            Self::Result(_) => "result",
            Self::Unknown => "unknown",
        }
    }
}

/// Flatten a `tool_result` content value to text.
///
/// The assistant sends either a string or a list of `{type: "text", text}`
/// items; anything else is rendered as compact JSON.
pub fn tool_result_text(content: &Value) -> String {
    match content {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Array(items) => items
            .iter()
            .filter_map(|item| item.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join("\n"),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_system_init() {
        let json = r#"{"type":"system","subtype":"init","session_id":"abc","model":"opus"}"#;
        let event = ProtocolEvent::parse(json).unwrap().unwrap();
        assert_eq!(event.session_id(), Some("abc"));
        let ProtocolEvent::System(system) = event else {
            panic!("expected system event");
        };
        assert_eq!(system.subtype.as_deref(), Some("init"));
    }

    #[test]
    fn parse_assistant_blocks_and_usage() {
        let json = r#"{"type":"assistant","message":{"role":"assistant","content":[
            {"type":"thinking","thinking":"hmm"},
            {"type":"text","text":"Looking."},
            {"type":"tool_use","id":"t1","name":"search","input":{"q":"rust"}},
            {"type":"server_tool_use","id":"x"}
        ],"stop_reason":null,"usage":{"input_tokens":3,"output_tokens":5,
        "cache_creation_input_tokens":7,"cache_read_input_tokens":11,"service_tier":"standard"}}}"#;
        let event = ProtocolEvent::parse(json).unwrap().unwrap();
        let ProtocolEvent::Assistant(assistant) = event else {
            panic!("expected assistant event");
        };
        let blocks = assistant.message.blocks();
        assert_eq!(blocks.len(), 4);
        assert!(matches!(&blocks[2], ContentBlock::ToolUse { id, name, .. } if id == "t1" && name == "search"));
        assert_eq!(blocks[3], ContentBlock::Other);
        assert!(!assistant.message.ends_turn());

        let usage = assistant.message.usage.unwrap();
        assert_eq!(usage.cache_creation_tokens, 7);
        assert_eq!(usage.cache_read_tokens, 11);
        assert_eq!(usage.tier.as_deref(), Some("standard"));
        assert_eq!(usage.context_tokens(), 21);
    }

    #[test]
    fn parse_user_tool_result() {
        let json = r#"{"type":"user","message":{"role":"user","content":[{"type":"tool_result","tool_use_id":"t1","content":[{"type":"text","text":"a"},{"type":"text","text":"b"}],"is_error":true}]}}"#;
        let ProtocolEvent::User(user) = ProtocolEvent::parse(json).unwrap().unwrap() else {
            panic!("expected user event");
        };
        let ContentBlock::ToolResult {
            tool_use_id,
            content,
            is_error,
        } = &user.message.blocks()[0]
        else {
            panic!("expected tool result");
        };
        assert_eq!(tool_use_id, "t1");
        assert_eq!(tool_result_text(content), "a\nb");
        assert_eq!(*is_error, Some(true));
    }

    #[test]
    fn parse_result() {
        let json = r#"{"type":"result","subtype":"success","is_error":false,"result":"done","session_id":"s1","total_cost_usd":0.05,"duration_ms":1234,"num_turns":5}"#;
        let ProtocolEvent::Result(result) = ProtocolEvent::parse(json).unwrap().unwrap() else {
            panic!("expected result event");
        };
        assert_eq!(result.total_cost_usd, Some(0.05));
        assert_eq!(result.num_turns, Some(5));
        assert!(!result.is_error);
    }

    #[test]
    fn unknown_type_and_blank_lines() {
        let event = ProtocolEvent::parse(r#"{"type":"stream_event","event":{}}"#).unwrap();
        assert_eq!(event, Some(ProtocolEvent::Unknown));
        assert_eq!(ProtocolEvent::parse("   ").unwrap(), None);
        assert!(ProtocolEvent::parse("Loading configuration...").is_err());
    }

    #[test]
    fn string_content_is_a_text_block() {
        let message: WireMessage =
            serde_json::from_str(r#"{"role":"user","content":"hello"}"#).unwrap();
        assert_eq!(message.text().as_deref(), Some("hello"));
    }
}
