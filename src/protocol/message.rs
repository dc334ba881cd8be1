//! Typed messages exchanged with the CLI
//!
//! Every object on the wire carries a top-level `type` discriminant. The
//! conversational kinds are parsed into dedicated payload structs; control
//! envelopes are parsed into [`crate::protocol::control`] types. Kinds this
//! crate does not know are preserved as [`Message::Raw`] so that callers can
//! still see them.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::protocol::control::{ControlRequestEnvelope, ControlResponseEnvelope};

// ============================================================================
// Discriminants
// ============================================================================

pub const TYPE_USER: &str = "user";
pub const TYPE_ASSISTANT: &str = "assistant";
pub const TYPE_SYSTEM: &str = "system";
pub const TYPE_RESULT: &str = "result";
pub const TYPE_STREAM_EVENT: &str = "stream_event";
pub const TYPE_TOOL_PROGRESS: &str = "tool_progress";
pub const TYPE_AUTH_STATUS: &str = "auth_status";
pub const TYPE_CONTROL_REQUEST: &str = "control_request";
pub const TYPE_CONTROL_RESPONSE: &str = "control_response";

// ============================================================================
// Message
// ============================================================================

/// A single message read from the CLI's output stream
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    User(UserMessage),
    Assistant(AssistantMessage),
    System(SystemMessage),
    Result(ResultMessage),
    StreamEvent(StreamEvent),
    ToolProgress(ToolProgress),
    AuthStatus(AuthStatus),
    ControlRequest(ControlRequestEnvelope),
    ControlResponse(ControlResponseEnvelope),
    /// A kind without a registered typed parser, kept verbatim
    Raw { message_type: String, data: Value },
}

impl Message {
    /// The wire discriminant of this message
    pub fn message_type(&self) -> &str {
        match self {
            Message::User(_) => TYPE_USER,
            Message::Assistant(_) => TYPE_ASSISTANT,
            Message::System(_) => TYPE_SYSTEM,
            Message::Result(_) => TYPE_RESULT,
            Message::StreamEvent(_) => TYPE_STREAM_EVENT,
            Message::ToolProgress(_) => TYPE_TOOL_PROGRESS,
            Message::AuthStatus(_) => TYPE_AUTH_STATUS,
            Message::ControlRequest(_) => TYPE_CONTROL_REQUEST,
            Message::ControlResponse(_) => TYPE_CONTROL_RESPONSE,
            Message::Raw { message_type, .. } => message_type,
        }
    }

    /// Whether this message belongs to the control protocol rather than the
    /// conversation
    pub fn is_control(&self) -> bool {
        matches!(
            self,
            Message::ControlRequest(_) | Message::ControlResponse(_)
        )
    }

    /// Session id carried by the message, if any
    pub fn session_id(&self) -> Option<&str> {
        match self {
            Message::User(m) => m.session_id.as_deref(),
            Message::Assistant(m) => m.session_id.as_deref(),
            Message::Result(m) => Some(m.session_id.as_str()).filter(|s| !s.is_empty()),
            Message::StreamEvent(m) => m.session_id.as_deref(),
            Message::ToolProgress(m) => m.session_id.as_deref(),
            Message::AuthStatus(m) => m.session_id.as_deref(),
            Message::System(m) => m.data.get("session_id").and_then(Value::as_str),
            _ => None,
        }
    }
}

// ============================================================================
// Content Blocks
// ============================================================================

/// A block of assistant or user content
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    Thinking {
        thinking: String,
        #[serde(default)]
        signature: String,
    },
    ToolUse {
        id: String,
        name: String,
        #[serde(default)]
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        content: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        is_error: Option<bool>,
    },
    /// Block kinds without a typed representation
    #[serde(skip)]
    Other(Value),
}

/// Parse a list of blocks, keeping unrecognised ones as [`ContentBlock::Other`]
fn parse_blocks(values: &[Value]) -> Vec<ContentBlock> {
    values
        .iter()
        .map(|v| {
            serde_json::from_value::<ContentBlock>(v.clone())
                .unwrap_or_else(|_| ContentBlock::Other(v.clone()))
        })
        .collect()
}

/// User content is either plain text or a list of blocks
#[derive(Debug, Clone, PartialEq)]
pub enum UserContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

impl UserContent {
    fn from_value(value: &Value) -> Self {
        match value {
            Value::String(s) => UserContent::Text(s.clone()),
            Value::Array(items) => UserContent::Blocks(parse_blocks(items)),
            Value::Null => UserContent::Text(String::new()),
            other => UserContent::Text(other.to_string()),
        }
    }
}

// ============================================================================
// Conversational Payloads
// ============================================================================

/// A user turn echoed back by the CLI (or a tool result fed to the model)
#[derive(Debug, Clone, PartialEq)]
pub struct UserMessage {
    pub content: UserContent,
    pub uuid: Option<String>,
    pub session_id: Option<String>,
    pub parent_tool_use_id: Option<String>,
}

impl UserMessage {
    /// Build from a raw object; content may sit at `message.content` or at
    /// the top level
    pub fn from_value(raw: &Value) -> Self {
        let content = raw
            .get("message")
            .and_then(|m| m.get("content"))
            .or_else(|| raw.get("content"))
            .map(UserContent::from_value)
            .unwrap_or(UserContent::Text(String::new()));

        Self {
            content,
            uuid: string_field(raw, "uuid"),
            session_id: string_field(raw, "session_id"),
            parent_tool_use_id: string_field(raw, "parent_tool_use_id"),
        }
    }
}

/// A model turn
#[derive(Debug, Clone, PartialEq)]
pub struct AssistantMessage {
    pub content: Vec<ContentBlock>,
    pub model: String,
    pub session_id: Option<String>,
    pub parent_tool_use_id: Option<String>,
    pub error: Option<String>,
}

impl AssistantMessage {
    pub fn from_value(raw: &Value) -> Self {
        let inner = raw.get("message").unwrap_or(raw);
        let content = inner
            .get("content")
            .and_then(Value::as_array)
            .map(|items| parse_blocks(items))
            .unwrap_or_default();

        Self {
            content,
            model: string_field(inner, "model").unwrap_or_default(),
            session_id: string_field(raw, "session_id"),
            parent_tool_use_id: string_field(raw, "parent_tool_use_id"),
            error: string_field(raw, "error"),
        }
    }

    /// Concatenated text of all `text` blocks
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|block| match block {
                ContentBlock::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("")
    }
}

/// System notifications such as `init`; the full object is kept in `data`
#[derive(Debug, Clone, PartialEq)]
pub struct SystemMessage {
    pub subtype: String,
    pub data: Value,
}

impl SystemMessage {
    pub fn from_value(raw: &Value) -> Self {
        Self {
            subtype: string_field(raw, "subtype").unwrap_or_default(),
            data: raw.clone(),
        }
    }
}

/// Final message of a turn
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ResultMessage {
    #[serde(default)]
    pub subtype: String,
    #[serde(default)]
    pub duration_ms: u64,
    #[serde(default)]
    pub duration_api_ms: u64,
    #[serde(default)]
    pub is_error: bool,
    #[serde(default)]
    pub num_turns: u32,
    #[serde(default)]
    pub session_id: String,
    #[serde(default)]
    pub total_cost_usd: Option<f64>,
    #[serde(default)]
    pub usage: Option<Value>,
    #[serde(default)]
    pub result: Option<String>,
    #[serde(default)]
    pub structured_output: Option<Value>,
}

/// Partial assistant output when partial messages are enabled
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct StreamEvent {
    #[serde(default)]
    pub uuid: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub event: Value,
    #[serde(default)]
    pub parent_tool_use_id: Option<String>,
}

/// Progress notification for a long-running tool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ToolProgress {
    #[serde(default)]
    pub tool_use_id: String,
    #[serde(default)]
    pub tool_name: String,
    #[serde(default)]
    pub parent_tool_use_id: Option<String>,
    #[serde(default)]
    pub elapsed_time_seconds: f64,
    #[serde(default)]
    pub session_id: Option<String>,
}

/// Authentication progress reported by the CLI
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct AuthStatus {
    #[serde(default, rename = "isAuthenticating")]
    pub is_authenticating: bool,
    #[serde(default)]
    pub output: Vec<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
}

fn string_field(value: &Value, key: &str) -> Option<String> {
    value.get(key).and_then(Value::as_str).map(str::to_string)
}

// ============================================================================
// Outbound Helpers
// ============================================================================

/// Serialise a prompt as a `user` line for the CLI's stream-json input
pub fn user_message_line(prompt: &str, session_id: &str) -> String {
    json!({
        "type": TYPE_USER,
        "message": { "role": "user", "content": prompt },
        "parent_tool_use_id": Value::Null,
        "session_id": session_id,
    })
    .to_string()
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_message_top_level_content() {
        let raw = json!({"type": "user", "content": "hi"});
        let message = UserMessage::from_value(&raw);

        assert_eq!(message.content, UserContent::Text("hi".to_string()));
        assert!(message.session_id.is_none());
    }

    #[test]
    fn test_user_message_nested_tool_result() {
        let raw = json!({
            "type": "user",
            "session_id": "s1",
            "message": {"role": "user", "content": [
                {"type": "tool_result", "tool_use_id": "t1", "content": "done"}
            ]}
        });
        let message = UserMessage::from_value(&raw);

        match message.content {
            UserContent::Blocks(blocks) => match &blocks[0] {
                ContentBlock::ToolResult { tool_use_id, .. } => assert_eq!(tool_use_id, "t1"),
                other => panic!("Expected ToolResult, got: {other:?}"),
            },
            other => panic!("Expected blocks, got: {other:?}"),
        }
        assert_eq!(message.session_id.as_deref(), Some("s1"));
    }

    #[test]
    fn test_assistant_message_blocks_and_unknown_kinds() {
        let raw = json!({
            "type": "assistant",
            "message": {
                "model": "m-1",
                "content": [
                    {"type": "text", "text": "Hello "},
                    {"type": "tool_use", "id": "t1", "name": "Read", "input": {"path": "a"}},
                    {"type": "server_widget", "payload": 1},
                    {"type": "text", "text": "world"}
                ]
            }
        });
        let message = AssistantMessage::from_value(&raw);

        assert_eq!(message.model, "m-1");
        assert_eq!(message.content.len(), 4);
        assert!(matches!(message.content[2], ContentBlock::Other(_)));
        assert_eq!(message.text(), "Hello world");
    }

    #[test]
    fn test_user_message_line_shape() {
        let line = user_message_line("do it", "default");
        let value: Value = serde_json::from_str(&line).unwrap();

        assert_eq!(value["type"], "user");
        assert_eq!(value["message"]["content"], "do it");
        assert_eq!(value["session_id"], "default");
    }
}
