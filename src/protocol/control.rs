//! Control protocol wire types
//!
//! Control traffic shares the stdio channel with conversational messages.
//! Requests in either direction are wrapped as
//! `{"type":"control_request","request_id":…,"request":{"subtype":…}}` and
//! answered with
//! `{"type":"control_response","response":{"subtype":"success"|"error","request_id":…}}`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::protocol::message::{TYPE_CONTROL_REQUEST, TYPE_CONTROL_RESPONSE};

// ============================================================================
// Envelopes
// ============================================================================

/// `control_request` envelope; `request` is kept raw until dispatch so that
/// unknown subtypes can still be answered with an error
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlRequestEnvelope {
    pub request_id: String,
    pub request: Value,
}

impl ControlRequestEnvelope {
    /// The `subtype` discriminant of the embedded request
    pub fn subtype(&self) -> Option<&str> {
        self.request.get("subtype").and_then(Value::as_str)
    }

    /// Serialise as a complete wire object
    pub fn to_wire(&self) -> Value {
        serde_json::json!({
            "type": TYPE_CONTROL_REQUEST,
            "request_id": self.request_id,
            "request": self.request,
        })
    }
}

/// `control_response` envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlResponseEnvelope {
    pub response: ControlResponse,
}

impl ControlResponseEnvelope {
    pub fn success(request_id: impl Into<String>, response: Option<Value>) -> Self {
        Self {
            response: ControlResponse::Success {
                request_id: request_id.into(),
                response,
            },
        }
    }

    pub fn error(request_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            response: ControlResponse::Error {
                request_id: request_id.into(),
                error: error.into(),
            },
        }
    }

    pub fn request_id(&self) -> &str {
        match &self.response {
            ControlResponse::Success { request_id, .. } => request_id,
            ControlResponse::Error { request_id, .. } => request_id,
        }
    }

    /// Serialise as a complete wire object
    pub fn to_wire(&self) -> Value {
        serde_json::json!({
            "type": TYPE_CONTROL_RESPONSE,
            "response": self.response,
        })
    }
}

/// Body of a `control_response`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "subtype", rename_all = "snake_case")]
pub enum ControlResponse {
    Success {
        request_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        response: Option<Value>,
    },
    Error {
        request_id: String,
        #[serde(default)]
        error: String,
    },
}

// ============================================================================
// Inbound Requests (CLI → client)
// ============================================================================

pub const SUBTYPE_CAN_USE_TOOL: &str = "can_use_tool";
pub const SUBTYPE_HOOK_CALLBACK: &str = "hook_callback";
pub const SUBTYPE_MCP_MESSAGE: &str = "mcp_message";

/// Requests the CLI sends to the client
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "subtype", rename_all = "snake_case")]
pub enum InboundRequest {
    CanUseTool(CanUseToolRequest),
    HookCallback(HookCallbackRequest),
    McpMessage(McpMessageRequest),
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CanUseToolRequest {
    pub tool_name: String,
    #[serde(default)]
    pub input: Value,
    #[serde(default)]
    pub permission_suggestions: Option<Vec<Value>>,
    #[serde(default)]
    pub blocked_path: Option<String>,
    #[serde(default)]
    pub decision_reason: Option<String>,
    #[serde(default)]
    pub tool_use_id: Option<String>,
    #[serde(default)]
    pub agent_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct HookCallbackRequest {
    pub callback_id: String,
    #[serde(default)]
    pub input: Value,
    #[serde(default)]
    pub tool_use_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct McpMessageRequest {
    pub server_name: String,
    pub message: Value,
}

// ============================================================================
// Outbound Requests (client → CLI)
// ============================================================================

/// Requests the client sends to the CLI
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "subtype", rename_all = "snake_case")]
pub enum OutboundRequest {
    Initialize {
        #[serde(skip_serializing_if = "Option::is_none")]
        hooks: Option<Value>,
    },
    Interrupt,
    SetPermissionMode {
        mode: String,
    },
    SetModel {
        model: Option<String>,
    },
    RewindFiles {
        user_message_id: String,
    },
    GetAccountInfo,
    GetModels,
    GetCommands,
    GetMcpServerStatus,
    SetMcpServers {
        servers: Value,
    },
}

impl OutboundRequest {
    /// Wire subtype, used for logging and error context
    pub fn subtype(&self) -> &'static str {
        match self {
            OutboundRequest::Initialize { .. } => "initialize",
            OutboundRequest::Interrupt => "interrupt",
            OutboundRequest::SetPermissionMode { .. } => "set_permission_mode",
            OutboundRequest::SetModel { .. } => "set_model",
            OutboundRequest::RewindFiles { .. } => "rewind_files",
            OutboundRequest::GetAccountInfo => "get_account_info",
            OutboundRequest::GetModels => "get_models",
            OutboundRequest::GetCommands => "get_commands",
            OutboundRequest::GetMcpServerStatus => "get_mcp_server_status",
            OutboundRequest::SetMcpServers { .. } => "set_mcp_servers",
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_outbound_request_serialisation() {
        let value = serde_json::to_value(OutboundRequest::SetModel {
            model: Some("m-2".to_string()),
        })
        .unwrap();
        assert_eq!(value, json!({"subtype": "set_model", "model": "m-2"}));

        let value = serde_json::to_value(OutboundRequest::Interrupt).unwrap();
        assert_eq!(value, json!({"subtype": "interrupt"}));

        let value = serde_json::to_value(OutboundRequest::Initialize { hooks: None }).unwrap();
        assert_eq!(value, json!({"subtype": "initialize"}));
    }

    #[test]
    fn test_inbound_request_parsing() {
        let request: InboundRequest = serde_json::from_value(json!({
            "subtype": "can_use_tool",
            "tool_name": "Bash",
            "input": {"command": "ls"},
            "blocked_path": "/etc"
        }))
        .unwrap();

        match request {
            InboundRequest::CanUseTool(req) => {
                assert_eq!(req.tool_name, "Bash");
                assert_eq!(req.blocked_path.as_deref(), Some("/etc"));
                assert!(req.agent_id.is_none());
            }
            other => panic!("Expected CanUseTool, got: {other:?}"),
        }
    }

    #[test]
    fn test_response_envelope_wire_shape() {
        let success = ControlResponseEnvelope::success("req_1", Some(json!({"ok": true})));
        assert_eq!(
            success.to_wire(),
            json!({
                "type": "control_response",
                "response": {"subtype": "success", "request_id": "req_1", "response": {"ok": true}}
            })
        );

        let error = ControlResponseEnvelope::error("req_2", "boom");
        assert_eq!(error.request_id(), "req_2");
        assert_eq!(error.to_wire()["response"]["error"], "boom");
    }
}
