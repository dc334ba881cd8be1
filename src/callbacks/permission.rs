//! Tool-use permission routing
//!
//! One optional callback decides whether the CLI may run a tool. Without a
//! callback every request is denied.

use std::future::Future;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::callbacks::CallbackError;
use crate::callbacks::isolation::{IsolationError, run_isolated};
use crate::control::types::PermissionMode;
use crate::protocol::CanUseToolRequest;

pub const NO_CALLBACK_MESSAGE: &str = "No permission callback registered";

// ============================================================================
// Permission updates
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PermissionBehavior {
    Allow,
    Deny,
    Ask,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PermissionDestination {
    UserSettings,
    ProjectSettings,
    LocalSettings,
    Session,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionRule {
    pub tool_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rule_content: Option<String>,
}

/// Change to the CLI's permission state, returned alongside an allow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum PermissionUpdate {
    #[serde(rename_all = "camelCase")]
    AddRules {
        rules: Vec<PermissionRule>,
        behavior: PermissionBehavior,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        destination: Option<PermissionDestination>,
    },
    #[serde(rename_all = "camelCase")]
    ReplaceRules {
        rules: Vec<PermissionRule>,
        behavior: PermissionBehavior,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        destination: Option<PermissionDestination>,
    },
    #[serde(rename_all = "camelCase")]
    RemoveRules {
        rules: Vec<PermissionRule>,
        behavior: PermissionBehavior,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        destination: Option<PermissionDestination>,
    },
    #[serde(rename_all = "camelCase")]
    SetMode {
        mode: PermissionMode,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        destination: Option<PermissionDestination>,
    },
    #[serde(rename_all = "camelCase")]
    AddDirectories {
        directories: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        destination: Option<PermissionDestination>,
    },
    #[serde(rename_all = "camelCase")]
    RemoveDirectories {
        directories: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        destination: Option<PermissionDestination>,
    },
}

// ============================================================================
// Callback
// ============================================================================

/// Everything the CLI sent besides the tool name and input
#[derive(Debug, Clone, Default)]
pub struct ToolPermissionContext {
    /// Suggested updates; unparseable entries are skipped
    pub suggestions: Vec<PermissionUpdate>,
    pub blocked_path: Option<String>,
    pub decision_reason: Option<String>,
    pub tool_use_id: Option<String>,
    pub agent_id: Option<String>,
    pub cancel: CancellationToken,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PermissionResult {
    Allow {
        /// Replacement input; the original is echoed back when `None`
        updated_input: Option<Value>,
        updated_permissions: Option<Vec<PermissionUpdate>>,
    },
    Deny {
        message: String,
        /// Stop the whole turn, not just this tool call
        interrupt: bool,
    },
    Ask {
        message: Option<String>,
    },
}

impl PermissionResult {
    pub fn allow() -> Self {
        PermissionResult::Allow {
            updated_input: None,
            updated_permissions: None,
        }
    }

    pub fn deny(message: impl Into<String>) -> Self {
        PermissionResult::Deny {
            message: message.into(),
            interrupt: false,
        }
    }

    /// Wire body of the `can_use_tool` response
    pub fn to_wire(&self, original_input: &Value) -> Value {
        match self {
            PermissionResult::Allow {
                updated_input,
                updated_permissions,
            } => {
                let mut body = json!({
                    "behavior": "allow",
                    "updatedInput": updated_input.as_ref().unwrap_or(original_input),
                });
                if let Some(updates) = updated_permissions {
                    body["updatedPermissions"] = json!(updates);
                }
                body
            }
            PermissionResult::Deny { message, interrupt } => json!({
                "behavior": "deny",
                "message": message,
                "interrupt": interrupt,
            }),
            PermissionResult::Ask { message } => {
                let mut body = json!({"behavior": "ask"});
                if let Some(message) = message {
                    body["message"] = json!(message);
                }
                body
            }
        }
    }
}

#[async_trait]
pub trait PermissionCallback: Send + Sync {
    async fn can_use_tool(
        &self,
        tool_name: String,
        input: Value,
        context: ToolPermissionContext,
    ) -> Result<PermissionResult, CallbackError>;
}

#[async_trait]
impl<F, Fut> PermissionCallback for F
where
    F: Fn(String, Value, ToolPermissionContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<PermissionResult, CallbackError>> + Send,
{
    async fn can_use_tool(
        &self,
        tool_name: String,
        input: Value,
        context: ToolPermissionContext,
    ) -> Result<PermissionResult, CallbackError> {
        (self)(tool_name, input, context).await
    }
}

// ============================================================================
// Router
// ============================================================================

#[derive(Default)]
pub struct PermissionRouter {
    callback: RwLock<Option<Arc<dyn PermissionCallback>>>,
    timeout: Option<Duration>,
}

impl PermissionRouter {
    pub fn new(timeout: Option<Duration>) -> Self {
        Self {
            callback: RwLock::new(None),
            timeout,
        }
    }

    pub fn set_callback<C>(&self, callback: C)
    where
        C: PermissionCallback + 'static,
    {
        let mut slot = self.callback.write().unwrap_or_else(|e| e.into_inner());
        *slot = Some(Arc::new(callback));
    }

    pub fn clear_callback(&self) {
        let mut slot = self.callback.write().unwrap_or_else(|e| e.into_inner());
        *slot = None;
    }

    pub fn has_callback(&self) -> bool {
        let slot = self.callback.read().unwrap_or_else(|e| e.into_inner());
        slot.is_some()
    }

    /// Answer a `can_use_tool` request
    ///
    /// `Err` means the callback itself failed; the caller reports that as an
    /// error response rather than a decision.
    pub async fn route(
        &self,
        request: CanUseToolRequest,
        cancel: &CancellationToken,
    ) -> Result<Value, IsolationError> {
        let callback = {
            let slot = self.callback.read().unwrap_or_else(|e| e.into_inner());
            slot.clone()
        };

        let Some(callback) = callback else {
            debug!(
                "PermissionRouter: no callback, denying {}",
                request.tool_name
            );
            let denied = PermissionResult::deny(NO_CALLBACK_MESSAGE);
            return Ok(denied.to_wire(&request.input));
        };

        let context = ToolPermissionContext {
            suggestions: parse_suggestions(request.permission_suggestions.unwrap_or_default()),
            blocked_path: request.blocked_path,
            decision_reason: request.decision_reason,
            tool_use_id: request.tool_use_id,
            agent_id: request.agent_id,
            cancel: cancel.child_token(),
        };

        let tool_name = request.tool_name;
        let original_input = request.input;
        let input = original_input.clone();
        let label = format!("can_use_tool({tool_name})");

        let result = run_isolated(&label, self.timeout, cancel, async move {
            callback.can_use_tool(tool_name, input, context).await
        })
        .await;

        match result {
            Ok(decision) => {
                debug!("PermissionRouter: {} -> {:?}", label, decision);
                Ok(decision.to_wire(&original_input))
            }
            Err(e) => {
                warn!("PermissionRouter: {} failed: {}", label, e);
                Err(e)
            }
        }
    }
}

fn parse_suggestions(raw: Vec<Value>) -> Vec<PermissionUpdate> {
    raw.into_iter()
        .filter_map(|value| match serde_json::from_value(value) {
            Ok(update) => Some(update),
            Err(e) => {
                debug!("PermissionRouter: skipping unrecognised suggestion: {}", e);
                None
            }
        })
        .collect()
}
