//! Control protocol
//!
//! Runs request/response traffic with the CLI on top of the transport's
//! write path. Outbound requests get a fresh correlation id and wait for the
//! matching `control_response`; inbound requests are dispatched to the hook,
//! permission and tool-server subsystems and always answered.
//!
//! ```text
//! Uninitialized -> Initializing -> Ready -> Closed
//!        ^               |
//!        +--- failure ---+
//! ```

pub mod error;
pub(crate) mod pending;
pub mod types;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{Level, debug, info, trace, warn};
use uuid::Uuid;

use crate::callbacks::{HookExecutor, PermissionRouter, ToolServerRouter};
use crate::config::ControlConfig;
use crate::io::{ControlRouter, MessageWriter, SubprocessTransport};
use crate::protocol::control::{SUBTYPE_CAN_USE_TOOL, SUBTYPE_HOOK_CALLBACK, SUBTYPE_MCP_MESSAGE};
use crate::protocol::{
    ControlRequestEnvelope, ControlResponseEnvelope, InboundRequest, Message, OutboundRequest,
};
use crate::{log_control_message, log_timing};

pub use error::ControlError;
use pending::PendingRequests;
pub use types::{AccountInfo, McpServerStatus, ModelInfo, PermissionMode, SlashCommand};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolState {
    Uninitialized,
    Initializing,
    Ready,
    Closed,
}

struct Inner {
    writer: Arc<dyn MessageWriter>,
    cancel: CancellationToken,
    state: Mutex<ProtocolState>,
    pending: PendingRequests,
    hooks: Arc<HookExecutor>,
    permissions: Arc<PermissionRouter>,
    tool_servers: Arc<ToolServerRouter>,
    config: ControlConfig,
    counter: AtomicU64,
    init_response: Mutex<Option<Value>>,
}

/// Handle to one session's control channel; clones share state
#[derive(Clone)]
pub struct ControlProtocol {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for ControlProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlProtocol")
            .field("state", &self.state())
            .field("pending", &self.inner.pending.len())
            .finish()
    }
}

impl ControlProtocol {
    /// Build a protocol over an arbitrary write path
    ///
    /// `cancel` should be the transport's token so that shutting the
    /// transport down releases every waiter.
    pub fn new(
        writer: Arc<dyn MessageWriter>,
        cancel: CancellationToken,
        config: ControlConfig,
    ) -> Self {
        let hooks = Arc::new(HookExecutor::new(config.default_hook_timeout));
        let permissions = Arc::new(PermissionRouter::new(config.permission_timeout));

        Self {
            inner: Arc::new(Inner {
                writer,
                cancel,
                state: Mutex::new(ProtocolState::Uninitialized),
                pending: PendingRequests::default(),
                hooks,
                permissions,
                tool_servers: Arc::new(ToolServerRouter::new()),
                config,
                counter: AtomicU64::new(0),
                init_response: Mutex::new(None),
            }),
        }
    }

    /// Share `transport`'s write path and receive its control envelopes
    pub fn attach(transport: &SubprocessTransport, config: ControlConfig) -> Self {
        let protocol = Self::new(transport.writer(), transport.cancellation_token(), config);
        transport.set_control_router(Arc::new(protocol.clone()));
        protocol
    }

    pub fn state(&self) -> ProtocolState {
        *self.inner.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn hooks(&self) -> &Arc<HookExecutor> {
        &self.inner.hooks
    }

    pub fn permissions(&self) -> &Arc<PermissionRouter> {
        &self.inner.permissions
    }

    pub fn tool_servers(&self) -> &Arc<ToolServerRouter> {
        &self.inner.tool_servers
    }

    /// The CLI's reply to `initialize`, once ready
    pub fn initialization_response(&self) -> Option<Value> {
        self.inner
            .init_response
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn pending_requests(&self) -> usize {
        self.inner.pending.len()
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Send the `initialize` handshake with the registered hook configuration
    pub async fn initialize(&self) -> Result<Option<Value>, ControlError> {
        {
            let mut state = self.inner.state.lock().unwrap_or_else(|e| e.into_inner());
            match *state {
                ProtocolState::Uninitialized => *state = ProtocolState::Initializing,
                ProtocolState::Closed => return Err(ControlError::Closed),
                ProtocolState::Initializing | ProtocolState::Ready => {
                    return Err(ControlError::AlreadyInitialized);
                }
            }
        }

        let request = OutboundRequest::Initialize {
            hooks: self.inner.hooks.wire_config(),
        };

        match self
            .send_request(request, self.inner.config.initialize_timeout)
            .await
        {
            Ok(response) => {
                self.transition(ProtocolState::Initializing, ProtocolState::Ready);
                *self
                    .inner
                    .init_response
                    .lock()
                    .unwrap_or_else(|e| e.into_inner()) = response.clone();
                info!("ControlProtocol: initialized");
                Ok(response)
            }
            Err(e) => {
                self.transition(ProtocolState::Initializing, ProtocolState::Uninitialized);
                warn!("ControlProtocol: initialize failed: {}", e);
                Err(e)
            }
        }
    }

    /// Stop accepting requests and release every waiter
    pub fn close(&self) {
        self.set_state(ProtocolState::Closed);
        let failed = self.inner.pending.fail_all();
        if failed > 0 {
            debug!("ControlProtocol: closed with {} pending request(s)", failed);
        }
    }

    // ========================================================================
    // Outbound requests
    // ========================================================================

    pub async fn interrupt(&self) -> Result<(), ControlError> {
        self.request(OutboundRequest::Interrupt).await.map(|_| ())
    }

    pub async fn set_permission_mode(&self, mode: PermissionMode) -> Result<(), ControlError> {
        self.request(OutboundRequest::SetPermissionMode {
            mode: mode.as_str().to_string(),
        })
        .await
        .map(|_| ())
    }

    /// `None` restores the default model
    pub async fn set_model(&self, model: Option<&str>) -> Result<(), ControlError> {
        self.request(OutboundRequest::SetModel {
            model: model.map(str::to_string),
        })
        .await
        .map(|_| ())
    }

    /// Restore files to their state at `user_message_id`
    pub async fn rewind_files(&self, user_message_id: &str) -> Result<(), ControlError> {
        self.request(OutboundRequest::RewindFiles {
            user_message_id: user_message_id.to_string(),
        })
        .await
        .map(|_| ())
    }

    pub async fn get_account_info(&self) -> Result<AccountInfo, ControlError> {
        let response = self.request(OutboundRequest::GetAccountInfo).await?;
        types::decode_object(response, "account").map_err(|reason| {
            ControlError::UnexpectedResponse {
                subtype: "get_account_info",
                reason,
            }
        })
    }

    pub async fn get_models(&self) -> Result<Vec<ModelInfo>, ControlError> {
        let response = self.request(OutboundRequest::GetModels).await?;
        types::decode_list(response, "models").map_err(|reason| ControlError::UnexpectedResponse {
            subtype: "get_models",
            reason,
        })
    }

    pub async fn get_commands(&self) -> Result<Vec<SlashCommand>, ControlError> {
        let response = self.request(OutboundRequest::GetCommands).await?;
        types::decode_list(response, "commands").map_err(|reason| {
            ControlError::UnexpectedResponse {
                subtype: "get_commands",
                reason,
            }
        })
    }

    pub async fn get_mcp_server_status(&self) -> Result<Vec<McpServerStatus>, ControlError> {
        let response = self.request(OutboundRequest::GetMcpServerStatus).await?;
        types::decode_list(response, "mcpServers").map_err(|reason| {
            ControlError::UnexpectedResponse {
                subtype: "get_mcp_server_status",
                reason,
            }
        })
    }

    /// Replace the CLI's dynamically configured MCP servers
    pub async fn set_mcp_servers(
        &self,
        servers: HashMap<String, Value>,
    ) -> Result<Option<Value>, ControlError> {
        let servers = serde_json::to_value(servers)?;
        self.request(OutboundRequest::SetMcpServers { servers })
            .await
    }

    async fn request(&self, request: OutboundRequest) -> Result<Option<Value>, ControlError> {
        match self.state() {
            ProtocolState::Ready => {}
            ProtocolState::Closed => return Err(ControlError::Closed),
            other => return Err(ControlError::NotReady(other)),
        }
        self.send_request(request, self.inner.config.request_timeout)
            .await
    }

    async fn send_request(
        &self,
        request: OutboundRequest,
        timeout: Duration,
    ) -> Result<Option<Value>, ControlError> {
        let subtype = request.subtype();
        let request_id = self.next_request_id();
        let envelope = ControlRequestEnvelope {
            request_id: request_id.clone(),
            request: serde_json::to_value(&request)?,
        };

        let receiver = self.inner.pending.register(&request_id)?;
        log_control_message!(Level::DEBUG, "outgoing", subtype, &envelope.request);

        if let Err(e) = self
            .inner
            .writer
            .write_line(&envelope.to_wire().to_string())
            .await
        {
            self.inner.pending.remove(&request_id);
            return Err(e.into());
        }

        let start = Instant::now();
        let outcome = tokio::select! {
            biased;
            () = self.inner.cancel.cancelled() => Err(ControlError::Cancelled { subtype }),
            reply = receiver => match reply {
                Ok(Ok(response)) => Ok(response),
                Ok(Err(message)) => Err(ControlError::Remote { subtype, message }),
                Err(_) => Err(ControlError::Closed),
            },
            () = tokio::time::sleep(timeout) => Err(ControlError::Timeout { subtype, timeout }),
        };

        if outcome.is_err() {
            self.inner.pending.remove(&request_id);
            debug!(
                "ControlProtocol: {} ({}) did not complete",
                subtype, request_id
            );
        }
        log_timing!(Level::DEBUG, subtype, start.elapsed());

        outcome
    }

    fn next_request_id(&self) -> String {
        let n = self.inner.counter.fetch_add(1, Ordering::Relaxed) + 1;
        let suffix = Uuid::new_v4().simple().to_string();
        format!("req_{}_{}", n, &suffix[..8])
    }

    fn set_state(&self, next: ProtocolState) {
        *self.inner.state.lock().unwrap_or_else(|e| e.into_inner()) = next;
    }

    /// Move `from -> to` only if still in `from`
    fn transition(&self, from: ProtocolState, to: ProtocolState) -> bool {
        let mut state = self.inner.state.lock().unwrap_or_else(|e| e.into_inner());
        if *state == from {
            *state = to;
            true
        } else {
            false
        }
    }
}

// ============================================================================
// Inbound dispatch
// ============================================================================

impl Inner {
    async fn handle_inbound(&self, envelope: ControlRequestEnvelope) {
        let request_id = envelope.request_id.clone();
        let subtype = envelope.subtype().unwrap_or_default().to_string();
        log_control_message!(
            Level::DEBUG,
            "incoming",
            subtype.as_str(),
            &envelope.request
        );

        let cancel = self.cancel.child_token();
        let outcome = match serde_json::from_value::<InboundRequest>(envelope.request) {
            Ok(request) => self.dispatch(request, &cancel).await,
            Err(e) => match subtype.as_str() {
                SUBTYPE_CAN_USE_TOOL | SUBTYPE_HOOK_CALLBACK | SUBTYPE_MCP_MESSAGE => {
                    Err(format!("Invalid {subtype} request: {e}"))
                }
                _ => Err(format!("Unsupported control request subtype: {subtype}")),
            },
        };

        let response = match outcome {
            Ok(body) => ControlResponseEnvelope::success(request_id.as_str(), Some(body)),
            Err(message) => {
                warn!(
                    "ControlProtocol: {} ({}) failed: {}",
                    subtype, request_id, message
                );
                ControlResponseEnvelope::error(request_id.as_str(), message)
            }
        };

        log_control_message!(
            Level::DEBUG,
            "outgoing",
            subtype.as_str(),
            &response.response
        );
        let line = response.to_wire().to_string();
        if let Err(e) = self.writer.write_line(&line).await {
            warn!(
                "ControlProtocol: could not answer {} ({}): {}",
                subtype, request_id, e
            );
        }
    }

    async fn dispatch(
        &self,
        request: InboundRequest,
        cancel: &CancellationToken,
    ) -> Result<Value, String> {
        match request {
            InboundRequest::CanUseTool(request) => self
                .permissions
                .route(request, cancel)
                .await
                .map_err(|e| format!("Permission callback failed: {e}")),
            InboundRequest::HookCallback(request) => self
                .hooks
                .execute_callback(
                &request.callback_id,
                request.input,
                request.tool_use_id,
                cancel,
            )
                .await
                .map(|output| output.to_value())
                .map_err(|e| e.to_string()),
            InboundRequest::McpMessage(request) => Ok(self
                .tool_servers
                .route(&request.server_name, request.message, cancel)
                .await),
        }
    }
}

impl ControlRouter for ControlProtocol {
    fn route(&self, message: Message) {
        match message {
            Message::ControlResponse(envelope) => {
                trace!(
                    "ControlProtocol: response for {}",
                    envelope.request_id()
                );
                self.inner.pending.complete(envelope.response);
            }
            Message::ControlRequest(envelope) => {
                let inner = Arc::clone(&self.inner);
                tokio::spawn(async move {
                    inner.handle_inbound(envelope).await;
                });
            }
            other => {
                debug!(
                    "ControlProtocol: ignoring {} message",
                    other.message_type()
                );
            }
        }
    }

    fn on_stream_closed(&self) {
        self.set_state(ProtocolState::Closed);
        let failed = self.inner.pending.fail_all();
        if failed > 0 {
            warn!(
                "ControlProtocol: output ended with {} request(s) in flight",
                failed
            );
        }
    }
}
