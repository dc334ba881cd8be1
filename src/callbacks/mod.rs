//! Caller-supplied callback subsystems
//!
//! - **Hooks**: lifecycle handlers selected by event and tool-name pattern
//! - **Permission**: the single tool-use permission callback
//! - **Tool server**: in-process servers answering embedded MCP requests
//!
//! All three run user code through [`isolation::run_isolated`], so a failing
//! handler turns into a value rather than taking down the reader loop.

pub mod hooks;
pub mod isolation;
pub mod permission;
pub mod tool_server;

/// Error type returned by caller-supplied handlers
pub type CallbackError = Box<dyn std::error::Error + Send + Sync>;

pub use hooks::{
    HookContext, HookDecision, HookError, HookEvent, HookExecutor, HookHandler, HookInput,
    HookMatcher, HookOutput,
};
pub use isolation::{IsolationError, run_isolated};
pub use permission::{
    PermissionBehavior, PermissionCallback, PermissionDestination, PermissionResult,
    PermissionRouter, PermissionRule, PermissionUpdate, ToolPermissionContext,
};
pub use tool_server::{
    SdkTool, SdkToolServer, ToolContent, ToolHandler, ToolResult, ToolServer, ToolServerRouter,
    sdk_server_config,
};
