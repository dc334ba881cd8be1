//! Wire protocol: typed messages, the type registry, control envelopes and
//! the JSON-RPC sub-protocol used by in-process tool servers

pub mod control;
pub mod jsonrpc;
pub mod message;
pub mod registry;

pub use control::{
    CanUseToolRequest, ControlRequestEnvelope, ControlResponse, ControlResponseEnvelope,
    HookCallbackRequest, InboundRequest, McpMessageRequest, OutboundRequest,
};
pub use message::{
    AssistantMessage, AuthStatus, ContentBlock, Message, ResultMessage, StreamEvent,
    SystemMessage, ToolProgress, UserContent, UserMessage, user_message_line,
};
pub use registry::{MessageRegistry, ParseFn, RegistryError};
