//! Client runtime for driving a coding-assistant CLI over stdio
//!
//! The CLI runs as a child process and streams JSON objects on stdout. This
//! crate frames and types that stream, owns the process, and runs the
//! bidirectional control protocol that carries permission checks, hook
//! callbacks and in-process tool-server traffic.
//!
//! ```no_run
//! use cli_agent_bridge::{
//!     ControlConfig, ControlProtocol, Message, SubprocessTransport, Transport, TransportConfig,
//! };
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let mut transport = SubprocessTransport::new(TransportConfig::default())?;
//! let control = ControlProtocol::attach(&transport, ControlConfig::default());
//! transport.connect().await?;
//! control.initialize().await?;
//!
//! let mut messages = transport.take_messages().ok_or("messages already taken")?;
//! transport
//!     .write(&cli_agent_bridge::protocol::user_message_line("hello", "default"))
//!     .await?;
//! while let Some(message) = messages.recv().await {
//!     if let Message::Result(result) = message {
//!         println!("{:?}", result.result);
//!         break;
//!     }
//! }
//! transport.close().await?;
//! # Ok(())
//! # }
//! ```

pub mod callbacks;
pub mod config;
pub mod control;
pub mod io;
pub mod logging;
pub mod protocol;

#[cfg(test)]
mod test_utils;

pub use callbacks::{
    CallbackError, HookEvent, HookExecutor, HookInput, HookMatcher, HookOutput, PermissionResult,
    SdkTool, SdkToolServer, ToolResult, ToolServer,
};
pub use config::{ControlConfig, SessionMode, TransportConfig, TransportConfigBuilder};
pub use control::{ControlError, ControlProtocol, PermissionMode, ProtocolState};
pub use io::{
    JsonObjectFramer, RetryPolicy, SubprocessTransport, Transport, TransportError,
};
pub use protocol::{Message, MessageRegistry};
