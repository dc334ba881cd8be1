use std::time::Duration;

use crate::control::ProtocolState;
use crate::io::TransportError;

#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Control protocol not ready (state: {0:?})")]
    NotReady(ProtocolState),

    #[error("Control protocol already initialized")]
    AlreadyInitialized,

    #[error("Control request {subtype} timed out after {timeout:?}")]
    Timeout {
        subtype: &'static str,
        timeout: Duration,
    },

    #[error("Control request {subtype} cancelled")]
    Cancelled { subtype: &'static str },

    #[error("Control request {subtype} failed: {message}")]
    Remote {
        subtype: &'static str,
        message: String,
    },

    #[error("Control protocol closed")]
    Closed,

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Duplicate request id: {0}")]
    DuplicateRequestId(String),

    #[error("Unexpected {subtype} response: {reason}")]
    UnexpectedResponse {
        subtype: &'static str,
        reason: String,
    },
}

impl ControlError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, ControlError::Timeout { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, ControlError::Cancelled { .. })
    }
}
