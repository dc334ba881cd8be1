//! Correlation table for outbound control requests

use std::collections::HashMap;
use std::sync::Mutex;

use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::control::ControlError;
use crate::protocol::ControlResponse;

/// What a waiter receives: the success payload or the remote error text
pub(crate) type PendingResult = Result<Option<Value>, String>;

/// Request id to single-use response slot
///
/// A slot leaves the table exactly once: on response, on explicit removal
/// after a timeout or cancellation, or in `fail_all`.
#[derive(Default)]
pub(crate) struct PendingRequests {
    slots: Mutex<HashMap<String, oneshot::Sender<PendingResult>>>,
}

impl PendingRequests {
    pub fn register(
        &self,
        request_id: &str,
    ) -> Result<oneshot::Receiver<PendingResult>, ControlError> {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        if slots.contains_key(request_id) {
            return Err(ControlError::DuplicateRequestId(request_id.to_string()));
        }
        let (tx, rx) = oneshot::channel();
        slots.insert(request_id.to_string(), tx);
        Ok(rx)
    }

    /// Deliver `response` to its waiter; `false` when nobody is waiting
    pub fn complete(&self, response: ControlResponse) -> bool {
        let (request_id, result) = match response {
            ControlResponse::Success {
                request_id,
                response,
            } => (request_id, Ok(response)),
            ControlResponse::Error { request_id, error } => (request_id, Err(error)),
        };

        let sender = {
            let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
            slots.remove(&request_id)
        };

        match sender {
            Some(sender) => {
                if sender.send(result).is_err() {
                    debug!("PendingRequests: waiter for {} already gone", request_id);
                }
                true
            }
            None => {
                warn!(
                    "PendingRequests: dropping unmatched response {}",
                    request_id
                );
                false
            }
        }
    }

    pub fn remove(&self, request_id: &str) -> bool {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots.remove(request_id).is_some()
    }

    /// Drop every slot; waiters observe a closed channel
    pub fn fail_all(&self) -> usize {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        let count = slots.len();
        for (request_id, _) in slots.drain() {
            debug!("PendingRequests: failing {}", request_id);
        }
        count
    }

    pub fn len(&self) -> usize {
        let slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots.len()
    }
}
