//! Message type registry
//!
//! Maps a `type` discriminant to the function that turns a raw JSON object
//! into a [`Message`]. Lookups happen for every line the CLI writes while
//! registration is rare, so the table sits behind an `RwLock`.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde_json::Value;
use tracing::{debug, trace};

use crate::io::framing::FramedObject;
use crate::protocol::control::{ControlRequestEnvelope, ControlResponseEnvelope};
use crate::protocol::message::{
    AssistantMessage, AuthStatus, Message, ResultMessage, StreamEvent, SystemMessage,
    TYPE_ASSISTANT, TYPE_AUTH_STATUS, TYPE_CONTROL_REQUEST, TYPE_CONTROL_RESPONSE, TYPE_RESULT,
    TYPE_STREAM_EVENT, TYPE_SYSTEM, TYPE_TOOL_PROGRESS, TYPE_USER, ToolProgress, UserMessage,
};

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("Unknown message type '{message_type}' at line {line}")]
    UnknownType { message_type: String, line: usize },

    #[error("Message at line {line} has no string 'type' field")]
    MissingType { line: usize },

    #[error("Failed to parse '{message_type}' message at line {line}: {reason}")]
    Parse {
        message_type: String,
        line: usize,
        reason: String,
    },

    #[error("Invalid JSON at line {line}: {source}")]
    Json {
        line: usize,
        #[source]
        source: serde_json::Error,
    },
}

impl RegistryError {
    /// Whether the caller may fall back to a raw passthrough
    pub fn is_unknown_type(&self) -> bool {
        matches!(self, RegistryError::UnknownType { .. })
    }
}

/// Parse function signature: raw object and its starting line
pub type ParseFn = Arc<dyn Fn(&Value, usize) -> Result<Message, RegistryError> + Send + Sync>;

// ============================================================================
// Registry
// ============================================================================

pub struct MessageRegistry {
    parsers: RwLock<HashMap<String, ParseFn>>,
}

impl std::fmt::Debug for MessageRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageRegistry")
            .field("types", &self.registered_types())
            .finish()
    }
}

impl Default for MessageRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl MessageRegistry {
    /// A registry with no parsers
    pub fn empty() -> Self {
        Self {
            parsers: RwLock::new(HashMap::new()),
        }
    }

    /// A registry with parsers for the nine built-in kinds
    pub fn with_defaults() -> Self {
        let registry = Self::empty();

        registry.register(TYPE_USER, |raw, _| {
            Ok(Message::User(UserMessage::from_value(raw)))
        });
        registry.register(TYPE_ASSISTANT, |raw, _| {
            Ok(Message::Assistant(AssistantMessage::from_value(raw)))
        });
        registry.register(TYPE_SYSTEM, |raw, _| {
            Ok(Message::System(SystemMessage::from_value(raw)))
        });
        registry.register(TYPE_RESULT, |raw, line| {
            decode::<ResultMessage>(TYPE_RESULT, raw, line).map(Message::Result)
        });
        registry.register(TYPE_STREAM_EVENT, |raw, line| {
            decode::<StreamEvent>(TYPE_STREAM_EVENT, raw, line).map(Message::StreamEvent)
        });
        registry.register(TYPE_TOOL_PROGRESS, |raw, line| {
            decode::<ToolProgress>(TYPE_TOOL_PROGRESS, raw, line).map(Message::ToolProgress)
        });
        registry.register(TYPE_AUTH_STATUS, |raw, line| {
            decode::<AuthStatus>(TYPE_AUTH_STATUS, raw, line).map(Message::AuthStatus)
        });
        registry.register(TYPE_CONTROL_REQUEST, |raw, line| {
            decode::<ControlRequestEnvelope>(TYPE_CONTROL_REQUEST, raw, line)
                .map(Message::ControlRequest)
        });
        registry.register(TYPE_CONTROL_RESPONSE, |raw, line| {
            decode::<ControlResponseEnvelope>(TYPE_CONTROL_RESPONSE, raw, line)
                .map(Message::ControlResponse)
        });

        registry
    }

    /// Register (or replace) the parser for a discriminant
    pub fn register<F>(&self, message_type: &str, parse: F)
    where
        F: Fn(&Value, usize) -> Result<Message, RegistryError> + Send + Sync + 'static,
    {
        let mut parsers = self.parsers.write().unwrap_or_else(|e| e.into_inner());
        if parsers
            .insert(message_type.to_string(), Arc::new(parse))
            .is_some()
        {
            debug!("MessageRegistry: replaced parser for '{}'", message_type);
        }
    }

    /// Remove the parser for a discriminant; returns whether one existed
    pub fn unregister(&self, message_type: &str) -> bool {
        let mut parsers = self.parsers.write().unwrap_or_else(|e| e.into_inner());
        parsers.remove(message_type).is_some()
    }

    pub fn has_parser(&self, message_type: &str) -> bool {
        let parsers = self.parsers.read().unwrap_or_else(|e| e.into_inner());
        parsers.contains_key(message_type)
    }

    /// Registered discriminants, sorted
    pub fn registered_types(&self) -> Vec<String> {
        let parsers = self.parsers.read().unwrap_or_else(|e| e.into_inner());
        let mut types: Vec<String> = parsers.keys().cloned().collect();
        types.sort();
        types
    }

    /// Dispatch `raw` to the parser registered for `message_type`
    ///
    /// The parser is cloned out of the table before it runs so that a slow
    /// parser never holds the lock.
    pub fn parse(
        &self,
        message_type: &str,
        raw: &Value,
        line: usize,
    ) -> Result<Message, RegistryError> {
        let parser = {
            let parsers = self.parsers.read().unwrap_or_else(|e| e.into_inner());
            parsers.get(message_type).cloned()
        };

        match parser {
            Some(parse) => {
                trace!(
                    "MessageRegistry: parsing '{}' at line {}",
                    message_type, line
                );
                parse(raw, line)
            }
            None => Err(RegistryError::UnknownType {
                message_type: message_type.to_string(),
                line,
            }),
        }
    }

    /// Parse a framed object end to end, falling back to [`Message::Raw`] for
    /// unknown discriminants
    pub fn parse_framed(&self, object: &FramedObject) -> Result<Message, RegistryError> {
        let value: Value =
            serde_json::from_str(&object.raw).map_err(|source| RegistryError::Json {
                line: object.line,
                source,
            })?;

        let message_type = discriminant(&value)
            .ok_or(RegistryError::MissingType { line: object.line })?
            .to_string();

        match self.parse(&message_type, &value, object.line) {
            Err(err) if err.is_unknown_type() => {
                debug!(
                    "MessageRegistry: no parser for '{}', passing through raw",
                    message_type
                );
                Ok(Message::Raw {
                    message_type,
                    data: value,
                })
            }
            other => other,
        }
    }
}

/// The `type` field of a raw object
pub fn discriminant(value: &Value) -> Option<&str> {
    value.get("type").and_then(Value::as_str)
}

fn decode<T: serde::de::DeserializeOwned>(
    message_type: &str,
    raw: &Value,
    line: usize,
) -> Result<T, RegistryError> {
    T::deserialize(raw).map_err(|e| RegistryError::Parse {
        message_type: message_type.to_string(),
        line,
        reason: e.to_string(),
    })
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_default_kinds_registered() {
        let registry = MessageRegistry::with_defaults();

        assert_eq!(registry.registered_types().len(), 9);
        for kind in [
            "user",
            "assistant",
            "system",
            "result",
            "stream_event",
            "tool_progress",
            "auth_status",
            "control_request",
            "control_response",
        ] {
            assert!(registry.has_parser(kind), "missing parser for {kind}");
        }
    }

    #[test]
    fn test_register_and_unregister() {
        let registry = MessageRegistry::empty();
        assert!(!registry.has_parser("rate_limit"));

        registry.register("rate_limit", |raw, _| {
            Ok(Message::Raw {
                message_type: "rate_limit".to_string(),
                data: raw.clone(),
            })
        });
        assert!(registry.has_parser("rate_limit"));

        let message = registry
            .parse("rate_limit", &json!({"type": "rate_limit", "n": 1}), 4)
            .unwrap();
        assert_eq!(message.message_type(), "rate_limit");

        assert!(registry.unregister("rate_limit"));
        assert!(!registry.has_parser("rate_limit"));
        assert!(!registry.unregister("rate_limit"));
    }

    #[test]
    fn test_unknown_type_error() {
        let registry = MessageRegistry::empty();
        let err = registry.parse("mystery", &json!({}), 7).unwrap_err();

        assert!(err.is_unknown_type());
        assert!(err.to_string().contains("line 7"));
    }

    #[test]
    fn test_parse_framed_falls_back_to_raw() {
        let registry = MessageRegistry::with_defaults();
        let object = FramedObject {
            raw: r#"{"type":"mystery","x":1}"#.to_string(),
            line: 1,
        };

        match registry.parse_framed(&object).unwrap() {
            Message::Raw { message_type, data } => {
                assert_eq!(message_type, "mystery");
                assert_eq!(data["x"], 1);
            }
            other => panic!("Expected Raw, got: {other:?}"),
        }
    }

    #[test]
    fn test_parse_framed_result_message() {
        let registry = MessageRegistry::with_defaults();
        let object = FramedObject {
            raw: r#"{"type":"result","subtype":"success","result":"ok","num_turns":2}"#
                .to_string(),
            line: 3,
        };

        match registry.parse_framed(&object).unwrap() {
            Message::Result(result) => {
                assert_eq!(result.result.as_deref(), Some("ok"));
                assert_eq!(result.num_turns, 2);
            }
            other => panic!("Expected Result, got: {other:?}"),
        }
    }

    #[test]
    fn test_parse_framed_missing_type() {
        let registry = MessageRegistry::with_defaults();
        let object = FramedObject {
            raw: r#"{"content":"hi"}"#.to_string(),
            line: 2,
        };

        assert!(matches!(
            registry.parse_framed(&object),
            Err(RegistryError::MissingType { line: 2 })
        ));
    }

    #[test]
    fn test_concurrent_register_and_parse() {
        let registry = Arc::new(MessageRegistry::with_defaults());
        let mut handles = Vec::new();

        for i in 0..8 {
            let registry = Arc::clone(&registry);
            handles.push(std::thread::spawn(move || {
                let kind = format!("custom_{i}");
                for _ in 0..200 {
                    registry.register(&kind, |raw, _| {
                        Ok(Message::Raw {
                            message_type: "custom".to_string(),
                            data: raw.clone(),
                        })
                    });
                    let parsed = registry.parse("user", &json!({"content": "hi"}), 1);
                    assert!(matches!(parsed, Ok(Message::User(_))));
                    assert!(registry.has_parser(&kind));
                    registry.unregister(&kind);
                }
            }));
        }

        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(registry.registered_types().len(), 9);
    }
}
