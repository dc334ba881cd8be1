//! Typed payloads of control responses

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PermissionMode {
    #[default]
    Default,
    AcceptEdits,
    Plan,
    BypassPermissions,
}

impl PermissionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            PermissionMode::Default => "default",
            PermissionMode::AcceptEdits => "acceptEdits",
            PermissionMode::Plan => "plan",
            PermissionMode::BypassPermissions => "bypassPermissions",
        }
    }
}

impl std::fmt::Display for PermissionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for PermissionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "default" => Ok(PermissionMode::Default),
            "acceptEdits" => Ok(PermissionMode::AcceptEdits),
            "plan" => Ok(PermissionMode::Plan),
            "bypassPermissions" => Ok(PermissionMode::BypassPermissions),
            other => Err(format!("unknown permission mode: {other}")),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountInfo {
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub organization: Option<String>,
    #[serde(default)]
    pub subscription_type: Option<String>,
    #[serde(default)]
    pub token_source: Option<String>,
    #[serde(default)]
    pub api_key_source: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelInfo {
    pub value: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SlashCommand {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub argument_hint: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct McpServerStatus {
    pub name: String,
    pub status: String,
    #[serde(default)]
    pub server_info: Option<Value>,
}

/// Decode a list that arrives either bare or under `key`
pub(crate) fn decode_list<T: DeserializeOwned>(
    response: Option<Value>,
    key: &str,
) -> Result<Vec<T>, String> {
    let list = match response {
        None | Some(Value::Null) => return Ok(Vec::new()),
        Some(Value::Array(items)) => Value::Array(items),
        Some(Value::Object(mut map)) => match map.remove(key) {
            Some(list) => list,
            None => return Err(format!("missing '{key}' field")),
        },
        Some(other) => return Err(format!("expected array or object, got {other}")),
    };
    serde_json::from_value(list).map_err(|e| e.to_string())
}

/// Decode an object that arrives either bare or under `key`
pub(crate) fn decode_object<T: DeserializeOwned + Default>(
    response: Option<Value>,
    key: &str,
) -> Result<T, String> {
    match response {
        None | Some(Value::Null) => Ok(T::default()),
        Some(Value::Object(mut map)) => {
            let inner = match map.remove(key) {
                Some(inner) => inner,
                None => Value::Object(map),
            };
            serde_json::from_value(inner).map_err(|e| e.to_string())
        }
        Some(other) => Err(format!("expected object, got {other}")),
    }
}
