//! In-process tool servers
//!
//! The CLI addresses these by name through `mcp_message` control requests.
//! Each request carries one JSON-RPC message; the server's answer goes back
//! wrapped as `{"mcp_response": ...}`.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, RwLock};
use std::time::Instant;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use tracing::{Level, debug, info, warn};

use crate::callbacks::CallbackError;
use crate::callbacks::isolation::run_isolated;
use crate::log_timing;
use crate::protocol::jsonrpc::{
    JsonRpcRequest, error_codes, error_response, method_not_found_response, request_id,
    success_response,
};

/// MCP protocol revision advertised by [`SdkToolServer`]
pub const MCP_PROTOCOL_VERSION: &str = "2024-11-05";

pub const DEFAULT_SERVER_VERSION: &str = "1.0.0";

/// A named server answering JSON-RPC messages in-process
#[async_trait]
pub trait ToolServer: Send + Sync {
    fn name(&self) -> &str;

    fn version(&self) -> &str {
        DEFAULT_SERVER_VERSION
    }

    /// Handle one JSON-RPC message and return the JSON-RPC response
    async fn handle_message(&self, message: Value) -> Result<Value, CallbackError>;
}

/// `--mcp-config` entry announcing an in-process server to the CLI
pub fn sdk_server_config(name: &str) -> Value {
    json!({"type": "sdk", "name": name})
}

// ============================================================================
// Tools
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ToolContent {
    Text {
        text: String,
    },
    Image {
        data: String,
        #[serde(rename = "mimeType")]
        mime_type: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolResult {
    pub content: Vec<ToolContent>,
    #[serde(default)]
    pub is_error: bool,
}

impl ToolResult {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            content: vec![ToolContent::Text { text: text.into() }],
            is_error: false,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            content: vec![ToolContent::Text {
                text: message.into(),
            }],
            is_error: true,
        }
    }
}

#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn call(&self, arguments: Value) -> Result<ToolResult, CallbackError>;
}

#[async_trait]
impl<F, Fut> ToolHandler for F
where
    F: Fn(Value) -> Fut + Send + Sync,
    Fut: Future<Output = Result<ToolResult, CallbackError>> + Send,
{
    async fn call(&self, arguments: Value) -> Result<ToolResult, CallbackError> {
        (self)(arguments).await
    }
}

#[derive(Clone)]
pub struct SdkTool {
    pub name: String,
    pub description: String,
    /// JSON Schema of the arguments object
    pub input_schema: Value,
    pub handler: Arc<dyn ToolHandler>,
}

impl SdkTool {
    pub fn new<H>(
        name: impl Into<String>,
        description: impl Into<String>,
        input_schema: Value,
        handler: H,
    ) -> Self
    where
        H: ToolHandler + 'static,
    {
        Self {
            name: name.into(),
            description: description.into(),
            input_schema,
            handler: Arc::new(handler),
        }
    }

    fn descriptor(&self) -> Value {
        json!({
            "name": self.name,
            "description": self.description,
            "inputSchema": self.input_schema,
        })
    }
}

impl std::fmt::Debug for SdkTool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SdkTool")
            .field("name", &self.name)
            .field("description", &self.description)
            .finish()
    }
}

// ============================================================================
// SdkToolServer
// ============================================================================

/// Tool set answering `initialize`, `tools/list` and `tools/call`
#[derive(Debug, Clone)]
pub struct SdkToolServer {
    name: String,
    version: String,
    tools: Vec<SdkTool>,
}

impl SdkToolServer {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: DEFAULT_SERVER_VERSION.to_string(),
            tools: Vec::new(),
        }
    }

    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    pub fn tool(mut self, tool: SdkTool) -> Self {
        self.tools.push(tool);
        self
    }

    pub fn tool_names(&self) -> Vec<&str> {
        self.tools.iter().map(|t| t.name.as_str()).collect()
    }

    async fn call_tool(&self, id: Value, params: Option<Value>) -> Value {
        let params = params.unwrap_or_else(|| json!({}));
        let Some(tool_name) = params.get("name").and_then(Value::as_str) else {
            return error_response(
                id,
                error_codes::INVALID_PARAMS,
                "Missing tool name".to_string(),
                None,
            )
            .into_value();
        };

        let Some(tool) = self.tools.iter().find(|t| t.name == tool_name) else {
            return error_response(
                id,
                error_codes::INVALID_PARAMS,
                format!("Tool '{tool_name}' not found"),
                None,
            )
            .into_value();
        };

        let arguments = params
            .get("arguments")
            .cloned()
            .unwrap_or_else(|| json!({}));
        let start = Instant::now();
        info!(
            "SdkToolServer({}): executing tool {}",
            self.name, tool_name
        );

        let result = match tool.handler.call(arguments).await {
            Ok(result) => result,
            Err(e) => {
                warn!(
                    "SdkToolServer({}): tool {} failed: {}",
                    self.name, tool_name, e
                );
                ToolResult::error(e.to_string())
            }
        };

        log_timing!(
            Level::DEBUG,
            &format!("call_tool_{tool_name}"),
            start.elapsed()
        );

        match serde_json::to_value(&result) {
            Ok(value) => success_response(id, value).into_value(),
            Err(e) => error_response(id, error_codes::INTERNAL_ERROR, e.to_string(), None)
                .into_value(),
        }
    }
}

#[async_trait]
impl ToolServer for SdkToolServer {
    fn name(&self) -> &str {
        &self.name
    }

    fn version(&self) -> &str {
        &self.version
    }

    async fn handle_message(&self, message: Value) -> Result<Value, CallbackError> {
        let id = request_id(&message);
        let request: JsonRpcRequest = match serde_json::from_value(message) {
            Ok(request) => request,
            Err(e) => {
                return Ok(error_response(
                    id,
                    error_codes::INVALID_REQUEST,
                    format!("Invalid request: {e}"),
                    None,
                )
                .into_value());
            }
        };

        debug!("SdkToolServer({}): {}", self.name, request.method);

        let response = match request.method.as_str() {
            "initialize" => success_response(
                id,
                json!({
                    "protocolVersion": MCP_PROTOCOL_VERSION,
                    "capabilities": {"tools": {}},
                    "serverInfo": {"name": self.name, "version": self.version},
                }),
            )
            .into_value(),
            "notifications/initialized" => success_response(id, json!({})).into_value(),
            "tools/list" => {
                let tools: Vec<Value> = self.tools.iter().map(SdkTool::descriptor).collect();
                success_response(id, json!({"tools": tools})).into_value()
            }
            "tools/call" => self.call_tool(id, request.params).await,
            other => method_not_found_response(id, other).into_value(),
        };

        Ok(response)
    }
}

// ============================================================================
// Router
// ============================================================================

#[derive(Default)]
pub struct ToolServerRouter {
    servers: RwLock<HashMap<String, Arc<dyn ToolServer>>>,
}

impl ToolServerRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `server` under its own name, replacing any previous one
    pub fn register<S>(&self, server: S)
    where
        S: ToolServer + 'static,
    {
        let name = server.name().to_string();
        let mut servers = self.servers.write().unwrap_or_else(|e| e.into_inner());
        if servers.insert(name.clone(), Arc::new(server)).is_some() {
            debug!("ToolServerRouter: replaced server {}", name);
        }
    }

    pub fn unregister(&self, name: &str) -> bool {
        let mut servers = self.servers.write().unwrap_or_else(|e| e.into_inner());
        servers.remove(name).is_some()
    }

    pub fn server_names(&self) -> Vec<String> {
        let servers = self.servers.read().unwrap_or_else(|e| e.into_inner());
        let mut names: Vec<String> = servers.keys().cloned().collect();
        names.sort();
        names
    }

    /// Route one embedded message; the result is the `mcp_message` response
    /// body
    pub async fn route(
        &self,
        server_name: &str,
        message: Value,
        cancel: &CancellationToken,
    ) -> Value {
        let id = request_id(&message);
        let server = {
            let servers = self.servers.read().unwrap_or_else(|e| e.into_inner());
            servers.get(server_name).cloned()
        };

        let response = match server {
            None => {
                warn!("ToolServerRouter: no server named {}", server_name);
                error_response(
                    id,
                    error_codes::METHOD_NOT_FOUND,
                    format!("Server '{server_name}' not found"),
                    None,
                )
                .into_value()
            }
            Some(server) => {
                let label = format!("mcp_message({server_name})");
                match run_isolated(&label, None, cancel, async move {
                    server.handle_message(message).await
                })
                .await
                {
                    Ok(response) => response,
                    Err(e) => error_response(
                        id,
                        error_codes::INTERNAL_ERROR,
                        format!("Server '{server_name}' failed: {e}"),
                        None,
                    )
                    .into_value(),
                }
            }
        };

        json!({"mcp_response": response})
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn calculator() -> SdkToolServer {
        SdkToolServer::new("calc")
            .version("2.1.0")
            .tool(SdkTool::new(
                "add",
                "Add two numbers",
                json!({
                    "type": "object",
                    "properties": {"a": {"type": "number"}, "b": {"type": "number"}}
                }),
                |args: Value| async move {
                    let a = args["a"].as_f64().ok_or("a must be a number")?;
                    let b = args["b"].as_f64().ok_or("b must be a number")?;
                    Ok::<_, CallbackError>(ToolResult::text(format!("{}", a + b)))
                },
            ))
    }

    fn call(id: i64, name: &str, arguments: Value) -> Value {
        json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": "tools/call",
            "params": {"name": name, "arguments": arguments}
        })
    }

    #[tokio::test]
    async fn test_initialize_and_list() {
        let server = calculator();

        let init = server
            .handle_message(json!({
                "jsonrpc": "2.0",
                "id": 1,
                "method": "initialize",
                "params": {}
            }))
            .await
            .unwrap();
        assert_eq!(
            init["result"]["serverInfo"],
            json!({"name": "calc", "version": "2.1.0"})
        );
        assert_eq!(init["result"]["protocolVersion"], MCP_PROTOCOL_VERSION);

        let list = server
            .handle_message(json!({"jsonrpc": "2.0", "id": 2, "method": "tools/list"}))
            .await
            .unwrap();
        assert_eq!(list["id"], 2);
        assert_eq!(list["result"]["tools"][0]["name"], "add");
        assert_eq!(list["result"]["tools"][0]["inputSchema"]["type"], "object");
    }

    #[tokio::test]
    async fn test_tool_call_results() {
        let server = calculator();

        let ok = server
            .handle_message(call(3, "add", json!({"a": 2, "b": 3})))
            .await
            .unwrap();
        assert_eq!(
            ok["result"],
            json!({"content": [{"type": "text", "text": "5"}], "isError": false})
        );

        let failed = server
            .handle_message(call(4, "add", json!({"a": "two"})))
            .await
            .unwrap();
        assert_eq!(failed["result"]["isError"], true);
        assert_eq!(failed["result"]["content"][0]["text"], "a must be a number");

        let unknown = server
            .handle_message(call(5, "multiply", json!({})))
            .await
            .unwrap();
        assert_eq!(unknown["error"]["code"], error_codes::INVALID_PARAMS);
    }

    #[tokio::test]
    async fn test_unknown_method() {
        let server = calculator();

        let response = server
            .handle_message(json!({
                "jsonrpc": "2.0",
                "id": 9,
                "method": "resources/list"
            }))
            .await
            .unwrap();

        assert_eq!(response["error"]["code"], error_codes::METHOD_NOT_FOUND);
    }

    #[tokio::test]
    async fn test_router_wraps_response() {
        let router = ToolServerRouter::new();
        router.register(calculator());
        let cancel = CancellationToken::new();

        let response = router
            .route("calc", call(7, "add", json!({"a": 1, "b": 1})), &cancel)
            .await;

        assert_eq!(response["mcp_response"]["id"], 7);
        assert_eq!(
            response["mcp_response"]["result"]["content"][0]["text"],
            "2"
        );
    }

    #[tokio::test]
    async fn test_router_missing_server() {
        let router = ToolServerRouter::new();
        let cancel = CancellationToken::new();

        let response = router
            .route("nowhere", call(8, "add", json!({})), &cancel)
            .await;

        assert_eq!(response["mcp_response"]["id"], 8);
        assert_eq!(
            response["mcp_response"]["error"]["code"],
            error_codes::METHOD_NOT_FOUND
        );
        assert_eq!(
            response["mcp_response"]["error"]["message"],
            "Server 'nowhere' not found"
        );
    }

    struct Exploding;

    #[async_trait]
    impl ToolServer for Exploding {
        fn name(&self) -> &str {
            "boom"
        }

        async fn handle_message(&self, _message: Value) -> Result<Value, CallbackError> {
            panic!("server state corrupted");
        }
    }

    #[tokio::test]
    async fn test_router_isolates_server_fault() {
        let router = ToolServerRouter::new();
        router.register(Exploding);
        let cancel = CancellationToken::new();

        let response = router.route("boom", call(1, "x", json!({})), &cancel).await;

        assert_eq!(
            response["mcp_response"]["error"]["code"],
            error_codes::INTERNAL_ERROR
        );
        assert!(router.unregister("boom"));
        assert!(router.server_names().is_empty());
    }
}
