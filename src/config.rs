//! Configuration for the subprocess transport and control protocol
//!
//! `TransportConfig` describes how to launch the CLI and how the transport
//! behaves once it is running; it is assembled through
//! `TransportConfigBuilder`, which validates before handing out a config.
//! `ControlConfig` carries the control protocol's deadlines.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use crate::control::types::PermissionMode;
use crate::io::framing::DEFAULT_MAX_BUFFER_SIZE;
use crate::io::retry::RetryPolicy;

// ============================================================================
// Configuration Constants
// ============================================================================

/// Executable looked up on `PATH` when no CLI path is given
pub const DEFAULT_CLI_PATH: &str = "claude";

/// Capacity of the message and error queues
pub const DEFAULT_QUEUE_CAPACITY: usize = 100;

/// Time `close()` waits for the reader loops before killing the process
pub const DEFAULT_CLOSE_GRACE_SECS: u64 = 5;

/// Deadline for ordinary outbound control requests
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 60;

/// Deadline for the `initialize` handshake
pub const DEFAULT_INITIALIZE_TIMEOUT_SECS: u64 = 60;

/// Deadline for a single hook handler when its matcher sets none
pub const DEFAULT_HOOK_TIMEOUT_SECS: u64 = 60;

/// Value exported to the child as `CLAUDE_CODE_ENTRYPOINT`
pub const SDK_ENTRYPOINT: &str = "sdk-rust";

/// Callback receiving each non-empty stderr line of the child
pub type StderrCallback = Arc<dyn Fn(String) + Send + Sync>;

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("CLI path must not be empty")]
    EmptyCliPath,

    #[error("One-shot mode requires a non-empty prompt")]
    EmptyPrompt,

    #[error("Invalid {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
}

impl ConfigError {
    fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            field,
            reason: reason.into(),
        }
    }
}

// ============================================================================
// Core Configuration Types
// ============================================================================

/// How the CLI is driven
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SessionMode {
    /// Stream-json on both stdin and stdout; supports the control protocol
    #[default]
    Interactive,
    /// Print mode: a single prompt on the command line and no stdin
    OneShot { prompt: String },
}

impl SessionMode {
    pub fn is_interactive(&self) -> bool {
        matches!(self, SessionMode::Interactive)
    }
}

/// Base tool set offered to the model
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolsOption {
    /// Explicit list of tool names (may be empty to disable all tools)
    List(Vec<String>),
    /// Named preset understood by the CLI, e.g. `default`
    Preset(String),
}

/// Complete transport configuration
#[derive(Clone)]
pub struct TransportConfig {
    pub cli_path: PathBuf,
    pub mode: SessionMode,
    pub model: Option<String>,
    pub system_prompt: Option<String>,
    pub append_system_prompt: Option<String>,
    pub allowed_tools: Vec<String>,
    pub disallowed_tools: Vec<String>,
    pub tools: Option<ToolsOption>,
    pub permission_mode: Option<PermissionMode>,
    pub permission_prompt_tool: Option<String>,
    pub max_turns: Option<u32>,
    pub resume: Option<String>,
    pub continue_conversation: bool,
    pub include_partial_messages: bool,
    /// Server name to MCP server config, passed as `--mcp-config`
    pub mcp_servers: HashMap<String, Value>,
    pub working_directory: Option<PathBuf>,
    /// Extra child environment; filtered before use
    pub env: HashMap<String, String>,
    /// Additional CLI flags appended verbatim
    pub extra_args: Vec<String>,
    pub max_buffer_size: usize,
    pub queue_capacity: usize,
    pub retry: RetryPolicy,
    pub close_grace_period: Duration,
    pub stderr_callback: Option<StderrCallback>,
}

impl std::fmt::Debug for TransportConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportConfig")
            .field("cli_path", &self.cli_path)
            .field("mode", &self.mode)
            .field("model", &self.model)
            .field("allowed_tools", &self.allowed_tools)
            .field("disallowed_tools", &self.disallowed_tools)
            .field("tools", &self.tools)
            .field("permission_mode", &self.permission_mode)
            .field("mcp_servers", &self.mcp_servers.keys().collect::<Vec<_>>())
            .field("working_directory", &self.working_directory)
            .field("extra_args", &self.extra_args)
            .field("max_buffer_size", &self.max_buffer_size)
            .field("queue_capacity", &self.queue_capacity)
            .field("retry", &self.retry)
            .field("close_grace_period", &self.close_grace_period)
            .field(
                "stderr_callback",
                &self.stderr_callback.as_ref().map(|_| "Fn(String)"),
            )
            .finish()
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            cli_path: PathBuf::from(DEFAULT_CLI_PATH),
            mode: SessionMode::Interactive,
            model: None,
            system_prompt: None,
            append_system_prompt: None,
            allowed_tools: Vec::new(),
            disallowed_tools: Vec::new(),
            tools: None,
            permission_mode: None,
            permission_prompt_tool: None,
            max_turns: None,
            resume: None,
            continue_conversation: false,
            include_partial_messages: false,
            mcp_servers: HashMap::new(),
            working_directory: None,
            env: HashMap::new(),
            extra_args: Vec::new(),
            max_buffer_size: DEFAULT_MAX_BUFFER_SIZE,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            retry: RetryPolicy::default(),
            close_grace_period: Duration::from_secs(DEFAULT_CLOSE_GRACE_SECS),
            stderr_callback: None,
        }
    }
}

impl TransportConfig {
    pub fn builder() -> TransportConfigBuilder {
        TransportConfigBuilder::new()
    }

    /// Check invariants the transport relies on
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cli_path.as_os_str().is_empty() {
            return Err(ConfigError::EmptyCliPath);
        }
        if let SessionMode::OneShot { prompt } = &self.mode
            && prompt.trim().is_empty()
        {
            return Err(ConfigError::EmptyPrompt);
        }
        if self.max_buffer_size == 0 {
            return Err(ConfigError::invalid("max_buffer_size", "must be positive"));
        }
        if self.queue_capacity == 0 {
            return Err(ConfigError::invalid("queue_capacity", "must be positive"));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::invalid(
                "retry.max_attempts",
                "at least one attempt is required",
            ));
        }
        if !(0.0..=1.0).contains(&self.retry.jitter) {
            return Err(ConfigError::invalid(
                "retry.jitter",
                format!("{} is outside 0.0..=1.0", self.retry.jitter),
            ));
        }
        Ok(())
    }
}

// ============================================================================
// Configuration Builder
// ============================================================================

/// Builder for [`TransportConfig`]
#[derive(Default)]
pub struct TransportConfigBuilder {
    config: TransportConfig,
}

impl TransportConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cli_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.cli_path = path.into();
        self
    }

    /// Switch to one-shot print mode with the given prompt
    pub fn one_shot(mut self, prompt: impl Into<String>) -> Self {
        self.config.mode = SessionMode::OneShot {
            prompt: prompt.into(),
        };
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.config.model = Some(model.into());
        self
    }

    pub fn system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.config.system_prompt = Some(prompt.into());
        self
    }

    pub fn append_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.config.append_system_prompt = Some(prompt.into());
        self
    }

    pub fn allowed_tools(mut self, tools: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.config
            .allowed_tools
            .extend(tools.into_iter().map(Into::into));
        self
    }

    pub fn disallowed_tools(mut self, tools: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.config
            .disallowed_tools
            .extend(tools.into_iter().map(Into::into));
        self
    }

    pub fn tools(mut self, tools: ToolsOption) -> Self {
        self.config.tools = Some(tools);
        self
    }

    pub fn permission_mode(mut self, mode: PermissionMode) -> Self {
        self.config.permission_mode = Some(mode);
        self
    }

    pub fn permission_prompt_tool(mut self, name: impl Into<String>) -> Self {
        self.config.permission_prompt_tool = Some(name.into());
        self
    }

    pub fn max_turns(mut self, turns: u32) -> Self {
        self.config.max_turns = Some(turns);
        self
    }

    pub fn resume(mut self, session_id: impl Into<String>) -> Self {
        self.config.resume = Some(session_id.into());
        self
    }

    pub fn continue_conversation(mut self, enabled: bool) -> Self {
        self.config.continue_conversation = enabled;
        self
    }

    pub fn include_partial_messages(mut self, enabled: bool) -> Self {
        self.config.include_partial_messages = enabled;
        self
    }

    /// Add an MCP server entry for `--mcp-config`
    pub fn mcp_server(mut self, name: impl Into<String>, config: Value) -> Self {
        self.config.mcp_servers.insert(name.into(), config);
        self
    }

    pub fn working_directory(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.working_directory = Some(path.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.config.env.insert(key.into(), value.into());
        self
    }

    pub fn add_arg(mut self, arg: impl Into<String>) -> Self {
        self.config.extra_args.push(arg.into());
        self
    }

    pub fn max_buffer_size(mut self, bytes: usize) -> Self {
        self.config.max_buffer_size = bytes;
        self
    }

    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.config.queue_capacity = capacity;
        self
    }

    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.config.retry = policy;
        self
    }

    pub fn close_grace_period(mut self, grace: Duration) -> Self {
        self.config.close_grace_period = grace;
        self
    }

    /// Set the handler for stderr lines; without one, lines go to the error
    /// queue
    pub fn stderr_callback<F>(mut self, callback: F) -> Self
    where
        F: Fn(String) + Send + Sync + 'static,
    {
        self.config.stderr_callback = Some(Arc::new(callback));
        self
    }

    /// Build the configuration with validation
    pub fn build(self) -> Result<TransportConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

// ============================================================================
// Control Protocol Configuration
// ============================================================================

#[derive(Debug, Clone)]
pub struct ControlConfig {
    pub request_timeout: Duration,
    pub initialize_timeout: Duration,
    pub default_hook_timeout: Duration,
    /// Deadline for the permission callback; `None` waits indefinitely
    pub permission_timeout: Option<Duration>,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
            initialize_timeout: Duration::from_secs(DEFAULT_INITIALIZE_TIMEOUT_SECS),
            default_hook_timeout: Duration::from_secs(DEFAULT_HOOK_TIMEOUT_SECS),
            permission_timeout: None,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = TransportConfig::default();

        assert_eq!(config.cli_path, PathBuf::from("claude"));
        assert!(config.mode.is_interactive());
        assert_eq!(config.max_buffer_size, 10 * 1024 * 1024);
        assert_eq!(config.queue_capacity, 100);
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.close_grace_period, Duration::from_secs(5));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder_sets_fields() {
        let config = TransportConfig::builder()
            .cli_path("/opt/cli")
            .model("m-1")
            .allowed_tools(["Read", "Grep"])
            .env("FOO", "bar")
            .queue_capacity(4)
            .build()
            .unwrap();

        assert_eq!(config.cli_path, PathBuf::from("/opt/cli"));
        assert_eq!(config.model.as_deref(), Some("m-1"));
        assert_eq!(config.allowed_tools, vec!["Read", "Grep"]);
        assert_eq!(config.env.get("FOO").map(String::as_str), Some("bar"));
        assert_eq!(config.queue_capacity, 4);
    }

    #[test]
    fn test_validation_failures() {
        assert_eq!(
            TransportConfig::builder().cli_path("").build().unwrap_err(),
            ConfigError::EmptyCliPath
        );
        assert_eq!(
            TransportConfig::builder()
                .one_shot("  ")
                .build()
                .unwrap_err(),
            ConfigError::EmptyPrompt
        );
        assert!(matches!(
            TransportConfig::builder().queue_capacity(0).build(),
            Err(ConfigError::InvalidValue {
                field: "queue_capacity",
                ..
            })
        ));
        assert!(matches!(
            TransportConfig::builder().max_buffer_size(0).build(),
            Err(ConfigError::InvalidValue {
                field: "max_buffer_size",
                ..
            })
        ));
    }

    #[test]
    fn test_debug_hides_callback() {
        let config = TransportConfig::builder()
            .stderr_callback(|_| {})
            .build()
            .unwrap();
        let rendered = format!("{config:?}");

        assert!(rendered.contains("Fn(String)"));
    }
}
