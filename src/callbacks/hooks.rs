//! Hook executor
//!
//! Hooks are registered per lifecycle event as matchers: an optional
//! tool-name pattern plus an ordered list of handlers. Firing an event runs
//! every matching handler in registration order and stops at the first one
//! that blocks. Any failure inside a handler counts as a block.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::callbacks::CallbackError;
use crate::callbacks::isolation::run_isolated;
use crate::config::DEFAULT_HOOK_TIMEOUT_SECS;

// ============================================================================
// Events
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HookEvent {
    PreToolUse,
    PostToolUse,
    PostToolUseFailure,
    UserPromptSubmit,
    Stop,
    SubagentStart,
    SubagentStop,
    PreCompact,
    Notification,
    SessionStart,
    SessionEnd,
    PermissionRequest,
}

impl HookEvent {
    pub const ALL: [HookEvent; 12] = [
        HookEvent::PreToolUse,
        HookEvent::PostToolUse,
        HookEvent::PostToolUseFailure,
        HookEvent::UserPromptSubmit,
        HookEvent::Stop,
        HookEvent::SubagentStart,
        HookEvent::SubagentStop,
        HookEvent::PreCompact,
        HookEvent::Notification,
        HookEvent::SessionStart,
        HookEvent::SessionEnd,
        HookEvent::PermissionRequest,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            HookEvent::PreToolUse => "PreToolUse",
            HookEvent::PostToolUse => "PostToolUse",
            HookEvent::PostToolUseFailure => "PostToolUseFailure",
            HookEvent::UserPromptSubmit => "UserPromptSubmit",
            HookEvent::Stop => "Stop",
            HookEvent::SubagentStart => "SubagentStart",
            HookEvent::SubagentStop => "SubagentStop",
            HookEvent::PreCompact => "PreCompact",
            HookEvent::Notification => "Notification",
            HookEvent::SessionStart => "SessionStart",
            HookEvent::SessionEnd => "SessionEnd",
            HookEvent::PermissionRequest => "PermissionRequest",
        }
    }
}

impl std::fmt::Display for HookEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Input and output
// ============================================================================

/// Input handed to a hook handler
///
/// The common fields are typed; event-specific fields (prompt, tool response,
/// trigger, ...) stay in `extra`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HookInput {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hook_event_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transcript_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_input: Option<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl HookInput {
    pub fn new(event: HookEvent) -> Self {
        Self {
            hook_event_name: Some(event.as_str().to_string()),
            ..Default::default()
        }
    }

    pub fn with_tool(mut self, name: impl Into<String>, input: Value) -> Self {
        self.tool_name = Some(name.into());
        self.tool_input = Some(input);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HookDecision {
    Block,
    Approve,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HookOutput {
    #[serde(rename = "continue", default, skip_serializing_if = "Option::is_none")]
    pub continue_: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suppress_output: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decision: Option<HookDecision>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hook_specific_output: Option<Value>,
}

impl HookOutput {
    /// Let the operation continue
    pub fn proceed() -> Self {
        Self {
            continue_: Some(true),
            ..Default::default()
        }
    }

    pub fn block(reason: impl Into<String>) -> Self {
        Self {
            decision: Some(HookDecision::Block),
            reason: Some(reason.into()),
            ..Default::default()
        }
    }

    pub fn approve() -> Self {
        Self {
            decision: Some(HookDecision::Approve),
            ..Default::default()
        }
    }

    /// A block decision or an explicit `continue: false` stops the chain
    pub fn is_blocking(&self) -> bool {
        self.decision == Some(HookDecision::Block) || self.continue_ == Some(false)
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or_else(|_| json!({}))
    }
}

// ============================================================================
// Handlers
// ============================================================================

#[derive(Debug, Clone)]
pub struct HookContext {
    pub tool_use_id: Option<String>,
    /// Cancelled when the session shuts down
    pub cancel: CancellationToken,
}

#[async_trait]
pub trait HookHandler: Send + Sync {
    async fn handle(
        &self,
        input: HookInput,
        context: HookContext,
    ) -> Result<HookOutput, CallbackError>;
}

#[async_trait]
impl<F, Fut> HookHandler for F
where
    F: Fn(HookInput, HookContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<HookOutput, CallbackError>> + Send,
{
    async fn handle(
        &self,
        input: HookInput,
        context: HookContext,
    ) -> Result<HookOutput, CallbackError> {
        (self)(input, context).await
    }
}

/// A tool-name pattern plus the handlers it guards
#[derive(Clone, Default)]
pub struct HookMatcher {
    /// Regular expression matched against the tool name; `None` or empty
    /// matches every invocation
    pub matcher: Option<String>,
    pub hooks: Vec<Arc<dyn HookHandler>>,
    /// Per-handler timeout; the executor default applies when unset
    pub timeout: Option<Duration>,
}

impl std::fmt::Debug for HookMatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HookMatcher")
            .field("matcher", &self.matcher)
            .field("hooks", &self.hooks.len())
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl HookMatcher {
    pub fn new(pattern: impl Into<String>) -> Self {
        Self {
            matcher: Some(pattern.into()),
            ..Default::default()
        }
    }

    pub fn all() -> Self {
        Self::default()
    }

    pub fn hook<H>(mut self, handler: H) -> Self
    where
        H: HookHandler + 'static,
    {
        self.hooks.push(Arc::new(handler));
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

// ============================================================================
// Executor
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum HookError {
    #[error("No hook callback found for ID: {0}")]
    UnknownCallback(String),
}

enum ToolPattern {
    Any,
    Regex(Regex),
    Invalid,
}

impl ToolPattern {
    fn compile(pattern: Option<&str>) -> Self {
        match pattern {
            None | Some("") => ToolPattern::Any,
            Some(p) => match Regex::new(p) {
                Ok(regex) => ToolPattern::Regex(regex),
                Err(e) => {
                    warn!(
                        "HookExecutor: invalid matcher '{}', it will match nothing: {}",
                        p, e
                    );
                    ToolPattern::Invalid
                }
            },
        }
    }

    fn matches(&self, tool_name: Option<&str>) -> bool {
        match self {
            ToolPattern::Any => true,
            ToolPattern::Regex(regex) => tool_name.is_some_and(|name| regex.is_match(name)),
            ToolPattern::Invalid => false,
        }
    }
}

struct RegisteredMatcher {
    pattern: Option<String>,
    compiled: ToolPattern,
    callback_ids: Vec<String>,
    timeout: Option<Duration>,
}

struct RegisteredHook {
    handler: Arc<dyn HookHandler>,
    timeout: Option<Duration>,
}

pub struct HookExecutor {
    table: RwLock<HashMap<HookEvent, Vec<RegisteredMatcher>>>,
    callbacks: RwLock<HashMap<String, RegisteredHook>>,
    next_id: AtomicU64,
    default_timeout: Duration,
}

impl Default for HookExecutor {
    fn default() -> Self {
        Self::new(Duration::from_secs(DEFAULT_HOOK_TIMEOUT_SECS))
    }
}

impl HookExecutor {
    pub fn new(default_timeout: Duration) -> Self {
        Self {
            table: RwLock::new(HashMap::new()),
            callbacks: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(0),
            default_timeout,
        }
    }

    /// Register a matcher for `event`, returning the callback id assigned to
    /// each of its handlers
    pub fn register(&self, event: HookEvent, matcher: HookMatcher) -> Vec<String> {
        let compiled = ToolPattern::compile(matcher.matcher.as_deref());
        let mut callback_ids = Vec::with_capacity(matcher.hooks.len());

        {
            let mut callbacks = self.callbacks.write().unwrap_or_else(|e| e.into_inner());
            for handler in matcher.hooks {
                let id = format!("hook_{}", self.next_id.fetch_add(1, Ordering::Relaxed));
                callbacks.insert(
                    id.clone(),
                    RegisteredHook {
                        handler,
                        timeout: matcher.timeout,
                    },
                );
                callback_ids.push(id);
            }
        }

        debug!(
            "HookExecutor: registered {} handler(s) for {} (matcher: {:?})",
            callback_ids.len(),
            event,
            matcher.matcher
        );

        let mut table = self.table.write().unwrap_or_else(|e| e.into_inner());
        table.entry(event).or_default().push(RegisteredMatcher {
            pattern: matcher.matcher,
            compiled,
            callback_ids: callback_ids.clone(),
            timeout: matcher.timeout,
        });

        callback_ids
    }

    pub fn has_hooks(&self, event: HookEvent) -> bool {
        let table = self.table.read().unwrap_or_else(|e| e.into_inner());
        table
            .get(&event)
            .is_some_and(|matchers| !matchers.is_empty())
    }

    pub fn is_empty(&self) -> bool {
        let table = self.table.read().unwrap_or_else(|e| e.into_inner());
        table.values().all(Vec::is_empty)
    }

    /// Fire `event`, running every matching handler in registration order
    ///
    /// Returns the first blocking output, otherwise the last handler's output,
    /// otherwise `continue`.
    pub async fn execute(
        &self,
        event: HookEvent,
        input: HookInput,
        tool_name: Option<&str>,
        tool_use_id: Option<String>,
        cancel: &CancellationToken,
    ) -> HookOutput {
        let selected = self.select(event, tool_name);
        if selected.is_empty() {
            trace!("HookExecutor: no hooks for {} ({:?})", event, tool_name);
            return HookOutput::proceed();
        }

        let mut last = HookOutput::proceed();
        for (id, hook) in selected {
            let output = self
                .run_one(&id, hook, input.clone(), tool_use_id.clone(), cancel)
                .await;
            if output.is_blocking() {
                debug!(
                    "HookExecutor: {} blocked {} ({:?})",
                    id, event, output.reason
                );
                return output;
            }
            last = output;
        }
        last
    }

    /// Run the single handler behind a wire callback id
    pub async fn execute_callback(
        &self,
        callback_id: &str,
        input: Value,
        tool_use_id: Option<String>,
        cancel: &CancellationToken,
    ) -> Result<HookOutput, HookError> {
        let hook = {
            let callbacks = self.callbacks.read().unwrap_or_else(|e| e.into_inner());
            callbacks
                .get(callback_id)
                .map(|registered| (Arc::clone(&registered.handler), registered.timeout))
                .ok_or_else(|| HookError::UnknownCallback(callback_id.to_string()))?
        };

        let input = match serde_json::from_value::<HookInput>(input) {
            Ok(input) => input,
            Err(e) => {
                warn!("HookExecutor: malformed input for {}: {}", callback_id, e);
                return Ok(HookOutput::block(format!("Invalid hook input: {e}")));
            }
        };

        Ok(self
            .run_one(callback_id, hook, input, tool_use_id, cancel)
            .await)
    }

    /// Hook configuration sent in the `initialize` request
    pub fn wire_config(&self) -> Option<Value> {
        let table = self.table.read().unwrap_or_else(|e| e.into_inner());
        let mut config = Map::new();

        for event in HookEvent::ALL {
            let Some(matchers) = table.get(&event) else {
                continue;
            };
            if matchers.is_empty() {
                continue;
            }
            let entries: Vec<Value> = matchers
                .iter()
                .map(|m| {
                    let mut entry = json!({
                        "matcher": m.pattern,
                        "hookCallbackIds": m.callback_ids,
                    });
                    if let Some(timeout) = m.timeout {
                        entry["timeout"] = json!(timeout.as_secs_f64());
                    }
                    entry
                })
                .collect();
            config.insert(event.as_str().to_string(), Value::Array(entries));
        }

        if config.is_empty() {
            None
        } else {
            Some(Value::Object(config))
        }
    }

    fn select(
        &self,
        event: HookEvent,
        tool_name: Option<&str>,
    ) -> Vec<(String, (Arc<dyn HookHandler>, Option<Duration>))> {
        let table = self.table.read().unwrap_or_else(|e| e.into_inner());
        let callbacks = self.callbacks.read().unwrap_or_else(|e| e.into_inner());

        table
            .get(&event)
            .into_iter()
            .flatten()
            .filter(|m| m.compiled.matches(tool_name))
            .flat_map(|m| m.callback_ids.iter())
            .filter_map(|id| {
                callbacks
                    .get(id)
                    .map(|r| (id.clone(), (Arc::clone(&r.handler), r.timeout)))
            })
            .collect()
    }

    async fn run_one(
        &self,
        id: &str,
        (handler, timeout): (Arc<dyn HookHandler>, Option<Duration>),
        input: HookInput,
        tool_use_id: Option<String>,
        cancel: &CancellationToken,
    ) -> HookOutput {
        let limit = timeout.unwrap_or(self.default_timeout);
        let context = HookContext {
            tool_use_id,
            cancel: cancel.child_token(),
        };

        let result = run_isolated(id, Some(limit), cancel, async move {
            handler.handle(input, context).await
        })
        .await;

        match result {
            Ok(output) => output,
            Err(e) => {
                warn!("HookExecutor: {} failed, blocking: {}", id, e);
                HookOutput::block(format!("Hook {id} failed: {e}"))
            }
        }
    }
}
