//! Process management layer
//!
//! Builds the CLI command line and environment, spawns the child, monitors
//! its stderr and stops it. Reading stdout and writing stdin belong to the
//! transport.

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, LazyLock, Mutex};
use std::time::Duration;

use regex::Regex;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::config::{SDK_ENTRYPOINT, SessionMode, StderrCallback, ToolsOption, TransportConfig};
use crate::io::transport::TransportError;

// ============================================================================
// Process State Management
// ============================================================================

/// How to stop a process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopMode {
    /// SIGTERM, then SIGKILL once the grace period elapses
    Graceful,
    /// SIGKILL immediately
    Force,
}

/// Process lifecycle states
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessState {
    Running { pid: u32 },
    Exited { code: Option<i32> },
    Stopped,
}

impl ProcessState {
    pub fn pid(&self) -> Option<u32> {
        match self {
            ProcessState::Running { pid } => Some(*pid),
            _ => None,
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(self, ProcessState::Running { .. })
    }
}

// ============================================================================
// Command Line
// ============================================================================

static ENV_KEY_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Z_][A-Z0-9_]*$").expect("Failed to compile env key pattern"));

/// Drop environment entries that could not be passed safely
///
/// Keys must look like `UPPER_SNAKE`; values must not contain newline,
/// carriage return or NUL. Offending entries are removed, never escaped.
pub fn filter_env(env: &HashMap<String, String>) -> HashMap<String, String> {
    env.iter()
        .filter(|(key, value)| {
            let keep = ENV_KEY_PATTERN.is_match(key)
                && !value.contains(['\n', '\r', '\0']);
            if !keep {
                debug!(
                    "CliProcess: dropping environment entry '{}'",
                    key.escape_debug()
                );
            }
            keep
        })
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

/// Arguments for the configured session mode
pub fn build_args(config: &TransportConfig) -> Vec<String> {
    let mut args: Vec<String> = Vec::new();

    match &config.mode {
        SessionMode::Interactive => {
            args.extend(
                [
                    "--output-format",
                    "stream-json",
                    "--verbose",
                    "--input-format",
                    "stream-json",
                ]
                .map(String::from),
            );
        }
        SessionMode::OneShot { .. } => {
            let flags = ["--print", "--output-format", "stream-json", "--verbose"];
            args.extend(flags.map(String::from));
        }
    }

    let mut flag = |name: &str, value: String| {
        args.push(name.to_string());
        args.push(value);
    };

    if let Some(model) = &config.model {
        flag("--model", model.clone());
    }
    if let Some(prompt) = &config.system_prompt {
        flag("--system-prompt", prompt.clone());
    }
    if let Some(prompt) = &config.append_system_prompt {
        flag("--append-system-prompt", prompt.clone());
    }
    if !config.allowed_tools.is_empty() {
        flag("--allowedTools", config.allowed_tools.join(","));
    }
    if !config.disallowed_tools.is_empty() {
        flag("--disallowedTools", config.disallowed_tools.join(","));
    }
    match &config.tools {
        Some(ToolsOption::List(tools)) => flag("--tools", tools.join(",")),
        Some(ToolsOption::Preset(preset)) => flag("--tools", preset.clone()),
        None => {}
    }
    if let Some(mode) = config.permission_mode {
        flag("--permission-mode", mode.as_str().to_string());
    }
    if let Some(tool) = &config.permission_prompt_tool {
        flag("--permission-prompt-tool", tool.clone());
    }
    if let Some(turns) = config.max_turns {
        flag("--max-turns", turns.to_string());
    }
    if let Some(session) = &config.resume {
        flag("--resume", session.clone());
    }
    if !config.mcp_servers.is_empty() {
        let servers = serde_json::json!({ "mcpServers": config.mcp_servers });
        flag("--mcp-config", servers.to_string());
    }

    if config.continue_conversation {
        args.push("--continue".to_string());
    }
    if config.include_partial_messages {
        args.push("--include-partial-messages".to_string());
    }
    args.extend(config.extra_args.iter().cloned());

    if let SessionMode::OneShot { prompt } = &config.mode {
        args.push("--".to_string());
        args.push(prompt.clone());
    }

    args
}

// ============================================================================
// Child Process
// ============================================================================

/// Pipes taken from a freshly spawned child
#[derive(Debug)]
pub struct ProcessPipes {
    /// `None` in one-shot mode
    pub stdin: Option<ChildStdin>,
    pub stdout: ChildStdout,
    pub stderr: ChildStderr,
}

/// A running CLI child process
#[derive(Debug)]
pub struct CliProcess {
    command: PathBuf,
    child: Option<Child>,
    state: Arc<Mutex<ProcessState>>,
}

impl CliProcess {
    /// Spawn the CLI described by `config` and take its pipes
    pub fn spawn(config: &TransportConfig) -> Result<(Self, ProcessPipes), TransportError> {
        let args = build_args(config);
        info!("Starting process: {} {:?}", config.cli_path.display(), args);

        let mut command = Command::new(&config.cli_path);
        command
            .args(&args)
            .envs(filter_env(&config.env))
            .env("CLAUDE_CODE_ENTRYPOINT", SDK_ENTRYPOINT)
            .stdin(if config.mode.is_interactive() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(dir) = &config.working_directory {
            command.current_dir(dir);
        }

        let mut child = command.spawn().map_err(|source| TransportError::Spawn {
            path: config.cli_path.clone(),
            source,
        })?;

        let pid = child
            .id()
            .ok_or_else(|| TransportError::Process("child exited before reporting a PID".into()))?;
        info!("Process started with PID: {}", pid);

        let stdin = child.stdin.take();
        if config.mode.is_interactive() && stdin.is_none() {
            return Err(TransportError::PipeUnavailable("stdin"));
        }
        let stdout = child
            .stdout
            .take()
            .ok_or(TransportError::PipeUnavailable("stdout"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or(TransportError::PipeUnavailable("stderr"))?;

        let process = Self {
            command: config.cli_path.clone(),
            child: Some(child),
            state: Arc::new(Mutex::new(ProcessState::Running { pid })),
        };

        Ok((
            process,
            ProcessPipes {
                stdin,
                stdout,
                stderr,
            },
        ))
    }

    pub fn state(&self) -> ProcessState {
        self.state
            .lock()
            .map(|s| s.clone())
            .unwrap_or(ProcessState::Stopped)
    }

    pub fn pid(&self) -> Option<u32> {
        self.state().pid()
    }

    /// Whether the child is still running; reaps it if it already exited
    pub fn is_running(&mut self) -> bool {
        if let Some(child) = self.child.as_mut()
            && let Ok(Some(status)) = child.try_wait()
        {
            debug!(
                "CliProcess: {} exited with {}",
                self.command.display(),
                status
            );
            self.set_state(ProcessState::Exited {
                code: status.code(),
            });
            self.child = None;
        }
        self.state().is_running()
    }

    /// Stop the child and reap it
    ///
    /// Graceful mode sends SIGTERM and waits up to `grace` before killing.
    pub async fn stop(&mut self, mode: StopMode, grace: Duration) -> Result<(), TransportError> {
        let Some(mut child) = self.child.take() else {
            return Ok(());
        };

        if let Ok(Some(status)) = child.try_wait() {
            debug!("CliProcess: already exited with {}", status);
            self.set_state(ProcessState::Exited {
                code: status.code(),
            });
            return Ok(());
        }

        let pid = self.pid();
        if mode == StopMode::Graceful {
            if let Some(pid) = pid {
                info!("Gracefully stopping process with PID: {}", pid);
                send_terminate(pid);
            }
            match tokio::time::timeout(grace, child.wait()).await {
                Ok(Ok(status)) => {
                    info!("Process PID {:?} exited with status: {}", pid, status);
                    self.set_state(ProcessState::Exited {
                        code: status.code(),
                    });
                    return Ok(());
                }
                Ok(Err(e)) => warn!("Error waiting for child process: {}", e),
                Err(_) => warn!(
                    "Process PID {:?} did not exit within {:?}, killing",
                    pid, grace
                ),
            }
        }

        info!("Force killing process with PID: {:?}", pid);
        if let Err(e) = child.kill().await {
            error!("Failed to kill process {:?}: {}", pid, e);
            self.set_state(ProcessState::Stopped);
            return Err(TransportError::Io(e));
        }
        self.set_state(ProcessState::Stopped);
        Ok(())
    }

    /// Synchronous kill for `Drop` paths
    pub fn kill_sync(&mut self) {
        if let Some(mut child) = self.child.take() {
            if let Err(e) = child.start_kill() {
                trace!("CliProcess: start_kill failed: {}", e);
            }
            self.set_state(ProcessState::Stopped);
        }
    }

    fn set_state(&self, state: ProcessState) {
        if let Ok(mut current) = self.state.lock() {
            *current = state;
        }
    }
}

impl Drop for CliProcess {
    fn drop(&mut self) {
        self.kill_sync();
    }
}

#[cfg(unix)]
fn send_terminate(pid: u32) {
    // SAFETY: kill(2) has no memory-safety preconditions.
    let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
    if rc == 0 {
        info!("Sent SIGTERM to process {}", pid);
    } else {
        debug!("SIGTERM to process {} failed", pid);
    }
}

#[cfg(not(unix))]
fn send_terminate(pid: u32) {
    warn!(
        "Graceful termination unsupported on this platform, PID {} will be killed",
        pid
    );
}

// ============================================================================
// Stderr Monitoring
// ============================================================================

/// Drain stderr line by line until EOF or cancellation
///
/// Lines go to `callback` when one is installed; a panicking callback is
/// logged and monitoring continues. Without a callback each line becomes a
/// [`TransportError::Stderr`] on the error queue. A full error queue drops
/// the line so that the child can never block on stderr. The queue is held
/// weakly: its lifetime belongs to the stdout loop.
pub fn spawn_stderr_monitor(
    stderr: ChildStderr,
    callback: Option<StderrCallback>,
    errors: mpsc::WeakSender<TransportError>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut reader = BufReader::new(stderr);
        let mut line = String::new();

        trace!(
            "CliProcess: Starting stderr monitoring (callback: {})",
            if callback.is_some() {
                "installed"
            } else {
                "error queue"
            }
        );

        loop {
            line.clear();
            let read = tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                read = reader.read_line(&mut line) => read,
            };

            match read {
                Ok(0) => {
                    trace!("CliProcess: stderr EOF reached");
                    break;
                }
                Ok(_) => {
                    let content = line.trim_end().to_string();
                    if content.is_empty() {
                        continue;
                    }
                    match &callback {
                        Some(callback) => {
                            let callback = Arc::clone(callback);
                            if catch_unwind(AssertUnwindSafe(move || callback(content))).is_err() {
                                warn!("CliProcess: stderr callback panicked");
                            }
                        }
                        None => match errors.upgrade() {
                            Some(errors) => {
                                if errors.try_send(TransportError::Stderr(content)).is_err() {
                                    trace!("CliProcess: error queue full, dropping stderr line");
                                }
                            }
                            None => trace!("CliProcess: error queue closed, dropping stderr line"),
                        },
                    }
                }
                Err(e) => {
                    error!("Failed to read from stderr: {}", e);
                    break;
                }
            }
        }

        trace!("CliProcess: stderr monitoring finished");
    })
}

// ============================================================================
// Tests
// ============================================================================
