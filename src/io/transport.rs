//! Transport layer - the CLI subprocess as a message channel
//!
//! `SubprocessTransport` owns the child process and its pipes. Two reader
//! tasks run for the life of a connection:
//!
//! - the stdout loop frames and parses objects, hands control envelopes to
//!   an attached [`ControlRouter`] and everything else to the message queue;
//! - the stderr loop forwards lines to a callback or the error queue.
//!
//! Writes go through a cloneable [`StdinWriter`] so that the control protocol
//! can share the write path. One [`CancellationToken`] is shared between the
//! reader loops and the control protocol; cancelling it unblocks all of them.

use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{ChildStdin, ChildStdout};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::config::{ConfigError, TransportConfig};
use crate::io::framing::{FramedObject, FramingError, JsonObjectFramer};
use crate::io::process::{CliProcess, StopMode, spawn_stderr_monitor};
use crate::io::retry::retry_with_backoff;
use crate::protocol::message::Message;
use crate::protocol::registry::{MessageRegistry, RegistryError};

// ============================================================================
// Constants
// ============================================================================

/// Size of the read buffer for stdout reading operations
const READ_BUFFER_SIZE: usize = 8192;

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Failed to start '{path}': {source}")]
    Spawn {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Process error: {0}")]
    Process(String),

    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Transport is not connected")]
    NotConnected,

    #[error("Transport is already connected")]
    AlreadyConnected,

    #[error("Transport is closed")]
    Closed,

    #[error("{0} pipe not available")]
    PipeUnavailable(&'static str),

    #[error("Framing error: {0}")]
    Framing(#[from] FramingError),

    #[error("Parse error: {0}")]
    Parse(#[from] RegistryError),

    #[error("CLI stderr: {0}")]
    Stderr(String),

    #[error("Failed to connect after {attempts} attempts: {last}")]
    ConnectFailed {
        attempts: u32,
        last: Box<TransportError>,
    },

    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl TransportError {
    /// Whether retrying the failed operation may succeed
    pub fn is_transient(&self) -> bool {
        match self {
            TransportError::Io(e) | TransportError::Spawn { source: e, .. } => {
                matches!(
                    e.kind(),
                    io::ErrorKind::ConnectionRefused
                        | io::ErrorKind::ConnectionReset
                        | io::ErrorKind::BrokenPipe
                        | io::ErrorKind::TimedOut
                        | io::ErrorKind::UnexpectedEof
                )
            }
            TransportError::Process(_) | TransportError::Timeout(_) => true,
            _ => false,
        }
    }
}

// ============================================================================
// Traits
// ============================================================================

/// Write half shared between the transport's owner and the control protocol
#[async_trait]
pub trait MessageWriter: Send + Sync {
    /// Write one serialised object followed by a newline
    async fn write_line(&self, line: &str) -> Result<(), TransportError>;
}

/// Receives control envelopes from the stdout loop
///
/// `route` runs on the reader task and must not block; implementations
/// spawn work for anything that may wait.
pub trait ControlRouter: Send + Sync {
    fn route(&self, message: Message);

    /// Called once when the output stream ends
    fn on_stream_closed(&self);
}

/// Core transport trait for the CLI channel
#[async_trait]
pub trait Transport: Send + Sync {
    /// Start the process (with retry) and the reader loops
    async fn connect(&mut self) -> Result<(), TransportError>;

    /// Write one serialised object
    async fn write(&self, line: &str) -> Result<(), TransportError>;

    /// Receiver for conversational messages; `None` once taken
    fn take_messages(&mut self) -> Option<mpsc::Receiver<Message>>;

    /// Receiver for asynchronous errors; `None` once taken
    fn take_errors(&mut self) -> Option<mpsc::Receiver<TransportError>>;

    /// Close stdin to signal end of input
    async fn end_input(&self) -> Result<(), TransportError>;

    /// Shut down; idempotent
    async fn close(&mut self) -> Result<(), TransportError>;

    fn is_connected(&self) -> bool;
}

// ============================================================================
// Stdin Writer
// ============================================================================

/// Serialised writer over the child's stdin
#[derive(Clone, Default)]
pub struct StdinWriter {
    stdin: Arc<Mutex<Option<ChildStdin>>>,
    connected: Arc<AtomicBool>,
}

impl std::fmt::Debug for StdinWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StdinWriter")
            .field("connected", &self.connected.load(Ordering::SeqCst))
            .finish()
    }
}

impl StdinWriter {
    async fn attach(&self, stdin: Option<ChildStdin>) {
        *self.stdin.lock().await = stdin;
    }

    /// Drop stdin; the child sees end-of-input
    async fn close(&self) {
        if let Some(mut stdin) = self.stdin.lock().await.take() {
            if let Err(e) = stdin.shutdown().await {
                trace!("StdinWriter: shutdown failed: {}", e);
            }
            debug!("StdinWriter: stdin closed");
        }
    }
}

#[async_trait]
impl MessageWriter for StdinWriter {
    async fn write_line(&self, line: &str) -> Result<(), TransportError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(TransportError::NotConnected);
        }

        let mut guard = self.stdin.lock().await;
        let stdin = guard
            .as_mut()
            .ok_or(TransportError::PipeUnavailable("stdin"))?;

        trace!("StdinWriter: Writing message (length: {})", line.len());
        stdin.write_all(line.as_bytes()).await?;
        if !line.ends_with('\n') {
            stdin.write_all(b"\n").await?;
        }
        stdin.flush().await?;
        Ok(())
    }
}

// ============================================================================
// Stdout Reader Loop
// ============================================================================

type RouterSlot = Arc<RwLock<Option<Arc<dyn ControlRouter>>>>;

/// Everything the stdout loop owns
///
/// This loop holds the only strong senders of both queues, so the queues
/// close exactly when it exits.
struct StdoutReader {
    registry: Arc<MessageRegistry>,
    router: RouterSlot,
    messages: mpsc::Sender<Message>,
    errors: mpsc::Sender<TransportError>,
    cancel: CancellationToken,
    connected: Arc<AtomicBool>,
    framer: JsonObjectFramer,
    receiver_gone: bool,
}

impl StdoutReader {
    async fn run(mut self, mut stdout: ChildStdout) {
        let mut read_buffer = vec![0u8; READ_BUFFER_SIZE];

        'read: loop {
            let read = tokio::select! {
                biased;
                () = self.cancel.cancelled() => {
                    trace!("SubprocessTransport: stdout loop cancelled");
                    break;
                }
                read = stdout.read(&mut read_buffer) => read,
            };

            match read {
                Ok(0) => {
                    trace!("SubprocessTransport: stdout EOF reached");
                    break;
                }
                Ok(n) => {
                    for item in self.framer.feed(&read_buffer[..n]) {
                        match item {
                            Ok(object) => {
                                if !self.dispatch(object).await {
                                    break 'read;
                                }
                            }
                            Err(e) => {
                                error!("SubprocessTransport: framing error: {}", e);
                                self.report(TransportError::Framing(e));
                            }
                        }
                    }
                }
                Err(e) => {
                    error!("Failed to read from stdout: {}", e);
                    self.report(TransportError::Io(e));
                    break;
                }
            }
        }

        self.connected.store(false, Ordering::SeqCst);
        if self.framer.has_partial() {
            warn!(
                "SubprocessTransport: {} bytes of an incomplete object discarded at end of stream",
                self.framer.buffered_len()
            );
        }
        if let Some(router) = self.current_router() {
            router.on_stream_closed();
        }
        trace!("SubprocessTransport: stdout loop finished");
    }

    /// Route one object; returns `false` when the loop should stop
    async fn dispatch(&mut self, object: FramedObject) -> bool {
        let message = match self.registry.parse_framed(&object) {
            Ok(message) => message,
            Err(e) => {
                warn!("SubprocessTransport: dropping unparseable object: {}", e);
                self.report(TransportError::Parse(e));
                return true;
            }
        };

        if message.is_control()
            && let Some(router) = self.current_router()
        {
            trace!(
                "SubprocessTransport: routing {} to control protocol",
                message.message_type()
            );
            router.route(message);
            return true;
        }

        if self.receiver_gone {
            return true;
        }

        // A full queue must not outlive close(): race the send against
        // cancellation.
        let sent = tokio::select! {
            biased;
            () = self.cancel.cancelled() => None,
            sent = self.messages.send(message) => Some(sent),
        };

        match sent {
            None => false,
            Some(Ok(())) => true,
            Some(Err(_)) => {
                debug!(
                    "SubprocessTransport: message receiver dropped, discarding further messages"
                );
                self.receiver_gone = true;
                true
            }
        }
    }

    fn current_router(&self) -> Option<Arc<dyn ControlRouter>> {
        self.router
            .read()
            .map(|slot| slot.clone())
            .unwrap_or_else(|e| e.into_inner().clone())
    }

    fn report(&self, err: TransportError) {
        if self.errors.try_send(err).is_err() {
            trace!("SubprocessTransport: error queue full or closed, dropping error");
        }
    }
}

// ============================================================================
// Subprocess Transport
// ============================================================================

pub struct SubprocessTransport {
    config: TransportConfig,
    registry: Arc<MessageRegistry>,
    router: RouterSlot,
    cancel: CancellationToken,
    writer: StdinWriter,
    closed: AtomicBool,
    process: Option<CliProcess>,
    tasks: Vec<JoinHandle<()>>,
    messages: Option<mpsc::Receiver<Message>>,
    errors: Option<mpsc::Receiver<TransportError>>,
}

impl std::fmt::Debug for SubprocessTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubprocessTransport")
            .field("config", &self.config)
            .field("connected", &self.is_connected())
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .field("pid", &self.pid())
            .finish()
    }
}

impl SubprocessTransport {
    pub fn new(config: TransportConfig) -> Result<Self, TransportError> {
        Self::with_registry(config, Arc::new(MessageRegistry::with_defaults()))
    }

    /// Use a caller-supplied registry, e.g. with extra message kinds
    pub fn with_registry(
        config: TransportConfig,
        registry: Arc<MessageRegistry>,
    ) -> Result<Self, TransportError> {
        config.validate()?;
        Ok(Self {
            config,
            registry,
            router: Arc::new(RwLock::new(None)),
            cancel: CancellationToken::new(),
            writer: StdinWriter::default(),
            closed: AtomicBool::new(false),
            process: None,
            tasks: Vec::new(),
            messages: None,
            errors: None,
        })
    }

    /// Token cancelled by `close()`; share it with anything that must stop
    /// when the transport does
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Shared write path
    pub fn writer(&self) -> Arc<dyn MessageWriter> {
        Arc::new(self.writer.clone())
    }

    pub fn registry(&self) -> &Arc<MessageRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    /// Route control envelopes to `router` instead of the message queue
    pub fn set_control_router(&self, router: Arc<dyn ControlRouter>) {
        let mut slot = self.router.write().unwrap_or_else(|e| e.into_inner());
        *slot = Some(router);
    }

    pub fn pid(&self) -> Option<u32> {
        self.process.as_ref().and_then(CliProcess::pid)
    }

    /// Wait for every reader task until `deadline`; stragglers are aborted
    async fn join_tasks(&mut self, deadline: tokio::time::Instant) {
        for mut task in self.tasks.drain(..) {
            match tokio::time::timeout_at(deadline, &mut task).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("SubprocessTransport: reader task failed: {}", e),
                Err(_) => {
                    warn!("SubprocessTransport: reader task exceeded grace period, aborting");
                    task.abort();
                }
            }
        }
    }
}

#[async_trait]
impl Transport for SubprocessTransport {
    async fn connect(&mut self) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        if self.process.is_some() {
            return Err(TransportError::AlreadyConnected);
        }

        let config = &self.config;
        let (process, pipes) = retry_with_backoff(&config.retry, |attempt| {
            debug!("SubprocessTransport: connect attempt {}", attempt);
            let spawned = CliProcess::spawn(config);
            async move { spawned }
        })
        .await?;

        let (message_tx, message_rx) = mpsc::channel(self.config.queue_capacity);
        let (error_tx, error_rx) = mpsc::channel(self.config.queue_capacity);

        self.writer.attach(pipes.stdin).await;
        self.writer.connected.store(true, Ordering::SeqCst);

        let stderr_task = spawn_stderr_monitor(
            pipes.stderr,
            self.config.stderr_callback.clone(),
            error_tx.downgrade(),
            self.cancel.clone(),
        );

        let reader = StdoutReader {
            registry: Arc::clone(&self.registry),
            router: Arc::clone(&self.router),
            messages: message_tx,
            errors: error_tx,
            cancel: self.cancel.clone(),
            connected: Arc::clone(&self.writer.connected),
            framer: JsonObjectFramer::new(self.config.max_buffer_size),
            receiver_gone: false,
        };
        let stdout_task = tokio::spawn(reader.run(pipes.stdout));

        info!(
            "SubprocessTransport: connected (pid {:?}, mode {:?})",
            process.pid(),
            self.config.mode
        );

        self.process = Some(process);
        self.tasks = vec![stdout_task, stderr_task];
        self.messages = Some(message_rx);
        self.errors = Some(error_rx);
        Ok(())
    }

    async fn write(&self, line: &str) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        self.writer.write_line(line).await
    }

    fn take_messages(&mut self) -> Option<mpsc::Receiver<Message>> {
        self.messages.take()
    }

    fn take_errors(&mut self) -> Option<mpsc::Receiver<TransportError>> {
        self.errors.take()
    }

    async fn end_input(&self) -> Result<(), TransportError> {
        if self.process.is_none() {
            return Err(TransportError::NotConnected);
        }
        self.writer.close().await;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            trace!("SubprocessTransport: close called again, ignoring");
            return Ok(());
        }

        info!("SubprocessTransport: closing (pid {:?})", self.pid());
        let deadline = tokio::time::Instant::now() + self.config.close_grace_period;

        self.cancel.cancel();
        self.writer.connected.store(false, Ordering::SeqCst);
        if tokio::time::timeout_at(deadline, self.writer.close())
            .await
            .is_err()
        {
            warn!("SubprocessTransport: stdin still busy at close, leaving it to process teardown");
        }
        self.join_tasks(deadline).await;

        let result = match self.process.as_mut() {
            Some(process) => {
                let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
                process.stop(StopMode::Graceful, remaining).await
            }
            None => Ok(()),
        };
        self.process = None;

        info!("SubprocessTransport: closed");
        result
    }

    fn is_connected(&self) -> bool {
        !self.closed.load(Ordering::SeqCst) && self.writer.connected.load(Ordering::SeqCst)
    }
}

impl Drop for SubprocessTransport {
    fn drop(&mut self) {
        self.cancel.cancel();
        for task in &self.tasks {
            task.abort();
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::io::retry::RetryPolicy;
    use crate::protocol::message::user_message_line;
    use crate::test_utils::write_fake_cli;
    use std::sync::Mutex as StdMutex;
    use std::time::Instant;
    use tempfile::TempDir;

    struct FakeCli {
        _dir: TempDir,
        transport: SubprocessTransport,
    }

    #[cfg(feature = "test-logging")]
    #[ctor::ctor]
    fn init_test_logging() {
        crate::test_utils::logging::init();
    }

    fn fake_transport(
        script: &str,
        configure: impl FnOnce(TransportConfig) -> TransportConfig,
    ) -> FakeCli {
        let dir = tempfile::tempdir().unwrap();
        let mut config = TransportConfig::default();
        config.cli_path = write_fake_cli(dir.path(), script);
        config.retry = RetryPolicy::no_retry();
        let transport = SubprocessTransport::new(configure(config)).unwrap();
        FakeCli {
            _dir: dir,
            transport,
        }
    }

    async fn collect(rx: &mut mpsc::Receiver<Message>) -> Vec<Message> {
        let mut messages = Vec::new();
        while let Ok(Some(message)) = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await
        {
            messages.push(message);
        }
        messages
    }

    #[derive(Default)]
    struct RecordingRouter {
        routed: StdMutex<Vec<Message>>,
        closed: AtomicBool,
    }

    impl ControlRouter for RecordingRouter {
        fn route(&self, message: Message) {
            self.routed.lock().unwrap().push(message);
        }

        fn on_stream_closed(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    const THREE_MESSAGES: &str = r#"cat <<'EOF'
{"type":"system","subtype":"init","session_id":"s1"}
{"type":"assistant","message":{"model":"m","content":[{"type":"text","text":"hi"}]}}
{"type":"result","subtype":"success","result":"ok","session_id":"s1"}
EOF"#;

    #[tokio::test]
    async fn test_messages_delivered_in_order() {
        let mut cli = fake_transport(THREE_MESSAGES, |c| c);
        cli.transport.connect().await.unwrap();
        let mut rx = cli.transport.take_messages().unwrap();

        let messages = collect(&mut rx).await;
        let kinds: Vec<&str> = messages.iter().map(Message::message_type).collect();

        assert_eq!(kinds, vec!["system", "assistant", "result"]);
        match &messages[2] {
            Message::Result(result) => assert_eq!(result.result.as_deref(), Some("ok")),
            other => panic!("Expected Result, got: {other:?}"),
        }
        cli.transport.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_close_twice_is_ok() {
        let mut cli = fake_transport("exec sleep 30", |c| c);
        cli.transport.connect().await.unwrap();
        assert!(cli.transport.is_connected());

        cli.transport.close().await.unwrap();
        cli.transport.close().await.unwrap();

        assert!(!cli.transport.is_connected());
        assert!(matches!(
            cli.transport.write("{}").await,
            Err(TransportError::Closed)
        ));
        assert!(matches!(
            cli.transport.connect().await,
            Err(TransportError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_close_with_full_queue_does_not_deadlock() {
        let script = r#"i=0
while [ $i -lt 50 ]; do
  echo '{"type":"system","subtype":"tick"}'
  i=$((i+1))
done
exec sleep 30"#;
        let mut cli = fake_transport(script, |mut c| {
            c.queue_capacity = 1;
            c.close_grace_period = Duration::from_secs(2);
            c
        });
        cli.transport.connect().await.unwrap();

        // Nobody drains the queue; the stdout loop is parked on a full send.
        tokio::time::sleep(Duration::from_millis(200)).await;

        let started = Instant::now();
        tokio::time::timeout(Duration::from_secs(4), cli.transport.close())
            .await
            .expect("close must not hang on a full queue")
            .unwrap();
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[tokio::test]
    async fn test_echo_round_trip() {
        let mut cli = fake_transport("while read -r line; do echo \"$line\"; done", |c| c);
        cli.transport.connect().await.unwrap();
        let mut rx = cli.transport.take_messages().unwrap();

        cli.transport
            .write(&user_message_line("hello", "default"))
            .await
            .unwrap();
        let message = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();

        assert_eq!(message.message_type(), "user");
        cli.transport.end_input().await.unwrap();
        assert!(
            tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .unwrap()
                .is_none()
        );
        cli.transport.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_control_envelopes_go_to_router() {
        let script = r#"cat <<'EOF'
{"type":"control_response","response":{"subtype":"success","request_id":"req_1"}}
{"type":"assistant","message":{"content":[]}}
EOF"#;
        let mut cli = fake_transport(script, |c| c);
        let router = Arc::new(RecordingRouter::default());
        cli.transport.set_control_router(router.clone());
        cli.transport.connect().await.unwrap();
        let mut rx = cli.transport.take_messages().unwrap();

        let messages = collect(&mut rx).await;

        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].message_type(), "assistant");
        assert_eq!(router.routed.lock().unwrap().len(), 1);
        assert!(router.closed.load(Ordering::SeqCst));
        cli.transport.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_control_envelopes_without_router_are_delivered() {
        let script = r#"echo '{"type":"control_request","request_id":"r","request":{"subtype":"can_use_tool"}}'"#;
        let mut cli = fake_transport(script, |c| c);
        cli.transport.connect().await.unwrap();
        let mut rx = cli.transport.take_messages().unwrap();

        let messages = collect(&mut rx).await;

        assert!(matches!(messages.as_slice(), [Message::ControlRequest(_)]));
        cli.transport.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_oversized_object_reports_framing_error() {
        let script = r#"printf '%s' '{"type":"assistant","text":"0123456789012345678901234567890123456789'"#;
        let mut cli = fake_transport(script, |mut c| {
            c.max_buffer_size = 48;
            c
        });
        cli.transport.connect().await.unwrap();
        let mut rx = cli.transport.take_messages().unwrap();
        let mut errors = cli.transport.take_errors().unwrap();

        let messages = collect(&mut rx).await;
        let error = tokio::time::timeout(Duration::from_secs(5), errors.recv())
            .await
            .unwrap()
            .unwrap();

        assert!(messages.is_empty());
        assert!(matches!(
            error,
            TransportError::Framing(FramingError::BufferOverflow { max: 48, .. })
        ));
        cli.transport.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_message_after_oversized_object_is_delivered() {
        let script = r#"printf '%s' '{"type":"assistant","text":"0123456789012345678901234567890123456789'
sleep 1
printf '%s\n' 'tail"}' '{"type":"result","subtype":"success","result":"ok"}'"#;
        let mut cli = fake_transport(script, |mut c| {
            c.max_buffer_size = 48;
            c
        });
        cli.transport.connect().await.unwrap();
        let mut rx = cli.transport.take_messages().unwrap();
        let mut errors = cli.transport.take_errors().unwrap();

        let messages = collect(&mut rx).await;
        let error = tokio::time::timeout(Duration::from_secs(5), errors.recv())
            .await
            .unwrap()
            .unwrap();

        assert!(matches!(
            error,
            TransportError::Framing(FramingError::BufferOverflow { max: 48, .. })
        ));
        match messages.as_slice() {
            [Message::Result(result)] => assert_eq!(result.result.as_deref(), Some("ok")),
            other => panic!("Expected a single result message, got: {other:?}"),
        }
        cli.transport.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_one_shot_has_no_stdin() {
        let mut cli = fake_transport(THREE_MESSAGES, |mut c| {
            c.mode = crate::config::SessionMode::OneShot {
                prompt: "hi".to_string(),
            };
            c
        });
        cli.transport.connect().await.unwrap();

        assert!(matches!(
            cli.transport.write("{}").await,
            Err(TransportError::PipeUnavailable("stdin")) | Err(TransportError::NotConnected)
        ));
        cli.transport.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_missing_cli_fails_without_retry() {
        let mut config = TransportConfig::default();
        config.cli_path = PathBuf::from("/nonexistent/cli-binary");
        config.retry = RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_secs(10),
            ..RetryPolicy::default()
        };
        let mut transport = SubprocessTransport::new(config).unwrap();

        let started = Instant::now();
        let err = transport.connect().await.unwrap_err();

        assert!(matches!(err, TransportError::Spawn { .. }));
        assert!(started.elapsed() < Duration::from_secs(5));
        transport.close().await.unwrap();
    }

    #[test]
    fn test_transient_classification() {
        let io_error = |kind: io::ErrorKind| TransportError::Io(io::Error::from(kind));
        let timeout = TransportError::Timeout(Duration::from_secs(1));

        assert!(io_error(io::ErrorKind::BrokenPipe).is_transient());
        assert!(io_error(io::ErrorKind::ConnectionRefused).is_transient());
        assert!(timeout.is_transient());
        assert!(TransportError::Process("exited".into()).is_transient());
        assert!(!io_error(io::ErrorKind::NotFound).is_transient());
        assert!(!TransportError::Closed.is_transient());

        let framing = FramingError::InvalidUtf8 { line: 1, column: 1 };
        assert!(!TransportError::Framing(framing).is_transient());
    }
}
