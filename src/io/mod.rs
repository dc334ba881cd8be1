//! I/O layer - framing, process management and the subprocess transport
//!
//! - **Framing**: incremental extraction of JSON objects from a byte stream
//! - **Process**: CLI command line, environment filtering, spawn and stop
//! - **Retry**: exponential backoff for transient connect failures
//! - **Transport**: reader loops, delivery queues, write path and shutdown

pub mod framing;
pub mod process;
pub mod retry;
pub mod transport;

// Re-export main types for convenience
pub use framing::{FramedItem, FramedObject, FramingError, JsonObjectFramer};
pub use process::{CliProcess, ProcessState, StopMode, build_args, filter_env};
pub use retry::{RetryPolicy, retry_with_backoff};
pub use transport::{
    ControlRouter, MessageWriter, StdinWriter, SubprocessTransport, Transport, TransportError,
};
