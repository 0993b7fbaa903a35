//! Error types for the pytether runtime.

use thiserror::Error;

use crate::transport::status::PythonException;

/// Result type alias for pytether operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error types that can occur in the pytether runtime.
#[derive(Error, Debug)]
pub enum Error {
    /// Failed to launch or bootstrap the child interpreter.
    #[error("spawn error: {0}")]
    Spawn(String),

    /// Pipe read/write failure on a session channel.
    #[error("transport error: {0}")]
    Transport(String),

    /// Malformed or out-of-contract message on the wire.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A call failed: handler-reported error or argument/result mismatch.
    #[error("call error: {0}")]
    Call(String),

    /// Deadline expired while waiting for a response.
    #[error("timeout waiting for response to command: {0}")]
    Timeout(String),

    /// A structured Python exception delivered on the status channel,
    /// together with whatever output was captured before it was raised.
    #[error("python exception: {exception}")]
    Python {
        /// The decoded exception object.
        exception: PythonException,
        /// Output captured before the exception surfaced.
        output: String,
    },

    /// The session observed a terminal condition; no further operations
    /// are permitted.
    #[error("session is closed")]
    Closed,

    /// The child process was killed by a signal.
    #[error("child process was killed")]
    Killed,

    /// The child exited with a non-zero status.
    #[error("child exited with status {0}")]
    Exit(i32),

    /// Shared memory creation, mapping, or bounds failure.
    #[error("shared memory error: {0}")]
    SharedMemory(String),

    /// Named semaphore failure.
    #[error("semaphore error: {0}")]
    Semaphore(String),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
