//! Error types for pipehub.

use thiserror::Error;
use uuid::Uuid;

/// Main error type for all pipehub operations.
#[derive(Debug, Error)]
pub enum PipehubError {
    /// I/O error during pipe/socket operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Envelope (de)serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Protocol violation (bad frame length, unexpected first frame, ...).
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The stream ended in the middle of a frame.
    #[error("unexpected end of stream")]
    UnexpectedEof,

    /// The connection closed before the operation could complete.
    #[error("connection closed")]
    ConnectionClosed,

    /// A send referenced a worker id that is not registered.
    #[error("worker not registered: {0}")]
    WorkerNotRegistered(String),

    /// The worker's connection disappeared between lookup and send.
    #[error("connection gone for worker: {0}")]
    ConnectionGone(String),

    /// Two waiters registered for the same message id.
    #[error("duplicate pending entry for message {0}")]
    DuplicatePending(Uuid),

    /// No matching response arrived within the per-call deadline.
    #[error("request timed out")]
    Timeout,

    /// Payload array length does not match the method's parameter count.
    #[error("expected {expected} arguments, got {actual}")]
    ArityMismatch { expected: usize, actual: usize },

    /// Payload bytes did not decode as the expected value.
    #[error("malformed payload: {0}")]
    PayloadMalformed(String),

    /// No method on the handler matches the request type.
    #[error("method not found: {0}")]
    MethodNotFound(String),

    /// The remote handler replied with an error envelope.
    #[error("remote error: {0}")]
    Remote(String),

    /// A broadcast call found no connected workers.
    #[error("no workers connected")]
    NoWorkers,

    /// The operation was cancelled.
    #[error("operation cancelled")]
    Cancelled,
}

/// Result type alias using PipehubError.
pub type Result<T> = std::result::Result<T, PipehubError>;
