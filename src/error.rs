//! Error types for framed-rpc.
//!
//! Every variant of [`RpcError`] is scoped to a single connection: the
//! connection that produced it is closed and the error is logged. None of
//! them are allowed to reach an accept loop or terminate the process.

use thiserror::Error;

/// Per-connection protocol and I/O errors.
#[derive(Debug, Error)]
pub enum RpcError {
    /// Peer closed the stream in the middle of a header or body.
    #[error("connection closed mid-frame with {buffered} bytes buffered")]
    Truncated { buffered: usize },

    /// Body is not UTF-8 JSON, or lacks the required keys.
    #[error("malformed frame body: {0}")]
    Malformed(#[source] serde_json::Error),

    /// Operation name absent from the dispatch table.
    #[error("unknown operation '{0}'")]
    UnknownOperation(String),

    /// Header announced a body larger than the configured limit.
    #[error("frame length {length} exceeds maximum {max}")]
    FrameTooLarge { length: u64, max: u32 },

    /// Prefix and body length disagree in a standalone frame.
    #[error("frame declares {declared} body bytes but carries {actual}")]
    LengthMismatch { declared: u32, actual: usize },

    /// Message could not be serialized.
    #[error("failed to encode message: {0}")]
    Encode(#[source] serde_json::Error),

    /// Transport error on the connection socket.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl RpcError {
    /// Short label used as a structured logging field.
    pub fn kind(&self) -> &'static str {
        match self {
            RpcError::Truncated { .. } => "truncated",
            RpcError::Malformed(_) => "malformed",
            RpcError::UnknownOperation(_) => "unknown_operation",
            RpcError::FrameTooLarge { .. } => "frame_too_large",
            RpcError::LengthMismatch { .. } => "length_mismatch",
            RpcError::Encode(_) => "encode",
            RpcError::Io(_) => "io",
        }
    }
}

/// Result type alias using RpcError.
pub type Result<T> = std::result::Result<T, RpcError>;
