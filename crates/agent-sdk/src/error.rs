//! Error types for the agent SDK.

use thiserror::Error;

/// Errors surfaced by the agent runtime.
///
/// Decode failures and registry misses are recovered locally by the session
/// handler (they produce a defensive allow); the variants here are the ones
/// that cross API boundaries.
#[derive(Error, Debug)]
pub enum AgentError {
    #[error("frame size {size} exceeds maximum {max}")]
    FrameTooLarge { size: usize, max: usize },

    #[error("truncated frame: {0}")]
    Truncated(String),

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("failed to decode payload: {0}")]
    Decode(String),

    #[error("callback failed: {0}")]
    Callback(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("handshake rejected: {0}")]
    HandshakeRejected(String),

    #[error("fatal: {0}")]
    Lifecycle(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(String),
}
