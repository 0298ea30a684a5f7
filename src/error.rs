//! Error types for base-service.
//!
//! Only configuration and transport-setup failures leave the core. Everything
//! that goes wrong while processing a single message is contained by the
//! dispatch loop (see `engine::dispatch`).

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("broker connection failed: {0}")]
    Connection(String),

    #[error("channel error: {0}")]
    Channel(String),

    #[error("queue {queue} declared with incompatible parameters: {reason}")]
    QueueConflict { queue: String, reason: String },

    #[error("failed to publish to {routing_key}: {reason}")]
    Publish { routing_key: String, reason: String },

    #[error("acknowledgement failed: {0}")]
    Ack(String),

    #[error("no reply from {queue} within {timeout:?}")]
    Timeout {
        queue: String,
        timeout: std::time::Duration,
    },

    #[error("reply correlation mismatch: expected {expected}, got {got:?}")]
    CorrelationMismatch {
        expected: String,
        got: Option<String>,
    },

    #[error("payload encoding error: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Whether this error ends a dispatch loop rather than a single message.
    pub fn is_fatal_to_loop(&self) -> bool {
        matches!(
            self,
            Error::Config(_)
                | Error::Connection(_)
                | Error::Channel(_)
                | Error::QueueConflict { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
