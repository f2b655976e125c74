//! Transport Error Types

use thiserror::Error;

/// Error type for control-plane operations.
#[derive(Error, Debug)]
pub enum TransportError {
    /// Message could not be encoded or decoded
    #[error("wire serialization error: {0}")]
    Wire(#[from] serde_json::Error),

    /// The other end of the channel is gone
    #[error("control channel disconnected")]
    Disconnected,

    /// Bounded channel is at capacity
    #[error("control channel full")]
    Full,

    /// No message arrived within the deadline
    #[error("control channel receive timed out")]
    Timeout,
}
