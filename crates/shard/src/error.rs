//! Shard Error Types

use thiserror::Error;

use stratus_codec::CodecError;

/// Error type for shard operations.
#[derive(Error, Debug)]
pub enum ShardError {
    /// WebSocket transport failed
    #[error("websocket error: {0}")]
    Connection(#[from] tokio_tungstenite::tungstenite::Error),

    /// Frame encode/decode failed
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// The shard task has stopped; commands can no longer be delivered
    #[error("shard is not running")]
    NotRunning,
}
