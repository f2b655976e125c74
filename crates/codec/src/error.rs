//! Codec Error Types

use thiserror::Error;

/// Error type for encode/decode operations.
///
/// Decode errors are recoverable at the connection level: a malformed frame
/// or a failed inflate is reported upward as a shard error event, it does not
/// close the connection by itself.
#[derive(Error, Debug)]
pub enum CodecError {
    /// JSON serialization or deserialization failed
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Binary packer failed to pack or unpack a payload
    #[error("binary packer error: {0}")]
    Pack(String),

    /// The binary packer capability could not be initialized
    #[error("binary packer unavailable: {0}")]
    PackerUnavailable(String),

    /// zlib inflate failed
    #[error("inflate error: {0}")]
    Inflate(String),

    /// Payload carried an opcode outside the protocol range
    #[error("unknown opcode: {0}")]
    UnknownOpcode(u8),
}
