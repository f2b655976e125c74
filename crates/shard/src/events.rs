use serde::{Deserialize, Serialize};

use stratus_codec::ReceivePayload;

use crate::session::SessionInfo;

/// Events a shard reports to its owner.
///
/// Serializable so a worker can forward them to the coordinator over the
/// control channel unchanged.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ShardEvent {
    /// A decoded dispatch (or other inbound payload worth surfacing)
    Dispatch { payload: ReceivePayload },
    /// The session was resumed; `replayed` is reported for observability only
    Resumed { replayed: i64 },
    /// A heartbeat round trip completed
    HeartbeatComplete { latency_ms: u64 },
    /// The connection closed with the given code
    Closed { code: u16 },
    /// The resumable session changed (created, refreshed, or invalidated)
    SessionUpdate { session: Option<SessionInfo> },
    /// A recoverable shard-level error (decode failure, send failure, ...)
    Error { name: String, message: String },
}
