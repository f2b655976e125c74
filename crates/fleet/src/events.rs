//! Fleet Events
//!
//! What the embedder sees. Raw dispatches pass through unchanged; lifecycle
//! transitions get their own variants.

use std::collections::HashSet;

use stratus_codec::ReceivePayload;
use stratus_transport::WireError;

#[derive(Debug, Clone)]
pub enum FleetEvent {
    /// A gateway dispatch, attributed to the shard that received it
    Dispatch {
        shard_id: u16,
        payload: ReceivePayload,
    },
    /// A shard finished its handshake; `unavailable` holds guild ids that
    /// never arrived before the wait timed out
    ShardReady {
        shard_id: u16,
        unavailable: HashSet<String>,
    },
    ShardResumed { shard_id: u16, replayed: i64 },
    ShardReconnecting { shard_id: u16 },
    ShardDisconnected { shard_id: u16, code: u16 },
    ShardError { shard_id: u16, error: WireError },
    /// Every shard is ready; emitted exactly once, after the buffered
    /// packets have been replayed
    Ready,
}
