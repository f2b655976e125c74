use serde::{Deserialize, Serialize};

/// Resumable session token.
///
/// Owned by the shard that created it; crosses the control channel only so
/// the coordinator can hand it back when a worker is respawned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub session_id: String,
    pub resume_url: String,
    /// Last sequence seen on the connection this session belongs to
    pub sequence: i64,
    pub shard_id: u16,
    pub shard_count: u16,
}
