use serde::{Deserialize, Serialize};

/// Lifecycle status of a shard (and, derived, of the whole fleet).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShardStatus {
    /// Created but never connected
    Idle,
    /// Transport opening, handshake in progress
    Connecting,
    /// Identified; waiting for the expected guilds to arrive
    WaitingForGuilds,
    /// Fully operational
    Ready,
    /// Recoverable close; resume attempt pending
    Reconnecting,
    /// Closed without a resumable session
    Disconnected,
}

impl ShardStatus {
    pub fn is_ready(self) -> bool {
        matches!(self, ShardStatus::Ready)
    }
}
