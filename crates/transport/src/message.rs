//! Control-Plane Messages
//!
//! Everything that crosses the coordinator/worker boundary is one of these
//! two enums. The channel itself is payload-agnostic; these types define the
//! protocol.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use stratus_codec::SendPayload;
use stratus_shard::{SessionInfo, ShardEvent};

/// An error that crossed the channel boundary.
///
/// Workers cannot hand the coordinator a live error value, so the name,
/// message, and an optional trace travel as strings and are reassembled on
/// the other side.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireError {
    pub name: String,
    pub message: String,
    pub trace: Option<String>,
}

impl WireError {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        WireError {
            name: name.into(),
            message: message.into(),
            trace: None,
        }
    }

    pub fn with_trace(mut self, trace: impl Into<String>) -> Self {
        self.trace = Some(trace.into());
        self
    }
}

impl std::fmt::Display for WireError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.name, self.message)?;
        if let Some(trace) = &self.trace {
            write!(f, "\n{trace}")?;
        }
        Ok(())
    }
}

impl std::error::Error for WireError {}

/// Worker to coordinator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum WorkerMessage {
    /// The worker built its shards and is ready for commands
    Ready,
    /// A shard produced an event
    Event { shard_id: u16, event: ShardEvent },
    /// A shard wants to identify; the coordinator answers with the same
    /// nonce once the shard's bucket is free
    WaitForIdentify { nonce: Uuid, shard_id: u16 },
    /// Something failed inside the worker
    Error {
        shard_id: Option<u16>,
        error: WireError,
    },
}

/// Coordinator to worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum CoordinatorMessage {
    /// Start connecting a shard, optionally resuming a persisted session
    Connect {
        shard_id: u16,
        session: Option<SessionInfo>,
    },
    /// Deliver a payload to a shard's send queue
    Send { shard_id: u16, payload: SendPayload },
    /// Close a shard's connection
    Destroy { shard_id: u16, code: u16 },
    /// Grant for a pending [`WorkerMessage::WaitForIdentify`]
    ShardCanIdentify { nonce: Uuid },
}
