//! Fleet Error Types

use thiserror::Error;

use stratus_transport::TransportError;

/// Configuration rejected before any connection is attempted.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("explicit shard list is empty")]
    NoShards,

    #[error("shard id {id} is out of range for a total of {total}")]
    ShardOutOfRange { id: u16, total: u16 },

    #[error("total shard count must be at least 1")]
    ZeroShardCount,

    #[error("shards per worker must be at least 1")]
    ZeroShardsPerWorker,
}

/// Error type for fleet operations.
#[derive(Error, Debug)]
pub enum FleetError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("control channel error: {0}")]
    Transport(#[from] TransportError),

    /// The gateway metadata call failed
    #[error("gateway info error: {0}")]
    GatewayInfo(String),

    /// A command referenced a shard the fleet does not manage
    #[error("unknown shard {0}")]
    UnknownShard(u16),

    /// A worker thread died and the restart policy forbids respawning
    #[error("worker {worker_id} died")]
    WorkerDied { worker_id: usize },

    /// Spawning a worker thread failed
    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[from] std::io::Error),

    /// The fleet task is no longer running
    #[error("fleet is not running")]
    Stopped,
}
