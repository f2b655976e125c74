//! Fleet Crate
//!
//! The coordinator side of a sharded gateway client:
//!
//! ```text
//!                    ┌────────────────────────────┐
//!  FleetClient ────► │ Fleet (records, readiness, │ ◄── GatewayInfoProvider
//!                    │ buffering, BucketGate)     │
//!                    └─────────────┬──────────────┘
//!                                  │ ShardRoute / control channel
//!                    ┌─────────────┴──────────────┐
//!                    │ WorkerStrategy             │
//!                    │  worker threads, each a    │
//!                    │  runtime running Shards    │
//!                    └────────────────────────────┘
//! ```
//!
//! The coordinator aggregates shard readiness into one fleet-ready flip,
//! buffers early dispatches for replay, throttles identifies per bucket,
//! and respawns dead workers with their persisted sessions.

pub mod client;
pub mod config;
pub mod error;
pub mod events;
pub mod fleet;
pub mod info;
pub mod record;
pub mod strategy;
pub mod throttle;
mod worker;

pub use client::FleetClient;
pub use config::{
    BufferPolicy, FleetConfig, GUILDS_INTENT, RestartPolicy, ShardSelection, ShardsPerWorker,
};
pub use error::{ConfigError, FleetError};
pub use events::FleetEvent;
pub use fleet::{Fleet, GuildTimeout, ShardRoute};
pub use info::{GatewayInfo, GatewayInfoProvider, SessionStartLimit, StaticGatewayInfo};
pub use record::ShardRecord;
pub use strategy::{StrategyEvent, WorkerStrategy};
pub use throttle::{BucketGate, RemoteGate};
