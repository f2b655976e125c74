//! Shard Crate
//!
//! One gateway shard is one persistent WebSocket connection running a
//! protocol state machine:
//!
//! ```text
//! Idle → Connecting → (identify | resume) → WaitingForGuilds → Ready
//!                 ↑                                              │
//!                 └── Reconnecting ←── recoverable close ────────┘
//! ```
//!
//! The shard owns its frame codec, its send governor (a FIFO, rate-limited
//! admission queue), and its heartbeat loop. It reports everything that
//! happens over a typed event channel; it never reaches into another
//! component's state.

pub mod close;
pub mod error;
pub mod events;
pub mod gate;
pub mod governor;
pub mod session;
pub mod shard;
pub mod status;

pub use close::{CLOSE_NORMAL, CLOSE_RESUMING, is_resumable};
pub use error::ShardError;
pub use events::ShardEvent;
pub use gate::{IdentifyGate, OpenGate};
pub use governor::{GovernorError, RateLimitState, SendGovernor, SendPermit};
pub use session::SessionInfo;
pub use shard::{GATEWAY_VERSION, IdentifyProperties, Shard, ShardConfig, build_gateway_url};
pub use status::ShardStatus;
