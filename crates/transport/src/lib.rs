//! Transport Crate
//!
//! The control plane between the fleet coordinator and its workers. Each
//! worker gets one duplex channel: commands flow down, shard events and
//! identify requests flow up. Frames are serialized bytes on crossbeam
//! channels, so the same protocol works whether workers are threads today
//! or separate processes later.

pub mod channel;
pub mod error;
pub mod message;

pub use channel::{
    ControlPair, ControlReceiver, ControlSender, CoordinatorEnd, WorkerEnd, control_channel,
    duplex,
};
pub use error::TransportError;
pub use message::{CoordinatorMessage, WireError, WorkerMessage};
