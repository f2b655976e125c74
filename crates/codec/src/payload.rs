use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::CodecError;

/// Gateway protocol opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum Opcode {
    Dispatch = 0,
    Heartbeat = 1,
    Identify = 2,
    PresenceUpdate = 3,
    VoiceStateUpdate = 4,
    Resume = 6,
    Reconnect = 7,
    RequestGuildMembers = 8,
    InvalidSession = 9,
    Hello = 10,
    HeartbeatAck = 11,
}

impl Opcode {
    /// Control opcodes that may be sent before the shard is fully ready.
    ///
    /// Everything else waits for readiness before entering the send queue.
    pub fn is_control(self) -> bool {
        matches!(
            self,
            Opcode::Heartbeat
                | Opcode::Identify
                | Opcode::Resume
                | Opcode::VoiceStateUpdate
                | Opcode::PresenceUpdate
        )
    }
}

impl From<Opcode> for u8 {
    fn from(op: Opcode) -> Self {
        op as u8
    }
}

impl TryFrom<u8> for Opcode {
    type Error = CodecError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Opcode::Dispatch),
            1 => Ok(Opcode::Heartbeat),
            2 => Ok(Opcode::Identify),
            3 => Ok(Opcode::PresenceUpdate),
            4 => Ok(Opcode::VoiceStateUpdate),
            6 => Ok(Opcode::Resume),
            7 => Ok(Opcode::Reconnect),
            8 => Ok(Opcode::RequestGuildMembers),
            9 => Ok(Opcode::InvalidSession),
            10 => Ok(Opcode::Hello),
            11 => Ok(Opcode::HeartbeatAck),
            other => Err(CodecError::UnknownOpcode(other)),
        }
    }
}

/// A payload received from the gateway.
///
/// `s` is the message sequence number, present only on dispatches. `t` is the
/// dispatch event name (e.g. `READY`, `GUILD_CREATE`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReceivePayload {
    pub op: Opcode,
    #[serde(default)]
    pub d: Value,
    #[serde(default)]
    pub s: Option<u64>,
    #[serde(default)]
    pub t: Option<String>,
}

impl ReceivePayload {
    /// Dispatch event name, if this is a dispatch.
    pub fn event_name(&self) -> Option<&str> {
        self.t.as_deref()
    }
}

/// A payload sent to the gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendPayload {
    pub op: Opcode,
    pub d: Value,
}

impl SendPayload {
    pub fn new(op: Opcode, d: Value) -> Self {
        SendPayload { op, d }
    }
}
