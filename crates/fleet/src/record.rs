//! Coordinator-Side Shard Records
//!
//! The coordinator never touches a live connection; it mirrors each shard's
//! state from the events the worker forwards. The record also tracks the
//! guild ids a READY dispatch promised, which gates shard readiness.

use std::collections::HashSet;

use serde_json::Value;

use stratus_shard::{SessionInfo, ShardStatus};

#[derive(Debug)]
pub struct ShardRecord {
    pub shard_id: u16,
    pub status: ShardStatus,
    pub sequence: i64,
    pub close_sequence: i64,
    pub latency_ms: Option<u64>,
    pub session: Option<SessionInfo>,
    /// Guild ids promised by READY that have not arrived yet
    pub pending_guilds: HashSet<String>,
    /// Invalidates stale guild-wait timers
    pub guild_timer_generation: u64,
    /// Abort handle for the running guild-wait timer task, if any
    pub guild_timer: Option<tokio::task::AbortHandle>,
}

impl ShardRecord {
    pub fn new(shard_id: u16) -> Self {
        ShardRecord {
            shard_id,
            status: ShardStatus::Idle,
            sequence: -1,
            close_sequence: 0,
            latency_ms: None,
            session: None,
            pending_guilds: HashSet::new(),
            guild_timer_generation: 0,
            guild_timer: None,
        }
    }

    /// Snapshot the guild ids out of a READY dispatch payload.
    pub fn snapshot_guilds(&mut self, d: &Value) {
        self.pending_guilds = d
            .get("guilds")
            .and_then(Value::as_array)
            .map(|guilds| {
                guilds
                    .iter()
                    .filter_map(|guild| guild.get("id").and_then(Value::as_str))
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
    }

    /// Remove one awaited guild; true when that drained the set.
    pub fn drain_guild(&mut self, guild_id: &str) -> bool {
        self.pending_guilds.remove(guild_id) && self.pending_guilds.is_empty()
    }

    /// A new timer generation. Any timer already running is aborted; the
    /// generation bump additionally invalidates a deadline that was already
    /// in flight when the abort landed.
    pub fn next_timer_generation(&mut self) -> u64 {
        if let Some(timer) = self.guild_timer.take() {
            timer.abort();
        }
        self.guild_timer_generation += 1;
        self.guild_timer_generation
    }

    pub fn observe_sequence(&mut self, sequence: Option<u64>) {
        if let Some(seq) = sequence
            && (seq as i64) > self.sequence
        {
            self.sequence = seq as i64;
        }
    }

    pub fn observe_close(&mut self, code: u16, resumable: bool) {
        if self.sequence != -1 {
            self.close_sequence = self.sequence;
        }
        self.sequence = -1;
        self.status = if resumable && self.session.is_some() {
            ShardStatus::Reconnecting
        } else {
            ShardStatus::Disconnected
        };
        tracing::debug!(
            shard = self.shard_id,
            code,
            status = ?self.status,
            "shard connection closed"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_guild_snapshot_and_drain() {
        let mut record = ShardRecord::new(0);
        record.snapshot_guilds(&json!({
            "guilds": [{"id": "a", "unavailable": true}, {"id": "b"}],
            "session_id": "s",
        }));
        assert_eq!(record.pending_guilds.len(), 2);

        assert!(!record.drain_guild("a"));
        assert!(!record.drain_guild("missing"));
        assert!(record.drain_guild("b"));
    }

    #[test]
    fn test_snapshot_without_guilds_is_empty() {
        let mut record = ShardRecord::new(0);
        record.snapshot_guilds(&json!({"session_id": "s"}));
        assert!(record.pending_guilds.is_empty());
    }

    #[test]
    fn test_close_classification() {
        let mut record = ShardRecord::new(0);
        record.session = Some(SessionInfo {
            session_id: "s".to_string(),
            resume_url: "wss://resume".to_string(),
            sequence: 7,
            shard_id: 0,
            shard_count: 1,
        });
        record.sequence = 7;

        record.observe_close(4000, true);
        assert_eq!(record.status, ShardStatus::Reconnecting);
        assert_eq!(record.close_sequence, 7);

        // Without a session even a resumable code cannot resume.
        record.session = None;
        record.observe_close(4000, true);
        assert_eq!(record.status, ShardStatus::Disconnected);
    }
}
