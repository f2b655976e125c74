//! Fleet Coordinator
//!
//! Aggregates per-shard state into fleet-level readiness and a single event
//! stream. The coordinator holds no connections; it sees shards through the
//! events workers forward and acts on them through a [`ShardRoute`].
//!
//! Readiness: every shard Ready flips the fleet Ready exactly once. Until
//! then, dispatches outside a small lifecycle whitelist are buffered and
//! replayed, in arrival order, the moment the fleet flips.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::mpsc;

use stratus_codec::{ReceivePayload, SendPayload};
use stratus_shard::{SessionInfo, ShardEvent, ShardStatus, is_resumable};
use stratus_transport::WireError;

use crate::config::{BufferPolicy, FleetConfig};
use crate::error::FleetError;
use crate::events::FleetEvent;
use crate::record::ShardRecord;

/// Lifecycle events that always pass through before fleet readiness.
const BEFORE_READY_WHITELIST: [&str; 7] = [
    "READY",
    "RESUMED",
    "GUILD_CREATE",
    "GUILD_DELETE",
    "GUILD_MEMBERS_CHUNK",
    "GUILD_MEMBER_ADD",
    "GUILD_MEMBER_REMOVE",
];

/// How the coordinator reaches its shards, wherever they run.
pub trait ShardRoute: Send + Sync {
    fn connect(&self, shard_id: u16, session: Option<SessionInfo>) -> Result<(), FleetError>;
    fn send(&self, shard_id: u16, payload: SendPayload) -> Result<(), FleetError>;
    fn destroy(&self, shard_id: u16, code: u16) -> Result<(), FleetError>;
}

/// A guild-wait deadline elapsed. Stale generations are ignored.
#[derive(Debug, Clone, Copy)]
pub struct GuildTimeout {
    pub shard_id: u16,
    pub generation: u64,
}

pub struct Fleet {
    config: FleetConfig,
    route: Arc<dyn ShardRoute>,
    events: mpsc::UnboundedSender<FleetEvent>,
    timers: mpsc::UnboundedSender<GuildTimeout>,
    records: HashMap<u16, ShardRecord>,
    buffered: VecDeque<(u16, ReceivePayload)>,
    ready: bool,
}

impl Fleet {
    pub fn new(
        config: FleetConfig,
        route: Arc<dyn ShardRoute>,
        events: mpsc::UnboundedSender<FleetEvent>,
        timers: mpsc::UnboundedSender<GuildTimeout>,
    ) -> Self {
        Fleet {
            config,
            route,
            events,
            timers,
            records: HashMap::new(),
            buffered: VecDeque::new(),
            ready: false,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }

    /// Get-or-create the record for a shard. Creating it never connects;
    /// that happens at most once, in [`Fleet::connect_all`].
    pub fn ensure_shard(&mut self, shard_id: u16) -> &mut ShardRecord {
        self.records
            .entry(shard_id)
            .or_insert_with(|| ShardRecord::new(shard_id))
    }

    /// Issue a connect for every shard still Idle.
    pub fn connect_all(&mut self, shard_ids: &[u16]) -> Result<(), FleetError> {
        for &shard_id in shard_ids {
            let record = self.ensure_shard(shard_id);
            if record.status != ShardStatus::Idle {
                continue;
            }
            record.status = ShardStatus::Connecting;
            let session = record.session.clone();
            self.route.connect(shard_id, session)?;
        }
        Ok(())
    }

    pub fn send(&self, shard_id: u16, payload: SendPayload) -> Result<(), FleetError> {
        if !self.records.contains_key(&shard_id) {
            return Err(FleetError::UnknownShard(shard_id));
        }
        self.route.send(shard_id, payload)
    }

    /// Send to every non-Idle shard; per-shard failures become error events
    /// and never abort the loop.
    pub fn broadcast(&mut self, payload: SendPayload) {
        let targets: Vec<u16> = self
            .records
            .values()
            .filter(|record| record.status != ShardStatus::Idle)
            .map(|record| record.shard_id)
            .collect();
        for shard_id in targets {
            if let Err(err) = self.route.send(shard_id, payload.clone()) {
                self.emit(FleetEvent::ShardError {
                    shard_id,
                    error: WireError::new("SendError", err.to_string()),
                });
            }
        }
    }

    pub fn destroy_all(&mut self, code: u16) {
        for record in self.records.values_mut() {
            if record.status == ShardStatus::Idle {
                continue;
            }
            record.status = ShardStatus::Disconnected;
            if let Err(err) = self.route.destroy(record.shard_id, code) {
                tracing::warn!(shard = record.shard_id, "destroy failed: {err}");
            }
        }
    }

    /// Persisted sessions for a set of shards, for worker respawns.
    pub fn sessions_for(&self, shard_ids: &[u16]) -> Vec<(u16, Option<SessionInfo>)> {
        shard_ids
            .iter()
            .map(|&shard_id| {
                let session = self
                    .records
                    .get(&shard_id)
                    .and_then(|record| record.session.clone());
                (shard_id, session)
            })
            .collect()
    }

    /// Reset records for shards whose worker died, so a respawned worker's
    /// connects are issued again.
    pub fn reset_shards(&mut self, shard_ids: &[u16]) {
        for &shard_id in shard_ids {
            let record = self.ensure_shard(shard_id);
            record.status = ShardStatus::Idle;
        }
    }

    pub fn handle_shard_event(&mut self, shard_id: u16, event: ShardEvent) {
        match event {
            ShardEvent::Dispatch { payload } => self.handle_dispatch(shard_id, payload),
            ShardEvent::Resumed { replayed } => {
                self.ensure_shard(shard_id).status = ShardStatus::Ready;
                self.emit(FleetEvent::ShardResumed { shard_id, replayed });
                self.check_fleet_ready();
            }
            ShardEvent::HeartbeatComplete { latency_ms } => {
                self.ensure_shard(shard_id).latency_ms = Some(latency_ms);
            }
            ShardEvent::Closed { code } => {
                let resumable = is_resumable(code);
                let record = self.ensure_shard(shard_id);
                record.observe_close(code, resumable);
                if record.status == ShardStatus::Reconnecting {
                    self.emit(FleetEvent::ShardReconnecting { shard_id });
                } else {
                    self.emit(FleetEvent::ShardDisconnected { shard_id, code });
                }
            }
            ShardEvent::SessionUpdate { session } => {
                self.ensure_shard(shard_id).session = session;
            }
            ShardEvent::Error { name, message } => {
                self.emit(FleetEvent::ShardError {
                    shard_id,
                    error: WireError::new(name, message),
                });
            }
        }
    }

    /// Surface an error a worker reported over the control channel.
    pub fn worker_error(&mut self, shard_id: Option<u16>, error: WireError) {
        match shard_id {
            Some(shard_id) => self.emit(FleetEvent::ShardError { shard_id, error }),
            None => tracing::error!("worker error: {error}"),
        }
    }

    /// Apply a guild-wait deadline. Only the latest timer generation for a
    /// shard still waiting may fire.
    pub fn guild_timeout(&mut self, timeout: GuildTimeout) {
        let fire = self.records.get(&timeout.shard_id).is_some_and(|record| {
            record.guild_timer_generation == timeout.generation
                && record.status == ShardStatus::WaitingForGuilds
        });
        if fire {
            tracing::warn!(
                shard = timeout.shard_id,
                "timed out waiting for guilds, marking the shard ready"
            );
            self.mark_shard_ready(timeout.shard_id);
        }
    }

    fn handle_dispatch(&mut self, shard_id: u16, payload: ReceivePayload) {
        self.ensure_shard(shard_id).observe_sequence(payload.s);

        match payload.event_name() {
            Some("READY") => self.on_ready_dispatch(shard_id, &payload.d),
            Some("GUILD_CREATE") | Some("GUILD_DELETE") => {
                if let Some(guild_id) = payload.d.get("id").and_then(Value::as_str) {
                    let guild_id = guild_id.to_string();
                    let drained = {
                        let record = self.ensure_shard(shard_id);
                        record.status == ShardStatus::WaitingForGuilds
                            && record.drain_guild(&guild_id)
                    };
                    if drained {
                        // Abort the timer the instant the set drains.
                        self.ensure_shard(shard_id).next_timer_generation();
                        self.mark_shard_ready(shard_id);
                    }
                }
            }
            _ => {}
        }

        self.forward(shard_id, payload);
    }

    fn on_ready_dispatch(&mut self, shard_id: u16, d: &Value) {
        let has_guilds_intent = self.config.has_guilds_intent();
        let wait = self.config.wait_guild_timeout;

        let waiting = {
            let record = self.ensure_shard(shard_id);
            record.snapshot_guilds(d);
            if !has_guilds_intent {
                record.pending_guilds.clear();
            }
            if record.pending_guilds.is_empty() {
                None
            } else {
                record.status = ShardStatus::WaitingForGuilds;
                Some(record.next_timer_generation())
            }
        };

        match waiting {
            None => self.mark_shard_ready(shard_id),
            Some(generation) => {
                let timers = self.timers.clone();
                let timer = tokio::spawn(async move {
                    tokio::time::sleep(wait).await;
                    let _ = timers.send(GuildTimeout {
                        shard_id,
                        generation,
                    });
                });
                self.ensure_shard(shard_id).guild_timer = Some(timer.abort_handle());
            }
        }
    }

    fn mark_shard_ready(&mut self, shard_id: u16) {
        let unavailable = {
            let record = self.ensure_shard(shard_id);
            record.status = ShardStatus::Ready;
            record.guild_timer = None;
            std::mem::take(&mut record.pending_guilds)
        };
        tracing::info!(shard = shard_id, "shard ready");
        self.emit(FleetEvent::ShardReady {
            shard_id,
            unavailable,
        });
        self.check_fleet_ready();
    }

    fn check_fleet_ready(&mut self) {
        if self.ready || self.records.is_empty() {
            return;
        }
        if !self
            .records
            .values()
            .all(|record| record.status == ShardStatus::Ready)
        {
            return;
        }
        self.ready = true;
        let buffered = std::mem::take(&mut self.buffered);
        tracing::info!(
            packets = buffered.len(),
            "fleet ready, replaying buffered packets"
        );
        for (shard_id, payload) in buffered {
            self.emit(FleetEvent::Dispatch { shard_id, payload });
        }
        self.emit(FleetEvent::Ready);
    }

    fn forward(&mut self, shard_id: u16, payload: ReceivePayload) {
        let whitelisted = payload
            .event_name()
            .is_some_and(|name| BEFORE_READY_WHITELIST.contains(&name));
        if self.ready || whitelisted {
            self.emit(FleetEvent::Dispatch { shard_id, payload });
            return;
        }
        match &self.config.buffer_policy {
            BufferPolicy::Buffer { cap } => {
                if let Some(cap) = cap
                    && self.buffered.len() >= *cap
                {
                    self.buffered.pop_front();
                    tracing::warn!("pre-ready buffer at capacity, dropping the oldest packet");
                }
                self.buffered.push_back((shard_id, payload));
            }
            BufferPolicy::Drop => {
                tracing::trace!(shard = shard_id, "dropping pre-ready packet");
            }
        }
    }

    fn emit(&self, event: FleetEvent) {
        let _ = self.events.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{GUILDS_INTENT, ShardSelection};
    use parking_lot::Mutex;
    use serde_json::json;
    use stratus_codec::Opcode;

    #[derive(Debug, PartialEq, Eq)]
    enum RouteCall {
        Connect(u16, bool),
        Send(u16, Opcode),
        Destroy(u16, u16),
    }

    #[derive(Default)]
    struct RecordingRoute {
        calls: Mutex<Vec<RouteCall>>,
    }

    impl ShardRoute for RecordingRoute {
        fn connect(&self, shard_id: u16, session: Option<SessionInfo>) -> Result<(), FleetError> {
            self.calls
                .lock()
                .push(RouteCall::Connect(shard_id, session.is_some()));
            Ok(())
        }

        fn send(&self, shard_id: u16, payload: SendPayload) -> Result<(), FleetError> {
            self.calls.lock().push(RouteCall::Send(shard_id, payload.op));
            Ok(())
        }

        fn destroy(&self, shard_id: u16, code: u16) -> Result<(), FleetError> {
            self.calls.lock().push(RouteCall::Destroy(shard_id, code));
            Ok(())
        }
    }

    struct Harness {
        fleet: Fleet,
        route: Arc<RecordingRoute>,
        events: mpsc::UnboundedReceiver<FleetEvent>,
        timers: mpsc::UnboundedReceiver<GuildTimeout>,
    }

    fn harness(intents: u64) -> Harness {
        let mut config = FleetConfig::new("token", intents);
        config.shards = ShardSelection::Explicit {
            ids: vec![0, 1],
            total: 2,
        };
        config.wait_guild_timeout = std::time::Duration::from_millis(50);
        let route = Arc::new(RecordingRoute::default());
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (timers_tx, timers_rx) = mpsc::unbounded_channel();
        Harness {
            fleet: Fleet::new(config, Arc::clone(&route) as Arc<dyn ShardRoute>, events_tx, timers_tx),
            route,
            events: events_rx,
            timers: timers_rx,
        }
    }

    fn dispatch(t: &str, s: u64, d: Value) -> ShardEvent {
        ShardEvent::Dispatch {
            payload: ReceivePayload {
                op: Opcode::Dispatch,
                d,
                s: Some(s),
                t: Some(t.to_string()),
            },
        }
    }

    fn ready_dispatch(s: u64, guilds: Value) -> ShardEvent {
        dispatch("READY", s, json!({"session_id": "sess", "guilds": guilds}))
    }

    fn drain_events(events: &mut mpsc::UnboundedReceiver<FleetEvent>) -> Vec<FleetEvent> {
        let mut out = Vec::new();
        while let Ok(event) = events.try_recv() {
            out.push(event);
        }
        out
    }

    #[tokio::test]
    async fn test_ensure_shard_is_idempotent() {
        let mut h = harness(0);
        h.fleet.ensure_shard(0);
        h.fleet.ensure_shard(0);
        assert_eq!(h.fleet.records.len(), 1);

        h.fleet.connect_all(&[0, 1]).unwrap();
        h.fleet.connect_all(&[0, 1]).unwrap();
        // Connect issued exactly once per shard.
        assert_eq!(
            *h.route.calls.lock(),
            vec![RouteCall::Connect(0, false), RouteCall::Connect(1, false)]
        );
    }

    #[tokio::test]
    async fn test_fleet_ready_requires_every_shard() {
        let mut h = harness(0);
        h.fleet.connect_all(&[0, 1]).unwrap();

        h.fleet.handle_shard_event(0, ready_dispatch(1, json!([])));
        assert!(!h.fleet.is_ready());

        h.fleet.handle_shard_event(1, ready_dispatch(1, json!([])));
        assert!(h.fleet.is_ready());

        let events = drain_events(&mut h.events);
        assert!(events.iter().any(|e| matches!(e, FleetEvent::Ready)));
    }

    #[tokio::test]
    async fn test_shard_regression_suppresses_the_flip() {
        let mut h = harness(0);
        h.fleet.connect_all(&[0, 1]).unwrap();

        h.fleet.handle_shard_event(0, ready_dispatch(1, json!([])));
        // Shard 0 regresses before shard 1 arrives.
        h.fleet.handle_shard_event(0, ShardEvent::Closed { code: 4000 });
        h.fleet.handle_shard_event(1, ready_dispatch(1, json!([])));
        assert!(!h.fleet.is_ready());

        // Its recovery completes the fleet.
        h.fleet.handle_shard_event(0, ShardEvent::Resumed { replayed: 0 });
        assert!(h.fleet.is_ready());
    }

    #[tokio::test]
    async fn test_pre_ready_buffering_and_replay_order() {
        let mut h = harness(0);
        h.fleet.connect_all(&[0, 1]).unwrap();
        h.fleet.handle_shard_event(0, ready_dispatch(1, json!([])));

        // Not whitelisted: buffered, not forwarded.
        h.fleet
            .handle_shard_event(0, dispatch("MESSAGE_CREATE", 2, json!({"id": "m1"})));
        h.fleet
            .handle_shard_event(0, dispatch("MESSAGE_CREATE", 3, json!({"id": "m2"})));
        // Whitelisted: passes through immediately.
        h.fleet
            .handle_shard_event(0, dispatch("GUILD_MEMBER_ADD", 4, json!({})));

        let before: Vec<String> = drain_events(&mut h.events)
            .into_iter()
            .filter_map(|event| match event {
                FleetEvent::Dispatch { payload, .. } => payload.t,
                _ => None,
            })
            .collect();
        assert_eq!(before, vec!["READY", "GUILD_MEMBER_ADD"]);

        h.fleet.handle_shard_event(1, ready_dispatch(1, json!([])));
        let after = drain_events(&mut h.events);
        let replayed: Vec<String> = after
            .iter()
            .filter_map(|event| match event {
                FleetEvent::Dispatch { payload, .. } => {
                    payload.d.get("id").and_then(Value::as_str).map(str::to_string)
                }
                _ => None,
            })
            .collect();
        assert_eq!(replayed, vec!["m1", "m2"]);
        // Ready comes after the replay.
        assert!(matches!(after.last(), Some(FleetEvent::Ready)));
    }

    #[tokio::test]
    async fn test_buffer_cap_drops_oldest() {
        let mut h = harness(0);
        h.fleet.config.buffer_policy = BufferPolicy::Buffer { cap: Some(2) };
        h.fleet.connect_all(&[0]).unwrap();

        for n in 0..3 {
            h.fleet
                .handle_shard_event(0, dispatch("MESSAGE_CREATE", n + 1, json!({"n": n})));
        }
        assert_eq!(h.fleet.buffered.len(), 2);
        assert_eq!(h.fleet.buffered[0].1.d["n"], 1);
    }

    #[tokio::test]
    async fn test_drop_policy_still_updates_state() {
        let mut h = harness(0);
        h.fleet.config.buffer_policy = BufferPolicy::Drop;
        h.fleet.connect_all(&[0]).unwrap();

        h.fleet
            .handle_shard_event(0, dispatch("MESSAGE_CREATE", 9, json!({})));
        assert!(h.fleet.buffered.is_empty());
        assert_eq!(h.fleet.records[&0].sequence, 9);
    }

    #[tokio::test]
    async fn test_guild_wait_drains_then_ready() {
        let mut h = harness(GUILDS_INTENT);
        h.fleet.connect_all(&[0]).unwrap();

        h.fleet
            .handle_shard_event(0, ready_dispatch(1, json!([{"id": "a"}, {"id": "b"}])));
        assert_eq!(
            h.fleet.records[&0].status,
            ShardStatus::WaitingForGuilds
        );

        h.fleet
            .handle_shard_event(0, dispatch("GUILD_CREATE", 2, json!({"id": "a"})));
        assert!(!h.fleet.is_ready());
        h.fleet
            .handle_shard_event(0, dispatch("GUILD_CREATE", 3, json!({"id": "b"})));
        assert!(h.fleet.is_ready());

        // The drained shard reports no unavailable guilds.
        let events = drain_events(&mut h.events);
        let unavailable = events
            .iter()
            .find_map(|event| match event {
                FleetEvent::ShardReady { unavailable, .. } => Some(unavailable.clone()),
                _ => None,
            })
            .unwrap();
        assert!(unavailable.is_empty());
    }

    #[tokio::test]
    async fn test_guild_timeout_marks_ready_with_unavailable_set() {
        let mut h = harness(GUILDS_INTENT);
        h.fleet.connect_all(&[0]).unwrap();

        h.fleet
            .handle_shard_event(0, ready_dispatch(1, json!([{"id": "a"}])));
        let timeout = h.timers.recv().await.unwrap();
        h.fleet.guild_timeout(timeout);

        assert!(h.fleet.is_ready());
        let events = drain_events(&mut h.events);
        let unavailable = events
            .iter()
            .find_map(|event| match event {
                FleetEvent::ShardReady { unavailable, .. } => Some(unavailable.clone()),
                _ => None,
            })
            .unwrap();
        assert!(unavailable.contains("a"));
    }

    #[tokio::test]
    async fn test_early_drain_aborts_the_guild_timer() {
        let mut h = harness(GUILDS_INTENT);
        h.fleet.connect_all(&[0]).unwrap();

        h.fleet
            .handle_shard_event(0, ready_dispatch(1, json!([{"id": "a"}])));
        h.fleet
            .handle_shard_event(0, dispatch("GUILD_CREATE", 2, json!({"id": "a"})));
        assert!(h.fleet.is_ready());

        // The armed timer was aborted on the drain, so its deadline never
        // reaches the channel.
        let outcome = tokio::time::timeout(
            std::time::Duration::from_millis(150),
            h.timers.recv(),
        )
        .await;
        assert!(outcome.is_err());
    }

    #[tokio::test]
    async fn test_stale_guild_timeout_is_ignored() {
        let mut h = harness(GUILDS_INTENT);
        h.fleet.connect_all(&[0]).unwrap();

        h.fleet
            .handle_shard_event(0, ready_dispatch(1, json!([{"id": "a"}])));
        h.fleet
            .handle_shard_event(0, dispatch("GUILD_CREATE", 2, json!({"id": "a"})));
        assert!(h.fleet.is_ready());
        let ready_events = drain_events(&mut h.events)
            .iter()
            .filter(|event| matches!(event, FleetEvent::ShardReady { .. }))
            .count();
        assert_eq!(ready_events, 1);

        // A deadline from the superseded generation must no-op even if it
        // was already in flight when the abort landed.
        h.fleet.guild_timeout(GuildTimeout {
            shard_id: 0,
            generation: 1,
        });
        assert!(drain_events(&mut h.events).is_empty());
    }

    #[tokio::test]
    async fn test_without_guilds_intent_ready_is_immediate() {
        let mut h = harness(0);
        h.fleet.connect_all(&[0]).unwrap();

        h.fleet
            .handle_shard_event(0, ready_dispatch(1, json!([{"id": "a"}])));
        assert!(h.fleet.is_ready());
    }

    #[tokio::test]
    async fn test_broadcast_targets_non_idle_shards() {
        let mut h = harness(0);
        h.fleet.connect_all(&[0]).unwrap();
        h.fleet.ensure_shard(1);

        h.fleet
            .broadcast(SendPayload::new(Opcode::PresenceUpdate, json!({})));
        let calls = h.route.calls.lock();
        // Shard 0 is connecting, shard 1 is still Idle.
        assert!(calls.contains(&RouteCall::Send(0, Opcode::PresenceUpdate)));
        assert!(!calls.contains(&RouteCall::Send(1, Opcode::PresenceUpdate)));
    }

    #[tokio::test]
    async fn test_session_updates_are_persisted_for_respawn() {
        let mut h = harness(0);
        h.fleet.connect_all(&[0]).unwrap();

        let session = SessionInfo {
            session_id: "sess".to_string(),
            resume_url: "wss://resume".to_string(),
            sequence: 12,
            shard_id: 0,
            shard_count: 2,
        };
        h.fleet.handle_shard_event(
            0,
            ShardEvent::SessionUpdate {
                session: Some(session),
            },
        );

        let sessions = h.fleet.sessions_for(&[0, 1]);
        assert_eq!(sessions[0].1.as_ref().unwrap().sequence, 12);
        assert!(sessions[1].1.is_none());

        // After a reset, connect is issued again, this time with the session.
        h.fleet.reset_shards(&[0]);
        h.fleet.connect_all(&[0]).unwrap();
        assert!(h.route.calls.lock().contains(&RouteCall::Connect(0, true)));
    }
}
