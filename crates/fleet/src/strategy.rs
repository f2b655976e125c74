//! Worker Distribution Strategy
//!
//! Chunks of shard ids run on OS worker threads, each with its own
//! current-thread runtime. Only the control channel crosses the thread
//! boundary. A forwarder thread per worker pumps its reports into one
//! async inbox; a disconnected channel is how a dead worker is noticed.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use uuid::Uuid;

use stratus_codec::SendPayload;
use stratus_shard::{SessionInfo, ShardConfig};
use stratus_transport::{ControlSender, CoordinatorMessage, WorkerMessage, control_channel};

use crate::error::FleetError;
use crate::fleet::ShardRoute;
use crate::worker;

const CONTROL_CHANNEL_CAPACITY: usize = 256;

/// Everything the coordinator pump consumes, across all workers.
pub enum StrategyEvent {
    Message {
        worker_id: usize,
        message: WorkerMessage,
    },
    WorkerDied {
        worker_id: usize,
    },
}

pub struct WorkerStrategy {
    shard_config: ShardConfig,
    /// Index is the worker id
    assignments: Vec<Vec<u16>>,
    routes: HashMap<u16, usize>,
    senders: Mutex<HashMap<usize, ControlSender<CoordinatorMessage>>>,
    retries: Mutex<HashMap<usize, u32>>,
    inbox: mpsc::UnboundedSender<StrategyEvent>,
}

impl WorkerStrategy {
    pub fn new(
        shard_config: ShardConfig,
        assignments: Vec<Vec<u16>>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<StrategyEvent>) {
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        let mut routes = HashMap::new();
        for (worker_id, shard_ids) in assignments.iter().enumerate() {
            for &shard_id in shard_ids {
                routes.insert(shard_id, worker_id);
            }
        }
        let strategy = Arc::new(WorkerStrategy {
            shard_config,
            assignments,
            routes,
            senders: Mutex::new(HashMap::new()),
            retries: Mutex::new(HashMap::new()),
            inbox: inbox_tx,
        });
        (strategy, inbox_rx)
    }

    pub fn worker_count(&self) -> usize {
        self.assignments.len()
    }

    pub fn assignment(&self, worker_id: usize) -> &[u16] {
        self.assignments
            .get(worker_id)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn spawn_all(&self) -> Result<(), FleetError> {
        for worker_id in 0..self.assignments.len() {
            self.spawn_worker(worker_id)?;
        }
        Ok(())
    }

    /// Spawn (or respawn) one worker and its forwarder.
    pub fn spawn_worker(&self, worker_id: usize) -> Result<(), FleetError> {
        let (coordinator, worker_end) = control_channel(CONTROL_CHANNEL_CAPACITY);

        let config = self.shard_config.clone();
        std::thread::Builder::new()
            .name(format!("stratus-worker-{worker_id}"))
            .spawn(move || worker::run_worker(worker_end, worker_id, config))?;

        let receiver = coordinator.receiver;
        let inbox = self.inbox.clone();
        std::thread::Builder::new()
            .name(format!("stratus-worker-{worker_id}-pump"))
            .spawn(move || {
                loop {
                    match receiver.recv() {
                        Ok(message) => {
                            if inbox
                                .send(StrategyEvent::Message { worker_id, message })
                                .is_err()
                            {
                                return;
                            }
                        }
                        Err(_) => {
                            let _ = inbox.send(StrategyEvent::WorkerDied { worker_id });
                            return;
                        }
                    }
                }
            })?;

        tracing::info!(
            worker = worker_id,
            shards = ?self.assignment(worker_id),
            "worker spawned"
        );
        self.senders.lock().insert(worker_id, coordinator.sender);
        Ok(())
    }

    /// Count a restart attempt for a worker.
    pub fn note_retry(&self, worker_id: usize) -> u32 {
        let mut retries = self.retries.lock();
        let attempt = retries.entry(worker_id).or_insert(0);
        *attempt += 1;
        *attempt
    }

    pub fn grant_identify(&self, worker_id: usize, nonce: Uuid) -> Result<(), FleetError> {
        let sender = self
            .senders
            .lock()
            .get(&worker_id)
            .cloned()
            .ok_or(FleetError::WorkerDied { worker_id })?;
        sender.send(&CoordinatorMessage::ShardCanIdentify { nonce })?;
        Ok(())
    }

    fn sender_for(&self, shard_id: u16) -> Result<ControlSender<CoordinatorMessage>, FleetError> {
        let worker_id = *self
            .routes
            .get(&shard_id)
            .ok_or(FleetError::UnknownShard(shard_id))?;
        self.senders
            .lock()
            .get(&worker_id)
            .cloned()
            .ok_or(FleetError::WorkerDied { worker_id })
    }
}

impl ShardRoute for WorkerStrategy {
    fn connect(&self, shard_id: u16, session: Option<SessionInfo>) -> Result<(), FleetError> {
        self.sender_for(shard_id)?
            .send(&CoordinatorMessage::Connect { shard_id, session })?;
        Ok(())
    }

    fn send(&self, shard_id: u16, payload: SendPayload) -> Result<(), FleetError> {
        self.sender_for(shard_id)?
            .send(&CoordinatorMessage::Send { shard_id, payload })?;
        Ok(())
    }

    fn destroy(&self, shard_id: u16, code: u16) -> Result<(), FleetError> {
        self.sender_for(shard_id)?
            .send(&CoordinatorMessage::Destroy { shard_id, code })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stratus_codec::{CompressionMode, Encoding};
    use stratus_shard::IdentifyProperties;

    fn shard_config() -> ShardConfig {
        ShardConfig {
            token: "t".to_string(),
            intents: 0,
            shard_count: 4,
            gateway_url: "ws://127.0.0.1:1".to_string(),
            encoding: Encoding::Json,
            compression: CompressionMode::None,
            packer_factory: None,
            properties: IdentifyProperties::default(),
        }
    }

    #[tokio::test]
    async fn test_routes_follow_assignments() {
        let (strategy, _inbox) =
            WorkerStrategy::new(shard_config(), vec![vec![0, 1], vec![2, 3]]);
        assert_eq!(strategy.worker_count(), 2);
        assert_eq!(strategy.routes[&0], 0);
        assert_eq!(strategy.routes[&3], 1);
        assert_eq!(strategy.assignment(1), &[2, 3]);

        // No worker spawned yet: routing resolves but delivery cannot.
        let err = strategy
            .send(2, SendPayload::new(stratus_codec::Opcode::Heartbeat, 1.into()))
            .unwrap_err();
        assert!(matches!(err, FleetError::WorkerDied { worker_id: 1 }));

        let err = strategy
            .send(9, SendPayload::new(stratus_codec::Opcode::Heartbeat, 1.into()))
            .unwrap_err();
        assert!(matches!(err, FleetError::UnknownShard(9)));
    }

    #[test]
    fn test_retry_counter_accumulates() {
        let (strategy, _inbox) = WorkerStrategy::new(shard_config(), vec![vec![0]]);
        assert_eq!(strategy.note_retry(0), 1);
        assert_eq!(strategy.note_retry(0), 2);
        assert_eq!(strategy.note_retry(1), 1);
    }
}
