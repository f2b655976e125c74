//! Fleet Client
//!
//! The assembled stack: gateway metadata, identify throttle, worker
//! strategy, and the coordinator pump, behind a small command handle.

use std::sync::Arc;

use tokio::sync::mpsc;

use stratus_codec::SendPayload;
use stratus_shard::{CLOSE_NORMAL, IdentifyGate, ShardConfig};
use stratus_transport::{WireError, WorkerMessage};

use crate::config::{FleetConfig, RestartPolicy};
use crate::error::FleetError;
use crate::events::FleetEvent;
use crate::fleet::{Fleet, GuildTimeout, ShardRoute};
use crate::info::GatewayInfoProvider;
use crate::strategy::{StrategyEvent, WorkerStrategy};
use crate::throttle::BucketGate;

enum ClientCommand {
    Send { shard_id: u16, payload: SendPayload },
    Broadcast { payload: SendPayload },
    Shutdown,
}

/// Handle to a running fleet.
pub struct FleetClient {
    commands: mpsc::UnboundedSender<ClientCommand>,
}

impl FleetClient {
    /// Resolve shards against gateway metadata, spawn the workers, and
    /// start connecting. Events begin flowing on the returned receiver
    /// immediately.
    pub async fn connect(
        config: FleetConfig,
        info_provider: Arc<dyn GatewayInfoProvider>,
    ) -> Result<(FleetClient, mpsc::UnboundedReceiver<FleetEvent>), FleetError> {
        config.validate()?;
        let info = info_provider.gateway_info().await?;
        let (shard_ids, total) = config.resolve_shards(info.shards)?;
        tracing::info!(
            shards = shard_ids.len(),
            total,
            max_concurrency = info.session_start_limit.max_concurrency,
            "starting fleet"
        );

        let shard_config = ShardConfig {
            token: config.token.clone(),
            intents: config.intents,
            shard_count: total,
            gateway_url: info.url.clone(),
            encoding: config.encoding,
            compression: config.compression,
            packer_factory: config.packer_factory.clone(),
            properties: config.properties.clone(),
        };

        let assignments = config.chunk_shards(&shard_ids);
        let (strategy, inbox) = WorkerStrategy::new(shard_config, assignments);
        strategy.spawn_all()?;

        let gate: Arc<dyn IdentifyGate> = match &config.identify_gate {
            Some(gate) => Arc::clone(gate),
            None => Arc::new(BucketGate::new(info.session_start_limit.max_concurrency)),
        };

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (timers_tx, timers_rx) = mpsc::unbounded_channel();
        let restart_policy = config.restart_policy;
        let mut fleet = Fleet::new(
            config,
            Arc::clone(&strategy) as Arc<dyn ShardRoute>,
            events_tx,
            timers_tx,
        );
        fleet.connect_all(&shard_ids)?;

        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        tokio::spawn(run_pump(
            fleet,
            strategy,
            gate,
            restart_policy,
            inbox,
            timers_rx,
            commands_rx,
        ));

        Ok((FleetClient { commands: commands_tx }, events_rx))
    }

    pub fn send(&self, shard_id: u16, payload: SendPayload) -> Result<(), FleetError> {
        self.commands
            .send(ClientCommand::Send { shard_id, payload })
            .map_err(|_| FleetError::Stopped)
    }

    pub fn broadcast(&self, payload: SendPayload) -> Result<(), FleetError> {
        self.commands
            .send(ClientCommand::Broadcast { payload })
            .map_err(|_| FleetError::Stopped)
    }

    /// Close every shard and stop the fleet.
    pub fn shutdown(&self) {
        let _ = self.commands.send(ClientCommand::Shutdown);
    }
}

async fn run_pump(
    mut fleet: Fleet,
    strategy: Arc<WorkerStrategy>,
    gate: Arc<dyn IdentifyGate>,
    restart_policy: RestartPolicy,
    mut inbox: mpsc::UnboundedReceiver<StrategyEvent>,
    mut timers: mpsc::UnboundedReceiver<GuildTimeout>,
    mut commands: mpsc::UnboundedReceiver<ClientCommand>,
) {
    loop {
        tokio::select! {
            Some(event) = inbox.recv() => match event {
                StrategyEvent::Message { worker_id, message } => {
                    handle_worker_message(&mut fleet, &strategy, &gate, worker_id, message);
                }
                StrategyEvent::WorkerDied { worker_id } => {
                    if !handle_worker_death(&mut fleet, &strategy, restart_policy, worker_id) {
                        break;
                    }
                }
            },
            Some(timeout) = timers.recv() => fleet.guild_timeout(timeout),
            command = commands.recv() => match command {
                Some(ClientCommand::Send { shard_id, payload }) => {
                    if let Err(err) = fleet.send(shard_id, payload) {
                        tracing::warn!(shard = shard_id, "send failed: {err}");
                    }
                }
                Some(ClientCommand::Broadcast { payload }) => fleet.broadcast(payload),
                Some(ClientCommand::Shutdown) | None => {
                    fleet.destroy_all(CLOSE_NORMAL);
                    break;
                }
            },
        }
    }
    tracing::debug!("fleet pump exiting");
}

fn handle_worker_message(
    fleet: &mut Fleet,
    strategy: &Arc<WorkerStrategy>,
    gate: &Arc<dyn IdentifyGate>,
    worker_id: usize,
    message: WorkerMessage,
) {
    match message {
        WorkerMessage::Ready => tracing::debug!(worker = worker_id, "worker ready"),
        WorkerMessage::Event { shard_id, event } => fleet.handle_shard_event(shard_id, event),
        WorkerMessage::WaitForIdentify { nonce, shard_id } => {
            // Grants can take seconds; never block the pump on them.
            let gate = Arc::clone(gate);
            let strategy = Arc::clone(strategy);
            tokio::spawn(async move {
                gate.wait_to_identify(shard_id).await;
                if let Err(err) = strategy.grant_identify(worker_id, nonce) {
                    tracing::warn!(worker = worker_id, "identify grant undeliverable: {err}");
                }
            });
        }
        WorkerMessage::Error { shard_id, error } => fleet.worker_error(shard_id, error),
    }
}

/// Apply the restart policy; false stops the pump.
fn handle_worker_death(
    fleet: &mut Fleet,
    strategy: &Arc<WorkerStrategy>,
    policy: RestartPolicy,
    worker_id: usize,
) -> bool {
    match policy {
        RestartPolicy::Fatal => {
            tracing::error!(worker = worker_id, "worker died, restart policy is fatal");
            fleet.worker_error(
                None,
                WireError::new("WorkerDied", format!("worker {worker_id} died")),
            );
            false
        }
        RestartPolicy::Restart { max_retries } => {
            let attempt = strategy.note_retry(worker_id);
            if attempt > max_retries {
                tracing::error!(
                    worker = worker_id,
                    attempt,
                    "worker died too many times, giving up"
                );
                fleet.worker_error(
                    None,
                    WireError::new("WorkerDied", format!("worker {worker_id} exhausted retries")),
                );
                return false;
            }
            tracing::warn!(worker = worker_id, attempt, "worker died, respawning");
            let shard_ids = strategy.assignment(worker_id).to_vec();
            if let Err(err) = strategy.spawn_worker(worker_id) {
                tracing::error!(worker = worker_id, "respawn failed: {err}");
                return false;
            }
            // Sessions live in the records; connect_all re-issues them so
            // the respawned shards resume instead of re-identifying.
            fleet.reset_shards(&shard_ids);
            if let Err(err) = fleet.connect_all(&shard_ids) {
                tracing::error!(worker = worker_id, "reconnect after respawn failed: {err}");
                return false;
            }
            true
        }
    }
}
