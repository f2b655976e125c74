//! Worker Bootstrap
//!
//! Runs inside a worker thread on a current-thread runtime. Shards are
//! built on their first Connect command; every shard event is forwarded to
//! the coordinator over the control channel, and commands are serviced in
//! the same loop. The worker stops when the coordinator side of the channel
//! goes away.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc;

use stratus_shard::{IdentifyGate, SessionInfo, Shard, ShardConfig, ShardEvent};
use stratus_transport::{
    ControlSender, CoordinatorMessage, WireError, WorkerEnd, WorkerMessage,
};

use crate::throttle::RemoteGate;

/// Worker thread entry point.
pub(crate) fn run_worker(end: WorkerEnd, worker_id: usize, config: ShardConfig) {
    let WorkerEnd { sender, receiver } = end;

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(err) => {
            let _ = sender.send(&WorkerMessage::Error {
                shard_id: None,
                error: WireError::new("RuntimeError", err.to_string()),
            });
            return;
        }
    };

    // Bridge the blocking command reads into the async loop. The bridge
    // exits when the coordinator drops its end, which closes `commands`
    // and winds the worker down.
    let (command_tx, command_rx) = mpsc::unbounded_channel();
    std::thread::spawn(move || {
        while let Ok(message) = receiver.recv() {
            if command_tx.send(message).is_err() {
                break;
            }
        }
    });

    tracing::debug!(worker = worker_id, "worker runtime starting");
    runtime.block_on(WorkerBootstrap::new(sender, command_rx, config).run());
    tracing::debug!(worker = worker_id, "worker runtime stopped");
}

struct WorkerBootstrap {
    sender: ControlSender<WorkerMessage>,
    commands: mpsc::UnboundedReceiver<CoordinatorMessage>,
    config: ShardConfig,
    gate: Arc<RemoteGate>,
    shards: HashMap<u16, Shard>,
    events_tx: mpsc::UnboundedSender<(u16, ShardEvent)>,
    events_rx: mpsc::UnboundedReceiver<(u16, ShardEvent)>,
}

impl WorkerBootstrap {
    fn new(
        sender: ControlSender<WorkerMessage>,
        commands: mpsc::UnboundedReceiver<CoordinatorMessage>,
        config: ShardConfig,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let gate = RemoteGate::new(sender.clone());
        WorkerBootstrap {
            sender,
            commands,
            config,
            gate,
            shards: HashMap::new(),
            events_tx,
            events_rx,
        }
    }

    async fn run(mut self) {
        if self.sender.send(&WorkerMessage::Ready).is_err() {
            return;
        }

        loop {
            tokio::select! {
                Some((shard_id, event)) = self.events_rx.recv() => {
                    if self
                        .sender
                        .send(&WorkerMessage::Event { shard_id, event })
                        .is_err()
                    {
                        tracing::warn!("coordinator gone, stopping worker");
                        return;
                    }
                }
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => return,
                },
            }
        }
    }

    fn handle_command(&mut self, command: CoordinatorMessage) {
        match command {
            CoordinatorMessage::Connect { shard_id, session } => {
                self.connect_shard(shard_id, session);
            }
            CoordinatorMessage::Send { shard_id, payload } => match self.shards.get(&shard_id) {
                Some(shard) => {
                    if let Err(err) = shard.send(payload) {
                        self.report_error(shard_id, "SendError", &err.to_string());
                    }
                }
                None => {
                    self.report_error(shard_id, "UnknownShard", "send for an unassigned shard");
                }
            },
            CoordinatorMessage::Destroy { shard_id, code } => {
                if let Some(shard) = self.shards.remove(&shard_id)
                    && let Err(err) = shard.destroy(code)
                {
                    self.report_error(shard_id, "DestroyError", &err.to_string());
                }
            }
            CoordinatorMessage::ShardCanIdentify { nonce } => self.gate.grant(nonce),
        }
    }

    fn connect_shard(&mut self, shard_id: u16, session: Option<SessionInfo>) {
        if let Some(shard) = self.shards.get(&shard_id) {
            if let Err(err) = shard.connect() {
                self.report_error(shard_id, "ConnectError", &err.to_string());
            }
            return;
        }

        // Tag this shard's events with its id for the shared forward loop.
        let (shard_events_tx, mut shard_events_rx) = mpsc::unbounded_channel();
        let events = self.events_tx.clone();
        tokio::spawn(async move {
            while let Some(event) = shard_events_rx.recv().await {
                if events.send((shard_id, event)).is_err() {
                    break;
                }
            }
        });

        let shard = Shard::spawn(
            shard_id,
            self.config.clone(),
            Arc::clone(&self.gate) as Arc<dyn IdentifyGate>,
            session,
            shard_events_tx,
        );
        if let Err(err) = shard.connect() {
            self.report_error(shard_id, "ConnectError", &err.to_string());
        }
        self.shards.insert(shard_id, shard);
    }

    fn report_error(&self, shard_id: u16, name: &str, message: &str) {
        tracing::warn!(shard = shard_id, "{name}: {message}");
        let _ = self.sender.send(&WorkerMessage::Error {
            shard_id: Some(shard_id),
            error: WireError::new(name, message),
        });
    }
}
