//! Identify Throttling
//!
//! The gateway allows `max_concurrency` concurrent identifies, one per
//! bucket (`shard_id % max_concurrency`), with spacing between grants in
//! the same bucket. [`BucketGate`] enforces that on the coordinator.
//! [`RemoteGate`] is the worker-side counterpart: it asks the coordinator
//! for a grant over the control channel and suspends until the answer with
//! its nonce comes back.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::{Mutex, oneshot};
use tokio::time::Instant;
use uuid::Uuid;

use stratus_shard::IdentifyGate;
use stratus_transport::{ControlSender, WorkerMessage};

const IDENTIFY_SPACING: Duration = Duration::from_secs(5);

/// One identify per bucket at a time, spaced grants within a bucket.
pub struct BucketGate {
    buckets: Vec<Mutex<Option<Instant>>>,
    spacing: Duration,
}

impl BucketGate {
    pub fn new(max_concurrency: u16) -> Self {
        Self::with_spacing(max_concurrency, IDENTIFY_SPACING)
    }

    pub fn with_spacing(max_concurrency: u16, spacing: Duration) -> Self {
        let buckets = (0..max_concurrency.max(1))
            .map(|_| Mutex::new(None))
            .collect();
        BucketGate { buckets, spacing }
    }
}

#[async_trait]
impl IdentifyGate for BucketGate {
    async fn wait_to_identify(&self, shard_id: u16) {
        let bucket = shard_id as usize % self.buckets.len();
        // Holding the bucket lock keeps grants in the bucket serialized.
        let mut last_grant = self.buckets[bucket].lock().await;
        if let Some(at) = *last_grant {
            tokio::time::sleep_until(at + self.spacing).await;
        }
        tracing::debug!(shard = shard_id, bucket, "identify granted");
        *last_grant = Some(Instant::now());
    }
}

/// Worker-side gate: one control-channel round trip per identify.
pub struct RemoteGate {
    sender: ControlSender<WorkerMessage>,
    pending: parking_lot::Mutex<HashMap<Uuid, oneshot::Sender<()>>>,
}

impl RemoteGate {
    pub fn new(sender: ControlSender<WorkerMessage>) -> Arc<Self> {
        Arc::new(RemoteGate {
            sender,
            pending: parking_lot::Mutex::new(HashMap::new()),
        })
    }

    /// Resolve a pending request. Unknown nonces are ignored.
    pub fn grant(&self, nonce: Uuid) {
        let waiter = self.pending.lock().remove(&nonce);
        match waiter {
            Some(tx) => {
                let _ = tx.send(());
            }
            None => tracing::warn!(%nonce, "identify grant for an unknown nonce"),
        }
    }
}

#[async_trait]
impl IdentifyGate for RemoteGate {
    async fn wait_to_identify(&self, shard_id: u16) {
        let nonce = Uuid::new_v4();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(nonce, tx);

        let request = WorkerMessage::WaitForIdentify { nonce, shard_id };
        if self.sender.send(&request).is_err() {
            // Coordinator gone; identifying anyway beats wedging the shard.
            self.pending.lock().remove(&nonce);
            tracing::warn!(
                shard = shard_id,
                "control channel closed, identifying without a grant"
            );
            return;
        }

        if rx.await.is_err() {
            tracing::warn!(shard = shard_id, "identify grant dropped, proceeding");
        }
    }
}
