//! Send Governor
//!
//! A per-connection FIFO admission queue with a token-bucket send limit.
//! Callers are granted the right to send in the order they asked for it; the
//! permit they receive serializes the actual transport write. When the
//! budget for the current window is spent, the next admission sleeps until
//! the window resets — unless the connection closes first, in which case the
//! wait is abandoned with a distinct error and the caller must retry against
//! the replacement connection's governor.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{Mutex, OwnedMutexGuard, watch};
use tokio::time::Instant;

/// Sends allowed per window, with a few slots held back for heartbeats so
/// the heartbeat loop can never be starved by application traffic.
pub const SEND_LIMIT_PER_WINDOW: u32 = 120;
pub const SEND_WINDOW: Duration = Duration::from_secs(60);
const HEARTBEAT_RESERVE: u32 = 3;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GovernorError {
    /// The connection closed while this caller was waiting for admission.
    /// Distinct from a rate-limit wakeup: the caller must not send on the
    /// old connection and should retry on the new one.
    #[error("connection closed while waiting to send")]
    ConnectionClosed,
}

/// Remaining budget in the current window.
#[derive(Debug, Clone, Copy)]
pub struct RateLimitState {
    pub remaining: u32,
    pub reset_at: Instant,
}

impl RateLimitState {
    fn fresh(limit: u32, window: Duration) -> Self {
        RateLimitState {
            remaining: limit,
            reset_at: Instant::now() + window,
        }
    }
}

/// Admission guard; dropping it releases the send slot.
#[derive(Debug)]
pub struct SendPermit {
    _guard: OwnedMutexGuard<RateLimitState>,
}

/// Per-connection send governor.
pub struct SendGovernor {
    limit: u32,
    window: Duration,
    state: Arc<Mutex<RateLimitState>>,
    closed: watch::Receiver<bool>,
}

impl SendGovernor {
    /// Governor with the protocol default budget (120/min minus the
    /// heartbeat reserve).
    pub fn new(closed: watch::Receiver<bool>) -> Self {
        Self::with_limit(
            SEND_LIMIT_PER_WINDOW - HEARTBEAT_RESERVE,
            SEND_WINDOW,
            closed,
        )
    }

    pub fn with_limit(limit: u32, window: Duration, closed: watch::Receiver<bool>) -> Self {
        SendGovernor {
            limit,
            window,
            state: Arc::new(Mutex::new(RateLimitState::fresh(limit, window))),
            closed,
        }
    }

    /// Wait for the right to send.
    ///
    /// tokio's mutex grants the lock in request order, which is exactly the
    /// FIFO queue this governor needs: no priority, no starvation, and the
    /// permit holder excludes every other sender on this connection.
    pub async fn admit(&self) -> Result<SendPermit, GovernorError> {
        let mut guard = self.state.clone().lock_owned().await;

        if guard.remaining == 0 {
            let now = Instant::now();
            if guard.reset_at > now {
                let sleep_for = guard.reset_at - now;
                tracing::debug!("send rate limit hit, sleeping for {sleep_for:?}");
                let mut closed = self.closed.clone();
                tokio::select! {
                    _ = tokio::time::sleep_until(guard.reset_at) => {}
                    _ = closed.wait_for(|closed| *closed) => {
                        return Err(GovernorError::ConnectionClosed);
                    }
                }
            }
            *guard = RateLimitState::fresh(self.limit, self.window);
        }

        guard.remaining -= 1;
        Ok(SendPermit { _guard: guard })
    }
}
