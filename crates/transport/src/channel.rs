//! Typed Duplex Control Channels
//!
//! Bounded crossbeam channels carrying serialized frames. Dispatch payloads
//! embed arbitrary JSON values, so framing is JSON rather than a
//! non-self-describing format. The generic ends are typed so a coordinator
//! physically cannot send a worker message and vice versa. Disconnection is
//! how worker death is observed: when a worker thread dies its channel ends
//! drop, and the peer's next operation returns
//! [`TransportError::Disconnected`].

use std::marker::PhantomData;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError, TrySendError, bounded};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::TransportError;
use crate::message::{CoordinatorMessage, WorkerMessage};

/// Sending half of a control channel.
pub struct ControlSender<T> {
    tx: Sender<Vec<u8>>,
    _marker: PhantomData<fn(T)>,
}

impl<T> Clone for ControlSender<T> {
    fn clone(&self) -> Self {
        ControlSender {
            tx: self.tx.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T: Serialize> ControlSender<T> {
    /// Send, blocking while the channel is at capacity.
    pub fn send(&self, message: &T) -> Result<(), TransportError> {
        let bytes = serde_json::to_vec(message)?;
        self.tx
            .send(bytes)
            .map_err(|_| TransportError::Disconnected)
    }

    /// Send without blocking.
    pub fn try_send(&self, message: &T) -> Result<(), TransportError> {
        let bytes = serde_json::to_vec(message)?;
        self.tx.try_send(bytes).map_err(|err| match err {
            TrySendError::Full(_) => TransportError::Full,
            TrySendError::Disconnected(_) => TransportError::Disconnected,
        })
    }
}

/// Receiving half of a control channel.
pub struct ControlReceiver<T> {
    rx: Receiver<Vec<u8>>,
    _marker: PhantomData<fn() -> T>,
}

impl<T: DeserializeOwned> ControlReceiver<T> {
    /// Block until a message arrives or the peer disconnects.
    pub fn recv(&self) -> Result<T, TransportError> {
        let bytes = self.rx.recv().map_err(|_| TransportError::Disconnected)?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Non-blocking receive; `Ok(None)` when the channel is empty.
    pub fn try_recv(&self) -> Result<Option<T>, TransportError> {
        match self.rx.try_recv() {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(TransportError::Disconnected),
        }
    }

    /// Receive with a deadline.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<T, TransportError> {
        match self.rx.recv_timeout(timeout) {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(RecvTimeoutError::Timeout) => Err(TransportError::Timeout),
            Err(RecvTimeoutError::Disconnected) => Err(TransportError::Disconnected),
        }
    }
}

/// One side of a duplex control channel.
pub struct ControlPair<Out, In> {
    pub sender: ControlSender<Out>,
    pub receiver: ControlReceiver<In>,
}

/// Coordinator side: sends commands, receives worker reports.
pub type CoordinatorEnd = ControlPair<CoordinatorMessage, WorkerMessage>;
/// Worker side: sends reports, receives commands.
pub type WorkerEnd = ControlPair<WorkerMessage, CoordinatorMessage>;

/// Build both ends of a duplex channel with the given per-direction capacity.
pub fn duplex<A, B>(capacity: usize) -> (ControlPair<A, B>, ControlPair<B, A>) {
    let (a_tx, a_rx) = bounded(capacity);
    let (b_tx, b_rx) = bounded(capacity);
    (
        ControlPair {
            sender: ControlSender {
                tx: a_tx,
                _marker: PhantomData,
            },
            receiver: ControlReceiver {
                rx: b_rx,
                _marker: PhantomData,
            },
        },
        ControlPair {
            sender: ControlSender {
                tx: b_tx,
                _marker: PhantomData,
            },
            receiver: ControlReceiver {
                rx: a_rx,
                _marker: PhantomData,
            },
        },
    )
}

/// Duplex channel pre-typed for the coordinator/worker protocol.
pub fn control_channel(capacity: usize) -> (CoordinatorEnd, WorkerEnd) {
    duplex(capacity)
}
