//! Per-connection outbound queue
//!
//! A bounded FIFO of frames with a single consumer (the connection's writer
//! loop). Producers never wait: a push either lands or fails immediately.
//! Closing is idempotent and wakes the consumer so it can exit.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, Notify};
use uuid::Uuid;

use super::messages::Frame;

/// Unique identifier for a connection actor
pub type ActorId = Uuid;

/// Default queue depth per connection
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

/// Why a frame could not be queued
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PushError {
    #[error("outbound queue is full")]
    Full,

    #[error("outbound queue is closed")]
    Closed,
}

/// Producer handle for one connection's outbound queue
#[derive(Debug, Clone)]
pub struct Outbox {
    id: ActorId,
    tx: mpsc::Sender<Frame>,
    closed: Arc<AtomicBool>,
    shutdown: Arc<Notify>,
}

/// Consumer side, owned by the writer loop
#[derive(Debug)]
pub struct OutboxReceiver {
    rx: mpsc::Receiver<Frame>,
    closed: Arc<AtomicBool>,
    shutdown: Arc<Notify>,
}

impl Outbox {
    /// Create a queue with the given capacity
    pub fn channel(id: ActorId, capacity: usize) -> (Outbox, OutboxReceiver) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let closed = Arc::new(AtomicBool::new(false));
        let shutdown = Arc::new(Notify::new());

        let outbox = Outbox {
            id,
            tx,
            closed: Arc::clone(&closed),
            shutdown: Arc::clone(&shutdown),
        };
        let receiver = OutboxReceiver {
            rx,
            closed,
            shutdown,
        };
        (outbox, receiver)
    }

    pub fn id(&self) -> ActorId {
        self.id
    }

    /// Queue a frame without waiting
    pub fn push(&self, frame: Frame) -> Result<(), PushError> {
        if self.is_closed() {
            return Err(PushError::Closed);
        }
        self.tx.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => PushError::Full,
            mpsc::error::TrySendError::Closed(_) => PushError::Closed,
        })
    }

    /// Close the queue
    ///
    /// Returns true only for the call that actually closed it.
    pub fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        // Wakes every `closed()` waiter, then leaves a permit for a writer
        // that is not currently waiting
        self.shutdown.notify_waiters();
        self.shutdown.notify_one();
        true
    }

    /// Resolves once the queue is closed, whoever closed it
    pub async fn closed(&self) {
        let notified = self.shutdown.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        notified.await;
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire) || self.tx.is_closed()
    }
}

impl OutboxReceiver {
    /// Next frame in FIFO order, or `None` once the queue is closed
    pub async fn recv(&mut self) -> Option<Frame> {
        if self.closed.load(Ordering::Acquire) {
            return None;
        }
        tokio::select! {
            biased;
            _ = self.shutdown.notified() => None,
            frame = self.rx.recv() => frame,
        }
    }
}
