//! Closeable bounded update queue.
//!
//! A thin wrapper over a bounded `mpsc` channel plus a cancellation token.
//! Closing the token wakes both the consumer and any sender parked on a full
//! queue, so a queue obtained from the registry can be expired at any moment
//! without the sender observing anything worse than [`QueueClosed`].

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::QueueClosed;
use crate::types::{PushUpdate, ServerId};

/// Largest number of updates a single queue may buffer.
pub const MAX_QUEUE_CAPACITY: usize = 1 << 20;

/// Clamp a requested capacity to `1..=MAX_QUEUE_CAPACITY`.
pub(crate) fn clamp_capacity(capacity: usize) -> usize {
    capacity.clamp(1, MAX_QUEUE_CAPACITY)
}

/// Create a bounded queue for one connection of `server_id`.
///
/// `capacity` is clamped to `1..=MAX_QUEUE_CAPACITY`.
pub fn update_queue(server_id: ServerId, capacity: usize) -> (UpdateQueue, UpdateReceiver) {
    let (sender, receiver) = mpsc::channel(clamp_capacity(capacity));
    let closed = CancellationToken::new();
    let connection_id = Uuid::now_v7();

    (
        UpdateQueue {
            server_id,
            connection_id,
            sender,
            closed: closed.clone(),
        },
        UpdateReceiver {
            server_id,
            connection_id,
            receiver,
            closed,
        },
    )
}

/// Sending half of a connection's update queue.
///
/// Cheap to clone; safe to use from many dispatchers concurrently.
#[derive(Debug, Clone)]
pub struct UpdateQueue {
    server_id: ServerId,
    connection_id: Uuid,
    sender: mpsc::Sender<PushUpdate>,
    closed: CancellationToken,
}

impl UpdateQueue {
    /// Enqueue an update, waiting for a free slot if the queue is full.
    ///
    /// Fails with [`QueueClosed`] if the queue is closed before or while
    /// waiting.
    pub async fn send(&self, update: PushUpdate) -> Result<(), QueueClosed> {
        if self.closed.is_cancelled() {
            return Err(QueueClosed(update));
        }

        let permit = tokio::select! {
            biased;
            _ = self.closed.cancelled() => return Err(QueueClosed(update)),
            permit = self.sender.reserve() => permit,
        };

        match permit {
            Ok(permit) => {
                permit.send(update);
                Ok(())
            }
            Err(_) => Err(QueueClosed(update)),
        }
    }

    /// Close the queue. Pending updates are discarded.
    pub fn close(&self) {
        self.closed.cancel();
    }

    /// Whether the queue has been closed or its consumer dropped.
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled() || self.sender.is_closed()
    }

    /// Server this queue delivers to.
    pub fn server_id(&self) -> ServerId {
        self.server_id
    }

    /// Unique id of the registration that created this queue.
    pub fn connection_id(&self) -> Uuid {
        self.connection_id
    }

    /// Number of updates currently waiting in the queue.
    pub fn pending(&self) -> usize {
        self.sender.max_capacity() - self.sender.capacity()
    }

    /// Maximum number of updates the queue holds.
    pub fn max_capacity(&self) -> usize {
        self.sender.max_capacity()
    }
}

/// Consuming half of a connection's update queue.
///
/// Owned by the connection's delivery loop.
#[derive(Debug)]
pub struct UpdateReceiver {
    server_id: ServerId,
    connection_id: Uuid,
    receiver: mpsc::Receiver<PushUpdate>,
    closed: CancellationToken,
}

impl UpdateReceiver {
    /// Receive the next update in FIFO order.
    ///
    /// Returns `None` once the queue is closed.
    pub async fn recv(&mut self) -> Option<PushUpdate> {
        tokio::select! {
            biased;
            _ = self.closed.cancelled() => None,
            update = self.receiver.recv() => update,
        }
    }

    /// Whether the queue has been closed.
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Server this queue delivers to.
    pub fn server_id(&self) -> ServerId {
        self.server_id
    }

    /// Unique id of the registration that created this queue.
    pub fn connection_id(&self) -> Uuid {
        self.connection_id
    }
}
