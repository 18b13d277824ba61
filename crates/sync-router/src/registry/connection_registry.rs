//! Connection Registry implementation.
//!
//! Tracks the registered stream of every session server by server id.

use std::fmt;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::queue::{clamp_capacity, update_queue, UpdateQueue, UpdateReceiver};
use crate::error::SyncError;
use crate::metrics;
use crate::types::ServerId;

/// Default number of updates buffered per connection.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1000;

/// Connection state stored in the registry.
#[derive(Debug)]
struct ConnectionEntry {
    /// Sending half of the connection's queue
    queue: UpdateQueue,
    /// When the stream was registered
    connected_at: DateTime<Utc>,
}

/// Snapshot of a registered connection, for monitoring.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionInfo {
    pub server_id: ServerId,
    pub connection_id: Uuid,
    pub connected_at: DateTime<Utc>,
    /// Updates waiting to be written to the stream
    pub pending: usize,
}

/// Registry of session server streams.
///
/// Holds at most one entry per server id. There is no single registry-wide
/// lock: DashMap shards the map, and each shard is its own reader/writer
/// lock. `register` and `expire` take the write lock of the key's shard,
/// `lookup_for_send` its read lock, so operations on one server id are
/// serialized while different ids may proceed in parallel. No lock is held
/// while an update is sent.
///
/// ## Usage
///
/// ```ignore
/// let registry = Arc::new(ConnectionRegistry::new(DEFAULT_QUEUE_CAPACITY));
///
/// // When a session server opens its stream:
/// let receiver = registry.register(server_id)?;
///
/// // When dispatching:
/// if let Some(queue) = registry.lookup_for_send(server_id) {
///     let _ = queue.send(update).await;
/// }
///
/// // When the stream ends:
/// registry.expire(server_id);
/// ```
pub struct ConnectionRegistry {
    /// Map of server id to its connection entry
    connections: DashMap<ServerId, ConnectionEntry>,
    /// Capacity of every newly created queue
    queue_capacity: usize,
}

impl ConnectionRegistry {
    /// Create a new connection registry whose queues hold `queue_capacity`
    /// updates each, clamped to `1..=MAX_QUEUE_CAPACITY`.
    pub fn new(queue_capacity: usize) -> Self {
        info!(queue_capacity, "Creating connection registry");
        Self {
            connections: DashMap::new(),
            queue_capacity: clamp_capacity(queue_capacity),
        }
    }

    /// Register the stream of `server_id`.
    ///
    /// Returns the consuming half of a fresh queue. Fails with
    /// [`SyncError::AlreadyConnected`] without touching the existing entry if
    /// the server is already registered.
    #[instrument(skip(self))]
    pub fn register(&self, server_id: ServerId) -> Result<UpdateReceiver, SyncError> {
        let receiver = match self.connections.entry(server_id) {
            Entry::Occupied(_) => {
                warn!("Server already connected, rejecting registration");
                metrics::record_registration(false);
                return Err(SyncError::AlreadyConnected { server_id });
            }
            Entry::Vacant(vacant) => {
                let (queue, receiver) = update_queue(server_id, self.queue_capacity);
                vacant.insert(ConnectionEntry {
                    queue,
                    connected_at: Utc::now(),
                });
                receiver
            }
        };

        // The shard guard is released above; len() locks every shard.
        let count = self.connections.len();
        metrics::record_registration(true);
        metrics::record_connection_count(count as i64);
        info!(
            connection_id = %receiver.connection_id(),
            connections = count,
            "Registered server stream"
        );

        Ok(receiver)
    }

    /// Expire the stream of `server_id`, closing its queue.
    ///
    /// Idempotent. Returns whether an entry was removed.
    #[instrument(skip(self))]
    pub fn expire(&self, server_id: ServerId) -> bool {
        match self.connections.remove(&server_id) {
            Some((_, entry)) => {
                self.close_entry(server_id, entry);
                true
            }
            None => {
                debug!("Server was not registered");
                false
            }
        }
    }

    /// Expire `server_id` only if its current entry belongs to
    /// `connection_id`.
    ///
    /// Used by a delivery loop on exit so that it never tears down a newer
    /// registration of the same server.
    #[instrument(skip(self))]
    pub fn expire_connection(&self, server_id: ServerId, connection_id: Uuid) -> bool {
        match self
            .connections
            .remove_if(&server_id, |_, entry| entry.queue.connection_id() == connection_id)
        {
            Some((_, entry)) => {
                self.close_entry(server_id, entry);
                true
            }
            None => {
                debug!("Connection already expired or replaced");
                false
            }
        }
    }

    fn close_entry(&self, server_id: ServerId, entry: ConnectionEntry) {
        let discarded = entry.queue.pending();
        entry.queue.close();

        let count = self.connections.len();
        metrics::record_connection_count(count as i64);
        info!(
            server_id,
            connection_id = %entry.queue.connection_id(),
            discarded,
            connections = count,
            "Expired server stream"
        );
    }

    /// Get the sending half of `server_id`'s queue, if registered.
    ///
    /// The returned handle may be closed at any time by a concurrent expiry;
    /// sends on it then fail with [`QueueClosed`](crate::QueueClosed).
    pub fn lookup_for_send(&self, server_id: ServerId) -> Option<UpdateQueue> {
        self.connections
            .get(&server_id)
            .map(|entry| entry.value().queue.clone())
    }

    /// Check if a server is currently registered.
    pub fn is_connected(&self, server_id: ServerId) -> bool {
        self.connections.contains_key(&server_id)
    }

    /// Get the number of registered servers.
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Capacity of each connection queue.
    pub fn queue_capacity(&self) -> usize {
        self.queue_capacity
    }

    /// List all registered connections, ordered by server id.
    ///
    /// Useful for debugging and monitoring.
    pub fn list_connections(&self) -> Vec<ConnectionInfo> {
        let mut connections: Vec<ConnectionInfo> = self
            .connections
            .iter()
            .map(|entry| ConnectionInfo {
                server_id: *entry.key(),
                connection_id: entry.value().queue.connection_id(),
                connected_at: entry.value().connected_at,
                pending: entry.value().queue.pending(),
            })
            .collect();
        connections.sort_by_key(|info| info.server_id);
        connections
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_CAPACITY)
    }
}

impl fmt::Debug for ConnectionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionRegistry")
            .field("connection_count", &self.connections.len())
            .field("queue_capacity", &self.queue_capacity)
            .finish()
    }
}
