//! Connection Registry for push update routing.
//!
//! This module provides a thread-safe registry that tracks the single
//! outbound stream of every connected session server, keyed by server id.
//!
//! ## Architecture
//!
//! Each session server registers once when its stream opens and receives the
//! consuming half of a bounded queue. Dispatchers look up the sending half by
//! server id and enqueue updates without holding the registry lock.
//!
//! ```text
//! FanoutDispatcher --lookup_for_send--> ConnectionRegistry <--register/expire-- DeliveryLoop
//!        |                                      |                                    ^
//!        v                                      v                                    |
//!   UpdateQueue ---------------------> DashMap<ServerId,              UpdateReceiver -+
//!                                       ConnectionEntry>
//! ```

mod connection_registry;
mod queue;

pub use connection_registry::{ConnectionInfo, ConnectionRegistry, DEFAULT_QUEUE_CAPACITY};
pub use queue::{update_queue, UpdateQueue, UpdateReceiver, MAX_QUEUE_CAPACITY};
