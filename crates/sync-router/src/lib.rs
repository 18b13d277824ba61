//! # sync-router
//!
//! Routes push updates to the session server that owns each target session.
//!
//! This crate is embedded in `sync-server`, which supplies the online status
//! table and the HTTP delivery API.
//!
//! ## Architecture
//!
//! - **Connection Registry**: one bounded update queue per connected session
//!   server, at most one per server id
//! - **Delivery Loops**: one task per registered stream, draining its queue
//!   into the stream until cancellation, transport failure or expiry
//! - **Fan-out Dispatcher**: resolves delivery targets to sessions, groups
//!   them by owning server and enqueues one update per session
//! - **Stream Listener**: TCP listener speaking length-delimited JSON frames
//!
//! ## Known limitation
//!
//! A session server may hold only one stream. A second registration for the
//! same server id is rejected with [`SyncError::AlreadyConnected`] until the
//! first stream ends.

pub mod delivery;
pub mod dispatch;
pub mod lookup;
pub mod metrics;
pub mod registry;
pub mod server;
pub mod wire;

mod error;
mod types;

pub use delivery::{DeliveryLoop, StreamCancel, UpdateSink};
pub use dispatch::{DispatchReceipt, DispatchSummary, FanoutDispatcher, GroupOutcome};
pub use error::{QueueClosed, SyncError};
pub use lookup::{InMemoryStatusLookup, StatusLookup};
pub use registry::{ConnectionInfo, ConnectionRegistry, UpdateQueue, UpdateReceiver};
pub use server::{SyncServer, SyncServerConfig};
pub use types::*;
pub use wire::SyncClient;
