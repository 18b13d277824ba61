//! Per-connection delivery loop.
//!
//! One loop runs for the lifetime of every registered stream. It drains the
//! connection's queue into the transport until the stream is cancelled, the
//! transport fails, or the queue is expired from outside. Whatever the exit
//! path, the connection is expired from the registry on the way out.

use std::future::Future;
use std::sync::{Arc, OnceLock};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::error::SyncError;
use crate::metrics;
use crate::registry::{ConnectionRegistry, UpdateReceiver};
use crate::types::{PushUpdate, ServerId};

/// Cause reported when a stream is cancelled without an explicit reason.
const DEFAULT_CANCEL_CAUSE: &str = "context canceled";

/// Outbound half of a session server stream.
///
/// Implemented by the wire transport and by test doubles.
pub trait UpdateSink: Send {
    /// Write one update to the stream.
    fn send(
        &mut self,
        update: &PushUpdate,
    ) -> impl Future<Output = Result<(), SyncError>> + Send;
}

/// Cancellation signal of a stream, with the cause that triggered it.
#[derive(Debug, Clone, Default)]
pub struct StreamCancel {
    token: CancellationToken,
    cause: Arc<OnceLock<String>>,
}

impl StreamCancel {
    /// Create a new, independent cancellation signal.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a signal that is also cancelled when `parent` is.
    pub fn child_of(parent: &CancellationToken) -> Self {
        Self {
            token: parent.child_token(),
            cause: Arc::default(),
        }
    }

    /// Cancel the stream. Only the first cause is kept.
    pub fn cancel(&self, cause: impl Into<String>) {
        let _ = self.cause.set(cause.into());
        self.token.cancel();
    }

    /// Wait until the stream is cancelled.
    pub async fn cancelled(&self) {
        self.token.cancelled().await;
    }

    /// Whether the stream has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Why the stream was cancelled.
    pub fn cause(&self) -> String {
        self.cause
            .get()
            .cloned()
            .unwrap_or_else(|| DEFAULT_CANCEL_CAUSE.to_string())
    }
}

/// Expires the connection when dropped.
struct ExpiryGuard {
    registry: Arc<ConnectionRegistry>,
    server_id: ServerId,
    connection_id: Uuid,
}

impl Drop for ExpiryGuard {
    fn drop(&mut self) {
        self.registry
            .expire_connection(self.server_id, self.connection_id);
    }
}

/// Drains one connection's queue into its stream.
pub struct DeliveryLoop {
    registry: Arc<ConnectionRegistry>,
    receiver: UpdateReceiver,
}

impl DeliveryLoop {
    /// Create a loop for a connection registered on `registry`.
    pub fn new(registry: Arc<ConnectionRegistry>, receiver: UpdateReceiver) -> Self {
        Self { registry, receiver }
    }

    /// Server this loop delivers to.
    pub fn server_id(&self) -> ServerId {
        self.receiver.server_id()
    }

    /// Run until the stream ends.
    ///
    /// Returns `Ok(())` when the queue was expired elsewhere,
    /// [`SyncError::StreamCancelled`] when `cancel` fires and
    /// [`SyncError::TransportSend`] on the first failed write. Failed writes
    /// are not retried.
    #[instrument(
        name = "sync.delivery_loop",
        skip_all,
        fields(server_id = self.receiver.server_id())
    )]
    pub async fn run<S: UpdateSink>(
        self,
        mut sink: S,
        cancel: StreamCancel,
    ) -> Result<(), SyncError> {
        let Self {
            registry,
            mut receiver,
        } = self;
        let server_id = receiver.server_id();
        let _guard = ExpiryGuard {
            registry,
            server_id,
            connection_id: receiver.connection_id(),
        };

        info!("Delivery loop started");

        loop {
            let update = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(Self::cancelled(server_id, &cancel)),
                update = receiver.recv() => update,
            };

            let Some(update) = update else {
                info!("Update queue closed, delivery loop ending");
                metrics::record_delivery_loop_exit("expired");
                return Ok(());
            };

            let sent = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(Self::cancelled(server_id, &cancel)),
                sent = sink.send(&update) => sent,
            };

            match sent {
                Ok(()) => {
                    debug!(session_id = update.session_id, "Update delivered to stream");
                    metrics::record_update_sent();
                }
                Err(e) => {
                    warn!(error = %e, "Transport send failed, ending delivery loop");
                    metrics::record_delivery_loop_exit("transport_send");
                    return Err(SyncError::transport_send(server_id, e.to_string()));
                }
            }
        }
    }

    fn cancelled(server_id: ServerId, cancel: &StreamCancel) -> SyncError {
        let cause = cancel.cause();
        warn!(cause = %cause, "Stream cancelled, ending delivery loop");
        metrics::record_delivery_loop_exit("cancelled");
        SyncError::stream_cancelled(server_id, cause)
    }
}
