//! Stream listener for session servers.
//!
//! The listener accepts TCP connections from session servers, performs the
//! [`ServerHello`] handshake, registers the stream and then runs its
//! [`DeliveryLoop`] until the stream ends.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::{FramedRead, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument, Span};

use crate::delivery::{DeliveryLoop, StreamCancel};
use crate::error::SyncError;
use crate::registry::ConnectionRegistry;
use crate::wire::{self, FramedUpdateSink, RouterFrame, ServerHello};

/// Default address of the stream listener.
pub const DEFAULT_STREAM_ADDR: SocketAddr =
    SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 10030);

/// Default time a session server has to send its hello frame.
pub const DEFAULT_HANDSHAKE_TIMEOUT_SECS: u64 = 10;

/// Stream listener configuration.
#[derive(Debug, Clone)]
pub struct SyncServerConfig {
    /// Address to bind for session server streams
    pub stream_addr: SocketAddr,
    /// Time allowed between accept and the hello frame
    pub handshake_timeout: Duration,
}

impl Default for SyncServerConfig {
    fn default() -> Self {
        Self {
            stream_addr: DEFAULT_STREAM_ADDR,
            handshake_timeout: Duration::from_secs(DEFAULT_HANDSHAKE_TIMEOUT_SECS),
        }
    }
}

/// Stream listener instance.
pub struct SyncServer {
    config: SyncServerConfig,
    registry: Arc<ConnectionRegistry>,
}

impl SyncServer {
    /// Create a new listener registering streams on `registry`.
    pub fn new(config: SyncServerConfig, registry: Arc<ConnectionRegistry>) -> Self {
        Self { config, registry }
    }

    /// Bind the configured stream address.
    pub async fn bind(&self) -> Result<TcpListener, SyncError> {
        let listener = TcpListener::bind(self.config.stream_addr).await?;
        info!(addr = %self.config.stream_addr, "Stream listener bound");
        Ok(listener)
    }

    /// Accept session server streams until `shutdown` is cancelled.
    ///
    /// Cancelling `shutdown` also cancels every open stream.
    pub async fn run(
        self,
        listener: TcpListener,
        shutdown: CancellationToken,
    ) -> Result<(), SyncError> {
        info!(addr = ?listener.local_addr().ok(), "Stream listener running");

        loop {
            let accepted = tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Stream listener stopped (shutdown token cancelled)");
                    return Ok(());
                }
                accepted = listener.accept() => accepted,
            };

            let (stream, peer_addr) = match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!(error = %e, "Failed to accept stream connection");
                    continue;
                }
            };

            let registry = Arc::clone(&self.registry);
            let handshake_timeout = self.config.handshake_timeout;
            let shutdown = shutdown.clone();

            tokio::spawn(
                async move {
                    if let Err(e) =
                        handle_connection(stream, registry, handshake_timeout, shutdown).await
                    {
                        warn!(error = %e, kind = e.kind(), "Stream ended with error");
                    }
                }
                .instrument(info_span!(
                    "sync.stream.lifecycle",
                    peer = %peer_addr,
                    server_id = tracing::field::Empty,
                )),
            );
        }
    }

    /// Get the server configuration.
    pub fn config(&self) -> &SyncServerConfig {
        &self.config
    }

    /// Get the connection registry.
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }
}

/// Serve one session server stream from handshake to expiry.
async fn handle_connection(
    stream: TcpStream,
    registry: Arc<ConnectionRegistry>,
    handshake_timeout: Duration,
    shutdown: CancellationToken,
) -> Result<(), SyncError> {
    stream.set_nodelay(true)?;
    let (read_half, write_half) = stream.into_split();
    let mut reader = FramedRead::new(read_half, wire::codec());

    let hello = read_hello(&mut reader, handshake_timeout).await?;
    let server_id = hello.server_id;
    Span::current().record("server_id", server_id);

    let mut sink = FramedUpdateSink::new(server_id, write_half);

    let receiver = match registry.register(server_id) {
        Ok(receiver) => receiver,
        Err(e) => {
            let rejected = RouterFrame::Rejected {
                code: e.kind().to_string(),
                reason: e.to_string(),
            };
            if let Err(send_err) = sink.send_frame(&rejected).await {
                debug!(error = %send_err, "Failed to send rejection");
            }
            return Err(e);
        }
    };
    let connection_id = receiver.connection_id();

    if let Err(e) = sink.send_frame(&RouterFrame::Registered { server_id }).await {
        registry.expire_connection(server_id, connection_id);
        return Err(e);
    }

    let cancel = StreamCancel::child_of(&shutdown);
    let watcher = tokio::spawn(watch_peer(reader, cancel.clone()).in_current_span());

    let result = DeliveryLoop::new(Arc::clone(&registry), receiver)
        .run(sink, cancel.clone())
        .await;

    cancel.cancel("delivery loop ended");
    let _ = watcher.await;

    match result {
        Ok(()) => {
            info!("Stream expired by registry");
            Ok(())
        }
        Err(SyncError::StreamCancelled { reason, .. }) => {
            info!(reason = %reason, "Stream cancelled");
            Ok(())
        }
        Err(e) => Err(e),
    }
}

/// Read and decode the hello frame within `handshake_timeout`.
async fn read_hello(
    reader: &mut FramedRead<OwnedReadHalf, LengthDelimitedCodec>,
    handshake_timeout: Duration,
) -> Result<ServerHello, SyncError> {
    let frame = match tokio::time::timeout(handshake_timeout, reader.next()).await {
        Ok(Some(frame)) => frame?,
        Ok(None) => return Err(SyncError::handshake("Peer closed the stream before hello")),
        Err(_) => return Err(SyncError::handshake("Timed out waiting for hello")),
    };

    wire::decode_frame(&frame)
}

/// Cancel the stream once the peer closes its half or the read side fails.
///
/// Session servers send nothing after the hello; any further frame is ignored.
async fn watch_peer(
    mut reader: FramedRead<OwnedReadHalf, LengthDelimitedCodec>,
    cancel: StreamCancel,
) {
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => return,
            frame = reader.next() => frame,
        };

        match frame {
            Some(Ok(_)) => debug!("Ignoring frame sent after hello"),
            Some(Err(e)) => {
                cancel.cancel(format!("read error: {}", e));
                return;
            }
            None => {
                cancel.cancel("peer closed stream");
                return;
            }
        }
    }
}
