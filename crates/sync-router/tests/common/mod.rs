//! Test utilities for sync router integration tests.
//!
//! Provides a scripted status lookup, a helper for starting a stream listener
//! on an ephemeral port and bounded waits for queue consumers.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use sync_router::{
    ConnectionRegistry, PushUpdate, ServerId, SessionStatus, StatusLookup, SyncError, SyncServer,
    SyncServerConfig, UpdateReceiver, UserId,
};
use tokio::net::TcpListener;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

/// Default timeout for test operations.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Install a test tracing subscriber once per process.
pub fn init_tracing() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter("sync_router=debug")
            .with_test_writer()
            .try_init();
    });
}

/// Status lookup returning a fixed answer regardless of the requested users.
pub struct ScriptedLookup {
    statuses: Vec<SessionStatus>,
    fail: bool,
}

impl ScriptedLookup {
    pub fn returning(statuses: Vec<SessionStatus>) -> Self {
        Self {
            statuses,
            fail: false,
        }
    }

    pub fn failing() -> Self {
        Self {
            statuses: Vec::new(),
            fail: true,
        }
    }
}

impl StatusLookup for ScriptedLookup {
    async fn resolve_sessions(
        &self,
        _user_ids: &[UserId],
    ) -> Result<Vec<SessionStatus>, SyncError> {
        if self.fail {
            Err(SyncError::status_lookup("status store unavailable"))
        } else {
            Ok(self.statuses.clone())
        }
    }
}

/// Build a session status.
pub fn status(server_id: ServerId, session_id: i64, auth_key_id: i64) -> SessionStatus {
    SessionStatus {
        server_id,
        user_id: (auth_key_id as i32) + 1000,
        auth_key_id,
        session_id,
        transport_session_id: session_id * 100,
    }
}

/// Receive one update or fail the test after [`DEFAULT_TIMEOUT`].
pub async fn recv_update(receiver: &mut UpdateReceiver) -> PushUpdate {
    timeout(DEFAULT_TIMEOUT, receiver.recv())
        .await
        .expect("timed out waiting for update")
        .expect("queue closed while waiting for update")
}

/// Assert that nothing arrives on the queue within a short window.
pub async fn assert_no_update(receiver: &mut UpdateReceiver) {
    let received = timeout(Duration::from_millis(100), receiver.recv()).await;
    assert!(received.is_err(), "unexpected update: {:?}", received);
}

/// Start a stream listener on an ephemeral port.
pub async fn start_stream_server(
    registry: Arc<ConnectionRegistry>,
) -> (SocketAddr, CancellationToken) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let shutdown = CancellationToken::new();

    let config = SyncServerConfig {
        stream_addr: addr,
        handshake_timeout: Duration::from_secs(1),
    };
    let server = SyncServer::new(config, registry);
    tokio::spawn(server.run(listener, shutdown.clone()));

    (addr, shutdown)
}

/// Poll `condition` until it holds or [`DEFAULT_TIMEOUT`] passes.
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    timeout(DEFAULT_TIMEOUT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not met in time");
}
