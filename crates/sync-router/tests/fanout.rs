//! Fan-out dispatch against a live registry.

mod common;

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use common::{assert_no_update, init_tracing, recv_update, status, ScriptedLookup, DEFAULT_TIMEOUT};
use sync_router::{
    ConnectionRegistry, DeliveryLoop, DeliveryRequest, FanoutDispatcher, GroupOutcome,
    InMemoryStatusLookup, PushUpdate, SessionStatus, StatusLookup, StreamCancel, SyncError,
    UpdateReceiver, UpdateSink, UserId,
};
use tokio::sync::mpsc;
use tokio::time::timeout;

fn request() -> DeliveryRequest {
    DeliveryRequest::new(vec![1, 2, 3], Bytes::from_static(b"update-body"))
}

#[tokio::test]
async fn test_scenario_connected_and_unconnected_servers() {
    init_tracing();
    let registry = Arc::new(ConnectionRegistry::new(16));
    let mut seven = registry.register(7).unwrap();

    let lookup = Arc::new(ScriptedLookup::returning(vec![
        status(7, 3, 42),
        status(9, 5, 99),
    ]));
    let dispatcher = FanoutDispatcher::new(Arc::clone(&registry), lookup);

    let receipt = dispatcher.dispatch(request()).await.unwrap();
    let summary = receipt.summary();
    assert_eq!(summary.resolved, 2);
    assert_eq!(summary.groups_dispatched, 1);
    assert_eq!(summary.groups_dropped, 1);
    receipt.join().await;

    let update = recv_update(&mut seven).await;
    assert_eq!(update.session_id, 3);
    assert_eq!(update.auth_key_id, 42);
    assert_eq!(update.transport_session_id, 300);
    assert_eq!(&update.payload[..], b"update-body");
    assert_no_update(&mut seven).await;
}

#[tokio::test]
async fn test_unconnected_target_acknowledges_without_enqueue() {
    let registry = Arc::new(ConnectionRegistry::new(16));
    let lookup = Arc::new(ScriptedLookup::returning(vec![status(9, 5, 99)]));
    let dispatcher = FanoutDispatcher::new(Arc::clone(&registry), lookup);

    let receipt = dispatcher.dispatch(request()).await.unwrap();

    assert_eq!(receipt.summary().groups_dispatched, 0);
    assert_eq!(receipt.summary().groups_dropped, 1);
    assert!(receipt.join().await.is_empty());
}

#[tokio::test]
async fn test_fanout_to_two_servers_is_exact_union() {
    let registry = Arc::new(ConnectionRegistry::new(16));
    let mut server_a = registry.register(1).unwrap();
    let mut server_b = registry.register(2).unwrap();

    let statuses = vec![
        status(1, 10, 100),
        status(2, 20, 200),
        status(1, 11, 101),
        status(2, 21, 201),
        status(1, 12, 102),
    ];
    let lookup = Arc::new(ScriptedLookup::returning(statuses));
    let dispatcher = FanoutDispatcher::new(Arc::clone(&registry), lookup);

    let mut outcomes = dispatcher.dispatch(request()).await.unwrap().join().await;
    outcomes.sort_by_key(|o| o.server_id);
    assert_eq!(
        outcomes,
        vec![
            GroupOutcome {
                server_id: 1,
                enqueued: 3,
                abandoned: 0,
            },
            GroupOutcome {
                server_id: 2,
                enqueued: 2,
                abandoned: 0,
            },
        ]
    );

    // Within a server the resolution order is kept
    let mut a_sessions = Vec::new();
    for _ in 0..3 {
        let update = recv_update(&mut server_a).await;
        assert_eq!(update.auth_key_id, update.session_id + 90);
        a_sessions.push(update.session_id);
    }
    assert_eq!(a_sessions, vec![10, 11, 12]);

    let mut b_sessions = Vec::new();
    for _ in 0..2 {
        let update = recv_update(&mut server_b).await;
        assert_eq!(update.auth_key_id, update.session_id + 180);
        b_sessions.push(update.session_id);
    }
    assert_eq!(b_sessions, vec![20, 21]);

    assert_no_update(&mut server_a).await;
    assert_no_update(&mut server_b).await;
}

#[tokio::test]
async fn test_lookup_failure_is_reported() {
    let registry = Arc::new(ConnectionRegistry::new(16));
    let _receiver = registry.register(7).unwrap();
    let lookup = Arc::new(ScriptedLookup::failing());
    let dispatcher = FanoutDispatcher::new(Arc::clone(&registry), lookup);

    let result = dispatcher.dispatch(request()).await;
    assert!(matches!(result, Err(SyncError::StatusLookup(_))));
}

#[tokio::test]
async fn test_in_memory_lookup_end_to_end() {
    let registry = Arc::new(ConnectionRegistry::new(16));
    let mut receiver = registry.register(7).unwrap();
    let lookup = Arc::new(InMemoryStatusLookup::new());
    let mut online = status(7, 3, 42);
    online.user_id = 1;
    lookup.set_online(online);

    let dispatcher = FanoutDispatcher::new(Arc::clone(&registry), Arc::clone(&lookup));
    dispatcher.dispatch(request()).await.unwrap().join().await;
    assert_eq!(recv_update(&mut receiver).await.session_id, 3);

    lookup.set_offline(1, 42);
    let receipt = dispatcher.dispatch(request()).await.unwrap();
    assert_eq!(receipt.summary().resolved, 0);
    assert_no_update(&mut receiver).await;
}

/// Lookup resolving each listed user independently, repeats included.
struct PerUserLookup(Vec<SessionStatus>);

impl StatusLookup for PerUserLookup {
    async fn resolve_sessions(
        &self,
        user_ids: &[UserId],
    ) -> Result<Vec<SessionStatus>, SyncError> {
        Ok(user_ids
            .iter()
            .flat_map(|id| self.0.iter().filter(move |s| s.user_id == *id).cloned())
            .collect())
    }
}

async fn deliver_to_repeated_user<L: StatusLookup>(
    registry: &Arc<ConnectionRegistry>,
    lookup: Arc<L>,
    receiver: &mut UpdateReceiver,
) {
    let receipt = FanoutDispatcher::new(Arc::clone(registry), lookup)
        .dispatch(DeliveryRequest::new(vec![1, 1], Bytes::from_static(b"once")))
        .await
        .unwrap();
    assert_eq!(receipt.summary().resolved, 1);

    let outcomes = receipt.join().await;
    assert_eq!(outcomes[0].enqueued, 1);

    assert_eq!(recv_update(receiver).await.session_id, 3);
    assert_no_update(receiver).await;
}

#[tokio::test]
async fn test_repeated_target_user_gets_one_update_per_session() {
    let registry = Arc::new(ConnectionRegistry::new(16));
    let mut receiver = registry.register(7).unwrap();
    let mut online = status(7, 3, 42);
    online.user_id = 1;

    // A lookup that would resolve the repeat twice
    let lookup = Arc::new(PerUserLookup(vec![online.clone()]));
    deliver_to_repeated_user(&registry, lookup, &mut receiver).await;

    let lookup = Arc::new(InMemoryStatusLookup::new());
    lookup.set_online(online);
    deliver_to_repeated_user(&registry, lookup, &mut receiver).await;
}

/// Sink that forwards every written update to a test channel.
struct ChannelSink(mpsc::UnboundedSender<PushUpdate>);

impl UpdateSink for ChannelSink {
    async fn send(&mut self, update: &PushUpdate) -> Result<(), SyncError> {
        self.0
            .send(update.clone())
            .map_err(|_| SyncError::internal("test sink closed"))
    }
}

#[tokio::test]
async fn test_full_queue_blocks_group_until_drained() {
    init_tracing();
    let registry = Arc::new(ConnectionRegistry::new(2));
    let receiver = registry.register(7).unwrap();
    let queue = registry.lookup_for_send(7).unwrap();

    // Fill the queue to capacity before any consumer runs
    for session_id in 0..2 {
        queue
            .send(PushUpdate::for_session(&status(7, session_id, 1), Bytes::new()))
            .await
            .unwrap();
    }

    let lookup = Arc::new(ScriptedLookup::returning(vec![status(7, 99, 1)]));
    let dispatcher = FanoutDispatcher::new(Arc::clone(&registry), lookup);

    // The caller is acknowledged even though the group cannot enqueue yet
    let receipt = timeout(DEFAULT_TIMEOUT, dispatcher.dispatch(request()))
        .await
        .expect("dispatch must not wait for queue space")
        .unwrap();
    let group = tokio::spawn(receipt.join());

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!group.is_finished(), "group should be blocked on a full queue");
    assert_eq!(queue.pending(), 2);

    // Start draining: the blocked group completes
    let (tx, mut written) = mpsc::unbounded_channel();
    let cancel = StreamCancel::new();
    let delivery = tokio::spawn(
        DeliveryLoop::new(Arc::clone(&registry), receiver).run(ChannelSink(tx), cancel.clone()),
    );

    let outcomes = timeout(DEFAULT_TIMEOUT, group).await.unwrap().unwrap();
    assert_eq!(
        outcomes,
        vec![GroupOutcome {
            server_id: 7,
            enqueued: 1,
            abandoned: 0,
        }]
    );

    let mut order = Vec::new();
    for _ in 0..3 {
        let update = timeout(DEFAULT_TIMEOUT, written.recv()).await.unwrap().unwrap();
        order.push(update.session_id);
    }
    assert_eq!(order, vec![0, 1, 99]);

    cancel.cancel("test finished");
    let result = delivery.await.unwrap();
    assert!(matches!(result, Err(SyncError::StreamCancelled { .. })));
    assert!(!registry.is_connected(7));
}

#[tokio::test]
async fn test_expiry_during_blocked_group_abandons_without_panic() {
    let registry = Arc::new(ConnectionRegistry::new(1));
    let _receiver = registry.register(7).unwrap();
    let queue = registry.lookup_for_send(7).unwrap();
    queue
        .send(PushUpdate::for_session(&status(7, 0, 1), Bytes::new()))
        .await
        .unwrap();

    let lookup = Arc::new(ScriptedLookup::returning(vec![
        status(7, 1, 1),
        status(7, 2, 1),
        status(7, 3, 1),
    ]));
    let dispatcher = FanoutDispatcher::new(Arc::clone(&registry), lookup);
    let receipt = dispatcher.dispatch(request()).await.unwrap();
    let group = tokio::spawn(receipt.join());

    tokio::time::sleep(Duration::from_millis(50)).await;
    registry.expire(7);

    let outcomes = timeout(DEFAULT_TIMEOUT, group).await.unwrap().unwrap();
    assert_eq!(
        outcomes,
        vec![GroupOutcome {
            server_id: 7,
            enqueued: 0,
            abandoned: 3,
        }]
    );
}
