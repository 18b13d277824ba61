//! Fan-out dispatch of delivery requests.
//!
//! A delivery request names users, not servers. The dispatcher resolves the
//! users' live sessions in one lookup, groups them by owning server and hands
//! every group to its own task, which enqueues one [`PushUpdate`] per session
//! onto that server's queue. The caller is acknowledged as soon as the groups
//! are spawned; delivery itself is fire-and-forget.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use bytes::Bytes;
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, info, info_span, instrument, warn, Instrument};

use crate::error::SyncError;
use crate::lookup::StatusLookup;
use crate::metrics;
use crate::registry::{ConnectionRegistry, UpdateQueue};
use crate::types::{DeliveryRequest, PushUpdate, ServerId, SessionStatus, UserId};

/// Result of one server group's enqueue task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct GroupOutcome {
    pub server_id: ServerId,
    /// Updates placed on the server's queue
    pub enqueued: usize,
    /// Updates given up because the queue closed mid-group
    pub abandoned: usize,
}

/// Counters describing how a request was fanned out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DispatchSummary {
    /// Sessions the lookup resolved
    pub resolved: usize,
    /// Server groups handed to an enqueue task
    pub groups_dispatched: usize,
    /// Server groups dropped because the server is not connected
    pub groups_dropped: usize,
}

/// Acknowledgement of a dispatched request.
///
/// Dropping the receipt detaches the group tasks; they keep running.
#[derive(Debug)]
pub struct DispatchReceipt {
    summary: DispatchSummary,
    handles: Vec<JoinHandle<GroupOutcome>>,
}

impl DispatchReceipt {
    /// Fan-out counters.
    pub fn summary(&self) -> DispatchSummary {
        self.summary
    }

    /// Wait for every group task to finish.
    ///
    /// Tasks that panicked or were cancelled are logged and left out.
    pub async fn join(self) -> Vec<GroupOutcome> {
        let mut outcomes = Vec::with_capacity(self.handles.len());
        for handle in self.handles {
            match handle.await {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => warn!(error = %e, "Dispatch group task failed"),
            }
        }
        outcomes
    }
}

/// Fans delivery requests out to the queues of the owning servers.
pub struct FanoutDispatcher<L> {
    registry: Arc<ConnectionRegistry>,
    lookup: Arc<L>,
}

impl<L: StatusLookup> FanoutDispatcher<L> {
    /// Create a dispatcher over `registry`, resolving targets with `lookup`.
    pub fn new(registry: Arc<ConnectionRegistry>, lookup: Arc<L>) -> Self {
        Self { registry, lookup }
    }

    /// Get the connection registry.
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Get the status lookup.
    pub fn lookup(&self) -> &Arc<L> {
        &self.lookup
    }

    /// Dispatch a delivery request.
    ///
    /// Only a failed status lookup is reported to the caller. Groups whose
    /// server is not connected are dropped, and per-update failures are
    /// absorbed by the group tasks.
    #[instrument(skip(self, request), fields(targets = request.user_ids.len()))]
    pub async fn dispatch(&self, request: DeliveryRequest) -> Result<DispatchReceipt, SyncError> {
        let DeliveryRequest { user_ids, payload } = request;
        let user_ids = dedup_users(user_ids);

        let statuses = self
            .lookup
            .resolve_sessions(&user_ids)
            .await
            .inspect_err(|e| warn!(error = %e, "Status lookup failed"))?;

        let mut summary = DispatchSummary {
            resolved: statuses.len(),
            groups_dispatched: 0,
            groups_dropped: 0,
        };
        let mut handles = Vec::new();

        for (server_id, group) in group_by_server(statuses) {
            let Some(queue) = self.registry.lookup_for_send(server_id) else {
                debug!(
                    server_id,
                    sessions = group.len(),
                    "Target server not connected, dropping group"
                );
                metrics::record_group_dropped("not_connected");
                summary.groups_dropped += 1;
                continue;
            };

            let task = enqueue_group(server_id, queue, group, payload.clone())
                .instrument(info_span!("sync.dispatch.group", server_id));
            handles.push(tokio::spawn(task));
            summary.groups_dispatched += 1;
        }

        info!(
            resolved = summary.resolved,
            groups_dispatched = summary.groups_dispatched,
            groups_dropped = summary.groups_dropped,
            "Delivery request dispatched"
        );

        Ok(DispatchReceipt { summary, handles })
    }
}

/// Drop repeated user ids, keeping the first occurrence of each.
fn dedup_users(user_ids: Vec<UserId>) -> Vec<UserId> {
    let mut seen = HashSet::with_capacity(user_ids.len());
    user_ids.into_iter().filter(|id| seen.insert(*id)).collect()
}

/// Group statuses by owning server.
///
/// Groups appear in the order their server was first seen; each group keeps
/// the order its statuses were resolved in.
fn group_by_server(statuses: Vec<SessionStatus>) -> Vec<(ServerId, Vec<SessionStatus>)> {
    let mut index: HashMap<ServerId, usize> = HashMap::new();
    let mut groups: Vec<(ServerId, Vec<SessionStatus>)> = Vec::new();

    for status in statuses {
        let slot = *index.entry(status.server_id).or_insert_with(|| {
            groups.push((status.server_id, Vec::new()));
            groups.len() - 1
        });
        groups[slot].1.push(status);
    }

    groups
}

/// Enqueue one update per status onto `queue`, in order.
///
/// Waits whenever the queue is full. Gives up on the rest of the group as
/// soon as the queue turns out to be closed.
async fn enqueue_group(
    server_id: ServerId,
    queue: UpdateQueue,
    statuses: Vec<SessionStatus>,
    payload: Bytes,
) -> GroupOutcome {
    let total = statuses.len();
    let mut enqueued = 0;

    for status in &statuses {
        let update = PushUpdate::for_session(status, payload.clone());
        if let Err(closed) = queue.send(update).await {
            let abandoned = total - enqueued;
            warn!(
                session_id = closed.into_inner().session_id,
                enqueued,
                abandoned,
                "Update queue closed during dispatch, abandoning group"
            );
            metrics::record_updates_enqueued(enqueued as u64);
            metrics::record_updates_abandoned(abandoned as u64);
            metrics::record_group_dropped("stale_queue");
            return GroupOutcome {
                server_id,
                enqueued,
                abandoned,
            };
        }
        enqueued += 1;
    }

    debug!(enqueued, "Dispatch group enqueued");
    metrics::record_updates_enqueued(enqueued as u64);
    GroupOutcome {
        server_id,
        enqueued,
        abandoned: 0,
    }
}
