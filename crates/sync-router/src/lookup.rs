//! Online status lookup.
//!
//! The dispatcher resolves delivery targets through [`StatusLookup`]. Hosts
//! plug in whatever backs their online status; [`InMemoryStatusLookup`] is a
//! process-local table suitable for a single router and for tests.

use std::collections::HashSet;
use std::future::Future;

use dashmap::DashMap;
use tracing::debug;

use crate::error::SyncError;
use crate::types::{AuthKeyId, SessionStatus, UserId};

/// Resolves users to the sessions they currently have open.
pub trait StatusLookup: Send + Sync + 'static {
    /// Resolve every live session of `user_ids` in one batched call.
    ///
    /// Users without a live session are silently omitted, so the result may
    /// be shorter than the input. A user listed twice is resolved once.
    fn resolve_sessions(
        &self,
        user_ids: &[UserId],
    ) -> impl Future<Output = Result<Vec<SessionStatus>, SyncError>> + Send;
}

/// In-memory online status table keyed by user.
///
/// A user may have several sessions, one per auth key.
#[derive(Debug, Default)]
pub struct InMemoryStatusLookup {
    sessions: DashMap<UserId, Vec<SessionStatus>>,
}

impl InMemoryStatusLookup {
    /// Create an empty status table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark a session online, replacing any status with the same auth key.
    pub fn set_online(&self, status: SessionStatus) {
        debug!(
            user_id = status.user_id,
            server_id = status.server_id,
            session_id = status.session_id,
            "Session online"
        );
        let mut sessions = self.sessions.entry(status.user_id).or_default();
        match sessions
            .iter()
            .position(|existing| existing.auth_key_id == status.auth_key_id)
        {
            Some(index) => sessions[index] = status,
            None => sessions.push(status),
        }
    }

    /// Mark a session offline.
    ///
    /// Returns true if the session was known.
    pub fn set_offline(&self, user_id: UserId, auth_key_id: AuthKeyId) -> bool {
        let removed = match self.sessions.get_mut(&user_id) {
            Some(mut sessions) => {
                let before = sessions.len();
                sessions.retain(|status| status.auth_key_id != auth_key_id);
                sessions.len() != before
            }
            None => false,
        };
        self.sessions.remove_if(&user_id, |_, sessions| sessions.is_empty());
        debug!(user_id, auth_key_id, removed, "Session offline");
        removed
    }

    /// All live sessions of a user.
    pub fn sessions_for(&self, user_id: UserId) -> Vec<SessionStatus> {
        self.sessions
            .get(&user_id)
            .map(|sessions| sessions.clone())
            .unwrap_or_default()
    }

    /// Number of users with at least one live session.
    pub fn online_user_count(&self) -> usize {
        self.sessions.len()
    }
}

impl StatusLookup for InMemoryStatusLookup {
    fn resolve_sessions(
        &self,
        user_ids: &[UserId],
    ) -> impl Future<Output = Result<Vec<SessionStatus>, SyncError>> + Send {
        let mut seen = HashSet::with_capacity(user_ids.len());
        let resolved: Vec<SessionStatus> = user_ids
            .iter()
            .filter(|user_id| seen.insert(**user_id))
            .filter_map(|user_id| self.sessions.get(user_id))
            .flat_map(|sessions| sessions.value().clone())
            .collect();
        async move { Ok(resolved) }
    }
}
