//! Common types for the sync router.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Identity of a downstream session server.
pub type ServerId = i32;

/// Identity of an end user.
pub type UserId = i32;

/// Identity of a client session on a session server.
pub type SessionId = i64;

/// Identity of the auth key a client session is bound to.
pub type AuthKeyId = i64;

/// Where a user's session currently lives.
///
/// Produced by a [`StatusLookup`](crate::StatusLookup) for every delivery
/// request. The router never caches these.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStatus {
    /// Session server that owns the session
    pub server_id: ServerId,
    /// User the session belongs to
    pub user_id: UserId,
    /// Auth key the session is bound to
    pub auth_key_id: AuthKeyId,
    /// Client session id
    pub session_id: SessionId,
    /// Transport session on the owning server that carries this client
    pub transport_session_id: i64,
}

/// A single update queued for one client session.
///
/// Built fresh for every (session, delivery request) pair and never mutated
/// afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushUpdate {
    pub auth_key_id: AuthKeyId,
    pub session_id: SessionId,
    pub transport_session_id: i64,
    /// Opaque serialized update body
    #[serde(with = "base64_payload")]
    pub payload: Bytes,
}

impl PushUpdate {
    /// Build the update addressed to the session described by `status`.
    pub fn for_session(status: &SessionStatus, payload: Bytes) -> Self {
        Self {
            auth_key_id: status.auth_key_id,
            session_id: status.session_id,
            transport_session_id: status.transport_session_id,
            payload,
        }
    }
}

/// Request to deliver one payload to every live session of a set of users.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryRequest {
    /// Users whose sessions should receive the payload
    pub user_ids: Vec<UserId>,
    /// Opaque serialized update body
    #[serde(with = "base64_payload")]
    pub payload: Bytes,
}

impl DeliveryRequest {
    /// Create a new delivery request.
    pub fn new(user_ids: Vec<UserId>, payload: impl Into<Bytes>) -> Self {
        Self {
            user_ids,
            payload: payload.into(),
        }
    }
}

/// Serde adapter encoding payload bytes as standard base64 text.
mod base64_payload {
    use base64::prelude::*;
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(payload: &Bytes, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&BASE64_STANDARD.encode(payload))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Bytes, D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded = String::deserialize(deserializer)?;
        BASE64_STANDARD
            .decode(encoded.as_bytes())
            .map(Bytes::from)
            .map_err(serde::de::Error::custom)
    }
}
