//! Error types for the sync router.

use thiserror::Error;

use crate::types::{PushUpdate, ServerId};

/// Sync router errors.
#[derive(Debug, Error)]
pub enum SyncError {
    /// A stream for this server is already registered
    #[error("Server {server_id} is already connected")]
    AlreadyConnected {
        /// Server that attempted to register
        server_id: ServerId,
    },

    /// The connection's stream was cancelled or closed by the peer
    #[error("Stream for server {server_id} cancelled: {reason}")]
    StreamCancelled {
        /// Server whose stream ended
        server_id: ServerId,
        /// Why the stream ended
        reason: String,
    },

    /// Writing an update to the transport failed
    #[error("Transport send to server {server_id} failed: {reason}")]
    TransportSend {
        /// Server whose transport failed
        server_id: ServerId,
        /// Underlying failure
        reason: String,
    },

    /// The online status lookup failed
    #[error("Status lookup failed: {0}")]
    StatusLookup(String),

    /// Frame encoding or decoding error
    #[error("Codec error: {0}")]
    Codec(String),

    /// The registering peer did not complete the handshake
    #[error("Handshake failed: {0}")]
    Handshake(String),

    /// IO error (network)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl SyncError {
    /// Create a new stream cancelled error.
    pub fn stream_cancelled(server_id: ServerId, reason: impl Into<String>) -> Self {
        Self::StreamCancelled {
            server_id,
            reason: reason.into(),
        }
    }

    /// Create a new transport send error.
    pub fn transport_send(server_id: ServerId, reason: impl Into<String>) -> Self {
        Self::TransportSend {
            server_id,
            reason: reason.into(),
        }
    }

    /// Create a new status lookup error.
    pub fn status_lookup(msg: impl Into<String>) -> Self {
        Self::StatusLookup(msg.into())
    }

    /// Create a new codec error.
    pub fn codec(msg: impl Into<String>) -> Self {
        Self::Codec(msg.into())
    }

    /// Create a new handshake error.
    pub fn handshake(msg: impl Into<String>) -> Self {
        Self::Handshake(msg.into())
    }

    /// Create a new configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a new internal error.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Short label used for metrics and log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::AlreadyConnected { .. } => "already_connected",
            Self::StreamCancelled { .. } => "stream_cancelled",
            Self::TransportSend { .. } => "transport_send",
            Self::StatusLookup(_) => "status_lookup",
            Self::Codec(_) => "codec",
            Self::Handshake(_) => "handshake",
            Self::Io(_) => "io",
            Self::Config(_) => "config",
            Self::Internal(_) => "internal",
        }
    }
}

/// The update queue was closed before the update could be enqueued.
///
/// Carries the rejected update back to the caller.
#[derive(Debug, Error)]
#[error("Update queue closed")]
pub struct QueueClosed(pub PushUpdate);

impl QueueClosed {
    /// Recover the update that could not be enqueued.
    pub fn into_inner(self) -> PushUpdate {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = SyncError::AlreadyConnected { server_id: 7 };
        assert_eq!(err.to_string(), "Server 7 is already connected");

        let err = SyncError::transport_send(9, "broken pipe");
        assert_eq!(
            err.to_string(),
            "Transport send to server 9 failed: broken pipe"
        );
    }

    #[test]
    fn test_error_kinds() {
        assert_eq!(
            SyncError::AlreadyConnected { server_id: 1 }.kind(),
            "already_connected"
        );
        assert_eq!(
            SyncError::stream_cancelled(1, "peer closed").kind(),
            "stream_cancelled"
        );
        assert_eq!(SyncError::status_lookup("down").kind(), "status_lookup");
    }
}
