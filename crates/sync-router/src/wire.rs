//! Stream wire format.
//!
//! Session servers open a TCP connection to the router and exchange
//! length-delimited JSON frames (4-byte big-endian length prefix):
//!
//! ```text
//! session server                         router
//!      | --- ServerHello { server_id } ---> |
//!      | <-- Registered { server_id } ----- |   or Rejected { code, reason } + close
//!      | <-- Update(PushUpdate) ----------- |
//!      | <-- Update(PushUpdate) ----------- |
//!      |               ...                  |
//! ```

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWrite;
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio_util::codec::{Framed, FramedWrite, LengthDelimitedCodec};
use tracing::debug;

use crate::delivery::UpdateSink;
use crate::error::SyncError;
use crate::types::{PushUpdate, ServerId};

/// Largest frame either side accepts.
pub const MAX_FRAME_LENGTH: usize = 1024 * 1024;

/// First frame a session server sends after connecting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerHello {
    pub server_id: ServerId,
}

/// Frames sent from the router to a session server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RouterFrame {
    /// The stream is registered; updates follow.
    Registered { server_id: ServerId },
    /// Registration was refused; the router closes the stream.
    Rejected { code: String, reason: String },
    /// One push update.
    Update(PushUpdate),
}

/// Codec shared by both ends of the stream.
pub fn codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(MAX_FRAME_LENGTH)
        .new_codec()
}

/// Serialize a frame body.
pub fn encode_frame<T: Serialize>(frame: &T) -> Result<Bytes, SyncError> {
    serde_json::to_vec(frame)
        .map(Bytes::from)
        .map_err(|e| SyncError::codec(format!("Failed to encode frame: {}", e)))
}

/// Deserialize a frame body.
pub fn decode_frame<T: DeserializeOwned>(frame: &[u8]) -> Result<T, SyncError> {
    serde_json::from_slice(frame)
        .map_err(|e| SyncError::codec(format!("Failed to decode frame: {}", e)))
}

/// [`UpdateSink`] writing [`RouterFrame`]s to the write half of a stream.
pub struct FramedUpdateSink<W> {
    server_id: ServerId,
    writer: FramedWrite<W, LengthDelimitedCodec>,
}

impl<W: AsyncWrite + Unpin + Send> FramedUpdateSink<W> {
    /// Wrap the write half of a stream owned by `server_id`.
    pub fn new(server_id: ServerId, writer: W) -> Self {
        Self {
            server_id,
            writer: FramedWrite::new(writer, codec()),
        }
    }

    /// Write a control or update frame and flush it.
    pub async fn send_frame(&mut self, frame: &RouterFrame) -> Result<(), SyncError> {
        let bytes = encode_frame(frame)?;
        self.writer
            .send(bytes)
            .await
            .map_err(|e| SyncError::transport_send(self.server_id, e.to_string()))
    }
}

impl<W: AsyncWrite + Unpin + Send> UpdateSink for FramedUpdateSink<W> {
    async fn send(&mut self, update: &PushUpdate) -> Result<(), SyncError> {
        self.send_frame(&RouterFrame::Update(update.clone())).await
    }
}

/// Session server side of the stream.
///
/// Connects, registers and yields the updates the router pushes.
pub struct SyncClient {
    server_id: ServerId,
    framed: Framed<TcpStream, LengthDelimitedCodec>,
}

impl SyncClient {
    /// Connect to a router and register as `server_id`.
    ///
    /// Fails with [`SyncError::AlreadyConnected`] if the router already holds
    /// a stream for this server.
    pub async fn connect<A: ToSocketAddrs>(
        addr: A,
        server_id: ServerId,
    ) -> Result<Self, SyncError> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        let mut framed = Framed::new(stream, codec());

        framed
            .send(encode_frame(&ServerHello { server_id })?)
            .await?;

        let frame = match framed.next().await {
            Some(frame) => frame?,
            None => return Err(SyncError::handshake("Router closed the stream during handshake")),
        };

        match decode_frame::<RouterFrame>(&frame)? {
            RouterFrame::Registered { server_id: registered } if registered == server_id => {
                debug!(server_id, "Stream registered");
                Ok(Self { server_id, framed })
            }
            RouterFrame::Rejected { code, .. } if code == "already_connected" => {
                Err(SyncError::AlreadyConnected { server_id })
            }
            RouterFrame::Rejected { reason, .. } => Err(SyncError::handshake(reason)),
            other => Err(SyncError::handshake(format!(
                "Unexpected handshake frame: {:?}",
                other
            ))),
        }
    }

    /// Server id this stream is registered as.
    pub fn server_id(&self) -> ServerId {
        self.server_id
    }

    /// Wait for the next update.
    ///
    /// Returns `Ok(None)` once the router closes the stream.
    pub async fn next_update(&mut self) -> Result<Option<PushUpdate>, SyncError> {
        loop {
            let frame = match self.framed.next().await {
                Some(frame) => frame?,
                None => return Ok(None),
            };

            match decode_frame::<RouterFrame>(&frame)? {
                RouterFrame::Update(update) => return Ok(Some(update)),
                other => debug!(frame = ?other, "Ignoring control frame"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_util::codec::FramedRead;

    fn update() -> PushUpdate {
        PushUpdate {
            auth_key_id: 42,
            session_id: 3,
            transport_session_id: 9,
            payload: Bytes::from_static(b"\x00\x01binary"),
        }
    }

    #[test]
    fn test_router_frame_json_shape() {
        let json = serde_json::to_value(RouterFrame::Registered { server_id: 7 }).unwrap();
        assert_eq!(json, serde_json::json!({"type": "registered", "server_id": 7}));

        let json = serde_json::to_value(RouterFrame::Update(update())).unwrap();
        assert_eq!(json["type"], "update");
        assert_eq!(json["session_id"], 3);
        assert_eq!(json["auth_key_id"], 42);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        let result = decode_frame::<ServerHello>(b"{not json");
        assert!(matches!(result, Err(SyncError::Codec(_))));
    }

    #[tokio::test]
    async fn test_framed_sink_writes_length_prefixed_updates() {
        let (client, server) = tokio::io::duplex(4096);
        let mut sink = FramedUpdateSink::new(7, server);

        sink.send(&update()).await.unwrap();

        let mut reader = FramedRead::new(client, codec());
        let frame = reader.next().await.unwrap().unwrap();
        let decoded: RouterFrame = decode_frame(&frame).unwrap();
        assert_eq!(decoded, RouterFrame::Update(update()));
    }

    #[tokio::test]
    async fn test_framed_sink_reports_closed_peer() {
        let (client, server) = tokio::io::duplex(64);
        drop(client);
        let mut sink = FramedUpdateSink::new(7, server);

        let result = sink.send(&update()).await;
        assert!(matches!(result, Err(SyncError::TransportSend { server_id: 7, .. })));
    }
}
