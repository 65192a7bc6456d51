//! Transport abstraction for the signaling channel.
//!
//! The channel actor is transport-agnostic: a websocket client, a long-poll
//! shim and the in-memory mock all implement [`Transport`]. Framing is raw
//! bytes; the typed event layer lives in [`crate::channel`].

use async_trait::async_trait;
use thiserror::Error;

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("not connected")]
    NotConnected,

    #[error("connection closed")]
    ConnectionClosed,

    #[error("send failed: {0}")]
    SendFailed(String),

    #[error("receive failed: {0}")]
    ReceiveFailed(String),
}

/// One logical connection to the signaling server.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Establish the connection.
    ///
    /// `credential` is an explicit bearer credential; `None` relies on
    /// ambient (cookie) authentication at the transport level.
    async fn connect(&self, credential: Option<String>) -> Result<(), TransportError>;

    /// Send one serialized event. Fire-and-forget at this layer: there is
    /// no delivery acknowledgment.
    async fn send(&self, data: &[u8]) -> Result<(), TransportError>;

    /// Receive the next inbound event, awaiting until one arrives or the
    /// connection drops.
    async fn recv(&self) -> Result<Vec<u8>, TransportError>;

    /// Whether the connection is currently up.
    fn is_connected(&self) -> bool;

    /// Release the connection.
    async fn close(&self) -> Result<(), TransportError>;
}
