//! Peer connection seam.
//!
//! The engine drives negotiation and chunk pumping against these traits;
//! the embedding application supplies the real WebRTC stack, tests use
//! the in-memory implementation from [`crate::memory`]. Methods take
//! `&self` because real peer connections are internally synchronized and
//! shared across event callbacks.

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::frames::Frame;

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("data channel closed")]
    Closed,

    #[error("negotiation failed: {0}")]
    Negotiation(String),

    #[error("send failed")]
    SendFailed,
}

/// An established, ordered, reliable data channel.
#[async_trait]
pub trait DataChannel: Send + Sync {
    /// Bytes accepted by `send` but not yet flushed to the peer.
    fn buffered_amount(&self) -> usize;

    async fn send(&self, frame: Frame) -> Result<(), ChannelError>;

    /// Next inbound frame. `Closed` once the peer hangs up and the queue
    /// is drained.
    async fn recv(&self) -> Result<Frame, ChannelError>;

    async fn close(&self);
}

/// One peer connection, alive for the duration of a single transfer.
#[async_trait]
pub trait PeerConnection: Send + Sync {
    /// Offerer side: produce the local session description.
    async fn create_offer(&self) -> Result<String, ChannelError>;

    /// Answerer side: consume the remote offer, produce the answer.
    async fn accept_offer(&self, offer: &str) -> Result<String, ChannelError>;

    /// Offerer side: consume the remote answer.
    async fn apply_answer(&self, answer: &str) -> Result<(), ChannelError>;

    async fn add_remote_candidate(&self, candidate: &str) -> Result<(), ChannelError>;

    /// Local ICE candidates to forward through the signaling channel.
    /// Yields the receiver once; subsequent calls return `None`.
    fn take_candidates(&self) -> Option<mpsc::UnboundedReceiver<String>>;

    /// The transfer channel; available once negotiation completed.
    async fn open_channel(&self) -> Result<std::sync::Arc<dyn DataChannel>, ChannelError>;

    async fn close(&self);
}

/// Factory for per-transfer connections.
#[async_trait]
pub trait PeerConnector: Send + Sync {
    async fn new_connection(&self) -> Result<Box<dyn PeerConnection>, ChannelError>;
}
