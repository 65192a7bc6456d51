//! The façade. One [`ChatClient`] per signed-in user.
//!
//! Construction wires the three engines to one signaling channel and
//! starts a bridge task that merges their notification streams, plus the
//! pass-through events no engine consumes (typing, read receipts), onto a
//! single broadcast subscription.

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{broadcast, mpsc, watch};
use tracing::warn;

use palaver_shared::protocol::{ClientEvent, ServerEvent};
use palaver_shared::types::{ConversationId, TransferId, UserId};
use palaver_signal::{
    spawn_channel, ConnectionState, SignalConfig, SignalHandle, Transport,
};
use palaver_sync::{
    spawn_engine, ConversationApi, SyncConfig, SyncError, SyncHandle, SyncNotification,
    SyncSnapshot,
};
use palaver_transfer::{
    spawn_transfer, PeerConnector, TransferConfig, TransferError, TransferHandle,
    TransferNotification, TransferSummary,
};

use crate::events::ClientNotification;

#[derive(Debug, Clone, Default)]
pub struct ChatClientConfig {
    pub signal: SignalConfig,
    pub sync: SyncConfig,
    pub transfer: TransferConfig,
}

pub struct ChatClient {
    signal: SignalHandle,
    sync: SyncHandle,
    transfers: TransferHandle,
    notifications: broadcast::Sender<ClientNotification>,
}

impl ChatClient {
    pub fn new(
        transport: Arc<dyn Transport>,
        api: Arc<dyn ConversationApi>,
        connector: Arc<dyn PeerConnector>,
        config: ChatClientConfig,
    ) -> Self {
        let signal = spawn_channel(transport, config.signal);
        let (sync, sync_rx) = spawn_engine(api, signal.clone(), config.sync);
        let (transfers, transfer_rx) = spawn_transfer(connector, signal.clone(), config.transfer);

        let (notifications, _) = broadcast::channel(256);
        tokio::spawn(bridge(
            sync_rx,
            transfer_rx,
            signal.events(),
            signal.state(),
            notifications.clone(),
        ));

        Self {
            signal,
            sync,
            transfers,
            notifications,
        }
    }

    /// Subscribe to the merged notification stream. Slow subscribers that
    /// lag past the buffer miss the oldest notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<ClientNotification> {
        self.notifications.subscribe()
    }

    pub async fn connect(&self, credential: Option<&str>) {
        self.signal.connect(credential).await;
    }

    pub async fn disconnect(&self) {
        self.signal.disconnect().await;
    }

    pub fn is_connected(&self) -> bool {
        self.signal.is_connected()
    }

    pub async fn send_message(&self, text: impl Into<String>) {
        self.sync.send_message(text).await;
    }

    pub async fn set_active_conversation(&self, conversation: Option<ConversationId>) {
        self.sync.set_active(conversation).await;
    }

    pub async fn load_older_messages(&self) {
        self.sync.load_older().await;
    }

    pub async fn mark_read(&self, conversation: ConversationId) {
        self.sync.mark_read(conversation).await;
    }

    pub async fn refresh_conversations(&self) {
        self.sync.refresh_conversations().await;
    }

    pub async fn start_conversation(&self, peer: UserId) {
        self.sync.start_conversation(peer).await;
    }

    pub async fn snapshot(&self) -> Result<SyncSnapshot, SyncError> {
        self.sync.snapshot().await
    }

    /// Typing indicators go straight out; no engine tracks them.
    pub async fn send_typing(&self, conversation: ConversationId, is_typing: bool) {
        self.signal
            .emit(ClientEvent::Typing {
                conversation_id: conversation,
                is_typing,
            })
            .await;
    }

    pub async fn send_file(
        &self,
        peer: UserId,
        name: impl Into<String>,
        mime_type: impl Into<String>,
        data: Bytes,
    ) -> Result<TransferId, TransferError> {
        self.transfers.send_file(peer, name, mime_type, data).await
    }

    pub async fn accept_transfer(&self, transfer_id: TransferId) {
        self.transfers.accept(transfer_id).await;
    }

    pub async fn reject_transfer(&self, transfer_id: TransferId) {
        self.transfers.reject(transfer_id).await;
    }

    pub async fn cancel_transfer(&self, transfer_id: TransferId) {
        self.transfers.cancel(transfer_id).await;
    }

    pub async fn transfers(&self) -> Result<Vec<TransferSummary>, TransferError> {
        self.transfers.sessions().await
    }

    /// Stop every engine. The client is unusable afterwards.
    pub async fn shutdown(&self) {
        self.transfers.shutdown().await;
        self.sync.shutdown().await;
        self.signal.shutdown().await;
    }
}

async fn bridge(
    mut sync_rx: mpsc::Receiver<SyncNotification>,
    mut transfer_rx: mpsc::Receiver<TransferNotification>,
    mut events_rx: broadcast::Receiver<ServerEvent>,
    mut state_rx: watch::Receiver<ConnectionState>,
    out: broadcast::Sender<ClientNotification>,
) {
    let mut sync_open = true;
    let mut transfer_open = true;
    let mut events_open = true;
    let mut state_open = true;

    while sync_open || transfer_open {
        tokio::select! {
            n = sync_rx.recv(), if sync_open => match n {
                Some(n) => {
                    let _ = out.send(n.into());
                }
                None => sync_open = false,
            },
            n = transfer_rx.recv(), if transfer_open => match n {
                Some(n) => {
                    let _ = out.send(n.into());
                }
                None => transfer_open = false,
            },
            event = events_rx.recv(), if events_open => match event {
                Ok(event) => {
                    if let Some(n) = passthrough(event) {
                        let _ = out.send(n);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "notification bridge lagged behind signaling events");
                }
                Err(broadcast::error::RecvError::Closed) => events_open = false,
            },
            changed = state_rx.changed(), if state_open => match changed {
                Ok(()) => {
                    let state = *state_rx.borrow();
                    let _ = out.send(ClientNotification::ConnectionChanged(state));
                }
                Err(_) => state_open = false,
            },
        }
    }
}

/// Events surfaced directly to the UI without engine involvement.
fn passthrough(event: ServerEvent) -> Option<ClientNotification> {
    match event {
        ServerEvent::Typing {
            conversation_id,
            user_id,
            is_typing,
        } => Some(ClientNotification::PeerTyping {
            conversation_id,
            user_id,
            is_typing,
        }),
        ServerEvent::MessageRead {
            conversation_id,
            read_by,
            message_ids,
        } => Some(ClientNotification::MessagesRead {
            conversation_id,
            read_by,
            message_ids,
        }),
        _ => None,
    }
}
