//! The sync engine actor.
//!
//! One task owns every piece of cross-operation mutable state: the
//! conversation list, the active-conversation pointer, the message list of
//! the active conversation and the optimistic outbox. Commands, inbound
//! server events, fetch completions and rollback deadlines all feed the
//! same serialized loop, so the pointer and the reentrancy guard are
//! written synchronously at the moment of decision, never after an await.
//!
//! Page fetches run as background tasks tagged with an epoch; a result
//! whose epoch or conversation no longer matches the current switch is
//! discarded, which is what makes a fast A→B switch safe against A's
//! fetch completing late.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use palaver_shared::constants::{ECHO_TIMEOUT, MESSAGE_PAGE_SIZE};
use palaver_shared::model::{Conversation, DeliveryState, Message};
use palaver_shared::protocol::{ClientEvent, ServerEvent};
use palaver_shared::types::{ConversationId, MessageId, UserId};
use palaver_signal::{ConnectionState, SignalHandle};

use crate::api::{ApiError, ConversationApi};
use crate::conversation::ConversationList;
use crate::pending::PendingOutbox;

#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Bounded wait for the authoritative echo of an optimistic message.
    pub echo_timeout: Duration,
    pub page_size: u32,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            echo_timeout: ECHO_TIMEOUT,
            page_size: MESSAGE_PAGE_SIZE,
        }
    }
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("sync engine is not running")]
    EngineClosed,
}

#[derive(Debug)]
enum Command {
    SendMessage { text: String },
    SetActive { conversation: Option<ConversationId> },
    LoadOlder,
    MarkRead { conversation: ConversationId },
    RefreshConversations,
    StartConversation { peer: UserId },
    Snapshot { reply: oneshot::Sender<SyncSnapshot> },
    Shutdown,
}

/// Derived state pushed to the façade.
#[derive(Debug, Clone)]
pub enum SyncNotification {
    ConversationsChanged(Vec<Conversation>),
    MessagesChanged {
        conversation: Option<ConversationId>,
        messages: Vec<Message>,
        has_more: bool,
    },
    MessageRolledBack {
        conversation: ConversationId,
        local_id: MessageId,
    },
    SyncError {
        message: String,
    },
}

/// Point-in-time view of the engine's projections.
#[derive(Debug, Clone)]
pub struct SyncSnapshot {
    pub conversations: Vec<Conversation>,
    pub active: Option<ConversationId>,
    pub messages: Vec<Message>,
    pub has_more: bool,
    pub pending_count: usize,
}

#[derive(Clone)]
pub struct SyncHandle {
    cmd_tx: mpsc::Sender<Command>,
}

impl SyncHandle {
    pub async fn send_message(&self, text: impl Into<String>) {
        self.send(Command::SendMessage { text: text.into() }).await;
    }

    pub async fn set_active(&self, conversation: Option<ConversationId>) {
        self.send(Command::SetActive { conversation }).await;
    }

    pub async fn load_older(&self) {
        self.send(Command::LoadOlder).await;
    }

    pub async fn mark_read(&self, conversation: ConversationId) {
        self.send(Command::MarkRead { conversation }).await;
    }

    pub async fn refresh_conversations(&self) {
        self.send(Command::RefreshConversations).await;
    }

    pub async fn start_conversation(&self, peer: UserId) {
        self.send(Command::StartConversation { peer }).await;
    }

    pub async fn snapshot(&self) -> Result<SyncSnapshot, SyncError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Snapshot { reply }).await;
        rx.await.map_err(|_| SyncError::EngineClosed)
    }

    pub async fn shutdown(&self) {
        self.send(Command::Shutdown).await;
    }

    async fn send(&self, cmd: Command) {
        if self.cmd_tx.send(cmd).await.is_err() {
            warn!("sync engine is gone, dropping command");
        }
    }
}

/// Spawn the sync engine. Returns the command handle and the notification
/// stream.
pub fn spawn_engine(
    api: Arc<dyn ConversationApi>,
    signal: SignalHandle,
    config: SyncConfig,
) -> (SyncHandle, mpsc::Receiver<SyncNotification>) {
    let (cmd_tx, cmd_rx) = mpsc::channel(256);
    let (notify_tx, notify_rx) = mpsc::channel(256);
    let (fetch_tx, fetch_rx) = mpsc::channel(64);

    let engine = Engine {
        api,
        signal: signal.clone(),
        config,
        conversations: ConversationList::new(),
        active: None,
        messages: Vec::new(),
        has_more: false,
        outbox: PendingOutbox::new(),
        fetch_epoch: 0,
        viewer: None,
        notify_tx,
        fetch_tx,
    };
    tokio::spawn(engine.run(cmd_rx, fetch_rx, signal));

    (SyncHandle { cmd_tx }, notify_rx)
}

enum FetchResult {
    Page {
        epoch: u64,
        conversation: ConversationId,
        older: bool,
        result: Result<Vec<Message>, ApiError>,
    },
    Conversations(Result<Vec<Conversation>, ApiError>),
    Started(Result<Conversation, ApiError>),
}

struct Engine {
    api: Arc<dyn ConversationApi>,
    signal: SignalHandle,
    config: SyncConfig,
    conversations: ConversationList,
    /// The single active-conversation pointer for this client session.
    active: Option<ConversationId>,
    /// Messages of the active conversation, ascending by `created_at`.
    messages: Vec<Message>,
    has_more: bool,
    outbox: PendingOutbox,
    /// Bumped on every switch; stale fetch results are discarded by epoch.
    fetch_epoch: u64,
    /// Learned from the `connected` event.
    viewer: Option<UserId>,
    notify_tx: mpsc::Sender<SyncNotification>,
    fetch_tx: mpsc::Sender<FetchResult>,
}

impl Engine {
    async fn run(
        mut self,
        mut cmd_rx: mpsc::Receiver<Command>,
        mut fetch_rx: mpsc::Receiver<FetchResult>,
        signal: SignalHandle,
    ) {
        let mut events_rx = signal.events();
        let mut state_rx = signal.state();
        let mut events_open = true;
        let mut state_open = true;

        loop {
            let deadline = self.outbox.next_deadline();
            tokio::select! {
                cmd = cmd_rx.recv() => match cmd {
                    Some(cmd) => {
                        if !self.handle_command(cmd).await {
                            break;
                        }
                    }
                    None => break,
                },
                event = events_rx.recv(), if events_open => match event {
                    Ok(event) => self.handle_server_event(event).await,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "sync engine lagged behind signaling events");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        events_open = false;
                    }
                },
                changed = state_rx.changed(), if state_open => match changed {
                    Ok(()) => {
                        let state = *state_rx.borrow();
                        self.handle_connection_state(state).await;
                    }
                    Err(_) => state_open = false,
                },
                fetched = fetch_rx.recv() => {
                    if let Some(fetched) = fetched {
                        self.handle_fetch(fetched).await;
                    }
                },
                _ = async {
                    match deadline {
                        Some(at) => tokio::time::sleep_until(at).await,
                        None => std::future::pending().await,
                    }
                }, if deadline.is_some() => {
                    self.rollback_expired().await;
                }
            }
        }

        debug!("sync engine terminated");
    }

    /// Returns false when the engine should stop.
    async fn handle_command(&mut self, cmd: Command) -> bool {
        match cmd {
            Command::SendMessage { text } => {
                self.send_message(text).await;
                true
            }
            Command::SetActive { conversation } => {
                self.set_active(conversation).await;
                true
            }
            Command::LoadOlder => {
                self.load_older();
                true
            }
            Command::MarkRead { conversation } => {
                self.mark_read(conversation).await;
                true
            }
            Command::RefreshConversations => {
                self.spawn_conversations_fetch();
                true
            }
            Command::StartConversation { peer } => {
                let api = self.api.clone();
                let tx = self.fetch_tx.clone();
                tokio::spawn(async move {
                    let result = api.start_conversation(&peer).await;
                    let _ = tx.send(FetchResult::Started(result)).await;
                });
                true
            }
            Command::Snapshot { reply } => {
                let _ = reply.send(SyncSnapshot {
                    conversations: self.conversations.to_vec(),
                    active: self.active.clone(),
                    messages: self.messages.clone(),
                    has_more: self.has_more,
                    pending_count: self.outbox.len(),
                });
                true
            }
            Command::Shutdown => false,
        }
    }

    /// Optimistic send: the pending message is visible before any network
    /// round trip and the outbox entry doubles as the reentrancy guard.
    async fn send_message(&mut self, text: String) {
        let Some(conversation_id) = self.active.clone() else {
            warn!("send with no active conversation, ignoring");
            return;
        };
        let Some(sender_id) = self.viewer.clone() else {
            warn!("send before signaling session established, refusing");
            self.notify(SyncNotification::SyncError {
                message: "signaling session not established".into(),
            })
            .await;
            return;
        };

        let local_id = MessageId::local();
        let message = Message {
            id: local_id.clone(),
            conversation_id: conversation_id.clone(),
            sender_id,
            text: text.clone(),
            created_at: Utc::now(),
            delivery: DeliveryState::Pending,
        };

        self.messages.push(message.clone());
        self.outbox.push(
            local_id.clone(),
            conversation_id.clone(),
            text.clone(),
            Instant::now() + self.config.echo_timeout,
        );
        self.conversations.apply_last_message(&message);
        self.notify_messages().await;
        self.notify_conversations().await;

        self.signal
            .emit(ClientEvent::SendMessage {
                conversation_id,
                text,
                local_id: Some(local_id),
            })
            .await;
    }

    async fn set_active(&mut self, target: Option<ConversationId>) {
        if target == self.active {
            debug!(?target, "conversation already active, ignoring switch");
            return;
        }

        // The pointer is updated synchronously, before any await, so no
        // interleaved operation can observe the old value.
        let previous = std::mem::replace(&mut self.active, target.clone());
        self.fetch_epoch += 1;
        self.messages.clear();
        self.has_more = false;

        if let Some(prev) = previous {
            self.signal
                .emit(ClientEvent::LeaveConversation {
                    conversation_id: prev,
                })
                .await;
        }

        let Some(id) = target else {
            self.notify_messages().await;
            return;
        };

        info!(conversation = %id, "switching active conversation");
        self.signal
            .emit(ClientEvent::JoinConversation {
                conversation_id: id.clone(),
            })
            .await;
        self.notify_messages().await;
        self.spawn_page_fetch(id.clone(), None, false);

        if self.conversations.unread(&id) > 0 {
            self.mark_read(id).await;
        }
    }

    fn load_older(&mut self) {
        let Some(id) = self.active.clone() else {
            return;
        };
        let Some(oldest) = self
            .messages
            .iter()
            .filter(|m| !m.is_pending())
            .map(|m| m.created_at)
            .min()
        else {
            return;
        };
        self.spawn_page_fetch(id, Some(oldest), true);
    }

    async fn mark_read(&mut self, conversation: ConversationId) {
        if self.conversations.clear_unread(&conversation) {
            self.notify_conversations().await;
        }
        self.signal
            .emit(ClientEvent::MarkRead {
                conversation_id: conversation.clone(),
                message_ids: None,
            })
            .await;

        // REST fallback; a failed read sync never rolls back local state.
        let api = self.api.clone();
        tokio::spawn(async move {
            if let Err(e) = api.mark_read(&conversation).await {
                warn!(conversation = %conversation, error = %e, "mark-read sync failed");
            }
        });
    }

    fn spawn_page_fetch(
        &self,
        conversation: ConversationId,
        before: Option<chrono::DateTime<Utc>>,
        older: bool,
    ) {
        let api = self.api.clone();
        let tx = self.fetch_tx.clone();
        let epoch = self.fetch_epoch;
        let limit = self.config.page_size;
        tokio::spawn(async move {
            let result = api.fetch_messages(&conversation, limit, before).await;
            let _ = tx
                .send(FetchResult::Page {
                    epoch,
                    conversation,
                    older,
                    result,
                })
                .await;
        });
    }

    fn spawn_conversations_fetch(&self) {
        let api = self.api.clone();
        let tx = self.fetch_tx.clone();
        tokio::spawn(async move {
            let result = api.fetch_conversations().await;
            let _ = tx.send(FetchResult::Conversations(result)).await;
        });
    }

    async fn handle_fetch(&mut self, fetched: FetchResult) {
        match fetched {
            FetchResult::Page {
                epoch,
                conversation,
                older,
                result,
            } => {
                if epoch != self.fetch_epoch || self.active.as_ref() != Some(&conversation) {
                    debug!(conversation = %conversation, "discarding superseded page fetch");
                    return;
                }
                if !older && self.outbox.guards(&conversation) {
                    debug!(
                        conversation = %conversation,
                        "optimistic update outstanding, discarding page fetch"
                    );
                    return;
                }
                match result {
                    Ok(page) => {
                        let full = page.len() as u32 == self.config.page_size;
                        let mut ascending = page;
                        ascending.reverse();
                        self.has_more = full;
                        if older {
                            ascending.append(&mut self.messages);
                        }
                        self.messages = ascending;
                        self.notify_messages().await;
                    }
                    Err(e) => {
                        warn!(conversation = %conversation, error = %e, "page fetch failed");
                        self.notify(SyncNotification::SyncError {
                            message: e.to_string(),
                        })
                        .await;
                    }
                }
            }
            FetchResult::Conversations(result) => match result {
                Ok(list) => {
                    self.conversations.replace(list);
                    self.notify_conversations().await;
                }
                Err(e) => {
                    warn!(error = %e, "conversation list fetch failed");
                    self.notify(SyncNotification::SyncError {
                        message: e.to_string(),
                    })
                    .await;
                }
            },
            FetchResult::Started(result) => match result {
                Ok(conversation) => {
                    self.conversations.upsert(conversation);
                    self.notify_conversations().await;
                }
                Err(e) => {
                    warn!(error = %e, "start conversation failed");
                    self.notify(SyncNotification::SyncError {
                        message: e.to_string(),
                    })
                    .await;
                }
            },
        }
    }

    async fn handle_server_event(&mut self, event: ServerEvent) {
        match event {
            ServerEvent::Connected { user_id, .. } => {
                debug!(user = %user_id, "signaling session established");
                self.viewer = Some(user_id);
            }
            ServerEvent::NewMessage(message) => self.handle_new_message(message).await,
            ServerEvent::ConversationUpdated {
                conversation_id,
                last_message,
            } => {
                if !self.conversations.apply_last_message(&last_message) {
                    debug!(conversation = %conversation_id, "update for unknown conversation");
                    self.spawn_conversations_fetch();
                }
                self.notify_conversations().await;
            }
            ServerEvent::MessageRead {
                conversation_id,
                read_by,
                ..
            } => {
                if self.viewer.as_ref() == Some(&read_by)
                    && self.conversations.clear_unread(&conversation_id)
                {
                    self.notify_conversations().await;
                }
            }
            ServerEvent::Error { message } => {
                warn!(message = %message, "server error event");
                self.notify(SyncNotification::SyncError { message }).await;
            }
            // Typing is republished by the façade; negotiation events
            // belong to the transfer engine.
            ServerEvent::Typing { .. }
            | ServerEvent::WebrtcOffer(_)
            | ServerEvent::WebrtcAnswer(_)
            | ServerEvent::WebrtcIceCandidate(_)
            | ServerEvent::WebrtcRejected(_)
            | ServerEvent::FileRequest { .. } => {}
        }
    }

    async fn handle_new_message(&mut self, message: Message) {
        // Reconciliation first: an echo replaces the oldest pending
        // message with the same conversation and text, in place.
        if let Some(entry) = self
            .outbox
            .take_match(&message.conversation_id, &message.text)
        {
            debug!(local = %entry.local_id, server = %message.id, "reconciled optimistic message");
            if let Some(pos) = self.messages.iter().position(|m| m.id == entry.local_id) {
                self.messages[pos] = message.clone();
            } else if self.active.as_ref() == Some(&message.conversation_id) {
                self.messages.push(message.clone());
            }
            self.conversations.apply_last_message(&message);
            if self.active.as_ref() == Some(&message.conversation_id) {
                self.notify_messages().await;
            }
            self.notify_conversations().await;
            return;
        }

        let own = self.viewer.as_ref() == Some(&message.sender_id);
        let is_active = self.active.as_ref() == Some(&message.conversation_id);

        if is_active {
            self.messages.push(message.clone());
            self.notify_messages().await;
            if !own {
                // Live conversation: read on arrival.
                self.signal
                    .emit(ClientEvent::MarkRead {
                        conversation_id: message.conversation_id.clone(),
                        message_ids: Some(vec![message.id.clone()]),
                    })
                    .await;
            }
        } else if !own {
            self.conversations.bump_unread(&message.conversation_id);
        }

        if !self.conversations.apply_last_message(&message) {
            debug!(conversation = %message.conversation_id, "message for unknown conversation");
            self.spawn_conversations_fetch();
        }
        self.notify_conversations().await;
    }

    async fn handle_connection_state(&mut self, state: ConnectionState) {
        match state {
            ConnectionState::Connected => {
                if let Some(id) = self.active.clone() {
                    info!(conversation = %id, "reconnected, rejoining active room");
                    self.signal
                        .emit(ClientEvent::JoinConversation {
                            conversation_id: id,
                        })
                        .await;
                }
            }
            ConnectionState::Disconnected => {
                // No echo can arrive for in-flight sends.
                let lost = self.outbox.take_all();
                for entry in lost {
                    self.rollback(entry).await;
                }
            }
        }
    }

    async fn rollback_expired(&mut self) {
        let expired = self.outbox.take_expired(Instant::now());
        for entry in expired {
            self.rollback(entry).await;
        }
    }

    async fn rollback(&mut self, entry: crate::pending::PendingEntry) {
        warn!(
            local = %entry.local_id,
            conversation = %entry.conversation_id,
            "no echo for optimistic message, rolling back"
        );

        self.conversations
            .rollback_last_message(&entry.conversation_id, &entry.local_id);
        if self.active.as_ref() == Some(&entry.conversation_id) {
            self.messages.retain(|m| m.id != entry.local_id);
            if let Some(last) = self.messages.last().cloned() {
                self.conversations.apply_last_message(&last);
            }
            self.notify_messages().await;
        }
        self.notify_conversations().await;
        self.notify(SyncNotification::MessageRolledBack {
            conversation: entry.conversation_id,
            local_id: entry.local_id,
        })
        .await;
    }

    async fn notify_messages(&self) {
        self.notify(SyncNotification::MessagesChanged {
            conversation: self.active.clone(),
            messages: self.messages.clone(),
            has_more: self.has_more,
        })
        .await;
    }

    async fn notify_conversations(&self) {
        self.notify(SyncNotification::ConversationsChanged(
            self.conversations.to_vec(),
        ))
        .await;
    }

    async fn notify(&self, notification: SyncNotification) {
        let _ = self.notify_tx.send(notification).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::MockApi;
    use chrono::TimeZone;
    use palaver_shared::types::ConversationKind;
    use palaver_signal::{spawn_channel, MockTransport, SignalConfig};

    struct Harness {
        transport: MockTransport,
        api: MockApi,
        signal: SignalHandle,
        sync: SyncHandle,
        notifications: mpsc::Receiver<SyncNotification>,
    }

    fn conv(id: &str, minute: u32, unread: u32) -> Conversation {
        Conversation {
            id: ConversationId::from(id),
            kind: ConversationKind::Direct,
            participants: vec![UserId::from("alice"), UserId::from("bob")],
            last_message: None,
            unread_count: unread,
            updated_at: Utc.with_ymd_and_hms(2026, 1, 1, 10, minute, 0).unwrap(),
        }
    }

    fn server_msg(id: &str, conversation: &str, sender: &str, text: &str, minute: u32) -> Message {
        Message {
            id: MessageId::from(id),
            conversation_id: ConversationId::from(conversation),
            sender_id: UserId::from(sender),
            text: text.into(),
            created_at: Utc.with_ymd_and_hms(2026, 1, 1, 11, minute, 0).unwrap(),
            delivery: DeliveryState::Confirmed,
        }
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    /// Connected harness with the viewer identified as "alice".
    async fn harness(conversations: Vec<Conversation>) -> Harness {
        let transport = MockTransport::new();
        let api = MockApi::new();
        api.set_conversations(conversations);

        let signal = spawn_channel(Arc::new(transport.clone()), SignalConfig::default());
        let (sync, notifications) =
            spawn_engine(Arc::new(api.clone()), signal.clone(), SyncConfig::default());

        signal.connect(None).await;
        settle().await;
        transport.queue_event(ServerEvent::Connected {
            user_id: UserId::from("alice"),
            server_time: Utc::now(),
        });
        sync.refresh_conversations().await;
        settle().await;

        Harness {
            transport,
            api,
            signal,
            sync,
            notifications,
        }
    }

    fn sent_join_count(h: &Harness, id: &str) -> usize {
        h.transport
            .sent_events()
            .into_iter()
            .filter(|e| {
                matches!(e, ClientEvent::JoinConversation { conversation_id } if conversation_id.0 == id)
            })
            .count()
    }

    #[tokio::test(start_paused = true)]
    async fn optimistic_send_appears_immediately() {
        let h = harness(vec![conv("c1", 1, 0)]).await;
        h.sync.set_active(Some(ConversationId::from("c1"))).await;
        settle().await;

        h.sync.send_message("Hello").await;
        let snap = h.sync.snapshot().await.unwrap();

        assert_eq!(snap.messages.len(), 1);
        assert!(snap.messages[0].id.is_local());
        assert!(snap.messages[0].is_pending());
        assert_eq!(snap.pending_count, 1);

        let top = &snap.conversations[0];
        assert_eq!(top.id, ConversationId::from("c1"));
        assert_eq!(top.last_message.as_ref().unwrap().text, "Hello");
    }

    #[tokio::test(start_paused = true)]
    async fn echo_reconciles_in_place() {
        let h = harness(vec![conv("c1", 1, 0)]).await;
        h.sync.set_active(Some(ConversationId::from("c1"))).await;
        settle().await;
        h.sync.send_message("Hello").await;
        settle().await;

        h.transport
            .queue_event(ServerEvent::NewMessage(server_msg(
                "srv-1", "c1", "alice", "Hello", 0,
            )));
        settle().await;

        let snap = h.sync.snapshot().await.unwrap();
        let hellos: Vec<_> = snap.messages.iter().filter(|m| m.text == "Hello").collect();
        assert_eq!(hellos.len(), 1);
        assert_eq!(hellos[0].id, MessageId::from("srv-1"));
        assert!(!hellos[0].is_pending());
        assert_eq!(snap.pending_count, 0);
        // The viewer's own echo is never counted as unread.
        assert_eq!(snap.conversations[0].unread_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn echo_timeout_rolls_back_and_recovers() {
        let mut h = harness(vec![conv("c1", 1, 0)]).await;
        h.sync.set_active(Some(ConversationId::from("c1"))).await;
        settle().await;
        h.sync.send_message("Hello").await;
        settle().await;

        tokio::time::sleep(Duration::from_secs(6)).await;

        let snap = h.sync.snapshot().await.unwrap();
        assert!(snap.messages.is_empty());
        assert_eq!(snap.pending_count, 0);
        // The optimistic preview is gone from the conversation list too.
        assert!(snap.conversations[0].last_message.is_none());

        let mut rolled_back = false;
        while let Ok(n) = h.notifications.try_recv() {
            if matches!(n, SyncNotification::MessageRolledBack { .. }) {
                rolled_back = true;
            }
        }
        assert!(rolled_back);

        // Subsequent sends are unaffected.
        h.sync.send_message("Again").await;
        settle().await;
        h.transport
            .queue_event(ServerEvent::NewMessage(server_msg(
                "srv-2", "c1", "alice", "Again", 1,
            )));
        settle().await;
        let snap = h.sync.snapshot().await.unwrap();
        assert_eq!(snap.messages.len(), 1);
        assert_eq!(snap.messages[0].id, MessageId::from("srv-2"));
    }

    #[tokio::test(start_paused = true)]
    async fn switch_to_current_conversation_is_noop() {
        let h = harness(vec![conv("c1", 1, 0)]).await;
        let id = ConversationId::from("c1");

        h.sync.set_active(Some(id.clone())).await;
        settle().await;
        h.sync.set_active(Some(id.clone())).await;
        h.sync.set_active(Some(id.clone())).await;
        settle().await;

        assert_eq!(h.api.fetch_count(&id), 1);
        assert_eq!(sent_join_count(&h, "c1"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn fast_switch_supersedes_earlier_fetch() {
        let h = harness(vec![conv("c1", 1, 0), conv("c2", 2, 0)]).await;
        let c1 = ConversationId::from("c1");
        let c2 = ConversationId::from("c2");
        h.api
            .set_messages(c1.clone(), vec![server_msg("a1", "c1", "bob", "from c1", 0)]);
        h.api
            .set_messages(c2.clone(), vec![server_msg("b1", "c2", "bob", "from c2", 1)]);
        h.api.set_fetch_delay(c1.clone(), Duration::from_millis(500));

        h.sync.set_active(Some(c1.clone())).await;
        h.sync.set_active(Some(c2.clone())).await;
        tokio::time::sleep(Duration::from_millis(700)).await;

        let snap = h.sync.snapshot().await.unwrap();
        assert_eq!(snap.active, Some(c2));
        assert_eq!(snap.messages.len(), 1);
        assert_eq!(snap.messages[0].text, "from c2");
    }

    #[tokio::test(start_paused = true)]
    async fn switch_away_leaves_previous_room() {
        let h = harness(vec![conv("c1", 1, 0), conv("c2", 2, 0)]).await;
        h.sync.set_active(Some(ConversationId::from("c1"))).await;
        h.sync.set_active(Some(ConversationId::from("c2"))).await;
        settle().await;

        let events = h.transport.sent_events();
        assert!(events.iter().any(|e| matches!(
            e,
            ClientEvent::LeaveConversation { conversation_id } if conversation_id.0 == "c1"
        )));
        assert_eq!(sent_join_count(&h, "c2"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn switch_to_none_clears_messages() {
        let h = harness(vec![conv("c1", 1, 0)]).await;
        let c1 = ConversationId::from("c1");
        h.api
            .set_messages(c1.clone(), vec![server_msg("a1", "c1", "bob", "hi", 0)]);

        h.sync.set_active(Some(c1)).await;
        settle().await;
        h.sync.set_active(None).await;
        settle().await;

        let snap = h.sync.snapshot().await.unwrap();
        assert_eq!(snap.active, None);
        assert!(snap.messages.is_empty());
        assert!(!snap.has_more);
    }

    #[tokio::test(start_paused = true)]
    async fn unread_policy() {
        let h = harness(vec![conv("c1", 1, 0), conv("c2", 2, 0)]).await;
        let c2 = ConversationId::from("c2");
        h.sync.set_active(Some(ConversationId::from("c1"))).await;
        settle().await;

        // Inbound to the inactive conversation increments.
        h.transport
            .queue_event(ServerEvent::NewMessage(server_msg(
                "s1", "c2", "bob", "one", 0,
            )));
        // The viewer's own message elsewhere never counts.
        h.transport
            .queue_event(ServerEvent::NewMessage(server_msg(
                "s2", "c2", "alice", "mine", 1,
            )));
        // Inbound to the active conversation is read instantly.
        h.transport
            .queue_event(ServerEvent::NewMessage(server_msg(
                "s3", "c1", "bob", "live", 2,
            )));
        settle().await;

        let snap = h.sync.snapshot().await.unwrap();
        let unread = |id: &str| {
            snap.conversations
                .iter()
                .find(|c| c.id.0 == id)
                .unwrap()
                .unread_count
        };
        assert_eq!(unread("c2"), 1);
        assert_eq!(unread("c1"), 0);

        // The active arrival produced an instant mark-read.
        assert!(h.transport.sent_events().iter().any(|e| matches!(
            e,
            ClientEvent::MarkRead { conversation_id, message_ids: Some(ids) }
                if conversation_id.0 == "c1" && ids == &vec![MessageId::from("s3")]
        )));

        // Explicit mark-read zeroes the counter.
        h.sync.mark_read(c2.clone()).await;
        settle().await;
        let snap = h.sync.snapshot().await.unwrap();
        assert_eq!(
            snap.conversations
                .iter()
                .find(|c| c.id == c2)
                .unwrap()
                .unread_count,
            0
        );
        assert_eq!(h.api.mark_read_calls(), vec![c2]);
    }

    #[tokio::test(start_paused = true)]
    async fn conversation_list_stays_sorted() {
        let h = harness(vec![conv("c1", 5, 0), conv("c2", 2, 0)]).await;
        settle().await;

        h.transport
            .queue_event(ServerEvent::NewMessage(server_msg(
                "s1", "c2", "bob", "bump", 30,
            )));
        settle().await;

        let snap = h.sync.snapshot().await.unwrap();
        let ids: Vec<_> = snap.conversations.iter().map(|c| c.id.0.clone()).collect();
        assert_eq!(ids, vec!["c2", "c1"]);
    }

    #[tokio::test(start_paused = true)]
    async fn switching_to_unread_conversation_marks_it_read() {
        let h = harness(vec![conv("c1", 1, 3)]).await;
        let c1 = ConversationId::from("c1");

        h.sync.set_active(Some(c1.clone())).await;
        settle().await;

        let snap = h.sync.snapshot().await.unwrap();
        assert_eq!(snap.conversations[0].unread_count, 0);
        assert!(h.transport.sent_events().iter().any(|e| matches!(
            e,
            ClientEvent::MarkRead { conversation_id, message_ids: None }
                if conversation_id == &c1
        )));
        assert_eq!(h.api.mark_read_calls(), vec![c1]);
    }

    #[tokio::test(start_paused = true)]
    async fn pagination_walks_backwards() {
        let h = harness(vec![conv("c1", 1, 0)]).await;
        let c1 = ConversationId::from("c1");
        let history: Vec<Message> = (0..120)
            .map(|i| {
                let mut m = server_msg(&format!("m{i}"), "c1", "bob", &format!("t{i}"), 0);
                m.created_at = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap()
                    + chrono::Duration::seconds(i);
                m
            })
            .collect();
        h.api.set_messages(c1.clone(), history);

        h.sync.set_active(Some(c1.clone())).await;
        settle().await;
        let snap = h.sync.snapshot().await.unwrap();
        assert_eq!(snap.messages.len(), 50);
        assert!(snap.has_more);
        assert_eq!(snap.messages[0].id, MessageId::from("m70"));
        assert_eq!(snap.messages[49].id, MessageId::from("m119"));

        h.sync.load_older().await;
        settle().await;
        let snap = h.sync.snapshot().await.unwrap();
        assert_eq!(snap.messages.len(), 100);
        assert!(snap.has_more);
        assert_eq!(snap.messages[0].id, MessageId::from("m20"));

        h.sync.load_older().await;
        settle().await;
        let snap = h.sync.snapshot().await.unwrap();
        assert_eq!(snap.messages.len(), 120);
        assert!(!snap.has_more);
        assert_eq!(snap.messages[0].id, MessageId::from("m0"));
    }

    #[tokio::test(start_paused = true)]
    async fn pending_send_suppresses_fetch_overwrite() {
        let h = harness(vec![conv("c1", 1, 0)]).await;
        let c1 = ConversationId::from("c1");
        h.api
            .set_messages(c1.clone(), vec![server_msg("a1", "c1", "bob", "old", 0)]);
        h.api.set_fetch_delay(c1.clone(), Duration::from_millis(200));

        h.sync.set_active(Some(c1)).await;
        h.sync.send_message("Hi").await;
        tokio::time::sleep(Duration::from_millis(400)).await;

        // The delayed initial fetch must not clobber the pending message.
        let snap = h.sync.snapshot().await.unwrap();
        assert_eq!(snap.messages.len(), 1);
        assert_eq!(snap.messages[0].text, "Hi");
        assert!(snap.messages[0].is_pending());
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_rejoins_active_room() {
        let h = harness(vec![conv("c1", 1, 0)]).await;
        h.sync.set_active(Some(ConversationId::from("c1"))).await;
        settle().await;
        assert_eq!(sent_join_count(&h, "c1"), 1);

        h.transport.drop_connection();
        settle().await;
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert!(h.signal.is_connected());
        assert_eq!(sent_join_count(&h, "c1"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_rolls_back_pending_sends() {
        let h = harness(vec![conv("c1", 1, 0)]).await;
        h.sync.set_active(Some(ConversationId::from("c1"))).await;
        settle().await;
        h.sync.send_message("doomed").await;
        settle().await;

        h.transport.drop_connection();
        settle().await;

        let snap = h.sync.snapshot().await.unwrap();
        assert!(snap.messages.is_empty());
        assert_eq!(snap.pending_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn interleaved_message_appends_without_reconciling() {
        let h = harness(vec![conv("c1", 1, 0)]).await;
        h.sync.set_active(Some(ConversationId::from("c1"))).await;
        settle().await;
        h.sync.send_message("Hello").await;
        settle().await;

        // A different text from another sender must not consume the echo
        // slot.
        h.transport
            .queue_event(ServerEvent::NewMessage(server_msg(
                "s9", "c1", "bob", "unrelated", 0,
            )));
        settle().await;

        let snap = h.sync.snapshot().await.unwrap();
        assert_eq!(snap.messages.len(), 2);
        assert_eq!(snap.pending_count, 1);
        assert!(snap.messages.iter().any(|m| m.text == "Hello" && m.is_pending()));
    }

    #[tokio::test(start_paused = true)]
    async fn send_before_session_established_is_refused() {
        let transport = MockTransport::new();
        let api = MockApi::new();
        api.set_conversations(vec![conv("c1", 1, 0)]);

        let signal = spawn_channel(Arc::new(transport.clone()), SignalConfig::default());
        let (sync, mut notifications) =
            spawn_engine(Arc::new(api.clone()), signal.clone(), SyncConfig::default());
        signal.connect(None).await;
        settle().await;

        // No `connected` event has arrived, so the viewer is unknown.
        sync.set_active(Some(ConversationId::from("c1"))).await;
        sync.send_message("too early").await;
        settle().await;

        let snap = sync.snapshot().await.unwrap();
        assert!(snap.messages.is_empty());
        assert_eq!(snap.pending_count, 0);

        let mut refused = false;
        while let Ok(n) = notifications.try_recv() {
            if matches!(n, SyncNotification::SyncError { .. }) {
                refused = true;
            }
        }
        assert!(refused);
        assert!(!transport
            .sent_events()
            .iter()
            .any(|e| matches!(e, ClientEvent::SendMessage { .. })));
    }
}
