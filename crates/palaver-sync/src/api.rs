//! REST collaborator boundary.
//!
//! The engine never talks HTTP directly; the embedding application
//! supplies a [`ConversationApi`]. Pages are returned newest-first, the
//! way a `ORDER BY created_at DESC LIMIT n` endpoint serves them.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use palaver_shared::model::{Conversation, Message};
use palaver_shared::types::{ConversationId, UserId};

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("request failed: {0}")]
    Request(String),

    #[error("not found")]
    NotFound,
}

#[async_trait]
pub trait ConversationApi: Send + Sync {
    /// Fetch the viewer's conversation list.
    async fn fetch_conversations(&self) -> Result<Vec<Conversation>, ApiError>;

    /// Fetch up to `limit` messages, newest first, strictly older than
    /// `before` when set.
    async fn fetch_messages(
        &self,
        conversation: &ConversationId,
        limit: u32,
        before: Option<DateTime<Utc>>,
    ) -> Result<Vec<Message>, ApiError>;

    /// Create (or return the existing) direct conversation with `peer`.
    async fn start_conversation(&self, peer: &UserId) -> Result<Conversation, ApiError>;

    /// REST fallback for marking a conversation read.
    async fn mark_read(&self, conversation: &ConversationId) -> Result<(), ApiError>;
}

#[derive(Default)]
struct MockApiState {
    conversations: Vec<Conversation>,
    /// Stored oldest-first per conversation.
    messages: HashMap<ConversationId, Vec<Message>>,
    mark_read_calls: Vec<ConversationId>,
    fetch_counts: HashMap<ConversationId, u32>,
    fetch_delays: HashMap<ConversationId, Duration>,
    fail_mark_read: bool,
}

/// In-memory [`ConversationApi`] for tests; clones share state.
#[derive(Clone, Default)]
pub struct MockApi {
    state: Arc<Mutex<MockApiState>>,
}

impl MockApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_conversations(&self, conversations: Vec<Conversation>) {
        self.state.lock().unwrap().conversations = conversations;
    }

    /// Seed a conversation's history, oldest first.
    pub fn set_messages(&self, conversation: ConversationId, messages: Vec<Message>) {
        self.state.lock().unwrap().messages.insert(conversation, messages);
    }

    /// Delay message fetches for one conversation, for interleaving tests.
    pub fn set_fetch_delay(&self, conversation: ConversationId, delay: Duration) {
        self.state.lock().unwrap().fetch_delays.insert(conversation, delay);
    }

    pub fn fail_mark_read(&self, fail: bool) {
        self.state.lock().unwrap().fail_mark_read = fail;
    }

    pub fn fetch_count(&self, conversation: &ConversationId) -> u32 {
        self.state
            .lock()
            .unwrap()
            .fetch_counts
            .get(conversation)
            .copied()
            .unwrap_or(0)
    }

    pub fn mark_read_calls(&self) -> Vec<ConversationId> {
        self.state.lock().unwrap().mark_read_calls.clone()
    }
}

#[async_trait]
impl ConversationApi for MockApi {
    async fn fetch_conversations(&self) -> Result<Vec<Conversation>, ApiError> {
        Ok(self.state.lock().unwrap().conversations.clone())
    }

    async fn fetch_messages(
        &self,
        conversation: &ConversationId,
        limit: u32,
        before: Option<DateTime<Utc>>,
    ) -> Result<Vec<Message>, ApiError> {
        let delay = {
            let mut state = self.state.lock().unwrap();
            *state.fetch_counts.entry(conversation.clone()).or_insert(0) += 1;
            state.fetch_delays.get(conversation).copied()
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let state = self.state.lock().unwrap();
        let history = state.messages.get(conversation).cloned().unwrap_or_default();
        let mut page: Vec<Message> = history
            .into_iter()
            .filter(|m| before.map(|b| m.created_at < b).unwrap_or(true))
            .collect();
        page.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        page.truncate(limit as usize);
        Ok(page)
    }

    async fn start_conversation(&self, peer: &UserId) -> Result<Conversation, ApiError> {
        let state = self.state.lock().unwrap();
        state
            .conversations
            .iter()
            .find(|c| c.participants.contains(peer))
            .cloned()
            .ok_or(ApiError::NotFound)
    }

    async fn mark_read(&self, conversation: &ConversationId) -> Result<(), ApiError> {
        let mut state = self.state.lock().unwrap();
        if state.fail_mark_read {
            return Err(ApiError::Request("mark-read unavailable".into()));
        }
        state.mark_read_calls.push(conversation.clone());
        Ok(())
    }
}
