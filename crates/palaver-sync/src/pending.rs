//! Outbox of optimistic messages awaiting their authoritative echo.
//!
//! Each entry is one pending message with a rollback deadline. While any
//! entry exists for a conversation, the engine's reentrancy guard is
//! considered set for it and fetch results must not overwrite the message
//! list. Echo matching is by conversation and text against the oldest
//! pending entry; see DESIGN.md for why this heuristic is preserved.

use tokio::time::Instant;

use palaver_shared::types::{ConversationId, MessageId};

#[derive(Debug, Clone)]
pub struct PendingEntry {
    pub local_id: MessageId,
    pub conversation_id: ConversationId,
    pub text: String,
    pub deadline: Instant,
}

#[derive(Debug, Default)]
pub struct PendingOutbox {
    /// Insertion order, oldest first.
    entries: Vec<PendingEntry>,
}

impl PendingOutbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, local_id: MessageId, conversation_id: ConversationId, text: String, deadline: Instant) {
        self.entries.push(PendingEntry {
            local_id,
            conversation_id,
            text,
            deadline,
        });
    }

    /// Remove and return the oldest pending entry matching the echoed
    /// conversation and text, if any.
    pub fn take_match(&mut self, conversation: &ConversationId, text: &str) -> Option<PendingEntry> {
        let idx = self
            .entries
            .iter()
            .position(|e| &e.conversation_id == conversation && e.text == text)?;
        Some(self.entries.remove(idx))
    }

    /// Remove and return every entry whose deadline has passed.
    pub fn take_expired(&mut self, now: Instant) -> Vec<PendingEntry> {
        let (expired, kept) = std::mem::take(&mut self.entries)
            .into_iter()
            .partition(|e| e.deadline <= now);
        self.entries = kept;
        expired
    }

    /// Drain everything, e.g. when the transport drops before any echo
    /// can arrive.
    pub fn take_all(&mut self) -> Vec<PendingEntry> {
        std::mem::take(&mut self.entries)
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.entries.iter().map(|e| e.deadline).min()
    }

    /// The reentrancy guard: an optimistic update is outstanding for this
    /// conversation.
    pub fn guards(&self, conversation: &ConversationId) -> bool {
        self.entries.iter().any(|e| &e.conversation_id == conversation)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}
