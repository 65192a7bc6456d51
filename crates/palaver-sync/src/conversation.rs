//! Conversation-list projection.
//!
//! Invariant: the list is sorted by `updated_at` descending after every
//! mutation that touches a conversation's last message or timestamp.

use palaver_shared::model::{Conversation, Message};
use palaver_shared::types::{ConversationId, MessageId};

#[derive(Debug, Default)]
pub struct ConversationList {
    items: Vec<Conversation>,
}

impl ConversationList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn replace(&mut self, conversations: Vec<Conversation>) {
        self.items = conversations;
        self.sort();
    }

    pub fn upsert(&mut self, conversation: Conversation) {
        match self.items.iter_mut().find(|c| c.id == conversation.id) {
            Some(existing) => *existing = conversation,
            None => self.items.push(conversation),
        }
        self.sort();
    }

    /// Record `message` as the conversation's latest, bumping its sort key.
    /// Returns false when the conversation is unknown locally.
    pub fn apply_last_message(&mut self, message: &Message) -> bool {
        let Some(conv) = self.items.iter_mut().find(|c| c.id == message.conversation_id) else {
            return false;
        };
        conv.updated_at = message.created_at;
        conv.last_message = Some(message.clone());
        self.sort();
        true
    }

    /// Drop the preview left by a rolled-back optimistic message. Only
    /// clears when `last_message` still carries the rolled-back id; a
    /// newer preview stays untouched. Returns true when the preview
    /// changed.
    pub fn rollback_last_message(&mut self, id: &ConversationId, local_id: &MessageId) -> bool {
        let Some(conv) = self.items.iter_mut().find(|c| &c.id == id) else {
            return false;
        };
        if conv.last_message.as_ref().map(|m| &m.id) != Some(local_id) {
            return false;
        }
        conv.last_message = None;
        self.sort();
        true
    }

    pub fn bump_unread(&mut self, id: &ConversationId) {
        if let Some(conv) = self.items.iter_mut().find(|c| &c.id == id) {
            conv.unread_count += 1;
        }
    }

    /// Returns true when the counter actually changed.
    pub fn clear_unread(&mut self, id: &ConversationId) -> bool {
        match self.items.iter_mut().find(|c| &c.id == id) {
            Some(conv) if conv.unread_count > 0 => {
                conv.unread_count = 0;
                true
            }
            _ => false,
        }
    }

    pub fn unread(&self, id: &ConversationId) -> u32 {
        self.items
            .iter()
            .find(|c| &c.id == id)
            .map(|c| c.unread_count)
            .unwrap_or(0)
    }

    pub fn contains(&self, id: &ConversationId) -> bool {
        self.items.iter().any(|c| &c.id == id)
    }

    pub fn get(&self, id: &ConversationId) -> Option<&Conversation> {
        self.items.iter().find(|c| &c.id == id)
    }

    pub fn to_vec(&self) -> Vec<Conversation> {
        self.items.clone()
    }

    fn sort(&mut self) {
        self.items.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use palaver_shared::types::{ConversationKind, UserId};

    fn conv(id: &str, minute: u32) -> Conversation {
        Conversation {
            id: ConversationId::from(id),
            kind: ConversationKind::Direct,
            participants: vec![UserId::from("alice"), UserId::from("bob")],
            last_message: None,
            unread_count: 0,
            updated_at: Utc.with_ymd_and_hms(2026, 1, 1, 10, minute, 0).unwrap(),
        }
    }

    fn msg(conversation: &str, minute: u32) -> Message {
        Message {
            id: MessageId::from("srv-1"),
            conversation_id: ConversationId::from(conversation),
            sender_id: UserId::from("bob"),
            text: "hi".into(),
            created_at: Utc.with_ymd_and_hms(2026, 1, 1, 10, minute, 0).unwrap(),
            delivery: Default::default(),
        }
    }

    #[test]
    fn replace_sorts_by_updated_at_descending() {
        let mut list = ConversationList::new();
        list.replace(vec![conv("a", 1), conv("c", 3), conv("b", 2)]);
        let ids: Vec<_> = list.to_vec().into_iter().map(|c| c.id.0).collect();
        assert_eq!(ids, vec!["c", "b", "a"]);
    }

    #[test]
    fn last_message_bumps_conversation_to_top() {
        let mut list = ConversationList::new();
        list.replace(vec![conv("a", 1), conv("b", 2)]);

        assert!(list.apply_last_message(&msg("a", 9)));
        let top = &list.to_vec()[0];
        assert_eq!(top.id, ConversationId::from("a"));
        assert_eq!(top.last_message.as_ref().unwrap().text, "hi");
    }

    #[test]
    fn apply_last_message_unknown_conversation() {
        let mut list = ConversationList::new();
        assert!(!list.apply_last_message(&msg("ghost", 1)));
    }

    #[test]
    fn rollback_clears_matching_preview() {
        let mut list = ConversationList::new();
        list.replace(vec![conv("a", 1)]);
        let id = ConversationId::from("a");

        let mut pending = msg("a", 9);
        pending.id = MessageId::from("local-1");
        list.apply_last_message(&pending);

        assert!(list.rollback_last_message(&id, &MessageId::from("local-1")));
        assert!(list.get(&id).unwrap().last_message.is_none());
    }

    #[test]
    fn rollback_leaves_newer_preview_intact() {
        let mut list = ConversationList::new();
        list.replace(vec![conv("a", 1)]);
        let id = ConversationId::from("a");

        let mut pending = msg("a", 9);
        pending.id = MessageId::from("local-1");
        list.apply_last_message(&pending);
        list.apply_last_message(&msg("a", 10));

        assert!(!list.rollback_last_message(&id, &MessageId::from("local-1")));
        assert_eq!(
            list.get(&id).unwrap().last_message.as_ref().unwrap().id,
            MessageId::from("srv-1")
        );
        assert!(!list.rollback_last_message(&ConversationId::from("ghost"), &MessageId::from("local-1")));
    }

    #[test]
    fn unread_counter_never_goes_negative() {
        let mut list = ConversationList::new();
        list.replace(vec![conv("a", 1)]);
        let id = ConversationId::from("a");

        assert!(!list.clear_unread(&id));
        list.bump_unread(&id);
        list.bump_unread(&id);
        assert_eq!(list.unread(&id), 2);
        assert!(list.clear_unread(&id));
        assert_eq!(list.unread(&id), 0);
    }
}
