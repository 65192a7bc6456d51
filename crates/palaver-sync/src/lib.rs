// Conversation/message sync engine: the client-side source of truth for
// the conversation list and the active conversation's messages, reconciling
// optimistic sends with authoritative server events.

pub mod api;
pub mod conversation;
pub mod engine;
pub mod pending;

pub use api::{ApiError, ConversationApi, MockApi};
pub use engine::{spawn_engine, SyncConfig, SyncError, SyncHandle, SyncNotification, SyncSnapshot};
