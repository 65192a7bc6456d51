//! The merged notification stream delivered to embedders.

use bytes::Bytes;

use palaver_shared::model::{Conversation, FileInfo, Message};
use palaver_shared::types::{ConversationId, MessageId, TransferId, UserId};
use palaver_signal::ConnectionState;
use palaver_sync::SyncNotification;
use palaver_transfer::{TransferNotification, TransferProgress};

/// Everything a UI needs to react to, on one subscription.
#[derive(Debug, Clone)]
pub enum ClientNotification {
    ConnectionChanged(ConnectionState),

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

    PeerTyping {
        conversation_id: ConversationId,
        user_id: UserId,
        is_typing: bool,
    },
    MessagesRead {
        conversation_id: ConversationId,
        read_by: UserId,
        message_ids: Option<Vec<MessageId>>,
    },

    TransferIncoming {
        transfer_id: TransferId,
        from: UserId,
        file_info: FileInfo,
    },
    TransferProgress(TransferProgress),
    TransferCompleted {
        transfer_id: TransferId,
        peer: UserId,
        file_info: FileInfo,
        /// Populated for downloads, `None` for uploads.
        data: Option<Bytes>,
    },
    TransferRejected {
        transfer_id: TransferId,
        peer: UserId,
        reason: Option<String>,
    },
    TransferFailed {
        transfer_id: TransferId,
        peer: UserId,
        reason: String,
    },
}

impl From<SyncNotification> for ClientNotification {
    fn from(n: SyncNotification) -> Self {
        match n {
            SyncNotification::ConversationsChanged(list) => {
                ClientNotification::ConversationsChanged(list)
            }
            SyncNotification::MessagesChanged {
                conversation,
                messages,
                has_more,
            } => ClientNotification::MessagesChanged {
                conversation,
                messages,
                has_more,
            },
            SyncNotification::MessageRolledBack {
                conversation,
                local_id,
            } => ClientNotification::MessageRolledBack {
                conversation,
                local_id,
            },
            SyncNotification::SyncError { message } => ClientNotification::SyncError { message },
        }
    }
}

impl From<TransferNotification> for ClientNotification {
    fn from(n: TransferNotification) -> Self {
        match n {
            TransferNotification::Incoming {
                transfer_id,
                from,
                file_info,
            } => ClientNotification::TransferIncoming {
                transfer_id,
                from,
                file_info,
            },
            TransferNotification::Progress(progress) => {
                ClientNotification::TransferProgress(progress)
            }
            TransferNotification::Completed {
                transfer_id,
                peer,
                file_info,
                data,
            } => ClientNotification::TransferCompleted {
                transfer_id,
                peer,
                file_info,
                data,
            },
            TransferNotification::Rejected {
                transfer_id,
                peer,
                reason,
            } => ClientNotification::TransferRejected {
                transfer_id,
                peer,
                reason,
            },
            TransferNotification::Failed {
                transfer_id,
                peer,
                reason,
            } => ClientNotification::TransferFailed {
                transfer_id,
                peer,
                reason,
            },
        }
    }
}
