//! Typed wire protocol for the signaling channel.
//!
//! Every named event the channel carries is a variant of [`ClientEvent`]
//! (outbound) or [`ServerEvent`] (inbound), serialized as
//! `{"event": "<kebab-case name>", "data": {...}}` so match statements stay
//! exhaustive instead of dispatching on raw string names.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;
use crate::model::{FileInfo, Message};
use crate::types::{ConversationId, MessageId, TransferId, UserId};

/// Events emitted by the client.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ClientEvent {
    #[serde(rename_all = "camelCase")]
    JoinConversation { conversation_id: ConversationId },

    #[serde(rename_all = "camelCase")]
    LeaveConversation { conversation_id: ConversationId },

    #[serde(rename_all = "camelCase")]
    SendMessage {
        conversation_id: ConversationId,
        text: String,
        /// Temporary id of the optimistic message, carried so the server
        /// can echo it back for exact reconciliation.
        #[serde(skip_serializing_if = "Option::is_none")]
        local_id: Option<MessageId>,
    },

    #[serde(rename_all = "camelCase")]
    MarkRead {
        conversation_id: ConversationId,
        #[serde(skip_serializing_if = "Option::is_none")]
        message_ids: Option<Vec<MessageId>>,
    },

    #[serde(rename_all = "camelCase")]
    Typing {
        conversation_id: ConversationId,
        is_typing: bool,
    },

    WebrtcOffer(SignalMessage),
    WebrtcAnswer(SignalMessage),
    WebrtcIceCandidate(SignalMessage),
    WebrtcRejected(SignalMessage),

    #[serde(rename_all = "camelCase")]
    FileRequest {
        target_user_id: UserId,
        transfer_id: TransferId,
        file_info: FileInfo,
    },
}

/// Events delivered by the server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ServerEvent {
    #[serde(rename_all = "camelCase")]
    Connected {
        user_id: UserId,
        server_time: DateTime<Utc>,
    },

    NewMessage(Message),

    #[serde(rename_all = "camelCase")]
    ConversationUpdated {
        conversation_id: ConversationId,
        last_message: Message,
    },

    #[serde(rename_all = "camelCase")]
    MessageRead {
        conversation_id: ConversationId,
        read_by: UserId,
        #[serde(skip_serializing_if = "Option::is_none")]
        message_ids: Option<Vec<MessageId>>,
    },

    #[serde(rename_all = "camelCase")]
    Typing {
        conversation_id: ConversationId,
        user_id: UserId,
        is_typing: bool,
    },

    Error {
        message: String,
    },

    WebrtcOffer(SignalMessage),
    WebrtcAnswer(SignalMessage),
    WebrtcIceCandidate(SignalMessage),
    WebrtcRejected(SignalMessage),

    #[serde(rename_all = "camelCase")]
    FileRequest {
        from_user_id: UserId,
        transfer_id: TransferId,
        file_info: FileInfo,
    },
}

/// One WebRTC negotiation message, addressed peer-to-peer through the
/// signaling channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SignalMessage {
    pub from: UserId,
    pub target: UserId,
    #[serde(flatten)]
    pub kind: SignalKind,
}

/// Negotiation payload variants.
///
/// Only the offer carries the transfer id: it creates the receiving
/// session. Answers, candidates and rejections are routed by peer id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum SignalKind {
    #[serde(rename_all = "camelCase")]
    Offer {
        transfer_id: TransferId,
        sdp: String,
        file_info: FileInfo,
    },
    Answer {
        sdp: String,
    },
    IceCandidate {
        candidate: String,
    },
    Reject {
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
}

impl SignalMessage {
    /// Wrap this signal in the outbound event matching its kind, keeping
    /// the event name and the payload consistent in one place.
    pub fn into_client_event(self) -> ClientEvent {
        match self.kind {
            SignalKind::Offer { .. } => ClientEvent::WebrtcOffer(self),
            SignalKind::Answer { .. } => ClientEvent::WebrtcAnswer(self),
            SignalKind::IceCandidate { .. } => ClientEvent::WebrtcIceCandidate(self),
            SignalKind::Reject { .. } => ClientEvent::WebrtcRejected(self),
        }
    }
}

impl ClientEvent {
    pub fn to_json(&self) -> Result<Vec<u8>, ProtocolError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_json(data: &[u8]) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_slice(data)?)
    }
}

impl ServerEvent {
    pub fn to_json(&self) -> Result<Vec<u8>, ProtocolError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_json(data: &[u8]) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_slice(data)?)
    }
}
