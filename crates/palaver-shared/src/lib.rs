// Shared data model, wire protocol and tunable constants for palaver.

pub mod constants;
pub mod error;
pub mod model;
pub mod protocol;
pub mod types;

pub use error::ProtocolError;
pub use model::{Conversation, DeliveryState, FileInfo, Message};
pub use protocol::{ClientEvent, ServerEvent, SignalKind, SignalMessage};
pub use types::{
    ConversationId, ConversationKind, MessageId, TransferDirection, TransferId, UserId,
};
