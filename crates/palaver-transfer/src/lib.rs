// Peer-to-peer file transfer engine: negotiates a data channel per
// transfer through the signaling channel, then streams the file as
// 16 KiB chunks framed by metadata and completion control messages.

pub mod engine;
pub mod frames;
pub mod memory;
pub mod peer;
pub mod session;

pub use engine::{
    spawn_transfer, TransferConfig, TransferError, TransferHandle, TransferNotification,
};
pub use frames::{ControlMessage, Frame};
pub use memory::{MemoryConnector, MemoryHub};
pub use peer::{ChannelError, DataChannel, PeerConnection, PeerConnector};
pub use session::{TransferProgress, TransferState, TransferSummary};
