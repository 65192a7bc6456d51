//! Per-transfer bookkeeping.

use palaver_shared::model::FileInfo;
use palaver_shared::types::{TransferDirection, TransferId, UserId};

/// Lifecycle of one transfer.
///
/// `Pending` covers an inbound offer awaiting accept/reject and an
/// outbound offer awaiting the answer. Terminal states are never left.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    Pending,
    Connecting,
    Transferring,
    Completed,
    Failed,
    Rejected,
}

impl TransferState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransferState::Completed | TransferState::Failed | TransferState::Rejected
        )
    }
}

/// Progress of an active transfer, reported per chunk.
#[derive(Debug, Clone, PartialEq)]
pub struct TransferProgress {
    pub transfer_id: TransferId,
    pub peer: UserId,
    pub direction: TransferDirection,
    pub bytes_transferred: u64,
    pub total_bytes: u64,
}

impl TransferProgress {
    pub fn percent(&self) -> u8 {
        if self.total_bytes == 0 {
            return 100;
        }
        ((self.bytes_transferred * 100) / self.total_bytes).min(100) as u8
    }
}

/// Snapshot row describing one tracked transfer.
#[derive(Debug, Clone)]
pub struct TransferSummary {
    pub transfer_id: TransferId,
    pub peer: UserId,
    pub direction: TransferDirection,
    pub state: TransferState,
    pub file_info: FileInfo,
}
