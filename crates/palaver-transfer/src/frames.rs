//! Data-channel framing.
//!
//! A transfer is one text `metadata` frame, `totalChunks` binary frames
//! of at most the configured chunk size, then one text `complete` frame.
//! Control frames are JSON tagged by a `type` field so a receiver can
//! distinguish them without sniffing payload bytes.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use palaver_shared::error::ProtocolError;
use palaver_shared::model::FileInfo;

/// One message on the data channel.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Text(String),
    Binary(Bytes),
}

impl Frame {
    /// Payload size in bytes, the unit of buffered-amount accounting.
    pub fn byte_len(&self) -> usize {
        match self {
            Frame::Text(s) => s.len(),
            Frame::Binary(b) => b.len(),
        }
    }
}

/// Control frames, sent as text alongside the binary chunk stream.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ControlMessage {
    #[serde(rename_all = "camelCase")]
    Metadata {
        name: String,
        size: u64,
        mime_type: String,
        total_chunks: u64,
    },
    Complete,
}

impl ControlMessage {
    pub fn metadata(info: &FileInfo, chunk_size: usize) -> Self {
        ControlMessage::Metadata {
            name: info.name.clone(),
            size: info.size,
            mime_type: info.mime_type.clone(),
            total_chunks: total_chunks(info.size, chunk_size),
        }
    }

    pub fn to_frame(&self) -> Result<Frame, ProtocolError> {
        Ok(Frame::Text(serde_json::to_string(self)?))
    }

    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(text)?)
    }
}

pub fn total_chunks(size: u64, chunk_size: usize) -> u64 {
    size.div_ceil(chunk_size as u64)
}
