//! Sync wire messages: the logical payloads exchanged over an authenticated
//! frame, plus the binary delta header used for `DELTA_DATA`/`FILE_DATA`.

use crate::error::CoreError;
use crate::sync::vclock::VectorClock;
use crate::types::{MAX_PAYLOAD_SIZE, MAX_TOTAL_CHUNKS};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SyncMessage {
    UpdateAvailable {
        rel_path: String,
        hash: String,
        size: u64,
        vclock: Option<VectorClock>,
    },
    RequestDelta {
        rel_path: String,
        signature: crate::sync::delta::Signature,
    },
    DeltaData {
        rel_path: String,
        total_chunks: u32,
        chunk_index: u32,
        delta_bytes: Vec<u8>,
    },
    RequestFile {
        rel_path: String,
    },
    FileData {
        rel_path: String,
        total_chunks: u32,
        chunk_index: u32,
        bytes: Vec<u8>,
    },
    DeleteFile {
        rel_path: String,
        vclock: Option<VectorClock>,
    },
}

impl SyncMessage {
    pub fn type_tag(&self) -> u8 {
        match self {
            SyncMessage::UpdateAvailable { .. } => 1,
            SyncMessage::RequestDelta { .. } => 2,
            SyncMessage::DeltaData { .. } => 3,
            SyncMessage::RequestFile { .. } => 4,
            SyncMessage::FileData { .. } => 5,
            SyncMessage::DeleteFile { .. } => 6,
        }
    }

    pub fn rel_path(&self) -> &str {
        match self {
            SyncMessage::UpdateAvailable { rel_path, .. }
            | SyncMessage::RequestDelta { rel_path, .. }
            | SyncMessage::DeltaData { rel_path, .. }
            | SyncMessage::RequestFile { rel_path }
            | SyncMessage::FileData { rel_path, .. }
            | SyncMessage::DeleteFile { rel_path, .. } => rel_path,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, CoreError> {
        let mut out = vec![self.type_tag()];
        let body = postcard::to_allocvec(self).map_err(|e| crate::error::internal(e.to_string()))?;
        out.extend_from_slice(&body);
        Ok(out)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, CoreError> {
        if bytes.is_empty() {
            return Err(crate::error::internal("empty message"));
        }
        postcard::from_bytes(&bytes[1..]).map_err(|e| crate::error::internal(e.to_string()))
    }
}

/// The binary header layout for `DELTA_DATA`/`FILE_DATA` chunk framing:
/// `type:u8 | payload_size:u32 | chunk_index:u32 | total_chunks:u32`.
#[derive(Debug, Clone, Copy)]
pub struct ChunkHeader {
    pub type_tag: u8,
    pub payload_size: u32,
    pub chunk_index: u32,
    pub total_chunks: u32,
}

impl ChunkHeader {
    pub const ENCODED_LEN: usize = 1 + 4 + 4 + 4;

    pub fn encode(&self) -> [u8; Self::ENCODED_LEN] {
        let mut out = [0u8; Self::ENCODED_LEN];
        out[0] = self.type_tag;
        out[1..5].copy_from_slice(&self.payload_size.to_le_bytes());
        out[5..9].copy_from_slice(&self.chunk_index.to_le_bytes());
        out[9..13].copy_from_slice(&self.total_chunks.to_le_bytes());
        out
    }

    /// Parses and enforces the wire sanity bounds: `payload_size` within
    /// the global cap, `total_chunks` within the global cap, and
    /// `chunk_index < total_chunks`.
    pub fn decode(bytes: &[u8]) -> Result<Self, CoreError> {
        if bytes.len() < Self::ENCODED_LEN {
            return Err(crate::error::internal("chunk header too short"));
        }
        let type_tag = bytes[0];
        let payload_size = u32::from_le_bytes(bytes[1..5].try_into().unwrap());
        let chunk_index = u32::from_le_bytes(bytes[5..9].try_into().unwrap());
        let total_chunks = u32::from_le_bytes(bytes[9..13].try_into().unwrap());

        if payload_size > MAX_PAYLOAD_SIZE {
            return Err(crate::error::internal(format!("payload_size {payload_size} exceeds cap")));
        }
        if total_chunks > MAX_TOTAL_CHUNKS {
            return Err(crate::error::internal(format!("total_chunks {total_chunks} exceeds cap")));
        }
        if chunk_index >= total_chunks {
            return Err(crate::error::internal(format!(
                "chunk_index {chunk_index} out of range for total_chunks {total_chunks}"
            )));
        }

        Ok(Self { type_tag, payload_size, chunk_index, total_chunks })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_roundtrip() {
        let msg = SyncMessage::UpdateAvailable {
            rel_path: "foo.txt".to_string(),
            hash: "deadbeef".to_string(),
            size: 5,
            vclock: None,
        };
        let bytes = msg.encode().unwrap();
        let back = SyncMessage::decode(&bytes).unwrap();
        assert_eq!(back.rel_path(), "foo.txt");
    }

    #[test]
    fn chunk_header_roundtrip() {
        let header = ChunkHeader { type_tag: 3, payload_size: 1024, chunk_index: 1, total_chunks: 4 };
        let bytes = header.encode();
        let parsed = ChunkHeader::decode(&bytes).unwrap();
        assert_eq!(parsed.chunk_index, 1);
        assert_eq!(parsed.total_chunks, 4);
    }

    #[test]
    fn chunk_header_rejects_oversized_payload() {
        let header = ChunkHeader { type_tag: 3, payload_size: MAX_PAYLOAD_SIZE + 1, chunk_index: 0, total_chunks: 1 };
        assert!(ChunkHeader::decode(&header.encode()).is_err());
    }

    #[test]
    fn chunk_header_rejects_index_out_of_range() {
        let header = ChunkHeader { type_tag: 3, payload_size: 10, chunk_index: 4, total_chunks: 4 };
        assert!(ChunkHeader::decode(&header.encode()).is_err());
    }
}
