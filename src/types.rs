//! Data model shared across the engine, health monitor and session manager.

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

pub const HASH_CACHE_MAX_ENTRIES: usize = 1000;
pub const HASH_CACHE_TTL_SECS: u64 = 300;
pub const IGNORE_LIST_TTL_SECS: u64 = 5;
pub const CHUNK_TIMEOUT_SECONDS: u64 = 300;
pub const CHUNK_CLEANUP_INTERVAL_SECONDS: u64 = 60;
pub const DEFAULT_CHUNK_SIZE: usize = 4096;
pub const MAX_CHUNK_BYTES: usize = 64 * 1024;
pub const OFFLINE_QUEUE_PROCESS_INTERVAL_MS: u64 = 1000;
pub const OFFLINE_QUEUE_MAX_RETRIES: u32 = 5;
pub const OFFLINE_QUEUE_RETRY_DELAY_MS: u64 = 5000;
pub const REPLAY_WINDOW: u64 = 100;
pub const MAX_PAYLOAD_SIZE: u32 = 100 * 1024 * 1024;
pub const MAX_TOTAL_CHUNKS: u32 = 10_000;

pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

pub fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerStatus {
    Active,
    Inactive,
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerRecord {
    pub peer_id: String,
    pub address: String,
    pub port: u16,
    pub last_seen: u64,
    pub status: PeerStatus,
    pub authenticated: bool,
    pub latency_ms: f64,
}

impl PeerRecord {
    pub fn new(peer_id: impl Into<String>, address: impl Into<String>, port: u16) -> Self {
        Self {
            peer_id: peer_id.into(),
            address: address.into(),
            port,
            last_seen: now_millis(),
            status: PeerStatus::Unknown,
            authenticated: false,
            latency_ms: 0.0,
        }
    }

    pub fn touch(&mut self) {
        self.last_seen = now_millis();
        self.status = PeerStatus::Active;
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileMetadata {
    pub path: String,
    pub hash: String,
    pub size: u64,
    pub mtime: u64,
    pub vector_clock: crate::sync::vclock::VectorClock,
    pub tombstoned: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationKind {
    Create,
    Update,
    Delete,
    Rename,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedOperation {
    pub kind: OperationKind,
    pub path: String,
    pub target_path: Option<String>,
    pub enqueued_at: u64,
    pub retry_count: u32,
}

impl QueuedOperation {
    pub fn new(kind: OperationKind, path: impl Into<String>) -> Self {
        Self {
            kind,
            path: path.into(),
            target_path: None,
            enqueued_at: now_millis(),
            retry_count: 0,
        }
    }

    pub fn rename(old_path: impl Into<String>, new_path: impl Into<String>) -> Self {
        Self {
            kind: OperationKind::Rename,
            path: old_path.into(),
            target_path: Some(new_path.into()),
            enqueued_at: now_millis(),
            retry_count: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct PeerHealthMetrics {
    pub last_rtt: f64,
    pub avg_rtt: f64,
    pub ewma_rtt: f64,
    pub jitter_ms: f64,
    pub total_probes: u64,
    pub success_probes: u64,
    pub packet_loss_pct: f64,
    pub last_updated: u64,
}
