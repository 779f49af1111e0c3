//! Collaborator contracts and the daemon-level wiring that connects them to
//! the core through the event hub.
//!
//! The core never depends on a concrete network stack, storage engine,
//! watcher, or filesystem layer — only on these four interfaces. Startup
//! chooses concrete implementations; there is no runtime plugin loader.

use crate::error::CoreError;
use crate::types::{FileMetadata, PeerRecord};
use async_trait::async_trait;
use std::path::Path;

#[async_trait]
pub trait NetworkApi: Send + Sync {
    async fn connect(&self, peer_id: &str) -> Result<(), CoreError>;
    async fn send(&self, peer_id: &str, bytes: Vec<u8>) -> Result<(), CoreError>;
    async fn broadcast(&self, bytes: Vec<u8>) -> Result<(), CoreError>;
    async fn start_listening(&self, port: u16) -> Result<(), CoreError>;
    async fn start_discovery(&self, port: u16) -> Result<(), CoreError>;
    async fn close(&self, peer_id: &str) -> Result<(), CoreError>;
}

#[async_trait]
pub trait StorageApi: Send + Sync {
    async fn upsert_peer(&self, peer: PeerRecord) -> Result<(), CoreError>;
    async fn get_peer(&self, peer_id: &str) -> Result<Option<PeerRecord>, CoreError>;
    async fn list_peers(&self) -> Result<Vec<PeerRecord>, CoreError>;
    async fn upsert_file(&self, metadata: FileMetadata) -> Result<(), CoreError>;
    async fn get_file(&self, path: &str) -> Result<Option<FileMetadata>, CoreError>;
    async fn batch_upsert_files(&self, metadata: Vec<FileMetadata>) -> Result<(), CoreError>;
    async fn ignore_patterns(&self) -> Result<Vec<String>, CoreError>;
    async fn watched_folders(&self) -> Result<Vec<String>, CoreError>;
    async fn begin(&self) -> Result<(), CoreError>;
    async fn commit(&self) -> Result<(), CoreError>;
    async fn rollback(&self) -> Result<(), CoreError>;
}

pub trait FileWatcher: Send + Sync {
    fn start_watching(&self, path: &Path) -> Result<(), CoreError>;
    fn stop_watching(&self, path: &Path) -> Result<(), CoreError>;
}

#[async_trait]
pub trait FileApi: Send + Sync {
    async fn read(&self, path: &Path) -> Result<Vec<u8>, CoreError>;
    async fn write(&self, path: &Path, bytes: &[u8]) -> Result<bool, CoreError>;
}

/// Events a `NetworkApi` implementation emits back into the engine over a
/// channel it owns, breaking the engine/network dependency cycle (the
/// engine holds only a send-only handle).
#[derive(Debug, Clone)]
pub enum NetEvent {
    PeerDiscovered { peer_id: String, address: String, port: u16 },
    PeerConnected { peer_id: String },
    PeerDisconnected { peer_id: String },
    DataReceived { peer_id: String, bytes: Vec<u8> },
}

/// Events the file watcher collaborator emits.
#[derive(Debug, Clone)]
pub enum WatchEvent {
    Created(String),
    Modified(String),
    Deleted(String),
    Renamed { from: String, to: String },
}
