//! The sync engine: local change pipeline, three-way delta protocol state
//! machine, and new-peer fan-out.

pub mod compression;
pub mod conflict;
pub mod delta;
pub mod hash_cache;
pub mod ignore;
pub mod path;
pub mod vclock;
pub mod wire;

use crate::crypto::{hex_encode, sha256};
use crate::error::{delta_gen_failed, file_not_found, sync_in_progress, CoreError};
use crate::offline_queue::OfflineQueue;
use crate::orchestrator::NetworkApi;
use crate::types::{now_millis, FileMetadata, OperationKind, CHUNK_TIMEOUT_SECONDS, DEFAULT_CHUNK_SIZE, MAX_CHUNK_BYTES};
use conflict::{detect as detect_conflict, resolve as resolve_conflict, FileConflict, ResolutionStrategy};
use delta::{apply_delta, chunk_payload, compute_delta, compute_signature, PendingAssembly, Signature};
use hash_cache::HashCache;
use ignore::IgnoreList;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use vclock::VectorClock;
use wire::SyncMessage;

const DEFAULT_IGNORE_PATTERNS: &[&str] = &[".git/", "~", ".swp", "node_modules/", "target/", ".DS_Store"];

fn matches_default_ignore(rel_path: &str) -> bool {
    DEFAULT_IGNORE_PATTERNS.iter().any(|p| rel_path.contains(p))
}

fn matches_user_patterns(rel_path: &str, patterns: &[String]) -> bool {
    patterns.iter().any(|p| {
        glob::Pattern::new(p).map(|pat| pat.matches(rel_path)).unwrap_or(false)
    })
}

/// A pending assembly keyed by the peer it came from and the path it's for,
/// plus whether its eventual apply must go through conflict resolution.
struct Assembly {
    pending: PendingAssembly,
    is_delta: bool,
    conflict: Option<FileConflict>,
    remote_vclock: Option<VectorClock>,
}

pub struct SyncEngineConfig {
    pub local_peer_id: String,
    pub watch_root: PathBuf,
    pub block_size: usize,
    pub max_chunk_bytes: usize,
    pub default_strategy: ResolutionStrategy,
}

impl Default for SyncEngineConfig {
    fn default() -> Self {
        Self {
            local_peer_id: "local".to_string(),
            watch_root: PathBuf::from("."),
            block_size: DEFAULT_CHUNK_SIZE,
            max_chunk_bytes: MAX_CHUNK_BYTES,
            default_strategy: ResolutionStrategy::NewestWins,
        }
    }
}

pub struct SyncEngine {
    config: SyncEngineConfig,
    network: Arc<dyn NetworkApi>,
    offline_queue: Arc<OfflineQueue>,
    metadata: Mutex<HashMap<String, FileMetadata>>,
    hash_cache: Mutex<HashCache>,
    ignore_list: Mutex<IgnoreList>,
    pending: Mutex<HashMap<(String, String), Assembly>>,
    user_ignore_patterns: Mutex<Vec<String>>,
    sync_enabled: AtomicBool,
    local_vclock: Mutex<VectorClock>,
}

impl SyncEngine {
    pub fn new(config: SyncEngineConfig, network: Arc<dyn NetworkApi>, offline_queue: Arc<OfflineQueue>) -> Self {
        Self {
            config,
            network,
            offline_queue,
            metadata: Mutex::new(HashMap::new()),
            hash_cache: Mutex::new(HashCache::new()),
            ignore_list: Mutex::new(IgnoreList::new()),
            pending: Mutex::new(HashMap::new()),
            user_ignore_patterns: Mutex::new(Vec::new()),
            sync_enabled: AtomicBool::new(true),
            local_vclock: Mutex::new(VectorClock::new()),
        }
    }

    pub fn set_user_ignore_patterns(&self, patterns: Vec<String>) {
        *self.user_ignore_patterns.lock() = patterns;
    }

    pub fn set_sync_enabled(&self, enabled: bool) {
        self.sync_enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn sync_enabled(&self) -> bool {
        self.sync_enabled.load(Ordering::SeqCst)
    }

    pub fn offline_queue(&self) -> &Arc<OfflineQueue> {
        &self.offline_queue
    }

    fn rel_path(&self, abs_path: &Path) -> Option<String> {
        abs_path.strip_prefix(&self.config.watch_root).ok().map(|p| p.to_string_lossy().into_owned())
    }

    /// Step 1 of §4.5.1: a raw filesystem event enters the engine.
    pub async fn on_local_modified(&self, abs_path: &Path) -> Result<(), CoreError> {
        if !path::is_path_within_directory(&self.config.watch_root, abs_path) {
            return Err(crate::error::internal("path escapes watch root"));
        }
        let rel_path = self
            .rel_path(abs_path)
            .ok_or_else(|| crate::error::internal("path not under watch root"))?;

        if matches_default_ignore(&rel_path) || matches_user_patterns(&rel_path, &self.user_ignore_patterns.lock()) {
            return Ok(());
        }

        if self.ignore_list.lock().should_suppress(&rel_path) {
            return Ok(());
        }

        let content = std::fs::read(abs_path)?;
        let fs_mtime = now_millis();
        let hash = {
            let cached = self.hash_cache.lock().get(&rel_path, fs_mtime);
            match cached {
                Some(h) => h,
                None => {
                    let h = hex_encode(&sha256(&content));
                    self.hash_cache.lock().insert(rel_path.clone(), h.clone(), fs_mtime);
                    h
                }
            }
        };

        let mut vc = self.local_vclock.lock();
        vc.increment(&self.config.local_peer_id);
        let vclock = vc.clone();
        drop(vc);

        let metadata = FileMetadata {
            path: rel_path.clone(),
            hash: hash.clone(),
            size: content.len() as u64,
            mtime: fs_mtime,
            vector_clock: vclock.clone(),
            tombstoned: false,
        };
        self.metadata.lock().insert(rel_path.clone(), metadata);

        if self.sync_enabled() {
            let msg = SyncMessage::UpdateAvailable {
                rel_path,
                hash,
                size: content.len() as u64,
                vclock: Some(vclock),
            };
            let bytes = msg.encode()?;
            self.network.broadcast(bytes).await?;
        } else {
            self.offline_queue.enqueue(OperationKind::Update, rel_path);
        }
        Ok(())
    }

    pub async fn on_local_deleted(&self, abs_path: &Path) -> Result<(), CoreError> {
        let rel_path = self
            .rel_path(abs_path)
            .ok_or_else(|| crate::error::internal("path not under watch root"))?;
        if let Some(meta) = self.metadata.lock().get_mut(&rel_path) {
            meta.tombstoned = true;
        }
        if self.sync_enabled() {
            let msg = SyncMessage::DeleteFile { rel_path, vclock: Some(self.local_vclock.lock().clone()) };
            self.network.broadcast(msg.encode()?).await?;
        } else {
            self.offline_queue.enqueue(OperationKind::Delete, rel_path);
        }
        Ok(())
    }

    /// Receiver side of `UPDATE_AVAILABLE`: decide whether to request a
    /// delta, a full file, or resolve a conflict.
    pub async fn handle_update_available(
        &self,
        peer_id: &str,
        rel_path: &str,
        remote_hash: &str,
        remote_vclock: Option<VectorClock>,
    ) -> Result<(), CoreError> {
        let local = self.metadata.lock().get(rel_path).cloned();

        match local {
            Some(meta) if meta.hash == remote_hash => Ok(()), // Idle: no-op
            Some(meta) => {
                let remote_vc = remote_vclock.clone().unwrap_or_default();
                if detect_conflict(&meta.hash, remote_hash, &meta.vector_clock, &remote_vc) {
                    let abs_path = self.config.watch_root.join(rel_path);
                    let local_meta = std::fs::metadata(&abs_path).ok();
                    let conflict = FileConflict {
                        path: abs_path,
                        local_timestamp: meta.mtime,
                        remote_timestamp: now_millis(),
                        local_size: local_meta.map(|m| m.len()).unwrap_or(meta.size),
                        remote_peer_id: peer_id.to_string(),
                        remote_size: 0,
                        strategy: self.config.default_strategy,
                    };
                    self.request_file(peer_id, rel_path, Some(conflict), remote_vclock).await
                } else {
                    let content = std::fs::read(self.config.watch_root.join(rel_path))?;
                    let signature = compute_signature(&content, self.config.block_size);
                    self.request_delta(peer_id, rel_path, signature, remote_vclock).await
                }
            }
            None => self.request_file(peer_id, rel_path, None, remote_vclock).await,
        }
    }

    async fn request_delta(
        &self,
        peer_id: &str,
        rel_path: &str,
        signature: Signature,
        remote_vclock: Option<VectorClock>,
    ) -> Result<(), CoreError> {
        self.begin_assembly(peer_id, rel_path, true, None, remote_vclock);
        let msg = SyncMessage::RequestDelta { rel_path: rel_path.to_string(), signature };
        self.network.send(peer_id, msg.encode()?).await
    }

    async fn request_file(
        &self,
        peer_id: &str,
        rel_path: &str,
        conflict: Option<FileConflict>,
        remote_vclock: Option<VectorClock>,
    ) -> Result<(), CoreError> {
        self.begin_assembly(peer_id, rel_path, false, conflict, remote_vclock);
        let msg = SyncMessage::RequestFile { rel_path: rel_path.to_string() };
        self.network.send(peer_id, msg.encode()?).await
    }

    fn begin_assembly(
        &self,
        peer_id: &str,
        rel_path: &str,
        is_delta: bool,
        conflict: Option<FileConflict>,
        remote_vclock: Option<VectorClock>,
    ) {
        let key = (peer_id.to_string(), rel_path.to_string());
        let mut pending = self.pending.lock();
        if pending.contains_key(&key) {
            return;
        }
        pending.insert(
            key,
            Assembly {
                pending: PendingAssembly::new(1),
                is_delta,
                conflict,
                remote_vclock,
            },
        );
    }

    /// Sender side: the remote peer asked us for a delta against its
    /// signature.
    pub async fn handle_request_delta(&self, peer_id: &str, rel_path: &str, signature: Signature) -> Result<(), CoreError> {
        let abs_path = self.config.watch_root.join(rel_path);
        let content = std::fs::read(&abs_path).map_err(|_| file_not_found(rel_path))?;
        let delta = compute_delta(&content, &signature);
        let serialized = postcard::to_allocvec(&delta).map_err(|e| delta_gen_failed(e.to_string()))?;
        self.send_chunked(peer_id, rel_path, serialized, true).await
    }

    pub async fn handle_request_file(&self, peer_id: &str, rel_path: &str) -> Result<(), CoreError> {
        let abs_path = self.config.watch_root.join(rel_path);
        let content = std::fs::read(&abs_path).map_err(|_| file_not_found(rel_path))?;
        self.send_chunked(peer_id, rel_path, content, false).await
    }

    async fn send_chunked(&self, peer_id: &str, rel_path: &str, payload: Vec<u8>, is_delta: bool) -> Result<(), CoreError> {
        let chunks = chunk_payload(&payload, self.config.max_chunk_bytes);
        let total_chunks = chunks.len() as u32;
        for (index, chunk) in chunks.into_iter().enumerate() {
            let msg = if is_delta {
                SyncMessage::DeltaData {
                    rel_path: rel_path.to_string(),
                    total_chunks,
                    chunk_index: index as u32,
                    delta_bytes: chunk,
                }
            } else {
                SyncMessage::FileData {
                    rel_path: rel_path.to_string(),
                    total_chunks,
                    chunk_index: index as u32,
                    bytes: chunk,
                }
            };
            self.network.send(peer_id, msg.encode()?).await?;
        }
        Ok(())
    }

    pub async fn handle_delta_chunk(
        &self,
        peer_id: &str,
        rel_path: &str,
        chunk_index: u32,
        total_chunks: u32,
        bytes: Vec<u8>,
    ) -> Result<(), CoreError> {
        self.accumulate(peer_id, rel_path, chunk_index, total_chunks, bytes).await
    }

    pub async fn handle_file_chunk(
        &self,
        peer_id: &str,
        rel_path: &str,
        chunk_index: u32,
        total_chunks: u32,
        bytes: Vec<u8>,
    ) -> Result<(), CoreError> {
        self.accumulate(peer_id, rel_path, chunk_index, total_chunks, bytes).await
    }

    async fn accumulate(
        &self,
        peer_id: &str,
        rel_path: &str,
        chunk_index: u32,
        total_chunks: u32,
        bytes: Vec<u8>,
    ) -> Result<(), CoreError> {
        let key = (peer_id.to_string(), rel_path.to_string());
        let complete_payload = {
            let mut pending = self.pending.lock();
            let assembly = pending
                .get_mut(&key)
                .ok_or_else(|| sync_in_progress(format!("no pending assembly for {rel_path}")))?;
            if assembly.pending.total_chunks == 1 && total_chunks != 1 {
                assembly.pending = PendingAssembly::new(total_chunks);
            }
            assembly.pending.add_chunk(chunk_index, bytes);
            assembly.pending.assemble()
        };

        if let Some(payload) = complete_payload {
            let (is_delta, conflict, remote_vclock) = {
                let mut pending = self.pending.lock();
                let assembly = pending.remove(&key).unwrap();
                (assembly.is_delta, assembly.conflict, assembly.remote_vclock)
            };
            self.apply_received(peer_id, rel_path, payload, is_delta, conflict, remote_vclock).await?;
        }
        Ok(())
    }

    async fn apply_received(
        &self,
        _peer_id: &str,
        rel_path: &str,
        payload: Vec<u8>,
        is_delta: bool,
        conflict: Option<FileConflict>,
        remote_vclock: Option<VectorClock>,
    ) -> Result<(), CoreError> {
        let abs_path = self.config.watch_root.join(rel_path);

        let reconstructed = if is_delta {
            let delta: delta::Delta = postcard::from_bytes(&payload).map_err(|e| delta_gen_failed(e.to_string()))?;
            let basis = std::fs::read(&abs_path).unwrap_or_default();
            apply_delta(&basis, &delta, self.config.block_size)
        } else {
            payload
        };

        if let Some(mut conflict) = conflict {
            conflict.remote_size = reconstructed.len() as u64;
            resolve_conflict(&conflict, &abs_path, &reconstructed)?;
        } else {
            conflict::write_file_atomic(&abs_path, &reconstructed)?;
        }

        self.ignore_list.lock().mark(rel_path);

        let mut vc = self.local_vclock.lock();
        if let Some(remote_vc) = &remote_vclock {
            *vc = vc.merge(remote_vc);
        }
        let merged_vc = vc.clone();
        drop(vc);

        let hash = hex_encode(&sha256(&reconstructed));
        self.metadata.lock().insert(
            rel_path.to_string(),
            FileMetadata {
                path: rel_path.to_string(),
                hash,
                size: reconstructed.len() as u64,
                mtime: now_millis(),
                vector_clock: merged_vc,
                tombstoned: false,
            },
        );
        self.hash_cache.lock().invalidate(rel_path);
        Ok(())
    }

    /// §4.5.4: after a settle delay and auth check, replay our full index to
    /// a newly connected, authenticated peer.
    pub async fn broadcast_all_files_to_peer(&self, peer_id: &str) -> Result<(), CoreError> {
        let entries: Vec<FileMetadata> = self.metadata.lock().values().filter(|m| !m.tombstoned).cloned().collect();
        for meta in entries {
            let msg = SyncMessage::UpdateAvailable {
                rel_path: meta.path,
                hash: meta.hash,
                size: meta.size,
                vclock: Some(meta.vector_clock),
            };
            self.network.send(peer_id, msg.encode()?).await?;
        }
        Ok(())
    }

    /// Periodic sweep, every `CHUNK_CLEANUP_INTERVAL_SECONDS`: drop
    /// assemblies idle longer than `CHUNK_TIMEOUT_SECONDS`.
    pub fn reap_stale_assemblies(&self) -> usize {
        let mut pending = self.pending.lock();
        let before = pending.len();
        pending.retain(|_, assembly| !assembly.pending.is_stale(CHUNK_TIMEOUT_SECONDS));
        before - pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CoreError as Err;
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;
    use tempfile::tempdir;

    fn new_engine(config: SyncEngineConfig, network: Arc<dyn NetworkApi>) -> SyncEngine {
        SyncEngine::new(config, network, Arc::new(OfflineQueue::new()))
    }

    struct RecordingNetwork {
        sent: StdMutex<Vec<(String, Vec<u8>)>>,
        broadcast: StdMutex<Vec<Vec<u8>>>,
    }

    impl RecordingNetwork {
        fn new() -> Self {
            Self { sent: StdMutex::new(Vec::new()), broadcast: StdMutex::new(Vec::new()) }
        }
    }

    #[async_trait]
    impl NetworkApi for RecordingNetwork {
        async fn connect(&self, _peer_id: &str) -> Result<(), Err> {
            Ok(())
        }
        async fn send(&self, peer_id: &str, bytes: Vec<u8>) -> Result<(), Err> {
            self.sent.lock().unwrap().push((peer_id.to_string(), bytes));
            Ok(())
        }
        async fn broadcast(&self, bytes: Vec<u8>) -> Result<(), Err> {
            self.broadcast.lock().unwrap().push(bytes);
            Ok(())
        }
        async fn start_listening(&self, _port: u16) -> Result<(), Err> {
            Ok(())
        }
        async fn start_discovery(&self, _port: u16) -> Result<(), Err> {
            Ok(())
        }
        async fn close(&self, _peer_id: &str) -> Result<(), Err> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn local_write_broadcasts_update_available() {
        let dir = tempdir().unwrap();
        let net = Arc::new(RecordingNetwork::new());
        let engine = new_engine(
            SyncEngineConfig { watch_root: dir.path().to_path_buf(), local_peer_id: "a".to_string(), ..Default::default() },
            net.clone(),
        );
        let file = dir.path().join("foo.txt");
        std::fs::write(&file, b"hello").unwrap();
        engine.on_local_modified(&file).await.unwrap();

        assert_eq!(net.broadcast.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn paused_sync_enqueues_instead_of_broadcasting() {
        let dir = tempdir().unwrap();
        let net = Arc::new(RecordingNetwork::new());
        let offline_queue = Arc::new(OfflineQueue::new());
        let engine = SyncEngine::new(
            SyncEngineConfig { watch_root: dir.path().to_path_buf(), local_peer_id: "a".to_string(), ..Default::default() },
            net.clone(),
            offline_queue.clone(),
        );
        engine.set_sync_enabled(false);

        let file = dir.path().join("foo.txt");
        std::fs::write(&file, b"hello").unwrap();
        engine.on_local_modified(&file).await.unwrap();
        std::fs::remove_file(&file).unwrap();
        engine.on_local_deleted(&file).await.unwrap();

        assert!(net.broadcast.lock().unwrap().is_empty());
        assert_eq!(offline_queue.pending_count(), 2);
        let ops = offline_queue.get_pending_operations();
        assert_eq!(ops[0].kind, OperationKind::Update);
        assert_eq!(ops[1].kind, OperationKind::Delete);
    }

    #[tokio::test]
    async fn single_peer_propagation_end_to_end() {
        let dir_a = tempdir().unwrap();
        let dir_b = tempdir().unwrap();
        let net_a = Arc::new(RecordingNetwork::new());
        let net_b = Arc::new(RecordingNetwork::new());

        let engine_a = new_engine(
            SyncEngineConfig { watch_root: dir_a.path().to_path_buf(), local_peer_id: "a".to_string(), ..Default::default() },
            net_a.clone(),
        );
        let engine_b = new_engine(
            SyncEngineConfig { watch_root: dir_b.path().to_path_buf(), local_peer_id: "b".to_string(), ..Default::default() },
            net_b.clone(),
        );

        std::fs::write(dir_a.path().join("foo.txt"), b"hello").unwrap();
        engine_a.on_local_modified(&dir_a.path().join("foo.txt")).await.unwrap();

        let update_bytes = net_a.broadcast.lock().unwrap()[0].clone();
        let update = SyncMessage::decode(&update_bytes).unwrap();
        if let SyncMessage::UpdateAvailable { rel_path, hash, vclock, .. } = update {
            engine_b.handle_update_available("a", &rel_path, &hash, vclock).await.unwrap();
        } else {
            panic!("expected UpdateAvailable");
        }

        let request_bytes = net_b.sent.lock().unwrap()[0].1.clone();
        let request = SyncMessage::decode(&request_bytes).unwrap();
        assert!(matches!(request, SyncMessage::RequestFile { .. }));

        engine_a.handle_request_file("b", "foo.txt").await.unwrap();
        let file_data = net_a.sent.lock().unwrap().last().unwrap().1.clone();
        if let SyncMessage::FileData { rel_path, total_chunks, chunk_index, bytes } = SyncMessage::decode(&file_data).unwrap() {
            engine_b.handle_file_chunk("a", &rel_path, chunk_index, total_chunks, bytes).await.unwrap();
        } else {
            panic!("expected FileData");
        }

        let written = std::fs::read(dir_b.path().join("foo.txt")).unwrap();
        assert_eq!(written, b"hello");
    }
}
