//! FIFO queue of filesystem operations deferred while the daemon has no
//! peers reachable, drained by a background task once connectivity returns.

use crate::error::CoreError;
use crate::types::{
    OperationKind, QueuedOperation, OFFLINE_QUEUE_MAX_RETRIES, OFFLINE_QUEUE_PROCESS_INTERVAL_MS,
    OFFLINE_QUEUE_RETRY_DELAY_MS,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Replays a single queued operation against the live sync engine. Returns
/// `Ok(true)` on success, `Ok(false)` for a retryable failure.
#[async_trait]
pub trait OperationProcessor: Send + Sync {
    async fn process(&self, op: &QueuedOperation) -> Result<bool, CoreError>;
}

pub struct OfflineQueue {
    queue: Mutex<VecDeque<QueuedOperation>>,
    online: AtomicBool,
    running: AtomicBool,
}

impl OfflineQueue {
    pub fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            online: AtomicBool::new(true),
            running: AtomicBool::new(false),
        }
    }

    pub fn enqueue(&self, kind: OperationKind, path: impl Into<String>) {
        let path = path.into();
        self.queue.lock().push_back(QueuedOperation::new(kind, path.clone()));
        debug!(path, "queued operation");
    }

    pub fn enqueue_rename(&self, old_path: impl Into<String>, new_path: impl Into<String>) {
        let old_path = old_path.into();
        let new_path = new_path.into();
        self.queue.lock().push_back(QueuedOperation::rename(old_path.clone(), new_path.clone()));
        debug!(old_path, new_path, "queued rename");
    }

    pub fn pending_count(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }

    pub fn clear(&self) {
        self.queue.lock().clear();
        info!("offline queue cleared");
    }

    pub fn get_pending_operations(&self) -> Vec<QueuedOperation> {
        self.queue.lock().iter().cloned().collect()
    }

    pub fn load_operations(&self, ops: Vec<QueuedOperation>) {
        let count = ops.len();
        self.queue.lock().extend(ops);
        info!(count, "loaded queued operations");
    }

    /// Flips online/offline state, logging the transition edge only.
    pub fn set_online(&self, online: bool) {
        let was_online = self.online.swap(online, Ordering::SeqCst);
        if !was_online && online {
            info!("back online, processing queued operations");
        } else if was_online && !online {
            info!("going offline, operations will be queued");
        }
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    fn pop_front(&self) -> Option<QueuedOperation> {
        self.queue.lock().pop_front()
    }

    fn requeue(&self, op: QueuedOperation) {
        self.queue.lock().push_back(op);
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Spawns the background processor loop: polls every
    /// `OFFLINE_QUEUE_PROCESS_INTERVAL_MS`, skipping while offline, retrying
    /// failed operations up to `OFFLINE_QUEUE_MAX_RETRIES` times with a
    /// fixed delay between attempts.
    pub fn spawn_processor(self: &Arc<Self>, processor: Arc<dyn OperationProcessor>) -> tokio::task::JoinHandle<()> {
        self.running.store(true, Ordering::SeqCst);
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            info!("offline queue processor started");
            while queue.running.load(Ordering::SeqCst) {
                tokio::time::sleep(Duration::from_millis(OFFLINE_QUEUE_PROCESS_INTERVAL_MS)).await;
                if !queue.running.load(Ordering::SeqCst) || !queue.is_online() {
                    continue;
                }

                let Some(mut op) = queue.pop_front() else { continue };

                match processor.process(&op).await {
                    Ok(true) => debug!(path = %op.path, "processed queued operation"),
                    Ok(false) | Err(_) => {
                        op.retry_count += 1;
                        if op.retry_count < OFFLINE_QUEUE_MAX_RETRIES {
                            warn!(path = %op.path, retry = op.retry_count, "retrying queued operation");
                            queue.requeue(op);
                        } else {
                            error!(path = %op.path, "max retries exceeded for queued operation");
                        }
                        tokio::time::sleep(Duration::from_millis(OFFLINE_QUEUE_RETRY_DELAY_MS)).await;
                    }
                }
            }
            info!("offline queue processor stopped");
        })
    }
}

impl Default for OfflineQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    struct AlwaysFail;
    #[async_trait]
    impl OperationProcessor for AlwaysFail {
        async fn process(&self, _op: &QueuedOperation) -> Result<bool, CoreError> {
            Ok(false)
        }
    }

    struct CountingSuccess {
        calls: AtomicU32,
    }
    #[async_trait]
    impl OperationProcessor for CountingSuccess {
        async fn process(&self, _op: &QueuedOperation) -> Result<bool, CoreError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(true)
        }
    }

    #[test]
    fn enqueue_and_pending_count() {
        let q = OfflineQueue::new();
        q.enqueue(OperationKind::Create, "a.txt");
        q.enqueue(OperationKind::Update, "b.txt");
        assert_eq!(q.pending_count(), 2);
    }

    #[test]
    fn set_online_transitions_logged_without_panicking() {
        let q = OfflineQueue::new();
        q.set_online(false);
        assert!(!q.is_online());
        q.set_online(true);
        assert!(q.is_online());
    }

    #[test]
    fn load_and_get_pending_operations_preserves_order() {
        let q = OfflineQueue::new();
        q.load_operations(vec![
            QueuedOperation::new(OperationKind::Create, "a"),
            QueuedOperation::new(OperationKind::Delete, "b"),
        ]);
        let ops = q.get_pending_operations();
        assert_eq!(ops[0].path, "a");
        assert_eq!(ops[1].path, "b");
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn offline_operations_replay_once_back_online() {
        let q = Arc::new(OfflineQueue::new());
        q.set_online(false);
        q.enqueue(OperationKind::Update, "queued.txt");

        let processor = Arc::new(CountingSuccess { calls: AtomicU32::new(0) });
        let handle = q.spawn_processor(processor.clone());

        tokio::time::advance(Duration::from_millis(OFFLINE_QUEUE_PROCESS_INTERVAL_MS * 2)).await;
        assert_eq!(processor.calls.load(Ordering::SeqCst), 0);

        q.set_online(true);
        tokio::time::advance(Duration::from_millis(OFFLINE_QUEUE_PROCESS_INTERVAL_MS * 2)).await;
        assert_eq!(processor.calls.load(Ordering::SeqCst), 1);

        q.stop();
        tokio::time::advance(Duration::from_millis(OFFLINE_QUEUE_PROCESS_INTERVAL_MS)).await;
        let _ = handle.await;
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn exhausted_retries_drop_the_operation() {
        let q = Arc::new(OfflineQueue::new());
        q.enqueue(OperationKind::Update, "broken.txt");
        let handle = q.spawn_processor(Arc::new(AlwaysFail));

        for _ in 0..OFFLINE_QUEUE_MAX_RETRIES + 1 {
            tokio::time::advance(Duration::from_millis(
                OFFLINE_QUEUE_PROCESS_INTERVAL_MS + OFFLINE_QUEUE_RETRY_DELAY_MS,
            ))
            .await;
        }
        assert!(q.is_empty());
        q.stop();
        tokio::time::advance(Duration::from_millis(OFFLINE_QUEUE_PROCESS_INTERVAL_MS)).await;
        let _ = handle.await;
    }
}
