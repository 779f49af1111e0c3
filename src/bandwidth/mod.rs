//! Token-bucket bandwidth limiter with optional LEDBAT-style congestion
//! control, composed globally and per-peer.

use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

const MAX_SLEEP_MICROS: u64 = 100_000;
const RTT_WINDOW: usize = 20;
const DECREASE_FACTOR: f64 = 0.5;
const MAX_RATE_INCREASE: f64 = 1.5;
const MIN_RATE_BYTES_PER_SEC: f64 = 1024.0;
const DEFAULT_TARGET_DELAY_MS: f64 = 100.0;

#[derive(Debug, Clone, Copy, Default)]
pub struct BandwidthStats {
    pub total_bytes_transferred: u64,
    pub total_wait_time_ms: u64,
}

struct Inner {
    rate_bytes_per_sec: f64,
    burst_capacity: f64,
    tokens: f64,
    last_update: Instant,
    stats: BandwidthStats,
}

pub struct TokenBucket {
    inner: Mutex<Inner>,
}

impl TokenBucket {
    pub fn new(rate_bytes_per_sec: f64) -> Self {
        Self::with_burst(rate_bytes_per_sec, rate_bytes_per_sec * 2.0)
    }

    pub fn with_burst(rate_bytes_per_sec: f64, burst_capacity: f64) -> Self {
        let (burst, tokens) = if rate_bytes_per_sec <= 0.0 {
            (0.0, 0.0)
        } else {
            (burst_capacity, burst_capacity)
        };
        Self {
            inner: Mutex::new(Inner {
                rate_bytes_per_sec,
                burst_capacity: burst,
                tokens,
                last_update: Instant::now(),
                stats: BandwidthStats::default(),
            }),
        }
    }

    pub fn is_unlimited(&self) -> bool {
        self.inner.lock().rate_bytes_per_sec <= 0.0
    }

    fn refill(inner: &mut Inner) {
        let now = Instant::now();
        let elapsed_micros = now.duration_since(inner.last_update).as_micros() as f64;
        inner.tokens = (inner.tokens + inner.rate_bytes_per_sec * elapsed_micros / 1e6).min(inner.burst_capacity);
        inner.last_update = now;
    }

    /// Non-blocking: returns the number of bytes actually admitted, up to
    /// `n`.
    pub fn try_transfer(&self, n: u64) -> u64 {
        let mut inner = self.inner.lock();
        if inner.rate_bytes_per_sec <= 0.0 {
            return n;
        }
        Self::refill(&mut inner);
        let admitted = (n as f64).min(inner.tokens.floor()) as u64;
        inner.tokens -= admitted as f64;
        inner.stats.total_bytes_transferred += admitted;
        admitted
    }

    /// Blocking: waits until `n` bytes of budget are available, then
    /// deducts them. Never blocks on an unlimited bucket.
    pub async fn request_transfer(&self, n: u64) {
        loop {
            let sleep_for = {
                let mut inner = self.inner.lock();
                if inner.rate_bytes_per_sec <= 0.0 {
                    inner.stats.total_bytes_transferred += n;
                    return;
                }
                Self::refill(&mut inner);
                if inner.tokens >= n as f64 {
                    inner.tokens -= n as f64;
                    inner.stats.total_bytes_transferred += n;
                    return;
                }
                let deficit = n as f64 - inner.tokens;
                let micros = (deficit / inner.rate_bytes_per_sec * 1e6) as u64;
                micros.min(MAX_SLEEP_MICROS).max(1)
            };
            {
                let mut inner = self.inner.lock();
                inner.stats.total_wait_time_ms += sleep_for / 1000;
            }
            tokio::time::sleep(Duration::from_micros(sleep_for)).await;
        }
    }

    pub fn set_rate_limit(&self, rate_bytes_per_sec: f64) {
        let mut inner = self.inner.lock();
        inner.rate_bytes_per_sec = rate_bytes_per_sec.max(0.0);
        if rate_bytes_per_sec <= 0.0 {
            inner.burst_capacity = 0.0;
            inner.tokens = 0.0;
        } else if inner.burst_capacity <= 0.0 {
            inner.burst_capacity = rate_bytes_per_sec * 2.0;
            inner.tokens = inner.burst_capacity;
        }
    }

    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.tokens = inner.burst_capacity;
        inner.last_update = Instant::now();
        inner.stats = BandwidthStats::default();
    }

    pub fn stats(&self) -> BandwidthStats {
        self.inner.lock().stats
    }
}

/// LEDBAT-style delay-based congestion control. Feeds a `TokenBucket`'s rate
/// from observed RTT samples and loss events.
pub struct CongestionController {
    bucket: TokenBucket,
    min_rtt: Mutex<Option<Duration>>,
    rtt_window: Mutex<VecDeque<Duration>>,
    target_delay: Duration,
    user_limit: f64,
}

impl CongestionController {
    pub fn new(user_limit_bytes_per_sec: f64) -> Self {
        Self {
            bucket: TokenBucket::new(user_limit_bytes_per_sec),
            min_rtt: Mutex::new(None),
            rtt_window: Mutex::new(VecDeque::with_capacity(RTT_WINDOW)),
            target_delay: Duration::from_millis(DEFAULT_TARGET_DELAY_MS as u64),
            user_limit: user_limit_bytes_per_sec,
        }
    }

    pub fn bucket(&self) -> &TokenBucket {
        &self.bucket
    }

    pub fn on_rtt_sample(&self, rtt: Duration) {
        let mut window = self.rtt_window.lock();
        if window.len() == RTT_WINDOW {
            window.pop_front();
        }
        window.push_back(rtt);

        let mut min_rtt = self.min_rtt.lock();
        *min_rtt = Some(match *min_rtt {
            Some(current) => current.min(*window.iter().min().unwrap()),
            None => rtt,
        });
    }

    /// Periodic rate-adjust tick based on the most recent RTT sample vs the
    /// rolling baseline.
    pub fn tick(&self, current_rtt: Duration) {
        let min_rtt = match *self.min_rtt.lock() {
            Some(r) => r,
            None => return,
        };
        let queue_delay = current_rtt.saturating_sub(min_rtt);
        let current_rate = self.bucket.inner.lock().rate_bytes_per_sec;
        let new_rate = if queue_delay > self.target_delay {
            current_rate * DECREASE_FACTOR
        } else {
            let headroom = 1.0 - (queue_delay.as_secs_f64() / self.target_delay.as_secs_f64()).clamp(0.0, 1.0);
            current_rate * (1.0 + headroom * (MAX_RATE_INCREASE - 1.0))
        };
        let clamped = new_rate.clamp(MIN_RATE_BYTES_PER_SEC, self.user_limit.max(MIN_RATE_BYTES_PER_SEC));
        self.bucket.set_rate_limit(clamped);
    }

    pub fn on_loss(&self) {
        let current_rate = self.bucket.inner.lock().rate_bytes_per_sec;
        self.bucket.set_rate_limit((current_rate * DECREASE_FACTOR).max(MIN_RATE_BYTES_PER_SEC));
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TransferPriority {
    Background,
    Low,
    Normal,
    High,
    Critical,
}

/// Orders outbound transfers by priority (highest first), FIFO within a
/// priority tier.
pub struct TransferQueue<T> {
    lanes: Mutex<HashMap<TransferPriority, VecDeque<T>>>,
}

impl<T> TransferQueue<T> {
    pub fn new() -> Self {
        Self { lanes: Mutex::new(HashMap::new()) }
    }

    pub fn push(&self, priority: TransferPriority, item: T) {
        self.lanes.lock().entry(priority).or_default().push_back(item);
    }

    pub fn pop(&self) -> Option<T> {
        let mut lanes = self.lanes.lock();
        for priority in [
            TransferPriority::Critical,
            TransferPriority::High,
            TransferPriority::Normal,
            TransferPriority::Low,
            TransferPriority::Background,
        ] {
            if let Some(queue) = lanes.get_mut(&priority) {
                if let Some(item) = queue.pop_front() {
                    return Some(item);
                }
            }
        }
        None
    }
}

impl<T> Default for TransferQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

pub struct BandwidthManager {
    global_upload: TokenBucket,
    global_download: TokenBucket,
    peer_upload: Mutex<HashMap<String, Arc<TokenBucket>>>,
    peer_download: Mutex<HashMap<String, Arc<TokenBucket>>>,
}

impl BandwidthManager {
    pub fn new(global_upload_bps: f64, global_download_bps: f64) -> Self {
        Self {
            global_upload: TokenBucket::new(global_upload_bps),
            global_download: TokenBucket::new(global_download_bps),
            peer_upload: Mutex::new(HashMap::new()),
            peer_download: Mutex::new(HashMap::new()),
        }
    }

    pub fn set_global_upload_limit(&self, rate_bytes_per_sec: f64) {
        self.global_upload.set_rate_limit(rate_bytes_per_sec);
    }

    pub fn set_global_download_limit(&self, rate_bytes_per_sec: f64) {
        self.global_download.set_rate_limit(rate_bytes_per_sec);
    }

    pub fn set_peer_upload_limit(&self, peer_id: &str, rate_bytes_per_sec: f64) {
        self.peer_upload
            .lock()
            .entry(peer_id.to_string())
            .or_insert_with(|| Arc::new(TokenBucket::new(rate_bytes_per_sec)))
            .set_rate_limit(rate_bytes_per_sec);
    }

    pub fn set_peer_download_limit(&self, peer_id: &str, rate_bytes_per_sec: f64) {
        self.peer_download
            .lock()
            .entry(peer_id.to_string())
            .or_insert_with(|| Arc::new(TokenBucket::new(rate_bytes_per_sec)))
            .set_rate_limit(rate_bytes_per_sec);
    }

    pub fn remove_peer(&self, peer_id: &str) {
        self.peer_upload.lock().remove(peer_id);
        self.peer_download.lock().remove(peer_id);
    }

    /// Must pass both the per-peer limiter (if present) and the global one.
    /// The per-peer bucket handle is cloned and the map lock released before
    /// awaiting, so one slow transfer never blocks lookups for other peers.
    pub async fn request_upload(&self, peer_id: &str, n: u64) {
        let peer_bucket = self.peer_upload.lock().get(peer_id).cloned();
        if let Some(bucket) = peer_bucket {
            bucket.request_transfer(n).await;
        }
        self.global_upload.request_transfer(n).await;
    }

    pub async fn request_download(&self, peer_id: &str, n: u64) {
        let peer_bucket = self.peer_download.lock().get(peer_id).cloned();
        if let Some(bucket) = peer_bucket {
            bucket.request_transfer(n).await;
        }
        self.global_download.request_transfer(n).await;
    }

    pub fn global_stats(&self) -> (BandwidthStats, BandwidthStats) {
        (self.global_upload.stats(), self.global_download.stats())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unlimited_bucket_never_blocks_try() {
        let bucket = TokenBucket::new(0.0);
        assert!(bucket.is_unlimited());
        assert_eq!(bucket.try_transfer(1_000_000), 1_000_000);
    }

    #[test]
    fn try_transfer_capped_by_available_tokens() {
        let bucket = TokenBucket::with_burst(1000.0, 500.0);
        let admitted = bucket.try_transfer(10_000);
        assert!(admitted <= 500);
    }

    #[tokio::test]
    async fn request_transfer_respects_budget_over_interval() {
        let bucket = TokenBucket::with_burst(1000.0, 1000.0);
        bucket.request_transfer(1000).await;
        let start = Instant::now();
        bucket.request_transfer(500).await;
        assert!(start.elapsed() >= Duration::from_millis(400));
    }

    #[test]
    fn transfer_queue_orders_by_priority_then_fifo() {
        let queue: TransferQueue<&str> = TransferQueue::new();
        queue.push(TransferPriority::Low, "low-1");
        queue.push(TransferPriority::Critical, "crit-1");
        queue.push(TransferPriority::Low, "low-2");
        queue.push(TransferPriority::Critical, "crit-2");
        assert_eq!(queue.pop(), Some("crit-1"));
        assert_eq!(queue.pop(), Some("crit-2"));
        assert_eq!(queue.pop(), Some("low-1"));
        assert_eq!(queue.pop(), Some("low-2"));
        assert_eq!(queue.pop(), None);
    }

    #[tokio::test]
    async fn manager_composes_peer_and_global_limits() {
        let manager = BandwidthManager::new(0.0, 0.0);
        manager.set_peer_upload_limit("peer-a", 0.0);
        manager.request_upload("peer-a", 1000).await;
        let (up, _) = manager.global_stats();
        assert_eq!(up.total_bytes_transferred, 1000);
    }
}
