//! Typed in-process pub/sub hub wiring collaborator event streams
//! (`NetEvent`, `WatchEvent`) to the sync engine and control surface.
//!
//! Publish takes a read snapshot of a topic's subscribers, releases the
//! lock, then invokes callbacks in descending-priority order — a slow or
//! re-entrant subscriber can never block `subscribe`/`publish` on another
//! topic, or even on this one.

use parking_lot::{Mutex, RwLock};
use std::any::Any;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

pub type EventPayload = Arc<dyn Any + Send + Sync>;
pub type EventCallback = Arc<dyn Fn(&EventPayload) + Send + Sync>;
pub type EventFilter = Arc<dyn Fn(&EventPayload) -> bool + Send + Sync>;

struct Subscription {
    callback: EventCallback,
    priority: i32,
    filter: Option<EventFilter>,
}

#[derive(Default)]
struct TopicMetrics {
    published: AtomicU64,
    filtered: AtomicU64,
    failed: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsSnapshot {
    pub published: u64,
    pub filtered: u64,
    pub failed: u64,
}

pub struct EventHub {
    subscribers: RwLock<HashMap<String, Vec<Subscription>>>,
    metrics: Mutex<HashMap<String, TopicMetrics>>,
}

impl EventHub {
    pub fn new() -> Self {
        Self {
            subscribers: RwLock::new(HashMap::new()),
            metrics: Mutex::new(HashMap::new()),
        }
    }

    /// Higher `priority` runs first; subscribers of equal priority run in
    /// subscription order.
    pub fn subscribe(
        &self,
        event_name: impl Into<String>,
        callback: EventCallback,
        priority: i32,
        filter: Option<EventFilter>,
    ) {
        let mut subs = self.subscribers.write();
        let topic = subs.entry(event_name.into()).or_default();
        topic.push(Subscription { callback, priority, filter });
        topic.sort_by(|a, b| b.priority.cmp(&a.priority));
    }

    pub fn publish(&self, event_name: &str, data: EventPayload) {
        let snapshot: Vec<EventCallback> = {
            let subs = self.subscribers.read();
            match subs.get(event_name) {
                None => Vec::new(),
                Some(topic) => {
                    let mut out = Vec::with_capacity(topic.len());
                    let mut filtered = 0u64;
                    for sub in topic {
                        match &sub.filter {
                            Some(f) if !f(&data) => filtered += 1,
                            _ => out.push(Arc::clone(&sub.callback)),
                        }
                    }
                    if filtered > 0 {
                        self.record(event_name, 0, filtered, 0);
                    }
                    out
                }
            }
        };

        let mut failed = 0u64;
        for callback in &snapshot {
            if catch_unwind(AssertUnwindSafe(|| callback(&data))).is_err() {
                failed += 1;
            }
        }
        self.record(event_name, 1, 0, failed);
    }

    /// Publishes events in order; each event is fully dispatched (including
    /// all of its subscribers) before the next one begins.
    pub fn publish_batch(&self, events: Vec<(String, EventPayload)>) {
        for (event_name, data) in events {
            self.publish(&event_name, data);
        }
    }

    fn record(&self, event_name: &str, published: u64, filtered: u64, failed: u64) {
        let mut metrics = self.metrics.lock();
        let entry = metrics.entry(event_name.to_string()).or_default();
        entry.published.fetch_add(published, Ordering::Relaxed);
        entry.filtered.fetch_add(filtered, Ordering::Relaxed);
        entry.failed.fetch_add(failed, Ordering::Relaxed);
    }

    pub fn metrics_snapshot(&self, event_name: &str) -> Option<MetricsSnapshot> {
        let metrics = self.metrics.lock();
        metrics.get(event_name).map(|m| MetricsSnapshot {
            published: m.published.load(Ordering::Relaxed),
            filtered: m.filtered.load(Ordering::Relaxed),
            failed: m.failed.load(Ordering::Relaxed),
        })
    }
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new()
    }
}
