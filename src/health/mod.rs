//! Per-peer EWMA health metrics and score-based auto-remesh decisions.

use crate::types::{now_secs, PeerHealthMetrics};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};

pub const PEER_STALE_TIMEOUT_SECS: u64 = 120;
pub const MIN_SAMPLES_FOR_DECISION: u64 = 3;
pub const DEFAULT_JITTER_WEIGHT: f64 = 1.0;
pub const DEFAULT_LOSS_WEIGHT: f64 = 1.0;
const JITTER_ALPHA: f64 = 0.1;

#[derive(Debug, Clone, Default)]
struct PeerMetricsState {
    metrics: PeerHealthMetrics,
}

pub struct HealthMonitor {
    metrics: Mutex<HashMap<String, PeerMetricsState>>,
    jitter_weight: f64,
    loss_weight: f64,
    min_samples_for_decision: u64,
    rate_limit: Mutex<RateLimitState>,
}

struct RateLimitState {
    current_backoff_secs: u64,
    min_remesh_interval_secs: u64,
    max_remesh_interval_secs: u64,
    backoff_multiplier: f64,
    max_consecutive_remesh: u32,
    consecutive_remesh: u32,
    last_remesh_at: Option<u64>,
}

impl Default for RateLimitState {
    fn default() -> Self {
        Self {
            current_backoff_secs: 5,
            min_remesh_interval_secs: 5,
            max_remesh_interval_secs: 300,
            backoff_multiplier: 2.0,
            max_consecutive_remesh: 5,
            consecutive_remesh: 0,
            last_remesh_at: None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RemeshDecision {
    pub connect_peers: Vec<String>,
    pub disconnect_peers: Vec<String>,
    pub reauth_peers: Vec<String>,
    pub should_execute: bool,
    pub next_allowed_in: u64,
}

impl HealthMonitor {
    pub fn new() -> Self {
        Self {
            metrics: Mutex::new(HashMap::new()),
            jitter_weight: DEFAULT_JITTER_WEIGHT,
            loss_weight: DEFAULT_LOSS_WEIGHT,
            min_samples_for_decision: MIN_SAMPLES_FOR_DECISION,
            rate_limit: Mutex::new(RateLimitState::default()),
        }
    }

    /// Record a single RTT probe outcome for `peer_id`.
    pub fn update_measurement(&self, peer_id: &str, rtt_ms: f64, success: bool) {
        let mut table = self.metrics.lock();
        let state = table.entry(peer_id.to_string()).or_default();
        let m = &mut state.metrics;

        m.total_probes += 1;
        if !success {
            m.last_updated = now_secs();
            m.packet_loss_pct = 100.0 * (m.total_probes - m.success_probes) as f64 / m.total_probes as f64;
            return;
        }

        m.success_probes += 1;
        m.last_rtt = rtt_ms;

        if m.success_probes == 1 {
            m.avg_rtt = rtt_ms;
            m.ewma_rtt = rtt_ms;
            m.jitter_ms = 0.0;
        } else {
            let prev_avg = m.avg_rtt;
            m.avg_rtt += (rtt_ms - m.avg_rtt) / m.success_probes as f64;
            m.jitter_ms = 0.9 * m.jitter_ms + JITTER_ALPHA * (rtt_ms - prev_avg).abs();
            m.ewma_rtt = 0.9 * m.ewma_rtt + 0.1 * rtt_ms;
        }

        m.packet_loss_pct = 100.0 * (m.total_probes - m.success_probes) as f64 / m.total_probes as f64;
        m.last_updated = now_secs();
    }

    pub fn metrics_snapshot(&self, peer_id: &str) -> Option<PeerHealthMetrics> {
        self.metrics.lock().get(peer_id).map(|s| s.metrics)
    }

    fn score(&self, state: &PeerMetricsState) -> f64 {
        let m = &state.metrics;
        let stale = now_secs().saturating_sub(m.last_updated) > PEER_STALE_TIMEOUT_SECS;
        if stale || m.success_probes < self.min_samples_for_decision {
            return f64::INFINITY;
        }
        m.avg_rtt + self.jitter_weight * m.jitter_ms + self.loss_weight * m.packet_loss_pct
    }

    pub fn has_quality_degradation(&self, rtt_threshold_ms: f64, loss_threshold_pct: f64, jitter_threshold_ms: f64) -> bool {
        self.metrics.lock().values().any(|s| {
            s.metrics.avg_rtt > rtt_threshold_ms
                || s.metrics.packet_loss_pct > loss_threshold_pct
                || s.metrics.jitter_ms > jitter_threshold_ms
        })
    }

    /// Compute the desired active peer set from current scores, applying the
    /// rate limiter. `connected` is the set currently connected.
    pub fn compute_remesh(&self, max_active_peers: usize, connected: &HashSet<String>) -> RemeshDecision {
        let mut rate = self.rate_limit.lock();
        let now = now_secs();
        if let Some(last) = rate.last_remesh_at {
            let elapsed = now.saturating_sub(last);
            if elapsed < rate.current_backoff_secs {
                return RemeshDecision {
                    should_execute: false,
                    next_allowed_in: rate.current_backoff_secs - elapsed,
                    ..Default::default()
                };
            }
        }

        let table = self.metrics.lock();
        let mut scored: Vec<(&String, f64)> = table
            .iter()
            .map(|(peer, state)| (peer, self.score(state)))
            .collect();
        scored.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));

        let mut desired: Vec<String> = Vec::new();
        for (peer, score) in scored {
            if score.is_finite() && desired.len() < max_active_peers {
                desired.push(peer.clone());
            }
        }

        // Degenerate case: nobody has enough data, keep the current set.
        if desired.is_empty() {
            desired = connected.iter().cloned().collect();
        }

        let desired_set: HashSet<String> = desired.into_iter().collect();
        let connect_peers: Vec<String> = desired_set.difference(connected).cloned().collect();
        let disconnect_peers: Vec<String> = connected.difference(&desired_set).cloned().collect();

        if rate.consecutive_remesh >= rate.max_consecutive_remesh {
            rate.current_backoff_secs = rate.max_remesh_interval_secs;
        } else {
            rate.current_backoff_secs = ((rate.current_backoff_secs as f64 * rate.backoff_multiplier) as u64)
                .min(rate.max_remesh_interval_secs);
        }
        rate.consecutive_remesh += 1;
        rate.last_remesh_at = Some(now);

        RemeshDecision {
            connect_peers,
            disconnect_peers,
            reauth_peers: Vec::new(),
            should_execute: true,
            next_allowed_in: 0,
        }
    }

    pub fn reset_rate_limiting(&self) {
        let mut rate = self.rate_limit.lock();
        rate.current_backoff_secs = rate.min_remesh_interval_secs;
        rate.consecutive_remesh = 0;
        rate.last_remesh_at = None;
    }
}

impl Default for HealthMonitor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_success_initializes_avg_and_jitter() {
        let hm = HealthMonitor::new();
        hm.update_measurement("p1", 40.0, true);
        let m = hm.metrics_snapshot("p1").unwrap();
        assert_eq!(m.avg_rtt, 40.0);
        assert_eq!(m.jitter_ms, 0.0);
    }

    #[test]
    fn insufficient_samples_score_infinite() {
        let hm = HealthMonitor::new();
        hm.update_measurement("p1", 40.0, true);
        let connected = HashSet::new();
        let decision = hm.compute_remesh(2, &connected);
        assert!(!decision.connect_peers.contains(&"p1".to_string()));
    }

    #[test]
    fn degradation_scenario_prefers_low_rtt_peers() {
        let hm = HealthMonitor::new();
        for _ in 0..5 {
            hm.update_measurement("p1", 40.0, true);
            hm.update_measurement("p2", 42.0, true);
            hm.update_measurement("p3", 200.0, true);
            hm.update_measurement("p4", 210.0, true);
        }
        for _ in 0..5 {
            hm.update_measurement("p5", 50.0, true);
        }
        for _ in 0..6 {
            hm.update_measurement("p5", 50.0, false);
        }
        let decision = hm.compute_remesh(2, &HashSet::new());
        assert!(decision.connect_peers.contains(&"p1".to_string()));
        assert!(decision.connect_peers.contains(&"p2".to_string()));
        assert!(!decision.connect_peers.contains(&"p3".to_string()));
        assert!(!decision.connect_peers.contains(&"p4".to_string()));
        assert!(!decision.connect_peers.contains(&"p5".to_string()));
    }

    #[test]
    fn rate_limited_immediately_after_remesh() {
        let hm = HealthMonitor::new();
        for _ in 0..5 {
            hm.update_measurement("p1", 40.0, true);
        }
        let first = hm.compute_remesh(1, &HashSet::new());
        assert!(first.should_execute);
        let second = hm.compute_remesh(1, &HashSet::new());
        assert!(!second.should_execute);
        assert!(second.next_allowed_in > 0);
    }

    #[test]
    fn degenerate_empty_desired_keeps_current() {
        let hm = HealthMonitor::new();
        let mut connected = HashSet::new();
        connected.insert("p1".to_string());
        let decision = hm.compute_remesh(2, &connected);
        assert!(decision.disconnect_peers.is_empty());
    }
}
