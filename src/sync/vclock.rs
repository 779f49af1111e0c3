//! Vector clocks capturing causal order between concurrent writers.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VectorClock {
    counters: BTreeMap<String, u64>,
}

impl VectorClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, peer_id: &str) -> u64 {
        self.counters.get(peer_id).copied().unwrap_or(0)
    }

    pub fn increment(&mut self, peer_id: &str) {
        *self.counters.entry(peer_id.to_string()).or_insert(0) += 1;
    }

    pub fn merge(&self, other: &VectorClock) -> VectorClock {
        let mut merged = self.counters.clone();
        for (peer, &count) in &other.counters {
            let entry = merged.entry(peer.clone()).or_insert(0);
            if count > *entry {
                *entry = count;
            }
        }
        VectorClock { counters: merged }
    }

    fn peers<'a>(&'a self, other: &'a VectorClock) -> impl Iterator<Item = &'a str> {
        let mut all: Vec<&str> = self
            .counters
            .keys()
            .chain(other.counters.keys())
            .map(|s| s.as_str())
            .collect();
        all.sort_unstable();
        all.dedup();
        all.into_iter()
    }

    /// `a happens_before b`: every counter in `a` is <= the matching counter in
    /// `b`, and at least one is strictly less.
    pub fn happens_before(&self, other: &VectorClock) -> bool {
        let mut strictly_less = false;
        for peer in self.peers(other) {
            let a = self.get(peer);
            let b = other.get(peer);
            if a > b {
                return false;
            }
            if a < b {
                strictly_less = true;
            }
        }
        strictly_less
    }

    pub fn concurrent(&self, other: &VectorClock) -> bool {
        !self.happens_before(other) && !other.happens_before(self) && self != other
    }

    pub fn compare(&self, other: &VectorClock) -> ClockOrdering {
        if self == other {
            ClockOrdering::Equal
        } else if self.happens_before(other) {
            ClockOrdering::Before
        } else if other.happens_before(self) {
            ClockOrdering::After
        } else {
            ClockOrdering::Concurrent
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockOrdering {
    Before,
    After,
    Equal,
    Concurrent,
}

impl fmt::Display for VectorClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tokens: Vec<String> = self
            .counters
            .iter()
            .map(|(peer, count)| format!("{peer}:{count}"))
            .collect();
        write!(f, "{}", tokens.join(","))
    }
}

impl std::str::FromStr for VectorClock {
    type Err = crate::error::CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut counters = BTreeMap::new();
        if s.is_empty() {
            return Ok(VectorClock { counters });
        }
        for token in s.split(',') {
            let (peer, count) = token
                .split_once(':')
                .ok_or_else(|| crate::error::internal(format!("malformed vector clock token: {token}")))?;
            let count: u64 = count
                .parse()
                .map_err(|_| crate::error::internal(format!("malformed vector clock counter: {count}")))?;
            counters.insert(peer.to_string(), count);
        }
        Ok(VectorClock { counters })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn increment_and_get() {
        let mut vc = VectorClock::new();
        vc.increment("a");
        vc.increment("a");
        assert_eq!(vc.get("a"), 2);
        assert_eq!(vc.get("b"), 0);
    }

    #[test]
    fn merge_is_pointwise_max() {
        let mut a = VectorClock::new();
        a.increment("a");
        a.increment("a");
        let mut b = VectorClock::new();
        b.increment("a");
        b.increment("b");
        let merged = a.merge(&b);
        assert_eq!(merged.get("a"), 2);
        assert_eq!(merged.get("b"), 1);
    }

    #[test]
    fn happens_before_and_concurrent() {
        let mut a = VectorClock::new();
        a.increment("p1");
        let mut b = a.clone();
        b.increment("p1");
        assert!(a.happens_before(&b));
        assert!(!b.happens_before(&a));

        let mut c = VectorClock::new();
        c.increment("p2");
        assert!(a.concurrent(&c));
        assert!(!a.happens_before(&c));
        assert!(!c.happens_before(&a));
    }

    #[test]
    fn roundtrip_serialization() {
        let mut vc = VectorClock::new();
        vc.increment("peer-a");
        vc.increment("peer-b");
        vc.increment("peer-b");
        let s = vc.to_string();
        let parsed: VectorClock = s.parse().unwrap();
        assert_eq!(vc, parsed);
    }

    #[test]
    fn exactly_one_relation_holds() {
        let mut a = VectorClock::new();
        a.increment("p1");
        let mut b = VectorClock::new();
        b.increment("p2");
        let rels = [
            a.happens_before(&b),
            b.happens_before(&a),
            a == b,
            a.concurrent(&b),
        ];
        assert_eq!(rels.iter().filter(|&&r| r).count(), 1);
    }
}
