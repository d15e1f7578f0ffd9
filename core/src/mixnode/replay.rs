// Replay guard — remembers recent layer fingerprints
//
// Sharded by the first fingerprint byte so concurrent workers rarely meet
// on the same lock. Each shard evicts oldest-first once full.

use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};

const SHARDS: usize = 16;

#[derive(Default)]
struct Shard {
    order: VecDeque<[u8; 32]>,
    seen: HashSet<[u8; 32]>,
}

pub struct ReplayGuard {
    shards: Vec<Mutex<Shard>>,
    per_shard: usize,
}

impl ReplayGuard {
    /// Remember up to roughly `capacity` fingerprints.
    pub fn new(capacity: usize) -> Self {
        Self {
            shards: (0..SHARDS).map(|_| Mutex::new(Shard::default())).collect(),
            per_shard: (capacity / SHARDS).max(1),
        }
    }

    /// Record `fingerprint`; false if it was already present.
    pub fn check_and_insert(&self, fingerprint: &[u8; 32]) -> bool {
        let mut shard = self.shards[fingerprint[0] as usize % SHARDS].lock();
        if !shard.seen.insert(*fingerprint) {
            return false;
        }
        shard.order.push_back(*fingerprint);
        if shard.order.len() > self.per_shard {
            if let Some(oldest) = shard.order.pop_front() {
                shard.seen.remove(&oldest);
            }
        }
        true
    }

    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.lock().order.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fp(a: u8, b: u8) -> [u8; 32] {
        let mut f = [0u8; 32];
        f[0] = a;
        f[1] = b;
        f
    }

    #[test]
    fn test_detects_replay() {
        let guard = ReplayGuard::new(1024);
        assert!(guard.check_and_insert(&fp(1, 1)));
        assert!(!guard.check_and_insert(&fp(1, 1)));
        assert!(guard.check_and_insert(&fp(1, 2)));
        assert_eq!(guard.len(), 2);
    }

    #[test]
    fn test_bounded_eviction() {
        // One slot per shard
        let guard = ReplayGuard::new(SHARDS);
        assert!(guard.check_and_insert(&fp(0, 1)));
        assert!(guard.check_and_insert(&fp(0, 2)));
        // First one was evicted from shard 0
        assert!(guard.check_and_insert(&fp(0, 1)));
        assert!(guard.len() <= SHARDS);
    }
}
