//! Bounded dedup sets with a moving eviction horizon.
//!
//! One instance holds message ids already seen (received or originated here), which is all
//! the loop prevention the flood relay has. A second, short-horizon instance suppresses
//! re-sending an identical frame within a few seconds.

use std::collections::{HashMap, VecDeque};
use std::hash::Hash;

use crate::identity::PeerId;
use crate::protocol::MessageId;

/// Insertion-ordered set bounded by capacity and age. All operations are amortized O(1).
pub struct DedupCache<K> {
    seen: HashMap<K, u64>,
    order: VecDeque<(u64, K)>,
    capacity: usize,
    horizon_ms: u64,
}

impl<K: Eq + Hash + Clone> DedupCache<K> {
    pub fn new(capacity: usize, horizon_ms: u64) -> Self {
        Self {
            seen: HashMap::new(),
            order: VecDeque::new(),
            capacity: capacity.max(1),
            horizon_ms,
        }
    }

    /// Insert `key` unless already present. Returns `true` if the key is new.
    /// Check and insert happen under one `&mut self`, so callers holding the engine lock
    /// cannot admit the same key twice.
    pub fn check_and_insert(&mut self, key: K, now_ms: u64) -> bool {
        self.evict(now_ms);
        if self.seen.contains_key(&key) {
            return false;
        }
        while self.order.len() >= self.capacity {
            if let Some((_, old)) = self.order.pop_front() {
                self.seen.remove(&old);
            }
        }
        self.seen.insert(key.clone(), now_ms);
        self.order.push_back((now_ms, key));
        true
    }

    pub fn contains(&self, key: &K) -> bool {
        self.seen.contains_key(key)
    }

    /// Drop entries older than the horizon.
    pub fn evict(&mut self, now_ms: u64) {
        while let Some((t, _)) = self.order.front() {
            if now_ms.saturating_sub(*t) < self.horizon_ms {
                break;
            }
            if let Some((_, key)) = self.order.pop_front() {
                self.seen.remove(&key);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

/// Ids of messages seen on any link.
pub type SeenCache = DedupCache<MessageId>;

/// Frames recently handed to the transport, keyed by message id and target (`None` = broadcast).
pub type SentCache = DedupCache<(MessageId, Option<PeerId>)>;

#[cfg(test)]
mod tests {
    use super::*;

    fn id(n: u8) -> MessageId {
        MessageId::compute(PeerId::from_bytes([n; 8]), n as u64, &[n])
    }

    #[test]
    fn second_insert_is_duplicate() {
        let mut cache = SeenCache::new(10, 1_000);
        assert!(cache.check_and_insert(id(1), 0));
        assert!(!cache.check_and_insert(id(1), 10));
        assert!(cache.check_and_insert(id(2), 10));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn horizon_expires_entries() {
        let mut cache = SeenCache::new(10, 1_000);
        assert!(cache.check_and_insert(id(1), 0));
        assert!(!cache.check_and_insert(id(1), 999));
        assert!(cache.check_and_insert(id(1), 1_000));
    }

    #[test]
    fn capacity_evicts_oldest_first() {
        let mut cache = SeenCache::new(3, 1_000_000);
        for n in 0..5 {
            assert!(cache.check_and_insert(id(n), n as u64));
        }
        assert_eq!(cache.len(), 3);
        assert!(!cache.contains(&id(0)));
        assert!(!cache.contains(&id(1)));
        assert!(cache.contains(&id(4)));
    }

    #[test]
    fn sent_cache_distinguishes_targets() {
        let mut cache = SentCache::new(10, 5_000);
        let peer = PeerId::from_bytes([3; 8]);
        assert!(cache.check_and_insert((id(1), None), 0));
        assert!(cache.check_and_insert((id(1), Some(peer)), 0));
        assert!(!cache.check_and_insert((id(1), Some(peer)), 1));
    }
}
