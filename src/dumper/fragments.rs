//! Reassembly cache for fragmented batches.
//!
//! Non-final fragments wait here, keyed by `(id, seq)`, until the final
//! fragment arrives and collects them. Entries are evicted on completion of
//! an id and by a periodic purge once they outlive the TTL, so an id that
//! never completes cannot pin memory.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use dashmap::DashMap;
use tracing::debug;

pub const FRAGMENT_TTL: Duration = Duration::from_secs(60);

#[derive(Debug)]
struct CacheEntry {
    payload: Vec<u8>,
    inserted_at: Instant,
}

#[derive(Debug, Clone, Default)]
pub struct FragmentCache {
    entries: Arc<DashMap<(i64, u32), CacheEntry>>,
}

impl FragmentCache {
    pub fn new() -> FragmentCache {
        FragmentCache::default()
    }

    /// Store a non-final fragment. Redelivered fragments are ignored; the
    /// first copy wins.
    pub fn insert(&self, id: i64, seq: u32, payload: Vec<u8>) {
        if self.entries.contains_key(&(id, seq)) {
            debug!(message = "Fragment already received.", %id, %seq);
            return;
        }
        self.entries.insert(
            (id, seq),
            CacheEntry {
                payload,
                inserted_at: Instant::now(),
            },
        );
    }

    pub fn get(&self, id: i64, seq: u32) -> Option<Vec<u8>> {
        self.entries.get(&(id, seq)).map(|e| e.payload.clone())
    }

    /// Collect payloads `1..total-1` for an id, in seq order, if all are
    /// present.
    pub fn collect(&self, id: i64, total: u32) -> Option<Vec<Vec<u8>>> {
        (1..total).map(|seq| self.get(id, seq)).collect()
    }

    /// Drop every cached fragment of a completed id.
    pub fn remove_id(&self, id: i64, total: u32) {
        for seq in 1..total {
            self.entries.remove(&(id, seq));
        }
    }

    /// Drop entries older than the TTL. Run periodically; completion-time
    /// eviction alone would leak ids whose final fragment never arrives.
    pub fn remove_expired(&self) {
        let now = Instant::now();

        let to_remove = self
            .entries
            .iter()
            .filter(|entry| now.duration_since(entry.value().inserted_at) >= FRAGMENT_TTL)
            .map(|entry| *entry.key())
            .collect::<Vec<_>>();

        for key in to_remove {
            self.entries.remove(&key);
        }
    }

    #[cfg(test)]
    fn age_entry(&self, id: i64, seq: u32, by: Duration) {
        if let Some(mut entry) = self.entries.get_mut(&(id, seq)) {
            entry.inserted_at = Instant::now() - by;
        }
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use similar_asserts::assert_eq;

    use super::FragmentCache;

    #[test]
    fn collects_when_complete() {
        let cache = FragmentCache::new();
        cache.insert(1, 2, b"bb".to_vec());
        assert_eq!(cache.collect(1, 3), None);

        cache.insert(1, 1, b"aa".to_vec());
        assert_eq!(
            cache.collect(1, 3),
            Some(vec![b"aa".to_vec(), b"bb".to_vec()]),
        );
    }

    #[test]
    fn first_copy_wins_on_redelivery() {
        let cache = FragmentCache::new();
        cache.insert(1, 1, b"original".to_vec());
        cache.insert(1, 1, b"redelivered".to_vec());
        assert_eq!(cache.get(1, 1), Some(b"original".to_vec()));
    }

    #[test]
    fn completion_evicts_the_id() {
        let cache = FragmentCache::new();
        cache.insert(7, 1, b"a".to_vec());
        cache.insert(7, 2, b"b".to_vec());
        cache.insert(8, 1, b"other".to_vec());

        cache.remove_id(7, 3);
        assert_eq!(cache.get(7, 1), None);
        assert_eq!(cache.get(7, 2), None);
        assert_eq!(cache.get(8, 1), Some(b"other".to_vec()));
    }

    #[test]
    fn purge_drops_only_expired_entries() {
        let cache = FragmentCache::new();
        cache.insert(1, 1, b"old".to_vec());
        cache.insert(2, 1, b"fresh".to_vec());
        cache.age_entry(1, 1, Duration::from_secs(61));

        cache.remove_expired();
        assert_eq!(cache.get(1, 1), None);
        assert_eq!(cache.get(2, 1), Some(b"fresh".to_vec()));
    }
}
