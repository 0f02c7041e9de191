//! Bounded FIFO cache of recent `{seq, event}` pairs (§4.4)
//!
//! Both Host (cap 100) and Node (default 20) keep one of these. It backs
//! both the application callback replay path and `STATE` response
//! construction (§4.7).

use std::collections::VecDeque;
use std::sync::Mutex;

use canopy_core::AppPayload;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedEvent {
    pub seq: u64,
    pub event: AppPayload,
}

/// Bounded, seq-ordered FIFO event cache
pub struct EventCache {
    entries: Mutex<VecDeque<CachedEvent>>,
    capacity: usize,
}

impl EventCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    /// Insert a new entry, evicting the oldest if at capacity. Entries must
    /// arrive in non-decreasing `seq` order (the Replication Engine only
    /// ever calls this after accepting a fresh, strictly-greater sequence).
    pub fn insert(&self, seq: u64, event: AppPayload) {
        let mut entries = self.entries.lock().expect("event cache lock poisoned");
        if entries.len() == self.capacity {
            entries.pop_front();
        }
        entries.push_back(CachedEvent { seq, event });
    }

    /// `getEventsAfter(fromSeq)`: entries with `seq > fromSeq`, in order.
    pub fn events_after(&self, from_seq: u64) -> Vec<CachedEvent> {
        self.entries
            .lock()
            .expect("event cache lock poisoned")
            .iter()
            .filter(|e| e.seq > from_seq)
            .cloned()
            .collect()
    }

    /// `getMinSeq()`: the smallest cached seq, or 0 if empty.
    pub fn min_seq(&self) -> u64 {
        self.entries
            .lock()
            .expect("event cache lock poisoned")
            .front()
            .map(|e| e.seq)
            .unwrap_or(0)
    }

    pub fn max_seq(&self) -> u64 {
        self.entries
            .lock()
            .expect("event cache lock poisoned")
            .back()
            .map(|e| e.seq)
            .unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("event cache lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// A `REQ_STATE{fromSeq}` response is truncated iff the earliest cached
    /// entry is already past `fromSeq + 1` — some events in between were
    /// evicted and can never be recovered from this cache.
    pub fn is_truncated_for(&self, from_seq: u64) -> bool {
        !self.is_empty() && self.min_seq() > from_seq + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload() -> AppPayload {
        AppPayload::new("t", vec![1, 2, 3])
    }

    #[test]
    fn events_after_filters_strictly_greater() {
        let cache = EventCache::new(10);
        for seq in 1..=5 {
            cache.insert(seq, payload());
        }
        let after = cache.events_after(3);
        assert_eq!(after.iter().map(|e| e.seq).collect::<Vec<_>>(), vec![4, 5]);
    }

    #[test]
    fn overflow_evicts_oldest_first() {
        let cache = EventCache::new(100);
        for seq in 1..=110 {
            cache.insert(seq, payload());
        }
        assert_eq!(cache.len(), 100);
        assert_eq!(cache.min_seq(), 11);
    }

    #[test]
    fn truncated_matches_boundary() {
        let cache = EventCache::new(100);
        for seq in 1..=110 {
            cache.insert(seq, payload());
        }
        assert!(cache.is_truncated_for(0));
        assert_eq!(cache.min_seq(), 11);
    }

    #[test]
    fn applying_same_state_twice_is_idempotent_by_seq() {
        // Insertion happens only for seq > lastGameSeq at the call site
        // (canopy-peer's NodeCore), so re-applying the same STATE twice at
        // that layer inserts nothing the second time; the cache itself
        // just reflects whatever the caller chose to insert.
        let cache = EventCache::new(10);
        cache.insert(1, payload());
        let before: Vec<_> = cache.events_after(0);
        // second "apply" intentionally does not call insert for seq <= lastGameSeq
        let after: Vec<_> = cache.events_after(0);
        assert_eq!(before, after);
    }
}
