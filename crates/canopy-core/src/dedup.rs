//! Bounded recently-seen `msgId` set (§4.8)
//!
//! Used by every peer's Router to implement drop rule (b): a duplicate
//! `msgId` is dropped immediately, without processing or forwarding.

use std::collections::VecDeque;

use dashmap::DashSet;

use crate::ids::MsgId;

/// Bounded FIFO set of recently seen message ids
///
/// On overflow, the oldest `eviction_fraction` of entries (by insertion
/// order) are dropped in one batch rather than one at a time, matching the
/// "FIFO/batched eviction of oldest 20%" behavior in the component design.
pub struct DedupSet {
    seen: DashSet<MsgId>,
    order: std::sync::Mutex<VecDeque<MsgId>>,
    capacity: usize,
    eviction_fraction: f64,
}

impl DedupSet {
    pub fn new(capacity: usize, eviction_fraction: f64) -> Self {
        Self {
            seen: DashSet::new(),
            order: std::sync::Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            eviction_fraction,
        }
    }

    /// Record `id` as seen. Returns `true` if it was already present (a
    /// duplicate — the caller should drop the message), `false` if this is
    /// the first sighting.
    pub fn check_and_insert(&self, id: MsgId) -> bool {
        if self.seen.contains(&id) {
            return true;
        }
        self.seen.insert(id);
        let mut order = self.order.lock().expect("dedup order lock poisoned");
        order.push_back(id);
        if order.len() > self.capacity {
            let evict_count = ((order.len() as f64) * self.eviction_fraction).ceil() as usize;
            for _ in 0..evict_count.max(1) {
                if let Some(oldest) = order.pop_front() {
                    self.seen.remove(&oldest);
                } else {
                    break;
                }
            }
        }
        false
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_sighting_is_not_a_duplicate() {
        let set = DedupSet::new(100, 0.2);
        assert!(!set.check_and_insert(MsgId::generate()));
    }

    #[test]
    fn repeat_sighting_is_a_duplicate() {
        let set = DedupSet::new(100, 0.2);
        let id = MsgId::generate();
        assert!(!set.check_and_insert(id));
        assert!(set.check_and_insert(id));
    }

    #[test]
    fn bounded_at_capacity_under_sustained_load() {
        let set = DedupSet::new(100, 0.2);
        for _ in 0..200 {
            set.check_and_insert(MsgId::generate());
        }
        assert!(set.len() <= 100, "dedup set grew past capacity: {}", set.len());
    }
}
