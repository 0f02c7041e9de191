//! Replication Engine: RAIN heartbeat and GAME_EVENT fan-out (§4.4)
//!
//! Host and Node carry distinct state (the Host issues sequences, the Node
//! only ever accepts strictly-greater ones), so this module exposes two
//! small state holders rather than one generic one.

use std::sync::atomic::{AtomicU64, Ordering};

use canopy_core::AppPayload;

use crate::cache::EventCache;

/// Host-side replication state: the sole source of `rainSeq`/`gameSeq`.
pub struct HostReplicationState {
    rain_seq: AtomicU64,
    game_seq: AtomicU64,
    cache: EventCache,
}

impl HostReplicationState {
    pub fn new(cache_capacity: usize) -> Self {
        Self {
            rain_seq: AtomicU64::new(0),
            game_seq: AtomicU64::new(0),
            cache: EventCache::new(cache_capacity),
        }
    }

    /// Issue the next `RAIN` sequence number.
    pub fn next_rain_seq(&self) -> u64 {
        self.rain_seq.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Assign the next `gameSeq`, cache the event, and return the stamped
    /// pair ready for broadcast.
    pub fn emit_game_event(&self, event: AppPayload) -> (u64, AppPayload) {
        let seq = self.game_seq.fetch_add(1, Ordering::SeqCst) + 1;
        self.cache.insert(seq, event.clone());
        (seq, event)
    }

    pub fn rain_seq(&self) -> u64 {
        self.rain_seq.load(Ordering::SeqCst)
    }

    pub fn game_seq(&self) -> u64 {
        self.game_seq.load(Ordering::SeqCst)
    }

    pub fn cache(&self) -> &EventCache {
        &self.cache
    }
}

/// Node-side replication state: only ever accepts strictly-greater sequences
/// from its parent; never invents new ones.
pub struct NodeReplicationState {
    rain_seq: AtomicU64,
    last_game_seq: AtomicU64,
    cache: EventCache,
}

impl NodeReplicationState {
    pub fn new(cache_capacity: usize) -> Self {
        Self {
            rain_seq: AtomicU64::new(0),
            last_game_seq: AtomicU64::new(0),
            cache: EventCache::new(cache_capacity),
        }
    }

    /// Apply an incoming `RAIN{rainSeq}` from the parent (§4.4 step 1-2).
    /// Returns `true` if it was fresh and advanced local state (the caller
    /// should then run the state-machine/rebroadcast side effects); `false`
    /// if it was stale and must be dropped.
    pub fn try_accept_parent_rain(&self, incoming_rain_seq: u64) -> bool {
        let mut current = self.rain_seq.load(Ordering::SeqCst);
        loop {
            if incoming_rain_seq <= current {
                return false;
            }
            match self.rain_seq.compare_exchange(
                current,
                incoming_rain_seq,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return true,
                Err(observed) => current = observed,
            }
        }
    }

    /// Advance `rainSeq` to at least `new_seq`, used when applying a `STATE`
    /// response whose `latestRainSeq` is fresher than ours (§4.7).
    pub fn advance_rain_seq_to(&self, new_seq: u64) -> bool {
        self.try_accept_parent_rain(new_seq)
    }

    /// Apply an incoming `GAME_EVENT{gameSeq, event}` (§4.4): dedupe by
    /// `gameSeq <= lastGameSeq`, and if fresh, update and cache.
    pub fn try_accept_game_event(&self, incoming_seq: u64, event: AppPayload) -> bool {
        let mut current = self.last_game_seq.load(Ordering::SeqCst);
        loop {
            if incoming_seq <= current {
                return false;
            }
            match self.last_game_seq.compare_exchange(
                current,
                incoming_seq,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => {
                    self.cache.insert(incoming_seq, event);
                    return true;
                }
                Err(observed) => current = observed,
            }
        }
    }

    /// `lastGameSeq = max(lastGameSeq, msg.latestGameSeq)` (§4.7 STATE
    /// application), without caching anything — the individual `events` in
    /// the STATE response are applied one at a time via
    /// [`NodeReplicationState::try_accept_game_event`].
    pub fn fast_forward_game_seq(&self, latest_game_seq: u64) {
        self.last_game_seq.fetch_max(latest_game_seq, Ordering::SeqCst);
    }

    pub fn rain_seq(&self) -> u64 {
        self.rain_seq.load(Ordering::SeqCst)
    }

    pub fn last_game_seq(&self) -> u64 {
        self.last_game_seq.load(Ordering::SeqCst)
    }

    pub fn cache(&self) -> &EventCache {
        &self.cache
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload() -> AppPayload {
        AppPayload::new("t", vec![])
    }

    #[test]
    fn host_assigns_strictly_increasing_game_seq() {
        let host = HostReplicationState::new(100);
        let (s1, _) = host.emit_game_event(payload());
        let (s2, _) = host.emit_game_event(payload());
        assert_eq!(s1, 1);
        assert_eq!(s2, 2);
    }

    #[test]
    fn node_drops_stale_rain() {
        let node = NodeReplicationState::new(20);
        assert!(node.try_accept_parent_rain(5));
        assert!(!node.try_accept_parent_rain(5));
        assert!(!node.try_accept_parent_rain(3));
        assert!(node.try_accept_parent_rain(6));
    }

    #[test]
    fn node_game_event_idempotent_by_seq() {
        let node = NodeReplicationState::new(20);
        assert!(node.try_accept_game_event(1, payload()));
        assert!(!node.try_accept_game_event(1, payload()));
        assert_eq!(node.cache().len(), 1);
    }

    #[test]
    fn fast_forward_never_moves_backward() {
        let node = NodeReplicationState::new(20);
        node.try_accept_game_event(10, payload());
        node.fast_forward_game_seq(3);
        assert_eq!(node.last_game_seq(), 10);
        node.fast_forward_game_seq(20);
        assert_eq!(node.last_game_seq(), 20);
    }
}
