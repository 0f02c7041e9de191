//! Recovery Engine (§4.7): `REQ_STATE`/`STATE` construction and
//! application, and the `REBIND_REQUEST` escalation path.

use std::time::{Duration, Instant};

use canopy_core::{AppPayload, MessageBody, SeqEvent};
use canopy_replication::{CachedEvent, EventCache, NodeReplicationState};

/// Build the `REQ_STATE{fromRainSeq, fromGameSeq}` body sent to a cousin or,
/// on fallback, the Host.
pub fn build_req_state(from_rain_seq: u64, from_game_seq: u64) -> MessageBody {
    MessageBody::ReqState { from_rain_seq, from_game_seq }
}

/// Build the `STATE` response a responder sends back (§4.7 "STATE response
/// construction"): events after `from_game_seq`, truncation flag, and the
/// responder's own latest sequences.
pub fn build_state_response(
    cache: &EventCache,
    from_game_seq: u64,
    latest_rain_seq: u64,
    latest_game_seq: u64,
) -> MessageBody {
    let events = cache
        .events_after(from_game_seq)
        .into_iter()
        .map(|CachedEvent { seq, event }| SeqEvent { seq, event })
        .collect();
    MessageBody::State {
        latest_rain_seq,
        latest_game_seq,
        events,
        min_game_seq_available: cache.min_seq(),
        truncated: cache.is_truncated_for(from_game_seq),
    }
}

/// Build the `REBIND_REQUEST{lastRainSeq, lastGameSeq, subtreeCount,
/// reason}` body (§4.7). `subtree_count` must include the requester itself:
/// `>= 1 + children + sum(childDescendants)`.
pub fn build_rebind_request(
    last_rain_seq: u64,
    last_game_seq: u64,
    subtree_count: u64,
    reason: impl Into<String>,
) -> MessageBody {
    MessageBody::RebindRequest {
        last_rain_seq,
        last_game_seq,
        subtree_count,
        reason: reason.into(),
    }
}

/// Outcome of applying an incoming `STATE` response at the requester (§4.7
/// "STATE application"): the events newly applied (to be re-emitted
/// downstream as freshly-stamped `GAME_EVENT`s with their original `seq`),
/// and whether the local `rainSeq` was advanced (the caller should then
/// synthesize and broadcast a `RAIN` downstream).
pub struct StateApplyOutcome {
    pub newly_repaired: Vec<(u64, AppPayload)>,
    pub rain_advanced_to: Option<u64>,
}

/// Apply a `STATE{latestRainSeq, latestGameSeq, events, ..}` response to the
/// requester's replication state. Idempotent by seq: events already at or
/// below `lastGameSeq` are skipped by
/// [`NodeReplicationState::try_accept_game_event`].
pub fn apply_state_response(
    repl: &NodeReplicationState,
    events: &[SeqEvent],
    latest_game_seq: u64,
    latest_rain_seq: u64,
) -> StateApplyOutcome {
    let mut newly_repaired = Vec::new();
    for SeqEvent { seq, event } in events {
        if repl.try_accept_game_event(*seq, event.clone()) {
            newly_repaired.push((*seq, event.clone()));
        }
    }
    repl.fast_forward_game_seq(latest_game_seq);

    let rain_advanced_to = if latest_rain_seq > repl.rain_seq() {
        repl.advance_rain_seq_to(latest_rain_seq);
        Some(latest_rain_seq)
    } else {
        None
    };

    StateApplyOutcome { newly_repaired, rain_advanced_to }
}

/// Paces the cousin-empty fallback to `dest=HOST` at no more than once per
/// `interval` (default 5s, §4.7 "REQ_STATE").
pub struct HostFallbackPacer {
    last_used: Option<Instant>,
    interval: Duration,
}

impl HostFallbackPacer {
    pub fn new(interval: Duration) -> Self {
        Self { last_used: None, interval }
    }

    /// Returns `true` (and records `now`) if a host-fallback `REQ_STATE` may
    /// be sent right now; `false` if the interval hasn't elapsed yet.
    pub fn try_use(&mut self) -> bool {
        let now = Instant::now();
        match self.last_used {
            Some(last) if now.duration_since(last) < self.interval => false,
            _ => {
                self.last_used = Some(now);
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(n: u8) -> AppPayload {
        AppPayload::new("t", vec![n])
    }

    #[test]
    fn state_response_reports_truncation_when_cache_evicted_old_entries() {
        let cache = EventCache::new(100);
        for seq in 1..=110u64 {
            cache.insert(seq, payload(seq as u8));
        }
        let body = build_state_response(&cache, 0, 5, 110);
        match body {
            MessageBody::State { truncated, min_game_seq_available, events, .. } => {
                assert!(truncated);
                assert_eq!(min_game_seq_available, 11);
                assert_eq!(events.len(), 100);
            }
            _ => panic!("expected State"),
        }
    }

    #[test]
    fn apply_state_response_is_idempotent() {
        let repl = NodeReplicationState::new(20);
        let events = vec![
            SeqEvent { seq: 1, event: payload(1) },
            SeqEvent { seq: 2, event: payload(2) },
        ];
        let first = apply_state_response(&repl, &events, 2, 0);
        assert_eq!(first.newly_repaired.len(), 2);
        let second = apply_state_response(&repl, &events, 2, 0);
        assert_eq!(second.newly_repaired.len(), 0, "already-applied seqs must not repeat");
        assert_eq!(repl.cache().len(), 2);
    }

    #[test]
    fn apply_state_response_advances_rain_seq() {
        let repl = NodeReplicationState::new(20);
        let outcome = apply_state_response(&repl, &[], 0, 42);
        assert_eq!(outcome.rain_advanced_to, Some(42));
        assert_eq!(repl.rain_seq(), 42);
    }

    #[test]
    fn apply_state_response_does_not_regress_rain() {
        let repl = NodeReplicationState::new(20);
        repl.try_accept_parent_rain(50);
        let outcome = apply_state_response(&repl, &[], 0, 10);
        assert!(outcome.rain_advanced_to.is_none());
        assert_eq!(repl.rain_seq(), 50);
    }

    #[test]
    fn host_fallback_pacer_limits_to_once_per_interval() {
        let mut pacer = HostFallbackPacer::new(Duration::from_millis(20));
        assert!(pacer.try_use());
        assert!(!pacer.try_use());
        std::thread::sleep(Duration::from_millis(25));
        assert!(pacer.try_use());
    }
}
