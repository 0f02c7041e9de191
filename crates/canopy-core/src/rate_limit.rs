//! Per-peer connection-attempt rate limiting (§4.8)
//!
//! Applied on every inbound connection and on outgoing attach attempts.
//! A background sweep (driven by the owning peer's timer loop, see
//! `canopy-node`) calls [`RateLimiter::sweep`] every 30s to drop expired
//! windows so the map doesn't grow unbounded against churn.

use std::time::{Duration, Instant};

use dashmap::DashMap;

use crate::ids::PeerId;

/// Sliding-window connection-attempt limiter, keyed by remote peer
pub struct RateLimiter {
    window: Duration,
    max_attempts: usize,
    attempts: DashMap<PeerId, Vec<Instant>>,
}

impl RateLimiter {
    pub fn new(window: Duration, max_attempts: usize) -> Self {
        Self {
            window,
            max_attempts,
            attempts: DashMap::new(),
        }
    }

    /// Record a connection attempt from `peer` and report whether it should
    /// be allowed (fewer than `max_attempts` within the trailing window).
    pub fn check_and_record(&self, peer: &PeerId) -> bool {
        let now = Instant::now();
        let mut entry = self.attempts.entry(peer.clone()).or_default();
        entry.retain(|t| now.duration_since(*t) <= self.window);
        if entry.len() >= self.max_attempts {
            return false;
        }
        entry.push(now);
        true
    }

    /// Drop expired windows entirely. Called periodically, not per-attempt.
    pub fn sweep(&self) {
        let now = Instant::now();
        self.attempts.retain(|_, timestamps| {
            timestamps.retain(|t| now.duration_since(*t) <= self.window);
            !timestamps.is_empty()
        });
    }

    pub fn tracked_peers(&self) -> usize {
        self.attempts.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pid(s: &str) -> PeerId {
        PeerId::new(s).unwrap()
    }

    #[test]
    fn allows_up_to_max_attempts_in_window() {
        let limiter = RateLimiter::new(Duration::from_secs(10), 5);
        let p = pid("p");
        for _ in 0..5 {
            assert!(limiter.check_and_record(&p));
        }
        assert!(!limiter.check_and_record(&p));
    }

    #[test]
    fn sweep_drops_peers_with_no_recent_attempts() {
        let limiter = RateLimiter::new(Duration::from_millis(10), 5);
        let p = pid("p");
        limiter.check_and_record(&p);
        std::thread::sleep(Duration::from_millis(20));
        limiter.sweep();
        assert_eq!(limiter.tracked_peers(), 0);
    }

    #[test]
    fn independent_peers_have_independent_windows() {
        let limiter = RateLimiter::new(Duration::from_secs(10), 1);
        assert!(limiter.check_and_record(&pid("a")));
        assert!(limiter.check_and_record(&pid("b")));
        assert!(!limiter.check_and_record(&pid("a")));
    }
}
