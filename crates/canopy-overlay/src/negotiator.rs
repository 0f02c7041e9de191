//! Join / Attach Negotiator (§4.1)
//!
//! Two distinct admission paths share this module: the Host's bootstrap
//! `JOIN_REQUEST` → `JOIN_ACCEPT`/`JOIN_REJECT`, and any peer's
//! `ATTACH_REQUEST` → `ATTACH_ACCEPT`/`ATTACH_REJECT` when acting as a
//! candidate parent. Both produce capacity-biased seed/redirect lists from
//! the Topology Aggregator's view (`canopy-routing`). The requester-side
//! bookkeeping (`JoinAttachState`) tracks attempts/backoff/redirect-depth
//! independent of which path is in flight.

use std::time::Duration;

use rand::seq::SliceRandom;
use rand::Rng;

use canopy_core::error::JoinError;
use canopy_core::PeerId;
use canopy_routing::{HostTopology, NodeTopology};

/// Whether the Host has spare direct-child capacity for a `JOIN_REQUEST`,
/// deciding `JOIN_ACCEPT.keepAlive` (§4.1 bootstrap).
pub fn host_has_spare_capacity(children_len: usize, max_host_children: usize) -> bool {
    children_len < max_host_children
}

/// Whether a candidate parent has spare capacity for an `ATTACH_REQUEST`.
pub fn node_has_spare_capacity(children_len: usize, max_node_children: usize) -> bool {
    children_len < max_node_children
}

/// Build the Host's `JOIN_ACCEPT.seeds` list (§4.1 "Seed/redirect
/// selection"): filtered, depth/freeSlots-sorted, weighted-shuffled, capped
/// between `min` and `max`.
pub fn host_seed_list(
    topology: &HostTopology,
    direct_children: &[PeerId],
    min: usize,
    max: usize,
    rng: &mut impl Rng,
) -> Vec<PeerId> {
    let mut seeds = topology.seed_candidates(direct_children, max, rng);
    if seeds.len() < min {
        let mut extra: Vec<PeerId> = direct_children
            .iter()
            .filter(|c| !seeds.contains(c))
            .cloned()
            .collect();
        extra.shuffle(rng);
        seeds.extend(extra);
        seeds.truncate(max);
    }
    seeds
}

/// Build an `ATTACH_REJECT.redirect` list: a candidate parent's known
/// descendants with `freeSlots > 0`, shuffled and capped (§4.1 Attach).
pub fn redirect_candidates(topology: &NodeTopology, cap: usize, rng: &mut impl Rng) -> Vec<PeerId> {
    let mut candidates: Vec<PeerId> = Vec::new();
    for child in topology.all_child_ids() {
        if let Some(free) = topology.child_free_slots(&child) {
            if free > 0 {
                candidates.push(child.clone());
            }
        }
        for d in topology.child_descendants(&child) {
            if d.free_slots > 0 {
                candidates.push(d.id);
            }
        }
    }
    candidates.shuffle(rng);
    candidates.truncate(cap);
    candidates
}

/// Requester-side join/attach bookkeeping (§4.1 "Join robustness"):
/// `attachAttempts` (max 10), `redirectDepth` (max 5), exponential backoff
/// between attempts, and the ordered candidate-seed list.
pub struct JoinAttachState {
    seeds: Vec<PeerId>,
    attach_attempts: u32,
    redirect_depth: u32,
    max_attach_attempts: u32,
    max_redirect_depth: u32,
    backoff_base: Duration,
    backoff_cap: Duration,
}

impl JoinAttachState {
    pub fn new(
        max_attach_attempts: u32,
        max_redirect_depth: u32,
        backoff_base: Duration,
        backoff_cap: Duration,
    ) -> Self {
        Self {
            seeds: Vec::new(),
            attach_attempts: 0,
            redirect_depth: 0,
            max_attach_attempts,
            max_redirect_depth,
            backoff_base,
            backoff_cap,
        }
    }

    pub fn seeds(&self) -> &[PeerId] {
        &self.seeds
    }

    /// Replace the seed list (e.g. from `JOIN_ACCEPT.seeds`,
    /// `ATTACH_REJECT.redirect`, or `REBIND_ASSIGN.newParentCandidates`).
    pub fn set_seeds(&mut self, seeds: Vec<PeerId>) {
        self.seeds = seeds;
    }

    /// Pick the next candidate at random from the remaining seeds (§4.1
    /// "Randomise the choice of the next seed"), removing it from the list.
    pub fn take_random_seed(&mut self, rng: &mut impl Rng) -> Option<PeerId> {
        if self.seeds.is_empty() {
            return None;
        }
        let idx = rng.random_range(0..self.seeds.len());
        Some(self.seeds.remove(idx))
    }

    /// Drop a seed that errored or timed out without consuming an attempt
    /// slot by itself (the caller separately calls
    /// [`JoinAttachState::record_attempt`] for the attempt that failed).
    pub fn remove_seed(&mut self, peer: &PeerId) {
        self.seeds.retain(|s| s != peer);
    }

    /// Record an attempt, returning the backoff to wait before the *next*
    /// one, or an error once `max_attach_attempts` is exceeded (caller
    /// should reset and re-authenticate directly with Host per §4.1).
    pub fn record_attempt(&mut self) -> Result<Duration, JoinError> {
        self.attach_attempts += 1;
        if self.attach_attempts > self.max_attach_attempts {
            return Err(JoinError::MaxAttemptsExceeded(self.max_attach_attempts));
        }
        let exp = self.attach_attempts.saturating_sub(1);
        let backoff = self.backoff_base.saturating_mul(1u32.checked_shl(exp).unwrap_or(u32::MAX));
        Ok(backoff.min(self.backoff_cap))
    }

    /// Record that an attach was rejected with a redirect, returning an
    /// error once `max_redirect_depth` is exceeded.
    pub fn record_redirect(&mut self) -> Result<(), JoinError> {
        self.redirect_depth += 1;
        if self.redirect_depth > self.max_redirect_depth {
            return Err(JoinError::MaxRedirectDepthExceeded(self.max_redirect_depth));
        }
        Ok(())
    }

    pub fn redirect_depth(&self) -> u32 {
        self.redirect_depth
    }

    /// Reset all bookkeeping for a fresh direct re-authentication with Host.
    pub fn reset(&mut self) {
        self.attach_attempts = 0;
        self.redirect_depth = 0;
        self.seeds.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use canopy_core::DescendantInfo;
    use rand::rngs::mock::StepRng;

    fn pid(s: &str) -> PeerId {
        PeerId::new(s).unwrap()
    }

    #[test]
    fn host_spare_capacity_boundary() {
        assert!(host_has_spare_capacity(4, 5));
        assert!(!host_has_spare_capacity(5, 5));
    }

    #[test]
    fn redirect_candidates_only_includes_free_slots() {
        let topo = NodeTopology::new();
        topo.record_child_status(
            pid("c1"),
            0,
            vec![DescendantInfo { id: pid("full"), hops: 1, free_slots: 0 }],
        );
        topo.record_child_status(
            pid("c2"),
            2,
            vec![DescendantInfo { id: pid("free"), hops: 1, free_slots: 1 }],
        );
        let mut rng = StepRng::new(0, 1);
        let candidates = redirect_candidates(&topo, 10, &mut rng);
        assert!(candidates.contains(&pid("c2")));
        assert!(candidates.contains(&pid("free")));
        assert!(!candidates.contains(&pid("c1")));
        assert!(!candidates.contains(&pid("full")));
    }

    #[test]
    fn backoff_schedule_doubles_then_caps() {
        let mut state = JoinAttachState::new(10, 5, Duration::from_millis(500), Duration::from_millis(5000));
        assert_eq!(state.record_attempt().unwrap(), Duration::from_millis(500));
        assert_eq!(state.record_attempt().unwrap(), Duration::from_millis(1000));
        assert_eq!(state.record_attempt().unwrap(), Duration::from_millis(2000));
        assert_eq!(state.record_attempt().unwrap(), Duration::from_millis(4000));
        assert_eq!(state.record_attempt().unwrap(), Duration::from_millis(5000)); // capped
    }

    #[test]
    fn exceeding_max_attach_attempts_errors() {
        let mut state = JoinAttachState::new(2, 5, Duration::from_millis(500), Duration::from_millis(5000));
        state.record_attempt().unwrap();
        state.record_attempt().unwrap();
        assert!(matches!(state.record_attempt(), Err(JoinError::MaxAttemptsExceeded(2))));
    }

    #[test]
    fn exceeding_max_redirect_depth_errors() {
        let mut state = JoinAttachState::new(10, 1, Duration::from_millis(500), Duration::from_millis(5000));
        state.record_redirect().unwrap();
        assert!(matches!(state.record_redirect(), Err(JoinError::MaxRedirectDepthExceeded(1))));
    }

    #[test]
    fn take_random_seed_removes_from_list() {
        let mut state = JoinAttachState::new(10, 5, Duration::from_millis(500), Duration::from_millis(5000));
        state.set_seeds(vec![pid("a"), pid("b")]);
        let mut rng = StepRng::new(0, 1);
        let picked = state.take_random_seed(&mut rng).unwrap();
        assert_eq!(state.seeds().len(), 1);
        assert!(!state.seeds().contains(&picked));
    }
}
