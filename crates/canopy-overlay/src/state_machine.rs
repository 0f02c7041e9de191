//! Node State Machine (§4.5)
//!
//! ```text
//! NORMAL -> SUSPECT_UPSTREAM -> PATCHING -> REBINDING -> WAITING_FOR_HOST -> NORMAL
//!              ^                   |
//!              +-------------------+  (fresh parent RAIN)
//! ```
//!
//! All edges require `is_attached`, except `REBINDING -> WAITING_FOR_HOST`.
//! The machine itself only decides *what state to be in*; the caller (the
//! peer's event loop) is responsible for the side effects a transition
//! implies (sending `REQ_STATE`, `REBIND_REQUEST`, etc).

use std::time::{Duration, Instant};

use rand::Rng;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Normal,
    SuspectUpstream,
    Patching,
    Rebinding,
    WaitingForHost,
}

/// Pacing schedule for `REQ_STATE` while `PATCHING` (§4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReqStatePacing {
    pub count: u32,
}

impl ReqStatePacing {
    /// Minimum spacing before the *next* `REQ_STATE` may be sent, given how
    /// many have already been sent this `PATCHING` episode.
    pub fn min_spacing(count: u32) -> Duration {
        match count {
            0..=4 => Duration::from_secs(1),
            5..=7 => Duration::from_secs(2),
            8..=11 => Duration::from_secs(5),
            _ => Duration::from_secs(10),
        }
    }
}

/// Drives the per-node state machine. `&mut self` throughout: a peer loop is
/// single-threaded (§5), so no internal synchronization is needed.
pub struct NodeStateMachine {
    state: NodeState,
    state_entered: Instant,
    is_attached: bool,
    last_parent_rain_time: Option<Instant>,
    patch_start_time: Option<Instant>,
    rebind_jitter: Duration,
    req_state_count: u32,
    last_req_state_sent: Option<Instant>,
    stall_threshold: Duration,
    patch_to_rebind_threshold: Duration,
    rebind_jitter_max: Duration,
}

impl NodeStateMachine {
    pub fn new(stall_threshold: Duration, patch_to_rebind_threshold: Duration, rebind_jitter_max: Duration) -> Self {
        Self {
            state: NodeState::WaitingForHost,
            state_entered: Instant::now(),
            is_attached: false,
            last_parent_rain_time: None,
            patch_start_time: None,
            rebind_jitter: Duration::ZERO,
            req_state_count: 0,
            last_req_state_sent: None,
            stall_threshold,
            patch_to_rebind_threshold,
            rebind_jitter_max,
        }
    }

    pub fn state(&self) -> NodeState {
        self.state
    }

    pub fn is_attached(&self) -> bool {
        self.is_attached
    }

    /// Called once attach succeeds (fresh `ATTACH_ACCEPT`/`JOIN_ACCEPT`).
    pub fn mark_attached(&mut self) {
        self.is_attached = true;
        self.last_parent_rain_time = Some(Instant::now());
        self.transition_to(NodeState::Normal);
    }

    /// Called on transport-close of the parent connection (§4.7 "Crash of a
    /// parent"): immediately drops to `WAITING_FOR_HOST`, bypassing the
    /// stall/patch/rebind escalation so reattachment starts at once.
    pub fn mark_parent_lost(&mut self) {
        self.is_attached = false;
        self.transition_to(NodeState::WaitingForHost);
    }

    /// A fresh `RAIN` arrived from the parent: clears patch state and
    /// returns to `NORMAL` unconditionally (§4.4 step 3).
    pub fn on_fresh_parent_rain(&mut self) {
        self.last_parent_rain_time = Some(Instant::now());
        if self.state != NodeState::Normal {
            self.patch_start_time = None;
            self.req_state_count = 0;
            self.transition_to(NodeState::Normal);
        }
    }

    /// Periodic 1s tick (§4.5). Returns `true` if this tick should trigger
    /// an immediate `REQ_STATE` send (entering `PATCHING`), `false`
    /// otherwise. Call [`NodeStateMachine::should_send_req_state`]
    /// separately each tick while already `PATCHING`.
    pub fn tick(&mut self, rng: &mut impl Rng) -> TickOutcome {
        if !self.is_attached {
            return TickOutcome::NoAction;
        }
        match self.state {
            NodeState::Normal => {
                if let Some(last) = self.last_parent_rain_time {
                    if last.elapsed() > self.stall_threshold {
                        self.transition_to(NodeState::SuspectUpstream);
                    }
                }
                TickOutcome::NoAction
            }
            NodeState::SuspectUpstream => {
                self.patch_start_time = Some(Instant::now());
                let jitter_ms = rng.random_range(0..=self.rebind_jitter_max.as_millis() as u64);
                self.rebind_jitter = Duration::from_millis(jitter_ms);
                self.req_state_count = 0;
                self.last_req_state_sent = None;
                self.transition_to(NodeState::Patching);
                TickOutcome::SendReqStateNow
            }
            NodeState::Patching => {
                let start = self.patch_start_time.expect("patch_start_time set on entry");
                if start.elapsed() > self.patch_to_rebind_threshold + self.rebind_jitter {
                    self.transition_to(NodeState::Rebinding);
                    return TickOutcome::SendRebindRequest;
                }
                if self.should_send_req_state() {
                    TickOutcome::SendReqStateNow
                } else {
                    TickOutcome::NoAction
                }
            }
            NodeState::Rebinding | NodeState::WaitingForHost => TickOutcome::NoAction,
        }
    }

    fn should_send_req_state(&self) -> bool {
        match self.last_req_state_sent {
            None => true,
            Some(last) => last.elapsed() >= ReqStatePacing::min_spacing(self.req_state_count),
        }
    }

    /// Record that a `REQ_STATE` was just sent; advances the pacing counter.
    pub fn record_req_state_sent(&mut self) {
        self.last_req_state_sent = Some(Instant::now());
        self.req_state_count += 1;
    }

    /// `REBINDING -> WAITING_FOR_HOST` once the parent connection is
    /// observed closed (the only transition allowed without `is_attached`).
    pub fn on_parent_link_closed_while_rebinding(&mut self) {
        if self.state == NodeState::Rebinding {
            self.is_attached = false;
            self.transition_to(NodeState::WaitingForHost);
        }
    }

    /// `WAITING_FOR_HOST -> NORMAL` on a successful `REBIND_ASSIGN` re-attach.
    pub fn on_rebind_succeeded(&mut self) {
        self.mark_attached();
    }

    fn transition_to(&mut self, new: NodeState) {
        tracing::info!(from = ?self.state, to = ?new, "node state transition");
        self.state = new;
        self.state_entered = Instant::now();
    }

    #[cfg(test)]
    fn force_state(&mut self, state: NodeState) {
        self.state = state;
        self.state_entered = Instant::now();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    NoAction,
    SendReqStateNow,
    SendRebindRequest,
}
