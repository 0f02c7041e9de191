//! # canopy-overlay
//!
//! The overlay control plane: Join/Attach negotiation (§4.1), the per-node
//! state machine (§4.5), the cousin manager (§4.6), and the recovery engine
//! (§4.7). Topology aggregation and routing live in `canopy-routing`;
//! sequencing and caching live in `canopy-replication`. This crate is the
//! seam where those two meet the churn-handling logic that is unique to a
//! Node.

pub mod cousin_manager;
pub mod error;
pub mod negotiator;
pub mod recovery_engine;
pub mod state_machine;

pub use cousin_manager::{find_cousin_candidates, CousinCandidate};
pub use error::{OverlayError, OverlayResult};
pub use negotiator::{
    host_has_spare_capacity, host_seed_list, node_has_spare_capacity, redirect_candidates, JoinAttachState,
};
pub use recovery_engine::{
    apply_state_response, build_rebind_request, build_req_state, build_state_response, HostFallbackPacer,
    StateApplyOutcome,
};
pub use state_machine::{NodeState, NodeStateMachine, ReqStatePacing, TickOutcome};
