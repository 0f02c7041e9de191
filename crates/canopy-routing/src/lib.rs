//! # canopy-routing
//!
//! Topology aggregation (leaves → root) and the downstream/upstream Router:
//! explicit route-vector forwarding with `descendantToNextHop` fallback and
//! parent-fallback-as-last-resort, plus the drop rules in §4.3.

pub mod router;
pub mod topology;

pub use router::{decide_route, host_initial_route, DropReason, IncomingLink, RouteDecision};
pub use topology::{is_stale, HostTopology, NodeTopology, TopologyEntry};
