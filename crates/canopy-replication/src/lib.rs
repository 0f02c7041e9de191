//! # canopy-replication
//!
//! RAIN heartbeat and GAME_EVENT replication (§4.4): per-role sequence
//! state, the bounded event cache backing `STATE` responses, and the
//! pending-request registry backing `waitForAck`/`requestPayload`.

pub mod cache;
pub mod engine;
pub mod pending;

pub use cache::{CachedEvent, EventCache};
pub use engine::{HostReplicationState, NodeReplicationState};
pub use pending::PendingRegistry;
