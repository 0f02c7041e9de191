//! # canopy-peer
//!
//! Host and Node peer loops: [`host::HostCore`]/[`node::NodeCore`] are pure
//! protocol state machines, [`handle::HostHandle`]/[`handle::NodeHandle`]
//! wrap them with the background task that is the only thing in this
//! workspace allowed to touch a [`canopy_core::Transport`] at runtime (§6.2,
//! §6.3).

pub mod error;
pub mod handle;
pub mod host;
pub mod node;
pub mod outbound;

pub use error::{PeerError, PeerResult};
pub use handle::{HostHandle, HostSnapshot, NodeHandle, NodeSnapshot, OverlayEvent};
pub use host::{HostCore, HostEffects, HostEvent};
pub use node::{NodeCore, NodeEffects, NodeEvent};
pub use outbound::Outbound;
