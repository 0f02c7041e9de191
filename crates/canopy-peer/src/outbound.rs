//! A decision to send one envelope to one directly-connected peer
//!
//! Both [`crate::host::HostCore`] and [`crate::node::NodeCore`] are pure
//! state machines: handling an inbound envelope or firing a timer returns a
//! list of [`Outbound`] sends rather than performing I/O itself. The peer
//! event loop (`crate::run`) is the only place that touches a
//! [`canopy_core::Transport`].

use canopy_core::{Envelope, PeerId};

/// One envelope to hand to the transport, addressed to a directly connected
/// peer (parent, child, or cousin — never a multi-hop destination; that
/// resolution already happened via the Router).
#[derive(Debug, Clone)]
pub struct Outbound {
    pub to: PeerId,
    pub envelope: Envelope,
}

impl Outbound {
    pub fn new(to: PeerId, envelope: Envelope) -> Self {
        Self { to, envelope }
    }
}
