//! Router: explicit route-vector forwarding plus fallback and drop rules (§4.3)

use canopy_core::{Destination, Envelope, PeerId};

use crate::topology::NodeTopology;

/// Which link a message arrived on, needed to apply the right forwarding
/// rule (parent vs. child vs. cousin).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IncomingLink {
    Parent,
    Child,
    Cousin,
}

/// What the Router decided to do with an inbound message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteDecision {
    /// Process locally (we are the destination, or the message is link-local)
    ProcessLocally,
    /// Forward to a specific connected peer
    ForwardTo(PeerId),
    /// Drop without processing or forwarding, for the given reason
    Drop(DropReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    GameIdMismatch,
    DuplicateMessage,
    Unroutable,
    CousinLinkNotARelay,
    DisallowedOnCousinLink,
}

/// Build the Host's initial downstream route: `[hostId, nextHop]`. When the
/// destination is itself a direct child, `next_hop` is that child.
pub fn host_initial_route(host_id: &PeerId, next_hop: &PeerId) -> Vec<PeerId> {
    vec![host_id.clone(), next_hop.clone()]
}

/// Core routing decision (§4.3). `own_id` is this peer; `local_topology` is
/// only consulted for the `descendantToNextHop` fallback, so Host callers
/// (which have no such map) may pass an empty [`NodeTopology`].
pub fn decide_route(
    envelope: &Envelope,
    own_id: &PeerId,
    incoming: IncomingLink,
    local_topology: &NodeTopology,
    parent: Option<&PeerId>,
    owned_children: &[PeerId],
) -> RouteDecision {
    if !envelope.body.allowed_on_cousin_link() && incoming == IncomingLink::Cousin {
        return RouteDecision::Drop(DropReason::DisallowedOnCousinLink);
    }

    let dest = match &envelope.dest {
        None => return RouteDecision::ProcessLocally, // link-local: RAIN, SUBTREE_STATUS
        Some(d) => d,
    };

    let is_self = matches!(dest, Destination::Peer(p) if p == own_id) || (dest.is_host() && parent.is_none());
    if is_self {
        return RouteDecision::ProcessLocally;
    }

    match incoming {
        IncomingLink::Cousin => RouteDecision::Drop(DropReason::CousinLinkNotARelay),
        IncomingLink::Child => {
            // Always forward up toward Host; Host-local processing was
            // already handled by `is_self` above when we have no parent.
            forward_to_parent_or_drop(parent)
        }
        IncomingLink::Parent => {
            if let Some(route) = &envelope.route {
                if let Some(pos) = route.iter().position(|h| h == own_id) {
                    if let Some(next) = route.get(pos + 1) {
                        if owned_children.contains(next) {
                            return RouteDecision::ForwardTo(next.clone());
                        }
                    }
                }
            }
            if let Destination::Peer(p) = dest {
                if let Some(next_hop) = local_topology.descendant_to_next_hop(p) {
                    if owned_children.contains(&next_hop) {
                        return RouteDecision::ForwardTo(next_hop);
                    }
                }
            }
            forward_to_parent_or_drop(parent)
        }
    }
}

fn forward_to_parent_or_drop(parent: Option<&PeerId>) -> RouteDecision {
    match parent {
        Some(p) => RouteDecision::ForwardTo(p.clone()),
        None => RouteDecision::Drop(DropReason::Unroutable),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use canopy_core::{GameId, MessageBody};

    fn pid(s: &str) -> PeerId {
        PeerId::new(s).unwrap()
    }

    fn envelope(dest: Option<Destination>, route: Option<Vec<PeerId>>) -> Envelope {
        let mut env = Envelope::new(GameId::new("g").unwrap(), pid("src"), MessageBody::Ping);
        env.dest = dest;
        env.route = route;
        env
    }

    #[test]
    fn link_local_message_is_processed_locally() {
        let env = Envelope::new(GameId::new("g").unwrap(), pid("src"), MessageBody::Rain { rain_seq: 1 });
        let topo = NodeTopology::new();
        let parent = pid("parent");
        let decision = decide_route(&env, &pid("me"), IncomingLink::Parent, &topo, Some(&parent), &[]);
        assert_eq!(decision, RouteDecision::ProcessLocally);
    }

    #[test]
    fn follows_route_vector_to_next_hop() {
        let env = envelope(Some(Destination::Peer(pid("leaf"))), Some(vec![pid("root"), pid("me"), pid("child1")]));
        let topo = NodeTopology::new();
        let parent = pid("parent");
        let decision = decide_route(&env, &pid("me"), IncomingLink::Parent, &topo, Some(&parent), &[pid("child1")]);
        assert_eq!(decision, RouteDecision::ForwardTo(pid("child1")));
    }

    #[test]
    fn falls_back_to_descendant_table_when_route_missing() {
        let env = envelope(Some(Destination::Peer(pid("leaf"))), None);
        let topo = NodeTopology::new();
        topo.record_child_status(pid("child1"), 2, vec![canopy_core::DescendantInfo {
            id: pid("leaf"),
            hops: 1,
            free_slots: 1,
        }]);
        let parent = pid("parent");
        let decision = decide_route(&env, &pid("me"), IncomingLink::Parent, &topo, Some(&parent), &[pid("child1")]);
        assert_eq!(decision, RouteDecision::ForwardTo(pid("child1")));
    }

    #[test]
    fn unroutable_downstream_with_no_parent_is_dropped() {
        let env = envelope(Some(Destination::Peer(pid("leaf"))), None);
        let topo = NodeTopology::new();
        let decision = decide_route(&env, &pid("me"), IncomingLink::Parent, &topo, None, &[]);
        assert_eq!(decision, RouteDecision::Drop(DropReason::Unroutable));
    }

    #[test]
    fn cousin_link_drops_non_state_traffic() {
        let mut env = Envelope::new(GameId::new("g").unwrap(), pid("cousin"), MessageBody::Rain { rain_seq: 1 });
        env.dest = Some(Destination::Peer(pid("other")));
        let topo = NodeTopology::new();
        let parent = pid("parent");
        let decision = decide_route(&env, &pid("me"), IncomingLink::Cousin, &topo, Some(&parent), &[]);
        assert_eq!(decision, RouteDecision::Drop(DropReason::DisallowedOnCousinLink));
    }
}
