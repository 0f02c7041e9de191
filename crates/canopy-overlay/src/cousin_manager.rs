//! Cousin Manager (§4.6): lateral, same-depth recovery sources disjoint
//! from a suspect upstream branch.

use canopy_core::PeerId;
use canopy_routing::NodeTopology;
use rand::seq::SliceRandom;
use rand::Rng;

/// Candidates found while answering a `REQ_COUSINS` request, grouped by the
/// direct child ("uncle branch") each sits under, so a later shuffle can
/// prefer disjoint branches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CousinCandidate {
    pub peer: PeerId,
    pub under_branch: PeerId,
}

/// Compute the `COUSINS` reply candidates for a `REQ_COUSINS{requesterDepth,
/// desiredCount}` arriving from requester `requester_branch` (the direct
/// child of `self` that the request traversed, used to exclude the
/// requester's own subtree).
pub fn find_cousin_candidates(
    topology: &NodeTopology,
    own_depth: u32,
    requester_depth: u32,
    requester_branch: &PeerId,
    desired_count: usize,
    rng: &mut impl Rng,
) -> Vec<PeerId> {
    let requester_hops = requester_depth.saturating_sub(own_depth);
    let mut grouped: Vec<CousinCandidate> = Vec::new();

    for child in topology.all_child_ids() {
        if &child == requester_branch {
            continue;
        }
        if requester_hops == 1 {
            grouped.push(CousinCandidate {
                peer: child.clone(),
                under_branch: child.clone(),
            });
        }
        for d in topology.child_descendants(&child) {
            if d.hops == requester_hops {
                grouped.push(CousinCandidate {
                    peer: d.id,
                    under_branch: child.clone(),
                });
            }
        }
    }

    pick_one_per_branch_then_shuffle(grouped, desired_count, rng)
}

/// Group candidates by branch, pick one random candidate per branch
/// (preferring disjoint uncle branches), shuffle, and truncate.
fn pick_one_per_branch_then_shuffle(
    candidates: Vec<CousinCandidate>,
    desired_count: usize,
    rng: &mut impl Rng,
) -> Vec<PeerId> {
    use std::collections::HashMap;
    let mut by_branch: HashMap<PeerId, Vec<PeerId>> = HashMap::new();
    for c in candidates {
        by_branch.entry(c.under_branch).or_default().push(c.peer);
    }

    let mut picked: Vec<PeerId> = by_branch
        .into_values()
        .filter_map(|mut peers| {
            if peers.is_empty() {
                None
            } else {
                let idx = rng.random_range(0..peers.len());
                Some(peers.swap_remove(idx))
            }
        })
        .collect();

    picked.shuffle(rng);
    picked.truncate(desired_count);
    picked
}
