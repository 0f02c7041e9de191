//! Topology Aggregator (§4.2)
//!
//! Two distinct views, one per role: the Host keeps a flat map of every
//! descendant it has heard about via `SUBTREE_STATUS` reports bubbling up;
//! any Node keeps only its direct children's reported descendant lists and
//! derives a `descendant -> next-hop-child` lookup from them.

use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;

use canopy_core::{ChildStatus, DescendantInfo, MessageBody, PeerId, PeerState};

/// One entry in the Host's flat topology view
#[derive(Debug, Clone)]
pub struct TopologyEntry {
    pub next_hop: PeerId,
    pub depth: u32,
    pub free_slots: u32,
    pub last_seen: DateTime<Utc>,
    pub state: PeerState,
}

/// Host-side flat `peerId -> {nextHop, depth, freeSlots, lastSeen, state}` map
#[derive(Default)]
pub struct HostTopology {
    entries: DashMap<PeerId, TopologyEntry>,
}

impl HostTopology {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a `SUBTREE_STATUS` report from direct child `child_id`.
    ///
    /// The child itself is recorded at depth 1; each reported descendant is
    /// recorded at `1 + descendant.hops`, with `nextHop` always the direct
    /// child the report arrived from.
    pub fn apply_subtree_status(
        &self,
        child_id: &PeerId,
        child_free_slots: u32,
        descendants: &[DescendantInfo],
    ) {
        let now = Utc::now();
        self.entries.insert(
            child_id.clone(),
            TopologyEntry {
                next_hop: child_id.clone(),
                depth: 1,
                free_slots: child_free_slots,
                last_seen: now,
                state: PeerState::Ok,
            },
        );
        for d in descendants {
            self.entries.insert(
                d.id.clone(),
                TopologyEntry {
                    next_hop: child_id.clone(),
                    depth: 1 + d.hops,
                    free_slots: d.free_slots,
                    last_seen: now,
                    state: PeerState::Ok,
                },
            );
        }
    }

    pub fn entry(&self, peer: &PeerId) -> Option<TopologyEntry> {
        self.entries.get(peer).map(|e| e.clone())
    }

    /// Drop every entry routed through `next_hop` (its connection closed).
    pub fn evict_next_hop(&self, next_hop: &PeerId) {
        self.entries.retain(|_, v| &v.next_hop != next_hop);
    }

    /// Seed/redirect candidate selection (§4.1): filter to
    /// `freeSlots > 0 && depth < 4`, sort by (depth asc, freeSlots desc),
    /// weighted-shuffle so earlier (shallower/freer) entries have higher
    /// odds, then pad with direct children if short, capped at `max`.
    pub fn seed_candidates(&self, direct_children: &[PeerId], max: usize, rng: &mut impl rand::Rng) -> Vec<PeerId> {
        let mut candidates: Vec<(PeerId, u32, u32)> = self
            .entries
            .iter()
            .filter(|e| e.free_slots > 0 && e.depth < 4)
            .map(|e| (e.key().clone(), e.depth, e.free_slots))
            .collect();
        candidates.sort_by(|a, b| a.1.cmp(&b.1).then(b.2.cmp(&a.2)));

        let mut weighted = weighted_shuffle(candidates.into_iter().map(|(id, _, _)| id).collect(), rng);

        if weighted.len() < max.min(5) {
            let mut extra: Vec<PeerId> = direct_children
                .iter()
                .filter(|c| !weighted.contains(c))
                .cloned()
                .collect();
            use rand::seq::SliceRandom;
            extra.shuffle(rng);
            weighted.extend(extra);
        }

        weighted.truncate(max);
        weighted
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Weighted shuffle where earlier positions in `ordered` are more likely to
/// stay near the front, avoiding hotspotting the single best candidate.
fn weighted_shuffle(ordered: Vec<PeerId>, rng: &mut impl rand::Rng) -> Vec<PeerId> {
    let mut remaining = ordered;
    let mut result = Vec::with_capacity(remaining.len());
    while !remaining.is_empty() {
        // Weight position i (0-based, earlier = heavier) as (n - i).
        let n = remaining.len();
        let weights: Vec<usize> = (0..n).map(|i| n - i).collect();
        let total: usize = weights.iter().sum();
        let mut pick = rng.random_range(0..total.max(1));
        let mut idx = 0;
        for (i, w) in weights.iter().enumerate() {
            if pick < *w {
                idx = i;
                break;
            }
            pick -= w;
        }
        result.push(remaining.remove(idx));
    }
    result
}

/// One node's knowledge of a direct child's reported subtree
#[derive(Default)]
pub struct NodeTopology {
    child_descendants: DashMap<PeerId, Vec<DescendantInfo>>,
    child_capacities: DashMap<PeerId, u32>,
}

impl NodeTopology {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_child_status(&self, child_id: PeerId, free_slots: u32, descendants: Vec<DescendantInfo>) {
        self.child_capacities.insert(child_id.clone(), free_slots);
        self.child_descendants.insert(child_id, descendants);
    }

    pub fn remove_child(&self, child_id: &PeerId) {
        self.child_descendants.remove(child_id);
        self.child_capacities.remove(child_id);
    }

    /// Derived `descendantId -> nextHopChildId` lookup.
    pub fn descendant_to_next_hop(&self, descendant: &PeerId) -> Option<PeerId> {
        for entry in self.child_descendants.iter() {
            if entry.value().iter().any(|d| &d.id == descendant) {
                return Some(entry.key().clone());
            }
        }
        None
    }

    pub fn child_free_slots(&self, child_id: &PeerId) -> Option<u32> {
        self.child_capacities.get(child_id).map(|e| *e)
    }

    pub fn child_descendants(&self, child_id: &PeerId) -> Vec<DescendantInfo> {
        self.child_descendants
            .get(child_id)
            .map(|e| e.value().clone())
            .unwrap_or_default()
    }

    pub fn all_child_ids(&self) -> Vec<PeerId> {
        self.child_descendants.iter().map(|e| e.key().clone()).collect()
    }

    /// Build the `SUBTREE_STATUS` this node should report to its own parent
    /// (§4.2): flatten every direct child plus every reported grandchild,
    /// bumping `hops` by one per level, and total `subtreeCount` as
    /// `1 + directChildren + sum(childDescendants)`.
    pub fn build_subtree_status(
        &self,
        last_rain_seq: u64,
        own_free_slots: u32,
        children: &[(PeerId, ChildStatus)],
    ) -> MessageBody {
        let mut descendants = Vec::new();
        let mut child_statuses = Vec::with_capacity(children.len());

        for (child_id, status) in children {
            descendants.push(DescendantInfo {
                id: child_id.clone(),
                hops: 1,
                free_slots: status.free_slots,
            });
            for grandchild in self.child_descendants(child_id) {
                descendants.push(DescendantInfo {
                    id: grandchild.id,
                    hops: grandchild.hops + 1,
                    free_slots: grandchild.free_slots,
                });
            }
            child_statuses.push(status.clone());
        }

        let subtree_count = 1 + children.len() as u64
            + children
                .iter()
                .map(|(id, _)| self.child_descendants(id).len() as u64)
                .sum::<u64>();

        MessageBody::SubtreeStatus {
            last_rain_seq,
            state: PeerState::Ok,
            children: child_statuses,
            subtree_count,
            descendants,
            free_slots: own_free_slots,
        }
    }
}

/// How stale a `lastSeen` timestamp may get before a Host topology entry is
/// considered worth a closer look (used by periodic housekeeping, not a hard
/// eviction — §4.2 notes the view may lag by up to one reporting interval).
pub fn is_stale(last_seen: DateTime<Utc>, max_age: Duration) -> bool {
    let age = Utc::now() - last_seen;
    age > chrono::Duration::from_std(max_age).unwrap_or(chrono::Duration::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use canopy_core::PeerId;

    fn pid(s: &str) -> PeerId {
        PeerId::new(s).unwrap()
    }

    #[test]
    fn host_topology_records_child_and_descendants_at_correct_depth() {
        let topo = HostTopology::new();
        topo.apply_subtree_status(
            &pid("c1"),
            3,
            &[DescendantInfo { id: pid("l"), hops: 1, free_slots: 2 }],
        );

        let c1 = topo.entry(&pid("c1")).unwrap();
        assert_eq!(c1.depth, 1);
        assert_eq!(c1.next_hop, pid("c1"));

        let l = topo.entry(&pid("l")).unwrap();
        assert_eq!(l.depth, 2);
        assert_eq!(l.next_hop, pid("c1"));
    }

    #[test]
    fn evict_next_hop_drops_all_entries_routed_through_it() {
        let topo = HostTopology::new();
        topo.apply_subtree_status(
            &pid("c1"),
            3,
            &[DescendantInfo { id: pid("l"), hops: 1, free_slots: 2 }],
        );
        topo.evict_next_hop(&pid("c1"));
        assert!(topo.entry(&pid("c1")).is_none());
        assert!(topo.entry(&pid("l")).is_none());
    }

    #[test]
    fn node_topology_derives_next_hop_for_grandchildren() {
        let topo = NodeTopology::new();
        topo.record_child_status(
            pid("c1"),
            3,
            vec![DescendantInfo { id: pid("gc"), hops: 1, free_slots: 1 }],
        );
        assert_eq!(topo.descendant_to_next_hop(&pid("gc")), Some(pid("c1")));
        assert_eq!(topo.descendant_to_next_hop(&pid("unknown")), None);
    }

    #[test]
    fn subtree_status_count_matches_formula() {
        let topo = NodeTopology::new();
        topo.record_child_status(
            pid("c1"),
            2,
            vec![DescendantInfo { id: pid("gc1"), hops: 1, free_slots: 1 }],
        );
        let children = vec![(
            pid("c1"),
            ChildStatus {
                id: pid("c1"),
                state: PeerState::Ok,
                last_rain_seq: 5,
                free_slots: 2,
            },
        )];
        let body = topo.build_subtree_status(5, 1, &children);
        match body {
            MessageBody::SubtreeStatus { subtree_count, descendants, .. } => {
                // self(1) + direct children(1) + descendants(1 grandchild)
                assert_eq!(subtree_count, 3);
                assert_eq!(descendants.len(), 2); // c1 itself (hops=1) + gc1 (hops=2)
                let gc = descendants.iter().find(|d| d.id == pid("gc1")).unwrap();
                assert_eq!(gc.hops, 2);
            }
            _ => panic!("expected SubtreeStatus"),
        }
    }

    #[test]
    fn seed_candidates_respects_cap_and_depth_filter() {
        let topo = HostTopology::new();
        for (name, depth, free) in [("a", 1, 2), ("b", 2, 1), ("deep", 5, 5)] {
            topo.apply_subtree_status(
                &pid("root_child"),
                5,
                &[DescendantInfo { id: pid(name), hops: depth - 1, free_slots: free }],
            );
        }
        let mut rng = rand::rng();
        let seeds = topo.seed_candidates(&[pid("root_child")], 10, &mut rng);
        assert!(!seeds.iter().any(|s| s == &pid("deep")), "depth >= 4 must be filtered out");
    }
}
