use crate::clock::CausalOrdering;
use crate::ring::{MemberState, NodeId, Ring};

/// Outcome of weighing a remote state against the local one.
#[derive(Debug)]
pub enum GossipDecision {
    /// States agree; acknowledge and stop.
    InSync,
    /// Remote is behind; offer it the local state.
    RemoteBehind,
    /// Remote is ahead; adopt its state.
    AdoptRemote,
    /// Histories diverged; both sides converge on the merged state.
    AdoptMerged(MemberState),
}

/// Classifies inbound gossip by the causal relation of the two clocks.
#[must_use]
pub fn classify(remote: &MemberState, local: &MemberState) -> GossipDecision {
    match remote.clock.compare(&local.clock) {
        CausalOrdering::Equal => GossipDecision::InSync,
        CausalOrdering::Less => GossipDecision::RemoteBehind,
        CausalOrdering::Greater => GossipDecision::AdoptRemote,
        CausalOrdering::Concurrent => {
            GossipDecision::AdoptMerged(MemberState::merged(remote, local))
        }
    }
}

/// Picks the gossip target: the first ring member after `local` (treating
/// the ring as circular) that is present in `up`. Returns `None` when no
/// other member is reachable.
#[must_use]
pub fn next_up_node(local: &NodeId, ring: &Ring, up: &[NodeId]) -> Option<NodeId> {
    let ids = ring.node_ids();
    if ids.is_empty() {
        return None;
    }
    let start = ids
        .iter()
        .position(|id| id == local)
        .map_or(0, |index| index + 1);
    ids.iter()
        .cycle()
        .skip(start)
        .take(ids.len())
        .find(|id| *id != local && up.contains(id))
        .cloned()
}
