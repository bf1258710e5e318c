use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::clock::VectorClock;
use crate::config::MembershipConfig;
use crate::error::MembershipError;

/// Option key under which a node advertises extra partition responsibilities.
pub const HINTS_KEY: &str = "hints";

/// Opaque, globally unique identifier of a cluster node.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    /// Creates an identifier from any string-like value.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for NodeId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Value stored under a node option key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum OptionValue {
    /// Free-form scalar option.
    Text(String),
    /// Ordered list option (e.g. partition hints).
    List(Vec<String>),
}

/// Per-node option map. `BTreeMap` keeps the derived entry order total and
/// deterministic, which the ring merge tiebreak depends on.
pub type Options = BTreeMap<String, OptionValue>;

/// One slot of the membership ring.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeEntry {
    /// 1-based ring position assigned at join time. Position 0 is a legacy
    /// init sentinel and never survives normalization.
    pub position: u64,
    /// Node occupying the slot.
    pub node: NodeId,
    /// Advertised node options.
    pub options: Options,
}

impl NodeEntry {
    /// Creates an entry with explicit options.
    pub fn new(position: u64, node: NodeId, options: Options) -> Self {
        Self {
            position,
            node,
            options,
        }
    }

    /// Creates an entry with no options.
    pub fn bare(position: u64, node: NodeId) -> Self {
        Self::new(position, node, Options::new())
    }

    /// Creates an entry advertising partition hints.
    pub fn with_hints(position: u64, node: NodeId, hints: Vec<String>) -> Self {
        let mut options = Options::new();
        options.insert(HINTS_KEY.to_string(), OptionValue::List(hints));
        Self::new(position, node, options)
    }

    /// Partitions this node additionally takes responsibility for.
    #[must_use]
    pub fn hints(&self) -> Option<&[String]> {
        match self.options.get(HINTS_KEY) {
            Some(OptionValue::List(hints)) => Some(hints),
            _ => None,
        }
    }
}

/// Ordered member list, authoritative on each node.
///
/// Invariants: entries are sorted by position, positions and node ids are
/// unique, and no position-0 sentinel is present.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Ring {
    entries: Vec<NodeEntry>,
}

impl Ring {
    /// Creates an empty ring.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a normalized ring from raw entries.
    #[must_use]
    pub fn from_entries(entries: Vec<NodeEntry>) -> Self {
        let mut ring = Self { entries };
        ring.normalize();
        ring
    }

    /// Entries in position order.
    #[must_use]
    pub fn entries(&self) -> &[NodeEntry] {
        &self.entries
    }

    /// Node ids in position order.
    #[must_use]
    pub fn node_ids(&self) -> Vec<NodeId> {
        self.entries.iter().map(|entry| entry.node.clone()).collect()
    }

    /// Returns `true` when `node` occupies a slot.
    #[must_use]
    pub fn contains(&self, node: &NodeId) -> bool {
        self.entries.iter().any(|entry| &entry.node == node)
    }

    /// Entry occupied by `node`, if any.
    #[must_use]
    pub fn entry_of(&self, node: &NodeId) -> Option<&NodeEntry> {
        self.entries.iter().find(|entry| &entry.node == node)
    }

    /// Number of members.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` when no member is present.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Rejects an entry that would collide with an occupied slot. The error
    /// names the occupied position, distinguishing a re-added node from a
    /// position clash between different nodes.
    pub(crate) fn check_new_entry(&self, entry: &NodeEntry) -> Result<(), MembershipError> {
        if let Some(existing) = self
            .entries
            .iter()
            .find(|occupied| occupied.position == entry.position)
        {
            return Err(if existing.node == entry.node {
                MembershipError::NodeExistsAtPosition(entry.position)
            } else {
                MembershipError::PositionExists(entry.position)
            });
        }
        if let Some(existing) = self.entry_of(&entry.node) {
            // a node occupies at most one slot
            return Err(MembershipError::NodeExistsAtPosition(existing.position));
        }
        Ok(())
    }

    /// Adds an entry and restores position order.
    pub(crate) fn push(&mut self, entry: NodeEntry) {
        self.entries.push(entry);
        self.normalize();
    }

    /// Removes `node`'s entry, returning it when present.
    pub(crate) fn remove(&mut self, node: &NodeId) -> Option<NodeEntry> {
        let index = self.entries.iter().position(|entry| &entry.node == node)?;
        Some(self.entries.remove(index))
    }

    /// Drops position-0 sentinels, sorts, and removes exact duplicates.
    fn normalize(&mut self) {
        self.entries.retain(|entry| entry.position != 0);
        self.entries.sort_unstable();
        self.entries.dedup();
    }

    /// Deterministic merge of two divergent rings: both sides are
    /// normalized, an empty side loses, and otherwise the lexicographically
    /// smaller ring wins. Both ends of a concurrent exchange compute the
    /// same winner.
    #[must_use]
    pub fn merged(remote: &Self, local: &Self) -> Self {
        let mut remote = remote.clone();
        remote.normalize();
        let mut local = local.clone();
        local.normalize();
        if remote.is_empty() {
            return local;
        }
        if local.is_empty() {
            return remote;
        }
        if remote <= local { remote } else { local }
    }
}

/// Full membership state of one node: the unit of durability and of gossip
/// exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemberState {
    /// Causal history of ring mutations.
    pub clock: VectorClock,
    /// The member ring.
    pub ring: Ring,
    /// Configuration the owning service was started with.
    pub args: MembershipConfig,
}

impl MemberState {
    /// Creates the empty state a node starts from.
    #[must_use]
    pub fn new(args: MembershipConfig) -> Self {
        Self {
            clock: VectorClock::new(),
            ring: Ring::new(),
            args,
        }
    }

    /// Clock-and-ring equality used to group peers into agreement sets;
    /// boot arguments are deliberately excluded.
    #[must_use]
    pub fn same_view(&self, other: &Self) -> bool {
        self.clock.equals(&other.clock) && self.ring == other.ring
    }

    /// Deterministic resolution of two concurrent states: clocks take the
    /// pointwise maximum, rings resolve via [`Ring::merged`].
    #[must_use]
    pub fn merged(remote: &Self, local: &Self) -> Self {
        Self {
            clock: local.clock.clone().merged(&remote.clock),
            ring: Ring::merged(&remote.ring, &local.ring),
            args: local.args.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn entry(position: u64, node: &str) -> NodeEntry {
        NodeEntry::bare(position, NodeId::from(node))
    }

    #[test]
    fn normalization_drops_sentinels_and_sorts() {
        let ring = Ring::from_entries(vec![
            entry(2, "b"),
            entry(0, "legacy"),
            entry(1, "a"),
            entry(1, "a"),
        ]);
        let positions: Vec<u64> = ring.entries().iter().map(|e| e.position).collect();
        assert_eq!(positions, vec![1, 2]);
        assert!(!ring.contains(&NodeId::from("legacy")));
    }

    #[test]
    fn check_rejects_position_clash() {
        let ring = Ring::from_entries(vec![entry(1, "a")]);
        let err = ring.check_new_entry(&entry(1, "b")).unwrap_err();
        assert!(matches!(err, MembershipError::PositionExists(1)));
        assert_eq!(err.to_string(), "position_exists_1");
    }

    #[test]
    fn check_rejects_readded_node() {
        let ring = Ring::from_entries(vec![entry(1, "a")]);
        let err = ring.check_new_entry(&entry(1, "a")).unwrap_err();
        assert!(matches!(err, MembershipError::NodeExistsAtPosition(1)));
        assert_eq!(err.to_string(), "node_exists_at_position_1");
    }

    #[test]
    fn check_rejects_node_moving_slots() {
        let ring = Ring::from_entries(vec![entry(1, "a")]);
        let err = ring.check_new_entry(&entry(2, "a")).unwrap_err();
        assert!(matches!(err, MembershipError::NodeExistsAtPosition(1)));
    }

    #[test]
    fn merge_prefers_the_smaller_ring() {
        let a = Ring::from_entries(vec![entry(1, "a"), entry(2, "b")]);
        let b = Ring::from_entries(vec![entry(1, "a"), entry(3, "b")]);
        assert_eq!(Ring::merged(&a, &b), a);
        assert_eq!(Ring::merged(&b, &a), a);
    }

    #[test]
    fn merge_with_empty_side_keeps_the_other() {
        let a = Ring::from_entries(vec![entry(1, "a")]);
        assert_eq!(Ring::merged(&Ring::new(), &a), a);
        assert_eq!(Ring::merged(&a, &Ring::new()), a);
    }

    #[test]
    fn hints_accessor_reads_the_list_option() {
        let entry = NodeEntry::with_hints(1, NodeId::from("a"), vec!["p0".into(), "p3".into()]);
        assert_eq!(entry.hints(), Some(&["p0".to_string(), "p3".to_string()][..]));
        assert_eq!(NodeEntry::bare(1, NodeId::from("a")).hints(), None);

        // a scalar under the hints key is not a hint list
        let mut odd = Options::new();
        odd.insert(HINTS_KEY.to_string(), OptionValue::Text("p0".to_string()));
        assert_eq!(NodeEntry::new(2, NodeId::from("b"), odd).hints(), None);
    }

    #[test]
    fn entry_order_breaks_ties_on_options() {
        let mut tagged = Options::new();
        tagged.insert("zone".to_string(), OptionValue::Text("east".to_string()));
        let plain = NodeEntry::bare(1, NodeId::from("a"));
        let with_option = NodeEntry::new(1, NodeId::from("a"), tagged.clone());
        assert!(plain < with_option);

        let mut other = Options::new();
        other.insert("zone".to_string(), OptionValue::Text("west".to_string()));
        let east = NodeEntry::new(1, NodeId::from("a"), tagged);
        let west = NodeEntry::new(1, NodeId::from("a"), other);
        assert!(east < west);
    }

    fn arb_options() -> impl Strategy<Value = Options> {
        prop::collection::btree_map(
            "[a-z]{2,5}",
            prop_oneof![
                "[a-z]{1,4}".prop_map(OptionValue::Text),
                prop::collection::vec("[a-z]{1,3}", 0..3).prop_map(OptionValue::List),
            ],
            0..3,
        )
    }

    fn arb_ring() -> impl Strategy<Value = Ring> {
        prop::collection::btree_map(0u64..8, arb_options(), 0..6).prop_map(|slots| {
            let entries = slots
                .into_iter()
                .map(|(position, options)| {
                    NodeEntry::new(position, NodeId::from(format!("n{position}")), options)
                })
                .collect();
            Ring::from_entries(entries)
        })
    }

    proptest! {
        #[test]
        fn merge_is_commutative(a in arb_ring(), b in arb_ring()) {
            prop_assert_eq!(Ring::merged(&a, &b), Ring::merged(&b, &a));
        }

        #[test]
        fn merge_is_idempotent(a in arb_ring()) {
            prop_assert_eq!(Ring::merged(&a, &a), a);
        }

        #[test]
        fn merge_output_is_normalized(a in arb_ring(), b in arb_ring()) {
            let merged = Ring::merged(&a, &b);
            let positions: Vec<u64> = merged.entries().iter().map(|e| e.position).collect();
            let mut sorted = positions.clone();
            sorted.sort_unstable();
            sorted.dedup();
            prop_assert_eq!(&positions, &sorted);
            prop_assert!(!positions.contains(&0));
        }
    }
}
