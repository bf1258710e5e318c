//! Coterie core: cluster-membership service for a distributed database.
//!
//! Every node runs one membership service owning an ordered member ring and
//! a vector clock. The ring evolves through join/replace/leave, is
//! snapshotted to disk, and converges across the cluster by peer-to-peer
//! gossip with deterministic last-writer-wins conflict resolution.

/// Vector clocks ordering membership states causally.
pub mod clock;
/// Declarative node configuration.
pub mod config;
/// Error types surfaced by membership operations.
pub mod error;
/// Local membership event fan-out.
pub mod events;
/// Gossip peer selection and reconciliation rules.
pub mod gossip;
/// Node, ring, and state data model with deterministic merge.
pub mod ring;
/// Single-writer service loop and the join protocol.
pub mod service;
/// Durable timestamped state snapshots.
pub mod store;
/// Peer RPC and liveness capabilities (trait, TCP and in-process impls).
pub mod transport;

pub use clock::{CausalOrdering, VectorClock};
pub use config::{MembershipConfig, NetworkConfig, SeedPeer, TimeoutConfig};
pub use error::MembershipError;
pub use events::{EventBus, MembershipEvent};
pub use gossip::GossipDecision;
pub use ring::{HINTS_KEY, MemberState, NodeEntry, NodeId, OptionValue, Options, Ring};
pub use service::{ClusterStates, JoinKind, JoinRequest, MembershipService, StateGroup};
pub use store::{SnapshotStore, StoreError};
pub use transport::{
    InboundRequest, LivenessEvent, PeerReply, PeerRequest, Transport, TransportError,
};
