use thiserror::Error;

use crate::ring::NodeId;
use crate::store::StoreError;
use crate::transport::TransportError;

/// Errors surfaced by membership operations.
#[derive(Debug, Error)]
pub enum MembershipError {
    /// The same node already occupies that ring position.
    #[error("node_exists_at_position_{0}")]
    NodeExistsAtPosition(u64),
    /// A different node already occupies that ring position.
    #[error("position_exists_{0}")]
    PositionExists(u64),
    /// The named node is absent from the consulted ring.
    #[error("node {0} not found in ring")]
    NodeNotFound(NodeId),
    /// A join was requested with an unrecognised type.
    #[error("unknown_join_type: {0}")]
    UnknownJoinType(String),
    /// `reset` is only honoured in test mode.
    #[error("not_reset")]
    NotReset,
    /// A peer answered a gossip round with an unexpected payload.
    #[error("unknown_gossip_response: {0}")]
    UnknownGossipResponse(String),
    /// Peer RPC failed.
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// Snapshot persistence failed.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// The service loop is no longer running.
    #[error("membership service unavailable")]
    ServiceUnavailable,
}
