/// In-process mesh transport for tests and single-process clusters.
pub mod memory;
/// Length-prefixed bincode-over-TCP peer transport.
pub mod tcp;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{broadcast, oneshot};

use crate::ring::{MemberState, NodeId};

/// Requests accepted from peers. Join traffic is local-only and never
/// carried on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum PeerRequest {
    /// Fetch the peer's full membership state.
    State,
    /// Deliver a membership state for reconciliation.
    Gossip(MemberState),
    /// Liveness probe.
    Ping,
}

/// Replies produced for [`PeerRequest`]s.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum PeerReply {
    /// Full membership state of the responding node.
    State(MemberState),
    /// Gossip accepted; the sender's state is current.
    Ok,
    /// The responder holds a state the sender should adopt.
    NewState(MemberState),
    /// Liveness probe acknowledgement.
    Pong,
}

/// Reachability transition reported by the liveness monitor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LivenessEvent {
    /// Peer became reachable.
    Up(NodeId),
    /// Peer stopped responding.
    Down(NodeId),
}

/// Inbound peer request delivered into the service mailbox. Calls carry a
/// reply channel; casts do not.
#[derive(Debug)]
pub struct InboundRequest {
    /// The peer's request.
    pub request: PeerRequest,
    /// Reply channel, present only for synchronous calls.
    pub reply: Option<oneshot::Sender<PeerReply>>,
}

/// Errors raised by peer transports.
#[derive(Debug, Error)]
pub enum TransportError {
    /// No address is known for the peer.
    #[error("unknown peer {0}")]
    UnknownPeer(NodeId),
    /// The peer is currently unreachable.
    #[error("peer {0} unreachable")]
    Unreachable(NodeId),
    /// The peer did not answer within the call timeout.
    #[error("call to peer {0} timed out")]
    Timeout(NodeId),
    /// The peer replied with a payload that does not match the request.
    #[error("unexpected reply from peer {0}")]
    UnexpectedReply(NodeId),
    /// Encoded payload exceeded the frame size limit.
    #[error("message too large: {0} bytes")]
    MessageTooLarge(usize),
    /// Frame encode/decode failure.
    #[error("codec error: {0}")]
    Codec(String),
    /// The local request sink is gone.
    #[error("transport unavailable")]
    Unavailable,
    /// Underlying network I/O failure.
    #[error("transport i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Point-to-point RPC and liveness capabilities the membership service
/// depends on.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Sends `request` and awaits the peer's reply, bounded by `timeout`.
    async fn call(
        &self,
        peer: &NodeId,
        request: PeerRequest,
        timeout: Duration,
    ) -> Result<PeerReply, TransportError>;

    /// Fire-and-forget delivery.
    async fn cast(&self, peer: &NodeId, request: PeerRequest) -> Result<(), TransportError>;

    /// Forces a liveness probe; `true` when the peer answered.
    async fn ping(&self, peer: &NodeId) -> bool;

    /// Peers currently believed reachable.
    fn up_nodes(&self) -> Vec<NodeId>;

    /// Subscribe to up/down transitions.
    fn subscribe(&self) -> broadcast::Receiver<LivenessEvent>;
}
