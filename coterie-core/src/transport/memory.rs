use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time;

use super::{InboundRequest, LivenessEvent, PeerReply, PeerRequest, Transport, TransportError};
use crate::ring::NodeId;

const INBOUND_CAPACITY: usize = 64;
const LIVENESS_CAPACITY: usize = 256;

struct MeshNode {
    inbound: mpsc::Sender<InboundRequest>,
    up: bool,
}

struct MeshInner {
    nodes: RwLock<HashMap<NodeId, MeshNode>>,
    liveness: broadcast::Sender<LivenessEvent>,
}

/// In-process mesh connecting transports by node id. Nodes register with
/// [`InProcessMesh::join`]; reachability can be toggled to simulate
/// partitions.
#[derive(Clone)]
pub struct InProcessMesh {
    inner: Arc<MeshInner>,
}

impl InProcessMesh {
    /// Creates an empty mesh.
    #[must_use]
    pub fn new() -> Self {
        let (liveness, _) = broadcast::channel(LIVENESS_CAPACITY);
        Self {
            inner: Arc::new(MeshInner {
                nodes: RwLock::new(HashMap::new()),
                liveness,
            }),
        }
    }

    /// Registers `node`, returning its transport plus the inbound queue its
    /// service loop consumes. Re-joining under the same id replaces the
    /// previous registration.
    pub fn join(&self, node: NodeId) -> (InProcessTransport, mpsc::Receiver<InboundRequest>) {
        let (tx, rx) = mpsc::channel(INBOUND_CAPACITY);
        self.inner.nodes.write().insert(
            node.clone(),
            MeshNode {
                inbound: tx,
                up: true,
            },
        );
        let _ = self.inner.liveness.send(LivenessEvent::Up(node.clone()));
        (
            InProcessTransport {
                mesh: Arc::clone(&self.inner),
                local: node,
            },
            rx,
        )
    }

    /// Marks `node` unreachable for every mesh member.
    pub fn set_down(&self, node: &NodeId) {
        let changed = {
            let mut nodes = self.inner.nodes.write();
            match nodes.get_mut(node) {
                Some(entry) if entry.up => {
                    entry.up = false;
                    true
                }
                _ => false,
            }
        };
        if changed {
            let _ = self.inner.liveness.send(LivenessEvent::Down(node.clone()));
        }
    }

    /// Restores reachability for `node`.
    pub fn set_up(&self, node: &NodeId) {
        let changed = {
            let mut nodes = self.inner.nodes.write();
            match nodes.get_mut(node) {
                Some(entry) if !entry.up => {
                    entry.up = true;
                    true
                }
                _ => false,
            }
        };
        if changed {
            let _ = self.inner.liveness.send(LivenessEvent::Up(node.clone()));
        }
    }
}

impl Default for InProcessMesh {
    fn default() -> Self {
        Self::new()
    }
}

/// One node's view of an [`InProcessMesh`].
pub struct InProcessTransport {
    mesh: Arc<MeshInner>,
    local: NodeId,
}

impl InProcessTransport {
    fn sender_for(&self, peer: &NodeId) -> Result<mpsc::Sender<InboundRequest>, TransportError> {
        let nodes = self.mesh.nodes.read();
        match nodes.get(peer) {
            Some(node) if node.up => Ok(node.inbound.clone()),
            Some(_) => Err(TransportError::Unreachable(peer.clone())),
            None => Err(TransportError::UnknownPeer(peer.clone())),
        }
    }
}

#[async_trait]
impl Transport for InProcessTransport {
    async fn call(
        &self,
        peer: &NodeId,
        request: PeerRequest,
        timeout: Duration,
    ) -> Result<PeerReply, TransportError> {
        let sender = self.sender_for(peer)?;
        let (reply_tx, reply_rx) = oneshot::channel();
        sender
            .send(InboundRequest {
                request,
                reply: Some(reply_tx),
            })
            .await
            .map_err(|_| TransportError::Unreachable(peer.clone()))?;
        match time::timeout(timeout, reply_rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(TransportError::Unreachable(peer.clone())),
            Err(_) => Err(TransportError::Timeout(peer.clone())),
        }
    }

    async fn cast(&self, peer: &NodeId, request: PeerRequest) -> Result<(), TransportError> {
        let sender = self.sender_for(peer)?;
        sender
            .send(InboundRequest {
                request,
                reply: None,
            })
            .await
            .map_err(|_| TransportError::Unreachable(peer.clone()))
    }

    async fn ping(&self, peer: &NodeId) -> bool {
        self.sender_for(peer).is_ok()
    }

    fn up_nodes(&self) -> Vec<NodeId> {
        self.mesh
            .nodes
            .read()
            .iter()
            .filter(|(id, node)| node.up && **id != self.local)
            .map(|(id, _)| id.clone())
            .collect()
    }

    fn subscribe(&self) -> broadcast::Receiver<LivenessEvent> {
        self.mesh.liveness.subscribe()
    }
}
