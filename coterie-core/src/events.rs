use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::trace;

use crate::ring::NodeId;

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Membership transitions published to local subscribers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MembershipEvent {
    /// A node was added to the ring.
    NodeJoin(NodeId),
    /// A node departed (or was replaced out of) the ring.
    NodeLeave(NodeId),
    /// A ring member became reachable.
    NodeUp(NodeId),
    /// A peer became unreachable.
    NodeDown(NodeId),
}

impl MembershipEvent {
    /// Node the event is about.
    #[must_use]
    pub fn node(&self) -> &NodeId {
        match self {
            Self::NodeJoin(node)
            | Self::NodeLeave(node)
            | Self::NodeUp(node)
            | Self::NodeDown(node) => node,
        }
    }
}

/// Local fan-out bus for membership events. Sends are lossy when nobody
/// listens.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<MembershipEvent>,
}

impl EventBus {
    /// Creates a bus with a bounded backlog per subscriber.
    #[must_use]
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { tx }
    }

    /// Subscribe to membership events.
    pub fn subscribe(&self) -> broadcast::Receiver<MembershipEvent> {
        self.tx.subscribe()
    }

    pub(crate) fn publish(&self, event: MembershipEvent) {
        trace!(?event, "membership event");
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
