use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::clock::VectorClock;
use crate::config::MembershipConfig;
use crate::error::MembershipError;
use crate::events::{EventBus, MembershipEvent};
use crate::gossip::{self, GossipDecision};
use crate::ring::{MemberState, NodeEntry, NodeId, Options};
use crate::store::{SnapshotStore, StoreError};
use crate::transport::{
    InboundRequest, LivenessEvent, PeerReply, PeerRequest, Transport, TransportError,
};

const MAILBOX_CAPACITY: usize = 64;

/// Join flavours accepted by the admin surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinKind {
    /// Seed a fresh ring.
    Init,
    /// Enter an existing cluster.
    Join,
    /// Take over an existing member's slot.
    Replace,
    /// Depart the cluster.
    Leave,
}

impl FromStr for JoinKind {
    type Err = MembershipError;

    fn from_str(kind: &str) -> Result<Self, Self::Err> {
        match kind {
            "init" => Ok(Self::Init),
            "join" => Ok(Self::Join),
            "replace" => Ok(Self::Replace),
            "leave" => Ok(Self::Leave),
            other => Err(MembershipError::UnknownJoinType(other.to_string())),
        }
    }
}

impl fmt::Display for JoinKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Init => "init",
            Self::Join => "join",
            Self::Replace => "replace",
            Self::Leave => "leave",
        })
    }
}

/// Membership mutation submitted through [`MembershipService::join`].
#[derive(Debug, Clone)]
pub enum JoinRequest {
    /// Seed a fresh ring with a full member list.
    Init {
        /// Members of the new ring.
        entries: Vec<NodeEntry>,
    },
    /// Add entries to an existing cluster, bootstrapping from `ping`'s
    /// state.
    Join {
        /// New members.
        entries: Vec<NodeEntry>,
        /// Already-joined peer consulted for the current state.
        ping: NodeId,
    },
    /// Take over `old`'s slot, bootstrapping from `ping`'s state.
    Replace {
        /// Member being replaced.
        old: NodeId,
        /// Options advertised by the replacement.
        options: Options,
        /// Already-joined peer consulted for the current state.
        ping: NodeId,
    },
    /// Depart `node` from the ring.
    Leave {
        /// Departing member.
        node: NodeId,
    },
}

/// One agreement group within [`ClusterStates`].
#[derive(Debug, Clone)]
pub struct StateGroup {
    /// The view shared by this group.
    pub state: MemberState,
    /// Ring members reporting it.
    pub nodes: Vec<NodeId>,
}

/// Cluster-wide agreement snapshot returned by
/// [`MembershipService::states`].
#[derive(Debug, Clone, Default)]
pub struct ClusterStates {
    /// Ring members grouped by identical (clock, ring) views.
    pub groups: Vec<StateGroup>,
    /// Ring members that failed to answer within the timeout.
    pub bad_nodes: Vec<NodeId>,
    /// Reachable peers that are not ring members.
    pub non_member_nodes: Vec<NodeId>,
}

enum Request {
    Join {
        request: JoinRequest,
        reply: oneshot::Sender<Result<(), MembershipError>>,
    },
    Clock {
        reply: oneshot::Sender<VectorClock>,
    },
    State {
        reply: oneshot::Sender<MemberState>,
    },
    States {
        reply: oneshot::Sender<ClusterStates>,
    },
    Nodes {
        reply: oneshot::Sender<Vec<NodeId>>,
    },
    FullNodes {
        reply: oneshot::Sender<Vec<NodeEntry>>,
    },
    StartGossip {
        reply: oneshot::Sender<()>,
    },
    Reset {
        reply: oneshot::Sender<Result<(), MembershipError>>,
    },
    Stop,
}

/// Handle to a running membership service. All operations funnel into one
/// single-writer loop, so every state transition is totally ordered on the
/// local node.
#[derive(Clone)]
pub struct MembershipService {
    requests: mpsc::Sender<Request>,
    events: EventBus,
}

impl MembershipService {
    /// Starts the service. The worker first restores the newest snapshot
    /// (verifying it against reachable ring members), then serves requests
    /// and inbound peer traffic until [`MembershipService::stop`].
    pub async fn spawn(
        config: MembershipConfig,
        transport: Arc<dyn Transport>,
        inbound: mpsc::Receiver<InboundRequest>,
    ) -> (Self, JoinHandle<()>) {
        let events = EventBus::new();
        let store = SnapshotStore::new(&config.data_dir);
        let liveness = transport.subscribe();
        let (requests_tx, requests_rx) = mpsc::channel(MAILBOX_CAPACITY);

        let mut worker = Worker {
            state: MemberState::new(config.clone()),
            config,
            transport,
            store,
            events: events.clone(),
        };
        let task = tokio::spawn(async move {
            worker.restore().await;
            worker.run(requests_rx, inbound, liveness).await;
        });

        (
            Self {
                requests: requests_tx,
                events,
            },
            task,
        )
    }

    /// Applies a membership mutation.
    pub async fn join(&self, request: JoinRequest) -> Result<(), MembershipError> {
        self.call(|reply| Request::Join { request, reply }).await?
    }

    /// Current vector clock.
    pub async fn clock(&self) -> Result<VectorClock, MembershipError> {
        self.call(|reply| Request::Clock { reply }).await
    }

    /// Full local membership state.
    pub async fn state(&self) -> Result<MemberState, MembershipError> {
        self.call(|reply| Request::State { reply }).await
    }

    /// Groups every ring member by its reported state. Unreachable members
    /// land in `bad_nodes`; the call itself never fails on peer errors.
    pub async fn states(&self) -> Result<ClusterStates, MembershipError> {
        self.call(|reply| Request::States { reply }).await
    }

    /// Member ids in ring order.
    pub async fn nodes(&self) -> Result<Vec<NodeId>, MembershipError> {
        self.call(|reply| Request::Nodes { reply }).await
    }

    /// Member entries in ring order.
    pub async fn full_nodes(&self) -> Result<Vec<NodeEntry>, MembershipError> {
        self.call(|reply| Request::FullNodes { reply }).await
    }

    /// Triggers one synchronous gossip round.
    pub async fn start_gossip(&self) -> Result<(), MembershipError> {
        self.call(|reply| Request::StartGossip { reply }).await
    }

    /// Discards all membership state. Honoured only in test mode.
    pub async fn reset(&self) -> Result<(), MembershipError> {
        self.call(|reply| Request::Reset { reply }).await?
    }

    /// Asks the worker loop to exit.
    pub async fn stop(&self) {
        let _ = self.requests.send(Request::Stop).await;
    }

    /// Subscribe to membership events.
    pub fn subscribe(&self) -> broadcast::Receiver<MembershipEvent> {
        self.events.subscribe()
    }

    async fn call<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Request,
    ) -> Result<T, MembershipError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.requests
            .send(make(reply_tx))
            .await
            .map_err(|_| MembershipError::ServiceUnavailable)?;
        reply_rx
            .await
            .map_err(|_| MembershipError::ServiceUnavailable)
    }
}

struct Worker {
    config: MembershipConfig,
    state: MemberState,
    transport: Arc<dyn Transport>,
    store: SnapshotStore,
    events: EventBus,
}

impl Worker {
    async fn run(
        mut self,
        mut requests: mpsc::Receiver<Request>,
        mut inbound: mpsc::Receiver<InboundRequest>,
        mut liveness: broadcast::Receiver<LivenessEvent>,
    ) {
        loop {
            tokio::select! {
                request = requests.recv() => match request {
                    Some(Request::Stop) | None => {
                        info!(node = %self.config.node, "membership service stopping");
                        break;
                    }
                    Some(request) => self.handle_request(request).await,
                },
                peer = inbound.recv() => {
                    if let Some(peer) = peer {
                        self.handle_inbound(peer).await;
                    }
                }
                event = liveness.recv() => match event {
                    Ok(event) => self.handle_liveness(event).await,
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(node = %self.config.node, missed, "liveness events dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        debug!(node = %self.config.node, "liveness channel closed");
                        break;
                    }
                },
            }
        }
    }

    async fn handle_request(&mut self, request: Request) {
        match request {
            Request::Join { request, reply } => {
                let result = self.handle_join(request).await;
                if let Err(err) = &result {
                    info!(node = %self.config.node, "join rejected: {err}");
                }
                let _ = reply.send(result);
            }
            Request::Clock { reply } => {
                let _ = reply.send(self.state.clock.clone());
            }
            Request::State { reply } => {
                let _ = reply.send(self.state.clone());
            }
            Request::States { reply } => {
                let _ = reply.send(self.collect_states().await);
            }
            Request::Nodes { reply } => {
                let _ = reply.send(self.state.ring.node_ids());
            }
            Request::FullNodes { reply } => {
                let _ = reply.send(self.state.ring.entries().to_vec());
            }
            Request::StartGossip { reply } => {
                self.gossip_chain().await;
                let _ = reply.send(());
            }
            Request::Reset { reply } => {
                let result = if self.config.test {
                    self.state = MemberState::new(self.config.clone());
                    Ok(())
                } else {
                    Err(MembershipError::NotReset)
                };
                let _ = reply.send(result);
            }
            // stop is intercepted by the run loop
            Request::Stop => {}
        }
    }

    async fn handle_join(&mut self, request: JoinRequest) -> Result<(), MembershipError> {
        match request {
            JoinRequest::Init { entries } => {
                for entry in &entries {
                    if entry.node != self.config.node {
                        // force the liveness monitor to notice seeded peers
                        self.transport.ping(&entry.node).await;
                    }
                }
                let base = self.state.clone();
                self.int_join(entries, base).await
            }
            JoinRequest::Join { entries, ping } => {
                let base = self.fetch_base_state(&ping).await?;
                self.int_join(entries, base).await
            }
            JoinRequest::Replace { old, options, ping } => {
                let mut base = self.fetch_base_state(&ping).await?;
                let slot = base
                    .ring
                    .remove(&old)
                    .ok_or_else(|| MembershipError::NodeNotFound(old.clone()))?;
                let entry = NodeEntry::new(slot.position, self.config.node.clone(), options);
                base.ring.check_new_entry(&entry)?;
                base.ring.push(entry);
                self.events.publish(MembershipEvent::NodeLeave(old));
                self.int_join(Vec::new(), base).await
            }
            JoinRequest::Leave { node } => {
                let mut next = self.state.clone();
                let removed = next.ring.remove(&node);
                self.events.publish(MembershipEvent::NodeLeave(node));
                if removed.is_some() {
                    next.clock.tick(&self.config.node);
                    self.install(next).await;
                }
                Ok(())
            }
        }
    }

    /// Common join path: validate every entry against `base`, announce the
    /// joins, bump the local clock, then persist and gossip.
    async fn int_join(
        &mut self,
        entries: Vec<NodeEntry>,
        base: MemberState,
    ) -> Result<(), MembershipError> {
        let mut next = base;
        for entry in &entries {
            next.ring.check_new_entry(entry)?;
            next.ring.push(entry.clone());
        }
        for entry in &entries {
            self.events
                .publish(MembershipEvent::NodeJoin(entry.node.clone()));
        }
        next.clock.tick(&self.config.node);
        self.install(next).await;
        Ok(())
    }

    /// Starting point for `join`/`replace`: the consulted peer's state, or
    /// the local state in test mode.
    async fn fetch_base_state(&self, ping: &NodeId) -> Result<MemberState, MembershipError> {
        if self.config.test {
            return Ok(self.state.clone());
        }
        match self
            .transport
            .call(ping, PeerRequest::State, self.config.timeouts.state_call)
            .await?
        {
            PeerReply::State(state) => Ok(state),
            _ => Err(TransportError::UnexpectedReply(ping.clone()).into()),
        }
    }

    /// Adoption path shared by joins and gossip: make `state` current,
    /// snapshot it, and gossip until the cluster stops handing back a newer
    /// state.
    async fn install(&mut self, mut state: MemberState) {
        // gossiped states carry the sender's boot arguments; ours stay
        // authoritative locally
        state.args = self.config.clone();
        self.state = state;
        self.persist().await;
        self.gossip_chain().await;
    }

    async fn persist(&self) {
        if self.config.test {
            return;
        }
        match self.store.save(&self.state).await {
            Ok(path) => debug!(node = %self.config.node, path = %path.display(), "state persisted"),
            Err(err) => {
                warn!(node = %self.config.node, "failed to persist membership snapshot: {err}");
            }
        }
    }

    /// Gossip until the cluster stops handing back a newer state. A failed
    /// round is logged and ends the chain; it never aborts the service.
    async fn gossip_chain(&mut self) {
        loop {
            match self.gossip_round().await {
                Ok(Some(mut next)) => {
                    next.args = self.config.clone();
                    self.state = next;
                    self.persist().await;
                }
                Ok(None) => break,
                Err(err) => {
                    warn!(node = %self.config.node, "gossip round failed: {err}");
                    break;
                }
            }
        }
    }

    /// One synchronous gossip exchange. Returns a state handed back by the
    /// peer for adoption.
    async fn gossip_round(&self) -> Result<Option<MemberState>, MembershipError> {
        if self.config.test || self.state.ring.is_empty() {
            return Ok(None);
        }
        let up = self.transport.up_nodes();
        let Some(peer) = gossip::next_up_node(&self.config.node, &self.state.ring, &up) else {
            debug!(node = %self.config.node, "no gossip targets available");
            return Ok(None);
        };
        debug!(node = %self.config.node, peer = %peer, "gossiping state");
        match self
            .transport
            .call(
                &peer,
                PeerRequest::Gossip(self.state.clone()),
                self.config.timeouts.gossip_call,
            )
            .await?
        {
            PeerReply::Ok => Ok(None),
            PeerReply::NewState(state) => Ok(Some(state)),
            other => Err(MembershipError::UnknownGossipResponse(format!("{other:?}"))),
        }
    }

    async fn gossip_cast(&self) {
        if self.config.test || self.state.ring.is_empty() {
            return;
        }
        let up = self.transport.up_nodes();
        let Some(peer) = gossip::next_up_node(&self.config.node, &self.state.ring, &up) else {
            debug!(node = %self.config.node, "no gossip targets available");
            return;
        };
        if let Err(err) = self
            .transport
            .cast(&peer, PeerRequest::Gossip(self.state.clone()))
            .await
        {
            debug!(node = %self.config.node, peer = %peer, "gossip cast failed: {err}");
        }
    }

    async fn handle_inbound(&mut self, inbound: InboundRequest) {
        match inbound.request {
            PeerRequest::State => {
                if let Some(reply) = inbound.reply {
                    let _ = reply.send(PeerReply::State(self.state.clone()));
                }
            }
            PeerRequest::Ping => {
                if let Some(reply) = inbound.reply {
                    let _ = reply.send(PeerReply::Pong);
                }
            }
            PeerRequest::Gossip(remote) => self.handle_gossip(remote, inbound.reply).await,
        }
    }

    async fn handle_gossip(
        &mut self,
        remote: MemberState,
        reply: Option<oneshot::Sender<PeerReply>>,
    ) {
        match gossip::classify(&remote, &self.state) {
            GossipDecision::InSync => {
                if let Some(reply) = reply {
                    let _ = reply.send(PeerReply::Ok);
                }
            }
            GossipDecision::RemoteBehind => {
                if let Some(reply) = reply {
                    let _ = reply.send(PeerReply::NewState(self.state.clone()));
                }
            }
            GossipDecision::AdoptRemote => {
                if let Some(reply) = reply {
                    let _ = reply.send(PeerReply::Ok);
                }
                debug!(node = %self.config.node, "adopting newer remote state");
                self.install(remote).await;
            }
            GossipDecision::AdoptMerged(merged) => {
                if let Some(reply) = reply {
                    let _ = reply.send(PeerReply::NewState(merged.clone()));
                }
                debug!(node = %self.config.node, "adopting merged state after divergence");
                self.install(merged).await;
            }
        }
    }

    async fn handle_liveness(&mut self, event: LivenessEvent) {
        match event {
            LivenessEvent::Up(node) => {
                if self.state.ring.contains(&node) {
                    self.events.publish(MembershipEvent::NodeUp(node));
                }
                self.gossip_cast().await;
            }
            LivenessEvent::Down(node) => {
                self.events.publish(MembershipEvent::NodeDown(node));
            }
        }
    }

    /// Queries `state` from every ring member and groups the answers by
    /// view equality. Peers that fail to answer are collected, not fatal.
    async fn collect_states(&self) -> ClusterStates {
        let mut groups: Vec<StateGroup> = Vec::new();
        let mut bad_nodes = Vec::new();

        for node in self.state.ring.node_ids() {
            let state = if node == self.config.node {
                Some(self.state.clone())
            } else {
                match self
                    .transport
                    .call(&node, PeerRequest::State, self.config.timeouts.state_call)
                    .await
                {
                    Ok(PeerReply::State(state)) => Some(state),
                    Ok(other) => {
                        info!(peer = %node, "unexpected state reply: {other:?}");
                        None
                    }
                    Err(err) => {
                        debug!(peer = %node, "state query failed: {err}");
                        None
                    }
                }
            };
            match state {
                Some(state) => {
                    match groups
                        .iter_mut()
                        .find(|group| group.state.same_view(&state))
                    {
                        Some(group) => group.nodes.push(node),
                        None => groups.push(StateGroup {
                            state,
                            nodes: vec![node],
                        }),
                    }
                }
                None => bad_nodes.push(node),
            }
        }

        let non_member_nodes = self
            .transport
            .up_nodes()
            .into_iter()
            .filter(|id| *id != self.config.node && !self.state.ring.contains(id))
            .collect();

        ClusterStates {
            groups,
            bad_nodes,
            non_member_nodes,
        }
    }

    /// Loads the newest snapshot, if any, and verifies it against the
    /// cluster before serving requests.
    async fn restore(&mut self) {
        if self.config.test {
            return;
        }
        match self.store.load_latest().await {
            Ok(mut state) => {
                state.args = self.config.clone();
                info!(
                    node = %self.config.node,
                    members = state.ring.len(),
                    "restored membership snapshot"
                );
                self.state = state;
                self.rejoin().await;
            }
            Err(StoreError::NotFound) => {
                info!(
                    node = %self.config.node,
                    dir = %self.store.dir().display(),
                    "no membership snapshot; starting empty"
                );
            }
            Err(err) => {
                warn!(node = %self.config.node, "ignoring unreadable membership snapshot: {err}");
            }
        }
    }

    /// Compares the restored clock against every reachable ring member. On
    /// any disagreement the state is reset; a human re-runs the join.
    async fn rejoin(&mut self) {
        // nothing to verify before the first recorded mutation
        if self.state.clock.is_empty() {
            return;
        }
        let peers: Vec<NodeId> = self
            .state
            .ring
            .node_ids()
            .into_iter()
            .filter(|id| *id != self.config.node)
            .collect();
        if peers.is_empty() {
            return;
        }

        let mut unreachable = Vec::new();
        let mut mismatched = Vec::new();
        for peer in peers {
            if !self.transport.ping(&peer).await {
                unreachable.push(peer);
                continue;
            }
            match self
                .transport
                .call(&peer, PeerRequest::State, self.config.timeouts.state_call)
                .await
            {
                Ok(PeerReply::State(remote)) => {
                    if !remote.clock.equals(&self.state.clock) {
                        mismatched.push(peer);
                    }
                }
                Ok(other) => {
                    info!(peer = %peer, "unexpected state reply during rejoin: {other:?}");
                    unreachable.push(peer);
                }
                Err(err) => {
                    debug!(peer = %peer, "rejoin state query failed: {err}");
                    unreachable.push(peer);
                }
            }
        }

        if mismatched.is_empty() {
            info!(
                node = %self.config.node,
                unreachable = unreachable.len(),
                "rejoined cluster with restored state"
            );
        } else {
            warn!(
                node = %self.config.node,
                mismatched = ?mismatched,
                "restored state disagrees with the cluster; resetting"
            );
            self.state = MemberState::new(self.config.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_kinds_parse_from_strings() {
        assert_eq!("init".parse::<JoinKind>().unwrap(), JoinKind::Init);
        assert_eq!("join".parse::<JoinKind>().unwrap(), JoinKind::Join);
        assert_eq!("replace".parse::<JoinKind>().unwrap(), JoinKind::Replace);
        assert_eq!("leave".parse::<JoinKind>().unwrap(), JoinKind::Leave);
    }

    #[test]
    fn unknown_join_kind_is_rejected() {
        let err = "rebalance".parse::<JoinKind>().unwrap_err();
        assert!(matches!(err, MembershipError::UnknownJoinType(_)));
        assert_eq!(err.to_string(), "unknown_join_type: rebalance");
    }

    #[test]
    fn join_kinds_display_their_wire_names() {
        for kind in [JoinKind::Init, JoinKind::Join, JoinKind::Replace, JoinKind::Leave] {
            assert_eq!(kind.to_string().parse::<JoinKind>().unwrap(), kind);
        }
    }
}
