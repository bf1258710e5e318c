use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, info, warn};

use super::{InboundRequest, LivenessEvent, PeerReply, PeerRequest, Transport, TransportError};
use crate::config::NetworkConfig;
use crate::ring::NodeId;

const INBOUND_CAPACITY: usize = 64;
const LIVENESS_CAPACITY: usize = 256;
/// Bound on how long an accepted connection waits for the service loop.
const INBOUND_REPLY_TIMEOUT: Duration = Duration::from_secs(10);

/// One length-prefixed bincode frame per request; the reply frame mirrors
/// it on the same connection.
#[derive(Debug, Serialize, Deserialize)]
struct RequestFrame {
    request: PeerRequest,
    expects_reply: bool,
}

#[derive(Debug, Default)]
struct PeerHealth {
    up: bool,
    failures: u32,
}

/// TCP peer transport: point-to-point RPC over short-lived connections plus
/// a heartbeat liveness monitor over the address book.
pub struct TcpTransport {
    local: NodeId,
    bound: SocketAddr,
    config: NetworkConfig,
    peers: DashMap<NodeId, SocketAddr>,
    health: DashMap<NodeId, PeerHealth>,
    liveness: broadcast::Sender<LivenessEvent>,
}

impl TcpTransport {
    /// Binds the listener, seeds the address book, and starts the accept
    /// and heartbeat tasks.
    pub async fn spawn(
        local: NodeId,
        config: NetworkConfig,
    ) -> Result<(Arc<Self>, mpsc::Receiver<InboundRequest>, TransportHandle), TransportError> {
        let listener = TcpListener::bind(config.bind).await?;
        let bound = listener.local_addr()?;
        let (liveness, _) = broadcast::channel(LIVENESS_CAPACITY);

        let peers = DashMap::new();
        for seed in &config.seeds {
            if seed.id != local {
                peers.insert(seed.id.clone(), seed.addr);
            }
        }

        let transport = Arc::new(Self {
            local,
            bound,
            config,
            peers,
            health: DashMap::new(),
            liveness,
        });

        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CAPACITY);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut tasks = Vec::with_capacity(2);
        tasks.push(tokio::spawn(Self::accept_loop(
            Arc::clone(&transport),
            listener,
            inbound_tx,
            shutdown_rx.clone(),
        )));
        tasks.push(tokio::spawn(Self::monitor_loop(
            Arc::clone(&transport),
            shutdown_rx,
        )));

        info!(node = %transport.local, addr = %bound, "peer transport listening");
        Ok((transport, inbound_rx, TransportHandle { shutdown_tx, tasks }))
    }

    /// Address the listener is bound to.
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.bound
    }

    /// Adds or updates an address book entry.
    pub fn register(&self, id: NodeId, addr: SocketAddr) {
        if id != self.local {
            self.peers.insert(id, addr);
        }
    }

    fn peer_addr(&self, peer: &NodeId) -> Result<SocketAddr, TransportError> {
        self.peers
            .get(peer)
            .map(|entry| *entry.value())
            .ok_or_else(|| TransportError::UnknownPeer(peer.clone()))
    }

    fn record_probe(&self, peer: &NodeId, ok: bool) {
        if !self.peers.contains_key(peer) {
            return;
        }
        let transition = {
            let mut health = self.health.entry(peer.clone()).or_default();
            if ok {
                health.failures = 0;
                if health.up {
                    None
                } else {
                    health.up = true;
                    Some(LivenessEvent::Up(peer.clone()))
                }
            } else {
                health.failures = health.failures.saturating_add(1);
                if health.up && health.failures >= self.config.probe_failures {
                    health.up = false;
                    Some(LivenessEvent::Down(peer.clone()))
                } else {
                    None
                }
            }
        };
        if let Some(event) = transition {
            match &event {
                LivenessEvent::Up(node) => info!(peer = %node, "peer is up"),
                LivenessEvent::Down(node) => warn!(peer = %node, "peer is down"),
            }
            let _ = self.liveness.send(event);
        }
    }

    async fn accept_loop(
        self: Arc<Self>,
        listener: TcpListener,
        inbound: mpsc::Sender<InboundRequest>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        let transport = Arc::clone(&self);
                        let inbound = inbound.clone();
                        tokio::spawn(async move {
                            if let Err(err) = transport.serve_connection(stream, inbound).await {
                                // malformed peers are dropped, never fatal
                                info!(peer = %addr, "ignoring peer connection: {err}");
                            }
                        });
                    }
                    Err(err) => warn!("accept failed: {err}"),
                },
            }
        }
    }

    async fn serve_connection(
        &self,
        mut stream: TcpStream,
        inbound: mpsc::Sender<InboundRequest>,
    ) -> Result<(), TransportError> {
        let max = self.config.max_frame_size;
        let frame: RequestFrame = read_frame(&mut stream, max).await?;
        match frame.request {
            // probes are answered at the transport layer
            PeerRequest::Ping => {
                if frame.expects_reply {
                    write_frame(&mut stream, &PeerReply::Pong, max).await?;
                }
            }
            request if frame.expects_reply => {
                let (reply_tx, reply_rx) = oneshot::channel();
                inbound
                    .send(InboundRequest {
                        request,
                        reply: Some(reply_tx),
                    })
                    .await
                    .map_err(|_| TransportError::Unavailable)?;
                let reply = time::timeout(INBOUND_REPLY_TIMEOUT, reply_rx)
                    .await
                    .map_err(|_| TransportError::Unavailable)?
                    .map_err(|_| TransportError::Unavailable)?;
                write_frame(&mut stream, &reply, max).await?;
            }
            request => {
                inbound
                    .send(InboundRequest {
                        request,
                        reply: None,
                    })
                    .await
                    .map_err(|_| TransportError::Unavailable)?;
            }
        }
        Ok(())
    }

    async fn monitor_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = time::interval(self.config.probe_interval);
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {
                    let peers: Vec<NodeId> =
                        self.peers.iter().map(|entry| entry.key().clone()).collect();
                    for peer in peers {
                        self.ping(&peer).await;
                    }
                }
            }
        }
    }

    async fn call_addr(
        &self,
        peer: &NodeId,
        addr: SocketAddr,
        frame: RequestFrame,
        timeout: Duration,
    ) -> Result<PeerReply, TransportError> {
        let max = self.config.max_frame_size;
        time::timeout(timeout, async move {
            let mut stream = TcpStream::connect(addr).await?;
            write_frame(&mut stream, &frame, max).await?;
            read_frame::<PeerReply>(&mut stream, max).await
        })
        .await
        .map_err(|_| TransportError::Timeout(peer.clone()))?
    }
}

#[async_trait::async_trait]
impl Transport for TcpTransport {
    async fn call(
        &self,
        peer: &NodeId,
        request: PeerRequest,
        timeout: Duration,
    ) -> Result<PeerReply, TransportError> {
        let addr = self.peer_addr(peer)?;
        let frame = RequestFrame {
            request,
            expects_reply: true,
        };
        self.call_addr(peer, addr, frame, timeout).await
    }

    async fn cast(&self, peer: &NodeId, request: PeerRequest) -> Result<(), TransportError> {
        let addr = self.peer_addr(peer)?;
        let frame = RequestFrame {
            request,
            expects_reply: false,
        };
        let max = self.config.max_frame_size;
        time::timeout(self.config.probe_timeout, async move {
            let mut stream = TcpStream::connect(addr).await?;
            write_frame(&mut stream, &frame, max).await
        })
        .await
        .map_err(|_| TransportError::Timeout(peer.clone()))?
    }

    async fn ping(&self, peer: &NodeId) -> bool {
        let ok = matches!(
            self.call(peer, PeerRequest::Ping, self.config.probe_timeout)
                .await,
            Ok(PeerReply::Pong)
        );
        self.record_probe(peer, ok);
        ok
    }

    fn up_nodes(&self) -> Vec<NodeId> {
        self.health
            .iter()
            .filter(|entry| entry.value().up)
            .map(|entry| entry.key().clone())
            .collect()
    }

    fn subscribe(&self) -> broadcast::Receiver<LivenessEvent> {
        self.liveness.subscribe()
    }
}

/// Handle controlling the transport background tasks.
pub struct TransportHandle {
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl TransportHandle {
    /// Signals the accept and heartbeat tasks to exit.
    pub fn request_shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Waits for all transport tasks to terminate.
    pub async fn wait(self) {
        for task in self.tasks {
            let _ = task.await;
        }
    }
}

/// One-shot client fetch of a node's membership state, used by admin
/// tooling that is not itself a cluster member.
pub async fn fetch_state(
    addr: SocketAddr,
    max_frame_size: usize,
    timeout: Duration,
) -> Result<crate::ring::MemberState, TransportError> {
    let peer = NodeId::from(addr.to_string());
    let frame = RequestFrame {
        request: PeerRequest::State,
        expects_reply: true,
    };
    let reply = time::timeout(timeout, async move {
        let mut stream = TcpStream::connect(addr).await?;
        write_frame(&mut stream, &frame, max_frame_size).await?;
        read_frame::<PeerReply>(&mut stream, max_frame_size).await
    })
    .await
    .map_err(|_| TransportError::Timeout(peer.clone()))??;
    match reply {
        PeerReply::State(state) => Ok(state),
        other => {
            debug!(?other, "state fetch returned unexpected payload");
            Err(TransportError::UnexpectedReply(peer))
        }
    }
}

async fn write_frame<T: Serialize>(
    stream: &mut TcpStream,
    value: &T,
    max: usize,
) -> Result<(), TransportError> {
    let payload = bincode::serialize(value).map_err(|err| TransportError::Codec(err.to_string()))?;
    if payload.len() > max {
        return Err(TransportError::MessageTooLarge(payload.len()));
    }
    stream.write_u32(payload.len() as u32).await?;
    stream.write_all(&payload).await?;
    stream.flush().await?;
    Ok(())
}

async fn read_frame<T: DeserializeOwned>(
    stream: &mut TcpStream,
    max: usize,
) -> Result<T, TransportError> {
    let len = stream.read_u32().await? as usize;
    if len > max {
        return Err(TransportError::MessageTooLarge(len));
    }
    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload).await?;
    bincode::deserialize(&payload).map_err(|err| TransportError::Codec(err.to_string()))
}
