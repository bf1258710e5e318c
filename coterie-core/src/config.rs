use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::ring::NodeId;

/// Top-level node configuration shared by the CLI and the service. A copy
/// travels inside every persisted and gossiped state as the service's boot
/// arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MembershipConfig {
    /// Stable identifier of the local node.
    pub node: NodeId,
    /// Directory receiving membership snapshots.
    pub data_dir: PathBuf,
    /// Test-harness mode: disables persistence, peer state fetch during
    /// joins, and gossip, and enables `reset`.
    pub test: bool,
    /// Cross-node RPC timeout tuning.
    pub timeouts: TimeoutConfig,
    /// Peer transport tuning.
    pub network: NetworkConfig,
}

impl Default for MembershipConfig {
    fn default() -> Self {
        Self {
            node: NodeId::from("node-0"),
            data_dir: PathBuf::from("data"),
            test: false,
            timeouts: TimeoutConfig::default(),
            network: NetworkConfig::default(),
        }
    }
}

/// Timeout knobs for cross-node calls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Per-peer timeout for state queries (cluster views, rejoin, join
    /// bootstrap).
    #[serde(with = "humantime_serde")]
    pub state_call: Duration,
    /// Bounded wait for a single synchronous gossip exchange.
    #[serde(with = "humantime_serde")]
    pub gossip_call: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            state_call: Duration::from_secs(5),
            gossip_call: Duration::from_secs(2),
        }
    }
}

/// Network tuning for the TCP peer transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address the peer RPC listener binds to.
    pub bind: SocketAddr,
    /// Static `id -> address` entries seeding the address book.
    pub seeds: Vec<SeedPeer>,
    /// Maximum encoded frame size accepted from peers.
    pub max_frame_size: usize,
    /// Interval between liveness probes.
    #[serde(with = "humantime_serde")]
    pub probe_interval: Duration,
    /// Timeout for a single liveness probe.
    #[serde(with = "humantime_serde")]
    pub probe_timeout: Duration,
    /// Consecutive probe failures before a peer is reported down.
    pub probe_failures: u32,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 7700),
            seeds: Vec::new(),
            max_frame_size: 1024 * 1024,
            probe_interval: Duration::from_secs(1),
            probe_timeout: Duration::from_millis(600),
            probe_failures: 3,
        }
    }
}

/// Address book seed entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeedPeer {
    /// Peer node identifier.
    pub id: NodeId,
    /// Peer RPC address.
    pub addr: SocketAddr,
}
