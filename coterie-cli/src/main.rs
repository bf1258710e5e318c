//! Coterie admin CLI: runs a membership node and inspects running peers.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use clap::{Parser, Subcommand};
use coterie_core::transport::tcp::{self, TcpTransport};
use coterie_core::{
    HINTS_KEY, JoinKind, JoinRequest, MemberState, MembershipConfig, MembershipService,
    NetworkConfig, NodeEntry, NodeId, OptionValue, Options, SeedPeer,
};
use tokio::signal;
use tracing::{Level, info, warn};
use tracing_subscriber::FmtSubscriber;
use uuid::Uuid;

/// Cluster membership node and admin tooling
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Set the log level
    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a membership node
    Start {
        /// Stable node identifier (random when omitted)
        #[arg(long)]
        node: Option<String>,

        /// Peer RPC bind address
        #[arg(long, default_value = "127.0.0.1:7700")]
        bind: SocketAddr,

        /// Snapshot directory
        #[arg(long, default_value = "data")]
        data_dir: PathBuf,

        /// Seed peer address book entries, `id=host:port` (repeatable)
        #[arg(long = "seed")]
        seeds: Vec<String>,

        /// Membership action performed at boot: init, join, or replace
        #[arg(long = "join")]
        join_kind: Option<String>,

        /// Ring position claimed by init/join
        #[arg(long)]
        position: Option<u64>,

        /// Member replaced when the boot action is `replace`
        #[arg(long)]
        old: Option<String>,

        /// Already-joined peer consulted for the cluster state
        #[arg(long)]
        ping: Option<String>,

        /// Extra partitions this node takes responsibility for
        #[arg(long, value_delimiter = ',')]
        hints: Vec<String>,
    },

    /// Print a running node's membership state
    Status {
        /// Peer RPC address of the node to query
        #[arg(long)]
        peer: SocketAddr,

        /// Output in JSON format
        #[arg(short, long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = Level::from_str(&cli.log_level)
        .with_context(|| format!("invalid log level '{}'", cli.log_level))?;
    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    tracing::subscriber::set_global_default(subscriber).context("failed to install subscriber")?;

    match cli.command {
        Commands::Start {
            node,
            bind,
            data_dir,
            seeds,
            join_kind,
            position,
            old,
            ping,
            hints,
        } => {
            run_node(
                node, bind, data_dir, seeds, join_kind, position, old, ping, hints,
            )
            .await
        }
        Commands::Status { peer, json } => show_status(peer, json).await,
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_node(
    node: Option<String>,
    bind: SocketAddr,
    data_dir: PathBuf,
    seeds: Vec<String>,
    join_kind: Option<String>,
    position: Option<u64>,
    old: Option<String>,
    ping: Option<String>,
    hints: Vec<String>,
) -> Result<()> {
    let node = NodeId::from(node.unwrap_or_else(|| format!("node-{}", Uuid::new_v4())));
    let seeds = seeds
        .iter()
        .map(|seed| parse_seed(seed))
        .collect::<Result<Vec<_>>>()?;

    let config = MembershipConfig {
        node: node.clone(),
        data_dir,
        network: NetworkConfig {
            bind,
            seeds,
            ..NetworkConfig::default()
        },
        ..MembershipConfig::default()
    };

    let boot_action = boot_action(&node, join_kind.as_deref(), position, old, ping, hints)?;

    let (transport, inbound, transport_handle) =
        TcpTransport::spawn(node.clone(), config.network.clone()).await?;
    info!(node = %node, addr = %transport.local_addr(), "membership node starting");

    let peer_transport: Arc<dyn coterie_core::Transport> = transport;
    let (service, worker) = MembershipService::spawn(config, peer_transport, inbound).await;

    // surface membership transitions in the node log
    let mut events = service.subscribe();
    let event_logger = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            info!(?event, "membership event");
        }
    });

    if let Some(action) = boot_action {
        match service.join(action).await {
            Ok(()) => info!(node = %node, "boot membership action applied"),
            Err(err) => warn!(node = %node, "boot membership action failed: {err}"),
        }
    }

    signal::ctrl_c().await.context("failed to listen for shutdown signal")?;
    info!(node = %node, "shutting down");

    service.stop().await;
    let _ = worker.await;
    transport_handle.request_shutdown();
    transport_handle.wait().await;
    event_logger.abort();
    Ok(())
}

fn boot_action(
    node: &NodeId,
    join_kind: Option<&str>,
    position: Option<u64>,
    old: Option<String>,
    ping: Option<String>,
    hints: Vec<String>,
) -> Result<Option<JoinRequest>> {
    let Some(kind) = join_kind else {
        return Ok(None);
    };
    let kind: JoinKind = kind.parse()?;

    let options = if hints.is_empty() {
        Options::new()
    } else {
        let mut options = Options::new();
        options.insert(HINTS_KEY.to_string(), OptionValue::List(hints));
        options
    };

    let request = match kind {
        JoinKind::Init => {
            let position = position.context("--join init requires --position")?;
            JoinRequest::Init {
                entries: vec![NodeEntry::new(position, node.clone(), options)],
            }
        }
        JoinKind::Join => {
            let position = position.context("--join join requires --position")?;
            let ping = ping.context("--join join requires --ping")?;
            JoinRequest::Join {
                entries: vec![NodeEntry::new(position, node.clone(), options)],
                ping: NodeId::from(ping),
            }
        }
        JoinKind::Replace => {
            let old = old.context("--join replace requires --old")?;
            let ping = ping.context("--join replace requires --ping")?;
            JoinRequest::Replace {
                old: NodeId::from(old),
                options,
                ping: NodeId::from(ping),
            }
        }
        JoinKind::Leave => bail!("leave is issued by a running member, not at boot"),
    };
    Ok(Some(request))
}

async fn show_status(peer: SocketAddr, json: bool) -> Result<()> {
    let state = tcp::fetch_state(
        peer,
        NetworkConfig::default().max_frame_size,
        Duration::from_secs(5),
    )
    .await
    .with_context(|| format!("failed to fetch state from {peer}"))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&state)?);
        return Ok(());
    }

    print_state(&state);
    Ok(())
}

fn print_state(state: &MemberState) {
    println!("ring ({} members):", state.ring.len());
    for entry in state.ring.entries() {
        match entry.hints() {
            Some(hints) => println!(
                "  {:>4}  {}  hints: {}",
                entry.position,
                entry.node,
                hints.join(",")
            ),
            None => println!("  {:>4}  {}", entry.position, entry.node),
        }
    }
    println!("clock:");
    let mut counters: Vec<(NodeId, u64)> = state
        .ring
        .node_ids()
        .into_iter()
        .map(|id| {
            let count = state.clock.get(&id);
            (id, count)
        })
        .collect();
    counters.sort();
    for (id, count) in counters {
        println!("  {id}: {count}");
    }
}

fn parse_seed(seed: &str) -> Result<SeedPeer> {
    let (id, addr) = seed
        .split_once('=')
        .ok_or_else(|| anyhow!("seed '{seed}' is not of the form id=host:port"))?;
    let addr: SocketAddr = addr
        .parse()
        .with_context(|| format!("seed '{seed}' has an invalid address"))?;
    Ok(SeedPeer {
        id: NodeId::from(id),
        addr,
    })
}
