// betanet — mixnode daemon and client CLI
//
// keygen  create a node key file
// ticket  publish this node's relay candidate for an epoch
// node    run a mixnode with its health endpoint
// send    VRF-select a circuit from a topology and send a message

mod config;
mod server;

use anyhow::{Context, Result};
use betanet_core::transport::{LinkConfig, PeerLinks};
use betanet_core::vrf::{EpochSchedule, RelayCandidate, RelayTicket};
use betanet_core::{
    Delivery, DeliveryHandler, DeliveryRegistry, HopDescriptor, MixnetClient, MixnetNode, MixnetTransport, NodeKeys,
    NodeMetrics, Role,
};
use clap::{Parser, Subcommand};
use colored::*;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

#[derive(Parser)]
#[command(name = "betanet")]
#[command(about = "Betanet mixnet node and client", long_about = None)]
#[command(version)]
struct Cli {
    /// Also write logs to daily files in this directory
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate a node key file
    Keygen {
        #[arg(short, long, default_value = "node.key")]
        out: PathBuf,
    },
    /// Print this node's relay candidate (descriptor + VRF ticket) as JSON
    Ticket {
        #[arg(short, long, default_value = "node.key")]
        key: PathBuf,
        #[arg(short, long)]
        role: Role,
        /// Address other nodes reach this one on
        #[arg(short, long)]
        address: SocketAddr,
        /// Defaults to the current epoch
        #[arg(long)]
        epoch: Option<u64>,
        #[arg(long, default_value = "3600")]
        epoch_secs: u64,
    },
    /// Run a mixnode until interrupted
    Node {
        #[arg(short, long, default_value = "node.key")]
        key: PathBuf,
        /// JSON node config; BETANET_* environment otherwise
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
    /// Send a message through a circuit picked from a topology file
    Send {
        #[arg(short, long)]
        topology: PathBuf,
        destination: String,
        message: String,
        /// Skip per-hop mixing delays
        #[arg(long)]
        no_privacy: bool,
        #[arg(short = 'n', long, default_value = "1")]
        count: usize,
        /// Key used for the auditable relay selection; random otherwise
        #[arg(short, long)]
        key: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let level = log_level(&cli.command)?;
    let _log_guard = init_logging(cli.log_dir.as_deref(), &level);

    match cli.command {
        Commands::Keygen { out } => cmd_keygen(out),
        Commands::Ticket {
            key,
            role,
            address,
            epoch,
            epoch_secs,
        } => cmd_ticket(key, role, address, epoch, epoch_secs),
        Commands::Node { key, config } => cmd_node(key, config).await,
        Commands::Send {
            topology,
            destination,
            message,
            no_privacy,
            count,
            key,
        } => cmd_send(topology, destination, message, !no_privacy, count, key).await,
    }
}

/// Log level from the node config for `node`, BETANET_LOG_LEVEL otherwise.
fn log_level(command: &Commands) -> Result<String> {
    match command {
        Commands::Node { config, .. } => Ok(config::load_node_config(config.as_deref())?.log_level),
        _ => Ok(std::env::var("BETANET_LOG_LEVEL").unwrap_or_else(|_| "info".to_string())),
    }
}

/// Stderr always; a rolling file too when `log_dir` is set. RUST_LOG wins
/// over `level`.
fn init_logging(log_dir: Option<&std::path::Path>, level: &str) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let json = std::env::var("BETANET_LOG_JSON").map(|v| v == "1" || v == "true").unwrap_or(false);

    let stderr = if json {
        tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr).boxed()
    } else {
        tracing_subscriber::fmt::layer().with_writer(std::io::stderr).boxed()
    };

    match log_dir {
        Some(dir) => {
            let (writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::daily(dir, "betanet.log"));
            tracing_subscriber::registry()
                .with(filter)
                .with(stderr)
                .with(tracing_subscriber::fmt::layer().with_ansi(false).with_writer(writer))
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry().with(filter).with(stderr).init();
            None
        }
    }
}

fn cmd_keygen(out: PathBuf) -> Result<()> {
    let keys = NodeKeys::generate();
    config::save_keys(&out, &keys)?;

    println!("{}", "Node key generated".green().bold());
    println!("  {} {}", "File:".bold(), out.display());
    println!("  {} {}", "Node ID:".bold(), keys.node_id());
    println!("  {} {}", "Mix key:".bold(), hex::encode(keys.mix_public_key()));
    println!("  {} {}", "VRF key:".bold(), hex::encode(keys.vrf_public_key()));
    Ok(())
}

fn cmd_ticket(key: PathBuf, role: Role, address: SocketAddr, epoch: Option<u64>, epoch_secs: u64) -> Result<()> {
    let keys = config::load_keys(&key)?;
    let epoch = epoch.unwrap_or_else(|| EpochSchedule::new(Duration::from_secs(epoch_secs.max(1))).current_epoch());
    let ticket = RelayTicket::issue(&keys, epoch).context("Failed to issue VRF ticket")?;

    let candidate = RelayCandidate {
        descriptor: HopDescriptor::from_keys(&keys, role, address),
        ticket: Some(ticket),
    };
    println!("{}", serde_json::to_string_pretty(&candidate)?);
    Ok(())
}

/// Logs what arrives at an exit node.
struct LogDeliveries;

impl DeliveryHandler for LogDeliveries {
    fn on_delivery(&self, delivery: &Delivery) {
        tracing::info!(
            "Delivered {} bytes for {}",
            delivery.data.len(),
            delivery.destination
        );
    }

    fn on_path_degraded(&self, peer: SocketAddr, reason: &str) {
        tracing::warn!("Path through {} degraded: {}", peer, reason);
    }
}

async fn cmd_node(key: PathBuf, config_path: Option<PathBuf>) -> Result<()> {
    let keys = config::load_keys(&key)?;
    let node_config = config::load_node_config(config_path.as_deref())?;
    let health_addr = node_config.health_addr();
    let role = node_config.role;

    let node = Arc::new(
        MixnetNode::start(&keys, node_config)
            .await
            .context("Failed to start mixnode")?,
    );
    node.register_delivery_handler(Arc::new(LogDeliveries));
    let http = server::start(health_addr, node.clone());

    println!("{}", format!("Betanet {} node running", role).green().bold());
    println!("  {} {}", "Node ID:".bold(), node.node_id());
    println!("  {} {}", "Listening:".bold(), node.local_addr());
    println!("  {} http://{}/health", "Health:".bold(), health_addr);
    println!("Press Ctrl+C to stop");

    tokio::signal::ctrl_c().await.context("Failed to listen for Ctrl+C")?;
    println!();
    println!("{}", "Shutting down...".yellow());
    http.abort();
    node.shutdown().await;
    Ok(())
}

async fn cmd_send(
    topology_path: PathBuf,
    destination: String,
    message: String,
    privacy_required: bool,
    count: usize,
    key: Option<PathBuf>,
) -> Result<()> {
    let topology = config::Topology::load(&topology_path)?;
    let selector_keys = match key {
        Some(path) => config::load_keys(&path)?,
        None => NodeKeys::generate(),
    };
    let epoch = topology.current_epoch();
    let (circuit, selections) = topology.build_circuit(&selector_keys, epoch)?;

    println!("{} (epoch {})", "Circuit selected".bold(), epoch);
    for (hop, selection) in circuit.hops().iter().zip(&selections) {
        println!(
            "  {} {} {} among {}",
            format!("{:>6}", hop.role.to_string()).cyan(),
            hop.node_id,
            hop.address,
            selection.candidates.len()
        );
    }

    let links = PeerLinks::new(LinkConfig::default(), Arc::new(NodeMetrics::new()), DeliveryRegistry::new());
    let client = MixnetClient::new(circuit, Arc::new(links), DeliveryRegistry::new());

    let sends = (0..count.max(1)).map(|_| client.send(&destination, message.as_bytes(), privacy_required));
    let results = futures::future::join_all(sends).await;

    let mut failed = 0;
    for result in results {
        match result {
            Ok(receipt) => println!("  {} {} via {}", "✓".green(), receipt.id, receipt.entry),
            Err(e) => {
                failed += 1;
                println!("  {} {}", "✗".red(), e);
            }
        }
    }
    if failed > 0 {
        anyhow::bail!("{} of {} sends failed", failed, count.max(1));
    }
    Ok(())
}
