//! umbra CLI
//!
//! Relayed DHT access over an anonymizing overlay

mod config;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use config::Config;
use umbra_relay::loopback::{LoopbackNetwork, MemoryDht, StaticDirectory};
use umbra_relay::{
    AlternativeContact, ClientPhase, Ed25519Identity, OverlayIdentity, PROTOCOL_VERSION, ProxyConfig,
    ProxyDht, ProxyStatus,
};

/// umbra - DHT operations relayed through overlay peers
#[derive(Parser)]
#[command(name = "umbra")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run an in-memory overlay of relays and one client
    Demo {
        /// Seconds to wait for each step
        #[arg(short, long, default_value_t = 30)]
        timeout: u64,
    },

    /// Print the effective configuration as TOML
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let config = Config::load_or_default(cli.config.as_deref())?;
    config.validate()?;

    // Initialize logging
    let level = if cli.verbose {
        "debug"
    } else {
        config.logging.level.as_str()
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .init();

    match cli.command {
        Commands::Demo { timeout } => {
            run_demo(&config, Duration::from_secs(timeout)).await?;
        }
        Commands::Config => {
            print!("{}", config.to_toml()?);
        }
    }

    Ok(())
}

/// A node of the demo overlay
struct DemoNode {
    name: String,
    proxy: ProxyDht,
}

/// Start relays and a client on a loopback overlay, announce and look up
async fn run_demo(config: &Config, step_timeout: Duration) -> anyhow::Result<()> {
    let network = LoopbackNetwork::new();
    let dht = MemoryDht::new();
    let directory = Arc::new(StaticDirectory::new(Vec::new()));

    let relay_config = ProxyConfig {
        client_enabled: false,
        ..config.proxy.clone()
    };
    let mut relays = Vec::with_capacity(config.node.demo_relays);
    let mut contacts = Vec::with_capacity(config.node.demo_relays);
    for i in 0..config.node.demo_relays {
        let name = format!("relay-{i}");
        let (node, contact) =
            spawn_node(&name, relay_config.clone(), config, &network, &dht, &directory)?;
        contacts.push(contact);
        relays.push(node);
    }
    directory.set(contacts);

    let client_config = ProxyConfig {
        server_enabled: false,
        ..config.proxy.clone()
    };
    let (client, _) = spawn_node("client", client_config, config, &network, &dht, &directory)?;

    for node in relays.iter().chain(std::iter::once(&client)) {
        node.proxy.start();
    }

    println!("umbra demo overlay");
    println!("Version: {}", env!("CARGO_PKG_VERSION"));
    println!("Relays: {}", relays.len());
    println!();

    let info_hash = umbra_crypto::hash::hash(config.node.topic.as_bytes());
    println!("Topic: {} ({})", config.node.topic, hex::encode(info_hash));

    let receipt = client.proxy.announce(&info_hash, true)?;
    let confirmed = tokio::time::timeout(step_timeout, receipt.confirmed())
        .await
        .map_err(|_| anyhow::anyhow!("Announce not confirmed within {step_timeout:?}"))?;
    println!("Announce confirmed: {confirmed}");

    let query = client
        .proxy
        .query(&info_hash, false, config.proxy.default_num_want)?;
    let (peers, timed_out) = tokio::time::timeout(step_timeout, query.collect())
        .await
        .map_err(|_| anyhow::anyhow!("Query did not finish within {step_timeout:?}"))?;
    println!("Query returned {} peer(s), timed out: {timed_out}", peers.len());
    for peer in &peers {
        println!(
            "  {} seed={} crypto={}",
            peer.originator, peer.is_seed, peer.requires_crypto
        );
    }
    println!();

    print_status(&client);
    for relay in &relays {
        print_status(relay);
    }

    let stored = dht.log().len();
    tracing::info!("Memory DHT saw {stored} operation(s)");

    for node in relays.iter().chain(std::iter::once(&client)) {
        node.proxy.shutdown();
    }

    Ok(())
}

/// Build a node and its directory contact
fn spawn_node(
    name: &str,
    proxy_config: ProxyConfig,
    config: &Config,
    network: &LoopbackNetwork,
    dht: &MemoryDht,
    directory: &Arc<StaticDirectory>,
) -> anyhow::Result<(DemoNode, AlternativeContact)> {
    let identity = Arc::new(Ed25519Identity::generate(
        config.node.relay_port,
        config.node.direct_port,
    ));
    let relay_endpoint = identity
        .relay_endpoint()
        .ok_or_else(|| anyhow::anyhow!("{name} has no relay endpoint"))?;

    let proxy = ProxyDht::new(
        proxy_config,
        identity.clone(),
        Arc::new(dht.handle(name)),
        directory.clone(),
        Arc::new(network.clone()),
    )?;
    network.attach(&proxy, identity.as_ref());
    tracing::debug!("Node {name} relays on {relay_endpoint}");

    Ok((
        DemoNode {
            name: name.to_string(),
            proxy,
        },
        AlternativeContact::new(PROTOCOL_VERSION, relay_endpoint),
    ))
}

/// Print a node's status block
fn print_status(node: &DemoNode) {
    let status: ProxyStatus = node.proxy.status();
    println!("{} [{}]", node.name, status.instance_id);
    println!("  Connections: {}", status.connections);
    match &status.relay {
        Some(relay) => {
            let active = if relay.phase == ClientPhase::Active {
                "active"
            } else {
                "not active"
            };
            println!("  Relay: {} ({active}, {} in flight)", relay.target, relay.in_flight);
        }
        None => println!("  Relay: none"),
    }
    for client in &status.clients {
        println!(
            "  Client: {} {:?} gets={} mutations={}",
            client.source_host.as_deref().unwrap_or("?"),
            client.phase,
            client.queues.active_gets,
            client.queues.active_mutations
        );
    }
    println!(
        "  Tracked keys: {}, queued: {}",
        status.tracked_keys, status.queued_requests
    );
}
