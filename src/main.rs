use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::time::{self, Duration};
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use sigilum::{
    Config, Contact, Keypair, Node, NodeId, SystemClock, UdpTransport, PROTOCOL_VERSION,
};

#[derive(Clone, Debug)]
struct SeedPeer {
    addr: SocketAddr,
    id: NodeId,
}

impl FromStr for SeedPeer {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let (addr_part, id_part) = s
            .rsplit_once('/')
            .context("seed peer must include a node id (format: IP:PORT/HEXID)")?;

        let addr: SocketAddr = addr_part.parse().context("invalid socket address")?;
        let id = NodeId::from_hex(id_part)
            .map_err(|_| anyhow::anyhow!("node id must be 128 hex characters (64 bytes)"))?;

        Ok(SeedPeer { addr, id })
    }
}

#[derive(Parser, Debug)]
#[command(name = "sigilum")]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(short, long, default_value = "0.0.0.0:0")]
    bind: SocketAddr,

    #[arg(short, long = "seed", value_name = "PEER")]
    seeds: Vec<SeedPeer>,

    #[arg(short = 't', long, default_value = "300")]
    status_interval: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    let keypair = Keypair::generate();
    let (transport, inbound, local_addr) = UdpTransport::bind(&args.bind.to_string()).await?;

    let seeds: Vec<Contact> = args
        .seeds
        .iter()
        .map(|peer| Contact::new(peer.id, peer.addr.to_string(), PROTOCOL_VERSION))
        .collect();

    let node = Node::spawn(
        keypair,
        local_addr.to_string(),
        seeds.clone(),
        Config::default(),
        Arc::new(SystemClock::new()),
        transport,
        inbound,
    );
    info!("node {}/{}", local_addr, node.id());

    if !seeds.is_empty() {
        for seed in &args.seeds {
            info!("joining via {}/{}", seed.addr, &seed.id.to_hex()[..16]);
        }
        match node.join(&seeds).await {
            Ok(()) => info!("joined the network"),
            Err(e) => warn!(error = %e, "join failed"),
        }
    }

    let mut status = time::interval(Duration::from_secs(args.status_interval.max(1)));

    // Graceful shutdown on Ctrl+C.
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down");
                node.leave().await;
                break;
            }
            _ = status.tick() => {
                let snapshot = node.snapshot().await;
                info!(
                    contacts = snapshot.contacts,
                    buckets = snapshot.buckets,
                    items = snapshot.items,
                    pending = snapshot.pending_requests,
                    "status"
                );
            }
        }
    }

    Ok(())
}
