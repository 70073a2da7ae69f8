//! `dep2p-relay` — standalone relay server binary.
//!
//! Usage:
//!   dep2p-relay --listen /ip4/0.0.0.0/tcp/4001 --keypair ./relay.key
//!
//! Runs a System Relay: control-plane circuits, no membership check,
//! bandwidth-capped (spec.md §4.2).

use std::path::PathBuf;

use clap::Parser;
use dep2p_core::{config::Config, node::Node};
use libp2p::Multiaddr;

#[derive(Parser, Debug)]
#[command(name = "dep2p-relay", about = "System relay server for dep2p nodes")]
struct Args {
    /// TCP listen address.
    #[arg(long, default_value = "/ip4/0.0.0.0/tcp/4001")]
    listen: Multiaddr,

    /// File to persist this relay's Ed25519 keypair.
    #[arg(long)]
    keypair: Option<PathBuf>,

    /// Config preset to start from before applying CLI overrides.
    #[arg(long, default_value = "server")]
    preset: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".parse().unwrap()),
        )
        .init();

    let args = Args::parse();

    let mut config = Config::preset(&args.preset).map_err(|e| anyhow::anyhow!("{e}"))?;
    config.transport.listen_addrs = vec![args.listen];
    config.identity.keypair_path = args.keypair;
    config.relay.server_enabled = true;
    config.validate().map_err(|e| anyhow::anyhow!("{e}"))?;

    let node = Node::new(config, None).await.map_err(|e| anyhow::anyhow!("{e}"))?;
    tracing::info!(peer_id = %node.local_peer_id(), "relay server ready");

    node.run().await.map_err(|e| anyhow::anyhow!("{e}"))
}
