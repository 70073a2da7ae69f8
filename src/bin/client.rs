//! `dep2p-client` — diagnostic CLI for a single dep2p node.
//!
//! Brings up a node, optionally joins a realm, optionally dials a peer by
//! id, and prints connectivity/realm/disconnect events to stdout until
//! Ctrl-C. Intended for manual testing of the reachability/relay/hole-punch
//! stack, not as an application runtime.

use std::path::PathBuf;

use clap::Parser;
use dep2p_core::{
    config::Config,
    dial::DialOptions,
    events::Topic,
    node::Node,
    protocol::types::RealmKey,
};
use libp2p::{Multiaddr, PeerId};

#[derive(Parser, Debug)]
#[command(name = "dep2p-client", about = "Diagnostic CLI for a dep2p node")]
struct Args {
    /// TCP listen address.
    #[arg(long, default_value = "/ip4/0.0.0.0/tcp/0")]
    listen: Multiaddr,

    /// Path to persist this node's keypair (stable PeerId across runs).
    #[arg(long)]
    keypair: Option<PathBuf>,

    /// Config preset to start from.
    #[arg(long, default_value = "desktop")]
    preset: String,

    /// Hex-encoded 32-byte realm key to join on startup.
    #[arg(long)]
    realm_key: Option<String>,

    /// Peer to dial once the node is up.
    #[arg(long)]
    dial: Option<PeerId>,

    /// Full address hint for --dial (repeatable).
    #[arg(long = "addr")]
    addr_hints: Vec<Multiaddr>,
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
    config.validate().map_err(|e| anyhow::anyhow!("{e}"))?;

    let node = Node::new(config, None).await.map_err(|e| anyhow::anyhow!("{e}"))?;
    let handle = node.handle();
    println!("local peer id: {}", handle.local_peer_id());

    if let Some(hex_key) = &args.realm_key {
        let raw = hex::decode(hex_key).map_err(|e| anyhow::anyhow!("invalid --realm-key: {e}"))?;
        let key_bytes: [u8; 32] = raw
            .try_into()
            .map_err(|_| anyhow::anyhow!("--realm-key must be exactly 32 bytes (64 hex chars)"))?;
        let advertise: Multiaddr = format!("/ip4/0.0.0.0/tcp/0/p2p/{}", handle.local_peer_id()).parse().unwrap();
        let realm_id = handle
            .join_realm(RealmKey::from_bytes(key_bytes), advertise)
            .await
            .map_err(|e| anyhow::anyhow!("{e}"))?;
        println!("joined realm {}", realm_id.to_hex());
    }

    spawn_event_logger(&handle, Topic::Connectivity);
    spawn_event_logger(&handle, Topic::Relay);
    spawn_event_logger(&handle, Topic::HolePunch);
    spawn_event_logger(&handle, Topic::Realm);
    spawn_event_logger(&handle, Topic::Disconnect);

    if let Some(target) = args.dial {
        let handle = handle.clone();
        let addr_hints = args.addr_hints.clone();
        tokio::spawn(async move {
            let mut opts = DialOptions::new();
            opts.addr_hints = addr_hints;
            match handle.dial(target, opts).await {
                Ok(outcome) => println!("dial succeeded: via_relay={}", outcome.via_relay()),
                Err(e) => eprintln!("dial failed: {e}"),
            }
        });
    }

    node.run().await.map_err(|e| anyhow::anyhow!("{e}"))
}

fn spawn_event_logger(handle: &dep2p_core::node::NodeHandle, topic: Topic) {
    let mut rx = handle.subscribe(topic);
    tokio::spawn(async move {
        loop {
            match dep2p_core::events::recv_skipping_lag(&mut rx).await {
                Ok(event) => println!("[{topic:?}] {event:?}"),
                Err(_) => return,
            }
        }
    });
}
