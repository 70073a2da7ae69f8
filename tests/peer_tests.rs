//! Two-node integration tests over real loopback TCP.
//!
//! Unlike the unit tests inside `dial.rs`/`realm.rs` (which exercise the
//! same algorithms against an in-process `MockTransport`), these stand up
//! real `Node`s backed by `Libp2pTransport` to confirm the pieces actually
//! compose end to end: identity loading, TCP dialing, and realm membership
//! exchange over a live socket.

use std::{sync::Arc, time::Duration};

use dep2p_core::{
    config::Config,
    dial::DialOptions,
    discovery::{memory::InMemoryDiscovery, DiscoveryProvider},
    node::Node,
    protocol::types::RealmKey,
};
use libp2p::Multiaddr;
use tokio::time::timeout;

fn node_config(port: u16) -> Config {
    let mut config = Config::preset_minimal();
    config.transport.listen_addrs = vec![format!("/ip4/127.0.0.1/tcp/{port}").parse().unwrap()];
    // No outbound network access in these tests; STUN would only add a
    // multi-second timeout before `Node::run` gets to its other loops.
    config.nat.stun_servers = vec![];
    config
}

// ── Direct dial over real TCP ─────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn direct_dial_over_real_tcp_succeeds() {
    let node_a = Node::new(node_config(18911), None).await.unwrap();
    let node_b = Node::new(node_config(18912), None).await.unwrap();

    let handle_b = node_b.handle();
    let a_addr: Multiaddr = format!("/ip4/127.0.0.1/tcp/18911/p2p/{}", node_a.local_peer_id())
        .parse()
        .unwrap();

    let mut opts = DialOptions::new();
    opts.addr_hints = vec![a_addr];
    opts.dial_timeout = Duration::from_secs(5);

    let outcome = timeout(Duration::from_secs(10), handle_b.dial(node_a.local_peer_id(), opts))
        .await
        .expect("dial timed out")
        .expect("dial failed");

    assert_eq!(outcome.peer_id(), node_a.local_peer_id());
    assert!(!outcome.via_relay(), "loopback dial must succeed directly, no relay needed");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn dialing_an_unreachable_address_with_no_realm_fails_with_no_path() {
    let node = Node::new(node_config(18913), None).await.unwrap();
    let handle = node.handle();

    // Nothing is listening on this port.
    let dead_addr: Multiaddr = format!("/ip4/127.0.0.1/tcp/18914/p2p/{}", libp2p::PeerId::random())
        .parse()
        .unwrap();
    let target = libp2p::PeerId::random();

    let mut opts = DialOptions::new();
    opts.addr_hints = vec![dead_addr];
    opts.dial_timeout = Duration::from_millis(500);

    let err = timeout(Duration::from_secs(10), handle.dial(target, opts))
        .await
        .expect("dial should not hang")
        .unwrap_err();
    assert_eq!(err.kind(), dep2p_core::error::ErrorKind::NoPath);
}

// ── Realm membership across two real nodes ────────────────────────────────────

/// Two nodes sharing an `InMemoryDiscovery` backend join the same realm and
/// discover each other through the realm manager's discovery-poll +
/// mutual-auth handshake, driven by `Node::run`'s background tasks.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn two_nodes_join_same_realm_and_authenticate_each_other() {
    let discovery = Arc::new(InMemoryDiscovery::new());

    let node_a = Node::new(node_config(18921), Some(discovery.clone())).await.unwrap();
    let node_b = Node::new(node_config(18922), Some(discovery.clone())).await.unwrap();

    let handle_a = node_a.handle();
    let handle_b = node_b.handle();

    let task_a = tokio::spawn(Arc::clone(&node_a).run());
    let task_b = tokio::spawn(Arc::clone(&node_b).run());

    let key = RealmKey::generate();
    let a_addr: Multiaddr = format!("/ip4/127.0.0.1/tcp/18921/p2p/{}", handle_a.local_peer_id())
        .parse()
        .unwrap();
    let b_addr: Multiaddr = format!("/ip4/127.0.0.1/tcp/18922/p2p/{}", handle_b.local_peer_id())
        .parse()
        .unwrap();

    let realm_id_a = handle_a.join_realm(key.clone(), a_addr).await.unwrap();
    let realm_id_b = handle_b.join_realm(key, b_addr).await.unwrap();
    assert_eq!(realm_id_a, realm_id_b);

    timeout(Duration::from_secs(15), async {
        loop {
            let members = handle_a.realm_members().await;
            if members.iter().any(|m| m.peer_id == handle_b.local_peer_id()) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    })
    .await
    .expect("node A never admitted node B as a realm member");

    timeout(Duration::from_secs(15), async {
        loop {
            let members = handle_b.realm_members().await;
            if members.iter().any(|m| m.peer_id == handle_a.local_peer_id()) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    })
    .await
    .expect("node B never admitted node A as a realm member");

    // The protocol-id rewriting shim should now resolve into the shared realm.
    let rewritten_a = handle_a.rewrite_protocol("chat").await.unwrap();
    let rewritten_b = handle_b.rewrite_protocol("chat").await.unwrap();
    assert_eq!(rewritten_a, rewritten_b);

    task_a.abort();
    task_b.abort();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn leaving_a_realm_removes_the_discovery_registration() {
    let discovery = Arc::new(InMemoryDiscovery::new());
    let node = Node::new(node_config(18931), Some(discovery.clone())).await.unwrap();
    let handle = node.handle();

    let key = RealmKey::generate();
    let addr: Multiaddr = format!("/ip4/127.0.0.1/tcp/18931/p2p/{}", handle.local_peer_id())
        .parse()
        .unwrap();
    let realm_id = handle.join_realm(key, addr).await.unwrap();
    let room = realm_id.discovery_key_hash();

    assert_eq!(discovery.fetch_peers(&room).unwrap().len(), 1);

    handle.leave_realm().await.unwrap();

    assert!(
        discovery.fetch_peers(&room).unwrap().is_empty(),
        "leaving a realm must remove this node's discovery registration"
    );
}
