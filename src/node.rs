//! Top-level node orchestrator: wires identity, transport, peerstore,
//! reachability, the relay subsystem, the hole-punch coordinator (via the
//! dial engine), the realm manager, the connection manager, and the
//! disconnect detector together, and drives their background loops.
//!
//! `NodeHandle` replaces the teacher's `P2pHandle` + `P2pCommand` queue.
//! The teacher needed a queue because only one task may ever hold `&mut
//! Swarm<P2pBehaviour>`; every subsystem here (`Peerstore`, `RealmManager`,
//! `DialEngine`, ...) already synchronizes itself internally, so the handle
//! holds `Arc` clones directly and calls straight through — there is no
//! single owner to serialize against.

use std::sync::Arc;

use libp2p::{identity, Multiaddr, PeerId};
use tokio::sync::Mutex as AsyncMutex;

use crate::{
    config::Config,
    connmgr::ConnectionManager,
    dial::{DialEngine, DialOptions, DialOutcome},
    disconnect::{DetectionMethod, DisconnectDetector},
    discovery::{memory::InMemoryDiscovery, DiscoveryProvider},
    error::P2pError,
    events::{Event, EventBus, Topic},
    holepunch::HolePunchCoordinator,
    identity::load_or_create_keypair,
    peerstore::Peerstore,
    protocol::types::{MemberRecord, RealmId, RealmKey},
    protocol_ids,
    reachability::ReachabilityEngine,
    realm::RealmManager,
    relay::{RelayClient, RelayServer, RelayTier},
    store::{InMemoryStore, Store},
    transport::{libp2p_transport::Libp2pTransport, BoxedStream, Transport},
};

/// Cheap-to-clone handle to a running [`Node`]. Every method forwards to an
/// `Arc`-held subsystem; cloning a handle costs one refcount bump per field.
#[derive(Clone)]
pub struct NodeHandle {
    local_peer_id: PeerId,
    events: EventBus,
    peerstore: Arc<Peerstore>,
    reachability: Arc<ReachabilityEngine>,
    relay_client: Arc<RelayClient>,
    realm: Arc<RealmManager>,
    conn_mgr: Arc<ConnectionManager>,
    disconnect: Arc<DisconnectDetector>,
    dial_engine: Arc<DialEngine>,
    allow_private_addrs: bool,
}

impl NodeHandle {
    pub fn local_peer_id(&self) -> PeerId {
        self.local_peer_id
    }

    /// Run the full dial algorithm against `target` (spec.md §4.4).
    pub async fn dial(&self, target: PeerId, opts: DialOptions) -> Result<DialOutcome, P2pError> {
        let outcome = self.dial_engine.dial(target, opts).await;
        match &outcome {
            Ok(o) => {
                self.conn_mgr.on_connected(o.peer_id()).await;
                self.disconnect.record_reconnect(o.peer_id()).await;
            }
            Err(_) => {}
        }
        outcome
    }

    /// Join a realm keyed by `key`, advertising `advertise_addr` as this
    /// node's reachable address within it. Only one realm may be active at
    /// a time (spec.md §4.5 single-realm invariant).
    pub async fn join_realm(&self, key: RealmKey, advertise_addr: Multiaddr) -> Result<RealmId, P2pError> {
        let realm_id = self.realm.join(key, advertise_addr).await?;
        self.disconnect.set_realm_size_hint(self.realm.member_count().await);
        Ok(realm_id)
    }

    pub async fn leave_realm(&self) -> Result<(), P2pError> {
        self.realm.leave().await
    }

    pub async fn current_realm_id(&self) -> Option<RealmId> {
        self.realm.current_realm_id().await
    }

    pub async fn realm_members(&self) -> Vec<MemberRecord> {
        self.realm.members().await
    }

    /// Rewrite a bare application protocol id into this node's active-realm
    /// namespace (spec.md §4.5 protocol-id rewriting shim).
    pub async fn rewrite_protocol(&self, user_proto: &str) -> Result<String, P2pError> {
        self.realm.rewrite_protocol(user_proto).await
    }

    /// This node's currently publishable addresses (spec.md §4.1,
    /// priority >= 50).
    pub async fn publishable_addresses(&self) -> Vec<Multiaddr> {
        self.peerstore.publishable_addresses(self.local_peer_id, self.allow_private_addrs).await
    }

    pub fn reachability(&self) -> &ReachabilityEngine {
        &self.reachability
    }

    pub fn connection_manager(&self) -> &ConnectionManager {
        &self.conn_mgr
    }

    pub fn disconnect_detector(&self) -> &DisconnectDetector {
        &self.disconnect
    }

    pub fn relay_client(&self) -> &Arc<RelayClient> {
        &self.relay_client
    }

    pub fn subscribe(&self, topic: Topic) -> tokio::sync::broadcast::Receiver<Event> {
        self.events.subscribe(topic)
    }

    pub fn subscribe_with_replay(&self, topic: Topic) -> (Option<Event>, tokio::sync::broadcast::Receiver<Event>) {
        self.events.subscribe_with_replay(topic)
    }
}

/// Owns every subsystem and the background tasks that drive them.
/// Construct with [`Node::new`], obtain handles with [`Node::handle`], then
/// call [`Node::run`] to start the background loops and block until
/// shutdown.
pub struct Node {
    config: Config,
    local_peer_id: PeerId,
    transport: Arc<dyn Transport>,
    #[allow(dead_code)]
    store: Arc<dyn Store>,
    peerstore: Arc<Peerstore>,
    reachability: Arc<ReachabilityEngine>,
    relay_client: Arc<RelayClient>,
    /// The relay server this node runs, if `relay.server_enabled`. Both
    /// tiers speak the same `/dep2p/sys/relay/1.0.0` signaling protocol
    /// (spec.md §6), so only one accept loop may be registered with the
    /// transport at a time: System tier while this node holds no realm
    /// membership, swapped for Realm tier (spec.md §4.2) once it joins one,
    /// and back on leave. See `run_relay_server_lifecycle`.
    relay_server: Arc<AsyncMutex<Option<(Arc<RelayServer>, tokio::task::JoinHandle<()>)>>>,
    realm: Arc<RealmManager>,
    conn_mgr: Arc<ConnectionManager>,
    disconnect: Arc<DisconnectDetector>,
    dial_engine: Arc<DialEngine>,
    events: EventBus,
}

impl Node {
    /// Build every subsystem from `config` without starting any background
    /// task or listener. `discovery` defaults to an in-process
    /// [`InMemoryDiscovery`] when `None` — a real deployment supplies its
    /// own backend (e.g. the `git` one behind the `git-discovery` feature).
    pub async fn new(config: Config, discovery: Option<Arc<dyn DiscoveryProvider>>) -> Result<Arc<Self>, P2pError> {
        config.validate()?;

        let keypair = match &config.identity.keypair_path {
            Some(path) => load_or_create_keypair(path)?,
            None => identity::Keypair::generate_ed25519(),
        };
        let local_peer_id = PeerId::from(keypair.public());
        tracing::info!(peer_id = %local_peer_id, "node: starting");

        let transport: Arc<dyn Transport> =
            Libp2pTransport::new(keypair, config.connection_health.idle_timeout.get())?;

        let peerstore = Arc::new(Peerstore::new());
        let events = EventBus::new(config.messaging.event_bus_subscription_buffer);
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::default());

        let reachability = Arc::new(ReachabilityEngine::new(
            local_peer_id,
            0,
            config.nat.clone(),
            Arc::clone(&peerstore),
            events.clone(),
        ));

        let relay_client = RelayClient::new(Arc::clone(&transport));
        let relay_server: Arc<AsyncMutex<Option<(Arc<RelayServer>, tokio::task::JoinHandle<()>)>>> =
            Arc::new(AsyncMutex::new(None));

        let discovery: Arc<dyn DiscoveryProvider> = discovery.unwrap_or_else(|| Arc::new(InMemoryDiscovery::new()));
        let realm = RealmManager::new(
            local_peer_id,
            Arc::clone(&transport),
            discovery,
            events.clone(),
            config.realm,
            config.discovery.clone(),
            config.security.clone(),
        );

        let conn_mgr = Arc::new(ConnectionManager::new(config.conn_mgr));
        let disconnect = Arc::new(DisconnectDetector::new(config.realm, events.clone()));

        let dial_engine = Arc::new(DialEngine::new(
            local_peer_id,
            Arc::clone(&transport),
            Arc::clone(&peerstore),
            Arc::clone(&relay_client),
            Arc::clone(&realm),
            config.nat.clone(),
            config.path_health,
            events.clone(),
        ));

        for addr in &config.transport.listen_addrs {
            transport.listen(addr.clone()).await?;
        }

        Ok(Arc::new(Self {
            config,
            local_peer_id,
            transport,
            store,
            peerstore,
            reachability,
            relay_client,
            relay_server,
            realm,
            conn_mgr,
            disconnect,
            dial_engine,
            events,
        }))
    }

    pub fn local_peer_id(&self) -> PeerId {
        self.local_peer_id
    }

    pub fn handle(&self) -> NodeHandle {
        NodeHandle {
            local_peer_id: self.local_peer_id,
            events: self.events.clone(),
            peerstore: Arc::clone(&self.peerstore),
            reachability: Arc::clone(&self.reachability),
            relay_client: Arc::clone(&self.relay_client),
            realm: Arc::clone(&self.realm),
            conn_mgr: Arc::clone(&self.conn_mgr),
            disconnect: Arc::clone(&self.disconnect),
            dial_engine: Arc::clone(&self.dial_engine),
            allow_private_addrs: self.config.nat.allow_private_addrs,
        }
    }

    /// Spawn every background loop (STUN reprobing, relay reservation
    /// refresh, realm discovery polling, realm auth responder, connection
    /// manager decay, disconnect-protection sweep, and — if enabled — the
    /// relay server's accept loop) and run until `Ctrl-C` or a fatal error.
    pub async fn run(self: Arc<Self>) -> Result<(), P2pError> {
        self.reachability.probe().await;

        let mut tasks = Vec::new();

        tasks.push(tokio::spawn({
            let reachability = Arc::clone(&self.reachability);
            let interval = self.config.nat.stun_initial_timeout.get().max(std::time::Duration::from_secs(30));
            async move {
                let mut ticker = tokio::time::interval(interval * 4);
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    reachability.probe().await;
                }
            }
        }));

        tasks.push(tokio::spawn(Arc::clone(&self.relay_client).run_refresh_loop()));
        tasks.push(tokio::spawn(Arc::clone(&self.realm).run_discovery_loop()));
        tasks.push(tokio::spawn(Arc::clone(&self.realm).run_auth_responder()));
        tasks.push(tokio::spawn(Arc::clone(&self.conn_mgr).run_decay_loop()));

        tasks.push(tokio::spawn({
            let disconnect = Arc::clone(&self.disconnect);
            let interval = self.config.realm.oscillation_window.get().max(std::time::Duration::from_secs(5));
            async move {
                let mut ticker = tokio::time::interval(interval);
                loop {
                    ticker.tick().await;
                    disconnect.sweep_expired_protection().await;
                    disconnect.expire_unconfirmed_suspicions().await;
                }
            }
        }));

        tasks.push(tokio::spawn({
            let disconnect = Arc::clone(&self.disconnect);
            let interval = (self.config.realm.reconnect_grace_period.get() / 4).max(std::time::Duration::from_secs(1));
            async move {
                let mut ticker = tokio::time::interval(interval);
                loop {
                    ticker.tick().await;
                    disconnect.finalize_expired_disconnecting().await;
                }
            }
        }));

        tasks.push(tokio::spawn(Arc::clone(&self).run_disconnect_signal_relay()));

        if self.config.relay.server_enabled {
            self.swap_relay_server(RelayTier::System, self.config.relay.system_relay_bandwidth_bps).await;
            tasks.push(tokio::spawn(Arc::clone(&self).run_relay_server_lifecycle()));
        } else {
            // A `RelayServer`, when running, owns the sole
            // `/dep2p/sys/relay/1.0.0` accept-loop registration and forwards
            // inbound `Connect`s addressed to this node itself as part of
            // brokering for other peers (see `relay/server.rs`), so this
            // loop would conflict with it. Without a server, this node still
            // needs to answer circuits a relay it reserved with forwards on
            // our behalf — see `run_circuit_responder`.
            tasks.push(tokio::spawn(Arc::clone(&self).run_circuit_responder()));
        }

        tokio::signal::ctrl_c().await.ok();
        tracing::info!("node: shutting down");
        self.realm.leave().await.ok();
        if let Some((_, handle)) = self.relay_server.lock().await.take() {
            handle.abort();
        }
        for t in tasks {
            t.abort();
        }
        Ok(())
    }

    /// Replace whatever relay server is currently running (if any) with a
    /// freshly constructed one for `tier`, re-registering the
    /// `/dep2p/sys/relay/1.0.0` accept loop. Both tiers share that one
    /// signaling protocol (spec.md §6), so exactly one server may hold it at
    /// a time; the old server's accept loop is aborted before the new one
    /// starts.
    async fn swap_relay_server(&self, tier: RelayTier, bandwidth_bps: u64) {
        let server = RelayServer::new(
            tier,
            Arc::clone(&self.transport),
            self.config.relay,
            self.config.transport.listen_addrs.clone(),
            bandwidth_bps,
        );
        let task_server = Arc::clone(&server);
        let handle = tokio::spawn(async move {
            if let Err(e) = task_server.run().await {
                tracing::warn!("relay server exited: {e}");
            }
        });
        let mut guard = self.relay_server.lock().await;
        if let Some((_, old_handle)) = guard.take() {
            old_handle.abort();
        }
        *guard = Some((server, handle));
    }

    /// Swap the relay server between System and Realm tier as this node
    /// joins and leaves realms (spec.md §4.2), and forward `MemberAdded`/
    /// `MemberRemoved` events into the active server's membership-admission
    /// set so `Reserve`/`Connect` gating (spec.md §4.2 "Admission") reflects
    /// the membership proofs this node has already verified via
    /// `RealmManager`'s auth responder.
    async fn run_relay_server_lifecycle(self: Arc<Self>) {
        let mut rx = self.events.subscribe(Topic::Realm);
        loop {
            let event = match rx.recv().await {
                Ok(event) => event,
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
            };
            match event {
                Event::RealmJoined { realm_id } => {
                    let realm_id_hex = hex::encode(realm_id);
                    self.swap_relay_server(
                        RelayTier::Realm { realm_id_hex },
                        self.config.bandwidth.realm_relay_bandwidth_bps,
                    )
                    .await;
                }
                Event::RealmLeft { .. } => {
                    self.swap_relay_server(RelayTier::System, self.config.relay.system_relay_bandwidth_bps).await;
                }
                Event::MemberAdded { peer_id } => {
                    if let Some((server, _)) = self.relay_server.lock().await.as_ref() {
                        server.mark_member_verified(peer_id).await;
                    }
                    self.disconnect.set_realm_size_hint(self.realm.member_count().await);
                }
                Event::MemberRemoved { peer_id, .. } => {
                    if let Some((server, _)) = self.relay_server.lock().await.as_ref() {
                        server.unmark_member(&peer_id).await;
                    }
                    self.realm.remove_member(&peer_id).await;
                    self.disconnect.set_realm_size_hint(self.realm.member_count().await);
                }
                _ => {}
            }
        }
    }

    /// Forward the transport's connection-lifecycle signals into the
    /// Disconnect Detector (spec.md §4.7): a transport-level close is
    /// high-trust and transitions the peer immediately, a ping failure is
    /// low-trust and opens a witness confirmation round instead.
    async fn run_disconnect_signal_relay(self: Arc<Self>) {
        let mut rx = self.transport.connection_events();
        loop {
            let event = match rx.recv().await {
                Ok(event) => event,
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
            };
            match event {
                crate::transport::ConnectionEvent::Closed { peer_id } => {
                    self.disconnect.report_high_trust(peer_id, DetectionMethod::ConnectionClosed).await;
                }
                crate::transport::ConnectionEvent::PingFailed { peer_id } => {
                    self.disconnect.report_low_trust(peer_id, DetectionMethod::PingFailure).await;
                }
            }
        }
    }

    /// Accept circuits a relay forwards to this node as the destination
    /// (spec.md §4.4 step 5 from the other side): each inbound stream on
    /// `/dep2p/sys/relay/1.0.0` is a `Connect` the relay is relaying on
    /// behalf of some peer that dialed us and already opened a circuit
    /// through a relay we hold a reservation with. Never spawned on a node
    /// that runs its own `RelayServer` (see the call site in `run`).
    async fn run_circuit_responder(self: Arc<Self>) {
        let mut incoming = match self.transport.accept_streams(protocol_ids::RELAY).await {
            Ok(rx) => rx,
            Err(e) => {
                tracing::warn!("node: failed to accept relay circuit streams: {e}");
                return;
            }
        };
        while let Some(inbound) = incoming.recv().await {
            let node = Arc::clone(&self);
            tokio::spawn(async move {
                if let Err(e) = node.handle_inbound_circuit(inbound.stream).await {
                    tracing::debug!("node: inbound relay circuit failed: {e}");
                }
            });
        }
    }

    /// Answer one forwarded circuit: complete the relay handshake, then run
    /// the Hole-Punch Coordinator's responder half so the dialer's
    /// simultaneous-open race has a partner. Whether or not the punch
    /// succeeds, the circuit itself already carries the connection (direct
    /// if the punch won, relay-carried otherwise) from this side's view, so
    /// both outcomes are reported as a successful inbound dial.
    async fn handle_inbound_circuit(self: &Arc<Self>, stream: BoxedStream) -> Result<(), P2pError> {
        let (source, _protocol, mut circuit) = RelayClient::accept_incoming_circuit(stream).await?;
        let shareable = self.peerstore.publishable_addresses(self.local_peer_id, self.config.nat.allow_private_addrs).await;
        let holepunch = HolePunchCoordinator::new(Arc::clone(&self.transport), self.config.path_health);

        match holepunch.respond(source, &mut circuit, shareable).await {
            Ok(outcome) => {
                self.conn_mgr.on_connected(outcome.peer_id).await;
                self.disconnect.record_reconnect(outcome.peer_id).await;
                self.events.publish(Topic::HolePunch, Event::HolePunchSucceeded { peer_id: source });
            }
            Err(e) => {
                tracing::debug!(peer_id = %source, "node: hole-punch responder failed, relay circuit remains as fallback: {e}");
                self.conn_mgr.on_connected(source).await;
                self.disconnect.record_reconnect(source).await;
                self.events.publish(Topic::HolePunch, Event::HolePunchFailed { peer_id: source, attempts: 1 });
            }
        }
        self.events.publish(Topic::Connectivity, Event::DialSucceeded { peer_id: source, via_relay: true });
        Ok(())
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    #[tokio::test]
    async fn node_constructs_and_exposes_a_handle() {
        let mut config = Config::preset_minimal();
        config.transport.listen_addrs = vec!["/ip4/127.0.0.1/tcp/0".parse().unwrap()];
        let node = Node::new(config, None).await.unwrap();
        let handle = node.handle();
        assert_eq!(handle.local_peer_id(), node.local_peer_id());
        assert!(handle.current_realm_id().await.is_none());
    }

    #[tokio::test]
    async fn join_and_leave_realm_round_trips() {
        let mut config = Config::preset_minimal();
        config.transport.listen_addrs = vec!["/ip4/127.0.0.1/tcp/0".parse().unwrap()];
        let node = Node::new(config, None).await.unwrap();
        let handle = node.handle();

        let key = RealmKey::generate();
        let addr: Multiaddr = format!("/ip4/127.0.0.1/tcp/4001/p2p/{}", handle.local_peer_id()).parse().unwrap();
        let realm_id = handle.join_realm(key, addr).await.unwrap();
        assert_eq!(handle.current_realm_id().await, Some(realm_id));

        handle.leave_realm().await.unwrap();
        assert!(handle.current_realm_id().await.is_none());
    }

    #[tokio::test]
    async fn dial_with_no_address_and_no_realm_is_rejected() {
        let mut config = Config::preset_minimal();
        config.transport.listen_addrs = vec!["/ip4/127.0.0.1/tcp/0".parse().unwrap()];
        let node = Node::new(config, None).await.unwrap();
        let handle = node.handle();
        let target = PeerId::random();
        let err = handle.dial(target, DialOptions::new()).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::AddressRequired);
    }

    /// A node with `relay.server_enabled` set runs a System Relay server by
    /// default, swaps it for a Realm Relay server once it joins a realm
    /// (both tiers share the one `/dep2p/sys/relay/1.0.0` signaling
    /// protocol, so only one may be registered at a time), and swaps back on
    /// leave (spec.md §4.2 tier 2; see `run_relay_server_lifecycle`).
    #[tokio::test]
    async fn relay_server_swaps_tier_on_realm_join_and_leave() {
        let mut config = Config::preset_minimal();
        config.transport.listen_addrs = vec!["/ip4/127.0.0.1/tcp/0".parse().unwrap()];
        config.relay.server_enabled = true;
        let node = Node::new(config, None).await.unwrap();

        node.swap_relay_server(RelayTier::System, node.config.relay.system_relay_bandwidth_bps).await;
        tokio::spawn(Arc::clone(&node).run_relay_server_lifecycle());
        assert_eq!(node.relay_server.lock().await.as_ref().unwrap().0.tier(), &RelayTier::System);

        let handle = node.handle();
        let key = RealmKey::generate();
        let addr: Multiaddr = format!("/ip4/127.0.0.1/tcp/4001/p2p/{}", handle.local_peer_id()).parse().unwrap();
        let realm_id = handle.join_realm(key, addr).await.unwrap();
        let expected = RelayTier::Realm { realm_id_hex: realm_id.to_hex() };

        for _ in 0..50 {
            if node.relay_server.lock().await.as_ref().unwrap().0.tier() == &expected {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(node.relay_server.lock().await.as_ref().unwrap().0.tier(), &expected);

        handle.leave_realm().await.unwrap();
        for _ in 0..50 {
            if node.relay_server.lock().await.as_ref().unwrap().0.tier() == &RelayTier::System {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(node.relay_server.lock().await.as_ref().unwrap().0.tier(), &RelayTier::System);
    }

    /// A node with no relay server of its own still answers a circuit a
    /// relay forwards to it (`run_circuit_responder`): it completes the
    /// relay handshake, runs the hole-punch responder over the circuit, and
    /// reports the result on the event bus either way, so a caller dialing
    /// this node through a relay always gets to race its own simultaneous
    /// dial against something on the other end.
    #[tokio::test]
    async fn inbound_circuit_responder_answers_and_reports_even_without_a_direct_path() {
        use crate::protocol::codec::RelayMessage;
        use tokio_util::compat::TokioAsyncReadCompatExt;

        let mut config = Config::preset_minimal();
        config.transport.listen_addrs = vec!["/ip4/127.0.0.1/tcp/0".parse().unwrap()];
        let node = Node::new(config, None).await.unwrap();
        let mut connectivity_rx = node.handle().subscribe(Topic::Connectivity);
        let mut holepunch_rx = node.handle().subscribe(Topic::HolePunch);

        let source_id = PeerId::random();
        let (local, remote) = tokio::io::duplex(64 * 1024);
        let dest_side: BoxedStream = Box::pin(local.compat());
        let mut source_side: BoxedStream = Box::pin(remote.compat());

        let node_for_task = Arc::clone(&node);
        let responder = tokio::spawn(async move { node_for_task.handle_inbound_circuit(dest_side).await });

        RelayMessage::Connect { dest: source_id, protocol: None }.write(&mut source_side).await.unwrap();
        let reply = RelayMessage::read(&mut source_side).await.unwrap();
        assert!(matches!(reply, RelayMessage::ConnectOk));

        let mock_net = crate::transport::mock::MockNetwork::new();
        let source_transport = mock_net.transport(source_id);
        let source_coord = HolePunchCoordinator::new(
            source_transport,
            crate::config::PathHealthConfig { holepunch_attempts: 1, ..Default::default() },
        );
        let outcome = source_coord.initiate(node.local_peer_id(), &mut source_side, vec![]).await;
        assert_eq!(outcome.unwrap_err().kind(), crate::error::ErrorKind::NoPath);

        responder.await.unwrap().unwrap();

        match holepunch_rx.recv().await.unwrap() {
            Event::HolePunchFailed { peer_id, .. } => assert_eq!(peer_id, source_id),
            other => panic!("unexpected event: {other:?}"),
        }
        match connectivity_rx.recv().await.unwrap() {
            Event::DialSucceeded { peer_id, via_relay } => {
                assert_eq!(peer_id, source_id);
                assert!(via_relay);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
