//! Default, in-tree `Transport` implementation: TCP + Noise + Yamux, with
//! `identify`+`ping` for liveness/metadata and `libp2p_stream` for
//! raw, protocol-id-keyed substreams.
//!
//! Generalizes the teacher's `transport::build_transport` +
//! `node.rs` Swarm-driving event loop: a background task owns the `Swarm`
//! and is the only thing that ever touches it, translating `SwarmEvent`s
//! into resolved dial futures over `oneshot` channels exactly as
//! `P2pNode::run` translates them into `P2pEvent`s. Stream open/accept
//! goes through `libp2p_stream::Control`, which already is its own
//! channel-backed handle into the behaviour — no extra plumbing needed
//! there.
//!
//! Deliberately does not depend on `libp2p-relay`/`libp2p-dcutr`/`autonat`:
//! the Relay Subsystem and Hole-Punch Coordinator are hand-rolled
//! application protocols over this transport (spec.md §4.2/§4.3 wire
//! formats are not compatible with libp2p's own protobuf-based relay v2),
//! so this transport only needs to move authenticated byte streams between
//! verified peer ids.

use std::{collections::HashMap, fs, path::Path, sync::Arc, time::Duration};

use async_trait::async_trait;
use futures::StreamExt;
use libp2p::{
    core::{muxing::StreamMuxerBox, upgrade},
    identify, identity, noise,
    stream::{self, IncomingStreams},
    swarm::{Config as SwarmConfig, NetworkBehaviour, Swarm, SwarmEvent},
    tcp, yamux, Multiaddr, PeerId, StreamProtocol, Transport as _,
};
use tokio::sync::{broadcast, mpsc, oneshot, Mutex};

use crate::error::P2pError;

use super::{AsyncDuplex, BoxedStream, ConnectionEvent, Inbound};

/// Bound on the connection-event broadcast channel: a slow or absent
/// subscriber just misses old events rather than backpressuring the Swarm
/// event loop (the same tradeoff `EventBus` makes, spec.md §4.10).
const CONNECTION_EVENTS_CAPACITY: usize = 256;

const IDENTIFY_PROTO_VERSION: &str = "/dep2p/id/1.0.0";

#[derive(NetworkBehaviour)]
#[behaviour(out_event = "Event")]
struct Behaviour {
    identify: identify::Behaviour,
    ping: libp2p::ping::Behaviour,
    stream: stream::Behaviour,
}

#[derive(Debug)]
enum Event {
    Identify(identify::Event),
    Ping(libp2p::ping::Event),
}

impl From<identify::Event> for Event {
    fn from(e: identify::Event) -> Self {
        Event::Identify(e)
    }
}
impl From<libp2p::ping::Event> for Event {
    fn from(e: libp2p::ping::Event) -> Self {
        Event::Ping(e)
    }
}

enum SwarmCommand {
    Dial {
        addr: Multiaddr,
        expected_peer: Option<PeerId>,
        reply: oneshot::Sender<Result<PeerId, P2pError>>,
    },
    Listen {
        addr: Multiaddr,
        reply: oneshot::Sender<Result<(), P2pError>>,
    },
}

/// Load a persisted `identity::Keypair` from `path`, or generate and
/// persist a new one. Re-exported here (rather than only in `identity.rs`)
/// because the relay/client binaries construct a transport directly from a
/// path without going through the full `Config`.
pub fn load_or_create_keypair(path: &Path) -> Result<identity::Keypair, P2pError> {
    if path.exists() {
        let raw = fs::read(path).map_err(|e| P2pError::internal(format!("read keypair: {e}")))?;
        return identity::Keypair::from_protobuf_encoding(&raw)
            .map_err(|e| P2pError::internal(format!("corrupt keypair file: {e}")));
    }
    let key = identity::Keypair::generate_ed25519();
    let raw = key
        .to_protobuf_encoding()
        .map_err(|e| P2pError::internal(format!("encode keypair: {e}")))?;
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| P2pError::internal(format!("mkdir: {e}")))?;
    }
    fs::write(path, &raw).map_err(|e| P2pError::internal(format!("write keypair: {e}")))?;
    Ok(key)
}

pub struct Libp2pTransport {
    local_peer_id: PeerId,
    cmd_tx: mpsc::Sender<SwarmCommand>,
    stream_control: Mutex<stream::Control>,
    connection_events_tx: broadcast::Sender<ConnectionEvent>,
}

impl Libp2pTransport {
    /// Build the transport and spawn its background Swarm-driving task.
    /// `idle_timeout` mirrors the teacher's 30s default — long enough for
    /// a relay reservation refresh or a hole-punch attempt to land before
    /// the connection is reaped.
    pub fn new(key: identity::Keypair, idle_timeout: Duration) -> Result<Arc<Self>, P2pError> {
        let local_peer_id = PeerId::from(key.public());

        let noise_config =
            noise::Config::new(&key).map_err(|e| P2pError::internal(format!("noise: {e}")))?;
        let transport = tcp::tokio::Transport::new(tcp::Config::default().nodelay(true))
            .upgrade(upgrade::Version::V1)
            .authenticate(noise_config)
            .multiplex(yamux::Config::default())
            .boxed();

        let stream_behaviour = stream::Behaviour::new();
        let stream_control = stream_behaviour.new_control();

        let behaviour = Behaviour {
            identify: identify::Behaviour::new(identify::Config::new(
                IDENTIFY_PROTO_VERSION.into(),
                key.public(),
            )),
            ping: libp2p::ping::Behaviour::new(
                libp2p::ping::Config::new().with_interval(Duration::from_secs(15)),
            ),
            stream: stream_behaviour,
        };

        let swarm_config = SwarmConfig::with_tokio_executor().with_idle_connection_timeout(idle_timeout);
        let swarm = Swarm::new(
            transport.map(|(p, m), _| (p, StreamMuxerBox::new(m))).boxed(),
            behaviour,
            local_peer_id,
            swarm_config,
        );

        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        let (connection_events_tx, _) = broadcast::channel(CONNECTION_EVENTS_CAPACITY);
        tokio::spawn(run_event_loop(swarm, cmd_rx, connection_events_tx.clone()));

        Ok(Arc::new(Self {
            local_peer_id,
            cmd_tx,
            stream_control: Mutex::new(stream_control),
            connection_events_tx,
        }))
    }
}

async fn run_event_loop(
    mut swarm: Swarm<Behaviour>,
    mut cmd_rx: mpsc::Receiver<SwarmCommand>,
    connection_events_tx: broadcast::Sender<ConnectionEvent>,
) {
    let mut pending_dials: HashMap<PeerId, Vec<oneshot::Sender<Result<PeerId, P2pError>>>> = HashMap::new();

    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => {
                match cmd {
                    None => return,
                    Some(SwarmCommand::Listen { addr, reply }) => {
                        let res = swarm
                            .listen_on(addr)
                            .map(|_| ())
                            .map_err(|e| P2pError::internal(format!("listen: {e}")));
                        let _ = reply.send(res);
                    }
                    Some(SwarmCommand::Dial { addr, expected_peer, reply }) => {
                        match swarm.dial(addr) {
                            Ok(()) => {
                                if let Some(peer) = expected_peer {
                                    pending_dials.entry(peer).or_default().push(reply);
                                } else {
                                    let _ = reply.send(Err(P2pError::internal(
                                        "dial address has no /p2p/<id> component",
                                    )));
                                }
                            }
                            Err(e) => {
                                let _ = reply.send(Err(P2pError::internal(format!("dial: {e}"))));
                            }
                        }
                    }
                }
            }
            event = swarm.select_next_some() => {
                match event {
                    SwarmEvent::ConnectionEstablished { peer_id, .. } => {
                        tracing::debug!("transport: connected to {peer_id}");
                        if let Some(waiters) = pending_dials.remove(&peer_id) {
                            for w in waiters {
                                let _ = w.send(Ok(peer_id));
                            }
                        }
                    }
                    SwarmEvent::OutgoingConnectionError { peer_id: Some(peer_id), error, .. } => {
                        if let Some(waiters) = pending_dials.remove(&peer_id) {
                            for w in waiters {
                                let _ = w.send(Err(P2pError::internal(format!("dial failed: {error}"))));
                            }
                        }
                    }
                    SwarmEvent::ConnectionClosed { peer_id, .. } => {
                        tracing::debug!("transport: disconnected from {peer_id}");
                        let _ = connection_events_tx.send(ConnectionEvent::Closed { peer_id });
                    }
                    SwarmEvent::NewListenAddr { address, .. } => {
                        tracing::info!("transport: listening on {address}");
                    }
                    SwarmEvent::Behaviour(Event::Ping(ping_event)) => {
                        if ping_event.result.is_err() {
                            let _ = connection_events_tx
                                .send(ConnectionEvent::PingFailed { peer_id: ping_event.peer });
                        }
                    }
                    _ => {}
                }
            }
        }
    }
}

#[async_trait]
impl super::Transport for Libp2pTransport {
    fn local_peer_id(&self) -> PeerId {
        self.local_peer_id
    }

    async fn dial(&self, addr: &Multiaddr, deadline: Duration) -> Result<PeerId, P2pError> {
        let expected_peer = crate::multiaddr::peer_id_of(addr);
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(SwarmCommand::Dial {
                addr: addr.clone(),
                expected_peer,
                reply: reply_tx,
            })
            .await
            .map_err(|_| P2pError::shutdown())?;

        match tokio::time::timeout(deadline, reply_rx).await {
            Ok(Ok(res)) => res,
            Ok(Err(_)) => Err(P2pError::shutdown()),
            Err(_) => Err(P2pError::timeout(format!("dial {addr} exceeded {deadline:?}"))),
        }
    }

    async fn listen(&self, addr: Multiaddr) -> Result<(), P2pError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(SwarmCommand::Listen { addr, reply: reply_tx })
            .await
            .map_err(|_| P2pError::shutdown())?;
        reply_rx.await.map_err(|_| P2pError::shutdown())?
    }

    fn can_dial(&self, addr: &Multiaddr) -> bool {
        addr.iter().any(|p| matches!(p, libp2p::multiaddr::Protocol::Tcp(_)))
    }

    fn protocols(&self) -> &[&str] {
        &["tcp"]
    }

    fn is_relayed(&self, _peer_id: PeerId) -> bool {
        // This transport never multiplexes libp2p's own circuit-relay
        // connections (see module docs); the relay/dial-engine layers track
        // "is this peer's traffic currently going over our own relay
        // circuit protocol" themselves.
        false
    }

    async fn open_stream(
        &self,
        peer_id: PeerId,
        protocol: &str,
        deadline: Duration,
    ) -> Result<BoxedStream, P2pError> {
        let proto = StreamProtocol::try_from_owned(protocol.to_owned())
            .map_err(|e| P2pError::internal(format!("invalid protocol id '{protocol}': {e}")))?;
        let mut control = self.stream_control.lock().await.clone();
        let fut = control.open_stream(peer_id, proto);
        match tokio::time::timeout(deadline, fut).await {
            Ok(Ok(stream)) => Ok(Box::pin(stream) as BoxedStream),
            Ok(Err(e)) => Err(P2pError::with_peer(
                crate::error::ErrorKind::Io,
                peer_id,
                format!("open_stream: {e}"),
            )),
            Err(_) => Err(P2pError::timeout(format!("open_stream {protocol} to {peer_id}"))),
        }
    }

    async fn accept_streams(&self, protocol: &str) -> Result<mpsc::Receiver<Inbound>, P2pError> {
        let proto = StreamProtocol::try_from_owned(protocol.to_owned())
            .map_err(|e| P2pError::internal(format!("invalid protocol id '{protocol}': {e}")))?;
        let incoming: IncomingStreams = {
            let mut control = self.stream_control.lock().await.clone();
            control
                .accept(proto)
                .map_err(|e| P2pError::internal(format!("accept {protocol}: {e}")))?
        };

        let (tx, rx) = mpsc::channel(64);
        let protocol_owned = protocol.to_owned();
        tokio::spawn(async move {
            let mut incoming = incoming;
            while let Some((peer_id, stream)) = incoming.next().await {
                let inbound = Inbound {
                    peer_id,
                    protocol: protocol_owned.clone(),
                    stream: Box::pin(stream) as BoxedStream,
                };
                if tx.send(inbound).await.is_err() {
                    return;
                }
            }
        });
        Ok(rx)
    }

    fn connection_events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.connection_events_tx.subscribe()
    }
}

#[allow(dead_code)]
fn assert_stream_is_duplex<S: AsyncDuplex>() {}
