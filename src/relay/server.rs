//! Relay server: accepts `Reserve`/`Connect` requests on
//! `/dep2p/sys/relay/1.0.0` and brokers circuits between reserved peers.
//!
//! A reservation stream is short-lived — the relay answers `ReserveOk` and
//! the stream closes, the same way `node.rs`'s relay-dial bookkeeping treats
//! the underlying multiplexed connection (not any one stream on it) as the
//! thing that stays alive (spec.md §4.9). When a later `Connect` arrives for
//! a reserved dest peer, the server opens a *fresh* stream to that peer over
//! the still-live connection to deliver the inbound-connect notification,
//! then bridges the two streams byte-for-byte.

use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use futures::io::{AsyncReadExt, AsyncWriteExt};
use libp2p::PeerId;
use tokio::sync::Mutex;

use crate::{
    config::RelayConfig,
    error::P2pError,
    protocol::{
        codec::{RelayErrorCode, RelayMessage},
        types::{Circuit, CircuitState, ReservationRecord},
    },
    protocol_ids,
    transport::{BoxedStream, Inbound, Transport},
};

use super::{shard_of, RelayTier};

const SHARD_COUNT: usize = 8;
const SIGNAL_DEADLINE: Duration = Duration::from_secs(30);

pub struct RelayServer {
    tier: RelayTier,
    transport: Arc<dyn Transport>,
    config: RelayConfig,
    advertise_addrs: Vec<libp2p::Multiaddr>,
    realm_bandwidth_bps: u64,
    reservations: Vec<Mutex<HashMap<PeerId, ReservationRecord>>>,
    reservation_count: AtomicUsize,
    circuits: Mutex<HashMap<(PeerId, PeerId), Arc<Mutex<Circuit>>>>,
    circuit_count: AtomicUsize,
    verified_members: Mutex<HashSet<PeerId>>,
}

impl RelayServer {
    pub fn new(
        tier: RelayTier,
        transport: Arc<dyn Transport>,
        config: RelayConfig,
        advertise_addrs: Vec<libp2p::Multiaddr>,
        realm_bandwidth_bps: u64,
    ) -> Arc<Self> {
        let reservations = (0..SHARD_COUNT).map(|_| Mutex::new(HashMap::new())).collect();
        Arc::new(Self {
            tier,
            transport,
            config,
            advertise_addrs,
            realm_bandwidth_bps,
            reservations,
            reservation_count: AtomicUsize::new(0),
            circuits: Mutex::new(HashMap::new()),
            circuit_count: AtomicUsize::new(0),
            verified_members: Mutex::new(HashSet::new()),
        })
    }

    /// Record that `peer_id` has completed membership-proof authentication
    /// (spec.md §4.6); only meaningful for a `RelayTier::Realm` server,
    /// where it gates `Reserve`/`Connect` admission.
    pub async fn mark_member_verified(&self, peer_id: PeerId) {
        self.verified_members.lock().await.insert(peer_id);
    }

    pub async fn unmark_member(&self, peer_id: &PeerId) {
        self.verified_members.lock().await.remove(peer_id);
    }

    pub fn tier(&self) -> &RelayTier {
        &self.tier
    }

    /// Start accepting relay-protocol streams. Runs until the transport's
    /// accept channel closes.
    pub async fn run(self: Arc<Self>) -> Result<(), P2pError> {
        let mut incoming = self.transport.accept_streams(protocol_ids::RELAY).await?;
        while let Some(inbound) = incoming.recv().await {
            let this = Arc::clone(&self);
            tokio::spawn(async move {
                if let Err(e) = this.handle_stream(inbound).await {
                    tracing::debug!("relay: stream handling error: {e}");
                }
            });
        }
        Ok(())
    }

    async fn handle_stream(self: &Arc<Self>, mut inbound: Inbound) -> Result<(), P2pError> {
        let msg = RelayMessage::read(&mut inbound.stream).await.map_err(P2pError::from)?;
        match msg {
            RelayMessage::Reserve { ttl_secs } => self.handle_reserve(inbound, ttl_secs).await,
            RelayMessage::Connect { dest, protocol } => self.handle_connect(inbound, dest, protocol).await,
            other => {
                tracing::debug!("relay: unexpected message on fresh stream: {other:?}");
                Ok(())
            }
        }
    }

    async fn handle_reserve(&self, mut inbound: Inbound, ttl_secs: u32) -> Result<(), P2pError> {
        if self.tier.requires_membership_proof() && !self.verified_members.lock().await.contains(&inbound.peer_id) {
            return self.reject_reserve(&mut inbound.stream, RelayErrorCode::PermissionDenied).await;
        }

        let min_ttl = self.config.min_reservation_ttl.get().as_secs() as u32;
        let max_ttl = self.config.reservation_ttl.get().as_secs() as u32;
        let ttl = ttl_secs.clamp(min_ttl, max_ttl);

        let shard = &self.reservations[shard_of(&inbound.peer_id, SHARD_COUNT)];
        let mut table = shard.lock().await;
        let is_new = !table.contains_key(&inbound.peer_id);
        if is_new && self.reservation_count.load(Ordering::Relaxed) >= self.config.max_reservations {
            drop(table);
            return self.reject_reserve(&mut inbound.stream, RelayErrorCode::ResourceLimit).await;
        }

        table.insert(
            inbound.peer_id,
            ReservationRecord {
                peer_id: inbound.peer_id,
                expires_at: Instant::now() + Duration::from_secs(ttl as u64),
                data_quota_remaining: None,
                duration_remaining: Duration::from_secs(ttl as u64),
            },
        );
        drop(table);
        if is_new {
            self.reservation_count.fetch_add(1, Ordering::Relaxed);
        }

        let reply = RelayMessage::ReserveOk {
            ttl_secs: ttl,
            slots: self.config.max_circuits as u16,
            addrs: self.advertise_addrs.clone(),
        };
        reply.write(&mut inbound.stream).await.map_err(P2pError::from)
    }

    async fn reject_reserve(&self, stream: &mut BoxedStream, code: RelayErrorCode) -> Result<(), P2pError> {
        RelayMessage::ReserveError { code: code.code() }
            .write(stream)
            .await
            .map_err(P2pError::from)
    }

    async fn handle_connect(self: &Arc<Self>, mut inbound: Inbound, dest: PeerId, protocol: Option<String>) -> Result<(), P2pError> {
        if !self.tier.allows_protocol(protocol.as_deref()) {
            return self.reject_connect(&mut inbound.stream, RelayErrorCode::ProtocolNotAllowed).await;
        }
        if self.tier.requires_membership_proof() && !self.verified_members.lock().await.contains(&inbound.peer_id) {
            return self.reject_connect(&mut inbound.stream, RelayErrorCode::PermissionDenied).await;
        }

        let has_reservation = {
            let shard = &self.reservations[shard_of(&dest, SHARD_COUNT)];
            let table = shard.lock().await;
            table.get(&dest).map(|r| !r.is_expired(Instant::now())).unwrap_or(false)
        };
        if !has_reservation {
            return self.reject_connect(&mut inbound.stream, RelayErrorCode::NoReservation).await;
        }
        if self.circuit_count.load(Ordering::Relaxed) >= self.config.max_circuits {
            return self.reject_connect(&mut inbound.stream, RelayErrorCode::ResourceLimit).await;
        }

        let mut dest_stream = match self
            .transport
            .open_stream(dest, protocol_ids::RELAY, SIGNAL_DEADLINE)
            .await
        {
            Ok(s) => s,
            Err(e) => {
                tracing::debug!("relay: could not reach reserved peer {dest}: {e}");
                return self.reject_connect(&mut inbound.stream, RelayErrorCode::ConnectToDestFailed).await;
            }
        };

        let notify = RelayMessage::Connect {
            dest: inbound.peer_id,
            protocol: protocol.clone(),
        };
        if notify.write(&mut dest_stream).await.is_err() {
            return self.reject_connect(&mut inbound.stream, RelayErrorCode::ConnectToDestFailed).await;
        }
        match RelayMessage::read(&mut dest_stream).await {
            Ok(RelayMessage::ConnectOk) => {}
            _ => return self.reject_connect(&mut inbound.stream, RelayErrorCode::ConnectToDestFailed).await,
        }

        RelayMessage::ConnectOk.write(&mut inbound.stream).await.map_err(P2pError::from)?;

        let circuit = Arc::new(Mutex::new(Circuit::new(inbound.peer_id, dest, Instant::now())));
        self.circuits.lock().await.insert((inbound.peer_id, dest), Arc::clone(&circuit));
        self.circuit_count.fetch_add(1, Ordering::Relaxed);

        let max_duration = match self.tier {
            RelayTier::System => Some(self.config.system_relay_max_duration.get()),
            RelayTier::Realm { .. } => None,
        };
        let bandwidth_bps = self.tier.bandwidth_bps(self.config.system_relay_bandwidth_bps, self.realm_bandwidth_bps);

        let this = Arc::clone(self);
        let key = (inbound.peer_id, dest);
        tokio::spawn(async move {
            bridge_streams(inbound.stream, dest_stream, Arc::clone(&circuit), bandwidth_bps, max_duration).await;
            this.circuits.lock().await.remove(&key);
            this.circuit_count.fetch_sub(1, Ordering::Relaxed);
        });
        Ok(())
    }

    async fn reject_connect(&self, stream: &mut BoxedStream, code: RelayErrorCode) -> Result<(), P2pError> {
        RelayMessage::ConnectError { code: code.code() }
            .write(stream)
            .await
            .map_err(P2pError::from)
    }

    pub async fn circuit_states(&self) -> Vec<(PeerId, PeerId, CircuitState)> {
        let circuits = self.circuits.lock().await;
        let mut out = Vec::with_capacity(circuits.len());
        for ((src, dst), c) in circuits.iter() {
            out.push((*src, *dst, c.lock().await.state));
        }
        out
    }
}

/// Bidirectionally pipe raw bytes between two already-negotiated streams,
/// rate-limited to `bandwidth_bps`, for at most `max_duration` (unbounded if
/// `None` — realm-relay duration is operator policy, not a hardcoded cap).
async fn bridge_streams(a: BoxedStream, b: BoxedStream, circuit: Arc<Mutex<Circuit>>, bandwidth_bps: u64, max_duration: Option<Duration>) {
    let (a_read, a_write) = a.split();
    let (b_read, b_write) = b.split();

    let fwd = copy_throttled(a_read, b_write, bandwidth_bps, Arc::clone(&circuit));
    let bwd = copy_throttled(b_read, a_write, bandwidth_bps, Arc::clone(&circuit));
    let joined = futures::future::join(fwd, bwd);

    match max_duration {
        Some(d) => {
            let _ = tokio::time::timeout(d, joined).await;
        }
        None => {
            joined.await;
        }
    }
    circuit.lock().await.state = CircuitState::Closed;
}

async fn copy_throttled<R, W>(mut reader: R, mut writer: W, bandwidth_bps: u64, circuit: Arc<Mutex<Circuit>>)
where
    R: futures::AsyncRead + Unpin,
    W: futures::AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; 4096];
    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        if writer.write_all(&buf[..n]).await.is_err() {
            break;
        }
        circuit.lock().await.bytes_forwarded += n as u64;
        if bandwidth_bps > 0 {
            let delay = Duration::from_secs_f64(n as f64 / bandwidth_bps as f64);
            if delay > Duration::from_millis(1) {
                tokio::time::sleep(delay).await;
            }
        }
    }
    let _ = writer.close().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::MockNetwork;

    fn test_config() -> RelayConfig {
        let mut c = RelayConfig::default();
        c.reservation_ttl = crate::config::ConfigDuration::from_secs(3600);
        c.min_reservation_ttl = crate::config::ConfigDuration::from_secs(60);
        c
    }

    #[tokio::test]
    async fn reserve_then_connect_bridges_two_clients() {
        let net = MockNetwork::new();
        let relay_id = PeerId::random();
        let source_id = PeerId::random();
        let dest_id = PeerId::random();

        let relay_transport = net.transport(relay_id);
        let source_transport = net.transport(source_id);
        let dest_transport = net.transport(dest_id);

        let server = RelayServer::new(RelayTier::System, relay_transport, test_config(), vec![], 1024 * 1024);
        tokio::spawn(Arc::clone(&server).run());

        // dest reserves first so a later Connect has somewhere to land.
        let mut dest_reserve_stream = dest_transport
            .open_stream(relay_id, protocol_ids::RELAY, Duration::from_secs(1))
            .await
            .unwrap();
        RelayMessage::Reserve { ttl_secs: 3600 }.write(&mut dest_reserve_stream).await.unwrap();
        let reserve_reply = RelayMessage::read(&mut dest_reserve_stream).await.unwrap();
        assert!(matches!(reserve_reply, RelayMessage::ReserveOk { .. }));

        // dest must be listening for the relay's forwarded stream.
        let mut dest_incoming = dest_transport.accept_streams(protocol_ids::RELAY).await.unwrap();
        tokio::spawn(async move {
            if let Some(mut inbound) = dest_incoming.recv().await {
                if let Ok(RelayMessage::Connect { .. }) = RelayMessage::read(&mut inbound.stream).await {
                    RelayMessage::ConnectOk.write(&mut inbound.stream).await.unwrap();
                    let mut buf = [0u8; 5];
                    futures::AsyncReadExt::read_exact(&mut inbound.stream, &mut buf).await.unwrap();
                    assert_eq!(&buf, b"hello");
                }
            }
        });

        let mut source_stream = source_transport
            .open_stream(relay_id, protocol_ids::RELAY, Duration::from_secs(1))
            .await
            .unwrap();
        RelayMessage::Connect {
            dest: dest_id,
            protocol: None,
        }
        .write(&mut source_stream)
        .await
        .unwrap();
        let reply = RelayMessage::read(&mut source_stream).await.unwrap();
        assert!(matches!(reply, RelayMessage::ConnectOk));

        futures::AsyncWriteExt::write_all(&mut source_stream, b"hello").await.unwrap();
        futures::AsyncWriteExt::close(&mut source_stream).await.unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn connect_to_unreserved_peer_is_rejected() {
        let net = MockNetwork::new();
        let relay_id = PeerId::random();
        let source_id = PeerId::random();

        let relay_transport = net.transport(relay_id);
        let source_transport = net.transport(source_id);

        let server = RelayServer::new(RelayTier::System, relay_transport, test_config(), vec![], 1024 * 1024);
        tokio::spawn(Arc::clone(&server).run());

        let mut source_stream = source_transport
            .open_stream(relay_id, protocol_ids::RELAY, Duration::from_secs(1))
            .await
            .unwrap();
        RelayMessage::Connect {
            dest: PeerId::random(),
            protocol: None,
        }
        .write(&mut source_stream)
        .await
        .unwrap();
        let reply = RelayMessage::read(&mut source_stream).await.unwrap();
        match reply {
            RelayMessage::ConnectError { code } => assert_eq!(code, RelayErrorCode::NoReservation.code()),
            other => panic!("expected ConnectError, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn protocol_gate_rejects_foreign_namespace_on_system_tier() {
        let net = MockNetwork::new();
        let relay_id = PeerId::random();
        let source_id = PeerId::random();
        let dest_id = PeerId::random();

        let relay_transport = net.transport(relay_id);
        let source_transport = net.transport(source_id);
        let dest_transport = net.transport(dest_id);

        let server = RelayServer::new(RelayTier::System, relay_transport, test_config(), vec![], 1024 * 1024);
        tokio::spawn(Arc::clone(&server).run());

        let mut dest_reserve_stream = dest_transport
            .open_stream(relay_id, protocol_ids::RELAY, Duration::from_secs(1))
            .await
            .unwrap();
        RelayMessage::Reserve { ttl_secs: 3600 }.write(&mut dest_reserve_stream).await.unwrap();
        RelayMessage::read(&mut dest_reserve_stream).await.unwrap();

        let mut source_stream = source_transport
            .open_stream(relay_id, protocol_ids::RELAY, Duration::from_secs(1))
            .await
            .unwrap();
        RelayMessage::Connect {
            dest: dest_id,
            protocol: Some("/dep2p/app/deadbeef/chat".into()),
        }
        .write(&mut source_stream)
        .await
        .unwrap();
        let reply = RelayMessage::read(&mut source_stream).await.unwrap();
        match reply {
            RelayMessage::ConnectError { code } => assert_eq!(code, RelayErrorCode::ProtocolNotAllowed.code()),
            other => panic!("expected ConnectError, got {other:?}"),
        }
    }
}
