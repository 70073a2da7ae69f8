//! Relay client: makes and refreshes a reservation on a remote relay, then
//! asks it to broker a circuit to some other reserved peer.
//!
//! Bookkeeping shape mirrors the teacher's `node.rs` relay-address tracking
//! (`connected_relay_addrs`/`relay_dial_addrs`/`relay_connection_ids`: one
//! map per relay peer, refreshed rather than rebuilt) generalized from "the
//! one libp2p relay v2 reservation" to "N reservations across System and
//! Realm relays, each independently refreshed."

use std::{collections::HashMap, sync::Arc, time::Duration};

use libp2p::{Multiaddr, PeerId};
use tokio::sync::Mutex;

use crate::{
    error::P2pError,
    protocol::codec::RelayMessage,
    protocol_ids,
    transport::{BoxedStream, Transport},
};

const SIGNAL_DEADLINE: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct ActiveReservation {
    pub relay_peer_id: PeerId,
    pub expires_in: Duration,
    pub relay_addrs: Vec<Multiaddr>,
}

pub struct RelayClient {
    transport: Arc<dyn Transport>,
    reservations: Mutex<HashMap<PeerId, ActiveReservation>>,
}

impl RelayClient {
    pub fn new(transport: Arc<dyn Transport>) -> Arc<Self> {
        Arc::new(Self {
            transport,
            reservations: Mutex::new(HashMap::new()),
        })
    }

    /// Ask `relay_peer_id` to hold a reservation for this node, requesting
    /// `ttl`. The relay may return a shorter TTL; callers should re-reserve
    /// before `expires_in` elapses rather than assume the request was
    /// honored verbatim.
    pub async fn reserve(&self, relay_peer_id: PeerId, ttl: Duration) -> Result<ActiveReservation, P2pError> {
        let mut stream = self
            .transport
            .open_stream(relay_peer_id, protocol_ids::RELAY, SIGNAL_DEADLINE)
            .await?;
        RelayMessage::Reserve {
            ttl_secs: ttl.as_secs() as u32,
        }
        .write(&mut stream)
        .await?;
        let reply = RelayMessage::read(&mut stream).await?;
        let reservation = match reply {
            RelayMessage::ReserveOk { ttl_secs, addrs, .. } => ActiveReservation {
                relay_peer_id,
                expires_in: Duration::from_secs(ttl_secs as u64),
                relay_addrs: addrs,
            },
            RelayMessage::ReserveError { code } => {
                return Err(P2pError::resource_limit(format!("relay {relay_peer_id} refused reservation (code {code})")));
            }
            other => return Err(P2pError::internal(format!("unexpected reply to Reserve: {other:?}"))),
        };
        self.reservations.lock().await.insert(relay_peer_id, reservation.clone());
        Ok(reservation)
    }

    pub async fn active_reservations(&self) -> Vec<ActiveReservation> {
        self.reservations.lock().await.values().cloned().collect()
    }

    pub async fn drop_reservation(&self, relay_peer_id: &PeerId) {
        self.reservations.lock().await.remove(relay_peer_id);
    }

    /// Run forever, re-reserving each tracked relay at roughly half its
    /// granted TTL, the way DCUtR reservation refresh works in the teacher's
    /// `node.rs` (refresh well before expiry rather than racing it).
    pub async fn run_refresh_loop(self: Arc<Self>) {
        loop {
            let due: Vec<(PeerId, Duration)> = {
                let reservations = self.reservations.lock().await;
                reservations
                    .values()
                    .map(|r| (r.relay_peer_id, r.expires_in / 2))
                    .collect()
            };
            let sleep_for = due.iter().map(|(_, d)| *d).min().unwrap_or(Duration::from_secs(60)).max(Duration::from_secs(1));
            tokio::time::sleep(sleep_for).await;
            let targets: Vec<(PeerId, Duration)> = {
                let reservations = self.reservations.lock().await;
                reservations.values().map(|r| (r.relay_peer_id, r.expires_in)).collect()
            };
            for (relay_peer_id, ttl) in targets {
                if let Err(e) = self.reserve(relay_peer_id, ttl).await {
                    tracing::warn!("relay: reservation refresh with {relay_peer_id} failed: {e}");
                }
            }
        }
    }

    /// Ask `relay_peer_id` (which must have an active reservation held by
    /// `dest`) to broker a circuit to `dest`, gated by `protocol` if given.
    /// Returns the bridged stream on success.
    pub async fn connect(&self, relay_peer_id: PeerId, dest: PeerId, protocol: Option<String>) -> Result<BoxedStream, P2pError> {
        let mut stream = self
            .transport
            .open_stream(relay_peer_id, protocol_ids::RELAY, SIGNAL_DEADLINE)
            .await?;
        RelayMessage::Connect { dest, protocol }.write(&mut stream).await?;
        match RelayMessage::read(&mut stream).await? {
            RelayMessage::ConnectOk => Ok(stream),
            RelayMessage::ConnectError { code } => Err(P2pError::with_peer(
                crate::error::ErrorKind::NoPath,
                dest,
                format!("relay {relay_peer_id} refused Connect (code {code})"),
            )),
            other => Err(P2pError::internal(format!("unexpected reply to Connect: {other:?}"))),
        }
    }

    /// Accept an inbound circuit opened by a relay on `dest`'s behalf. The
    /// relay's `Connect { dest: source, protocol }` repurposes `dest` to
    /// carry the originating peer id (see `relay/server.rs`), so the caller
    /// reads that back as "who wants to talk to me."
    pub async fn accept_incoming_circuit(mut stream: BoxedStream) -> Result<(PeerId, Option<String>, BoxedStream), P2pError> {
        match RelayMessage::read(&mut stream).await? {
            RelayMessage::Connect { dest: source, protocol } => {
                RelayMessage::ConnectOk.write(&mut stream).await?;
                Ok((source, protocol, stream))
            }
            other => Err(P2pError::internal(format!("unexpected message on relay stream: {other:?}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::RelayConfig, relay::{RelayServer, RelayTier}, transport::mock::MockNetwork};

    #[tokio::test]
    async fn reserve_records_the_granted_ttl() {
        let net = MockNetwork::new();
        let relay_id = PeerId::random();
        let client_id = PeerId::random();

        let relay_transport = net.transport(relay_id);
        let client_transport = net.transport(client_id);

        let server = RelayServer::new(RelayTier::System, relay_transport, RelayConfig::default(), vec![], 1024 * 1024);
        tokio::spawn(Arc::clone(&server).run());

        let client = RelayClient::new(client_transport);
        let reservation = client.reserve(relay_id, Duration::from_secs(3600)).await.unwrap();
        assert_eq!(reservation.relay_peer_id, relay_id);
        assert_eq!(client.active_reservations().await.len(), 1);
    }

    #[tokio::test]
    async fn connect_to_peer_without_reservation_fails() {
        let net = MockNetwork::new();
        let relay_id = PeerId::random();
        let client_id = PeerId::random();

        let relay_transport = net.transport(relay_id);
        let client_transport = net.transport(client_id);

        let server = RelayServer::new(RelayTier::System, relay_transport, RelayConfig::default(), vec![], 1024 * 1024);
        tokio::spawn(Arc::clone(&server).run());

        let client = RelayClient::new(client_transport);
        let err = client.connect(relay_id, PeerId::random(), None).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::NoPath);
    }
}
