//! In-process mock `Transport` — two peers exchange bytes over
//! `tokio::io::duplex` pipes rather than real sockets.
//!
//! Added because the spec's boundary scenarios (spec.md §8) are
//! state-machine-shaped (dial fallback ordering, protocol-gate rejection,
//! witness quorum) and don't need real networking to verify, the same
//! reasoning the teacher applies when it lets `tests/peer_tests.rs` run
//! two full nodes over real loopback TCP only for the scenarios that
//! actually need a socket.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use libp2p::{Multiaddr, PeerId};
use tokio::sync::{broadcast, mpsc};
use tokio_util::compat::TokioAsyncReadCompatExt;

use crate::error::P2pError;

use super::{BoxedStream, ConnectionEvent, Inbound, Transport};

type AcceptTable = Arc<Mutex<HashMap<String, mpsc::Sender<Inbound>>>>;

/// Shared registry every `MockTransport` instance in a test process
/// registers itself into, keyed by `PeerId`, so `dial`/`open_stream` calls
/// can find the peer they're addressing.
#[derive(Clone, Default)]
pub struct MockNetwork {
    peers: Arc<Mutex<HashMap<PeerId, AcceptTable>>>,
}

impl MockNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn transport(&self, peer_id: PeerId) -> Arc<MockTransport> {
        let accept_table: AcceptTable = Arc::new(Mutex::new(HashMap::new()));
        self.peers.lock().unwrap().insert(peer_id, Arc::clone(&accept_table));
        Arc::new(MockTransport {
            local_peer_id: peer_id,
            network: self.clone(),
            accept_table,
            dialed: Mutex::new(Default::default()),
            connection_events_tx: broadcast::channel(64).0,
        })
    }
}

pub struct MockTransport {
    local_peer_id: PeerId,
    network: MockNetwork,
    accept_table: AcceptTable,
    dialed: Mutex<std::collections::HashSet<PeerId>>,
    connection_events_tx: broadcast::Sender<ConnectionEvent>,
}

impl MockTransport {
    /// Push a connection event to every current subscriber, standing in for
    /// whatever a real transport's Swarm event loop would observe — there's
    /// no real socket here to close or ping, so tests exercising the
    /// Disconnect Detector's wiring drive this directly.
    pub fn inject_connection_event(&self, event: ConnectionEvent) {
        let _ = self.connection_events_tx.send(event);
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn local_peer_id(&self) -> PeerId {
        self.local_peer_id
    }

    async fn dial(&self, addr: &Multiaddr, _deadline: Duration) -> Result<PeerId, P2pError> {
        let peer_id = crate::multiaddr::peer_id_of(addr)
            .ok_or_else(|| P2pError::internal("mock dial address has no /p2p/<id>"))?;
        if !self.network.peers.lock().unwrap().contains_key(&peer_id) {
            return Err(P2pError::with_peer(
                crate::error::ErrorKind::Timeout,
                peer_id,
                "no such peer registered on mock network",
            ));
        }
        self.dialed.lock().unwrap().insert(peer_id);
        Ok(peer_id)
    }

    async fn listen(&self, _addr: Multiaddr) -> Result<(), P2pError> {
        Ok(())
    }

    fn can_dial(&self, _addr: &Multiaddr) -> bool {
        true
    }

    fn protocols(&self) -> &[&str] {
        &["mock"]
    }

    fn is_relayed(&self, _peer_id: PeerId) -> bool {
        false
    }

    async fn open_stream(
        &self,
        peer_id: PeerId,
        protocol: &str,
        deadline: Duration,
    ) -> Result<BoxedStream, P2pError> {
        let remote_table = {
            let peers = self.network.peers.lock().unwrap();
            peers
                .get(&peer_id)
                .cloned()
                .ok_or_else(|| P2pError::peer_not_found(peer_id))?
        };
        let sender = {
            let table = remote_table.lock().unwrap();
            table.get(protocol).cloned()
        };
        let Some(sender) = sender else {
            return Err(P2pError::with_peer(
                crate::error::ErrorKind::Io,
                peer_id,
                format!("peer is not accepting protocol '{protocol}'"),
            ));
        };

        let (a, b) = tokio::io::duplex(64 * 1024);
        let inbound = Inbound {
            peer_id: self.local_peer_id,
            protocol: protocol.to_owned(),
            stream: Box::pin(b.compat()) as BoxedStream,
        };
        tokio::time::timeout(deadline, sender.send(inbound))
            .await
            .map_err(|_| P2pError::timeout("mock open_stream: peer did not accept in time"))?
            .map_err(|_| P2pError::shutdown())?;
        Ok(Box::pin(a.compat()) as BoxedStream)
    }

    async fn accept_streams(&self, protocol: &str) -> Result<mpsc::Receiver<Inbound>, P2pError> {
        let (tx, rx) = mpsc::channel(64);
        self.accept_table.lock().unwrap().insert(protocol.to_owned(), tx);
        Ok(rx)
    }

    fn connection_events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.connection_events_tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn two_peers_exchange_bytes_over_a_named_protocol() {
        let net = MockNetwork::new();
        let a_id = PeerId::random();
        let b_id = PeerId::random();
        let a = net.transport(a_id);
        let b = net.transport(b_id);

        let mut accept_rx = b.accept_streams("/dep2p/sys/ping/1.0.0").await.unwrap();

        let b_addr: Multiaddr = format!("/ip4/0.0.0.0/tcp/0/p2p/{b_id}").parse().unwrap();
        let dialed = a.dial(&b_addr, Duration::from_secs(1)).await.unwrap();
        assert_eq!(dialed, b_id);

        let client = tokio::spawn({
            async move {
                let mut s = a
                    .open_stream(b_id, "/dep2p/sys/ping/1.0.0", Duration::from_secs(1))
                    .await
                    .unwrap();
                s.write_all(b"hello").await.unwrap();
                s.close().await.unwrap();
            }
        });

        let inbound = accept_rx.recv().await.unwrap();
        assert_eq!(inbound.peer_id, a_id);
        let mut buf = Vec::new();
        let mut stream = inbound.stream;
        stream.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"hello");
        client.await.unwrap();
    }

    #[tokio::test]
    async fn injected_connection_event_reaches_a_subscriber() {
        let net = MockNetwork::new();
        let peer = PeerId::random();
        let a = net.transport(peer);
        let mut rx = a.connection_events();
        a.inject_connection_event(ConnectionEvent::Closed { peer_id: peer });
        assert_eq!(rx.recv().await.unwrap(), ConnectionEvent::Closed { peer_id: peer });
    }

    #[tokio::test]
    async fn dial_to_unregistered_peer_fails() {
        let net = MockNetwork::new();
        let a = net.transport(PeerId::random());
        let ghost: Multiaddr = format!("/ip4/0.0.0.0/tcp/0/p2p/{}", PeerId::random())
            .parse()
            .unwrap();
        assert!(a.dial(&ghost, Duration::from_millis(50)).await.is_err());
    }
}
