//! Transport capability seam (spec.md §2 "Transport Capability (interface
//! only)", §9 "dynamic dispatch across transports").
//!
//! The rest of the crate — reachability, relay, hole-punch, dial, realm —
//! is written against this trait, not against `libp2p::Swarm` directly, so
//! that (a) a protocol token maps to a concrete implementer through a
//! registry the way spec.md §9 describes, and (b) dial/realm/membership
//! logic can be exercised in tests against an in-process [`mock`] transport
//! without a real socket, the way the teacher's `tests/peer_tests.rs`
//! exercises `P2pNode` logic over real loopback TCP.

pub mod libp2p_transport;
pub mod mock;

use std::{pin::Pin, time::Duration};

use async_trait::async_trait;
use futures::{AsyncRead, AsyncWrite};
use libp2p::{Multiaddr, PeerId};
use tokio::sync::{broadcast, mpsc};

use crate::error::P2pError;

/// A bidirectional byte stream opened for a single protocol id, already
/// past the transport's handshake and security upgrade (spec.md §4.4:
/// "ready for protocol negotiation").
pub trait AsyncDuplex: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncDuplex for T {}

pub type BoxedStream = Pin<Box<dyn AsyncDuplex>>;

/// An inbound stream together with the verified remote identity and the
/// protocol id it was opened for (the realm manager needs the latter to
/// strip the realm prefix before dispatch).
pub struct Inbound {
    pub peer_id: PeerId,
    pub protocol: String,
    pub stream: BoxedStream,
}

/// A transport-level liveness signal, fed to the Disconnect Detector's
/// `report_high_trust`/`report_low_trust` (spec.md §4.7's trust table: a
/// closed connection is high-trust, a ping failure is low-trust and needs
/// witness corroboration).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// The connection tore down (close, reset, FIN) — high-trust.
    Closed { peer_id: PeerId },
    /// A liveness probe to an otherwise-established peer failed — low-trust.
    PingFailed { peer_id: PeerId },
}

/// Uniform capability every networking stack (QUIC, TCP, a future
/// WebTransport) implements. The Dial Engine selects an implementer by
/// matching the multiaddress's trailing protocol component; today exactly
/// one (`Libp2pTransport`) ships in-tree.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    fn local_peer_id(&self) -> PeerId;

    /// Establish (or reuse) a connection whose verified remote identity is
    /// read back from the handshake, not assumed from the caller's request
    /// — callers must check the returned `PeerId` against what they
    /// expected (spec.md INV-001).
    async fn dial(&self, addr: &Multiaddr, deadline: Duration) -> Result<PeerId, P2pError>;

    async fn listen(&self, addr: Multiaddr) -> Result<(), P2pError>;

    fn can_dial(&self, addr: &Multiaddr) -> bool;

    fn protocols(&self) -> &[&str];

    /// True if the live connection to `peer_id` is relayed rather than
    /// direct (used by the witness protocol: only direct connections may
    /// witness a disconnect, spec.md §4.7).
    fn is_relayed(&self, peer_id: PeerId) -> bool;

    /// Open an outbound stream for `protocol` against an already-dialed
    /// peer.
    async fn open_stream(
        &self,
        peer_id: PeerId,
        protocol: &str,
        deadline: Duration,
    ) -> Result<BoxedStream, P2pError>;

    /// Register interest in inbound streams for `protocol`; every
    /// subsequent inbound open for that protocol id is delivered on the
    /// returned channel until the receiver is dropped.
    async fn accept_streams(&self, protocol: &str) -> Result<mpsc::Receiver<Inbound>, P2pError>;

    /// Subscribe to connection-lifecycle signals for every peer this
    /// transport has ever dialed or accepted. Feeds the Disconnect Detector;
    /// each subscriber gets its own broadcast receiver so the node's signal
    /// relay task can run independently of anything else watching the same
    /// transport.
    fn connection_events(&self) -> broadcast::Receiver<ConnectionEvent>;
}
