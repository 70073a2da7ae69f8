//! Structured error taxonomy for the connectivity and realm-isolation core.
//!
//! Every public operation returns a [`P2pError`] identifying `(kind,
//! peer_id-if-applicable, underlying cause)` rather than an opaque string, so
//! callers can match on `kind()` to decide whether to retry. Authentication,
//! protocol-gate, and invariant violations surface immediately; I/O-layer
//! errors are retried with backoff inside the component that owns them
//! before ever reaching a caller.

use libp2p::PeerId;
use thiserror::Error;

/// Error-kind taxonomy (semantics, not Rust type names) — mirrors the error
/// table in the design doc one-for-one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// ID-only dial attempted at node level (no realm joined).
    AddressRequired,
    /// `Join` called while already a member of a realm.
    AlreadyInRealm,
    /// Business API called while not a realm member.
    NotMember,
    /// User code tried to register a `/dep2p/sys/*` protocol.
    ReservedProtocol,
    /// Inbound stream carried a RealmID that doesn't match ours.
    ForeignRealm,
    /// Relay rejected a CONNECT because of its protocol-gate.
    ProtocolNotAllowed,
    /// Direct, hole-punch, and relay paths were all exhausted.
    NoPath,
    /// Relay reservation or connection-count limit was hit.
    ResourceLimit,
    /// PSK / membership-proof verification failed.
    PermissionDenied,
    /// A caller-provided or default deadline was exceeded.
    Timeout,
    /// Discovery returned no candidates for a peer.
    PeerNotFound,
    /// Relay target refused the connection at handshake time.
    TargetNotMember,
    /// Transport, codec, or other I/O-layer failure (already retried locally).
    Io,
    /// The node's event loop has already shut down.
    Shutdown,
    /// Local state/config problem unrelated to a remote peer (bad multiaddr,
    /// bad keypair file, malformed config, …).
    Internal,
}

impl ErrorKind {
    /// Whether a caller may usefully retry after backoff. Authentication,
    /// protocol-gate, and invariant violations are never retryable.
    pub fn retryable(self) -> bool {
        matches!(
            self,
            ErrorKind::NoPath
                | ErrorKind::ResourceLimit
                | ErrorKind::Timeout
                | ErrorKind::PeerNotFound
                | ErrorKind::Io
        )
    }
}

/// A structured error: kind, the peer it concerns (if any), and the
/// underlying cause as a display string. The cause is frequently a foreign
/// error type that doesn't implement `Clone`, so it is flattened to text at
/// the boundary; callers that need the original type should match on it
/// before it crosses into a `P2pError`.
#[derive(Debug, Clone, Error)]
#[error("{kind:?}{peer_suffix}: {cause}", peer_suffix = self.peer_suffix())]
pub struct P2pError {
    pub kind: ErrorKind,
    pub peer_id: Option<PeerId>,
    pub cause: String,
}

impl P2pError {
    pub fn new(kind: ErrorKind, cause: impl Into<String>) -> Self {
        Self {
            kind,
            peer_id: None,
            cause: cause.into(),
        }
    }

    pub fn with_peer(kind: ErrorKind, peer_id: PeerId, cause: impl Into<String>) -> Self {
        Self {
            kind,
            peer_id: Some(peer_id),
            cause: cause.into(),
        }
    }

    fn peer_suffix(&self) -> String {
        match self.peer_id {
            Some(p) => format!(" (peer {p})"),
            None => String::new(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    // ── Convenience constructors for the common cases ────────────────────────

    pub fn address_required() -> Self {
        Self::new(
            ErrorKind::AddressRequired,
            "ID-only dial requires an active realm membership",
        )
    }

    pub fn already_in_realm() -> Self {
        Self::new(ErrorKind::AlreadyInRealm, "leave the current realm first")
    }

    pub fn not_member() -> Self {
        Self::new(ErrorKind::NotMember, "no active realm membership")
    }

    pub fn reserved_protocol(proto: impl Into<String>) -> Self {
        Self::new(
            ErrorKind::ReservedProtocol,
            format!("protocol '{}' is reserved for system use", proto.into()),
        )
    }

    pub fn foreign_realm(proto: impl Into<String>) -> Self {
        Self::new(
            ErrorKind::ForeignRealm,
            format!("inbound stream '{}' carries a foreign realm id", proto.into()),
        )
    }

    pub fn protocol_not_allowed(proto: impl Into<String>) -> Self {
        Self::new(
            ErrorKind::ProtocolNotAllowed,
            format!("protocol '{}' not allowed on this relay tier", proto.into()),
        )
    }

    pub fn no_path(peer_id: PeerId) -> Self {
        Self::with_peer(ErrorKind::NoPath, peer_id, "no direct, punch, or relay path succeeded")
    }

    pub fn resource_limit(cause: impl Into<String>) -> Self {
        Self::new(ErrorKind::ResourceLimit, cause)
    }

    pub fn permission_denied(cause: impl Into<String>) -> Self {
        Self::new(ErrorKind::PermissionDenied, cause)
    }

    pub fn timeout(cause: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, cause)
    }

    pub fn peer_not_found(peer_id: PeerId) -> Self {
        Self::with_peer(ErrorKind::PeerNotFound, peer_id, "no candidate addresses from discovery")
    }

    pub fn target_not_member(peer_id: PeerId) -> Self {
        Self::with_peer(ErrorKind::TargetNotMember, peer_id, "relay target refused handshake")
    }

    pub fn shutdown() -> Self {
        Self::new(ErrorKind::Shutdown, "node event loop has shut down")
    }

    pub fn io(cause: impl Into<String>) -> Self {
        Self::new(ErrorKind::Io, cause)
    }

    pub fn internal(cause: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, cause)
    }
}

impl From<std::io::Error> for P2pError {
    fn from(e: std::io::Error) -> Self {
        P2pError::io(e.to_string())
    }
}
