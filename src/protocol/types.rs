//! Core data model: realm cryptographic material, address records, relay
//! reservation/circuit bookkeeping, and member records.
//!
//! `PeerId` and `Multiaddr` are reused directly from `libp2p` (see
//! `identity.rs` / `multiaddr.rs`) rather than reinvented here; this module
//! covers everything spec.md §3 defines on top of them.

use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use hmac::{Hmac, Mac};
use libp2p::{Multiaddr, PeerId};
use sha2::{Digest, Sha256};

type HmacSha256 = Hmac<Sha256>;

/// Domain separation strings, bit-exact with spec.md §6.
const REALM_ID_DOMAIN: &[u8] = b"dep2p-realm-id-v1";
const MEMBERSHIP_HKDF_INFO: &[u8] = b"dep2p-realm-membership-v1";

/// Window within which a `MembershipProof` timestamp is accepted.
pub const PROOF_WINDOW: Duration = Duration::from_secs(30);

// ── RealmKey / RealmId ───────────────────────────────────────────────────────

/// 32 bytes of high-entropy pre-shared material distributed out-of-band.
/// Deliberately not `Debug`/`Display` beyond a fingerprint, so it never ends
/// up in a log line by accident.
#[derive(Clone, PartialEq, Eq)]
pub struct RealmKey(pub [u8; 32]);

impl RealmKey {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn generate() -> Self {
        use rand::RngCore;
        let mut b = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut b);
        Self(b)
    }

    /// First 4 bytes of `SHA-256(key)` as hex, safe to log — identifies a key
    /// without revealing it.
    pub fn fingerprint(&self) -> String {
        let digest = Sha256::digest(self.0);
        hex::encode(&digest[..4])
    }
}

impl std::fmt::Debug for RealmKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "RealmKey(fingerprint={})", self.fingerprint())
    }
}

/// Deterministic 32-byte identifier derived from a `RealmKey`.
///
/// `RealmID = SHA-256("dep2p-realm-id-v1" || SHA-256(RealmKey))`. Collision
/// resistant and not enumerable from a realm's human-readable name, since no
/// name ever enters the derivation.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RealmId(pub [u8; 32]);

impl RealmId {
    pub fn derive(key: &RealmKey) -> Self {
        let inner = Sha256::digest(key.0);
        let mut hasher = Sha256::new();
        hasher.update(REALM_ID_DOMAIN);
        hasher.update(inner);
        let out = hasher.finalize();
        let mut id = [0u8; 32];
        id.copy_from_slice(&out);
        Self(id)
    }

    pub fn to_hex(self) -> String {
        hex::encode(self.0)
    }

    /// `H(realmID)` as used in discovery provider keys
    /// (`/dep2p/v2/realm/<H(realmID)>/members`) — a second hash so the
    /// discovery key never equals the RealmID used in protocol IDs.
    pub fn discovery_key_hash(self) -> String {
        hex::encode(Sha256::digest(self.0))
    }
}

impl std::fmt::Debug for RealmId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "RealmId({})", &self.to_hex()[..8])
    }
}

impl std::fmt::Display for RealmId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

// ── MembershipProof ───────────────────────────────────────────────────────────

/// `HMAC(HKDF(RealmKey, "dep2p-realm-membership-v1"), sender || realmID ||
/// target || nonce || timestamp)`, bound to a specific target peer so a
/// captured proof can't be replayed against a different responder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MembershipProof {
    pub sender: PeerId,
    pub realm_id: RealmId,
    pub target: PeerId,
    pub nonce: [u8; 16],
    pub timestamp: i64,
    pub tag: [u8; 32],
}

fn derive_membership_key(realm_key: &RealmKey) -> [u8; 32] {
    let hk = hkdf::Hkdf::<Sha256>::new(None, &realm_key.0);
    let mut okm = [0u8; 32];
    hk.expand(MEMBERSHIP_HKDF_INFO, &mut okm)
        .expect("32 is a valid HKDF-SHA256 output length");
    okm
}

fn membership_message(sender: PeerId, realm_id: RealmId, target: PeerId, nonce: [u8; 16], timestamp: i64) -> Vec<u8> {
    let mut m = Vec::with_capacity(32 + 32 + 32 + 16 + 8);
    m.extend_from_slice(&sender.to_bytes());
    m.extend_from_slice(&realm_id.0);
    m.extend_from_slice(&target.to_bytes());
    m.extend_from_slice(&nonce);
    m.extend_from_slice(&timestamp.to_be_bytes());
    m
}

pub fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before epoch")
        .as_secs() as i64
}

impl MembershipProof {
    /// Generate a fresh, single-use proof bound to `target`.
    pub fn generate(
        realm_key: &RealmKey,
        sender: PeerId,
        realm_id: RealmId,
        target: PeerId,
        nonce: [u8; 16],
        timestamp: i64,
    ) -> Self {
        let key = derive_membership_key(realm_key);
        let msg = membership_message(sender, realm_id, target, nonce, timestamp);
        let mut mac = HmacSha256::new_from_slice(&key).expect("HMAC accepts any key length");
        mac.update(&msg);
        let tag_bytes = mac.finalize().into_bytes();
        let mut tag = [0u8; 32];
        tag.copy_from_slice(&tag_bytes);
        Self {
            sender,
            realm_id,
            target,
            nonce,
            timestamp,
            tag,
        }
    }

    /// Verify the HMAC tag only. Binding (`target == self`) and the ±30s
    /// timestamp window are the caller's responsibility (spec.md §4.6) since
    /// they depend on local identity and wall-clock time this type doesn't
    /// own.
    pub fn verify_tag(&self, realm_key: &RealmKey) -> bool {
        use subtle::ConstantTimeEq;
        let key = derive_membership_key(realm_key);
        let msg = membership_message(self.sender, self.realm_id, self.target, self.nonce, self.timestamp);
        let mut mac = HmacSha256::new_from_slice(&key).expect("HMAC accepts any key length");
        mac.update(&msg);
        let expected = mac.finalize().into_bytes();
        expected.as_slice().ct_eq(&self.tag).into()
    }

    /// `|now - timestamp| <= window`, per spec.md §3/§4.6.
    pub fn within_window(&self, now: i64, window: Duration) -> bool {
        (now - self.timestamp).unsigned_abs() <= window.as_secs()
    }
}

// ── AddressRecord ─────────────────────────────────────────────────────────────

/// Fixed-semantics confidence label for a candidate address. Ordering
/// follows the numeric priority so a plain `Ord` sort gives the dial-engine
/// precedence order (spec.md §4.4 step 2) for free.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Priority {
    /// 0 — unverified candidate.
    Candidate = 0,
    /// 10 — local listen address.
    LocalListen = 10,
    /// 50 — relay-guaranteed (circuit via a reserved relay).
    RelayGuaranteed = 50,
    /// 75 — STUN-discovered external address.
    StunDiscovered = 75,
    /// 100 — inbound reachability confirmed via dial-back.
    DialBackVerified = 100,
    /// 150 — operator-configured advertise address.
    AdvertiseConfigured = 150,
}

impl Priority {
    pub fn value(self) -> u16 {
        self as u16
    }

    /// Addresses at or above this priority are eligible for external
    /// publication (discovery records, relay address book) per spec.md §4.1.
    pub const PUBLICATION_THRESHOLD: u16 = Priority::RelayGuaranteed as u16;

    pub fn is_publishable(self) -> bool {
        self.value() >= Self::PUBLICATION_THRESHOLD
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressSource {
    OperatorConfigured,
    DialBack,
    Stun,
    Relay,
    LocalListen,
    Candidate,
}

/// `(Multiaddress, priority, source, expiresAt)`.
#[derive(Debug, Clone)]
pub struct AddressRecord {
    pub addr: Multiaddr,
    pub priority: Priority,
    pub source: AddressSource,
    pub expires_at: Option<Instant>,
}

impl AddressRecord {
    pub fn is_expired(&self, now: Instant) -> bool {
        matches!(self.expires_at, Some(t) if t <= now)
    }
}

// ── Relay-side bookkeeping ────────────────────────────────────────────────────

/// Per-source-peer relay reservation.
#[derive(Debug, Clone)]
pub struct ReservationRecord {
    pub peer_id: PeerId,
    pub expires_at: Instant,
    pub data_quota_remaining: Option<u64>,
    pub duration_remaining: Duration,
}

impl ReservationRecord {
    pub fn is_expired(&self, now: Instant) -> bool {
        self.expires_at <= now
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Active,
    Stale,
    Closed,
}

/// Relay-owned record of a brokered circuit between two endpoints.
#[derive(Debug, Clone)]
pub struct Circuit {
    pub source_peer_id: PeerId,
    pub dest_peer_id: PeerId,
    pub opened_at: Instant,
    pub state: CircuitState,
    pub bytes_forwarded: u64,
    pub consecutive_ping_failures: u32,
    pub went_stale_at: Option<Instant>,
}

impl Circuit {
    pub fn new(source_peer_id: PeerId, dest_peer_id: PeerId, now: Instant) -> Self {
        Self {
            source_peer_id,
            dest_peer_id,
            opened_at: now,
            state: CircuitState::Active,
            bytes_forwarded: 0,
            consecutive_ping_failures: 0,
            went_stale_at: None,
        }
    }

    /// Two consecutive keep-alive failures demote `Active` to `Stale`.
    pub fn on_ping_failure(&mut self, now: Instant) {
        if self.state != CircuitState::Active {
            return;
        }
        self.consecutive_ping_failures += 1;
        if self.consecutive_ping_failures >= 2 {
            self.state = CircuitState::Stale;
            self.went_stale_at = Some(now);
        }
    }

    pub fn on_ping_success(&mut self) {
        self.consecutive_ping_failures = 0;
        if self.state == CircuitState::Stale {
            self.state = CircuitState::Active;
            self.went_stale_at = None;
        }
    }

    /// `Stale` for longer than `window` transitions to `Closed`.
    pub fn tick_stale_timeout(&mut self, now: Instant, window: Duration) {
        if let (CircuitState::Stale, Some(since)) = (self.state, self.went_stale_at) {
            if now.duration_since(since) > window {
                self.state = CircuitState::Closed;
            }
        }
    }
}

// ── Ambient logging ───────────────────────────────────────────────────────────

/// A single captured tracing event, forwarded over `log_layer`'s broadcast
/// channel to whatever host application is embedding this crate.
#[derive(Debug, Clone)]
pub struct LogEntry {
    pub level: String,
    pub target: String,
    pub message: String,
}

// ── MemberRecord ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberRole {
    Peer,
    Infrastructure,
}

/// Exclusively owned by the Realm Manager; readable via snapshot only.
#[derive(Debug, Clone)]
pub struct MemberRecord {
    pub peer_id: PeerId,
    pub realm_id: RealmId,
    pub role: MemberRole,
    pub last_seen: Instant,
    pub addresses: Vec<Multiaddr>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn realm_id_is_deterministic_and_injective_in_practice() {
        let k1 = RealmKey::from_bytes([7u8; 32]);
        let k2 = RealmKey::from_bytes([7u8; 32]);
        let k3 = RealmKey::from_bytes([9u8; 32]);
        assert_eq!(RealmId::derive(&k1), RealmId::derive(&k2));
        assert_ne!(RealmId::derive(&k1), RealmId::derive(&k3));
    }

    #[test]
    fn membership_proof_round_trips() {
        let key = RealmKey::generate();
        let realm_id = RealmId::derive(&key);
        let sender = PeerId::random();
        let target = PeerId::random();
        let proof = MembershipProof::generate(&key, sender, realm_id, target, [1u8; 16], unix_now());
        assert!(proof.verify_tag(&key));
        assert!(proof.within_window(proof.timestamp, PROOF_WINDOW));
    }

    #[test]
    fn membership_proof_rejects_wrong_key() {
        let key = RealmKey::generate();
        let other = RealmKey::generate();
        let realm_id = RealmId::derive(&key);
        let proof = MembershipProof::generate(
            &key,
            PeerId::random(),
            realm_id,
            PeerId::random(),
            [2u8; 16],
            unix_now(),
        );
        assert!(!proof.verify_tag(&other));
    }

    #[test]
    fn membership_proof_rejects_tampered_target() {
        let key = RealmKey::generate();
        let realm_id = RealmId::derive(&key);
        let mut proof = MembershipProof::generate(
            &key,
            PeerId::random(),
            realm_id,
            PeerId::random(),
            [3u8; 16],
            unix_now(),
        );
        proof.target = PeerId::random();
        assert!(!proof.verify_tag(&key));
    }

    #[test]
    fn priority_ordering_matches_spec_numbers() {
        assert!(Priority::AdvertiseConfigured > Priority::DialBackVerified);
        assert!(Priority::DialBackVerified > Priority::StunDiscovered);
        assert!(Priority::StunDiscovered > Priority::RelayGuaranteed);
        assert!(Priority::RelayGuaranteed > Priority::LocalListen);
        assert!(Priority::LocalListen > Priority::Candidate);
        assert!(Priority::RelayGuaranteed.is_publishable());
        assert!(!Priority::LocalListen.is_publishable());
    }

    #[test]
    fn circuit_state_machine_follows_ping_failures() {
        let now = Instant::now();
        let mut c = Circuit::new(PeerId::random(), PeerId::random(), now);
        c.on_ping_failure(now);
        assert_eq!(c.state, CircuitState::Active);
        c.on_ping_failure(now);
        assert_eq!(c.state, CircuitState::Stale);
        c.on_ping_success();
        assert_eq!(c.state, CircuitState::Active);
    }
}
