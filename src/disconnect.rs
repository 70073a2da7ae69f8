//! Disconnect Detection (spec.md §4.7): classifies detection signals by
//! trust level, runs the peer-witness confirmation protocol for low-trust
//! signals, and guards state transitions with reconnect-grace and
//! disconnect-protection windows so a flapping path doesn't flood the
//! realm with spurious membership churn.
//!
//! Generalizes the teacher's per-peer state tracking in `node.rs`
//! (`dialed`/`rejected`/`announced_to`, one `HashMap<PeerId, _>` per
//! concern) into a single `Mutex<HashMap<PeerId, PeerStatus>>` carrying a
//! proper state machine instead of independent booleans.

use std::{
    collections::{HashMap, VecDeque},
    num::NonZeroUsize,
    sync::atomic::{AtomicUsize, Ordering},
    time::{Duration, Instant},
};

use libp2p::PeerId;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;

use crate::{
    config::RealmMembershipConfig,
    events::{Event, EventBus, Topic},
    protocol::types::unix_now,
};

/// How a disconnect signal was obtained, and whether it can be trusted
/// without corroboration (spec.md §4.7 trust classification).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DetectionMethod {
    /// Transport-level close, reset, or FIN.
    ConnectionClosed,
    /// A signed, fresh `MemberLeave` announcement.
    GracefulLeave,
    PingFailure,
    StreamError,
    IdleTimeout,
    RelayTimeout,
}

impl DetectionMethod {
    pub fn is_high_trust(self) -> bool {
        matches!(self, DetectionMethod::ConnectionClosed | DetectionMethod::GracefulLeave)
    }
}

/// The state `events::Event::PeerStateChanged` carries (spec.md §4.9's
/// `Connected | Disconnecting | Disconnected | RecentlyDisconnected` model;
/// `RecentlyDisconnected` is tracked separately via `recently_disconnected`
/// rather than as a `PeerStatus` variant, since it applies *after* a peer
/// has already left the `peers` map's live bookkeeping).
///
/// `Suspected` is the window during which a low-trust signal awaits witness
/// corroboration; `Disconnecting` is the window — entered once a disconnect
/// is actually confirmed, whether by a high-trust signal or a witness
/// quorum — during which a reconnect still restores `Connected` with no
/// `MemberRemoved` event (spec.md §4.7 "reconnect grace window").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerConnectionState {
    Connected,
    Suspected,
    Disconnecting,
    Disconnected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WitnessVote {
    Agree,
    Disagree,
    /// Excluded from the effective-vote count used in the AGREE-ratio
    /// quorum (spec.md §4.7 `WitnessConfirmation{type ∈ {AGREE, DISAGREE,
    /// ABSTAIN}}`).
    Abstain,
}

struct PeerStatus {
    state: PeerConnectionState,
    witness_votes: Vec<WitnessVote>,
    suspected_since: Option<Instant>,
    disconnecting_since: Option<Instant>,
    transitions: VecDeque<Instant>,
}

impl Default for PeerStatus {
    fn default() -> Self {
        Self {
            state: PeerConnectionState::Connected,
            witness_votes: Vec::new(),
            suspected_since: None,
            disconnecting_since: None,
            transitions: VecDeque::new(),
        }
    }
}

/// Pseudorandom per-witness delay before independently reporting a
/// suspected disconnect, so every witness in a realm doesn't report at
/// once: `hash(witness || target || timestampSec)[0:8] mod 500ms`
/// (spec.md §4.7 "witness delay").
pub fn witness_delay(witness: PeerId, target: PeerId, timestamp_secs: i64) -> Duration {
    let mut hasher = Sha256::new();
    hasher.update(witness.to_bytes());
    hasher.update(target.to_bytes());
    hasher.update(timestamp_secs.to_be_bytes());
    let digest = hasher.finalize();
    let mut eight = [0u8; 8];
    eight.copy_from_slice(&digest[..8]);
    Duration::from_millis(u64::from_be_bytes(eight) % 500)
}

/// Tracks, per remote peer, whether it's connected, under suspicion, or
/// confirmed gone, and runs the witness-quorum and grace-window rules that
/// decide when a suspicion becomes a confirmed disconnect.
pub struct DisconnectDetector {
    realm_size_hint: AtomicUsize,
    config: RealmMembershipConfig,
    events: EventBus,
    peers: Mutex<HashMap<PeerId, PeerStatus>>,
    recently_disconnected: Mutex<HashMap<PeerId, Instant>>,
    seen_leave_nonces: Mutex<lru::LruCache<(PeerId, i64), ()>>,
}

impl DisconnectDetector {
    pub fn new(config: RealmMembershipConfig, events: EventBus) -> Self {
        let cap = NonZeroUsize::new(config.replay_cache_capacity.max(1)).expect("max(1) is never zero");
        Self {
            realm_size_hint: AtomicUsize::new(0),
            config,
            events,
            peers: Mutex::new(HashMap::new()),
            recently_disconnected: Mutex::new(HashMap::new()),
            seen_leave_nonces: Mutex::new(lru::LruCache::new(cap)),
        }
    }

    /// Update the realm member count used to gate the witness fast path.
    pub fn set_realm_size_hint(&self, n: usize) {
        self.realm_size_hint.store(n, Ordering::Relaxed);
    }

    async fn emit_state(&self, peer_id: PeerId, state: PeerConnectionState) {
        self.events.publish(Topic::Disconnect, Event::PeerStateChanged { peer_id, state });
    }

    /// True within `disconnect_protection` of a confirmed disconnect —
    /// callers should silently swallow further low-trust signals about this
    /// peer rather than re-triggering the witness protocol.
    pub async fn is_protected(&self, peer_id: PeerId) -> bool {
        let now = Instant::now();
        let guard = self.recently_disconnected.lock().await;
        matches!(guard.get(&peer_id), Some(t) if now.duration_since(*t) < self.config.disconnect_protection.get())
    }

    /// True while `peer_id` is in the `Disconnecting` grace window — a
    /// reconnect observed now is a continuation, not a fresh join, and
    /// produces no `MemberRemoved` event (spec.md §4.7 "reconnect grace
    /// window").
    pub async fn is_within_reconnect_grace(&self, peer_id: PeerId) -> bool {
        matches!(
            self.peers.lock().await.get(&peer_id).map(|s| s.state),
            Some(PeerConnectionState::Disconnecting)
        )
    }

    /// Record that `peer_id` is reachable again, clearing suspicion state.
    /// Called from a successful dial or an accepted inbound connection —
    /// the reconnect signal itself is an ordinary "we talked to this peer
    /// again" event, not something the transport layer needs its own
    /// variant for.
    pub async fn record_reconnect(&self, peer_id: PeerId) {
        self.recently_disconnected.lock().await.remove(&peer_id);
        {
            let mut peers = self.peers.lock().await;
            let status = peers.entry(peer_id).or_default();
            status.state = PeerConnectionState::Connected;
            status.witness_votes.clear();
            status.suspected_since = None;
            status.disconnecting_since = None;
        }
        self.emit_state(peer_id, PeerConnectionState::Connected).await;
    }

    /// A signed `MemberLeave` is authoritative once its timestamp falls
    /// within `proof_window`; deduplicated by `(peer_id, timestamp)` so a
    /// replayed signature can't re-fire the transition.
    pub async fn handle_graceful_leave(&self, peer_id: PeerId, signed_timestamp: i64) -> bool {
        let now = unix_now();
        if (now - signed_timestamp).unsigned_abs() > self.config.proof_window.get().as_secs() {
            return false;
        }
        {
            let mut cache = self.seen_leave_nonces.lock().await;
            if cache.put((peer_id, signed_timestamp), ()).is_some() {
                return false;
            }
        }
        self.transition_to_disconnected(peer_id, true).await;
        true
    }

    /// High-trust signals need no corroboration, but still wait out the
    /// reconnect grace window before the disconnect is confirmed — a
    /// momentary TCP blip should not by itself evict a peer from the realm
    /// (spec.md §4.7, boundary scenario spec.md §4.9).
    pub async fn report_high_trust(&self, peer_id: PeerId, method: DetectionMethod) {
        debug_assert!(method.is_high_trust(), "report_high_trust called with a low-trust method");
        self.begin_disconnecting(peer_id).await;
    }

    /// Low-trust signals open a witness confirmation round instead of
    /// transitioning immediately (spec.md §4.7).
    pub async fn report_low_trust(&self, peer_id: PeerId, _method: DetectionMethod) {
        let already_suspected = {
            let mut peers = self.peers.lock().await;
            let status = peers.entry(peer_id).or_default();
            if status.state != PeerConnectionState::Connected {
                true
            } else {
                status.state = PeerConnectionState::Suspected;
                status.suspected_since = Some(Instant::now());
                status.witness_votes.clear();
                false
            }
        };
        if !already_suspected {
            self.emit_state(peer_id, PeerConnectionState::Suspected).await;
        }
    }

    /// Record one witness's independent report. A realm smaller than
    /// `fast_path_threshold` accepts a single trusted, high-trust-method
    /// AGREE without waiting for full quorum; otherwise confirmation needs
    /// at least two effective votes (ABSTAIN excluded from the count) with
    /// a strict AGREE majority. A DISAGREE vetoes the suspicion outright
    /// only when it carries proof of reachability; a bare DISAGREE instead
    /// just counts as a non-agreeing effective vote (spec.md §4.7).
    ///
    /// Returns `Some(true)` if this report confirmed the disconnect,
    /// `Some(false)` if it vetoed the suspicion, `None` if neither
    /// threshold was reached yet.
    pub async fn record_witness_report(
        &self,
        peer_id: PeerId,
        vote: WitnessVote,
        witness_is_trusted: bool,
        detection_was_high_trust: bool,
        disagree_has_reachability_proof: bool,
    ) -> Option<bool> {
        let realm_member_count = self.realm_size_hint.load(Ordering::Relaxed);
        let mut peers = self.peers.lock().await;
        let status = peers.entry(peer_id).or_default();

        if matches!(status.state, PeerConnectionState::Disconnecting | PeerConnectionState::Disconnected) {
            return Some(true);
        }

        if vote == WitnessVote::Disagree && disagree_has_reachability_proof {
            status.state = PeerConnectionState::Connected;
            status.witness_votes.clear();
            status.suspected_since = None;
            drop(peers);
            self.emit_state(peer_id, PeerConnectionState::Connected).await;
            return Some(false);
        }

        status.witness_votes.push(vote);
        let effective: Vec<WitnessVote> =
            status.witness_votes.iter().copied().filter(|v| *v != WitnessVote::Abstain).collect();
        let agree = effective.iter().filter(|v| **v == WitnessVote::Agree).count();
        let quorum_reached = effective.len() >= 2 && agree * 2 > effective.len();
        let fast_path = vote == WitnessVote::Agree
            && realm_member_count > 0
            && realm_member_count < self.config.fast_path_threshold
            && witness_is_trusted
            && detection_was_high_trust;
        drop(peers);

        if fast_path || quorum_reached {
            self.begin_disconnecting(peer_id).await;
            Some(true)
        } else {
            None
        }
    }

    /// A `Suspected` peer whose confirmation window elapsed without
    /// reaching quorum reverts to `Connected` instead of hanging forever.
    /// Intended to run on a periodic timer.
    pub async fn expire_unconfirmed_suspicions(&self) {
        let now = Instant::now();
        let window = self.config.witness_confirmation_window.get();
        let mut expired = Vec::new();
        {
            let mut peers = self.peers.lock().await;
            for (peer_id, status) in peers.iter_mut() {
                if status.state != PeerConnectionState::Suspected {
                    continue;
                }
                if matches!(status.suspected_since, Some(since) if now.duration_since(since) > window) {
                    status.state = PeerConnectionState::Connected;
                    status.witness_votes.clear();
                    status.suspected_since = None;
                    expired.push(*peer_id);
                }
            }
        }
        for peer_id in expired {
            self.emit_state(peer_id, PeerConnectionState::Connected).await;
        }
    }

    /// Move a `Connected`/`Suspected` peer into the `Disconnecting` grace
    /// window: a disconnect has been confirmed (high-trust signal or
    /// witness quorum) but `MemberRemoved` is withheld until
    /// `reconnect_grace_period` elapses without a reconnect (spec.md §4.7,
    /// §4.9). No-op if the peer is already past this point.
    async fn begin_disconnecting(&self, peer_id: PeerId) {
        let should_emit = {
            let mut peers = self.peers.lock().await;
            let status = peers.entry(peer_id).or_default();
            if matches!(status.state, PeerConnectionState::Disconnecting | PeerConnectionState::Disconnected) {
                false
            } else {
                status.state = PeerConnectionState::Disconnecting;
                status.disconnecting_since = Some(Instant::now());
                status.witness_votes.clear();
                status.suspected_since = None;
                true
            }
        };
        if should_emit {
            self.emit_state(peer_id, PeerConnectionState::Disconnecting).await;
        }
    }

    /// Finalize every `Disconnecting` peer whose reconnect grace window has
    /// elapsed without a reconnect, confirming the disconnect and emitting
    /// `MemberRemoved`. Intended to run on a periodic timer alongside
    /// `expire_unconfirmed_suspicions`/`sweep_expired_protection`.
    pub async fn finalize_expired_disconnecting(&self) {
        let now = Instant::now();
        let grace = self.config.reconnect_grace_period.get();
        let mut expired = Vec::new();
        {
            let peers = self.peers.lock().await;
            for (peer_id, status) in peers.iter() {
                if status.state != PeerConnectionState::Disconnecting {
                    continue;
                }
                if matches!(status.disconnecting_since, Some(since) if now.duration_since(since) >= grace) {
                    expired.push(*peer_id);
                }
            }
        }
        for peer_id in expired {
            self.transition_to_disconnected(peer_id, false).await;
        }
    }

    /// Confirm a disconnect and publish `MemberRemoved`. A graceful leave
    /// (explicit, already anti-replayed) applies unconditionally; an
    /// inferred disconnect only finalizes if the peer is still in the
    /// `Disconnecting` grace window — if it reconnected in the meantime
    /// this is a stale sweep result and must not fire.
    async fn transition_to_disconnected(&self, peer_id: PeerId, graceful: bool) {
        {
            let mut peers = self.peers.lock().await;
            let status = peers.entry(peer_id).or_default();
            if !graceful && status.state != PeerConnectionState::Disconnecting {
                return;
            }
            let now = Instant::now();
            status.transitions.retain(|t| now.duration_since(*t) <= self.config.oscillation_window.get());
            if status.transitions.len() as u32 >= self.config.oscillation_threshold {
                tracing::warn!(%peer_id, "disconnect: suppressing state flap, oscillation threshold reached");
                return;
            }
            status.transitions.push_back(now);
            status.state = PeerConnectionState::Disconnected;
            status.witness_votes.clear();
            status.suspected_since = None;
            status.disconnecting_since = None;
        }
        self.recently_disconnected.lock().await.insert(peer_id, Instant::now());
        self.emit_state(peer_id, PeerConnectionState::Disconnected).await;
        self.events.publish(Topic::Realm, Event::MemberRemoved { peer_id, graceful });
    }

    pub async fn state_of(&self, peer_id: PeerId) -> PeerConnectionState {
        self.peers.lock().await.get(&peer_id).map(|s| s.state).unwrap_or(PeerConnectionState::Connected)
    }

    /// Drop bookkeeping for peers long past both grace windows, keeping
    /// `recently_disconnected` bounded on a long-lived node. Intended to run
    /// on a periodic timer alongside `expire_unconfirmed_suspicions`.
    pub async fn sweep_expired_protection(&self) {
        let now = Instant::now();
        let window = self.config.disconnect_protection.get().max(self.config.reconnect_grace_period.get());
        self.recently_disconnected.lock().await.retain(|_, t| now.duration_since(*t) < window);
    }
}
