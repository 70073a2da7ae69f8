//! Connection Manager (spec.md §4.8): scores live peers against the
//! low/high watermark, decays scores over time, and produces an eviction
//! ranking when the connection count crosses `high_water`.
//!
//! `Transport` has no disconnect/close method (see `transport/mod.rs`), so
//! this module only scores and selects — closing the evicted connection is
//! the caller's responsibility, exactly the split the teacher draws between
//! `node.rs`'s bookkeeping maps and the swarm it never touches directly.

use std::{collections::HashMap, time::Instant};

use libp2p::PeerId;
use tokio::sync::Mutex;

use crate::config::ConnMgrConfig;

/// Per-connection scoring state. Higher is safer to keep; `protected` peers
/// are never returned as eviction candidates regardless of score.
struct PeerScore {
    score: f64,
    protected: bool,
    connected_at: Instant,
    last_active: Instant,
}

/// Tracks live connection count against configured watermarks and scores
/// each connection for eviction ranking once `high_water` is exceeded.
pub struct ConnectionManager {
    config: ConnMgrConfig,
    peers: Mutex<HashMap<PeerId, PeerScore>>,
}

/// Starting score for a newly accepted or dialed connection; decay and
/// activity move it from there.
const INITIAL_SCORE: f64 = 10.0;
/// Multiplicative decay applied to every unprotected score on each
/// `decay_scores` tick, per `ConnMgrConfig::decay_interval`.
const DECAY_FACTOR: f64 = 0.95;
/// Bump applied to a peer's score each time `touch` observes activity.
const ACTIVITY_BONUS: f64 = 1.0;

impl ConnectionManager {
    pub fn new(config: ConnMgrConfig) -> Self {
        Self {
            config,
            peers: Mutex::new(HashMap::new()),
        }
    }

    pub async fn connection_count(&self) -> usize {
        self.peers.lock().await.len()
    }

    pub async fn is_above_high_water(&self) -> bool {
        self.connection_count().await > self.config.high_water
    }

    pub async fn is_above_low_water(&self) -> bool {
        self.connection_count().await > self.config.low_water
    }

    /// Start tracking a newly established connection.
    pub async fn on_connected(&self, peer_id: PeerId) {
        let now = Instant::now();
        self.peers.lock().await.insert(
            peer_id,
            PeerScore {
                score: INITIAL_SCORE,
                protected: false,
                connected_at: now,
                last_active: now,
            },
        );
    }

    /// Stop tracking a connection once it's actually closed.
    pub async fn on_disconnected(&self, peer_id: &PeerId) {
        self.peers.lock().await.remove(peer_id);
    }

    /// Mark a peer as exempt from eviction (e.g. a relay, a bootstrap peer,
    /// or a peer within a disconnect-protection window).
    pub async fn set_protected(&self, peer_id: PeerId, protected: bool) {
        if let Some(entry) = self.peers.lock().await.get_mut(&peer_id) {
            entry.protected = protected;
        }
    }

    /// Record observed traffic/liveness on a connection, nudging its score
    /// up so active peers outlast idle ones under eviction pressure.
    pub async fn touch(&self, peer_id: PeerId) {
        if let Some(entry) = self.peers.lock().await.get_mut(&peer_id) {
            entry.score += ACTIVITY_BONUS;
            entry.last_active = Instant::now();
        }
    }

    /// Apply one round of exponential decay to every unprotected score.
    /// Intended to run on a timer at `ConnMgrConfig::decay_interval`.
    pub async fn decay_scores(&self) {
        let mut peers = self.peers.lock().await;
        for entry in peers.values_mut() {
            if !entry.protected {
                entry.score *= DECAY_FACTOR;
            }
        }
    }

    /// Rank unprotected, post-grace-period connections lowest-score-first —
    /// the order a caller should close connections in to bring the count
    /// back to `low_water`. Connections younger than `grace_period` are
    /// never offered up, so a peer mid-handshake isn't evicted before it
    /// has a chance to prove useful.
    pub async fn eviction_candidates(&self) -> Vec<PeerId> {
        let now = Instant::now();
        let grace = self.config.grace_period.get();
        let peers = self.peers.lock().await;
        let mut candidates: Vec<(PeerId, f64)> = peers
            .iter()
            .filter(|(_, s)| !s.protected && now.duration_since(s.connected_at) >= grace)
            .map(|(peer_id, s)| (*peer_id, s.score))
            .collect();
        candidates.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));
        candidates.into_iter().map(|(peer_id, _)| peer_id).collect()
    }

    /// How many connections must be closed to bring the count down to
    /// `low_water`, given the current connection count. Zero unless
    /// `high_water` is exceeded.
    pub async fn excess_over_low_water(&self) -> usize {
        let count = self.connection_count().await;
        count.saturating_sub(self.config.low_water)
    }

    /// Run `decay_scores` forever at `decay_interval`.
    pub async fn run_decay_loop(self: std::sync::Arc<Self>) {
        let mut interval = tokio::time::interval(self.config.decay_interval.get());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            interval.tick().await;
            self.decay_scores().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> ConnMgrConfig {
        ConnMgrConfig {
            low_water: 2,
            high_water: 4,
            grace_period: crate::config::ConfigDuration::from_millis(0),
            decay_interval: crate::config::ConfigDuration::from_secs(60),
        }
    }

    #[tokio::test]
    async fn watermarks_reflect_connection_count() {
        let mgr = ConnectionManager::new(cfg());
        for _ in 0..5 {
            mgr.on_connected(PeerId::random()).await;
        }
        assert!(mgr.is_above_low_water().await);
        assert!(mgr.is_above_high_water().await);
        assert_eq!(mgr.excess_over_low_water().await, 3);
    }

    #[tokio::test]
    async fn eviction_candidates_are_lowest_score_first() {
        let mgr = ConnectionManager::new(cfg());
        let low = PeerId::random();
        let high = PeerId::random();
        mgr.on_connected(low).await;
        mgr.on_connected(high).await;
        mgr.touch(high).await;
        mgr.touch(high).await;
        mgr.touch(high).await;

        let candidates = mgr.eviction_candidates().await;
        assert_eq!(candidates[0], low);
        assert_eq!(candidates[1], high);
    }

    #[tokio::test]
    async fn protected_peers_are_never_eviction_candidates() {
        let mgr = ConnectionManager::new(cfg());
        let peer = PeerId::random();
        mgr.on_connected(peer).await;
        mgr.set_protected(peer, true).await;
        assert!(mgr.eviction_candidates().await.is_empty());
    }

    #[tokio::test]
    async fn decay_reduces_unprotected_scores_only() {
        let mgr = ConnectionManager::new(cfg());
        let protected = PeerId::random();
        let plain = PeerId::random();
        mgr.on_connected(protected).await;
        mgr.on_connected(plain).await;
        mgr.set_protected(protected, true).await;
        mgr.decay_scores().await;

        let peers = mgr.peers.lock().await;
        assert_eq!(peers.get(&protected).unwrap().score, INITIAL_SCORE);
        assert!(peers.get(&plain).unwrap().score < INITIAL_SCORE);
    }

    #[tokio::test]
    async fn disconnect_stops_tracking() {
        let mgr = ConnectionManager::new(cfg());
        let peer = PeerId::random();
        mgr.on_connected(peer).await;
        mgr.on_disconnected(&peer).await;
        assert_eq!(mgr.connection_count().await, 0);
    }
}
