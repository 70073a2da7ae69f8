//! Peerstore: PeerID → (addresses, protocols, metadata) with TTLs
//! (spec.md §2/§5 "Peerstore: readers-writer lock; reads parallel, writes
//! serialized").
//!
//! Generalizes the shape of `PeerManager` in the f0981c2b peer-manager
//! reference (`peers: RwLock<HashMap<..>>`, a single struct owning all
//! peer state behind one lock) but keyed directly by `PeerId` since this
//! crate has no separate overlay-address layer, and using `tokio::sync`
//! primitives rather than `parking_lot` to match the rest of this crate's
//! async call sites.

use std::{
    collections::HashMap,
    time::{Duration, Instant},
};

use libp2p::{Multiaddr, PeerId};
use tokio::sync::RwLock;

use crate::protocol::types::{AddressRecord, AddressSource, Priority};

/// Everything known about one peer, independent of whether it's currently
/// connected.
#[derive(Debug, Clone, Default)]
pub struct PeerRecord {
    pub addresses: Vec<AddressRecord>,
    pub protocols: Vec<String>,
    pub last_seen: Option<Instant>,
}

impl PeerRecord {
    /// Insert or refresh `addr`. An existing entry for the same address is
    /// replaced only if the new record carries priority ≥ the old one, so a
    /// stale STUN probe can't downgrade an operator-configured address.
    fn upsert_address(&mut self, record: AddressRecord) {
        if let Some(existing) = self.addresses.iter_mut().find(|r| r.addr == record.addr) {
            if record.priority >= existing.priority {
                *existing = record;
            }
            return;
        }
        self.addresses.push(record);
    }

    fn evict_expired(&mut self, now: Instant) {
        self.addresses.retain(|r| !r.is_expired(now));
    }

    /// Best-to-worst by priority, ties broken by insertion order.
    fn sorted_addresses(&self) -> Vec<AddressRecord> {
        let mut addrs = self.addresses.clone();
        addrs.sort_by(|a, b| b.priority.cmp(&a.priority));
        addrs
    }
}

/// Shared peer knowledge base. A single `RwLock` over the whole map: reads
/// (dial candidate lookup, address-book export) are frequent and cheap,
/// writes (STUN refresh, dial-back confirmation, protocol negotiation) are
/// comparatively rare, so contention stays low without per-peer locking.
#[derive(Default)]
pub struct Peerstore {
    peers: RwLock<HashMap<PeerId, PeerRecord>>,
}

impl Peerstore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or refresh a single address for `peer_id`.
    pub async fn insert_address(
        &self,
        peer_id: PeerId,
        addr: Multiaddr,
        priority: Priority,
        source: AddressSource,
        ttl: Option<Duration>,
    ) {
        let mut peers = self.peers.write().await;
        let entry = peers.entry(peer_id).or_default();
        entry.upsert_address(AddressRecord {
            addr,
            priority,
            source,
            expires_at: ttl.map(|d| Instant::now() + d),
        });
    }

    pub async fn record_protocols(&self, peer_id: PeerId, protocols: Vec<String>) {
        let mut peers = self.peers.write().await;
        peers.entry(peer_id).or_default().protocols = protocols;
    }

    pub async fn touch(&self, peer_id: PeerId) {
        let mut peers = self.peers.write().await;
        peers.entry(peer_id).or_default().last_seen = Some(Instant::now());
    }

    /// All known, non-expired addresses for `peer_id`, best priority first.
    /// Empty if the peer is unknown (spec.md §4.4 step 1a — peerstore entries
    /// are one of several address sources the dial engine unions).
    pub async fn addresses(&self, peer_id: PeerId) -> Vec<AddressRecord> {
        let peers = self.peers.read().await;
        match peers.get(&peer_id) {
            Some(record) => {
                let now = Instant::now();
                record
                    .sorted_addresses()
                    .into_iter()
                    .filter(|r| !r.is_expired(now))
                    .collect()
            }
            None => Vec::new(),
        }
    }

    pub async fn protocols(&self, peer_id: PeerId) -> Vec<String> {
        self.peers
            .read()
            .await
            .get(&peer_id)
            .map(|r| r.protocols.clone())
            .unwrap_or_default()
    }

    pub async fn known_peers(&self) -> Vec<PeerId> {
        self.peers.read().await.keys().copied().collect()
    }

    /// Addresses eligible for external publication: priority ≥ 50, and
    /// private/loopback/link-local filtered out unless `allow_private` is
    /// set (spec.md §4.1 publication filter).
    pub async fn publishable_addresses(&self, peer_id: PeerId, allow_private: bool) -> Vec<Multiaddr> {
        self.addresses(peer_id)
            .await
            .into_iter()
            .filter(|r| r.priority.is_publishable())
            .filter(|r| allow_private || !crate::multiaddr::is_private(&r.addr))
            .map(|r| r.addr)
            .collect()
    }

    /// Drop expired address records across all peers and remove peers left
    /// with no addresses, no protocols, and no recent activity. Intended to
    /// run on a periodic sweep.
    pub async fn evict_expired(&self, stale_after: Duration) {
        let now = Instant::now();
        let mut peers = self.peers.write().await;
        peers.retain(|_, record| {
            record.evict_expired(now);
            let stale = record
                .last_seen
                .map(|t| now.duration_since(t) > stale_after)
                .unwrap_or(false);
            !(record.addresses.is_empty() && record.protocols.is_empty() && stale)
        });
    }

    pub async fn remove(&self, peer_id: &PeerId) {
        self.peers.write().await.remove(peer_id);
    }

    /// Drop a single address record for `peer_id`, e.g. when a network
    /// change invalidates a previously verified candidate.
    pub async fn remove_address(&self, peer_id: PeerId, addr: &Multiaddr) {
        let mut peers = self.peers.write().await;
        if let Some(record) = peers.get_mut(&peer_id) {
            record.addresses.retain(|r| &r.addr != addr);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn addresses_come_back_sorted_by_priority() {
        let store = Peerstore::new();
        let peer = PeerId::random();
        store
            .insert_address(
                peer,
                "/ip4/10.0.0.1/tcp/1".parse().unwrap(),
                Priority::Candidate,
                AddressSource::Candidate,
                None,
            )
            .await;
        store
            .insert_address(
                peer,
                "/ip4/203.0.113.1/tcp/2".parse().unwrap(),
                Priority::StunDiscovered,
                AddressSource::Stun,
                None,
            )
            .await;
        let addrs = store.addresses(peer).await;
        assert_eq!(addrs[0].priority, Priority::StunDiscovered);
        assert_eq!(addrs[1].priority, Priority::Candidate);
    }

    #[tokio::test]
    async fn higher_priority_does_not_get_clobbered_by_lower() {
        let store = Peerstore::new();
        let peer = PeerId::random();
        let addr: Multiaddr = "/ip4/203.0.113.1/tcp/2".parse().unwrap();
        store
            .insert_address(peer, addr.clone(), Priority::AdvertiseConfigured, AddressSource::OperatorConfigured, None)
            .await;
        store
            .insert_address(peer, addr.clone(), Priority::Candidate, AddressSource::Candidate, None)
            .await;
        let addrs = store.addresses(peer).await;
        assert_eq!(addrs.len(), 1);
        assert_eq!(addrs[0].priority, Priority::AdvertiseConfigured);
    }

    #[tokio::test]
    async fn expired_addresses_are_filtered_out() {
        let store = Peerstore::new();
        let peer = PeerId::random();
        store
            .insert_address(
                peer,
                "/ip4/203.0.113.1/tcp/2".parse().unwrap(),
                Priority::Candidate,
                AddressSource::Candidate,
                Some(Duration::from_millis(1)),
            )
            .await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(store.addresses(peer).await.is_empty());
    }

    #[tokio::test]
    async fn publication_filter_drops_private_unless_allowed() {
        let store = Peerstore::new();
        let peer = PeerId::random();
        store
            .insert_address(
                peer,
                "/ip4/192.168.1.5/tcp/2".parse().unwrap(),
                Priority::RelayGuaranteed,
                AddressSource::Relay,
                None,
            )
            .await;
        assert!(store.publishable_addresses(peer, false).await.is_empty());
        assert_eq!(store.publishable_addresses(peer, true).await.len(), 1);
    }

    #[tokio::test]
    async fn unknown_peer_has_no_addresses() {
        let store = Peerstore::new();
        assert!(store.addresses(PeerId::random()).await.is_empty());
    }
}
