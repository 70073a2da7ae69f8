//! Reachability Engine (spec.md §4.1): STUN probing, candidate
//! classification, dial-back verification, and the publishable-address
//! change stream.

use std::{
    sync::{Arc, RwLock},
    time::Duration,
};

use futures::future::join_all;
use libp2p::{Multiaddr, PeerId};

use crate::{
    config::NatConfig,
    events::{Event, EventBus, Topic},
    peerstore::Peerstore,
    protocol::types::{AddressSource, Priority},
    stun,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NatType {
    #[default]
    Unknown,
    Cone,
    Symmetric,
}

#[derive(Debug, Clone, Default)]
pub struct ReachabilityStatus {
    pub nat_type: NatType,
    pub stun_fallback_used: bool,
    pub stun_failed: bool,
    pub stun_last_error: Option<String>,
}

/// Maintains this node's belief about its own externally reachable
/// addresses. Owns no network socket beyond the ephemeral UDP sockets it
/// opens per STUN probe; the addresses it discovers are written into the
/// shared [`Peerstore`] under the local peer id.
pub struct ReachabilityEngine {
    local_peer_id: PeerId,
    udp_port: u16,
    config: NatConfig,
    peerstore: Arc<Peerstore>,
    events: EventBus,
    status: RwLock<ReachabilityStatus>,
}

impl ReachabilityEngine {
    pub fn new(local_peer_id: PeerId, udp_port: u16, config: NatConfig, peerstore: Arc<Peerstore>, events: EventBus) -> Self {
        Self {
            local_peer_id,
            udp_port,
            config,
            peerstore,
            events,
            status: RwLock::new(ReachabilityStatus::default()),
        }
    }

    pub fn status(&self) -> ReachabilityStatus {
        self.status.read().unwrap().clone()
    }

    /// Run the STUN probing sequence once: parallel fan-out to
    /// `stun_initial_fanout` servers at `stun_initial_timeout`; if every
    /// initial probe fails, a slower fallback fan-out to
    /// `stun_fallback_fanout` servers.
    ///
    /// On any successful response, records the external address at priority
    /// 75 (or 100 if `trust_stun_addresses`) and publishes an
    /// `AddressSetChanged` event with the updated publishable set.
    pub async fn probe(&self) {
        let initial_servers: Vec<&str> = self
            .config
            .stun_servers
            .iter()
            .take(self.config.stun_initial_fanout.max(1))
            .map(String::as_str)
            .collect();

        let mut responses = self.probe_servers(&initial_servers, self.config.stun_initial_timeout.get()).await;

        let used_fallback = responses.is_empty() && self.config.stun_servers.len() > initial_servers.len();
        if used_fallback {
            let fallback_servers: Vec<&str> = self
                .config
                .stun_servers
                .iter()
                .skip(initial_servers.len())
                .take(self.config.stun_fallback_fanout.max(1))
                .map(String::as_str)
                .collect();
            responses = self.probe_servers(&fallback_servers, self.config.stun_fallback_timeout.get()).await;
        }

        let mut status = self.status.write().unwrap();
        status.stun_fallback_used = used_fallback;
        status.stun_failed = responses.is_empty();

        if responses.is_empty() {
            status.stun_last_error = Some("all STUN servers unreachable".to_string());
            return;
        }

        let distinct: std::collections::HashSet<_> = responses.iter().map(|a| a.ip()).collect();
        status.nat_type = if distinct.len() > 1 { NatType::Symmetric } else { NatType::Cone };
        status.stun_last_error = None;
        drop(status);

        let external = responses[0];
        let priority = if self.config.trust_stun_addresses {
            Priority::DialBackVerified
        } else {
            Priority::StunDiscovered
        };
        let addr: Multiaddr = format!(
            "/ip4/{}/udp/{}/quic-v1/p2p/{}",
            external.ip(),
            external.port(),
            self.local_peer_id
        )
        .parse()
        .expect("well-formed multiaddr from a parsed SocketAddr");

        self.peerstore
            .insert_address(self.local_peer_id, addr, priority, AddressSource::Stun, None)
            .await;

        self.publish_address_set_changed().await;
    }

    async fn probe_servers(&self, servers: &[&str], timeout: Duration) -> Vec<std::net::SocketAddr> {
        let futs = servers.iter().map(|s| {
            let server = (*s).to_string();
            async move { stun::probe_one(&server, timeout).await.ok() }
        });
        join_all(futs).await.into_iter().flatten().collect()
    }

    async fn publish_address_set_changed(&self) {
        let publishable = self
            .peerstore
            .publishable_addresses(self.local_peer_id, self.config.allow_private_addrs)
            .await;
        self.events.publish(Topic::Connectivity, Event::AddressSetChanged { publishable });
    }

    /// Promote `candidate` to dial-back-verified (priority 100) once the
    /// caller has confirmed a peer-assisted inbound dial to it succeeded.
    /// The actual dial-back request/response exchange over `/dep2p/sys/
    /// dialback/1.0.0` is a transport-layer concern driven by the dial
    /// engine; this just records the outcome.
    pub async fn record_dial_back_success(&self, candidate: Multiaddr) {
        self.peerstore
            .insert_address(self.local_peer_id, candidate, Priority::DialBackVerified, AddressSource::DialBack, None)
            .await;
        self.publish_address_set_changed().await;
    }

    /// Quorum rule for witness-based address verification: a candidate is
    /// promoted once a majority of at least `quorum` reporting peers confirm
    /// a successful dial (spec.md §4.1 "Witness verification").
    pub fn witness_quorum_reached(reports: &[bool], quorum: usize) -> bool {
        if reports.len() < quorum {
            return false;
        }
        let agree = reports.iter().filter(|r| **r).count();
        agree * 2 > reports.len()
    }

    pub async fn record_witness_verified(&self, candidate: Multiaddr, reports: &[bool]) -> bool {
        if !Self::witness_quorum_reached(reports, self.config.witness_quorum) {
            return false;
        }
        self.peerstore
            .insert_address(self.local_peer_id, candidate, Priority::DialBackVerified, AddressSource::DialBack, None)
            .await;
        self.publish_address_set_changed().await;
        true
    }

    /// React to a detected network-interface change (spec.md §4.1
    /// "Network-change handling"). A major change (radio technology switch)
    /// invalidates every verified address and re-probes; a minor change
    /// (DHCP renewal) only re-probes, leaving existing records in place
    /// until the re-probe either confirms or fails them.
    pub async fn handle_network_change(&self, major: bool) {
        if major {
            self.invalidate_verified_addresses().await;
        }
        self.probe().await;
    }

    async fn invalidate_verified_addresses(&self) {
        let addrs = self.peerstore.addresses(self.local_peer_id).await;
        for record in addrs {
            if matches!(record.priority, Priority::StunDiscovered | Priority::DialBackVerified) {
                self.peerstore.remove_address(self.local_peer_id, &record.addr).await;
            }
        }
        self.publish_address_set_changed().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn witness_quorum_requires_strict_majority() {
        assert!(ReachabilityEngine::witness_quorum_reached(&[true, true], 2));
        assert!(!ReachabilityEngine::witness_quorum_reached(&[true, false], 2));
        assert!(!ReachabilityEngine::witness_quorum_reached(&[true], 2));
        assert!(ReachabilityEngine::witness_quorum_reached(&[true, true, false], 2));
    }

    #[tokio::test]
    async fn probe_with_unreachable_servers_sets_failed_flag() {
        let peerstore = Arc::new(Peerstore::new());
        let mut config = NatConfig::default();
        config.stun_servers = vec!["198.51.100.1:1".to_string()];
        config.stun_initial_fanout = 1;
        config.stun_initial_timeout = crate::config::ConfigDuration::from_millis(50);
        config.stun_fallback_fanout = 1;
        config.stun_fallback_timeout = crate::config::ConfigDuration::from_millis(50);

        let engine = ReachabilityEngine::new(PeerId::random(), 4001, config, peerstore, EventBus::new(4));
        engine.probe().await;
        assert!(engine.status().stun_failed);
    }
}
