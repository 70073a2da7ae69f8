//! Relay Subsystem (spec.md §4.2): System Relay (control-plane, ungated) and
//! Realm Relay (data-plane, PSK-gated), sharing one wire codec
//! (`protocol::codec::RelayMessage`) and server implementation, parameterized
//! by [`RelayTier`].

pub mod client;
pub mod server;

use libp2p::PeerId;

use crate::protocol_ids;

pub use client::RelayClient;
pub use server::RelayServer;

/// Which of the two relay tiers a given `RelayServer`/reservation operates
/// under. The wire format and reservation/circuit bookkeeping are identical;
/// only the protocol-gate prefix and membership admission differ
/// (spec.md §4.2 table).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayTier {
    System,
    Realm { realm_id_hex: String },
}

impl RelayTier {
    /// True if `protocol` (the `CONNECT` request's pre-check protocol, if
    /// any) is allowed to be forwarded under this tier.
    ///
    /// An empty protocol means "no pre-check" and is always allowed — the
    /// gate only rejects a *stated* protocol outside the tier's namespace.
    pub fn allows_protocol(&self, protocol: Option<&str>) -> bool {
        let Some(p) = protocol else { return true };
        match self {
            RelayTier::System => p.starts_with(protocol_ids::SYS_PREFIX),
            RelayTier::Realm { realm_id_hex } => {
                p.starts_with(&format!("{}{realm_id_hex}/", protocol_ids::APP_PREFIX))
                    || p.starts_with(&format!("{}{realm_id_hex}/", protocol_ids::REALM_PREFIX))
            }
        }
    }

    pub fn requires_membership_proof(&self) -> bool {
        matches!(self, RelayTier::Realm { .. })
    }

    pub fn bandwidth_bps(&self, system_bps: u64, realm_bps: u64) -> u64 {
        match self {
            RelayTier::System => system_bps,
            RelayTier::Realm { .. } => realm_bps,
        }
    }
}

/// Deterministic shard index for a per-source-peer table, spreading
/// reservation/circuit bookkeeping across `shard_count` independent locks
/// (spec.md §5 "Relay server's reservation table: sharded by source-peerID
/// modulo N shards").
pub fn shard_of(peer_id: &PeerId, shard_count: usize) -> usize {
    let bytes = peer_id.to_bytes();
    let mut acc: u64 = 0;
    for b in bytes {
        acc = acc.wrapping_mul(31).wrapping_add(b as u64);
    }
    (acc % shard_count.max(1) as u64) as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_tier_rejects_app_protocol() {
        let tier = RelayTier::System;
        assert!(tier.allows_protocol(None));
        assert!(tier.allows_protocol(Some("/dep2p/sys/ping/1.0.0")));
        assert!(!tier.allows_protocol(Some("/dep2p/app/deadbeef/chat")));
    }

    #[test]
    fn realm_tier_only_allows_its_own_realm_id() {
        let tier = RelayTier::Realm {
            realm_id_hex: "deadbeef".into(),
        };
        assert!(tier.allows_protocol(Some("/dep2p/app/deadbeef/chat")));
        assert!(tier.allows_protocol(Some("/dep2p/realm/deadbeef/sync/1.0.0")));
        assert!(!tier.allows_protocol(Some("/dep2p/app/cafebabe/chat")));
        assert!(!tier.allows_protocol(Some("/dep2p/sys/ping/1.0.0")));
    }

    #[test]
    fn shard_of_is_stable_and_bounded() {
        let peer = PeerId::random();
        let a = shard_of(&peer, 8);
        let b = shard_of(&peer, 8);
        assert_eq!(a, b);
        assert!(a < 8);
    }
}
