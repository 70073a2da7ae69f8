//! Realm Manager (spec.md §4.5): single-realm membership lifecycle, PSK
//! discovery publication/polling, mutual membership authentication, and the
//! protocol-id rewriting shim that scopes application protocols to the
//! active realm.
//!
//! The discovery loop generalizes the teacher's exponential-backoff
//! `on_poll_tick`/`fetch_and_dial_peers` pattern in `node.rs`, widened from
//! "fetch peers in one fixed-name room" to "fetch members of
//! `RealmId::discovery_key_hash()`, exchanging a mutual PSK proof before
//! either side treats the other as a member."

use std::{
    collections::HashMap,
    io,
    num::NonZeroUsize,
    sync::Arc,
    time::{Duration, Instant},
};

use futures::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use libp2p::{Multiaddr, PeerId};
use rand::RngCore;
use tokio::sync::{Mutex, RwLock};

use crate::{
    config::{DiscoveryConfig, RealmMembershipConfig, SecurityConfig},
    discovery::DiscoveryProvider,
    error::P2pError,
    events::{Event, EventBus, Topic},
    protocol::types::{unix_now, MemberRecord, MemberRole, MembershipProof, RealmId, RealmKey},
    protocol_ids,
    transport::Transport,
};

const AUTH_DEADLINE: Duration = Duration::from_secs(10);
const MAX_PROOF_WIRE_LEN: usize = 4096;

struct ActiveRealm {
    key: RealmKey,
    realm_id: RealmId,
    members: HashMap<PeerId, MemberRecord>,
}

/// Owns at most one active realm membership at a time (spec.md §4.5
/// single-realm invariant — a node needing isolation across several realms
/// runs one node instance per realm instead).
pub struct RealmManager {
    local_peer_id: PeerId,
    transport: Arc<dyn Transport>,
    discovery: Arc<dyn DiscoveryProvider>,
    events: EventBus,
    membership_cfg: RealmMembershipConfig,
    discovery_cfg: DiscoveryConfig,
    security: SecurityConfig,
    active: RwLock<Option<ActiveRealm>>,
    poll_backoff: Mutex<Duration>,
    /// Size-bounded LRU of `(sender, timestamp, nonce)` triples already
    /// accepted, so a captured `MembershipProof` can't be replayed within
    /// its own validity window (spec.md §4.6 last bullet).
    seen_proof_nonces: Mutex<lru::LruCache<(PeerId, i64, [u8; 16]), ()>>,
}

impl RealmManager {
    pub fn new(
        local_peer_id: PeerId,
        transport: Arc<dyn Transport>,
        discovery: Arc<dyn DiscoveryProvider>,
        events: EventBus,
        membership_cfg: RealmMembershipConfig,
        discovery_cfg: DiscoveryConfig,
        security: SecurityConfig,
    ) -> Arc<Self> {
        let backoff = discovery_cfg.poll_interval_min.get();
        let replay_cap = NonZeroUsize::new(membership_cfg.replay_cache_capacity.max(1)).expect("max(1) is never zero");
        Arc::new(Self {
            local_peer_id,
            transport,
            discovery,
            events,
            membership_cfg,
            discovery_cfg,
            security,
            active: RwLock::new(None),
            poll_backoff: Mutex::new(backoff),
            seen_proof_nonces: Mutex::new(lru::LruCache::new(replay_cap)),
        })
    }

    /// `true` the first time `(sender, timestamp, nonce)` is seen; `false`
    /// on a replay, which callers must treat as verification failure.
    async fn record_proof_fresh(&self, proof: &MembershipProof) -> bool {
        let mut cache = self.seen_proof_nonces.lock().await;
        cache.put((proof.sender, proof.timestamp, proof.nonce), ()).is_none()
    }

    pub async fn current_realm_id(&self) -> Option<RealmId> {
        self.active.read().await.as_ref().map(|r| r.realm_id)
    }

    /// Join the realm identified by `key`, publishing this node's provider
    /// record under the realm's discovery room. The background
    /// authentication/poll loops are separate tasks (`run_discovery_loop`,
    /// `run_auth_responder`) started once by the caller.
    pub async fn join(&self, key: RealmKey, advertise_addr: Multiaddr) -> Result<RealmId, P2pError> {
        {
            let guard = self.active.read().await;
            if guard.is_some() {
                return Err(P2pError::already_in_realm());
            }
        }
        let realm_id = RealmId::derive(&key);
        let room = realm_id.discovery_key_hash();
        self.discovery.publish_peer(&room, &self.local_peer_id, &advertise_addr)?;

        {
            let mut guard = self.active.write().await;
            *guard = Some(ActiveRealm {
                key,
                realm_id,
                members: HashMap::new(),
            });
        }
        *self.poll_backoff.lock().await = self.discovery_cfg.poll_interval_min.get();
        self.events.publish(Topic::Realm, Event::RealmJoined { realm_id: realm_id.0 });
        Ok(realm_id)
    }

    /// Leave the active realm, removing this node's discovery record.
    /// A no-op if no realm is joined.
    pub async fn leave(&self) -> Result<(), P2pError> {
        let realm = self.active.write().await.take();
        let Some(realm) = realm else {
            return Ok(());
        };
        let room = realm.realm_id.discovery_key_hash();
        let _ = self.discovery.delete_peer(&room, &self.local_peer_id);
        self.events.publish(Topic::Realm, Event::RealmLeft { realm_id: realm.realm_id.0 });
        Ok(())
    }

    pub async fn members(&self) -> Vec<MemberRecord> {
        self.active
            .read()
            .await
            .as_ref()
            .map(|r| r.members.values().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn member_count(&self) -> usize {
        self.active.read().await.as_ref().map(|r| r.members.len()).unwrap_or(0)
    }

    /// Infrastructure peers are always treated as members, regardless of
    /// realm state, so bootstrap/relay traffic is never gated on proof
    /// exchange (spec.md §4.5 "infrastructure-peer allow-list").
    pub async fn is_member(&self, peer_id: PeerId) -> bool {
        if self.security.infra_peers.contains(&peer_id) {
            return true;
        }
        self.active.read().await.as_ref().map(|r| r.members.contains_key(&peer_id)).unwrap_or(false)
    }

    pub async fn remove_member(&self, peer_id: &PeerId) {
        if let Some(realm) = self.active.write().await.as_mut() {
            realm.members.remove(peer_id);
        }
    }

    /// Poll discovery for the realm's member room forever, authenticating
    /// any newly observed candidate, resetting the backoff on a successful
    /// round and backing off exponentially (`poll_interval_min` up to
    /// `poll_interval_max`) otherwise (spec.md §4.5 discovery loop).
    pub async fn run_discovery_loop(self: Arc<Self>) {
        loop {
            let snapshot = {
                let guard = self.active.read().await;
                guard.as_ref().map(|r| (r.realm_id, r.key.clone()))
            };
            let Some((realm_id, key)) = snapshot else {
                tokio::time::sleep(self.discovery_cfg.poll_interval_min.get()).await;
                continue;
            };
            let room = realm_id.discovery_key_hash();

            match self.discovery.fetch_peers(&room) {
                Ok(peers) => {
                    for peer in peers {
                        if peer.peer_id == self.local_peer_id {
                            continue;
                        }
                        if self.is_member(peer.peer_id).await {
                            continue;
                        }
                        if let Err(e) = self.authenticate_peer(realm_id, &key, peer.peer_id, peer.relay_addr).await {
                            tracing::debug!(peer_id = %peer.peer_id, "realm: membership auth failed: {e}");
                        }
                    }
                    *self.poll_backoff.lock().await = self.discovery_cfg.poll_interval_min.get();
                }
                Err(e) => {
                    tracing::debug!("realm: discovery poll failed: {e}");
                    let mut backoff = self.poll_backoff.lock().await;
                    *backoff = (*backoff * 2).min(self.discovery_cfg.poll_interval_max.get());
                }
            }

            let sleep_for = *self.poll_backoff.lock().await;
            tokio::time::sleep(sleep_for).await;
        }
    }

    /// Act as the initiating side of mutual membership authentication:
    /// open the realm's auth protocol, send our proof, and admit the peer
    /// only once its reply proof verifies and is correctly bound to us.
    async fn authenticate_peer(&self, realm_id: RealmId, key: &RealmKey, peer_id: PeerId, addr: Multiaddr) -> Result<(), P2pError> {
        let proto = protocol_ids::realm_auth(&realm_id.to_hex());
        self.transport.dial(&addr, AUTH_DEADLINE).await?;
        let mut stream = self.transport.open_stream(peer_id, &proto, AUTH_DEADLINE).await?;

        let outbound = MembershipProof::generate(key, self.local_peer_id, realm_id, peer_id, random_nonce(), unix_now());
        write_proof(&mut stream, &outbound).await?;
        let inbound = read_proof(&mut stream, realm_id).await?;

        self.verify_and_admit(inbound, key, peer_id, addr).await
    }

    /// Serve inbound auth requests forever: accept a proof, verify it,
    /// reply with our own, and admit the peer on success.
    pub async fn run_auth_responder(self: Arc<Self>) {
        loop {
            let realm_id = match self.current_realm_id().await {
                Some(id) => id,
                None => {
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    continue;
                }
            };
            let proto = protocol_ids::realm_auth(&realm_id.to_hex());
            let mut inbound_streams = match self.transport.accept_streams(&proto).await {
                Ok(rx) => rx,
                Err(e) => {
                    tracing::warn!("realm: failed to accept auth streams: {e}");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    continue;
                }
            };
            while let Some(inbound) = inbound_streams.recv().await {
                let manager = Arc::clone(&self);
                tokio::spawn(async move {
                    if let Err(e) = manager.handle_auth_inbound(inbound).await {
                        tracing::debug!("realm: inbound auth failed: {e}");
                    }
                });
            }
        }
    }

    async fn handle_auth_inbound(self: Arc<Self>, inbound: crate::transport::Inbound) -> Result<(), P2pError> {
        let mut stream = inbound.stream;
        let peer_id = inbound.peer_id;
        let realm_id = self.current_realm_id().await.ok_or_else(P2pError::not_member)?;

        let incoming = read_proof(&mut stream, realm_id).await?;
        let key = {
            let guard = self.active.read().await;
            guard.as_ref().filter(|r| r.realm_id == realm_id).map(|r| r.key.clone()).ok_or_else(P2pError::not_member)?
        };

        if incoming.sender != peer_id || incoming.target != self.local_peer_id {
            return Err(P2pError::permission_denied("membership proof sender/target mismatch"));
        }
        if !incoming.within_window(unix_now(), self.membership_cfg.proof_window.get()) || !incoming.verify_tag(&key) {
            return Err(P2pError::permission_denied("membership proof expired or failed HMAC verification"));
        }
        if !self.record_proof_fresh(&incoming).await {
            return Err(P2pError::permission_denied("membership proof replayed"));
        }

        let reply = MembershipProof::generate(&key, self.local_peer_id, realm_id, peer_id, random_nonce(), unix_now());
        write_proof(&mut stream, &reply).await?;

        self.admit(peer_id, realm_id, vec![]).await;
        Ok(())
    }

    async fn verify_and_admit(&self, proof: MembershipProof, key: &RealmKey, expected_peer: PeerId, addr: Multiaddr) -> Result<(), P2pError> {
        if proof.sender != expected_peer || proof.target != self.local_peer_id {
            return Err(P2pError::permission_denied("membership proof sender/target mismatch"));
        }
        if !proof.within_window(unix_now(), self.membership_cfg.proof_window.get()) {
            return Err(P2pError::permission_denied("membership proof outside the validity window"));
        }
        if !proof.verify_tag(key) {
            return Err(P2pError::permission_denied("membership proof failed HMAC verification"));
        }
        if !self.record_proof_fresh(&proof).await {
            return Err(P2pError::permission_denied("membership proof replayed"));
        }
        self.admit(expected_peer, proof.realm_id, vec![addr]).await;
        Ok(())
    }

    async fn admit(&self, peer_id: PeerId, realm_id: RealmId, addresses: Vec<Multiaddr>) {
        {
            let mut guard = self.active.write().await;
            if let Some(realm) = guard.as_mut().filter(|r| r.realm_id == realm_id) {
                realm.members.insert(
                    peer_id,
                    MemberRecord {
                        peer_id,
                        realm_id,
                        role: if self.security.infra_peers.contains(&peer_id) {
                            MemberRole::Infrastructure
                        } else {
                            MemberRole::Peer
                        },
                        last_seen: Instant::now(),
                        addresses,
                    },
                );
            }
        }
        self.events.publish(Topic::Realm, Event::MemberAdded { peer_id });
    }

    /// Rewrite a user-supplied application protocol id into the active
    /// realm's namespace, rejecting reserved (`/dep2p/sys/*`) ids and ids
    /// stamped with a different realm outright (spec.md §4.5 protocol-id
    /// rewriting shim).
    pub async fn rewrite_protocol(&self, user_proto: &str) -> Result<String, P2pError> {
        if user_proto.starts_with(protocol_ids::SYS_PREFIX) {
            return Err(P2pError::reserved_protocol(user_proto));
        }
        let realm_id = self.current_realm_id().await.ok_or_else(P2pError::not_member)?;
        if user_proto.starts_with(protocol_ids::APP_PREFIX) || user_proto.starts_with(protocol_ids::REALM_PREFIX) {
            let own_app_prefix = format!("{}{}/", protocol_ids::APP_PREFIX, realm_id.to_hex());
            let own_realm_prefix = format!("{}{}/", protocol_ids::REALM_PREFIX, realm_id.to_hex());
            if !user_proto.starts_with(&own_app_prefix) && !user_proto.starts_with(&own_realm_prefix) {
                return Err(P2pError::foreign_realm(user_proto));
            }
            return Ok(user_proto.to_owned());
        }
        Ok(protocol_ids::app_protocol(&realm_id.to_hex(), user_proto))
    }
}

fn random_nonce() -> [u8; 16] {
    let mut nonce = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut nonce);
    nonce
}

/// CBOR wire form of `MembershipProof` (`PeerId`/`RealmId` don't implement
/// `serde` themselves; this is the thin shim across that boundary, mirrors
/// `holepunch.rs`'s length-prefixed CBOR framing).
#[derive(serde::Serialize, serde::Deserialize)]
struct WireProof {
    sender: Vec<u8>,
    target: Vec<u8>,
    nonce: [u8; 16],
    timestamp: i64,
    tag: [u8; 32],
}

impl From<&MembershipProof> for WireProof {
    fn from(p: &MembershipProof) -> Self {
        Self {
            sender: p.sender.to_bytes(),
            target: p.target.to_bytes(),
            nonce: p.nonce,
            timestamp: p.timestamp,
            tag: p.tag,
        }
    }
}

impl WireProof {
    fn into_proof(self, realm_id: RealmId) -> Result<MembershipProof, P2pError> {
        let sender = PeerId::from_bytes(&self.sender).map_err(|e| P2pError::internal(format!("invalid sender in proof: {e}")))?;
        let target = PeerId::from_bytes(&self.target).map_err(|e| P2pError::internal(format!("invalid target in proof: {e}")))?;
        Ok(MembershipProof {
            sender,
            realm_id,
            target,
            nonce: self.nonce,
            timestamp: self.timestamp,
            tag: self.tag,
        })
    }
}

async fn write_proof<W: AsyncWrite + Unpin>(io: &mut W, proof: &MembershipProof) -> Result<(), P2pError> {
    let mut buf = Vec::new();
    ciborium::into_writer(&WireProof::from(proof), &mut buf).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
    io.write_all(&(buf.len() as u32).to_be_bytes()).await?;
    io.write_all(&buf).await?;
    io.flush().await?;
    Ok(())
}

async fn read_proof<R: AsyncRead + Unpin>(io: &mut R, realm_id: RealmId) -> Result<MembershipProof, P2pError> {
    let mut len_buf = [0u8; 4];
    io.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_PROOF_WIRE_LEN {
        return Err(P2pError::internal("membership proof too large"));
    }
    let mut buf = vec![0u8; len];
    io.read_exact(&mut buf).await?;
    let wire: WireProof = ciborium::from_reader(&buf[..]).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
    wire.into_proof(realm_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{discovery::memory::InMemoryDiscovery, transport::mock::MockNetwork};

    fn test_managers() -> (Arc<RealmManager>, Arc<RealmManager>, Arc<dyn Transport>, Arc<dyn Transport>) {
        let net = MockNetwork::new();
        let a_id = PeerId::random();
        let b_id = PeerId::random();
        let a_transport: Arc<dyn Transport> = net.transport(a_id);
        let b_transport: Arc<dyn Transport> = net.transport(b_id);
        let discovery: Arc<dyn DiscoveryProvider> = Arc::new(InMemoryDiscovery::new());

        let a = RealmManager::new(
            a_id,
            Arc::clone(&a_transport),
            Arc::clone(&discovery),
            EventBus::new(16),
            RealmMembershipConfig::default(),
            DiscoveryConfig::default(),
            SecurityConfig::default(),
        );
        let b = RealmManager::new(
            b_id,
            Arc::clone(&b_transport),
            discovery,
            EventBus::new(16),
            RealmMembershipConfig::default(),
            DiscoveryConfig::default(),
            SecurityConfig::default(),
        );
        (a, b, a_transport, b_transport)
    }

    #[tokio::test]
    async fn second_join_is_rejected() {
        let (a, _b, _ta, _tb) = test_managers();
        let key = RealmKey::generate();
        let addr: Multiaddr = "/ip4/10.0.0.1/tcp/1".parse().unwrap();
        a.join(key.clone(), addr.clone()).await.unwrap();
        let err = a.join(key, addr).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::AlreadyInRealm);
    }

    #[tokio::test]
    async fn mutual_auth_admits_both_sides() {
        let (a, b, _ta, _tb) = test_managers();
        let key = RealmKey::generate();
        let b_addr: Multiaddr = "/ip4/10.0.0.2/tcp/1".parse().unwrap();
        let a_addr: Multiaddr = "/ip4/10.0.0.1/tcp/1".parse().unwrap();
        let realm_id = a.join(key.clone(), a_addr).await.unwrap();
        b.join(key.clone(), b_addr.clone()).await.unwrap();

        let b_peer_id = b.local_peer_id;
        tokio::spawn(Arc::clone(&b).run_auth_responder());
        tokio::time::sleep(Duration::from_millis(20)).await;

        a.authenticate_peer(realm_id, &key, b_peer_id, b_addr).await.unwrap();
        assert!(a.is_member(b_peer_id).await);
    }

    #[tokio::test]
    async fn rewrite_protocol_rejects_reserved_and_foreign_ids() {
        let (a, _b, _ta, _tb) = test_managers();
        let key = RealmKey::generate();
        let addr: Multiaddr = "/ip4/10.0.0.1/tcp/1".parse().unwrap();
        a.join(key, addr).await.unwrap();

        let err = a.rewrite_protocol(protocol_ids::PING).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::ReservedProtocol);

        let err = a.rewrite_protocol("/dep2p/app/cafebabe/chat").await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::ForeignRealm);

        let rewritten = a.rewrite_protocol("chat").await.unwrap();
        assert!(rewritten.starts_with(protocol_ids::APP_PREFIX));
    }

    #[tokio::test]
    async fn replayed_proof_is_rejected_even_with_a_valid_tag() {
        let (a, b, _ta, _tb) = test_managers();
        let key = RealmKey::generate();
        let b_addr: Multiaddr = "/ip4/10.0.0.2/tcp/1".parse().unwrap();
        let a_addr: Multiaddr = "/ip4/10.0.0.1/tcp/1".parse().unwrap();
        let realm_id = a.join(key.clone(), a_addr.clone()).await.unwrap();
        b.join(key.clone(), b_addr).await.unwrap();

        let proof = MembershipProof::generate(&key, a.local_peer_id, realm_id, b.local_peer_id, [7u8; 16], unix_now());

        b.verify_and_admit(proof.clone(), &key, a.local_peer_id, a_addr.clone()).await.unwrap();
        assert!(b.is_member(a.local_peer_id).await);

        let err = b.verify_and_admit(proof, &key, a.local_peer_id, a_addr).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::PermissionDenied);
    }
}
