//! Local node identity: keypair persistence and `PeerId` helpers.
//!
//! `PeerId` is reused directly from `libp2p` rather than reinvented: it is
//! already a multihash of the marshaled public key, which is exactly the
//! spec's PeerID definition, and reusing it keeps multiaddr text forms
//! bit-exact with the rest of the libp2p ecosystem.

use std::{fs, path::Path};

use libp2p::{identity, PeerId};

use crate::error::P2pError;

/// Load a persisted `identity::Keypair` from `path`, or generate a new one
/// and write it to `path` in protobuf encoding.
///
/// # Key format
/// Keys are stored protobuf-encoded (libp2p standard). An unknown or
/// corrupt file is never silently rotated — a node whose identity changes
/// out from under it breaks every peer that dialed it by PeerID, and breaks
/// realm membership records keyed by PeerID. The operator must delete the
/// file explicitly to accept a new identity.
pub fn load_or_create_keypair(path: &Path) -> Result<identity::Keypair, P2pError> {
    if path.exists() {
        let raw = fs::read(path).map_err(|e| P2pError::internal(format!("read keypair: {e}")))?;
        return identity::Keypair::from_protobuf_encoding(&raw).map_err(|e| {
            P2pError::internal(format!(
                "keypair file '{}' ({} bytes) is not valid protobuf: {e}. \
                 Delete it to generate a fresh identity.",
                path.display(),
                raw.len()
            ))
        });
    }

    let key = identity::Keypair::generate_ed25519();
    let raw = key
        .to_protobuf_encoding()
        .map_err(|e| P2pError::internal(format!("encode keypair: {e}")))?;
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| P2pError::internal(format!("mkdir: {e}")))?;
    }
    fs::write(path, &raw).map_err(|e| P2pError::internal(format!("write keypair: {e}")))?;
    tracing::info!("Generated new identity at {}", path.display());
    Ok(key)
}

/// Parse a base58btc-encoded `PeerId` string, the textual encoding used
/// throughout multiaddr `/p2p/<peer-id>` components.
pub fn parse_peer_id(s: &str) -> Result<PeerId, P2pError> {
    s.parse()
        .map_err(|_| P2pError::internal(format!("'{s}' is not a valid peer id")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("identity.key");

        let k1 = load_or_create_keypair(&path).unwrap();
        let k2 = load_or_create_keypair(&path).unwrap();
        assert_eq!(PeerId::from(k1.public()), PeerId::from(k2.public()));
    }

    #[test]
    fn rejects_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("identity.key");
        fs::write(&path, b"not a protobuf keypair").unwrap();
        assert!(load_or_create_keypair(&path).is_err());
    }

    #[test]
    fn peer_id_roundtrips_through_text() {
        let key = identity::Keypair::generate_ed25519();
        let pid = PeerId::from(key.public());
        assert_eq!(parse_peer_id(&pid.to_string()).unwrap(), pid);
    }
}
