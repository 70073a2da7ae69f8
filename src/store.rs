//! Persisted key/value storage seam.
//!
//! Persistent storage is explicitly out of scope for the core — a real
//! deployment plugs in sled, rocksdb, or similar — but the core owns the
//! seam and the key-prefixing convention, mirroring how the teacher treats
//! `DiscoveryProvider` as a trait the host supplies a backend for.
//! Components store opaque byte records; the format of a given record is
//! that component's business.

use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex},
};

use async_trait::async_trait;

use crate::error::P2pError;

/// Component key prefixes used by `Store::get`/`put`/`delete`.
pub mod prefix {
    pub const IDENTITY: &str = "identity";
    pub const PEERSTORE: &str = "peerstore";
    pub const RESERVATION: &str = "reservation";
    pub const MEMBER: &str = "member";
}

/// Backend-agnostic persistence seam. Keys are opaque strings conventionally
/// namespaced `"<prefix>/<id>"`; values are opaque bytes.
#[async_trait]
pub trait Store: Send + Sync + 'static {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, P2pError>;
    async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), P2pError>;
    async fn delete(&self, key: &str) -> Result<(), P2pError>;
    /// List keys under a prefix (e.g. all peerstore entries).
    async fn list_prefix(&self, prefix: &str) -> Result<Vec<String>, P2pError>;
}

/// In-memory `Store` — zero dependencies, suitable for tests and any
/// deployment that accepts losing state on restart.
#[derive(Debug, Clone, Default)]
pub struct InMemoryStore {
    inner: Arc<Mutex<BTreeMap<String, Vec<u8>>>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, P2pError> {
        Ok(self.inner.lock().unwrap().get(key).cloned())
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), P2pError> {
        self.inner.lock().unwrap().insert(key.to_owned(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), P2pError> {
        self.inner.lock().unwrap().remove(key);
        Ok(())
    }

    async fn list_prefix(&self, prefix: &str) -> Result<Vec<String>, P2pError> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .range(prefix.to_owned()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect())
    }
}
