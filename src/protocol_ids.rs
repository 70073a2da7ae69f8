//! Stable protocol-id string constants (spec.md §6).
//!
//! Collected in one place because the realm manager's protocol-ID rewriting
//! shim treats the `/dep2p/sys/*` prefix as reserved and every other module
//! needs to agree on the exact strings that prefix covers.

pub const PING: &str = "/dep2p/sys/ping/1.0.0";
pub const IDENTIFY: &str = "/dep2p/sys/identify/1.0.0";
pub const HOLEPUNCH: &str = "/dep2p/sys/holepunch/1.0.0";
pub const RELAY: &str = "/dep2p/sys/relay/1.0.0";
pub const KAD: &str = "/dep2p/sys/kad/1.0.0";

/// Not one of the spec's enumerated stable IDs, but used under the same
/// `/dep2p/sys/` prefix for the reachability engine's optional dial-back
/// verification enhancement (spec.md §4.1).
pub const DIALBACK: &str = "/dep2p/sys/dialback/1.0.0";

pub const SYS_PREFIX: &str = "/dep2p/sys/";

/// Templated realm protocol ids (spec.md §6).
pub fn realm_auth(realm_id_hex: &str) -> String {
    format!("/dep2p/realm/{realm_id_hex}/auth/1.0.0")
}

pub fn realm_sync(realm_id_hex: &str) -> String {
    format!("/dep2p/realm/{realm_id_hex}/sync/1.0.0")
}

pub const REALM_PREFIX: &str = "/dep2p/realm/";
pub const APP_PREFIX: &str = "/dep2p/app/";

/// Rewrite a user-supplied protocol id into the active realm's application
/// namespace.
pub fn app_protocol(realm_id_hex: &str, user_proto: &str) -> String {
    format!("{APP_PREFIX}{realm_id_hex}/{}", user_proto.trim_start_matches('/'))
}
