//! Hierarchical configuration surface.
//!
//! A single `Config` tree, loadable from JSON or built in memory, with named
//! presets (`mobile`, `desktop`, `server`, `minimal`). Every duration field
//! uses [`ConfigDuration`], which accepts either a humantime string
//! (`"30s"`, `"1h"`) or a raw nanosecond integer on deserialization and
//! always serializes back out as a string — this resolves the "two duration
//! styles" ambiguity called out as an open question: durations are
//! string-first, nanosecond-compatible, everywhere.
//!
//! This struct is the data model the core consumes; loading it from a file,
//! watching it for changes, or layering env-var/CLI overrides on top is a
//! host-binary concern.

use std::{collections::HashSet, path::PathBuf, time::Duration};

use libp2p::{Multiaddr, PeerId};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::P2pError;

// ── Duration newtype ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ConfigDuration(pub Duration);

impl ConfigDuration {
    pub const fn from_secs(s: u64) -> Self {
        Self(Duration::from_secs(s))
    }

    pub const fn from_millis(ms: u64) -> Self {
        Self(Duration::from_millis(ms))
    }

    pub fn get(self) -> Duration {
        self.0
    }
}

impl From<Duration> for ConfigDuration {
    fn from(d: Duration) -> Self {
        Self(d)
    }
}

impl From<ConfigDuration> for Duration {
    fn from(d: ConfigDuration) -> Self {
        d.0
    }
}

impl Serialize for ConfigDuration {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&humantime::format_duration(self.0).to_string())
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum DurationRepr {
    Text(String),
    Nanos(u64),
}

impl<'de> Deserialize<'de> for ConfigDuration {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        match DurationRepr::deserialize(d)? {
            DurationRepr::Text(s) => humantime::parse_duration(&s)
                .map(ConfigDuration)
                .map_err(serde::de::Error::custom),
            DurationRepr::Nanos(n) => Ok(ConfigDuration(Duration::from_nanos(n))),
        }
    }
}

// ── Sections ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// Path to persist the node's keypair. `None` generates an ephemeral key.
    pub keypair_path: Option<PathBuf>,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self { keypair_path: None }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub listen_addrs: Vec<Multiaddr>,
    pub dial_timeout: ConfigDuration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            listen_addrs: vec!["/ip4/0.0.0.0/tcp/0".parse().unwrap()],
            dial_timeout: ConfigDuration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    /// Infrastructure peers (bootstrap/relay operators) exempt from realm
    /// membership checks.
    pub infra_peers: HashSet<PeerId>,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            infra_peers: HashSet::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NatConfig {
    pub stun_servers: Vec<String>,
    /// Number of STUN servers probed in the initial parallel round.
    pub stun_initial_fanout: usize,
    pub stun_initial_timeout: ConfigDuration,
    /// Number of STUN servers probed in the fallback round if all initial
    /// probes fail.
    pub stun_fallback_fanout: usize,
    pub stun_fallback_timeout: ConfigDuration,
    /// Promote STUN-discovered addresses straight to priority 100
    /// (dial-back verified) instead of 75.
    pub trust_stun_addresses: bool,
    pub allow_private_addrs: bool,
    /// Witness quorum size for address verification (distinct from the
    /// disconnect-detection witness quorum in `MembershipConfig`).
    pub witness_quorum: usize,
}

impl Default for NatConfig {
    fn default() -> Self {
        Self {
            stun_servers: vec![
                "stun.l.google.com:19302".into(),
                "stun1.l.google.com:19302".into(),
                "stun2.l.google.com:19302".into(),
                "stun.cloudflare.com:3478".into(),
                "stun.nextcloud.com:443".into(),
            ],
            stun_initial_fanout: 5,
            stun_initial_timeout: ConfigDuration::from_secs(5),
            stun_fallback_fanout: 2,
            stun_fallback_timeout: ConfigDuration::from_secs(8),
            trust_stun_addresses: false,
            allow_private_addrs: false,
            witness_quorum: 2,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Whether this node runs relay server roles (requires a public address).
    pub server_enabled: bool,
    pub reservation_ttl: ConfigDuration,
    pub reservation_refresh_interval: ConfigDuration,
    pub max_reservations: usize,
    pub max_circuits: usize,
    pub circuit_buffer_bytes: usize,
    pub system_relay_bandwidth_bps: u64,
    pub system_relay_max_duration: ConfigDuration,
    /// Minimum accepted TTL a client may request on Reserve.
    pub min_reservation_ttl: ConfigDuration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            server_enabled: false,
            reservation_ttl: ConfigDuration::from_secs(3600),
            reservation_refresh_interval: ConfigDuration::from_secs(1800),
            max_reservations: 128,
            max_circuits: 16,
            circuit_buffer_bytes: 2048,
            system_relay_bandwidth_bps: 10 * 1024,
            system_relay_max_duration: ConfigDuration::from_secs(60),
            min_reservation_ttl: ConfigDuration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    pub poll_interval_min: ConfigDuration,
    pub poll_interval_max: ConfigDuration,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            poll_interval_min: ConfigDuration::from_secs(2),
            poll_interval_max: ConfigDuration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnMgrConfig {
    pub low_water: usize,
    pub high_water: usize,
    pub grace_period: ConfigDuration,
    pub decay_interval: ConfigDuration,
}

impl Default for ConnMgrConfig {
    fn default() -> Self {
        Self {
            low_water: 100,
            high_water: 400,
            grace_period: ConfigDuration::from_secs(20),
            decay_interval: ConfigDuration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct MessagingConfig {
    pub event_bus_subscription_buffer: usize,
}

impl Default for MessagingConfig {
    fn default() -> Self {
        Self {
            event_bus_subscription_buffer: 16,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct RealmMembershipConfig {
    pub proof_window: ConfigDuration,
    pub replay_cache_capacity: usize,
    pub fast_path_threshold: usize,
    pub witness_confirmation_window: ConfigDuration,
    pub reconnect_grace_period: ConfigDuration,
    pub disconnect_protection: ConfigDuration,
    pub oscillation_window: ConfigDuration,
    pub oscillation_threshold: u32,
}

impl Default for RealmMembershipConfig {
    fn default() -> Self {
        Self {
            proof_window: ConfigDuration::from_secs(30),
            replay_cache_capacity: 4096,
            fast_path_threshold: 10,
            witness_confirmation_window: ConfigDuration::from_secs(2),
            reconnect_grace_period: ConfigDuration::from_secs(15),
            disconnect_protection: ConfigDuration::from_secs(30),
            oscillation_window: ConfigDuration::from_secs(60),
            oscillation_threshold: 3,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceConfig {
    pub max_inbound_streams_per_peer: usize,
}

impl Default for ResourceConfig {
    fn default() -> Self {
        Self {
            max_inbound_streams_per_peer: 256,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub path: Option<PathBuf>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self { path: None }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct BandwidthConfig {
    pub realm_relay_bandwidth_bps: u64,
}

impl Default for BandwidthConfig {
    fn default() -> Self {
        Self {
            realm_relay_bandwidth_bps: 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct PathHealthConfig {
    pub holepunch_attempts: u32,
    pub holepunch_backoff_base: ConfigDuration,
    pub holepunch_jitter_pct: f64,
}

impl Default for PathHealthConfig {
    fn default() -> Self {
        Self {
            holepunch_attempts: 3,
            holepunch_backoff_base: ConfigDuration::from_secs(5),
            holepunch_jitter_pct: 0.20,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    pub reconnect_backoff_min: ConfigDuration,
    pub reconnect_backoff_max: ConfigDuration,
    pub reconnect_backoff_factor: f64,
    pub reconnect_backoff_jitter_pct: f64,
    pub reconnect_max_attempts: u32,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            reconnect_backoff_min: ConfigDuration::from_secs(1),
            reconnect_backoff_max: ConfigDuration::from_secs(30),
            reconnect_backoff_factor: 2.0,
            reconnect_backoff_jitter_pct: 0.20,
            reconnect_max_attempts: 5,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionHealthConfig {
    pub idle_timeout: ConfigDuration,
    pub ping_interval: ConfigDuration,
}

impl Default for ConnectionHealthConfig {
    fn default() -> Self {
        Self {
            idle_timeout: ConfigDuration::from_secs(30),
            ping_interval: ConfigDuration::from_secs(15),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct DiagnosticsConfig {
    pub log_level: LogLevel,
}

impl Default for DiagnosticsConfig {
    fn default() -> Self {
        Self {
            log_level: LogLevel::Info,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

// ── Top-level config ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub identity: IdentityConfig,
    pub transport: TransportConfig,
    pub security: SecurityConfig,
    pub nat: NatConfig,
    pub relay: RelayConfig,
    pub discovery: DiscoveryConfig,
    pub conn_mgr: ConnMgrConfig,
    pub messaging: MessagingConfig,
    pub realm: RealmMembershipConfig,
    pub resource: ResourceConfig,
    pub storage: StorageConfig,
    pub bandwidth: BandwidthConfig,
    pub path_health: PathHealthConfig,
    pub recovery: RecoveryConfig,
    pub connection_health: ConnectionHealthConfig,
    pub diagnostics: DiagnosticsConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            identity: IdentityConfig::default(),
            transport: TransportConfig::default(),
            security: SecurityConfig::default(),
            nat: NatConfig::default(),
            relay: RelayConfig::default(),
            discovery: DiscoveryConfig::default(),
            conn_mgr: ConnMgrConfig::default(),
            messaging: MessagingConfig::default(),
            realm: RealmMembershipConfig::default(),
            resource: ResourceConfig::default(),
            storage: StorageConfig::default(),
            bandwidth: BandwidthConfig::default(),
            path_health: PathHealthConfig::default(),
            recovery: RecoveryConfig::default(),
            connection_health: ConnectionHealthConfig::default(),
            diagnostics: DiagnosticsConfig::default(),
        }
    }
}

impl Config {
    pub fn from_json(s: &str) -> Result<Self, P2pError> {
        serde_json::from_str(s).map_err(|e| P2pError::internal(format!("invalid config json: {e}")))
    }

    pub fn to_json(&self) -> Result<String, P2pError> {
        serde_json::to_string_pretty(self)
            .map_err(|e| P2pError::internal(format!("failed to serialize config: {e}")))
    }

    /// Validate cross-field invariants that a bare `Deserialize` can't express.
    pub fn validate(&self) -> Result<(), P2pError> {
        if self.conn_mgr.low_water > self.conn_mgr.high_water {
            return Err(P2pError::internal("conn_mgr.low_water must be <= high_water"));
        }
        if self.relay.min_reservation_ttl.get() > self.relay.reservation_ttl.get() {
            return Err(P2pError::internal(
                "relay.min_reservation_ttl must be <= relay.reservation_ttl",
            ));
        }
        if self.nat.stun_initial_fanout == 0 {
            return Err(P2pError::internal("nat.stun_initial_fanout must be >= 1"));
        }
        Ok(())
    }

    /// QUIC-only, no server roles, low limits.
    pub fn preset_mobile() -> Self {
        let mut c = Self::default();
        c.relay.server_enabled = false;
        c.conn_mgr.low_water = 20;
        c.conn_mgr.high_water = 60;
        c.connection_health.idle_timeout = ConfigDuration::from_secs(60);
        c.discovery.poll_interval_min = ConfigDuration::from_secs(5);
        c
    }

    /// The default snapshot — balanced limits, no server roles.
    pub fn preset_desktop() -> Self {
        Self::default()
    }

    /// All protocols, relay server on, high limits.
    pub fn preset_server() -> Self {
        let mut c = Self::default();
        c.relay.server_enabled = true;
        c.conn_mgr.low_water = 200;
        c.conn_mgr.high_water = 2000;
        c.relay.max_reservations = 1024;
        c.relay.max_circuits = 256;
        c.nat.allow_private_addrs = false;
        c
    }

    /// Minimal local-discovery-only footprint, minimal resources.
    pub fn preset_minimal() -> Self {
        let mut c = Self::default();
        c.conn_mgr.low_water = 5;
        c.conn_mgr.high_water = 20;
        c.relay.max_reservations = 4;
        c.relay.max_circuits = 4;
        c
    }

    pub fn preset(name: &str) -> Result<Self, P2pError> {
        match name {
            "mobile" => Ok(Self::preset_mobile()),
            "desktop" => Ok(Self::preset_desktop()),
            "server" => Ok(Self::preset_server()),
            "minimal" => Ok(Self::preset_minimal()),
            other => Err(P2pError::internal(format!("unknown config preset '{other}'"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_roundtrip_preserves_validity() {
        for preset in ["mobile", "desktop", "server", "minimal"] {
            let cfg = Config::preset(preset).unwrap();
            let json = cfg.to_json().unwrap();
            let back = Config::from_json(&json).unwrap();
            back.validate().unwrap();
            assert_eq!(back.conn_mgr.low_water, cfg.conn_mgr.low_water);
        }
    }

    #[test]
    fn duration_accepts_string_and_nanos() {
        #[derive(Deserialize)]
        struct Wrap {
            d: ConfigDuration,
        }
        let from_str: Wrap = serde_json::from_str(r#"{"d":"30s"}"#).unwrap();
        assert_eq!(from_str.d.get(), Duration::from_secs(30));

        let from_nanos: Wrap = serde_json::from_str(r#"{"d":30000000000}"#).unwrap();
        assert_eq!(from_nanos.d.get(), Duration::from_secs(30));
    }

    #[test]
    fn validate_rejects_inverted_watermarks() {
        let mut cfg = Config::default();
        cfg.conn_mgr.low_water = 500;
        cfg.conn_mgr.high_water = 100;
        assert!(cfg.validate().is_err());
    }
}
