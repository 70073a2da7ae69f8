pub mod config;
pub mod connmgr;
pub mod dial;
pub mod disconnect;
pub mod discovery;
pub mod error;
pub mod events;
pub mod holepunch;
pub mod identity;
pub mod log_layer;
pub mod multiaddr;
pub mod node;
pub mod peerstore;
pub mod protocol;
pub mod protocol_ids;
pub mod reachability;
pub mod realm;
pub mod relay;
pub mod store;
pub mod stun;

pub mod transport;

pub use config::{Config, RelayConfig};
pub use error::P2pError;
pub use protocol::types::LogEntry;
