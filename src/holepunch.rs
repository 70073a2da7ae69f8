//! Hole-Punch Coordinator (spec.md §4.3): DCUtR-style address exchange over
//! an already-established relay circuit, followed by a synchronized
//! simultaneous dial.
//!
//! Runs over TCP rather than a dedicated QUIC/UDP socket (this crate's
//! transport stack is deliberately TCP+Noise+Yamux, see `transport/mod.rs`),
//! so "simultaneous dial from the shared listen socket" here means racing
//! `Transport::dial` against each of the peer's `ShareableAddrs` — TCP
//! simultaneous-open exploits the same cone-NAT port-reuse behavior the
//! spec describes for UDP, without requiring a second transport stack.

use std::{io, time::Duration};

use futures::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    future::select_ok,
};
use libp2p::{Multiaddr, PeerId};
use serde::{Deserialize, Serialize};

use crate::{
    config::PathHealthConfig,
    error::P2pError,
    transport::{BoxedStream, Transport},
};

const MAX_MESSAGE_LEN: usize = 16 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Responder,
}

#[derive(Debug, Clone)]
pub struct PunchOutcome {
    pub peer_id: PeerId,
    pub won_address: Multiaddr,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
enum WireMessage {
    Connect { addrs: Vec<String> },
    ConnectBack { addrs: Vec<String>, sync_unix_nanos: i64 },
}

async fn write_message<W: AsyncWrite + Unpin>(io: &mut W, msg: &WireMessage) -> io::Result<()> {
    let mut buf = Vec::new();
    ciborium::into_writer(msg, &mut buf).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
    if buf.len() > MAX_MESSAGE_LEN {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "holepunch message too large"));
    }
    io.write_all(&(buf.len() as u32).to_be_bytes()).await?;
    io.write_all(&buf).await?;
    io.flush().await
}

async fn read_message<R: AsyncRead + Unpin>(io: &mut R) -> io::Result<WireMessage> {
    let mut len_buf = [0u8; 4];
    io.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_MESSAGE_LEN {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "holepunch message too large"));
    }
    let mut buf = vec![0u8; len];
    io.read_exact(&mut buf).await?;
    ciborium::from_reader(&buf[..]).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))
}

fn to_strings(addrs: &[Multiaddr]) -> Vec<String> {
    addrs.iter().map(|a| a.to_string()).collect()
}

fn from_strings(addrs: &[String]) -> Vec<Multiaddr> {
    addrs
        .iter()
        .filter_map(|s| match s.parse() {
            Ok(a) => Some(a),
            Err(e) => {
                tracing::debug!("holepunch: dropping unparseable peer address '{s}': {e}");
                None
            }
        })
        .collect()
}

fn unix_nanos_now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("system clock before epoch")
        .as_nanos() as i64
}

fn backoff_with_jitter(attempt: u32, base: Duration, jitter_pct: f64) -> Duration {
    let nominal = base.saturating_mul(1 << attempt);
    let jitter_span = nominal.as_secs_f64() * jitter_pct;
    let jitter = jitter_span * (rand::random::<f64>() * 2.0 - 1.0);
    Duration::from_secs_f64((nominal.as_secs_f64() + jitter).max(0.0))
}

/// Given external-port observations for a peer across several STUN/witness
/// reports (oldest first), guess the next port a symmetric NAT will
/// allocate from the observed delta. Returns `None` with fewer than two
/// observations or a non-constant delta (optional enrichment, spec.md §4.3
/// "Symmetric NAT predicted-port extension").
pub fn predict_next_port(observed_ports: &[u16]) -> Option<u16> {
    if observed_ports.len() < 2 {
        return None;
    }
    let deltas: Vec<i32> = observed_ports.windows(2).map(|w| w[1] as i32 - w[0] as i32).collect();
    let first = deltas[0];
    if first == 0 || !deltas.iter().all(|d| *d == first) {
        return None;
    }
    let last = *observed_ports.last().unwrap() as i32;
    let predicted = last + first;
    (0..=u16::MAX as i32).contains(&predicted).then_some(predicted as u16)
}

/// Runs the signaling exchange and simultaneous-dial race over a relay
/// circuit stream. Stateless beyond the `Transport` handle it dials
/// through — the circuit, retry budget, and target identity are all
/// supplied per call.
pub struct HolePunchCoordinator {
    transport: std::sync::Arc<dyn Transport>,
    config: PathHealthConfig,
}

impl HolePunchCoordinator {
    pub fn new(transport: std::sync::Arc<dyn Transport>, config: PathHealthConfig) -> Self {
        Self { transport, config }
    }

    /// Run as the side that requested the circuit. `shareable_addrs` MUST
    /// already be filtered to priority ≥ 50 (never raw listen addresses —
    /// spec.md §4.3 "a previous revision used listen addresses, causing
    /// 100% failure behind NAT"); callers typically pass
    /// `Peerstore::publishable_addresses`'s output directly.
    ///
    /// `circuit` is borrowed, not consumed: per spec.md §4.2 "backup-path
    /// policy", a circuit that survives a failed or successful hole-punch
    /// must stay open for the caller to keep or fall back to.
    pub async fn initiate(&self, target: PeerId, circuit: &mut BoxedStream, shareable_addrs: Vec<Multiaddr>) -> Result<PunchOutcome, P2pError> {
        let attempts = self.config.holepunch_attempts.max(1);
        let mut last_err = P2pError::no_path(target);
        for attempt in 0..attempts {
            match self.attempt(Role::Initiator, target, circuit, &shareable_addrs).await {
                Ok(outcome) => return Ok(outcome),
                Err(e) => {
                    last_err = e;
                    if attempt + 1 < attempts {
                        let delay = backoff_with_jitter(attempt, self.config.holepunch_backoff_base.get(), self.config.holepunch_jitter_pct);
                        tracing::debug!("holepunch: attempt {} with {target} failed: {}, retrying in {delay:?}", attempt + 1, last_err);
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }
        Err(last_err)
    }

    /// Run as the side answering an inbound `Connect` on the
    /// `/dep2p/sys/holepunch/1.0.0` stream opened over a relay circuit the
    /// other side already holds a reservation through. A single attempt —
    /// retries are the initiator's responsibility.
    pub async fn respond(&self, initiator: PeerId, circuit: &mut BoxedStream, shareable_addrs: Vec<Multiaddr>) -> Result<PunchOutcome, P2pError> {
        self.attempt(Role::Responder, initiator, circuit, &shareable_addrs).await
    }

    async fn attempt(&self, role: Role, peer: PeerId, circuit: &mut BoxedStream, local_addrs: &[Multiaddr]) -> Result<PunchOutcome, P2pError> {
        let peer_addrs = match role {
            Role::Initiator => {
                write_message(circuit, &WireMessage::Connect { addrs: to_strings(local_addrs) }).await?;
                match read_message(circuit).await? {
                    WireMessage::ConnectBack { addrs, sync_unix_nanos } => {
                        let now = unix_nanos_now();
                        let half_rtt_nanos = (now - sync_unix_nanos).max(0) / 2;
                        tokio::time::sleep(Duration::from_nanos(half_rtt_nanos as u64)).await;
                        from_strings(&addrs)
                    }
                    other => return Err(P2pError::internal(format!("expected ConnectBack, got {other:?}"))),
                }
            }
            Role::Responder => {
                let addrs = match read_message(circuit).await? {
                    WireMessage::Connect { addrs } => addrs,
                    other => return Err(P2pError::internal(format!("expected Connect, got {other:?}"))),
                };
                write_message(
                    circuit,
                    &WireMessage::ConnectBack {
                        addrs: to_strings(local_addrs),
                        sync_unix_nanos: unix_nanos_now(),
                    },
                )
                .await?;
                from_strings(&addrs)
            }
        };

        if peer_addrs.is_empty() {
            return Err(P2pError::no_path(peer));
        }

        let dial_timeout = Duration::from_secs(5);
        let races = peer_addrs.into_iter().map(|addr| {
            let transport = std::sync::Arc::clone(&self.transport);
            Box::pin(async move {
                let dialed = transport.dial(&addr, dial_timeout).await?;
                Ok::<_, P2pError>((dialed, addr))
            }) as std::pin::Pin<Box<dyn std::future::Future<Output = Result<(PeerId, Multiaddr), P2pError>> + Send>>
        });

        match select_ok(races).await {
            Ok(((dialed_peer, won_address), _remaining)) if dialed_peer == peer => Ok(PunchOutcome { peer_id: peer, won_address }),
            Ok(((dialed_peer, _), _)) => Err(P2pError::with_peer(
                crate::error::ErrorKind::NoPath,
                peer,
                format!("simultaneous dial reached unexpected peer {dialed_peer}"),
            )),
            Err(_) => Err(P2pError::no_path(peer)),
        }
    }
}
