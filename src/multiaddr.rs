//! Multiaddress classification helpers.
//!
//! Parsing itself is `libp2p::Multiaddr`'s job (strict by construction —
//! unknown protocol components fail to parse). This module adds the
//! semantic checks the reachability engine and discovery publication filter
//! need on top of a parsed address: private/loopback/link-local detection,
//! relay-peer extraction, and circuit-address construction.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use libp2p::{multiaddr::Protocol, Multiaddr, PeerId};

/// True if `addr` resolves to a loopback, private, or link-local IP.
///
/// Used by the publication filter (spec §4.1): private addresses are never
/// advertised externally unless the operator opts in with
/// `AllowPrivateAddrs=true`.
pub fn is_private(addr: &Multiaddr) -> bool {
    addr.iter().any(|p| match p {
        Protocol::Ip4(ip) => is_private_v4(ip),
        Protocol::Ip6(ip) => is_private_v6(ip),
        _ => false,
    })
}

fn is_private_v4(ip: Ipv4Addr) -> bool {
    ip.is_loopback() || ip.is_private() || ip.is_link_local() || ip.is_unspecified()
}

fn is_private_v6(ip: Ipv6Addr) -> bool {
    ip.is_loopback() || ip.is_unspecified() || (ip.segments()[0] & 0xfe00) == 0xfc00
}

/// Extract the `PeerId` component of a plain `/.../p2p/<id>` address, i.e.
/// the identity the transport dials, not a relay hop.
pub fn peer_id_of(addr: &Multiaddr) -> Option<PeerId> {
    addr.iter().find_map(|p| match p {
        Protocol::P2p(mh) => PeerId::from_multihash(mh.into()).ok(),
        _ => None,
    })
}

/// True if `addr` is a `p2p-circuit` relay address
/// (`<relay-addr>/p2p-circuit/p2p/<target>`).
pub fn is_circuit_addr(addr: &Multiaddr) -> bool {
    addr.iter().any(|p| matches!(p, Protocol::P2pCircuit))
}

/// Extract the relay server's `PeerId` from a circuit address: the `/p2p`
/// component immediately preceding `/p2p-circuit`.
pub fn relay_peer_of_circuit(addr: &Multiaddr) -> Option<PeerId> {
    let mut last_peer = None;
    for proto in addr.iter() {
        match proto {
            Protocol::P2pCircuit => return last_peer,
            Protocol::P2p(mh) => last_peer = PeerId::from_multihash(mh.into()).ok(),
            _ => {}
        }
    }
    None
}

/// Build `<relay-addr>/p2p-circuit/p2p/<target>`.
pub fn circuit_addr(relay_addr: &Multiaddr, target: PeerId) -> Multiaddr {
    let mut a = relay_addr.clone();
    a.push(Protocol::P2pCircuit);
    a.push(Protocol::P2p(target.into()));
    a
}

/// Strip a trailing `/p2p/<id>` component, returning the bare transport
/// address used for dialing (`Transport::dial` takes the transport address;
/// the expected identity is verified separately after the handshake).
pub fn strip_peer_id(addr: &Multiaddr) -> Multiaddr {
    let mut a = addr.clone();
    if matches!(a.iter().last(), Some(Protocol::P2p(_))) {
        a.pop();
    }
    a
}

/// Loopback-only convenience used by reachability's private-address check
/// and by tests that want a plain IP comparison without a full multiaddr.
pub fn ip_is_loopback(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_loopback(),
        IpAddr::V6(v6) => v6.is_loopback(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> Multiaddr {
        s.parse().unwrap()
    }

    #[test]
    fn detects_private_v4() {
        assert!(is_private(&addr("/ip4/192.168.1.5/udp/4001/quic-v1")));
        assert!(is_private(&addr("/ip4/127.0.0.1/tcp/4001")));
        assert!(!is_private(&addr("/ip4/203.0.113.5/udp/4001/quic-v1")));
    }

    #[test]
    fn circuit_roundtrip() {
        let relay: PeerId = PeerId::random();
        let target: PeerId = PeerId::random();
        let relay_addr = addr("/ip4/10.0.0.1/tcp/4001").with(Protocol::P2p(relay.into()));
        let c = circuit_addr(&relay_addr, target);
        assert!(is_circuit_addr(&c));
        assert_eq!(relay_peer_of_circuit(&c), Some(relay));
        assert_eq!(peer_id_of(&c), Some(target));
    }

    #[test]
    fn strip_peer_id_removes_trailing_p2p() {
        let pid = PeerId::random();
        let a = addr("/ip4/1.2.3.4/tcp/4001").with(Protocol::P2p(pid.into()));
        let stripped = strip_peer_id(&a);
        assert_eq!(stripped, addr("/ip4/1.2.3.4/tcp/4001"));
    }
}
