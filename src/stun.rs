//! Minimal STUN (RFC 5389) binding-request client: just enough to read back
//! our own server-reflexive address from a public STUN server.
//!
//! Hand-rolled rather than pulled in from a STUN crate, in the same spirit
//! as the relay wire codec: the message shape needed here is a 20-byte
//! header plus a single XOR-MAPPED-ADDRESS attribute, not the general
//! encoder/decoder a TURN server needs (the `faster-stun` crate bundled
//! with one of the reference repos is a good model for what a *complete*
//! STUN codec looks like, but is overkill for an outbound-only binding
//! client).

use std::{
    io,
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr},
    time::Duration,
};

use rand::RngCore;
use tokio::net::UdpSocket;

const MAGIC_COOKIE: u32 = 0x2112A442;
const BINDING_REQUEST: u16 = 0x0001;
const BINDING_SUCCESS: u16 = 0x0101;
const ATTR_XOR_MAPPED_ADDRESS: u16 = 0x0020;
const ATTR_MAPPED_ADDRESS: u16 = 0x0001;

fn build_binding_request(transaction_id: &[u8; 12]) -> [u8; 20] {
    let mut buf = [0u8; 20];
    buf[0..2].copy_from_slice(&BINDING_REQUEST.to_be_bytes());
    buf[2..4].copy_from_slice(&0u16.to_be_bytes());
    buf[4..8].copy_from_slice(&MAGIC_COOKIE.to_be_bytes());
    buf[8..20].copy_from_slice(transaction_id);
    buf
}

/// Parse a STUN binding response, returning the reflexive address if a
/// (XOR-)MAPPED-ADDRESS attribute matching `transaction_id` is present.
fn parse_binding_response(buf: &[u8], transaction_id: &[u8; 12]) -> io::Result<SocketAddr> {
    if buf.len() < 20 {
        return Err(invalid("short STUN message"));
    }
    let msg_type = u16::from_be_bytes([buf[0], buf[1]]);
    let len = u16::from_be_bytes([buf[2], buf[3]]) as usize;
    if msg_type != BINDING_SUCCESS {
        return Err(invalid(format!("unexpected STUN message type {msg_type:#06x}")));
    }
    if &buf[8..20] != transaction_id {
        return Err(invalid("STUN transaction id mismatch"));
    }
    if buf.len() < 20 + len {
        return Err(invalid("truncated STUN message"));
    }

    let mut pos = 20;
    let end = 20 + len;
    let mut mapped_fallback: Option<SocketAddr> = None;
    while pos + 4 <= end {
        let attr_type = u16::from_be_bytes([buf[pos], buf[pos + 1]]);
        let attr_len = u16::from_be_bytes([buf[pos + 2], buf[pos + 3]]) as usize;
        let value_start = pos + 4;
        let value_end = value_start + attr_len;
        if value_end > end {
            break;
        }
        let value = &buf[value_start..value_end];

        if attr_type == ATTR_XOR_MAPPED_ADDRESS {
            if let Some(addr) = parse_xor_mapped_address(value, transaction_id) {
                return Ok(addr);
            }
        } else if attr_type == ATTR_MAPPED_ADDRESS && mapped_fallback.is_none() {
            mapped_fallback = parse_mapped_address(value);
        }

        // Attributes are padded to a 4-byte boundary.
        pos = value_end + ((4 - (attr_len % 4)) % 4);
    }

    mapped_fallback.ok_or_else(|| invalid("no (XOR-)MAPPED-ADDRESS attribute in response"))
}

fn parse_mapped_address(value: &[u8]) -> Option<SocketAddr> {
    if value.len() < 8 {
        return None;
    }
    let family = value[1];
    let port = u16::from_be_bytes([value[2], value[3]]);
    match family {
        0x01 => {
            let ip = Ipv4Addr::new(value[4], value[5], value[6], value[7]);
            Some(SocketAddr::new(IpAddr::V4(ip), port))
        }
        0x02 if value.len() >= 20 => {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&value[4..20]);
            Some(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port))
        }
        _ => None,
    }
}

fn parse_xor_mapped_address(value: &[u8], transaction_id: &[u8; 12]) -> Option<SocketAddr> {
    if value.len() < 8 {
        return None;
    }
    let family = value[1];
    let xport = u16::from_be_bytes([value[2], value[3]]);
    let port = xport ^ ((MAGIC_COOKIE >> 16) as u16);
    match family {
        0x01 => {
            let xaddr = u32::from_be_bytes([value[4], value[5], value[6], value[7]]);
            let addr = xaddr ^ MAGIC_COOKIE;
            Some(SocketAddr::new(IpAddr::V4(Ipv4Addr::from(addr)), port))
        }
        0x02 if value.len() >= 20 => {
            let mut cookie_and_tx = [0u8; 16];
            cookie_and_tx[0..4].copy_from_slice(&MAGIC_COOKIE.to_be_bytes());
            cookie_and_tx[4..16].copy_from_slice(transaction_id);
            let mut octets = [0u8; 16];
            for i in 0..16 {
                octets[i] = value[4 + i] ^ cookie_and_tx[i];
            }
            Some(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port))
        }
        _ => None,
    }
}

fn invalid(msg: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.into())
}

/// Send a single binding request to `server` (host:port, resolved via DNS)
/// and wait up to `timeout` for the response.
pub async fn probe_one(server: &str, timeout: Duration) -> io::Result<SocketAddr> {
    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    socket.connect(server).await?;

    let mut transaction_id = [0u8; 12];
    rand::thread_rng().fill_bytes(&mut transaction_id);
    let request = build_binding_request(&transaction_id);

    tokio::time::timeout(timeout, async {
        socket.send(&request).await?;
        let mut buf = [0u8; 512];
        let n = socket.recv(&mut buf).await?;
        parse_binding_response(&buf[..n], &transaction_id)
    })
    .await
    .map_err(|_| invalid("STUN probe timed out"))?
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn xor_mapped_address_v4_roundtrips() {
        let transaction_id = [7u8; 12];
        let real_addr: SocketAddr = "203.0.113.5:4001".parse().unwrap();
        let SocketAddr::V4(v4) = real_addr else { unreachable!() };

        let mut value = vec![0u8, 0x01];
        let xport = v4.port() ^ ((MAGIC_COOKIE >> 16) as u16);
        value.extend_from_slice(&xport.to_be_bytes());
        let xaddr = u32::from_be_bytes(v4.ip().octets()) ^ MAGIC_COOKIE;
        value.extend_from_slice(&xaddr.to_be_bytes());

        let parsed = parse_xor_mapped_address(&value, &transaction_id).unwrap();
        assert_eq!(parsed, real_addr);
    }

    #[test]
    fn response_with_wrong_transaction_id_is_rejected() {
        let transaction_id = [1u8; 12];
        let mut buf = build_binding_request(&transaction_id).to_vec();
        buf[0..2].copy_from_slice(&BINDING_SUCCESS.to_be_bytes());
        buf[8..20].copy_from_slice(&[2u8; 12]);
        assert!(parse_binding_response(&buf, &transaction_id).is_err());
    }

    #[test]
    fn truncated_message_is_rejected() {
        assert!(parse_binding_response(&[0u8; 10], &[0u8; 12]).is_err());
    }
}
