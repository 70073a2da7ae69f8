//! Binary wire codec for the relay control protocol (spec.md §4.2/§6).
//!
//! Self-contained, big-endian, fixed-layout — deliberately not CBOR or
//! protobuf, mirroring the teacher's framed codec shape
//! (`protocol/codec.rs`: length-prefix + payload over an `AsyncRead`/
//! `AsyncWrite` stream) but with the exact byte layout the spec pins down
//! byte-for-byte so two independent implementations interoperate.

use std::io;

use futures::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use libp2p::{multiaddr::Protocol as MaProtocol, Multiaddr, PeerId};

/// Maximum number of addresses in a single `ReserveOk`. Bounds allocation
/// when decoding from an untrusted peer.
const MAX_RESERVE_ADDRS: usize = 255;
/// Maximum protocol-id string length accepted in a `Connect` request.
const MAX_PROTO_LEN: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MsgType {
    Reserve = 1,
    ReserveOk = 2,
    ReserveError = 3,
    Connect = 4,
    ConnectOk = 5,
    ConnectError = 6,
}

impl MsgType {
    fn from_u8(b: u8) -> io::Result<Self> {
        match b {
            1 => Ok(Self::Reserve),
            2 => Ok(Self::ReserveOk),
            3 => Ok(Self::ReserveError),
            4 => Ok(Self::Connect),
            5 => Ok(Self::ConnectOk),
            6 => Ok(Self::ConnectError),
            other => Err(invalid(format!("unknown message type {other}"))),
        }
    }
}

pub const WIRE_VERSION: u8 = 1;
pub const CONNECT_VERSION: u8 = 2;

/// Error codes carried in `ReserveError`/`ConnectError`, per spec.md §4.2.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum RelayErrorCode {
    Malformed = 100,
    ResourceLimit = 200,
    NoReservation = 201,
    ConnectToDestFailed = 300,
    PermissionDenied = 401,
    ProtocolNotAllowed = 402,
}

impl RelayErrorCode {
    pub fn code(self) -> u16 {
        self as u16
    }
}

fn invalid(msg: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.into())
}

/// The relay control messages exchanged over the System/Realm relay's
/// signaling stream.
#[derive(Debug, Clone, PartialEq)]
pub enum RelayMessage {
    /// `[MsgType=1 | Version=1 | TTL(u32)]` — 6 bytes.
    Reserve { ttl_secs: u32 },
    /// `[MsgType=2 | Version | TTL(u32) | Slots(u16) | AddrCount(u8) |
    /// [len(u16)+bytes]*]`.
    ReserveOk {
        ttl_secs: u32,
        slots: u16,
        addrs: Vec<Multiaddr>,
    },
    /// `[MsgType=3 | Version | ErrCode(u16)]`.
    ReserveError { code: u16 },
    /// `[MsgType=4 | Version=1 | DestPeerID(32) | ProtoLen(u16) |
    /// Protocol(utf-8)]`, `ProtoLen=0` meaning "no protocol pre-check".
    Connect {
        dest: PeerId,
        protocol: Option<String>,
    },
    /// `[MsgType=5 | Version]` — 2 bytes.
    ConnectOk,
    /// `[MsgType=6 | Version | ErrCode(u16)]` — 4 bytes.
    ConnectError { code: u16 },
}

impl RelayMessage {
    pub async fn write<W: AsyncWrite + Unpin>(&self, io: &mut W) -> io::Result<()> {
        match self {
            RelayMessage::Reserve { ttl_secs } => {
                io.write_all(&[MsgType::Reserve as u8, WIRE_VERSION]).await?;
                io.write_all(&ttl_secs.to_be_bytes()).await?;
            }
            RelayMessage::ReserveOk {
                ttl_secs,
                slots,
                addrs,
            } => {
                if addrs.len() > MAX_RESERVE_ADDRS {
                    return Err(invalid("too many addresses in ReserveOk"));
                }
                io.write_all(&[MsgType::ReserveOk as u8, WIRE_VERSION]).await?;
                io.write_all(&ttl_secs.to_be_bytes()).await?;
                io.write_all(&slots.to_be_bytes()).await?;
                io.write_all(&[addrs.len() as u8]).await?;
                for addr in addrs {
                    let bytes = addr.to_vec();
                    if bytes.len() > u16::MAX as usize {
                        return Err(invalid("address too long"));
                    }
                    io.write_all(&(bytes.len() as u16).to_be_bytes()).await?;
                    io.write_all(&bytes).await?;
                }
            }
            RelayMessage::ReserveError { code } => {
                io.write_all(&[MsgType::ReserveError as u8, WIRE_VERSION]).await?;
                io.write_all(&code.to_be_bytes()).await?;
            }
            RelayMessage::Connect { dest, protocol } => {
                io.write_all(&[MsgType::Connect as u8, CONNECT_VERSION]).await?;
                io.write_all(&dest.to_bytes()).await?;
                match protocol {
                    Some(p) => {
                        if p.len() > MAX_PROTO_LEN {
                            return Err(invalid("protocol id too long"));
                        }
                        io.write_all(&(p.len() as u16).to_be_bytes()).await?;
                        io.write_all(p.as_bytes()).await?;
                    }
                    None => io.write_all(&0u16.to_be_bytes()).await?,
                }
            }
            RelayMessage::ConnectOk => {
                io.write_all(&[MsgType::ConnectOk as u8, CONNECT_VERSION]).await?;
            }
            RelayMessage::ConnectError { code } => {
                io.write_all(&[MsgType::ConnectError as u8, CONNECT_VERSION]).await?;
                io.write_all(&code.to_be_bytes()).await?;
            }
        }
        io.flush().await
    }

    pub async fn read<R: AsyncRead + Unpin>(io: &mut R) -> io::Result<Self> {
        let mut head = [0u8; 2];
        io.read_exact(&mut head).await?;
        let msg_type = MsgType::from_u8(head[0])?;
        let _version = head[1];

        match msg_type {
            MsgType::Reserve => {
                let mut ttl = [0u8; 4];
                io.read_exact(&mut ttl).await?;
                Ok(RelayMessage::Reserve {
                    ttl_secs: u32::from_be_bytes(ttl),
                })
            }
            MsgType::ReserveOk => {
                let mut ttl = [0u8; 4];
                io.read_exact(&mut ttl).await?;
                let mut slots = [0u8; 2];
                io.read_exact(&mut slots).await?;
                let mut count = [0u8; 1];
                io.read_exact(&mut count).await?;
                let count = count[0] as usize;
                if count > MAX_RESERVE_ADDRS {
                    return Err(invalid("too many addresses in ReserveOk"));
                }
                let mut addrs = Vec::with_capacity(count);
                for _ in 0..count {
                    let mut len_buf = [0u8; 2];
                    io.read_exact(&mut len_buf).await?;
                    let len = u16::from_be_bytes(len_buf) as usize;
                    let mut buf = vec![0u8; len];
                    io.read_exact(&mut buf).await?;
                    let addr = Multiaddr::try_from(buf).map_err(|e| invalid(e.to_string()))?;
                    addrs.push(addr);
                }
                Ok(RelayMessage::ReserveOk {
                    ttl_secs: u32::from_be_bytes(ttl),
                    slots: u16::from_be_bytes(slots),
                    addrs,
                })
            }
            MsgType::ReserveError => {
                let mut code = [0u8; 2];
                io.read_exact(&mut code).await?;
                Ok(RelayMessage::ReserveError {
                    code: u16::from_be_bytes(code),
                })
            }
            MsgType::Connect => {
                let mut dest_buf = [0u8; 32];
                io.read_exact(&mut dest_buf).await?;
                let dest = PeerId::from_bytes(&dest_buf).map_err(|e| invalid(e.to_string()))?;
                let mut len_buf = [0u8; 2];
                io.read_exact(&mut len_buf).await?;
                let len = u16::from_be_bytes(len_buf) as usize;
                if len > MAX_PROTO_LEN {
                    return Err(invalid("protocol id too long"));
                }
                let protocol = if len == 0 {
                    None
                } else {
                    let mut buf = vec![0u8; len];
                    io.read_exact(&mut buf).await?;
                    Some(String::from_utf8(buf).map_err(|e| invalid(e.to_string()))?)
                };
                Ok(RelayMessage::Connect { dest, protocol })
            }
            MsgType::ConnectOk => Ok(RelayMessage::ConnectOk),
            MsgType::ConnectError => {
                let mut code = [0u8; 2];
                io.read_exact(&mut code).await?;
                Ok(RelayMessage::ConnectError {
                    code: u16::from_be_bytes(code),
                })
            }
        }
    }
}

/// True if `addr` carries a trailing `/p2p/<id>` component — used by relay
/// server / dial code to sanity-check decoded advertise addresses.
pub fn multiaddr_has_p2p_component(addr: &Multiaddr) -> bool {
    addr.iter().any(|p| matches!(p, MaProtocol::P2p(_)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::io::Cursor;

    async fn roundtrip(msg: RelayMessage) -> RelayMessage {
        let mut buf = Vec::new();
        msg.write(&mut buf).await.unwrap();
        let mut cursor = Cursor::new(buf);
        RelayMessage::read(&mut cursor).await.unwrap()
    }

    #[tokio::test]
    async fn reserve_roundtrips() {
        let msg = RelayMessage::Reserve { ttl_secs: 3600 };
        assert_eq!(roundtrip(msg.clone()).await, msg);
    }

    #[tokio::test]
    async fn reserve_ok_roundtrips_with_addrs() {
        let addrs = vec![
            "/ip4/203.0.113.5/udp/4001/quic-v1".parse().unwrap(),
            "/ip4/198.51.100.9/tcp/4001".parse().unwrap(),
        ];
        let msg = RelayMessage::ReserveOk {
            ttl_secs: 3600,
            slots: 16,
            addrs,
        };
        assert_eq!(roundtrip(msg.clone()).await, msg);
    }

    #[tokio::test]
    async fn connect_roundtrips_with_and_without_protocol() {
        let dest = PeerId::random();
        let with_proto = RelayMessage::Connect {
            dest,
            protocol: Some("/dep2p/app/deadbeef/chat".into()),
        };
        assert_eq!(roundtrip(with_proto.clone()).await, with_proto);

        let without_proto = RelayMessage::Connect {
            dest,
            protocol: None,
        };
        assert_eq!(roundtrip(without_proto.clone()).await, without_proto);
    }

    #[tokio::test]
    async fn connect_error_carries_code() {
        let msg = RelayMessage::ConnectError {
            code: RelayErrorCode::ProtocolNotAllowed.code(),
        };
        assert_eq!(roundtrip(msg.clone()).await, msg);
    }

    #[tokio::test]
    async fn connect_ok_is_two_bytes() {
        let mut buf = Vec::new();
        RelayMessage::ConnectOk.write(&mut buf).await.unwrap();
        assert_eq!(buf.len(), 2);
    }

    #[tokio::test]
    async fn rejects_unknown_message_type() {
        let mut cursor = Cursor::new(vec![99u8, 1]);
        assert!(RelayMessage::read(&mut cursor).await.is_err());
    }
}
