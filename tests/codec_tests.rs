//! Integration-level tests for the relay control wire codec (spec.md §4.2/§6).
//!
//! The unit tests inside `protocol::codec` already cover the happy-path
//! round trips for every message variant; these tests exercise boundary and
//! cross-stream behavior that only makes sense from outside the module.

use dep2p_core::protocol::codec::{multiaddr_has_p2p_component, RelayErrorCode, RelayMessage};
use futures::io::Cursor;
use libp2p::{Multiaddr, PeerId};

async fn roundtrip(msg: RelayMessage) -> RelayMessage {
    let mut buf = Vec::new();
    msg.write(&mut buf).await.unwrap();
    let mut cursor = Cursor::new(buf);
    RelayMessage::read(&mut cursor).await.unwrap()
}

#[tokio::test]
async fn reserve_ok_at_max_addr_count_roundtrips() {
    let addrs: Vec<Multiaddr> = (0..255u16)
        .map(|i| format!("/ip4/10.0.{}.{}/tcp/4001", i / 256, i % 256).parse().unwrap())
        .collect();
    let msg = RelayMessage::ReserveOk {
        ttl_secs: 3600,
        slots: 1,
        addrs,
    };
    assert_eq!(roundtrip(msg.clone()).await, msg);
}

#[tokio::test]
async fn reserve_ok_rejects_more_than_max_addrs_on_write() {
    let addrs: Vec<Multiaddr> = (0..256u16)
        .map(|i| format!("/ip4/10.0.{}.{}/tcp/4001", i / 256, i % 256).parse().unwrap())
        .collect();
    let msg = RelayMessage::ReserveOk {
        ttl_secs: 3600,
        slots: 1,
        addrs,
    };
    let mut buf = Vec::new();
    assert!(msg.write(&mut buf).await.is_err());
}

#[tokio::test]
async fn connect_rejects_protocol_id_over_max_length_on_write() {
    let msg = RelayMessage::Connect {
        dest: PeerId::random(),
        protocol: Some("x".repeat(513)),
    };
    let mut buf = Vec::new();
    assert!(msg.write(&mut buf).await.is_err());
}

#[tokio::test]
async fn reading_truncated_stream_errors_instead_of_panicking() {
    // A `Reserve` header with no TTL payload following it.
    let mut cursor = Cursor::new(vec![1u8, 1]);
    assert!(RelayMessage::read(&mut cursor).await.is_err());
}

#[tokio::test]
async fn reading_declared_addr_count_with_no_following_bytes_errors() {
    // MsgType::ReserveOk, version 1, ttl=0, slots=0, count=255 but no address
    // bytes follow at all.
    let mut buf = vec![2u8, 1];
    buf.extend_from_slice(&0u32.to_be_bytes());
    buf.extend_from_slice(&0u16.to_be_bytes());
    buf.push(255u8);
    let mut cursor = Cursor::new(buf);
    assert!(RelayMessage::read(&mut cursor).await.is_err());
}

#[tokio::test]
async fn two_messages_written_back_to_back_read_back_in_order() {
    let mut buf = Vec::new();
    RelayMessage::Reserve { ttl_secs: 60 }.write(&mut buf).await.unwrap();
    RelayMessage::ConnectOk.write(&mut buf).await.unwrap();

    let mut cursor = Cursor::new(buf);
    let first = RelayMessage::read(&mut cursor).await.unwrap();
    let second = RelayMessage::read(&mut cursor).await.unwrap();
    assert_eq!(first, RelayMessage::Reserve { ttl_secs: 60 });
    assert_eq!(second, RelayMessage::ConnectOk);
}

#[tokio::test]
async fn reserve_error_carries_resource_limit_code() {
    let msg = RelayMessage::ReserveError {
        code: RelayErrorCode::ResourceLimit.code(),
    };
    assert_eq!(roundtrip(msg.clone()).await, msg);
}

#[test]
fn multiaddr_p2p_component_detection() {
    let bare: Multiaddr = "/ip4/127.0.0.1/tcp/4001".parse().unwrap();
    assert!(!multiaddr_has_p2p_component(&bare));

    let with_peer: Multiaddr = format!("/ip4/127.0.0.1/tcp/4001/p2p/{}", PeerId::random())
        .parse()
        .unwrap();
    assert!(multiaddr_has_p2p_component(&with_peer));
}
