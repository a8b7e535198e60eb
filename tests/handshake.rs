//! Integration tests for the connection header exchange

#![allow(clippy::expect_used, clippy::unwrap_used, clippy::panic)]

mod common;

use common::{config_with_ration, connected_pair, down_counter, fast_config, RawPeer};
use mux_protocol::config::{MuxConfig, PROTOCOL_VERSION};
use mux_protocol::core::codec::{Inbound, MuxCodec};
use mux_protocol::error::{constants, MuxError};
use mux_protocol::protocol::handshake::{ConnectionHeader, FLAG_NEGOTIATE};
use mux_protocol::MuxBuilder;
use std::sync::atomic::Ordering;
use std::time::Duration;

/// Responder engine plus a raw initiator that has not sent anything yet
fn responder_with_raw_peer(builder: MuxBuilder) -> (RawPeer, mux_protocol::Mux) {
    let (raw_io, server_io) = tokio::io::duplex(common::TRANSPORT_BUFFER);
    let server = builder.build(server_io).expect("build responder");
    (RawPeer::new(raw_io, MuxCodec::initiator()), server)
}

#[tokio::test]
async fn test_handshake_completes_on_both_sides() {
    let (client, server) = connected_pair().await;
    assert_eq!(client.version(), Some(PROTOCOL_VERSION));
    assert!(common::eventually(|| server.version() == Some(PROTOCOL_VERSION)).await);
    assert!(!client.is_down());
    assert!(!server.is_down());

    let snapshot = client.metrics().snapshot();
    assert_eq!(snapshot.handshakes_total, 1);
    assert_eq!(snapshot.handshakes_success, 1);
    assert_eq!(snapshot.handshakes_failed, 0);
}

#[tokio::test]
async fn test_start_twice_is_rejected() {
    let (client, _server) = connected_pair().await;
    match client.start().await {
        Err(MuxError::InvalidState(msg)) => assert_eq!(msg, constants::ERR_ALREADY_STARTED),
        other => panic!("expected InvalidState, got {other:?}"),
    }
}

#[tokio::test]
async fn test_responder_start_is_a_no_op() {
    let (_client, server) = connected_pair().await;
    assert!(server.start().await.is_ok());
}

#[tokio::test]
async fn test_open_before_handshake_fails() {
    let (client_io, _server_io) = tokio::io::duplex(1024);
    let client = MuxBuilder::initiator()
        .config(fast_config())
        .build(client_io)
        .unwrap();
    assert!(matches!(client.open(), Err(MuxError::InvalidState(_))));
}

#[tokio::test]
async fn test_responder_advertises_configured_ration() {
    let (raw_io, server_io) = tokio::io::duplex(common::TRANSPORT_BUFFER);
    let _server = MuxBuilder::responder()
        .config(config_with_ration(0x0002_0000))
        .build(server_io)
        .unwrap();
    let mut raw = RawPeer::new(raw_io, MuxCodec::initiator());
    raw.send_bytes(&ConnectionHeader::initiator(0x100, false).unwrap().to_bytes().unwrap())
        .await;

    match raw.next().await {
        Some(Inbound::Handshake(header)) => {
            assert_eq!(header.version, PROTOCOL_VERSION);
            assert_eq!(header.ration, 0x0002_0000);
            assert!(!header.negotiate());
        }
        other => panic!("expected responder header, got {other:?}"),
    }
}

#[tokio::test]
async fn test_bad_magic_rejected_on_first_wrong_byte() {
    let (count, on_down) = down_counter();
    let (mut raw, server) =
        responder_with_raw_peer(MuxBuilder::responder().config(fast_config()).on_down(on_down));

    // Only four bytes: the mismatch is caught before a full header arrives
    raw.send_bytes(b"MUX9").await;
    tokio::time::timeout(Duration::from_secs(2), server.closed())
        .await
        .expect("responder should tear down");

    // No Error frame follows a handshake failure
    raw.expect_closed().await;
    let reason = server.down_reason().unwrap();
    assert!(reason.cause().is_some_and(MuxError::is_handshake));
    assert_eq!(server.metrics().snapshot().handshakes_failed, 1);
    assert_eq!(count.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_version_zero_rejected() {
    let (mut raw, server) = responder_with_raw_peer(MuxBuilder::responder().config(fast_config()));
    let header = ConnectionHeader {
        version: 0,
        ration: 0,
        flags: 0,
    };
    raw.send_bytes(&header.to_bytes().unwrap()).await;

    server.closed().await;
    raw.expect_closed().await;
    match server.down_reason().unwrap().cause() {
        Some(MuxError::Handshake(msg)) => assert_eq!(msg, constants::ERR_ZERO_VERSION),
        other => panic!("expected handshake error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_newer_version_without_negotiate_rejected() {
    let (mut raw, server) = responder_with_raw_peer(MuxBuilder::responder().config(fast_config()));
    let header = ConnectionHeader {
        version: 7,
        ration: 0,
        flags: 0,
    };
    raw.send_bytes(&header.to_bytes().unwrap()).await;

    server.closed().await;
    raw.expect_closed().await;
    assert!(matches!(
        server.down_reason().unwrap().cause(),
        Some(MuxError::UnsupportedVersion(7))
    ));
}

#[tokio::test]
async fn test_newer_version_with_negotiate_falls_back() {
    let (mut raw, server) = responder_with_raw_peer(MuxBuilder::responder().config(fast_config()));
    let header = ConnectionHeader {
        version: 7,
        ration: 0,
        flags: FLAG_NEGOTIATE,
    };
    raw.send_bytes(&header.to_bytes().unwrap()).await;

    match raw.next().await {
        Some(Inbound::Handshake(reply)) => assert_eq!(reply.version, PROTOCOL_VERSION),
        other => panic!("expected responder header, got {other:?}"),
    }
    assert_eq!(server.version(), Some(PROTOCOL_VERSION));
    assert!(!server.is_down());
}

#[tokio::test]
async fn test_handshake_timeout_against_silent_peer() {
    let (count, on_down) = down_counter();
    let config = MuxConfig::default_with_overrides(|c| {
        c.handshake_timeout = Duration::from_millis(100);
    });
    let (client_io, _silent) = tokio::io::duplex(1024);
    let client = MuxBuilder::initiator()
        .config(config)
        .on_down(on_down)
        .build(client_io)
        .unwrap();

    assert!(matches!(client.start().await, Err(MuxError::Timeout)));
    assert!(client.is_down());
    assert_eq!(
        client.down_reason().unwrap().message(),
        constants::ERR_HANDSHAKE_TIMEOUT
    );
    assert_eq!(client.metrics().snapshot().handshakes_failed, 1);
    assert_eq!(count.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_initiator_rejects_newer_responder_version() {
    let (client_io, raw_io) = tokio::io::duplex(common::TRANSPORT_BUFFER);
    let client = MuxBuilder::initiator()
        .config(fast_config())
        .build(client_io)
        .unwrap();
    let mut raw = RawPeer::new(raw_io, MuxCodec::responder());

    let answer = async {
        assert!(matches!(raw.next().await, Some(Inbound::Handshake(_))));
        let reply = ConnectionHeader::responder(PROTOCOL_VERSION + 1, 0).unwrap();
        raw.send_bytes(&reply.to_bytes().unwrap()).await;
    };
    let (started, ()) = tokio::join!(client.start(), answer);

    match started {
        Err(MuxError::ConnectionDown(reason)) => {
            assert!(matches!(
                reason.cause(),
                Some(MuxError::UnsupportedVersion(v)) if *v == PROTOCOL_VERSION + 1
            ));
        }
        other => panic!("expected ConnectionDown, got {other:?}"),
    }
    raw.expect_closed().await;
}

#[tokio::test]
async fn test_responder_header_before_start_is_rejected() {
    let (client_io, raw_io) = tokio::io::duplex(common::TRANSPORT_BUFFER);
    let client = MuxBuilder::initiator()
        .config(fast_config())
        .build(client_io)
        .unwrap();
    let mut raw = RawPeer::new(raw_io, MuxCodec::responder());
    let header = ConnectionHeader::responder(PROTOCOL_VERSION, 0).unwrap();
    raw.send_bytes(&header.to_bytes().unwrap()).await;

    tokio::time::timeout(Duration::from_secs(2), client.closed())
        .await
        .expect("initiator should tear down");
    assert!(matches!(client.start().await, Err(MuxError::ConnectionDown(_))));
}

#[tokio::test]
async fn test_invalid_config_rejected_at_build() {
    let config = MuxConfig::default_with_overrides(|c| c.initial_inbound_ration = 0x0000_0001);
    let (io, _peer) = tokio::io::duplex(1024);
    match MuxBuilder::initiator().config(config).build(io) {
        Err(MuxError::ConfigError(msg)) => assert!(msg.contains("Initial inbound ration")),
        other => panic!("expected ConfigError, got {other:?}"),
    }
}
