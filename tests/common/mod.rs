//! Shared helpers for the integration tests
//!
//! `RawPeer` drives one end of an in-memory transport by hand so tests can
//! put exact bytes on the wire and inspect what the engine sends back.

#![allow(dead_code, clippy::expect_used, clippy::unwrap_used, clippy::panic)]

use bytes::{Bytes, BytesMut};
use mux_protocol::config::MuxConfig;
use mux_protocol::core::codec::{Inbound, MuxCodec};
use mux_protocol::core::frame::{DataFlags, Frame, SessionId};
use mux_protocol::error::DownReason;
use mux_protocol::protocol::handshake::ConnectionHeader;
use mux_protocol::{Mux, MuxBuilder};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio_util::codec::Decoder;

pub const TRANSPORT_BUFFER: usize = 1 << 20;

/// Defaults with timeouts short enough for tests
pub fn fast_config() -> MuxConfig {
    MuxConfig::default_with_overrides(|c| {
        c.handshake_timeout = Duration::from_secs(2);
        c.error_flush_timeout = Duration::from_millis(500);
        c.shutdown_timeout = Duration::from_secs(1);
    })
}

pub fn config_with_ration(ration: u32) -> MuxConfig {
    let mut config = fast_config();
    config.initial_inbound_ration = ration;
    config
}

/// Initiator and responder over an in-memory duplex, handshake complete
pub async fn connected_pair() -> (Mux, Mux) {
    connected_pair_with(
        MuxBuilder::initiator().config(fast_config()),
        MuxBuilder::responder().config(fast_config()),
    )
    .await
}

pub async fn connected_pair_with(client: MuxBuilder, server: MuxBuilder) -> (Mux, Mux) {
    let (client_io, server_io) = tokio::io::duplex(TRANSPORT_BUFFER);
    let server = server.build(server_io).expect("build responder");
    let client = client.build(client_io).expect("build initiator");
    client.start().await.expect("handshake");
    (client, server)
}

/// Counts down-callback invocations
pub fn down_counter() -> (Arc<AtomicUsize>, impl FnOnce(&DownReason) + Send + 'static) {
    let count = Arc::new(AtomicUsize::new(0));
    let seen = count.clone();
    (count, move |_: &DownReason| {
        seen.fetch_add(1, Ordering::SeqCst);
    })
}

/// Poll `check` until it holds or two seconds pass
pub async fn eventually<F>(check: F) -> bool
where
    F: Fn() -> bool,
{
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

pub fn open_flags() -> DataFlags {
    DataFlags {
        open: true,
        ..DataFlags::default()
    }
}

pub fn data(id: u8, flags: DataFlags, payload: &[u8]) -> Frame {
    Frame::data(SessionId::new(id), flags, Bytes::copy_from_slice(payload)).expect("data frame")
}

/// Hand-driven end of the transport
pub struct RawPeer {
    io: DuplexStream,
    codec: MuxCodec,
    buf: BytesMut,
}

impl RawPeer {
    pub fn new(io: DuplexStream, codec: MuxCodec) -> Self {
        Self {
            io,
            codec,
            buf: BytesMut::new(),
        }
    }

    pub async fn send_bytes(&mut self, bytes: &[u8]) {
        self.io.write_all(bytes).await.expect("raw write");
    }

    pub async fn send(&mut self, frame: Frame) {
        let bytes = frame.to_bytes().expect("encode");
        self.send_bytes(&bytes).await;
    }

    /// Next item from the engine; `None` once the transport is closed.
    pub async fn next(&mut self) -> Option<Inbound> {
        loop {
            match self.codec.decode(&mut self.buf) {
                Ok(Some(item)) => return Some(item),
                Ok(None) => {}
                Err(e) => panic!("engine sent malformed bytes: {e}"),
            }
            let mut chunk = [0u8; 4096];
            let n = self.io.read(&mut chunk).await.ok()?;
            if n == 0 {
                return None;
            }
            self.buf.extend_from_slice(&chunk[..n]);
        }
    }

    pub async fn next_frame(&mut self) -> Option<Frame> {
        match self.next().await? {
            Inbound::Frame(frame) => Some(frame),
            Inbound::Handshake(header) => panic!("unexpected handshake {header:?}"),
        }
    }

    /// Skip frames until an Error frame arrives; returns its message.
    pub async fn expect_error(&mut self) -> String {
        loop {
            match self.next_frame().await {
                Some(Frame::Error { message }) => return message,
                Some(_) => {}
                None => panic!("transport closed without an Error frame"),
            }
        }
    }

    /// Assert the engine closes the transport without sending anything else.
    pub async fn expect_closed(&mut self) {
        if let Some(item) = self.next().await {
            panic!("expected end of stream, got {item:?}");
        }
    }

    /// Ping the engine and wait for its ack, proving everything sent before it was seen.
    pub async fn sync(&mut self, cookie: u16) -> Vec<Frame> {
        self.send(Frame::Ping { cookie }).await;
        let mut before = Vec::new();
        loop {
            match self.next_frame().await {
                Some(Frame::PingAck { cookie: c }) if c == cookie => return before,
                Some(frame) => before.push(frame),
                None => panic!("transport closed while waiting for ping-ack"),
            }
        }
    }
}

/// A responder engine driven by a raw initiator, handshake complete
pub async fn raw_initiator(server: MuxBuilder, ration: u32) -> (RawPeer, Mux) {
    let (raw_io, server_io) = tokio::io::duplex(TRANSPORT_BUFFER);
    let server = server.build(server_io).expect("build responder");
    let mut raw = RawPeer::new(raw_io, MuxCodec::initiator());
    let header = ConnectionHeader::initiator(ration, false)
        .and_then(|h| h.to_bytes())
        .expect("header");
    raw.send_bytes(&header).await;
    match raw.next().await {
        Some(Inbound::Handshake(_)) => {}
        other => panic!("expected responder header, got {other:?}"),
    }
    (raw, server)
}

/// An initiator engine driven by a raw responder, handshake complete
pub async fn raw_responder(client: MuxBuilder, ration: u32) -> (RawPeer, Mux) {
    let (client_io, raw_io) = tokio::io::duplex(TRANSPORT_BUFFER);
    let client = client.build(client_io).expect("build initiator");
    let mut raw = RawPeer::new(raw_io, MuxCodec::responder());

    let answer = async {
        let version = match raw.next().await {
            Some(Inbound::Handshake(header)) => header.version,
            other => panic!("expected initiator header, got {other:?}"),
        };
        let reply = ConnectionHeader::responder(version, ration)
            .and_then(|h| h.to_bytes())
            .expect("header");
        raw.send_bytes(&reply).await;
    };
    let (started, ()) = tokio::join!(client.start(), answer);
    started.expect("handshake");
    (raw, client)
}
