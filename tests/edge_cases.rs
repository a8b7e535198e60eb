//! Edge case tests: isolation of violations, crossing close/abort, frame limits

#![allow(clippy::expect_used, clippy::unwrap_used, clippy::panic)]

mod common;

use common::{
    data, down_counter, eventually, fast_config, open_flags, raw_initiator, raw_responder,
};
use mux_protocol::core::frame::{DataFlags, Frame, SessionId, MAX_BODY_LEN};
use mux_protocol::error::{constants, MuxError};
use mux_protocol::{HalfState, MuxBuilder};
use std::io;
use std::sync::atomic::Ordering;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

#[tokio::test]
async fn test_frame_for_inactive_session_fails_every_session() {
    let (count, on_down) = down_counter();
    let (mut raw, server) =
        raw_initiator(MuxBuilder::responder().config(fast_config()).on_down(on_down), 0).await;

    raw.send(data(1, open_flags(), b"alpha")).await;
    raw.send(data(2, open_flags(), b"beta")).await;
    let a = server.accept().await.unwrap();
    let b = server.accept().await.unwrap();

    raw.send(Frame::Close {
        session: SessionId::new(9),
    })
    .await;

    let message = raw.expect_error().await;
    assert!(message.contains("inactive session 9"), "got {message}");
    raw.expect_closed().await;

    server.closed().await;
    assert!(eventually(|| a.is_failed() && b.is_failed()).await);

    // Buffered data is still delivered before the failure surfaces
    let mut buf = [0u8; 16];
    let n = a.reader().read(&mut buf).await.unwrap();
    assert_eq!(&buf[..n], b"alpha");
    let err = a.reader().read(&mut buf).await.unwrap_err();
    assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    assert!(b.writer().write_all(b"late").await.is_err());

    let reason = server.down_reason().unwrap();
    assert_eq!(reason.message(), constants::ERR_PROTOCOL_VIOLATION);
    assert!(reason.cause().is_some_and(MuxError::is_protocol_violation));

    server.teardown("again");
    assert_eq!(count.load(Ordering::SeqCst), 1);
    assert_eq!(server.metrics().snapshot().connections_down, 1);
}

#[tokio::test]
async fn test_close_before_responder_finished_sends_partial_abort() {
    let (mut raw, server) = raw_initiator(MuxBuilder::responder().config(fast_config()), 0).await;

    let flags = DataFlags {
        open: true,
        eof: true,
        ..DataFlags::default()
    };
    raw.send(data(1, flags, b"abc")).await;
    let session = server.accept().await.unwrap();
    assert_eq!(session.out_state(), HalfState::Open);

    raw.send(Frame::Close {
        session: SessionId::new(1),
    })
    .await;
    match raw.next_frame().await {
        Some(Frame::Abort {
            session: id,
            partial,
            ..
        }) => {
            assert_eq!(id, SessionId::new(1));
            assert!(partial);
        }
        other => panic!("expected Abort, got {other:?}"),
    }

    // Local writes are accepted and dropped; buffered input is still readable
    let mut writer = session.writer();
    writer.write_all(b"discarded").await.unwrap();
    writer.shutdown().await.unwrap();
    let mut received = Vec::new();
    session.reader().read_to_end(&mut received).await.unwrap();
    assert_eq!(received, b"abc");

    assert_eq!(session.out_state(), HalfState::Terminated);
    assert_eq!(session.in_state(), HalfState::Terminated);
    assert!(raw.sync(3).await.is_empty());
    assert_eq!(server.active_sessions(), 0);
}

#[tokio::test]
async fn test_close_flag_on_eof_data() {
    let (mut raw, server) = raw_initiator(MuxBuilder::responder().config(fast_config()), 0).await;
    raw.send(data(4, open_flags(), b"head")).await;
    let session = server.accept().await.unwrap();

    let flags = DataFlags {
        eof: true,
        close: true,
        ..DataFlags::default()
    };
    raw.send(data(4, flags, b"tail")).await;
    match raw.next_frame().await {
        Some(Frame::Abort { partial, .. }) => assert!(partial),
        other => panic!("expected Abort, got {other:?}"),
    }
    let mut received = Vec::new();
    session.reader().read_to_end(&mut received).await.unwrap();
    assert_eq!(received, b"headtail");
}

#[tokio::test]
async fn test_abort_after_finish_sends_close() {
    let (mut raw, client) = raw_responder(MuxBuilder::initiator().config(fast_config()), 0).await;
    let session = client.open().unwrap();
    let mut writer = session.writer();
    writer.write_all(b"data").await.unwrap();
    writer.shutdown().await.unwrap();
    assert_eq!(session.out_state(), HalfState::Finished);

    session.abort();
    let frames = raw.sync(4).await;
    assert_eq!(frames.len(), 3);
    assert!(matches!(&frames[0], Frame::Data { flags, .. } if flags.open));
    assert!(matches!(&frames[1], Frame::Data { flags, .. } if flags.eof));
    assert_eq!(frames[2], Frame::Close { session: session.id() });
}

#[tokio::test]
async fn test_abort_is_idempotent_on_the_wire() {
    let (mut raw, client) = raw_responder(MuxBuilder::initiator().config(fast_config()), 0).await;
    let session = client.open().unwrap();
    session.writer().write_all(b"x").await.unwrap();

    session.abort();
    session.abort();
    let frames = raw.sync(5).await;
    assert_eq!(frames.len(), 2);
    assert_eq!(frames[1], Frame::abort(session.id(), false, ""));

    // The initiator waits for the echo before releasing the identifier
    assert_eq!(client.active_sessions(), 1);
    raw.send(Frame::abort(session.id(), true, "")).await;
    assert!(eventually(|| client.active_sessions() == 0).await);
}

#[tokio::test]
async fn test_abort_of_unused_session_sends_nothing() {
    let (mut raw, client) = raw_responder(MuxBuilder::initiator().config(fast_config()), 0).await;
    let session = client.open().unwrap();
    session.abort();
    assert_eq!(client.active_sessions(), 0);
    assert!(raw.sync(6).await.is_empty());
}

#[tokio::test]
async fn test_peer_abort_is_echoed() {
    let (mut raw, server) = raw_initiator(MuxBuilder::responder().config(fast_config()), 0).await;
    raw.send(data(2, open_flags(), b"partial")).await;
    let session = server.accept().await.unwrap();

    raw.send(Frame::abort(SessionId::new(2), false, "gave up")).await;
    assert_eq!(raw.next_frame().await, Some(Frame::abort(SessionId::new(2), true, "")));

    let mut buf = [0u8; 16];
    let n = session.reader().read(&mut buf).await.unwrap();
    assert_eq!(&buf[..n], b"partial");
    let err = session.reader().read(&mut buf).await.unwrap_err();
    assert_eq!(err.kind(), io::ErrorKind::ConnectionReset);
    assert!(err.to_string().contains("gave up"));
    assert_eq!(session.partial_delivery(), Some(false));
    assert!(eventually(|| server.active_sessions() == 0).await);
}

#[tokio::test]
async fn test_maximum_body_accepted() {
    let (mut raw, server) = raw_initiator(MuxBuilder::responder().config(fast_config()), 0).await;
    raw.send(data(0, open_flags(), &vec![9u8; MAX_BODY_LEN])).await;
    let session = server.accept().await.unwrap();
    assert!(eventually(|| session.buffered() == MAX_BODY_LEN).await);
    assert!(!server.is_down());

    assert!(matches!(
        Frame::data(
            SessionId::new(0),
            DataFlags::default(),
            vec![0u8; MAX_BODY_LEN + 1].into()
        ),
        Err(MuxError::BodyTooLarge(65536))
    ));
}

#[tokio::test]
async fn test_large_writes_split_at_maximum_body() {
    let (mut raw, client) = raw_responder(MuxBuilder::initiator().config(fast_config()), 0).await;
    let session = client.open().unwrap();
    session
        .writer()
        .write_all(&vec![3u8; MAX_BODY_LEN + 100])
        .await
        .unwrap();

    let frames = raw.sync(7).await;
    let sizes: Vec<usize> = frames
        .iter()
        .map(|f| match f {
            Frame::Data { payload, .. } => payload.len(),
            other => panic!("unexpected frame {other:?}"),
        })
        .collect();
    assert_eq!(sizes, vec![MAX_BODY_LEN, 100]);
}

#[test]
fn test_session_id_range() {
    assert!(SessionId::try_from(255usize).is_ok());
    assert!(matches!(
        SessionId::try_from(256usize),
        Err(MuxError::InvalidSessionId(256))
    ));
}

#[tokio::test]
async fn test_unknown_op_is_a_violation() {
    let (mut raw, server) = raw_initiator(MuxBuilder::responder().config(fast_config()), 0).await;
    raw.send_bytes(&[0x01, 0, 0, 0]).await;
    raw.expect_error().await;
    raw.expect_closed().await;
    assert_eq!(server.metrics().snapshot().protocol_errors, 1);
}

#[tokio::test]
async fn test_shutdown_received_by_responder_is_a_violation() {
    let (mut raw, server) = raw_initiator(MuxBuilder::responder().config(fast_config()), 0).await;
    raw.send(Frame::shutdown("bye")).await;
    let message = raw.expect_error().await;
    assert!(message.contains("shutdown"), "got {message}");
    assert!(eventually(|| server.is_down()).await);
}

#[tokio::test]
async fn test_initiator_rejects_open_from_peer() {
    let (mut raw, client) = raw_responder(MuxBuilder::initiator().config(fast_config()), 0).await;
    raw.send(data(0, open_flags(), b"nope")).await;
    raw.expect_error().await;
    assert!(eventually(|| client.is_down()).await);
}

#[tokio::test]
async fn test_ack_required_from_responder_is_a_violation() {
    let (mut raw, client) = raw_responder(MuxBuilder::initiator().config(fast_config()), 0).await;
    let session = client.open().unwrap();
    session.writer().write_all(b"x").await.unwrap();

    let flags = DataFlags {
        eof: true,
        ack_required: true,
        ..DataFlags::default()
    };
    raw.send(data(session.id().get(), flags, b"")).await;
    raw.expect_error().await;
    assert!(eventually(|| client.is_down()).await);
}

#[tokio::test]
async fn test_acknowledgment_round_trip_with_raw_responder() {
    let (mut raw, client) = raw_responder(MuxBuilder::initiator().config(fast_config()), 0).await;
    let session = client.open().unwrap();
    let (tx, rx) = tokio::sync::oneshot::channel();
    session
        .on_acknowledgment(move |received| {
            let _ = tx.send(received);
        })
        .unwrap();
    let mut writer = session.writer();
    writer.request_acknowledgment().unwrap();
    writer.shutdown().await.unwrap();

    match raw.next_frame().await {
        Some(Frame::Data { flags, payload, .. }) => {
            assert!(flags.open && flags.eof && flags.ack_required);
            assert!(payload.is_empty());
        }
        other => panic!("expected EOF data, got {other:?}"),
    }
    raw.send(Frame::Acknowledgment {
        session: session.id(),
    })
    .await;
    assert!(rx.await.unwrap());

    // A second acknowledgment is unexpected
    raw.send(Frame::Acknowledgment {
        session: session.id(),
    })
    .await;
    raw.expect_error().await;
}

#[tokio::test]
async fn test_unknown_ping_ack_is_ignored() {
    let (mut raw, server) = raw_initiator(MuxBuilder::responder().config(fast_config()), 0).await;
    raw.send(Frame::PingAck { cookie: 77 }).await;
    raw.send(Frame::NoOp {
        body: bytes::Bytes::from_static(b"padding"),
    })
    .await;
    assert!(raw.sync(8).await.is_empty());
    assert!(!server.is_down());
}

#[tokio::test]
async fn test_error_frame_from_peer_tears_down() {
    let (mut raw, server) = raw_initiator(MuxBuilder::responder().config(fast_config()), 0).await;
    raw.send(Frame::error("peer exploded")).await;
    server.closed().await;
    raw.expect_closed().await;
    let reason = server.down_reason().unwrap();
    assert_eq!(reason.message(), constants::ERR_PEER_ERROR);
    assert!(matches!(reason.cause(), Some(MuxError::PeerError(m)) if m == "peer exploded"));
}
