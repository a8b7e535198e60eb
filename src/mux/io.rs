//! Transport adapter: outbound queue plus the reader and writer loops.
//!
//! Producers never touch the transport. They append encoded frames to the
//! connection's [`SendQueue`] under the connection lock and wake the writer
//! loop, which swaps the queue out and writes it in order. The reader loop
//! feeds raw bytes into the [`MuxCodec`] and hands each decoded item to the
//! dispatcher.

use super::connection::MuxShared;
use super::future::{pair, IoFuture, IoPromise};
use crate::core::codec::MuxCodec;
use crate::core::frame::Frame;
use crate::error::{constants, DownReason, MuxError, Result};
use bytes::{Bytes, BytesMut};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::codec::Decoder;
use tracing::{debug, error, instrument, trace, warn};

/// One entry of the send queue
#[derive(Debug)]
pub(crate) enum Outgoing {
    Bytes(Bytes),
    Marker(IoPromise),
}

/// Pending outbound buffers, swapped out wholesale by the writer loop
#[derive(Debug, Default)]
pub(crate) struct SendQueue {
    items: Vec<Outgoing>,
}

impl SendQueue {
    pub(crate) fn push_bytes(&mut self, bytes: Bytes) {
        self.items.push(Outgoing::Bytes(bytes));
    }

    pub(crate) fn push_marker(&mut self, promise: IoPromise) {
        self.items.push(Outgoing::Marker(promise));
    }

    pub(crate) fn take(&mut self) -> Vec<Outgoing> {
        std::mem::take(&mut self.items)
    }

    pub(crate) fn len(&self) -> usize {
        self.items.len()
    }
}

fn encode_pair(first: &Frame, second: Option<&Frame>) -> Result<Bytes> {
    let len = first.encoded_len() + second.map_or(0, Frame::encoded_len);
    let mut buf = BytesMut::with_capacity(len);
    first.encode(&mut buf)?;
    if let Some(second) = second {
        second.encode(&mut buf)?;
    }
    Ok(buf.freeze())
}

impl MuxShared {
    /// Queue one or two frames back to back. Never blocks; dropped if down.
    pub(crate) fn async_send(&self, first: Frame, second: Option<Frame>) {
        let bytes = match encode_pair(&first, second.as_ref()) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(error = %e, op = ?first.op(), "Dropping unencodable frame");
                return;
            }
        };
        let frames = if second.is_some() { 2 } else { 1 };
        {
            let mut state = self.state.lock();
            if state.down.is_some() {
                trace!(op = ?first.op(), "Connection down, frame dropped");
                return;
            }
            state.queue.push_bytes(bytes);
            if state.queue.len() == self.config.max_frame_queue + 1 {
                warn!(
                    queued = state.queue.len(),
                    threshold = self.config.max_frame_queue,
                    "Send queue backlog above threshold"
                );
            }
        }
        trace!(op = ?first.op(), session = ?first.session(), "Frame queued");
        for _ in 0..frames {
            self.metrics.frame_sent();
        }
        self.writer_wake.notify_one();
    }

    /// Queue frames followed by a marker resolved once they are flushed.
    pub(crate) fn future_send(&self, first: Frame, second: Option<Frame>) -> IoFuture {
        let bytes = match encode_pair(&first, second.as_ref()) {
            Ok(bytes) => bytes,
            Err(e) => {
                return IoFuture::failed(DownReason::new(constants::ERR_WRITE_FAILED, Some(e)))
            }
        };
        let (promise, future) = pair();
        {
            let mut state = self.state.lock();
            if let Some(reason) = &state.down {
                return IoFuture::failed(reason.clone());
            }
            state.queue.push_bytes(bytes);
            state.queue.push_marker(promise);
        }
        self.metrics.frame_sent();
        if second.is_some() {
            self.metrics.frame_sent();
        }
        self.writer_wake.notify_one();
        future
    }

    /// Queue raw bytes that are not a frame (the connection header).
    pub(crate) fn send_raw(&self, bytes: Bytes) -> bool {
        {
            let mut state = self.state.lock();
            if state.down.is_some() {
                return false;
            }
            state.queue.push_bytes(bytes);
        }
        self.writer_wake.notify_one();
        true
    }

    /// Tear down after a reader-side failure.
    ///
    /// Protocol violations get a best-effort Error frame, bounded by the
    /// configured flush timeout; handshake failures do not.
    pub(crate) async fn fail_connection(self: &Arc<Self>, err: MuxError) {
        if err.is_handshake() {
            self.metrics.handshake_failed();
            warn!(error = %err, "Handshake failed");
            self.set_down(DownReason::new(err.to_string(), Some(err)));
            return;
        }

        self.metrics.protocol_error();
        error!(error = %err, role = ?self.role, "Protocol violation, tearing down connection");
        let flushed = self
            .future_send(Frame::error(&err.to_string()), None)
            .wait_timeout(self.config.error_flush_timeout)
            .await;
        if let Err(e) = flushed {
            debug!(error = %e, "Error frame not confirmed before teardown");
        }
        self.set_down(DownReason::new(constants::ERR_PROTOCOL_VIOLATION, Some(err)));
    }
}

/// Write queued buffers in order until the connection goes down.
#[instrument(level = "debug", skip_all, fields(role = ?shared.role))]
pub(crate) async fn writer_loop<W>(shared: Arc<MuxShared>, mut writer: W)
where
    W: AsyncWrite + Unpin,
{
    let mut position: u64 = 0;
    loop {
        let batch = shared.state.lock().queue.take();
        if batch.is_empty() {
            if shared.down.is_cancelled() {
                break;
            }
            tokio::select! {
                _ = shared.writer_wake.notified() => {}
                _ = shared.down.cancelled() => {}
            }
            continue;
        }

        let mut wrote = false;
        for item in batch {
            match item {
                Outgoing::Bytes(bytes) => {
                    if shared.down.is_cancelled() {
                        continue;
                    }
                    let result = tokio::select! {
                        biased;
                        result = writer.write_all(&bytes) => result,
                        _ = shared.down.cancelled() => continue,
                    };
                    match result {
                        Ok(()) => {
                            position += bytes.len() as u64;
                            shared.metrics.bytes_written(bytes.len() as u64);
                            wrote = true;
                        }
                        Err(e) => {
                            shared.set_down(DownReason::new(
                                constants::ERR_WRITE_FAILED,
                                Some(MuxError::Io(e)),
                            ));
                        }
                    }
                }
                Outgoing::Marker(mut promise) => {
                    if shared.down.is_cancelled() {
                        promise.fail(shared.down_reason_or_default());
                        continue;
                    }
                    match writer.flush().await {
                        Ok(()) => {
                            promise.complete(position);
                            wrote = false;
                        }
                        Err(e) => {
                            let reason =
                                DownReason::new(constants::ERR_WRITE_FAILED, Some(MuxError::Io(e)));
                            shared.set_down(reason.clone());
                            promise.fail(reason);
                        }
                    }
                }
            }
        }

        if wrote && !shared.down.is_cancelled() {
            if let Err(e) = writer.flush().await {
                shared.set_down(DownReason::new(
                    constants::ERR_WRITE_FAILED,
                    Some(MuxError::Io(e)),
                ));
            }
        }
    }

    // Anything queued between the last swap and teardown still owes a result.
    let leftover = shared.state.lock().queue.take();
    let reason = shared.down_reason_or_default();
    for item in leftover {
        if let Outgoing::Marker(mut promise) = item {
            promise.fail(reason.clone());
        }
    }
    if let Err(e) = writer.shutdown().await {
        trace!(error = %e, "Transport shutdown failed");
    }
    debug!(bytes_written = position, "Writer loop finished");
}

/// Read from the transport and dispatch decoded items until the connection goes down.
#[instrument(level = "debug", skip_all, fields(role = ?shared.role))]
pub(crate) async fn reader_loop<R>(shared: Arc<MuxShared>, mut reader: R, mut codec: MuxCodec)
where
    R: AsyncRead + Unpin,
{
    let mut chunk = vec![0u8; shared.config.receive_buffer_size];
    let mut pending = BytesMut::new();
    loop {
        let read = tokio::select! {
            biased;
            _ = shared.down.cancelled() => break,
            read = reader.read(&mut chunk) => read,
        };
        match read {
            Ok(0) => {
                debug!("Transport reached end of stream");
                shared.set_down(DownReason::new(constants::ERR_CONNECTION_CLOSED, None));
                break;
            }
            Ok(n) => {
                shared.metrics.bytes_read(n as u64);
                pending.extend_from_slice(&chunk[..n]);
            }
            Err(e) => {
                shared.set_down(DownReason::new(
                    constants::ERR_READ_FAILED,
                    Some(MuxError::Io(e)),
                ));
                break;
            }
        }

        loop {
            let outcome = codec
                .decode(&mut pending)
                .and_then(|item| match item {
                    Some(item) => shared.dispatch(item).map(|()| true),
                    None => Ok(false),
                });
            match outcome {
                Ok(true) if shared.down.is_cancelled() => return,
                Ok(true) => {}
                Ok(false) => break,
                Err(e) => {
                    shared.fail_connection(e).await;
                    return;
                }
            }
        }
    }
    debug!("Reader loop finished");
}
