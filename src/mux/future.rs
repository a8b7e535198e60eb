//! Single-assignment completion handles for queued sends.
//!
//! [`pair`] returns a write side ([`IoPromise`]) kept by the writer loop and a
//! read side ([`IoFuture`]) handed to the caller. The value is the cumulative
//! transport position after the marked buffers were written and flushed.

use crate::error::{constants, DownReason, MuxError, Result};
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::oneshot;

type Outcome = std::result::Result<u64, DownReason>;

/// Resolving side of an [`IoFuture`]
#[derive(Debug)]
pub struct IoPromise {
    tx: Option<oneshot::Sender<Outcome>>,
}

impl IoPromise {
    /// Resolve with the transport position. Returns false if already resolved.
    pub fn complete(&mut self, position: u64) -> bool {
        self.resolve(Ok(position))
    }

    /// Resolve with a failure. Returns false if already resolved.
    pub fn fail(&mut self, reason: DownReason) -> bool {
        self.resolve(Err(reason))
    }

    pub fn is_resolved(&self) -> bool {
        self.tx.is_none()
    }

    fn resolve(&mut self, outcome: Outcome) -> bool {
        match self.tx.take() {
            Some(tx) => {
                // Receiver may be gone; the promise still counts as resolved.
                let _ = tx.send(outcome);
                true
            }
            None => false,
        }
    }
}

/// Completion handle for a send queued with `future_send`
#[derive(Debug)]
pub struct IoFuture {
    rx: oneshot::Receiver<Outcome>,
}

/// Create a linked promise/future pair.
pub fn pair() -> (IoPromise, IoFuture) {
    let (tx, rx) = oneshot::channel();
    (IoPromise { tx: Some(tx) }, IoFuture { rx })
}

impl IoFuture {
    /// A future that is already failed.
    pub fn failed(reason: DownReason) -> Self {
        let (mut promise, future) = pair();
        promise.fail(reason);
        future
    }

    /// Wait at most `duration` for resolution.
    ///
    /// # Errors
    /// `Timeout` if the deadline passes first; otherwise the send's own outcome.
    pub async fn wait_timeout(self, duration: Duration) -> Result<u64> {
        match tokio::time::timeout(duration, self).await {
            Ok(result) => result,
            Err(_) => Err(MuxError::Timeout),
        }
    }

    /// Block the current thread until resolution.
    ///
    /// Must not be called from within an async execution context.
    pub fn blocking_wait(self) -> Result<u64> {
        convert(self.rx.blocking_recv())
    }
}

impl Future for IoFuture {
    type Output = Result<u64>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx).poll(cx).map(convert)
    }
}

fn convert(received: std::result::Result<Outcome, oneshot::error::RecvError>) -> Result<u64> {
    match received {
        Ok(Ok(position)) => Ok(position),
        Ok(Err(reason)) => Err(MuxError::ConnectionDown(reason)),
        Err(_) => Err(MuxError::ConnectionDown(DownReason::new(
            constants::ERR_SEND_ABANDONED,
            None,
        ))),
    }
}
