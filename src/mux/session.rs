//! Per-session state machines and application endpoints.
//!
//! Each session has two independent halves, outbound and inbound, each moving
//! monotonically through [`HalfState`]. The inbound half is driven by frames
//! from the dispatcher (`handle_*`); the outbound half by the application
//! through [`SessionWriter`] and [`Session::abort`].
//!
//! ## Lifecycle
//! - Initiator: created IDLE/IDLE by `Mux::open`; the first data frame carries
//!   `open` and moves both halves to OPEN. Sending EOF moves out to FINISHED.
//!   Once both halves are FINISHED and no acknowledgment is outstanding, both
//!   become TERMINATED without further traffic.
//! - Responder: created OPEN/OPEN by an `open` data frame. Sending EOF moves
//!   out straight to TERMINATED. The inbound half stays FINISHED after EOF
//!   until a Close, an Abort or a new `open` on the same identifier.
//!
//! A session leaves the connection's table once both halves are TERMINATED
//! and no acknowledgment it owes or awaits is outstanding.

use super::connection::{MuxShared, Role};
use super::executor::Executor;
use super::lock::SessionLock;
use crate::core::frame::{DataFlags, Frame, SessionId, MAX_BODY_LEN};
use crate::error::{constants, DownReason, MuxError, Result};
use bytes::{Buf, Bytes};
use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll, Waker};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tracing::{debug, trace};

/// State of one half of a session. Only ever advances.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum HalfState {
    /// Never opened
    Idle,
    /// Actively sending or receiving
    Open,
    /// EOF sent or received; peer interaction still pending
    Finished,
    /// Final
    Terminated,
}

fn advance(half: &mut HalfState, to: HalfState) {
    if to > *half {
        *half = to;
    }
}

/// Every blocked reader or writer endpoint parks its own waker here.
fn park(slot: &mut Vec<Waker>, waker: &Waker) {
    if !slot.iter().any(|parked| parked.will_wake(waker)) {
        slot.push(waker.clone());
    }
}

fn wake(slot: &mut Vec<Waker>) {
    for waker in slot.drain(..) {
        waker.wake();
    }
}

/// Why a session stopped working locally
#[derive(Debug, Clone)]
pub(crate) enum Failure {
    Aborted,
    Vetoed,
    ClosedByPeer,
    Superseded,
    PeerAborted { partial: bool, message: String },
    ConnectionDown(DownReason),
}

impl Failure {
    /// Local aborts fail reads at once; everything else drains buffered bytes first.
    fn is_immediate(&self) -> bool {
        matches!(self, Failure::Aborted | Failure::Vetoed)
    }

    fn to_io_error(&self) -> io::Error {
        match self {
            Failure::Aborted => io::Error::new(
                io::ErrorKind::ConnectionAborted,
                MuxError::SessionFailed(constants::ERR_SESSION_ABORTED.into()),
            ),
            Failure::Vetoed => io::Error::new(
                io::ErrorKind::ConnectionRefused,
                MuxError::SessionFailed(constants::ERR_SESSION_VETOED.into()),
            ),
            Failure::ClosedByPeer => io::Error::new(
                io::ErrorKind::ConnectionReset,
                MuxError::SessionFailed(constants::ERR_SESSION_CLOSED_BY_PEER.into()),
            ),
            Failure::Superseded => io::Error::new(
                io::ErrorKind::ConnectionReset,
                MuxError::SessionFailed(constants::ERR_SESSION_SUPERSEDED.into()),
            ),
            Failure::PeerAborted { partial, message } => {
                let text = if message.is_empty() {
                    format!("aborted by peer (partial delivery: {partial})")
                } else {
                    format!("aborted by peer (partial delivery: {partial}): {message}")
                };
                io::Error::new(io::ErrorKind::ConnectionReset, MuxError::SessionFailed(text))
            }
            Failure::ConnectionDown(reason) => io::Error::new(
                io::ErrorKind::BrokenPipe,
                MuxError::ConnectionDown(reason.clone()),
            ),
        }
    }
}

type AckListener = Box<dyn FnOnce(bool) + Send>;

struct SessionState {
    out_state: HalfState,
    in_state: HalfState,
    /// Remaining outbound credit; `None` is unlimited
    outbound_credit: Option<u32>,
    /// Remaining inbound allowance; `None` is unlimited
    inbound_allowance: Option<u32>,
    /// Bytes consumed by the application and not yet returned to the peer
    ungranted: u32,
    inbound: VecDeque<Bytes>,
    inbound_len: usize,
    eof_received: bool,
    failure: Option<Failure>,
    /// Writes are accepted and discarded after a Close pre-empted our output
    fake_output: bool,
    partial_delivery: Option<bool>,

    // initiator
    ack_requested: bool,
    sent_ack_required: bool,
    ack_received: bool,
    ack_outcome: Option<bool>,
    ack_listeners: Vec<AckListener>,

    // responder
    received_ack_required: bool,
    ack_sent: bool,

    /// An Abort crossed the wire; no acknowledgment will follow
    ack_cancelled: bool,
    removed: bool,
    read_wakers: Vec<Waker>,
    write_wakers: Vec<Waker>,
}

impl SessionState {
    fn new(role: Role, outbound_ration: u32, inbound_ration: u32) -> Self {
        let initial = match role {
            Role::Initiator => HalfState::Idle,
            Role::Responder => HalfState::Open,
        };
        Self {
            out_state: initial,
            in_state: initial,
            outbound_credit: (outbound_ration != 0).then_some(outbound_ration),
            inbound_allowance: (inbound_ration != 0).then_some(inbound_ration),
            ungranted: 0,
            inbound: VecDeque::new(),
            inbound_len: 0,
            eof_received: false,
            failure: None,
            fake_output: false,
            partial_delivery: None,
            ack_requested: false,
            sent_ack_required: false,
            ack_received: false,
            ack_outcome: None,
            ack_listeners: Vec::new(),
            received_ack_required: false,
            ack_sent: false,
            ack_cancelled: false,
            removed: false,
            read_wakers: Vec::new(),
            write_wakers: Vec::new(),
        }
    }

    /// Initiator: an acknowledgment was requested on the wire and may still arrive.
    fn awaiting_ack(&self) -> bool {
        self.sent_ack_required && !self.ack_received && !self.ack_cancelled
    }

    /// Responder: the peer asked for an acknowledgment we have not sent.
    fn owes_ack(&self) -> bool {
        self.received_ack_required && !self.ack_sent && !self.ack_cancelled
    }

    fn wake_all(&mut self) {
        wake(&mut self.read_wakers);
        wake(&mut self.write_wakers);
    }
}

pub(crate) struct SessionShared {
    id: SessionId,
    role: Role,
    mux: Weak<MuxShared>,
    executor: Executor,
    initial_inbound: u32,
    state: SessionLock<SessionState>,
}

impl SessionShared {
    pub(crate) fn new(
        id: SessionId,
        role: Role,
        mux: Weak<MuxShared>,
        executor: Executor,
        outbound_ration: u32,
        inbound_ration: u32,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            role,
            mux,
            executor,
            initial_inbound: inbound_ration,
            state: SessionLock::new(SessionState::new(role, outbound_ration, inbound_ration)),
        })
    }

    pub(crate) fn id(&self) -> SessionId {
        self.id
    }

    fn send(&self, frame: Frame) {
        if let Some(mux) = self.mux.upgrade() {
            mux.async_send(frame, None);
        }
    }

    fn remove(self: &Arc<Self>, st: &mut SessionState) {
        if st.removed {
            return;
        }
        st.removed = true;
        self.resolve_ack(st, false);
        if let Some(mux) = self.mux.upgrade() {
            mux.remove_session(self);
        }
        trace!(session = %self.id, "Session removed");
    }

    /// Apply implied transitions and remove the session once nothing is owed.
    fn settle(self: &Arc<Self>, st: &mut SessionState) {
        if self.role == Role::Initiator && st.in_state == HalfState::Finished {
            if st.out_state == HalfState::Finished && !st.awaiting_ack() {
                advance(&mut st.out_state, HalfState::Terminated);
            }
            if st.out_state == HalfState::Terminated {
                advance(&mut st.in_state, HalfState::Terminated);
            }
        }
        let blocked = match self.role {
            Role::Initiator => st.awaiting_ack(),
            Role::Responder => st.owes_ack(),
        };
        if st.in_state == HalfState::Terminated && st.out_state == HalfState::Terminated && !blocked
        {
            self.remove(st);
        }
    }

    fn resolve_ack(&self, st: &mut SessionState, received: bool) {
        if self.role != Role::Initiator || st.ack_outcome.is_some() {
            return;
        }
        st.ack_outcome = Some(received);
        let listeners = std::mem::take(&mut st.ack_listeners);
        if !listeners.is_empty() {
            self.executor.execute(move || {
                for listener in listeners {
                    listener(received);
                }
            });
        }
    }

    /// Initiator: the first outbound frame opens both halves.
    fn open_outbound(&self, st: &mut SessionState) -> bool {
        if st.out_state != HalfState::Idle {
            return false;
        }
        advance(&mut st.out_state, HalfState::Open);
        advance(&mut st.in_state, HalfState::Open);
        true
    }

    fn connection_error(&self) -> Option<io::Error> {
        match self.mux.upgrade() {
            None => Some(io::Error::new(
                io::ErrorKind::BrokenPipe,
                MuxError::ConnectionDown(DownReason::new(constants::ERR_MUX_DROPPED, None)),
            )),
            Some(mux) => mux.down_reason().map(|reason| {
                io::Error::new(io::ErrorKind::BrokenPipe, MuxError::ConnectionDown(reason))
            }),
        }
    }

    // ========== application side ==========

    fn poll_read(self: &Arc<Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let mut guard = self.state.lock();
        let st = &mut *guard;
        if let Some(failure) = &st.failure {
            if failure.is_immediate() {
                return Poll::Ready(Err(failure.to_io_error()));
            }
        }

        if st.inbound_len > 0 {
            let mut copied = 0;
            while buf.remaining() > 0 {
                let Some(front) = st.inbound.front_mut() else {
                    break;
                };
                let n = front.len().min(buf.remaining());
                buf.put_slice(&front[..n]);
                front.advance(n);
                if front.is_empty() {
                    st.inbound.pop_front();
                }
                copied += n;
            }
            st.inbound_len -= copied;
            self.return_credit(st, copied);
            return Poll::Ready(Ok(()));
        }

        if st.eof_received {
            self.observe_eof(st);
            return Poll::Ready(Ok(()));
        }
        if let Some(failure) = &st.failure {
            return Poll::Ready(Err(failure.to_io_error()));
        }
        park(&mut st.read_wakers, cx.waker());
        Poll::Pending
    }

    /// Grant consumed bytes back to the peer once half the initial ration is used.
    fn return_credit(&self, st: &mut SessionState, consumed: usize) {
        if self.initial_inbound == 0 || st.in_state != HalfState::Open || st.failure.is_some() {
            return;
        }
        st.ungranted = st
            .ungranted
            .saturating_add(u32::try_from(consumed).unwrap_or(u32::MAX));
        if st.ungranted < self.initial_inbound / 2 {
            return;
        }
        if let Some((frame, granted)) = Frame::increment_ration(self.id, st.ungranted) {
            st.ungranted -= granted;
            if let Some(allowance) = st.inbound_allowance.as_mut() {
                *allowance = allowance.saturating_add(granted);
            }
            trace!(session = %self.id, granted, "Returning inbound credit");
            self.send(frame);
        }
    }

    /// The application has seen EOF; pay any acknowledgment owed.
    fn observe_eof(self: &Arc<Self>, st: &mut SessionState) {
        if self.role == Role::Responder && st.owes_ack() {
            st.ack_sent = true;
            debug!(session = %self.id, "Sending acknowledgment");
            self.send(Frame::Acknowledgment { session: self.id });
            self.settle(st);
        }
    }

    fn poll_write(&self, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let mut guard = self.state.lock();
        let st = &mut *guard;
        if st.fake_output {
            return Poll::Ready(Ok(buf.len()));
        }
        if let Some(failure) = &st.failure {
            return Poll::Ready(Err(failure.to_io_error()));
        }
        if st.out_state >= HalfState::Finished {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                MuxError::InvalidState(constants::ERR_OUTPUT_FINISHED.into()),
            )));
        }
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }
        if let Some(err) = self.connection_error() {
            return Poll::Ready(Err(err));
        }

        let mut len = buf.len().min(MAX_BODY_LEN);
        if let Some(credit) = st.outbound_credit {
            if credit == 0 {
                park(&mut st.write_wakers, cx.waker());
                return Poll::Pending;
            }
            len = len.min(credit as usize);
            st.outbound_credit = Some(credit - len as u32);
        }

        let flags = DataFlags {
            open: self.open_outbound(st),
            ..DataFlags::default()
        };
        let frame = Frame::data(self.id, flags, Bytes::copy_from_slice(&buf[..len]))
            .map_err(io::Error::other)?;
        self.send(frame);
        Poll::Ready(Ok(len))
    }

    /// Send EOF on the outbound half. Idempotent.
    fn finish(self: &Arc<Self>) -> io::Result<()> {
        let mut guard = self.state.lock();
        let st = &mut *guard;
        if st.fake_output {
            return Ok(());
        }
        if let Some(failure) = &st.failure {
            return Err(failure.to_io_error());
        }
        if st.out_state >= HalfState::Finished {
            return Ok(());
        }
        if let Some(err) = self.connection_error() {
            return Err(err);
        }

        let ack_required = self.role == Role::Initiator && st.ack_requested;
        let flags = DataFlags {
            open: self.open_outbound(st),
            eof: true,
            ack_required,
            close: false,
        };
        let frame = Frame::data(self.id, flags, Bytes::new()).map_err(io::Error::other)?;
        self.send(frame);
        st.sent_ack_required = ack_required;
        match self.role {
            Role::Initiator => advance(&mut st.out_state, HalfState::Finished),
            Role::Responder => advance(&mut st.out_state, HalfState::Terminated),
        }
        debug!(session = %self.id, ack_required, "Outbound EOF sent");
        self.settle(st);
        Ok(())
    }

    /// Local abort. Idempotent.
    pub(crate) fn abort_with(self: &Arc<Self>, failure: Failure) {
        let mut guard = self.state.lock();
        let st = &mut *guard;
        let wire = match st.out_state {
            HalfState::Idle | HalfState::Terminated => None,
            HalfState::Finished if self.role == Role::Initiator => {
                Some(Frame::Close { session: self.id })
            }
            HalfState::Open | HalfState::Finished => {
                Some(Frame::abort(self.id, self.role == Role::Responder, ""))
            }
        };
        if st.out_state == HalfState::Idle {
            advance(&mut st.in_state, HalfState::Terminated);
        }
        if let Some(frame) = wire {
            debug!(session = %self.id, op = ?frame.op(), "Aborting session");
            self.send(frame);
        }
        if self.role == Role::Responder && st.out_state == HalfState::Terminated && st.owes_ack() {
            // Our EOF is already out, so nothing else on the wire releases the peer's id.
            st.ack_sent = true;
            debug!(session = %self.id, "Sending acknowledgment on abort");
            self.send(Frame::Acknowledgment { session: self.id });
        }
        advance(&mut st.out_state, HalfState::Terminated);
        if self.role == Role::Responder {
            st.ack_cancelled = true;
        }
        if !st.failure.as_ref().is_some_and(Failure::is_immediate) {
            st.failure = Some(failure);
        }
        st.fake_output = false;
        self.resolve_ack(st, false);
        st.wake_all();
        self.settle(st);
    }

    fn request_acknowledgment(&self) -> Result<()> {
        if self.role != Role::Initiator {
            return Err(MuxError::InvalidState(constants::ERR_INITIATOR_ONLY.into()));
        }
        let mut st = self.state.lock();
        if st.failure.is_some() {
            return Err(MuxError::SessionFailed(constants::ERR_SESSION_ABORTED.into()));
        }
        if st.out_state >= HalfState::Finished {
            return Err(MuxError::InvalidState(constants::ERR_OUTPUT_FINISHED.into()));
        }
        st.ack_requested = true;
        Ok(())
    }

    fn on_acknowledgment(&self, listener: AckListener) -> Result<()> {
        if self.role != Role::Initiator {
            return Err(MuxError::InvalidState(constants::ERR_INITIATOR_ONLY.into()));
        }
        let mut st = self.state.lock();
        match st.ack_outcome {
            Some(received) => self.executor.execute(move || listener(received)),
            None => st.ack_listeners.push(listener),
        }
        Ok(())
    }

    // ========== frame handlers ==========

    pub(crate) fn handle_data(self: &Arc<Self>, flags: DataFlags, payload: Bytes) -> Result<()> {
        let mut guard = self.state.lock();
        let st = &mut *guard;
        if st.in_state != HalfState::Open {
            return Err(MuxError::violation(format!(
                "data for session {} with inbound half {:?}",
                self.id, st.in_state
            )));
        }
        if self.role == Role::Initiator && (flags.open || flags.close || flags.ack_required) {
            return Err(MuxError::violation(format!(
                "initiator received data flags reserved for the initiator: {flags:?}"
            )));
        }
        if let Some(allowance) = st.inbound_allowance.as_mut() {
            if payload.len() > *allowance as usize {
                return Err(MuxError::violation(format!(
                    "ration overrun on session {}: {} bytes with {} remaining",
                    self.id,
                    payload.len(),
                    allowance
                )));
            }
            *allowance -= payload.len() as u32;
        }

        if !payload.is_empty() && st.failure.is_none() {
            st.inbound_len += payload.len();
            st.inbound.push_back(payload);
        }
        if flags.eof {
            st.eof_received = true;
            advance(&mut st.in_state, HalfState::Finished);
            if self.role == Role::Responder {
                st.received_ack_required = flags.ack_required;
            }
        }
        wake(&mut st.read_wakers);

        if flags.close {
            self.close_locked(st)?;
        }
        self.settle(st);
        Ok(())
    }

    pub(crate) fn handle_close(self: &Arc<Self>) -> Result<()> {
        let mut guard = self.state.lock();
        let st = &mut *guard;
        self.close_locked(st)?;
        self.settle(st);
        Ok(())
    }

    fn close_locked(&self, st: &mut SessionState) -> Result<()> {
        if self.role != Role::Responder {
            return Err(MuxError::violation("close received by the initiator"));
        }
        if st.in_state != HalfState::Finished {
            return Err(MuxError::violation(format!(
                "close for session {} with inbound half {:?}",
                self.id, st.in_state
            )));
        }
        if st.out_state < HalfState::Finished {
            // Keep the local writer working while telling the peer its data was cut short.
            st.fake_output = true;
            st.ack_cancelled = true;
            self.send(Frame::abort(self.id, true, ""));
        }
        advance(&mut st.out_state, HalfState::Terminated);
        advance(&mut st.in_state, HalfState::Terminated);
        if st.failure.is_none() {
            st.failure = Some(Failure::ClosedByPeer);
        }
        debug!(session = %self.id, fake_output = st.fake_output, "Session closed by peer");
        st.wake_all();
        Ok(())
    }

    pub(crate) fn handle_abort(self: &Arc<Self>, partial: bool, message: String) -> Result<()> {
        let mut guard = self.state.lock();
        let st = &mut *guard;
        if matches!(st.in_state, HalfState::Idle | HalfState::Terminated) {
            return Err(MuxError::violation(format!(
                "abort for session {} with inbound half {:?}",
                self.id, st.in_state
            )));
        }
        advance(&mut st.in_state, HalfState::Terminated);
        st.partial_delivery = Some(partial);
        if st.out_state != HalfState::Terminated {
            self.send(Frame::abort(self.id, self.role == Role::Responder, ""));
            advance(&mut st.out_state, HalfState::Terminated);
        }
        st.fake_output = false;
        st.ack_cancelled = true;
        if st.failure.is_none() {
            st.failure = Some(Failure::PeerAborted { partial, message });
        }
        debug!(session = %self.id, partial, "Session aborted by peer");
        self.resolve_ack(st, false);
        st.wake_all();
        self.settle(st);
        Ok(())
    }

    /// A new `open` arrived for this identifier; only a fully finished session may be replaced.
    pub(crate) fn handle_open(self: &Arc<Self>) -> Result<()> {
        let mut guard = self.state.lock();
        let st = &mut *guard;
        if st.in_state != HalfState::Finished || st.out_state != HalfState::Terminated {
            return Err(MuxError::violation(format!(
                "open for active session {} (in {:?}, out {:?})",
                self.id, st.in_state, st.out_state
            )));
        }
        advance(&mut st.in_state, HalfState::Terminated);
        if st.failure.is_none() {
            st.failure = Some(Failure::Superseded);
        }
        st.wake_all();
        self.remove(st);
        Ok(())
    }

    pub(crate) fn handle_acknowledgment(self: &Arc<Self>) -> Result<()> {
        let mut guard = self.state.lock();
        let st = &mut *guard;
        if self.role != Role::Initiator {
            return Err(MuxError::violation("acknowledgment received by the responder"));
        }
        if st.out_state < HalfState::Finished {
            return Err(MuxError::violation(format!(
                "acknowledgment for session {} before EOF was sent",
                self.id
            )));
        }
        if !st.sent_ack_required || st.ack_received {
            return Err(MuxError::violation(format!(
                "unexpected acknowledgment for session {}",
                self.id
            )));
        }
        st.ack_received = true;
        debug!(session = %self.id, "Acknowledgment received");
        self.resolve_ack(st, true);
        self.settle(st);
        Ok(())
    }

    pub(crate) fn handle_increment_ration(&self, shift: u8, value: u16) -> Result<()> {
        let mut st = self.state.lock();
        let Some(credit) = st.outbound_credit else {
            return Ok(());
        };
        let amount = u32::from(value) << shift;
        let credit = credit.checked_add(amount).ok_or_else(|| {
            MuxError::violation(format!(
                "ration overflow on session {}: {credit} + {amount}",
                self.id
            ))
        })?;
        st.outbound_credit = Some(credit);
        wake(&mut st.write_wakers);
        Ok(())
    }

    /// Connection went down. Runs on the executor, never under the connection lock.
    pub(crate) fn connection_down(&self, reason: DownReason) {
        let mut guard = self.state.lock();
        let st = &mut *guard;
        if st.failure.is_none() {
            st.failure = Some(Failure::ConnectionDown(reason));
        }
        st.fake_output = false;
        self.resolve_ack(st, false);
        st.wake_all();
    }
}

/// One logical duplex stream on a multiplexed connection
#[derive(Clone)]
pub struct Session {
    shared: Arc<SessionShared>,
}

impl Session {
    pub(crate) fn from_shared(shared: Arc<SessionShared>) -> Self {
        Self { shared }
    }

    pub(crate) fn shared(&self) -> &Arc<SessionShared> {
        &self.shared
    }

    pub fn id(&self) -> SessionId {
        self.shared.id
    }

    pub fn role(&self) -> Role {
        self.shared.role
    }

    /// Inbound byte stream. Only one reader should be polled at a time.
    pub fn reader(&self) -> SessionReader {
        SessionReader {
            shared: self.shared.clone(),
        }
    }

    /// Outbound byte stream. Shutting it down sends EOF.
    pub fn writer(&self) -> SessionWriter {
        SessionWriter {
            shared: self.shared.clone(),
        }
    }

    /// Abort the session. Blocked readers and writers fail immediately;
    /// other sessions on the connection are unaffected. Idempotent.
    pub fn abort(&self) {
        self.shared.abort_with(Failure::Aborted);
    }

    /// Register a listener for the end-to-end acknowledgment (initiator only).
    ///
    /// The listener runs once on the executor: `true` if the peer acknowledged
    /// EOF, `false` if the session ended first.
    pub fn on_acknowledgment<F>(&self, listener: F) -> Result<()>
    where
        F: FnOnce(bool) + Send + 'static,
    {
        self.shared.on_acknowledgment(Box::new(listener))
    }

    pub fn out_state(&self) -> HalfState {
        self.shared.state.lock().out_state
    }

    pub fn in_state(&self) -> HalfState {
        self.shared.state.lock().in_state
    }

    /// Whether the session has stopped working locally.
    pub fn is_failed(&self) -> bool {
        self.shared.state.lock().failure.is_some()
    }

    /// Partial-delivery flag from the peer's Abort, if one arrived.
    pub fn partial_delivery(&self) -> Option<bool> {
        self.shared.state.lock().partial_delivery
    }

    /// Inbound bytes buffered and not yet read.
    pub fn buffered(&self) -> usize {
        self.shared.state.lock().inbound_len
    }

    /// Remaining outbound credit; `None` when unlimited.
    pub fn outbound_credit(&self) -> Option<u32> {
        self.shared.state.lock().outbound_credit
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.shared.id)
            .field("role", &self.shared.role)
            .finish()
    }
}

/// Inbound half of a session
pub struct SessionReader {
    shared: Arc<SessionShared>,
}

impl AsyncRead for SessionReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        self.shared.poll_read(cx, buf)
    }
}

/// Outbound half of a session
pub struct SessionWriter {
    shared: Arc<SessionShared>,
}

impl SessionWriter {
    /// Ask the responder to acknowledge EOF (initiator only, before finishing).
    pub fn request_acknowledgment(&self) -> Result<()> {
        self.shared.request_acknowledgment()
    }
}

impl AsyncWrite for SessionWriter {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.shared.poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(self.shared.finish())
    }
}
