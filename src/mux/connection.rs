//! Connection engine: handshake, session table, dispatch and teardown.

use super::executor::Executor;
use super::io::{reader_loop, writer_loop, SendQueue};
use super::lock::ConnectionLock;
use super::session::{Failure, Session, SessionShared};
use crate::config::{MuxConfig, PROTOCOL_VERSION};
use crate::core::codec::{Inbound, MuxCodec};
use crate::core::frame::{DataFlags, Frame, SessionId};
use crate::error::{constants, DownReason, MuxError, Result};
use crate::protocol::handshake::{initiator_accept, responder_accept, ConnectionHeader};
use crate::utils::metrics::{Metrics, Timer};
use crate::utils::timeout::with_timeout_error;
use bytes::Bytes;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot, Mutex, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, trace, warn};

/// Which end of the connection this is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// Sends the first header and opens sessions
    Initiator,
    /// Answers the handshake and accepts sessions
    Responder,
}

/// Inspects sessions opened by the peer before they are handed to `Mux::accept`.
///
/// Runs on the reader task; it must not block.
pub trait AcceptHook: Send + Sync {
    /// Return `false` to reject the session with an Abort.
    fn on_open(&self, session: &Session) -> bool;
}

impl<F> AcceptHook for F
where
    F: Fn(&Session) -> bool + Send + Sync,
{
    fn on_open(&self, session: &Session) -> bool {
        self(session)
    }
}

type DownCallback = Box<dyn FnOnce(&DownReason) + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum HandshakeState {
    Pending,
    HeaderSent,
    Ready { version: u8, peer_ration: u32 },
}

/// Fixed table of 256 session slots with a parallel occupancy bitset
pub(crate) struct SessionTable {
    slots: Vec<Option<Arc<SessionShared>>>,
    in_use: [u64; 4],
    count: usize,
}

impl SessionTable {
    fn new() -> Self {
        Self {
            slots: vec![None; SessionId::MAX + 1],
            in_use: [0; 4],
            count: 0,
        }
    }

    fn bit(id: SessionId) -> (usize, u64) {
        (id.index() / 64, 1u64 << (id.index() % 64))
    }

    fn is_set(&self, id: SessionId) -> bool {
        let (word, mask) = Self::bit(id);
        self.in_use[word] & mask != 0
    }

    pub(crate) fn get(&self, id: SessionId) -> Option<&Arc<SessionShared>> {
        let slot = self.slots[id.index()].as_ref();
        debug_assert_eq!(slot.is_some(), self.is_set(id));
        slot
    }

    fn insert(&mut self, session: Arc<SessionShared>) -> bool {
        let id = session.id();
        if self.is_set(id) {
            return false;
        }
        let (word, mask) = Self::bit(id);
        self.in_use[word] |= mask;
        self.slots[id.index()] = Some(session);
        self.count += 1;
        true
    }

    fn remove(&mut self, session: &Arc<SessionShared>) -> bool {
        let id = session.id();
        match &self.slots[id.index()] {
            Some(current) if Arc::ptr_eq(current, session) => {
                let (word, mask) = Self::bit(id);
                self.in_use[word] &= !mask;
                self.slots[id.index()] = None;
                self.count -= 1;
                true
            }
            _ => false,
        }
    }

    /// Lowest identifier not in use.
    fn first_free(&self) -> Option<SessionId> {
        self.in_use.iter().enumerate().find_map(|(word, bits)| {
            (*bits != u64::MAX).then(|| SessionId::new((word * 64) as u8 + bits.trailing_ones() as u8))
        })
    }

    fn snapshot(&self) -> Vec<Arc<SessionShared>> {
        self.slots.iter().flatten().cloned().collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.count
    }
}

/// Connection state guarded by the connection lock
pub(crate) struct ConnState {
    pub(crate) queue: SendQueue,
    pub(crate) sessions: SessionTable,
    pub(crate) down: Option<DownReason>,
    handshake: HandshakeState,
    pings: HashMap<u16, oneshot::Sender<()>>,
    accept_tx: Option<mpsc::UnboundedSender<Session>>,
    on_down: Option<DownCallback>,
}

pub(crate) struct MuxShared {
    pub(crate) role: Role,
    pub(crate) config: MuxConfig,
    pub(crate) executor: Executor,
    pub(crate) metrics: Metrics,
    pub(crate) state: ConnectionLock<ConnState>,
    pub(crate) writer_wake: Notify,
    pub(crate) ready: Notify,
    pub(crate) down: CancellationToken,
    accept_hook: Option<Arc<dyn AcceptHook>>,
}

impl MuxShared {
    pub(crate) fn down_reason(&self) -> Option<DownReason> {
        self.state.lock().down.clone()
    }

    pub(crate) fn down_reason_or_default(&self) -> DownReason {
        self.down_reason()
            .unwrap_or_else(|| DownReason::new(constants::ERR_CONNECTION_CLOSED, None))
    }

    /// Tear the connection down. Only the first call has any effect.
    pub(crate) fn set_down(&self, reason: DownReason) -> bool {
        let (sessions, callback) = {
            let mut state = self.state.lock();
            if state.down.is_some() {
                return false;
            }
            state.down = Some(reason.clone());
            // Dropping the senders fails every outstanding ping.
            state.pings.clear();
            state.accept_tx = None;
            (state.sessions.snapshot(), state.on_down.take())
        };

        self.down.cancel();
        self.writer_wake.notify_one();
        self.ready.notify_waiters();
        self.metrics.connection_down();
        warn!(role = ?self.role, sessions = sessions.len(), reason = %reason, "Connection down");
        self.metrics.log_metrics();

        for session in sessions {
            let reason = reason.clone();
            self.executor.execute(move || session.connection_down(reason));
        }
        if let Some(callback) = callback {
            callback(&reason);
        }
        true
    }

    pub(crate) fn remove_session(&self, session: &Arc<SessionShared>) -> bool {
        let removed = {
            let mut state = self.state.lock();
            if state.down.is_some() {
                return false;
            }
            state.sessions.remove(session)
        };
        if removed {
            self.metrics.session_closed();
        }
        removed
    }

    fn lookup(&self, id: SessionId) -> Option<Arc<SessionShared>> {
        self.state.lock().sessions.get(id).cloned()
    }

    fn peer_ration(&self) -> u32 {
        match self.state.lock().handshake {
            HandshakeState::Ready { peer_ration, .. } => peer_ration,
            _ => 0,
        }
    }

    /// Handle one parsed item. Errors are fatal to the connection.
    pub(crate) fn dispatch(self: &Arc<Self>, item: Inbound) -> Result<()> {
        match item {
            Inbound::Handshake(header) => self.handle_handshake(header),
            Inbound::Frame(frame) => {
                self.metrics.frame_received();
                trace!(op = ?frame.op(), session = ?frame.session(), "Frame received");
                self.handle_frame(frame)
            }
        }
    }

    fn handle_handshake(&self, header: ConnectionHeader) -> Result<()> {
        match self.role {
            Role::Responder => {
                self.metrics.handshake_attempt();
                let version = responder_accept(&header, PROTOCOL_VERSION)?;
                let reply =
                    ConnectionHeader::responder(version, self.config.initial_inbound_ration)?
                        .to_bytes()?;
                {
                    let mut state = self.state.lock();
                    state.handshake = HandshakeState::Ready {
                        version,
                        peer_ration: header.ration,
                    };
                }
                self.send_raw(Bytes::copy_from_slice(&reply));
                self.metrics.handshake_success();
                info!(version, peer_ration = header.ration, "Handshake complete (responder)");
            }
            Role::Initiator => {
                let version = initiator_accept(&header, PROTOCOL_VERSION)?;
                {
                    let mut state = self.state.lock();
                    if state.handshake != HandshakeState::HeaderSent {
                        return Err(MuxError::Handshake(
                            "responder header arrived before ours was sent".into(),
                        ));
                    }
                    state.handshake = HandshakeState::Ready {
                        version,
                        peer_ration: header.ration,
                    };
                }
                self.metrics.handshake_success();
                info!(version, peer_ration = header.ration, "Handshake complete (initiator)");
            }
        }
        self.ready.notify_waiters();
        Ok(())
    }

    fn handle_frame(self: &Arc<Self>, frame: Frame) -> Result<()> {
        match frame {
            Frame::NoOp { .. } => Ok(()),
            Frame::Shutdown { message } => {
                if self.role == Role::Responder {
                    return Err(MuxError::violation("shutdown received by the responder"));
                }
                info!(message = %message, "Peer shut the connection down");
                self.set_down(DownReason::new(
                    constants::ERR_PEER_SHUTDOWN,
                    Some(MuxError::PeerError(message)),
                ));
                Ok(())
            }
            Frame::Ping { cookie } => {
                self.async_send(Frame::PingAck { cookie }, None);
                Ok(())
            }
            Frame::PingAck { cookie } => {
                let waiter = self.state.lock().pings.remove(&cookie);
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(());
                    }
                    None => debug!(cookie, "Ignoring ping-ack with unknown cookie"),
                }
                Ok(())
            }
            Frame::Error { message } => {
                self.set_down(DownReason::new(
                    constants::ERR_PEER_ERROR,
                    Some(MuxError::PeerError(message)),
                ));
                Ok(())
            }
            Frame::Data {
                session,
                flags,
                payload,
            } if flags.open => self.accept_open(session, flags, payload),
            frame => self.dispatch_to_session(frame),
        }
    }

    fn dispatch_to_session(&self, frame: Frame) -> Result<()> {
        let Some(id) = frame.session() else {
            return Err(MuxError::violation(format!("unexpected frame {:?}", frame.op())));
        };
        let Some(session) = self.lookup(id) else {
            if let Frame::IncrementRation { .. } = frame {
                // Credit may still be in flight after the session ended.
                trace!(session = %id, "Ignoring increment for inactive session");
                return Ok(());
            }
            return Err(MuxError::violation(format!(
                "{:?} for inactive session {id}",
                frame.op()
            )));
        };
        match frame {
            Frame::IncrementRation { shift, value, .. } => {
                session.handle_increment_ration(shift, value)
            }
            Frame::Abort {
                partial, message, ..
            } => session.handle_abort(partial, message),
            Frame::Close { .. } => session.handle_close(),
            Frame::Acknowledgment { .. } => session.handle_acknowledgment(),
            Frame::Data { flags, payload, .. } => session.handle_data(flags, payload),
            other => Err(MuxError::violation(format!(
                "unexpected frame {:?}",
                other.op()
            ))),
        }
    }

    /// Responder: an `open` data frame creates a session, replacing a finished one.
    fn accept_open(self: &Arc<Self>, id: SessionId, flags: DataFlags, payload: Bytes) -> Result<()> {
        if self.role == Role::Initiator {
            return Err(MuxError::violation(format!(
                "open for session {id} received by the initiator"
            )));
        }
        if let Some(stale) = self.lookup(id) {
            stale.handle_open()?;
        }

        let shared = SessionShared::new(
            id,
            Role::Responder,
            Arc::downgrade(self),
            self.executor.clone(),
            self.peer_ration(),
            self.config.initial_inbound_ration,
        );
        {
            let mut state = self.state.lock();
            if state.down.is_some() {
                return Ok(());
            }
            if !state.sessions.insert(shared.clone()) {
                return Err(MuxError::violation(format!("session {id} is still in use")));
            }
        }
        self.metrics.session_accepted();
        debug!(session = %id, "Session opened by peer");
        shared.handle_data(flags, payload)?;

        let session = Session::from_shared(shared);
        if let Some(hook) = &self.accept_hook {
            if !hook.on_open(&session) {
                info!(session = %id, "Session rejected by accept hook");
                session.shared().abort_with(Failure::Vetoed);
                return Ok(());
            }
        }
        let tx = self.state.lock().accept_tx.clone();
        if let Some(tx) = tx {
            let _ = tx.send(session);
        }
        Ok(())
    }
}

/// Builder for [`Mux`]
pub struct MuxBuilder {
    role: Role,
    config: MuxConfig,
    executor: Option<Executor>,
    accept_hook: Option<Arc<dyn AcceptHook>>,
    on_down: Option<DownCallback>,
}

impl MuxBuilder {
    pub fn new(role: Role) -> Self {
        Self {
            role,
            config: MuxConfig::default(),
            executor: None,
            accept_hook: None,
            on_down: None,
        }
    }

    pub fn initiator() -> Self {
        Self::new(Role::Initiator)
    }

    pub fn responder() -> Self {
        Self::new(Role::Responder)
    }

    pub fn config(mut self, config: MuxConfig) -> Self {
        self.config = config;
        self
    }

    /// Executor for the I/O loops and notifications. Defaults to the current runtime.
    pub fn executor(mut self, executor: Executor) -> Self {
        self.executor = Some(executor);
        self
    }

    pub fn accept_hook<H>(mut self, hook: H) -> Self
    where
        H: AcceptHook + 'static,
    {
        let hook: Arc<dyn AcceptHook> = Arc::new(hook);
        self.accept_hook = Some(hook);
        self
    }

    /// Callback invoked exactly once when the connection goes down.
    pub fn on_down<F>(mut self, callback: F) -> Self
    where
        F: FnOnce(&DownReason) + Send + 'static,
    {
        let callback: DownCallback = Box::new(callback);
        self.on_down = Some(callback);
        self
    }

    /// Spawn the reader and writer loops over `io`.
    ///
    /// # Errors
    /// `ConfigError` for an invalid configuration, `InvalidState` when no
    /// executor was given and none is available.
    pub fn build<T>(self, io: T) -> Result<Mux>
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        self.config.validate_strict()?;
        let executor = match self.executor {
            Some(executor) => executor,
            None => Executor::current()?,
        };
        let (accept_tx, accept_rx) = mpsc::unbounded_channel();
        let accept_tx = (self.role == Role::Responder).then_some(accept_tx);

        let shared = Arc::new(MuxShared {
            role: self.role,
            config: self.config,
            executor: executor.clone(),
            metrics: Metrics::new(),
            state: ConnectionLock::new(ConnState {
                queue: SendQueue::default(),
                sessions: SessionTable::new(),
                down: None,
                handshake: HandshakeState::Pending,
                pings: HashMap::new(),
                accept_tx,
                on_down: self.on_down,
            }),
            writer_wake: Notify::new(),
            ready: Notify::new(),
            down: CancellationToken::new(),
            accept_hook: self.accept_hook,
        });

        let codec = match self.role {
            Role::Initiator => MuxCodec::initiator(),
            Role::Responder => MuxCodec::responder(),
        };
        let (read_half, write_half) = tokio::io::split(io);
        executor.spawn(reader_loop(shared.clone(), read_half, codec));
        executor.spawn(writer_loop(shared.clone(), write_half));
        debug!(role = ?shared.role, "Connection engine started");

        Ok(Mux {
            shared,
            incoming: Mutex::new(accept_rx),
        })
    }
}

/// A multiplexed connection.
///
/// Dropping the handle tears the connection down.
pub struct Mux {
    shared: Arc<MuxShared>,
    incoming: Mutex<mpsc::UnboundedReceiver<Session>>,
}

impl Mux {
    /// Complete the handshake.
    ///
    /// The initiator sends its header and waits, bounded by the configured
    /// handshake timeout, for a valid responder header. The responder answers
    /// from the reader loop and returns immediately.
    ///
    /// # Errors
    /// `Timeout` if the responder did not answer in time (the connection is
    /// torn down), `ConnectionDown` if it went down first, `InvalidState` if
    /// called twice on the initiator.
    #[instrument(skip(self), fields(role = ?self.shared.role))]
    pub async fn start(&self) -> Result<()> {
        if self.shared.role == Role::Responder {
            return Ok(());
        }

        let header = ConnectionHeader::initiator(
            self.shared.config.initial_inbound_ration,
            self.shared.config.negotiate_version,
        )?
        .to_bytes()?;
        {
            let mut state = self.shared.state.lock();
            if let Some(reason) = &state.down {
                return Err(MuxError::ConnectionDown(reason.clone()));
            }
            if state.handshake != HandshakeState::Pending {
                return Err(MuxError::InvalidState(constants::ERR_ALREADY_STARTED.into()));
            }
            state.handshake = HandshakeState::HeaderSent;
        }
        self.shared.metrics.handshake_attempt();
        self.shared.send_raw(Bytes::copy_from_slice(&header));
        let _timer = Timer::start("handshake");

        let shared = self.shared.clone();
        let wait = async move {
            loop {
                let notified = shared.ready.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                {
                    let state = shared.state.lock();
                    if let Some(reason) = &state.down {
                        return Err(MuxError::ConnectionDown(reason.clone()));
                    }
                    if let HandshakeState::Ready { .. } = state.handshake {
                        return Ok(());
                    }
                }
                notified.await;
            }
        };

        match with_timeout_error(wait, self.shared.config.handshake_timeout).await {
            Err(MuxError::Timeout) => {
                self.shared.metrics.handshake_failed();
                self.shared.set_down(DownReason::new(
                    constants::ERR_HANDSHAKE_TIMEOUT,
                    Some(MuxError::Timeout),
                ));
                Err(MuxError::Timeout)
            }
            other => other,
        }
    }

    /// Open a new session (initiator only).
    ///
    /// Nothing is sent until the first write or EOF.
    pub fn open(&self) -> Result<Session> {
        if self.shared.role != Role::Initiator {
            return Err(MuxError::InvalidState(constants::ERR_INITIATOR_ONLY.into()));
        }
        let shared = {
            let mut state = self.shared.state.lock();
            if let Some(reason) = &state.down {
                return Err(MuxError::ConnectionDown(reason.clone()));
            }
            let HandshakeState::Ready { peer_ration, .. } = state.handshake else {
                return Err(MuxError::InvalidState(constants::ERR_HANDSHAKE_INCOMPLETE.into()));
            };
            let id = state
                .sessions
                .first_free()
                .ok_or(MuxError::SessionsExhausted)?;
            let shared = SessionShared::new(
                id,
                Role::Initiator,
                Arc::downgrade(&self.shared),
                self.shared.executor.clone(),
                peer_ration,
                self.shared.config.initial_inbound_ration,
            );
            state.sessions.insert(shared.clone());
            shared
        };
        self.shared.metrics.session_opened();
        debug!(session = %shared.id(), "Session opened");
        Ok(Session::from_shared(shared))
    }

    /// Next session opened by the peer (responder only).
    ///
    /// Returns `None` once the connection is down and every accepted session
    /// has been taken, or immediately on the initiator.
    pub async fn accept(&self) -> Option<Session> {
        self.incoming.lock().await.recv().await
    }

    /// Round-trip a ping.
    ///
    /// # Errors
    /// `Timeout` if no matching ping-ack arrives in time (the connection stays
    /// up), `ConnectionDown` if the connection goes down first.
    #[instrument(skip(self), fields(role = ?self.shared.role))]
    pub async fn ping(&self, timeout: Duration) -> Result<Duration> {
        let (tx, rx) = oneshot::channel();
        let cookie = {
            let mut state = self.shared.state.lock();
            if let Some(reason) = &state.down {
                return Err(MuxError::ConnectionDown(reason.clone()));
            }
            if !matches!(state.handshake, HandshakeState::Ready { .. }) {
                return Err(MuxError::InvalidState(constants::ERR_HANDSHAKE_INCOMPLETE.into()));
            }
            let mut cookie = rand::random::<u16>();
            while state.pings.contains_key(&cookie) {
                cookie = cookie.wrapping_add(1);
            }
            state.pings.insert(cookie, tx);
            cookie
        };

        let started = Instant::now();
        self.shared.async_send(Frame::Ping { cookie }, None);
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(())) => Ok(started.elapsed()),
            Ok(Err(_)) => Err(MuxError::ConnectionDown(self.shared.down_reason_or_default())),
            Err(_) => {
                self.shared.state.lock().pings.remove(&cookie);
                Err(MuxError::Timeout)
            }
        }
    }

    /// Gracefully end the connection (responder only).
    ///
    /// Sends a Shutdown frame, waits for it to be flushed within the
    /// configured shutdown timeout, then tears down.
    #[instrument(skip(self), fields(role = ?self.shared.role))]
    pub async fn shutdown(&self, message: &str) -> Result<()> {
        if self.shared.role != Role::Responder {
            return Err(MuxError::InvalidState(constants::ERR_RESPONDER_ONLY.into()));
        }
        let flushed = self
            .shared
            .future_send(Frame::shutdown(message), None)
            .wait_timeout(self.shared.config.shutdown_timeout)
            .await;
        self.shared.set_down(DownReason::new(
            constants::ERR_LOCAL_SHUTDOWN,
            Some(MuxError::PeerError(message.to_owned())),
        ));
        flushed.map(|_| ())
    }

    /// Tear the connection down immediately. Idempotent.
    pub fn teardown(&self, message: &str) {
        self.shared.set_down(DownReason::new(message, None));
    }

    pub fn is_down(&self) -> bool {
        self.shared.down.is_cancelled()
    }

    pub fn down_reason(&self) -> Option<DownReason> {
        self.shared.down_reason()
    }

    /// Resolves once the connection is down.
    pub async fn closed(&self) {
        self.shared.down.cancelled().await;
    }

    pub fn role(&self) -> Role {
        self.shared.role
    }

    /// Negotiated protocol version, once the handshake completed.
    pub fn version(&self) -> Option<u8> {
        match self.shared.state.lock().handshake {
            HandshakeState::Ready { version, .. } => Some(version),
            _ => None,
        }
    }

    pub fn metrics(&self) -> &Metrics {
        &self.shared.metrics
    }

    pub fn config(&self) -> &MuxConfig {
        &self.shared.config
    }

    /// Sessions currently in the table.
    pub fn active_sessions(&self) -> usize {
        self.shared.state.lock().sessions.len()
    }
}

impl fmt::Debug for Mux {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mux")
            .field("role", &self.shared.role)
            .field("down", &self.is_down())
            .finish()
    }
}

impl Drop for Mux {
    fn drop(&mut self) {
        self.shared
            .set_down(DownReason::new(constants::ERR_MUX_DROPPED, None));
    }
}
