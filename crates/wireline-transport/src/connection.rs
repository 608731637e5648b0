//! The multiplexed connection state machine.
//!
//! A connection moves strictly forward through its lifecycle:
//!
//! ```text
//! Connecting -> Negotiating -> [Authenticating ->] Ready -> Defunct | Closed
//! ```
//!
//! All mutable state lives behind one mutex. Reactor callbacks, timer
//! callbacks, and caller threads all funnel through it, and every result
//! delivery (response, timeout, connection failure) happens after the lock is
//! released so caller code never runs under it.

use std::collections::VecDeque;
use std::io;
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::time::{Duration, Instant};

use wireline_core::{
    ConnectError, ConnectionConfig, DefunctReason, Error, HandshakeError,
    MonotonicTimestampGenerator, Result,
};

use crate::auth::{Authenticator, ChallengeResponse};
use crate::codec::FrameCodec;
use crate::protocol::{ConnectionInfo, Opcode, Request, Response};
use crate::reactor::{EventHandler, Reactor, ReactorToken};
use crate::socket::{self, Socket};
use crate::stream::{PendingRequest, ResponseCell, ResponseHandle, ResultSink, StreamTable};
use crate::timer::{TimerHandle, TimerWheel};

/// How many consecutive unanswered heartbeats render the connection defunct.
const HEARTBEAT_MISS_LIMIT: u32 = 2;

const READ_CHUNK: usize = 8 * 1024;

// ==================== Lifecycle ====================

/// Connection lifecycle state. Transitions are strictly forward; `Defunct`
/// and `Closed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Transport established, startup not yet sent.
    Connecting,
    /// Startup sent, awaiting the server's verdict.
    Negotiating,
    /// Authentication exchange in progress.
    Authenticating,
    /// Open for requests.
    Ready,
    /// Failed; all pending requests have been errored out.
    Defunct,
    /// Closed gracefully.
    Closed,
}

impl ConnectionState {
    pub fn name(self) -> &'static str {
        match self {
            ConnectionState::Connecting => "connecting",
            ConnectionState::Negotiating => "negotiating",
            ConnectionState::Authenticating => "authenticating",
            ConnectionState::Ready => "ready",
            ConnectionState::Defunct => "defunct",
            ConnectionState::Closed => "closed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, ConnectionState::Defunct | ConnectionState::Closed)
    }
}

/// Pool-level hook notified when a connection leaves service.
pub trait ConnectionObserver: Send + Sync {
    fn on_defunct(&self, _info: &ConnectionInfo, _error: &Error) {}

    fn on_closed(&self, _info: &ConnectionInfo) {}
}

/// Everything a connection needs besides its socket and config: shared
/// services and optional per-connection collaborators.
pub struct ConnectionSetup {
    pub reactor: Arc<dyn Reactor>,
    pub timers: Arc<TimerWheel>,
    pub timestamps: Option<Arc<MonotonicTimestampGenerator>>,
    pub authenticator: Option<Box<dyn Authenticator>>,
    pub observer: Option<Arc<dyn ConnectionObserver>>,
}

impl ConnectionSetup {
    pub fn new(reactor: Arc<dyn Reactor>, timers: Arc<TimerWheel>) -> Self {
        Self {
            reactor,
            timers,
            timestamps: None,
            authenticator: None,
            observer: None,
        }
    }

    pub fn timestamps(mut self, generator: Arc<MonotonicTimestampGenerator>) -> Self {
        self.timestamps = Some(generator);
        self
    }

    pub fn authenticator(mut self, authenticator: impl Authenticator + 'static) -> Self {
        self.authenticator = Some(Box::new(authenticator));
        self
    }

    pub fn observer(mut self, observer: Arc<dyn ConnectionObserver>) -> Self {
        self.observer = Some(observer);
        self
    }
}

// ==================== Internal state ====================

/// One queued outbound write, partially flushed across writability events.
#[derive(Debug)]
struct Chunk {
    bytes: Vec<u8>,
    pos: usize,
}

struct Inner<S: Socket> {
    socket: S,
    state: ConnectionState,
    codec: FrameCodec,
    streams: StreamTable,
    write_queue: VecDeque<Chunk>,
    token: Option<ReactorToken>,
    authenticator: Option<Box<dyn Authenticator>>,
    heartbeat_timer: Option<TimerHandle>,
    heartbeat_misses: u32,
    last_activity: Instant,
    next_seq: u64,
    defunct_reason: Option<DefunctReason>,
}

/// A stream-multiplexed connection over one socket.
///
/// The connection registers itself as the reactor event handler for its
/// socket; `send` only enqueues, and all socket I/O happens from readiness
/// callbacks.
pub struct Connection<S: Socket + 'static> {
    inner: Mutex<Inner<S>>,
    state_cond: Condvar,
    config: ConnectionConfig,
    info: ConnectionInfo,
    reactor: Arc<dyn Reactor>,
    timers: Arc<TimerWheel>,
    timestamps: Option<Arc<MonotonicTimestampGenerator>>,
    observer: Option<Arc<dyn ConnectionObserver>>,
    weak: Weak<Connection<S>>,
}

impl<S: Socket + 'static> Connection<S> {
    /// Take ownership of an established socket, register it with the reactor,
    /// and start the handshake. Returns as soon as the startup frame is
    /// queued; use [`wait_until_ready`](Self::wait_until_ready) to block for
    /// the outcome.
    pub fn establish(socket: S, config: ConnectionConfig, setup: ConnectionSetup)
    -> Result<Arc<Self>> {
        config.validate().map_err(Error::Config)?;

        let info = ConnectionInfo {
            remote: socket.peer_label(),
            protocol_version: config.protocol_version,
        };
        let codec = FrameCodec::new(config.protocol_version, config.max_frame_size);
        let streams = StreamTable::new(config.effective_stream_limit());

        let connection = Arc::new_cyclic(|weak| Connection {
            inner: Mutex::new(Inner {
                socket,
                state: ConnectionState::Connecting,
                codec,
                streams,
                write_queue: VecDeque::new(),
                token: None,
                authenticator: setup.authenticator,
                heartbeat_timer: None,
                heartbeat_misses: 0,
                last_activity: Instant::now(),
                next_seq: 0,
                defunct_reason: None,
            }),
            state_cond: Condvar::new(),
            config,
            info,
            reactor: setup.reactor,
            timers: setup.timers,
            timestamps: setup.timestamps,
            observer: setup.observer,
            weak: weak.clone(),
        });

        {
            let mut inner = connection.lock_inner();
            let token = connection
                .reactor
                .register(&inner.socket, Arc::clone(&connection) as Arc<dyn EventHandler>)?;
            inner.token = Some(token);
        }

        connection.begin_handshake();
        Ok(connection)
    }

    // ==================== Public surface ====================

    /// Submit a request on a free stream.
    ///
    /// Only legal in `Ready`; other states report why. Stream exhaustion is
    /// `AllStreamsBusy`, an immediate error rather than a wait.
    pub fn send(&self, request: Request) -> Result<ResponseHandle> {
        let mut inner = self.lock_inner();
        match inner.state {
            ConnectionState::Ready => {}
            ConnectionState::Defunct => {
                return Err(Error::ConnectionDefunct(
                    inner
                        .defunct_reason
                        .clone()
                        .unwrap_or(DefunctReason::Disconnected),
                ));
            }
            ConnectionState::Closed => return Err(Error::ConnectionClosed),
            other => return Err(Error::NotReady { state: other.name() }),
        }

        let cell = ResponseCell::new();
        let (stream_id, timestamp) = self.submit(
            &mut inner,
            &request,
            ResultSink::Handle(Arc::clone(&cell)),
            self.config.request_timeout,
        )?;
        drop(inner);
        Ok(ResponseHandle::new(cell, stream_id, timestamp))
    }

    /// Block until the handshake resolves, one way or the other.
    pub fn wait_until_ready(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let mut inner = self.lock_inner();
        loop {
            match inner.state {
                ConnectionState::Ready => return Ok(()),
                ConnectionState::Defunct => {
                    // A failed handshake is the caller's answer here; other
                    // reasons surface as the connection-wide error.
                    return Err(match inner.defunct_reason.clone() {
                        Some(DefunctReason::HandshakeFailed(err)) => Error::Handshake(err),
                        Some(reason) => Error::ConnectionDefunct(reason),
                        None => Error::ConnectionDefunct(DefunctReason::Disconnected),
                    });
                }
                ConnectionState::Closed => return Err(Error::ConnectionClosed),
                _ => {}
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(Error::ConnectTimeout(ConnectError {
                    remote: self.info.remote.clone(),
                    message: "handshake did not complete within the connect timeout".to_string(),
                    source: None,
                }));
            }
            let (next, _) = self
                .state_cond
                .wait_timeout(inner, deadline - now)
                .unwrap_or_else(|e| e.into_inner());
            inner = next;
        }
    }

    /// Close gracefully. Pending requests fail with `ConnectionClosed`.
    /// Idempotent; a no-op on an already-terminal connection.
    pub fn close(&self) {
        let drained = {
            let mut inner = self.lock_inner();
            if inner.state.is_terminal() {
                return;
            }
            inner.state = ConnectionState::Closed;
            self.teardown(&mut inner)
        };
        self.state_cond.notify_all();

        for pending in drained {
            pending.complete(Err(Error::ConnectionClosed));
        }
        tracing::debug!(remote = %self.info.remote, "connection closed");
        if let Some(observer) = &self.observer {
            observer.on_closed(&self.info);
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.lock_inner().state
    }

    /// Requests currently awaiting responses.
    pub fn in_flight(&self) -> usize {
        self.lock_inner().streams.in_flight()
    }

    pub fn info(&self) -> &ConnectionInfo {
        &self.info
    }

    // ==================== Submission ====================

    /// Acquire a stream, encode, bind, and enqueue one request. Caller holds
    /// the lock and has already checked state.
    fn submit(
        &self,
        inner: &mut Inner<S>,
        request: &Request,
        sink: ResultSink,
        timeout: Duration,
    ) -> Result<(i32, Option<u64>)> {
        let stream_id = inner.streams.acquire()?;

        let encoded = match inner.codec.encode(stream_id, request.opcode, &request.body) {
            Ok(bytes) => bytes,
            Err(e) => {
                inner.streams.release(stream_id);
                return Err(e);
            }
        };

        let timestamp = if request.needs_timestamp {
            self.timestamps.as_ref().map(|g| g.next_timestamp())
        } else {
            None
        };

        let seq = inner.next_seq;
        inner.next_seq += 1;

        let weak = self.weak.clone();
        let timer = self.timers.schedule(timeout, move || {
            if let Some(connection) = weak.upgrade() {
                connection.on_request_timeout(stream_id, seq);
            }
        });

        inner.streams.bind(
            stream_id,
            PendingRequest {
                stream_id,
                seq,
                timer: Some(timer),
                sink,
            },
        );

        let was_idle = inner.write_queue.is_empty();
        inner.write_queue.push_back(Chunk {
            bytes: encoded,
            pos: 0,
        });
        if was_idle {
            self.arm_write(inner);
        }
        Ok((stream_id, timestamp))
    }

    /// Ask the reactor for a writability callback. Registration errors here
    /// are logged, not propagated: the request is already bound and will be
    /// reclaimed by its timeout if the write never happens.
    fn arm_write(&self, inner: &Inner<S>) {
        if let Some(token) = inner.token {
            if let Err(e) = self.reactor.request_write_notification(token) {
                tracing::warn!(remote = %self.info.remote, error = %e,
                    "failed to arm write notification");
            }
        }
    }

    // ==================== Readiness callbacks ====================

    fn handle_readable(&self) {
        let mut completions: Vec<(PendingRequest, Result<Response>)> = Vec::new();
        let mut fatal: Option<DefunctReason> = None;
        let mut read_failed: Option<DefunctReason> = None;

        {
            let mut inner = self.lock_inner();
            if inner.state.is_terminal() {
                return;
            }

            let mut buf = [0u8; READ_CHUNK];
            loop {
                match inner.socket.read(&mut buf) {
                    Ok(0) => {
                        read_failed = Some(DefunctReason::Disconnected);
                        break;
                    }
                    Ok(n) => inner.codec.feed(&buf[..n]),
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                    Err(e) => {
                        read_failed = Some(DefunctReason::Io(e.to_string()));
                        break;
                    }
                }
            }

            // Frames that fully arrived before an EOF or read error still
            // belong to their callers; drain the codec before acting on the
            // failure.
            while fatal.is_none() {
                match inner.codec.next_frame() {
                    Ok(Some(frame)) => match inner.streams.resolve(frame.stream_id) {
                        Ok(mut pending) => {
                            if let Some(timer) = pending.timer.take() {
                                self.timers.cancel(timer);
                            }
                            inner.heartbeat_misses = 0;
                            inner.last_activity = Instant::now();
                            completions.push((pending, Ok(Response::from_frame(frame))));
                        }
                        Err(_) => {
                            fatal = Some(DefunctReason::ProtocolDesync(format!(
                                "response for stream id {} with no pending request",
                                frame.stream_id
                            )));
                        }
                    },
                    Ok(None) => break,
                    Err(e) => {
                        fatal = Some(DefunctReason::ProtocolDesync(e.to_string()));
                    }
                }
            }
        }

        for (pending, result) in completions {
            pending.complete(result);
        }
        if let Some(reason) = fatal.or(read_failed) {
            self.mark_defunct(reason);
        }
    }

    fn handle_writable(&self) {
        let mut fatal: Option<DefunctReason> = None;

        {
            let mut inner = self.lock_inner();
            if inner.state.is_terminal() {
                return;
            }

            let mut rearm = false;
            {
                let Inner {
                    socket,
                    write_queue,
                    ..
                } = &mut *inner;
                while let Some(chunk) = write_queue.front_mut() {
                    match socket.write(&chunk.bytes[chunk.pos..]) {
                        Ok(0) => {
                            rearm = true;
                            break;
                        }
                        Ok(n) => {
                            chunk.pos += n;
                            if chunk.pos == chunk.bytes.len() {
                                write_queue.pop_front();
                            }
                        }
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                            rearm = true;
                            break;
                        }
                        Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                        Err(e) => {
                            fatal = Some(DefunctReason::Io(e.to_string()));
                            break;
                        }
                    }
                }
            }
            if rearm {
                self.arm_write(&inner);
            }
        }

        if let Some(reason) = fatal {
            self.mark_defunct(reason);
        }
    }

    /// Timer callback for one request's deadline. The sequence number guards
    /// against the id having been freed and reused: a stale timer for a
    /// completed request finds nothing to do.
    fn on_request_timeout(&self, stream_id: i32, seq: u64) {
        let pending = {
            let mut inner = self.lock_inner();
            inner.streams.resolve_matching(stream_id, seq)
        };
        if let Some(pending) = pending {
            tracing::debug!(remote = %self.info.remote, stream_id, "request timed out");
            pending.complete(Err(Error::RequestTimeout));
        }
    }

    // ==================== Handshake ====================

    fn begin_handshake(self: &Arc<Self>) {
        let weak = self.weak.clone();
        let submitted = {
            let mut inner = self.lock_inner();
            inner.state = ConnectionState::Negotiating;
            self.submit(
                &mut inner,
                &Request::startup(Vec::new()),
                ResultSink::Callback(Box::new(move |result| {
                    if let Some(connection) = weak.upgrade() {
                        connection.on_negotiate_response(result);
                    }
                })),
                self.config.connect_timeout,
            )
        };
        if let Err(e) = submitted {
            self.mark_defunct(DefunctReason::HandshakeFailed(HandshakeError::negotiation(
                e.to_string(),
            )));
        }
    }

    fn on_negotiate_response(self: &Arc<Self>, result: Result<Response>) {
        match result {
            Ok(response) => match response.opcode {
                Opcode::Ready => self.finish_handshake(),
                Opcode::Authenticate => self.start_authentication(),
                Opcode::Error => self.mark_defunct(DefunctReason::HandshakeFailed(
                    HandshakeError::negotiation("server rejected startup"),
                )),
                other => self.mark_defunct(DefunctReason::HandshakeFailed(
                    HandshakeError::unexpected_frame(format!(
                        "unexpected opcode {:#04x} in response to startup",
                        other.to_u8()
                    )),
                )),
            },
            Err(Error::ConnectionDefunct(_) | Error::ConnectionClosed) => {}
            Err(e) => self.mark_defunct(DefunctReason::HandshakeFailed(
                HandshakeError::negotiation(e.to_string()),
            )),
        }
    }

    fn start_authentication(self: &Arc<Self>) {
        let weak = self.weak.clone();
        let submitted = {
            let mut inner = self.lock_inner();
            inner.state = ConnectionState::Authenticating;
            let Some(authenticator) = inner.authenticator.as_mut() else {
                drop(inner);
                self.mark_defunct(DefunctReason::HandshakeFailed(
                    HandshakeError::authentication(
                        "server requires authentication but no authenticator is configured",
                    ),
                ));
                return;
            };
            let token = authenticator.initial_response();
            self.submit(
                &mut inner,
                &Request::auth_response(token),
                ResultSink::Callback(Box::new(move |result| {
                    if let Some(connection) = weak.upgrade() {
                        connection.on_auth_response(result);
                    }
                })),
                self.config.connect_timeout,
            )
        };
        if let Err(e) = submitted {
            self.mark_defunct(DefunctReason::HandshakeFailed(
                HandshakeError::authentication(e.to_string()),
            ));
        }
    }

    fn on_auth_response(self: &Arc<Self>, result: Result<Response>) {
        match result {
            Ok(response) => match response.opcode {
                Opcode::AuthSuccess => {
                    {
                        let mut inner = self.lock_inner();
                        if let Some(authenticator) = inner.authenticator.as_mut() {
                            authenticator.on_success(&response.body);
                        }
                    }
                    self.finish_handshake();
                }
                Opcode::AuthChallenge => self.answer_challenge(&response.body),
                Opcode::Error => self.mark_defunct(DefunctReason::HandshakeFailed(
                    HandshakeError::authentication("server rejected authentication"),
                )),
                other => self.mark_defunct(DefunctReason::HandshakeFailed(
                    HandshakeError::unexpected_frame(format!(
                        "unexpected opcode {:#04x} during authentication",
                        other.to_u8()
                    )),
                )),
            },
            Err(Error::ConnectionDefunct(_) | Error::ConnectionClosed) => {}
            Err(e) => self.mark_defunct(DefunctReason::HandshakeFailed(
                HandshakeError::authentication(e.to_string()),
            )),
        }
    }

    fn answer_challenge(self: &Arc<Self>, challenge: &[u8]) {
        let weak = self.weak.clone();
        let submitted = {
            let mut inner = self.lock_inner();
            let Some(authenticator) = inner.authenticator.as_mut() else {
                drop(inner);
                self.mark_defunct(DefunctReason::HandshakeFailed(
                    HandshakeError::authentication("challenge received with no authenticator"),
                ));
                return;
            };
            match authenticator.evaluate_challenge(challenge) {
                Ok(ChallengeResponse::Token(token)) => self.submit(
                    &mut inner,
                    &Request::auth_response(token),
                    ResultSink::Callback(Box::new(move |result| {
                        if let Some(connection) = weak.upgrade() {
                            connection.on_auth_response(result);
                        }
                    })),
                    self.config.connect_timeout,
                ),
                Ok(ChallengeResponse::Done) => {
                    drop(inner);
                    self.mark_defunct(DefunctReason::HandshakeFailed(
                        HandshakeError::authentication(
                            "server issued a challenge after the client finished the exchange",
                        ),
                    ));
                    return;
                }
                Err(e) => {
                    drop(inner);
                    self.mark_defunct(DefunctReason::HandshakeFailed(
                        HandshakeError::authentication(e.to_string()),
                    ));
                    return;
                }
            }
        };
        if let Err(e) = submitted {
            self.mark_defunct(DefunctReason::HandshakeFailed(
                HandshakeError::authentication(e.to_string()),
            ));
        }
    }

    fn finish_handshake(&self) {
        {
            let mut inner = self.lock_inner();
            if inner.state.is_terminal() {
                return;
            }
            inner.state = ConnectionState::Ready;
            inner.last_activity = Instant::now();
            self.arm_heartbeat(&mut inner);
        }
        self.state_cond.notify_all();
        tracing::debug!(remote = %self.info.remote, "connection ready");
    }

    // ==================== Heartbeat ====================

    fn arm_heartbeat(&self, inner: &mut Inner<S>) {
        if self.config.heartbeat_interval.is_zero() {
            return;
        }
        let weak = self.weak.clone();
        let handle = self
            .timers
            .schedule(self.config.heartbeat_interval, move || {
                if let Some(connection) = weak.upgrade() {
                    connection.on_heartbeat_tick();
                }
            });
        inner.heartbeat_timer = Some(handle);
    }

    fn on_heartbeat_tick(self: &Arc<Self>) {
        let mut inner = self.lock_inner();
        if inner.state != ConnectionState::Ready {
            return;
        }

        if inner.last_activity.elapsed() >= self.config.heartbeat_interval {
            let weak = self.weak.clone();
            let submitted = self.submit(
                &mut inner,
                &Request::heartbeat(),
                ResultSink::Callback(Box::new(move |result| {
                    if let Some(connection) = weak.upgrade() {
                        connection.on_heartbeat_result(&result);
                    }
                })),
                self.config.request_timeout,
            );
            // Every stream busy means the connection is anything but idle;
            // skip this round.
            if let Err(e) = submitted {
                tracing::debug!(remote = %self.info.remote, error = %e,
                    "heartbeat not sent");
            }
        }

        self.arm_heartbeat(&mut inner);
    }

    fn on_heartbeat_result(&self, result: &Result<Response>) {
        match result {
            Ok(_) => {
                let mut inner = self.lock_inner();
                inner.heartbeat_misses = 0;
            }
            Err(Error::RequestTimeout) => {
                let misses = {
                    let mut inner = self.lock_inner();
                    inner.heartbeat_misses += 1;
                    inner.heartbeat_misses
                };
                tracing::warn!(remote = %self.info.remote, misses, "heartbeat unanswered");
                if misses >= HEARTBEAT_MISS_LIMIT {
                    self.mark_defunct(DefunctReason::HeartbeatFailure);
                }
            }
            Err(Error::ConnectionDefunct(_) | Error::ConnectionClosed) => {}
            Err(e) => {
                tracing::debug!(remote = %self.info.remote, error = %e, "heartbeat failed");
            }
        }
    }

    // ==================== Failure ====================

    /// Declare the connection dead. Idempotent: the first caller wins, later
    /// reasons are dropped. Every pending request fails with the winning
    /// reason, the socket is torn down, and the observer is told once.
    fn mark_defunct(&self, reason: DefunctReason) {
        let drained = {
            let mut inner = self.lock_inner();
            if inner.state.is_terminal() {
                return;
            }
            inner.state = ConnectionState::Defunct;
            inner.defunct_reason = Some(reason.clone());
            self.teardown(&mut inner)
        };
        self.state_cond.notify_all();
        tracing::warn!(remote = %self.info.remote, reason = %reason,
            pending = drained.len(), "connection defunct");

        for pending in drained {
            pending.complete(Err(Error::ConnectionDefunct(reason.clone())));
        }
        if let Some(observer) = &self.observer {
            observer.on_defunct(&self.info, &Error::ConnectionDefunct(reason));
        }
    }

    /// Shared tail of `mark_defunct` and `close`: cancel timers, drain the
    /// stream table, leave the reactor, and shut the socket. Caller holds the
    /// lock and has already set the terminal state.
    fn teardown(&self, inner: &mut Inner<S>) -> Vec<PendingRequest> {
        if let Some(timer) = inner.heartbeat_timer.take() {
            self.timers.cancel(timer);
        }
        let mut drained = inner.streams.drain();
        for pending in &mut drained {
            tracing::debug!(remote = %self.info.remote, stream_id = pending.stream_id,
                "failing pending request");
            if let Some(timer) = pending.timer.take() {
                self.timers.cancel(timer);
            }
        }
        inner.write_queue.clear();
        if let Some(token) = inner.token.take() {
            if let Err(e) = self.reactor.unregister(token) {
                tracing::debug!(remote = %self.info.remote, error = %e, "unregister failed");
            }
        }
        if let Err(e) = inner.socket.shutdown() {
            tracing::debug!(remote = %self.info.remote, error = %e, "socket shutdown failed");
        }
        drained
    }

    fn lock_inner(&self) -> std::sync::MutexGuard<'_, Inner<S>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl<S: Socket + 'static> EventHandler for Connection<S> {
    fn on_readable(&self) {
        self.handle_readable();
    }

    fn on_writable(&self) {
        self.handle_writable();
    }
}

impl<S: Socket + 'static> std::fmt::Debug for Connection<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("remote", &self.info.remote)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Connection<TcpStream> {
    /// Connect over TCP and start the handshake.
    pub fn connect(
        addr: impl ToSocketAddrs,
        config: ConnectionConfig,
        setup: ConnectionSetup,
    ) -> Result<Arc<Self>> {
        let stream = socket::connect(addr, config.connect_timeout)?;
        Self::establish(stream, config, setup)
    }
}
