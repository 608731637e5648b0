//! End-to-end connection tests over a scripted in-memory socket.
//!
//! The external-callback reactor makes every event explicit: the test decides
//! when the connection sees readability and writability, so handshakes,
//! partial reads, timeouts, and failures are all deterministic.

use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use wireline_core::{
    ConnectionConfig, DefunctReason, Error, HandshakeErrorKind, MonotonicTimestampGenerator,
};
use wireline_transport::connection::{Connection, ConnectionObserver, ConnectionSetup};
use wireline_transport::protocol::ConnectionInfo;
use wireline_transport::reactor::{ExternalReactor, Reactor, ReactorToken, Watcher};
use wireline_transport::{
    ConnectionState, Frame, FrameCodec, Opcode, Request, Socket, StaticTokenAuthenticator,
    TimerWheel,
};

// ==================== Scripted socket ====================

enum ScriptEvent {
    Data(Vec<u8>),
    Eof,
    Error(io::ErrorKind),
}

struct MemState {
    incoming: VecDeque<ScriptEvent>,
    written: Vec<u8>,
    shutdown: bool,
}

/// Connection-side half: reads replay the script, writes are captured.
struct MemorySocket {
    state: Arc<Mutex<MemState>>,
}

/// Test-side half: pushes inbound bytes and inspects outbound ones.
#[derive(Clone)]
struct Controller {
    state: Arc<Mutex<MemState>>,
}

fn memory_pair() -> (MemorySocket, Controller) {
    let state = Arc::new(Mutex::new(MemState {
        incoming: VecDeque::new(),
        written: Vec::new(),
        shutdown: false,
    }));
    (
        MemorySocket {
            state: Arc::clone(&state),
        },
        Controller { state },
    )
}

impl Socket for MemorySocket {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut state = self.state.lock().unwrap();
        match state.incoming.pop_front() {
            Some(ScriptEvent::Data(mut bytes)) => {
                let n = bytes.len().min(buf.len());
                buf[..n].copy_from_slice(&bytes[..n]);
                if n < bytes.len() {
                    bytes.drain(..n);
                    state.incoming.push_front(ScriptEvent::Data(bytes));
                }
                Ok(n)
            }
            Some(ScriptEvent::Eof) => {
                // EOF is sticky.
                state.incoming.push_front(ScriptEvent::Eof);
                Ok(0)
            }
            Some(ScriptEvent::Error(kind)) => Err(kind.into()),
            None => Err(io::ErrorKind::WouldBlock.into()),
        }
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut state = self.state.lock().unwrap();
        if state.shutdown {
            return Err(io::ErrorKind::BrokenPipe.into());
        }
        state.written.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn shutdown(&mut self) -> io::Result<()> {
        self.state.lock().unwrap().shutdown = true;
        Ok(())
    }

    fn peer_label(&self) -> String {
        "mem://test".to_string()
    }
}

impl Controller {
    fn push_data(&self, bytes: impl Into<Vec<u8>>) {
        self.state
            .lock()
            .unwrap()
            .incoming
            .push_back(ScriptEvent::Data(bytes.into()));
    }

    fn push_eof(&self) {
        self.state
            .lock()
            .unwrap()
            .incoming
            .push_back(ScriptEvent::Eof);
    }

    fn push_error(&self, kind: io::ErrorKind) {
        self.state
            .lock()
            .unwrap()
            .incoming
            .push_back(ScriptEvent::Error(kind));
    }

    fn take_written(&self) -> Vec<u8> {
        std::mem::take(&mut self.state.lock().unwrap().written)
    }
}

// ==================== Harness ====================

#[derive(Default)]
struct Recorder {
    defunct: Mutex<Vec<String>>,
    closed: AtomicUsize,
}

impl ConnectionObserver for Recorder {
    fn on_defunct(&self, _info: &ConnectionInfo, error: &Error) {
        self.defunct.lock().unwrap().push(error.to_string());
    }

    fn on_closed(&self, _info: &ConnectionInfo) {
        self.closed.fetch_add(1, Ordering::SeqCst);
    }
}

struct Harness {
    connection: Arc<Connection<MemorySocket>>,
    controller: Controller,
    watcher: Watcher,
    observer: Arc<Recorder>,
    // Dropping the wheel stops its worker; keep it alive for the test.
    _timers: Arc<TimerWheel>,
}

impl Harness {
    fn start(config: ConnectionConfig, setup: impl FnOnce(ConnectionSetup) -> ConnectionSetup)
    -> Self {
        let reactor = Arc::new(ExternalReactor::new());
        let timers = Arc::new(TimerWheel::new());
        let observer = Arc::new(Recorder::default());
        let (socket, controller) = memory_pair();

        let base = ConnectionSetup::new(
            Arc::clone(&reactor) as Arc<dyn Reactor>,
            Arc::clone(&timers),
        )
        .observer(Arc::clone(&observer) as Arc<dyn ConnectionObserver>);

        let connection = Connection::establish(socket, config, setup(base)).unwrap();
        // First (and only) registration on a fresh reactor.
        let watcher = reactor.watcher(ReactorToken(0));

        Self {
            connection,
            controller,
            watcher,
            observer,
            _timers: timers,
        }
    }

    fn flush(&self) {
        while self.watcher.pending_write() {
            self.watcher.notify_writable();
        }
    }

    /// Flush outbound bytes and decode them as frames.
    fn written_frames(&self) -> Vec<Frame> {
        self.flush();
        let mut codec = FrameCodec::new(
            self.connection.info().protocol_version,
            256 * 1024 * 1024,
        );
        codec.feed(&self.controller.take_written());
        let mut frames = Vec::new();
        while let Some(frame) = codec.next_frame().unwrap() {
            frames.push(frame);
        }
        frames
    }

    /// Encode a server-to-client frame, direction bit set.
    fn server_frame(&self, stream_id: i32, opcode: Opcode, body: &[u8]) -> Vec<u8> {
        let codec = FrameCodec::new(
            self.connection.info().protocol_version,
            256 * 1024 * 1024,
        );
        let mut bytes = codec.encode(stream_id, opcode, body).unwrap();
        bytes[0] |= 0x80;
        bytes
    }

    fn respond(&self, stream_id: i32, opcode: Opcode, body: &[u8]) {
        let bytes = self.server_frame(stream_id, opcode, body);
        self.controller.push_data(bytes);
        self.watcher.notify_readable();
    }

    /// Drive the plain (no-auth) handshake to `Ready`.
    fn complete_handshake(&self) {
        let frames = self.written_frames();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].opcode, Opcode::Startup);
        self.respond(frames[0].stream_id, Opcode::Ready, &[]);
        assert_eq!(self.connection.state(), ConnectionState::Ready);
    }
}

fn plain(config: ConnectionConfig) -> Harness {
    Harness::start(config, |setup| setup)
}

// ==================== Tests ====================

#[test]
fn end_to_end_request_with_partial_reads() {
    let harness = plain(ConnectionConfig::new());
    harness.complete_handshake();

    let handle = harness
        .connection
        .send(Request::new(Opcode::Query, b"select".to_vec()))
        .unwrap();

    let frames = harness.written_frames();
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].opcode, Opcode::Query);
    assert_eq!(frames[0].body, b"select");
    let stream_id = frames[0].stream_id;
    assert_eq!(handle.stream_id(), stream_id);
    assert_eq!(harness.connection.in_flight(), 1);

    // Response split across two readability events.
    let response = harness.server_frame(stream_id, Opcode::Result, b"rows");
    let (first, second) = response.split_at(5);
    harness.controller.push_data(first);
    harness.watcher.notify_readable();
    assert!(!handle.is_done());

    harness.controller.push_data(second);
    harness.watcher.notify_readable();

    let response = handle.wait(Duration::from_secs(1)).unwrap();
    assert_eq!(response.opcode, Opcode::Result);
    assert_eq!(response.body, b"rows");

    // Stream id is free again and gets reused.
    assert_eq!(harness.connection.in_flight(), 0);
    let next = harness.connection.send(Request::heartbeat()).unwrap();
    assert_eq!(next.stream_id(), stream_id);
}

#[test]
fn request_timeout_is_local_to_the_request() {
    let harness = plain(ConnectionConfig::new().request_timeout(Duration::from_millis(30)));
    harness.complete_handshake();

    let handle = harness
        .connection
        .send(Request::new(Opcode::Query, Vec::new()))
        .unwrap();
    harness.flush();

    match handle.wait(Duration::from_secs(2)) {
        Err(Error::RequestTimeout) => {}
        other => panic!("expected request timeout, got {other:?}"),
    }

    // The connection survives and the stream id was reclaimed.
    assert_eq!(harness.connection.state(), ConnectionState::Ready);
    assert_eq!(harness.connection.in_flight(), 0);
    assert!(harness.connection.send(Request::heartbeat()).is_ok());
}

#[test]
fn response_delivered_once_and_stale_timer_is_harmless() {
    let harness = plain(ConnectionConfig::new().request_timeout(Duration::from_millis(50)));
    harness.complete_handshake();

    let handle = harness
        .connection
        .send(Request::new(Opcode::Query, Vec::new()))
        .unwrap();
    let frames = harness.written_frames();
    harness.respond(frames[0].stream_id, Opcode::Result, b"ok");

    let response = handle.wait(Duration::from_secs(1)).unwrap();
    assert_eq!(response.body, b"ok");

    // Let the original timeout fire against the already-resolved stream;
    // the connection must shrug it off even if the id was reused.
    let second = harness
        .connection
        .send(Request::new(Opcode::Query, Vec::new()))
        .unwrap();
    assert_eq!(second.stream_id(), frames[0].stream_id);
    std::thread::sleep(Duration::from_millis(120));
    assert_eq!(harness.connection.state(), ConnectionState::Ready);

    // Only its own timeout resolves the second request.
    match second.wait(Duration::from_millis(1)) {
        Err(Error::RequestTimeout | Error::ConnectionDefunct(_)) => {}
        Err(other) => panic!("unexpected error for the second request: {other:?}"),
        Ok(_) => panic!("nothing responded to the second request"),
    }
}

#[test]
fn late_response_after_timeout_desynchronizes_the_connection() {
    let harness = plain(ConnectionConfig::new().request_timeout(Duration::from_millis(20)));
    harness.complete_handshake();

    let handle = harness
        .connection
        .send(Request::new(Opcode::Query, Vec::new()))
        .unwrap();
    let frames = harness.written_frames();
    assert!(matches!(
        handle.wait(Duration::from_secs(2)),
        Err(Error::RequestTimeout)
    ));

    // The id was reclaimed, so the late response matches nothing.
    harness.respond(frames[0].stream_id, Opcode::Result, b"late");
    assert_eq!(harness.connection.state(), ConnectionState::Defunct);
    match harness.connection.send(Request::heartbeat()) {
        Err(Error::ConnectionDefunct(DefunctReason::ProtocolDesync(_))) => {}
        other => panic!("expected protocol desync, got {other:?}"),
    }
}

#[test]
fn peer_close_fails_every_pending_request() {
    let harness = plain(ConnectionConfig::new());
    harness.complete_handshake();

    let first = harness
        .connection
        .send(Request::new(Opcode::Query, b"a".to_vec()))
        .unwrap();
    let second = harness
        .connection
        .send(Request::new(Opcode::Query, b"b".to_vec()))
        .unwrap();
    harness.flush();
    assert_eq!(harness.connection.in_flight(), 2);

    harness.controller.push_eof();
    harness.watcher.notify_readable();

    for handle in [&first, &second] {
        match handle.wait(Duration::from_secs(1)) {
            Err(Error::ConnectionDefunct(DefunctReason::Disconnected)) => {}
            other => panic!("expected defunct(disconnected), got {other:?}"),
        }
    }
    assert_eq!(harness.connection.state(), ConnectionState::Defunct);
    assert!(matches!(
        harness.connection.send(Request::heartbeat()),
        Err(Error::ConnectionDefunct(DefunctReason::Disconnected))
    ));

    // Observer told exactly once.
    assert_eq!(harness.observer.defunct.lock().unwrap().len(), 1);
}

#[test]
fn response_followed_by_eof_in_one_event_is_still_delivered() {
    let harness = plain(ConnectionConfig::new());
    harness.complete_handshake();

    let handle = harness
        .connection
        .send(Request::new(Opcode::Query, Vec::new()))
        .unwrap();
    let frames = harness.written_frames();

    // The peer answers and closes; both arrive in one readability event.
    harness
        .controller
        .push_data(harness.server_frame(frames[0].stream_id, Opcode::Result, b"done"));
    harness.controller.push_eof();
    harness.watcher.notify_readable();

    // The fully received response belongs to its caller; only then does the
    // close take the connection down.
    let response = handle.wait(Duration::from_secs(1)).unwrap();
    assert_eq!(response.body, b"done");
    assert_eq!(harness.connection.state(), ConnectionState::Defunct);
    assert!(matches!(
        harness.connection.send(Request::heartbeat()),
        Err(Error::ConnectionDefunct(DefunctReason::Disconnected))
    ));
}

#[test]
fn read_error_defuncts_with_io_reason() {
    let harness = plain(ConnectionConfig::new());
    harness.complete_handshake();

    let handle = harness
        .connection
        .send(Request::new(Opcode::Query, Vec::new()))
        .unwrap();
    harness.flush();

    harness.controller.push_error(io::ErrorKind::ConnectionReset);
    harness.watcher.notify_readable();

    assert!(matches!(
        handle.wait(Duration::from_secs(1)),
        Err(Error::ConnectionDefunct(DefunctReason::Io(_)))
    ));
}

#[test]
fn oversized_frame_defuncts_the_connection() {
    let harness = plain(ConnectionConfig::new().max_frame_size(64));
    harness.complete_handshake();

    let handle = harness
        .connection
        .send(Request::new(Opcode::Query, Vec::new()))
        .unwrap();
    let frames = harness.written_frames();

    // Header declaring a body far beyond the 64-byte cap.
    let mut bytes = vec![0x84, 0x00];
    bytes.extend_from_slice(&(frames[0].stream_id as u16).to_be_bytes());
    bytes.push(Opcode::Result.to_u8());
    bytes.extend_from_slice(&4096u32.to_be_bytes());
    harness.controller.push_data(bytes);
    harness.watcher.notify_readable();

    assert!(matches!(
        handle.wait(Duration::from_secs(1)),
        Err(Error::ConnectionDefunct(DefunctReason::ProtocolDesync(_)))
    ));
}

#[test]
fn stream_exhaustion_fails_fast_and_recovers() {
    let harness = plain(ConnectionConfig::new().max_in_flight_streams(2));
    harness.complete_handshake();

    let first = harness
        .connection
        .send(Request::new(Opcode::Query, Vec::new()))
        .unwrap();
    let _second = harness
        .connection
        .send(Request::new(Opcode::Query, Vec::new()))
        .unwrap();
    assert!(matches!(
        harness.connection.send(Request::new(Opcode::Query, Vec::new())),
        Err(Error::AllStreamsBusy)
    ));

    harness.flush();
    harness.respond(first.stream_id(), Opcode::Result, &[]);
    first.wait(Duration::from_secs(1)).unwrap();
    assert!(harness.connection.send(Request::new(Opcode::Query, Vec::new())).is_ok());
}

#[test]
fn send_is_rejected_before_ready() {
    let harness = plain(ConnectionConfig::new());
    // Handshake still pending.
    match harness.connection.send(Request::heartbeat()) {
        Err(Error::NotReady { state }) => assert_eq!(state, "negotiating"),
        other => panic!("expected not-ready, got {other:?}"),
    }
}

#[test]
fn wait_until_ready_observes_handshake_failure() {
    let harness = plain(ConnectionConfig::new());
    let frames = harness.written_frames();
    harness.respond(frames[0].stream_id, Opcode::Error, b"unsupported");

    match harness.connection.wait_until_ready(Duration::from_secs(1)) {
        Err(Error::Handshake(err)) => {
            assert_eq!(err.kind, HandshakeErrorKind::Negotiation);
        }
        other => panic!("expected handshake failure, got {other:?}"),
    }

    // Requests on the dead connection still see the connection-wide reason.
    assert!(matches!(
        harness.connection.send(Request::heartbeat()),
        Err(Error::ConnectionDefunct(DefunctReason::HandshakeFailed(_)))
    ));
}

#[test]
fn authentication_exchange_reaches_ready() {
    let harness = Harness::start(ConnectionConfig::new(), |setup| {
        setup.authenticator(StaticTokenAuthenticator::new(b"secret".to_vec()))
    });

    let frames = harness.written_frames();
    assert_eq!(frames[0].opcode, Opcode::Startup);
    harness.respond(frames[0].stream_id, Opcode::Authenticate, b"mech");

    let frames = harness.written_frames();
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].opcode, Opcode::AuthResponse);
    assert_eq!(frames[0].body, b"secret");
    harness.respond(frames[0].stream_id, Opcode::AuthSuccess, &[]);

    harness.connection.wait_until_ready(Duration::from_secs(1)).unwrap();
    assert_eq!(harness.connection.state(), ConnectionState::Ready);
}

#[test]
fn challenge_after_done_fails_the_handshake() {
    // StaticTokenAuthenticator answers every challenge with Done, so a
    // challenge round can never complete legitimately.
    let harness = Harness::start(ConnectionConfig::new(), |setup| {
        setup.authenticator(StaticTokenAuthenticator::new(b"secret".to_vec()))
    });

    let frames = harness.written_frames();
    harness.respond(frames[0].stream_id, Opcode::Authenticate, &[]);
    let frames = harness.written_frames();
    harness.respond(frames[0].stream_id, Opcode::AuthChallenge, b"more");

    match harness.connection.wait_until_ready(Duration::from_secs(1)) {
        Err(Error::Handshake(err)) => {
            assert_eq!(err.kind, HandshakeErrorKind::Authentication);
        }
        other => panic!("expected handshake failure, got {other:?}"),
    }
}

#[test]
fn missing_authenticator_fails_the_handshake() {
    let harness = plain(ConnectionConfig::new());
    let frames = harness.written_frames();
    harness.respond(frames[0].stream_id, Opcode::Authenticate, &[]);

    match harness.connection.wait_until_ready(Duration::from_secs(1)) {
        Err(Error::Handshake(err)) => {
            assert_eq!(err.kind, HandshakeErrorKind::Authentication);
            assert!(err.message.contains("authenticator"));
        }
        other => panic!("expected handshake failure, got {other:?}"),
    }
}

#[test]
fn close_fails_pending_requests_gracefully() {
    let harness = plain(ConnectionConfig::new());
    harness.complete_handshake();

    let handle = harness
        .connection
        .send(Request::new(Opcode::Query, Vec::new()))
        .unwrap();
    harness.connection.close();

    assert!(matches!(
        handle.wait(Duration::from_secs(1)),
        Err(Error::ConnectionClosed)
    ));
    assert_eq!(harness.connection.state(), ConnectionState::Closed);
    assert!(matches!(
        harness.connection.send(Request::heartbeat()),
        Err(Error::ConnectionClosed)
    ));

    // Idempotent; the observer hears about it once.
    harness.connection.close();
    assert_eq!(harness.observer.closed.load(Ordering::SeqCst), 1);
    assert!(harness.observer.defunct.lock().unwrap().is_empty());
}

#[test]
fn queries_are_stamped_with_monotonic_timestamps() {
    let generator = Arc::new(MonotonicTimestampGenerator::new());
    let harness = Harness::start(ConnectionConfig::new(), {
        let generator = Arc::clone(&generator);
        move |setup| setup.timestamps(generator)
    });
    harness.complete_handshake();

    let first = harness.connection.send(Request::query(Vec::new())).unwrap();
    let second = harness.connection.send(Request::query(Vec::new())).unwrap();
    let a = first.timestamp().unwrap();
    let b = second.timestamp().unwrap();
    assert!(b > a);

    // Non-query requests are not stamped.
    let plain_handle = harness.connection.send(Request::heartbeat()).unwrap();
    assert!(plain_handle.timestamp().is_none());
}

#[test]
fn unanswered_heartbeats_defunct_an_idle_connection() {
    let harness = plain(
        ConnectionConfig::new()
            .heartbeat_interval(Duration::from_millis(40))
            .request_timeout(Duration::from_millis(25)),
    );
    harness.complete_handshake();

    // Never respond; two heartbeat timeouts in a row must kill the
    // connection.
    let deadline = Instant::now() + Duration::from_secs(5);
    while harness.connection.state() != ConnectionState::Defunct {
        assert!(Instant::now() < deadline, "connection never went defunct");
        harness.flush();
        std::thread::sleep(Duration::from_millis(10));
    }

    assert!(matches!(
        harness.connection.send(Request::heartbeat()),
        Err(Error::ConnectionDefunct(DefunctReason::HeartbeatFailure))
    ));

    // Heartbeats actually went out as no-op options requests.
    let frames = harness.written_frames();
    assert!(frames.iter().any(|f| f.opcode == Opcode::Options));
}

#[test]
fn answered_heartbeats_keep_the_connection_alive() {
    let harness = plain(
        ConnectionConfig::new()
            .heartbeat_interval(Duration::from_millis(40))
            .request_timeout(Duration::from_millis(25)),
    );
    harness.complete_handshake();

    let deadline = Instant::now() + Duration::from_millis(300);
    while Instant::now() < deadline {
        for frame in harness.written_frames() {
            if frame.opcode == Opcode::Options {
                harness.respond(frame.stream_id, Opcode::Supported, &[]);
            }
        }
        std::thread::sleep(Duration::from_millis(5));
    }

    assert_eq!(harness.connection.state(), ConnectionState::Ready);
}
