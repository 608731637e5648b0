//! OS-poll reactor backends built on `mio`.
//!
//! Both backends share [`PollCore`]: a registry clone plus the slot table
//! mapping tokens to handlers. [`ThreadedReactor`] runs the poll loop on its
//! own thread; [`EventLoop`] leaves the loop to the caller.

use std::collections::HashMap;
use std::io;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Registry, Token, Waker};

use wireline_core::{Error, Result};

use super::{EventHandler, Reactor, ReactorToken};
use crate::socket::Socket;

/// Token reserved for the waker.
const WAKER_TOKEN: Token = Token(usize::MAX);

struct Slot {
    fd: RawFd,
    handler: Arc<dyn EventHandler>,
    write_armed: bool,
}

/// Registration state shared between the poll loop and registering threads.
struct PollCore {
    registry: Registry,
    slots: Mutex<HashMap<usize, Slot>>,
    next_token: AtomicUsize,
}

impl PollCore {
    fn new(registry: Registry) -> Self {
        Self {
            registry,
            slots: Mutex::new(HashMap::new()),
            next_token: AtomicUsize::new(0),
        }
    }

    fn register(&self, socket: &dyn Socket, handler: Arc<dyn EventHandler>) -> Result<ReactorToken> {
        let Some(fd) = socket.raw_fd() else {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::Unsupported,
                "socket has no file descriptor; use the external-callback backend",
            )));
        };

        let token = self.next_token.fetch_add(1, Ordering::SeqCst);
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        self.registry
            .register(&mut SourceFd(&fd), Token(token), Interest::READABLE)?;
        slots.insert(
            token,
            Slot {
                fd,
                handler,
                write_armed: false,
            },
        );
        tracing::debug!(token, fd, "socket registered with reactor");
        Ok(ReactorToken(token))
    }

    fn request_write_notification(&self, token: ReactorToken) -> Result<()> {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        let Some(slot) = slots.get_mut(&token.0) else {
            return Ok(());
        };
        if !slot.write_armed {
            slot.write_armed = true;
            self.registry.reregister(
                &mut SourceFd(&slot.fd),
                Token(token.0),
                Interest::READABLE | Interest::WRITABLE,
            )?;
        }
        Ok(())
    }

    fn unregister(&self, token: ReactorToken) -> Result<()> {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(slot) = slots.remove(&token.0) {
            // The fd may already be closed; deregister failure is not fatal.
            if let Err(e) = self.registry.deregister(&mut SourceFd(&slot.fd)) {
                tracing::debug!(token = token.0, error = %e, "deregister failed");
            }
        }
        Ok(())
    }

    /// Deliver one batch of poll events. Callbacks run with the slot lock
    /// released; reads are delivered before writes.
    fn dispatch(&self, events: &Events) {
        for event in events {
            let token = event.token();
            if token == WAKER_TOKEN {
                continue;
            }

            let (handler, deliver_write) = {
                let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
                let Some(slot) = slots.get_mut(&token.0) else {
                    continue;
                };
                let deliver_write = event.is_writable() && slot.write_armed;
                if deliver_write {
                    // One-shot: disarm before the callback so a re-arm from
                    // inside it is not lost.
                    slot.write_armed = false;
                    if let Err(e) = self.registry.reregister(
                        &mut SourceFd(&slot.fd),
                        token,
                        Interest::READABLE,
                    ) {
                        tracing::debug!(token = token.0, error = %e, "disarm reregister failed");
                    }
                }
                (Arc::clone(&slot.handler), deliver_write)
            };

            if event.is_readable() || event.is_read_closed() {
                handler.on_readable();
            }
            if deliver_write {
                handler.on_writable();
            }
        }
    }
}

// ==================== Polling-thread backend ====================

/// Reactor backed by a dedicated polling thread.
///
/// Handler callbacks run inline on that thread, so a slow callback delays
/// every connection sharing the reactor.
pub struct ThreadedReactor {
    core: Arc<PollCore>,
    waker: Arc<Waker>,
    shutdown: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl ThreadedReactor {
    pub fn new() -> Result<Self> {
        let mut poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);
        let core = Arc::new(PollCore::new(poll.registry().try_clone()?));
        let shutdown = Arc::new(AtomicBool::new(false));

        let worker_core = Arc::clone(&core);
        let worker_shutdown = Arc::clone(&shutdown);
        let worker = std::thread::Builder::new()
            .name("wireline-reactor".to_string())
            .spawn(move || {
                let mut events = Events::with_capacity(256);
                while !worker_shutdown.load(Ordering::SeqCst) {
                    match poll.poll(&mut events, None) {
                        Ok(()) => worker_core.dispatch(&events),
                        Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                        Err(e) => {
                            tracing::warn!(error = %e, "reactor poll failed; stopping");
                            return;
                        }
                    }
                }
            })
            .map_err(Error::Io)?;

        Ok(Self {
            core,
            waker,
            shutdown,
            worker: Some(worker),
        })
    }
}

impl Reactor for ThreadedReactor {
    fn register(&self, socket: &dyn Socket, handler: Arc<dyn EventHandler>)
    -> Result<ReactorToken> {
        self.core.register(socket, handler)
    }

    fn request_write_notification(&self, token: ReactorToken) -> Result<()> {
        self.core.request_write_notification(token)
    }

    fn unregister(&self, token: ReactorToken) -> Result<()> {
        self.core.unregister(token)
    }
}

impl Drop for ThreadedReactor {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        let _ = self.waker.wake();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl std::fmt::Debug for ThreadedReactor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadedReactor").finish_non_exhaustive()
    }
}

// ==================== Shared-loop backend ====================

/// Cooperative reactor the caller drives.
///
/// Many connections can register against one loop; whoever calls
/// [`run_once`](Self::run_once) or [`run`](Self::run) executes the callbacks
/// on their own thread.
pub struct EventLoop {
    core: Arc<PollCore>,
    waker: Waker,
    poll: Mutex<(Poll, Events)>,
    stopped: AtomicBool,
}

impl EventLoop {
    pub fn new() -> Result<Self> {
        let poll = Poll::new()?;
        let waker = Waker::new(poll.registry(), WAKER_TOKEN)?;
        let core = Arc::new(PollCore::new(poll.registry().try_clone()?));
        Ok(Self {
            core,
            waker,
            poll: Mutex::new((poll, Events::with_capacity(256))),
            stopped: AtomicBool::new(false),
        })
    }

    /// Poll once, dispatching whatever readiness arrived within `timeout`.
    /// Returns the number of events delivered.
    pub fn run_once(&self, timeout: Option<Duration>) -> Result<usize> {
        let mut guard = self.poll.lock().unwrap_or_else(|e| e.into_inner());
        let (poll, events) = &mut *guard;
        match poll.poll(events, timeout) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(0),
            Err(e) => return Err(Error::Io(e)),
        }
        let count = events.iter().count();
        self.core.dispatch(events);
        Ok(count)
    }

    /// Drive the loop until [`stop`](Self::stop) is called.
    pub fn run(&self) -> Result<()> {
        while !self.stopped.load(Ordering::SeqCst) {
            self.run_once(None)?;
        }
        Ok(())
    }

    /// Ask a running loop to return after the current poll.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        let _ = self.waker.wake();
    }
}

impl Reactor for EventLoop {
    fn register(&self, socket: &dyn Socket, handler: Arc<dyn EventHandler>)
    -> Result<ReactorToken> {
        self.core.register(socket, handler)
    }

    fn request_write_notification(&self, token: ReactorToken) -> Result<()> {
        let result = self.core.request_write_notification(token);
        // Interest changed; a loop parked in poll must re-evaluate.
        let _ = self.waker.wake();
        result
    }

    fn unregister(&self, token: ReactorToken) -> Result<()> {
        self.core.unregister(token)
    }
}

impl std::fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLoop").finish_non_exhaustive()
    }
}
