//! Reactor backend driven entirely by an outside event loop.
//!
//! Nothing polls here. The host application registers its own interest in
//! the socket's file descriptor (or drives a simulated transport) and calls
//! [`Watcher::notify_readable`] / [`Watcher::notify_writable`] when readiness
//! occurs. Write-interest bookkeeping matches the polled backends: arming is
//! one-shot and a writability notification while disarmed is dropped.
//!
//! This backend is also the deterministic harness the integration tests use
//! to step a connection through exact event sequences.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use wireline_core::Result;

use super::{EventHandler, Reactor, ReactorToken};
use crate::socket::Socket;

struct ExtSlot {
    handler: Arc<dyn EventHandler>,
    write_wanted: bool,
}

/// Reactor with no threads and no poll: readiness arrives only through
/// [`Watcher`] notifications.
pub struct ExternalReactor {
    slots: Mutex<HashMap<usize, ExtSlot>>,
    next_token: AtomicUsize,
}

impl Default for ExternalReactor {
    fn default() -> Self {
        Self::new()
    }
}

impl ExternalReactor {
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            next_token: AtomicUsize::new(0),
        }
    }

    /// Watcher for a registered token; the host loop holds one per socket.
    pub fn watcher(self: &Arc<Self>, token: ReactorToken) -> Watcher {
        Watcher {
            reactor: Arc::clone(self),
            token,
        }
    }

    /// Whether the connection behind `token` is currently waiting to write.
    /// Host loops use this to decide whether to watch the fd for writability.
    pub fn pending_write(&self, token: ReactorToken) -> bool {
        self.slots
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&token.0)
            .is_some_and(|slot| slot.write_wanted)
    }

    fn deliver_readable(&self, token: ReactorToken) {
        let handler = {
            let slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
            slots.get(&token.0).map(|slot| Arc::clone(&slot.handler))
        };
        if let Some(handler) = handler {
            handler.on_readable();
        }
    }

    fn deliver_writable(&self, token: ReactorToken) {
        let handler = {
            let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
            match slots.get_mut(&token.0) {
                Some(slot) if slot.write_wanted => {
                    slot.write_wanted = false;
                    Some(Arc::clone(&slot.handler))
                }
                _ => None,
            }
        };
        if let Some(handler) = handler {
            handler.on_writable();
        }
    }
}

impl Reactor for ExternalReactor {
    fn register(&self, _socket: &dyn Socket, handler: Arc<dyn EventHandler>)
    -> Result<ReactorToken> {
        let token = self.next_token.fetch_add(1, Ordering::SeqCst);
        self.slots
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(
                token,
                ExtSlot {
                    handler,
                    write_wanted: false,
                },
            );
        Ok(ReactorToken(token))
    }

    fn request_write_notification(&self, token: ReactorToken) -> Result<()> {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(slot) = slots.get_mut(&token.0) {
            slot.write_wanted = true;
        }
        Ok(())
    }

    fn unregister(&self, token: ReactorToken) -> Result<()> {
        self.slots
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&token.0);
        Ok(())
    }
}

impl std::fmt::Debug for ExternalReactor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExternalReactor").finish_non_exhaustive()
    }
}

/// Host-loop handle for one registered socket.
#[derive(Clone)]
pub struct Watcher {
    reactor: Arc<ExternalReactor>,
    token: ReactorToken,
}

impl Watcher {
    /// The socket has bytes (or EOF) to read.
    pub fn notify_readable(&self) {
        self.reactor.deliver_readable(self.token);
    }

    /// The socket can accept writes. Delivered only if write interest is
    /// armed; arming is consumed by the delivery.
    pub fn notify_writable(&self) {
        self.reactor.deliver_writable(self.token);
    }

    /// Whether the connection wants a writability notification.
    pub fn pending_write(&self) -> bool {
        self.reactor.pending_write(self.token)
    }

    pub fn token(&self) -> ReactorToken {
        self.token
    }
}

impl std::fmt::Debug for Watcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Watcher")
            .field("token", &self.token)
            .finish()
    }
}
