//! Pluggable socket-readiness backends.
//!
//! The connection engine never blocks on a socket. It registers an event
//! handler with a [`Reactor`] and reacts to readability and writability
//! callbacks. Three backends ship:
//!
//! - [`ThreadedReactor`]: a dedicated polling thread, callbacks inline on
//!   that thread. The default.
//! - [`EventLoop`]: a cooperative loop the caller drives; callbacks run on
//!   whichever thread calls `run_once`.
//! - [`ExternalReactor`]: no polling at all; an outside event loop invokes
//!   [`Watcher`] objects directly. Also the deterministic test harness.
//!
//! Readiness is level-triggered from the engine's point of view: read
//! interest is permanent for a registered socket, write interest is armed
//! explicitly and disarmed after each writability delivery.

mod external;
mod poll;

pub use external::{ExternalReactor, Watcher};
pub use poll::{EventLoop, ThreadedReactor};

use std::sync::Arc;

use wireline_core::{ReactorBackend, Result};

use crate::socket::Socket;

/// Identifies one registered socket within a reactor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ReactorToken(pub usize);

/// Receiver of readiness callbacks.
///
/// Implementations must tolerate spurious callbacks: a readability
/// notification does not guarantee bytes, only that a read is worth trying.
pub trait EventHandler: Send + Sync {
    fn on_readable(&self);

    fn on_writable(&self);
}

/// Socket readiness source.
pub trait Reactor: Send + Sync {
    /// Register a socket for permanent read interest.
    fn register(&self, socket: &dyn Socket, handler: Arc<dyn EventHandler>)
    -> Result<ReactorToken>;

    /// Arm one-shot write interest; the next writability delivery disarms it.
    fn request_write_notification(&self, token: ReactorToken) -> Result<()>;

    /// Remove a registration. Unregistering an unknown token is a no-op.
    fn unregister(&self, token: ReactorToken) -> Result<()>;
}

/// A reactor constructed from configuration.
#[derive(Clone)]
pub enum BuiltReactor {
    PollingThread(Arc<ThreadedReactor>),
    SharedLoop(Arc<EventLoop>),
    ExternalCallback(Arc<ExternalReactor>),
}

impl BuiltReactor {
    /// Build the backend named by the configuration.
    pub fn build(backend: ReactorBackend) -> Result<Self> {
        Ok(match backend {
            ReactorBackend::PollingThread => Self::PollingThread(Arc::new(ThreadedReactor::new()?)),
            ReactorBackend::SharedLoop => Self::SharedLoop(Arc::new(EventLoop::new()?)),
            ReactorBackend::ExternalCallback => {
                Self::ExternalCallback(Arc::new(ExternalReactor::new()))
            }
        })
    }

    /// Dynamic handle usable by the connection machinery.
    pub fn handle(&self) -> Arc<dyn Reactor> {
        match self {
            Self::PollingThread(r) => Arc::clone(r) as Arc<dyn Reactor>,
            Self::SharedLoop(r) => Arc::clone(r) as Arc<dyn Reactor>,
            Self::ExternalCallback(r) => Arc::clone(r) as Arc<dyn Reactor>,
        }
    }
}

impl std::fmt::Debug for BuiltReactor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PollingThread(_) => f.write_str("BuiltReactor::PollingThread"),
            Self::SharedLoop(_) => f.write_str("BuiltReactor::SharedLoop"),
            Self::ExternalCallback(_) => f.write_str("BuiltReactor::ExternalCallback"),
        }
    }
}
