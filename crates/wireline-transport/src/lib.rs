//! Stream-multiplexed connection engine for binary request/response
//! protocols.
//!
//! The engine owns everything between an established socket and a caller's
//! request handle:
//!
//! - [`Connection`]: the lifecycle state machine (handshake, authentication,
//!   heartbeats, failure propagation)
//! - [`FrameCodec`]: incremental frame encoding and decoding
//! - stream id multiplexing with per-request timeouts
//! - [`reactor`]: pluggable readiness backends (polling thread, shared
//!   event loop, external callbacks)
//! - [`TimerWheel`]: the shared timer service
//!
//! Request and response bodies are opaque bytes; protocol semantics above
//! framing belong to the layer using this crate.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use wireline_core::ConnectionConfig;
//! use wireline_transport::reactor::BuiltReactor;
//! use wireline_transport::{Connection, ConnectionSetup, Request, TimerWheel};
//!
//! # fn main() -> wireline_core::Result<()> {
//! let config = ConnectionConfig::new();
//! let reactor = BuiltReactor::build(config.reactor_backend)?;
//! let timers = Arc::new(TimerWheel::new());
//!
//! let connection = Connection::connect(
//!     "127.0.0.1:9042",
//!     config,
//!     ConnectionSetup::new(reactor.handle(), timers),
//! )?;
//! connection.wait_until_ready(Duration::from_secs(5))?;
//!
//! let handle = connection.send(Request::query(b"...".to_vec()))?;
//! let response = handle.wait(Duration::from_secs(12))?;
//! # let _ = response;
//! # Ok(())
//! # }
//! ```

pub mod auth;
pub mod codec;
pub mod connection;
pub mod protocol;
pub mod reactor;
pub mod socket;
pub mod stream;
pub mod timer;

pub use auth::{Authenticator, ChallengeResponse, StaticTokenAuthenticator};
pub use codec::FrameCodec;
pub use connection::{
    Connection, ConnectionObserver, ConnectionSetup, ConnectionState,
};
pub use protocol::{ConnectionInfo, Frame, Opcode, Request, Response};
pub use reactor::{
    BuiltReactor, EventHandler, EventLoop, ExternalReactor, Reactor, ReactorToken,
    ThreadedReactor, Watcher,
};
pub use socket::{Socket, connect};
pub use stream::ResponseHandle;
pub use timer::{TimerHandle, TimerWheel};
