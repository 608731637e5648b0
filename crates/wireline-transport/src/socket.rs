//! Byte transport abstraction.
//!
//! The engine reads and writes through the [`Socket`] trait so the same
//! connection machinery runs over real TCP streams and over in-memory
//! simulated sockets in tests. Real sockets are placed in non-blocking mode
//! at connect time; the engine only touches them from reactor callbacks.

use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::os::fd::{AsRawFd, RawFd};
use std::time::Duration;

use wireline_core::{ConnectError, Error, Result};

/// Non-blocking byte transport underneath one connection.
///
/// `read` and `write` follow `std::io` semantics: `WouldBlock` when the
/// operation cannot make progress, `Ok(0)` from `read` on orderly remote
/// close.
pub trait Socket: Send {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    fn write(&mut self, buf: &[u8]) -> io::Result<usize>;

    /// Tear the transport down in both directions.
    fn shutdown(&mut self) -> io::Result<()>;

    /// OS file descriptor, when one exists. Simulated sockets return `None`
    /// and can only be driven by the external-callback reactor.
    fn raw_fd(&self) -> Option<RawFd> {
        None
    }

    /// Human-readable peer label for logging.
    fn peer_label(&self) -> String;
}

impl Socket for TcpStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Read::read(self, buf)
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        Write::write(self, buf)
    }

    fn shutdown(&mut self) -> io::Result<()> {
        TcpStream::shutdown(self, Shutdown::Both)
    }

    fn raw_fd(&self) -> Option<RawFd> {
        Some(self.as_raw_fd())
    }

    fn peer_label(&self) -> String {
        self.peer_addr()
            .map_or_else(|_| "<unknown>".to_string(), |addr| addr.to_string())
    }
}

/// Open a TCP connection with a bounded connect phase, then switch the stream
/// to non-blocking mode for the reactor.
pub fn connect(addr: impl ToSocketAddrs, timeout: Duration) -> Result<TcpStream> {
    let mut last_err: Option<io::Error> = None;
    let addrs: Vec<SocketAddr> = addr
        .to_socket_addrs()
        .map_err(|e| connect_error("<resolve>", "address resolution failed", e))?
        .collect();

    for candidate in &addrs {
        match TcpStream::connect_timeout(candidate, timeout) {
            Ok(stream) => {
                stream
                    .set_nonblocking(true)
                    .map_err(|e| connect_error(&candidate.to_string(), "set_nonblocking", e))?;
                stream
                    .set_nodelay(true)
                    .map_err(|e| connect_error(&candidate.to_string(), "set_nodelay", e))?;
                return Ok(stream);
            }
            Err(e) => last_err = Some(e),
        }
    }

    let remote = addrs
        .first()
        .map_or_else(|| "<none>".to_string(), |a| a.to_string());
    match last_err {
        Some(source) if source.kind() == io::ErrorKind::TimedOut => Err(connect_error(
            &remote,
            "connect timed out",
            source,
        )),
        Some(source) => Err(connect_error(&remote, "connect failed", source)),
        None => Err(Error::ConnectTimeout(ConnectError {
            remote,
            message: "no addresses to connect to".to_string(),
            source: None,
        })),
    }
}

fn connect_error(remote: &str, message: &str, source: io::Error) -> Error {
    Error::ConnectTimeout(ConnectError {
        remote: remote.to_string(),
        message: message.to_string(),
        source: Some(Box::new(source)),
    })
}
