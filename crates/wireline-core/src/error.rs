//! Error types for Wireline transport operations.

use std::fmt;

/// The primary error type for all transport operations.
#[derive(Debug)]
pub enum Error {
    /// TCP connect did not complete within the configured timeout.
    ConnectTimeout(ConnectError),
    /// Protocol negotiation or authentication failed.
    Handshake(HandshakeError),
    /// A frame header declared a body larger than the configured maximum.
    ///
    /// This indicates protocol desynchronization (or a malicious peer) and is
    /// fatal to the connection.
    FrameTooLarge { declared: usize, max: usize },
    /// A stream id outside the negotiated protocol's valid range was used.
    InvalidStreamId { id: i32, max: i32 },
    /// A response arrived for a stream id with no pending request.
    ///
    /// Fatal: the stream is desynchronized and cannot be trusted.
    UnknownStream { id: i32 },
    /// Every stream id is in use. Backpressure, not fatal; the caller should
    /// queue or retry on another connection.
    AllStreamsBusy,
    /// A single request exceeded its timeout. Local to the request; the
    /// connection stays up.
    RequestTimeout,
    /// The connection suffered an unrecoverable error; all pending requests
    /// were failed and the socket torn down.
    ConnectionDefunct(DefunctReason),
    /// The connection was closed gracefully while the request was in flight.
    ConnectionClosed,
    /// `send` was called on a connection that has not reached `Ready`.
    NotReady { state: &'static str },
    /// Configuration errors
    Config(ConfigError),
    /// I/O errors
    Io(std::io::Error),
}

#[derive(Debug)]
pub struct ConnectError {
    pub remote: String,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeError {
    pub kind: HandshakeErrorKind,
    pub message: String,
}

impl HandshakeError {
    pub fn negotiation(message: impl Into<String>) -> Self {
        Self {
            kind: HandshakeErrorKind::Negotiation,
            message: message.into(),
        }
    }

    pub fn authentication(message: impl Into<String>) -> Self {
        Self {
            kind: HandshakeErrorKind::Authentication,
            message: message.into(),
        }
    }

    pub fn unexpected_frame(message: impl Into<String>) -> Self {
        Self {
            kind: HandshakeErrorKind::UnexpectedFrame,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeErrorKind {
    /// The server rejected or garbled protocol negotiation.
    Negotiation,
    /// The authentication exchange failed.
    Authentication,
    /// A frame that is never legal during the handshake arrived.
    UnexpectedFrame,
}

/// Why a connection became defunct, reported to every drained request and to
/// the pool observer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DefunctReason {
    /// Read or write on the socket failed.
    Io(String),
    /// The peer closed the connection.
    Disconnected,
    /// The frame stream desynchronized (oversized frame, unknown stream id,
    /// unexpected frame during negotiation).
    ProtocolDesync(String),
    /// Consecutive heartbeats went unanswered.
    HeartbeatFailure,
    /// The handshake did not complete.
    HandshakeFailed(HandshakeError),
}

#[derive(Debug)]
pub struct ConfigError {
    pub message: String,
}

impl Error {
    /// Is this error fatal to the whole connection (as opposed to one request)?
    pub fn is_connection_fatal(&self) -> bool {
        matches!(
            self,
            Error::ConnectTimeout(_)
                | Error::Handshake(_)
                | Error::FrameTooLarge { .. }
                | Error::UnknownStream { .. }
                | Error::ConnectionDefunct(_)
                | Error::ConnectionClosed
                | Error::Io(_)
        )
    }

    /// Is this a per-request, recoverable error (`RequestTimeout`,
    /// `AllStreamsBusy`)?
    pub fn is_request_local(&self) -> bool {
        matches!(self, Error::RequestTimeout | Error::AllStreamsBusy)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::ConnectTimeout(e) => {
                write!(f, "Connect timeout to {}: {}", e.remote, e.message)
            }
            Error::Handshake(e) => write!(f, "Handshake error: {}", e.message),
            Error::FrameTooLarge { declared, max } => write!(
                f,
                "Frame body of {} bytes exceeds maximum frame size of {} bytes",
                declared, max
            ),
            Error::InvalidStreamId { id, max } => {
                write!(f, "Stream id {} outside valid range 0..={}", id, max)
            }
            Error::UnknownStream { id } => {
                write!(f, "Response for unknown stream id {}", id)
            }
            Error::AllStreamsBusy => write!(f, "All stream ids are in use"),
            Error::RequestTimeout => write!(f, "Request timed out"),
            Error::ConnectionDefunct(reason) => {
                write!(f, "Connection is defunct: {}", reason)
            }
            Error::ConnectionClosed => write!(f, "Connection was closed"),
            Error::NotReady { state } => {
                write!(f, "Connection is not ready (state: {})", state)
            }
            Error::Config(e) => write!(f, "Configuration error: {}", e.message),
            Error::Io(e) => write!(f, "I/O error: {}", e),
        }
    }
}

impl fmt::Display for DefunctReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DefunctReason::Io(msg) => write!(f, "I/O failure: {}", msg),
            DefunctReason::Disconnected => write!(f, "peer closed the connection"),
            DefunctReason::ProtocolDesync(msg) => {
                write!(f, "protocol desynchronization: {}", msg)
            }
            DefunctReason::HeartbeatFailure => {
                write!(f, "consecutive heartbeats unanswered")
            }
            DefunctReason::HandshakeFailed(err) => write!(f, "handshake failed: {}", err.message),
        }
    }
}

impl fmt::Display for ConnectError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for HandshakeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::ConnectTimeout(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err)
    }
}

impl From<HandshakeError> for Error {
    fn from(err: HandshakeError) -> Self {
        Error::Handshake(err)
    }
}

impl From<ConfigError> for Error {
    fn from(err: ConfigError) -> Self {
        Error::Config(err)
    }
}

/// Result type alias for transport operations.
pub type Result<T> = std::result::Result<T, Error>;
