//! Protocol message units: opcodes, frames, and the request/response types
//! carried over a multiplexed connection.
//!
//! Bodies are opaque to the engine; only the framing (header + length-prefixed
//! body) and the opcodes needed to drive the connection state machine are
//! modeled here.

use wireline_core::ProtocolVersion;

/// Frame opcode.
///
/// The engine interprets only the handshake opcodes; everything else passes
/// through to the caller untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    /// Server error response.
    Error,
    /// Client startup / options negotiation.
    Startup,
    /// Server is ready for requests.
    Ready,
    /// Server requires authentication.
    Authenticate,
    /// Lightweight no-op request; used as the idle heartbeat.
    Options,
    /// Server response to `Options`.
    Supported,
    /// Caller request payload.
    Query,
    /// Server result payload.
    Result,
    /// Server authentication challenge.
    AuthChallenge,
    /// Client authentication response.
    AuthResponse,
    /// Server authentication success.
    AuthSuccess,
    /// Any opcode the engine does not interpret.
    Other(u8),
}

impl Opcode {
    pub fn to_u8(self) -> u8 {
        match self {
            Opcode::Error => 0x00,
            Opcode::Startup => 0x01,
            Opcode::Ready => 0x02,
            Opcode::Authenticate => 0x03,
            Opcode::Options => 0x05,
            Opcode::Supported => 0x06,
            Opcode::Query => 0x07,
            Opcode::Result => 0x08,
            Opcode::AuthChallenge => 0x0E,
            Opcode::AuthResponse => 0x0F,
            Opcode::AuthSuccess => 0x10,
            Opcode::Other(b) => b,
        }
    }

    pub fn from_u8(byte: u8) -> Self {
        match byte {
            0x00 => Opcode::Error,
            0x01 => Opcode::Startup,
            0x02 => Opcode::Ready,
            0x03 => Opcode::Authenticate,
            0x05 => Opcode::Options,
            0x06 => Opcode::Supported,
            0x07 => Opcode::Query,
            0x08 => Opcode::Result,
            0x0E => Opcode::AuthChallenge,
            0x0F => Opcode::AuthResponse,
            0x10 => Opcode::AuthSuccess,
            other => Opcode::Other(other),
        }
    }
}

/// One complete protocol message unit as transmitted over the connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub stream_id: i32,
    pub opcode: Opcode,
    pub body: Vec<u8>,
}

/// An outbound request submitted through `Connection::send`.
#[derive(Debug, Clone)]
pub struct Request {
    pub opcode: Opcode,
    /// Opaque, already-encoded body bytes.
    pub body: Vec<u8>,
    /// Whether a client timestamp should be drawn from the generator when
    /// this request is submitted.
    pub needs_timestamp: bool,
}

impl Request {
    /// A request with an arbitrary opcode and body.
    pub fn new(opcode: Opcode, body: Vec<u8>) -> Self {
        Self {
            opcode,
            body,
            needs_timestamp: false,
        }
    }

    /// A caller query carrying an opaque body; stamped with a client
    /// timestamp at submission.
    pub fn query(body: Vec<u8>) -> Self {
        Self {
            opcode: Opcode::Query,
            body,
            needs_timestamp: true,
        }
    }

    /// The idle-connection heartbeat: a no-op options request.
    pub fn heartbeat() -> Self {
        Self::new(Opcode::Options, Vec::new())
    }

    /// The startup frame opening protocol negotiation.
    pub(crate) fn startup(body: Vec<u8>) -> Self {
        Self::new(Opcode::Startup, body)
    }

    /// An authentication response carrying an opaque token.
    pub(crate) fn auth_response(token: Vec<u8>) -> Self {
        Self::new(Opcode::AuthResponse, token)
    }
}

/// An inbound response delivered to a pending request's handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub stream_id: i32,
    pub opcode: Opcode,
    pub body: Vec<u8>,
}

impl Response {
    pub(crate) fn from_frame(frame: Frame) -> Self {
        Self {
            stream_id: frame.stream_id,
            opcode: frame.opcode,
            body: frame.body,
        }
    }
}

/// Identity of a connection, reported to the pool observer.
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    /// Remote address (or a descriptive label for simulated sockets).
    pub remote: String,
    /// Negotiated protocol version.
    pub protocol_version: ProtocolVersion,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opcode_round_trip() {
        for byte in 0u8..=0x20 {
            assert_eq!(Opcode::from_u8(byte).to_u8(), byte);
        }
    }

    #[test]
    fn test_unknown_opcode_passes_through() {
        assert_eq!(Opcode::from_u8(0x7F), Opcode::Other(0x7F));
        assert_eq!(Opcode::Other(0x7F).to_u8(), 0x7F);
    }

    #[test]
    fn test_query_requests_want_timestamps() {
        assert!(Request::query(vec![1, 2, 3]).needs_timestamp);
        assert!(!Request::heartbeat().needs_timestamp);
        assert!(!Request::startup(Vec::new()).needs_timestamp);
    }
}
