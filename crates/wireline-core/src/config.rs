//! Transport configuration.
//!
//! Connection parameters recognized by the engine: timeouts, heartbeat
//! interval, stream and frame limits, protocol version, and which reactor
//! backend drives socket readiness.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Which concurrency backend delivers socket readiness notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReactorBackend {
    /// A dedicated polling thread (per connection or per pool) invokes
    /// callbacks inline.
    #[default]
    PollingThread,
    /// A single cooperative event loop shared by many connections; the caller
    /// drives it and callbacks run on the loop thread.
    SharedLoop,
    /// An external callback-driven loop invokes watcher objects directly.
    ExternalCallback,
}

/// Negotiated wire protocol version.
///
/// Selects the frame header layout and the valid stream-id range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProtocolVersion {
    /// 1-byte signed stream ids, 0..=127.
    Legacy,
    /// 2-byte stream ids, 0..=32767.
    #[default]
    Extended,
}

impl ProtocolVersion {
    /// Highest stream id this version can carry.
    pub const fn max_stream_id(self) -> i32 {
        match self {
            ProtocolVersion::Legacy => 127,
            ProtocolVersion::Extended => 32_767,
        }
    }

    /// Total stream ids available (ids are 0..=max).
    pub const fn max_streams(self) -> usize {
        self.max_stream_id() as usize + 1
    }

    /// Width of the stream id field on the wire, in bytes.
    pub const fn stream_id_width(self) -> usize {
        match self {
            ProtocolVersion::Legacy => 1,
            ProtocolVersion::Extended => 2,
        }
    }

    /// Fixed header length for this version:
    /// version(1) + flags(1) + stream id + opcode(1) + length(4).
    pub const fn header_len(self) -> usize {
        7 + self.stream_id_width()
    }

    /// Version byte written into the frame header.
    pub const fn wire_byte(self) -> u8 {
        match self {
            ProtocolVersion::Legacy => 0x02,
            ProtocolVersion::Extended => 0x04,
        }
    }
}

/// Connection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Maximum time to wait for the TCP connect to complete.
    pub connect_timeout: Duration,
    /// Per-request timeout; firing fails the request but not the connection.
    pub request_timeout: Duration,
    /// Idle interval after which a heartbeat is sent.
    pub heartbeat_interval: Duration,
    /// Cap on concurrently in-flight streams; effective limit is the smaller
    /// of this and the protocol version's range.
    pub max_in_flight_streams: usize,
    /// Largest frame body accepted before the connection is declared defunct.
    pub max_frame_size: usize,
    /// Which reactor backend drives this connection.
    pub reactor_backend: ReactorBackend,
    /// Negotiated protocol version.
    pub protocol_version: ProtocolVersion,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(12),
            heartbeat_interval: Duration::from_secs(30),
            max_in_flight_streams: 128,
            max_frame_size: 256 * 1024 * 1024,
            reactor_backend: ReactorBackend::default(),
            protocol_version: ProtocolVersion::default(),
        }
    }
}

impl ConnectionConfig {
    /// Create a configuration with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the connect timeout.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the per-request timeout.
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Set the idle heartbeat interval.
    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Set the in-flight stream cap.
    pub fn max_in_flight_streams(mut self, max: usize) -> Self {
        self.max_in_flight_streams = max;
        self
    }

    /// Set the maximum accepted frame body size.
    pub fn max_frame_size(mut self, max: usize) -> Self {
        self.max_frame_size = max;
        self
    }

    /// Set the reactor backend.
    pub fn reactor_backend(mut self, backend: ReactorBackend) -> Self {
        self.reactor_backend = backend;
        self
    }

    /// Set the protocol version.
    pub fn protocol_version(mut self, version: ProtocolVersion) -> Self {
        self.protocol_version = version;
        self
    }

    /// Effective stream limit after clamping to the protocol version's range.
    pub fn effective_stream_limit(&self) -> usize {
        self.max_in_flight_streams
            .min(self.protocol_version.max_streams())
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_in_flight_streams == 0 {
            return Err(ConfigError {
                message: "max_in_flight_streams must be at least 1".to_string(),
            });
        }
        if self.max_frame_size == 0 {
            return Err(ConfigError {
                message: "max_frame_size must be non-zero".to_string(),
            });
        }
        if self.request_timeout.is_zero() {
            return Err(ConfigError {
                message: "request_timeout must be non-zero".to_string(),
            });
        }
        Ok(())
    }
}
