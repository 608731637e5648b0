//! Core types for the Wireline transport engine.
//!
//! This crate provides the foundational pieces shared by any driver built on
//! the engine:
//!
//! - `Error` taxonomy for connection, stream, and frame failures
//! - `ConnectionConfig` and the `ReactorBackend`/`ProtocolVersion` surface
//! - `MonotonicTimestampGenerator` for client-side write timestamps

pub mod config;
pub mod error;
pub mod timestamps;

pub use config::{ConnectionConfig, ProtocolVersion, ReactorBackend};
pub use error::{
    ConfigError, ConnectError, DefunctReason, Error, HandshakeError, HandshakeErrorKind, Result,
};
pub use timestamps::{Clock, MonotonicTimestampGenerator, SystemClock};
