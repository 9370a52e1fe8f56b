//! # Error Types
//!
//! Error handling for both protocol layers.
//!
//! This module defines all error variants that can occur during client
//! operations, from transport-level failures to wire-format violations.
//!
//! ## Error Categories
//! - **Transport errors**: network failure, timeout, malformed response
//! - **Protocol errors**: malformed frames or packets, illegal headers
//! - **Handshake errors**: no transports available, connect timeout
//! - **Usage errors**: writing to a transport that is not open, emitting a
//!   reserved event name
//!
//! Local and transport errors never cross the public API as panics; they are
//! funneled through the event-emission path so every layer (channel, manager,
//! connection) gets a chance to react before the application observes them.

use std::io;
use thiserror::Error;

/// Error message constants shared between components and tests.
pub mod constants {
    /// Reported when the configured transport list is exhausted.
    pub const ERR_NO_TRANSPORTS: &str = "no transports available";

    /// Close reason used when the pong deadline lapses.
    pub const ERR_PING_TIMEOUT: &str = "ping timeout";

    /// Close reason used when the active transport closes or errors.
    pub const ERR_TRANSPORT_CLOSE: &str = "transport close";
    pub const ERR_TRANSPORT_ERROR: &str = "transport error";

    /// Sentinel payload carried by an undecodable frame.
    pub const ERR_PARSER: &str = "parser error";
}

/// The primary error type for all client operations.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("transport error: {message}")]
    Transport {
        message: String,
        description: Option<String>,
    },

    #[error("transport is not open")]
    TransportNotOpen,

    #[error("no transports available")]
    NoTransports,

    #[error("unknown transport: {0}")]
    UnknownTransport(String),

    #[error("parser error")]
    Parser,

    #[error("illegal attachments")]
    IllegalAttachments,

    #[error("got binary data when not reconstructing a packet")]
    UnexpectedBinaryFrame,

    #[error("reserved event name: {0}")]
    ReservedEvent(String),

    #[error("connection closed")]
    ConnectionClosed,

    #[error("timeout occurred")]
    Timeout,

    #[error("invalid URI: {0}")]
    InvalidUri(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("encode error: {0}")]
    Encode(String),

    #[error("custom error: {0}")]
    Custom(String),
}

/// Type alias for Results using [`ProtocolError`].
pub type Result<T> = std::result::Result<T, ProtocolError>;
