//! # Session Layer
//!
//! Namespace multiplexing over one engine connection.
//!
//! ## Components
//! - **Backoff**: exponential-with-jitter delay generator for reconnects
//! - **Channel**: per-namespace façade with emit/ack/buffering semantics
//! - **Manager**: owns the connection, serializes packet encoding, fans
//!   packets out to channels, and runs the reconnection loop

pub mod backoff;
pub mod channel;
pub mod manager;

pub use backoff::Backoff;
pub use channel::{AckCallback, AckResponder, Channel, ChannelEvent, RESERVED_EVENTS};
pub use manager::{Manager, ManagerEvent, ManagerState};
