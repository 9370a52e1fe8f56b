//! # realtime-protocol
//!
//! Client-side implementation of a two-layer realtime messaging protocol:
//! a lower connection layer handling transport negotiation, upgrade probing
//! and heartbeat, and an upper session layer multiplexing namespaced
//! channels with acknowledgement correlation and reconnection backoff over
//! one physical connection.
//!
//! The application sees a single logical bidirectional event channel per
//! namespace; transport heterogeneity (long-polling vs. a persistent
//! socket), network instability and payload heterogeneity (text vs. binary)
//! stay hidden behind it.
//!
//! ## Layers
//! - [`core`]: connection-layer frames and the payload codec (protocol
//!   version 3)
//! - [`transport`]: the transport capability, generic polling and
//!   persistent-socket state machines, and the connection state machine
//! - [`protocol`]: session-layer packets, binary attachment handling and
//!   the streaming decoder (protocol version 4)
//! - [`session`]: namespace channels, the session manager and the
//!   reconnection backoff
//! - [`client`]: the tokio event loop driving it all
//!
//! ## Design
//! The state machines are synchronous and deterministic; all I/O lives
//! behind narrow collaborator traits ([`transport::polling::PollingIo`],
//! [`transport::socket::SocketIo`]) whose completions flow through one
//! signal channel. A single driver task processes signals and timer
//! deadlines, so state transitions always run to completion before the next
//! one starts.
//!
//! ## Example
//! ```ignore
//! use realtime_protocol::{Client, SessionConfig};
//!
//! let mut client = Client::connect("https://example.com", factory)?;
//! client.channel("/chat");
//! client.emit("/chat", "hello", vec!["world".into()])?;
//! while let Some(event) = client.next_event().await {
//!     // react to connects, events, acks, reconnects
//! }
//! ```

pub mod client;
pub mod config;
pub mod core;
pub mod error;
pub mod protocol;
pub mod session;
pub mod transport;
pub mod utils;

pub use client::Client;
pub use config::{ConnectionConfig, SessionConfig};
pub use error::{ProtocolError, Result};
pub use protocol::packet::{Data, Packet, PacketKind};
pub use session::channel::{AckResponder, ChannelEvent};
pub use session::manager::{Manager, ManagerEvent, ManagerState};
pub use transport::{
    Transport, TransportEvent, TransportFactory, TransportKind, TransportOptions,
};
