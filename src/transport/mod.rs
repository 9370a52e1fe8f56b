//! # Transport Layer
//!
//! The transport capability consumed by the connection, plus the generic
//! long-polling and persistent-socket state machines.
//!
//! A transport is a duplex channel for connection-layer frames. Concrete
//! network I/O stays behind the narrow [`polling::PollingIo`] and
//! [`socket::SocketIo`] collaborator contracts: a collaborator starts
//! requests fire-and-forget and delivers completions through the shared
//! signal channel, tagged with the owning transport's id. The connection's
//! event loop routes those completions back into the transport, which reacts
//! by emitting transport events through the same channel.
//!
//! This keeps every state transition on one call stack at a time: plain
//! flags are enough, no locks.

pub mod connection;
pub mod polling;
pub mod socket;

use std::collections::BTreeMap;
use std::time::Duration;

use tokio::sync::mpsc::UnboundedSender;

use crate::core::frame::Frame;
use crate::core::payload::WireData;
use crate::error::Result;
use crate::utils::uri::encode_query;

pub use connection::{Connection, ConnectionEvent, ConnectionState, HandshakeData};

/// The transport variants this client can negotiate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    /// HTTP long-polling; always available, never binary-limited upward.
    Polling,
    /// A persistent duplex socket, probed as an upgrade candidate.
    PersistentSocket,
}

impl TransportKind {
    /// Wire name used in query strings and handshake upgrade lists.
    pub fn name(self) -> &'static str {
        match self {
            Self::Polling => "polling",
            Self::PersistentSocket => "persistent-socket",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "polling" => Some(Self::Polling),
            "persistent-socket" => Some(Self::PersistentSocket),
            _ => None,
        }
    }
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Transport lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransportState {
    #[default]
    Unset,
    Opening,
    Open,
    Pausing,
    Paused,
    Closed,
}

/// Identifies one transport instance for signal routing. Ids are never
/// reused, so signals from a detached transport fall through harmlessly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransportId(pub u64);

/// Events a transport emits toward its owning connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Open,
    Packet(Frame),
    /// The previously written frames were handed to the network.
    Drain,
    /// A requested pause completed (in-flight poll and write finished).
    Paused,
    Error {
        message: String,
        description: Option<String>,
    },
    Close,
}

/// Completions delivered by an I/O collaborator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IoCompletion {
    /// A persistent socket finished connecting.
    Connected,
    /// One inbound unit: a poll response payload or a socket message.
    Data(WireData),
    /// One outbound request or message write finished.
    WriteDone,
    Error(String),
    /// The remote end closed the socket.
    Closed,
}

/// What flows through the shared signal channel.
#[derive(Debug)]
pub enum Signal {
    Event(TransportEvent),
    Io(IoCompletion),
}

/// A signal tagged with the transport it belongs to.
#[derive(Debug)]
pub struct TransportSignal {
    pub transport: TransportId,
    pub signal: Signal,
}

/// Sender half of the shared signal channel.
pub type SignalSender = UnboundedSender<TransportSignal>;

/// A transport's handle on the signal channel, pre-tagged with its id.
///
/// Cloned into I/O collaborators so their completions route back to the
/// right transport.
#[derive(Debug, Clone)]
pub struct SignalSink {
    id: TransportId,
    tx: SignalSender,
}

impl SignalSink {
    pub fn new(id: TransportId, tx: SignalSender) -> Self {
        Self { id, tx }
    }

    pub fn id(&self) -> TransportId {
        self.id
    }

    /// Emit a transport event. Send failures mean the connection is gone;
    /// they are ignored, the transport is about to be dropped too.
    pub fn event(&self, event: TransportEvent) {
        let _ = self.tx.send(TransportSignal {
            transport: self.id,
            signal: Signal::Event(event),
        });
    }

    /// Deliver an I/O completion (collaborator side).
    pub fn io(&self, completion: IoCompletion) {
        let _ = self.tx.send(TransportSignal {
            transport: self.id,
            signal: Signal::Io(completion),
        });
    }
}

/// Construction options resolved per transport instance.
#[derive(Debug, Clone)]
pub struct TransportOptions {
    pub hostname: String,
    pub port: u16,
    pub secure: bool,
    pub path: String,
    /// Base query parameters; the protocol version, transport name and
    /// session id are merged in by the connection.
    pub query: BTreeMap<String, String>,
    /// Cache-busting parameter name.
    pub timestamp_param: String,
    pub timestamp_requests: bool,
    /// Force the base64 text fallback even where binary would work.
    pub force_base64: bool,
    pub extra_headers: BTreeMap<String, String>,
    pub request_timeout: Option<Duration>,
}

impl TransportOptions {
    /// Build the request URI for this transport, given the scheme pair and
    /// any per-request query additions.
    pub fn uri(
        &self,
        secure_scheme: &str,
        insecure_scheme: &str,
        extra_query: &BTreeMap<String, String>,
    ) -> String {
        let scheme = if self.secure {
            secure_scheme
        } else {
            insecure_scheme
        };

        let mut query = self.query.clone();
        query.extend(extra_query.iter().map(|(k, v)| (k.clone(), v.clone())));
        let query_str = encode_query(&query);

        // omit the port when it is the scheme default
        let default_port = if self.secure { 443 } else { 80 };
        let port = if self.port == default_port {
            String::new()
        } else {
            format!(":{}", self.port)
        };

        let host = if self.hostname.contains(':') {
            format!("[{}]", self.hostname)
        } else {
            self.hostname.clone()
        };

        let separator = if query_str.is_empty() { "" } else { "?" };
        format!("{scheme}://{host}{port}{}{separator}{query_str}", self.path)
    }
}

/// The transport capability: a duplex frame channel with pause support.
///
/// `write` is only valid while the transport is open; calling it in any
/// other state is a local error. `pause` completes asynchronously with a
/// [`TransportEvent::Paused`] once any in-flight poll and write finished.
pub trait Transport: Send {
    fn kind(&self) -> TransportKind;
    fn ready_state(&self) -> TransportState;
    fn writable(&self) -> bool;
    fn supports_binary(&self) -> bool;

    fn open(&mut self);
    fn close(&mut self);
    fn write(&mut self, frames: Vec<Frame>) -> Result<()>;
    fn pause(&mut self);

    /// Route an I/O completion delivered through the signal channel.
    fn handle_io(&mut self, completion: IoCompletion);

    /// Attach the server-assigned session id to subsequent requests.
    fn set_session_id(&mut self, sid: &str);
}

/// Creates transports on behalf of a connection. The concrete factory wires
/// in the I/O collaborators; tests substitute mocks.
pub trait TransportFactory: Send + Sync {
    fn create(
        &self,
        kind: TransportKind,
        options: TransportOptions,
        sink: SignalSink,
    ) -> Result<Box<dyn Transport>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_names_round_trip() {
        for kind in [TransportKind::Polling, TransportKind::PersistentSocket] {
            assert_eq!(TransportKind::from_name(kind.name()), Some(kind));
        }
        assert!(TransportKind::from_name("carrier-pigeon").is_none());
    }

    fn options() -> TransportOptions {
        TransportOptions {
            hostname: "example.com".to_string(),
            port: 80,
            secure: false,
            path: "/realtime/".to_string(),
            query: [("v".to_string(), "3".to_string())].into_iter().collect(),
            timestamp_param: "t".to_string(),
            timestamp_requests: false,
            force_base64: false,
            extra_headers: BTreeMap::new(),
            request_timeout: None,
        }
    }

    #[test]
    fn uri_omits_default_port() {
        let uri = options().uri("https", "http", &BTreeMap::new());
        assert_eq!(uri, "http://example.com/realtime/?v=3");
    }

    #[test]
    fn uri_keeps_explicit_port_and_merges_query() {
        let mut opts = options();
        opts.port = 8080;
        let extra = [("sid".to_string(), "abc".to_string())]
            .into_iter()
            .collect();
        let uri = opts.uri("https", "http", &extra);
        assert_eq!(uri, "http://example.com:8080/realtime/?sid=abc&v=3");
    }

    #[test]
    fn uri_brackets_ipv6_hosts() {
        let mut opts = options();
        opts.hostname = "::1".to_string();
        let uri = opts.uri("https", "http", &BTreeMap::new());
        assert!(uri.starts_with("http://[::1]/"));
    }
}
