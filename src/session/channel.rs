//! Per-namespace channel.
//!
//! A channel is the application's view onto one namespace multiplexed over
//! the shared connection. It buffers emits and inbound events until the
//! namespace connects, correlates acknowledgements by integer id, and keeps
//! a small set of lifecycle event names reserved.
//!
//! The channel never mutates manager state directly: its methods return the
//! packets the manager should forward, and ack responders send through a
//! dedicated outbound queue.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::mpsc::UnboundedSender;
use tracing::debug;

use crate::error::{ProtocolError, Result};
use crate::protocol::binary::args_have_binary;
use crate::protocol::packet::{Data, Packet, PacketKind};

/// Lifecycle signals that cannot be sent as ordinary application events.
pub const RESERVED_EVENTS: &[&str] = &[
    "connect",
    "connect_error",
    "connect_timeout",
    "connecting",
    "disconnect",
    "error",
    "reconnect",
    "reconnect_attempt",
    "reconnect_failed",
    "reconnect_error",
    "reconnecting",
    "ping",
    "pong",
];

/// Callback invoked with the arguments of a matching ack packet.
pub type AckCallback = Box<dyn FnOnce(Vec<Data>) + Send>;

/// One-shot responder attached to an inbound event that requested an
/// acknowledgement. Consuming it sends the ack packet; dropping it sends
/// nothing.
#[derive(Debug)]
pub struct AckResponder {
    nsp: String,
    id: u64,
    outbound: UnboundedSender<Packet>,
}

impl AckResponder {
    /// The ack id being answered.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Send the acknowledgement with the given arguments.
    pub fn respond(self, args: Vec<Data>) {
        debug!(id = self.id, "sending ack");
        let kind = if args_have_binary(&args) {
            PacketKind::BinaryAck
        } else {
            PacketKind::Ack
        };
        let mut packet = Packet::new(kind, self.nsp, Some(Data::Array(args)));
        packet.id = self.id;
        let _ = self.outbound.send(packet);
    }
}

/// Events a channel surfaces to the application.
#[derive(Debug)]
pub enum ChannelEvent {
    Connecting,
    Connect,
    Disconnect {
        reason: String,
    },
    /// An application event from the server.
    Event {
        name: String,
        args: Vec<Data>,
        ack: Option<AckResponder>,
    },
    Error {
        message: String,
    },
    ConnectError {
        message: String,
    },
    ConnectTimeout,
    Reconnect {
        attempt: u32,
    },
    ReconnectAttempt {
        attempt: u32,
    },
    Reconnecting {
        attempt: u32,
    },
    ReconnectError {
        message: String,
    },
    ReconnectFailed,
    Ping,
    Pong {
        latency: Duration,
    },
}

/// Everything that came out of feeding one packet to a channel.
#[derive(Debug, Default)]
pub struct PacketOutcome {
    pub events: Vec<ChannelEvent>,
    /// Packets the manager must forward (buffered sends on connect).
    pub packets: Vec<Packet>,
    /// The namespace just connected; the manager assigns the session id.
    pub connected_now: bool,
    /// The channel tore itself down (server-initiated disconnect).
    pub destroyed: bool,
}

/// A namespace channel.
pub struct Channel {
    nsp: String,
    query: Option<String>,
    /// Session identifier, `<namespace>#<connection sid>` off the root.
    sid: Option<String>,
    connected: bool,
    disconnected: bool,
    /// Whether the channel is wired to manager lifecycle events.
    active: bool,
    /// Next ack id; strictly increasing per channel.
    ids: u64,
    acks: HashMap<u64, AckCallback>,
    receive_buffer: Vec<ChannelEvent>,
    send_buffer: Vec<Packet>,
    outbound: UnboundedSender<Packet>,
}

impl Channel {
    pub fn new(nsp: impl Into<String>, query: Option<String>, outbound: UnboundedSender<Packet>) -> Self {
        Self {
            nsp: nsp.into(),
            query,
            sid: None,
            connected: false,
            disconnected: true,
            active: false,
            ids: 0,
            acks: HashMap::new(),
            receive_buffer: Vec::new(),
            send_buffer: Vec::new(),
            outbound,
        }
    }

    pub fn nsp(&self) -> &str {
        &self.nsp
    }

    pub fn connected(&self) -> bool {
        self.connected
    }

    pub fn disconnected(&self) -> bool {
        self.disconnected
    }

    pub fn active(&self) -> bool {
        self.active
    }

    pub fn session(&self) -> Option<&str> {
        self.sid.as_deref()
    }

    pub(crate) fn set_session(&mut self, sid: String) {
        self.sid = Some(sid);
    }

    /// Wire the channel to manager lifecycle events.
    pub(crate) fn activate(&mut self) {
        self.active = true;
    }

    /// Emit an application event, optionally requesting an acknowledgement.
    ///
    /// Returns the packet to forward, or `None` when it was buffered because
    /// the namespace is not connected yet.
    pub fn emit(
        &mut self,
        name: &str,
        args: Vec<Data>,
        ack: Option<AckCallback>,
    ) -> Result<Option<Packet>> {
        if RESERVED_EVENTS.contains(&name) {
            return Err(ProtocolError::ReservedEvent(name.to_string()));
        }

        let mut data = Vec::with_capacity(args.len() + 1);
        data.push(Data::from(name));
        data.extend(args);

        let kind = if args_have_binary(&data) {
            PacketKind::BinaryEvent
        } else {
            PacketKind::Event
        };
        let mut packet = Packet::new(kind, self.nsp.clone(), Some(Data::Array(data)));

        if let Some(callback) = ack {
            debug!(id = self.ids, "emitting packet with ack id");
            self.acks.insert(self.ids, callback);
            packet.id = self.ids;
            self.ids += 1;
        }

        if self.connected {
            Ok(Some(packet))
        } else {
            self.send_buffer.push(packet);
            Ok(None)
        }
    }

    /// The manager opened: non-root namespaces announce themselves.
    pub(crate) fn on_manager_open(&mut self) -> Option<Packet> {
        if !self.active || self.nsp == "/" {
            return None;
        }
        debug!(nsp = %self.nsp, "sending connect packet");
        Some(Packet::connect(self.nsp.clone(), self.query.clone()))
    }

    /// The manager's connection closed underneath us.
    pub(crate) fn on_manager_close(&mut self, reason: &str) -> Option<ChannelEvent> {
        if !self.active {
            return None;
        }
        Some(self.on_close(reason))
    }

    fn on_close(&mut self, reason: &str) -> ChannelEvent {
        debug!(nsp = %self.nsp, %reason, "channel close");
        self.connected = false;
        self.disconnected = true;
        self.sid = None;
        ChannelEvent::Disconnect {
            reason: reason.to_string(),
        }
    }

    /// Feed one decoded packet scoped to this namespace.
    pub(crate) fn on_packet(&mut self, packet: &Packet) -> PacketOutcome {
        let mut outcome = PacketOutcome::default();
        if !self.active {
            return outcome;
        }

        match packet.kind {
            PacketKind::Connect => self.on_connect(&mut outcome),
            PacketKind::Event | PacketKind::BinaryEvent => self.on_event(packet, &mut outcome),
            PacketKind::Ack | PacketKind::BinaryAck => self.on_ack(packet),
            PacketKind::Disconnect => {
                // no acknowledgement round trip for server-initiated closes
                debug!(nsp = %self.nsp, "server disconnect");
                self.active = false;
                outcome.destroyed = true;
                let event = self.on_close("io server disconnect");
                outcome.events.push(event);
            }
            PacketKind::Error => {
                let message = packet
                    .data
                    .as_ref()
                    .and_then(|d| d.to_json().ok())
                    .map(|v| v.to_string())
                    .unwrap_or_default();
                outcome.events.push(ChannelEvent::Error { message });
            }
        }
        outcome
    }

    fn on_connect(&mut self, outcome: &mut PacketOutcome) {
        self.connected = true;
        self.disconnected = false;
        outcome.connected_now = true;
        outcome.events.push(ChannelEvent::Connect);

        // flush buffered sends first, then buffered receives, both in
        // original order
        outcome.packets.extend(self.send_buffer.drain(..));
        outcome.events.extend(self.receive_buffer.drain(..));
    }

    fn on_event(&mut self, packet: &Packet, outcome: &mut PacketOutcome) {
        let mut args = match packet.data.clone() {
            Some(Data::Array(items)) => items,
            _ => Vec::new(),
        };

        let name = if !args.is_empty() {
            match args.remove(0) {
                Data::Value(serde_json::Value::String(name)) => name,
                other => {
                    debug!(nsp = %self.nsp, ?other, "event without a string name");
                    outcome.events.push(ChannelEvent::Error {
                        message: "invalid event packet".to_string(),
                    });
                    return;
                }
            }
        } else {
            outcome.events.push(ChannelEvent::Error {
                message: "invalid event packet".to_string(),
            });
            return;
        };

        // a non-zero id means the sender wants an acknowledgement
        let ack = (packet.id != 0).then(|| AckResponder {
            nsp: self.nsp.clone(),
            id: packet.id,
            outbound: self.outbound.clone(),
        });

        let event = ChannelEvent::Event { name, args, ack };
        if self.connected {
            outcome.events.push(event);
        } else {
            self.receive_buffer.push(event);
        }
    }

    fn on_ack(&mut self, packet: &Packet) {
        match self.acks.remove(&packet.id) {
            Some(callback) => {
                debug!(id = packet.id, "calling ack");
                let args = match packet.data.clone() {
                    Some(Data::Array(items)) => items,
                    _ => Vec::new(),
                };
                callback(args);
            }
            // an ack nobody asked for is not an error
            None => debug!(id = packet.id, "bad ack"),
        }
    }

    /// Client-initiated close.
    pub(crate) fn close(&mut self) -> (Option<Packet>, Option<ChannelEvent>) {
        let packet = self
            .connected
            .then(|| Packet::disconnect(self.nsp.clone()));
        let was_connected = self.connected;

        self.active = false;
        let event = was_connected.then(|| self.on_close("io client disconnect"));
        (packet, event)
    }
}
