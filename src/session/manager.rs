//! Session manager: one connection, many namespace channels.
//!
//! The manager owns the engine connection, feeds its data stream through the
//! packet decoder, fans decoded packets out to the namespace channels,
//! serializes packet encoding, and runs the reconnection loop with
//! exponential backoff.
//!
//! Like the connection, the manager is externally driven: transport signals
//! go in through [`Manager::handle_signal`], expirations through
//! [`Manager::handle_timeout`], and application-facing events come out of
//! [`Manager::poll_event`].

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc::UnboundedSender;
use tracing::debug;

use crate::config::SessionConfig;
use crate::core::frame::FrameData;
use crate::core::payload::WireData;
use crate::error::Result;
use crate::protocol::decoder::Decoder;
use crate::protocol::packet::{Encoder, Packet, PacketKind};
use crate::session::backoff::Backoff;
use crate::session::channel::{AckCallback, Channel, ChannelEvent};
use crate::transport::{
    Connection, ConnectionEvent, SignalSender, TransportFactory, TransportSignal,
};

/// Manager lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ManagerState {
    #[default]
    Closed,
    Opening,
    Open,
}

/// Events surfaced to the application.
#[derive(Debug)]
pub enum ManagerEvent {
    /// The underlying connection opened.
    Open,
    /// The underlying connection closed.
    Close { reason: String },
    /// A channel-scoped event.
    Channel { nsp: String, event: ChannelEvent },
}

/// Session manager.
pub struct Manager {
    config: SessionConfig,
    factory: Arc<dyn TransportFactory>,
    signals: SignalSender,
    /// Outbound queue used by ack responders.
    outbound: UnboundedSender<Packet>,

    state: ManagerState,
    engine: Option<Connection>,
    channels: HashMap<String, Channel>,
    /// Channels between `open` and `destroy`; the connection closes when
    /// the last one is removed.
    connecting: Vec<String>,

    encoder: Encoder,
    decoder: Decoder,
    /// At most one packet encode may be in flight.
    encoding: bool,
    /// Packets deferred while an encode is in flight, drained FIFO.
    packet_buffer: VecDeque<Packet>,

    backoff: Backoff,
    reconnecting: bool,
    skip_reconnect: bool,
    /// The current open() belongs to a reconnect attempt.
    reconnect_attempt_in_flight: bool,
    /// The pre-open subscription: set between open() and the open event.
    open_sub_active: bool,

    last_ping: Option<Instant>,
    connect_timeout_deadline: Option<Instant>,
    reconnect_deadline: Option<Instant>,

    events: VecDeque<ManagerEvent>,
}

impl Manager {
    pub fn new(
        config: SessionConfig,
        factory: Arc<dyn TransportFactory>,
        signals: SignalSender,
        outbound: UnboundedSender<Packet>,
    ) -> Self {
        let backoff = Backoff::new(
            config.reconnection_delay,
            config.reconnection_delay_max,
            2.0,
            config.randomization_factor,
        );
        Self {
            config,
            factory,
            signals,
            outbound,
            state: ManagerState::Closed,
            engine: None,
            channels: HashMap::new(),
            connecting: Vec::new(),
            encoder: Encoder::new(),
            decoder: Decoder::new(),
            encoding: false,
            packet_buffer: VecDeque::new(),
            backoff,
            reconnecting: false,
            skip_reconnect: false,
            reconnect_attempt_in_flight: false,
            open_sub_active: false,
            last_ping: None,
            connect_timeout_deadline: None,
            reconnect_deadline: None,
            events: VecDeque::new(),
        }
    }

    pub fn state(&self) -> ManagerState {
        self.state
    }

    pub fn reconnecting(&self) -> bool {
        self.reconnecting
    }

    /// The connection's session id, when open.
    pub fn session_id(&self) -> Option<String> {
        self.engine
            .as_ref()
            .and_then(|e| e.session_id().map(str::to_string))
    }

    /// Drain the next application-facing event.
    pub fn poll_event(&mut self) -> Option<ManagerEvent> {
        self.events.pop_front()
    }

    /// Earliest pending timer deadline across the manager and its engine.
    pub fn poll_deadline(&self) -> Option<Instant> {
        let mut deadline = self.engine.as_ref().and_then(|e| e.poll_deadline());
        for candidate in [self.connect_timeout_deadline, self.reconnect_deadline] {
            deadline = match (deadline, candidate) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, b) => a.or(b),
            };
        }
        deadline
    }

    /// Open the underlying connection.
    pub fn open(&mut self) {
        if matches!(self.state, ManagerState::Opening | ManagerState::Open) {
            return;
        }

        debug!(host = %self.config.connection.hostname, "opening connection");
        let mut engine = Connection::new(
            self.config.connection.clone(),
            self.factory.clone(),
            self.signals.clone(),
        );
        engine.open();
        self.engine = Some(engine);
        self.state = ManagerState::Opening;
        self.skip_reconnect = false;
        self.open_sub_active = true;

        if let Some(timeout) = self.config.connect_timeout {
            debug!(?timeout, "connect attempt will time out");
            if timeout.is_zero() {
                // prevents a race with the open event
                self.open_sub_active = false;
            }
            self.connect_timeout_deadline = Some(Instant::now() + timeout);
        }

        self.pump_engine();
    }

    /// Route a transport signal into the engine and process the fallout.
    pub fn handle_signal(&mut self, signal: TransportSignal) {
        if let Some(engine) = self.engine.as_mut() {
            engine.handle_signal(signal);
        }
        self.pump_engine();
    }

    /// Dispatch any expired timers.
    pub fn handle_timeout(&mut self, now: Instant) {
        if let Some(engine) = self.engine.as_mut() {
            engine.handle_timeout(now);
        }
        self.pump_engine();

        if let Some(deadline) = self.connect_timeout_deadline {
            if now >= deadline {
                self.connect_timeout_deadline = None;
                self.on_connect_timeout();
            }
        }

        if let Some(deadline) = self.reconnect_deadline {
            if now >= deadline {
                self.reconnect_deadline = None;
                self.on_reconnect_timer();
            }
        }
    }

    fn pump_engine(&mut self) {
        loop {
            let event = match self.engine.as_mut().and_then(|e| e.poll_event()) {
                Some(event) => event,
                None => break,
            };
            self.on_engine_event(event);
        }
    }

    fn on_engine_event(&mut self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Open => {
                if self.open_sub_active && self.state == ManagerState::Opening {
                    self.on_open();
                }
            }
            ConnectionEvent::Error {
                message,
                description: _,
            } => match self.state {
                // before the connection opened this is a connect failure
                ManagerState::Opening if self.open_sub_active => {
                    self.on_connect_failure(message);
                }
                ManagerState::Open => {
                    self.emit_all(|| ChannelEvent::Error {
                        message: message.clone(),
                    });
                }
                _ => {}
            },
            ConnectionEvent::Close { reason, .. } => {
                if self.state == ManagerState::Open {
                    self.on_engine_close(reason);
                }
            }
            ConnectionEvent::Data(data) => {
                if self.state == ManagerState::Open {
                    self.on_data(data);
                }
            }
            ConnectionEvent::Ping => {
                self.last_ping = Some(Instant::now());
                self.emit_all(|| ChannelEvent::Ping);
            }
            ConnectionEvent::Pong => {
                if let Some(last_ping) = self.last_ping {
                    let latency = last_ping.elapsed();
                    self.emit_all(|| ChannelEvent::Pong { latency });
                }
            }
            // handled at the connection level
            ConnectionEvent::Handshake(_)
            | ConnectionEvent::Drain
            | ConnectionEvent::Flush
            | ConnectionEvent::Upgrading(_)
            | ConnectionEvent::Upgrade(_)
            | ConnectionEvent::UpgradeError { .. } => {}
        }
    }

    fn on_open(&mut self) {
        debug!("connection open");
        self.cleanup();
        self.state = ManagerState::Open;
        self.events.push_back(ManagerEvent::Open);

        // non-root channels announce themselves on the fresh connection
        let mut announcements = Vec::new();
        for channel in self.channels.values_mut() {
            if let Some(packet) = channel.on_manager_open() {
                announcements.push(packet);
            }
        }
        for packet in announcements {
            self.packet(packet);
        }

        if self.reconnect_attempt_in_flight {
            self.on_reconnect_success();
        }
    }

    fn on_reconnect_success(&mut self) {
        let attempt = self.backoff.attempts();
        debug!(attempt, "reconnect success");
        self.reconnect_attempt_in_flight = false;
        self.reconnecting = false;
        self.backoff.reset();
        self.update_channel_sessions();
        self.emit_all(|| ChannelEvent::Reconnect { attempt });
    }

    /// A connect attempt failed before the connection opened.
    fn on_connect_failure(&mut self, message: String) {
        debug!(%message, "connect failure");
        self.cleanup();
        self.state = ManagerState::Closed;
        self.emit_all(|| ChannelEvent::ConnectError {
            message: message.clone(),
        });

        if self.reconnect_attempt_in_flight {
            self.reconnect_attempt_in_flight = false;
            self.reconnecting = false;
            self.reconnect();
            self.emit_all(|| ChannelEvent::ReconnectError {
                message: message.clone(),
            });
        } else {
            // only reconnect spontaneously on the very first failure
            self.maybe_reconnect_on_open();
        }
    }

    fn maybe_reconnect_on_open(&mut self) {
        if !self.reconnecting && self.config.reconnection && self.backoff.attempts() == 0 {
            self.reconnect();
        }
    }

    fn on_connect_timeout(&mut self) {
        if self.state != ManagerState::Opening {
            return;
        }
        debug!("connect attempt timed out");
        self.open_sub_active = false;
        if let Some(engine) = self.engine.as_mut() {
            engine.close();
        }
        self.pump_engine();
        self.on_connect_failure("timeout".to_string());
        self.emit_all(|| ChannelEvent::ConnectTimeout);
    }

    fn on_engine_close(&mut self, reason: String) {
        debug!(%reason, "connection closed");
        self.cleanup();
        self.backoff.reset();
        self.state = ManagerState::Closed;

        let mut closures = Vec::new();
        for (nsp, channel) in self.channels.iter_mut() {
            if let Some(event) = channel.on_manager_close(&reason) {
                closures.push((nsp.clone(), event));
            }
        }
        for (nsp, event) in closures {
            self.events.push_back(ManagerEvent::Channel { nsp, event });
        }
        self.events.push_back(ManagerEvent::Close { reason });

        if self.config.reconnection && !self.skip_reconnect {
            self.reconnect();
        }
    }

    fn on_data(&mut self, data: FrameData) {
        let chunk = match data {
            FrameData::Text(text) => WireData::Text(text),
            FrameData::Binary(bytes) => WireData::Binary(bytes),
        };
        match self.decoder.add(chunk) {
            Ok(Some(packet)) => self.on_decoded(packet),
            Ok(None) => {}
            // decode violations are funneled through the error path
            Err(e) => self.emit_all(|| ChannelEvent::Error {
                message: e.to_string(),
            }),
        }
    }

    fn on_decoded(&mut self, packet: Packet) {
        debug!(kind = ?packet.kind, nsp = %packet.nsp, "packet received");
        let engine_sid = self.session_id();

        let mut outgoing = Vec::new();
        let mut destroyed = Vec::new();
        for (nsp, channel) in self.channels.iter_mut() {
            let same_namespace = *nsp == packet.nsp;
            let root_error = packet.kind == PacketKind::Error && packet.nsp == "/";
            if !same_namespace && !root_error {
                continue;
            }

            let outcome = channel.on_packet(&packet);
            if outcome.connected_now {
                if let Some(sid) = engine_sid.as_deref() {
                    channel.set_session(generate_session_id(nsp, sid));
                }
            }
            for event in outcome.events {
                self.events.push_back(ManagerEvent::Channel {
                    nsp: nsp.clone(),
                    event,
                });
            }
            outgoing.extend(outcome.packets);
            if outcome.destroyed {
                destroyed.push(nsp.clone());
            }
        }

        for packet in outgoing {
            self.packet(packet);
        }
        for nsp in destroyed {
            self.on_channel_destroyed(&nsp);
        }
    }

    /// Get or create the channel for a namespace.
    pub fn channel(&mut self, nsp: &str, query: Option<String>) -> &Channel {
        if !self.channels.contains_key(nsp) {
            let channel = Channel::new(nsp, query, self.outbound.clone());
            self.channels.insert(nsp.to_string(), channel);
            if self.config.auto_connect {
                self.open_channel(nsp);
            }
        }
        &self.channels[nsp]
    }

    /// Activate a channel and make sure the connection is coming up.
    pub fn open_channel(&mut self, nsp: &str) {
        let Some(channel) = self.channels.get_mut(nsp) else {
            return;
        };
        if channel.connected() {
            return;
        }

        channel.activate();
        if !self.connecting.iter().any(|c| c == nsp) {
            self.connecting.push(nsp.to_string());
        }
        self.events.push_back(ManagerEvent::Channel {
            nsp: nsp.to_string(),
            event: ChannelEvent::Connecting,
        });

        if !self.reconnecting {
            self.open();
        }
        if self.state == ManagerState::Open {
            let announcement = self
                .channels
                .get_mut(nsp)
                .and_then(|channel| channel.on_manager_open());
            if let Some(packet) = announcement {
                self.packet(packet);
            }
        }
    }

    /// Emit an application event on a namespace.
    pub fn emit(&mut self, nsp: &str, name: &str, args: Vec<crate::protocol::packet::Data>) -> Result<()> {
        self.emit_inner(nsp, name, args, None)
    }

    /// Emit with a trailing ack callback, invoked with the server's reply.
    pub fn emit_with_ack(
        &mut self,
        nsp: &str,
        name: &str,
        args: Vec<crate::protocol::packet::Data>,
        ack: AckCallback,
    ) -> Result<()> {
        self.emit_inner(nsp, name, args, Some(ack))
    }

    fn emit_inner(
        &mut self,
        nsp: &str,
        name: &str,
        args: Vec<crate::protocol::packet::Data>,
        ack: Option<AckCallback>,
    ) -> Result<()> {
        let channel = self
            .channels
            .get_mut(nsp)
            .ok_or_else(|| crate::error::ProtocolError::Custom(format!("unknown namespace: {nsp}")))?;
        if let Some(packet) = channel.emit(name, args, ack)? {
            self.packet(packet);
        }
        Ok(())
    }

    /// Close a channel from the client side.
    pub fn close_channel(&mut self, nsp: &str) {
        let Some(channel) = self.channels.get_mut(nsp) else {
            return;
        };
        let (packet, event) = channel.close();
        if let Some(packet) = packet {
            self.packet(packet);
        }
        if let Some(event) = event {
            self.events.push_back(ManagerEvent::Channel {
                nsp: nsp.to_string(),
                event,
            });
        }
        self.on_channel_destroyed(nsp);
    }

    /// A channel was torn down; close the connection when it was the last.
    fn on_channel_destroyed(&mut self, nsp: &str) {
        self.connecting.retain(|c| c != nsp);
        if self.connecting.is_empty() {
            self.disconnect();
        }
    }

    /// Serialize one packet onto the connection.
    ///
    /// At most one encode may be in flight; packets arriving meanwhile are
    /// queued and drained strictly in arrival order.
    pub fn packet(&mut self, packet: Packet) {
        debug!(kind = ?packet.kind, nsp = %packet.nsp, "writing packet");

        if self.encoding {
            self.packet_buffer.push_back(packet);
            return;
        }

        self.encoding = true;
        let chunks = self.encoder.encode(packet);
        if let Some(engine) = self.engine.as_mut() {
            for chunk in chunks {
                let data = match chunk {
                    WireData::Text(text) => FrameData::Text(text),
                    WireData::Binary(bytes) => FrameData::Binary(bytes),
                };
                engine.send(data);
            }
        }
        self.encoding = false;
        self.process_packet_queue();
        self.pump_engine();
    }

    fn process_packet_queue(&mut self) {
        if self.encoding {
            return;
        }
        if let Some(packet) = self.packet_buffer.pop_front() {
            self.packet(packet);
        }
    }

    /// Clear per-connection state between attempts.
    fn cleanup(&mut self) {
        debug!("cleanup");
        self.packet_buffer.clear();
        self.encoding = false;
        self.last_ping = None;
        self.decoder.destroy();
        self.connect_timeout_deadline = None;
        self.reconnect_deadline = None;
        self.open_sub_active = false;
    }

    /// Disconnect locally; suppresses reconnection.
    pub fn disconnect(&mut self) {
        debug!("disconnect");
        self.skip_reconnect = true;
        self.reconnecting = false;
        self.reconnect_attempt_in_flight = false;
        if self.state == ManagerState::Opening {
            // the close event would not fire because open never happened
            self.cleanup();
        }
        self.backoff.reset();
        self.state = ManagerState::Closed;
        if let Some(engine) = self.engine.as_mut() {
            engine.close();
        }
        self.pump_engine();
    }

    /// Schedule a reconnect attempt, or give up at the configured ceiling.
    fn reconnect(&mut self) {
        if self.reconnecting || self.skip_reconnect {
            return;
        }

        if self.backoff.attempts() >= self.config.reconnection_attempts {
            debug!("reconnect failed");
            self.backoff.reset();
            self.emit_all(|| ChannelEvent::ReconnectFailed);
            self.reconnecting = false;
        } else {
            let delay = self.backoff.duration();
            debug!(?delay, "waiting before reconnect attempt");
            self.reconnecting = true;
            self.reconnect_deadline = Some(Instant::now() + delay);
        }
    }

    fn on_reconnect_timer(&mut self) {
        if self.skip_reconnect {
            return;
        }

        let attempt = self.backoff.attempts();
        debug!(attempt, "attempting reconnect");
        self.emit_all(|| ChannelEvent::ReconnectAttempt { attempt });
        self.emit_all(|| ChannelEvent::Reconnecting { attempt });

        // the events above may have prompted a disconnect
        if self.skip_reconnect {
            return;
        }

        self.reconnect_attempt_in_flight = true;
        self.open();
    }

    /// Regenerate every channel's session identifier after a reconnect.
    fn update_channel_sessions(&mut self) {
        let Some(sid) = self.session_id() else {
            return;
        };
        for (nsp, channel) in self.channels.iter_mut() {
            channel.set_session(generate_session_id(nsp, &sid));
        }
    }

    /// Broadcast a lifecycle event to every channel.
    fn emit_all(&mut self, make: impl Fn() -> ChannelEvent) {
        let namespaces: Vec<String> = self.channels.keys().cloned().collect();
        for nsp in namespaces {
            self.events.push_back(ManagerEvent::Channel {
                nsp,
                event: make(),
            });
        }
    }
}

/// `<namespace>#<connection sid>`; the root namespace omits the prefix.
fn generate_session_id(nsp: &str, sid: &str) -> String {
    if nsp == "/" {
        sid.to_string()
    } else {
        format!("{nsp}#{sid}")
    }
}
