//! Engine-layer connection state machine.
//!
//! A `Connection` owns exactly one active transport, negotiates the
//! handshake, runs the heartbeat, and probes upgrade candidates in parallel
//! once open. It exposes a frame-level duplex channel upward.
//!
//! The connection is driven from outside: transport signals are routed in
//! through [`Connection::handle_signal`], timer expirations through
//! [`Connection::handle_timeout`], and resulting events are drained with
//! [`Connection::poll_event`]. Every call runs to completion before the next
//! one starts, so plain flags guard the invariants (at most one winning
//! probe, no flush while an upgrade is pending).

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Deserialize;
use tracing::{debug, warn};

use crate::config::ConnectionConfig;
use crate::core::frame::{Frame, FrameData, FrameKind};
use crate::core::PROTOCOL_VERSION;
use crate::error::constants::{
    ERR_NO_TRANSPORTS, ERR_PING_TIMEOUT, ERR_TRANSPORT_CLOSE, ERR_TRANSPORT_ERROR,
};

use super::{
    Signal, SignalSender, SignalSink, Transport, TransportEvent, TransportFactory, TransportId,
    TransportKind, TransportOptions, TransportSignal,
};

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Unset,
    Opening,
    Open,
    Closing,
    Closed,
}

/// The JSON envelope carried by the handshake `open` frame.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandshakeData {
    pub sid: String,
    #[serde(default)]
    pub upgrades: Vec<String>,
    /// Milliseconds between pings.
    pub ping_interval: u64,
    /// Milliseconds a pong may lag before the connection is dead.
    pub ping_timeout: u64,
}

/// Events surfaced to the session layer.
#[derive(Debug)]
pub enum ConnectionEvent {
    Open,
    Handshake(HandshakeData),
    /// An inbound `message` frame's payload.
    Data(FrameData),
    /// A ping frame was flushed to the transport.
    Ping,
    Pong,
    /// The write queue fully drained.
    Drain,
    Flush,
    Upgrading(TransportKind),
    Upgrade(TransportKind),
    UpgradeError {
        message: String,
    },
    Error {
        message: String,
        description: Option<String>,
    },
    Close {
        reason: String,
        description: Option<String>,
    },
}

/// What a deferred `close()` is waiting on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PendingClose {
    Drain,
    Upgrade,
}

/// One speculative upgrade transport.
struct Probe {
    transport: Box<dyn Transport>,
    kind: TransportKind,
    /// The probe only reacts to the first packet after its ping.
    awaiting_pong: bool,
}

/// Engine-level socket: one active transport plus the upgrade machinery.
pub struct Connection {
    config: ConnectionConfig,
    factory: Arc<dyn TransportFactory>,
    signals: SignalSender,

    state: ConnectionState,
    transport: Option<Box<dyn Transport>>,
    active_id: Option<TransportId>,
    /// Candidates remaining for `open()`; construction failures consume one.
    candidates: Vec<TransportKind>,

    session_id: Option<String>,
    upgrades: Vec<TransportKind>,
    upgrading: bool,
    probes: HashMap<TransportId, Probe>,
    winning_probe: Option<TransportId>,
    /// The persistent socket worked before; honored by `remember_upgrade`.
    prior_socket_success: bool,

    write_queue: Vec<Frame>,
    /// Length of the queue prefix currently handed to the transport;
    /// removed only on drain.
    prev_buffer_len: usize,
    pending_close: Option<PendingClose>,
    /// Events released on the next successful flush (ping notification).
    flush_notifications: Vec<ConnectionEvent>,

    ping_interval: Duration,
    ping_timeout: Duration,
    ping_interval_deadline: Option<Instant>,
    pong_deadline: Option<Instant>,
    /// The pong deadline re-arms on inbound frames only after the handshake.
    heartbeat_armed: bool,

    events: VecDeque<ConnectionEvent>,
    next_transport_id: u64,
}

impl Connection {
    pub fn new(
        config: ConnectionConfig,
        factory: Arc<dyn TransportFactory>,
        signals: SignalSender,
    ) -> Self {
        let candidates = config.transports.clone();
        Self {
            config,
            factory,
            signals,
            state: ConnectionState::Unset,
            transport: None,
            active_id: None,
            candidates,
            session_id: None,
            upgrades: Vec::new(),
            upgrading: false,
            probes: HashMap::new(),
            winning_probe: None,
            prior_socket_success: false,
            write_queue: Vec::new(),
            prev_buffer_len: 0,
            pending_close: None,
            flush_notifications: Vec::new(),
            ping_interval: Duration::from_millis(3000),
            ping_timeout: Duration::from_millis(3000),
            ping_interval_deadline: None,
            pong_deadline: None,
            heartbeat_armed: false,
            events: VecDeque::new(),
            next_transport_id: 0,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    pub fn upgrading(&self) -> bool {
        self.upgrading
    }

    /// Drain the next pending event.
    pub fn poll_event(&mut self) -> Option<ConnectionEvent> {
        self.events.pop_front()
    }

    /// Earliest pending timer deadline, if any.
    pub fn poll_deadline(&self) -> Option<Instant> {
        match (self.pong_deadline, self.ping_interval_deadline) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Open the connection by picking the first viable transport.
    pub fn open(&mut self) {
        let kind = if self.config.remember_upgrade
            && self.prior_socket_success
            && self.candidates.contains(&TransportKind::PersistentSocket)
        {
            TransportKind::PersistentSocket
        } else if self.candidates.is_empty() {
            // reported as an event so it can be listened to
            self.emit(ConnectionEvent::Error {
                message: ERR_NO_TRANSPORTS.to_string(),
                description: None,
            });
            return;
        } else {
            self.candidates[0]
        };

        self.state = ConnectionState::Opening;

        match self.create_transport(kind) {
            Ok((id, mut transport)) => {
                transport.open();
                self.set_transport(id, transport);
            }
            Err(e) => {
                // discard the failed candidate and try the next one
                warn!(transport = %kind, error = %e, "transport construction failed");
                self.candidates.retain(|c| *c != kind);
                self.open();
            }
        }
    }

    fn create_transport(
        &mut self,
        kind: TransportKind,
    ) -> crate::error::Result<(TransportId, Box<dyn Transport>)> {
        debug!(transport = %kind, "creating transport");

        let mut query = self.config.query.clone();
        query.insert("EIO".to_string(), PROTOCOL_VERSION.to_string());
        query.insert("transport".to_string(), kind.name().to_string());

        let options = TransportOptions {
            hostname: self.config.hostname.clone(),
            port: self.config.port,
            secure: self.config.secure,
            path: self.config.normalized_path(),
            query,
            timestamp_param: self.config.timestamp_param.clone(),
            timestamp_requests: self.config.timestamp_requests,
            force_base64: self.config.force_base64,
            extra_headers: self.config.extra_headers.clone(),
            request_timeout: self.config.request_timeout,
        };

        let id = TransportId(self.next_transport_id);
        self.next_transport_id += 1;
        let sink = SignalSink::new(id, self.signals.clone());

        let mut transport = self.factory.create(kind, options, sink)?;
        if let Some(sid) = &self.session_id {
            transport.set_session_id(sid);
        }
        Ok((id, transport))
    }

    /// Replace the active transport, detaching (and closing) the previous
    /// one first.
    fn set_transport(&mut self, id: TransportId, transport: Box<dyn Transport>) {
        debug!(transport = %transport.kind(), "setting transport");

        if let Some(mut old) = self.transport.take() {
            debug!(transport = %old.kind(), "clearing existing transport");
            old.close();
        }
        self.active_id = Some(id);
        self.transport = Some(transport);
    }

    /// Route a transport signal to its owner. Signals from detached
    /// transports fall through.
    pub fn handle_signal(&mut self, signal: TransportSignal) {
        if Some(signal.transport) == self.active_id {
            match signal.signal {
                Signal::Event(event) => self.on_transport_event(event),
                Signal::Io(completion) => {
                    if let Some(transport) = self.transport.as_mut() {
                        transport.handle_io(completion);
                    }
                }
            }
        } else if self.probes.contains_key(&signal.transport) {
            match signal.signal {
                Signal::Event(event) => self.on_probe_event(signal.transport, event),
                Signal::Io(completion) => {
                    if let Some(probe) = self.probes.get_mut(&signal.transport) {
                        probe.transport.handle_io(completion);
                    }
                }
            }
        } else {
            debug!(id = ?signal.transport, "signal for a detached transport");
        }
    }

    /// Dispatch any expired timers.
    pub fn handle_timeout(&mut self, now: Instant) {
        if let Some(deadline) = self.pong_deadline {
            if now >= deadline {
                self.pong_deadline = None;
                if self.state != ConnectionState::Closed {
                    self.on_close(ERR_PING_TIMEOUT, None);
                    return;
                }
            }
        }

        if let Some(deadline) = self.ping_interval_deadline {
            if now >= deadline {
                self.ping_interval_deadline = None;
                debug!(timeout = ?self.ping_timeout, "writing ping frame");
                self.ping();
            }
        }
    }

    fn on_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Packet(frame) => self.on_packet(frame),
            TransportEvent::Drain => self.on_drain(),
            TransportEvent::Error {
                message,
                description,
            } => self.on_error(message, description),
            TransportEvent::Close => self.on_close(ERR_TRANSPORT_CLOSE, None),
            TransportEvent::Paused => self.on_active_paused(),
            // the handshake frame, not the transport, opens the connection
            TransportEvent::Open => {}
        }
    }

    fn on_packet(&mut self, frame: Frame) {
        if !matches!(
            self.state,
            ConnectionState::Opening | ConnectionState::Open | ConnectionState::Closing
        ) {
            debug!(state = ?self.state, "frame received while not connected");
            return;
        }

        debug!(kind = ?frame.kind, "frame received");

        // prolong liveness on any inbound frame
        if self.heartbeat_armed {
            self.on_heartbeat(None);
        }

        match frame.kind {
            FrameKind::Open => match frame.data.as_text().map(serde_json::from_str) {
                Some(Ok(handshake)) => self.on_handshake(handshake),
                _ => self.on_error("invalid handshake".to_string(), None),
            },
            FrameKind::Pong => {
                self.set_ping();
                self.emit(ConnectionEvent::Pong);
            }
            FrameKind::Error => {
                let description = frame.data.as_text().map(str::to_string);
                self.on_error("server error".to_string(), description);
            }
            FrameKind::Message => {
                self.emit(ConnectionEvent::Data(frame.data));
            }
            _ => {}
        }
    }

    fn on_handshake(&mut self, handshake: HandshakeData) {
        self.session_id = Some(handshake.sid.clone());
        if let Some(transport) = self.transport.as_mut() {
            transport.set_session_id(&handshake.sid);
        }
        self.upgrades = self.filter_upgrades(&handshake.upgrades);
        self.ping_interval = Duration::from_millis(handshake.ping_interval);
        self.ping_timeout = Duration::from_millis(handshake.ping_timeout);
        self.emit(ConnectionEvent::Handshake(handshake));

        self.on_open();
        // in case an open handler closed the connection
        if self.state == ConnectionState::Closed {
            return;
        }
        self.set_ping();
        self.heartbeat_armed = true;
    }

    fn on_open(&mut self) {
        debug!("connection open");
        self.state = ConnectionState::Open;
        self.prior_socket_success = self
            .transport
            .as_ref()
            .map(|t| t.kind() == TransportKind::PersistentSocket)
            .unwrap_or(false);
        self.emit(ConnectionEvent::Open);
        self.flush();

        if self.state == ConnectionState::Open && self.config.upgrade {
            debug!(candidates = self.upgrades.len(), "starting upgrade probes");
            let active = self.transport.as_ref().map(|t| t.kind());
            for kind in self.upgrades.clone() {
                if Some(kind) != active {
                    self.probe(kind);
                }
            }
        }
    }

    /// Intersection of offered upgrades and locally configured transports,
    /// preserving server order.
    fn filter_upgrades(&self, offered: &[String]) -> Vec<TransportKind> {
        offered
            .iter()
            .filter_map(|name| TransportKind::from_name(name))
            .filter(|kind| self.config.transports.contains(kind))
            .collect()
    }

    fn probe(&mut self, kind: TransportKind) {
        debug!(transport = %kind, "probing transport");
        self.prior_socket_success = false;

        match self.create_transport(kind) {
            Ok((id, mut transport)) => {
                transport.open();
                self.probes.insert(
                    id,
                    Probe {
                        transport,
                        kind,
                        awaiting_pong: false,
                    },
                );
            }
            Err(e) => {
                self.emit(ConnectionEvent::UpgradeError {
                    message: format!("probe error: {e}"),
                });
            }
        }
    }

    fn on_probe_event(&mut self, id: TransportId, event: TransportEvent) {
        match event {
            TransportEvent::Open => self.on_probe_open(id),
            TransportEvent::Packet(frame) => self.on_probe_packet(id, frame),
            TransportEvent::Error { message, .. } => self.on_probe_error(id, &message),
            TransportEvent::Close => self.on_probe_error(id, "transport closed"),
            TransportEvent::Drain | TransportEvent::Paused => {}
        }
    }

    fn on_probe_open(&mut self, id: TransportId) {
        // a candidate that regresses binary support is not an upgrade
        if self.config.only_binary_upgrades {
            let regresses = !self
                .probes
                .get(&id)
                .map(|p| p.transport.supports_binary())
                .unwrap_or(false)
                && self
                    .transport
                    .as_ref()
                    .map(|t| t.supports_binary())
                    .unwrap_or(false);
            if regresses {
                self.freeze_probe(id, Some("probe error"));
                return;
            }
        }

        let write_failed = match self.probes.get_mut(&id) {
            Some(probe) => {
                debug!(transport = %probe.kind, "probe transport opened");
                probe.awaiting_pong = true;
                probe.transport.write(vec![Frame::probe_ping()]).is_err()
            }
            None => false,
        };
        if write_failed {
            self.on_probe_error(id, "probe write failed");
        }
    }

    fn on_probe_packet(&mut self, id: TransportId, frame: Frame) {
        let probe = match self.probes.get_mut(&id) {
            Some(probe) => probe,
            None => return,
        };
        if !probe.awaiting_pong {
            return;
        }
        probe.awaiting_pong = false;
        let kind = probe.kind;

        if frame.is_probe_pong() {
            debug!(transport = %kind, "probe pong");
            self.upgrading = true;
            self.winning_probe = Some(id);
            self.prior_socket_success = kind == TransportKind::PersistentSocket;
            self.emit(ConnectionEvent::Upgrading(kind));

            // only one probe may win; close the siblings
            let siblings: Vec<TransportId> =
                self.probes.keys().copied().filter(|k| *k != id).collect();
            for sibling in siblings {
                debug!("aborting sibling probe");
                self.freeze_probe(sibling, None);
            }

            debug!("pausing current transport");
            if let Some(transport) = self.transport.as_mut() {
                transport.pause();
            }
        } else {
            debug!(transport = %kind, "probe failed");
            self.freeze_probe(id, Some("probe error"));
        }
    }

    fn on_probe_error(&mut self, id: TransportId, message: &str) {
        self.freeze_probe(id, Some(&format!("probe error: {message}")));
    }

    /// Abort a probe: detach it, close its transport, and unwind the
    /// upgrade flags if it was the winner.
    fn freeze_probe(&mut self, id: TransportId, error: Option<&str>) {
        let Some(mut probe) = self.probes.remove(&id) else {
            return;
        };
        probe.transport.close();

        if let Some(message) = error {
            debug!(transport = %probe.kind, message, "probe frozen");
            self.emit(ConnectionEvent::UpgradeError {
                message: message.to_string(),
            });
        }

        if self.winning_probe == Some(id) {
            self.winning_probe = None;
            self.upgrading = false;
            if self.pending_close == Some(PendingClose::Upgrade) {
                self.pending_close = None;
                self.do_forced_close();
            } else {
                self.flush();
            }
        }
    }

    /// The active transport confirmed its pause: complete the upgrade.
    fn on_active_paused(&mut self) {
        let Some(winner) = self.winning_probe.take() else {
            return;
        };
        if self.state == ConnectionState::Closed {
            return;
        }
        let Some(probe) = self.probes.remove(&winner) else {
            return;
        };

        debug!(transport = %probe.kind, "changing transport and sending upgrade frame");
        let kind = probe.kind;
        self.set_transport(winner, probe.transport);
        if let Some(transport) = self.transport.as_mut() {
            let _ = transport.write(vec![Frame::new(FrameKind::Upgrade, FrameData::from(""))]);
        }
        self.emit(ConnectionEvent::Upgrade(kind));
        self.upgrading = false;

        if self.pending_close == Some(PendingClose::Upgrade) {
            self.pending_close = None;
            self.do_forced_close();
        } else {
            self.flush();
        }
    }

    /// Re-arm the periodic ping timer.
    fn set_ping(&mut self) {
        self.ping_interval_deadline = Some(Instant::now() + self.ping_interval);
    }

    /// Re-arm the pong deadline. Without an explicit timeout the full
    /// interval-plus-timeout window applies.
    fn on_heartbeat(&mut self, timeout: Option<Duration>) {
        let window = timeout.unwrap_or(self.ping_interval + self.ping_timeout);
        self.pong_deadline = Some(Instant::now() + window);
    }

    fn ping(&mut self) {
        self.send_frame(
            FrameKind::Ping,
            FrameData::from(""),
            Some(ConnectionEvent::Ping),
        );
        self.on_heartbeat(Some(self.ping_timeout));
    }

    /// Queue a `message` frame.
    pub fn send(&mut self, data: FrameData) {
        self.send_frame(FrameKind::Message, data, None);
    }

    fn send_frame(
        &mut self,
        kind: FrameKind,
        data: FrameData,
        flush_notification: Option<ConnectionEvent>,
    ) {
        if matches!(self.state, ConnectionState::Closing | ConnectionState::Closed) {
            return;
        }

        self.write_queue.push(Frame::new(kind, data));
        if let Some(event) = flush_notification {
            self.flush_notifications.push(event);
        }
        self.flush();
    }

    /// Flush is a no-op unless the connection is live, the transport is
    /// writable, no upgrade is pending, and frames are queued.
    fn flush(&mut self) {
        let writable = self
            .transport
            .as_ref()
            .map(|t| t.writable())
            .unwrap_or(false);
        if self.state == ConnectionState::Closed
            || !writable
            || self.upgrading
            || self.write_queue.is_empty()
        {
            return;
        }

        debug!(frames = self.write_queue.len(), "flushing write queue");
        let frames: Vec<Frame> = self.write_queue.clone();
        self.prev_buffer_len = frames.len();
        if let Some(transport) = self.transport.as_mut() {
            if let Err(e) = transport.write(frames) {
                self.on_error(e.to_string(), None);
                return;
            }
        }
        self.emit(ConnectionEvent::Flush);
        for event in std::mem::take(&mut self.flush_notifications) {
            self.emit(event);
        }
    }

    /// The sent queue prefix is removed only on the transport's drain
    /// acknowledgement, preserving at-most-once delivery into the transport.
    fn on_drain(&mut self) {
        self.write_queue.drain(..self.prev_buffer_len.min(self.write_queue.len()));
        self.prev_buffer_len = 0;

        if self.write_queue.is_empty() {
            self.emit(ConnectionEvent::Drain);
            if self.pending_close == Some(PendingClose::Drain) {
                self.pending_close = None;
                if self.upgrading {
                    self.pending_close = Some(PendingClose::Upgrade);
                } else {
                    self.do_forced_close();
                }
            }
        } else {
            self.flush();
        }
    }

    /// Close the connection, waiting first for queued frames to drain and
    /// for a pending upgrade to resolve.
    pub fn close(&mut self) {
        if !matches!(
            self.state,
            ConnectionState::Opening | ConnectionState::Open
        ) {
            return;
        }
        self.state = ConnectionState::Closing;

        if !self.write_queue.is_empty() {
            self.pending_close = Some(PendingClose::Drain);
        } else if self.upgrading {
            self.pending_close = Some(PendingClose::Upgrade);
        } else {
            self.do_forced_close();
        }
    }

    fn do_forced_close(&mut self) {
        debug!("connection closing - telling transport to close");
        self.on_close("forced close", None);
    }

    fn on_error(&mut self, message: String, description: Option<String>) {
        debug!(%message, "connection error");
        self.prior_socket_success = false;
        self.emit(ConnectionEvent::Error {
            message: message.clone(),
            description: description.clone(),
        });
        self.on_close(ERR_TRANSPORT_ERROR, Some(message));
    }

    fn on_close(&mut self, reason: &str, description: Option<String>) {
        if !matches!(
            self.state,
            ConnectionState::Opening | ConnectionState::Open | ConnectionState::Closing
        ) {
            return;
        }

        debug!(%reason, "connection close");

        self.ping_interval_deadline = None;
        self.pong_deadline = None;
        self.heartbeat_armed = false;

        // detach before closing so the transport's own close event is
        // ignored by the router
        self.active_id = None;
        if let Some(mut transport) = self.transport.take() {
            transport.close();
        }

        self.state = ConnectionState::Closed;
        self.session_id = None;

        self.emit(ConnectionEvent::Close {
            reason: reason.to_string(),
            description,
        });

        // abort outstanding probes; their errors surface after the close
        let outstanding: Vec<TransportId> = self.probes.keys().copied().collect();
        for id in outstanding {
            self.freeze_probe(id, Some("probe error: connection closed"));
        }

        self.write_queue.clear();
        self.prev_buffer_len = 0;
        self.upgrading = false;
        self.winning_probe = None;
        self.pending_close = None;
        self.flush_notifications.clear();
    }

    fn emit(&mut self, event: ConnectionEvent) {
        self.events.push_back(event);
    }
}

#[cfg(test)]
pub(crate) mod mock {
    //! A scriptable transport for connection- and session-level tests.

    use std::sync::{Arc, Mutex};

    use crate::core::frame::Frame;
    use crate::core::payload::decode_frame;
    use crate::error::{ProtocolError, Result};
    use crate::transport::{
        IoCompletion, SignalSink, Transport, TransportEvent, TransportFactory, TransportKind,
        TransportOptions, TransportState,
    };

    #[derive(Debug, Default)]
    pub struct MockState {
        pub state: TransportState,
        pub writable: bool,
        pub supports_binary: bool,
        pub written: Vec<Vec<Frame>>,
        pub closed: bool,
        pub pause_requested: bool,
        /// Complete pauses immediately instead of waiting for the test.
        pub auto_pause: bool,
        pub session_id: Option<String>,
    }

    pub struct MockTransport {
        pub kind: TransportKind,
        pub shared: Arc<Mutex<MockState>>,
        pub sink: SignalSink,
    }

    impl Transport for MockTransport {
        fn kind(&self) -> TransportKind {
            self.kind
        }

        fn ready_state(&self) -> TransportState {
            self.shared.lock().unwrap().state
        }

        fn writable(&self) -> bool {
            self.shared.lock().unwrap().writable
        }

        fn supports_binary(&self) -> bool {
            self.shared.lock().unwrap().supports_binary
        }

        fn open(&mut self) {
            self.shared.lock().unwrap().state = TransportState::Opening;
        }

        fn close(&mut self) {
            let mut shared = self.shared.lock().unwrap();
            shared.state = TransportState::Closed;
            shared.closed = true;
        }

        fn write(&mut self, frames: Vec<Frame>) -> Result<()> {
            let mut shared = self.shared.lock().unwrap();
            if shared.state != TransportState::Open {
                return Err(ProtocolError::TransportNotOpen);
            }
            shared.writable = false;
            shared.written.push(frames);
            Ok(())
        }

        fn pause(&mut self) {
            let mut shared = self.shared.lock().unwrap();
            shared.pause_requested = true;
            if shared.auto_pause {
                shared.state = TransportState::Paused;
                drop(shared);
                self.sink.event(TransportEvent::Paused);
            } else {
                shared.state = TransportState::Pausing;
            }
        }

        fn handle_io(&mut self, completion: IoCompletion) {
            match completion {
                IoCompletion::Connected => {
                    let mut shared = self.shared.lock().unwrap();
                    shared.state = TransportState::Open;
                    shared.writable = true;
                    drop(shared);
                    self.sink.event(TransportEvent::Open);
                }
                IoCompletion::Data(data) => {
                    self.sink.event(TransportEvent::Packet(decode_frame(&data)));
                }
                IoCompletion::WriteDone => {
                    self.shared.lock().unwrap().writable = true;
                    self.sink.event(TransportEvent::Drain);
                }
                IoCompletion::Error(message) => {
                    self.sink.event(TransportEvent::Error {
                        message,
                        description: None,
                    });
                }
                IoCompletion::Closed => {
                    self.shared.lock().unwrap().state = TransportState::Closed;
                    self.sink.event(TransportEvent::Close);
                }
            }
        }

        fn set_session_id(&mut self, sid: &str) {
            self.shared.lock().unwrap().session_id = Some(sid.to_string());
        }
    }

    /// One created transport as seen by the test.
    #[derive(Clone)]
    pub struct MockHandle {
        pub kind: TransportKind,
        pub shared: Arc<Mutex<MockState>>,
        pub sink: SignalSink,
    }

    impl MockHandle {
        /// Simulate the transport finishing its connection setup.
        pub fn connect(&self) {
            self.sink.io(IoCompletion::Connected);
        }

        /// Deliver an encoded frame from the server.
        pub fn frame(&self, encoded: &str) {
            self.sink.io(IoCompletion::Data(
                crate::core::payload::WireData::Text(encoded.to_string()),
            ));
        }

        /// Acknowledge the outstanding write.
        pub fn drain(&self) {
            self.sink.io(IoCompletion::WriteDone);
        }

        pub fn error(&self, message: &str) {
            self.sink.io(IoCompletion::Error(message.to_string()));
        }

        pub fn written(&self) -> Vec<Vec<Frame>> {
            self.shared.lock().unwrap().written.clone()
        }

        pub fn closed(&self) -> bool {
            self.shared.lock().unwrap().closed
        }
    }

    /// Factory recording every transport it creates.
    #[derive(Default)]
    pub struct MockFactory {
        pub created: Mutex<Vec<MockHandle>>,
        /// Kinds the factory refuses to construct.
        pub fail_kinds: Mutex<Vec<TransportKind>>,
        pub binary_support: Mutex<std::collections::HashMap<&'static str, bool>>,
    }

    impl MockFactory {
        pub fn handle(&self, index: usize) -> MockHandle {
            self.created.lock().unwrap()[index].clone()
        }

        pub fn count(&self) -> usize {
            self.created.lock().unwrap().len()
        }
    }

    impl TransportFactory for MockFactory {
        fn create(
            &self,
            kind: TransportKind,
            _options: TransportOptions,
            sink: SignalSink,
        ) -> Result<Box<dyn Transport>> {
            if self.fail_kinds.lock().unwrap().contains(&kind) {
                return Err(ProtocolError::UnknownTransport(kind.name().to_string()));
            }

            let supports_binary = *self
                .binary_support
                .lock()
                .unwrap()
                .get(kind.name())
                .unwrap_or(&true);

            let shared = Arc::new(Mutex::new(MockState {
                supports_binary,
                auto_pause: true,
                ..MockState::default()
            }));
            let handle = MockHandle {
                kind,
                shared: shared.clone(),
                sink: sink.clone(),
            };
            self.created.lock().unwrap().push(handle);
            Ok(Box::new(MockTransport { kind, shared, sink }))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::mock::MockFactory;
    use super::*;
    use tokio::sync::mpsc::{self, UnboundedReceiver};

    const HANDSHAKE: &str =
        "0{\"sid\":\"abc\",\"upgrades\":[\"persistent-socket\"],\"pingInterval\":25000,\"pingTimeout\":5000}";

    fn connection(
        mutate: impl FnOnce(&mut ConnectionConfig),
    ) -> (
        Connection,
        Arc<MockFactory>,
        UnboundedReceiver<TransportSignal>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut config = ConnectionConfig::default();
        mutate(&mut config);
        let factory = Arc::new(MockFactory::default());
        let connection = Connection::new(config, factory.clone(), tx);
        (connection, factory, rx)
    }

    /// Feed queued signals back into the connection until quiescent.
    fn pump(connection: &mut Connection, rx: &mut UnboundedReceiver<TransportSignal>) {
        while let Ok(signal) = rx.try_recv() {
            connection.handle_signal(signal);
        }
    }

    fn events(connection: &mut Connection) -> Vec<ConnectionEvent> {
        let mut out = Vec::new();
        while let Some(event) = connection.poll_event() {
            out.push(event);
        }
        out
    }

    fn open_connection(
        mutate: impl FnOnce(&mut ConnectionConfig),
    ) -> (
        Connection,
        Arc<MockFactory>,
        UnboundedReceiver<TransportSignal>,
    ) {
        let (mut connection, factory, mut rx) = connection(mutate);
        connection.open();
        let transport = factory.handle(0);
        transport.connect();
        transport.frame(HANDSHAKE);
        pump(&mut connection, &mut rx);
        (connection, factory, rx)
    }

    #[test]
    fn open_without_transports_reports_an_error() {
        let (mut connection, _factory, _rx) = connection(|c| c.transports.clear());
        connection.open();
        let emitted = events(&mut connection);
        assert!(matches!(
            &emitted[..],
            [ConnectionEvent::Error { message, .. }] if message == ERR_NO_TRANSPORTS
        ));
    }

    #[test]
    fn construction_failure_falls_back_to_the_next_candidate() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let factory = Arc::new(MockFactory::default());
        factory
            .fail_kinds
            .lock()
            .unwrap()
            .push(TransportKind::Polling);
        let mut connection = Connection::new(ConnectionConfig::default(), factory.clone(), tx);

        connection.open();
        assert_eq!(factory.count(), 1);
        assert_eq!(
            factory.handle(0).kind,
            TransportKind::PersistentSocket
        );
        assert_eq!(connection.state(), ConnectionState::Opening);
    }

    #[test]
    fn handshake_opens_the_connection_and_probes_upgrades() {
        let (mut connection, factory, mut rx) = open_connection(|_| {});

        assert_eq!(connection.state(), ConnectionState::Open);
        assert_eq!(connection.session_id(), Some("abc"));

        let emitted = events(&mut connection);
        assert!(emitted
            .iter()
            .any(|e| matches!(e, ConnectionEvent::Handshake(h) if h.sid == "abc")));
        assert!(emitted.iter().any(|e| matches!(e, ConnectionEvent::Open)));

        // one probe for the offered persistent socket
        assert_eq!(factory.count(), 2);
        let probe = factory.handle(1);
        assert_eq!(probe.kind, TransportKind::PersistentSocket);

        // once the probe opens it sends ping "probe"
        probe.connect();
        pump(&mut connection, &mut rx);
        assert_eq!(probe.written(), vec![vec![Frame::probe_ping()]]);
    }

    #[test]
    fn successful_probe_swaps_the_transport() {
        let (mut connection, factory, mut rx) = open_connection(|_| {});
        events(&mut connection);

        let polling = factory.handle(0);
        let probe = factory.handle(1);
        probe.connect();
        pump(&mut connection, &mut rx);

        probe.frame("3probe");
        pump(&mut connection, &mut rx);

        assert!(!connection.upgrading());
        assert!(polling.closed());
        // the new transport carried the upgrade frame
        let written = probe.written();
        assert_eq!(written.last().unwrap()[0].kind, FrameKind::Upgrade);

        let emitted = events(&mut connection);
        assert!(emitted
            .iter()
            .any(|e| matches!(e, ConnectionEvent::Upgrading(TransportKind::PersistentSocket))));
        assert!(emitted
            .iter()
            .any(|e| matches!(e, ConnectionEvent::Upgrade(TransportKind::PersistentSocket))));
    }

    #[test]
    fn only_one_probe_may_win() {
        // offer the same candidate twice to race two live probes
        let raced = "0{\"sid\":\"abc\",\"upgrades\":[\"persistent-socket\",\"persistent-socket\"],\"pingInterval\":25000,\"pingTimeout\":5000}";
        let (mut connection, factory, mut rx) = connection(|_| {});
        connection.open();
        let polling = factory.handle(0);
        polling.connect();
        polling.frame(raced);
        pump(&mut connection, &mut rx);

        let probe_a = factory.handle(1);
        let probe_b = factory.handle(2);
        probe_a.connect();
        probe_b.connect();
        pump(&mut connection, &mut rx);
        assert_eq!(probe_a.written().len(), 1);
        assert_eq!(probe_b.written().len(), 1);

        // A answers first and wins; B is force-closed
        probe_a.frame("3probe");
        pump(&mut connection, &mut rx);
        assert!(probe_b.closed());
        assert!(!probe_a.closed());

        // B's late pong goes to a detached transport and changes nothing
        probe_b.frame("3probe");
        pump(&mut connection, &mut rx);

        let emitted = events(&mut connection);
        let upgrades = emitted
            .iter()
            .filter(|e| matches!(e, ConnectionEvent::Upgrade(_)))
            .count();
        assert_eq!(upgrades, 1);
    }

    #[test]
    fn binary_regressing_probe_is_vetoed() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut config = ConnectionConfig::default();
        config.only_binary_upgrades = true;
        let factory = Arc::new(MockFactory::default());
        factory
            .binary_support
            .lock()
            .unwrap()
            .insert("persistent-socket", false);
        let mut connection = Connection::new(config, factory.clone(), tx);

        connection.open();
        let transport = factory.handle(0);
        transport.connect();
        transport.frame(HANDSHAKE);
        pump(&mut connection, &mut rx);

        let probe = factory.handle(1);
        probe.connect();
        pump(&mut connection, &mut rx);

        assert!(probe.closed());
        assert!(probe.written().is_empty());
        let emitted = events(&mut connection);
        assert!(emitted
            .iter()
            .any(|e| matches!(e, ConnectionEvent::UpgradeError { .. })));
    }

    #[test]
    fn write_queue_prefix_is_removed_only_on_drain() {
        let (mut connection, factory, mut rx) = open_connection(|c| c.upgrade = false);
        events(&mut connection);
        let transport = factory.handle(0);

        connection.send(FrameData::from("one"));
        // first flush took the queue prefix; the next send must wait
        connection.send(FrameData::from("two"));
        pump(&mut connection, &mut rx);
        assert_eq!(transport.written().len(), 1);
        assert_eq!(transport.written()[0][0].data.as_text(), Some("one"));

        transport.drain();
        pump(&mut connection, &mut rx);
        let written = transport.written();
        assert_eq!(written.len(), 2);
        assert_eq!(written[1][0].data.as_text(), Some("two"));
    }

    #[test]
    fn ping_interval_sends_a_ping_and_arms_the_pong_deadline() {
        let (mut connection, factory, mut rx) = open_connection(|c| c.upgrade = false);
        events(&mut connection);
        let transport = factory.handle(0);

        let fire_at = Instant::now() + Duration::from_millis(25000) + Duration::from_millis(1);
        connection.handle_timeout(fire_at);
        pump(&mut connection, &mut rx);

        let written = transport.written();
        assert_eq!(written.last().unwrap()[0].kind, FrameKind::Ping);
        assert!(events(&mut connection)
            .iter()
            .any(|e| matches!(e, ConnectionEvent::Ping)));
        assert!(connection.poll_deadline().is_some());
    }

    #[test]
    fn missed_pong_closes_with_ping_timeout() {
        let (mut connection, _factory, mut rx) = open_connection(|c| c.upgrade = false);
        events(&mut connection);

        // the interval timer fires and sends a ping, arming the pong
        // deadline; letting that lapse too kills the connection
        connection.handle_timeout(Instant::now() + Duration::from_millis(25001));
        let late = Instant::now() + Duration::from_millis(25000 + 5000) + Duration::from_millis(2);
        connection.handle_timeout(late);
        pump(&mut connection, &mut rx);

        assert_eq!(connection.state(), ConnectionState::Closed);
        assert!(connection.session_id().is_none());
        let emitted = events(&mut connection);
        assert!(emitted.iter().any(
            |e| matches!(e, ConnectionEvent::Close { reason, .. } if reason == ERR_PING_TIMEOUT)
        ));
    }

    #[test]
    fn pong_rearms_the_ping_cycle() {
        let (mut connection, factory, mut rx) = open_connection(|c| c.upgrade = false);
        events(&mut connection);

        factory.handle(0).frame("3");
        pump(&mut connection, &mut rx);
        assert!(events(&mut connection)
            .iter()
            .any(|e| matches!(e, ConnectionEvent::Pong)));

        // a pong right before the deadline keeps the connection alive
        let near = Instant::now() + Duration::from_millis(25000);
        connection.handle_timeout(near);
        assert_ne!(connection.state(), ConnectionState::Closed);
    }

    #[test]
    fn transport_error_closes_and_reports() {
        let (mut connection, factory, mut rx) = open_connection(|c| c.upgrade = false);
        events(&mut connection);

        factory.handle(0).error("connection reset");
        pump(&mut connection, &mut rx);

        assert_eq!(connection.state(), ConnectionState::Closed);
        let emitted = events(&mut connection);
        assert!(emitted
            .iter()
            .any(|e| matches!(e, ConnectionEvent::Error { message, .. } if message == "connection reset")));
        assert!(emitted.iter().any(
            |e| matches!(e, ConnectionEvent::Close { reason, .. } if reason == ERR_TRANSPORT_ERROR)
        ));
    }

    #[test]
    fn close_waits_for_pending_frames_to_drain() {
        let (mut connection, factory, mut rx) = open_connection(|c| c.upgrade = false);
        events(&mut connection);
        let transport = factory.handle(0);

        connection.send(FrameData::from("pending"));
        pump(&mut connection, &mut rx);
        connection.close();
        assert_eq!(connection.state(), ConnectionState::Closing);
        assert!(events(&mut connection)
            .iter()
            .all(|e| !matches!(e, ConnectionEvent::Close { .. })));

        transport.drain();
        pump(&mut connection, &mut rx);
        assert_eq!(connection.state(), ConnectionState::Closed);
        assert!(events(&mut connection).iter().any(
            |e| matches!(e, ConnectionEvent::Close { reason, .. } if reason == "forced close")
        ));
    }

    #[test]
    fn message_frames_surface_as_data() {
        let (mut connection, factory, mut rx) = open_connection(|c| c.upgrade = false);
        events(&mut connection);

        factory.handle(0).frame("4hello");
        pump(&mut connection, &mut rx);
        let emitted = events(&mut connection);
        assert!(emitted
            .iter()
            .any(|e| matches!(e, ConnectionEvent::Data(FrameData::Text(t)) if t == "hello")));
    }
}
