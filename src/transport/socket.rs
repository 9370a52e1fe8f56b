//! Generic persistent-socket transport.
//!
//! Frames travel one per socket message, so no payload concatenation is
//! involved; binary frames stay raw. The concrete socket lives behind
//! [`SocketIo`]: `connect`/`send`/`close` are fire-and-forget, completions
//! come back through the signal channel.

use tracing::debug;

use crate::core::frame::Frame;
use crate::core::payload::{decode_frame, encode_frame, WireData};
use crate::error::{ProtocolError, Result};

use super::{
    IoCompletion, SignalSink, Transport, TransportEvent, TransportKind, TransportOptions,
    TransportState,
};

/// The narrow persistent-socket contract.
pub trait SocketIo: Send {
    /// Start connecting to `uri`.
    fn connect(&mut self, uri: &str);

    /// Send one socket message. A `WriteDone` completion follows each send.
    fn send(&mut self, data: WireData);

    /// Close the socket.
    fn close(&mut self);
}

/// Persistent-socket transport over a [`SocketIo`] collaborator.
pub struct SocketTransport<IO: SocketIo> {
    io: IO,
    sink: SignalSink,
    options: TransportOptions,
    state: TransportState,
    writable: bool,
    supports_binary: bool,
    session_id: Option<String>,
    /// Sends awaiting their completion before the next drain.
    pending_writes: usize,
}

impl<IO: SocketIo> SocketTransport<IO> {
    pub fn new(io: IO, options: TransportOptions, sink: SignalSink) -> Self {
        let supports_binary = !options.force_base64;
        Self {
            io,
            sink,
            options,
            state: TransportState::Unset,
            writable: false,
            supports_binary,
            session_id: None,
            pending_writes: 0,
        }
    }

    fn uri(&self) -> String {
        let mut extra = std::collections::BTreeMap::new();
        if let Some(sid) = &self.session_id {
            extra.insert("sid".to_string(), sid.clone());
        }
        self.options.uri("wss", "ws", &extra)
    }

    fn on_connected(&mut self) {
        self.state = TransportState::Open;
        self.writable = true;
        self.sink.event(TransportEvent::Open);
    }

    fn on_drained(&mut self) {
        self.writable = true;
        self.sink.event(TransportEvent::Drain);
        self.maybe_paused();
    }

    fn on_close(&mut self) {
        self.state = TransportState::Closed;
        self.sink.event(TransportEvent::Close);
    }

    fn maybe_paused(&mut self) {
        if self.state == TransportState::Pausing && self.pending_writes == 0 {
            debug!("paused");
            self.state = TransportState::Paused;
            self.sink.event(TransportEvent::Paused);
        }
    }
}

impl<IO: SocketIo> Transport for SocketTransport<IO> {
    fn kind(&self) -> TransportKind {
        TransportKind::PersistentSocket
    }

    fn ready_state(&self) -> TransportState {
        self.state
    }

    fn writable(&self) -> bool {
        self.writable
    }

    fn supports_binary(&self) -> bool {
        self.supports_binary
    }

    fn open(&mut self) {
        if matches!(self.state, TransportState::Unset | TransportState::Closed) {
            self.state = TransportState::Opening;
            let uri = self.uri();
            debug!(%uri, "connecting");
            self.io.connect(&uri);
        }
    }

    fn close(&mut self) {
        if self.state != TransportState::Closed {
            self.io.close();
            self.on_close();
        }
    }

    fn write(&mut self, frames: Vec<Frame>) -> Result<()> {
        if self.state != TransportState::Open {
            return Err(ProtocolError::TransportNotOpen);
        }
        if frames.is_empty() {
            return Ok(());
        }

        self.writable = false;
        self.pending_writes = frames.len();
        for frame in &frames {
            self.io.send(encode_frame(frame, self.supports_binary));
        }
        Ok(())
    }

    fn pause(&mut self) {
        self.state = TransportState::Pausing;
        self.maybe_paused();
    }

    fn handle_io(&mut self, completion: IoCompletion) {
        match completion {
            IoCompletion::Connected => {
                if self.state == TransportState::Opening {
                    self.on_connected();
                }
            }
            IoCompletion::Data(data) => {
                self.sink
                    .event(TransportEvent::Packet(decode_frame(&data)));
            }
            IoCompletion::WriteDone => {
                self.pending_writes = self.pending_writes.saturating_sub(1);
                if self.pending_writes == 0 {
                    self.on_drained();
                }
            }
            IoCompletion::Error(message) => {
                self.sink.event(TransportEvent::Error {
                    message,
                    description: None,
                });
            }
            IoCompletion::Closed => {
                if self.state != TransportState::Closed {
                    self.on_close();
                }
            }
        }
    }

    fn set_session_id(&mut self, sid: &str) {
        self.session_id = Some(sid.to_string());
    }
}
