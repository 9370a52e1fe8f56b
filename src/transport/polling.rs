//! Generic long-polling transport.
//!
//! Owns the polling state machine: the poll loop, writability toggling,
//! payload framing, the deferred close frame, and the pause barrier that
//! waits for the in-flight poll and the in-flight write before confirming.
//! The actual HTTP requests live behind [`PollingIo`]; a collaborator starts
//! them fire-and-forget and delivers completions through the signal channel
//! as [`IoCompletion`]s tagged with this transport's id.

use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::debug;

use crate::core::frame::{Frame, FrameData, FrameKind};
use crate::core::payload::{decode_payload, encode_payload, WireData};
use crate::error::{ProtocolError, Result};

use super::{
    IoCompletion, SignalSink, Transport, TransportEvent, TransportKind, TransportOptions,
    TransportState,
};

/// The narrow long-polling request contract.
///
/// Implementations start one request per call and deliver the outcome
/// through the signal sink they were constructed with: `Data` for a poll
/// response, `WriteDone` for a completed send, `Error` for either.
pub trait PollingIo: Send {
    /// Start one long-poll request against `uri`.
    fn poll(&mut self, uri: &str);

    /// Start one write request carrying an encoded payload.
    fn send(&mut self, uri: &str, data: WireData);

    /// Abort any in-flight request.
    fn abort(&mut self);
}

/// Long-polling transport over a [`PollingIo`] collaborator.
pub struct PollingTransport<IO: PollingIo> {
    io: IO,
    sink: SignalSink,
    options: TransportOptions,
    state: TransportState,
    /// A poll request is in flight.
    polling: bool,
    writable: bool,
    supports_binary: bool,
    session_id: Option<String>,
    pause_waiting_poll: bool,
    pause_waiting_drain: bool,
    cache_bust: u64,
}

impl<IO: PollingIo> PollingTransport<IO> {
    pub fn new(io: IO, options: TransportOptions, sink: SignalSink) -> Self {
        let supports_binary = !options.force_base64;
        Self {
            io,
            sink,
            options,
            state: TransportState::Unset,
            polling: false,
            writable: false,
            supports_binary,
            session_id: None,
            pause_waiting_poll: false,
            pause_waiting_drain: false,
            cache_bust: 0,
        }
    }

    fn poll(&mut self) {
        debug!("polling");
        self.polling = true;
        let uri = self.uri();
        self.io.poll(&uri);
    }

    fn uri(&mut self) -> String {
        let mut extra = BTreeMap::new();

        if let Some(sid) = &self.session_id {
            extra.insert("sid".to_string(), sid.clone());
        }

        // the base64 fallback must be announced before a session exists
        if !self.supports_binary && self.session_id.is_none() {
            extra.insert("b64".to_string(), "1".to_string());
        }

        if self.options.timestamp_requests {
            let param = self.options.timestamp_param.clone();
            extra.insert(param, self.next_timestamp());
        }

        self.options.uri("https", "http", &extra)
    }

    /// Monotonic cache-busting token.
    fn next_timestamp(&mut self) -> String {
        self.cache_bust += 1;
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or_default();
        format!("{millis:x}-{}", self.cache_bust)
    }

    fn on_poll_data(&mut self, data: WireData) {
        debug!(bytes = data.len(), "poll response");

        for frame in decode_payload(&data) {
            // the first frame opens the transport
            if self.state == TransportState::Opening && frame.kind == FrameKind::Open {
                self.on_open();
            }

            // a close frame shuts down the poll loop
            if frame.kind == FrameKind::Close {
                self.on_close();
                return;
            }

            self.sink.event(TransportEvent::Packet(frame));
        }

        if self.state == TransportState::Closed {
            return;
        }

        self.polling = false;
        if self.pause_waiting_poll {
            self.pause_waiting_poll = false;
            self.maybe_paused();
        }

        if self.state == TransportState::Open {
            self.poll();
        } else {
            debug!(state = ?self.state, "ignoring poll");
        }
    }

    fn on_write_done(&mut self) {
        self.writable = true;
        self.sink.event(TransportEvent::Drain);
        if self.pause_waiting_drain {
            self.pause_waiting_drain = false;
            self.maybe_paused();
        }
    }

    fn on_open(&mut self) {
        self.state = TransportState::Open;
        self.writable = true;
        self.sink.event(TransportEvent::Open);
    }

    fn on_close(&mut self) {
        self.state = TransportState::Closed;
        self.sink.event(TransportEvent::Close);
    }

    fn maybe_paused(&mut self) {
        if self.state == TransportState::Pausing
            && !self.pause_waiting_poll
            && !self.pause_waiting_drain
        {
            debug!("paused");
            self.state = TransportState::Paused;
            self.sink.event(TransportEvent::Paused);
        }
    }
}

impl<IO: PollingIo> Transport for PollingTransport<IO> {
    fn kind(&self) -> TransportKind {
        TransportKind::Polling
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
            self.poll();
        }
    }

    fn close(&mut self) {
        if self.state == TransportState::Open {
            debug!("writing close frame");
            let payload = encode_payload(
                &[Frame::new(FrameKind::Close, FrameData::from(""))],
                self.supports_binary,
            );
            let uri = self.uri();
            self.io.send(&uri, payload);
        }
        if self.state != TransportState::Closed {
            self.io.abort();
            self.on_close();
        }
    }

    fn write(&mut self, frames: Vec<Frame>) -> Result<()> {
        if self.state != TransportState::Open {
            return Err(ProtocolError::TransportNotOpen);
        }
        self.writable = false;
        let payload = encode_payload(&frames, self.supports_binary);
        let uri = self.uri();
        self.io.send(&uri, payload);
        Ok(())
    }

    fn pause(&mut self) {
        self.state = TransportState::Pausing;
        self.pause_waiting_poll = self.polling;
        self.pause_waiting_drain = !self.writable;

        if self.pause_waiting_poll {
            debug!("waiting for the poll to complete before pausing");
        }
        if self.pause_waiting_drain {
            debug!("waiting for the write to drain before pausing");
        }
        self.maybe_paused();
    }

    fn handle_io(&mut self, completion: IoCompletion) {
        match completion {
            IoCompletion::Data(data) => self.on_poll_data(data),
            IoCompletion::WriteDone => self.on_write_done(),
            IoCompletion::Error(message) => self.sink.event(TransportEvent::Error {
                message,
                description: None,
            }),
            IoCompletion::Closed => {
                if self.state != TransportState::Closed {
                    self.on_close();
                }
            }
            IoCompletion::Connected => {}
        }
    }

    fn set_session_id(&mut self, sid: &str) {
        self.session_id = Some(sid.to_string());
    }
}
