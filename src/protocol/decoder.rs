//! Streaming session-packet decoder.
//!
//! Text chunks decode into packets directly; a binary-typed header opens a
//! transient [`BinaryReconstructor`] that buffers the raw attachment frames
//! which follow on the connection, completing exactly when the advertised
//! attachment count has arrived. A raw binary frame with no reconstruction
//! pending is a protocol violation.

use bytes::Bytes;
use tracing::debug;

use crate::core::payload::WireData;
use crate::error::{ProtocolError, Result};

use super::binary::reconstruct_data;
use super::packet::{decode_header, Data, Packet};

/// Transient state for one in-flight binary packet.
#[derive(Debug)]
pub struct BinaryReconstructor {
    packet: Packet,
    buffers: Vec<Bytes>,
}

impl BinaryReconstructor {
    fn new(packet: Packet) -> Self {
        Self {
            packet,
            buffers: Vec::new(),
        }
    }

    /// Absorb one raw buffer; yields the reconstructed packet once the
    /// expected count is reached.
    fn take_binary_data(&mut self, data: Bytes) -> Option<Packet> {
        self.buffers.push(data);
        if (self.buffers.len() as u64) < self.packet.attachments {
            return None;
        }

        let mut packet = self.packet.clone();
        packet.data = match packet.data.take() {
            Some(data) => match data
                .to_json()
                .and_then(|tree| reconstruct_data(tree, &self.buffers))
            {
                Ok(data) => Some(data),
                Err(_) => return Some(Packet::parser_error("invalid attachments")),
            },
            None => None,
        };
        packet.attachments = 0;
        Some(packet)
    }
}

/// Decodes a stream of wire chunks into session packets.
#[derive(Debug, Default)]
pub struct Decoder {
    reconstructor: Option<BinaryReconstructor>,
}

impl Decoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one chunk; returns a packet when one completes.
    ///
    /// Soft decode failures surface as the sentinel error packet; an illegal
    /// attachment header or an unexpected binary frame is a fatal local
    /// error.
    pub fn add(&mut self, chunk: WireData) -> Result<Option<Packet>> {
        match chunk {
            WireData::Text(text) => self.add_text(&text),
            WireData::Binary(data) => self.add_binary(data),
        }
    }

    fn add_text(&mut self, text: &str) -> Result<Option<Packet>> {
        let packet = decode_header(text)?;

        if !packet.kind.is_binary() {
            return Ok(Some(packet));
        }

        // binary packet's json: wait for the advertised attachment count
        if packet.attachments == 0 {
            let mut packet = packet;
            packet.data = match packet.data.take() {
                Some(data) => match data.to_json().and_then(|tree| reconstruct_data(tree, &[])) {
                    Ok(data) => Some(data),
                    Err(_) => return Ok(Some(Packet::parser_error("invalid attachments"))),
                },
                None => None,
            };
            return Ok(Some(packet));
        }

        debug!(attachments = packet.attachments, "awaiting binary attachments");
        self.reconstructor = Some(BinaryReconstructor::new(packet));
        Ok(None)
    }

    fn add_binary(&mut self, data: Bytes) -> Result<Option<Packet>> {
        let reconstructor = self
            .reconstructor
            .as_mut()
            .ok_or(ProtocolError::UnexpectedBinaryFrame)?;

        match reconstructor.take_binary_data(data) {
            Some(packet) => {
                self.reconstructor = None;
                Ok(Some(packet))
            }
            None => Ok(None),
        }
    }

    /// Drop any partial reconstruction state.
    pub fn destroy(&mut self) {
        self.reconstructor = None;
    }
}
