//! Session packet type and its text header codec.
//!
//! The ack id field defaults to 0 rather than being absent, and the encoder
//! emits the id segment whenever an id is present — which the default always
//! satisfies. Every encoded packet therefore carries a literal id digit, even
//! for events with no acknowledgement requested. Peers tolerate this; the
//! decoder accepts both forms.

use std::collections::BTreeMap;

use bytes::Bytes;
use serde_json::Value;
use tracing::debug;

use crate::core::payload::WireData;
use crate::error::{ProtocolError, Result};

use super::binary::deconstruct_data;

/// Fixed sentinel emitted when a packet's payload cannot be JSON-encoded.
pub const ENCODE_ERROR_PACKET: &str = "4'encode error'";

/// Packet type with its fixed wire digit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketKind {
    Connect = 0,
    Disconnect = 1,
    Event = 2,
    Ack = 3,
    Error = 4,
    BinaryEvent = 5,
    BinaryAck = 6,
}

impl PacketKind {
    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::Connect),
            1 => Some(Self::Disconnect),
            2 => Some(Self::Event),
            3 => Some(Self::Ack),
            4 => Some(Self::Error),
            5 => Some(Self::BinaryEvent),
            6 => Some(Self::BinaryAck),
            _ => None,
        }
    }

    /// Whether packets of this type carry binary attachments.
    pub fn is_binary(self) -> bool {
        matches!(self, Self::BinaryEvent | Self::BinaryAck)
    }
}

/// A payload tree: JSON values with binary leaves.
///
/// Canonical form keeps arrays and objects structural ([`Data::Array`],
/// [`Data::Object`]) and scalars as [`Data::Value`]; [`Data::from`] on a
/// `serde_json::Value` normalizes into this shape.
#[derive(Debug, Clone, PartialEq)]
pub enum Data {
    /// A scalar JSON value (null, bool, number, string).
    Value(Value),
    /// A raw binary leaf, extracted as an attachment during encoding.
    Binary(Bytes),
    Array(Vec<Data>),
    Object(BTreeMap<String, Data>),
}

impl Data {
    /// Convert to plain JSON. Fails on binary leaves, which must have been
    /// deconstructed into placeholders first.
    pub fn to_json(&self) -> Result<Value> {
        match self {
            Data::Value(value) => Ok(value.clone()),
            Data::Binary(_) => Err(ProtocolError::Encode(
                "binary value in a non-binary packet".to_string(),
            )),
            Data::Array(items) => items
                .iter()
                .map(Data::to_json)
                .collect::<Result<Vec<_>>>()
                .map(Value::Array),
            Data::Object(entries) => {
                let mut map = serde_json::Map::new();
                for (key, value) in entries {
                    map.insert(key.clone(), value.to_json()?);
                }
                Ok(Value::Object(map))
            }
        }
    }
}

impl From<Value> for Data {
    fn from(value: Value) -> Self {
        match value {
            Value::Array(items) => Data::Array(items.into_iter().map(Data::from).collect()),
            Value::Object(map) => Data::Object(
                map.into_iter()
                    .map(|(k, v)| (k, Data::from(v)))
                    .collect(),
            ),
            scalar => Data::Value(scalar),
        }
    }
}

impl From<&str> for Data {
    fn from(text: &str) -> Self {
        Data::Value(Value::String(text.to_string()))
    }
}

impl From<String> for Data {
    fn from(text: String) -> Self {
        Data::Value(Value::String(text))
    }
}

impl From<Bytes> for Data {
    fn from(data: Bytes) -> Self {
        Data::Binary(data)
    }
}

impl From<i64> for Data {
    fn from(value: i64) -> Self {
        Data::Value(Value::from(value))
    }
}

impl From<bool> for Data {
    fn from(value: bool) -> Self {
        Data::Value(Value::Bool(value))
    }
}

/// An upper-layer protocol unit scoped to a namespace.
#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
    pub kind: PacketKind,
    pub nsp: String,
    /// Ack correlation id; 0 means "no acknowledgement requested".
    pub id: u64,
    /// Number of binary attachments following the header.
    pub attachments: u64,
    pub data: Option<Data>,
    /// Extra query appended to the namespace of a connect packet.
    pub query: Option<String>,
}

impl Packet {
    pub fn new(kind: PacketKind, nsp: impl Into<String>, data: Option<Data>) -> Self {
        Self {
            kind,
            nsp: nsp.into(),
            id: 0,
            attachments: 0,
            data,
            query: None,
        }
    }

    pub fn connect(nsp: impl Into<String>, query: Option<String>) -> Self {
        let mut packet = Self::new(PacketKind::Connect, nsp, None);
        packet.query = query;
        packet
    }

    pub fn disconnect(nsp: impl Into<String>) -> Self {
        Self::new(PacketKind::Disconnect, nsp, None)
    }

    pub fn with_id(mut self, id: u64) -> Self {
        self.id = id;
        self
    }

    /// The sentinel packet produced for any undecodable header, scoped to
    /// the root namespace.
    pub fn parser_error(reason: &str) -> Self {
        Self::new(
            PacketKind::Error,
            "/",
            Some(Data::from(format!("parser error: {reason}"))),
        )
    }
}

/// Serializes session packets into wire chunks.
///
/// Binary-typed packets expand into their text header followed by one raw
/// buffer per attachment, in placeholder index order.
#[derive(Debug, Default)]
pub struct Encoder;

impl Encoder {
    pub fn new() -> Self {
        Self
    }

    pub fn encode(&self, packet: Packet) -> Vec<WireData> {
        debug!(kind = ?packet.kind, nsp = %packet.nsp, "encoding packet");

        if packet.kind.is_binary() {
            self.encode_as_binary(packet)
        } else {
            vec![WireData::Text(encode_as_string(&packet))]
        }
    }

    fn encode_as_binary(&self, mut packet: Packet) -> Vec<WireData> {
        let mut buffers = Vec::new();
        packet.data = packet
            .data
            .take()
            .map(|data| Data::from(deconstruct_data(&data, &mut buffers)));
        packet.attachments = buffers.len() as u64;

        let mut chunks = Vec::with_capacity(buffers.len() + 1);
        chunks.push(WireData::Text(encode_as_string(&packet)));
        chunks.extend(buffers.into_iter().map(WireData::Binary));
        chunks
    }
}

fn encode_as_string(packet: &Packet) -> String {
    let mut str = packet.kind.code().to_string();

    if packet.kind.is_binary() {
        str.push_str(&packet.attachments.to_string());
        str.push('-');
    }

    if packet.nsp != "/" && !packet.nsp.is_empty() {
        str.push_str(&packet.nsp);
        if packet.kind == PacketKind::Connect {
            if let Some(query) = &packet.query {
                str.push('?');
                str.push_str(query);
            }
        }
        str.push(',');
    }

    str.push_str(&packet.id.to_string());

    if let Some(data) = &packet.data {
        match data.to_json().and_then(|json| {
            serde_json::to_string(&json).map_err(|e| ProtocolError::Encode(e.to_string()))
        }) {
            Ok(payload) => str.push_str(&payload),
            Err(_) => return ENCODE_ERROR_PACKET.to_string(),
        }
    }

    debug!(encoded = %str, "encoded packet");
    str
}

/// Decode a packet header.
///
/// Soft failures (unknown type, invalid payload) come back as the sentinel
/// error packet on namespace `/`; an illegal attachment-count segment is a
/// fatal local error instead.
pub fn decode_header(str: &str) -> Result<Packet> {
    let bytes = str.as_bytes();

    let kind = match bytes
        .first()
        .filter(|b| b.is_ascii_digit())
        .and_then(|b| PacketKind::from_code(b - b'0'))
    {
        Some(kind) => kind,
        None => {
            return Ok(Packet::parser_error(&format!(
                "unknown packet type {}",
                str.chars().next().unwrap_or(' ')
            )))
        }
    };

    let mut packet = Packet::new(kind, "/", None);
    let mut i = 1;

    // attachment count, only for the binary types
    if kind.is_binary() {
        let start = i;
        while i < bytes.len() && bytes[i] != b'-' {
            i += 1;
        }
        let digits = &str[start..i];
        let count = digits.parse::<u64>();
        if i >= bytes.len() || digits.is_empty() || count.is_err() {
            return Err(ProtocolError::IllegalAttachments);
        }
        packet.attachments = count.unwrap_or(0);
        i += 1; // the '-'
    }

    // namespace, only when it starts with '/'
    if bytes.get(i) == Some(&b'/') {
        let start = i;
        while i < bytes.len() && bytes[i] != b',' {
            i += 1;
        }
        packet.nsp = str[start..i].to_string();
        if i < bytes.len() {
            i += 1; // the ','
        }
    }

    // ack id: a leading digit run
    let id_start = i;
    while i < bytes.len() && bytes[i].is_ascii_digit() {
        i += 1;
    }
    if i > id_start {
        match str[id_start..i].parse::<u64>() {
            Ok(id) => packet.id = id,
            Err(_) => return Ok(Packet::parser_error("invalid payload")),
        }
    }

    // the remainder is the JSON payload
    if i < bytes.len() {
        let payload: Option<Value> = serde_json::from_str(&str[i..]).ok();
        let valid = payload
            .as_ref()
            .map(|v| kind == PacketKind::Error || v.is_array())
            .unwrap_or(false);
        if !valid {
            return Ok(Packet::parser_error("invalid payload"));
        }
        packet.data = payload.map(Data::from);
    }

    debug!(input = %str, kind = ?packet.kind, "decoded packet");
    Ok(packet)
}
