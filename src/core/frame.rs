//! Connection-layer frame types.

use bytes::Bytes;

use crate::error::constants::ERR_PARSER;

/// Frame type with its fixed wire digit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameKind {
    Open = 0,
    Close = 1,
    Ping = 2,
    Pong = 3,
    Message = 4,
    Upgrade = 5,
    Noop = 6,
    Error = 7,
}

impl FrameKind {
    /// Wire code of this frame type.
    pub fn code(self) -> u8 {
        self as u8
    }

    /// Map a wire code back to a frame type.
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::Open),
            1 => Some(Self::Close),
            2 => Some(Self::Ping),
            3 => Some(Self::Pong),
            4 => Some(Self::Message),
            5 => Some(Self::Upgrade),
            6 => Some(Self::Noop),
            7 => Some(Self::Error),
            _ => None,
        }
    }
}

/// Frame payload: either text or a raw binary buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameData {
    Text(String),
    Binary(Bytes),
}

impl FrameData {
    pub fn is_binary(&self) -> bool {
        matches!(self, Self::Binary(_))
    }

    /// Text view of the payload, `None` for binary.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            Self::Binary(_) => None,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Self::Text(text) => text.len(),
            Self::Binary(data) => data.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl From<&str> for FrameData {
    fn from(text: &str) -> Self {
        Self::Text(text.to_string())
    }
}

impl From<String> for FrameData {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

impl From<Bytes> for FrameData {
    fn from(data: Bytes) -> Self {
        Self::Binary(data)
    }
}

/// A single connection-layer unit exchanged over one transport.
///
/// Immutable once constructed; created by the connection or by session-layer
/// writers, consumed by the payload codec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: FrameKind,
    pub data: FrameData,
    /// Hint for transports that support per-message compression.
    pub compress: bool,
}

impl Frame {
    pub fn new(kind: FrameKind, data: FrameData) -> Self {
        Self {
            kind,
            data,
            compress: true,
        }
    }

    /// A `message` frame carrying the given payload.
    pub fn message(data: FrameData) -> Self {
        Self::new(FrameKind::Message, data)
    }

    /// The `ping "probe"` frame sent over a candidate transport.
    pub fn probe_ping() -> Self {
        Self::new(FrameKind::Ping, FrameData::from("probe"))
    }

    /// Whether this is the `pong "probe"` reply confirming a candidate.
    pub fn is_probe_pong(&self) -> bool {
        self.kind == FrameKind::Pong && self.data.as_text() == Some("probe")
    }

    /// The sentinel produced for any undecodable input. Receipt is a
    /// terminal decode failure, not a deliverable application frame.
    pub fn parser_error() -> Self {
        Self::new(FrameKind::Error, FrameData::from(ERR_PARSER))
    }

    /// Whether this frame is the decode-failure sentinel.
    pub fn is_parser_error(&self) -> bool {
        self.kind == FrameKind::Error && self.data.as_text() == Some(ERR_PARSER)
    }
}
