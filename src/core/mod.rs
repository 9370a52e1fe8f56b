//! # Connection-Layer Wire Format
//!
//! Frame types and the payload codec for the lower protocol layer
//! (protocol version 3).
//!
//! ## Components
//! - **Frame**: a single connection-layer unit (ping/pong/message/...)
//! - **Payload**: one or more frames concatenated under the length-prefixed
//!   text framing or the marker-byte binary framing
//!
//! ## Wire Format (text mode)
//! ```text
//! <byteLength>:<typeDigit><payload> ...
//! ```
//!
//! Binary frames over a text-only transport degrade to
//! `b<typeDigit><base64(payload)>`.

pub mod frame;
pub mod payload;

pub use frame::{Frame, FrameData, FrameKind};
pub use payload::{decode_frame, decode_payload, encode_frame, encode_payload, WireData};

/// Connection-layer protocol version, sent as the `EIO` query parameter.
pub const PROTOCOL_VERSION: u8 = 3;
