//! # Session-Layer Wire Format
//!
//! Packet types and codecs for the upper protocol layer (protocol
//! version 4).
//!
//! ## Components
//! - **Packet**: a namespaced session unit (connect/event/ack/...)
//! - **Binary**: deconstruction of binary leaves into placeholder markers
//!   plus an ordered attachment list, and the inverse reconstruction
//! - **Decoder**: streaming decoder that pairs a binary-typed header with
//!   the raw attachment frames that follow it
//!
//! ## Wire Format (header)
//! ```text
//! <typeDigit>[<attachmentCount>-][<namespace>,]<ackId><jsonPayload>
//! ```

pub mod binary;
pub mod decoder;
pub mod packet;

pub use binary::{deconstruct_data, has_binary, reconstruct_data};
pub use decoder::{BinaryReconstructor, Decoder};
pub use packet::{Data, Encoder, Packet, PacketKind};

/// Session-layer protocol version.
pub const PROTOCOL_VERSION: u8 = 4;
