//! Frame and payload codec for the connection layer.
//!
//! A single frame encodes as `<typeDigit><payload>`. A binary frame keeps its
//! raw bytes (prefixed with the type code) when the transport supports
//! binary, and otherwise degrades to `b<typeDigit><base64(payload)>`.
//!
//! Payloads concatenate frames. In text mode every encoded frame is prefixed
//! with `<byteLength>:`; in binary mode (chosen only when the transport
//! supports binary and at least one frame carries binary data) every frame is
//! prefixed with a marker byte (0 = text, 1 = binary), the decimal digits of
//! its byte length stored one digit-value per byte, and a `0xFF` terminator.
//!
//! Decoding never recovers partially: any malformed input yields the
//! [`Frame::parser_error`] sentinel for the whole payload.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::Bytes;

use super::frame::{Frame, FrameData, FrameKind};

/// One encoded unit handed to (or received from) a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireData {
    Text(String),
    Binary(Bytes),
}

impl WireData {
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

/// Encode a single frame.
///
/// `supports_binary` controls whether binary payloads stay raw or degrade to
/// the base64 text form.
pub fn encode_frame(frame: &Frame, supports_binary: bool) -> WireData {
    match &frame.data {
        FrameData::Text(text) => {
            let mut encoded = String::with_capacity(text.len() + 1);
            encoded.push((b'0' + frame.kind.code()) as char);
            encoded.push_str(text);
            WireData::Text(encoded)
        }
        FrameData::Binary(data) => {
            if supports_binary {
                let mut encoded = Vec::with_capacity(data.len() + 1);
                encoded.push(frame.kind.code());
                encoded.extend_from_slice(data);
                WireData::Binary(Bytes::from(encoded))
            } else {
                encode_base64_frame(frame.kind, data)
            }
        }
    }
}

/// The `b<typeDigit><base64>` fallback used over text-only transports.
fn encode_base64_frame(kind: FrameKind, data: &Bytes) -> WireData {
    let mut encoded = String::with_capacity(2 + data.len() * 4 / 3 + 4);
    encoded.push('b');
    encoded.push((b'0' + kind.code()) as char);
    encoded.push_str(&BASE64.encode(data));
    WireData::Text(encoded)
}

/// Decode a single frame. Malformed input yields the parser-error sentinel.
pub fn decode_frame(data: &WireData) -> Frame {
    match data {
        WireData::Text(text) => decode_frame_text(text),
        WireData::Binary(bytes) => decode_frame_binary(bytes),
    }
}

fn decode_frame_text(data: &str) -> Frame {
    let mut chars = data.chars();
    let first = match chars.next() {
        Some(c) => c,
        None => return Frame::parser_error(),
    };

    if first == 'b' {
        return decode_base64_frame(&data[1..]);
    }

    let kind = match first
        .to_digit(10)
        .and_then(|d| FrameKind::from_code(d as u8))
    {
        Some(kind) => kind,
        None => return Frame::parser_error(),
    };

    Frame::new(kind, FrameData::from(&data[1..]))
}

fn decode_base64_frame(data: &str) -> Frame {
    let mut chars = data.chars();
    let kind = match chars
        .next()
        .and_then(|c| c.to_digit(10))
        .and_then(|d| FrameKind::from_code(d as u8))
    {
        Some(kind) => kind,
        None => return Frame::parser_error(),
    };

    match BASE64.decode(&data[1..]) {
        Ok(decoded) => Frame::new(kind, FrameData::Binary(Bytes::from(decoded))),
        Err(_) => Frame::parser_error(),
    }
}

fn decode_frame_binary(data: &[u8]) -> Frame {
    let (&code, payload) = match data.split_first() {
        Some(split) => split,
        None => return Frame::parser_error(),
    };
    match FrameKind::from_code(code) {
        Some(kind) => Frame::new(kind, FrameData::Binary(Bytes::copy_from_slice(payload))),
        None => Frame::parser_error(),
    }
}

/// Encode a sequence of frames into one payload.
///
/// Binary mode is used only when the transport supports binary and at least
/// one frame carries a binary payload; otherwise text mode with the base64
/// fallback applies.
pub fn encode_payload(frames: &[Frame], supports_binary: bool) -> WireData {
    if supports_binary && frames.iter().any(|f| f.data.is_binary()) {
        return encode_payload_binary(frames);
    }

    if frames.is_empty() {
        return WireData::Text("0:".to_string());
    }

    let mut payload = String::new();
    for frame in frames {
        let encoded = match encode_frame(frame, false) {
            WireData::Text(text) => text,
            // encode_frame with supports_binary=false always yields text
            WireData::Binary(_) => unreachable!(),
        };
        payload.push_str(&encoded.len().to_string());
        payload.push(':');
        payload.push_str(&encoded);
    }
    WireData::Text(payload)
}

fn encode_payload_binary(frames: &[Frame]) -> WireData {
    let mut payload = Vec::new();
    for frame in frames {
        match encode_frame(frame, true) {
            WireData::Text(text) => {
                payload.push(0);
                push_length_digits(&mut payload, text.len());
                payload.extend_from_slice(text.as_bytes());
            }
            WireData::Binary(data) => {
                payload.push(1);
                push_length_digits(&mut payload, data.len());
                payload.extend_from_slice(&data);
            }
        }
    }
    WireData::Binary(Bytes::from(payload))
}

/// Length digits stored one value (0-9) per byte, closed by `0xFF`.
fn push_length_digits(payload: &mut Vec<u8>, length: usize) {
    for digit in length.to_string().bytes() {
        payload.push(digit - b'0');
    }
    payload.push(0xFF);
}

/// Decode a payload into its frames.
///
/// Any length mismatch, non-digit length character, or undecodable frame
/// fails the whole payload with a single parser-error sentinel; an empty
/// frame list (`"0:"`) decodes to no frames.
pub fn decode_payload(data: &WireData) -> Vec<Frame> {
    match data {
        WireData::Text(text) => decode_payload_text(text),
        WireData::Binary(bytes) => decode_payload_binary(bytes),
    }
}

fn decode_payload_text(data: &str) -> Vec<Frame> {
    if data.is_empty() {
        return vec![Frame::parser_error()];
    }
    if data == "0:" {
        return Vec::new();
    }

    let bytes = data.as_bytes();
    let mut frames = Vec::new();
    let mut cursor = 0;

    while cursor < bytes.len() {
        let mut length: usize = 0;
        let mut digits = 0;
        while cursor < bytes.len() && bytes[cursor] != b':' {
            let byte = bytes[cursor];
            if !byte.is_ascii_digit() || digits >= 10 {
                return vec![Frame::parser_error()];
            }
            length = length * 10 + usize::from(byte - b'0');
            digits += 1;
            cursor += 1;
        }

        if cursor >= bytes.len() || digits == 0 || length == 0 {
            return vec![Frame::parser_error()];
        }
        cursor += 1; // the separator

        if cursor + length > bytes.len() {
            return vec![Frame::parser_error()];
        }
        let chunk = match std::str::from_utf8(&bytes[cursor..cursor + length]) {
            Ok(chunk) => chunk,
            Err(_) => return vec![Frame::parser_error()],
        };
        cursor += length;

        let frame = decode_frame_text(chunk);
        if frame.is_parser_error() {
            return vec![Frame::parser_error()];
        }
        frames.push(frame);
    }

    frames
}

fn decode_payload_binary(data: &[u8]) -> Vec<Frame> {
    let mut frames = Vec::new();
    let mut cursor = 0;

    while cursor < data.len() {
        let is_text = match data[cursor] {
            0 => true,
            1 => false,
            _ => return vec![Frame::parser_error()],
        };
        cursor += 1;

        let mut length: usize = 0;
        let mut digits = 0;
        loop {
            let byte = match data.get(cursor) {
                Some(&byte) => byte,
                None => return vec![Frame::parser_error()],
            };
            cursor += 1;
            if byte == 0xFF {
                break;
            }
            if byte > 9 || digits >= 10 {
                return vec![Frame::parser_error()];
            }
            length = length * 10 + usize::from(byte);
            digits += 1;
        }

        if digits == 0 || cursor + length > data.len() {
            return vec![Frame::parser_error()];
        }
        let chunk = &data[cursor..cursor + length];
        cursor += length;

        let frame = if is_text {
            match std::str::from_utf8(chunk) {
                Ok(text) => decode_frame_text(text),
                Err(_) => return vec![Frame::parser_error()],
            }
        } else {
            decode_frame_binary(chunk)
        };
        if frame.is_parser_error() {
            return vec![Frame::parser_error()];
        }
        frames.push(frame);
    }

    frames
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text_frame(kind: FrameKind, data: &str) -> Frame {
        Frame::new(kind, FrameData::from(data))
    }

    fn binary_frame(kind: FrameKind, data: &[u8]) -> Frame {
        Frame::new(kind, FrameData::Binary(Bytes::copy_from_slice(data)))
    }

    #[test]
    fn text_frame_round_trip_all_kinds() {
        for code in 0..8u8 {
            let kind = FrameKind::from_code(code).unwrap();
            let frame = text_frame(kind, "payload");
            let encoded = encode_frame(&frame, false);
            assert_eq!(decode_frame(&encoded), frame);
        }
    }

    #[test]
    fn binary_frame_round_trip() {
        let frame = binary_frame(FrameKind::Message, &[0, 1, 2, 255]);
        let encoded = encode_frame(&frame, true);
        assert_eq!(decode_frame(&encoded), frame);
    }

    #[test]
    fn binary_frame_degrades_to_base64() {
        let frame = binary_frame(FrameKind::Message, &[1, 2, 3]);
        let encoded = encode_frame(&frame, false);
        assert_eq!(encoded, WireData::Text("b4AQID".to_string()));
        assert_eq!(decode_frame(&encoded), frame);
    }

    #[test]
    fn empty_payload_data_is_allowed() {
        let frame = text_frame(FrameKind::Ping, "");
        let encoded = encode_frame(&frame, false);
        assert_eq!(encoded, WireData::Text("2".to_string()));
        assert_eq!(decode_frame(&encoded), frame);
    }

    #[test]
    fn unknown_type_digit_is_a_parser_error() {
        assert!(decode_frame(&WireData::Text("9hello".to_string())).is_parser_error());
        assert!(decode_frame(&WireData::Text(String::new())).is_parser_error());
        assert!(decode_frame(&WireData::Binary(Bytes::from_static(&[42, 0]))).is_parser_error());
    }

    #[test]
    fn payload_single_message_exact_encoding() {
        let encoded = encode_payload(&[text_frame(FrameKind::Message, "hello")], false);
        assert_eq!(encoded, WireData::Text("6:4hello".to_string()));
    }

    #[test]
    fn payload_empty_list_encodes_as_zero_header() {
        let encoded = encode_payload(&[], false);
        assert_eq!(encoded, WireData::Text("0:".to_string()));
        assert!(decode_payload(&encoded).is_empty());
    }

    #[test]
    fn payload_empty_input_is_a_parser_error() {
        let frames = decode_payload(&WireData::Text(String::new()));
        assert_eq!(frames.len(), 1);
        assert!(frames[0].is_parser_error());
    }

    #[test]
    fn payload_text_round_trip_multiple_frames() {
        let frames = vec![
            text_frame(FrameKind::Ping, "probe"),
            text_frame(FrameKind::Message, "hello world"),
            text_frame(FrameKind::Upgrade, ""),
        ];
        let encoded = encode_payload(&frames, false);
        assert_eq!(decode_payload(&encoded), frames);
    }

    #[test]
    fn payload_multibyte_text_uses_byte_lengths() {
        let frames = vec![text_frame(FrameKind::Message, "héllo")];
        let encoded = encode_payload(&frames, false);
        assert_eq!(encoded, WireData::Text("7:4héllo".to_string()));
        assert_eq!(decode_payload(&encoded), frames);
    }

    #[test]
    fn payload_length_mismatch_fails_whole_payload() {
        for input in ["6:4hel", "x:4hello", "6;4hello", "0:6:4hello"] {
            let frames = decode_payload(&WireData::Text(input.to_string()));
            assert_eq!(frames.len(), 1, "input {input:?}");
            assert!(frames[0].is_parser_error(), "input {input:?}");
        }
    }

    #[test]
    fn payload_binary_mode_round_trip() {
        let frames = vec![
            text_frame(FrameKind::Message, "tag"),
            binary_frame(FrameKind::Message, &[7, 8, 9, 0xFF]),
        ];
        let encoded = encode_payload(&frames, true);
        assert!(matches!(encoded, WireData::Binary(_)));
        assert_eq!(decode_payload(&encoded), frames);
    }

    #[test]
    fn payload_binary_frames_fall_back_without_support() {
        let frames = vec![binary_frame(FrameKind::Message, &[1, 2])];
        let encoded = encode_payload(&frames, false);
        assert!(matches!(encoded, WireData::Text(_)));
        assert_eq!(decode_payload(&encoded), frames);
    }

    #[test]
    fn payload_binary_truncation_fails() {
        let frames = vec![binary_frame(FrameKind::Message, &[1, 2, 3, 4])];
        let encoded = match encode_payload(&frames, true) {
            WireData::Binary(bytes) => bytes,
            WireData::Text(_) => panic!("expected binary payload"),
        };
        let truncated = WireData::Binary(encoded.slice(0..encoded.len() - 2));
        let decoded = decode_payload(&truncated);
        assert_eq!(decoded.len(), 1);
        assert!(decoded[0].is_parser_error());
    }
}
