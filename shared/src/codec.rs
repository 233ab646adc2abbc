//! Length-prefixed codec for the Remote Sensors Protocol (RSP)
//!
//! All frames are:
//! ```text
//! [ 4 bytes: length (u32, big-endian) ][ N bytes: UTF-8 text ]
//! ```
//!
//! The text is a message type followed by space separated tokens:
//! ```text
//! sensor-update "light" "42" "tilt" "-3"
//! ```
//! A token is either an unquoted run of non-space characters or a
//! double-quoted string in which `""` stands for a literal `"`.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;
use thiserror::Error;
use tracing::warn;

/// Maximum frame payload (1 MiB); anything larger is treated as a corrupt stream
pub const MAX_FRAME_SIZE: u32 = 1024 * 1024;

/// Errors that can occur during encoding/decoding
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Frame too large: {0} bytes (max: {MAX_FRAME_SIZE})")]
    FrameTooLarge(usize),

    #[error("Invalid frame length prefix: {0}")]
    InvalidLength(u32),

    #[error("Frame payload is not valid UTF-8: {0}")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),

    #[error("Unknown message type: {0}")]
    UnknownMessageType(String),
}

/// Message types understood by the protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MeshMessageType {
    Broadcast,
    SensorUpdate,
    PeerName,
}

impl MeshMessageType {
    /// Wire spelling of the message type
    pub fn as_str(&self) -> &'static str {
        match self {
            MeshMessageType::Broadcast => "broadcast",
            MeshMessageType::SensorUpdate => "sensor-update",
            MeshMessageType::PeerName => "peer-name",
        }
    }

    /// Parse a message type, ignoring case
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "broadcast" => Some(MeshMessageType::Broadcast),
            "sensor-update" => Some(MeshMessageType::SensorUpdate),
            "peer-name" => Some(MeshMessageType::PeerName),
            _ => None,
        }
    }
}

impl fmt::Display for MeshMessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One decoded key/value event from an RSP frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MeshEvent {
    /// Connection the event arrived on
    pub sender: u64,
    pub message_type: MeshMessageType,
    pub key: String,
    pub value: Option<String>,
}

impl MeshEvent {
    pub fn new(
        sender: u64,
        message_type: MeshMessageType,
        key: impl Into<String>,
        value: Option<String>,
    ) -> Self {
        Self {
            sender,
            message_type,
            key: key.into(),
            value,
        }
    }

    /// A valueless broadcast event
    pub fn broadcast(sender: u64, key: impl Into<String>) -> Self {
        Self::new(sender, MeshMessageType::Broadcast, key, None)
    }
}

/// Wrap a text payload in a length-prefixed frame
pub fn encode_frame(text: &str) -> Result<Bytes, CodecError> {
    let len = text.len();
    if len > MAX_FRAME_SIZE as usize {
        return Err(CodecError::FrameTooLarge(len));
    }

    let mut buf = BytesMut::with_capacity(4 + len);
    buf.put_u32(len as u32);
    buf.put_slice(text.as_bytes());
    Ok(buf.freeze())
}

/// Try to decode one length-prefixed payload from a buffer
///
/// Returns:
/// - `Ok(Some(text))` if a complete frame was decoded
/// - `Ok(None)` if more data is needed
/// - `Err(...)` if the data is invalid
pub fn decode(buf: &mut BytesMut) -> Result<Option<String>, CodecError> {
    if buf.len() < 4 {
        return Ok(None);
    }

    // Peek at the length prefix without consuming
    let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
    if len > MAX_FRAME_SIZE {
        return Err(CodecError::InvalidLength(len));
    }

    let total_len = 4 + len as usize;
    if buf.len() < total_len {
        return Ok(None);
    }

    buf.advance(4);
    let payload = buf.split_to(len as usize);
    let text = String::from_utf8(payload.to_vec())?;
    Ok(Some(text))
}

/// Split a frame payload into tokens
///
/// An unterminated quote keeps whatever was read up to the end of the payload.
pub fn tokenize(text: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut chars = text.chars().peekable();

    while let Some(&c) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
            continue;
        }

        let mut token = String::new();
        if c == '"' {
            chars.next();
            let mut closed = false;
            while let Some(c) = chars.next() {
                if c == '"' {
                    if chars.peek() == Some(&'"') {
                        chars.next();
                        token.push('"');
                    } else {
                        closed = true;
                        break;
                    }
                } else {
                    token.push(c);
                }
            }
            if !closed {
                warn!("[RSP] Unterminated quoted token: {:?}", token);
            }
        } else {
            while let Some(&c) = chars.peek() {
                if c.is_whitespace() {
                    break;
                }
                token.push(c);
                chars.next();
            }
        }
        tokens.push(token);
    }

    tokens
}

/// Parse a frame payload into events
///
/// Tokens after the message type pair up as key/value; an odd trailing
/// token becomes an event without a value.
pub fn parse_message(text: &str, sender: u64) -> Result<Vec<MeshEvent>, CodecError> {
    let mut tokens = tokenize(text).into_iter();

    let message_type = match tokens.next() {
        Some(t) => MeshMessageType::parse(&t).ok_or(CodecError::UnknownMessageType(t))?,
        None => return Ok(Vec::new()),
    };

    let mut events = Vec::new();
    while let Some(key) = tokens.next() {
        let value = tokens.next();
        events.push(MeshEvent::new(sender, message_type, key, value));
    }
    Ok(events)
}

fn quote(token: &str) -> String {
    format!("\"{}\"", token.replace('"', "\"\""))
}

/// Compose events into frames
///
/// Consecutive events of one message type share a frame. A type change
/// starts a new frame, and so does any event following a valueless one,
/// since positional pairing would otherwise read the next key as its value.
pub fn compose(events: &[MeshEvent]) -> Result<Vec<Bytes>, CodecError> {
    let mut frames = Vec::new();
    let mut current: Option<(MeshMessageType, String)> = None;

    for event in events {
        let joinable = matches!(&current, Some((t, _)) if *t == event.message_type);
        if !joinable {
            if let Some((_, text)) = current.take() {
                frames.push(encode_frame(&text)?);
            }
            current = Some((event.message_type, event.message_type.as_str().to_string()));
        }

        if let Some((_, text)) = current.as_mut() {
            text.push(' ');
            text.push_str(&quote(&event.key));
            if let Some(value) = &event.value {
                text.push(' ');
                text.push_str(&quote(value));
            }
        }

        if event.value.is_none() {
            if let Some((_, text)) = current.take() {
                frames.push(encode_frame(&text)?);
            }
        }
    }

    if let Some((_, text)) = current.take() {
        frames.push(encode_frame(&text)?);
    }
    Ok(frames)
}

/// Decoder state machine for streaming decoding
#[derive(Debug, Default)]
pub struct FrameDecoder {
    /// Partial frame data being accumulated
    buffer: BytesMut,
}

impl FrameDecoder {
    /// Create a new frame decoder
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(4096),
        }
    }

    /// Add data to the decoder buffer
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Try to decode the next frame payload from the buffer
    ///
    /// A corrupt length prefix discards everything buffered so far, since
    /// the stream cannot be resynchronised from inside it.
    pub fn decode_next(&mut self) -> Result<Option<String>, CodecError> {
        match decode(&mut self.buffer) {
            Err(CodecError::InvalidLength(len)) => {
                self.buffer.clear();
                Err(CodecError::InvalidLength(len))
            }
            other => other,
        }
    }

    /// Get the current buffer length (for debugging)
    pub fn buffer_len(&self) -> usize {
        self.buffer.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn triples(events: &[MeshEvent]) -> Vec<(MeshMessageType, String, Option<String>)> {
        events
            .iter()
            .map(|e| (e.message_type, e.key.clone(), e.value.clone()))
            .collect()
    }

    fn decode_all(frames: &[Bytes]) -> Vec<MeshEvent> {
        let mut decoder = FrameDecoder::new();
        for frame in frames {
            decoder.extend(frame);
        }
        let mut events = Vec::new();
        while let Some(text) = decoder.decode_next().expect("decode error") {
            events.extend(parse_message(&text, 0).expect("parse error"));
        }
        events
    }

    #[test]
    fn test_sensor_update_pair() {
        let events = parse_message(r#"sensor-update "light" "42""#, 3).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].sender, 3);
        assert_eq!(events[0].message_type, MeshMessageType::SensorUpdate);
        assert_eq!(events[0].key, "light");
        assert_eq!(events[0].value.as_deref(), Some("42"));
    }

    #[test]
    fn test_doubled_quote_is_literal() {
        let tokens = tokenize(r#"broadcast "he said ""hi""""#);
        assert_eq!(tokens, vec!["broadcast", r#"he said "hi""#]);
    }

    #[test]
    fn test_odd_trailing_token_has_no_value() {
        let events = parse_message(r#"broadcast "go" "1" "stop""#, 0).unwrap();
        assert_eq!(
            triples(&events),
            vec![
                (MeshMessageType::Broadcast, "go".into(), Some("1".into())),
                (MeshMessageType::Broadcast, "stop".into(), None),
            ]
        );
    }

    #[test]
    fn test_unterminated_quote_is_best_effort() {
        let events = parse_message(r#"sensor-update "temp" "21"#, 0).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].value.as_deref(), Some("21"));
    }

    #[test]
    fn test_message_type_is_case_insensitive() {
        let events = parse_message("Broadcast start", 0).unwrap();
        assert_eq!(events[0].message_type, MeshMessageType::Broadcast);
        assert_eq!(events[0].key, "start");
    }

    #[test]
    fn test_unknown_message_type() {
        let result = parse_message("launch now", 0);
        assert!(matches!(result, Err(CodecError::UnknownMessageType(_))));
    }

    #[test]
    fn test_empty_payload_yields_nothing() {
        assert!(parse_message("   ", 0).unwrap().is_empty());
    }

    #[test]
    fn test_compose_coalesces_same_type() {
        let events = vec![
            MeshEvent::new(0, MeshMessageType::SensorUpdate, "a", Some("1".into())),
            MeshEvent::new(0, MeshMessageType::SensorUpdate, "b", Some("2".into())),
        ];
        let frames = compose(&events).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(&frames[0][4..], br#"sensor-update "a" "1" "b" "2""#);
    }

    #[test]
    fn test_compose_splits_on_type_change() {
        let events = vec![
            MeshEvent::new(0, MeshMessageType::SensorUpdate, "a", Some("1".into())),
            MeshEvent::broadcast(0, "go"),
            MeshEvent::new(0, MeshMessageType::SensorUpdate, "b", Some("2".into())),
        ];
        let frames = compose(&events).unwrap();
        assert_eq!(frames.len(), 3);
        assert_eq!(&frames[1][4..], br#"broadcast "go""#);
    }

    #[test]
    fn test_compose_escapes_quotes() {
        let frames = compose(&[MeshEvent::broadcast(0, r#"say "hi""#)]).unwrap();
        assert_eq!(&frames[0][4..], br#"broadcast "say ""hi""""#);
        assert_eq!(decode_all(&frames)[0].key, r#"say "hi""#);
    }

    #[test]
    fn test_decode_compose_roundtrip_for_run() {
        let run = vec![
            MeshEvent::new(0, MeshMessageType::SensorUpdate, "light", Some("42".into())),
            MeshEvent::new(0, MeshMessageType::SensorUpdate, "slider value", Some("".into())),
            MeshEvent::new(0, MeshMessageType::SensorUpdate, "tilt", None),
            MeshEvent::new(0, MeshMessageType::SensorUpdate, "x", Some("-7".into())),
        ];
        let frames = compose(&run).unwrap();
        assert_eq!(triples(&decode_all(&frames)), triples(&run));
    }

    #[test]
    fn test_partial_decode() {
        let frame = encode_frame("broadcast go").unwrap();

        let mut buf = BytesMut::from(&frame[..6]);
        assert!(decode(&mut buf).unwrap().is_none());
        // Buffer should be unchanged (data not consumed)
        assert_eq!(buf.len(), 6);
    }

    #[test]
    fn test_frame_decoder_chunks() {
        let frame = encode_frame(r#"broadcast "go" "1""#).unwrap();
        let mut decoder = FrameDecoder::new();

        decoder.extend(&frame[..3]);
        assert!(decoder.decode_next().unwrap().is_none());
        decoder.extend(&frame[3..10]);
        assert!(decoder.decode_next().unwrap().is_none());
        decoder.extend(&frame[10..]);
        assert_eq!(decoder.decode_next().unwrap().as_deref(), Some(r#"broadcast "go" "1""#));
        assert_eq!(decoder.buffer_len(), 0);
    }

    #[test]
    fn test_multiple_frames() {
        let mut decoder = FrameDecoder::new();
        decoder.extend(&encode_frame("broadcast a").unwrap());
        decoder.extend(&encode_frame("broadcast b").unwrap());

        assert!(decoder.decode_next().unwrap().is_some());
        assert!(decoder.decode_next().unwrap().is_some());
        assert!(decoder.decode_next().unwrap().is_none());
    }

    #[test]
    fn test_oversized_length_discards_buffer() {
        let mut decoder = FrameDecoder::new();
        let mut bogus = BytesMut::new();
        bogus.put_u32(MAX_FRAME_SIZE + 1);
        bogus.put_bytes(0, 16);
        decoder.extend(&bogus);

        assert!(matches!(decoder.decode_next(), Err(CodecError::InvalidLength(_))));
        assert_eq!(decoder.buffer_len(), 0);

        // The stream keeps working afterwards
        decoder.extend(&encode_frame("broadcast ok").unwrap());
        assert!(decoder.decode_next().unwrap().is_some());
    }
}
