//! Protocol codec for encoding/decoding frames
//!
//! Handles sequence allocation, serialization and integrity checking of
//! protocol messages.
//!
//! The checksum is an XOR-fold of the payload bytes. It catches every
//! single-byte corruption but is blind to corruptions that cancel out
//! (for example the same bit flipped in two payload bytes). It is an
//! error detector for a noisy cable, not a digest.

use bytes::{BufMut, Bytes, BytesMut};
use std::sync::atomic::{AtomicU16, Ordering};
use thiserror::Error;

use super::{
    Command, Message, Payload, END_MARKER, FRAME_OVERHEAD, HEADER_SIZE, MAX_PAYLOAD_SIZE,
    START_MARKER,
};

/// Encoding errors
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Payload too large: {0} bytes (max: {1})")]
    PayloadTooLarge(usize, usize),

    #[error("No free sequence id")]
    SequenceExhausted,
}

pub type CodecResult<T> = Result<T, CodecError>;

/// Reasons a received frame is dropped
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("Incomplete frame: {0} bytes")]
    Incomplete(usize),

    #[error("Invalid start marker")]
    InvalidStart,

    #[error("Truncated frame: have {have} bytes, need {need}")]
    TruncatedFrame { have: usize, need: usize },

    #[error("Invalid end marker")]
    InvalidEnd,

    #[error("Checksum mismatch: expected {expected:#x}, computed {computed:#x}")]
    ChecksumMismatch { expected: u32, computed: u32 },

    #[error("Malformed payload: {0}")]
    MalformedPayload(String),
}

/// XOR of every payload byte, widened to the 4-byte checksum field
pub fn xor_checksum(payload: &[u8]) -> u32 {
    u32::from(payload.iter().fold(0u8, |acc, byte| acc ^ byte))
}

/// Frame a message: start marker, length, checksum, payload, end marker.
///
/// The payload is serialized before anything is written, so a failure
/// never leaves a partial frame behind.
pub fn encode_frame(message: &Message) -> CodecResult<Bytes> {
    let payload = serde_json::to_vec(message)?;

    if payload.len() > MAX_PAYLOAD_SIZE {
        return Err(CodecError::PayloadTooLarge(payload.len(), MAX_PAYLOAD_SIZE));
    }

    let mut buf = BytesMut::with_capacity(FRAME_OVERHEAD + payload.len());
    buf.put_slice(&START_MARKER);
    buf.put_u32_le(payload.len() as u32);
    buf.put_u32_le(xor_checksum(&payload));
    buf.put_slice(&payload);
    buf.put_slice(&END_MARKER);

    Ok(buf.freeze())
}

/// Read the declared payload length of a frame header, if the buffer holds
/// a full header starting with the start marker
pub fn declared_length(buf: &[u8]) -> Option<usize> {
    if buf.len() < HEADER_SIZE || buf[0..2] != START_MARKER {
        return None;
    }
    Some(u32::from_le_bytes([buf[2], buf[3], buf[4], buf[5]]) as usize)
}

/// Validate the framing of `buf` and return the payload slice.
///
/// Bytes after the end marker are ignored.
pub fn frame_payload(buf: &[u8]) -> Result<&[u8], DecodeError> {
    if buf.len() < FRAME_OVERHEAD {
        return Err(DecodeError::Incomplete(buf.len()));
    }

    if buf[0..2] != START_MARKER {
        return Err(DecodeError::InvalidStart);
    }

    let length = u32::from_le_bytes([buf[2], buf[3], buf[4], buf[5]]) as usize;
    let expected = u32::from_le_bytes([buf[6], buf[7], buf[8], buf[9]]);

    let total = FRAME_OVERHEAD.saturating_add(length);
    if buf.len() < total {
        return Err(DecodeError::TruncatedFrame {
            have: buf.len(),
            need: total,
        });
    }

    let end = HEADER_SIZE + length;
    if buf[end..end + 2] != END_MARKER {
        return Err(DecodeError::InvalidEnd);
    }

    let payload = &buf[HEADER_SIZE..end];
    let computed = xor_checksum(payload);
    if computed != expected {
        return Err(DecodeError::ChecksumMismatch { expected, computed });
    }

    Ok(payload)
}

/// Decode one complete frame into a message
pub fn decode_frame(buf: &[u8]) -> Result<Message, DecodeError> {
    let payload = frame_payload(buf)?;
    serde_json::from_slice(payload).map_err(|e| DecodeError::MalformedPayload(e.to_string()))
}

/// Next id after `id`, wrapping 65535 back to 1 and never yielding 0
pub fn next_sequence_id(id: u16) -> u16 {
    if id == u16::MAX {
        1
    } else {
        id + 1
    }
}

/// Hands out message ids, monotonically, 1..=65535
#[derive(Debug, Default)]
pub struct SequenceAllocator {
    last: AtomicU16,
}

impl SequenceAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocator whose next id follows `last`
    pub fn starting_after(last: u16) -> Self {
        Self {
            last: AtomicU16::new(last),
        }
    }

    /// Allocate the next id
    pub fn next(&self) -> u16 {
        let previous = self
            .last
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |id| {
                Some(next_sequence_id(id))
            })
            .unwrap_or_else(|id| id);
        next_sequence_id(previous)
    }

    /// Most recently allocated id, 0 before the first allocation
    pub fn last(&self) -> u16 {
        self.last.load(Ordering::SeqCst)
    }
}

/// A message together with its exact wire bytes
#[derive(Debug, Clone)]
pub struct EncodedFrame {
    pub message: Message,
    pub bytes: Bytes,
}

impl EncodedFrame {
    pub fn id(&self) -> u16 {
        self.message.id
    }
}

/// Encodes outbound messages with fresh ids and decodes inbound frames
#[derive(Debug, Default)]
pub struct FrameCodec {
    sequence: SequenceAllocator,
}

impl FrameCodec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Codec whose first id follows `last`
    pub fn starting_after(last: u16) -> Self {
        Self {
            sequence: SequenceAllocator::starting_after(last),
        }
    }

    /// Encode a command under the next sequence id
    pub fn encode(
        &self,
        command: Command,
        data: Payload,
        require_ack: bool,
    ) -> CodecResult<EncodedFrame> {
        self.encode_avoiding(command, data, require_ack, |_| false)
    }

    /// Encode a command under the next id for which `in_use` is false
    pub fn encode_avoiding(
        &self,
        command: Command,
        data: Payload,
        require_ack: bool,
        in_use: impl Fn(u16) -> bool,
    ) -> CodecResult<EncodedFrame> {
        let id = (0..u16::MAX)
            .map(|_| self.sequence.next())
            .find(|id| !in_use(*id))
            .ok_or(CodecError::SequenceExhausted)?;

        let message = Message::new(id, command, data, require_ack);
        let bytes = encode_frame(&message)?;

        tracing::debug!(
            "Encoded frame id={} command={} ack={} ({} bytes)",
            id,
            message.command,
            require_ack,
            bytes.len()
        );

        Ok(EncodedFrame { message, bytes })
    }

    /// Encode the ACK answering `original_id`
    pub fn encode_ack(&self, original_id: u16) -> CodecResult<EncodedFrame> {
        let message = Message::ack(self.sequence.next(), original_id);
        let bytes = encode_frame(&message)?;
        Ok(EncodedFrame { message, bytes })
    }

    /// Decode one complete frame
    pub fn decode(&self, buf: &[u8]) -> Result<Message, DecodeError> {
        decode_frame(buf)
    }

    /// Most recently allocated id
    pub fn last_id(&self) -> u16 {
        self.sequence.last()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    fn payload(pairs: &[(&str, Value)]) -> Payload {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        let codec = FrameCodec::new();
        let data = payload(&[("depth", Value::from(12.5)), ("lights", Value::from(true))]);

        let frame = codec.encode(Command::Ping, data.clone(), true).unwrap();
        let decoded = codec.decode(&frame.bytes).unwrap();

        assert_eq!(decoded.id, frame.id());
        assert_eq!(decoded.command, Command::Ping);
        assert_eq!(decoded.data, data);
        assert!(decoded.require_ack);
    }

    #[test]
    fn test_frame_layout() {
        let codec = FrameCodec::new();
        let frame = codec.encode(Command::TelemetryRequest, Payload::new(), false).unwrap();
        let bytes = &frame.bytes;

        assert_eq!(bytes[0..2], START_MARKER);
        let length = u32::from_le_bytes([bytes[2], bytes[3], bytes[4], bytes[5]]) as usize;
        assert_eq!(bytes.len(), FRAME_OVERHEAD + length);
        assert_eq!(bytes[bytes.len() - 2..], END_MARKER);

        let checksum = u32::from_le_bytes([bytes[6], bytes[7], bytes[8], bytes[9]]);
        assert_eq!(checksum, xor_checksum(&bytes[HEADER_SIZE..HEADER_SIZE + length]));
        assert!(checksum <= 0xFF);
    }

    #[test]
    fn test_same_message_same_bytes() {
        let mut data = Payload::new();
        data.insert("zeta".into(), Value::from(1));
        data.insert("alpha".into(), Value::from(2));
        let message = Message {
            id: 5,
            command: Command::MotorCommand,
            data,
            timestamp: 1.5,
            require_ack: true,
        };

        let first = encode_frame(&message).unwrap();
        let second = encode_frame(&message.clone()).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_single_byte_corruption_detected() {
        let codec = FrameCodec::new();
        let frame = codec
            .encode(Command::MotorCommand, payload(&[("x", Value::from(1))]), false)
            .unwrap();
        let length = frame.bytes.len() - FRAME_OVERHEAD;

        for offset in HEADER_SIZE..HEADER_SIZE + length {
            for bit in 0..8 {
                let mut corrupted = frame.bytes.to_vec();
                corrupted[offset] ^= 1 << bit;
                assert!(matches!(
                    decode_frame(&corrupted),
                    Err(DecodeError::ChecksumMismatch { .. })
                ));
            }
        }
    }

    #[test]
    fn test_invalid_start() {
        let codec = FrameCodec::new();
        let mut bytes = codec.encode(Command::Ping, Payload::new(), false).unwrap().bytes.to_vec();
        bytes[0] = 0x00;
        assert_eq!(decode_frame(&bytes), Err(DecodeError::InvalidStart));
    }

    #[test]
    fn test_invalid_end() {
        let codec = FrameCodec::new();
        let mut bytes = codec.encode(Command::Ping, Payload::new(), false).unwrap().bytes.to_vec();
        let last = bytes.len() - 1;
        bytes[last] = 0x00;
        assert_eq!(decode_frame(&bytes), Err(DecodeError::InvalidEnd));
    }

    #[test]
    fn test_truncated_frame() {
        // Markers and checksum are fine, but only 3 of the 20 claimed payload
        // bytes arrived: 15 bytes in total.
        let mut buf = Vec::new();
        buf.extend_from_slice(&START_MARKER);
        buf.extend_from_slice(&20u32.to_le_bytes());
        buf.extend_from_slice(&xor_checksum(b"{\"a").to_le_bytes());
        buf.extend_from_slice(b"{\"a");
        buf.extend_from_slice(&END_MARKER);
        assert_eq!(buf.len(), 15);

        assert_eq!(
            decode_frame(&buf),
            Err(DecodeError::TruncatedFrame { have: 15, need: 32 })
        );
    }

    #[test]
    fn test_short_buffer_is_incomplete() {
        assert_eq!(decode_frame(&START_MARKER), Err(DecodeError::Incomplete(2)));
    }

    #[test]
    fn test_empty_payload_frame_is_malformed() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&START_MARKER);
        buf.extend_from_slice(&0u32.to_le_bytes());
        buf.extend_from_slice(&0u32.to_le_bytes());
        buf.extend_from_slice(&END_MARKER);

        assert_eq!(frame_payload(&buf), Ok(&[][..]));
        assert!(matches!(decode_frame(&buf), Err(DecodeError::MalformedPayload(_))));
    }

    #[test]
    fn test_malformed_payload() {
        let body = b"not json at all";
        let mut buf = Vec::new();
        buf.extend_from_slice(&START_MARKER);
        buf.extend_from_slice(&(body.len() as u32).to_le_bytes());
        buf.extend_from_slice(&xor_checksum(body).to_le_bytes());
        buf.extend_from_slice(body);
        buf.extend_from_slice(&END_MARKER);

        assert!(matches!(decode_frame(&buf), Err(DecodeError::MalformedPayload(_))));
    }

    #[test]
    fn test_sequence_wraps_to_one() {
        let allocator = SequenceAllocator::new();
        assert_eq!(allocator.next(), 1);

        let allocator = SequenceAllocator::new();
        let mut last = 0;
        for _ in 0..65535 {
            last = allocator.next();
        }
        assert_eq!(last, 65535);
        assert_eq!(allocator.next(), 1);
    }

    #[test]
    fn test_encode_skips_ids_in_use() {
        let codec = FrameCodec::starting_after(41);
        let frame = codec
            .encode_avoiding(Command::Ping, Payload::new(), true, |id| id == 42 || id == 43)
            .unwrap();
        assert_eq!(frame.id(), 44);
    }

    #[test]
    fn test_ack_frame() {
        let codec = FrameCodec::new();
        let ack = codec.encode_ack(42).unwrap();
        let decoded = codec.decode(&ack.bytes).unwrap();
        assert!(decoded.is_ack());
        assert_eq!(decoded.acked_id(), Some(42));
        assert!(!decoded.require_ack);
    }
}
