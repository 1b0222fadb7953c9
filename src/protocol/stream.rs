//! Incremental decoders for byte-stream channels
//!
//! Serial ports and raw TCP streams deliver bytes in arbitrary chunks.
//! `FrameDecoder` reassembles frames from them using the start/end markers,
//! `LineBuffer` splits the line-oriented protocol on `\n`.

use bytes::{Buf, BytesMut};

use super::{
    decode_frame, declared_length, DecodeError, Message, FRAME_OVERHEAD, HEADER_SIZE,
    MAX_PAYLOAD_SIZE, START_MARKER,
};

/// Longest line kept while waiting for its terminator
pub const MAX_LINE_LENGTH: usize = 4096;

/// Reassembles frames from an unframed byte stream.
///
/// Bytes before a start marker are discarded. A frame that fails its end
/// marker or checksum is reported and scanning resumes one byte after its
/// start marker, so a damaged frame cannot swallow the frames behind it.
pub struct FrameDecoder {
    buf: BytesMut,
    max_payload: usize,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::with_max_payload(MAX_PAYLOAD_SIZE)
    }

    pub fn with_max_payload(max_payload: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(4096),
            max_payload,
        }
    }

    /// Append received bytes
    pub fn extend(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Number of bytes waiting for the rest of a frame
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Next decoded frame. Returns `None` if more data is needed.
    pub fn next_frame(&mut self) -> Option<Result<Message, DecodeError>> {
        loop {
            self.resync()?;

            if self.buf.len() < HEADER_SIZE {
                return None;
            }

            let length = declared_length(&self.buf)?;
            if length > self.max_payload {
                tracing::debug!(
                    "Ignoring start marker with implausible length {} (max: {})",
                    length,
                    self.max_payload
                );
                self.buf.advance(1);
                continue;
            }

            let total = FRAME_OVERHEAD + length;
            if self.buf.len() < total {
                return None;
            }

            return match decode_frame(&self.buf[..total]) {
                Ok(message) => {
                    self.buf.advance(total);
                    Some(Ok(message))
                }
                Err(err @ DecodeError::MalformedPayload(_)) => {
                    // Framing was intact, only the contents are bad.
                    self.buf.advance(total);
                    Some(Err(err))
                }
                Err(err) => {
                    self.buf.advance(1);
                    Some(Err(err))
                }
            };
        }
    }

    /// Drop everything before the next start marker. Returns `None` when no
    /// marker is buffered yet.
    fn resync(&mut self) -> Option<()> {
        match self.buf.windows(2).position(|w| w == START_MARKER) {
            Some(0) => Some(()),
            Some(pos) => {
                tracing::debug!("Discarding {} bytes before start marker", pos);
                self.buf.advance(pos);
                Some(())
            }
            None => {
                // A trailing first marker byte may be completed by the next chunk.
                let keep = usize::from(self.buf.last() == Some(&START_MARKER[0]));
                let discard = self.buf.len() - keep;
                if discard > 0 {
                    tracing::debug!("Discarding {} bytes without start marker", discard);
                    self.buf.advance(discard);
                }
                None
            }
        }
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Splits the line-oriented protocol into trimmed, non-empty lines
pub struct LineBuffer {
    buf: BytesMut,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(256),
        }
    }

    /// Append received bytes
    pub fn extend(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Next complete line, without its terminator
    pub fn next_line(&mut self) -> Option<String> {
        loop {
            let Some(pos) = self.buf.iter().position(|b| *b == b'\n') else {
                if self.buf.len() > MAX_LINE_LENGTH {
                    tracing::warn!("Dropping {} bytes of unterminated line", self.buf.len());
                    self.buf.clear();
                }
                return None;
            };

            let line = self.buf.split_to(pos + 1);
            let text = String::from_utf8_lossy(&line).trim().to_string();
            if !text.is_empty() {
                return Some(text);
            }
        }
    }
}

impl Default for LineBuffer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Command, FrameCodec, Payload};

    fn frame(codec: &FrameCodec, command: Command) -> Vec<u8> {
        codec.encode(command, Payload::new(), false).unwrap().bytes.to_vec()
    }

    #[test]
    fn test_frames_split_across_chunks() {
        let codec = FrameCodec::new();
        let mut stream = frame(&codec, Command::Ping);
        stream.extend(frame(&codec, Command::EmergencyStop));

        let mut decoder = FrameDecoder::new();
        let mut decoded = Vec::new();
        for chunk in stream.chunks(3) {
            decoder.extend(chunk);
            while let Some(result) = decoder.next_frame() {
                decoded.push(result.unwrap().command);
            }
        }

        assert_eq!(decoded, vec![Command::Ping, Command::EmergencyStop]);
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn test_leading_garbage_is_skipped() {
        let codec = FrameCodec::new();
        let mut decoder = FrameDecoder::new();
        decoder.extend(b"noise\x00\x13");
        decoder.extend(&frame(&codec, Command::Ping));

        let message = decoder.next_frame().unwrap().unwrap();
        assert_eq!(message.command, Command::Ping);
        assert!(decoder.next_frame().is_none());
    }

    #[test]
    fn test_corrupt_frame_does_not_poison_stream() {
        let codec = FrameCodec::new();
        let mut bad = frame(&codec, Command::Ping);
        bad[HEADER_SIZE + 1] ^= 0x40;

        let mut decoder = FrameDecoder::new();
        decoder.extend(&bad);
        decoder.extend(&frame(&codec, Command::TelemetryRequest));

        assert!(matches!(
            decoder.next_frame(),
            Some(Err(DecodeError::ChecksumMismatch { .. }))
        ));
        let message = decoder.next_frame().unwrap().unwrap();
        assert_eq!(message.command, Command::TelemetryRequest);
    }

    #[test]
    fn test_partial_marker_is_kept() {
        let codec = FrameCodec::new();
        let bytes = frame(&codec, Command::Ping);

        let mut decoder = FrameDecoder::new();
        decoder.extend(b"xx");
        decoder.extend(&bytes[..1]);
        assert!(decoder.next_frame().is_none());
        assert_eq!(decoder.buffered(), 1);

        decoder.extend(&bytes[1..]);
        assert!(decoder.next_frame().unwrap().is_ok());
    }

    #[test]
    fn test_implausible_length_is_skipped() {
        let codec = FrameCodec::new();
        let mut decoder = FrameDecoder::with_max_payload(1024);
        decoder.extend(&START_MARKER);
        decoder.extend(&u32::MAX.to_le_bytes());
        decoder.extend(&[0, 0, 0, 0]);
        decoder.extend(&frame(&codec, Command::Ping));

        let message = decoder.next_frame().unwrap().unwrap();
        assert_eq!(message.command, Command::Ping);
    }

    #[test]
    fn test_lines() {
        let mut lines = LineBuffer::new();
        lines.extend(b"DEPTH,12.4\r\n\nTEMP");
        assert_eq!(lines.next_line().as_deref(), Some("DEPTH,12.4"));
        assert_eq!(lines.next_line(), None);

        lines.extend(b",18.0\n");
        assert_eq!(lines.next_line().as_deref(), Some("TEMP,18.0"));
    }

    #[test]
    fn test_runaway_line_is_dropped() {
        let mut lines = LineBuffer::new();
        lines.extend(&vec![b'x'; MAX_LINE_LENGTH + 1]);
        assert_eq!(lines.next_line(), None);

        lines.extend(b"OK\n");
        assert_eq!(lines.next_line().as_deref(), Some("OK"));
    }
}
