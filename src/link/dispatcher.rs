//! Receive dispatcher
//!
//! Background task that turns inbound transport data into events:
//! - decodes frames, reassembling them from byte streams when needed
//! - answers messages that ask for an ACK
//! - routes incoming ACKs to the delivery manager instead of the consumer
//! - passes everything else to the consumer channel
//!
//! Any transport error stops the task for good. Reconnecting is up to the
//! owner of the link.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::{EventSink, Inbound, LinkEvent};
use crate::delivery::DeliveryManager;
use crate::protocol::{decode_frame, DecodeError, FrameCodec, FrameDecoder, LineBuffer, Message};
use crate::transport::{Transport, TransportReader, Unit};

/// Why the dispatcher stopped
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatcherExit {
    /// The running flag was cleared
    Stopped,
    /// The peer closed the channel
    PeerClosed,
    /// A receive error ended the loop
    Failed(String),
}

/// Classify one transport-delimited message.
///
/// Text that is not a frame at all is passed on as raw text, anything that
/// looks like a damaged frame is reported as invalid.
pub fn classify_packet(bytes: &[u8]) -> Inbound {
    match decode_frame(bytes) {
        Ok(message) => Inbound::Structured(message),
        Err(err @ (DecodeError::InvalidStart | DecodeError::Incomplete(_))) => {
            match std::str::from_utf8(bytes) {
                Ok(text) => Inbound::Raw(text.trim().to_string()),
                Err(_) => Inbound::Invalid(err),
            }
        }
        Err(err) => Inbound::Invalid(err),
    }
}

pub(crate) struct Dispatcher {
    reader: Box<dyn TransportReader>,
    transport: Arc<dyn Transport>,
    codec: Arc<FrameCodec>,
    delivery: Arc<DeliveryManager>,
    events: EventSink,
    running: Arc<AtomicBool>,
    poll_interval: Duration,
    frames: FrameDecoder,
    lines: LineBuffer,
}

impl Dispatcher {
    pub(crate) fn new(
        reader: Box<dyn TransportReader>,
        transport: Arc<dyn Transport>,
        codec: Arc<FrameCodec>,
        delivery: Arc<DeliveryManager>,
        events: EventSink,
        running: Arc<AtomicBool>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            reader,
            transport,
            codec,
            delivery,
            events,
            running,
            poll_interval,
            frames: FrameDecoder::new(),
            lines: LineBuffer::new(),
        }
    }

    /// Read until the running flag clears, the peer closes or a read fails
    pub(crate) async fn run(mut self) -> DispatcherExit {
        while self.running.load(Ordering::SeqCst) {
            let unit =
                match tokio::time::timeout(self.poll_interval, self.reader.read_unit()).await {
                    Err(_) => continue,
                    Ok(Ok(Some(unit))) => unit,
                    Ok(Ok(None)) => {
                        tracing::info!("Peer closed the channel");
                        return DispatcherExit::PeerClosed;
                    }
                    Ok(Err(e)) => {
                        tracing::error!("Receive dispatcher stopped: {}", e);
                        return DispatcherExit::Failed(e.to_string());
                    }
                };

            self.handle_unit(unit).await;
        }

        DispatcherExit::Stopped
    }

    async fn handle_unit(&mut self, unit: Unit) {
        match unit {
            Unit::Packet(bytes) => {
                let inbound = classify_packet(&bytes);
                self.dispatch(inbound).await;
            }
            Unit::Stream(chunk) => {
                self.frames.extend(&chunk);
                while let Some(result) = self.frames.next_frame() {
                    let inbound = match result {
                        Ok(message) => Inbound::Structured(message),
                        Err(e) => Inbound::Invalid(e),
                    };
                    self.dispatch(inbound).await;
                }
            }
            Unit::Text(chunk) => {
                self.lines.extend(&chunk);
                while let Some(line) = self.lines.next_line() {
                    self.dispatch(Inbound::Raw(line)).await;
                }
            }
        }
    }

    async fn dispatch(&mut self, inbound: Inbound) {
        match inbound {
            Inbound::Structured(message) => self.dispatch_message(message).await,
            Inbound::Invalid(e) => {
                tracing::warn!("Dropping frame: {}", e);
                self.events.deliver(Inbound::Invalid(e)).await;
            }
            Inbound::Raw(text) => {
                tracing::debug!("Received text: {}", text);
                self.events.deliver(Inbound::Raw(text)).await;
            }
        }
    }

    async fn dispatch_message(&mut self, message: Message) {
        tracing::debug!(
            "Received message id={} command={} ack={}",
            message.id,
            message.command,
            message.require_ack
        );

        if message.require_ack {
            self.send_ack(message.id).await;
        }

        if message.is_ack() {
            match message.acked_id() {
                Some(id) => {
                    if self.delivery.on_ack(id).await {
                        self.events.notify(LinkEvent::Delivered { id });
                    }
                }
                None => tracing::warn!("ACK {} does not name a valid message id", message.id),
            }
            return;
        }

        self.events.deliver(Inbound::Structured(message)).await;
    }

    async fn send_ack(&mut self, original_id: u16) {
        let ack = match self.codec.encode_ack(original_id) {
            Ok(ack) => ack,
            Err(e) => {
                tracing::error!("Could not encode ACK for message {}: {}", original_id, e);
                return;
            }
        };

        match self.transport.send(&ack.bytes).await {
            Ok(()) => tracing::debug!("Sent ACK {} for message {}", ack.id(), original_id),
            Err(e) => tracing::warn!("Could not send ACK for message {}: {}", original_id, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{encode_frame, Command, Payload};

    #[test]
    fn test_classify_structured() {
        let message = Message::new(3, Command::Telemetry, Payload::new(), false);
        let bytes = encode_frame(&message).unwrap();
        match classify_packet(&bytes) {
            Inbound::Structured(decoded) => assert_eq!(decoded.command, Command::Telemetry),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_classify_plain_text_is_raw() {
        assert!(matches!(
            classify_packet(b"{\"type\":\"pong\"}\n"),
            Inbound::Raw(text) if text == "{\"type\":\"pong\"}"
        ));
        assert!(matches!(classify_packet(b"OK"), Inbound::Raw(text) if text == "OK"));
    }

    #[test]
    fn test_classify_damaged_frame_is_invalid() {
        let message = Message::new(3, Command::Telemetry, Payload::new(), false);
        let mut bytes = encode_frame(&message).unwrap().to_vec();
        let last = bytes.len() - 3;
        bytes[last] ^= 0x01;
        assert!(matches!(
            classify_packet(&bytes),
            Inbound::Invalid(DecodeError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_classify_binary_garbage_is_invalid() {
        assert!(matches!(
            classify_packet(&[0xFF, 0xFE, 0x00]),
            Inbound::Invalid(DecodeError::Incomplete(3))
        ));
    }
}
