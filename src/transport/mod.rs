//! Transport module - Physical channels to the vehicle
//!
//! Provides:
//! - Serial ports (framed or line protocol)
//! - TCP streams (marker framed or length-prefixed)
//! - UDP datagrams (send to `port`, receive on local `port + 1`)
//!
//! Transports move bytes only. Framing, checksums and acknowledgements
//! live in [`crate::protocol`] and [`crate::delivery`] on top of them.

mod serial;
mod tcp;
mod udp;

pub use serial::*;
pub use tcp::*;
pub use udp::*;

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::config::{LinkConfig, TransportKind};

/// Transport errors
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("Not connected")]
    NotConnected,

    #[error("Already connected")]
    AlreadyConnected,

    #[error("Message too large: {0} bytes (max: {1})")]
    MessageTooLarge(usize, usize),

    #[error("Could not resolve address: {0}")]
    InvalidAddress(String),
}

pub type TransportResult<T> = Result<T, TransportError>;

/// A piece of inbound data, tagged with how its boundaries are known
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Unit {
    /// One complete message, delimited by the transport
    Packet(Bytes),
    /// Arbitrary slice of a frame stream
    Stream(Bytes),
    /// Arbitrary slice of a line protocol stream
    Text(Bytes),
}

/// A bidirectional byte channel to the vehicle
#[async_trait]
pub trait Transport: Send + Sync {
    /// Which kind of channel this is
    fn kind(&self) -> TransportKind;

    /// Human-readable endpoint, for logs
    fn describe(&self) -> String;

    /// Whether the channel speaks the line protocol instead of frames
    fn is_line_mode(&self) -> bool {
        false
    }

    /// Open the channel and hand back its receive side
    async fn connect(&self) -> TransportResult<Box<dyn TransportReader>>;

    /// Write one message
    async fn send(&self, bytes: &[u8]) -> TransportResult<()>;

    /// Close the send side. Safe to call repeatedly.
    async fn disconnect(&self);
}

/// Receive side of a connected transport
#[async_trait]
pub trait TransportReader: Send {
    /// Next piece of inbound data, `Ok(None)` once the peer has closed.
    ///
    /// Implementations keep partial data in `self`, so dropping the
    /// returned future (e.g. on a poll timeout) loses nothing.
    async fn read_unit(&mut self) -> TransportResult<Option<Unit>>;
}

/// Build the transport selected by `config.transport`
pub fn from_config(config: &LinkConfig) -> Arc<dyn Transport> {
    match config.transport {
        TransportKind::Serial => Arc::new(SerialTransport::new(config.serial.clone())),
        TransportKind::Tcp => Arc::new(TcpTransport::new(config.network.clone())),
        TransportKind::Udp => Arc::new(UdpTransport::new(config.network.clone())),
    }
}
