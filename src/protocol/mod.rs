//! Protocol module - Defines the wire protocol between station and vehicle
//!
//! Every frame has the layout:
//! - 2 bytes start marker (`AA 55`)
//! - 4 bytes payload length (little-endian)
//! - 4 bytes checksum (little-endian, XOR-fold of the payload)
//! - JSON payload
//! - 2 bytes end marker (`55 AA`)
//!
//! A second, line-oriented ASCII protocol exists for simple serial
//! controllers. The two never share a channel.

mod codec;
mod line;
mod message;
mod stream;

pub use codec::*;
pub use line::*;
pub use message::*;
pub use stream::*;

/// Default network port of the vehicle
pub const DEFAULT_PORT: u16 = 8080;

/// Default serial baud rate
pub const DEFAULT_BAUD_RATE: u32 = 9600;

/// Marker opening every frame
pub const START_MARKER: [u8; 2] = [0xAA, 0x55];

/// Marker closing every frame
pub const END_MARKER: [u8; 2] = [0x55, 0xAA];

/// Header size: start(2) + length(4) + checksum(4) = 10 bytes
pub const HEADER_SIZE: usize = 10;

/// Header plus end marker. Also the size of a frame with an empty payload.
pub const FRAME_OVERHEAD: usize = HEADER_SIZE + END_MARKER.len();

/// Largest datagram accepted on the UDP path
pub const MAX_DATAGRAM_SIZE: usize = 4096;

/// Largest payload accepted from a byte stream before the header is
/// considered corrupt (64 KiB)
pub const MAX_PAYLOAD_SIZE: usize = 64 * 1024;
