//! RovLink - Command and telemetry link to a remote vehicle
//!
//! Frames messages with markers, a length and a checksum, tracks the ones
//! that need an acknowledgement and retransmits them, over a serial port,
//! a TCP stream or UDP datagrams.

pub mod config;
pub mod delivery;
pub mod link;
pub mod protocol;
pub mod transport;

pub use config::Config;
pub use link::{ConnectionState, Inbound, Link, LinkEvent};
