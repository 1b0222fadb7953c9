//! TCP transport
//!
//! With `Markers` framing the stream carries frames back to back and the
//! receive side hands raw chunks to the frame decoder. With `LengthPrefix`
//! every message is preceded by its length as a 4-byte big-endian integer.

use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::Mutex;

use super::{Transport, TransportError, TransportReader, TransportResult, Unit};
use crate::config::{NetworkConfig, TcpFraming, TransportKind};
use crate::protocol::MAX_PAYLOAD_SIZE;

/// Size of the length prefix
pub const LENGTH_PREFIX_SIZE: usize = 4;

const READ_CHUNK_SIZE: usize = 4096;

/// Client side of a TCP connection to the vehicle
pub struct TcpTransport {
    config: NetworkConfig,
    writer: Mutex<Option<OwnedWriteHalf>>,
}

impl TcpTransport {
    pub fn new(config: NetworkConfig) -> Self {
        Self {
            config,
            writer: Mutex::new(None),
        }
    }

    pub fn framing(&self) -> TcpFraming {
        self.config.tcp_framing
    }
}

/// Prepend the 4-byte big-endian length to `payload`
pub fn length_prefixed(payload: &[u8]) -> TransportResult<Bytes> {
    let length = u32::try_from(payload.len())
        .map_err(|_| TransportError::MessageTooLarge(payload.len(), u32::MAX as usize))?;

    let mut buf = BytesMut::with_capacity(LENGTH_PREFIX_SIZE + payload.len());
    buf.put_u32(length);
    buf.put_slice(payload);
    Ok(buf.freeze())
}

#[async_trait]
impl Transport for TcpTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Tcp
    }

    fn describe(&self) -> String {
        format!("tcp://{}:{}", self.config.host, self.config.port)
    }

    async fn connect(&self) -> TransportResult<Box<dyn TransportReader>> {
        let mut writer = self.writer.lock().await;
        if writer.is_some() {
            return Err(TransportError::AlreadyConnected);
        }

        let timeout = Duration::from_millis(self.config.connect_timeout_ms);
        let addr = (self.config.host.as_str(), self.config.port);

        let stream = match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(TransportError::Io(e)),
            Err(_) => return Err(TransportError::Timeout(timeout)),
        };

        // Control traffic is small and latency sensitive.
        stream.set_nodelay(true)?;

        tracing::info!(
            "TCP connected to {} ({:?} framing)",
            stream.peer_addr()?,
            self.config.tcp_framing
        );

        let (read_half, write_half) = stream.into_split();
        *writer = Some(write_half);

        Ok(Box::new(TcpReader::new(read_half, self.config.tcp_framing)))
    }

    async fn send(&self, bytes: &[u8]) -> TransportResult<()> {
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(TransportError::NotConnected)?;

        match self.config.tcp_framing {
            TcpFraming::Markers => writer.write_all(bytes).await?,
            TcpFraming::LengthPrefix => writer.write_all(&length_prefixed(bytes)?).await?,
        }
        writer.flush().await?;

        Ok(())
    }

    async fn disconnect(&self) {
        if let Some(mut writer) = self.writer.lock().await.take() {
            if let Err(e) = writer.shutdown().await {
                tracing::debug!("TCP shutdown: {}", e);
            }
        }
    }
}

/// Receive side of a TCP connection
pub struct TcpReader<R> {
    inner: R,
    framing: TcpFraming,
    buf: BytesMut,
    max_message_size: usize,
}

impl<R: AsyncRead + Unpin + Send> TcpReader<R> {
    pub fn new(inner: R, framing: TcpFraming) -> Self {
        Self {
            inner,
            framing,
            buf: BytesMut::with_capacity(READ_CHUNK_SIZE),
            max_message_size: MAX_PAYLOAD_SIZE + crate::protocol::FRAME_OVERHEAD,
        }
    }

    pub fn with_max_message_size(mut self, max_message_size: usize) -> Self {
        self.max_message_size = max_message_size;
        self
    }

    /// Split one length-prefixed message off the buffer, if complete
    fn take_message(&mut self) -> TransportResult<Option<Bytes>> {
        if self.buf.len() < LENGTH_PREFIX_SIZE {
            return Ok(None);
        }

        let length = u32::from_be_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]])
            as usize;
        if length > self.max_message_size {
            // Boundaries are lost, the stream cannot be resynchronised.
            return Err(TransportError::MessageTooLarge(length, self.max_message_size));
        }

        if self.buf.len() < LENGTH_PREFIX_SIZE + length {
            return Ok(None);
        }

        self.buf.advance(LENGTH_PREFIX_SIZE);
        Ok(Some(self.buf.split_to(length).freeze()))
    }
}

#[async_trait]
impl<R: AsyncRead + Unpin + Send> TransportReader for TcpReader<R> {
    async fn read_unit(&mut self) -> TransportResult<Option<Unit>> {
        loop {
            if self.framing == TcpFraming::Markers && !self.buf.is_empty() {
                let chunk = self.buf.split().freeze();
                return Ok(Some(Unit::Stream(chunk)));
            }

            if self.framing == TcpFraming::LengthPrefix {
                if let Some(message) = self.take_message()? {
                    return Ok(Some(Unit::Packet(message)));
                }
            }

            self.buf.reserve(READ_CHUNK_SIZE);
            let n = self.inner.read_buf(&mut self.buf).await?;

            if n == 0 {
                if !self.buf.is_empty() {
                    tracing::warn!(
                        "Peer closed with {} bytes of an incomplete message",
                        self.buf.len()
                    );
                }
                return Ok(None);
            }
        }
    }
}
