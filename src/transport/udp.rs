//! UDP transport
//!
//! Datagrams are sent from an ephemeral socket to `(host, port)`. Replies
//! are expected on a second socket bound locally to `port + 1`, because the
//! vehicle does not necessarily answer from the address it was sent to.
//! Send peer and receive source are therefore not symmetric; anything built
//! on top must not assume a reply comes from `(host, port)`.

use async_trait::async_trait;
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{lookup_host, UdpSocket};
use tokio::sync::Mutex;

use super::{Transport, TransportError, TransportReader, TransportResult, Unit};
use crate::config::{NetworkConfig, TransportKind};

struct UdpSender {
    socket: Arc<UdpSocket>,
    peer: SocketAddr,
}

/// Datagram channel to the vehicle
pub struct UdpTransport {
    config: NetworkConfig,
    sender: Mutex<Option<UdpSender>>,
}

impl UdpTransport {
    pub fn new(config: NetworkConfig) -> Self {
        Self {
            config,
            sender: Mutex::new(None),
        }
    }

    async fn resolve_peer(&self) -> TransportResult<SocketAddr> {
        let target = format!("{}:{}", self.config.host, self.config.port);
        let peer = lookup_host(target.as_str()).await?.next();
        peer.ok_or(TransportError::InvalidAddress(target))
    }
}

#[async_trait]
impl Transport for UdpTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Udp
    }

    fn describe(&self) -> String {
        format!(
            "udp://{}:{} (receiving on {}:{})",
            self.config.host,
            self.config.port,
            self.config.bind_address,
            self.config.port.wrapping_add(1)
        )
    }

    async fn connect(&self) -> TransportResult<Box<dyn TransportReader>> {
        let mut sender = self.sender.lock().await;
        if sender.is_some() {
            return Err(TransportError::AlreadyConnected);
        }

        let receive_port = self.config.receive_port().ok_or_else(|| {
            TransportError::InvalidAddress(format!("no receive port above {}", self.config.port))
        })?;

        let peer = self.resolve_peer().await?;
        let local = if peer.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
        let send_socket = UdpSocket::bind(local).await?;

        let receive_socket =
            UdpSocket::bind((self.config.bind_address.as_str(), receive_port)).await?;

        tracing::info!(
            "UDP sending to {}, listening on {}",
            peer,
            receive_socket.local_addr()?
        );

        *sender = Some(UdpSender {
            socket: Arc::new(send_socket),
            peer,
        });

        Ok(Box::new(UdpReader::new(
            receive_socket,
            self.config.max_datagram_size,
        )))
    }

    async fn send(&self, bytes: &[u8]) -> TransportResult<()> {
        if bytes.len() > self.config.max_datagram_size {
            return Err(TransportError::MessageTooLarge(
                bytes.len(),
                self.config.max_datagram_size,
            ));
        }

        let (socket, peer) = {
            let guard = self.sender.lock().await;
            let sender = guard.as_ref().ok_or(TransportError::NotConnected)?;
            (sender.socket.clone(), sender.peer)
        };

        socket.send_to(bytes, peer).await?;
        Ok(())
    }

    async fn disconnect(&self) {
        self.sender.lock().await.take();
    }
}

/// Receive side of the UDP transport, one datagram per unit
pub struct UdpReader {
    socket: UdpSocket,
    buf: Vec<u8>,
}

impl UdpReader {
    pub fn new(socket: UdpSocket, max_datagram_size: usize) -> Self {
        Self {
            socket,
            buf: vec![0u8; max_datagram_size],
        }
    }
}

#[async_trait]
impl TransportReader for UdpReader {
    async fn read_unit(&mut self) -> TransportResult<Option<Unit>> {
        let (n, from) = self.socket.recv_from(&mut self.buf).await?;
        tracing::debug!("UDP datagram of {} bytes from {}", n, from);
        Ok(Some(Unit::Packet(Bytes::copy_from_slice(&self.buf[..n]))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn config_for(port: u16) -> NetworkConfig {
        NetworkConfig {
            host: "127.0.0.1".into(),
            port,
            bind_address: "127.0.0.1".into(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_send_to_port_receive_on_port_plus_one() {
        let vehicle = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = vehicle.local_addr().unwrap().port();

        let transport = UdpTransport::new(config_for(port));
        let mut reader = transport.connect().await.unwrap();

        transport.send(b"PING").await.unwrap();
        let mut buf = [0u8; 64];
        let (n, _) = vehicle.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"PING");

        // Reply from a different socket than the one addressed.
        let other = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        other.send_to(b"PONG", ("127.0.0.1", port + 1)).await.unwrap();

        let unit = tokio::time::timeout(Duration::from_secs(2), reader.read_unit())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(unit, Some(Unit::Packet(Bytes::from_static(b"PONG"))));

        transport.disconnect().await;
    }

    #[tokio::test]
    async fn test_oversized_datagram_rejected() {
        let vehicle = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = vehicle.local_addr().unwrap().port();
        let transport = UdpTransport::new(NetworkConfig {
            max_datagram_size: 16,
            ..config_for(port)
        });
        let _reader = transport.connect().await.unwrap();

        assert!(matches!(
            transport.send(&[0u8; 17]).await,
            Err(TransportError::MessageTooLarge(17, 16))
        ));
    }

    #[tokio::test]
    async fn test_resolve_peer() {
        let transport = UdpTransport::new(config_for(9000));
        let peer = transport.resolve_peer().await.unwrap();
        assert_eq!(peer, "127.0.0.1:9000".parse::<SocketAddr>().unwrap());
    }

    #[tokio::test]
    async fn test_send_before_connect() {
        let transport = UdpTransport::new(config_for(9));
        assert!(matches!(
            transport.send(b"x").await,
            Err(TransportError::NotConnected)
        ));
    }
}
