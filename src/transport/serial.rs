//! Serial transport
//!
//! Serial I/O is blocking, so a dedicated thread pumps received bytes into
//! a channel and writes run on the blocking pool. The reader thread uses a
//! short read timeout to notice shutdown.

use async_trait::async_trait;
use bytes::Bytes;
use serialport::{DataBits, FlowControl, Parity, SerialPort, SerialPortInfo, SerialPortType, StopBits};
use serde::Serialize;
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::sync::mpsc;

use super::{Transport, TransportError, TransportReader, TransportResult, Unit};
use crate::config::{SerialConfig, SerialMode, TransportKind};

const READ_CHUNK_SIZE: usize = 1024;

/// Chunks buffered between the reader thread and the dispatcher
const READ_QUEUE_DEPTH: usize = 64;

/// A serial port found on this machine
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PortInfo {
    /// Path or name to open, e.g. `/dev/ttyUSB0` or `COM3`
    pub device: String,
    pub description: String,
    pub hardware_id: String,
}

impl From<SerialPortInfo> for PortInfo {
    fn from(info: SerialPortInfo) -> Self {
        let (description, hardware_id) = match info.port_type {
            SerialPortType::UsbPort(usb) => {
                let description = usb
                    .product
                    .clone()
                    .or_else(|| usb.manufacturer.clone())
                    .unwrap_or_else(|| "USB Serial Device".to_string());
                let serial = usb
                    .serial_number
                    .map(|s| format!(" SER={}", s))
                    .unwrap_or_default();
                (
                    description,
                    format!("USB VID:PID={:04X}:{:04X}{}", usb.vid, usb.pid, serial),
                )
            }
            SerialPortType::PciPort => ("PCI Serial Device".to_string(), "PCI".to_string()),
            SerialPortType::BluetoothPort => {
                ("Bluetooth Serial Device".to_string(), "BLUETOOTH".to_string())
            }
            SerialPortType::Unknown => ("n/a".to_string(), "n/a".to_string()),
        };

        Self {
            device: info.port_name,
            description,
            hardware_id,
        }
    }
}

/// Enumerate the serial ports present on this machine
pub fn list_ports() -> TransportResult<Vec<PortInfo>> {
    let ports = serialport::available_ports()?;
    Ok(ports.into_iter().map(PortInfo::from).collect())
}

type SharedPort = Arc<Mutex<Option<Box<dyn SerialPort>>>>;

/// Serial link to the vehicle
pub struct SerialTransport {
    config: SerialConfig,
    port: SharedPort,
    running: Arc<AtomicBool>,
    reader_thread: Mutex<Option<JoinHandle<()>>>,
}

impl SerialTransport {
    pub fn new(config: SerialConfig) -> Self {
        Self {
            config,
            port: Arc::new(Mutex::new(None)),
            running: Arc::new(AtomicBool::new(false)),
            reader_thread: Mutex::new(None),
        }
    }

    pub fn mode(&self) -> SerialMode {
        self.config.mode
    }

    fn open(config: &SerialConfig) -> TransportResult<Box<dyn SerialPort>> {
        let port = serialport::new(&config.device, config.baud_rate)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .timeout(Duration::from_millis(config.timeout_ms))
            .open()?;
        Ok(port)
    }
}

fn poisoned() -> TransportError {
    TransportError::Io(io::Error::new(io::ErrorKind::Other, "serial port lock poisoned"))
}

fn join_error(e: tokio::task::JoinError) -> TransportError {
    TransportError::Io(io::Error::new(io::ErrorKind::Other, e))
}

/// Pump bytes from the port into `tx` until `running` clears or the port fails
fn pump(
    mut port: Box<dyn SerialPort>,
    running: Arc<AtomicBool>,
    tx: mpsc::Sender<io::Result<Bytes>>,
) {
    let mut buf = [0u8; READ_CHUNK_SIZE];

    while running.load(Ordering::SeqCst) {
        match port.read(&mut buf) {
            Ok(0) => continue,
            Ok(n) => {
                if tx.blocking_send(Ok(Bytes::copy_from_slice(&buf[..n]))).is_err() {
                    break;
                }
            }
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
                ) =>
            {
                continue
            }
            Err(e) => {
                let _ = tx.blocking_send(Err(e));
                break;
            }
        }
    }

    tracing::debug!("Serial reader thread exiting");
}

#[async_trait]
impl Transport for SerialTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Serial
    }

    fn describe(&self) -> String {
        format!(
            "serial://{}@{} ({:?})",
            self.config.device, self.config.baud_rate, self.config.mode
        )
    }

    fn is_line_mode(&self) -> bool {
        self.config.mode == SerialMode::Line
    }

    async fn connect(&self) -> TransportResult<Box<dyn TransportReader>> {
        if self.port.lock().map_err(|_| poisoned())?.is_some() {
            return Err(TransportError::AlreadyConnected);
        }

        let config = self.config.clone();
        let timeout = Duration::from_millis(config.timeout_ms);
        let port = match tokio::time::timeout(
            timeout,
            tokio::task::spawn_blocking(move || Self::open(&config)),
        )
        .await
        {
            Ok(joined) => joined.map_err(join_error)??,
            Err(_) => return Err(TransportError::Timeout(timeout)),
        };

        let mut reader_port = port.try_clone()?;
        reader_port.set_timeout(Duration::from_millis(self.config.read_poll_ms.max(1)))?;

        *self.port.lock().map_err(|_| poisoned())? = Some(port);
        self.running.store(true, Ordering::SeqCst);

        let (tx, rx) = mpsc::channel(READ_QUEUE_DEPTH);
        let running = self.running.clone();
        let handle = std::thread::Builder::new()
            .name("serial-reader".to_string())
            .spawn(move || pump(reader_port, running, tx))?;
        *self.reader_thread.lock().map_err(|_| poisoned())? = Some(handle);

        tracing::info!(
            "Serial port {} open at {} baud",
            self.config.device,
            self.config.baud_rate
        );

        Ok(Box::new(SerialReader {
            rx,
            mode: self.config.mode,
        }))
    }

    async fn send(&self, bytes: &[u8]) -> TransportResult<()> {
        let port = self.port.clone();
        let data = bytes.to_vec();

        tokio::task::spawn_blocking(move || -> TransportResult<()> {
            let mut guard = port.lock().map_err(|_| poisoned())?;
            let port = guard.as_mut().ok_or(TransportError::NotConnected)?;
            port.write_all(&data)?;
            port.flush()?;
            Ok(())
        })
        .await
        .map_err(join_error)?
    }

    async fn disconnect(&self) {
        self.running.store(false, Ordering::SeqCst);

        match self.port.lock() {
            Ok(mut port) => {
                if port.take().is_some() {
                    tracing::info!("Serial port {} closed", self.config.device);
                }
            }
            Err(_) => tracing::error!("Serial port lock poisoned on close"),
        }

        let handle = self.reader_thread.lock().ok().and_then(|mut h| h.take());
        if let Some(handle) = handle {
            // Exits within one read poll once `running` is cleared.
            let _ = tokio::task::spawn_blocking(move || handle.join()).await;
        }
    }
}

/// Receive side of the serial transport
pub struct SerialReader {
    rx: mpsc::Receiver<io::Result<Bytes>>,
    mode: SerialMode,
}

#[async_trait]
impl TransportReader for SerialReader {
    async fn read_unit(&mut self) -> TransportResult<Option<Unit>> {
        match self.rx.recv().await {
            Some(Ok(chunk)) => Ok(Some(match self.mode {
                SerialMode::Framed => Unit::Stream(chunk),
                SerialMode::Line => Unit::Text(chunk),
            })),
            Some(Err(e)) => Err(TransportError::Io(e)),
            None => Ok(None),
        }
    }
}
