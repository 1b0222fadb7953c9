//! Configuration module
//!
//! Handles loading and saving RovLink configuration.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::protocol::{DEFAULT_BAUD_RATE, DEFAULT_PORT, MAX_DATAGRAM_SIZE};

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Config file not found: {0}")]
    NotFound(PathBuf),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// General settings
    #[serde(default)]
    pub general: GeneralConfig,

    /// Physical channel settings
    #[serde(default)]
    pub link: LinkConfig,

    /// Acknowledgement and retry policy
    #[serde(default)]
    pub delivery: DeliveryConfig,

    /// Receive dispatcher settings
    #[serde(default)]
    pub dispatch: DispatchConfig,
}

/// General configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Human-readable name of this station
    pub name: String,
    /// Enable verbose logging
    #[serde(default)]
    pub verbose: bool,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            name: hostname::get()
                .map(|h| h.to_string_lossy().to_string())
                .unwrap_or_else(|_| "station".to_string()),
            verbose: false,
        }
    }
}

/// Which physical channel to use
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    #[default]
    Serial,
    Tcp,
    Udp,
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            TransportKind::Serial => "serial",
            TransportKind::Tcp => "tcp",
            TransportKind::Udp => "udp",
        })
    }
}

impl std::str::FromStr for TransportKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "serial" => Ok(TransportKind::Serial),
            "tcp" => Ok(TransportKind::Tcp),
            "udp" => Ok(TransportKind::Udp),
            other => Err(format!("unknown transport '{}'", other)),
        }
    }
}

/// Link configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LinkConfig {
    /// Channel used by `connect`
    #[serde(default)]
    pub transport: TransportKind,
    /// Serial port settings
    #[serde(default)]
    pub serial: SerialConfig,
    /// Network settings
    #[serde(default)]
    pub network: NetworkConfig,
}

/// How bytes on a serial port are interpreted
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SerialMode {
    /// Binary frames with markers and checksum
    #[default]
    Framed,
    /// Plain ASCII commands terminated by `\n`
    Line,
}

/// Serial configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerialConfig {
    /// Device path or port name
    #[serde(default = "default_device")]
    pub device: String,
    /// Baud rate
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    /// I/O timeout when opening and writing, in ms
    #[serde(default = "default_serial_timeout")]
    pub timeout_ms: u64,
    /// Read timeout of the reader thread, bounds how fast it notices shutdown
    #[serde(default = "default_read_poll")]
    pub read_poll_ms: u64,
    /// Framed or line protocol
    #[serde(default)]
    pub mode: SerialMode,
}

fn default_device() -> String {
    if cfg!(windows) {
        "COM3".to_string()
    } else {
        "/dev/ttyUSB0".to_string()
    }
}

fn default_baud_rate() -> u32 {
    DEFAULT_BAUD_RATE
}

fn default_serial_timeout() -> u64 {
    5000
}

fn default_read_poll() -> u64 {
    100
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            device: default_device(),
            baud_rate: default_baud_rate(),
            timeout_ms: default_serial_timeout(),
            read_poll_ms: default_read_poll(),
            mode: SerialMode::default(),
        }
    }
}

/// Message boundaries on a TCP stream
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TcpFraming {
    /// Frames are delimited by their own markers, nothing is added
    #[default]
    Markers,
    /// Each message is preceded by a 4-byte big-endian length
    LengthPrefix,
}

/// Network configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Vehicle address
    #[serde(default = "default_host")]
    pub host: String,
    /// Vehicle port. UDP replies are received on `port + 1`.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Connection timeout in ms
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,
    /// Interface the UDP receive socket binds to
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    /// Message boundaries on TCP
    #[serde(default)]
    pub tcp_framing: TcpFraming,
    /// Receive buffer per datagram
    #[serde(default = "default_max_datagram_size")]
    pub max_datagram_size: usize,
}

fn default_host() -> String {
    "192.168.1.100".to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_connect_timeout() -> u64 {
    10_000
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_max_datagram_size() -> usize {
    MAX_DATAGRAM_SIZE
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            connect_timeout_ms: default_connect_timeout(),
            bind_address: default_bind_address(),
            tcp_framing: TcpFraming::default(),
            max_datagram_size: default_max_datagram_size(),
        }
    }
}

impl NetworkConfig {
    /// Local port receiving UDP replies
    pub fn receive_port(&self) -> Option<u16> {
        self.port.checked_add(1)
    }
}

/// Delivery configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryConfig {
    /// Time without ACK before a message is resent, in ms
    #[serde(default = "default_ack_timeout")]
    pub ack_timeout_ms: u64,
    /// Retransmissions before a message is reported as failed
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Cadence of the retry sweep, in ms
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_ms: u64,
}

fn default_ack_timeout() -> u64 {
    5000
}

fn default_max_retries() -> u32 {
    3
}

fn default_sweep_interval() -> u64 {
    500
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            ack_timeout_ms: default_ack_timeout(),
            max_retries: default_max_retries(),
            sweep_interval_ms: default_sweep_interval(),
        }
    }
}

impl DeliveryConfig {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms.max(1))
    }
}

/// Dispatcher configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// How often the reader checks the running flag while idle, in ms
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
    /// Bounded wait for the reader on disconnect, in ms
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_ms: u64,
    /// Capacity of the event channel
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
}

fn default_poll_interval() -> u64 {
    1000
}

fn default_shutdown_timeout() -> u64 {
    2000
}

fn default_event_buffer() -> usize {
    256
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval(),
            shutdown_timeout_ms: default_shutdown_timeout(),
            event_buffer: default_event_buffer(),
        }
    }
}

impl Config {
    /// Load configuration from a file
    pub fn load(path: &Path) -> ConfigResult<Self> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }

        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Load configuration from the default location
    pub fn load_default() -> ConfigResult<Self> {
        let config_paths = [
            dirs::config_dir().map(|p| p.join("rovlink/config.toml")),
            Some(PathBuf::from("./rovlink.toml")),
            Some(PathBuf::from("./config.toml")),
        ];

        for path in config_paths.iter().flatten() {
            if path.exists() {
                return Self::load(path);
            }
        }

        Ok(Self::default())
    }

    /// Save configuration to a file
    pub fn save(&self, path: &Path) -> ConfigResult<()> {
        let contents = toml::to_string_pretty(self)?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        std::fs::write(path, contents)?;
        Ok(())
    }
}

/// Generate a sample configuration file
pub fn generate_sample_config() -> ConfigResult<String> {
    let config = Config {
        general: GeneralConfig {
            name: "Topside Station".to_string(),
            verbose: false,
        },
        link: LinkConfig {
            transport: TransportKind::Udp,
            ..Default::default()
        },
        ..Default::default()
    };

    Ok(toml::to_string_pretty(&config)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.link.network.port, DEFAULT_PORT);
        assert_eq!(config.link.serial.baud_rate, 9600);
        assert_eq!(config.delivery.ack_timeout_ms, 5000);
        assert_eq!(config.delivery.max_retries, 3);
        assert_eq!(config.dispatch.shutdown_timeout_ms, 2000);
        assert_eq!(config.link.network.tcp_framing, TcpFraming::Markers);
    }

    #[test]
    fn test_save_and_load() {
        let mut config = Config::default();
        config.link.transport = TransportKind::Tcp;
        config.link.network.port = 9000;
        let file = NamedTempFile::new().unwrap();

        config.save(file.path()).unwrap();

        let loaded = Config::load(file.path()).unwrap();
        assert_eq!(loaded.link.transport, TransportKind::Tcp);
        assert_eq!(loaded.link.network.port, 9000);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let config: Config = toml::from_str(
            r#"
            [link]
            transport = "serial"

            [link.serial]
            device = "/dev/ttyACM0"
            mode = "line"
            "#,
        )
        .unwrap();

        assert_eq!(config.link.serial.device, "/dev/ttyACM0");
        assert_eq!(config.link.serial.mode, SerialMode::Line);
        assert_eq!(config.link.serial.baud_rate, DEFAULT_BAUD_RATE);
        assert_eq!(config.delivery.max_retries, 3);
    }

    #[test]
    fn test_missing_file() {
        let err = Config::load(Path::new("/nonexistent/rovlink.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::NotFound(_)));
    }

    #[test]
    fn test_sample_config() {
        let sample = generate_sample_config().unwrap();
        let parsed: Config = toml::from_str(&sample).unwrap();
        assert_eq!(parsed.general.name, "Topside Station");
        assert_eq!(parsed.link.transport, TransportKind::Udp);
    }

    #[test]
    fn test_transport_kind_from_str() {
        assert_eq!("UDP".parse::<TransportKind>().unwrap(), TransportKind::Udp);
        assert!("carrier-pigeon".parse::<TransportKind>().is_err());
    }

    #[test]
    fn test_receive_port() {
        let network = NetworkConfig::default();
        assert_eq!(network.receive_port(), Some(DEFAULT_PORT + 1));

        let network = NetworkConfig {
            port: u16::MAX,
            ..Default::default()
        };
        assert_eq!(network.receive_port(), None);
    }
}
