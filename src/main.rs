//! RovLink - Operator station side of the vehicle link
//!
//! Opens the configured channel, sends commands and prints what the
//! vehicle reports back.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use rovlink::config::{self, Config, TransportKind};
use rovlink::link::DispatcherExit;
use rovlink::protocol::{self, Command, LineCommand, Payload};
use rovlink::transport;
use rovlink::{Inbound, Link, LinkEvent};

/// RovLink - Reliable command link to a remote vehicle
#[derive(Parser)]
#[command(name = "rovlink")]
#[command(author = "RovLink Contributors")]
#[command(version = "0.1.0")]
#[command(about = "Send commands to a remote vehicle and receive telemetry", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Overrides for the configured channel
#[derive(clap::Args, Debug, Default)]
struct LinkArgs {
    /// Transport to use (serial, tcp, udp)
    #[arg(short, long)]
    transport: Option<TransportKind>,

    /// Serial device
    #[arg(short, long)]
    device: Option<String>,

    /// Serial baud rate
    #[arg(short, long)]
    baud: Option<u32>,

    /// Vehicle host name or address
    #[arg(long)]
    host: Option<String>,

    /// Vehicle port
    #[arg(short, long)]
    port: Option<u16>,
}

impl LinkArgs {
    fn apply(self, config: &mut Config) {
        if let Some(transport) = self.transport {
            config.link.transport = transport;
        }
        if let Some(device) = self.device {
            config.link.serial.device = device;
        }
        if let Some(baud) = self.baud {
            config.link.serial.baud_rate = baud;
        }
        if let Some(host) = self.host {
            config.link.network.host = host;
        }
        if let Some(port) = self.port {
            config.link.network.port = port;
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// List serial ports
    Ports,

    /// Open the link and forward commands typed on stdin
    Connect {
        #[command(flatten)]
        link: LinkArgs,
    },

    /// Send a single command and wait for its delivery
    Send {
        /// Command tag, e.g. PING or EMERGENCY_STOP
        command: String,

        /// Require an acknowledgement
        #[arg(short, long)]
        ack: bool,

        /// Command arguments as a JSON object
        #[arg(long)]
        data: Option<String>,

        #[command(flatten)]
        link: LinkArgs,
    },

    /// Show current configuration
    Config {
        /// Generate sample configuration
        #[arg(long)]
        generate: bool,

        /// Output path for generated config
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Show protocol information
    Info,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let config = if let Some(config_path) = &cli.config {
        Config::load(config_path)?
    } else {
        Config::load_default().unwrap_or_default()
    };

    // Initialize logging
    let filter = if cli.verbose || config.general.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    match cli.command {
        Commands::Ports => {
            list_ports()?;
        }
        Commands::Connect { link } => {
            let mut config = config;
            link.apply(&mut config);
            run_connect(config).await?;
        }
        Commands::Send {
            command,
            ack,
            data,
            link,
        } => {
            let mut config = config;
            link.apply(&mut config);
            let data = parse_payload(data.as_deref())?;
            run_send(config, command, data, ack).await?;
        }
        Commands::Config { generate, output } => {
            if generate {
                let sample = config::generate_sample_config()?;
                if let Some(path) = output {
                    std::fs::write(&path, &sample)?;
                    println!("Configuration written to: {}", path.display());
                } else {
                    println!("{}", sample);
                }
            } else {
                println!("{}", toml::to_string_pretty(&config)?);
            }
        }
        Commands::Info => {
            print_info(&config);
        }
    }

    Ok(())
}

/// Print the serial ports found on this machine
fn list_ports() -> anyhow::Result<()> {
    let ports = transport::list_ports()?;

    if ports.is_empty() {
        println!("No serial ports found.");
        return Ok(());
    }

    println!("{:<20} {:<30} HARDWARE ID", "DEVICE", "DESCRIPTION");
    for port in ports {
        println!(
            "{:<20} {:<30} {}",
            port.device, port.description, port.hardware_id
        );
    }

    Ok(())
}

/// Parse `--data` into a payload, defaulting to an empty object
fn parse_payload(data: Option<&str>) -> anyhow::Result<Payload> {
    match data {
        Some(text) => serde_json::from_str(text).context("--data must be a JSON object"),
        None => Ok(Payload::new()),
    }
}

/// Parse one stdin line of the form `TAG [ack] [{json}]`
fn parse_command_line(line: &str) -> anyhow::Result<(Command, Payload, bool)> {
    let line = line.trim();
    let (tag, rest) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
    if tag.is_empty() {
        anyhow::bail!("empty command");
    }

    let mut rest = rest.trim_start();
    let mut require_ack = false;
    if let Some(after) = rest.strip_prefix("ack") {
        if after.is_empty() || after.starts_with(char::is_whitespace) {
            require_ack = true;
            rest = after.trim_start();
        }
    }

    let data = if rest.is_empty() {
        Payload::new()
    } else {
        parse_payload(Some(rest))?
    };

    Ok((Command::from(tag.to_ascii_uppercase()), data, require_ack))
}

/// Print one link event
fn report(event: &LinkEvent) {
    match event {
        LinkEvent::StateChanged(state) => {
            tracing::info!("Link state: {:?}", state);
        }
        LinkEvent::Received(Inbound::Structured(message)) => {
            println!(
                "< {} #{} {}",
                message.command,
                message.id,
                serde_json::Value::Object(message.data.clone())
            );
        }
        LinkEvent::Received(Inbound::Raw(text)) => {
            println!("< {}", text);
        }
        LinkEvent::Received(Inbound::Invalid(e)) => {
            tracing::debug!("Dropped frame: {}", e);
        }
        LinkEvent::Delivered { id } => {
            println!("  message {} delivered", id);
        }
        LinkEvent::RetryAttempted { id, retry_count } => {
            println!("  message {} resent ({})", id, retry_count);
        }
        LinkEvent::DeliveryFailed { id, command } => {
            println!("! message {} ({}) was not acknowledged", id, command);
        }
        LinkEvent::DispatcherExited(exit) => {
            tracing::info!("Receiver stopped: {:?}", exit);
        }
    }
}

/// Open the link and run until Ctrl+C or the link drops
async fn run_connect(config: Config) -> anyhow::Result<()> {
    let mut link = Link::new(&config);
    let mut event_rx = link
        .take_event_receiver()
        .context("event receiver already taken")?;

    println!("Connecting to {}...", link.describe());
    if !link.connect().await {
        anyhow::bail!("could not connect to {}", link.describe());
    }

    println!("\n========================================");
    println!("  RovLink Connected");
    println!("========================================");
    println!("  Station: {}", config.general.name);
    println!("  Link: {}", link.describe());
    if link.is_line_mode() {
        println!("  Mode: line protocol");
    }
    println!("========================================");
    if link.is_line_mode() {
        println!("\nType commands to send them verbatim.");
    } else {
        println!("\nType commands as: TAG [ack] [{{json}}]");
    }
    println!("Press Ctrl+C to disconnect.\n");

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    let mut sweep = tokio::time::interval(link.sweep_interval());
    sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    // Main event loop
    loop {
        tokio::select! {
            Some(event) = event_rx.recv() => {
                report(&event);
                if let LinkEvent::DispatcherExited(exit) = event {
                    if exit != DispatcherExit::Stopped {
                        println!("Link lost.");
                        break;
                    }
                }
            }
            _ = sweep.tick() => {
                link.sweep().await;
            }
            line = stdin.next_line(), if stdin_open => {
                match line {
                    Ok(Some(line)) if line.trim().is_empty() => {}
                    Ok(Some(line)) => {
                        if link.is_line_mode() {
                            link.send_line(&LineCommand::Custom(line)).await;
                        } else {
                            match parse_command_line(&line) {
                                Ok((command, data, require_ack)) => {
                                    link.send_command(command, data, require_ack).await;
                                }
                                Err(e) => println!("! {}", e),
                            }
                        }
                    }
                    Ok(None) => stdin_open = false,
                    Err(e) => {
                        tracing::warn!("stdin: {}", e);
                        stdin_open = false;
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                println!("\nDisconnecting...");
                break;
            }
        }
    }

    link.disconnect().await;
    if link.pending_count().await > 0 {
        tracing::warn!(
            "{} messages were still awaiting acknowledgement",
            link.pending_count().await
        );
    }
    tracing::info!("Link closed");

    Ok(())
}

/// Send one command; with `require_ack`, wait until it is delivered or fails
async fn run_send(
    config: Config,
    tag: String,
    data: Payload,
    require_ack: bool,
) -> anyhow::Result<()> {
    let mut link = Link::new(&config);
    let mut event_rx = link
        .take_event_receiver()
        .context("event receiver already taken")?;

    if !link.connect().await {
        anyhow::bail!("could not connect to {}", link.describe());
    }

    if link.is_line_mode() {
        let sent = link.send_line(&LineCommand::Custom(tag)).await;
        // Give the controller a moment to answer.
        tokio::time::sleep(Duration::from_millis(500)).await;
        while let Ok(event) = event_rx.try_recv() {
            report(&event);
        }
        link.disconnect().await;
        anyhow::ensure!(sent, "send failed");
        return Ok(());
    }

    let command = Command::from(tag.to_ascii_uppercase());
    let id = match link.try_send_command(command, data, require_ack).await {
        Ok(id) => id,
        Err(e) => {
            link.disconnect().await;
            return Err(e.into());
        }
    };
    println!("> sent message {}", id);

    let mut delivered = !require_ack;
    if require_ack {
        let mut sweep = tokio::time::interval(link.sweep_interval());
        loop {
            tokio::select! {
                Some(event) = event_rx.recv() => {
                    report(&event);
                    match event {
                        LinkEvent::Delivered { id: acked } if acked == id => {
                            delivered = true;
                            break;
                        }
                        LinkEvent::DeliveryFailed { id: failed, .. } if failed == id => break,
                        LinkEvent::DispatcherExited(_) => break,
                        _ => {}
                    }
                }
                _ = sweep.tick() => {
                    link.sweep().await;
                }
                _ = tokio::signal::ctrl_c() => break,
            }
        }
    }

    link.disconnect().await;
    anyhow::ensure!(delivered, "message {} was not acknowledged", id);
    Ok(())
}

/// Print protocol constants and the effective link settings
fn print_info(config: &Config) {
    println!("RovLink Protocol Information");
    println!("============================\n");

    println!("Frame: AA 55 | length u32 LE | checksum u32 LE | JSON | 55 AA");
    println!("Frame overhead: {} bytes", protocol::FRAME_OVERHEAD);
    println!("Max payload: {} bytes", protocol::MAX_PAYLOAD_SIZE);
    println!("Max datagram: {} bytes", protocol::MAX_DATAGRAM_SIZE);
    println!("Default port: {}", protocol::DEFAULT_PORT);
    println!("Default baud rate: {}", protocol::DEFAULT_BAUD_RATE);

    println!("\nConfigured link: {}", config.link.transport);
    println!("  Serial: {} @ {}", config.link.serial.device, config.link.serial.baud_rate);
    println!(
        "  Network: {}:{} (UDP replies on {})",
        config.link.network.host,
        config.link.network.port,
        config
            .link
            .network
            .receive_port()
            .map(|p| p.to_string())
            .unwrap_or_else(|| "n/a".to_string())
    );
    println!(
        "  ACK timeout: {} ms, {} retries",
        config.delivery.ack_timeout_ms, config.delivery.max_retries
    );
}
