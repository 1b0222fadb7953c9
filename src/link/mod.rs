//! Link module - One connection to the vehicle
//!
//! A [`Link`] ties a transport to the frame codec and the delivery manager.
//! Sending happens on the caller's task. Receiving happens on a background
//! dispatcher that reports everything through the event channel.
//!
//! Retransmission is driven from outside: call [`Link::sweep`] every
//! `delivery.sweep_interval_ms`.

mod dispatcher;

pub use dispatcher::{classify_packet, DispatcherExit};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::config::{Config, DeliveryConfig, DispatchConfig, TransportKind};
use crate::delivery::{DeliveryManager, SweepAction};
use crate::protocol::{
    CodecError, Command, DecodeError, FrameCodec, LineCommand, Message, MotorSet, Payload,
};
use crate::transport::{self, Transport, TransportError};
use dispatcher::Dispatcher;

/// Link errors
#[derive(Error, Debug)]
pub enum LinkError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Already connected")]
    AlreadyConnected,

    #[error("Not connected")]
    NotConnected,

    #[error("Channel is in {0} mode")]
    WrongMode(&'static str),
}

pub type LinkResult<T> = Result<T, LinkError>;

/// Link state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Something that arrived from the vehicle
#[derive(Debug, Clone)]
pub enum Inbound {
    /// A valid frame
    Structured(Message),
    /// Text that is not a frame, e.g. a line protocol reply
    Raw(String),
    /// A frame that failed validation and was dropped
    Invalid(DecodeError),
}

/// Events emitted by the link
#[derive(Debug, Clone)]
pub enum LinkEvent {
    StateChanged(ConnectionState),
    Received(Inbound),
    /// The vehicle acknowledged message `id`
    Delivered { id: u16 },
    /// Message `id` was sent again
    RetryAttempted { id: u16, retry_count: u32 },
    /// Message `id` ran out of retries
    DeliveryFailed { id: u16, command: Command },
    DispatcherExited(DispatcherExit),
}

/// Connection to the vehicle
pub struct Link {
    transport: Arc<dyn Transport>,
    codec: Arc<FrameCodec>,
    delivery: Arc<DeliveryManager>,
    dispatch: DispatchConfig,
    sweep_interval: Duration,
    state: Arc<RwLock<ConnectionState>>,
    running: Arc<AtomicBool>,
    reader: Mutex<Option<JoinHandle<DispatcherExit>>>,
    events: EventSink,
    event_rx: Option<mpsc::Receiver<LinkEvent>>,
}

/// Sending side of the event channel.
///
/// Nothing is queued until a consumer has taken the receiver. Protocol
/// events never wait for the consumer; only received data does.
#[derive(Clone)]
pub(crate) struct EventSink {
    tx: mpsc::Sender<LinkEvent>,
    attached: Arc<AtomicBool>,
}

impl EventSink {
    fn new(tx: mpsc::Sender<LinkEvent>) -> Self {
        Self {
            tx,
            attached: Arc::new(AtomicBool::new(false)),
        }
    }

    fn attach(&self) {
        self.attached.store(true, Ordering::SeqCst);
    }

    fn is_attached(&self) -> bool {
        self.attached.load(Ordering::SeqCst)
    }

    /// Queue a state or delivery event, dropping it if the channel is full
    pub(crate) fn notify(&self, event: LinkEvent) {
        if !self.is_attached() {
            return;
        }

        match self.tx.try_send(event) {
            Ok(()) | Err(TrySendError::Closed(_)) => {}
            Err(TrySendError::Full(event)) => {
                tracing::warn!("Event channel full, dropping {:?}", event);
            }
        }
    }

    /// Queue received data, waiting for room in the channel
    pub(crate) async fn deliver(&self, inbound: Inbound) {
        if !self.is_attached() {
            return;
        }

        // A dropped receiver means nobody is listening any more.
        let _ = self.tx.send(LinkEvent::Received(inbound)).await;
    }
}

async fn update_state(
    state: &RwLock<ConnectionState>,
    events: &EventSink,
    new_state: ConnectionState,
) {
    let changed = {
        let mut state = state.write().await;
        let changed = *state != new_state;
        *state = new_state;
        changed
    };

    if changed {
        events.notify(LinkEvent::StateChanged(new_state));
    }
}

impl Link {
    /// Create a link over the transport selected in `config`
    pub fn new(config: &Config) -> Self {
        Self::with_transport(
            transport::from_config(&config.link),
            &config.delivery,
            &config.dispatch,
        )
    }

    /// Create a link over an existing transport
    pub fn with_transport(
        transport: Arc<dyn Transport>,
        delivery: &DeliveryConfig,
        dispatch: &DispatchConfig,
    ) -> Self {
        let (event_tx, event_rx) = mpsc::channel(dispatch.event_buffer.max(1));

        Self {
            transport,
            codec: Arc::new(FrameCodec::new()),
            delivery: Arc::new(DeliveryManager::from_config(delivery)),
            dispatch: dispatch.clone(),
            sweep_interval: delivery.sweep_interval(),
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            running: Arc::new(AtomicBool::new(false)),
            reader: Mutex::new(None),
            events: EventSink::new(event_tx),
            event_rx: Some(event_rx),
        }
    }

    /// Take the event receiver (can only be called once).
    ///
    /// Events are only queued from this point on. The channel is bounded:
    /// while it is full, received data waits for the consumer and state
    /// and delivery events are dropped. ACK handling never waits.
    pub fn take_event_receiver(&mut self) -> Option<mpsc::Receiver<LinkEvent>> {
        let rx = self.event_rx.take()?;
        self.events.attach();
        Some(rx)
    }

    /// Hand every inbound item to `handler` on a background task.
    ///
    /// Uses up the event receiver; returns false if it was already taken.
    /// Delivery and state events are discarded.
    pub fn set_data_handler<F>(&mut self, mut handler: F) -> bool
    where
        F: FnMut(Inbound) + Send + 'static,
    {
        let Some(mut rx) = self.take_event_receiver() else {
            return false;
        };

        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if let LinkEvent::Received(inbound) = event {
                    handler(inbound);
                }
            }
        });
        true
    }

    pub fn kind(&self) -> TransportKind {
        self.transport.kind()
    }

    pub fn describe(&self) -> String {
        self.transport.describe()
    }

    pub fn is_line_mode(&self) -> bool {
        self.transport.is_line_mode()
    }

    pub async fn state(&self) -> ConnectionState {
        *self.state.read().await
    }

    pub async fn is_connected(&self) -> bool {
        self.state().await == ConnectionState::Connected
    }

    fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.dispatch.shutdown_timeout_ms)
    }

    /// Open the transport and start the receive dispatcher
    pub async fn try_connect(&self) -> LinkResult<()> {
        {
            let mut state = self.state.write().await;
            if *state != ConnectionState::Disconnected {
                return Err(LinkError::AlreadyConnected);
            }
            *state = ConnectionState::Connecting;
        }
        self.events
            .notify(LinkEvent::StateChanged(ConnectionState::Connecting));

        // A dispatcher that stopped on its own leaves the transport open.
        if let Some(stale) = self.reader.lock().await.take() {
            self.running.store(false, Ordering::SeqCst);
            let _ = tokio::time::timeout(self.shutdown_timeout(), stale).await;
            self.transport.disconnect().await;
        }

        tracing::info!("Connecting to {}", self.transport.describe());

        let reader = match self.transport.connect().await {
            Ok(reader) => reader,
            Err(e) => {
                update_state(&self.state, &self.events, ConnectionState::Disconnected).await;
                return Err(e.into());
            }
        };

        // Connected before the dispatcher can observe a closed peer.
        update_state(&self.state, &self.events, ConnectionState::Connected).await;
        self.running.store(true, Ordering::SeqCst);

        let dispatcher = Dispatcher::new(
            reader,
            self.transport.clone(),
            self.codec.clone(),
            self.delivery.clone(),
            self.events.clone(),
            self.running.clone(),
            Duration::from_millis(self.dispatch.poll_interval_ms.max(1)),
        );

        let state = self.state.clone();
        let events = self.events.clone();
        let handle = tokio::spawn(async move {
            let exit = dispatcher.run().await;
            if exit != DispatcherExit::Stopped {
                update_state(&state, &events, ConnectionState::Disconnected).await;
            }
            events.notify(LinkEvent::DispatcherExited(exit.clone()));
            exit
        });
        *self.reader.lock().await = Some(handle);

        tracing::info!("Connected to {}", self.transport.describe());
        Ok(())
    }

    /// Connect, logging any failure. Returns whether the link is now up.
    pub async fn connect(&self) -> bool {
        match self.try_connect().await {
            Ok(()) => true,
            Err(e) => {
                tracing::error!("Failed to connect to {}: {}", self.transport.describe(), e);
                false
            }
        }
    }

    /// Stop the dispatcher and close the transport. Safe to call repeatedly.
    ///
    /// Pending messages are kept; use [`Link::clear_pending`] to drop them.
    pub async fn disconnect(&self) {
        let handle = self.reader.lock().await.take();
        if handle.is_none() && self.state().await == ConnectionState::Disconnected {
            return;
        }

        self.running.store(false, Ordering::SeqCst);

        if let Some(handle) = handle {
            let abort = handle.abort_handle();
            match tokio::time::timeout(self.shutdown_timeout(), handle).await {
                Ok(Ok(exit)) => tracing::debug!("Dispatcher finished: {:?}", exit),
                Ok(Err(e)) => tracing::warn!("Dispatcher task failed: {}", e),
                Err(_) => {
                    tracing::warn!(
                        "Dispatcher did not stop within {:?}, aborting",
                        self.shutdown_timeout()
                    );
                    abort.abort();
                }
            }
        }

        self.transport.disconnect().await;
        update_state(&self.state, &self.events, ConnectionState::Disconnected).await;

        tracing::info!("Disconnected from {}", self.transport.describe());
    }

    async fn ensure_connected(&self) -> LinkResult<()> {
        if self.is_connected().await {
            Ok(())
        } else {
            Err(LinkError::NotConnected)
        }
    }

    /// Frame and send a command, returning its message id
    pub async fn try_send_command(
        &self,
        command: Command,
        data: Payload,
        require_ack: bool,
    ) -> LinkResult<u16> {
        self.ensure_connected().await?;
        if self.transport.is_line_mode() {
            return Err(LinkError::WrongMode("line"));
        }

        let in_use = self.delivery.pending_ids().await;
        let frame =
            self.codec
                .encode_avoiding(command, data, require_ack, |id| in_use.contains(&id))?;

        // Tracked before the write so a fast ACK always finds its entry.
        let tracked = self.delivery.submit(&frame, Instant::now()).await;
        if let Err(e) = self.transport.send(&frame.bytes).await {
            if tracked {
                self.delivery.cancel(frame.id()).await;
            }
            return Err(e.into());
        }

        Ok(frame.id())
    }

    /// Send a command, logging any failure. Returns whether it was written.
    pub async fn send_command(
        &self,
        command: impl Into<Command>,
        data: Payload,
        require_ack: bool,
    ) -> bool {
        let command = command.into();
        let label = command.to_string();

        match self.try_send_command(command, data, require_ack).await {
            Ok(id) => {
                tracing::debug!("Sent {} as message {}", label, id);
                true
            }
            Err(e) => {
                tracing::warn!("Could not send {}: {}", label, e);
                false
            }
        }
    }

    /// Write bytes to the transport as they are
    pub async fn send_raw(&self, bytes: &[u8]) -> bool {
        if let Err(e) = self.ensure_connected().await {
            tracing::warn!("Could not send raw data: {}", e);
            return false;
        }

        match self.transport.send(bytes).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!("Could not send raw data: {}", e);
                false
            }
        }
    }

    /// Send one line protocol command. Only valid on a line-mode channel.
    pub async fn send_line(&self, command: &LineCommand) -> bool {
        if !self.transport.is_line_mode() {
            tracing::warn!("Could not send {}: {}", command, LinkError::WrongMode("framed"));
            return false;
        }
        self.send_raw(command.to_line().as_bytes()).await
    }

    /// Set all six thrusters. Values are clamped to the PWM range.
    pub async fn send_motor_command(&self, motors: MotorSet) -> bool {
        let motors = motors.clamped();
        if self.transport.is_line_mode() {
            self.send_line(&LineCommand::Motor(motors)).await
        } else {
            self.send_command(Command::MotorCommand, motors.to_payload(), true)
                .await
        }
    }

    pub async fn request_telemetry(&self) -> bool {
        if self.transport.is_line_mode() {
            self.send_line(&LineCommand::GetTelemetry).await
        } else {
            self.send_command(Command::TelemetryRequest, Payload::new(), false)
                .await
        }
    }

    pub async fn emergency_stop(&self) -> bool {
        tracing::warn!("Sending emergency stop");
        if self.transport.is_line_mode() {
            self.send_line(&LineCommand::EmergencyStop).await
        } else {
            self.send_command(Command::EmergencyStop, Payload::new(), true)
                .await
        }
    }

    pub async fn ping(&self) -> bool {
        if self.transport.is_line_mode() {
            self.send_line(&LineCommand::Ping).await
        } else {
            self.send_command(Command::Ping, Payload::new(), false).await
        }
    }

    /// Retransmit or expire overdue messages
    pub async fn sweep(&self) -> Vec<SweepAction> {
        self.sweep_at(Instant::now()).await
    }

    /// [`Link::sweep`] with an explicit clock
    pub async fn sweep_at(&self, now: Instant) -> Vec<SweepAction> {
        let actions = self.delivery.sweep(now).await;

        for action in &actions {
            let event = match action {
                SweepAction::Retry {
                    id,
                    retry_count,
                    frame,
                } => {
                    if let Err(e) = self.transport.send(frame).await {
                        tracing::warn!("Retransmission of message {} failed: {}", id, e);
                    }
                    LinkEvent::RetryAttempted {
                        id: *id,
                        retry_count: *retry_count,
                    }
                }
                SweepAction::Failed { id, command } => LinkEvent::DeliveryFailed {
                    id: *id,
                    command: command.clone(),
                },
            };
            self.events.notify(event);
        }

        actions
    }

    /// Interval at which [`Link::sweep`] should run
    pub fn sweep_interval(&self) -> Duration {
        self.sweep_interval
    }

    pub async fn pending_count(&self) -> usize {
        self.delivery.pending_count().await
    }

    /// Forget every message awaiting an ACK
    pub async fn clear_pending(&self) {
        self.delivery.clear_all().await;
    }
}
