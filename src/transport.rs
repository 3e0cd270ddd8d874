//! The public BLE-MIDI transport.
//!
//! [`BleMidiTransport`] is an explicitly constructed service: [`start`] wires
//! a btleplug radio driver, a JSON-backed device registry and a session task
//! together, and [`shutdown`] tears them down again.  Everything that mutates
//! connection state runs on the session task, one input at a time:
//!
//! ```text
//!  connect / disconnect / send / forget ──┐
//!                                         ▼
//!                       ┌────────── session task ──────────┐
//!  radio driver ──RadioEvent──▶  ConnectionMachine  ──RadioRequest──▶ radio driver
//!                       └────────┬──────────────┬──────────┘
//!                                ▼              ▼
//!                      TransportEvent     TransportStatus
//!                      (mpsc, bounded)    (watch snapshot)
//! ```
//!
//! [`start`]: BleMidiTransport::start
//! [`shutdown`]: BleMidiTransport::shutdown

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, Result};
use log::{debug, error, info, warn};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::machine::{ConnectionMachine, Effect};
use crate::radio::{default_adapter, radio_channel, spawn_driver, RadioLink, RadioTimeouts};
use crate::registry::{DeviceRegistry, JsonFileStore, KeyValueStore};
use crate::types::{
    ConnectionState, MidiEventBytes, PeripheralId, PeripheralInfo, TransportEvent, TransportStatus,
};

// ── TransportConfig ───────────────────────────────────────────────────────────

/// Configuration for [`BleMidiTransport`].
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// JSON file that remembers the bound peripheral.
    /// Default: [`default_store_path`].
    pub store_path: PathBuf,
    /// Hard timeout on a single connect attempt.  Default: `10`.
    pub connect_timeout_secs: u64,
    /// Hard timeout on GATT service discovery.  Default: `15`.
    pub discovery_timeout_secs: u64,
    /// While scanning, connect automatically as soon as the bound peripheral
    /// advertises.  Default: `true`.
    pub auto_reconnect: bool,
    /// Capacity of the [`TransportEvent`] channel.  Default: `256`.
    pub event_capacity: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            store_path: default_store_path(),
            connect_timeout_secs: 10,
            discovery_timeout_secs: 15,
            auto_reconnect: true,
            event_capacity: 256,
        }
    }
}

/// `$BLE_MIDI_STORE` if set, else `$HOME/.config/blemidi-rs/devices.json`,
/// else `./blemidi-devices.json`.
pub fn default_store_path() -> PathBuf {
    if let Some(path) = std::env::var_os("BLE_MIDI_STORE").filter(|p| !p.is_empty()) {
        return PathBuf::from(path);
    }
    match std::env::var_os("HOME").filter(|h| !h.is_empty()) {
        Some(home) => PathBuf::from(home)
            .join(".config")
            .join("blemidi-rs")
            .join("devices.json"),
        None => PathBuf::from("blemidi-devices.json"),
    }
}

// ── BleMidiTransport ──────────────────────────────────────────────────────────

enum Command {
    Connect(PeripheralId),
    Disconnect,
    Send(MidiEventBytes),
    Forget,
    Shutdown,
}

/// Handle to a running BLE-MIDI session.
///
/// All control calls are fire-and-forget: they never fail and never block.
/// Their effect shows up in [`status`](Self::status) and on the event
/// channel returned alongside the handle.
pub struct BleMidiTransport {
    commands: mpsc::UnboundedSender<Command>,
    status: watch::Receiver<TransportStatus>,
    session: JoinHandle<Result<()>>,
    driver: Option<JoinHandle<()>>,
}

impl BleMidiTransport {
    /// Open the registry, attach to the first Bluetooth adapter and start the
    /// session.
    ///
    /// Returns the application event receiver and the transport handle.
    pub async fn start(config: TransportConfig) -> Result<(mpsc::Receiver<TransportEvent>, Self)> {
        let store = JsonFileStore::open(&config.store_path)?;
        info!("Device registry: {}", store.path().display());

        let adapter = default_adapter().await?;
        let (link, endpoint) = radio_channel();
        let timeouts = RadioTimeouts {
            connect: Duration::from_secs(config.connect_timeout_secs),
            discovery: Duration::from_secs(config.discovery_timeout_secs),
        };
        let driver = spawn_driver(adapter, endpoint, timeouts).await?;

        let (rx, mut transport) = Self::with_radio(&config, Box::new(store), link);
        transport.driver = Some(driver);
        Ok((rx, transport))
    }

    /// Start a session over an arbitrary radio link and store.
    ///
    /// Must be called from within a tokio runtime.
    pub fn with_radio(
        config: &TransportConfig,
        store: Box<dyn KeyValueStore>,
        link: RadioLink,
    ) -> (mpsc::Receiver<TransportEvent>, Self) {
        let machine = ConnectionMachine::new(DeviceRegistry::new(store), config.auto_reconnect);
        let (event_tx, event_rx) = mpsc::channel(config.event_capacity.max(1));
        let (status_tx, status_rx) = watch::channel(machine.status());
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();

        let session = tokio::spawn(run_session(machine, link, cmd_rx, event_tx, status_tx));

        (
            event_rx,
            Self {
                commands: cmd_tx,
                status: status_rx,
                session,
                driver: None,
            },
        )
    }

    // ── Control ──────────────────────────────────────────────────────────────

    /// Connect to a discovered peripheral.  Ignored unless disconnected or
    /// scanning.
    pub fn connect(&self, id: &PeripheralId) {
        self.command(Command::Connect(id.clone()));
    }

    /// Disconnect the active peripheral.  The session returns to scanning and
    /// does not reconnect on its own until the next [`connect`](Self::connect).
    pub fn disconnect(&self) {
        self.command(Command::Disconnect);
    }

    /// Send one MIDI message.  Silently dropped unless the link is ready.
    pub fn send(&self, event: impl Into<MidiEventBytes>) {
        self.command(Command::Send(event.into()));
    }

    /// Forget the bound peripheral so the next session starts by scanning.
    pub fn forget_device(&self) {
        self.command(Command::Forget);
    }

    fn command(&self, command: Command) {
        if self.commands.send(command).is_err() {
            debug!("Session has ended, dropping command");
        }
    }

    // ── Observation ──────────────────────────────────────────────────────────

    /// Latest consistent status snapshot.
    pub fn status(&self) -> TransportStatus {
        self.status.borrow().clone()
    }

    /// Receiver that wakes on every status change.
    pub fn subscribe_status(&self) -> watch::Receiver<TransportStatus> {
        self.status.clone()
    }

    pub fn scan_status(&self) -> bool {
        self.status.borrow().scanning
    }

    pub fn connection_status(&self) -> ConnectionState {
        self.status.borrow().connection
    }

    /// Peripherals seen in the current scan, one entry per id.
    pub fn discovered_peripherals(&self) -> Vec<PeripheralInfo> {
        self.status.borrow().discovered.clone()
    }

    // ── Teardown ─────────────────────────────────────────────────────────────

    /// Stop scanning, disconnect, stop the radio driver and wait for the
    /// session to finish.
    ///
    /// Returns the error that ended the session early, if any.
    pub async fn shutdown(self) -> Result<()> {
        let _ = self.commands.send(Command::Shutdown);
        let result = self
            .session
            .await
            .map_err(|e| anyhow!("session task failed: {e}"))?;
        if let Some(driver) = self.driver {
            driver.await.ok();
        }
        result
    }
}

// ── Session task ──────────────────────────────────────────────────────────────

async fn run_session(
    mut machine: ConnectionMachine,
    mut link: RadioLink,
    mut commands: mpsc::UnboundedReceiver<Command>,
    events: mpsc::Sender<TransportEvent>,
    status: watch::Sender<TransportStatus>,
) -> Result<()> {
    debug!("Session started");
    loop {
        let effects = tokio::select! {
            command = commands.recv() => match command {
                Some(Command::Connect(id)) => machine.connect(&id),
                Some(Command::Disconnect) => machine.disconnect(),
                Some(Command::Send(event)) => machine.send(&event),
                Some(Command::Forget) => {
                    machine.forget();
                    Vec::new()
                }
                Some(Command::Shutdown) | None => {
                    info!("Session shutting down");
                    let effects = machine.shutdown();
                    apply(effects, &link, &events).await;
                    publish(&status, machine.status());
                    return Ok(());
                }
            },
            event = link.events.recv() => match event {
                Some(event) => match machine.handle(event) {
                    Ok(effects) => effects,
                    Err(e) => {
                        error!("{e:#}");
                        publish(&status, machine.status());
                        return Err(e);
                    }
                },
                None => {
                    warn!("Radio driver stopped unexpectedly");
                    let effects = machine.shutdown();
                    apply(effects, &link, &events).await;
                    publish(&status, machine.status());
                    return Err(anyhow!("radio driver stopped"));
                }
            },
        };
        apply(effects, &link, &events).await;
        publish(&status, machine.status());
    }
}

async fn apply(effects: Vec<Effect>, link: &RadioLink, events: &mpsc::Sender<TransportEvent>) {
    for effect in effects {
        match effect {
            Effect::Radio(request) => {
                if link.requests.send(request).is_err() {
                    debug!("Radio driver gone, dropping request");
                }
            }
            Effect::Emit(event) => {
                // The application may have dropped its receiver.
                let _ = events.send(event).await;
            }
        }
    }
}

fn publish(status: &watch::Sender<TransportStatus>, next: TransportStatus) {
    status.send_if_modified(|current| {
        if *current == next {
            return false;
        }
        *current = next;
        true
    });
}
