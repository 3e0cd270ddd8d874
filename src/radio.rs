//! btleplug-backed radio driver.
//!
//! The driver is the only code that touches the platform BLE stack.  It runs
//! as one task that
//!
//! * executes [`RadioRequest`]s received from the session,
//! * watches the adapter's [`CentralEvent`] stream (discovery, connect,
//!   disconnect, power state), and
//! * pumps GATT notifications from the subscribed peripheral,
//!
//! and reports everything back as [`RadioEvent`]s on a single channel.  Slow
//! operations (connect, discovery, subscribe, write) run in their own tasks
//! under hard timeouts and post their outcome back through the driver, which
//! deduplicates connect/disconnect signals before forwarding them.
//!
//! The session side only ever sees a [`RadioLink`]; tests substitute a
//! [`RadioEndpoint`] driven by hand.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use anyhow::{anyhow, Result};
use btleplug::api::{
    Central, CentralEvent, CentralState, Characteristic, Manager as _, Peripheral as _,
    ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::StreamExt;
use log::{debug, info, warn};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::machine::{RadioEvent, RadioRequest, WriteMode};
use crate::protocol::MIDI_SERVICE_UUID;
use crate::types::{AdapterState, PeripheralId, PeripheralInfo};

// ── Channels ──────────────────────────────────────────────────────────────────

/// Session side of the radio channel pair.
pub struct RadioLink {
    pub requests: mpsc::UnboundedSender<RadioRequest>,
    pub events: mpsc::UnboundedReceiver<RadioEvent>,
}

/// Radio side of the channel pair: the driver (or a test) reads requests
/// here and posts events.
pub struct RadioEndpoint {
    pub requests: mpsc::UnboundedReceiver<RadioRequest>,
    pub events: mpsc::UnboundedSender<RadioEvent>,
}

/// Create a connected [`RadioLink`] / [`RadioEndpoint`] pair.
pub fn radio_channel() -> (RadioLink, RadioEndpoint) {
    let (req_tx, req_rx) = mpsc::unbounded_channel();
    let (ev_tx, ev_rx) = mpsc::unbounded_channel();
    (
        RadioLink {
            requests: req_tx,
            events: ev_rx,
        },
        RadioEndpoint {
            requests: req_rx,
            events: ev_tx,
        },
    )
}

// ── Adapter ───────────────────────────────────────────────────────────────────

/// First Bluetooth adapter on this machine.
pub async fn default_adapter() -> Result<Adapter> {
    let manager = Manager::new().await?;
    manager
        .adapters()
        .await?
        .into_iter()
        .next()
        .ok_or_else(|| anyhow!("No Bluetooth adapter found"))
}

fn adapter_state(state: CentralState) -> AdapterState {
    match state {
        CentralState::PoweredOn => AdapterState::PoweredOn,
        CentralState::PoweredOff => AdapterState::PoweredOff,
        CentralState::Unknown => AdapterState::Unknown,
    }
}

/// Hard limits on slow radio operations.
#[derive(Debug, Clone, Copy)]
pub struct RadioTimeouts {
    pub connect: Duration,
    pub discovery: Duration,
}

// ── Driver ────────────────────────────────────────────────────────────────────

/// Spawn the driver for `adapter`, serving `endpoint`.
///
/// The driver stops (after stopping the scan and disconnecting every
/// peripheral it connected) once the session drops its request sender.
pub async fn spawn_driver(
    adapter: Adapter,
    endpoint: RadioEndpoint,
    timeouts: RadioTimeouts,
) -> Result<JoinHandle<()>> {
    let central_events = adapter.events().await?;
    let (outcome_tx, outcome_rx) = mpsc::unbounded_channel();
    let driver = BtleRadio {
        adapter,
        timeouts,
        events: endpoint.events,
        outcome_tx,
        peripherals: HashMap::new(),
        connected: HashSet::new(),
        cancelled: HashSet::new(),
        pumps: HashMap::new(),
        scanning: false,
    };
    Ok(tokio::spawn(driver.run(
        endpoint.requests,
        central_events,
        outcome_rx,
    )))
}

struct BtleRadio {
    adapter: Adapter,
    timeouts: RadioTimeouts,
    events: mpsc::UnboundedSender<RadioEvent>,
    /// Completion channel for spawned operations.
    outcome_tx: mpsc::UnboundedSender<RadioEvent>,
    peripherals: HashMap<PeripheralId, Peripheral>,
    /// Peripherals for which `Connected` has been forwarded without a
    /// matching `Disconnected`.
    connected: HashSet<PeripheralId>,
    /// Connect attempts abandoned by a disconnect request; their outcome is
    /// swallowed.
    cancelled: HashSet<PeripheralId>,
    /// Notification pump per subscribed peripheral.
    pumps: HashMap<PeripheralId, JoinHandle<()>>,
    scanning: bool,
}

type CentralStream = std::pin::Pin<Box<dyn futures::Stream<Item = CentralEvent> + Send>>;

impl BtleRadio {
    async fn run(
        mut self,
        mut requests: mpsc::UnboundedReceiver<RadioRequest>,
        mut central: CentralStream,
        mut outcomes: mpsc::UnboundedReceiver<RadioEvent>,
    ) {
        self.report_initial_state().await;

        loop {
            tokio::select! {
                request = requests.recv() => match request {
                    Some(request) => self.execute(request).await,
                    None => break,
                },
                Some(event) = central.next() => self.on_central_event(event).await,
                Some(outcome) = outcomes.recv() => self.forward(outcome),
            }
        }

        self.teardown().await;
        info!("radio: driver stopped");
    }

    async fn report_initial_state(&mut self) {
        let state = match self.adapter.adapter_state().await {
            Ok(state) => adapter_state(state),
            Err(e) => {
                warn!("radio: adapter_state() failed: {e}; assuming powered on");
                AdapterState::PoweredOn
            }
        };

        let mut known = Vec::new();
        for p in self.adapter.peripherals().await.unwrap_or_default() {
            let info = self.peripheral_info(&p).await;
            if let Some(info) = info {
                self.peripherals.insert(info.id.clone(), p);
                known.push(info);
            }
        }
        debug!("radio: adapter {state:?}, {} cached peripheral(s)", known.len());
        self.forward(RadioEvent::AdapterState { state, known });
    }

    async fn teardown(&mut self) {
        if self.scanning {
            self.adapter.stop_scan().await.ok();
        }
        for (_, pump) in self.pumps.drain() {
            pump.abort();
        }
        for id in self.connected.drain() {
            if let Some(p) = self.peripherals.get(&id) {
                if let Err(e) = p.disconnect().await {
                    warn!("radio: disconnect {id} during teardown: {e}");
                }
            }
        }
    }

    /// Forward an event to the session, collapsing duplicate connect and
    /// disconnect signals for the same peripheral.
    fn forward(&mut self, event: RadioEvent) {
        match &event {
            RadioEvent::Connected { id } if self.cancelled.remove(id) => {
                debug!("radio: {id} connected after cancel, disconnecting");
                if let Some(p) = self.peripherals.get(id).cloned() {
                    tokio::spawn(async move { p.disconnect().await.ok() });
                }
                return;
            }
            RadioEvent::ConnectFailed { id, .. } if self.cancelled.remove(id) => return,
            RadioEvent::Connected { id } => {
                if !self.connected.insert(id.clone()) {
                    debug!("radio: {id} already connected");
                    return;
                }
            }
            RadioEvent::Disconnected { id, .. } => {
                if let Some(pump) = self.pumps.remove(id) {
                    pump.abort();
                }
                if !self.connected.remove(id) {
                    debug!("radio: {id} already disconnected");
                    return;
                }
            }
            RadioEvent::ConnectFailed { id, .. } => {
                self.connected.remove(id);
            }
            _ => {}
        }
        // The session only goes away during shutdown.
        let _ = self.events.send(event);
    }

    // ── Central events ───────────────────────────────────────────────────────

    async fn on_central_event(&mut self, event: CentralEvent) {
        match event {
            CentralEvent::DeviceDiscovered(pid)
            | CentralEvent::DeviceUpdated(pid)
            | CentralEvent::ServicesAdvertisement { id: pid, .. } => {
                if !self.scanning {
                    return;
                }
                let Ok(p) = self.adapter.peripheral(&pid).await else {
                    return;
                };
                let Ok(Some(props)) = p.properties().await else {
                    return;
                };
                // Some platforms ignore the scan filter.
                if !props.services.contains(&MIDI_SERVICE_UUID) {
                    return;
                }
                let Some(id) = PeripheralId::parse(&pid.to_string()) else {
                    return;
                };
                self.peripherals.insert(id.clone(), p);
                self.forward(RadioEvent::Discovered(PeripheralInfo::new(id, props.local_name)));
            }
            CentralEvent::DeviceConnected(pid) => {
                if let Some(id) = PeripheralId::parse(&pid.to_string()) {
                    if self.peripherals.contains_key(&id) {
                        self.forward(RadioEvent::Connected { id });
                    }
                }
            }
            CentralEvent::DeviceDisconnected(pid) => {
                if let Some(id) = PeripheralId::parse(&pid.to_string()) {
                    info!("radio: {id} disconnected");
                    self.forward(RadioEvent::Disconnected { id, reason: None });
                }
            }
            CentralEvent::StateUpdate(state) => {
                let state = adapter_state(state);
                info!("radio: adapter state {state:?}");
                if state != AdapterState::PoweredOn {
                    self.scanning = false;
                    for (_, pump) in self.pumps.drain() {
                        pump.abort();
                    }
                    self.connected.clear();
                }
                self.forward(RadioEvent::AdapterState {
                    state,
                    known: Vec::new(),
                });
            }
            _ => {}
        }
    }

    // ── Requests ─────────────────────────────────────────────────────────────

    async fn execute(&mut self, request: RadioRequest) {
        debug!("radio: {request:?}");
        match request {
            RadioRequest::StartScan { services } => {
                match self.adapter.start_scan(ScanFilter { services }).await {
                    Ok(()) => self.scanning = true,
                    Err(e) => warn!("radio: start_scan failed: {e}"),
                }
            }
            RadioRequest::StopScan => {
                self.scanning = false;
                if let Err(e) = self.adapter.stop_scan().await {
                    warn!("radio: stop_scan failed: {e}");
                }
            }
            RadioRequest::Connect { id } => {
                self.cancelled.remove(&id);
                let Some(p) = self.lookup(&id).await else {
                    self.forward(RadioEvent::ConnectFailed {
                        id,
                        reason: "peripheral not known to the adapter".into(),
                    });
                    return;
                };
                let limit = self.timeouts.connect;
                let tx = self.outcome_tx.clone();
                tokio::spawn(async move {
                    let outcome = match tokio::time::timeout(limit, p.connect()).await {
                        Ok(Ok(())) => RadioEvent::Connected { id },
                        Ok(Err(e)) => RadioEvent::ConnectFailed {
                            id,
                            reason: e.to_string(),
                        },
                        Err(_) => RadioEvent::ConnectFailed {
                            id,
                            reason: format!("connect() timed out after {} s", limit.as_secs()),
                        },
                    };
                    let _ = tx.send(outcome);
                });
            }
            RadioRequest::Disconnect { id } => {
                let Some(p) = self.peripherals.get(&id).cloned() else {
                    let _ = self.events.send(RadioEvent::Disconnected { id, reason: None });
                    return;
                };
                if !self.connected.contains(&id) {
                    // Connect still in flight: report the drop now and
                    // discard whatever the attempt yields.
                    self.cancelled.insert(id.clone());
                    let _ = self.events.send(RadioEvent::Disconnected {
                        id,
                        reason: Some("connect cancelled".into()),
                    });
                    tokio::spawn(async move { p.disconnect().await.ok() });
                    return;
                }
                let tx = self.outcome_tx.clone();
                tokio::spawn(async move {
                    let reason = match p.disconnect().await {
                        Ok(()) => None,
                        Err(e) => {
                            warn!("radio: disconnect {id}: {e}");
                            Some(e.to_string())
                        }
                    };
                    // Duplicates of the adapter's own signal are collapsed by `forward`.
                    let _ = tx.send(RadioEvent::Disconnected { id, reason });
                });
            }
            RadioRequest::DiscoverServices { id, services } => {
                let Some(p) = self.peripherals.get(&id).cloned() else {
                    self.forward(RadioEvent::DiscoveryFailed {
                        id,
                        reason: "peripheral not known to the adapter".into(),
                    });
                    return;
                };
                let limit = self.timeouts.discovery;
                let tx = self.outcome_tx.clone();
                tokio::spawn(async move {
                    let _ = tx.send(discover_services(&p, id, services, limit).await);
                });
            }
            RadioRequest::DiscoverCharacteristics { id, service } => {
                // btleplug discovers characteristics together with services.
                let characteristics = self
                    .peripherals
                    .get(&id)
                    .and_then(|p| {
                        p.services()
                            .into_iter()
                            .find(|s| s.uuid == service)
                            .map(|s| s.characteristics.iter().map(|c| c.uuid).collect())
                    })
                    .unwrap_or_default();
                self.forward(RadioEvent::CharacteristicsDiscovered {
                    id,
                    service,
                    characteristics,
                });
            }
            RadioRequest::SetNotify {
                id,
                characteristic,
                enabled,
            } => self.set_notify(id, characteristic, enabled),
            RadioRequest::Write {
                id,
                characteristic,
                value,
                mode,
            } => {
                let Some((p, c)) = self.characteristic(&id, characteristic) else {
                    warn!("radio: write to {id}/{characteristic}: characteristic not found");
                    return;
                };
                let write_type = match mode {
                    WriteMode::WithResponse => WriteType::WithResponse,
                    WriteMode::WithoutResponse => WriteType::WithoutResponse,
                };
                tokio::spawn(async move {
                    if let Err(e) = p.write(&c, &value, write_type).await {
                        warn!("radio: write to {id} failed: {e}");
                    }
                });
            }
        }
    }

    fn set_notify(&mut self, id: PeripheralId, characteristic: Uuid, enabled: bool) {
        let Some((p, c)) = self.characteristic(&id, characteristic) else {
            self.forward(RadioEvent::DiscoveryFailed {
                id,
                reason: format!("characteristic {characteristic} not found"),
            });
            return;
        };

        if enabled && !self.pumps.contains_key(&id) {
            // Start pumping before subscribing so no early notification is lost.
            let pump = tokio::spawn(pump_notifications(
                p.clone(),
                id.clone(),
                self.events.clone(),
            ));
            self.pumps.insert(id.clone(), pump);
        }

        let tx = self.outcome_tx.clone();
        tokio::spawn(async move {
            let result = if enabled {
                p.subscribe(&c).await
            } else {
                p.unsubscribe(&c).await
            };
            let subscribed = enabled && result.is_ok();
            let peripheral_id = id.clone();
            let outcome = match result {
                Ok(()) => RadioEvent::NotifyStateChanged {
                    id,
                    characteristic,
                    enabled,
                },
                Err(e) => RadioEvent::DiscoveryFailed {
                    id,
                    reason: format!("set notify on {characteristic}: {e}"),
                },
            };
            let _ = tx.send(outcome);
            if subscribed {
                dump_descriptors(&p, &peripheral_id, &c).await;
            }
        });
    }

    // ── Lookup helpers ───────────────────────────────────────────────────────

    async fn lookup(&mut self, id: &PeripheralId) -> Option<Peripheral> {
        if let Some(p) = self.peripherals.get(id) {
            return Some(p.clone());
        }
        let p = self
            .adapter
            .peripherals()
            .await
            .ok()?
            .into_iter()
            .find(|p| p.id().to_string() == id.as_str())?;
        self.peripherals.insert(id.clone(), p.clone());
        Some(p)
    }

    fn characteristic(&self, id: &PeripheralId, uuid: Uuid) -> Option<(Peripheral, Characteristic)> {
        let p = self.peripherals.get(id)?;
        let c = p.characteristics().into_iter().find(|c| c.uuid == uuid)?;
        Some((p.clone(), c))
    }

    async fn peripheral_info(&self, p: &Peripheral) -> Option<PeripheralInfo> {
        let id = PeripheralId::parse(&p.id().to_string())?;
        let name = p.properties().await.ok().flatten().and_then(|props| props.local_name);
        Some(PeripheralInfo::new(id, name))
    }
}

async fn discover_services(
    p: &Peripheral,
    id: PeripheralId,
    filter: Vec<Uuid>,
    limit: Duration,
) -> RadioEvent {
    // BlueZ reports the link up before its GATT cache is populated; an
    // immediate discover_services() can come back empty.
    #[cfg(target_os = "linux")]
    tokio::time::sleep(Duration::from_millis(600)).await;

    match tokio::time::timeout(limit, p.discover_services()).await {
        Ok(Ok(())) => {
            let services = p
                .services()
                .into_iter()
                .map(|s| s.uuid)
                .filter(|uuid| filter.is_empty() || filter.contains(uuid))
                .collect();
            RadioEvent::ServicesDiscovered { id, services }
        }
        Ok(Err(e)) => RadioEvent::DiscoveryFailed {
            id,
            reason: e.to_string(),
        },
        Err(_) => RadioEvent::DiscoveryFailed {
            id,
            reason: format!("discover_services() timed out after {} s", limit.as_secs()),
        },
    }
}

const DESCRIPTOR_READ_TIMEOUT: Duration = Duration::from_secs(2);

/// Characteristic User Description.
const USER_DESCRIPTION_UUID: Uuid = Uuid::from_u128(0x00002901_0000_1000_8000_00805F9B34FB);
/// Client Characteristic Configuration.
const CLIENT_CONFIG_UUID: Uuid = Uuid::from_u128(0x00002902_0000_1000_8000_00805F9B34FB);

/// Log every descriptor of `c` with its current value.  Diagnostic only.
async fn dump_descriptors(p: &Peripheral, id: &PeripheralId, c: &Characteristic) {
    for d in &c.descriptors {
        match tokio::time::timeout(DESCRIPTOR_READ_TIMEOUT, p.read_descriptor(d)).await {
            Ok(Ok(value)) => {
                debug!("radio: {id}/{}: {}", c.uuid, describe_descriptor(d.uuid, &value))
            }
            Ok(Err(e)) => {
                debug!("radio: {id}/{}: read descriptor {} failed: {e}", c.uuid, d.uuid)
            }
            Err(_) => debug!("radio: {id}/{}: read descriptor {} timed out", c.uuid, d.uuid),
        }
    }
}

fn describe_descriptor(uuid: Uuid, value: &[u8]) -> String {
    if uuid == USER_DESCRIPTION_UUID {
        format!("user description {:?}", String::from_utf8_lossy(value))
    } else if uuid == CLIENT_CONFIG_UUID {
        let flags = value.first().copied().unwrap_or(0);
        format!(
            "client config notify={} indicate={}",
            flags & 0x01 != 0,
            flags & 0x02 != 0
        )
    } else {
        format!("descriptor {uuid} = {value:02X?}")
    }
}

async fn pump_notifications(
    p: Peripheral,
    id: PeripheralId,
    events: mpsc::UnboundedSender<RadioEvent>,
) {
    let mut notifications = match p.notifications().await {
        Ok(n) => n,
        Err(e) => {
            warn!("radio: could not get notification stream for {id}: {e}");
            return;
        }
    };
    debug!("radio: notification stream for {id} open");
    while let Some(n) = notifications.next().await {
        let event = RadioEvent::ValueUpdated {
            id: id.clone(),
            characteristic: n.uuid,
            value: n.value,
        };
        if events.send(event).is_err() {
            break;
        }
    }
    debug!("radio: notification stream for {id} ended");
}
