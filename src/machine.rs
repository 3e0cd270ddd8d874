//! The connection state machine.
//!
//! [`ConnectionMachine`] owns every piece of mutable connection state and
//! performs no I/O.  Radio activity arrives as [`RadioEvent`]s, caller intent
//! through [`ConnectionMachine::connect`] / [`ConnectionMachine::disconnect`] /
//! [`ConnectionMachine::send`], and every step answers with a list of
//! [`Effect`]s: radio requests to execute and application events to deliver.
//! The session task in [`crate::transport`] feeds it one input at a time, which
//! is what serializes concurrent radio callbacks.
//!
//! ```text
//! Disconnected ──power on, nothing bound──────────────▶ Scanning
//! Disconnected ──power on, bound + resolvable────────▶ Connecting
//! Scanning ─────connect(id) / bound id discovered────▶ Connecting
//! Connecting ───connected────────────────────────────▶ DiscoveringServices
//! DiscoveringServices ──services found───────────────▶ DiscoveringCharacteristics
//! DiscoveringCharacteristics ──MIDI char found───────▶ Subscribing
//! Subscribing ──notify enabled───────────────────────▶ Ready
//! Ready ────────disconnect()─────────────────────────▶ Disconnecting
//! any ──────────disconnected─────────────────────────▶ Disconnected ─▶ (re-evaluate)
//! ```
//!
//! Callbacks naming a peripheral other than the active one are stale and
//! dropped.

use std::collections::BTreeMap;

use anyhow::{bail, Result};
use log::{debug, info, warn};
use uuid::Uuid;

use crate::parse::SysExAssembler;
use crate::protocol::{encode, TimestampClock, MIDI_CHARACTERISTIC_UUID, MIDI_SERVICE_UUID};
use crate::registry::DeviceRegistry;
use crate::types::{
    AdapterState, ConnectionState, MidiEventBytes, PeripheralId, PeripheralInfo, TransportEvent,
    TransportStatus,
};

// ── Radio vocabulary ─────────────────────────────────────────────────────────

/// Something the radio stack reported.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RadioEvent {
    /// Adapter power state.  `known` lists peripherals the stack can already
    /// resolve without scanning (bonded or cached).
    AdapterState {
        state: AdapterState,
        known: Vec<PeripheralInfo>,
    },
    /// An advertisement from a peripheral matching the scan filter.
    Discovered(PeripheralInfo),
    Connected {
        id: PeripheralId,
    },
    ConnectFailed {
        id: PeripheralId,
        reason: String,
    },
    Disconnected {
        id: PeripheralId,
        reason: Option<String>,
    },
    ServicesDiscovered {
        id: PeripheralId,
        services: Vec<Uuid>,
    },
    CharacteristicsDiscovered {
        id: PeripheralId,
        service: Uuid,
        characteristics: Vec<Uuid>,
    },
    NotifyStateChanged {
        id: PeripheralId,
        characteristic: Uuid,
        enabled: bool,
    },
    /// Service/characteristic discovery or subscription failed.
    DiscoveryFailed {
        id: PeripheralId,
        reason: String,
    },
    ValueUpdated {
        id: PeripheralId,
        characteristic: Uuid,
        value: Vec<u8>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    WithResponse,
    WithoutResponse,
}

/// Something the radio stack is asked to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RadioRequest {
    StartScan {
        services: Vec<Uuid>,
    },
    StopScan,
    Connect {
        id: PeripheralId,
    },
    Disconnect {
        id: PeripheralId,
    },
    DiscoverServices {
        id: PeripheralId,
        services: Vec<Uuid>,
    },
    DiscoverCharacteristics {
        id: PeripheralId,
        service: Uuid,
    },
    SetNotify {
        id: PeripheralId,
        characteristic: Uuid,
        enabled: bool,
    },
    Write {
        id: PeripheralId,
        characteristic: Uuid,
        value: Vec<u8>,
        mode: WriteMode,
    },
}

/// Output of one machine step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    Radio(RadioRequest),
    Emit(TransportEvent),
}

// ── Active link ──────────────────────────────────────────────────────────────

/// The single peripheral bound to the session.
struct Link {
    peripheral: PeripheralInfo,
    /// Notify/write target once found.
    characteristic: Option<Uuid>,
    /// Services whose characteristics have not been reported yet.
    pending_services: usize,
    /// Re-enter by scanning rather than direct-connecting when this link drops.
    rescan_on_drop: bool,
    /// `Connected` has been announced to the application.
    announced: bool,
    assembler: SysExAssembler,
}

impl Link {
    fn new(peripheral: PeripheralInfo) -> Self {
        Self {
            peripheral,
            characteristic: None,
            pending_services: 0,
            rescan_on_drop: false,
            announced: false,
            assembler: SysExAssembler::new(),
        }
    }
}

// ── ConnectionMachine ────────────────────────────────────────────────────────

pub struct ConnectionMachine {
    state: ConnectionState,
    registry: DeviceRegistry,
    clock: TimestampClock,
    auto_reconnect: bool,
    powered: bool,
    /// Peripherals the stack can resolve for a direct connect.
    known: BTreeMap<PeripheralId, PeripheralInfo>,
    /// Peripherals seen during the current scan.
    discovered: BTreeMap<PeripheralId, PeripheralInfo>,
    link: Option<Link>,
    /// Set by a caller-initiated disconnect; blocks automatic reconnection to
    /// the bound peripheral until the caller connects again.
    hold_reconnect: bool,
}

impl ConnectionMachine {
    pub fn new(registry: DeviceRegistry, auto_reconnect: bool) -> Self {
        Self {
            state: ConnectionState::Disconnected,
            registry,
            clock: TimestampClock::new(),
            auto_reconnect,
            powered: false,
            known: BTreeMap::new(),
            discovered: BTreeMap::new(),
            link: None,
            hold_reconnect: false,
        }
    }

    // ── Observers ────────────────────────────────────────────────────────────

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_scanning(&self) -> bool {
        self.state == ConnectionState::Scanning
    }

    pub fn active_peripheral(&self) -> Option<&PeripheralInfo> {
        self.link.as_ref().map(|l| &l.peripheral)
    }

    pub fn discovered(&self) -> Vec<PeripheralInfo> {
        self.discovered.values().cloned().collect()
    }

    pub fn bound_peripheral(&self) -> Option<PeripheralId> {
        self.registry.load()
    }

    pub fn status(&self) -> TransportStatus {
        TransportStatus {
            scanning: self.is_scanning(),
            connection: self.state,
            peripheral: self.active_peripheral().cloned(),
            discovered: self.discovered(),
        }
    }

    // ── Caller intent ────────────────────────────────────────────────────────

    /// Connect to a discovered (or stack-resolvable) peripheral.
    ///
    /// Only honoured while `Disconnected` (adapter on) or `Scanning`; in any
    /// other state this is a no-op.
    pub fn connect(&mut self, id: &PeripheralId) -> Vec<Effect> {
        let mut effects = Vec::new();
        match self.state {
            ConnectionState::Scanning => {}
            ConnectionState::Disconnected if self.powered => {}
            ConnectionState::Disconnected => {
                warn!("connect({id}): adapter is not powered on, ignoring");
                return effects;
            }
            state => {
                debug!("connect({id}): already {state:?}, ignoring");
                return effects;
            }
        }

        let Some(info) = self
            .discovered
            .get(id)
            .or_else(|| self.known.get(id))
            .cloned()
        else {
            warn!("connect({id}): unknown peripheral, ignoring");
            return effects;
        };

        self.hold_reconnect = false;
        self.begin_connect(info, &mut effects);
        effects
    }

    /// Caller-initiated disconnect of the active link.
    pub fn disconnect(&mut self) -> Vec<Effect> {
        let mut effects = Vec::new();
        match (&mut self.link, self.state) {
            (_, ConnectionState::Disconnecting) => debug!("disconnect(): already disconnecting"),
            (Some(link), state) if state.has_link() => {
                info!("Disconnecting from {} ({state:?})", link.peripheral.id);
                link.rescan_on_drop = true;
                self.hold_reconnect = true;
                self.state = ConnectionState::Disconnecting;
                effects.push(Effect::Radio(RadioRequest::Disconnect {
                    id: link.peripheral.id.clone(),
                }));
            }
            _ => debug!("disconnect(): no active link"),
        }
        effects
    }

    /// Encode and write one MIDI message.  Dropped unless `Ready`.
    pub fn send(&mut self, event: &MidiEventBytes) -> Vec<Effect> {
        if event.is_empty() {
            debug!("send(): empty message, ignoring");
            return Vec::new();
        }
        let target = match (&self.link, self.state) {
            (Some(link), ConnectionState::Ready) => link
                .characteristic
                .map(|c| (link.peripheral.id.clone(), c)),
            _ => None,
        };
        let Some((id, characteristic)) = target else {
            debug!("send(): not ready ({:?}), dropping {event}", self.state);
            return Vec::new();
        };
        let value = encode(event, &self.clock);
        debug!("send(): {event} → {id} as {value:02X?}");
        vec![Effect::Radio(RadioRequest::Write {
            id,
            characteristic,
            value,
            mode: WriteMode::WithoutResponse,
        })]
    }

    /// Forget the bound peripheral.
    pub fn forget(&mut self) {
        self.registry.clear();
    }

    /// Stop scanning and drop the active link ahead of teardown.
    pub fn shutdown(&mut self) -> Vec<Effect> {
        let mut effects = Vec::new();
        if self.is_scanning() {
            effects.push(Effect::Radio(RadioRequest::StopScan));
        }
        if let Some(link) = self.link.take() {
            effects.push(Effect::Radio(RadioRequest::Disconnect {
                id: link.peripheral.id.clone(),
            }));
            if link.announced {
                effects.push(Effect::Emit(TransportEvent::Disconnected(link.peripheral.id)));
            }
        }
        self.discovered.clear();
        self.state = ConnectionState::Disconnected;
        effects
    }

    // ── Radio events ─────────────────────────────────────────────────────────

    /// Apply one radio event.
    ///
    /// Returns `Err` only when the adapter reports a state the platform
    /// contract rules out (BLE unsupported); the session cannot continue.
    pub fn handle(&mut self, event: RadioEvent) -> Result<Vec<Effect>> {
        let mut effects = Vec::new();
        match event {
            RadioEvent::AdapterState { state, known } => {
                self.on_adapter_state(state, known, &mut effects)?
            }
            RadioEvent::Discovered(info) => self.on_discovered(info, &mut effects),
            RadioEvent::Connected { id } => self.on_connected(id, &mut effects),
            RadioEvent::ConnectFailed { id, reason } => {
                const CONNECTING: [ConnectionState; 2] =
                    [ConnectionState::Connecting, ConnectionState::Disconnecting];
                if self.is_active(&id, &CONNECTING) {
                    warn!("Connect to {id} failed: {reason}; falling back to scanning");
                    self.drop_link(true, &mut effects);
                } else {
                    debug!("Stale connect failure for {id}: {reason}");
                }
            }
            RadioEvent::Disconnected { id, reason } => self.on_disconnected(id, reason, &mut effects),
            RadioEvent::ServicesDiscovered { id, services } => {
                self.on_services(id, services, &mut effects)
            }
            RadioEvent::CharacteristicsDiscovered {
                id,
                service,
                characteristics,
            } => self.on_characteristics(id, service, characteristics, &mut effects),
            RadioEvent::NotifyStateChanged {
                id,
                characteristic,
                enabled,
            } => self.on_notify_state(id, characteristic, enabled, &mut effects),
            RadioEvent::DiscoveryFailed { id, reason } => {
                const DISCOVERY: [ConnectionState; 3] = [
                    ConnectionState::DiscoveringServices,
                    ConnectionState::DiscoveringCharacteristics,
                    ConnectionState::Subscribing,
                ];
                if self.is_active(&id, &DISCOVERY) {
                    self.abandon_link(&format!("discovery failed: {reason}"), &mut effects);
                } else {
                    debug!("Stale discovery failure for {id}: {reason}");
                }
            }
            RadioEvent::ValueUpdated {
                id,
                characteristic,
                value,
            } => self.on_value(id, characteristic, &value, &mut effects),
        }
        Ok(effects)
    }

    fn on_adapter_state(
        &mut self,
        state: AdapterState,
        known: Vec<PeripheralInfo>,
        effects: &mut Vec<Effect>,
    ) -> Result<()> {
        match state {
            AdapterState::Unsupported => {
                bail!("Bluetooth adapter reports BLE as unsupported on this platform")
            }
            AdapterState::Unknown => {
                debug!("Adapter state unknown, waiting for a definite state");
            }
            AdapterState::PoweredOff | AdapterState::Resetting | AdapterState::Unauthorized => {
                info!("Adapter {state:?}: dropping session state");
                self.powered = false;
                if let Some(link) = self.link.take() {
                    if link.announced {
                        effects.push(Effect::Emit(TransportEvent::Disconnected(link.peripheral.id)));
                    }
                }
                self.discovered.clear();
                self.state = ConnectionState::Disconnected;
            }
            AdapterState::PoweredOn => {
                for info in known {
                    self.known.insert(info.id.clone(), info);
                }
                let was_powered = std::mem::replace(&mut self.powered, true);
                if self.state == ConnectionState::Disconnected {
                    info!("Adapter powered on");
                    self.restart(false, effects);
                } else if !was_powered {
                    debug!("Adapter powered on while {:?}", self.state);
                }
            }
        }
        Ok(())
    }

    fn on_discovered(&mut self, info: PeripheralInfo, effects: &mut Vec<Effect>) {
        self.known.insert(info.id.clone(), info.clone());
        if !self.is_scanning() {
            return;
        }
        let id = info.id.clone();
        if self.discovered.insert(id.clone(), info.clone()).is_none() {
            info!("Discovered {} [{id}]", info.display_name());
        }

        if self.auto_reconnect
            && !self.hold_reconnect
            && self.registry.load().as_ref() == Some(&id)
        {
            info!("Bound peripheral {id} is advertising, reconnecting");
            self.begin_connect(info, effects);
        }
    }

    fn on_connected(&mut self, id: PeripheralId, effects: &mut Vec<Effect>) {
        let Some(link) = self.link.as_mut().filter(|l| l.peripheral.id == id) else {
            debug!("Ignoring connect signal for inactive peripheral {id}");
            return;
        };
        if self.state != ConnectionState::Connecting {
            debug!("{id} already connected ({:?}), ignoring duplicate", self.state);
            return;
        }

        info!("Connected to {} [{id}]", link.peripheral.display_name());
        self.registry.bind_if_unset(&id);
        self.state = ConnectionState::DiscoveringServices;
        effects.push(Effect::Radio(RadioRequest::DiscoverServices {
            id,
            services: vec![MIDI_SERVICE_UUID],
        }));
    }

    fn on_disconnected(
        &mut self,
        id: PeripheralId,
        reason: Option<String>,
        effects: &mut Vec<Effect>,
    ) {
        if !self.link.as_ref().is_some_and(|l| l.peripheral.id == id) {
            debug!("Ignoring disconnect of inactive peripheral {id}");
            return;
        }
        match reason {
            Some(reason) => info!("{id} disconnected: {reason}"),
            None => info!("{id} disconnected"),
        }
        let rescan = self.link.as_ref().is_some_and(|l| l.rescan_on_drop);
        self.drop_link(rescan, effects);
    }

    fn on_services(&mut self, id: PeripheralId, services: Vec<Uuid>, effects: &mut Vec<Effect>) {
        if !self.is_active(&id, &[ConnectionState::DiscoveringServices]) {
            debug!("Dropping stale service list for {id}");
            return;
        }
        if services.is_empty() {
            self.abandon_link("no BLE-MIDI service", effects);
            return;
        }

        debug!("{id}: {} service(s) found", services.len());
        self.state = ConnectionState::DiscoveringCharacteristics;
        if let Some(link) = self.link.as_mut() {
            link.pending_services = services.len();
        }
        effects.extend(services.into_iter().map(|service| {
            Effect::Radio(RadioRequest::DiscoverCharacteristics {
                id: id.clone(),
                service,
            })
        }));
    }

    fn on_characteristics(
        &mut self,
        id: PeripheralId,
        service: Uuid,
        characteristics: Vec<Uuid>,
        effects: &mut Vec<Effect>,
    ) {
        if !self.is_active(&id, &[ConnectionState::DiscoveringCharacteristics]) {
            debug!("Dropping stale characteristic list for {id}/{service}");
            return;
        }
        let Some(link) = self.link.as_mut() else {
            return;
        };
        link.pending_services = link.pending_services.saturating_sub(1);

        if characteristics.contains(&MIDI_CHARACTERISTIC_UUID) {
            info!("{id}: BLE-MIDI characteristic found, enabling notifications");
            link.characteristic = Some(MIDI_CHARACTERISTIC_UUID);
            self.state = ConnectionState::Subscribing;
            effects.push(Effect::Radio(RadioRequest::SetNotify {
                id,
                characteristic: MIDI_CHARACTERISTIC_UUID,
                enabled: true,
            }));
        } else if link.pending_services == 0 {
            self.abandon_link("no BLE-MIDI characteristic", effects);
        }
    }

    fn on_notify_state(
        &mut self,
        id: PeripheralId,
        characteristic: Uuid,
        enabled: bool,
        effects: &mut Vec<Effect>,
    ) {
        if !self.is_active(&id, &[ConnectionState::Subscribing])
            || self.link.as_ref().and_then(|l| l.characteristic) != Some(characteristic)
        {
            debug!("Dropping stale notify state for {id}/{characteristic}");
            return;
        }
        if !enabled {
            self.abandon_link("notifications were not enabled", effects);
            return;
        }
        let Some(link) = self.link.as_mut() else {
            return;
        };
        info!("{} [{id}] ready", link.peripheral.display_name());
        self.state = ConnectionState::Ready;
        link.announced = true;
        effects.push(Effect::Emit(TransportEvent::Connected(link.peripheral.clone())));
    }

    fn on_value(
        &mut self,
        id: PeripheralId,
        characteristic: Uuid,
        value: &[u8],
        effects: &mut Vec<Effect>,
    ) {
        // Notifications may arrive before the subscription is acknowledged.
        let accepting = self.is_active(&id, &[ConnectionState::Subscribing, ConnectionState::Ready]);
        let Some(link) = self
            .link
            .as_mut()
            .filter(|l| accepting && l.characteristic == Some(characteristic))
        else {
            debug!("Dropping stale notification from {id}/{characteristic}");
            return;
        };
        for event in link.assembler.push(value) {
            effects.push(Effect::Emit(TransportEvent::Midi {
                peripheral: id.clone(),
                event,
            }));
        }
    }

    // ── Internals ────────────────────────────────────────────────────────────

    fn is_active(&self, id: &PeripheralId, states: &[ConnectionState]) -> bool {
        states.contains(&self.state) && self.link.as_ref().is_some_and(|l| &l.peripheral.id == id)
    }

    fn begin_connect(&mut self, info: PeripheralInfo, effects: &mut Vec<Effect>) {
        if self.is_scanning() {
            effects.push(Effect::Radio(RadioRequest::StopScan));
        }
        info!("Connecting to {} [{}]", info.display_name(), info.id);
        effects.push(Effect::Radio(RadioRequest::Connect {
            id: info.id.clone(),
        }));
        self.link = Some(Link::new(info));
        self.state = ConnectionState::Connecting;
    }

    /// The linked peripheral is unusable: disconnect it and rescan once it drops.
    fn abandon_link(&mut self, why: &str, effects: &mut Vec<Effect>) {
        let Some(link) = self.link.as_mut() else {
            return;
        };
        warn!("{}: {why}; disconnecting", link.peripheral.id);
        link.rescan_on_drop = true;
        effects.push(Effect::Radio(RadioRequest::Disconnect {
            id: link.peripheral.id.clone(),
        }));
    }

    /// Clear the active link and discovered set, then re-enter the protocol.
    fn drop_link(&mut self, rescan: bool, effects: &mut Vec<Effect>) {
        if let Some(link) = self.link.take() {
            if link.announced {
                effects.push(Effect::Emit(TransportEvent::Disconnected(link.peripheral.id)));
            }
        }
        self.discovered.clear();
        self.state = ConnectionState::Disconnected;
        self.restart(rescan, effects);
    }

    /// From `Disconnected`: direct-connect to the bound peripheral when the
    /// stack can resolve it, scan otherwise.
    fn restart(&mut self, force_scan: bool, effects: &mut Vec<Effect>) {
        if !self.powered {
            return;
        }
        if !force_scan && !self.hold_reconnect {
            let bound = self
                .registry
                .load()
                .and_then(|id| self.known.get(&id).cloned());
            if let Some(info) = bound {
                info!("Reconnecting to bound peripheral {}", info.id);
                self.begin_connect(info, effects);
                return;
            }
        }
        info!("Scanning for BLE-MIDI peripherals");
        self.state = ConnectionState::Scanning;
        effects.push(Effect::Radio(RadioRequest::StartScan {
            services: vec![MIDI_SERVICE_UUID],
        }));
    }
}
