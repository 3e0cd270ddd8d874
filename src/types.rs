use std::fmt;
use std::ops::Deref;

use crate::protocol::{is_sysex, SYSEX_END, SYSEX_START};

// ── PeripheralId ──────────────────────────────────────────────────────────────

/// Stable identifier of a BLE peripheral, as reported by the platform stack.
///
/// * macOS / Windows: a UUID string
/// * Linux: a BlueZ device identifier derived from the MAC address
///
/// The string form is what the [`crate::registry::DeviceRegistry`] persists.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeripheralId(String);

impl PeripheralId {
    /// Longest identifier accepted from storage.
    pub const MAX_LEN: usize = 128;

    /// Validate a stored or user-supplied identifier.
    ///
    /// Accepts any non-empty, printable, whitespace-free ASCII string of at
    /// most [`Self::MAX_LEN`] bytes.  Returns `None` otherwise.
    pub fn parse(raw: &str) -> Option<Self> {
        let valid = !raw.is_empty()
            && raw.len() <= Self::MAX_LEN
            && raw.bytes().all(|b| b.is_ascii_graphic());
        valid.then(|| Self(raw.to_owned()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeripheralId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ── PeripheralInfo ────────────────────────────────────────────────────────────

/// A discovered or connected BLE-MIDI peripheral.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeripheralInfo {
    pub id: PeripheralId,
    /// Advertised local name, if the peripheral sent one.
    pub name: Option<String>,
}

impl PeripheralInfo {
    pub fn new(id: PeripheralId, name: Option<String>) -> Self {
        Self { id, name }
    }

    /// Name for display, `"N/A"` when the peripheral is anonymous.
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or("N/A")
    }
}

// ── ConnectionState ───────────────────────────────────────────────────────────

/// Lifecycle of the single active BLE-MIDI link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Scanning,
    Connecting,
    DiscoveringServices,
    DiscoveringCharacteristics,
    Subscribing,
    Ready,
    Disconnecting,
}

impl ConnectionState {
    /// `true` from `Connecting` through `Disconnecting`, i.e. whenever a
    /// peripheral is bound to the session.
    pub fn has_link(self) -> bool {
        !matches!(self, Self::Disconnected | Self::Scanning)
    }
}

// ── AdapterState ──────────────────────────────────────────────────────────────

/// Power/authorisation state of the local Bluetooth adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterState {
    /// Not yet known; the platform will report a definite state later.
    Unknown,
    Resetting,
    /// The platform has no BLE central support at all.
    Unsupported,
    Unauthorized,
    PoweredOff,
    PoweredOn,
}

// ── MidiEventBytes ────────────────────────────────────────────────────────────

/// One complete MIDI message as raw bytes.
///
/// Channel messages are 1–3 bytes (status first); System Exclusive messages
/// run from `0xF0` through the terminating `0xF7`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MidiEventBytes(Vec<u8>);

impl MidiEventBytes {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    /// Note On, `channel` 0–15.
    pub fn note_on(channel: u8, note: u8, velocity: u8) -> Self {
        Self(vec![0x90 | (channel & 0x0F), note & 0x7F, velocity & 0x7F])
    }

    /// Note Off, `channel` 0–15.
    pub fn note_off(channel: u8, note: u8, velocity: u8) -> Self {
        Self(vec![0x80 | (channel & 0x0F), note & 0x7F, velocity & 0x7F])
    }

    pub fn control_change(channel: u8, controller: u8, value: u8) -> Self {
        Self(vec![0xB0 | (channel & 0x0F), controller & 0x7F, value & 0x7F])
    }

    /// Wrap manufacturer ID + payload in `F0 … F7`.  High bits are cleared so
    /// the body stays 7-bit clean.
    pub fn sysex(manufacturer: &[u8], data: &[u8]) -> Self {
        let mut bytes = Vec::with_capacity(manufacturer.len() + data.len() + 2);
        bytes.push(SYSEX_START);
        bytes.extend(manufacturer.iter().chain(data).map(|b| b & 0x7F));
        bytes.push(SYSEX_END);
        Self(bytes)
    }

    pub fn is_sysex(&self) -> bool {
        is_sysex(&self.0)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }
}

impl Deref for MidiEventBytes {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.0
    }
}

impl From<Vec<u8>> for MidiEventBytes {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

impl From<&[u8]> for MidiEventBytes {
    fn from(bytes: &[u8]) -> Self {
        Self(bytes.to_vec())
    }
}

impl fmt::Display for MidiEventBytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, b) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            write!(f, "{b:02X}")?;
        }
        Ok(())
    }
}

// ── Application-facing events ────────────────────────────────────────────────

/// Events delivered to the application by [`crate::transport::BleMidiTransport`].
///
/// Status flags are not repeated here; watch [`TransportStatus`] for those.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// Notifications are enabled on the peripheral's MIDI characteristic and
    /// outbound sends are now delivered.
    Connected(PeripheralInfo),
    /// The active link was torn down (remote drop, local disconnect, or the
    /// adapter powering off).
    Disconnected(PeripheralId),
    /// One complete MIDI message received from the active peripheral.
    Midi {
        peripheral: PeripheralId,
        event: MidiEventBytes,
    },
}

/// Consistent snapshot of everything an observer may display.
///
/// Published as a whole after every serialized step of the session, so the
/// scanning flag, connection state and discovered list always agree.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TransportStatus {
    pub scanning: bool,
    pub connection: ConnectionState,
    /// The bound peripheral while `connection` is past `Scanning`.
    pub peripheral: Option<PeripheralInfo>,
    /// Peripherals seen during the current scan, deduplicated by id and
    /// ordered by id.
    pub discovered: Vec<PeripheralInfo>,
}

impl TransportStatus {
    pub fn is_ready(&self) -> bool {
        self.connection == ConnectionState::Ready
    }
}
