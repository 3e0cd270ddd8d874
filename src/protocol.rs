//! GATT UUIDs, MIDI status constants, the 13-bit packet clock, and BLE-MIDI
//! packet encoding.
//!
//! Every BLE-MIDI packet starts with a header byte and a timestamp byte that
//! together carry a 13-bit millisecond timestamp:
//!
//! ```text
//! header    : 1 0 t12 t11 t10 t9 t8 t7    (bit 6 reserved, always 0)
//! timestamp : 1 t6 t5 t4 t3 t2 t1 t0
//! ```
//!
//! The value wraps every 8192 ms.  Receivers must not assume timestamps grow
//! monotonically across packets.

use std::time::Instant;

use uuid::Uuid;

// ── Service / characteristic ─────────────────────────────────────────────────

/// BLE-MIDI GATT service UUID.
///
/// Used as the scan filter and as the service filter for GATT discovery.
pub const MIDI_SERVICE_UUID: Uuid = Uuid::from_u128(0x03b80e5a_ede8_4b33_a751_6ce34ec4c700);

/// BLE-MIDI I/O characteristic.
///
/// Write-without-response for outbound packets, notify for inbound packets.
pub const MIDI_CHARACTERISTIC_UUID: Uuid =
    Uuid::from_u128(0x7772e5db_3868_4112_a1a9_f2669d106bf3);

// ── MIDI status bytes ─────────────────────────────────────────────────────────

/// Start of System Exclusive.
pub const SYSEX_START: u8 = 0xF0;

/// End of Exclusive (EOX).
pub const SYSEX_END: u8 = 0xF7;

/// Lowest System Real-Time status byte (timing clock).
pub const REALTIME_FIRST: u8 = 0xF8;

// ── Timestamp ─────────────────────────────────────────────────────────────────

/// Mask applied to every BLE-MIDI timestamp (13 bits, 0–8191).
pub const TIMESTAMP_MASK: u16 = 0x1FFF;

/// A 13-bit BLE-MIDI timestamp in milliseconds.
///
/// Construction always masks, so a `Timestamp` is in `[0, 8191]` by type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Timestamp(u16);

impl Timestamp {
    /// Build a timestamp from any millisecond count, keeping the low 13 bits.
    pub fn from_millis(ms: u64) -> Self {
        Self((ms & TIMESTAMP_MASK as u64) as u16)
    }

    /// Raw 13-bit value.
    pub fn value(self) -> u16 {
        self.0
    }

    /// Packet header byte: bit 7 set, high 6 bits of the timestamp in bits 0–5.
    pub fn header_byte(self) -> u8 {
        0x80 | ((self.0 >> 7) & 0x3F) as u8
    }

    /// Timestamp byte: bit 7 set, low 7 bits of the timestamp.
    pub fn timestamp_byte(self) -> u8 {
        0x80 | (self.0 & 0x7F) as u8
    }

    /// Reassemble a timestamp from a header byte and a timestamp byte.
    ///
    /// ```
    /// # use blemidi_rs::protocol::Timestamp;
    /// let ts = Timestamp::from_millis(0x1234);
    /// assert_eq!(Timestamp::from_bytes(ts.header_byte(), ts.timestamp_byte()), ts);
    /// ```
    pub fn from_bytes(header: u8, timestamp: u8) -> Self {
        Self((((header & 0x3F) as u16) << 7) | (timestamp & 0x7F) as u16)
    }
}

/// Monotonic millisecond clock used to stamp outbound packets.
///
/// Anchored at construction; each reading is the elapsed time masked to
/// 13 bits.  One clock is owned by each connection session.
#[derive(Debug, Clone, Copy)]
pub struct TimestampClock {
    origin: Instant,
}

impl TimestampClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }

    /// Current 13-bit timestamp.
    pub fn now(&self) -> Timestamp {
        Timestamp::from_millis(self.origin.elapsed().as_millis() as u64)
    }
}

impl Default for TimestampClock {
    fn default() -> Self {
        Self::new()
    }
}

// ── Encoding ─────────────────────────────────────────────────────────────────

/// `true` when `event` is a complete System Exclusive message
/// (`0xF0 … 0xF7`).
pub fn is_sysex(event: &[u8]) -> bool {
    event.len() >= 2 && event[0] == SYSEX_START && event[event.len() - 1] == SYSEX_END
}

/// Encode one MIDI message into a BLE-MIDI packet stamped with `ts`.
///
/// Non-SysEx messages are copied verbatim after the header/timestamp pair.
/// SysEx messages get a second timestamp byte in front of the closing `0xF7`:
///
/// ```text
/// [header][ts][F0 … data …][ts][F7]
/// ```
///
/// Callers must not pass an empty slice; the transport filters those out.
///
/// # Example
///
/// ```
/// # use blemidi_rs::protocol::{encode_at, Timestamp};
/// let ts = Timestamp::from_millis(0);
/// assert_eq!(encode_at(&[0x90, 0x43, 0x64], ts), vec![0x80, 0x80, 0x90, 0x43, 0x64]);
/// ```
pub fn encode_at(event: &[u8], ts: Timestamp) -> Vec<u8> {
    let ts_byte = ts.timestamp_byte();
    let mut packet = Vec::with_capacity(event.len() + 3);
    packet.push(ts.header_byte());
    packet.push(ts_byte);

    if is_sysex(event) {
        packet.extend_from_slice(&event[..event.len() - 1]);
        packet.push(ts_byte);
        packet.push(SYSEX_END);
    } else {
        packet.extend_from_slice(event);
    }
    packet
}

/// Encode one MIDI message using the current reading of `clock`.
pub fn encode(event: &[u8], clock: &TimestampClock) -> Vec<u8> {
    encode_at(event, clock.now())
}
