//! # blemidi-rs
//!
//! Async Rust BLE-MIDI central: talk MIDI to Bluetooth Low Energy
//! instruments and controllers through [btleplug](https://docs.rs/btleplug).
//!
//! ## What it does
//!
//! | Concern | Behaviour |
//! |---|---|
//! | Discovery | scans with the BLE-MIDI service UUID as filter; duplicates suppressed by peripheral id |
//! | Connection | single active link; connect → discover services → discover characteristics → subscribe |
//! | Reconnection | the first peripheral connected successfully is bound and persisted; on power-on or link loss the session reconnects to it directly, or rescans |
//! | Outbound | MIDI messages are stamped with a 13-bit millisecond timestamp and written without response |
//! | Inbound | notifications are split into complete MIDI messages (running status, interleaved timestamps, SysEx reassembly) |
//!
//! Every radio callback is funnelled through one session task, so the
//! connection state, scanning flag and discovered list are always observed
//! together in a consistent [`types::TransportStatus`] snapshot.
//!
//! ## Quick start
//!
//! ```no_run
//! use blemidi_rs::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let (mut rx, transport) = BleMidiTransport::start(TransportConfig::default()).await?;
//!
//!     while let Some(event) = rx.recv().await {
//!         match event {
//!             TransportEvent::Connected(p) => {
//!                 println!("connected to {}", p.display_name());
//!                 transport.send(MidiEventBytes::note_on(0, 67, 100));
//!             }
//!             TransportEvent::Midi { event, .. } => match parse_midi_message(&event) {
//!                 Some(msg) => println!("{msg}"),
//!                 None => println!("{event}"),
//!             },
//!             TransportEvent::Disconnected(_) => {}
//!         }
//!     }
//!     transport.shutdown().await
//! }
//! ```
//!
//! ## Module overview
//!
//! | Module | Purpose |
//! |---|---|
//! | [`prelude`] | One-line glob import of the most commonly needed types |
//! | [`transport`] | [`transport::BleMidiTransport`] facade, configuration and the session task |
//! | [`machine`] | Sans-IO connection state machine and the radio request/event vocabulary |
//! | [`radio`] | btleplug driver executing radio requests |
//! | [`registry`] | Persistence of the bound peripheral |
//! | [`types`] | Identifiers, states, MIDI byte runs and application events |
//! | [`protocol`] | GATT UUIDs, the 13-bit packet clock and BLE-MIDI packet encoding |
//! | [`parse`] | BLE-MIDI packet decoding and typed MIDI message parsing |

pub mod machine;
pub mod parse;
pub mod protocol;
pub mod radio;
pub mod registry;
pub mod transport;
pub mod types;

// ── Prelude ───────────────────────────────────────────────────────────────────

/// Convenience re-exports for downstream crates.
pub mod prelude {
    // ── Transport ─────────────────────────────────────────────────────────────
    pub use crate::transport::{BleMidiTransport, TransportConfig};

    // ── Events and data types ─────────────────────────────────────────────────
    pub use crate::types::{
        ConnectionState, MidiEventBytes, PeripheralId, PeripheralInfo, TransportEvent,
        TransportStatus,
    };

    // ── Codec ─────────────────────────────────────────────────────────────────
    pub use crate::parse::{decode, parse_midi_message, MidiMessage};
    pub use crate::protocol::{
        encode, encode_at, Timestamp, TimestampClock, MIDI_CHARACTERISTIC_UUID, MIDI_SERVICE_UUID,
    };
}
