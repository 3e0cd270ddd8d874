//! Decoders for inbound BLE-MIDI characteristic payloads.
//!
//! All functions here are pure and never fail: malformed or truncated input
//! yields fewer events, never an error.
//!
//! # Packet layout
//!
//! ```text
//! [header][ts][status data…]([ts][status data…] | [data…])*
//! ```
//!
//! * `header` has bit 7 set; its low 6 bits are the high timestamp bits.
//! * Each full message is preceded by a timestamp byte (bit 7 set).
//! * Data bytes without a new status reuse the running status.
//! * A SysEx run `F0 … F7` may carry timestamp bytes between data bytes and
//!   always carries one right before `F7`; both are stripped on decode.
//!
//! | Item | Purpose |
//! |---|---|
//! | [`decode`] / [`PacketDecoder`] | Lazily split one notification into complete MIDI messages |
//! | [`SysExAssembler`] | Same, but carries an unterminated SysEx run into the next notification |
//! | [`packet_timestamp`] | Header/timestamp pair of a packet |
//! | [`parse_midi_message`] | Raw message bytes → typed [`MidiMessage`] |

use std::fmt;

use log::{debug, warn};

use crate::protocol::{Timestamp, REALTIME_FIRST, SYSEX_END, SYSEX_START};
use crate::types::MidiEventBytes;

// ── Packet decoding ───────────────────────────────────────────────────────────

/// Split one BLE-MIDI notification into complete MIDI messages.
///
/// The returned iterator is finite and consumed once.  A trailing message or
/// SysEx run that is not complete by the end of the buffer is dropped.
///
/// ```
/// # use blemidi_rs::parse::decode;
/// let events: Vec<_> = decode(&[0x80, 0x80, 0x90, 0x43, 0x64]).collect();
/// assert_eq!(events.len(), 1);
/// assert_eq!(events[0].as_bytes(), &[0x90, 0x43, 0x64]);
/// ```
pub fn decode(buffer: &[u8]) -> PacketDecoder<'_> {
    PacketDecoder::new(buffer)
}

/// Timestamp carried by a packet's header and first timestamp byte.
///
/// Returns `None` for buffers shorter than two bytes or without the marker bits.
pub fn packet_timestamp(buffer: &[u8]) -> Option<Timestamp> {
    match buffer {
        [header, ts, ..] if header & 0x80 != 0 && ts & 0x80 != 0 => {
            Some(Timestamp::from_bytes(*header, *ts))
        }
        _ => None,
    }
}

/// Iterator over the complete MIDI messages in one notification.
///
/// Created by [`decode`].
pub struct PacketDecoder<'a> {
    buf: &'a [u8],
    pos: usize,
    running_status: Option<u8>,
    /// SysEx run in progress, `F0` included.
    sysex: Option<Vec<u8>>,
}

impl<'a> PacketDecoder<'a> {
    fn new(buf: &'a [u8]) -> Self {
        // Anything without a header byte is not a BLE-MIDI packet; start at
        // the end so the iterator is empty.
        let pos = match buf.first() {
            Some(header) if header & 0x80 != 0 => 1,
            _ => buf.len(),
        };
        Self {
            buf,
            pos,
            running_status: None,
            sysex: None,
        }
    }

    /// Continue a SysEx run that an earlier notification left open.
    fn resume(buf: &'a [u8], pending: Vec<u8>) -> Self {
        let mut decoder = Self::new(buf);
        if decoder.pos < buf.len() {
            decoder.sysex = Some(pending);
        }
        decoder
    }

    /// Unterminated SysEx run left at the end of the buffer, if any.
    fn into_pending(self) -> Option<Vec<u8>> {
        self.sysex
    }

    /// Consume `count` data bytes after `status`.
    ///
    /// Returns `None` and leaves the cursor on the interrupting byte when a
    /// status/timestamp byte or the end of the buffer cuts the message short.
    fn take_data(&mut self, status: u8, count: usize) -> Option<MidiEventBytes> {
        let mut message = Vec::with_capacity(count + 1);
        message.push(status);
        for _ in 0..count {
            match self.buf.get(self.pos) {
                Some(&b) if b & 0x80 == 0 => {
                    message.push(b);
                    self.pos += 1;
                }
                Some(_) => {
                    debug!("BLE-MIDI: message {status:02X} interrupted, dropping {message:02X?}");
                    return None;
                }
                None => {
                    debug!("BLE-MIDI: truncated message {message:02X?} at end of packet");
                    return None;
                }
            }
        }
        Some(MidiEventBytes::new(message))
    }

    /// Skip data bytes that have no status to attach to.
    fn skip_orphan_data(&mut self) {
        let start = self.pos;
        while self.buf.get(self.pos).is_some_and(|b| b & 0x80 == 0) {
            self.pos += 1;
        }
        debug!("BLE-MIDI: skipped {} data byte(s) without status", self.pos - start);
    }

    /// Decode a message that starts with `status` (cursor already past it).
    fn message(&mut self, status: u8) -> Option<MidiEventBytes> {
        match status {
            SYSEX_START => {
                self.running_status = None;
                self.sysex = Some(vec![SYSEX_START]);
                None
            }
            // Real-time bytes leave running status untouched.
            REALTIME_FIRST..=0xFF => Some(MidiEventBytes::new(vec![status])),
            0xF1 | 0xF3 => {
                self.running_status = None;
                self.take_data(status, 1)
            }
            0xF2 => {
                self.running_status = None;
                self.take_data(status, 2)
            }
            0xF6 => {
                self.running_status = None;
                Some(MidiEventBytes::new(vec![status]))
            }
            0xF4 | 0xF5 | SYSEX_END => {
                self.running_status = None;
                debug!("BLE-MIDI: ignoring stray status {status:02X}");
                None
            }
            0x80..=0xEF => {
                self.running_status = Some(status);
                let data_len = match status & 0xF0 {
                    0xC0 | 0xD0 => 1,
                    _ => 2,
                };
                self.take_data(status, data_len)
            }
            _ => None,
        }
    }

    /// Advance inside a SysEx run by one step.  Returns an event when the run
    /// completes or a real-time byte is interleaved.
    fn step_sysex(&mut self) -> Option<MidiEventBytes> {
        let b = self.buf[self.pos];

        if b & 0x80 == 0 {
            if let Some(run) = self.sysex.as_mut() {
                run.push(b);
            }
            self.pos += 1;
            return None;
        }
        // Timestamp bytes span 0x80..=0xFF, so a high byte is classified by
        // the byte after it.
        let next = self.buf.get(self.pos + 1).copied();
        match next {
            Some(SYSEX_END) => {
                self.pos += 2;
                self.finish_sysex()
            }
            // `[ts][realtime]`, even when the timestamp byte itself reads F7.
            Some(rt) if rt >= REALTIME_FIRST => {
                self.pos += 2;
                Some(MidiEventBytes::new(vec![rt]))
            }
            // Bare EOX without its timestamp.
            None | Some(0x80..=0xF6) if b == SYSEX_END => {
                self.pos += 1;
                self.finish_sysex()
            }
            Some(next) if next & 0x80 != 0 => {
                // A new message begins before F7: the run is abandoned and the
                // cursor stays on the timestamp for the boundary logic.
                if let Some(run) = self.sysex.take() {
                    debug!("BLE-MIDI: SysEx interrupted after {} byte(s), dropping", run.len());
                }
                None
            }
            _ => {
                // Interleaved timestamp inside the run, or a trailing one.
                self.pos += 1;
                None
            }
        }
    }

    fn finish_sysex(&mut self) -> Option<MidiEventBytes> {
        self.sysex.take().map(|mut run| {
            run.push(SYSEX_END);
            MidiEventBytes::new(run)
        })
    }
}

impl Iterator for PacketDecoder<'_> {
    type Item = MidiEventBytes;

    fn next(&mut self) -> Option<MidiEventBytes> {
        while self.pos < self.buf.len() {
            if self.sysex.is_some() {
                if let Some(event) = self.step_sysex() {
                    return Some(event);
                }
                continue;
            }

            let b = self.buf[self.pos];
            let status = if b & 0x80 != 0 {
                // Timestamp byte, followed by a status or running-status data.
                self.pos += 1;
                match self.buf.get(self.pos).copied() {
                    None => return None,
                    Some(s) if s & 0x80 != 0 => {
                        self.pos += 1;
                        s
                    }
                    Some(_) => match self.running_status {
                        Some(s) => s,
                        None => {
                            self.skip_orphan_data();
                            continue;
                        }
                    },
                }
            } else {
                match self.running_status {
                    Some(s) => s,
                    None => {
                        self.skip_orphan_data();
                        continue;
                    }
                }
            };

            if let Some(event) = self.message(status) {
                return Some(event);
            }
        }
        None
    }
}

// ── SysEx reassembly across notifications ─────────────────────────────────────

/// Upper bound on a SysEx run carried between notifications.
pub const MAX_SYSEX_LEN: usize = 64 * 1024;

/// Stateful decoder for one notification stream.
///
/// Behaves like [`decode`] per notification, except that a SysEx run still
/// open at the end of a notification is kept and resumed by the next one
/// (a BLE-MIDI continuation packet is a header byte followed directly by
/// more SysEx data).  Create one per connection.
#[derive(Debug, Default)]
pub struct SysExAssembler {
    pending: Option<Vec<u8>>,
}

impl SysExAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode one notification, returning every complete message in it.
    pub fn push(&mut self, buffer: &[u8]) -> Vec<MidiEventBytes> {
        let mut decoder = match self.pending.take() {
            Some(run) => PacketDecoder::resume(buffer, run),
            None => PacketDecoder::new(buffer),
        };
        let events: Vec<MidiEventBytes> = decoder.by_ref().collect();

        self.pending = decoder.into_pending().filter(|run| {
            if run.len() > MAX_SYSEX_LEN {
                warn!("BLE-MIDI: SysEx exceeds {MAX_SYSEX_LEN} bytes, dropping");
                false
            } else {
                true
            }
        });
        events
    }

    /// `true` while a SysEx run is waiting for its continuation.
    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Forget any partial run (call on disconnect).
    pub fn reset(&mut self) {
        self.pending = None;
    }
}

// ── Typed MIDI messages ───────────────────────────────────────────────────────

/// A decoded MIDI 1.0 message.  Channels are 0-based.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MidiMessage {
    NoteOff { channel: u8, note: u8, velocity: u8 },
    NoteOn { channel: u8, note: u8, velocity: u8 },
    PolyPressure { channel: u8, note: u8, pressure: u8 },
    ControlChange { channel: u8, controller: u8, value: u8 },
    ProgramChange { channel: u8, program: u8 },
    ChannelPressure { channel: u8, pressure: u8 },
    /// 14-bit value, centre 8192.
    PitchBend { channel: u8, value: u16 },
    /// Bytes between `F0` and `F7`, exclusive.
    SysEx(Vec<u8>),
    TimeCodeQuarterFrame(u8),
    SongPosition(u16),
    SongSelect(u8),
    TuneRequest,
    Clock,
    Start,
    Continue,
    Stop,
    ActiveSensing,
    Reset,
}

/// Parse one complete message as produced by [`decode`].
///
/// Returns `None` for incomplete, over-long or undefined messages.
pub fn parse_midi_message(bytes: &[u8]) -> Option<MidiMessage> {
    let (&status, data) = bytes.split_first()?;
    if status & 0x80 == 0 || data.iter().any(|&b| b & 0x80 != 0 && status != SYSEX_START) {
        return None;
    }
    let channel = status & 0x0F;
    let two = |data: &[u8]| match data {
        [a, b] => Some((*a, *b)),
        _ => None,
    };
    let one = |data: &[u8]| match data {
        [a] => Some(*a),
        _ => None,
    };

    let message = match status & 0xF0 {
        0x80 => {
            let (note, velocity) = two(data)?;
            MidiMessage::NoteOff { channel, note, velocity }
        }
        0x90 => {
            let (note, velocity) = two(data)?;
            MidiMessage::NoteOn { channel, note, velocity }
        }
        0xA0 => {
            let (note, pressure) = two(data)?;
            MidiMessage::PolyPressure { channel, note, pressure }
        }
        0xB0 => {
            let (controller, value) = two(data)?;
            MidiMessage::ControlChange { channel, controller, value }
        }
        0xC0 => MidiMessage::ProgramChange { channel, program: one(data)? },
        0xD0 => MidiMessage::ChannelPressure { channel, pressure: one(data)? },
        0xE0 => {
            let (lsb, msb) = two(data)?;
            MidiMessage::PitchBend {
                channel,
                value: ((msb as u16) << 7) | lsb as u16,
            }
        }
        _ => match status {
            SYSEX_START => {
                let (&last, body) = data.split_last()?;
                if last != SYSEX_END || body.iter().any(|&b| b & 0x80 != 0) {
                    return None;
                }
                MidiMessage::SysEx(body.to_vec())
            }
            0xF1 => MidiMessage::TimeCodeQuarterFrame(one(data)?),
            0xF2 => {
                let (lsb, msb) = two(data)?;
                MidiMessage::SongPosition(((msb as u16) << 7) | lsb as u16)
            }
            0xF3 => MidiMessage::SongSelect(one(data)?),
            0xF6 if data.is_empty() => MidiMessage::TuneRequest,
            0xF8 if data.is_empty() => MidiMessage::Clock,
            0xFA if data.is_empty() => MidiMessage::Start,
            0xFB if data.is_empty() => MidiMessage::Continue,
            0xFC if data.is_empty() => MidiMessage::Stop,
            0xFE if data.is_empty() => MidiMessage::ActiveSensing,
            0xFF if data.is_empty() => MidiMessage::Reset,
            _ => return None,
        },
    };
    Some(message)
}

impl fmt::Display for MidiMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoteOff { channel, note, velocity } => {
                write!(f, "NoteOff ch{} note {note} vel {velocity}", channel + 1)
            }
            Self::NoteOn { channel, note, velocity } => {
                write!(f, "NoteOn ch{} note {note} vel {velocity}", channel + 1)
            }
            Self::PolyPressure { channel, note, pressure } => {
                write!(f, "PolyPressure ch{} note {note} pressure {pressure}", channel + 1)
            }
            Self::ControlChange { channel, controller, value } => {
                write!(f, "CC ch{} #{controller} = {value}", channel + 1)
            }
            Self::ProgramChange { channel, program } => {
                write!(f, "ProgramChange ch{} {program}", channel + 1)
            }
            Self::ChannelPressure { channel, pressure } => {
                write!(f, "ChannelPressure ch{} {pressure}", channel + 1)
            }
            Self::PitchBend { channel, value } => write!(f, "PitchBend ch{} {value}", channel + 1),
            Self::SysEx(body) => write!(f, "SysEx {} byte(s) {body:02X?}", body.len()),
            Self::TimeCodeQuarterFrame(v) => write!(f, "MTC quarter frame {v}"),
            Self::SongPosition(v) => write!(f, "SongPosition {v}"),
            Self::SongSelect(v) => write!(f, "SongSelect {v}"),
            Self::TuneRequest => f.write_str("TuneRequest"),
            Self::Clock => f.write_str("Clock"),
            Self::Start => f.write_str("Start"),
            Self::Continue => f.write_str("Continue"),
            Self::Stop => f.write_str("Stop"),
            Self::ActiveSensing => f.write_str("ActiveSensing"),
            Self::Reset => f.write_str("Reset"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::encode_at;

    fn decode_all(buf: &[u8]) -> Vec<Vec<u8>> {
        decode(buf).map(MidiEventBytes::into_bytes).collect()
    }

    #[test]
    fn single_note_on() {
        assert_eq!(decode_all(&[0x80, 0x80, 0x90, 0x43, 0x64]), vec![vec![0x90, 0x43, 0x64]]);
    }

    #[test]
    fn channel_messages_survive_encode_decode() {
        let messages: [&[u8]; 6] = [
            &[0x90, 0x43, 0x64],
            &[0x80, 0x43, 0x00],
            &[0xB2, 0x07, 0x7F],
            &[0xC5, 0x10],
            &[0xD0, 0x33],
            &[0xEF, 0x00, 0x40],
        ];
        for (i, m) in messages.iter().enumerate() {
            let packet = encode_at(m, Timestamp::from_millis(i as u64 * 977));
            assert_eq!(decode_all(&packet), vec![m.to_vec()], "message {m:02X?}");
        }
    }

    #[test]
    fn sysex_survives_encode_decode() {
        let sysex = [0xF0, 0x00, 0x02, 0x05, 0x01, 0x26, 0x00, 0x08, 0x30, 0x1B, 0xF7];
        let packet = encode_at(&sysex, Timestamp::from_millis(8000));
        assert_eq!(decode_all(&packet), vec![sysex.to_vec()]);
    }

    #[test]
    fn sysex_with_realtime_looking_timestamp_byte() {
        // Low timestamp bits 0x78 make the timestamp byte 0xF8.
        let sysex = [0xF0, 0x7D, 0x10, 0xF7];
        let packet = encode_at(&sysex, Timestamp::from_millis(0x78));
        assert_eq!(packet, vec![0x80, 0xF8, 0xF0, 0x7D, 0x10, 0xF8, 0xF7]);
        assert_eq!(decode_all(&packet), vec![sysex.to_vec()]);
    }

    #[test]
    fn several_messages_with_running_timestamps() {
        let buf = [0x81, 0x82, 0x90, 0x3C, 0x40, 0x83, 0x80, 0x3C, 0x00, 0x84, 0xC1, 0x05];
        assert_eq!(
            decode_all(&buf),
            vec![vec![0x90, 0x3C, 0x40], vec![0x80, 0x3C, 0x00], vec![0xC1, 0x05]]
        );
    }

    #[test]
    fn running_status_with_and_without_timestamp() {
        let buf = [0x80, 0x80, 0x90, 0x3C, 0x40, 0x3E, 0x41, 0x81, 0x40, 0x42];
        assert_eq!(
            decode_all(&buf),
            vec![vec![0x90, 0x3C, 0x40], vec![0x90, 0x3E, 0x41], vec![0x90, 0x40, 0x42]]
        );
    }

    #[test]
    fn interleaved_timestamps_are_stripped_from_sysex() {
        let buf = [0x80, 0x81, 0xF0, 0x7E, 0x82, 0x01, 0x02, 0x83, 0xF7];
        assert_eq!(decode_all(&buf), vec![vec![0xF0, 0x7E, 0x01, 0x02, 0xF7]]);
    }

    #[test]
    fn realtime_inside_sysex_is_its_own_event() {
        let buf = [0x80, 0x81, 0xF0, 0x01, 0x82, 0xF8, 0x02, 0x83, 0xF7];
        assert_eq!(decode_all(&buf), vec![vec![0xF8], vec![0xF0, 0x01, 0x02, 0xF7]]);
    }

    #[test]
    fn eox_looking_timestamp_before_realtime_keeps_the_run() {
        // Low timestamp bits 0x77 make the interleaved timestamp byte 0xF7.
        let buf = [0x80, 0x81, 0xF0, 0x01, 0xF7, 0xF8, 0x02, 0x83, 0xF7];
        assert_eq!(decode_all(&buf), vec![vec![0xF8], vec![0xF0, 0x01, 0x02, 0xF7]]);
    }

    #[test]
    fn bare_eox_still_terminates() {
        assert_eq!(decode_all(&[0x80, 0x81, 0xF0, 0x01, 0xF7]), vec![vec![0xF0, 0x01, 0xF7]]);
        assert_eq!(
            decode_all(&[0x80, 0x81, 0xF0, 0x01, 0xF7, 0x82, 0xC0, 0x05]),
            vec![vec![0xF0, 0x01, 0xF7], vec![0xC0, 0x05]]
        );
    }

    #[test]
    fn truncated_tail_is_dropped() {
        assert_eq!(
            decode_all(&[0x80, 0x80, 0x90, 0x43, 0x64, 0x81, 0x90, 0x43]),
            vec![vec![0x90, 0x43, 0x64]]
        );
        assert_eq!(
            decode_all(&[0x80, 0x80, 0xB0, 0x01, 0x02, 0x81, 0xF0, 0x01, 0x02]),
            vec![vec![0xB0, 0x01, 0x02]]
        );
    }

    #[test]
    fn interrupted_sysex_is_dropped_and_next_message_kept() {
        let buf = [0x80, 0x80, 0xF0, 0x01, 0x02, 0x81, 0x90, 0x43, 0x64];
        assert_eq!(decode_all(&buf), vec![vec![0x90, 0x43, 0x64]]);
    }

    #[test]
    fn degenerate_buffers_yield_nothing() {
        assert!(decode_all(&[]).is_empty());
        assert!(decode_all(&[0x80]).is_empty());
        assert!(decode_all(&[0x80, 0x80]).is_empty());
        assert!(decode_all(&[0x10, 0x80, 0x90, 0x43, 0x64]).is_empty());
        assert!(decode_all(&[0x80, 0x43, 0x64]).is_empty());
    }

    #[test]
    fn packet_timestamp_reads_header_pair() {
        let ts = Timestamp::from_millis(4321);
        let packet = encode_at(&[0xF8], ts);
        assert_eq!(packet_timestamp(&packet), Some(ts));
        assert_eq!(packet_timestamp(&[0x80]), None);
        assert_eq!(packet_timestamp(&[0x80, 0x01]), None);
    }

    #[test]
    fn assembler_joins_sysex_across_notifications() {
        let mut asm = SysExAssembler::new();
        assert!(asm.push(&[0x80, 0x80, 0xF0, 0x43, 0x12]).is_empty());
        assert!(asm.is_pending());
        assert!(asm.push(&[0x80, 0x00, 0x01]).is_empty());
        let events = asm.push(&[0x81, 0x02, 0x85, 0xF7, 0x86, 0x90, 0x40, 0x7F]);
        assert!(!asm.is_pending());
        assert_eq!(
            events.into_iter().map(MidiEventBytes::into_bytes).collect::<Vec<_>>(),
            vec![vec![0xF0, 0x43, 0x12, 0x00, 0x01, 0x02, 0xF7], vec![0x90, 0x40, 0x7F]]
        );
    }

    #[test]
    fn assembler_drops_run_when_new_message_starts() {
        let mut asm = SysExAssembler::new();
        assert!(asm.push(&[0x80, 0x80, 0xF0, 0x43]).is_empty());
        let events = asm.push(&[0x80, 0x81, 0x90, 0x40, 0x7F]);
        assert_eq!(events, vec![MidiEventBytes::new(vec![0x90, 0x40, 0x7F])]);
        assert!(!asm.is_pending());
    }

    #[test]
    fn assembler_drops_oversized_run() {
        let mut asm = SysExAssembler::new();
        assert!(asm.push(&[0x80, 0x80, 0xF0, 0x43]).is_empty());
        assert!(asm.is_pending());

        let mut continuation = vec![0x80];
        continuation.resize(MAX_SYSEX_LEN + 1, 0x11);
        assert!(asm.push(&continuation).is_empty());
        assert!(!asm.is_pending());

        // The tail of the dropped run is orphan data, not a new SysEx.
        assert!(asm.push(&[0x81, 0x11, 0x82, 0xF7]).is_empty());
    }

    #[test]
    fn assembler_reset_forgets_partial_run() {
        let mut asm = SysExAssembler::new();
        asm.push(&[0x80, 0x80, 0xF0, 0x43]);
        asm.reset();
        assert!(asm.push(&[0x80, 0x01, 0x02, 0x81, 0xF7]).is_empty());
    }

    #[test]
    fn typed_parsing() {
        assert_eq!(
            parse_midi_message(&[0x90, 67, 100]),
            Some(MidiMessage::NoteOn { channel: 0, note: 67, velocity: 100 })
        );
        assert_eq!(
            parse_midi_message(&[0xE3, 0x00, 0x40]),
            Some(MidiMessage::PitchBend { channel: 3, value: 8192 })
        );
        assert_eq!(
            parse_midi_message(&[0xF0, 0x02, 0x05, 0xF7]),
            Some(MidiMessage::SysEx(vec![0x02, 0x05]))
        );
        assert_eq!(parse_midi_message(&[0xF8]), Some(MidiMessage::Clock));
        assert_eq!(parse_midi_message(&[0x90, 67]), None);
        assert_eq!(parse_midi_message(&[0x43, 0x64]), None);
        assert_eq!(parse_midi_message(&[]), None);
        assert_eq!(parse_midi_message(&[0xF0, 0x02]), None);
    }

    #[test]
    fn display_is_human_readable() {
        let m = parse_midi_message(&[0x91, 60, 90]).unwrap();
        assert_eq!(m.to_string(), "NoteOn ch2 note 60 vel 90");
    }
}
