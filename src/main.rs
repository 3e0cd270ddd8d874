use std::io::{self, BufRead};

use anyhow::Result;
use log::{info, warn};

use blemidi_rs::parse::parse_midi_message;
use blemidi_rs::transport::{BleMidiTransport, TransportConfig};
use blemidi_rs::types::{MidiEventBytes, TransportEvent};

/// Demo note: G4 on channel 1.
const DEMO_NOTE: u8 = 67;
const DEMO_VELOCITY: u8 = 100;
/// Manufacturer id `00 02 05` followed by a short payload.
const DEMO_SYSEX_MANUFACTURER: [u8; 3] = [0x00, 0x02, 0x05];
const DEMO_SYSEX_DATA: [u8; 6] = [0x01, 0x26, 0x00, 0x08, 0x30, 0x1B];

#[tokio::main]
async fn main() -> Result<()> {
    // ── Logging ───────────────────────────────────────────────────────────────
    // Set RUST_LOG=debug for verbose output, e.g.:
    //   RUST_LOG=blemidi_rs=debug cargo run
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    // ── Start ─────────────────────────────────────────────────────────────────
    let config = TransportConfig::default();
    info!("Starting BLE-MIDI transport …");
    let (mut rx, transport) = BleMidiTransport::start(config).await?;

    info!("Commands (type + Enter):");
    info!("  l      – list discovered peripherals");
    info!("  c <n>  – connect to the n-th discovered peripheral");
    info!("  d      – disconnect");
    info!("  n / o  – send note on / note off");
    info!("  x      – send a SysEx message");
    info!("  f      – forget the bound peripheral");
    info!("  q      – quit\n");

    // ── Stdin command loop ────────────────────────────────────────────────────
    // Lines are read on a dedicated OS thread and relayed to the async side.
    let (line_tx, mut line_rx) = tokio::sync::mpsc::unbounded_channel::<String>();

    std::thread::spawn(move || {
        let stdin = io::stdin();
        for line in stdin.lock().lines() {
            match line {
                Ok(l) => {
                    if line_tx.send(l.trim().to_owned()).is_err() {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
    });

    // ── Status watcher ────────────────────────────────────────────────────────
    let mut status_rx = transport.subscribe_status();
    tokio::spawn(async move {
        let mut last = status_rx.borrow().connection;
        while status_rx.changed().await.is_ok() {
            let status = status_rx.borrow_and_update().clone();
            if status.connection != last {
                info!("State: {:?} → {:?}", last, status.connection);
                last = status.connection;
            }
        }
    });

    // ── Main event loop ───────────────────────────────────────────────────────
    loop {
        tokio::select! {
            event = rx.recv() => match event {
                Some(TransportEvent::Connected(p)) => {
                    info!("✅  Connected to: {} [{}]", p.display_name(), p.id);
                }
                Some(TransportEvent::Disconnected(id)) => {
                    info!("❌  Disconnected from {id}");
                }
                Some(TransportEvent::Midi { event, .. }) => match parse_midi_message(&event) {
                    Some(msg) => println!("[MIDI] {msg}  ({event})"),
                    None => println!("[MIDI] {event}"),
                },
                // The session ended on its own; shutdown() reports why.
                None => break,
            },
            line = line_rx.recv() => match line {
                Some(line) => {
                    if !run_command(&transport, &line) {
                        info!("Quit requested.");
                        break;
                    }
                }
                None => break,
            },
        }
    }

    transport.shutdown().await?;
    info!("Event loop finished – exiting.");
    Ok(())
}

/// Execute one stdin command.  Returns `false` on quit.
fn run_command(transport: &BleMidiTransport, line: &str) -> bool {
    let mut words = line.split_whitespace();
    let Some(cmd) = words.next() else {
        return true;
    };
    match cmd {
        "q" => return false,
        "l" => {
            let status = transport.status();
            println!(
                "[STATUS] {:?}  scanning={}  peripheral={}",
                status.connection,
                status.scanning,
                status
                    .peripheral
                    .as_ref()
                    .map(|p| p.display_name())
                    .unwrap_or("-")
            );
            for (i, p) in status.discovered.iter().enumerate() {
                println!("  [{i}] {:24} {}", p.display_name(), p.id);
            }
        }
        "c" => {
            let discovered = transport.discovered_peripherals();
            match words.next().and_then(|n| n.parse::<usize>().ok()) {
                Some(n) if n < discovered.len() => transport.connect(&discovered[n].id),
                _ => warn!("Usage: c <n>, with n from the `l` listing"),
            }
        }
        "d" => transport.disconnect(),
        "n" => transport.send(MidiEventBytes::note_on(0, DEMO_NOTE, DEMO_VELOCITY)),
        "o" => transport.send(MidiEventBytes::note_off(0, DEMO_NOTE, 0)),
        "x" => transport.send(MidiEventBytes::sysex(
            &DEMO_SYSEX_MANUFACTURER,
            &DEMO_SYSEX_DATA,
        )),
        "f" => {
            info!("Forgetting bound peripheral.");
            transport.forget_device();
        }
        other => warn!("Unknown command '{other}'"),
    }
    true
}
