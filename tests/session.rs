//! End-to-end tests of the transport session over a scripted radio.
//!
//! The radio side is a bare [`RadioEndpoint`]: each test posts the events a
//! BLE stack would report and checks the requests the session issues in
//! response.

use std::time::Duration;

use blemidi_rs::machine::{RadioEvent, RadioRequest, WriteMode};
use blemidi_rs::protocol::{MIDI_CHARACTERISTIC_UUID, MIDI_SERVICE_UUID};
use blemidi_rs::radio::{radio_channel, RadioEndpoint};
use blemidi_rs::registry::{
    DeviceRegistry, JsonFileStore, KeyValueStore, MemoryStore, BOUND_PERIPHERAL_KEY,
};
use blemidi_rs::transport::{BleMidiTransport, TransportConfig};
use blemidi_rs::types::{
    AdapterState, ConnectionState, MidiEventBytes, PeripheralId, PeripheralInfo, TransportEvent,
    TransportStatus,
};
use tokio::sync::mpsc;

const WAIT: Duration = Duration::from_secs(2);

struct FakeRadio {
    endpoint: RadioEndpoint,
}

impl FakeRadio {
    fn emit(&self, event: RadioEvent) {
        self.endpoint.events.send(event).expect("session is gone");
    }

    async fn next_request(&mut self) -> RadioRequest {
        tokio::time::timeout(WAIT, self.endpoint.requests.recv())
            .await
            .expect("timed out waiting for a radio request")
            .expect("session closed the request channel")
    }

    fn power_on(&self, known: Vec<PeripheralInfo>) {
        self.emit(RadioEvent::AdapterState {
            state: AdapterState::PoweredOn,
            known,
        });
    }

    /// Answer the discovery sequence for `id` after a `Connect` request.
    async fn accept_connection(&mut self, id: &PeripheralId) {
        self.emit(RadioEvent::Connected { id: id.clone() });
        assert_eq!(
            self.next_request().await,
            RadioRequest::DiscoverServices {
                id: id.clone(),
                services: vec![MIDI_SERVICE_UUID],
            }
        );
        self.emit(RadioEvent::ServicesDiscovered {
            id: id.clone(),
            services: vec![MIDI_SERVICE_UUID],
        });
        assert_eq!(
            self.next_request().await,
            RadioRequest::DiscoverCharacteristics {
                id: id.clone(),
                service: MIDI_SERVICE_UUID,
            }
        );
        self.emit(RadioEvent::CharacteristicsDiscovered {
            id: id.clone(),
            service: MIDI_SERVICE_UUID,
            characteristics: vec![MIDI_CHARACTERISTIC_UUID],
        });
        assert_eq!(
            self.next_request().await,
            RadioRequest::SetNotify {
                id: id.clone(),
                characteristic: MIDI_CHARACTERISTIC_UUID,
                enabled: true,
            }
        );
        self.emit(RadioEvent::NotifyStateChanged {
            id: id.clone(),
            characteristic: MIDI_CHARACTERISTIC_UUID,
            enabled: true,
        });
    }
}

fn id(s: &str) -> PeripheralId {
    PeripheralId::parse(s).unwrap()
}

fn synth(s: &str) -> PeripheralInfo {
    PeripheralInfo::new(id(s), Some("WIDI Master".into()))
}

fn scan_request() -> RadioRequest {
    RadioRequest::StartScan {
        services: vec![MIDI_SERVICE_UUID],
    }
}

fn start(
    store: Box<dyn KeyValueStore>,
) -> (mpsc::Receiver<TransportEvent>, BleMidiTransport, FakeRadio) {
    let (link, endpoint) = radio_channel();
    let (rx, transport) = BleMidiTransport::with_radio(&TransportConfig::default(), store, link);
    (rx, transport, FakeRadio { endpoint })
}

async fn next_event(rx: &mut mpsc::Receiver<TransportEvent>) -> TransportEvent {
    tokio::time::timeout(WAIT, rx.recv())
        .await
        .expect("timed out waiting for a transport event")
        .expect("event channel closed")
}

async fn wait_status(transport: &BleMidiTransport, pred: impl FnMut(&TransportStatus) -> bool) {
    let mut status = transport.subscribe_status();
    tokio::time::timeout(WAIT, status.wait_for(pred))
        .await
        .expect("timed out waiting for status")
        .expect("status channel closed");
}

/// Power on, discover `p` and connect to it through the whole GATT sequence.
async fn connect_ready(
    rx: &mut mpsc::Receiver<TransportEvent>,
    transport: &BleMidiTransport,
    radio: &mut FakeRadio,
    p: &str,
) {
    radio.power_on(vec![]);
    assert_eq!(radio.next_request().await, scan_request());
    radio.emit(RadioEvent::Discovered(synth(p)));
    wait_status(transport, |s| s.discovered.len() == 1).await;

    transport.connect(&id(p));
    assert_eq!(radio.next_request().await, RadioRequest::StopScan);
    assert_eq!(radio.next_request().await, RadioRequest::Connect { id: id(p) });
    radio.accept_connection(&id(p)).await;
    assert_eq!(next_event(rx).await, TransportEvent::Connected(synth(p)));
}

#[tokio::test]
async fn power_on_without_saved_device_scans() {
    let (_rx, transport, mut radio) = start(Box::new(MemoryStore::new()));
    assert_eq!(transport.connection_status(), ConnectionState::Disconnected);

    radio.power_on(vec![]);
    assert_eq!(radio.next_request().await, scan_request());
    wait_status(&transport, |s| s.scanning).await;
    assert!(transport.scan_status());
    assert_eq!(transport.connection_status(), ConnectionState::Scanning);
}

#[tokio::test]
async fn discovered_peripherals_are_deduplicated() {
    let (_rx, transport, mut radio) = start(Box::new(MemoryStore::new()));
    radio.power_on(vec![]);
    assert_eq!(radio.next_request().await, scan_request());

    radio.emit(RadioEvent::Discovered(synth("a")));
    radio.emit(RadioEvent::Discovered(synth("b")));
    radio.emit(RadioEvent::Discovered(synth("a")));
    wait_status(&transport, |s| s.discovered.len() == 2).await;

    let ids: Vec<_> = transport
        .discovered_peripherals()
        .into_iter()
        .map(|p| p.id)
        .collect();
    assert_eq!(ids, vec![id("a"), id("b")]);
}

#[tokio::test]
async fn saved_device_is_reconnected_directly() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("devices.json");
    {
        let mut registry = DeviceRegistry::new(Box::new(JsonFileStore::open(&path).unwrap()));
        registry.save(&id("a"));
    }

    let (mut rx, transport, mut radio) = start(Box::new(JsonFileStore::open(&path).unwrap()));
    radio.power_on(vec![synth("a")]);
    assert_eq!(radio.next_request().await, RadioRequest::Connect { id: id("a") });
    radio.accept_connection(&id("a")).await;

    assert_eq!(next_event(&mut rx).await, TransportEvent::Connected(synth("a")));
    wait_status(&transport, |s| s.is_ready()).await;
    assert!(!transport.scan_status());
}

#[tokio::test]
async fn first_connection_binds_the_peripheral() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("devices.json");

    let (mut rx, transport, mut radio) = start(Box::new(JsonFileStore::open(&path).unwrap()));
    connect_ready(&mut rx, &transport, &mut radio, "a").await;

    let registry = DeviceRegistry::new(Box::new(JsonFileStore::open(&path).unwrap()));
    assert_eq!(registry.load(), Some(id("a")));
}

#[tokio::test]
async fn inbound_notifications_become_midi_events() {
    let (mut rx, transport, mut radio) = start(Box::new(MemoryStore::new()));
    connect_ready(&mut rx, &transport, &mut radio, "a").await;

    radio.emit(RadioEvent::ValueUpdated {
        id: id("a"),
        characteristic: MIDI_CHARACTERISTIC_UUID,
        value: vec![0x80, 0x80, 0x90, 0x43, 0x64],
    });
    assert_eq!(
        next_event(&mut rx).await,
        TransportEvent::Midi {
            peripheral: id("a"),
            event: vec![0x90, 0x43, 0x64].into(),
        }
    );

    // SysEx split over two notifications.
    radio.emit(RadioEvent::ValueUpdated {
        id: id("a"),
        characteristic: MIDI_CHARACTERISTIC_UUID,
        value: vec![0x80, 0x81, 0xF0, 0x00, 0x02, 0x05],
    });
    radio.emit(RadioEvent::ValueUpdated {
        id: id("a"),
        characteristic: MIDI_CHARACTERISTIC_UUID,
        value: vec![0x80, 0x01, 0x26, 0x82, 0xF7],
    });
    assert_eq!(
        next_event(&mut rx).await,
        TransportEvent::Midi {
            peripheral: id("a"),
            event: vec![0xF0, 0x00, 0x02, 0x05, 0x01, 0x26, 0xF7].into(),
        }
    );
}

#[tokio::test]
async fn send_is_dropped_until_ready() {
    let (mut rx, transport, mut radio) = start(Box::new(MemoryStore::new()));
    radio.power_on(vec![]);
    assert_eq!(radio.next_request().await, scan_request());
    radio.emit(RadioEvent::Discovered(synth("a")));
    wait_status(&transport, |s| !s.discovered.is_empty()).await;

    // Commands are applied in order, so a write would precede StopScan.
    transport.send(MidiEventBytes::note_on(0, 67, 100));
    transport.connect(&id("a"));
    assert_eq!(radio.next_request().await, RadioRequest::StopScan);
    assert_eq!(radio.next_request().await, RadioRequest::Connect { id: id("a") });
    radio.accept_connection(&id("a")).await;
    next_event(&mut rx).await;

    transport.send(MidiEventBytes::note_on(0, 67, 100));
    match radio.next_request().await {
        RadioRequest::Write {
            id: target,
            characteristic,
            value,
            mode,
        } => {
            assert_eq!(target, id("a"));
            assert_eq!(characteristic, MIDI_CHARACTERISTIC_UUID);
            assert_eq!(mode, WriteMode::WithoutResponse);
            assert_eq!(&value[2..], &[0x90, 67, 100]);
        }
        other => panic!("expected a write, got {other:?}"),
    }

    transport.send(MidiEventBytes::sysex(&[0x00, 0x02, 0x05], &[0x01, 0x26]));
    match radio.next_request().await {
        RadioRequest::Write { value, .. } => {
            let n = value.len();
            assert_eq!(value[2], 0xF0);
            assert_eq!(value[n - 1], 0xF7);
            assert_eq!(value[n - 2], value[1]);
        }
        other => panic!("expected a write, got {other:?}"),
    }
}

#[tokio::test]
async fn remote_disconnect_reconnects_to_bound_device() {
    let (mut rx, transport, mut radio) = start(Box::new(MemoryStore::new()));
    connect_ready(&mut rx, &transport, &mut radio, "a").await;

    radio.emit(RadioEvent::Disconnected {
        id: id("a"),
        reason: Some("connection timeout".into()),
    });
    assert_eq!(next_event(&mut rx).await, TransportEvent::Disconnected(id("a")));
    assert_eq!(radio.next_request().await, RadioRequest::Connect { id: id("a") });
    wait_status(&transport, |s| {
        s.connection == ConnectionState::Connecting && s.discovered.is_empty()
    })
    .await;
}

#[tokio::test]
async fn user_disconnect_returns_to_scanning() {
    let (mut rx, transport, mut radio) = start(Box::new(MemoryStore::new()));
    connect_ready(&mut rx, &transport, &mut radio, "a").await;

    transport.disconnect();
    assert_eq!(radio.next_request().await, RadioRequest::Disconnect { id: id("a") });
    wait_status(&transport, |s| s.connection == ConnectionState::Disconnecting).await;

    radio.emit(RadioEvent::Disconnected {
        id: id("a"),
        reason: None,
    });
    assert_eq!(next_event(&mut rx).await, TransportEvent::Disconnected(id("a")));
    assert_eq!(radio.next_request().await, scan_request());
    wait_status(&transport, |s| s.scanning && s.peripheral.is_none()).await;
}

#[tokio::test]
async fn stale_callbacks_do_not_disturb_the_active_link() {
    let (mut rx, transport, mut radio) = start(Box::new(MemoryStore::new()));
    connect_ready(&mut rx, &transport, &mut radio, "a").await;

    radio.emit(RadioEvent::Disconnected {
        id: id("old"),
        reason: None,
    });
    radio.emit(RadioEvent::ValueUpdated {
        id: id("old"),
        characteristic: MIDI_CHARACTERISTIC_UUID,
        value: vec![0x80, 0x80, 0xB0, 0x07, 0x7F],
    });
    radio.emit(RadioEvent::ValueUpdated {
        id: id("a"),
        characteristic: MIDI_CHARACTERISTIC_UUID,
        value: vec![0x80, 0x80, 0xC0, 0x05],
    });

    // Only the active peripheral's notification comes through.
    assert_eq!(
        next_event(&mut rx).await,
        TransportEvent::Midi {
            peripheral: id("a"),
            event: vec![0xC0, 0x05].into(),
        }
    );
    assert!(transport.status().is_ready());
}

#[tokio::test]
async fn forget_device_clears_the_store() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("devices.json");

    let (mut rx, transport, mut radio) = start(Box::new(JsonFileStore::open(&path).unwrap()));
    connect_ready(&mut rx, &transport, &mut radio, "a").await;

    transport.forget_device();
    transport.shutdown().await.unwrap();

    let store = JsonFileStore::open(&path).unwrap();
    assert_eq!(store.get(BOUND_PERIPHERAL_KEY).unwrap(), None);
}

#[tokio::test]
async fn shutdown_disconnects_and_closes_events() {
    let (mut rx, transport, mut radio) = start(Box::new(MemoryStore::new()));
    connect_ready(&mut rx, &transport, &mut radio, "a").await;

    transport.shutdown().await.unwrap();
    assert_eq!(radio.next_request().await, RadioRequest::Disconnect { id: id("a") });
    assert_eq!(next_event(&mut rx).await, TransportEvent::Disconnected(id("a")));
    assert!(rx.recv().await.is_none());
}

#[tokio::test]
async fn unsupported_adapter_ends_the_session_with_an_error() {
    let (mut rx, transport, radio) = start(Box::new(MemoryStore::new()));
    radio.emit(RadioEvent::AdapterState {
        state: AdapterState::Unsupported,
        known: vec![],
    });

    let closed = tokio::time::timeout(WAIT, rx.recv()).await.unwrap();
    assert!(closed.is_none());
    assert!(transport.shutdown().await.is_err());
}

#[tokio::test]
async fn power_off_tears_down_and_power_on_recovers() {
    let (mut rx, transport, mut radio) = start(Box::new(MemoryStore::new()));
    connect_ready(&mut rx, &transport, &mut radio, "a").await;

    radio.emit(RadioEvent::AdapterState {
        state: AdapterState::PoweredOff,
        known: vec![],
    });
    assert_eq!(next_event(&mut rx).await, TransportEvent::Disconnected(id("a")));
    wait_status(&transport, |s| s.connection == ConnectionState::Disconnected).await;

    radio.power_on(vec![]);
    assert_eq!(radio.next_request().await, RadioRequest::Connect { id: id("a") });
}
