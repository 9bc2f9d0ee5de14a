//! Integration tests for the controller against the simulated radio.

use std::sync::Arc;
use std::time::Duration;

use bluetooth_chat::bluetooth::simulated::{PeerBehavior, SimulatedRadio};
use bluetooth_chat::bluetooth::{
    BluetoothError, ConnectionRole, Permission, PermissionSet, SessionState,
};
use bluetooth_chat::config::SessionConfig;
use bluetooth_chat::{Device, PeerController};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::watch;
use tokio::time::{sleep, timeout};

const WAIT: Duration = Duration::from_secs(2);

fn controller_for(radio: &SimulatedRadio) -> PeerController {
    PeerController::new(Arc::new(radio.clone()), &SessionConfig::default())
}

fn peer(radio: &SimulatedRadio, address: &str, behavior: PeerBehavior) -> Device {
    let device = Device::new(address, Some(format!("Peer {}", address)));
    radio.add_peer(device.clone(), behavior);
    device
}

async fn wait_until<T>(rx: &mut watch::Receiver<T>, predicate: impl FnMut(&T) -> bool) {
    timeout(WAIT, rx.wait_for(predicate))
        .await
        .expect("condition not reached in time")
        .expect("sender dropped");
}

#[tokio::test]
async fn test_successful_connection_clears_previous_error() {
    let radio = SimulatedRadio::new();
    let refusing = peer(&radio, "00:00:00:00:00:01", PeerBehavior::Refuse);
    let accepting = peer(&radio, "00:00:00:00:00:02", PeerBehavior::Accept);
    let controller = controller_for(&radio);
    let mut errors = controller.errors();
    let mut state = controller.session_state();

    controller.connect_to_device(&refusing).await.unwrap();
    wait_until(&mut errors, |e| e.is_some()).await;
    assert!(errors.borrow().as_deref().unwrap().starts_with("Connection failed"));
    assert_eq!(controller.state(), SessionState::Idle);

    controller.connect_to_device(&accepting).await.unwrap();
    wait_until(&mut state, |s| *s == SessionState::Connected).await;
    assert_eq!(*controller.errors().borrow(), None);
    assert!(*controller.is_connected().borrow());
    assert_eq!(radio.open_sockets(), 1);
}

#[tokio::test]
async fn test_pending_attempt_reports_connecting() {
    let radio = SimulatedRadio::new();
    let device = peer(&radio, "00:00:00:00:00:01", PeerBehavior::Hang);
    let controller = controller_for(&radio);

    controller.connect_to_device(&device).await.unwrap();
    sleep(Duration::from_millis(20)).await;

    assert_eq!(
        controller.state(),
        SessionState::Connecting(ConnectionRole::Client)
    );
    let snapshot = controller.snapshot();
    assert!(snapshot.is_connecting);
    assert!(!snapshot.is_connected);
}

#[tokio::test]
async fn test_close_during_attempt_releases_socket() {
    let radio = SimulatedRadio::new();
    let device = peer(&radio, "00:00:00:00:00:01", PeerBehavior::Hang);
    let controller = controller_for(&radio);
    let connected = controller.is_connected();

    controller.connect_to_device(&device).await.unwrap();
    sleep(Duration::from_millis(20)).await;
    assert_eq!(radio.open_sockets(), 1);

    controller.close_connection().await;
    assert_eq!(controller.state(), SessionState::Idle);
    assert_eq!(radio.open_sockets(), 0);
    assert!(!connected.has_changed().unwrap());
    assert_eq!(*controller.errors().borrow(), None);

    // Closing again is harmless.
    controller.close_connection().await;
    assert_eq!(controller.state(), SessionState::Idle);
}

#[tokio::test]
async fn test_discovery_refused_while_connecting() {
    let radio = SimulatedRadio::new();
    let device = peer(&radio, "00:00:00:00:00:01", PeerBehavior::Hang);
    let controller = controller_for(&radio);

    controller.connect_to_device(&device).await.unwrap();
    let result = controller.start_discovery().await;

    assert_eq!(result, Err(BluetoothError::Busy));
    assert_eq!(
        controller.errors().borrow().as_deref(),
        Some("Cannot scan while a connection is active")
    );
    assert!(controller.state().is_connecting());
    assert_eq!(radio.active_scans(), 0);
}

#[tokio::test]
async fn test_connecting_stops_discovery() {
    let radio = SimulatedRadio::new();
    radio.announce(Device::new("00:00:00:00:00:09", Some("Nearby".to_string())));
    let device = peer(&radio, "00:00:00:00:00:01", PeerBehavior::Hang);
    let controller = controller_for(&radio);
    let mut scanned = controller.scanned_devices();

    controller.start_discovery().await.unwrap();
    wait_until(&mut scanned, |d| d.len() == 1).await;
    assert_eq!(radio.active_scans(), 1);

    controller.connect_to_device(&device).await.unwrap();
    assert_eq!(radio.active_scans(), 0);
    assert_eq!(controller.registry().snapshot_scanned().len(), 1);
}

#[tokio::test]
async fn test_discovery_refused_while_connected() {
    let radio = SimulatedRadio::new();
    let device = peer(&radio, "00:00:00:00:00:01", PeerBehavior::Accept);
    let controller = controller_for(&radio);
    let mut state = controller.session_state();

    controller.connect_to_device(&device).await.unwrap();
    wait_until(&mut state, |s| *s == SessionState::Connected).await;

    let result = controller.start_discovery().await;

    assert_eq!(result, Err(BluetoothError::Busy));
    assert_eq!(
        controller.errors().borrow().as_deref(),
        Some("Cannot scan while a connection is active")
    );
    assert_eq!(controller.state(), SessionState::Connected);
    assert_eq!(radio.active_scans(), 0);
}

#[tokio::test]
async fn test_remote_drop_seen_while_link_untaken() {
    let radio = SimulatedRadio::new();
    let device = peer(&radio, "00:00:00:00:00:01", PeerBehavior::Accept);
    let config = SessionConfig::default();
    let controller = PeerController::new(Arc::new(radio.clone()), &config);
    let mut connected = controller.is_connected();

    controller.connect_to_device(&device).await.unwrap();
    wait_until(&mut connected, |c| *c).await;

    let mut remote = radio.take_remote(&device.address).expect("remote end");
    let chunk = vec![0x42u8; config.read_buffer_size];
    for _ in 0..(config.link_buffer + 2) {
        timeout(WAIT, remote.write_all(&chunk))
            .await
            .expect("transport stopped being read")
            .unwrap();
    }
    drop(remote);

    wait_until(&mut connected, |c| !*c).await;
    assert_eq!(controller.state(), SessionState::Idle);
    let message = controller.errors().borrow().clone().unwrap();
    assert!(message.starts_with("Connection was interrupted"));
    assert_eq!(radio.open_sockets(), 0);
}

#[tokio::test]
async fn test_remote_drop_is_reported() {
    let radio = SimulatedRadio::new();
    let device = peer(&radio, "00:00:00:00:00:01", PeerBehavior::Accept);
    let controller = controller_for(&radio);
    let mut connected = controller.is_connected();

    controller.connect_to_device(&device).await.unwrap();
    wait_until(&mut connected, |c| *c).await;

    drop(radio.take_remote(&device.address));
    wait_until(&mut connected, |c| !*c).await;

    assert_eq!(controller.state(), SessionState::Idle);
    let message = controller.errors().borrow().clone().unwrap();
    assert!(message.starts_with("Connection was interrupted"));
    assert_eq!(radio.open_sockets(), 0);
}

#[tokio::test]
async fn test_latest_connect_wins() {
    let radio = SimulatedRadio::new();
    let first = peer(&radio, "00:00:00:00:00:01", PeerBehavior::Hang);
    let second = peer(&radio, "00:00:00:00:00:02", PeerBehavior::Accept);
    let controller = controller_for(&radio);
    let mut state = controller.session_state();

    controller.connect_to_device(&first).await.unwrap();
    sleep(Duration::from_millis(20)).await;
    controller.connect_to_device(&second).await.unwrap();
    wait_until(&mut state, |s| *s == SessionState::Connected).await;

    assert_eq!(radio.connect_attempts(), 2);
    assert_eq!(radio.open_sockets(), 1);
    assert!(radio.take_remote(&second.address).is_some());
    assert_eq!(*controller.errors().borrow(), None);
}

#[tokio::test]
async fn test_link_exchanges_bytes_with_echo_peer() {
    let radio = SimulatedRadio::new();
    let device = peer(&radio, "00:00:00:00:00:01", PeerBehavior::Echo);
    let controller = controller_for(&radio);
    let mut connected = controller.is_connected();

    controller.connect_to_device(&device).await.unwrap();
    let mut link = controller.take_link().expect("link for the attempt");
    wait_until(&mut connected, |c| *c).await;

    link.send("ping").await.unwrap();
    let echoed = timeout(WAIT, link.recv()).await.unwrap();
    assert_eq!(echoed.as_deref(), Some(&b"ping"[..]));
}

#[tokio::test]
async fn test_server_accepts_one_inbound_peer() {
    let radio = SimulatedRadio::new();
    let controller = controller_for(&radio);
    let mut state = controller.session_state();

    controller.start_bluetooth_server().await.unwrap();
    assert_eq!(
        controller.state(),
        SessionState::Connecting(ConnectionRole::Server)
    );
    let mut link = controller.take_link().expect("link for the attempt");

    let mut remote = radio.dial_in(&Device::new("00:00:00:00:00:07", None));
    wait_until(&mut state, |s| *s == SessionState::Connected).await;

    remote.write_all(b"hello").await.unwrap();
    let received = timeout(WAIT, link.recv()).await.unwrap();
    assert_eq!(received.as_deref(), Some(&b"hello"[..]));

    link.send("hi").await.unwrap();
    let mut buf = [0u8; 2];
    timeout(WAIT, remote.read_exact(&mut buf)).await.unwrap().unwrap();
    assert_eq!(&buf, b"hi");
}

#[tokio::test]
async fn test_missing_permissions_are_published() {
    let radio = SimulatedRadio::new();
    let device = peer(&radio, "00:00:00:00:00:01", PeerBehavior::Accept);
    let shared = Arc::new(radio.clone());
    let controller = PeerController::with_permissions(
        shared.clone(),
        shared,
        Arc::new(PermissionSet::new()),
        &SessionConfig::default(),
    );
    let mut errors = controller.errors();

    let result = controller.start_discovery().await;
    assert_eq!(
        result,
        Err(BluetoothError::PermissionDenied(Permission::Scan))
    );
    assert_eq!(
        errors.borrow_and_update().as_deref(),
        Some("Missing BLUETOOTH_SCAN permission")
    );

    controller.connect_to_device(&device).await.unwrap();
    wait_until(&mut errors, |e| {
        e.as_deref() == Some("Missing BLUETOOTH_CONNECT permission")
    })
    .await;
    assert_eq!(controller.state(), SessionState::Idle);
    assert_eq!(radio.connect_attempts(), 0);
}

#[tokio::test]
async fn test_ui_state_follows_devices_and_connection() {
    let radio = SimulatedRadio::new();
    let device = peer(&radio, "00:00:00:00:00:01", PeerBehavior::Accept);
    radio.pair(device.clone());
    let controller = controller_for(&radio);
    let mut ui = controller.ui_state();

    controller.refresh_paired_devices().await.unwrap();
    wait_until(&mut ui, |s| s.paired_devices.len() == 1).await;
    assert!(ui.borrow().paired_devices[0].is_paired());

    controller.connect_to_device(&device).await.unwrap();
    wait_until(&mut ui, |s| s.is_connected).await;
    assert_eq!(ui.borrow().status().as_str(), "Connected");

    controller.close_connection().await;
    wait_until(&mut ui, |s| !s.is_connected && !s.is_connecting).await;
    assert_eq!(ui.borrow().status().as_str(), "Disconnected");
}

#[tokio::test]
async fn test_scanned_names_fill_in_but_never_erase() {
    let radio = SimulatedRadio::new();
    let controller = controller_for(&radio);
    let mut scanned = controller.scanned_devices();

    controller.start_discovery().await.unwrap();
    radio.announce(Device::new("00:00:00:00:00:05", None));
    wait_until(&mut scanned, |d| d.len() == 1).await;

    radio.announce(Device::new("00:00:00:00:00:05", Some("Laptop".to_string())));
    wait_until(&mut scanned, |d| d[0].name.as_deref() == Some("Laptop")).await;

    radio.announce(Device::new("00:00:00:00:00:05", None));
    radio.announce(Device::new("00:00:00:00:00:06", None));
    wait_until(&mut scanned, |d| d.len() == 2).await;
    assert_eq!(scanned.borrow()[0].name.as_deref(), Some("Laptop"));
}

#[tokio::test]
async fn test_release_is_final_and_idempotent() {
    let radio = SimulatedRadio::new();
    let device = peer(&radio, "00:00:00:00:00:01", PeerBehavior::Hang);
    let controller = controller_for(&radio);

    controller.start_discovery().await.unwrap();
    controller.connect_to_device(&device).await.unwrap();
    sleep(Duration::from_millis(20)).await;

    controller.release().await;
    controller.release().await;

    assert_eq!(radio.open_sockets(), 0);
    assert_eq!(radio.active_scans(), 0);
    assert_eq!(
        controller.connect_to_device(&device).await,
        Err(BluetoothError::Released)
    );
    assert_eq!(
        controller.start_discovery().await,
        Err(BluetoothError::Released)
    );
    controller.close_connection().await;
    assert_eq!(controller.state(), SessionState::Idle);
}
