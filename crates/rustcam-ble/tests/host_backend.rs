//! Host stack against an in-memory BlueZ adapter: boot and retry,
//! advertising, connection handling and GATT traffic

mod common;

use std::time::Duration;

use common::{settle, wait_for_link, FakeAdapter};
use rustcam_ble::backend::{AdapterEvent, HostBackend, HostSettings};
use rustcam_ble::protocol::{BdAddr, MAX_COMMAND_LEN};
use rustcam_ble::{AccessError, BleError, LinkState, Peripheral, PeripheralConfig};

type HostPeripheral = Peripheral<HostBackend<FakeAdapter>>;

fn host_peripheral() -> (HostPeripheral, FakeAdapter) {
    let adapter = FakeAdapter::new();
    let config = PeripheralConfig::new().with_command_timeout(Duration::from_millis(500));
    let settings =
        HostSettings::from_config(&config).with_retry_backoff(Duration::from_millis(10));
    let backend = HostBackend::new(adapter.clone(), settings);
    (Peripheral::with_backend(backend, config), adapter)
}

fn central() -> BdAddr {
    "11:22:33:44:55:66".parse().unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_boot_then_deferred_advertising() {
    let (peripheral, adapter) = host_peripheral();
    peripheral.init().await.unwrap();
    peripheral.start_advertising(Some("HostCam")).await.unwrap();

    let snapshot = wait_for_link(&peripheral, LinkState::Advertising).await;
    assert!(snapshot.state.host_synced);
    assert!(!snapshot.state.pending_advertise);

    assert_eq!(adapter.opens(), 1);
    assert_eq!(adapter.power_ons(), 1);
    assert_eq!(adapter.watches(), 1);
    assert_eq!(adapter.gatt_serves(), 1);
    assert_eq!(adapter.live_applications(), 1);
    assert_eq!(adapter.live_advertisements(), 1);

    let params = adapter.last_advertise().unwrap();
    assert_eq!(params.local_name, "HostCam");
    assert_eq!(params.interval, Duration::from_millis(100));

    peripheral.deinit().await.unwrap();
    assert_eq!(adapter.live_advertisements(), 0);
    assert_eq!(adapter.live_applications(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_failed_boot_resets_and_retries() {
    let (peripheral, adapter) = host_peripheral();
    adapter.fail_power_on(2);

    peripheral.init().await.unwrap();
    peripheral.start_advertising(None).await.unwrap();

    // Reset, Reset, Synced
    let snapshot = settle(&peripheral, 3).await;
    assert!(snapshot.state.host_synced);
    assert_eq!(snapshot.link, LinkState::Advertising);
    assert_eq!(adapter.power_ons(), 3);
    assert_eq!(adapter.gatt_serves(), 1);
    assert_eq!(adapter.advertises(), 1);
    assert_eq!(adapter.opens(), 1);

    peripheral.deinit().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_failing_boot_stays_initializing_until_adapter_recovers() {
    let (peripheral, adapter) = host_peripheral();
    adapter.fail_power_on(usize::MAX);
    peripheral.init().await.unwrap();
    peripheral.start_advertising(None).await.unwrap();

    adapter.wait_until(|a| a.power_ons() >= 3).await;
    // Two resets handled, still waiting for a boot to succeed
    let snapshot = settle(&peripheral, 2).await;
    assert_eq!(snapshot.link, LinkState::Initializing);
    assert!(snapshot.state.pending_advertise);
    assert_eq!(adapter.gatt_serves(), 0);

    adapter.fail_power_on(0);
    let snapshot = wait_for_link(&peripheral, LinkState::Advertising).await;
    assert!(!snapshot.state.pending_advertise);

    peripheral.deinit().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_connection_serves_gatt_and_resumes() {
    let (peripheral, adapter) = host_peripheral();
    peripheral.init().await.unwrap();
    peripheral.start_advertising(None).await.unwrap();
    wait_for_link(&peripheral, LinkState::Advertising).await;

    adapter.notify(AdapterEvent::Connected {
        handle: 0x0040,
        peer: central(),
    });
    let snapshot = wait_for_link(&peripheral, LinkState::Connected).await;
    assert_eq!(snapshot.state.connection_handle, Some(0x0040));
    assert!(snapshot.state.advertising);
    assert!(peripheral.is_connected().await);
    assert!(peripheral.status().await.backend_connected);

    let access = adapter.access();
    assert_eq!(access.write(0, b"snap").unwrap(), 4);
    assert_eq!(peripheral.poll_command(64), b"snap");
    assert_eq!(access.read(0).unwrap(), b"Hello from RustCam!");

    adapter.notify(AdapterEvent::Disconnected {
        handle: 0x0040,
        reason: 0x13,
    });
    let snapshot = wait_for_link(&peripheral, LinkState::Advertising).await;
    assert!(!snapshot.state.connected);
    assert_eq!(snapshot.state.last_disconnect_reason, Some(0x13));
    assert!(!peripheral.is_connected().await);
    assert!(!peripheral.status().await.backend_connected);
    assert_eq!(adapter.advertises(), 2);
    assert_eq!(adapter.live_advertisements(), 1);

    peripheral.deinit().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_oversized_write_is_truncated() {
    let (peripheral, adapter) = host_peripheral();
    peripheral.init().await.unwrap();
    wait_for_link(&peripheral, LinkState::Ready).await;

    let command = [b'x'; 100];
    assert_eq!(adapter.access().write(0, &command).unwrap(), MAX_COMMAND_LEN);
    assert_eq!(peripheral.poll_command(128), &command[..MAX_COMMAND_LEN]);

    peripheral.deinit().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_long_write_and_read_span_segments() {
    let (peripheral, adapter) = host_peripheral();
    peripheral.init().await.unwrap();
    wait_for_link(&peripheral, LinkState::Ready).await;
    let access = adapter.access();

    // Prepared writes arrive as offset segments of one command
    let command = b"capture burst of twelve frames at full resolution";
    for (i, segment) in command.chunks(18).enumerate() {
        access.write(i * 18, segment).unwrap();
    }
    assert_eq!(peripheral.poll_command(64), &command[..]);

    assert_eq!(
        access.write(4, b"late"),
        Err(AccessError::InvalidOffset(4))
    );
    assert!(!peripheral.has_command());

    peripheral.set_read_message(Some("status: idle, battery 81%")).unwrap();
    assert_eq!(access.read(0).unwrap(), b"status: idle, battery 81%");
    assert_eq!(access.read(22).unwrap(), b"81%");
    assert_eq!(access.read(40), Err(AccessError::InvalidOffset(40)));

    peripheral.deinit().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_power_loss_reboots_and_resumes() {
    let (peripheral, adapter) = host_peripheral();
    peripheral.init().await.unwrap();
    peripheral.start_advertising(None).await.unwrap();
    wait_for_link(&peripheral, LinkState::Advertising).await;

    adapter.notify(AdapterEvent::PoweredOff);
    // Synced, Reset, Synced again
    let snapshot = settle(&peripheral, 3).await;
    assert!(snapshot.state.host_synced);
    assert_eq!(snapshot.link, LinkState::Advertising);

    assert_eq!(adapter.power_ons(), 2);
    assert_eq!(adapter.gatt_serves(), 2);
    assert_eq!(adapter.live_applications(), 1);
    assert_eq!(adapter.advertises(), 2);
    assert_eq!(adapter.live_advertisements(), 1);

    peripheral.deinit().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_rename_replaces_advertisement() {
    let (peripheral, adapter) = host_peripheral();
    peripheral.init().await.unwrap();
    peripheral.start_advertising(Some("First")).await.unwrap();
    wait_for_link(&peripheral, LinkState::Advertising).await;

    peripheral.start_advertising(Some("Second")).await.unwrap();
    assert_eq!(adapter.last_advertise().unwrap().local_name, "Second");
    assert_eq!(adapter.advertises(), 2);
    assert_eq!(adapter.live_advertisements(), 1);

    peripheral.stop_advertising().await.unwrap();
    assert_eq!(adapter.live_advertisements(), 0);

    peripheral.deinit().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_rejected_advertisement_fails_start() {
    let (peripheral, adapter) = host_peripheral();
    peripheral.init().await.unwrap();
    wait_for_link(&peripheral, LinkState::Ready).await;

    adapter.fail_advertise(Some(BleError::NotSupported));
    assert_eq!(
        peripheral.start_advertising(None).await,
        Err(BleError::NotSupported)
    );
    assert!(!peripheral.snapshot().await.state.advertising);
    assert_eq!(adapter.live_advertisements(), 0);

    peripheral.deinit().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_reinit_reopens_adapter() {
    let (peripheral, adapter) = host_peripheral();
    peripheral.init().await.unwrap();
    wait_for_link(&peripheral, LinkState::Ready).await;
    peripheral.deinit().await.unwrap();
    assert_eq!(adapter.live_applications(), 0);

    peripheral.init().await.unwrap();
    wait_for_link(&peripheral, LinkState::Ready).await;
    assert_eq!(adapter.opens(), 2);
    assert_eq!(adapter.live_applications(), 1);
    peripheral.deinit().await.unwrap();
}
