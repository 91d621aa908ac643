//! Bluetooth Low Energy peripheral control core for RustCam
//!
//! This crate drives a BLE stack as a peripheral: it advertises under a
//! configurable name, exposes one GATT service and hands commands written by
//! a central to the application through a single-slot mailbox.
//!
//! ## Architecture
//!
//! - [`peripheral`] - Lifecycle and advertising state machine
//! - [`state`] - Peripheral state, device name and derived link state
//! - [`event`] - Stack events delivered by backends
//! - [`gatt`] - Attribute table and GATT access callbacks
//! - [`mailbox`] - Command mailbox and read response
//! - [`advertising`] - Advertising payload builder
//! - [`backend`] - Stack backends (event-driven host, kernel native, fallback)
//! - [`config`] - Peripheral configuration
//! - [`netif`] - Network interface bring-up
//! - [`protocol`] - UUIDs, limits and addresses
//! - [`error`] - Error types
//!
//! ## Usage
//!
//! ```rust,no_run
//! use rustcam_ble::{Peripheral, PeripheralConfig};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = PeripheralConfig::new().with_device_name("RustCam-01");
//! let peripheral = Peripheral::new(config);
//!
//! peripheral.init().await?;
//!
//! // Deferred until the host has synced when the backend boots asynchronously
//! peripheral.start_advertising(None).await?;
//!
//! let command = peripheral.poll_command(64);
//! if !command.is_empty() {
//!     println!("command: {}", String::from_utf8_lossy(&command));
//! }
//!
//! peripheral.deinit().await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Platform Support
//!
//! - **Linux**: `host` runs on a BlueZ adapter through bluer, serving the
//!   GATT service and reporting connections; `native` leaves the controller
//!   to the kernel and only advertises over a raw HCI socket
//! - **Other platforms**: every operation reports `NotSupported`

pub mod advertising;
pub mod backend;
pub mod config;
pub mod error;
pub mod event;
pub mod gatt;
pub mod mailbox;
pub mod netif;
pub mod peripheral;
pub mod protocol;
pub mod state;

// Public API exports
pub use advertising::AdvertisingData;
pub use backend::{Backend, Capabilities, FallbackBackend, PlatformBackend, StackContext};
pub use config::{BackendKind, ConfigError, PeripheralConfig};
pub use error::{BleError, BleResult};
pub use event::StackEvent;
pub use gatt::{AccessError, GattHandles, GattServer};
pub use mailbox::{CommandMailbox, ReadResponse};
pub use peripheral::{Peripheral, StatusReport};
pub use protocol::{
    BdAddr, DEFAULT_DEVICE_NAME, DEFAULT_READ_MESSAGE, MAX_COMMAND_LEN, MAX_DEVICE_NAME_LEN,
    MAX_READ_MESSAGE_LEN, RUSTCAM_READ_CHARACTERISTIC_UUID, RUSTCAM_SERVICE_UUID,
    RUSTCAM_WRITE_CHARACTERISTIC_UUID,
};
pub use state::{DeviceName, LinkState, PeripheralState, StateSnapshot};
