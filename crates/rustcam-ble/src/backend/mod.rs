//! Stack backends and platform selection
//!
//! A backend owns one BLE stack: it starts and stops it, drives advertising
//! and reports stack events through the [`StackContext`] it is handed on
//! start. Backends that cannot observe an event declare it through
//! [`Capabilities`] instead of approximating it.

#[cfg(target_os = "linux")]
pub mod bluez;
pub mod fallback;
pub mod hci;
pub mod host;
#[cfg(target_os = "linux")]
pub mod linux;
pub mod native;

use std::fmt;
use std::sync::Arc;

use serde::Serialize;

use crate::advertising::AdvertisingData;
use crate::config::{BackendKind, PeripheralConfig};
use crate::error::BleResult;
use crate::event::EventSender;
use crate::gatt::GattServer;

pub use fallback::FallbackBackend;
pub use host::{
    AdapterEvent, AdapterOpener, AdvertiseParams, GattAccess, HostAdapter, HostBackend,
    HostSettings, Registration,
};
pub use native::NativeBackend;

// ----------------------------------------------------------------------------
// Backend Contract
// ----------------------------------------------------------------------------

/// What a backend can observe and serve
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct Capabilities {
    /// Stack boots asynchronously and raises `Synced`
    pub host_sync: bool,
    /// Stack raises `Connected` and `Disconnected`
    pub connection_events: bool,
    /// Stack serves the GATT table to connected centrals
    pub gatt_server: bool,
}

impl fmt::Display for Capabilities {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "host_sync={} connection_events={} gatt_server={}",
            self.host_sync, self.connection_events, self.gatt_server
        )
    }
}

/// Handed to a backend when its stack starts
#[derive(Clone)]
pub struct StackContext {
    pub events: EventSender,
    pub gatt: Arc<GattServer>,
}

/// Trait for a BLE stack the peripheral can drive
#[async_trait::async_trait]
pub trait Backend: Send + Sync + 'static {
    fn kind(&self) -> BackendKind;

    fn capabilities(&self) -> Capabilities;

    /// Start the stack. Event-driven stacks may return before they are synced.
    async fn stack_start(&mut self, ctx: StackContext) -> BleResult<()>;

    /// Stop the stack and release its resources
    async fn stack_stop(&mut self) -> BleResult<()>;

    /// Start advertising `data`, or replace the payload if already advertising
    async fn advertise_start(&mut self, data: &AdvertisingData) -> BleResult<()>;

    async fn advertise_stop(&mut self) -> BleResult<()>;

    /// Link state as the stack itself sees it. The peripheral tracks
    /// connections from events; this view is reported by `status()`.
    fn is_connected(&self) -> bool;
}

// ----------------------------------------------------------------------------
// Platform Selection
// ----------------------------------------------------------------------------

/// Backend chosen from configuration
pub enum PlatformBackend {
    #[cfg(target_os = "linux")]
    Host(host::HostBackend<bluez::BluezOpener>),
    #[cfg(target_os = "linux")]
    Native(native::NativeBackend<linux::HciSocketOpener>),
    Fallback(FallbackBackend),
}

impl PlatformBackend {
    /// Create the backend named by `config.backend`
    pub fn from_config(config: &PeripheralConfig) -> Self {
        match config.backend {
            #[cfg(target_os = "linux")]
            BackendKind::Host => Self::Host(host::HostBackend::new(
                bluez::BluezOpener::new(config.hci_device),
                host::HostSettings::from_config(config),
            )),
            #[cfg(target_os = "linux")]
            BackendKind::Native => Self::Native(native::NativeBackend::new(
                linux::HciSocketOpener::new(config.hci_device),
                config,
            )),
            #[cfg(not(target_os = "linux"))]
            BackendKind::Host | BackendKind::Native => {
                tracing::warn!(
                    "{} backend not available on this platform, BLE disabled",
                    config.backend
                );
                Self::Fallback(FallbackBackend::new())
            }
            BackendKind::None => Self::Fallback(FallbackBackend::new()),
        }
    }
}

#[async_trait::async_trait]
impl Backend for PlatformBackend {
    fn kind(&self) -> BackendKind {
        match self {
            #[cfg(target_os = "linux")]
            Self::Host(ref backend) => backend.kind(),
            #[cfg(target_os = "linux")]
            Self::Native(ref backend) => backend.kind(),
            Self::Fallback(ref backend) => backend.kind(),
        }
    }

    fn capabilities(&self) -> Capabilities {
        match self {
            #[cfg(target_os = "linux")]
            Self::Host(ref backend) => backend.capabilities(),
            #[cfg(target_os = "linux")]
            Self::Native(ref backend) => backend.capabilities(),
            Self::Fallback(ref backend) => backend.capabilities(),
        }
    }

    async fn stack_start(&mut self, ctx: StackContext) -> BleResult<()> {
        match self {
            #[cfg(target_os = "linux")]
            Self::Host(ref mut backend) => backend.stack_start(ctx).await,
            #[cfg(target_os = "linux")]
            Self::Native(ref mut backend) => backend.stack_start(ctx).await,
            Self::Fallback(ref mut backend) => backend.stack_start(ctx).await,
        }
    }

    async fn stack_stop(&mut self) -> BleResult<()> {
        match self {
            #[cfg(target_os = "linux")]
            Self::Host(ref mut backend) => backend.stack_stop().await,
            #[cfg(target_os = "linux")]
            Self::Native(ref mut backend) => backend.stack_stop().await,
            Self::Fallback(ref mut backend) => backend.stack_stop().await,
        }
    }

    async fn advertise_start(&mut self, data: &AdvertisingData) -> BleResult<()> {
        match self {
            #[cfg(target_os = "linux")]
            Self::Host(ref mut backend) => backend.advertise_start(data).await,
            #[cfg(target_os = "linux")]
            Self::Native(ref mut backend) => backend.advertise_start(data).await,
            Self::Fallback(ref mut backend) => backend.advertise_start(data).await,
        }
    }

    async fn advertise_stop(&mut self) -> BleResult<()> {
        match self {
            #[cfg(target_os = "linux")]
            Self::Host(ref mut backend) => backend.advertise_stop().await,
            #[cfg(target_os = "linux")]
            Self::Native(ref mut backend) => backend.advertise_stop().await,
            Self::Fallback(ref mut backend) => backend.advertise_stop().await,
        }
    }

    fn is_connected(&self) -> bool {
        match self {
            #[cfg(target_os = "linux")]
            Self::Host(ref backend) => backend.is_connected(),
            #[cfg(target_os = "linux")]
            Self::Native(ref backend) => backend.is_connected(),
            Self::Fallback(ref backend) => backend.is_connected(),
        }
    }
}
