//! Fallback backend for platforms without a supported stack

use tracing::warn;

use crate::advertising::AdvertisingData;
use crate::config::BackendKind;
use crate::error::{BleError, BleResult};

use super::{Backend, Capabilities, StackContext};

// ----------------------------------------------------------------------------
// Fallback Implementation
// ----------------------------------------------------------------------------

/// Backend that reports every operation as unsupported
#[derive(Debug, Default)]
pub struct FallbackBackend;

impl FallbackBackend {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait::async_trait]
impl Backend for FallbackBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::None
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::default()
    }

    async fn stack_start(&mut self, _ctx: StackContext) -> BleResult<()> {
        warn!("BLE not supported on this platform. The device will not be discoverable.");
        Err(BleError::NotSupported)
    }

    async fn stack_stop(&mut self) -> BleResult<()> {
        Err(BleError::NotSupported)
    }

    async fn advertise_start(&mut self, _data: &AdvertisingData) -> BleResult<()> {
        Err(BleError::NotSupported)
    }

    async fn advertise_stop(&mut self) -> BleResult<()> {
        Err(BleError::NotSupported)
    }

    fn is_connected(&self) -> bool {
        false
    }
}
