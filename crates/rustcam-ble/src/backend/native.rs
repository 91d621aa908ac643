//! Kernel-native stack driven through synchronous control calls
//!
//! The kernel owns the controller. Once the interface is up and a raw HCI
//! socket is open the stack is ready; there is no sync event. Connection
//! tracking is not available on this path, so `is_connected` always
//! reports false.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::advertising::AdvertisingData;
use crate::config::{BackendKind, PeripheralConfig};
use crate::error::{BleError, BleResult, CODE_IO};
use crate::netif;

use super::hci::{
    adv_data_params, adv_params, blocking_command, HciOpener, HCI_OP_LE_SET_ADV_DATA,
    HCI_OP_LE_SET_ADV_ENABLE, HCI_OP_LE_SET_ADV_PARAM, OWN_ADDR_PUBLIC,
};
use super::{Backend, Capabilities, StackContext};

// ----------------------------------------------------------------------------
// Native Backend
// ----------------------------------------------------------------------------

/// Synchronous backend over any [`HciOpener`]
pub struct NativeBackend<O: HciOpener> {
    opener: Arc<O>,
    interface: String,
    command_timeout: Duration,
    adv_interval: u16,
    transport: Option<Arc<O::Transport>>,
    advertising: bool,
}

impl<O: HciOpener> NativeBackend<O> {
    pub fn new(opener: O, config: &PeripheralConfig) -> Self {
        Self {
            opener: Arc::new(opener),
            interface: config.interface.clone(),
            command_timeout: config.command_timeout(),
            adv_interval: config.adv_interval_units(),
            transport: None,
            advertising: false,
        }
    }

    /// Run one command exchange on a blocking thread
    async fn command(&self, opcode: u16, params: &[u8]) -> BleResult<Vec<u8>> {
        let transport = self.transport.clone().ok_or(BleError::NotInitialized)?;
        let params = params.to_vec();
        let timeout = self.command_timeout;
        tokio::task::spawn_blocking(move || {
            blocking_command(transport.as_ref(), opcode, &params, timeout)
        })
        .await
        .map_err(|e| {
            error!("HCI command task failed: {}", e);
            BleError::backend(CODE_IO)
        })?
    }
}

#[async_trait::async_trait]
impl<O: HciOpener> Backend for NativeBackend<O> {
    fn kind(&self) -> BackendKind {
        BackendKind::Native
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::default()
    }

    async fn stack_start(&mut self, _ctx: StackContext) -> BleResult<()> {
        if self.transport.is_some() {
            return Err(BleError::AlreadyInitialized);
        }

        if !self.interface.is_empty() {
            let interface = self.interface.clone();
            match tokio::task::spawn_blocking(move || netif::interface_up(&interface)).await {
                Ok(Ok(())) => debug!("Interface {} is up", self.interface),
                Ok(Err(e)) => warn!("Failed to bring up {}: {}", self.interface, e),
                Err(e) => warn!("Interface-up task failed: {}", e),
            }
        }

        let opener = self.opener.clone();
        let transport = tokio::task::spawn_blocking(move || opener.open())
            .await
            .map_err(|e| {
                error!("HCI open task failed: {}", e);
                BleError::backend(CODE_IO)
            })?
            .map_err(|e| {
                error!("Failed to open HCI socket: {}", e);
                BleError::from(e)
            })?;

        self.transport = Some(Arc::new(transport));
        info!("Native BLE stack ready");
        Ok(())
    }

    async fn stack_stop(&mut self) -> BleResult<()> {
        if self.transport.take().is_none() {
            return Err(BleError::NotInitialized);
        }
        self.advertising = false;
        info!("Native BLE stack closed");
        Ok(())
    }

    async fn advertise_start(&mut self, data: &AdvertisingData) -> BleResult<()> {
        let payload = adv_data_params(data);
        if self.advertising {
            self.command(HCI_OP_LE_SET_ADV_DATA, &payload).await?;
            return Ok(());
        }

        let params = adv_params(self.adv_interval, OWN_ADDR_PUBLIC);
        self.command(HCI_OP_LE_SET_ADV_PARAM, &params).await?;
        self.command(HCI_OP_LE_SET_ADV_DATA, &payload).await?;
        self.command(HCI_OP_LE_SET_ADV_ENABLE, &[0x01]).await?;
        self.advertising = true;
        Ok(())
    }

    async fn advertise_stop(&mut self) -> BleResult<()> {
        if !self.advertising {
            return Ok(());
        }
        self.command(HCI_OP_LE_SET_ADV_ENABLE, &[0x00]).await?;
        self.advertising = false;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        false
    }
}
