//! BlueZ adapter for the host stack, using bluer

use std::collections::{HashMap, HashSet};
use std::pin::Pin;

use bluer::adv::{Advertisement, Type as AdvertisementType};
use bluer::gatt::local::{
    Application, Characteristic, CharacteristicRead, CharacteristicWrite,
    CharacteristicWriteMethod, ReqError, Service,
};
use bluer::{AdapterProperty, Address, DeviceEvent, DeviceProperty};
use futures::stream::{SelectAll, Stream, StreamExt};
use futures::FutureExt;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::{BleError, BleResult, CODE_IO};
use crate::gatt::AccessError;
use crate::protocol::{
    BdAddr, RUSTCAM_READ_CHARACTERISTIC_UUID, RUSTCAM_SERVICE_UUID,
    RUSTCAM_WRITE_CHARACTERISTIC_UUID,
};

use super::host::{
    AdapterEvent, AdapterOpener, AdvertiseParams, GattAccess, HostAdapter, Registration,
};

/// Reported on disconnect; BlueZ does not expose the HCI reason
pub const UNKNOWN_DISCONNECT_REASON: u8 = 0xFF;

fn bluer_error(context: &str, err: bluer::Error) -> BleError {
    warn!("BlueZ {} failed: {}", context, err);
    match err.kind {
        bluer::ErrorKind::NotSupported => BleError::NotSupported,
        _ => BleError::backend(CODE_IO),
    }
}

fn req_error(err: AccessError) -> ReqError {
    match err {
        AccessError::InvalidOffset(_) => ReqError::InvalidOffset,
        AccessError::ReadNotPermitted(_) | AccessError::WriteNotPermitted(_) => {
            ReqError::NotPermitted
        }
        AccessError::InvalidHandle(_) | AccessError::NotRegistered => ReqError::Failed,
    }
}

// ----------------------------------------------------------------------------
// Opener
// ----------------------------------------------------------------------------

/// Opens `hciN` through a BlueZ session
#[derive(Debug, Clone)]
pub struct BluezOpener {
    pub adapter_name: String,
}

impl BluezOpener {
    pub fn new(dev_id: u16) -> Self {
        Self {
            adapter_name: format!("hci{}", dev_id),
        }
    }
}

#[async_trait::async_trait]
impl AdapterOpener for BluezOpener {
    type Adapter = BluezAdapter;

    async fn open(&self) -> BleResult<BluezAdapter> {
        let session = bluer::Session::new()
            .await
            .map_err(|e| bluer_error("session", e))?;
        let adapter = session
            .adapter(&self.adapter_name)
            .map_err(|e| bluer_error("adapter lookup", e))?;
        info!("Using BlueZ adapter {}", adapter.name());
        Ok(BluezAdapter {
            _session: session,
            adapter,
        })
    }
}

// ----------------------------------------------------------------------------
// Adapter
// ----------------------------------------------------------------------------

pub struct BluezAdapter {
    _session: bluer::Session,
    adapter: bluer::Adapter,
}

type DeviceEvents = Pin<Box<dyn Stream<Item = (Address, DeviceEvent)> + Send>>;

/// Tracks centrals and assigns each connection a local handle
struct Connections {
    adapter: bluer::Adapter,
    tx: mpsc::UnboundedSender<AdapterEvent>,
    watched: HashSet<Address>,
    handles: HashMap<Address, u16>,
    next_handle: u16,
}

impl Connections {
    async fn watch_device(&mut self, addr: Address, streams: &mut SelectAll<DeviceEvents>) {
        if !self.watched.insert(addr) {
            return;
        }
        let device = match self.adapter.device(addr) {
            Ok(device) => device,
            Err(e) => {
                debug!("Device {} vanished: {}", addr, e);
                return;
            }
        };
        match device.events().await {
            Ok(events) => streams.push(Box::pin(events.map(move |event| (addr, event)))),
            Err(e) => debug!("Cannot watch device {}: {}", addr, e),
        }
        // The link may be up before the subscription
        if device.is_connected().await.unwrap_or(false) {
            self.connected(addr);
        }
    }

    fn connected(&mut self, addr: Address) {
        if self.handles.contains_key(&addr) {
            return;
        }
        let handle = self.next_handle;
        self.next_handle = self.next_handle.wrapping_add(1).max(1);
        self.handles.insert(addr, handle);
        let _ = self.tx.send(AdapterEvent::Connected {
            handle,
            peer: BdAddr(addr.0),
        });
    }

    fn disconnected(&mut self, addr: Address) {
        if let Some(handle) = self.handles.remove(&addr) {
            let _ = self.tx.send(AdapterEvent::Disconnected {
                handle,
                reason: UNKNOWN_DISCONNECT_REASON,
            });
        }
    }
}

#[async_trait::async_trait]
impl HostAdapter for BluezAdapter {
    async fn power_on(&self) -> BleResult<()> {
        if !self.adapter.is_powered().await.unwrap_or(false) {
            self.adapter
                .set_powered(true)
                .await
                .map_err(|e| bluer_error("power on", e))?;
        }
        Ok(())
    }

    async fn watch(&self) -> BleResult<mpsc::UnboundedReceiver<AdapterEvent>> {
        let mut adapter_events = Box::pin(
            self.adapter
                .events()
                .await
                .map_err(|e| bluer_error("adapter events", e))?,
        );
        let known = self
            .adapter
            .device_addresses()
            .await
            .map_err(|e| bluer_error("device list", e))?;

        let (tx, rx) = mpsc::unbounded_channel();
        let mut connections = Connections {
            adapter: self.adapter.clone(),
            tx,
            watched: HashSet::new(),
            handles: HashMap::new(),
            next_handle: 1,
        };

        tokio::spawn(async move {
            let mut devices: SelectAll<DeviceEvents> = SelectAll::new();
            for addr in known {
                connections.watch_device(addr, &mut devices).await;
            }
            loop {
                tokio::select! {
                    _ = connections.tx.closed() => break,
                    event = adapter_events.next() => match event {
                        Some(bluer::AdapterEvent::DeviceAdded(addr)) => {
                            connections.watch_device(addr, &mut devices).await;
                        }
                        Some(bluer::AdapterEvent::DeviceRemoved(addr)) => {
                            connections.disconnected(addr);
                            connections.watched.remove(&addr);
                        }
                        Some(bluer::AdapterEvent::PropertyChanged(
                            AdapterProperty::Powered(false),
                        )) => {
                            let _ = connections.tx.send(AdapterEvent::PoweredOff);
                        }
                        Some(_) => {}
                        None => break,
                    },
                    Some((addr, event)) = devices.next() => {
                        if let DeviceEvent::PropertyChanged(DeviceProperty::Connected(up)) = event {
                            if up {
                                connections.connected(addr);
                            } else {
                                connections.disconnected(addr);
                            }
                        }
                    }
                }
            }
            debug!("BlueZ event watch stopped");
        });
        Ok(rx)
    }

    async fn serve_gatt(&self, access: GattAccess) -> BleResult<Registration> {
        let read_access = access.clone();
        let write_access = access;

        let app = Application {
            services: vec![Service {
                uuid: RUSTCAM_SERVICE_UUID,
                primary: true,
                characteristics: vec![
                    Characteristic {
                        uuid: RUSTCAM_READ_CHARACTERISTIC_UUID,
                        read: Some(CharacteristicRead {
                            read: true,
                            fun: Box::new(move |req| {
                                let access = read_access.clone();
                                async move {
                                    access.read(usize::from(req.offset)).map_err(req_error)
                                }
                                .boxed()
                            }),
                            ..Default::default()
                        }),
                        ..Default::default()
                    },
                    Characteristic {
                        uuid: RUSTCAM_WRITE_CHARACTERISTIC_UUID,
                        write: Some(CharacteristicWrite {
                            write: true,
                            write_without_response: true,
                            method: CharacteristicWriteMethod::Fun(Box::new(
                                move |value, req| {
                                    let access = write_access.clone();
                                    async move {
                                        access
                                            .write(usize::from(req.offset), &value)
                                            .map(|_| ())
                                            .map_err(req_error)
                                    }
                                    .boxed()
                                },
                            )),
                            ..Default::default()
                        }),
                        ..Default::default()
                    },
                ],
                ..Default::default()
            }],
            ..Default::default()
        };

        let handle = self
            .adapter
            .serve_gatt_application(app)
            .await
            .map_err(|e| bluer_error("GATT registration", e))?;
        info!("RustCam service registered with BlueZ");
        Ok(Registration::new(handle))
    }

    async fn advertise(&self, params: &AdvertiseParams) -> BleResult<Registration> {
        let advertisement = Advertisement {
            advertisement_type: AdvertisementType::Peripheral,
            local_name: Some(params.local_name.clone()),
            discoverable: Some(true),
            min_interval: Some(params.interval),
            max_interval: Some(params.interval),
            ..Default::default()
        };
        let handle = self
            .adapter
            .advertise(advertisement)
            .await
            .map_err(|e| bluer_error("advertise", e))?;
        info!("Advertising '{}' through BlueZ", params.local_name);
        Ok(Registration::new(handle))
    }
}
