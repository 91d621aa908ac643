//! Event-driven host stack on a Bluetooth daemon adapter
//!
//! The daemon owns the controller and runs the host protocols. This backend
//! drives one adapter through the [`HostAdapter`] seam:
//!
//! - a boot task powers the adapter, subscribes to its events and publishes
//!   the RustCam service, then raises `Synced`. A failed step raises
//!   `Reset` and the boot is retried with a growing backoff
//! - a watch task turns adapter notifications into connection events. A
//!   power loss raises `Reset` and boots the adapter again
//!
//! `stack_start` returns as soon as the boot task runs.

use std::any::Any;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::advertising::AdvertisingData;
use crate::config::{BackendKind, PeripheralConfig};
use crate::error::{BleError, BleResult, CODE_CANCELED, CODE_NET_DOWN, CODE_TIMEOUT};
use crate::event::{EventSender, StackEvent};
use crate::gatt::{self, AccessError, GattHandles, GattServer};
use crate::protocol::{BdAddr, DEFAULT_DEVICE_NAME};

use super::{Backend, Capabilities, StackContext};

/// Upper bound of the boot retry backoff
pub const MAX_RETRY_BACKOFF: Duration = Duration::from_secs(8);

// ----------------------------------------------------------------------------
// Settings
// ----------------------------------------------------------------------------

/// Host stack parameters
#[derive(Debug, Clone)]
pub struct HostSettings {
    /// Upper bound on a single adapter call
    pub command_timeout: Duration,
    pub adv_interval: Duration,
    /// First delay before a failed boot is retried
    pub retry_backoff: Duration,
}

impl Default for HostSettings {
    fn default() -> Self {
        Self::from_config(&PeripheralConfig::default())
    }
}

impl HostSettings {
    pub fn from_config(config: &PeripheralConfig) -> Self {
        Self {
            command_timeout: config.command_timeout(),
            adv_interval: config.adv_interval(),
            retry_backoff: Duration::from_millis(500),
        }
    }

    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }
}

// ----------------------------------------------------------------------------
// Adapter Seam
// ----------------------------------------------------------------------------

/// Notification from the adapter the host stack reacts to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterEvent {
    Connected { handle: u16, peer: BdAddr },
    Disconnected { handle: u16, reason: u8 },
    /// Adapter lost power; every registration on it is gone
    PoweredOff,
}

/// Advertisement as handed to the adapter
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdvertiseParams {
    pub local_name: String,
    pub interval: Duration,
}

/// Keeps an adapter-side registration alive. Dropping it withdraws the
/// registration.
pub struct Registration(Box<dyn Any + Send>);

impl Registration {
    pub fn new<T: Send + 'static>(guard: T) -> Self {
        Self(Box::new(guard))
    }
}

/// Attribute access forwarded by the adapter's GATT server
#[derive(Clone)]
pub struct GattAccess {
    gatt: Arc<GattServer>,
    handles: GattHandles,
}

impl GattAccess {
    pub fn new(gatt: Arc<GattServer>, handles: GattHandles) -> Self {
        Self { gatt, handles }
    }

    /// Read of the read characteristic starting at `offset`
    pub fn read(&self, offset: usize) -> Result<Vec<u8>, AccessError> {
        self.gatt.read_at(self.handles.read_message, offset)
    }

    /// Write of the command characteristic at `offset`. Returns the number
    /// of bytes kept.
    pub fn write(&self, offset: usize, value: &[u8]) -> Result<usize, AccessError> {
        self.gatt.write_at(self.handles.command, offset, value)
    }
}

/// One adapter of a Bluetooth daemon
#[async_trait::async_trait]
pub trait HostAdapter: Send + Sync + 'static {
    /// Power the adapter on; a powered adapter is not an error
    async fn power_on(&self) -> BleResult<()>;

    /// Subscribe to adapter notifications
    async fn watch(&self) -> BleResult<mpsc::UnboundedReceiver<AdapterEvent>>;

    /// Publish the RustCam service
    async fn serve_gatt(&self, access: GattAccess) -> BleResult<Registration>;

    async fn advertise(&self, params: &AdvertiseParams) -> BleResult<Registration>;
}

/// Opens an adapter when the stack starts
#[async_trait::async_trait]
pub trait AdapterOpener: Send + Sync + 'static {
    type Adapter: HostAdapter;

    async fn open(&self) -> BleResult<Self::Adapter>;
}

// ----------------------------------------------------------------------------
// Shared Link State
// ----------------------------------------------------------------------------

/// State shared between the backend handle and its background tasks
struct HostLink<A: HostAdapter> {
    adapter: A,
    settings: HostSettings,
    events: EventSender,
    access: GattAccess,
    boot: Mutex<Option<JoinHandle<()>>>,
    watcher: Mutex<Option<JoinHandle<()>>>,
    application: Mutex<Option<Registration>>,
    advertisement: Mutex<Option<Registration>>,
    connected: AtomicBool,
    conn_handle: AtomicU16,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn replace_task(slot: &Mutex<Option<JoinHandle<()>>>, task: Option<JoinHandle<()>>) {
    let previous = std::mem::replace(&mut *lock(slot), task);
    if let Some(previous) = previous {
        previous.abort();
    }
}

impl<A: HostAdapter> HostLink<A> {
    /// Run one adapter call, bounded by the command timeout
    async fn bounded<T>(
        &self,
        what: &str,
        call: impl Future<Output = BleResult<T>>,
    ) -> BleResult<T> {
        match tokio::time::timeout(self.settings.command_timeout, call).await {
            Ok(result) => result,
            Err(_) => {
                warn!("Adapter call '{}' timed out", what);
                Err(BleError::backend(CODE_TIMEOUT))
            }
        }
    }

    fn emit(&self, event: StackEvent) {
        if self.events.send(event).is_err() {
            debug!("Dropping {} event, state machine gone", event.name());
        }
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn release_registrations(&self) {
        drop(lock(&self.advertisement).take());
        drop(lock(&self.application).take());
    }

    fn abort_tasks(&self) {
        replace_task(&self.boot, None);
        replace_task(&self.watcher, None);
    }

    /// The adapter dropped out from under the host: report it and boot again
    fn lose_sync(self: &Arc<Self>, reason: i32) {
        self.release_registrations();
        self.connected.store(false, Ordering::SeqCst);
        self.emit(StackEvent::Reset { reason });
        spawn_boot(self);
    }
}

/// Power the adapter, subscribe to it and publish the service
async fn boot_once<A: HostAdapter>(link: &Arc<HostLink<A>>) -> BleResult<()> {
    link.release_registrations();
    link.bounded("power on", link.adapter.power_on()).await?;

    let events = link.bounded("watch", link.adapter.watch()).await?;
    replace_task(&link.watcher, Some(tokio::spawn(watch_loop(link.clone(), events))));

    let application = link
        .bounded("register GATT", link.adapter.serve_gatt(link.access.clone()))
        .await?;
    *lock(&link.application) = Some(application);
    Ok(())
}

/// Boot until it succeeds, then report sync
async fn boot<A: HostAdapter>(link: Arc<HostLink<A>>) {
    let mut backoff = link.settings.retry_backoff;
    loop {
        match boot_once(&link).await {
            Ok(()) => break,
            Err(err) => {
                error!("BLE host boot failed: {}, retrying in {:?}", err, backoff);
                replace_task(&link.watcher, None);
                link.emit(StackEvent::Reset { reason: err.code() });
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(MAX_RETRY_BACKOFF);
            }
        }
    }
    info!("BLE host synced");
    link.emit(StackEvent::Synced);
}

fn spawn_boot<A: HostAdapter>(link: &Arc<HostLink<A>>) {
    replace_task(&link.boot, Some(tokio::spawn(boot(link.clone()))));
}

/// Turn adapter notifications into stack events
async fn watch_loop<A: HostAdapter>(
    link: Arc<HostLink<A>>,
    mut events: mpsc::UnboundedReceiver<AdapterEvent>,
) {
    while let Some(event) = events.recv().await {
        match event {
            AdapterEvent::Connected { handle, peer } => {
                info!("Central {} connected, handle {}", peer, handle);
                link.conn_handle.store(handle, Ordering::SeqCst);
                link.connected.store(true, Ordering::SeqCst);
                link.emit(StackEvent::Connected { status: 0, handle });
            }
            AdapterEvent::Disconnected { handle, reason } => {
                info!("Handle {} disconnected, reason 0x{:02X}", handle, reason);
                link.connected.store(false, Ordering::SeqCst);
                link.emit(StackEvent::Disconnected { handle, reason });
            }
            AdapterEvent::PoweredOff => {
                error!("Adapter powered off, rebooting host");
                link.lose_sync(CODE_NET_DOWN);
                return;
            }
        }
    }
    warn!("Adapter event stream ended, rebooting host");
    link.lose_sync(CODE_CANCELED);
}

// ----------------------------------------------------------------------------
// Host Backend
// ----------------------------------------------------------------------------

/// Event-driven backend over any [`AdapterOpener`]
pub struct HostBackend<O: AdapterOpener> {
    opener: O,
    settings: HostSettings,
    link: Option<Arc<HostLink<O::Adapter>>>,
}

impl<O: AdapterOpener> HostBackend<O> {
    pub fn new(opener: O, settings: HostSettings) -> Self {
        Self {
            opener,
            settings,
            link: None,
        }
    }

    fn link(&self) -> BleResult<&Arc<HostLink<O::Adapter>>> {
        self.link.as_ref().ok_or(BleError::NotInitialized)
    }

    /// Handle of the current connection
    pub fn connection_handle(&self) -> Option<u16> {
        let link = self.link.as_ref()?;
        link.is_connected()
            .then(|| link.conn_handle.load(Ordering::SeqCst))
    }

    /// Whether an advertisement is registered with the adapter
    pub fn is_advertising(&self) -> bool {
        self.link
            .as_ref()
            .is_some_and(|link| lock(&link.advertisement).is_some())
    }
}

#[async_trait::async_trait]
impl<O: AdapterOpener> Backend for HostBackend<O> {
    fn kind(&self) -> BackendKind {
        BackendKind::Host
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            host_sync: true,
            connection_events: true,
            gatt_server: true,
        }
    }

    async fn stack_start(&mut self, ctx: StackContext) -> BleResult<()> {
        if self.link.is_some() {
            return Err(BleError::AlreadyInitialized);
        }

        let handles = gatt::register().handles();
        let adapter = self.opener.open().await.map_err(|e| {
            error!("Failed to open BLE adapter: {}", e);
            e
        })?;

        let link = Arc::new(HostLink {
            adapter,
            settings: self.settings.clone(),
            events: ctx.events,
            access: GattAccess::new(ctx.gatt, handles),
            boot: Mutex::new(None),
            watcher: Mutex::new(None),
            application: Mutex::new(None),
            advertisement: Mutex::new(None),
            connected: AtomicBool::new(false),
            conn_handle: AtomicU16::new(0),
        });
        spawn_boot(&link);

        info!("BLE host stack started");
        self.link = Some(link);
        Ok(())
    }

    async fn stack_stop(&mut self) -> BleResult<()> {
        let link = self.link.take().ok_or(BleError::NotInitialized)?;
        link.abort_tasks();
        link.release_registrations();
        link.connected.store(false, Ordering::SeqCst);
        info!("BLE host stack stopped");
        Ok(())
    }

    async fn advertise_start(&mut self, data: &AdvertisingData) -> BleResult<()> {
        let link = self.link()?.clone();
        let params = AdvertiseParams {
            local_name: data.local_name().unwrap_or(DEFAULT_DEVICE_NAME).to_string(),
            interval: link.settings.adv_interval,
        };

        // The adapter holds one RustCam advertisement at a time
        let replaced = lock(&link.advertisement).take();
        if replaced.is_some() {
            debug!("Replacing advertisement");
        }
        drop(replaced);

        let registration = link
            .bounded("advertise", link.adapter.advertise(&params))
            .await?;
        *lock(&link.advertisement) = Some(registration);
        Ok(())
    }

    async fn advertise_stop(&mut self) -> BleResult<()> {
        let link = self.link()?;
        if lock(&link.advertisement).take().is_some() {
            debug!("Advertisement withdrawn");
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.link.as_ref().is_some_and(|link| link.is_connected())
    }
}

impl<O: AdapterOpener> Drop for HostBackend<O> {
    fn drop(&mut self) {
        if let Some(link) = self.link.take() {
            link.abort_tasks();
            link.release_registrations();
        }
    }
}
