//! BLE peripheral: lifecycle, advertising and stack event handling
//!
//! [`Peripheral`] owns the [`PeripheralState`] and the backend behind one
//! async mutex. Public calls and stack events apply their transitions while
//! holding it, so no caller ever observes a half-applied transition.
//!
//! Stack events arrive on a channel handed to the backend at start and are
//! consumed by one task per init generation. `deinit` aborts that task
//! while holding the lock.

use std::fmt;
use std::ops::ControlFlow;
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::{watch, Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::advertising::AdvertisingData;
use crate::backend::{Backend, Capabilities, PlatformBackend, StackContext};
use crate::config::{BackendKind, PeripheralConfig};
use crate::error::{BleError, BleResult};
use crate::event::{self, EventReceiver, StackEvent};
use crate::gatt::{self, GattHandles, GattServer};
use crate::protocol::MAX_COMMAND_LEN;
use crate::state::{DeviceName, LinkState, PeripheralState, StateSnapshot};

// ----------------------------------------------------------------------------
// Shared Core
// ----------------------------------------------------------------------------

struct Core<B> {
    state: PeripheralState,
    backend: B,
    event_task: Option<JoinHandle<()>>,
    events_processed: u64,
}

struct Shared<B> {
    core: Mutex<Core<B>>,
    gatt: Arc<GattServer>,
    state_tx: watch::Sender<StateSnapshot>,
    default_name: DeviceName,
    config: PeripheralConfig,
}

impl<B> Shared<B> {
    fn fresh_state(&self) -> PeripheralState {
        PeripheralState {
            device_name: self.default_name.clone(),
            ..PeripheralState::default()
        }
    }

    fn publish(&self, core: &Core<B>) {
        self.state_tx
            .send_replace(StateSnapshot::new(&core.state, core.events_processed));
    }
}

impl<B: Backend> Shared<B> {
    /// Build the payload from the current name and start advertising
    async fn advertise(&self, core: &mut Core<B>) -> BleResult<()> {
        let data = AdvertisingData::for_device(&core.state.device_name);
        core.backend.advertise_start(&data).await?;
        core.state.advertising = true;
        info!("Advertising as '{}'", core.state.device_name);
        Ok(())
    }

    /// Re-issue advertising after the stack dropped it. Failures keep the
    /// advertising intent so the next disconnect or sync tries again.
    async fn resume_advertising(&self, core: &mut Core<B>, cause: &str) {
        info!("Resuming advertising after {}", cause);
        if let Err(e) = self.advertise(core).await {
            error!("Failed to resume advertising after {}: {}", cause, e);
        }
    }

    async fn handle_event(&self, core: &mut Core<B>, event: StackEvent) {
        if !core.state.initialized {
            debug!("Ignoring {} event while uninitialized", event.name());
            return;
        }
        core.events_processed += 1;

        match event {
            StackEvent::Synced => {
                info!("BLE host synced");
                if core.state.record_sync() {
                    self.resume_advertising(core, "host sync").await;
                }
            }
            StackEvent::Reset { reason } => {
                warn!(reason, "BLE host reset");
                core.state.record_reset();
            }
            StackEvent::Connected { status, handle } => {
                if status == 0 {
                    info!(handle, "Central connected");
                } else {
                    warn!(status, "Connection attempt failed");
                }
                if core.state.record_connect(status, handle) {
                    self.resume_advertising(core, "failed connection").await;
                }
            }
            StackEvent::Disconnected { handle, reason } => {
                info!(handle, reason, "Central disconnected");
                if core.state.record_disconnect(reason) {
                    self.resume_advertising(core, "disconnect").await;
                }
            }
        }
        self.publish(core);
    }
}

/// Consume stack events until the channel closes or the peripheral is dropped
async fn event_loop<B: Backend>(shared: Weak<Shared<B>>, mut events: EventReceiver) {
    while let Some(event) = events.recv().await {
        let Some(shared) = shared.upgrade() else {
            break;
        };
        let mut core = shared.core.lock().await;
        debug!("Handling {} event", event.name());
        shared.handle_event(&mut core, event).await;
    }
    debug!("Stack event loop stopped");
}

// ----------------------------------------------------------------------------
// Status Report
// ----------------------------------------------------------------------------

/// Point-in-time dump of the peripheral for diagnostics
#[derive(Debug, Clone, serde::Serialize)]
pub struct StatusReport {
    pub backend: BackendKind,
    pub capabilities: Capabilities,
    pub snapshot: StateSnapshot,
    /// Link state reported by the backend itself
    pub backend_connected: bool,
    pub gatt_registered: bool,
    pub device_name_handle: Option<u16>,
    pub read_handle: Option<u16>,
    pub write_handle: Option<u16>,
    pub read_message: String,
    pub pending_command_len: usize,
}

impl fmt::Display for StatusReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = &self.snapshot.state;
        let handle = |h: Option<u16>| h.map_or_else(|| "-".to_string(), |h| h.to_string());
        writeln!(f, "=== BLE Status ===")?;
        writeln!(f, "  Backend:      {} ({})", self.backend, self.capabilities)?;
        writeln!(f, "  State:        {}", self.snapshot.link)?;
        writeln!(f, "  Initialized:  {}", state.initialized)?;
        writeln!(f, "  Host synced:  {}", state.host_synced)?;
        writeln!(f, "  Advertising:  {}", state.advertising)?;
        writeln!(f, "  Pending adv:  {}", state.pending_advertise)?;
        writeln!(
            f,
            "  Connected:    {} (backend: {})",
            state.connected, self.backend_connected
        )?;
        writeln!(f, "  Conn handle:  {}", handle(state.connection_handle))?;
        writeln!(f, "  Device name:  {}", state.device_name)?;
        writeln!(f, "  Read message: {}", self.read_message)?;
        writeln!(
            f,
            "  GATT:         registered={} name={} read={} write={}",
            self.gatt_registered,
            handle(self.device_name_handle),
            handle(self.read_handle),
            handle(self.write_handle)
        )?;
        writeln!(f, "  Command:      {} bytes pending", self.pending_command_len)?;
        write!(f, "  Events:       {}", self.snapshot.events_processed)
    }
}

// ----------------------------------------------------------------------------
// Peripheral
// ----------------------------------------------------------------------------

/// BLE peripheral control handle
///
/// Cloning yields another handle to the same peripheral.
pub struct Peripheral<B: Backend = PlatformBackend> {
    shared: Arc<Shared<B>>,
}

impl<B: Backend> Clone for Peripheral<B> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl Peripheral<PlatformBackend> {
    /// Create a peripheral on the backend named by `config`
    pub fn new(config: PeripheralConfig) -> Self {
        let backend = PlatformBackend::from_config(&config);
        Self::with_backend(backend, config)
    }
}

impl<B: Backend> Peripheral<B> {
    /// Create a peripheral on an explicit backend
    pub fn with_backend(backend: B, config: PeripheralConfig) -> Self {
        if let Err(e) = config.validate() {
            warn!("{}; continuing with clamped and default values", e);
        }
        let default_name = DeviceName::new(&config.device_name).unwrap_or_else(|e| {
            warn!("Configured device name rejected ({}), using default", e);
            DeviceName::default()
        });

        let gatt = Arc::new(GattServer::new());
        gatt.set_read_message(Some(&config.read_message));
        gatt.set_device_name(&default_name);

        let state = PeripheralState {
            device_name: default_name.clone(),
            ..PeripheralState::default()
        };
        let (state_tx, _) = watch::channel(StateSnapshot::new(&state, 0));

        Self {
            shared: Arc::new(Shared {
                core: Mutex::new(Core {
                    state,
                    backend,
                    event_task: None,
                    events_processed: 0,
                }),
                gatt,
                state_tx,
                default_name,
                config,
            }),
        }
    }

    async fn lock(&self) -> MutexGuard<'_, Core<B>> {
        self.shared.core.lock().await
    }

    /// Start the stack and register the GATT table.
    ///
    /// Event-driven backends return before the host is synced; advertising
    /// requested in the meantime is deferred until sync.
    pub async fn init(&self) -> BleResult<()> {
        let mut core = self.lock().await;
        if core.state.initialized {
            return Err(BleError::AlreadyInitialized);
        }

        info!("Initializing BLE ({} backend)", core.backend.kind());
        let (events_tx, events_rx) = event::channel();
        let ctx = StackContext {
            events: events_tx,
            gatt: self.shared.gatt.clone(),
        };
        if let Err(e) = core.backend.stack_start(ctx).await {
            error!("Failed to start BLE stack: {}", e);
            return Err(e);
        }
        gatt::register();

        let capabilities = core.backend.capabilities();
        core.state = self.shared.fresh_state();
        core.state.initialized = true;
        core.state.host_synced = !capabilities.host_sync;
        core.events_processed = 0;
        self.shared.gatt.set_device_name(&core.state.device_name);

        core.event_task = Some(tokio::spawn(event_loop(
            Arc::downgrade(&self.shared),
            events_rx,
        )));
        self.shared.publish(&core);

        if core.state.host_synced {
            info!("BLE initialized");
        } else {
            info!("BLE initialized, waiting for host sync");
        }
        Ok(())
    }

    /// Stop advertising and the stack, then return to the uninitialized state.
    /// Cleanup failures are logged, never returned.
    pub async fn deinit(&self) -> BleResult<()> {
        let mut core = self.lock().await;
        if !core.state.initialized {
            return Err(BleError::NotInitialized);
        }

        if let Some(task) = core.event_task.take() {
            task.abort();
        }
        if core.state.advertising {
            if let Err(e) = core.backend.advertise_stop().await {
                warn!("Failed to stop advertising during deinit: {}", e);
            }
        }
        if let Err(e) = core.backend.stack_stop().await {
            warn!("Failed to stop BLE stack during deinit: {}", e);
        }

        core.state = self.shared.fresh_state();
        core.events_processed = 0;
        self.shared.gatt.set_device_name(&core.state.device_name);
        self.shared.publish(&core);
        info!("BLE deinitialized");
        Ok(())
    }

    /// Advertise as `name`, or as the current name when `name` is absent or
    /// empty. Before host sync the request is recorded and honored on sync.
    pub async fn start_advertising(&self, name: Option<&str>) -> BleResult<()> {
        let mut core = self.lock().await;
        if !core.state.initialized {
            return Err(BleError::NotInitialized);
        }

        let mut name_changed = false;
        if let Some(name) = name.filter(|n| !n.is_empty()) {
            let name = DeviceName::new(name)?;
            if name != core.state.device_name {
                core.state.device_name = name;
                self.shared.gatt.set_device_name(&core.state.device_name);
                name_changed = true;
            }
        }

        if !core.state.host_synced {
            core.state.pending_advertise = true;
            info!("Waiting for host sync before advertising");
            self.shared.publish(&core);
            return Ok(());
        }

        if core.state.advertising && (!name_changed || core.state.connected) {
            // Connected: the new name goes out when advertising resumes
            debug!("Already advertising as '{}'", core.state.device_name);
            self.shared.publish(&core);
            return Ok(());
        }

        let result = self.shared.advertise(&mut core).await;
        if let Err(ref e) = result {
            error!("Failed to start advertising: {}", e);
        }
        self.shared.publish(&core);
        result
    }

    /// Stop advertising. A request still waiting for host sync is dropped.
    /// Succeeds without touching the stack when nothing is advertising.
    pub async fn stop_advertising(&self) -> BleResult<()> {
        let mut core = self.lock().await;
        if !core.state.advertising {
            if core.state.pending_advertise {
                core.state.pending_advertise = false;
                info!("Pending advertising request canceled");
                self.shared.publish(&core);
            }
            return Ok(());
        }

        core.backend.advertise_stop().await.map_err(|e| {
            error!("Failed to stop advertising: {}", e);
            e
        })?;
        core.state.advertising = false;
        core.state.pending_advertise = false;
        info!("Advertising stopped");
        self.shared.publish(&core);
        Ok(())
    }

    /// Whether a central is connected, as reported by the stack
    pub async fn is_connected(&self) -> bool {
        let core = self.lock().await;
        core.state.initialized && core.state.connected
    }

    /// Drain the command mailbox for a caller buffer of `capacity` bytes.
    /// At most `capacity - 1` bytes come back; empty means no command.
    pub fn poll_command(&self, capacity: usize) -> Vec<u8> {
        self.shared.gatt.poll_command(capacity)
    }

    /// Drain the command mailbox into `buf`, NUL-terminated. Returns the
    /// number of command bytes, 0 when none is pending.
    pub fn poll_command_into(&self, buf: &mut [u8]) -> usize {
        self.shared.gatt.poll_command_into(buf)
    }

    /// Whether a command is pending, without consuming it
    pub fn has_command(&self) -> bool {
        self.shared.gatt.has_command()
    }

    /// Set the read characteristic response; `None` or empty restores the default
    pub fn set_read_message(&self, message: Option<&str>) -> BleResult<()> {
        self.shared.gatt.set_read_message(message);
        Ok(())
    }

    pub fn read_message(&self) -> String {
        self.shared.gatt.read_message()
    }

    /// GATT access callbacks, as served to centrals
    pub fn gatt(&self) -> &Arc<GattServer> {
        &self.shared.gatt
    }

    pub fn config(&self) -> &PeripheralConfig {
        &self.shared.config
    }

    /// Current state
    pub async fn snapshot(&self) -> StateSnapshot {
        let core = self.lock().await;
        StateSnapshot::new(&core.state, core.events_processed)
    }

    /// Receiver updated after every transition
    pub fn watch_state(&self) -> watch::Receiver<StateSnapshot> {
        self.shared.state_tx.subscribe()
    }

    /// Diagnostic dump of backend, state and GATT table
    pub async fn status(&self) -> StatusReport {
        let core = self.lock().await;
        let handles: Option<GattHandles> = gatt::registered().map(|t| t.handles());
        StatusReport {
            backend: core.backend.kind(),
            capabilities: core.backend.capabilities(),
            snapshot: StateSnapshot::new(&core.state, core.events_processed),
            backend_connected: core.backend.is_connected(),
            gatt_registered: gatt::is_registered(),
            device_name_handle: handles.map(|h| h.device_name),
            read_handle: handles.map(|h| h.read_message),
            write_handle: handles.map(|h| h.command),
            read_message: self.shared.gatt.read_message(),
            pending_command_len: self.shared.gatt.pending_command_len(),
        }
    }

    /// Advertise as `name` and serve commands until `timeout` elapses or the
    /// handler breaks. Each drained command is passed to `on_command`.
    /// Advertising is stopped on the way out.
    pub async fn run_gatt_server<F>(
        &self,
        name: Option<&str>,
        timeout: Option<Duration>,
        mut on_command: F,
    ) -> BleResult<()>
    where
        F: FnMut(&[u8]) -> ControlFlow<()>,
    {
        self.start_advertising(name).await?;
        info!(
            "GATT server running (timeout: {})",
            timeout.map_or_else(|| "none".to_string(), |t| format!("{:?}", t))
        );

        let deadline = timeout.map(|t| Instant::now() + t);
        let mut ticker = tokio::time::interval(self.shared.config.poll_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut was_connected = false;
        let mut state_rx = self.watch_state();

        loop {
            ticker.tick().await;
            if deadline.is_some_and(|d| Instant::now() >= d) {
                info!("GATT server timeout reached");
                break;
            }

            let connected = state_rx.borrow_and_update().link == LinkState::Connected;
            if connected != was_connected {
                info!(
                    "Client {}",
                    if connected { "connected" } else { "disconnected" }
                );
                was_connected = connected;
            }

            let command = self.poll_command(MAX_COMMAND_LEN + 1);
            if command.is_empty() {
                continue;
            }
            info!("Received command: {}", String::from_utf8_lossy(&command));
            if on_command(&command).is_break() {
                info!("GATT server stopped by handler");
                break;
            }
        }

        if let Err(e) = self.stop_advertising().await {
            warn!("Failed to stop advertising after GATT server run: {}", e);
        }
        Ok(())
    }
}

impl<B> Drop for Shared<B> {
    fn drop(&mut self) {
        if let Some(task) = self.core.get_mut().event_task.take() {
            task.abort();
        }
    }
}
