//! Shared fixtures: a scriptable backend, an in-memory BlueZ adapter and an
//! in-memory HCI controller

#![allow(dead_code)]

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rustcam_ble::backend::hci::{HciOpener, HciTransport, HCI_EVENT_PKT};
use rustcam_ble::backend::{
    AdapterEvent, AdapterOpener, AdvertiseParams, GattAccess, HostAdapter, Registration,
};
use rustcam_ble::event::EventSender;
use rustcam_ble::{
    AdvertisingData, Backend, BackendKind, BleError, BleResult, Capabilities, LinkState,
    Peripheral, StackContext, StackEvent, StateSnapshot,
};

// ----------------------------------------------------------------------------
// Mock Backend
// ----------------------------------------------------------------------------

#[derive(Default)]
struct MockInner {
    events: Option<EventSender>,
    stack_starts: usize,
    stack_stops: usize,
    advertise_starts: usize,
    advertise_stops: usize,
    last_payload: Option<Vec<u8>>,
    fail_stack_start: Option<BleError>,
    fail_advertise_start: Option<BleError>,
    fail_advertise_stop: Option<BleError>,
    connected: bool,
}

/// Backend whose behavior tests script through a shared [`MockHandle`]
pub struct MockBackend {
    capabilities: Capabilities,
    inner: Arc<Mutex<MockInner>>,
}

/// Test-side view of a [`MockBackend`]
#[derive(Clone)]
pub struct MockHandle {
    inner: Arc<Mutex<MockInner>>,
}

impl MockBackend {
    /// Backend that boots asynchronously and reports connections
    pub fn event_driven() -> (Self, MockHandle) {
        Self::with_capabilities(Capabilities {
            host_sync: true,
            connection_events: true,
            gatt_server: true,
        })
    }

    /// Backend that is ready as soon as it starts
    pub fn synchronous() -> (Self, MockHandle) {
        Self::with_capabilities(Capabilities::default())
    }

    fn with_capabilities(capabilities: Capabilities) -> (Self, MockHandle) {
        let inner = Arc::new(Mutex::new(MockInner::default()));
        (
            Self {
                capabilities,
                inner: inner.clone(),
            },
            MockHandle { inner },
        )
    }
}

#[async_trait::async_trait]
impl Backend for MockBackend {
    fn kind(&self) -> BackendKind {
        if self.capabilities.host_sync {
            BackendKind::Host
        } else {
            BackendKind::Native
        }
    }

    fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    async fn stack_start(&mut self, ctx: StackContext) -> BleResult<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(err) = inner.fail_stack_start.clone() {
            return Err(err);
        }
        inner.stack_starts += 1;
        inner.events = Some(ctx.events);
        Ok(())
    }

    async fn stack_stop(&mut self) -> BleResult<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.stack_stops += 1;
        inner.events = None;
        Ok(())
    }

    async fn advertise_start(&mut self, data: &AdvertisingData) -> BleResult<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(err) = inner.fail_advertise_start.clone() {
            return Err(err);
        }
        inner.advertise_starts += 1;
        inner.last_payload = Some(data.as_bytes().to_vec());
        Ok(())
    }

    async fn advertise_stop(&mut self) -> BleResult<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(err) = inner.fail_advertise_stop.clone() {
            return Err(err);
        }
        inner.advertise_stops += 1;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.inner.lock().unwrap().connected
    }
}

impl MockHandle {
    /// Deliver a stack event as the backend would
    pub fn emit(&self, event: StackEvent) {
        let inner = self.inner.lock().unwrap();
        let events = inner.events.as_ref().expect("stack not started");
        events.send(event).expect("event loop gone");
    }

    pub fn stack_starts(&self) -> usize {
        self.inner.lock().unwrap().stack_starts
    }

    pub fn stack_stops(&self) -> usize {
        self.inner.lock().unwrap().stack_stops
    }

    pub fn advertise_starts(&self) -> usize {
        self.inner.lock().unwrap().advertise_starts
    }

    pub fn advertise_stops(&self) -> usize {
        self.inner.lock().unwrap().advertise_stops
    }

    pub fn last_payload(&self) -> Option<Vec<u8>> {
        self.inner.lock().unwrap().last_payload.clone()
    }

    pub fn fail_stack_start(&self, err: Option<BleError>) {
        self.inner.lock().unwrap().fail_stack_start = err;
    }

    pub fn fail_advertise_start(&self, err: Option<BleError>) {
        self.inner.lock().unwrap().fail_advertise_start = err;
    }

    pub fn fail_advertise_stop(&self, err: Option<BleError>) {
        self.inner.lock().unwrap().fail_advertise_stop = err;
    }

    /// Link state the backend itself reports
    pub fn set_connected(&self, connected: bool) {
        self.inner.lock().unwrap().connected = connected;
    }
}

/// Wait until the event loop has processed `count` events since init
pub async fn settle<B: Backend>(peripheral: &Peripheral<B>, count: u64) -> StateSnapshot {
    let mut rx = peripheral.watch_state();
    let snapshot = tokio::time::timeout(
        Duration::from_secs(5),
        rx.wait_for(|s| s.events_processed >= count),
    )
    .await
    .expect("timed out waiting for stack events")
    .expect("state channel closed")
    .clone();
    snapshot
}

/// Wait until the derived link state reaches `link`
pub async fn wait_for_link<B: Backend>(peripheral: &Peripheral<B>, link: LinkState) -> StateSnapshot {
    let mut rx = peripheral.watch_state();
    let snapshot = tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|s| s.link == link))
        .await
        .expect("timed out waiting for link state")
        .expect("state channel closed")
        .clone();
    snapshot
}

// ----------------------------------------------------------------------------
// Fake Adapter
// ----------------------------------------------------------------------------

/// Counts live registrations of one kind
struct Live(Arc<AtomicUsize>);

impl Live {
    fn new(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter.clone())
    }
}

impl Drop for Live {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct AdapterInner {
    opens: AtomicUsize,
    power_ons: AtomicUsize,
    power_on_failures: AtomicUsize,
    watches: AtomicUsize,
    gatt_serves: AtomicUsize,
    advertises: AtomicUsize,
    live_applications: Arc<AtomicUsize>,
    live_advertisements: Arc<AtomicUsize>,
    fail_advertise: Mutex<Option<BleError>>,
    last_advertise: Mutex<Option<AdvertiseParams>>,
    events: Mutex<Option<tokio::sync::mpsc::UnboundedSender<AdapterEvent>>>,
    access: Mutex<Option<GattAccess>>,
}

/// In-memory BlueZ adapter: records registrations and lets tests play the
/// central through the published GATT access
#[derive(Clone, Default)]
pub struct FakeAdapter {
    inner: Arc<AdapterInner>,
}

impl FakeAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `count` power-on attempts
    pub fn fail_power_on(&self, count: usize) {
        self.inner.power_on_failures.store(count, Ordering::SeqCst);
    }

    pub fn fail_advertise(&self, err: Option<BleError>) {
        *self.inner.fail_advertise.lock().unwrap() = err;
    }

    pub fn opens(&self) -> usize {
        self.inner.opens.load(Ordering::SeqCst)
    }

    pub fn power_ons(&self) -> usize {
        self.inner.power_ons.load(Ordering::SeqCst)
    }

    pub fn watches(&self) -> usize {
        self.inner.watches.load(Ordering::SeqCst)
    }

    pub fn gatt_serves(&self) -> usize {
        self.inner.gatt_serves.load(Ordering::SeqCst)
    }

    pub fn advertises(&self) -> usize {
        self.inner.advertises.load(Ordering::SeqCst)
    }

    /// Service registrations still held by the host
    pub fn live_applications(&self) -> usize {
        self.inner.live_applications.load(Ordering::SeqCst)
    }

    /// Advertisements still held by the host
    pub fn live_advertisements(&self) -> usize {
        self.inner.live_advertisements.load(Ordering::SeqCst)
    }

    pub fn last_advertise(&self) -> Option<AdvertiseParams> {
        self.inner.last_advertise.lock().unwrap().clone()
    }

    /// Deliver an adapter notification to the current subscriber
    pub fn notify(&self, event: AdapterEvent) {
        let events = self.inner.events.lock().unwrap();
        events
            .as_ref()
            .expect("nobody is watching the adapter")
            .send(event)
            .expect("watch loop gone");
    }

    /// GATT access of the published service
    pub fn access(&self) -> GattAccess {
        self.inner
            .access
            .lock()
            .unwrap()
            .clone()
            .expect("service not published")
    }

    /// Poll until `done` holds for this adapter
    pub async fn wait_until(&self, done: impl Fn(&FakeAdapter) -> bool) {
        for _ in 0..500 {
            if done(self) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("timed out waiting for the adapter");
    }
}

#[async_trait::async_trait]
impl AdapterOpener for FakeAdapter {
    type Adapter = FakeAdapter;

    async fn open(&self) -> BleResult<FakeAdapter> {
        self.inner.opens.fetch_add(1, Ordering::SeqCst);
        Ok(self.clone())
    }
}

#[async_trait::async_trait]
impl HostAdapter for FakeAdapter {
    async fn power_on(&self) -> BleResult<()> {
        self.inner.power_ons.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .inner
            .power_on_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(BleError::backend(-5));
        }
        Ok(())
    }

    async fn watch(&self) -> BleResult<tokio::sync::mpsc::UnboundedReceiver<AdapterEvent>> {
        self.inner.watches.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        *self.inner.events.lock().unwrap() = Some(tx);
        Ok(rx)
    }

    async fn serve_gatt(&self, access: GattAccess) -> BleResult<Registration> {
        self.inner.gatt_serves.fetch_add(1, Ordering::SeqCst);
        *self.inner.access.lock().unwrap() = Some(access);
        Ok(Registration::new(Live::new(&self.inner.live_applications)))
    }

    async fn advertise(&self, params: &AdvertiseParams) -> BleResult<Registration> {
        if let Some(err) = self.inner.fail_advertise.lock().unwrap().clone() {
            return Err(err);
        }
        self.inner.advertises.fetch_add(1, Ordering::SeqCst);
        *self.inner.last_advertise.lock().unwrap() = Some(params.clone());
        Ok(Registration::new(Live::new(&self.inner.live_advertisements)))
    }
}

// ----------------------------------------------------------------------------
// Fake Controller
// ----------------------------------------------------------------------------

struct ControllerInner {
    to_host_tx: Mutex<mpsc::Sender<Vec<u8>>>,
    to_host_rx: Mutex<mpsc::Receiver<Vec<u8>>>,
    sent: Mutex<Vec<Vec<u8>>>,
    command_status: Mutex<HashMap<u16, u8>>,
    opens: AtomicUsize,
}

/// In-memory controller: acknowledges every command with Command Complete
/// and lets tests inject events
#[derive(Clone)]
pub struct FakeController {
    inner: Arc<ControllerInner>,
}

/// Transport end handed to the host stack
pub struct FakeTransport {
    inner: Arc<ControllerInner>,
}

impl FakeController {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel();
        Self {
            inner: Arc::new(ControllerInner {
                to_host_tx: Mutex::new(tx),
                to_host_rx: Mutex::new(rx),
                sent: Mutex::new(Vec::new()),
                command_status: Mutex::new(HashMap::new()),
                opens: AtomicUsize::new(0),
            }),
        }
    }

    /// Answer `opcode` with a non-zero status from now on
    pub fn fail_command(&self, opcode: u16, status: u8) {
        self.inner.command_status.lock().unwrap().insert(opcode, status);
    }

    pub fn opens(&self) -> usize {
        self.inner.opens.load(Ordering::SeqCst)
    }

    /// Queue a raw H4 packet towards the host
    pub fn inject(&self, packet: Vec<u8>) {
        self.inner.to_host_tx.lock().unwrap().send(packet).unwrap();
    }

    pub fn inject_event(&self, code: u8, params: &[u8]) {
        let mut packet = vec![HCI_EVENT_PKT, code, params.len() as u8];
        packet.extend_from_slice(params);
        self.inject(packet);
    }

    /// Every packet the host has sent, in order
    pub fn sent(&self) -> Vec<Vec<u8>> {
        self.inner.sent.lock().unwrap().clone()
    }

    /// Opcodes of every command the host has sent, in order
    pub fn commands(&self) -> Vec<u16> {
        self.sent()
            .iter()
            .filter(|p| p.first() == Some(&0x01) && p.len() >= 3)
            .map(|p| u16::from_le_bytes([p[1], p[2]]))
            .collect()
    }

    /// Parameters of the last command sent with `opcode`
    pub fn last_params(&self, opcode: u16) -> Option<Vec<u8>> {
        self.sent()
            .iter()
            .rev()
            .find(|p| p.first() == Some(&0x01) && p.len() >= 4 && u16::from_le_bytes([p[1], p[2]]) == opcode)
            .map(|p| p[4..].to_vec())
    }
}

impl HciOpener for FakeController {
    type Transport = FakeTransport;

    fn open(&self) -> io::Result<FakeTransport> {
        self.inner.opens.fetch_add(1, Ordering::SeqCst);
        Ok(FakeTransport {
            inner: self.inner.clone(),
        })
    }
}

impl HciTransport for FakeTransport {
    fn send(&self, packet: &[u8]) -> io::Result<()> {
        self.inner.sent.lock().unwrap().push(packet.to_vec());
        if packet.first() == Some(&0x01) && packet.len() >= 3 {
            let opcode = u16::from_le_bytes([packet[1], packet[2]]);
            let status = self
                .inner
                .command_status
                .lock()
                .unwrap()
                .get(&opcode)
                .copied()
                .unwrap_or(0);
            let [lo, hi] = opcode.to_le_bytes();
            let reply = vec![HCI_EVENT_PKT, 0x0E, 0x04, 0x01, lo, hi, status];
            self.inner.to_host_tx.lock().unwrap().send(reply).unwrap();
        }
        Ok(())
    }

    fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        let rx = self.inner.to_host_rx.lock().unwrap();
        match rx.recv_timeout(Duration::from_millis(10)) {
            Ok(packet) => {
                let len = packet.len().min(buf.len());
                buf[..len].copy_from_slice(&packet[..len]);
                Ok(len)
            }
            Err(RecvTimeoutError::Timeout) => Err(io::ErrorKind::WouldBlock.into()),
            Err(RecvTimeoutError::Disconnected) => Err(io::ErrorKind::BrokenPipe.into()),
        }
    }
}
