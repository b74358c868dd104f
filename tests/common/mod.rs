//! Fakes shared by the integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::{sleep, timeout, Instant};
use uuid::Uuid;

use roboscratch_ble::ble::scanner::ScanFilter;
use roboscratch_ble::ble::uuids::{UART_RX_UUID, UART_TX_UUID};
use roboscratch_ble::{
    AdapterState, BlePlatform, Capability, CharacteristicHandle, ConnectionState, Event,
    EventReceiver, GattTarget, Generation, HostShell, LinkConfig, Mailbox, ManagerSnapshot,
    PeripheralId, PlatformCallbacks, PlatformEvent, PlatformVersion, Renderer,
    ResolvedCharacteristics, Result, SessionManager,
};

pub const ROBOT: &str = "AA:BB:CC:DD:EE:FF";

/// A radio request the fake saw.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    AdapterState,
    StartScan,
    StopScan,
    Connect(Generation, PeripheralId),
    Discover(Generation),
    EnableNotifications(Generation),
    Write(Generation, Bytes),
    Read(Generation),
    Release(u64),
    Disconnect(PeripheralId),
}

struct FakeState {
    adapter: AdapterState,
    auto_complete: bool,
    fail_writes: bool,
    read_value: Bytes,
    calls: Vec<Call>,
    live_handles: BTreeSet<u64>,
    next_handle: u64,
}

/// In-memory radio. In auto-complete mode every request immediately posts
/// its success completion; otherwise the test posts completions itself.
#[derive(Clone)]
pub struct FakePlatform {
    callbacks: PlatformCallbacks,
    state: Arc<Mutex<FakeState>>,
}

impl FakePlatform {
    pub fn new(callbacks: PlatformCallbacks) -> Self {
        Self {
            callbacks,
            state: Arc::new(Mutex::new(FakeState {
                adapter: AdapterState::Enabled,
                auto_complete: true,
                fail_writes: false,
                read_value: Bytes::new(),
                calls: Vec::new(),
                live_handles: BTreeSet::new(),
                next_handle: 1,
            })),
        }
    }

    pub fn manual(callbacks: PlatformCallbacks) -> Self {
        let fake = Self::new(callbacks);
        fake.state.lock().auto_complete = false;
        fake
    }

    pub fn set_adapter(&self, adapter: AdapterState) {
        self.state.lock().adapter = adapter;
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.state.lock().fail_writes = fail;
    }

    pub fn set_read_value(&self, value: &'static [u8]) {
        self.state.lock().read_value = Bytes::from_static(value);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().calls.clone()
    }

    pub fn count(&self, matches: impl Fn(&Call) -> bool) -> usize {
        self.state.lock().calls.iter().filter(|c| matches(c)).count()
    }

    pub fn live_handles(&self) -> BTreeSet<u64> {
        self.state.lock().live_handles.clone()
    }

    pub fn writes(&self) -> Vec<Bytes> {
        self.state
            .lock()
            .calls
            .iter()
            .filter_map(|c| match c {
                Call::Write(_, payload) => Some(payload.clone()),
                _ => None,
            })
            .collect()
    }

    /// Generation of the most recent connect.
    pub fn connect_generation(&self) -> Option<Generation> {
        self.state.lock().calls.iter().rev().find_map(|c| match c {
            Call::Connect(generation, _) => Some(*generation),
            _ => None,
        })
    }

    pub fn mint(&self, uuid: Uuid) -> CharacteristicHandle {
        let mut state = self.state.lock();
        let id = state.next_handle;
        state.next_handle += 1;
        state.live_handles.insert(id);
        CharacteristicHandle::new(id, uuid)
    }

    pub fn resolved(&self) -> ResolvedCharacteristics {
        ResolvedCharacteristics {
            command: self.mint(UART_RX_UUID),
            notify: self.mint(UART_TX_UUID),
        }
    }

    pub fn post(&self, event: PlatformEvent) {
        self.callbacks.post(event);
    }

    fn record(&self, call: Call) -> bool {
        let mut state = self.state.lock();
        state.calls.push(call);
        state.auto_complete
    }
}

impl BlePlatform for FakePlatform {
    fn adapter_state(&self) -> AdapterState {
        let mut state = self.state.lock();
        state.calls.push(Call::AdapterState);
        state.adapter
    }

    fn start_scan(&self, _filter: &ScanFilter) -> Result<()> {
        self.record(Call::StartScan);
        Ok(())
    }

    fn stop_scan(&self) {
        self.record(Call::StopScan);
    }

    fn connect(&self, generation: Generation, peripheral: &PeripheralId) -> Result<()> {
        if self.record(Call::Connect(generation, peripheral.clone())) {
            self.post(PlatformEvent::LinkEstablished { generation });
        }
        Ok(())
    }

    fn discover(
        &self,
        generation: Generation,
        _peripheral: &PeripheralId,
        _target: &GattTarget,
    ) -> Result<()> {
        if self.record(Call::Discover(generation)) {
            let characteristics = self.resolved();
            self.post(PlatformEvent::ServicesResolved {
                generation,
                characteristics,
            });
        }
        Ok(())
    }

    fn enable_notifications(
        &self,
        generation: Generation,
        _handle: &CharacteristicHandle,
    ) -> Result<()> {
        if self.record(Call::EnableNotifications(generation)) {
            self.post(PlatformEvent::NotificationsEnabled { generation });
        }
        Ok(())
    }

    fn write(
        &self,
        generation: Generation,
        _handle: &CharacteristicHandle,
        payload: Bytes,
        _with_response: bool,
    ) -> Result<()> {
        if self.record(Call::Write(generation, payload)) {
            if self.state.lock().fail_writes {
                self.post(PlatformEvent::GattError {
                    generation,
                    reason: "GATT_ERROR (133)".to_string(),
                });
            } else {
                self.post(PlatformEvent::WriteComplete { generation });
            }
        }
        Ok(())
    }

    fn read(&self, generation: Generation, _handle: &CharacteristicHandle) -> Result<()> {
        if self.record(Call::Read(generation)) {
            let value = self.state.lock().read_value.clone();
            self.post(PlatformEvent::ReadComplete { generation, value });
        }
        Ok(())
    }

    fn release(&self, handle: CharacteristicHandle) {
        let mut state = self.state.lock();
        state.calls.push(Call::Release(handle.id()));
        assert!(
            state.live_handles.remove(&handle.id()),
            "handle {} released twice",
            handle.id()
        );
    }

    fn disconnect(&self, peripheral: &PeripheralId) {
        self.record(Call::Disconnect(peripheral.clone()));
    }
}

/// Scriptable host shell.
pub struct FakeHost {
    version: PlatformVersion,
    granted: Mutex<BTreeSet<Capability>>,
    grant_on_prompt: bool,
    enable_answer: bool,
    gate: Option<Arc<Semaphore>>,
    prompts: Arc<Mutex<Vec<Vec<Capability>>>>,
}

impl FakeHost {
    /// Modern Android with everything granted.
    pub fn granted() -> Self {
        Self {
            version: PlatformVersion::Android { api_level: 33 },
            granted: Mutex::new(BTreeSet::from([
                Capability::BluetoothScan,
                Capability::BluetoothConnect,
            ])),
            grant_on_prompt: true,
            enable_answer: true,
            gate: None,
            prompts: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Modern Android where `capability` is missing. Each prompt waits for
    /// a permit on the returned gate, then grants.
    pub fn gated(capability: Capability) -> (Self, Arc<Semaphore>) {
        let host = Self::granted();
        host.granted.lock().remove(&capability);
        let gate = Arc::new(Semaphore::new(0));
        let host = Self {
            gate: Some(gate.clone()),
            ..host
        };
        (host, gate)
    }

    /// Modern Android where `capability` is missing and the user refuses it.
    pub fn refusing(capability: Capability) -> Self {
        let host = Self::granted();
        host.granted.lock().remove(&capability);
        Self {
            grant_on_prompt: false,
            ..host
        }
    }

    /// Shared log of prompts shown.
    pub fn prompts(&self) -> Arc<Mutex<Vec<Vec<Capability>>>> {
        self.prompts.clone()
    }
}

#[async_trait]
impl HostShell for FakeHost {
    fn platform_version(&self) -> PlatformVersion {
        self.version
    }

    fn is_granted(&self, capability: Capability) -> bool {
        self.granted.lock().contains(&capability)
    }

    async fn request_capabilities(&self, capabilities: Vec<Capability>) -> Vec<Capability> {
        self.prompts.lock().push(capabilities.clone());
        if let Some(gate) = &self.gate {
            if let Ok(permit) = gate.acquire().await {
                permit.forget();
            }
        }
        if self.grant_on_prompt {
            self.granted.lock().extend(capabilities.iter().copied());
            capabilities
        } else {
            Vec::new()
        }
    }

    async fn request_adapter_enable(&self) -> bool {
        self.enable_answer
    }
}

/// Renderer that keeps every record.
#[derive(Clone, Default)]
pub struct CaptureRenderer {
    records: Arc<Mutex<Vec<String>>>,
}

impl CaptureRenderer {
    pub fn records(&self) -> Vec<serde_json::Value> {
        self.records
            .lock()
            .iter()
            .map(|r| serde_json::from_str(r).expect("record is JSON"))
            .collect()
    }
}

impl Renderer for CaptureRenderer {
    fn deliver(&self, record: String) {
        self.records.lock().push(record);
    }
}

/// Spawn a manager over `platform_for(callbacks)`.
pub fn spawn_manager(
    host: FakeHost,
    config: LinkConfig,
    platform_for: impl FnOnce(PlatformCallbacks) -> FakePlatform,
) -> (SessionManager, EventReceiver, FakePlatform) {
    let mailbox = Mailbox::new();
    let fake = platform_for(mailbox.callbacks());
    let (manager, events) =
        SessionManager::spawn(mailbox, fake.clone(), host, config).expect("valid config");
    (manager, events, fake)
}

/// Poll `condition` until it holds.
pub async fn wait_for(mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(2);
    while !condition() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        sleep(Duration::from_millis(5)).await;
    }
}

/// Poll the manager until its connection reaches `state`.
pub async fn wait_for_state(manager: &SessionManager, state: ConnectionState) -> ManagerSnapshot {
    let deadline = Instant::now() + Duration::from_secs(2);
    loop {
        let snapshot = manager.snapshot().await.expect("manager running");
        if snapshot.connection_state == state && !snapshot.preparing {
            return snapshot;
        }
        assert!(
            Instant::now() < deadline,
            "never reached {:?}, last {:?}",
            state,
            snapshot
        );
        sleep(Duration::from_millis(5)).await;
    }
}

/// Receive the next event.
pub async fn next_event(events: &mut EventReceiver) -> Event {
    timeout(Duration::from_secs(2), events.recv())
        .await
        .expect("event in time")
        .expect("event stream open")
}

/// Everything emitted so far.
pub fn drain(events: &mut EventReceiver) -> Vec<Event> {
    let mut drained = Vec::new();
    while let Ok(event) = events.try_recv() {
        drained.push(event);
    }
    drained
}

pub fn connection_states(events: &[Event]) -> Vec<ConnectionState> {
    events
        .iter()
        .filter_map(|e| match e {
            Event::ConnectionState { state, .. } => Some(*state),
            _ => None,
        })
        .collect()
}

pub fn errors(events: &[Event]) -> Vec<roboscratch_ble::ErrorEvent> {
    events
        .iter()
        .filter_map(|e| match e {
            Event::Error(error) => Some(error.clone()),
            _ => None,
        })
        .collect()
}
