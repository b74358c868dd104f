//! Desktop radio backend on btleplug.
//!
//! btleplug's API is async; [`BlePlatform`] is issue-and-callback. Each
//! request spawns a task that performs the btleplug call and posts the
//! completion, tagged with the requesting generation, through
//! [`PlatformCallbacks`]. Methods must be called from within a tokio
//! runtime.

use btleplug::api::{
    Central, CentralEvent, CentralState, Characteristic, Manager as _, Peripheral as _,
    ScanFilter as BtleScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use bytes::Bytes;
use chrono::Utc;
use futures::stream::StreamExt;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use crate::ble::adapter::AdapterState;
use crate::ble::platform::{
    BlePlatform, CharacteristicHandle, GattTarget, Generation, PeripheralId, PlatformCallbacks,
    PlatformEvent, ResolvedCharacteristics,
};
use crate::ble::scanner::{ScanFilter, ScanResult};
use crate::error::{Error, Result};

/// An open link and the tasks serving it.
struct Link {
    generation: Generation,
    peripheral: Option<Peripheral>,
    listener: Option<tokio::task::JoinHandle<()>>,
}

/// A minted characteristic handle's backing data.
struct GattEntry {
    peripheral: Peripheral,
    characteristic: Characteristic,
}

/// State shared with spawned tasks.
struct Shared {
    callbacks: PlatformCallbacks,
    state: RwLock<AdapterState>,
    scanning: AtomicBool,
    /// Peripherals seen while scanning, by identifier.
    known: RwLock<HashMap<PeripheralId, Peripheral>>,
    links: RwLock<HashMap<PeripheralId, Link>>,
    handles: RwLock<HashMap<u64, GattEntry>>,
    next_handle: AtomicU64,
}

impl Shared {
    fn new(callbacks: PlatformCallbacks, state: AdapterState) -> Self {
        Self {
            callbacks,
            state: RwLock::new(state),
            scanning: AtomicBool::new(false),
            known: RwLock::new(HashMap::new()),
            links: RwLock::new(HashMap::new()),
            handles: RwLock::new(HashMap::new()),
            next_handle: AtomicU64::new(1),
        }
    }

    /// Whether `peripheral`'s link still belongs to `generation`.
    fn is_current(&self, peripheral: &PeripheralId, generation: Generation) -> bool {
        self.links
            .read()
            .get(peripheral)
            .map(|link| link.generation == generation)
            .unwrap_or(false)
    }

    /// The device behind `peripheral`'s link, once the link is up. Links
    /// still connecting have none.
    fn established(&self, peripheral: &PeripheralId) -> Option<(Generation, Peripheral)> {
        self.links
            .read()
            .get(peripheral)
            .and_then(|link| link.peripheral.clone().map(|device| (link.generation, device)))
    }

    /// Remove `peripheral`'s link if it still belongs to `generation`.
    fn take_link(&self, peripheral: &PeripheralId, generation: Generation) -> Option<Link> {
        let mut links = self.links.write();
        match links.get(peripheral) {
            Some(link) if link.generation == generation => links.remove(peripheral),
            _ => None,
        }
    }

    fn mint(
        &self,
        peripheral: &Peripheral,
        characteristic: Characteristic,
    ) -> CharacteristicHandle {
        let id = self.next_handle.fetch_add(1, Ordering::Relaxed);
        let handle = CharacteristicHandle::new(id, characteristic.uuid);
        self.handles.write().insert(
            id,
            GattEntry {
                peripheral: peripheral.clone(),
                characteristic,
            },
        );
        handle
    }

    fn entry(&self, handle: &CharacteristicHandle) -> Result<(Peripheral, Characteristic)> {
        self.handles
            .read()
            .get(&handle.id())
            .map(|entry| (entry.peripheral.clone(), entry.characteristic.clone()))
            .ok_or_else(|| {
                Error::Internal(format!("unknown characteristic handle {}", handle.id()))
            })
    }

    fn gatt_error(&self, generation: Generation, error: impl std::fmt::Display) {
        self.callbacks.post(PlatformEvent::GattError {
            generation,
            reason: error.to_string(),
        });
    }
}

/// [`BlePlatform`] backed by the first Bluetooth adapter btleplug finds.
pub struct DesktopPlatform {
    adapter: Option<Adapter>,
    shared: Arc<Shared>,
    event_loop: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl DesktopPlatform {
    /// Open the first adapter and start listening to it.
    ///
    /// A machine without an adapter still yields a platform; it reports
    /// [`AdapterState::Unsupported`].
    ///
    /// # Errors
    ///
    /// Returns an error if the Bluetooth stack itself cannot be reached.
    pub async fn new(callbacks: PlatformCallbacks) -> Result<Self> {
        let manager = Manager::new().await.map_err(Error::Bluetooth)?;
        let adapter = manager
            .adapters()
            .await
            .map_err(Error::Bluetooth)?
            .into_iter()
            .next();

        let state = match &adapter {
            None => {
                warn!("No Bluetooth adapter found");
                AdapterState::Unsupported
            }
            Some(adapter) => {
                info!(
                    "Using Bluetooth adapter: {:?}",
                    adapter.adapter_info().await.ok()
                );
                match adapter.adapter_state().await {
                    Ok(state) => adapter_state_from(state),
                    Err(e) => {
                        debug!("Adapter state unavailable, assuming enabled: {}", e);
                        AdapterState::Enabled
                    }
                }
            }
        };

        let shared = Arc::new(Shared::new(callbacks, state));

        let event_loop = match &adapter {
            Some(adapter) => Some(Self::spawn_event_loop(adapter.clone(), shared.clone()).await?),
            None => None,
        };

        Ok(Self {
            adapter,
            shared,
            event_loop: Mutex::new(event_loop),
        })
    }

    async fn spawn_event_loop(
        adapter: Adapter,
        shared: Arc<Shared>,
    ) -> Result<tokio::task::JoinHandle<()>> {
        let mut events = adapter.events().await.map_err(Error::Bluetooth)?;

        Ok(tokio::spawn(async move {
            while let Some(event) = events.next().await {
                Self::handle_event(event, &adapter, &shared).await;
            }
            debug!("Adapter event loop ended");
        }))
    }

    async fn handle_event(event: CentralEvent, adapter: &Adapter, shared: &Shared) {
        match event {
            CentralEvent::DeviceDiscovered(id)
            | CentralEvent::DeviceUpdated(id)
            | CentralEvent::ManufacturerDataAdvertisement { id, .. }
            | CentralEvent::ServiceDataAdvertisement { id, .. }
            | CentralEvent::ServicesAdvertisement { id, .. } => {
                if shared.scanning.load(Ordering::SeqCst) {
                    Self::process_peripheral(adapter, id, shared).await;
                }
            }
            CentralEvent::DeviceConnected(id) => {
                debug!("Device connected: {:?}", id);
            }
            CentralEvent::DeviceDisconnected(id) => {
                debug!("Device disconnected: {:?}", id);
                Self::on_disconnected(PeripheralId::new(id.to_string()), shared).await;
            }
            CentralEvent::StateUpdate(state) => {
                let state = adapter_state_from(state);
                let changed = {
                    let mut current = shared.state.write();
                    std::mem::replace(&mut *current, state) != state
                };
                if changed {
                    shared
                        .callbacks
                        .post(PlatformEvent::AdapterStateChanged(state));
                }
            }
        }
    }

    /// The event names only the device, and may belong to a link a
    /// reconnect has already replaced. Only an established current link
    /// whose device is really down counts as lost.
    async fn on_disconnected(peripheral: PeripheralId, shared: &Shared) {
        let (generation, device) = match shared.established(&peripheral) {
            Some(established) => established,
            None => {
                debug!("No established link to {}, ignoring disconnect", peripheral);
                return;
            }
        };

        if device.is_connected().await.unwrap_or(false) {
            debug!("{} still connected, ignoring stale disconnect", peripheral);
            return;
        }

        if let Some(link) = shared.take_link(&peripheral, generation) {
            if let Some(listener) = link.listener {
                listener.abort();
            }
            warn!("Lost link to {} (generation {})", peripheral, generation);
            shared.callbacks.post(PlatformEvent::LinkLost { generation });
        }
    }

    async fn process_peripheral(
        adapter: &Adapter,
        id: btleplug::platform::PeripheralId,
        shared: &Shared,
    ) {
        let peripheral = match adapter.peripheral(&id).await {
            Ok(p) => p,
            Err(e) => {
                trace!("Failed to get peripheral: {}", e);
                return;
            }
        };

        let properties = match peripheral.properties().await {
            Ok(Some(p)) => p,
            _ => return,
        };

        let peripheral_id = PeripheralId::new(id.to_string());
        shared
            .known
            .write()
            .insert(peripheral_id.clone(), peripheral);

        shared
            .callbacks
            .post(PlatformEvent::Advertisement(ScanResult {
                peripheral_id,
                name: properties.local_name,
                rssi: properties.rssi,
                services: properties.services,
                seen_at: Utc::now(),
            }));
    }

    /// Find `id` among scanned peripherals, falling back to the adapter's
    /// full list.
    async fn resolve(adapter: &Adapter, shared: &Shared, id: &PeripheralId) -> Result<Peripheral> {
        let known = shared.known.read().get(id).cloned();
        if let Some(peripheral) = known {
            return Ok(peripheral);
        }

        adapter
            .peripherals()
            .await
            .map_err(Error::Bluetooth)?
            .into_iter()
            .find(|p| p.id().to_string() == id.as_str())
            .ok_or_else(|| Error::connect_failed(format!("unknown peripheral {}", id)))
    }

    fn adapter(&self) -> Result<Adapter> {
        self.adapter.clone().ok_or(Error::AdapterUnsupported)
    }

    fn link_peripheral(
        &self,
        peripheral: &PeripheralId,
        generation: Generation,
    ) -> Result<Peripheral> {
        self.shared
            .links
            .read()
            .get(peripheral)
            .filter(|link| link.generation == generation)
            .and_then(|link| link.peripheral.clone())
            .ok_or(Error::NotConnected)
    }
}

impl BlePlatform for DesktopPlatform {
    fn adapter_state(&self) -> AdapterState {
        *self.shared.state.read()
    }

    fn start_scan(&self, filter: &ScanFilter) -> Result<()> {
        let adapter = self.adapter()?;
        let btle_filter = BtleScanFilter {
            services: filter.service.into_iter().collect(),
        };

        self.shared.scanning.store(true, Ordering::SeqCst);
        let shared = self.shared.clone();
        tokio::spawn(async move {
            if let Err(e) = adapter.start_scan(btle_filter).await {
                error!("Failed to start scan: {}", e);
                shared.scanning.store(false, Ordering::SeqCst);
                shared.callbacks.post(PlatformEvent::ScanFailed {
                    reason: e.to_string(),
                });
            }
        });
        Ok(())
    }

    fn stop_scan(&self) {
        if !self.shared.scanning.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(adapter) = self.adapter.clone() {
            tokio::spawn(async move {
                if let Err(e) = adapter.stop_scan().await {
                    warn!("Failed to stop scan: {}", e);
                }
            });
        }
    }

    fn connect(&self, generation: Generation, peripheral: &PeripheralId) -> Result<()> {
        let adapter = self.adapter()?;
        self.shared.links.write().insert(
            peripheral.clone(),
            Link {
                generation,
                peripheral: None,
                listener: None,
            },
        );

        let shared = self.shared.clone();
        let id = peripheral.clone();
        tokio::spawn(async move {
            let target = match Self::resolve(&adapter, &shared, &id).await {
                Ok(p) => p,
                Err(e) => return shared.gatt_error(generation, e),
            };

            if let Err(e) = target.connect().await {
                return shared.gatt_error(generation, e);
            }

            // Abandoned while connecting: drop the link we just opened.
            let adopted = match shared.links.write().get_mut(&id) {
                Some(link) if link.generation == generation => {
                    link.peripheral = Some(target.clone());
                    true
                }
                _ => false,
            };
            if !adopted {
                debug!("Connect for generation {} abandoned, dropping link", generation);
                let _ = target.disconnect().await;
                return;
            }

            shared
                .callbacks
                .post(PlatformEvent::LinkEstablished { generation });
        });
        Ok(())
    }

    fn discover(
        &self,
        generation: Generation,
        peripheral: &PeripheralId,
        target: &GattTarget,
    ) -> Result<()> {
        let device = self.link_peripheral(peripheral, generation)?;
        let shared = self.shared.clone();
        let target = *target;
        let id = peripheral.clone();

        tokio::spawn(async move {
            if let Err(e) = device.discover_services().await {
                return shared.gatt_error(generation, e);
            }

            let characteristics = device.characteristics();
            let command = find_characteristic(&characteristics, target.service, target.command);
            let notify = find_characteristic(&characteristics, target.service, target.notify);
            let (Some(command), Some(notify)) = (command, notify) else {
                return shared.gatt_error(
                    generation,
                    format!("robot service {} not found", target.service),
                );
            };

            if !shared.is_current(&id, generation) {
                debug!("Discovery for generation {} abandoned", generation);
                return;
            }

            let characteristics = ResolvedCharacteristics {
                command: shared.mint(&device, command),
                notify: shared.mint(&device, notify),
            };
            shared.callbacks.post(PlatformEvent::ServicesResolved {
                generation,
                characteristics,
            });
        });
        Ok(())
    }

    fn enable_notifications(
        &self,
        generation: Generation,
        handle: &CharacteristicHandle,
    ) -> Result<()> {
        let (device, characteristic) = self.shared.entry(handle)?;
        let shared = self.shared.clone();
        let peripheral = PeripheralId::new(device.id().to_string());

        let listener = tokio::spawn(async move {
            let mut notifications = match device.notifications().await {
                Ok(stream) => stream,
                Err(e) => return shared.gatt_error(generation, e),
            };
            if let Err(e) = device.subscribe(&characteristic).await {
                return shared.gatt_error(generation, e);
            }
            debug!("Subscribed to notifications from {}", characteristic.uuid);
            shared
                .callbacks
                .post(PlatformEvent::NotificationsEnabled { generation });

            while let Some(notification) = notifications.next().await {
                if notification.uuid != characteristic.uuid {
                    continue;
                }
                trace!("Notification: {} bytes", notification.value.len());
                shared.callbacks.post(PlatformEvent::Notification {
                    generation,
                    value: Bytes::from(notification.value),
                });
            }
            debug!("Notification stream ended");
        });

        match self.shared.links.write().get_mut(&peripheral) {
            Some(link) if link.generation == generation => link.listener = Some(listener),
            _ => listener.abort(),
        }
        Ok(())
    }

    fn write(
        &self,
        generation: Generation,
        handle: &CharacteristicHandle,
        payload: Bytes,
        with_response: bool,
    ) -> Result<()> {
        let (device, characteristic) = self.shared.entry(handle)?;
        let shared = self.shared.clone();
        let write_type = if with_response {
            WriteType::WithResponse
        } else {
            WriteType::WithoutResponse
        };

        tokio::spawn(async move {
            match device.write(&characteristic, &payload, write_type).await {
                Ok(()) => {
                    trace!("Wrote {} bytes to {}", payload.len(), characteristic.uuid);
                    shared
                        .callbacks
                        .post(PlatformEvent::WriteComplete { generation });
                }
                Err(e) => shared.gatt_error(generation, e),
            }
        });
        Ok(())
    }

    fn read(&self, generation: Generation, handle: &CharacteristicHandle) -> Result<()> {
        let (device, characteristic) = self.shared.entry(handle)?;
        let shared = self.shared.clone();

        tokio::spawn(async move {
            match device.read(&characteristic).await {
                Ok(value) => shared.callbacks.post(PlatformEvent::ReadComplete {
                    generation,
                    value: Bytes::from(value),
                }),
                Err(e) => shared.gatt_error(generation, e),
            }
        });
        Ok(())
    }

    fn release(&self, handle: CharacteristicHandle) {
        if self.shared.handles.write().remove(&handle.id()).is_none() {
            warn!("Released unknown characteristic handle {}", handle.id());
        }
    }

    fn disconnect(&self, peripheral: &PeripheralId) {
        let Some(link) = self.shared.links.write().remove(peripheral) else {
            return;
        };
        if let Some(listener) = link.listener {
            listener.abort();
        }

        if let Some(device) = link.peripheral {
            info!("Disconnecting from {}", peripheral);
            tokio::spawn(async move {
                if let Err(e) = device.disconnect().await {
                    warn!("Disconnect failed: {}", e);
                }
            });
        }
    }
}

impl Drop for DesktopPlatform {
    fn drop(&mut self) {
        if let Some(handle) = self.event_loop.lock().take() {
            handle.abort();
        }
    }
}

/// Map btleplug's radio state onto ours.
fn adapter_state_from(state: CentralState) -> AdapterState {
    match state {
        CentralState::PoweredOff => AdapterState::Disabled,
        CentralState::PoweredOn | CentralState::Unknown => AdapterState::Enabled,
    }
}

/// Find `uuid` under `service`.
fn find_characteristic(
    characteristics: &BTreeSet<Characteristic>,
    service: Uuid,
    uuid: Uuid,
) -> Option<Characteristic> {
    characteristics
        .iter()
        .find(|c| c.service_uuid == service && c.uuid == uuid)
        .cloned()
}
