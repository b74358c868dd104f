//! Connection session state machine.
//!
//! ```text
//! Idle → Connecting → ServiceDiscovery → Connected → Disconnecting → Idle
//!          └──────────────┴────────────────┴──→ Failed → Idle
//! ```
//!
//! The session exclusively owns its characteristic handles. Every exit from
//! a connected state (disconnect, failure, teardown) goes through
//! [`ConnectionSession::release`], which hands them back exactly once.

use bytes::Bytes;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, info, trace, warn};

use crate::ble::platform::{
    BlePlatform, Generation, GattTarget, PeripheralId, PlatformEvent, ResolvedCharacteristics,
};
use crate::error::{Error, Result};
use crate::event::{emit, Event, EventSender};

/// Connection state for the robot link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConnectionState {
    /// No session.
    #[default]
    Idle,
    /// Waiting for the link.
    Connecting,
    /// Link up, resolving the robot service.
    ServiceDiscovery,
    /// Ready for reads and writes.
    Connected,
    /// Releasing resources.
    Disconnecting,
    /// Fatal link error; settles to idle.
    Failed,
}

impl ConnectionState {
    /// Check if connected.
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }

    /// Check if a session exists in this state.
    pub fn is_active(&self) -> bool {
        !matches!(self, Self::Idle | Self::Failed)
    }

    /// Check if the link is still being set up.
    pub fn is_establishing(&self) -> bool {
        matches!(self, Self::Connecting | Self::ServiceDiscovery)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "Idle"),
            Self::Connecting => write!(f, "Connecting"),
            Self::ServiceDiscovery => write!(f, "ServiceDiscovery"),
            Self::Connected => write!(f, "Connected"),
            Self::Disconnecting => write!(f, "Disconnecting"),
            Self::Failed => write!(f, "Failed"),
        }
    }
}

/// Resolves a pending `read`.
pub type ReadReply = oneshot::Sender<Result<Bytes>>;

/// The single robot connection.
pub struct ConnectionSession<P> {
    platform: Arc<P>,
    events: EventSender,
    target: GattTarget,
    write_with_response: bool,
    generation: Generation,
    peripheral: Option<PeripheralId>,
    state: ConnectionState,
    characteristics: Option<ResolvedCharacteristics>,
    write_queue: VecDeque<Bytes>,
    write_in_flight: bool,
    pending_reads: VecDeque<ReadReply>,
}

impl<P: BlePlatform> ConnectionSession<P> {
    /// Create an idle session.
    pub fn new(
        platform: Arc<P>,
        events: EventSender,
        target: GattTarget,
        write_with_response: bool,
    ) -> Self {
        Self {
            platform,
            events,
            target,
            write_with_response,
            generation: 0,
            peripheral: None,
            state: ConnectionState::Idle,
            characteristics: None,
            write_queue: VecDeque::new(),
            write_in_flight: false,
            pending_reads: VecDeque::new(),
        }
    }

    /// Get the current connection state.
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Current generation.
    pub fn generation(&self) -> Generation {
        self.generation
    }

    /// Target of the current session.
    pub fn peripheral(&self) -> Option<&PeripheralId> {
        self.peripheral.as_ref()
    }

    /// Whether characteristic handles are currently held.
    pub fn holds_characteristics(&self) -> bool {
        self.characteristics.is_some()
    }

    /// Writes waiting behind the in-flight one.
    pub fn queued_writes(&self) -> usize {
        self.write_queue.len()
    }

    /// Start a session with `peripheral`, tearing down any existing one
    /// first. Returns the new generation.
    pub fn connect(&mut self, peripheral: PeripheralId) -> Generation {
        if self.state != ConnectionState::Idle {
            info!("Replacing session with {:?}", self.peripheral);
            self.disconnect();
        }

        self.generation += 1;
        self.peripheral = Some(peripheral.clone());
        info!("Connecting to robot {} (generation {})", peripheral, self.generation);
        self.set_state(ConnectionState::Connecting);

        if let Err(e) = self.platform.connect(self.generation, &peripheral) {
            self.fail(Error::connect_failed(e.to_string()));
        }

        self.generation
    }

    /// Leave the session. Valid in every state; settles in `Idle` without
    /// waiting for the radio. Returns `false` if there was nothing to do.
    pub fn disconnect(&mut self) -> bool {
        if self.state == ConnectionState::Idle {
            return false;
        }

        // Completions for the abandoned attempt are stale from here on.
        self.generation += 1;
        self.set_state(ConnectionState::Disconnecting);
        self.release();
        self.set_state(ConnectionState::Idle);
        self.peripheral = None;
        true
    }

    /// Queue `payload` for the command characteristic.
    ///
    /// # Errors
    ///
    /// [`Error::NotConnected`] outside the connected state.
    pub fn write(&mut self, payload: Bytes) -> Result<()> {
        if !self.state.is_connected() {
            return Err(Error::NotConnected);
        }

        trace!("Queueing {} byte write", payload.len());
        self.write_queue.push_back(payload);
        self.pump_writes();
        Ok(())
    }

    /// Read the notify characteristic. The receiver resolves when the
    /// platform completes the read.
    ///
    /// # Errors
    ///
    /// [`Error::NotConnected`] outside the connected state.
    pub fn read(&mut self) -> Result<oneshot::Receiver<Result<Bytes>>> {
        if !self.state.is_connected() {
            return Err(Error::NotConnected);
        }
        let handle = match &self.characteristics {
            Some(chars) => &chars.notify,
            None => return Err(Error::NotConnected),
        };

        if let Err(e) = self.platform.read(self.generation, handle) {
            self.fail(Error::connect_failed(e.to_string()));
            return Err(Error::NotConnected);
        }

        let (tx, rx) = oneshot::channel();
        self.pending_reads.push_back(tx);
        Ok(rx)
    }

    /// Handle a connection-scoped platform event.
    pub fn handle(&mut self, event: PlatformEvent) {
        if event.generation() != Some(self.generation) || !self.state.is_active() {
            self.discard(event);
            return;
        }

        match event {
            PlatformEvent::LinkEstablished { .. } => self.on_link_established(),
            PlatformEvent::ServicesResolved {
                characteristics, ..
            } => self.on_services_resolved(characteristics),
            PlatformEvent::NotificationsEnabled { .. } => self.on_notifications_enabled(),
            PlatformEvent::WriteComplete { .. } => {
                if self.state.is_connected() {
                    self.write_in_flight = false;
                    self.pump_writes();
                }
            }
            PlatformEvent::ReadComplete { value, .. } => {
                if let Some(reply) = self.pending_reads.pop_front() {
                    let _ = reply.send(Ok(value));
                }
            }
            PlatformEvent::Notification { value, .. } => {
                if let (true, Some(id)) = (self.state.is_connected(), &self.peripheral) {
                    trace!("Notification: {} bytes", value.len());
                    emit(
                        &self.events,
                        Event::Data {
                            peripheral_id: id.clone(),
                            payload: value,
                        },
                    );
                }
            }
            PlatformEvent::GattError { reason, .. } => {
                warn!("GATT error in {}: {}", self.state, reason);
                self.fail(Error::connect_failed(reason));
            }
            PlatformEvent::LinkLost { .. } => {
                warn!("Link to robot lost in {}", self.state);
                self.fail(Error::LinkLost);
            }
            PlatformEvent::Advertisement(_)
            | PlatformEvent::ScanFailed { .. }
            | PlatformEvent::AdapterStateChanged(_) => {}
        }
    }

    /// Discovery deadline for `generation` expired.
    pub fn on_deadline(&mut self, generation: Generation) {
        if generation == self.generation && self.state.is_establishing() {
            warn!("Service discovery timed out in {}", self.state);
            self.fail(Error::connect_failed("service discovery timed out"));
        }
    }

    /// The radio went away underneath the session.
    pub fn on_adapter_lost(&mut self) {
        if self.state.is_active() {
            self.fail(Error::LinkLost);
        }
    }

    /// Move through `Failed` to `Idle`, releasing everything and reporting
    /// `error` once.
    pub fn fail(&mut self, error: Error) {
        if !self.state.is_active() {
            return;
        }

        self.generation += 1;
        self.set_state(ConnectionState::Failed);
        emit(&self.events, Event::error(&error));
        self.release();
        self.set_state(ConnectionState::Idle);
        self.peripheral = None;
    }

    fn on_link_established(&mut self) {
        if self.state != ConnectionState::Connecting {
            return;
        }
        self.set_state(ConnectionState::ServiceDiscovery);

        let Some(peripheral) = self.peripheral.clone() else {
            return;
        };
        if let Err(e) = self
            .platform
            .discover(self.generation, &peripheral, &self.target)
        {
            self.fail(Error::connect_failed(e.to_string()));
        }
    }

    fn on_services_resolved(&mut self, characteristics: ResolvedCharacteristics) {
        if self.state != ConnectionState::ServiceDiscovery || self.characteristics.is_some() {
            self.return_handles(characteristics);
            return;
        }

        debug!(
            "Resolved command {} / notify {}",
            characteristics.command.uuid(),
            characteristics.notify.uuid()
        );
        let subscribed = self
            .platform
            .enable_notifications(self.generation, &characteristics.notify);
        self.characteristics = Some(characteristics);

        if let Err(e) = subscribed {
            self.fail(Error::connect_failed(e.to_string()));
        }
    }

    fn on_notifications_enabled(&mut self) {
        if self.state == ConnectionState::ServiceDiscovery && self.characteristics.is_some() {
            info!("Connected to robot {:?}", self.peripheral);
            self.set_state(ConnectionState::Connected);
        }
    }

    fn pump_writes(&mut self) {
        if self.write_in_flight {
            return;
        }
        let Some(chars) = &self.characteristics else {
            return;
        };
        let Some(payload) = self.write_queue.pop_front() else {
            return;
        };

        trace!("Writing {} bytes", payload.len());
        match self.platform.write(
            self.generation,
            &chars.command,
            payload,
            self.write_with_response,
        ) {
            Ok(()) => self.write_in_flight = true,
            Err(e) => self.fail(Error::connect_failed(e.to_string())),
        }
    }

    /// Release routine shared by every exit path.
    fn release(&mut self) {
        if let Some(characteristics) = self.characteristics.take() {
            self.return_handles(characteristics);
        }

        if !self.write_queue.is_empty() {
            debug!("Dropping {} queued writes", self.write_queue.len());
        }
        self.write_queue.clear();
        self.write_in_flight = false;

        for reply in self.pending_reads.drain(..) {
            let _ = reply.send(Err(Error::NotConnected));
        }

        if let Some(peripheral) = &self.peripheral {
            self.platform.disconnect(peripheral);
        }
    }

    fn return_handles(&self, characteristics: ResolvedCharacteristics) {
        self.platform.release(characteristics.command);
        self.platform.release(characteristics.notify);
    }

    fn discard(&self, event: PlatformEvent) {
        debug!(
            "Discarding stale callback (generation {:?}, current {})",
            event.generation(),
            self.generation
        );
        if let PlatformEvent::ServicesResolved {
            characteristics, ..
        } = event
        {
            self.return_handles(characteristics);
        }
    }

    fn set_state(&mut self, new_state: ConnectionState) {
        let old_state = std::mem::replace(&mut self.state, new_state);
        if old_state == new_state {
            return;
        }

        debug!("Connection state changed: {} -> {}", old_state, new_state);
        if let Some(id) = &self.peripheral {
            emit(
                &self.events,
                Event::ConnectionState {
                    peripheral_id: id.clone(),
                    state: new_state,
                },
            );
        }
    }
}
