//! Platform seam.
//!
//! Radio operations are issued through [`BlePlatform`] and return at once;
//! their completions come back later as [`PlatformEvent`]s posted through
//! [`PlatformCallbacks`]. Every connection-scoped request carries the session
//! [`Generation`] that issued it and every completion echoes it back, so the
//! session can discard callbacks that belong to an abandoned attempt.

use bytes::Bytes;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::trace;
use uuid::Uuid;

use crate::ble::adapter::AdapterState;
use crate::ble::scanner::{ScanFilter, ScanResult};
use crate::error::Result;
use crate::session_manager::Inbound;

/// Identity of one connection attempt. Bumped on every connect, disconnect
/// and failure.
pub type Generation = u64;

/// Stable identifier of a peripheral (address on Android, handle elsewhere).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct PeripheralId(String);

impl PeripheralId {
    /// Wrap a platform identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The identifier as a string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for PeripheralId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeripheralId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// A resolved GATT characteristic, minted by the platform.
///
/// Handles are move-only: whoever holds one must hand it back through
/// [`BlePlatform::release`].
#[derive(Debug, PartialEq, Eq)]
pub struct CharacteristicHandle {
    id: u64,
    uuid: Uuid,
}

impl CharacteristicHandle {
    /// Mint a handle. Platforms only.
    pub fn new(id: u64, uuid: Uuid) -> Self {
        Self { id, uuid }
    }

    /// Platform-local identifier.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Characteristic UUID.
    pub fn uuid(&self) -> Uuid {
        self.uuid
    }
}

/// The characteristics a session needs on the robot.
#[derive(Debug, PartialEq, Eq)]
pub struct ResolvedCharacteristics {
    /// Commands are written here.
    pub command: CharacteristicHandle,
    /// The robot notifies here.
    pub notify: CharacteristicHandle,
}

/// The service and characteristics to resolve during discovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GattTarget {
    /// Robot service.
    pub service: Uuid,
    /// Command characteristic.
    pub command: Uuid,
    /// Notify characteristic.
    pub notify: Uuid,
}

/// Completion or unsolicited event from the radio.
#[derive(Debug, PartialEq)]
pub enum PlatformEvent {
    /// An advertisement was received.
    Advertisement(ScanResult),
    /// Starting a scan failed after the request was accepted.
    ScanFailed {
        /// Platform description.
        reason: String,
    },
    /// The radio was switched on or off.
    AdapterStateChanged(AdapterState),
    /// The low-level link is up.
    LinkEstablished {
        /// Issuing generation.
        generation: Generation,
    },
    /// Target service and characteristics were found.
    ServicesResolved {
        /// Issuing generation.
        generation: Generation,
        /// The minted handles.
        characteristics: ResolvedCharacteristics,
    },
    /// The notification subscription is active.
    NotificationsEnabled {
        /// Issuing generation.
        generation: Generation,
    },
    /// The in-flight write was acknowledged.
    WriteComplete {
        /// Issuing generation.
        generation: Generation,
    },
    /// A read finished.
    ReadComplete {
        /// Issuing generation.
        generation: Generation,
        /// Characteristic value.
        value: Bytes,
    },
    /// The robot pushed a notification.
    Notification {
        /// Issuing generation.
        generation: Generation,
        /// Notification value.
        value: Bytes,
    },
    /// A GATT operation failed.
    GattError {
        /// Issuing generation.
        generation: Generation,
        /// Platform status or description.
        reason: String,
    },
    /// The link dropped without a local disconnect.
    LinkLost {
        /// Generation of the dropped link.
        generation: Generation,
    },
}

impl PlatformEvent {
    /// Generation the event belongs to, for connection-scoped events.
    pub fn generation(&self) -> Option<Generation> {
        match self {
            Self::Advertisement(_) | Self::ScanFailed { .. } | Self::AdapterStateChanged(_) => {
                None
            }
            Self::LinkEstablished { generation }
            | Self::ServicesResolved { generation, .. }
            | Self::NotificationsEnabled { generation }
            | Self::WriteComplete { generation }
            | Self::ReadComplete { generation, .. }
            | Self::Notification { generation, .. }
            | Self::GattError { generation, .. }
            | Self::LinkLost { generation } => Some(*generation),
        }
    }
}

/// Where platforms post their completions. Cheap to clone.
#[derive(Debug, Clone)]
pub struct PlatformCallbacks {
    tx: mpsc::UnboundedSender<Inbound>,
}

impl PlatformCallbacks {
    pub(crate) fn new(tx: mpsc::UnboundedSender<Inbound>) -> Self {
        Self { tx }
    }

    /// Deliver an event to the session manager.
    pub fn post(&self, event: PlatformEvent) {
        if self.tx.send(Inbound::Platform(event)).is_err() {
            trace!("Session manager gone, dropping platform event");
        }
    }
}

/// Radio operations the session manager drives.
///
/// Methods must not block. Returning `Err` means the request was rejected
/// outright; otherwise exactly one completion (or a `GattError`) follows
/// through [`PlatformCallbacks`].
#[cfg_attr(test, mockall::automock)]
pub trait BlePlatform: Send + Sync + 'static {
    /// Current radio state.
    fn adapter_state(&self) -> AdapterState;

    /// Begin delivering advertisements.
    fn start_scan(&self, filter: &ScanFilter) -> Result<()>;

    /// Stop delivering advertisements. Safe to call when not scanning.
    fn stop_scan(&self);

    /// Open a link. Completes with `LinkEstablished`.
    fn connect(&self, generation: Generation, peripheral: &PeripheralId) -> Result<()>;

    /// Resolve `target`. Completes with `ServicesResolved`.
    fn discover(
        &self,
        generation: Generation,
        peripheral: &PeripheralId,
        target: &GattTarget,
    ) -> Result<()>;

    /// Subscribe to `handle`. Completes with `NotificationsEnabled`; values
    /// then arrive as `Notification`.
    fn enable_notifications(
        &self,
        generation: Generation,
        handle: &CharacteristicHandle,
    ) -> Result<()>;

    /// Write `payload` to `handle`. Completes with `WriteComplete`.
    fn write(
        &self,
        generation: Generation,
        handle: &CharacteristicHandle,
        payload: Bytes,
        with_response: bool,
    ) -> Result<()>;

    /// Read `handle`. Completes with `ReadComplete`.
    fn read(&self, generation: Generation, handle: &CharacteristicHandle) -> Result<()>;

    /// Give a handle back. Synchronous; no completion.
    fn release(&self, handle: CharacteristicHandle);

    /// Drop the link. Fire and forget.
    fn disconnect(&self, peripheral: &PeripheralId);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generation_extraction() {
        assert_eq!(
            PlatformEvent::WriteComplete { generation: 4 }.generation(),
            Some(4)
        );
        assert_eq!(
            PlatformEvent::AdapterStateChanged(AdapterState::Disabled).generation(),
            None
        );
    }

    #[test]
    fn test_peripheral_id_serializes_as_string() {
        let id = PeripheralId::from("AA:BB:CC:DD:EE:FF");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"AA:BB:CC:DD:EE:FF\"");
        assert_eq!(id.to_string(), "AA:BB:CC:DD:EE:FF");
    }
}
