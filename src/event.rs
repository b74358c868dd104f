//! Events emitted by the session manager.
//!
//! Events carry copies of observable state only; the scan controller and the
//! connection session never leave the manager worker.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::trace;

use crate::ble::capability::Capability;
use crate::ble::platform::PeripheralId;
use crate::ble::scanner::{ScanOutcome, ScanResult, ScanState};
use crate::ble::session::ConnectionState;
use crate::error::Error;

/// Error codes published on the script bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCode {
    /// A required capability was refused.
    PermissionDenied,
    /// No Bluetooth LE radio. Not retryable.
    AdapterUnsupported,
    /// Radio off and enabling was declined. Retryable.
    AdapterDisabled,
    /// A bounded scan elapsed.
    ScanTimeout,
    /// GATT-level failure. Retry with a fresh `connect`.
    ConnectFailed,
    /// Operation attempted outside the connected state.
    NotConnected,
    /// Malformed bridge call.
    InvalidRequest,
    /// The link dropped unexpectedly.
    LinkLost,
    /// Anything else.
    Internal,
}

/// Error payload pushed to the script context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorEvent {
    /// Wire code.
    pub code: ErrorCode,
    /// Human readable description.
    pub message: String,
    /// Capabilities involved, for permission failures.
    pub capabilities: Vec<Capability>,
}

impl From<&Error> for ErrorEvent {
    fn from(error: &Error) -> Self {
        Self {
            code: error.code(),
            message: error.to_string(),
            capabilities: error.capabilities().to_vec(),
        }
    }
}

/// Something the script context should hear about.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// A matching advertisement was seen.
    ScanResult(ScanResult),
    /// The scan controller changed state.
    ScanState {
        /// New state.
        state: ScanState,
        /// Why scanning ended, when it did.
        outcome: Option<ScanOutcome>,
    },
    /// The connection session changed state.
    ConnectionState {
        /// The session's target.
        peripheral_id: PeripheralId,
        /// New state.
        state: ConnectionState,
    },
    /// Inbound notification from the robot.
    Data {
        /// Sender.
        peripheral_id: PeripheralId,
        /// Notification value.
        payload: Bytes,
    },
    /// A failure the user should see.
    Error(ErrorEvent),
}

impl Event {
    /// Build an error event from an [`Error`].
    pub fn error(error: &Error) -> Self {
        Self::Error(ErrorEvent::from(error))
    }
}

/// Sending half of the event channel.
pub type EventSender = mpsc::UnboundedSender<Event>;

/// Receiving half of the event channel, handed to whoever delivers events.
pub type EventReceiver = mpsc::UnboundedReceiver<Event>;

/// Push an event, ignoring a receiver that has gone away.
pub(crate) fn emit(events: &EventSender, event: Event) {
    if events.send(event).is_err() {
        trace!("Event receiver dropped, discarding event");
    }
}
