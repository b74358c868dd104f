//! Error types for the roboscratch-ble crate.

use thiserror::Error;

use crate::ble::capability::Capability;
use crate::event::ErrorCode;

/// The main error type for this crate.
#[derive(Error, Debug)]
pub enum Error {
    /// Bluetooth-related error from the underlying BLE library.
    #[error("Bluetooth error: {0}")]
    Bluetooth(#[from] btleplug::Error),

    /// One or more runtime capabilities were refused by the user.
    #[error("Permission denied: {}", list_capabilities(.capabilities))]
    PermissionDenied {
        /// Capabilities still denied after the prompt completed.
        capabilities: Vec<Capability>,
    },

    /// The device has no Bluetooth LE radio.
    #[error("Bluetooth not supported on this device")]
    AdapterUnsupported,

    /// The radio is switched off and the user declined to enable it.
    #[error("Bluetooth adapter is disabled")]
    AdapterDisabled,

    /// A caller-bounded scan window elapsed.
    #[error("Scan timed out")]
    ScanTimeout,

    /// The link or a GATT operation on it failed.
    #[error("Connection failed: {reason}")]
    ConnectFailed {
        /// Description of why the connection failed.
        reason: String,
    },

    /// Operation requires a connected session.
    #[error("Robot not connected")]
    NotConnected,

    /// A bridge call was malformed.
    #[error("Invalid request: {reason}")]
    InvalidRequest {
        /// What was wrong with the request.
        reason: String,
    },

    /// The link dropped without a local disconnect.
    #[error("Connection lost")]
    LinkLost,

    /// Configuration failed validation.
    #[error("Invalid configuration: {reason}")]
    InvalidConfig {
        /// What was wrong with the configuration.
        reason: String,
    },

    /// The session manager worker is no longer running.
    #[error("Session manager has shut down")]
    ManagerClosed,

    /// An internal error occurred.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Shorthand for an [`Error::InvalidRequest`].
    pub fn invalid_request(reason: impl Into<String>) -> Self {
        Self::InvalidRequest {
            reason: reason.into(),
        }
    }

    /// Shorthand for an [`Error::ConnectFailed`].
    pub fn connect_failed(reason: impl Into<String>) -> Self {
        Self::ConnectFailed {
            reason: reason.into(),
        }
    }

    /// The code this error is published under on the script bridge.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::PermissionDenied { .. } => ErrorCode::PermissionDenied,
            Self::AdapterUnsupported => ErrorCode::AdapterUnsupported,
            Self::AdapterDisabled => ErrorCode::AdapterDisabled,
            Self::ScanTimeout => ErrorCode::ScanTimeout,
            Self::ConnectFailed { .. } => ErrorCode::ConnectFailed,
            Self::NotConnected => ErrorCode::NotConnected,
            Self::InvalidRequest { .. } => ErrorCode::InvalidRequest,
            Self::LinkLost => ErrorCode::LinkLost,
            Self::Bluetooth(_)
            | Self::InvalidConfig { .. }
            | Self::ManagerClosed
            | Self::Internal(_) => ErrorCode::Internal,
        }
    }

    /// Capabilities carried by the error, if any.
    pub fn capabilities(&self) -> &[Capability] {
        match self {
            Self::PermissionDenied { capabilities } => capabilities,
            _ => &[],
        }
    }
}

fn list_capabilities(capabilities: &[Capability]) -> String {
    capabilities
        .iter()
        .map(|c| c.identifier())
        .collect::<Vec<_>>()
        .join(", ")
}

/// A specialized Result type for this crate.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_permission_denied_message_lists_identifiers() {
        let err = Error::PermissionDenied {
            capabilities: vec![Capability::BluetoothScan, Capability::BluetoothConnect],
        };
        assert_eq!(
            err.to_string(),
            "Permission denied: android.permission.BLUETOOTH_SCAN, android.permission.BLUETOOTH_CONNECT"
        );
        assert_eq!(err.capabilities().len(), 2);
    }

    #[test]
    fn test_codes() {
        assert_eq!(Error::LinkLost.code(), ErrorCode::LinkLost);
        assert_eq!(Error::connect_failed("gatt 133").code(), ErrorCode::ConnectFailed);
        assert_eq!(Error::ManagerClosed.code(), ErrorCode::Internal);
        assert!(Error::NotConnected.capabilities().is_empty());
    }
}
