//! Adapter power gate.

use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::ble::capability::adapter_enable_capability;
use crate::ble::capability::Capability;
use crate::ble::platform::BlePlatform;
use crate::error::{Error, Result};
use crate::host::HostShell;

/// Power state of the local radio.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum AdapterState {
    /// No BLE radio.
    Unsupported,
    /// Radio present but off.
    #[default]
    Disabled,
    /// Radio on.
    Enabled,
}

/// Result of [`AdapterGate::ensure_enabled`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnableOutcome {
    /// The radio was already on.
    AlreadyEnabled,
    /// The user switched it on from the prompt.
    EnabledByUser,
    /// The user refused. Recoverable.
    Declined,
    /// There is no radio. Fatal.
    Unsupported,
    /// The platform needs this grant before it will show the prompt.
    /// Re-run negotiation, then retry.
    PermissionRequired(Capability),
}

impl EnableOutcome {
    /// Collapse into a result for callers that cannot recover further.
    pub fn into_result(self) -> Result<()> {
        match self {
            Self::AlreadyEnabled | Self::EnabledByUser => Ok(()),
            Self::Declined => Err(Error::AdapterDisabled),
            Self::Unsupported => Err(Error::AdapterUnsupported),
            Self::PermissionRequired(capability) => Err(Error::PermissionDenied {
                capabilities: vec![capability],
            }),
        }
    }
}

/// Makes sure the radio is powered before scanning or connecting.
pub struct AdapterGate<P, H> {
    platform: Arc<P>,
    host: Arc<H>,
}

impl<P: BlePlatform, H: HostShell> AdapterGate<P, H> {
    /// Create a gate over `platform`, prompting through `host`.
    pub fn new(platform: Arc<P>, host: Arc<H>) -> Self {
        Self { platform, host }
    }

    /// Current radio state.
    pub fn current_state(&self) -> AdapterState {
        self.platform.adapter_state()
    }

    /// Ask for the radio to be switched on if it is off.
    pub async fn ensure_enabled(&self) -> EnableOutcome {
        match self.current_state() {
            AdapterState::Enabled => {
                debug!("Bluetooth adapter already enabled");
                EnableOutcome::AlreadyEnabled
            }
            AdapterState::Unsupported => {
                warn!("Bluetooth not supported on this device");
                EnableOutcome::Unsupported
            }
            AdapterState::Disabled => {
                let version = self.host.platform_version();
                if let Some(capability) = adapter_enable_capability(version) {
                    if !self.host.is_granted(capability) {
                        info!("{} needed before requesting adapter enable", capability);
                        return EnableOutcome::PermissionRequired(capability);
                    }
                }

                info!("Requesting Bluetooth adapter enable");
                if self.host.request_adapter_enable().await {
                    EnableOutcome::EnabledByUser
                } else {
                    info!("User declined to enable Bluetooth");
                    EnableOutcome::Declined
                }
            }
        }
    }
}
