//! Host shell collaborator.
//!
//! The native shell that embeds the control page owns the permission prompts
//! and the "turn Bluetooth on" dialog. The core reaches both through
//! [`HostShell`].

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::ble::capability::{Capability, PlatformVersion};

/// Services the embedding shell provides to the core.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait HostShell: Send + Sync + 'static {
    /// Version of the platform the shell runs on.
    fn platform_version(&self) -> PlatformVersion;

    /// Whether `capability` is currently granted. Queried fresh every time.
    fn is_granted(&self, capability: Capability) -> bool;

    /// Show the platform prompt for `capabilities` and resolve with the
    /// subset the user granted.
    async fn request_capabilities(&self, capabilities: Vec<Capability>) -> Vec<Capability>;

    /// Ask the user to switch the radio on. Resolves `true` if they agreed.
    async fn request_adapter_enable(&self) -> bool;
}

/// Host for desktop platforms, where BLE needs no runtime grants.
#[derive(Debug, Clone, Copy, Default)]
pub struct DesktopHost;

#[async_trait]
impl HostShell for DesktopHost {
    fn platform_version(&self) -> PlatformVersion {
        PlatformVersion::Desktop
    }

    fn is_granted(&self, _capability: Capability) -> bool {
        true
    }

    async fn request_capabilities(&self, capabilities: Vec<Capability>) -> Vec<Capability> {
        debug!("Desktop host grants {:?} implicitly", capabilities);
        capabilities
    }

    async fn request_adapter_enable(&self) -> bool {
        warn!("Bluetooth is off; switch it on in the system settings");
        false
    }
}
