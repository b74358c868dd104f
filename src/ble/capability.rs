//! Runtime capability negotiation.
//!
//! Which grants BLE needs depends only on the platform version, so the
//! requirements live in lookup tables. New platform versions are new rows.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::host::HostShell;

/// A platform permission gating BLE operations.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "kebab-case")]
pub enum Capability {
    /// Discover nearby peripherals (modern platforms).
    BluetoothScan,
    /// Connect to peripherals and manage the adapter (modern platforms).
    BluetoothConnect,
    /// Precise location, the scan proxy on mid-generation platforms.
    FineLocation,
    /// Approximate location, the scan proxy on early platforms.
    CoarseLocation,
}

impl Capability {
    /// Platform identifier of the permission.
    pub fn identifier(&self) -> &'static str {
        match self {
            Self::BluetoothScan => "android.permission.BLUETOOTH_SCAN",
            Self::BluetoothConnect => "android.permission.BLUETOOTH_CONNECT",
            Self::FineLocation => "android.permission.ACCESS_FINE_LOCATION",
            Self::CoarseLocation => "android.permission.ACCESS_COARSE_LOCATION",
        }
    }
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.identifier())
    }
}

/// Version of the platform the shell runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PlatformVersion {
    /// Android, by API level.
    Android {
        /// `Build.VERSION.SDK_INT`.
        api_level: u32,
    },
    /// Desktop operating systems, where BLE has no runtime grants.
    Desktop,
}

/// Minimum API level → capabilities BLE scanning and connecting need.
/// Rows are sorted by descending level; the first row at or below the
/// running level applies.
const ANDROID_BLE_CAPABILITIES: &[(u32, &[Capability])] = &[
    (31, &[Capability::BluetoothScan, Capability::BluetoothConnect]),
    (29, &[Capability::FineLocation]),
    (23, &[Capability::CoarseLocation]),
];

/// Minimum API level → capability needed just to ask for the radio to be
/// switched on.
const ANDROID_ADAPTER_ENABLE_CAPABILITY: &[(u32, Capability)] =
    &[(31, Capability::BluetoothConnect)];

/// Capabilities required to use BLE on `version`.
pub fn required_capabilities(version: PlatformVersion) -> BTreeSet<Capability> {
    match version {
        PlatformVersion::Desktop => BTreeSet::new(),
        PlatformVersion::Android { api_level } => ANDROID_BLE_CAPABILITIES
            .iter()
            .find(|(min, _)| api_level >= *min)
            .map(|(_, caps)| caps.iter().copied().collect())
            .unwrap_or_default(),
    }
}

/// Capability the platform checks before showing the enable-radio prompt.
pub fn adapter_enable_capability(version: PlatformVersion) -> Option<Capability> {
    match version {
        PlatformVersion::Desktop => None,
        PlatformVersion::Android { api_level } => ANDROID_ADAPTER_ENABLE_CAPABILITY
            .iter()
            .find(|(min, _)| api_level >= *min)
            .map(|(_, cap)| *cap),
    }
}

/// Works out which grants are missing and asks the host for them.
pub struct PermissionNegotiator<H> {
    host: Arc<H>,
}

impl<H: HostShell> PermissionNegotiator<H> {
    /// Create a negotiator backed by `host`.
    pub fn new(host: Arc<H>) -> Self {
        Self { host }
    }

    /// Capabilities the current platform requires.
    pub fn required(&self) -> BTreeSet<Capability> {
        required_capabilities(self.host.platform_version())
    }

    /// Ask the host whether `capability` is granted right now.
    pub fn check_granted(&self, capability: Capability) -> bool {
        self.host.is_granted(capability)
    }

    /// Prompt for `capabilities`; resolves with those still denied.
    pub async fn request_missing(&self, capabilities: Vec<Capability>) -> Vec<Capability> {
        if capabilities.is_empty() {
            return Vec::new();
        }

        info!("Requesting capabilities: {:?}", capabilities);
        let granted = self
            .host
            .request_capabilities(capabilities.clone())
            .await;

        capabilities
            .into_iter()
            .filter(|c| !granted.contains(c))
            .collect()
    }

    /// Make sure every required capability is granted.
    ///
    /// # Errors
    ///
    /// [`Error::PermissionDenied`] listing what the user refused.
    pub async fn negotiate(&self) -> Result<()> {
        let required = self.required();
        self.negotiate_for(required.into_iter().collect()).await
    }

    /// Make sure each of `capabilities` is granted, prompting for the rest.
    pub async fn negotiate_for(&self, capabilities: Vec<Capability>) -> Result<()> {
        let missing: Vec<_> = capabilities
            .into_iter()
            .filter(|c| !self.check_granted(*c))
            .collect();

        if missing.is_empty() {
            debug!("All required capabilities granted");
            return Ok(());
        }

        let denied = self.request_missing(missing).await;
        if denied.is_empty() {
            info!("Capabilities granted");
            Ok(())
        } else {
            warn!("Capabilities denied: {:?}", denied);
            Err(Error::PermissionDenied {
                capabilities: denied,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::MockHostShell;
    use mockall::predicate::eq;
    use pretty_assertions::assert_eq;

    fn android(api_level: u32) -> PlatformVersion {
        PlatformVersion::Android { api_level }
    }

    #[test]
    fn test_required_capabilities_table() {
        assert_eq!(
            required_capabilities(android(34)),
            BTreeSet::from([Capability::BluetoothScan, Capability::BluetoothConnect])
        );
        assert_eq!(
            required_capabilities(android(31)),
            BTreeSet::from([Capability::BluetoothScan, Capability::BluetoothConnect])
        );
        assert_eq!(
            required_capabilities(android(30)),
            BTreeSet::from([Capability::FineLocation])
        );
        assert_eq!(
            required_capabilities(android(26)),
            BTreeSet::from([Capability::CoarseLocation])
        );
        assert!(required_capabilities(android(21)).is_empty());
        assert!(required_capabilities(PlatformVersion::Desktop).is_empty());
    }

    #[test]
    fn test_adapter_enable_capability() {
        assert_eq!(
            adapter_enable_capability(android(33)),
            Some(Capability::BluetoothConnect)
        );
        assert_eq!(adapter_enable_capability(android(30)), None);
        assert_eq!(adapter_enable_capability(PlatformVersion::Desktop), None);
    }

    #[test]
    fn test_all_granted_skips_prompt() {
        let mut host = MockHostShell::new();
        host.expect_platform_version().return_const(android(33));
        host.expect_is_granted().return_const(true);
        host.expect_request_capabilities().never();

        let negotiator = PermissionNegotiator::new(Arc::new(host));
        assert!(tokio_test::block_on(negotiator.negotiate()).is_ok());
    }

    #[test]
    fn test_prompts_only_for_missing() {
        let mut host = MockHostShell::new();
        host.expect_platform_version().return_const(android(33));
        host.expect_is_granted()
            .returning(|c| c == Capability::BluetoothScan);
        host.expect_request_capabilities()
            .with(eq(vec![Capability::BluetoothConnect]))
            .times(1)
            .returning(|caps| caps);

        let negotiator = PermissionNegotiator::new(Arc::new(host));
        assert!(tokio_test::block_on(negotiator.negotiate()).is_ok());
    }

    #[test]
    fn test_denied_capability_fails() {
        let mut host = MockHostShell::new();
        host.expect_platform_version().return_const(android(29));
        host.expect_is_granted().return_const(false);
        host.expect_request_capabilities()
            .times(1)
            .returning(|_| Vec::new());

        let negotiator = PermissionNegotiator::new(Arc::new(host));
        match tokio_test::block_on(negotiator.negotiate()) {
            Err(Error::PermissionDenied { capabilities }) => {
                assert_eq!(capabilities, vec![Capability::FineLocation]);
            }
            other => panic!("expected PermissionDenied, got {:?}", other),
        }
    }

    #[test]
    fn test_partial_grant_reports_remainder() {
        let mut host = MockHostShell::new();
        host.expect_platform_version().return_const(android(31));
        host.expect_is_granted().return_const(false);
        host.expect_request_capabilities()
            .returning(|_| vec![Capability::BluetoothScan]);

        let negotiator = PermissionNegotiator::new(Arc::new(host));
        let denied = tokio_test::block_on(
            negotiator.request_missing(negotiator.required().into_iter().collect()),
        );
        assert_eq!(denied, vec![Capability::BluetoothConnect]);
    }
}
