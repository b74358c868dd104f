//! Link configuration.
//!
//! The host shell may hand over a JSON document; every field is optional and
//! falls back to the Nordic UART profile the robot firmware exposes.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

use crate::ble::uuids::{UART_RX_UUID, UART_SERVICE_UUID, UART_TX_UUID};
use crate::error::{Error, Result};

/// Default discovery timeout in milliseconds.
pub const DEFAULT_DISCOVERY_TIMEOUT_MS: u64 = 10_000;

/// Default upper bound on a single `send` payload.
pub const DEFAULT_MAX_PAYLOAD_LEN: usize = 512;

/// Configuration for the robot link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase", deny_unknown_fields)]
pub struct LinkConfig {
    /// Service the robot advertises and exposes its characteristics under.
    pub service_uuid: Uuid,
    /// Characteristic commands are written to.
    pub command_uuid: Uuid,
    /// Characteristic the robot notifies on.
    pub notify_uuid: Uuid,
    /// Default advertised-name prefix for scans.
    pub name_prefix: Option<String>,
    /// Bound on the connect + service discovery span.
    pub discovery_timeout_ms: u64,
    /// Default scan window. `None` leaves scans running until stopped.
    pub scan_timeout_ms: Option<u64>,
    /// Use write-with-response for commands.
    pub write_with_response: bool,
    /// Largest payload accepted by `send`.
    pub max_payload_len: usize,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            service_uuid: UART_SERVICE_UUID,
            command_uuid: UART_RX_UUID,
            notify_uuid: UART_TX_UUID,
            name_prefix: None,
            discovery_timeout_ms: DEFAULT_DISCOVERY_TIMEOUT_MS,
            scan_timeout_ms: None,
            write_with_response: true,
            max_payload_len: DEFAULT_MAX_PAYLOAD_LEN,
        }
    }
}

impl LinkConfig {
    /// Parse and validate a JSON configuration document.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json).map_err(|e| Error::InvalidConfig {
            reason: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Check field invariants.
    pub fn validate(&self) -> Result<()> {
        let invalid = |reason: &str| {
            Err(Error::InvalidConfig {
                reason: reason.to_string(),
            })
        };

        if self.discovery_timeout_ms == 0 {
            return invalid("discoveryTimeoutMs must be greater than zero");
        }
        if self.scan_timeout_ms == Some(0) {
            return invalid("scanTimeoutMs must be greater than zero");
        }
        if self.max_payload_len == 0 {
            return invalid("maxPayloadLen must be greater than zero");
        }
        if self.command_uuid == self.notify_uuid {
            return invalid("commandUuid and notifyUuid must differ");
        }
        Ok(())
    }

    /// Discovery timeout as a [`Duration`].
    pub fn discovery_timeout(&self) -> Duration {
        Duration::from_millis(self.discovery_timeout_ms)
    }

    /// Default scan window as a [`Duration`].
    pub fn scan_timeout(&self) -> Option<Duration> {
        self.scan_timeout_ms.map(Duration::from_millis)
    }

    /// Set the GATT profile.
    pub fn with_profile(mut self, service: Uuid, command: Uuid, notify: Uuid) -> Self {
        self.service_uuid = service;
        self.command_uuid = command;
        self.notify_uuid = notify;
        self
    }

    /// Set the default name prefix.
    pub fn with_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.name_prefix = Some(prefix.into());
        self
    }

    /// Set the discovery timeout.
    pub fn with_discovery_timeout(mut self, timeout: Duration) -> Self {
        self.discovery_timeout_ms = saturating_millis(timeout);
        self
    }

    /// Set the default scan window.
    pub fn with_scan_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.scan_timeout_ms = timeout.map(saturating_millis);
        self
    }

    /// Choose between write-with-response and write-without-response.
    pub fn with_write_with_response(mut self, with_response: bool) -> Self {
        self.write_with_response = with_response;
        self
    }

    /// Set the payload size limit.
    pub fn with_max_payload_len(mut self, len: usize) -> Self {
        self.max_payload_len = len;
        self
    }
}

fn saturating_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
