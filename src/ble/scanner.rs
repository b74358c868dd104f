//! BLE scan control.
//!
//! Idle → Scanning → (Found | TimedOut | Stopped) → Idle. The controller does
//! not bound the scan window itself; the caller owns the timeout and calls
//! [`ScanController::finish`] when it fires.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, trace};
use uuid::Uuid;

use crate::ble::platform::{BlePlatform, PeripheralId};
use crate::error::Result;
use crate::event::{emit, Event, EventSender};

/// What to listen for.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanFilter {
    /// Service the peripheral must advertise, if set.
    pub service: Option<Uuid>,
    /// Prefix the advertised name must start with, if set.
    pub name_prefix: Option<String>,
}

impl ScanFilter {
    /// Filter on an advertised service.
    pub fn for_service(service: Uuid) -> Self {
        Self {
            service: Some(service),
            name_prefix: None,
        }
    }

    /// Also require an advertised name prefix.
    pub fn with_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.name_prefix = Some(prefix.into());
        self
    }

    /// Whether `result` passes the filter.
    pub fn matches(&self, result: &ScanResult) -> bool {
        let service_ok = self
            .service
            .map(|s| result.services.contains(&s))
            .unwrap_or(true);

        let name_ok = match &self.name_prefix {
            Some(prefix) => result
                .name
                .as_deref()
                .map(|n| n.starts_with(prefix.as_str()))
                .unwrap_or(false),
            None => true,
        };

        service_ok && name_ok
    }
}

/// One advertisement sighting. Only meaningful during the scan window.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanResult {
    /// Peripheral identifier.
    pub peripheral_id: PeripheralId,
    /// Advertised local name.
    pub name: Option<String>,
    /// Signal strength in dBm.
    pub rssi: Option<i16>,
    /// Advertised service UUIDs.
    pub services: Vec<Uuid>,
    /// When the advertisement was received.
    pub seen_at: DateTime<Utc>,
}

/// Scan controller state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ScanState {
    /// Not scanning.
    #[default]
    Idle,
    /// Listening for advertisements.
    Scanning,
}

/// Why a scan ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ScanOutcome {
    /// A target was picked and a connection is starting.
    Found,
    /// The caller's window elapsed.
    TimedOut,
    /// Explicitly stopped.
    Stopped,
}

impl std::fmt::Display for ScanOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Found => write!(f, "found"),
            Self::TimedOut => write!(f, "timed out"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

/// Drives discovery of the robot.
pub struct ScanController<P> {
    platform: Arc<P>,
    events: EventSender,
    state: ScanState,
    filter: ScanFilter,
    /// Bumped on every start so a caller's timer can tell windows apart.
    generation: u64,
}

impl<P: BlePlatform> ScanController<P> {
    /// Create an idle controller.
    pub fn new(platform: Arc<P>, events: EventSender) -> Self {
        Self {
            platform,
            events,
            state: ScanState::Idle,
            filter: ScanFilter::default(),
            generation: 0,
        }
    }

    /// Current state.
    pub fn state(&self) -> ScanState {
        self.state
    }

    /// Check if currently scanning.
    pub fn is_scanning(&self) -> bool {
        self.state == ScanState::Scanning
    }

    /// Identifies the current (or last) scan window.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Start scanning with `filter`.
    ///
    /// Returns `Ok(false)` without doing anything when already scanning.
    ///
    /// # Errors
    ///
    /// Returns the platform's error if the scan could not be started; the
    /// controller stays idle.
    pub fn start(&mut self, filter: ScanFilter) -> Result<bool> {
        if self.is_scanning() {
            debug!("Already scanning, ignoring start request");
            return Ok(false);
        }

        info!("Starting BLE scan with {:?}", filter);
        self.platform.start_scan(&filter)?;

        self.filter = filter;
        self.generation += 1;
        self.state = ScanState::Scanning;
        emit(
            &self.events,
            Event::ScanState {
                state: ScanState::Scanning,
                outcome: None,
            },
        );

        Ok(true)
    }

    /// Stop scanning. Safe in any state.
    pub fn stop(&mut self) {
        self.finish(ScanOutcome::Stopped);
    }

    /// End the current scan with `outcome`. Returns `None` if idle.
    pub fn finish(&mut self, outcome: ScanOutcome) -> Option<ScanOutcome> {
        if !self.is_scanning() {
            return None;
        }

        info!("Stopping BLE scan ({})", outcome);
        self.platform.stop_scan();
        self.state = ScanState::Idle;
        emit(
            &self.events,
            Event::ScanState {
                state: ScanState::Idle,
                outcome: Some(outcome),
            },
        );

        Some(outcome)
    }

    /// Drop controller state after the platform reported a failed start.
    pub fn abort(&mut self) {
        if self.is_scanning() {
            self.state = ScanState::Idle;
            emit(
                &self.events,
                Event::ScanState {
                    state: ScanState::Idle,
                    outcome: Some(ScanOutcome::Stopped),
                },
            );
        }
    }

    /// Handle an advertisement. Repeat sightings are reported every time.
    pub fn on_advertisement(&self, result: ScanResult) -> bool {
        if !self.is_scanning() || !self.filter.matches(&result) {
            return false;
        }

        trace!(
            "Scan result: {} {:?} rssi={:?}",
            result.peripheral_id,
            result.name,
            result.rssi
        );
        emit(&self.events, Event::ScanResult(result));
        true
    }
}
