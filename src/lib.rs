// Allow unusual byte groupings for UUIDs which have standard format
#![allow(clippy::unusual_byte_groupings)]

//! # roboscratch-ble
//!
//! Bluetooth Low Energy session manager and script command bridge for
//! driving a single RoboScratch robot from a block-programming page running
//! in an embedded web view.
//!
//! ## Features
//!
//! - **Permission negotiation**: Works out the runtime grants BLE needs on the
//!   running platform version and asks the host shell for the missing ones
//! - **Adapter gate**: Prompts for the radio to be switched on
//! - **Scanning**: Filters advertisements by service and name prefix
//! - **One connection**: A generation-checked session state machine that
//!   discards stale callbacks and releases characteristics exactly once
//! - **Ordered writes**: Commands reach the robot in submission order
//! - **Script bridge**: Five versioned commands in, flat JSON records out
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use roboscratch_ble::{
//!     CommandBridge, DesktopHost, DesktopPlatform, LinkConfig, Mailbox, Renderer, Result,
//!     SessionManager,
//! };
//! use std::sync::Arc;
//!
//! struct Console;
//!
//! impl Renderer for Console {
//!     fn deliver(&self, record: String) {
//!         println!("{}", record);
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let config = LinkConfig::default().with_name_prefix("Robo");
//!     let mailbox = Mailbox::new();
//!     let platform = DesktopPlatform::new(mailbox.callbacks()).await?;
//!
//!     let (manager, events) =
//!         SessionManager::spawn(mailbox, platform, DesktopHost, config.clone())?;
//!     let manager = Arc::new(manager);
//!     let bridge = CommandBridge::new(manager.clone(), events, Console, &config);
//!
//!     bridge.call("scan-start", r#"{"timeoutMs":5000}"#).await?;
//!     tokio::time::sleep(std::time::Duration::from_secs(5)).await;
//!
//!     manager.on_shell_teardown().await?;
//!     bridge.drained().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Platform Notes
//!
//! ### Android
//! The embedding shell implements [`HostShell`] and [`BlePlatform`] over the
//! platform APIs; API level 31 and later need `BLUETOOTH_SCAN` and
//! `BLUETOOTH_CONNECT`, earlier levels a location permission.
//!
//! ### macOS
//! Requires Bluetooth permission. Add `NSBluetoothAlwaysUsageDescription`
//! to your Info.plist for bundled apps.
//!
//! ### Linux
//! Requires BlueZ. User may need to be in the `bluetooth` group.

// Public modules
pub mod ble;
pub mod bridge;
pub mod config;
pub mod error;
pub mod event;
pub mod host;
pub mod session_manager;

// Re-exports for convenience
pub use bridge::{BridgeEvent, BridgeRequest, CommandBridge, Renderer, BRIDGE_VERSION};
pub use config::LinkConfig;
pub use error::{Error, Result};
pub use event::{ErrorCode, ErrorEvent, Event, EventReceiver};
pub use host::{DesktopHost, HostShell};
pub use session_manager::{Mailbox, ManagerSnapshot, ScanRequest, SessionManager};

// Re-export commonly used types from submodules
pub use ble::{
    AdapterState, BlePlatform, Capability, CharacteristicHandle, ConnectionState, DesktopPlatform,
    GattTarget, Generation, PeripheralId, PlatformCallbacks, PlatformEvent, PlatformVersion,
    ResolvedCharacteristics, ScanOutcome, ScanResult, ScanState,
};
