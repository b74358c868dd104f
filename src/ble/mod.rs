//! BLE communication module.
//!
//! Permission negotiation, adapter enablement, scanning and the connection
//! session for the robot, written against the [`BlePlatform`] seam so the
//! same state machines drive any radio stack.

pub mod adapter;
pub mod capability;
pub mod desktop;
pub mod platform;
pub mod scanner;
pub mod session;
pub mod uuids;

pub use adapter::{AdapterGate, AdapterState, EnableOutcome};
pub use capability::{Capability, PermissionNegotiator, PlatformVersion};
pub use desktop::DesktopPlatform;
pub use platform::{
    BlePlatform, CharacteristicHandle, GattTarget, Generation, PeripheralId, PlatformCallbacks,
    PlatformEvent, ResolvedCharacteristics,
};
pub use scanner::{ScanController, ScanFilter, ScanOutcome, ScanResult, ScanState};
pub use session::{ConnectionSession, ConnectionState};
pub use uuids::*;
