//! Script command bridge.
//!
//! The content renderer's script can reach the robot only through the five
//! named commands below. Arguments arrive as JSON and are validated into a
//! [`BridgeRequest`] before anything touches the session manager. Events go
//! the other way as flat JSON records, delivered in order by a dedicated
//! task so the caller never waits on the script side.
//!
//! Command names, argument shapes and record shapes are versioned by
//! [`BRIDGE_VERSION`]; changing any of them requires a bump.

use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::ble::capability::Capability;
use crate::ble::platform::PeripheralId;
use crate::ble::scanner::{ScanOutcome, ScanState};
use crate::ble::session::ConnectionState;
use crate::config::LinkConfig;
use crate::error::{Error, Result};
use crate::event::{ErrorCode, Event, EventReceiver};
use crate::session_manager::{ScanRequest, SessionManager};

/// Version stamped on every record crossing the bridge.
pub const BRIDGE_VERSION: u32 = 1;

/// The complete command surface.
pub const COMMANDS: &[&str] = &["scan-start", "scan-stop", "connect", "disconnect", "send"];

/// Longest accepted name prefix, in bytes (a full advertising name).
pub const MAX_NAME_PREFIX_LEN: usize = 248;

/// Longest accepted scan window.
pub const MAX_SCAN_TIMEOUT_MS: u64 = 600_000;

/// Longest accepted peripheral identifier.
pub const MAX_PERIPHERAL_ID_LEN: usize = 64;

/// A validated bridge call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeRequest {
    /// `scan-start`
    ScanStart(ScanRequest),
    /// `scan-stop`
    ScanStop,
    /// `connect`
    Connect(PeripheralId),
    /// `disconnect`
    Disconnect,
    /// `send`
    Send(Bytes),
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct ScanStartArgs {
    name_prefix: Option<String>,
    timeout_ms: Option<u64>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct NoArgs {}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct ConnectArgs {
    peripheral_id: String,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct SendArgs {
    payload: Payload,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Payload {
    Text(String),
    Bytes(Vec<u8>),
}

impl BridgeRequest {
    /// Validate a call from the script context.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidRequest`] for unknown commands, malformed JSON,
    /// unknown fields, and out-of-range values.
    pub fn parse(name: &str, args: &str, max_payload_len: usize) -> Result<Self> {
        let args = if args.trim().is_empty() { "{}" } else { args };

        match name {
            "scan-start" => {
                let ScanStartArgs {
                    name_prefix,
                    timeout_ms,
                } = decode(name, args)?;

                if let Some(prefix) = &name_prefix {
                    if prefix.len() > MAX_NAME_PREFIX_LEN {
                        return Err(Error::invalid_request(format!(
                            "namePrefix longer than {} bytes",
                            MAX_NAME_PREFIX_LEN
                        )));
                    }
                }
                if let Some(ms) = timeout_ms {
                    if !(1..=MAX_SCAN_TIMEOUT_MS).contains(&ms) {
                        return Err(Error::invalid_request(format!(
                            "timeoutMs must be between 1 and {}",
                            MAX_SCAN_TIMEOUT_MS
                        )));
                    }
                }

                Ok(Self::ScanStart(ScanRequest {
                    name_prefix,
                    timeout: timeout_ms.map(Duration::from_millis),
                }))
            }
            "scan-stop" => decode::<NoArgs>(name, args).map(|_| Self::ScanStop),
            "disconnect" => decode::<NoArgs>(name, args).map(|_| Self::Disconnect),
            "connect" => {
                let ConnectArgs { peripheral_id } = decode(name, args)?;
                let well_formed = !peripheral_id.is_empty()
                    && peripheral_id.len() <= MAX_PERIPHERAL_ID_LEN
                    && peripheral_id.bytes().all(|b| b.is_ascii_graphic());
                if !well_formed {
                    return Err(Error::invalid_request(format!(
                        "peripheralId must be 1 to {} visible ASCII characters",
                        MAX_PERIPHERAL_ID_LEN
                    )));
                }
                Ok(Self::Connect(PeripheralId::new(peripheral_id)))
            }
            "send" => {
                let SendArgs { payload } = decode(name, args)?;
                let payload = match payload {
                    Payload::Text(text) => Bytes::from(text),
                    Payload::Bytes(bytes) => Bytes::from(bytes),
                };
                if payload.is_empty() || payload.len() > max_payload_len {
                    return Err(Error::invalid_request(format!(
                        "payload must be 1 to {} bytes, got {}",
                        max_payload_len,
                        payload.len()
                    )));
                }
                Ok(Self::Send(payload))
            }
            other => Err(Error::invalid_request(format!("unknown command '{}'", other))),
        }
    }

    /// Command name this request was parsed from.
    pub fn name(&self) -> &'static str {
        match self {
            Self::ScanStart(_) => "scan-start",
            Self::ScanStop => "scan-stop",
            Self::Connect(_) => "connect",
            Self::Disconnect => "disconnect",
            Self::Send(_) => "send",
        }
    }
}

fn decode<'a, T: Deserialize<'a>>(name: &str, args: &'a str) -> Result<T> {
    serde_json::from_str(args)
        .map_err(|e| Error::invalid_request(format!("bad arguments for '{}': {}", name, e)))
}

/// Script-facing shape of an [`Event`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum BridgeEvent {
    /// A matching advertisement.
    #[serde(rename_all = "camelCase")]
    ScanResult {
        /// Peripheral identifier.
        peripheral_id: PeripheralId,
        /// Advertised name.
        name: Option<String>,
        /// Signal strength in dBm.
        rssi: Option<i16>,
        /// Advertised services.
        services: Vec<Uuid>,
    },
    /// Scan controller state.
    #[serde(rename_all = "camelCase")]
    ScanState {
        /// New state.
        state: ScanState,
        /// Why scanning ended.
        #[serde(skip_serializing_if = "Option::is_none")]
        outcome: Option<ScanOutcome>,
    },
    /// Session state.
    #[serde(rename_all = "camelCase")]
    ConnectionState {
        /// Session target.
        peripheral_id: PeripheralId,
        /// New state.
        state: ConnectionState,
    },
    /// Notification from the robot.
    #[serde(rename_all = "camelCase")]
    Data {
        /// Sender.
        peripheral_id: PeripheralId,
        /// Raw value.
        bytes: Vec<u8>,
        /// The value as text, when it is valid UTF-8.
        #[serde(skip_serializing_if = "Option::is_none")]
        text: Option<String>,
    },
    /// A failure.
    Error {
        /// Wire code.
        code: ErrorCode,
        /// Description.
        message: String,
        /// Capabilities involved.
        capabilities: Vec<Capability>,
    },
}

impl From<Event> for BridgeEvent {
    fn from(event: Event) -> Self {
        match event {
            Event::ScanResult(result) => Self::ScanResult {
                peripheral_id: result.peripheral_id,
                name: result.name,
                rssi: result.rssi,
                services: result.services,
            },
            Event::ScanState { state, outcome } => Self::ScanState { state, outcome },
            Event::ConnectionState {
                peripheral_id,
                state,
            } => Self::ConnectionState {
                peripheral_id,
                state,
            },
            Event::Data {
                peripheral_id,
                payload,
            } => Self::Data {
                peripheral_id,
                text: std::str::from_utf8(&payload).ok().map(str::to_string),
                bytes: payload.to_vec(),
            },
            Event::Error(error) => Self::Error {
                code: error.code,
                message: error.message,
                capabilities: error.capabilities,
            },
        }
    }
}

#[derive(Serialize)]
struct Record<'a> {
    v: u32,
    #[serde(flatten)]
    event: &'a BridgeEvent,
}

impl BridgeEvent {
    /// Serialize as a versioned record.
    pub fn to_record(&self) -> Result<String> {
        serde_json::to_string(&Record {
            v: BRIDGE_VERSION,
            event: self,
        })
        .map_err(|e| Error::Internal(format!("failed to serialize event: {}", e)))
    }
}

#[derive(Serialize)]
struct ResponseError {
    code: ErrorCode,
    message: String,
}

#[derive(Serialize)]
struct Response {
    v: u32,
    ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<ResponseError>,
}

/// Render a call outcome as a response record.
pub fn response_record(outcome: &Result<()>) -> String {
    let response = Response {
        v: BRIDGE_VERSION,
        ok: outcome.is_ok(),
        error: outcome.as_ref().err().map(|e| ResponseError {
            code: e.code(),
            message: e.to_string(),
        }),
    };

    serde_json::to_string(&response).unwrap_or_else(|e| {
        error!("Failed to serialize response: {}", e);
        format!("{{\"v\":{},\"ok\":false}}", BRIDGE_VERSION)
    })
}

/// Receives serialized event records for the script context.
///
/// Called from the delivery task, one record at a time in emission order.
/// Implementations should hand the record off and return promptly.
pub trait Renderer: Send + Sync + 'static {
    /// Deliver one record.
    fn deliver(&self, record: String);
}

/// The bridge between the script context and the session manager.
pub struct CommandBridge {
    manager: Arc<SessionManager>,
    max_payload_len: usize,
    delivery: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl CommandBridge {
    /// Start delivering `events` to `renderer` and accept calls for `manager`.
    /// Must be called inside a tokio runtime.
    pub fn new<R: Renderer>(
        manager: Arc<SessionManager>,
        events: EventReceiver,
        renderer: R,
        config: &LinkConfig,
    ) -> Self {
        let delivery = tokio::spawn(deliver(events, renderer));

        Self {
            manager,
            max_payload_len: config.max_payload_len,
            delivery: Mutex::new(Some(delivery)),
        }
    }

    /// Validate and dispatch a named call.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidRequest`] if the call is malformed, otherwise whatever
    /// the manager rejects the request with.
    pub async fn call(&self, name: &str, args: &str) -> Result<()> {
        let request = BridgeRequest::parse(name, args, self.max_payload_len).map_err(|e| {
            warn!("Rejected bridge call '{}': {}", name, e);
            e
        })?;
        self.dispatch(request).await
    }

    /// Dispatch an already validated request.
    pub async fn dispatch(&self, request: BridgeRequest) -> Result<()> {
        debug!("Bridge call: {}", request.name());
        match request {
            BridgeRequest::ScanStart(scan) => self.manager.start_scan(scan).await,
            BridgeRequest::ScanStop => self.manager.stop_scan().await,
            BridgeRequest::Connect(peripheral) => self.manager.connect(peripheral).await,
            BridgeRequest::Disconnect => self.manager.disconnect().await,
            BridgeRequest::Send(payload) => self.manager.write(payload).await,
        }
    }

    /// [`call`](Self::call) for hosts that pass strings both ways.
    pub async fn invoke(&self, name: &str, args: &str) -> String {
        response_record(&self.call(name, args).await)
    }

    /// Wait until every event has been delivered. Completes only after the
    /// session manager has shut down.
    pub async fn drained(&self) {
        let delivery = self.delivery.lock().take();
        if let Some(handle) = delivery {
            if let Err(e) = handle.await {
                error!("Event delivery task ended abnormally: {}", e);
            }
        }
    }
}

async fn deliver<R: Renderer>(mut events: EventReceiver, renderer: R) {
    while let Some(event) = events.recv().await {
        match BridgeEvent::from(event).to_record() {
            Ok(record) => renderer.deliver(record),
            Err(e) => error!("{}", e),
        }
    }
    debug!("Event stream closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::ErrorEvent;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;
    use serde_json::{json, Value};

    fn parse(name: &str, args: &str) -> Result<BridgeRequest> {
        BridgeRequest::parse(name, args, 16)
    }

    fn record(event: Event) -> Value {
        let text = BridgeEvent::from(event).to_record().unwrap();
        serde_json::from_str(&text).unwrap()
    }

    fn assert_invalid(result: Result<BridgeRequest>) {
        assert!(
            matches!(result, Err(Error::InvalidRequest { .. })),
            "expected InvalidRequest, got {:?}",
            result
        );
    }

    #[test]
    fn test_parse_each_command() {
        assert_eq!(
            parse("scan-start", r#"{"namePrefix":"Robo","timeoutMs":5000}"#).unwrap(),
            BridgeRequest::ScanStart(ScanRequest {
                name_prefix: Some("Robo".to_string()),
                timeout: Some(Duration::from_millis(5000)),
            })
        );
        assert_eq!(parse("scan-stop", "{}").unwrap(), BridgeRequest::ScanStop);
        assert_eq!(
            parse("connect", r#"{"peripheralId":"AA:BB:CC:DD:EE:FF"}"#).unwrap(),
            BridgeRequest::Connect(PeripheralId::from("AA:BB:CC:DD:EE:FF"))
        );
        assert_eq!(parse("disconnect", "").unwrap(), BridgeRequest::Disconnect);
        assert_eq!(
            parse("send", r#"{"payload":"go"}"#).unwrap(),
            BridgeRequest::Send(Bytes::from_static(b"go"))
        );
        assert_eq!(
            parse("send", r#"{"payload":[1,2,255]}"#).unwrap(),
            BridgeRequest::Send(Bytes::from_static(&[1, 2, 255]))
        );
    }

    #[test]
    fn test_empty_args_are_an_empty_object() {
        assert_eq!(
            parse("scan-start", "  ").unwrap(),
            BridgeRequest::ScanStart(ScanRequest::default())
        );
        assert_invalid(parse("connect", ""));
    }

    #[test]
    fn test_rejects_unknown_commands_and_fields() {
        assert_invalid(parse("read", "{}"));
        assert_invalid(parse("SCAN-START", "{}"));
        assert_invalid(parse("scan-stop", r#"{"force":true}"#));
        assert_invalid(parse("connect", r#"{"peripheralId":"A","autoConnect":true}"#));
        assert_invalid(parse("scan-start", "not json"));
    }

    #[test]
    fn test_rejects_out_of_range_values() {
        assert_invalid(parse("scan-start", r#"{"timeoutMs":0}"#));
        assert_invalid(parse("scan-start", r#"{"timeoutMs":600001}"#));
        assert_invalid(parse(
            "scan-start",
            &json!({ "namePrefix": "x".repeat(249) }).to_string(),
        ));
        assert_invalid(parse("connect", r#"{"peripheralId":""}"#));
        assert_invalid(parse("connect", r#"{"peripheralId":"AA BB"}"#));
        assert_invalid(parse("connect", r#"{"peripheralId":42}"#));
        assert_invalid(parse("send", r#"{"payload":""}"#));
        assert_invalid(parse("send", r#"{"payload":[]}"#));
        assert_invalid(parse("send", r#"{"payload":[256]}"#));
        assert_invalid(parse("send", &json!({ "payload": "x".repeat(17) }).to_string()));
    }

    #[test]
    fn test_command_names_round_trip() {
        for name in COMMANDS {
            let args = match *name {
                "connect" => r#"{"peripheralId":"robot-1"}"#,
                "send" => r#"{"payload":"hi"}"#,
                _ => "{}",
            };
            assert_eq!(parse(name, args).unwrap().name(), *name);
        }
    }

    #[test]
    fn test_connection_state_record() {
        assert_eq!(
            record(Event::ConnectionState {
                peripheral_id: PeripheralId::from("AA:BB:CC:DD:EE:FF"),
                state: ConnectionState::ServiceDiscovery,
            }),
            json!({
                "v": 1,
                "event": "connection-state",
                "peripheralId": "AA:BB:CC:DD:EE:FF",
                "state": "service-discovery",
            })
        );
    }

    #[test]
    fn test_scan_state_records() {
        assert_eq!(
            record(Event::ScanState {
                state: ScanState::Scanning,
                outcome: None,
            }),
            json!({ "v": 1, "event": "scan-state", "state": "scanning" })
        );
        assert_eq!(
            record(Event::ScanState {
                state: ScanState::Idle,
                outcome: Some(ScanOutcome::TimedOut),
            }),
            json!({ "v": 1, "event": "scan-state", "state": "idle", "outcome": "timed-out" })
        );
    }

    #[test]
    fn test_data_record_includes_text_when_utf8() {
        let peripheral_id = PeripheralId::from("robot");
        assert_eq!(
            record(Event::Data {
                peripheral_id: peripheral_id.clone(),
                payload: Bytes::from_static(b"ok"),
            }),
            json!({
                "v": 1,
                "event": "data",
                "peripheralId": "robot",
                "bytes": [111, 107],
                "text": "ok",
            })
        );
        assert_eq!(
            record(Event::Data {
                peripheral_id,
                payload: Bytes::from_static(&[0xff, 0x00]),
            }),
            json!({ "v": 1, "event": "data", "peripheralId": "robot", "bytes": [255, 0] })
        );
    }

    #[test]
    fn test_error_record() {
        let error = Error::PermissionDenied {
            capabilities: vec![Capability::BluetoothScan],
        };
        assert_eq!(
            record(Event::Error(ErrorEvent::from(&error))),
            json!({
                "v": 1,
                "event": "error",
                "code": "PermissionDenied",
                "message": error.to_string(),
                "capabilities": ["bluetooth-scan"],
            })
        );
    }

    #[test]
    fn test_response_records() {
        let ok: Value = serde_json::from_str(&response_record(&Ok(()))).unwrap();
        assert_eq!(ok, json!({ "v": 1, "ok": true }));

        let failed: Value =
            serde_json::from_str(&response_record(&Err(Error::NotConnected))).unwrap();
        assert_eq!(
            failed,
            json!({
                "v": 1,
                "ok": false,
                "error": { "code": "NotConnected", "message": "Robot not connected" },
            })
        );
    }

    proptest! {
        #[test]
        fn prop_visible_ascii_ids_are_accepted(id in "[!-~]{1,64}") {
            let args = json!({ "peripheralId": id.clone() }).to_string();
            prop_assert_eq!(
                parse("connect", &args).unwrap(),
                BridgeRequest::Connect(PeripheralId::new(id))
            );
        }

        #[test]
        fn prop_overlong_or_spaced_ids_are_rejected(
            head in "[!-~]{0,40}",
            tail in "[!-~]{0,40}",
            long in "[!-~]{65,100}",
        ) {
            let spaced = json!({ "peripheralId": format!("{} {}", head, tail) }).to_string();
            let overlong = json!({ "peripheralId": long }).to_string();
            prop_assert!(parse("connect", &spaced).is_err());
            prop_assert!(parse("connect", &overlong).is_err());
        }

        #[test]
        fn prop_payload_length_is_bounded(bytes in prop::collection::vec(any::<u8>(), 0..40)) {
            let args = json!({ "payload": bytes.clone() }).to_string();
            let accepted = (1..=16).contains(&bytes.len());
            match parse("send", &args) {
                Ok(BridgeRequest::Send(payload)) => {
                    prop_assert!(accepted);
                    prop_assert_eq!(payload.to_vec(), bytes);
                }
                Ok(other) => prop_assert!(false, "unexpected request {:?}", other),
                Err(_) => prop_assert!(!accepted),
            }
        }
    }
}
