//! Session manager.
//!
//! One worker task owns the [`ScanController`] and the [`ConnectionSession`]
//! and is the only code that mutates them. Commands from the script side,
//! platform callbacks and internal timers all arrive through the same FIFO
//! [`Mailbox`], so they are applied one at a time in arrival order.

use bytes::Bytes;
use parking_lot::Mutex;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::ble::adapter::{AdapterGate, AdapterState, EnableOutcome};
use crate::ble::capability::PermissionNegotiator;
use crate::ble::platform::{
    BlePlatform, GattTarget, Generation, PeripheralId, PlatformCallbacks, PlatformEvent,
};
use crate::ble::scanner::{ScanController, ScanFilter, ScanOutcome, ScanState};
use crate::ble::session::{ConnectionSession, ConnectionState};
use crate::config::LinkConfig;
use crate::error::{Error, Result};
use crate::event::{emit, Event, EventReceiver, EventSender};
use crate::host::HostShell;

/// Caller-supplied scan parameters. Unset fields fall back to configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanRequest {
    /// Advertised-name prefix to require.
    pub name_prefix: Option<String>,
    /// Stop the scan after this long.
    pub timeout: Option<Duration>,
}

/// Copy of the manager's observable state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagerSnapshot {
    /// Scan controller state.
    pub scan_state: ScanState,
    /// Session state.
    pub connection_state: ConnectionState,
    /// Session target.
    pub peripheral_id: Option<PeripheralId>,
    /// Session generation.
    pub generation: Generation,
    /// Whether the session holds characteristic handles.
    pub holds_characteristics: bool,
    /// Writes waiting behind the in-flight one.
    pub queued_writes: usize,
    /// Whether permission/adapter checks are in progress.
    pub preparing: bool,
}

type Reply<T> = oneshot::Sender<Result<T>>;

#[derive(Debug)]
pub(crate) enum Command {
    StartScan {
        request: ScanRequest,
        reply: Reply<()>,
    },
    StopScan {
        reply: Reply<()>,
    },
    Connect {
        peripheral: PeripheralId,
        reply: Reply<()>,
    },
    Disconnect {
        reply: Reply<()>,
    },
    Write {
        payload: Bytes,
        reply: Reply<()>,
    },
    Read {
        reply: Reply<oneshot::Receiver<Result<Bytes>>>,
    },
    Snapshot {
        reply: Reply<ManagerSnapshot>,
    },
    Teardown {
        reply: Reply<()>,
    },
}

/// Everything the worker reacts to.
#[derive(Debug)]
pub(crate) enum Inbound {
    Command(Command),
    Platform(PlatformEvent),
    Ready { ticket: u64, result: Result<()> },
    ScanDeadline { scan_generation: u64 },
    SessionDeadline { generation: Generation },
}

/// The worker's inbound queue. Create it first so the platform can be built
/// with its [`PlatformCallbacks`].
pub struct Mailbox {
    tx: mpsc::UnboundedSender<Inbound>,
    rx: mpsc::UnboundedReceiver<Inbound>,
}

impl Mailbox {
    /// Create an empty mailbox.
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self { tx, rx }
    }

    /// Callback sink for a [`BlePlatform`] implementation.
    pub fn callbacks(&self) -> PlatformCallbacks {
        PlatformCallbacks::new(self.tx.clone())
    }
}

impl Default for Mailbox {
    fn default() -> Self {
        Self::new()
    }
}

/// Work waiting on permission and adapter checks.
#[derive(Debug, Clone)]
enum PendingAction {
    Scan(ScanRequest),
    Connect(PeripheralId),
}

/// Handle to the session manager worker.
///
/// Dropping the handle tears the manager down the same way
/// [`SessionManager::on_shell_teardown`] does, without waiting for it.
pub struct SessionManager {
    commands: mpsc::UnboundedSender<Inbound>,
    worker: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl SessionManager {
    /// Start the worker. Must be called inside a tokio runtime.
    ///
    /// Returns the handle and the receiving end of the event stream.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidConfig`] if `config` fails validation.
    pub fn spawn<P, H>(
        mailbox: Mailbox,
        platform: P,
        host: H,
        config: LinkConfig,
    ) -> Result<(Self, EventReceiver)>
    where
        P: BlePlatform,
        H: HostShell,
    {
        config.validate()?;

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let Mailbox { tx, rx } = mailbox;

        let worker = Worker::new(Arc::new(platform), Arc::new(host), config, event_tx, tx.clone());
        let handle = tokio::spawn(worker.run(rx));

        Ok((
            Self {
                commands: tx,
                worker: Mutex::new(Some(handle)),
            },
            event_rx,
        ))
    }

    /// Start scanning for the robot, after permission and adapter checks.
    /// Does nothing if a scan is already running or being prepared.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidRequest`] while a connect is being prepared.
    pub async fn start_scan(&self, request: ScanRequest) -> Result<()> {
        self.request(|reply| Command::StartScan { request, reply })
            .await
    }

    /// Stop scanning. Always succeeds.
    pub async fn stop_scan(&self) -> Result<()> {
        self.request(|reply| Command::StopScan { reply }).await
    }

    /// Connect to `peripheral`, replacing any current session.
    ///
    /// Resolves once the request is accepted; progress arrives as events.
    pub async fn connect(&self, peripheral: PeripheralId) -> Result<()> {
        self.request(|reply| Command::Connect { peripheral, reply })
            .await
    }

    /// Abandon whatever is in progress and settle in idle.
    pub async fn disconnect(&self) -> Result<()> {
        self.request(|reply| Command::Disconnect { reply }).await
    }

    /// Queue a command for the robot.
    ///
    /// # Errors
    ///
    /// [`Error::NotConnected`] unless the session is connected.
    pub async fn write(&self, payload: Bytes) -> Result<()> {
        self.request(|reply| Command::Write { payload, reply }).await
    }

    /// Read the robot's notify characteristic.
    ///
    /// # Errors
    ///
    /// [`Error::NotConnected`] unless the session is connected, including
    /// when the session ends before the read completes.
    pub async fn read(&self) -> Result<Bytes> {
        let pending = self.request(|reply| Command::Read { reply }).await?;
        pending.await.map_err(|_| Error::ManagerClosed)?
    }

    /// Copy of the current observable state.
    pub async fn snapshot(&self) -> Result<ManagerSnapshot> {
        self.request(|reply| Command::Snapshot { reply }).await
    }

    /// Shell is going away: disconnect, stop the worker, and wait for both.
    pub async fn on_shell_teardown(&self) -> Result<()> {
        info!("Shell teardown, shutting down session manager");
        let acknowledged = self.request(|reply| Command::Teardown { reply }).await;

        let worker = self.worker.lock().take();
        if let Some(handle) = worker {
            if let Err(e) = handle.await {
                error!("Session manager worker ended abnormally: {}", e);
            }
        }

        match acknowledged {
            Err(Error::ManagerClosed) => Ok(()),
            other => other,
        }
    }

    async fn request<T>(&self, build: impl FnOnce(Reply<T>) -> Command) -> Result<T> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(Inbound::Command(build(reply)))
            .map_err(|_| Error::ManagerClosed)?;
        response.await.map_err(|_| Error::ManagerClosed)?
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        // Still running unless on_shell_teardown already took the worker.
        if self.worker.get_mut().take().is_some() {
            debug!("Session manager handle dropped, tearing down");
            let (reply, _) = oneshot::channel();
            let _ = self.commands.send(Inbound::Command(Command::Teardown { reply }));
        }
    }
}

struct Worker<P, H> {
    config: LinkConfig,
    platform: Arc<P>,
    host: Arc<H>,
    events: EventSender,
    mailbox: mpsc::UnboundedSender<Inbound>,
    scanner: ScanController<P>,
    session: ConnectionSession<P>,
    next_ticket: u64,
    pending: Option<(u64, PendingAction)>,
}

impl<P: BlePlatform, H: HostShell> Worker<P, H> {
    fn new(
        platform: Arc<P>,
        host: Arc<H>,
        config: LinkConfig,
        events: EventSender,
        mailbox: mpsc::UnboundedSender<Inbound>,
    ) -> Self {
        let target = GattTarget {
            service: config.service_uuid,
            command: config.command_uuid,
            notify: config.notify_uuid,
        };

        Self {
            scanner: ScanController::new(platform.clone(), events.clone()),
            session: ConnectionSession::new(
                platform.clone(),
                events.clone(),
                target,
                config.write_with_response,
            ),
            config,
            platform,
            host,
            events,
            mailbox,
            next_ticket: 0,
            pending: None,
        }
    }

    async fn run(mut self, mut inbox: mpsc::UnboundedReceiver<Inbound>) {
        debug!("Session manager worker started");

        while let Some(message) = inbox.recv().await {
            match message {
                Inbound::Command(command) => {
                    if self.on_command(command).is_break() {
                        break;
                    }
                }
                Inbound::Platform(event) => self.on_platform_event(event),
                Inbound::Ready { ticket, result } => self.on_ready(ticket, result),
                Inbound::ScanDeadline { scan_generation } => {
                    if self.scanner.generation() == scan_generation
                        && self.scanner.finish(ScanOutcome::TimedOut).is_some()
                    {
                        emit(&self.events, Event::error(&Error::ScanTimeout));
                    }
                }
                Inbound::SessionDeadline { generation } => self.session.on_deadline(generation),
            }
        }

        debug!("Session manager worker stopped");
    }

    fn on_command(&mut self, command: Command) -> ControlFlow<()> {
        match command {
            Command::StartScan { request, reply } => {
                let result = match &self.pending {
                    Some((_, PendingAction::Connect(peripheral))) => {
                        debug!("Rejecting scan while connect to {} is prepared", peripheral);
                        Err(Error::InvalidRequest {
                            reason: format!("connect to {} in progress", peripheral),
                        })
                    }
                    Some((_, PendingAction::Scan(_))) => {
                        debug!("Scan already pending");
                        Ok(())
                    }
                    None if self.scanner.is_scanning() => {
                        debug!("Scan already running");
                        Ok(())
                    }
                    None => {
                        self.prepare(PendingAction::Scan(request));
                        Ok(())
                    }
                };
                let _ = reply.send(result);
            }
            Command::StopScan { reply } => {
                if matches!(self.pending, Some((_, PendingAction::Scan(_)))) {
                    self.abandon_pending();
                }
                self.scanner.stop();
                let _ = reply.send(Ok(()));
            }
            Command::Connect { peripheral, reply } => {
                self.session.disconnect();
                self.prepare(PendingAction::Connect(peripheral));
                let _ = reply.send(Ok(()));
            }
            Command::Disconnect { reply } => {
                self.cancel();
                let _ = reply.send(Ok(()));
            }
            Command::Write { payload, reply } => {
                let _ = reply.send(self.session.write(payload));
            }
            Command::Read { reply } => {
                let _ = reply.send(self.session.read());
            }
            Command::Snapshot { reply } => {
                let _ = reply.send(Ok(self.snapshot()));
            }
            Command::Teardown { reply } => {
                info!("Tearing down session manager");
                self.cancel();
                let _ = reply.send(Ok(()));
                return ControlFlow::Break(());
            }
        }
        ControlFlow::Continue(())
    }

    fn on_platform_event(&mut self, event: PlatformEvent) {
        match event {
            PlatformEvent::Advertisement(result) => {
                self.scanner.on_advertisement(result);
            }
            PlatformEvent::ScanFailed { reason } => {
                warn!("Scan failed: {}", reason);
                if self.scanner.is_scanning() {
                    self.scanner.abort();
                    emit(&self.events, Event::error(&Error::Internal(reason)));
                }
            }
            PlatformEvent::AdapterStateChanged(state) => {
                info!("Bluetooth adapter state changed: {:?}", state);
                if state != AdapterState::Enabled {
                    self.scanner.stop();
                    self.session.on_adapter_lost();
                }
            }
            event => self.session.handle(event),
        }
    }

    /// Kick off permission negotiation and adapter enablement for `action`,
    /// replacing whatever was pending.
    fn prepare(&mut self, action: PendingAction) {
        self.abandon_pending();
        self.next_ticket += 1;
        let ticket = self.next_ticket;
        debug!("Preparing {:?} (ticket {})", action, ticket);
        self.pending = Some((ticket, action));

        let negotiator = PermissionNegotiator::new(self.host.clone());
        let gate = AdapterGate::new(self.platform.clone(), self.host.clone());
        let mailbox = self.mailbox.clone();

        tokio::spawn(async move {
            let result = ensure_ready(&negotiator, &gate).await;
            let _ = mailbox.send(Inbound::Ready { ticket, result });
        });
    }

    fn on_ready(&mut self, ticket: u64, result: Result<()>) {
        let action = match self.pending.take() {
            Some((pending, action)) if pending == ticket => action,
            other => {
                debug!("Discarding stale readiness outcome (ticket {})", ticket);
                self.pending = other;
                return;
            }
        };

        if let Err(e) = result {
            warn!("Cannot proceed with {:?}: {}", action, e);
            emit(&self.events, Event::error(&e));
            return;
        }

        match action {
            PendingAction::Scan(request) => self.begin_scan(request),
            PendingAction::Connect(peripheral) => {
                self.scanner.finish(ScanOutcome::Found);
                let generation = self.session.connect(peripheral);
                self.schedule(
                    self.config.discovery_timeout(),
                    Inbound::SessionDeadline { generation },
                );
            }
        }
    }

    fn begin_scan(&mut self, request: ScanRequest) {
        let mut filter = ScanFilter::for_service(self.config.service_uuid);
        filter.name_prefix = request.name_prefix.or_else(|| self.config.name_prefix.clone());

        match self.scanner.start(filter) {
            Ok(true) => {
                if let Some(timeout) = request.timeout.or_else(|| self.config.scan_timeout()) {
                    let scan_generation = self.scanner.generation();
                    self.schedule(timeout, Inbound::ScanDeadline { scan_generation });
                }
            }
            Ok(false) => {}
            Err(e) => {
                error!("Failed to start scan: {}", e);
                emit(&self.events, Event::error(&e));
            }
        }
    }

    fn schedule(&self, after: Duration, message: Inbound) {
        let mailbox = self.mailbox.clone();
        tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let _ = mailbox.send(message);
        });
    }

    /// Drop the pending action, if any, and tell the script it ended. Its
    /// readiness outcome is stale from here on.
    fn abandon_pending(&mut self) {
        let Some((ticket, action)) = self.pending.take() else {
            return;
        };
        debug!("Abandoning pending {:?} (ticket {})", action, ticket);

        let event = match action {
            PendingAction::Scan(_) => Event::ScanState {
                state: ScanState::Idle,
                outcome: Some(ScanOutcome::Stopped),
            },
            PendingAction::Connect(peripheral_id) => Event::ConnectionState {
                peripheral_id,
                state: ConnectionState::Idle,
            },
        };
        emit(&self.events, event);
    }

    /// Universal cancellation: pending readiness, scan, and session.
    fn cancel(&mut self) {
        self.abandon_pending();
        self.scanner.stop();
        self.session.disconnect();
    }

    fn snapshot(&self) -> ManagerSnapshot {
        ManagerSnapshot {
            scan_state: self.scanner.state(),
            connection_state: self.session.state(),
            peripheral_id: self.session.peripheral().cloned(),
            generation: self.session.generation(),
            holds_characteristics: self.session.holds_characteristics(),
            queued_writes: self.session.queued_writes(),
            preparing: self.pending.is_some(),
        }
    }
}

/// Permissions first, then the radio. A platform that needs one more grant
/// before it can prompt for the radio gets exactly one more negotiation.
async fn ensure_ready<P: BlePlatform, H: HostShell>(
    negotiator: &PermissionNegotiator<H>,
    gate: &AdapterGate<P, H>,
) -> Result<()> {
    negotiator.negotiate().await?;

    match gate.ensure_enabled().await {
        EnableOutcome::PermissionRequired(capability) => {
            negotiator.negotiate_for(vec![capability]).await?;
            gate.ensure_enabled().await.into_result()
        }
        outcome => outcome.into_result(),
    }
}
