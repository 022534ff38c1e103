use std::collections::HashMap;
use std::ops::ControlFlow;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use bon::{Builder, bon};
use serde::Serialize;
use strum_macros::Display as StrumDisplay;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_stream::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, instrument, trace, warn};
use uuid::Uuid;

use super::capability::{Capabilities, CapabilityRegistry, RegisteredCharacteristic};
use super::framer::{ByteFramer, DEFAULT_CHUNK_SIZE};
use super::operation::{
    Completion, Dispatch, FinishedOutput, Operation, OperationOutput, OperationQueue, Origin,
    TransportRequest,
};
use crate::error::{ConnectFailure, OperationError, SessionError, TransportError};
use crate::hw::{DiscoveredService, LinkEvent, LinkEventStream, RemoteDevice, Transport};

/// Default bound on a connect attempt.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
/// Default delay between link-up and service discovery.
pub const DEFAULT_SETTLE_DELAY: Duration = Duration::from_secs(2);

/// Lifecycle state of a GATT session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, StrumDisplay, Serialize)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Disconnected,
    Connecting,
    DiscoveringCapabilities,
    EnablingNotifications,
    Ready,
    Disconnecting,
}

impl SessionState {
    /// Returns whether a connect attempt is underway but not yet ready.
    #[must_use]
    pub fn is_connecting(self) -> bool {
        matches!(
            self,
            Self::Connecting | Self::DiscoveringCapabilities | Self::EnablingNotifications
        )
    }
}

/// Why a ready session went down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, StrumDisplay, Serialize)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum DisconnectReason {
    Requested,
    LinkLost,
    SessionEnded,
}

/// Asynchronous session notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Connected,
    ConnectFailed(ConnectFailure),
    Disconnected(DisconnectReason),
    Notification { characteristic: Uuid, value: Vec<u8> },
    CharacteristicRead { characteristic: Uuid, value: Vec<u8> },
    RssiRead(i16),
    Written { characteristic: Uuid, len: usize },
}

/// Result of asking a session to connect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectAttempt {
    /// A new attempt was started; watch the events for its outcome.
    Started,
    /// The session was not disconnected; nothing was sent to the transport.
    AlreadyActive(SessionState),
}

/// Session timing and framing options.
#[derive(Debug, Clone, Builder)]
pub struct SessionConfig {
    #[builder(default = DEFAULT_CONNECT_TIMEOUT)]
    connect_timeout: Duration,
    #[builder(default = DEFAULT_SETTLE_DELAY)]
    settle_delay: Duration,
    #[builder(default = DEFAULT_CHUNK_SIZE)]
    chunk_size: usize,
    /// Applied to operations submitted without their own deadline.
    operation_timeout: Option<Duration>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl SessionConfig {
    /// Returns the connect-attempt bound.
    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    /// Returns the link-up to discovery delay.
    #[must_use]
    pub fn settle_delay(&self) -> Duration {
        self.settle_delay
    }

    /// Returns the write chunk size.
    #[must_use]
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }
}

/// Point-in-time view of a session, for diagnostics and tests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionSnapshot {
    pub state: SessionState,
    pub queued_operations: usize,
    pub operation_in_flight: bool,
    pub characteristics: Vec<RegisteredCharacteristic>,
}

/// Completion handle for one queued operation.
///
/// Await [`OperationTicket::completion`] for the result, or drop the ticket to
/// fire and forget; the operation still runs.
#[derive(Debug)]
#[must_use = "dropping a ticket discards the operation result"]
pub struct OperationTicket<T> {
    receiver: oneshot::Receiver<Result<OperationOutput, OperationError>>,
    extract: fn(OperationOutput) -> Option<T>,
}

impl<T> OperationTicket<T> {
    /// Waits for the operation to finish.
    ///
    /// # Errors
    ///
    /// Returns the operation failure, or [`OperationError::SessionEnded`] when
    /// the session stopped without replying.
    pub async fn completion(self) -> Result<T, OperationError> {
        let Self { receiver, extract } = self;
        let output = receiver
            .await
            .map_err(|_closed| OperationError::SessionEnded)??;
        extract(output).ok_or(OperationError::UnexpectedCompletion)
    }
}

/// Stream of [`SessionEvent`]s for one session.
#[derive(Debug)]
pub struct SessionEvents {
    inner: UnboundedReceiverStream<SessionEvent>,
}

impl SessionEvents {
    /// Waits for the next event; `None` once the session has ended.
    pub async fn recv(&mut self) -> Option<SessionEvent> {
        self.inner.next().await
    }
}

impl Stream for SessionEvents {
    type Item = SessionEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

#[derive(Debug)]
enum Command {
    Connect {
        reply: oneshot::Sender<ConnectAttempt>,
    },
    Disconnect {
        reply: oneshot::Sender<()>,
    },
    Submit {
        operation: Operation,
        timeout: Option<Duration>,
        completion: Completion,
        accepted: oneshot::Sender<Result<(), SessionError>>,
    },
    Snapshot {
        reply: oneshot::Sender<SessionSnapshot>,
    },
    End {
        reply: oneshot::Sender<()>,
    },
}

#[derive(Debug)]
enum Internal {
    LinkUp {
        generation: u64,
        result: Result<(), TransportError>,
    },
    Settled {
        generation: u64,
    },
    Discovered {
        generation: u64,
        result: Result<Vec<DiscoveredService>, TransportError>,
    },
    ConnectTimedOut {
        generation: u64,
    },
    OperationFinished {
        generation: u64,
        id: u64,
        result: Result<OperationOutput, OperationError>,
    },
    LinkReleased {
        generation: u64,
    },
}

/// Cloneable front end to a running session.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    device: RemoteDevice,
    chunk_size: usize,
    declared: Arc<HashMap<Uuid, Capabilities>>,
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<SessionState>,
}

impl SessionHandle {
    /// Returns the device this session talks to.
    #[must_use]
    pub fn device(&self) -> &RemoteDevice {
        &self.device
    }

    /// Returns the largest write the session sends in one transport call.
    /// Longer writes are split before they reach the transport.
    #[must_use]
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Returns the current lifecycle state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Returns a receiver that observes every state change.
    #[must_use]
    pub fn state_changes(&self) -> watch::Receiver<SessionState> {
        self.state.clone()
    }

    /// Returns the declared capabilities of a registered characteristic.
    #[must_use]
    pub fn capabilities_of(&self, characteristic: Uuid) -> Option<Capabilities> {
        self.declared.get(&characteristic).copied()
    }

    /// Starts a connect attempt unless one is already active.
    ///
    /// The outcome arrives as [`SessionEvent::Connected`] or
    /// [`SessionEvent::ConnectFailed`].
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::SessionEnded`] once the session has ended.
    pub async fn connect(&self) -> Result<ConnectAttempt, SessionError> {
        let (reply, response) = oneshot::channel();
        self.send(Command::Connect { reply })?;
        response.await.map_err(|_closed| SessionError::SessionEnded)
    }

    /// Tears the link down. A no-op when already disconnected.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::SessionEnded`] once the session has ended.
    pub async fn disconnect(&self) -> Result<(), SessionError> {
        let (reply, response) = oneshot::channel();
        self.send(Command::Disconnect { reply })?;
        response.await.map_err(|_closed| SessionError::SessionEnded)
    }

    /// Queues a characteristic read.
    ///
    /// # Errors
    ///
    /// Returns an error when the session is not ready or the characteristic
    /// cannot be read.
    pub async fn read(&self, characteristic: Uuid) -> Result<OperationTicket<Vec<u8>>, SessionError> {
        self.submit(Operation::Read { characteristic }, None, value_output)
            .await
    }

    /// Queues a characteristic read that fails after `limit`.
    ///
    /// # Errors
    ///
    /// As for [`SessionHandle::read`].
    pub async fn read_within(
        &self,
        characteristic: Uuid,
        limit: Duration,
    ) -> Result<OperationTicket<Vec<u8>>, SessionError> {
        self.submit(Operation::Read { characteristic }, Some(limit), value_output)
            .await
    }

    /// Queues a write, split into chunks of the configured size.
    ///
    /// # Errors
    ///
    /// Returns an error when the session is not ready or the characteristic
    /// is not writable.
    pub async fn write(
        &self,
        characteristic: Uuid,
        value: Vec<u8>,
    ) -> Result<OperationTicket<()>, SessionError> {
        self.submit(
            Operation::Write {
                characteristic,
                value,
            },
            None,
            written_output,
        )
        .await
    }

    /// Queues a write whose chunks each fail after `limit`.
    ///
    /// # Errors
    ///
    /// As for [`SessionHandle::write`].
    pub async fn write_within(
        &self,
        characteristic: Uuid,
        value: Vec<u8>,
        limit: Duration,
    ) -> Result<OperationTicket<()>, SessionError> {
        self.submit(
            Operation::Write {
                characteristic,
                value,
            },
            Some(limit),
            written_output,
        )
        .await
    }

    /// Queues a notification enable or disable.
    ///
    /// # Errors
    ///
    /// Returns an error when the session is not ready or the characteristic
    /// declares neither notify nor indicate.
    pub async fn set_notify(
        &self,
        characteristic: Uuid,
        enabled: bool,
    ) -> Result<OperationTicket<bool>, SessionError> {
        self.submit(
            Operation::SetNotify {
                characteristic,
                enabled,
            },
            None,
            notify_output,
        )
        .await
    }

    /// Queues a signal strength read.
    ///
    /// # Errors
    ///
    /// Returns an error when the session is not ready.
    pub async fn read_rssi(&self) -> Result<OperationTicket<i16>, SessionError> {
        self.submit(Operation::ReadRssi, None, rssi_output).await
    }

    /// Returns a snapshot of the session internals.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::SessionEnded`] once the session has ended.
    pub async fn snapshot(&self) -> Result<SessionSnapshot, SessionError> {
        let (reply, response) = oneshot::channel();
        self.send(Command::Snapshot { reply })?;
        response.await.map_err(|_closed| SessionError::SessionEnded)
    }

    /// Ends the session: tears the link down, releases the transport and stops
    /// the event loop. Later calls on any handle fail with `SessionEnded`.
    pub async fn end(&self) {
        let (reply, response) = oneshot::channel();
        if self.send(Command::End { reply }).is_ok() {
            let _ = response.await;
        }
    }

    async fn submit<T>(
        &self,
        operation: Operation,
        timeout: Option<Duration>,
        extract: fn(OperationOutput) -> Option<T>,
    ) -> Result<OperationTicket<T>, SessionError> {
        let (completion, receiver) = oneshot::channel();
        let (accepted, acceptance) = oneshot::channel();
        self.send(Command::Submit {
            operation,
            timeout,
            completion,
            accepted,
        })?;
        acceptance
            .await
            .map_err(|_closed| SessionError::SessionEnded)??;
        Ok(OperationTicket { receiver, extract })
    }

    fn send(&self, command: Command) -> Result<(), SessionError> {
        self.commands
            .send(command)
            .map_err(|_closed| SessionError::SessionEnded)
    }
}

fn value_output(output: OperationOutput) -> Option<Vec<u8>> {
    match output {
        OperationOutput::Value(value) => Some(value),
        _ => None,
    }
}

fn written_output(output: OperationOutput) -> Option<()> {
    matches!(output, OperationOutput::Written).then_some(())
}

fn notify_output(output: OperationOutput) -> Option<bool> {
    match output {
        OperationOutput::NotifySet(enabled) => Some(enabled),
        _ => None,
    }
}

fn rssi_output(output: OperationOutput) -> Option<i16> {
    match output {
        OperationOutput::Rssi(rssi) => Some(rssi),
        _ => None,
    }
}

/// Connection state machine for one remote device.
///
/// Runs as a task that owns the registry, the operation queue and the
/// transport. Transport calls run on spawned futures that report back tagged
/// with the link generation, so results from a torn-down link are dropped.
#[derive(Debug)]
pub struct GattSession {
    device: RemoteDevice,
    registry: CapabilityRegistry,
    queue: OperationQueue,
    transport: Arc<dyn Transport>,
    config: SessionConfig,
    state: watch::Sender<SessionState>,
    events: mpsc::UnboundedSender<SessionEvent>,
    internal: mpsc::UnboundedSender<Internal>,
    generation: u64,
    attempt: Option<CancellationToken>,
    in_flight: Option<JoinHandle<()>>,
    notify_disconnect: bool,
    /// Links still being disconnected and closed by background tasks.
    releases_in_progress: usize,
    /// A connect attempt is waiting for those releases before opening a link.
    link_deferred: bool,
    shutdown: CancellationToken,
}

#[bon]
impl GattSession {
    /// Spawns a session task and returns its handle and event stream.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// ```no_run
    /// # async fn demo(transport: std::sync::Arc<dyn gattlink::Transport>) -> anyhow::Result<()> {
    /// use gattlink::{CapabilityRegistry, GattSession, RemoteDevice};
    ///
    /// let (session, mut events) = GattSession::builder()
    ///     .device(RemoteDevice::new("AA:BB:CC:DD:EE:FF", None))
    ///     .registry(CapabilityRegistry::new())
    ///     .transport(transport)
    ///     .start()?;
    /// session.connect().await?;
    /// let _ = events.recv().await;
    /// # Ok(())
    /// # }
    /// ```
    ///
    /// # Errors
    ///
    /// Returns an error when the transport's link events were already taken.
    #[builder(finish_fn = start)]
    pub fn new(
        device: RemoteDevice,
        registry: CapabilityRegistry,
        transport: Arc<dyn Transport>,
        #[builder(default)] config: SessionConfig,
    ) -> Result<(SessionHandle, SessionEvents), TransportError> {
        let link_events = transport.link_events()?;
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(SessionState::Disconnected);

        let handle = SessionHandle {
            device: device.clone(),
            chunk_size: config.chunk_size,
            declared: Arc::new(registry.declared()),
            commands: commands_tx,
            state: state_rx,
        };
        let span = info_span!("gatt_session", address = %device.address());
        let session = Self {
            device,
            registry,
            queue: OperationQueue::new(),
            transport,
            config,
            state: state_tx,
            events: events_tx,
            internal: internal_tx,
            generation: 0,
            attempt: None,
            in_flight: None,
            notify_disconnect: false,
            releases_in_progress: 0,
            link_deferred: false,
            shutdown: CancellationToken::new(),
        };
        tokio::spawn(
            session
                .run(commands_rx, internal_rx, link_events)
                .instrument(span),
        );

        Ok((
            handle,
            SessionEvents {
                inner: UnboundedReceiverStream::new(events_rx),
            },
        ))
    }
}

impl GattSession {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut internal: mpsc::UnboundedReceiver<Internal>,
        mut link_events: LinkEventStream,
    ) {
        loop {
            tokio::select! {
                biased;
                Some(event) = link_events.next() => self.on_link_event(event),
                Some(event) = internal.recv() => self.on_internal(event),
                command = commands.recv() => match command.map(|command| self.on_command(command)) {
                    Some(ControlFlow::Continue(())) => {}
                    Some(ControlFlow::Break(reply)) => {
                        self.shut_down().await;
                        let _ = reply.send(());
                        return;
                    }
                    None => break,
                },
            }
        }
        self.shut_down().await;
    }

    fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    fn set_state(&self, next: SessionState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            debug!(from = %previous, to = %next, "session state changed");
        }
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    fn on_command(&mut self, command: Command) -> ControlFlow<oneshot::Sender<()>> {
        match command {
            Command::Connect { reply } => {
                let _ = reply.send(self.connect());
            }
            Command::Disconnect { reply } => {
                self.disconnect();
                let _ = reply.send(());
            }
            Command::Submit {
                operation,
                timeout,
                completion,
                accepted,
            } => {
                let _ = accepted.send(self.submit(operation, timeout, completion));
            }
            Command::Snapshot { reply } => {
                let _ = reply.send(SessionSnapshot {
                    state: self.state(),
                    queued_operations: self.queue.len(),
                    operation_in_flight: self.queue.in_flight().is_some(),
                    characteristics: self.registry.characteristics().cloned().collect(),
                });
            }
            Command::End { reply } => return ControlFlow::Break(reply),
        }
        ControlFlow::Continue(())
    }

    #[instrument(skip(self), level = "debug")]
    fn connect(&mut self) -> ConnectAttempt {
        let state = self.state();
        if state != SessionState::Disconnected {
            debug!(%state, "connect ignored; session is already active");
            return ConnectAttempt::AlreadyActive(state);
        }

        self.generation += 1;
        let generation = self.generation;
        let attempt = self.shutdown.child_token();
        self.attempt = Some(attempt.clone());
        self.set_state(SessionState::Connecting);
        info!("connecting");

        self.schedule(
            &attempt,
            self.config.connect_timeout,
            Internal::ConnectTimedOut { generation },
        );

        if self.releases_in_progress > 0 {
            debug!(
                pending = self.releases_in_progress,
                "waiting for the previous link to be released"
            );
            self.link_deferred = true;
        } else {
            self.open_link(generation, attempt);
        }

        ConnectAttempt::Started
    }

    fn open_link(&self, generation: u64, attempt: CancellationToken) {
        let transport = Arc::clone(&self.transport);
        let address = self.device.address().clone();
        let internal = self.internal.clone();
        tokio::spawn(async move {
            tokio::select! {
                () = attempt.cancelled() => {}
                result = transport.connect(&address) => {
                    let _ = internal.send(Internal::LinkUp { generation, result });
                }
            }
        });
    }

    fn disconnect(&mut self) {
        let state = self.state();
        match state {
            SessionState::Disconnected | SessionState::Disconnecting => {
                trace!(%state, "disconnect ignored");
            }
            _ => {
                info!(%state, "disconnecting");
                self.teardown(&OperationError::Disconnected);
                if state.is_connecting() {
                    self.emit(SessionEvent::ConnectFailed(ConnectFailure::Cancelled));
                    self.notify_disconnect = false;
                } else {
                    self.notify_disconnect = true;
                }
                self.set_state(SessionState::Disconnecting);
                self.release_link(true);
            }
        }
    }

    fn submit(
        &mut self,
        operation: Operation,
        timeout: Option<Duration>,
        completion: Completion,
    ) -> Result<(), SessionError> {
        let state = self.state();
        if state != SessionState::Ready {
            return Err(SessionError::NotReady { state });
        }
        trace!(?operation, "queueing operation");
        let dispatch = self.queue.enqueue(
            &mut self.registry,
            operation,
            ByteFramer::new(self.config.chunk_size),
            timeout.or(self.config.operation_timeout),
            completion,
        )?;
        if let Some(dispatch) = dispatch {
            self.dispatch(dispatch);
        }
        Ok(())
    }

    fn on_internal(&mut self, event: Internal) {
        match event {
            Internal::LinkUp { generation, result } => {
                if !self.is_current(generation, SessionState::Connecting) {
                    return;
                }
                match result {
                    Ok(()) => {
                        info!("link established; waiting before service discovery");
                        self.set_state(SessionState::DiscoveringCapabilities);
                        if let Some(attempt) = self.attempt.clone() {
                            self.schedule(
                                &attempt,
                                self.config.settle_delay,
                                Internal::Settled { generation },
                            );
                        }
                    }
                    Err(error) => self.fail_connect(ConnectFailure::transport(&error), true),
                }
            }
            Internal::Settled { generation } => {
                if !self.is_current(generation, SessionState::DiscoveringCapabilities) {
                    return;
                }
                let Some(attempt) = self.attempt.clone() else {
                    return;
                };
                let transport = Arc::clone(&self.transport);
                let internal = self.internal.clone();
                tokio::spawn(async move {
                    tokio::select! {
                        () = attempt.cancelled() => {}
                        result = transport.discover_services() => {
                            let _ = internal.send(Internal::Discovered { generation, result });
                        }
                    }
                });
            }
            Internal::Discovered { generation, result } => {
                if !self.is_current(generation, SessionState::DiscoveringCapabilities) {
                    return;
                }
                match result {
                    Ok(services) => self.on_services_discovered(&services),
                    Err(error) => self.fail_connect(
                        ConnectFailure::Discovery {
                            message: error.to_string(),
                        },
                        true,
                    ),
                }
            }
            Internal::ConnectTimedOut { generation } => {
                if generation != self.generation || !self.state().is_connecting() {
                    return;
                }
                self.fail_connect(
                    ConnectFailure::Timeout {
                        timeout: self.config.connect_timeout,
                    },
                    true,
                );
            }
            Internal::OperationFinished {
                generation,
                id,
                result,
            } => {
                if generation != self.generation {
                    trace!(id, "dropping result from a previous link");
                    return;
                }
                self.on_operation_finished(id, result);
            }
            Internal::LinkReleased { generation } => {
                self.releases_in_progress = self.releases_in_progress.saturating_sub(1);
                if generation == self.generation && self.state() == SessionState::Disconnecting {
                    self.finish_disconnect();
                }
                if self.releases_in_progress == 0
                    && std::mem::take(&mut self.link_deferred)
                    && let Some(attempt) = self.attempt.clone()
                {
                    debug!("previous link released; opening link");
                    self.open_link(self.generation, attempt);
                }
            }
        }
    }

    fn is_current(&self, generation: u64, expected: SessionState) -> bool {
        let current = generation == self.generation && self.state() == expected;
        if !current {
            trace!(generation, state = %self.state(), "ignoring stale link event");
        }
        current
    }

    fn on_services_discovered(&mut self, services: &[DiscoveredService]) {
        let outcome = self.registry.reconcile(services);
        info!(
            resolved = outcome.resolved.len(),
            unavailable = outcome.unavailable.len(),
            "services discovered"
        );

        let notifiable = self.registry.notifiable();
        if notifiable.is_empty() {
            self.become_ready();
            return;
        }

        self.set_state(SessionState::EnablingNotifications);
        for characteristic in notifiable {
            if let Some(dispatch) = self.queue.enqueue_notification_setup(
                &self.registry,
                characteristic,
                self.config.operation_timeout,
            ) {
                self.dispatch(dispatch);
            }
        }
    }

    fn on_operation_finished(
        &mut self,
        id: u64,
        result: Result<OperationOutput, OperationError>,
    ) {
        self.in_flight = None;
        let Some(finished) = self.queue.complete(&mut self.registry, id, result) else {
            return;
        };

        match (finished.origin, finished.outcome) {
            (Origin::NotificationSetup, Err(error)) => {
                let characteristic = finished.step.characteristic().unwrap_or_default();
                self.fail_connect(
                    ConnectFailure::NotificationSetup {
                        characteristic,
                        message: error.to_string(),
                    },
                    true,
                );
                return;
            }
            (Origin::NotificationSetup, Ok(_enabled)) => {
                debug!(characteristic = ?finished.step.characteristic(), "notifications enabled");
            }
            (Origin::Caller, Ok(output)) => self.emit_completion(finished.step.characteristic(), output),
            (Origin::Caller, Err(error)) => {
                debug!(%error, step = ?finished.step, "operation failed");
            }
        }

        if let Some(dispatch) = self.queue.next_dispatch(&self.registry) {
            self.dispatch(dispatch);
        } else if self.state() == SessionState::EnablingNotifications && self.queue.is_empty() {
            self.become_ready();
        }
    }

    fn emit_completion(&self, characteristic: Option<Uuid>, output: FinishedOutput) {
        let event = match (characteristic, output) {
            (Some(characteristic), FinishedOutput::Value(value)) => {
                SessionEvent::CharacteristicRead {
                    characteristic,
                    value,
                }
            }
            (Some(characteristic), FinishedOutput::Written { len }) => SessionEvent::Written {
                characteristic,
                len,
            },
            (_, FinishedOutput::Rssi(rssi)) => SessionEvent::RssiRead(rssi),
            _ => return,
        };
        self.emit(event);
    }

    fn dispatch(&mut self, dispatch: Dispatch) {
        let Dispatch {
            id,
            request,
            timeout: limit,
        } = dispatch;
        trace!(id, ?request, "dispatching operation");
        let generation = self.generation;
        let transport = Arc::clone(&self.transport);
        let internal = self.internal.clone();
        self.in_flight = Some(tokio::spawn(async move {
            let work = execute(transport.as_ref(), request);
            let result = match limit {
                Some(limit) => timeout(limit, work)
                    .await
                    .unwrap_or(Err(OperationError::TimedOut { timeout: limit })),
                None => work.await,
            };
            let _ = internal.send(Internal::OperationFinished {
                generation,
                id,
                result,
            });
        }));
    }

    fn become_ready(&mut self) {
        if let Some(attempt) = self.attempt.take() {
            attempt.cancel();
        }
        self.set_state(SessionState::Ready);
        info!("session ready");
        self.emit(SessionEvent::Connected);
    }

    fn on_link_event(&mut self, event: LinkEvent) {
        match event {
            LinkEvent::Notification { handle, value } => {
                let state = self.state();
                if !matches!(
                    state,
                    SessionState::EnablingNotifications | SessionState::Ready
                ) {
                    trace!(%state, "dropping notification outside an active link");
                    return;
                }
                match self.registry.uuid_for_handle(&handle) {
                    Some(characteristic) => {
                        trace!(%characteristic, len = value.len(), "notification");
                        self.emit(SessionEvent::Notification {
                            characteristic,
                            value,
                        });
                    }
                    None => debug!(
                        characteristic = %handle.characteristic(),
                        "notification for an unregistered characteristic"
                    ),
                }
            }
            LinkEvent::Disconnected if self.link_deferred => {
                trace!("link event from a released link");
            }
            LinkEvent::Disconnected => match self.state() {
                SessionState::Disconnected => {}
                SessionState::Disconnecting => self.finish_disconnect(),
                SessionState::Ready => {
                    warn!("link lost");
                    self.teardown(&OperationError::Disconnected);
                    self.release_link(false);
                    self.set_state(SessionState::Disconnected);
                    self.emit(SessionEvent::Disconnected(DisconnectReason::LinkLost));
                }
                _ => self.fail_connect(ConnectFailure::LinkLost, false),
            },
        }
    }

    fn fail_connect(&mut self, failure: ConnectFailure, disconnect: bool) {
        warn!(%failure, "connect attempt failed");
        self.teardown(&OperationError::Disconnected);
        self.release_link(disconnect);
        self.set_state(SessionState::Disconnected);
        self.emit(SessionEvent::ConnectFailed(failure));
    }

    fn finish_disconnect(&mut self) {
        self.set_state(SessionState::Disconnected);
        info!("disconnected");
        if std::mem::take(&mut self.notify_disconnect) {
            self.emit(SessionEvent::Disconnected(DisconnectReason::Requested));
        }
    }

    /// Drops everything tied to the current link.
    fn teardown(&mut self, error: &OperationError) {
        self.generation += 1;
        self.link_deferred = false;
        if let Some(attempt) = self.attempt.take() {
            attempt.cancel();
        }
        if let Some(in_flight) = self.in_flight.take() {
            in_flight.abort();
        }
        self.queue.clear(error);
        self.registry.clear_link_state();
    }

    /// Disconnects and closes the link in the background. New links are not
    /// opened until [`Internal::LinkReleased`] reports every release done.
    fn release_link(&mut self, disconnect: bool) {
        self.releases_in_progress += 1;
        let generation = self.generation;
        let transport = Arc::clone(&self.transport);
        let internal = self.internal.clone();
        tokio::spawn(async move {
            if disconnect && let Err(error) = transport.disconnect().await {
                debug!(?error, "transport disconnect failed");
            }
            transport.close().await;
            let _ = internal.send(Internal::LinkReleased { generation });
        });
    }

    fn schedule(&self, token: &CancellationToken, delay: Duration, event: Internal) {
        let token = token.clone();
        let internal = self.internal.clone();
        tokio::spawn(async move {
            tokio::select! {
                () = token.cancelled() => {}
                () = sleep(delay) => {
                    let _ = internal.send(event);
                }
            }
        });
    }

    async fn shut_down(&mut self) {
        let state = self.state();
        if state != SessionState::Disconnected {
            info!(%state, "ending session");
            self.teardown(&OperationError::SessionEnded);
            if state.is_connecting() {
                self.emit(SessionEvent::ConnectFailed(ConnectFailure::Cancelled));
            } else if state == SessionState::Ready || self.notify_disconnect {
                self.emit(SessionEvent::Disconnected(DisconnectReason::SessionEnded));
            }
            if let Err(error) = self.transport.disconnect().await {
                debug!(?error, "transport disconnect failed");
            }
            self.set_state(SessionState::Disconnected);
        }
        self.transport.close().await;
        self.shutdown.cancel();
    }
}

async fn execute(
    transport: &dyn Transport,
    request: TransportRequest,
) -> Result<OperationOutput, OperationError> {
    let result = match request {
        TransportRequest::Read(handle) => transport.read(&handle).await.map(OperationOutput::Value),
        TransportRequest::Write(handle, value) => transport
            .write(&handle, &value)
            .await
            .map(|()| OperationOutput::Written),
        TransportRequest::SetNotify(handle, enabled) => transport
            .set_notify(&handle, enabled)
            .await
            .map(|()| OperationOutput::NotifySet(enabled)),
        TransportRequest::ReadRssi => transport.read_rssi().await.map(OperationOutput::Rssi),
    };
    result.map_err(|error| OperationError::Transport {
        message: error.to_string(),
    })
}
