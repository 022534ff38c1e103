pub(crate) mod command;
pub(crate) mod listen;
pub(crate) mod scan;
pub(crate) mod ui;
pub(crate) mod write;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, bail};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};
use uuid::Uuid;

pub use self::command::{Args, Command, FakeArgs, LogLevel, OutputFormat};
pub use self::listen::ListenArgs;
pub use self::scan::ScanArgs;
pub use self::write::WriteArgs;
use crate::gatt::{
    CapabilityRegistry, GattSession, ServiceSpec, SessionConfig, SessionEvent, SessionEvents,
    SessionHandle, reconnect_by_scan,
};
use crate::hw::{HardwareClient, RemoteDevice, ScanTransport};
use crate::scanner::{ScanMode, Scanner};
use crate::terminal::TerminalClient;

use self::ui::ConnectSpinner;

pub(crate) const DEFAULT_SCAN_TIMEOUT: &str = "30s";

/// A session that reached `Ready`, with notifications that arrived while
/// notifications were being enabled.
pub(crate) struct ConnectedSession {
    pub(crate) session: SessionHandle,
    pub(crate) events: SessionEvents,
    pub(crate) early_notifications: Vec<(Uuid, Vec<u8>)>,
}

/// Finds `address` by scanning, then connects and waits for the session to
/// become ready.
#[instrument(skip(client, service), level = "info", fields(service = %service.uuid()))]
pub(crate) async fn connect_session(
    client: &dyn HardwareClient,
    address: &str,
    service: ServiceSpec,
    config: SessionConfig,
    scan_timeout: Duration,
    progress: bool,
) -> Result<ConnectedSession> {
    let transport = client.link_transport(std::slice::from_ref(&service)).await?;
    let (session, mut events) = GattSession::builder()
        .device(RemoteDevice::new(address, None))
        .registry(CapabilityRegistry::new().with_service(service))
        .transport(transport)
        .config(config)
        .start()?;

    let scan_transport = client.scan_transport().await?;
    let spinner = ConnectSpinner::new(progress);
    let early_notifications = spinner
        .track(
            session.device().address(),
            session.state_changes(),
            wait_until_ready(scan_transport, &session, &mut events, scan_timeout),
        )
        .await;
    let early_notifications = match early_notifications {
        Ok(early_notifications) => early_notifications,
        Err(error) => {
            session.end().await;
            return Err(error);
        }
    };

    Ok(ConnectedSession {
        session,
        events,
        early_notifications,
    })
}

async fn wait_until_ready(
    scan_transport: Arc<dyn ScanTransport>,
    session: &SessionHandle,
    events: &mut SessionEvents,
    scan_timeout: Duration,
) -> Result<Vec<(Uuid, Vec<u8>)>> {
    let mut scanner = Scanner::new(scan_transport);
    let cancel = CancellationToken::new();
    let deadline = tokio::spawn({
        let cancel = cancel.clone();
        async move {
            tokio::time::sleep(scan_timeout).await;
            cancel.cancel();
        }
    });
    let attempt = reconnect_by_scan(&mut scanner, session, ScanMode::Continuous, &cancel).await;
    deadline.abort();
    attempt?;

    let mut early_notifications = Vec::new();
    loop {
        match events.recv().await {
            Some(SessionEvent::Connected) => return Ok(early_notifications),
            Some(SessionEvent::ConnectFailed(failure)) => return Err(failure.into()),
            Some(SessionEvent::Notification {
                characteristic,
                value,
            }) => early_notifications.push((characteristic, value)),
            Some(event) => debug!(?event, "ignoring event while connecting"),
            None => bail!("session ended before the connection was ready"),
        }
    }
}

/// Progress is drawn only for people watching a terminal.
pub(crate) fn show_progress(
    terminal_client: &dyn TerminalClient,
    output_format: OutputFormat,
) -> bool {
    output_format == OutputFormat::Pretty && terminal_client.stderr_is_terminal()
}

/// Disconnects and ends the session, logging rather than failing on teardown errors.
pub(crate) async fn close_session(session: &SessionHandle) {
    if let Err(error) = session.disconnect().await {
        debug!(?error, "disconnect during close failed");
    }
    session.end().await;
}
