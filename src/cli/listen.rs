use std::io;
use std::time::Duration;

use anyhow::Result;
use clap::Args;
use serde::Serialize;
use strum_macros::Display as StrumDisplay;
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::cli::command::parse_duration;
use crate::cli::{
    ConnectedSession, DEFAULT_SCAN_TIMEOUT, OutputFormat, close_session, connect_session,
    show_progress,
};
use crate::gatt::{Capability, ServiceSpec, SessionConfig, SessionEvent};
use crate::hw::HardwareClient;
use crate::terminal::TerminalClient;

use super::ui::{ListenNotificationView, ListenReadyView, ListenSummaryView, Painter};

/// Arguments for the `listen` command.
#[derive(Debug, Args)]
pub struct ListenArgs {
    /// Address of the peripheral.
    #[arg(long)]
    address: String,
    /// Service owning the characteristics.
    #[arg(long)]
    service: Uuid,
    /// Characteristic to enable notifications on; repeat for several.
    #[arg(long, required = true)]
    notify: Vec<Uuid>,
    /// Stop after this many notifications. If omitted, listen until Ctrl+C.
    #[arg(long)]
    limit: Option<usize>,
    /// How long to scan for the peripheral before giving up.
    #[arg(long, default_value = DEFAULT_SCAN_TIMEOUT, value_parser = parse_duration)]
    scan_timeout: Duration,
}

impl ListenArgs {
    /// Creates listen arguments.
    #[must_use]
    pub fn new(address: &str, service: Uuid, notify: Vec<Uuid>, limit: Option<usize>) -> Self {
        Self {
            address: address.to_string(),
            service,
            notify,
            limit,
            scan_timeout: Duration::from_secs(30),
        }
    }

    fn service_spec(&self) -> ServiceSpec {
        self.notify
            .iter()
            .fold(ServiceSpec::new(self.service), |spec, characteristic| {
                spec.with_characteristic(*characteristic, [Capability::Notify])
            })
    }
}

/// Why a listen session stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, StrumDisplay, Serialize)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub(crate) enum ListenStopReason {
    ReachedLimit,
    Interrupted,
    LinkLost,
}

/// Outcome of a listen session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub(crate) struct ListenSummary {
    pub(crate) received: usize,
    pub(crate) stop_reason: ListenStopReason,
}

#[derive(Serialize)]
struct NotificationRecord {
    index: usize,
    characteristic: Uuid,
    value: String,
}

/// Executes the `listen` command.
#[instrument(skip(client, out, terminal_client), level = "info", fields(address = %args.address))]
pub(crate) async fn run<W>(
    client: &dyn HardwareClient,
    args: &ListenArgs,
    out: &mut W,
    terminal_client: &dyn TerminalClient,
    output_format: OutputFormat,
) -> Result<()>
where
    W: io::Write,
{
    let painter = Painter::new(terminal_client.stdout_is_terminal());
    let ConnectedSession {
        session,
        mut events,
        early_notifications,
    } = connect_session(
        client,
        &args.address,
        args.service_spec(),
        SessionConfig::default(),
        args.scan_timeout,
        show_progress(terminal_client, output_format),
    )
    .await?;

    if output_format == OutputFormat::Pretty {
        writeln!(
            out,
            "{}",
            ListenReadyView::new(session.device(), args.service, &args.notify, &painter)
        )?;
    }

    let mut received = 0_usize;
    let mut pending = early_notifications.into_iter();
    let stop_reason = loop {
        if let Some(limit) = args.limit
            && received >= limit
        {
            break ListenStopReason::ReachedLimit;
        }
        if let Some((characteristic, value)) = pending.next() {
            received += 1;
            write_notification(out, output_format, &painter, received, characteristic, &value)?;
            continue;
        }
        let event = tokio::select! {
            _ = tokio::signal::ctrl_c() => break ListenStopReason::Interrupted,
            event = events.recv() => event,
        };
        match event {
            Some(SessionEvent::Notification {
                characteristic,
                value,
            }) => {
                received += 1;
                write_notification(out, output_format, &painter, received, characteristic, &value)?;
            }
            Some(SessionEvent::Disconnected(reason)) => {
                debug!(%reason, "link closed while listening");
                break ListenStopReason::LinkLost;
            }
            None => break ListenStopReason::LinkLost,
            Some(_) => {}
        }
    };

    close_session(&session).await;

    let summary = ListenSummary {
        received,
        stop_reason,
    };
    match output_format {
        OutputFormat::Pretty => {
            writeln!(out)?;
            writeln!(out, "{}", ListenSummaryView::new(&summary, &painter))?;
        }
        OutputFormat::Json => {
            serde_json::to_writer(&mut *out, &summary)?;
            writeln!(out)?;
        }
    }
    Ok(())
}

fn write_notification<W>(
    out: &mut W,
    output_format: OutputFormat,
    painter: &Painter,
    index: usize,
    characteristic: Uuid,
    value: &[u8],
) -> io::Result<()>
where
    W: io::Write,
{
    match output_format {
        OutputFormat::Pretty => writeln!(
            out,
            "{}",
            ListenNotificationView::new(index, characteristic, value, painter)
        ),
        OutputFormat::Json => {
            let record = NotificationRecord {
                index,
                characteristic,
                value: hex::encode_upper(value),
            };
            serde_json::to_writer(&mut *out, &record)?;
            writeln!(out)
        }
    }
}
