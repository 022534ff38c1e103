use std::io;
use std::time::Duration;

use anyhow::Result;
use clap::Args;
use tokio_stream::StreamExt;
use tracing::{info, instrument};
use uuid::Uuid;

use crate::cli::OutputFormat;
use crate::cli::command::parse_duration;
use crate::hw::HardwareClient;
use crate::scanner::{ScanFilter, ScanMode, ScanOptions, Scanner};
use crate::terminal::TerminalClient;

use super::ui::{Painter, ScanEntryView, ScanSummaryView};

/// Arguments for the `scan` command.
#[derive(Debug, Args)]
pub struct ScanArgs {
    /// Only report devices whose advertised name contains this text.
    #[arg(long)]
    name: Option<String>,
    /// Only report devices advertising this service; repeat for several.
    #[arg(long = "service")]
    services: Vec<Uuid>,
    /// Report every advertisement instead of each device once.
    #[arg(long)]
    all_advertisements: bool,
    /// Alternate 30 s scan windows with 30 s pauses.
    #[arg(long)]
    low_power: bool,
    /// How long to scan for.
    #[arg(long, default_value = "10s", value_parser = parse_duration)]
    duration: Duration,
}

impl ScanArgs {
    /// Creates scan arguments for a bounded, de-duplicated scan.
    #[must_use]
    pub fn new(duration: Duration) -> Self {
        Self {
            name: None,
            services: Vec::new(),
            all_advertisements: false,
            low_power: false,
            duration,
        }
    }

    fn options(&self) -> ScanOptions {
        let mut filter = ScanFilter::default();
        if let Some(name) = &self.name {
            filter = filter.name_contains(name.clone());
        }
        for service in &self.services {
            filter = filter.service(*service);
        }
        let mode = if self.low_power {
            ScanMode::low_power()
        } else {
            ScanMode::Continuous
        };
        ScanOptions::builder()
            .filter(filter)
            .dedupe(!self.all_advertisements)
            .mode(mode)
            .build()
    }
}

/// Executes the `scan` command.
#[instrument(skip(client, out, terminal_client), level = "info", fields(duration = ?args.duration))]
pub(crate) async fn run<W>(
    client: &dyn HardwareClient,
    args: &ScanArgs,
    out: &mut W,
    terminal_client: &dyn TerminalClient,
    output_format: OutputFormat,
) -> Result<()>
where
    W: io::Write,
{
    let painter = Painter::new(terminal_client.stdout_is_terminal());
    let mut scanner = Scanner::new(client.scan_transport().await?);
    let mut results = scanner.start(args.options())?;
    let deadline = tokio::time::sleep(args.duration);
    tokio::pin!(deadline);

    let mut reported = 0_usize;
    loop {
        let next = tokio::select! {
            () = &mut deadline => break,
            _ = tokio::signal::ctrl_c() => {
                info!("scan interrupted");
                break;
            }
            next = results.next() => next,
        };
        let Some(entry) = next else {
            break;
        };
        let entry = entry?;
        reported += 1;
        match output_format {
            OutputFormat::Pretty => writeln!(out, "{}", ScanEntryView::new(&entry, &painter))?,
            OutputFormat::Json => {
                serde_json::to_writer(&mut *out, &entry)?;
                writeln!(out)?;
            }
        }
    }

    let entries = scanner.entries();
    scanner.stop().await?;
    info!(reported, devices = entries.len(), "scan finished");

    if output_format == OutputFormat::Pretty {
        writeln!(out)?;
        writeln!(out, "{}", ScanSummaryView::new(&entries, &painter))?;
    }
    Ok(())
}
