use std::io;

use anyhow::Result;
use tracing::instrument;

use crate::cli::{Command, FakeArgs, LogLevel, OutputFormat};
use crate::hw::{
    HardwareClient, fake_hardware_client as build_fake_hardware_client,
    real_hardware_client as build_real_hardware_client,
};
use crate::telemetry;
use crate::terminal::{SystemTerminalClient, TerminalClient};

const SERVICE_NAME: &str = "gattlink";

/// Creates a hardware client backed by the host's BLE adapter.
#[must_use]
pub fn real_hardware_client() -> Box<dyn HardwareClient> {
    build_real_hardware_client()
}

/// Creates a hardware client backed by fake BLE fixtures.
#[must_use]
pub fn fake_hardware_client(fake_args: FakeArgs) -> Box<dyn HardwareClient> {
    build_fake_hardware_client(fake_args.into_backend_config())
}

/// Runs the CLI command with the system terminal.
///
/// ```
/// # async fn run() -> anyhow::Result<()> {
/// use clap::Parser;
///
/// let args = gattlink::Args::try_parse_from([
///     "gattlink",
///     "--fake",
///     "--fake-scan",
///     "AA:BB:CC|Thermo|-43",
///     "scan",
///     "--duration",
///     "1s",
/// ])?;
/// let log_level = args.log_level();
/// let (command, maybe_fake_args) = args.into_command_and_fake_args()?;
/// let hardware_client = match maybe_fake_args {
///     Some(fake_args) => gattlink::fake_hardware_client(fake_args),
///     None => gattlink::real_hardware_client(),
/// };
/// let mut out = Vec::new();
/// gattlink::run(command, &mut out, hardware_client, log_level, None).await?;
/// # Ok(())
/// # }
/// ```
///
/// # Errors
///
/// Returns an error if tracing initialisation fails, BLE interaction fails, or
/// output writing fails.
pub async fn run<W>(
    command: Command,
    out: &mut W,
    hardware_client: Box<dyn HardwareClient>,
    log_level: Option<LogLevel>,
    output_format: Option<OutputFormat>,
) -> Result<()>
where
    W: io::Write,
{
    run_with_clients(
        command,
        out,
        &SystemTerminalClient,
        hardware_client,
        log_level,
        output_format,
    )
    .await
}

/// Runs the CLI command with injected clients.
///
/// Without an explicit `output_format`, output is pretty when stdout is a
/// terminal and JSON otherwise.
///
/// # Errors
///
/// Returns an error if tracing initialisation fails, BLE interaction fails, or
/// output writing fails.
#[instrument(
    skip(out, terminal_client, hardware_client),
    level = "info",
    fields(command = %command_name(&command))
)]
pub async fn run_with_clients<W>(
    command: Command,
    out: &mut W,
    terminal_client: &dyn TerminalClient,
    hardware_client: Box<dyn HardwareClient>,
    log_level: Option<LogLevel>,
    output_format: Option<OutputFormat>,
) -> Result<()>
where
    W: io::Write,
{
    telemetry::initialise_tracing(
        SERVICE_NAME,
        terminal_client.stderr_is_terminal(),
        log_level.map(LogLevel::as_level_filter),
    )?;

    let output_format = output_format.unwrap_or(if terminal_client.stdout_is_terminal() {
        OutputFormat::Pretty
    } else {
        OutputFormat::Json
    });
    let client = hardware_client.as_ref();

    match command {
        Command::Scan(args) => {
            crate::cli::scan::run(client, &args, out, terminal_client, output_format).await
        }
        Command::Listen(args) => {
            crate::cli::listen::run(client, &args, out, terminal_client, output_format).await
        }
        Command::Write(args) => {
            crate::cli::write::run(client, &args, out, terminal_client, output_format).await
        }
    }
}

fn command_name(command: &Command) -> &'static str {
    match command {
        Command::Scan(_args) => "scan",
        Command::Listen(_args) => "listen",
        Command::Write(_args) => "write",
    }
}
