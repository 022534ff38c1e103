use std::time::Duration;

use bon::Builder;
use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::filter::LevelFilter;

use crate::cli::listen::ListenArgs;
use crate::cli::scan::ScanArgs;
use crate::cli::write::WriteArgs;
use crate::error::{CliConfigError, FixtureError};
use crate::hw::{FakeBackendConfig, HexPayload, NotificationPayloads, ScanFixture};

/// Command-line options for the BLE GATT session tool.
#[derive(Debug, Parser)]
#[command(name = "gattlink", about = "Scan, listen to and write BLE GATT peripherals.")]
pub struct Args {
    /// Log level override; `RUST_LOG` applies when omitted.
    #[arg(long, global = true, value_enum)]
    log_level: Option<LogLevel>,
    /// Output format; defaults to pretty on a terminal and JSON otherwise.
    #[arg(long, global = true, value_enum)]
    output: Option<OutputFormat>,
    /// Uses the fake BLE backend with fixture-driven discovery and payloads.
    #[arg(long, global = true)]
    fake: bool,
    /// Fake scan fixtures in the form `address|name|rssi;...`.
    #[arg(long, global = true, requires = "fake", required_if_eq("fake", "true"))]
    fake_scan: Option<ScanFixture>,
    /// Fake initial characteristic value as hexadecimal bytes.
    #[arg(long, global = true, requires = "fake")]
    fake_read: Option<HexPayload>,
    /// Fake notification payloads as comma-separated hexadecimal payloads.
    #[arg(long, global = true, requires = "fake")]
    fake_notifications: Option<NotificationPayloads>,
    /// Fake: answer the first N characteristic reads with corrupted data.
    #[arg(long, global = true, requires = "fake")]
    fake_corrupt_reads: Option<usize>,
    /// Fake: delay every GATT operation (e.g. `20ms`).
    #[arg(long, global = true, requires = "fake", value_parser = parse_duration)]
    fake_latency: Option<Duration>,
    #[command(subcommand)]
    command: Command,
}

impl Args {
    /// Creates argument values directly without CLI parsing.
    #[must_use]
    pub fn new(command: Command) -> Self {
        Self {
            log_level: None,
            output: None,
            fake: false,
            fake_scan: None,
            fake_read: None,
            fake_notifications: None,
            fake_corrupt_reads: None,
            fake_latency: None,
            command,
        }
    }

    /// Enables fake backend mode with pre-parsed fake configuration.
    #[must_use]
    pub fn with_fake(mut self, fake: FakeArgs) -> Self {
        let FakeArgs {
            scan_fixture,
            initial_read,
            notifications,
            corrupt_reads,
            latency,
        } = fake;

        self.fake = true;
        self.fake_scan = Some(scan_fixture);
        self.fake_read = initial_read;
        self.fake_notifications = notifications;
        self.fake_corrupt_reads = corrupt_reads;
        self.fake_latency = Some(latency);
        self
    }

    /// Returns the requested log level override.
    #[must_use]
    pub fn log_level(&self) -> Option<LogLevel> {
        self.log_level
    }

    /// Returns the requested output format.
    #[must_use]
    pub fn output_format(&self) -> Option<OutputFormat> {
        self.output
    }

    /// Splits parsed CLI arguments into command and optional fake-client settings.
    ///
    /// # Errors
    ///
    /// Returns an error if CLI backend configuration is invalid.
    pub fn into_command_and_fake_args(self) -> anyhow::Result<(Command, Option<FakeArgs>)> {
        let Args {
            fake,
            fake_scan,
            fake_read,
            fake_notifications,
            fake_corrupt_reads,
            fake_latency,
            command,
            ..
        } = self;

        let fake_args = if fake {
            let Some(scan_fixture) = fake_scan else {
                return Err(CliConfigError::MissingFakeScanFixture.into());
            };
            Some(FakeArgs {
                scan_fixture,
                initial_read: fake_read,
                notifications: fake_notifications,
                corrupt_reads: fake_corrupt_reads,
                latency: fake_latency.unwrap_or(Duration::ZERO),
            })
        } else {
            None
        };

        Ok((command, fake_args))
    }
}

/// Fake backend arguments for programmatic runs.
#[derive(Debug, Builder)]
pub struct FakeArgs {
    #[builder(with = |value: &str| -> std::result::Result<_, FixtureError> { value.parse() })]
    scan_fixture: ScanFixture,
    #[builder(with = |value: &str| -> std::result::Result<_, FixtureError> { value.parse() })]
    initial_read: Option<HexPayload>,
    #[builder(with = |value: &str| -> std::result::Result<_, FixtureError> { value.parse() })]
    notifications: Option<NotificationPayloads>,
    corrupt_reads: Option<usize>,
    #[builder(default)]
    latency: Duration,
}

impl FakeArgs {
    pub(crate) fn into_backend_config(self) -> FakeBackendConfig {
        let Self {
            scan_fixture,
            initial_read,
            notifications,
            corrupt_reads,
            latency,
        } = self;

        FakeBackendConfig::builder()
            .scan_fixture(scan_fixture)
            .maybe_initial_read(initial_read)
            .maybe_notifications(notifications)
            .maybe_corrupt_reads(corrupt_reads)
            .latency(latency)
            .build()
    }
}

/// Supported CLI commands.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Scan for advertising peripherals.
    Scan(ScanArgs),
    /// Connect to a peripheral and print notifications from its characteristics.
    Listen(ListenArgs),
    /// Connect to a peripheral and write one payload, verifying every chunk.
    Write(WriteArgs),
}

/// Log level override accepted on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub(crate) fn as_level_filter(self) -> LevelFilter {
        match self {
            Self::Error => LevelFilter::ERROR,
            Self::Warn => LevelFilter::WARN,
            Self::Info => LevelFilter::INFO,
            Self::Debug => LevelFilter::DEBUG,
            Self::Trace => LevelFilter::TRACE,
        }
    }
}

/// How command results are written to stdout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Coloured tables for people.
    Pretty,
    /// One JSON document per line.
    Json,
}

pub(crate) fn parse_duration(value: &str) -> Result<Duration, String> {
    humantime::parse_duration(value).map_err(|error| error.to_string())
}
