use std::io;
use std::time::Duration;

use anyhow::Result;
use clap::Args;
use indicatif::ProgressStyle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, info_span, instrument};
use tracing_indicatif::span_ext::IndicatifSpanExt;
use uuid::Uuid;

use crate::cli::command::parse_duration;
use crate::cli::{
    ConnectedSession, DEFAULT_SCAN_TIMEOUT, OutputFormat, close_session, connect_session,
    show_progress,
};
use crate::gatt::{
    Capability, DEFAULT_CHUNK_SIZE, ReliableWriteConfig, ReliableWriter, ServiceSpec,
    SessionConfig, WriteStrategy,
};
use crate::hw::{HardwareClient, HexPayload};
use crate::terminal::TerminalClient;

use super::ui::{Painter, WriteReceiptView};

/// Arguments for the `write` command.
#[derive(Debug, Args)]
pub struct WriteArgs {
    /// Address of the peripheral.
    #[arg(long)]
    address: String,
    /// Service owning the characteristic.
    #[arg(long)]
    service: Uuid,
    /// Characteristic to write.
    #[arg(long)]
    characteristic: Uuid,
    /// Payload as hexadecimal bytes.
    #[arg(long)]
    payload: HexPayload,
    /// Skip read-back verification of each chunk.
    #[arg(long)]
    fast: bool,
    /// Bytes per chunk.
    #[arg(long, default_value_t = DEFAULT_CHUNK_SIZE)]
    chunk_size: usize,
    /// How long to scan for the peripheral before giving up.
    #[arg(long, default_value = DEFAULT_SCAN_TIMEOUT, value_parser = parse_duration)]
    scan_timeout: Duration,
}

impl WriteArgs {
    /// Creates write arguments for a verified write.
    #[must_use]
    pub fn new(address: &str, service: Uuid, characteristic: Uuid, payload: HexPayload) -> Self {
        Self {
            address: address.to_string(),
            service,
            characteristic,
            payload,
            fast: false,
            chunk_size: DEFAULT_CHUNK_SIZE,
            scan_timeout: Duration::from_secs(30),
        }
    }

    fn strategy(&self) -> WriteStrategy {
        if self.fast {
            WriteStrategy::Fast
        } else {
            WriteStrategy::Verified
        }
    }

    fn service_spec(&self) -> ServiceSpec {
        let mut capabilities = vec![Capability::Write];
        if !self.fast {
            capabilities.push(Capability::Read);
        }
        ServiceSpec::new(self.service).with_characteristic(self.characteristic, capabilities)
    }
}

/// Executes the `write` command.
#[instrument(
    skip(client, out, terminal_client),
    level = "info",
    fields(address = %args.address, characteristic = %args.characteristic)
)]
pub(crate) async fn run<W>(
    client: &dyn HardwareClient,
    args: &WriteArgs,
    out: &mut W,
    terminal_client: &dyn TerminalClient,
    output_format: OutputFormat,
) -> Result<()>
where
    W: io::Write,
{
    let painter = Painter::new(terminal_client.stdout_is_terminal());
    let ConnectedSession { session, .. } = connect_session(
        client,
        &args.address,
        args.service_spec(),
        SessionConfig::builder().chunk_size(args.chunk_size).build(),
        args.scan_timeout,
        show_progress(terminal_client, output_format),
    )
    .await?;

    let writer = ReliableWriter::new(
        session.clone(),
        ReliableWriteConfig::builder()
            .chunk_size(args.chunk_size)
            .build(),
    );
    let payload = args.payload.as_bytes();
    let progress = info_span!("upload", bytes = payload.len());
    progress.pb_set_style(&upload_style());
    progress.pb_set_length(payload.len() as u64);
    let result = writer
        .write_with_progress(
            args.characteristic,
            payload,
            args.strategy(),
            &CancellationToken::new(),
            {
                let progress = progress.clone();
                move |sent| progress.pb_set_position(sent as u64)
            },
        )
        .instrument(progress)
        .await;
    close_session(&session).await;
    let receipt = result?;

    match output_format {
        OutputFormat::Pretty => {
            writeln!(out, "{}", WriteReceiptView::new(&receipt, args.strategy(), &painter))?;
        }
        OutputFormat::Json => {
            serde_json::to_writer(&mut *out, &receipt)?;
            writeln!(out)?;
        }
    }
    Ok(())
}

fn upload_style() -> ProgressStyle {
    ProgressStyle::with_template("{span_name} {wide_bar:.cyan/blue} {pos}/{len} bytes")
        .unwrap_or_else(|_error| ProgressStyle::default_bar())
}
