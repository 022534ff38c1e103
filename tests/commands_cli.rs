use clap::Parser;
use clap::error::ErrorKind;
use insta::assert_snapshot;
use pretty_assertions::assert_eq;

const SERVICE: &str = "6e400001-b5a3-f393-e0a9-e50e24dcca9e";
const DATA: &str = "6e400002-b5a3-f393-e0a9-e50e24dcca9e";

#[derive(Debug, Default)]
struct FakeTerminalClient;

impl gattlink::TerminalClient for FakeTerminalClient {
    fn stdout_is_terminal(&self) -> bool {
        false
    }

    fn stderr_is_terminal(&self) -> bool {
        false
    }
}

async fn run_with_parsed_args(args: gattlink::Args) -> anyhow::Result<String> {
    let mut output = Vec::new();
    let log_level = args.log_level();
    let output_format = args.output_format();
    let (command, maybe_fake_args) = args.into_command_and_fake_args()?;
    let hardware_client = match maybe_fake_args {
        Some(fake_args) => gattlink::fake_hardware_client(fake_args),
        None => gattlink::real_hardware_client(),
    };
    gattlink::run_with_clients(
        command,
        &mut output,
        &FakeTerminalClient,
        hardware_client,
        log_level,
        output_format,
    )
    .await?;
    Ok(String::from_utf8(output)?)
}

async fn run_with_argv<const N: usize>(argv: [&str; N]) -> anyhow::Result<String> {
    let parsed_args = gattlink::Args::try_parse_from(argv)?;
    run_with_parsed_args(parsed_args).await
}

#[tokio::test(start_paused = true)]
async fn scan_command_prints_one_json_line_per_device() -> anyhow::Result<()> {
    let stdout = run_with_argv([
        "gattlink",
        "--fake",
        "--fake-scan",
        "aa:bb:cc|Thermo|-43;DD:EE:FF||-70",
        "scan",
        "--duration",
        "2s",
    ])
    .await?;

    assert_snapshot!(stdout.trim_end(), @r#"
    {"device":{"address":"AA:BB:CC","name":"Thermo"},"rssi":-43,"sightings":1}
    {"device":{"address":"DD:EE:FF","name":null},"rssi":-70,"sightings":1}
    "#);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn scan_command_applies_name_filter() -> anyhow::Result<()> {
    let stdout = run_with_argv([
        "gattlink",
        "--fake",
        "--fake-scan",
        "AA:BB:CC|Thermo|-43;DD:EE:FF|Plug|-70",
        "scan",
        "--name",
        "Plug",
        "--duration",
        "1s",
    ])
    .await?;

    assert_eq!(
        r#"{"device":{"address":"DD:EE:FF","name":"Plug"},"rssi":-70,"sightings":1}"#,
        stdout.trim_end()
    );
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn scan_command_pretty_output_lists_devices() -> anyhow::Result<()> {
    let fake = gattlink::FakeArgs::builder()
        .scan_fixture("AA:BB:CC|Thermo|-43")?
        .build();
    let args = gattlink::Args::new(gattlink::Command::Scan(gattlink::ScanArgs::new(
        std::time::Duration::from_secs(1),
    )))
    .with_fake(fake);
    let mut output = Vec::new();
    let (command, fake_args) = args.into_command_and_fake_args()?;
    let client = gattlink::fake_hardware_client(
        fake_args.ok_or_else(|| anyhow::anyhow!("fake arguments expected"))?,
    );

    gattlink::run_with_clients(
        command,
        &mut output,
        &FakeTerminalClient,
        client,
        None,
        Some(gattlink::OutputFormat::Pretty),
    )
    .await?;
    let stdout = String::from_utf8(output)?;

    assert!(stdout.contains("AA:BB:CC"), "{stdout}");
    assert!(stdout.contains("Thermo"), "{stdout}");
    assert!(stdout.contains("-43 dBm"), "{stdout}");
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn listen_command_streams_notifications_until_limit() -> anyhow::Result<()> {
    let stdout = run_with_argv([
        "gattlink",
        "--fake",
        "--fake-scan",
        "C4:7C:8D:6A:12:9E|Thermo|-50",
        "--fake-notifications",
        "0102,FF",
        "--output",
        "json",
        "listen",
        "--address",
        "c4:7c:8d:6a:12:9e",
        "--service",
        SERVICE,
        "--notify",
        DATA,
        "--limit",
        "2",
    ])
    .await?;

    assert_snapshot!(stdout.trim_end(), @r#"
    {"index":1,"characteristic":"6e400002-b5a3-f393-e0a9-e50e24dcca9e","value":"0102"}
    {"index":2,"characteristic":"6e400002-b5a3-f393-e0a9-e50e24dcca9e","value":"FF"}
    {"received":2,"stop_reason":"reached_limit"}
    "#);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn write_command_reports_verified_receipt() -> anyhow::Result<()> {
    let stdout = run_with_argv([
        "gattlink",
        "--fake",
        "--fake-scan",
        "C4:7C:8D:6A:12:9E|Thermo|-50",
        "write",
        "--address",
        "C4:7C:8D:6A:12:9E",
        "--service",
        SERVICE,
        "--characteristic",
        DATA,
        "--payload",
        "00112233445566778899AABBCCDDEEFF0011223344",
        "--output",
        "json",
    ])
    .await?;

    assert_snapshot!(
        stdout.trim_end(),
        @r#"{"chunks":2,"bytes":21,"rewrites":0,"verify_reads":2,"unacknowledged_writes":0}"#
    );
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn write_command_reads_back_until_the_chunk_matches() -> anyhow::Result<()> {
    let stdout = run_with_argv([
        "gattlink",
        "--fake",
        "--fake-scan",
        "C4:7C:8D:6A:12:9E|Thermo|-50",
        "--fake-corrupt-reads",
        "1",
        "--fake-latency",
        "15ms",
        "--output",
        "json",
        "write",
        "--address",
        "C4:7C:8D:6A:12:9E",
        "--service",
        SERVICE,
        "--characteristic",
        DATA,
        "--payload",
        "0102",
    ])
    .await?;

    assert_snapshot!(
        stdout.trim_end(),
        @r#"{"chunks":1,"bytes":2,"rewrites":0,"verify_reads":2,"unacknowledged_writes":0}"#
    );
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn write_command_fails_when_device_never_advertises() {
    let result = run_with_argv([
        "gattlink",
        "--fake",
        "--fake-scan",
        "AA:BB:CC|Plug|-70",
        "--output",
        "json",
        "write",
        "--address",
        "C4:7C:8D:6A:12:9E",
        "--service",
        SERVICE,
        "--characteristic",
        DATA,
        "--payload",
        "01",
        "--scan-timeout",
        "5s",
    ])
    .await;

    let error = result.expect_err("missing device should fail the write");
    assert!(
        error
            .downcast_ref::<gattlink::ReconnectError>()
            .is_some_and(|error| matches!(error, gattlink::ReconnectError::Cancelled)),
        "{error:?}"
    );
}

#[test]
fn listen_requires_a_notify_characteristic() {
    let result = gattlink::Args::try_parse_from([
        "gattlink",
        "listen",
        "--address",
        "AA:BB",
        "--service",
        SERVICE,
    ]);

    let error = result.expect_err("listen without --notify should fail");
    assert_eq!(ErrorKind::MissingRequiredArgument, error.kind());
}

#[test]
fn write_rejects_invalid_hex_payload() {
    let result = gattlink::Args::try_parse_from([
        "gattlink",
        "write",
        "--address",
        "AA:BB",
        "--service",
        SERVICE,
        "--characteristic",
        DATA,
        "--payload",
        "XYZ",
    ]);

    let error = result.expect_err("invalid payload should fail");
    assert_eq!(ErrorKind::ValueValidation, error.kind());
}

#[test]
fn fake_args_builder_rejects_invalid_fixture() {
    let result = gattlink::FakeArgs::builder().scan_fixture("invalid-record");

    assert!(matches!(
        result,
        Err(gattlink::FixtureError::InvalidRecordFieldCount)
    ));
}
