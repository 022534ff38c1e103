use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use gattlink::{
    Advertisement, DeviceAddress, FakeScanTransport, ScanCall, ScanEntry, ScanError, ScanFilter,
    ScanMode, ScanOptions, ScanResults, Scanner, ScannerState,
};
use pretty_assertions::assert_eq;
use tokio::time::{sleep, timeout};
use tokio_stream::StreamExt;
use uuid::Uuid;

const SENSOR: Uuid = Uuid::from_u128(0x0000_181a_0000_1000_8000_0080_5f9b_34fb);

fn thermo(rssi: i16) -> Advertisement {
    Advertisement::new("AA:BB:CC:00:00:01", Some("Thermo".into()), Some(rssi))
}

fn plug() -> Advertisement {
    Advertisement::new("AA:BB:CC:00:00:02", Some("Plug".into()), Some(-70))
}

async fn next_entry(results: &mut ScanResults) -> anyhow::Result<ScanEntry> {
    let entry = timeout(Duration::from_secs(1), results.next())
        .await?
        .ok_or_else(|| anyhow::anyhow!("scan ended"))??;
    Ok(entry)
}

async fn assert_quiet(results: &mut ScanResults) {
    assert!(
        timeout(Duration::from_secs(1), results.next()).await.is_err(),
        "expected no further scan results"
    );
}

fn addresses(entries: &[ScanEntry]) -> Vec<&str> {
    entries
        .iter()
        .map(|entry| entry.device().address().as_str())
        .collect()
}

#[tokio::test(start_paused = true)]
async fn deduplicated_scan_reports_each_device_once() -> anyhow::Result<()> {
    let transport = Arc::new(FakeScanTransport::new(vec![thermo(-60), thermo(-50), plug()]));
    let mut scanner = Scanner::new(transport.clone());

    let mut results = scanner.start(ScanOptions::default())?;
    let first = next_entry(&mut results).await?;
    let second = next_entry(&mut results).await?;
    assert_quiet(&mut results).await;

    assert_eq!(vec!["AA:BB:CC:00:00:01", "AA:BB:CC:00:00:02"], addresses(&[first, second]));
    let entries = scanner.entries();
    assert_eq!(2, entries[0].sightings());
    assert_eq!(Some(-50), entries[0].rssi());
    assert_eq!(vec![ScanCall::Start(vec![])], transport.calls());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn scan_without_deduplication_reports_every_advertisement() -> anyhow::Result<()> {
    let transport = Arc::new(FakeScanTransport::new(vec![thermo(-60), thermo(-50)]));
    let mut scanner = Scanner::new(transport);

    let mut results = scanner.start(ScanOptions::builder().dedupe(false).build())?;
    let first = next_entry(&mut results).await?;
    let second = next_entry(&mut results).await?;
    assert_quiet(&mut results).await;

    assert_eq!(1, first.sightings());
    assert_eq!(2, second.sightings());
    assert_eq!(Some(-50), second.rssi());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn duty_cycled_scan_pauses_between_windows() -> anyhow::Result<()> {
    let transport = Arc::new(FakeScanTransport::new(vec![thermo(-60)]));
    let mut scanner = Scanner::new(transport.clone());
    let mode = ScanMode::DutyCycled {
        window: Duration::from_secs(5),
        sleep: Duration::from_secs(10),
    };

    let mut results = scanner.start(ScanOptions::builder().mode(mode).build())?;
    next_entry(&mut results).await?;
    assert_eq!(ScannerState::Scanning(mode), scanner.state());

    sleep(Duration::from_secs(17)).await;
    assert_eq!(
        vec![ScanCall::Start(vec![]), ScanCall::Stop, ScanCall::Start(vec![])],
        transport.calls()
    );
    // The replayed advertisement is still de-duplicated in the second window.
    assert_quiet(&mut results).await;

    scanner.stop().await?;
    assert_eq!(Some(&ScanCall::Stop), transport.calls().last());
    assert_eq!(ScannerState::Idle, scanner.state());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn second_start_is_rejected_while_scanning() -> anyhow::Result<()> {
    let mut scanner = Scanner::new(Arc::new(FakeScanTransport::new(vec![plug()])));

    let _results = scanner.start(ScanOptions::default())?;

    assert_matches!(
        scanner.start(ScanOptions::default()),
        Err(ScanError::AlreadyScanning)
    );
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn forgotten_device_is_reported_again() -> anyhow::Result<()> {
    let (transport, advertiser) = FakeScanTransport::with_advertiser(vec![]);
    let mut scanner = Scanner::new(Arc::new(transport));
    let mut results = scanner.start(ScanOptions::default())?;

    advertiser.advertise(thermo(-60));
    assert_eq!(1, next_entry(&mut results).await?.sightings());
    advertiser.advertise(thermo(-61));
    assert_quiet(&mut results).await;

    assert!(scanner.forget(&DeviceAddress::new("aa:bb:cc:00:00:01")));
    advertiser.advertise(thermo(-62));
    let entry = next_entry(&mut results).await?;

    assert_eq!(1, entry.sightings());
    assert_eq!(Some(-62), entry.rssi());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn stop_clears_seen_devices() -> anyhow::Result<()> {
    let transport = Arc::new(FakeScanTransport::new(vec![thermo(-60), plug()]));
    let mut scanner = Scanner::new(transport.clone());
    let mut results = scanner.start(ScanOptions::default())?;
    next_entry(&mut results).await?;
    next_entry(&mut results).await?;
    assert_eq!(2, scanner.entries().len());

    scanner.stop().await?;

    assert_eq!(Vec::<ScanEntry>::new(), scanner.entries());
    assert_eq!(ScannerState::Idle, scanner.state());
    assert_eq!(
        vec![ScanCall::Start(vec![]), ScanCall::Stop],
        transport.calls()
    );
    assert_eq!(None, results.next().await.map(|result| result.is_ok()));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn filter_passes_services_to_transport_and_drops_other_devices() -> anyhow::Result<()> {
    let transport = Arc::new(FakeScanTransport::new(vec![
        plug(),
        thermo(-60).with_service(SENSOR),
    ]));
    let mut scanner = Scanner::new(transport.clone());
    let options = ScanOptions::builder()
        .filter(ScanFilter::default().service(SENSOR))
        .build();

    let mut results = scanner.start(options)?;
    let entry = next_entry(&mut results).await?;
    assert_quiet(&mut results).await;

    assert_eq!(Some("Thermo"), entry.device().name());
    assert_eq!(vec![ScanCall::Start(vec![SENSOR])], transport.calls());
    Ok(())
}
