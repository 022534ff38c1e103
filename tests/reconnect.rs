use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use gattlink::{
    Advertisement, Capability, CapabilityRegistry, ConnectAttempt, FakeLink, FakeScanTransport,
    FakeTransport, FakeTransportConfig, GattSession, ReconnectError, RemoteDevice, ScanCall,
    ScanError, ScanMode, Scanner, ServiceSpec, SessionEvent, SessionEvents, SessionHandle,
    SessionState, TransportCall, TransportError, discovered_from_specs, reconnect_by_scan,
};
use pretty_assertions::assert_eq;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

const ADDRESS: &str = "C4:7C:8D:6A:12:9E";
const SERVICE: Uuid = Uuid::from_u128(0x0000_1000_0000_1000_8000_0080_5f9b_34fb);
const CONTROL: Uuid = Uuid::from_u128(0x0000_1001_0000_1000_8000_0080_5f9b_34fb);

fn start_session() -> anyhow::Result<(SessionHandle, SessionEvents, FakeLink)> {
    let service = ServiceSpec::new(SERVICE).with_characteristic(CONTROL, [Capability::Write]);
    let (transport, link) = FakeTransport::new(
        FakeTransportConfig::builder()
            .services(discovered_from_specs(std::slice::from_ref(&service)))
            .build(),
    );
    let (session, events) = GattSession::builder()
        .device(RemoteDevice::new(ADDRESS, Some("Thermo".into())))
        .registry(CapabilityRegistry::new().with_service(service))
        .transport(Arc::new(transport))
        .start()?;
    Ok((session, events, link))
}

#[tokio::test(start_paused = true)]
async fn reconnects_when_device_advertises_under_its_name() -> anyhow::Result<()> {
    let (session, mut events, link) = start_session()?;
    let (transport, advertiser) = FakeScanTransport::with_advertiser(vec![Advertisement::new(
        "11:22:33:44:55:66",
        Some("Plug".into()),
        Some(-70),
    )]);
    let mut scanner = Scanner::new(Arc::new(transport));
    let cancel = CancellationToken::new();

    let advertise_later = async {
        sleep(Duration::from_secs(3)).await;
        advertiser.advertise(Advertisement::new(
            "D0:0D:00:00:00:01",
            Some("THERMO".into()),
            Some(-48),
        ));
    };
    let (attempt, ()) = tokio::join!(
        reconnect_by_scan(&mut scanner, &session, ScanMode::low_power(), &cancel),
        advertise_later
    );

    assert_eq!(ConnectAttempt::Started, attempt?);
    assert_eq!(Some(SessionEvent::Connected), events.recv().await);
    assert_eq!(vec![ScanCall::Start(vec![]), ScanCall::Stop], advertiser.calls());
    assert_eq!(Some(&TransportCall::Connect(ADDRESS.into())), link.calls().first());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn cancelled_search_stops_scanner_without_connecting() -> anyhow::Result<()> {
    let (session, _events, link) = start_session()?;
    let (transport, advertiser) = FakeScanTransport::with_advertiser(vec![]);
    let mut scanner = Scanner::new(Arc::new(transport));
    let cancel = CancellationToken::new();

    let deadline = async {
        sleep(Duration::from_secs(10)).await;
        cancel.cancel();
    };
    let (result, ()) = tokio::join!(
        reconnect_by_scan(&mut scanner, &session, ScanMode::Continuous, &cancel),
        deadline
    );

    assert_matches!(result, Err(ReconnectError::Cancelled));
    assert_eq!(vec![ScanCall::Start(vec![]), ScanCall::Stop], advertiser.calls());
    assert_eq!(SessionState::Disconnected, session.state());
    assert!(link.calls().is_empty());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn active_session_is_left_alone() -> anyhow::Result<()> {
    let (session, mut events, _link) = start_session()?;
    session.connect().await?;
    assert_eq!(Some(SessionEvent::Connected), events.recv().await);
    let mut scanner = Scanner::new(Arc::new(FakeScanTransport::new(vec![
        Advertisement::new(ADDRESS, None, Some(-50)),
    ])));

    let attempt =
        reconnect_by_scan(&mut scanner, &session, ScanMode::Continuous, &CancellationToken::new())
            .await?;

    assert_eq!(ConnectAttempt::AlreadyActive(SessionState::Ready), attempt);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn stop_failure_does_not_mask_cancellation() -> anyhow::Result<()> {
    let (session, _events, link) = start_session()?;
    let transport = FakeScanTransport::new(vec![]).with_stop_failure(-5);
    let mut scanner = Scanner::new(Arc::new(transport));
    let cancel = CancellationToken::new();
    cancel.cancel();

    let result = reconnect_by_scan(&mut scanner, &session, ScanMode::Continuous, &cancel).await;

    assert_matches!(result, Err(ReconnectError::Cancelled));
    assert!(link.calls().is_empty());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn stop_failure_is_reported_once_the_device_is_found() -> anyhow::Result<()> {
    let (session, _events, link) = start_session()?;
    let transport = FakeScanTransport::new(vec![Advertisement::new(ADDRESS, None, Some(-50))])
        .with_stop_failure(-5);
    let mut scanner = Scanner::new(Arc::new(transport));

    let result =
        reconnect_by_scan(&mut scanner, &session, ScanMode::Continuous, &CancellationToken::new())
            .await;

    assert_matches!(
        result,
        Err(ReconnectError::Scan(ScanError::Transport(TransportError::Status { code: -5 })))
    );
    assert!(link.calls().is_empty());
    Ok(())
}
