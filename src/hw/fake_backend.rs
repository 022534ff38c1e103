use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use bon::Builder;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, instrument};
use uuid::Uuid;

use super::model::{Advertisement, CharacteristicHandle, DeviceAddress, DiscoveredService};
use super::transport::{AdvertisementStream, LinkEvent, LinkEventStream, ScanTransport, Transport};
use crate::error::{FixtureError, TransportError};
use crate::gatt::ServiceSpec;

const DEFAULT_FAKE_RSSI: i16 = -58;

/// Parsed fake scan fixture records: `address|name|rssi;...`.
#[derive(Debug, Clone, derive_more::Into)]
pub struct ScanFixture {
    advertisements: Vec<Advertisement>,
}

impl FromStr for ScanFixture {
    type Err = FixtureError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let advertisements = value
            .split(';')
            .map(str::trim)
            .filter(|record| !record.is_empty())
            .map(parse_scan_record)
            .collect::<Result<Vec<_>, _>>()?;
        if advertisements.is_empty() {
            return Err(FixtureError::EmptyFixture);
        }
        Ok(Self { advertisements })
    }
}

fn parse_scan_record(record: &str) -> Result<Advertisement, FixtureError> {
    let fields: Vec<&str> = record.split('|').map(str::trim).collect();
    let (address, name, rssi) = match fields.as_slice() {
        [address, name] => (*address, *name, None),
        [address, name, rssi] => (*address, *name, Some(rssi.parse::<i16>()?)),
        _ => return Err(FixtureError::InvalidRecordFieldCount),
    };
    if address.is_empty() {
        return Err(FixtureError::EmptyAddress);
    }
    let name = (!name.is_empty()).then(|| name.to_string());
    Ok(Advertisement::new(address, name, rssi))
}

/// Parsed hexadecimal payload.
#[derive(Debug, Clone, PartialEq, Eq, derive_more::Into)]
pub struct HexPayload {
    payload: Vec<u8>,
}

impl HexPayload {
    /// Returns the decoded bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.payload
    }
}

impl FromStr for HexPayload {
    type Err = FixtureError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let compact: String = value
            .chars()
            .filter(|character| !character.is_whitespace() && *character != ':')
            .collect();
        let payload = hex::decode(compact)?;
        Ok(Self { payload })
    }
}

/// Comma-separated hexadecimal notification payloads.
#[derive(Debug, Clone, PartialEq, Eq, derive_more::Into)]
pub struct NotificationPayloads {
    payloads: Vec<Vec<u8>>,
}

impl FromStr for NotificationPayloads {
    type Err = FixtureError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let payloads = value
            .split(',')
            .map(str::trim)
            .filter(|payload| !payload.is_empty())
            .map(|payload| payload.parse::<HexPayload>().map(Into::into))
            .collect::<Result<Vec<Vec<u8>>, _>>()?;
        Ok(Self { payloads })
    }
}

/// How the fake answers `connect`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FakeConnect {
    #[default]
    Succeed,
    Fail {
        code: i32,
    },
    Hang,
}

/// How the fake answers characteristic reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FakeRead {
    /// Returns the last written or seeded value.
    #[default]
    Echo,
    /// Returns a corrupted value for the first `n` reads, then echoes.
    CorruptFirst(usize),
    NeverRespond,
}

/// How the fake answers characteristic writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FakeWrite {
    #[default]
    Acknowledge,
    /// Stores the value but never acknowledges.
    NeverAcknowledge,
    Reject {
        code: i32,
    },
}

/// How the fake answers client-configuration descriptor writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FakeDescriptor {
    #[default]
    Acknowledge,
    NeverAcknowledge,
    Reject {
        code: i32,
    },
}

/// A transport call recorded by the fake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportCall {
    Connect(DeviceAddress),
    Disconnect,
    Close,
    DiscoverServices,
    Read(Uuid),
    Write(Uuid, Vec<u8>),
    SetNotify(Uuid, bool),
    ReadRssi,
}

/// Scripted behaviour for [`FakeTransport`].
#[derive(Debug, Clone, Builder)]
pub struct FakeTransportConfig {
    #[builder(default)]
    connect: FakeConnect,
    #[builder(default)]
    services: Vec<DiscoveredService>,
    #[builder(default)]
    read: FakeRead,
    #[builder(default)]
    write: FakeWrite,
    #[builder(default)]
    descriptor: FakeDescriptor,
    /// Descriptor writes to this characteristic are rejected.
    failing_descriptor: Option<Uuid>,
    #[builder(default)]
    values: HashMap<Uuid, Vec<u8>>,
    #[builder(default = DEFAULT_FAKE_RSSI)]
    rssi: i16,
    /// Delay applied to every GATT operation.
    #[builder(default)]
    latency: Duration,
    /// Delay before `disconnect` and `close` take effect.
    #[builder(default)]
    release_latency: Duration,
    /// Pushed as notifications whenever a characteristic is subscribed.
    #[builder(default)]
    notifications_on_subscribe: Vec<Vec<u8>>,
}

impl Default for FakeTransportConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// Builds discovery results that expose exactly the declared services.
#[must_use]
pub fn discovered_from_specs(services: &[ServiceSpec]) -> Vec<DiscoveredService> {
    services
        .iter()
        .map(|service| {
            let characteristics = service
                .characteristics()
                .iter()
                .map(|characteristic| {
                    CharacteristicHandle::new(
                        service.uuid(),
                        characteristic.uuid(),
                        characteristic.capabilities(),
                    )
                })
                .collect();
            DiscoveredService::new(service.uuid(), characteristics)
        })
        .collect()
}

#[derive(Debug, Default)]
struct FakeLinkState {
    calls: Vec<TransportCall>,
    values: HashMap<Uuid, Vec<u8>>,
    reads_served: usize,
    connected: bool,
    in_flight: usize,
    max_in_flight: usize,
}

#[derive(Debug)]
struct Shared {
    state: Mutex<FakeLinkState>,
    link_events: mpsc::UnboundedSender<LinkEvent>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, FakeLinkState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record(&self, call: TransportCall) {
        debug!(?call, "fake transport call");
        self.lock().calls.push(call);
    }

    fn begin_operation(self: &Arc<Self>) -> InFlightGuard {
        let mut state = self.lock();
        state.in_flight += 1;
        state.max_in_flight = state.max_in_flight.max(state.in_flight);
        InFlightGuard {
            shared: Arc::clone(self),
        }
    }
}

struct InFlightGuard {
    shared: Arc<Shared>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let mut state = self.shared.lock();
        state.in_flight = state.in_flight.saturating_sub(1);
    }
}

/// Scriptable in-memory [`Transport`].
#[derive(Debug)]
pub struct FakeTransport {
    config: FakeTransportConfig,
    shared: Arc<Shared>,
    link_events: Mutex<Option<mpsc::UnboundedReceiver<LinkEvent>>>,
}

/// Test-side controller for a [`FakeTransport`].
#[derive(Debug, Clone)]
pub struct FakeLink {
    shared: Arc<Shared>,
    services: Vec<DiscoveredService>,
}

impl FakeTransport {
    /// Creates a fake transport and its controller.
    #[must_use]
    pub fn new(config: FakeTransportConfig) -> (Self, FakeLink) {
        let (link_tx, link_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            state: Mutex::new(FakeLinkState {
                values: config.values.clone(),
                ..FakeLinkState::default()
            }),
            link_events: link_tx,
        });
        let link = FakeLink {
            shared: Arc::clone(&shared),
            services: config.services.clone(),
        };
        let transport = Self {
            config,
            shared,
            link_events: Mutex::new(Some(link_rx)),
        };
        (transport, link)
    }

    async fn simulate_latency(&self) {
        if !self.config.latency.is_zero() {
            sleep(self.config.latency).await;
        }
    }

    async fn simulate_release(&self) {
        if !self.config.release_latency.is_zero() {
            sleep(self.config.release_latency).await;
        }
    }

    fn ensure_connected(&self) -> Result<(), TransportError> {
        if self.shared.lock().connected {
            Ok(())
        } else {
            Err(TransportError::NotConnected)
        }
    }
}

#[async_trait]
impl Transport for FakeTransport {
    fn link_events(&self) -> Result<LinkEventStream, TransportError> {
        let receiver = self
            .link_events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or(TransportError::LinkEventsTaken)?;
        Ok(Box::pin(UnboundedReceiverStream::new(receiver)))
    }

    #[instrument(skip(self), level = "trace")]
    async fn connect(&self, address: &DeviceAddress) -> Result<(), TransportError> {
        self.shared.record(TransportCall::Connect(address.clone()));
        match self.config.connect {
            FakeConnect::Succeed => {
                self.simulate_latency().await;
                self.shared.lock().connected = true;
                Ok(())
            }
            FakeConnect::Fail { code } => Err(TransportError::Status { code }),
            FakeConnect::Hang => std::future::pending().await,
        }
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        self.simulate_release().await;
        self.shared.record(TransportCall::Disconnect);
        let was_connected = std::mem::replace(&mut self.shared.lock().connected, false);
        if was_connected {
            let _ = self.shared.link_events.send(LinkEvent::Disconnected);
        }
        Ok(())
    }

    async fn close(&self) {
        self.simulate_release().await;
        self.shared.record(TransportCall::Close);
        self.shared.lock().connected = false;
    }

    async fn discover_services(&self) -> Result<Vec<DiscoveredService>, TransportError> {
        self.shared.record(TransportCall::DiscoverServices);
        self.ensure_connected()?;
        self.simulate_latency().await;
        Ok(self.config.services.clone())
    }

    async fn read(&self, handle: &CharacteristicHandle) -> Result<Vec<u8>, TransportError> {
        let uuid = handle.characteristic();
        self.shared.record(TransportCall::Read(uuid));
        self.ensure_connected()?;
        let _guard = self.shared.begin_operation();
        self.simulate_latency().await;

        let (value, served) = {
            let mut state = self.shared.lock();
            state.reads_served += 1;
            (
                state.values.get(&uuid).cloned().unwrap_or_default(),
                state.reads_served,
            )
        };
        match self.config.read {
            FakeRead::Echo => Ok(value),
            FakeRead::CorruptFirst(count) if served <= count => {
                Ok(value.iter().map(|byte| !byte).chain([0xee]).collect())
            }
            FakeRead::CorruptFirst(_) => Ok(value),
            FakeRead::NeverRespond => std::future::pending().await,
        }
    }

    async fn write(
        &self,
        handle: &CharacteristicHandle,
        value: &[u8],
    ) -> Result<(), TransportError> {
        let uuid = handle.characteristic();
        self.shared
            .record(TransportCall::Write(uuid, value.to_vec()));
        self.ensure_connected()?;
        let _guard = self.shared.begin_operation();
        self.simulate_latency().await;

        match self.config.write {
            FakeWrite::Acknowledge => {
                self.shared.lock().values.insert(uuid, value.to_vec());
                Ok(())
            }
            FakeWrite::NeverAcknowledge => {
                self.shared.lock().values.insert(uuid, value.to_vec());
                std::future::pending().await
            }
            FakeWrite::Reject { code } => Err(TransportError::Status { code }),
        }
    }

    async fn set_notify(
        &self,
        handle: &CharacteristicHandle,
        enabled: bool,
    ) -> Result<(), TransportError> {
        let uuid = handle.characteristic();
        self.shared.record(TransportCall::SetNotify(uuid, enabled));
        self.ensure_connected()?;
        let _guard = self.shared.begin_operation();
        self.simulate_latency().await;

        if self.config.failing_descriptor == Some(uuid) {
            return Err(TransportError::Status { code: 133 });
        }
        match self.config.descriptor {
            FakeDescriptor::Acknowledge => {}
            FakeDescriptor::NeverAcknowledge => std::future::pending::<()>().await,
            FakeDescriptor::Reject { code } => return Err(TransportError::Status { code }),
        }
        if enabled {
            for value in &self.config.notifications_on_subscribe {
                let _ = self.shared.link_events.send(LinkEvent::Notification {
                    handle: handle.clone(),
                    value: value.clone(),
                });
            }
        }
        Ok(())
    }

    async fn read_rssi(&self) -> Result<i16, TransportError> {
        self.shared.record(TransportCall::ReadRssi);
        self.ensure_connected()?;
        let _guard = self.shared.begin_operation();
        self.simulate_latency().await;
        Ok(self.config.rssi)
    }
}

impl FakeLink {
    /// Returns every transport call made so far.
    #[must_use]
    pub fn calls(&self) -> Vec<TransportCall> {
        self.shared.lock().calls.clone()
    }

    /// Returns how many calls of one kind were made.
    #[must_use]
    pub fn count(&self, matches: impl Fn(&TransportCall) -> bool) -> usize {
        self.shared
            .lock()
            .calls
            .iter()
            .filter(|call| matches(call))
            .count()
    }

    /// Returns the highest number of GATT operations ever running at once.
    #[must_use]
    pub fn max_concurrent_operations(&self) -> usize {
        self.shared.lock().max_in_flight
    }

    /// Returns the value stored for a characteristic.
    #[must_use]
    pub fn value(&self, characteristic: Uuid) -> Option<Vec<u8>> {
        self.shared.lock().values.get(&characteristic).cloned()
    }

    /// Pushes a notification from the peripheral.
    ///
    /// Returns `false` when the characteristic is not among the fake services.
    pub fn notify(&self, characteristic: Uuid, value: Vec<u8>) -> bool {
        let Some(handle) = self
            .services
            .iter()
            .find_map(|service| service.characteristic(characteristic))
        else {
            return false;
        };
        self.shared
            .link_events
            .send(LinkEvent::Notification {
                handle: handle.clone(),
                value,
            })
            .is_ok()
    }

    /// Simulates the peripheral dropping the link.
    pub fn drop_link(&self) {
        self.shared.lock().connected = false;
        let _ = self.shared.link_events.send(LinkEvent::Disconnected);
    }
}

/// A scan call recorded by [`FakeScanTransport`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanCall {
    Start(Vec<Uuid>),
    Stop,
}

/// In-memory [`ScanTransport`] that replays fixture advertisements on every
/// scan start, optionally followed by advertisements pushed by a test.
#[derive(Debug)]
pub struct FakeScanTransport {
    advertisements: Vec<Advertisement>,
    live: Mutex<Option<mpsc::UnboundedReceiver<Advertisement>>>,
    calls: Arc<Mutex<Vec<ScanCall>>>,
    stop_failure: Option<i32>,
}

/// Test-side sender for live advertisements and scan call inspection.
#[derive(Debug, Clone)]
pub struct FakeAdvertiser {
    sender: mpsc::UnboundedSender<Advertisement>,
    calls: Arc<Mutex<Vec<ScanCall>>>,
}

impl FakeScanTransport {
    /// Creates a scan transport replaying `advertisements`.
    #[must_use]
    pub fn new(advertisements: Vec<Advertisement>) -> Self {
        Self {
            advertisements,
            live: Mutex::new(None),
            calls: Arc::default(),
            stop_failure: None,
        }
    }

    /// Creates a scan transport whose first scan also carries advertisements
    /// pushed through the returned [`FakeAdvertiser`].
    #[must_use]
    pub fn with_advertiser(advertisements: Vec<Advertisement>) -> (Self, FakeAdvertiser) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let transport = Self {
            advertisements,
            live: Mutex::new(Some(receiver)),
            calls: Arc::default(),
            stop_failure: None,
        };
        let advertiser = FakeAdvertiser {
            sender,
            calls: Arc::clone(&transport.calls),
        };
        (transport, advertiser)
    }

    /// Makes every `stop_scan` fail with the given link status.
    #[must_use]
    pub fn with_stop_failure(mut self, code: i32) -> Self {
        self.stop_failure = Some(code);
        self
    }

    /// Returns every scan call made so far.
    #[must_use]
    pub fn calls(&self) -> Vec<ScanCall> {
        lock_calls(&self.calls).clone()
    }
}

impl From<ScanFixture> for FakeScanTransport {
    fn from(fixture: ScanFixture) -> Self {
        Self::new(fixture.into())
    }
}

#[async_trait]
impl ScanTransport for FakeScanTransport {
    async fn start_scan(&self, services: &[Uuid]) -> Result<AdvertisementStream, TransportError> {
        lock_calls(&self.calls).push(ScanCall::Start(services.to_vec()));
        let replay = tokio_stream::iter(self.advertisements.clone());
        let live = self
            .live
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let stream: AdvertisementStream = match live {
            Some(receiver) => Box::pin(replay.chain(UnboundedReceiverStream::new(receiver))),
            None => Box::pin(replay.chain(tokio_stream::pending())),
        };
        Ok(stream)
    }

    async fn stop_scan(&self) -> Result<(), TransportError> {
        lock_calls(&self.calls).push(ScanCall::Stop);
        match self.stop_failure {
            Some(code) => Err(TransportError::Status { code }),
            None => Ok(()),
        }
    }
}

impl FakeAdvertiser {
    /// Pushes one advertisement into the running scan.
    pub fn advertise(&self, advertisement: Advertisement) -> bool {
        self.sender.send(advertisement).is_ok()
    }

    /// Returns every scan call made so far.
    #[must_use]
    pub fn calls(&self) -> Vec<ScanCall> {
        lock_calls(&self.calls).clone()
    }
}

fn lock_calls(calls: &Mutex<Vec<ScanCall>>) -> MutexGuard<'_, Vec<ScanCall>> {
    calls.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    use super::*;
    use crate::gatt::Capability;

    #[test]
    fn scan_fixture_parses_records() {
        let fixture: ScanFixture = "aa:bb|Thermo|-41; CC:DD||-70 ;EE:FF|Plug"
            .parse()
            .expect("valid fixture");
        let advertisements: Vec<Advertisement> = fixture.into();

        assert_eq!(
            vec![
                Advertisement::new("AA:BB", Some("Thermo".into()), Some(-41)),
                Advertisement::new("CC:DD", None, Some(-70)),
                Advertisement::new("EE:FF", Some("Plug".into()), None),
            ],
            advertisements
        );
    }

    #[rstest]
    #[case::empty("", "EmptyFixture")]
    #[case::too_many_fields("a|b|-1|x", "InvalidRecordFieldCount")]
    #[case::missing_address("|Thermo|-40", "EmptyAddress")]
    #[case::bad_rssi("AA|Thermo|loud", "InvalidRssi")]
    fn scan_fixture_rejects_invalid_records(#[case] input: &str, #[case] expected: &str) {
        let error = input
            .parse::<ScanFixture>()
            .expect_err("invalid fixture should fail");

        assert!(format!("{error:?}").starts_with(expected), "{error:?}");
    }

    #[rstest]
    #[case::plain("DEADBEEF", vec![0xde, 0xad, 0xbe, 0xef])]
    #[case::spaced("de ad be ef", vec![0xde, 0xad, 0xbe, 0xef])]
    #[case::colons("01:02", vec![0x01, 0x02])]
    #[case::empty("", vec![])]
    fn hex_payload_parses(#[case] input: &str, #[case] expected: Vec<u8>) {
        let payload: HexPayload = input.parse().expect("valid hex");

        assert_eq!(expected, payload.as_bytes());
    }

    #[test]
    fn hex_payload_rejects_odd_length() {
        assert_matches!(
            "ABC".parse::<HexPayload>(),
            Err(FixtureError::InvalidHex(_))
        );
    }

    #[test]
    fn notification_payloads_split_on_commas() {
        let payloads: NotificationPayloads = "0102, 03".parse().expect("valid payloads");

        assert_eq!(vec![vec![1, 2], vec![3]], Vec::from(payloads));
    }

    #[tokio::test]
    async fn read_echoes_written_value() -> anyhow::Result<()> {
        let service = Uuid::from_u128(1);
        let characteristic = Uuid::from_u128(2);
        let handle = CharacteristicHandle::new(
            service,
            characteristic,
            [Capability::Read, Capability::Write].into_iter().collect(),
        );
        let (transport, link) = FakeTransport::new(FakeTransportConfig::default());

        transport.connect(&DeviceAddress::new("AA")).await?;
        transport.write(&handle, &[7, 8]).await?;
        let value = transport.read(&handle).await?;

        assert_eq!(vec![7, 8], value);
        assert_eq!(Some(vec![7, 8]), link.value(characteristic));
        assert_eq!(
            vec![
                TransportCall::Connect(DeviceAddress::new("AA")),
                TransportCall::Write(characteristic, vec![7, 8]),
                TransportCall::Read(characteristic),
            ],
            link.calls()
        );
        Ok(())
    }

    #[tokio::test]
    async fn operations_fail_while_disconnected() {
        let handle = CharacteristicHandle::new(Uuid::nil(), Uuid::nil(), Default::default());
        let (transport, _link) = FakeTransport::new(FakeTransportConfig::default());

        assert_matches!(
            transport.read(&handle).await,
            Err(TransportError::NotConnected)
        );
    }

    #[test]
    fn link_events_can_only_be_taken_once() {
        let (transport, _link) = FakeTransport::new(FakeTransportConfig::default());

        assert!(transport.link_events().is_ok());
        assert_matches!(
            transport.link_events().err(),
            Some(TransportError::LinkEventsTaken)
        );
    }
}
