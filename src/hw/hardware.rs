use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bon::Builder;
use btleplug::platform::Adapter;
use tokio::sync::OnceCell;
use tracing::info;

use super::btleplug_backend::{BtleplugScanner, BtleplugTransport, default_adapter};
use super::fake_backend::{
    FakeRead, FakeScanTransport, FakeTransport, FakeTransportConfig, HexPayload,
    NotificationPayloads, ScanFixture, discovered_from_specs,
};
use super::transport::{ScanTransport, Transport};
use crate::error::TransportError;
use crate::gatt::ServiceSpec;

/// Source of scan and link transports for the CLI.
#[async_trait]
pub trait HardwareClient: Send + Sync {
    /// Returns a transport for discovering peripherals.
    async fn scan_transport(&self) -> Result<Arc<dyn ScanTransport>, TransportError>;

    /// Returns a transport for one GATT link exposing `services`.
    async fn link_transport(
        &self,
        services: &[ServiceSpec],
    ) -> Result<Arc<dyn Transport>, TransportError>;
}

/// Creates a hardware client backed by the host's first BLE adapter.
#[must_use]
pub(crate) fn real_hardware_client() -> Box<dyn HardwareClient> {
    Box::new(RealHardwareClient::default())
}

/// Creates a hardware client backed by fixtures.
#[must_use]
pub(crate) fn fake_hardware_client(config: FakeBackendConfig) -> Box<dyn HardwareClient> {
    info!("using fake BLE backend");
    Box::new(FakeHardwareClient { config })
}

#[derive(Debug, Default)]
struct RealHardwareClient {
    adapter: OnceCell<Adapter>,
}

impl RealHardwareClient {
    /// Scanning and connecting must share one adapter so that scanned
    /// peripherals can be found again when connecting.
    async fn adapter(&self) -> Result<Adapter, TransportError> {
        self.adapter
            .get_or_try_init(default_adapter)
            .await
            .cloned()
    }
}

#[async_trait]
impl HardwareClient for RealHardwareClient {
    async fn scan_transport(&self) -> Result<Arc<dyn ScanTransport>, TransportError> {
        Ok(Arc::new(BtleplugScanner::new(self.adapter().await?)))
    }

    async fn link_transport(
        &self,
        _services: &[ServiceSpec],
    ) -> Result<Arc<dyn Transport>, TransportError> {
        Ok(Arc::new(BtleplugTransport::new(self.adapter().await?)))
    }
}

/// Fixture-driven behaviour for the fake hardware client.
#[derive(Debug, Clone, Builder)]
pub(crate) struct FakeBackendConfig {
    scan_fixture: ScanFixture,
    /// Seeds every declared characteristic.
    initial_read: Option<HexPayload>,
    /// Pushed after each subscription.
    notifications: Option<NotificationPayloads>,
    /// Reads answered with corrupted data before echoing.
    corrupt_reads: Option<usize>,
    #[builder(default)]
    latency: Duration,
}

#[derive(Debug)]
struct FakeHardwareClient {
    config: FakeBackendConfig,
}

#[async_trait]
impl HardwareClient for FakeHardwareClient {
    async fn scan_transport(&self) -> Result<Arc<dyn ScanTransport>, TransportError> {
        Ok(Arc::new(FakeScanTransport::from(
            self.config.scan_fixture.clone(),
        )))
    }

    async fn link_transport(
        &self,
        services: &[ServiceSpec],
    ) -> Result<Arc<dyn Transport>, TransportError> {
        let values: HashMap<_, _> = match &self.config.initial_read {
            Some(payload) => services
                .iter()
                .flat_map(ServiceSpec::characteristics)
                .map(|characteristic| (characteristic.uuid(), payload.as_bytes().to_vec()))
                .collect(),
            None => HashMap::new(),
        };
        let notifications = self
            .config
            .notifications
            .clone()
            .map(Into::into)
            .unwrap_or_default();
        let (transport, _link) = FakeTransport::new(
            FakeTransportConfig::builder()
                .services(discovered_from_specs(services))
                .values(values)
                .notifications_on_subscribe(notifications)
                .read(
                    self.config
                        .corrupt_reads
                        .map_or(FakeRead::Echo, FakeRead::CorruptFirst),
                )
                .latency(self.config.latency)
                .build(),
        );
        Ok(Arc::new(transport))
    }
}
