use std::fmt::Debug;
use std::pin::Pin;

use async_trait::async_trait;
use tokio_stream::Stream;
use uuid::Uuid;

use super::model::{Advertisement, CharacteristicHandle, DeviceAddress, DiscoveredService};
use crate::error::TransportError;

/// Stream of unsolicited link events for one transport.
pub type LinkEventStream = Pin<Box<dyn Stream<Item = LinkEvent> + Send>>;

/// Stream of advertisements produced while a scan is running.
pub type AdvertisementStream = Pin<Box<dyn Stream<Item = Advertisement> + Send>>;

/// Unsolicited events raised by the link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// The peripheral pushed a value for a subscribed characteristic.
    Notification {
        handle: CharacteristicHandle,
        value: Vec<u8>,
    },
    /// The link dropped.
    Disconnected,
}

/// Primitive GATT operations against a single peripheral.
///
/// A session drives at most one of `read`, `write`, `set_notify` and
/// `read_rssi` at a time; implementations do not need to serialise them.
#[async_trait]
pub trait Transport: Debug + Send + Sync {
    /// Takes the link event stream. Only the first call succeeds.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::LinkEventsTaken`] on any later call.
    fn link_events(&self) -> Result<LinkEventStream, TransportError>;

    /// Establishes the link to `address`.
    async fn connect(&self, address: &DeviceAddress) -> Result<(), TransportError>;

    /// Requests an orderly disconnect.
    async fn disconnect(&self) -> Result<(), TransportError>;

    /// Releases link resources. Never fails.
    async fn close(&self);

    /// Enumerates services and characteristics on the connected peripheral.
    async fn discover_services(&self) -> Result<Vec<DiscoveredService>, TransportError>;

    /// Reads a characteristic value.
    async fn read(&self, handle: &CharacteristicHandle) -> Result<Vec<u8>, TransportError>;

    /// Writes a characteristic value.
    async fn write(&self, handle: &CharacteristicHandle, value: &[u8])
    -> Result<(), TransportError>;

    /// Writes the client configuration descriptor to enable or disable notifications.
    async fn set_notify(
        &self,
        handle: &CharacteristicHandle,
        enabled: bool,
    ) -> Result<(), TransportError>;

    /// Reads the current signal strength of the link.
    async fn read_rssi(&self) -> Result<i16, TransportError>;
}

/// Advertisement scanning primitive.
#[async_trait]
pub trait ScanTransport: Debug + Send + Sync {
    /// Starts scanning, optionally restricted to peripherals advertising `services`.
    async fn start_scan(&self, services: &[Uuid]) -> Result<AdvertisementStream, TransportError>;

    /// Stops a running scan. Stopping an idle transport is not an error.
    async fn stop_scan(&self) -> Result<(), TransportError>;
}
