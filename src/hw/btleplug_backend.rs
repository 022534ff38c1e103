use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use btleplug::api::{
    BDAddr, Central, CentralEvent, CharPropFlags, Characteristic, Manager as _, Peripheral as _,
    PeripheralProperties, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use tokio::sync::mpsc;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, trace};
use uuid::Uuid;

use super::model::{Advertisement, CharacteristicHandle, DeviceAddress, DiscoveredService};
use super::transport::{AdvertisementStream, LinkEvent, LinkEventStream, ScanTransport, Transport};
use crate::error::TransportError;
use crate::gatt::{Capabilities, Capability};

/// Returns the first Bluetooth adapter on this host.
///
/// # Errors
///
/// Returns an error when the BLE stack is unavailable or has no adapters.
#[instrument(level = "trace")]
pub async fn default_adapter() -> Result<Adapter, TransportError> {
    let manager = Manager::new().await?;
    let adapter = manager
        .adapters()
        .await?
        .into_iter()
        .next()
        .ok_or(TransportError::NoAdapters)?;
    let info = adapter.adapter_info().await?;
    debug!(adapter = %info, "using BLE adapter");
    Ok(adapter)
}

#[derive(Debug)]
struct ConnectedLink {
    peripheral: Peripheral,
    forwarder: CancellationToken,
}

/// [`Transport`] backed by a `btleplug` adapter.
///
/// The peripheral must have been seen by the adapter (for example through a
/// previous scan) before it can be connected.
#[derive(Debug)]
pub struct BtleplugTransport {
    adapter: Adapter,
    link: Mutex<Option<ConnectedLink>>,
    link_events_tx: mpsc::UnboundedSender<LinkEvent>,
    link_events_rx: Mutex<Option<mpsc::UnboundedReceiver<LinkEvent>>>,
}

impl BtleplugTransport {
    /// Creates a transport on `adapter`.
    #[must_use]
    pub fn new(adapter: Adapter) -> Self {
        let (link_events_tx, link_events_rx) = mpsc::unbounded_channel();
        Self {
            adapter,
            link: Mutex::new(None),
            link_events_tx,
            link_events_rx: Mutex::new(Some(link_events_rx)),
        }
    }

    fn lock_link(&self) -> MutexGuard<'_, Option<ConnectedLink>> {
        self.link.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn peripheral(&self) -> Result<Peripheral, TransportError> {
        self.lock_link()
            .as_ref()
            .map(|link| link.peripheral.clone())
            .ok_or(TransportError::NotConnected)
    }

    fn characteristic(
        &self,
        handle: &CharacteristicHandle,
    ) -> Result<(Peripheral, Characteristic), TransportError> {
        let peripheral = self.peripheral()?;
        let characteristic = peripheral
            .characteristics()
            .into_iter()
            .find(|candidate| {
                candidate.uuid == handle.characteristic() && candidate.service_uuid == handle.service()
            })
            .ok_or(TransportError::UnknownCharacteristic {
                uuid: handle.characteristic(),
            })?;
        Ok((peripheral, characteristic))
    }

    async fn find_peripheral(&self, address: &DeviceAddress) -> Result<Peripheral, TransportError> {
        for peripheral in self.adapter.peripherals().await? {
            let Some(properties) = peripheral.properties().await? else {
                continue;
            };
            if address_of(&peripheral.id(), &properties) == *address {
                return Ok(peripheral);
            }
        }
        Err(TransportError::UnknownPeripheral {
            address: address.clone(),
        })
    }

    /// Forwards notifications and link loss for `peripheral` until cancelled.
    async fn spawn_forwarder(
        &self,
        peripheral: &Peripheral,
        forwarder: CancellationToken,
    ) -> Result<(), TransportError> {
        let mut notifications = peripheral.notifications().await?;
        let mut central_events = self.adapter.events().await?;
        let peripheral = peripheral.clone();
        let peripheral_id = peripheral.id();
        let link_events = self.link_events_tx.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = forwarder.cancelled() => return,
                    notification = notifications.next() => {
                        let Some(notification) = notification else {
                            trace!("notification stream ended");
                            return;
                        };
                        let handle = peripheral
                            .characteristics()
                            .iter()
                            .find(|characteristic| characteristic.uuid == notification.uuid)
                            .map(handle_from);
                        match handle {
                            Some(handle) => {
                                let _ = link_events.send(LinkEvent::Notification {
                                    handle,
                                    value: notification.value,
                                });
                            }
                            None => debug!(uuid = %notification.uuid, "notification from unknown characteristic"),
                        }
                    }
                    event = central_events.next() => match event {
                        Some(CentralEvent::DeviceDisconnected(id)) if id == peripheral_id => {
                            info!("peripheral disconnected");
                            let _ = link_events.send(LinkEvent::Disconnected);
                            return;
                        }
                        Some(_) => {}
                        None => return,
                    },
                }
            }
        });
        Ok(())
    }
}

#[async_trait]
impl Transport for BtleplugTransport {
    fn link_events(&self) -> Result<LinkEventStream, TransportError> {
        let receiver = self
            .link_events_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or(TransportError::LinkEventsTaken)?;
        Ok(Box::pin(UnboundedReceiverStream::new(receiver)))
    }

    #[instrument(skip(self), level = "debug", fields(%address))]
    async fn connect(&self, address: &DeviceAddress) -> Result<(), TransportError> {
        let peripheral = self.find_peripheral(address).await?;
        if !peripheral.is_connected().await? {
            peripheral.connect().await?;
        }
        let forwarder = CancellationToken::new();
        self.spawn_forwarder(&peripheral, forwarder.clone()).await?;
        let previous = self.lock_link().replace(ConnectedLink {
            peripheral,
            forwarder,
        });
        if let Some(previous) = previous {
            previous.forwarder.cancel();
        }
        Ok(())
    }

    #[instrument(skip(self), level = "debug")]
    async fn disconnect(&self) -> Result<(), TransportError> {
        let Ok(peripheral) = self.peripheral() else {
            return Ok(());
        };
        if peripheral.is_connected().await? {
            peripheral.disconnect().await?;
        }
        Ok(())
    }

    async fn close(&self) {
        if let Some(link) = self.lock_link().take() {
            link.forwarder.cancel();
        }
    }

    #[instrument(skip(self), level = "debug")]
    async fn discover_services(&self) -> Result<Vec<DiscoveredService>, TransportError> {
        let peripheral = self.peripheral()?;
        peripheral.discover_services().await?;
        Ok(peripheral
            .services()
            .into_iter()
            .map(|service| {
                DiscoveredService::new(
                    service.uuid,
                    service.characteristics.iter().map(handle_from).collect(),
                )
            })
            .collect())
    }

    #[instrument(skip(self), level = "trace", fields(uuid = %handle.characteristic()))]
    async fn read(&self, handle: &CharacteristicHandle) -> Result<Vec<u8>, TransportError> {
        let (peripheral, characteristic) = self.characteristic(handle)?;
        Ok(peripheral.read(&characteristic).await?)
    }

    #[instrument(skip(self, value), level = "trace", fields(uuid = %handle.characteristic(), len = value.len()))]
    async fn write(
        &self,
        handle: &CharacteristicHandle,
        value: &[u8],
    ) -> Result<(), TransportError> {
        let (peripheral, characteristic) = self.characteristic(handle)?;
        let write_type = if characteristic.properties.contains(CharPropFlags::WRITE) {
            WriteType::WithResponse
        } else {
            WriteType::WithoutResponse
        };
        Ok(peripheral.write(&characteristic, value, write_type).await?)
    }

    #[instrument(skip(self), level = "trace", fields(uuid = %handle.characteristic()))]
    async fn set_notify(
        &self,
        handle: &CharacteristicHandle,
        enabled: bool,
    ) -> Result<(), TransportError> {
        let (peripheral, characteristic) = self.characteristic(handle)?;
        if enabled {
            peripheral.subscribe(&characteristic).await?;
        } else {
            peripheral.unsubscribe(&characteristic).await?;
        }
        Ok(())
    }

    async fn read_rssi(&self) -> Result<i16, TransportError> {
        self.peripheral()?
            .properties()
            .await?
            .and_then(|properties| properties.rssi)
            .ok_or(TransportError::RssiUnavailable)
    }
}

/// [`ScanTransport`] backed by a `btleplug` adapter.
#[derive(Debug)]
pub struct BtleplugScanner {
    adapter: Adapter,
    forwarder: Mutex<Option<CancellationToken>>,
}

impl BtleplugScanner {
    /// Creates a scan transport on `adapter`.
    #[must_use]
    pub fn new(adapter: Adapter) -> Self {
        Self {
            adapter,
            forwarder: Mutex::new(None),
        }
    }

    fn replace_forwarder(&self, next: Option<CancellationToken>) {
        let previous = std::mem::replace(
            &mut *self.forwarder.lock().unwrap_or_else(PoisonError::into_inner),
            next,
        );
        if let Some(previous) = previous {
            previous.cancel();
        }
    }
}

#[async_trait]
impl ScanTransport for BtleplugScanner {
    #[instrument(skip(self), level = "debug")]
    async fn start_scan(&self, services: &[Uuid]) -> Result<AdvertisementStream, TransportError> {
        let mut central_events = self.adapter.events().await?;
        self.adapter
            .start_scan(ScanFilter {
                services: services.to_vec(),
            })
            .await?;

        let forwarder = CancellationToken::new();
        self.replace_forwarder(Some(forwarder.clone()));
        let adapter = self.adapter.clone();
        let (advertisements_tx, advertisements_rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    () = forwarder.cancelled() => return,
                    event = central_events.next() => event,
                };
                let id = match event {
                    Some(
                        CentralEvent::DeviceDiscovered(id)
                        | CentralEvent::DeviceUpdated(id)
                        | CentralEvent::ManufacturerDataAdvertisement { id, .. }
                        | CentralEvent::ServicesAdvertisement { id, .. },
                    ) => id,
                    Some(_) => continue,
                    None => return,
                };
                match advertisement_for(&adapter, &id).await {
                    Ok(Some(advertisement)) => {
                        if advertisements_tx.send(advertisement).is_err() {
                            return;
                        }
                    }
                    Ok(None) => {}
                    Err(error) => debug!(?error, "failed to read advertisement properties"),
                }
            }
        });

        Ok(Box::pin(UnboundedReceiverStream::new(advertisements_rx)))
    }

    #[instrument(skip(self), level = "debug")]
    async fn stop_scan(&self) -> Result<(), TransportError> {
        self.replace_forwarder(None);
        self.adapter.stop_scan().await?;
        Ok(())
    }
}

async fn advertisement_for(
    adapter: &Adapter,
    id: &PeripheralId,
) -> Result<Option<Advertisement>, TransportError> {
    let peripheral = adapter.peripheral(id).await?;
    let Some(properties) = peripheral.properties().await? else {
        return Ok(None);
    };
    Ok(Some(advertisement_from_properties(
        address_of(id, &properties),
        &properties,
    )))
}

/// Hardware address, falling back to the platform id where the stack hides it.
fn address_of(id: &PeripheralId, properties: &PeripheralProperties) -> DeviceAddress {
    if is_unset(properties.address) {
        DeviceAddress::new(id.to_string())
    } else {
        DeviceAddress::new(properties.address.to_string())
    }
}

fn is_unset(address: BDAddr) -> bool {
    address.into_inner() == [0; 6]
}

fn advertisement_from_properties(
    address: DeviceAddress,
    properties: &PeripheralProperties,
) -> Advertisement {
    let mut manufacturer_data: Vec<(&u16, &Vec<u8>)> = properties.manufacturer_data.iter().collect();
    manufacturer_data.sort_by_key(|(company_id, _payload)| **company_id);
    let data = manufacturer_data
        .into_iter()
        .flat_map(|(company_id, payload)| {
            company_id
                .to_le_bytes()
                .into_iter()
                .chain(payload.iter().copied())
        })
        .collect();

    let mut advertisement =
        Advertisement::new(address, properties.local_name.clone(), properties.rssi).with_data(data);
    for service in &properties.services {
        advertisement = advertisement.with_service(*service);
    }
    advertisement
}

fn handle_from(characteristic: &Characteristic) -> CharacteristicHandle {
    CharacteristicHandle::new(
        characteristic.service_uuid,
        characteristic.uuid,
        capabilities_from_flags(characteristic.properties),
    )
}

fn capabilities_from_flags(flags: CharPropFlags) -> Capabilities {
    let mut capabilities = Capabilities::NONE;
    if flags.contains(CharPropFlags::READ) {
        capabilities = capabilities.with(Capability::Read);
    }
    if flags.intersects(CharPropFlags::WRITE | CharPropFlags::WRITE_WITHOUT_RESPONSE) {
        capabilities = capabilities.with(Capability::Write);
    }
    if flags.contains(CharPropFlags::NOTIFY) {
        capabilities = capabilities.with(Capability::Notify);
    }
    if flags.contains(CharPropFlags::INDICATE) {
        capabilities = capabilities.with(Capability::Indicate);
    }
    capabilities
}
