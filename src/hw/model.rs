use std::fmt::{self, Display, Formatter};

use serde::Serialize;
use serde_with::SerializeDisplay;
use tokio::time::Instant;
use uuid::Uuid;

use crate::gatt::Capabilities;

/// Hardware address of a remote peripheral.
///
/// Addresses are normalised to upper case so that `aa:bb` and `AA:BB` name the
/// same device.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, SerializeDisplay)]
pub struct DeviceAddress(String);

impl DeviceAddress {
    /// Creates an address from any textual representation.
    ///
    /// ```
    /// let address = gattlink::DeviceAddress::new("aa:bb:cc:dd:ee:ff");
    /// assert_eq!("AA:BB:CC:DD:EE:FF", address.as_str());
    /// ```
    #[must_use]
    pub fn new(value: impl AsRef<str>) -> Self {
        Self(value.as_ref().trim().to_ascii_uppercase())
    }

    /// Returns the normalised address text.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for DeviceAddress {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceAddress {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Identity of a remote peripheral: its address and optional advertised name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RemoteDevice {
    address: DeviceAddress,
    name: Option<String>,
}

impl RemoteDevice {
    /// Creates a device identity.
    #[must_use]
    pub fn new(address: impl Into<DeviceAddress>, name: Option<String>) -> Self {
        Self {
            address: address.into(),
            name,
        }
    }

    /// Returns the device address.
    #[must_use]
    pub fn address(&self) -> &DeviceAddress {
        &self.address
    }

    /// Returns the advertised local name, if any.
    #[must_use]
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Returns whether `other` names the same peripheral.
    ///
    /// Matches on address, or on the advertised name ignoring ASCII case.
    #[must_use]
    pub fn matches(&self, other: &RemoteDevice) -> bool {
        if other.address == self.address {
            return true;
        }
        match (self.name.as_deref(), other.name.as_deref()) {
            (Some(expected), Some(advertised)) => expected.eq_ignore_ascii_case(advertised),
            _ => false,
        }
    }
}

/// One advertisement packet as reported by a scan transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advertisement {
    /// Address of the advertising peripheral.
    pub address: DeviceAddress,
    /// Advertised local name.
    pub name: Option<String>,
    /// Signal strength in dBm.
    pub rssi: Option<i16>,
    /// Advertised service UUIDs.
    pub services: Vec<Uuid>,
    /// Raw advertisement payload bytes.
    pub data: Vec<u8>,
}

impl Advertisement {
    /// Creates an advertisement with no services or payload.
    #[must_use]
    pub fn new(address: impl Into<DeviceAddress>, name: Option<String>, rssi: Option<i16>) -> Self {
        Self {
            address: address.into(),
            name,
            rssi,
            services: Vec::new(),
            data: Vec::new(),
        }
    }

    /// Adds an advertised service UUID.
    #[must_use]
    pub fn with_service(mut self, service: Uuid) -> Self {
        self.services.push(service);
        self
    }

    /// Replaces the raw payload bytes.
    #[must_use]
    pub fn with_data(mut self, data: Vec<u8>) -> Self {
        self.data = data;
        self
    }
}

/// A de-duplicated scan result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScanEntry {
    device: RemoteDevice,
    rssi: Option<i16>,
    sightings: u32,
    #[serde(skip)]
    last_seen: Instant,
}

impl ScanEntry {
    pub(crate) fn first_sighting(advertisement: &Advertisement, seen_at: Instant) -> Self {
        Self {
            device: RemoteDevice::new(advertisement.address.clone(), advertisement.name.clone()),
            rssi: advertisement.rssi,
            sightings: 1,
            last_seen: seen_at,
        }
    }

    pub(crate) fn record_sighting(&mut self, advertisement: &Advertisement, seen_at: Instant) {
        if self.device.name.is_none() {
            self.device.name.clone_from(&advertisement.name);
        }
        if advertisement.rssi.is_some() {
            self.rssi = advertisement.rssi;
        }
        self.sightings = self.sightings.saturating_add(1);
        self.last_seen = seen_at;
    }

    /// Returns the advertising device.
    #[must_use]
    pub fn device(&self) -> &RemoteDevice {
        &self.device
    }

    /// Returns the most recent RSSI reading.
    #[must_use]
    pub fn rssi(&self) -> Option<i16> {
        self.rssi
    }

    /// Returns how many advertisements were seen from this device.
    #[must_use]
    pub fn sightings(&self) -> u32 {
        self.sightings
    }

    /// Returns when the device was last heard.
    #[must_use]
    pub fn last_seen(&self) -> Instant {
        self.last_seen
    }
}

/// Link-layer handle for a characteristic on a connected peripheral.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CharacteristicHandle {
    service: Uuid,
    characteristic: Uuid,
    capabilities: Capabilities,
}

impl CharacteristicHandle {
    /// Creates a handle from discovery data.
    #[must_use]
    pub fn new(service: Uuid, characteristic: Uuid, capabilities: Capabilities) -> Self {
        Self {
            service,
            characteristic,
            capabilities,
        }
    }

    /// Returns the owning service UUID.
    #[must_use]
    pub fn service(&self) -> Uuid {
        self.service
    }

    /// Returns the characteristic UUID.
    #[must_use]
    pub fn characteristic(&self) -> Uuid {
        self.characteristic
    }

    /// Returns the capabilities reported by the device.
    #[must_use]
    pub fn capabilities(&self) -> Capabilities {
        self.capabilities
    }
}

/// A service reported by service discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredService {
    uuid: Uuid,
    characteristics: Vec<CharacteristicHandle>,
}

impl DiscoveredService {
    /// Creates a discovered service.
    #[must_use]
    pub fn new(uuid: Uuid, characteristics: Vec<CharacteristicHandle>) -> Self {
        Self {
            uuid,
            characteristics,
        }
    }

    /// Returns the service UUID.
    #[must_use]
    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    /// Returns the characteristics discovered under this service.
    #[must_use]
    pub fn characteristics(&self) -> &[CharacteristicHandle] {
        &self.characteristics
    }

    /// Finds a characteristic by UUID.
    #[must_use]
    pub fn characteristic(&self, uuid: Uuid) -> Option<&CharacteristicHandle> {
        self.characteristics
            .iter()
            .find(|handle| handle.characteristic == uuid)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case::same_address("AA:BB", None, "aa:bb", None, true)]
    #[case::name_ignores_case("11:22", Some("Sensor-1"), "33:44", Some("SENSOR-1"), true)]
    #[case::different_name("11:22", Some("Sensor-1"), "33:44", Some("Sensor-2"), false)]
    #[case::unnamed_other("11:22", Some("Sensor-1"), "33:44", None, false)]
    fn device_matches_by_address_or_name(
        #[case] address: &str,
        #[case] name: Option<&str>,
        #[case] other_address: &str,
        #[case] other_name: Option<&str>,
        #[case] expected: bool,
    ) {
        let device = RemoteDevice::new(address, name.map(str::to_string));
        let other = RemoteDevice::new(other_address, other_name.map(str::to_string));

        assert_eq!(expected, device.matches(&other));
    }

    #[test]
    fn sighting_keeps_last_rssi_and_fills_missing_name() {
        let now = Instant::now();
        let mut entry = ScanEntry::first_sighting(&Advertisement::new("AA", None, Some(-70)), now);

        entry.record_sighting(
            &Advertisement::new("AA", Some("Thermo".into()), Some(-52)),
            now,
        );
        entry.record_sighting(&Advertisement::new("AA", None, None), now);

        assert_eq!(Some("Thermo"), entry.device().name());
        assert_eq!(Some(-52), entry.rssi());
        assert_eq!(3, entry.sightings());
    }
}
