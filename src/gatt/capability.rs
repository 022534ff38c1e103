use std::collections::{HashMap, VecDeque};
use std::fmt::{self, Display, Formatter};

use serde::Serialize;
use strum::IntoEnumIterator;
use strum_macros::{Display as StrumDisplay, EnumIter};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::hw::{CharacteristicHandle, DiscoveredService};

/// A single GATT characteristic property the session cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumIter, StrumDisplay, Serialize)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    Read,
    Write,
    Notify,
    Indicate,
}

impl Capability {
    fn bit(self) -> u8 {
        match self {
            Self::Read => 0b0001,
            Self::Write => 0b0010,
            Self::Notify => 0b0100,
            Self::Indicate => 0b1000,
        }
    }
}

/// A set of [`Capability`] values.
///
/// ```
/// use gattlink::{Capabilities, Capability};
///
/// let caps = Capabilities::from_iter([Capability::Read, Capability::Notify]);
/// assert!(caps.contains(Capability::Notify));
/// assert!(caps.is_notifiable());
/// assert!(!caps.contains(Capability::Write));
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Capabilities(u8);

impl Capabilities {
    /// The empty set.
    pub const NONE: Self = Self(0);

    /// Returns whether `capability` is in the set.
    #[must_use]
    pub fn contains(self, capability: Capability) -> bool {
        self.0 & capability.bit() != 0
    }

    /// Returns the set with `capability` added.
    #[must_use]
    pub fn with(self, capability: Capability) -> Self {
        Self(self.0 | capability.bit())
    }

    /// Returns whether the characteristic can push values (notify or indicate).
    #[must_use]
    pub fn is_notifiable(self) -> bool {
        self.contains(Capability::Notify) || self.contains(Capability::Indicate)
    }

    /// Iterates the capabilities in the set.
    pub fn iter(self) -> impl Iterator<Item = Capability> {
        Capability::iter().filter(move |capability| self.contains(*capability))
    }
}

impl FromIterator<Capability> for Capabilities {
    fn from_iter<I: IntoIterator<Item = Capability>>(iter: I) -> Self {
        iter.into_iter().fold(Self::NONE, Self::with)
    }
}

impl Display for Capabilities {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let names: Vec<String> = self.iter().map(|capability| capability.to_string()).collect();
        if names.is_empty() {
            f.write_str("none")
        } else {
            f.write_str(&names.join("|"))
        }
    }
}

impl Serialize for Capabilities {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(self.iter())
    }
}

/// Declared shape of one characteristic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CharacteristicSpec {
    uuid: Uuid,
    capabilities: Capabilities,
}

impl CharacteristicSpec {
    /// Declares a characteristic with the given capabilities.
    #[must_use]
    pub fn new(uuid: Uuid, capabilities: impl IntoIterator<Item = Capability>) -> Self {
        Self {
            uuid,
            capabilities: capabilities.into_iter().collect(),
        }
    }

    /// Returns the characteristic UUID.
    #[must_use]
    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    /// Returns the declared capabilities.
    #[must_use]
    pub fn capabilities(&self) -> Capabilities {
        self.capabilities
    }
}

/// Declared service with its working characteristics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceSpec {
    uuid: Uuid,
    characteristics: Vec<CharacteristicSpec>,
}

impl ServiceSpec {
    /// Declares an empty service.
    #[must_use]
    pub fn new(uuid: Uuid) -> Self {
        Self {
            uuid,
            characteristics: Vec::new(),
        }
    }

    /// Adds a characteristic declaration.
    #[must_use]
    pub fn with_characteristic(
        mut self,
        uuid: Uuid,
        capabilities: impl IntoIterator<Item = Capability>,
    ) -> Self {
        self.characteristics
            .push(CharacteristicSpec::new(uuid, capabilities));
        self
    }

    /// Returns the service UUID.
    #[must_use]
    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    /// Returns the declared characteristics in declaration order.
    #[must_use]
    pub fn characteristics(&self) -> &[CharacteristicSpec] {
        &self.characteristics
    }
}

/// A registered characteristic and its per-link state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RegisteredCharacteristic {
    uuid: Uuid,
    service: Uuid,
    capabilities: Capabilities,
    #[serde(skip)]
    handle: Option<CharacteristicHandle>,
    #[serde(skip)]
    pending_chunks: VecDeque<Vec<u8>>,
}

impl RegisteredCharacteristic {
    /// Returns the characteristic UUID.
    #[must_use]
    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    /// Returns the UUID of the service it was declared under.
    #[must_use]
    pub fn service(&self) -> Uuid {
        self.service
    }

    /// Returns the declared capabilities.
    #[must_use]
    pub fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    /// Returns the link handle, present only while resolved on a live link.
    #[must_use]
    pub fn handle(&self) -> Option<&CharacteristicHandle> {
        self.handle.as_ref()
    }

    /// Returns the number of write chunks still waiting to be sent.
    #[must_use]
    pub fn pending_chunks(&self) -> usize {
        self.pending_chunks.len()
    }
}

/// Outcome of matching declarations against discovered services.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reconciliation {
    /// Characteristics that received a link handle.
    pub resolved: Vec<Uuid>,
    /// Declared characteristics the device does not expose.
    pub unavailable: Vec<Uuid>,
}

/// Declared services and characteristics, keyed by characteristic UUID.
///
/// Populated before connecting; declarations never change afterwards. Link
/// handles and pending write chunks are attached on discovery and dropped on
/// every teardown.
#[derive(Debug, Clone, Default)]
pub struct CapabilityRegistry {
    characteristics: Vec<RegisteredCharacteristic>,
    index: HashMap<Uuid, usize>,
}

impl CapabilityRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a service and its characteristics.
    ///
    /// A characteristic UUID already registered under another service is ignored.
    #[must_use]
    pub fn with_service(mut self, service: ServiceSpec) -> Self {
        self.register(service);
        self
    }

    /// Registers a service and its characteristics.
    pub fn register(&mut self, service: ServiceSpec) {
        for characteristic in service.characteristics {
            if self.index.contains_key(&characteristic.uuid) {
                warn!(
                    characteristic = %characteristic.uuid,
                    service = %service.uuid,
                    "characteristic already registered; ignoring duplicate declaration"
                );
                continue;
            }
            self.index
                .insert(characteristic.uuid, self.characteristics.len());
            self.characteristics.push(RegisteredCharacteristic {
                uuid: characteristic.uuid,
                service: service.uuid,
                capabilities: characteristic.capabilities,
                handle: None,
                pending_chunks: VecDeque::new(),
            });
        }
    }

    /// Returns the declared capabilities of a characteristic.
    #[must_use]
    pub fn capabilities_of(&self, uuid: Uuid) -> Option<Capabilities> {
        self.get(uuid).map(RegisteredCharacteristic::capabilities)
    }

    /// Returns a registered characteristic.
    #[must_use]
    pub fn get(&self, uuid: Uuid) -> Option<&RegisteredCharacteristic> {
        self.index
            .get(&uuid)
            .and_then(|position| self.characteristics.get(*position))
    }

    fn get_mut(&mut self, uuid: Uuid) -> Option<&mut RegisteredCharacteristic> {
        self.index
            .get(&uuid)
            .and_then(|position| self.characteristics.get_mut(*position))
    }

    /// Iterates registered characteristics in registration order.
    pub fn characteristics(&self) -> impl Iterator<Item = &RegisteredCharacteristic> {
        self.characteristics.iter()
    }

    /// Returns whether nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.characteristics.is_empty()
    }

    /// Returns every declared capability keyed by characteristic.
    #[must_use]
    pub fn declared(&self) -> HashMap<Uuid, Capabilities> {
        self.characteristics
            .iter()
            .map(|characteristic| (characteristic.uuid, characteristic.capabilities))
            .collect()
    }

    /// Attaches link handles from service discovery.
    ///
    /// Declarations with no discovered counterpart stay unresolved and are
    /// logged; they are never fatal.
    pub fn reconcile(&mut self, discovered: &[DiscoveredService]) -> Reconciliation {
        let mut outcome = Reconciliation::default();
        for characteristic in &mut self.characteristics {
            let found = discovered
                .iter()
                .filter(|service| service.uuid() == characteristic.service)
                .find_map(|service| service.characteristic(characteristic.uuid));
            match found {
                Some(handle) => {
                    let missing: Capabilities = characteristic
                        .capabilities
                        .iter()
                        .filter(|capability| !handle.capabilities().contains(*capability))
                        .collect();
                    if missing != Capabilities::NONE {
                        debug!(
                            characteristic = %characteristic.uuid,
                            %missing,
                            "device does not advertise every declared capability"
                        );
                    }
                    characteristic.handle = Some(handle.clone());
                    outcome.resolved.push(characteristic.uuid);
                }
                None => {
                    warn!(
                        characteristic = %characteristic.uuid,
                        service = %characteristic.service,
                        "declared characteristic was not discovered on the device"
                    );
                    characteristic.handle = None;
                    outcome.unavailable.push(characteristic.uuid);
                }
            }
        }
        outcome
    }

    /// Resolved characteristics declaring notify or indicate, in registration order.
    #[must_use]
    pub fn notifiable(&self) -> Vec<Uuid> {
        self.characteristics
            .iter()
            .filter(|characteristic| {
                characteristic.capabilities.is_notifiable() && characteristic.handle.is_some()
            })
            .map(|characteristic| characteristic.uuid)
            .collect()
    }

    /// Maps a link handle back to the registered characteristic.
    #[must_use]
    pub fn uuid_for_handle(&self, handle: &CharacteristicHandle) -> Option<Uuid> {
        self.characteristics
            .iter()
            .find(|characteristic| characteristic.handle.as_ref() == Some(handle))
            .or_else(|| self.get(handle.characteristic()))
            .map(|characteristic| characteristic.uuid)
    }

    /// Drops link handles and pending write chunks.
    pub fn clear_link_state(&mut self) {
        for characteristic in &mut self.characteristics {
            characteristic.handle = None;
            characteristic.pending_chunks.clear();
        }
    }

    pub(crate) fn push_chunks(&mut self, uuid: Uuid, chunks: impl IntoIterator<Item = Vec<u8>>) {
        if let Some(characteristic) = self.get_mut(uuid) {
            characteristic.pending_chunks.extend(chunks);
        }
    }

    pub(crate) fn front_chunk(&self, uuid: Uuid) -> Option<&[u8]> {
        self.get(uuid)
            .and_then(|characteristic| characteristic.pending_chunks.front())
            .map(Vec::as_slice)
    }

    pub(crate) fn pop_chunk(&mut self, uuid: Uuid) -> Option<Vec<u8>> {
        self.get_mut(uuid)
            .and_then(|characteristic| characteristic.pending_chunks.pop_front())
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    const SERVICE: Uuid = Uuid::from_u128(0x0000_ffe0_0000_1000_8000_0080_5f9b_34fb);
    const TX: Uuid = Uuid::from_u128(0x0000_ffe1_0000_1000_8000_0080_5f9b_34fb);
    const RX: Uuid = Uuid::from_u128(0x0000_ffe2_0000_1000_8000_0080_5f9b_34fb);
    const STATUS: Uuid = Uuid::from_u128(0x0000_ffe3_0000_1000_8000_0080_5f9b_34fb);

    fn registry() -> CapabilityRegistry {
        CapabilityRegistry::new().with_service(
            ServiceSpec::new(SERVICE)
                .with_characteristic(TX, [Capability::Read, Capability::Write])
                .with_characteristic(RX, [Capability::Notify])
                .with_characteristic(STATUS, [Capability::Indicate, Capability::Read]),
        )
    }

    fn handle(uuid: Uuid, capabilities: impl IntoIterator<Item = Capability>) -> CharacteristicHandle {
        CharacteristicHandle::new(SERVICE, uuid, capabilities.into_iter().collect())
    }

    #[test]
    fn capabilities_of_returns_declared_set() {
        let registry = registry();

        let tx = registry.capabilities_of(TX).expect("TX is registered");
        assert!(tx.contains(Capability::Write));
        assert!(!tx.is_notifiable());
        assert_eq!(None, registry.capabilities_of(Uuid::nil()));
    }

    #[test]
    fn duplicate_characteristic_keeps_first_declaration() {
        let mut registry = registry();
        registry.register(ServiceSpec::new(Uuid::nil()).with_characteristic(TX, [Capability::Notify]));

        let tx = registry.get(TX).expect("TX is registered");
        assert_eq!(SERVICE, tx.service());
        assert!(tx.capabilities().contains(Capability::Write));
        assert_eq!(3, registry.characteristics().count());
    }

    #[test]
    fn reconcile_marks_missing_characteristics_unavailable() {
        let mut registry = registry();
        let discovered = [DiscoveredService::new(
            SERVICE,
            vec![
                handle(TX, [Capability::Read, Capability::Write]),
                handle(STATUS, [Capability::Indicate]),
            ],
        )];

        let outcome = registry.reconcile(&discovered);

        assert_eq!(vec![TX, STATUS], outcome.resolved);
        assert_eq!(vec![RX], outcome.unavailable);
        assert_eq!(vec![STATUS], registry.notifiable());
        assert!(registry.get(RX).and_then(RegisteredCharacteristic::handle).is_none());
    }

    #[test]
    fn reconcile_requires_matching_service() {
        let mut registry = registry();
        let discovered = [DiscoveredService::new(
            Uuid::nil(),
            vec![handle(TX, [Capability::Write])],
        )];

        let outcome = registry.reconcile(&discovered);

        assert!(outcome.resolved.is_empty());
    }

    #[test]
    fn clear_link_state_drops_handles_and_chunks() {
        let mut registry = registry();
        registry.reconcile(&[DiscoveredService::new(
            SERVICE,
            vec![handle(TX, [Capability::Write]), handle(RX, [Capability::Notify])],
        )]);
        registry.push_chunks(TX, [vec![1], vec![2]]);
        assert_eq!(Some(&[1][..]), registry.front_chunk(TX));

        registry.clear_link_state();

        assert!(registry.characteristics().all(|c| c.handle().is_none()));
        assert!(registry.characteristics().all(|c| c.pending_chunks() == 0));
        assert!(registry.notifiable().is_empty());
    }

    #[test]
    fn capabilities_render_in_declaration_order() {
        let caps = Capabilities::from_iter([Capability::Notify, Capability::Read]);

        assert_eq!("read|notify", caps.to_string());
        assert_eq!("none", Capabilities::NONE.to_string());
    }
}
