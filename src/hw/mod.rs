mod btleplug_backend;
mod fake_backend;
mod hardware;
mod model;
mod transport;

pub use self::btleplug_backend::{BtleplugScanner, BtleplugTransport, default_adapter};
pub use self::fake_backend::{
    FakeAdvertiser, FakeConnect, FakeDescriptor, FakeLink, FakeRead, FakeScanTransport,
    FakeTransport, FakeTransportConfig, FakeWrite, HexPayload, NotificationPayloads, ScanCall,
    ScanFixture, TransportCall, discovered_from_specs,
};
pub use self::hardware::HardwareClient;
pub(crate) use self::hardware::{FakeBackendConfig, fake_hardware_client, real_hardware_client};
pub use self::model::{
    Advertisement, CharacteristicHandle, DeviceAddress, DiscoveredService, RemoteDevice, ScanEntry,
};
pub use self::transport::{
    AdvertisementStream, LinkEvent, LinkEventStream, ScanTransport, Transport,
};
