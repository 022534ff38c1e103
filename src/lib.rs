mod app;
mod cli;
mod error;
mod gatt;
mod hw;
mod scanner;
mod telemetry;
mod terminal;
mod utils;

pub use app::{fake_hardware_client, real_hardware_client, run, run_with_clients};
pub use cli::{Args, Command, FakeArgs, ListenArgs, LogLevel, OutputFormat, ScanArgs, WriteArgs};
pub use error::{
    ConnectFailure, FixtureError, OperationError, ReconnectError, ReliableWriteError, ScanError,
    SessionError, TransportError,
};
pub use gatt::{
    ByteFramer, Capabilities, Capability, CapabilityRegistry, CharacteristicSpec, ChunkedPayload,
    ConnectAttempt, DEFAULT_ACK_TIMEOUT, DEFAULT_CHUNK_SIZE, DEFAULT_CONNECT_TIMEOUT,
    DEFAULT_MAX_VERIFY_READS, DEFAULT_SETTLE_DELAY, DEFAULT_VERIFY_INTERVAL, DisconnectReason,
    GattSession, Operation, OperationOutput, OperationTicket, Reconciliation,
    RegisteredCharacteristic, ReliableWriteConfig, ReliableWriter, ServiceSpec, SessionConfig,
    SessionEvent, SessionEvents, SessionHandle, SessionSnapshot, SessionState, WriteReceipt,
    WriteStrategy, reconnect_by_scan,
};
pub use hw::{
    Advertisement, AdvertisementStream, BtleplugScanner, BtleplugTransport, CharacteristicHandle,
    DeviceAddress, DiscoveredService, FakeAdvertiser, FakeConnect, FakeDescriptor, FakeLink,
    FakeRead, FakeScanTransport, FakeTransport, FakeTransportConfig, FakeWrite, HardwareClient,
    HexPayload, LinkEvent, LinkEventStream, NotificationPayloads, RemoteDevice, ScanCall,
    ScanEntry, ScanFixture, ScanTransport, Transport, TransportCall, default_adapter,
    discovered_from_specs,
};
pub use scanner::{
    DEFAULT_SCAN_SLEEP, DEFAULT_SCAN_WINDOW, ScanFilter, ScanMode, ScanOptions, ScanResults,
    Scanner, ScannerState,
};
pub use terminal::TerminalClient;
