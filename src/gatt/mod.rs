mod capability;
mod framer;
mod operation;
mod reconnect;
mod reliable_writer;
mod session;

pub use self::capability::{
    Capabilities, Capability, CapabilityRegistry, CharacteristicSpec, Reconciliation,
    RegisteredCharacteristic, ServiceSpec,
};
pub use self::framer::{ByteFramer, ChunkedPayload, DEFAULT_CHUNK_SIZE};
pub use self::operation::{Operation, OperationOutput};
pub use self::reconnect::reconnect_by_scan;
pub use self::reliable_writer::{
    DEFAULT_ACK_TIMEOUT, DEFAULT_MAX_VERIFY_READS, DEFAULT_VERIFY_INTERVAL, ReliableWriteConfig,
    ReliableWriter, WriteReceipt, WriteStrategy,
};
pub use self::session::{
    ConnectAttempt, DEFAULT_CONNECT_TIMEOUT, DEFAULT_SETTLE_DELAY, DisconnectReason, GattSession,
    OperationTicket, SessionConfig, SessionEvent, SessionEvents, SessionHandle, SessionSnapshot,
    SessionState,
};
