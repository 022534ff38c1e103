use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

use crate::gatt::{Capability, SessionState};
use crate::hw::DeviceAddress;

/// Errors returned by a link-level transport.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("BLE operation failed")]
    Ble(#[from] btleplug::Error),
    #[error("no BLE adapters were found")]
    NoAdapters,
    #[error("peripheral `{address}` has not been seen by the adapter")]
    UnknownPeripheral { address: DeviceAddress },
    #[error("transport is not connected")]
    NotConnected,
    #[error("characteristic {uuid} is not present on the connected peripheral")]
    UnknownCharacteristic { uuid: Uuid },
    #[error("peripheral did not report an RSSI value")]
    RssiUnavailable,
    #[error("link reported status {code}")]
    Status { code: i32 },
    #[error("link event stream was already taken")]
    LinkEventsTaken,
}

impl TransportError {
    /// Returns the link status code when the transport reported one.
    #[must_use]
    pub fn code(&self) -> Option<i32> {
        match self {
            Self::Status { code } => Some(*code),
            _ => None,
        }
    }
}

/// Reason a connect attempt did not reach the ready state.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectFailure {
    #[error("connect attempt timed out after {}", humantime::format_duration(*timeout))]
    Timeout { timeout: Duration },
    #[error("transport refused the connection: {message}")]
    Transport { code: Option<i32>, message: String },
    #[error("link dropped before the session became ready")]
    LinkLost,
    #[error("service discovery failed: {message}")]
    Discovery { message: String },
    #[error("enabling notifications on {characteristic} failed: {message}")]
    NotificationSetup {
        characteristic: Uuid,
        message: String,
    },
    #[error("connect attempt was cancelled")]
    Cancelled,
}

impl ConnectFailure {
    pub(crate) fn transport(error: &TransportError) -> Self {
        Self::Transport {
            code: error.code(),
            message: error.to_string(),
        }
    }
}

/// Errors rejecting an operation before it is queued.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("characteristic {uuid} is not registered")]
    CharacteristicNotFound { uuid: Uuid },
    #[error("characteristic {uuid} is not writable")]
    NotWritable { uuid: Uuid },
    #[error("characteristic {uuid} does not support {capability}")]
    MissingCapability { uuid: Uuid, capability: Capability },
    #[error("characteristic {uuid} was not found on the connected peripheral")]
    CharacteristicUnavailable { uuid: Uuid },
    #[error("session is not ready (state: {state})")]
    NotReady { state: SessionState },
    #[error("session has ended")]
    SessionEnded,
}

/// Errors completing a queued operation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OperationError {
    #[error("operation timed out after {}", humantime::format_duration(*timeout))]
    TimedOut { timeout: Duration },
    #[error("transport failed the operation: {message}")]
    Transport { message: String },
    #[error("link dropped before the operation completed")]
    Disconnected,
    #[error("session ended before the operation completed")]
    SessionEnded,
    #[error("operation completed with an unexpected result kind")]
    UnexpectedCompletion,
}

/// Errors returned by the reliable writer.
#[derive(Debug, Error)]
pub enum ReliableWriteError {
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Operation(#[from] OperationError),
    #[error("chunk {chunk} did not read back after {attempts} write attempts")]
    VerifyExhausted { chunk: usize, attempts: u32 },
    #[error("write was cancelled")]
    Cancelled,
}

/// Errors returned by the scanner.
#[derive(Debug, Error)]
pub enum ScanError {
    #[error("a scan is already running")]
    AlreadyScanning,
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Errors returned by reconnect-by-scan.
#[derive(Debug, Error)]
pub enum ReconnectError {
    #[error(transparent)]
    Scan(#[from] ScanError),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error("scan ended before `{address}` was seen")]
    ScanEnded { address: DeviceAddress },
    #[error("reconnect was cancelled")]
    Cancelled,
}

/// Errors returned when parsing fake backend fixtures.
#[derive(Debug, Error)]
pub enum FixtureError {
    #[error("the fake scan fixture is empty")]
    EmptyFixture,
    #[error("fixture records must contain two or three pipe-delimited fields")]
    InvalidRecordFieldCount,
    #[error("fixture records cannot have an empty address")]
    EmptyAddress,
    #[error("failed to parse RSSI value")]
    InvalidRssi(#[from] std::num::ParseIntError),
    #[error("invalid hexadecimal payload")]
    InvalidHex(#[from] hex::FromHexError),
}

/// Errors returned when validating runtime backend options.
#[derive(Debug, Error)]
pub(crate) enum CliConfigError {
    #[error("missing fake scan fixture while fake mode is enabled")]
    MissingFakeScanFixture,
}

/// Errors returned by telemetry initialisation.
#[derive(Debug, Error)]
pub(crate) enum TelemetryError {
    #[error("failed to install tracing subscriber")]
    Subscriber(#[from] tracing_subscriber::util::TryInitError),
}
