// ─────────────────────────────────────────────────────────────────────────────
//  ble-dfu :: radio  —  adapter boundary
//
//  The adapter is process-wide shared state. It is created once by the
//  binary, wrapped in an `Arc`, and handed to whoever needs it; there is no
//  global instance. Discovery and connection notifications are delivered on
//  a broadcast channel so each phase can hold its own scoped subscription.
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(feature = "ble-central")]
pub mod btle;
pub mod simulated;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::device::DeviceHandle;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RadioError {
    #[error("No Bluetooth adapter found")]
    NoAdapter,

    #[error("Scan error: {0}")]
    ScanError(String),

    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("GATT error: {0}")]
    GattError(String),

    #[error("Unknown peripheral {0}")]
    UnknownPeripheral(Uuid),

    #[error("Radio event channel closed")]
    Closed,
}

/// Notifications emitted by the adapter.
#[derive(Debug, Clone, PartialEq)]
pub enum AdapterEvent {
    Discovered(DeviceHandle),
    Connected(Uuid),
    Disconnected(Uuid),
    ConnectFailed { id: Uuid, reason: String },
}

/// Power / permission state reported by the host radio.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterState {
    Unknown,
    Resetting,
    Unsupported,
    Unauthorized,
    PoweredOff,
    PoweredOn,
}

/// Operating mode of the central. `Update` is entered for the duration of a
/// transfer and must always be left again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterMode {
    Normal,
    Update,
}

/// The adapter cannot be used at all.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterUnavailable {
    #[error("This computer doesn't support Bluetooth Low Energy")]
    Unsupported,

    #[error("The application is not authorized to use the Bluetooth Low Energy")]
    Unauthorized,

    #[error("Bluetooth is currently powered off")]
    PoweredOff,
}

/// Precondition checked before any command touches the radio.
///
/// Only the three definitive states abort; unknown or transitional states
/// pass silently.
pub fn check_available(state: AdapterState) -> Result<(), AdapterUnavailable> {
    match state {
        AdapterState::Unsupported  => Err(AdapterUnavailable::Unsupported),
        AdapterState::Unauthorized => Err(AdapterUnavailable::Unauthorized),
        AdapterState::PoweredOff   => Err(AdapterUnavailable::PoweredOff),
        AdapterState::Unknown | AdapterState::Resetting | AdapterState::PoweredOn => Ok(()),
    }
}

/// BLE central operations needed by the update workflow.
///
/// `connect` only issues the request; completion is reported as
/// [`AdapterEvent::Connected`] or [`AdapterEvent::ConnectFailed`].
#[async_trait]
pub trait RadioAdapter: Send + Sync {
    async fn state(&self) -> AdapterState;

    /// Subscribe to adapter notifications. Dropping the receiver unsubscribes.
    fn subscribe(&self) -> broadcast::Receiver<AdapterEvent>;

    async fn start_scan(&self) -> Result<(), RadioError>;

    async fn stop_scan(&self) -> Result<(), RadioError>;

    /// Look up a peripheral the system already knows by identifier.
    async fn retrieve(&self, id: Uuid) -> Option<DeviceHandle>;

    async fn connect(&self, device: &DeviceHandle) -> Result<(), RadioError>;

    async fn disconnect(&self, device: &DeviceHandle) -> Result<(), RadioError>;

    fn mode(&self) -> AdapterMode;

    async fn set_mode(&self, mode: AdapterMode) -> Result<(), RadioError>;
}
