// ─────────────────────────────────────────────────────────────────────────────
//  ble_dfu  —  public library API
//
//  Firmware update orchestration for BLE peripherals: scan, pick a device,
//  connect, read its identity, decide on an image and supervise the
//  transfer to a single terminal outcome.
// ─────────────────────────────────────────────────────────────────────────────

pub mod catalog;
pub mod config;
pub mod console;
pub mod device;
pub mod error;
pub mod identity;
pub mod orchestrator;
pub mod radio;
pub mod scan;
pub mod select;
pub mod transfer;

pub use catalog::{CatalogSource, ReleaseCatalog};
pub use config::Settings;
pub use console::Console;
pub use device::{DeviceHandle, DiscoverySession, ListingStyle};
pub use error::{DfuError, Result};
pub use identity::{DeviceIdentity, IdentityReader};
pub use orchestrator::{
    NoUpdateReason, Orchestrator, Phase, Target, UpdateFailure, UpdateOutcome, UpdatePlan,
};
pub use radio::{check_available, AdapterMode, AdapterState, RadioAdapter};
pub use scan::{ScanSession, SelectionPrompt};
pub use select::{select, ManualImage, UpdateImage};
pub use transfer::{ProgressSink, TransferEvent, TransferTask, UpdateSupervisor};

