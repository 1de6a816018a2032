// ─────────────────────────────────────────────────────────────────────────────
//  ble-dfu :: identity  —  what the connected peripheral says it is
//
//  Fields come from the standard Device Information Service. The bootloader
//  version is not a characteristic of its own: DFU-capable firmware reports
//  it as the second part of the firmware revision, e.g.
//
//      "S110 8.0.0, 0.2"   → softdevice "S110 8.0.0", bootloader "0.2"
//
//  A bootloader of "0.0" (or no firmware revision at all) identifies the
//  legacy bootloader, which this updater cannot talk to.
// ─────────────────────────────────────────────────────────────────────────────

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

use crate::device::DeviceHandle;

/// Marker printed for identity fields the device did not report.
pub const UNKNOWN: &str = "{unknown}";

/// Bootloader version reported by legacy bootloaders.
pub const LEGACY_BOOTLOADER_VERSION: &str = "0.0";

/// Legacy Nordic DFU service.
pub const DFU_SERVICE_UUID: Uuid = Uuid::from_u128(0x00001530_1212_efde_1523_785feabcd123);

// Device Information Service characteristics (16-bit SIG UUIDs).
pub const DIS_MANUFACTURER_UUID: Uuid = Uuid::from_u128(0x00002a29_0000_1000_8000_00805f9b34fb);
pub const DIS_MODEL_NUMBER_UUID: Uuid = Uuid::from_u128(0x00002a24_0000_1000_8000_00805f9b34fb);
pub const DIS_FIRMWARE_REV_UUID: Uuid = Uuid::from_u128(0x00002a26_0000_1000_8000_00805f9b34fb);
pub const DIS_SOFTWARE_REV_UUID: Uuid = Uuid::from_u128(0x00002a28_0000_1000_8000_00805f9b34fb);

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceIdentity {
    pub manufacturer:      Option<String>,
    pub model:             Option<String>,
    pub software_revision: Option<String>,
    pub firmware_revision: Option<String>,
    pub bootloader:        Option<String>,
    pub legacy_bootloader: bool,
}

impl DeviceIdentity {
    /// Build an identity from raw Device Information Service strings,
    /// deriving the bootloader version and the legacy flag.
    pub fn from_dis(
        manufacturer: Option<String>,
        model: Option<String>,
        software_revision: Option<String>,
        firmware_revision: Option<String>,
    ) -> Self {
        let bootloader = bootloader_from_firmware_revision(firmware_revision.as_deref());
        let legacy_bootloader = bootloader == LEGACY_BOOTLOADER_VERSION;
        Self {
            manufacturer: clean(manufacturer),
            model: clean(model),
            software_revision: clean(software_revision),
            firmware_revision: clean(firmware_revision),
            bootloader: Some(bootloader),
            legacy_bootloader,
        }
    }

    /// Version compared against the release catalog.
    pub fn current_version(&self) -> Option<&str> {
        self.software_revision
            .as_deref()
            .or(self.firmware_revision.as_deref())
    }
}

fn clean(field: Option<String>) -> Option<String> {
    field
        .map(|s| s.trim_matches(|c: char| c == '\0' || c.is_whitespace()).to_owned())
        .filter(|s| !s.is_empty())
}

fn bootloader_from_firmware_revision(firmware_revision: Option<&str>) -> String {
    firmware_revision
        .and_then(|rev| rev.split(", ").nth(1))
        .map(|b| b.trim_matches(|c: char| c == '\0' || c.is_whitespace()))
        .filter(|b| !b.is_empty())
        .unwrap_or(LEGACY_BOOTLOADER_VERSION)
        .to_owned()
}

/// The `Peripheral info:` block printed after the identity read.
pub fn identity_block(identity: &DeviceIdentity) -> Vec<String> {
    let field = |v: &Option<String>| v.clone().unwrap_or_else(|| UNKNOWN.to_owned());
    vec![
        "Peripheral info:".to_owned(),
        format!("\tManufacturer: {}", field(&identity.manufacturer)),
        format!("\tModel:        {}", field(&identity.model)),
        format!("\tSoftware:     {}", field(&identity.software_revision)),
        format!("\tFirmware:     {}", field(&identity.firmware_revision)),
        format!("\tBootloader:   {}", field(&identity.bootloader)),
    ]
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum IdentityError {
    /// The DFU service is missing. Carries whatever identity fields could
    /// still be read.
    #[error("DFU service not found")]
    ServiceNotFound { partial: DeviceIdentity },

    #[error("Failed to read device information: {0}")]
    Radio(String),
}

/// Reads identity fields from a connected peripheral.
#[async_trait]
pub trait IdentityReader: Send + Sync {
    async fn read_identity(&self, device: &DeviceHandle) -> Result<DeviceIdentity, IdentityError>;
}
