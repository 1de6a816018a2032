// ─────────────────────────────────────────────────────────────────────────────
//  ble-dfu :: device  —  discovered peripherals and the per-scan session
// ─────────────────────────────────────────────────────────────────────────────

use std::fmt;

use uuid::Uuid;

/// Placeholder printed for peripherals that advertise no local name.
pub const NO_NAME: &str = "{No Name}";

/// A peripheral seen by the radio. Immutable once discovered.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceHandle {
    pub id:   Uuid,
    pub name: Option<String>,
}

impl DeviceHandle {
    pub fn new(id: Uuid, name: Option<String>) -> Self {
        Self { id, name }
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(NO_NAME)
    }
}

impl fmt::Display for DeviceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.id, self.display_name())
    }
}

/// How newly discovered devices are announced while scanning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListingStyle {
    /// `index -> uuid - name`, used when the operator picks a device by number.
    Indexed,
    /// `uuid: name`, used by the plain `scan` command.
    Plain,
}

impl ListingStyle {
    pub fn format(self, index: usize, device: &DeviceHandle) -> String {
        match self {
            ListingStyle::Indexed => {
                format!("{} -> {} - {}", index, device.id, device.display_name())
            }
            ListingStyle::Plain => device.to_string(),
        }
    }
}

/// Distinct devices seen during one scan, in first-seen order.
///
/// Indices handed out by [`DiscoverySession::insert`] are only meaningful for
/// the session that produced them.
#[derive(Debug, Default, Clone)]
pub struct DiscoverySession {
    devices: Vec<DeviceHandle>,
}

impl DiscoverySession {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a discovery. Returns the new index, or `None` if this
    /// identifier is already part of the session.
    pub fn insert(&mut self, device: DeviceHandle) -> Option<usize> {
        if self.devices.iter().any(|d| d.id == device.id) {
            return None;
        }
        self.devices.push(device);
        Some(self.devices.len() - 1)
    }

    pub fn get(&self, index: usize) -> Option<&DeviceHandle> {
        self.devices.get(index)
    }

    /// Resolve one line of operator input to a device.
    ///
    /// Anything that is not a non-negative integer inside `[0, len)` is no
    /// selection.
    pub fn pick(&self, input: &str) -> Option<&DeviceHandle> {
        let index = input.trim().parse::<usize>().ok()?;
        self.get(index)
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn devices(&self) -> &[DeviceHandle] {
        &self.devices
    }
}
