// ─────────────────────────────────────────────────────────────────────────────
//  ble-dfu :: radio :: btle  —  btleplug-backed adapter
//
//  Uses the first adapter the platform reports. Peripheral ids are platform
//  specific (a CoreBluetooth UUID on macOS, a BlueZ object path on Linux), so
//  they are mapped to stable UUIDs: used as-is when they already are one,
//  otherwise derived by hashing.
// ─────────────────────────────────────────────────────────────────────────────

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, ScanFilter,
};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use futures_util::StreamExt;
use sha2::{Digest, Sha256};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::{AdapterEvent, AdapterMode, AdapterState, RadioAdapter, RadioError};
use crate::device::DeviceHandle;
use crate::identity::{
    DeviceIdentity, IdentityError, IdentityReader, DFU_SERVICE_UUID, DIS_FIRMWARE_REV_UUID,
    DIS_MANUFACTURER_UUID, DIS_MODEL_NUMBER_UUID, DIS_SOFTWARE_REV_UUID,
};

type Known = Arc<Mutex<HashMap<Uuid, Peripheral>>>;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Stable identifier for a platform peripheral id.
pub fn peripheral_uuid(id: &PeripheralId) -> Uuid {
    uuid_for_platform_id(&id.to_string())
}

fn uuid_for_platform_id(text: &str) -> Uuid {
    if let Ok(uuid) = Uuid::parse_str(text) {
        return uuid;
    }
    let hash = Sha256::digest(text.as_bytes());
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&hash[..16]);
    bytes[6] = (bytes[6] & 0x0F) | 0x40;
    bytes[8] = (bytes[8] & 0x3F) | 0x80;
    Uuid::from_bytes(bytes)
}

pub struct BtleAdapter {
    adapter: Adapter,
    events:  broadcast::Sender<AdapterEvent>,
    known:   Known,
    mode:    Mutex<AdapterMode>,
    pump:    JoinHandle<()>,
}

impl BtleAdapter {
    /// Open the first Bluetooth adapter and start forwarding its events.
    pub async fn first() -> Result<Arc<Self>, RadioError> {
        let manager = Manager::new()
            .await
            .map_err(|e| RadioError::ScanError(e.to_string()))?;
        let adapter = manager
            .adapters()
            .await
            .map_err(|e| RadioError::ScanError(e.to_string()))?
            .into_iter()
            .next()
            .ok_or(RadioError::NoAdapter)?;

        let mut stream = adapter
            .events()
            .await
            .map_err(|e| RadioError::ScanError(e.to_string()))?;
        let (events, _) = broadcast::channel(256);
        let known: Known = Arc::new(Mutex::new(HashMap::new()));

        let pump = {
            let adapter = adapter.clone();
            let events = events.clone();
            let known = Arc::clone(&known);
            tokio::spawn(async move {
                while let Some(event) = stream.next().await {
                    match event {
                        CentralEvent::DeviceDiscovered(pid) => {
                            let peripheral = match adapter.peripheral(&pid).await {
                                Ok(p) => p,
                                Err(e) => {
                                    log::debug!("discovered {} but lookup failed: {}", pid, e);
                                    continue;
                                }
                            };
                            let name = peripheral
                                .properties()
                                .await
                                .ok()
                                .flatten()
                                .and_then(|p| p.local_name);
                            let id = peripheral_uuid(&pid);
                            lock(&known).insert(id, peripheral);
                            let _ = events.send(AdapterEvent::Discovered(DeviceHandle::new(id, name)));
                        }
                        CentralEvent::DeviceDisconnected(pid) => {
                            let _ = events.send(AdapterEvent::Disconnected(peripheral_uuid(&pid)));
                        }
                        _ => {}
                    }
                }
                log::debug!("btleplug event stream ended");
            })
        };

        Ok(Arc::new(Self {
            adapter,
            events,
            known,
            mode: Mutex::new(AdapterMode::Normal),
            pump,
        }))
    }

    async fn peripheral(&self, id: Uuid) -> Option<Peripheral> {
        if let Some(p) = lock(&self.known).get(&id).cloned() {
            return Some(p);
        }
        let peripherals = match self.adapter.peripherals().await {
            Ok(p) => p,
            Err(e) => {
                log::warn!("failed to list peripherals: {}", e);
                return None;
            }
        };
        let found = peripherals.into_iter().find(|p| peripheral_uuid(&p.id()) == id)?;
        lock(&self.known).insert(id, found.clone());
        Some(found)
    }
}

impl Drop for BtleAdapter {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

#[async_trait]
impl RadioAdapter for BtleAdapter {
    async fn state(&self) -> AdapterState {
        // btleplug exposes no power/permission state; an opened adapter is usable.
        AdapterState::PoweredOn
    }

    fn subscribe(&self) -> broadcast::Receiver<AdapterEvent> {
        self.events.subscribe()
    }

    async fn start_scan(&self) -> Result<(), RadioError> {
        self.adapter
            .start_scan(ScanFilter::default())
            .await
            .map_err(|e| RadioError::ScanError(e.to_string()))
    }

    async fn stop_scan(&self) -> Result<(), RadioError> {
        self.adapter
            .stop_scan()
            .await
            .map_err(|e| RadioError::ScanError(e.to_string()))
    }

    async fn retrieve(&self, id: Uuid) -> Option<DeviceHandle> {
        let peripheral = self.peripheral(id).await?;
        let name = peripheral.properties().await.ok().flatten().and_then(|p| p.local_name);
        Some(DeviceHandle::new(id, name))
    }

    async fn connect(&self, device: &DeviceHandle) -> Result<(), RadioError> {
        let peripheral = self
            .peripheral(device.id)
            .await
            .ok_or(RadioError::UnknownPeripheral(device.id))?;

        let events = self.events.clone();
        let id = device.id;
        tokio::spawn(async move {
            let event = match peripheral.connect().await {
                Ok(()) => AdapterEvent::Connected(id),
                Err(e) => AdapterEvent::ConnectFailed { id, reason: e.to_string() },
            };
            let _ = events.send(event);
        });
        Ok(())
    }

    async fn disconnect(&self, device: &DeviceHandle) -> Result<(), RadioError> {
        let peripheral = self
            .peripheral(device.id)
            .await
            .ok_or(RadioError::UnknownPeripheral(device.id))?;
        peripheral
            .disconnect()
            .await
            .map_err(|e| RadioError::ConnectionError(e.to_string()))
    }

    fn mode(&self) -> AdapterMode {
        *lock(&self.mode)
    }

    async fn set_mode(&self, mode: AdapterMode) -> Result<(), RadioError> {
        // The transfer owns the link while updating; no scan may run alongside.
        if mode == AdapterMode::Update {
            if let Err(e) = self.adapter.stop_scan().await {
                log::debug!("stop_scan before update: {}", e);
            }
        }
        *lock(&self.mode) = mode;
        Ok(())
    }
}

/// Reads the Device Information Service over btleplug.
pub struct BtleIdentityReader {
    adapter: Arc<BtleAdapter>,
}

impl BtleIdentityReader {
    pub fn new(adapter: Arc<BtleAdapter>) -> Self {
        Self { adapter }
    }
}

async fn read_string(
    peripheral: &Peripheral,
    characteristics: &BTreeSet<Characteristic>,
    uuid: Uuid,
) -> Option<String> {
    let ch = characteristics.iter().find(|c| c.uuid == uuid)?;
    match peripheral.read(ch).await {
        Ok(bytes) => Some(String::from_utf8_lossy(&bytes).into_owned()),
        Err(e) => {
            log::debug!("reading {} failed: {}", uuid, e);
            None
        }
    }
}

#[async_trait]
impl IdentityReader for BtleIdentityReader {
    async fn read_identity(&self, device: &DeviceHandle) -> Result<DeviceIdentity, IdentityError> {
        let peripheral = self
            .adapter
            .peripheral(device.id)
            .await
            .ok_or_else(|| IdentityError::Radio(format!("unknown peripheral {}", device.id)))?;

        peripheral
            .discover_services()
            .await
            .map_err(|e| IdentityError::Radio(e.to_string()))?;

        let characteristics = peripheral.characteristics();
        let identity = DeviceIdentity::from_dis(
            read_string(&peripheral, &characteristics, DIS_MANUFACTURER_UUID).await,
            read_string(&peripheral, &characteristics, DIS_MODEL_NUMBER_UUID).await,
            read_string(&peripheral, &characteristics, DIS_SOFTWARE_REV_UUID).await,
            read_string(&peripheral, &characteristics, DIS_FIRMWARE_REV_UUID).await,
        );

        let has_dfu = peripheral.services().iter().any(|s| s.uuid == DFU_SERVICE_UUID);
        if !has_dfu {
            return Err(IdentityError::ServiceNotFound { partial: identity });
        }
        Ok(identity)
    }
}
