// ─────────────────────────────────────────────────────────────────────────────
//  ble-dfu :: radio :: simulated  —  in-process radio
//
//  A scripted stand-in for a BLE central. Peripherals are registered up
//  front with a connect behaviour; scanning announces them on the event
//  channel and connect requests are answered asynchronously, the same way
//  a real adapter reports them. Every command issued against the adapter is
//  recorded so tests can check what the workflow did to the radio.
// ─────────────────────────────────────────────────────────────────────────────

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::broadcast;
use uuid::Uuid;

use super::{AdapterEvent, AdapterMode, AdapterState, RadioAdapter, RadioError};
use crate::device::DeviceHandle;
use crate::identity::{DeviceIdentity, IdentityError, IdentityReader};

/// How a simulated peripheral answers a connect request.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectBehavior {
    Accept,
    Refuse(String),
    /// Never answer. The request stays pending forever.
    Ignore,
}

/// A command the workflow issued against the adapter.
#[derive(Debug, Clone, PartialEq)]
pub enum SimCommand {
    StartScan,
    StopScan,
    Connect(Uuid),
    Disconnect(Uuid),
    SetMode(AdapterMode),
}

#[derive(Debug, Clone)]
struct SimPeripheral {
    handle:      DeviceHandle,
    behavior:    ConnectBehavior,
    /// Whether a lookup by identifier finds it without scanning.
    retrievable: bool,
}

pub struct SimAdapter {
    events:      broadcast::Sender<AdapterEvent>,
    state:       Mutex<AdapterState>,
    mode:        Mutex<AdapterMode>,
    peripherals: Mutex<Vec<SimPeripheral>>,
    scanning:    AtomicBool,
    commands:    Mutex<Vec<SimCommand>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl SimAdapter {
    pub fn new() -> Arc<Self> {
        let (events, _) = broadcast::channel(256);
        Arc::new(Self {
            events,
            state: Mutex::new(AdapterState::PoweredOn),
            mode: Mutex::new(AdapterMode::Normal),
            peripherals: Mutex::new(Vec::new()),
            scanning: AtomicBool::new(false),
            commands: Mutex::new(Vec::new()),
        })
    }

    /// Register a peripheral that is both discoverable and retrievable.
    pub fn add_device(&self, handle: DeviceHandle, behavior: ConnectBehavior) {
        lock(&self.peripherals).push(SimPeripheral { handle, behavior, retrievable: true });
    }

    /// Register a peripheral that only shows up while scanning.
    pub fn add_unlisted_device(&self, handle: DeviceHandle, behavior: ConnectBehavior) {
        lock(&self.peripherals).push(SimPeripheral { handle, behavior, retrievable: false });
    }

    pub fn set_state(&self, state: AdapterState) {
        *lock(&self.state) = state;
    }

    /// Emit an extra advertisement, e.g. a repeat of an already seen device.
    pub fn announce(&self, handle: DeviceHandle) {
        let _ = self.events.send(AdapterEvent::Discovered(handle));
    }

    pub fn is_scanning(&self) -> bool {
        self.scanning.load(Ordering::SeqCst)
    }

    pub fn commands(&self) -> Vec<SimCommand> {
        lock(&self.commands).clone()
    }

    /// Number of live event subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.events.receiver_count()
    }

    fn record(&self, cmd: SimCommand) {
        log::debug!("sim adapter: {:?}", cmd);
        lock(&self.commands).push(cmd);
    }

    fn find(&self, id: Uuid) -> Option<SimPeripheral> {
        lock(&self.peripherals).iter().find(|p| p.handle.id == id).cloned()
    }
}

#[async_trait]
impl RadioAdapter for SimAdapter {
    async fn state(&self) -> AdapterState {
        *lock(&self.state)
    }

    fn subscribe(&self) -> broadcast::Receiver<AdapterEvent> {
        self.events.subscribe()
    }

    async fn start_scan(&self) -> Result<(), RadioError> {
        self.record(SimCommand::StartScan);
        self.scanning.store(true, Ordering::SeqCst);
        let handles: Vec<DeviceHandle> =
            lock(&self.peripherals).iter().map(|p| p.handle.clone()).collect();
        for handle in handles {
            let _ = self.events.send(AdapterEvent::Discovered(handle));
        }
        Ok(())
    }

    async fn stop_scan(&self) -> Result<(), RadioError> {
        self.record(SimCommand::StopScan);
        self.scanning.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn retrieve(&self, id: Uuid) -> Option<DeviceHandle> {
        self.find(id).filter(|p| p.retrievable).map(|p| p.handle)
    }

    async fn connect(&self, device: &DeviceHandle) -> Result<(), RadioError> {
        self.record(SimCommand::Connect(device.id));
        let peripheral = self.find(device.id).ok_or(RadioError::UnknownPeripheral(device.id))?;

        let event = match peripheral.behavior {
            ConnectBehavior::Accept => AdapterEvent::Connected(device.id),
            ConnectBehavior::Refuse(reason) => AdapterEvent::ConnectFailed { id: device.id, reason },
            ConnectBehavior::Ignore => return Ok(()),
        };

        // Answer from another task, like a radio callback would.
        let events = self.events.clone();
        tokio::spawn(async move {
            tokio::task::yield_now().await;
            let _ = events.send(event);
        });
        Ok(())
    }

    async fn disconnect(&self, device: &DeviceHandle) -> Result<(), RadioError> {
        self.record(SimCommand::Disconnect(device.id));
        let _ = self.events.send(AdapterEvent::Disconnected(device.id));
        Ok(())
    }

    fn mode(&self) -> AdapterMode {
        *lock(&self.mode)
    }

    async fn set_mode(&self, mode: AdapterMode) -> Result<(), RadioError> {
        self.record(SimCommand::SetMode(mode));
        *lock(&self.mode) = mode;
        Ok(())
    }
}

#[derive(Debug, Clone)]
enum IdentityAnswer {
    Reply(Result<DeviceIdentity, IdentityError>),
    Stall,
}

/// Identity reader answering from a fixed table.
#[derive(Debug, Default)]
pub struct SimIdentityReader {
    answers: Mutex<HashMap<Uuid, IdentityAnswer>>,
    reads:   AtomicUsize,
}

impl SimIdentityReader {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set(&self, id: Uuid, answer: Result<DeviceIdentity, IdentityError>) {
        lock(&self.answers).insert(id, IdentityAnswer::Reply(answer));
    }

    /// The read for this device never completes.
    pub fn stall(&self, id: Uuid) {
        lock(&self.answers).insert(id, IdentityAnswer::Stall);
    }

    pub fn read_count(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl IdentityReader for SimIdentityReader {
    async fn read_identity(&self, device: &DeviceHandle) -> Result<DeviceIdentity, IdentityError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        let answer = lock(&self.answers).get(&device.id).cloned();
        match answer {
            Some(IdentityAnswer::Reply(result)) => result,
            Some(IdentityAnswer::Stall) => std::future::pending().await,
            None => Err(IdentityError::Radio(format!("no GATT server on {}", device.id))),
        }
    }
}
