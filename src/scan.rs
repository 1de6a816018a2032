// ─────────────────────────────────────────────────────────────────────────────
//  ble-dfu :: scan  —  scoped discovery
//
//  A ScanSession owns the discovery subscription for as long as the scan
//  runs. A background pump drains adapter events into a DiscoverySession
//  and prints each new device once. Stopping (or dropping) the session ends
//  the pump, which releases the subscription, and stops the radio scan.
// ─────────────────────────────────────────────────────────────────────────────

use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

use crate::console::Console;
use crate::device::{DeviceHandle, DiscoverySession, ListingStyle};
use crate::radio::{AdapterEvent, RadioAdapter, RadioError};

/// Source of the operator's device choice during an interactive scan.
#[async_trait]
pub trait SelectionPrompt: Send {
    /// One line of input, or `None` if the operator gave up (EOF, cancel).
    async fn read_selection(&mut self) -> Option<String>;
}

pub struct ScanSession {
    adapter: Arc<dyn RadioAdapter>,
    found:   Arc<Mutex<DiscoverySession>>,
    pump:    Option<JoinHandle<()>>,
}

fn lock(found: &Mutex<DiscoverySession>) -> MutexGuard<'_, DiscoverySession> {
    found.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl ScanSession {
    /// Subscribe, then start scanning. Subscribing first means no discovery
    /// reported right after `start_scan` can be missed.
    pub async fn start(
        adapter: Arc<dyn RadioAdapter>,
        style: ListingStyle,
        console: Console,
    ) -> Result<Self, RadioError> {
        let mut events = adapter.subscribe();
        adapter.start_scan().await?;
        log::debug!("scan started ({:?})", style);

        let found = Arc::new(Mutex::new(DiscoverySession::new()));
        let sink = Arc::clone(&found);
        let pump = tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(AdapterEvent::Discovered(device)) => {
                        let line = lock(&sink)
                            .insert(device.clone())
                            .map(|index| style.format(index, &device));
                        if let Some(line) = line {
                            console.line(line);
                        }
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(n)) => {
                        log::warn!("scan fell behind, {} adapter events dropped", n);
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });

        Ok(Self { adapter, found, pump: Some(pump) })
    }

    /// Resolve operator input against what has been seen so far.
    pub fn pick(&self, input: &str) -> Option<DeviceHandle> {
        lock(&self.found).pick(input).cloned()
    }

    pub fn devices(&self) -> Vec<DeviceHandle> {
        lock(&self.found).devices().to_vec()
    }

    /// End the scan. The subscription is gone once this returns.
    pub async fn stop(mut self) -> DiscoverySession {
        if let Some(pump) = self.pump.take() {
            pump.abort();
            let _ = pump.await;
        }
        if let Err(e) = self.adapter.stop_scan().await {
            log::warn!("failed to stop scanning: {}", e);
        }
        log::debug!("scan stopped");
        std::mem::take(&mut *lock(&self.found))
    }
}

impl Drop for ScanSession {
    fn drop(&mut self) {
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
    }
}
