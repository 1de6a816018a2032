// ─────────────────────────────────────────────────────────────────────────────
//  ble-dfu :: transfer  —  update supervisor boundary
//
//  A supervisor owns the actual image transfer. It reports back through a
//  ProgressSink, which funnels progress text, progress values and the one
//  terminal result into a single channel read by the orchestrator. The
//  work itself runs as a TransferTask, which the orchestrator stops before
//  it releases the link.
// ─────────────────────────────────────────────────────────────────────────────

pub mod scripted;
pub mod tool;

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::device::DeviceHandle;
use crate::select::UpdateImage;

#[derive(Debug, Clone, PartialEq)]
pub enum TransferEvent {
    Text(String),
    /// Fraction complete, clamped to `[0, 1]`.
    Value(f64),
    Success,
    Error { message: String, detail: Option<String> },
}

impl TransferEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TransferEvent::Success | TransferEvent::Error { .. })
    }
}

/// Callback handle given to a supervisor for one transfer attempt.
///
/// Only the first terminal callback is delivered; later ones are logged and
/// dropped, as is any progress reported after the end.
#[derive(Debug, Clone)]
pub struct ProgressSink {
    tx:       mpsc::UnboundedSender<TransferEvent>,
    finished: Arc<AtomicBool>,
}

impl ProgressSink {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<TransferEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx, finished: Arc::new(AtomicBool::new(false)) }, rx)
    }

    pub fn text(&self, message: impl Into<String>) {
        self.progress(TransferEvent::Text(message.into()));
    }

    pub fn value(&self, fraction: f64) {
        let fraction = if fraction.is_nan() { 0.0 } else { fraction.clamp(0.0, 1.0) };
        self.progress(TransferEvent::Value(fraction));
    }

    pub fn success(&self) {
        self.terminal(TransferEvent::Success);
    }

    pub fn error(&self, message: impl Into<String>, detail: Option<String>) {
        self.terminal(TransferEvent::Error { message: message.into(), detail });
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }

    fn progress(&self, event: TransferEvent) {
        if self.is_finished() {
            log::debug!("dropping progress after transfer ended: {:?}", event);
            return;
        }
        // Receiver gone means the orchestrator already stopped listening.
        let _ = self.tx.send(event);
    }

    fn terminal(&self, event: TransferEvent) {
        if self.finished.swap(true, Ordering::SeqCst) {
            log::warn!("ignoring duplicate terminal transfer callback: {:?}", event);
            return;
        }
        let _ = self.tx.send(event);
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransferError {
    #[error("no transfer tool configured\n  Hint: set [transfer] program in config.toml or BLE_DFU_TOOL")]
    NotConfigured,
}

/// Background work of one transfer attempt.
///
/// Dropping the task aborts it; [`TransferTask::stop`] also waits until the
/// work has been torn down, so nothing touches the device afterwards.
#[derive(Debug)]
pub struct TransferTask {
    handle: Option<JoinHandle<()>>,
}

impl TransferTask {
    pub fn spawn<F>(work: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        Self { handle: Some(tokio::spawn(work)) }
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, JoinHandle::is_finished)
    }

    pub async fn stop(mut self) {
        if let Some(handle) = self.handle.take() {
            if !handle.is_finished() {
                log::debug!("stopping transfer task");
            }
            handle.abort();
            let _ = handle.await;
        }
    }
}

impl Drop for TransferTask {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

/// Drives a firmware transfer to a connected device.
///
/// `start` returns once the transfer is under way; everything after that,
/// including exactly one terminal result, is reported through `sink`.
/// Stopping the returned task must end all work against the device.
#[async_trait]
pub trait UpdateSupervisor: Send + Sync {
    async fn start(
        &self,
        device: &DeviceHandle,
        image: &UpdateImage,
        sink: ProgressSink,
    ) -> Result<TransferTask, TransferError>;
}
