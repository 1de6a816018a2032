// ─────────────────────────────────────────────────────────────────────────────
//  ble-dfu :: transfer :: scripted  —  replayed transfer events
//
//  Stands in for a real transfer in tests of the orchestration flow.
// ─────────────────────────────────────────────────────────────────────────────

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use super::{ProgressSink, TransferError, TransferEvent, TransferTask, UpdateSupervisor};
use crate::device::DeviceHandle;
use crate::select::UpdateImage;

#[derive(Debug, Default)]
pub struct ScriptedSupervisor {
    script:     Vec<TransferEvent>,
    step:       Duration,
    start_err:  Option<TransferError>,
    starts:     AtomicUsize,
    delivered:  Arc<AtomicUsize>,
    last_image: Arc<Mutex<Option<UpdateImage>>>,
}

impl ScriptedSupervisor {
    pub fn new(script: Vec<TransferEvent>) -> Self {
        Self { script, ..Default::default() }
    }

    /// A transfer that reports a few progress steps and then succeeds.
    pub fn succeeding() -> Self {
        Self::new(vec![
            TransferEvent::Text("Connecting to DFU target".into()),
            TransferEvent::Value(0.25),
            TransferEvent::Value(0.5),
            TransferEvent::Value(1.0),
            TransferEvent::Success,
        ])
    }

    pub fn failing(message: &str) -> Self {
        Self::new(vec![
            TransferEvent::Value(0.1),
            TransferEvent::Error { message: message.to_owned(), detail: None },
        ])
    }

    /// `start` itself fails; no events are ever sent.
    pub fn refusing(err: TransferError) -> Self {
        Self { start_err: Some(err), ..Default::default() }
    }

    /// Wait this long before each scripted event.
    pub fn with_step(mut self, step: Duration) -> Self {
        self.step = step;
        self
    }

    /// Events handed to the sink so far, across all starts.
    pub fn delivered(&self) -> usize {
        self.delivered.load(Ordering::SeqCst)
    }

    pub fn start_count(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn last_image(&self) -> Option<UpdateImage> {
        self.last_image.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }
}

#[async_trait]
impl UpdateSupervisor for ScriptedSupervisor {
    async fn start(
        &self,
        _device: &DeviceHandle,
        image: &UpdateImage,
        sink: ProgressSink,
    ) -> Result<TransferTask, TransferError> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        *self.last_image.lock().unwrap_or_else(|p| p.into_inner()) = Some(image.clone());

        if let Some(err) = &self.start_err {
            return Err(err.clone());
        }

        let script = self.script.clone();
        let step = self.step;
        let delivered = Arc::clone(&self.delivered);
        Ok(TransferTask::spawn(async move {
            for event in script {
                if step.is_zero() {
                    tokio::task::yield_now().await;
                } else {
                    tokio::time::sleep(step).await;
                }
                delivered.fetch_add(1, Ordering::SeqCst);
                match event {
                    TransferEvent::Text(t)  => sink.text(t),
                    TransferEvent::Value(v) => sink.value(v),
                    TransferEvent::Success  => sink.success(),
                    TransferEvent::Error { message, detail } => sink.error(message, detail),
                }
            }
        }))
    }
}
