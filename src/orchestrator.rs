// ─────────────────────────────────────────────────────────────────────────────
//  ble-dfu :: orchestrator  —  one update run, start to finish
//
//  Idle → Scanning → Connecting → DiscoveringIdentity → SelectingImage
//       → Transferring → Terminated
//
//  Radio notifications arrive on the adapter's broadcast channel; the run
//  itself is a straight line of awaits. The connect and the identity read
//  are bounded by timeouts; those two and the transfer can be cancelled.
//  A cancelled transfer is stopped before anything else happens. Every exit
//  path goes through `finish`, which prints the single outcome line, drops
//  the link and puts the adapter back in the mode it was in before the run.
// ─────────────────────────────────────────────────────────────────────────────

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::watch;
use uuid::Uuid;

use crate::catalog::ReleaseCatalog;
use crate::console::Console;
use crate::device::{DeviceHandle, ListingStyle};
use crate::identity::{identity_block, DeviceIdentity, IdentityError, IdentityReader};
use crate::radio::{AdapterEvent, AdapterMode, RadioAdapter, RadioError};
use crate::scan::{ScanSession, SelectionPrompt};
use crate::select::{self, ManualImage, Provenance, UpdateImage};
use crate::transfer::{ProgressSink, TransferEvent, UpdateSupervisor};

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_IDENTITY_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Scanning,
    Connecting,
    DiscoveringIdentity,
    SelectingImage,
    Transferring,
    Terminated,
}

/// Which device the run updates.
pub enum Target {
    /// A peripheral the system already knows, looked up without scanning.
    Identifier(Uuid),
    /// Scan and let the operator pick by index.
    Interactive(Box<dyn SelectionPrompt>),
}

/// Where the image comes from.
#[derive(Debug, Clone)]
pub enum UpdatePlan {
    Catalog(ReleaseCatalog),
    Manual(ManualImage),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NoUpdateReason {
    /// The catalog has nothing eligible for this device.
    NoRelease,
    /// The newest eligible release is not newer than what the device runs.
    UpToDate { latest: String },
}

/// Why a run ended without updating the device. `Display` is the line
/// shown to the operator.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum UpdateFailure {
    #[error("no peripheral found: {0}")]
    NoPeripheralFound(Uuid),

    #[error("connection timed out")]
    ConnectionTimedOut,

    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("DFU service not found")]
    ServiceNotFound,

    #[error("timed out reading device information")]
    IdentityTimedOut,

    #[error("{0}")]
    IdentityRead(String),

    #[error("The legacy bootloader on this device is not compatible with this application")]
    LegacyBootloader,

    #[error("No updates available")]
    NoUpdates(NoUpdateReason),

    #[error("no firmware image specified")]
    NoImageSpecified,

    #[error("{message}")]
    Transfer { message: String, detail: Option<String> },

    #[error("update cancelled")]
    Cancelled,

    #[error("{0}")]
    Radio(String),
}

impl UpdateFailure {
    /// "Nothing to do" outcomes are reported but do not fail the command.
    pub fn is_error(&self) -> bool {
        !matches!(self, UpdateFailure::NoUpdates(_))
    }
}

impl From<RadioError> for UpdateFailure {
    fn from(e: RadioError) -> Self {
        UpdateFailure::Radio(e.to_string())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum UpdateOutcome {
    Success,
    Failed(UpdateFailure),
    /// The operator chose no device. Not an error.
    Aborted,
}

impl UpdateOutcome {
    pub fn exit_code(&self) -> i32 {
        match self {
            UpdateOutcome::Failed(f) if f.is_error() => 1,
            _ => 0,
        }
    }
}

type Step<T> = std::result::Result<T, UpdateFailure>;

/// Drives a single update run against an injected adapter, identity reader
/// and transfer supervisor. `run` consumes the orchestrator, so one instance
/// can never have two attempts in flight.
pub struct Orchestrator {
    adapter:          Arc<dyn RadioAdapter>,
    identity:         Arc<dyn IdentityReader>,
    supervisor:       Arc<dyn UpdateSupervisor>,
    console:          Console,
    connect_timeout:  Duration,
    identity_timeout: Duration,
    cancel:           Option<watch::Receiver<bool>>,
    phase:            Phase,
    link:             Option<DeviceHandle>,
}

impl Orchestrator {
    pub fn new(
        adapter: Arc<dyn RadioAdapter>,
        identity: Arc<dyn IdentityReader>,
        supervisor: Arc<dyn UpdateSupervisor>,
        console: Console,
    ) -> Self {
        Self {
            adapter,
            identity,
            supervisor,
            console,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            identity_timeout: DEFAULT_IDENTITY_TIMEOUT,
            cancel: None,
            phase: Phase::Idle,
            link: None,
        }
    }

    pub fn with_timeouts(mut self, connect: Duration, identity: Duration) -> Self {
        self.connect_timeout = connect;
        self.identity_timeout = identity;
        self
    }

    /// Abort the run once `cancel` turns true.
    pub fn with_cancel(mut self, cancel: watch::Receiver<bool>) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub async fn run(mut self, target: Target, plan: UpdatePlan) -> UpdateOutcome {
        let prior_mode = self.adapter.mode();
        let outcome = self
            .drive(target, &plan)
            .await
            .unwrap_or_else(UpdateOutcome::Failed);
        self.finish(outcome, prior_mode).await
    }

    async fn drive(&mut self, target: Target, plan: &UpdatePlan) -> Step<UpdateOutcome> {
        // Manual mode without an image can never succeed; fail before touching the radio.
        if let UpdatePlan::Manual(manual) = plan {
            if manual.firmware.is_none() {
                return Err(UpdateFailure::NoImageSpecified);
            }
        }

        self.enter(Phase::Scanning);
        let device = match self.resolve(target).await? {
            Some(device) => device,
            None => return Ok(UpdateOutcome::Aborted),
        };

        self.enter(Phase::Connecting);
        self.connect(&device).await?;

        self.enter(Phase::DiscoveringIdentity);
        let identity = self.read_identity(&device).await?;

        self.enter(Phase::SelectingImage);
        let image = choose_image(&identity, plan)?;
        if image.provenance == Provenance::Catalog {
            if let Some(version) = &image.version {
                self.console.line(format_args!("Auto-update to version: {}", version));
            }
        }

        self.enter(Phase::Transferring);
        self.transfer(&device, &image).await?;
        Ok(UpdateOutcome::Success)
    }

    async fn resolve(&mut self, target: Target) -> Step<Option<DeviceHandle>> {
        match target {
            Target::Identifier(id) => self
                .adapter
                .retrieve(id)
                .await
                .map(Some)
                .ok_or(UpdateFailure::NoPeripheralFound(id)),

            Target::Interactive(mut prompt) => {
                self.console.line("Scanning... Select a peripheral: ");
                let scan = ScanSession::start(
                    Arc::clone(&self.adapter),
                    ListingStyle::Indexed,
                    self.console.clone(),
                )
                .await?;

                let input = self.until_cancelled(prompt.read_selection()).await.ok().flatten();
                let choice = input.as_deref().and_then(|line| scan.pick(line));
                scan.stop().await;

                match choice {
                    Some(device) => {
                        self.console.line("");
                        Ok(Some(device))
                    }
                    None => {
                        log::debug!("no peripheral selected (input {:?})", input);
                        Ok(None)
                    }
                }
            }
        }
    }

    async fn connect(&mut self, device: &DeviceHandle) -> Step<()> {
        self.console.line("Connecting...");

        // Subscribe before asking, so the answer cannot slip past us.
        let mut events = self.adapter.subscribe();
        if let Err(e) = self.adapter.connect(device).await {
            return Err(match e {
                RadioError::UnknownPeripheral(id) => UpdateFailure::NoPeripheralFound(id),
                other => UpdateFailure::ConnectionFailed(other.to_string()),
            });
        }
        self.link = Some(device.clone());

        let id = device.id;
        let established = async move {
            loop {
                match events.recv().await {
                    Ok(AdapterEvent::Connected(peer)) if peer == id => return Ok(()),
                    Ok(AdapterEvent::ConnectFailed { id: peer, reason }) if peer == id => {
                        return Err(UpdateFailure::ConnectionFailed(reason));
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(n)) => {
                        log::warn!("connect wait fell behind, {} adapter events dropped", n);
                    }
                    Err(RecvError::Closed) => {
                        return Err(UpdateFailure::Radio(RadioError::Closed.to_string()));
                    }
                }
            }
        };

        // `events` moved into the future above; it is dropped, and the
        // subscription with it, as soon as the wait resolves either way.
        match tokio::time::timeout(self.connect_timeout, self.until_cancelled(established)).await {
            Ok(result) => result?,
            Err(_) => Err(UpdateFailure::ConnectionTimedOut),
        }
    }

    async fn read_identity(&mut self, device: &DeviceHandle) -> Step<DeviceIdentity> {
        self.console.line("Reading services and characteristics...");

        let read = self.identity.read_identity(device);
        let result = match tokio::time::timeout(self.identity_timeout, self.until_cancelled(read)).await {
            Ok(result) => result?,
            Err(_) => return Err(UpdateFailure::IdentityTimedOut),
        };

        match result {
            Ok(identity) => {
                self.print_identity(&identity);
                if identity.legacy_bootloader {
                    return Err(UpdateFailure::LegacyBootloader);
                }
                Ok(identity)
            }
            Err(IdentityError::ServiceNotFound { partial }) => {
                self.print_identity(&partial);
                Err(UpdateFailure::ServiceNotFound)
            }
            Err(IdentityError::Radio(message)) => Err(UpdateFailure::IdentityRead(message)),
        }
    }

    async fn transfer(&mut self, device: &DeviceHandle, image: &UpdateImage) -> Step<()> {
        self.console.line("Start Update");
        log::debug!("transferring {} to {}", image.firmware, device);

        self.adapter.set_mode(AdapterMode::Update).await?;

        let (sink, mut events) = ProgressSink::channel();
        let task = self
            .supervisor
            .start(device, image, sink)
            .await
            .map_err(|e| UpdateFailure::Transfer { message: e.to_string(), detail: None })?;

        let console = self.console.clone();
        let relay = async move {
            while let Some(event) = events.recv().await {
                match event {
                    TransferEvent::Text(message) => console.line(format_args!("\t{}", message)),
                    TransferEvent::Value(_) => console.tick(),
                    TransferEvent::Success => {
                        console.line("Update completed successfully");
                        return Ok(());
                    }
                    TransferEvent::Error { message, detail } => {
                        return Err(UpdateFailure::Transfer { message, detail });
                    }
                }
            }
            Err(UpdateFailure::Transfer {
                message: "Transfer ended without reporting a result".to_owned(),
                detail:  None,
            })
        };

        let result = self.until_cancelled(relay).await;
        // Nothing may write to the device once the link and mode are released.
        task.stop().await;
        result?
    }

    /// Run `fut` unless the cancel flag is raised first.
    async fn until_cancelled<T>(&self, fut: impl Future<Output = T>) -> Step<T> {
        let mut cancel = match self.cancel.clone() {
            Some(cancel) => cancel,
            None => return Ok(fut.await),
        };
        tokio::select! {
            value = fut => Ok(value),
            _ = raised(&mut cancel) => Err(UpdateFailure::Cancelled),
        }
    }

    fn print_identity(&self, identity: &DeviceIdentity) {
        for line in identity_block(identity) {
            self.console.line(line);
        }
    }

    fn enter(&mut self, phase: Phase) {
        log::debug!("phase {:?} -> {:?}", self.phase, phase);
        self.phase = phase;
    }

    async fn finish(mut self, outcome: UpdateOutcome, prior_mode: AdapterMode) -> UpdateOutcome {
        if let UpdateOutcome::Failed(failure) = &outcome {
            if let UpdateFailure::NoUpdates(NoUpdateReason::UpToDate { latest }) = failure {
                self.console.line(format_args!("Latest available version is: {}", latest));
            }
            if let UpdateFailure::Transfer { detail: Some(detail), .. } = failure {
                log::debug!("transfer error detail: {}", detail);
            }
            self.console.line(failure);
        }

        if let Some(device) = self.link.take() {
            if let Err(e) = self.adapter.disconnect(&device).await {
                log::warn!("failed to disconnect {}: {}", device, e);
            }
        }
        if let Err(e) = self.adapter.set_mode(prior_mode).await {
            log::warn!("failed to restore adapter mode {:?}: {}", prior_mode, e);
        }

        self.enter(Phase::Terminated);
        log::debug!("run finished: {:?}", outcome);
        outcome
    }
}

fn choose_image(identity: &DeviceIdentity, plan: &UpdatePlan) -> Step<UpdateImage> {
    match plan {
        UpdatePlan::Catalog(catalog) => select::select(identity, None, Some(catalog)),
        UpdatePlan::Manual(manual) => select::select(identity, Some(manual), None),
    }
}

/// Resolves once the flag is true. A dropped sender never cancels.
async fn raised(cancel: &mut watch::Receiver<bool>) {
    loop {
        if *cancel.borrow_and_update() {
            return;
        }
        if cancel.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
