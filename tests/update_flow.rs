// ─────────────────────────────────────────────────────────────────────────────
//  End-to-end update runs against the simulated radio and a scripted
//  transfer. No hardware, no network.
// ─────────────────────────────────────────────────────────────────────────────

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use pretty_assertions::assert_eq;
use uuid::Uuid;

use ble_dfu::radio::simulated::{ConnectBehavior, SimAdapter, SimCommand, SimIdentityReader};
use ble_dfu::select::{ImageRef, Provenance};
use ble_dfu::transfer::scripted::ScriptedSupervisor;
use ble_dfu::transfer::{TransferError, TransferEvent};
use ble_dfu::{
    AdapterMode, Console, DeviceHandle, DeviceIdentity, ManualImage, NoUpdateReason, Orchestrator,
    RadioAdapter, ReleaseCatalog, SelectionPrompt, Target, UpdateFailure, UpdateOutcome,
    UpdatePlan,
};

const BLEFRIEND: u128 = 0xb1e0_f00d;

fn blefriend() -> DeviceHandle {
    DeviceHandle::new(Uuid::from_u128(BLEFRIEND), Some("Adafruit Bluefruit LE".into()))
}

fn identity(software: &str, firmware: &str) -> DeviceIdentity {
    DeviceIdentity::from_dis(
        Some("Adafruit Industries".into()),
        Some("BLEFRIEND32".into()),
        Some(software.into()),
        Some(firmware.into()),
    )
}

fn catalog(json: &str, include_beta: bool) -> UpdatePlan {
    UpdatePlan::Catalog(ReleaseCatalog::from_json(json, include_beta).unwrap())
}

fn manual(firmware: Option<&str>) -> UpdatePlan {
    UpdatePlan::Manual(ManualImage { firmware: firmware.map(Into::into), init: None })
}

struct Rig {
    adapter:    Arc<SimAdapter>,
    reader:     Arc<SimIdentityReader>,
    supervisor: Arc<ScriptedSupervisor>,
}

impl Rig {
    /// One connectable device reporting `identity`.
    fn new(identity: DeviceIdentity, supervisor: ScriptedSupervisor) -> Self {
        let adapter = SimAdapter::new();
        adapter.add_device(blefriend(), ConnectBehavior::Accept);
        let reader = SimIdentityReader::new();
        reader.set(blefriend().id, Ok(identity));
        Self { adapter, reader, supervisor: Arc::new(supervisor) }
    }

    async fn run(&self, target: Target, plan: UpdatePlan) -> (UpdateOutcome, Vec<String>) {
        let (console, out) = Console::capture();
        let outcome = Orchestrator::new(
            self.adapter.clone(),
            self.reader.clone(),
            self.supervisor.clone(),
            console,
        )
        .with_timeouts(Duration::from_secs(10), Duration::from_secs(10))
        .run(target, plan)
        .await;
        (outcome, out.lines())
    }

    fn connected(&self) -> bool {
        self.adapter.commands().iter().any(|c| matches!(c, SimCommand::Connect(_)))
    }
}

fn peripheral_info(software: &str, firmware: &str, bootloader: &str) -> Vec<String> {
    vec![
        "Peripheral info:".to_owned(),
        "\tManufacturer: Adafruit Industries".to_owned(),
        "\tModel:        BLEFRIEND32".to_owned(),
        format!("\tSoftware:     {}", software),
        format!("\tFirmware:     {}", firmware),
        format!("\tBootloader:   {}", bootloader),
    ]
}

// ── Scenario A: newer stable release is applied ─────────────────────────────

#[tokio::test]
async fn auto_update_to_newer_stable_release() {
    let rig = Rig::new(identity("1.0", "S110 8.0.0, 0.2"), ScriptedSupervisor::succeeding());
    let plan = catalog(
        r#"{ "boards": { "BLEFRIEND32": { "releases": [
            { "version": "2.0", "firmware_url": "https://fw.example/2.0.hex" }
        ] } } }"#,
        false,
    );

    assert_eq!(rig.adapter.mode(), AdapterMode::Normal);
    let (outcome, lines) = rig.run(Target::Identifier(blefriend().id), plan).await;

    assert_eq!(outcome, UpdateOutcome::Success);
    let mut expected = vec![
        "Connecting...".to_owned(),
        "Reading services and characteristics...".to_owned(),
    ];
    expected.extend(peripheral_info("1.0", "S110 8.0.0, 0.2", "0.2"));
    expected.extend(
        [
            "Auto-update to version: 2.0",
            "Start Update",
            "\tConnecting to DFU target",
            "...",
            "Update completed successfully",
        ]
        .iter()
        .map(|s| s.to_string()),
    );
    assert_eq!(lines, expected);

    let image = rig.supervisor.last_image().unwrap();
    assert_eq!(image.firmware, ImageRef::Url("https://fw.example/2.0.hex".into()));
    assert_eq!(image.provenance, Provenance::Catalog);

    let id = blefriend().id;
    assert_eq!(
        rig.adapter.commands(),
        vec![
            SimCommand::Connect(id),
            SimCommand::SetMode(AdapterMode::Update),
            SimCommand::Disconnect(id),
            SimCommand::SetMode(AdapterMode::Normal),
        ]
    );
    assert_eq!(rig.adapter.mode(), AdapterMode::Normal);
}

// ── Scenario B: only an older stable release is eligible ────────────────────

#[tokio::test]
async fn beta_only_newer_release_means_no_update() {
    let rig = Rig::new(identity("2.0", "S110 8.0.0, 0.2"), ScriptedSupervisor::succeeding());
    let plan = catalog(
        r#"{ "boards": { "BLEFRIEND32": { "releases": [
            { "version": "1.0", "firmware_url": "https://fw.example/1.0.hex" },
            { "version": "2.0", "firmware_url": "https://fw.example/2.0.hex", "beta": true }
        ] } } }"#,
        false,
    );

    let (outcome, lines) = rig.run(Target::Identifier(blefriend().id), plan).await;

    assert_eq!(
        outcome,
        UpdateOutcome::Failed(UpdateFailure::NoUpdates(NoUpdateReason::UpToDate {
            latest: "1.0".into()
        }))
    );
    assert_eq!(outcome.exit_code(), 0);
    assert_eq!(
        lines[lines.len() - 2..].to_vec(),
        vec!["Latest available version is: 1.0", "No updates available"]
    );
    assert_eq!(rig.supervisor.start_count(), 0);
    assert_eq!(rig.adapter.mode(), AdapterMode::Normal);
}

#[tokio::test]
async fn unknown_board_has_no_updates() {
    let rig = Rig::new(identity("1.0", "S110 8.0.0, 0.2"), ScriptedSupervisor::succeeding());
    let plan = catalog(r#"{ "boards": { "FEATHER52": { "releases": [] } } }"#, true);

    let (outcome, lines) = rig.run(Target::Identifier(blefriend().id), plan).await;

    assert_eq!(outcome, UpdateOutcome::Failed(UpdateFailure::NoUpdates(NoUpdateReason::NoRelease)));
    assert_eq!(lines.last().map(String::as_str), Some("No updates available"));
    assert!(!lines.iter().any(|l| l.starts_with("Latest available version")));
}

// ── Scenario C: manual mode without an image ────────────────────────────────

#[tokio::test]
async fn manual_mode_without_image_fails_before_connecting() {
    let rig = Rig::new(identity("1.0", "S110 8.0.0, 0.2"), ScriptedSupervisor::succeeding());

    let (outcome, lines) = rig.run(Target::Identifier(blefriend().id), manual(None)).await;

    assert_eq!(outcome, UpdateOutcome::Failed(UpdateFailure::NoImageSpecified));
    assert_eq!(lines, vec!["no firmware image specified"]);
    assert!(!rig.connected());
    assert_eq!(rig.reader.read_count(), 0);
    assert_eq!(rig.adapter.mode(), AdapterMode::Normal);
}

// ── Scenario D: identifier not known to the radio ───────────────────────────

#[tokio::test]
async fn unknown_identifier_is_no_peripheral_found() {
    let rig = Rig::new(identity("1.0", "S110 8.0.0, 0.2"), ScriptedSupervisor::succeeding());
    let missing = Uuid::from_u128(0xdead_beef);

    let (outcome, lines) = rig.run(Target::Identifier(missing), manual(Some("app.hex"))).await;

    assert_eq!(outcome, UpdateOutcome::Failed(UpdateFailure::NoPeripheralFound(missing)));
    assert_eq!(outcome.exit_code(), 1);
    assert_eq!(lines, vec![format!("no peripheral found: {}", missing)]);
    assert!(!rig.connected());
}

// ── Identity checks ─────────────────────────────────────────────────────────

#[tokio::test]
async fn legacy_bootloader_never_reaches_transfer() {
    let rig = Rig::new(identity("0.5.0", "S110 7.1.0, 0.0"), ScriptedSupervisor::succeeding());

    let (outcome, lines) = rig.run(Target::Identifier(blefriend().id), manual(Some("app.hex"))).await;

    assert_eq!(outcome, UpdateOutcome::Failed(UpdateFailure::LegacyBootloader));
    assert_eq!(rig.supervisor.start_count(), 0);
    assert!(!lines.iter().any(|l| l == "Start Update"));
    assert_eq!(lines[2..8].to_vec(), peripheral_info("0.5.0", "S110 7.1.0, 0.0", "0.0"));
    assert_eq!(
        lines.last().map(String::as_str),
        Some("The legacy bootloader on this device is not compatible with this application")
    );
    assert!(!rig.adapter.commands().contains(&SimCommand::SetMode(AdapterMode::Update)));
    assert_eq!(rig.adapter.mode(), AdapterMode::Normal);
}

// ── Transfer outcomes ───────────────────────────────────────────────────────

#[tokio::test]
async fn transfer_error_is_forwarded_verbatim() {
    let rig = Rig::new(
        identity("1.0", "S110 8.0.0, 0.2"),
        ScriptedSupervisor::failing("Transfer failed: CRC mismatch on packet 12"),
    );

    let (outcome, lines) = rig.run(Target::Identifier(blefriend().id), manual(Some("app.hex"))).await;

    assert!(matches!(
        &outcome,
        UpdateOutcome::Failed(UpdateFailure::Transfer { message, .. })
            if message == "Transfer failed: CRC mismatch on packet 12"
    ));
    let tail = lines[lines.len() - 2..].to_vec();
    assert_eq!(tail, vec![".", "Transfer failed: CRC mismatch on packet 12"]);
    assert_eq!(rig.adapter.mode(), AdapterMode::Normal);
    assert_eq!(rig.adapter.commands().last(), Some(&SimCommand::SetMode(AdapterMode::Normal)));
}

#[tokio::test]
async fn only_the_first_terminal_callback_counts() {
    let script = vec![
        TransferEvent::Value(0.5),
        TransferEvent::Success,
        TransferEvent::Error { message: "late failure".into(), detail: None },
        TransferEvent::Success,
        TransferEvent::Text("after the end".into()),
    ];
    let rig = Rig::new(identity("1.0", "S110 8.0.0, 0.2"), ScriptedSupervisor::new(script));

    let (outcome, lines) = rig.run(Target::Identifier(blefriend().id), manual(Some("app.hex"))).await;

    assert_eq!(outcome, UpdateOutcome::Success);
    assert_eq!(lines.iter().filter(|l| *l == "Update completed successfully").count(), 1);
    assert!(!lines.iter().any(|l| l.contains("late failure") || l.contains("after the end")));
}

#[tokio::test]
async fn supervisor_that_cannot_start_fails_the_run() {
    let rig = Rig::new(
        identity("1.0", "S110 8.0.0, 0.2"),
        ScriptedSupervisor::refusing(TransferError::NotConfigured),
    );

    let (outcome, _) = rig.run(Target::Identifier(blefriend().id), manual(Some("app.hex"))).await;

    assert!(matches!(
        &outcome,
        UpdateOutcome::Failed(UpdateFailure::Transfer { message, .. })
            if message.starts_with("no transfer tool configured")
    ));
    assert_eq!(rig.adapter.mode(), AdapterMode::Normal);
}

#[tokio::test]
async fn script_without_result_is_a_failure() {
    let rig = Rig::new(
        identity("1.0", "S110 8.0.0, 0.2"),
        ScriptedSupervisor::new(vec![TransferEvent::Text("Uploading".into())]),
    );

    let (outcome, _) = rig.run(Target::Identifier(blefriend().id), manual(Some("app.hex"))).await;

    assert!(matches!(outcome, UpdateOutcome::Failed(UpdateFailure::Transfer { .. })));
    assert_eq!(rig.adapter.mode(), AdapterMode::Normal);
}

// ── Connection ──────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn silent_peripheral_times_out() {
    let adapter = SimAdapter::new();
    adapter.add_device(blefriend(), ConnectBehavior::Ignore);
    let rig = Rig {
        adapter,
        reader: SimIdentityReader::new(),
        supervisor: Arc::new(ScriptedSupervisor::succeeding()),
    };

    let (outcome, lines) = rig.run(Target::Identifier(blefriend().id), manual(Some("app.hex"))).await;

    assert_eq!(outcome, UpdateOutcome::Failed(UpdateFailure::ConnectionTimedOut));
    assert_eq!(lines, vec!["Connecting...", "connection timed out"]);
    assert_eq!(rig.adapter.subscriber_count(), 0);
    assert!(rig.adapter.commands().contains(&SimCommand::Disconnect(blefriend().id)));
    assert_eq!(rig.reader.read_count(), 0);
}

// ── Interactive selection ───────────────────────────────────────────────────

/// Re-announces everything once (duplicates), waits, then answers.
struct ScriptedPrompt {
    adapter: Arc<SimAdapter>,
    echo:    Vec<DeviceHandle>,
    answer:  Option<&'static str>,
}

#[async_trait]
impl SelectionPrompt for ScriptedPrompt {
    async fn read_selection(&mut self) -> Option<String> {
        for device in &self.echo {
            self.adapter.announce(device.clone());
        }
        tokio::time::sleep(Duration::from_secs(2)).await;
        self.answer.map(str::to_owned)
    }
}

fn feather() -> DeviceHandle {
    DeviceHandle::new(Uuid::from_u128(0xfea7), None)
}

#[tokio::test(start_paused = true)]
async fn interactive_pick_by_index() {
    let rig = Rig::new(identity("1.0", "S110 8.0.0, 0.2"), ScriptedSupervisor::succeeding());
    rig.adapter.add_device(feather(), ConnectBehavior::Accept);
    let prompt = ScriptedPrompt {
        adapter: rig.adapter.clone(),
        echo:    vec![feather(), blefriend(), feather()],
        answer:  Some("0\n"),
    };

    let (outcome, lines) = rig.run(Target::Interactive(Box::new(prompt)), manual(Some("app.hex"))).await;

    assert_eq!(outcome, UpdateOutcome::Success);
    assert_eq!(
        lines[..5].to_vec(),
        vec![
            "Scanning... Select a peripheral: ".to_owned(),
            format!("0 -> {} - Adafruit Bluefruit LE", blefriend().id),
            format!("1 -> {} - {{No Name}}", feather().id),
            String::new(),
            "Connecting...".to_owned(),
        ]
    );
    assert!(!rig.adapter.is_scanning());
    assert_eq!(rig.adapter.subscriber_count(), 0);

    let commands = rig.adapter.commands();
    assert_eq!(commands[..3].to_vec(), vec![
        SimCommand::StartScan,
        SimCommand::StopScan,
        SimCommand::Connect(blefriend().id),
    ]);
}

#[tokio::test(start_paused = true)]
async fn out_of_range_selection_aborts() {
    let rig = Rig::new(identity("1.0", "S110 8.0.0, 0.2"), ScriptedSupervisor::succeeding());
    for answer in [Some("1"), Some("-1"), Some("first"), None] {
        let prompt = ScriptedPrompt { adapter: rig.adapter.clone(), echo: vec![], answer };

        let (outcome, lines) = rig.run(Target::Interactive(Box::new(prompt)), manual(Some("app.hex"))).await;

        assert_eq!(outcome, UpdateOutcome::Aborted, "answer {:?}", answer);
        assert_eq!(outcome.exit_code(), 0);
        assert_eq!(lines.len(), 2, "answer {:?}: {:?}", answer, lines);
        assert!(!rig.adapter.is_scanning());
        assert_eq!(rig.adapter.subscriber_count(), 0);
    }
    assert!(!rig.connected());
    assert_eq!(rig.adapter.mode(), AdapterMode::Normal);
}
