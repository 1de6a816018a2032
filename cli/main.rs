// ─────────────────────────────────────────────────────────────────────────────
//  ble-dfu  —  Bluetooth LE firmware updater
//
//  USAGE
//  ─────
//    ble-dfu scan
//    ble-dfu update [--enable-beta] [--uuid <uuid>] [--refresh]
//    ble-dfu dfu    --hex <file> [--init <file>] [--uuid <uuid>]
//    ble-dfu --help | -?
//    ble-dfu --version | -v
//
//  Without --uuid the device is picked interactively from a live scan.
// ─────────────────────────────────────────────────────────────────────────────

mod prompt;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{ArgAction, Args, Parser, Subcommand};
use colored::Colorize;
use tokio::sync::watch;
use uuid::Uuid;

use ble_dfu::catalog::{self, CatalogSource};
use ble_dfu::config::{self, Settings};
use ble_dfu::transfer::tool::ToolSupervisor;
use ble_dfu::{
    Console, DfuError, IdentityReader, ListingStyle, ManualImage, Orchestrator,
    RadioAdapter, ScanSession, Target, UpdatePlan,
};

use prompt::StdinPrompt;

// ─────────────────────────────────────────────────────────────────────────────
//  CLI definition (clap derive)
//
//  clap's own help/version flags are off: -h means --hex for `dfu`, -v is
//  --version and the help screen keeps its established layout.
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(
    name = "ble-dfu",
    disable_help_flag = true,
    disable_version_flag = true,
    disable_help_subcommand = true
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Cmd>,

    /// Show this screen
    #[arg(short = '?', long = "help", global = true, action = ArgAction::SetTrue)]
    help: bool,

    /// Show version
    #[arg(short = 'v', long = "version", action = ArgAction::SetTrue)]
    version: bool,

    /// Diagnostic logging
    #[arg(long, global = true)]
    verbose: bool,

    /// Disable colored output
    #[arg(long, global = true)]
    no_color: bool,

    /// Settings file
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Release catalog location (overrides settings)
    #[arg(long, global = true, value_name = "URL")]
    catalog_url: Option<String>,

    /// Seconds to wait for a connection (overrides settings)
    #[arg(long, global = true, value_name = "SECS")]
    connect_timeout: Option<u64>,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Scan peripherals
    #[command(disable_help_flag = true)]
    Scan,
    /// Automatic update
    #[command(disable_help_flag = true)]
    Update(UpdateArgs),
    /// Custom firmware
    #[command(disable_help_flag = true)]
    Dfu(DfuArgs),
}

#[derive(Args, Debug)]
struct UpdateArgs {
    /// If not present only stable versions are used
    #[arg(short = 'b', long)]
    enable_beta: bool,

    /// If present the peripheral with that uuid is used
    #[arg(short = 'u', long)]
    uuid: Option<Uuid>,

    /// Re-download the release catalog even if the cached copy is fresh
    #[arg(long)]
    refresh: bool,
}

#[derive(Args, Debug)]
struct DfuArgs {
    /// Firmware image
    #[arg(short = 'h', long, value_name = "FILENAME")]
    hex: Option<PathBuf>,

    /// Init packet
    #[arg(short = 'i', long, value_name = "FILENAME")]
    init: Option<PathBuf>,

    /// If present the peripheral with that uuid is used
    #[arg(short = 'u', long)]
    uuid: Option<Uuid>,
}

// ─────────────────────────────────────────────────────────────────────────────
//  Entry point
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if cli.no_color {
        colored::control::set_override(false);
    }
    init_logging(cli.verbose);

    if cli.version {
        print_version();
        return;
    }
    let command = match cli.command {
        Some(ref command) if !cli.help => command,
        _ => {
            print_help();
            return;
        }
    };

    let code = match run(command, &cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{} {:#}", "✗".red().bold(), e);
            1
        }
    };
    std::process::exit(code);
}

fn init_logging(verbose: bool) {
    let mut builder = env_logger::Builder::new();
    builder.filter_level(log::LevelFilter::Warn);
    if verbose {
        builder.filter_module("ble_dfu", log::LevelFilter::Debug);
    }
    builder.parse_default_env();
    builder.format_timestamp(None);
    builder.init();
}

async fn run(command: &Cmd, cli: &Cli) -> anyhow::Result<i32> {
    let mut settings = Settings::load(cli.config.as_deref())?;
    if let Some(url) = &cli.catalog_url {
        settings.catalog_url = Some(url.clone());
    }
    if let Some(secs) = cli.connect_timeout {
        settings.connect_timeout_secs = secs;
    }

    match command {
        Cmd::Scan => cmd_scan().await,
        Cmd::Update(args) => cmd_update(args, &settings).await,
        Cmd::Dfu(args) => cmd_dfu(args, &settings).await,
    }
}

// ─────────────────────────────────────────────────────────────────────────────
//  Command handlers
// ─────────────────────────────────────────────────────────────────────────────

async fn cmd_scan() -> anyhow::Result<i32> {
    let (adapter, _) = open_radio().await?;
    let scan = ScanSession::start(adapter, ListingStyle::Plain, Console::stdout()).await?;

    if let Err(e) = tokio::signal::ctrl_c().await {
        log::warn!("failed to install Ctrl+C handler: {}", e);
    }
    scan.stop().await;
    Ok(0)
}

async fn cmd_update(args: &UpdateArgs, settings: &Settings) -> anyhow::Result<i32> {
    let (adapter, identity) = open_radio().await?;

    let source = CatalogSource {
        url:        settings.catalog_url.clone().ok_or(DfuError::NoCatalogUrl)?,
        cache_path: config::catalog_cache_path(),
        ttl:        settings.catalog_cache_ttl(),
        refresh:    args.refresh,
    };
    let include_beta = args.enable_beta;
    let releases = tokio::task::spawn_blocking(move || catalog::load(&source, include_beta))
        .await
        .context("catalog download task failed")??;

    let code = update(
        adapter,
        identity,
        settings,
        target(args.uuid),
        UpdatePlan::Catalog(releases),
    )
    .await;
    Ok(code)
}

async fn cmd_dfu(args: &DfuArgs, settings: &Settings) -> anyhow::Result<i32> {
    let (adapter, identity) = open_radio().await?;
    let plan = UpdatePlan::Manual(ManualImage {
        firmware: args.hex.clone(),
        init:     args.init.clone(),
    });
    Ok(update(adapter, identity, settings, target(args.uuid), plan).await)
}

fn target(uuid: Option<Uuid>) -> Target {
    match uuid {
        Some(id) => Target::Identifier(id),
        None => Target::Interactive(Box::new(StdinPrompt)),
    }
}

async fn update(
    adapter: Arc<dyn RadioAdapter>,
    identity: Arc<dyn IdentityReader>,
    settings: &Settings,
    target: Target,
    plan: UpdatePlan,
) -> i32 {
    let (cancel_tx, cancel_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = cancel_tx.send(true);
        }
    });

    let supervisor = Arc::new(ToolSupervisor::from_settings(&settings.transfer));
    let outcome = Orchestrator::new(adapter, identity, supervisor, Console::stdout())
        .with_timeouts(settings.connect_timeout(), settings.identity_timeout())
        .with_cancel(cancel_rx)
        .run(target, plan)
        .await;
    outcome.exit_code()
}

// ─────────────────────────────────────────────────────────────────────────────
//  Radio backend
// ─────────────────────────────────────────────────────────────────────────────

/// Open the radio and run the availability precheck.
#[cfg(feature = "ble-central")]
async fn open_radio() -> ble_dfu::Result<(Arc<dyn RadioAdapter>, Arc<dyn IdentityReader>)> {
    use ble_dfu::check_available;
    use ble_dfu::radio::btle::{BtleAdapter, BtleIdentityReader};
    use ble_dfu::radio::{AdapterUnavailable, RadioError};

    let adapter = match BtleAdapter::first().await {
        Ok(adapter) => adapter,
        Err(RadioError::NoAdapter) => return Err(AdapterUnavailable::Unsupported.into()),
        Err(e) => return Err(e.into()),
    };
    check_available(adapter.state().await)?;

    let identity: Arc<dyn IdentityReader> = Arc::new(BtleIdentityReader::new(Arc::clone(&adapter)));
    let adapter: Arc<dyn RadioAdapter> = adapter;
    Ok((adapter, identity))
}

#[cfg(not(feature = "ble-central"))]
async fn open_radio() -> ble_dfu::Result<(Arc<dyn RadioAdapter>, Arc<dyn IdentityReader>)> {
    Err(DfuError::NoRadioBackend)
}

// ─────────────────────────────────────────────────────────────────────────────
//  Help & version
// ─────────────────────────────────────────────────────────────────────────────

fn app_name() -> String {
    std::env::args()
        .next()
        .and_then(|arg0| {
            PathBuf::from(arg0)
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
        })
        .unwrap_or_else(|| "ble-dfu".to_owned())
}

fn version_line(name: &str) -> String {
    format!("{} v{}", name, env!("CARGO_PKG_VERSION"))
}

fn print_version() {
    println!("{}", version_line(&app_name()));
}

fn help_text(name: &str) -> String {
    let lines = [
        version_line(name),
        "Usage:".to_owned(),
        format!("\t{} <command> [options...]", name),
        String::new(),
        "Commands:".to_owned(),
        "\tScan peripherals:   scan".to_owned(),
        "\tAutomatic update:   update [--enable-beta] [--uuid <uuid>]".to_owned(),
        "\tCustom firmware:    dfu --hex <filename> [--init <filename>] [--uuid <uuid>]".to_owned(),
        "\tShow this screen:   --help".to_owned(),
        "\tShow version:       --version".to_owned(),
        String::new(),
        "Options:".to_owned(),
        "\t--uuid <uuid>    If present the peripheral with that uuid is used. If not present a list of peripherals is displayed".to_owned(),
        "\t--enable-beta    If not present only stable versions are used".to_owned(),
        String::new(),
        "Short syntax:".to_owned(),
        "\t-u = --uuid, -b = --enable-beta, -h = --hex, -i = --init, -v = --version, -? = --help".to_owned(),
        String::new(),
        "Settings:".to_owned(),
        "\t--config <path>            Settings file (default ~/.config/ble-dfu/config.toml)".to_owned(),
        "\t--catalog-url <url>        Release catalog location".to_owned(),
        "\t--connect-timeout <secs>   Give up connecting after this many seconds".to_owned(),
        "\t--refresh                  Re-download the release catalog (update only)".to_owned(),
        "\t--verbose                  Diagnostic logging (RUST_LOG also works)".to_owned(),
        "\t--no-color                 Disable colored output".to_owned(),
    ];
    lines.join("\n")
}

fn print_help() {
    println!("{}", help_text(&app_name()));
}
