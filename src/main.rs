//! monitornap - user daemon that dims idle monitors.
//!
//! Runs the dimming controller against Hyprland, or talks to a running
//! instance over its control socket.

use monitornap::backend::HyprlandSource;
use monitornap::config::Config;
use monitornap::control;
use monitornap::control::ControlServer;
use monitornap::control::Request;
use monitornap::controller::DimmingController;
use monitornap::controller::Status;
use monitornap::dimmer::CommandOverlay;
use monitornap::dimmer::DdcutilDimmer;
use monitornap::dimmer::DryRunDimmer;
use monitornap::dimmer::HardwareDimmer;
use monitornap::dimmer::NoOverlay;
use monitornap::dimmer::OverlayDimmer;
use monitornap::domain::MonitorId;
use monitornap::domain::PauseDuration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::env;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

/// Idle monitor dimmer for Hyprland.
///
/// Dims each monitor after a period without pointer activity, using DDC/CI
/// brightness and an optional overlay helper.
#[derive(Parser, Debug)]
#[command(name = "monitornap")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to config file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable dry-run mode (log driver calls instead of touching displays).
    #[arg(long)]
    dry_run: bool,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Control socket path (defaults to $XDG_RUNTIME_DIR/monitornap.sock).
    #[arg(long)]
    socket: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Cmd>,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Run the daemon (default).
    Run,
    /// Toggle awake mode on a running daemon.
    ToggleAwake,
    /// Turn awake mode on or off.
    Awake { state: Switch },
    /// Dim every monitor now, until the next activity.
    Nap,
    /// Wake every monitor and clear awake mode and pause.
    Resume,
    /// Pause dimming for 15, 30 or 60 minutes.
    Pause { minutes: u64 },
    /// Flash the overlay on one monitor.
    Identify { index: u32 },
    /// Show the daemon's current state.
    Status,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Switch {
    On,
    Off,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    init_logging(&args.log_level)?;

    let socket = args.socket.clone().or_else(control::default_socket_path);

    let request = match args.command {
        None | Some(Cmd::Run) => None,
        Some(Cmd::ToggleAwake) => Some(Request::ToggleAwake),
        Some(Cmd::Awake { state }) => Some(Request::Awake(matches!(state, Switch::On))),
        Some(Cmd::Nap) => Some(Request::Nap),
        Some(Cmd::Resume) => Some(Request::Resume),
        Some(Cmd::Pause { minutes }) => Some(Request::Pause(PauseDuration::try_from(minutes)?)),
        Some(Cmd::Identify { index }) => Some(Request::Identify(MonitorId::new(index))),
        Some(Cmd::Status) => Some(Request::Status),
    };

    if let Some(request) = request {
        let socket = socket.context("XDG_RUNTIME_DIR not set; pass --socket")?;
        return run_client(&socket, request).await;
    }

    info!("monitornap v{} starting", env!("CARGO_PKG_VERSION"));

    // Check environment
    if env::var("HYPRLAND_INSTANCE_SIGNATURE").is_err() {
        error!("Hyprland environment not detected.");
        error!("Required environment variables:");
        for diag in HyprlandSource::get_diagnostics() {
            error!("  {}", diag);
        }
        error!("");
        error!("If running as a systemd user service, ensure these variables are available.");
        error!("See: dbus-update-activation-environment --systemd HYPRLAND_INSTANCE_SIGNATURE");
        anyhow::bail!("Hyprland environment not available");
    }

    // Show diagnostics
    for diag in HyprlandSource::get_diagnostics() {
        debug!("{}", diag);
    }

    // Load config
    let mut config =
        Config::load_or_default(args.config.as_deref()).context("Failed to load configuration")?;

    if args.dry_run {
        config.dry_run = true;
    }

    info!(
        "Configuration loaded (dry_run={}, {} monitor overrides)",
        config.dry_run,
        config.monitors.len()
    );

    run_daemon(config, args.config, socket).await
}

/// Initialize logging with the specified level.
fn init_logging(level: &str) -> Result<()> {
    let filter = EnvFilter::try_new(format!("monitornap={level}"))
        .or_else(|_| EnvFilter::try_new("info"))
        .context("Invalid log level")?;

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .init();

    Ok(())
}

/// Send one request to a running daemon and print the reply.
async fn run_client(socket: &std::path::Path, request: Request) -> Result<()> {
    let reply = control::send_request(socket, request).await?;

    if request == Request::Status {
        let status: Status =
            serde_json::from_str(&reply).context("Unexpected status reply from daemon")?;
        print_status(&status);
    } else {
        println!("{reply}");
    }
    Ok(())
}

fn print_status(status: &Status) {
    println!(
        "awake mode: {}",
        if status.awake_mode { "on" } else { "off" }
    );
    match status.pause_remaining_seconds {
        Some(secs) => println!("paused: {}m {}s remaining", secs / 60, secs % 60),
        None => println!("paused: no"),
    }
    for monitor in &status.monitors {
        println!(
            "[{}] {} | phase={} idle={}s brightness={} overlay={}",
            monitor.id.index(),
            monitor.name.as_deref().unwrap_or("<unknown>"),
            monitor.phase,
            monitor.idle_seconds,
            monitor
                .brightness
                .map_or_else(|| "-".to_string(), |b| format!("{b}%")),
            if monitor.overlay_visible { "on" } else { "off" }
        );
        if let Some(warning) = &monitor.identity_warning {
            println!("    warning: {warning}");
        }
    }
}

/// Pick the dimming drivers for this run.
fn build_dimmers(config: &Config) -> Result<(Arc<dyn HardwareDimmer>, Arc<dyn OverlayDimmer>)> {
    if config.dry_run {
        let dimmer = Arc::new(DryRunDimmer::new());
        let hardware: Arc<dyn HardwareDimmer> = dimmer.clone();
        let overlay: Arc<dyn OverlayDimmer> = dimmer;
        return Ok((hardware, overlay));
    }

    let hardware: Arc<dyn HardwareDimmer> = Arc::new(
        DdcutilDimmer::new(config.ddcutil_path.as_ref(), config.ddc_sleep_multiplier)
            .context("Failed to initialize ddcutil driver")?,
    );

    let overlay: Arc<dyn OverlayDimmer> =
        match config.overlay_command.clone().and_then(CommandOverlay::new) {
            Some(overlay) => Arc::new(overlay),
            None => {
                info!("No overlay_command configured, software dimming unavailable");
                Arc::new(NoOverlay)
            }
        };

    Ok((hardware, overlay))
}

/// Run the daemon until a shutdown signal arrives.
async fn run_daemon(
    config: Config,
    config_path: Option<PathBuf>,
    socket: Option<PathBuf>,
) -> Result<()> {
    let source = Arc::new(HyprlandSource::from_env().context("Hyprland socket not available")?);
    let (hardware, overlay) = build_dimmers(&config)?;

    let (controller, handle) =
        DimmingController::new(config, source.clone(), source, hardware, overlay);
    let shutdown = CancellationToken::new();

    let server = match socket {
        Some(path) => Some(ControlServer::bind(&path).await?),
        None => {
            warn!("XDG_RUNTIME_DIR not set, control socket disabled");
            None
        }
    };
    let server_task =
        server.map(|server| tokio::spawn(server.serve(handle.clone(), shutdown.clone())));

    let signal_task = {
        let handle = handle.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = control::watch_signals(handle, shutdown.clone(), config_path).await {
                error!("Signal handling failed: {:#}", e);
                shutdown.cancel();
            }
        })
    };

    info!("Daemon started, watching for activity...");
    controller.run(shutdown.clone()).await;

    shutdown.cancel();
    if let Some(task) = server_task {
        let _ = task.await;
    }
    let _ = signal_task.await;

    info!("Shutdown complete");
    Ok(())
}
