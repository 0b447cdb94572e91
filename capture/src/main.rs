//! skywatch-capture: run one unattended imaging session against INDI devices,
//! PHD2, ASTAP and Siril.

mod astap;
mod indi_ports;
mod logging;
mod phd2;
mod preflight_ports;
mod signals;
mod siril;

use anyhow::{bail, Context};
use clap::Parser;
use skywatch_indi::{IndiCamera, IndiClient, IndiFocuser, IndiMount};
use skywatch_sequencer::coordinates::parse_coordinate_pair;
use skywatch_sequencer::{
    Autoguider, FocuserPort, MaintenanceCalendar, SessionConfig, SessionExecutor, SessionPorts,
    SessionSummary, ShutdownToken,
};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::astap::AstapSolver;
use crate::indi_ports::{IndiCameraPort, IndiFocuserPort, IndiMountPort};
use crate::phd2::Phd2Client;
use crate::preflight_ports::{DfDiskProbe, RachioCalendar, TerminalPrompt};
use crate::siril::SirilStarMetrics;

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Unattended imaging session: align, focus, guide and capture one target"
)]
struct Args {
    #[arg(short, long, help = "Session file (TOML)")]
    config: PathBuf,

    #[arg(
        short,
        long,
        help = "Target coordinates overriding the session file, e.g. \"5:35:17 -5:23:24\" (RA in hours)"
    )]
    wcs: Option<String>,

    #[arg(long, help = "Start imaging without the initial autofocus run")]
    skip_initial_focus: bool,

    #[arg(long, default_value = "logs", help = "Directory for the rolling log files")]
    log_dir: PathBuf,

    #[arg(short, long, help = "Debug level logging (RUST_LOG takes precedence)")]
    verbose: bool,
}

fn load_config(args: &Args) -> anyhow::Result<SessionConfig> {
    let mut config = SessionConfig::load(&args.config)
        .with_context(|| format!("loading session file {}", args.config.display()))?;
    if let Some(wcs) = &args.wcs {
        let target = parse_coordinate_pair(wcs)
            .with_context(|| format!("'{}' is not an RA/Dec pair", wcs))?;
        config = config.with_target(target);
    }
    if args.skip_initial_focus {
        config.focus.skip_initial = true;
    }
    Ok(config)
}

async fn connect_guider(config: &SessionConfig) -> anyhow::Result<Option<Arc<dyn Autoguider>>> {
    let guiding = &config.guiding;
    if !guiding.enabled {
        tracing::info!("Guiding disabled");
        return Ok(None);
    }
    match Phd2Client::connect(&guiding.host, guiding.port).await {
        Ok(client) => Ok(Some(Arc::new(client))),
        Err(e) if guiding.mandatory => Err(e).context("connecting to PHD2"),
        Err(e) => {
            tracing::warn!("PHD2 unavailable, imaging unguided: {}", e);
            Ok(None)
        }
    }
}

fn maintenance_calendar(config: &SessionConfig) -> Option<Arc<dyn MaintenanceCalendar>> {
    let key_file = config.preflight.rachio_key_file.as_ref()?;
    match RachioCalendar::from_key_file(key_file) {
        Ok(calendar) => Some(Arc::new(calendar)),
        Err(e) => {
            tracing::warn!("Maintenance calendar unavailable: {}", e);
            None
        }
    }
}

fn print_progress(percent: f64, message: String) {
    let mut stdout = std::io::stdout().lock();
    let _ = write!(stdout, "\r{:>5.1}% {:<60}", percent, message);
    if percent >= 100.0 {
        let _ = writeln!(stdout);
    }
    let _ = stdout.flush();
}

async fn run(args: Args, shutdown: ShutdownToken) -> anyhow::Result<SessionSummary> {
    let config = load_config(&args)?;
    let target = config.target_coordinate()?;
    tracing::info!("Target {}: {}", config.target.label(), target);

    let devices = &config.devices;
    let client = Arc::new(RwLock::new(IndiClient::new(
        &devices.indi_host,
        Some(devices.indi_port),
    )));
    client
        .write()
        .await
        .connect()
        .await
        .context("connecting to the INDI server")?;

    let policy = config.retry.policy();

    let mount = IndiMount::new(client.clone(), &devices.mount);
    mount
        .connect()
        .await
        .with_context(|| format!("connecting mount {}", devices.mount))?;

    let mut camera = IndiCamera::new(client.clone(), &devices.camera);
    if let Some(wheel) = &devices.filter_wheel {
        camera = camera.with_filter_device(wheel);
    }
    camera
        .connect()
        .await
        .with_context(|| format!("connecting camera {}", devices.camera))?;
    camera.enable_blob().await.context("enabling image transfer")?;

    let focuser: Option<Arc<dyn FocuserPort>> = match (&devices.focuser, config.focus.enabled) {
        (Some(name), true) => {
            let focuser = IndiFocuser::new(client.clone(), name);
            focuser
                .connect()
                .await
                .with_context(|| format!("connecting focuser {}", name))?;
            Some(Arc::new(IndiFocuserPort::new(focuser, policy.clone())))
        }
        (None, true) => {
            if config.focus.mandatory {
                bail!("focus is mandatory but no focuser is configured");
            }
            tracing::warn!("No focuser configured, autofocus disabled");
            None
        }
        (_, false) => None,
    };

    let ports = SessionPorts {
        mount: Arc::new(IndiMountPort::new(mount, policy)),
        camera: Arc::new(IndiCameraPort::new(camera)),
        solver: Arc::new(AstapSolver::new(
            config.solver.astap_path.clone(),
            config.solver.search_radius,
            config.solver.timeout(),
        )),
        metrics: Arc::new(SirilStarMetrics::new(
            config.metrics.siril_path.clone(),
            config.metrics.timeout(),
        )),
        focuser,
        guider: connect_guider(&config).await?,
        disk: Arc::new(DfDiskProbe),
        calendar: maintenance_calendar(&config),
        prompt: Arc::new(TerminalPrompt),
    };

    let executor = SessionExecutor::new(config, ports, shutdown)?.with_progress(print_progress);
    tracing::info!("Capturing to {}", executor.capture_dir().display());
    let result = executor.run().await;

    client.write().await.disconnect().await;
    Ok(result?)
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let guard = match logging::init_logging(&args.log_dir, args.verbose) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            std::process::exit(1);
        }
    };

    let shutdown = ShutdownToken::new();
    signals::spawn_signal_handler(shutdown.clone());

    let code = match run(args, shutdown).await {
        Ok(summary) => {
            tracing::info!(
                "Session finished ({}): {} images, {} meridian flips, {} focus runs in {:.0} min",
                summary.reason,
                summary.images_captured,
                summary.flips,
                summary.focus_runs,
                summary.elapsed.as_secs_f64() / 60.0
            );
            0
        }
        Err(e) => {
            tracing::error!("Session failed: {:#}", e);
            1
        }
    };

    drop(guard);
    std::process::exit(code);
}
