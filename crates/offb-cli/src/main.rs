use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Deserialize;
use tracing::{info, warn};

use offb_core::doctor as core_doctor;
use offb_core::sim::{SimConfig, SimVehicle};
use offb_core::{
    CommandSink, FlightMode, OffboardError, RunSummary, Setpoint, Supervisor, SupervisorConfig, TelemetrySource, Vec3,
};

use offb_fc::autodetect::autodetect_fc;
use offb_fc::doctor as fc_doctor;
use offb_fc::link::FcLink;
use offb_fc::{px4, Backend, FcConfig};

/// Vehicle never came up within `connect_timeout`.
const EXIT_NOT_CONNECTED: u8 = 2;

#[derive(Debug, Parser)]
#[command(name = "offb", version, about = "Offboard control supervisor for PX4 vehicles")]
struct Cli {
    #[arg(long)]
    config: String,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Validate the config file.
    Doctor,
    /// Connect, warm up and hold the vehicle in offboard until Ctrl-C.
    Run,
    Fc {
        #[command(subcommand)]
        cmd: FcCmd,
    },
}

#[derive(Debug, Subcommand)]
enum FcCmd {
    /// Probe serial ports/bauds for MAVLink heartbeats.
    Autodetect,
    /// List the flight modes the PX4 codec understands.
    Modes,
}

#[derive(Debug, Deserialize)]
struct Config {
    #[serde(default)]
    control: SupervisorConfig,
    #[serde(default)]
    setpoint: SetpointCfg,
    #[serde(default)]
    fc: FcConfig,
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
enum SetpointKind {
    #[default]
    Position,
    Velocity,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct SetpointCfg {
    kind: SetpointKind,
    x: f32,
    y: f32,
    z: f32,
    /// Radians. Omitted means the autopilot keeps its own heading.
    yaw: Option<f32>,
}

impl Default for SetpointCfg {
    fn default() -> Self {
        Self { kind: SetpointKind::Position, x: 100.0, y: 100.0, z: 0.0, yaw: None }
    }
}

impl SetpointCfg {
    fn to_setpoint(&self) -> Setpoint {
        let target = Vec3::new(self.x, self.y, self.z);
        match self.kind {
            SetpointKind::Position => Setpoint::Position { target, yaw: self.yaw },
            SetpointKind::Velocity => Setpoint::Velocity { target, yaw: self.yaw },
        }
    }
}

fn load_config(path: &str) -> Result<Config> {
    let s = std::fs::read_to_string(path).with_context(|| format!("read config {}", path))?;
    toml::from_str(&s).context("parse config toml")
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let cfg = load_config(&cli.config)?;

    match cli.cmd {
        Command::Doctor => doctor(&cfg).map(|_| ExitCode::SUCCESS),
        Command::Run => run(&cfg).await,
        Command::Fc { cmd } => fc_cmd(&cfg, cmd).map(|_| ExitCode::SUCCESS),
    }
}

fn doctor(cfg: &Config) -> Result<()> {
    info!("doctor: starting");
    core_doctor::check_control(&cfg.control)?;
    core_doctor::check_setpoint(&cfg.setpoint.to_setpoint())?;
    fc_doctor::check_fc(&cfg.fc, &cfg.control)?;
    match cfg.fc.backend {
        Backend::Sim => info!("doctor: fc backend is the simulated vehicle"),
        Backend::Mavlink => match cfg.fc.static_url() {
            Some(url) => info!("doctor: fc link {}", url),
            None => info!("doctor: fc autodetect enabled (OK)"),
        },
    }
    info!("doctor: OK");
    Ok(())
}

fn fc_cmd(cfg: &Config, cmd: FcCmd) -> Result<()> {
    match cmd {
        FcCmd::Autodetect => {
            let (devs, bauds) = cfg.fc.candidates();
            let res = autodetect_fc(&devs, &bauds, cfg.fc.heartbeat_timeout(), &cfg.fc.link_params())?;
            if let Some((dev, baud)) = &res.chosen {
                println!("CHOSEN: {} @ {}", dev, baud);
            } else {
                println!("CHOSEN: none");
            }
            for p in &res.probes {
                println!("probe dev={} baud={} hb={} {}ms note={}", p.dev, p.baud, p.hb_seen, p.elapsed_ms, p.note);
            }
            Ok(())
        }
        FcCmd::Modes => {
            for name in FlightMode::NAMES {
                let mode: FlightMode = name.parse().map_err(anyhow::Error::msg)?;
                match px4::encode(mode) {
                    Some((main, sub)) => println!("{:<20} main={} sub={} custom_mode=0x{:08x}", name, main, sub, px4::join(main, sub)),
                    None => println!("{:<20} (not requestable)", name),
                }
            }
            Ok(())
        }
    }
}

async fn run(cfg: &Config) -> Result<ExitCode> {
    doctor(cfg).context("config check failed")?;
    let setpoint = cfg.setpoint.to_setpoint();

    let shutdown = Arc::new(AtomicBool::new(false));
    let signals = tokio::spawn(wait_for_signal(shutdown.clone()));

    let outcome = match cfg.fc.backend {
        Backend::Sim => {
            let mut sim_cfg = SimConfig::default();
            if let Some(n) = cfg.fc.sim_offboard_min_setpoints {
                sim_cfg.offboard_min_setpoints = n;
            }
            let (sim, telemetry) = SimVehicle::new(sim_cfg);
            info!("run: using simulated vehicle");
            supervise(Supervisor::new(cfg.control.clone(), telemetry, sim, setpoint), shutdown).await
        }
        Backend::Mavlink => {
            let url = cfg.fc.resolve_url()?;
            let FcLink { sink, telemetry, reader } = FcLink::open(&url, &cfg.fc.link_params()).context("FC open")?;
            let outcome = supervise(Supervisor::new(cfg.control.clone(), telemetry, sink, setpoint), shutdown).await;
            drop(reader);
            outcome
        }
    };
    signals.abort();

    match outcome? {
        Ok(summary) => {
            println!("{}", serde_json::to_string_pretty(&summary)?);
            Ok(ExitCode::SUCCESS)
        }
        Err(e @ OffboardError::ConnectionNotYetEstablished { .. }) => {
            warn!("run: {}", e);
            Ok(ExitCode::from(EXIT_NOT_CONNECTED))
        }
        Err(e) => Err(e).context("supervisor"),
    }
}

/// The loop sleeps between ticks, so it gets its own blocking thread.
async fn supervise<T, C>(
    mut sup: Supervisor<T, C>,
    shutdown: Arc<AtomicBool>,
) -> Result<Result<RunSummary, OffboardError>>
where
    T: TelemetrySource + Send + 'static,
    C: CommandSink + Send + 'static,
{
    tokio::task::spawn_blocking(move || sup.run(&shutdown)).await.context("supervisor thread panicked")
}

async fn wait_for_signal(shutdown: Arc<AtomicBool>) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                warn!("run: cannot install SIGTERM handler: {}", e);
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
    info!("run: shutdown requested");
    shutdown.store(true, Ordering::SeqCst);
}
