//! ---
//! bms_section: "01-core-functionality"
//! bms_subsection: "binary"
//! bms_type: "source"
//! bms_scope: "code"
//! bms_description: "Binary entrypoint for the R-BMS daemon and bench simulators."
//! bms_version: "v0.0.0-prealpha"
//! bms_owner: "tbd"
//! ---
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use prometheus::{Encoder, Registry, TextEncoder};
use r_bms_common::{init_tracing, AppConfig, CancellationToken};
use r_bms_core::{
    clock_offset, read_bms_clock, BatterySimulator, EscSimulator, LinkRuntime, RuntimeReport,
    Transports,
};
use r_bms_protocol::{ProtocolDriver, SerialTransport, Transport};
use tokio::signal;
use tracing::{error, info, warn};

// The first RTC read after wake-up returns the time the BMS fell asleep.
const CLOCK_SETTLE: Duration = Duration::from_secs(1);
const WATCHDOG_PERIOD: Duration = Duration::from_millis(500);

#[derive(Debug, Parser)]
#[command(author, version, about = "R-BMS daemon", long_about = None)]
struct Cli {
    #[arg(long, value_name = "FILE", help = "Path to configuration file")]
    config: Option<PathBuf>,

    #[arg(long, value_name = "PORT", help = "Override the BMS serial port")]
    bms_port: Option<String>,

    #[arg(long, value_name = "PORT", help = "Override the ESC serial port")]
    esc_port: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(about = "Poll the BMS, bridge the ESC and write the data log")]
    Run {
        #[arg(long, help = "Skip the BMS clock read at startup")]
        skip_clock: bool,
    },
    #[command(about = "Answer register reads like a battery on the BMS port")]
    SimulateBattery {
        #[arg(long, help = "Seed for reproducible values")]
        seed: Option<u64>,
    },
    #[command(about = "Poll the mirrored registers like the ESC does")]
    SimulateEsc {
        #[arg(long, default_value_t = 100, help = "Pause between reads in milliseconds")]
        period_ms: u64,
    },
    #[command(about = "Read and print the BMS real-time clock")]
    Clock,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let command = cli.command.unwrap_or(Commands::Run { skip_clock: false });
    let required = matches!(command, Commands::Run { .. });

    let (mut config, source) = load_config(cli.config.as_deref(), required)?;
    if let Some(port) = cli.bms_port {
        config.bms.port = port;
    }
    if let Some(port) = cli.esc_port {
        config.esc.port = port;
    }
    let _log_guard = init_tracing("r-bmsd", &config.logging)?;
    match &source {
        Some(path) => info!(config_path = %path.display(), "configuration loaded"),
        None => warn!("no configuration file found; using defaults"),
    }

    match command {
        Commands::Run { skip_clock } => run_daemon(config, skip_clock).await,
        Commands::SimulateBattery { seed } => {
            let driver = ProtocolDriver::new(
                SerialTransport::new("battery", &config.bms),
                config.driver.clone(),
            );
            let simulator = match seed {
                Some(seed) => BatterySimulator::with_seed(driver, seed),
                None => BatterySimulator::new(driver),
            };
            run_until_ctrl_c("battery-simulator", move |cancel| {
                simulator.run(&cancel).map_err(Into::into)
            })
            .await
        }
        Commands::SimulateEsc { period_ms } => {
            let driver = ProtocolDriver::new(
                SerialTransport::new("controller", &config.esc.serial()),
                config.driver.clone(),
            );
            let simulator = EscSimulator::from_config(driver, &config.esc)?
                .with_period(Duration::from_millis(period_ms));
            run_until_ctrl_c("esc-simulator", move |cancel| {
                simulator.run(&cancel).map_err(Into::into)
            })
            .await
        }
        Commands::Clock => {
            let mut driver =
                ProtocolDriver::new(SerialTransport::new("bms", &config.bms), config.driver.clone());
            match read_bms_clock(&mut driver, &CancellationToken::new(), CLOCK_SETTLE)? {
                Some(bms) => {
                    let offset = clock_offset(bms, Utc::now());
                    println!("{}", bms.format("%Y-%m-%dT%H:%M:%S"));
                    println!("offset: {}s", offset.num_seconds());
                    Ok(())
                }
                None => Err(anyhow!("BMS did not answer the clock read")),
            }
        }
    }
}

fn candidates(explicit: Option<&Path>) -> Vec<PathBuf> {
    let mut candidates = Vec::new();
    if let Some(path) = explicit {
        candidates.push(path.to_path_buf());
    }
    candidates.push(PathBuf::from("configs/r-bmsd.toml"));
    candidates.push(PathBuf::from("/etc/r-bms/r-bmsd.toml"));
    candidates
}

/// Load the configuration. Without `required`, a missing file falls back to
/// defaults; a file that exists but fails to parse is always an error.
fn load_config(explicit: Option<&Path>, required: bool) -> Result<(AppConfig, Option<PathBuf>)> {
    let candidates = candidates(explicit);
    let nothing_to_load = explicit.is_none()
        && std::env::var_os(AppConfig::ENV_CONFIG_PATH).is_none()
        && candidates.iter().all(|candidate| !candidate.exists());
    if nothing_to_load && !required {
        return Ok((AppConfig::default(), None));
    }
    let loaded = AppConfig::load_with_source(&candidates)?;
    Ok((loaded.config, Some(loaded.source)))
}

async fn run_daemon(config: AppConfig, skip_clock: bool) -> Result<()> {
    let mut bms = SerialTransport::new("bms", &config.bms);
    if !skip_clock {
        bms = log_clock_offset(bms, &config);
    }
    let transports = Transports {
        bms: Box::new(bms),
        esc: config
            .esc
            .enabled
            .then(|| Box::new(SerialTransport::new("esc", &config.esc.serial())) as Box<dyn Transport>),
    };

    let registry = Arc::new(Registry::new());
    let runtime = LinkRuntime::start(&config, transports, Arc::clone(&registry))?;
    info!(log = %runtime.log_path().display(), "daemon running; waiting for termination signal");

    let mut watchdog = tokio::time::interval(WATCHDOG_PERIOD);
    loop {
        tokio::select! {
            result = signal::ctrl_c() => {
                result?;
                info!("ctrl-c received; shutting down");
                break;
            }
            _ = watchdog.tick() => {
                if runtime.is_finished() {
                    error!("link thread exited; shutting down");
                    break;
                }
            }
        }
    }

    let report = runtime.shutdown();
    write_metrics(&registry, &config.datalog.directory);
    let report = report?;
    write_jitter(&report, &config.datalog.directory);
    Ok(())
}

fn log_clock_offset(transport: SerialTransport, config: &AppConfig) -> SerialTransport {
    let mut driver = ProtocolDriver::new(transport, config.driver.clone());
    match read_bms_clock(&mut driver, &CancellationToken::new(), CLOCK_SETTLE) {
        Ok(Some(bms)) => {
            let offset = clock_offset(bms, Utc::now());
            info!(bms_clock = %bms, offset_s = offset.num_seconds(), "BMS clock read");
        }
        Ok(None) => warn!("BMS did not answer the clock read"),
        Err(err) => warn!(error = %err, "BMS clock read failed"),
    }
    driver.into_transport()
}

fn write_metrics(registry: &Registry, directory: &Path) {
    let mut buffer = Vec::new();
    if let Err(err) = TextEncoder::new().encode(&registry.gather(), &mut buffer) {
        warn!(error = %err, "failed to encode metrics");
        return;
    }
    let path = directory.join("metrics.prom");
    if let Err(err) = fs::create_dir_all(directory).and_then(|()| fs::write(&path, buffer)) {
        warn!(path = %path.display(), error = %err, "failed to write metrics");
    }
}

fn write_jitter(report: &RuntimeReport, directory: &Path) {
    let Some(summary) = report.jitter.histogram().summary() else {
        return;
    };
    info!(
        samples = summary.samples,
        mean_us = summary.mean_us,
        std_dev_us = summary.std_dev_us,
        max_us = summary.max_us,
        overruns = report.jitter.overruns(),
        records = report.writer.records,
        dropped = report.dropped,
        "poller jitter summary"
    );
    let path = directory.join("poller-jitter.json");
    if let Err(err) = report.jitter.histogram().write_json(&path) {
        warn!(path = %path.display(), error = %err, "failed to write jitter histogram");
    }
}

async fn run_until_ctrl_c<F>(name: &str, body: F) -> Result<()>
where
    F: FnOnce(CancellationToken) -> Result<()> + Send + 'static,
{
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    let handle = thread::Builder::new()
        .name(name.to_owned())
        .spawn(move || body(token))
        .with_context(|| format!("failed to spawn {name}"))?;

    let mut watchdog = tokio::time::interval(WATCHDOG_PERIOD);
    loop {
        tokio::select! {
            result = signal::ctrl_c() => {
                result?;
                info!("ctrl-c received; stopping");
                break;
            }
            _ = watchdog.tick() => {
                if handle.is_finished() {
                    break;
                }
            }
        }
    }
    cancel.cancel();
    handle
        .join()
        .map_err(|_| anyhow!("{name} thread panicked"))?
}
