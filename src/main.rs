//! CLI entry point for station-daq
//!
//! # Usage
//!
//! Run the daemon:
//! ```bash
//! station-daq run --config station.yaml
//! station-daq run --config station.yaml --simulate
//! ```
//!
//! Maintenance:
//! ```bash
//! station-daq check --config station.yaml
//! station-daq send --config station.yaml --instrument thermo-49i --cmd "o3"
//! station-daq sync --config station.yaml
//! station-daq download --config station.yaml --instrument thermo-49i
//! station-daq ports
//! ```

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use station_daq::config::StationConfig;
use station_daq::data::stager::Stager;
use station_daq::instrument::registry::DriverRegistry;
use station_daq::instrument::thermo::{self, ThermoDriver};
use station_daq::instrument::InstrumentDriver;
use station_daq::logging::{self, LoggingSetup};
use station_daq::orchestrator::{Orchestrator, UnitOutcome};
use station_daq::transfer::TransferManager;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(name = "station-daq")]
#[command(about = "Unattended data acquisition for monitoring stations", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the acquisition daemon until SIGINT/SIGTERM
    Run {
        /// Station configuration file
        #[arg(long, default_value = "station.yaml")]
        config: PathBuf,

        /// Simulate every instrument
        #[arg(long)]
        simulate: bool,
    },

    /// Validate configuration and print the acquisition plan
    Check {
        /// Station configuration file
        #[arg(long, default_value = "station.yaml")]
        config: PathBuf,
    },

    /// Send one command to one instrument and print the reply
    Send {
        /// Station configuration file
        #[arg(long, default_value = "station.yaml")]
        config: PathBuf,

        /// Instrument name
        #[arg(long)]
        instrument: String,

        /// Raw command
        #[arg(long)]
        cmd: String,
    },

    /// Upload staged files once and exit
    Sync {
        /// Station configuration file
        #[arg(long, default_value = "station.yaml")]
        config: PathBuf,
    },

    /// Download a Thermo analyzer's record logger and stage it
    Download {
        /// Station configuration file
        #[arg(long, default_value = "station.yaml")]
        config: PathBuf,

        /// Instrument name
        #[arg(long)]
        instrument: String,
    },

    /// List serial ports
    Ports,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { config, simulate } => run_daemon(&config, simulate).await,
        Commands::Check { config } => check(&config),
        Commands::Send {
            config,
            instrument,
            cmd,
        } => send(&config, &instrument, &cmd).await,
        Commands::Sync { config } => sync(&config).await,
        Commands::Download { config, instrument } => download(&config, &instrument).await,
        Commands::Ports => ports(),
    }
}

fn load(path: &Path) -> Result<StationConfig> {
    let config = StationConfig::load_from(path)
        .with_context(|| format!("loading configuration from {}", path.display()))?;
    config.validate().context("invalid station configuration")?;
    Ok(config)
}

async fn run_daemon(path: &Path, simulate: bool) -> Result<()> {
    let mut config = load(path)?;
    config.apply_simulate(simulate);
    logging::init_from_config(&config).context("initializing logging")?;
    tracing::info!(config = %path.display(), simulate = config.simulate, "station-daq {}", env!("CARGO_PKG_VERSION"));

    let orchestrator = Orchestrator::new(config, DriverRegistry::with_builtin())?;
    if orchestrator.plan().accepted.is_empty() {
        tracing::warn!("no instrument accepted, only transfer will run");
    }

    let cancel = orchestrator.cancel_token();
    tokio::spawn(wait_for_signal(cancel));

    let report = orchestrator.run().await?;
    for (name, outcome) in &report.units {
        match outcome {
            UnitOutcome::Stopped(unit) => tracing::info!(
                instrument = %name,
                polls = unit.sampler.polls,
                failures = unit.sampler.failures,
                files = unit.files,
                "unit stopped"
            ),
            UnitOutcome::Halted { restarts } => {
                tracing::warn!(instrument = %name, restarts, "unit was halted")
            }
            UnitOutcome::Cancelled => tracing::info!(instrument = %name, "unit cancelled while restarting"),
        }
    }
    if report.aborted > 0 {
        bail!("{} unit(s) did not stop within the grace period", report.aborted);
    }
    Ok(())
}

async fn wait_for_signal(cancel: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => tracing::info!("SIGINT received"),
                    _ = term.recv() => tracing::info!("SIGTERM received"),
                }
            }
            Err(err) => {
                tracing::warn!(error = %err, "cannot install SIGTERM handler");
                if let Err(err) = tokio::signal::ctrl_c().await {
                    tracing::error!(error = %err, "cannot listen for ctrl-c");
                }
            }
        }
    }
    #[cfg(not(unix))]
    {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %err, "cannot listen for ctrl-c");
        }
    }
    cancel.cancel();
}

fn check(path: &Path) -> Result<()> {
    let config = load(path)?;
    let registry = DriverRegistry::with_builtin();
    let plan = station_daq::orchestrator::AcquisitionPlan::build(&config, &registry);

    println!("📋 Station configuration: {}", path.display());
    println!("   Data:    {}", config.data_dir().display());
    println!("   Staging: {}", config.staging_dir().display());
    println!("   Log:     {}", config.log_file().display());
    println!();
    for instrument in &plan.accepted {
        println!(
            "✅ {:<16} {:<12} every {:>3} min, file every {:>4} min{}",
            instrument.name,
            instrument.kind(),
            instrument.params.sampling_interval,
            instrument.params.reporting_interval,
            if instrument.simulate { " (simulated)" } else { "" }
        );
    }
    for (name, err) in &plan.rejected {
        println!("❌ {name:<16} {err}");
    }
    match TransferManager::from_config(&config) {
        Ok(Some(manager)) => println!("\n📡 Transfer: {}", manager.describe()),
        Ok(None) => println!("\n⚠️  Transfer: not configured"),
        Err(err) => println!("\n❌ Transfer: {err}"),
    }

    if !plan.rejected.is_empty() {
        bail!("{} instrument(s) rejected", plan.rejected.len());
    }
    Ok(())
}

async fn send(path: &Path, name: &str, command: &str) -> Result<()> {
    let config = load(path)?;
    logging::init(LoggingSetup::console(tracing::Level::WARN))?;
    let instrument = config
        .instrument(name)
        .with_context(|| format!("no instrument named '{name}'"))?;
    let registry = DriverRegistry::with_builtin();
    registry.validate(instrument)?;

    let mut driver = registry.build(instrument)?;
    driver.connect().await?;
    let reply = driver.send_command(command).await;
    driver.disconnect().await;
    println!("{}", reply?);
    Ok(())
}

async fn sync(path: &Path) -> Result<()> {
    let config = load(path)?;
    logging::init(LoggingSetup::console(tracing::Level::INFO))?;
    let Some(manager) = TransferManager::from_config(&config)? else {
        bail!("no transfer target configured");
    };
    let cancel = CancellationToken::new();
    tokio::spawn(wait_for_signal(cancel.clone()));
    let report = manager.sync_async(&cancel).await?;
    println!(
        "📡 {}: {} uploaded, {} failed, {} not attempted",
        manager.describe(),
        report.uploaded.len(),
        report.failed.len(),
        report.skipped
    );
    for (file, reason) in &report.failed {
        println!("   ❌ {}: {reason}", file.display());
    }
    if !report.failed.is_empty() {
        bail!("{} file(s) left staged", report.failed.len());
    }
    Ok(())
}

async fn download(path: &Path, name: &str) -> Result<()> {
    let config = load(path)?;
    logging::init(LoggingSetup::console(tracing::Level::INFO))?;
    let instrument = config
        .instrument(name)
        .with_context(|| format!("no instrument named '{name}'"))?;
    let kind = match instrument.kind().as_str() {
        "thermo49i" => "thermo49i",
        "thermo49c" => "thermo49c",
        other => bail!("instrument '{name}' ({other}) has no record logger"),
    };
    if instrument.simulate {
        bail!("instrument '{name}' is simulated");
    }
    DriverRegistry::with_builtin().validate(instrument)?;

    let mut driver = ThermoDriver::new(instrument, kind);
    driver.connect().await?;
    let records = driver.download_lrec().await;
    driver.disconnect().await;
    let records = records?;

    let data_dir = config.data_dir().join(instrument.data_subdir());
    let file = thermo::write_lrec_dump(&data_dir, name, &records, chrono::Local::now())?;
    let stager = Stager::new(config.staging_dir()).with_compression(config.transfer.compress);
    let outcome = stager.stage(&file, &instrument.staging_subdir())?;
    println!(
        "📥 {}: {} records staged as {}",
        name,
        records.len(),
        outcome.staged_path().display()
    );
    Ok(())
}

#[cfg(feature = "serial")]
fn ports() -> Result<()> {
    let ports = station_daq::instrument::transport::available_ports()?;
    if ports.is_empty() {
        println!("No serial ports found");
    }
    for port in ports {
        println!("{port}");
    }
    Ok(())
}

#[cfg(not(feature = "serial"))]
fn ports() -> Result<()> {
    bail!("serial support not enabled, rebuild with --features serial")
}
