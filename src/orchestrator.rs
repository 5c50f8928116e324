//! Station orchestrator.
//!
//! Owns one supervised [`AcquisitionUnit`] per accepted instrument and the
//! station's [`TransferManager`], all running as independent tokio tasks.
//!
//! - Instruments with invalid configuration are rejected individually; the
//!   remaining ones still start.
//! - A unit that fails (degraded instrument) or panics is logged and restarted
//!   after `daemon.restart_delay`, up to `daemon.max_restarts` times. Other units
//!   are unaffected.
//! - On cancellation every unit abandons its current wait or poll, flushes its
//!   partial window and closes its connection. Units still running after
//!   `daemon.shutdown_grace` are aborted.

use crate::acquisition::{AcquisitionUnit, UnitReport};
use crate::clock::{Clock, SystemClock};
use crate::config::{InstrumentConfig, StationConfig};
use crate::data::stager::{RecoveryReport, Stager};
use crate::error::{DaqError, DaqResult};
use crate::error_recovery::RestartPolicy;
use crate::instrument::registry::DriverRegistry;
use crate::lock::InstanceLock;
use crate::transfer::TransferManager;
use futures::FutureExt;
use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// Instruments accepted and rejected at startup
#[derive(Debug, Default)]
pub struct AcquisitionPlan {
    /// Instruments that will run
    pub accepted: Vec<InstrumentConfig>,
    /// Instruments skipped, with the reason
    pub rejected: Vec<(String, DaqError)>,
}

impl AcquisitionPlan {
    /// Validate every instrument against the registry.
    ///
    /// An instrument whose name, data folder or staging folder is already
    /// taken by an accepted instrument is rejected.
    pub fn build(station: &StationConfig, registry: &DriverRegistry) -> Self {
        let mut plan = Self::default();
        let mut names = HashSet::new();
        let mut data_dirs = HashSet::new();
        let mut staging_dirs = HashSet::new();
        for instrument in &station.instruments {
            let duplicate = |what: &str| {
                Err(DaqError::Configuration(format!(
                    "instrument '{}': duplicate {what}",
                    instrument.name
                )))
            };
            let verdict = if names.contains(&instrument.name) {
                duplicate("name")
            } else if data_dirs.contains(&instrument.data_subdir()) {
                duplicate("data_path")
            } else if staging_dirs.contains(&instrument.staging_subdir()) {
                duplicate("staging_path")
            } else {
                registry.validate(instrument)
            };
            match verdict {
                Ok(()) => {
                    names.insert(instrument.name.clone());
                    data_dirs.insert(instrument.data_subdir());
                    staging_dirs.insert(instrument.staging_subdir());
                    plan.accepted.push(instrument.clone());
                }
                Err(err) => {
                    tracing::error!(instrument = %instrument.name, error = %err, "instrument rejected");
                    plan.rejected.push((instrument.name.clone(), err));
                }
            }
        }
        plan
    }
}

/// How a supervised unit ended
#[derive(Debug)]
pub enum UnitOutcome {
    /// Stopped on shutdown
    Stopped(UnitReport),
    /// Left halted after exhausting its restarts or failing to build
    Halted {
        /// Restarts performed
        restarts: u32,
    },
    /// Cancelled while waiting to restart
    Cancelled,
}

/// Summary of a daemon run
#[derive(Debug, Default)]
pub struct RunReport {
    /// Outcome per instrument
    pub units: Vec<(String, UnitOutcome)>,
    /// Units aborted after the grace period
    pub aborted: usize,
}

/// Runs the station.
#[derive(Debug)]
pub struct Orchestrator {
    station: Arc<StationConfig>,
    registry: Arc<DriverRegistry>,
    plan: AcquisitionPlan,
    clock: Arc<dyn Clock>,
    stager: Stager,
    transfer: Option<TransferManager>,
    cancel: CancellationToken,
}

impl Orchestrator {
    /// Orchestrator for a validated station configuration.
    pub fn new(station: StationConfig, registry: DriverRegistry) -> DaqResult<Self> {
        station.validate()?;
        let plan = AcquisitionPlan::build(&station, &registry);
        let transfer = TransferManager::from_config(&station)?;
        if transfer.is_none() {
            tracing::warn!("no sftp section configured, staged files will not be transferred");
        }
        Ok(Self {
            stager: Stager::new(station.staging_dir()).with_compression(station.transfer.compress),
            station: Arc::new(station),
            registry: Arc::new(registry),
            plan,
            clock: Arc::new(SystemClock),
            transfer,
            cancel: CancellationToken::new(),
        })
    }

    /// Use another clock
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Replace the transfer manager
    pub fn with_transfer(mut self, transfer: Option<TransferManager>) -> Self {
        self.transfer = transfer;
        self
    }

    /// Startup plan
    pub fn plan(&self) -> &AcquisitionPlan {
        &self.plan
    }

    /// Stager shared by all units
    pub fn stager(&self) -> &Stager {
        &self.stager
    }

    /// Token that stops the station when cancelled
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Stage data files left over by an earlier run.
    pub fn recover(&self) -> RecoveryReport {
        let mut total = RecoveryReport::default();
        for instrument in &self.plan.accepted {
            let data_dir = self.station.data_dir().join(instrument.data_subdir());
            match self.stager.recover(&data_dir, &instrument.staging_subdir()) {
                Ok(report) => {
                    total.staged += report.staged;
                    total.removed_parts += report.removed_parts;
                }
                Err(err) => {
                    tracing::error!(instrument = %instrument.name, error = %err, "startup recovery failed");
                }
            }
        }
        if total != RecoveryReport::default() {
            tracing::info!(staged = total.staged, removed = total.removed_parts, "recovered files from previous run");
        }
        total
    }

    /// Run until the cancel token fires, then shut down within the grace period.
    pub async fn run(self) -> DaqResult<RunReport> {
        let lock = InstanceLock::acquire(&self.station.lock_file())?;
        tracing::info!(
            instruments = self.plan.accepted.len(),
            rejected = self.plan.rejected.len(),
            lock = %lock.path().display(),
            "station starting"
        );
        self.recover();

        let restart = RestartPolicy::from(&self.station.daemon);
        let mut units = JoinSet::new();
        for instrument in &self.plan.accepted {
            let supervisor = Supervisor {
                station: Arc::clone(&self.station),
                instrument: instrument.clone(),
                registry: Arc::clone(&self.registry),
                clock: Arc::clone(&self.clock),
                stager: self.stager.clone(),
                restart: restart.clone(),
            };
            units.spawn(supervisor.run(self.cancel.clone()));
        }

        let mut transfer = self.transfer.clone().map(|manager| {
            let config = &self.station.transfer;
            let interval = Duration::from_secs(u64::from(config.interval) * 60);
            let trigger = config
                .trigger_on_stage
                .then(|| (self.stager.notifier(), config.settle_delay));
            tokio::spawn(manager.run(interval, trigger, self.cancel.clone()))
        });

        self.cancel.cancelled().await;
        let grace = self.station.daemon.shutdown_grace;
        tracing::info!(grace = ?grace, "shutdown requested");

        let mut report = RunReport::default();
        let drain = async {
            while let Some(joined) = units.join_next().await {
                match joined {
                    Ok(outcome) => report.units.push(outcome),
                    Err(err) => tracing::error!(error = %err, "supervisor task failed"),
                }
            }
            if let Some(handle) = transfer.as_mut() {
                if let Err(err) = handle.await {
                    tracing::error!(error = %err, "transfer task failed");
                }
            }
        };
        if tokio::time::timeout(grace, drain).await.is_err() {
            report.aborted = units.len();
            tracing::warn!(aborted = report.aborted, "grace period elapsed, aborting remaining units");
            units.shutdown().await;
            if let Some(handle) = transfer {
                handle.abort();
                let _ = handle.await;
            }
        }

        drop(lock);
        tracing::info!("station stopped");
        Ok(report)
    }
}

struct Supervisor {
    station: Arc<StationConfig>,
    instrument: InstrumentConfig,
    registry: Arc<DriverRegistry>,
    clock: Arc<dyn Clock>,
    stager: Stager,
    restart: RestartPolicy,
}

impl Supervisor {
    async fn run(self, cancel: CancellationToken) -> (String, UnitOutcome) {
        let name = self.instrument.name.clone();
        let mut restarts = 0;
        loop {
            let driver = match self.registry.build(&self.instrument) {
                Ok(driver) => driver,
                Err(err) => {
                    tracing::error!(instrument = %name, error = %err, "cannot build driver, unit halted");
                    return (name, UnitOutcome::Halted { restarts });
                }
            };
            let unit = AcquisitionUnit::new(
                &self.station,
                &self.instrument,
                driver,
                Arc::clone(&self.clock),
                self.stager.clone(),
            );

            // Inline so that aborting the supervisor also drops the unit
            match AssertUnwindSafe(unit.run(cancel.clone())).catch_unwind().await {
                Ok(Ok(report)) => return (name, UnitOutcome::Stopped(report)),
                Ok(Err(err)) => {
                    tracing::error!(instrument = %name, error = %err, "acquisition unit failed");
                }
                Err(_) => {
                    tracing::error!(instrument = %name, "acquisition unit panicked");
                }
            }

            if cancel.is_cancelled() {
                return (name, UnitOutcome::Cancelled);
            }
            if !self.restart.allows(restarts) {
                tracing::error!(instrument = %name, restarts, "restart limit reached, unit halted");
                return (name, UnitOutcome::Halted { restarts });
            }
            restarts += 1;
            tracing::warn!(instrument = %name, delay = ?self.restart.delay, restart = restarts, "restarting acquisition unit");
            tokio::select! {
                _ = cancel.cancelled() => return (name, UnitOutcome::Cancelled),
                _ = tokio::time::sleep(self.restart.delay) => {}
            }
        }
    }
}
