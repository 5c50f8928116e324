//! Orchestrator supervision and shutdown tests
//!
//! Scripted drivers are plugged in through the driver registry, the same way a
//! new instrument class would be added.

use chrono::{TimeZone, Utc};
use station_daq::clock::TokioClock;
use station_daq::config::{InstrumentConfig, StationConfig};
use station_daq::data::storage::{read_data_file, WindowStatus};
use station_daq::error::{DaqError, DaqResult};
use station_daq::instrument::registry::{DriverFactory, DriverRegistry};
use station_daq::instrument::simulated::{Fault, SimulatedDriver};
use station_daq::instrument::{DriverSettings, InstrumentDriver};
use station_daq::lock::InstanceLock;
use station_daq::measurement::Reading;
use station_daq::orchestrator::{Orchestrator, UnitOutcome};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

/// Factory whose drivers follow a fixed fault script.
struct ScriptedFactory {
    kind: &'static str,
    polls: Vec<Option<Fault>>,
    connects: Vec<Option<Fault>>,
}

impl DriverFactory for ScriptedFactory {
    fn driver_type(&self) -> &'static str {
        self.kind
    }

    fn name(&self) -> &'static str {
        "scripted test instrument"
    }

    fn fields(&self) -> &'static [&'static str] {
        &["value"]
    }

    fn validate(&self, _config: &InstrumentConfig) -> DaqResult<()> {
        Ok(())
    }

    fn build(&self, config: &InstrumentConfig) -> Box<dyn InstrumentDriver> {
        Box::new(
            SimulatedDriver::new(config, self.kind, self.fields())
                .with_poll_script(self.polls.clone())
                .with_connect_script(self.connects.clone()),
        )
    }
}

/// Driver whose disconnect takes longer than the shutdown grace period.
struct SlowCloseDriver {
    inner: SimulatedDriver,
    closing: Duration,
    closed: Arc<AtomicBool>,
}

#[async_trait::async_trait]
impl InstrumentDriver for SlowCloseDriver {
    fn driver_type(&self) -> &'static str {
        "slowclose"
    }

    fn settings(&self) -> &DriverSettings {
        self.inner.settings()
    }

    fn is_connected(&self) -> bool {
        self.inner.is_connected()
    }

    async fn connect(&mut self) -> DaqResult<()> {
        self.inner.connect().await
    }

    async fn send_command(&mut self, command: &str) -> DaqResult<String> {
        self.inner.send_command(command).await
    }

    async fn poll(&mut self) -> DaqResult<Reading> {
        self.inner.poll().await
    }

    async fn disconnect(&mut self) {
        tokio::time::sleep(self.closing).await;
        self.inner.disconnect().await;
        self.closed.store(true, Ordering::SeqCst);
    }
}

struct SlowCloseFactory {
    closed: Arc<AtomicBool>,
    built: Arc<AtomicUsize>,
}

impl DriverFactory for SlowCloseFactory {
    fn driver_type(&self) -> &'static str {
        "slowclose"
    }

    fn name(&self) -> &'static str {
        "instrument with a slow disconnect"
    }

    fn fields(&self) -> &'static [&'static str] {
        &["value"]
    }

    fn validate(&self, _config: &InstrumentConfig) -> DaqResult<()> {
        Ok(())
    }

    fn build(&self, config: &InstrumentConfig) -> Box<dyn InstrumentDriver> {
        self.built.fetch_add(1, Ordering::SeqCst);
        Box::new(SlowCloseDriver {
            inner: SimulatedDriver::new(config, "slowclose", self.fields()),
            closing: Duration::from_secs(3),
            closed: Arc::clone(&self.closed),
        })
    }
}

fn registry() -> DriverRegistry {
    let mut registry = DriverRegistry::with_builtin();
    registry.register(ScriptedFactory {
        kind: "hanging",
        polls: vec![Some(Fault::Hang)],
        connects: vec![],
    });
    registry.register(ScriptedFactory {
        kind: "refusing",
        polls: vec![],
        connects: vec![Some(Fault::Refused); 10],
    });
    registry
}

fn station(root: &Path) -> StationConfig {
    StationConfig::from_yaml_str(&format!(
        r#"
paths:
  root: {root}
daemon:
  shutdown_grace: 10s
  max_reconnect_attempts: 2
  restart_delay: 1s
  max_restarts: 1
instruments:
  - name: o3
    class: instr.thermo.Thermo49i
    simulate: true
    params: {{ sampling_interval: 1, reporting_interval: 60 }}
  - name: stuck
    class: test.Hanging
    params:
      socket: {{ host: 127.0.0.1, port: 7000 }}
      sampling_interval: 1
      reporting_interval: 60
  - name: bad
    class: test.Refusing
    params:
      socket: {{ host: 127.0.0.1, port: 7001 }}
      sampling_interval: 1
      reporting_interval: 60
  - name: neph
    class: Aurora3000
    simulate: true
    params: {{ sampling_interval: 7, reporting_interval: 60 }}
"#,
        root = root.display()
    ))
    .expect("station config")
}

fn outcome<'a>(units: &'a [(String, UnitOutcome)], name: &str) -> &'a UnitOutcome {
    &units
        .iter()
        .find(|(n, _)| n == name)
        .unwrap_or_else(|| panic!("no outcome for {name}"))
        .1
}

#[tokio::test(start_paused = true)]
async fn test_units_are_supervised_independently() {
    let tmp = TempDir::new().unwrap();
    let config = station(tmp.path());
    let staging = config.staging_dir();
    let start = Utc.with_ymd_and_hms(2024, 5, 17, 10, 0, 0).unwrap();

    let orchestrator = Orchestrator::new(config, registry())
        .unwrap()
        .with_clock(Arc::new(TokioClock::starting_at(start)));

    // Interval 7 does not divide 60: only that instrument is dropped
    let rejected: Vec<_> = orchestrator
        .plan()
        .rejected
        .iter()
        .map(|(n, _)| n.as_str())
        .collect();
    assert_eq!(rejected, ["neph"]);
    assert_eq!(orchestrator.plan().accepted.len(), 3);

    let cancel = orchestrator.cancel_token();
    let controller = async {
        tokio::time::sleep(Duration::from_secs(5 * 60 + 30)).await;
        cancel.cancel();
        tokio::time::Instant::now()
    };
    let (report, cancelled_at) = tokio::join!(orchestrator.run(), controller);
    let report = report.unwrap();

    // The hung poll is abandoned immediately instead of waiting out the grace period
    assert!(tokio::time::Instant::now() - cancelled_at < Duration::from_secs(1));
    assert_eq!(report.aborted, 0);
    assert_eq!(report.units.len(), 3);

    match outcome(&report.units, "o3") {
        UnitOutcome::Stopped(unit) => {
            assert_eq!(unit.sampler.polls, 5);
            assert_eq!(unit.files, 1);
        }
        other => panic!("o3 should keep running, got {other:?}"),
    }
    match outcome(&report.units, "stuck") {
        UnitOutcome::Stopped(unit) => {
            assert_eq!(unit.sampler.polls, 0);
            assert_eq!(unit.files, 0);
        }
        other => panic!("stuck unit should stop on shutdown, got {other:?}"),
    }
    assert!(matches!(
        outcome(&report.units, "bad"),
        UnitOutcome::Halted { restarts: 1 }
    ));

    // Each degraded run flushed its window before giving up
    for name in ["bad-202405171000-202405171001.csv", "bad-202405171000-202405171002.csv"] {
        let contents = read_data_file(&staging.join("bad").join(name)).unwrap();
        assert_eq!(contents.meta.status, WindowStatus::NoData);
        assert_eq!(contents.meta.polls_failed, 1);
    }
    assert!(!staging.join("stuck").exists());
}

#[tokio::test]
async fn test_second_instance_is_refused() {
    let tmp = TempDir::new().unwrap();
    let config = station(tmp.path());
    let _held = InstanceLock::acquire(&config.lock_file()).unwrap();

    let orchestrator = Orchestrator::new(config, registry()).unwrap();
    let err = orchestrator.run().await.unwrap_err();
    assert!(matches!(err, DaqError::AlreadyRunning(_)), "got {err:?}");
}

#[tokio::test(start_paused = true)]
async fn test_startup_recovers_leftover_files() {
    let tmp = TempDir::new().unwrap();
    let config = station(tmp.path());
    let data = config.data_dir().join("o3");
    std::fs::create_dir_all(&data).unwrap();
    std::fs::write(data.join("o3-202405170900-202405171000.csv"), "# {}\ndtm,o3\n").unwrap();
    std::fs::write(data.join("o3-202405171000-202405171100.csv.part"), "dtm,o3\n").unwrap();
    let staging = config.staging_dir();

    let orchestrator = Orchestrator::new(config, registry()).unwrap();
    let recovered = orchestrator.recover();
    assert_eq!(recovered.staged, 1);
    assert_eq!(recovered.removed_parts, 1);
    assert!(staging.join("o3/o3-202405170900-202405171000.csv").exists());
    assert_eq!(std::fs::read_dir(&data).unwrap().count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_unit_overrunning_grace_is_stopped_before_run_returns() {
    let tmp = TempDir::new().unwrap();
    let config = StationConfig::from_yaml_str(&format!(
        r#"
paths:
  root: {root}
daemon:
  shutdown_grace: 500ms
instruments:
  - name: slow
    class: test.SlowClose
    params:
      socket: {{ host: 127.0.0.1, port: 7002 }}
      sampling_interval: 1
      reporting_interval: 60
"#,
        root = tmp.path().display()
    ))
    .unwrap();
    let lock_file = config.lock_file();
    let closed = Arc::new(AtomicBool::new(false));
    let built = Arc::new(AtomicUsize::new(0));
    let mut registry = DriverRegistry::with_builtin();
    registry.register(SlowCloseFactory {
        closed: Arc::clone(&closed),
        built: Arc::clone(&built),
    });

    let start = Utc.with_ymd_and_hms(2024, 5, 17, 10, 0, 0).unwrap();
    let orchestrator = Orchestrator::new(config, registry)
        .unwrap()
        .with_clock(Arc::new(TokioClock::starting_at(start)));
    let cancel = orchestrator.cancel_token();
    let controller = async {
        tokio::time::sleep(Duration::from_secs(90)).await;
        cancel.cancel();
        tokio::time::Instant::now()
    };
    let (report, cancelled_at) = tokio::join!(orchestrator.run(), controller);
    let report = report.unwrap();

    assert_eq!(report.aborted, 1);
    assert!(report.units.is_empty());
    assert!(tokio::time::Instant::now() - cancelled_at < Duration::from_secs(1));

    // The aborted unit never finishes its disconnect later on
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert!(!closed.load(Ordering::SeqCst));
    assert_eq!(built.load(Ordering::SeqCst), 1);

    // The lock is free for the next instance
    assert!(InstanceLock::acquire(&lock_file).is_ok());
}
