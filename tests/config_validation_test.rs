//! Configuration loading and validation tests.

use station_daq::config::{StationConfig, TransferBackend};
use station_daq::instrument::registry::DriverRegistry;
use station_daq::orchestrator::AcquisitionPlan;
use std::path::PathBuf;
use std::time::Duration;

fn example_path() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("config/station.example.yaml")
}

#[test]
fn test_example_config_is_valid() {
    let config = StationConfig::load_from(example_path()).expect("example config loads");
    config.validate().expect("example config validates");

    assert_eq!(config.instruments.len(), 6);
    assert_eq!(config.transfer.backend, TransferBackend::Sftp);
    assert_eq!(config.daemon.shutdown_grace, Duration::from_secs(10));
    assert!(config.transfer.compress);

    let plan = AcquisitionPlan::build(&config, &DriverRegistry::with_builtin());
    assert!(plan.rejected.is_empty(), "rejected: {:?}", plan.rejected);

    let thermo = config.instrument("thermo-49i").unwrap();
    assert_eq!(thermo.kind(), "thermo49i");
    assert_eq!(thermo.remote_subdir(), PathBuf::from("thermo/49i"));
    assert_eq!(thermo.staging_subdir(), PathBuf::from("thermo-49i"));
    assert_eq!(config.instrument("aurora3000").unwrap().params.instant_interval, Some(5));
}

#[test]
fn test_instant_interval_must_fit_sampling_interval() {
    let yaml = |secs: u32| {
        format!(
            r#"
paths: {{ root: /tmp/station }}
instruments:
  - name: neph
    class: Aurora3000
    simulate: true
    params: {{ instant_interval: {secs}, sampling_interval: 1, reporting_interval: 60 }}
"#
        )
    };
    for secs in [0, 60, 300] {
        let config = StationConfig::from_yaml_str(&yaml(secs)).unwrap();
        let err = config.instruments[0].validate().unwrap_err();
        assert!(err.to_string().contains("instant_interval"), "{secs}: {err}");
    }
    let config = StationConfig::from_yaml_str(&yaml(5)).unwrap();
    assert!(config.instruments[0].validate().is_ok());
}

#[test]
fn test_non_multiple_reporting_interval_rejected() {
    let config = StationConfig::from_yaml_str(
        r#"
paths: { root: /tmp/station }
instruments:
  - name: neph
    class: Aurora3000
    simulate: true
    params: { sampling_interval: 7, reporting_interval: 60 }
"#,
    )
    .unwrap();
    let err = config.instruments[0].validate().unwrap_err();
    assert!(err.to_string().contains("must be a multiple of sampling_interval"));
}

#[test]
fn test_missing_transport_rejected_unless_simulated() {
    let yaml = |simulate: bool| {
        format!(
            r#"
paths: {{ root: /tmp/station }}
instruments:
  - name: pm
    class: Fidas
    simulate: {simulate}
    params: {{ sampling_interval: 1, reporting_interval: 60 }}
"#
        )
    };
    let registry = DriverRegistry::with_builtin();

    let real = StationConfig::from_yaml_str(&yaml(false)).unwrap();
    assert!(registry.validate(&real.instruments[0]).is_err());

    let simulated = StationConfig::from_yaml_str(&yaml(true)).unwrap();
    assert!(registry.validate(&simulated.instruments[0]).is_ok());
}

#[test]
fn test_invalid_log_level_is_fatal() {
    let config = StationConfig::from_yaml_str(
        r#"
paths: { root: /tmp/station }
logging: { level_console: loud }
"#,
    )
    .unwrap();
    let err = config.validate().unwrap_err();
    assert!(err.to_string().contains("logging.level_console"));
}

#[test]
fn test_unknown_class_rejected() {
    let config = StationConfig::from_yaml_str(
        r#"
paths: { root: /tmp/station }
instruments:
  - name: x
    class: instr.acme.Widget
    simulate: true
    params: { sampling_interval: 1, reporting_interval: 60 }
"#,
    )
    .unwrap();
    let err = DriverRegistry::with_builtin()
        .validate(&config.instruments[0])
        .unwrap_err();
    assert!(err.to_string().contains("unknown class"));
}
