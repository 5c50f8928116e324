//! Station configuration using Figment
//!
//! Configuration is loaded once at startup from:
//! 1. a YAML station file (base configuration)
//! 2. environment variables prefixed with `STATION_DAQ_`, nested keys
//!    separated by a double underscore (e.g. `STATION_DAQ_LOGGING__LEVEL_CONSOLE=debug`)
//!
//! The resulting [`StationConfig`] is immutable and passed explicitly to every
//! component. Validation is split in two: station-wide problems are fatal
//! ([`StationConfig::validate`]), while a broken instrument entry only removes
//! that instrument ([`InstrumentConfig::validate`]).
//!
//! # Example
//! ```no_run
//! use station_daq::config::StationConfig;
//!
//! let config = StationConfig::load_from("station.yaml")?;
//! config.validate()?;
//! for instrument in &config.instruments {
//!     println!("{} every {} min", instrument.name, instrument.params.sampling_interval);
//! }
//! # Ok::<(), station_daq::error::DaqError>(())
//! ```

use crate::error::{DaqError, DaqResult};
use crate::validation;
use figment::{
    providers::{Env, Format, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable prefix for overrides.
pub const ENV_PREFIX: &str = "STATION_DAQ_";

const LOG_LEVELS: [&str; 7] = [
    "trace", "debug", "info", "warn", "warning", "error", "critical",
];

/// Top-level station configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StationConfig {
    /// Force every instrument into simulate mode
    #[serde(default)]
    pub simulate: bool,
    /// Filesystem layout
    pub paths: PathsConfig,
    /// Console and file logging
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Remote archive endpoint; transfer is disabled when absent
    #[serde(default)]
    pub sftp: Option<SftpConfig>,
    /// Transfer manager scheduling and backend
    #[serde(default)]
    pub transfer: TransferConfig,
    /// Supervision and recovery tuning
    #[serde(default)]
    pub daemon: DaemonConfig,
    /// Instrument definitions
    #[serde(default)]
    pub instruments: Vec<InstrumentConfig>,
}

/// Station filesystem layout. Relative entries are resolved against `root`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Station root directory (`~` is expanded)
    pub root: PathBuf,
    /// Directory for open and recent data files
    #[serde(default = "default_data_dir")]
    pub data: PathBuf,
    /// Directory for files pending transfer
    #[serde(default = "default_staging_dir")]
    pub staging: PathBuf,
    /// Directory for log files
    #[serde(default = "default_logging_dir")]
    pub logging: PathBuf,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log file name inside `paths.logging`
    #[serde(default = "default_log_file")]
    pub file_name: String,
    /// Console verbosity (trace, debug, info, warn|warning, error|critical)
    #[serde(default = "default_level_console")]
    pub level_console: String,
    /// File verbosity
    #[serde(default = "default_level_file")]
    pub level_file: String,
}

/// SFTP endpoint configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SftpConfig {
    /// Remote host name
    pub host: String,
    /// Remote SSH port
    #[serde(default = "default_sftp_port")]
    pub port: u16,
    /// Remote user name
    pub usr: String,
    /// Private key file (`~` is expanded)
    pub key: PathBuf,
    /// Remote archive root; staging subfolders are mirrored below it
    pub remote_path: PathBuf,
    /// Optional SOCKS5 tunnel
    #[serde(default)]
    pub proxy: Option<ProxyConfig>,
}

/// SOCKS5 proxy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Proxy host
    pub socks5: String,
    /// Proxy port
    pub port: u16,
}

/// Where staged files are delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TransferBackend {
    /// Upload over SFTP (requires the `sftp` feature)
    #[default]
    Sftp,
    /// Copy into a local or mounted archive directory
    Local,
}

/// Transfer manager configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferConfig {
    /// Minutes between scheduled sync runs
    #[serde(default = "default_transfer_interval")]
    pub interval: u32,
    /// Also sync shortly after new files are staged
    #[serde(default = "default_true")]
    pub trigger_on_stage: bool,
    /// Debounce between a staging event and the reactive sync
    #[serde(default = "default_settle_delay", with = "humantime_serde")]
    pub settle_delay: Duration,
    /// Delivery backend
    #[serde(default)]
    pub backend: TransferBackend,
    /// Archive directory for the `local` backend
    #[serde(default)]
    pub archive_path: Option<PathBuf>,
    /// Stage data files as single-entry zip archives
    #[serde(default)]
    pub compress: bool,
}

/// Supervision and recovery tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Time allowed for units to stop after a termination signal
    #[serde(default = "default_shutdown_grace", with = "humantime_serde")]
    pub shutdown_grace: Duration,
    /// Consecutive poll failures before the sampler reconnects
    #[serde(default = "default_reconnect_threshold")]
    pub reconnect_threshold: u32,
    /// Failed reconnect attempts before a unit is marked degraded
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
    /// Delay before a degraded or crashed unit is restarted
    #[serde(default = "default_restart_delay", with = "humantime_serde")]
    pub restart_delay: Duration,
    /// Restart limit per unit; unbounded when absent
    #[serde(default)]
    pub max_restarts: Option<u32>,
    /// Instance lock file, relative to `paths.root`
    #[serde(default = "default_lock_file")]
    pub lock_file: PathBuf,
}

/// One configured instrument
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstrumentConfig {
    /// Unique instrument name; also the default data/staging/remote subfolder
    pub name: String,
    /// Driver class, e.g. `instr.thermo.Thermo49i`; the last segment selects the driver
    pub class: String,
    /// Synthesize readings instead of talking to hardware
    #[serde(default)]
    pub simulate: bool,
    /// Connection, command and timing parameters
    pub params: InstrumentParams,
}

/// Instrument parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstrumentParams {
    /// Instrument address on a multidrop line (Thermo analyzers)
    #[serde(default)]
    pub id: Option<u8>,
    /// TCP connection
    #[serde(default)]
    pub socket: Option<SocketParams>,
    /// Serial connection
    #[serde(default)]
    pub serial: Option<SerialParams>,
    /// HTTP endpoint
    #[serde(default)]
    pub http: Option<HttpParams>,
    /// Commands whose replies are logged after connecting
    #[serde(default)]
    pub get_config: Vec<String>,
    /// Commands sent once at startup
    #[serde(default)]
    pub set_config: Vec<String>,
    /// Data request command; drivers fall back to their own default
    #[serde(default)]
    pub get_data: Option<String>,
    /// Seconds between instant readings averaged into one poll (Aurora 3000)
    #[serde(default)]
    pub instant_interval: Option<u32>,
    /// Minutes between polls
    pub sampling_interval: u32,
    /// Minutes between file rollovers
    pub reporting_interval: u32,
    /// Data subfolder below `paths.data`
    #[serde(default)]
    pub data_path: Option<PathBuf>,
    /// Staging subfolder below `paths.staging`
    #[serde(default)]
    pub staging_path: Option<PathBuf>,
    /// Remote subfolder below `sftp.remote_path`
    #[serde(default)]
    pub remote_path: Option<PathBuf>,
}

/// TCP socket parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SocketParams {
    /// Host name or address
    pub host: String,
    /// TCP port
    pub port: u16,
    /// Reply timeout in seconds
    #[serde(default = "default_io_timeout")]
    pub timeout: f64,
    /// Pause between sending a command and reading the reply, in seconds
    #[serde(default = "default_socket_sleep")]
    pub sleep: f64,
}

/// Serial line parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerialParams {
    /// Device path, e.g. `/dev/ttyUSB0`
    pub port: String,
    /// Baud rate
    #[serde(default = "default_baudrate")]
    pub baudrate: u32,
    /// Data bits (5-8)
    #[serde(default = "default_bytesize")]
    pub bytesize: u8,
    /// Parity: N, E or O
    #[serde(default = "default_parity")]
    pub parity: String,
    /// Stop bits (1 or 2)
    #[serde(default = "default_stopbits")]
    pub stopbits: u8,
    /// Reply timeout in seconds
    #[serde(default = "default_io_timeout")]
    pub timeout: f64,
}

/// HTTP endpoint parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpParams {
    /// Full URL returning the instrument's JSON document
    pub url: String,
    /// Request timeout in seconds
    #[serde(default = "default_http_timeout")]
    pub timeout: f64,
}

// Default value functions
fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

fn default_staging_dir() -> PathBuf {
    PathBuf::from("staging")
}

fn default_logging_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_log_file() -> String {
    "station-daq.log".to_string()
}

fn default_level_console() -> String {
    "info".to_string()
}

fn default_level_file() -> String {
    "warning".to_string()
}

fn default_sftp_port() -> u16 {
    22
}

fn default_transfer_interval() -> u32 {
    10
}

fn default_true() -> bool {
    true
}

fn default_settle_delay() -> Duration {
    Duration::from_secs(5)
}

fn default_shutdown_grace() -> Duration {
    Duration::from_secs(10)
}

fn default_reconnect_threshold() -> u32 {
    3
}

fn default_max_reconnect_attempts() -> u32 {
    5
}

fn default_restart_delay() -> Duration {
    Duration::from_secs(60)
}

fn default_lock_file() -> PathBuf {
    PathBuf::from("station-daq.lock")
}

fn default_io_timeout() -> f64 {
    5.0
}

fn default_socket_sleep() -> f64 {
    0.5
}

fn default_baudrate() -> u32 {
    9600
}

fn default_bytesize() -> u8 {
    8
}

fn default_parity() -> String {
    "N".to_string()
}

fn default_stopbits() -> u8 {
    1
}

fn default_http_timeout() -> f64 {
    10.0
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            file_name: default_log_file(),
            level_console: default_level_console(),
            level_file: default_level_file(),
        }
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            interval: default_transfer_interval(),
            trigger_on_stage: true,
            settle_delay: default_settle_delay(),
            backend: TransferBackend::default(),
            archive_path: None,
            compress: false,
        }
    }
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            shutdown_grace: default_shutdown_grace(),
            reconnect_threshold: default_reconnect_threshold(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            restart_delay: default_restart_delay(),
            max_restarts: None,
            lock_file: default_lock_file(),
        }
    }
}

/// Expands a leading `~` to the user's home directory.
pub fn expand_tilde(path: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => match dirs::home_dir() {
            Some(home) => home.join(rest),
            None => path.to_path_buf(),
        },
        Err(_) => path.to_path_buf(),
    }
}

impl StationConfig {
    /// Load configuration from a YAML file and environment variables
    pub fn load_from<P: AsRef<Path>>(path: P) -> DaqResult<Self> {
        Self::from_figment(
            Figment::new()
                .merge(Yaml::file(path.as_ref()))
                .merge(Env::prefixed(ENV_PREFIX).split("__")),
        )
    }

    /// Parse configuration from an in-memory YAML document (no environment overrides)
    pub fn from_yaml_str(yaml: &str) -> DaqResult<Self> {
        Self::from_figment(Figment::new().merge(Yaml::string(yaml)))
    }

    fn from_figment(figment: Figment) -> DaqResult<Self> {
        let mut config: StationConfig = figment.extract()?;
        config.paths.root = expand_tilde(&config.paths.root);
        if let Some(sftp) = config.sftp.as_mut() {
            sftp.key = expand_tilde(&sftp.key);
        }
        if let Some(archive) = config.transfer.archive_path.as_mut() {
            *archive = expand_tilde(archive);
        }
        Ok(config)
    }

    /// Force every instrument into simulate mode when the station flag is set
    pub fn apply_simulate(&mut self, simulate: bool) {
        self.simulate |= simulate;
        if self.simulate {
            for instrument in &mut self.instruments {
                instrument.simulate = true;
            }
        }
    }

    /// Validate station-wide settings. Errors here are fatal at startup.
    ///
    /// Instrument entries are validated separately so one broken instrument
    /// does not prevent the others from starting.
    pub fn validate(&self) -> DaqResult<()> {
        let root = self.paths.root.to_string_lossy();
        validation::is_valid_path(&root)
            .map_err(|e| DaqError::Configuration(format!("paths.root: {e}")))?;

        for (key, level) in [
            ("logging.level_console", &self.logging.level_console),
            ("logging.level_file", &self.logging.level_file),
        ] {
            if !LOG_LEVELS.contains(&level.to_lowercase().as_str()) {
                return Err(DaqError::Configuration(format!(
                    "Invalid {key} '{level}'. Must be one of: {}",
                    LOG_LEVELS.join(", ")
                )));
            }
        }

        if self.transfer.interval == 0 {
            return Err(DaqError::Configuration(
                "transfer.interval must be greater than 0".into(),
            ));
        }

        if self.data_dir() == self.staging_dir() {
            return Err(DaqError::Configuration(
                "paths.data and paths.staging must differ".into(),
            ));
        }

        if let Some(sftp) = &self.sftp {
            validation::is_not_empty(&sftp.host)
                .map_err(|e| DaqError::Configuration(format!("sftp.host: {e}")))?;
            validation::is_valid_port(sftp.port)
                .map_err(|e| DaqError::Configuration(format!("sftp.port: {e}")))?;
            if let Some(proxy) = &sftp.proxy {
                validation::is_valid_port(proxy.port)
                    .map_err(|e| DaqError::Configuration(format!("sftp.proxy.port: {e}")))?;
            }
        }

        if self.transfer.backend == TransferBackend::Local && self.transfer.archive_path.is_none()
        {
            return Err(DaqError::Configuration(
                "transfer.backend 'local' requires transfer.archive_path".into(),
            ));
        }

        Ok(())
    }

    /// Directory holding per-instrument data folders
    pub fn data_dir(&self) -> PathBuf {
        self.paths.root.join(&self.paths.data)
    }

    /// Directory holding per-instrument staging folders
    pub fn staging_dir(&self) -> PathBuf {
        self.paths.root.join(&self.paths.staging)
    }

    /// Full path of the log file
    pub fn log_file(&self) -> PathBuf {
        self.paths
            .root
            .join(&self.paths.logging)
            .join(&self.logging.file_name)
    }

    /// Full path of the instance lock file
    pub fn lock_file(&self) -> PathBuf {
        self.paths.root.join(&self.daemon.lock_file)
    }

    /// Look up an instrument by name
    pub fn instrument(&self, name: &str) -> Option<&InstrumentConfig> {
        self.instruments.iter().find(|inst| inst.name == name)
    }
}

impl InstrumentConfig {
    /// Driver kind: the last dotted segment of `class`, lowercased
    pub fn kind(&self) -> String {
        self.class
            .rsplit('.')
            .next()
            .unwrap_or_default()
            .trim()
            .to_lowercase()
    }

    /// Time between polls
    pub fn sampling_period(&self) -> Duration {
        Duration::from_secs(u64::from(self.params.sampling_interval) * 60)
    }

    /// Time between file rollovers
    pub fn reporting_period(&self) -> Duration {
        Duration::from_secs(u64::from(self.params.reporting_interval) * 60)
    }

    /// Reply timeout of whichever transport is configured
    pub fn io_timeout(&self) -> Duration {
        let secs = if let Some(socket) = &self.params.socket {
            socket.timeout
        } else if let Some(serial) = &self.params.serial {
            serial.timeout
        } else if let Some(http) = &self.params.http {
            http.timeout
        } else {
            default_io_timeout()
        };
        Duration::from_secs_f64(secs.max(0.0))
    }

    /// Data subfolder, defaulting to the instrument name
    pub fn data_subdir(&self) -> PathBuf {
        self.params
            .data_path
            .clone()
            .unwrap_or_else(|| PathBuf::from(&self.name))
    }

    /// Staging subfolder, defaulting to the instrument name
    pub fn staging_subdir(&self) -> PathBuf {
        self.params
            .staging_path
            .clone()
            .unwrap_or_else(|| PathBuf::from(&self.name))
    }

    /// Remote subfolder, defaulting to the staging subfolder
    pub fn remote_subdir(&self) -> PathBuf {
        self.params
            .remote_path
            .clone()
            .unwrap_or_else(|| self.staging_subdir())
    }

    /// Validate this instrument in isolation.
    pub fn validate(&self) -> DaqResult<()> {
        let fail = |msg: String| DaqError::Configuration(format!("instrument '{}': {msg}", self.name));

        validation::is_not_empty(&self.name).map_err(|e| fail(format!("name: {e}")))?;
        validation::is_not_empty(&self.kind()).map_err(|e| fail(format!("class: {e}")))?;
        validation::is_interval_multiple(
            self.params.sampling_interval,
            self.params.reporting_interval,
        )
        .map_err(fail)?;

        if let Some(secs) = self.params.instant_interval {
            let period = self.sampling_period().as_secs();
            if secs == 0 || u64::from(secs) >= period {
                return Err(fail(format!(
                    "params.instant_interval must be between 1 and {} seconds",
                    period.saturating_sub(1)
                )));
            }
        }

        for (key, sub) in [
            ("data_path", self.data_subdir()),
            ("staging_path", self.staging_subdir()),
        ] {
            if sub.is_absolute() {
                return Err(fail(format!("{key} must be relative")));
            }
            validation::is_valid_path(&sub.to_string_lossy())
                .map_err(|e| fail(format!("{key}: {e}")))?;
        }

        let transports = [
            self.params.socket.is_some(),
            self.params.serial.is_some(),
            self.params.http.is_some(),
        ]
        .iter()
        .filter(|set| **set)
        .count();
        if transports > 1 {
            return Err(fail(
                "only one of params.socket, params.serial, params.http may be set".into(),
            ));
        }
        if transports == 0 && !self.simulate {
            return Err(fail(
                "one of params.socket, params.serial, params.http is required".into(),
            ));
        }

        if let Some(socket) = &self.params.socket {
            validation::is_not_empty(&socket.host).map_err(|e| fail(format!("socket.host: {e}")))?;
            validation::is_valid_port(socket.port).map_err(|e| fail(format!("socket.port: {e}")))?;
            validation::is_in_range(socket.timeout, 0.1..=600.0)
                .map_err(|e| fail(format!("socket.timeout: {e}")))?;
        }
        if let Some(serial) = &self.params.serial {
            validation::is_valid_path(&serial.port).map_err(|e| fail(format!("serial.port: {e}")))?;
            validation::is_in_range(serial.bytesize, 5..=8)
                .map_err(|e| fail(format!("serial.bytesize: {e}")))?;
            validation::is_in_range(serial.stopbits, 1..=2)
                .map_err(|e| fail(format!("serial.stopbits: {e}")))?;
            if !["N", "E", "O"].contains(&serial.parity.to_uppercase().as_str()) {
                return Err(fail(format!("serial.parity '{}' must be N, E or O", serial.parity)));
            }
            validation::is_in_range(serial.timeout, 0.1..=600.0)
                .map_err(|e| fail(format!("serial.timeout: {e}")))?;
        }
        if let Some(http) = &self.params.http {
            validation::is_not_empty(&http.url).map_err(|e| fail(format!("http.url: {e}")))?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const STATION_YAML: &str = r#"
paths:
  root: /tmp/station
logging:
  level_console: debug
  level_file: WARNING
sftp:
  host: archive.example.org
  usr: daq
  key: ~/.ssh/id_rsa
  remote_path: /data/station
  proxy:
    socks5: localhost
    port: 1080
daemon:
  restart_delay: 30s
instruments:
  - name: thermo-49i
    class: instr.thermo.Thermo49i
    params:
      id: 49
      socket:
        host: 192.168.0.20
        port: 9880
        timeout: 5
      get_config: ["mode", "gas unit"]
      set_config: ["set mode remote"]
      get_data: lrec
      sampling_interval: 1
      reporting_interval: 60
      staging_path: o3
"#;

    fn parse() -> StationConfig {
        StationConfig::from_yaml_str(STATION_YAML).unwrap()
    }

    #[test]
    fn test_parse_station_yaml() {
        let config = parse();
        assert!(config.validate().is_ok());
        assert_eq!(config.data_dir(), PathBuf::from("/tmp/station/data"));
        assert_eq!(config.staging_dir(), PathBuf::from("/tmp/station/staging"));
        assert_eq!(config.daemon.restart_delay, Duration::from_secs(30));
        assert_eq!(config.daemon.reconnect_threshold, 3);
        assert_eq!(config.transfer.backend, TransferBackend::Sftp);

        let sftp = config.sftp.as_ref().unwrap();
        assert_eq!(sftp.port, 22);
        assert!(!sftp.key.starts_with("~"));
        assert_eq!(sftp.proxy.as_ref().unwrap().port, 1080);

        let inst = config.instrument("thermo-49i").unwrap();
        assert_eq!(inst.kind(), "thermo49i");
        assert_eq!(inst.sampling_period(), Duration::from_secs(60));
        assert_eq!(inst.reporting_period(), Duration::from_secs(3600));
        assert_eq!(inst.data_subdir(), PathBuf::from("thermo-49i"));
        assert_eq!(inst.staging_subdir(), PathBuf::from("o3"));
        assert_eq!(inst.remote_subdir(), PathBuf::from("o3"));
        assert_eq!(inst.io_timeout(), Duration::from_secs(5));
        assert!(inst.validate().is_ok());
    }

    #[test]
    fn test_rejects_non_multiple_intervals() {
        let mut config = parse();
        config.instruments[0].params.sampling_interval = 7;
        let err = config.instruments[0].validate().unwrap_err();
        assert!(err.to_string().contains("multiple"));
    }

    #[test]
    fn test_invalid_log_level() {
        let mut config = parse();
        config.logging.level_console = "chatty".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_missing_transport_requires_simulate() {
        let mut config = parse();
        config.instruments[0].params.socket = None;
        assert!(config.instruments[0].validate().is_err());

        config.apply_simulate(true);
        assert!(config.instruments[0].simulate);
        assert!(config.instruments[0].validate().is_ok());
    }

    #[test]
    fn test_local_backend_requires_archive() {
        let mut config = parse();
        config.transfer.backend = TransferBackend::Local;
        assert!(config.validate().is_err());
        config.transfer.archive_path = Some(PathBuf::from("/mnt/archive"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_expand_tilde() {
        let plain = PathBuf::from("/etc/station");
        assert_eq!(expand_tilde(&plain), plain);
        if let Some(home) = dirs::home_dir() {
            assert_eq!(expand_tilde(Path::new("~/keys/id")), home.join("keys/id"));
        }
    }
}
