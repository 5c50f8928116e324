//! Tracing infrastructure for the daemon.
//!
//! Two `tracing-subscriber` layers are installed side by side:
//! - a console layer, filtered by `logging.level_console` (or `RUST_LOG` when set)
//! - a file layer appending to `paths.root/paths.logging/logging.file_name`,
//!   filtered independently by `logging.level_file`
//!
//! Level names accept the usual tracing names plus `warning` and `critical`,
//! which map to `WARN` and `ERROR`.
//!
//! # Example
//! ```no_run
//! use station_daq::{config::StationConfig, logging};
//! use tracing::{info, warn};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = StationConfig::load_from("station.yaml")?;
//! logging::init_from_config(&config)?;
//!
//! info!("station started");
//! warn!(instrument = "thermo-49i", "poll timed out");
//! # Ok(())
//! # }
//! ```

use crate::config::StationConfig;
use crate::error::{DaqError, DaqResult};
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::Mutex;
use tracing::Level;
use tracing_subscriber::{
    filter::LevelFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer,
};

/// Logging setup options
#[derive(Debug, Clone)]
pub struct LoggingSetup {
    /// Console level
    pub console_level: Level,
    /// Log file and its level; no file layer when `None`
    pub file: Option<(PathBuf, Level)>,
    /// Whether to enable ANSI colors on the console
    pub with_ansi: bool,
}

impl Default for LoggingSetup {
    fn default() -> Self {
        Self {
            console_level: Level::INFO,
            file: None,
            with_ansi: true,
        }
    }
}

impl LoggingSetup {
    /// Create logging setup from station configuration
    pub fn from_config(config: &StationConfig) -> DaqResult<Self> {
        let console_level = parse_log_level(&config.logging.level_console)?;
        let file_level = parse_log_level(&config.logging.level_file)?;
        Ok(Self {
            console_level,
            file: Some((config.log_file(), file_level)),
            ..Default::default()
        })
    }

    /// Console-only setup at the given level
    pub fn console(level: Level) -> Self {
        Self {
            console_level: level,
            ..Default::default()
        }
    }
}

/// Initialize tracing from station configuration
pub fn init_from_config(config: &StationConfig) -> DaqResult<()> {
    init(LoggingSetup::from_config(config)?)
}

/// Initialize tracing with custom setup.
///
/// Idempotent: if a global subscriber is already installed this returns
/// `Ok(())` and the existing subscriber stays in place.
pub fn init(setup: LoggingSetup) -> DaqResult<()> {
    let console_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level_to_filter_string(setup.console_level)));

    let console_layer = fmt::layer()
        .compact()
        .with_target(true)
        .with_ansi(setup.with_ansi)
        .with_filter(console_filter);

    let file_layer = match setup.file {
        Some((path, level)) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let file = OpenOptions::new().create(true).append(true).open(&path)?;
            Some(
                fmt::layer()
                    .with_writer(Mutex::new(file))
                    .with_ansi(false)
                    .with_target(true)
                    .with_filter(LevelFilter::from_level(level)),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .or_else(|e| {
            if e
                .to_string()
                .contains("a global default trace dispatcher has already been set")
            {
                Ok(())
            } else {
                Err(DaqError::Configuration(format!(
                    "Failed to initialize tracing: {e}"
                )))
            }
        })
}

/// Parse a level name into a tracing level
pub fn parse_log_level(level: &str) -> DaqResult<Level> {
    match level.to_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" | "warning" => Ok(Level::WARN),
        "error" | "critical" => Ok(Level::ERROR),
        _ => Err(DaqError::Configuration(format!(
            "Invalid log level '{level}'. Must be one of: trace, debug, info, warn, error"
        ))),
    }
}

fn level_to_filter_string(level: Level) -> &'static str {
    match level {
        Level::TRACE => "trace",
        Level::DEBUG => "debug",
        Level::INFO => "info",
        Level::WARN => "warn",
        Level::ERROR => "error",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_log_level() {
        assert_eq!(parse_log_level("trace").unwrap(), Level::TRACE);
        assert_eq!(parse_log_level("DEBUG").unwrap(), Level::DEBUG);
        assert_eq!(parse_log_level("Info").unwrap(), Level::INFO);
        assert_eq!(parse_log_level("warning").unwrap(), Level::WARN);
        assert_eq!(parse_log_level("CRITICAL").unwrap(), Level::ERROR);
        assert!(parse_log_level("verbose").is_err());
    }

    #[test]
    fn test_setup_from_config() {
        let config = StationConfig::from_yaml_str(
            "paths:\n  root: /srv/station\nlogging:\n  level_console: debug\n",
        )
        .unwrap();
        let setup = LoggingSetup::from_config(&config).unwrap();
        assert_eq!(setup.console_level, Level::DEBUG);
        let (path, level) = setup.file.unwrap();
        assert_eq!(path, PathBuf::from("/srv/station/logs/station-daq.log"));
        assert_eq!(level, Level::WARN);
    }
}
