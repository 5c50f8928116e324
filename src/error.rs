//! Custom error types for the station daemon.
//!
//! `DaqError` is the single error type shared by every component. The variants
//! follow the recovery boundaries of the daemon:
//!
//! - **`Connection`**, **`Timeout`**, **`Protocol`**: instrument-level errors. The
//!   sampler recovers from these locally (log, skip the cycle, reconnect after a
//!   threshold of consecutive failures). See [`DaqError::is_instrument_error`].
//! - **`Degraded`**: raised when reconnecting failed repeatedly. It is the only
//!   instrument error that escapes a sampler, and the orchestrator restarts or
//!   halts that unit alone.
//! - **`Configuration`**: semantic configuration errors found during validation.
//!   At startup they are fatal only for the offending instrument.
//! - **`Config`**: wraps `figment` errors raised while parsing the YAML file.
//! - **`Transfer`**: a remote write failed or was rejected. The transfer manager
//!   keeps the file staged and retries on the next sync.
//! - **`AlreadyRunning`**: the instance lock is held by another process.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Convenience alias for results using the daemon error type.
pub type DaqResult<T> = std::result::Result<T, DaqError>;

#[allow(missing_docs)]
#[derive(Error, Debug)]
pub enum DaqError {
    #[error("Connection error on '{instrument}': {message}")]
    Connection { instrument: String, message: String },

    #[error("Timeout on '{instrument}': no reply within {timeout:?}")]
    Timeout {
        instrument: String,
        timeout: Duration,
    },

    #[error("Protocol error on '{instrument}': {message}")]
    Protocol { instrument: String, message: String },

    #[error("Instrument '{instrument}' degraded after {attempts} failed reconnect attempts")]
    Degraded { instrument: String, attempts: u32 },

    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("Transfer error: {0}")]
    Transfer(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Archive error: {0}")]
    Archive(#[from] zip::result::ZipError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Feature '{0}' is not enabled. Please build with --features {0}")]
    FeatureNotEnabled(String),

    #[error("Another instance is already running (lock held on {})", .0.display())]
    AlreadyRunning(PathBuf),
}

impl From<figment::Error> for DaqError {
    fn from(value: figment::Error) -> Self {
        DaqError::Config(Box::new(value))
    }
}

impl DaqError {
    /// Builds a [`DaqError::Connection`] for the given instrument.
    pub fn connection(instrument: &str, message: impl Into<String>) -> Self {
        DaqError::Connection {
            instrument: instrument.to_string(),
            message: message.into(),
        }
    }

    /// Builds a [`DaqError::Protocol`] for the given instrument.
    pub fn protocol(instrument: &str, message: impl Into<String>) -> Self {
        DaqError::Protocol {
            instrument: instrument.to_string(),
            message: message.into(),
        }
    }

    /// Builds a [`DaqError::Timeout`] for the given instrument.
    pub fn timeout(instrument: &str, timeout: Duration) -> Self {
        DaqError::Timeout {
            instrument: instrument.to_string(),
            timeout,
        }
    }

    /// True for the errors a sampler absorbs without escalating.
    pub fn is_instrument_error(&self) -> bool {
        matches!(
            self,
            DaqError::Connection { .. } | DaqError::Timeout { .. } | DaqError::Protocol { .. }
        )
    }

    /// True for [`DaqError::Timeout`].
    pub fn is_timeout(&self) -> bool {
        matches!(self, DaqError::Timeout { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_instrument_errors() {
        assert!(DaqError::connection("o3", "refused").is_instrument_error());
        assert!(DaqError::protocol("o3", "bad cmd").is_instrument_error());
        assert!(DaqError::timeout("o3", Duration::from_secs(5)).is_instrument_error());
        assert!(DaqError::timeout("o3", Duration::from_secs(5)).is_timeout());
        assert!(!DaqError::Transfer("rejected".into()).is_instrument_error());
        assert!(!DaqError::Degraded {
            instrument: "o3".into(),
            attempts: 5
        }
        .is_instrument_error());
    }

    #[test]
    fn messages_name_the_instrument() {
        let err = DaqError::protocol("ae31", "short line");
        assert_eq!(err.to_string(), "Protocol error on 'ae31': short line");

        let err = DaqError::AlreadyRunning(PathBuf::from("/var/lib/daq/station-daq.lock"));
        assert!(err.to_string().contains("station-daq.lock"));
    }
}
