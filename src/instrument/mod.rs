//! Instrument drivers.
//!
//! Every instrument class implements [`InstrumentDriver`], the capability set
//! `{connect, configure, poll, disconnect}`. A driver owns its connection: the
//! sampler calls [`InstrumentDriver::connect`] once and then polls the same
//! driver until it decides to reconnect.
//!
//! Drivers are selected by configuration through the [`registry`]; nothing
//! outside the registry branches on class names.
//!
//! | Kind          | Transport     | Instrument                          |
//! |---------------|---------------|-------------------------------------|
//! | `thermo49i`   | TCP or serial | Thermo Scientific 49i ozone analyzer |
//! | `thermo49c`   | serial        | Thermo Scientific 49C ozone analyzer |
//! | `ae31`        | serial        | Magee AE31 aethalometer              |
//! | `aurora3000`  | serial        | Ecotech Aurora 3000 nephelometer     |
//! | `fidas`       | TCP           | Palas Fidas particle counter         |
//! | `avo`         | HTTP          | IQAir AirVisual Outdoor              |

pub mod ae31;
pub mod aurora;
pub mod avo;
pub mod fidas;
pub mod registry;
pub mod simulated;
pub mod thermo;
pub mod transport;

use crate::config::InstrumentConfig;
use crate::error::DaqResult;
use crate::measurement::Reading;
use async_trait::async_trait;
use std::time::Duration;

/// Per-instrument settings every driver carries.
#[derive(Debug, Clone)]
pub struct DriverSettings {
    /// Instrument name
    pub name: String,
    /// Commands whose replies are logged after connecting
    pub get_config: Vec<String>,
    /// Commands sent once at startup
    pub set_config: Vec<String>,
    /// Data request command
    pub get_data: String,
    /// Reply timeout
    pub timeout: Duration,
}

impl DriverSettings {
    /// Settings from configuration, with `default_get_data` when none is configured
    pub fn from_config(config: &InstrumentConfig, default_get_data: &str) -> Self {
        Self {
            name: config.name.clone(),
            get_config: config.params.get_config.clone(),
            set_config: config.params.set_config.clone(),
            get_data: config
                .params
                .get_data
                .clone()
                .unwrap_or_else(|| default_get_data.to_string()),
            timeout: config.io_timeout(),
        }
    }
}

/// Outcome of a configuration command sequence.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConfigureReport {
    /// Commands acknowledged, with their replies
    pub applied: Vec<(String, String)>,
    /// Commands that failed, with the reason
    pub failed: Vec<(String, String)>,
}

impl ConfigureReport {
    /// True when every command was acknowledged
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Capability contract for all instrument classes.
#[async_trait]
pub trait InstrumentDriver: Send {
    /// Driver kind as registered, e.g. `thermo49i`
    fn driver_type(&self) -> &'static str;

    /// Settings of this instrument
    fn settings(&self) -> &DriverSettings;

    /// Instrument name
    fn name(&self) -> &str {
        &self.settings().name
    }

    /// Whether a connection is currently open
    fn is_connected(&self) -> bool;

    /// Open the transport. One attempt; the caller decides about retries.
    async fn connect(&mut self) -> DaqResult<()>;

    /// Send one raw command and return the cleaned reply.
    async fn send_command(&mut self, command: &str) -> DaqResult<String>;

    /// Check a configuration reply. The default rejects empty replies and
    /// replies the instrument flags as unknown commands.
    fn check_ack(&self, command: &str, reply: &str) -> Result<(), String> {
        let lowered = reply.to_lowercase();
        if lowered.contains("bad cmd") || lowered.contains("invalid") {
            Err(format!("'{command}' rejected: {reply}"))
        } else {
            Ok(())
        }
    }

    /// Send the `get_config` commands and return their replies.
    async fn read_config(&mut self) -> Vec<(String, DaqResult<String>)> {
        let commands = self.settings().get_config.clone();
        let mut replies = Vec::with_capacity(commands.len());
        for command in commands {
            let reply = self.send_command(&command).await;
            replies.push((command, reply));
        }
        replies
    }

    /// Apply a configuration sequence. Failures are recorded and the
    /// remaining commands are still sent.
    async fn configure(&mut self, commands: &[String]) -> ConfigureReport {
        apply_commands(self, commands).await
    }

    /// Request and parse one reading.
    async fn poll(&mut self) -> DaqResult<Reading>;

    /// Close the connection. Never fails.
    async fn disconnect(&mut self);
}

/// Send `commands` in order, checking each acknowledgement.
pub async fn apply_commands<D>(driver: &mut D, commands: &[String]) -> ConfigureReport
where
    D: InstrumentDriver + ?Sized,
{
    let mut report = ConfigureReport::default();
    for command in commands {
        match driver.send_command(command).await {
            Ok(reply) => match driver.check_ack(command, &reply) {
                Ok(()) => {
                    tracing::info!(instrument = %driver.name(), command = %command, reply = %reply, "configuration applied");
                    report.applied.push((command.clone(), reply));
                }
                Err(reason) => {
                    tracing::warn!(instrument = %driver.name(), command = %command, "{reason}");
                    report.failed.push((command.clone(), reason));
                }
            },
            Err(err) => {
                tracing::warn!(instrument = %driver.name(), command = %command, error = %err, "configuration command failed");
                report.failed.push((command.clone(), err.to_string()));
            }
        }
    }
    report
}
