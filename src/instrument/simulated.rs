//! Simulated driver for dry runs and resilience tests.
//!
//! Produces readings with the same field names as the real driver it stands
//! in for, without any transport. Faults can be scripted per poll and per
//! connect attempt to exercise the sampler's recovery paths.

use super::{DriverSettings, InstrumentDriver};
use crate::config::InstrumentConfig;
use crate::error::{DaqError, DaqResult};
use crate::measurement::Reading;
use async_trait::async_trait;
use chrono::Utc;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::VecDeque;

/// Scripted outcome of one simulated operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Wait the full reply timeout, then fail with `Timeout`
    Timeout,
    /// Fail immediately with `Protocol`
    Malformed,
    /// Fail immediately with `Connection`
    Refused,
    /// Never complete
    Hang,
}

/// Driver that synthesizes readings.
#[derive(Debug)]
pub struct SimulatedDriver {
    settings: DriverSettings,
    kind: &'static str,
    fields: Vec<String>,
    rng: StdRng,
    connected: bool,
    poll_script: VecDeque<Option<Fault>>,
    connect_script: VecDeque<Option<Fault>>,
}

impl SimulatedDriver {
    /// Simulated stand-in for `kind` producing `fields`
    pub fn new(config: &InstrumentConfig, kind: &'static str, fields: &[&str]) -> Self {
        let fields = if fields.is_empty() {
            vec!["value".to_string()]
        } else {
            fields.iter().map(|f| f.to_string()).collect()
        };
        Self {
            settings: DriverSettings::from_config(config, "simulate"),
            kind,
            fields,
            rng: StdRng::from_entropy(),
            connected: false,
            poll_script: VecDeque::new(),
            connect_script: VecDeque::new(),
        }
    }

    /// Use a fixed seed for reproducible values
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    /// Script the next polls; `None` entries succeed. Afterwards polls succeed.
    pub fn with_poll_script(mut self, script: impl IntoIterator<Item = Option<Fault>>) -> Self {
        self.poll_script = script.into_iter().collect();
        self
    }

    /// Script the next connect attempts; `None` entries succeed.
    pub fn with_connect_script(mut self, script: impl IntoIterator<Item = Option<Fault>>) -> Self {
        self.connect_script = script.into_iter().collect();
        self
    }

    async fn inject(&self, fault: Fault) -> DaqError {
        match fault {
            Fault::Timeout => {
                tokio::time::sleep(self.settings.timeout).await;
                DaqError::timeout(&self.settings.name, self.settings.timeout)
            }
            Fault::Malformed => DaqError::protocol(&self.settings.name, "simulated malformed reply"),
            Fault::Refused => DaqError::connection(&self.settings.name, "simulated connection refused"),
            Fault::Hang => {
                std::future::pending::<()>().await;
                DaqError::timeout(&self.settings.name, self.settings.timeout)
            }
        }
    }
}

#[async_trait]
impl InstrumentDriver for SimulatedDriver {
    fn driver_type(&self) -> &'static str {
        self.kind
    }

    fn settings(&self) -> &DriverSettings {
        &self.settings
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    async fn connect(&mut self) -> DaqResult<()> {
        if let Some(Some(fault)) = self.connect_script.pop_front() {
            return Err(self.inject(fault).await);
        }
        self.connected = true;
        tracing::debug!(instrument = %self.settings.name, "simulated connection opened");
        Ok(())
    }

    async fn send_command(&mut self, command: &str) -> DaqResult<String> {
        Ok(format!("{command} ok"))
    }

    async fn poll(&mut self) -> DaqResult<Reading> {
        if !self.connected {
            return Err(DaqError::connection(&self.settings.name, "not connected"));
        }
        if let Some(Some(fault)) = self.poll_script.pop_front() {
            return Err(self.inject(fault).await);
        }
        let mut reading = Reading::new(Utc::now());
        for field in &self.fields {
            let value: f64 = self.rng.gen_range(0.0..100.0);
            reading.push(field.clone(), (value * 1000.0).round() / 1000.0);
        }
        Ok(reading)
    }

    async fn disconnect(&mut self) {
        self.connected = false;
    }
}
