//! Driver registry.
//!
//! Maps the driver kind declared in configuration (the last segment of
//! `class`, lowercased) to a [`DriverFactory`]. New instrument classes are
//! added by registering another factory; the scheduler only ever asks the
//! registry for a boxed [`InstrumentDriver`].
//!
//! When an instrument is configured with `simulate: true` the registry builds a
//! [`SimulatedDriver`] that reports the factory's field names instead.

use super::ae31::{self, Ae31Driver};
use super::aurora::{self, AuroraDriver};
use super::avo::{self, AvoDriver};
use super::fidas::{self, FidasDriver};
use super::simulated::SimulatedDriver;
use super::thermo::{self, ThermoDriver};
use super::InstrumentDriver;
use crate::config::InstrumentConfig;
use crate::error::{DaqError, DaqResult};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Trait for driver factories that create instrument drivers.
///
/// Factories are registered once at startup and live for the program's lifetime.
/// They must be `Send + Sync + 'static` because they may be called from any task.
pub trait DriverFactory: Send + Sync + 'static {
    /// Driver kind used in configuration, e.g. `thermo49i`
    fn driver_type(&self) -> &'static str;

    /// Human-readable name for documentation and error messages
    fn name(&self) -> &'static str;

    /// Field names a reading from this instrument carries
    fn fields(&self) -> &'static [&'static str];

    /// Validate configuration without instantiating.
    fn validate(&self, config: &InstrumentConfig) -> DaqResult<()>;

    /// Create the driver. No I/O happens until `connect`.
    fn build(&self, config: &InstrumentConfig) -> Box<dyn InstrumentDriver>;
}

fn require(config: &InstrumentConfig, ok: bool, what: &str) -> DaqResult<()> {
    if ok || config.simulate {
        Ok(())
    } else {
        Err(DaqError::Configuration(format!(
            "instrument '{}' ({}): {what}",
            config.name, config.class
        )))
    }
}

struct ThermoFactory {
    kind: &'static str,
    name: &'static str,
    allow_socket: bool,
}

impl DriverFactory for ThermoFactory {
    fn driver_type(&self) -> &'static str {
        self.kind
    }

    fn name(&self) -> &'static str {
        self.name
    }

    fn fields(&self) -> &'static [&'static str] {
        thermo::LREC_FIELDS
    }

    fn validate(&self, config: &InstrumentConfig) -> DaqResult<()> {
        let p = &config.params;
        if self.allow_socket {
            require(config, p.socket.is_some() || p.serial.is_some(), "needs params.socket or params.serial")?;
        } else {
            require(config, p.serial.is_some(), "needs params.serial")?;
        }
        if p.id.is_some_and(|id| id >= 128) {
            return Err(DaqError::Configuration(format!(
                "instrument '{}': params.id must be below 128",
                config.name
            )));
        }
        Ok(())
    }

    fn build(&self, config: &InstrumentConfig) -> Box<dyn InstrumentDriver> {
        Box::new(ThermoDriver::new(config, self.kind))
    }
}

struct Ae31Factory;

impl DriverFactory for Ae31Factory {
    fn driver_type(&self) -> &'static str {
        "ae31"
    }

    fn name(&self) -> &'static str {
        "Magee Scientific AE31 Aethalometer"
    }

    fn fields(&self) -> &'static [&'static str] {
        &ae31::COLUMNS[3..11]
    }

    fn validate(&self, config: &InstrumentConfig) -> DaqResult<()> {
        require(config, config.params.serial.is_some(), "needs params.serial")
    }

    fn build(&self, config: &InstrumentConfig) -> Box<dyn InstrumentDriver> {
        Box::new(Ae31Driver::new(config))
    }
}

struct AuroraFactory;

impl DriverFactory for AuroraFactory {
    fn driver_type(&self) -> &'static str {
        "aurora3000"
    }

    fn name(&self) -> &'static str {
        "Ecotech Aurora 3000 Nephelometer"
    }

    fn fields(&self) -> &'static [&'static str] {
        aurora::FIELDS
    }

    fn validate(&self, config: &InstrumentConfig) -> DaqResult<()> {
        require(config, config.params.serial.is_some(), "needs params.serial")
    }

    fn build(&self, config: &InstrumentConfig) -> Box<dyn InstrumentDriver> {
        Box::new(AuroraDriver::new(config))
    }
}

struct FidasFactory;

impl DriverFactory for FidasFactory {
    fn driver_type(&self) -> &'static str {
        "fidas"
    }

    fn name(&self) -> &'static str {
        "Palas Fidas Particle Counter"
    }

    fn fields(&self) -> &'static [&'static str] {
        fidas::DEFAULT_FIELDS
    }

    fn validate(&self, config: &InstrumentConfig) -> DaqResult<()> {
        require(config, config.params.socket.is_some(), "needs params.socket")
    }

    fn build(&self, config: &InstrumentConfig) -> Box<dyn InstrumentDriver> {
        Box::new(FidasDriver::new(config))
    }
}

struct AvoFactory;

impl DriverFactory for AvoFactory {
    fn driver_type(&self) -> &'static str {
        "avo"
    }

    fn name(&self) -> &'static str {
        "IQAir AirVisual Outdoor"
    }

    fn fields(&self) -> &'static [&'static str] {
        avo::DEFAULT_FIELDS
    }

    fn validate(&self, config: &InstrumentConfig) -> DaqResult<()> {
        require(config, config.params.http.is_some(), "needs params.http")
    }

    fn build(&self, config: &InstrumentConfig) -> Box<dyn InstrumentDriver> {
        Box::new(AvoDriver::new(config))
    }
}

/// Registry of driver factories keyed by driver kind.
#[derive(Clone, Default)]
pub struct DriverRegistry {
    factories: BTreeMap<&'static str, Arc<dyn DriverFactory>>,
}

impl std::fmt::Debug for DriverRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriverRegistry")
            .field("kinds", &self.kinds())
            .finish()
    }
}

impl DriverRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every built-in driver
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register(ThermoFactory {
            kind: "thermo49i",
            name: "Thermo Scientific 49i Ozone Analyzer",
            allow_socket: true,
        });
        registry.register(ThermoFactory {
            kind: "thermo49c",
            name: "Thermo Scientific 49C Ozone Analyzer",
            allow_socket: false,
        });
        registry.register(Ae31Factory);
        registry.register(AuroraFactory);
        registry.register(FidasFactory);
        registry.register(AvoFactory);
        registry
    }

    /// Register a factory, replacing any factory of the same kind
    pub fn register<F: DriverFactory>(&mut self, factory: F) {
        self.factories.insert(factory.driver_type(), Arc::new(factory));
    }

    /// Registered kinds, sorted
    pub fn kinds(&self) -> Vec<&'static str> {
        self.factories.keys().copied().collect()
    }

    /// Factory for `config`
    pub fn factory(&self, config: &InstrumentConfig) -> DaqResult<Arc<dyn DriverFactory>> {
        let kind = config.kind();
        self.factories.get(kind.as_str()).cloned().ok_or_else(|| {
            DaqError::Configuration(format!(
                "instrument '{}': unknown class '{}' (known: {})",
                config.name,
                config.class,
                self.kinds().join(", ")
            ))
        })
    }

    /// Validate `config` intrinsically and against its driver.
    pub fn validate(&self, config: &InstrumentConfig) -> DaqResult<()> {
        config.validate()?;
        self.factory(config)?.validate(config)
    }

    /// Build the driver for `config`, simulated when requested.
    pub fn build(&self, config: &InstrumentConfig) -> DaqResult<Box<dyn InstrumentDriver>> {
        let factory = self.factory(config)?;
        if config.simulate {
            Ok(Box::new(SimulatedDriver::new(
                config,
                factory.driver_type(),
                factory.fields(),
            )))
        } else {
            Ok(factory.build(config))
        }
    }
}
