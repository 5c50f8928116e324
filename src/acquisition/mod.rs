//! Per-instrument acquisition pipeline.
//!
//! An [`AcquisitionUnit`] pairs a [`sampler::Sampler`] with its
//! [`reporter::Reporter`]. Both run concurrently; the reporter drains every
//! sealed window before the unit finishes, so a shutdown flush reaches disk.

pub mod buffer;
pub mod reporter;
pub mod sampler;

use crate::clock::Clock;
use crate::config::{InstrumentConfig, StationConfig};
use crate::data::stager::Stager;
use crate::error::DaqResult;
use crate::error_recovery::ReconnectPolicy;
use crate::instrument::InstrumentDriver;
use buffer::{ReadingBuffer, SealedWindow};
use reporter::Reporter;
use sampler::{Sampler, SamplerStats};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Summary of a finished unit run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnitReport {
    /// Sampler counters
    pub sampler: SamplerStats,
    /// Data files written
    pub files: usize,
}

/// Sampler and reporter of one instrument.
#[derive(Debug)]
pub struct AcquisitionUnit {
    sampler: Sampler,
    reporter: Reporter,
    windows: mpsc::UnboundedReceiver<SealedWindow>,
}

impl AcquisitionUnit {
    /// Unit for `instrument` polling `driver`
    pub fn new(
        station: &StationConfig,
        instrument: &InstrumentConfig,
        driver: Box<dyn InstrumentDriver>,
        clock: Arc<dyn Clock>,
        stager: Stager,
    ) -> Self {
        let policy = ReconnectPolicy::from(&station.daemon);
        let (sampler, windows) = Sampler::new(instrument, driver, clock, policy);
        Self {
            sampler,
            reporter: Reporter::new(station, instrument, stager),
            windows,
        }
    }

    /// Live buffer of the sampler
    pub fn buffer(&self) -> Arc<ReadingBuffer> {
        self.sampler.buffer()
    }

    /// Run until cancelled. A degraded sampler ends the unit with an error
    /// after its last window has been reported.
    pub async fn run(self, cancel: CancellationToken) -> DaqResult<UnitReport> {
        let Self {
            sampler,
            reporter,
            windows,
        } = self;
        let (sampled, files) = tokio::join!(sampler.run(cancel), reporter.run(windows));
        Ok(UnitReport {
            sampler: sampled?,
            files,
        })
    }
}
