//! Reporter: turns sealed windows into data files and stages them.
//!
//! The reporter runs next to its sampler and receives [`SealedWindow`]s over a
//! channel, so writing and staging never delay a poll. File I/O runs on the
//! blocking pool.

use super::buffer::SealedWindow;
use crate::config::{InstrumentConfig, StationConfig};
use crate::data::stager::{StageOutcome, Stager};
use crate::data::storage::{self, DataFileMeta};
use crate::error::{DaqError, DaqResult};
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;

/// Writes one instrument's data files.
#[derive(Debug, Clone)]
pub struct Reporter {
    instrument: String,
    class: String,
    data_dir: PathBuf,
    staging_subdir: PathBuf,
    stager: Stager,
}

impl Reporter {
    /// Reporter for `instrument` writing below the station's data directory
    pub fn new(station: &StationConfig, instrument: &InstrumentConfig, stager: Stager) -> Self {
        Self {
            instrument: instrument.name.clone(),
            class: instrument.class.clone(),
            data_dir: station.data_dir().join(instrument.data_subdir()),
            staging_subdir: instrument.staging_subdir(),
            stager,
        }
    }

    /// Directory receiving this instrument's data files
    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// File name for `sealed`, made unique against files already written or
    /// staged (two short windows after quick restarts can share a name).
    fn unique_name(&self, sealed: &SealedWindow) -> String {
        let base = storage::file_name(&self.instrument, &sealed.window);
        let taken = |name: &str| {
            self.data_dir.join(name).exists()
                || self.stager.staged_path(&self.staging_subdir, name).exists()
        };
        if !taken(&base) {
            return base;
        }
        let stem = base.trim_end_matches(&format!(".{}", storage::DATA_EXTENSION));
        (1..)
            .map(|n| format!("{stem}-{n}.{}", storage::DATA_EXTENSION))
            .find(|name| !taken(name))
            .unwrap_or(base)
    }

    /// Write `sealed` to a data file and stage it. Returns the staged path.
    pub fn report(&self, sealed: &SealedWindow) -> DaqResult<PathBuf> {
        let meta = DataFileMeta::new(
            &self.instrument,
            &self.class,
            &sealed.window,
            sealed.readings.len(),
            sealed.counts.attempted,
            sealed.counts.failed,
        );
        let name = self.unique_name(sealed);
        let path = storage::write_data_file(&self.data_dir, &name, &meta, &sealed.readings)?;
        tracing::info!(
            instrument = %self.instrument,
            file = %path.display(),
            records = meta.records,
            failed_polls = meta.polls_failed,
            "data file written"
        );

        match self.stager.stage(&path, &self.staging_subdir)? {
            StageOutcome::Staged(staged) | StageOutcome::AlreadyStaged(staged) => Ok(staged),
            StageOutcome::Conflict(staged) => Err(DaqError::Io(std::io::Error::new(
                std::io::ErrorKind::AlreadyExists,
                format!("{} already staged with different content", staged.display()),
            ))),
        }
    }

    /// Report every window until the sampler closes the channel. Returns the
    /// number of files written.
    pub async fn run(self, mut windows: mpsc::UnboundedReceiver<SealedWindow>) -> usize {
        let mut written = 0;
        while let Some(sealed) = windows.recv().await {
            let reporter = self.clone();
            let records = sealed.readings.len();
            let result = tokio::task::spawn_blocking(move || reporter.report(&sealed)).await;
            match result {
                Ok(Ok(_)) => written += 1,
                Ok(Err(err)) => {
                    tracing::error!(instrument = %self.instrument, records, error = %err, "failed to report window");
                }
                Err(err) => {
                    tracing::error!(instrument = %self.instrument, records, error = %err, "report task failed");
                }
            }
        }
        written
    }
}
