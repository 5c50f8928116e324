//! Data file writer.
//!
//! One data file holds the readings of one instrument for one reporting
//! window. The file starts with `# `-prefixed JSON metadata lines followed by a
//! CSV table:
//!
//! ```text
//! # {
//! #   "instrument": "thermo-49i",
//! #   "class": "instr.thermo.Thermo49i",
//! #   "window_start": "2024-05-17T10:00:00Z",
//! #   ...
//! # }
//! dtm,o3,flags
//! 2024-05-17T10:01:00Z,30.8,0C100400
//! ```
//!
//! Files are written under a `.part` name and renamed once complete, so a
//! closed file never changes and a partially written one is never mistaken for
//! data.

use crate::error::{DaqError, DaqResult};
use crate::measurement::Reading;
use crate::schedule::Window;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

/// Suffix of files still being written
pub const PART_SUFFIX: &str = ".part";

/// Extension of closed data files
pub const DATA_EXTENSION: &str = "csv";

/// Timestamp format used in file names
pub const NAME_TIME_FORMAT: &str = "%Y%m%d%H%M";

/// Outcome of a reporting window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowStatus {
    /// At least one reading was acquired
    Ok,
    /// No reading was acquired; the file only marks the gap
    NoData,
}

/// Metadata header of a data file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataFileMeta {
    /// Instrument name
    pub instrument: String,
    /// Configured driver class
    pub class: String,
    /// Start of the covered window (inclusive)
    pub window_start: DateTime<Utc>,
    /// End of the covered window (exclusive)
    pub window_end: DateTime<Utc>,
    /// Number of data rows
    pub records: usize,
    /// Polls issued during the window
    pub polls_attempted: u32,
    /// Polls that failed during the window
    pub polls_failed: u32,
    /// Window outcome
    pub status: WindowStatus,
}

impl DataFileMeta {
    /// Metadata for `readings` acquired during `window`
    pub fn new(
        instrument: &str,
        class: &str,
        window: &Window,
        records: usize,
        polls_attempted: u32,
        polls_failed: u32,
    ) -> Self {
        Self {
            instrument: instrument.to_string(),
            class: class.to_string(),
            window_start: window.start,
            window_end: window.end,
            records,
            polls_attempted,
            polls_failed,
            status: if records == 0 {
                WindowStatus::NoData
            } else {
                WindowStatus::Ok
            },
        }
    }
}

/// Deterministic file name for an instrument window:
/// `<instrument>-<start>-<end>.csv`
pub fn file_name(instrument: &str, window: &Window) -> String {
    format!(
        "{}-{}-{}.{}",
        instrument,
        window.start.format(NAME_TIME_FORMAT),
        window.end.format(NAME_TIME_FORMAT),
        DATA_EXTENSION
    )
}

/// True for a closed data file: `*.csv`, not hidden
pub fn is_data_file(path: &Path) -> bool {
    let hidden = path
        .file_name()
        .and_then(|n| n.to_str())
        .is_none_or(|n| n.starts_with('.'));
    !hidden && path.extension().and_then(|e| e.to_str()) == Some(DATA_EXTENSION)
}

/// True for an unfinished `.part` file
pub fn is_part_file(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.ends_with(PART_SUFFIX))
}

fn format_timestamp(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Column names in first-seen order across `readings`
pub fn columns(readings: &[Reading]) -> Vec<&str> {
    let mut columns: Vec<&str> = Vec::new();
    for reading in readings {
        for (name, _) in &reading.fields {
            if !columns.contains(&name.as_str()) {
                columns.push(name);
            }
        }
    }
    columns
}

/// Write a data file into `dir` under `name`. Returns the final path.
///
/// The content goes to `<name>.part` first, is synced, then renamed.
pub fn write_data_file(
    dir: &Path,
    name: &str,
    meta: &DataFileMeta,
    readings: &[Reading],
) -> DaqResult<PathBuf> {
    std::fs::create_dir_all(dir)?;
    let path = dir.join(name);
    let part = dir.join(format!("{name}{PART_SUFFIX}"));

    let mut file = File::create(&part)?;
    let json = serde_json::to_string_pretty(meta)?;
    for line in json.lines() {
        writeln!(file, "# {line}")?;
    }

    let columns = columns(readings);
    let mut writer = csv::Writer::from_writer(file);
    let mut header = Vec::with_capacity(columns.len() + 1);
    header.push("dtm");
    header.extend(columns.iter().copied());
    writer.write_record(&header)?;

    for reading in readings {
        let mut row = Vec::with_capacity(columns.len() + 1);
        row.push(format_timestamp(&reading.timestamp));
        for column in &columns {
            row.push(reading.get(column).map(ToString::to_string).unwrap_or_default());
        }
        writer.write_record(&row)?;
    }

    let file = writer
        .into_inner()
        .map_err(|err| DaqError::Io(err.into_error()))?;
    file.sync_all()?;
    drop(file);

    std::fs::rename(&part, &path)?;
    Ok(path)
}

/// Contents of a data file
#[derive(Debug, Clone)]
pub struct DataFileContents {
    /// Parsed metadata header
    pub meta: DataFileMeta,
    /// Column header, starting with `dtm`
    pub header: Vec<String>,
    /// Data rows
    pub rows: Vec<Vec<String>>,
}

/// Read a data file written by [`write_data_file`].
pub fn read_data_file(path: &Path) -> DaqResult<DataFileContents> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut json = String::new();
    let mut table = String::new();
    let mut line = String::new();
    while reader.read_line(&mut line)? > 0 {
        match line.strip_prefix("# ") {
            Some(meta) if table.is_empty() => json.push_str(meta),
            _ => table.push_str(&line),
        }
        line.clear();
    }

    let meta: DataFileMeta = serde_json::from_str(&json)?;
    let mut csv = csv::Reader::from_reader(table.as_bytes());
    let header = csv.headers()?.iter().map(str::to_string).collect();
    let mut rows = Vec::new();
    for record in csv.records() {
        rows.push(record?.iter().map(str::to_string).collect());
    }
    Ok(DataFileContents { meta, header, rows })
}
