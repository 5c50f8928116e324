//! # Station DAQ Core Library
//!
//! Unattended data acquisition for environmental monitoring stations. The
//! daemon polls heterogeneous instruments (gas analyzers, particle counters,
//! aethalometers, nephelometers) on independent schedules, writes their
//! readings to local files, stages closed files and ships them to a remote
//! archive.
//!
//! Data flows `driver -> sampler -> reporter -> stager -> transfer`:
//!
//! - **`instrument`**: the [`instrument::InstrumentDriver`] contract, the
//!   concrete drivers, the simulated driver and the driver registry.
//! - **`acquisition`**: per-instrument sampler (polling loop and buffer) and
//!   reporter (window files).
//! - **`data`**: data file format and the stager that publishes closed files.
//! - **`transfer`**: the transfer manager and its remote backends.
//! - **`orchestrator`**: startup plan, supervision, restarts and graceful
//!   shutdown.
//! - **`schedule`** and **`clock`**: wall-clock aligned cadences.
//! - **`config`**, **`logging`**, **`error`**, **`error_recovery`**,
//!   **`lock`** and **`validation`**: the supporting stack.

pub mod acquisition;
pub mod clock;
pub mod config;
pub mod data;
pub mod error;
pub mod error_recovery;
pub mod instrument;
pub mod lock;
pub mod logging;
pub mod measurement;
pub mod orchestrator;
pub mod schedule;
pub mod transfer;
pub mod validation;
