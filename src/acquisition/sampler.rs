//! Sampler: drives one instrument driver on its sampling cadence.
//!
//! State per tick: `IDLE -> POLLING -> (APPENDED | POLL_FAILED) -> IDLE`.
//!
//! - Ticks fall on wall-clock multiples of `sampling_interval` ([`Cadence`]).
//!   A poll that overruns skips the boundaries it missed instead of bursting.
//! - A failed poll is logged and skipped; nothing already buffered is touched.
//! - After `reconnect_threshold` consecutive failures the driver is closed and
//!   reopened before the next poll. When `max_reconnect_attempts` consecutive
//!   connect attempts fail the sampler stops with [`DaqError::Degraded`].
//! - At each reporting boundary the buffer is swapped out and sent to the
//!   reporter as a [`SealedWindow`].
//! - Cancellation is observed while waiting for a tick, while connecting and
//!   while polling. An abandoned poll produces no reading; the partial window
//!   is sealed before returning.

use super::buffer::{ReadingBuffer, SealedWindow, WindowCounts};
use crate::clock::Clock;
use crate::config::InstrumentConfig;
use crate::error::{DaqError, DaqResult};
use crate::error_recovery::{FailureStreak, ReconnectPolicy};
use crate::instrument::InstrumentDriver;
use crate::schedule::{sleep_until, Cadence, Window};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Counters over the sampler's lifetime
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SamplerStats {
    /// Polls attempted
    pub polls: u64,
    /// Polls that failed
    pub failures: u64,
    /// Reconnects triggered by consecutive failures
    pub reconnects: u64,
    /// Windows sealed
    pub windows: u64,
}

/// Polling loop of one instrument.
pub struct Sampler {
    name: String,
    driver: Box<dyn InstrumentDriver>,
    clock: Arc<dyn Clock>,
    sampling: Cadence,
    reporting: Cadence,
    policy: ReconnectPolicy,
    buffer: Arc<ReadingBuffer>,
    windows: mpsc::UnboundedSender<SealedWindow>,
    counts: WindowCounts,
    stats: SamplerStats,
    configured: bool,
}

impl std::fmt::Debug for Sampler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sampler")
            .field("name", &self.name)
            .field("driver", &self.driver.driver_type())
            .field("sampling", &self.sampling.period())
            .field("reporting", &self.reporting.period())
            .field("stats", &self.stats)
            .finish()
    }
}

enum Connect {
    Ready,
    Failed,
    Cancelled,
}

impl Sampler {
    /// Sampler for `config` using `driver`. Sealed windows arrive on the
    /// returned receiver.
    pub fn new(
        config: &InstrumentConfig,
        driver: Box<dyn InstrumentDriver>,
        clock: Arc<dyn Clock>,
        policy: ReconnectPolicy,
    ) -> (Self, mpsc::UnboundedReceiver<SealedWindow>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let sampler = Self {
            name: config.name.clone(),
            driver,
            clock,
            sampling: Cadence::minutes(config.params.sampling_interval),
            reporting: Cadence::minutes(config.params.reporting_interval),
            policy,
            buffer: Arc::new(ReadingBuffer::new()),
            windows: tx,
            counts: WindowCounts::default(),
            stats: SamplerStats::default(),
            configured: false,
        };
        (sampler, rx)
    }

    /// Override the cadences (sub-minute periods in tests)
    pub fn with_cadence(mut self, sampling: Cadence, reporting: Cadence) -> Self {
        self.sampling = sampling;
        self.reporting = reporting;
        self
    }

    /// Shared handle on the live buffer
    pub fn buffer(&self) -> Arc<ReadingBuffer> {
        Arc::clone(&self.buffer)
    }

    /// Run until cancelled or degraded.
    pub async fn run(mut self, cancel: CancellationToken) -> DaqResult<SamplerStats> {
        let mut streak = FailureStreak::default();
        let mut connect_failures = FailureStreak::default();

        match self.connect(&cancel).await {
            Connect::Cancelled => return Ok(self.finish(None).await),
            Connect::Ready => {}
            Connect::Failed => {
                connect_failures.fail();
            }
        }

        let mut tick = self.sampling.next_after(self.clock.now());
        let mut window = self.reporting.window_containing(tick);
        tracing::info!(
            instrument = %self.name,
            first_poll = %tick,
            window_end = %window.end,
            "sampler started"
        );

        loop {
            if !sleep_until(self.clock.as_ref(), tick, &cancel).await {
                break;
            }
            if tick >= window.end {
                self.seal(window);
                window = self.reporting.window_containing(tick);
            }

            self.counts.attempted += 1;
            self.stats.polls += 1;

            if streak.reached(self.policy.threshold) {
                tracing::warn!(
                    instrument = %self.name,
                    failures = streak.count(),
                    "reconnecting after consecutive poll failures"
                );
                self.driver.disconnect().await;
                self.stats.reconnects += 1;
                streak.reset();
            }

            if !self.driver.is_connected() {
                match self.connect(&cancel).await {
                    Connect::Ready => connect_failures.reset(),
                    Connect::Cancelled => {
                        self.counts.attempted -= 1;
                        self.stats.polls -= 1;
                        break;
                    }
                    Connect::Failed => {
                        self.counts.failed += 1;
                        self.stats.failures += 1;
                        let attempts = connect_failures.fail();
                        if connect_failures.reached(self.policy.max_attempts) {
                            tracing::error!(
                                instrument = %self.name,
                                attempts,
                                "instrument degraded, giving up on reconnecting"
                            );
                            self.finish(Some(window)).await;
                            return Err(DaqError::Degraded {
                                instrument: self.name.clone(),
                                attempts,
                            });
                        }
                        tick = self.next_tick(tick);
                        continue;
                    }
                }
            }

            let started = self.clock.now();
            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                result = self.driver.poll() => Some(result),
            };
            match outcome {
                None => {
                    tracing::info!(instrument = %self.name, "poll abandoned on shutdown");
                    self.counts.attempted -= 1;
                    self.stats.polls -= 1;
                    break;
                }
                Some(Ok(mut reading)) => {
                    reading.timestamp = started;
                    tracing::debug!(instrument = %self.name, fields = reading.len(), "reading appended");
                    self.buffer.push(reading);
                    streak.reset();
                }
                Some(Err(err)) => {
                    self.counts.failed += 1;
                    self.stats.failures += 1;
                    let failures = streak.fail();
                    if err.is_timeout() {
                        tracing::warn!(instrument = %self.name, failures, error = %err, "poll timed out");
                    } else if err.is_instrument_error() {
                        tracing::warn!(instrument = %self.name, failures, error = %err, "poll failed");
                    } else {
                        tracing::error!(instrument = %self.name, failures, error = %err, "poll failed unexpectedly");
                    }
                }
            }

            tick = self.next_tick(tick);
        }

        Ok(self.finish(Some(window)).await)
    }

    fn next_tick(&self, tick: DateTime<Utc>) -> DateTime<Utc> {
        self.sampling.next_after(tick.max(self.clock.now()))
    }

    async fn connect(&mut self, cancel: &CancellationToken) -> Connect {
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Connect::Cancelled,
            result = self.driver.connect() => result,
        };
        if let Err(err) = result {
            tracing::warn!(instrument = %self.name, error = %err, "connect failed");
            return Connect::Failed;
        }
        if !self.configured {
            self.configured = true;
            let commands = self.driver.settings().set_config.clone();
            let report = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Connect::Cancelled,
                report = self.driver.configure(&commands) => report,
            };
            if !report.is_complete() {
                tracing::warn!(
                    instrument = %self.name,
                    failed = report.failed.len(),
                    applied = report.applied.len(),
                    "instrument partially configured"
                );
            }
            let replies = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Connect::Cancelled,
                replies = self.driver.read_config() => replies,
            };
            for (command, reply) in replies {
                match reply {
                    Ok(reply) => tracing::info!(instrument = %self.name, command = %command, reply = %reply, "instrument configuration"),
                    Err(err) => tracing::warn!(instrument = %self.name, command = %command, error = %err, "configuration readback failed"),
                }
            }
        }
        Connect::Ready
    }

    fn seal(&mut self, window: Window) {
        let readings = self.buffer.take();
        let counts = std::mem::take(&mut self.counts);
        self.stats.windows += 1;
        tracing::debug!(
            instrument = %self.name,
            start = %window.start,
            end = %window.end,
            records = readings.len(),
            "window sealed"
        );
        let sealed = SealedWindow {
            window,
            readings,
            counts,
        };
        if let Err(err) = self.windows.send(sealed) {
            tracing::error!(
                instrument = %self.name,
                records = err.0.readings.len(),
                "reporter gone, window dropped"
            );
        }
    }

    /// Seal the open window (cut at now) if anything happened in it, then
    /// close the connection.
    async fn finish(&mut self, window: Option<Window>) -> SamplerStats {
        if let Some(window) = window {
            if self.counts.attempted > 0 || !self.buffer.is_empty() {
                self.seal(window.truncated(self.clock.now()));
            }
        }
        self.driver.disconnect().await;
        tracing::info!(instrument = %self.name, polls = self.stats.polls, failures = self.stats.failures, "sampler stopped");
        self.stats
    }
}
