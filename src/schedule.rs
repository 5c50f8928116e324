//! Drift-free interval scheduling.
//!
//! A [`Cadence`] yields wall-clock boundaries that are whole multiples of its
//! period since the Unix epoch. A 10-minute cadence fires at :00, :10, :20, ...
//! regardless of when the daemon started, so reporting windows line up across
//! restarts and across instruments with the same interval.

use crate::clock::Clock;
use chrono::{DateTime, TimeZone, Utc};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Fixed period aligned to epoch boundaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cadence {
    period_ms: i64,
}

impl Cadence {
    /// Cadence with the given period. Sub-millisecond periods are rounded up to 1 ms.
    pub fn new(period: Duration) -> Self {
        let period_ms = i64::try_from(period.as_millis()).unwrap_or(i64::MAX).max(1);
        Self { period_ms }
    }

    /// Cadence of `minutes` minutes
    pub fn minutes(minutes: u32) -> Self {
        Self::new(Duration::from_secs(u64::from(minutes) * 60))
    }

    /// The period
    pub fn period(&self) -> Duration {
        Duration::from_millis(self.period_ms.unsigned_abs())
    }

    /// Latest boundary at or before `t`
    pub fn floor(&self, t: DateTime<Utc>) -> DateTime<Utc> {
        let ms = t.timestamp_millis();
        from_millis(ms.div_euclid(self.period_ms) * self.period_ms)
    }

    /// First boundary strictly after `t`
    pub fn next_after(&self, t: DateTime<Utc>) -> DateTime<Utc> {
        let ms = t.timestamp_millis();
        from_millis((ms.div_euclid(self.period_ms) + 1) * self.period_ms)
    }

    /// The window `[floor(t), floor(t) + period)` containing `t`
    pub fn window_containing(&self, t: DateTime<Utc>) -> Window {
        let start = self.floor(t);
        Window {
            start,
            end: start + chrono::Duration::milliseconds(self.period_ms),
        }
    }
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Half-open time range `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    /// Inclusive start
    pub start: DateTime<Utc>,
    /// Exclusive end
    pub end: DateTime<Utc>,
}

impl Window {
    /// True when `t` falls inside the window
    pub fn contains(&self, t: DateTime<Utc>) -> bool {
        self.start <= t && t < self.end
    }

    /// Same window closed early at `end`
    pub fn truncated(&self, end: DateTime<Utc>) -> Window {
        Window {
            start: self.start,
            end: end.clamp(self.start, self.end),
        }
    }
}

/// Sleep until the wall-clock `target`. Returns `false` if cancelled first.
pub async fn sleep_until(
    clock: &dyn Clock,
    target: DateTime<Utc>,
    cancel: &CancellationToken,
) -> bool {
    let wait = (target - clock.now()).to_std().unwrap_or(Duration::ZERO);
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(wait) => true,
    }
}
