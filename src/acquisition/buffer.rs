//! Per-instrument reading buffer.

use crate::measurement::Reading;
use crate::schedule::Window;
use parking_lot::Mutex;

/// Append-only readings since the last flush.
///
/// Readings are kept in poll order. [`ReadingBuffer::take`] swaps the whole
/// content for an empty vector under the lock; there is no partial truncation.
#[derive(Debug, Default)]
pub struct ReadingBuffer {
    readings: Mutex<Vec<Reading>>,
}

impl ReadingBuffer {
    /// Empty buffer
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a reading
    pub fn push(&self, reading: Reading) {
        self.readings.lock().push(reading);
    }

    /// Number of buffered readings
    pub fn len(&self) -> usize {
        self.readings.lock().len()
    }

    /// True when nothing is buffered
    pub fn is_empty(&self) -> bool {
        self.readings.lock().is_empty()
    }

    /// Take every buffered reading, leaving the buffer empty
    pub fn take(&self) -> Vec<Reading> {
        std::mem::take(&mut *self.readings.lock())
    }
}

/// Poll counters of the current window
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WindowCounts {
    /// Polls attempted, including ones skipped for lack of a connection
    pub attempted: u32,
    /// Polls that produced no reading
    pub failed: u32,
}

/// A closed reporting window on its way to the reporter.
#[derive(Debug, Clone)]
pub struct SealedWindow {
    /// Covered time range
    pub window: Window,
    /// Readings in poll order
    pub readings: Vec<Reading>,
    /// Poll counters
    pub counts: WindowCounts,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::measurement::FieldValue;
    use chrono::Utc;

    #[test]
    fn take_swaps_whole_buffer() {
        let buffer = ReadingBuffer::new();
        for i in 0..3_i64 {
            buffer.push(Reading::new(Utc::now()).with_field("n", i));
        }
        assert_eq!(buffer.len(), 3);

        let taken = buffer.take();
        assert!(buffer.is_empty());
        let order: Vec<_> = taken.iter().filter_map(|r| r.get("n").cloned()).collect();
        assert_eq!(order, [FieldValue::Int(0), FieldValue::Int(1), FieldValue::Int(2)]);
    }
}
