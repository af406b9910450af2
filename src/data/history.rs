//! Bounded in-memory telemetry history.
//!
//! Kept for chart consumers. Once full, the oldest reading is dropped for
//! every new one.

use chrono::{DateTime, Duration, Utc};
use std::collections::VecDeque;

use crate::protocol::TelemetryReading;

/// A reading with the time it was received.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TimedReading {
    /// When the frame was received.
    pub timestamp: DateTime<Utc>,
    /// The decoded frame.
    pub reading: TelemetryReading,
}

/// Fixed-capacity ring of recent readings, oldest first.
#[derive(Debug, Clone)]
pub struct TelemetryHistory {
    capacity: usize,
    entries: VecDeque<TimedReading>,
}

impl TelemetryHistory {
    /// Default capacity: two hours at one frame per second.
    pub const DEFAULT_CAPACITY: usize = 7200;

    /// Create an empty history holding at most `capacity` readings.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: VecDeque::with_capacity(capacity.clamp(1, Self::DEFAULT_CAPACITY)),
        }
    }

    /// Append a reading, evicting the oldest one if full.
    pub fn push(&mut self, timestamp: DateTime<Utc>, reading: TelemetryReading) {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(TimedReading { timestamp, reading });
    }

    /// Number of readings held.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the history is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Maximum number of readings held.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Most recent reading.
    pub fn latest(&self) -> Option<&TimedReading> {
        self.entries.back()
    }

    /// Iterate oldest to newest.
    pub fn iter(&self) -> impl Iterator<Item = &TimedReading> {
        self.entries.iter()
    }

    /// Readings received within `span` of the newest one.
    pub fn recent(&self, span: Duration) -> Vec<TimedReading> {
        let Some(latest) = self.entries.back() else {
            return Vec::new();
        };
        let cutoff = latest.timestamp - span;
        self.entries
            .iter()
            .filter(|entry| entry.timestamp >= cutoff)
            .cloned()
            .collect()
    }

    /// Pit temperature series for charting, skipping readings with the probe unplugged.
    pub fn pit_series(&self) -> Vec<(DateTime<Utc>, u16)> {
        self.entries
            .iter()
            .filter_map(|entry| entry.reading.pit_fahrenheit().map(|t| (entry.timestamp, t)))
            .collect()
    }

    /// Drop everything.
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

impl Default for TelemetryHistory {
    fn default() -> Self {
        Self::new(Self::DEFAULT_CAPACITY)
    }
}
