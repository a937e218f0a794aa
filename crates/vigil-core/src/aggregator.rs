//! Periodic occupancy averages.

use serde::Serialize;
use thiserror::Error;

/// 10 minutes of samples at one sample per 5 s.
pub const DEFAULT_AGGREGATE_SAMPLES: usize = 120;

/// Mean people count over one aggregation window.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OccupancyAggregate {
    pub function_id: i64,
    /// Epoch seconds at which the window closed.
    pub timestamp: i64,
    pub avg_people_count: f64,
}

#[derive(Error, Debug)]
pub enum SinkError {
    #[error("storage: {0}")]
    Storage(String),
    #[error("sink is closed")]
    Closed,
}

/// Destination for finished aggregates.
pub trait OccupancySink: Send + Sync {
    fn persist(&self, aggregate: &OccupancyAggregate) -> Result<(), SinkError>;
}

/// Buffers per-frame counts and emits their mean once the window fills.
#[derive(Debug)]
pub struct Aggregator {
    function_id: i64,
    window: usize,
    samples: Vec<usize>,
}

impl Aggregator {
    pub fn new(function_id: i64, window: usize) -> Self {
        let window = window.max(1);
        Self {
            function_id,
            window,
            samples: Vec::with_capacity(window),
        }
    }

    pub fn pending(&self) -> usize {
        self.samples.len()
    }

    /// Add one sample. When the window is full, returns the aggregate and
    /// clears the buffer.
    pub fn push(&mut self, people_count: usize, unix_ts: i64) -> Option<OccupancyAggregate> {
        self.samples.push(people_count);
        if self.samples.len() < self.window {
            return None;
        }

        let total: usize = self.samples.iter().sum();
        let avg = total as f64 / self.samples.len() as f64;
        self.samples.clear();

        Some(OccupancyAggregate {
            function_id: self.function_id,
            timestamp: unix_ts,
            avg_people_count: avg,
        })
    }

    /// `push`, then hand any finished aggregate to `sink`. Failures are logged.
    pub fn record(&mut self, people_count: usize, unix_ts: i64, sink: &dyn OccupancySink) {
        let Some(aggregate) = self.push(people_count, unix_ts) else {
            return;
        };
        match sink.persist(&aggregate) {
            Ok(()) => tracing::debug!(
                function_id = aggregate.function_id,
                avg = aggregate.avg_people_count,
                "occupancy aggregate stored"
            ),
            Err(e) => tracing::warn!(function_id = aggregate.function_id, error = %e, "failed to store occupancy aggregate"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use std::sync::Mutex;

    #[derive(Default)]
    struct MemorySink {
        rows: Mutex<Vec<OccupancyAggregate>>,
        fail: bool,
    }

    impl OccupancySink for MemorySink {
        fn persist(&self, aggregate: &OccupancyAggregate) -> Result<(), SinkError> {
            if self.fail {
                return Err(SinkError::Storage("database is locked".into()));
            }
            self.rows.lock().unwrap().push(aggregate.clone());
            Ok(())
        }
    }

    #[test]
    fn test_mean_emitted_at_window() {
        let mut agg = Aggregator::new(7, DEFAULT_AGGREGATE_SAMPLES);
        for i in 0..DEFAULT_AGGREGATE_SAMPLES - 1 {
            assert!(agg.push(i % 3, 100).is_none());
        }
        let out = agg.push(2, 200).unwrap();
        // 0,1,2 repeated forty times.
        assert_relative_eq!(out.avg_people_count, 1.0);
        assert_eq!(out.function_id, 7);
        assert_eq!(out.timestamp, 200);
        assert_eq!(agg.pending(), 0);
    }

    #[test]
    fn test_record_persists_and_clears() {
        let sink = MemorySink::default();
        let mut agg = Aggregator::new(1, 4);
        for c in [1, 2, 2, 3] {
            agg.record(c, 50, &sink);
        }
        let rows = sink.rows.lock().unwrap();
        assert_eq!(rows.len(), 1);
        assert_relative_eq!(rows[0].avg_people_count, 2.0);
        assert_eq!(agg.pending(), 0);
    }

    #[test]
    fn test_sink_failure_still_clears() {
        let sink = MemorySink { fail: true, ..Default::default() };
        let mut agg = Aggregator::new(1, 2);
        agg.record(1, 0, &sink);
        agg.record(1, 0, &sink);
        assert_eq!(agg.pending(), 0);
        agg.record(5, 0, &sink);
        assert_eq!(agg.pending(), 1);
    }

    #[test]
    fn test_zero_window_treated_as_one() {
        let mut agg = Aggregator::new(1, 0);
        assert!(agg.push(3, 0).is_some());
    }
}
