//! Sink-level operational counters.
//!
//! The counters are plain atomics so observers on other tasks can snapshot
//! them; the same events are mirrored to the process-wide metrics recorder.

use std::sync::atomic::{AtomicU64, Ordering};

use metrics::counter;

/// Names of the metrics mirrored to the global recorder.
pub mod recorded {
    /// Failed store round-trips while flushing measurements (counter).
    pub const DATASTORE_WRITE_FAILURES: &str = "pgfleet_sink_datastore_write_failures_total";

    /// Measurement rows dropped because they could not be encoded (counter).
    pub const METRICS_DROPPED: &str = "pgfleet_sink_metrics_dropped_total";
}

/// Monotonic counters for one sink instance.
#[derive(Debug, Default)]
pub struct SinkStats {
    datastore_write_failures: AtomicU64,
    metrics_dropped: AtomicU64,
}

impl SinkStats {
    pub fn record_write_failure(&self) {
        self.datastore_write_failures.fetch_add(1, Ordering::Relaxed);
        counter!(recorded::DATASTORE_WRITE_FAILURES).increment(1);
    }

    pub fn record_dropped(&self) {
        self.metrics_dropped.fetch_add(1, Ordering::Relaxed);
        counter!(recorded::METRICS_DROPPED).increment(1);
    }

    pub fn write_failures(&self) -> u64 {
        self.datastore_write_failures.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.metrics_dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_are_monotonic() {
        let stats = SinkStats::default();
        assert_eq!((stats.write_failures(), stats.dropped()), (0, 0));

        stats.record_write_failure();
        stats.record_dropped();
        stats.record_dropped();
        assert_eq!(stats.write_failures(), 1);
        assert_eq!(stats.dropped(), 2);
    }
}
