use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use thiserror::Error;

use crate::sync::{LockCell, LockError};

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettingsError {
    #[error("settings update skipped: {0}")]
    Contended(#[from] LockError),

    #[error("aggregation cannot be enabled at runtime when the pipeline started in direct mode")]
    AggregationUnavailable,
}

/// Runtime tunables read on every probe invocation.
///
/// Reads are lock-free. Writers serialize on the global lock so a reload
/// never interleaves its two stores with another reload.
#[derive(Debug)]
pub struct Settings {
    sample_rate: AtomicU64,
    time_interval_ns: AtomicU64,
    aggregation_available: bool,
    lock: LockCell,
    retries: u32,
}

impl Settings {
    /// `time_interval` of zero starts the pipeline in direct mode; such a
    /// pipeline has no per-core state and can never switch to aggregation.
    pub fn new(sample_rate: u64, time_interval: Duration, retries: u32) -> Self {
        let interval_ns = duration_ns(time_interval);
        Self {
            sample_rate: AtomicU64::new(sample_rate),
            time_interval_ns: AtomicU64::new(interval_ns),
            aggregation_available: interval_ns > 0,
            lock: LockCell::new(),
            retries,
        }
    }

    /// Current decimation rate; zero keeps every event.
    #[inline]
    pub fn sample_rate(&self) -> u64 {
        self.sample_rate.load(Ordering::Relaxed)
    }

    /// Current flush interval; zero means direct emission.
    #[inline]
    pub fn time_interval(&self) -> Duration {
        Duration::from_nanos(self.time_interval_ns.load(Ordering::Relaxed))
    }

    /// Whether new records go to the aggregation store.
    #[inline]
    pub fn aggregation_enabled(&self) -> bool {
        self.time_interval_ns.load(Ordering::Relaxed) > 0
    }

    /// Whether per-core state exists for this pipeline.
    pub fn aggregation_available(&self) -> bool {
        self.aggregation_available
    }

    /// Replace both tunables under the global lock. On contention nothing is
    /// written and the caller may retry later.
    pub fn update(&self, sample_rate: u64, time_interval: Duration) -> Result<(), SettingsError> {
        let interval_ns = duration_ns(time_interval);
        if interval_ns > 0 && !self.aggregation_available {
            return Err(SettingsError::AggregationUnavailable);
        }

        self.lock.acquire(self.retries)?;
        self.sample_rate.store(sample_rate, Ordering::Relaxed);
        self.time_interval_ns.store(interval_ns, Ordering::Relaxed);
        self.lock.release();

        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn global_lock(&self) -> &LockCell {
        &self.lock
    }
}

fn duration_ns(d: Duration) -> u64 {
    u64::try_from(d.as_nanos()).unwrap_or(u64::MAX)
}
