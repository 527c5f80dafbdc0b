use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Pipeline counters exposed for external monitoring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum StatKind {
    /// Eligible (rule-match) notifications that reached the sampler.
    PacketsSeen = 0,
    /// Non-rule notifications skipped before sampling.
    Filtered = 1,
    SampledOut = 2,
    /// New records placed in an aggregation store.
    Aggregated = 3,
    /// Notifications folded into an existing record.
    Merged = 4,
    /// Records sent straight to the output channel.
    DirectEmitted = 5,
    Flushed = 6,
    /// Pending ids whose store record had already gone.
    FlushMiss = 7,
    /// Store, queue or per-core slot unavailable on the write side.
    WriteWait = 8,
    /// Per-core slot unavailable on the flush side.
    ReadWait = 9,
    OutputDropped = 10,
    /// Lock acquisitions that ran out of retries.
    LockContended = 11,
}

pub const STAT_KIND_COUNT: usize = 12;

impl StatKind {
    /// Metric label for this counter.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::PacketsSeen => "packets_seen",
            Self::Filtered => "filtered",
            Self::SampledOut => "sampled_out",
            Self::Aggregated => "aggregated",
            Self::Merged => "merged",
            Self::DirectEmitted => "direct_emitted",
            Self::Flushed => "flushed",
            Self::FlushMiss => "flush_miss",
            Self::WriteWait => "write_wait",
            Self::ReadWait => "read_wait",
            Self::OutputDropped => "output_dropped",
            Self::LockContended => "lock_contended",
        }
    }

    /// Every kind, in index order.
    pub const fn all() -> [Self; STAT_KIND_COUNT] {
        [
            Self::PacketsSeen,
            Self::Filtered,
            Self::SampledOut,
            Self::Aggregated,
            Self::Merged,
            Self::DirectEmitted,
            Self::Flushed,
            Self::FlushMiss,
            Self::WriteWait,
            Self::ReadWait,
            Self::OutputDropped,
            Self::LockContended,
        ]
    }
}

impl fmt::Display for StatKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lock-free monotonic counters, one per [`StatKind`].
///
/// Counters only grow; they are reset by restarting the process.
/// Exporters take a [`StatsSnapshot`] and diff it against the previous one.
pub struct PipelineStats {
    counts: [AtomicU64; STAT_KIND_COUNT],
}

impl PipelineStats {
    /// Create zeroed counters.
    pub fn new() -> Self {
        Self {
            counts: std::array::from_fn(|_| AtomicU64::new(0)),
        }
    }

    /// Increment `kind` by one.
    #[inline]
    pub fn record(&self, kind: StatKind) {
        self.record_n(kind, 1);
    }

    /// Increment `kind` by `n`.
    #[inline]
    pub fn record_n(&self, kind: StatKind, n: u64) {
        if let Some(counter) = self.counts.get(kind as usize) {
            counter.fetch_add(n, Ordering::Relaxed);
        }
    }

    /// Current value of `kind`.
    pub fn get(&self, kind: StatKind) -> u64 {
        self.counts
            .get(kind as usize)
            .map_or(0, |c| c.load(Ordering::Relaxed))
    }

    /// Copy every counter at once.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            values: std::array::from_fn(|i| {
                self.counts
                    .get(i)
                    .map_or(0, |c| c.load(Ordering::Relaxed))
            }),
        }
    }
}

impl Default for PipelineStats {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for PipelineStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.snapshot(), f)
    }
}

/// Point-in-time copy of every counter.
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    values: [u64; STAT_KIND_COUNT],
}

impl StatsSnapshot {
    /// Value of `kind` in this snapshot.
    pub fn get(&self, kind: StatKind) -> u64 {
        self.values.get(kind as usize).copied().unwrap_or(0)
    }

    /// Per-counter growth since `prev`.
    pub fn delta(&self, prev: &StatsSnapshot) -> StatsSnapshot {
        StatsSnapshot {
            values: std::array::from_fn(|i| {
                let now = self.values.get(i).copied().unwrap_or(0);
                let before = prev.values.get(i).copied().unwrap_or(0);
                now.saturating_sub(before)
            }),
        }
    }

    /// Iterate `(kind, value)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (StatKind, u64)> + '_ {
        StatKind::all().into_iter().map(|k| (k, self.get(k)))
    }

    /// Whether every counter is zero.
    pub fn is_zero(&self) -> bool {
        self.values.iter().all(|&v| v == 0)
    }
}

impl fmt::Debug for StatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.iter().map(|(k, v)| (k.as_str(), v)))
            .finish()
    }
}
