use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::sink::output::OutputChannel;
use crate::tracer::settings::Settings;
use crate::tracer::stats::{PipelineStats, StatKind};

use super::{AggregationState, DrainReport};

/// Hard cap on records emitted per core per tick.
pub const DEFAULT_FLUSH_BATCH: usize = 1000;

/// Periodic drain of the per-core pending queues into the output channel.
pub struct FlushJob {
    state: Arc<AggregationState>,
    output: OutputChannel,
    settings: Arc<Settings>,
    stats: Arc<PipelineStats>,
    batch: usize,
}

impl FlushJob {
    /// Create a flush job draining at most `batch` records per core per tick.
    pub fn new(
        state: Arc<AggregationState>,
        output: OutputChannel,
        settings: Arc<Settings>,
        stats: Arc<PipelineStats>,
        batch: usize,
    ) -> Self {
        Self {
            state,
            output,
            settings,
            stats,
            batch: batch.max(1),
        }
    }

    /// One bounded pass over `cpu`. A contended core counts as a read-wait
    /// and is retried on the next tick.
    pub fn flush_core(&self, cpu: usize) -> DrainReport {
        let drained = self.state.drain(cpu, self.batch, |record| {
            if self.output.publish(cpu, record).is_ok() {
                self.stats.record(StatKind::Flushed);
            }
        });

        match drained {
            Ok(report) => {
                if report.missed > 0 {
                    self.stats
                        .record_n(StatKind::FlushMiss, report.missed as u64);
                }
                report
            }
            Err(_) => {
                self.stats.record(StatKind::ReadWait);
                self.stats.record(StatKind::LockContended);
                DrainReport::default()
            }
        }
    }

    /// Drain every core completely, still in `batch`-sized passes. Used on
    /// shutdown after the tickers have stopped.
    pub fn drain_all(&self) -> usize {
        let mut emitted = 0;
        for cpu in 0..self.state.cores() {
            loop {
                let report = self.flush_core(cpu);
                emitted += report.emitted;
                if report.remaining == 0 || report.emitted + report.missed == 0 {
                    break;
                }
            }
        }
        emitted
    }

    /// Spawn one ticker task per core.
    pub fn spawn(self: &Arc<Self>, ctx: CancellationToken) -> Vec<JoinHandle<()>> {
        (0..self.state.cores())
            .map(|cpu| {
                let job = Arc::clone(self);
                let ctx = ctx.clone();
                tokio::spawn(async move { job.run_core(cpu, ctx).await })
            })
            .collect()
    }

    async fn run_core(&self, cpu: usize, ctx: CancellationToken) {
        let mut period = self.settings.time_interval();
        if period.is_zero() {
            period = Duration::from_secs(1);
        }
        let mut ticker = new_ticker(period);

        debug!(cpu, period = ?period, "flush ticker started");

        loop {
            tokio::select! {
                _ = ctx.cancelled() => break,
                _ = ticker.tick() => {
                    let report = self.flush_core(cpu);
                    if report.emitted > 0 || report.missed > 0 {
                        debug!(
                            cpu,
                            emitted = report.emitted,
                            missed = report.missed,
                            remaining = report.remaining,
                            "flushed aggregated traces",
                        );
                    }

                    // A zero interval means direct emission; keep draining on
                    // the old period until the queues are empty.
                    let wanted = self.settings.time_interval();
                    if !wanted.is_zero() && wanted != period {
                        info!(cpu, old = ?period, new = ?wanted, "flush interval changed");
                        period = wanted;
                        ticker = new_ticker(period);
                    }
                }
            }
        }

        debug!(cpu, "flush ticker stopped");
    }
}

fn new_ticker(period: Duration) -> Interval {
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    ticker
}
