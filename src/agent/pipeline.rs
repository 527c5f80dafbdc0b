use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::sink::aggregated::flush::FlushJob;
use crate::sink::aggregated::{AggregationState, Occupancy};
use crate::sink::output::{OutputChannel, OutputMode, OutputReader};
use crate::tracer::context::TraceContext;
use crate::tracer::probe::{ProbeOutcome, TraceProbe};
use crate::tracer::settings::Settings;
use crate::tracer::stats::PipelineStats;

/// The wired-up trace pipeline: probe, per-core aggregation, flush job and
/// output channel sharing one settings block and one set of counters.
///
/// The output mode is fixed at construction. A pipeline built with a zero
/// aggregation interval has no per-core state at all.
pub struct Pipeline {
    settings: Arc<Settings>,
    stats: Arc<PipelineStats>,
    aggregation: Option<Arc<AggregationState>>,
    output: OutputChannel,
    probe: TraceProbe,
    flush: Option<Arc<FlushJob>>,
    cores: usize,
}

impl Pipeline {
    /// Build every pipeline component from `cfg` for `cores` cores.
    pub fn new(cfg: &Config, cores: usize) -> (Self, OutputReader) {
        let cores = cores.max(1);
        let stats = Arc::new(PipelineStats::new());
        let settings = Arc::new(Settings::new(
            cfg.sampling.rate,
            cfg.aggregation.interval,
            cfg.lock.retries,
        ));

        let (mode, capacity, aggregation) = if cfg.aggregation.is_enabled() {
            let state = AggregationState::new(
                cores,
                cfg.aggregation.store_capacity,
                cfg.aggregation.queue_capacity,
                cfg.lock.retries,
            );
            (
                OutputMode::Multiplexed,
                cfg.output.lane_capacity,
                Some(Arc::new(state)),
            )
        } else {
            (OutputMode::Direct, cfg.output.direct_capacity, None)
        };

        let (output, reader) = OutputChannel::new(mode, cores, capacity, Arc::clone(&stats));

        let probe = TraceProbe::new(
            Arc::clone(&settings),
            Arc::clone(&stats),
            aggregation.clone(),
            output.clone(),
        );

        let flush = aggregation.as_ref().map(|state| {
            Arc::new(FlushJob::new(
                Arc::clone(state),
                output.clone(),
                Arc::clone(&settings),
                Arc::clone(&stats),
                cfg.aggregation.flush_batch,
            ))
        });

        (
            Self {
                settings,
                stats,
                aggregation,
                output,
                probe,
                flush,
                cores,
            },
            reader,
        )
    }

    /// Feed one trace notification observed on `cpu`.
    #[inline]
    pub fn on_trace(&self, cpu: usize, ctx: &TraceContext) -> ProbeOutcome {
        self.probe.on_trace(cpu, ctx)
    }

    /// Start one flush ticker per core. Direct-mode pipelines have none.
    pub fn spawn_flush(&self, ctx: CancellationToken) -> Vec<JoinHandle<()>> {
        match &self.flush {
            Some(job) => job.spawn(ctx),
            None => Vec::new(),
        }
    }

    /// Drain every pending record into the output channel, ignoring the
    /// per-tick cap. Returns the number of records taken from the stores.
    pub fn drain_all(&self) -> usize {
        self.flush.as_ref().map_or(0, |job| job.drain_all())
    }

    /// Aggregation occupancy; zero in direct mode.
    pub fn occupancy(&self) -> Occupancy {
        self.aggregation
            .as_ref()
            .map(|state| state.occupancy())
            .unwrap_or_default()
    }

    /// Runtime settings shared with the probe.
    pub fn settings(&self) -> &Arc<Settings> {
        &self.settings
    }

    /// Pipeline counters.
    pub fn stats(&self) -> &Arc<PipelineStats> {
        &self.stats
    }

    /// Output channel mode.
    pub fn mode(&self) -> OutputMode {
        self.output.mode()
    }

    /// Number of cores the pipeline was built for.
    pub fn cores(&self) -> usize {
        self.cores
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::tracer::context::PacketSnapshot;
    use crate::tracer::event::TraceType;
    use crate::tracer::stats::StatKind;

    fn rule_ctx(identity: u64) -> TraceContext {
        TraceContext {
            packet: PacketSnapshot {
                identity,
                ..Default::default()
            },
            rule_handle: 3,
            trace_type: TraceType::Rule as u8,
            ..Default::default()
        }
    }

    #[test]
    fn test_direct_mode_has_no_aggregation() {
        let mut cfg = Config::default();
        cfg.aggregation.interval = Duration::ZERO;
        let (pipeline, mut reader) = Pipeline::new(&cfg, 4);

        assert_eq!(pipeline.mode(), OutputMode::Direct);
        assert!(!pipeline.settings().aggregation_available());
        assert_eq!(pipeline.on_trace(2, &rule_ctx(1)), ProbeOutcome::Emitted);
        assert_eq!(pipeline.drain_all(), 0);
        assert!(reader.try_recv().is_some());
    }

    #[test]
    fn test_aggregated_mode_drains_on_demand() {
        let cfg = Config::default();
        let (pipeline, mut reader) = Pipeline::new(&cfg, 2);
        assert_eq!(pipeline.mode(), OutputMode::Multiplexed);

        for _ in 0..3 {
            pipeline.on_trace(1, &rule_ctx(0xabc0));
        }
        assert_eq!(pipeline.occupancy().stored, 1);
        assert!(reader.try_recv().is_none());

        assert_eq!(pipeline.drain_all(), 1);
        let rec = reader.try_recv().unwrap();
        assert_eq!(rec.counter, 3);
        assert_eq!(pipeline.stats().get(StatKind::Merged), 2);
        assert_eq!(pipeline.stats().get(StatKind::Flushed), 1);
    }
}
