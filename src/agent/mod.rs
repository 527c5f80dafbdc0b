pub mod pipeline;

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::export::health::HealthMetrics;
use crate::export::printer::RecordPrinter;
use crate::sink::output::OutputReader;
use crate::sync::online_cpus;
use crate::tracer::replay::{ReplaySummary, ReplayTracer};
use crate::tracer::stats::{StatKind, StatsSnapshot};
use crate::tracer::Tracer;

use self::pipeline::Pipeline;

/// How often the consumer flushes a held dedupe line and its writer.
const CONSUMER_FLUSH_PERIOD: Duration = Duration::from_secs(1);

type OutputWriter = Box<dyn Write + Send>;

/// Agent orchestrates all components: trace source, pipeline, flush
/// tickers, output consumer and health metrics.
pub struct Agent {
    cfg: Config,
    health: Arc<HealthMetrics>,
    pipeline: Option<Arc<Pipeline>>,
    source: Option<ReplayTracer>,
    flush_tasks: Vec<JoinHandle<()>>,
    consumer: Option<JoinHandle<u64>>,
    reporter: Option<JoinHandle<()>>,
    source_cancel: CancellationToken,
    flush_cancel: CancellationToken,
    consumer_cancel: CancellationToken,
    cancel: CancellationToken,
}

impl Agent {
    /// Creates a new Agent, initializing health metrics.
    pub fn new(cfg: Config) -> Result<Self> {
        let health =
            Arc::new(HealthMetrics::new(&cfg.health.addr).context("creating health metrics")?);

        Ok(Self {
            cfg,
            health,
            pipeline: None,
            source: None,
            flush_tasks: Vec::new(),
            consumer: None,
            reporter: None,
            source_cancel: CancellationToken::new(),
            flush_cancel: CancellationToken::new(),
            consumer_cancel: CancellationToken::new(),
            cancel: CancellationToken::new(),
        })
    }

    /// Start all components and begin tracing.
    pub async fn start(&mut self) -> Result<()> {
        // 0. Health metrics server first so probes respond.
        if self.cfg.health.addr.is_empty() {
            info!("health metrics server disabled");
        } else {
            self.health
                .start()
                .await
                .context("starting health metrics server")?;
        }

        // 1. Build the pipeline.
        let cores = self.cfg.cpus.unwrap_or_else(online_cpus);
        let (pipeline, reader) = Pipeline::new(&self.cfg, cores);
        let pipeline = Arc::new(pipeline);

        self.health.cores.set(cores as f64);
        self.health
            .set_settings(self.cfg.sampling.rate, self.cfg.aggregation.interval);

        info!(
            cores,
            mode = %pipeline.mode(),
            sample_rate = self.cfg.sampling.rate,
            interval = ?self.cfg.aggregation.interval,
            "pipeline created",
        );

        // 2. Output consumer.
        let writer = open_output(&self.cfg).context("opening trace output")?;
        let printer = RecordPrinter::new(writer, self.cfg.output.format, self.cfg.output.dedupe);
        let health = Arc::clone(&self.health);
        let consumer_cancel = self.consumer_cancel.clone();
        self.consumer = Some(tokio::spawn(async move {
            run_consumer(reader, printer, health, consumer_cancel).await
        }));

        // 3. Flush tickers.
        self.flush_tasks = pipeline.spawn_flush(self.flush_cancel.clone());

        // 4. Stats reporter.
        self.reporter = Some(self.spawn_stats_reporter(Arc::clone(&pipeline)));

        self.pipeline = Some(Arc::clone(&pipeline));

        // 5. Trace source.
        match &self.cfg.source.replay_path {
            Some(path) => {
                let mut tracer = ReplayTracer::new(path, self.cfg.source.pace, cores);

                let pipeline_ev = Arc::clone(&pipeline);
                tracer.on_event(Box::new(move |cpu, ctx| {
                    pipeline_ev.on_trace(cpu, ctx);
                }));
                tracer.on_error(Box::new(|err| {
                    warn!(error = %err, "trace source error");
                }));

                tracer
                    .start(self.source_cancel.clone())
                    .await
                    .context("starting replay tracer")?;
                self.source = Some(tracer);
            }
            None => {
                warn!("no trace source configured, pipeline will stay idle");
            }
        }

        info!("agent fully started");

        Ok(())
    }

    /// Apply runtime tunables from a freshly loaded config. Only the sample
    /// rate and aggregation interval take effect without a restart.
    pub fn reload(&mut self, cfg: Config) -> Result<()> {
        let Some(pipeline) = &self.pipeline else {
            self.cfg = cfg;
            return Ok(());
        };

        pipeline
            .settings()
            .update(cfg.sampling.rate, cfg.aggregation.interval)
            .context("updating pipeline settings")?;

        self.health
            .set_settings(cfg.sampling.rate, cfg.aggregation.interval);

        info!(
            sample_rate = cfg.sampling.rate,
            interval = ?cfg.aggregation.interval,
            "settings reloaded",
        );

        self.cfg.sampling = cfg.sampling;
        self.cfg.aggregation.interval = cfg.aggregation.interval;

        Ok(())
    }

    /// Wait until the trace source has delivered everything it has. Returns
    /// `None` when there is no finite source.
    pub async fn wait_source(&mut self) -> Result<Option<ReplaySummary>> {
        match &mut self.source {
            Some(source) => source.wait().await,
            None => Ok(None),
        }
    }

    /// Gracefully stop all components, emitting everything still held in
    /// the aggregation stores.
    pub async fn stop(&mut self) -> Result<()> {
        // Stop the source so nothing new enters the pipeline.
        self.source_cancel.cancel();
        if let Some(source) = &mut self.source {
            if let Err(e) = source.stop().await {
                error!(error = %e, "error stopping trace source");
            }
        }

        // Stop flush tickers, then drain what they left behind.
        self.flush_cancel.cancel();
        for task in self.flush_tasks.drain(..) {
            if let Err(e) = task.await {
                error!(error = %e, "flush task failed");
            }
        }

        if let Some(pipeline) = &self.pipeline {
            let drained = pipeline.drain_all();
            info!(drained, "final drain complete");
        }

        // Consumer closes the channel and writes out what is buffered.
        self.consumer_cancel.cancel();
        if let Some(consumer) = self.consumer.take() {
            match consumer.await {
                Ok(consumed) => info!(consumed, "output consumer stopped"),
                Err(e) => error!(error = %e, "output consumer failed"),
            }
        }

        // Reporter exports the final counters on its way out.
        self.cancel.cancel();
        if let Some(reporter) = self.reporter.take() {
            if let Err(e) = reporter.await {
                error!(error = %e, "stats reporter failed");
            }
        }

        // Stop health metrics server.
        self.health.stop().await?;

        Ok(())
    }

    /// The running pipeline, once started.
    pub fn pipeline(&self) -> Option<&Arc<Pipeline>> {
        self.pipeline.as_ref()
    }

    /// Spawn background counter exporter.
    fn spawn_stats_reporter(&self, pipeline: Arc<Pipeline>) -> JoinHandle<()> {
        let cancel = self.cancel.clone();
        let health = Arc::clone(&self.health);
        let period = self.cfg.stats_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            let mut prev = StatsSnapshot::default();

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        export_stats(&pipeline, &health, &mut prev, period);
                        return;
                    }
                    _ = ticker.tick() => {
                        export_stats(&pipeline, &health, &mut prev, period);
                    }
                }
            }
        })
    }
}

fn export_stats(
    pipeline: &Pipeline,
    health: &HealthMetrics,
    prev: &mut StatsSnapshot,
    period: Duration,
) {
    let now = pipeline.stats().snapshot();
    let delta = now.delta(prev);
    *prev = now;

    health.apply_delta(&delta);
    health.set_occupancy(&pipeline.occupancy());

    if delta.is_zero() {
        return;
    }

    info!(
        seen = delta.get(StatKind::PacketsSeen),
        sampled_out = delta.get(StatKind::SampledOut),
        merged = delta.get(StatKind::Merged),
        flushed = delta.get(StatKind::Flushed),
        direct = delta.get(StatKind::DirectEmitted),
        dropped = delta.get(StatKind::OutputDropped),
        window = ?period,
        "pipeline stats",
    );

    for (kind, count) in delta.iter().filter(|(_, n)| *n > 0) {
        debug!(kind = %kind, count, "  by kind");
    }
}

fn open_output(cfg: &Config) -> Result<OutputWriter> {
    match &cfg.output.path {
        Some(path) => {
            let file = File::create(path)
                .with_context(|| format!("creating output file {}", path.display()))?;
            Ok(Box::new(BufWriter::new(file)))
        }
        None => Ok(Box::new(BufWriter::new(io::stdout()))),
    }
}

/// Write records until cancelled, then close the channel, write whatever
/// is still buffered and flush. Returns the number of records written.
async fn run_consumer(
    mut reader: OutputReader,
    mut printer: RecordPrinter<OutputWriter>,
    health: Arc<HealthMetrics>,
    cancel: CancellationToken,
) -> u64 {
    let mut consumed = 0u64;
    let mut ticker = tokio::time::interval(CONSUMER_FLUSH_PERIOD);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            next = reader.recv() => {
                let Some(record) = next else { break };
                if let Err(e) = printer.write(&record) {
                    error!(error = %e, "writing trace record, consumer stopping");
                    return consumed;
                }
                consumed += 1;
                health.records_consumed.inc();
            }
            _ = ticker.tick() => {
                if let Err(e) = printer.flush() {
                    warn!(error = %e, "flushing trace output");
                }
            }
        }
    }

    reader.close();
    for record in reader.drain() {
        if let Err(e) = printer.write(&record) {
            error!(error = %e, "writing trace record during shutdown");
            break;
        }
        consumed += 1;
        health.records_consumed.inc();
    }

    if let Err(e) = printer.flush() {
        warn!(error = %e, "flushing trace output");
    }

    consumed
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    const RULE_LINE: &str = r#"{"cpu":0,"trace_type":3,"rule_handle":7,"chain":{"table_name":"filter","chain_name":"input","family":2},"verdict":{"code":1},"packet":{"identity":4096,"flow_hash":2,"iif":3}}"#;

    fn config(replay: &std::path::Path, out: &std::path::Path, interval: Duration) -> Config {
        let mut cfg = Config::default();
        cfg.cpus = Some(2);
        cfg.health.addr = String::new();
        cfg.aggregation.interval = interval;
        cfg.output.path = Some(out.to_path_buf());
        cfg.output.dedupe = false;
        cfg.source.replay_path = Some(replay.to_path_buf());
        cfg
    }

    fn replay_file(lines: &[&str]) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        for line in lines {
            writeln!(file, "{line}").unwrap();
        }
        file
    }

    #[tokio::test]
    async fn test_replay_aggregates_and_drains_on_stop() {
        let replay = replay_file(&[RULE_LINE, RULE_LINE, RULE_LINE]);
        let out = tempfile::NamedTempFile::new().unwrap();

        let mut agent =
            Agent::new(config(replay.path(), out.path(), Duration::from_secs(60))).unwrap();
        agent.start().await.unwrap();

        let summary = agent.wait_source().await.unwrap().unwrap();
        assert_eq!(summary.delivered, 3);

        agent.stop().await.unwrap();

        let text = std::fs::read_to_string(out.path()).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 1);
        assert!(lines[0].contains("filter input handle=7"));
        assert!(lines[0].ends_with("cnt=3"));
    }

    #[tokio::test]
    async fn test_replay_direct_mode_writes_each_event() {
        let replay = replay_file(&[RULE_LINE, RULE_LINE]);
        let out = tempfile::NamedTempFile::new().unwrap();

        let mut agent = Agent::new(config(replay.path(), out.path(), Duration::ZERO)).unwrap();
        agent.start().await.unwrap();
        agent.wait_source().await.unwrap();
        agent.stop().await.unwrap();

        let text = std::fs::read_to_string(out.path()).unwrap();
        assert_eq!(text.lines().count(), 2);
        assert!(text.lines().all(|l| l.ends_with("cnt=1")));
    }

    #[tokio::test]
    async fn test_reload_updates_settings() {
        let replay = replay_file(&[]);
        let out = tempfile::NamedTempFile::new().unwrap();

        let mut agent =
            Agent::new(config(replay.path(), out.path(), Duration::from_secs(1))).unwrap();
        agent.start().await.unwrap();

        let mut next = config(replay.path(), out.path(), Duration::from_millis(250));
        next.sampling.rate = 4;
        agent.reload(next).unwrap();

        let settings = agent.pipeline().unwrap().settings();
        assert_eq!(settings.sample_rate(), 4);
        assert_eq!(settings.time_interval(), Duration::from_millis(250));

        agent.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_reload_cannot_enable_aggregation_in_direct_mode() {
        let replay = replay_file(&[]);
        let out = tempfile::NamedTempFile::new().unwrap();

        let mut agent = Agent::new(config(replay.path(), out.path(), Duration::ZERO)).unwrap();
        agent.start().await.unwrap();

        let err = agent
            .reload(config(replay.path(), out.path(), Duration::from_secs(1)))
            .unwrap_err();
        assert!(format!("{err:#}").contains("direct mode"));

        agent.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_missing_replay_file_fails_start() {
        let out = tempfile::NamedTempFile::new().unwrap();
        let cfg = config(
            std::path::Path::new("/nonexistent/replay.jsonl"),
            out.path(),
            Duration::from_secs(1),
        );

        let mut agent = Agent::new(cfg).unwrap();
        let err = agent.start().await.unwrap_err();
        assert!(format!("{err:#}").contains("opening replay file"));
        agent.stop().await.unwrap();
    }
}
