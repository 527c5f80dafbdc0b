use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{Counter, CounterVec, Encoder, Gauge, Opts, Registry, TextEncoder};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::sink::aggregated::Occupancy;
use crate::tracer::stats::{StatKind, StatsSnapshot, STAT_KIND_COUNT};

const NAMESPACE: &str = "nftrace";

/// Prometheus metrics for the trace pipeline, served on /metrics.
///
/// Pipeline counters live in [`crate::tracer::stats::PipelineStats`] and are
/// folded in periodically through [`HealthMetrics::apply_delta`].
pub struct HealthMetrics {
    registry: Registry,
    addr: String,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,
    local_addr: parking_lot::Mutex<Option<SocketAddr>>,

    /// Pipeline events by kind (seen, sampled_out, merged, ...).
    pub pipeline_events: CounterVec,
    /// Records written by the consumer.
    pub records_consumed: Counter,
    /// Current sampling rate (0 = keep all).
    pub sample_rate: Gauge,
    /// Current aggregation interval; 0 when emitting directly.
    pub aggregation_interval: Gauge,
    /// Number of per-core slots.
    pub cores: Gauge,
    /// Records held across all aggregation stores.
    pub aggregation_stored: Gauge,
    /// Keys waiting in all pending queues.
    pub aggregation_pending: Gauge,

    kind_counters: [Counter; STAT_KIND_COUNT],
}

impl HealthMetrics {
    /// Creates a new health metrics instance with all metrics registered.
    pub fn new(addr: &str) -> Result<Self> {
        let registry = Registry::new();

        let pipeline_events = CounterVec::new(
            Opts::new(
                "pipeline_events_total",
                "Total trace pipeline events by kind.",
            )
            .namespace(NAMESPACE),
            &["kind"],
        )?;
        let records_consumed = Counter::with_opts(
            Opts::new(
                "records_consumed_total",
                "Total trace records written by the consumer.",
            )
            .namespace(NAMESPACE),
        )?;
        let sample_rate = Gauge::with_opts(
            Opts::new("sample_rate", "Current sampling rate (0 keeps all).").namespace(NAMESPACE),
        )?;
        let aggregation_interval = Gauge::with_opts(
            Opts::new(
                "aggregation_interval_seconds",
                "Current aggregation interval (0 means direct output).",
            )
            .namespace(NAMESPACE),
        )?;
        let cores = Gauge::with_opts(
            Opts::new("cores", "Number of per-core pipeline slots.").namespace(NAMESPACE),
        )?;
        let aggregation_stored = Gauge::with_opts(
            Opts::new(
                "aggregation_stored",
                "Records held in aggregation stores across all cores.",
            )
            .namespace(NAMESPACE),
        )?;
        let aggregation_pending = Gauge::with_opts(
            Opts::new(
                "aggregation_pending",
                "Keys waiting in pending queues across all cores.",
            )
            .namespace(NAMESPACE),
        )?;

        registry.register(Box::new(pipeline_events.clone()))?;
        registry.register(Box::new(records_consumed.clone()))?;
        registry.register(Box::new(sample_rate.clone()))?;
        registry.register(Box::new(aggregation_interval.clone()))?;
        registry.register(Box::new(cores.clone()))?;
        registry.register(Box::new(aggregation_stored.clone()))?;
        registry.register(Box::new(aggregation_pending.clone()))?;

        // Resolve label children once so every kind shows up at zero.
        let kind_counters =
            StatKind::all().map(|kind| pipeline_events.with_label_values(&[kind.as_str()]));

        Ok(Self {
            registry,
            addr: addr.to_string(),
            shutdown: parking_lot::Mutex::new(None),
            local_addr: parking_lot::Mutex::new(None),
            pipeline_events,
            records_consumed,
            sample_rate,
            aggregation_interval,
            cores,
            aggregation_stored,
            aggregation_pending,
            kind_counters,
        })
    }

    /// Add counter growth since the previous export.
    pub fn apply_delta(&self, delta: &StatsSnapshot) {
        for (kind, n) in delta.iter() {
            if n == 0 {
                continue;
            }
            if let Some(counter) = self.kind_counters.get(kind as usize) {
                counter.inc_by(n as f64);
            }
        }
    }

    /// Publish the current sample rate and interval as gauges.
    pub fn set_settings(&self, sample_rate: u64, interval: Duration) {
        self.sample_rate.set(sample_rate as f64);
        self.aggregation_interval.set(interval.as_secs_f64());
    }

    /// Publish aggregation occupancy as gauges.
    pub fn set_occupancy(&self, occupancy: &Occupancy) {
        self.aggregation_stored.set(occupancy.stored as f64);
        self.aggregation_pending.set(occupancy.pending as f64);
    }

    /// Render the registry in Prometheus text format.
    pub fn encode(&self) -> Result<String> {
        encode_registry(&self.registry)
    }

    /// Address the server is bound to, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    /// Starts the HTTP server serving /metrics and /healthz.
    pub async fn start(&self) -> Result<()> {
        // Parse address, handling ":port" shorthand.
        let bind_addr = if self.addr.starts_with(':') {
            format!("0.0.0.0{}", self.addr)
        } else {
            self.addr.clone()
        };

        let app_state = Arc::new(AppState {
            registry: self.registry.clone(),
        });

        let app = Router::new()
            .route("/metrics", get(metrics_handler))
            .route("/healthz", get(healthz_handler))
            .with_state(app_state);

        let listener = TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("listening on {bind_addr}"))?;

        let local_addr = listener.local_addr().context("getting local address")?;
        *self.local_addr.lock() = Some(local_addr);

        let cancel = CancellationToken::new();
        *self.shutdown.lock() = Some(cancel.clone());

        tokio::spawn(async move {
            tracing::info!(addr = %local_addr, "health metrics server started");

            let result = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move {
                cancel.cancelled().await;
            })
            .await;

            if let Err(e) = result {
                tracing::error!(error = %e, "health metrics server error");
            }
        });

        Ok(())
    }

    /// Gracefully shuts down the health metrics server.
    pub async fn stop(&self) -> Result<()> {
        if let Some(cancel) = self.shutdown.lock().take() {
            cancel.cancel();
        }

        Ok(())
    }
}

/// Shared state for axum handlers.
struct AppState {
    registry: Registry,
}

fn encode_registry(registry: &Registry) -> Result<String> {
    let mut buffer = Vec::new();
    TextEncoder::new()
        .encode(&registry.gather(), &mut buffer)
        .context("encoding metrics")?;
    String::from_utf8(buffer).context("converting metrics to string")
}

/// GET /metrics - Prometheus text format.
async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match encode_registry(&state.registry) {
        Ok(text) => (StatusCode::OK, text),
        Err(e) => {
            tracing::error!(error = %e, "rendering metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "encoding error".to_string(),
            )
        }
    }
}

/// GET /healthz - Simple health check.
async fn healthz_handler() -> &'static str {
    "ok"
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;
    use crate::tracer::stats::PipelineStats;

    #[test]
    fn test_apply_delta_accumulates() {
        let metrics = HealthMetrics::new("127.0.0.1:0").unwrap();
        let stats = PipelineStats::new();

        stats.record_n(StatKind::PacketsSeen, 5);
        stats.record(StatKind::Merged);
        let first = stats.snapshot();
        metrics.apply_delta(&first.delta(&StatsSnapshot::default()));

        stats.record_n(StatKind::PacketsSeen, 2);
        let second = stats.snapshot();
        metrics.apply_delta(&second.delta(&first));

        let seen = metrics
            .pipeline_events
            .with_label_values(&[StatKind::PacketsSeen.as_str()])
            .get();
        assert_eq!(seen, 7.0);
        let merged = metrics
            .pipeline_events
            .with_label_values(&[StatKind::Merged.as_str()])
            .get();
        assert_eq!(merged, 1.0);
    }

    #[test]
    fn test_encode_lists_every_kind() {
        let metrics = HealthMetrics::new("127.0.0.1:0").unwrap();
        metrics.set_settings(5, Duration::from_millis(500));

        let text = metrics.encode().unwrap();
        assert!(text.contains("nftrace_sample_rate 5"));
        assert!(text.contains("nftrace_aggregation_interval_seconds 0.5"));
        for kind in StatKind::all() {
            assert!(
                text.contains(&format!("kind=\"{}\"", kind.as_str())),
                "missing kind {kind}",
            );
        }
    }

    async fn http_get(addr: SocketAddr, path: &str) -> String {
        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        let req = format!("GET {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n");
        stream.write_all(req.as_bytes()).await.unwrap();
        let mut body = String::new();
        stream.read_to_string(&mut body).await.unwrap();
        body
    }

    #[tokio::test]
    async fn test_server_serves_metrics_and_healthz() {
        let metrics = HealthMetrics::new("127.0.0.1:0").unwrap();
        metrics.records_consumed.inc_by(3.0);
        metrics.start().await.unwrap();
        let addr = metrics.local_addr().unwrap();

        let health = http_get(addr, "/healthz").await;
        assert!(health.starts_with("HTTP/1.1 200"));
        assert!(health.ends_with("ok"));

        let body = http_get(addr, "/metrics").await;
        assert!(body.contains("nftrace_records_consumed_total 3"));

        metrics.stop().await.unwrap();
    }
}
