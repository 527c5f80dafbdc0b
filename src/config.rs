use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::sink::aggregated::flush::DEFAULT_FLUSH_BATCH;
use crate::sync::{DEFAULT_LOCK_RETRIES, MAX_CPUS};

/// Top-level configuration for the nftrace agent.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Logging verbosity (trace, debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Sampling configuration.
    #[serde(default)]
    pub sampling: SamplingConfig,

    /// Per-core aggregation configuration.
    #[serde(default)]
    pub aggregation: AggregationConfig,

    /// Output channel and printer configuration.
    #[serde(default)]
    pub output: OutputConfig,

    /// Spinlock configuration.
    #[serde(default)]
    pub lock: LockConfig,

    /// Number of per-core slots. Default: online CPUs.
    #[serde(default)]
    pub cpus: Option<usize>,

    /// Trace notification source.
    #[serde(default)]
    pub source: SourceConfig,

    /// How often pipeline counters are exported. Default: 10s.
    #[serde(default = "default_stats_interval", with = "humantime_serde")]
    pub stats_interval: Duration,

    /// Prometheus health metrics server configuration.
    #[serde(default)]
    pub health: HealthConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SamplingConfig {
    /// Keep every Nth eligible notification. 0 keeps all. Default: 0.
    #[serde(default)]
    pub rate: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AggregationConfig {
    /// Aggregation window. "0s" disables aggregation and selects direct
    /// output. Default: 1s.
    #[serde(default = "default_aggregation_interval", with = "humantime_serde")]
    pub interval: Duration,

    /// Aggregation store entries per core. Default: 4096.
    #[serde(default = "default_table_capacity")]
    pub store_capacity: usize,

    /// Pending queue entries per core. Default: 4096.
    #[serde(default = "default_table_capacity")]
    pub queue_capacity: usize,

    /// Maximum records flushed per core per tick. Default: 1000.
    #[serde(default = "default_flush_batch")]
    pub flush_batch: usize,
}

/// Rendering format for consumed records.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OutputConfig {
    /// Shared lane capacity in direct mode. Default: 262144.
    #[serde(default = "default_direct_capacity")]
    pub direct_capacity: usize,

    /// Per-core lane capacity in multiplexed mode. Default: 65536.
    #[serde(default = "default_lane_capacity")]
    pub lane_capacity: usize,

    /// Record format. Default: text.
    #[serde(default)]
    pub format: OutputFormat,

    /// Collapse consecutive identical records. Default: true.
    #[serde(default = "default_true")]
    pub dedupe: bool,

    /// Write records to this file instead of stdout.
    #[serde(default)]
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LockConfig {
    /// Acquisition attempts before giving up. Default: 1000.
    #[serde(default = "default_lock_retries")]
    pub retries: u32,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SourceConfig {
    /// JSON-lines file of recorded trace notifications.
    #[serde(default)]
    pub replay_path: Option<PathBuf>,

    /// Delay between replayed notifications. Default: 0s.
    #[serde(default, with = "humantime_serde")]
    pub pace: Duration,
}

/// Prometheus health metrics server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct HealthConfig {
    /// Listen address (e.g., ":9090"). Empty disables the server.
    #[serde(default = "default_health_addr")]
    pub addr: String,
}

// --- Default value functions ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_stats_interval() -> Duration {
    Duration::from_secs(10)
}

fn default_aggregation_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_table_capacity() -> usize {
    4096
}

fn default_flush_batch() -> usize {
    DEFAULT_FLUSH_BATCH
}

fn default_direct_capacity() -> usize {
    262_144
}

fn default_lane_capacity() -> usize {
    65_536
}

fn default_true() -> bool {
    true
}

fn default_lock_retries() -> u32 {
    DEFAULT_LOCK_RETRIES
}

fn default_health_addr() -> String {
    ":9090".to_string()
}

// --- Default trait impls ---

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            sampling: SamplingConfig::default(),
            aggregation: AggregationConfig::default(),
            output: OutputConfig::default(),
            lock: LockConfig::default(),
            cpus: None,
            source: SourceConfig::default(),
            stats_interval: default_stats_interval(),
            health: HealthConfig::default(),
        }
    }
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            interval: default_aggregation_interval(),
            store_capacity: default_table_capacity(),
            queue_capacity: default_table_capacity(),
            flush_batch: default_flush_batch(),
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            direct_capacity: default_direct_capacity(),
            lane_capacity: default_lane_capacity(),
            format: OutputFormat::default(),
            dedupe: default_true(),
            path: None,
        }
    }
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            retries: default_lock_retries(),
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            addr: default_health_addr(),
        }
    }
}

// --- Validation and loading ---

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let cfg: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        cfg.validate()?;

        Ok(cfg)
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        if self.aggregation.is_enabled() {
            if self.aggregation.store_capacity == 0 {
                bail!("aggregation.store_capacity must be positive");
            }
            if self.aggregation.queue_capacity == 0 {
                bail!("aggregation.queue_capacity must be positive");
            }
            if self.aggregation.flush_batch == 0 {
                bail!("aggregation.flush_batch must be positive");
            }
        }

        if self.output.direct_capacity == 0 {
            bail!("output.direct_capacity must be positive");
        }

        if self.output.lane_capacity == 0 {
            bail!("output.lane_capacity must be positive");
        }

        if self.lock.retries == 0 {
            bail!("lock.retries must be positive");
        }

        if let Some(cpus) = self.cpus {
            if cpus == 0 || cpus > MAX_CPUS {
                bail!("cpus must be between 1 and {MAX_CPUS}, got {cpus}");
            }
        }

        if self.stats_interval.is_zero() {
            bail!("stats_interval must be positive");
        }

        Ok(())
    }
}

impl AggregationConfig {
    /// Aggregation runs only with a non-zero interval.
    pub fn is_enabled(&self) -> bool {
        !self.interval.is_zero()
    }
}
