use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::signal::unix::{signal, SignalKind};
use tracing_subscriber::{fmt, EnvFilter};

use nftrace::agent::Agent;
use nftrace::config::Config;

/// nftables rule-evaluation tracer with per-core aggregation.
#[derive(Parser)]
#[command(name = "nftrace", about)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Logging verbosity level (trace, debug, info, warn, error).
    /// Overrides the config file.
    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Print version information and exit.
    Version,

    /// Run recorded trace notifications through the pipeline, drain and exit.
    Replay {
        /// JSON-lines file of trace notifications.
        file: PathBuf,
    },
}

/// Build-time version info, injected via RUSTFLAGS or build.rs.
mod version {
    /// Release version string (set at build time).
    pub const RELEASE: &str = env!("CARGO_PKG_VERSION");

    /// Git commit hash (set at build time via env, or "unknown").
    pub fn git_commit() -> &'static str {
        option_env!("GIT_COMMIT").unwrap_or("unknown")
    }

    /// Full version string with platform info.
    pub fn full() -> String {
        format!(
            "{} (commit: {}, {}/{})",
            RELEASE,
            git_commit(),
            std::env::consts::OS,
            std::env::consts::ARCH,
        )
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Handle version subcommand before anything else.
    if let Some(Command::Version) = &cli.command {
        println!("nftrace {}", version::full());
        return Ok(());
    }

    // Replay runs on defaults when no config is given; the agent needs one.
    let mut cfg = match (&cli.config, &cli.command) {
        (Some(path), _) => load_config(path)?,
        (None, Some(Command::Replay { .. })) => Config::default(),
        (None, _) => anyhow::bail!("--config is required (use --help for usage)"),
    };

    // Initialize tracing.
    let level = cli.log_level.as_deref().unwrap_or(&cfg.log_level);
    let filter =
        EnvFilter::try_new(level).with_context(|| format!("invalid log level: {level}"))?;

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    tracing::info!(
        version = version::RELEASE,
        commit = version::git_commit(),
        "starting nftrace",
    );

    // Build and run the tokio runtime.
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    match cli.command {
        Some(Command::Replay { file }) => {
            cfg.source.replay_path = Some(file);
            rt.block_on(replay(cfg))
        }
        _ => rt.block_on(run(cfg, cli.config)),
    }
}

fn load_config(path: &Path) -> Result<Config> {
    Config::load(path).with_context(|| format!("loading config from {}", path.display()))
}

async fn run(cfg: Config, config_path: Option<PathBuf>) -> Result<()> {
    let mut sigterm = signal(SignalKind::terminate()).context("registering SIGTERM handler")?;
    let mut sighup = signal(SignalKind::hangup()).context("registering SIGHUP handler")?;

    // Start the agent.
    let mut agent = Agent::new(cfg)?;
    agent.start().await?;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("received SIGINT, shutting down");
                break;
            }
            _ = sigterm.recv() => {
                tracing::info!("received SIGTERM, shutting down");
                break;
            }
            _ = sighup.recv() => {
                tracing::info!("received SIGHUP, reloading config");
                let Some(path) = config_path.as_deref() else {
                    tracing::warn!("no config file to reload");
                    continue;
                };
                if let Err(e) = load_config(path).and_then(|cfg| agent.reload(cfg)) {
                    tracing::warn!(error = format!("{e:#}"), "config reload failed");
                }
            }
        }
    }

    // Graceful shutdown.
    agent.stop().await?;

    tracing::info!("nftrace stopped");

    Ok(())
}

async fn replay(cfg: Config) -> Result<()> {
    let mut agent = Agent::new(cfg)?;
    agent.start().await?;

    tokio::select! {
        res = agent.wait_source() => {
            if let Some(summary) = res? {
                tracing::info!(
                    delivered = summary.delivered,
                    malformed = summary.malformed,
                    "replay input consumed",
                );
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("received SIGINT, stopping replay");
        }
    }

    agent.stop().await?;

    tracing::info!("nftrace replay finished");

    Ok(())
}
