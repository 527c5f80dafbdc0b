//! Replays recorded trace notifications from a JSON-lines file.
//!
//! Each non-empty line is one [`ReplayEvent`]: a [`TraceContext`] plus an
//! optional core id. Lines without a core are delivered on the core the
//! reader task happens to run on. Malformed lines are reported to the error
//! handlers and skipped.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::context::TraceContext;
use super::{ErrorHandler, EventHandler, Tracer};
use crate::sync::current_cpu;

#[derive(Error, Debug)]
pub enum ReplayError {
    #[error("line {line}: {source}")]
    Malformed {
        line: usize,
        #[source]
        source: serde_json::Error,
    },

    #[error("reading replay input: {0}")]
    Io(#[from] std::io::Error),
}

/// One recorded notification.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplayEvent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<usize>,
    #[serde(flatten)]
    pub context: TraceContext,
}

/// Counts reported when the replay task finishes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplaySummary {
    pub delivered: u64,
    pub malformed: u64,
}

pub struct ReplayTracer {
    path: PathBuf,
    pace: Duration,
    cores: usize,
    event_handlers: Vec<EventHandler>,
    error_handlers: Vec<ErrorHandler>,
    read_task: Option<JoinHandle<ReplaySummary>>,
}

impl ReplayTracer {
    /// Replay `path`, sleeping `pace` between lines and spreading events over `cores`.
    pub fn new(path: impl Into<PathBuf>, pace: Duration, cores: usize) -> Self {
        Self {
            path: path.into(),
            pace,
            cores: cores.max(1),
            event_handlers: Vec::with_capacity(1),
            error_handlers: Vec::with_capacity(1),
            read_task: None,
        }
    }

    /// Wait for the input to be fully consumed. Returns `None` when the
    /// tracer was never started or has already been waited on.
    pub async fn wait(&mut self) -> Result<Option<ReplaySummary>> {
        match self.read_task.take() {
            Some(handle) => Ok(Some(handle.await.context("waiting for replay task")?)),
            None => Ok(None),
        }
    }
}

impl Tracer for ReplayTracer {
    async fn start(&mut self, ctx: CancellationToken) -> Result<()> {
        let file = tokio::fs::File::open(&self.path)
            .await
            .with_context(|| format!("opening replay file {}", self.path.display()))?;

        let event_handlers = Arc::new(std::mem::take(&mut self.event_handlers));
        let error_handlers = Arc::new(std::mem::take(&mut self.error_handlers));
        let pace = self.pace;
        let cores = self.cores;

        let handle = tokio::spawn(async move {
            read_loop(
                BufReader::new(file),
                pace,
                cores,
                event_handlers,
                error_handlers,
                ctx,
            )
            .await
        });
        self.read_task = Some(handle);

        info!(path = %self.path.display(), pace = ?self.pace, "replay tracer started");
        Ok(())
    }

    async fn stop(&mut self) -> Result<()> {
        // The read task exits on cancellation or end of input.
        if let Some(summary) = self.wait().await? {
            info!(
                delivered = summary.delivered,
                malformed = summary.malformed,
                "replay tracer stopped",
            );
        }
        Ok(())
    }

    fn on_event(&mut self, handler: EventHandler) {
        self.event_handlers.push(handler);
    }

    fn on_error(&mut self, handler: ErrorHandler) {
        self.error_handlers.push(handler);
    }
}

// ---------------------------------------------------------------------------
// Read loop
// ---------------------------------------------------------------------------

async fn read_loop<R>(
    reader: BufReader<R>,
    pace: Duration,
    cores: usize,
    event_handlers: Arc<Vec<EventHandler>>,
    error_handlers: Arc<Vec<ErrorHandler>>,
    cancel: CancellationToken,
) -> ReplaySummary
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut summary = ReplaySummary::default();
    let mut lines = reader.lines();
    let mut line_no = 0usize;

    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => break,
            next = lines.next_line() => next,
        };

        let line = match next {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                warn!(error = %e, "replay read error");
                report_error(&error_handlers, ReplayError::Io(e));
                break;
            }
        };
        line_no += 1;

        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }

        let event = match parse_line(trimmed, line_no) {
            Ok(event) => event,
            Err(e) => {
                debug!(error = %e, "skipping malformed replay line");
                summary.malformed += 1;
                report_error(&error_handlers, e);
                continue;
            }
        };

        let cpu = event.cpu.unwrap_or_else(|| current_cpu(cores));
        for handler in event_handlers.iter() {
            handler(cpu, &event.context);
        }
        summary.delivered += 1;

        if !pace.is_zero() {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(pace) => {}
            }
        }
    }

    summary
}

fn parse_line(line: &str, line_no: usize) -> Result<ReplayEvent, ReplayError> {
    serde_json::from_str(line).map_err(|source| ReplayError::Malformed {
        line: line_no,
        source,
    })
}

fn report_error(handlers: &[ErrorHandler], err: ReplayError) {
    match handlers {
        [] => {}
        [only] => only(err.into()),
        many => {
            let msg = err.to_string();
            for handler in many {
                handler(anyhow::anyhow!(msg.clone()));
            }
        }
    }
}
