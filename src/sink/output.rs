//! Bounded output channel between the probe/flush side and the consumer.
//!
//! Direct mode uses one shared lane. Multiplexed mode gives every core its
//! own lane and the reader interleaves them round-robin, so there is no
//! cross-core ordering. Publishing never waits: a full lane drops the record
//! and counts it.

use std::future::poll_fn;
use std::sync::Arc;
use std::task::{Context, Poll};

use thiserror::Error;
use tokio::sync::mpsc::{self, error::TryRecvError, error::TrySendError};

use crate::tracer::record::TraceRecord;
use crate::tracer::stats::{PipelineStats, StatKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    Direct,
    Multiplexed,
}

impl OutputMode {
    /// Mode name used in logs and metrics.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::Multiplexed => "multiplexed",
        }
    }
}

impl std::fmt::Display for OutputMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishError {
    #[error("output lane full")]
    Full,

    #[error("output reader closed")]
    Closed,
}

/// Producer half. Cheap to clone.
#[derive(Clone)]
pub struct OutputChannel {
    mode: OutputMode,
    lanes: Arc<[mpsc::Sender<TraceRecord>]>,
    stats: Arc<PipelineStats>,
}

impl OutputChannel {
    /// Create the channel with `capacity` records per lane. Multiplexed mode
    /// gets `cores` lanes, direct mode always one.
    pub fn new(
        mode: OutputMode,
        cores: usize,
        capacity: usize,
        stats: Arc<PipelineStats>,
    ) -> (Self, OutputReader) {
        let lane_count = match mode {
            OutputMode::Direct => 1,
            OutputMode::Multiplexed => cores.max(1),
        };

        let (senders, receivers): (Vec<_>, Vec<_>) =
            (0..lane_count).map(|_| mpsc::channel(capacity.max(1))).unzip();

        (
            Self {
                mode,
                lanes: senders.into(),
                stats,
            },
            OutputReader {
                lanes: receivers,
                next: 0,
            },
        )
    }

    /// Delivery mode chosen at startup.
    pub fn mode(&self) -> OutputMode {
        self.mode
    }

    /// Number of underlying channels.
    pub fn lanes(&self) -> usize {
        self.lanes.len()
    }

    /// Reserve-and-submit without waiting. Failures are counted as
    /// `output_dropped`.
    pub fn publish(&self, cpu: usize, record: TraceRecord) -> Result<(), PublishError> {
        let lane = match self.mode {
            OutputMode::Direct => self.lanes.first(),
            OutputMode::Multiplexed => self.lanes.get(cpu % self.lanes.len().max(1)),
        };
        let Some(lane) = lane else {
            self.stats.record(StatKind::OutputDropped);
            return Err(PublishError::Closed);
        };

        let result = match lane.try_reserve() {
            Ok(permit) => {
                permit.send(record);
                Ok(())
            }
            Err(TrySendError::Full(())) => Err(PublishError::Full),
            Err(TrySendError::Closed(())) => Err(PublishError::Closed),
        };

        if result.is_err() {
            self.stats.record(StatKind::OutputDropped);
        }
        result
    }
}

impl std::fmt::Debug for OutputChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutputChannel")
            .field("mode", &self.mode)
            .field("lanes", &self.lanes.len())
            .finish()
    }
}

/// Consumer half. Interleaves lanes round-robin.
#[derive(Debug)]
pub struct OutputReader {
    lanes: Vec<mpsc::Receiver<TraceRecord>>,
    next: usize,
}

impl OutputReader {
    /// Wait for the next record from any lane. Returns `None` once every
    /// lane is closed and empty.
    pub async fn recv(&mut self) -> Option<TraceRecord> {
        poll_fn(|cx| self.poll_recv(cx)).await
    }

    /// Poll-based variant of `recv`.
    pub fn poll_recv(&mut self, cx: &mut Context<'_>) -> Poll<Option<TraceRecord>> {
        let n = self.lanes.len();
        let mut closed = 0;

        for step in 0..n {
            let idx = (self.next + step) % n;
            let Some(lane) = self.lanes.get_mut(idx) else {
                continue;
            };

            match lane.poll_recv(cx) {
                Poll::Ready(Some(record)) => {
                    self.next = (idx + 1) % n;
                    return Poll::Ready(Some(record));
                }
                Poll::Ready(None) => closed += 1,
                Poll::Pending => {}
            }
        }

        if closed == n {
            Poll::Ready(None)
        } else {
            Poll::Pending
        }
    }

    /// Non-waiting variant of [`recv`](Self::recv).
    pub fn try_recv(&mut self) -> Option<TraceRecord> {
        let n = self.lanes.len();
        for step in 0..n {
            let idx = (self.next + step) % n;
            let Some(lane) = self.lanes.get_mut(idx) else {
                continue;
            };

            match lane.try_recv() {
                Ok(record) => {
                    self.next = (idx + 1) % n;
                    return Some(record);
                }
                Err(TryRecvError::Empty | TryRecvError::Disconnected) => {}
            }
        }
        None
    }

    /// Stop accepting new records. Already buffered records stay readable.
    pub fn close(&mut self) {
        for lane in &mut self.lanes {
            lane.close();
        }
    }

    /// Take every record currently buffered.
    pub fn drain(&mut self) -> Vec<TraceRecord> {
        std::iter::from_fn(|| self.try_recv()).collect()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn record(id: u32) -> TraceRecord {
        TraceRecord {
            id,
            counter: 1,
            ..Default::default()
        }
    }

    #[test]
    fn test_direct_mode_single_lane() {
        let stats = Arc::new(PipelineStats::new());
        let (tx, mut rx) = OutputChannel::new(OutputMode::Direct, 8, 4, Arc::clone(&stats));
        assert_eq!(tx.lanes(), 1);

        tx.publish(3, record(1)).unwrap();
        tx.publish(5, record(2)).unwrap();
        let ids: Vec<u32> = rx.drain().iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![1, 2]);
    }

    #[test]
    fn test_full_lane_drops_and_counts() {
        let stats = Arc::new(PipelineStats::new());
        let (tx, mut rx) = OutputChannel::new(OutputMode::Direct, 1, 2, Arc::clone(&stats));

        tx.publish(0, record(1)).unwrap();
        tx.publish(0, record(2)).unwrap();
        assert_eq!(tx.publish(0, record(3)), Err(PublishError::Full));
        assert_eq!(stats.get(StatKind::OutputDropped), 1);

        assert_eq!(rx.drain().len(), 2);
        tx.publish(0, record(4)).unwrap();
    }

    #[test]
    fn test_multiplexed_lanes_are_per_core() {
        let stats = Arc::new(PipelineStats::new());
        let (tx, mut rx) = OutputChannel::new(OutputMode::Multiplexed, 2, 1, Arc::clone(&stats));
        assert_eq!(tx.lanes(), 2);

        // One slot per lane: a full core-0 lane does not block core 1.
        tx.publish(0, record(1)).unwrap();
        assert!(tx.publish(0, record(2)).is_err());
        tx.publish(1, record(3)).unwrap();

        let mut ids: Vec<u32> = rx.drain().iter().map(|r| r.id).collect();
        ids.sort_unstable();
        assert_eq!(ids, vec![1, 3]);
    }

    #[test]
    fn test_round_robin_interleave() {
        let stats = Arc::new(PipelineStats::new());
        let (tx, mut rx) = OutputChannel::new(OutputMode::Multiplexed, 2, 8, stats);
        for id in [10, 11, 12] {
            tx.publish(0, record(id)).unwrap();
        }
        for id in [20, 21] {
            tx.publish(1, record(id)).unwrap();
        }

        let ids: Vec<u32> = rx.drain().iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![10, 20, 11, 21, 12]);
    }

    #[test]
    fn test_closed_reader_rejects() {
        let stats = Arc::new(PipelineStats::new());
        let (tx, mut rx) = OutputChannel::new(OutputMode::Direct, 1, 4, Arc::clone(&stats));
        tx.publish(0, record(1)).unwrap();
        rx.close();

        assert_eq!(tx.publish(0, record(2)), Err(PublishError::Closed));
        assert_eq!(rx.try_recv().map(|r| r.id), Some(1));
        assert_eq!(stats.get(StatKind::OutputDropped), 1);
    }

    #[tokio::test]
    async fn test_recv_ends_when_all_senders_drop() {
        let stats = Arc::new(PipelineStats::new());
        let (tx, mut rx) = OutputChannel::new(OutputMode::Multiplexed, 3, 4, stats);
        tx.publish(2, record(9)).unwrap();
        drop(tx);

        assert_eq!(rx.recv().await.map(|r| r.id), Some(9));
        assert!(rx.recv().await.is_none());
    }
}
