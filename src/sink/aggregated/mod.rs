//! Per-core aggregation of trace records.
//!
//! Each core owns a store of in-flight records and a FIFO of ids waiting
//! for the flush job, both behind that core's spinlock. A new store entry is
//! always paired with exactly one queued id; when the queue rejects the id
//! the entry is removed again so nothing is left that the flush job cannot
//! reach.

pub mod flush;
pub mod queue;
pub mod store;

use crate::sync::{LockError, PerCpu, SpinLock};
use crate::tracer::record::TraceRecord;

use self::queue::PendingQueue;
use self::store::AggregationStore;

/// One core's working set.
#[derive(Debug)]
pub struct CoreSlot {
    pub store: AggregationStore,
    pub queue: PendingQueue,
}

impl CoreSlot {
    /// Empty store and queue with the given bounds.
    pub fn new(store_capacity: usize, queue_capacity: usize) -> Self {
        Self {
            store: AggregationStore::new(store_capacity),
            queue: PendingQueue::new(queue_capacity),
        }
    }
}

/// Why a record could not be aggregated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fallback {
    /// No slot exists for the requested core.
    NoSlot,
    /// The core's lock stayed held for every retry.
    Contended,
    StoreFull,
    QueueFull,
}

/// Result of offering a record to the aggregation state.
#[derive(Debug)]
pub enum Absorbed {
    /// An existing record's counter was bumped to the contained value.
    Merged(u64),
    /// A new record was stored and its id queued for flush.
    Queued,
    /// Aggregation was unavailable; the record is handed back for direct
    /// emission.
    Fallback(Fallback, TraceRecord),
}

/// Outcome of one bounded drain pass over a core.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub emitted: usize,
    /// Ids popped whose record was no longer in the store.
    pub missed: usize,
    /// Ids still queued after the pass.
    pub remaining: usize,
}

/// Occupancy across all cores that could be inspected.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Occupancy {
    pub stored: usize,
    pub pending: usize,
    pub contended_cores: usize,
}

#[derive(Debug)]
pub struct AggregationState {
    cores: PerCpu<SpinLock<CoreSlot>>,
    retries: u32,
}

impl AggregationState {
    /// One slot per core, each with its own lock.
    pub fn new(cores: usize, store_capacity: usize, queue_capacity: usize, retries: u32) -> Self {
        Self {
            cores: PerCpu::new(cores, |_| {
                SpinLock::new(CoreSlot::new(store_capacity, queue_capacity))
            }),
            retries,
        }
    }

    /// Number of per-core slots.
    pub fn cores(&self) -> usize {
        self.cores.len()
    }

    /// Merge `record` into the core's store, or store and queue it when its
    /// id is new.
    pub fn absorb(&self, cpu: usize, record: TraceRecord) -> Absorbed {
        let Some(lock) = self.cores.get(cpu) else {
            return Absorbed::Fallback(Fallback::NoSlot, record);
        };
        let Ok(mut slot) = lock.lock(self.retries) else {
            return Absorbed::Fallback(Fallback::Contended, record);
        };

        let key = record.id;
        if let Some(count) = slot.store.increment(key, 1) {
            return Absorbed::Merged(count);
        }

        if slot.store.insert(key, record).is_err() {
            return Absorbed::Fallback(Fallback::StoreFull, record);
        }

        if slot.queue.push(key).is_err() {
            slot.store.remove(key);
            return Absorbed::Fallback(Fallback::QueueFull, record);
        }

        Absorbed::Queued
    }

    /// Pop up to `max` ids from the core's queue and hand each matching
    /// record to `emit`, removing it from the store.
    pub fn drain(
        &self,
        cpu: usize,
        max: usize,
        mut emit: impl FnMut(TraceRecord),
    ) -> Result<DrainReport, LockError> {
        let Some(lock) = self.cores.get(cpu) else {
            return Ok(DrainReport::default());
        };
        let mut slot = lock.lock(self.retries)?;

        let mut report = DrainReport::default();
        for _ in 0..max {
            let Some(key) = slot.queue.pop() else {
                break;
            };

            match slot.store.remove(key) {
                Some(record) => {
                    emit(record);
                    report.emitted += 1;
                }
                None => report.missed += 1,
            }
        }
        report.remaining = slot.queue.len();

        Ok(report)
    }

    /// Sum store and queue sizes; cores whose lock is held are skipped.
    pub fn occupancy(&self) -> Occupancy {
        let mut occ = Occupancy::default();
        for (_, lock) in self.cores.iter() {
            match lock.lock(self.retries) {
                Ok(slot) => {
                    occ.stored += slot.store.len();
                    occ.pending += slot.queue.len();
                }
                Err(_) => occ.contended_cores += 1,
            }
        }
        occ
    }

    #[cfg(test)]
    pub(crate) fn slot(&self, cpu: usize) -> Option<&SpinLock<CoreSlot>> {
        self.cores.get(cpu)
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
            rule_handle: u64::from(id) * 10,
            ..Default::default()
        }
    }

    fn drain_all(state: &AggregationState, cpu: usize) -> Vec<TraceRecord> {
        let mut out = Vec::new();
        state.drain(cpu, usize::MAX, |r| out.push(r)).unwrap();
        out
    }

    #[test]
    fn test_new_then_merge() {
        let state = AggregationState::new(2, 8, 8, 10);
        assert!(matches!(state.absorb(0, record(7)), Absorbed::Queued));
        assert!(matches!(state.absorb(0, record(7)), Absorbed::Merged(2)));
        assert!(matches!(state.absorb(0, record(7)), Absorbed::Merged(3)));

        let out = drain_all(&state, 0);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].counter, 3);
        assert_eq!(out[0].rule_handle, 70);
    }

    #[test]
    fn test_cores_are_independent() {
        let state = AggregationState::new(2, 8, 8, 10);
        state.absorb(0, record(7));
        assert!(matches!(state.absorb(1, record(7)), Absorbed::Queued));

        assert_eq!(drain_all(&state, 0).len(), 1);
        assert_eq!(drain_all(&state, 1).len(), 1);
    }

    #[test]
    fn test_unknown_core_falls_back() {
        let state = AggregationState::new(1, 8, 8, 10);
        match state.absorb(5, record(1)) {
            Absorbed::Fallback(Fallback::NoSlot, r) => assert_eq!(r.id, 1),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(state.drain(5, 10, |_| {}).unwrap(), DrainReport::default());
    }

    #[test]
    fn test_store_full_falls_back() {
        let state = AggregationState::new(1, 2, 8, 10);
        state.absorb(0, record(1));
        state.absorb(0, record(2));
        assert!(matches!(
            state.absorb(0, record(3)),
            Absorbed::Fallback(Fallback::StoreFull, _)
        ));
        // Existing keys still merge while full.
        assert!(matches!(state.absorb(0, record(2)), Absorbed::Merged(2)));
    }

    #[test]
    fn test_queue_full_rolls_back_store_entry() {
        let state = AggregationState::new(1, 8, 1, 10);
        state.absorb(0, record(1));
        assert!(matches!(
            state.absorb(0, record(2)),
            Absorbed::Fallback(Fallback::QueueFull, _)
        ));

        let occ = state.occupancy();
        assert_eq!(occ.stored, 1);
        assert_eq!(occ.pending, 1);

        // The rolled-back id is treated as new next time.
        drain_all(&state, 0);
        assert!(matches!(state.absorb(0, record(2)), Absorbed::Queued));
    }

    #[test]
    fn test_contended_core() {
        let state = AggregationState::new(1, 8, 8, 3);
        let guard = state.slot(0).unwrap().lock(1).unwrap();

        assert!(matches!(
            state.absorb(0, record(1)),
            Absorbed::Fallback(Fallback::Contended, _)
        ));
        assert!(state.drain(0, 10, |_| {}).is_err());
        assert_eq!(state.occupancy().contended_cores, 1);

        drop(guard);
        assert!(matches!(state.absorb(0, record(1)), Absorbed::Queued));
    }

    #[test]
    fn test_drain_respects_cap_and_fifo() {
        let state = AggregationState::new(1, 16, 16, 10);
        for id in 1..=5 {
            state.absorb(0, record(id));
        }

        let mut out = Vec::new();
        let report = state.drain(0, 3, |r| out.push(r.id)).unwrap();
        assert_eq!(out, vec![1, 2, 3]);
        assert_eq!(
            report,
            DrainReport {
                emitted: 3,
                missed: 0,
                remaining: 2
            }
        );

        let report = state.drain(0, 3, |r| out.push(r.id)).unwrap();
        assert_eq!(out, vec![1, 2, 3, 4, 5]);
        assert_eq!(report.remaining, 0);
    }

    #[test]
    fn test_drain_skips_missing_records() {
        let state = AggregationState::new(1, 8, 8, 10);
        state.absorb(0, record(1));
        state.absorb(0, record(2));
        state.slot(0).unwrap().lock(1).unwrap().store.remove(1);

        let mut out = Vec::new();
        let report = state.drain(0, 10, |r| out.push(r.id)).unwrap();
        assert_eq!(out, vec![2]);
        assert_eq!(report.missed, 1);
        assert_eq!(report.emitted, 1);
    }
}
