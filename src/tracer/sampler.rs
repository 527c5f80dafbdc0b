use std::sync::atomic::{AtomicU64, Ordering};

/// Global modulo decimation gate.
///
/// The counter starts uninitialized (zero). The first event seen with a
/// non-zero rate initializes it to 1 and is dropped, so concurrent
/// initializers can never both count the same slot. After that every event
/// bumps the counter and only multiples of the rate pass.
#[derive(Debug, Default)]
pub struct Sampler {
    counter: AtomicU64,
}

impl Sampler {
    /// Create a sampler with an uninitialized counter.
    pub const fn new() -> Self {
        Self {
            counter: AtomicU64::new(0),
        }
    }

    /// Decide whether the current event is kept. `rate == 0` keeps all
    /// events and leaves the counter untouched.
    #[inline]
    pub fn admit(&self, rate: u64) -> bool {
        if rate == 0 {
            return true;
        }

        if self
            .counter
            .compare_exchange(0, 1, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
        {
            return false;
        }

        let n = self.counter.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
        n % rate == 0
    }

    /// Current counter value. Zero until the first sampled event.
    pub fn count(&self) -> u64 {
        self.counter.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn kept(sampler: &Sampler, rate: u64, events: u64) -> Vec<u64> {
        (1..=events).filter(|_| sampler.admit(rate)).collect()
    }

    #[test]
    fn test_rate_zero_keeps_everything() {
        let s = Sampler::new();
        assert_eq!(kept(&s, 0, 10).len(), 10);
        assert_eq!(s.count(), 0);
    }

    #[test]
    fn test_rate_five_keeps_fifth_and_tenth() {
        let s = Sampler::new();
        assert_eq!(kept(&s, 5, 10), vec![5, 10]);
        assert_eq!(s.count(), 10);
    }

    #[test]
    fn test_first_event_dropped_at_rate_one() {
        let s = Sampler::new();
        assert_eq!(kept(&s, 1, 4), vec![2, 3, 4]);
    }

    #[test]
    fn test_rate_larger_than_stream() {
        let s = Sampler::new();
        assert!(kept(&s, 100, 99).is_empty());
        assert!(s.admit(100));
    }

    #[test]
    fn test_concurrent_admission_count() {
        let s = Arc::new(Sampler::new());
        let mut handles = Vec::new();
        for _ in 0..4 {
            let s = Arc::clone(&s);
            handles.push(thread::spawn(move || {
                (0..1000).filter(|_| s.admit(10)).count()
            }));
        }

        let total: usize = handles.into_iter().map(|h| h.join().unwrap_or(0)).sum();
        // 4000 events, counter ends at 4000, multiples of 10 in 2..=4000.
        assert_eq!(s.count(), 4000);
        assert_eq!(total, 400);
    }
}
