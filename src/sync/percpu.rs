use std::path::Path;

/// Upper bound on per-core slots.
pub const MAX_CPUS: usize = 128;

/// N independent instances indexed by core id.
///
/// The slot set is sized once at startup and never grows; an out-of-range
/// core id is a lookup miss, not a panic.
#[derive(Debug)]
pub struct PerCpu<T> {
    slots: Box<[T]>,
}

impl<T> PerCpu<T> {
    /// Build `cores` slots, clamped to `1..=MAX_CPUS`.
    pub fn new(cores: usize, mut init: impl FnMut(usize) -> T) -> Self {
        let cores = cores.clamp(1, MAX_CPUS);
        Self {
            slots: (0..cores).map(&mut init).collect(),
        }
    }

    /// Slot for `cpu`, or `None` when out of range.
    pub fn get(&self, cpu: usize) -> Option<&T> {
        self.slots.get(cpu)
    }

    /// Number of cores.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether no cores were configured.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Iterate `(cpu, slot)` pairs in core order.
    pub fn iter(&self) -> impl Iterator<Item = (usize, &T)> {
        self.slots.iter().enumerate()
    }
}

/// Number of online CPUs, read from sysfs with a fallback to the scheduler's
/// view of available parallelism.
pub fn online_cpus() -> usize {
    read_cpu_online(Path::new("/sys/devices/system/cpu/online"))
        .or_else(|| std::thread::available_parallelism().ok().map(usize::from))
        .unwrap_or(1)
        .clamp(1, MAX_CPUS)
}

fn read_cpu_online(path: &Path) -> Option<usize> {
    let text = std::fs::read_to_string(path).ok()?;
    parse_cpu_online_text(text.trim()).map(|n| n as usize)
}

/// Count CPUs in a sysfs range list such as `0-3,8,10-11`.
pub fn parse_cpu_online_text(text: &str) -> Option<u32> {
    if text.is_empty() {
        return None;
    }

    let mut total = 0u32;
    for part in text.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }

        match part.split_once('-') {
            Some((start, end)) => {
                let start = start.trim().parse::<u32>().ok()?;
                let end = end.trim().parse::<u32>().ok()?;
                if end < start {
                    return None;
                }
                total = total.saturating_add(end - start + 1);
            }
            None => {
                part.parse::<u32>().ok()?;
                total = total.saturating_add(1);
            }
        }
    }

    (total > 0).then_some(total)
}

/// Core the calling thread is running on, folded into `0..cores`.
pub fn current_cpu(cores: usize) -> usize {
    // SAFETY: sched_getcpu takes no arguments and only reads scheduler state.
    let raw = unsafe { libc::sched_getcpu() };
    let cpu = usize::try_from(raw).unwrap_or(0);
    cpu % cores.max(1)
}
