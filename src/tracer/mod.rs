pub mod context;
pub mod event;
pub mod extract;
pub mod hash;
pub mod probe;
pub mod record;
pub mod replay;
pub mod sampler;
pub mod settings;
pub mod stats;

use anyhow::Result;
use tokio_util::sync::CancellationToken;

use self::context::TraceContext;

/// Callback for trace notifications: `(cpu, context)`.
pub type EventHandler = Box<dyn Fn(usize, &TraceContext) + Send + Sync>;

/// Callback for source errors.
pub type ErrorHandler = Box<dyn Fn(anyhow::Error) + Send + Sync>;

/// A source of trace notifications feeding the probe.
pub trait Tracer: Send {
    /// Begin delivering notifications to the registered handler.
    fn start(
        &mut self,
        ctx: CancellationToken,
    ) -> impl std::future::Future<Output = Result<()>> + Send;

    /// Stop delivering notifications and wait for the reader to exit.
    fn stop(&mut self) -> impl std::future::Future<Output = Result<()>> + Send;

    /// Register a handler for trace notifications.
    fn on_event(&mut self, handler: EventHandler);

    /// Register a handler for source errors.
    fn on_error(&mut self, handler: ErrorHandler);
}

/// Returns current monotonic clock value in nanoseconds.
pub fn monotonic_ns() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: `clock_gettime(CLOCK_MONOTONIC, ...)` is thread-safe and does not
    // require any Rust-side invariants besides a valid pointer.
    if unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) } == 0 {
        (ts.tv_sec as u64)
            .saturating_mul(1_000_000_000)
            .saturating_add(ts.tv_nsec as u64)
    } else {
        0
    }
}
