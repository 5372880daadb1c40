pub(crate) mod event;
pub mod safeptr;
mod time;

pub use event::{Closed, Waiter};
pub(crate) use time::AtomicDuration;

use std::sync::LazyLock;

/// Process epoch used for uptime ticks, settle-rate windows and zero-credit
/// timestamps. Anchored at first use.
static LOCAL_EPOCH: LazyLock<quanta::Instant> = LazyLock::new(quanta::Instant::now);

/// Seconds elapsed since the process epoch.
///
/// One tick is one second. All rate windows in the crate advance on this
/// clock, so table walks and stuck-delivery detection agree on elapsed time.
pub fn uptime_ticks() -> u64 {
    LOCAL_EPOCH.elapsed().as_secs()
}
