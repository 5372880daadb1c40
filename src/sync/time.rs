use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

const fn duration_to_u64(duration: Duration) -> u64 {
    (duration.as_secs() << 32) | duration.subsec_nanos() as u64
}

const fn u64_to_duration(secs_nanos: u64) -> Duration {
    Duration::new(secs_nanos >> 32, secs_nanos as u32)
}

/// A `Duration` that can be updated concurrently, packed into one atomic word.
/// Seconds are limited to `u32::MAX`.
pub(crate) struct AtomicDuration(AtomicU64);

impl AtomicDuration {
    pub(crate) fn new(duration: Duration) -> Self {
        assert!(duration.as_secs() <= u32::MAX as u64);
        Self(AtomicU64::new(duration_to_u64(duration)))
    }

    pub(crate) fn store(&self, duration: Duration, order: Ordering) {
        assert!(duration.as_secs() <= u32::MAX as u64);
        self.0.store(duration_to_u64(duration), order);
    }

    pub(crate) fn load(&self, order: Ordering) -> Duration {
        u64_to_duration(self.0.load(order))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_atomic_duration_roundtrip() {
        let atomic = AtomicDuration::new(Duration::from_secs(10));
        assert_eq!(atomic.load(Ordering::Relaxed), Duration::from_secs(10));

        let precise = Duration::new(42, 123_456_789);
        atomic.store(precise, Ordering::SeqCst);
        assert_eq!(atomic.load(Ordering::SeqCst), precise);

        let zero = Duration::from_secs(0);
        atomic.store(zero, Ordering::Relaxed);
        assert_eq!(atomic.load(Ordering::Relaxed), zero);
    }

    #[test]
    #[should_panic]
    fn test_store_panic_on_overflow() {
        let atomic = AtomicDuration::new(Duration::from_secs(0));
        atomic.store(Duration::from_secs(u32::MAX as u64 + 1), Ordering::Relaxed);
    }
}
