//! Process-wide tuning knobs.
//!
//! The Q2/Q3 watermarks and the buffer-pool tuning parameters have sensible
//! built-in defaults and may be overridden through the environment before the
//! first message is received. The values are read once and cached for the
//! lifetime of the process.

use std::sync::OnceLock;

use crate::buffers::BUFFER_SIZE;

/// Two-level back-pressure watermarks.
///
/// Q2 bounds the number of buffers chained behind a single message content.
/// Q3 bounds the number of octets pending in one session's outgoing queue,
/// expressed here in buffer units and converted to octets where needed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QLimits {
    /// Re-enable input below this many buffers per message.
    pub q2_lower: usize,
    /// Disable input above this many buffers per message.
    pub q2_upper: usize,
    /// Resume session output below this many buffer units.
    pub q3_lower: usize,
    /// Stall session output above this many buffer units.
    pub q3_upper: usize,
}

impl QLimits {
    /// Built-in defaults: Q2 = 32/64 buffers, Q3 = 2x/4x the Q2 upper bound.
    pub const DEFAULT: Self = {
        let q2_upper = 64;
        Self {
            q2_lower: q2_upper / 2,
            q2_upper,
            q3_lower: q2_upper * 2,
            q3_upper: q2_upper * 4,
        }
    };

    /// Q3 upper watermark in octets.
    pub const fn q3_upper_octets(&self) -> usize {
        self.q3_upper * BUFFER_SIZE
    }

    /// Q3 lower watermark in octets.
    pub const fn q3_lower_octets(&self) -> usize {
        self.q3_lower * BUFFER_SIZE
    }
}

/// Buffer-pool tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolTuning {
    /// Number of buffers moved between the local and global free lists at once.
    pub transfer_batch_size: usize,
    /// Maximum buffers retained on a thread-local free list.
    pub local_free_list_max: usize,
    /// Maximum buffers retained on the global free list. `None` is unlimited.
    pub global_free_list_max: Option<usize>,
}

impl PoolTuning {
    pub const DEFAULT: Self = Self {
        transfer_batch_size: 64,
        local_free_list_max: 128,
        global_free_list_max: None,
    };
}

fn env_usize(key: &str) -> Option<usize> {
    std::env::var(key).ok()?.parse().ok()
}

/// The process-wide Q2/Q3 watermarks.
pub fn qlimits() -> QLimits {
    static LIMITS: OnceLock<QLimits> = OnceLock::new();
    *LIMITS.get_or_init(|| {
        let mut l = QLimits::DEFAULT;
        if let Some(v) = env_usize("WEIR_Q2_LOWER") {
            l.q2_lower = v;
        }
        if let Some(v) = env_usize("WEIR_Q2_UPPER") {
            l.q2_upper = v;
        }
        if let Some(v) = env_usize("WEIR_Q3_LOWER") {
            l.q3_lower = v;
        }
        if let Some(v) = env_usize("WEIR_Q3_UPPER") {
            l.q3_upper = v;
        }
        l
    })
}

/// The process-wide buffer-pool tuning.
pub fn pool_tuning() -> PoolTuning {
    static TUNING: OnceLock<PoolTuning> = OnceLock::new();
    *TUNING.get_or_init(|| {
        let mut t = PoolTuning::DEFAULT;
        if let Some(v) = env_usize("WEIR_TRANSFER_BATCH") {
            t.transfer_batch_size = v;
        }
        if let Some(v) = env_usize("WEIR_LOCAL_FREE_MAX") {
            t.local_free_list_max = v;
        }
        if let Some(v) = env_usize("WEIR_GLOBAL_FREE_MAX") {
            t.global_free_list_max = Some(v);
        }
        t
    })
}
