//! Fixed-size pooled octet buffers.
//!
//! All message content in the pipeline lives in uniform 512-byte buffers drawn
//! from a process-wide pool. Each thread keeps a local free list; frees beyond
//! the local limit are rebalanced to a global free list in batches so a buffer
//! allocated on one thread can be freed on any other. Allocation never fails:
//! when both free lists are empty the buffer comes from the heap, and heap
//! exhaustion aborts the process.

use std::{
    cell::RefCell,
    sync::{
        Mutex, OnceLock,
        atomic::{AtomicU64, Ordering},
    },
};

use crate::config::{PoolTuning, pool_tuning};

/// Size of every pooled buffer in octets.
pub const BUFFER_SIZE: usize = 512;

/// An owned octet region with a fill cursor.
///
/// The region has a fixed capacity of [`BUFFER_SIZE`]; `fill` marks how many
/// octets are valid. A buffer is a member of at most one chain.
pub struct Buffer {
    data: Box<[u8]>,
    fill: usize,
}

impl Buffer {
    fn fresh() -> Self {
        Self {
            data: vec![0u8; BUFFER_SIZE].into_boxed_slice(),
            fill: 0,
        }
    }

    /// Number of valid octets.
    pub fn len(&self) -> usize {
        self.fill
    }

    pub fn is_empty(&self) -> bool {
        self.fill == 0
    }

    /// Octets still writable behind the fill cursor.
    pub fn remaining(&self) -> usize {
        BUFFER_SIZE - self.fill
    }

    /// The valid octets.
    pub fn as_slice(&self) -> &[u8] {
        &self.data[..self.fill]
    }

    /// The writable tail of the region.
    pub fn unfilled(&mut self) -> &mut [u8] {
        &mut self.data[self.fill..]
    }

    /// Advances the fill cursor over `n` octets just written to `unfilled()`.
    pub fn advance_fill(&mut self, n: usize) {
        debug_assert!(self.fill + n <= BUFFER_SIZE);
        self.fill += n;
    }

    /// Appends as many octets as fit, returning how many were taken.
    pub fn fill_from(&mut self, octets: &[u8]) -> usize {
        let n = octets.len().min(self.remaining());
        self.data[self.fill..self.fill + n].copy_from_slice(&octets[..n]);
        self.fill += n;
        n
    }

    fn reset(&mut self) {
        self.fill = 0;
    }
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Buffer[{}/{}]", self.fill, BUFFER_SIZE)
    }
}

// --- Pool

struct GlobalPool {
    free: Mutex<Vec<Buffer>>,
    tuning: PoolTuning,
    // Stats
    alloc_from_heap: AtomicU64,
    free_to_heap: AtomicU64,
    batches_to_global: AtomicU64,
    batches_to_threads: AtomicU64,
}

fn global() -> &'static GlobalPool {
    static GLOBAL: OnceLock<GlobalPool> = OnceLock::new();
    GLOBAL.get_or_init(|| GlobalPool {
        free: Mutex::new(Vec::new()),
        tuning: pool_tuning(),
        alloc_from_heap: AtomicU64::new(0),
        free_to_heap: AtomicU64::new(0),
        batches_to_global: AtomicU64::new(0),
        batches_to_threads: AtomicU64::new(0),
    })
}

thread_local! {
    static LOCAL_FREE: RefCell<Vec<Buffer>> = const { RefCell::new(Vec::new()) };
}

/// Allocates a buffer: thread-local free list, then a batch pulled from the
/// global list, then the heap.
pub fn alloc() -> Buffer {
    let pool = global();
    LOCAL_FREE.with(|local| {
        let mut local = local.borrow_mut();
        if let Some(buf) = local.pop() {
            return buf;
        }

        // Refill the local list with one transfer batch from the global list.
        {
            let mut free = pool.free.lock().unwrap();
            if !free.is_empty() {
                let take = pool.tuning.transfer_batch_size.min(free.len());
                let start = free.len() - take;
                local.extend(free.drain(start..));
                pool.batches_to_threads.fetch_add(1, Ordering::Relaxed);
            }
        }

        local.pop().unwrap_or_else(|| {
            pool.alloc_from_heap.fetch_add(1, Ordering::Relaxed);
            Buffer::fresh()
        })
    })
}

/// Returns a buffer to the pool. May be called from any thread.
pub fn release(mut buf: Buffer) {
    buf.reset();
    let pool = global();
    LOCAL_FREE.with(|local| {
        let mut local = local.borrow_mut();
        local.push(buf);

        if local.len() <= pool.tuning.local_free_list_max {
            return;
        }

        // Rebalance one batch to the global list.
        let batch = pool.tuning.transfer_batch_size.min(local.len());
        let mut free = pool.free.lock().unwrap();
        let start = local.len() - batch;
        free.extend(local.drain(start..));
        pool.batches_to_global.fetch_add(1, Ordering::Relaxed);

        // Trim the global list beyond its configured bound; trimmed buffers
        // fall back to the heap.
        if let Some(max) = pool.tuning.global_free_list_max
            && free.len() > max
        {
            let excess = free.len() - max;
            free.truncate(max);
            pool.free_to_heap.fetch_add(excess as u64, Ordering::Relaxed);
        }
    });
}

/// Point-in-time pool statistics.
#[derive(Debug, Clone, Copy, Default)]
pub struct PoolStats {
    pub total_alloc_from_heap: u64,
    pub total_free_to_heap: u64,
    pub global_free_count: u64,
    pub batches_rebalanced_to_global: u64,
    pub batches_rebalanced_to_threads: u64,
}

pub fn pool_stats() -> PoolStats {
    let pool = global();
    PoolStats {
        total_alloc_from_heap: pool.alloc_from_heap.load(Ordering::Relaxed),
        total_free_to_heap: pool.free_to_heap.load(Ordering::Relaxed),
        global_free_count: pool.free.lock().unwrap().len() as u64,
        batches_rebalanced_to_global: pool.batches_to_global.load(Ordering::Relaxed),
        batches_rebalanced_to_threads: pool.batches_to_threads.load(Ordering::Relaxed),
    }
}
