//! Unicast cut-through.
//!
//! When the router proves a stream has exactly one consumer, the message
//! switches to cut-through: the producer hands whole buffer lists to the
//! consumer through a fixed ring of slots, bypassing composing and parsing.
//! The ring is single-producer/single-consumer by construction: one side only
//! advances `produce`, the other only advances `consume`, and both indices
//! grow monotonically so `produce - consume` is the number of filled slots.

use std::{
    cell::UnsafeCell,
    sync::atomic::{AtomicBool, AtomicUsize, Ordering},
};

use crossbeam_utils::CachePadded;

use crate::{
    buffers::BufferChain,
    link::{Connection, Delivery, Server},
    sync::safeptr::SafeRef,
};

/// Number of slots in the ring.
pub const SLOT_COUNT: usize = 8;

/// A stalled stream resumes once the filled slot count drops to this value.
pub const RESUME_THRESHOLD: usize = 4;

/// Fixed-slot SPSC ring of buffer lists.
pub(crate) struct CutThroughRing {
    slots: [UnsafeCell<BufferChain>; SLOT_COUNT],
    produce: CachePadded<AtomicUsize>,
    consume: CachePadded<AtomicUsize>,
    stalled: AtomicBool,
}

// SAFETY: slot i is written only by the single producer before it publishes
// the advanced `produce` index, and read only by the single consumer after it
// observes that index; the Acquire/Release pairs on `produce` and `consume`
// order those accesses.
unsafe impl Sync for CutThroughRing {}

impl CutThroughRing {
    pub(crate) fn new() -> Self {
        Self {
            slots: std::array::from_fn(|_| UnsafeCell::new(BufferChain::new())),
            produce: CachePadded::new(AtomicUsize::new(0)),
            consume: CachePadded::new(AtomicUsize::new(0)),
            stalled: AtomicBool::new(false),
        }
    }

    /// Number of slots holding produced content.
    pub(crate) fn full_slot_count(&self) -> usize {
        self.produce
            .load(Ordering::Acquire)
            .wrapping_sub(self.consume.load(Ordering::Acquire))
    }

    /// True iff there is capacity to produce one buffer list.
    pub(crate) fn can_produce(&self) -> bool {
        self.full_slot_count() < SLOT_COUNT
    }

    /// True iff there is at least one filled slot.
    pub(crate) fn can_consume(&self) -> bool {
        self.produce.load(Ordering::Acquire) != self.consume.load(Ordering::Acquire)
    }

    /// Moves `buffers` into the next slot, whole.
    ///
    /// Must be preceded by a true [`can_produce`](Self::can_produce); the ring
    /// never partially consumes the list.
    pub(crate) fn produce(&self, buffers: BufferChain) {
        assert!(self.can_produce(), "produce into a full cut-through ring");
        let idx = self.produce.load(Ordering::Relaxed);
        // SAFETY: `can_produce` proved this slot is not visible to the
        // consumer, and only the producer writes slots.
        unsafe {
            *self.slots[idx % SLOT_COUNT].get() = buffers;
        }
        self.produce.store(idx.wrapping_add(1), Ordering::Release);
        if self.full_slot_count() == SLOT_COUNT {
            self.stalled.store(true, Ordering::Release);
        }
    }

    /// Drains up to `limit` slots into `out`, returning how many were taken.
    pub(crate) fn consume(&self, out: &mut Vec<BufferChain>, limit: usize) -> usize {
        let mut taken = 0;
        while taken < limit && self.can_consume() {
            let idx = self.consume.load(Ordering::Relaxed);
            // SAFETY: `can_consume` proved this slot was published by the
            // producer, and only the consumer reads filled slots.
            let chain = unsafe { std::mem::take(&mut *self.slots[idx % SLOT_COUNT].get()) };
            out.push(chain);
            self.consume.store(idx.wrapping_add(1), Ordering::Release);
            taken += 1;
        }
        taken
    }

    /// True exactly once after the ring stalled full and has drained to at
    /// most [`RESUME_THRESHOLD`] filled slots. Clears the stalled bit.
    pub(crate) fn resume_from_stalled(&self) -> bool {
        if !self.stalled.load(Ordering::Acquire) {
            return false;
        }
        if self.full_slot_count() <= RESUME_THRESHOLD {
            return self
                .stalled
                .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
                .is_ok();
        }
        false
    }
}

/// Who to wake when the counterpart side of a cut-through stream should run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ActivationType {
    #[default]
    None,
    Amqp,
    Tcp,
}

/// Activation record registered by each side of a cut-through stream.
///
/// The connection back-reference is a generation-counted safe pointer, so a
/// torn-down connection is observed as gone rather than dangling.
pub struct Activation {
    pub kind: ActivationType,
    pub conn: SafeRef<Connection>,
    pub delivery: Option<std::sync::Arc<Delivery>>,
}

impl Default for Activation {
    fn default() -> Self {
        Self {
            kind: ActivationType::None,
            conn: SafeRef::null(),
            delivery: None,
        }
    }
}

impl Activation {
    /// Copies the wake-relevant part of the record. Callers snapshot under
    /// the record's mutex and wake after dropping it, so the server
    /// activation lock is never taken with an activation mutex held.
    pub(crate) fn snapshot(&self) -> Activation {
        Activation {
            kind: self.kind,
            conn: self.conn.clone(),
            delivery: None,
        }
    }

    /// Wakes the connection named by this record, under the server's
    /// activation lock so the wake primitive never races tear-down.
    pub(crate) fn wake(&self, server: &Server) {
        match self.kind {
            ActivationType::None => {}
            ActivationType::Amqp | ActivationType::Tcp => {
                if let Some(conn) = self.conn.deref() {
                    let _guard = server.activation_lock();
                    conn.wake();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffers::writer::Writer;

    fn chain_of(byte: u8, n: usize) -> BufferChain {
        let mut chain = BufferChain::new();
        chain.writer().write_exact(&vec![byte; n]).unwrap();
        chain
    }

    #[test]
    fn test_produce_consume_cycle() {
        let ring = CutThroughRing::new();
        assert!(ring.can_produce());
        assert!(!ring.can_consume());

        // Fill all slots.
        for i in 0..SLOT_COUNT {
            assert!(ring.can_produce());
            ring.produce(chain_of(i as u8, 4));
        }
        assert!(!ring.can_produce());
        assert_eq!(ring.full_slot_count(), SLOT_COUNT);

        // Drain five; resume fires exactly once.
        let mut out = Vec::new();
        assert_eq!(ring.consume(&mut out, 5), 5);
        assert_eq!(out.len(), 5);
        assert!(ring.resume_from_stalled());
        assert!(!ring.resume_from_stalled());

        // Production is allowed again.
        assert!(ring.can_produce());
        ring.produce(chain_of(0xFF, 1));
        assert_eq!(ring.full_slot_count(), SLOT_COUNT - 5 + 1);
    }

    #[test]
    fn test_fifo_order() {
        let ring = CutThroughRing::new();
        for i in 0..4u8 {
            ring.produce(chain_of(i, 1));
        }
        let mut out = Vec::new();
        ring.consume(&mut out, SLOT_COUNT);
        let first: Vec<u8> = out
            .iter()
            .map(|c| c.get(c.head_ordinal()).unwrap().as_slice()[0])
            .collect();
        assert_eq!(first, vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_no_resume_without_stall() {
        let ring = CutThroughRing::new();
        ring.produce(chain_of(1, 1));
        let mut out = Vec::new();
        ring.consume(&mut out, 1);
        // The ring never filled, so there is nothing to resume from.
        assert!(!ring.resume_from_stalled());
    }

    #[test]
    fn test_consume_limit() {
        let ring = CutThroughRing::new();
        for i in 0..6u8 {
            ring.produce(chain_of(i, 1));
        }
        let mut out = Vec::new();
        assert_eq!(ring.consume(&mut out, 2), 2);
        assert_eq!(ring.full_slot_count(), 4);
    }

    #[test]
    fn test_spsc_threads() {
        use std::sync::Arc;

        let ring = Arc::new(CutThroughRing::new());
        const N: usize = 10_000;

        let producer = {
            let ring = ring.clone();
            std::thread::spawn(move || {
                let mut sent = 0usize;
                while sent < N {
                    if ring.can_produce() {
                        ring.produce(chain_of((sent % 251) as u8, 1));
                        sent += 1;
                    } else {
                        std::thread::yield_now();
                    }
                }
            })
        };

        let consumer = {
            let ring = ring.clone();
            std::thread::spawn(move || {
                let mut seen = 0usize;
                let mut out = Vec::new();
                while seen < N {
                    out.clear();
                    if ring.consume(&mut out, SLOT_COUNT) == 0 {
                        std::thread::yield_now();
                        continue;
                    }
                    for chain in &out {
                        let byte = chain.get(chain.head_ordinal()).unwrap().as_slice()[0];
                        assert_eq!(byte, (seen % 251) as u8);
                        seen += 1;
                    }
                }
            })
        };

        producer.join().unwrap();
        consumer.join().unwrap();
    }
}
