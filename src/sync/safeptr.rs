//! Generation-counted safe pointers.
//!
//! A [`SafeRef`] is a cross-thread back-reference to an object whose owner may
//! tear it down at any time. Each referent carries a [`SafeGate`] holding a
//! sequence number drawn from a process-wide counter; tearing the object down
//! bumps the gate, after which every previously captured reference dereferences
//! to `None`. This is how producer/consumer activation records observe "the
//! connection is gone" without dangling.

use std::sync::{
    Arc, Weak,
    atomic::{AtomicU32, Ordering},
};

static NEXT_SEQ: AtomicU32 = AtomicU32::new(1);

/// Sequence gate embedded in any object that hands out safe references.
pub struct SafeGate {
    seq: AtomicU32,
}

impl SafeGate {
    pub fn new() -> Self {
        Self {
            seq: AtomicU32::new(NEXT_SEQ.fetch_add(1, Ordering::Relaxed)),
        }
    }

    /// Invalidates every reference captured before this call.
    pub fn invalidate(&self) {
        self.seq
            .store(NEXT_SEQ.fetch_add(1, Ordering::Relaxed), Ordering::Release);
    }

    fn current(&self) -> u32 {
        self.seq.load(Ordering::Acquire)
    }
}

impl Default for SafeGate {
    fn default() -> Self {
        Self::new()
    }
}

/// Objects that can be targeted by a [`SafeRef`].
pub trait Gated {
    fn gate(&self) -> &SafeGate;
}

/// A `(reference, sequence-at-capture)` pair. Dereferences to the target only
/// while the target is alive and its gate still carries the captured sequence.
pub struct SafeRef<T: Gated> {
    target: Weak<T>,
    seq: u32,
}

impl<T: Gated> SafeRef<T> {
    /// Captures a reference to `target` at its current sequence.
    pub fn capture(target: &Arc<T>) -> Self {
        Self {
            target: Arc::downgrade(target),
            seq: target.gate().current(),
        }
    }

    /// The null reference; never dereferences.
    pub fn null() -> Self {
        Self {
            target: Weak::new(),
            seq: 0,
        }
    }

    /// Returns the target if it is alive and has not been invalidated.
    pub fn deref(&self) -> Option<Arc<T>> {
        let target = self.target.upgrade()?;
        (target.gate().current() == self.seq).then_some(target)
    }
}

impl<T: Gated> Clone for SafeRef<T> {
    fn clone(&self) -> Self {
        Self {
            target: self.target.clone(),
            seq: self.seq,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Target {
        gate: SafeGate,
    }

    impl Gated for Target {
        fn gate(&self) -> &SafeGate {
            &self.gate
        }
    }

    #[test]
    fn test_deref_live_target() {
        let t = Arc::new(Target { gate: SafeGate::new() });
        let r = SafeRef::capture(&t);
        assert!(r.deref().is_some());
    }

    #[test]
    fn test_deref_after_invalidate() {
        let t = Arc::new(Target { gate: SafeGate::new() });
        let r = SafeRef::capture(&t);
        t.gate.invalidate();
        assert!(r.deref().is_none());

        // A reference captured after invalidation is valid again.
        let r2 = SafeRef::capture(&t);
        assert!(r2.deref().is_some());
    }

    #[test]
    fn test_deref_after_drop() {
        let t = Arc::new(Target { gate: SafeGate::new() });
        let r = SafeRef::capture(&t);
        drop(t);
        assert!(r.deref().is_none());
    }

    #[test]
    fn test_null_never_derefs() {
        let r = SafeRef::<Target>::null();
        assert!(r.deref().is_none());
    }
}
