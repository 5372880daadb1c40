//! Per-session Q3 accounting.
//!
//! Q3 bounds the octets pending in one AMQP session's outgoing queue across
//! all of its links. While the session is above the high watermark no link on
//! it may push further frames; when the writer drains it to the low watermark
//! every link resumes and the session's waiter is notified. Raw adaptors do
//! not use Q3; their transport's own write-buffer capacity bounds them.

use std::sync::{
    Arc,
    atomic::{AtomicBool, AtomicUsize, Ordering},
};

use crate::{
    config::{QLimits, qlimits},
    sync::event::{self, Notifier, Waiter},
};

pub struct Session {
    pending: AtomicUsize,
    stalled: AtomicBool,
    limits: QLimits,
    resume: Notifier,
}

impl Session {
    /// Creates the session and the waiter its connection writer parks on to
    /// learn about resumption.
    pub fn new() -> (Arc<Session>, Waiter) {
        let (resume, waiter) = event::new();
        (
            Arc::new(Session {
                pending: AtomicUsize::new(0),
                stalled: AtomicBool::new(false),
                limits: qlimits(),
                resume,
            }),
            waiter,
        )
    }

    /// Octets queued and not yet written to the transport.
    pub fn pending_octets(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    pub fn is_stalled(&self) -> bool {
        self.stalled.load(Ordering::Acquire)
    }

    pub(crate) fn note_queued(&self, octets: usize) {
        self.pending.fetch_add(octets, Ordering::AcqRel);
    }

    pub(crate) fn set_stalled(&self) {
        self.stalled.store(true, Ordering::Release);
    }

    /// Records octets written out by the transport. Returns true when this
    /// drain took a stalled session back under the low watermark; all links
    /// on the session resume at that point.
    pub fn note_written(&self, octets: usize) -> bool {
        let before = self.pending.fetch_sub(octets, Ordering::AcqRel);
        debug_assert!(before >= octets);
        let now = before - octets;
        if now <= self.limits.q3_lower_octets()
            && self
                .stalled
                .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        {
            let _ = self.resume.notify();
            return true;
        }
        false
    }

    pub(crate) fn limits(&self) -> &QLimits {
        &self.limits
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stall_resume_cycle() {
        let (session, _waiter) = Session::new();
        let upper = session.limits().q3_upper_octets();
        let lower = session.limits().q3_lower_octets();

        session.note_queued(upper + 100);
        session.set_stalled();
        assert!(session.is_stalled());

        // Draining above the low watermark does not resume.
        assert!(!session.note_written(upper + 100 - lower - 1));
        assert!(session.is_stalled());

        // Reaching the low watermark resumes exactly once.
        assert!(session.note_written(1));
        assert!(!session.is_stalled());
        assert!(!session.note_written(50));
    }

    #[tokio::test]
    async fn test_resume_notifies_waiter() {
        let (session, waiter) = Session::new();
        session.note_queued(session.limits().q3_upper_octets() + 1);
        session.set_stalled();
        session.note_written(session.limits().q3_upper_octets() + 1);

        tokio::time::timeout(std::time::Duration::from_millis(100), waiter.wait())
            .await
            .unwrap()
            .unwrap();
    }
}
