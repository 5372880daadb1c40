use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicU8, Ordering},
    },
};

use event_listener::{Event, IntoNotification};

/// Error returned by [`Notifier::notify`] and [`Waiter::wait`] when the
/// counterpart side has been dropped.
pub struct Closed;

impl fmt::Display for Closed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("counterpart dropped")
    }
}

impl fmt::Debug for Closed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Closed")
    }
}

impl std::error::Error for Closed {}

const UNSET: u8 = 0;
const SET: u8 = 1 << 0;
const ERR: u8 = 1 << 1;

struct Inner {
    event: Event,
    flag: AtomicU8,
}

impl Inner {
    /// Checks and atomically clears the SET flag.
    fn check(&self) -> Result<bool, Closed> {
        let f = self.flag.fetch_and(!SET, Ordering::AcqRel);
        if f & ERR != 0 {
            return Err(Closed);
        }
        Ok(f == SET)
    }

    fn close(&self) {
        self.flag.store(ERR, Ordering::Release);
        self.event.notify(usize::MAX);
    }
}

/// Creates a connected notifier/waiter pair.
///
/// A notification is level-triggered: it is retained until the waiter observes
/// it, and multiple notifications before a wait collapse into one.
pub(crate) fn new() -> (Notifier, Waiter) {
    let inner = Arc::new(Inner {
        event: Event::new(),
        flag: AtomicU8::new(UNSET),
    });
    (Notifier(inner.clone()), Waiter(inner))
}

/// Wake-up side of the event. Cheap to clone; any holder may notify.
#[derive(Clone)]
pub(crate) struct Notifier(Arc<Inner>);

impl Notifier {
    #[inline]
    pub(crate) fn notify(&self) -> Result<(), Closed> {
        let f = self.0.flag.fetch_or(SET, Ordering::AcqRel);
        if f & ERR != 0 {
            return Err(Closed);
        }
        self.0.event.notify(1.additional().relaxed());
        Ok(())
    }
}

/// Waiting side of the event. Exactly one task awaits it.
pub struct Waiter(Arc<Inner>);

impl Waiter {
    #[inline]
    pub async fn wait(&self) -> Result<(), Closed> {
        loop {
            if self.0.check()? {
                return Ok(());
            }

            let listener = self.0.event.listen();

            // Re-check: a notification may have raced the listener registration.
            if self.0.check()? {
                return Ok(());
            }

            listener.await;
        }
    }
}

impl Drop for Waiter {
    fn drop(&mut self) {
        self.0.close();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::time::timeout;

    use super::*;

    #[tokio::test]
    async fn test_notify_then_wait() {
        let (notifier, waiter) = new();

        notifier.notify().unwrap();

        // Wait must observe the retained notification immediately.
        let res = timeout(Duration::from_millis(100), waiter.wait()).await;
        assert!(res.is_ok());
        assert!(res.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_wait_then_notify() {
        let (notifier, waiter) = new();

        let task = tokio::spawn(async move { waiter.wait().await });

        tokio::time::sleep(Duration::from_millis(10)).await;
        notifier.notify().unwrap();

        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_notifications_collapse() {
        let (notifier, waiter) = new();

        notifier.notify().unwrap();
        notifier.notify().unwrap();
        notifier.notify().unwrap();

        timeout(Duration::from_millis(100), waiter.wait())
            .await
            .unwrap()
            .unwrap();

        // Only one retained notification; further waits must block.
        let res = timeout(Duration::from_millis(50), waiter.wait()).await;
        assert!(res.is_err());
    }

    #[tokio::test]
    async fn test_waiter_dropped() {
        let (notifier, waiter) = new();
        drop(waiter);
        assert!(notifier.notify().is_err());
    }
}
