//! Per-delivery disposition state.
//!
//! A delivery pairs one message handle with one link. It lives as long as the
//! longer of its two holders (sending side, receiving side); the final drop
//! releases the message handle, which in turn drops its content reference.

use std::sync::{Arc, Mutex};

use crate::{message::Message, sync::uptime_ticks};

/// Delivery outcome, local or remote.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Disposition {
    #[default]
    None,
    Accepted,
    /// Permanent failure; not redelivered.
    Rejected,
    /// Retriable; the forwarder may re-route resend-released messages.
    Released,
    Modified,
}

impl Disposition {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Disposition::None)
    }
}

struct DeliveryState {
    /// Taken exactly once during tear-down; never touched afterwards.
    message: Option<Message>,
    local: Disposition,
    remote: Disposition,
    settled: bool,
    /// Adaptor correlation value (e.g. an HTTP/2 stream id).
    context: Option<u64>,
    delayed_1sec: bool,
    delayed_10sec: bool,
    stuck: bool,
}

/// A message's presence on one link.
pub struct Delivery {
    state: Mutex<DeliveryState>,
    created_tick: u64,
}

impl Delivery {
    pub fn new(message: Message) -> Arc<Delivery> {
        Arc::new(Delivery {
            state: Mutex::new(DeliveryState {
                message: Some(message),
                local: Disposition::None,
                remote: Disposition::None,
                settled: false,
                context: None,
                delayed_1sec: false,
                delayed_10sec: false,
                stuck: false,
            }),
            created_tick: uptime_ticks(),
        })
    }

    /// Runs `f` against the message handle, unless tear-down already took it.
    pub fn with_message<R>(&self, f: impl FnOnce(&mut Message) -> R) -> Option<R> {
        let mut state = self.state.lock().unwrap();
        state.message.as_mut().map(f)
    }

    /// Takes the message handle out. Tear-down calls this exactly once; any
    /// later access observes `None` rather than a freed message.
    pub fn take_message(&self) -> Option<Message> {
        self.state.lock().unwrap().message.take()
    }

    pub fn local_disposition(&self) -> Disposition {
        self.state.lock().unwrap().local
    }

    pub fn set_local_disposition(&self, d: Disposition) {
        self.state.lock().unwrap().local = d;
    }

    pub fn remote_disposition(&self) -> Disposition {
        self.state.lock().unwrap().remote
    }

    pub fn set_remote_disposition(&self, d: Disposition) {
        self.state.lock().unwrap().remote = d;
    }

    pub fn is_settled(&self) -> bool {
        self.state.lock().unwrap().settled
    }

    pub fn settle(&self) {
        self.state.lock().unwrap().settled = true;
    }

    pub fn context(&self) -> Option<u64> {
        self.state.lock().unwrap().context
    }

    pub fn set_context(&self, context: Option<u64>) {
        self.state.lock().unwrap().context = context;
    }

    pub fn age_ticks(&self) -> u64 {
        uptime_ticks().saturating_sub(self.created_tick)
    }

    /// Updates the delay markers for this delivery's age; returns which
    /// thresholds were newly crossed as `(delayed_1sec, delayed_10sec)`.
    pub(crate) fn note_delay(&self, age: u64) -> (bool, bool) {
        let mut state = self.state.lock().unwrap();
        let one = age >= 1 && !state.delayed_1sec;
        if one {
            state.delayed_1sec = true;
        }
        let ten = age >= 10 && !state.delayed_10sec;
        if ten {
            state.delayed_10sec = true;
        }
        (one, ten)
    }

    /// Marks the delivery stuck; returns true on the first marking only.
    /// Stuck deliveries are reported, never cancelled.
    pub(crate) fn mark_stuck(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        let first = !state.stuck;
        state.stuck = true;
        first
    }

    pub fn is_stuck(&self) -> bool {
        self.state.lock().unwrap().stuck
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dispositions() {
        let d = Delivery::new(Message::new());
        assert_eq!(d.local_disposition(), Disposition::None);
        assert!(!d.local_disposition().is_terminal());

        d.set_local_disposition(Disposition::Accepted);
        d.set_remote_disposition(Disposition::Released);
        assert_eq!(d.local_disposition(), Disposition::Accepted);
        assert_eq!(d.remote_disposition(), Disposition::Released);

        assert!(!d.is_settled());
        d.settle();
        assert!(d.is_settled());
    }

    #[test]
    fn test_take_message_once() {
        let d = Delivery::new(Message::new());
        assert!(d.with_message(|_| ()).is_some());
        assert!(d.take_message().is_some());
        // Post tear-down access observes None.
        assert!(d.take_message().is_none());
        assert!(d.with_message(|_| ()).is_none());
    }

    #[test]
    fn test_delay_markers_fire_once() {
        let d = Delivery::new(Message::new());
        assert_eq!(d.note_delay(0), (false, false));
        assert_eq!(d.note_delay(2), (true, false));
        assert_eq!(d.note_delay(3), (false, false));
        assert_eq!(d.note_delay(11), (false, true));
        assert_eq!(d.note_delay(12), (false, false));

        assert!(d.mark_stuck());
        assert!(!d.mark_stuck());
        assert!(d.is_stuck());
    }
}
