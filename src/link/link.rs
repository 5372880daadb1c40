//! Link state: credit, queues, settle rate and stuck-delivery detection.

use std::{collections::VecDeque, sync::Arc};

use crate::{
    buffers::BufferChain,
    buffers::writer::Writer,
    sync::uptime_ticks,
};

use super::{Delivery, Disposition, Session};

/// Depth of the settle-rate ring: one slot per uptime tick.
pub const LINK_RATE_DEPTH: usize = 10;

/// Undelivered age after which a delivery counts as stuck, in ticks.
const STUCK_AGE_TICKS: u64 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkDirection {
    Incoming,
    Outgoing,
}

impl LinkDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            LinkDirection::Incoming => "in",
            LinkDirection::Outgoing => "out",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkType {
    Endpoint,
    RouterControl,
    InterRouter,
    EdgeDownlink,
    InterEdge,
}

impl LinkType {
    pub fn as_str(&self) -> &'static str {
        match self {
            LinkType::Endpoint => "endpoint",
            LinkType::RouterControl => "router-control",
            LinkType::InterRouter => "inter-router",
            LinkType::EdgeDownlink => "edge-downlink",
            LinkType::InterEdge => "inter-edge",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperStatus {
    Up,
    Down,
    Quiescing,
    Idle,
}

impl OperStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperStatus::Up => "up",
            OperStatus::Down => "down",
            OperStatus::Quiescing => "quiescing",
            OperStatus::Idle => "idle",
        }
    }
}

/// A named unidirectional flow between the local adaptor and a peer.
pub struct Link {
    pub name: String,
    pub identity: u64,
    pub link_type: LinkType,
    pub direction: LinkDirection,
    pub owning_addr: Option<String>,
    pub oper_status: OperStatus,
    pub conn_identity: u64,
    pub capacity: u32,
    pub priority: u8,

    credit: u32,
    /// Tick at which credit last dropped to zero; cleared when replenished.
    zero_credit_tick: Option<u64>,

    undelivered: VecDeque<Arc<Delivery>>,
    unsettled: Vec<Arc<Delivery>>,

    // Counters the management agent reads.
    pub total_deliveries: u64,
    pub presettled_deliveries: u64,
    pub dropped_presettled_deliveries: u64,
    pub accepted_deliveries: u64,
    pub rejected_deliveries: u64,
    pub released_deliveries: u64,
    pub modified_deliveries: u64,
    pub deliveries_delayed_1sec: u64,
    pub deliveries_delayed_10sec: u64,
    pub deliveries_stuck: u64,

    // Settle-rate window: one slot per uptime tick, advanced lazily.
    settled_ring: [u64; LINK_RATE_DEPTH],
    rate_cursor: usize,
    rate_tick: u64,

    session: Arc<Session>,
    outgoing: BufferChain,
}

impl Link {
    pub fn new(
        name: impl Into<String>,
        identity: u64,
        link_type: LinkType,
        direction: LinkDirection,
        conn_identity: u64,
        session: Arc<Session>,
    ) -> Self {
        Self {
            name: name.into(),
            identity,
            link_type,
            direction,
            owning_addr: None,
            oper_status: OperStatus::Up,
            conn_identity,
            capacity: 250,
            priority: 4,
            credit: 0,
            zero_credit_tick: Some(uptime_ticks()),
            undelivered: VecDeque::new(),
            unsettled: Vec::new(),
            total_deliveries: 0,
            presettled_deliveries: 0,
            dropped_presettled_deliveries: 0,
            accepted_deliveries: 0,
            rejected_deliveries: 0,
            released_deliveries: 0,
            modified_deliveries: 0,
            deliveries_delayed_1sec: 0,
            deliveries_delayed_10sec: 0,
            deliveries_stuck: 0,
            settled_ring: [0; LINK_RATE_DEPTH],
            rate_cursor: 0,
            rate_tick: uptime_ticks(),
            session,
            outgoing: BufferChain::new(),
        }
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    // --- Credit

    pub fn credit(&self) -> u32 {
        self.credit
    }

    /// Replenishes or revokes credit, tracking the first-zero-credit tick.
    pub fn set_credit(&mut self, credit: u32) {
        self.credit = credit;
        if credit == 0 {
            self.zero_credit_tick.get_or_insert_with(uptime_ticks);
        } else {
            self.zero_credit_tick = None;
        }
    }

    /// Consumes one credit for an outgoing delivery.
    pub fn use_credit(&mut self) -> bool {
        if self.credit == 0 {
            return false;
        }
        self.credit -= 1;
        if self.credit == 0 {
            self.zero_credit_tick = Some(uptime_ticks());
        }
        true
    }

    /// Seconds this link has been without credit; 0 while credit is held.
    pub fn zero_credit_seconds(&self) -> u64 {
        match self.zero_credit_tick {
            Some(t) => uptime_ticks().saturating_sub(t),
            None => 0,
        }
    }

    // --- Delivery queues

    /// Enqueues a delivery for transmission, strictly FIFO.
    pub fn deliver(&mut self, delivery: Arc<Delivery>) {
        self.total_deliveries += 1;
        if delivery.is_settled() {
            self.presettled_deliveries += 1;
        }
        self.undelivered.push_back(delivery);
    }

    /// Next delivery to transmit; moves it to the unsettled queue unless
    /// presettled.
    pub fn next_undelivered(&mut self) -> Option<Arc<Delivery>> {
        let delivery = self.undelivered.pop_front()?;
        if !delivery.is_settled() {
            self.unsettled.push(delivery.clone());
        }
        Some(delivery)
    }

    pub fn undelivered_count(&self) -> usize {
        self.undelivered.len()
    }

    pub fn unsettled_count(&self) -> usize {
        self.unsettled.len()
    }

    /// Applies a terminal disposition and settles the delivery, feeding the
    /// settle-rate window.
    pub fn settle(&mut self, delivery: &Arc<Delivery>, disposition: Disposition) {
        match disposition {
            Disposition::Accepted => self.accepted_deliveries += 1,
            Disposition::Rejected => self.rejected_deliveries += 1,
            Disposition::Released => self.released_deliveries += 1,
            Disposition::Modified => self.modified_deliveries += 1,
            Disposition::None => {}
        }
        delivery.set_local_disposition(disposition);
        delivery.settle();
        self.unsettled.retain(|d| !Arc::ptr_eq(d, delivery));

        self.advance_rate(uptime_ticks());
        self.settled_ring[self.rate_cursor] += 1;
    }

    /// Drops every queued delivery at connection close: undelivered ones are
    /// Released (retriable), in-flight unsettled ones get a best-effort
    /// Modified disposition.
    pub fn drain_at_close(&mut self) {
        while let Some(d) = self.undelivered.pop_front() {
            if d.is_settled() {
                self.dropped_presettled_deliveries += 1;
            } else {
                d.set_local_disposition(Disposition::Released);
                d.settle();
                self.released_deliveries += 1;
            }
        }
        for d in self.unsettled.drain(..) {
            d.set_local_disposition(Disposition::Modified);
            d.settle();
            self.modified_deliveries += 1;
        }
        self.oper_status = OperStatus::Down;
    }

    // --- Settle rate

    /// Advances the rate ring to `now`, zeroing the ticks skipped.
    pub(crate) fn advance_rate(&mut self, now: u64) {
        let mut delta = now.saturating_sub(self.rate_tick);
        if delta == 0 {
            return;
        }
        if delta > LINK_RATE_DEPTH as u64 {
            delta = LINK_RATE_DEPTH as u64;
        }
        for _ in 0..delta {
            self.rate_cursor = (self.rate_cursor + 1) % LINK_RATE_DEPTH;
            self.settled_ring[self.rate_cursor] = 0;
        }
        self.rate_tick = now;
    }

    /// Settlements per tick, averaged over the ring. Advances the ring to
    /// `now` first so idle time decays the rate.
    pub fn settle_rate(&mut self, now: u64) -> u64 {
        self.advance_rate(now);
        let total: u64 = self.settled_ring.iter().sum();
        total / LINK_RATE_DEPTH as u64
    }

    // --- Stuck-delivery detection

    /// Scans the undelivered queue, advancing the delayed counters and
    /// marking stuck deliveries. Marks only; never cancels.
    pub fn scan_stuck(&mut self) {
        for delivery in &self.undelivered {
            let age = delivery.age_ticks();
            let (one, ten) = delivery.note_delay(age);
            if one {
                self.deliveries_delayed_1sec += 1;
            }
            if ten {
                self.deliveries_delayed_10sec += 1;
            }
            if age >= STUCK_AGE_TICKS && delivery.mark_stuck() {
                self.deliveries_stuck += 1;
            }
        }
    }

    // --- Outgoing octet queue

    /// Queues raw octets for the connection writer.
    pub fn queue_octets(&mut self, octets: &[u8]) {
        self.outgoing.writer().write_exact(octets).expect("chain write");
    }

    /// Takes everything queued so far.
    pub fn take_outgoing(&mut self) -> BufferChain {
        self.outgoing.take()
    }

    pub fn outgoing_octets(&self) -> usize {
        self.outgoing.octets()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Message;

    fn link() -> Link {
        let (session, _waiter) = Session::new();
        Link::new("l1", 1, LinkType::Endpoint, LinkDirection::Outgoing, 7, session)
    }

    #[test]
    fn test_credit_window() {
        let mut l = link();
        assert_eq!(l.credit(), 0);
        assert!(!l.use_credit());

        l.set_credit(2);
        assert_eq!(l.zero_credit_seconds(), 0);
        assert!(l.use_credit());
        assert!(l.use_credit());
        assert!(!l.use_credit());
        // Credit exhausted: the zero-credit clock restarts.
        assert!(l.zero_credit_tick.is_some());
    }

    #[test]
    fn test_fifo_delivery_order() {
        let mut l = link();
        let a = Delivery::new(Message::new());
        let b = Delivery::new(Message::new());
        l.deliver(a.clone());
        l.deliver(b.clone());

        let first = l.next_undelivered().unwrap();
        assert!(Arc::ptr_eq(&first, &a));
        let second = l.next_undelivered().unwrap();
        assert!(Arc::ptr_eq(&second, &b));
        assert!(l.next_undelivered().is_none());
        assert_eq!(l.unsettled_count(), 2);
    }

    #[test]
    fn test_settle_updates_counters() {
        let mut l = link();
        let d = Delivery::new(Message::new());
        l.deliver(d.clone());
        l.next_undelivered();

        l.settle(&d, Disposition::Accepted);
        assert_eq!(l.accepted_deliveries, 1);
        assert_eq!(l.unsettled_count(), 0);
        assert!(d.is_settled());
        assert_eq!(d.local_disposition(), Disposition::Accepted);
    }

    #[test]
    fn test_settle_rate_window() {
        let mut l = link();
        let now = uptime_ticks();
        for _ in 0..(LINK_RATE_DEPTH as u64 * 2) {
            let d = Delivery::new(Message::new());
            l.deliver(d.clone());
            l.next_undelivered();
            l.settle(&d, Disposition::Accepted);
        }
        // All settlements landed on the current tick.
        assert_eq!(l.settle_rate(now), 2);

        // Far in the future the whole window has decayed.
        assert_eq!(l.settle_rate(now + LINK_RATE_DEPTH as u64 + 1), 0);
    }

    #[test]
    fn test_drain_at_close() {
        let mut l = link();
        let queued = Delivery::new(Message::new());
        let inflight = Delivery::new(Message::new());
        l.deliver(queued.clone());
        l.deliver(inflight.clone());
        l.next_undelivered(); // inflight... takes `queued` actually
        l.drain_at_close();

        assert_eq!(l.oper_status, OperStatus::Down);
        assert!(queued.is_settled());
        assert!(inflight.is_settled());
        assert_eq!(l.undelivered_count(), 0);
        assert_eq!(l.unsettled_count(), 0);
    }

    #[test]
    fn test_queue_octets_roundtrip() {
        use crate::buffers::reader::Reader;

        let mut l = link();
        l.queue_octets(&[1, 2, 3]);
        l.queue_octets(&[4, 5]);
        assert_eq!(l.outgoing_octets(), 5);

        let chain = l.take_outgoing();
        let mut out = [0u8; 5];
        chain.reader().read_exact(&mut out).unwrap();
        assert_eq!(out, [1, 2, 3, 4, 5]);
        assert_eq!(l.outgoing_octets(), 0);
    }
}
