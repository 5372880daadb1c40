//! Per-stream state.
//!
//! Each HTTP/2 stream maps to a pair of deliveries: the inbound request
//! delivery handed to the forwarder, and the outbound response delivery the
//! router core attaches once routing succeeds. Stream status only moves
//! forward: Open, HalfClosed, FullyClosed.

use std::sync::Arc;

use crate::{buffers::BufferChain, link::Delivery, message::Message};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum StreamStatus {
    Open,
    HalfClosed,
    FullyClosed,
}

pub(crate) struct Stream {
    pub id: u32,
    pub status: StreamStatus,

    /// Routing address taken from `:path`.
    pub to: String,
    /// Request message until routing succeeds, then owned by `in_delivery`.
    pub message: Option<Message>,
    pub in_delivery: Option<Arc<Delivery>>,
    pub out_delivery: Option<Arc<Delivery>>,

    /// Response HEADERS emitted.
    pub header_sent: bool,
    /// A footer section was observed; emit trailers after the final DATA.
    pub footer_pending: bool,
    /// DATA received before the delivery was routed, spliced on first route.
    pub body_buffers: BufferChain,
    /// Outbound emission parked until `resume_data`.
    pub deferred: bool,
    /// Peer's per-stream send window for our DATA.
    pub send_window: i64,
    /// Copied body octets not yet emitted (window exhaustion mid-segment).
    pub out_backlog: Vec<u8>,
    /// The response stream ended (final DATA or trailers emitted).
    pub end_sent: bool,
    /// Flow-control credit withheld from the peer while Q2 is blocked.
    pub window_held: u32,

    pub bytes_in: u64,
    pub bytes_out: u64,
}

impl Stream {
    pub fn new(id: u32, send_window: i64) -> Self {
        Self {
            id,
            status: StreamStatus::Open,
            to: String::new(),
            message: None,
            in_delivery: None,
            out_delivery: None,
            header_sent: false,
            footer_pending: false,
            body_buffers: BufferChain::new(),
            deferred: false,
            send_window,
            out_backlog: Vec::new(),
            end_sent: false,
            window_held: 0,
            bytes_in: 0,
            bytes_out: 0,
        }
    }

    /// Advances the status one step. The path is monotone; a fully closed
    /// stream stays fully closed.
    pub fn advance_status(&mut self) {
        self.status = match self.status {
            StreamStatus::Open => StreamStatus::HalfClosed,
            StreamStatus::HalfClosed | StreamStatus::FullyClosed => StreamStatus::FullyClosed,
        };
    }

    pub fn is_fully_closed(&self) -> bool {
        self.status == StreamStatus::FullyClosed
    }

    /// The request message, whichever side currently owns it.
    pub fn with_request_message<R>(&mut self, f: impl FnOnce(&mut Message) -> R) -> Option<R> {
        if let Some(message) = self.message.as_mut() {
            return Some(f(message));
        }
        self.in_delivery.as_ref().and_then(|d| d.with_message(f))
    }

    /// Tears the stream down: each delivery reference is taken exactly once
    /// and never touched through this stream again.
    pub fn teardown(&mut self) -> (Option<Arc<Delivery>>, Option<Arc<Delivery>>) {
        self.status = StreamStatus::FullyClosed;
        self.message = None;
        (self.in_delivery.take(), self.out_delivery.take())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_monotone() {
        let mut s = Stream::new(1, 65_536);
        assert_eq!(s.status, StreamStatus::Open);
        s.advance_status();
        assert_eq!(s.status, StreamStatus::HalfClosed);
        s.advance_status();
        assert_eq!(s.status, StreamStatus::FullyClosed);
        // No backward transition.
        s.advance_status();
        assert_eq!(s.status, StreamStatus::FullyClosed);
    }

    #[test]
    fn test_teardown_takes_once() {
        let mut s = Stream::new(3, 65_536);
        s.in_delivery = Some(Delivery::new(Message::new()));
        let (in_dlv, out_dlv) = s.teardown();
        assert!(in_dlv.is_some());
        assert!(out_dlv.is_none());
        // A second teardown observes nothing.
        let (in_dlv, out_dlv) = s.teardown();
        assert!(in_dlv.is_none());
        assert!(out_dlv.is_none());
    }
}
