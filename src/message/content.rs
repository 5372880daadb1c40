//! Shared message content.
//!
//! One content object backs every delivery of a logical message: the buffer
//! chain, the section locators, the parse cursor, the atomic flags, the Q2
//! state and the cut-through machinery. Handles share it by `Arc`; the last
//! handle to drop releases the chain and any unsent cut-through slots back to
//! the buffer pool.
//!
//! Locking: one mutex protects structural state. The producer and consumer
//! activation records sit behind their own mutexes so tear-down signalling
//! never contends with the content lock; neither activation mutex may be
//! acquired while the content lock is held.

use std::{
    collections::BTreeMap,
    sync::{
        Arc, Mutex, MutexGuard,
        atomic::{AtomicBool, AtomicU8, AtomicU32, Ordering},
    },
};

use crate::{
    buffers::{BufferChain, ChainPos, pool::Buffer},
    codec::annotations::RouterAnnotations,
    config::{QLimits, qlimits},
    cutthrough::{Activation, CutThroughRing},
};

use super::parse::{Depth, PropertyFields, Sections};

/// Callback invoked when a message leaves the Q2 blocked state. Runs on
/// whichever thread releases the unblocking buffer, so it must be thread-safe.
pub type Q2UnblockHandler = Arc<dyn Fn() + Send + Sync>;

/// Body-segment bookkeeping for the stream-data iterator.
#[derive(Default)]
pub(crate) struct StreamState {
    /// Where the next body-data scan resumes; established lazily after the
    /// header sections are parsed.
    pub next_pos: Option<ChainPos>,
    /// Sequence number of the next segment handed out.
    pub next_index: u64,
    /// Segments handed out and not yet released: index -> free boundary.
    pub outstanding: BTreeMap<u64, u64>,
    /// Segments released out of order, waiting for earlier ones.
    pub released: BTreeMap<u64, u64>,
    /// All segments below this index are released and their buffers freed.
    pub frontier: u64,
}

pub(crate) struct ContentState {
    pub chain: BufferChain,
    /// Buffer owned and filled by receive; moves onto the chain when full.
    pub pending: Option<Buffer>,

    pub sections: Sections,
    pub fields: PropertyFields,
    pub parse_pos: ChainPos,
    pub parse_depth: Depth,

    /// Incoming router annotations, decoded once.
    pub ra: Option<RouterAnnotations>,
    pub ra_parsed: bool,
    /// Link routing: no router annotations involved at all.
    pub ra_disabled: bool,

    pub bytes_received: u64,
    /// Configured maximum; 0 enforces nothing.
    pub max_message_size: u64,
    /// Body buffers released early while sending.
    pub buffers_freed: u64,

    pub q2_input_holdoff: bool,
    pub q2_disabled: bool,
    pub q2_unblocker: Option<Q2UnblockHandler>,

    pub stream: StreamState,
}

impl ContentState {
    /// Buffers currently buffered behind this content, the pending receive
    /// buffer included.
    pub fn buffer_count(&self) -> usize {
        self.chain.len() + usize::from(self.pending.is_some())
    }
}

/// The shared, immutable-append body of one logical message.
pub struct MessageContent {
    pub(crate) state: Mutex<ContentState>,
    limits: QLimits,

    receive_complete: AtomicBool,
    aborted: AtomicBool,
    discard: AtomicBool,
    oversize: AtomicBool,
    no_body: AtomicBool,
    priority_parsed: AtomicBool,
    priority: AtomicU8,
    cut_through: AtomicBool,
    fanout: AtomicU32,

    pub(crate) ring: CutThroughRing,
    pub(crate) producer_activation: Mutex<Activation>,
    pub(crate) consumer_activation: Mutex<Activation>,
}

impl MessageContent {
    pub(crate) fn new(max_message_size: u64) -> Self {
        Self {
            state: Mutex::new(ContentState {
                chain: BufferChain::new(),
                pending: None,
                sections: Sections::default(),
                fields: PropertyFields::default(),
                parse_pos: ChainPos::new(0, 0),
                parse_depth: Depth::None,
                ra: None,
                ra_parsed: false,
                ra_disabled: false,
                bytes_received: 0,
                max_message_size,
                buffers_freed: 0,
                q2_input_holdoff: false,
                q2_disabled: false,
                q2_unblocker: None,
                stream: StreamState::default(),
            }),
            limits: qlimits(),
            receive_complete: AtomicBool::new(false),
            aborted: AtomicBool::new(false),
            discard: AtomicBool::new(false),
            oversize: AtomicBool::new(false),
            no_body: AtomicBool::new(false),
            priority_parsed: AtomicBool::new(false),
            priority: AtomicU8::new(4),
            cut_through: AtomicBool::new(false),
            fanout: AtomicU32::new(0),
            ring: CutThroughRing::new(),
            producer_activation: Mutex::new(Activation::default()),
            consumer_activation: Mutex::new(Activation::default()),
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, ContentState> {
        self.state.lock().unwrap()
    }

    pub(crate) fn limits(&self) -> &QLimits {
        &self.limits
    }

    // --- Write-once atomic flags

    pub fn receive_complete(&self) -> bool {
        self.receive_complete.load(Ordering::Acquire)
    }

    pub(crate) fn set_receive_complete(&self) {
        self.receive_complete.store(true, Ordering::Release);
    }

    pub fn aborted(&self) -> bool {
        self.aborted.load(Ordering::Acquire)
    }

    pub(crate) fn set_aborted(&self) {
        self.aborted.store(true, Ordering::Release);
    }

    pub fn discard(&self) -> bool {
        self.discard.load(Ordering::Acquire)
    }

    /// Latching: false to true only.
    pub(crate) fn set_discard(&self, value: bool) {
        if value {
            self.discard.store(true, Ordering::Release);
        }
    }

    pub fn oversize(&self) -> bool {
        self.oversize.load(Ordering::Acquire)
    }

    pub(crate) fn set_oversize(&self) {
        self.oversize.store(true, Ordering::Release);
    }

    pub fn no_body(&self) -> bool {
        self.no_body.load(Ordering::Acquire)
    }

    pub(crate) fn set_no_body(&self) {
        self.no_body.store(true, Ordering::Release);
    }

    pub fn fanout(&self) -> u32 {
        self.fanout.load(Ordering::Acquire)
    }

    pub(crate) fn add_fanout(&self) {
        self.fanout.fetch_add(1, Ordering::AcqRel);
    }

    /// Body buffers released back to the pool before the content itself was
    /// dropped (early release on send, stream-data release).
    pub fn buffers_freed(&self) -> u64 {
        self.lock().buffers_freed
    }

    /// The message's AMQP priority, parsed lazily from the HEADER section.
    pub fn priority(&self) -> u8 {
        if self.priority_parsed.load(Ordering::Acquire) {
            return self.priority.load(Ordering::Acquire);
        }
        let state = self.lock();
        let p = super::parse::parse_priority(&state);
        drop(state);
        self.priority.store(p, Ordering::Release);
        self.priority_parsed.store(true, Ordering::Release);
        p
    }

    // --- Cut-through

    pub fn is_cut_through(&self) -> bool {
        self.cut_through.load(Ordering::Acquire)
    }

    /// Transitions this content to cut-through. Irreversible; the classical
    /// accessors fail afterwards.
    pub(crate) fn enable_cut_through(&self) {
        self.cut_through.store(true, Ordering::Release);
    }

    pub(crate) fn set_producer_activation(&self, activation: Activation) {
        *self.producer_activation.lock().unwrap() = activation;
    }

    pub(crate) fn set_consumer_activation(&self, activation: Activation) {
        *self.consumer_activation.lock().unwrap() = activation;
    }

    pub(crate) fn clear_producer_activation(&self) {
        *self.producer_activation.lock().unwrap() = Activation::default();
    }

    pub(crate) fn clear_consumer_activation(&self) {
        *self.consumer_activation.lock().unwrap() = Activation::default();
    }

    // --- Q2

    /// True while the content holds off input because of Q2.
    pub fn is_q2_blocked(&self) -> bool {
        self.lock().q2_input_holdoff
    }

    /// Evaluated with the content lock held.
    pub(crate) fn q2_should_block(&self, state: &ContentState) -> bool {
        !state.q2_disabled && state.buffer_count() > self.limits.q2_upper
    }

    /// Evaluated with the content lock held.
    pub(crate) fn q2_should_unblock(&self, state: &ContentState) -> bool {
        state.q2_disabled || state.buffer_count() <= self.limits.q2_lower
    }

    /// Applies the block predicate; returns true when input must hold off.
    pub(crate) fn q2_check_block(&self, state: &mut ContentState) -> bool {
        if self.q2_should_block(state) {
            state.q2_input_holdoff = true;
        }
        state.q2_input_holdoff
    }

    /// Clears the holdoff when the unblock predicate passes, handing back the
    /// handler to invoke after the lock is dropped. Exactly one caller
    /// observes the transition per Q2 cycle.
    pub(crate) fn q2_take_unblock(&self, state: &mut ContentState) -> Option<Q2UnblockHandler> {
        if state.q2_input_holdoff && self.q2_should_unblock(state) {
            state.q2_input_holdoff = false;
            return state.q2_unblocker.clone();
        }
        None
    }

    /// Disables Q2 for this content. Idempotent; may fire the unblock handler.
    pub(crate) fn disable_q2(&self) {
        let handler = {
            let mut state = self.lock();
            state.q2_disabled = true;
            self.q2_take_unblock(&mut state)
        };
        if let Some(handler) = handler {
            handler();
        }
    }
}

impl std::fmt::Debug for MessageContent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageContent")
            .field("receive_complete", &self.receive_complete())
            .field("aborted", &self.aborted())
            .field("cut_through", &self.is_cut_through())
            .field("fanout", &self.fanout())
            .finish_non_exhaustive()
    }
}
