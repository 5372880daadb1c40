//! Per-direction message handle.
//!
//! A [`Message`] is a lightweight view over a shared [`MessageContent`]: it
//! owns only the outgoing byte cursor, the per-send router-annotation
//! overrides and the send-complete flag. Handles of the same content may be
//! sent concurrently by different workers; the content's lock serializes the
//! structural state they share.

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use log::trace;

use crate::{
    buffers::{BufferChain, ChainPos, reader::AdvanceableReader, reader::Reader},
    codec::{
        Composer,
        annotations::{AnnotationsError, RouterAnnotations, ra_flags},
        compose::data_section_bytes,
    },
    cutthrough::Activation,
    link::{Link, Server},
};

use super::{
    content::{ContentState, MessageContent, Q2UnblockHandler},
    parse::{Depth, DepthStatus, PropertyField, parse_forward},
    stream::{StreamDataResult, body_start, next_stream_data},
};

/// Outbound router-annotations stripping policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RaStrip {
    /// Send all router annotations.
    None,
    /// Strip the ingress-router field.
    Ingress,
    /// Strip the trace list.
    Trace,
    /// Send no router-annotations section at all (non-router egress).
    All,
}

/// Identity of the local router, consulted when composing outgoing
/// annotations.
#[derive(Debug, Clone)]
pub struct RouterNode {
    pub id: String,
    /// Edge routers send a null ingress-router and an empty trace.
    pub is_edge: bool,
    /// Mesh identifier stamped by ingress edge routers.
    pub mesh_id: Option<String>,
}

impl RouterNode {
    pub fn interior(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            is_edge: false,
            mesh_id: None,
        }
    }

    pub fn edge(id: impl Into<String>, mesh_id: Option<String>) -> Self {
        Self {
            id: id.into(),
            is_edge: true,
            mesh_id,
        }
    }
}

/// Outcome of one receive call.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReceiveOutcome {
    /// Q2 engaged: stop requesting input for this message.
    pub q2_blocked: bool,
    /// The message crossed `max_message_size`; reject it and stop reading.
    pub oversize: bool,
}

/// Outcome of one send call.
#[derive(Debug, Clone, Copy, Default)]
pub struct SendOutcome {
    /// The session crossed its Q3 watermark; no link on it may push further
    /// frames until the session drains.
    pub q3_stalled: bool,
    /// Octets queued on the link by this call.
    pub octets: usize,
    /// The message is now fully sent.
    pub send_complete: bool,
    /// The sender aborted; the stream was truncated.
    pub aborted: bool,
}

/// Message fields addressable through [`Message::field_reader`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageField {
    RouterAnnotations,
    Header,
    DeliveryAnnotations,
    MessageAnnotations,
    Properties,
    ApplicationProperties,
    Body,
    Footer,
    MessageId,
    UserId,
    To,
    Subject,
    ReplyTo,
    CorrelationId,
    ContentType,
    ContentEncoding,
    AbsoluteExpiryTime,
    CreationTime,
    GroupId,
    GroupSequence,
    ReplyToGroupId,
}

/// A lazy octet sequence over one message field. Valid for as long as any
/// handle of the content is alive; the underlying buffers are pinned.
pub struct FieldReader {
    content: Arc<MessageContent>,
    pos: ChainPos,
    remaining: usize,
    tag: u8,
}

impl FieldReader {
    pub fn len(&self) -> usize {
        self.remaining
    }

    /// Constructor tag of the field's value.
    pub fn tag(&self) -> u8 {
        self.tag
    }

    pub fn is_empty(&self) -> bool {
        self.remaining == 0
    }

    /// Copies up to `out.len()` octets, advancing the cursor.
    pub fn read(&mut self, out: &mut [u8]) -> usize {
        let state = self.content.lock();
        let take = out.len().min(self.remaining);
        let mut reader = state.chain.reader_at(self.pos);
        let Ok(()) = reader.read_exact(&mut out[..take]) else {
            return 0;
        };
        self.pos = reader.pos();
        self.remaining -= take;
        take
    }

    /// Copies the remaining octets out.
    pub fn to_vec(mut self) -> Vec<u8> {
        let mut out = vec![0u8; self.remaining];
        let n = self.read(&mut out);
        out.truncate(n);
        out
    }

    /// The remaining octets as UTF-8.
    pub fn into_string(self) -> Option<String> {
        String::from_utf8(self.to_vec()).ok()
    }
}

/// Exclusive, per-direction view over a shared message content.
pub struct Message {
    content: Arc<MessageContent>,

    /// Outgoing byte cursor; established on the first send.
    cursor: Option<ChainPos>,

    // Per-send router-annotation overrides.
    ra_flags: u32,
    ra_to_override: Option<String>,
    ra_ingress_mesh: Option<String>,
    ra_sent: bool,

    tag_sent: bool,
    is_fanout: bool,
    cut_through_started: bool,
    send_complete: AtomicBool,
}

impl Default for Message {
    fn default() -> Self {
        Self::new()
    }
}

impl Message {
    /// A new empty message with no size limit.
    pub fn new() -> Self {
        Self::with_max_size(0)
    }

    /// A new empty message enforcing `max_message_size` (0 = unlimited).
    pub fn with_max_size(max_message_size: u64) -> Self {
        Self::from_content(Arc::new(MessageContent::new(max_message_size)))
    }

    fn from_content(content: Arc<MessageContent>) -> Self {
        Self {
            content,
            cursor: None,
            ra_flags: 0,
            ra_to_override: None,
            ra_ingress_mesh: None,
            ra_sent: false,
            tag_sent: false,
            is_fanout: false,
            cut_through_started: false,
            send_complete: AtomicBool::new(false),
        }
    }

    /// A new lightweight reference to the same content, with its own cursor
    /// and annotation overrides.
    pub fn copy(&self) -> Message {
        Self::from_content(self.content.clone())
    }

    pub(crate) fn content(&self) -> &Arc<MessageContent> {
        &self.content
    }

    /// Builds a message from up to five pre-built section fragments, taking
    /// ownership of them in order.
    pub fn compose(fragments: Vec<Composer>, receive_complete: bool) -> Message {
        debug_assert!(fragments.len() <= 5);
        let msg = Message::new();
        {
            let mut state = msg.content.lock();
            for fragment in fragments {
                let mut chain = fragment.into_chain();
                state.chain.append(&mut chain);
            }
        }
        if receive_complete {
            msg.content.set_receive_complete();
        }
        msg
    }

    // --- Receive side

    /// Appends incoming octets, parses forward and applies Q2 and the
    /// oversize policy. `end_of_message` is the framing layer's end signal.
    pub fn receive(&mut self, octets: &[u8], end_of_message: bool) -> ReceiveOutcome {
        let mut outcome = ReceiveOutcome::default();
        let handler = {
            let mut state = self.content.lock();

            if !self.content.oversize() {
                state.bytes_received += octets.len() as u64;
                if state.max_message_size > 0 && state.bytes_received > state.max_message_size {
                    // Stop reading and mark for rejection; already-buffered
                    // octets are kept for the reject disposition.
                    self.content.set_oversize();
                    self.content.set_discard(true);
                    outcome.oversize = true;
                } else {
                    Self::buffer_octets(&mut state, octets);
                }
            }

            if end_of_message {
                if let Some(buf) = state.pending.take() {
                    if buf.is_empty() {
                        crate::buffers::pool::release(buf);
                    } else {
                        state.chain.push(buf);
                    }
                }
                self.content.set_receive_complete();
            }

            // Parse as far as the header sections allow; body sections are the
            // segmenter's business.
            let rc = self.content.receive_complete();
            let _ = parse_forward(&mut state, Depth::ApplicationProperties, rc);

            outcome.q2_blocked = self.content.q2_check_block(&mut state);
            self.content.q2_take_unblock(&mut state)
        };
        // A completed message may have dropped below the watermark already.
        if let Some(handler) = handler {
            handler();
        }
        outcome
    }

    fn buffer_octets(state: &mut ContentState, mut octets: &[u8]) {
        while !octets.is_empty() {
            let pending = state
                .pending
                .get_or_insert_with(crate::buffers::pool::alloc);
            let n = pending.fill_from(octets);
            octets = &octets[n..];
            if pending.remaining() == 0 {
                let full = state.pending.take().unwrap();
                state.chain.push(full);
            }
        }
    }

    /// Appends another pre-built fragment (streaming producers). Returns true
    /// when this call drove Q2 into the blocked state.
    pub fn extend(&mut self, fragment: Composer) -> bool {
        let mut state = self.content.lock();
        let mut chain = fragment.into_chain();
        state.chain.append(&mut chain);
        let rc = self.content.receive_complete();
        let _ = parse_forward(&mut state, Depth::ApplicationProperties, rc);
        self.content.q2_check_block(&mut state)
    }

    /// Appends raw body buffers as one body-data section. Returns true when
    /// this call drove Q2 into the blocked state.
    pub fn stream_data_append(&mut self, mut data: BufferChain) -> bool {
        use crate::buffers::writer::Writer;
        let mut state = self.content.lock();
        let header = data_section_bytes(data.octets());
        state.chain.writer().write_exact(&header).expect("chain write");
        state.chain.append(&mut data);
        self.content.q2_check_block(&mut state)
    }

    /// Appends a footer section built from `footer` and disables Q2 so the
    /// tail drains unconditionally.
    pub fn footer_append(&mut self, footer: Composer) {
        {
            let mut state = self.content.lock();
            let mut chain = footer.into_chain();
            state.chain.append(&mut chain);
        }
        self.content.disable_q2();
    }

    // --- Router annotations

    /// Parses the leading router-annotations section if present.
    ///
    /// On non-router ingress the section is not permitted: its presence is an
    /// error and the message must be rejected.
    pub fn parse_router_annotations(&self, router_ingress: bool) -> Result<(), AnnotationsError> {
        let rc = self.content.receive_complete();
        let mut state = self.content.lock();
        if state.ra_parsed || state.ra_disabled {
            return Ok(());
        }
        let _ = parse_forward(&mut state, Depth::RouterAnnotations, rc);

        let section = state.sections.router_annotations;
        if !section.is_present() {
            if state.parse_depth > Depth::None {
                // The first section has been seen and it is not ours.
                state.ra_parsed = true;
            }
            return Ok(());
        }
        if !router_ingress {
            return Err(AnnotationsError::NotPermitted);
        }

        let mut reader = state.chain.reader_at(section.pos);
        let ra = RouterAnnotations::decode(&mut reader)?;
        trace!("parsed router annotations: {ra:?}");
        state.ra = Some(ra);
        state.ra_parsed = true;
        Ok(())
    }

    /// Incoming router annotations, once parsed.
    pub fn router_annotations(&self) -> Option<RouterAnnotations> {
        self.content.lock().ra.clone()
    }

    /// Disables all router-annotations handling (link routing).
    pub fn disable_router_annotations(&mut self) {
        self.content.lock().ra_disabled = true;
    }

    /// Sets the outgoing to-override annotation for this send.
    pub fn set_to_override_annotation(&mut self, to: Option<String>) {
        self.ra_to_override = to;
    }

    /// Sets the outgoing ingress-mesh annotation for this send.
    pub fn set_ingress_mesh_annotation(&mut self, mesh: String) {
        self.ra_ingress_mesh = Some(mesh);
    }

    /// Classifies the message as streaming; downstream routers keep the
    /// classification until delivery to an endpoint.
    pub fn set_streaming_annotation(&mut self) {
        self.ra_flags |= ra_flags::STREAMING;
    }

    pub fn is_streaming(&self) -> bool {
        self.ra_flags & ra_flags::STREAMING != 0
            || self
                .content
                .lock()
                .ra
                .as_ref()
                .is_some_and(RouterAnnotations::is_streaming)
    }

    /// Marks the message for re-routing should the delivery come back
    /// Released.
    pub fn set_resend_released_annotation(&mut self, value: bool) {
        if value {
            self.ra_flags |= ra_flags::RESEND_RELEASED;
        } else {
            self.ra_flags &= !ra_flags::RESEND_RELEASED;
        }
    }

    pub fn is_resend_released(&self) -> bool {
        self.ra_flags & ra_flags::RESEND_RELEASED != 0
            || self
                .content
                .lock()
                .ra
                .as_ref()
                .is_some_and(RouterAnnotations::is_resend_released)
    }

    // --- Send side

    /// Emits message octets on `link`, composing outgoing annotations on the
    /// first call, until the link's session hits its Q3 watermark or the
    /// buffered octets run out.
    pub fn send(&mut self, link: &mut Link, strip: RaStrip, node: &RouterNode) -> SendOutcome {
        debug_assert!(!self.content.is_cut_through(), "classical send on a cut-through stream");

        let mut outcome = SendOutcome::default();
        let session = link.session().clone();
        let limits = *self.content.limits();

        let handler = {
            let mut state = self.content.lock();
            let rc = self.content.receive_complete();

            if !self.ra_sent {
                let _ = parse_forward(&mut state, Depth::RouterAnnotations, rc);
                if state.parse_depth == Depth::None && !rc {
                    // Cannot establish the cursor until the leading section
                    // has fully arrived.
                    return outcome;
                }
                let incoming = state.sections.router_annotations;

                // The outgoing cursor starts past the incoming section; the
                // outgoing section is composed fresh below.
                let start = if incoming.is_present() {
                    let mut r = state.chain.reader_at(incoming.pos);
                    let _ = r.skip(incoming.total_length());
                    r.pos()
                } else {
                    ChainPos::new(state.chain.head_ordinal(), 0)
                };

                if strip != RaStrip::All && !state.ra_disabled {
                    let ra = compose_outgoing_annotations(
                        state.ra.as_ref(),
                        strip,
                        node,
                        self.ra_flags,
                        self.ra_to_override.as_deref(),
                        self.ra_ingress_mesh.as_deref(),
                    );
                    let bytes = ra.encode();
                    link.queue_octets(&bytes);
                    session.note_queued(bytes.len());
                    outcome.octets += bytes.len();
                }

                self.cursor = Some(start);
                self.ra_sent = true;
            }

            let mut pos = self.cursor.unwrap();
            loop {
                if session.pending_octets() >= limits.q3_upper_octets() {
                    outcome.q3_stalled = true;
                    session.set_stalled();
                    break;
                }
                // Normalize onto the next buffer when this one is drained.
                let Some(buf) = state.chain.get(pos.ordinal) else {
                    if pos.ordinal < state.chain.tail_ordinal() {
                        // Released buffer: another fanout handle freed it
                        // first; nothing left here for us.
                        pos = ChainPos::new(pos.ordinal + 1, 0);
                        continue;
                    }
                    break;
                };
                if pos.offset >= buf.len() {
                    if pos.ordinal + 1 >= state.chain.tail_ordinal() {
                        break;
                    }
                    pos = ChainPos::new(pos.ordinal + 1, 0);
                    continue;
                }
                let slice = &buf.as_slice()[pos.offset..];
                link.queue_octets(slice);
                session.note_queued(slice.len());
                outcome.octets += slice.len();
                pos = ChainPos::new(pos.ordinal, pos.offset + slice.len());
            }
            self.cursor = Some(pos);

            let remaining = state.chain.reader_at(pos).remaining();
            if self.content.aborted() && remaining == 0 {
                outcome.aborted = true;
                self.send_complete.store(true, Ordering::Release);
            } else if rc && remaining == 0 {
                self.send_complete.store(true, Ordering::Release);
            }
            outcome.send_complete = self.send_complete.load(Ordering::Acquire);

            // Sole consumer: buffers fully sent are released early; header
            // buffers stay pinned for the locators.
            if self.content.fanout() <= 1 && !self.is_fanout {
                let freed = state.chain.release_before(pos.ordinal);
                state.buffers_freed += freed as u64;
            }
            self.content.q2_take_unblock(&mut state)
        };
        if let Some(handler) = handler {
            handler();
        }
        outcome
    }

    /// Checks well-formedness up to `depth` without blocking.
    pub fn check_depth(&self, depth: Depth) -> DepthStatus {
        let rc = self.content.receive_complete();
        let mut state = self.content.lock();
        parse_forward(&mut state, depth, rc)
    }

    /// A lazy octet sequence over the named field, or `None` if absent.
    pub fn field_reader(&self, field: MessageField) -> Option<FieldReader> {
        let state = self.content.lock();
        let loc = match field {
            MessageField::RouterAnnotations => state.sections.router_annotations,
            MessageField::Header => state.sections.header,
            MessageField::DeliveryAnnotations => state.sections.delivery_annotations,
            MessageField::MessageAnnotations => state.sections.message_annotations,
            MessageField::Properties => state.sections.properties,
            MessageField::ApplicationProperties => state.sections.application_properties,
            MessageField::Body => state.sections.body,
            MessageField::Footer => state.sections.footer,
            MessageField::MessageId => *state.fields.get(PropertyField::MessageId),
            MessageField::UserId => *state.fields.get(PropertyField::UserId),
            MessageField::To => *state.fields.get(PropertyField::To),
            MessageField::Subject => *state.fields.get(PropertyField::Subject),
            MessageField::ReplyTo => *state.fields.get(PropertyField::ReplyTo),
            MessageField::CorrelationId => *state.fields.get(PropertyField::CorrelationId),
            MessageField::ContentType => *state.fields.get(PropertyField::ContentType),
            MessageField::ContentEncoding => *state.fields.get(PropertyField::ContentEncoding),
            MessageField::AbsoluteExpiryTime => *state.fields.get(PropertyField::AbsoluteExpiryTime),
            MessageField::CreationTime => *state.fields.get(PropertyField::CreationTime),
            MessageField::GroupId => *state.fields.get(PropertyField::GroupId),
            MessageField::GroupSequence => *state.fields.get(PropertyField::GroupSequence),
            MessageField::ReplyToGroupId => *state.fields.get(PropertyField::ReplyToGroupId),
        };
        if !loc.is_present() {
            return None;
        }
        let mut reader = state.chain.reader_at(loc.pos);
        reader.skip(loc.header_length).ok()?;
        let pos = reader.pos();
        drop(state);
        Some(FieldReader {
            content: self.content.clone(),
            pos,
            remaining: loc.length,
            tag: loc.tag,
        })
    }

    /// Gets the next body-data or footer segment of a streaming message.
    pub fn next_stream_data(&mut self) -> StreamDataResult {
        next_stream_data(&self.content)
    }

    // --- Flags

    pub fn receive_complete(&self) -> bool {
        self.content.receive_complete()
    }

    /// Forces receive-complete (adaptors signalling end-of-stream out of
    /// band).
    pub fn set_receive_complete(&self) {
        let handler = {
            let mut state = self.content.lock();
            if let Some(buf) = state.pending.take() {
                if buf.is_empty() {
                    crate::buffers::pool::release(buf);
                } else {
                    state.chain.push(buf);
                }
            }
            self.content.set_receive_complete();
            self.content.q2_take_unblock(&mut state)
        };
        if let Some(handler) = handler {
            handler();
        }
    }

    /// True once the message is both completely received and completely sent.
    pub fn send_complete(&self) -> bool {
        self.send_complete.load(Ordering::Acquire)
    }

    pub fn set_send_complete(&self) {
        self.send_complete.store(true, Ordering::Release);
    }

    pub fn tag_sent(&self) -> bool {
        self.tag_sent
    }

    pub fn set_tag_sent(&mut self, sent: bool) {
        self.tag_sent = sent;
    }

    /// Abort propagates to every downstream consumer of the content.
    pub fn set_aborted(&self) {
        self.content.set_aborted();
    }

    pub fn is_aborted(&self) -> bool {
        self.content.aborted()
    }

    pub fn set_discard(&self, discard: bool) {
        self.content.set_discard(discard);
    }

    pub fn is_discard(&self) -> bool {
        self.content.discard()
    }

    pub fn is_oversize(&self) -> bool {
        self.content.oversize()
    }

    pub fn set_no_body(&self) {
        self.content.set_no_body();
    }

    pub fn priority(&self) -> u8 {
        self.content.priority()
    }

    /// Registers another outbound consumer of this content.
    pub fn add_fanout(&mut self) {
        self.is_fanout = true;
        self.content.add_fanout();
    }

    // --- Q2

    pub fn set_q2_unblocked_handler(&self, handler: Q2UnblockHandler) {
        self.content.lock().q2_unblocker = Some(handler);
    }

    pub fn clear_q2_unblocked_handler(&self) {
        self.content.lock().q2_unblocker = None;
    }

    /// Disables Q2 hold-off for this message. Idempotent.
    pub fn disable_q2(&self) {
        self.content.disable_q2();
    }

    pub fn is_q2_blocked(&self) -> bool {
        self.content.is_q2_blocked()
    }

    // --- Cut-through

    /// Transitions the stream to cut-through, returning the raw-body start.
    /// Irreversible; classical body access fails afterwards.
    pub fn start_cut_through(&mut self) -> ChainPos {
        let mut state = self.content.lock();
        let rc = self.content.receive_complete();
        let _ = parse_forward(&mut state, Depth::ApplicationProperties, rc);
        let start = body_start(&state);
        drop(state);
        if !self.cut_through_started {
            self.cut_through_started = true;
            self.content.enable_cut_through();
        }
        start
    }

    pub fn is_cut_through(&self) -> bool {
        self.content.is_cut_through()
    }

    pub fn can_produce_buffers(&self) -> bool {
        self.content.ring.can_produce()
    }

    pub fn can_consume_buffers(&self) -> bool {
        self.content.ring.can_consume()
    }

    /// Moves `buffers` whole into the next cut-through slot. Must be preceded
    /// by a true [`can_produce_buffers`](Self::can_produce_buffers).
    pub fn produce_buffers(&self, buffers: BufferChain) {
        self.content.ring.produce(buffers);
    }

    /// Drains up to `limit` slots, returning the buffer lists taken.
    pub fn consume_buffers(&self, limit: usize) -> Vec<BufferChain> {
        let mut out = Vec::new();
        self.content.ring.consume(&mut out, limit);
        out
    }

    pub fn full_slot_count(&self) -> usize {
        self.content.ring.full_slot_count()
    }

    /// True exactly once when a stalled stream has drained enough to resume.
    pub fn resume_from_stalled(&self) -> bool {
        self.content.ring.resume_from_stalled()
    }

    pub fn set_producer_activation(&self, activation: Activation) {
        self.content.set_producer_activation(activation);
    }

    pub fn set_consumer_activation(&self, activation: Activation) {
        self.content.set_consumer_activation(activation);
    }

    pub fn clear_producer_activation(&self) {
        self.content.clear_producer_activation();
    }

    pub fn clear_consumer_activation(&self) {
        self.content.clear_consumer_activation();
    }

    /// Wakes the consumer side after producing cut-through buffers.
    pub fn notify_buffers_produced(&self, server: &Server) {
        let record = self.content.consumer_activation.lock().unwrap().snapshot();
        record.wake(server);
    }

    /// After consuming cut-through buffers: wakes the producer side iff the
    /// stream transitions out of the stalled state.
    pub fn notify_buffers_consumed(&self, server: &Server) {
        if self.resume_from_stalled() {
            let record = self.content.producer_activation.lock().unwrap().snapshot();
            record.wake(server);
        }
    }
}

/// Builds the outgoing router-annotations field set.
fn compose_outgoing_annotations(
    incoming: Option<&RouterAnnotations>,
    strip: RaStrip,
    node: &RouterNode,
    extra_flags: u32,
    to_override: Option<&str>,
    ingress_mesh: Option<&str>,
) -> RouterAnnotations {
    let incoming = incoming.cloned().unwrap_or_default();

    let ingress_router = if strip == RaStrip::Ingress {
        None
    } else if node.is_edge {
        incoming.ingress_router
    } else {
        // First interior hop claims ingress.
        incoming.ingress_router.or_else(|| Some(node.id.clone()))
    };

    let trace = if strip == RaStrip::Trace {
        Vec::new()
    } else {
        let mut trace = incoming.trace;
        if !node.is_edge {
            // The trace lists interior routers only; each forward appends the
            // local id exactly once.
            trace.push(node.id.clone());
        }
        trace
    };

    let ingress_mesh = ingress_mesh
        .map(str::to_string)
        .or(incoming.ingress_mesh)
        .or_else(|| if node.is_edge { node.mesh_id.clone() } else { None });

    RouterAnnotations {
        flags: incoming.flags | extra_flags,
        to_override: to_override.map(str::to_string).or(incoming.to_override),
        ingress_router,
        trace,
        ingress_mesh,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Performative;

    fn request_message(to: &str, subject: &str) -> Message {
        let mut header = Composer::new(Performative::Header);
        header.start_list().insert_bool(false).insert_null().end_list();

        let mut props = Composer::new(Performative::Properties);
        props
            .start_list()
            .insert_null()
            .insert_null()
            .insert_string(to)
            .insert_string(subject)
            .end_list();

        let mut body = Composer::new(Performative::BodyData);
        body.insert_binary(b"hello");

        Message::compose(vec![header, props, body], true)
    }

    #[test]
    fn test_compose_and_check_depth() {
        let msg = request_message("dest/a", "GET");
        assert_eq!(msg.check_depth(Depth::Header), DepthStatus::Ok);
        assert_eq!(msg.check_depth(Depth::Properties), DepthStatus::Ok);
        assert_eq!(msg.check_depth(Depth::Body), DepthStatus::Ok);
        assert_eq!(msg.check_depth(Depth::All), DepthStatus::Ok);
    }

    #[test]
    fn test_field_readers() {
        let msg = request_message("dest/a", "POST");
        assert_eq!(msg.check_depth(Depth::Properties), DepthStatus::Ok);

        let to = msg.field_reader(MessageField::To).unwrap();
        assert_eq!(to.into_string().as_deref(), Some("dest/a"));

        let subject = msg.field_reader(MessageField::Subject).unwrap();
        assert_eq!(subject.into_string().as_deref(), Some("POST"));

        assert!(msg.field_reader(MessageField::ReplyTo).is_none());
        assert!(msg.field_reader(MessageField::Footer).is_none());

        let body = msg.field_reader(MessageField::Body).unwrap();
        assert_eq!(body.to_vec(), b"hello");
    }

    #[test]
    fn test_receive_octet_stream() {
        // Feed the composed octets one at a time; parsing must resume at
        // arbitrary boundaries and land in the same place.
        let composed = request_message("addr", "GET");
        let octets = {
            let state = composed.content().lock();
            let mut out = vec![0u8; state.chain.octets()];
            state.chain.reader().read_exact(&mut out).unwrap();
            out
        };

        let mut msg = Message::new();
        for (i, byte) in octets.iter().enumerate() {
            let last = i == octets.len() - 1;
            msg.receive(&[*byte], last);
        }

        assert!(msg.receive_complete());
        assert_eq!(msg.check_depth(Depth::All), DepthStatus::Ok);
        let to = msg.field_reader(MessageField::To).unwrap();
        assert_eq!(to.into_string().as_deref(), Some("addr"));
    }

    #[test]
    fn test_empty_body_ok() {
        let mut props = Composer::new(Performative::Properties);
        props.start_list().insert_null().end_list();
        let msg = Message::compose(vec![props], true);

        assert!(msg.receive_complete());
        assert_eq!(msg.check_depth(Depth::Body), DepthStatus::Ok);
    }

    #[test]
    fn test_oversize_boundary() {
        let payload = vec![0u8; 100];

        // Exactly at the limit: accepted.
        let mut msg = Message::with_max_size(100);
        let outcome = msg.receive(&payload, true);
        assert!(!outcome.oversize);
        assert!(!msg.is_oversize());

        // One octet more: oversized, reading stops, marked for rejection.
        let mut msg = Message::with_max_size(100);
        let outcome = msg.receive(&payload, false);
        assert!(!outcome.oversize);
        let outcome = msg.receive(&[0xFF], false);
        assert!(outcome.oversize);
        assert!(msg.is_oversize());
        assert!(msg.is_discard());
    }

    #[test]
    fn test_copy_shares_content() {
        let msg = request_message("a", "GET");
        let copy = msg.copy();
        assert!(Arc::ptr_eq(msg.content(), copy.content()));
        // The copy has its own send state.
        assert!(!copy.ra_sent);
    }

    #[test]
    fn test_parse_depth_non_decreasing() {
        let composed = request_message("addr", "GET");
        let octets = {
            let state = composed.content().lock();
            let mut out = vec![0u8; state.chain.octets()];
            state.chain.reader().read_exact(&mut out).unwrap();
            out
        };

        let mut msg = Message::new();
        let mut last_depth = Depth::None;
        for chunk in octets.chunks(3) {
            msg.receive(chunk, false);
            let depth = msg.content().lock().parse_depth;
            assert!(depth >= last_depth);
            last_depth = depth;
        }
    }
}
