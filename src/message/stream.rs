//! Stream-data segmenter.
//!
//! Streaming consumers pull the body of a message as a sequence of segments,
//! one per body-data or footer section, without waiting for the message to
//! complete. Segments are released independently and possibly out of order;
//! buffers are returned to the pool once every earlier segment has also been
//! released, which is what drives Q2 unblocking on the producing side.

use std::sync::Arc;

use crate::buffers::{ChainPos, FieldLocation, reader::AdvanceableReader, reader::Reader};
use crate::codec::amqp::{descriptor, scan_field};

use super::{
    content::MessageContent,
    parse::{Depth, DepthStatus, parse_forward},
};

/// Result of asking for the next body segment.
pub enum StreamDataResult {
    /// A complete body-data section.
    BodyOk(StreamData),
    /// A complete footer section; the stream ends after it.
    FooterOk(StreamData),
    /// The next section has not fully arrived; try again later.
    Incomplete,
    /// The stream ended cleanly; no more segments.
    NoMore,
    /// The stream is corrupt.
    Invalid,
    /// The sender terminated the transfer; the message is incomplete.
    Aborted,
}

/// One body-data or footer section, released independently.
pub struct StreamData {
    content: Arc<MessageContent>,
    index: u64,
    section: FieldLocation,
    payload_pos: ChainPos,
    buffer_count: usize,
    released: bool,
    footer: bool,
}

impl StreamData {
    /// Octets of payload behind the section header.
    pub fn payload_length(&self) -> usize {
        self.section.length
    }

    /// Number of chain buffers this segment's octets occupy.
    pub fn buffer_count(&self) -> usize {
        self.buffer_count
    }

    pub fn is_footer(&self) -> bool {
        self.footer
    }

    /// Constructor tag of the section's value.
    pub fn tag(&self) -> u8 {
        self.section.tag
    }

    /// Copies the payload out. The backing buffers are pinned until release.
    pub fn payload(&self) -> Vec<u8> {
        let state = self.content.lock();
        let mut out = vec![0u8; self.section.length];
        let mut reader = state.chain.reader_at(self.payload_pos);
        if reader.read_exact(&mut out).is_err() {
            out.clear();
        }
        out
    }

    /// Releases this segment. Buffers free once all earlier segments are also
    /// released.
    pub fn release(mut self) {
        self.released = true;
        release_segment(&self.content, self.index, false);
    }

    /// Releases this segment and every earlier still-held one.
    pub fn release_up_to(mut self) {
        self.released = true;
        release_segment(&self.content, self.index, true);
    }
}

impl Drop for StreamData {
    fn drop(&mut self) {
        if !self.released {
            release_segment(&self.content, self.index, false);
        }
    }
}

/// First octet of the body: one past the last header-side section.
pub(crate) fn body_start(state: &super::content::ContentState) -> ChainPos {
    let sections = [
        &state.sections.router_annotations,
        &state.sections.header,
        &state.sections.delivery_annotations,
        &state.sections.message_annotations,
        &state.sections.properties,
        &state.sections.application_properties,
    ];
    let mut start = ChainPos::new(state.chain.head_ordinal(), 0);
    for section in sections {
        if section.is_present() {
            let mut reader = state.chain.reader_at(section.pos);
            if reader.skip(section.total_length()).is_ok() {
                start = start.max(reader.pos());
            }
        }
    }
    start
}

/// Gets the next body-data or footer segment from a streaming message.
pub(crate) fn next_stream_data(content: &Arc<MessageContent>) -> StreamDataResult {
    // Classical access is invalid once cut-through is enabled.
    if content.is_cut_through() {
        return StreamDataResult::Invalid;
    }
    if content.aborted() {
        return StreamDataResult::Aborted;
    }

    let rc = content.receive_complete();
    let mut state = content.lock();

    match parse_forward(&mut state, Depth::ApplicationProperties, rc) {
        DepthStatus::Invalid => return StreamDataResult::Invalid,
        DepthStatus::Incomplete | DepthStatus::Ok => {}
    }
    // The header-section set is final only once a body section has been seen
    // or the message ended.
    if state.parse_depth < Depth::Body && state.parse_depth != Depth::All {
        return StreamDataResult::Incomplete;
    }

    if state.stream.next_pos.is_none() {
        state.stream.next_pos = Some(body_start(&state));
    }
    let pos = state.stream.next_pos.unwrap();

    let reader = state.chain.reader_at(pos);
    if !reader.can_read() {
        return if rc {
            StreamDataResult::NoMore
        } else {
            StreamDataResult::Incomplete
        };
    }

    let mut probe = reader.clone();
    let scanned = match scan_field(&mut probe) {
        Ok(s) => s,
        Err(_) => {
            return if rc {
                StreamDataResult::Invalid
            } else {
                StreamDataResult::Incomplete
            };
        }
    };

    let footer = match scanned.descriptor {
        Some(descriptor::DATA) | Some(descriptor::AMQP_SEQUENCE) | Some(descriptor::AMQP_VALUE) => false,
        Some(descriptor::FOOTER) => true,
        _ => return StreamDataResult::Invalid,
    };

    // The whole section payload must be resident.
    if probe.skip(scanned.length).is_err() {
        return if rc {
            StreamDataResult::Invalid
        } else {
            StreamDataResult::Incomplete
        };
    }

    let end = probe.pos();
    // Buffers wholly behind the segment free on its release; a buffer shared
    // with the next segment stays until that one releases too.
    let free_upto = match state.chain.get(end.ordinal) {
        Some(b) if end.offset >= b.len() => end.ordinal + 1,
        _ => end.ordinal,
    };
    // Buffers the segment's octets touch, the shared tail buffer included.
    let touched_end = if end.offset == 0 { end.ordinal } else { end.ordinal + 1 };
    let buffer_count = (touched_end.saturating_sub(pos.ordinal)).max(1) as usize;

    let section = FieldLocation::new(pos, scanned.length, scanned.header_length, scanned.tag);
    let index = state.stream.next_index;
    state.stream.next_index += 1;
    state.stream.outstanding.insert(index, free_upto);
    state.stream.next_pos = Some(end);

    let payload_pos = {
        let mut r = state.chain.reader_at(pos);
        // Header octets are always resident here.
        let _ = r.skip(scanned.header_length);
        r.pos()
    };

    drop(state);

    let data = StreamData {
        content: content.clone(),
        index,
        section,
        payload_pos,
        buffer_count,
        released: false,
        footer,
    };
    if footer {
        StreamDataResult::FooterOk(data)
    } else {
        StreamDataResult::BodyOk(data)
    }
}

/// Marks a segment released; `up_to` also releases every earlier one. Frees
/// the contiguous released prefix and re-evaluates Q2.
fn release_segment(content: &Arc<MessageContent>, index: u64, up_to: bool) {
    let handler = {
        let mut state = content.lock();
        let stream = &mut state.stream;

        if up_to {
            let lo = stream.frontier;
            for i in lo..=index {
                if let Some(fu) = stream.outstanding.remove(&i) {
                    stream.released.insert(i, fu);
                }
            }
        } else if let Some(fu) = stream.outstanding.remove(&index) {
            stream.released.insert(index, fu);
        }

        // Advance the frontier over the contiguous released prefix.
        let mut boundary = None;
        while let Some(fu) = stream.released.remove(&stream.frontier) {
            stream.frontier += 1;
            boundary = Some(fu);
        }

        if let Some(boundary) = boundary {
            let freed = state.chain.release_before(boundary);
            state.buffers_freed += freed as u64;
        }
        content.q2_take_unblock(&mut state)
    };
    if let Some(handler) = handler {
        handler();
    }
}
