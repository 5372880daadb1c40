//! Incremental section parser.
//!
//! A single forward cursor `(parse_pos, parse_depth)` is anchored in the
//! content and advanced through complete sections as octets arrive. Parsing is
//! resumable at any octet boundary and never backtracks past `parse_depth`.
//! Sections must appear in depth order; an out-of-order or unrecognized
//! section makes the message invalid. Optional sections that are absent at
//! end-of-message are fine.

use crate::{
    buffers::{
        FieldLocation,
        reader::{AdvanceableReader, Reader},
    },
    codec::amqp::{descriptor, read_list_header, scan_field, valid_tag},
};

use super::content::ContentState;

/// Amount of message to be parsed, in section order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Depth {
    None,
    RouterAnnotations,
    Header,
    DeliveryAnnotations,
    MessageAnnotations,
    Properties,
    ApplicationProperties,
    Body,
    RawBody,
    Footer,
    All,
}

/// Result of a depth check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DepthStatus {
    /// Valid up to the requested depth; absent optional sections are valid.
    Ok,
    /// Not enough octets received yet to reach the requested depth.
    Incomplete,
    /// Corrupt or malformed message.
    Invalid,
}

/// Section locators, one per section the parser can find.
#[derive(Default)]
pub(crate) struct Sections {
    pub router_annotations: FieldLocation,
    pub header: FieldLocation,
    pub delivery_annotations: FieldLocation,
    pub message_annotations: FieldLocation,
    pub properties: FieldLocation,
    pub application_properties: FieldLocation,
    pub body: FieldLocation,
    pub raw_body: FieldLocation,
    pub footer: FieldLocation,
}

/// Fields of the Properties section, by list position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum PropertyField {
    MessageId = 0,
    UserId = 1,
    To = 2,
    Subject = 3,
    ReplyTo = 4,
    CorrelationId = 5,
    ContentType = 6,
    ContentEncoding = 7,
    AbsoluteExpiryTime = 8,
    CreationTime = 9,
    GroupId = 10,
    GroupSequence = 11,
    ReplyToGroupId = 12,
}

pub(crate) const PROPERTY_FIELD_COUNT: usize = 13;

/// Locators for the Properties-section fields.
#[derive(Default)]
pub(crate) struct PropertyFields {
    pub fields: [FieldLocation; PROPERTY_FIELD_COUNT],
}

impl PropertyFields {
    pub(crate) fn get(&self, field: PropertyField) -> &FieldLocation {
        &self.fields[field as usize]
    }
}

fn section_depth(code: u64) -> Option<Depth> {
    Some(match code {
        descriptor::ROUTER_ANNOTATIONS => Depth::RouterAnnotations,
        descriptor::HEADER => Depth::Header,
        descriptor::DELIVERY_ANNOTATIONS => Depth::DeliveryAnnotations,
        descriptor::MESSAGE_ANNOTATIONS => Depth::MessageAnnotations,
        descriptor::PROPERTIES => Depth::Properties,
        descriptor::APPLICATION_PROPERTIES => Depth::ApplicationProperties,
        descriptor::DATA | descriptor::AMQP_SEQUENCE | descriptor::AMQP_VALUE => Depth::Body,
        descriptor::FOOTER => Depth::Footer,
        _ => return None,
    })
}

/// Advances the parse cursor through as many complete sections as the chain
/// currently supports, up to `target`.
pub(crate) fn parse_forward(state: &mut ContentState, target: Depth, receive_complete: bool) -> DepthStatus {
    loop {
        if state.parse_depth >= target {
            return DepthStatus::Ok;
        }

        let reader = state.chain.reader_at(state.parse_pos);
        if !reader.can_read() {
            if receive_complete {
                // Remaining optional sections are absent.
                state.parse_depth = Depth::All;
                continue;
            }
            return DepthStatus::Incomplete;
        }

        let mut probe = reader.clone();
        let scanned = match scan_field(&mut probe) {
            Ok(s) => s,
            Err(_) => {
                return if receive_complete {
                    DepthStatus::Invalid
                } else {
                    DepthStatus::Incomplete
                };
            }
        };
        if !valid_tag(scanned.tag) {
            return DepthStatus::Invalid;
        }

        let Some(code) = scanned.descriptor else {
            // Octets without a described section header: raw body, legal only
            // once the property sections are behind us.
            if state.parse_depth < Depth::Properties || state.sections.body.is_present() {
                return DepthStatus::Invalid;
            }
            if !state.sections.raw_body.is_present() {
                state.sections.raw_body = FieldLocation::new(state.parse_pos, 0, 0, scanned.tag);
            }
            state.parse_pos = state.chain.end_pos();
            state.parse_depth = if receive_complete { Depth::All } else { Depth::RawBody };
            continue;
        };

        let Some(depth) = section_depth(code) else {
            return DepthStatus::Invalid;
        };

        // Sections appear in listed order; body-data sections may repeat.
        let repeat_body = depth == Depth::Body && state.parse_depth == Depth::Body;
        if depth <= state.parse_depth && !repeat_body {
            return DepthStatus::Invalid;
        }

        // The section is only counted once the whole payload is in the chain.
        if probe.skip(scanned.length).is_err() {
            return if receive_complete {
                DepthStatus::Invalid
            } else {
                DepthStatus::Incomplete
            };
        }
        let end_pos = probe.pos();

        let loc = FieldLocation::new(
            state.parse_pos,
            scanned.length,
            scanned.header_length,
            scanned.tag,
        );
        match depth {
            Depth::RouterAnnotations => state.sections.router_annotations = loc,
            Depth::Header => state.sections.header = loc,
            Depth::DeliveryAnnotations => state.sections.delivery_annotations = loc,
            Depth::MessageAnnotations => state.sections.message_annotations = loc,
            Depth::Properties => {
                state.sections.properties = loc;
                locate_property_fields(state, &loc);
            }
            Depth::ApplicationProperties => state.sections.application_properties = loc,
            Depth::Body => {
                if !state.sections.body.is_present() {
                    state.sections.body = loc;
                }
            }
            Depth::Footer => state.sections.footer = loc,
            _ => {}
        }

        // Buffers holding header sections are pinned for the life of the
        // content: locators reference them after body buffers are released.
        if depth <= Depth::ApplicationProperties {
            let protect = if end_pos.offset == 0 {
                end_pos.ordinal
            } else {
                end_pos.ordinal + 1
            };
            state.chain.set_protect_below(protect);
        }

        state.parse_pos = end_pos;
        state.parse_depth = depth;
    }
}

/// Records locators for the Properties-section fields. The section payload is
/// fully resident at this point; a walk failure leaves later fields absent.
fn locate_property_fields(state: &mut ContentState, section: &FieldLocation) {
    use crate::buffers::reader::AdvanceableReader;

    let mut reader = state.chain.reader_at(section.pos);
    let Some(count) = read_list_header_at(&mut reader) else {
        return;
    };

    for slot in 0..count.min(PROPERTY_FIELD_COUNT) {
        let pos = reader.pos();
        let Ok(scanned) = scan_field(&mut reader) else {
            return;
        };
        if reader.skip(scanned.length).is_err() {
            return;
        }
        if scanned.tag != crate::codec::amqp::tag::NULL {
            state.fields.fields[slot] =
                FieldLocation::new(pos, scanned.length, scanned.header_length, scanned.tag);
        }
    }
}

/// Positions the reader past a described-section header and its list
/// constructor, returning the element count.
fn read_list_header_at(reader: &mut crate::buffers::chain::ChainReader<'_>) -> Option<usize> {
    use crate::buffers::reader::AdvanceableReader;
    let t = reader.read_u8().ok()?;
    if t != crate::codec::amqp::tag::DESCRIBED {
        return None;
    }
    match reader.read_u8().ok()? {
        crate::codec::amqp::tag::SMALLULONG => reader.skip(1).ok()?,
        crate::codec::amqp::tag::ULONG => reader.skip(8).ok()?,
        _ => return None,
    }
    read_list_header(reader).ok()
}

/// Parses the AMQP priority out of the HEADER section. Returns the default
/// priority when the section or field is absent.
pub(crate) fn parse_priority(state: &ContentState) -> u8 {
    const DEFAULT_PRIORITY: u8 = 4;

    let header = &state.sections.header;
    if !header.is_present() {
        return DEFAULT_PRIORITY;
    }

    let mut reader = state.chain.reader_at(header.pos);
    let Some(count) = read_list_header_at(&mut reader) else {
        return DEFAULT_PRIORITY;
    };
    if count < 2 {
        return DEFAULT_PRIORITY;
    }

    // durable, then priority.
    use crate::buffers::reader::AdvanceableReader;
    let Ok(durable) = scan_field(&mut reader) else {
        return DEFAULT_PRIORITY;
    };
    if reader.skip(durable.length).is_err() {
        return DEFAULT_PRIORITY;
    }
    match reader.read_u8() {
        Ok(t) if t == crate::codec::amqp::tag::UBYTE => reader.read_u8().unwrap_or(DEFAULT_PRIORITY),
        _ => DEFAULT_PRIORITY,
    }
}
