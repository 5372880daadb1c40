//! Field locators.
//!
//! A [`FieldLocation`] names one typed AMQP field inside a buffer chain
//! without copying it: the position of the field's first header octet, the
//! length of the header, the length of the field proper, and the constructor
//! tag. Locations are recorded once by the parser and never move; the buffers
//! they reference stay pinned for the life of the content (the parser marks
//! them protected so stream-data release never frees them).
//!
//! Walking a field across buffer boundaries is the reader's job, not the
//! locator's.

use super::chain::ChainPos;

/// Cursor naming one AMQP field in a chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldLocation {
    /// Position of the first octet of the field's header.
    pub pos: ChainPos,
    /// Length of the field, not counting the header.
    pub length: usize,
    /// Length of the field's header (constructor, descriptor, size prefix).
    pub header_length: usize,
    /// Constructor tag of the field's value.
    pub tag: u8,
    /// True iff the chain has been parsed to find this field.
    pub parsed: bool,
}

impl FieldLocation {
    /// The absent location: not parsed, names nothing.
    pub const ABSENT: Self = Self {
        pos: ChainPos::new(0, 0),
        length: 0,
        header_length: 0,
        tag: 0,
        parsed: false,
    };

    pub const fn new(pos: ChainPos, length: usize, header_length: usize, tag: u8) -> Self {
        Self {
            pos,
            length,
            header_length,
            tag,
            parsed: true,
        }
    }

    /// True iff the field was found in the chain.
    pub const fn is_present(&self) -> bool {
        self.parsed
    }

    /// Position of the first octet past the header.
    pub const fn payload_pos(&self) -> ChainPos {
        ChainPos::new(self.pos.ordinal, self.pos.offset + self.header_length)
    }

    /// Total octets covered, header included.
    pub const fn total_length(&self) -> usize {
        self.header_length + self.length
    }
}

impl Default for FieldLocation {
    fn default() -> Self {
        Self::ABSENT
    }
}
