//! AMQP 1.0 type-system primitives.
//!
//! Constructor tags, field scanning and the small set of value readers the
//! pipeline needs. A *field* is one constructor-tagged value, possibly
//! described. Scanning measures a field (header length, payload length, tag,
//! descriptor) while consuming only its header octets, so the parser can
//! resume at any octet boundary: an exhausted reader mid-header simply means
//! the field is not complete yet.

use super::{AmqpCodec, RCodec};
use crate::buffers::reader::{DidntRead, Reader};

/// Constructor tags used by the pipeline.
pub(crate) mod tag {
    pub(crate) const DESCRIBED: u8 = 0x00;
    pub(crate) const NULL: u8 = 0x40;
    pub(crate) const TRUE: u8 = 0x41;
    pub(crate) const FALSE: u8 = 0x42;
    pub(crate) const UINT0: u8 = 0x43;
    pub(crate) const ULONG0: u8 = 0x44;
    pub(crate) const LIST0: u8 = 0x45;
    pub(crate) const UBYTE: u8 = 0x50;
    pub(crate) const SMALLUINT: u8 = 0x52;
    pub(crate) const SMALLULONG: u8 = 0x53;
    pub(crate) const BOOLEAN: u8 = 0x56;
    pub(crate) const UINT: u8 = 0x70;
    pub(crate) const ULONG: u8 = 0x80;
    pub(crate) const BIN8: u8 = 0xA0;
    pub(crate) const STR8: u8 = 0xA1;
    pub(crate) const SYM8: u8 = 0xA3;
    pub(crate) const BIN32: u8 = 0xB0;
    pub(crate) const STR32: u8 = 0xB1;
    pub(crate) const SYM32: u8 = 0xB3;
    pub(crate) const LIST8: u8 = 0xC0;
    pub(crate) const MAP8: u8 = 0xC1;
    pub(crate) const LIST32: u8 = 0xD0;
    pub(crate) const MAP32: u8 = 0xD1;
}

/// Section descriptor codes (`amqp:...:list|map` numeric descriptors).
pub(crate) mod descriptor {
    pub(crate) const HEADER: u64 = 0x70;
    pub(crate) const DELIVERY_ANNOTATIONS: u64 = 0x71;
    pub(crate) const MESSAGE_ANNOTATIONS: u64 = 0x72;
    pub(crate) const PROPERTIES: u64 = 0x73;
    pub(crate) const APPLICATION_PROPERTIES: u64 = 0x74;
    pub(crate) const DATA: u64 = 0x75;
    pub(crate) const AMQP_SEQUENCE: u64 = 0x76;
    pub(crate) const AMQP_VALUE: u64 = 0x77;
    pub(crate) const FOOTER: u64 = 0x78;

    /// Router-annotations custom composite: domain `SKPR`, code `--RA`.
    pub(crate) const ROUTER_ANNOTATIONS: u64 = 0x534B_5052_2D2D_5241;
}

/// One measured field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ScannedField {
    /// Constructor tag of the field's value.
    pub(crate) tag: u8,
    /// Octets before the payload: constructor, descriptor, size prefix.
    pub(crate) header_length: usize,
    /// Payload octets (the value of the size prefix, or the fixed width).
    pub(crate) length: usize,
    /// Numeric descriptor code when the field is described.
    pub(crate) descriptor: Option<u64>,
}

impl ScannedField {
    pub(crate) const fn total_length(&self) -> usize {
        self.header_length + self.length
    }
}

/// Measures the field at the reader's position, consuming its header octets
/// only. The caller skips `length` octets to move past the field.
///
/// # Errors
///
/// `DidntRead` when the reader runs dry mid-header: the field is incomplete
/// at this point in time. Malformed constructors surface as [`scan_field`]
/// succeeding with a zero-width unknown category, which callers reject via
/// [`valid_tag`].
pub(crate) fn scan_field<R: Reader>(reader: &mut R) -> Result<ScannedField, DidntRead> {
    let codec = AmqpCodec::new();
    let tag = reader.read_u8()?;

    if tag == tag::DESCRIBED {
        // Descriptor field, then the value field it describes.
        let descriptor_tag = reader.read_u8()?;
        let (code, descriptor_len) = match descriptor_tag {
            tag::SMALLULONG => {
                let code: u8 = codec.read(&mut *reader)?;
                (code as u64, 2)
            }
            tag::ULONG => {
                let code: u64 = codec.read(&mut *reader)?;
                (code, 9)
            }
            tag::ULONG0 => (0, 1),
            // Symbolic descriptors are legal AMQP but nothing in the router
            // emits them; measure and ignore.
            tag::SYM8 => {
                let len: u8 = codec.read(&mut *reader)?;
                reader.skip_n(len as usize)?;
                (u64::MAX, 2 + len as usize)
            }
            tag::SYM32 => {
                let len: u32 = codec.read(&mut *reader)?;
                reader.skip_n(len as usize)?;
                (u64::MAX, 5 + len as usize)
            }
            _ => return Ok(ScannedField {
                tag,
                header_length: 2,
                length: 0,
                descriptor: None,
            }),
        };

        let value = scan_field(reader)?;
        return Ok(ScannedField {
            tag: value.tag,
            header_length: 1 + descriptor_len + value.header_length,
            length: value.length,
            descriptor: Some(code),
        });
    }

    // Width category is the constructor's high nibble.
    let (header_length, length) = match tag >> 4 {
        0x4 => (1, 0),
        0x5 => (1, 1),
        0x6 => (1, 2),
        0x7 => (1, 4),
        0x8 => (1, 8),
        0x9 => (1, 16),
        0xA | 0xC | 0xE => {
            let size: u8 = codec.read(&mut *reader)?;
            (2, size as usize)
        }
        0xB | 0xD | 0xF => {
            let size: u32 = codec.read(&mut *reader)?;
            (5, size as usize)
        }
        _ => (1, 0),
    };

    Ok(ScannedField {
        tag,
        header_length,
        length,
        descriptor: None,
    })
}

/// True iff `tag` belongs to a known constructor category.
pub(crate) fn valid_tag(tag: u8) -> bool {
    matches!(tag >> 4, 0x4..=0xF)
}

// Small extension so scanning can skip over descriptor payloads on plain
// readers that do not implement AdvanceableReader efficiently.
trait SkipExt: Reader {
    fn skip_n(&mut self, n: usize) -> Result<(), DidntRead>;
}

impl<R: Reader> SkipExt for R {
    fn skip_n(&mut self, mut n: usize) -> Result<(), DidntRead> {
        let mut scratch = [0u8; 32];
        while n > 0 {
            let take = n.min(scratch.len());
            self.read_exact(&mut scratch[..take])?;
            n -= take;
        }
        Ok(())
    }
}

// --- Value readers

/// Reads an unsigned integer value whose constructor may be any of the uint /
/// ulong encodings.
pub(crate) fn read_uint<R: Reader>(reader: &mut R) -> Result<u64, DidntRead> {
    let codec = AmqpCodec::new();
    let t = reader.read_u8()?;
    match t {
        tag::UINT0 | tag::ULONG0 => Ok(0),
        tag::UBYTE | tag::SMALLUINT | tag::SMALLULONG => {
            let v: u8 = codec.read(reader)?;
            Ok(v as u64)
        }
        tag::UINT => {
            let v: u32 = codec.read(reader)?;
            Ok(v as u64)
        }
        tag::ULONG => codec.read(reader),
        _ => Err(DidntRead),
    }
}

/// Reads a string or symbol value; `None` for null.
pub(crate) fn read_opt_string<R: Reader>(reader: &mut R) -> Result<Option<String>, DidntRead> {
    let codec = AmqpCodec::new();
    let t = reader.read_u8()?;
    let len = match t {
        tag::NULL => return Ok(None),
        tag::STR8 | tag::SYM8 => {
            let v: u8 = codec.read(&mut *reader)?;
            v as usize
        }
        tag::STR32 | tag::SYM32 => {
            let v: u32 = codec.read(&mut *reader)?;
            v as usize
        }
        _ => return Err(DidntRead),
    };
    let mut bytes = vec![0u8; len];
    reader.read_exact(&mut bytes)?;
    String::from_utf8(bytes).map(Some).map_err(|_| DidntRead)
}

/// Reads a list of strings. Null decodes as the empty list.
pub(crate) fn read_string_list<R: Reader>(reader: &mut R) -> Result<Vec<String>, DidntRead> {
    let codec = AmqpCodec::new();
    let t = reader.read_u8()?;
    let count = match t {
        tag::NULL | tag::LIST0 => return Ok(Vec::new()),
        tag::LIST8 => {
            let _size: u8 = codec.read(&mut *reader)?;
            let count: u8 = codec.read(&mut *reader)?;
            count as usize
        }
        tag::LIST32 => {
            let _size: u32 = codec.read(&mut *reader)?;
            let count: u32 = codec.read(&mut *reader)?;
            count as usize
        }
        _ => return Err(DidntRead),
    };

    let mut items = Vec::with_capacity(count);
    for _ in 0..count {
        items.push(read_opt_string(reader)?.ok_or(DidntRead)?);
    }
    Ok(items)
}

/// Reads a list header, returning the element count and leaving the reader at
/// the first element.
pub(crate) fn read_list_header<R: Reader>(reader: &mut R) -> Result<usize, DidntRead> {
    let codec = AmqpCodec::new();
    let t = reader.read_u8()?;
    match t {
        tag::NULL | tag::LIST0 => Ok(0),
        tag::LIST8 => {
            let _size: u8 = codec.read(&mut *reader)?;
            let count: u8 = codec.read(&mut *reader)?;
            Ok(count as usize)
        }
        tag::LIST32 => {
            let _size: u32 = codec.read(&mut *reader)?;
            let count: u32 = codec.read(&mut *reader)?;
            Ok(count as usize)
        }
        _ => Err(DidntRead),
    }
}
