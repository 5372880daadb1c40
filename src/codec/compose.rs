//! Composed-field builder.
//!
//! Locally generated message sections (request headers mapped from HTTP/2,
//! management response rows, dispositions) are built with a [`Composer`]: a
//! forward-only writer with nested list/map frames whose size and count
//! octets are patched when the frame is closed. A finished composer converts
//! into a pooled buffer chain ready to splice into a message.

use crate::buffers::{BufferChain, writer::Writer};

use super::amqp::tag;

/// Message sections the composer can open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Performative {
    Header,
    DeliveryAnnotations,
    MessageAnnotations,
    Properties,
    ApplicationProperties,
    BodyData,
    AmqpValue,
    Footer,
}

impl Performative {
    const fn code(self) -> u8 {
        match self {
            Performative::Header => 0x70,
            Performative::DeliveryAnnotations => 0x71,
            Performative::MessageAnnotations => 0x72,
            Performative::Properties => 0x73,
            Performative::ApplicationProperties => 0x74,
            Performative::BodyData => 0x75,
            Performative::AmqpValue => 0x77,
            Performative::Footer => 0x78,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum CompositeKind {
    List,
    Map,
}

struct Composite {
    kind: CompositeKind,
    /// Index of the 4-octet size field in `buf`.
    size_at: usize,
    count: u32,
}

/// Forward-only builder of AMQP sections.
pub struct Composer {
    buf: Vec<u8>,
    open: Vec<Composite>,
}

impl Composer {
    /// Starts a composer with one section descriptor already written.
    pub fn new(performative: Performative) -> Self {
        let mut c = Self {
            buf: Vec::with_capacity(128),
            open: Vec::new(),
        };
        c.start_section(performative);
        c
    }

    /// Appends another section descriptor. Any open frames must be closed.
    pub fn start_section(&mut self, performative: Performative) -> &mut Self {
        debug_assert!(self.open.is_empty());
        self.buf
            .extend_from_slice(&[tag::DESCRIBED, tag::SMALLULONG, performative.code()]);
        self
    }

    fn bump_count(&mut self) {
        if let Some(top) = self.open.last_mut() {
            top.count += 1;
        }
    }

    /// Opens a list frame. Closed by [`end_list`](Self::end_list).
    pub fn start_list(&mut self) -> &mut Self {
        self.bump_count();
        self.buf.push(tag::LIST32);
        let size_at = self.buf.len();
        self.buf.extend_from_slice(&[0; 8]); // size + count placeholders
        self.open.push(Composite {
            kind: CompositeKind::List,
            size_at,
            count: 0,
        });
        self
    }

    pub fn end_list(&mut self) -> &mut Self {
        self.end_composite(CompositeKind::List)
    }

    /// Opens a map frame. Each inserted key and value counts separately.
    pub fn start_map(&mut self) -> &mut Self {
        self.bump_count();
        self.buf.push(tag::MAP32);
        let size_at = self.buf.len();
        self.buf.extend_from_slice(&[0; 8]);
        self.open.push(Composite {
            kind: CompositeKind::Map,
            size_at,
            count: 0,
        });
        self
    }

    pub fn end_map(&mut self) -> &mut Self {
        self.end_composite(CompositeKind::Map)
    }

    fn end_composite(&mut self, kind: CompositeKind) -> &mut Self {
        let frame = self.open.pop().expect("no open composite");
        debug_assert!(matches!(
            (frame.kind, kind),
            (CompositeKind::List, CompositeKind::List) | (CompositeKind::Map, CompositeKind::Map)
        ));
        // Size covers everything after the size field, count included.
        let size = (self.buf.len() - frame.size_at - 4) as u32;
        self.buf[frame.size_at..frame.size_at + 4].copy_from_slice(&size.to_be_bytes());
        self.buf[frame.size_at + 4..frame.size_at + 8].copy_from_slice(&frame.count.to_be_bytes());
        self
    }

    pub fn insert_null(&mut self) -> &mut Self {
        self.bump_count();
        self.buf.push(tag::NULL);
        self
    }

    pub fn insert_bool(&mut self, v: bool) -> &mut Self {
        self.bump_count();
        self.buf.push(if v { tag::TRUE } else { tag::FALSE });
        self
    }

    pub fn insert_ubyte(&mut self, v: u8) -> &mut Self {
        self.bump_count();
        self.buf.extend_from_slice(&[tag::UBYTE, v]);
        self
    }

    pub fn insert_uint(&mut self, v: u32) -> &mut Self {
        self.bump_count();
        match v {
            0 => self.buf.push(tag::UINT0),
            1..=255 => self.buf.extend_from_slice(&[tag::SMALLUINT, v as u8]),
            _ => {
                self.buf.push(tag::UINT);
                self.buf.extend_from_slice(&v.to_be_bytes());
            }
        }
        self
    }

    pub fn insert_ulong(&mut self, v: u64) -> &mut Self {
        self.bump_count();
        match v {
            0 => self.buf.push(tag::ULONG0),
            1..=255 => self.buf.extend_from_slice(&[tag::SMALLULONG, v as u8]),
            _ => {
                self.buf.push(tag::ULONG);
                self.buf.extend_from_slice(&v.to_be_bytes());
            }
        }
        self
    }

    pub fn insert_int(&mut self, v: i32) -> &mut Self {
        self.bump_count();
        if (-128..=127).contains(&v) {
            self.buf.extend_from_slice(&[0x54, v as i8 as u8]);
        } else {
            self.buf.push(0x71);
            self.buf.extend_from_slice(&v.to_be_bytes());
        }
        self
    }

    fn insert_variable(&mut self, tag8: u8, tag32: u8, bytes: &[u8]) {
        self.bump_count();
        if bytes.len() <= u8::MAX as usize {
            self.buf.extend_from_slice(&[tag8, bytes.len() as u8]);
        } else {
            self.buf.push(tag32);
            self.buf.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
        }
        self.buf.extend_from_slice(bytes);
    }

    pub fn insert_string(&mut self, v: &str) -> &mut Self {
        self.insert_variable(tag::STR8, tag::STR32, v.as_bytes());
        self
    }

    pub fn insert_symbol(&mut self, v: &str) -> &mut Self {
        self.insert_variable(tag::SYM8, tag::SYM32, v.as_bytes());
        self
    }

    pub fn insert_binary(&mut self, v: &[u8]) -> &mut Self {
        self.insert_variable(tag::BIN8, tag::BIN32, v);
        self
    }

    /// The composed octets. All frames must be closed.
    pub fn bytes(&self) -> &[u8] {
        debug_assert!(self.open.is_empty());
        &self.buf
    }

    /// Converts into a pooled buffer chain.
    pub fn into_chain(self) -> BufferChain {
        debug_assert!(self.open.is_empty());
        let mut chain = BufferChain::new();
        chain.writer().write_exact(&self.buf).expect("chain write");
        chain
    }
}

/// Octets of a body-data section header for a payload of `len` octets.
/// The payload itself follows as raw chain buffers.
pub fn data_section_bytes(len: usize) -> Vec<u8> {
    let mut hdr = vec![tag::DESCRIBED, tag::SMALLULONG, Performative::BodyData.code()];
    if len <= u8::MAX as usize {
        hdr.extend_from_slice(&[tag::BIN8, len as u8]);
    } else {
        hdr.push(tag::BIN32);
        hdr.extend_from_slice(&(len as u32).to_be_bytes());
    }
    hdr
}
