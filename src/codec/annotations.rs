//! Router-annotations section codec.
//!
//! Inter-router messages carry a custom leading section with descriptor
//! `0x534B5052:0x2D2D5241` and the field list
//! `{flags: uint32, to-override: str32?, ingress-router: str8?, trace: list,
//! ingress-mesh: str8?}`. The section MUST be first, MUST be absent on
//! non-router ingress, and is stripped on non-router egress. The section
//! version is advertised in the connection open properties; peers use the
//! numerical minimum of the two advertised values.

use thiserror::Error;

use super::{
    AmqpCodec, RCodec,
    amqp::{descriptor, read_list_header, read_opt_string, read_string_list, read_uint, tag},
};
use crate::buffers::reader::Reader;

/// Connection-open property key advertising the annotations version.
pub const ANNOTATIONS_VERSION_KEY: &str = "qd.annotations-version";

/// Current annotations version.
pub const ANNOTATIONS_VERSION: i32 = 2;

/// Flag bits carried in the annotations `flags` field. Bits not listed here
/// are reserved and pass through unchanged.
pub mod ra_flags {
    /// The message is classified as streaming.
    pub const STREAMING: u32 = 0x01;
    /// Re-route the message if the delivery comes back Released.
    pub const RESEND_RELEASED: u32 = 0x02;
}

/// Errors raised while parsing a router-annotations section.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AnnotationsError {
    /// The section is present but its octets do not decode.
    #[error("malformed router-annotations section")]
    Malformed,

    /// A router-annotations section arrived over a non-router link.
    #[error("router-annotations section not permitted on this ingress")]
    NotPermitted,
}

/// Decoded router-annotations fields.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RouterAnnotations {
    pub flags: u32,
    pub to_override: Option<String>,
    pub ingress_router: Option<String>,
    pub trace: Vec<String>,
    pub ingress_mesh: Option<String>,
}

impl RouterAnnotations {
    pub fn is_streaming(&self) -> bool {
        self.flags & ra_flags::STREAMING != 0
    }

    pub fn is_resend_released(&self) -> bool {
        self.flags & ra_flags::RESEND_RELEASED != 0
    }

    /// Encodes the complete section, descriptor included.
    ///
    /// Edge routers send null for `ingress-router` and an empty trace list;
    /// that is simply the encoding of the corresponding field values here.
    pub fn encode(&self) -> Vec<u8> {
        let mut body = Vec::with_capacity(64);

        // flags: always fixed-width uint so the field list size is stable.
        body.push(tag::UINT);
        body.extend_from_slice(&self.flags.to_be_bytes());

        // to-override: str32 or null
        match &self.to_override {
            Some(s) => {
                body.push(tag::STR32);
                body.extend_from_slice(&(s.len() as u32).to_be_bytes());
                body.extend_from_slice(s.as_bytes());
            }
            None => body.push(tag::NULL),
        }

        // ingress-router: str8 or null
        match &self.ingress_router {
            Some(s) => {
                body.extend_from_slice(&[tag::STR8, s.len() as u8]);
                body.extend_from_slice(s.as_bytes());
            }
            None => body.push(tag::NULL),
        }

        // trace: list32 of str8
        body.push(tag::LIST32);
        let size_at = body.len();
        body.extend_from_slice(&[0; 8]);
        for hop in &self.trace {
            body.extend_from_slice(&[tag::STR8, hop.len() as u8]);
            body.extend_from_slice(hop.as_bytes());
        }
        let size = (body.len() - size_at - 4) as u32;
        body[size_at..size_at + 4].copy_from_slice(&size.to_be_bytes());
        body[size_at + 4..size_at + 8].copy_from_slice(&(self.trace.len() as u32).to_be_bytes());

        // ingress-mesh: str8 or null
        match &self.ingress_mesh {
            Some(s) => {
                body.extend_from_slice(&[tag::STR8, s.len() as u8]);
                body.extend_from_slice(s.as_bytes());
            }
            None => body.push(tag::NULL),
        }

        // Wrap in described list32.
        let mut out = Vec::with_capacity(body.len() + 22);
        out.push(tag::DESCRIBED);
        out.push(tag::ULONG);
        out.extend_from_slice(&descriptor::ROUTER_ANNOTATIONS.to_be_bytes());
        out.push(tag::LIST32);
        out.extend_from_slice(&((body.len() + 4) as u32).to_be_bytes());
        out.extend_from_slice(&5u32.to_be_bytes());
        out.extend_from_slice(&body);
        out
    }

    /// Decodes a full section; the reader is positioned at the section's
    /// first octet (the `0x00`).
    pub fn decode<R: Reader>(reader: &mut R) -> Result<Self, AnnotationsError> {
        let codec = AmqpCodec::new();
        if reader.read_u8().map_err(|_| AnnotationsError::Malformed)? != tag::DESCRIBED {
            return Err(AnnotationsError::Malformed);
        }
        let code = match reader.read_u8().map_err(|_| AnnotationsError::Malformed)? {
            tag::SMALLULONG => {
                let c: u8 = codec.read(&mut *reader).map_err(|_| AnnotationsError::Malformed)?;
                c as u64
            }
            tag::ULONG => codec.read(&mut *reader).map_err(|_| AnnotationsError::Malformed)?,
            _ => return Err(AnnotationsError::Malformed),
        };
        if code != descriptor::ROUTER_ANNOTATIONS {
            return Err(AnnotationsError::Malformed);
        }
        Self::decode_field_list(reader)
    }

    /// Decodes the field list only; the reader is positioned at the list
    /// constructor.
    pub(crate) fn decode_field_list<R: Reader>(reader: &mut R) -> Result<Self, AnnotationsError> {
        let count = read_list_header(&mut *reader).map_err(|_| AnnotationsError::Malformed)?;
        let mut ra = RouterAnnotations::default();

        if count >= 1 {
            ra.flags = read_uint(&mut *reader).map_err(|_| AnnotationsError::Malformed)? as u32;
        }
        if count >= 2 {
            ra.to_override = read_opt_string(&mut *reader).map_err(|_| AnnotationsError::Malformed)?;
        }
        if count >= 3 {
            ra.ingress_router = read_opt_string(&mut *reader).map_err(|_| AnnotationsError::Malformed)?;
        }
        if count >= 4 {
            ra.trace = read_string_list(&mut *reader).map_err(|_| AnnotationsError::Malformed)?;
        }
        if count >= 5 {
            ra.ingress_mesh = read_opt_string(&mut *reader).map_err(|_| AnnotationsError::Malformed)?;
        }
        Ok(ra)
    }
}

/// The session's effective annotations version: the numerical minimum of the
/// local and peer advertisements.
pub fn negotiated_version(peer: i32) -> i32 {
    ANNOTATIONS_VERSION.min(peer)
}
