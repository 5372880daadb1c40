//! HTTP/2 frame codec (RFC 7540 §4).
//!
//! Frames are length-prefixed: a 9-octet header carrying a 24-bit payload
//! length, a type, flags and a 31-bit stream identifier. This module encodes
//! and decodes the frame types the adaptor speaks; unknown types are skipped
//! by the connection per the RFC.

/// Client connection preface.
pub const PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

pub const FRAME_HEADER_LEN: usize = 9;

pub mod frame_type {
    pub const DATA: u8 = 0x0;
    pub const HEADERS: u8 = 0x1;
    pub const PRIORITY: u8 = 0x2;
    pub const RST_STREAM: u8 = 0x3;
    pub const SETTINGS: u8 = 0x4;
    pub const PUSH_PROMISE: u8 = 0x5;
    pub const PING: u8 = 0x6;
    pub const GOAWAY: u8 = 0x7;
    pub const WINDOW_UPDATE: u8 = 0x8;
    pub const CONTINUATION: u8 = 0x9;
}

pub mod flags {
    pub const END_STREAM: u8 = 0x1;
    pub const ACK: u8 = 0x1;
    pub const END_HEADERS: u8 = 0x4;
    pub const PADDED: u8 = 0x8;
    pub const PRIORITY: u8 = 0x20;
}

pub mod error_code {
    pub const NO_ERROR: u32 = 0x0;
    pub const PROTOCOL_ERROR: u32 = 0x1;
    pub const INTERNAL_ERROR: u32 = 0x2;
    pub const FLOW_CONTROL_ERROR: u32 = 0x3;
    pub const STREAM_CLOSED: u32 = 0x5;
    pub const FRAME_SIZE_ERROR: u32 = 0x6;
    pub const REFUSED_STREAM: u32 = 0x7;
    pub const CANCEL: u32 = 0x8;
    pub const COMPRESSION_ERROR: u32 = 0x9;

    /// Canonical reason strings sent in GOAWAY debug data.
    pub fn strerror(code: u32) -> &'static str {
        match code {
            NO_ERROR => "no error",
            PROTOCOL_ERROR => "protocol error",
            INTERNAL_ERROR => "internal error",
            FLOW_CONTROL_ERROR => "flow control error",
            STREAM_CLOSED => "stream closed",
            FRAME_SIZE_ERROR => "frame size error",
            REFUSED_STREAM => "refused stream",
            CANCEL => "cancel",
            COMPRESSION_ERROR => "compression error",
            _ => "unknown error",
        }
    }
}

/// The 9-octet frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub length: u32,
    pub kind: u8,
    pub flags: u8,
    pub stream_id: u32,
}

impl FrameHeader {
    pub fn decode(octets: &[u8; FRAME_HEADER_LEN]) -> Self {
        Self {
            length: u32::from_be_bytes([0, octets[0], octets[1], octets[2]]),
            kind: octets[3],
            flags: octets[4],
            stream_id: u32::from_be_bytes([octets[5], octets[6], octets[7], octets[8]]) & 0x7FFF_FFFF,
        }
    }

    pub fn encode(&self, out: &mut Vec<u8>) {
        let len = self.length.to_be_bytes();
        out.extend_from_slice(&[len[1], len[2], len[3], self.kind, self.flags]);
        out.extend_from_slice(&(self.stream_id & 0x7FFF_FFFF).to_be_bytes());
    }

    pub fn has(&self, flag: u8) -> bool {
        self.flags & flag != 0
    }
}

pub mod settings_id {
    pub const HEADER_TABLE_SIZE: u16 = 0x1;
    pub const ENABLE_PUSH: u16 = 0x2;
    pub const MAX_CONCURRENT_STREAMS: u16 = 0x3;
    pub const INITIAL_WINDOW_SIZE: u16 = 0x4;
    pub const MAX_FRAME_SIZE: u16 = 0x5;
    pub const MAX_HEADER_LIST_SIZE: u16 = 0x6;
}

/// A SETTINGS parameter set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Settings {
    pub header_table_size: u32,
    pub enable_push: u32,
    pub max_concurrent_streams: u32,
    pub initial_window_size: u32,
    pub max_frame_size: u32,
}

impl Default for Settings {
    fn default() -> Self {
        // RFC 7540 §6.5.2 defaults.
        Self {
            header_table_size: 4096,
            enable_push: 1,
            max_concurrent_streams: u32::MAX,
            initial_window_size: 65_535,
            max_frame_size: 16_384,
        }
    }
}

impl Settings {
    /// The parameter set the router advertises on every connection.
    pub fn router_initial() -> Self {
        Self {
            header_table_size: 4096,
            enable_push: 0,
            max_concurrent_streams: 100,
            initial_window_size: 65_536,
            max_frame_size: 16_384,
        }
    }

    pub fn apply(&mut self, id: u16, value: u32) {
        match id {
            settings_id::HEADER_TABLE_SIZE => self.header_table_size = value,
            settings_id::ENABLE_PUSH => self.enable_push = value,
            settings_id::MAX_CONCURRENT_STREAMS => self.max_concurrent_streams = value,
            settings_id::INITIAL_WINDOW_SIZE => self.initial_window_size = value,
            settings_id::MAX_FRAME_SIZE => self.max_frame_size = value,
            _ => {}
        }
    }

    fn entries(&self) -> [(u16, u32); 5] {
        [
            (settings_id::HEADER_TABLE_SIZE, self.header_table_size),
            (settings_id::ENABLE_PUSH, self.enable_push),
            (settings_id::MAX_CONCURRENT_STREAMS, self.max_concurrent_streams),
            (settings_id::INITIAL_WINDOW_SIZE, self.initial_window_size),
            (settings_id::MAX_FRAME_SIZE, self.max_frame_size),
        ]
    }
}

// --- Whole-frame writers

pub fn write_settings(out: &mut Vec<u8>, settings: &Settings) {
    let entries = settings.entries();
    FrameHeader {
        length: (entries.len() * 6) as u32,
        kind: frame_type::SETTINGS,
        flags: 0,
        stream_id: 0,
    }
    .encode(out);
    for (id, value) in entries {
        out.extend_from_slice(&id.to_be_bytes());
        out.extend_from_slice(&value.to_be_bytes());
    }
}

pub fn write_settings_ack(out: &mut Vec<u8>) {
    FrameHeader {
        length: 0,
        kind: frame_type::SETTINGS,
        flags: flags::ACK,
        stream_id: 0,
    }
    .encode(out);
}

pub fn write_ping_ack(out: &mut Vec<u8>, opaque: &[u8; 8]) {
    FrameHeader {
        length: 8,
        kind: frame_type::PING,
        flags: flags::ACK,
        stream_id: 0,
    }
    .encode(out);
    out.extend_from_slice(opaque);
}

pub fn write_goaway(out: &mut Vec<u8>, last_stream_id: u32, code: u32, debug: &str) {
    FrameHeader {
        length: (8 + debug.len()) as u32,
        kind: frame_type::GOAWAY,
        flags: 0,
        stream_id: 0,
    }
    .encode(out);
    out.extend_from_slice(&(last_stream_id & 0x7FFF_FFFF).to_be_bytes());
    out.extend_from_slice(&code.to_be_bytes());
    out.extend_from_slice(debug.as_bytes());
}

pub fn write_rst_stream(out: &mut Vec<u8>, stream_id: u32, code: u32) {
    FrameHeader {
        length: 4,
        kind: frame_type::RST_STREAM,
        flags: 0,
        stream_id,
    }
    .encode(out);
    out.extend_from_slice(&code.to_be_bytes());
}

pub fn write_window_update(out: &mut Vec<u8>, stream_id: u32, increment: u32) {
    FrameHeader {
        length: 4,
        kind: frame_type::WINDOW_UPDATE,
        flags: 0,
        stream_id,
    }
    .encode(out);
    out.extend_from_slice(&(increment & 0x7FFF_FFFF).to_be_bytes());
}

pub fn write_headers(out: &mut Vec<u8>, stream_id: u32, block: &[u8], end_stream: bool) {
    let mut fl = flags::END_HEADERS;
    if end_stream {
        fl |= flags::END_STREAM;
    }
    FrameHeader {
        length: block.len() as u32,
        kind: frame_type::HEADERS,
        flags: fl,
        stream_id,
    }
    .encode(out);
    out.extend_from_slice(block);
}

pub fn write_data(out: &mut Vec<u8>, stream_id: u32, payload: &[u8], end_stream: bool) {
    FrameHeader {
        length: payload.len() as u32,
        kind: frame_type::DATA,
        flags: if end_stream { flags::END_STREAM } else { 0 },
        stream_id,
    }
    .encode(out);
    out.extend_from_slice(payload);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_header_roundtrip() {
        let hdr = FrameHeader {
            length: 0x01_02_03,
            kind: frame_type::DATA,
            flags: flags::END_STREAM,
            stream_id: 7,
        };
        let mut out = Vec::new();
        hdr.encode(&mut out);
        assert_eq!(out.len(), FRAME_HEADER_LEN);

        let back = FrameHeader::decode(out.as_slice().try_into().unwrap());
        assert_eq!(back, hdr);
        assert!(back.has(flags::END_STREAM));
    }

    #[test]
    fn test_reserved_bit_masked() {
        let mut out = Vec::new();
        FrameHeader {
            length: 0,
            kind: frame_type::PING,
            flags: 0,
            stream_id: 0xFFFF_FFFF,
        }
        .encode(&mut out);
        let back = FrameHeader::decode(out.as_slice().try_into().unwrap());
        assert_eq!(back.stream_id, 0x7FFF_FFFF);
    }

    #[test]
    fn test_router_settings() {
        let s = Settings::router_initial();
        assert_eq!(s.enable_push, 0);
        assert_eq!(s.max_concurrent_streams, 100);
        assert_eq!(s.initial_window_size, 65_536);
        assert_eq!(s.max_frame_size, 16_384);

        let mut out = Vec::new();
        write_settings(&mut out, &s);
        let hdr = FrameHeader::decode(out[..FRAME_HEADER_LEN].try_into().unwrap());
        assert_eq!(hdr.kind, frame_type::SETTINGS);
        assert_eq!(hdr.length as usize, out.len() - FRAME_HEADER_LEN);
        assert_eq!(hdr.length % 6, 0);
    }

    #[test]
    fn test_goaway_carries_reason() {
        let mut out = Vec::new();
        write_goaway(&mut out, 5, error_code::PROTOCOL_ERROR, error_code::strerror(error_code::PROTOCOL_ERROR));
        let hdr = FrameHeader::decode(out[..FRAME_HEADER_LEN].try_into().unwrap());
        assert_eq!(hdr.kind, frame_type::GOAWAY);
        let last = u32::from_be_bytes(out[9..13].try_into().unwrap());
        let code = u32::from_be_bytes(out[13..17].try_into().unwrap());
        assert_eq!(last, 5);
        assert_eq!(code, error_code::PROTOCOL_ERROR);
        assert_eq!(&out[17..], b"protocol error");
    }

    #[test]
    fn test_settings_apply_unknown_ignored() {
        let mut s = Settings::default();
        s.apply(0x99, 1234);
        assert_eq!(s, Settings::default());
        s.apply(settings_id::INITIAL_WINDOW_SIZE, 100);
        assert_eq!(s.initial_window_size, 100);
    }
}
