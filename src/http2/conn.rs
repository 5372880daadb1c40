//! HTTP/2 connection engine.
//!
//! Sans-io state machine for one listener-side connection: octets in through
//! [`Http2Connection::on_read`], octets out through
//! [`Http2Connection::take_egress`]. Each request stream becomes a streamed
//! message routed through the forwarder; the response delivery the core
//! attaches is drained back out as HEADERS/DATA/trailers. Outbound body
//! emission never blocks: when the peer's flow window is exhausted or the
//! next segment is incomplete the stream parks itself deferred, and
//! [`Http2Connection::resume_data`] picks it up when new body or window
//! arrives.

use std::{collections::BTreeMap, sync::Arc};

use log::{debug, warn};
use thiserror::Error;

use crate::{
    buffers::BufferChain,
    buffers::writer::Writer,
    codec::{Composer, Performative},
    link::{Connection, Delivery, Disposition, Forwarder, Server},
    message::{Depth, DepthStatus, FieldReader, Message, MessageField, StreamDataResult},
    sync::safeptr::SafeRef,
};

use super::{
    frame::{self, FRAME_HEADER_LEN, FrameHeader, PREFACE, Settings, error_code, flags, frame_type},
    hpack,
    stream::{Stream, StreamStatus},
};

/// Listener configuration the engine needs.
#[derive(Debug, Clone)]
pub struct Http2Config {
    /// Virtual address requests are routed toward when `:path` is absent.
    pub address: String,
    /// Per-message size cap; 0 enforces nothing.
    pub max_message_size: u64,
}

#[derive(Debug, Error)]
pub enum Http2Error {
    #[error("connection closed")]
    Closed,
    #[error("http2 protocol error: {0}")]
    Protocol(&'static str),
}

struct ConnError {
    code: u32,
    reason: &'static str,
}

impl ConnError {
    fn protocol(reason: &'static str) -> Self {
        Self {
            code: error_code::PROTOCOL_ERROR,
            reason,
        }
    }
}

impl From<hpack::HpackError> for ConnError {
    fn from(_: hpack::HpackError) -> Self {
        Self {
            code: error_code::COMPRESSION_ERROR,
            reason: "header block decode failed",
        }
    }
}

/// One listener-side HTTP/2 connection.
pub struct Http2Connection {
    conn: Arc<Connection>,
    server: Arc<Server>,
    forwarder: Arc<dyn Forwarder>,
    config: Http2Config,

    in_buf: Vec<u8>,
    out_buf: Vec<u8>,
    preface_seen: bool,

    local_settings: Settings,
    remote_settings: Settings,
    hpack_dec: hpack::Decoder,
    hpack_enc: hpack::Encoder,

    /// Connection-level send window toward the peer.
    conn_send_window: i64,
    /// Connection-level flow credit withheld while Q2 is blocked.
    conn_window_held: u32,

    streams: BTreeMap<u32, Stream>,
    highest_remote_stream: u32,
    /// HEADERS awaiting CONTINUATION: (stream id, flags, block so far).
    continuation: Option<(u32, u8, Vec<u8>)>,

    goaway_sent: bool,
    goaway_received: Option<u32>,
    closed: bool,
    error: Option<Http2Error>,
}

impl Http2Connection {
    /// Creates the engine. ALPN, when present, must have resolved to `h2`;
    /// anything else gets an immediate GOAWAY(PROTOCOL_ERROR) and the
    /// connection closes once that frame is flushed.
    pub fn new(
        conn: Arc<Connection>,
        server: Arc<Server>,
        forwarder: Arc<dyn Forwarder>,
        config: Http2Config,
        alpn: Option<&str>,
    ) -> Self {
        let local_settings = Settings::router_initial();
        let remote_settings = Settings::default();
        let mut engine = Self {
            conn,
            server,
            forwarder,
            config,
            in_buf: Vec::new(),
            out_buf: Vec::new(),
            preface_seen: false,
            hpack_dec: hpack::Decoder::new(local_settings.header_table_size as usize),
            hpack_enc: hpack::Encoder::new(),
            conn_send_window: remote_settings.initial_window_size as i64,
            conn_window_held: 0,
            local_settings,
            remote_settings,
            streams: BTreeMap::new(),
            highest_remote_stream: 0,
            continuation: None,
            goaway_sent: false,
            goaway_received: None,
            closed: false,
            error: None,
        };

        if let Some(protocol) = alpn
            && protocol != "h2"
        {
            warn!(
                "[C{}] ALPN negotiated {protocol:?}, expected \"h2\"",
                engine.conn.identity
            );
            engine.connection_error(ConnError::protocol("ALPN protocol is not h2"));
            return engine;
        }

        frame::write_settings(&mut engine.out_buf, &engine.local_settings);
        engine
    }

    pub fn identity(&self) -> u64 {
        self.conn.identity
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// The error that closed the connection, if one did.
    pub fn error(&self) -> Option<&Http2Error> {
        self.error.as_ref()
    }

    /// Octets queued for the transport.
    pub fn take_egress(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.out_buf)
    }

    pub fn has_egress(&self) -> bool {
        !self.out_buf.is_empty()
    }

    // --- Ingress

    /// Feeds transport octets through the frame layer.
    pub fn on_read(&mut self, octets: &[u8]) {
        if self.closed {
            return;
        }
        self.in_buf.extend_from_slice(octets);

        if !self.preface_seen {
            if self.in_buf.len() < PREFACE.len() {
                return;
            }
            if &self.in_buf[..PREFACE.len()] != PREFACE {
                self.connection_error(ConnError::protocol("bad connection preface"));
                return;
            }
            self.in_buf.drain(..PREFACE.len());
            self.preface_seen = true;
        }

        loop {
            if self.closed || self.in_buf.len() < FRAME_HEADER_LEN {
                return;
            }
            let header = FrameHeader::decode(self.in_buf[..FRAME_HEADER_LEN].try_into().unwrap());
            if header.length > self.local_settings.max_frame_size {
                self.connection_error(ConnError {
                    code: error_code::FRAME_SIZE_ERROR,
                    reason: "frame exceeds SETTINGS_MAX_FRAME_SIZE",
                });
                return;
            }
            let total = FRAME_HEADER_LEN + header.length as usize;
            if self.in_buf.len() < total {
                return;
            }
            let payload: Vec<u8> = self.in_buf[FRAME_HEADER_LEN..total].to_vec();
            self.in_buf.drain(..total);

            if let Err(e) = self.on_frame(header, &payload) {
                self.connection_error(e);
                return;
            }
        }
    }

    fn on_frame(&mut self, header: FrameHeader, payload: &[u8]) -> Result<(), ConnError> {
        // A HEADERS block in flight admits only CONTINUATION frames.
        if let Some((id, _, _)) = self.continuation
            && (header.kind != frame_type::CONTINUATION || header.stream_id != id)
        {
            return Err(ConnError::protocol("expected CONTINUATION"));
        }

        match header.kind {
            frame_type::DATA => self.on_data(header, payload),
            frame_type::HEADERS => self.on_headers(header, payload),
            frame_type::CONTINUATION => self.on_continuation(header, payload),
            frame_type::SETTINGS => self.on_settings(header, payload),
            frame_type::WINDOW_UPDATE => self.on_window_update(header, payload),
            frame_type::RST_STREAM => self.on_rst_stream(header, payload),
            frame_type::PING => self.on_ping(header, payload),
            frame_type::GOAWAY => self.on_goaway(payload),
            frame_type::PUSH_PROMISE => Err(ConnError::protocol("PUSH_PROMISE with ENABLE_PUSH=0")),
            // PRIORITY and unknown types are ignored.
            _ => Ok(()),
        }
    }

    fn on_data(&mut self, header: FrameHeader, payload: &[u8]) -> Result<(), ConnError> {
        if header.stream_id == 0 {
            return Err(ConnError::protocol("DATA on stream 0"));
        }
        let data = strip_padding(header, payload)?;

        let Some(stream) = self.streams.get_mut(&header.stream_id) else {
            // Already freed (e.g. after our GOAWAY); account the window only.
            frame::write_window_update(&mut self.out_buf, 0, data.len() as u32);
            return Ok(());
        };

        stream.bytes_in += data.len() as u64;
        if self.config.max_message_size > 0 && stream.bytes_in > self.config.max_message_size {
            // Oversize policy: stop reading, reject permanently, no retry.
            stream.with_request_message(|m| {
                m.set_aborted();
                m.set_discard(true);
            });
            frame::write_rst_stream(&mut self.out_buf, header.stream_id, error_code::CANCEL);
            self.free_stream(header.stream_id, Disposition::Rejected);
            return Ok(());
        }

        let mut q2_blocked = false;
        if !data.is_empty() {
            let mut chain = BufferChain::new();
            chain.writer().write_exact(data).expect("chain write");
            if stream.in_delivery.is_some() {
                q2_blocked = stream
                    .with_request_message(|m| m.stream_data_append(chain))
                    .unwrap_or(false);
            } else {
                // Not yet routed: accumulate and splice on first route.
                stream.body_buffers.append(&mut chain);
            }
        }

        // Local back-pressure only: flow credit is withheld while Q2 blocks
        // and granted back when the unblock handler wakes the connection.
        let len = data.len() as u32;
        if len > 0 {
            if q2_blocked {
                stream.window_held += len;
                self.conn_window_held += len;
            } else {
                let id = stream.id;
                frame::write_window_update(&mut self.out_buf, id, len);
                frame::write_window_update(&mut self.out_buf, 0, len);
            }
        }

        if header.has(flags::END_STREAM) {
            self.end_of_request(header.stream_id);
        }
        Ok(())
    }

    fn on_headers(&mut self, header: FrameHeader, payload: &[u8]) -> Result<(), ConnError> {
        if header.stream_id == 0 {
            return Err(ConnError::protocol("HEADERS on stream 0"));
        }
        let mut block = strip_padding(header, payload)?;
        if header.has(flags::PRIORITY) {
            if block.len() < 5 {
                return Err(ConnError::protocol("short priority fields"));
            }
            block = &block[5..];
        }

        if !header.has(flags::END_HEADERS) {
            self.continuation = Some((header.stream_id, header.flags, block.to_vec()));
            return Ok(());
        }
        self.dispatch_headers(header.stream_id, header.flags, block)
    }

    fn on_continuation(&mut self, header: FrameHeader, payload: &[u8]) -> Result<(), ConnError> {
        let Some((id, first_flags, mut block)) = self.continuation.take() else {
            return Err(ConnError::protocol("CONTINUATION without HEADERS"));
        };
        block.extend_from_slice(payload);
        if !header.has(flags::END_HEADERS) {
            self.continuation = Some((id, first_flags, block));
            return Ok(());
        }
        self.dispatch_headers(id, first_flags, &block)
    }

    fn dispatch_headers(&mut self, stream_id: u32, first_flags: u8, block: &[u8]) -> Result<(), ConnError> {
        let headers = self.hpack_dec.decode(block)?;
        let end_stream = first_flags & flags::END_STREAM != 0;

        if self.streams.contains_key(&stream_id) {
            return self.on_request_trailers(stream_id, headers, end_stream);
        }
        self.on_request(stream_id, headers, end_stream)
    }

    /// Ingress HEADERS: creates the stream, composes the request message and
    /// routes the inbound delivery.
    fn on_request(
        &mut self,
        stream_id: u32,
        headers: Vec<(String, String)>,
        end_stream: bool,
    ) -> Result<(), ConnError> {
        if stream_id % 2 == 0 || stream_id <= self.highest_remote_stream {
            return Err(ConnError::protocol("bad client stream id"));
        }
        if self.goaway_sent || self.goaway_received.is_some() {
            frame::write_rst_stream(&mut self.out_buf, stream_id, error_code::REFUSED_STREAM);
            return Ok(());
        }
        if self.streams.len() as u32 >= self.local_settings.max_concurrent_streams {
            frame::write_rst_stream(&mut self.out_buf, stream_id, error_code::REFUSED_STREAM);
            return Ok(());
        }
        self.highest_remote_stream = stream_id;

        let mut method = None;
        let mut path = None;
        let mut content_type = None;
        let mut content_encoding = None;
        let mut app_headers = Vec::new();
        for (name, value) in headers {
            match name.as_str() {
                ":method" => method = Some(value),
                ":path" => path = Some(value),
                ":scheme" | ":authority" => {}
                "content-type" => content_type = Some(value),
                "content-encoding" => content_encoding = Some(value),
                _ => app_headers.push((name, value)),
            }
        }
        let Some(method) = method else {
            frame::write_rst_stream(&mut self.out_buf, stream_id, error_code::PROTOCOL_ERROR);
            return Ok(());
        };
        let to = path.unwrap_or_else(|| self.config.address.clone());

        debug!(
            "[C{}][S{stream_id}] request {method} {to}",
            self.conn.identity
        );

        let mut message = compose_request_message(
            &method,
            &to,
            content_type.as_deref(),
            content_encoding.as_deref(),
            &app_headers,
        );
        message.set_streaming_annotation();

        // Q2 unblock runs on whatever thread releases the buffers; it must
        // observe a torn-down connection as gone.
        let conn_ref = SafeRef::capture(&self.conn);
        let server = self.server.clone();
        message.set_q2_unblocked_handler(Arc::new(move || {
            if let Some(conn) = conn_ref.deref() {
                conn.request_wake(&server);
            }
        }));

        let mut stream = Stream::new(stream_id, self.remote_settings.initial_window_size as i64);
        stream.to = to;
        if end_stream {
            message.set_no_body();
            message.set_receive_complete();
            stream.advance_status();
        }
        stream.message = Some(message);
        self.streams.insert(stream_id, stream);
        self.try_route(stream_id);
        Ok(())
    }

    /// Request trailers arrive as a second HEADERS block; they become the
    /// message footer.
    fn on_request_trailers(
        &mut self,
        stream_id: u32,
        headers: Vec<(String, String)>,
        end_stream: bool,
    ) -> Result<(), ConnError> {
        let Some(stream) = self.streams.get_mut(&stream_id) else {
            return Ok(());
        };
        let mut footer = Composer::new(Performative::Footer);
        footer.start_map();
        for (name, value) in &headers {
            footer.insert_symbol(name).insert_string(value);
        }
        footer.end_map();
        stream.footer_pending = true;
        stream.with_request_message(|m| m.footer_append(footer));

        // Trailers always end the request side, END_STREAM flag or not.
        let _ = end_stream;
        self.end_of_request(stream_id);
        Ok(())
    }

    /// Attaches the inbound delivery to the router core, splicing any body
    /// octets accumulated while unrouted. Retried on credit events.
    pub fn try_route(&mut self, stream_id: u32) {
        let Some(stream) = self.streams.get_mut(&stream_id) else {
            return;
        };
        if stream.in_delivery.is_some() {
            return;
        }
        let Some(mut message) = stream.message.take() else {
            return;
        };
        if !stream.body_buffers.is_empty() {
            let accumulated = stream.body_buffers.take();
            message.stream_data_append(accumulated);
        }
        let delivery = Delivery::new(message);
        delivery.set_context(Some(stream_id as u64));
        if self.forwarder.deliver(&stream.to, &delivery) {
            stream.in_delivery = Some(delivery);
        } else {
            // No route or credit yet; take the message back and keep
            // accumulating.
            stream.message = delivery.take_message();
        }
    }

    /// Retries every unrouted stream (credit became available).
    pub fn retry_unrouted(&mut self) {
        let ids: Vec<u32> = self
            .streams
            .values()
            .filter(|s| s.in_delivery.is_none() && s.message.is_some())
            .map(|s| s.id)
            .collect();
        for id in ids {
            self.try_route(id);
        }
    }

    fn end_of_request(&mut self, stream_id: u32) {
        let Some(stream) = self.streams.get_mut(&stream_id) else {
            return;
        };
        stream.with_request_message(|m| m.set_receive_complete());
        if stream.status == StreamStatus::Open {
            stream.advance_status();
        }
        self.try_route(stream_id);
        self.reap(stream_id);
    }

    fn on_settings(&mut self, header: FrameHeader, payload: &[u8]) -> Result<(), ConnError> {
        if header.has(flags::ACK) {
            return Ok(());
        }
        if payload.len() % 6 != 0 {
            return Err(ConnError {
                code: error_code::FRAME_SIZE_ERROR,
                reason: "SETTINGS length not a multiple of 6",
            });
        }
        let old_window = self.remote_settings.initial_window_size as i64;
        for entry in payload.chunks_exact(6) {
            let id = u16::from_be_bytes([entry[0], entry[1]]);
            let value = u32::from_be_bytes([entry[2], entry[3], entry[4], entry[5]]);
            self.remote_settings.apply(id, value);
        }
        // A window-size change retroactively adjusts every open stream.
        let delta = self.remote_settings.initial_window_size as i64 - old_window;
        if delta != 0 {
            for stream in self.streams.values_mut() {
                stream.send_window += delta;
            }
        }
        frame::write_settings_ack(&mut self.out_buf);
        Ok(())
    }

    fn on_window_update(&mut self, header: FrameHeader, payload: &[u8]) -> Result<(), ConnError> {
        if payload.len() != 4 {
            return Err(ConnError {
                code: error_code::FRAME_SIZE_ERROR,
                reason: "WINDOW_UPDATE length",
            });
        }
        let increment = (u32::from_be_bytes(payload.try_into().unwrap()) & 0x7FFF_FFFF) as i64;
        if increment == 0 {
            return Err(ConnError::protocol("zero WINDOW_UPDATE"));
        }
        if header.stream_id == 0 {
            self.conn_send_window += increment;
            let deferred: Vec<u32> = self
                .streams
                .values()
                .filter(|s| s.deferred)
                .map(|s| s.id)
                .collect();
            for id in deferred {
                self.resume_data(id);
            }
        } else if let Some(stream) = self.streams.get_mut(&header.stream_id) {
            stream.send_window += increment;
            if stream.deferred {
                self.resume_data(header.stream_id);
            }
        }
        Ok(())
    }

    fn on_rst_stream(&mut self, header: FrameHeader, payload: &[u8]) -> Result<(), ConnError> {
        if payload.len() != 4 {
            return Err(ConnError {
                code: error_code::FRAME_SIZE_ERROR,
                reason: "RST_STREAM length",
            });
        }
        let code = u32::from_be_bytes(payload.try_into().unwrap());
        debug!(
            "[C{}][S{}] RST_STREAM {}",
            self.conn.identity,
            header.stream_id,
            error_code::strerror(code)
        );
        self.free_stream(header.stream_id, Disposition::Rejected);
        Ok(())
    }

    fn on_ping(&mut self, header: FrameHeader, payload: &[u8]) -> Result<(), ConnError> {
        if payload.len() != 8 {
            return Err(ConnError {
                code: error_code::FRAME_SIZE_ERROR,
                reason: "PING length",
            });
        }
        if !header.has(flags::ACK) {
            frame::write_ping_ack(&mut self.out_buf, payload.try_into().unwrap());
        }
        Ok(())
    }

    fn on_goaway(&mut self, payload: &[u8]) -> Result<(), ConnError> {
        if payload.len() < 8 {
            return Err(ConnError {
                code: error_code::FRAME_SIZE_ERROR,
                reason: "GOAWAY length",
            });
        }
        let last = u32::from_be_bytes(payload[..4].try_into().unwrap()) & 0x7FFF_FFFF;
        self.goaway_received = Some(last);
        self.free_streams_above(last);
        if self.streams.is_empty() {
            self.closed = true;
        }
        Ok(())
    }

    // --- Server-initiated GOAWAY

    /// Sends GOAWAY: streams above `last_stream_id` are freed and their
    /// deliveries released; streams at or below it complete normally, then
    /// the connection closes. No new stream is accepted afterwards.
    pub fn send_goaway(&mut self, last_stream_id: u32, code: u32) {
        if self.goaway_sent {
            return;
        }
        self.goaway_sent = true;
        frame::write_goaway(&mut self.out_buf, last_stream_id, code, error_code::strerror(code));
        self.free_streams_above(last_stream_id);
        if self.streams.is_empty() {
            self.closed = true;
        }
    }

    fn free_streams_above(&mut self, last_stream_id: u32) {
        let doomed: Vec<u32> = self
            .streams
            .keys()
            .copied()
            .filter(|id| *id > last_stream_id)
            .collect();
        for id in doomed {
            self.free_stream(id, Disposition::Released);
        }
    }

    /// Frees one stream. The inbound delivery loses its adaptor context and
    /// the outbound delivery gets `outcome` as its final local disposition.
    fn free_stream(&mut self, stream_id: u32, outcome: Disposition) {
        let Some(mut stream) = self.streams.remove(&stream_id) else {
            return;
        };
        let (bytes_in, bytes_out, footer_pending) = (stream.bytes_in, stream.bytes_out, stream.footer_pending);
        let (in_dlv, out_dlv) = stream.teardown();
        if let Some(in_dlv) = in_dlv {
            in_dlv.set_context(None);
            in_dlv.with_message(|m| m.set_aborted());
        }
        if let Some(out_dlv) = out_dlv {
            out_dlv.set_local_disposition(outcome);
            out_dlv.settle();
        }
        debug!(
            "[C{}][S{stream_id}] stream freed, {bytes_in} octets in, {bytes_out} out, trailers pending {footer_pending}",
            self.conn.identity
        );
    }

    /// Frees a stream once both directions are finished and dispositions
    /// applied.
    fn reap(&mut self, stream_id: u32) {
        let done = self
            .streams
            .get(&stream_id)
            .is_some_and(|s| s.is_fully_closed() && s.end_sent);
        if done {
            let mut stream = self.streams.remove(&stream_id).unwrap();
            let (in_dlv, out_dlv) = stream.teardown();
            if let Some(in_dlv) = in_dlv {
                in_dlv.set_context(None);
            }
            if let Some(out_dlv) = out_dlv {
                out_dlv.settle();
            }
        }
        if self.streams.is_empty() && (self.goaway_sent || self.goaway_received.is_some()) {
            self.closed = true;
        }
    }

    // --- Response path

    /// Attaches the response delivery the core routed back to this stream
    /// and starts emission.
    pub fn attach_response(&mut self, stream_id: u32, delivery: Arc<Delivery>) {
        if let Some(stream) = self.streams.get_mut(&stream_id) {
            delivery.set_context(Some(stream_id as u64));
            stream.out_delivery = Some(delivery);
            self.resume_data(stream_id);
        }
    }

    /// Resumes outbound body emission for a parked stream. Called when new
    /// body arrives or transport write capacity returns; wakes the I/O task
    /// so queued frames reach the transport.
    pub fn resume_data(&mut self, stream_id: u32) {
        self.drive_response(stream_id);
        self.conn.request_wake(&self.server);
    }

    fn drive_response(&mut self, stream_id: u32) {
        let Some(stream) = self.streams.get_mut(&stream_id) else {
            return;
        };
        let Some(delivery) = stream.out_delivery.clone() else {
            return;
        };
        if stream.end_sent {
            return;
        }
        stream.deferred = false;

        if !stream.header_sent {
            match delivery.with_message(|m| m.check_depth(Depth::Properties)) {
                Some(DepthStatus::Ok) => {}
                Some(DepthStatus::Incomplete) => {
                    stream.deferred = true;
                    return;
                }
                _ => {
                    frame::write_rst_stream(&mut self.out_buf, stream_id, error_code::INTERNAL_ERROR);
                    self.free_stream(stream_id, Disposition::Rejected);
                    return;
                }
            }
            let status = delivery
                .with_message(|m| m.field_reader(MessageField::Subject).and_then(FieldReader::into_string))
                .flatten()
                .unwrap_or_else(|| "200".to_string());
            let mut headers = vec![(":status".to_string(), status)];
            if let Some(extra) = delivery
                .with_message(|m| m.field_reader(MessageField::ApplicationProperties))
                .flatten()
            {
                headers.extend(read_header_map(extra));
            }
            let block = self.hpack_enc.encode(&headers);
            frame::write_headers(&mut self.out_buf, stream_id, &block, false);
            stream.header_sent = true;
        }

        // Body emission. Copies each complete segment out, releases it, and
        // defers instead of blocking when flow control runs dry.
        loop {
            let stream = self.streams.get_mut(&stream_id).unwrap();

            if !stream.out_backlog.is_empty() {
                if !emit_backlog(
                    &mut self.out_buf,
                    stream,
                    &mut self.conn_send_window,
                    self.remote_settings.max_frame_size as usize,
                ) {
                    stream.deferred = true;
                    return;
                }
                continue;
            }

            match delivery.with_message(|m| m.next_stream_data()) {
                Some(StreamDataResult::BodyOk(segment)) => {
                    stream.out_backlog = segment.payload();
                    segment.release_up_to();
                }
                Some(StreamDataResult::FooterOk(segment)) => {
                    // Trailing composite goes out as trailers after the final
                    // DATA frame.
                    let trailer_bytes = segment.payload();
                    let trailer_tag = segment.tag();
                    segment.release_up_to();
                    let trailers = read_map_pairs(&trailer_bytes, trailer_tag);
                    let block = self.hpack_enc.encode(&trailers);
                    frame::write_headers(&mut self.out_buf, stream_id, &block, true);
                    self.finish_response(stream_id);
                    return;
                }
                Some(StreamDataResult::Incomplete) => {
                    // DEFERRED: explicit resumption via resume_data.
                    stream.deferred = true;
                    return;
                }
                Some(StreamDataResult::NoMore) => {
                    frame::write_data(&mut self.out_buf, stream_id, &[], true);
                    self.finish_response(stream_id);
                    return;
                }
                Some(StreamDataResult::Aborted) => {
                    frame::write_rst_stream(&mut self.out_buf, stream_id, error_code::CANCEL);
                    self.free_stream(stream_id, Disposition::Modified);
                    return;
                }
                Some(StreamDataResult::Invalid) | None => {
                    frame::write_rst_stream(&mut self.out_buf, stream_id, error_code::INTERNAL_ERROR);
                    self.free_stream(stream_id, Disposition::Rejected);
                    return;
                }
            }
        }
    }

    fn finish_response(&mut self, stream_id: u32) {
        if let Some(stream) = self.streams.get_mut(&stream_id) {
            stream.end_sent = true;
            stream.advance_status();
            if let Some(out_dlv) = &stream.out_delivery {
                out_dlv.set_local_disposition(Disposition::Accepted);
            }
        }
        self.reap(stream_id);
    }

    /// Applies the disposition the core reports for the inbound request
    /// delivery. Released/Modified map to 503, Rejected to 400.
    pub fn handle_disposition(&mut self, stream_id: u32, disposition: Disposition) {
        let status = match disposition {
            Disposition::Released | Disposition::Modified => "503",
            Disposition::Rejected => "400",
            Disposition::Accepted | Disposition::None => return,
        };
        let Some(stream) = self.streams.get_mut(&stream_id) else {
            return;
        };
        if stream.header_sent {
            return;
        }
        let headers = vec![
            (":status".to_string(), status.to_string()),
            ("content-length".to_string(), "0".to_string()),
        ];
        let block = self.hpack_enc.encode(&headers);
        frame::write_headers(&mut self.out_buf, stream_id, &block, true);
        stream.header_sent = true;
        self.finish_response(stream_id);
        self.conn.request_wake(&self.server);
    }

    // --- Wake handling

    /// Runs deferred work after the connection task is woken: grants back
    /// flow credit withheld under Q2 and retries unrouted streams.
    pub fn on_wake(&mut self) {
        let mut grants: Vec<(u32, u32)> = Vec::new();
        for stream in self.streams.values_mut() {
            if stream.window_held > 0 {
                let blocked = stream
                    .with_request_message(|m| m.is_q2_blocked())
                    .unwrap_or(false);
                if !blocked {
                    grants.push((stream.id, stream.window_held));
                    stream.window_held = 0;
                }
            }
        }
        for (id, held) in grants {
            frame::write_window_update(&mut self.out_buf, id, held);
            self.conn_window_held -= held.min(self.conn_window_held);
            frame::write_window_update(&mut self.out_buf, 0, held);
        }
        self.retry_unrouted();
    }

    // --- Tear-down

    /// Closes the connection: every live stream is freed, inbound deliveries
    /// released (retriable) and outbound deliveries settled best-effort.
    pub fn shutdown(&mut self) {
        let ids: Vec<u32> = self.streams.keys().copied().collect();
        for id in ids {
            self.free_stream(id, Disposition::Released);
        }
        self.closed = true;
    }

    fn connection_error(&mut self, e: ConnError) {
        warn!(
            "[C{}] connection error: {} ({})",
            self.conn.identity,
            e.reason,
            error_code::strerror(e.code)
        );
        if !self.goaway_sent {
            self.goaway_sent = true;
            frame::write_goaway(&mut self.out_buf, self.highest_remote_stream, e.code, e.reason);
        }
        self.error = Some(Http2Error::Protocol(e.reason));
        self.shutdown();
    }

    #[cfg(test)]
    pub(crate) fn stream_status(&self, stream_id: u32) -> Option<StreamStatus> {
        self.streams.get(&stream_id).map(|s| s.status)
    }

    #[cfg(test)]
    pub(crate) fn stream_count(&self) -> usize {
        self.streams.len()
    }
}

/// Emits backlog octets within the current windows; true when drained.
fn emit_backlog(
    out_buf: &mut Vec<u8>,
    stream: &mut Stream,
    conn_send_window: &mut i64,
    max_frame: usize,
) -> bool {
    while !stream.out_backlog.is_empty() {
        let window = (*conn_send_window).min(stream.send_window);
        if window <= 0 {
            return false;
        }
        let take = stream.out_backlog.len().min(window as usize).min(max_frame);
        let rest = stream.out_backlog.split_off(take);
        let chunk = std::mem::replace(&mut stream.out_backlog, rest);
        frame::write_data(out_buf, stream.id, &chunk, false);
        stream.bytes_out += chunk.len() as u64;
        stream.send_window -= chunk.len() as i64;
        *conn_send_window -= chunk.len() as i64;
    }
    true
}

fn strip_padding<'a>(header: FrameHeader, payload: &'a [u8]) -> Result<&'a [u8], ConnError> {
    if !header.has(flags::PADDED) {
        return Ok(payload);
    }
    let (&pad_len, rest) = payload
        .split_first()
        .ok_or_else(|| ConnError::protocol("empty padded frame"))?;
    if pad_len as usize > rest.len() {
        return Err(ConnError::protocol("padding exceeds frame"));
    }
    Ok(&rest[..rest.len() - pad_len as usize])
}

/// Composes the AMQP request message for an ingress HTTP/2 request:
/// `:method` becomes the subject, `:path` the target address, and the
/// remaining headers land in application-properties.
fn compose_request_message(
    method: &str,
    to: &str,
    content_type: Option<&str>,
    content_encoding: Option<&str>,
    app_headers: &[(String, String)],
) -> Message {
    let mut header = Composer::new(Performative::Header);
    header.start_list().insert_bool(false).insert_null().end_list();

    let mut props = Composer::new(Performative::Properties);
    props.start_list();
    props.insert_null(); // message-id
    props.insert_null(); // user-id
    props.insert_string(to);
    props.insert_string(method); // subject
    props.insert_null(); // reply-to
    props.insert_null(); // correlation-id
    match content_type {
        Some(ct) => props.insert_string(ct),
        None => props.insert_null(),
    };
    match content_encoding {
        Some(ce) => props.insert_string(ce),
        None => props.insert_null(),
    };
    props.end_list();

    let mut fragments = vec![header, props];
    if !app_headers.is_empty() {
        let mut app = Composer::new(Performative::ApplicationProperties);
        app.start_map();
        for (name, value) in app_headers {
            app.insert_string(name).insert_string(value);
        }
        app.end_map();
        fragments.push(app);
    }

    Message::compose(fragments, false)
}

/// Decodes a composed application-properties or footer map payload into
/// header pairs. The payload opens with the compound count.
fn read_header_map(reader: FieldReader) -> Vec<(String, String)> {
    let tag = reader.tag();
    let bytes = reader.to_vec();
    read_map_pairs(&bytes, tag)
}

fn read_map_pairs(bytes: &[u8], tag: u8) -> Vec<(String, String)> {
    use crate::codec::amqp::{read_opt_string, tag as t};

    let mut reader: &[u8] = bytes;
    let count = match tag {
        t::MAP8 => {
            let Ok(c) = crate::buffers::reader::Reader::read_u8(&mut reader) else {
                return Vec::new();
            };
            c as usize
        }
        t::MAP32 => {
            if bytes.len() < 4 {
                return Vec::new();
            }
            let c = u32::from_be_bytes(bytes[..4].try_into().unwrap()) as usize;
            reader = &bytes[4..];
            c
        }
        _ => return Vec::new(),
    };

    let mut pairs = Vec::with_capacity(count / 2);
    for _ in 0..count / 2 {
        let Ok(Some(name)) = read_opt_string(&mut reader) else {
            break;
        };
        let Ok(Some(value)) = read_opt_string(&mut reader) else {
            break;
        };
        pairs.push((name, value));
    }
    pairs
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use crate::link::ConnectionRole;

    /// Forwarder that records inbound deliveries per target address.
    #[derive(Default)]
    struct Loopback {
        delivered: Mutex<Vec<(String, Arc<Delivery>)>>,
        credit: std::sync::atomic::AtomicBool,
    }

    impl Loopback {
        fn with_credit() -> Arc<Self> {
            let f = Arc::new(Loopback::default());
            f.credit.store(true, std::sync::atomic::Ordering::Relaxed);
            f
        }

        fn take(&self) -> Vec<(String, Arc<Delivery>)> {
            std::mem::take(&mut self.delivered.lock().unwrap())
        }
    }

    impl Forwarder for Loopback {
        fn deliver(&self, to: &str, delivery: &Arc<Delivery>) -> bool {
            if !self.credit.load(std::sync::atomic::Ordering::Relaxed) {
                return false;
            }
            self.delivered
                .lock()
                .unwrap()
                .push((to.to_string(), delivery.clone()));
            true
        }
    }

    fn engine_with(forwarder: Arc<Loopback>, alpn: Option<&str>) -> Http2Connection {
        let server = Server::new();
        let (conn, _waiter) = Connection::new(1, "h2-test", "peer", ConnectionRole::Normal, true, "client");
        let config = Http2Config {
            address: "examples/http2".to_string(),
            max_message_size: 0,
        };
        Http2Connection::new(conn, server, forwarder, config, alpn)
    }

    fn client_preamble(engine: &mut Http2Connection) {
        let mut bytes = PREFACE.to_vec();
        frame::write_settings(&mut bytes, &Settings::default());
        engine.on_read(&bytes);
        // Server preface (SETTINGS) and the SETTINGS ACK are queued.
        let egress = engine.take_egress();
        assert!(!egress.is_empty());
    }

    fn client_headers(stream_id: u32, method: &str, path: &str, end_stream: bool) -> Vec<u8> {
        let headers = vec![
            (":method".to_string(), method.to_string()),
            (":path".to_string(), path.to_string()),
            (":scheme".to_string(), "https".to_string()),
            ("user-agent".to_string(), "weir-test".to_string()),
        ];
        let block = hpack::Encoder::new().encode(&headers);
        let mut bytes = Vec::new();
        frame::write_headers(&mut bytes, stream_id, &block, end_stream);
        bytes
    }

    /// Splits an egress byte stream into (header, payload) frames.
    fn parse_frames(mut bytes: &[u8]) -> Vec<(FrameHeader, Vec<u8>)> {
        let mut frames = Vec::new();
        while bytes.len() >= FRAME_HEADER_LEN {
            let header = FrameHeader::decode(bytes[..FRAME_HEADER_LEN].try_into().unwrap());
            let total = FRAME_HEADER_LEN + header.length as usize;
            frames.push((header, bytes[FRAME_HEADER_LEN..total].to_vec()));
            bytes = &bytes[total..];
        }
        frames
    }

    #[test]
    fn test_alpn_mismatch_goes_away() {
        let forwarder = Loopback::with_credit();
        let mut engine = engine_with(forwarder, Some("http/1.1"));

        assert!(engine.is_closed());
        let frames = parse_frames(&engine.take_egress());
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].0.kind, frame_type::GOAWAY);
        let code = u32::from_be_bytes(frames[0].1[4..8].try_into().unwrap());
        assert_eq!(code, error_code::PROTOCOL_ERROR);
    }

    #[test]
    fn test_alpn_h2_accepted() {
        let forwarder = Loopback::with_credit();
        let mut engine = engine_with(forwarder, Some("h2"));
        assert!(!engine.is_closed());
        // The router's SETTINGS advertisement goes first.
        let frames = parse_frames(&engine.take_egress());
        assert_eq!(frames[0].0.kind, frame_type::SETTINGS);
    }

    #[test]
    fn test_request_maps_to_message() {
        let forwarder = Loopback::with_credit();
        let mut engine = engine_with(forwarder.clone(), Some("h2"));
        client_preamble(&mut engine);

        engine.on_read(&client_headers(1, "POST", "/orders", false));
        let mut data = Vec::new();
        frame::write_data(&mut data, 1, b"payload-bytes", true);
        engine.on_read(&data);

        let delivered = forwarder.take();
        assert_eq!(delivered.len(), 1);
        let (to, delivery) = &delivered[0];
        assert_eq!(to, "/orders");
        assert_eq!(delivery.context(), Some(1));

        // :method became the subject, :path the to field, other headers
        // landed in application-properties.
        let subject = delivery
            .with_message(|m| {
                assert_eq!(m.check_depth(Depth::Properties), DepthStatus::Ok);
                m.field_reader(MessageField::Subject).unwrap().into_string()
            })
            .unwrap();
        assert_eq!(subject.as_deref(), Some("POST"));

        let app = delivery
            .with_message(|m| m.field_reader(MessageField::ApplicationProperties))
            .unwrap()
            .unwrap();
        let headers = read_header_map(app);
        assert!(headers.contains(&("user-agent".to_string(), "weir-test".to_string())));

        // END_STREAM completed the message; the body arrives as a segment.
        let body = delivery
            .with_message(|m| {
                assert!(m.receive_complete());
                match m.next_stream_data() {
                    StreamDataResult::BodyOk(seg) => seg.payload(),
                    _ => panic!("expected body segment"),
                }
            })
            .unwrap();
        assert_eq!(body, b"payload-bytes");

        assert_eq!(engine.stream_status(1), Some(StreamStatus::HalfClosed));
    }

    #[test]
    fn test_response_emission() {
        let forwarder = Loopback::with_credit();
        let mut engine = engine_with(forwarder.clone(), Some("h2"));
        client_preamble(&mut engine);
        engine.on_read(&client_headers(1, "GET", "/fetch", true));
        let _ = engine.take_egress();

        // The core routes a response delivery back to the stream.
        let mut props = Composer::new(Performative::Properties);
        props
            .start_list()
            .insert_null()
            .insert_null()
            .insert_null()
            .insert_string("200")
            .end_list();
        let mut response = Message::compose(vec![props], false);
        let mut body = crate::buffers::BufferChain::new();
        use crate::buffers::writer::Writer;
        body.writer().write_exact(b"response-body").unwrap();
        response.stream_data_append(body);
        response.set_receive_complete();

        let delivery = Delivery::new(response);
        engine.attach_response(1, delivery);

        let frames = parse_frames(&engine.take_egress());
        assert_eq!(frames[0].0.kind, frame_type::HEADERS);
        let headers = hpack::Decoder::new(4096).decode(&frames[0].1).unwrap();
        assert_eq!(headers[0], (":status".to_string(), "200".to_string()));

        assert_eq!(frames[1].0.kind, frame_type::DATA);
        assert_eq!(frames[1].1, b"response-body");
        // The final DATA frame carries END_STREAM.
        let last = frames.last().unwrap();
        assert_eq!(last.0.kind, frame_type::DATA);
        assert!(last.0.has(flags::END_STREAM));

        // Both directions done: the stream is gone.
        assert_eq!(engine.stream_count(), 0);
    }

    #[test]
    fn test_deferred_until_body_arrives() {
        let forwarder = Loopback::with_credit();
        let mut engine = engine_with(forwarder.clone(), Some("h2"));
        client_preamble(&mut engine);
        engine.on_read(&client_headers(1, "GET", "/slow", true));
        let _ = engine.take_egress();

        let mut props = Composer::new(Performative::Properties);
        props
            .start_list()
            .insert_null()
            .insert_null()
            .insert_null()
            .insert_string("200")
            .end_list();
        let mut response = Message::compose(vec![props], false);

        let delivery = Delivery::new(response.copy());
        engine.attach_response(1, delivery);

        // HEADERS went out, but the body is incomplete: the producer returned
        // deferred instead of blocking.
        let frames = parse_frames(&engine.take_egress());
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].0.kind, frame_type::HEADERS);

        // New body arrives; resumption is explicit.
        let mut body = crate::buffers::BufferChain::new();
        use crate::buffers::writer::Writer;
        body.writer().write_exact(b"late").unwrap();
        response.stream_data_append(body);
        response.set_receive_complete();
        engine.resume_data(1);

        let frames = parse_frames(&engine.take_egress());
        assert_eq!(frames[0].0.kind, frame_type::DATA);
        assert_eq!(frames[0].1, b"late");
        assert!(frames.last().unwrap().0.has(flags::END_STREAM));
    }

    #[test]
    fn test_release_maps_to_503() {
        let forwarder = Loopback::with_credit();
        let mut engine = engine_with(forwarder.clone(), Some("h2"));
        client_preamble(&mut engine);
        engine.on_read(&client_headers(1, "GET", "/nowhere", true));
        let _ = engine.take_egress();

        // The peer released the delivery: the client sees 503.
        engine.handle_disposition(1, Disposition::Released);

        let frames = parse_frames(&engine.take_egress());
        assert_eq!(frames.len(), 1);
        let (header, payload) = &frames[0];
        assert_eq!(header.kind, frame_type::HEADERS);
        assert!(header.has(flags::END_STREAM));
        assert!(header.has(flags::END_HEADERS));
        let headers = hpack::Decoder::new(4096).decode(payload).unwrap();
        assert_eq!(
            headers,
            vec![
                (":status".to_string(), "503".to_string()),
                ("content-length".to_string(), "0".to_string()),
            ]
        );
    }

    #[test]
    fn test_rejected_maps_to_400() {
        let forwarder = Loopback::with_credit();
        let mut engine = engine_with(forwarder.clone(), Some("h2"));
        client_preamble(&mut engine);
        engine.on_read(&client_headers(1, "GET", "/bad", true));
        let _ = engine.take_egress();

        engine.handle_disposition(1, Disposition::Rejected);
        let frames = parse_frames(&engine.take_egress());
        let headers = hpack::Decoder::new(4096).decode(&frames[0].1).unwrap();
        assert_eq!(headers[0].1, "400");
    }

    #[test]
    fn test_goaway_frees_streams_above_last_id() {
        let forwarder = Loopback::with_credit();
        let mut engine = engine_with(forwarder.clone(), Some("h2"));
        client_preamble(&mut engine);

        // Five active streams.
        for id in [1u32, 3, 5, 7, 9] {
            engine.on_read(&client_headers(id, "GET", "/stream", false));
        }
        assert_eq!(engine.stream_count(), 5);
        let delivered = forwarder.take();
        assert_eq!(delivered.len(), 5);

        engine.send_goaway(5, error_code::NO_ERROR);

        // Streams 7 and 9 are freed and their deliveries released.
        assert_eq!(engine.stream_count(), 3);
        for (_, delivery) in &delivered {
            let id = delivery.context();
            match id {
                None => {
                    // Freed streams cleared their adaptor context.
                    assert_eq!(delivery.local_disposition(), Disposition::None);
                }
                Some(id) => assert!(id <= 5),
            }
        }

        // No new stream may be started: it is refused.
        engine.on_read(&client_headers(11, "GET", "/late", false));
        assert_eq!(engine.stream_count(), 3);
        let frames = parse_frames(&engine.take_egress());
        let (goaway, _) = &frames[0];
        assert_eq!(goaway.kind, frame_type::GOAWAY);
        let rst = frames.iter().find(|(h, _)| h.kind == frame_type::RST_STREAM).unwrap();
        assert_eq!(rst.0.stream_id, 11);

        // Streams at or below the last id complete normally.
        let mut fin = Vec::new();
        frame::write_data(&mut fin, 1, b"", true);
        engine.on_read(&fin);
        assert_eq!(engine.stream_status(1), Some(StreamStatus::HalfClosed));
    }

    #[test]
    fn test_ping_is_acked() {
        let forwarder = Loopback::with_credit();
        let mut engine = engine_with(forwarder, Some("h2"));
        client_preamble(&mut engine);

        let mut ping = Vec::new();
        FrameHeader {
            length: 8,
            kind: frame_type::PING,
            flags: 0,
            stream_id: 0,
        }
        .encode(&mut ping);
        ping.extend_from_slice(&[1, 2, 3, 4, 5, 6, 7, 8]);
        engine.on_read(&ping);

        let frames = parse_frames(&engine.take_egress());
        let ack = frames.iter().find(|(h, _)| h.kind == frame_type::PING).unwrap();
        assert!(ack.0.has(flags::ACK));
        assert_eq!(ack.1, [1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn test_rst_stream_rejects_and_frees() {
        let forwarder = Loopback::with_credit();
        let mut engine = engine_with(forwarder.clone(), Some("h2"));
        client_preamble(&mut engine);
        engine.on_read(&client_headers(1, "POST", "/upload", false));
        let delivered = forwarder.take();

        let mut rst = Vec::new();
        frame::write_rst_stream(&mut rst, 1, error_code::CANCEL);
        engine.on_read(&rst);

        assert_eq!(engine.stream_count(), 0);
        // The in-delivery's adaptor context is cleared.
        assert_eq!(delivered[0].1.context(), None);
    }

    #[test]
    fn test_window_held_while_q2_blocked() {
        let forwarder = Loopback::with_credit();
        let mut engine = engine_with(forwarder.clone(), Some("h2"));
        client_preamble(&mut engine);
        engine.on_read(&client_headers(1, "POST", "/bulk", false));
        let _ = engine.take_egress();

        // Push a full Q2 window of DATA.
        let limits = crate::config::qlimits();
        let chunk = vec![0u8; 16_000];
        let mut sent = 0usize;
        while sent < (limits.q2_upper + 2) * crate::buffers::BUFFER_SIZE {
            let mut data = Vec::new();
            frame::write_data(&mut data, 1, &chunk, false);
            engine.on_read(&data);
            sent += chunk.len();
        }

        // The last grants were withheld, not sent.
        let frames = parse_frames(&engine.take_egress());
        let granted: u64 = frames
            .iter()
            .filter(|(h, _)| h.kind == frame_type::WINDOW_UPDATE && h.stream_id == 1)
            .map(|(_, p)| u32::from_be_bytes(p[..4].try_into().unwrap()) as u64)
            .sum();
        assert!(granted < sent as u64);
    }
}
