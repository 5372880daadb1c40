//! Weir: the message pipeline and stream-flow engine of a multi-protocol
//! router data plane.
//!
//! A router terminates application protocol sessions (AMQP 1.0, HTTP/2),
//! tunnels them as AMQP-framed messages across an inter-router mesh, and
//! delivers them to consumers. Weir is the core that carries the cross-thread
//! coordination in that path: one I/O worker ingests octets while another
//! drains them, deliveries are reference-counted across both directions,
//! parsing resumes at arbitrary buffer boundaries, and protocol flow control
//! composes with the router's own credit windows without deadlock.
//!
//! # Overview
//!
//! ```text
//!              octets                      deliveries
//!  ┌────────┐  ┌────────────┐  ┌─────────────────────┐  ┌───────────────┐
//!  │ buffer │─▶│  content   │─▶│ parser: sections &  │─▶│  forwarder /  │
//!  │  pool  │  │ (chain of  │  │ depth gate          │  │ outgoing link │
//!  └────────┘  │  buffers)  │  └─────────────────────┘  └───────┬───────┘
//!      ▲       └────────────┘                                   │
//!      │             │  one content, many lightweight handles   ▼
//!      │             │  ┌──────────────────────┐  ┌──────────────────────┐
//!      │             └─▶│ stream-data segments │─▶│ octet transmission   │
//!      │                │ or cut-through ring  │  │ (send / HTTP2 DATA)  │
//!      │                └──────────────────────┘  └──────────┬───────────┘
//!      └────────────────────── buffer return ────────────────┘
//!
//!  control flow (credit, Q2/Q3, cancellation) travels backward on the
//!  same edges
//! ```
//!
//! One logical message is a single [`message::Message`] content shared by
//! every delivery that references it: the body is an append-only chain of
//! fixed 512-byte pooled buffers, readers observe a monotonically growing
//! prefix, and section locators name AMQP fields in place without copying.
//!
//! # Back-pressure
//!
//! Two watermark levels bound memory:
//!
//! - **Q2** (per message): when one content chains more than `Q2_UPPER`
//!   buffers the producing link stops reading input; a registered unblock
//!   handler fires, on any thread, once the consumers drain it back to
//!   `Q2_LOWER`.
//! - **Q3** (per session): when one AMQP session's outgoing queue exceeds its
//!   byte watermark, every link on the session pauses until the transport
//!   drains it.
//!
//! # Cut-through
//!
//! A stream proven to have exactly one consumer can switch to cut-through: a
//! fixed 8-slot single-producer/single-consumer ring of buffer lists hands
//! octets straight from the producing connection to the consuming one,
//! bypassing composing and parsing entirely. Each side registers an
//! activation record so the counterpart can be woken through the server's
//! activation lock without racing connection tear-down.
//!
//! # HTTP/2 adaptor
//!
//! The [`http2`] module layers an HTTP/2 state machine on top of the
//! pipeline: each stream becomes a streamed message pair, HEADERS map to the
//! message sections, DATA frames append body segments, and HTTP/2 flow
//! control composes with Q2 by withholding window credit while a message is
//! blocked. The outbound body producer never parks a worker: it returns
//! deferred and is resumed explicitly when body or window arrives.

pub mod agent;
pub mod buffers;
pub mod codec;
pub mod config;
pub mod cutthrough;
pub mod http2;
pub mod link;
pub mod message;
pub mod sync;

pub use buffers::{BUFFER_SIZE, BufferChain, ChainPos, FieldLocation};
pub use codec::{
    ANNOTATIONS_VERSION, ANNOTATIONS_VERSION_KEY, AnnotationsError, Composer, Performative,
    RouterAnnotations,
};
pub use config::{PoolTuning, QLimits};
pub use cutthrough::{Activation, ActivationType, RESUME_THRESHOLD, SLOT_COUNT};
pub use link::{
    Connection, ConnectionRole, Delivery, Disposition, Forwarder, Link, LinkDirection, LinkType,
    Server, Session,
};
pub use message::{
    Depth, DepthStatus, FieldReader, Message, MessageField, RaStrip, RouterNode, StreamData,
    StreamDataResult,
};
pub use sync::uptime_ticks;
