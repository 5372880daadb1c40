//! Server and connection primitives.
//!
//! The pipeline does not own transports; it owns the bookkeeping that lets
//! any thread wake a connection's I/O task safely. The server's activation
//! lock is taken around every use of a connection's wake primitive so the
//! task cannot be torn down concurrently; the connection's safe-pointer gate
//! is invalidated on close so stale activation records observe "gone".

use std::sync::{Arc, Mutex, MutexGuard};

use crate::sync::{
    event::{self, Notifier, Waiter},
    safeptr::{Gated, SafeGate},
    uptime_ticks,
};

/// Process-wide server state shared by all connections.
#[derive(Default)]
pub struct Server {
    activation: Mutex<()>,
}

impl Server {
    pub fn new() -> Arc<Server> {
        Arc::new(Server::default())
    }

    /// Serializes wake/close against connection tear-down.
    pub(crate) fn activation_lock(&self) -> MutexGuard<'_, ()> {
        self.activation.lock().unwrap()
    }
}

/// Role a connection plays in the fabric.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionRole {
    /// Application client or server speaking a terminal protocol.
    Normal,
    /// Peer router on the interior mesh.
    InterRouter,
    /// Downlink to an edge router.
    Edge,
}

impl ConnectionRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionRole::Normal => "normal",
            ConnectionRole::InterRouter => "inter-router",
            ConnectionRole::Edge => "edge",
        }
    }
}

/// One transport connection as the pipeline sees it: an identity, a wake
/// primitive for its I/O task, and the table row the agent walks.
pub struct Connection {
    pub identity: u64,
    pub name: String,
    pub host: String,
    pub role: ConnectionRole,
    pub dir_in: bool,
    pub container_id: String,
    pub opened_tick: u64,

    gate: SafeGate,
    wake: Notifier,
}

impl Connection {
    /// Creates the connection and the waiter its I/O task parks on.
    pub fn new(
        identity: u64,
        name: impl Into<String>,
        host: impl Into<String>,
        role: ConnectionRole,
        dir_in: bool,
        container_id: impl Into<String>,
    ) -> (Arc<Connection>, Waiter) {
        let (wake, waiter) = event::new();
        let conn = Arc::new(Connection {
            identity,
            name: name.into(),
            host: host.into(),
            role,
            dir_in,
            container_id: container_id.into(),
            opened_tick: uptime_ticks(),
            gate: SafeGate::new(),
            wake,
        });
        (conn, waiter)
    }

    /// Wakes the connection's I/O task. Callers hold the server activation
    /// lock; see [`Server::activation_lock`].
    pub(crate) fn wake(&self) {
        let _ = self.wake.notify();
    }

    /// Wakes the task from a context that is not an activation record.
    pub fn request_wake(&self, server: &Server) {
        let _guard = server.activation_lock();
        self.wake();
    }

    /// Invalidates every safe reference captured against this connection.
    /// The I/O task calls this first thing during tear-down.
    pub fn close(&self, server: &Server) {
        let _guard = server.activation_lock();
        self.gate.invalidate();
    }

    pub fn uptime_seconds(&self) -> u64 {
        uptime_ticks().saturating_sub(self.opened_tick)
    }
}

impl Gated for Connection {
    fn gate(&self) -> &SafeGate {
        &self.gate
    }
}
