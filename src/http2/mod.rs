//! HTTP/2 protocol adaptor.
//!
//! Maps each HTTP/2 stream onto a streamed message pair: requests become
//! inbound deliveries routed through the forwarder, responses drain back out
//! through the stream-data segmenter. The [`conn::Http2Connection`] engine is
//! sans-io; [`spawn`] wraps it in a background task driving a transport, the
//! way the rest of the fabric runs its I/O workers.

pub mod conn;
pub mod frame;
pub mod hpack;
mod stream;

pub use conn::{Http2Config, Http2Connection, Http2Error};
pub use stream::StreamStatus;

use std::{
    sync::{Arc, Mutex, OnceLock, Weak},
    time::Duration,
};

use async_mutex::Mutex as AsyncMutex;
use log::debug;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    select,
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;

use crate::{
    link::{Connection, ConnectionRole, Forwarder, Server},
    sync::AtomicDuration,
};

/// Engine handle shared between the I/O task and router-core callbacks
/// (attach_response, resume_data, dispositions).
pub type SharedHttp2 = Arc<AsyncMutex<Http2Connection>>;

/// Process-wide registry of live HTTP/2 adaptor connections.
pub struct Registry {
    connections: Mutex<Vec<Weak<Connection>>>,
}

impl Registry {
    fn register(&self, conn: &Arc<Connection>) {
        let mut list = self.connections.lock().unwrap();
        list.retain(|w| w.strong_count() > 0);
        list.push(Arc::downgrade(conn));
    }

    /// Live connections, oldest first.
    pub fn connections(&self) -> Vec<Arc<Connection>> {
        self.connections
            .lock()
            .unwrap()
            .iter()
            .filter_map(Weak::upgrade)
            .collect()
    }
}

/// The adaptor registry singleton.
pub fn registry() -> &'static Registry {
    static REGISTRY: OnceLock<Registry> = OnceLock::new();
    REGISTRY.get_or_init(|| Registry {
        connections: Mutex::new(Vec::new()),
    })
}

/// Handle to a spawned connection task.
pub struct Http2Driver {
    handle: JoinHandle<()>,
    token: CancellationToken,
    inner: Arc<DriverShared>,
}

struct DriverShared {
    timeout_read: AtomicDuration,
}

impl Http2Driver {
    /// Sets the idle read timeout; a connection quiet for longer is closed.
    pub fn set_read_timeout(&self, timeout: Duration) {
        self.inner
            .timeout_read
            .store(timeout, std::sync::atomic::Ordering::Relaxed);
    }

    /// Stops the task and returns its join handle.
    pub fn stop(self) -> JoinHandle<()> {
        self.token.cancel();
        self.handle
    }
}

/// Spawns the I/O task for an accepted transport. `alpn` is the protocol the
/// TLS layer negotiated, if any; it must be `h2`.
pub fn spawn<S>(
    io: S,
    alpn: Option<String>,
    identity: u64,
    peer: String,
    config: Http2Config,
    forwarder: Arc<dyn Forwarder>,
    server: Arc<Server>,
) -> (Arc<Connection>, SharedHttp2, Http2Driver)
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (conn, waiter) = Connection::new(
        identity,
        format!("http2:{identity}"),
        peer,
        ConnectionRole::Normal,
        true,
        "httpClient",
    );
    registry().register(&conn);

    let engine = Arc::new(AsyncMutex::new(Http2Connection::new(
        conn.clone(),
        server.clone(),
        forwarder,
        config,
        alpn.as_deref(),
    )));

    let token = CancellationToken::new();
    let inner = Arc::new(DriverShared {
        timeout_read: AtomicDuration::new(Duration::from_secs(60)),
    });

    let handle = tokio::spawn(drive(
        io,
        engine.clone(),
        conn.clone(),
        server,
        waiter,
        token.clone(),
        inner.clone(),
    ));

    (conn, engine, Http2Driver { handle, token, inner })
}

async fn drive<S>(
    mut io: S,
    engine: SharedHttp2,
    conn: Arc<Connection>,
    server: Arc<Server>,
    waiter: crate::sync::event::Waiter,
    token: CancellationToken,
    inner: Arc<DriverShared>,
) where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let mut read_buf = vec![0u8; 16 * 1024];

    loop {
        // Flush whatever the engine has queued before parking.
        let egress = {
            let mut engine = engine.lock().await;
            engine.take_egress()
        };
        if !egress.is_empty() && io.write_all(&egress).await.is_err() {
            break;
        }

        let closed = { engine.lock().await.is_closed() };
        if closed {
            let _ = io.flush().await;
            break;
        }

        let read_timeout = inner.timeout_read.load(std::sync::atomic::Ordering::Relaxed);
        select! {
            res = tokio::time::timeout(read_timeout, io.read(&mut read_buf)) => {
                match res {
                    Ok(Ok(0)) | Ok(Err(_)) | Err(_) => break,
                    Ok(Ok(n)) => {
                        let mut engine = engine.lock().await;
                        engine.on_read(&read_buf[..n]);
                    }
                }
            }
            // Q2 unblocks and cut-through activations land here.
            res = waiter.wait() => {
                if res.is_err() {
                    break;
                }
                let mut engine = engine.lock().await;
                engine.on_wake();
            }
            _ = token.cancelled() => break,
        }
    }

    // Tear-down: invalidate safe references first, then release every
    // pending delivery.
    conn.close(&server);
    {
        let mut engine = engine.lock().await;
        engine.shutdown();
        let egress = engine.take_egress();
        drop(engine);
        if !egress.is_empty() {
            let _ = io.write_all(&egress).await;
        }
    }
    let _ = io.shutdown().await;
    debug!("[C{}] connection task finished", conn.identity);
}
