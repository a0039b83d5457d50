//! Connection acceptor and request multiplexer.
//!
//! A [`Server`] owns one acceptor task. The acceptor spawns a connection task
//! per accepted stream, and every connection task feeds parsed requests into
//! one bounded channel. The application pulls from that channel with
//! [`Server::next`] and never needs to know how many connections are open.
//!
//! ```text
//!  Listener ──accept──► acceptor ──spawn──► connection task ─┐
//!                                 ├──spawn──► connection task ─┼──► mpsc ──► Server::next
//!                                 └──spawn──► connection task ─┘
//! ```
//!
//! # Shutdown
//!
//! [`Server::close`]:
//! 1. Immediately stops `accept()`; no new connections are made.
//! 2. Closes idle connections (those waiting for their next request head).
//! 3. Lets every connection with a request in flight write its response.
//!
//! [`Server::next`] returns `None` once the last connection task is gone.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, ToSocketAddrs};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info};

use crate::connection::{serve_connection, ServerRequest};
use crate::shutdown::{Shutdown, ShutdownSignal};

// ── Transport ─────────────────────────────────────────────────────────────────

/// A bidirectional byte stream the server can speak HTTP/1.x over.
pub trait Io: AsyncRead + AsyncWrite + Send + Sync + Unpin {}

impl<T> Io for T where T: AsyncRead + AsyncWrite + Send + Sync + Unpin {}

/// A type-erased connection stream.
pub type BoxedIo = Box<dyn Io>;

/// Source of connections.
///
/// Implemented for [`TcpListener`]. A TLS listener implements it by
/// completing the handshake inside `accept` and returning the encrypted
/// stream; everything past `accept` treats both alike.
pub trait Listener: Send + 'static {
    fn accept(&mut self) -> impl Future<Output = io::Result<(BoxedIo, SocketAddr)>> + Send;

    fn local_addr(&self) -> io::Result<SocketAddr>;

    /// Whether accepted streams are encrypted. Drives `Request::secure`.
    fn is_secure(&self) -> bool {
        false
    }
}

impl Listener for TcpListener {
    async fn accept(&mut self) -> io::Result<(BoxedIo, SocketAddr)> {
        let (stream, peer) = TcpListener::accept(self).await?;
        stream.set_nodelay(true)?;
        let io: BoxedIo = Box::new(stream);
        Ok((io, peer))
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        TcpListener::local_addr(self)
    }
}

// ── Configuration ─────────────────────────────────────────────────────────────

/// Limits and buffer sizes for the acceptor and its connections.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Upper bound on the request line plus header block.
    pub max_head_bytes: usize,
    pub max_headers: usize,
    /// Capacity of each connection's read buffer.
    pub read_buffer: usize,
    /// Parsed requests waiting for the application before connections stall.
    pub queue_depth: usize,
    /// Open connections allowed at once; `None` is unbounded.
    pub max_connections: Option<usize>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_head_bytes: 64 * 1024,
            max_headers: 100,
            read_buffer: 8 * 1024,
            queue_depth: 128,
            max_connections: None,
        }
    }
}

impl ServerConfig {
    pub fn max_head_bytes(mut self, bytes: usize) -> Self {
        self.max_head_bytes = bytes;
        self
    }

    pub fn max_headers(mut self, count: usize) -> Self {
        self.max_headers = count;
        self
    }

    pub fn read_buffer(mut self, bytes: usize) -> Self {
        self.read_buffer = bytes;
        self
    }

    pub fn queue_depth(mut self, depth: usize) -> Self {
        self.queue_depth = depth;
        self
    }

    pub fn max_connections(mut self, limit: usize) -> Self {
        self.max_connections = Some(limit);
        self
    }
}

// ── Server ────────────────────────────────────────────────────────────────────

/// A running acceptor plus the stream of requests it produces.
///
/// Must be created inside a tokio runtime. Dropping the server closes it.
pub struct Server {
    requests: mpsc::Receiver<io::Result<ServerRequest>>,
    shutdown: Shutdown,
    local_addr: SocketAddr,
}

impl Server {
    /// Starts accepting on `listener`.
    pub fn new<L: Listener>(listener: L, config: ServerConfig) -> io::Result<Self> {
        let local_addr = listener.local_addr()?;
        let secure = listener.is_secure();
        let (tx, requests) = mpsc::channel(config.queue_depth.max(1));
        let shutdown = Shutdown::new();

        tokio::spawn(accept_loop(listener, tx, shutdown.subscribe(), Arc::new(config), secure));

        Ok(Self { requests, shutdown, local_addr })
    }

    /// Binds a TCP listener on `addr` and starts accepting.
    pub async fn bind(addr: impl ToSocketAddrs, config: ServerConfig) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Self::new(listener, config)
    }

    /// The next request from any connection.
    ///
    /// An `Err` item is a fatal accept error; the acceptor has stopped and
    /// the stream ends once in-flight connections finish.
    pub async fn next(&mut self) -> Option<io::Result<ServerRequest>> {
        self.requests.recv().await
    }

    /// Begins graceful shutdown. Idempotent.
    pub fn close(&self) {
        self.shutdown.trigger();
    }

    pub fn is_closing(&self) -> bool {
        self.shutdown.is_triggered()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.shutdown.trigger();
    }
}

/// Accept errors that only affect the connection being accepted.
fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::Interrupted
            | io::ErrorKind::InvalidData
            | io::ErrorKind::UnexpectedEof
    )
}

async fn accept_loop<L: Listener>(
    mut listener: L,
    requests: mpsc::Sender<io::Result<ServerRequest>>,
    mut closing: ShutdownSignal,
    config: Arc<ServerConfig>,
    secure: bool,
) {
    let limiter = config.max_connections.map(|n| Arc::new(Semaphore::new(n)));

    // Every connection task is tracked so shutdown can wait for all of them.
    let mut connections = JoinSet::new();

    loop {
        let permit = match &limiter {
            Some(limiter) => tokio::select! {
                biased;
                () = closing.recv() => break,
                permit = Arc::clone(limiter).acquire_owned() => match permit {
                    Ok(permit) => Some(permit),
                    Err(_) => break,
                },
            },
            None => None,
        };

        tokio::select! {
            // Shutdown is checked first so a close stops accepting even when
            // more connections are queued.
            biased;

            () = closing.recv() => break,

            accepted = listener.accept() => match accepted {
                Ok((io, peer)) => {
                    debug!(%peer, "connection accepted");
                    let requests = requests.clone();
                    let closing = closing.clone();
                    let config = Arc::clone(&config);
                    connections.spawn(async move {
                        serve_connection(io, peer, secure, requests, closing, config).await;
                        drop(permit);
                    });
                }
                Err(e) if is_transient(&e) => {
                    debug!("accept failed, continuing: {e}");
                }
                Err(e) => {
                    error!("accept failed, stopping: {e}");
                    let _ = requests.send(Err(e)).await;
                    break;
                }
            },

            // Reap finished connection tasks so the set does not grow without
            // bound on long-running servers.
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    }

    drop(listener);
    info!(in_flight = connections.len(), "acceptor stopped, draining connections");
    while connections.join_next().await.is_some() {}
    debug!("all connections closed");
}
