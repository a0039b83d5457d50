//! One task per connection: read a request, hand it to the application, write
//! the answer, repeat.
//!
//! ```text
//!            ┌──────────── keep-alive ────────────┐
//!            ▼                                    │
//!   read head ──► lend stream to Body ──► send ServerRequest ──► await Reply
//!                                                                   │
//!                  reclaim stream ◄── drain body ◄── write response ◄┘
//! ```
//!
//! The stream moves into the request's [`Body`] while the application owns
//! the request and comes back with the [`Reply`]. Requests on one connection
//! are therefore strictly sequential.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use http::header::{CONNECTION, HeaderValue};
use tokio::io::BufReader;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::body::framer::Body;
use crate::body::Framing;
use crate::http1::{self, RequestHead, ServerResponse};
use crate::server::{BoxedIo, ServerConfig};
use crate::shutdown::ShutdownSignal;
use crate::status::Status;

/// A parsed request waiting for the application.
///
/// The body still holds the connection; answer through the
/// [`Responder`] and hand the body back so the connection can be reused.
#[derive(Debug)]
pub struct ServerRequest {
    pub head: RequestHead,
    pub remote_addr: SocketAddr,
    pub secure: bool,
    pub body: Body,
    pub responder: Responder,
}

pub(crate) struct Reply {
    response: ServerResponse,
    body: Body,
    done: oneshot::Sender<io::Result<()>>,
}

/// The "done" signal of one request.
#[derive(Debug)]
pub struct Responder {
    tx: oneshot::Sender<Reply>,
}

impl Responder {
    /// Sends `response` and returns the request's `body` to its connection.
    /// Resolves once the response has been written, with the write result.
    ///
    /// Dropping a `Responder` without calling this closes the connection.
    pub async fn respond(self, response: ServerResponse, body: Body) -> io::Result<()> {
        let gone = || io::Error::new(io::ErrorKind::BrokenPipe, "connection closed before the response was written");
        let (done, written) = oneshot::channel();
        self.tx.send(Reply { response, body, done }).map_err(|_| gone())?;
        written.await.unwrap_or_else(|_| Err(gone()))
    }
}

impl std::fmt::Debug for Reply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reply").field("response", &self.response).finish_non_exhaustive()
    }
}

/// Serves requests on `io` until the peer leaves, a request asks to close,
/// an error occurs, or `closing` fires while the connection is idle.
pub(crate) async fn serve_connection(
    io: BoxedIo,
    peer: SocketAddr,
    secure: bool,
    requests: mpsc::Sender<io::Result<ServerRequest>>,
    mut closing: ShutdownSignal,
    config: Arc<ServerConfig>,
) {
    let mut conn = BufReader::with_capacity(config.read_buffer, io);
    let mut served = 0usize;

    loop {
        let head = tokio::select! {
            biased;

            () = closing.recv() => {
                debug!(%peer, "closing idle connection");
                break;
            }

            head = http1::read_head(&mut conn, &config) => head,
        };

        let head = match head {
            Ok(Some(head)) => head,
            Ok(None) => break,
            Err(e) => {
                match e.status() {
                    Some(status) => {
                        warn!(%peer, status = status.code(), "rejecting request: {e}");
                        let _ = http1::write_error(&mut conn, status, &e.to_string()).await;
                    }
                    None => debug!(%peer, "connection read failed: {e}"),
                }
                break;
            }
        };

        let framing = match Framing::from_headers(&head.headers) {
            Ok(framing) => framing,
            Err(e) => {
                warn!(%peer, "rejecting request: {e}");
                let _ = http1::write_error(&mut conn, Status::BadRequest, &e.to_string()).await;
                break;
            }
        };

        if head.expects_continue()
            && !matches!(framing, Framing::None | Framing::ContentLength(0))
            && http1::write_continue(&mut conn).await.is_err()
        {
            break;
        }

        let method = head.method;
        let version = head.version;
        let mut keep_alive = head.keep_alive();

        let (tx, rx) = oneshot::channel();
        let request = ServerRequest {
            head,
            remote_addr: peer,
            secure,
            body: Body::from_connection(conn, framing),
            responder: Responder { tx },
        };
        if requests.send(Ok(request)).await.is_err() {
            debug!(%peer, "request stream closed, dropping connection");
            break;
        }

        let Ok(Reply { mut response, mut body, done }) = rx.await else {
            debug!(%peer, "request finished without a response");
            break;
        };
        served += 1;

        if closing.is_triggered() || http1::connection_has(&response.headers, "close") {
            keep_alive = false;
        }
        if !keep_alive {
            response.headers.insert(CONNECTION, HeaderValue::from_static("close"));
        }

        let written = match body.connection_mut() {
            Some(conn) => http1::write_response(conn, response, method, version).await,
            None => Err(io::Error::new(io::ErrorKind::NotConnected, "response body is detached from its connection")),
        };
        let persist = matches!(written, Ok(true));
        let _ = done.send(written.map(|_| ()));
        if !persist || !keep_alive {
            break;
        }

        if let Err(e) = body.finalize().await {
            debug!(%peer, "failed to drain request body: {e}");
            break;
        }
        match body.into_connection() {
            Some(reclaimed) => conn = reclaimed,
            None => break,
        }
    }

    debug!(%peer, served, "connection closed");
}
