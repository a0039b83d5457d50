//! The application: middleware registration, the serve loop and error
//! handling.
//!
//! ```text
//!  Server::next ──► spawn ──► Context ──► composed chain ──► Response
//!                                              │ Err / panic      │
//!                                              ▼                  ▼
//!                                        error page ──────► ServerResponse ──► Responder
//! ```
//!
//! Each request runs in its own task. The composed chain is built once and
//! shared by every task until [`Application::with`] adds middleware.

use std::any::Any;
use std::fmt;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::str::FromStr;
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use futures_util::FutureExt;
use http::header::{HeaderValue, CONTENT_TYPE};
use http::{Extensions, HeaderMap};
use once_cell::sync::Lazy;
use regex::Regex;
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tracing::{debug, error, info, info_span, Instrument};

use crate::connection::ServerRequest;
use crate::context::Context;
use crate::error::{Error, Result};
use crate::http1::{ServerResponse, WireBody};
use crate::middleware::{compose, BoxedMiddleware, Compose, Middleware};
use crate::request::Request;
use crate::server::{Listener, Server, ServerConfig};
use crate::shutdown::ShutdownSignal;

static ADDR: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\[?([^\]]*)\]?:([0-9]{1,5})$").unwrap_or_else(|e| panic!("address pattern: {e}"))
});

// ── Events ────────────────────────────────────────────────────────────────────

/// Dispatched for every error that reaches the application.
#[derive(Debug)]
pub struct ErrorEvent<'a> {
    pub message: String,
    pub error: &'a Error,
    /// The request being handled, when the error belongs to one.
    pub context: Option<&'a Context>,
}

/// Dispatched once the server is accepting connections.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ListenEvent {
    pub hostname: String,
    pub port: u16,
    pub secure: bool,
}

type ErrorListener = Arc<dyn Fn(&ErrorEvent<'_>) + Send + Sync>;
type ListenListener = Arc<dyn Fn(&ListenEvent) + Send + Sync>;

// ── ListenOptions ─────────────────────────────────────────────────────────────

/// Where to listen, and when to stop.
///
/// ```rust
/// use grove::ListenOptions;
///
/// let options: ListenOptions = "127.0.0.1:8000".parse().unwrap();
/// assert_eq!((options.hostname.as_str(), options.port), ("127.0.0.1", 8000));
///
/// let any: ListenOptions = ":8080".parse().unwrap();
/// assert_eq!(any.hostname, "0.0.0.0");
/// ```
#[derive(Clone, Debug)]
pub struct ListenOptions {
    pub hostname: String,
    pub port: u16,
    /// Graceful shutdown starts when this fires.
    pub signal: Option<ShutdownSignal>,
}

impl ListenOptions {
    pub fn new(port: u16) -> Self {
        Self { hostname: "0.0.0.0".to_owned(), port, signal: None }
    }

    pub fn hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = hostname.into();
        self
    }

    pub fn signal(mut self, signal: ShutdownSignal) -> Self {
        self.signal = Some(signal);
        self
    }
}

impl FromStr for ListenOptions {
    type Err = Error;

    fn from_str(addr: &str) -> Result<Self> {
        let invalid = || Error::InvalidAddress(addr.to_owned());
        let caps = ADDR.captures(addr).ok_or_else(invalid)?;
        let port = caps[2].parse::<u16>().map_err(|_| invalid())?;
        let hostname = match &caps[1] {
            "" => "0.0.0.0",
            host => host,
        };
        Ok(Self::new(port).hostname(hostname))
    }
}

// ── Application ───────────────────────────────────────────────────────────────

/// An HTTP application.
///
/// ```rust,no_run
/// use grove::{handler, Application, Router};
///
/// # async fn run() -> grove::Result<()> {
/// let router = Router::new().get(
///     "/",
///     handler(|ctx| Box::pin(async move { ctx.response.set_body("hello") })),
/// );
///
/// Application::new()
///     .with(router.routes())
///     .with(router.allowed_methods(Default::default()))
///     .listen("0.0.0.0:8000".parse()?)
///     .await
/// # }
/// ```
pub struct Application {
    middleware: Vec<BoxedMiddleware>,
    dispatcher: ArcSwapOption<Dispatcher>,
    proxy: bool,
    state: Extensions,
    config: ServerConfig,
    error_listeners: Vec<ErrorListener>,
    listen_listeners: Vec<ListenListener>,
}

impl Default for Application {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Application {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Application")
            .field("middleware", &self.middleware.len())
            .field("proxy", &self.proxy)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Application {
    pub fn new() -> Self {
        Self {
            middleware: Vec::new(),
            dispatcher: ArcSwapOption::empty(),
            proxy: false,
            state: Extensions::new(),
            config: ServerConfig::default(),
            error_listeners: Vec::new(),
            listen_listeners: Vec::new(),
        }
    }

    /// Appends middleware. Earlier middleware wraps later middleware.
    pub fn with(mut self, middleware: impl Middleware) -> Self {
        self.middleware.push(Arc::new(middleware));
        self.dispatcher.store(None);
        self
    }

    /// Trust `X-Forwarded-*` headers from a reverse proxy.
    pub fn proxy(mut self, proxy: bool) -> Self {
        self.proxy = proxy;
        self.dispatcher.store(None);
        self
    }

    /// A value every request's `ctx.state` starts out with.
    pub fn with_state<T: Clone + Send + Sync + 'static>(mut self, value: T) -> Self {
        self.state.insert(value);
        self.dispatcher.store(None);
        self
    }

    pub fn server_config(mut self, config: ServerConfig) -> Self {
        self.config = config;
        self
    }

    /// Called for every error that reaches the application, after it has
    /// been logged.
    pub fn on_error<F>(mut self, listener: F) -> Self
    where
        F: Fn(&ErrorEvent<'_>) + Send + Sync + 'static,
    {
        self.error_listeners.push(Arc::new(listener));
        self.dispatcher.store(None);
        self
    }

    pub fn on_listen<F>(mut self, listener: F) -> Self
    where
        F: Fn(&ListenEvent) + Send + Sync + 'static,
    {
        self.listen_listeners.push(Arc::new(listener));
        self
    }

    /// Binds a TCP listener and serves until the options' signal fires.
    pub async fn listen(&self, options: ListenOptions) -> Result<()> {
        let listener = TcpListener::bind((options.hostname.as_str(), options.port)).await?;
        self.serve(listener, options.signal).await
    }

    /// Serves requests from `listener` until `signal` fires and the requests
    /// in flight have been answered.
    ///
    /// A fatal accept error is reported, begins shutdown and is returned
    /// once the remaining connections have finished.
    pub async fn serve<L: Listener>(&self, listener: L, signal: Option<ShutdownSignal>) -> Result<()> {
        let dispatcher = self.dispatcher()?;
        let secure = listener.is_secure();
        let mut server = Server::new(listener, self.config.clone())?;
        self.emit_listen(server.local_addr(), secure);

        let mut signal = signal;
        let mut tasks = JoinSet::new();
        let mut result = Ok(());

        loop {
            let next = tokio::select! {
                biased;

                () = triggered(&mut signal), if !server.is_closing() => {
                    info!(in_flight = tasks.len(), "shutting down");
                    server.close();
                    continue;
                }

                Some(_) = tasks.join_next(), if !tasks.is_empty() => continue,

                next = server.next() => next,
            };

            match next {
                Some(Ok(request)) => {
                    let dispatcher = Arc::clone(&dispatcher);
                    let closing = server.is_closing();
                    let span = info_span!(
                        "request",
                        method = request.head.method.as_str(),
                        target = %request.head.target,
                        peer = %request.remote_addr
                    );
                    tasks.spawn(async move { dispatcher.serve_request(request, closing).await }.instrument(span));
                }
                Some(Err(e)) => {
                    let e = Error::Io(e);
                    dispatcher.report(&e, None);
                    server.close();
                    result = Err(e);
                }
                None => break,
            }
        }

        while tasks.join_next().await.is_some() {}
        info!("server closed");
        result
    }

    /// Runs `request` through the application without a connection.
    ///
    /// Returns `None` when a middleware set `ctx.respond` to `false`.
    pub async fn handle(&self, request: Request) -> Result<Option<ServerResponse>> {
        let dispatcher = self.dispatcher()?;
        let mut ctx = dispatcher.context(request.with_proxy(self.proxy));
        dispatcher.run(&mut ctx).await;
        if !ctx.respond {
            return Ok(None);
        }
        Ok(Some(dispatcher.finish(&mut ctx).await))
    }

    /// The composed chain, built on first use after a change.
    fn dispatcher(&self) -> Result<Arc<Dispatcher>> {
        if let Some(dispatcher) = self.dispatcher.load_full() {
            return Ok(dispatcher);
        }
        if self.middleware.is_empty() {
            return Err(Error::NoMiddleware);
        }
        let dispatcher = Arc::new(Dispatcher {
            chain: compose(self.middleware.clone()),
            proxy: self.proxy,
            state: self.state.clone(),
            error_listeners: self.error_listeners.clone(),
        });
        self.dispatcher.store(Some(Arc::clone(&dispatcher)));
        Ok(dispatcher)
    }

    fn emit_listen(&self, addr: SocketAddr, secure: bool) {
        let event = ListenEvent { hostname: addr.ip().to_string(), port: addr.port(), secure };
        info!(hostname = %event.hostname, port = event.port, secure, "listening");
        for listener in &self.listen_listeners {
            listener(&event);
        }
    }
}

async fn triggered(signal: &mut Option<ShutdownSignal>) {
    match signal {
        Some(signal) => signal.recv().await,
        None => std::future::pending().await,
    }
}

// ── Dispatcher ────────────────────────────────────────────────────────────────

/// What a request task needs from the application.
struct Dispatcher {
    chain: Compose,
    proxy: bool,
    state: Extensions,
    error_listeners: Vec<ErrorListener>,
}

impl Dispatcher {
    fn context(&self, request: Request) -> Context {
        let mut ctx = Context::new(request);
        ctx.state = self.state.clone();
        ctx
    }

    async fn serve_request(&self, request: ServerRequest, closing: bool) {
        let ServerRequest { head, remote_addr, secure, body, responder } = request;

        let mut request = match Request::from_head(head, remote_addr, secure, self.proxy) {
            Ok(request) => request,
            Err(e) => {
                self.report(&e, None);
                let response = fallback(&e);
                if let Err(e) = responder.respond(response, body).await {
                    debug!("failed to write response: {e}");
                }
                return;
            }
        };
        request.attach_body(body);

        let mut ctx = self.context(request);
        if !closing {
            self.run(&mut ctx).await;
        }
        if !ctx.respond {
            debug!("middleware took over the response");
            return;
        }

        let response = self.finish(&mut ctx).await;
        let status = response.status;
        let body = ctx.request.body.into_inner();
        match responder.respond(response, body).await {
            Ok(()) => debug!(status = status.code(), "request completed"),
            Err(e) => self.report(&Error::Io(e), None),
        }
    }

    /// Runs the chain, turning errors and panics into an error response.
    async fn run(&self, ctx: &mut Context) {
        let outcome = AssertUnwindSafe(self.chain.dispatch(ctx)).catch_unwind().await;
        let result = outcome.unwrap_or_else(|panic| Err(Error::Panic(panic_message(panic))));
        if let Err(e) = result {
            self.handle_error(e, ctx);
        }
    }

    /// Applies pending cookies and converts the response.
    async fn finish(&self, ctx: &mut Context) -> ServerResponse {
        match convert(ctx).await {
            Ok(response) => response,
            Err(e) => {
                self.handle_error(e, ctx);
                match convert(ctx).await {
                    Ok(response) => response,
                    Err(e) => {
                        self.report(&e, Some(ctx));
                        fallback(&e)
                    }
                }
            }
        }
    }

    fn handle_error(&self, error: Error, ctx: &mut Context) {
        self.report(&error, Some(ctx));
        if !ctx.response.is_writable() {
            return;
        }
        ctx.cookies.clear();
        ctx.response.set_error(&error);
    }

    /// Logs `error` and dispatches it to the error listeners.
    fn report(&self, error: &Error, context: Option<&Context>) {
        let status = error.status();
        if status.code() >= 500 {
            error!(status = status.code(), "{error}");
        } else {
            debug!(status = status.code(), "{error}");
        }
        let event = ErrorEvent { message: error.to_string(), error, context };
        for listener in &self.error_listeners {
            listener(&event);
        }
    }
}

async fn convert(ctx: &mut Context) -> Result<ServerResponse> {
    let headers = ctx.response.headers_mut()?;
    ctx.cookies.apply(headers)?;
    ctx.response.to_server_response().await
}

/// A bare error response for failures outside any context.
fn fallback(error: &Error) -> ServerResponse {
    let status = error.status();
    let message = match error {
        Error::Http(e) if e.expose => e.message.clone(),
        _ => status.reason().to_owned(),
    };
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=UTF-8"));
    ServerResponse { status, headers, body: WireBody::Bytes(message.into()) }
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    match panic.downcast::<String>() {
        Ok(message) => *message,
        Err(panic) => match panic.downcast::<&'static str>() {
            Ok(message) => (*message).to_owned(),
            Err(_) => "unknown panic".to_owned(),
        },
    }
}
