//! # grove
//!
//! An HTTP/1.x server core with onion-model middleware, a path router and a
//! streaming multipart decoder.
//!
//! ## The pieces
//!
//! - **Server**: accepts connections, reads requests off each one and fans
//!   them into a single stream. Keep-alive, chunked bodies and graceful
//!   shutdown live here.
//! - **Middleware**: every request runs through a chain of
//!   [`Middleware`](middleware::Middleware). Each step works on the
//!   [`Context`] and decides whether and when the rest of the chain runs.
//! - **Router**: path patterns (`/users/:id`, `/files/(.*)`), method
//!   matching, named routes and `Allow` negotiation, all as middleware.
//! - **Bodies**: requests are decoded on demand as JSON, forms, text, bytes
//!   or `multipart/form-data` with files spooled to disk.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use grove::{handler, Application, Router, Shutdown};
//!
//! #[tokio::main]
//! async fn main() -> grove::Result<()> {
//!     let router = Router::new()
//!         .get("/", handler(|ctx| Box::pin(async move {
//!             ctx.response.set_body(serde_json::json!({ "status": "success", "data": [] }))
//!         })))
//!         .get("/users/:id", handler(|ctx| Box::pin(async move {
//!             let id = ctx.param("id").unwrap_or_default().to_owned();
//!             ctx.response.set_body(format!("user {id}"))
//!         })));
//!
//!     let shutdown = Shutdown::new();
//!     shutdown.trigger_on_os_signal();
//!
//!     let options: grove::ListenOptions = "0.0.0.0:8000".parse()?;
//!     Application::new()
//!         .with(router.routes())
//!         .with(router.allowed_methods(Default::default()))
//!         .listen(options.signal(shutdown.subscribe()))
//!         .await
//! }
//! ```

mod application;
mod connection;
mod context;
mod cookies;
mod error;
mod handler;
mod http1;
mod method;
mod request;
mod response;
mod server;
mod shutdown;
mod status;
mod util;

pub mod body;
pub mod middleware;
pub mod mime;
pub mod multipart;
pub mod router;

pub use application::{Application, ErrorEvent, ListenEvent, ListenOptions};
pub use body::{Body, BodyOptions, BodyType, BodyValue, ContentTypes, Framing, RequestBody};
pub use connection::{Responder, ServerRequest};
pub use context::Context;
pub use cookies::{CookieOptions, Cookies, SameSite};
pub use error::{Error, HttpError, Result};
pub use handler::{handler, Handler};
pub use http1::{RequestHead, ServerResponse, WireBody};
pub use method::{Method, UnknownMethod};
pub use request::Request;
pub use response::{Producer, Response, ResponseBody};
pub use router::{Router, RouterOptions};
pub use server::{BoxedIo, Io, Listener, Server, ServerConfig};
pub use shutdown::{Shutdown, ShutdownSignal};
pub use status::Status;
