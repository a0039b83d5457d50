//! Per-request context.

use std::collections::HashMap;
use std::sync::Arc;

use http::header::REFERER;
use http::Extensions;

use crate::cookies::Cookies;
use crate::error::{HttpError, Result};
use crate::request::Request;
use crate::response::Response;
use crate::router::Layer;
use crate::status::Status;

/// Everything one request carries through the middleware chain.
///
/// The router fills in `params`, `captures`, `matched` and `route_name`.
/// `state` holds whatever earlier middleware wants to hand to later ones:
///
/// ```rust
/// use grove::middleware::from_fn;
///
/// #[derive(Clone)]
/// struct User(String);
///
/// let auth = from_fn(|ctx, next| {
///     Box::pin(async move {
///         let user = ctx.request.header("x-user").unwrap_or("anonymous").to_owned();
///         ctx.state.insert(User(user));
///         next.run(ctx).await
///     })
/// });
/// ```
#[derive(Debug)]
pub struct Context {
    pub request: Request,
    pub response: Response,
    pub cookies: Cookies,
    /// Decoded route parameters, merged across matched routes.
    pub params: HashMap<String, String>,
    /// Raw capture groups of the last bound route.
    pub captures: Vec<Option<String>>,
    /// Every route whose pattern matched the path, whatever its methods.
    pub matched: Vec<Arc<Layer>>,
    pub route_name: Option<String>,
    /// Overrides the path routers match against.
    pub router_path: Option<String>,
    pub state: Extensions,
    /// When `false` the application does not write a response; the
    /// middleware has taken over the connection's answer.
    pub respond: bool,
}

impl Context {
    pub fn new(request: Request) -> Self {
        let cookies = Cookies::new(&request.headers, request.secure);
        Self {
            request,
            response: Response::default(),
            cookies,
            params: HashMap::new(),
            captures: Vec::new(),
            matched: Vec::new(),
            route_name: None,
            router_path: None,
            state: Extensions::new(),
            respond: true,
        }
    }

    pub fn param(&self, name: &str) -> Option<&str> {
        self.params.get(name).map(String::as_str)
    }

    /// Fails with `status` and `message` unless `condition` holds.
    ///
    /// ```rust
    /// # use grove::{Context, Status};
    /// # fn check(ctx: &Context) -> grove::Result<()> {
    /// ctx.assert(ctx.request.header("authorization").is_some(), Status::Unauthorized, "login first")?;
    /// # Ok(()) }
    /// ```
    pub fn assert(&self, condition: bool, status: Status, message: &str) -> Result<()> {
        if condition { Ok(()) } else { self.throw(status, message) }
    }

    pub fn throw<T>(&self, status: Status, message: &str) -> Result<T> {
        Err(HttpError::new(status, message).into())
    }

    /// Redirects to `url`, with an HTML body when the client accepts HTML.
    pub fn redirect(&mut self, url: &str) -> Result<()> {
        let html = self.request.accepts(&["html"]).is_some();
        self.response.redirect(url, html)
    }

    /// Redirects to the `Referer`, or to `fallback` when there is none.
    pub fn redirect_back(&mut self, fallback: &str) -> Result<()> {
        let url = self.request.header(REFERER.as_str()).unwrap_or(fallback).to_owned();
        self.redirect(&url)
    }
}
