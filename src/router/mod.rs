//! Path router.
//!
//! Routes are matched in registration order. Every route whose pattern
//! matches the path is recorded in `ctx.matched`; the routes that also
//! accept the request method run as one chain, each preceded by a step that
//! binds its parameters:
//!
//! ```text
//! bind(route 1) ─► route 1 stack ─► bind(route 2) ─► route 2 stack ─► next
//! ```
//!
//! A handler that does not call `next` therefore ends routing. When nothing
//! matches both path and method, the router calls `next` straight away so
//! [`allowed_methods`](Router::allowed_methods) (or a later middleware) can
//! answer.
//!
//! The route table sits behind an [`ArcSwap`]: the middleware returned by
//! [`routes`](Router::routes) reads it lock-free, and routes registered after
//! `routes()` was called are still seen.

mod layer;
mod pattern;

use std::any::Any;
use std::sync::Arc;

use arc_swap::ArcSwap;
use http::header::{HeaderValue, ALLOW};

pub use layer::{Layer, RouteOptions, UrlOptions};
pub use pattern::PatternError;

use crate::context::Context;
use crate::error::{Error, HttpError, Result};
use crate::method::Method;
use crate::middleware::{BoxFuture, BoxedMiddleware, Middleware, Next};
use crate::status::Status;
use crate::util::decode_component;
use pattern::MatchOptions;

/// Router-wide options.
#[derive(Clone, Debug, Default)]
pub struct RouterOptions {
    /// Prepended to every route.
    pub prefix: Option<String>,
    pub sensitive: bool,
    pub strict: bool,
    /// Methods [`allowed_methods`](Router::allowed_methods) treats as
    /// implemented. Defaults to DELETE, GET, HEAD, OPTIONS, PATCH, POST and
    /// PUT.
    pub methods: Option<Vec<Method>>,
    /// Match against this path instead of the request's.
    pub router_path: Option<String>,
}

#[derive(Clone, Default)]
struct RouteTable {
    layers: Vec<Arc<Layer>>,
    params: Vec<(String, BoxedMiddleware)>,
    options: RouterOptions,
}

/// The routes matching one path and method.
#[derive(Clone, Debug, Default)]
pub struct RouteMatch {
    /// Every route whose pattern matches the path.
    pub path: Vec<Arc<Layer>>,
    /// The subset that also accepts the method, mounts included.
    pub path_and_method: Vec<Arc<Layer>>,
    /// Whether a route declaring methods matched both path and method.
    pub route: bool,
}

impl RouteTable {
    fn matches(&self, path: &str, method: Method) -> RouteMatch {
        let mut matches = RouteMatch::default();
        for layer in self.layers.iter().filter(|layer| layer.is_match(path)) {
            matches.path.push(Arc::clone(layer));
            if layer.methods().is_empty() || layer.methods().contains(&method) {
                matches.path_and_method.push(Arc::clone(layer));
                if !layer.methods().is_empty() {
                    matches.route = true;
                }
            }
        }
        matches
    }

    fn register(&mut self, path: &str, methods: &[Method], stack: Vec<BoxedMiddleware>, options: RouteOptions) {
        let match_options = MatchOptions {
            sensitive: options.sensitive.unwrap_or(self.options.sensitive),
            strict: options.strict.unwrap_or(self.options.strict),
            end: options.end,
        };
        let layer = Layer::new(path, methods, stack, options.name, match_options, options.ignore_captures);
        self.adopt(layer);
    }

    /// Applies the router prefix and param middleware to `layer` and appends it.
    fn adopt(&mut self, mut layer: Layer) {
        if let Some(prefix) = &self.options.prefix {
            layer.set_prefix(prefix);
        }
        for (param, middleware) in &self.params {
            layer.param(param, Arc::clone(middleware));
        }
        self.layers.push(Arc::new(layer));
    }

    fn route(&self, name: &str) -> Option<&Arc<Layer>> {
        self.layers.iter().find(|layer| layer.name() == Some(name))
    }
}

// ── Router ────────────────────────────────────────────────────────────────────

/// The application router.
///
/// Builder methods take and return `self` so registrations chain:
///
/// ```rust
/// use grove::{handler, Router};
///
/// let router = Router::new()
///     .get("/", handler(|ctx| Box::pin(async move { ctx.response.set_body("home") })))
///     .get_named("user", "/users/:id", handler(|ctx| {
///         Box::pin(async move {
///             let id = ctx.param("id").unwrap_or_default().to_owned();
///             ctx.response.set_body(format!("user {id}"))
///         })
///     }));
///
/// assert_eq!(router.url("user", &[("id", "7")], &Default::default()).unwrap(), "/users/7");
/// ```
#[derive(Clone)]
pub struct Router {
    table: Arc<ArcSwap<RouteTable>>,
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

macro_rules! verbs {
    ($($verb:ident, $named:ident => [$($method:ident),+];)+) => {
        $(
            #[doc = concat!("Registers `middleware` for `", stringify!($verb), "` requests to `path`.")]
            pub fn $verb(self, path: &str, middleware: impl Middleware) -> Self {
                self.route(&[$(Method::$method),+], &[path], vec![Arc::new(middleware)], RouteOptions::default())
            }

            #[doc = concat!("Like [`", stringify!($verb), "`](Self::", stringify!($verb), "), naming the route for [`url`](Self::url).")]
            pub fn $named(self, name: &str, path: &str, middleware: impl Middleware) -> Self {
                self.route(&[$(Method::$method),+], &[path], vec![Arc::new(middleware)], RouteOptions::default().name(name))
            }
        )+
    };
}

impl Router {
    pub fn new() -> Self {
        Self::with_options(RouterOptions::default())
    }

    pub fn with_options(mut options: RouterOptions) -> Self {
        options.prefix = options.prefix.map(|p| p.trim_end_matches('/').to_owned());
        let table = RouteTable { options, ..RouteTable::default() };
        Self { table: Arc::new(ArcSwap::from_pointee(table)) }
    }

    fn update(&self, f: impl Fn(&mut RouteTable)) {
        self.table.rcu(|table| {
            let mut table = RouteTable::clone(table);
            f(&mut table);
            table
        });
    }

    verbs! {
        get,     get_named     => [Get];
        post,    post_named    => [Post];
        put,     put_named     => [Put];
        patch,   patch_named   => [Patch];
        delete,  delete_named  => [Delete];
        head,    head_named    => [Head];
        options, options_named => [Options];
        all,     all_named     => [Delete, Get, Post, Put];
    }

    /// Registers a middleware stack for `methods` on every path in `paths`.
    ///
    /// # Panics
    ///
    /// When a path is not a valid pattern.
    pub fn route(self, methods: &[Method], paths: &[&str], stack: Vec<BoxedMiddleware>, options: RouteOptions) -> Self {
        self.update(|table| {
            for path in paths {
                table.register(path, methods, stack.clone(), options.clone());
            }
        });
        self
    }

    /// Runs `middleware` for every request that reaches the router, whatever
    /// its path or method.
    pub fn with(self, middleware: impl Middleware) -> Self {
        let options = RouteOptions::default().end(false).ignore_captures(true);
        self.route(&[], &["(.*)"], vec![Arc::new(middleware)], options)
    }

    /// Runs `middleware` for every request whose path starts with `path`.
    ///
    /// When `middleware` is another router's [`routes`](Self::routes), its
    /// routes are copied into this router with `path` prepended, so a nested
    /// `/status` mounted at `/api` answers `/api/status`. Routes added to the
    /// nested router afterwards are not picked up.
    ///
    /// ```rust
    /// use grove::{handler, Router};
    ///
    /// let api = Router::new().get("/status", handler(|ctx| Box::pin(async move { ctx.response.set_body("up") })));
    /// let router = Router::new().mount("/api", api.routes());
    /// assert_eq!(router.layers()[0].path(), "/api/status");
    /// ```
    pub fn mount(self, path: &str, middleware: impl Middleware) -> Self {
        if let Some(routes) = (&middleware as &dyn Any).downcast_ref::<Routes>() {
            let nested = routes.table.load_full();
            let path = path.trim_end_matches('/');
            self.update(|table| {
                for layer in &nested.layers {
                    let mut layer = Layer::clone(layer);
                    if !path.is_empty() {
                        layer.set_prefix(path);
                    }
                    table.adopt(layer);
                }
            });
            return self;
        }
        self.route(&[], &[path], vec![Arc::new(middleware)], RouteOptions::default().end(false))
    }

    /// Runs `f` with the value of parameter `name` before the stack of every
    /// route that has that parameter, current and future.
    ///
    /// ```rust
    /// use grove::{handler, HttpError, Router};
    ///
    /// let router = Router::new()
    ///     .param("id", |id, ctx, next| {
    ///         Box::pin(async move {
    ///             if id.parse::<u64>().is_err() {
    ///                 return Err(HttpError::bad_request("ids are numeric").into());
    ///             }
    ///             next.run(ctx).await
    ///         })
    ///     })
    ///     .get("/users/:id", handler(|ctx| Box::pin(async move { ctx.response.set_body("ok") })));
    /// ```
    pub fn param<F>(self, name: &str, f: F) -> Self
    where
        F: for<'a> Fn(String, &'a mut Context, Next<'a>) -> BoxFuture<'a, Result<()>> + Send + Sync + 'static,
    {
        let middleware: BoxedMiddleware = Arc::new(ParamMiddleware { name: name.to_owned(), f });
        self.update(|table| {
            match table.params.iter_mut().find(|(param, _)| param == name) {
                Some((_, existing)) => *existing = Arc::clone(&middleware),
                None => table.params.push((name.to_owned(), Arc::clone(&middleware))),
            }
            for layer in &mut table.layers {
                let mut updated = Layer::clone(layer);
                updated.param(name, Arc::clone(&middleware));
                *layer = Arc::new(updated);
            }
        });
        self
    }

    /// Prefixes every route, current and future. A trailing `/` is dropped.
    pub fn prefix(self, prefix: &str) -> Self {
        let prefix = prefix.trim_end_matches('/').to_owned();
        self.update(|table| {
            table.options.prefix = Some(prefix.clone());
            for layer in &mut table.layers {
                let mut updated = Layer::clone(layer);
                updated.set_prefix(&prefix);
                *layer = Arc::new(updated);
            }
        });
        self
    }

    /// Redirects `source` to `destination` for DELETE, GET, POST and PUT.
    /// Either may be a route name instead of a path, and `destination` may
    /// also be an absolute URL.
    ///
    /// # Panics
    ///
    /// When a name does not resolve to a route without parameters.
    pub fn redirect(self, source: &str, destination: &str, status: Status) -> Self {
        let resolve = |target: &str, absolute: bool| {
            if target.starts_with('/') {
                return target.to_owned();
            }
            match self.url(target, &[], &UrlOptions::default()) {
                Ok(url) => url,
                Err(_) if absolute && url::Url::parse(target).is_ok() => target.to_owned(),
                Err(e) => panic!("could not resolve named route \"{target}\": {e}"),
            }
        };
        let source = resolve(source, false);
        let destination = resolve(destination, true);

        let redirect = Redirect { destination, status };
        self.all(&source, redirect)
    }

    /// Builds the URL of the route named `name`.
    pub fn url(&self, name: &str, params: &[(&str, &str)], options: &UrlOptions) -> Result<String> {
        let table = self.table.load();
        let layer = table.route(name).ok_or_else(|| Error::RouteNotFound(name.to_owned()))?;
        layer.url(params, options)
    }

    /// Builds a URL from a pattern without registering it.
    ///
    /// ```rust
    /// use grove::router::UrlOptions;
    /// use grove::Router;
    ///
    /// let url = Router::url_for("/books/:id", &[("id", "12")], &UrlOptions::default().query("ref", "home"));
    /// assert_eq!(url.unwrap(), "/books/12?ref=home");
    /// ```
    pub fn url_for(path: &str, params: &[(&str, &str)], options: &UrlOptions) -> Result<String> {
        layer::build_url(path, params, options)
    }

    /// The routes matching `path` for `method`, as dispatch sees them.
    pub fn matches(&self, path: &str, method: Method) -> RouteMatch {
        self.table.load().matches(path, method)
    }

    /// The registered routes, in matching order.
    pub fn layers(&self) -> Vec<Arc<Layer>> {
        self.table.load().layers.clone()
    }

    /// The middleware that dispatches requests to the routes.
    pub fn routes(&self) -> Routes {
        Routes { table: Arc::clone(&self.table) }
    }

    /// Middleware answering `OPTIONS`, `405 Method Not Allowed` and
    /// `501 Not Implemented` for paths the router knows. Install it after
    /// [`routes`](Self::routes).
    pub fn allowed_methods(&self, options: AllowedMethodsOptions) -> AllowedMethods {
        let implemented = self.table.load().options.methods.clone().unwrap_or_else(|| Method::ROUTED.to_vec());
        AllowedMethods { implemented, options }
    }
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router").field("layers", &self.table.load().layers).finish()
    }
}

// ── Dispatch ──────────────────────────────────────────────────────────────────

/// Dispatching middleware returned by [`Router::routes`].
pub struct Routes {
    table: Arc<ArcSwap<RouteTable>>,
}

impl Middleware for Routes {
    fn call<'a>(&'a self, ctx: &'a mut Context, next: Next<'a>) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let table = self.table.load_full();
            let path = match table.options.router_path.clone().or_else(|| ctx.router_path.clone()) {
                Some(path) => path,
                None => decode_component(ctx.request.url.path()).into_owned(),
            };

            let matches = table.matches(&path, ctx.request.method);
            ctx.matched.extend(matches.path.iter().cloned());
            if matches.path_and_method.is_empty() {
                return next.run(ctx).await;
            }

            let chain: Vec<BoxedMiddleware> = matches
                .path_and_method
                .into_iter()
                .flat_map(|layer| {
                    let stack: Vec<BoxedMiddleware> = layer.middleware().cloned().collect();
                    let bind: BoxedMiddleware = Arc::new(Bind { layer, path: path.clone() });
                    std::iter::once(bind).chain(stack)
                })
                .collect();

            Next::new(&chain, Some(next)).run(ctx).await
        })
    }
}

/// Binds a matched route's captures and parameters to the context.
struct Bind {
    layer: Arc<Layer>,
    path: String,
}

impl Middleware for Bind {
    fn call<'a>(&'a self, ctx: &'a mut Context, next: Next<'a>) -> BoxFuture<'a, Result<()>> {
        ctx.captures = self.layer.captures(&self.path);
        self.layer.params(&ctx.captures, &mut ctx.params);
        ctx.route_name = self.layer.name().map(str::to_owned);
        next.run(ctx)
    }
}

struct ParamMiddleware<F> {
    name: String,
    f: F,
}

impl<F> Middleware for ParamMiddleware<F>
where
    F: for<'a> Fn(String, &'a mut Context, Next<'a>) -> BoxFuture<'a, Result<()>> + Send + Sync + 'static,
{
    fn call<'a>(&'a self, ctx: &'a mut Context, next: Next<'a>) -> BoxFuture<'a, Result<()>> {
        match ctx.params.get(&self.name).cloned() {
            Some(value) => (self.f)(value, ctx, next),
            None        => next.run(ctx),
        }
    }
}

struct Redirect {
    destination: String,
    status: Status,
}

impl Middleware for Redirect {
    fn call<'a>(&'a self, ctx: &'a mut Context, _next: Next<'a>) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            ctx.redirect(&self.destination)?;
            ctx.response.set_status(self.status)
        })
    }
}

// ── Allowed methods ───────────────────────────────────────────────────────────

/// Builds the error thrown by [`AllowedMethods`] in `throw` mode.
pub type ErrorFactory = Arc<dyn Fn() -> HttpError + Send + Sync>;

/// Options for [`Router::allowed_methods`].
#[derive(Clone, Default)]
pub struct AllowedMethodsOptions {
    /// Return errors instead of setting the status.
    pub throw: bool,
    pub not_implemented: Option<ErrorFactory>,
    pub method_not_allowed: Option<ErrorFactory>,
}

impl AllowedMethodsOptions {
    pub fn throw(mut self, throw: bool) -> Self {
        self.throw = throw;
        self
    }

    pub fn not_implemented(mut self, factory: impl Fn() -> HttpError + Send + Sync + 'static) -> Self {
        self.not_implemented = Some(Arc::new(factory));
        self
    }

    pub fn method_not_allowed(mut self, factory: impl Fn() -> HttpError + Send + Sync + 'static) -> Self {
        self.method_not_allowed = Some(Arc::new(factory));
        self
    }
}

impl std::fmt::Debug for AllowedMethodsOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AllowedMethodsOptions")
            .field("throw", &self.throw)
            .field("not_implemented", &self.not_implemented.is_some())
            .field("method_not_allowed", &self.method_not_allowed.is_some())
            .finish()
    }
}

/// Middleware returned by [`Router::allowed_methods`].
pub struct AllowedMethods {
    implemented: Vec<Method>,
    options: AllowedMethodsOptions,
}

impl Middleware for AllowedMethods {
    fn call<'a>(&'a self, ctx: &'a mut Context, next: Next<'a>) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            next.run(ctx).await?;
            if ctx.response.status() != Status::NotFound {
                return Ok(());
            }

            let mut allowed: Vec<Method> = Vec::new();
            for method in ctx.matched.iter().flat_map(|layer| layer.methods()) {
                if !allowed.contains(method) {
                    allowed.push(*method);
                }
            }
            let allow = allowed.iter().map(|m| m.as_str()).collect::<Vec<_>>().join(", ");
            let allow = HeaderValue::from_str(&allow).map_err(|e| Error::Protocol(e.to_string()))?;
            let method = ctx.request.method;

            if !self.implemented.contains(&method) {
                if self.options.throw {
                    let error = self.options.not_implemented.as_ref().map_or_else(HttpError::not_implemented, |f| f());
                    return Err(error.into());
                }
                ctx.response.set_status(Status::NotImplemented)?;
                ctx.response.headers_mut()?.insert(ALLOW, allow);
            } else if !allowed.is_empty() {
                if method == Method::Options {
                    ctx.response.set_status(Status::Ok)?;
                    ctx.response.headers_mut()?.insert(ALLOW, allow);
                } else if !allowed.contains(&method) {
                    if self.options.throw {
                        let error = match &self.options.method_not_allowed {
                            Some(factory) => factory(),
                            None => HttpError::method_not_allowed().with_header(ALLOW, allow),
                        };
                        return Err(error.into());
                    }
                    ctx.response.set_status(Status::MethodNotAllowed)?;
                    ctx.response.headers_mut()?.insert(ALLOW, allow);
                }
            }
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::handler::handler;
    use crate::middleware::{compose, from_fn};
    use crate::request::Request;

    fn context(method: Method, path: &str) -> Context {
        Context::new(Request::new(method, path).unwrap())
    }

    fn reply(text: &'static str) -> impl Middleware {
        handler(move |ctx| Box::pin(async move { ctx.response.set_body(text) }))
    }

    async fn dispatch(router: &Router, ctx: &mut Context) {
        let chain = compose(vec![Arc::new(router.allowed_methods(Default::default())), Arc::new(router.routes())]);
        chain.dispatch(ctx).await.unwrap();
    }

    async fn body_of(ctx: &mut Context) -> String {
        let response = ctx.response.to_server_response().await.unwrap();
        match response.body {
            crate::http1::WireBody::Bytes(bytes) => String::from_utf8(bytes.to_vec()).unwrap(),
            other => panic!("unexpected body {other:?}"),
        }
    }

    #[tokio::test]
    async fn first_registered_route_wins() {
        let router = Router::new().get("/users/:id", reply("by id")).get("/users/me", reply("me"));
        let mut ctx = context(Method::Get, "/users/me");
        dispatch(&router, &mut ctx).await;
        assert_eq!(body_of(&mut ctx).await, "by id");
    }

    #[tokio::test]
    async fn params_and_route_name_are_bound() {
        let router = Router::new().get_named(
            "user",
            "/users/:id",
            handler(|ctx| {
                Box::pin(async move {
                    let id = ctx.param("id").unwrap_or_default().to_owned();
                    ctx.response.set_body(id)
                })
            }),
        );
        let mut ctx = context(Method::Get, "/users/42");
        dispatch(&router, &mut ctx).await;

        assert_eq!(ctx.route_name.as_deref(), Some("user"));
        assert_eq!(ctx.captures, [Some("42".to_owned())]);
        assert_eq!(body_of(&mut ctx).await, "42");
    }

    #[tokio::test]
    async fn param_handlers_run_before_route_handlers() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&seen);
        let router = Router::new()
            .get("/users/:id", reply("user"))
            .param("id", move |id, ctx, next| {
                log.lock().unwrap().push(format!("param {id}"));
                Box::pin(async move { next.run(ctx).await })
            });

        let mut ctx = context(Method::Get, "/users/42");
        dispatch(&router, &mut ctx).await;

        assert_eq!(*seen.lock().unwrap(), ["param 42"]);
        assert_eq!(body_of(&mut ctx).await, "user");
    }

    #[tokio::test]
    async fn head_is_served_by_get_routes() {
        let router = Router::new().get("/", reply("home"));
        let mut ctx = context(Method::Head, "/");
        dispatch(&router, &mut ctx).await;
        assert_eq!(ctx.response.status(), Status::Ok);
    }

    #[tokio::test]
    async fn unmatched_methods_get_405_with_allow() {
        let router = Router::new().get("/items", reply("list")).post("/items", reply("created"));
        let mut ctx = context(Method::Delete, "/items");
        dispatch(&router, &mut ctx).await;

        assert_eq!(ctx.response.status(), Status::MethodNotAllowed);
        assert_eq!(ctx.response.header("allow"), Some("HEAD, GET, POST"));
    }

    #[tokio::test]
    async fn options_lists_allowed_methods() {
        let router = Router::new().put("/items/:id", reply("put"));
        let mut ctx = context(Method::Options, "/items/1");
        dispatch(&router, &mut ctx).await;

        assert_eq!(ctx.response.status(), Status::Ok);
        assert_eq!(ctx.response.header("allow"), Some("PUT"));
    }

    #[tokio::test]
    async fn unimplemented_methods_get_501() {
        let router = Router::new().get("/", reply("home"));
        let mut ctx = context(Method::Trace, "/");
        dispatch(&router, &mut ctx).await;
        assert_eq!(ctx.response.status(), Status::NotImplemented);

        let chain = compose(vec![
            Arc::new(router.allowed_methods(AllowedMethodsOptions::default().throw(true))),
            Arc::new(router.routes()),
        ]);
        let err = chain.dispatch(&mut context(Method::Trace, "/")).await.unwrap_err();
        assert_eq!(err.status(), Status::NotImplemented);
    }

    #[tokio::test]
    async fn unknown_paths_fall_through() {
        let reached = Arc::new(Mutex::new(false));
        let flag = Arc::clone(&reached);
        let fallback: BoxedMiddleware = Arc::new(from_fn(move |_ctx, _next| {
            *flag.lock().unwrap() = true;
            Box::pin(async { Ok(()) })
        }));
        let router = Router::new().get("/", reply("home"));
        let chain = compose(vec![Arc::new(router.routes()), fallback]);

        let mut ctx = context(Method::Get, "/missing");
        chain.dispatch(&mut ctx).await.unwrap();
        assert!(*reached.lock().unwrap());
        assert_eq!(ctx.response.status(), Status::NotFound);
    }

    #[tokio::test]
    async fn prefixes_apply_to_existing_and_new_routes() {
        let router = Router::new().get("/a", reply("a")).prefix("/v1/").get("/b", reply("b"));
        let paths: Vec<_> = router.layers().iter().map(|l| l.path().to_owned()).collect();
        assert_eq!(paths, ["/v1/a", "/v1/b"]);

        let mut ctx = context(Method::Get, "/v1/b");
        dispatch(&router, &mut ctx).await;
        assert_eq!(body_of(&mut ctx).await, "b");
    }

    #[tokio::test]
    async fn nested_routers_are_mounted_under_the_path() {
        let api = Router::new().get("/status", reply("up")).get("/", reply("index"));
        let router = Router::new().mount("/api/", api.routes());
        let paths: Vec<_> = router.layers().iter().map(|l| l.path().to_owned()).collect();
        assert_eq!(paths, ["/api/status", "/api"]);

        let mut ctx = context(Method::Get, "/api/status");
        dispatch(&router, &mut ctx).await;
        assert_eq!(body_of(&mut ctx).await, "up");

        let mut ctx = context(Method::Get, "/api");
        dispatch(&router, &mut ctx).await;
        assert_eq!(body_of(&mut ctx).await, "index");

        let mut ctx = context(Method::Get, "/status");
        dispatch(&router, &mut ctx).await;
        assert_eq!(ctx.response.status(), Status::NotFound);
    }

    #[tokio::test]
    async fn mounted_routes_take_the_outer_prefix_and_params() {
        let api = Router::new().get("/users/:id", handler(|ctx| {
            Box::pin(async move {
                let id = ctx.param("id").unwrap_or_default().to_owned();
                ctx.response.set_body(id)
            })
        }));
        let router = Router::new()
            .prefix("/v1")
            .param("id", |id, ctx, next| {
                Box::pin(async move {
                    ctx.response.set_header("x-seen-id", &id)?;
                    next.run(ctx).await
                })
            })
            .mount("/api", api.routes());
        assert_eq!(router.layers()[0].path(), "/v1/api/users/:id");

        let mut ctx = context(Method::Get, "/v1/api/users/42");
        dispatch(&router, &mut ctx).await;
        assert_eq!(ctx.response.header("x-seen-id"), Some("42"));
        assert_eq!(body_of(&mut ctx).await, "42");
    }

    #[test]
    fn matches_report_path_and_method_views() {
        let router = Router::new()
            .with(reply("log"))
            .get("/items/:id", reply("get"))
            .post("/items/:id", reply("post"))
            .get("/other", reply("other"));
        let methods = |layers: &[Arc<Layer>]| layers.iter().map(|l| l.methods().to_vec()).collect::<Vec<_>>();

        let found = router.matches("/items/3", Method::Post);
        assert_eq!(methods(&found.path), [vec![], vec![Method::Head, Method::Get], vec![Method::Post]]);
        assert_eq!(methods(&found.path_and_method), [vec![], vec![Method::Post]]);
        assert!(found.route);

        let found = router.matches("/items/3", Method::Delete);
        assert_eq!(found.path.len(), 3);
        assert_eq!(methods(&found.path_and_method), [Vec::<Method>::new()]);
        assert!(!found.route);

        let found = router.matches("/nowhere", Method::Get);
        assert_eq!(found.path.len(), 1);
        assert_eq!(found.path_and_method.len(), 1);
        assert!(!found.route);
    }

    #[tokio::test]
    async fn redirects_resolve_route_names() {
        let router = Router::new()
            .get_named("new", "/new-home", reply("new"))
            .redirect("/old-home", "new", Status::MovedPermanently);

        let mut ctx = context(Method::Get, "/old-home");
        dispatch(&router, &mut ctx).await;
        assert_eq!(ctx.response.status(), Status::MovedPermanently);
        assert_eq!(ctx.response.header("location"), Some("/new-home"));
    }

    #[tokio::test]
    async fn redirects_accept_absolute_urls() {
        let router = Router::new().redirect("/docs", "https://docs.example.com/guide", Status::Found);

        let mut ctx = context(Method::Get, "/docs");
        dispatch(&router, &mut ctx).await;
        assert_eq!(ctx.response.status(), Status::Found);
        assert_eq!(ctx.response.header("location"), Some("https://docs.example.com/guide"));
    }

    #[test]
    fn unknown_route_names_are_errors() {
        let err = Router::new().url("nope", &[], &UrlOptions::default()).unwrap_err();
        assert!(matches!(err, Error::RouteNotFound(name) if name == "nope"));
    }
}
