//! Onion-model middleware.
//!
//! Every middleware receives the request [`Context`] and a [`Next`]
//! continuation. Work done before `next.run(ctx).await` happens on the way
//! in, work after it on the way out:
//!
//! ```text
//!   M1 before ─► M2 before ─► handler ─► M2 after ─► M1 after
//! ```
//!
//! `Next::run` consumes the continuation, so a middleware cannot call the
//! rest of the chain twice. A middleware that returns without calling it
//! short-circuits everything downstream. Errors travel back up through the
//! `?` of every enclosing middleware until one handles them or the
//! application turns them into an error response.
//!
//! # How a chain is stored
//!
//! A chain is a slice of `Arc<dyn Middleware>` plus a cursor. Running `next`
//! splits the first element off the slice and hands it the rest; when the
//! slice is empty the optional continuation (the chain that composed this
//! one) runs instead. Nothing is allocated per step beyond the boxed future.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::context::Context;
use crate::error::Result;

pub use crate::handler::{handler, Handler};

/// A heap-allocated, type-erased future borrowing the request context.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// One step of request processing.
///
/// Closures become middleware through [`from_fn`]; handlers that never call
/// `next` through [`handler`]. Structs implement the trait directly:
///
/// ```rust
/// use grove::middleware::{BoxFuture, Middleware, Next};
/// use grove::{Context, Result};
///
/// struct PoweredBy(&'static str);
///
/// impl Middleware for PoweredBy {
///     fn call<'a>(&'a self, ctx: &'a mut Context, next: Next<'a>) -> BoxFuture<'a, Result<()>> {
///         Box::pin(async move {
///             next.run(ctx).await?;
///             ctx.response.set_header("x-powered-by", self.0)
///         })
///     }
/// }
/// ```
pub trait Middleware: Send + Sync + 'static {
    fn call<'a>(&'a self, ctx: &'a mut Context, next: Next<'a>) -> BoxFuture<'a, Result<()>>;
}

/// A shared, type-erased middleware.
pub type BoxedMiddleware = Arc<dyn Middleware>;

impl<M: Middleware + ?Sized> Middleware for Arc<M> {
    fn call<'a>(&'a self, ctx: &'a mut Context, next: Next<'a>) -> BoxFuture<'a, Result<()>> {
        (**self).call(ctx, next)
    }
}

// ── Next ──────────────────────────────────────────────────────────────────────

/// The remainder of the chain after the running middleware.
pub struct Next<'a> {
    stack: &'a [BoxedMiddleware],
    then: Option<Box<Next<'a>>>,
}

impl<'a> Next<'a> {
    pub(crate) fn new(stack: &'a [BoxedMiddleware], then: Option<Next<'a>>) -> Self {
        Self { stack, then: then.map(Box::new) }
    }

    /// A continuation that does nothing.
    pub fn end() -> Self {
        Self { stack: &[], then: None }
    }

    /// Runs the rest of the chain.
    pub fn run<'c>(self, ctx: &'c mut Context) -> BoxFuture<'c, Result<()>>
    where
        'a: 'c,
    {
        match self.stack.split_first() {
            Some((head, rest)) => head.call(ctx, Next { stack: rest, then: self.then }),
            None => match self.then {
                Some(then) => then.run(ctx),
                None       => Box::pin(std::future::ready(Ok(()))),
            },
        }
    }
}

impl std::fmt::Debug for Next<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Next")
            .field("remaining", &self.stack.len())
            .field("continues", &self.then.is_some())
            .finish()
    }
}

// ── Closures ──────────────────────────────────────────────────────────────────

/// Middleware from a closure. Created by [`from_fn`].
pub struct FromFn<F>(F);

/// Wraps a closure as middleware.
///
/// ```rust
/// use grove::middleware::from_fn;
///
/// let timing = from_fn(|ctx, next| {
///     Box::pin(async move {
///         let started = std::time::Instant::now();
///         next.run(ctx).await?;
///         let elapsed = format!("{}ms", started.elapsed().as_millis());
///         ctx.response.set_header("x-response-time", &elapsed)
///     })
/// });
/// ```
pub fn from_fn<F>(f: F) -> FromFn<F>
where
    F: for<'a> Fn(&'a mut Context, Next<'a>) -> BoxFuture<'a, Result<()>> + Send + Sync + 'static,
{
    FromFn(f)
}

impl<F> Middleware for FromFn<F>
where
    F: for<'a> Fn(&'a mut Context, Next<'a>) -> BoxFuture<'a, Result<()>> + Send + Sync + 'static,
{
    fn call<'a>(&'a self, ctx: &'a mut Context, next: Next<'a>) -> BoxFuture<'a, Result<()>> {
        (self.0)(ctx, next)
    }
}

// ── Composition ───────────────────────────────────────────────────────────────

/// Several middleware run as one. Created by [`compose`].
///
/// As a middleware inside another chain, the composed chain's `next`
/// continues with the outer chain.
#[derive(Clone)]
pub struct Compose {
    stack: Arc<[BoxedMiddleware]>,
}

/// Composes `stack` into a single middleware, first element outermost.
pub fn compose(stack: Vec<BoxedMiddleware>) -> Compose {
    Compose { stack: stack.into() }
}

impl Compose {
    /// Runs the chain with nothing after it.
    pub fn dispatch<'a>(&'a self, ctx: &'a mut Context) -> BoxFuture<'a, Result<()>> {
        Next::new(&self.stack, None).run(ctx)
    }

    pub fn len(&self) -> usize {
        self.stack.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stack.is_empty()
    }
}

impl Middleware for Compose {
    fn call<'a>(&'a self, ctx: &'a mut Context, next: Next<'a>) -> BoxFuture<'a, Result<()>> {
        Next::new(&self.stack, Some(next)).run(ctx)
    }
}
