//! Leaf handlers.
//!
//! A handler is the last step of a route: it fills in the response and never
//! calls `next`. Any closure taking `&mut Context` and returning a boxed
//! future qualifies:
//!
//! ```text
//! |ctx| Box::pin(async move { … })       ← user writes this
//!        ↓ handler(…)
//! Handler(closure)                        ← implements Middleware
//!        ↓ router.get("/", …)
//! Arc<dyn Middleware>                     ← stored in the route's stack
//!        ↓ at request time
//! handler.call(ctx, next)                 ← `next` is dropped unused
//! ```
//!
//! The future has to be boxed by hand because it borrows the context: the
//! borrow's lifetime must appear in the return type, which a plain
//! `Fn(&mut Context) -> Fut` bound cannot express.

use crate::context::Context;
use crate::error::Result;
use crate::middleware::{BoxFuture, Middleware, Next};

/// A middleware that ends the chain. Created by [`handler`].
pub struct Handler<F>(F);

/// Wraps a closure as a leaf handler.
///
/// ```rust
/// use grove::handler;
///
/// let index = handler(|ctx| {
///     Box::pin(async move {
///         ctx.response.set_body(serde_json::json!({ "status": "success", "data": [] }))
///     })
/// });
/// ```
pub fn handler<F>(f: F) -> Handler<F>
where
    F: for<'a> Fn(&'a mut Context) -> BoxFuture<'a, Result<()>> + Send + Sync + 'static,
{
    Handler(f)
}

impl<F> Middleware for Handler<F>
where
    F: for<'a> Fn(&'a mut Context) -> BoxFuture<'a, Result<()>> + Send + Sync + 'static,
{
    fn call<'a>(&'a self, ctx: &'a mut Context, _next: Next<'a>) -> BoxFuture<'a, Result<()>> {
        (self.0)(ctx)
    }
}
