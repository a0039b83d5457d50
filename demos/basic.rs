//! Minimal grove example: a JSON index, a small user resource and graceful
//! shutdown.
//!
//! Run with:
//!   RUST_LOG=info cargo run --example basic
//!
//! Try:
//!   curl http://localhost:8000/
//!   curl http://localhost:8000/users/42
//!   curl -X POST http://localhost:8000/users \
//!        -H 'content-type: application/json' \
//!        -d '{"name":"alice"}'
//!   curl -i -X OPTIONS http://localhost:8000/users
//!   curl -i -X DELETE http://localhost:8000/

use grove::middleware::from_fn;
use grove::{handler, Application, ListenOptions, Router, Shutdown, Status};
use serde::Deserialize;
use tracing_subscriber::EnvFilter;

#[derive(Deserialize)]
struct NewUser {
    name: String,
}

#[tokio::main]
async fn main() -> grove::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let router = Router::new()
        .get("/", handler(|ctx| Box::pin(async move {
            ctx.response.set_body(serde_json::json!({ "status": "success", "data": [] }))
        })))
        .get_named("user", "/users/:id", handler(|ctx| Box::pin(async move {
            let id = ctx.param("id").unwrap_or_default().to_owned();
            ctx.response.set_body(serde_json::json!({ "id": id, "name": "alice" }))
        })))
        .post("/users", handler(|ctx| Box::pin(async move {
            let user: NewUser = ctx.request.body.json().await?;
            ctx.response.set_status(Status::Created)?;
            ctx.response.set_header("location", "/users/99")?;
            ctx.response.set_body(serde_json::json!({ "id": "99", "name": user.name }))
        })))
        .redirect("/home", "/", Status::MovedPermanently);

    let timing = from_fn(|ctx, next| Box::pin(async move {
        let started = std::time::Instant::now();
        next.run(ctx).await?;
        let elapsed = format!("{}ms", started.elapsed().as_millis());
        ctx.response.set_header("x-response-time", &elapsed)
    }));

    let shutdown = Shutdown::new();
    shutdown.trigger_on_os_signal();

    let options: ListenOptions = "0.0.0.0:8000".parse()?;
    Application::new()
        .with(timing)
        .with(router.routes())
        .with(router.allowed_methods(Default::default()))
        .on_listen(|event| println!("listening on http://{}:{}", event.hostname, event.port))
        .listen(options.signal(shutdown.subscribe()))
        .await
}
