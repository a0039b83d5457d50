mod common;

use std::sync::{Arc, Mutex};

use common::{start, Client};
use grove::middleware::from_fn;
use grove::{
    handler, Application, CookieOptions, Error, HttpError, ListenOptions, Method, Request, Router, ServerResponse,
    Status, WireBody,
};
use http::header::{HeaderValue, COOKIE, SET_COOKIE, WWW_AUTHENTICATE};
use tracing_test::traced_test;

fn text(response: &ServerResponse) -> String {
    match &response.body {
        WireBody::Bytes(bytes) => String::from_utf8(bytes.to_vec()).unwrap(),
        WireBody::Empty => String::new(),
        other => panic!("unexpected body {other:?}"),
    }
}

async fn handle(app: &Application, method: Method, target: &str) -> ServerResponse {
    app.handle(Request::new(method, target).unwrap()).await.unwrap().unwrap()
}

#[tokio::test]
async fn middleware_runs_as_an_onion() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let step = |name: &'static str| {
        let log = Arc::clone(&log);
        from_fn(move |ctx, next| {
            let log = Arc::clone(&log);
            Box::pin(async move {
                log.lock().unwrap().push(format!("{name} before"));
                next.run(ctx).await?;
                log.lock().unwrap().push(format!("{name} after"));
                Ok(())
            })
        })
    };
    let app = Application::new().with(step("outer")).with(step("inner")).with(handler(|ctx| {
        Box::pin(async move { ctx.response.set_body("handled") })
    }));

    let response = handle(&app, Method::Get, "/").await;
    assert_eq!(text(&response), "handled");
    assert_eq!(*log.lock().unwrap(), ["outer before", "inner before", "inner after", "outer after"]);
}

#[tokio::test]
async fn http_errors_become_error_pages() {
    let app = Application::new().with(handler(|ctx| {
        Box::pin(async move {
            ctx.response.set_header("x-discarded", "yes")?;
            let err = HttpError::new(Status::Unauthorized, "sign in first")
                .with_header(WWW_AUTHENTICATE, HeaderValue::from_static("Basic"));
            Err(err.into())
        })
    }));

    let response = handle(&app, Method::Get, "/").await;
    assert_eq!(response.status, Status::Unauthorized);
    assert_eq!(text(&response), "sign in first");
    assert_eq!(response.headers["www-authenticate"], "Basic");
    assert_eq!(response.headers["content-type"], "text/plain; charset=UTF-8");
    assert!(!response.headers.contains_key("x-discarded"));
}

#[tokio::test]
async fn server_errors_hide_their_message() {
    let events = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&events);
    let app = Application::new()
        .on_error(move |event| {
            let path = event.context.map(|ctx| ctx.request.path().to_owned());
            seen.lock().unwrap().push((event.message.clone(), path));
        })
        .with(handler(|_ctx| {
            Box::pin(async move { Err(HttpError::new(Status::InternalServerError, "db password is hunter2").into()) })
        }));

    let response = handle(&app, Method::Get, "/orders").await;
    assert_eq!(response.status, Status::InternalServerError);
    assert_eq!(text(&response), "Internal Server Error");
    assert_eq!(
        *events.lock().unwrap(),
        [("db password is hunter2".to_owned(), Some("/orders".to_owned()))]
    );
}

#[tokio::test]
#[traced_test]
async fn panics_are_reported_as_errors() {
    let panicked = Arc::new(Mutex::new(false));
    let flag = Arc::clone(&panicked);
    let app = Application::new()
        .on_error(move |event| {
            *flag.lock().unwrap() = matches!(event.error, Error::Panic(message) if message == "boom");
        })
        .with(handler(|_ctx| Box::pin(async move { panic!("boom") })));

    let response = handle(&app, Method::Get, "/").await;
    assert_eq!(response.status, Status::InternalServerError);
    assert!(*panicked.lock().unwrap());
    assert!(logs_contain("middleware panicked: boom"));
}

#[tokio::test]
async fn failed_requests_drop_their_cookies() {
    let app = Application::new().with(handler(|ctx| {
        Box::pin(async move {
            let visits: u32 = ctx.cookies.get("visits").and_then(|v| v.parse().ok()).unwrap_or(0);
            ctx.cookies.set("visits", &(visits + 1).to_string(), CookieOptions::default())?;
            if ctx.request.path() == "/fail" {
                return ctx.throw(Status::BadRequest, "no");
            }
            ctx.response.set_body("counted")
        })
    }));

    let request = Request::new(Method::Get, "/").unwrap().with_header(COOKIE, HeaderValue::from_static("visits=2"));
    let response = app.handle(request).await.unwrap().unwrap();
    assert_eq!(response.headers[SET_COOKIE], "visits=3; path=/; httponly");

    let response = handle(&app, Method::Get, "/fail").await;
    assert_eq!(response.status, Status::BadRequest);
    assert!(!response.headers.contains_key(SET_COOKIE));
}

#[tokio::test]
async fn state_is_copied_into_every_context() {
    #[derive(Clone)]
    struct Greeting(&'static str);

    let app = Application::new().with_state(Greeting("hello")).with(handler(|ctx| {
        Box::pin(async move {
            let greeting = ctx.state.get::<Greeting>().map_or("?", |g| g.0);
            ctx.response.set_body(greeting)
        })
    }));
    assert_eq!(text(&handle(&app, Method::Get, "/").await), "hello");
}

#[tokio::test]
async fn respond_false_skips_the_response() {
    let app = Application::new().with(from_fn(|ctx, _next| {
        Box::pin(async move {
            ctx.respond = false;
            Ok(())
        })
    }));
    assert!(app.handle(Request::new(Method::Get, "/").unwrap()).await.unwrap().is_none());
}

#[tokio::test]
async fn applications_need_middleware() {
    let err = Application::new().handle(Request::new(Method::Get, "/").unwrap()).await.unwrap_err();
    assert!(matches!(err, Error::NoMiddleware));
}

#[tokio::test]
async fn routers_answer_in_process() {
    let router = Router::new()
        .get("/books/:id", handler(|ctx| {
            Box::pin(async move {
                let id = ctx.param("id").unwrap_or_default().to_owned();
                ctx.response.set_body(serde_json::json!({ "id": id }))
            })
        }))
        .post("/books", handler(|ctx| {
            Box::pin(async move {
                let book: serde_json::Value = ctx.request.body.json().await?;
                ctx.response.set_status(Status::Created)?;
                ctx.response.set_body(book)
            })
        }));
    let app = Application::new().with(router.routes()).with(router.allowed_methods(Default::default()));

    let response = handle(&app, Method::Get, "/books/7").await;
    assert_eq!(text(&response), r#"{"id":"7"}"#);

    let request = Request::new(Method::Post, "/books")
        .unwrap()
        .with_header(http::header::CONTENT_TYPE, HeaderValue::from_static("application/json"))
        .with_body(r#"{"title":"Dune"}"#);
    let response = app.handle(request).await.unwrap().unwrap();
    assert_eq!(response.status, Status::Created);

    let request = Request::new(Method::Post, "/books")
        .unwrap()
        .with_header(http::header::CONTENT_TYPE, HeaderValue::from_static("application/json"))
        .with_body("{not json");
    let response = app.handle(request).await.unwrap().unwrap();
    assert_eq!(response.status, Status::BadRequest);

    let response = handle(&app, Method::Put, "/books").await;
    assert_eq!(response.status, Status::MethodNotAllowed);
    assert_eq!(response.headers["allow"], "POST");
}

#[tokio::test]
async fn listen_events_report_the_bound_address() {
    let events = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&events);
    let app = Application::new()
        .on_listen(move |event| seen.lock().unwrap().push(event.clone()))
        .with(handler(|ctx| Box::pin(async move { ctx.response.set_body("up") })));

    let server = start(app).await;
    let mut client = Client::connect(server.addr).await;
    assert_eq!(client.get("/").await.text(), "up");

    let events = events.lock().unwrap().clone();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].port, server.addr.port());
    assert_eq!(events[0].hostname, "127.0.0.1");
    assert!(!events[0].secure);

    server.shutdown.trigger();
    server.handle.await.unwrap().unwrap();
}

#[test]
fn listen_addresses_are_parsed() {
    let options: ListenOptions = "[::1]:3000".parse().unwrap();
    assert_eq!((options.hostname.as_str(), options.port), ("::1", 3000));

    for bad in ["localhost", "host:99999", "host:port"] {
        assert!(matches!(bad.parse::<ListenOptions>(), Err(Error::InvalidAddress(_))), "{bad}");
    }
}
