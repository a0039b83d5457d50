mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{start, Client};
use grove::{handler, Application, Router, Status};
use tokio::sync::Notify;
use tokio::time::timeout;

fn echo_app() -> Application {
    let router = Router::new()
        .get("/", handler(|ctx| Box::pin(async move {
            ctx.response.set_body(serde_json::json!({ "status": "success", "data": [] }))
        })))
        .post("/echo", handler(|ctx| Box::pin(async move {
            let body = ctx.request.body.bytes().await?;
            ctx.response.set_body(body)
        })));
    Application::new().with(router.routes()).with(router.allowed_methods(Default::default()))
}

#[tokio::test]
async fn json_index_is_served() {
    let server = start(echo_app()).await;
    let mut client = Client::connect(server.addr).await;

    let reply = client.get("/").await;
    assert_eq!(reply.status, 200);
    assert_eq!(reply.header("content-type"), Some("application/json; charset=UTF-8"));
    assert_eq!(reply.text(), r#"{"data":[],"status":"success"}"#);
}

#[tokio::test]
async fn keep_alive_serves_requests_in_order() {
    let server = start(echo_app()).await;
    let mut client = Client::connect(server.addr).await;

    client
        .send(b"POST /echo HTTP/1.1\r\nhost: x\r\ncontent-length: 5\r\n\r\nfirstPOST /echo HTTP/1.1\r\nhost: x\r\ncontent-length: 6\r\n\r\nsecond")
        .await;
    assert_eq!(client.read().await.text(), "first");
    assert_eq!(client.read().await.text(), "second");

    let missing = client.get("/missing").await;
    assert_eq!(missing.status, 404);
    assert_eq!(missing.header("content-length"), Some("0"));
}

#[tokio::test]
async fn unread_bodies_are_drained_before_the_next_request() {
    let router = Router::new().post("/ignore", handler(|ctx| Box::pin(async move { ctx.response.set_body("ok") })));
    let server = start(Application::new().with(router.routes())).await;
    let mut client = Client::connect(server.addr).await;

    client.send(b"POST /ignore HTTP/1.1\r\nhost: x\r\ncontent-length: 11\r\n\r\nhello world").await;
    assert_eq!(client.read().await.text(), "ok");
    client.send(b"POST /ignore HTTP/1.1\r\nhost: x\r\ncontent-length: 0\r\n\r\n").await;
    assert_eq!(client.read().await.text(), "ok");
}

#[tokio::test]
async fn chunked_bodies_are_reassembled() {
    let server = start(echo_app()).await;
    let mut client = Client::connect(server.addr).await;

    client
        .send(b"POST /echo HTTP/1.1\r\nhost: x\r\ntransfer-encoding: chunked\r\n\r\n5;ext=1\r\nhello\r\n6\r\n world\r\n0\r\nx-trailer: yes\r\n\r\n")
        .await;
    let reply = client.read().await;
    assert_eq!(reply.status, 200);
    assert_eq!(reply.text(), "hello world");
}

#[tokio::test]
async fn broken_chunking_is_a_bad_request() {
    let server = start(echo_app()).await;
    let mut client = Client::connect(server.addr).await;

    client.send(b"POST /echo HTTP/1.1\r\nhost: x\r\ntransfer-encoding: chunked\r\n\r\nzz\r\nhello\r\n").await;
    let reply = client.read().await;
    assert_eq!(reply.status, 400);
}

#[tokio::test]
async fn malformed_heads_are_rejected_and_closed() {
    let server = start(echo_app()).await;

    let mut client = Client::connect(server.addr).await;
    client.send(b"GARBAGE\r\n\r\n").await;
    let reply = client.read().await;
    assert_eq!(reply.status, 400);
    assert_eq!(reply.header("connection"), Some("close"));
    assert!(client.is_closed().await);

    let mut client = Client::connect(server.addr).await;
    client.send(b"BREW /pot HTTP/1.1\r\n\r\n").await;
    assert_eq!(client.read().await.status, 501);
}

#[tokio::test]
async fn connection_close_is_honoured() {
    let server = start(echo_app()).await;
    let mut client = Client::connect(server.addr).await;

    client.send(b"GET / HTTP/1.1\r\nhost: x\r\nconnection: close\r\n\r\n").await;
    let reply = client.read().await;
    assert_eq!(reply.status, 200);
    assert_eq!(reply.header("connection"), Some("close"));
    assert!(client.is_closed().await);
}

#[tokio::test]
async fn head_responses_have_no_payload() {
    let server = start(echo_app()).await;
    let mut client = Client::connect(server.addr).await;

    client.send(b"HEAD / HTTP/1.1\r\nhost: x\r\n\r\n").await;
    let reply = client.read().await;
    assert_eq!(reply.status, 200);
    assert_eq!(reply.header("content-length"), Some("30"));

    // Had the payload been sent, it would be read as the next status line.
    assert_eq!(client.get("/").await.status, 200);
}

#[tokio::test]
async fn graceful_shutdown_finishes_in_flight_requests() {
    let entered = Arc::new(Notify::new());
    let release = Arc::new(Notify::new());
    let (inside, gate) = (Arc::clone(&entered), Arc::clone(&release));

    let router = Router::new().get("/slow", handler(move |ctx| {
        let (inside, gate) = (Arc::clone(&inside), Arc::clone(&gate));
        Box::pin(async move {
            inside.notify_one();
            gate.notified().await;
            ctx.response.set_status(Status::Ok)?;
            ctx.response.set_body("finished")
        })
    }));
    let mut server = start(Application::new().with(router.routes())).await;

    let mut idle = Client::connect(server.addr).await;
    assert_eq!(idle.get("/missing").await.status, 404);

    let mut busy = Client::connect(server.addr).await;
    busy.send(b"GET /slow HTTP/1.1\r\nhost: x\r\n\r\n").await;
    entered.notified().await;

    server.shutdown.trigger();
    assert!(idle.is_closed().await);
    assert!(timeout(Duration::from_millis(100), &mut server.handle).await.is_err());

    release.notify_one();
    let reply = busy.read().await;
    assert_eq!(reply.text(), "finished");
    assert_eq!(reply.header("connection"), Some("close"));

    let served = timeout(Duration::from_secs(5), server.handle).await.unwrap().unwrap();
    assert!(served.is_ok());
}
