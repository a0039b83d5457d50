mod common;

use std::path::PathBuf;

use common::{start, Client};
use grove::multipart::MultipartOptions;
use grove::{handler, Application, Router};
use serde_json::{json, Value};

const BOUNDARY: &str = "----groveUploadBoundary";

fn upload_app(dir: PathBuf) -> Application {
    let router = Router::new().post("/upload", handler(move |ctx| {
        let options = MultipartOptions::default().out_path(dir.clone()).max_file_size(8 * 1024);
        Box::pin(async move {
            let form = ctx.request.body.form_data()?.read(&options).await?;
            let files: Vec<Value> = form
                .files
                .iter()
                .map(|file| json!({ "field": file.name, "original": file.original_name, "path": file.filename }))
                .collect();
            ctx.response.set_body(json!({ "title": form.fields.get("title"), "files": files }))
        })
    }));
    Application::new().with(router.routes())
}

fn form(title: &str, filename: &str, content: &[u8]) -> Vec<u8> {
    let mut out = format!(
        "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"title\"\r\n\r\n{title}\r\n\
         --{BOUNDARY}\r\nContent-Disposition: form-data; name=\"photo\"; filename=\"{filename}\"\r\n\
         Content-Type: image/png\r\n\r\n"
    )
    .into_bytes();
    out.extend_from_slice(content);
    out.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());
    out
}

/// A POST to `/upload` with `body` sent in 1000-byte chunks.
fn chunked_upload(body: &[u8]) -> Vec<u8> {
    let mut raw = format!(
        "POST /upload HTTP/1.1\r\nhost: x\r\ncontent-type: multipart/form-data; boundary={BOUNDARY}\r\n\
         transfer-encoding: chunked\r\n\r\n"
    )
    .into_bytes();
    for chunk in body.chunks(1000) {
        raw.extend_from_slice(format!("{:x}\r\n", chunk.len()).as_bytes());
        raw.extend_from_slice(chunk);
        raw.extend_from_slice(b"\r\n");
    }
    raw.extend_from_slice(b"0\r\n\r\n");
    raw
}

#[tokio::test]
async fn uploads_are_spooled_to_disk() {
    let dir = tempfile::tempdir().unwrap();
    let server = start(upload_app(dir.path().to_path_buf())).await;
    let mut client = Client::connect(server.addr).await;

    let mut payload: Vec<u8> = (0..=255u8).cycle().take(3000).collect();
    payload.extend_from_slice(b"\r\n--almost\r\n");
    client.send(&chunked_upload(&form("holiday", "beach.png", &payload))).await;

    let reply = client.read().await;
    assert_eq!(reply.status, 200);
    let uploaded: Value = serde_json::from_slice(&reply.body).unwrap();
    assert_eq!(uploaded["title"], "holiday");
    assert_eq!(uploaded["files"][0]["field"], "photo");
    assert_eq!(uploaded["files"][0]["original"], "beach.png");

    let path = PathBuf::from(uploaded["files"][0]["path"].as_str().unwrap());
    assert!(path.starts_with(dir.path()));
    assert_eq!(path.extension().unwrap(), "png");
    assert_eq!(tokio::fs::read(&path).await.unwrap(), payload);
}

#[tokio::test]
async fn oversized_uploads_are_refused_and_the_connection_survives() {
    let dir = tempfile::tempdir().unwrap();
    let server = start(upload_app(dir.path().to_path_buf())).await;
    let mut client = Client::connect(server.addr).await;

    client.send(&chunked_upload(&form("too big", "huge.png", &vec![7u8; 10_000]))).await;
    let reply = client.read().await;
    assert_eq!(reply.status, 413);
    assert_eq!(reply.text(), "File size exceeds limit of 8192 bytes.");
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);

    // The rest of the refused body was drained, so the next request parses.
    assert_eq!(client.get("/missing").await.status, 404);
}

#[tokio::test]
async fn non_multipart_bodies_are_bad_requests() {
    let dir = tempfile::tempdir().unwrap();
    let server = start(upload_app(dir.path().to_path_buf())).await;
    let mut client = Client::connect(server.addr).await;

    client
        .send(b"POST /upload HTTP/1.1\r\nhost: x\r\ncontent-type: text/plain\r\ncontent-length: 5\r\n\r\nhello")
        .await;
    assert_eq!(client.read().await.status, 400);
}
