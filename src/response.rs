//! Outgoing HTTP response type.
//!
//! Middleware mutates a [`Response`] in place through the context; the
//! application converts it to wire form once the chain has finished. After
//! that every setter fails with [`Error::NotWritable`].

use std::fmt;
use std::future::Future;

use bytes::Bytes;
use http::header::{HeaderName, HeaderValue, CONTENT_TYPE, LOCATION};
use http::HeaderMap;
use serde::Serialize;
use tokio::io::AsyncRead;

use crate::error::{Error, Result};
use crate::http1::{ServerResponse, WireBody};
use crate::middleware::BoxFuture;
use crate::mime;
use crate::status::Status;
use crate::util::{encode_url, escape_html, is_html};

/// A deferred body, resolved when the response is converted.
pub type Producer = Box<dyn FnOnce() -> BoxFuture<'static, Result<ResponseBody>> + Send + Sync>;

// ── ResponseBody ──────────────────────────────────────────────────────────────

/// What a response carries.
///
/// Text and JSON bodies pick a content type on conversion when none was set:
///
/// | Body | Content type |
/// |---|---|
/// | `Text` that looks like HTML | `text/html; charset=UTF-8` |
/// | other `Text` | `text/plain; charset=UTF-8` |
/// | `Json` | `application/json; charset=UTF-8` |
/// | `Bytes`, `Reader` | none |
#[derive(Default)]
pub enum ResponseBody {
    #[default]
    Empty,
    Text(String),
    Bytes(Bytes),
    Json(serde_json::Value),
    Reader(Box<dyn AsyncRead + Send + Sync + Unpin>),
    Producer(Producer),
}

impl ResponseBody {
    /// Serializes `value` now; the bytes are produced on conversion.
    pub fn json<T: Serialize>(value: &T) -> Result<Self> {
        Ok(Self::Json(serde_json::to_value(value)?))
    }

    /// A body streamed from `reader`, sent chunked unless a
    /// `Content-Length` header is set.
    pub fn reader<R>(reader: R) -> Self
    where
        R: AsyncRead + Send + Sync + Unpin + 'static,
    {
        Self::Reader(Box::new(reader))
    }

    /// A body computed after the chain has finished.
    pub fn producer<F, Fut>(f: F) -> Self
    where
        F: FnOnce() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<ResponseBody>> + Send + 'static,
    {
        Self::Producer(Box::new(move || Box::pin(f())))
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Self::Empty)
    }
}

impl fmt::Debug for ResponseBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty       => f.write_str("Empty"),
            Self::Text(t)     => f.debug_tuple("Text").field(t).finish(),
            Self::Bytes(b)    => f.debug_tuple("Bytes").field(&b.len()).finish(),
            Self::Json(v)     => f.debug_tuple("Json").field(v).finish(),
            Self::Reader(_)   => f.write_str("Reader"),
            Self::Producer(_) => f.write_str("Producer"),
        }
    }
}

impl From<()> for ResponseBody {
    fn from(_: ()) -> Self {
        Self::Empty
    }
}

impl From<&'static str> for ResponseBody {
    fn from(text: &'static str) -> Self {
        Self::Text(text.to_owned())
    }
}

impl From<String> for ResponseBody {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

impl From<Bytes> for ResponseBody {
    fn from(bytes: Bytes) -> Self {
        Self::Bytes(bytes)
    }
}

impl From<Vec<u8>> for ResponseBody {
    fn from(bytes: Vec<u8>) -> Self {
        Self::Bytes(bytes.into())
    }
}

impl From<serde_json::Value> for ResponseBody {
    fn from(value: serde_json::Value) -> Self {
        Self::Json(value)
    }
}

// ── Response ─────────────────────────────────────────────────────────────────

/// An outgoing HTTP response.
///
/// ```rust
/// use grove::{Response, Status};
///
/// # fn run() -> grove::Result<()> {
/// let mut response = Response::default();
/// assert_eq!(response.status(), Status::NotFound);
///
/// response.set_body(serde_json::json!({ "id": 42 }))?;
/// assert_eq!(response.status(), Status::Ok);
///
/// response.set_status(Status::Created)?;
/// response.set_header("location", "/users/42")?;
/// # Ok(()) }
/// ```
#[derive(Debug)]
pub struct Response {
    status: Option<Status>,
    headers: HeaderMap,
    body: ResponseBody,
    kind: Option<String>,
    writable: bool,
}

impl Default for Response {
    fn default() -> Self {
        Self {
            status: None,
            headers: HeaderMap::new(),
            body: ResponseBody::Empty,
            kind: None,
            writable: true,
        }
    }
}

impl Response {
    /// The explicit status, else `200` when a body is set, else `404`.
    pub fn status(&self) -> Status {
        match (self.status, &self.body) {
            (Some(status), _)           => status,
            (None, ResponseBody::Empty) => Status::NotFound,
            (None, _)                   => Status::Ok,
        }
    }

    pub fn explicit_status(&self) -> Option<Status> {
        self.status
    }

    pub fn set_status(&mut self, status: Status) -> Result<()> {
        self.check_writable()?;
        self.status = Some(status);
        Ok(())
    }

    pub fn body(&self) -> &ResponseBody {
        &self.body
    }

    pub fn set_body(&mut self, body: impl Into<ResponseBody>) -> Result<()> {
        self.check_writable()?;
        self.body = body.into();
        Ok(())
    }

    /// The media type or extension shorthand (`"html"`, `"json"`) used for
    /// `Content-Type` when no such header is set.
    pub fn content_type(&self) -> Option<&str> {
        self.kind.as_deref()
    }

    pub fn set_type(&mut self, kind: impl Into<String>) -> Result<()> {
        self.check_writable()?;
        self.kind = Some(kind.into());
        Ok(())
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> Result<&mut HeaderMap> {
        self.check_writable()?;
        Ok(&mut self.headers)
    }

    /// A header value, when present and valid UTF-8.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Sets a header, replacing earlier values.
    pub fn set_header(&mut self, name: &str, value: &str) -> Result<()> {
        let name = HeaderName::try_from(name).map_err(|e| Error::InvalidHeader(format!("`{name}`: {e}")))?;
        let value = HeaderValue::try_from(value).map_err(|e| Error::InvalidHeader(format!("`{name}`: {e}")))?;
        self.headers_mut()?.insert(name, value);
        Ok(())
    }

    /// `false` once the response has been handed to the connection.
    pub fn is_writable(&self) -> bool {
        self.writable
    }

    /// Points the client at `url`.
    ///
    /// The status becomes `302 Found` unless a redirect status is already
    /// set. The body is a short HTML page when `html` is true, plain text
    /// otherwise.
    pub fn redirect(&mut self, url: &str, html: bool) -> Result<()> {
        self.check_writable()?;
        let location = encode_url(url);
        let value = HeaderValue::try_from(location.as_str())
            .map_err(|e| Error::InvalidHeader(format!("`location`: {e}")))?;
        self.headers.insert(LOCATION, value);

        if !self.status.is_some_and(Status::is_redirect) {
            self.status = Some(Status::Found);
        }
        if html {
            let href = escape_html(&location);
            self.kind = Some("text/html; charset=UTF-8".to_owned());
            self.body = ResponseBody::Text(format!("Redirecting to <a href=\"{href}\">{href}</a>."));
        } else {
            self.kind = Some("text/plain; charset=UTF-8".to_owned());
            self.body = ResponseBody::Text(format!("Redirecting to {location}."));
        }
        Ok(())
    }

    /// Replaces the response with a plain-text error page for `error`.
    ///
    /// Headers are dropped except those the error carries. The message is
    /// only shown when the error is exposed; otherwise the reason phrase is.
    pub(crate) fn set_error(&mut self, error: &Error) {
        let status = error.status();
        self.headers.clear();
        if let Some(headers) = error.headers() {
            self.headers.extend(headers.clone());
        }
        self.status = Some(status);
        self.kind = Some("text".to_owned());
        self.body = ResponseBody::Text(match error {
            Error::Http(e) if e.expose => e.message.clone(),
            _ => status.reason().to_owned(),
        });
    }

    /// Converts the response to wire form. Once the body has resolved the
    /// response is no longer writable; a failing producer leaves it writable
    /// so an error page can replace it.
    pub(crate) async fn to_server_response(&mut self) -> Result<ServerResponse> {
        self.check_writable()?;

        let mut body = std::mem::take(&mut self.body);
        let wire = loop {
            body = match body {
                ResponseBody::Producer(produce) => produce().await?,
                ResponseBody::Empty             => break WireBody::Empty,
                ResponseBody::Bytes(bytes)      => break WireBody::Bytes(bytes),
                ResponseBody::Reader(reader)    => break WireBody::Stream(reader),
                ResponseBody::Text(text) => {
                    if self.kind.is_none() {
                        self.kind = Some(if is_html(&text) { "html" } else { "text/plain" }.to_owned());
                    }
                    break WireBody::Bytes(Bytes::from(text));
                }
                ResponseBody::Json(value) => {
                    self.kind.get_or_insert_with(|| "json".to_owned());
                    break WireBody::Bytes(Bytes::from(serde_json::to_vec(&value)?));
                }
            };
        };

        self.writable = false;
        let status = match (self.status, &wire) {
            (Some(status), _)       => status,
            (None, WireBody::Empty) => Status::NotFound,
            (None, _)               => Status::Ok,
        };

        if !self.headers.contains_key(CONTENT_TYPE) {
            if let Some(value) = self.kind.as_deref().and_then(mime::content_type) {
                let value = HeaderValue::try_from(value)
                    .map_err(|e| Error::InvalidHeader(format!("`content-type`: {e}")))?;
                self.headers.insert(CONTENT_TYPE, value);
            }
        }

        Ok(ServerResponse { status, headers: std::mem::take(&mut self.headers), body: wire })
    }

    fn check_writable(&self) -> Result<()> {
        if self.writable { Ok(()) } else { Err(Error::NotWritable) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bytes_of(response: &ServerResponse) -> &[u8] {
        match &response.body {
            WireBody::Bytes(bytes) => &bytes[..],
            other => panic!("expected bytes, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn json_bodies_get_a_json_content_type() {
        let mut response = Response::default();
        response.set_body(serde_json::json!({ "status": "success", "data": [] })).unwrap();

        let wire = response.to_server_response().await.unwrap();
        assert_eq!(wire.status, Status::Ok);
        assert_eq!(wire.headers[CONTENT_TYPE], "application/json; charset=UTF-8");
        assert_eq!(bytes_of(&wire), br#"{"data":[],"status":"success"}"#);
    }

    #[tokio::test]
    async fn text_is_sniffed_for_html() {
        let mut page = Response::default();
        page.set_body("<!DOCTYPE html><p>hi</p>").unwrap();
        let wire = page.to_server_response().await.unwrap();
        assert_eq!(wire.headers[CONTENT_TYPE], "text/html; charset=UTF-8");

        let mut plain = Response::default();
        plain.set_body("hi").unwrap();
        let wire = plain.to_server_response().await.unwrap();
        assert_eq!(wire.headers[CONTENT_TYPE], "text/plain; charset=UTF-8");
    }

    #[tokio::test]
    async fn explicit_content_type_headers_win() {
        let mut response = Response::default();
        response.set_body(serde_json::json!([1])).unwrap();
        response.set_header("content-type", "application/vnd.api+json").unwrap();

        let wire = response.to_server_response().await.unwrap();
        assert_eq!(wire.headers[CONTENT_TYPE], "application/vnd.api+json");
    }

    #[tokio::test]
    async fn producers_resolve_on_conversion() {
        let mut response = Response::default();
        response
            .set_body(ResponseBody::producer(|| async { Ok(ResponseBody::from("late")) }))
            .unwrap();
        assert_eq!(response.status(), Status::Ok);

        let wire = response.to_server_response().await.unwrap();
        assert_eq!(bytes_of(&wire), b"late");
    }

    #[tokio::test]
    async fn producers_yielding_nothing_are_not_found() {
        let mut response = Response::default();
        response.set_body(ResponseBody::producer(|| async { Ok(ResponseBody::Empty) })).unwrap();

        let wire = response.to_server_response().await.unwrap();
        assert_eq!(wire.status, Status::NotFound);
        assert!(matches!(wire.body, WireBody::Empty));

        let mut explicit = Response::default();
        explicit.set_status(Status::NoContent).unwrap();
        explicit.set_body(ResponseBody::producer(|| async { Ok(ResponseBody::Empty) })).unwrap();
        assert_eq!(explicit.to_server_response().await.unwrap().status, Status::NoContent);
    }

    #[tokio::test]
    async fn converted_responses_are_frozen() {
        let mut response = Response::default();
        let wire = response.to_server_response().await.unwrap();
        assert_eq!(wire.status, Status::NotFound);
        assert!(matches!(wire.body, WireBody::Empty));

        assert!(!response.is_writable());
        assert!(matches!(response.set_status(Status::Ok), Err(Error::NotWritable)));
        assert!(matches!(response.set_body("late"), Err(Error::NotWritable)));
        assert!(matches!(response.headers_mut(), Err(Error::NotWritable)));
    }

    #[test]
    fn redirects_keep_redirect_statuses() {
        let mut response = Response::default();
        response.redirect("/search?q=a b", false).unwrap();
        assert_eq!(response.status(), Status::Found);
        assert_eq!(response.header("location"), Some("/search?q=a%20b"));

        let mut moved = Response::default();
        moved.set_status(Status::MovedPermanently).unwrap();
        moved.redirect("/new", true).unwrap();
        assert_eq!(moved.status(), Status::MovedPermanently);
        assert!(matches!(moved.body(), ResponseBody::Text(t) if t == r#"Redirecting to <a href="/new">/new</a>."#));
    }

    #[test]
    fn invalid_headers_are_rejected() {
        let mut response = Response::default();
        assert!(matches!(response.set_header("bad header", "x"), Err(Error::InvalidHeader(_))));
        assert!(matches!(response.set_header("x-ok", "line\nbreak"), Err(Error::InvalidHeader(_))));
    }
}
