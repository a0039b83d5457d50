//! HTTP/1.x wire codec: request heads in, responses out.
//!
//! Request heads are read line by line from the connection's buffered reader
//! with a byte budget, so a client cannot grow server memory by sending an
//! endless header block. Responses are written with the same framing rules the
//! request side understands: byte bodies get `content-length`, streams without
//! a declared length go out chunked (or close-delimited for HTTP/1.0 peers).

use std::fmt;
use std::io::{self, Write as _};

use bytes::Bytes;
use http::header::{CONNECTION, CONTENT_LENGTH, CONTENT_TYPE, EXPECT, HeaderValue, TRANSFER_ENCODING};
use http::{HeaderMap, Version};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::body::framer::split_header;
use crate::method::{Method, UnknownMethod};
use crate::server::ServerConfig;
use crate::status::Status;

/// Blank lines tolerated before a request line (RFC 9112 §2.2).
const MAX_LEADING_EMPTY_LINES: usize = 8;

const STREAM_CHUNK: usize = 16 * 1024;

// ── Line reading ──────────────────────────────────────────────────────────────

/// Reads one LF-terminated line, stripping the `\r\n` or `\n`.
///
/// Returns `Ok(None)` on EOF before any byte. A line longer than `limit`
/// fails with [`io::ErrorKind::InvalidData`]; EOF inside a line fails with
/// [`io::ErrorKind::UnexpectedEof`].
pub(crate) async fn read_line<R>(reader: &mut R, limit: usize) -> io::Result<Option<Vec<u8>>>
where
    R: AsyncBufRead + Unpin + ?Sized,
{
    let mut line = Vec::new();
    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            if line.is_empty() {
                return Ok(None);
            }
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "connection closed mid-line"));
        }

        let (used, complete) = match available.iter().position(|&b| b == b'\n') {
            Some(i) => {
                line.extend_from_slice(&available[..i]);
                (i + 1, true)
            }
            None => {
                line.extend_from_slice(available);
                (available.len(), false)
            }
        };
        reader.consume(used);

        if line.len() > limit {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "line too long"));
        }
        if complete {
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            return Ok(Some(line));
        }
    }
}

// ── Request head ──────────────────────────────────────────────────────────────

/// The request line and header block of one request.
#[derive(Debug)]
pub struct RequestHead {
    pub method: Method,
    pub target: String,
    pub version: Version,
    pub headers: HeaderMap,
}

impl RequestHead {
    /// HTTP/1.1 persists unless told `close`; HTTP/1.0 only with `keep-alive`.
    pub(crate) fn keep_alive(&self) -> bool {
        let has = |token: &str| connection_has(&self.headers, token);
        match self.version {
            Version::HTTP_10 => has("keep-alive"),
            _                => !has("close"),
        }
    }

    pub(crate) fn expects_continue(&self) -> bool {
        self.version == Version::HTTP_11
            && self
                .headers
                .get(EXPECT)
                .is_some_and(|v| v.as_bytes().eq_ignore_ascii_case(b"100-continue"))
    }
}

pub(crate) fn connection_has(headers: &HeaderMap, token: &str) -> bool {
    headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|t| t.trim().eq_ignore_ascii_case(token))
}

/// Why a request head could not be read.
#[derive(Debug, thiserror::Error)]
pub(crate) enum HeadError {
    #[error(transparent)]
    Io(#[from] io::Error),

    #[error("{0}")]
    Malformed(String),

    #[error(transparent)]
    UnknownMethod(#[from] UnknownMethod),

    #[error("request head exceeds {0} bytes")]
    TooLarge(usize),

    #[error("request has more than {0} headers")]
    TooManyHeaders(usize),

    #[error("unsupported protocol version `{0}`")]
    Version(String),
}

impl HeadError {
    /// The status of the best-effort response, or `None` when the peer is
    /// gone and nothing should be written.
    pub(crate) fn status(&self) -> Option<Status> {
        match self {
            Self::Io(e) => match e.kind() {
                io::ErrorKind::UnexpectedEof | io::ErrorKind::InvalidData => Some(Status::BadRequest),
                _ => None,
            },
            Self::Malformed(_)      => Some(Status::BadRequest),
            Self::UnknownMethod(_)  => Some(Status::NotImplemented),
            Self::TooLarge(_)       => Some(Status::RequestHeaderFieldsTooLarge),
            Self::TooManyHeaders(_) => Some(Status::RequestHeaderFieldsTooLarge),
            Self::Version(_)        => Some(Status::HttpVersionNotSupported),
        }
    }
}

/// Reads the next request head. `Ok(None)` means the peer closed the
/// connection cleanly between requests.
pub(crate) async fn read_head<R>(
    reader: &mut R,
    config: &ServerConfig,
) -> Result<Option<RequestHead>, HeadError>
where
    R: AsyncBufRead + Unpin + ?Sized,
{
    let mut budget = config.max_head_bytes;

    let mut request_line = None;
    for _ in 0..=MAX_LEADING_EMPTY_LINES {
        match next_head_line(reader, &mut budget, config.max_head_bytes).await? {
            None => return Ok(None),
            Some(line) if line.is_empty() => continue,
            Some(line) => {
                request_line = Some(line);
                break;
            }
        }
    }
    let request_line = request_line.ok_or_else(|| HeadError::Malformed("missing request line".into()))?;
    let (method, target, version) = parse_request_line(&request_line)?;

    let mut headers = HeaderMap::new();
    loop {
        let line = next_head_line(reader, &mut budget, config.max_head_bytes)
            .await?
            .ok_or_else(|| io::Error::new(io::ErrorKind::UnexpectedEof, "connection closed inside the header block"))?;
        if line.is_empty() {
            break;
        }
        if matches!(line[0], b' ' | b'\t') {
            return Err(HeadError::Malformed("obsolete header line folding".into()));
        }
        if headers.len() >= config.max_headers {
            return Err(HeadError::TooManyHeaders(config.max_headers));
        }
        let (name, value) = split_header(&line)
            .ok_or_else(|| HeadError::Malformed(format!("malformed header `{}`", String::from_utf8_lossy(&line))))?;
        headers.append(name, value);
    }

    Ok(Some(RequestHead { method, target, version, headers }))
}

async fn next_head_line<R>(
    reader: &mut R,
    budget: &mut usize,
    max: usize,
) -> Result<Option<Vec<u8>>, HeadError>
where
    R: AsyncBufRead + Unpin + ?Sized,
{
    match read_line(reader, *budget).await {
        Ok(Some(line)) => {
            *budget = budget.saturating_sub(line.len() + 2);
            Ok(Some(line))
        }
        Ok(None) => Ok(None),
        Err(e) if e.kind() == io::ErrorKind::InvalidData => Err(HeadError::TooLarge(max)),
        Err(e) => Err(e.into()),
    }
}

fn parse_request_line(line: &[u8]) -> Result<(Method, String, Version), HeadError> {
    let malformed = || HeadError::Malformed(format!("malformed request line `{}`", String::from_utf8_lossy(line)));

    let line = std::str::from_utf8(line).map_err(|_| malformed())?;
    let mut parts = line.split(' ');
    let (Some(method), Some(target), Some(version), None) = (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(malformed());
    };
    if method.is_empty() || target.is_empty() {
        return Err(malformed());
    }

    let version = match version {
        "HTTP/1.1" => Version::HTTP_11,
        "HTTP/1.0" => Version::HTTP_10,
        v if v.starts_with("HTTP/") => return Err(HeadError::Version(v.to_owned())),
        _ => return Err(malformed()),
    };
    let method = method.parse::<Method>()?;

    Ok((method, target.to_owned(), version))
}

// ── Response ──────────────────────────────────────────────────────────────────

/// A response body in wire form.
pub enum WireBody {
    Empty,
    Bytes(Bytes),
    Stream(Box<dyn AsyncRead + Send + Sync + Unpin>),
}

impl fmt::Debug for WireBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty    => f.write_str("Empty"),
            Self::Bytes(b) => f.debug_tuple("Bytes").field(&b.len()).finish(),
            Self::Stream(_) => f.write_str("Stream"),
        }
    }
}

/// A finalized response, ready for the wire.
#[derive(Debug)]
pub struct ServerResponse {
    pub status: Status,
    pub headers: HeaderMap,
    pub body: WireBody,
}

/// Writes `response` as the answer to a `method` request made with `version`.
///
/// Returns whether the connection can carry another request afterwards; a
/// stream without a declared length sent to an HTTP/1.0 peer is delimited by
/// closing the connection, and says so with `connection: close`.
///
/// A stream with a declared `content-length` is cut off at that length. One
/// that ends early fails with [`io::ErrorKind::UnexpectedEof`] after the
/// partial body, and the caller must drop the connection.
pub(crate) async fn write_response<W>(
    writer: &mut W,
    response: ServerResponse,
    method: Method,
    version: Version,
) -> io::Result<bool>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let ServerResponse { status, mut headers, body } = response;
    let omit_body = method == Method::Head || status.forbids_body();
    let mut persist = true;

    let mut chunked = false;
    let mut declared = None;
    match &body {
        WireBody::Empty => {
            if !status.forbids_body() && !headers.contains_key(CONTENT_LENGTH) {
                headers.insert(CONTENT_LENGTH, HeaderValue::from(0u64));
            }
        }
        WireBody::Bytes(bytes) => {
            headers.remove(TRANSFER_ENCODING);
            if !status.forbids_body() {
                headers.insert(CONTENT_LENGTH, HeaderValue::from(bytes.len()));
            }
        }
        WireBody::Stream(_) if status.forbids_body() => {}
        WireBody::Stream(_) => {
            declared = headers
                .get(CONTENT_LENGTH)
                .and_then(|value| value.to_str().ok())
                .and_then(|value| value.trim().parse::<u64>().ok());
            if declared.is_none() {
                headers.remove(CONTENT_LENGTH);
                if version == Version::HTTP_10 {
                    headers.insert(CONNECTION, HeaderValue::from_static("close"));
                    persist = false;
                } else {
                    headers.insert(TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
                    chunked = true;
                }
            }
        }
    }

    let mut head = Vec::with_capacity(256);
    write!(head, "HTTP/1.1 {} {}\r\n", status.code(), status.reason())?;
    for (name, value) in &headers {
        head.extend_from_slice(name.as_str().as_bytes());
        head.extend_from_slice(b": ");
        head.extend_from_slice(value.as_bytes());
        head.extend_from_slice(b"\r\n");
    }
    head.extend_from_slice(b"\r\n");
    writer.write_all(&head).await?;

    if !omit_body {
        match body {
            WireBody::Empty => {}
            WireBody::Bytes(bytes) => writer.write_all(&bytes).await?,
            WireBody::Stream(mut reader) if chunked => write_chunked(&mut reader, writer).await?,
            WireBody::Stream(mut reader) => match declared {
                Some(len) => {
                    let copied = tokio::io::copy(&mut reader.take(len), writer).await?;
                    if copied < len {
                        return Err(io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            format!("response stream ended after {copied} of {len} declared bytes"),
                        ));
                    }
                }
                None => {
                    tokio::io::copy(&mut reader, writer).await?;
                }
            },
        }
    }

    writer.flush().await?;
    Ok(persist)
}

async fn write_chunked<R, W>(reader: &mut R, writer: &mut W) -> io::Result<()>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut buf = vec![0u8; STREAM_CHUNK];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        writer.write_all(format!("{n:x}\r\n").as_bytes()).await?;
        writer.write_all(&buf[..n]).await?;
        writer.write_all(b"\r\n").await?;
    }
    writer.write_all(b"0\r\n\r\n").await
}

/// Best-effort answer to a request that could not be parsed. The connection
/// is closed afterwards.
pub(crate) async fn write_error<W>(writer: &mut W, status: Status, message: &str) -> io::Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"));
    headers.insert(CONNECTION, HeaderValue::from_static("close"));
    let body = WireBody::Bytes(Bytes::from(format!("{message}\r\n\r\n")));
    let response = ServerResponse { status, headers, body };
    write_response(writer, response, Method::Get, Version::HTTP_11).await.map(|_| ())
}

/// Interim `100 Continue` for clients that sent `Expect: 100-continue`.
pub(crate) async fn write_continue<W>(writer: &mut W) -> io::Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    writer.write_all(b"HTTP/1.1 100 Continue\r\n\r\n").await?;
    writer.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::BufReader;

    async fn head(wire: &'static [u8]) -> Result<Option<RequestHead>, HeadError> {
        let mut reader = BufReader::new(wire);
        read_head(&mut reader, &ServerConfig::default()).await
    }

    #[tokio::test]
    async fn parses_request_line_and_headers() {
        let head = head(b"\r\nPOST /items?x=1 HTTP/1.1\r\nHost: example.com\r\nX-Tag: a\r\nX-Tag: b\r\n\r\n")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(head.method, Method::Post);
        assert_eq!(head.target, "/items?x=1");
        assert_eq!(head.version, Version::HTTP_11);
        assert_eq!(head.headers.get_all("x-tag").iter().count(), 2);
        assert!(head.keep_alive());
    }

    #[tokio::test]
    async fn clean_eof_between_requests_is_not_an_error() {
        assert!(head(b"").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn malformed_heads_map_to_client_errors() {
        let folded = head(b"GET / HTTP/1.1\r\nX-A: 1\r\n  continued\r\n\r\n").await.unwrap_err();
        assert_eq!(folded.status(), Some(Status::BadRequest));

        let unknown = head(b"BREW /pot HTTP/1.1\r\n\r\n").await.unwrap_err();
        assert_eq!(unknown.status(), Some(Status::NotImplemented));

        let garbage = head(b"nonsense\r\n\r\n").await.unwrap_err();
        assert_eq!(garbage.status(), Some(Status::BadRequest));

        let truncated = head(b"GET / HTTP/1.1\r\nHost: x\r\n").await.unwrap_err();
        assert_eq!(truncated.status(), Some(Status::BadRequest));

        let version = head(b"GET / HTTP/2.0\r\n\r\n").await.unwrap_err();
        assert_eq!(version.status(), Some(Status::HttpVersionNotSupported));
    }

    #[tokio::test]
    async fn http10_keep_alive_is_opt_in() {
        let plain = head(b"GET / HTTP/1.0\r\n\r\n").await.unwrap().unwrap();
        assert!(!plain.keep_alive());
        let kept = head(b"GET / HTTP/1.0\r\nConnection: keep-alive\r\n\r\n").await.unwrap().unwrap();
        assert!(kept.keep_alive());
    }

    #[tokio::test]
    async fn streams_without_length_are_chunked() {
        let mut out = Vec::new();
        let response = ServerResponse {
            status: Status::Ok,
            headers: HeaderMap::new(),
            body: WireBody::Stream(Box::new(&b"hello"[..])),
        };
        let persist = write_response(&mut out, response, Method::Get, Version::HTTP_11).await.unwrap();
        assert!(persist);
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("transfer-encoding: chunked\r\n"));
        assert!(text.ends_with("\r\n\r\n5\r\nhello\r\n0\r\n\r\n"));
    }

    fn stream(headers: HeaderMap, payload: &'static [u8]) -> ServerResponse {
        ServerResponse { status: Status::Ok, headers, body: WireBody::Stream(Box::new(payload)) }
    }

    fn with_length(len: u64) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_LENGTH, HeaderValue::from(len));
        headers
    }

    #[tokio::test]
    async fn http10_streams_are_close_delimited() {
        let mut out = Vec::new();
        let persist = write_response(&mut out, stream(HeaderMap::new(), b"hello"), Method::Get, Version::HTTP_10)
            .await
            .unwrap();
        assert!(!persist);
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("connection: close\r\n"));
        assert!(!text.contains("transfer-encoding"));
        assert!(text.ends_with("\r\n\r\nhello"));
    }

    #[tokio::test]
    async fn declared_lengths_bound_the_stream() {
        let mut out = Vec::new();
        let persist = write_response(&mut out, stream(with_length(5), b"hello, and more"), Method::Get, Version::HTTP_11)
            .await
            .unwrap();
        assert!(persist);
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("content-length: 5\r\n"));
        assert!(text.ends_with("\r\n\r\nhello"));
    }

    #[tokio::test]
    async fn streams_shorter_than_declared_fail() {
        let mut out = Vec::new();
        let err = write_response(&mut out, stream(with_length(10), b"short"), Method::Get, Version::HTTP_11)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn head_responses_keep_headers_but_drop_payload() {
        let mut out = Vec::new();
        let response = ServerResponse {
            status: Status::Ok,
            headers: HeaderMap::new(),
            body: WireBody::Bytes(Bytes::from_static(b"{\"ok\":true}")),
        };
        write_response(&mut out, response, Method::Head, Version::HTTP_11).await.unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("content-length: 11\r\n"));
        assert!(text.ends_with("\r\n\r\n"));
    }
}
