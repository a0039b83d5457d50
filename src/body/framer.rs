//! Request body framing.
//!
//! A [`Body`] turns the bytes that follow a request head into a bounded
//! stream. The framing is decided once, from the headers:
//!
//! | Headers | Framing | Bytes exposed |
//! |---|---|---|
//! | `content-length: N` | [`Framing::ContentLength`] | exactly `N`, then EOF |
//! | `transfer-encoding: …, chunked` | [`Framing::Chunked`] | decoded chunk data until the `0` chunk |
//! | neither | [`Framing::None`] | nothing |
//!
//! The body borrows the connection's read half for the lifetime of one
//! request. Whatever the application leaves unread is discarded by
//! [`Body::finalize`] before the connection reads the next request head.

use std::fmt;
use std::io;

use bytes::{Bytes, BytesMut};
use http::header::{CONTENT_LENGTH, HeaderName, HeaderValue, TRANSFER_ENCODING};
use http::HeaderMap;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, BufReader};

use crate::error::{Error, Result};
use crate::http1::read_line;
use crate::server::BoxedIo;

/// The buffered connection a body is lent while its request is in flight.
pub(crate) type Connection = BufReader<BoxedIo>;

const MAX_CHUNK_LINE: usize = 4 * 1024;
const MAX_TRAILER_LINE: usize = 8 * 1024;
const MAX_TRAILERS: usize = 64;

// ── Framing ───────────────────────────────────────────────────────────────────

/// How the end of a request body is found.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Framing {
    ContentLength(u64),
    Chunked,
    None,
}

impl Framing {
    /// Picks the framing for a request with `headers`.
    ///
    /// `content-length` wins when present. A `transfer-encoding` that does not
    /// list `chunked` cannot be delimited and is a protocol error.
    pub fn from_headers(headers: &HeaderMap) -> Result<Self> {
        if let Some(value) = headers.get(CONTENT_LENGTH) {
            let len = value
                .to_str()
                .ok()
                .and_then(|v| v.trim().parse::<u64>().ok())
                .ok_or_else(|| Error::protocol("invalid content-length"))?;
            return Ok(Self::ContentLength(len));
        }

        if let Some(value) = headers.get(TRANSFER_ENCODING) {
            let chunked = value
                .to_str()
                .map(|v| v.split(',').any(|coding| coding.trim().eq_ignore_ascii_case("chunked")))
                .unwrap_or(false);
            if !chunked {
                return Err(Error::protocol("transfer-encoding must include chunked"));
            }
            return Ok(Self::Chunked);
        }

        Ok(Self::None)
    }
}

// ── Source ────────────────────────────────────────────────────────────────────

enum Source {
    Connection(Box<Connection>),
    Reader(BufReader<Box<dyn AsyncRead + Send + Sync + Unpin>>),
    Detached,
}

impl Source {
    fn reader(&mut self) -> io::Result<&mut (dyn AsyncBufRead + Send + Unpin)> {
        match self {
            Self::Connection(conn) => Ok(conn.as_mut()),
            Self::Reader(reader)   => Ok(reader),
            Self::Detached         => Err(io::Error::new(io::ErrorKind::NotConnected, "body has no source")),
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum State {
    Fixed(u64),
    ChunkSize,
    ChunkData(u64),
    ChunkEnd,
    Done,
}

// ── Body ──────────────────────────────────────────────────────────────────────

/// A single-consumption request body.
///
/// Read it piece by piece with [`chunk`](Body::chunk) or all at once with
/// [`to_bytes`](Body::to_bytes). Most applications go through
/// [`RequestBody`](crate::RequestBody) instead, which picks a decoding from
/// the content type.
pub struct Body {
    source: Source,
    framing: Framing,
    state: State,
    trailers: HeaderMap,
}

impl Body {
    pub(crate) fn from_connection(conn: Connection, framing: Framing) -> Self {
        Self::with_source(Source::Connection(Box::new(conn)), framing)
    }

    /// A body framed by `framing` over an arbitrary reader.
    ///
    /// ```rust
    /// use grove::body::{Body, Framing};
    ///
    /// # async fn run() -> grove::Result<()> {
    /// let wire = &b"5\r\nhello\r\n0\r\n\r\n"[..];
    /// let mut body = Body::from_reader(wire, Framing::Chunked);
    /// assert_eq!(body.to_bytes().await?, "hello");
    /// # Ok(()) }
    /// ```
    pub fn from_reader<R>(reader: R, framing: Framing) -> Self
    where
        R: AsyncRead + Send + Sync + Unpin + 'static,
    {
        let reader: Box<dyn AsyncRead + Send + Sync + Unpin> = Box::new(reader);
        Self::with_source(Source::Reader(BufReader::new(reader)), framing)
    }

    /// A body with no content.
    pub fn empty() -> Self {
        Self::with_source(Source::Detached, Framing::None)
    }

    fn with_source(source: Source, framing: Framing) -> Self {
        let state = match framing {
            Framing::ContentLength(0) | Framing::None => State::Done,
            Framing::ContentLength(n)                 => State::Fixed(n),
            Framing::Chunked                          => State::ChunkSize,
        };
        Self { source, framing, state, trailers: HeaderMap::new() }
    }

    pub fn framing(&self) -> Framing {
        self.framing
    }

    /// Whether the framing announces any bytes at all.
    pub fn has_content(&self) -> bool {
        matches!(self.framing, Framing::Chunked | Framing::ContentLength(1..))
    }

    /// Whether every byte of the body has been read.
    pub fn is_finished(&self) -> bool {
        self.state == State::Done
    }

    /// Trailer headers sent after the terminal chunk. Empty until the chunked
    /// body has been read to the end.
    pub fn trailers(&self) -> &HeaderMap {
        &self.trailers
    }

    /// Reads the next piece of body data, or `None` at the end of the body.
    ///
    /// Pieces are whatever the connection buffer holds; their sizes carry no
    /// meaning.
    pub async fn chunk(&mut self) -> Result<Option<Bytes>> {
        loop {
            match self.state {
                State::Done => return Ok(None),

                State::Fixed(remaining) => {
                    let data = self.read_data(remaining).await?.ok_or_else(|| {
                        Error::Io(io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            format!("connection closed with {remaining} body bytes outstanding"),
                        ))
                    })?;
                    let left = remaining - data.len() as u64;
                    self.state = if left == 0 { State::Done } else { State::Fixed(left) };
                    return Ok(Some(data));
                }

                State::ChunkSize => {
                    let line = self.next_line(MAX_CHUNK_LINE).await?;
                    let size = parse_chunk_size(&line)?;
                    if size == 0 {
                        self.read_trailers().await?;
                        self.state = State::Done;
                    } else {
                        self.state = State::ChunkData(size);
                    }
                }

                State::ChunkData(remaining) => {
                    let data = self
                        .read_data(remaining)
                        .await?
                        .ok_or_else(|| Error::protocol("connection closed inside a chunk"))?;
                    let left = remaining - data.len() as u64;
                    self.state = if left == 0 { State::ChunkEnd } else { State::ChunkData(left) };
                    return Ok(Some(data));
                }

                State::ChunkEnd => {
                    if !self.next_line(MAX_CHUNK_LINE).await?.is_empty() {
                        return Err(Error::protocol("chunk data not followed by CRLF"));
                    }
                    self.state = State::ChunkSize;
                }
            }
        }
    }

    /// Reads the rest of the body into one buffer.
    pub async fn to_bytes(&mut self) -> Result<Bytes> {
        let mut out = BytesMut::new();
        while let Some(chunk) = self.chunk().await? {
            out.extend_from_slice(&chunk);
        }
        Ok(out.freeze())
    }

    /// Reads and discards whatever the application left unread so the
    /// connection is positioned at the next request head.
    pub async fn finalize(&mut self) -> Result<()> {
        while self.chunk().await?.is_some() {}
        Ok(())
    }

    pub(crate) fn connection_mut(&mut self) -> Option<&mut Connection> {
        match &mut self.source {
            Source::Connection(conn) => Some(conn.as_mut()),
            _ => None,
        }
    }

    /// Hands the connection back once the body is fully consumed.
    pub(crate) fn into_connection(self) -> Option<Connection> {
        match (self.state, self.source) {
            (State::Done, Source::Connection(conn)) => Some(*conn),
            _ => None,
        }
    }

    async fn read_data(&mut self, remaining: u64) -> Result<Option<Bytes>> {
        let reader = self.source.reader()?;
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            return Ok(None);
        }
        let n = available.len().min(usize::try_from(remaining).unwrap_or(usize::MAX));
        let data = Bytes::copy_from_slice(&available[..n]);
        reader.consume(n);
        Ok(Some(data))
    }

    async fn next_line(&mut self, limit: usize) -> Result<Vec<u8>> {
        let reader = self.source.reader()?;
        match read_line(reader, limit).await {
            Ok(Some(line)) => Ok(line),
            Ok(None) => Err(Error::protocol("connection closed before the terminal chunk")),
            Err(e) if e.kind() == io::ErrorKind::InvalidData => Err(Error::protocol("chunk line too long")),
            Err(e) => Err(e.into()),
        }
    }

    async fn read_trailers(&mut self) -> Result<()> {
        for _ in 0..=MAX_TRAILERS {
            let line = self.next_line(MAX_TRAILER_LINE).await?;
            if line.is_empty() {
                return Ok(());
            }
            let (name, value) = split_header(&line).ok_or_else(|| Error::protocol("malformed trailer"))?;
            self.trailers.append(name, value);
        }
        Err(Error::protocol("too many trailers"))
    }
}

impl Default for Body {
    fn default() -> Self {
        Self::empty()
    }
}

impl fmt::Debug for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Body")
            .field("framing", &self.framing)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl From<Bytes> for Body {
    fn from(bytes: Bytes) -> Self {
        let framing = Framing::ContentLength(bytes.len() as u64);
        Self::from_reader(io::Cursor::new(bytes), framing)
    }
}

impl From<Vec<u8>> for Body {
    fn from(bytes: Vec<u8>) -> Self {
        Bytes::from(bytes).into()
    }
}

impl From<String> for Body {
    fn from(text: String) -> Self {
        Bytes::from(text).into()
    }
}

impl From<&'static str> for Body {
    fn from(text: &'static str) -> Self {
        Bytes::from_static(text.as_bytes()).into()
    }
}

// ── Helpers ───────────────────────────────────────────────────────────────────

/// `1a;name=value` → `26`. Extensions after `;` are ignored.
fn parse_chunk_size(line: &[u8]) -> Result<u64> {
    let size = line.split(|&b| b == b';').next().unwrap_or_default();
    let size = std::str::from_utf8(size)
        .map(|s| s.trim_matches([' ', '\t']))
        .map_err(|_| Error::protocol("invalid chunk size"))?;
    if size.is_empty() || !size.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(Error::protocol(format!("invalid chunk size `{size}`")));
    }
    u64::from_str_radix(size, 16).map_err(|_| Error::protocol("chunk size overflows"))
}

/// Splits `name: value` into typed header parts.
pub(crate) fn split_header(line: &[u8]) -> Option<(HeaderName, HeaderValue)> {
    let colon = line.iter().position(|&b| b == b':')?;
    let name = HeaderName::from_bytes(&line[..colon]).ok()?;
    let value = line[colon + 1..].trim_ascii();
    let value = HeaderValue::from_bytes(value).ok()?;
    Some((name, value))
}
