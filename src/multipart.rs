//! Streaming `multipart/form-data` decoder.
//!
//! The decoder reads the body as a sequence of *segments*: a line, or a slice
//! of at most `buffer_size` bytes when a line is longer than that. Memory is
//! therefore bounded by the buffer size no matter how long a binary line in
//! an uploaded file is. A boundary can only start a line, so only segments at
//! a line start are compared against it.
//!
//! The line break in front of a boundary belongs to the delimiter, not to the
//! part. Each segment's line break is held back until the next segment shows
//! it was not followed by a boundary, which keeps decoded content
//! byte-identical to what the client encoded.
//!
//! Parts with a `Content-Type` are files. They stay in memory while they fit
//! in [`MultipartOptions::max_size`] and are spooled to disk past it (with
//! the default `max_size` of `0` every file is spooled). Files larger than
//! [`MultipartOptions::max_file_size`] abort the decode with `413` and the
//! partial file is removed.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};

use bytes::{Bytes, BytesMut};
use once_cell::sync::Lazy;
use regex::Regex;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{debug, error};

use crate::body::Body;
use crate::error::{Error, HttpError, Result};
use crate::mime;
use crate::util::random_filename;

const DEFAULT_READ_BUFFER: usize = 1_048_576;
const DEFAULT_STREAM_BUFFER: usize = 32_000;
const DEFAULT_MAX_FILE_SIZE: u64 = 10_485_760;
const MAX_PART_HEADERS: usize = 32;
const MAX_PART_HEADER_LINE: usize = 16 * 1024;

const CRLF: &[u8] = b"\r\n";
const LF: &[u8] = b"\n";

fn param_regex(name: &str) -> Regex {
    Regex::new(&format!(r#"(?i)(?:^|;)\s*{name}\s*=\s*("(?:[^"\\]|\\.)*"|[^;\s]+)"#))
        .unwrap_or_else(|e| panic!("{name} parameter pattern: {e}"))
}

static BOUNDARY: Lazy<Regex> = Lazy::new(|| param_regex("boundary"));
static NAME: Lazy<Regex> = Lazy::new(|| param_regex("name"));
static FILENAME: Lazy<Regex> = Lazy::new(|| param_regex("filename"));
static FILENAME_EXT: Lazy<Regex> = Lazy::new(|| param_regex(r"filename\*"));
static FORM_DATA: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^\s*form-data\s*;").unwrap_or_else(|e| panic!("form-data pattern: {e}")));

// ── Options ───────────────────────────────────────────────────────────────────

/// Limits and spooling behaviour for one decode.
#[derive(Clone, Debug)]
pub struct MultipartOptions {
    /// Directory for spooled files. A fresh temporary directory is created
    /// on first use when unset.
    pub out_path: Option<PathBuf>,
    /// Prepended to every spooled file name.
    pub prefix: String,
    /// Largest accepted file (and text field), in bytes.
    pub max_file_size: u64,
    /// Files up to this many bytes stay in memory.
    pub max_size: u64,
    /// Longest segment held in memory at once. Defaults to 1 MiB for
    /// [`FormDataReader::read`] and 32 000 bytes for
    /// [`FormDataReader::stream`].
    pub buffer_size: Option<usize>,
}

impl Default for MultipartOptions {
    fn default() -> Self {
        Self {
            out_path: None,
            prefix: String::new(),
            max_file_size: DEFAULT_MAX_FILE_SIZE,
            max_size: 0,
            buffer_size: None,
        }
    }
}

impl MultipartOptions {
    pub fn out_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.out_path = Some(path.into());
        self
    }

    pub fn prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn max_file_size(mut self, bytes: u64) -> Self {
        self.max_file_size = bytes;
        self
    }

    pub fn max_size(mut self, bytes: u64) -> Self {
        self.max_size = bytes;
        self
    }

    /// Largest segment held in memory while scanning for a boundary. Raised
    /// to the length of the closing boundary line when smaller.
    pub fn buffer_size(mut self, bytes: usize) -> Self {
        self.buffer_size = Some(bytes.max(2));
        self
    }
}

// ── Parts ─────────────────────────────────────────────────────────────────────

/// An uploaded file.
#[derive(Clone, Debug)]
pub struct FormDataFile {
    /// The form field name.
    pub name: String,
    pub content_type: String,
    /// The client-side file name, when one was sent.
    pub original_name: Option<String>,
    /// Where the file was spooled. `None` when it stayed in memory.
    pub filename: Option<PathBuf>,
    /// The content when it stayed in memory.
    pub content: Option<Bytes>,
}

/// One decoded part.
#[derive(Clone, Debug)]
pub enum Part {
    Field { name: String, value: String },
    File(FormDataFile),
}

/// The eager result of [`FormDataReader::read`].
#[derive(Clone, Debug, Default)]
pub struct FormDataBody {
    pub fields: HashMap<String, String>,
    pub files: Vec<FormDataFile>,
}

// ── Reader ────────────────────────────────────────────────────────────────────

/// Decodes one `multipart/form-data` body. Either [`read`](Self::read) or
/// [`stream`](Self::stream) may be called, once.
#[derive(Debug)]
pub struct FormDataReader<'b> {
    body: Option<&'b mut Body>,
    part: Vec<u8>,
    last: Vec<u8>,
}

impl<'b> FormDataReader<'b> {
    /// Fails with `400` when `content_type` carries no boundary.
    pub fn new(content_type: &str, body: &'b mut Body) -> Result<Self> {
        let boundary = BOUNDARY
            .captures(content_type)
            .and_then(|c| c.get(1))
            .map(|m| unquote(m.as_str()))
            .filter(|b| !b.is_empty())
            .ok_or_else(|| {
                HttpError::bad_request(format!("Content type \"{content_type}\" does not contain a valid boundary."))
            })?;

        Ok(Self {
            body: Some(body),
            part: format!("--{boundary}").into_bytes(),
            last: format!("--{boundary}--").into_bytes(),
        })
    }

    /// Decodes every part into a [`FormDataBody`].
    ///
    /// A permission error while spooling is logged and ends the decode early
    /// with the parts read so far; every other error is returned.
    pub async fn read(&mut self, options: &MultipartOptions) -> Result<FormDataBody> {
        let mut parts = self.open(options.clone(), DEFAULT_READ_BUFFER)?;
        let mut result = FormDataBody::default();
        loop {
            match parts.next().await {
                Ok(Some(Part::Field { name, value })) => {
                    result.fields.insert(name, value);
                }
                Ok(Some(Part::File(file))) => result.files.push(file),
                Ok(None) => break,
                Err(Error::Io(e)) if e.kind() == io::ErrorKind::PermissionDenied => {
                    error!(error = %e, "permission denied while spooling form data");
                    break;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(result)
    }

    /// Yields parts one at a time. Every error is returned as is.
    pub fn stream(&mut self, options: MultipartOptions) -> Result<FormDataStream<'b>> {
        self.open(options, DEFAULT_STREAM_BUFFER)
    }

    fn open(&mut self, options: MultipartOptions, default_buffer: usize) -> Result<FormDataStream<'b>> {
        let body = self.body.take().ok_or(Error::BodyConsumed)?;
        // "--boundary--\r\n" must fit in one segment or it is never seen.
        let limit = options.buffer_size.unwrap_or(default_buffer).max(self.last.len() + 2);
        Ok(FormDataStream {
            segments: Segments::new(body, limit),
            part: std::mem::take(&mut self.part),
            last: std::mem::take(&mut self.last),
            out_dir: options.out_path.clone(),
            options,
            stage: Stage::Preamble,
        })
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Stage {
    Preamble,
    Parts,
    Done,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Delimiter {
    Next,
    Last,
}

/// Incremental decoder returned by [`FormDataReader::stream`].
#[derive(Debug)]
pub struct FormDataStream<'b> {
    segments: Segments<'b>,
    part: Vec<u8>,
    last: Vec<u8>,
    options: MultipartOptions,
    out_dir: Option<PathBuf>,
    stage: Stage,
}

impl FormDataStream<'_> {
    /// The next part, or `None` after the closing boundary.
    pub async fn next(&mut self) -> Result<Option<Part>> {
        if self.stage == Stage::Preamble {
            self.stage = match self.seek_first_boundary().await? {
                Delimiter::Next => Stage::Parts,
                Delimiter::Last => Stage::Done,
            };
        }
        if self.stage == Stage::Done {
            return Ok(None);
        }

        let result = self.next_part().await;
        match &result {
            Ok((_, Delimiter::Last)) | Err(_) => self.stage = Stage::Done,
            Ok((_, Delimiter::Next)) => {}
        }
        result.map(|(part, _)| Some(part))
    }

    fn delimiter(&self, segment: &[u8]) -> Option<Delimiter> {
        let trimmed = trim_trailing_lwsp(segment);
        if trimmed == self.last.as_slice() {
            Some(Delimiter::Last)
        } else if trimmed == self.part.as_slice() {
            Some(Delimiter::Next)
        } else {
            None
        }
    }

    async fn seek_first_boundary(&mut self) -> Result<Delimiter> {
        let mut line_start = true;
        while let Some(segment) = self.segments.next().await? {
            if line_start && let Some(delimiter) = self.delimiter(&segment.content) {
                return Ok(delimiter);
            }
            line_start = segment.ends_line();
        }
        Err(HttpError::bad_request("Unable to find multi-part boundary.").into())
    }

    async fn next_part(&mut self) -> Result<(Part, Delimiter)> {
        let headers = self.read_part_headers().await?;
        let header = |name: &str| headers.iter().find(|(k, _)| k == name).map(|(_, v)| v.as_str());

        let disposition = header("content-disposition")
            .ok_or_else(|| HttpError::bad_request("Form data part missing content-disposition header"))?;
        if !FORM_DATA.is_match(disposition) {
            return Err(HttpError::bad_request(format!("Unexpected content-disposition header: \"{disposition}\"")).into());
        }
        let name = NAME
            .captures(disposition)
            .and_then(|c| c.get(1))
            .map(|m| unquote(m.as_str()))
            .ok_or_else(|| HttpError::bad_request("Unable to determine name of form body part"))?;

        match header("content-type") {
            Some(content_type) => {
                let original_name = original_filename(disposition);
                let content_type = content_type.to_owned();
                let (file, delimiter) = self.read_file(name, content_type, original_name).await?;
                Ok((Part::File(file), delimiter))
            }
            None => {
                let (value, delimiter) = self.read_field().await?;
                Ok((Part::Field { name, value }, delimiter))
            }
        }
    }

    async fn read_part_headers(&mut self) -> Result<Vec<(String, String)>> {
        let mut headers = Vec::new();
        loop {
            // Header lines may span several segments when the buffer is small.
            let mut line = BytesMut::new();
            loop {
                let segment = self
                    .segments
                    .next()
                    .await?
                    .ok_or_else(|| HttpError::bad_request("Unexpected EOF reached"))?;
                line.extend_from_slice(&segment.content);
                if line.len() > MAX_PART_HEADER_LINE {
                    return Err(HttpError::bad_request("Form data part header is too long").into());
                }
                if segment.ends_line() {
                    break;
                }
            }
            if line.is_empty() {
                return Ok(headers);
            }
            if headers.len() == MAX_PART_HEADERS {
                return Err(HttpError::bad_request("Form data part has too many headers").into());
            }
            let line = String::from_utf8_lossy(&line);
            let (key, value) = line
                .split_once(':')
                .ok_or_else(|| HttpError::bad_request(format!("Malformed form data part header: \"{line}\"")))?;
            headers.push((key.trim().to_ascii_lowercase(), value.trim().to_owned()));
        }
    }

    async fn read_field(&mut self) -> Result<(String, Delimiter)> {
        let mut value = BytesMut::new();
        let mut held: &'static [u8] = b"";
        let mut line_start = true;
        loop {
            let segment = self
                .segments
                .next()
                .await?
                .ok_or_else(|| HttpError::bad_request("Unexpected EOF reached"))?;
            if line_start && let Some(delimiter) = self.delimiter(&segment.content) {
                return Ok((String::from_utf8_lossy(&value).into_owned(), delimiter));
            }
            if (value.len() + held.len() + segment.content.len()) as u64 > self.options.max_file_size {
                return Err(HttpError::payload_too_large(format!(
                    "Field size exceeds limit of {} bytes.",
                    self.options.max_file_size
                ))
                .into());
            }
            value.extend_from_slice(held);
            value.extend_from_slice(&segment.content);
            held = segment.eol;
            line_start = segment.ends_line();
        }
    }

    async fn read_file(
        &mut self,
        name: String,
        content_type: String,
        original_name: Option<String>,
    ) -> Result<(FormDataFile, Delimiter)> {
        let ext = mime::extension(&content_type)
            .ok_or_else(|| HttpError::bad_request(format!("Invalid media type for part: {content_type}")))?;

        let mut sink = if self.options.max_size > 0 {
            Sink::Memory(BytesMut::new())
        } else {
            self.spool_file(ext).await?
        };

        match self.copy_file_content(&mut sink, ext).await {
            Ok(delimiter) => {
                let (filename, content) = sink.finish().await?;
                let file = FormDataFile { name, content_type, original_name, filename, content };
                Ok((file, delimiter))
            }
            Err(e) => {
                sink.discard().await;
                Err(e)
            }
        }
    }

    async fn copy_file_content(&mut self, sink: &mut Sink, ext: &str) -> Result<Delimiter> {
        let max_file_size = self.options.max_file_size;
        let max_size = self.options.max_size;
        let mut written: u64 = 0;
        let mut held: &'static [u8] = b"";
        let mut line_start = true;

        loop {
            let segment = self
                .segments
                .next()
                .await?
                .ok_or_else(|| HttpError::bad_request("Unexpected EOF reached"))?;
            if line_start && let Some(delimiter) = self.delimiter(&segment.content) {
                return Ok(delimiter);
            }

            written += (held.len() + segment.content.len()) as u64;
            if written > max_file_size {
                return Err(HttpError::payload_too_large(format!("File size exceeds limit of {max_file_size} bytes.")).into());
            }
            if let Sink::Memory(buffered) = sink
                && written > max_size
            {
                let buffered = std::mem::take(buffered);
                let mut spooled = self.spool_file(ext).await?;
                spooled.write(&buffered).await?;
                *sink = spooled;
            }

            sink.write(held).await?;
            sink.write(&segment.content).await?;
            held = segment.eol;
            line_start = segment.ends_line();
        }
    }

    async fn spool_file(&mut self, ext: &str) -> Result<Sink> {
        let dir = match &self.out_dir {
            Some(dir) => dir.clone(),
            None => {
                let dir = std::env::temp_dir().join(random_filename("grove-", ""));
                tokio::fs::create_dir_all(&dir).await?;
                self.out_dir = Some(dir.clone());
                dir
            }
        };
        let path = dir.join(random_filename(&self.options.prefix, ext));
        let file = OpenOptions::new().write(true).create_new(true).open(&path).await?;
        debug!(path = %path.display(), "spooling form data file");
        Ok(Sink::File { path, file })
    }
}

// ── Sink ──────────────────────────────────────────────────────────────────────

enum Sink {
    Memory(BytesMut),
    File { path: PathBuf, file: File },
}

impl Sink {
    async fn write(&mut self, data: &[u8]) -> Result<()> {
        match self {
            Self::Memory(buf)       => buf.extend_from_slice(data),
            Self::File { file, .. } => file.write_all(data).await?,
        }
        Ok(())
    }

    async fn finish(self) -> Result<(Option<PathBuf>, Option<Bytes>)> {
        match self {
            Self::Memory(buf) => Ok((None, Some(buf.freeze()))),
            Self::File { path, mut file } => {
                file.flush().await?;
                Ok((Some(path), None))
            }
        }
    }

    /// Closes and removes a partially written file.
    async fn discard(self) {
        if let Self::File { path, mut file } = self {
            let _ = file.flush().await;
            drop(file);
            if let Err(e) = tokio::fs::remove_file(&path).await {
                debug!(path = %path.display(), "could not remove partial upload: {e}");
            }
        }
    }
}

// ── Segments ──────────────────────────────────────────────────────────────────

struct Segment {
    content: Bytes,
    /// The line break that ended the segment; empty for a slice of a longer
    /// line or the tail of the body.
    eol: &'static [u8],
}

impl Segment {
    fn ends_line(&self) -> bool {
        !self.eol.is_empty()
    }
}

struct Segments<'b> {
    body: &'b mut Body,
    buf: BytesMut,
    limit: usize,
    eof: bool,
}

impl std::fmt::Debug for Segments<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Segments").field("buffered", &self.buf.len()).field("limit", &self.limit).finish()
    }
}

impl<'b> Segments<'b> {
    fn new(body: &'b mut Body, limit: usize) -> Self {
        Self { body, buf: BytesMut::new(), limit: limit.max(2), eof: false }
    }

    async fn next(&mut self) -> Result<Option<Segment>> {
        loop {
            let window = self.buf.len().min(self.limit);
            if let Some(i) = self.buf[..window].iter().position(|&b| b == b'\n') {
                let line = self.buf.split_to(i + 1).freeze();
                let segment = if i > 0 && line[i - 1] == b'\r' {
                    Segment { content: line.slice(..i - 1), eol: CRLF }
                } else {
                    Segment { content: line.slice(..i), eol: LF }
                };
                return Ok(Some(segment));
            }

            if self.buf.len() >= self.limit {
                // Never split a CRLF pair across two segments.
                let mut n = self.limit;
                if self.buf[n - 1] == b'\r' {
                    n -= 1;
                }
                return Ok(Some(Segment { content: self.buf.split_to(n).freeze(), eol: b"" }));
            }

            if self.eof {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                let rest = self.buf.split().freeze();
                return Ok(Some(Segment { content: rest, eol: b"" }));
            }

            match self.body.chunk().await? {
                Some(chunk) => self.buf.extend_from_slice(&chunk),
                None => self.eof = true,
            }
        }
    }
}

// ── Helpers ───────────────────────────────────────────────────────────────────

fn trim_trailing_lwsp(bytes: &[u8]) -> &[u8] {
    let end = bytes
        .iter()
        .rposition(|b| !matches!(b, b' ' | b'\t' | b'\r' | b'\n'))
        .map_or(0, |i| i + 1);
    &bytes[..end]
}

/// Strips surrounding quotes and backslash escapes.
fn unquote(value: &str) -> String {
    let Some(inner) = value.strip_prefix('"').and_then(|v| v.strip_suffix('"')) else {
        return value.to_owned();
    };
    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => out.extend(chars.next()),
            c    => out.push(c),
        }
    }
    out
}

/// The client's file name, preferring the RFC 5987 `filename*` form.
fn original_filename(disposition: &str) -> Option<String> {
    if let Some(m) = FILENAME_EXT.captures(disposition).and_then(|c| c.get(1)) {
        let value = unquote(m.as_str());
        if let Some((_, encoded)) = value.split_once("''")
            && let Ok(decoded) = urlencoding::decode(encoded)
        {
            return Some(decoded.into_owned());
        }
    }
    FILENAME
        .captures(disposition)
        .and_then(|c| c.get(1))
        .map(|m| unquote(m.as_str()))
        .map(|name| base_name(&name).to_owned())
}

/// Browsers on some platforms send full client paths.
fn base_name(name: &str) -> &str {
    Path::new(name)
        .file_name()
        .and_then(|n| n.to_str())
        .map_or(name, |n| n.rsplit('\\').next().unwrap_or(n))
}
