//! Unified error type.
//!
//! Two kinds of failure flow through grove:
//!
//! - [`HttpError`] carries an HTTP status, a message and an `expose` flag.
//!   Middleware returns it (via `?` or [`Context::throw`](crate::Context::throw))
//!   and the application turns it into a response.
//! - Every other [`Error`] variant is an infrastructure failure (socket I/O,
//!   wire framing, misuse of a consumed body). The application answers those
//!   with a generic `500`, except where [`Error::status`] says otherwise.

use std::io;

use http::header::{HeaderName, HeaderValue};
use http::HeaderMap;

use crate::status::Status;

/// Convenience alias used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The error type returned by grove's fallible operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Http(#[from] HttpError),

    #[error("io: {0}")]
    Io(#[from] io::Error),

    /// Malformed wire data: bad chunk size, missing terminal chunk,
    /// transfer-encoding without `chunked`.
    #[error("protocol: {0}")]
    Protocol(String),

    #[error("the response is not writable")]
    NotWritable,

    #[error("body is already being read")]
    BodyConsumed,

    #[error("json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid address passed: `{0}`")]
    InvalidAddress(String),

    #[error("could not resolve named route `{0}`")]
    RouteNotFound(String),

    /// A reverse-routing parameter was missing or failed its pattern.
    #[error("url parameter: {0}")]
    UrlParam(String),

    #[error("there is no middleware to process requests")]
    NoMiddleware,

    /// A header name or value that cannot go on the wire.
    #[error("invalid header: {0}")]
    InvalidHeader(String),

    #[error("invalid cookie: {0}")]
    InvalidCookie(String),

    /// A middleware panicked; the payload is rendered as text.
    #[error("middleware panicked: {0}")]
    Panic(String),
}

impl Error {
    /// The HTTP status the application answers with when this error escapes
    /// the middleware chain.
    pub fn status(&self) -> Status {
        match self {
            Self::Http(e) => e.status,
            Self::Io(e) if e.kind() == io::ErrorKind::NotFound => Status::NotFound,
            Self::Protocol(_) | Self::Json(_) => Status::BadRequest,
            _ => Status::InternalServerError,
        }
    }

    /// Whether the message is safe to send to the client.
    pub fn expose(&self) -> bool {
        match self {
            Self::Http(e) => e.expose,
            _             => false,
        }
    }

    /// Headers the error wants copied onto the error response.
    pub fn headers(&self) -> Option<&HeaderMap> {
        match self {
            Self::Http(e) => Some(&e.headers),
            _             => None,
        }
    }

    pub(crate) fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol(message.into())
    }
}

// ── HttpError ────────────────────────────────────────────────────────────────

/// An error with HTTP semantics.
///
/// `expose` defaults to `true` for client errors (`4xx`) and `false` for
/// server errors, so internal details of a `500` never reach the client unless
/// asked for.
///
/// ```rust
/// use grove::{HttpError, Status};
///
/// let err = HttpError::new(Status::Forbidden, "no access to this board");
/// assert!(err.expose);
///
/// let err = HttpError::from_status(Status::BadGateway);
/// assert_eq!(err.message, "Bad Gateway");
/// assert!(!err.expose);
/// ```
#[derive(Clone, Debug, thiserror::Error)]
#[error("{message}")]
pub struct HttpError {
    pub status: Status,
    pub message: String,
    pub expose: bool,
    pub headers: HeaderMap,
}

impl HttpError {
    pub fn new(status: Status, message: impl Into<String>) -> Self {
        Self {
            expose: status.code() < 500,
            status,
            message: message.into(),
            headers: HeaderMap::new(),
        }
    }

    /// An error whose message is the canonical reason phrase.
    pub fn from_status(status: Status) -> Self {
        Self::new(status, status.reason())
    }

    pub fn with_expose(mut self, expose: bool) -> Self {
        self.expose = expose;
        self
    }

    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(Status::BadRequest, message)
    }

    pub fn not_found() -> Self {
        Self::from_status(Status::NotFound)
    }

    pub fn method_not_allowed() -> Self {
        Self::from_status(Status::MethodNotAllowed)
    }

    pub fn payload_too_large(message: impl Into<String>) -> Self {
        Self::new(Status::ContentTooLarge, message)
    }

    pub fn unsupported_media_type(message: impl Into<String>) -> Self {
        Self::new(Status::UnsupportedMediaType, message)
    }

    pub fn not_implemented() -> Self {
        Self::from_status(Status::NotImplemented)
    }
}
