//! Content-type driven body decoding.
//!
//! A body is consumed one way only. Raw reads (`bytes`, `text`, `json`,
//! `form`) share one memoised buffer and may be repeated; a
//! [`reader`](RequestBody::reader) or a [`form_data`](RequestBody::form_data)
//! decoder takes the stream itself, after which every other mode fails with
//! [`Error::BodyConsumed`].

use bytes::Bytes;
use http::header::{CONTENT_ENCODING, CONTENT_TYPE};
use http::HeaderMap;
use serde::de::DeserializeOwned;

use super::framer::Body;
use super::media_type::is_media_type;
use crate::error::{Error, HttpError, Result};
use crate::multipart::FormDataReader;

/// The shape a body is decoded into.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BodyType {
    Bytes,
    Form,
    FormData,
    Json,
    Reader,
    Text,
    /// The request carries no body.
    Undefined,
}

/// Media types that select each decoding, in the shorthand accepted by
/// [`is_media_type`].
#[derive(Clone, Debug)]
pub struct ContentTypes {
    pub json: Vec<String>,
    pub form: Vec<String>,
    pub form_data: Vec<String>,
    pub text: Vec<String>,
}

impl Default for ContentTypes {
    fn default() -> Self {
        let owned = |types: &[&str]| types.iter().map(|t| (*t).to_owned()).collect();
        Self {
            json: owned(&["json", "application/*+json", "application/csp-report"]),
            form: owned(&["urlencoded"]),
            form_data: owned(&["multipart"]),
            text: owned(&["text"]),
        }
    }
}

impl ContentTypes {
    pub fn with_json(mut self, media_type: impl Into<String>) -> Self {
        self.json.push(media_type.into());
        self
    }

    pub fn with_form(mut self, media_type: impl Into<String>) -> Self {
        self.form.push(media_type.into());
        self
    }

    pub fn with_form_data(mut self, media_type: impl Into<String>) -> Self {
        self.form_data.push(media_type.into());
        self
    }

    pub fn with_text(mut self, media_type: impl Into<String>) -> Self {
        self.text.push(media_type.into());
        self
    }
}

/// Options for [`RequestBody::value`].
#[derive(Clone, Debug, Default)]
pub struct BodyOptions {
    /// Decode as this type regardless of the content type.
    pub kind: Option<BodyType>,
    pub content_types: ContentTypes,
}

impl BodyOptions {
    pub fn kind(mut self, kind: BodyType) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn content_types(mut self, content_types: ContentTypes) -> Self {
        self.content_types = content_types;
        self
    }
}

/// A decoded body.
#[derive(Debug)]
pub enum BodyValue<'a> {
    Undefined,
    Bytes(Bytes),
    Text(String),
    Json(serde_json::Value),
    Form(Vec<(String, String)>),
    FormData(FormDataReader<'a>),
    Reader(&'a mut Body),
}

#[derive(Debug)]
enum Consumed {
    Nothing,
    Raw(Bytes),
    Reader,
    FormData,
    /// A raw read failed partway; the stream position is unknown.
    Failed,
}

/// The body of a [`Request`](crate::Request), decoded on demand.
#[derive(Debug)]
pub struct RequestBody {
    body: Body,
    content_type: Option<String>,
    content_encoding: Option<String>,
    consumed: Consumed,
}

impl Default for RequestBody {
    fn default() -> Self {
        Self::new(Body::empty(), &HeaderMap::new())
    }
}

impl RequestBody {
    pub(crate) fn new(body: Body, headers: &HeaderMap) -> Self {
        let header = |name| headers.get(name).and_then(|v| v.to_str().ok()).map(str::to_owned);
        Self {
            body,
            content_type: header(CONTENT_TYPE),
            content_encoding: header(CONTENT_ENCODING),
            consumed: Consumed::Nothing,
        }
    }

    /// Whether the request announced a body: a transfer-encoding or a
    /// non-zero content-length.
    pub fn has_body(&self) -> bool {
        self.body.has_content()
    }

    /// The decoding [`value`](Self::value) would pick for these content types.
    pub fn kind(&self, content_types: &ContentTypes) -> BodyType {
        if !self.has_body() {
            return BodyType::Undefined;
        }
        let Some(content_type) = self.content_type.as_deref() else {
            return BodyType::Bytes;
        };
        match content_type {
            t if is_media_type(t, &content_types.json)      => BodyType::Json,
            t if is_media_type(t, &content_types.form)      => BodyType::Form,
            t if is_media_type(t, &content_types.form_data) => BodyType::FormData,
            t if is_media_type(t, &content_types.text)      => BodyType::Text,
            _                                                => BodyType::Bytes,
        }
    }

    /// Decodes the body according to its content type, or as `options.kind`
    /// when set.
    ///
    /// ```rust
    /// use grove::{BodyValue, Method, Request};
    /// use http::header::{HeaderValue, CONTENT_TYPE};
    ///
    /// # async fn run() -> grove::Result<()> {
    /// let mut request = Request::new(Method::Post, "http://localhost/items")?
    ///     .with_header(CONTENT_TYPE, HeaderValue::from_static("application/json"))
    ///     .with_body(r#"{"name":"tea"}"#);
    ///
    /// match request.body.value(Default::default()).await? {
    ///     BodyValue::Json(value) => assert_eq!(value["name"], "tea"),
    ///     other => panic!("unexpected body {other:?}"),
    /// }
    /// # Ok(()) }
    /// ```
    pub async fn value(&mut self, options: BodyOptions) -> Result<BodyValue<'_>> {
        let kind = match options.kind {
            Some(BodyType::Undefined) => {
                return Err(HttpError::bad_request("Cannot read a body as undefined").into());
            }
            Some(kind) if !self.has_body() => {
                return Err(HttpError::bad_request(format!("Body is undefined and cannot be read as {kind:?}")).into());
            }
            Some(kind) => kind,
            None => self.kind(&options.content_types),
        };

        Ok(match kind {
            BodyType::Undefined => BodyValue::Undefined,
            BodyType::Bytes     => BodyValue::Bytes(self.bytes().await?),
            BodyType::Text      => BodyValue::Text(self.text().await?),
            BodyType::Json      => BodyValue::Json(self.json().await?),
            BodyType::Form      => BodyValue::Form(self.form().await?),
            BodyType::FormData  => BodyValue::FormData(self.form_data()?),
            BodyType::Reader    => BodyValue::Reader(self.reader()?),
        })
    }

    /// The whole body. Memoised, so it can be called repeatedly. After a
    /// failed read every later read fails with [`Error::BodyConsumed`].
    pub async fn bytes(&mut self) -> Result<Bytes> {
        match &self.consumed {
            Consumed::Raw(bytes)                                     => return Ok(bytes.clone()),
            Consumed::Reader | Consumed::FormData | Consumed::Failed => return Err(Error::BodyConsumed),
            Consumed::Nothing                                        => {}
        }
        self.check_encoding()?;
        match self.body.to_bytes().await {
            Ok(bytes) => {
                self.consumed = Consumed::Raw(bytes.clone());
                Ok(bytes)
            }
            Err(e) => {
                self.consumed = Consumed::Failed;
                Err(e)
            }
        }
    }

    /// The body as UTF-8 text; invalid sequences are replaced.
    pub async fn text(&mut self) -> Result<String> {
        let bytes = self.bytes().await?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// The body deserialized from JSON. A parse failure is a `400`.
    pub async fn json<T: DeserializeOwned>(&mut self) -> Result<T> {
        let bytes = self.bytes().await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// The body as `application/x-www-form-urlencoded` pairs, in order.
    pub async fn form(&mut self) -> Result<Vec<(String, String)>> {
        let bytes = self.bytes().await?;
        Ok(url::form_urlencoded::parse(&bytes).into_owned().collect())
    }

    /// A `multipart/form-data` decoder over the body stream.
    pub fn form_data(&mut self) -> Result<FormDataReader<'_>> {
        if !matches!(self.consumed, Consumed::Nothing) {
            return Err(Error::BodyConsumed);
        }
        self.check_encoding()?;
        let content_type = self.content_type.as_deref().unwrap_or_default();
        let reader = FormDataReader::new(content_type, &mut self.body)?;
        self.consumed = Consumed::FormData;
        Ok(reader)
    }

    /// The raw framed stream.
    pub fn reader(&mut self) -> Result<&mut Body> {
        match self.consumed {
            Consumed::Nothing | Consumed::Reader => {}
            _ => return Err(Error::BodyConsumed),
        }
        self.check_encoding()?;
        self.consumed = Consumed::Reader;
        Ok(&mut self.body)
    }

    /// Re-reads the content headers after the request's headers changed.
    pub(crate) fn refresh(&mut self, headers: &HeaderMap) {
        let header = |name| headers.get(name).and_then(|v| v.to_str().ok()).map(str::to_owned);
        self.content_type = header(CONTENT_TYPE);
        self.content_encoding = header(CONTENT_ENCODING);
    }

    pub(crate) fn into_inner(self) -> Body {
        self.body
    }

    fn check_encoding(&self) -> Result<()> {
        match self.content_encoding.as_deref().map(str::trim) {
            None => Ok(()),
            Some(encoding) if encoding.is_empty() || encoding.eq_ignore_ascii_case("identity") => Ok(()),
            Some(encoding) => {
                Err(HttpError::unsupported_media_type(format!("Unsupported content-encoding: {encoding}")).into())
            }
        }
    }
}
