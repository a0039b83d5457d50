//! A small, immutable MIME table.
//!
//! Built once on first use and never mutated afterwards. It covers the types
//! a web application commonly sends or receives; anything else resolves to
//! `None` and callers fall back to `application/octet-stream` or reject the
//! input.

use std::collections::HashMap;

use once_cell::sync::Lazy;

/// `(media type, extensions)`; the first extension is the preferred one.
const TYPES: &[(&str, &[&str])] = &[
    ("application/gzip",                  &["gz"]),
    ("application/javascript",            &["js", "mjs"]),
    ("application/json",                  &["json", "map"]),
    ("application/msgpack",               &["msgpack"]),
    ("application/octet-stream",          &["bin", "exe", "dll", "so"]),
    ("application/pdf",                   &["pdf"]),
    ("application/wasm",                  &["wasm"]),
    ("application/x-tar",                 &["tar"]),
    ("application/x-www-form-urlencoded", &["form"]),
    ("application/xml",                   &["xml", "xsl", "xsd"]),
    ("application/zip",                   &["zip"]),
    ("audio/mpeg",                        &["mp3", "mpga"]),
    ("audio/ogg",                         &["ogg", "oga"]),
    ("audio/wav",                         &["wav"]),
    ("font/otf",                          &["otf"]),
    ("font/ttf",                          &["ttf"]),
    ("font/woff",                         &["woff"]),
    ("font/woff2",                        &["woff2"]),
    ("image/avif",                        &["avif"]),
    ("image/gif",                         &["gif"]),
    ("image/jpeg",                        &["jpeg", "jpg", "jpe"]),
    ("image/png",                         &["png"]),
    ("image/svg+xml",                     &["svg", "svgz"]),
    ("image/webp",                        &["webp"]),
    ("image/x-icon",                      &["ico"]),
    ("text/css",                          &["css"]),
    ("text/csv",                          &["csv"]),
    ("text/event-stream",                 &["event-stream"]),
    ("text/html",                         &["html", "htm", "shtml"]),
    ("text/markdown",                     &["md", "markdown"]),
    ("text/plain",                        &["txt", "text", "conf", "log", "ini"]),
    ("video/mp4",                         &["mp4", "mp4v", "mpg4"]),
    ("video/webm",                        &["webm"]),
];

static BY_EXTENSION: Lazy<HashMap<&'static str, &'static str>> = Lazy::new(|| {
    TYPES
        .iter()
        .flat_map(|(mime, exts)| exts.iter().map(move |ext| (*ext, *mime)))
        .collect()
});

static BY_TYPE: Lazy<HashMap<&'static str, &'static str>> =
    Lazy::new(|| TYPES.iter().map(|(mime, exts)| (*mime, exts[0])).collect());

/// The essence of a media type: `"Text/HTML; charset=x"` → `"text/html"`.
pub(crate) fn essence(media_type: &str) -> String {
    media_type.split(';').next().unwrap_or_default().trim().to_ascii_lowercase()
}

/// Media type for a path or bare extension: `"a/b.json"` and `"json"` both
/// give `application/json`.
pub fn lookup(path: &str) -> Option<&'static str> {
    let ext = path.rsplit('.').next().unwrap_or(path).to_ascii_lowercase();
    BY_EXTENSION.get(ext.as_str()).copied()
}

/// Preferred file extension for a media type; parameters are ignored.
pub fn extension(media_type: &str) -> Option<&'static str> {
    BY_TYPE.get(essence(media_type).as_str()).copied()
}

/// Default charset for a media type, if it has one.
pub fn charset(media_type: &str) -> Option<&'static str> {
    let essence = essence(media_type);
    let textual = essence.starts_with("text/")
        || essence == "application/json"
        || essence == "application/javascript"
        || essence.ends_with("+json");
    textual.then_some("UTF-8")
}

/// A full `Content-Type` value for a media type or an extension shorthand.
///
/// ```rust
/// use grove::mime::content_type;
///
/// assert_eq!(content_type("json").as_deref(), Some("application/json; charset=UTF-8"));
/// assert_eq!(content_type("image/png").as_deref(), Some("image/png"));
/// assert_eq!(content_type("text/html; charset=utf-8").as_deref(), Some("text/html; charset=utf-8"));
/// assert_eq!(content_type("nope"), None);
/// ```
pub fn content_type(value: &str) -> Option<String> {
    let mime = if value.contains('/') { value.to_owned() } else { lookup(value)?.to_owned() };
    if mime.to_ascii_lowercase().contains("charset") {
        return Some(mime);
    }
    match charset(&mime) {
        Some(charset) => Some(format!("{mime}; charset={charset}")),
        None => Some(mime),
    }
}
