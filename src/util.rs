//! Small string helpers shared by the router, the response and multipart.

use std::borrow::Cow;

use once_cell::sync::Lazy;
use regex::Regex;

static HTML: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^\s*<(?:!doctype|html|body|head|p|div|span|a|h[1-6]|table|ul|ol|br|img)\b")
        .unwrap_or_else(|e| panic!("html sniffing pattern: {e}"))
});

/// Percent-decodes `text`, returning it unchanged when it is not valid
/// percent-encoded UTF-8.
pub(crate) fn decode_component(text: &str) -> Cow<'_, str> {
    urlencoding::decode(text).unwrap_or(Cow::Borrowed(text))
}

/// Encodes a URL for a `Location` header: characters outside the URI grammar
/// are escaped, existing escapes and reserved characters are left alone.
pub(crate) fn encode_url(url: &str) -> String {
    let mut out = String::with_capacity(url.len());
    let bytes = url.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        let escaped = b == b'%'
            && bytes.get(i + 1).is_some_and(u8::is_ascii_hexdigit)
            && bytes.get(i + 2).is_some_and(u8::is_ascii_hexdigit);
        if escaped || b.is_ascii_alphanumeric() || b"-_.!~*'();/?:@&=+$,#[]".contains(&b) {
            out.push(b as char);
        } else {
            out.push_str(&format!("%{b:02X}"));
        }
        i += 1;
    }
    out
}

/// Escapes the characters that would break out of an HTML attribute.
pub(crate) fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&'  => out.push_str("&amp;"),
            '<'  => out.push_str("&lt;"),
            '>'  => out.push_str("&gt;"),
            '"'  => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            c    => out.push(c),
        }
    }
    out
}

/// Whether a text body looks like an HTML document.
pub(crate) fn is_html(text: &str) -> bool {
    HTML.is_match(text)
}

/// `prefix` + 16 random hex digits + `.ext`.
pub(crate) fn random_filename(prefix: &str, ext: &str) -> String {
    let id = fastrand::u64(..);
    if ext.is_empty() {
        format!("{prefix}{id:016x}")
    } else {
        format!("{prefix}{id:016x}.{ext}")
    }
}
