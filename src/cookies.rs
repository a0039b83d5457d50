//! Request cookies and outgoing `Set-Cookie` headers.
//!
//! Cookies are not signed. Values set during a request are held back until
//! the response is converted, and dropped when the request fails.

use http::header::{HeaderValue, COOKIE, SET_COOKIE};
use http::HeaderMap;

use crate::error::{Error, Result};

const EPOCH: &str = "Thu, 01 Jan 1970 00:00:00 GMT";

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SameSite {
    Strict,
    Lax,
    None,
}

impl SameSite {
    fn as_str(self) -> &'static str {
        match self {
            Self::Strict => "strict",
            Self::Lax    => "lax",
            Self::None   => "none",
        }
    }
}

/// Attributes of an outgoing cookie.
#[derive(Clone, Debug)]
pub struct CookieOptions {
    pub path: Option<String>,
    pub domain: Option<String>,
    /// An HTTP-date, sent verbatim.
    pub expires: Option<String>,
    pub max_age: Option<u64>,
    pub http_only: bool,
    pub same_site: Option<SameSite>,
    /// Refused on connections that are not encrypted.
    pub secure: bool,
    /// Replace cookies of the same name set earlier in this request.
    pub overwrite: bool,
}

impl Default for CookieOptions {
    fn default() -> Self {
        Self {
            path: Some("/".to_owned()),
            domain: None,
            expires: None,
            max_age: None,
            http_only: true,
            same_site: None,
            secure: false,
            overwrite: false,
        }
    }
}

impl CookieOptions {
    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = Some(domain.into());
        self
    }

    pub fn expires(mut self, date: impl Into<String>) -> Self {
        self.expires = Some(date.into());
        self
    }

    pub fn max_age(mut self, seconds: u64) -> Self {
        self.max_age = Some(seconds);
        self
    }

    pub fn http_only(mut self, http_only: bool) -> Self {
        self.http_only = http_only;
        self
    }

    pub fn same_site(mut self, same_site: SameSite) -> Self {
        self.same_site = Some(same_site);
        self
    }

    pub fn secure(mut self, secure: bool) -> Self {
        self.secure = secure;
        self
    }

    pub fn overwrite(mut self, overwrite: bool) -> Self {
        self.overwrite = overwrite;
        self
    }
}

#[derive(Clone, Debug)]
struct Pending {
    name: String,
    header: String,
}

/// The cookies of one request.
#[derive(Clone, Debug, Default)]
pub struct Cookies {
    incoming: Vec<(String, String)>,
    pending: Vec<Pending>,
    secure: bool,
}

impl Cookies {
    pub(crate) fn new(headers: &HeaderMap, secure: bool) -> Self {
        let mut incoming: Vec<(String, String)> = Vec::new();
        let pairs = headers
            .get_all(COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(';'))
            .filter_map(|pair| pair.split_once('='));
        for (name, value) in pairs {
            let name = name.trim();
            if name.is_empty() || incoming.iter().any(|(n, _)| n == name) {
                continue;
            }
            let value = value.trim();
            let value = value.strip_prefix('"').and_then(|v| v.strip_suffix('"')).unwrap_or(value);
            incoming.push((name.to_owned(), value.to_owned()));
        }
        Self { incoming, pending: Vec::new(), secure }
    }

    /// A cookie sent by the client. The first one wins when a name repeats.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.incoming.iter().find(|(n, _)| n == name).map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.incoming.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    /// Queues a `Set-Cookie` header.
    pub fn set(&mut self, name: &str, value: &str, options: CookieOptions) -> Result<()> {
        if options.secure && !self.secure {
            return Err(Error::InvalidCookie(
                "Cannot send secure cookie over unencrypted connection.".to_owned(),
            ));
        }
        if name.is_empty() || !name.bytes().all(is_token) {
            return Err(Error::InvalidCookie(format!("invalid name `{name}`")));
        }
        if !value.bytes().all(is_cookie_octet) {
            return Err(Error::InvalidCookie(format!("invalid value for `{name}`")));
        }
        for attr in [&options.path, &options.domain, &options.expires].into_iter().flatten() {
            if attr.bytes().any(|b| b == b';' || b.is_ascii_control()) {
                return Err(Error::InvalidCookie(format!("invalid attribute `{attr}` for `{name}`")));
            }
        }

        if options.overwrite {
            self.pending.retain(|p| p.name != name);
        }
        self.pending.push(Pending { name: name.to_owned(), header: serialize(name, value, &options) });
        Ok(())
    }

    /// Expires a cookie on the client.
    pub fn delete(&mut self, name: &str, options: CookieOptions) -> Result<()> {
        let options = CookieOptions { expires: Some(EPOCH.to_owned()), max_age: None, ..options };
        self.set(name, "", options)
    }

    /// The queued `Set-Cookie` values, in order.
    pub fn pending(&self) -> impl Iterator<Item = &str> {
        self.pending.iter().map(|p| p.header.as_str())
    }

    pub(crate) fn clear(&mut self) {
        self.pending.clear();
    }

    pub(crate) fn apply(&mut self, headers: &mut HeaderMap) -> Result<()> {
        for pending in self.pending.drain(..) {
            let value = HeaderValue::try_from(pending.header)
                .map_err(|e| Error::InvalidCookie(format!("`{}`: {e}", pending.name)))?;
            headers.append(SET_COOKIE, value);
        }
        Ok(())
    }
}

fn serialize(name: &str, value: &str, options: &CookieOptions) -> String {
    let mut out = format!("{name}={value}");
    if let Some(path) = &options.path {
        out.push_str(&format!("; path={path}"));
    }
    if let Some(expires) = &options.expires {
        out.push_str(&format!("; expires={expires}"));
    }
    if let Some(max_age) = options.max_age {
        out.push_str(&format!("; max-age={max_age}"));
    }
    if let Some(domain) = &options.domain {
        out.push_str(&format!("; domain={domain}"));
    }
    if let Some(same_site) = options.same_site {
        out.push_str(&format!("; samesite={}", same_site.as_str()));
    }
    if options.secure {
        out.push_str("; secure");
    }
    if options.http_only {
        out.push_str("; httponly");
    }
    out
}

fn is_token(b: u8) -> bool {
    b.is_ascii_graphic() && !b"()<>@,;:\\\"/[]?={}".contains(&b)
}

fn is_cookie_octet(b: u8) -> bool {
    b.is_ascii_graphic() && !b"\",;\\".contains(&b)
}
