//! Incoming HTTP request type.

use std::net::SocketAddr;

use http::header::{HeaderName, HeaderValue, ACCEPT, HOST};
use http::{HeaderMap, Version};
use url::Url;

use crate::body::{Body, RequestBody};
use crate::error::{HttpError, Result};
use crate::http1::RequestHead;
use crate::method::Method;
use crate::mime;

const FORWARDED_FOR: &str = "x-forwarded-for";
const FORWARDED_HOST: &str = "x-forwarded-host";
const FORWARDED_PROTO: &str = "x-forwarded-proto";

/// An incoming HTTP request.
///
/// With the application's `proxy` flag set, the URL scheme and host and the
/// client address come from the `X-Forwarded-*` headers.
#[derive(Debug)]
pub struct Request {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub version: Version,
    /// Whether the request arrived over an encrypted stream.
    pub secure: bool,
    pub remote_addr: Option<SocketAddr>,
    pub body: RequestBody,
    proxy: bool,
}

impl Request {
    /// A request for in-process dispatch with
    /// [`Application::handle`](crate::Application::handle).
    ///
    /// `target` is an absolute URL or a path, which is resolved against
    /// `http://localhost`.
    pub fn new(method: Method, target: &str) -> Result<Self> {
        let url = resolve_url("http", "localhost", target)?;
        Ok(Self {
            method,
            url,
            headers: HeaderMap::new(),
            version: Version::HTTP_11,
            secure: false,
            remote_addr: None,
            body: RequestBody::default(),
            proxy: false,
        })
    }

    /// A request for a parsed head. The body is attached separately so it
    /// can go back to the connection when the head is rejected.
    pub(crate) fn from_head(head: RequestHead, remote_addr: SocketAddr, secure: bool, proxy: bool) -> Result<Self> {
        let RequestHead { method, target, version, headers } = head;

        let first = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.split(',').next())
                .map(str::trim)
                .filter(|v| !v.is_empty())
        };
        let proto = match (proxy, first(FORWARDED_PROTO)) {
            (true, Some(proto)) => proto,
            _ if secure => "https",
            _ => "http",
        };
        let host = proxy
            .then(|| first(FORWARDED_HOST))
            .flatten()
            .or_else(|| headers.get(HOST).and_then(|v| v.to_str().ok()))
            .unwrap_or("localhost");
        let url = resolve_url(proto, host, &target)?;

        Ok(Self {
            method,
            url,
            headers,
            version,
            secure,
            remote_addr: Some(remote_addr),
            body: RequestBody::default(),
            proxy,
        })
    }

    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self.body.refresh(&self.headers);
        self
    }

    pub fn with_body(mut self, body: impl Into<Body>) -> Self {
        self.body = RequestBody::new(body.into(), &self.headers);
        self
    }

    pub(crate) fn attach_body(&mut self, body: Body) {
        self.body = RequestBody::new(body, &self.headers);
    }

    pub(crate) fn with_proxy(mut self, proxy: bool) -> Self {
        self.proxy = proxy;
        self
    }

    pub fn path(&self) -> &str {
        self.url.path()
    }

    /// A header value, when present and valid UTF-8.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn has_body(&self) -> bool {
        self.body.has_body()
    }

    /// Client addresses from `X-Forwarded-For`, nearest client first. Empty
    /// unless the application trusts a proxy.
    pub fn ips(&self) -> Vec<String> {
        if !self.proxy {
            return Vec::new();
        }
        self.header(FORWARDED_FOR)
            .map(|v| v.split(',').map(str::trim).filter(|ip| !ip.is_empty()).map(str::to_owned).collect())
            .unwrap_or_default()
    }

    /// The client address: the first forwarded address behind a proxy, else
    /// the peer address.
    pub fn ip(&self) -> Option<String> {
        self.ips()
            .into_iter()
            .next()
            .or_else(|| self.remote_addr.map(|addr| addr.ip().to_string()))
    }

    /// The entry of `types` the client prefers according to `Accept`, or
    /// `None` when it accepts none of them. Without an `Accept` header the
    /// first entry is returned.
    ///
    /// Entries are media types or extension shorthands (`"html"`, `"json"`).
    pub fn accepts<'t>(&self, types: &[&'t str]) -> Option<&'t str> {
        let Some(accept) = self.header(ACCEPT.as_str()) else {
            return types.first().copied();
        };
        let ranges = parse_accept(accept);

        let mut best: Option<(&'t str, (u16, u8, std::cmp::Reverse<usize>))> = None;
        for &candidate in types {
            let media_type = if candidate.contains('/') {
                mime::essence(candidate)
            } else {
                match mime::lookup(candidate) {
                    Some(media_type) => media_type.to_owned(),
                    None => continue,
                }
            };
            let Some((kind, subtype)) = media_type.split_once('/') else {
                continue;
            };

            let preferred = ranges
                .iter()
                .enumerate()
                .filter_map(|(index, range)| range.specificity(kind, subtype).map(|s| (range.quality, s, index)))
                .max_by_key(|&(_, specificity, index)| (specificity, std::cmp::Reverse(index)));
            let Some((quality, specificity, index)) = preferred else {
                continue;
            };
            if quality == 0 {
                continue;
            }
            let score = (quality, specificity, std::cmp::Reverse(index));
            if best.is_none_or(|(_, current)| score > current) {
                best = Some((candidate, score));
            }
        }
        best.map(|(candidate, _)| candidate)
    }
}

/// Builds the request URL from an origin-form or absolute-form target.
fn resolve_url(proto: &str, host: &str, target: &str) -> Result<Url> {
    let parsed = if target.starts_with('/') {
        Url::parse(&format!("{proto}://{host}{target}"))
    } else {
        Url::parse(target)
    };
    parsed.map_err(|e| HttpError::bad_request(format!("Invalid request URL \"{target}\": {e}")).into())
}

struct MediaRange {
    kind: String,
    subtype: String,
    /// Thousandths, so ranges compare without floats.
    quality: u16,
}

impl MediaRange {
    /// 2 for an exact match, 1 for `type/*`, 0 for `*/*`.
    fn specificity(&self, kind: &str, subtype: &str) -> Option<u8> {
        match (self.kind.as_str(), self.subtype.as_str()) {
            ("*", "*")                                   => Some(0),
            (k, "*") if k == kind                        => Some(1),
            (k, s) if k == kind && s == subtype          => Some(2),
            _                                            => None,
        }
    }
}

fn parse_accept(header: &str) -> Vec<MediaRange> {
    header
        .split(',')
        .filter_map(|entry| {
            let mut parts = entry.split(';');
            let (kind, subtype) = parts.next()?.trim().split_once('/')?;
            let quality = parts
                .filter_map(|p| p.trim().strip_prefix("q="))
                .filter_map(|q| q.trim().parse::<f32>().ok())
                .next()
                .map_or(1000, |q| (q.clamp(0.0, 1.0) * 1000.0).round() as u16);
            Some(MediaRange {
                kind: kind.trim().to_ascii_lowercase(),
                subtype: subtype.trim().to_ascii_lowercase(),
                quality,
            })
        })
        .collect()
}
