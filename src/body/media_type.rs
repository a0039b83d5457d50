//! Media type matching for body negotiation.
//!
//! Candidates are written the short way: `"json"`, `"urlencoded"`,
//! `"multipart"`, `"+json"`, `"text/*"` or a full `type/subtype`.

use crate::mime;

/// Expands a shorthand candidate into a `type/subtype` pattern.
fn normalize(candidate: &str) -> Option<String> {
    match candidate {
        "urlencoded" => Some("application/x-www-form-urlencoded".into()),
        "multipart"  => Some("multipart/*".into()),
        c if c.starts_with('+') => Some(format!("*/*{c}")),
        c if c.contains('/') => Some(c.to_ascii_lowercase()),
        c => mime::lookup(c).map(str::to_owned),
    }
}

fn split(media_type: &str) -> Option<(&str, &str)> {
    let (kind, subtype) = media_type.split_once('/')?;
    (!kind.is_empty() && !subtype.is_empty()).then_some((kind, subtype))
}

/// `expected` may use `*` for the type, the subtype, or a `*+suffix` subtype.
fn mime_match(expected: &str, actual: &str) -> bool {
    let (Some((exp_type, exp_sub)), Some((act_type, act_sub))) = (split(expected), split(actual)) else {
        return false;
    };
    if exp_type != "*" && exp_type != act_type {
        return false;
    }
    if let Some(suffix) = exp_sub.strip_prefix('*') {
        return suffix.is_empty() || act_sub.ends_with(suffix);
    }
    exp_sub == act_sub
}

/// Whether the `value` of a `Content-Type` header matches any candidate.
pub fn is_media_type<S: AsRef<str>>(value: &str, candidates: &[S]) -> bool {
    let actual = mime::essence(value);
    if split(&actual).is_none() {
        return false;
    }
    candidates
        .iter()
        .filter_map(|c| normalize(c.as_ref()))
        .any(|expected| mime_match(&expected, &actual))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shorthands_match_their_types() {
        assert!(is_media_type("application/json; charset=utf-8", &["json"]));
        assert!(is_media_type("application/vnd.api+json", &["application/*+json"]));
        assert!(is_media_type("application/ld+json", &["+json"]));
        assert!(is_media_type("application/x-www-form-urlencoded", &["urlencoded"]));
        assert!(is_media_type("multipart/form-data; boundary=x", &["multipart"]));
        assert!(is_media_type("text/plain", &["text"]));
        assert!(is_media_type("text/csv", &["text/*"]));
    }

    #[test]
    fn mismatches_are_rejected() {
        assert!(!is_media_type("text/html", &["json", "urlencoded"]));
        assert!(!is_media_type("garbage", &["text"]));
        assert!(!is_media_type("application/xml", &["+json"]));
    }
}
