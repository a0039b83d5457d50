//! A single registered route.

use std::collections::HashMap;
use std::fmt;

use regex::Regex;

use super::pattern::{self, Key, MatchOptions, Token};
use crate::error::{Error, Result};
use crate::method::Method;
use crate::middleware::BoxedMiddleware;
use crate::util::decode_component;

/// Per-route registration options.
///
/// `sensitive` and `strict` fall back to the router's options when unset.
#[derive(Clone, Debug)]
pub struct RouteOptions {
    pub name: Option<String>,
    pub sensitive: Option<bool>,
    pub strict: Option<bool>,
    /// Whether the pattern must match the whole path. Mounts use `false`.
    pub end: bool,
    /// Leave `ctx.captures` empty for this route.
    pub ignore_captures: bool,
}

impl Default for RouteOptions {
    fn default() -> Self {
        Self { name: None, sensitive: None, strict: None, end: true, ignore_captures: false }
    }
}

impl RouteOptions {
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn sensitive(mut self, sensitive: bool) -> Self {
        self.sensitive = Some(sensitive);
        self
    }

    pub fn strict(mut self, strict: bool) -> Self {
        self.strict = Some(strict);
        self
    }

    pub fn end(mut self, end: bool) -> Self {
        self.end = end;
        self
    }

    pub fn ignore_captures(mut self, ignore: bool) -> Self {
        self.ignore_captures = ignore;
        self
    }
}

/// Options for reverse routing.
#[derive(Clone, Debug, Default)]
pub struct UrlOptions {
    /// Appended as a query string.
    pub query: Vec<(String, String)>,
    /// Percent-encode parameter values.
    pub encode: bool,
}

impl UrlOptions {
    pub fn query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    pub fn encode(mut self, encode: bool) -> Self {
        self.encode = encode;
        self
    }
}

#[derive(Clone)]
pub(crate) struct StackEntry {
    /// Set for entries inserted by `Router::param`.
    pub(crate) param: Option<String>,
    pub(crate) middleware: BoxedMiddleware,
}

/// A compiled route: pattern, methods and middleware stack.
#[derive(Clone)]
pub struct Layer {
    methods: Vec<Method>,
    name: Option<String>,
    path: String,
    keys: Vec<Key>,
    regex: Regex,
    stack: Vec<StackEntry>,
    options: MatchOptions,
    ignore_captures: bool,
}

impl Layer {
    /// # Panics
    ///
    /// When `path` is not a valid pattern. Routes are registered during
    /// setup, so this surfaces as a startup failure.
    pub(crate) fn new(
        path: &str,
        methods: &[Method],
        stack: Vec<BoxedMiddleware>,
        name: Option<String>,
        options: MatchOptions,
        ignore_captures: bool,
    ) -> Self {
        let mut methods = methods.to_vec();
        if methods.contains(&Method::Get) && !methods.contains(&Method::Head) {
            methods.insert(0, Method::Head);
        }
        let (regex, keys) = compile(path, options);
        Self {
            methods,
            name,
            path: path.to_owned(),
            keys,
            regex,
            stack: stack.into_iter().map(|middleware| StackEntry { param: None, middleware }).collect(),
            options,
            ignore_captures,
        }
    }

    /// The methods this route answers; empty for mounted middleware, which
    /// runs for every method.
    pub fn methods(&self) -> &[Method] {
        &self.methods
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn param_names(&self) -> Vec<&str> {
        self.keys.iter().map(|k| k.name.as_str()).collect()
    }

    pub fn regex(&self) -> &Regex {
        &self.regex
    }

    /// Number of middleware in the route's stack, param middleware included.
    pub fn stack_len(&self) -> usize {
        self.stack.len()
    }

    pub fn is_match(&self, path: &str) -> bool {
        self.regex.is_match(path)
    }

    /// The raw capture groups of `path`; `None` for groups that did not
    /// participate.
    pub fn captures(&self, path: &str) -> Vec<Option<String>> {
        if self.ignore_captures {
            return Vec::new();
        }
        self.regex
            .captures(path)
            .map(|caps| caps.iter().skip(1).map(|m| m.map(|m| m.as_str().to_owned())).collect())
            .unwrap_or_default()
    }

    /// Binds `captures` to the route's parameter names, percent-decoded,
    /// into `params`.
    pub fn params(&self, captures: &[Option<String>], params: &mut HashMap<String, String>) {
        for (key, capture) in self.keys.iter().zip(captures) {
            if let Some(value) = capture {
                params.insert(key.name.clone(), decode_component(value).into_owned());
            }
        }
    }

    /// Builds a URL for this route. Catch-all `(.*)` groups are dropped.
    pub fn url(&self, params: &[(&str, &str)], options: &UrlOptions) -> Result<String> {
        build_url(&self.path.replace("(.*)", ""), params, options)
    }

    pub(crate) fn middleware(&self) -> impl Iterator<Item = &BoxedMiddleware> {
        self.stack.iter().map(|entry| &entry.middleware)
    }

    /// Inserts param middleware for `param` ahead of the first entry that is
    /// not param middleware, or that is param middleware for a later key.
    pub(crate) fn param(&mut self, param: &str, middleware: BoxedMiddleware) {
        let names = self.param_names();
        let Some(x) = names.iter().position(|n| *n == param) else {
            return;
        };
        let position = |name: &str| names.iter().position(|n| *n == name);
        let at = self.stack.iter().position(|entry| match &entry.param {
            None => true,
            Some(other) => position(other).is_some_and(|i| i > x),
        });
        if let Some(at) = at {
            self.stack.insert(at, StackEntry { param: Some(param.to_owned()), middleware });
        }
    }

    pub(crate) fn set_prefix(&mut self, prefix: &str) {
        if self.path.is_empty() {
            return;
        }
        self.path = if self.path != "/" || self.options.strict {
            format!("{prefix}{}", self.path)
        } else {
            prefix.to_owned()
        };
        let (regex, keys) = compile(&self.path, self.options);
        self.regex = regex;
        self.keys = keys;
    }
}

impl fmt::Debug for Layer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Layer")
            .field("methods", &self.methods)
            .field("name", &self.name)
            .field("path", &self.path)
            .field("regex", &self.regex.as_str())
            .field("param_names", &self.param_names())
            .field("stack", &self.stack.len())
            .finish()
    }
}

fn compile(path: &str, options: MatchOptions) -> (Regex, Vec<Key>) {
    pattern::parse(path)
        .and_then(|tokens| pattern::to_regex(&tokens, options))
        .unwrap_or_else(|e| panic!("invalid route `{path}`: {e}"))
}

/// Substitutes `params` into `path` and appends the query.
pub(crate) fn build_url(path: &str, params: &[(&str, &str)], options: &UrlOptions) -> Result<String> {
    let has_keys = pattern::parse(path)
        .map_err(|e| Error::UrlParam(e.to_string()))?
        .iter()
        .any(|token| matches!(token, Token::Key(_)));
    let replaced = if has_keys {
        pattern::to_path(path, params, options.encode).map_err(|e| Error::UrlParam(e.to_string()))?
    } else {
        path.to_owned()
    };

    if options.query.is_empty() {
        return Ok(replaced);
    }
    let mut url = url::Url::parse("http://grove.invalid")
        .and_then(|base| base.join(&replaced))
        .map_err(|e| Error::UrlParam(format!("cannot resolve `{replaced}`: {e}")))?;
    url.query_pairs_mut().clear().extend_pairs(&options.query);
    let mut out = url.path().to_owned();
    if let Some(query) = url.query() {
        out.push('?');
        out.push_str(query);
    }
    if let Some(fragment) = url.fragment() {
        out.push('#');
        out.push_str(fragment);
    }
    Ok(out)
}
