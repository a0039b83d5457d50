//! Path patterns.
//!
//! | Syntax | Meaning |
//! |---|---|
//! | `:name` | a named segment, `[^/#?]+?` |
//! | `:name(\d+)` | a named segment with its own pattern |
//! | `(.*)` | an unnamed group, keyed by position (`"0"`, `"1"`, …) |
//! | `?` `*` `+` after a parameter | optional, zero or more, one or more |
//! | `{…}` | a group whose prefix/suffix travel with its parameter |
//! | `\x` | a literal `x` |
//!
//! A `/` or `.` right before a parameter belongs to it, so `/users/:id?`
//! matches both `/users` and `/users/7`.
//!
//! Patterns compile to a [`Regex`] anchored at the start. With `end` the
//! whole path must match; without it the pattern matches any path it is a
//! prefix of, as long as the prefix ends on a delimiter.

use regex::Regex;

const DELIMITERS: &str = "/#?";
const PREFIXES: &str = "./";

/// A malformed path pattern.
#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
#[error("{0}")]
pub struct PatternError(String);

fn fail<T>(message: impl Into<String>) -> Result<T, PatternError> {
    Err(PatternError(message.into()))
}

fn default_pattern() -> String {
    format!("[^{}]+?", regex::escape(DELIMITERS))
}

fn delimiter_class() -> String {
    format!("[{}]", regex::escape(DELIMITERS))
}

// ── Lexer ─────────────────────────────────────────────────────────────────────

#[derive(Clone, Debug, Eq, PartialEq)]
enum Lexeme {
    Open,
    Close,
    Pattern(String),
    Name(String),
    Char(char),
    Escaped(char),
    Modifier(char),
    End,
}

impl Lexeme {
    fn describe(&self) -> &'static str {
        match self {
            Self::Open        => "OPEN",
            Self::Close       => "CLOSE",
            Self::Pattern(_)  => "PATTERN",
            Self::Name(_)     => "NAME",
            Self::Char(_)     => "CHAR",
            Self::Escaped(_)  => "ESCAPED_CHAR",
            Self::Modifier(_) => "MODIFIER",
            Self::End         => "END",
        }
    }
}

fn lex(input: &str) -> Result<Vec<(usize, Lexeme)>, PatternError> {
    let chars: Vec<char> = input.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        match chars[i] {
            c @ ('*' | '+' | '?') => {
                tokens.push((i, Lexeme::Modifier(c)));
                i += 1;
            }
            '\\' => {
                let Some(&c) = chars.get(i + 1) else {
                    return fail(format!("Trailing escape at {i}"));
                };
                tokens.push((i, Lexeme::Escaped(c)));
                i += 2;
            }
            '{' => {
                tokens.push((i, Lexeme::Open));
                i += 1;
            }
            '}' => {
                tokens.push((i, Lexeme::Close));
                i += 1;
            }
            ':' => {
                let start = i + 1;
                let mut j = start;
                while j < chars.len() && (chars[j].is_ascii_alphanumeric() || chars[j] == '_') {
                    j += 1;
                }
                if j == start {
                    return fail(format!("Missing parameter name at {i}"));
                }
                tokens.push((i, Lexeme::Name(chars[start..j].iter().collect())));
                i = j;
            }
            '(' => {
                let (pattern, next) = lex_group(&chars, i)?;
                tokens.push((i, Lexeme::Pattern(pattern)));
                i = next;
            }
            c => {
                tokens.push((i, Lexeme::Char(c)));
                i += 1;
            }
        }
    }

    tokens.push((chars.len(), Lexeme::End));
    Ok(tokens)
}

/// Reads a `( … )` group opening at `start`; returns its body and the index
/// after the closing parenthesis.
fn lex_group(chars: &[char], start: usize) -> Result<(String, usize), PatternError> {
    let mut depth = 1;
    let mut pattern = String::new();
    let mut j = start + 1;

    if chars.get(j) == Some(&'?') {
        return fail(format!("Pattern cannot start with \"?\" at {j}"));
    }

    while j < chars.len() {
        match chars[j] {
            '\\' => {
                pattern.push('\\');
                if let Some(&c) = chars.get(j + 1) {
                    pattern.push(c);
                }
                j += 2;
                continue;
            }
            ')' => {
                depth -= 1;
                if depth == 0 {
                    j += 1;
                    break;
                }
            }
            '(' => {
                depth += 1;
                if chars.get(j + 1) != Some(&'?') {
                    return fail(format!("Capturing groups are not allowed at {j}"));
                }
            }
            _ => {}
        }
        pattern.push(chars[j]);
        j += 1;
    }

    if depth > 0 {
        return fail(format!("Unbalanced pattern at {start}"));
    }
    if pattern.is_empty() {
        return fail(format!("Missing pattern at {start}"));
    }
    Ok((pattern, j))
}

// ── Parser ────────────────────────────────────────────────────────────────────

/// A parameter of a compiled pattern.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Key {
    /// The parameter name, or its position for unnamed groups.
    pub name: String,
    pub prefix: String,
    pub suffix: String,
    pub pattern: String,
    pub modifier: Option<char>,
}

impl Key {
    fn optional(&self) -> bool {
        matches!(self.modifier, Some('?' | '*'))
    }

    fn repeats(&self) -> bool {
        matches!(self.modifier, Some('*' | '+'))
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) enum Token {
    Text(String),
    Key(Key),
}

struct Parser {
    tokens: Vec<(usize, Lexeme)>,
    i: usize,
}

macro_rules! try_consume {
    ($parser:expr, $variant:ident) => {
        match $parser.tokens.get($parser.i) {
            Some((_, Lexeme::$variant(value))) => {
                let value = value.clone();
                $parser.i += 1;
                Some(value)
            }
            _ => None,
        }
    };
}

impl Parser {
    fn try_open(&mut self) -> bool {
        let open = matches!(self.tokens.get(self.i), Some((_, Lexeme::Open)));
        if open {
            self.i += 1;
        }
        open
    }

    fn must_consume(&mut self, expected: Lexeme) -> Result<(), PatternError> {
        match self.tokens.get(self.i) {
            Some((_, lexeme)) if *lexeme == expected => {
                self.i += 1;
                Ok(())
            }
            Some((at, lexeme)) => fail(format!(
                "Unexpected {} at {at}, expected {}",
                lexeme.describe(),
                expected.describe()
            )),
            None => fail(format!("Unexpected end, expected {}", expected.describe())),
        }
    }

    fn consume_text(&mut self) -> String {
        let mut text = String::new();
        while let Some(c) = try_consume!(self, Char).or_else(|| try_consume!(self, Escaped)) {
            text.push(c);
        }
        text
    }
}

pub(crate) fn parse(input: &str) -> Result<Vec<Token>, PatternError> {
    let mut parser = Parser { tokens: lex(input)?, i: 0 };
    let mut result = Vec::new();
    let mut next_index = 0usize;
    let mut path = String::new();
    let mut positional = || {
        let name = next_index.to_string();
        next_index += 1;
        name
    };

    while parser.i < parser.tokens.len() {
        let c = try_consume!(parser, Char);
        let name = try_consume!(parser, Name);
        let pattern = try_consume!(parser, Pattern);

        if name.is_some() || pattern.is_some() {
            let mut prefix = c.map(String::from).unwrap_or_default();
            if !prefix.is_empty() && !PREFIXES.contains(prefix.as_str()) {
                path.push_str(&prefix);
                prefix.clear();
            }
            if !path.is_empty() {
                result.push(Token::Text(std::mem::take(&mut path)));
            }
            result.push(Token::Key(Key {
                name: name.unwrap_or_else(&mut positional),
                prefix,
                suffix: String::new(),
                pattern: pattern.unwrap_or_else(default_pattern),
                modifier: try_consume!(parser, Modifier),
            }));
            continue;
        }

        if let Some(c) = c.or_else(|| try_consume!(parser, Escaped)) {
            path.push(c);
            continue;
        }

        if !path.is_empty() {
            result.push(Token::Text(std::mem::take(&mut path)));
        }

        if parser.try_open() {
            let prefix = parser.consume_text();
            let name = try_consume!(parser, Name).unwrap_or_default();
            let pattern = try_consume!(parser, Pattern).unwrap_or_default();
            let suffix = parser.consume_text();
            parser.must_consume(Lexeme::Close)?;

            let (name, pattern) = match (name.is_empty(), pattern.is_empty()) {
                (false, true)  => (name, default_pattern()),
                (true, false)  => (positional(), pattern),
                _              => (name, pattern),
            };
            let modifier = try_consume!(parser, Modifier);
            result.push(Token::Key(Key { name, prefix, suffix, pattern, modifier }));
            continue;
        }

        parser.must_consume(Lexeme::End)?;
    }

    Ok(result)
}

// ── Regex ─────────────────────────────────────────────────────────────────────

/// Matching flags for [`to_regex`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct MatchOptions {
    pub sensitive: bool,
    pub strict: bool,
    pub end: bool,
}

impl Default for MatchOptions {
    fn default() -> Self {
        Self { sensitive: false, strict: false, end: true }
    }
}

/// Compiles parsed tokens; returns the regex and the keys in capture order.
pub(crate) fn to_regex(tokens: &[Token], options: MatchOptions) -> Result<(Regex, Vec<Key>), PatternError> {
    let delimiter = delimiter_class();
    let mut keys = Vec::new();
    let mut route = String::from(if options.sensitive { "^" } else { "(?i)^" });

    for token in tokens {
        match token {
            Token::Text(text) => route.push_str(&regex::escape(text)),
            Token::Key(key) => {
                let prefix = regex::escape(&key.prefix);
                let suffix = regex::escape(&key.suffix);
                let modifier = key.modifier.map(String::from).unwrap_or_default();

                if key.pattern.is_empty() {
                    route.push_str(&format!("(?:{prefix}{suffix}){modifier}"));
                    continue;
                }

                keys.push(key.clone());
                let pattern = &key.pattern;
                if prefix.is_empty() && suffix.is_empty() {
                    route.push_str(&format!("({pattern}){modifier}"));
                } else if key.repeats() {
                    let optional = if key.modifier == Some('*') { "?" } else { "" };
                    route.push_str(&format!(
                        "(?:{prefix}((?:{pattern})(?:{suffix}{prefix}(?:{pattern}))*){suffix}){optional}"
                    ));
                } else {
                    route.push_str(&format!("(?:{prefix}({pattern}){suffix}){modifier}"));
                }
            }
        }
    }

    if options.end {
        if !options.strict {
            route.push_str(&format!("{delimiter}?"));
        }
        route.push('$');
    } else {
        let end_delimited = match tokens.last() {
            Some(Token::Text(text)) => text.chars().last().is_some_and(|c| DELIMITERS.contains(c)),
            Some(Token::Key(_)) => false,
            None => true,
        };
        if !options.strict {
            route.push_str(&format!("(?:{delimiter}$)?"));
        }
        if !end_delimited {
            route.push_str(&format!("(?:{delimiter}|$)"));
        }
    }

    let regex = Regex::new(&route).map_err(|e| PatternError(format!("invalid pattern: {e}")))?;
    Ok((regex, keys))
}

// ── Reverse routing ───────────────────────────────────────────────────────────

/// Fills the parameters of `path` from `params`.
///
/// Every value must match its parameter's pattern. Missing values are only
/// allowed for optional parameters. With `encode`, values are
/// percent-encoded before they are checked and inserted.
pub(crate) fn to_path(path: &str, params: &[(&str, &str)], encode: bool) -> Result<String, PatternError> {
    let mut out = String::new();

    for token in parse(path)? {
        let key = match token {
            Token::Text(text) => {
                out.push_str(&text);
                continue;
            }
            Token::Key(key) => key,
        };

        let Some(value) = params.iter().find(|(name, _)| *name == key.name).map(|(_, v)| *v) else {
            if key.optional() {
                continue;
            }
            let expected = if key.repeats() { "an array" } else { "a string" };
            return fail(format!("Expected \"{}\" to be {expected}", key.name));
        };

        let segment = if encode { urlencoding::encode(value).into_owned() } else { value.to_owned() };
        if !key.pattern.is_empty() {
            let valid = Regex::new(&format!("(?i)^(?:{})$", key.pattern))
                .map_err(|e| PatternError(format!("invalid pattern: {e}")))?;
            if !valid.is_match(&segment) {
                return fail(format!(
                    "Expected \"{}\" to match \"{}\", but got \"{segment}\"",
                    key.name, key.pattern
                ));
            }
        }
        out.push_str(&key.prefix);
        out.push_str(&segment);
        out.push_str(&key.suffix);
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compile(path: &str, options: MatchOptions) -> (Regex, Vec<Key>) {
        to_regex(&parse(path).unwrap(), options).unwrap()
    }

    fn names(keys: &[Key]) -> Vec<&str> {
        keys.iter().map(|k| k.name.as_str()).collect()
    }

    #[test]
    fn named_parameters() {
        let (re, keys) = compile("/users/:id/posts/:post", MatchOptions::default());
        assert_eq!(names(&keys), ["id", "post"]);

        let caps = re.captures("/users/42/posts/hello").unwrap();
        assert_eq!(&caps[1], "42");
        assert_eq!(&caps[2], "hello");
        assert!(re.is_match("/users/42/posts/hello/"));
        assert!(!re.is_match("/users/42/posts"));
        assert!(!re.is_match("/users/42/posts/hello/extra"));
    }

    #[test]
    fn custom_and_unnamed_patterns() {
        let (re, keys) = compile(r"/files/:id(\d+)/(.*)", MatchOptions::default());
        assert_eq!(names(&keys), ["id", "0"]);
        assert!(re.is_match("/files/12/a/b.txt"));
        assert!(!re.is_match("/files/abc/a"));
    }

    #[test]
    fn optional_and_repeated_parameters() {
        let (re, _) = compile("/users/:id?", MatchOptions::default());
        assert!(re.is_match("/users"));
        assert!(re.is_match("/users/7"));

        let (re, _) = compile("/files/:path+", MatchOptions::default());
        let caps = re.captures("/files/a/b/c").unwrap();
        assert_eq!(&caps[1], "a/b/c");
        assert!(!re.is_match("/files"));

        let (re, _) = compile("/files/:path*", MatchOptions::default());
        assert!(re.is_match("/files"));
    }

    #[test]
    fn groups_and_escapes() {
        let (re, keys) = compile("/icon{-:size}?.png", MatchOptions::default());
        assert_eq!(names(&keys), ["size"]);
        assert_eq!(&re.captures("/icon-64.png").unwrap()[1], "64");
        assert!(re.is_match("/icon.png"));

        let (re, keys) = compile(r"/price/\:amount", MatchOptions::default());
        assert!(keys.is_empty());
        assert!(re.is_match("/price/:amount"));
    }

    #[test]
    fn flags_change_matching() {
        let (re, _) = compile("/About", MatchOptions::default());
        assert!(re.is_match("/about/"));

        let (re, _) = compile("/About", MatchOptions { sensitive: true, strict: true, end: true });
        assert!(!re.is_match("/about"));
        assert!(!re.is_match("/About/"));
        assert!(re.is_match("/About"));
    }

    #[test]
    fn prefix_patterns_stop_at_delimiters() {
        let options = MatchOptions { end: false, ..Default::default() };
        let (re, _) = compile("/api", options);
        assert!(re.is_match("/api"));
        assert!(re.is_match("/api/users"));
        assert!(!re.is_match("/apiary"));

        let (re, _) = compile("(.*)", options);
        assert!(re.is_match("/anything/at/all"));
    }

    #[test]
    fn malformed_patterns_are_rejected() {
        assert_eq!(parse("/:").unwrap_err().to_string(), "Missing parameter name at 1");
        assert!(parse("/(abc").is_err());
        assert!(parse("/(?abc)").is_err());
        assert!(parse("/((a))").is_err());
        assert!(parse("/{:id").is_err());
    }

    #[test]
    fn paths_are_built_from_parameters() {
        assert_eq!(to_path("/users/:id", &[("id", "42")], false).unwrap(), "/users/42");
        assert_eq!(to_path("/users/:id?", &[], false).unwrap(), "/users");
        assert_eq!(to_path("/search/:q", &[("q", "a b")], true).unwrap(), "/search/a%20b");
        assert_eq!(
            to_path(r"/users/:id(\d+)", &[("id", "x")], false).unwrap_err().to_string(),
            r#"Expected "id" to match "\d+", but got "x""#
        );
        assert_eq!(
            to_path("/users/:id", &[], false).unwrap_err().to_string(),
            r#"Expected "id" to be a string"#
        );
    }
}
