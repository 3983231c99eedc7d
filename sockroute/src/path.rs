//! URL-template matching for routes and push listeners.
//!
//! Pattern segments:
//!
//! | Segment  | Matches                              | Binding            |
//! |----------|--------------------------------------|--------------------|
//! | `users`  | that literal, ASCII case-insensitive | none               |
//! | `:id`    | exactly one segment                  | `id`               |
//! | `:id?`   | zero or one segment                  | `id` when present  |
//! | `:rest*` | zero or more segments                | `rest`, `/`-joined |
//! | `:rest+` | one or more segments                 | `rest`, `/`-joined |
//! | `*`      | zero or more segments                | `"0"`, `"1"`, …    |
//!
//! Matching is whole-path only; a trailing slash on the url is ignored and
//! the query string is split off before matching.

use std::collections::HashMap;
use std::fmt;

/// Parameters bound by a successful match.
pub type Params = HashMap<String, String>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Repeat {
    One,
    Optional,
    ZeroOrMore,
    OneOrMore,
}

impl Repeat {
    fn bounds(self) -> (usize, Option<usize>) {
        match self {
            Repeat::One => (1, Some(1)),
            Repeat::Optional => (0, Some(1)),
            Repeat::ZeroOrMore => (0, None),
            Repeat::OneOrMore => (1, None),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Param { name: String, repeat: Repeat },
}

/// A compiled path pattern such as `/resource/:id`.
#[derive(Clone, PartialEq, Eq)]
pub struct PathPattern {
    source: String,
    segments: Vec<Segment>,
}

impl PathPattern {
    pub fn parse(pattern: &str) -> Self {
        let mut wildcard = 0usize;
        let segments = split_segments(pattern)
            .map(|raw| {
                if raw == "*" {
                    let name = wildcard.to_string();
                    wildcard += 1;
                    return Segment::Param {
                        name,
                        repeat: Repeat::ZeroOrMore,
                    };
                }
                match raw.strip_prefix(':') {
                    Some(param) if !param.is_empty() => {
                        let (name, repeat) = match param.as_bytes()[param.len() - 1] {
                            b'?' => (&param[..param.len() - 1], Repeat::Optional),
                            b'*' => (&param[..param.len() - 1], Repeat::ZeroOrMore),
                            b'+' => (&param[..param.len() - 1], Repeat::OneOrMore),
                            _ => (param, Repeat::One),
                        };
                        Segment::Param {
                            name: name.to_string(),
                            repeat,
                        }
                    }
                    _ => Segment::Literal(percent_decode(raw)),
                }
            })
            .collect();
        Self {
            source: pattern.to_string(),
            segments,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Match a url path (query string already removed or not).
    pub fn matches(&self, url: &str) -> Option<Params> {
        let (path, _) = split_query(url);
        let parts: Vec<String> = split_segments(path).map(percent_decode).collect();
        let mut params = Params::new();
        if match_from(&self.segments, &parts, &mut params) {
            Some(params)
        } else {
            None
        }
    }
}

impl fmt::Debug for PathPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PathPattern({:?})", self.source)
    }
}

impl From<&str> for PathPattern {
    fn from(pattern: &str) -> Self {
        Self::parse(pattern)
    }
}

impl From<String> for PathPattern {
    fn from(pattern: String) -> Self {
        Self::parse(&pattern)
    }
}

fn split_segments(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|s| !s.is_empty())
}

fn match_from(segments: &[Segment], parts: &[String], params: &mut Params) -> bool {
    let Some((segment, rest)) = segments.split_first() else {
        return parts.is_empty();
    };
    match segment {
        Segment::Literal(literal) => match parts.split_first() {
            Some((part, remaining)) if part.eq_ignore_ascii_case(literal) => {
                match_from(rest, remaining, params)
            }
            _ => false,
        },
        Segment::Param { name, repeat } => {
            let (min, max) = repeat.bounds();
            let max = max.unwrap_or(parts.len()).min(parts.len());
            if min > max {
                return false;
            }
            // Greedy first, backtrack toward the minimum.
            for take in (min..=max).rev() {
                if match_from(rest, &parts[take..], params) {
                    if take > 0 {
                        params.insert(name.clone(), parts[..take].join("/"));
                    }
                    return true;
                }
            }
            false
        }
    }
}

/// Split `url` into path and (possibly empty) query string.
pub fn split_query(url: &str) -> (&str, &str) {
    url.split_once('?').unwrap_or((url, ""))
}

/// Parse `a=1&b=two%20words` into pairs. Later duplicates win.
pub fn parse_query(query: &str) -> HashMap<String, String> {
    query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            (
                percent_decode(&key.replace('+', " ")),
                percent_decode(&value.replace('+', " ")),
            )
        })
        .collect()
}

/// Decode `%XX` escapes. Malformed escapes are kept verbatim; invalid UTF-8
/// is replaced.
pub fn percent_decode(input: &str) -> String {
    if !input.contains('%') {
        return input.to_string();
    }
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            if let (Some(high), Some(low)) = (hex(bytes[i + 1]), hex(bytes[i + 2])) {
                out.push((high << 4) | low);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn hex(byte: u8) -> Option<u8> {
    match byte {
        b'0'..=b'9' => Some(byte - b'0'),
        b'a'..=b'f' => Some(byte - b'a' + 10),
        b'A'..=b'F' => Some(byte - b'A' + 10),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bind(pattern: &str, url: &str) -> Option<Params> {
        PathPattern::parse(pattern).matches(url)
    }

    #[test]
    fn test_named_param() {
        let params = bind("/resource/:id", "/resource/42").unwrap();
        assert_eq!(params["id"], "42");
        assert!(bind("/resource/:id", "/resource/42/extra").is_none());
        assert!(bind("/resource/:id", "/resource").is_none());
    }

    #[test]
    fn test_literal_case_and_trailing_slash() {
        assert!(bind("/Users", "/users/").is_some());
        assert!(bind("/", "/").is_some());
        assert!(bind("/", "").is_some());
        assert!(bind("/users", "/user").is_none());
    }

    #[test]
    fn test_query_string_ignored() {
        let params = bind("/search/:term", "/search/rust?page=2").unwrap();
        assert_eq!(params["term"], "rust");
    }

    #[test]
    fn test_optional_param() {
        assert!(bind("/posts/:id?", "/posts").unwrap().is_empty());
        assert_eq!(bind("/posts/:id?", "/posts/7").unwrap()["id"], "7");
        assert!(bind("/posts/:id?", "/posts/7/8").is_none());
    }

    #[test]
    fn test_repeating_params() {
        assert_eq!(bind("/files/:path*", "/files/a/b/c").unwrap()["path"], "a/b/c");
        assert!(bind("/files/:path*", "/files").unwrap().get("path").is_none());
        assert!(bind("/files/:path+", "/files").is_none());
        assert_eq!(bind("/files/:path+/raw", "/files/a/b/raw").unwrap()["path"], "a/b");
    }

    #[test]
    fn test_anonymous_wildcards() {
        let params = bind("/a/*/b/*", "/a/x/y/b/z").unwrap();
        assert_eq!(params["0"], "x/y");
        assert_eq!(params["1"], "z");
    }

    #[test]
    fn test_percent_decoding() {
        assert_eq!(bind("/u/:name", "/u/J%C3%BCrgen").unwrap()["name"], "Jürgen");
        assert_eq!(percent_decode("100%"), "100%");
        assert_eq!(percent_decode("%zz"), "%zz");
        assert_eq!(percent_decode("a%20b"), "a b");
    }

    #[test]
    fn test_parse_query() {
        let query = parse_query("a=1&b=two+words&c&d=%2F");
        assert_eq!(query["a"], "1");
        assert_eq!(query["b"], "two words");
        assert_eq!(query["c"], "");
        assert_eq!(query["d"], "/");
        assert!(parse_query("").is_empty());
    }
}
