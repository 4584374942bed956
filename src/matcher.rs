//! Request matching logic.
//!
//! Selects the winning HTTP mock for a decoded request and provides the
//! wildcard, JSON path and query helpers shared by the other protocols.

use crate::config::Mock;
use crate::error::ValidationError;
use crate::protocol::http::{HttpMatcher, HttpRequest, PathRule};
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// A compiled regular expression that serializes as its source.
#[derive(Clone)]
pub struct Pattern(Regex);

impl Pattern {
    pub fn new(source: &str) -> Result<Self, ValidationError> {
        Regex::new(source)
            .map(Pattern)
            .map_err(|source_err| ValidationError::InvalidRegex {
                pattern: source.to_string(),
                source: source_err,
            })
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }

    pub fn is_match(&self, text: &str) -> bool {
        self.0.is_match(text)
    }

    pub fn regex(&self) -> &Regex {
        &self.0
    }
}

impl fmt::Debug for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Pattern").field(&self.as_str()).finish()
    }
}

impl PartialEq for Pattern {
    fn eq(&self, other: &Self) -> bool {
        self.as_str() == other.as_str()
    }
}

impl Serialize for Pattern {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Pattern {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let source = String::deserialize(deserializer)?;
        Pattern::new(&source).map_err(serde::de::Error::custom)
    }
}

/// Context captured during matching (for template variables).
#[derive(Debug, Clone, Default)]
pub struct MatchContext {
    /// Query parameters of the request
    pub query_params: HashMap<String, String>,
    /// `pathPattern` capture groups, by index and by name
    pub captures: HashMap<String, String>,
}

/// The winning mock and what matching it captured.
#[derive(Debug, Clone)]
pub struct HttpMatch {
    pub mock: Arc<Mock>,
    pub context: MatchContext,
}

/// Pick the winning HTTP mock.
///
/// `candidates` must be in registration order. Higher priority wins, then
/// higher specificity, then the earliest registered mock.
pub fn find_http_match(candidates: &[Arc<Mock>], request: &HttpRequest) -> Option<HttpMatch> {
    let mut best: Option<((i32, usize), HttpMatch)> = None;

    for mock in candidates {
        if !mock.enabled {
            continue;
        }
        let Some(spec) = mock.as_http() else {
            continue;
        };
        let Some(context) = matches_request(&spec.matcher, request) else {
            continue;
        };
        let rank = (spec.priority, spec.specificity());
        if best.as_ref().map_or(true, |(top, _)| rank > *top) {
            best = Some((
                rank,
                HttpMatch {
                    mock: Arc::clone(mock),
                    context,
                },
            ));
        }
    }

    best.map(|(_, hit)| hit)
}

/// Check one matcher against a request, returning the captured context.
pub fn matches_request(matcher: &HttpMatcher, request: &HttpRequest) -> Option<MatchContext> {
    let mut context = MatchContext::default();

    if !matcher.method.eq_ignore_ascii_case(&request.method) {
        return None;
    }

    if !matches_path(&matcher.path, &request.path, &mut context) {
        return None;
    }

    for (name, expected) in &matcher.headers {
        if request.header(name) != Some(expected.as_str()) {
            return None;
        }
    }

    for (name, expected) in &matcher.query_params {
        if request.query.get(name) != Some(expected) {
            return None;
        }
    }

    if let Some(needle) = &matcher.body_contains {
        let body = request.body_str().unwrap_or_default();
        if !body.contains(needle.as_str()) {
            return None;
        }
    }

    if !matcher.body_json_path.is_empty() {
        let json = request.body_json()?;
        for (expr, expected) in &matcher.body_json_path {
            if !json_path_matches(&json, expr, expected) {
                return None;
            }
        }
    }

    context.query_params = request.query.clone();
    Some(context)
}

fn matches_path(rule: &PathRule, path: &str, context: &mut MatchContext) -> bool {
    match rule {
        PathRule::Exact(value) => path == value,
        PathRule::Pattern(pattern) => {
            let regex = pattern.regex();
            let Some(captures) = regex.captures(path) else {
                return false;
            };
            for (i, cap) in captures.iter().enumerate().skip(1) {
                if let Some(m) = cap {
                    context.captures.insert(i.to_string(), m.as_str().to_string());
                }
            }
            for name in regex.capture_names().flatten() {
                if let Some(m) = captures.name(name) {
                    context.captures.insert(name.to_string(), m.as_str().to_string());
                }
            }
            true
        }
    }
}

/// Whether `expr` resolves in `json` to `expected` (null: to anything).
pub fn json_path_matches(json: &serde_json::Value, expr: &str, expected: &serde_json::Value) -> bool {
    use jsonpath_rust::JsonPath;

    let Ok(path) = JsonPath::try_from(expr) else {
        return false;
    };
    let results = path.find(json);

    if expected.is_null() {
        return match &results {
            serde_json::Value::Null => false,
            serde_json::Value::Array(found) => !found.is_empty(),
            _ => true,
        };
    }
    match &results {
        serde_json::Value::Array(found) => {
            found.iter().any(|v| v == expected) || results == *expected
        }
        other => other == expected,
    }
}

/// MQTT topic matching: does `filter` (with `+`/`#`) accept `topic`?
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    // Wildcards never match system topics at the first level.
    if topic.starts_with('$') && (filter.starts_with('+') || filter.starts_with('#')) {
        return false;
    }
    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');
    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (None, None) => return true,
            (Some("+"), Some(_)) => continue,
            (Some(f), Some(t)) if f == t => continue,
            _ => return false,
        }
    }
}

/// Whether some concrete topic is accepted by both filters.
pub fn topic_overlaps(a: &str, b: &str) -> bool {
    let mut a_levels = a.split('/');
    let mut b_levels = b.split('/');
    loop {
        match (a_levels.next(), b_levels.next()) {
            (None, None) => return true,
            (Some("#"), _) | (_, Some("#")) => return true,
            (Some(x), Some(y)) if x == "+" || y == "+" || x == y => continue,
            _ => return false,
        }
    }
}

/// Parse a query string into key-value pairs.
pub fn parse_query_string(query: &str) -> HashMap<String, String> {
    let mut params = HashMap::new();

    for part in query.trim_start_matches('?').split('&') {
        if part.is_empty() {
            continue;
        }
        if let Some((key, value)) = part.split_once('=') {
            params.insert(urlencoding_decode(key), urlencoding_decode(value));
        } else {
            params.insert(urlencoding_decode(part), String::new());
        }
    }

    params
}

/// Percent-decoding that keeps multi-byte UTF-8 sequences intact.
fn urlencoding_decode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut decoded = Vec::with_capacity(bytes.len());
    let mut i = 0;

    while i < bytes.len() {
        match bytes[i] {
            b'%' if i + 2 < bytes.len() => {
                let hex = std::str::from_utf8(&bytes[i + 1..i + 3]).ok();
                match hex.and_then(|h| u8::from_str_radix(h, 16).ok()) {
                    Some(byte) => {
                        decoded.push(byte);
                        i += 3;
                        continue;
                    }
                    None => decoded.push(b'%'),
                }
            }
            b'+' => decoded.push(b' '),
            other => decoded.push(other),
        }
        i += 1;
    }

    String::from_utf8_lossy(&decoded).into_owned()
}
