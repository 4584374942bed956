//! HTTP mock definitions and the decoded request they match against.

use crate::error::ValidationError;
use crate::matcher::{parse_query_string, Pattern};
use crate::sse::SseConfig;
use crate::stateful::StatefulBinding;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// HTTP mock payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "HttpSpecDocument", into = "HttpSpecDocument")]
pub struct HttpSpec {
    /// Higher priority wins before specificity is considered
    pub priority: i32,
    pub matcher: HttpMatcher,
    pub action: HttpAction,
}

/// What a matched HTTP mock does. Exactly one applies.
#[derive(Debug, Clone, PartialEq)]
pub enum HttpAction {
    Respond(HttpResponse),
    Stream(SseConfig),
    Stateful(StatefulBinding),
}

impl HttpSpec {
    pub fn new(matcher: HttpMatcher, action: HttpAction) -> Self {
        Self {
            priority: 0,
            matcher,
            action,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Number of populated optional constraints.
    pub fn specificity(&self) -> usize {
        self.matcher.specificity()
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        self.matcher.validate()?;
        match &self.action {
            HttpAction::Respond(response) => response.validate(),
            HttpAction::Stream(sse) => sse.validate(),
            HttpAction::Stateful(_) => Ok(()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HttpSpecDocument {
    #[serde(default)]
    priority: i32,
    matcher: HttpMatcher,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    response: Option<HttpResponse>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    sse: Option<SseConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    stateful_operation: Option<StatefulBinding>,
}

impl TryFrom<HttpSpecDocument> for HttpSpec {
    type Error = ValidationError;

    fn try_from(doc: HttpSpecDocument) -> Result<Self, Self::Error> {
        let action = match (doc.response, doc.sse, doc.stateful_operation) {
            (Some(response), None, None) => HttpAction::Respond(response),
            (None, Some(sse), None) => HttpAction::Stream(sse),
            (None, None, Some(binding)) => HttpAction::Stateful(binding),
            (None, None, None) => {
                return Err(ValidationError::MissingOneOf {
                    context: "http",
                    options: "response, sse, statefulOperation",
                })
            }
            (response, sse, _) => {
                let (first, second) = match (response.is_some(), sse.is_some()) {
                    (true, true) => ("response", "sse"),
                    (true, false) => ("response", "statefulOperation"),
                    _ => ("sse", "statefulOperation"),
                };
                return Err(ValidationError::MutuallyExclusive {
                    context: "http",
                    first,
                    second,
                });
            }
        };
        Ok(HttpSpec {
            priority: doc.priority,
            matcher: doc.matcher,
            action,
        })
    }
}

impl From<HttpSpec> for HttpSpecDocument {
    fn from(spec: HttpSpec) -> Self {
        let mut doc = HttpSpecDocument {
            priority: spec.priority,
            matcher: spec.matcher,
            response: None,
            sse: None,
            stateful_operation: None,
        };
        match spec.action {
            HttpAction::Respond(response) => doc.response = Some(response),
            HttpAction::Stream(sse) => doc.sse = Some(sse),
            HttpAction::Stateful(binding) => doc.stateful_operation = Some(binding),
        }
        doc
    }
}

/// How the request path is matched.
#[derive(Debug, Clone, PartialEq)]
pub enum PathRule {
    Exact(String),
    Pattern(Pattern),
}

impl PathRule {
    /// The configured path or pattern source.
    pub fn as_str(&self) -> &str {
        match self {
            PathRule::Exact(path) => path,
            PathRule::Pattern(pattern) => pattern.as_str(),
        }
    }
}

/// Request matching constraints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "HttpMatcherDocument", into = "HttpMatcherDocument")]
pub struct HttpMatcher {
    pub method: String,
    pub path: PathRule,
    pub headers: BTreeMap<String, String>,
    pub query_params: BTreeMap<String, String>,
    pub body_contains: Option<String>,
    /// JSON path expressions and expected values (null = path must resolve)
    pub body_json_path: BTreeMap<String, serde_json::Value>,
}

impl HttpMatcher {
    pub fn new(method: impl Into<String>, path: PathRule) -> Self {
        Self {
            method: method.into(),
            path,
            headers: BTreeMap::new(),
            query_params: BTreeMap::new(),
            body_contains: None,
            body_json_path: BTreeMap::new(),
        }
    }

    pub fn exact(method: impl Into<String>, path: impl Into<String>) -> Self {
        Self::new(method, PathRule::Exact(path.into()))
    }

    pub fn pattern(method: impl Into<String>, pattern: &str) -> Result<Self, ValidationError> {
        Ok(Self::new(method, PathRule::Pattern(Pattern::new(pattern)?)))
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_query(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query_params.insert(name.into(), value.into());
        self
    }

    pub fn with_body_contains(mut self, needle: impl Into<String>) -> Self {
        self.body_contains = Some(needle.into());
        self
    }

    pub fn specificity(&self) -> usize {
        self.headers.len()
            + self.query_params.len()
            + usize::from(self.body_contains.is_some())
            + self.body_json_path.len()
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.method.trim().is_empty() {
            return Err(ValidationError::Missing("http.matcher.method"));
        }
        if let PathRule::Exact(path) = &self.path {
            if !path.starts_with('/') {
                return Err(ValidationError::Invalid(format!(
                    "http.matcher.path {path:?} must start with '/'"
                )));
            }
        }
        for expr in self.body_json_path.keys() {
            jsonpath_rust::JsonPath::<serde_json::Value>::try_from(expr.as_str())
                .map_err(|_| ValidationError::Invalid(format!("invalid JSON path {expr:?}")))?;
        }
        Ok(())
    }
}

fn default_method() -> String {
    "GET".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HttpMatcherDocument {
    #[serde(default = "default_method")]
    method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    path_pattern: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    headers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    query_params: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    body_contains: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    body_json_path: BTreeMap<String, serde_json::Value>,
}

impl TryFrom<HttpMatcherDocument> for HttpMatcher {
    type Error = ValidationError;

    fn try_from(doc: HttpMatcherDocument) -> Result<Self, Self::Error> {
        let path = match (doc.path, doc.path_pattern) {
            (Some(_), Some(_)) => {
                return Err(ValidationError::MutuallyExclusive {
                    context: "http.matcher",
                    first: "path",
                    second: "pathPattern",
                })
            }
            (Some(path), None) => PathRule::Exact(path),
            (None, Some(pattern)) => PathRule::Pattern(Pattern::new(&pattern)?),
            (None, None) => {
                return Err(ValidationError::MissingOneOf {
                    context: "http.matcher",
                    options: "path, pathPattern",
                })
            }
        };
        Ok(HttpMatcher {
            method: doc.method,
            path,
            headers: doc.headers,
            query_params: doc.query_params,
            body_contains: doc.body_contains,
            body_json_path: doc.body_json_path,
        })
    }
}

impl From<HttpMatcher> for HttpMatcherDocument {
    fn from(matcher: HttpMatcher) -> Self {
        let (path, path_pattern) = match matcher.path {
            PathRule::Exact(path) => (Some(path), None),
            PathRule::Pattern(pattern) => (None, Some(pattern.as_str().to_string())),
        };
        HttpMatcherDocument {
            method: matcher.method,
            path,
            path_pattern,
            headers: matcher.headers,
            query_params: matcher.query_params,
            body_contains: matcher.body_contains,
            body_json_path: matcher.body_json_path,
        }
    }
}

/// Static or templated response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct HttpResponse {
    #[serde(default = "default_status")]
    pub status_code: u16,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,

    /// Body text; rendered as a template when it contains `{{`
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub body: String,

    /// Read the body from a file at response time
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body_file: Option<String>,

    /// Artificial delay before responding
    #[serde(default, skip_serializing_if = "is_zero")]
    pub delay_ms: u64,
}

fn default_status() -> u16 {
    200
}

fn is_zero(value: &u64) -> bool {
    *value == 0
}

impl Default for HttpResponse {
    fn default() -> Self {
        Self {
            status_code: default_status(),
            headers: BTreeMap::new(),
            body: String::new(),
            body_file: None,
            delay_ms: 0,
        }
    }
}

impl HttpResponse {
    pub fn new(status_code: u16, body: impl Into<String>) -> Self {
        Self {
            status_code,
            body: body.into(),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if !(100..=599).contains(&self.status_code) {
            return Err(ValidationError::InvalidStatus(self.status_code));
        }
        if !self.body.is_empty() && self.body_file.is_some() {
            return Err(ValidationError::MutuallyExclusive {
                context: "http.response",
                first: "body",
                second: "bodyFile",
            });
        }
        Ok(())
    }

    /// Case-insensitive response header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// A decoded HTTP request handed over by the transport.
#[derive(Debug, Clone, Default)]
pub struct HttpRequest {
    pub method: String,
    pub path: String,
    pub headers: HashMap<String, String>,
    pub query: HashMap<String, String>,
    pub body: Option<Vec<u8>>,
}

impl HttpRequest {
    pub fn new(method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            path: path.into(),
            ..Self::default()
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_query(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.insert(name.into(), value.into());
        self
    }

    /// Merge parameters from a raw `a=1&b=2` query string.
    pub fn with_query_string(mut self, query: &str) -> Self {
        self.query.extend(parse_query_string(query));
        self
    }

    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Body as UTF-8 text, if it is text.
    pub fn body_str(&self) -> Option<&str> {
        self.body.as_deref().and_then(|b| std::str::from_utf8(b).ok())
    }

    /// Body parsed as JSON, if it is JSON.
    pub fn body_json(&self) -> Option<serde_json::Value> {
        self.body_str().and_then(|s| serde_json::from_str(s).ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stateful::{CrudAction, StatefulAction};

    #[test]
    fn test_path_and_pattern_are_exclusive() {
        let yaml = r#"
matcher:
  method: GET
  path: /users
  pathPattern: "^/users/\\d+$"
response:
  statusCode: 200
"#;
        let err = serde_yaml::from_str::<HttpSpec>(yaml).unwrap_err().to_string();
        assert!(err.contains("mutually exclusive"), "{err}");
    }

    #[test]
    fn test_invalid_regex_rejected() {
        let yaml = r#"
matcher:
  pathPattern: "/users/(unclosed"
response:
  statusCode: 200
"#;
        let err = serde_yaml::from_str::<HttpSpec>(yaml).unwrap_err().to_string();
        assert!(err.contains("invalid regex"), "{err}");
    }

    #[test]
    fn test_response_and_sse_are_exclusive() {
        let yaml = r#"
matcher: {path: /events}
response: {statusCode: 200}
sse:
  events:
    - data: hello
"#;
        let err = serde_yaml::from_str::<HttpSpec>(yaml).unwrap_err().to_string();
        assert!(err.contains("`response` and `sse`"), "{err}");
    }

    #[test]
    fn test_stateful_operation_parsed() {
        let yaml = r#"
matcher: {method: POST, path: /users}
statefulOperation: users.create
"#;
        let spec: HttpSpec = serde_yaml::from_str(yaml).unwrap();
        match spec.action {
            HttpAction::Stateful(binding) => {
                assert_eq!(binding.resource, "users");
                assert_eq!(binding.action, StatefulAction::Crud(CrudAction::Create));
            }
            other => panic!("Expected stateful action, got {other:?}"),
        }
    }

    #[test]
    fn test_specificity_counts_constraints() {
        let matcher = HttpMatcher::exact("GET", "/a")
            .with_header("x-tenant", "t1")
            .with_query("page", "1")
            .with_body_contains("needle");
        assert_eq!(matcher.specificity(), 3);
        assert_eq!(HttpMatcher::exact("GET", "/a").specificity(), 0);
    }

    #[test]
    fn test_invalid_status_rejected() {
        let response = HttpResponse::new(42, "");
        assert!(matches!(
            response.validate(),
            Err(ValidationError::InvalidStatus(42))
        ));
    }

    #[test]
    fn test_request_query_string() {
        let request = HttpRequest::new("GET", "/search").with_query_string("q=rust%20lang&page=2");
        assert_eq!(request.query.get("q").map(String::as_str), Some("rust lang"));
        assert_eq!(request.query.get("page").map(String::as_str), Some("2"));
    }

    #[test]
    fn test_matcher_serializes_back_to_wire_shape() {
        let matcher = HttpMatcher::pattern("GET", r"^/users/(?P<id>\d+)$").unwrap();
        let json = serde_json::to_value(&matcher).unwrap();
        assert_eq!(json["pathPattern"], r"^/users/(?P<id>\d+)$");
        assert!(json.get("path").is_none());
    }
}
