//! Turns a winning mock into a reply.
//!
//! HTTP and SOAP share the stateful dispatch path here; the SSE handoff
//! lives in [`crate::sse`].

use crate::config::EngineSettings;
use crate::error::StatefulError;
use crate::matcher::MatchContext;
use crate::protocol::http::{HttpRequest, HttpResponse};
use crate::stateful::{StatefulBinding, StatefulOutcome, StatefulRequest, StatefulStore};
use crate::template::{TemplateContext, TemplateEngine};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Header carrying the unpaged record count of a stateful list.
pub const TOTAL_COUNT_HEADER: &str = "X-Total-Count";

/// A fully resolved HTTP response.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpReply {
    pub status_code: u16,
    pub headers: BTreeMap<String, String>,
    pub body: String,
}

impl HttpReply {
    fn json(status_code: u16, body: &Value) -> Self {
        let mut headers = BTreeMap::new();
        headers.insert("Content-Type".to_string(), "application/json".to_string());
        Self {
            status_code,
            headers,
            body: body.to_string(),
        }
    }

    fn error(status_code: u16, message: impl std::fmt::Display) -> Self {
        Self::json(status_code, &json!({ "error": message.to_string() }))
    }

    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn body_json(&self) -> Option<Value> {
        serde_json::from_str(&self.body).ok()
    }
}

/// Builds replies for matched mocks.
pub struct ResponseResolver {
    settings: EngineSettings,
    templates: TemplateEngine,
    stateful: Arc<StatefulStore>,
}

impl ResponseResolver {
    pub fn new(settings: EngineSettings, stateful: Arc<StatefulStore>) -> Self {
        Self {
            settings,
            templates: TemplateEngine::new(),
            stateful,
        }
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// Sleep for `delay_ms`, capped at `max_delay_ms`. Only the calling task
    /// is held up.
    pub async fn delay(&self, mock_id: &str, delay_ms: u64) {
        if delay_ms == 0 {
            return;
        }
        let capped = delay_ms.min(self.settings.max_delay_ms);
        if capped < delay_ms {
            warn!(mock_id = %mock_id, delay_ms, max_delay_ms = capped, "Capping response delay");
        }
        debug!(mock_id = %mock_id, delay_ms = capped, "Applying delay");
        tokio::time::sleep(Duration::from_millis(capped)).await;
    }

    /// Render `text` when it holds a template, falling back to the raw text.
    pub fn render_text(&self, mock_id: &str, text: &str, ctx: &TemplateContext) -> String {
        if !text.contains("{{") {
            return text.to_string();
        }
        self.templates.render(text, ctx).unwrap_or_else(|e| {
            warn!(mock_id = %mock_id, error = %e, "Template render failed, using raw body");
            text.to_string()
        })
    }

    /// Render templated strings inside `value`, falling back to `value`.
    pub fn render_value(&self, mock_id: &str, value: &Value, ctx: &TemplateContext) -> Value {
        self.templates.render_json(value, ctx).unwrap_or_else(|e| {
            warn!(mock_id = %mock_id, error = %e, "Template render failed, using raw value");
            value.clone()
        })
    }

    /// Build the reply for a static or templated HTTP response.
    pub async fn respond(
        &self,
        mock_id: &str,
        response: &HttpResponse,
        ctx: &TemplateContext,
    ) -> HttpReply {
        self.delay(mock_id, response.delay_ms).await;

        let raw = match &response.body_file {
            Some(path) => match tokio::fs::read_to_string(path).await {
                Ok(content) => content,
                Err(e) => {
                    warn!(mock_id = %mock_id, path = %path, error = %e, "Failed to read body file");
                    return HttpReply::error(500, format!("failed to read body file {path}: {e}"));
                }
            },
            None => response.body.clone(),
        };
        let body = self.render_text(mock_id, &raw, ctx);

        let mut headers = response.headers.clone();
        if response.header("content-type").is_none() {
            headers.insert(
                "Content-Type".to_string(),
                self.settings.default_content_type.clone(),
            );
        }

        HttpReply {
            status_code: response.status_code,
            headers,
            body,
        }
    }

    /// Extract the dispatch input for an HTTP-bound stateful operation.
    ///
    /// The record ID comes from the `id` capture, else from the path below
    /// the resource's `basePath`. Failing both, dispatch reads it from the
    /// body.
    pub fn http_stateful_request(
        &self,
        binding: &StatefulBinding,
        request: &HttpRequest,
        matched: &MatchContext,
    ) -> StatefulRequest {
        let id = matched.captures.get("id").cloned().or_else(|| {
            self.stateful
                .get(&binding.resource)
                .and_then(|resource| resource.id_from_path(&request.path))
        });
        let query_number = |name: &str| request.query.get(name).and_then(|v| v.parse().ok());
        StatefulRequest {
            id,
            body: request.body_json(),
            offset: query_number("offset").unwrap_or(0),
            limit: query_number("limit"),
        }
    }

    /// Route `binding` to the stateful store.
    pub async fn dispatch_stateful(
        &self,
        binding: &StatefulBinding,
        request: StatefulRequest,
    ) -> Result<StatefulOutcome, StatefulError> {
        debug!(
            resource = %binding.resource,
            action = %binding.action,
            id = ?request.id,
            "Dispatching stateful operation"
        );
        self.stateful.dispatch(binding, request).await
    }

    /// HTTP rendering of a stateful result.
    pub fn stateful_reply(&self, result: Result<StatefulOutcome, StatefulError>) -> HttpReply {
        match result {
            Ok(StatefulOutcome::List { items, total }) => {
                let mut reply = HttpReply::json(200, &Value::Array(items));
                reply
                    .headers
                    .insert(TOTAL_COUNT_HEADER.to_string(), total.to_string());
                reply
            }
            Ok(StatefulOutcome::Created(record)) => HttpReply::json(201, &record),
            Ok(StatefulOutcome::Deleted(_)) => HttpReply {
                status_code: 204,
                headers: BTreeMap::new(),
                body: String::new(),
            },
            Ok(StatefulOutcome::Record(record)) | Ok(StatefulOutcome::Custom(record)) => {
                HttpReply::json(200, &record)
            }
            Err(e) => HttpReply::error(stateful_status(&e), e),
        }
    }
}

/// HTTP status for a failed stateful dispatch.
pub fn stateful_status(error: &StatefulError) -> u16 {
    match error {
        e if e.is_not_found() => 404,
        StatefulError::MissingId(_) | StatefulError::InvalidPayload(_) => 400,
        StatefulError::Conflict { .. } => 409,
        _ => 500,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stateful::{CrudAction, StatefulResourceConfig};
    use std::io::Write;

    fn resolver() -> ResponseResolver {
        let store = Arc::new(StatefulStore::new());
        store
            .register(
                StatefulResourceConfig::new("users", "/api/users")
                    .with_record(json!({"id": "1", "name": "Ada"})),
            )
            .unwrap();
        ResponseResolver::new(EngineSettings::default(), store)
    }

    fn captures(pairs: &[(&str, &str)]) -> MatchContext {
        MatchContext {
            captures: pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            ..MatchContext::default()
        }
    }

    #[tokio::test]
    async fn test_respond_renders_template_and_defaults_content_type() {
        let resolver = resolver();
        let request = HttpRequest::new("GET", "/users/42");
        let ctx = TemplateContext::for_http(&request, &captures(&[("id", "42")]));
        let response = HttpResponse::new(200, r#"{"id": "{{captures.id}}"}"#);

        let reply = resolver.respond("m", &response, &ctx).await;
        assert_eq!(reply.body, r#"{"id": "42"}"#);
        assert_eq!(reply.header("content-type"), Some("application/json"));
    }

    #[tokio::test]
    async fn test_respond_keeps_declared_content_type() {
        let resolver = resolver();
        let mut response = HttpResponse::new(201, "plain");
        response
            .headers
            .insert("content-type".into(), "text/plain".into());
        let reply = resolver
            .respond("m", &response, &TemplateContext::default())
            .await;
        assert_eq!(reply.status_code, 201);
        assert_eq!(reply.headers.len(), 1);
        assert_eq!(reply.header("Content-Type"), Some("text/plain"));
    }

    #[tokio::test]
    async fn test_broken_template_falls_back_to_raw_body() {
        let resolver = resolver();
        let response = HttpResponse::new(200, "{{#each items}}never closed");
        let reply = resolver
            .respond("m", &response, &TemplateContext::default())
            .await;
        assert_eq!(reply.body, "{{#each items}}never closed");
    }

    #[tokio::test]
    async fn test_body_file() {
        let resolver = resolver();
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "from disk").unwrap();

        let response = HttpResponse {
            body_file: Some(file.path().to_string_lossy().into_owned()),
            ..HttpResponse::default()
        };
        let reply = resolver
            .respond("m", &response, &TemplateContext::default())
            .await;
        assert_eq!(reply.body, "from disk");

        let missing = HttpResponse {
            body_file: Some("/nonexistent/body.json".into()),
            ..HttpResponse::default()
        };
        let reply = resolver
            .respond("m", &missing, &TemplateContext::default())
            .await;
        assert_eq!(reply.status_code, 500);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delay_is_capped() {
        let settings = EngineSettings {
            max_delay_ms: 50,
            ..EngineSettings::default()
        };
        let resolver = ResponseResolver::new(settings, Arc::new(StatefulStore::new()));
        let start = tokio::time::Instant::now();
        resolver.delay("m", 60_000).await;
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(50));
        assert!(elapsed < Duration::from_secs(1));
    }

    #[test]
    fn test_http_stateful_request_id_sources() {
        let resolver = resolver();
        let binding = StatefulBinding::crud("users", CrudAction::Get);

        let request = HttpRequest::new("GET", "/api/users/7");
        let from_capture =
            resolver.http_stateful_request(&binding, &request, &captures(&[("id", "9")]));
        assert_eq!(from_capture.id.as_deref(), Some("9"));

        let from_path =
            resolver.http_stateful_request(&binding, &request, &MatchContext::default());
        assert_eq!(from_path.id.as_deref(), Some("7"));

        let paged = HttpRequest::new("GET", "/api/users").with_query_string("offset=1&limit=2");
        let list = resolver.http_stateful_request(
            &StatefulBinding::crud("users", CrudAction::List),
            &paged,
            &MatchContext::default(),
        );
        assert_eq!(list.id, None);
        assert_eq!(list.offset, 1);
        assert_eq!(list.limit, Some(2));
    }

    #[tokio::test]
    async fn test_stateful_reply_statuses() {
        let resolver = resolver();
        let create = StatefulBinding::crud("users", CrudAction::Create);
        let list = StatefulBinding::crud("users", CrudAction::List);
        let delete = StatefulBinding::crud("users", CrudAction::Delete);

        let created = resolver.stateful_reply(
            resolver
                .dispatch_stateful(
                    &create,
                    StatefulRequest::default().with_body(json!({"id": "2", "name": "Grace"})),
                )
                .await,
        );
        assert_eq!(created.status_code, 201);
        assert_eq!(created.body_json().unwrap()["name"], "Grace");

        let conflict = resolver.stateful_reply(
            resolver
                .dispatch_stateful(
                    &create,
                    StatefulRequest::default().with_body(json!({"id": "2"})),
                )
                .await,
        );
        assert_eq!(conflict.status_code, 409);

        let listed = resolver.stateful_reply(
            resolver
                .dispatch_stateful(&list, StatefulRequest::default())
                .await,
        );
        assert_eq!(listed.status_code, 200);
        assert_eq!(listed.header(TOTAL_COUNT_HEADER), Some("2"));

        let deleted = resolver.stateful_reply(
            resolver
                .dispatch_stateful(&delete, StatefulRequest::default().with_id("1"))
                .await,
        );
        assert_eq!(deleted.status_code, 204);
        assert!(deleted.body.is_empty());

        let missing = resolver.stateful_reply(
            resolver
                .dispatch_stateful(&delete, StatefulRequest::default().with_id("1"))
                .await,
        );
        assert_eq!(missing.status_code, 404);

        let no_id = resolver.stateful_reply(
            resolver
                .dispatch_stateful(&delete, StatefulRequest::default())
                .await,
        );
        assert_eq!(no_id.status_code, 400);
    }
}
