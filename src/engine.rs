//! The mock engine: admin API plus one entry point per protocol.
//!
//! Transports decode their wire format, call into [`MockEngine`] and encode
//! whatever comes back. The engine never touches sockets.

use crate::config::{EngineConfig, EngineSettings, Mock, MockCollection, MockSpec, MockType, COLLECTION_VERSION};
use crate::error::{EngineError, Result};
use crate::matcher::find_http_match;
use crate::merge::{upsert, CreateOptions, CreateOutcome, MergeAction};
use crate::protocol::graphql::{GraphqlOutcome, GraphqlRequest};
use crate::protocol::grpc::{GrpcReply, GrpcSpec};
use crate::protocol::http::{HttpAction, HttpRequest};
use crate::protocol::mqtt::{MqttSpec, PublishSchedule, TopicConfig};
use crate::protocol::oauth::{OAuthErrorBody, TokenIssuer, TokenRequest, TokenResponse, UnsignedTokenIssuer};
use crate::protocol::soap::{json_to_xml, SoapFault, SoapOutcome, SoapRequest};
use crate::protocol::websocket::WsReply;
use crate::resolver::{stateful_status, HttpReply, ResponseResolver};
use crate::sse::SseStream;
use crate::stateful::{
    CustomOperationHandler, StatefulOutcome, StatefulRequest, StatefulResourceConfig, StatefulStore,
};
use crate::store::{EndpointKey, MockStore};
use crate::template::TemplateContext;
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// What an HTTP request resolved to.
#[derive(Debug)]
pub enum HttpOutcome {
    Reply(HttpReply),
    /// An open SSE stream; the transport drains it frame by frame
    Stream(SseStream),
}

/// Result of the OAuth token endpoint: a token or an OAuth-shaped error.
pub type TokenOutcome = std::result::Result<TokenResponse, OAuthErrorBody>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ImportSummary {
    /// Mocks in the imported collection
    pub imported: usize,
    /// Mocks in the store afterwards
    pub total: usize,
}

/// Request counters and store sizes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineStats {
    pub requests_total: u64,
    pub requests_matched: u64,
    pub requests_unmatched: u64,
    pub mocks: usize,
    pub stateful_resources: usize,
}

/// Multi-protocol mock engine.
pub struct MockEngine {
    store: MockStore,
    resolver: ResponseResolver,
    stateful: Arc<StatefulStore>,
    issuer: Arc<dyn TokenIssuer>,
    /// Parent of every stream's cancellation token
    shutdown: CancellationToken,
    requests_total: AtomicU64,
    requests_matched: AtomicU64,
    requests_unmatched: AtomicU64,
}

impl Default for MockEngine {
    fn default() -> Self {
        Self::new(EngineSettings::default())
    }
}

impl MockEngine {
    /// Create an empty engine.
    pub fn new(settings: EngineSettings) -> Self {
        let stateful = Arc::new(StatefulStore::new());
        info!(
            max_delay_ms = settings.max_delay_ms,
            default_content_type = %settings.default_content_type,
            "Mock engine initialized"
        );
        Self {
            store: MockStore::new(),
            resolver: ResponseResolver::new(settings, Arc::clone(&stateful)),
            stateful,
            issuer: Arc::new(UnsignedTokenIssuer),
            shutdown: CancellationToken::new(),
            requests_total: AtomicU64::new(0),
            requests_matched: AtomicU64::new(0),
            requests_unmatched: AtomicU64::new(0),
        }
    }

    /// Create an engine and load the config file's collection into it.
    pub fn from_config(config: EngineConfig) -> Result<Self> {
        let engine = Self::new(config.settings);
        engine.import_config(config.collection, true)?;
        Ok(engine)
    }

    /// Replace the default unsigned token issuer.
    pub fn with_token_issuer(mut self, issuer: Arc<dyn TokenIssuer>) -> Self {
        self.issuer = issuer;
        self
    }

    pub fn settings(&self) -> &EngineSettings {
        self.resolver.settings()
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            requests_total: self.requests_total.load(Ordering::Relaxed),
            requests_matched: self.requests_matched.load(Ordering::Relaxed),
            requests_unmatched: self.requests_unmatched.load(Ordering::Relaxed),
            mocks: self.store.len(),
            stateful_resources: self.stateful.names().len(),
        }
    }

    /// Cancel every open stream and publish schedule derived from
    /// [`shutdown_token`](Self::shutdown_token).
    pub fn shutdown(&self) {
        info!("Mock engine shutting down");
        self.shutdown.cancel();
    }

    /// A child of the engine's shutdown signal, for transport-owned tasks.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.child_token()
    }

    // Admin API

    /// Register a mock, applying the update and merge rules.
    pub fn create_mock(&self, mock: Mock, options: CreateOptions) -> Result<CreateOutcome> {
        let outcome = self.store.transact(|txn| upsert(txn, mock, options))?;
        let mock = &outcome.mock;
        match outcome.action {
            MergeAction::Created => {
                info!(mock_id = %mock.id, mock_type = %mock.kind(), "Mock created")
            }
            MergeAction::Updated => {
                info!(mock_id = %mock.id, mock_type = %mock.kind(), "Mock updated in place")
            }
            MergeAction::Merged => info!(
                mock_id = %mock.id,
                mock_type = %mock.kind(),
                details = ?outcome.details,
                "Mock merged into existing endpoint"
            ),
        }
        Ok(outcome)
    }

    /// Replace the definition of `id`.
    pub fn update_mock(&self, id: &str, mock: Mock) -> Result<Arc<Mock>> {
        mock.validate()?;
        let updated = self
            .store
            .replace(id, mock)
            .ok_or_else(|| EngineError::not_found("mock", id))?;
        info!(mock_id = %id, mock_type = %updated.kind(), "Mock updated");
        Ok(updated)
    }

    /// Remove a mock. Stateful resources it refers to stay.
    pub fn delete_mock(&self, id: &str) -> Result<Arc<Mock>> {
        let removed = self
            .store
            .remove(id)
            .ok_or_else(|| EngineError::not_found("mock", id))?;
        info!(mock_id = %id, mock_type = %removed.kind(), "Mock deleted");
        Ok(removed)
    }

    pub fn get_mock(&self, id: &str) -> Result<Arc<Mock>> {
        self.store
            .get(id)
            .ok_or_else(|| EngineError::not_found("mock", id))
    }

    /// All mocks, or those of one type, in registration order.
    pub fn list_mocks(&self, kind: Option<MockType>) -> Vec<Arc<Mock>> {
        self.store.list(kind)
    }

    pub fn set_enabled(&self, id: &str, enabled: bool) -> Result<Arc<Mock>> {
        let updated = self.store.transact(|txn| {
            let current = txn.get(id)?;
            let mut mock = (*current).clone();
            mock.enabled = enabled;
            txn.replace(id, mock)
        });
        let updated = updated.ok_or_else(|| EngineError::not_found("mock", id))?;
        info!(mock_id = %id, enabled, "Mock toggled");
        Ok(updated)
    }

    /// Load a collection. Mocks carrying an ID are restored under that ID;
    /// mocks without one go through the create rules. With `replace`, the
    /// store and the stateful resources are cleared first.
    pub fn import_config(&self, collection: MockCollection, replace: bool) -> Result<ImportSummary> {
        for mock in &collection.mocks {
            mock.validate()?;
        }
        for resource in &collection.stateful_resources {
            resource.validate()?;
        }

        let imported = collection.mocks.len();
        let total = self.store.transact(|txn| -> Result<usize> {
            if replace {
                txn.clear();
            }
            for mock in collection.mocks {
                if mock.id.is_empty() {
                    upsert(txn, mock, CreateOptions::default())?;
                } else if txn.get(&mock.id).is_some() {
                    let id = mock.id.clone();
                    txn.replace(&id, mock);
                } else {
                    txn.insert(mock)?;
                }
            }
            Ok(txn.len())
        })?;

        if replace {
            self.stateful.clear();
        }
        for resource in collection.stateful_resources {
            self.stateful.register(resource)?;
        }

        info!(imported, total, replace, "Imported mock collection");
        Ok(ImportSummary { imported, total })
    }

    /// Snapshot of every mock and stateful resource.
    pub fn export_config(&self, name: Option<&str>) -> MockCollection {
        MockCollection {
            version: COLLECTION_VERSION.to_string(),
            name: name.map(String::from),
            mocks: self
                .store
                .list(None)
                .iter()
                .map(|mock| Mock::clone(mock))
                .collect(),
            stateful_resources: self.stateful.snapshot(),
        }
    }

    pub fn register_stateful_resource(&self, config: StatefulResourceConfig) -> Result<()> {
        self.stateful.register(config)?;
        Ok(())
    }

    pub fn remove_stateful_resource(&self, name: &str) -> Result<()> {
        if !self.stateful.remove(name) {
            return Err(EngineError::not_found("stateful resource", name));
        }
        info!(resource = %name, "Removed stateful resource");
        Ok(())
    }

    /// Restore a resource's seed records.
    pub fn reset_stateful_resource(&self, name: &str) -> Result<()> {
        self.stateful.reset(name)?;
        info!(resource = %name, "Reset stateful resource");
        Ok(())
    }

    pub fn stateful_resources(&self) -> Vec<String> {
        self.stateful.names()
    }

    pub fn register_custom_handler(
        &self,
        operation: impl Into<String>,
        handler: Arc<dyn CustomOperationHandler>,
    ) {
        let operation = operation.into();
        debug!(operation = %operation, "Registered custom stateful handler");
        self.stateful.register_handler(operation, handler);
    }

    // Protocol entry points

    fn record_match(&self, mock: &Mock, target: &str) {
        self.requests_matched.fetch_add(1, Ordering::Relaxed);
        if self.settings().log_matches {
            info!(
                mock_id = %mock.id,
                mock_type = %mock.kind(),
                target = %target,
                "Request matched mock"
            );
        }
    }

    fn unmatched(&self, protocol: MockType, target: String) -> EngineError {
        self.requests_unmatched.fetch_add(1, Ordering::Relaxed);
        if self.settings().log_unmatched {
            warn!(protocol = %protocol, target = %target, "No matching mock found");
        }
        EngineError::no_match(protocol, target)
    }

    /// The enabled mock owning `key`, counting the request either way.
    fn endpoint_mock(&self, key: EndpointKey, protocol: MockType, target: String) -> Result<Arc<Mock>> {
        self.requests_total.fetch_add(1, Ordering::Relaxed);
        match self.store.at_endpoint(&key).into_iter().next() {
            Some(mock) => {
                self.record_match(&mock, &target);
                Ok(mock)
            }
            None => Err(self.unmatched(protocol, target)),
        }
    }

    /// Resolve an HTTP request to a reply or an open SSE stream.
    pub async fn handle_http(&self, request: &HttpRequest) -> Result<HttpOutcome> {
        self.requests_total.fetch_add(1, Ordering::Relaxed);
        let target = format!("{} {}", request.method, request.path);

        let candidates = self.store.list(Some(MockType::Http));
        let Some(hit) = find_http_match(&candidates, request) else {
            return Err(self.unmatched(MockType::Http, target));
        };
        self.record_match(&hit.mock, &target);

        let Some(spec) = hit.mock.as_http() else {
            return Err(EngineError::no_match(MockType::Http, target));
        };
        let outcome = match &spec.action {
            HttpAction::Respond(response) => {
                let ctx = TemplateContext::for_http(request, &hit.context);
                HttpOutcome::Reply(self.resolver.respond(&hit.mock.id, response, &ctx).await)
            }
            HttpAction::Stateful(binding) => {
                let stateful_request =
                    self.resolver
                        .http_stateful_request(binding, request, &hit.context);
                let result = self
                    .resolver
                    .dispatch_stateful(binding, stateful_request)
                    .await;
                HttpOutcome::Reply(self.resolver.stateful_reply(result))
            }
            HttpAction::Stream(config) => HttpOutcome::Stream(SseStream::start(
                &hit.mock.id,
                config.clone(),
                &self.shutdown,
                self.settings().sse_buffer,
            )),
        };
        Ok(outcome)
    }

    /// Answer one WebSocket message received on `path`.
    pub fn handle_websocket(&self, path: &str, message: &str) -> Result<WsReply> {
        let mock = self.endpoint_mock(
            EndpointKey::WebSocket(path.to_string()),
            MockType::WebSocket,
            path.to_string(),
        )?;
        match &mock.spec {
            MockSpec::WebSocket(spec) => Ok(spec.reply_to(message)),
            _ => Err(EngineError::no_match(MockType::WebSocket, path)),
        }
    }

    /// Subprotocols advertised during the WebSocket handshake on `path`.
    pub fn websocket_subprotocols(&self, path: &str) -> Vec<String> {
        self.store
            .at_endpoint(&EndpointKey::WebSocket(path.to_string()))
            .first()
            .and_then(|mock| match &mock.spec {
                MockSpec::WebSocket(spec) => Some(spec.subprotocols.clone()),
                _ => None,
            })
            .unwrap_or_default()
    }

    /// Resolve a GraphQL request posted to `path`.
    pub async fn handle_graphql(&self, path: &str, request: &GraphqlRequest) -> Result<GraphqlOutcome> {
        let mock = self.endpoint_mock(
            EndpointKey::Graphql(path.to_string()),
            MockType::Graphql,
            path.to_string(),
        )?;
        let MockSpec::Graphql(spec) = &mock.spec else {
            return Err(EngineError::no_match(MockType::Graphql, path));
        };

        let ctx = TemplateContext::default()
            .with_variables(request.variables.clone().unwrap_or(Value::Null));
        let (outcome, delay_ms) =
            spec.resolve(request, |value| self.resolver.render_value(&mock.id, value, &ctx));
        self.resolver.delay(&mock.id, delay_ms).await;
        Ok(outcome)
    }

    fn grpc_spec(&self, port: u16) -> Result<(Arc<Mock>, GrpcSpec)> {
        let mock = self.endpoint_mock(EndpointKey::Grpc(port), MockType::Grpc, format!("port {port}"))?;
        let spec = mock
            .as_grpc()
            .cloned()
            .ok_or_else(|| EngineError::no_match(MockType::Grpc, format!("port {port}")))?;
        Ok((mock, spec))
    }

    /// Answer a unary gRPC call. An unknown service or method is `NotFound`.
    pub async fn handle_grpc(
        &self,
        port: u16,
        service: &str,
        method: &str,
        payload: Option<&Value>,
    ) -> Result<GrpcReply> {
        let (mock, spec) = self.grpc_spec(port)?;
        let config = spec
            .method(service, method)
            .ok_or_else(|| EngineError::not_found("grpc method", format!("{service}/{method}")))?;

        self.resolver.delay(&mock.id, config.delay_ms).await;
        if let Some(error) = &config.error {
            debug!(mock_id = %mock.id, code = ?error.code, "Returning configured gRPC status");
            return Ok(GrpcReply::Status {
                code: error.code,
                message: error.message.clone(),
            });
        }
        let ctx = TemplateContext::for_payload(payload);
        Ok(GrpcReply::Message(
            self.resolver.render_value(&mock.id, &config.response, &ctx),
        ))
    }

    /// Services listed by server reflection on `port`.
    pub fn grpc_reflection(&self, port: u16) -> Result<Vec<String>> {
        let (_, spec) = self.grpc_spec(port)?;
        Ok(spec
            .reflected_services()
            .into_iter()
            .map(String::from)
            .collect())
    }

    fn mqtt_spec(&self, port: u16) -> Result<MqttSpec> {
        self.store
            .at_endpoint(&EndpointKey::Mqtt(port))
            .first()
            .and_then(|mock| mock.as_mqtt().cloned())
            .ok_or_else(|| EngineError::no_match(MockType::Mqtt, format!("port {port}")))
    }

    /// Publication plan of the broker on `port`, frozen at call time.
    pub fn mqtt_schedule(&self, port: u16) -> Result<PublishSchedule> {
        Ok(PublishSchedule::new(&self.mqtt_spec(port)?))
    }

    pub fn mqtt_topics_for_publish(&self, port: u16, topic: &str) -> Result<Vec<TopicConfig>> {
        let spec = self.mqtt_spec(port)?;
        Ok(spec.topics_for_publish(topic).into_iter().cloned().collect())
    }

    pub fn mqtt_topics_for_subscription(&self, port: u16, filter: &str) -> Result<Vec<TopicConfig>> {
        let spec = self.mqtt_spec(port)?;
        Ok(spec
            .topics_for_subscription(filter)
            .into_iter()
            .cloned()
            .collect())
    }

    /// Resolve a SOAP call posted to `path`. Unknown operations and stateful
    /// failures come back as faults.
    pub async fn handle_soap(&self, path: &str, request: &SoapRequest) -> Result<SoapOutcome> {
        let mock = self.endpoint_mock(
            EndpointKey::Soap(path.to_string()),
            MockType::Soap,
            path.to_string(),
        )?;
        let Some(spec) = mock.as_soap() else {
            return Err(EngineError::no_match(MockType::Soap, path));
        };

        let Some((name, operation)) = spec.find_operation(request) else {
            let wanted = request
                .operation
                .as_deref()
                .or(request.soap_action.as_deref())
                .unwrap_or("<none>");
            return Ok(SoapOutcome::Fault(SoapFault::client(format!(
                "unknown operation {wanted}"
            ))));
        };

        self.resolver.delay(&mock.id, operation.delay_ms).await;
        if let Some(fault) = &operation.fault {
            return Ok(SoapOutcome::Fault(fault.clone()));
        }

        if let Some(binding) = operation.stateful_binding() {
            let stateful_request = StatefulRequest {
                body: request.payload.clone(),
                ..StatefulRequest::default()
            };
            let root = format!("{name}Response");
            let outcome = match self.resolver.dispatch_stateful(&binding, stateful_request).await {
                Ok(StatefulOutcome::List { items, total }) => SoapOutcome::Response(json_to_xml(
                    &root,
                    &json!({ "items": items, "total": total }),
                )),
                Ok(result) => SoapOutcome::Response(json_to_xml(&root, &result.into_body())),
                Err(e) if stateful_status(&e) < 500 => {
                    SoapOutcome::Fault(SoapFault::client(e.to_string()))
                }
                Err(e) => SoapOutcome::Fault(SoapFault::server(e.to_string())),
            };
            return Ok(outcome);
        }

        let ctx = TemplateContext::for_payload(request.payload.as_ref());
        let body = operation.response.as_deref().unwrap_or_default();
        Ok(SoapOutcome::Response(self.resolver.render_text(&mock.id, body, &ctx)))
    }

    fn oauth_mock(&self, issuer: &str) -> Result<Arc<Mock>> {
        let issuer = issuer.trim_end_matches('/');
        self.endpoint_mock(
            EndpointKey::Oauth(issuer.to_string()),
            MockType::Oauth,
            issuer.to_string(),
        )
    }

    /// Run the token endpoint of the provider registered for `issuer`.
    pub async fn oauth_token(&self, issuer: &str, request: &TokenRequest) -> Result<TokenOutcome> {
        let mock = self.oauth_mock(issuer)?;
        let MockSpec::Oauth(spec) = &mock.spec else {
            return Err(EngineError::no_match(MockType::Oauth, issuer));
        };
        let outcome = spec.grant(request, self.issuer.as_ref()).await;
        if let Err(e) = &outcome {
            debug!(mock_id = %mock.id, error = %e.error, "Token request rejected");
        }
        Ok(outcome)
    }

    /// OpenID discovery document of the provider registered for `issuer`.
    pub fn oauth_discovery(&self, issuer: &str) -> Result<Value> {
        let mock = self.oauth_mock(issuer)?;
        match &mock.spec {
            MockSpec::Oauth(spec) => Ok(spec.discovery()),
            _ => Err(EngineError::no_match(MockType::Oauth, issuer)),
        }
    }
}
