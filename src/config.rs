//! Mock definitions, the interchange collection, and engine settings.
//!
//! A mock travels over the wire as `{id, name, type, enabled, <protocol>: {...}}`
//! and lives in memory as a [`Mock`] whose [`MockSpec`] is a sum type, so the
//! declared type can never disagree with the populated payload.

use crate::error::ValidationError;
use crate::protocol::{
    GraphqlSpec, GrpcSpec, HttpSpec, MqttSpec, OAuthSpec, SoapSpec, WebSocketSpec,
};
use crate::stateful::StatefulResourceConfig;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;

/// Protocol a mock answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MockType {
    Http,
    #[serde(rename = "websocket")]
    WebSocket,
    Graphql,
    Grpc,
    Mqtt,
    Soap,
    Oauth,
}

impl MockType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MockType::Http => "http",
            MockType::WebSocket => "websocket",
            MockType::Graphql => "graphql",
            MockType::Grpc => "grpc",
            MockType::Mqtt => "mqtt",
            MockType::Soap => "soap",
            MockType::Oauth => "oauth",
        }
    }
}

impl fmt::Display for MockType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MockType {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "http" => Ok(MockType::Http),
            "websocket" | "ws" => Ok(MockType::WebSocket),
            "graphql" => Ok(MockType::Graphql),
            "grpc" => Ok(MockType::Grpc),
            "mqtt" => Ok(MockType::Mqtt),
            "soap" => Ok(MockType::Soap),
            "oauth" | "oidc" => Ok(MockType::Oauth),
            other => Err(ValidationError::Invalid(format!(
                "unknown mock type {other:?}"
            ))),
        }
    }
}

/// Protocol-specific payload of a mock.
#[derive(Debug, Clone, PartialEq)]
pub enum MockSpec {
    Http(HttpSpec),
    WebSocket(WebSocketSpec),
    Graphql(GraphqlSpec),
    Grpc(GrpcSpec),
    Mqtt(MqttSpec),
    Soap(SoapSpec),
    Oauth(OAuthSpec),
}

impl MockSpec {
    /// The type tag, derived from the variant.
    pub fn kind(&self) -> MockType {
        match self {
            MockSpec::Http(_) => MockType::Http,
            MockSpec::WebSocket(_) => MockType::WebSocket,
            MockSpec::Graphql(_) => MockType::Graphql,
            MockSpec::Grpc(_) => MockType::Grpc,
            MockSpec::Mqtt(_) => MockType::Mqtt,
            MockSpec::Soap(_) => MockType::Soap,
            MockSpec::Oauth(_) => MockType::Oauth,
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        match self {
            MockSpec::Http(spec) => spec.validate(),
            MockSpec::WebSocket(spec) => spec.validate(),
            MockSpec::Graphql(spec) => spec.validate(),
            MockSpec::Grpc(spec) => spec.validate(),
            MockSpec::Mqtt(spec) => spec.validate(),
            MockSpec::Soap(spec) => spec.validate(),
            MockSpec::Oauth(spec) => spec.validate(),
        }
    }
}

/// A single mock definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "MockDocument", into = "MockDocument")]
pub struct Mock {
    /// Unique identifier; empty until the store assigns one
    pub id: String,
    pub name: Option<String>,
    pub enabled: bool,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    pub spec: MockSpec,
}

impl Mock {
    /// Create an enabled, not yet registered mock.
    pub fn new(spec: MockSpec) -> Self {
        Self {
            id: String::new(),
            name: None,
            enabled: true,
            created_at: None,
            updated_at: None,
            spec,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn kind(&self) -> MockType {
        self.spec.kind()
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        self.spec.validate()
    }

    pub fn as_http(&self) -> Option<&HttpSpec> {
        match &self.spec {
            MockSpec::Http(spec) => Some(spec),
            _ => None,
        }
    }

    pub fn as_grpc(&self) -> Option<&GrpcSpec> {
        match &self.spec {
            MockSpec::Grpc(spec) => Some(spec),
            _ => None,
        }
    }

    pub fn as_mqtt(&self) -> Option<&MqttSpec> {
        match &self.spec {
            MockSpec::Mqtt(spec) => Some(spec),
            _ => None,
        }
    }

    pub fn as_soap(&self) -> Option<&SoapSpec> {
        match &self.spec {
            MockSpec::Soap(spec) => Some(spec),
            _ => None,
        }
    }
}

/// Wire shape of a mock: a type tag plus one optional payload per protocol.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MockDocument {
    #[serde(default)]
    id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    kind: Option<MockType>,
    #[serde(default = "default_true")]
    enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    updated_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    http: Option<HttpSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    websocket: Option<WebSocketSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    graphql: Option<GraphqlSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    grpc: Option<GrpcSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    mqtt: Option<MqttSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    soap: Option<SoapSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    oauth: Option<OAuthSpec>,
}

fn default_true() -> bool {
    true
}

impl TryFrom<MockDocument> for Mock {
    type Error = ValidationError;

    fn try_from(doc: MockDocument) -> Result<Self, Self::Error> {
        let mut payloads = Vec::with_capacity(1);
        payloads.extend(doc.http.map(MockSpec::Http));
        payloads.extend(doc.websocket.map(MockSpec::WebSocket));
        payloads.extend(doc.graphql.map(MockSpec::Graphql));
        payloads.extend(doc.grpc.map(MockSpec::Grpc));
        payloads.extend(doc.mqtt.map(MockSpec::Mqtt));
        payloads.extend(doc.soap.map(MockSpec::Soap));
        payloads.extend(doc.oauth.map(MockSpec::Oauth));

        if payloads.len() > 1 {
            let kind = doc.kind.unwrap_or_else(|| payloads[0].kind());
            return Err(ValidationError::AmbiguousPayload(kind));
        }
        let spec = payloads.pop().ok_or(ValidationError::MissingOneOf {
            context: "mock",
            options: "http, websocket, graphql, grpc, mqtt, soap, oauth",
        })?;

        if let Some(declared) = doc.kind {
            if declared != spec.kind() {
                return Err(ValidationError::TypeMismatch {
                    declared,
                    actual: spec.kind(),
                });
            }
        }
        spec.validate()?;

        Ok(Mock {
            id: doc.id,
            name: doc.name,
            enabled: doc.enabled,
            created_at: doc.created_at,
            updated_at: doc.updated_at,
            spec,
        })
    }
}

impl From<Mock> for MockDocument {
    fn from(mock: Mock) -> Self {
        let mut doc = MockDocument {
            id: mock.id,
            name: mock.name,
            kind: Some(mock.spec.kind()),
            enabled: mock.enabled,
            created_at: mock.created_at,
            updated_at: mock.updated_at,
            http: None,
            websocket: None,
            graphql: None,
            grpc: None,
            mqtt: None,
            soap: None,
            oauth: None,
        };
        match mock.spec {
            MockSpec::Http(spec) => doc.http = Some(spec),
            MockSpec::WebSocket(spec) => doc.websocket = Some(spec),
            MockSpec::Graphql(spec) => doc.graphql = Some(spec),
            MockSpec::Grpc(spec) => doc.grpc = Some(spec),
            MockSpec::Mqtt(spec) => doc.mqtt = Some(spec),
            MockSpec::Soap(spec) => doc.soap = Some(spec),
            MockSpec::Oauth(spec) => doc.oauth = Some(spec),
        }
        doc
    }
}

pub const COLLECTION_VERSION: &str = "1.0";

fn default_version() -> String {
    COLLECTION_VERSION.to_string()
}

/// The unit exchanged by import, export and config files.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MockCollection {
    #[serde(default = "default_version")]
    pub version: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(default)]
    pub mocks: Vec<Mock>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stateful_resources: Vec<StatefulResourceConfig>,
}

impl Default for MockCollection {
    fn default() -> Self {
        Self {
            version: default_version(),
            name: None,
            mocks: Vec::new(),
            stateful_resources: Vec::new(),
        }
    }
}

impl MockCollection {
    /// Load a collection from a YAML or JSON file (chosen by extension).
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let is_json = path
            .extension()
            .map(|ext| ext.eq_ignore_ascii_case("json"))
            .unwrap_or(false);
        let collection = if is_json {
            Self::from_json(&content)?
        } else {
            Self::from_yaml(&content)?
        };
        collection.validate()?;
        Ok(collection)
    }

    pub fn from_yaml(yaml: &str) -> anyhow::Result<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    pub fn from_json(json: &str) -> anyhow::Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn to_yaml(&self) -> anyhow::Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    pub fn to_json(&self) -> anyhow::Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Validate every mock and stateful resource.
    pub fn validate(&self) -> anyhow::Result<()> {
        for (i, mock) in self.mocks.iter().enumerate() {
            mock.validate()
                .map_err(|e| anyhow::anyhow!("Mock {} ({}): {}", i, mock.id, e))?;
        }
        for resource in &self.stateful_resources {
            resource
                .validate()
                .map_err(|e| anyhow::anyhow!("Stateful resource {}: {}", resource.name, e))?;
        }
        Ok(())
    }
}

/// Engine-wide settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct EngineSettings {
    /// Log every matched request
    #[serde(default = "default_true")]
    pub log_matches: bool,

    /// Log requests no mock handles
    #[serde(default = "default_true")]
    pub log_unmatched: bool,

    /// Content type used when a response declares none
    #[serde(default = "default_content_type")]
    pub default_content_type: String,

    /// Upper bound applied to any per-response delay
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Frames buffered between an SSE emitter and its transport
    #[serde(default = "default_sse_buffer")]
    pub sse_buffer: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            log_matches: true,
            log_unmatched: true,
            default_content_type: default_content_type(),
            max_delay_ms: default_max_delay_ms(),
            sse_buffer: default_sse_buffer(),
        }
    }
}

fn default_content_type() -> String {
    "application/json".to_string()
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_sse_buffer() -> usize {
    1
}

/// A config file: engine settings plus the initial collection.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub settings: EngineSettings,

    #[serde(flatten)]
    pub collection: MockCollection,
}

impl EngineConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_yaml::from_str(&content)?;
        config.collection.validate()?;
        Ok(config)
    }
}
