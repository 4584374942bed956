//! gRPC mocks: one mock per port, many services and methods per mock.

use crate::error::ValidationError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// gRPC mock payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct GrpcSpec {
    pub port: u16,

    /// Expose services through server reflection
    #[serde(default)]
    pub reflection: bool,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub proto_files: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub import_paths: Vec<String>,

    /// Fully qualified service name to its methods
    #[serde(default)]
    pub services: BTreeMap<String, ServiceConfig>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServiceConfig {
    #[serde(default)]
    pub methods: BTreeMap<String, MethodConfig>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct MethodConfig {
    #[serde(default)]
    pub response: Value,

    /// Answer with a status instead of a message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<GrpcErrorConfig>,

    #[serde(default)]
    pub delay_ms: u64,
}

impl MethodConfig {
    pub fn responding(response: Value) -> Self {
        Self {
            response,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GrpcErrorConfig {
    pub code: GrpcCode,
    #[serde(default)]
    pub message: String,
}

/// Canonical gRPC status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GrpcCode {
    Ok,
    Cancelled,
    Unknown,
    InvalidArgument,
    DeadlineExceeded,
    NotFound,
    AlreadyExists,
    PermissionDenied,
    ResourceExhausted,
    FailedPrecondition,
    Aborted,
    OutOfRange,
    Unimplemented,
    Internal,
    Unavailable,
    DataLoss,
    Unauthenticated,
}

impl GrpcCode {
    /// Numeric value on the wire.
    pub fn as_i32(&self) -> i32 {
        *self as i32
    }
}

/// The answer to one unary call.
#[derive(Debug, Clone, PartialEq)]
pub enum GrpcReply {
    Message(Value),
    Status { code: GrpcCode, message: String },
}

impl GrpcSpec {
    pub fn new(port: u16) -> Self {
        Self {
            port,
            reflection: false,
            proto_files: Vec::new(),
            import_paths: Vec::new(),
            services: BTreeMap::new(),
        }
    }

    pub fn with_method(
        mut self,
        service: impl Into<String>,
        method: impl Into<String>,
        config: MethodConfig,
    ) -> Self {
        self.services
            .entry(service.into())
            .or_default()
            .methods
            .insert(method.into(), config);
        self
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.port == 0 {
            return Err(ValidationError::Missing("grpc.port"));
        }
        for (service, config) in &self.services {
            if service.is_empty() {
                return Err(ValidationError::Invalid(
                    "grpc service names cannot be empty".into(),
                ));
            }
            if config.methods.keys().any(|m| m.is_empty()) {
                return Err(ValidationError::Invalid(format!(
                    "grpc service {service} has an empty method name"
                )));
            }
        }
        Ok(())
    }

    pub fn method(&self, service: &str, method: &str) -> Option<&MethodConfig> {
        self.services.get(service)?.methods.get(method)
    }

    /// Services visible to reflection, sorted; empty when reflection is off.
    pub fn reflected_services(&self) -> Vec<&str> {
        if !self.reflection {
            return Vec::new();
        }
        self.services.keys().map(String::as_str).collect()
    }
}
