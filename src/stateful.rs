//! In-memory CRUD resources that HTTP and SOAP mocks dispatch into.
//!
//! Resources are registered explicitly and live independently of the mocks
//! that reference them. Each resource has its own lock, so operations on
//! different resources never contend.

use crate::error::{StatefulError, ValidationError};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::convert::Infallible;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info};

/// Declaration of a stateful resource, as found in a collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct StatefulResourceConfig {
    pub name: String,

    /// Path prefix the resource's records live under (`/users` → `/users/{id}`)
    pub base_path: String,

    #[serde(default = "default_id_field")]
    pub id_field: String,

    /// Seed records, restored by a reset
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub records: Vec<Value>,
}

fn default_id_field() -> String {
    "id".to_string()
}

impl StatefulResourceConfig {
    pub fn new(name: impl Into<String>, base_path: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            base_path: base_path.into(),
            id_field: default_id_field(),
            records: Vec::new(),
        }
    }

    pub fn with_record(mut self, record: Value) -> Self {
        self.records.push(record);
        self
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.name.trim().is_empty() || self.name.contains('.') {
            return Err(ValidationError::Invalid(format!(
                "stateful resource name {:?} must be non-empty and contain no '.'",
                self.name
            )));
        }
        if !self.base_path.starts_with('/') {
            return Err(ValidationError::Invalid(format!(
                "stateful basePath {:?} must start with '/'",
                self.base_path
            )));
        }
        if self.id_field.is_empty() {
            return Err(ValidationError::Missing("stateful.idField"));
        }
        if self.records.iter().any(|r| !r.is_object()) {
            return Err(ValidationError::Invalid(format!(
                "stateful resource {}: seed records must be objects",
                self.name
            )));
        }
        Ok(())
    }
}

/// Built-in CRUD actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CrudAction {
    List,
    Get,
    Create,
    Update,
    Delete,
}

impl CrudAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            CrudAction::List => "list",
            CrudAction::Get => "get",
            CrudAction::Create => "create",
            CrudAction::Update => "update",
            CrudAction::Delete => "delete",
        }
    }

    /// Whether the action addresses a single record.
    pub fn needs_id(&self) -> bool {
        matches!(self, CrudAction::Get | CrudAction::Update | CrudAction::Delete)
    }
}

/// A CRUD action, or any other name routed to a custom handler.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum StatefulAction {
    Crud(CrudAction),
    Custom(String),
}

impl FromStr for StatefulAction {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let action = match s.to_ascii_lowercase().as_str() {
            "list" => StatefulAction::Crud(CrudAction::List),
            "get" => StatefulAction::Crud(CrudAction::Get),
            "create" => StatefulAction::Crud(CrudAction::Create),
            "update" => StatefulAction::Crud(CrudAction::Update),
            "delete" => StatefulAction::Crud(CrudAction::Delete),
            _ => StatefulAction::Custom(s.to_string()),
        };
        Ok(action)
    }
}

impl fmt::Display for StatefulAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StatefulAction::Crud(action) => f.write_str(action.as_str()),
            StatefulAction::Custom(name) => f.write_str(name),
        }
    }
}

/// `"{resource}.{action}"` reference from a mock to a resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct StatefulBinding {
    pub resource: String,
    pub action: StatefulAction,
}

impl StatefulBinding {
    pub fn new(resource: impl Into<String>, action: StatefulAction) -> Self {
        Self {
            resource: resource.into(),
            action,
        }
    }

    pub fn crud(resource: impl Into<String>, action: CrudAction) -> Self {
        Self::new(resource, StatefulAction::Crud(action))
    }
}

impl FromStr for StatefulBinding {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.rsplit_once('.') {
            Some((resource, action)) if !resource.is_empty() && !action.is_empty() => {
                let action = action.parse().unwrap_or_else(|never: Infallible| match never {});
                Ok(Self::new(resource, action))
            }
            _ => Err(ValidationError::Invalid(format!(
                "statefulOperation {s:?} must look like resource.action"
            ))),
        }
    }
}

impl TryFrom<String> for StatefulBinding {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<StatefulBinding> for String {
    fn from(binding: StatefulBinding) -> Self {
        binding.to_string()
    }
}

impl fmt::Display for StatefulBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.resource, self.action)
    }
}

/// Input of one dispatch, already extracted from the protocol request.
#[derive(Debug, Clone, Default)]
pub struct StatefulRequest {
    pub id: Option<String>,
    pub body: Option<Value>,
    pub offset: usize,
    pub limit: Option<usize>,
}

impl StatefulRequest {
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }
}

/// Result of a dispatch.
#[derive(Debug, Clone, PartialEq)]
pub enum StatefulOutcome {
    List {
        items: Vec<Value>,
        total: usize,
    },
    Record(Value),
    Created(Value),
    /// The record that was removed
    Deleted(Value),
    Custom(Value),
}

impl StatefulOutcome {
    /// JSON body for the protocol response.
    pub fn into_body(self) -> Value {
        match self {
            StatefulOutcome::List { items, .. } => Value::Array(items),
            StatefulOutcome::Record(record)
            | StatefulOutcome::Created(record)
            | StatefulOutcome::Deleted(record)
            | StatefulOutcome::Custom(record) => record,
        }
    }
}

/// Business logic behind custom actions. The engine only routes to it.
#[async_trait]
pub trait CustomOperationHandler: Send + Sync {
    async fn handle(
        &self,
        resource: &str,
        operation: &str,
        payload: Option<Value>,
    ) -> anyhow::Result<Value>;
}

#[derive(Debug, Default)]
struct Table {
    records: HashMap<String, (u64, Value)>,
    /// Insertion sequence to ID; drives list order
    order: BTreeMap<u64, String>,
    next_seq: u64,
}

impl Table {
    fn insert(&mut self, id: String, record: Value) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.order.insert(seq, id.clone());
        self.records.insert(id, (seq, record));
    }

    fn remove(&mut self, id: &str) -> Option<Value> {
        let (seq, record) = self.records.remove(id)?;
        self.order.remove(&seq);
        Some(record)
    }

    fn get(&self, id: &str) -> Option<&Value> {
        self.records.get(id).map(|(_, record)| record)
    }

    fn iter(&self) -> impl Iterator<Item = &Value> {
        self.order
            .values()
            .filter_map(|id| self.records.get(id).map(|(_, record)| record))
    }
}

/// One named resource and its records.
#[derive(Debug)]
pub struct StatefulResource {
    name: String,
    base_path: String,
    id_field: String,
    seed: Vec<Value>,
    table: RwLock<Table>,
}

impl StatefulResource {
    fn new(config: StatefulResourceConfig) -> Self {
        let resource = Self {
            name: config.name,
            base_path: config.base_path.trim_end_matches('/').to_string(),
            id_field: config.id_field,
            seed: config.records,
            table: RwLock::new(Table::default()),
        };
        resource.reset();
        resource
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn base_path(&self) -> &str {
        &self.base_path
    }

    pub fn id_field(&self) -> &str {
        &self.id_field
    }

    pub fn len(&self) -> usize {
        self.table.read().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Restore the seed records.
    pub fn reset(&self) {
        let mut table = Table::default();
        for record in &self.seed {
            let id = self
                .record_id(record)
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
            let record = self.with_id(record.clone(), &id);
            table.remove(&id);
            table.insert(id, record);
        }
        *self.table.write() = table;
    }

    /// Current state as a declaration, for export.
    pub fn snapshot(&self) -> StatefulResourceConfig {
        StatefulResourceConfig {
            name: self.name.clone(),
            base_path: self.base_path.clone(),
            id_field: self.id_field.clone(),
            records: self.table.read().iter().cloned().collect(),
        }
    }

    /// The record ID addressed by `path`, if it lies under `basePath`.
    pub fn id_from_path(&self, path: &str) -> Option<String> {
        let rest = path.strip_prefix(&self.base_path)?.strip_prefix('/')?;
        let id = rest.split('/').next().unwrap_or_default();
        (!id.is_empty()).then(|| id.to_string())
    }

    fn record_id(&self, record: &Value) -> Option<String> {
        match record.get(&self.id_field)? {
            Value::String(id) if !id.is_empty() => Some(id.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }

    fn with_id(&self, mut record: Value, id: &str) -> Value {
        if let Value::Object(fields) = &mut record {
            if !fields.contains_key(&self.id_field) {
                fields.insert(self.id_field.clone(), Value::String(id.to_string()));
            }
        }
        record
    }

    fn object(payload: Option<Value>) -> Result<Map<String, Value>, StatefulError> {
        match payload {
            Some(Value::Object(fields)) => Ok(fields),
            Some(other) => Err(StatefulError::InvalidPayload(format!(
                "expected a JSON object, got {other}"
            ))),
            None => Err(StatefulError::InvalidPayload("a JSON body is required".into())),
        }
    }

    fn not_found(&self, id: &str) -> StatefulError {
        StatefulError::RecordNotFound {
            resource: self.name.clone(),
            id: id.to_string(),
        }
    }

    pub fn list(&self, offset: usize, limit: Option<usize>) -> StatefulOutcome {
        let table = self.table.read();
        let total = table.records.len();
        let items = table
            .iter()
            .skip(offset)
            .take(limit.unwrap_or(usize::MAX))
            .cloned()
            .collect();
        StatefulOutcome::List { items, total }
    }

    pub fn get(&self, id: &str) -> Result<Value, StatefulError> {
        self.table
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| self.not_found(id))
    }

    pub fn create(&self, payload: Option<Value>) -> Result<Value, StatefulError> {
        let record = Value::Object(Self::object(payload)?);
        let id = self
            .record_id(&record)
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let record = self.with_id(record, &id);

        let mut table = self.table.write();
        if table.records.contains_key(&id) {
            return Err(StatefulError::Conflict {
                resource: self.name.clone(),
                id,
            });
        }
        table.insert(id.clone(), record.clone());
        debug!(resource = %self.name, id = %id, "Created stateful record");
        Ok(record)
    }

    /// Merge the payload's fields into an existing record.
    pub fn update(&self, id: &str, payload: Option<Value>) -> Result<Value, StatefulError> {
        let mut fields = Self::object(payload)?;
        let mut table = self.table.write();
        let (_, record) = table
            .records
            .get_mut(id)
            .ok_or_else(|| self.not_found(id))?;
        if let Value::Object(existing) = record {
            // The stored id keeps its original JSON type.
            fields.remove(&self.id_field);
            existing.extend(fields);
            existing
                .entry(self.id_field.clone())
                .or_insert_with(|| Value::String(id.to_string()));
        }
        Ok(record.clone())
    }

    pub fn delete(&self, id: &str) -> Result<Value, StatefulError> {
        let removed = self.table.write().remove(id);
        removed.ok_or_else(|| self.not_found(id))
    }
}

/// Registry of every stateful resource plus the custom operation handlers.
#[derive(Default)]
pub struct StatefulStore {
    resources: RwLock<HashMap<String, Arc<StatefulResource>>>,
    handlers: RwLock<HashMap<String, Arc<dyn CustomOperationHandler>>>,
}

impl fmt::Debug for StatefulStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StatefulStore")
            .field("resources", &self.names())
            .field("handlers", &self.handlers.read().keys().collect::<Vec<_>>())
            .finish()
    }
}

impl StatefulStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) a resource, seeded with its declared records.
    pub fn register(&self, config: StatefulResourceConfig) -> Result<(), ValidationError> {
        config.validate()?;
        let name = config.name.clone();
        let resource = Arc::new(StatefulResource::new(config));
        info!(
            resource = %name,
            base_path = %resource.base_path(),
            records = resource.len(),
            "Registered stateful resource"
        );
        self.resources.write().insert(name, resource);
        Ok(())
    }

    pub fn remove(&self, name: &str) -> bool {
        self.resources.write().remove(name).is_some()
    }

    pub fn reset(&self, name: &str) -> Result<(), StatefulError> {
        self.resource(name)?.reset();
        Ok(())
    }

    pub fn clear(&self) {
        self.resources.write().clear();
    }

    pub fn get(&self, name: &str) -> Option<Arc<StatefulResource>> {
        self.resources.read().get(name).cloned()
    }

    fn resource(&self, name: &str) -> Result<Arc<StatefulResource>, StatefulError> {
        self.get(name)
            .ok_or_else(|| StatefulError::ResourceNotFound(name.to_string()))
    }

    /// Resource names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.resources.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Snapshots of every resource, sorted by name.
    pub fn snapshot(&self) -> Vec<StatefulResourceConfig> {
        let mut resources: Vec<_> = self.resources.read().values().cloned().collect();
        resources.sort_by(|a, b| a.name.cmp(&b.name));
        resources.iter().map(|r| r.snapshot()).collect()
    }

    pub fn register_handler(
        &self,
        operation: impl Into<String>,
        handler: Arc<dyn CustomOperationHandler>,
    ) {
        self.handlers.write().insert(operation.into(), handler);
    }

    /// Run `binding` against its resource.
    pub async fn dispatch(
        &self,
        binding: &StatefulBinding,
        request: StatefulRequest,
    ) -> Result<StatefulOutcome, StatefulError> {
        let resource = self.resource(&binding.resource)?;
        let action = match &binding.action {
            StatefulAction::Crud(action) => *action,
            StatefulAction::Custom(operation) => {
                let handler = self
                    .handlers
                    .read()
                    .get(operation)
                    .cloned()
                    .ok_or_else(|| StatefulError::CustomUnavailable(operation.clone()))?;
                let result = handler
                    .handle(resource.name(), operation, request.body)
                    .await
                    .map_err(|e| StatefulError::Custom {
                        operation: operation.clone(),
                        message: e.to_string(),
                    })?;
                return Ok(StatefulOutcome::Custom(result));
            }
        };

        let id = request
            .id
            .clone()
            .or_else(|| request.body.as_ref().and_then(|b| resource.record_id(b)));
        let id = || id.as_deref().ok_or(StatefulError::MissingId(action.as_str()));
        let outcome = match action {
            CrudAction::List => resource.list(request.offset, request.limit),
            CrudAction::Get => StatefulOutcome::Record(resource.get(id()?)?),
            CrudAction::Create => StatefulOutcome::Created(resource.create(request.body)?),
            CrudAction::Update => StatefulOutcome::Record(resource.update(id()?, request.body)?),
            CrudAction::Delete => StatefulOutcome::Deleted(resource.delete(id()?)?),
        };
        Ok(outcome)
    }
}
