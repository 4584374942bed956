//! Concurrency-safe mock registry.
//!
//! Mocks are held as `Arc<Mock>` entries behind a reader-writer lock. A
//! mutation swaps whole entries under the write lock, so a reader holding a
//! snapshot sees either the old or the new mock and never a mixture.

use crate::config::{Mock, MockSpec, MockType};
use crate::error::ValidationError;
use chrono::Utc;
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

/// The physical endpoint a mock occupies.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EndpointKey {
    Http { method: String, path: String },
    WebSocket(String),
    Graphql(String),
    Grpc(u16),
    Mqtt(u16),
    Soap(String),
    Oauth(String),
}

impl EndpointKey {
    pub fn of(mock: &Mock) -> Self {
        match &mock.spec {
            MockSpec::Http(spec) => EndpointKey::Http {
                method: spec.matcher.method.to_ascii_uppercase(),
                path: spec.matcher.path.as_str().to_string(),
            },
            MockSpec::WebSocket(spec) => EndpointKey::WebSocket(spec.path.clone()),
            MockSpec::Graphql(spec) => EndpointKey::Graphql(spec.path.clone()),
            MockSpec::Grpc(spec) => EndpointKey::Grpc(spec.port),
            MockSpec::Mqtt(spec) => EndpointKey::Mqtt(spec.port),
            MockSpec::Soap(spec) => EndpointKey::Soap(spec.path.clone()),
            MockSpec::Oauth(spec) => EndpointKey::Oauth(spec.issuer.trim_end_matches('/').to_string()),
        }
    }
}

/// Generate an ID of the form `{type}_{16 hex chars}`.
pub fn generate_id(kind: MockType) -> String {
    let hex = uuid::Uuid::new_v4().simple().to_string();
    format!("{}_{}", kind, &hex[..16])
}

#[derive(Debug, Default)]
struct Registry {
    /// Registration sequence to mock; iteration order is registration order
    entries: BTreeMap<u64, Arc<Mock>>,
    ids: HashMap<String, u64>,
    endpoints: HashMap<EndpointKey, BTreeSet<u64>>,
    next_seq: u64,
}

impl Registry {
    fn index(&mut self, seq: u64, mock: &Mock) {
        self.endpoints
            .entry(EndpointKey::of(mock))
            .or_default()
            .insert(seq);
    }

    fn unindex(&mut self, seq: u64, mock: &Mock) {
        let key = EndpointKey::of(mock);
        if let Some(set) = self.endpoints.get_mut(&key) {
            set.remove(&seq);
            if set.is_empty() {
                self.endpoints.remove(&key);
            }
        }
    }
}

/// Write access to the registry, held for the duration of one mutation.
pub struct StoreTxn<'a> {
    registry: &'a mut Registry,
}

impl StoreTxn<'_> {
    pub fn get(&self, id: &str) -> Option<Arc<Mock>> {
        let seq = self.registry.ids.get(id)?;
        self.registry.entries.get(seq).cloned()
    }

    /// Mocks occupying `key`, in registration order.
    pub fn at_endpoint(&self, key: &EndpointKey) -> Vec<Arc<Mock>> {
        self.registry
            .endpoints
            .get(key)
            .map(|seqs| {
                seqs.iter()
                    .filter_map(|seq| self.registry.entries.get(seq).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Register a new mock, assigning an ID and timestamps as needed.
    pub fn insert(&mut self, mut mock: Mock) -> Result<Arc<Mock>, ValidationError> {
        if mock.id.is_empty() {
            mock.id = generate_id(mock.kind());
        } else if self.registry.ids.contains_key(&mock.id) {
            return Err(ValidationError::Invalid(format!(
                "mock id {:?} is already registered",
                mock.id
            )));
        }
        let now = Utc::now();
        mock.created_at.get_or_insert(now);
        mock.updated_at = Some(now);

        let seq = self.registry.next_seq;
        self.registry.next_seq += 1;
        let mock = Arc::new(mock);
        self.registry.index(seq, &mock);
        self.registry.ids.insert(mock.id.clone(), seq);
        self.registry.entries.insert(seq, Arc::clone(&mock));
        Ok(mock)
    }

    /// Swap the definition of `id`, keeping its ID, creation time and
    /// registration slot.
    pub fn replace(&mut self, id: &str, mut mock: Mock) -> Option<Arc<Mock>> {
        let seq = *self.registry.ids.get(id)?;
        let previous = self.registry.entries.get(&seq).cloned()?;

        mock.id = previous.id.clone();
        mock.created_at = previous.created_at;
        mock.updated_at = Some(Utc::now());

        let mock = Arc::new(mock);
        self.registry.unindex(seq, &previous);
        self.registry.index(seq, &mock);
        self.registry.entries.insert(seq, Arc::clone(&mock));
        Some(mock)
    }

    pub fn remove(&mut self, id: &str) -> Option<Arc<Mock>> {
        let seq = self.registry.ids.remove(id)?;
        let mock = self.registry.entries.remove(&seq)?;
        self.registry.unindex(seq, &mock);
        Some(mock)
    }

    pub fn len(&self) -> usize {
        self.registry.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registry.entries.is_empty()
    }

    pub fn clear(&mut self) {
        *self.registry = Registry {
            next_seq: self.registry.next_seq,
            ..Registry::default()
        };
    }
}

/// Registry of all mocks.
#[derive(Debug, Default)]
pub struct MockStore {
    inner: RwLock<Registry>,
}

impl MockStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `f` with exclusive access. Everything it does is applied as one
    /// step from a reader's point of view.
    pub fn transact<R>(&self, f: impl FnOnce(&mut StoreTxn<'_>) -> R) -> R {
        let mut registry = self.inner.write();
        let mut txn = StoreTxn {
            registry: &mut *registry,
        };
        f(&mut txn)
    }

    pub fn insert(&self, mock: Mock) -> Result<Arc<Mock>, ValidationError> {
        self.transact(|txn| txn.insert(mock))
    }

    pub fn replace(&self, id: &str, mock: Mock) -> Option<Arc<Mock>> {
        self.transact(|txn| txn.replace(id, mock))
    }

    pub fn remove(&self, id: &str) -> Option<Arc<Mock>> {
        self.transact(|txn| txn.remove(id))
    }

    pub fn get(&self, id: &str) -> Option<Arc<Mock>> {
        let registry = self.inner.read();
        let seq = registry.ids.get(id)?;
        registry.entries.get(seq).cloned()
    }

    /// Snapshot of all mocks (optionally of one type) in registration order.
    pub fn list(&self, kind: Option<MockType>) -> Vec<Arc<Mock>> {
        self.inner
            .read()
            .entries
            .values()
            .filter(|mock| kind.map_or(true, |k| mock.kind() == k))
            .cloned()
            .collect()
    }

    /// Enabled mocks at `key`, in registration order.
    pub fn at_endpoint(&self, key: &EndpointKey) -> Vec<Arc<Mock>> {
        let registry = self.inner.read();
        registry
            .endpoints
            .get(key)
            .map(|seqs| {
                seqs.iter()
                    .filter_map(|seq| registry.entries.get(seq))
                    .filter(|mock| mock.enabled)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.inner.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.transact(|txn| txn.clear());
    }
}
