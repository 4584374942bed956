//! Upsert and merge rules applied when a new mock targets an endpoint that an
//! existing mock already occupies.
//!
//! HTTP replaces the enabled mock on the same method and path. gRPC (by
//! port), MQTT (by port) and SOAP (by path) compose: the new members are
//! folded into the existing mock through one generic [`compose`] step.

use crate::config::{Mock, MockSpec, MockType};
use crate::error::ValidationError;
use crate::protocol::grpc::ServiceConfig;
use crate::protocol::mqtt::TopicConfig;
use crate::protocol::{GrpcSpec, MqttSpec, SoapSpec};
use crate::store::{EndpointKey, StoreTxn};
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

/// What a create did to the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MergeAction {
    Created,
    Updated,
    Merged,
}

/// Members a merge introduced.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeDetails {
    /// The mock the definition was folded into
    pub target_id: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub added_services: Vec<String>,
    /// `service/method` pairs
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub added_methods: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub added_topics: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub added_operations: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CreateOptions {
    /// Register an HTTP mock even if another enabled one has the same
    /// method and path
    pub allow_duplicate: bool,
}

#[derive(Debug, Clone)]
pub struct CreateOutcome {
    pub mock: Arc<Mock>,
    pub action: MergeAction,
    pub details: Option<MergeDetails>,
}

/// A keyed collection of members that can absorb another one of its kind.
pub trait MemberSet {
    fn member_keys(&self) -> Vec<String>;

    /// Add `incoming`'s members, replacing those with the same key.
    fn absorb(&mut self, incoming: Self);
}

impl<V> MemberSet for BTreeMap<String, V> {
    fn member_keys(&self) -> Vec<String> {
        self.keys().cloned().collect()
    }

    fn absorb(&mut self, incoming: Self) {
        self.extend(incoming);
    }
}

impl MemberSet for Vec<TopicConfig> {
    fn member_keys(&self) -> Vec<String> {
        self.iter().map(|t| t.topic.clone()).collect()
    }

    fn absorb(&mut self, incoming: Self) {
        for topic in incoming {
            match self.iter_mut().find(|t| t.topic == topic.topic) {
                Some(slot) => *slot = topic,
                None => self.push(topic),
            }
        }
    }
}

/// Fold `incoming` into `existing`, returning the keys that were new.
pub fn compose<M: MemberSet>(existing: &mut M, incoming: M) -> Vec<String> {
    let mut seen: HashSet<String> = existing.member_keys().into_iter().collect();
    let added: Vec<String> = incoming
        .member_keys()
        .into_iter()
        .filter(|key| seen.insert(key.clone()))
        .collect();
    existing.absorb(incoming);
    added
}

/// A protocol payload that merges into the payload owning its endpoint.
trait Composable {
    fn compose_into(&mut self, incoming: Self, details: &mut MergeDetails);
}

impl Composable for GrpcSpec {
    fn compose_into(&mut self, incoming: Self, details: &mut MergeDetails) {
        let mut new_services = BTreeMap::new();
        for (service, config) in incoming.services {
            match self.services.get_mut(&service) {
                Some(existing) => {
                    let added = compose(&mut existing.methods, config.methods);
                    details
                        .added_methods
                        .extend(added.into_iter().map(|m| format!("{service}/{m}")));
                }
                None => {
                    details.added_methods.extend(
                        config
                            .methods
                            .keys()
                            .map(|m| format!("{service}/{m}")),
                    );
                    new_services.insert(service, config);
                }
            }
        }
        details
            .added_services
            .extend(compose::<BTreeMap<String, ServiceConfig>>(&mut self.services, new_services));

        for file in incoming.proto_files {
            if !self.proto_files.contains(&file) {
                self.proto_files.push(file);
            }
        }
        for path in incoming.import_paths {
            if !self.import_paths.contains(&path) {
                self.import_paths.push(path);
            }
        }
        self.reflection |= incoming.reflection;
    }
}

impl Composable for MqttSpec {
    fn compose_into(&mut self, incoming: Self, details: &mut MergeDetails) {
        details.added_topics = compose(&mut self.topics, incoming.topics);
    }
}

impl Composable for SoapSpec {
    fn compose_into(&mut self, incoming: Self, details: &mut MergeDetails) {
        details.added_operations = compose(&mut self.operations, incoming.operations);
        if incoming.wsdl.is_some() {
            self.wsdl = incoming.wsdl;
        }
    }
}

/// Fold `incoming` into a copy of `existing`. `None` when the two payloads
/// are not composable.
fn merge_spec(existing: &Mock, incoming: MockSpec) -> Option<(Mock, MergeDetails)> {
    let mut merged = existing.clone();
    let mut details = MergeDetails {
        target_id: existing.id.clone(),
        ..MergeDetails::default()
    };
    match (&mut merged.spec, incoming) {
        (MockSpec::Grpc(current), MockSpec::Grpc(new)) => current.compose_into(new, &mut details),
        (MockSpec::Mqtt(current), MockSpec::Mqtt(new)) => current.compose_into(new, &mut details),
        (MockSpec::Soap(current), MockSpec::Soap(new)) => current.compose_into(new, &mut details),
        _ => return None,
    }
    Some((merged, details))
}

/// Apply the create rules inside a store transaction.
pub fn upsert(
    txn: &mut StoreTxn<'_>,
    mock: Mock,
    options: CreateOptions,
) -> Result<CreateOutcome, ValidationError> {
    mock.validate()?;
    let key = EndpointKey::of(&mock);
    let occupants = txn.at_endpoint(&key);

    match mock.kind() {
        MockType::Http if !options.allow_duplicate => {
            if let Some(existing) = occupants.iter().find(|m| m.enabled) {
                let id = existing.id.clone();
                let mut mock = mock;
                if mock.name.is_none() {
                    mock.name = existing.name.clone();
                }
                if let Some(updated) = txn.replace(&id, mock.clone()) {
                    return Ok(CreateOutcome {
                        mock: updated,
                        action: MergeAction::Updated,
                        details: None,
                    });
                }
                return insert(txn, mock);
            }
        }
        MockType::Grpc | MockType::Mqtt | MockType::Soap => {
            if let Some(existing) = occupants.first() {
                let (merged, details) = merge_spec(existing, mock.spec.clone()).ok_or_else(|| {
                    ValidationError::Invalid(format!(
                        "cannot merge a {} mock into {}",
                        mock.kind(),
                        existing.id
                    ))
                })?;
                merged.validate()?;
                if let Some(updated) = txn.replace(&existing.id, merged) {
                    return Ok(CreateOutcome {
                        mock: updated,
                        action: MergeAction::Merged,
                        details: Some(details),
                    });
                }
            }
        }
        _ => {}
    }

    insert(txn, mock)
}

fn insert(txn: &mut StoreTxn<'_>, mock: Mock) -> Result<CreateOutcome, ValidationError> {
    Ok(CreateOutcome {
        mock: txn.insert(mock)?,
        action: MergeAction::Created,
        details: None,
    })
}
