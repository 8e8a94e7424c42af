//! Spoke core types: resource identities, manifest conditions, executors.
//!
//! Everything in this crate is pure data plus pure functions; I/O lives in
//! `spoke-kubehub` and the crates built on top of it.

#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use smallvec::SmallVec;

pub mod conditions;
pub mod error;
pub mod work;

pub use conditions::{merge_manifest_conditions, merge_manifest_conditions_at, merge_status_conditions, set_condition};
pub use error::{ClientError, WorkError};

pub mod prelude {
    pub use super::{
        AppliedResourceMeta, Condition, ConditionStatus, ExecutorIdentity, GroupVersionResource, ManifestCondition,
        ManifestResourceMeta, ManifestWorkExecutor, ResourceIdentifier, ResourceIdentity,
    };
    pub use super::error::{ClientError, WorkError};
    pub use super::work::{AppliedManifestWork, ManifestWork};
}

/// Group/version/plural-resource triple addressing a REST collection.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GroupVersionResource {
    pub group: String,
    pub version: String,
    pub resource: String,
}

impl GroupVersionResource {
    pub fn new(group: &str, version: &str, resource: &str) -> Self {
        Self { group: group.to_string(), version: version.to_string(), resource: resource.to_string() }
    }
}

impl std::fmt::Display for GroupVersionResource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.group.is_empty() {
            write!(f, "{}.{}", self.version, self.resource)
        } else {
            write!(f, "{}/{}.{}", self.group, self.version, self.resource)
        }
    }
}

/// Ordinal-free identity of a manifest on the spoke. Used as a lookup key.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase", default)]
pub struct ResourceIdentity {
    pub group: String,
    pub version: String,
    pub kind: String,
    pub resource: String,
    pub namespace: String,
    pub name: String,
}

impl ResourceIdentity {
    pub fn is_empty(&self) -> bool {
        *self == ResourceIdentity::default()
    }

    pub fn gvr(&self) -> GroupVersionResource {
        GroupVersionResource::new(&self.group, &self.version, &self.resource)
    }

    pub fn identifier(&self) -> ResourceIdentifier {
        ResourceIdentifier {
            group: self.group.clone(),
            resource: self.resource.clone(),
            namespace: self.namespace.clone(),
            name: self.name.clone(),
        }
    }
}

/// Exact identity of a manifest: its identity plus its position in the
/// desired manifest list. The ordinal is positional and may change between
/// passes without the resource changing.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub struct ManifestResourceMeta {
    pub ordinal: i32,
    #[serde(flatten)]
    pub identity: ResourceIdentity,
}

/// Version-free address of a resource, as used by orphaning rules and the
/// stale-resource diff.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase", default)]
pub struct ResourceIdentifier {
    pub group: String,
    pub resource: String,
    pub namespace: String,
    pub name: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
pub enum ConditionStatus {
    True,
    False,
    #[default]
    Unknown,
}

impl ConditionStatus {
    pub fn from_bool(v: bool) -> Self {
        if v { ConditionStatus::True } else { ConditionStatus::False }
    }
}

/// A named status condition. `last_transition_time` only moves when
/// `status` flips relative to the previously recorded value.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: String,
    pub status: ConditionStatus,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<chrono::DateTime<chrono::Utc>>,
}

impl Condition {
    pub fn new(type_: &str, status: ConditionStatus, reason: &str, message: impl Into<String>) -> Self {
        Self { type_: type_.to_string(), status, reason: reason.to_string(), message: message.into(), last_transition_time: None }
    }

    pub fn is_true(&self) -> bool {
        self.status == ConditionStatus::True
    }
}

pub fn find_condition<'a>(conditions: &'a [Condition], type_: &str) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.type_ == type_)
}

pub fn is_condition_true(conditions: &[Condition], type_: &str) -> bool {
    find_condition(conditions, type_).map(Condition::is_true).unwrap_or(false)
}

/// One opaque status-feedback value. Never interpreted here.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FeedbackValue {
    pub name: String,
    #[serde(rename = "fieldValue")]
    pub value: serde_json::Value,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct StatusFeedbackResult {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub values: Vec<FeedbackValue>,
}

/// Per-manifest status record, recomputed every reconciliation pass.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ManifestCondition {
    pub resource_meta: ManifestResourceMeta,
    #[serde(default)]
    pub status_feedbacks: StatusFeedbackResult,
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

/// A resource the agent created or adopted on the spoke.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase", default)]
pub struct AppliedResourceMeta {
    pub group: String,
    pub version: String,
    pub resource: String,
    pub namespace: String,
    pub name: String,
    /// UID recorded when the resource was first applied.
    pub uid: String,
}

impl AppliedResourceMeta {
    pub fn gvr(&self) -> GroupVersionResource {
        GroupVersionResource::new(&self.group, &self.version, &self.resource)
    }

    pub fn identifier(&self) -> ResourceIdentifier {
        ResourceIdentifier {
            group: self.group.clone(),
            resource: self.resource.clone(),
            namespace: self.namespace.clone(),
            name: self.name.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum SubjectKind {
    ServiceAccount,
    #[serde(other)]
    Unsupported,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServiceAccountRef {
    pub namespace: String,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ExecutorSubject {
    #[serde(rename = "type")]
    pub kind: SubjectKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_account: Option<ServiceAccountRef>,
}

/// Identity the agent acts as when checking permissions on the spoke.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ManifestWorkExecutor {
    pub subject: ExecutorSubject,
}

/// Username and groups the API server derives for a service account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutorIdentity {
    pub user: String,
    pub groups: SmallVec<[String; 3]>,
}

impl ManifestWorkExecutor {
    pub fn service_account(namespace: &str, name: &str) -> Self {
        Self {
            subject: ExecutorSubject {
                kind: SubjectKind::ServiceAccount,
                service_account: Some(ServiceAccountRef { namespace: namespace.to_string(), name: name.to_string() }),
            },
        }
    }

    /// Resolve the executor to an API-server identity. Unsupported subject
    /// kinds and a missing service account are configuration errors.
    pub fn identity(&self) -> Result<ExecutorIdentity, WorkError> {
        if self.subject.kind != SubjectKind::ServiceAccount {
            return Err(WorkError::InvalidExecutor("only support ServiceAccount type for the executor".into()));
        }
        let sa = self
            .subject
            .service_account
            .as_ref()
            .ok_or_else(|| WorkError::InvalidExecutor("the executor service account is nil".into()))?;
        Ok(ExecutorIdentity {
            user: format!("system:serviceaccount:{}:{}", sa.namespace, sa.name),
            groups: SmallVec::from_vec(vec![
                "system:serviceaccounts".to_string(),
                "system:authenticated".to_string(),
                format!("system:serviceaccounts:{}", sa.namespace),
            ]),
        })
    }
}

/// Hex SHA-256 of the hub API server URL. Prefixes applied-work names so
/// several hubs can share one spoke.
pub fn hub_hash(hub_server: &str) -> String {
    hex::encode(Sha256::digest(hub_server.as_bytes()))
}

pub fn applied_work_name(hub_hash: &str, work_name: &str) -> String {
    format!("{}-{}", hub_hash, work_name)
}

/// Inverse of [`applied_work_name`]; `None` when the name belongs to another hub.
pub fn work_name_from_applied<'a>(hub_hash: &str, applied_name: &'a str) -> Option<&'a str> {
    applied_name.strip_prefix(hub_hash)?.strip_prefix('-')
}

/// Remove every occurrence of `name`; returns whether anything was removed.
pub fn remove_finalizer(finalizers: &mut Vec<String>, name: &str) -> bool {
    let before = finalizers.len();
    finalizers.retain(|f| f != name);
    finalizers.len() != before
}
