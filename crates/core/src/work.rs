//! Hub `ManifestWork` and spoke `AppliedManifestWork` shapes.
//!
//! Only the fields the agent reads or writes are modelled; the JSON layout
//! follows `work.open-cluster-management.io/v1` so objects round-trip
//! through a dynamic client.

use serde::{Deserialize, Serialize};

use crate::{AppliedResourceMeta, Condition, GroupVersionResource, ManifestCondition, ManifestWorkExecutor, ResourceIdentifier};

pub const WORK_GROUP: &str = "work.open-cluster-management.io";
pub const WORK_VERSION: &str = "v1";

/// Finalizer the agent keeps on a ManifestWork until its resources are gone.
pub const MANIFEST_WORK_FINALIZER: &str = "cluster.open-cluster-management.io/manifest-work-cleanup";

pub const WORK_APPLIED: &str = "Applied";
pub const WORK_AVAILABLE: &str = "Available";

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct WorkMeta {
    pub name: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub namespace: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub uid: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generation: Option<i64>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub finalizers: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deletion_timestamp: Option<chrono::DateTime<chrono::Utc>>,
}

/// Objects carrying a status the agent persists with optimistic concurrency.
pub trait Versioned: Clone + Send + Sync + 'static {
    type Status: Clone + PartialEq + Send + Sync + 'static;

    fn gvr() -> GroupVersionResource;
    fn meta(&self) -> &WorkMeta;
    fn meta_mut(&mut self) -> &mut WorkMeta;
    fn status(&self) -> &Self::Status;
    fn status_mut(&mut self) -> &mut Self::Status;
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum PropagationPolicy {
    #[default]
    Foreground,
    Orphan,
    SelectivelyOrphan,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct SelectivelyOrphan {
    pub orphaning_rules: Vec<ResourceIdentifier>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct DeleteOption {
    pub propagation_policy: PropagationPolicy,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub selectively_orphans: Option<SelectivelyOrphan>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Workload {
    pub manifests: Vec<serde_json::Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct ManifestWorkSpec {
    pub workload: Workload,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub executor: Option<ManifestWorkExecutor>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delete_option: Option<DeleteOption>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ManifestResourceStatus {
    pub manifests: Vec<ManifestCondition>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct ManifestWorkStatus {
    pub conditions: Vec<Condition>,
    pub resource_status: ManifestResourceStatus,
}

/// Desired work for this cluster, as stored on the hub.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct ManifestWork {
    pub api_version: String,
    pub kind: String,
    pub metadata: WorkMeta,
    pub spec: ManifestWorkSpec,
    pub status: ManifestWorkStatus,
}

impl ManifestWork {
    pub fn new(namespace: &str, name: &str, manifests: Vec<serde_json::Value>) -> Self {
        Self {
            api_version: format!("{}/{}", WORK_GROUP, WORK_VERSION),
            kind: "ManifestWork".into(),
            metadata: WorkMeta { name: name.into(), namespace: namespace.into(), ..Default::default() },
            spec: ManifestWorkSpec { workload: Workload { manifests }, ..Default::default() },
            status: ManifestWorkStatus::default(),
        }
    }

    pub fn is_terminating(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }
}

impl Versioned for ManifestWork {
    type Status = ManifestWorkStatus;

    fn gvr() -> GroupVersionResource {
        GroupVersionResource::new(WORK_GROUP, WORK_VERSION, "manifestworks")
    }
    fn meta(&self) -> &WorkMeta {
        &self.metadata
    }
    fn meta_mut(&mut self) -> &mut WorkMeta {
        &mut self.metadata
    }
    fn status(&self) -> &ManifestWorkStatus {
        &self.status
    }
    fn status_mut(&mut self) -> &mut ManifestWorkStatus {
        &mut self.status
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct AppliedManifestWorkSpec {
    pub hub_hash: String,
    pub manifest_work_name: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct AppliedManifestWorkStatus {
    pub applied_resources: Vec<AppliedResourceMeta>,
}

/// Spoke-side owner-tracking record; its UID is the owner reference placed
/// on every applied resource.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct AppliedManifestWork {
    pub api_version: String,
    pub kind: String,
    pub metadata: WorkMeta,
    pub spec: AppliedManifestWorkSpec,
    pub status: AppliedManifestWorkStatus,
}

impl AppliedManifestWork {
    pub fn new(hub_hash: &str, work_name: &str) -> Self {
        Self {
            api_version: format!("{}/{}", WORK_GROUP, WORK_VERSION),
            kind: "AppliedManifestWork".into(),
            metadata: WorkMeta { name: crate::applied_work_name(hub_hash, work_name), ..Default::default() },
            spec: AppliedManifestWorkSpec { hub_hash: hub_hash.into(), manifest_work_name: work_name.into() },
            status: AppliedManifestWorkStatus::default(),
        }
    }
}

impl Versioned for AppliedManifestWork {
    type Status = AppliedManifestWorkStatus;

    fn gvr() -> GroupVersionResource {
        GroupVersionResource::new(WORK_GROUP, WORK_VERSION, "appliedmanifestworks")
    }
    fn meta(&self) -> &WorkMeta {
        &self.metadata
    }
    fn meta_mut(&mut self) -> &mut WorkMeta {
        &mut self.metadata
    }
    fn status(&self) -> &AppliedManifestWorkStatus {
        &self.status
    }
    fn status_mut(&mut self) -> &mut AppliedManifestWorkStatus {
        &mut self.status
    }
}
