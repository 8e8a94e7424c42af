//! Spoke apply – manifests onto the spoke, gated by the executor check, and
//! garbage collection of what is no longer desired.

#![forbid(unsafe_code)]

use std::{sync::Arc, time::Duration};

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::core::DynamicObject;
use metrics::counter;
use rustc_hash::FxHashSet;
use serde_json::Value as Json;
use spoke_auth::{ExecuteAction, ExecutorValidator};
use spoke_core::{
    work::{ManifestWork, WORK_APPLIED, WORK_AVAILABLE},
    AppliedResourceMeta, ClientError, Condition, ConditionStatus, GroupVersionResource, ManifestCondition,
    ManifestResourceMeta, ManifestWorkExecutor, ResourceIdentifier, ResourceIdentity, StatusFeedbackResult, WorkError,
};
use spoke_kubehub::{ObjectClient, RestMapping};
use tracing::{debug, warn};

pub mod gc;
pub mod owner;

pub use gc::{resolve_delete_option, AppliedResourceReconciler, GcOutcome};
pub use owner::{applied_work_owner, apply_owner_references, is_owned_by, merge_owner_refs, removal_owner};

pub const MANIFEST_APPLIED: &str = "Applied";
pub const MANIFEST_AVAILABLE: &str = "Available";

fn max_manifest_nodes() -> usize {
    std::env::var("SPOKE_MAX_MANIFEST_NODES")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(100_000)
}

fn json_node_budget_exceeded(v: &Json, max: usize) -> bool {
    fn walk(v: &Json, cur: &mut usize, max: usize) {
        if *cur > max {
            return;
        }
        *cur += 1;
        match v {
            Json::Array(items) => items.iter().for_each(|i| walk(i, cur, max)),
            Json::Object(fields) => fields.values().for_each(|i| walk(i, cur, max)),
            _ => {}
        }
    }
    let mut cur = 0usize;
    walk(v, &mut cur, max);
    cur > max
}

/// Outcome of applying every manifest of a work once.
#[derive(Debug, Default)]
pub struct ApplyResult {
    /// One record per manifest, in manifest order.
    pub conditions: Vec<ManifestCondition>,
    /// Resources created or updated in this pass.
    pub applied: Vec<AppliedResourceMeta>,
    /// Every resource the manifests address, applied or not.
    pub desired: Vec<ResourceIdentifier>,
    pub errors: Vec<WorkError>,
    /// Shortest re-check delay among denied manifests.
    pub requeue_after: Option<Duration>,
}

/// A decoded manifest and the resource it addresses.
#[derive(Debug, Clone)]
pub struct ResolvedManifest {
    pub gvr: GroupVersionResource,
    pub identity: ResourceIdentity,
    pub obj: DynamicObject,
}

/// Decode `raw` and map it onto a served resource. Namespaced manifests
/// without a namespace land in `default`.
pub fn resolve_manifest(mapper: &dyn RestMapping, raw: &Json) -> Result<ResolvedManifest, WorkError> {
    let max = max_manifest_nodes();
    if json_node_budget_exceeded(raw, max) {
        return Err(WorkError::Manifest(format!("manifest too complex (>{} nodes)", max)));
    }
    let obj: DynamicObject = serde_json::from_value(raw.clone()).map_err(|e| WorkError::Manifest(e.to_string()))?;
    let gvk = mapper
        .kind_of(&obj)
        .ok_or_else(|| WorkError::Manifest("manifest missing apiVersion or kind".into()))?;
    let mapping = mapper
        .mapping_for(&gvk)
        .ok_or_else(|| WorkError::Manifest(format!("no resource mapping for {}/{}/{}", gvk.group, gvk.version, gvk.kind)))?;
    let name = obj
        .metadata
        .name
        .clone()
        .filter(|n| !n.is_empty())
        .ok_or_else(|| WorkError::Manifest(format!("{} manifest missing metadata.name", gvk.kind)))?;
    let namespace = match (mapping.namespaced, obj.metadata.namespace.as_deref()) {
        (false, _) => String::new(),
        (true, Some(ns)) if !ns.is_empty() => ns.to_string(),
        (true, _) => "default".to_string(),
    };
    Ok(ResolvedManifest {
        identity: ResourceIdentity {
            group: gvk.group,
            version: gvk.version,
            kind: gvk.kind,
            resource: mapping.gvr.resource.clone(),
            namespace,
            name,
        },
        gvr: mapping.gvr,
        obj,
    })
}

pub struct ManifestApplier {
    client: Arc<dyn ObjectClient>,
    mapper: Arc<dyn RestMapping>,
    validator: Arc<dyn ExecutorValidator>,
}

impl ManifestApplier {
    pub fn new(client: Arc<dyn ObjectClient>, mapper: Arc<dyn RestMapping>, validator: Arc<dyn ExecutorValidator>) -> Self {
        Self { client, mapper, validator }
    }

    pub async fn apply(&self, work: &ManifestWork, owner: &OwnerReference) -> ApplyResult {
        let mut out = ApplyResult::default();
        let executor = work.spec.executor.as_ref();

        for (ordinal, raw) in work.spec.workload.manifests.iter().enumerate() {
            let ordinal = ordinal as i32;
            let target = match resolve_manifest(self.mapper.as_ref(), raw) {
                Ok(t) => t,
                Err(e) => {
                    warn!(work = %work.metadata.name, ordinal, error = %e, "invalid manifest");
                    out.conditions.push(manifest_condition(
                        ManifestResourceMeta { ordinal, identity: ResourceIdentity::default() },
                        Err(&e),
                        ConditionStatus::Unknown,
                    ));
                    out.errors.push(e);
                    continue;
                }
            };
            out.desired.push(target.identity.identifier());

            let applied = self.apply_one(&target, executor, owner).await;
            match &applied {
                Ok(live) => {
                    counter!("apply_ok", 1u64);
                    out.applied.push(AppliedResourceMeta {
                        group: target.gvr.group.clone(),
                        version: target.gvr.version.clone(),
                        resource: target.gvr.resource.clone(),
                        namespace: target.identity.namespace.clone(),
                        name: target.identity.name.clone(),
                        uid: live.metadata.uid.clone().unwrap_or_default(),
                    });
                }
                Err(e) => {
                    counter!("apply_err", 1u64);
                    warn!(gvr = %target.gvr, ns = %target.identity.namespace, name = %target.identity.name, error = %e, "apply failed");
                    match e.requeue_after() {
                        Some(d) => out.requeue_after = Some(out.requeue_after.map_or(d, |cur| cur.min(d))),
                        None => out.errors.push(e.clone()),
                    }
                }
            }

            let available = self.availability(&target).await;
            out.conditions.push(manifest_condition(
                ManifestResourceMeta { ordinal, identity: target.identity.clone() },
                applied.as_ref().map(|_| ()),
                available,
            ));
        }
        out
    }

    async fn apply_one(
        &self,
        target: &ResolvedManifest,
        executor: Option<&ManifestWorkExecutor>,
        owner: &OwnerReference,
    ) -> Result<DynamicObject, WorkError> {
        let (gvr, ns, name) = (&target.gvr, target.identity.namespace.as_str(), target.identity.name.as_str());
        let mut desired = target.obj.clone();
        if !ns.is_empty() {
            desired.metadata.namespace = Some(ns.to_string());
        }

        self.validator
            .validate(executor, gvr, ns, name, Some(&desired), ExecuteAction::Apply)
            .await?;

        let existing = match self.client.get(gvr, ns, name).await {
            Ok(obj) => Some(obj),
            Err(e) if e.is_not_found() => None,
            Err(e) => return Err(e.into()),
        };

        match existing {
            None => {
                let mut owners = desired.metadata.owner_references.take().unwrap_or_default();
                merge_owner_refs(&mut owners, std::slice::from_ref(owner));
                desired.metadata.owner_references = Some(owners);
                debug!(gvr = %gvr, ns, name, "creating resource");
                Ok(self.client.create(gvr, ns, &desired, false).await?)
            }
            Some(live) => {
                let mut owners = live.metadata.owner_references.clone().unwrap_or_default();
                merge_owner_refs(&mut owners, desired.metadata.owner_references.as_deref().unwrap_or_default());
                merge_owner_refs(&mut owners, std::slice::from_ref(owner));
                desired.metadata.owner_references = Some(owners);
                desired.metadata.resource_version = live.metadata.resource_version.clone();
                desired.metadata.uid = live.metadata.uid.clone();
                debug!(gvr = %gvr, ns, name, "updating resource");
                Ok(self.client.update(gvr, ns, &desired).await?)
            }
        }
    }

    async fn availability(&self, target: &ResolvedManifest) -> ConditionStatus {
        match self.client.get(&target.gvr, &target.identity.namespace, &target.identity.name).await {
            Ok(_) => ConditionStatus::True,
            Err(ClientError::NotFound(_)) => ConditionStatus::False,
            Err(_) => ConditionStatus::Unknown,
        }
    }
}

fn manifest_condition(meta: ManifestResourceMeta, applied: Result<(), &WorkError>, available: ConditionStatus) -> ManifestCondition {
    let applied = match applied {
        Ok(()) => Condition::new(MANIFEST_APPLIED, ConditionStatus::True, "AppliedManifestComplete", "Apply manifest complete"),
        Err(e) => Condition::new(MANIFEST_APPLIED, ConditionStatus::False, "AppliedManifestFailed", e.to_string()),
    };
    let available = match available {
        ConditionStatus::True => Condition::new(MANIFEST_AVAILABLE, ConditionStatus::True, "ResourceAvailable", "Resource is available"),
        ConditionStatus::False => {
            Condition::new(MANIFEST_AVAILABLE, ConditionStatus::False, "ResourceNotAvailable", "Resource is not available")
        }
        ConditionStatus::Unknown => {
            Condition::new(MANIFEST_AVAILABLE, ConditionStatus::Unknown, "ResourceNotAvailable", "Resource availability is unknown")
        }
    };
    ManifestCondition { resource_meta: meta, status_feedbacks: StatusFeedbackResult::default(), conditions: vec![applied, available] }
}

fn aggregate(manifests: &[ManifestCondition], type_: &str, work_type: &str, ok: (&str, &str), failed: (&str, &str)) -> Condition {
    let all = !manifests.is_empty() && manifests.iter().all(|m| spoke_core::is_condition_true(&m.conditions, type_));
    if all {
        Condition::new(work_type, ConditionStatus::True, ok.0, ok.1)
    } else {
        Condition::new(work_type, ConditionStatus::False, failed.0, failed.1)
    }
}

/// Work-level `Applied` and `Available`: True iff every manifest's condition
/// is True and there is at least one manifest.
pub fn aggregate_conditions(manifests: &[ManifestCondition]) -> [Condition; 2] {
    [
        aggregate(
            manifests,
            MANIFEST_APPLIED,
            WORK_APPLIED,
            ("AppliedManifestWorkComplete", "Apply manifest work complete"),
            ("AppliedManifestWorkFailed", "Failed to apply manifest work"),
        ),
        aggregate(
            manifests,
            MANIFEST_AVAILABLE,
            WORK_AVAILABLE,
            ("ResourcesAvailable", "All resources are available"),
            ("ResourcesNotAvailable", "One or more resources are not available"),
        ),
    ]
}

/// Previously applied resources whose identifier is no longer desired.
pub fn stale_resources(previous: &[AppliedResourceMeta], desired: &[ResourceIdentifier]) -> Vec<AppliedResourceMeta> {
    let desired: FxHashSet<&ResourceIdentifier> = desired.iter().collect();
    previous.iter().filter(|r| !desired.contains(&r.identifier())).cloned().collect()
}

/// Applied-resource list to persist: this pass's applies, earlier entries
/// still desired but not re-applied, and stale resources garbage collection
/// has not finished with (see [`GcOutcome::retained`]).
pub fn next_applied_resources(
    previous: &[AppliedResourceMeta],
    applied: &[AppliedResourceMeta],
    desired: &[ResourceIdentifier],
    retained: &[AppliedResourceMeta],
) -> Vec<AppliedResourceMeta> {
    let desired: FxHashSet<&ResourceIdentifier> = desired.iter().collect();
    let mut seen: FxHashSet<ResourceIdentifier> = applied.iter().map(AppliedResourceMeta::identifier).collect();
    let mut out: Vec<AppliedResourceMeta> = applied.to_vec();
    for r in previous.iter().filter(|r| desired.contains(&r.identifier())) {
        if seen.insert(r.identifier()) {
            out.push(r.clone());
        }
    }
    for r in retained {
        if seen.insert(r.identifier()) {
            out.push(r.clone());
        }
    }
    out.sort_by(|a, b| {
        (a.group.as_str(), a.resource.as_str(), a.namespace.as_str(), a.name.as_str())
            .cmp(&(b.group.as_str(), b.resource.as_str(), b.namespace.as_str(), b.name.as_str()))
    });
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(name: &str, uid: &str) -> AppliedResourceMeta {
        AppliedResourceMeta {
            version: "v1".into(),
            resource: "configmaps".into(),
            namespace: "ns1".into(),
            name: name.into(),
            uid: uid.into(),
            ..Default::default()
        }
    }

    fn mc(applied: bool, available: bool) -> ManifestCondition {
        ManifestCondition {
            conditions: vec![
                Condition::new(MANIFEST_APPLIED, ConditionStatus::from_bool(applied), "", ""),
                Condition::new(MANIFEST_AVAILABLE, ConditionStatus::from_bool(available), "", ""),
            ],
            ..Default::default()
        }
    }

    #[test]
    fn aggregate_requires_every_manifest() {
        let [applied, available] = aggregate_conditions(&[mc(true, true), mc(true, false)]);
        assert!(applied.is_true());
        assert_eq!(applied.reason, "AppliedManifestWorkComplete");
        assert!(!available.is_true());
        assert_eq!(available.reason, "ResourcesNotAvailable");

        let [applied, _] = aggregate_conditions(&[]);
        assert!(!applied.is_true());
    }

    #[test]
    fn stale_resources_ignore_version_and_uid() {
        let previous = vec![meta("a", "1"), meta("b", "2")];
        let desired = vec![meta("a", "other").identifier()];
        assert_eq!(stale_resources(&previous, &desired), vec![meta("b", "2")]);
    }

    #[test]
    fn next_applied_prefers_fresh_entries() {
        let previous = vec![meta("a", "old"), meta("b", "2"), meta("gone", "3")];
        let applied = vec![meta("a", "new")];
        let desired = vec![meta("a", "").identifier(), meta("b", "").identifier()];
        let pending = vec![meta("gone", "3")];
        let next = next_applied_resources(&previous, &applied, &desired, &pending);
        assert_eq!(next, vec![meta("a", "new"), meta("b", "2"), meta("gone", "3")]);
    }

    #[test]
    fn node_budget_counts_nested_values() {
        let small = serde_json::json!({"a": [1, 2, {"b": 3}]});
        assert!(!json_node_budget_exceeded(&small, 100));
        assert!(json_node_budget_exceeded(&small, 3));
    }

    #[test]
    fn node_budget_admits_exactly_max_nodes() {
        // root, array, 1, 2, inner object, 3
        let six = serde_json::json!({"a": [1, 2, {"b": 3}]});
        assert!(!json_node_budget_exceeded(&six, 6));
        assert!(json_node_budget_exceeded(&six, 5));
    }
}
