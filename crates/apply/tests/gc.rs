use std::sync::Arc;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use serde_json::json;
use spoke_apply::{AppliedResourceReconciler, GcOutcome};
use spoke_auth::SarValidator;
use spoke_core::{AppliedResourceMeta, ClientError, GroupVersionResource, ManifestWorkExecutor};
use spoke_kubehub::{
    fake::{rule, FakeCluster, Verb},
    Propagation,
};

const OWNER_UID: &str = "applied-uid";

fn owner() -> OwnerReference {
    OwnerReference {
        api_version: "work.open-cluster-management.io/v1".into(),
        kind: "AppliedManifestWork".into(),
        name: "hash-work".into(),
        uid: OWNER_UID.into(),
        ..Default::default()
    }
}

fn other_owner() -> OwnerReference {
    OwnerReference {
        api_version: "apps/v1".into(),
        kind: "Deployment".into(),
        name: "web".into(),
        uid: "deploy-uid".into(),
        ..Default::default()
    }
}

fn cm_gvr() -> GroupVersionResource {
    GroupVersionResource::new("", "v1", "configmaps")
}

fn seed_cm(c: &FakeCluster, name: &str, uid: &str, owners: Vec<OwnerReference>, extra_meta: serde_json::Value) {
    let mut obj = json!({
        "apiVersion": "v1", "kind": "ConfigMap",
        "metadata": {"name": name, "namespace": "ns1", "uid": uid, "ownerReferences": owners},
    });
    if let (Some(meta), Some(extra)) = (obj["metadata"].as_object_mut(), extra_meta.as_object()) {
        meta.extend(extra.clone());
    }
    c.seed(&cm_gvr(), &obj).unwrap();
}

fn tracked(name: &str, uid: &str) -> AppliedResourceMeta {
    AppliedResourceMeta {
        version: "v1".into(),
        resource: "configmaps".into(),
        namespace: "ns1".into(),
        name: name.into(),
        uid: uid.into(),
        ..Default::default()
    }
}

fn reconciler(c: &Arc<FakeCluster>) -> AppliedResourceReconciler {
    let validator = SarValidator::new(c.clone(), Arc::new(c.impersonation()));
    AppliedResourceReconciler::new(c.clone(), Arc::new(validator), c.clone())
}

#[tokio::test]
async fn sole_owner_resource_is_deleted_with_uid_precondition() {
    let c = FakeCluster::new();
    seed_cm(&c, "cm1", "u1", vec![owner()], json!({}));
    let GcOutcome { pending, errors: errs, .. } = reconciler(&c)
        .delete_applied_resources(&[tracked("cm1", "u1")], "manifest removed", &owner(), None)
        .await;
    assert!(errs.is_empty());
    assert_eq!(pending, vec![tracked("cm1", "u1")]);
    assert!(!c.exists(&cm_gvr(), "ns1", "cm1"));

    let deletes: Vec<_> = c.writes().into_iter().filter(|a| a.verb == Verb::Delete).collect();
    assert_eq!(deletes.len(), 1);
    let opts = deletes[0].delete.clone().unwrap();
    assert_eq!(opts.uid_precondition.as_deref(), Some("u1"));
    assert_eq!(opts.propagation, Propagation::Background);

    let events = c.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].reason, "ResourceDeleted");
    assert_eq!(events[0].note, "Deleted resource v1.configmaps with key ns1/cm1 because manifest removed.");
}

#[tokio::test]
async fn shared_resource_only_loses_our_owner_reference() {
    let c = FakeCluster::new();
    seed_cm(&c, "cm1", "u1", vec![owner(), other_owner()], json!({}));
    let GcOutcome { pending, errors: errs, .. } = reconciler(&c)
        .delete_applied_resources(&[tracked("cm1", "u1")], "manifest removed", &owner(), None)
        .await;
    assert!(errs.is_empty());
    assert!(pending.is_empty());

    let writes = c.writes();
    assert_eq!(writes.len(), 1);
    assert_eq!(writes[0].verb, Verb::Patch);
    let patch = writes[0].patch.clone().unwrap();
    assert_eq!(patch["metadata"]["uid"], "u1");
    assert!(patch["metadata"]["resourceVersion"].is_string());

    let live = c.object(&cm_gvr(), "ns1", "cm1").expect("kept");
    assert_eq!(live.metadata.owner_references, Some(vec![other_owner()]));
}

#[tokio::test]
async fn replaced_instance_is_forgotten() {
    let c = FakeCluster::new();
    seed_cm(&c, "cm1", "new-uid", vec![owner()], json!({}));
    let GcOutcome { pending, errors: errs, .. } = reconciler(&c)
        .delete_applied_resources(&[tracked("cm1", "old-uid")], "manifest removed", &owner(), None)
        .await;
    assert!(pending.is_empty() && errs.is_empty());
    assert!(c.writes().is_empty());
    assert!(c.exists(&cm_gvr(), "ns1", "cm1"));
}

#[tokio::test]
async fn missing_and_foreign_resources_are_skipped() {
    let c = FakeCluster::new();
    seed_cm(&c, "foreign", "u2", vec![other_owner()], json!({}));
    let GcOutcome { pending, errors: errs, .. } = reconciler(&c)
        .delete_applied_resources(&[tracked("absent", "u1"), tracked("foreign", "u2")], "r", &owner(), None)
        .await;
    assert!(pending.is_empty() && errs.is_empty());
    assert!(c.writes().is_empty());
}

#[tokio::test]
async fn terminating_resource_stays_pending() {
    let c = FakeCluster::new();
    seed_cm(
        &c,
        "cm1",
        "u1",
        vec![owner()],
        json!({"deletionTimestamp": "2024-01-01T00:00:00Z", "finalizers": ["example.io/hold"]}),
    );
    let GcOutcome { pending, errors: errs, .. } = reconciler(&c)
        .delete_applied_resources(&[tracked("cm1", "u1")], "r", &owner(), None)
        .await;
    assert!(errs.is_empty());
    assert_eq!(pending, vec![tracked("cm1", "u1")]);
    assert!(c.writes().is_empty());
}

#[tokio::test]
async fn delete_conflict_drops_and_other_errors_accumulate() {
    let c = FakeCluster::new();
    seed_cm(&c, "raced", "u1", vec![owner()], json!({}));
    seed_cm(&c, "broken", "u2", vec![owner()], json!({}));
    seed_cm(&c, "fine", "u3", vec![owner()], json!({}));
    c.fail(Verb::Delete, "raced", ClientError::Conflict("uid precondition".into()));
    c.fail(Verb::Delete, "broken", ClientError::Other("etcd unavailable".into()));

    let out = reconciler(&c)
        .delete_applied_resources(
            &[tracked("raced", "u1"), tracked("broken", "u2"), tracked("fine", "u3")],
            "r",
            &owner(),
            None,
        )
        .await;
    assert_eq!(out.pending, vec![tracked("fine", "u3")]);
    assert_eq!(out.failed, vec![tracked("broken", "u2")]);
    assert_eq!(out.errors.len(), 1);
    assert!(out.errors[0].is_transient());
    assert_eq!(
        out.errors[0].to_string(),
        "failed to delete resource v1.configmaps with key ns1/broken: etcd unavailable"
    );
    // raced is dropped, broken stays for the next pass
    assert_eq!(out.retained(), vec![tracked("fine", "u3"), tracked("broken", "u2")]);
}

#[tokio::test]
async fn get_failure_is_reported_and_the_rest_continue() {
    let c = FakeCluster::new();
    seed_cm(&c, "cm2", "u2", vec![owner()], json!({}));
    c.fail(Verb::Get, "cm1", ClientError::Timeout(std::time::Duration::from_secs(30)));
    let out = reconciler(&c)
        .delete_applied_resources(&[tracked("cm1", "u1"), tracked("cm2", "u2")], "r", &owner(), None)
        .await;
    assert_eq!(out.errors.len(), 1);
    assert!(out.errors[0].to_string().starts_with("failed to get resource v1.configmaps with key ns1/cm1"));
    assert_eq!(out.pending, vec![tracked("cm2", "u2")]);
    assert_eq!(out.failed, vec![tracked("cm1", "u1")]);
}

#[tokio::test]
async fn failed_owner_strip_is_kept_for_retry() {
    let c = FakeCluster::new();
    seed_cm(&c, "cm1", "u1", vec![owner(), other_owner()], json!({}));
    c.fail(Verb::Patch, "cm1", ClientError::Timeout(std::time::Duration::from_secs(30)));
    let out = reconciler(&c)
        .delete_applied_resources(&[tracked("cm1", "u1")], "r", &owner(), None)
        .await;
    assert!(out.pending.is_empty());
    assert_eq!(out.failed, vec![tracked("cm1", "u1")]);
    assert!(out.errors[0].is_transient());
}

#[tokio::test]
async fn denied_delete_releases_ownership_without_deleting() {
    let c = FakeCluster::new();
    seed_cm(&c, "cm1", "u1", vec![owner()], json!({}));
    c.grant_role("ns1", "reader", ("ns1", "executor"), vec![rule(&["get"], &[""], &["configmaps"])]).unwrap();
    let executor = ManifestWorkExecutor::service_account("ns1", "executor");

    let GcOutcome { pending, errors: errs, .. } = reconciler(&c)
        .delete_applied_resources(&[tracked("cm1", "u1")], "r", &owner(), Some(&executor))
        .await;
    assert!(pending.is_empty());
    assert!(errs.is_empty());
    assert!(c.writes().iter().all(|a| a.verb != Verb::Delete));
    let live = c.object(&cm_gvr(), "ns1", "cm1").expect("kept");
    assert_eq!(live.metadata.owner_references, Some(vec![]));
}

#[tokio::test]
async fn orphaning_strips_owner_only() {
    let c = FakeCluster::new();
    seed_cm(&c, "cm1", "u1", vec![owner()], json!({}));
    let out = reconciler(&c).orphan_applied_resources(&[tracked("cm1", "u1")], &owner()).await;
    assert_eq!(out, GcOutcome::default());
    let live = c.object(&cm_gvr(), "ns1", "cm1").expect("kept");
    assert_eq!(live.metadata.owner_references, Some(vec![]));
    // a second pass has nothing to change
    c.clear_actions();
    reconciler(&c).orphan_applied_resources(&[tracked("cm1", "u1")], &owner()).await;
    assert!(c.writes().is_empty());
}

#[tokio::test]
async fn failed_orphan_is_kept_for_retry() {
    let c = FakeCluster::new();
    seed_cm(&c, "cm1", "u1", vec![owner()], json!({}));
    c.fail(Verb::Patch, "cm1", ClientError::Other("etcd unavailable".into()));
    let out = reconciler(&c).orphan_applied_resources(&[tracked("cm1", "u1")], &owner()).await;
    assert!(out.pending.is_empty());
    assert_eq!(out.failed, vec![tracked("cm1", "u1")]);
    assert_eq!(out.errors[0].to_string(), "failed to remove owner from resource v1.configmaps with key ns1/cm1: etcd unavailable");
}
