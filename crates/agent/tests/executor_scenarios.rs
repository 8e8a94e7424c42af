use std::{sync::Arc, time::Duration};

use serde_json::{json, Value};
use spoke_agent::{Clients, WorkController, PENDING_REQUEUE};
use spoke_auth::SarValidator;
use spoke_core::{
    applied_work_name, find_condition,
    work::{
        AppliedManifestWork, DeleteOption, ManifestWork, PropagationPolicy, SelectivelyOrphan, MANIFEST_WORK_FINALIZER,
        WORK_APPLIED, WORK_AVAILABLE,
    },
    ClientError, ConditionStatus, GroupVersionResource, ManifestWorkExecutor, ResourceIdentifier,
};
use spoke_kubehub::{
    fake::{named_rule, rule, FakeCluster, FakeTypedClient, Verb, RBAC_GROUP},
    ResourceMapper,
};

const HUB: &str = "hubhash";
const NOT_ALLOWED_REQUEUE: Duration = Duration::from_secs(60);

struct Harness {
    cluster: Arc<FakeCluster>,
    works: Arc<FakeTypedClient<ManifestWork>>,
    applied: Arc<FakeTypedClient<AppliedManifestWork>>,
    controller: WorkController,
}

fn harness() -> Harness {
    let cluster = FakeCluster::new();
    let works = FakeTypedClient::<ManifestWork>::new();
    let applied = FakeTypedClient::<AppliedManifestWork>::new();
    let validator = SarValidator::new(cluster.clone(), Arc::new(cluster.impersonation()));
    let controller = WorkController::new(
        HUB,
        Clients {
            works: works.clone(),
            applied_works: applied.clone(),
            spoke: cluster.clone(),
            mapper: Arc::new(ResourceMapper::builtin()),
            validator: Arc::new(validator),
            recorder: cluster.clone(),
        },
    );
    Harness { cluster, works, applied, controller }
}

impl Harness {
    fn work(&self) -> ManifestWork {
        self.works.object("work").expect("work exists")
    }

    fn applied_work(&self) -> AppliedManifestWork {
        self.applied.object(&applied_work_name(HUB, "work")).expect("applied work exists")
    }

    fn manifest_applied(&self, ordinal: usize) -> spoke_core::Condition {
        let work = self.work();
        find_condition(&work.status.resource_status.manifests[ordinal].conditions, WORK_APPLIED)
            .cloned()
            .expect("Applied condition")
    }

    fn start_deleting(&self) {
        let mut w = self.work();
        w.metadata.deletion_timestamp = Some(chrono::Utc::now());
        self.works.insert(w);
    }
}

fn cm(name: &str) -> Value {
    json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": name, "namespace": "ns1"}, "data": {"k": "v"}})
}

fn cm_gvr() -> GroupVersionResource {
    GroupVersionResource::new("", "v1", "configmaps")
}

fn cm_admin_role() -> Value {
    json!({
        "apiVersion": "rbac.authorization.k8s.io/v1", "kind": "Role",
        "metadata": {"name": "cm-admin", "namespace": "ns1"},
        "rules": [{"apiGroups": [""], "resources": ["configmaps"], "verbs": ["*"]}],
    })
}

fn cm_admin_binding() -> Value {
    json!({
        "apiVersion": "rbac.authorization.k8s.io/v1", "kind": "RoleBinding",
        "metadata": {"name": "cm-admin", "namespace": "ns1"},
        "roleRef": {"apiGroup": RBAC_GROUP, "kind": "Role", "name": "cm-admin"},
        "subjects": [{"kind": "ServiceAccount", "name": "executor", "namespace": "ns1"}],
    })
}

fn executed_work(manifests: Vec<Value>) -> ManifestWork {
    let mut w = ManifestWork::new("cluster1", "work", manifests);
    w.spec.executor = Some(ManifestWorkExecutor::service_account("ns1", "executor"));
    w
}

fn role_gvr(resource: &str) -> GroupVersionResource {
    GroupVersionResource::new(RBAC_GROUP, "v1", resource)
}

#[tokio::test]
async fn executor_without_permissions_applies_nothing() {
    let h = harness();
    h.works.insert(executed_work(vec![cm("cm1"), cm("cm2")]));

    let requeue = h.controller.reconcile("work").await.unwrap();
    assert_eq!(requeue, Some(NOT_ALLOWED_REQUEUE));

    assert!(!h.cluster.exists(&cm_gvr(), "ns1", "cm1"));
    assert!(!h.cluster.exists(&cm_gvr(), "ns1", "cm2"));
    for i in 0..2 {
        let c = h.manifest_applied(i);
        assert_eq!(c.status, ConditionStatus::False);
        assert!(c.message.contains("not allowed to apply the resource"), "{}", c.message);
    }
    let work = h.work();
    assert!(!find_condition(&work.status.conditions, WORK_APPLIED).unwrap().is_true());
    assert!(h.applied_work().status.applied_resources.is_empty());
}

#[tokio::test]
async fn executor_limited_to_one_name_applies_only_that_resource() {
    let h = harness();
    h.cluster
        .grant_role(
            "ns1",
            "cm1-writer",
            ("ns1", "executor"),
            vec![named_rule(&["create", "update", "patch", "get"], &[""], &["configmaps"], &["cm1"])],
        )
        .unwrap();
    h.works.insert(executed_work(vec![cm("cm1"), cm("cm2")]));

    let requeue = h.controller.reconcile("work").await.unwrap();
    assert_eq!(requeue, Some(NOT_ALLOWED_REQUEUE));

    assert!(h.cluster.exists(&cm_gvr(), "ns1", "cm1"));
    assert!(!h.cluster.exists(&cm_gvr(), "ns1", "cm2"));
    assert!(h.manifest_applied(0).is_true());
    assert!(!h.manifest_applied(1).is_true());

    let tracked = h.applied_work().status.applied_resources;
    assert_eq!(tracked.len(), 1);
    assert_eq!(tracked[0].name, "cm1");
}

fn rbac_writer_verbs(extra: &[&'static str]) -> Vec<&'static str> {
    let mut verbs = vec!["create", "update", "patch", "get"];
    verbs.extend_from_slice(extra);
    verbs
}

#[tokio::test]
async fn granting_more_than_held_is_an_escalation() {
    let h = harness();
    h.cluster
        .grant_role(
            "ns1",
            "rbac-writer",
            ("ns1", "executor"),
            vec![rule(&rbac_writer_verbs(&[]), &[RBAC_GROUP], &["roles", "rolebindings"])],
        )
        .unwrap();
    h.works.insert(executed_work(vec![cm_admin_role(), cm_admin_binding(), cm("cm1")]));

    // the binding's role was never created, so its dry run fails with NotFound
    let err = h.controller.reconcile("work").await.unwrap_err();
    assert!(err.is_transient());

    assert!(!h.cluster.exists(&role_gvr("roles"), "ns1", "cm-admin"));
    assert!(!h.cluster.exists(&role_gvr("rolebindings"), "ns1", "cm-admin"));
    assert!(!h.cluster.exists(&cm_gvr(), "ns1", "cm1"));

    let role = h.manifest_applied(0);
    assert_eq!(role.status, ConditionStatus::False);
    assert!(role.message.contains("permission escalation"), "{}", role.message);
    assert_eq!(h.manifest_applied(1).status, ConditionStatus::False);
    let cm1 = h.manifest_applied(2);
    assert_eq!(cm1.status, ConditionStatus::False);
    assert!(cm1.message.contains("not allowed to apply the resource"), "{}", cm1.message);

    let work = h.work();
    assert!(!find_condition(&work.status.conditions, WORK_APPLIED).unwrap().is_true());
    assert!(h.applied_work().status.applied_resources.is_empty());
    assert!(h.cluster.impersonated_users().contains(&"system:serviceaccount:ns1:executor".to_string()));
}

#[tokio::test]
async fn escalate_and_bind_allow_rbac_manifests() {
    let h = harness();
    h.cluster
        .grant_role(
            "ns1",
            "rbac-admin",
            ("ns1", "executor"),
            vec![rule(&rbac_writer_verbs(&["escalate", "bind"]), &[RBAC_GROUP], &["roles", "rolebindings"])],
        )
        .unwrap();
    h.works.insert(executed_work(vec![cm_admin_role(), cm_admin_binding(), cm("cm1")]));

    assert_eq!(h.controller.reconcile("work").await.unwrap(), None);
    assert!(h.cluster.exists(&role_gvr("roles"), "ns1", "cm-admin"));
    assert!(h.cluster.exists(&role_gvr("rolebindings"), "ns1", "cm-admin"));
    // written through the role the executor bound to itself a moment earlier
    assert!(h.cluster.exists(&cm_gvr(), "ns1", "cm1"));
    for i in 0..3 {
        assert!(h.manifest_applied(i).is_true());
    }
    let work = h.work();
    assert!(find_condition(&work.status.conditions, WORK_APPLIED).unwrap().is_true());
    assert!(find_condition(&work.status.conditions, WORK_AVAILABLE).unwrap().is_true());
    assert_eq!(h.applied_work().status.applied_resources.len(), 3);

    // a second pass finds nothing to change in either status
    let (work_writes, applied_writes) = (h.works.status_writes(), h.applied.status_writes());
    assert_eq!(h.controller.reconcile("work").await.unwrap(), None);
    assert_eq!(h.works.status_writes(), work_writes);
    assert_eq!(h.applied.status_writes(), applied_writes);
}

#[tokio::test]
async fn first_pass_adds_cleanup_finalizer_and_owner() {
    let h = harness();
    h.works.insert(ManifestWork::new("cluster1", "work", vec![cm("cm1")]));
    assert_eq!(h.controller.reconcile("work").await.unwrap(), None);

    assert!(h.work().metadata.finalizers.iter().any(|f| f == MANIFEST_WORK_FINALIZER));
    let applied = h.applied_work();
    let live = h.cluster.object(&cm_gvr(), "ns1", "cm1").unwrap();
    let owners = live.metadata.owner_references.unwrap();
    assert_eq!(owners.len(), 1);
    assert_eq!(owners[0].uid, applied.metadata.uid);
    assert_eq!(applied.status.applied_resources[0].uid, live.metadata.uid.unwrap());
}

#[tokio::test]
async fn dropped_manifest_is_garbage_collected() {
    let h = harness();
    h.works.insert(ManifestWork::new("cluster1", "work", vec![cm("cm1"), cm("cm2")]));
    assert_eq!(h.controller.reconcile("work").await.unwrap(), None);
    assert_eq!(h.applied_work().status.applied_resources.len(), 2);

    let mut w = h.work();
    w.spec.workload.manifests = vec![cm("cm1")];
    h.works.insert(w);

    assert_eq!(h.controller.reconcile("work").await.unwrap(), Some(PENDING_REQUEUE));
    assert!(h.cluster.exists(&cm_gvr(), "ns1", "cm1"));
    assert!(!h.cluster.exists(&cm_gvr(), "ns1", "cm2"));
    assert_eq!(h.applied_work().status.applied_resources.len(), 2);
    let events = h.cluster.events();
    assert_eq!(events.len(), 1);
    assert!(events[0].note.contains("ns1/cm2"));

    assert_eq!(h.controller.reconcile("work").await.unwrap(), None);
    let tracked = h.applied_work().status.applied_resources;
    assert_eq!(tracked.len(), 1);
    assert_eq!(tracked[0].name, "cm1");
    assert_eq!(h.work().status.resource_status.manifests.len(), 1);
}

#[tokio::test]
async fn failed_garbage_collection_is_retried() {
    let h = harness();
    h.works.insert(ManifestWork::new("cluster1", "work", vec![cm("cm1"), cm("cm2")]));
    assert_eq!(h.controller.reconcile("work").await.unwrap(), None);

    let mut w = h.work();
    w.spec.workload.manifests = vec![cm("cm1")];
    h.works.insert(w);
    h.cluster.fail(Verb::Delete, "cm2", ClientError::Other("etcd unavailable".into()));

    let err = h.controller.reconcile("work").await.unwrap_err();
    assert!(err.is_transient());
    assert!(err.to_string().contains("with key ns1/cm2"), "{}", err);
    assert!(h.cluster.exists(&cm_gvr(), "ns1", "cm2"));
    let tracked: Vec<_> = h.applied_work().status.applied_resources.into_iter().map(|r| r.name).collect();
    assert_eq!(tracked, vec!["cm1", "cm2"]);

    h.cluster.clear_failures();
    assert_eq!(h.controller.reconcile("work").await.unwrap(), Some(PENDING_REQUEUE));
    assert!(!h.cluster.exists(&cm_gvr(), "ns1", "cm2"));
    assert_eq!(h.controller.reconcile("work").await.unwrap(), None);
    let tracked: Vec<_> = h.applied_work().status.applied_resources.into_iter().map(|r| r.name).collect();
    assert_eq!(tracked, vec!["cm1"]);
}

#[tokio::test]
async fn terminating_work_keeps_finalizer_while_cleanup_fails() {
    let h = harness();
    h.works.insert(ManifestWork::new("cluster1", "work", vec![cm("cm1")]));
    h.controller.reconcile("work").await.unwrap();
    h.start_deleting();
    h.cluster.fail(Verb::Delete, "cm1", ClientError::Other("etcd unavailable".into()));

    assert!(h.controller.reconcile("work").await.is_err());
    assert!(h.cluster.exists(&cm_gvr(), "ns1", "cm1"));
    assert!(h.work().metadata.finalizers.iter().any(|f| f == MANIFEST_WORK_FINALIZER));
    assert_eq!(h.applied_work().status.applied_resources.len(), 1);

    h.cluster.clear_failures();
    assert_eq!(h.controller.reconcile("work").await.unwrap(), Some(PENDING_REQUEUE));
    assert!(!h.cluster.exists(&cm_gvr(), "ns1", "cm1"));
    assert_eq!(h.controller.reconcile("work").await.unwrap(), None);
    assert!(h.works.object("work").is_none());
}

#[tokio::test]
async fn terminating_work_releases_finalizer_after_cleanup() {
    let h = harness();
    h.works.insert(ManifestWork::new("cluster1", "work", vec![cm("cm1")]));
    h.controller.reconcile("work").await.unwrap();
    h.start_deleting();

    assert_eq!(h.controller.reconcile("work").await.unwrap(), Some(PENDING_REQUEUE));
    assert!(!h.cluster.exists(&cm_gvr(), "ns1", "cm1"));
    assert!(h.work().metadata.finalizers.iter().any(|f| f == MANIFEST_WORK_FINALIZER));

    assert_eq!(h.controller.reconcile("work").await.unwrap(), None);
    assert!(h.works.object("work").is_none(), "finalizer removed, work released");
    assert_eq!(h.controller.reconcile("work").await.unwrap(), None);
}

#[tokio::test]
async fn orphan_policy_keeps_resources() {
    let h = harness();
    let mut w = ManifestWork::new("cluster1", "work", vec![cm("cm1")]);
    w.spec.delete_option = Some(DeleteOption { propagation_policy: PropagationPolicy::Orphan, selectively_orphans: None });
    h.works.insert(w);
    h.controller.reconcile("work").await.unwrap();
    h.start_deleting();

    assert_eq!(h.controller.reconcile("work").await.unwrap(), None);
    assert!(h.works.object("work").is_none());
    let live = h.cluster.object(&cm_gvr(), "ns1", "cm1").expect("orphaned, not deleted");
    assert_eq!(live.metadata.owner_references, Some(vec![]));
}

#[tokio::test]
async fn selective_orphan_only_spares_listed_resources() {
    let h = harness();
    let mut w = ManifestWork::new("cluster1", "work", vec![cm("cm1"), cm("cm2")]);
    w.spec.delete_option = Some(DeleteOption {
        propagation_policy: PropagationPolicy::SelectivelyOrphan,
        selectively_orphans: Some(SelectivelyOrphan {
            orphaning_rules: vec![ResourceIdentifier {
                group: String::new(),
                resource: "configmaps".into(),
                namespace: "ns1".into(),
                name: "cm1".into(),
            }],
        }),
    });
    h.works.insert(w);
    h.controller.reconcile("work").await.unwrap();
    h.start_deleting();

    assert_eq!(h.controller.reconcile("work").await.unwrap(), Some(PENDING_REQUEUE));
    assert!(h.cluster.exists(&cm_gvr(), "ns1", "cm1"));
    assert!(!h.cluster.exists(&cm_gvr(), "ns1", "cm2"));
    assert_eq!(h.controller.reconcile("work").await.unwrap(), None);
    assert!(h.works.object("work").is_none());
}

#[tokio::test]
async fn transient_failure_still_records_status() {
    let h = harness();
    h.cluster.fail(Verb::Create, "cm1", ClientError::Other("etcd unavailable".into()));
    h.works.insert(ManifestWork::new("cluster1", "work", vec![cm("cm1")]));

    let err = h.controller.reconcile("work").await.unwrap_err();
    assert!(err.is_transient());
    assert_eq!(h.manifest_applied(0).status, ConditionStatus::False);

    h.cluster.clear_failures();
    assert_eq!(h.controller.reconcile("work").await.unwrap(), None);
    assert!(h.manifest_applied(0).is_true());
}

#[tokio::test]
async fn missing_work_is_done() {
    let h = harness();
    assert_eq!(h.controller.reconcile("absent").await.unwrap(), None);
    assert!(h.cluster.actions().is_empty());
}
