//! Garbage collection of applied resources that are no longer desired.

use std::sync::Arc;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use metrics::counter;
use spoke_auth::{ExecuteAction, ExecutorValidator};
use spoke_core::{
    work::{DeleteOption, PropagationPolicy},
    AppliedResourceMeta, ManifestWorkExecutor, WorkError,
};
use spoke_kubehub::{DeleteOptions, EventRecorder, ObjectClient, Propagation};
use tracing::{debug, info, warn};

use crate::owner::{apply_owner_references, is_owned_by, removal_owner};

/// Split `resources` into `(to_delete, to_orphan)` according to the work's
/// delete option.
pub fn resolve_delete_option(
    resources: Vec<AppliedResourceMeta>,
    option: Option<&DeleteOption>,
) -> (Vec<AppliedResourceMeta>, Vec<AppliedResourceMeta>) {
    let Some(option) = option else { return (resources, Vec::new()) };
    match option.propagation_policy {
        PropagationPolicy::Foreground => (resources, Vec::new()),
        PropagationPolicy::Orphan => (Vec::new(), resources),
        PropagationPolicy::SelectivelyOrphan => {
            let rules = option.selectively_orphans.as_ref().map(|s| s.orphaning_rules.as_slice()).unwrap_or_default();
            resources.into_iter().partition(|r| !rules.contains(&r.identifier()))
        }
    }
}

/// What a garbage-collection call left behind.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GcOutcome {
    /// Deleted or already terminating, tracked until the object is gone.
    pub pending: Vec<AppliedResourceMeta>,
    /// Left untouched by an error and retried on the next pass.
    pub failed: Vec<AppliedResourceMeta>,
    pub errors: Vec<WorkError>,
}

impl GcOutcome {
    pub fn extend(&mut self, other: GcOutcome) {
        self.pending.extend(other.pending);
        self.failed.extend(other.failed);
        self.errors.extend(other.errors);
    }

    /// Resources that must stay on the applied list.
    pub fn retained(&self) -> Vec<AppliedResourceMeta> {
        self.pending.iter().chain(&self.failed).cloned().collect()
    }

    fn fail(&mut self, resource: &AppliedResourceMeta, action: &str, err: impl Into<WorkError>) {
        self.failed.push(resource.clone());
        self.errors
            .push(WorkError::for_resource(action, &resource.gvr(), &resource.namespace, &resource.name, err));
    }
}

pub struct AppliedResourceReconciler {
    client: Arc<dyn ObjectClient>,
    validator: Arc<dyn ExecutorValidator>,
    recorder: Arc<dyn EventRecorder>,
}

impl AppliedResourceReconciler {
    pub fn new(client: Arc<dyn ObjectClient>, validator: Arc<dyn ExecutorValidator>, recorder: Arc<dyn EventRecorder>) -> Self {
        Self { client, validator, recorder }
    }

    /// Delete resources owned by `owner`. Anything not in the outcome's
    /// `pending` or `failed` lists is reconciled and can be forgotten.
    pub async fn delete_applied_resources(
        &self,
        resources: &[AppliedResourceMeta],
        reason: &str,
        owner: &OwnerReference,
        executor: Option<&ManifestWorkExecutor>,
    ) -> GcOutcome {
        let mut out = GcOutcome::default();
        let removal = removal_owner(owner);

        for resource in resources {
            let gvr = resource.gvr();
            let (ns, name) = (resource.namespace.as_str(), resource.name.as_str());
            let live = match self.client.get(&gvr, ns, name).await {
                Ok(obj) => obj,
                Err(e) if e.is_not_found() => {
                    debug!(gvr = %gvr, ns, name, "resource already removed");
                    continue;
                }
                Err(e) => {
                    warn!(gvr = %gvr, ns, name, error = %e, "failed to get resource");
                    out.fail(resource, "get", e);
                    continue;
                }
            };

            let owners = live.metadata.owner_references.as_deref().unwrap_or_default();
            if !is_owned_by(owner, owners) {
                continue;
            }

            // A denied delete degrades cleanup instead of blocking the pass:
            // the object stays and only our owner reference is stripped.
            let delete_allowed = match self
                .validator
                .validate(executor, &gvr, ns, name, None, ExecuteAction::Delete)
                .await
            {
                Ok(()) => true,
                Err(e) if e.is_not_allowed() => {
                    warn!(gvr = %gvr, ns, name, error = %e, "not allowed to delete resource, releasing ownership only");
                    false
                }
                Err(e) => {
                    warn!(gvr = %gvr, ns, name, error = %e, "failed to check delete permission");
                    out.fail(resource, "authorize deletion of", e);
                    continue;
                }
            };

            if owners.len() > 1 || !delete_allowed {
                match apply_owner_references(self.client.as_ref(), &gvr, &live, &removal).await {
                    Ok(_) => {
                        counter!("gc_owner_stripped_total", 1u64);
                    }
                    Err(e) => {
                        warn!(gvr = %gvr, ns, name, error = %e, "failed to remove owner from resource");
                        out.fail(resource, "remove owner from", e);
                    }
                }
                continue;
            }

            if live.metadata.uid.as_deref().unwrap_or_default() != resource.uid {
                debug!(gvr = %gvr, ns, name, "tracked instance replaced, forgetting it");
                continue;
            }

            if live.metadata.deletion_timestamp.is_some() {
                out.pending.push(resource.clone());
                continue;
            }

            let opts = DeleteOptions { uid_precondition: Some(resource.uid.clone()), propagation: Propagation::Background };
            match self.client.delete(&gvr, ns, name, &opts).await {
                Ok(()) => {
                    counter!("gc_deleted_total", 1u64);
                    info!(gvr = %gvr, ns, name, reason, "deleted resource");
                    out.pending.push(resource.clone());
                    self.recorder
                        .record(
                            "ResourceDeleted",
                            format!("Deleted resource {} with key {}/{} because {}.", gvr, ns, name, reason),
                        )
                        .await;
                }
                Err(e) if e.is_not_found() => {}
                // UID precondition failed: the object was replaced, stop tracking the old one
                Err(e) if e.is_conflict() => {}
                Err(e) => {
                    warn!(gvr = %gvr, ns, name, error = %e, "failed to delete resource");
                    out.fail(resource, "delete", e);
                }
            }
        }

        out
    }

    /// Release `resources` without deleting them: strip our owner reference.
    pub async fn orphan_applied_resources(&self, resources: &[AppliedResourceMeta], owner: &OwnerReference) -> GcOutcome {
        let removal = removal_owner(owner);
        let mut out = GcOutcome::default();
        for resource in resources {
            let gvr = resource.gvr();
            let live = match self.client.get(&gvr, &resource.namespace, &resource.name).await {
                Ok(obj) => obj,
                Err(e) if e.is_not_found() => continue,
                Err(e) => {
                    out.fail(resource, "get", e);
                    continue;
                }
            };
            match apply_owner_references(self.client.as_ref(), &gvr, &live, &removal).await {
                Ok(true) => {
                    counter!("gc_owner_stripped_total", 1u64);
                    info!(gvr = %gvr, ns = %resource.namespace, name = %resource.name, "orphaned resource");
                }
                Ok(false) => {}
                Err(e) => {
                    warn!(gvr = %gvr, ns = %resource.namespace, name = %resource.name, error = %e, "failed to orphan resource");
                    out.fail(resource, "remove owner from", e);
                }
            }
        }
        out
    }
}
