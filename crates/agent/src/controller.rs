//! Reconciles one ManifestWork per pass: apply, garbage-collect, persist.

use std::{sync::Arc, time::Duration};

use metrics::counter;
use spoke_apply::{
    aggregate_conditions, applied_work_owner, next_applied_resources, resolve_delete_option, stale_resources,
    AppliedResourceReconciler, GcOutcome, ManifestApplier,
};
use spoke_auth::ExecutorValidator;
use spoke_core::{
    applied_work_name, is_condition_true, remove_finalizer,
    work::{AppliedManifestWork, ManifestWork, MANIFEST_WORK_FINALIZER, WORK_APPLIED, WORK_AVAILABLE},
    WorkError,
};
use spoke_kubehub::{EventRecorder, ObjectClient, RestMapping, TypedClient};
use spoke_status::{merge_manifest_status, set_applied_resources, set_work_conditions, StatusUpdater};
use tracing::{debug, info, warn};

/// Re-check delay while deleted resources are still finalizing.
pub const PENDING_REQUEUE: Duration = Duration::from_secs(5);

/// Collaborators the controller is built from.
pub struct Clients {
    pub works: Arc<dyn TypedClient<ManifestWork>>,
    pub applied_works: Arc<dyn TypedClient<AppliedManifestWork>>,
    pub spoke: Arc<dyn ObjectClient>,
    pub mapper: Arc<dyn RestMapping>,
    pub validator: Arc<dyn ExecutorValidator>,
    pub recorder: Arc<dyn EventRecorder>,
}

pub struct WorkController {
    hub_hash: String,
    works: Arc<dyn TypedClient<ManifestWork>>,
    applied_works: Arc<dyn TypedClient<AppliedManifestWork>>,
    applier: ManifestApplier,
    reconciler: AppliedResourceReconciler,
    work_status: StatusUpdater<ManifestWork>,
    applied_status: StatusUpdater<AppliedManifestWork>,
    resync: Option<Duration>,
}

fn shortest(a: Option<Duration>, b: Option<Duration>) -> Option<Duration> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

impl WorkController {
    pub fn new(hub_hash: impl Into<String>, clients: Clients) -> Self {
        Self {
            hub_hash: hub_hash.into(),
            applier: ManifestApplier::new(clients.spoke.clone(), clients.mapper, clients.validator.clone()),
            reconciler: AppliedResourceReconciler::new(clients.spoke, clients.validator, clients.recorder),
            work_status: StatusUpdater::new(clients.works.clone()),
            applied_status: StatusUpdater::new(clients.applied_works.clone()),
            works: clients.works,
            applied_works: clients.applied_works,
            resync: None,
        }
    }

    /// Ask for a fresh pass `every` after each successful one.
    pub fn with_resync(mut self, every: Duration) -> Self {
        self.resync = Some(every);
        self
    }

    /// One pass over the work called `name`. `Ok(Some(d))` asks for another
    /// pass after `d`; errors are transient unless classified otherwise.
    pub async fn reconcile(&self, name: &str) -> Result<Option<Duration>, WorkError> {
        let work = match self.works.get(name).await {
            Ok(w) => w,
            Err(e) if e.is_not_found() => {
                debug!(work = name, "work gone");
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        if work.is_terminating() {
            return self.finalize(work).await;
        }

        let work = self.ensure_finalizer(work).await?;
        let applied = self.ensure_applied_work(name).await?;
        let owner = applied_work_owner(&applied);
        let executor = work.spec.executor.as_ref();

        let result = self.applier.apply(&work, &owner).await;
        let mut errs = result.errors;

        let previous = &applied.status.applied_resources;
        let stale = stale_resources(previous, &result.desired);
        let (to_delete, to_orphan) = resolve_delete_option(stale, work.spec.delete_option.as_ref());
        let mut gc = self
            .reconciler
            .delete_applied_resources(&to_delete, "it is no longer maintained by manifestwork", &owner, executor)
            .await;
        gc.extend(self.reconciler.orphan_applied_resources(&to_orphan, &owner).await);
        errs.append(&mut gc.errors);

        let tracked = next_applied_resources(previous, &result.applied, &result.desired, &gc.retained());
        if let Err(e) = self.applied_status.update(&applied, &[set_applied_resources(tracked)]).await {
            warn!(work = name, error = %e, "failed to record applied resources");
            errs.push(e);
        }

        let [applied_cond, available_cond] = aggregate_conditions(&result.conditions);
        let updates = [merge_manifest_status(result.conditions), set_work_conditions(vec![applied_cond, available_cond])];
        match self.work_status.update(&work, &updates).await {
            Ok((_, changed)) => debug!(work = name, changed, "work status reconciled"),
            Err(e) => {
                warn!(work = name, error = %e, "failed to update work status");
                errs.push(e);
            }
        }

        counter!("work_reconcile_total", 1u64);
        if let Some(err) = WorkError::aggregate(errs) {
            return Err(err);
        }
        let pending_requeue = if gc.pending.is_empty() { None } else { Some(PENDING_REQUEUE) };
        Ok(shortest(shortest(result.requeue_after, pending_requeue), self.resync))
    }

    async fn ensure_finalizer(&self, work: ManifestWork) -> Result<ManifestWork, WorkError> {
        if work.metadata.finalizers.iter().any(|f| f == MANIFEST_WORK_FINALIZER) {
            return Ok(work);
        }
        let mut next = work;
        next.metadata.finalizers.push(MANIFEST_WORK_FINALIZER.to_string());
        Ok(self.works.update(&next).await?)
    }

    async fn ensure_applied_work(&self, work_name: &str) -> Result<AppliedManifestWork, WorkError> {
        let name = applied_work_name(&self.hub_hash, work_name);
        match self.applied_works.get(&name).await {
            Ok(a) => Ok(a),
            Err(e) if e.is_not_found() => {
                info!(work = work_name, applied = %name, "creating applied manifest work");
                match self.applied_works.create(&AppliedManifestWork::new(&self.hub_hash, work_name)).await {
                    Ok(a) => Ok(a),
                    Err(e) if e.is_already_exists() => Ok(self.applied_works.get(&name).await?),
                    Err(e) => Err(e.into()),
                }
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Clean up everything a terminating work applied, then release its
    /// finalizer.
    async fn finalize(&self, work: ManifestWork) -> Result<Option<Duration>, WorkError> {
        let name = work.metadata.name.clone();
        if !work.metadata.finalizers.iter().any(|f| f == MANIFEST_WORK_FINALIZER) {
            return Ok(None);
        }

        let applied_name = applied_work_name(&self.hub_hash, &name);
        let applied = match self.applied_works.get(&applied_name).await {
            Ok(a) => Some(a),
            Err(e) if e.is_not_found() => None,
            Err(e) => return Err(e.into()),
        };

        let mut gc = GcOutcome::default();
        if let Some(applied) = &applied {
            let owner = applied_work_owner(applied);
            let (to_delete, to_orphan) =
                resolve_delete_option(applied.status.applied_resources.clone(), work.spec.delete_option.as_ref());
            gc = self
                .reconciler
                .delete_applied_resources(&to_delete, "manifestwork is terminating", &owner, work.spec.executor.as_ref())
                .await;
            gc.extend(self.reconciler.orphan_applied_resources(&to_orphan, &owner).await);

            if let Err(e) = self.applied_status.update(applied, &[set_applied_resources(gc.retained())]).await {
                gc.errors.push(e);
            }
        }

        if let Some(err) = WorkError::aggregate(gc.errors) {
            return Err(err);
        }
        if !gc.pending.is_empty() {
            debug!(work = %name, pending = gc.pending.len(), "waiting for applied resources to finalize");
            return Ok(Some(PENDING_REQUEUE));
        }

        let mut next = work;
        if remove_finalizer(&mut next.metadata.finalizers, MANIFEST_WORK_FINALIZER) {
            self.works.update(&next).await?;
            info!(work = %name, "cleanup finished, finalizer removed");
        }
        Ok(None)
    }
}

/// Whether a watch update should trigger a pass.
pub fn should_requeue(old: &ManifestWork, new: &ManifestWork) -> bool {
    let settled = is_condition_true(&new.status.conditions, WORK_APPLIED)
        && is_condition_true(&new.status.conditions, WORK_AVAILABLE);
    !settled || new.is_terminating() || old.spec != new.spec
}

#[cfg(test)]
mod tests {
    use super::*;
    use spoke_core::{Condition, ConditionStatus};

    fn settled(mut w: ManifestWork) -> ManifestWork {
        w.status.conditions = vec![
            Condition::new(WORK_APPLIED, ConditionStatus::True, "AppliedManifestWorkComplete", ""),
            Condition::new(WORK_AVAILABLE, ConditionStatus::True, "ResourcesAvailable", ""),
        ];
        w
    }

    #[test]
    fn settled_work_with_same_spec_is_skipped() {
        let w = settled(ManifestWork::new("cluster1", "w", vec![]));
        assert!(!should_requeue(&w, &w.clone()));
    }

    #[test]
    fn spec_change_or_unsettled_status_requeues() {
        let old = settled(ManifestWork::new("cluster1", "w", vec![]));
        let changed = settled(ManifestWork::new("cluster1", "w", vec![serde_json::json!({"kind": "ConfigMap"})]));
        assert!(should_requeue(&old, &changed));

        let mut unavailable = old.clone();
        unavailable.status.conditions[1].status = ConditionStatus::False;
        assert!(should_requeue(&old, &unavailable));
    }

    #[test]
    fn deletion_requeues() {
        let old = settled(ManifestWork::new("cluster1", "w", vec![]));
        let mut deleting = old.clone();
        deleting.metadata.deletion_timestamp = Some(chrono::Utc::now());
        assert!(should_requeue(&old, &deleting));
    }

    #[test]
    fn shortest_picks_min() {
        let s = Duration::from_secs;
        assert_eq!(shortest(Some(s(60)), Some(s(5))), Some(s(5)));
        assert_eq!(shortest(None, Some(s(5))), Some(s(5)));
        assert_eq!(shortest(None, None), None);
    }
}
