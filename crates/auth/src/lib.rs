//! Spoke auth – executor authorization.
//!
//! Access reviews decide whether the executor may touch a resource. For the
//! RBAC-defining kinds a review cannot see escalation rules, so an
//! impersonated dry-run create of the exact object asks the API server itself.

#![forbid(unsafe_code)]

use std::{fmt, sync::Arc, time::Duration};

use async_trait::async_trait;
use kube::core::DynamicObject;
use metrics::counter;
use spoke_core::{GroupVersionResource, ManifestWorkExecutor, WorkError};
use spoke_kubehub::{AccessReviewRequest, AccessReviewer, ImpersonationFactory};
use tracing::{debug, info};

pub const RBAC_GROUP: &str = "rbac.authorization.k8s.io";
pub const DEFAULT_NOT_ALLOWED_REQUEUE: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecuteAction {
    Apply,
    Delete,
}

impl ExecuteAction {
    pub fn verbs(self) -> &'static [&'static str] {
        match self {
            ExecuteAction::Apply => &["create", "update", "patch", "get"],
            ExecuteAction::Delete => &["delete"],
        }
    }
}

impl fmt::Display for ExecuteAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecuteAction::Apply => f.write_str("apply"),
            ExecuteAction::Delete => f.write_str("delete"),
        }
    }
}

/// Kinds whose creation the API server guards against privilege escalation.
pub fn is_escalation_guarded(gvr: &GroupVersionResource) -> bool {
    gvr.group == RBAC_GROUP
        && matches!(gvr.resource.as_str(), "roles" | "rolebindings" | "clusterroles" | "clusterrolebindings")
}

#[async_trait]
pub trait ExecutorValidator: Send + Sync {
    /// `Ok(())` when the executor may perform `action`; `WorkError::NotAllowed`
    /// on denial. `obj` is the manifest being applied and is required for
    /// the escalation check.
    async fn validate(
        &self,
        executor: Option<&ManifestWorkExecutor>,
        gvr: &GroupVersionResource,
        namespace: &str,
        name: &str,
        obj: Option<&DynamicObject>,
        action: ExecuteAction,
    ) -> Result<(), WorkError>;
}

/// [`ExecutorValidator`] backed by SubjectAccessReviews and an impersonated
/// dry-run create.
pub struct SarValidator {
    reviewer: Arc<dyn AccessReviewer>,
    impersonation: Arc<dyn ImpersonationFactory>,
    requeue_after: Duration,
}

impl SarValidator {
    pub fn new(reviewer: Arc<dyn AccessReviewer>, impersonation: Arc<dyn ImpersonationFactory>) -> Self {
        Self { reviewer, impersonation, requeue_after: DEFAULT_NOT_ALLOWED_REQUEUE }
    }

    pub fn with_requeue(mut self, requeue_after: Duration) -> Self {
        self.requeue_after = requeue_after;
        self
    }

    async fn check_escalation(
        &self,
        user: &str,
        gvr: &GroupVersionResource,
        namespace: &str,
        name: &str,
        obj: Option<&DynamicObject>,
    ) -> Result<(), WorkError> {
        let obj = obj.ok_or_else(|| WorkError::Manifest(format!("missing object for {} {}/{}", gvr, namespace, name)))?;
        let client = self.impersonation.for_user(user)?;
        match client.create(gvr, namespace, obj, true).await {
            Ok(_) => Ok(()),
            Err(e) if e.is_forbidden() => {
                info!(gvr = %gvr, ns = %namespace, name = %name, error = %e, "permission escalation denied");
                counter!("executor_escalation_denied_total", 1u64);
                Err(WorkError::not_allowed(
                    format!(
                        "not allowed to apply the resource {} {}, {} {}, error: permission escalation",
                        gvr.group, gvr.resource, namespace, name
                    ),
                    self.requeue_after,
                ))
            }
            // escalation is checked before existence, so reaching AlreadyExists means it passed
            Err(e) if e.is_already_exists() => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl ExecutorValidator for SarValidator {
    async fn validate(
        &self,
        executor: Option<&ManifestWorkExecutor>,
        gvr: &GroupVersionResource,
        namespace: &str,
        name: &str,
        obj: Option<&DynamicObject>,
        action: ExecuteAction,
    ) -> Result<(), WorkError> {
        let Some(executor) = executor else { return Ok(()) };
        let identity = executor.identity()?;

        for verb in action.verbs() {
            let req = AccessReviewRequest {
                user: identity.user.clone(),
                groups: identity.groups.to_vec(),
                verb: verb.to_string(),
                group: gvr.group.clone(),
                version: gvr.version.clone(),
                resource: gvr.resource.clone(),
                namespace: namespace.to_string(),
                name: name.to_string(),
            };
            counter!("executor_review_total", 1u64);
            let allowed = self.reviewer.review(&req).await?;
            debug!(user = %identity.user, verb, gvr = %gvr, ns = %namespace, name = %name, allowed, "access review");
            if !allowed {
                counter!("executor_denied_total", 1, "action" => action.to_string());
                return Err(WorkError::not_allowed(
                    format!(
                        "not allowed to {} the resource {} {}, {} {}",
                        action, gvr.group, gvr.resource, namespace, name
                    ),
                    self.requeue_after,
                ));
            }
        }

        if action == ExecuteAction::Apply && is_escalation_guarded(gvr) {
            return self.check_escalation(&identity.user, gvr, namespace, name, obj).await;
        }
        Ok(())
    }
}
