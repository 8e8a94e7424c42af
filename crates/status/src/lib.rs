//! Spoke status – persist status with optimistic-concurrency retry.
//!
//! Update functions run against a copy of the current status. Nothing is
//! written when they leave it unchanged; on a write conflict the object is
//! re-fetched and every function runs again, so they must be idempotent.

#![forbid(unsafe_code)]

use std::{sync::Arc, time::Duration};

use metrics::counter;
use spoke_core::{
    merge_manifest_conditions, set_condition,
    work::{AppliedManifestWorkStatus, ManifestWorkStatus, Versioned},
    AppliedResourceMeta, Condition, ManifestCondition, WorkError,
};
use spoke_kubehub::TypedClient;
use tracing::{debug, warn};

pub type UpdateFn<S> = Box<dyn Fn(&mut S) -> Result<(), WorkError> + Send + Sync>;

/// Bounded exponential backoff for conflicting status writes.
#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Total write attempts, the first included.
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_secs(1),
            backoff_multiplier: 5.0,
        }
    }
}

pub struct StatusUpdater<T: Versioned> {
    client: Arc<dyn TypedClient<T>>,
    retry: RetryConfig,
}

impl<T: Versioned> StatusUpdater<T> {
    pub fn new(client: Arc<dyn TypedClient<T>>) -> Self {
        Self { client, retry: RetryConfig::default() }
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Returns the resulting status and whether it was written.
    pub async fn update(&self, current: &T, fns: &[UpdateFn<T::Status>]) -> Result<(T::Status, bool), WorkError> {
        let mut obj = current.clone();
        let mut attempt = 0u32;
        let mut delay = self.retry.initial_delay;

        loop {
            attempt += 1;
            let before = obj.status().clone();
            let mut next = before.clone();
            for f in fns {
                f(&mut next)?;
            }
            if next == before {
                return Ok((next, false));
            }

            *obj.status_mut() = next.clone();
            match self.client.update_status(&obj).await {
                Ok(_) => {
                    counter!("status_update_total", 1u64);
                    debug!(gvr = %T::gvr(), name = %obj.meta().name, attempt, "status updated");
                    return Ok((next, true));
                }
                Err(e) if e.is_conflict() && attempt < self.retry.max_attempts => {
                    counter!("status_conflict_total", 1u64);
                    warn!(gvr = %T::gvr(), name = %obj.meta().name, attempt, delay_ms = delay.as_millis() as u64, "status conflict, retrying");
                    tokio::time::sleep(delay).await;
                    delay = Duration::from_secs_f64(
                        (delay.as_secs_f64() * self.retry.backoff_multiplier).min(self.retry.max_delay.as_secs_f64()),
                    );
                    obj = self.client.get(&current.meta().name).await?;
                }
                Err(e) => {
                    if e.is_conflict() {
                        counter!("status_conflict_total", 1u64);
                    }
                    return Err(e.into());
                }
            }
        }
    }
}

/// Merge freshly computed manifest conditions into the recorded ones.
pub fn merge_manifest_status(fresh: Vec<ManifestCondition>) -> UpdateFn<ManifestWorkStatus> {
    Box::new(move |status: &mut ManifestWorkStatus| {
        status.resource_status.manifests = merge_manifest_conditions(&status.resource_status.manifests, &fresh);
        Ok(())
    })
}

pub fn set_work_conditions(conditions: Vec<Condition>) -> UpdateFn<ManifestWorkStatus> {
    Box::new(move |status: &mut ManifestWorkStatus| {
        for c in &conditions {
            set_condition(&mut status.conditions, c.clone());
        }
        Ok(())
    })
}

pub fn set_applied_resources(resources: Vec<AppliedResourceMeta>) -> UpdateFn<AppliedManifestWorkStatus> {
    Box::new(move |status: &mut AppliedManifestWorkStatus| {
        status.applied_resources = resources.clone();
        Ok(())
    })
}
