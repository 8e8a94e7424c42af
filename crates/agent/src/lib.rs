//! Spoke agent – the ManifestWork controller, its queue and worker pool.

#![forbid(unsafe_code)]

use std::{sync::Arc, time::Duration};

use futures::future::join_all;
use metrics::counter;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub mod check;
pub mod config;
pub mod controller;
pub mod queue;

pub use config::AgentConfig;
pub use controller::{should_requeue, Clients, WorkController, PENDING_REQUEUE};
pub use queue::WorkQueue;

/// Drain `queue` with `workers` concurrent tasks until `cancel` fires.
/// Transient failures back off; other failures come back after `resync`.
pub async fn run_workers(
    controller: Arc<WorkController>,
    queue: Arc<WorkQueue<String>>,
    workers: usize,
    resync: Duration,
    cancel: CancellationToken,
) {
    let shutdown = {
        let queue = queue.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            cancel.cancelled().await;
            queue.shut_down();
        })
    };

    let tasks = (0..workers.max(1)).map(|id| {
        let controller = controller.clone();
        let queue = queue.clone();
        tokio::spawn(async move {
            debug!(worker = id, "worker started");
            while let Some(name) = queue.get().await {
                process(&controller, &queue, &name, resync).await;
                queue.done(&name);
            }
            debug!(worker = id, "worker stopped");
        })
    });
    join_all(tasks).await;
    shutdown.abort();
    info!("workers stopped");
}

async fn process(controller: &WorkController, queue: &Arc<WorkQueue<String>>, name: &str, resync: Duration) {
    let key = name.to_string();
    match controller.reconcile(name).await {
        Ok(None) => queue.forget(&key),
        Ok(Some(after)) => {
            queue.forget(&key);
            debug!(work = name, after_ms = after.as_millis() as u64, "requeue requested");
            queue.add_after(key, after);
        }
        Err(e) if e.is_transient() => {
            counter!("work_reconcile_err", 1u64);
            let delay = queue.add_rate_limited(key);
            warn!(work = name, error = %e, retry_ms = delay.as_millis() as u64, "reconcile failed, retrying");
        }
        Err(e) => {
            counter!("work_reconcile_err", 1u64);
            error!(work = name, error = %e, "reconcile failed");
            queue.forget(&key);
            queue.add_after(key, resync);
        }
    }
}
