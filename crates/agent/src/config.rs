//! Agent knobs, read from `SPOKE_*` environment variables.

use std::{path::PathBuf, str::FromStr, time::Duration};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentConfig {
    /// Hub namespace holding this cluster's ManifestWorks.
    pub cluster_name: Option<String>,
    pub hub_kubeconfig: Option<PathBuf>,
    pub workers: usize,
    pub call_timeout: Duration,
    pub not_allowed_requeue: Duration,
    pub resync: Duration,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            cluster_name: None,
            hub_kubeconfig: None,
            workers: 4,
            call_timeout: Duration::from_secs(30),
            not_allowed_requeue: Duration::from_secs(60),
            resync: Duration::from_secs(300),
        }
    }
}

fn parsed<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T {
    lookup(key).and_then(|s| s.trim().parse::<T>().ok()).unwrap_or(default)
}

impl AgentConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|k| std::env::var(k).ok())
    }

    /// Build from an arbitrary key lookup; unparsable values fall back to
    /// the defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let d = Self::default();
        Self {
            cluster_name: lookup("SPOKE_CLUSTER_NAME").filter(|s| !s.is_empty()),
            hub_kubeconfig: lookup("SPOKE_HUB_KUBECONFIG").filter(|s| !s.is_empty()).map(PathBuf::from),
            workers: parsed(&lookup, "SPOKE_WORKERS", d.workers).max(1),
            call_timeout: Duration::from_secs(parsed(&lookup, "SPOKE_CALL_TIMEOUT_SECS", d.call_timeout.as_secs())),
            not_allowed_requeue: Duration::from_secs(parsed(
                &lookup,
                "SPOKE_NOT_ALLOWED_REQUEUE_SECS",
                d.not_allowed_requeue.as_secs(),
            )),
            resync: Duration::from_secs(parsed(&lookup, "SPOKE_RESYNC_SECS", d.resync.as_secs())),
        }
    }
}
