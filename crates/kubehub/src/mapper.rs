//! Kind → resource mapping for manifests.

use anyhow::{anyhow, Result};
use kube::{
    core::{DynamicObject, GroupVersionKind},
    discovery::{Discovery, Scope},
    Client,
};
use rustc_hash::FxHashMap;
use spoke_core::GroupVersionResource;
use tracing::info;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mapping {
    pub gvr: GroupVersionResource,
    pub namespaced: bool,
}

pub trait RestMapping: Send + Sync {
    fn mapping_for(&self, gvk: &GroupVersionKind) -> Option<Mapping>;

    fn kind_of(&self, obj: &DynamicObject) -> Option<GroupVersionKind> {
        gvk_of(obj)
    }
}

/// Group/version/kind declared by an object's `apiVersion` and `kind`.
pub fn gvk_of(obj: &DynamicObject) -> Option<GroupVersionKind> {
    let types = obj.types.as_ref()?;
    if types.kind.is_empty() || types.api_version.is_empty() {
        return None;
    }
    let (group, version) = match types.api_version.split_once('/') {
        Some((g, v)) => (g.to_string(), v.to_string()),
        None => (String::new(), types.api_version.clone()),
    };
    Some(GroupVersionKind { group, version, kind: types.kind.clone() })
}

type GvkKey = (String, String, String);

/// Static kind table, optionally extended from API discovery.
#[derive(Debug, Clone, Default)]
pub struct ResourceMapper {
    entries: FxHashMap<GvkKey, Mapping>,
}

const BUILTIN: &[(&str, &str, &str, &str, bool)] = &[
    ("", "v1", "ConfigMap", "configmaps", true),
    ("", "v1", "Secret", "secrets", true),
    ("", "v1", "Service", "services", true),
    ("", "v1", "ServiceAccount", "serviceaccounts", true),
    ("", "v1", "Pod", "pods", true),
    ("", "v1", "PersistentVolumeClaim", "persistentvolumeclaims", true),
    ("", "v1", "Namespace", "namespaces", false),
    ("apps", "v1", "Deployment", "deployments", true),
    ("apps", "v1", "StatefulSet", "statefulsets", true),
    ("apps", "v1", "DaemonSet", "daemonsets", true),
    ("batch", "v1", "Job", "jobs", true),
    ("batch", "v1", "CronJob", "cronjobs", true),
    ("networking.k8s.io", "v1", "Ingress", "ingresses", true),
    ("networking.k8s.io", "v1", "NetworkPolicy", "networkpolicies", true),
    ("rbac.authorization.k8s.io", "v1", "Role", "roles", true),
    ("rbac.authorization.k8s.io", "v1", "RoleBinding", "rolebindings", true),
    ("rbac.authorization.k8s.io", "v1", "ClusterRole", "clusterroles", false),
    ("rbac.authorization.k8s.io", "v1", "ClusterRoleBinding", "clusterrolebindings", false),
    ("apiextensions.k8s.io", "v1", "CustomResourceDefinition", "customresourcedefinitions", false),
];

impl ResourceMapper {
    /// Mapper preloaded with the built-in kinds.
    pub fn builtin() -> Self {
        let mut m = Self::default();
        for (group, version, kind, resource, namespaced) in BUILTIN {
            m.insert(group, version, kind, resource, *namespaced);
        }
        m
    }

    pub fn insert(&mut self, group: &str, version: &str, kind: &str, resource: &str, namespaced: bool) {
        self.entries.insert(
            (group.to_string(), version.to_string(), kind.to_string()),
            Mapping { gvr: GroupVersionResource::new(group, version, resource), namespaced },
        );
    }

    /// Built-in kinds plus everything the API server serves (CRDs included).
    pub async fn discover(client: Client) -> Result<Self> {
        let mut m = Self::builtin();
        let discovery = Discovery::new(client).run().await?;
        for group in discovery.groups() {
            for (ar, caps) in group.recommended_resources() {
                let namespaced = matches!(caps.scope, Scope::Namespaced);
                m.insert(&ar.group, &ar.version, &ar.kind, &ar.plural, namespaced);
            }
        }
        info!(kinds = m.entries.len(), "resource mapper ready");
        Ok(m)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn require(&self, gvk: &GroupVersionKind) -> Result<Mapping> {
        self.mapping_for(gvk)
            .ok_or_else(|| anyhow!("no mapping for {}/{}/{}", gvk.group, gvk.version, gvk.kind))
    }
}

impl RestMapping for ResourceMapper {
    fn mapping_for(&self, gvk: &GroupVersionKind) -> Option<Mapping> {
        self.entries.get(&(gvk.group.clone(), gvk.version.clone(), gvk.kind.clone())).cloned()
    }
}
