//! Owner references of applied resources.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::core::DynamicObject;
use serde_json::{json, Map, Value};
use spoke_core::{
    work::{AppliedManifestWork, WORK_GROUP, WORK_VERSION},
    ClientError, GroupVersionResource,
};
use spoke_kubehub::ObjectClient;
use tracing::debug;

/// Suffix on an owner UID asking [`merge_owner_refs`] to remove that owner.
pub const REMOVAL_MARKER: char = '-';

/// Owner reference every resource applied for `applied` carries.
pub fn applied_work_owner(applied: &AppliedManifestWork) -> OwnerReference {
    OwnerReference {
        api_version: format!("{}/{}", WORK_GROUP, WORK_VERSION),
        kind: "AppliedManifestWork".to_string(),
        name: applied.metadata.name.clone(),
        uid: applied.metadata.uid.clone(),
        ..Default::default()
    }
}

pub fn removal_owner(owner: &OwnerReference) -> OwnerReference {
    OwnerReference { uid: format!("{}{}", owner.uid, REMOVAL_MARKER), ..owner.clone() }
}

pub fn is_owned_by(owner: &OwnerReference, owners: &[OwnerReference]) -> bool {
    owners.iter().any(|o| o.uid == owner.uid)
}

fn same_owner(a: &OwnerReference, b: &OwnerReference) -> bool {
    let group = |r: &OwnerReference| r.api_version.split_once('/').map(|(g, _)| g.to_string()).unwrap_or_default();
    a.uid == b.uid && a.kind == b.kind && a.name == b.name && group(a) == group(b)
}

/// Merge `required` into `existing`: add missing owners, replace changed
/// ones and drop those marked for removal. Returns whether anything changed.
pub fn merge_owner_refs(existing: &mut Vec<OwnerReference>, required: &[OwnerReference]) -> bool {
    let mut modified = false;
    for o in required {
        let (wanted, remove) = match o.uid.strip_suffix(REMOVAL_MARKER) {
            Some(uid) => (OwnerReference { uid: uid.to_string(), ..o.clone() }, true),
            None => (o.clone(), false),
        };
        match existing.iter().position(|e| same_owner(e, &wanted)) {
            Some(i) if remove => {
                existing.remove(i);
                modified = true;
            }
            Some(i) => {
                if existing[i] != wanted {
                    existing[i] = wanted;
                    modified = true;
                }
            }
            None if remove => {}
            None => {
                existing.push(wanted);
                modified = true;
            }
        }
    }
    modified
}

/// Merge-patch the owner list of `existing` with `required`, carrying its
/// uid and resourceVersion as preconditions. No call is made when the list
/// would not change.
pub async fn apply_owner_references(
    client: &dyn ObjectClient,
    gvr: &GroupVersionResource,
    existing: &DynamicObject,
    required: &OwnerReference,
) -> Result<bool, ClientError> {
    let mut owners = existing.metadata.owner_references.clone().unwrap_or_default();
    if !merge_owner_refs(&mut owners, std::slice::from_ref(required)) {
        return Ok(false);
    }
    let mut meta = Map::new();
    if let Some(uid) = &existing.metadata.uid {
        meta.insert("uid".into(), Value::String(uid.clone()));
    }
    if let Some(rv) = &existing.metadata.resource_version {
        meta.insert("resourceVersion".into(), Value::String(rv.clone()));
    }
    meta.insert("ownerReferences".into(), json!(owners));
    let patch = json!({ "metadata": meta });

    let namespace = existing.metadata.namespace.clone().unwrap_or_default();
    let name = existing.metadata.name.clone().unwrap_or_default();
    debug!(gvr = %gvr, ns = %namespace, name = %name, patch = %patch, "patching owner references");
    client.patch_merge(gvr, &namespace, &name, &patch).await?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn owner(uid: &str, name: &str) -> OwnerReference {
        OwnerReference {
            api_version: "work.open-cluster-management.io/v1".into(),
            kind: "AppliedManifestWork".into(),
            name: name.into(),
            uid: uid.into(),
            ..Default::default()
        }
    }

    #[test]
    fn merge_adds_missing_owner() {
        let mut existing = vec![owner("a", "one")];
        assert!(merge_owner_refs(&mut existing, &[owner("b", "two")]));
        assert_eq!(existing.len(), 2);
        assert!(!merge_owner_refs(&mut existing, &[owner("b", "two")]));
    }

    #[test]
    fn merge_replaces_changed_owner() {
        let mut existing = vec![owner("a", "one")];
        let mut changed = owner("a", "one");
        changed.block_owner_deletion = Some(true);
        assert!(merge_owner_refs(&mut existing, &[changed.clone()]));
        assert_eq!(existing, vec![changed]);
    }

    #[test]
    fn removal_marker_strips_only_that_owner() {
        let ours = owner("a", "one");
        let theirs = OwnerReference { kind: "Deployment".into(), api_version: "apps/v1".into(), ..owner("b", "dep") };
        let mut existing = vec![ours.clone(), theirs.clone()];
        assert!(merge_owner_refs(&mut existing, &[removal_owner(&ours)]));
        assert_eq!(existing, vec![theirs]);
        // absent owner marked for removal is a no-op
        assert!(!merge_owner_refs(&mut existing, &[removal_owner(&ours)]));
    }

    #[test]
    fn ownership_is_by_uid() {
        let ours = owner("a", "one");
        assert!(is_owned_by(&ours, &[owner("x", "x"), owner("a", "renamed")]));
        assert!(!is_owned_by(&ours, &[owner("x", "x")]));
    }

    #[test]
    fn applied_work_owner_points_at_applied_work() {
        let mut applied = AppliedManifestWork::new("hash", "work");
        applied.metadata.uid = "u1".into();
        let o = applied_work_owner(&applied);
        assert_eq!(o.name, "hash-work");
        assert_eq!(o.uid, "u1");
        assert_eq!(o.kind, "AppliedManifestWork");
    }
}
