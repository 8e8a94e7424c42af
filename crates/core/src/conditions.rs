//! Manifest condition merging.
//!
//! Fresh conditions are computed from scratch on every pass; merging them with
//! the recorded ones keeps status feedback and transition timestamps stable.

use chrono::{DateTime, SubsecRound, Utc};
use rustc_hash::{FxHashMap, FxHashSet};

use crate::{Condition, ManifestCondition, ManifestResourceMeta, ResourceIdentity};

/// Merge recorded manifest conditions with freshly computed ones, stamping
/// new transitions with the current time.
pub fn merge_manifest_conditions(existing: &[ManifestCondition], fresh: &[ManifestCondition]) -> Vec<ManifestCondition> {
    merge_manifest_conditions_at(existing, fresh, Utc::now())
}

/// [`merge_manifest_conditions`] with an explicit clock.
///
/// Matching: first on the full [`ManifestResourceMeta`] (ordinal included),
/// then on the ordinal-free [`ResourceIdentity`]. Ordinal-free keys shared by
/// more than one existing record are unmatchable. Output follows `fresh`;
/// unmatched existing records are dropped.
pub fn merge_manifest_conditions_at(
    existing: &[ManifestCondition],
    fresh: &[ManifestCondition],
    now: DateTime<Utc>,
) -> Vec<ManifestCondition> {
    let now = now.trunc_subsecs(0);

    let mut by_meta: FxHashMap<&ManifestResourceMeta, &ManifestCondition> = FxHashMap::default();
    let mut by_identity: FxHashMap<&ResourceIdentity, &ManifestCondition> = FxHashMap::default();
    let mut duplicated: FxHashSet<&ResourceIdentity> = FxHashSet::default();
    for cond in existing {
        by_meta.insert(&cond.resource_meta, cond);
        let identity = &cond.resource_meta.identity;
        if identity.is_empty() {
            continue;
        }
        if by_identity.insert(identity, cond).is_some() {
            duplicated.insert(identity);
        }
    }
    for identity in duplicated {
        by_identity.remove(identity);
    }

    fresh
        .iter()
        .map(|new| {
            let matched = by_meta
                .get(&new.resource_meta)
                .or_else(|| by_identity.get(&new.resource_meta.identity))
                .copied();
            match matched {
                Some(old) => ManifestCondition {
                    resource_meta: new.resource_meta.clone(),
                    // feedback values are refreshed by the status feedback path, not here
                    status_feedbacks: old.status_feedbacks.clone(),
                    conditions: merge_status_conditions_at(&old.conditions, &new.conditions, now),
                },
                None => {
                    let mut new = new.clone();
                    for c in new.conditions.iter_mut() {
                        c.last_transition_time = Some(now);
                    }
                    new
                }
            }
        })
        .collect()
}

/// Merge a condition list: the result holds exactly the types in `fresh`,
/// in `fresh` order.
pub fn merge_status_conditions(existing: &[Condition], fresh: &[Condition]) -> Vec<Condition> {
    merge_status_conditions_at(existing, fresh, Utc::now().trunc_subsecs(0))
}

fn merge_status_conditions_at(existing: &[Condition], fresh: &[Condition], now: DateTime<Utc>) -> Vec<Condition> {
    let mut merged: Vec<Condition> = Vec::with_capacity(fresh.len());
    for cond in fresh {
        let prior = existing.iter().find(|c| c.type_ == cond.type_).cloned();
        let mut next = prior.unwrap_or_else(|| Condition { last_transition_time: None, ..cond.clone() });
        apply_condition(&mut next, cond, now);
        merged.push(next);
    }
    merged
}

/// Upsert `cond` into `conditions` by type.
pub fn set_condition(conditions: &mut Vec<Condition>, cond: Condition) {
    let now = Utc::now().trunc_subsecs(0);
    match conditions.iter_mut().find(|c| c.type_ == cond.type_) {
        Some(existing) => apply_condition(existing, &cond, now),
        None => {
            let stamp = cond.last_transition_time.unwrap_or(now);
            conditions.push(Condition { last_transition_time: Some(stamp), ..cond });
        }
    }
}

fn apply_condition(target: &mut Condition, fresh: &Condition, now: DateTime<Utc>) {
    if target.last_transition_time.is_none() || target.status != fresh.status {
        target.status = fresh.status;
        target.last_transition_time = Some(fresh.last_transition_time.unwrap_or(now));
    }
    target.reason = fresh.reason.clone();
    target.message = fresh.message.clone();
}
