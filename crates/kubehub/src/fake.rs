//! In-memory spoke API server for tests.
//!
//! [`FakeCluster`] stores objects as JSON, records every call, evaluates a
//! small RBAC model (roles, cluster roles and their bindings) for access
//! reviews and impersonated writes, and supports error injection per verb and
//! object name. [`FakeTypedClient`] plays the work API with resourceVersion
//! conflicts.

use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex, MutexGuard},
};

use async_trait::async_trait;
use k8s_openapi::api::rbac::v1::{PolicyRule, Role, RoleBinding, RoleRef, Subject};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::core::DynamicObject;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use spoke_core::{work::Versioned, ClientError, GroupVersionResource};

use crate::{AccessReviewRequest, AccessReviewer, DeleteOptions, EventRecorder, ImpersonationFactory, ObjectClient};

pub const RBAC_GROUP: &str = "rbac.authorization.k8s.io";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verb {
    Get,
    Create,
    Update,
    Patch,
    Delete,
    Review,
}

/// One recorded call. `user` is set for impersonated calls.
#[derive(Debug, Clone, PartialEq)]
pub struct Action {
    pub verb: Verb,
    pub resource: String,
    pub namespace: String,
    pub name: String,
    pub user: Option<String>,
    pub dry_run: bool,
    pub patch: Option<Value>,
    pub delete: Option<DeleteOptions>,
}

impl Action {
    fn new(verb: Verb, gvr: &GroupVersionResource, namespace: &str, name: &str, user: Option<&str>) -> Self {
        Self {
            verb,
            resource: gvr.resource.clone(),
            namespace: namespace.to_string(),
            name: name.to_string(),
            user: user.map(str::to_string),
            dry_run: false,
            patch: None,
            delete: None,
        }
    }

    /// Persisted mutation by the agent itself.
    pub fn is_write(&self) -> bool {
        self.user.is_none() && !self.dry_run && matches!(self.verb, Verb::Create | Verb::Update | Verb::Patch | Verb::Delete)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedEvent {
    pub reason: String,
    pub note: String,
}

type Key = (String, String, String, String);

fn key(group: &str, resource: &str, namespace: &str, name: &str) -> Key {
    (group.to_string(), resource.to_string(), namespace.to_string(), name.to_string())
}

#[derive(Default)]
struct State {
    objects: BTreeMap<Key, Value>,
    actions: Vec<Action>,
    reviews: Vec<AccessReviewRequest>,
    events: Vec<RecordedEvent>,
    impersonated: Vec<String>,
    failures: Vec<(Verb, String, ClientError)>,
    next_rv: u64,
}

impl State {
    fn failure(&self, verb: Verb, name: &str) -> Result<(), ClientError> {
        match self.failures.iter().find(|(v, n, _)| *v == verb && (n.is_empty() || n == name)) {
            Some((_, _, err)) => Err(err.clone()),
            None => Ok(()),
        }
    }

    fn bump(&mut self) -> String {
        self.next_rv += 1;
        self.next_rv.to_string()
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct RoleView {
    rules: Vec<PolicyRule>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RoleRefView {
    kind: String,
    name: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct SubjectView {
    kind: String,
    name: String,
    namespace: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct BindingView {
    role_ref: RoleRefView,
    subjects: Vec<SubjectView>,
}

fn encode<K: Serialize>(obj: &K) -> Result<Value, ClientError> {
    serde_json::to_value(obj).map_err(|e| ClientError::Other(e.to_string()))
}

fn decode(raw: &Value) -> Result<DynamicObject, ClientError> {
    serde_json::from_value(raw.clone()).map_err(|e| ClientError::Other(e.to_string()))
}

fn meta_str<'a>(raw: &'a Value, field: &str) -> Option<&'a str> {
    raw.get("metadata")?.get(field)?.as_str()
}

fn set_meta(raw: &mut Value, field: &str, value: Value) {
    if let Some(meta) = raw.get_mut("metadata").and_then(Value::as_object_mut) {
        meta.insert(field.to_string(), value);
    }
}

fn has_finalizers(raw: &Value) -> bool {
    raw.pointer("/metadata/finalizers").and_then(Value::as_array).map(|f| !f.is_empty()).unwrap_or(false)
}

/// RFC 7386 merge of `patch` into `target`.
fn json_merge(target: &mut Value, patch: &Value) {
    match patch {
        Value::Object(fields) => {
            if !target.is_object() {
                *target = Value::Object(Map::new());
            }
            if let Value::Object(t) = target {
                for (k, v) in fields {
                    if v.is_null() {
                        t.remove(k);
                    } else {
                        json_merge(t.entry(k.clone()).or_insert(Value::Null), v);
                    }
                }
            }
        }
        other => *target = other.clone(),
    }
}

/// Groups the API server attaches to an authenticated user.
fn groups_for(user: &str) -> Vec<String> {
    let mut groups = Vec::new();
    if let Some(rest) = user.strip_prefix("system:serviceaccount:") {
        let ns = rest.split(':').next().unwrap_or_default();
        groups.push("system:serviceaccounts".to_string());
        groups.push(format!("system:serviceaccounts:{}", ns));
    }
    groups.push("system:authenticated".to_string());
    groups
}

fn subject_matches(s: &SubjectView, user: &str, groups: &[String]) -> bool {
    match s.kind.as_str() {
        "ServiceAccount" => user == format!("system:serviceaccount:{}:{}", s.namespace, s.name),
        "User" => s.name == user,
        "Group" => groups.iter().any(|g| *g == s.name),
        _ => false,
    }
}

fn listed(list: &Option<Vec<String>>, v: &str) -> bool {
    list.as_deref().unwrap_or_default().iter().any(|x| x == "*" || x == v)
}

fn rule_allows(rule: &PolicyRule, verb: &str, group: &str, resource: &str, name: &str) -> bool {
    rule.verbs.iter().any(|v| v == "*" || v == verb)
        && listed(&rule.api_groups, group)
        && listed(&rule.resources, resource)
        && match rule.resource_names.as_deref() {
            None | Some([]) => true,
            Some(names) => !name.is_empty() && names.iter().any(|n| n == name),
        }
}

fn rules_for(state: &State, user: &str, groups: &[String], namespace: &str) -> Vec<PolicyRule> {
    let mut rules = Vec::new();
    for ((group, resource, ns, _), raw) in state.objects.iter() {
        if group != RBAC_GROUP {
            continue;
        }
        let binding_ns = match resource.as_str() {
            "clusterrolebindings" => "",
            "rolebindings" if !namespace.is_empty() && ns == namespace => ns.as_str(),
            _ => continue,
        };
        let Ok(binding) = serde_json::from_value::<BindingView>(raw.clone()) else { continue };
        if !binding.subjects.iter().any(|s| subject_matches(s, user, groups)) {
            continue;
        }
        let role = match binding.role_ref.kind.as_str() {
            "ClusterRole" => state.objects.get(&key(RBAC_GROUP, "clusterroles", "", &binding.role_ref.name)),
            "Role" if !binding_ns.is_empty() => state.objects.get(&key(RBAC_GROUP, "roles", binding_ns, &binding.role_ref.name)),
            _ => None,
        };
        if let Some(view) = role.and_then(|r| serde_json::from_value::<RoleView>(r.clone()).ok()) {
            rules.extend(view.rules);
        }
    }
    rules
}

#[allow(clippy::too_many_arguments)]
fn allowed(state: &State, user: &str, groups: &[String], verb: &str, group: &str, resource: &str, namespace: &str, name: &str) -> bool {
    rules_for(state, user, groups, namespace)
        .iter()
        .any(|r| rule_allows(r, verb, group, resource, name))
}

/// Whether the user already holds every permission `rules` would grant.
fn covers(state: &State, user: &str, groups: &[String], namespace: &str, rules: &[PolicyRule]) -> bool {
    rules.iter().all(|r| {
        let api_groups = r.api_groups.clone().unwrap_or_default();
        let resources = r.resources.clone().unwrap_or_default();
        let names = r.resource_names.clone().filter(|n| !n.is_empty()).unwrap_or_else(|| vec![String::new()]);
        r.verbs.iter().all(|verb| {
            api_groups.iter().all(|g| {
                resources
                    .iter()
                    .all(|res| names.iter().all(|n| allowed(state, user, groups, verb, g, res, namespace, n)))
            })
        })
    })
}

fn check_escalation(state: &State, user: &str, groups: &[String], resource: &str, namespace: &str, raw: &Value) -> Result<(), ClientError> {
    let name = meta_str(raw, "name").unwrap_or_default();
    let forbidden = || {
        ClientError::Forbidden(format!(
            "{} \"{}\" is forbidden: user \"{}\" is attempting to grant RBAC permissions not currently held",
            resource, name, user
        ))
    };
    match resource {
        "roles" | "clusterroles" => {
            if allowed(state, user, groups, "escalate", RBAC_GROUP, resource, namespace, name) {
                return Ok(());
            }
            let role: RoleView = serde_json::from_value(raw.clone()).unwrap_or_default();
            if covers(state, user, groups, namespace, &role.rules) { Ok(()) } else { Err(forbidden()) }
        }
        "rolebindings" | "clusterrolebindings" => {
            let binding: BindingView = serde_json::from_value(raw.clone()).unwrap_or_default();
            let (ref_resource, ref_ns) =
                if binding.role_ref.kind == "ClusterRole" { ("clusterroles", "") } else { ("roles", namespace) };
            if allowed(state, user, groups, "bind", RBAC_GROUP, ref_resource, namespace, &binding.role_ref.name) {
                return Ok(());
            }
            let Some(role) = state.objects.get(&key(RBAC_GROUP, ref_resource, ref_ns, &binding.role_ref.name)) else {
                return Err(ClientError::NotFound(format!("{} \"{}\" not found", ref_resource, binding.role_ref.name)));
            };
            let role: RoleView = serde_json::from_value(role.clone()).unwrap_or_default();
            if covers(state, user, groups, namespace, &role.rules) { Ok(()) } else { Err(forbidden()) }
        }
        _ => Ok(()),
    }
}

fn forbid(user: &str, verb: &str, gvr: &GroupVersionResource, namespace: &str, name: &str) -> ClientError {
    ClientError::Forbidden(format!(
        "{} \"{}\" is forbidden: User \"{}\" cannot {} resource \"{}\" in API group \"{}\" in the namespace \"{}\"",
        gvr.resource, name, user, verb, gvr.resource, gvr.group, namespace
    ))
}

/// Allow-list for `verbs` on `resources` of `api_groups`.
pub fn rule(verbs: &[&str], api_groups: &[&str], resources: &[&str]) -> PolicyRule {
    PolicyRule {
        verbs: verbs.iter().map(|s| s.to_string()).collect(),
        api_groups: Some(api_groups.iter().map(|s| s.to_string()).collect()),
        resources: Some(resources.iter().map(|s| s.to_string()).collect()),
        ..Default::default()
    }
}

/// Like [`rule`], restricted to the given object names.
pub fn named_rule(verbs: &[&str], api_groups: &[&str], resources: &[&str], names: &[&str]) -> PolicyRule {
    PolicyRule { resource_names: Some(names.iter().map(|s| s.to_string()).collect()), ..rule(verbs, api_groups, resources) }
}

pub struct FakeCluster {
    state: Mutex<State>,
}

impl FakeCluster {
    pub fn new() -> Arc<Self> {
        Arc::new(Self { state: Mutex::new(State::default()) })
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Store `obj` as-is, filling in uid and resourceVersion.
    pub fn seed<K: Serialize>(&self, gvr: &GroupVersionResource, obj: &K) -> Result<DynamicObject, ClientError> {
        let mut raw = encode(obj)?;
        let mut st = self.lock();
        let name = meta_str(&raw, "name").unwrap_or_default().to_string();
        let namespace = meta_str(&raw, "namespace").unwrap_or_default().to_string();
        if meta_str(&raw, "uid").is_none() {
            set_meta(&mut raw, "uid", Value::String(uuid::Uuid::new_v4().to_string()));
        }
        let rv = st.bump();
        set_meta(&mut raw, "resourceVersion", Value::String(rv));
        st.objects.insert(key(&gvr.group, &gvr.resource, &namespace, &name), raw.clone());
        decode(&raw)
    }

    pub fn object(&self, gvr: &GroupVersionResource, namespace: &str, name: &str) -> Option<DynamicObject> {
        let st = self.lock();
        st.objects.get(&key(&gvr.group, &gvr.resource, namespace, name)).and_then(|raw| decode(raw).ok())
    }

    pub fn exists(&self, gvr: &GroupVersionResource, namespace: &str, name: &str) -> bool {
        self.lock().objects.contains_key(&key(&gvr.group, &gvr.resource, namespace, name))
    }

    pub fn actions(&self) -> Vec<Action> {
        self.lock().actions.clone()
    }

    /// Non-dry-run mutations issued with the agent's own credentials.
    pub fn writes(&self) -> Vec<Action> {
        self.lock().actions.iter().filter(|a| a.is_write()).cloned().collect()
    }

    pub fn reviews(&self) -> Vec<AccessReviewRequest> {
        self.lock().reviews.clone()
    }

    pub fn events(&self) -> Vec<RecordedEvent> {
        self.lock().events.clone()
    }

    pub fn impersonated_users(&self) -> Vec<String> {
        self.lock().impersonated.clone()
    }

    pub fn clear_actions(&self) {
        let mut st = self.lock();
        st.actions.clear();
        st.reviews.clear();
        st.events.clear();
    }

    /// Fail every `verb` call on `name` (any name when empty) with `err`.
    pub fn fail(&self, verb: Verb, name: &str, err: ClientError) {
        self.lock().failures.push((verb, name.to_string(), err));
    }

    pub fn clear_failures(&self) {
        self.lock().failures.clear();
    }

    pub fn impersonation(self: &Arc<Self>) -> FakeImpersonation {
        FakeImpersonation { cluster: Arc::clone(self) }
    }

    /// Create a namespaced Role with `rules` bound to a service account.
    pub fn grant_role(&self, namespace: &str, role: &str, sa: (&str, &str), rules: Vec<PolicyRule>) -> Result<(), ClientError> {
        let r = Role {
            metadata: ObjectMeta { name: Some(role.to_string()), namespace: Some(namespace.to_string()), ..Default::default() },
            rules: Some(rules),
        };
        self.seed(&GroupVersionResource::new(RBAC_GROUP, "v1", "roles"), &r)?;
        let binding = RoleBinding {
            metadata: ObjectMeta { name: Some(role.to_string()), namespace: Some(namespace.to_string()), ..Default::default() },
            role_ref: RoleRef { api_group: RBAC_GROUP.to_string(), kind: "Role".to_string(), name: role.to_string() },
            subjects: Some(vec![Subject {
                kind: "ServiceAccount".to_string(),
                name: sa.1.to_string(),
                namespace: Some(sa.0.to_string()),
                ..Default::default()
            }]),
        };
        self.seed(&GroupVersionResource::new(RBAC_GROUP, "v1", "rolebindings"), &binding)?;
        Ok(())
    }

    fn get_as(&self, user: Option<&str>, gvr: &GroupVersionResource, namespace: &str, name: &str) -> Result<DynamicObject, ClientError> {
        let mut st = self.lock();
        st.actions.push(Action::new(Verb::Get, gvr, namespace, name, user));
        st.failure(Verb::Get, name)?;
        if let Some(user) = user {
            if !allowed(&st, user, &groups_for(user), "get", &gvr.group, &gvr.resource, namespace, name) {
                return Err(forbid(user, "get", gvr, namespace, name));
            }
        }
        match st.objects.get(&key(&gvr.group, &gvr.resource, namespace, name)) {
            Some(raw) => decode(raw),
            None => Err(ClientError::NotFound(format!("{} \"{}\" not found", gvr.resource, name))),
        }
    }

    fn create_as(
        &self,
        user: Option<&str>,
        gvr: &GroupVersionResource,
        namespace: &str,
        obj: &DynamicObject,
        dry_run: bool,
    ) -> Result<DynamicObject, ClientError> {
        let name = obj.metadata.name.clone().unwrap_or_default();
        let mut st = self.lock();
        let mut action = Action::new(Verb::Create, gvr, namespace, &name, user);
        action.dry_run = dry_run;
        st.actions.push(action);
        st.failure(Verb::Create, &name)?;
        let mut raw = encode(obj)?;
        if let Some(user) = user {
            let groups = groups_for(user);
            if !allowed(&st, user, &groups, "create", &gvr.group, &gvr.resource, namespace, "") {
                return Err(forbid(user, "create", gvr, namespace, &name));
            }
            if gvr.group == RBAC_GROUP {
                check_escalation(&st, user, &groups, &gvr.resource, namespace, &raw)?;
            }
        }
        let k = key(&gvr.group, &gvr.resource, namespace, &name);
        if st.objects.contains_key(&k) {
            return Err(ClientError::AlreadyExists(format!("{} \"{}\" already exists", gvr.resource, name)));
        }
        if !namespace.is_empty() {
            set_meta(&mut raw, "namespace", Value::String(namespace.to_string()));
        }
        set_meta(&mut raw, "uid", Value::String(uuid::Uuid::new_v4().to_string()));
        let rv = st.bump();
        set_meta(&mut raw, "resourceVersion", Value::String(rv));
        if !dry_run {
            st.objects.insert(k, raw.clone());
        }
        decode(&raw)
    }

    fn update_as(&self, user: Option<&str>, gvr: &GroupVersionResource, namespace: &str, obj: &DynamicObject) -> Result<DynamicObject, ClientError> {
        let name = obj.metadata.name.clone().unwrap_or_default();
        let mut st = self.lock();
        st.actions.push(Action::new(Verb::Update, gvr, namespace, &name, user));
        st.failure(Verb::Update, &name)?;
        if let Some(user) = user {
            if !allowed(&st, user, &groups_for(user), "update", &gvr.group, &gvr.resource, namespace, &name) {
                return Err(forbid(user, "update", gvr, namespace, &name));
            }
        }
        let k = key(&gvr.group, &gvr.resource, namespace, &name);
        let Some(current) = st.objects.get(&k).cloned() else {
            return Err(ClientError::NotFound(format!("{} \"{}\" not found", gvr.resource, name)));
        };
        if let Some(rv) = obj.metadata.resource_version.as_deref() {
            if Some(rv) != meta_str(&current, "resourceVersion") {
                return Err(ClientError::Conflict(format!("the object {} has been modified", name)));
            }
        }
        let mut raw = encode(obj)?;
        for field in ["uid", "deletionTimestamp"] {
            if let Some(v) = current.get("metadata").and_then(|m| m.get(field)) {
                set_meta(&mut raw, field, v.clone());
            }
        }
        let rv = st.bump();
        set_meta(&mut raw, "resourceVersion", Value::String(rv));
        if meta_str(&raw, "deletionTimestamp").is_some() && !has_finalizers(&raw) {
            st.objects.remove(&k);
        } else {
            st.objects.insert(k, raw.clone());
        }
        decode(&raw)
    }

    fn patch_as(
        &self,
        user: Option<&str>,
        gvr: &GroupVersionResource,
        namespace: &str,
        name: &str,
        patch: &Value,
    ) -> Result<DynamicObject, ClientError> {
        let mut st = self.lock();
        let mut action = Action::new(Verb::Patch, gvr, namespace, name, user);
        action.patch = Some(patch.clone());
        st.actions.push(action);
        st.failure(Verb::Patch, name)?;
        if let Some(user) = user {
            if !allowed(&st, user, &groups_for(user), "patch", &gvr.group, &gvr.resource, namespace, name) {
                return Err(forbid(user, "patch", gvr, namespace, name));
            }
        }
        let k = key(&gvr.group, &gvr.resource, namespace, name);
        let Some(mut next) = st.objects.get(&k).cloned() else {
            return Err(ClientError::NotFound(format!("{} \"{}\" not found", gvr.resource, name)));
        };
        for field in ["uid", "resourceVersion"] {
            let wanted = patch.get("metadata").and_then(|m| m.get(field)).and_then(Value::as_str);
            if let Some(wanted) = wanted {
                if Some(wanted) != meta_str(&next, field) {
                    return Err(ClientError::Conflict(format!("precondition failed on {} for {}", field, name)));
                }
            }
        }
        json_merge(&mut next, patch);
        let rv = st.bump();
        set_meta(&mut next, "resourceVersion", Value::String(rv));
        if meta_str(&next, "deletionTimestamp").is_some() && !has_finalizers(&next) {
            st.objects.remove(&k);
        } else {
            st.objects.insert(k, next.clone());
        }
        decode(&next)
    }

    fn delete_as(
        &self,
        user: Option<&str>,
        gvr: &GroupVersionResource,
        namespace: &str,
        name: &str,
        opts: &DeleteOptions,
    ) -> Result<(), ClientError> {
        let mut st = self.lock();
        let mut action = Action::new(Verb::Delete, gvr, namespace, name, user);
        action.delete = Some(opts.clone());
        st.actions.push(action);
        st.failure(Verb::Delete, name)?;
        if let Some(user) = user {
            if !allowed(&st, user, &groups_for(user), "delete", &gvr.group, &gvr.resource, namespace, name) {
                return Err(forbid(user, "delete", gvr, namespace, name));
            }
        }
        let k = key(&gvr.group, &gvr.resource, namespace, name);
        let Some(current) = st.objects.get(&k).cloned() else {
            return Err(ClientError::NotFound(format!("{} \"{}\" not found", gvr.resource, name)));
        };
        if let Some(uid) = opts.uid_precondition.as_deref() {
            let live = meta_str(&current, "uid").unwrap_or_default();
            if uid != live {
                return Err(ClientError::Conflict(format!(
                    "Precondition failed: UID in precondition: {}, UID in object meta: {}",
                    uid, live
                )));
            }
        }
        if has_finalizers(&current) {
            if meta_str(&current, "deletionTimestamp").is_none() {
                let mut next = current;
                let now = chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true);
                set_meta(&mut next, "deletionTimestamp", Value::String(now));
                st.objects.insert(k, next);
            }
        } else {
            st.objects.remove(&k);
        }
        Ok(())
    }
}

#[async_trait]
impl ObjectClient for FakeCluster {
    async fn get(&self, gvr: &GroupVersionResource, namespace: &str, name: &str) -> Result<DynamicObject, ClientError> {
        self.get_as(None, gvr, namespace, name)
    }

    async fn create(
        &self,
        gvr: &GroupVersionResource,
        namespace: &str,
        obj: &DynamicObject,
        dry_run: bool,
    ) -> Result<DynamicObject, ClientError> {
        self.create_as(None, gvr, namespace, obj, dry_run)
    }

    async fn update(&self, gvr: &GroupVersionResource, namespace: &str, obj: &DynamicObject) -> Result<DynamicObject, ClientError> {
        self.update_as(None, gvr, namespace, obj)
    }

    async fn patch_merge(
        &self,
        gvr: &GroupVersionResource,
        namespace: &str,
        name: &str,
        patch: &Value,
    ) -> Result<DynamicObject, ClientError> {
        self.patch_as(None, gvr, namespace, name, patch)
    }

    async fn delete(&self, gvr: &GroupVersionResource, namespace: &str, name: &str, opts: &DeleteOptions) -> Result<(), ClientError> {
        self.delete_as(None, gvr, namespace, name, opts)
    }
}

#[async_trait]
impl AccessReviewer for FakeCluster {
    async fn review(&self, req: &AccessReviewRequest) -> Result<bool, ClientError> {
        let mut st = self.lock();
        st.reviews.push(req.clone());
        st.failure(Verb::Review, &req.name)?;
        Ok(allowed(&st, &req.user, &req.groups, &req.verb, &req.group, &req.resource, &req.namespace, &req.name))
    }
}

#[async_trait]
impl EventRecorder for FakeCluster {
    async fn record(&self, reason: &str, note: String) {
        self.lock().events.push(RecordedEvent { reason: reason.to_string(), note });
    }
}

pub struct FakeImpersonation {
    cluster: Arc<FakeCluster>,
}

impl ImpersonationFactory for FakeImpersonation {
    fn for_user(&self, user: &str) -> Result<Arc<dyn ObjectClient>, ClientError> {
        self.cluster.lock().impersonated.push(user.to_string());
        Ok(Arc::new(ImpersonatedClient { cluster: Arc::clone(&self.cluster), user: user.to_string() }))
    }
}

struct ImpersonatedClient {
    cluster: Arc<FakeCluster>,
    user: String,
}

#[async_trait]
impl ObjectClient for ImpersonatedClient {
    async fn get(&self, gvr: &GroupVersionResource, namespace: &str, name: &str) -> Result<DynamicObject, ClientError> {
        self.cluster.get_as(Some(&self.user), gvr, namespace, name)
    }

    async fn create(
        &self,
        gvr: &GroupVersionResource,
        namespace: &str,
        obj: &DynamicObject,
        dry_run: bool,
    ) -> Result<DynamicObject, ClientError> {
        self.cluster.create_as(Some(&self.user), gvr, namespace, obj, dry_run)
    }

    async fn update(&self, gvr: &GroupVersionResource, namespace: &str, obj: &DynamicObject) -> Result<DynamicObject, ClientError> {
        self.cluster.update_as(Some(&self.user), gvr, namespace, obj)
    }

    async fn patch_merge(
        &self,
        gvr: &GroupVersionResource,
        namespace: &str,
        name: &str,
        patch: &Value,
    ) -> Result<DynamicObject, ClientError> {
        self.cluster.patch_as(Some(&self.user), gvr, namespace, name, patch)
    }

    async fn delete(&self, gvr: &GroupVersionResource, namespace: &str, name: &str, opts: &DeleteOptions) -> Result<(), ClientError> {
        self.cluster.delete_as(Some(&self.user), gvr, namespace, name, opts)
    }
}

struct TypedState<T> {
    objects: BTreeMap<String, T>,
    next_rv: u64,
    status_conflicts: u32,
    status_error: Option<ClientError>,
    status_writes: usize,
    updates: usize,
}

/// Work API stand-in keyed by object name.
pub struct FakeTypedClient<T: Versioned> {
    state: Mutex<TypedState<T>>,
}

impl<T: Versioned> Default for FakeTypedClient<T> {
    fn default() -> Self {
        Self {
            state: Mutex::new(TypedState {
                objects: BTreeMap::new(),
                next_rv: 0,
                status_conflicts: 0,
                status_error: None,
                status_writes: 0,
                updates: 0,
            }),
        }
    }
}

impl<T: Versioned> FakeTypedClient<T> {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> MutexGuard<'_, TypedState<T>> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Store `obj`, filling in uid and resourceVersion.
    pub fn insert(&self, mut obj: T) -> T {
        let mut st = self.lock();
        st.next_rv += 1;
        let meta = obj.meta_mut();
        if meta.uid.is_empty() {
            meta.uid = uuid::Uuid::new_v4().to_string();
        }
        meta.resource_version = Some(st.next_rv.to_string());
        st.objects.insert(obj.meta().name.clone(), obj.clone());
        obj
    }

    pub fn object(&self, name: &str) -> Option<T> {
        self.lock().objects.get(name).cloned()
    }

    pub fn remove(&self, name: &str) -> Option<T> {
        self.lock().objects.remove(name)
    }

    /// The next `n` status writes fail with a conflict, as if another writer
    /// got in first.
    pub fn inject_status_conflicts(&self, n: u32) {
        self.lock().status_conflicts = n;
    }

    pub fn fail_status(&self, err: ClientError) {
        self.lock().status_error = Some(err);
    }

    pub fn status_writes(&self) -> usize {
        self.lock().status_writes
    }

    pub fn updates(&self) -> usize {
        self.lock().updates
    }
}

fn stale(expected: &Option<String>, current: &Option<String>) -> bool {
    expected.is_some() && expected != current
}

#[async_trait]
impl<T: Versioned> crate::TypedClient<T> for FakeTypedClient<T> {
    async fn get(&self, name: &str) -> Result<T, ClientError> {
        self.lock()
            .objects
            .get(name)
            .cloned()
            .ok_or_else(|| ClientError::NotFound(format!("{} \"{}\" not found", T::gvr().resource, name)))
    }

    async fn create(&self, obj: &T) -> Result<T, ClientError> {
        let name = obj.meta().name.clone();
        if self.lock().objects.contains_key(&name) {
            return Err(ClientError::AlreadyExists(format!("{} \"{}\" already exists", T::gvr().resource, name)));
        }
        Ok(self.insert(obj.clone()))
    }

    async fn update(&self, obj: &T) -> Result<T, ClientError> {
        let mut st = self.lock();
        let name = obj.meta().name.clone();
        let Some(current) = st.objects.get(&name).cloned() else {
            return Err(ClientError::NotFound(format!("{} \"{}\" not found", T::gvr().resource, name)));
        };
        if stale(&obj.meta().resource_version, &current.meta().resource_version) {
            return Err(ClientError::Conflict(format!("the object {} has been modified", name)));
        }
        st.next_rv += 1;
        st.updates += 1;
        let mut next = obj.clone();
        *next.status_mut() = current.status().clone();
        next.meta_mut().uid = current.meta().uid.clone();
        next.meta_mut().deletion_timestamp = current.meta().deletion_timestamp;
        next.meta_mut().resource_version = Some(st.next_rv.to_string());
        if next.meta().deletion_timestamp.is_some() && next.meta().finalizers.is_empty() {
            st.objects.remove(&name);
        } else {
            st.objects.insert(name, next.clone());
        }
        Ok(next)
    }

    async fn update_status(&self, obj: &T) -> Result<T, ClientError> {
        let mut st = self.lock();
        let name = obj.meta().name.clone();
        if let Some(err) = st.status_error.clone() {
            return Err(err);
        }
        if st.status_conflicts > 0 {
            st.status_conflicts -= 1;
            st.next_rv += 1;
            let rv = st.next_rv.to_string();
            if let Some(current) = st.objects.get_mut(&name) {
                current.meta_mut().resource_version = Some(rv);
            }
            return Err(ClientError::Conflict(format!("the object {} has been modified", name)));
        }
        let Some(current) = st.objects.get(&name).cloned() else {
            return Err(ClientError::NotFound(format!("{} \"{}\" not found", T::gvr().resource, name)));
        };
        if stale(&obj.meta().resource_version, &current.meta().resource_version) {
            return Err(ClientError::Conflict(format!("the object {} has been modified", name)));
        }
        st.next_rv += 1;
        st.status_writes += 1;
        let mut next = current;
        *next.status_mut() = obj.status().clone();
        next.meta_mut().resource_version = Some(st.next_rv.to_string());
        st.objects.insert(name, next.clone());
        Ok(next)
    }
}
