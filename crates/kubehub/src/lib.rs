//! Spoke kubehub – collaborator interfaces and their kube-rs implementations.
//!
//! The reconciliation crates only see the traits in this module; the kube
//! backed types below and the in-memory [`fake`] cluster are interchangeable.

#![forbid(unsafe_code)]

use std::{future::Future, marker::PhantomData, sync::Arc, time::Duration};

use async_trait::async_trait;
use k8s_openapi::api::{
    authorization::v1::{ResourceAttributes, SubjectAccessReview, SubjectAccessReviewSpec},
    core::v1::ObjectReference,
};
use kube::{
    api::{Api, DeleteParams, Patch, PatchParams, PostParams, Preconditions, PropagationPolicy},
    core::{ApiResource, DynamicObject},
    runtime::events::{Event, EventType, Recorder, Reporter},
    Client,
};
use serde::{de::DeserializeOwned, Serialize};
use spoke_core::{work::Versioned, ClientError, GroupVersionResource};
use tracing::{debug, info, warn};

pub mod fake;
pub mod mapper;

pub use mapper::{gvk_of, Mapping, ResourceMapper, RestMapping};

pub const FIELD_MANAGER: &str = "spoke-agent";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Propagation {
    #[default]
    Background,
    Foreground,
    Orphan,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeleteOptions {
    /// Delete only if the live object still has this UID.
    pub uid_precondition: Option<String>,
    pub propagation: Propagation,
}

/// Generic object access against one cluster.
#[async_trait]
pub trait ObjectClient: Send + Sync {
    async fn get(&self, gvr: &GroupVersionResource, namespace: &str, name: &str) -> Result<DynamicObject, ClientError>;
    async fn create(
        &self,
        gvr: &GroupVersionResource,
        namespace: &str,
        obj: &DynamicObject,
        dry_run: bool,
    ) -> Result<DynamicObject, ClientError>;
    async fn update(&self, gvr: &GroupVersionResource, namespace: &str, obj: &DynamicObject) -> Result<DynamicObject, ClientError>;
    /// JSON merge patch (RFC 7386).
    async fn patch_merge(
        &self,
        gvr: &GroupVersionResource,
        namespace: &str,
        name: &str,
        patch: &serde_json::Value,
    ) -> Result<DynamicObject, ClientError>;
    async fn delete(&self, gvr: &GroupVersionResource, namespace: &str, name: &str, opts: &DeleteOptions) -> Result<(), ClientError>;
}

/// One access-review question: may `user` (with `groups`) perform `verb` on
/// the addressed resource?
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessReviewRequest {
    pub user: String,
    pub groups: Vec<String>,
    pub verb: String,
    pub group: String,
    pub version: String,
    pub resource: String,
    pub namespace: String,
    pub name: String,
}

#[async_trait]
pub trait AccessReviewer: Send + Sync {
    async fn review(&self, req: &AccessReviewRequest) -> Result<bool, ClientError>;
}

/// Builds object clients that authenticate as another user.
pub trait ImpersonationFactory: Send + Sync {
    fn for_user(&self, user: &str) -> Result<Arc<dyn ObjectClient>, ClientError>;
}

/// Typed access to the work objects (hub ManifestWork, spoke AppliedManifestWork).
#[async_trait]
pub trait TypedClient<T: Versioned>: Send + Sync {
    async fn get(&self, name: &str) -> Result<T, ClientError>;
    async fn create(&self, obj: &T) -> Result<T, ClientError>;
    async fn update(&self, obj: &T) -> Result<T, ClientError>;
    /// Write the status subresource; conflicts when `obj` carries a stale
    /// resourceVersion.
    async fn update_status(&self, obj: &T) -> Result<T, ClientError>;
}

#[async_trait]
pub trait EventRecorder: Send + Sync {
    async fn record(&self, reason: &str, note: String);
}

/// Map a kube client error onto the shared taxonomy.
pub fn classify(err: kube::Error) -> ClientError {
    match err {
        kube::Error::Api(resp) => match (resp.code, resp.reason.as_str()) {
            (404, _) => ClientError::NotFound(resp.message),
            (409, "AlreadyExists") => ClientError::AlreadyExists(resp.message),
            (409, _) => ClientError::Conflict(resp.message),
            (403, _) => ClientError::Forbidden(resp.message),
            (code, reason) => ClientError::Other(format!("{} ({}): {}", reason, code, resp.message)),
        },
        other => ClientError::Other(other.to_string()),
    }
}

async fn timed<T, F>(timeout: Duration, fut: F) -> Result<T, ClientError>
where
    F: Future<Output = Result<T, kube::Error>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(res) => res.map_err(classify),
        Err(_) => Err(ClientError::Timeout(timeout)),
    }
}

fn api_resource(gvr: &GroupVersionResource) -> ApiResource {
    let api_version = if gvr.group.is_empty() { gvr.version.clone() } else { format!("{}/{}", gvr.group, gvr.version) };
    ApiResource {
        group: gvr.group.clone(),
        version: gvr.version.clone(),
        api_version,
        kind: String::new(),
        plural: gvr.resource.clone(),
    }
}

fn dynamic_api(client: &Client, gvr: &GroupVersionResource, namespace: &str) -> Api<DynamicObject> {
    let ar = api_resource(gvr);
    if namespace.is_empty() {
        Api::all_with(client.clone(), &ar)
    } else {
        Api::namespaced_with(client.clone(), namespace, &ar)
    }
}

fn non_empty(s: &str) -> Option<String> {
    if s.is_empty() { None } else { Some(s.to_string()) }
}

/// [`ObjectClient`] over a kube [`Client`]; every call is bounded by `timeout`.
#[derive(Clone)]
pub struct KubeObjectClient {
    client: Client,
    timeout: Duration,
}

impl KubeObjectClient {
    pub fn new(client: Client, timeout: Duration) -> Self {
        Self { client, timeout }
    }
}

#[async_trait]
impl ObjectClient for KubeObjectClient {
    async fn get(&self, gvr: &GroupVersionResource, namespace: &str, name: &str) -> Result<DynamicObject, ClientError> {
        let api = dynamic_api(&self.client, gvr, namespace);
        timed(self.timeout, api.get(name)).await
    }

    async fn create(
        &self,
        gvr: &GroupVersionResource,
        namespace: &str,
        obj: &DynamicObject,
        dry_run: bool,
    ) -> Result<DynamicObject, ClientError> {
        let api = dynamic_api(&self.client, gvr, namespace);
        let pp = PostParams { dry_run, field_manager: Some(FIELD_MANAGER.to_string()) };
        timed(self.timeout, api.create(&pp, obj)).await
    }

    async fn update(&self, gvr: &GroupVersionResource, namespace: &str, obj: &DynamicObject) -> Result<DynamicObject, ClientError> {
        let name = obj.metadata.name.clone().unwrap_or_default();
        let api = dynamic_api(&self.client, gvr, namespace);
        let pp = PostParams { dry_run: false, field_manager: Some(FIELD_MANAGER.to_string()) };
        timed(self.timeout, api.replace(&name, &pp, obj)).await
    }

    async fn patch_merge(
        &self,
        gvr: &GroupVersionResource,
        namespace: &str,
        name: &str,
        patch: &serde_json::Value,
    ) -> Result<DynamicObject, ClientError> {
        debug!(gvr = %gvr, ns = %namespace, name = %name, patch = %patch, "merge patch");
        let api = dynamic_api(&self.client, gvr, namespace);
        timed(self.timeout, api.patch(name, &PatchParams::default(), &Patch::Merge(patch))).await
    }

    async fn delete(&self, gvr: &GroupVersionResource, namespace: &str, name: &str, opts: &DeleteOptions) -> Result<(), ClientError> {
        let api = dynamic_api(&self.client, gvr, namespace);
        let propagation = match opts.propagation {
            Propagation::Background => PropagationPolicy::Background,
            Propagation::Foreground => PropagationPolicy::Foreground,
            Propagation::Orphan => PropagationPolicy::Orphan,
        };
        let dp = DeleteParams {
            propagation_policy: Some(propagation),
            preconditions: opts
                .uid_precondition
                .as_ref()
                .map(|uid| Preconditions { uid: Some(uid.clone()), resource_version: None }),
            ..Default::default()
        };
        timed(self.timeout, api.delete(name, &dp)).await.map(|_| ())
    }
}

/// Issues `SubjectAccessReview`s with the agent's own client.
#[derive(Clone)]
pub struct KubeAccessReviewer {
    client: Client,
    timeout: Duration,
}

impl KubeAccessReviewer {
    pub fn new(client: Client, timeout: Duration) -> Self {
        Self { client, timeout }
    }
}

#[async_trait]
impl AccessReviewer for KubeAccessReviewer {
    async fn review(&self, req: &AccessReviewRequest) -> Result<bool, ClientError> {
        let api: Api<SubjectAccessReview> = Api::all(self.client.clone());
        let ra = ResourceAttributes {
            group: Some(req.group.clone()),
            version: non_empty(&req.version),
            resource: Some(req.resource.clone()),
            namespace: non_empty(&req.namespace),
            name: non_empty(&req.name),
            verb: Some(req.verb.clone()),
            ..Default::default()
        };
        let sar = SubjectAccessReview {
            spec: SubjectAccessReviewSpec {
                user: Some(req.user.clone()),
                groups: Some(req.groups.clone()),
                resource_attributes: Some(ra),
                ..Default::default()
            },
            ..Default::default()
        };
        let created = timed(self.timeout, api.create(&PostParams::default(), &sar)).await?;
        Ok(created.status.map(|s| s.allowed).unwrap_or(false))
    }
}

/// Derives impersonating clients from the agent's base kube config.
#[derive(Clone)]
pub struct KubeImpersonation {
    config: kube::Config,
    timeout: Duration,
}

impl KubeImpersonation {
    pub fn new(config: kube::Config, timeout: Duration) -> Self {
        Self { config, timeout }
    }
}

impl ImpersonationFactory for KubeImpersonation {
    fn for_user(&self, user: &str) -> Result<Arc<dyn ObjectClient>, ClientError> {
        let mut config = self.config.clone();
        config.auth_info.impersonate = Some(user.to_string());
        let client = Client::try_from(config).map_err(classify)?;
        Ok(Arc::new(KubeObjectClient::new(client, self.timeout)))
    }
}

/// [`TypedClient`] for a work type, transported as a dynamic object.
pub struct KubeTypedClient<T> {
    api: Api<DynamicObject>,
    timeout: Duration,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Versioned> KubeTypedClient<T> {
    pub fn namespaced(client: Client, namespace: &str, timeout: Duration) -> Self {
        Self { api: dynamic_api(&client, &T::gvr(), namespace), timeout, _marker: PhantomData }
    }

    pub fn cluster(client: Client, timeout: Duration) -> Self {
        Self::namespaced(client, "", timeout)
    }
}

fn decode<T: Versioned + DeserializeOwned>(obj: DynamicObject) -> Result<T, ClientError> {
    serde_json::to_value(&obj)
        .and_then(serde_json::from_value)
        .map_err(|e| ClientError::Other(format!("decoding {}: {}", T::gvr(), e)))
}

fn encode<T: Versioned + Serialize>(obj: &T) -> Result<DynamicObject, ClientError> {
    serde_json::to_value(obj)
        .and_then(serde_json::from_value)
        .map_err(|e| ClientError::Other(format!("encoding {}: {}", T::gvr(), e)))
}

#[async_trait]
impl<T> TypedClient<T> for KubeTypedClient<T>
where
    T: Versioned + Serialize + DeserializeOwned,
{
    async fn get(&self, name: &str) -> Result<T, ClientError> {
        decode(timed(self.timeout, self.api.get(name)).await?)
    }

    async fn create(&self, obj: &T) -> Result<T, ClientError> {
        let pp = PostParams { dry_run: false, field_manager: Some(FIELD_MANAGER.to_string()) };
        let data = encode(obj)?;
        decode(timed(self.timeout, self.api.create(&pp, &data)).await?)
    }

    async fn update(&self, obj: &T) -> Result<T, ClientError> {
        let pp = PostParams { dry_run: false, field_manager: Some(FIELD_MANAGER.to_string()) };
        let data = encode(obj)?;
        decode(timed(self.timeout, self.api.replace(&obj.meta().name, &pp, &data)).await?)
    }

    async fn update_status(&self, obj: &T) -> Result<T, ClientError> {
        let pp = PostParams { dry_run: false, field_manager: Some(FIELD_MANAGER.to_string()) };
        let data = serde_json::to_vec(obj).map_err(|e| ClientError::Other(format!("encoding {}: {}", T::gvr(), e)))?;
        decode(timed(self.timeout, self.api.replace_status(&obj.meta().name, &pp, data)).await?)
    }
}

/// Publishes Kubernetes events against a fixed object reference.
pub struct KubeEventRecorder {
    recorder: Recorder,
}

impl KubeEventRecorder {
    pub fn new(client: Client, controller: &str, reference: ObjectReference) -> Self {
        let reporter = Reporter { controller: controller.to_string(), instance: std::env::var("POD_NAME").ok() };
        Self { recorder: Recorder::new(client, reporter, reference) }
    }
}

#[async_trait]
impl EventRecorder for KubeEventRecorder {
    async fn record(&self, reason: &str, note: String) {
        let ev = Event {
            type_: EventType::Normal,
            reason: reason.to_string(),
            note: Some(note),
            action: reason.to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(ev).await {
            warn!(error = %e, reason, "event publish failed");
        }
    }
}

/// Writes events to the log only.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogRecorder;

#[async_trait]
impl EventRecorder for LogRecorder {
    async fn record(&self, reason: &str, note: String) {
        info!(reason, note = %note, "event");
    }
}
