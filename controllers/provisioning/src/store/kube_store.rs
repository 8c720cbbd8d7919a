//! [`ClusterStore`] backed by the Kubernetes API through `Api<DynamicObject>`.

use super::{ClusterStore, LabelQuery, ResourceKind, StoreError};
use async_trait::async_trait;
use kube::api::{Api, DeleteParams, DynamicObject, ListParams, Patch, PatchParams, PostParams};
use kube::discovery::ApiResource;
use kube::Client;
use serde_json::Value;
use tracing::debug;

impl ResourceKind {
    /// Discovery-free resource description for `Api<DynamicObject>`
    pub fn api_resource(&self) -> ApiResource {
        ApiResource {
            group: self.group.to_string(),
            version: self.version.to_string(),
            api_version: self.api_version(),
            kind: self.kind.to_string(),
            plural: self.plural.to_string(),
        }
    }
}

/// Field manager recorded on every write
const FIELD_MANAGER: &str = "provisioning-controller";

/// Live API store
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
}

impl std::fmt::Debug for KubeStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeStore").finish_non_exhaustive()
    }
}

impl KubeStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Client the store was built with
    pub fn client(&self) -> Client {
        self.client.clone()
    }

    fn api(&self, kind: &ResourceKind, namespace: Option<&str>) -> Api<DynamicObject> {
        let resource = kind.api_resource();
        match namespace {
            Some(ns) if kind.namespaced => Api::namespaced_with(self.client.clone(), ns, &resource),
            _ => Api::all_with(self.client.clone(), &resource),
        }
    }

    fn post_params(dry_run: bool) -> PostParams {
        PostParams {
            dry_run,
            field_manager: Some(FIELD_MANAGER.to_string()),
        }
    }
}

/// Maps API errors onto the store taxonomy
fn classify(kind: &ResourceKind, name: &str, error: kube::Error) -> StoreError {
    let what = format!("{} {}", kind.kind, name);
    match error {
        kube::Error::Api(ae) if ae.code == 404 => StoreError::NotFound(what),
        kube::Error::Api(ae) if ae.code == 409 && ae.reason == "AlreadyExists" => StoreError::AlreadyExists(what),
        kube::Error::Api(ae) if ae.code == 409 => StoreError::Conflict(what),
        kube::Error::Api(ae) if ae.code == 400 || ae.code == 422 => StoreError::Invalid(ae.message),
        e => StoreError::Api(format!("{}: {}", what, e)),
    }
}

fn to_object(kind: &ResourceKind, value: &Value) -> Result<DynamicObject, StoreError> {
    let mut object = value.clone();
    if let Some(fields) = object.as_object_mut() {
        fields
            .entry("apiVersion")
            .or_insert_with(|| Value::String(kind.api_version()));
        fields
            .entry("kind")
            .or_insert_with(|| Value::String(kind.kind.to_string()));
    }
    serde_json::from_value(object).map_err(|e| StoreError::Serialization(format!("{}: {}", kind.kind, e)))
}

fn to_value(kind: &ResourceKind, object: &DynamicObject) -> Result<Value, StoreError> {
    serde_json::to_value(object).map_err(|e| StoreError::Serialization(format!("{}: {}", kind.kind, e)))
}

#[async_trait]
impl ClusterStore for KubeStore {
    async fn get(&self, kind: &ResourceKind, namespace: Option<&str>, name: &str) -> Result<Option<Value>, StoreError> {
        let object = self
            .api(kind, namespace)
            .get_opt(name)
            .await
            .map_err(|e| classify(kind, name, e))?;
        object.map(|o| to_value(kind, &o)).transpose()
    }

    async fn list(&self, kind: &ResourceKind, namespace: Option<&str>, labels: &LabelQuery) -> Result<Vec<Value>, StoreError> {
        let selector = labels.to_selector();
        let mut params = ListParams::default();
        if !selector.is_empty() {
            params = params.labels(&selector);
        }
        let list = self
            .api(kind, namespace)
            .list(&params)
            .await
            .map_err(|e| classify(kind, &selector, e))?;
        list.items.iter().map(|o| to_value(kind, o)).collect()
    }

    async fn create(&self, kind: &ResourceKind, object: &Value, dry_run: bool) -> Result<Value, StoreError> {
        let name = super::name(object).to_string();
        let created = self
            .api(kind, super::namespace(object))
            .create(&Self::post_params(dry_run), &to_object(kind, object)?)
            .await
            .map_err(|e| classify(kind, &name, e))?;
        debug!(kind = kind.kind, name = %name, dry_run, "Created resource");
        to_value(kind, &created)
    }

    async fn replace(&self, kind: &ResourceKind, object: &Value, dry_run: bool) -> Result<Value, StoreError> {
        let name = super::name(object).to_string();
        let replaced = self
            .api(kind, super::namespace(object))
            .replace(&name, &Self::post_params(dry_run), &to_object(kind, object)?)
            .await
            .map_err(|e| classify(kind, &name, e))?;
        debug!(kind = kind.kind, name = %name, dry_run, "Replaced resource");
        to_value(kind, &replaced)
    }

    async fn merge_patch(&self, kind: &ResourceKind, namespace: Option<&str>, name: &str, patch: &Value) -> Result<Value, StoreError> {
        let params = PatchParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..PatchParams::default()
        };
        let patched = self
            .api(kind, namespace)
            .patch(name, &params, &Patch::Merge(patch))
            .await
            .map_err(|e| classify(kind, name, e))?;
        to_value(kind, &patched)
    }

    async fn merge_patch_status(&self, kind: &ResourceKind, namespace: Option<&str>, name: &str, patch: &Value) -> Result<Value, StoreError> {
        let params = PatchParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..PatchParams::default()
        };
        let patched = self
            .api(kind, namespace)
            .patch_status(name, &params, &Patch::Merge(patch))
            .await
            .map_err(|e| classify(kind, name, e))?;
        to_value(kind, &patched)
    }

    async fn delete(&self, kind: &ResourceKind, namespace: Option<&str>, name: &str) -> Result<bool, StoreError> {
        match self.api(kind, namespace).delete(name, &DeleteParams::background()).await {
            Ok(_) => {
                debug!(kind = kind.kind, name = %name, "Deletion requested");
                Ok(true)
            }
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(false),
            Err(e) => Err(classify(kind, name, e)),
        }
    }
}
