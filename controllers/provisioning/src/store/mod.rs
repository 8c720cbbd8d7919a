//! Resource store.
//!
//! All Kubernetes access from the reconciler goes through [`ClusterStore`],
//! which works on untyped JSON objects addressed by a [`ResourceKind`]. The
//! production implementation wraps `Api<DynamicObject>` ([`kube_store::KubeStore`]);
//! tests use the in-memory [`mock::MockClusterStore`].
//!
//! Typed access is layered on top with [`get_typed`], and idempotent
//! "make it look like this" writes with [`ensure`].

pub mod kube_store;
#[cfg(test)]
pub mod mock;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use thiserror::Error;

/// Group/version/kind plus the REST plural of a resource type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResourceKind {
    pub group: &'static str,
    pub version: &'static str,
    pub kind: &'static str,
    pub plural: &'static str,
    pub namespaced: bool,
}

impl ResourceKind {
    /// `apiVersion` string (`group/version`, or just `version` for the core group)
    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.to_string()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }
}

pub const PROVISIONING_REQUEST: ResourceKind = ResourceKind {
    group: "o2ims.provisioning.oran.org",
    version: "v1alpha1",
    kind: "ProvisioningRequest",
    plural: "provisioningrequests",
    namespaced: false,
};

pub const CLUSTER_TEMPLATE: ResourceKind = ResourceKind {
    group: "o2ims.provisioning.oran.org",
    version: "v1alpha1",
    kind: "ClusterTemplate",
    plural: "clustertemplates",
    namespaced: true,
};

pub const HARDWARE_TEMPLATE: ResourceKind = ResourceKind {
    group: "clcm.openshift.io",
    version: "v1alpha1",
    kind: "HardwareTemplate",
    plural: "hardwaretemplates",
    namespaced: true,
};

pub const HARDWARE_PLUGIN: ResourceKind = ResourceKind {
    group: "clcm.openshift.io",
    version: "v1alpha1",
    kind: "HardwarePlugin",
    plural: "hardwareplugins",
    namespaced: true,
};

pub const ALLOCATED_NODE: ResourceKind = ResourceKind {
    group: "plugins.clcm.openshift.io",
    version: "v1alpha1",
    kind: "AllocatedNode",
    plural: "allocatednodes",
    namespaced: true,
};

pub const CLUSTER_INSTANCE: ResourceKind = ResourceKind {
    group: "siteconfig.open-cluster-management.io",
    version: "v1alpha1",
    kind: "ClusterInstance",
    plural: "clusterinstances",
    namespaced: true,
};

pub const MANAGED_CLUSTER: ResourceKind = ResourceKind {
    group: "cluster.open-cluster-management.io",
    version: "v1",
    kind: "ManagedCluster",
    plural: "managedclusters",
    namespaced: false,
};

pub const POLICY: ResourceKind = ResourceKind {
    group: "policy.open-cluster-management.io",
    version: "v1",
    kind: "Policy",
    plural: "policies",
    namespaced: true,
};

pub const IMAGE_BASED_GROUP_UPGRADE: ResourceKind = ResourceKind {
    group: "lcm.openshift.io",
    version: "v1alpha1",
    kind: "ImageBasedGroupUpgrade",
    plural: "imagebasedgroupupgrades",
    namespaced: true,
};

pub const AGENT: ResourceKind = ResourceKind {
    group: "agent-install.openshift.io",
    version: "v1beta1",
    kind: "Agent",
    plural: "agents",
    namespaced: true,
};

pub const NAMESPACE: ResourceKind = ResourceKind {
    group: "",
    version: "v1",
    kind: "Namespace",
    plural: "namespaces",
    namespaced: false,
};

pub const SECRET: ResourceKind = ResourceKind {
    group: "",
    version: "v1",
    kind: "Secret",
    plural: "secrets",
    namespaced: true,
};

pub const CONFIG_MAP: ResourceKind = ResourceKind {
    group: "",
    version: "v1",
    kind: "ConfigMap",
    plural: "configmaps",
    namespaced: true,
};

/// Label selector restricted to what the controller needs: equality and existence
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelQuery {
    equals: BTreeMap<String, String>,
    exists: Vec<String>,
}

impl LabelQuery {
    /// Matches everything
    pub fn all() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn eq(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.equals.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn exists(mut self, key: impl Into<String>) -> Self {
        self.exists.push(key.into());
        self
    }

    /// Selector string in API server syntax (`a=b,c`)
    pub fn to_selector(&self) -> String {
        self.equals
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .chain(self.exists.iter().cloned())
            .collect::<Vec<_>>()
            .join(",")
    }

    /// Client-side evaluation against an object's labels
    pub fn matches(&self, object: &Value) -> bool {
        let labels = labels(object);
        self.equals.iter().all(|(k, v)| labels.get(k) == Some(v))
            && self.exists.iter().all(|k| labels.contains_key(k))
    }
}

/// Store failures, classified by API status
#[derive(Debug, Error, Clone, PartialEq)]
pub enum StoreError {
    #[error("{0} not found")]
    NotFound(String),

    /// Optimistic concurrency failure (resourceVersion mismatch)
    #[error("conflict updating {0}")]
    Conflict(String),

    #[error("{0} already exists")]
    AlreadyExists(String),

    /// Rejected by validation (400/422). The message is the API server's, verbatim.
    #[error("{0}")]
    Invalid(String),

    #[error("API error: {0}")]
    Api(String),

    #[error("failed to decode {0}")]
    Serialization(String),
}

impl StoreError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }

    pub fn is_invalid(&self) -> bool {
        matches!(self, Self::Invalid(_))
    }
}

/// Untyped access to cluster resources.
///
/// `namespace` is ignored for cluster-scoped kinds. Writes take complete
/// objects (with `metadata.name` and, for namespaced kinds,
/// `metadata.namespace`).
#[async_trait]
pub trait ClusterStore: Send + Sync {
    /// Fetches an object. `None` when it does not exist.
    async fn get(&self, kind: &ResourceKind, namespace: Option<&str>, name: &str) -> Result<Option<Value>, StoreError>;

    /// Lists objects matching `labels`, across all namespaces when `namespace` is `None`
    async fn list(&self, kind: &ResourceKind, namespace: Option<&str>, labels: &LabelQuery) -> Result<Vec<Value>, StoreError>;

    async fn create(&self, kind: &ResourceKind, object: &Value, dry_run: bool) -> Result<Value, StoreError>;

    /// Full replace. A `metadata.resourceVersion` in `object` is checked.
    async fn replace(&self, kind: &ResourceKind, object: &Value, dry_run: bool) -> Result<Value, StoreError>;

    /// JSON merge patch (RFC 7386). A `metadata.resourceVersion` in the patch is checked.
    async fn merge_patch(&self, kind: &ResourceKind, namespace: Option<&str>, name: &str, patch: &Value) -> Result<Value, StoreError>;

    /// JSON merge patch against the status subresource
    async fn merge_patch_status(&self, kind: &ResourceKind, namespace: Option<&str>, name: &str, patch: &Value) -> Result<Value, StoreError>;

    /// Requests deletion. Returns false when the object was already gone.
    async fn delete(&self, kind: &ResourceKind, namespace: Option<&str>, name: &str) -> Result<bool, StoreError>;
}

/// Fetches and decodes an object
pub async fn get_typed<T: DeserializeOwned>(
    store: &dyn ClusterStore,
    kind: &ResourceKind,
    namespace: Option<&str>,
    name: &str,
) -> Result<Option<T>, StoreError> {
    match store.get(kind, namespace, name).await? {
        Some(value) => decode(kind, value).map(Some),
        None => Ok(None),
    }
}

/// Decodes an untyped object
pub fn decode<T: DeserializeOwned>(kind: &ResourceKind, value: Value) -> Result<T, StoreError> {
    serde_json::from_value(value).map_err(|e| StoreError::Serialization(format!("{}: {}", kind.kind, e)))
}

/// Result of [`ensure`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnsureOutcome {
    Created,
    Updated,
    Unchanged,
}

/// Creates `desired` or patches the live object so its labels, annotations
/// and non-metadata fields match. No write happens when nothing differs.
pub async fn ensure(store: &dyn ClusterStore, kind: &ResourceKind, desired: &Value) -> Result<EnsureOutcome, StoreError> {
    let name = name(desired).to_string();
    let namespace = namespace(desired).map(str::to_string);

    let Some(existing) = store.get(kind, namespace.as_deref(), &name).await? else {
        store.create(kind, desired, false).await?;
        return Ok(EnsureOutcome::Created);
    };

    let patch = ensure_patch(&existing, desired);
    if patch.as_object().is_none_or(Map::is_empty) {
        return Ok(EnsureOutcome::Unchanged);
    }
    store.merge_patch(kind, namespace.as_deref(), &name, &patch).await?;
    Ok(EnsureOutcome::Updated)
}

/// Merge patch turning `existing` into `desired` for the fields `ensure` owns
fn ensure_patch(existing: &Value, desired: &Value) -> Value {
    let mut patch = Map::new();
    if let Some(fields) = desired.as_object() {
        for (key, value) in fields {
            if matches!(key.as_str(), "metadata" | "status" | "apiVersion" | "kind") {
                continue;
            }
            let diff = merge_patch_diff(existing.get(key).unwrap_or(&Value::Null), value);
            if !diff.is_null() {
                patch.insert(key.clone(), diff);
            }
        }
    }

    let mut metadata = Map::new();
    for field in ["labels", "annotations"] {
        let Some(wanted) = desired.pointer(&format!("/metadata/{}", field)).and_then(Value::as_object) else {
            continue;
        };
        let current = existing.pointer(&format!("/metadata/{}", field)).and_then(Value::as_object);
        let missing: Map<String, Value> = wanted
            .iter()
            .filter(|(k, v)| current.and_then(|c| c.get(*k)) != Some(*v))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        if !missing.is_empty() {
            metadata.insert(field.to_string(), Value::Object(missing));
        }
    }
    if !metadata.is_empty() {
        patch.insert("metadata".to_string(), Value::Object(metadata));
    }
    Value::Object(patch)
}

/// Smallest JSON merge patch turning `from` into `to`. `Null` means "no change".
pub fn merge_patch_diff(from: &Value, to: &Value) -> Value {
    match (from, to) {
        (Value::Object(from), Value::Object(to)) => {
            let mut patch = Map::new();
            for (key, old) in from {
                if !to.contains_key(key) {
                    patch.insert(key.clone(), Value::Null);
                } else if let Some(new) = to.get(key) {
                    if old != new {
                        let diff = merge_patch_diff(old, new);
                        patch.insert(key.clone(), if diff.is_null() { new.clone() } else { diff });
                    }
                }
            }
            for (key, new) in to {
                if !from.contains_key(key) {
                    patch.insert(key.clone(), new.clone());
                }
            }
            if patch.is_empty() { Value::Null } else { Value::Object(patch) }
        }
        (from, to) if from == to => Value::Null,
        (_, to) => to.clone(),
    }
}

/// `metadata.name`, empty when unset
pub fn name(object: &Value) -> &str {
    object.pointer("/metadata/name").and_then(Value::as_str).unwrap_or_default()
}

pub fn namespace(object: &Value) -> Option<&str> {
    object.pointer("/metadata/namespace").and_then(Value::as_str)
}

pub fn resource_version(object: &Value) -> Option<&str> {
    object.pointer("/metadata/resourceVersion").and_then(Value::as_str)
}

/// `metadata.labels` as a map, empty when unset
pub fn labels(object: &Value) -> BTreeMap<String, String> {
    string_map(object.pointer("/metadata/labels"))
}

pub fn annotations(object: &Value) -> BTreeMap<String, String> {
    string_map(object.pointer("/metadata/annotations"))
}

fn string_map(value: Option<&Value>) -> BTreeMap<String, String> {
    value
        .and_then(Value::as_object)
        .map(|m| {
            m.iter()
                .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
                .collect()
        })
        .unwrap_or_default()
}

/// True once the API server has set `metadata.deletionTimestamp`
pub fn is_terminating(object: &Value) -> bool {
    object.pointer("/metadata/deletionTimestamp").is_some_and(|v| !v.is_null())
        || object.pointer("/status/phase").and_then(Value::as_str) == Some("Terminating")
}

/// Status of the condition with `type_` under `status.conditions`
pub fn condition<'a>(object: &'a Value, type_: &str) -> Option<&'a Value> {
    object
        .pointer("/status/conditions")
        .and_then(Value::as_array)?
        .iter()
        .find(|c| c.get("type").and_then(Value::as_str) == Some(type_))
}
