//! ClusterInstance rendering and apply.
//!
//! The ClusterInstance is rebuilt every pass from the merged parameters. Once
//! installation has started, the rendered spec is diffed against the live one
//! and only a small set of fields may change.

use super::task::ProvisioningTask;
use crate::error::ControllerError;
use crate::store::{self, ClusterStore, CLUSTER_INSTANCE, NAMESPACE};
use crds::{ConditionLedger, ConditionReason, ConditionStatus, ConditionType, PROVISIONING_REQUEST_NAME_LABEL};
use serde_json::{json, Map, Value};
use tracing::{error, info};

/// Annotation keeping a new ManagedCluster from being imported before installation starts
pub const DISABLE_AUTO_IMPORT_ANNOTATION: &str = "import.open-cluster-management.io/disable-auto-import";

/// Manifest suppressed when the release changes after installation
const AGENT_CLUSTER_INSTALL: &str = "AgentClusterInstall";

/// Spec paths filled in from hardware data or by the installer, never compared
const IGNORED_PATHS: &[&str] = &[
    "nodes.*.bmcAddress",
    "nodes.*.bmcCredentialsName",
    "nodes.*.bootMACAddress",
    "nodes.*.hostRef",
    "nodes.*.nodeNetwork.interfaces.*.macAddress",
    "nodes.*.nodeNetwork.interfaces.*.label",
    "suppressedManifests",
];

/// Spec paths that may change at any time
const ALLOWED_PATHS: &[&str] = &[
    "extraAnnotations",
    "extraLabels",
    "nodes.*.extraAnnotations",
    "nodes.*.extraLabels",
];

/// True when `path` equals `pattern` or lies below it. `*` matches one segment.
fn matches_pattern(path: &str, pattern: &str) -> bool {
    let path: Vec<&str> = path.split('.').collect();
    let pattern: Vec<&str> = pattern.split('.').collect();
    path.len() >= pattern.len() && pattern.iter().zip(&path).all(|(p, s)| *p == "*" || p == s)
}

fn join(prefix: &str, key: &str) -> String {
    if prefix.is_empty() {
        key.to_string()
    } else {
        format!("{}.{}", prefix, key)
    }
}

fn diff_paths(prefix: &str, old: &Value, new: &Value, out: &mut Vec<String>) {
    match (old, new) {
        (Value::Object(old), Value::Object(new)) => {
            let mut keys: Vec<&String> = old.keys().chain(new.keys().filter(|k| !old.contains_key(*k))).collect();
            keys.sort();
            for key in keys {
                let path = join(prefix, key);
                match (old.get(key), new.get(key)) {
                    (Some(o), Some(n)) => diff_paths(&path, o, n, out),
                    _ => out.push(path),
                }
            }
        }
        (Value::Array(old), Value::Array(new)) => {
            for i in 0..old.len().max(new.len()) {
                let path = join(prefix, &i.to_string());
                match (old.get(i), new.get(i)) {
                    (Some(o), Some(n)) => diff_paths(&path, o, n, out),
                    _ => out.push(path),
                }
            }
        }
        (old, new) if old != new => out.push(prefix.to_string()),
        _ => {}
    }
}

/// Changed spec paths between the live and rendered ClusterInstance.
///
/// Returns the changed fields (ignored paths removed) and, separately, the
/// nodes added or removed (`nodes.<i>`).
pub fn spec_changes(existing: &Value, rendered: &Value) -> (Vec<String>, Vec<String>) {
    let strip_nodes = |spec: &Value| {
        let mut spec = spec.clone();
        if let Some(fields) = spec.as_object_mut() {
            fields.remove("nodes");
        }
        spec
    };
    let nodes = |spec: &Value| spec.get("nodes").and_then(Value::as_array).cloned().unwrap_or_default();

    let mut changes = Vec::new();
    diff_paths("", &strip_nodes(existing), &strip_nodes(rendered), &mut changes);

    let mut scaling = Vec::new();
    let (old_nodes, new_nodes) = (nodes(existing), nodes(rendered));
    for i in 0..old_nodes.len().max(new_nodes.len()) {
        let path = format!("nodes.{}", i);
        match (old_nodes.get(i), new_nodes.get(i)) {
            (Some(o), Some(n)) => diff_paths(&path, o, n, &mut changes),
            _ => scaling.push(path),
        }
    }

    changes.retain(|path| !IGNORED_PATHS.iter().any(|p| matches_pattern(path, p)));
    (changes, scaling)
}

/// Creates the ClusterInstance or patches it when the spec changed.
///
/// On update the live labels, annotations and finalizers are kept.
pub(crate) async fn apply_cluster_instance(
    store: &dyn ClusterStore,
    rendered: &Value,
    dry_run: bool,
) -> Result<(), ControllerError> {
    let name = store::name(rendered);
    let namespace = store::namespace(rendered);
    let Some(existing) = store.get(&CLUSTER_INSTANCE, namespace, name).await? else {
        store.create(&CLUSTER_INSTANCE, rendered, dry_run).await?;
        return Ok(());
    };
    if existing.get("spec") == rendered.get("spec") {
        return Ok(());
    }

    let mut desired = rendered.clone();
    for field in ["labels", "annotations"] {
        let mut merged = existing
            .pointer(&format!("/metadata/{}", field))
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();
        if let Some(own) = rendered.pointer(&format!("/metadata/{}", field)).and_then(Value::as_object) {
            merged.extend(own.clone());
        }
        desired["metadata"][field] = Value::Object(merged);
    }
    if let Some(finalizers) = existing.pointer("/metadata/finalizers") {
        desired["metadata"]["finalizers"] = finalizers.clone();
    }
    if let Some(version) = store::resource_version(&existing) {
        desired["metadata"]["resourceVersion"] = json!(version);
    }
    store.replace(&CLUSTER_INSTANCE, &desired, dry_run).await?;
    Ok(())
}

/// Adds the disable-auto-import annotation under
/// `extraAnnotations.ManagedCluster`, replacing any non-map value on the way
fn with_disable_auto_import(spec: Value) -> Value {
    let mut spec = into_map(spec);
    let mut extra = into_map(spec.remove("extraAnnotations").unwrap_or_default());
    let mut managed = into_map(extra.remove("ManagedCluster").unwrap_or_default());
    managed.insert(DISABLE_AUTO_IMPORT_ANNOTATION.to_string(), json!("true"));
    extra.insert("ManagedCluster".to_string(), Value::Object(managed));
    spec.insert("extraAnnotations".to_string(), Value::Object(extra));
    Value::Object(spec)
}

fn into_map(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

impl ProvisioningTask<'_> {
    /// Renders and dry-runs the ClusterInstance, recording `ClusterInstanceRendered`
    pub(crate) async fn handle_render_cluster_instance(&mut self) -> Result<Value, ControllerError> {
        let result = self.render_cluster_instance().await;
        if result.as_ref().is_err_and(|e| !e.is_input_error()) {
            return result;
        }
        match &result {
            Ok(rendered) => {
                info!("Rendered and validated ClusterInstance {}", store::name(rendered));
                self.set_condition(
                    ConditionType::ClusterInstanceRendered,
                    ConditionReason::Completed,
                    ConditionStatus::True,
                    "ClusterInstance rendered and passed dry-run validation",
                );
            }
            Err(e) => {
                error!("Failed to render ClusterInstance for ProvisioningRequest {}: {}", self.name(), e);
                let message = format!("Failed to render and validate ClusterInstance: {}", e);
                self.set_condition(
                    ConditionType::ClusterInstanceRendered,
                    ConditionReason::Failed,
                    ConditionStatus::False,
                    &message,
                );
                self.set_failed(&message);
            }
        }
        self.persist().await?;
        result
    }

    async fn render_cluster_instance(&mut self) -> Result<Value, ControllerError> {
        let mut rendered = self.ctx.renderer.render(&self.input.cluster_instance)?.to_value();
        rendered["metadata"]["labels"] = json!({PROVISIONING_REQUEST_NAME_LABEL: self.name()});
        let cluster = store::name(&rendered).to_string();

        self.ensure_cluster_namespace(&cluster).await?;

        let mut disable_auto_import = true;
        let mut suppressed = Vec::new();
        let provisioning_started = self
            .status
            .conditions
            .find(ConditionType::ClusterProvisioned)
            .is_some_and(|c| c.reason != ConditionReason::Unknown.as_str());
        if provisioning_started {
            disable_auto_import = false;
            if let Some(existing) = self.store().get(&CLUSTER_INSTANCE, Some(&cluster), &cluster).await? {
                suppressed = self.check_immutable_fields(&existing, &rendered)?;
            }
        }

        apply_cluster_instance(self.store(), &rendered, true).await.map_err(|e| {
            if e.is_input_error() {
                e
            } else {
                ControllerError::internal(format!("failed to validate the rendered ClusterInstance with dry-run: {}", e))
            }
        })?;

        if !suppressed.is_empty() {
            rendered["spec"]["suppressedManifests"] = json!(suppressed);
        }
        if disable_auto_import {
            let spec = rendered["spec"].take();
            rendered["spec"] = with_disable_auto_import(spec);
        }
        Ok(rendered)
    }

    /// Rejects changes to immutable fields, returning the suppressed manifests
    /// to carry over when the release changes after installation
    fn check_immutable_fields(&self, existing: &Value, rendered: &Value) -> Result<Vec<String>, ControllerError> {
        let empty = json!({});
        let (changes, scaling) = spec_changes(
            existing.get("spec").unwrap_or(&empty),
            rendered.get("spec").unwrap_or(&empty),
        );
        let completed = self
            .status
            .conditions
            .find(ConditionType::ClusterProvisioned)
            .is_some_and(|c| c.reason == ConditionReason::Completed.as_str());

        let mut suppressed = Vec::new();
        let mut disallowed = Vec::new();
        for path in changes {
            if path == "clusterImageSetNameRef" && completed {
                info!("Detected clusterImageSetNameRef change for ClusterInstance {}", store::name(existing));
                suppressed = existing
                    .pointer("/spec/suppressedManifests")
                    .and_then(Value::as_array)
                    .map(|items| items.iter().filter_map(Value::as_str).map(str::to_string).collect())
                    .unwrap_or_default();
                if !suppressed.iter().any(|m| m == AGENT_CLUSTER_INSTALL) {
                    suppressed.push(AGENT_CLUSTER_INSTALL.to_string());
                }
            } else if !ALLOWED_PATHS.iter().any(|p| matches_pattern(&path, p)) {
                disallowed.push(path);
            }
        }
        if !completed {
            disallowed.extend(scaling);
        }
        if !disallowed.is_empty() {
            return Err(ControllerError::input(format!(
                "detected changes in immutable fields: {}",
                disallowed.join(", ")
            )));
        }
        Ok(suppressed)
    }

    /// Creates the cluster namespace, labelled with the request name
    async fn ensure_cluster_namespace(&self, cluster: &str) -> Result<(), ControllerError> {
        if let Some(existing) = self.store().get(&NAMESPACE, None, cluster).await? {
            if store::is_terminating(&existing) {
                return Err(ControllerError::input(format!("the namespace {} is terminating", cluster)));
            }
        }
        let namespace = json!({
            "apiVersion": "v1",
            "kind": "Namespace",
            "metadata": {
                "name": cluster,
                "labels": {PROVISIONING_REQUEST_NAME_LABEL: self.name()}
            }
        });
        store::ensure(self.store(), &NAMESPACE, &namespace).await?;
        self.ctx.owners.record(cluster, self.name());
        Ok(())
    }
}
