//! Finalizer driven cleanup of a deleted ProvisioningRequest.
//!
//! Dependents are removed in a fixed order: the node allocation request on the
//! hardware plugin, then the ClusterInstance, then the cluster namespace and
//! the generated policy configmap. Dependents are found by the request name
//! label, plus the cluster name recorded in status. A stage is left only once
//! its dependent is gone, so every pass can resume from whatever the previous
//! one achieved.

use super::task::ProvisioningTask;
use crate::error::ControllerError;
use crate::store::{self, ClusterStore, LabelQuery, ResourceKind, CLUSTER_INSTANCE, CONFIG_MAP, NAMESPACE, PROVISIONING_REQUEST};
use crds::{PROVISIONING_REQUEST_FINALIZER, PROVISIONING_REQUEST_NAME_LABEL};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

/// Where a request stands in its cleanup
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeletionStage {
    NotDeleting,
    AwaitingHardwareCleanup,
    AwaitingInstallCleanup,
    AwaitingNamespaceCleanup,
    Removed,
}

impl DeletionStage {
    /// Stage following this one once its dependent is gone
    pub fn next(self) -> Self {
        match self {
            Self::NotDeleting => Self::AwaitingHardwareCleanup,
            Self::AwaitingHardwareCleanup => Self::AwaitingInstallCleanup,
            Self::AwaitingInstallCleanup => Self::AwaitingNamespaceCleanup,
            Self::AwaitingNamespaceCleanup | Self::Removed => Self::Removed,
        }
    }
}

pub fn has_finalizer(object: &Value) -> bool {
    finalizers(object).iter().any(|f| f == PROVISIONING_REQUEST_FINALIZER)
}

fn finalizers(object: &Value) -> Vec<String> {
    object
        .pointer("/metadata/finalizers")
        .and_then(Value::as_array)
        .map(|list| list.iter().filter_map(Value::as_str).map(str::to_string).collect())
        .unwrap_or_default()
}

async fn patch_finalizers(store: &dyn ClusterStore, object: &Value, finalizers: Vec<String>) -> Result<(), ControllerError> {
    let patch = json!({
        "metadata": {
            "finalizers": finalizers,
            "resourceVersion": store::resource_version(object).unwrap_or_default(),
        }
    });
    store
        .merge_patch(&PROVISIONING_REQUEST, None, store::name(object), &patch)
        .await?;
    Ok(())
}

/// Adds the cleanup finalizer. Returns false when it was already present.
pub(crate) async fn add_finalizer(store: &dyn ClusterStore, object: &Value) -> Result<bool, ControllerError> {
    if has_finalizer(object) {
        return Ok(false);
    }
    let mut list = finalizers(object);
    list.push(PROVISIONING_REQUEST_FINALIZER.to_string());
    patch_finalizers(store, object, list)
        .await
        .map_err(|e| e.context("failed to update ProvisioningRequest with finalizer"))?;
    Ok(true)
}

async fn remove_finalizer(store: &dyn ClusterStore, object: &Value) -> Result<(), ControllerError> {
    let list = finalizers(object)
        .into_iter()
        .filter(|f| f != PROVISIONING_REQUEST_FINALIZER)
        .collect();
    patch_finalizers(store, object, list)
        .await
        .map_err(|e| e.context("failed to patch ProvisioningRequest"))
}

/// Deletes an object unless it is already going away. True once it no longer exists.
async fn delete_and_check(
    store: &dyn ClusterStore,
    kind: &ResourceKind,
    namespace: Option<&str>,
    name: &str,
) -> Result<bool, ControllerError> {
    let Some(existing) = store.get(kind, namespace, name).await? else {
        return Ok(true);
    };
    if !store::is_terminating(&existing) {
        store
            .delete(kind, namespace, name)
            .await
            .map_err(|e| ControllerError::from(e).context(&format!("failed to delete {} {}", kind.kind, name)))?;
        info!("Deleted {} {}", kind.kind, name);
    }
    Ok(store.get(kind, namespace, name).await?.is_none())
}

impl ProvisioningTask<'_> {
    /// Runs cleanup as far as it can go this pass and reports the stage reached.
    ///
    /// The finalizer is released only at [`DeletionStage::Removed`].
    pub(crate) async fn advance_deletion(&mut self, live: &Value) -> Result<DeletionStage, ControllerError> {
        if !store::is_terminating(live) || !has_finalizer(live) {
            return Ok(DeletionStage::NotDeleting);
        }
        self.set_deleting();
        self.persist().await?;

        let mut stage = DeletionStage::NotDeleting.next();
        while stage != DeletionStage::Removed {
            let done = match stage {
                DeletionStage::AwaitingHardwareCleanup => self.cleanup_hardware().await?,
                DeletionStage::AwaitingInstallCleanup => self.cleanup_installation().await?,
                DeletionStage::AwaitingNamespaceCleanup => self.cleanup_namespace().await?,
                DeletionStage::NotDeleting | DeletionStage::Removed => true,
            };
            if !done {
                debug!("ProvisioningRequest {} deletion is waiting at {:?}", self.name(), stage);
                return Ok(stage);
            }
            stage = stage.next();
        }

        info!("Removing ProvisioningRequest finalizer for {}", self.name());
        // status writes above moved the resourceVersion on
        if let Some(current) = self.store().get(&PROVISIONING_REQUEST, None, self.name()).await? {
            remove_finalizer(self.store(), &current).await?;
        }
        self.ctx.owners.forget_owner(self.name());
        Ok(DeletionStage::Removed)
    }

    async fn cleanup_hardware(&mut self) -> Result<bool, ControllerError> {
        let Some(id) = self.status.extensions.node_allocation_request_id().map(str::to_string) else {
            return Ok(true);
        };
        let recorded = self
            .status
            .extensions
            .node_allocation_request_ref
            .as_ref()
            .map(|r| r.hardware_plugin_ref.clone())
            .filter(|r| !r.is_empty());
        let plugin_ref = match recorded {
            Some(plugin_ref) => plugin_ref,
            None => match self.plugin_ref_from_templates().await? {
                Some(plugin_ref) => plugin_ref,
                None => {
                    warn!(
                        "Skipping NodeAllocationRequest {} cleanup for ProvisioningRequest {}: its HardwareTemplate is gone",
                        id,
                        self.name()
                    );
                    return Ok(true);
                }
            },
        };

        let plugin = self.ctx.plugins.connect(&plugin_ref).await?;
        if plugin.get_node_allocation_request(&id).await?.is_none() {
            return Ok(true);
        }
        plugin.delete_node_allocation_request(&id).await?;
        info!("Deleted NodeAllocationRequest {} on HardwarePlugin {}", id, plugin_ref);
        Ok(plugin.get_node_allocation_request(&id).await?.is_none())
    }

    /// Plugin named by the HardwareTemplate, when the template chain still resolves
    async fn plugin_ref_from_templates(&mut self) -> Result<Option<String>, ControllerError> {
        let resolved = async {
            self.template = Some(self.resolve_cluster_template().await?);
            self.resolve_hardware_template().await
        }
        .await;
        match resolved {
            Ok(hw_template) => Ok(hw_template.map(|t| t.spec.hardware_plugin_ref)),
            Err(e) if e.is_input_error() => {
                debug!("Template chain of ProvisioningRequest {} no longer resolves: {}", self.name(), e);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Objects of `kind` labelled with this request's name, plus `recorded`
    async fn owned_objects(
        &self,
        kind: &ResourceKind,
        recorded: Option<(Option<String>, String)>,
    ) -> Result<Vec<(Option<String>, String)>, ControllerError> {
        let owned = LabelQuery::all().eq(PROVISIONING_REQUEST_NAME_LABEL, self.name());
        let mut targets: Vec<(Option<String>, String)> = self
            .store()
            .list(kind, None, &owned)
            .await?
            .iter()
            .map(|o| (store::namespace(o).map(str::to_string), store::name(o).to_string()))
            .collect();
        if let Some(recorded) = recorded {
            if !targets.contains(&recorded) {
                targets.push(recorded);
            }
        }
        Ok(targets)
    }

    /// Deletes every target, reporting whether all of them are gone
    async fn delete_all(&self, kind: &ResourceKind, targets: &[(Option<String>, String)]) -> Result<bool, ControllerError> {
        let mut gone = true;
        for (namespace, name) in targets {
            gone &= delete_and_check(self.store(), kind, namespace.as_deref(), name).await?;
        }
        Ok(gone)
    }

    async fn cleanup_installation(&self) -> Result<bool, ControllerError> {
        let recorded = self.status.extensions.cluster_name().map(|c| (Some(c.to_string()), c.to_string()));
        let instances = self.owned_objects(&CLUSTER_INSTANCE, recorded).await?;
        self.delete_all(&CLUSTER_INSTANCE, &instances).await
    }

    async fn cleanup_namespace(&self) -> Result<bool, ControllerError> {
        let config_maps = self.owned_objects(&CONFIG_MAP, None).await?;
        let config_maps_gone = self.delete_all(&CONFIG_MAP, &config_maps).await?;
        let recorded = self.status.extensions.cluster_name().map(|c| (None, c.to_string()));
        let namespaces = self.owned_objects(&NAMESPACE, recorded).await?;
        Ok(self.delete_all(&NAMESPACE, &namespaces).await? && config_maps_gone)
    }
}
