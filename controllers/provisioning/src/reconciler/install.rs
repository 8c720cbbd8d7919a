//! Cluster installation through the ClusterInstance.

use super::cluster_instance::{apply_cluster_instance, DISABLE_AUTO_IMPORT_ANNOTATION};
use super::task::ProvisioningTask;
use crate::error::ControllerError;
use crate::store::{self, CLUSTER_INSTANCE, MANAGED_CLUSTER};
use crate::timeouts;
use chrono::Utc;
use crds::{ConditionLedger, ConditionReason, ConditionStatus, ConditionType};
use serde_json::{json, Value};
use tracing::info;

/// ClusterInstance conditions that must all be True once processing starts
const PROCESSING_CONDITIONS: &[&str] = &[
    "ClusterInstanceValidated",
    "RenderedTemplates",
    "RenderedTemplatesValidated",
    "RenderedTemplatesApplied",
];

/// Installer condition reporting installation progress
const INSTALLER_PROVISIONED: &str = "Provisioned";

fn field<'a>(condition: &'a Value, name: &str) -> &'a str {
    condition.get(name).and_then(Value::as_str).unwrap_or_default()
}

impl ProvisioningTask<'_> {
    /// Applies the ClusterInstance and mirrors installation progress
    pub(crate) async fn handle_cluster_installation(&mut self, rendered: &Value) -> Result<(), ControllerError> {
        let cluster = store::name(rendered).to_string();
        apply_cluster_instance(self.store(), rendered, false).await.map_err(|e| {
            ControllerError::Reconciliation(format!("failed to apply the rendered ClusterInstance ({}): {}", cluster, e))
        })?;
        self.status.extensions.cluster_details_mut().name = cluster.clone();
        self.ctx.owners.record(&cluster, self.name());

        self.check_cluster_provision_status(&cluster).await?;

        if self.cluster_provision_completed() {
            self.remove_disable_auto_import_annotation(&cluster).await?;
        }
        Ok(())
    }

    /// Reads the ClusterInstance and updates `ClusterInstanceProcessed` and `ClusterProvisioned`
    pub(crate) async fn check_cluster_provision_status(&mut self, cluster: &str) -> Result<(), ControllerError> {
        let instance = self
            .store()
            .get(&CLUSTER_INSTANCE, Some(cluster), cluster)
            .await?
            .ok_or_else(|| ControllerError::internal(format!("clusterInstance {} does not exist", cluster)))?;
        self.update_cluster_instance_processed_status(&instance);
        self.update_cluster_provision_status(&instance);
        self.persist().await
    }

    fn update_cluster_instance_processed_status(&mut self, instance: &Value) {
        let name = store::name(instance);
        let conditions = instance
            .pointer("/status/conditions")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        if conditions.is_empty() {
            let message = format!("Waiting for ClusterInstance ({}) to be processed", name);
            self.set_condition(
                ConditionType::ClusterInstanceProcessed,
                ConditionReason::Unknown,
                ConditionStatus::Unknown,
                &message,
            );
            self.set_in_progress(&message);
            return;
        }

        for type_ in PROCESSING_CONDITIONS {
            let Some(condition) = store::condition(instance, type_) else {
                continue;
            };
            let status = ConditionStatus::from_str_lossy(field(condition, "status"));
            if status != ConditionStatus::True {
                let message = field(condition, "message").to_string();
                self.set_condition(
                    ConditionType::ClusterInstanceProcessed,
                    field(condition, "reason"),
                    status,
                    &message,
                );
                self.set_failed(&message);
                return;
            }
        }

        self.set_condition(
            ConditionType::ClusterInstanceProcessed,
            ConditionReason::Completed,
            ConditionStatus::True,
            format!("Applied and processed ClusterInstance ({}) successfully", name),
        );
    }

    fn update_cluster_provision_status(&mut self, instance: &Value) {
        let mut message = String::new();
        match store::condition(instance, INSTALLER_PROVISIONED) {
            None => {
                if self.status.conditions.is_true(ConditionType::ClusterInstanceProcessed) {
                    message = "Waiting for cluster installation to start".to_string();
                    self.set_condition(
                        ConditionType::ClusterProvisioned,
                        ConditionReason::Unknown,
                        ConditionStatus::Unknown,
                        &message,
                    );
                    self.set_in_progress(&message);
                }
            }
            Some(condition) => {
                message = field(condition, "message").to_string();
                self.set_condition(
                    ConditionType::ClusterProvisioned,
                    field(condition, "reason"),
                    ConditionStatus::from_str_lossy(field(condition, "status")),
                    &message,
                );
            }
        }

        if self.cluster_provision_present() {
            let details = self.status.extensions.cluster_details_mut();
            let started = *details.cluster_provision_started_at.get_or_insert_with(Utc::now);

            if self.cluster_provision_failed() {
                message = "Cluster installation failed".to_string();
                self.set_failed(&message);
            } else if !self.cluster_provision_completed() {
                if timeouts::exceeded(Some(started), self.timeouts.cluster_provisioning) {
                    message = "Cluster installation timed out".to_string();
                    self.set_condition(
                        ConditionType::ClusterProvisioned,
                        ConditionReason::TimedOut,
                        ConditionStatus::False,
                        &message,
                    );
                    self.set_failed(&message);
                } else {
                    message = "Cluster installation is in progress".to_string();
                    self.set_in_progress(&message);
                }
            }
        }
        info!("ClusterInstance ({}) installation status: {}", store::name(instance), message);
    }

    /// Lets the ManagedCluster be imported once installation has completed
    async fn remove_disable_auto_import_annotation(&self, cluster: &str) -> Result<(), ControllerError> {
        let Some(managed) = self.store().get(&MANAGED_CLUSTER, None, cluster).await? else {
            return Ok(());
        };
        if !store::annotations(&managed).contains_key(DISABLE_AUTO_IMPORT_ANNOTATION) {
            return Ok(());
        }
        let patch = json!({"metadata": {"annotations": {DISABLE_AUTO_IMPORT_ANNOTATION: null}}});
        self.store()
            .merge_patch(&MANAGED_CLUSTER, None, cluster, &patch)
            .await
            .map_err(|e| ControllerError::from(e).context("failed to update managed cluster"))?;
        info!("disable-auto-import annotation is removed for ManagedCluster: {}", cluster);
        Ok(())
    }
}
