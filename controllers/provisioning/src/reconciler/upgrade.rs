//! In-place cluster upgrade through an ImageBasedGroupUpgrade.

use super::task::ProvisioningTask;
use super::validation::{config_map_document, get_config_map};
use super::Requeue;
use crate::error::ControllerError;
use crate::store::{self, IMAGE_BASED_GROUP_UPGRADE, MANAGED_CLUSTER};
use crds::{ConditionLedger, ConditionReason, ConditionStatus, ConditionType, PROVISIONING_REQUEST_NAME_LABEL};
use semver::Version;
use serde_json::{json, Value};
use std::cmp::Ordering;
use tracing::info;

/// Upgrade defaults configmap key holding the IBGU spec
pub const UPGRADE_DEFAULTS_KEY: &str = "ibgu";

/// ManagedCluster label carrying the running release
pub const OPENSHIFT_VERSION_LABEL: &str = "openshiftVersion";

fn parse_version(text: &str, what: &str) -> Result<Version, ControllerError> {
    Version::parse(text.trim()).map_err(|e| ControllerError::input(format!("failed to parse {} ({}): {}", what, text, e)))
}

/// Compares the desired release against the running one
pub fn compare_releases(desired: &str, running: &str) -> Result<bool, ControllerError> {
    let desired_version = parse_version(desired, "template version")?;
    let running_version = parse_version(running, "ManagedCluster version")?;
    match desired_version.cmp(&running_version) {
        Ordering::Greater => Ok(true),
        Ordering::Equal => Ok(false),
        Ordering::Less => Err(ControllerError::input(format!(
            "template version ({}) is lower then ManagedCluster version ({}), no upgrade requested",
            desired_version, running_version
        ))),
    }
}

/// Progressing True or not reported yet
pub fn ibgu_progressing(ibgu: &Value) -> bool {
    store::condition(ibgu, "Progressing")
        .and_then(|c| c.get("status"))
        .and_then(Value::as_str)
        .is_none_or(|s| s == "True")
}

/// Message listing the failed actions of the first cluster that has any
pub fn ibgu_failure(ibgu: &Value) -> Option<String> {
    let clusters = ibgu.pointer("/status/clusters").and_then(Value::as_array)?;
    clusters.iter().find_map(|cluster| {
        let actions = cluster.get("failedActions").and_then(Value::as_array).filter(|a| !a.is_empty())?;
        let mut message = String::from("Upgrade Failed: ");
        for action in actions {
            let field = |name: &str| action.get(name).and_then(Value::as_str).unwrap_or_default().to_string();
            message.push_str(&format!("Action {} failed: {}\n", field("action"), field("message")));
        }
        Some(message)
    })
}

fn seed_version(ibgu: &Value) -> &str {
    ibgu.pointer("/spec/ibuSpec/seedImageRef/version")
        .and_then(Value::as_str)
        .unwrap_or_default()
}

impl ProvisioningTask<'_> {
    /// True when the desired release is ahead of the ManagedCluster's
    pub(crate) async fn should_upgrade(&self, cluster: &str) -> Result<bool, ControllerError> {
        let Some(release) = self.release() else {
            return Ok(false);
        };
        let managed = self
            .store()
            .get(&MANAGED_CLUSTER, None, cluster)
            .await?
            .ok_or_else(|| ControllerError::internal(format!("failed to get ManagedCluster {}", cluster)))?;
        let running = store::labels(&managed).get(OPENSHIFT_VERSION_LABEL).cloned().unwrap_or_default();
        compare_releases(&release, &running)
    }

    /// Creates or follows the IBGU for this request
    pub(crate) async fn handle_upgrade(&mut self, cluster: &str) -> Result<Requeue, ControllerError> {
        let release = self.release().unwrap_or_default();
        let ibgu = match self.store().get(&IMAGE_BASED_GROUP_UPGRADE, Some(cluster), self.name()).await? {
            Some(ibgu) => ibgu,
            None => {
                let ibgu = self
                    .build_ibgu(cluster, &release)
                    .await
                    .map_err(|e| e.context("failed to generate IBGU for cluster"))?;
                self.store()
                    .create(&IMAGE_BASED_GROUP_UPGRADE, &ibgu, false)
                    .await
                    .map_err(|e| ControllerError::from(e).context("failed to create IBGU"))?;
                info!("Upgrade initiated. Created IBGU {} in the namespace {}", self.name(), cluster);
                self.set_condition(
                    ConditionType::UpgradeCompleted,
                    ConditionReason::InProgress,
                    ConditionStatus::False,
                    "Upgrade is initiated",
                );
                self.set_in_progress("Cluster upgrade is initiated");
                self.persist().await?;
                ibgu
            }
        };

        if ibgu_progressing(&ibgu) {
            self.set_condition(
                ConditionType::UpgradeCompleted,
                ConditionReason::InProgress,
                ConditionStatus::False,
                "Upgrade is in progress",
            );
            self.set_in_progress("Cluster upgrade is in progress");
            self.persist().await?;
            info!("Waiting for the upgrade of cluster {} to be completed", cluster);
            return Ok(Requeue::After(self.ctx.config.requeue.medium));
        }

        if seed_version(&ibgu) == release {
            match ibgu_failure(&ibgu) {
                Some(message) => {
                    self.set_condition(
                        ConditionType::UpgradeCompleted,
                        ConditionReason::Failed,
                        ConditionStatus::False,
                        &message,
                    );
                    self.set_failed("Cluster upgrade failed");
                }
                None => {
                    self.set_condition(
                        ConditionType::UpgradeCompleted,
                        ConditionReason::Completed,
                        ConditionStatus::True,
                        "Upgrade is completed",
                    );
                    self.store()
                        .delete(&IMAGE_BASED_GROUP_UPGRADE, Some(cluster), self.name())
                        .await
                        .map_err(|e| ControllerError::from(e).context("failed to cleanup IBGU"))?;
                }
            }
        } else {
            info!(
                "IBGU {} targets {} instead of {}, discarding it",
                self.name(),
                seed_version(&ibgu),
                release
            );
            self.store()
                .delete(&IMAGE_BASED_GROUP_UPGRADE, Some(cluster), self.name())
                .await
                .map_err(|e| ControllerError::from(e).context("failed to cleanup IBGU"))?;
            self.status.conditions.remove_condition(ConditionType::UpgradeCompleted);
        }
        self.persist().await?;
        Ok(Requeue::Done)
    }

    /// IBGU spec from the upgrade defaults with this cluster and release filled in
    async fn build_ibgu(&self, cluster: &str, release: &str) -> Result<Value, ControllerError> {
        let template = self.template()?;
        let namespace = self.template_namespace()?;
        let config_map_name = template
            .spec
            .templates
            .upgrade_defaults
            .as_deref()
            .filter(|n| !n.is_empty())
            .ok_or_else(|| {
                ControllerError::input(format!(
                    "ClusterTemplate {} has no upgradeDefaults configmap",
                    template.metadata.name.as_deref().unwrap_or_default()
                ))
            })?;
        let config_map = get_config_map(self.store(), config_map_name, &namespace).await?;
        let mut spec = config_map_document(&config_map, UPGRADE_DEFAULTS_KEY)?.to_value();
        if !spec.is_object() {
            return Err(ControllerError::input(format!(
                "the value of key {} from ConfigMap {} is not a mapping",
                UPGRADE_DEFAULTS_KEY, config_map_name
            )));
        }
        spec["ibuSpec"]["seedImageRef"]["version"] = json!(release);
        spec["clusterLabelSelectors"] = json!([{"matchLabels": {"name": cluster}}]);

        Ok(json!({
            "apiVersion": IMAGE_BASED_GROUP_UPGRADE.api_version(),
            "kind": IMAGE_BASED_GROUP_UPGRADE.kind,
            "metadata": {
                "name": self.name(),
                "namespace": cluster,
                "labels": {PROVISIONING_REQUEST_NAME_LABEL: self.name()},
            },
            "spec": spec,
        }))
    }
}
