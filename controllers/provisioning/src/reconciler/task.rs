//! Per-pass reconciliation state.
//!
//! A [`ProvisioningTask`] owns a working copy of the request status. Phases
//! mutate it through the ledger and the phase setters below, and
//! [`ProvisioningTask::persist`] writes the difference back with an
//! optimistic-concurrency merge patch.

use super::Reconciler;
use crate::backoff::retry_on_conflict;
use crate::document::Document;
use crate::error::ControllerError;
use crate::store::{self, merge_patch_diff, ClusterStore, StoreError, PROVISIONING_REQUEST};
use crate::timeouts::Timeouts;
use chrono::Utc;
use crds::{
    ClusterTemplate, ConditionLedger, ConditionReason, ConditionStatus, ConditionType, HardwareTemplate,
    ProvisioningPhase, ProvisioningRequest, ProvisioningRequestStatus, ZtpStatus,
};
use hwplugin_client::HardwarePluginClientTrait;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::debug;

/// Merged template parameters produced by validation
#[derive(Debug, Clone, Default)]
pub struct ClusterInput {
    pub cluster_instance: Document,
    pub policy: Document,
}

/// State of one reconciliation pass over a ProvisioningRequest
pub struct ProvisioningTask<'a> {
    pub(crate) ctx: &'a Reconciler,
    pub(crate) object: ProvisioningRequest,
    /// Working copy, written back by `persist`
    pub(crate) status: ProvisioningRequestStatus,
    pub(crate) template: Option<ClusterTemplate>,
    pub(crate) hw_template: Option<HardwareTemplate>,
    pub(crate) timeouts: Timeouts,
    pub(crate) input: ClusterInput,
    plugin: Option<Arc<dyn HardwarePluginClientTrait>>,
    failed_in_pass: bool,
}

impl<'a> ProvisioningTask<'a> {
    pub fn new(ctx: &'a Reconciler, object: ProvisioningRequest) -> Self {
        let status = object.status.clone().unwrap_or_default();
        Self {
            ctx,
            object,
            status,
            template: None,
            hw_template: None,
            timeouts: Timeouts::default(),
            input: ClusterInput::default(),
            plugin: None,
            failed_in_pass: false,
        }
    }

    pub fn name(&self) -> &str {
        self.object.metadata.name.as_deref().unwrap_or_default()
    }

    pub(crate) fn store(&self) -> &'a dyn ClusterStore {
        self.ctx.store.as_ref()
    }

    /// The ClusterTemplate resolved by validation
    pub(crate) fn template(&self) -> Result<&ClusterTemplate, ControllerError> {
        self.template
            .as_ref()
            .ok_or_else(|| ControllerError::internal("the ClusterTemplate has not been resolved"))
    }

    pub(crate) fn template_namespace(&self) -> Result<String, ControllerError> {
        Ok(self.template()?.metadata.namespace.clone().unwrap_or_default())
    }

    /// Desired release: the request's own, else the template's
    pub(crate) fn release(&self) -> Option<String> {
        self.object
            .spec
            .release
            .clone()
            .filter(|r| !r.is_empty())
            .or_else(|| self.template.as_ref().map(|t| t.spec.release.clone()))
            .filter(|r| !r.is_empty())
    }

    /// Plugin client for the HardwareTemplate's plugin, built once per pass.
    /// Falls back to the plugin the allocation request was submitted to.
    pub(crate) async fn plugin(&mut self) -> Result<Arc<dyn HardwarePluginClientTrait>, ControllerError> {
        if let Some(plugin) = &self.plugin {
            return Ok(plugin.clone());
        }
        let recorded = self
            .status
            .extensions
            .node_allocation_request_ref
            .as_ref()
            .map(|r| r.hardware_plugin_ref.clone())
            .filter(|r| !r.is_empty());
        let plugin_ref = self
            .hw_template
            .as_ref()
            .map(|t| t.spec.hardware_plugin_ref.clone())
            .or(recorded)
            .ok_or_else(|| ControllerError::internal("the HardwareTemplate has not been resolved"))?;
        let plugin = self.ctx.plugins.connect(&plugin_ref).await?;
        self.plugin = Some(plugin.clone());
        Ok(plugin)
    }

    pub(crate) fn set_condition(
        &mut self,
        type_: ConditionType,
        reason: impl AsRef<str>,
        status: ConditionStatus,
        message: impl Into<String>,
    ) {
        self.status.conditions.set(type_, reason, status, message);
    }

    fn condition_matches(&self, type_: ConditionType, status: ConditionStatus, reasons: &[ConditionReason]) -> bool {
        self.status
            .conditions
            .find(type_)
            .is_some_and(|c| c.status == status && reasons.iter().any(|r| c.reason == r.as_str()))
    }

    // Phase setters

    fn set_phase(&mut self, phase: ProvisioningPhase, details: &str) {
        let state = &mut self.status.provisioning_status;
        if state.provisioning_phase != phase || state.provisioning_details != details {
            debug!("ProvisioningRequest {} is {}: {}", self.object.metadata.name.as_deref().unwrap_or_default(), phase.as_str(), details);
            state.provisioning_phase = phase;
            state.provisioning_details = details.to_string();
            state.update_time = Some(Utc::now());
        }
    }

    pub(crate) fn set_pending(&mut self, details: &str) {
        self.set_phase(ProvisioningPhase::Pending, details);
    }

    /// Progressing, unless this pass already recorded a failure
    pub(crate) fn set_in_progress(&mut self, details: &str) {
        if self.failed_in_pass && self.phase() == ProvisioningPhase::Failed {
            return;
        }
        self.set_phase(ProvisioningPhase::Progressing, details);
    }

    pub(crate) fn set_failed(&mut self, details: &str) {
        self.failed_in_pass = true;
        self.set_phase(ProvisioningPhase::Failed, details);
    }

    pub(crate) fn set_fulfilled(&mut self) {
        if self.phase() != ProvisioningPhase::Fulfilled {
            self.set_phase(ProvisioningPhase::Fulfilled, "Provisioning request has completed successfully");
        }
    }

    pub(crate) fn set_deleting(&mut self) {
        if self.phase() != ProvisioningPhase::Deleting {
            self.set_phase(ProvisioningPhase::Deleting, "Deletion is in progress");
        }
    }

    pub(crate) fn failed_this_pass(&self) -> bool {
        self.failed_in_pass
    }

    pub(crate) fn phase(&self) -> ProvisioningPhase {
        self.status.provisioning_status.provisioning_phase
    }

    // Predicates

    pub(crate) fn cluster_provision_present(&self) -> bool {
        self.status.conditions.find(ConditionType::ClusterProvisioned).is_some()
    }

    pub(crate) fn cluster_provision_completed(&self) -> bool {
        self.status.conditions.is_true(ConditionType::ClusterProvisioned)
    }

    pub(crate) fn cluster_provision_failed(&self) -> bool {
        self.status
            .conditions
            .find(ConditionType::ClusterProvisioned)
            .is_some_and(|c| c.reason == ConditionReason::Failed.as_str())
    }

    pub(crate) fn cluster_provision_timed_out_or_failed(&self) -> bool {
        self.condition_matches(
            ConditionType::ClusterProvisioned,
            ConditionStatus::False,
            &[ConditionReason::Failed, ConditionReason::TimedOut],
        )
    }

    pub(crate) fn cluster_config_completed(&self) -> bool {
        self.status.conditions.is_true(ConditionType::ConfigurationApplied)
    }

    /// True when configuration finished or was never requested
    pub(crate) fn hardware_configured(&self) -> bool {
        self.status
            .conditions
            .find(ConditionType::HardwareConfigured)
            .is_none_or(|c| c.status == ConditionStatus::True)
    }

    pub(crate) fn hardware_provision_timed_out_or_failed(&self) -> bool {
        self.condition_matches(
            ConditionType::HardwareProvisioned,
            ConditionStatus::False,
            &[ConditionReason::Failed, ConditionReason::TimedOut],
        )
    }

    pub(crate) fn upgrade_initiated(&self) -> bool {
        self.status.conditions.find(ConditionType::UpgradeCompleted).is_some()
    }

    pub(crate) fn upgrade_in_progress(&self) -> bool {
        self.condition_matches(ConditionType::UpgradeCompleted, ConditionStatus::False, &[ConditionReason::InProgress])
    }

    pub(crate) fn upgrade_completed(&self) -> bool {
        self.status.conditions.is_true(ConditionType::UpgradeCompleted)
    }

    /// No upgrade is blocking configuration progress reporting
    pub(crate) fn upgrade_settled(&self) -> bool {
        !self.upgrade_initiated() || self.upgrade_completed()
    }

    pub(crate) fn ztp_done(&self) -> bool {
        self.status
            .extensions
            .cluster_details
            .as_ref()
            .is_some_and(|d| d.ztp_status == Some(ZtpStatus::Done))
    }

    /// A phase ended in a terminal failure or timeout
    pub(crate) fn fatal_failure(&self) -> bool {
        [
            ConditionType::HardwareProvisioned,
            ConditionType::HardwareConfigured,
            ConditionType::ClusterProvisioned,
            ConditionType::ConfigurationApplied,
        ]
        .into_iter()
        .any(|t| {
            self.condition_matches(t, ConditionStatus::False, &[ConditionReason::Failed, ConditionReason::TimedOut])
        })
    }

    /// Writes the working status back to the API server.
    ///
    /// Only the difference against the live object is sent, guarded by its
    /// resourceVersion, and conflicts are retried against a fresh read.
    pub(crate) async fn persist(&mut self) -> Result<(), ControllerError> {
        let desired = serde_json::to_value(&self.status)?;
        let name = self.name().to_string();
        let store = self.store();
        retry_on_conflict(|| patch_status(store, &name, &desired))
            .await
            .map_err(|e| e.context(&format!("failed to update status for ProvisioningRequest {}", name)))?;
        self.object.status = Some(self.status.clone());
        Ok(())
    }
}

async fn patch_status(store: &dyn ClusterStore, name: &str, desired: &Value) -> Result<(), ControllerError> {
    let current = store
        .get(&PROVISIONING_REQUEST, None, name)
        .await?
        .ok_or_else(|| StoreError::NotFound(format!("ProvisioningRequest {}", name)))?;
    let diff = merge_patch_diff(current.get("status").unwrap_or(&Value::Null), desired);
    if diff.is_null() {
        return Ok(());
    }
    let patch = json!({
        "metadata": {"resourceVersion": store::resource_version(&current).unwrap_or_default()},
        "status": diff,
    });
    store.merge_patch_status(&PROVISIONING_REQUEST, None, name, &patch).await?;
    Ok(())
}
