//! Per-pass sequencing of the reconciliation phases.

use super::deletion::{self, DeletionStage};
use super::task::ProvisioningTask;
use super::{Reconciler, Requeue};
use crate::error::ControllerError;
use crate::store::{self, LabelQuery, AGENT, MANAGED_CLUSTER, PROVISIONING_REQUEST};
use crate::timeouts;
use chrono::Utc;
use crds::{ConditionLedger, ConditionType, ProvisionedResources, ProvisioningPhase, ProvisioningRequest};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

/// ManagedCluster label carrying the cluster ID
pub const CLUSTER_ID_LABEL: &str = "clusterID";
/// Label tying a cluster and its agents to the template they came from
pub const TEMPLATE_ID_LABEL: &str = "clustertemplates.clcm.openshift.io/templateId";
/// Agent label naming the hardware plugin of its node
pub const HARDWARE_PLUGIN_REF_LABEL: &str = "clcm.openshift.io/hardwarePluginRef";
/// Agent label naming the plugin's node id
pub const HARDWARE_NODE_ID_LABEL: &str = "clcm.openshift.io/hwMgrNodeId";
/// Label selecting the agents of a cluster
pub const AGENT_CLUSTER_NAMESPACE_LABEL: &str = "agent-install.openshift.io/clusterdeployment-namespace";

const PENDING_DETAILS: &str = "Validating and preparing resources";
const OVERALL_TIMEOUT_DETAILS: &str = "Provisioning request has timed out";

/// Labels to add so that `current` carries every entry of `desired`, or `None` if it already does
fn missing_labels(current: &BTreeMap<String, String>, desired: &[(&str, &str)]) -> Option<Value> {
    let patch: serde_json::Map<String, Value> = desired
        .iter()
        .filter(|(k, v)| current.get(*k).map(String::as_str) != Some(*v))
        .map(|(k, v)| (k.to_string(), json!(v)))
        .collect();
    (!patch.is_empty()).then(|| json!({"metadata": {"labels": patch}}))
}

impl Reconciler {
    /// One reconciliation pass over the named request
    pub async fn reconcile(&self, name: &str) -> Result<Requeue, ControllerError> {
        tokio::time::sleep(self.config.pass_delay).await;

        let Some(live) = self.store.get(&PROVISIONING_REQUEST, None, name).await? else {
            debug!("ProvisioningRequest {} is gone", name);
            self.owners.forget_owner(name);
            return Ok(Requeue::Done);
        };
        info!("[Reconcile ProvisioningRequest] {}", name);
        let object: ProvisioningRequest = store::decode(&PROVISIONING_REQUEST, live.clone())?;
        let mut task = ProvisioningTask::new(self, object);

        if store::is_terminating(&live) {
            return match task.advance_deletion(&live).await {
                Ok(DeletionStage::Removed | DeletionStage::NotDeleting) => Ok(Requeue::Done),
                Ok(stage) => {
                    debug!("ProvisioningRequest {} deletion at {:?}", name, stage);
                    Ok(Requeue::After(self.config.requeue.short))
                }
                Err(e) => {
                    warn!("Encountered error while handling the ProvisioningRequest finalizer: {}", e);
                    Ok(Requeue::After(self.config.requeue.short))
                }
            };
        }

        if deletion::add_finalizer(self.store.as_ref(), &live).await? {
            return Ok(Requeue::After(self.config.requeue.immediate));
        }

        task.run().await
    }
}

impl ProvisioningTask<'_> {
    /// Walks every phase, then applies the overall timeout whatever the outcome
    pub(crate) async fn run(&mut self) -> Result<Requeue, ControllerError> {
        self.observe_generation();

        let result = self.run_phases().await;
        if self.apply_overall_timeout() {
            self.persist().await?;
            return result.map(|_| Requeue::Done);
        }
        result
    }

    fn observe_generation(&mut self) {
        let generation = self.object.metadata.generation;
        if self.status.observed_generation != generation {
            self.set_pending(PENDING_DETAILS);
            self.status.provisioning_status.provisioning_started_at = None;
            self.status.observed_generation = generation;
        }
        if self.status.provisioning_status.provisioning_started_at.is_none()
            && matches!(self.phase(), ProvisioningPhase::Pending | ProvisioningPhase::Progressing)
        {
            self.status.provisioning_status.provisioning_started_at = Some(Utc::now());
        }
    }

    /// Forces Failed once the overall budget is spent. Returns true if the phase changed.
    fn apply_overall_timeout(&mut self) -> bool {
        let status = &self.status.provisioning_status;
        let running = matches!(
            status.provisioning_phase,
            ProvisioningPhase::Pending | ProvisioningPhase::Progressing
        );
        if !running || !timeouts::exceeded(status.provisioning_started_at, self.timeouts.overall()) {
            return false;
        }
        warn!("ProvisioningRequest {} exceeded its overall provisioning timeout", self.name());
        self.set_failed(OVERALL_TIMEOUT_DETAILS);
        true
    }

    async fn run_phases(&mut self) -> Result<Requeue, ControllerError> {
        if let Err(e) = self.handle_validation().await {
            return self.recover_from(e).await;
        }
        if self.apply_overall_timeout() {
            self.persist().await?;
        }

        let mut rendered = match self.handle_render_cluster_instance().await {
            Ok(rendered) => rendered,
            Err(e) => return self.recover_from(e).await,
        };

        if self.hw_template.is_some() {
            let request = match self.handle_render_hardware_template(&rendered).await {
                Ok(request) => request,
                Err(e) => return self.recover_from(e).await,
            };
            self.create_or_update_node_allocation_request(&request).await?;

            let progress = self.wait_for_hardware_data(&request, &mut rendered).await?;
            if progress.timed_out_or_failed {
                return Ok(Requeue::Done);
            }
            if !progress.provisioned {
                info!(
                    "Waiting for NodeAllocationRequest {} to be provisioned",
                    self.status.extensions.node_allocation_request_id().unwrap_or_default()
                );
                return Ok(Requeue::After(self.ctx.config.requeue.medium));
            }
        }

        if let Err(e) = self.handle_cluster_resources(&mut rendered).await {
            if !e.is_input_error() {
                return Err(e);
            }
            self.check_deploy_config_state().await?;
            // missing prerequisites are not watched
            return Ok(Requeue::After(self.ctx.config.requeue.medium));
        }

        self.handle_cluster_installation(&rendered).await?;
        self.configure_and_finalize().await
    }

    /// Input errors leave the request waiting on a user fix, while already
    /// created dependents are still followed
    async fn recover_from(&mut self, error: ControllerError) -> Result<Requeue, ControllerError> {
        if error.is_input_error() {
            debug!("ProvisioningRequest {} input error: {}", self.name(), error);
            return self.check_deploy_config_state().await;
        }
        Err(error)
    }

    /// Re-derives hardware, installation and policy status from what exists
    pub(crate) async fn check_deploy_config_state(&mut self) -> Result<Requeue, ControllerError> {
        let has_request = self.status.extensions.node_allocation_request_id().is_some();
        if has_request {
            let progress = self.check_hardware_provision_status().await?;
            if progress.timed_out_or_failed {
                return Ok(Requeue::Done);
            }
            if !progress.provisioned {
                return Ok(Requeue::After(self.ctx.config.requeue.medium));
            }
        }

        let hardware_done = !has_request || self.status.conditions.find(ConditionType::HardwareProvisioned).is_some();
        if hardware_done {
            let Some(cluster) = self.status.extensions.cluster_name().map(str::to_string) else {
                return Ok(Requeue::Done);
            };
            self.check_cluster_provision_status(&cluster).await?;
        }

        if self.cluster_provision_present() && !self.cluster_provision_timed_out_or_failed() {
            let requeue = self.handle_cluster_policy_configuration().await?;
            if !self.cluster_provision_completed() || requeue {
                return Ok(Requeue::After(self.ctx.config.requeue.long));
            }
        }
        Ok(Requeue::Done)
    }

    /// Policy, upgrade and the final Fulfilled transition
    async fn configure_and_finalize(&mut self) -> Result<Requeue, ControllerError> {
        if !self.cluster_provision_present() {
            return Ok(Requeue::After(self.ctx.config.requeue.medium));
        }
        if self.cluster_provision_timed_out_or_failed() {
            return Ok(Requeue::Done);
        }

        let requeue = self.handle_cluster_policy_configuration().await?;
        if !self.cluster_provision_completed() || requeue {
            return Ok(Requeue::After(self.ctx.config.requeue.long));
        }

        let cluster = self
            .status
            .extensions
            .cluster_name()
            .map(str::to_string)
            .ok_or_else(|| ControllerError::internal("status.clusterDetails is empty"))?;

        if self.ztp_done() {
            let requested = match self.should_upgrade(&cluster).await {
                Ok(requested) => requested,
                Err(e) if e.is_input_error() => {
                    self.set_failed(&e.to_string());
                    self.persist().await?;
                    return Ok(Requeue::Done);
                }
                Err(e) => return Err(e),
            };
            if requested || (self.upgrade_initiated() && !self.upgrade_completed()) {
                let outcome = self.handle_upgrade(&cluster).await?;
                if outcome != Requeue::Done || !self.upgrade_settled() {
                    return Ok(outcome);
                }
            }
        }

        if self.cluster_config_completed() && self.hardware_configured() && self.upgrade_settled() {
            if self.failed_this_pass() || self.fatal_failure() {
                return Ok(Requeue::Done);
            }
            self.finalize_provisioning(&cluster).await?;
            return Ok(Requeue::After(self.ctx.config.requeue.long));
        }
        Ok(Requeue::Done)
    }

    /// Marks Fulfilled and records what the provisioned cluster exposes
    async fn finalize_provisioning(&mut self, cluster: &str) -> Result<(), ControllerError> {
        self.set_fulfilled();
        self.update_o_cloud_node_cluster_id(cluster).await?;
        self.add_post_provisioning_labels(cluster).await?;
        self.persist().await
    }

    async fn update_o_cloud_node_cluster_id(&mut self, cluster: &str) -> Result<(), ControllerError> {
        let managed = self
            .store()
            .get(&MANAGED_CLUSTER, None, cluster)
            .await?
            .ok_or_else(|| ControllerError::internal(format!("failed to get ManagedCluster {}", cluster)))?;
        let Some(id) = store::labels(&managed).get(CLUSTER_ID_LABEL).cloned() else {
            debug!("ManagedCluster {} has no {} label yet", cluster, CLUSTER_ID_LABEL);
            return Ok(());
        };
        self.status.provisioning_status.provisioned_resources = Some(ProvisionedResources {
            o_cloud_node_cluster_id: Some(id),
        });
        Ok(())
    }

    async fn add_post_provisioning_labels(&self, cluster: &str) -> Result<(), ControllerError> {
        let template_id = self.template()?.spec.template_id.clone();

        if let Some(managed) = self.store().get(&MANAGED_CLUSTER, None, cluster).await? {
            if let Some(patch) = missing_labels(&store::labels(&managed), &[(TEMPLATE_ID_LABEL, template_id.as_str())]) {
                self.store()
                    .merge_patch(&MANAGED_CLUSTER, None, cluster, &patch)
                    .await
                    .map_err(|e| ControllerError::from(e).context(&format!("failed to label ManagedCluster {}", cluster)))?;
            }
        }

        let agents = self
            .store()
            .list(&AGENT, Some(cluster), &LabelQuery::all().eq(AGENT_CLUSTER_NAMESPACE_LABEL, cluster))
            .await?;
        if agents.is_empty() {
            return Err(ControllerError::internal(format!(
                "the expected Agents were not found in the {} namespace",
                cluster
            )));
        }

        let plugin_ref = self.hw_template.as_ref().map(|t| t.spec.hardware_plugin_ref.as_str());
        for agent in &agents {
            let name = store::name(agent);
            let mut desired = vec![(TEMPLATE_ID_LABEL, template_id.as_str())];
            if let Some(plugin_ref) = plugin_ref {
                let host = agent.pointer("/spec/hostname").and_then(Value::as_str).unwrap_or_default();
                let node_id = self
                    .status
                    .extensions
                    .allocated_node_host_map
                    .iter()
                    .find(|(_, h)| !host.is_empty() && h.as_str() == host)
                    .map(|(id, _)| id.as_str());
                match node_id {
                    Some(node_id) => {
                        desired.push((HARDWARE_PLUGIN_REF_LABEL, plugin_ref));
                        desired.push((HARDWARE_NODE_ID_LABEL, node_id));
                    }
                    None => warn!("No allocated node found for Agent {} (hostname {})", name, host),
                }
            }
            if let Some(patch) = missing_labels(&store::labels(agent), &desired) {
                self.store()
                    .merge_patch(&AGENT, Some(cluster), name, &patch)
                    .await
                    .map_err(|e| ControllerError::from(e).context(&format!("failed to label Agent {}", name)))?;
                debug!("Labeled Agent {} in namespace {}", name, cluster);
            }
        }
        Ok(())
    }
}
