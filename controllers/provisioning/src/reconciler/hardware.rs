//! Hardware provisioning through the hardware plugin.
//!
//! The HardwareTemplate and the rendered ClusterInstance produce one
//! allocation request per ProvisioningRequest. Once the plugin reports the
//! nodes as provisioned, their BMC and network identity is written back into
//! the rendered ClusterInstance before it is applied.

use super::task::ProvisioningTask;
use crate::error::ControllerError;
use crate::store::{self, ALLOCATED_NODE, SECRET};
use crate::timeouts;
use chrono::Utc;
use crds::{ConditionLedger, ConditionReason, ConditionStatus, ConditionType, HardwareTemplate, ProvisioningPhase};
use hwplugin_client::{
    AllocatedNode, CONDITION_CONFIGURED, CONDITION_PROVISIONED, Interface, NodeAllocationRequest, NodeGroup,
    NodeGroupData,
};
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap, VecDeque};
use tracing::{debug, error, info, warn};

/// Template parameter naming the site the nodes are allocated from
pub const OCLOUD_SITE_ID_KEY: &str = "oCloudSiteId";

/// Outcome of polling the allocation request
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HardwareProgress {
    pub provisioned: bool,
    /// `None` when no configuration change was ever requested
    pub configured: Option<bool>,
    pub timed_out_or_failed: bool,
}

/// Number of ClusterInstance nodes per role
pub fn role_counts(rendered: &Value) -> Result<BTreeMap<String, u32>, ControllerError> {
    let nodes = rendered
        .pointer("/spec/nodes")
        .and_then(Value::as_array)
        .ok_or_else(|| ControllerError::input("spec.nodes not found in cluster instance"))?;
    let mut counts = BTreeMap::new();
    for node in nodes {
        let role = node.get("role").and_then(Value::as_str).unwrap_or_default();
        *counts.entry(role.to_string()).or_insert(0) += 1;
    }
    Ok(counts)
}

/// One node group per template entry, sized by the nodes of its role
pub fn build_node_groups(template: &HardwareTemplate, counts: &BTreeMap<String, u32>) -> Vec<NodeGroup> {
    template
        .spec
        .node_group_data
        .iter()
        .map(|group| NodeGroup {
            node_group_data: NodeGroupData {
                name: group.name.clone(),
                role: group.role.clone(),
                hw_profile: group.hw_profile.clone(),
                resource_group_id: group.resource_group_id.clone(),
                resource_selector: group.resource_selector.clone(),
                size: counts.get(&group.role).copied().unwrap_or_default(),
            },
        })
        .collect()
}

/// Checks a submitted request against the current template. Only hwProfile
/// may differ; returns true when it does.
pub fn compare_with_template(template: &HardwareTemplate, existing: &NodeAllocationRequest) -> Result<bool, String> {
    if existing.boot_interface_label != template.spec.boot_interface_label {
        return Err(format!(
            "bootInterfaceLabel changed from {} to {}, which is not allowed for an existing NodeAllocationRequest",
            existing.boot_interface_label, template.spec.boot_interface_label
        ));
    }
    let mut changed = false;
    for group in &existing.node_group {
        let data = &group.node_group_data;
        let Some(wanted) = template.spec.node_group_data.iter().find(|g| g.name == data.name) else {
            return Err(format!(
                "node group {} found in NodeAllocationRequest but not in Hardware Template",
                data.name
            ));
        };
        changed |= wanted.hw_profile != data.hw_profile;
    }
    Ok(changed)
}

/// First node group name for each role
pub fn role_to_group(request: &NodeAllocationRequest) -> HashMap<&str, &str> {
    let mut map = HashMap::new();
    for group in &request.node_group {
        map.entry(group.node_group_data.role.as_str())
            .or_insert(group.node_group_data.name.as_str());
    }
    map
}

/// MAC address of the interface carrying the boot label
pub fn boot_mac_address(interfaces: &[Interface], label: &str) -> Result<String, String> {
    interfaces
        .iter()
        .find(|i| i.label == label)
        .map(|i| i.mac_address.clone())
        .ok_or_else(|| format!("no boot interface found; missing interface with label {:?}", label))
}

/// Fills `macAddress` on every interface of `node`. The input node declares
/// which hardware label each named interface corresponds to.
fn assign_mac_addresses(input_node: Option<&Value>, hardware: &[Interface], node: &mut Value) -> Result<(), String> {
    let host_name = node.get("hostName").and_then(Value::as_str).unwrap_or_default().to_string();
    let declared: Vec<(&str, &str)> = input_node
        .and_then(|n| n.pointer("/nodeNetwork/interfaces"))
        .and_then(Value::as_array)
        .map(|interfaces| {
            interfaces
                .iter()
                .filter_map(|i| Some((i.get("name")?.as_str()?, i.get("label")?.as_str()?)))
                .collect()
        })
        .unwrap_or_default();

    let interfaces = node
        .pointer_mut("/nodeNetwork/interfaces")
        .and_then(Value::as_array_mut)
        .ok_or_else(|| format!("nodeNetwork.interfaces not found for node {}", host_name))?;

    for (i, interface) in interfaces.iter_mut().enumerate() {
        let name = interface
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| format!("missing or invalid 'name' in interface at index {}", i))?
            .to_string();
        let mac = declared
            .iter()
            .filter(|(declared_name, _)| *declared_name == name)
            .find_map(|(_, label)| hardware.iter().find(|h| h.label == *label))
            .map(|h| h.mac_address.clone())
            .ok_or_else(|| format!("mac address not assigned for interface {}, node name {}", name, host_name))?;
        interface["macAddress"] = json!(mac);
    }
    Ok(())
}

/// Writes allocated node identity into the rendered ClusterInstance nodes.
///
/// Nodes are matched by role to their node group and consumed in allocation
/// order. Returns the `(allocated node id, hostname)` pairs assigned.
pub fn apply_node_configuration(
    allocated: &[AllocatedNode],
    request: &NodeAllocationRequest,
    input_nodes: &[Value],
    rendered: &mut Value,
) -> Result<Vec<(String, String)>, String> {
    let mut by_group: HashMap<&str, VecDeque<&AllocatedNode>> = HashMap::new();
    for node in allocated {
        by_group.entry(node.group_name.as_str()).or_default().push_back(node);
    }
    let groups = role_to_group(request);

    let nodes = rendered
        .pointer_mut("/spec/nodes")
        .and_then(Value::as_array_mut)
        .ok_or_else(|| "spec.nodes not found in cluster instance".to_string())?;

    let mut assigned = Vec::new();
    let mut unmatched = Vec::new();
    for (i, node) in nodes.iter_mut().enumerate() {
        let role = node.get("role").and_then(Value::as_str).unwrap_or_default();
        let host_name = node.get("hostName").and_then(Value::as_str).unwrap_or_default().to_string();
        let Some(hw) = groups
            .get(role)
            .and_then(|group| by_group.get_mut(group))
            .and_then(VecDeque::pop_front)
        else {
            unmatched.push(format!("Index: {}, Host Name: {}", i, host_name));
            continue;
        };

        let mut updated = node.clone();
        updated["bmcAddress"] = json!(hw.bmc.address);
        updated["bmcCredentialsName"] = json!({"name": hw.bmc.credentials_name});
        let boot_mac = boot_mac_address(&hw.interfaces, &request.boot_interface_label)
            .map_err(|e| format!("failed to get boot MAC for node '{}': {}", host_name, e))?;
        updated["bootMACAddress"] = json!(boot_mac);
        let input_node = input_nodes
            .iter()
            .find(|n| n.get("hostName").and_then(Value::as_str) == Some(host_name.as_str()));
        assign_mac_addresses(input_node, &hw.interfaces, &mut updated)
            .map_err(|e| format!("failed to assign MACs for node '{}': {}", host_name, e))?;

        *node = updated;
        assigned.push((hw.id.clone(), host_name));
    }

    if !unmatched.is_empty() {
        return Err(format!("failed to find matches for the following nodes: {}", unmatched.join("; ")));
    }
    Ok(assigned)
}

impl ProvisioningTask<'_> {
    /// Builds the allocation request from the HardwareTemplate, recording
    /// `HardwareTemplateRendered`
    pub(crate) async fn handle_render_hardware_template(
        &mut self,
        rendered: &Value,
    ) -> Result<NodeAllocationRequest, ControllerError> {
        let result = self.render_hardware_template(rendered).await;
        if result.as_ref().is_err_and(|e| !e.is_input_error()) {
            return result;
        }
        match &result {
            Ok(_) => {
                self.set_condition(
                    ConditionType::HardwareTemplateRendered,
                    ConditionReason::Completed,
                    ConditionStatus::True,
                    "Rendered Hardware template successfully",
                );
            }
            Err(e) => {
                error!("Failed to render the HardwareTemplate for ProvisioningRequest {}: {}", self.name(), e);
                let message = format!("Failed to render the Hardware template: {}", e);
                self.set_condition(
                    ConditionType::HardwareTemplateRendered,
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

    async fn render_hardware_template(&mut self, rendered: &Value) -> Result<NodeAllocationRequest, ControllerError> {
        let template = self
            .hw_template
            .clone()
            .ok_or_else(|| ControllerError::internal("the HardwareTemplate has not been resolved"))?;
        let counts = role_counts(rendered)?;
        let site = self
            .object
            .spec
            .template_parameters
            .get(OCLOUD_SITE_ID_KEY)
            .and_then(Value::as_str)
            .ok_or_else(|| ControllerError::input(format!("failed to get {} from templateParameters", OCLOUD_SITE_ID_KEY)))?
            .to_string();

        let request = NodeAllocationRequest {
            cluster_id: store::name(rendered).to_string(),
            site,
            boot_interface_label: template.spec.boot_interface_label.clone(),
            config_transaction_id: self.object.metadata.generation.unwrap_or_default(),
            node_group: build_node_groups(&template, &counts),
        };

        let Some(reference) = self.status.extensions.node_allocation_request_ref.clone() else {
            return Ok(request);
        };
        if reference.node_allocation_request_id.is_empty() {
            return Ok(request);
        }
        if !reference.hardware_plugin_ref.is_empty() && reference.hardware_plugin_ref != template.spec.hardware_plugin_ref {
            return Err(ControllerError::input(format!(
                "hardwarePluginRef changed from {} to {}, which is not allowed for an existing NodeAllocationRequest",
                reference.hardware_plugin_ref, template.spec.hardware_plugin_ref
            )));
        }
        let plugin = self.plugin().await?;
        if let Some(existing) = plugin
            .get_node_allocation_request(&reference.node_allocation_request_id)
            .await?
            .and_then(|r| r.node_allocation_request)
        {
            compare_with_template(&template, &existing).map_err(ControllerError::input)?;
        }
        Ok(request)
    }

    /// Submits the allocation request, or updates it when its node groups changed
    pub(crate) async fn create_or_update_node_allocation_request(
        &mut self,
        request: &NodeAllocationRequest,
    ) -> Result<(), ControllerError> {
        let plugin = self.plugin().await?;
        let Some(id) = self.status.extensions.node_allocation_request_id().map(str::to_string) else {
            let id = plugin
                .create_node_allocation_request(request)
                .await
                .map_err(|e| ControllerError::from(e).context("failed to create the NodeAllocationRequest"))?;
            let reference = self.status.extensions.node_allocation_request_ref_mut();
            reference.node_allocation_request_id = id.clone();
            reference.hardware_plugin_ref = plugin.hardware_plugin_ref().to_string();
            reference.hardware_provisioning_check_start = Some(Utc::now());
            self.persist().await?;
            info!("Created NodeAllocationRequest {} for ProvisioningRequest {}", id, self.name());
            return Ok(());
        };

        let existing = plugin
            .get_node_allocation_request(&id)
            .await?
            .and_then(|r| r.node_allocation_request)
            .ok_or_else(|| ControllerError::internal(format!("node allocation request {} does not exist", id)))?;
        if existing.node_group == request.node_group {
            return Ok(());
        }
        if self.phase() == ProvisioningPhase::Fulfilled {
            warn!(
                "NodeAllocationRequest {} changes are not applied once ProvisioningRequest {} is fulfilled",
                id,
                self.name()
            );
            return Ok(());
        }

        plugin
            .update_node_allocation_request(&id, request)
            .await
            .map_err(|e| ControllerError::from(e).context(&format!("failed to update NodeAllocationRequest {}", id)))?;
        let reference = self.status.extensions.node_allocation_request_ref_mut();
        if reference.hardware_configuring_check_start.is_none() {
            reference.hardware_configuring_check_start = Some(Utc::now());
        }
        self.persist().await?;
        info!("NodeAllocationRequest {} configuration changes have been submitted", id);
        Ok(())
    }

    /// Polls provisioning, back-fills node data into `rendered` once
    /// provisioned, then polls configuration
    pub(crate) async fn wait_for_hardware_data(
        &mut self,
        request: &NodeAllocationRequest,
        rendered: &mut Value,
    ) -> Result<HardwareProgress, ControllerError> {
        let mut progress = HardwareProgress::default();
        let Some((provisioned, failed)) = self.check_hardware_status(CONDITION_PROVISIONED).await? else {
            return Ok(progress);
        };
        progress.provisioned = provisioned;
        progress.timed_out_or_failed = failed;
        if !provisioned {
            return Ok(progress);
        }

        self.update_cluster_instance(request, rendered)
            .await
            .map_err(|e| e.context("failed to update the rendered cluster instance"))?;

        if let Some((configured, failed)) = self.check_hardware_status(CONDITION_CONFIGURED).await? {
            progress.configured = Some(configured);
            progress.timed_out_or_failed = failed;
        }
        Ok(progress)
    }

    /// Provisioning status only, for re-deriving state when the pass cannot render
    pub(crate) async fn check_hardware_provision_status(&mut self) -> Result<HardwareProgress, ControllerError> {
        let (provisioned, timed_out_or_failed) =
            self.check_hardware_status(CONDITION_PROVISIONED).await?.unwrap_or_default();
        Ok(HardwareProgress {
            provisioned,
            configured: None,
            timed_out_or_failed,
        })
    }

    /// Mirrors one plugin condition into `HardwareProvisioned` or
    /// `HardwareConfigured`. Returns `(true, timed out or failed)`, or `None`
    /// for an absent Configured condition with no configuration pending.
    async fn check_hardware_status(&mut self, plugin_condition: &str) -> Result<Option<(bool, bool)>, ControllerError> {
        let id = self
            .status
            .extensions
            .node_allocation_request_id()
            .map(str::to_string)
            .ok_or_else(|| ControllerError::internal("status.nodeAllocationRequestRef is empty"))?;
        let plugin = self.plugin().await?;
        let response = plugin
            .get_node_allocation_request(&id)
            .await?
            .ok_or_else(|| ControllerError::internal(format!("node allocation request {} does not exist", id)))?;

        let configuring = plugin_condition == CONDITION_CONFIGURED;
        let (condition_type, activity) = if configuring {
            (ConditionType::HardwareConfigured, "configuring")
        } else {
            (ConditionType::HardwareProvisioned, "provisioning")
        };
        let observed = response.condition(plugin_condition).cloned();
        let start = |task: &Self| {
            let reference = task.status.extensions.node_allocation_request_ref.as_ref();
            if configuring {
                reference.and_then(|r| r.hardware_configuring_check_start)
            } else {
                reference.and_then(|r| r.hardware_provisioning_check_start)
            }
        };

        // A timeout or failure stays in place until the plugin reports success
        // or a configuration change opens a new window.
        let plugin_done = observed
            .as_ref()
            .is_some_and(|c| ConditionStatus::from_str_lossy(&c.status) == ConditionStatus::True);
        let terminal = self
            .status
            .conditions
            .find(condition_type)
            .filter(|c| {
                c.status == ConditionStatus::False
                    && (c.reason == ConditionReason::TimedOut.as_str() || c.reason == ConditionReason::Failed.as_str())
            })
            .map(|c| c.message.clone());
        if let Some(message) = terminal {
            if !plugin_done && start(self).is_none() {
                self.set_failed(&message);
                self.persist().await?;
                return Ok(Some((false, true)));
            }
        }

        let mut timed_out_or_failed = false;
        let (mut status, mut reason, mut message) = match observed {
            None => {
                if configuring && start(self).is_none() {
                    return Ok(None);
                }
                let message = format!("Waiting for NodeAllocationRequest ({}) to be processed", id);
                self.set_in_progress(&message);
                (ConditionStatus::Unknown, ConditionReason::Unknown.as_str().to_string(), message)
            }
            Some(condition) => {
                let status = ConditionStatus::from_str_lossy(&condition.status);
                if configuring {
                    let reference = self.status.extensions.node_allocation_request_ref_mut();
                    if status == ConditionStatus::True {
                        reference.hardware_configuring_check_start = None;
                    } else if reference.hardware_configuring_check_start.is_none() {
                        reference.hardware_configuring_check_start = Some(Utc::now());
                    }
                }
                let mut message = condition.message;
                if status == ConditionStatus::False {
                    message = format!("Hardware {} is in progress", activity);
                    self.set_in_progress(&message);
                    if condition.reason == ConditionReason::Failed.as_str() {
                        timed_out_or_failed = true;
                        message = format!("Hardware {} failed", activity);
                        self.set_failed(&message);
                    }
                }
                (status, condition.reason, message)
            }
        };

        if status != ConditionStatus::True
            && reason != ConditionReason::Failed.as_str()
            && timeouts::exceeded(start(self), self.timeouts.hardware_provisioning)
        {
            status = ConditionStatus::False;
            reason = ConditionReason::TimedOut.as_str().to_string();
            message = if configuring {
                "Hardware configuration timed out".to_string()
            } else {
                "Hardware provisioning timed out".to_string()
            };
            timed_out_or_failed = true;
            self.set_failed(&message);
        }
        if timed_out_or_failed {
            let reference = self.status.extensions.node_allocation_request_ref_mut();
            if configuring {
                reference.hardware_configuring_check_start = None;
            } else {
                reference.hardware_provisioning_check_start = None;
            }
        }

        self.set_condition(condition_type, &reason, status, &message);
        info!("NodeAllocationRequest ({}) {} status: {}", id, activity, message);
        self.persist()
            .await
            .map_err(|e| e.context(&format!("failed to update Hardware {} status", activity)))?;
        Ok(Some((status == ConditionStatus::True, timed_out_or_failed)))
    }

    /// Back-fills allocated node data into the rendered ClusterInstance,
    /// recording `HardwareNodeConfigApplied`
    async fn update_cluster_instance(
        &mut self,
        request: &NodeAllocationRequest,
        rendered: &mut Value,
    ) -> Result<(), ControllerError> {
        let id = self.status.extensions.node_allocation_request_id().unwrap_or_default().to_string();
        let plugin = self.plugin().await?;
        let allocated = plugin.get_allocated_nodes(&id).await?;
        if allocated.iter().any(|n| n.bmc.credentials_name.is_empty()) {
            return Err(ControllerError::internal(format!(
                "failed to collect hardware node details for NodeAllocationRequest {}: the AllocatedNode does not have BMC details",
                id
            )));
        }
        let cluster = store::name(rendered).to_string();
        self.copy_bmc_secrets(&allocated, &cluster)
            .await
            .map_err(|e| e.context("failed to copy BMC secret"))?;

        let input_nodes: Vec<Value> = self
            .input
            .cluster_instance
            .get("nodes")
            .map(|nodes| nodes.to_value())
            .and_then(|nodes| nodes.as_array().cloned())
            .unwrap_or_default();

        match apply_node_configuration(&allocated, request, &input_nodes, rendered) {
            Ok(assigned) => {
                for (node_id, host_name) in &assigned {
                    self.record_hostname(node_id, host_name).await?;
                    self.status
                        .extensions
                        .allocated_node_host_map
                        .insert(node_id.clone(), host_name.clone());
                }
                self.set_condition(
                    ConditionType::HardwareNodeConfigApplied,
                    ConditionReason::Completed,
                    ConditionStatus::True,
                    "Node configuration has been applied to the rendered ClusterInstance",
                );
                self.persist().await?;
                Ok(())
            }
            Err(e) => {
                let message = format!("Failed to apply node configuration to the rendered ClusterInstance: {}", e);
                self.set_condition(
                    ConditionType::HardwareNodeConfigApplied,
                    ConditionReason::NotApplied,
                    ConditionStatus::False,
                    &message,
                );
                self.set_failed(&message);
                self.persist().await?;
                Err(ControllerError::Reconciliation(format!(
                    "failed to apply node configuration for NodeAllocationRequest {}: {}",
                    id, e
                )))
            }
        }
    }

    /// Copies each node's BMC secret from the plugin namespace, skipping ones already present
    async fn copy_bmc_secrets(&self, allocated: &[AllocatedNode], cluster: &str) -> Result<(), ControllerError> {
        let source_namespace = &self.ctx.config.hardware_plugin_namespace;
        for node in allocated {
            let name = &node.bmc.credentials_name;
            if self.store().get(&SECRET, Some(cluster), name).await?.is_some() {
                debug!("BMC secret {} already exists in namespace {}", name, cluster);
                continue;
            }
            let source = self
                .store()
                .get(&SECRET, Some(source_namespace), name)
                .await?
                .ok_or_else(|| {
                    ControllerError::internal(format!(
                        "copy BMC secret {} from the plugin namespace {} to the cluster namespace {} failed: not found",
                        name, source_namespace, cluster
                    ))
                })?;
            let copy = json!({
                "apiVersion": "v1",
                "kind": "Secret",
                "metadata": {"name": name, "namespace": cluster},
                "type": source.get("type").cloned().unwrap_or_else(|| json!("Opaque")),
                "data": source.get("data").cloned().unwrap_or_else(|| json!({})),
            });
            self.store().create(&SECRET, &copy, false).await?;
        }
        Ok(())
    }

    /// Sets `status.hostname` on the plugin's AllocatedNode resource
    async fn record_hostname(&self, node_id: &str, host_name: &str) -> Result<(), ControllerError> {
        let namespace = &self.ctx.config.hardware_plugin_namespace;
        let Some(node) = self.store().get(&ALLOCATED_NODE, Some(namespace), node_id).await? else {
            warn!("AllocatedNode {} not found in namespace {}", node_id, namespace);
            return Ok(());
        };
        if node.pointer("/status/hostname").and_then(Value::as_str) == Some(host_name) {
            return Ok(());
        }
        self.store()
            .merge_patch_status(&ALLOCATED_NODE, Some(namespace), node_id, &json!({"status": {"hostname": host_name}}))
            .await
            .map_err(|e| ControllerError::from(e).context(&format!("failed to update status for node '{}'", host_name)))?;
        Ok(())
    }
}
