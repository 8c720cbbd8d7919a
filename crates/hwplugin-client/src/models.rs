//! Hardware plugin provisioning API models
//!
//! Field names follow the plugin's JSON (camelCase).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Condition type reporting node provisioning
pub const CONDITION_PROVISIONED: &str = "Provisioned";
/// Condition type reporting node configuration
pub const CONDITION_CONFIGURED: &str = "Configured";

/// Request for a set of nodes, grouped by role
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct NodeAllocationRequest {
    pub cluster_id: String,
    pub site: String,
    pub boot_interface_label: String,
    #[serde(default)]
    pub config_transaction_id: i64,
    pub node_group: Vec<NodeGroup>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct NodeGroup {
    pub node_group_data: NodeGroupData,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct NodeGroupData {
    pub name: String,
    pub role: String,
    pub hw_profile: String,
    #[serde(default)]
    pub resource_group_id: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub resource_selector: BTreeMap<String, String>,
    /// Number of nodes requested for the group
    #[serde(default)]
    pub size: u32,
}

/// Returned by the create endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateNodeAllocationRequestResponse {
    pub node_allocation_request_id: String,
}

/// Allocation request as stored by the plugin, with its status
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct NodeAllocationRequestResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_allocation_request: Option<NodeAllocationRequest>,
    #[serde(default)]
    pub status: NodeAllocationRequestStatus,
}

impl NodeAllocationRequestResponse {
    /// Finds a status condition by type
    pub fn condition(&self, type_: &str) -> Option<&PluginCondition> {
        self.status.conditions.iter().find(|c| c.type_ == type_)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct NodeAllocationRequestStatus {
    #[serde(default)]
    pub conditions: Vec<PluginCondition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_config_transaction_id: Option<i64>,
}

/// Condition as reported by a plugin (status is a plain string)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct PluginCondition {
    #[serde(rename = "type")]
    pub type_: String,
    pub status: String,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<DateTime<Utc>>,
}

/// A node handed out for an allocation request
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct AllocatedNode {
    pub id: String,
    pub group_name: String,
    #[serde(default)]
    pub hw_profile: String,
    #[serde(default)]
    pub config_transaction_id: i64,
    pub bmc: Bmc,
    #[serde(default)]
    pub interfaces: Vec<Interface>,
    #[serde(default)]
    pub status: AllocatedNodeStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct Bmc {
    pub address: String,
    /// Secret holding the BMC credentials, in the plugin namespace
    pub credentials_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct Interface {
    pub name: String,
    pub mac_address: String,
    #[serde(default)]
    pub label: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct AllocatedNodeStatus {
    #[serde(default)]
    pub conditions: Vec<PluginCondition>,
}

/// Response from the api-versions endpoint
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ApiVersions {
    #[serde(default)]
    pub api_versions: Vec<ApiVersion>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ApiVersion {
    pub version: String,
}
