//! HardwareTemplate CRD
//!
//! Maps cluster node roles to hardware node groups and names the plugin
//! that allocates them.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[kube(
    group = "clcm.openshift.io",
    version = "v1alpha1",
    kind = "HardwareTemplate",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct HardwareTemplateSpec {
    /// Name of the HardwarePlugin serving allocation requests
    pub hardware_plugin_ref: String,

    /// Interface label identifying the boot interface on allocated nodes
    pub boot_interface_label: String,

    /// One entry per node group
    pub node_group_data: Vec<NodeGroupData>,

    /// Duration string (e.g. "90m"). Defaults to the controller's hardware budget.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hardware_provisioning_timeout: Option<String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extensions: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NodeGroupData {
    pub name: String,
    /// Node role served by this group ("master", "worker")
    pub role: String,
    pub hw_profile: String,
    #[serde(default)]
    pub resource_group_id: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub resource_selector: BTreeMap<String, String>,
}
