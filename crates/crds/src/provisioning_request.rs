//! ProvisioningRequest CRD
//!
//! Cluster-scoped request for a fully provisioned and configured cluster,
//! built from a versioned ClusterTemplate plus per-request parameters.

use crate::conditions::Condition;
use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// API group shared by ProvisioningRequest and ClusterTemplate
pub const PROVISIONING_GROUP: &str = "o2ims.provisioning.oran.org";

/// Finalizer held on every live ProvisioningRequest until its dependents are gone
pub const PROVISIONING_REQUEST_FINALIZER: &str =
    "provisioningrequest.o2ims.provisioning.oran.org/finalizer";

/// Label carried by every resource created on behalf of a ProvisioningRequest
pub const PROVISIONING_REQUEST_NAME_LABEL: &str =
    "provisioningrequest.o2ims.provisioning.oran.org/name";

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[kube(
    group = "o2ims.provisioning.oran.org",
    version = "v1alpha1",
    kind = "ProvisioningRequest",
    status = "ProvisioningRequestStatus",
    shortname = "oranpr",
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.provisioningStatus.provisioningPhase"}"#,
    printcolumn = r#"{"name":"Details","type":"string","jsonPath":".status.provisioningStatus.provisioningDetails"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ProvisioningRequestSpec {
    /// Display name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Free-form description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// ClusterTemplate `spec.name`
    pub template_name: String,

    /// ClusterTemplate `spec.version`
    pub template_version: String,

    /// Input parameters validated against the template's parameter schema
    #[schemars(schema_with = "preserve_unknown_fields")]
    pub template_parameters: serde_json::Value,

    /// Desired release. Falls back to the template release when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub release: Option<String>,
}

pub(crate) fn preserve_unknown_fields(_: &mut schemars::SchemaGenerator) -> schemars::Schema {
    schemars::json_schema!({
        "type": "object",
        "x-kubernetes-preserve-unknown-fields": true
    })
}

impl ProvisioningRequest {
    /// Name of the referenced ClusterTemplate object (`<templateName>.<templateVersion>`)
    pub fn template_ref_name(&self) -> String {
        format!("{}.{}", self.spec.template_name, self.spec.template_version)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProvisioningRequestStatus {
    /// Generation last acted on
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Fine-grained checks, one record per type
    #[serde(default)]
    pub conditions: Vec<Condition>,

    /// Coarse lifecycle state
    #[serde(default)]
    pub provisioning_status: ProvisioningStatus,

    /// Cross-phase derived facts
    #[serde(default)]
    pub extensions: Extensions,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProvisioningStatus {
    #[serde(default)]
    pub provisioning_phase: ProvisioningPhase,

    #[serde(default)]
    pub provisioning_details: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provisioned_resources: Option<ProvisionedResources>,

    /// Last time phase or details changed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update_time: Option<DateTime<Utc>>,

    /// Anchor for the overall provisioning timeout of the current generation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provisioning_started_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProvisionedResources {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub o_cloud_node_cluster_id: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
/// Coarse lifecycle phase
#[serde(rename_all = "PascalCase")]
pub enum ProvisioningPhase {
    #[default]
    Pending,
    Progressing,
    Fulfilled,
    Failed,
    Deleting,
}

impl ProvisioningPhase {
    /// String form as serialized
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "Pending",
            Self::Progressing => "Progressing",
            Self::Fulfilled => "Fulfilled",
            Self::Failed => "Failed",
            Self::Deleting => "Deleting",
        }
    }
}

/// Status extensions.
///
/// Optional sub-structures are created on first use through the `*_mut`
/// accessors, never by hand.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Extensions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_details: Option<ClusterDetails>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_allocation_request_ref: Option<NodeAllocationRequestRef>,

    /// Allocated node id to assigned hostname
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub allocated_node_host_map: BTreeMap<String, String>,

    /// Snapshot of matched policies, replaced on every pass
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub policies: Vec<PolicyDetails>,
}

impl Extensions {
    /// Returns the cluster details, creating them if absent
    pub fn cluster_details_mut(&mut self) -> &mut ClusterDetails {
        self.cluster_details.get_or_insert_with(ClusterDetails::default)
    }

    /// Returns the allocation request reference, creating it if absent
    pub fn node_allocation_request_ref_mut(&mut self) -> &mut NodeAllocationRequestRef {
        self.node_allocation_request_ref
            .get_or_insert_with(NodeAllocationRequestRef::default)
    }

    /// Cluster name, when the ClusterInstance has been applied
    pub fn cluster_name(&self) -> Option<&str> {
        self.cluster_details
            .as_ref()
            .map(|d| d.name.as_str())
            .filter(|n| !n.is_empty())
    }

    /// Allocation request id, when one has been submitted
    pub fn node_allocation_request_id(&self) -> Option<&str> {
        self.node_allocation_request_ref
            .as_ref()
            .map(|r| r.node_allocation_request_id.as_str())
            .filter(|id| !id.is_empty())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterDetails {
    /// ClusterInstance / ManagedCluster name
    #[serde(default)]
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_provision_started_at: Option<DateTime<Utc>>,

    /// First enforce-mode non-compliance observed since last full compliance
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub non_compliant_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ztp_status: Option<ZtpStatus>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub enum ZtpStatus {
    #[serde(rename = "ZTP Done")]
    Done,
    #[serde(rename = "ZTP Not Done")]
    NotDone,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NodeAllocationRequestRef {
    #[serde(rename = "nodeAllocationRequestID", default)]
    pub node_allocation_request_id: String,

    /// HardwarePlugin the request was submitted to
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub hardware_plugin_ref: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hardware_provisioning_check_start: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hardware_configuring_check_start: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PolicyDetails {
    /// Compliance state as reported by the policy engine
    #[serde(default)]
    pub compliant: String,
    pub policy_name: String,
    pub policy_namespace: String,
    /// "inform" or "enforce"
    #[serde(default)]
    pub remediation_action: String,
}
