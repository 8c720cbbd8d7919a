//! ClusterTemplate CRD
//!
//! A versioned template a ProvisioningRequest refers to. The object name is
//! `<spec.name>.<spec.version>`.

use crate::conditions::{Condition, ConditionLedger, ConditionType};
use crate::provisioning_request::preserve_unknown_fields;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[kube(
    group = "o2ims.provisioning.oran.org",
    version = "v1alpha1",
    kind = "ClusterTemplate",
    namespaced,
    status = "ClusterTemplateStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterTemplateSpec {
    pub name: String,
    pub version: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Release installed by clusters built from this template
    #[serde(default)]
    pub release: String,

    /// Identifier propagated as a label to provisioned clusters and agents
    #[serde(rename = "templateID", default)]
    pub template_id: String,

    pub templates: Templates,

    /// JSON Schema for `ProvisioningRequest.spec.templateParameters`
    #[schemars(schema_with = "preserve_unknown_fields")]
    pub template_parameter_schema: serde_json::Value,
}

/// Names of the resources holding template defaults
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Templates {
    /// ConfigMap holding ClusterInstance defaults
    pub cluster_instance_defaults: String,

    /// ConfigMap holding policy template defaults
    pub policy_template_defaults: String,

    /// HardwareTemplate name. Hardware provisioning is skipped when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hw_template: Option<String>,

    /// ConfigMap holding the ImageBasedGroupUpgrade defaults
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upgrade_defaults: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterTemplateStatus {
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

impl ClusterTemplate {
    /// True once the template controller marked the template valid
    pub fn is_validated(&self) -> bool {
        self.status
            .as_ref()
            .is_some_and(|s| s.conditions.is_true(ConditionType::ClusterTemplateValidated))
    }

    /// Hardware template name, treating an empty string as unset
    pub fn hw_template(&self) -> Option<&str> {
        self.spec
            .templates
            .hw_template
            .as_deref()
            .filter(|n| !n.is_empty())
    }
}
