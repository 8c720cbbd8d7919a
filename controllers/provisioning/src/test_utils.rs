//! Test utilities for unit testing the reconciler
//!
//! Fixtures are plain JSON objects inserted into a [`MockClusterStore`]. The
//! default set describes a single-node cluster `cluster-1` built from the
//! `sno.v1` ClusterTemplate in the `ct-ns` namespace.

#[cfg(test)]
use crate::config::Config;
#[cfg(test)]
use crate::error::ControllerError;
#[cfg(test)]
use crate::mapper::OwnerIndex;
#[cfg(test)]
use crate::plugin::PluginConnector;
#[cfg(test)]
use crate::reconciler::policy::ROOT_POLICY_LABEL;
#[cfg(test)]
use crate::reconciler::task::ProvisioningTask;
#[cfg(test)]
use crate::reconciler::Reconciler;
#[cfg(test)]
use crate::store::mock::MockClusterStore;
#[cfg(test)]
use crate::store::{
    self, ResourceKind, AGENT, ALLOCATED_NODE, CLUSTER_INSTANCE, CLUSTER_TEMPLATE, CONFIG_MAP,
    HARDWARE_TEMPLATE, MANAGED_CLUSTER, POLICY, PROVISIONING_REQUEST, SECRET,
};
#[cfg(test)]
use async_trait::async_trait;
#[cfg(test)]
use crds::{Condition, ConditionLedger, ProvisioningRequest, ProvisioningRequestStatus};
#[cfg(test)]
use hwplugin_client::{AllocatedNode, Bmc, HardwarePluginClientTrait, Interface, MockHardwarePluginClient};
#[cfg(test)]
use serde_json::{json, Value};
#[cfg(test)]
use std::sync::Arc;
#[cfg(test)]
use std::time::Duration;

#[cfg(test)]
pub const TEST_REQUEST: &str = "pr-1";
#[cfg(test)]
pub const TEMPLATE_NAMESPACE: &str = "ct-ns";
#[cfg(test)]
pub const TEMPLATE_NAME: &str = "sno.v1";
#[cfg(test)]
pub const TEMPLATE_ID: &str = "57b39bda-ac56-4143-9b10-d1a71517d04f";
#[cfg(test)]
pub const CLUSTER: &str = "cluster-1";
#[cfg(test)]
pub const RELEASE: &str = "4.16.3";
#[cfg(test)]
pub const HW_TEMPLATE: &str = "hwt-sno";
#[cfg(test)]
pub const PLUGIN_REF: &str = "metal3-hwplugin";
#[cfg(test)]
pub const PLUGIN_NAMESPACE: &str = "oran-o2ims";
#[cfg(test)]
pub const BOOT_LABEL: &str = "bootable-interface";
#[cfg(test)]
pub const HOST_NAME: &str = "node1.example.com";

/// Connector handing out a shared [`MockHardwarePluginClient`]
#[cfg(test)]
#[derive(Debug, Clone)]
pub struct MockPluginConnector {
    client: MockHardwarePluginClient,
}

#[cfg(test)]
impl MockPluginConnector {
    pub fn new(client: MockHardwarePluginClient) -> Self {
        Self { client }
    }
}

#[cfg(test)]
#[async_trait]
impl PluginConnector for MockPluginConnector {
    async fn connect(&self, plugin_ref: &str) -> Result<Arc<dyn HardwarePluginClientTrait>, ControllerError> {
        if plugin_ref != self.client.hardware_plugin_ref() {
            return Err(ControllerError::input(format!(
                "the HardwarePlugin {} does not exist in the {} namespace",
                plugin_ref, PLUGIN_NAMESPACE
            )));
        }
        Ok(Arc::new(self.client.clone()))
    }
}

/// Controller configuration with no per-pass delay
#[cfg(test)]
pub fn create_test_config() -> Config {
    Config {
        pass_delay: Duration::ZERO,
        ..Config::default()
    }
}

/// Helper to create a reconciler backed by the mock store and plugin
#[cfg(test)]
pub fn create_test_reconciler(store: &MockClusterStore, plugin: &MockHardwarePluginClient) -> Reconciler {
    Reconciler::new(
        Arc::new(store.clone()),
        Arc::new(MockPluginConnector::new(plugin.clone())),
        OwnerIndex::new(),
        create_test_config(),
    )
}

/// Task over the stored copy of a request
#[cfg(test)]
pub fn create_test_task<'a>(reconciler: &'a Reconciler, store: &MockClusterStore, name: &str) -> ProvisioningTask<'a> {
    let live = store.object(&PROVISIONING_REQUEST, None, name).unwrap();
    let object: ProvisioningRequest = store::decode(&PROVISIONING_REQUEST, live).unwrap();
    ProvisioningTask::new(reconciler, object)
}

/// Template parameters for a single master node
#[cfg(test)]
pub fn create_test_parameters() -> Value {
    json!({
        "oCloudSiteId": "site-1",
        "clusterInstanceParameters": {
            "clusterName": CLUSTER,
            "baseDomain": "example.com",
            "nodes": [{
                "hostName": HOST_NAME,
                "role": "master",
                "bmcAddress": "idrac-virtualmedia+https://203.0.113.5/redfish/v1/Systems/System.Embedded.1",
                "bmcCredentialsDetails": {"username": "YWRtaW4=", "password": "cGFzc3dvcmQ="},
                "bootMACAddress": "00:00:00:01:20:30",
                "nodeNetwork": {"interfaces": [{"name": "eno1", "label": BOOT_LABEL}]}
            }]
        },
        "policyTemplateParameters": {"sriov-network-vlan-1": "114"}
    })
}

/// Helper to create a ProvisioningRequest at generation 1
#[cfg(test)]
pub fn create_test_provisioning_request(name: &str, parameters: Value) -> Value {
    json!({
        "apiVersion": PROVISIONING_REQUEST.api_version(),
        "kind": PROVISIONING_REQUEST.kind,
        "metadata": {"name": name, "generation": 1},
        "spec": {
            "templateName": "sno",
            "templateVersion": "v1",
            "templateParameters": parameters
        }
    })
}

/// Template parameter schema accepting [`create_test_parameters`]
#[cfg(test)]
pub fn create_test_parameter_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "oCloudSiteId": {"type": "string"},
            "clusterInstanceParameters": {
                "type": "object",
                "properties": {
                    "clusterName": {"type": "string"},
                    "baseDomain": {"type": "string"},
                    "nodes": {"type": "array", "items": {"type": "object"}}
                }
            },
            "policyTemplateParameters": {
                "type": "object",
                "properties": {"sriov-network-vlan-1": {"type": "string"}}
            }
        },
        "required": ["clusterInstanceParameters"]
    })
}

/// Helper to create a validated ClusterTemplate
#[cfg(test)]
pub fn create_test_cluster_template(hw_template: Option<&str>) -> Value {
    json!({
        "apiVersion": CLUSTER_TEMPLATE.api_version(),
        "kind": CLUSTER_TEMPLATE.kind,
        "metadata": {"name": TEMPLATE_NAME, "namespace": TEMPLATE_NAMESPACE},
        "spec": {
            "name": "sno",
            "version": "v1",
            "release": RELEASE,
            "templateID": TEMPLATE_ID,
            "templates": {
                "clusterInstanceDefaults": "ci-defaults",
                "policyTemplateDefaults": "pt-defaults",
                "hwTemplate": hw_template,
                "upgradeDefaults": "upgrade-defaults"
            },
            "templateParameterSchema": create_test_parameter_schema()
        },
        "status": {
            "conditions": [{
                "type": "ClusterTemplateValidated",
                "status": "True",
                "reason": "Completed",
                "message": "The cluster template validation succeeded",
                "lastTransitionTime": "2024-01-01T00:00:00Z"
            }]
        }
    })
}

#[cfg(test)]
pub fn create_test_config_map(name: &str, namespace: &str, data: Value) -> Value {
    json!({
        "apiVersion": "v1",
        "kind": "ConfigMap",
        "metadata": {"name": name, "namespace": namespace},
        "data": data
    })
}

#[cfg(test)]
pub fn cluster_instance_defaults() -> &'static str {
    r#"clusterImageSetNameRef: "4.16"
pullSecretRef:
  name: pull-secret
templateRefs:
- name: ai-cluster-templates-v1
  namespace: siteconfig-operator
extraLabels:
  ManagedCluster:
    cluster-version: v4.16
    ct-ns.sno.v1: ""
"#
}

/// Helper to create the HardwareTemplate in the plugin namespace
#[cfg(test)]
pub fn create_test_hardware_template(timeout: Option<&str>) -> Value {
    let mut template = json!({
        "apiVersion": HARDWARE_TEMPLATE.api_version(),
        "kind": HARDWARE_TEMPLATE.kind,
        "metadata": {"name": HW_TEMPLATE, "namespace": PLUGIN_NAMESPACE},
        "spec": {
            "hardwarePluginRef": PLUGIN_REF,
            "bootInterfaceLabel": BOOT_LABEL,
            "nodeGroupData": [{
                "name": "controller",
                "role": "master",
                "hwProfile": "profile-spr-single-processor-64G",
                "resourceGroupId": "xyz",
                "resourceSelector": {}
            }]
        }
    });
    if let Some(timeout) = timeout {
        template["spec"]["hardwareProvisioningTimeout"] = json!(timeout);
    }
    template
}

/// Inserts the ClusterTemplate with its defaults, pull secret and upgrade
/// defaults, plus the HardwareTemplate when `with_hardware` is set
#[cfg(test)]
pub fn insert_template_fixtures(store: &MockClusterStore, with_hardware: bool) {
    let hw_template = with_hardware.then_some(HW_TEMPLATE);
    store.insert(&CLUSTER_TEMPLATE, create_test_cluster_template(hw_template));
    store.insert(
        &CONFIG_MAP,
        create_test_config_map(
            "ci-defaults",
            TEMPLATE_NAMESPACE,
            json!({"clusterinstance-defaults": cluster_instance_defaults()}),
        ),
    );
    store.insert(
        &CONFIG_MAP,
        create_test_config_map(
            "pt-defaults",
            TEMPLATE_NAMESPACE,
            json!({"policytemplate-defaults": "sriov-network-vlan-1: \"140\"\n"}),
        ),
    );
    store.insert(
        &CONFIG_MAP,
        create_test_config_map(
            "upgrade-defaults",
            TEMPLATE_NAMESPACE,
            json!({"ibgu": "ibuSpec:\n  seedImageRef:\n    image: quay.io/seed:4.16.3\nplan:\n- actions: [Prep, Upgrade, FinalizeUpgrade]\n"}),
        ),
    );
    store.insert(
        &SECRET,
        json!({
            "apiVersion": "v1",
            "kind": "Secret",
            "metadata": {"name": "pull-secret", "namespace": TEMPLATE_NAMESPACE},
            "type": "kubernetes.io/dockerconfigjson",
            "data": {".dockerconfigjson": "e30="}
        }),
    );
    if with_hardware {
        store.insert(&HARDWARE_TEMPLATE, create_test_hardware_template(None));
    }
}

/// Inserts the template fixtures and a request using the default parameters
#[cfg(test)]
pub fn insert_request_fixtures(store: &MockClusterStore, with_hardware: bool) {
    insert_template_fixtures(store, with_hardware);
    store.insert(
        &PROVISIONING_REQUEST,
        create_test_provisioning_request(TEST_REQUEST, create_test_parameters()),
    );
}

/// Helper to create a node allocated by the hardware plugin
#[cfg(test)]
pub fn create_test_allocated_node(id: &str) -> AllocatedNode {
    AllocatedNode {
        id: id.to_string(),
        group_name: "controller".to_string(),
        hw_profile: "profile-spr-single-processor-64G".to_string(),
        bmc: Bmc {
            address: "redfish-virtualmedia+https://192.0.2.10/redfish/v1/Systems/1".to_string(),
            credentials_name: format!("{}-bmc-secret", id),
        },
        interfaces: vec![Interface {
            name: "eth0".to_string(),
            mac_address: "aa:bb:cc:dd:ee:01".to_string(),
            label: BOOT_LABEL.to_string(),
        }],
        ..Default::default()
    }
}

/// Inserts the plugin-side BMC secret and AllocatedNode resource for `node`
#[cfg(test)]
pub fn insert_allocated_node_fixtures(store: &MockClusterStore, node: &AllocatedNode) {
    store.insert(
        &SECRET,
        json!({
            "apiVersion": "v1",
            "kind": "Secret",
            "metadata": {"name": node.bmc.credentials_name, "namespace": PLUGIN_NAMESPACE},
            "type": "Opaque",
            "data": {"username": "YWRtaW4=", "password": "cGFzc3dvcmQ="}
        }),
    );
    store.insert(
        &ALLOCATED_NODE,
        json!({
            "apiVersion": ALLOCATED_NODE.api_version(),
            "kind": ALLOCATED_NODE.kind,
            "metadata": {"name": node.id, "namespace": PLUGIN_NAMESPACE},
            "spec": {"groupName": node.group_name}
        }),
    );
}

/// Helper to create a ManagedCluster running `version`
#[cfg(test)]
pub fn create_test_managed_cluster(name: &str, version: &str, ready: bool) -> Value {
    let status = if ready { "True" } else { "False" };
    let conditions: Vec<Value> = ["ManagedClusterConditionAvailable", "ManagedClusterJoined", "HubAcceptedManagedCluster"]
        .iter()
        .map(|type_| json!({"type": type_, "status": status}))
        .collect();
    json!({
        "apiVersion": MANAGED_CLUSTER.api_version(),
        "kind": MANAGED_CLUSTER.kind,
        "metadata": {
            "name": name,
            "labels": {"name": name, "openshiftVersion": version, "clusterID": "76b8cbad-9928-48a0-bcf0-bb16a777b5f7"},
            "annotations": {"import.open-cluster-management.io/disable-auto-import": "true"}
        },
        "status": {"conditions": conditions}
    })
}

/// ClusterInstance status with processing done and `Provisioned` as given
#[cfg(test)]
pub fn create_test_cluster_instance_status(provisioned_status: &str, provisioned_reason: &str) -> Value {
    let mut conditions: Vec<Value> = [
        "ClusterInstanceValidated",
        "RenderedTemplates",
        "RenderedTemplatesValidated",
        "RenderedTemplatesApplied",
    ]
    .iter()
    .map(|type_| json!({"type": type_, "status": "True", "reason": "Completed", "message": ""}))
    .collect();
    conditions.push(json!({
        "type": "Provisioned",
        "status": provisioned_status,
        "reason": provisioned_reason,
        "message": format!("Provisioning {}", provisioned_reason.to_lowercase())
    }));
    json!({"conditions": conditions})
}

/// Replaces the status of a stored object
#[cfg(test)]
pub fn set_object_status(store: &MockClusterStore, kind: &ResourceKind, namespace: Option<&str>, name: &str, status: Value) {
    let mut object = store.object(kind, namespace, name).unwrap();
    object["status"] = status;
    store.insert(kind, object);
}

/// Marks the cluster installed and the ManagedCluster ready
#[cfg(test)]
pub fn complete_installation(store: &MockClusterStore) {
    set_object_status(
        store,
        &CLUSTER_INSTANCE,
        Some(CLUSTER),
        CLUSTER,
        create_test_cluster_instance_status("True", "Completed"),
    );
    store.insert(&MANAGED_CLUSTER, create_test_managed_cluster(CLUSTER, RELEASE, true));
    store.insert(&AGENT, create_test_agent(CLUSTER, "agent-1", HOST_NAME));
}

/// Helper to create a child policy of a `ztp-ct-ns` root policy
#[cfg(test)]
pub fn create_test_policy(cluster: &str, root: &str, compliant: &str, remediation: &str) -> Value {
    let name = format!("ztp-{}.{}", TEMPLATE_NAMESPACE, root);
    json!({
        "apiVersion": POLICY.api_version(),
        "kind": POLICY.kind,
        "metadata": {
            "name": name,
            "namespace": cluster,
            "labels": {ROOT_POLICY_LABEL: name}
        },
        "spec": {"remediationAction": remediation},
        "status": {"compliant": compliant}
    })
}

#[cfg(test)]
pub fn create_test_agent(cluster: &str, name: &str, hostname: &str) -> Value {
    json!({
        "apiVersion": AGENT.api_version(),
        "kind": AGENT.kind,
        "metadata": {
            "name": name,
            "namespace": cluster,
            "labels": {"agent-install.openshift.io/clusterdeployment-namespace": cluster}
        },
        "spec": {"hostname": hostname}
    })
}

/// Marks a stored request as being deleted
#[cfg(test)]
pub fn mark_deleted(store: &MockClusterStore, name: &str) {
    let mut object = store.object(&PROVISIONING_REQUEST, None, name).unwrap();
    object["metadata"]["deletionTimestamp"] = json!("2024-01-01T00:00:00Z");
    store.insert(&PROVISIONING_REQUEST, object);
}

/// Bumps the generation of a stored request after editing its spec
#[cfg(test)]
pub fn update_spec(store: &MockClusterStore, name: &str, edit: impl FnOnce(&mut Value)) {
    let mut object = store.object(&PROVISIONING_REQUEST, None, name).unwrap();
    edit(&mut object["spec"]);
    let generation = object["metadata"]["generation"].as_i64().unwrap_or_default();
    object["metadata"]["generation"] = json!(generation + 1);
    store.insert(&PROVISIONING_REQUEST, object);
}

/// Status currently stored for a request
#[cfg(test)]
pub fn stored_status(store: &MockClusterStore, name: &str) -> ProvisioningRequestStatus {
    let object = store.object(&PROVISIONING_REQUEST, None, name).unwrap();
    serde_json::from_value(object.get("status").cloned().unwrap_or_else(|| json!({}))).unwrap()
}

/// A stored condition of a request
#[cfg(test)]
pub fn stored_condition(store: &MockClusterStore, name: &str, type_: &str) -> Option<Condition> {
    stored_status(store, name).conditions.find(type_).cloned()
}
