//! Cluster namespace resources required before installation.
//!
//! Pull secret and extra-manifest configmaps are copied from the template
//! namespace, the policy configmap is generated from the merged policy data
//! and, when no hardware plugin is involved, BMC secrets are built from the
//! request's own node credentials.

use super::task::ProvisioningTask;
use crate::error::ControllerError;
use crate::schema::CLUSTER_INSTANCE_PARAMETERS;
use crate::store::{self, CONFIG_MAP, SECRET};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use crds::{ConditionReason, ConditionStatus, ConditionType, PROVISIONING_REQUEST_NAME_LABEL};
use serde_json::{json, Map, Value};
use tracing::{debug, error, info};

/// ManagedCluster label policies are selected by
pub const CLUSTER_VERSION_LABEL: &str = "cluster-version";

const DOCKER_CONFIG_SECRET_TYPE: &str = "kubernetes.io/dockerconfigjson";

/// `<hostName up to the first dot, lowercased>-bmc-secret`
pub fn bmc_secret_name(host_name: &str) -> String {
    let short = host_name.split('.').next().unwrap_or(host_name);
    format!("{}-bmc-secret", short.to_lowercase())
}

/// Checks the ManagedCluster labels the configuration policies select on
pub fn check_cluster_labels_for_policies(
    cluster: &str,
    labels: Option<&Map<String, Value>>,
    policy_set_label: &str,
) -> Result<(), ControllerError> {
    let Some(labels) = labels.filter(|l| !l.is_empty()) else {
        return Err(ControllerError::input(format!(
            "No cluster labels configured by the ClusterInstance {}({}). Labels are needed for cluster configuration",
            cluster, cluster
        )));
    };
    for label in [CLUSTER_VERSION_LABEL, policy_set_label] {
        if !labels.contains_key(label) {
            return Err(ControllerError::input(format!(
                "Managed cluster {} is missing the {} label. This label is needed for correctly generating and populating configuration data",
                cluster, label
            )));
        }
    }
    Ok(())
}

fn decode_credential(details: &Value, field: &str, request: &str) -> Result<String, ControllerError> {
    let encoded = details.get(field).and_then(Value::as_str).ok_or_else(|| {
        ControllerError::input(format!(
            "\"bmcCredentialsDetails.{}\" key expected to exist in spec.templateParameters.{} of ProvisioningRequest {}, but it's missing",
            field, CLUSTER_INSTANCE_PARAMETERS, request
        ))
    })?;
    STANDARD
        .decode(encoded)
        .map_err(|e| ControllerError::input(format!("failed to decode the bmcCredentialsDetails {} ({}): {}", field, encoded, e)))?;
    Ok(encoded.to_string())
}

impl ProvisioningTask<'_> {
    /// Ensures every resource the installer reads from the cluster namespace,
    /// recording `ClusterResourcesCreated`
    pub(crate) async fn handle_cluster_resources(&mut self, rendered: &mut Value) -> Result<(), ControllerError> {
        let result = self.create_cluster_resources(rendered).await;
        if result.as_ref().is_err_and(|e| !e.is_input_error()) {
            return result;
        }
        match &result {
            Ok(()) => {
                info!("Cluster resources applied for ProvisioningRequest {}", self.name());
                self.set_condition(
                    ConditionType::ClusterResourcesCreated,
                    ConditionReason::Completed,
                    ConditionStatus::True,
                    "Cluster resources applied",
                );
            }
            Err(e) => {
                error!("Failed to apply cluster resources for ProvisioningRequest {}: {}", self.name(), e);
                let message = format!("Failed to apply the required cluster resource: {}", e);
                self.set_condition(
                    ConditionType::ClusterResourcesCreated,
                    ConditionReason::Failed,
                    ConditionStatus::False,
                    &message,
                );
                self.set_pending(&message);
            }
        }
        self.persist().await?;
        result
    }

    async fn create_cluster_resources(&mut self, rendered: &mut Value) -> Result<(), ControllerError> {
        let cluster = store::name(rendered).to_string();

        if self.hw_template.is_none() {
            self.create_bmc_secrets(&cluster, rendered).await?;
        }
        self.create_pull_secret(&cluster, rendered)
            .await
            .map_err(|e| e.context(&format!("failed to create pull Secret for cluster {}", cluster)))?;
        self.create_extra_manifests(&cluster, rendered)
            .await
            .map_err(|e| e.context(&format!("failed to create extraManifests ConfigMap for cluster {}", cluster)))?;
        self.create_policy_config_map(&cluster, rendered)
            .await
            .map_err(|e| e.context(&format!("failed to create policy template ConfigMap for cluster {}", cluster)))?;
        Ok(())
    }

    fn owned_labels(&self) -> Value {
        json!({PROVISIONING_REQUEST_NAME_LABEL: self.name()})
    }

    /// One Opaque secret per node from `bmcCredentialsDetails`. Nodes without
    /// `bmcCredentialsName` get a generated name written into the descriptor.
    async fn create_bmc_secrets(&self, cluster: &str, rendered: &mut Value) -> Result<(), ControllerError> {
        let request = self.name();
        let nodes = self
            .object
            .spec
            .template_parameters
            .get(CLUSTER_INSTANCE_PARAMETERS)
            .and_then(|p| p.get("nodes"))
            .and_then(Value::as_array)
            .ok_or_else(|| {
                ControllerError::input(format!(
                    "\"nodes\" key expected to exist in spec.templateParameters.{} of ProvisioningRequest {}, but it is missing",
                    CLUSTER_INSTANCE_PARAMETERS, request
                ))
            })?;

        for node in nodes {
            let host_name = node.get("hostName").and_then(Value::as_str).unwrap_or_default();
            let details = node.get("bmcCredentialsDetails").ok_or_else(|| {
                ControllerError::input(format!(
                    "\"bmcCredentialsDetails\" key expected to exist in spec.templateParameters.{} of ProvisioningRequest {}, but it's missing",
                    CLUSTER_INSTANCE_PARAMETERS, request
                ))
            })?;
            let username = decode_credential(details, "username", request)?;
            let password = decode_credential(details, "password", request)?;
            let secret_name = match node.pointer("/bmcCredentialsName/name").and_then(Value::as_str) {
                Some(name) => name.to_string(),
                None if host_name.is_empty() => {
                    return Err(ControllerError::input(format!(
                        "failed to generate Secret name: a node of ProvisioningRequest {} has no hostName",
                        request
                    )));
                }
                None => bmc_secret_name(host_name),
            };

            let secret = json!({
                "apiVersion": "v1",
                "kind": "Secret",
                "metadata": {"name": secret_name, "namespace": cluster, "labels": self.owned_labels()},
                "type": "Opaque",
                "data": {"username": username, "password": password},
            });
            store::ensure(self.store(), &SECRET, &secret)
                .await
                .map_err(|e| ControllerError::from(e).context("failed to create BMC secret"))?;

            if let Some(target) = rendered
                .pointer_mut("/spec/nodes")
                .and_then(Value::as_array_mut)
                .and_then(|nodes| {
                    nodes
                        .iter_mut()
                        .find(|n| n.get("hostName").and_then(Value::as_str) == Some(host_name))
                })
            {
                if target.get("bmcCredentialsName").is_none() {
                    target["bmcCredentialsName"] = json!({"name": secret_name});
                }
            }
        }
        Ok(())
    }

    async fn create_pull_secret(&self, cluster: &str, rendered: &Value) -> Result<(), ControllerError> {
        let template_namespace = self.template_namespace()?;
        let name = rendered
            .pointer("/spec/pullSecretRef/name")
            .and_then(Value::as_str)
            .unwrap_or_default();
        let source = self
            .store()
            .get(&SECRET, Some(&template_namespace), name)
            .await?
            .ok_or_else(|| {
                ControllerError::input(format!(
                    "pull secret {} expected to exist in the {} namespace, but it is missing",
                    name, template_namespace
                ))
            })?;

        let secret = json!({
            "apiVersion": "v1",
            "kind": "Secret",
            "metadata": {"name": name, "namespace": cluster, "labels": self.owned_labels()},
            "type": DOCKER_CONFIG_SECRET_TYPE,
            "data": source.get("data").cloned().unwrap_or_else(|| json!({})),
        });
        store::ensure(self.store(), &SECRET, &secret).await?;
        debug!("Pull secret {} copied into namespace {}", name, cluster);
        Ok(())
    }

    async fn create_extra_manifests(&self, cluster: &str, rendered: &Value) -> Result<(), ControllerError> {
        let template_namespace = self.template_namespace()?;
        let refs = rendered
            .pointer("/spec/extraManifestsRefs")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        for reference in &refs {
            let name = reference.get("name").and_then(Value::as_str).unwrap_or_default();
            let source = self
                .store()
                .get(&CONFIG_MAP, Some(&template_namespace), name)
                .await?
                .ok_or_else(|| {
                    ControllerError::input(format!(
                        "extra-manifests configmap {} expected to exist in the {} namespace, but it is missing",
                        name, template_namespace
                    ))
                })?;
            let config_map = json!({
                "apiVersion": "v1",
                "kind": "ConfigMap",
                "metadata": {"name": name, "namespace": cluster, "labels": self.owned_labels()},
                "data": source.get("data").cloned().unwrap_or_else(|| json!({})),
            });
            store::ensure(self.store(), &CONFIG_MAP, &config_map).await?;
        }
        Ok(())
    }

    /// `<cluster>-pg` in `ztp-<template namespace>`, read by the templated policies
    async fn create_policy_config_map(&self, cluster: &str, rendered: &Value) -> Result<(), ControllerError> {
        let template = self.template()?;
        let template_namespace = self.template_namespace()?;
        let policy_set_label = format!(
            "{}.{}",
            template_namespace,
            template.metadata.name.as_deref().unwrap_or_default()
        );
        check_cluster_labels_for_policies(
            cluster,
            rendered.pointer("/spec/extraLabels/ManagedCluster").and_then(Value::as_object),
            &policy_set_label,
        )
        .map_err(|e| e.context("failed to check cluster labels"))?;

        let Some(policy) = self.input.policy.as_map().filter(|m| !m.is_empty()) else {
            debug!("Policy template data is empty for ProvisioningRequest {}", self.name());
            return Ok(());
        };
        let mut data = Map::new();
        for (key, value) in policy {
            let Some(text) = value.as_str() else {
                return Err(ControllerError::input(format!(
                    "policyTemplateParameters/policyTemplateSchema for the {} key ({}) is not a string",
                    key,
                    value.to_value()
                )));
            };
            data.insert(key.clone(), json!(text));
        }

        let config_map = json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {
                "name": format!("{}-pg", cluster),
                "namespace": format!("ztp-{}", template_namespace),
                "labels": self.owned_labels(),
            },
            "data": data,
        });
        store::ensure(self.store(), &CONFIG_MAP, &config_map).await?;
        Ok(())
    }
}
