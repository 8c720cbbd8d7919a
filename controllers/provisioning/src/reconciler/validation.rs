//! ProvisioningRequest validation.
//!
//! Resolves the ClusterTemplate and HardwareTemplate, loads the timeout
//! budgets, checks `templateParameters` against the template schema and merges
//! the ClusterInstance and policy parameters over the template defaults.

use super::task::ProvisioningTask;
use crate::document::Document;
use crate::error::ControllerError;
use crate::merge::deep_merge;
use crate::schema::{self, CLUSTER_INSTANCE_PARAMETERS, POLICY_TEMPLATE_PARAMETERS};
use crate::store::{self, ClusterStore, LabelQuery, CLUSTER_TEMPLATE, CONFIG_MAP, HARDWARE_TEMPLATE};
use crate::timeouts::{parse_timeout, Timeouts, CLUSTER_CONFIGURATION_TIMEOUT_KEY, CLUSTER_INSTALLATION_TIMEOUT_KEY};
use crds::{ClusterTemplate, ConditionReason, ConditionStatus, ConditionType, HardwareTemplate};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{error, info};

/// Defaults configmap key holding the ClusterInstance defaults
pub const CLUSTER_INSTANCE_DEFAULTS_KEY: &str = "clusterinstance-defaults";
/// Defaults configmap key holding the policy template defaults
pub const POLICY_TEMPLATE_DEFAULTS_KEY: &str = "policytemplate-defaults";

/// Fields whose per-resource entries are overridden by the template defaults
const OVERRIDDEN_FIELDS: [&str; 2] = ["extraLabels", "extraAnnotations"];

/// Fetches a configmap, a missing one is an input error
pub(crate) async fn get_config_map(store: &dyn ClusterStore, name: &str, namespace: &str) -> Result<Value, ControllerError> {
    store.get(&CONFIG_MAP, Some(namespace), name).await?.ok_or_else(|| {
        ControllerError::input(format!(
            "the ConfigMap '{}' is not found in the namespace '{}'",
            name, namespace
        ))
    })
}

/// Parses the YAML document stored under `data.<key>`
pub(crate) fn config_map_document(config_map: &Value, key: &str) -> Result<Document, ControllerError> {
    let name = store::name(config_map);
    let text = config_map
        .pointer(&format!("/data/{}", key))
        .and_then(Value::as_str)
        .ok_or_else(|| ControllerError::input(format!("the ConfigMap '{}' does not contain a field named '{}'", name, key)))?;
    Document::from_yaml(text).map_err(|e| {
        ControllerError::input(format!(
            "the value of key {} from ConfigMap {} is not in a valid YAML string: {}",
            key, name, e
        ))
    })
}

/// Optional duration stored under `data.<key>`
fn config_map_timeout(config_map: &Value, key: &str) -> Result<Option<Duration>, ControllerError> {
    let Some(text) = config_map.pointer(&format!("/data/{}", key)).and_then(Value::as_str) else {
        return Ok(None);
    };
    parse_timeout(text).map_err(|e| {
        ControllerError::input(format!(
            "the value of key {} from ConfigMap {} is not a valid duration string: {}",
            key,
            store::name(config_map),
            e
        ))
    })
}

/// Lets the defaults win for labels and annotations set on both sides.
///
/// Applies per resource type under `extraLabels`/`extraAnnotations`, and per
/// node index for the nodes both sides declare.
pub(crate) fn override_labels_and_annotations(request: &mut Document, defaults: &Document) -> Result<(), String> {
    for field in OVERRIDDEN_FIELDS {
        let (Some(dst), Some(src)) = (request.get_mut(field), defaults.get(field)) else {
            continue;
        };
        let mismatch = |dst: &Document, src: &Document| {
            format!(
                "type mismatch for field {}: (from ProvisioningRequest: {}, from default Configmap: {})",
                field,
                dst.type_name(),
                src.type_name()
            )
        };
        if dst.as_map().is_none() || src.as_map().is_none() {
            return Err(mismatch(&*dst, src));
        }
        let (dst_type, src_type) = (dst.type_name(), src.type_name());
        let (Some(dst_map), Some(src_map)) = (dst.as_map_mut(), src.as_map()) else {
            continue;
        };
        for (resource_type, src_fields) in src_map {
            let Some(dst_fields) = dst_map.get_mut(resource_type) else {
                continue;
            };
            let (Some(dst_fields), Some(src_fields)) = (dst_fields.as_map_mut(), src_fields.as_map()) else {
                return Err(format!(
                    "type mismatch for field {}: (from ProvisioningRequest: {}, from default Configmap: {})",
                    field, dst_type, src_type
                ));
            };
            for (key, value) in src_fields {
                if let Some(existing) = dst_fields.get_mut(key) {
                    info!(
                        "{}.{}.{} found in both default configmap and clusterInstanceInput, using the default",
                        field, resource_type, key
                    );
                    *existing = value.clone();
                }
            }
        }
    }

    let src_nodes = defaults.get("nodes").and_then(Document::as_list).unwrap_or_default();
    if let Some(dst_nodes) = request.get_mut("nodes").and_then(Document::as_list_mut) {
        for (dst, src) in dst_nodes.iter_mut().zip(src_nodes) {
            if dst.as_map().is_some() && src.as_map().is_some() {
                override_labels_and_annotations(dst, src).map_err(|e| format!("type mismatch for nodes: {}", e))?;
            }
        }
    }
    Ok(())
}

/// Request parameters merged over the template defaults
pub(crate) fn merge_with_defaults(input: &Document, defaults: &Document, parameter: &str) -> Result<Document, ControllerError> {
    let merged = match (defaults.is_empty(), input.is_empty()) {
        (false, false) => {
            let mut merged = defaults.clone();
            deep_merge(&mut merged, input, false).map_err(|e| {
                ControllerError::input(format!(
                    "failed to merge data for {}: failed to merge the clusterTemplateInput(src) with the defaults(dst): {}",
                    parameter, e
                ))
            })?;
            merged
        }
        (true, false) => input.clone(),
        (false, true) => defaults.clone(),
        (true, true) => {
            return Err(ControllerError::input(format!(
                "failed to merge data for {}: expected clusterTemplateInput data not provided in either ProvisioningRequest or Configmap",
                parameter
            )));
        }
    };
    Ok(merged)
}

impl ProvisioningTask<'_> {
    /// Validates the request and records the `Validated` condition
    pub(crate) async fn handle_validation(&mut self) -> Result<(), ControllerError> {
        let result = self.validate().await;
        if result.as_ref().is_err_and(|e| !e.is_input_error()) {
            return result;
        }
        match &result {
            Ok(()) => {
                info!("Validated the ProvisioningRequest {}", self.name());
                self.set_condition(
                    ConditionType::Validated,
                    ConditionReason::Completed,
                    ConditionStatus::True,
                    "The provisioning request validation succeeded",
                );
            }
            Err(e) if e.is_input_error() => {
                error!("Failed to validate the ProvisioningRequest {}: {}", self.name(), e);
                let message = format!("Failed to validate the ProvisioningRequest: {}", e);
                self.set_condition(ConditionType::Validated, ConditionReason::Failed, ConditionStatus::False, &message);
                self.set_failed(&message);
            }
            Err(_) => {}
        }
        self.persist().await?;
        result
    }

    async fn validate(&mut self) -> Result<(), ControllerError> {
        let template = self.resolve_cluster_template().await.map_err(|e| {
            e.context(&format!("failed to get the ClusterTemplate for ProvisioningRequest {}", self.name()))
        })?;
        if !template.is_validated() {
            return Err(ControllerError::input("the clustertemplate validation has failed"));
        }
        self.template = Some(template);

        self.hw_template = self.resolve_hardware_template().await?;
        self.timeouts = self.load_timeouts().await.map_err(|e| e.context("failed to load timeouts"))?;

        self.validate_template_parameters()?;
        self.validate_cluster_instance_input()
            .await
            .map_err(|e| e.context("failed to validate ClusterInstance input"))?;
        self.validate_policy_template_input()
            .await
            .map_err(|e| e.context("failed to validate PolicyTemplate input"))?;
        Ok(())
    }

    /// Finds `<templateName>.<templateVersion>` in any namespace, preferring a validated copy
    pub(crate) async fn resolve_cluster_template(&self) -> Result<ClusterTemplate, ControllerError> {
        let ref_name = self.object.template_ref_name();
        let mut candidates = Vec::new();
        for object in self.store().list(&CLUSTER_TEMPLATE, None, &LabelQuery::all()).await? {
            if store::name(&object) == ref_name {
                candidates.push(store::decode::<ClusterTemplate>(&CLUSTER_TEMPLATE, object)?);
            }
        }
        if candidates.is_empty() {
            return Err(ControllerError::input(format!(
                "a valid ({}) ClusterTemplate does not exist in any namespace",
                ref_name
            )));
        }
        let index = candidates.iter().position(ClusterTemplate::is_validated).unwrap_or(0);
        Ok(candidates.swap_remove(index))
    }

    pub(crate) async fn resolve_hardware_template(&self) -> Result<Option<HardwareTemplate>, ControllerError> {
        let Some(name) = self.template()?.hw_template() else {
            return Ok(None);
        };
        let namespace = &self.ctx.config.hardware_template_namespace;
        let template = store::get_typed::<HardwareTemplate>(self.store(), &HARDWARE_TEMPLATE, Some(namespace), name)
            .await?
            .ok_or_else(|| {
                ControllerError::input(format!(
                    "the HardwareTemplate {} does not exist in the {} namespace",
                    name, namespace
                ))
            })?;
        Ok(Some(template))
    }

    async fn load_timeouts(&self) -> Result<Timeouts, ControllerError> {
        let mut timeouts = Timeouts::default();

        if let Some(hw_template) = &self.hw_template {
            if let Some(text) = &hw_template.spec.hardware_provisioning_timeout {
                let parsed = parse_timeout(text).map_err(|e| {
                    ControllerError::input(format!(
                        "the value of field hardwareProvisioningTimeout from HardwareTemplate {} is not a valid duration string: {}",
                        hw_template.metadata.name.as_deref().unwrap_or_default(),
                        e
                    ))
                })?;
                if let Some(timeout) = parsed {
                    timeouts.hardware_provisioning = timeout;
                }
            }
        }

        let template = self.template()?;
        let namespace = self.template_namespace()?;
        let defaults = &template.spec.templates;

        let config_map = get_config_map(self.store(), &defaults.cluster_instance_defaults, &namespace).await?;
        if let Some(timeout) = config_map_timeout(&config_map, CLUSTER_INSTALLATION_TIMEOUT_KEY)? {
            timeouts.cluster_provisioning = timeout;
        }
        let config_map = get_config_map(self.store(), &defaults.policy_template_defaults, &namespace).await?;
        if let Some(timeout) = config_map_timeout(&config_map, CLUSTER_CONFIGURATION_TIMEOUT_KEY)? {
            timeouts.cluster_configuration = timeout;
        }
        Ok(timeouts)
    }

    fn validate_template_parameters(&self) -> Result<(), ControllerError> {
        let template = self.template()?;
        let template_name = template.metadata.name.as_deref().unwrap_or_default();
        let schema = schema::top_level_schema(&template.spec.template_parameter_schema, template_name)?;
        schema::validate(&schema, &self.object.spec.template_parameters).map_err(|e| {
            ControllerError::input(format!(
                "the provided templateParameters does not match the schema from ClusterTemplate ({}): {}",
                template_name, e
            ))
        })
    }

    fn matching_input(&self, parameter: &str) -> Value {
        self.object
            .spec
            .template_parameters
            .get(parameter)
            .cloned()
            .unwrap_or_else(|| json!({}))
    }

    async fn defaults(&self, config_map_name: &str, key: &str) -> Result<Document, ControllerError> {
        let namespace = self.template_namespace()?;
        let config_map = get_config_map(self.store(), config_map_name, &namespace)
            .await
            .map_err(|e| e.context(&format!("failed to get ConfigMap {}", config_map_name)))?;
        config_map_document(&config_map, key)
            .map_err(|e| e.context(&format!("failed to get template defaults from ConfigMap {}", config_map_name)))
    }

    async fn validate_cluster_instance_input(&mut self) -> Result<(), ControllerError> {
        let template = self.template()?;
        let template_name = template.metadata.name.clone().unwrap_or_default();
        let defaults_name = template.spec.templates.cluster_instance_defaults.clone();

        let mut sub_schema = schema::sub_schema(&template.spec.template_parameter_schema, CLUSTER_INSTANCE_PARAMETERS)?;
        schema::disallow_unknown_fields(&mut sub_schema);
        let raw = self.matching_input(CLUSTER_INSTANCE_PARAMETERS);
        schema::validate(&sub_schema, &raw).map_err(|e| {
            ControllerError::input(format!(
                "the provided {} does not match the schema from ClusterTemplate ({}): {}",
                CLUSTER_INSTANCE_PARAMETERS, template_name, e
            ))
        })?;

        let defaults = self.defaults(&defaults_name, CLUSTER_INSTANCE_DEFAULTS_KEY).await?;
        let mut input = Document::from(raw);
        override_labels_and_annotations(&mut input, &defaults).map_err(ControllerError::input)?;
        self.input.cluster_instance = merge_with_defaults(&input, &defaults, CLUSTER_INSTANCE_PARAMETERS)?;
        info!(
            "Merged the {} default data with the clusterTemplateInput data for ProvisioningRequest {}",
            CLUSTER_INSTANCE_PARAMETERS,
            self.name()
        );
        Ok(())
    }

    async fn validate_policy_template_input(&mut self) -> Result<(), ControllerError> {
        let template = self.template()?;
        let template_name = template.metadata.name.clone().unwrap_or_default();
        let defaults_name = template.spec.templates.policy_template_defaults.clone();
        let sub_schema = schema::sub_schema(&template.spec.template_parameter_schema, POLICY_TEMPLATE_PARAMETERS)?;

        let defaults = self.defaults(&defaults_name, POLICY_TEMPLATE_DEFAULTS_KEY).await?;
        let input = Document::from(self.matching_input(POLICY_TEMPLATE_PARAMETERS));
        let merged = merge_with_defaults(&input, &defaults, POLICY_TEMPLATE_PARAMETERS)?;

        schema::validate(&sub_schema, &merged.to_value()).map_err(|e| {
            ControllerError::input(format!(
                "the provided {} does not match the schema from ClusterTemplate ({}): {}",
                POLICY_TEMPLATE_PARAMETERS, template_name, e
            ))
        })?;
        self.input.policy = merged;
        Ok(())
    }
}
