//! ClusterInstance rendering.
//!
//! The merged ClusterInstance parameters are exposed to the template as
//! `Cluster`. Values are emitted through the `toyaml` filter as single-line
//! flow YAML, so nested structures never depend on template indentation.

use crate::document::Document;
use crate::error::ControllerError;
use minijinja::{context, Environment, Error, ErrorKind, UndefinedBehavior, Value};

/// Optional top-level ClusterInstance spec fields copied from the parameters
pub const CLUSTER_KEYS: &[&str] = &[
    "additionalNTPSources",
    "apiVIPs",
    "caBundleRef",
    "clusterNetwork",
    "clusterType",
    "cpuPartitioningMode",
    "diskEncryption",
    "extraAnnotations",
    "extraLabels",
    "extraManifestsRefs",
    "holdInstallation",
    "ignitionConfigOverride",
    "ingressVIPs",
    "installConfigOverrides",
    "machineNetwork",
    "networkType",
    "platformType",
    "proxy",
    "pruneManifests",
    "serviceNetwork",
    "sshPublicKey",
    "suppressedManifests",
];

/// Optional per-node fields copied from the parameters
pub const NODE_KEYS: &[&str] = &[
    "automatedCleaningMode",
    "bmcAddress",
    "bmcCredentialsName",
    "bootMACAddress",
    "bootMode",
    "cpuArchitecture",
    "extraAnnotations",
    "extraLabels",
    "hostRef",
    "ignitionConfigOverride",
    "installerArgs",
    "ironicInspect",
    "nodeLabels",
    "nodeNetwork",
    "role",
    "rootDeviceHints",
    "templateRefs",
];

const CLUSTER_INSTANCE_TEMPLATE: &str = r#"apiVersion: siteconfig.open-cluster-management.io/v1alpha1
kind: ClusterInstance
metadata:
  name: {{ Cluster.clusterName | required("clusterName") | toyaml }}
  namespace: {{ Cluster.clusterName | required("clusterName") | toyaml }}
spec:
  clusterName: {{ Cluster.clusterName | toyaml }}
  baseDomain: {{ Cluster.baseDomain | required("baseDomain") | toyaml }}
  clusterImageSetNameRef: {{ Cluster.clusterImageSetNameRef | required("clusterImageSetNameRef") | toyaml }}
  pullSecretRef: {{ Cluster.pullSecretRef | required("pullSecretRef") | toyaml }}
  templateRefs: {{ Cluster.templateRefs | required("templateRefs") | toyaml }}
{%- for key in cluster_keys %}
{%- if key in Cluster %}
  {{ key }}: {{ Cluster[key] | toyaml }}
{%- endif %}
{%- endfor %}
  nodes:
{%- for node in Cluster.nodes | required("nodes") %}
  - hostName: {{ node.hostName | required("nodes[].hostName") | toyaml }}
{%- for key in node_keys %}
{%- if key in node %}
    {{ key }}: {{ node[key] | toyaml }}
{%- endif %}
{%- endfor %}
{%- endfor %}
"#;

/// Emits a value as flow YAML (JSON syntax) on one line
fn toyaml(value: &Value) -> Result<String, Error> {
    serde_json::to_string(value).map_err(|e| Error::new(ErrorKind::BadSerialization, e.to_string()))
}

/// Fails rendering when the value is missing or empty
fn required(value: &Value, name: &str) -> Result<Value, Error> {
    if value.is_undefined() || value.is_none() || value.len() == Some(0) {
        return Err(Error::new(
            ErrorKind::InvalidOperation,
            format!("required field '{}' is missing or empty", name),
        ));
    }
    Ok(value.clone())
}

/// Renders ClusterInstance manifests from merged parameters
#[derive(Debug)]
pub struct ClusterInstanceRenderer {
    env: Environment<'static>,
}

impl Default for ClusterInstanceRenderer {
    fn default() -> Self {
        Self::new()
    }
}

impl ClusterInstanceRenderer {
    pub fn new() -> Self {
        let mut env = Environment::new();
        env.set_undefined_behavior(UndefinedBehavior::Strict);
        env.add_filter("toyaml", toyaml);
        env.add_filter("required", required);
        Self { env }
    }

    /// Renders the ClusterInstance for `cluster` (the merged parameters)
    pub fn render(&self, cluster: &Document) -> Result<Document, ControllerError> {
        let ctx = context! {
            Cluster => Value::from_serialize(cluster.to_value()),
            cluster_keys => CLUSTER_KEYS,
            node_keys => NODE_KEYS,
        };
        let rendered = self
            .env
            .render_str(CLUSTER_INSTANCE_TEMPLATE, ctx)
            .map_err(|e| ControllerError::input(format!("failed to render the ClusterInstance template: {}", e)))?;

        Document::from_yaml(&rendered)
            .map_err(|e| ControllerError::input(format!("failed to parse the rendered ClusterInstance: {}", e)))
    }
}
