//! Hardware plugin API client
//!
//! Implements the provisioning endpoints under
//! `/hardware-manager/provisioning/v1/node-allocation-requests`.

use crate::common::HttpClient;
use crate::error::HwPluginError;
use crate::models::*;
use crate::plugin_trait::HardwarePluginClientTrait;
use reqwest::Client;
use std::time::Duration;
use tracing::debug;

/// Hardware plugin API client
#[derive(Debug, Clone)]
pub struct HardwarePluginClient {
    hardware_plugin_ref: String,
    http: HttpClient,
}

impl HardwarePluginClient {
    /// Create a new hardware plugin client
    ///
    /// # Arguments
    /// * `hardware_plugin_ref` - Name of the HardwarePlugin resource
    /// * `api_root` - Plugin API root (e.g., "https://hwplugin.ns.svc:8443")
    /// * `token` - Bearer token for authentication
    pub fn new(hardware_plugin_ref: String, api_root: String, token: String) -> Result<Self, HwPluginError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self {
            hardware_plugin_ref,
            http: HttpClient::new(client, api_root, token),
        })
    }

    /// Get the API root
    pub fn base_url(&self) -> &str {
        self.http.base_url()
    }

    fn request_path(id: &str) -> String {
        format!("/node-allocation-requests/{}", HttpClient::encode_segment(id))
    }
}

#[async_trait::async_trait]
impl HardwarePluginClientTrait for HardwarePluginClient {
    fn hardware_plugin_ref(&self) -> &str {
        &self.hardware_plugin_ref
    }

    async fn api_versions(&self) -> Result<ApiVersions, HwPluginError> {
        debug!("Checking hardware plugin {} connectivity", self.hardware_plugin_ref);
        self.http.get("/api-versions").await
    }

    async fn create_node_allocation_request(&self, request: &NodeAllocationRequest) -> Result<String, HwPluginError> {
        let body = serde_json::to_value(request)?;
        let response: CreateNodeAllocationRequestResponse =
            self.http.post("/node-allocation-requests", &body).await?;
        if response.node_allocation_request_id.is_empty() {
            return Err(HwPluginError::Api(
                "create NodeAllocationRequest returned an empty id".to_string(),
            ));
        }
        Ok(response.node_allocation_request_id)
    }

    async fn get_node_allocation_request(&self, id: &str) -> Result<Option<NodeAllocationRequestResponse>, HwPluginError> {
        match self.http.get(&Self::request_path(id)).await {
            Ok(response) => Ok(Some(response)),
            Err(HwPluginError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn update_node_allocation_request(&self, id: &str, request: &NodeAllocationRequest) -> Result<String, HwPluginError> {
        let body = serde_json::to_value(request)?;
        let response: CreateNodeAllocationRequestResponse =
            self.http.put(&Self::request_path(id), &body).await?;
        Ok(response.node_allocation_request_id)
    }

    async fn delete_node_allocation_request(&self, id: &str) -> Result<bool, HwPluginError> {
        match self.http.delete(&Self::request_path(id)).await {
            // Deletion is asynchronous on the plugin side; poll until gone
            Ok(()) => Ok(true),
            Err(HwPluginError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn get_allocated_nodes(&self, id: &str) -> Result<Vec<AllocatedNode>, HwPluginError> {
        self.http
            .get(&format!("{}/allocated-nodes", Self::request_path(id)))
            .await
    }
}
