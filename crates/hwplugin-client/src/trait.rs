//! HardwarePluginClient trait for mocking
//!
//! The concrete HardwarePluginClient implements this trait and tests use
//! `MockHardwarePluginClient` (feature `test-util`).

use crate::error::HwPluginError;
use crate::models::*;

/// Hardware plugin provisioning operations used by the provisioning controller
///
/// All async methods must be `Send` to work with Tokio's work-stealing runtime.
#[async_trait::async_trait]
pub trait HardwarePluginClientTrait: Send + Sync {
    /// Name of the HardwarePlugin this client talks to
    fn hardware_plugin_ref(&self) -> &str;

    /// Lists supported API versions. Used as a connectivity and token check.
    async fn api_versions(&self) -> Result<ApiVersions, HwPluginError>;

    /// Submits an allocation request and returns its id
    async fn create_node_allocation_request(&self, request: &NodeAllocationRequest) -> Result<String, HwPluginError>;

    /// Fetches an allocation request. `None` when the plugin does not know the id.
    async fn get_node_allocation_request(&self, id: &str) -> Result<Option<NodeAllocationRequestResponse>, HwPluginError>;

    /// Replaces an allocation request and returns its id
    async fn update_node_allocation_request(&self, id: &str, request: &NodeAllocationRequest) -> Result<String, HwPluginError>;

    /// Requests deletion. Returns true while the request still exists on the plugin side.
    async fn delete_node_allocation_request(&self, id: &str) -> Result<bool, HwPluginError>;

    /// Nodes allocated to a request, in allocation order
    async fn get_allocated_nodes(&self, id: &str) -> Result<Vec<AllocatedNode>, HwPluginError>;
}
