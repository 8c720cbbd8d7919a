//! Mock HardwarePluginClient for unit testing
//!
//! Stores allocation requests in memory. Tests drive plugin-side progress by
//! setting conditions and allocated nodes directly.

use crate::error::HwPluginError;
use crate::models::*;
use crate::plugin_trait::HardwarePluginClientTrait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

/// Mock HardwarePluginClient for testing
#[derive(Clone, Debug)]
pub struct MockHardwarePluginClient {
    pub(crate) hardware_plugin_ref: String,
    pub(crate) requests: Arc<Mutex<HashMap<String, NodeAllocationRequestResponse>>>,
    pub(crate) allocated_nodes: Arc<Mutex<HashMap<String, Vec<AllocatedNode>>>>,
    /// Number of create/update calls, for idempotence assertions
    pub(crate) writes: Arc<Mutex<u32>>,
    /// When set, every call fails with this API error
    pub(crate) failure: Arc<Mutex<Option<String>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

impl MockHardwarePluginClient {
    /// Create a new mock client
    pub fn new(hardware_plugin_ref: impl Into<String>) -> Self {
        Self {
            hardware_plugin_ref: hardware_plugin_ref.into(),
            requests: Arc::new(Mutex::new(HashMap::new())),
            allocated_nodes: Arc::new(Mutex::new(HashMap::new())),
            writes: Arc::new(Mutex::new(0)),
            failure: Arc::new(Mutex::new(None)),
        }
    }

    /// Make every subsequent call fail (None restores normal behaviour)
    pub fn set_failure(&self, message: Option<&str>) {
        *lock(&self.failure) = message.map(str::to_string);
    }

    /// Insert an allocation request under a fixed id (for test setup)
    pub fn add_request(&self, id: &str, request: NodeAllocationRequest) {
        lock(&self.requests).insert(
            id.to_string(),
            NodeAllocationRequestResponse {
                node_allocation_request: Some(request),
                status: NodeAllocationRequestStatus::default(),
            },
        );
    }

    /// Set (or replace) a status condition on a request
    pub fn set_condition(&self, id: &str, type_: &str, status: &str, reason: &str, message: &str) {
        let mut requests = lock(&self.requests);
        let Some(response) = requests.get_mut(id) else {
            return;
        };
        let condition = PluginCondition {
            type_: type_.to_string(),
            status: status.to_string(),
            reason: reason.to_string(),
            message: message.to_string(),
            last_transition_time: Some(chrono::Utc::now()),
        };
        let conditions = &mut response.status.conditions;
        match conditions.iter_mut().find(|c| c.type_ == type_) {
            Some(existing) => *existing = condition,
            None => conditions.push(condition),
        }
    }

    /// Set the nodes allocated to a request (for test setup)
    pub fn set_allocated_nodes(&self, id: &str, nodes: Vec<AllocatedNode>) {
        lock(&self.allocated_nodes).insert(id.to_string(), nodes);
    }

    /// Current content of a stored request
    pub fn request(&self, id: &str) -> Option<NodeAllocationRequest> {
        lock(&self.requests)
            .get(id)
            .and_then(|r| r.node_allocation_request.clone())
    }

    /// Ids of all stored requests
    pub fn request_ids(&self) -> Vec<String> {
        lock(&self.requests).keys().cloned().collect()
    }

    /// Number of create/update calls received
    pub fn write_count(&self) -> u32 {
        *lock(&self.writes)
    }

    fn check_failure(&self) -> Result<(), HwPluginError> {
        match lock(&self.failure).as_ref() {
            Some(message) => Err(HwPluginError::Api(message.clone())),
            None => Ok(()),
        }
    }
}

#[async_trait::async_trait]
impl HardwarePluginClientTrait for MockHardwarePluginClient {
    fn hardware_plugin_ref(&self) -> &str {
        &self.hardware_plugin_ref
    }

    async fn api_versions(&self) -> Result<ApiVersions, HwPluginError> {
        self.check_failure()?;
        Ok(ApiVersions {
            api_versions: vec![ApiVersion { version: "v1".to_string() }],
        })
    }

    async fn create_node_allocation_request(&self, request: &NodeAllocationRequest) -> Result<String, HwPluginError> {
        self.check_failure()?;
        let id = uuid::Uuid::new_v4().to_string();
        self.add_request(&id, request.clone());
        *lock(&self.writes) += 1;
        Ok(id)
    }

    async fn get_node_allocation_request(&self, id: &str) -> Result<Option<NodeAllocationRequestResponse>, HwPluginError> {
        self.check_failure()?;
        Ok(lock(&self.requests).get(id).cloned())
    }

    async fn update_node_allocation_request(&self, id: &str, request: &NodeAllocationRequest) -> Result<String, HwPluginError> {
        self.check_failure()?;
        let mut requests = lock(&self.requests);
        let response = requests
            .get_mut(id)
            .ok_or_else(|| HwPluginError::NotFound(format!("NodeAllocationRequest {}", id)))?;
        response.node_allocation_request = Some(request.clone());
        *lock(&self.writes) += 1;
        Ok(id.to_string())
    }

    async fn delete_node_allocation_request(&self, id: &str) -> Result<bool, HwPluginError> {
        self.check_failure()?;
        // Removal completes immediately; the caller sees "still exists" once
        let existed = lock(&self.requests).remove(id).is_some();
        lock(&self.allocated_nodes).remove(id);
        Ok(existed)
    }

    async fn get_allocated_nodes(&self, id: &str) -> Result<Vec<AllocatedNode>, HwPluginError> {
        self.check_failure()?;
        Ok(lock(&self.allocated_nodes).get(id).cloned().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_create_get_delete() {
        let mock = MockHardwarePluginClient::new("plugin-1");
        let id = mock
            .create_node_allocation_request(&NodeAllocationRequest::default())
            .await
            .unwrap();

        assert!(mock.get_node_allocation_request(&id).await.unwrap().is_some());
        assert!(mock.delete_node_allocation_request(&id).await.unwrap());
        assert!(!mock.delete_node_allocation_request(&id).await.unwrap());
        assert!(mock.get_node_allocation_request(&id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_set_condition_replaces_existing() {
        let mock = MockHardwarePluginClient::new("plugin-1");
        mock.add_request("nar-1", NodeAllocationRequest::default());
        mock.set_condition("nar-1", CONDITION_PROVISIONED, "False", "InProgress", "");
        mock.set_condition("nar-1", CONDITION_PROVISIONED, "True", "Completed", "");

        let response = mock.get_node_allocation_request("nar-1").await.unwrap().unwrap();
        assert_eq!(response.status.conditions.len(), 1);
        assert_eq!(response.condition(CONDITION_PROVISIONED).unwrap().status, "True");
    }

    #[tokio::test]
    async fn test_failure_injection() {
        let mock = MockHardwarePluginClient::new("plugin-1");
        mock.set_failure(Some("connection refused"));
        assert!(mock.api_versions().await.is_err());
        mock.set_failure(None);
        assert!(mock.api_versions().await.is_ok());
    }
}
