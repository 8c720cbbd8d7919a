//! Child resource to ProvisioningRequest resolution.
//!
//! Policies and ManagedClusters live in a namespace named after the cluster,
//! which is also the name of the ClusterInstance. [`OwnerIndex`] keeps the
//! cluster → request mapping the reconciler learns while it works, and
//! [`PolicyEventMapper`] turns policy watch events into at most one request
//! name to enqueue.

use crate::store::{self, ClusterStore, CLUSTER_INSTANCE};
use crds::PROVISIONING_REQUEST_NAME_LABEL;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tracing::{debug, warn};

/// Reverse index from cluster name to owning ProvisioningRequest name
#[derive(Debug, Clone, Default)]
pub struct OwnerIndex {
    owners: Arc<RwLock<HashMap<String, String>>>,
}

impl OwnerIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records that `cluster` belongs to the request `owner`
    pub fn record(&self, cluster: &str, owner: &str) {
        let mut owners = self.owners.write().unwrap_or_else(PoisonError::into_inner);
        if owners.get(cluster).map(String::as_str) != Some(owner) {
            debug!("Indexing cluster {} under ProvisioningRequest {}", cluster, owner);
            owners.insert(cluster.to_string(), owner.to_string());
        }
    }

    /// Drops every cluster owned by `owner`
    pub fn forget_owner(&self, owner: &str) {
        self.owners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|_, o| o != owner);
    }

    pub fn owner_of(&self, cluster: &str) -> Option<String> {
        self.owners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(cluster)
            .cloned()
    }
}

/// A policy watch event
#[derive(Debug, Clone)]
pub enum PolicyEvent {
    Applied(Value),
    Deleted(Value),
}

/// The part of a policy that affects the owning request
#[derive(Debug, Clone, PartialEq, Eq)]
struct PolicyState {
    compliant: String,
    remediation_action: String,
}

impl PolicyState {
    fn of(policy: &Value) -> Self {
        let text = |pointer: &str| {
            policy
                .pointer(pointer)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string()
        };
        Self {
            compliant: text("/status/compliant"),
            remediation_action: text("/spec/remediationAction"),
        }
    }
}

/// Maps policy events to the ProvisioningRequest that must be re-evaluated
pub struct PolicyEventMapper {
    store: Arc<dyn ClusterStore>,
    owners: OwnerIndex,
    seen: Mutex<HashMap<(String, String), PolicyState>>,
}

impl PolicyEventMapper {
    pub fn new(store: Arc<dyn ClusterStore>, owners: OwnerIndex) -> Self {
        Self {
            store,
            owners,
            seen: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the request to enqueue for `event`, if any.
    ///
    /// The first sighting of a policy only primes the cache. Later updates
    /// count when compliance or the remediation action changed. Deletes
    /// always count.
    pub async fn map(&self, event: &PolicyEvent) -> Option<String> {
        let (policy, deleted) = match event {
            PolicyEvent::Applied(policy) => (policy, false),
            PolicyEvent::Deleted(policy) => (policy, true),
        };
        let cluster = store::namespace(policy)?.to_string();
        let key = (cluster.clone(), store::name(policy).to_string());

        let changed = {
            let mut seen = self.seen.lock().unwrap_or_else(PoisonError::into_inner);
            if deleted {
                seen.remove(&key);
                true
            } else {
                let state = PolicyState::of(policy);
                match seen.insert(key.clone(), state.clone()) {
                    Some(previous) => previous != state,
                    None => false,
                }
            }
        };
        if !changed {
            return None;
        }

        let owner = self.resolve_owner(&cluster).await;
        if let Some(owner) = &owner {
            debug!("Policy {}/{} changed, enqueuing ProvisioningRequest {}", key.0, key.1, owner);
        }
        owner
    }

    async fn resolve_owner(&self, cluster: &str) -> Option<String> {
        if let Some(owner) = self.owners.owner_of(cluster) {
            return Some(owner);
        }
        let instance = match self.store.get(&CLUSTER_INSTANCE, Some(cluster), cluster).await {
            Ok(instance) => instance?,
            Err(e) => {
                warn!("Failed to look up ClusterInstance {}: {}", cluster, e);
                return None;
            }
        };
        let owner = store::labels(&instance).remove(PROVISIONING_REQUEST_NAME_LABEL)?;
        self.owners.record(cluster, &owner);
        Some(owner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::mock::MockClusterStore;
    use serde_json::json;

    fn policy(cluster: &str, name: &str, compliant: &str, remediation: &str) -> Value {
        json!({
            "metadata": {"name": name, "namespace": cluster},
            "spec": {"remediationAction": remediation},
            "status": {"compliant": compliant}
        })
    }

    #[test]
    fn test_owner_index() {
        let index = OwnerIndex::new();
        index.record("cluster-1", "pr-1");
        index.record("cluster-2", "pr-1");
        index.record("cluster-3", "pr-3");
        assert_eq!(index.owner_of("cluster-1").as_deref(), Some("pr-1"));

        index.forget_owner("pr-1");
        assert!(index.owner_of("cluster-1").is_none());
        assert!(index.owner_of("cluster-2").is_none());
        assert_eq!(index.owner_of("cluster-3").as_deref(), Some("pr-3"));
    }

    #[tokio::test]
    async fn test_updates_enqueue_only_on_change() {
        let owners = OwnerIndex::new();
        owners.record("cluster-1", "pr-1");
        let mapper = PolicyEventMapper::new(Arc::new(MockClusterStore::new()), owners);

        let first = PolicyEvent::Applied(policy("cluster-1", "ztp-ns.p1", "NonCompliant", "enforce"));
        assert_eq!(mapper.map(&first).await, None);
        assert_eq!(mapper.map(&first).await, None);

        let compliant = PolicyEvent::Applied(policy("cluster-1", "ztp-ns.p1", "Compliant", "enforce"));
        assert_eq!(mapper.map(&compliant).await.as_deref(), Some("pr-1"));

        let inform = PolicyEvent::Applied(policy("cluster-1", "ztp-ns.p1", "Compliant", "inform"));
        assert_eq!(mapper.map(&inform).await.as_deref(), Some("pr-1"));
    }

    #[tokio::test]
    async fn test_delete_always_enqueues() {
        let owners = OwnerIndex::new();
        owners.record("cluster-1", "pr-1");
        let mapper = PolicyEventMapper::new(Arc::new(MockClusterStore::new()), owners);

        let deleted = PolicyEvent::Deleted(policy("cluster-1", "ztp-ns.p1", "Compliant", "enforce"));
        assert_eq!(mapper.map(&deleted).await.as_deref(), Some("pr-1"));
    }

    #[tokio::test]
    async fn test_owner_resolved_from_cluster_instance_label() {
        let store = MockClusterStore::new();
        store.insert(
            &CLUSTER_INSTANCE,
            json!({
                "metadata": {
                    "name": "cluster-1",
                    "namespace": "cluster-1",
                    "labels": {PROVISIONING_REQUEST_NAME_LABEL: "pr-1"}
                }
            }),
        );
        let owners = OwnerIndex::new();
        let mapper = PolicyEventMapper::new(Arc::new(store), owners.clone());

        mapper
            .map(&PolicyEvent::Applied(policy("cluster-1", "ztp-ns.p1", "NonCompliant", "enforce")))
            .await;
        let owner = mapper
            .map(&PolicyEvent::Applied(policy("cluster-1", "ztp-ns.p1", "Compliant", "enforce")))
            .await;
        assert_eq!(owner.as_deref(), Some("pr-1"));
        assert_eq!(owners.owner_of("cluster-1").as_deref(), Some("pr-1"));
    }

    #[tokio::test]
    async fn test_unowned_policy_is_dropped() {
        let mapper = PolicyEventMapper::new(Arc::new(MockClusterStore::new()), OwnerIndex::new());
        let deleted = PolicyEvent::Deleted(policy("stray", "ztp-ns.p1", "Compliant", "enforce"));
        assert_eq!(mapper.map(&deleted).await, None);
    }
}
