//! In-memory [`ClusterStore`] for unit tests.
//!
//! Objects are kept as JSON keyed by kind, namespace and name. Every write
//! bumps `metadata.resourceVersion`, and a resourceVersion carried by a patch
//! or replace is checked the way the API server does.

use super::{ClusterStore, LabelQuery, ResourceKind, StoreError};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

type Key = (&'static str, String, String);

#[derive(Debug, Default)]
struct State {
    objects: BTreeMap<Key, Value>,
    version: u64,
    writes: HashMap<&'static str, u32>,
    failures: HashMap<&'static str, StoreError>,
    rejections: HashMap<&'static str, String>,
    retain_on_delete: HashSet<&'static str>,
    conflicts: u32,
}

/// Mock store for testing
#[derive(Clone, Debug, Default)]
pub struct MockClusterStore {
    state: Arc<Mutex<State>>,
}

fn key(kind: &ResourceKind, namespace: Option<&str>, name: &str) -> Key {
    let namespace = if kind.namespaced { namespace.unwrap_or_default() } else { "" };
    (kind.plural, namespace.to_string(), name.to_string())
}

impl MockClusterStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Stores an object as-is (test setup, not counted as a write)
    pub fn insert(&self, kind: &ResourceKind, mut object: Value) {
        let mut state = self.lock();
        state.version += 1;
        let version = state.version.to_string();
        if let Some(metadata) = object.get_mut("metadata").and_then(Value::as_object_mut) {
            metadata.insert("resourceVersion".to_string(), Value::String(version));
        }
        let k = key(kind, super::namespace(&object), super::name(&object));
        state.objects.insert(k, object);
    }

    /// Current copy of an object
    pub fn object(&self, kind: &ResourceKind, namespace: Option<&str>, name: &str) -> Option<Value> {
        self.lock().objects.get(&key(kind, namespace, name)).cloned()
    }

    /// All stored objects of a kind
    pub fn objects(&self, kind: &ResourceKind) -> Vec<Value> {
        self.lock()
            .objects
            .iter()
            .filter(|((plural, _, _), _)| *plural == kind.plural)
            .map(|(_, v)| v.clone())
            .collect()
    }

    /// Removes an object without going through `delete` (simulates garbage collection)
    pub fn remove(&self, kind: &ResourceKind, namespace: Option<&str>, name: &str) {
        self.lock().objects.remove(&key(kind, namespace, name));
    }

    /// Non-dry-run writes (create, replace, patch, delete) recorded for a kind
    pub fn write_count(&self, kind: &ResourceKind) -> u32 {
        self.lock().writes.get(kind.plural).copied().unwrap_or_default()
    }

    /// Every call touching `kind` fails with `error` (None clears)
    pub fn set_failure(&self, kind: &ResourceKind, error: Option<StoreError>) {
        let mut state = self.lock();
        match error {
            Some(e) => state.failures.insert(kind.plural, e),
            None => state.failures.remove(kind.plural),
        };
    }

    /// Creates and replaces of `kind` are rejected as invalid with `message`
    pub fn reject_writes(&self, kind: &ResourceKind, message: &str) {
        self.lock().rejections.insert(kind.plural, message.to_string());
    }

    /// Deleting `kind` only marks the object terminating
    pub fn retain_on_delete(&self, kind: &ResourceKind) {
        self.lock().retain_on_delete.insert(kind.plural);
    }

    /// The next `count` status patches fail with a conflict
    pub fn inject_conflicts(&self, count: u32) {
        self.lock().conflicts = count;
    }

    fn check_failure(state: &State, kind: &ResourceKind) -> Result<(), StoreError> {
        match state.failures.get(kind.plural) {
            Some(e) => Err(e.clone()),
            None => Ok(()),
        }
    }

    fn check_version(existing: &Value, incoming: &Value, what: &str) -> Result<(), StoreError> {
        match super::resource_version(incoming) {
            Some(v) if Some(v) != super::resource_version(existing) => Err(StoreError::Conflict(what.to_string())),
            _ => Ok(()),
        }
    }

    fn record_write(state: &mut State, kind: &ResourceKind, object: &mut Value) {
        state.version += 1;
        *state.writes.entry(kind.plural).or_default() += 1;
        let version = state.version.to_string();
        if let Some(metadata) = object.get_mut("metadata").and_then(Value::as_object_mut) {
            metadata.insert("resourceVersion".to_string(), Value::String(version));
        }
    }

    fn patch(&self, kind: &ResourceKind, namespace: Option<&str>, name: &str, patch: &Value, status: bool) -> Result<Value, StoreError> {
        let mut state = self.lock();
        Self::check_failure(&state, kind)?;
        let what = format!("{} {}", kind.kind, name);
        if status && state.conflicts > 0 {
            state.conflicts -= 1;
            return Err(StoreError::Conflict(what));
        }
        let k = key(kind, namespace, name);
        let mut object = state
            .objects
            .get(&k)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(what.clone()))?;
        Self::check_version(&object, patch, &what)?;

        let mut patch = patch.clone();
        if let Some(metadata) = patch.get_mut("metadata").and_then(Value::as_object_mut) {
            metadata.remove("resourceVersion");
        }
        if status {
            let status_patch = patch.get("status").cloned().unwrap_or(Value::Null);
            if let Some(fields) = object.as_object_mut() {
                json_patch::merge(fields.entry("status").or_insert_with(|| json!({})), &status_patch);
            }
        } else {
            if let Some(fields) = patch.as_object_mut() {
                fields.remove("status");
            }
            json_patch::merge(&mut object, &patch);
        }
        Self::record_write(&mut state, kind, &mut object);
        state.objects.insert(k, object.clone());
        Ok(object)
    }
}

#[async_trait]
impl ClusterStore for MockClusterStore {
    async fn get(&self, kind: &ResourceKind, namespace: Option<&str>, name: &str) -> Result<Option<Value>, StoreError> {
        let state = self.lock();
        Self::check_failure(&state, kind)?;
        Ok(state.objects.get(&key(kind, namespace, name)).cloned())
    }

    async fn list(&self, kind: &ResourceKind, namespace: Option<&str>, labels: &LabelQuery) -> Result<Vec<Value>, StoreError> {
        let state = self.lock();
        Self::check_failure(&state, kind)?;
        Ok(state
            .objects
            .iter()
            .filter(|((plural, ns, _), _)| *plural == kind.plural && namespace.is_none_or(|n| n == ns.as_str()))
            .filter(|(_, object)| labels.matches(object))
            .map(|(_, object)| object.clone())
            .collect())
    }

    async fn create(&self, kind: &ResourceKind, object: &Value, dry_run: bool) -> Result<Value, StoreError> {
        let mut state = self.lock();
        Self::check_failure(&state, kind)?;
        if let Some(message) = state.rejections.get(kind.plural) {
            return Err(StoreError::Invalid(message.clone()));
        }
        let k = key(kind, super::namespace(object), super::name(object));
        if state.objects.contains_key(&k) {
            return Err(StoreError::AlreadyExists(format!("{} {}", kind.kind, k.2)));
        }
        let mut object = object.clone();
        if dry_run {
            return Ok(object);
        }
        Self::record_write(&mut state, kind, &mut object);
        state.objects.insert(k, object.clone());
        Ok(object)
    }

    async fn replace(&self, kind: &ResourceKind, object: &Value, dry_run: bool) -> Result<Value, StoreError> {
        let mut state = self.lock();
        Self::check_failure(&state, kind)?;
        if let Some(message) = state.rejections.get(kind.plural) {
            return Err(StoreError::Invalid(message.clone()));
        }
        let k = key(kind, super::namespace(object), super::name(object));
        let what = format!("{} {}", kind.kind, k.2);
        let existing = state.objects.get(&k).ok_or_else(|| StoreError::NotFound(what.clone()))?;
        Self::check_version(existing, object, &what)?;
        let mut object = object.clone();
        if dry_run {
            return Ok(object);
        }
        Self::record_write(&mut state, kind, &mut object);
        state.objects.insert(k, object.clone());
        Ok(object)
    }

    async fn merge_patch(&self, kind: &ResourceKind, namespace: Option<&str>, name: &str, patch: &Value) -> Result<Value, StoreError> {
        self.patch(kind, namespace, name, patch, false)
    }

    async fn merge_patch_status(&self, kind: &ResourceKind, namespace: Option<&str>, name: &str, patch: &Value) -> Result<Value, StoreError> {
        self.patch(kind, namespace, name, patch, true)
    }

    async fn delete(&self, kind: &ResourceKind, namespace: Option<&str>, name: &str) -> Result<bool, StoreError> {
        let mut state = self.lock();
        Self::check_failure(&state, kind)?;
        let k = key(kind, namespace, name);
        if !state.objects.contains_key(&k) {
            return Ok(false);
        }
        *state.writes.entry(kind.plural).or_default() += 1;
        if state.retain_on_delete.contains(kind.plural) {
            if let Some(metadata) = state
                .objects
                .get_mut(&k)
                .and_then(|o| o.get_mut("metadata"))
                .and_then(Value::as_object_mut)
            {
                metadata.insert("deletionTimestamp".to_string(), json!("2024-01-01T00:00:00Z"));
            }
        } else {
            state.objects.remove(&k);
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{CONFIG_MAP, PROVISIONING_REQUEST};

    #[tokio::test]
    async fn test_create_get_list() {
        let store = MockClusterStore::new();
        let cm = json!({"metadata": {"name": "a", "namespace": "ns", "labels": {"x": "1"}}, "data": {}});
        store.create(&CONFIG_MAP, &cm, false).await.unwrap();
        assert!(matches!(
            store.create(&CONFIG_MAP, &cm, false).await,
            Err(StoreError::AlreadyExists(_))
        ));

        assert!(store.get(&CONFIG_MAP, Some("ns"), "a").await.unwrap().is_some());
        assert!(store.get(&CONFIG_MAP, Some("other"), "a").await.unwrap().is_none());

        let listed = store.list(&CONFIG_MAP, None, &LabelQuery::all().eq("x", "1")).await.unwrap();
        assert_eq!(listed.len(), 1);
        let listed = store.list(&CONFIG_MAP, Some("ns"), &LabelQuery::all().eq("x", "2")).await.unwrap();
        assert!(listed.is_empty());
    }

    #[tokio::test]
    async fn test_dry_run_does_not_persist() {
        let store = MockClusterStore::new();
        let cm = json!({"metadata": {"name": "a", "namespace": "ns"}});
        store.create(&CONFIG_MAP, &cm, true).await.unwrap();
        assert!(store.object(&CONFIG_MAP, Some("ns"), "a").is_none());
        assert_eq!(store.write_count(&CONFIG_MAP), 0);
    }

    #[tokio::test]
    async fn test_status_patch_checks_resource_version() {
        let store = MockClusterStore::new();
        store.insert(&PROVISIONING_REQUEST, json!({"metadata": {"name": "pr"}, "spec": {}}));
        let current = store.object(&PROVISIONING_REQUEST, None, "pr").unwrap();
        let rv = super::super::resource_version(&current).unwrap().to_string();

        let patch = json!({"metadata": {"resourceVersion": rv}, "status": {"a": 1}});
        store.merge_patch_status(&PROVISIONING_REQUEST, None, "pr", &patch).await.unwrap();

        // Same (now stale) resourceVersion conflicts
        let err = store.merge_patch_status(&PROVISIONING_REQUEST, None, "pr", &patch).await.unwrap_err();
        assert!(err.is_conflict());

        let stored = store.object(&PROVISIONING_REQUEST, None, "pr").unwrap();
        assert_eq!(stored["status"], json!({"a": 1}));
        assert_eq!(stored["spec"], json!({}));
    }

    #[tokio::test]
    async fn test_delete() {
        let store = MockClusterStore::new();
        store.insert(&CONFIG_MAP, json!({"metadata": {"name": "a", "namespace": "ns"}}));
        assert!(store.delete(&CONFIG_MAP, Some("ns"), "a").await.unwrap());
        assert!(!store.delete(&CONFIG_MAP, Some("ns"), "a").await.unwrap());

        store.retain_on_delete(&CONFIG_MAP);
        store.insert(&CONFIG_MAP, json!({"metadata": {"name": "b", "namespace": "ns"}}));
        assert!(store.delete(&CONFIG_MAP, Some("ns"), "b").await.unwrap());
        let retained = store.object(&CONFIG_MAP, Some("ns"), "b").unwrap();
        assert!(crate::store::is_terminating(&retained));
    }
}
