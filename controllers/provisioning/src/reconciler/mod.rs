//! ProvisioningRequest reconciliation.
//!
//! One [`Reconciler`] is shared by every worker. Each pass builds a
//! [`task::ProvisioningTask`] around a fresh copy of the request, walks the
//! phases in order and persists the resulting status:
//! - `validation`: template lookup, timeouts, schema checks, defaults merge
//! - `cluster_instance`: rendering, immutable-field checks, dry-run
//! - `resources`: secrets, configmaps and namespace the installer needs
//! - `hardware`: allocation request, progress polling, node back-fill
//! - `install`: ClusterInstance apply and installation progress
//! - `policy`: policy compliance classification
//! - `upgrade`: ImageBasedGroupUpgrade orchestration
//! - `deletion`: finalizer driven cleanup
//! - `driver`: the per-pass sequencing of all of the above

pub mod cluster_instance;
pub mod deletion;
pub mod driver;
pub mod hardware;
pub mod install;
pub mod policy;
pub mod resources;
pub mod task;
pub mod upgrade;
pub mod validation;

#[cfg(test)]
mod resources_test;
#[cfg(test)]
mod task_test;

use crate::backoff::FibonacciBackoff;
use crate::config::Config;
use crate::mapper::OwnerIndex;
use crate::plugin::PluginConnector;
use crate::render::ClusterInstanceRenderer;
use crate::store::ClusterStore;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::warn;

/// Backoff state for a resource
#[derive(Debug, Clone)]
struct BackoffState {
    backoff: FibonacciBackoff,
    error_count: u32,
}

impl BackoffState {
    fn new() -> Self {
        Self {
            backoff: FibonacciBackoff::new(1, 10), // 1 minute min, 10 minutes max
            error_count: 0,
        }
    }

    fn increment_error(&mut self) {
        self.error_count += 1;
    }

    fn reset(&mut self) {
        self.error_count = 0;
        self.backoff.reset();
    }
}

/// Outcome of a reconciliation pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Requeue {
    /// Nothing to do until the request or a watched child changes
    Done,
    /// Revisit after the given interval
    After(Duration),
}

/// Reconciles ProvisioningRequests.
pub struct Reconciler {
    pub(crate) store: Arc<dyn ClusterStore>,
    pub(crate) plugins: Arc<dyn PluginConnector>,
    pub(crate) renderer: ClusterInstanceRenderer,
    pub(crate) owners: OwnerIndex,
    pub(crate) config: Config,
    /// Error count tracking per request name
    backoff_states: Arc<Mutex<HashMap<String, BackoffState>>>,
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn ClusterStore>,
        plugins: Arc<dyn PluginConnector>,
        owners: OwnerIndex,
        config: Config,
    ) -> Self {
        Self {
            store,
            plugins,
            renderer: ClusterInstanceRenderer::new(),
            owners,
            config,
            backoff_states: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Get backoff duration for a request, returns (seconds, error_count)
    pub fn get_backoff_for_resource(&self, key: &str) -> (u64, u32) {
        match self.backoff_states.lock() {
            Ok(mut states) => {
                let state = states.entry(key.to_string()).or_insert_with(BackoffState::new);
                (state.backoff.next_backoff_seconds(), state.error_count)
            }
            Err(e) => {
                warn!("Failed to lock backoff_states: {}, using default backoff", e);
                (60, 0)
            }
        }
    }

    /// Record a failed pass for a request
    pub fn increment_error(&self, key: &str) {
        if let Ok(mut states) = self.backoff_states.lock() {
            states.entry(key.to_string()).or_insert_with(BackoffState::new).increment_error();
        }
    }

    /// Reset the backoff after a successful pass
    pub fn reset_error(&self, key: &str) {
        if let Ok(mut states) = self.backoff_states.lock() {
            if let Some(state) = states.get_mut(key) {
                state.reset();
            }
        }
    }
}
