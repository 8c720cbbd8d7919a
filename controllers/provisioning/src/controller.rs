//! Main controller implementation.
//!
//! The `Controller` wires the live store, the hardware plugin connector and the
//! reconciler together, then runs the ProvisioningRequest watcher next to the
//! probe server.

use crate::config::Config;
use crate::error::ControllerError;
use crate::mapper::{OwnerIndex, PolicyEventMapper};
use crate::plugin::HttpPluginConnector;
use crate::probes::{serve_probes, Readiness};
use crate::reconciler::Reconciler;
use crate::store::kube_store::KubeStore;
use crate::store::ClusterStore;
use crate::watcher::Watcher;
use kube::Client;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Main controller for ProvisioningRequests.
pub struct Controller {
    provisioning_request_watcher: JoinHandle<Result<(), ControllerError>>,
    probe_server: JoinHandle<Result<(), ControllerError>>,
    cancel: CancellationToken,
}

impl Controller {
    /// Creates a new controller instance.
    pub async fn new(config: Config) -> Result<Self, ControllerError> {
        info!("Initializing ProvisioningRequest Controller");

        let kube_client = Client::try_default().await
            .map_err(|e| ControllerError::Kube(e.into()))?;

        let cancel = CancellationToken::new();
        let store: Arc<dyn ClusterStore> = Arc::new(KubeStore::new(kube_client.clone()));
        let plugins = Arc::new(HttpPluginConnector::new(Arc::clone(&store), &config, cancel.clone()));
        let owners = OwnerIndex::new();
        let mapper = PolicyEventMapper::new(Arc::clone(&store), owners.clone());

        let readiness = Readiness::default();
        let probe_server = tokio::spawn(serve_probes(config.probe_addr, readiness.clone()));

        let reconciler = Arc::new(Reconciler::new(store, plugins, owners, config));
        let watcher = Watcher::new(kube_client, reconciler, mapper);
        let provisioning_request_watcher = tokio::spawn(async move {
            watcher.watch_provisioning_requests().await
        });
        readiness.mark_ready();

        Ok(Self {
            provisioning_request_watcher,
            probe_server,
            cancel,
        })
    }

    /// Runs until the watcher or the probe server exits.
    pub async fn run(mut self) -> Result<(), ControllerError> {
        info!("ProvisioningRequest Controller running");

        let result = tokio::select! {
            result = &mut self.provisioning_request_watcher => {
                result.map_err(|e| ControllerError::Watch(format!("ProvisioningRequest watcher panicked: {}", e)))?
                    .map_err(|e| ControllerError::Watch(format!("ProvisioningRequest watcher error: {}", e)))
            }
            result = &mut self.probe_server => {
                result.map_err(|e| ControllerError::Watch(format!("Probe server panicked: {}", e)))?
            }
        };
        self.cancel.cancel();
        self.probe_server.abort();
        result
    }
}
