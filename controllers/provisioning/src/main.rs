//! Provisioning Controller
//!
//! Drives ProvisioningRequests to a fully installed and configured cluster:
//! - validates the request against its ClusterTemplate and merges defaults
//! - renders the ClusterInstance and the cluster namespace resources
//! - allocates nodes through the hardware plugin named by the HardwareTemplate
//! - follows installation, policy compliance and image based upgrades
//!
//! Deletion is finalizer driven and removes dependents in order.

mod backoff;
mod config;
mod controller;
mod document;
mod error;
mod mapper;
mod merge;
mod plugin;
mod probes;
mod reconciler;
mod render;
mod schema;
mod store;
mod timeouts;
mod watcher;

#[cfg(test)]
mod test_utils;

use crate::config::Config;
use crate::error::ControllerError;
use controller::Controller;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), ControllerError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    if rustls::crypto::ring::default_provider().install_default().is_err() {
        warn!("A rustls crypto provider was already installed");
    }

    info!("Starting Provisioning Controller");

    let config = Config::from_env()?;

    info!("Configuration:");
    info!("  HardwareTemplate namespace: {}", config.hardware_template_namespace);
    info!("  HardwarePlugin namespace: {}", config.hardware_plugin_namespace);
    info!("  HardwarePlugin token file: {}", config.hardware_plugin_token_file.display());
    info!(
        "  Plugin init: {} attempts, {:?} base delay",
        config.plugin_init_attempts, config.plugin_init_base_delay
    );
    info!("  Probe address: {}", config.probe_addr);

    let controller = Controller::new(config).await?;
    controller.run().await?;

    Ok(())
}
