//! Hardware plugin client construction.
//!
//! The plugin API root is not static configuration: it is read from the
//! HardwarePlugin resource named by the HardwareTemplate. Building a client
//! also checks connectivity and the bearer token, retried with a doubling
//! delay.

use crate::backoff::retry_with_backoff;
use crate::config::Config;
use crate::error::ControllerError;
use crate::store::{ClusterStore, HARDWARE_PLUGIN};
use async_trait::async_trait;
use hwplugin_client::{HardwarePluginClient, HardwarePluginClientTrait};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Produces a ready hardware plugin client for a HardwarePlugin name
#[async_trait]
pub trait PluginConnector: Send + Sync {
    async fn connect(&self, plugin_ref: &str) -> Result<Arc<dyn HardwarePluginClientTrait>, ControllerError>;
}

/// Connects to plugins over HTTP using the HardwarePlugin resources
pub struct HttpPluginConnector {
    store: Arc<dyn ClusterStore>,
    namespace: String,
    token_file: PathBuf,
    attempts: u32,
    base_delay: Duration,
    cancel: CancellationToken,
}

impl HttpPluginConnector {
    pub fn new(store: Arc<dyn ClusterStore>, config: &Config, cancel: CancellationToken) -> Self {
        Self {
            store,
            namespace: config.hardware_plugin_namespace.clone(),
            token_file: config.hardware_plugin_token_file.clone(),
            attempts: config.plugin_init_attempts,
            base_delay: config.plugin_init_base_delay,
            cancel,
        }
    }

    async fn api_root(&self, plugin_ref: &str) -> Result<String, ControllerError> {
        let plugin = self
            .store
            .get(&HARDWARE_PLUGIN, Some(&self.namespace), plugin_ref)
            .await?
            .ok_or_else(|| {
                ControllerError::input(format!(
                    "the HardwarePlugin {} does not exist in the {} namespace",
                    plugin_ref, self.namespace
                ))
            })?;
        plugin
            .pointer("/spec/apiRoot")
            .and_then(Value::as_str)
            .filter(|root| !root.is_empty())
            .map(str::to_string)
            .ok_or_else(|| ControllerError::input(format!("the HardwarePlugin {} has no spec.apiRoot", plugin_ref)))
    }
}

async fn connect_once(plugin_ref: &str, api_root: &str, token: &str) -> Result<HardwarePluginClient, ControllerError> {
    let client = HardwarePluginClient::new(plugin_ref.to_string(), api_root.to_string(), token.to_string())?;
    client.api_versions().await?;
    Ok(client)
}

#[async_trait]
impl PluginConnector for HttpPluginConnector {
    async fn connect(&self, plugin_ref: &str) -> Result<Arc<dyn HardwarePluginClientTrait>, ControllerError> {
        let api_root = self.api_root(plugin_ref).await?;
        let token = tokio::fs::read_to_string(&self.token_file).await?;
        let token = token.trim();
        debug!("Connecting to hardware plugin {} at {}", plugin_ref, api_root);

        let client = retry_with_backoff(
            "hardware plugin client initialization",
            self.attempts,
            self.base_delay,
            &self.cancel,
            || connect_once(plugin_ref, &api_root, token),
        )
        .await?;
        info!("Connected to hardware plugin {}", plugin_ref);
        Ok(Arc::new(client))
    }
}
