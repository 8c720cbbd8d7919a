//! Hardware Plugin Provisioning API Client
//!
//! A Rust client for the hardware plugin provisioning API
//! (`/hardware-manager/provisioning/v1`). Hardware plugins allocate bare-metal
//! nodes for a cluster and report provisioning and configuration progress.
//!
//! # Example
//!
//! ```no_run
//! use hwplugin_client::{HardwarePluginClient, HardwarePluginClientTrait, NodeAllocationRequest};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = HardwarePluginClient::new(
//!     "metal3-hwplugin".to_string(),
//!     "https://hwplugin.example:8443".to_string(),
//!     "service-account-token".to_string(),
//! )?;
//!
//! client.api_versions().await?;
//!
//! let request = NodeAllocationRequest {
//!     cluster_id: "cluster-1".to_string(),
//!     site: "site-a".to_string(),
//!     boot_interface_label: "bootable-interface".to_string(),
//!     config_transaction_id: 1,
//!     node_group: vec![],
//! };
//! let id = client.create_node_allocation_request(&request).await?;
//!
//! if let Some(response) = client.get_node_allocation_request(&id).await? {
//!     println!("conditions: {:?}", response.status.conditions);
//! }
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod common;
pub mod error;
pub mod models;
#[path = "trait.rs"]
pub mod plugin_trait;
#[cfg(feature = "test-util")]
pub mod mock;

pub use client::HardwarePluginClient;
pub use common::HttpClient;
pub use error::HwPluginError;
pub use models::*;
pub use plugin_trait::HardwarePluginClientTrait;
#[cfg(feature = "test-util")]
pub use mock::MockHardwarePluginClient;
