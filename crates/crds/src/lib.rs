//! Provisioning CRD Definitions
//!
//! Kubernetes Custom Resource Definitions and shared status types used by the
//! provisioning controller.

pub mod conditions;
pub mod provisioning_request;
pub mod cluster_template;
pub mod hardware_template;

pub use conditions::*;
pub use provisioning_request::*;
pub use cluster_template::*;
pub use hardware_template::*;
