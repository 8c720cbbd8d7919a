//! Controller configuration.
//!
//! Built once in `main` from environment variables and passed down to the
//! reconciler. Nothing below `main` reads the environment.

use crate::error::ControllerError;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_NAMESPACE: &str = "oran-o2ims";
const DEFAULT_TOKEN_FILE: &str = "/var/run/secrets/kubernetes.io/serviceaccount/token";
const DEFAULT_PROBE_ADDR: &str = "0.0.0.0:8081";

/// Requeue intervals used by the reconciliation driver
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequeueIntervals {
    /// Object was just modified and must be revisited
    pub immediate: Duration,
    /// Waiting on a just-submitted dependent resource
    pub short: Duration,
    /// Normal poll cadence for hardware, install and configuration progress
    pub medium: Duration,
    /// Steady-state monitoring
    pub long: Duration,
}

impl Default for RequeueIntervals {
    fn default() -> Self {
        Self {
            immediate: Duration::from_secs(1),
            short: Duration::from_secs(15),
            medium: Duration::from_secs(60),
            long: Duration::from_secs(5 * 60),
        }
    }
}

/// Provisioning controller configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Namespace holding HardwareTemplates
    pub hardware_template_namespace: String,
    /// Namespace of HardwarePlugins, AllocatedNodes and their BMC secrets
    pub hardware_plugin_namespace: String,
    /// Bearer token presented to hardware plugins
    pub hardware_plugin_token_file: PathBuf,
    /// Attempts made to build and verify a plugin client
    pub plugin_init_attempts: u32,
    /// First retry delay, doubled on every attempt
    pub plugin_init_base_delay: Duration,
    /// Listener for /healthz and /readyz
    pub probe_addr: SocketAddr,
    /// Delay at the start of every pass so reads catch up with recent writes
    pub pass_delay: Duration,
    /// Requeue delays handed back to the controller runtime
    pub requeue: RequeueIntervals,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            hardware_template_namespace: DEFAULT_NAMESPACE.to_string(),
            hardware_plugin_namespace: DEFAULT_NAMESPACE.to_string(),
            hardware_plugin_token_file: PathBuf::from(DEFAULT_TOKEN_FILE),
            plugin_init_attempts: 3,
            plugin_init_base_delay: Duration::from_millis(500),
            probe_addr: SocketAddr::from(([0, 0, 0, 0], 8081)),
            pass_delay: Duration::from_millis(100),
            requeue: RequeueIntervals::default(),
        }
    }
}

impl Config {
    /// Reads the configuration from the process environment
    pub fn from_env() -> Result<Self, ControllerError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Reads the configuration through `lookup`, falling back to defaults for unset keys
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ControllerError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str, default: &str| {
            lookup(key)
                .filter(|v| !v.trim().is_empty())
                .unwrap_or_else(|| default.to_string())
        };

        let plugin_init_attempts: u32 = parse(
            "HARDWARE_PLUGIN_INIT_ATTEMPTS",
            &get("HARDWARE_PLUGIN_INIT_ATTEMPTS", "3"),
        )?;
        if plugin_init_attempts == 0 {
            return Err(ControllerError::InvalidConfig(
                "HARDWARE_PLUGIN_INIT_ATTEMPTS must be at least 1".to_string(),
            ));
        }
        let base_delay_ms: u64 = parse(
            "HARDWARE_PLUGIN_INIT_BASE_DELAY_MS",
            &get("HARDWARE_PLUGIN_INIT_BASE_DELAY_MS", "500"),
        )?;
        let probe_addr: SocketAddr = parse("PROBE_ADDR", &get("PROBE_ADDR", DEFAULT_PROBE_ADDR))?;

        Ok(Self {
            hardware_template_namespace: get("HARDWARE_TEMPLATE_NAMESPACE", DEFAULT_NAMESPACE),
            hardware_plugin_namespace: get("HARDWARE_PLUGIN_NAMESPACE", DEFAULT_NAMESPACE),
            hardware_plugin_token_file: PathBuf::from(get("HARDWARE_PLUGIN_TOKEN_FILE", DEFAULT_TOKEN_FILE)),
            plugin_init_attempts,
            plugin_init_base_delay: Duration::from_millis(base_delay_ms),
            probe_addr,
            ..Self::default()
        })
    }
}

fn parse<T>(key: &str, value: &str) -> Result<T, ControllerError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value.trim().parse().map_err(|e| {
        ControllerError::InvalidConfig(format!("{} has an invalid value {:?}: {}", key, value, e))
    })
}
