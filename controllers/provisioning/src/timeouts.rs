//! Timeout budgets and the exceeded check shared by all phases.

use chrono::{DateTime, Utc};
use std::time::Duration;

pub const DEFAULT_HARDWARE_PROVISIONING_TIMEOUT: Duration = Duration::from_secs(90 * 60);
pub const DEFAULT_CLUSTER_PROVISIONING_TIMEOUT: Duration = Duration::from_secs(90 * 60);
pub const DEFAULT_CLUSTER_CONFIGURATION_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Defaults configmap key overriding the cluster installation budget
pub const CLUSTER_INSTALLATION_TIMEOUT_KEY: &str = "clusterInstallationTimeout";
/// Defaults configmap key overriding the policy configuration budget
pub const CLUSTER_CONFIGURATION_TIMEOUT_KEY: &str = "clusterConfigurationTimeout";

/// Per-request timeout budgets, loaded during validation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    pub hardware_provisioning: Duration,
    pub cluster_provisioning: Duration,
    pub cluster_configuration: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            hardware_provisioning: DEFAULT_HARDWARE_PROVISIONING_TIMEOUT,
            cluster_provisioning: DEFAULT_CLUSTER_PROVISIONING_TIMEOUT,
            cluster_configuration: DEFAULT_CLUSTER_CONFIGURATION_TIMEOUT,
        }
    }
}

impl Timeouts {
    /// Outer backstop anchored at `provisioningStartedAt`
    pub fn overall(&self) -> Duration {
        self.hardware_provisioning + self.cluster_provisioning
    }
}

/// True iff `start` is set and more than `timeout` has elapsed since
pub fn exceeded(start: Option<DateTime<Utc>>, timeout: Duration) -> bool {
    exceeded_at(start, timeout, Utc::now())
}

/// [`exceeded`] against an explicit clock
pub fn exceeded_at(start: Option<DateTime<Utc>>, timeout: Duration, now: DateTime<Utc>) -> bool {
    let Some(start) = start else {
        return false;
    };
    let budget = chrono::Duration::from_std(timeout).unwrap_or(chrono::Duration::MAX);
    now.signed_duration_since(start) > budget
}

/// Parses a duration string such as `90m` or `1h30m`. Zero means "use the default".
pub fn parse_timeout(value: &str) -> Result<Option<Duration>, humantime::DurationError> {
    let value = value.trim();
    if value.is_empty() {
        return Ok(None);
    }
    let parsed = humantime::parse_duration(value)?;
    Ok((!parsed.is_zero()).then_some(parsed))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exceeded_boundary() {
        let start = Utc::now() - chrono::Duration::hours(2);
        let timeout = Duration::from_secs(60 * 60);
        let boundary = start + chrono::Duration::hours(1);
        let epsilon = chrono::Duration::milliseconds(1);

        assert!(!exceeded_at(Some(start), timeout, boundary - epsilon));
        assert!(!exceeded_at(Some(start), timeout, boundary));
        assert!(exceeded_at(Some(start), timeout, boundary + epsilon));
    }

    #[test]
    fn test_unset_start_never_exceeded() {
        assert!(!exceeded(None, Duration::ZERO));
    }

    #[test]
    fn test_overall_is_sum() {
        let timeouts = Timeouts::default();
        assert_eq!(timeouts.overall(), Duration::from_secs(180 * 60));
    }

    #[test]
    fn test_parse_timeout() {
        assert_eq!(parse_timeout("90m").unwrap(), Some(Duration::from_secs(90 * 60)));
        assert_eq!(parse_timeout("1h30m").unwrap(), Some(Duration::from_secs(90 * 60)));
        assert_eq!(parse_timeout("0s").unwrap(), None);
        assert_eq!(parse_timeout("").unwrap(), None);
        assert!(parse_timeout("ninety minutes").is_err());
    }
}
