//! Policy compliance of the installed cluster.
//!
//! Child policies in the cluster namespace are matched back to the template's
//! `ztp-<namespace>` root policies and folded into one `ConfigurationApplied`
//! condition.

use super::task::ProvisioningTask;
use crate::error::ControllerError;
use crate::store::{self, ClusterStore, LabelQuery, MANAGED_CLUSTER, POLICY};
use crate::timeouts;
use chrono::Utc;
use crds::{ConditionLedger, ConditionReason, ConditionStatus, ConditionType, PolicyDetails, ZtpStatus};
use serde_json::Value;
use tracing::{debug, info};

/// Label carried by every child policy, naming its root policy
pub const ROOT_POLICY_LABEL: &str = "policy.open-cluster-management.io/root-policy";

/// ManagedCluster conditions that must all be True before policies are evaluated
const READY_CONDITIONS: &[&str] = &[
    "ManagedClusterConditionAvailable",
    "ManagedClusterJoined",
    "HubAcceptedManagedCluster",
];

/// Aggregate policy state of a cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigurationState {
    Missing,
    Completed,
    ClusterNotReady,
    OutOfDate,
    InProgress,
    TimedOut,
}

impl ConfigurationState {
    pub fn reason(self) -> ConditionReason {
        match self {
            Self::Missing => ConditionReason::Missing,
            Self::Completed => ConditionReason::Completed,
            Self::ClusterNotReady => ConditionReason::ClusterNotReady,
            Self::OutOfDate => ConditionReason::OutOfDate,
            Self::InProgress => ConditionReason::InProgress,
            Self::TimedOut => ConditionReason::TimedOut,
        }
    }

    pub fn status(self) -> ConditionStatus {
        match self {
            Self::Missing | Self::Completed => ConditionStatus::True,
            _ => ConditionStatus::False,
        }
    }

    pub fn message(self) -> &'static str {
        match self {
            Self::Missing => "No configuration present",
            Self::Completed => "The configuration is up to date",
            Self::ClusterNotReady => "The Cluster is not yet ready",
            Self::OutOfDate => "The configuration is out of date",
            Self::InProgress => "The configuration is still being applied",
            Self::TimedOut => "The configuration is still being applied, but it timed out",
        }
    }
}

/// Classifies the matched policies. Earlier checks win.
pub fn classify(
    policies_empty: bool,
    all_compliant: bool,
    all_inform: bool,
    cluster_ready: bool,
    timed_out: bool,
) -> ConfigurationState {
    if policies_empty {
        ConfigurationState::Missing
    } else if all_compliant {
        ConfigurationState::Completed
    } else if !cluster_ready {
        ConfigurationState::ClusterNotReady
    } else if all_inform {
        ConfigurationState::OutOfDate
    } else if timed_out {
        ConfigurationState::TimedOut
    } else {
        ConfigurationState::InProgress
    }
}

/// Splits a child policy name `<root namespace>.<root name>`
pub fn parent_policy(child_name: &str) -> Option<(&str, &str)> {
    let (namespace, name) = child_name.split_once('.')?;
    Some((name, namespace))
}

/// True when the ManagedCluster is available, joined and accepted
pub(crate) async fn cluster_ready_for_policy_config(
    store: &dyn ClusterStore,
    cluster: &str,
) -> Result<bool, ControllerError> {
    let Some(managed) = store.get(&MANAGED_CLUSTER, None, cluster).await? else {
        return Ok(false);
    };
    Ok(READY_CONDITIONS.iter().all(|type_| {
        store::condition(&managed, type_)
            .and_then(|c| c.get("status"))
            .and_then(Value::as_str)
            == Some("True")
    }))
}

impl ProvisioningTask<'_> {
    /// Updates `ConfigurationApplied`, the policy snapshot and the ZTP status.
    /// Returns true while enforce policies are still converging.
    pub(crate) async fn handle_cluster_policy_configuration(&mut self) -> Result<bool, ControllerError> {
        let cluster = self
            .status
            .extensions
            .cluster_name()
            .map(str::to_string)
            .ok_or_else(|| ControllerError::internal("status.clusterDetails is empty"))?;
        let root_namespace = format!("ztp-{}", self.template_namespace()?);

        let policies = self
            .store()
            .list(&POLICY, Some(&cluster), &LabelQuery::all().exists(ROOT_POLICY_LABEL))
            .await
            .map_err(|e| ControllerError::from(e).context("failed to list Policies"))?;

        let mut targets = Vec::new();
        let mut all_compliant = true;
        let mut all_inform = true;
        for policy in &policies {
            let Some((name, namespace)) = parent_policy(store::name(policy)) else {
                continue;
            };
            if namespace != root_namespace {
                continue;
            }
            let compliant = policy
                .pointer("/status/compliant")
                .and_then(Value::as_str)
                .unwrap_or_default();
            let remediation = policy
                .pointer("/spec/remediationAction")
                .and_then(Value::as_str)
                .unwrap_or_default();
            all_compliant &= compliant == "Compliant";
            all_inform &= remediation.eq_ignore_ascii_case("inform");
            targets.push(PolicyDetails {
                compliant: compliant.to_string(),
                policy_name: name.to_string(),
                policy_namespace: namespace.to_string(),
                remediation_action: remediation.to_string(),
            });
        }

        let empty = targets.is_empty();
        let cluster_ready = if empty || all_compliant {
            true
        } else {
            cluster_ready_for_policy_config(self.store(), &cluster)
                .await
                .map_err(|e| e.context("error determining if the cluster is ready for policy configuration"))?
        };
        let timed_out = !empty && !all_compliant && cluster_ready && !all_inform && self.policy_configuration_timed_out();

        let state = classify(empty, all_compliant, all_inform, cluster_ready, timed_out);
        match state {
            ConfigurationState::Missing | ConfigurationState::Completed | ConfigurationState::OutOfDate => {
                self.status.extensions.cluster_details_mut().non_compliant_at = None;
            }
            ConfigurationState::ClusterNotReady => {
                if self.cluster_provision_completed() && self.upgrade_settled() && !all_inform {
                    self.set_in_progress("Waiting for cluster to be ready for policy configuration");
                }
            }
            ConfigurationState::InProgress | ConfigurationState::TimedOut => {
                if self.upgrade_settled() {
                    self.set_in_progress("Cluster configuration is being applied");
                    if timed_out {
                        self.set_failed("Cluster configuration timed out");
                    }
                }
            }
        }
        self.set_condition(ConditionType::ConfigurationApplied, state.reason(), state.status(), state.message());
        self.status.extensions.policies = targets;
        info!("Cluster ({}) configuration status: {}", cluster, state.message());

        self.update_ztp_status(all_compliant);
        self.persist().await?;

        Ok(!all_compliant && !all_inform && !timed_out)
    }

    /// Tracks `nonCompliantAt` and reports whether enforce policies have been
    /// non-compliant for longer than the configuration budget
    fn policy_configuration_timed_out(&mut self) -> bool {
        let budget = self.timeouts.cluster_configuration;
        let current = self
            .status
            .conditions
            .find(ConditionType::ConfigurationApplied)
            .map(|c| (c.status, c.reason.clone()));
        let details = self.status.extensions.cluster_details_mut();

        let Some((status, reason)) = current else {
            details.non_compliant_at = Some(Utc::now());
            return false;
        };
        if status != ConditionStatus::False {
            if reason == ConditionReason::Completed.as_str() {
                details.non_compliant_at = Some(Utc::now());
            }
            return false;
        }
        match reason.as_str() {
            r if r == ConditionReason::InProgress.as_str() => {
                if details.non_compliant_at.is_none() {
                    details.non_compliant_at = Some(Utc::now());
                    false
                } else {
                    timeouts::exceeded(details.non_compliant_at, budget)
                }
            }
            r if r == ConditionReason::TimedOut.as_str() => true,
            r if r == ConditionReason::Missing.as_str() || r == ConditionReason::OutOfDate.as_str() => {
                details.non_compliant_at = Some(Utc::now());
                false
            }
            r if r == ConditionReason::ClusterNotReady.as_str() => timeouts::exceeded(details.non_compliant_at, budget),
            other => {
                debug!("Unexpected reason {} for condition type ConfigurationApplied", other);
                false
            }
        }
    }

    /// ZTP is done once installation completed with every policy compliant, and stays done
    fn update_ztp_status(&mut self, all_compliant: bool) {
        let Some(provisioned) = self.status.conditions.find(ConditionType::ClusterProvisioned) else {
            return;
        };
        let installed = provisioned.status == ConditionStatus::True;
        let details = self.status.extensions.cluster_details_mut();
        if details.ztp_status != Some(ZtpStatus::Done) {
            details.ztp_status = Some(if installed && all_compliant {
                ZtpStatus::Done
            } else {
                ZtpStatus::NotDone
            });
        }
    }
}
