//! Status conditions
//!
//! Condition records attached to ProvisioningRequest and ClusterTemplate status,
//! plus the ledger operations used to maintain them.
//!
//! A condition list holds at most one record per type. Setting an existing type
//! updates it in place (keeping its position in the list); new types are appended.
//! `lastTransitionTime` only moves when the status value changes.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A single condition record
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Condition type (e.g. "Validated", "ClusterProvisioned")
    #[serde(rename = "type")]
    pub type_: String,

    /// True, False or Unknown
    pub status: ConditionStatus,

    /// Machine-readable reason. Reasons copied from external resources are kept verbatim.
    #[serde(default)]
    pub reason: String,

    /// Human-readable message
    #[serde(default)]
    pub message: String,

    /// Last time the status value changed
    pub last_transition_time: DateTime<Utc>,

    /// Generation of the owning object when the condition was last set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
/// Tri-state condition status
#[serde(rename_all = "PascalCase")]
pub enum ConditionStatus {
    /// Check passed
    True,
    /// Check failed or still in progress
    False,
    /// Not evaluated yet
    #[default]
    Unknown,
}

impl ConditionStatus {
    /// Parses the string form used by external resources ("True", "False", "Unknown").
    /// Anything unrecognised maps to `Unknown`.
    pub fn from_str_lossy(value: &str) -> Self {
        match value {
            "True" => Self::True,
            "False" => Self::False,
            _ => Self::Unknown,
        }
    }

    /// String form as serialized
    pub fn as_str(self) -> &'static str {
        match self {
            Self::True => "True",
            Self::False => "False",
            Self::Unknown => "Unknown",
        }
    }
}

impl fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Condition types reported on a ProvisioningRequest.
///
/// The string values are part of the status contract and must not change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConditionType {
    /// Request parameters and template validated
    Validated,
    /// ClusterInstance rendered and dry-run accepted
    ClusterInstanceRendered,
    /// Secrets, configmaps and namespace materialized
    ClusterResourcesCreated,
    /// Hardware allocation request rendered
    HardwareTemplateRendered,
    /// Hardware plugin reports the nodes provisioned
    HardwareProvisioned,
    /// Allocated node details written into the ClusterInstance
    HardwareNodeConfigApplied,
    /// Hardware plugin reports the nodes configured
    HardwareConfigured,
    /// ClusterInstance accepted and processed by the installer
    ClusterInstanceProcessed,
    /// Cluster installation state
    ClusterProvisioned,
    /// Policy compliance state
    ConfigurationApplied,
    /// In-place upgrade state
    UpgradeCompleted,
    /// ClusterTemplate passed validation (set by the template controller)
    ClusterTemplateValidated,
}

impl ConditionType {
    /// String form as serialized
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Validated => "Validated",
            Self::ClusterInstanceRendered => "ClusterInstanceRendered",
            Self::ClusterResourcesCreated => "ClusterResourcesCreated",
            Self::HardwareTemplateRendered => "HardwareTemplateRendered",
            Self::HardwareProvisioned => "HardwareProvisioned",
            Self::HardwareNodeConfigApplied => "HardwareNodeConfigApplied",
            Self::HardwareConfigured => "HardwareConfigured",
            Self::ClusterInstanceProcessed => "ClusterInstanceProcessed",
            Self::ClusterProvisioned => "ClusterProvisioned",
            Self::ConfigurationApplied => "ConfigurationApplied",
            Self::UpgradeCompleted => "UpgradeCompleted",
            Self::ClusterTemplateValidated => "ClusterTemplateValidated",
        }
    }
}

impl AsRef<str> for ConditionType {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

impl fmt::Display for ConditionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reasons set by the controller itself
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConditionReason {
    /// Condition created, nothing evaluated yet
    Initialized,
    /// Check finished successfully
    Completed,
    /// Check failed terminally for this generation
    Failed,
    /// Work is ongoing
    InProgress,
    /// Nothing to evaluate (e.g. no policies matched)
    Missing,
    /// Inform-mode policies are not compliant
    OutOfDate,
    /// Managed cluster is not ready for configuration
    ClusterNotReady,
    /// Budgeted time exceeded
    TimedOut,
    /// Not evaluated yet
    Unknown,
    /// Node configuration could not be applied
    NotApplied,
}

impl ConditionReason {
    /// String form as serialized
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Initialized => "Initialized",
            Self::Completed => "Completed",
            Self::Failed => "Failed",
            Self::InProgress => "InProgress",
            Self::Missing => "Missing",
            Self::OutOfDate => "OutOfDate",
            Self::ClusterNotReady => "ClusterNotReady",
            Self::TimedOut => "TimedOut",
            Self::Unknown => "Unknown",
            Self::NotApplied => "NotApplied",
        }
    }
}

impl AsRef<str> for ConditionReason {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

impl fmt::Display for ConditionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ledger operations over an ordered condition list.
///
/// The ledger does no I/O; callers persist the owning object afterwards.
pub trait ConditionLedger {
    /// Upserts a condition. Returns true when anything changed.
    fn set(
        &mut self,
        type_: impl AsRef<str>,
        reason: impl AsRef<str>,
        status: ConditionStatus,
        message: impl Into<String>,
    ) -> bool {
        self.set_at(type_, reason, status, message, Utc::now())
    }

    /// Same as [`ConditionLedger::set`] with an explicit timestamp
    fn set_at(
        &mut self,
        type_: impl AsRef<str>,
        reason: impl AsRef<str>,
        status: ConditionStatus,
        message: impl Into<String>,
        now: DateTime<Utc>,
    ) -> bool;

    /// Finds a condition by type
    fn find(&self, type_: impl AsRef<str>) -> Option<&Condition>;

    /// Removes a condition by type. Returns true if one was removed.
    fn remove_condition(&mut self, type_: impl AsRef<str>) -> bool;

    /// True when the condition exists with status True
    fn is_true(&self, type_: impl AsRef<str>) -> bool {
        self.find(type_).is_some_and(|c| c.status == ConditionStatus::True)
    }
}

impl ConditionLedger for Vec<Condition> {
    fn set_at(
        &mut self,
        type_: impl AsRef<str>,
        reason: impl AsRef<str>,
        status: ConditionStatus,
        message: impl Into<String>,
        now: DateTime<Utc>,
    ) -> bool {
        let type_ = type_.as_ref();
        let reason = reason.as_ref();
        let message = message.into();

        if let Some(existing) = self.iter_mut().find(|c| c.type_ == type_) {
            let mut changed = false;
            if existing.status != status {
                existing.status = status;
                existing.last_transition_time = now;
                changed = true;
            }
            if existing.reason != reason {
                existing.reason = reason.to_string();
                changed = true;
            }
            if existing.message != message {
                existing.message = message;
                changed = true;
            }
            return changed;
        }

        self.push(Condition {
            type_: type_.to_string(),
            status,
            reason: reason.to_string(),
            message,
            last_transition_time: now,
            observed_generation: None,
        });
        true
    }

    fn find(&self, type_: impl AsRef<str>) -> Option<&Condition> {
        let type_ = type_.as_ref();
        self.iter().find(|c| c.type_ == type_)
    }

    fn remove_condition(&mut self, type_: impl AsRef<str>) -> bool {
        let type_ = type_.as_ref();
        let before = self.len();
        self.retain(|c| c.type_ != type_);
        before != self.len()
    }
}
