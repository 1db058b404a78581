//! Shared types used across refresh crates.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Stable identity of a unit within an application (`postgresql/2` → 2).
pub type Ordinal = u32;

/// Why an application name cannot be used.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AppNameError {
    #[error("application name must not be empty")]
    Empty,
    /// `:` separates the name from the ordinal in stored keys and `;`
    /// bounds the per-application key range.
    #[error("application name \"{name}\" must not contain '{reserved}'")]
    Reserved { name: String, reserved: char },
}

/// Check that `name` can key an application's records.
pub fn validate_app_name(name: &str) -> Result<(), AppNameError> {
    if name.trim().is_empty() {
        return Err(AppNameError::Empty);
    }
    match name.chars().find(|c| matches!(c, ':' | ';')) {
        Some(reserved) => Err(AppNameError::Reserved {
            name: name.to_string(),
            reserved,
        }),
        None => Ok(()),
    }
}

/// Versions a unit runs, or that an application is told to run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionPin {
    /// Orchestration code version, e.g. `14/1.12.0`.
    pub code: String,
    /// Exact pinned workload identity (image digest, package revision).
    pub workload: String,
    /// Human-readable workload release, e.g. `14.11`.
    #[serde(default)]
    pub workload_release: String,
}

impl VersionPin {
    pub fn new(code: &str, workload: &str, workload_release: &str) -> Self {
        Self {
            code: code.to_string(),
            workload: workload.to_string(),
            workload_release: workload_release.to_string(),
        }
    }

    /// Whether a unit reporting these versions runs this pin.
    pub fn matches(&self, code: &str, workload: &str) -> bool {
        self.code == code && self.workload == workload
    }

    /// Identity comparison; ignores the display-only `workload_release`.
    pub fn same_version(&self, other: &VersionPin) -> bool {
        self.matches(&other.code, &other.workload)
    }
}

impl fmt::Display for VersionPin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.code, self.workload)
    }
}

/// `pause_after_unit_upgrade` config option.
///
/// Variants are declared from least to most restrictive so the derived
/// `Ord` ranks them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PausePolicy {
    None,
    #[default]
    First,
    All,
}

impl PausePolicy {
    /// Parse the raw config value. Anything outside the enum is `None`.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim() {
            "none" => Some(Self::None),
            "first" => Some(Self::First),
            "all" => Some(Self::All),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::First => "first",
            Self::All => "all",
        }
    }

    /// Whether the rollout halts before releasing the unit at `index` in
    /// release order, given that every unit before it has upgraded.
    pub fn halts_before(&self, index: usize) -> bool {
        match self {
            Self::None => false,
            // Only the pioneer has upgraded.
            Self::First => index == 1,
            Self::All => index >= 1,
        }
    }
}

impl fmt::Display for PausePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the platform lets units upgrade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlatformVariant {
    /// Ordinal partition: units with ordinal >= partition may upgrade.
    /// Only ever released from the top down.
    Partition,
    /// Each unit upgrades itself once told to proceed.
    PerUnit,
}

impl fmt::Display for PlatformVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Partition => f.write_str("partition"),
            Self::PerUnit => f.write_str("per_unit"),
        }
    }
}

/// Which gate check produced a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckKind {
    /// The pioneer runs the workload pinned by the target.
    WorkloadPin,
    Compatibility,
    PreUpgrade,
}

/// Outcome of a single gate check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckResult {
    pub kind: CheckKind,
    pub passed: bool,
    pub message: String,
}

impl CheckResult {
    pub fn pass(kind: CheckKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            passed: true,
            message: message.into(),
        }
    }

    pub fn fail(kind: CheckKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            passed: false,
            message: message.into(),
        }
    }
}

/// Why the rollout is paused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PauseReason {
    /// `pause_after_unit_upgrade` asks for a manual `resume-upgrade`.
    Manual,
}

/// Why the rollout is blocked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockReason {
    /// The pioneer came up with a workload other than the target's.
    WorkloadMismatch,
    Incompatible,
    PreUpgradeFailed,
    Unhealthy { ordinal: Ordinal },
}

/// Rollout controller state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RolloutState {
    /// No upgrade in progress.
    Idle,
    /// Target diverged; gate checks have not passed yet.
    AwaitingFirstUnitChecks,
    /// `next` is released, or about to be.
    RollingOut { next: Ordinal },
    Paused { reason: PauseReason },
    Blocked { reason: BlockReason },
    /// Every unit converged; the session is being closed.
    Complete,
}

impl RolloutState {
    /// Short label for logs and the audit trail.
    pub fn label(&self) -> String {
        match self {
            Self::Idle => "idle".to_string(),
            Self::AwaitingFirstUnitChecks => "awaiting_first_unit_checks".to_string(),
            Self::RollingOut { next } => format!("rolling_out({next})"),
            Self::Paused { .. } => "paused(manual)".to_string(),
            Self::Blocked { reason } => match reason {
                BlockReason::WorkloadMismatch => "blocked(workload_mismatch)".to_string(),
                BlockReason::Incompatible => "blocked(incompatible)".to_string(),
                BlockReason::PreUpgradeFailed => "blocked(pre_upgrade_failed)".to_string(),
                BlockReason::Unhealthy { ordinal } => format!("blocked(unhealthy:{ordinal})"),
            },
            Self::Complete => "complete".to_string(),
        }
    }
}

impl fmt::Display for RolloutState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label())
    }
}
