//! Domain types for the refresh state store.
//!
//! These types represent the persisted state of applications, their units,
//! the in-progress upgrade session, and the audit trail. All types are
//! serializable to/from JSON for storage in redb tables.

use refresh_core::{CheckResult, Ordinal, PausePolicy, PlatformVariant, RolloutState, VersionPin};
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

// ── Units ──────────────────────────────────────────────────────────

/// Observed state of one unit.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UnitState {
    pub app: String,
    pub ordinal: Ordinal,
    /// Empty until the platform first reports the unit's versions.
    pub code_version: String,
    pub workload_version: String,
    /// Last computed health verdict.
    pub healthy: bool,
    /// A verdict was computed for the current versions.
    #[serde(default)]
    pub health_checked: bool,
    /// Runs the application's declared target versions.
    pub upgraded: bool,
    /// Unix timestamp (seconds) of the last change.
    pub updated_at: u64,
}

impl UnitState {
    /// A freshly registered unit: unknown versions, not yet healthy.
    pub fn new(app: &str, ordinal: Ordinal) -> Self {
        Self {
            app: app.to_string(),
            ordinal,
            code_version: String::new(),
            workload_version: String::new(),
            healthy: false,
            health_checked: false,
            upgraded: false,
            updated_at: epoch_secs(),
        }
    }

    /// Build the composite key for the units table.
    pub fn table_key(&self) -> String {
        unit_key(&self.app, self.ordinal)
    }

    /// Whether the unit currently runs `pin`.
    pub fn runs(&self, pin: &VersionPin) -> bool {
        pin.matches(&self.code_version, &self.workload_version)
    }
}

pub fn unit_key(app: &str, ordinal: Ordinal) -> String {
    format!("{app}:{ordinal:010}")
}

// ── Applications ───────────────────────────────────────────────────

/// Declared state of one application.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ApplicationRecord {
    pub name: String,
    pub variant: PlatformVariant,
    /// Ordinal of the coordinating unit (the leader).
    pub coordinator: Ordinal,
    /// `pause_after_unit_upgrade` exactly as configured, valid or not.
    pub pause_policy_raw: String,
    /// Declared target versions.
    pub target: Option<VersionPin>,
    /// Versions every unit ran after the last completed rollout.
    pub original: Option<VersionPin>,
    #[serde(default)]
    pub workload_name: String,
    #[serde(default)]
    pub docs_url: String,
    /// Workload resource name used in the rollback command.
    #[serde(default)]
    pub resource_name: Option<String>,
    pub updated_at: u64,
}

impl ApplicationRecord {
    pub fn new(name: &str, variant: PlatformVariant) -> Self {
        Self {
            name: name.to_string(),
            variant,
            coordinator: 0,
            pause_policy_raw: PausePolicy::default().to_string(),
            target: None,
            original: None,
            workload_name: String::new(),
            docs_url: String::new(),
            resource_name: None,
            updated_at: epoch_secs(),
        }
    }

    /// Parsed pause policy, `None` if the raw value is out of range.
    pub fn pause_policy(&self) -> Option<PausePolicy> {
        PausePolicy::parse(&self.pause_policy_raw)
    }
}

// ── Sessions ───────────────────────────────────────────────────────

/// An in-progress upgrade or rollback. Exists iff some unit has not
/// upgraded to the target.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UpgradeSession {
    pub app: String,
    /// Record version for compare-and-set commits. Assigned by the store.
    pub generation: u64,
    /// Versions to roll back to.
    pub original: VersionPin,
    pub target: VersionPin,
    /// Last valid pause policy.
    pub pause_policy: PausePolicy,
    /// Whether the configured policy value is currently valid.
    pub policy_valid: bool,
    /// Gate checks were bypassed for the pioneer.
    pub first_unit_forced: bool,
    /// Gate checks passed, or were bypassed, for this session.
    pub checks_run: bool,
    /// Only checked where the pioneer upgrades before the checks run.
    #[serde(default)]
    pub workload_pin: Option<CheckResult>,
    pub compatibility: Option<CheckResult>,
    pub pre_upgrade: Option<CheckResult>,
    /// Pre-upgrade checks were invoked at least once in this session.
    #[serde(default)]
    pub pre_upgrade_invoked: bool,
    /// Lowest ordinal the platform has been told may upgrade.
    pub released_through: Option<Ordinal>,
    /// Last committed controller state.
    pub state: RolloutState,
    pub created_at: u64,
}

impl UpgradeSession {
    pub fn new(app: &str, original: VersionPin, target: VersionPin, pause_policy: PausePolicy) -> Self {
        Self {
            app: app.to_string(),
            generation: 0,
            original,
            target,
            pause_policy,
            policy_valid: true,
            first_unit_forced: false,
            checks_run: false,
            workload_pin: None,
            compatibility: None,
            pre_upgrade: None,
            pre_upgrade_invoked: false,
            released_through: None,
            state: RolloutState::AwaitingFirstUnitChecks,
            created_at: epoch_secs(),
        }
    }

    /// Target equals the versions the session started from.
    pub fn is_rollback(&self) -> bool {
        self.target.same_version(&self.original)
    }

    /// Re-arm for a new target: checks and override reset, original kept.
    pub fn rearm(&mut self, target: VersionPin, released_through: Option<Ordinal>) {
        self.target = target;
        self.first_unit_forced = false;
        self.checks_run = false;
        self.workload_pin = None;
        self.compatibility = None;
        self.pre_upgrade = None;
        self.pre_upgrade_invoked = false;
        self.released_through = released_through;
        self.state = RolloutState::AwaitingFirstUnitChecks;
    }
}

// ── Audit ──────────────────────────────────────────────────────────

/// One committed state transition.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuditEntry {
    pub app: String,
    /// Per-application sequence number. Assigned by the store.
    pub seq: u64,
    pub at: u64,
    pub generation: u64,
    pub from: String,
    pub to: String,
    pub detail: String,
}

impl AuditEntry {
    pub fn new(app: &str, from: &RolloutState, to: &RolloutState, detail: impl Into<String>) -> Self {
        Self {
            app: app.to_string(),
            seq: 0,
            at: epoch_secs(),
            generation: 0,
            from: from.label(),
            to: to.label(),
            detail: detail.into(),
        }
    }

    /// Build the composite key for the audit table.
    pub fn table_key(&self) -> String {
        format!("{}:{:020}", self.app, self.seq)
    }
}

/// Current Unix epoch in seconds.
pub fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
