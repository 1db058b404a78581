//! Human-readable status lines. Read-only: nothing here feeds back into
//! the controller.

use refresh_core::{BlockReason, Ordinal, PausePolicy, PlatformVariant, RolloutState, VersionPin};
use refresh_state::{ApplicationRecord, UnitState};
use serde::{Deserialize, Serialize};

use crate::controller::{RolloutContext, derive};
use crate::strategy::{ReleaseInstruction, ReleaseOrder};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusLevel {
    Active,
    Maintenance,
    Waiting,
    Blocked,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusLine {
    pub level: StatusLevel,
    pub message: String,
}

impl StatusLine {
    fn new(level: StatusLevel, message: impl Into<String>) -> Self {
        Self {
            level,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitStatus {
    pub ordinal: Ordinal,
    #[serde(flatten)]
    pub line: StatusLine,
}

/// Everything an operator sees for one application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusReport {
    pub app: String,
    pub state: RolloutState,
    /// `None` when nothing needs the operator's attention.
    pub status: Option<StatusLine>,
    pub units: Vec<UnitStatus>,
    pub instruction: ReleaseInstruction,
    pub policy_warning: Option<String>,
    pub rollback_command: Option<String>,
}

/// Command that returns every unit to `original`.
pub fn rollback_command(record: &ApplicationRecord, original: &VersionPin) -> String {
    match (record.variant, &record.resource_name) {
        (PlatformVariant::Partition, Some(resource)) => format!(
            "refresh {} --revision {} --resource {}={}",
            record.name, original.code, resource, original.workload
        ),
        _ => format!("refresh {} --revision {}", record.name, original.code),
    }
}

/// `pre-upgrade-check` success message.
pub fn ready_message(docs_url: &str, rollback_command: &str) -> String {
    let docs = if docs_url.is_empty() {
        String::new()
    } else {
        format!(" For upgrade instructions, see {docs_url}")
    };
    format!(
        "Ready for upgrade.{docs}\nAfter the upgrade has started, use this command to rollback (copy this down in case you need it later):\n`{rollback_command}`"
    )
}

pub fn report(ctx: &RolloutContext) -> StatusReport {
    let evaluation = derive(ctx);
    let in_progress = ctx.session.is_some();
    StatusReport {
        app: ctx.record.name.clone(),
        state: evaluation.state,
        status: app_status(ctx, evaluation.state),
        units: ctx
            .units
            .iter()
            .map(|unit| UnitStatus {
                ordinal: unit.ordinal,
                line: unit_status(ctx, unit),
            })
            .collect(),
        instruction: ctx.instruction(),
        policy_warning: evaluation.policy_warning,
        rollback_command: in_progress.then(|| ctx.rollback_command()),
    }
}

/// Application status line, highest priority first.
pub fn app_status(ctx: &RolloutContext, state: RolloutState) -> Option<StatusLine> {
    if let Some(warning) = ctx.policy_warning() {
        return Some(StatusLine::new(StatusLevel::Blocked, warning));
    }
    let session = ctx.session.as_ref()?;
    let rollback = ctx.rollback_command();

    let line = match state {
        RolloutState::Idle | RolloutState::Complete => return None,
        RolloutState::Blocked {
            reason: BlockReason::WorkloadMismatch,
        } => StatusLine::new(
            StatusLevel::Blocked,
            format!(
                "Upgrade was run with missing or incorrect {} version. Rollback by running `{rollback}`",
                ctx.workload_name()
            ),
        ),
        RolloutState::Blocked {
            reason: BlockReason::Incompatible,
        } => StatusLine::new(
            StatusLevel::Blocked,
            format!("Upgrade incompatible. Rollback by running `{rollback}`"),
        ),
        RolloutState::Blocked {
            reason: BlockReason::PreUpgradeFailed,
        } => {
            let reason = session
                .pre_upgrade
                .as_ref()
                .map_or("Pre-upgrade check failed", |r| r.message.as_str());
            StatusLine::new(
                StatusLevel::Blocked,
                format!("Rollback by running `{rollback}`. {reason}"),
            )
        }
        RolloutState::Blocked {
            reason: BlockReason::Unhealthy { ordinal },
        } => StatusLine::new(
            StatusLevel::Blocked,
            format!(
                "Unit {ordinal} is unhealthy. Upgrade will not resume. To continue anyway, run `resume-upgrade` with `ignore-health-of-upgraded-units=true`. To rollback, run `{rollback}`"
            ),
        ),
        RolloutState::Paused { .. } => paused_line(ctx, &rollback),
        RolloutState::AwaitingFirstUnitChecks | RolloutState::RollingOut { .. } => {
            let pioneer_only = ctx.pioneer().is_some()
                && session.released_through == ctx.pioneer()
                && ctx.order.len() > 1;
            match session.pause_policy {
                PausePolicy::All => paused_line(ctx, &rollback),
                PausePolicy::First if pioneer_only => paused_line(ctx, &rollback),
                _ => StatusLine::new(
                    StatusLevel::Maintenance,
                    format!(
                        "Upgrading. To pause upgrade, set `pause_after_unit_upgrade=all` on {}",
                        ctx.record.name
                    ),
                ),
            }
        }
    };
    Some(line)
}

/// Shown whenever the operator is expected to resume by hand.
fn paused_line(ctx: &RolloutContext, rollback: &str) -> StatusLine {
    let released = ctx
        .session
        .as_ref()
        .and_then(|s| s.released_through)
        .or(ctx.pioneer())
        .unwrap_or(0);
    let actor = match ctx.next_outdated() {
        Some((_, next)) => format!(
            "unit {}",
            ctx.strategy().resume_actor(ctx.record.coordinator, next)
        ),
        None => ctx.strategy().resume_actor_label().to_string(),
    };
    StatusLine::new(
        StatusLevel::Blocked,
        format!(
            "Upgrading. Check units >={released} are healthy & run `resume-upgrade` on {actor}. To rollback, run `{rollback}`"
        ),
    )
}

pub fn unit_status(ctx: &RolloutContext, unit: &UnitState) -> StatusLine {
    let workload = ctx.workload_name();
    if let Some(session) = &ctx.session {
        if !ctx.workload_allowed_to_start(unit.ordinal) {
            return StatusLine::new(
                StatusLevel::Waiting,
                format!("Waiting for gate checks before starting {workload}"),
            );
        }
        if !unit.upgraded && ctx.may_upgrade(unit.ordinal) && !unit.runs(&session.original) {
            return StatusLine::new(StatusLevel::Maintenance, "Upgrading");
        }
        if !unit.upgraded && ctx.may_upgrade(unit.ordinal) {
            return StatusLine::new(StatusLevel::Maintenance, "Waiting for platform to upgrade unit");
        }
    }
    if unit.health_checked && !unit.healthy {
        return StatusLine::new(StatusLevel::Blocked, format!("{workload} is unhealthy"));
    }

    let release = [ctx.record.target.as_ref(), ctx.original()]
        .into_iter()
        .flatten()
        .find(|pin| unit.runs(pin))
        .map(|pin| pin.workload_release.as_str())
        .filter(|release| !release.is_empty());
    let mut message = match release {
        Some(release) => format!("{workload} {release} running"),
        None => format!("{workload} running"),
    };
    if ctx.session.is_some() && !unit.upgraded {
        message.push_str(" (restart pending)");
    }
    if !unit.code_version.is_empty() {
        message.push_str(&format!("; Code version {}", unit.code_version));
    }
    StatusLine::new(StatusLevel::Active, message)
}
