//! Rollout controller: derives the rollout state and commits it.
//!
//! ```text
//!  load ──► sync session ──► action ──► due checks ──► derive ──► apply ──► commit (CAS)
//!   ▲                                                                          │
//!   └────────────────────────── generation conflict ◄──────────────────────────┘
//! ```
//!
//! [`derive`] is pure: it reads units, session, policy and variant and
//! returns the state plus the unit to release, if any. Gate checks, the
//! release lowering and the commit live in [`RolloutController`].
//! Re-evaluating with unchanged inputs commits nothing.

use std::sync::Arc;

use refresh_core::{
    BlockReason, CheckResult, Ordinal, PausePolicy, PauseReason, RolloutState, VersionPin,
};
use refresh_state::{
    ApplicationRecord, AuditEntry, SessionCommit, StateError, StateStore, UnitState,
    UpgradeSession, epoch_secs,
};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::checks::{CheckEngine, Workload};
use crate::error::{LedgerError, RolloutError, RolloutResult};
use crate::ledger::{self, declare_target};
use crate::status::{self, StatusReport};
use crate::strategy::{CheckTiming, ReleaseInstruction, ReleaseOrder, for_variant};

/// Compare-and-set attempts before giving up on a contended session.
const MAX_COMMIT_ATTEMPTS: u32 = 5;

pub const INVALID_POLICY_WARNING: &str =
    "pause_after_unit_upgrade config must be set to \"all\", \"first\", or \"none\"";

// ── Context ────────────────────────────────────────────────────────

/// Everything the controller reads for one application, loaded fresh on
/// every evaluation.
#[derive(Clone)]
pub struct RolloutContext {
    pub record: ApplicationRecord,
    /// Ascending ordinal order.
    pub units: Vec<UnitState>,
    pub session: Option<UpgradeSession>,
    /// Release order, highest ordinal first.
    pub order: Vec<Ordinal>,
    strategy: &'static dyn ReleaseOrder,
    notes: Vec<String>,
    units_dirty: bool,
}

impl RolloutContext {
    pub fn new(
        record: ApplicationRecord,
        units: Vec<UnitState>,
        session: Option<UpgradeSession>,
    ) -> Self {
        let strategy = for_variant(record.variant);
        let order = strategy.order(&units);
        Self {
            record,
            units,
            session,
            order,
            strategy,
            notes: Vec::new(),
            units_dirty: false,
        }
    }

    pub fn strategy(&self) -> &'static dyn ReleaseOrder {
        self.strategy
    }

    /// First unit in release order.
    pub fn pioneer(&self) -> Option<Ordinal> {
        self.order.first().copied()
    }

    pub fn unit(&self, ordinal: Ordinal) -> Option<&UnitState> {
        self.units.iter().find(|u| u.ordinal == ordinal)
    }

    /// Position in release order and ordinal of the next unit that does
    /// not run the target.
    pub fn next_outdated(&self) -> Option<(usize, Ordinal)> {
        ledger::next_outdated(&self.units, &self.order)
    }

    /// First upgraded, unhealthy unit ahead of `index` in release order.
    pub fn first_unhealthy_before(&self, index: usize) -> Option<Ordinal> {
        self.order[..index.min(self.order.len())]
            .iter()
            .copied()
            .find(|&ordinal| self.unit(ordinal).is_some_and(|u| u.upgraded && !u.healthy))
    }

    /// Pause policy in effect: the session's last valid value, otherwise
    /// the configured one.
    pub fn policy(&self) -> PausePolicy {
        match &self.session {
            Some(session) => session.pause_policy,
            None => self.record.pause_policy().unwrap_or_default(),
        }
    }

    /// Standing warning while the configured policy is out of range.
    pub fn policy_warning(&self) -> Option<String> {
        self.record
            .pause_policy()
            .is_none()
            .then(|| INVALID_POLICY_WARNING.to_string())
    }

    /// Versions to roll back to.
    pub fn original(&self) -> Option<&VersionPin> {
        self.session
            .as_ref()
            .map(|s| &s.original)
            .or(self.record.original.as_ref())
    }

    pub fn rollback_command(&self) -> String {
        match self.original() {
            Some(original) => status::rollback_command(&self.record, original),
            None => format!("refresh {}", self.record.name),
        }
    }

    pub fn workload_name(&self) -> &str {
        if self.record.workload_name.is_empty() {
            "workload"
        } else {
            &self.record.workload_name
        }
    }

    /// Whether the platform may replace `ordinal` now.
    pub fn may_upgrade(&self, ordinal: Ordinal) -> bool {
        match &self.session {
            None => true,
            Some(session) => session.released_through.is_some_and(|r| ordinal >= r),
        }
    }

    /// Whether `ordinal`'s workload may start on the versions it runs.
    ///
    /// A unit already on the new versions waits until the gate checks
    /// passed or were bypassed; a rollback never waits.
    pub fn workload_allowed_to_start(&self, ordinal: Ordinal) -> bool {
        let Some(session) = &self.session else {
            return true;
        };
        session.is_rollback()
            || session.checks_run
            || self
                .unit(ordinal)
                .is_some_and(|u| u.runs(&session.original))
    }

    /// What the platform is told right now.
    pub fn instruction(&self) -> ReleaseInstruction {
        self.strategy.instruction(
            self.session.is_some(),
            self.session.as_ref().and_then(|s| s.released_through),
            &self.order,
        )
    }

    /// Take `workload` as the target's pinned workload for the rest of the
    /// session. Used when the operator accepts what the pioneer runs.
    pub(crate) fn accept_workload(&mut self, workload: &str) {
        let Some(mut target) = self.record.target.clone() else {
            return;
        };
        target.workload = workload.to_string();
        if declare_target(&mut self.record, &mut self.units, &target) {
            self.units_dirty = true;
        }
        if let Some(session) = self.session.as_mut() {
            session.target.workload = target.workload;
        }
    }

    /// Free-text reason attached to the next audit entry.
    pub fn note(&mut self, note: impl Into<String>) {
        self.notes.push(note.into());
    }

    fn decision(&self, evaluation: &Evaluation) -> Decision {
        Decision {
            state: evaluation.state,
            instruction: self.instruction(),
            released_through: self.session.as_ref().and_then(|s| s.released_through),
            policy_warning: evaluation.policy_warning.clone(),
        }
    }
}

// ── Derivation ─────────────────────────────────────────────────────

/// Output of [`derive`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Evaluation {
    pub state: RolloutState,
    /// Unit the rollout may release now.
    pub release: Option<Ordinal>,
    pub policy_warning: Option<String>,
}

/// Rollout state as a pure function of units, session, policy and variant.
pub fn derive(ctx: &RolloutContext) -> Evaluation {
    let (state, release) = match (&ctx.session, ctx.next_outdated()) {
        (None, None) => (RolloutState::Idle, None),
        (Some(_), None) => (RolloutState::Complete, None),
        // The session is created on the next commit.
        (None, Some(_)) => (RolloutState::AwaitingFirstUnitChecks, None),
        (Some(session), Some((index, next))) => derive_in_session(ctx, session, index, next),
    };
    Evaluation {
        state,
        release,
        policy_warning: ctx.policy_warning(),
    }
}

fn derive_in_session(
    ctx: &RolloutContext,
    session: &UpgradeSession,
    index: usize,
    next: Ordinal,
) -> (RolloutState, Option<Ordinal>) {
    if !session.checks_run {
        if failed(&session.workload_pin) {
            return (
                RolloutState::Blocked {
                    reason: BlockReason::WorkloadMismatch,
                },
                None,
            );
        }
        if failed(&session.compatibility) {
            return (
                RolloutState::Blocked {
                    reason: BlockReason::Incompatible,
                },
                None,
            );
        }
        if failed(&session.pre_upgrade) {
            return (
                RolloutState::Blocked {
                    reason: BlockReason::PreUpgradeFailed,
                },
                None,
            );
        }
        return (RolloutState::AwaitingFirstUnitChecks, None);
    }

    // Already released; let it finish.
    if session.released_through.is_some_and(|r| r <= next) {
        return (RolloutState::RollingOut { next }, None);
    }

    let ahead = &ctx.order[..index];
    let unhealthy = ahead.iter().copied().find(|&o| {
        ctx.unit(o)
            .is_some_and(|u| u.upgraded && u.health_checked && !u.healthy)
    });
    if let Some(ordinal) = unhealthy {
        return (
            RolloutState::Blocked {
                reason: BlockReason::Unhealthy { ordinal },
            },
            None,
        );
    }

    // Upgraded but no verdict on the new version yet.
    let unverified = ahead
        .iter()
        .copied()
        .find(|&o| ctx.unit(o).is_some_and(|u| u.upgraded && !u.health_checked));
    if let Some(ordinal) = unverified {
        return (RolloutState::RollingOut { next: ordinal }, None);
    }

    if session.pause_policy.halts_before(index) {
        return (
            RolloutState::Paused {
                reason: PauseReason::Manual,
            },
            None,
        );
    }
    (RolloutState::RollingOut { next }, Some(next))
}

fn failed(result: &Option<CheckResult>) -> bool {
    result.as_ref().is_some_and(|r| !r.passed)
}

// ── Controller ─────────────────────────────────────────────────────

/// Result of a committed (or unchanged) evaluation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Decision {
    pub state: RolloutState,
    pub instruction: ReleaseInstruction,
    pub released_through: Option<Ordinal>,
    pub policy_warning: Option<String>,
}

/// Answer to the platform's per-unit release query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnitPermission {
    pub ordinal: Ordinal,
    pub may_upgrade: bool,
    pub workload_allowed_to_start: bool,
    pub instruction: ReleaseInstruction,
}

/// Drives one application's session. Cheap to clone.
#[derive(Clone)]
pub struct RolloutController {
    store: StateStore,
    app: String,
    engine: CheckEngine,
}

impl RolloutController {
    pub fn new(store: StateStore, app: &str, workload: Arc<dyn Workload>) -> Self {
        Self {
            store,
            app: app.to_string(),
            engine: CheckEngine::new(workload),
        }
    }

    pub fn app(&self) -> &str {
        &self.app
    }

    pub fn engine(&self) -> &CheckEngine {
        &self.engine
    }

    pub fn load(&self) -> RolloutResult<RolloutContext> {
        let record = self
            .store
            .get_app(&self.app)?
            .ok_or_else(|| RolloutError::UnknownApplication(self.app.clone()))?;
        let units = self.store.list_units(&self.app)?;
        let session = self.store.get_session(&self.app)?;
        Ok(RolloutContext::new(record, units, session))
    }

    /// Current decision without running checks or writing anything.
    pub fn evaluate(&self) -> RolloutResult<Decision> {
        let ctx = self.load()?;
        let evaluation = derive(&ctx);
        Ok(ctx.decision(&evaluation))
    }

    pub fn status(&self) -> RolloutResult<StatusReport> {
        Ok(status::report(&self.load()?))
    }

    /// Re-derive after a lifecycle or health event and commit the result.
    pub fn reconcile(&self) -> RolloutResult<Decision> {
        let ((), decision) = self.mutate(|_, _| Ok::<_, RolloutError>(()))?;
        Ok(decision)
    }

    /// Declare new target versions. A target equal to the session's
    /// original versions is a rollback.
    pub fn change_target(&self, target: &VersionPin) -> RolloutResult<Decision> {
        let ((), decision) = self.mutate(|ctx, _| {
            if declare_target(&mut ctx.record, &mut ctx.units, target) {
                ctx.units_dirty = true;
                info!(app = %ctx.record.name, %target, "target versions declared");
            }
            Ok::<_, RolloutError>(())
        })?;
        Ok(decision)
    }

    /// Record the configured `pause_after_unit_upgrade` value verbatim.
    pub fn set_pause_policy(&self, raw: &str) -> RolloutResult<Decision> {
        let ((), decision) = self.mutate(|ctx, _| {
            if ctx.record.pause_policy_raw != raw {
                ctx.record.pause_policy_raw = raw.to_string();
                ctx.record.updated_at = epoch_secs();
                ctx.note(format!("pause_after_unit_upgrade set to {raw:?}"));
            }
            Ok::<_, RolloutError>(())
        })?;
        Ok(decision)
    }

    pub fn set_coordinator(&self, ordinal: Ordinal) -> RolloutResult<Decision> {
        let ((), decision) = self.mutate(|ctx, _| {
            if ctx.record.coordinator != ordinal {
                ctx.record.coordinator = ordinal;
                ctx.record.updated_at = epoch_secs();
                ctx.note(format!("coordinator is unit {ordinal}"));
            }
            Ok::<_, RolloutError>(())
        })?;
        Ok(decision)
    }

    pub fn permission(&self, ordinal: Ordinal) -> RolloutResult<UnitPermission> {
        let ctx = self.load()?;
        if ctx.unit(ordinal).is_none() {
            return Err(LedgerError::UnknownUnit {
                app: self.app.clone(),
                ordinal,
            }
            .into());
        }
        Ok(UnitPermission {
            ordinal,
            may_upgrade: ctx.may_upgrade(ordinal),
            workload_allowed_to_start: ctx.workload_allowed_to_start(ordinal),
            instruction: ctx.instruction(),
        })
    }

    /// Load, apply `action`, run due checks, derive and commit with
    /// compare-and-set. On a generation conflict everything is re-derived
    /// from a fresh load, so `action` may run more than once.
    ///
    /// An `Err` from `action` aborts without writing.
    pub fn mutate<T, E, F>(&self, mut action: F) -> Result<(T, Decision), E>
    where
        E: From<RolloutError>,
        F: FnMut(&mut RolloutContext, &CheckEngine) -> Result<T, E>,
    {
        for attempt in 1..=MAX_COMMIT_ATTEMPTS {
            let mut ctx = self.load()?;
            let loaded_session = ctx.session.clone();
            let loaded_record = ctx.record.clone();
            let expected_generation = loaded_session.as_ref().map(|s| s.generation);
            let previous = loaded_session
                .as_ref()
                .map_or(RolloutState::Idle, |s| s.state);

            self.sync_session(&mut ctx)?;
            let value = action(&mut ctx, &self.engine)?;
            self.sync_session(&mut ctx)?;
            self.run_due_checks(&mut ctx);

            let evaluation = derive(&ctx);
            if let Some(warning) = &evaluation.policy_warning {
                warn!(app = %self.app, raw = %ctx.record.pause_policy_raw, "{warning}");
            }
            let audit = self.apply(&mut ctx, previous, &evaluation);
            let decision = ctx.decision(&evaluation);

            if ctx.session == loaded_session
                && ctx.record == loaded_record
                && !ctx.units_dirty
                && audit.is_empty()
            {
                debug!(app = %self.app, state = %decision.state, "nothing to commit");
                return Ok((value, decision));
            }

            let units: &[UnitState] = if ctx.units_dirty { &ctx.units } else { &[] };
            let commit = SessionCommit {
                app: &self.app,
                expected_generation,
                session: ctx.session.as_ref(),
                record: (ctx.record != loaded_record).then_some(&ctx.record),
                units,
                audit,
            };
            match self.store.commit(commit) {
                Ok(generation) => {
                    if previous != decision.state {
                        info!(
                            app = %self.app,
                            from = %previous,
                            to = %decision.state,
                            ?generation,
                            "rollout state changed"
                        );
                    }
                    return Ok((value, decision));
                }
                Err(StateError::Conflict { expected, found, .. }) => {
                    debug!(app = %self.app, attempt, ?expected, ?found, "session changed underneath; re-deriving");
                }
                Err(e) => return Err(RolloutError::State(e).into()),
            }
        }
        warn!(app = %self.app, attempts = MAX_COMMIT_ATTEMPTS, "giving up on contended session");
        Err(RolloutError::Contended {
            app: self.app.clone(),
            attempts: MAX_COMMIT_ATTEMPTS,
        }
        .into())
    }

    /// Create, re-arm or close out the session to match the declared
    /// target, and mirror the configured policy into it.
    fn sync_session(&self, ctx: &mut RolloutContext) -> RolloutResult<()> {
        let Some(target) = ctx.record.target.clone() else {
            return Ok(());
        };
        let outdated = !ledger::all_up_to_date(&ctx.units);

        if ctx.session.is_none() {
            if !outdated {
                if ctx.record.original.as_ref() != Some(&target) {
                    ctx.record.original = Some(target);
                }
                return Ok(());
            }
            let original = ctx
                .record
                .original
                .clone()
                .or_else(|| common_versions(&ctx.units))
                .ok_or_else(|| RolloutError::MissingOriginalVersions(self.app.clone()))?;
            let policy = ctx.record.pause_policy().unwrap_or_default();
            let mut session = UpgradeSession::new(&self.app, original, target, policy);
            session.released_through = ctx.strategy.initial_release(&ctx.order);
            let note = if session.is_rollback() {
                format!("rollback to {} started", session.target)
            } else {
                format!("upgrade from {} to {} started", session.original, session.target)
            };
            info!(app = %self.app, released_through = ?session.released_through, "{note}");
            ctx.session = Some(session);
            ctx.notes.push(note);
        } else if let Some(session) = ctx
            .session
            .as_mut()
            .filter(|s| !s.target.same_version(&target))
        {
            let release = ctx.strategy.rearm_release(session.released_through, &ctx.order);
            session.rearm(target, release);
            let note = if session.is_rollback() {
                format!("target changed; rolling back to {}", session.target)
            } else {
                format!("target changed to {}; checks re-armed", session.target)
            };
            info!(app = %self.app, released_through = ?release, "{note}");
            ctx.notes.push(note);
        }

        if let Some(session) = ctx.session.as_mut() {
            match ctx.record.pause_policy() {
                Some(policy) => {
                    session.pause_policy = policy;
                    session.policy_valid = true;
                }
                None => session.policy_valid = false,
            }
        }
        Ok(())
    }

    /// Run the gate checks once they are due. Failed checks are never
    /// re-run here; only a forced start or a target change moves past them.
    ///
    /// The workload pin is the exception: it is re-evaluated on every pass
    /// so a pioneer redeployed with the pinned workload clears the block.
    fn run_due_checks(&self, ctx: &mut RolloutContext) {
        let timing = ctx.strategy.check_timing();
        let pioneer = ctx.pioneer().and_then(|o| ctx.unit(o)).cloned();
        let Some(session) = ctx.session.as_mut() else {
            return;
        };
        let due = match timing {
            CheckTiming::BeforeAnyUnit => true,
            // The workload may still differ from the pin.
            CheckTiming::AfterFirstUnit => pioneer
                .as_ref()
                .is_some_and(|u| u.code_version == session.target.code),
        };
        if !due || session.checks_run {
            return;
        }

        if let (CheckTiming::AfterFirstUnit, Some(unit)) = (timing, &pioneer) {
            let result = self
                .engine
                .run_workload_pin_check(&unit.workload_version, &session.target);
            let passed = result.passed;
            if session.workload_pin.as_ref() != Some(&result) {
                if passed {
                    info!(app = %self.app, ordinal = unit.ordinal, "pioneer runs the pinned workload");
                } else {
                    warn!(app = %self.app, ordinal = unit.ordinal, installed = %unit.workload_version, "pioneer runs an unpinned workload");
                }
                ctx.notes.push(result.message.clone());
                session.workload_pin = Some(result);
            }
            if !passed {
                return;
            }
        }
        if failed(&session.compatibility) || failed(&session.pre_upgrade) {
            return;
        }

        if session.compatibility.is_none() {
            let result = self
                .engine
                .run_compatibility_check(&session.original, &session.target);
            ctx.notes.push(result.message.clone());
            session.compatibility = Some(result);
        }
        let compatible = session.compatibility.as_ref().is_some_and(|r| r.passed);
        if compatible && !session.is_rollback() && session.pre_upgrade.is_none() {
            let result = self.engine.run_pre_upgrade_checks(timing);
            session.pre_upgrade_invoked = true;
            ctx.notes.push(result.message.clone());
            session.pre_upgrade = Some(result);
        }
        let prepared =
            session.is_rollback() || session.pre_upgrade.as_ref().is_some_and(|r| r.passed);
        if compatible && prepared {
            session.checks_run = true;
        }
    }

    /// Fold the evaluation into the session and build the audit entries.
    fn apply(
        &self,
        ctx: &mut RolloutContext,
        previous: RolloutState,
        evaluation: &Evaluation,
    ) -> Vec<AuditEntry> {
        let detail = ctx.notes.join("; ");
        let mut audit = Vec::new();

        if evaluation.state == RolloutState::Complete {
            if let Some(session) = ctx.session.take() {
                ctx.record.original = Some(ctx.record.target.clone().unwrap_or(session.target));
                info!(app = %self.app, "rollout complete; session closed");
                audit.push(AuditEntry::new(
                    &self.app,
                    &previous,
                    &RolloutState::Complete,
                    detail,
                ));
                audit.push(AuditEntry::new(
                    &self.app,
                    &RolloutState::Complete,
                    &RolloutState::Idle,
                    "all units run the target versions",
                ));
            }
            return audit;
        }

        let state = evaluation.state;
        if let Some(session) = ctx.session.as_mut() {
            if let Some(release) = evaluation.release {
                // Only ever lowered.
                let lowered = session.released_through.map_or(release, |r| r.min(release));
                session.released_through = Some(lowered);
            }
            session.state = state;
        }
        if previous != state || !detail.is_empty() {
            audit.push(AuditEntry::new(&self.app, &previous, &state, detail));
        }
        audit
    }
}

/// Versions shared by every outdated unit, if they agree.
fn common_versions(units: &[UnitState]) -> Option<VersionPin> {
    let mut outdated = units.iter().filter(|u| !u.upgraded);
    let first = outdated.next()?;
    outdated
        .all(|u| u.code_version == first.code_version && u.workload_version == first.workload_version)
        .then(|| VersionPin::new(&first.code_version, &first.workload_version, ""))
}
