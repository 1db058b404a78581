//! Operator actions: pre-upgrade check, resume, forced start.
//!
//! Every action validates the actor and the session before touching
//! anything. A rejected action returns an [`ActionError`] and commits
//! nothing.

use refresh_core::{Ordinal, PausePolicy, VersionPin};
use serde::Serialize;
use tracing::{info, warn};

use crate::controller::{Decision, RolloutController};
use crate::error::{ActionError, RolloutResult};
use crate::status;
use crate::strategy::{CheckTiming, ReleaseOrder};

/// Successful action: the unit now upgrading (or starting).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActionOutcome {
    pub ordinal: Ordinal,
    pub message: String,
    pub decision: Decision,
}

/// Result of a passing `pre-upgrade-check`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PreCheckReport {
    pub message: String,
    /// Command that restores the current versions.
    pub rollback_command: String,
}

/// Gate checks `force-upgrade-start` skips. At least one must be set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GateOverrides {
    pub workload_pin: bool,
    pub compatibility: bool,
    pub pre_upgrade: bool,
}

impl GateOverrides {
    pub fn any(&self) -> bool {
        self.workload_pin || self.compatibility || self.pre_upgrade
    }
}

#[derive(Clone)]
pub struct ActionGateway {
    controller: RolloutController,
}

impl ActionGateway {
    pub fn new(controller: RolloutController) -> Self {
        Self { controller }
    }

    pub fn controller(&self) -> &RolloutController {
        &self.controller
    }

    /// Check readiness before the operator declares a new target.
    pub fn request_pre_check(&self, actor: Ordinal) -> Result<PreCheckReport, ActionError> {
        let ctx = self.controller.load()?;
        if actor != ctx.record.coordinator {
            return Err(ActionError::WrongActor {
                action: "pre-upgrade-check",
                expected: format!("the coordinating unit (unit {})", ctx.record.coordinator),
            });
        }
        if ctx.session.is_some() || ctx.next_outdated().is_some() {
            return Err(ActionError::AlreadyUpgrading);
        }

        let result = self
            .controller
            .engine()
            .run_pre_upgrade_checks(CheckTiming::BeforeAnyUnit);
        let rollback_command = ctx.rollback_command();
        if !result.passed {
            return Err(ActionError::CheckFailed {
                reason: result.message,
                rollback_command,
            });
        }
        info!(app = %ctx.record.name, "pre-upgrade check passed");
        Ok(PreCheckReport {
            message: status::ready_message(&ctx.record.docs_url, &rollback_command),
            rollback_command,
        })
    }

    /// Release the next unit after a pause or an unhealthy block.
    pub fn resume(&self, actor: Ordinal, ignore_health: bool) -> Result<ActionOutcome, ActionError> {
        let ((ordinal, policy), decision) = self.controller.mutate(|ctx, _| {
            let Some(session) = ctx.session.as_ref() else {
                return Err(ActionError::NoUpgradeInProgress);
            };
            let Some((index, next)) = ctx.next_outdated() else {
                return Err(ActionError::NoUpgradeInProgress);
            };

            let strategy = ctx.strategy();
            let expected = strategy.resume_actor(ctx.record.coordinator, next);
            if actor != expected {
                return Err(ActionError::WrongActor {
                    action: "resume-upgrade",
                    expected: format!("{} (unit {expected})", strategy.resume_actor_label()),
                });
            }
            if session.pause_policy == PausePolicy::None && !ignore_health {
                return Err(ActionError::PolicyNotApplicable);
            }
            if !session.checks_run {
                let pioneer = ctx.pioneer().unwrap_or(next);
                return Err(if ignore_health {
                    ActionError::ForceStartRequired { pioneer }
                } else {
                    ActionError::UnitUnhealthy(pioneer)
                });
            }
            if session.released_through.is_some_and(|r| r <= next) {
                return Err(ActionError::NothingToResume { ordinal: next });
            }
            if !ignore_health {
                if let Some(unhealthy) = ctx.first_unhealthy_before(index) {
                    return Err(ActionError::UnitUnhealthy(unhealthy));
                }
            }

            if let Some(session) = ctx.session.as_mut() {
                session.released_through =
                    Some(session.released_through.map_or(next, |r| r.min(next)));
            }
            ctx.note(format!(
                "resume-upgrade on unit {actor} released unit {next}{}",
                if ignore_health { " (health ignored)" } else { "" }
            ));
            Ok((next, ctx.policy()))
        })?;

        let message = if policy == PausePolicy::First {
            format!("Upgrade resumed. Unit {ordinal} is upgrading next")
        } else {
            format!("Unit {ordinal} is upgrading next")
        };
        info!(app = %self.controller.app(), ordinal, ignore_health, "upgrade resumed");
        Ok(ActionOutcome {
            ordinal,
            message,
            decision,
        })
    }

    /// Bypass gate checks on the pioneer.
    ///
    /// Checks that are not ignored run again; if one fails nothing changes
    /// and the error carries the rollback command. Ignoring the workload
    /// pin makes the workload the pioneer runs the target's for the rest
    /// of the session.
    pub fn force_start(
        &self,
        actor: Ordinal,
        overrides: GateOverrides,
    ) -> Result<ActionOutcome, ActionError> {
        if !overrides.any() {
            return Err(ActionError::NoOverrideSelected);
        }

        let ((pioneer, workload), decision) = self.controller.mutate(|ctx, engine| {
            if ctx.session.is_none() {
                return Err(ActionError::NoUpgradeInProgress);
            }
            let Some(pioneer) = ctx.pioneer() else {
                return Err(ActionError::NoUpgradeInProgress);
            };
            if actor != pioneer {
                return Err(ActionError::WrongActor {
                    action: "force-upgrade-start",
                    expected: format!("unit {pioneer}"),
                });
            }
            let rollback_command = ctx.rollback_command();
            let timing = ctx.strategy().check_timing();
            let pioneer_unit = ctx.unit(pioneer).cloned();
            let Some(session) = ctx.session.as_mut() else {
                return Err(ActionError::NoUpgradeInProgress);
            };
            if session.checks_run {
                return Err(ActionError::AlreadyStarted);
            }

            let refuse = |session_app: &str, message: String| {
                warn!(app = %session_app, "forced start refused: {message}");
                ActionError::CheckFailed {
                    reason: message,
                    rollback_command: rollback_command.clone(),
                }
            };

            // Only meaningful once the pioneer runs the target code.
            let installed = pioneer_unit
                .filter(|u| {
                    timing == CheckTiming::AfterFirstUnit && u.code_version == session.target.code
                })
                .map(|u| u.workload_version);
            let mut accepted = None;
            if let Some(installed) = installed {
                let result = engine.run_workload_pin_check(&installed, &session.target);
                if !result.passed {
                    if !overrides.workload_pin {
                        return Err(refuse(&session.app, result.message));
                    }
                    accepted = Some(installed);
                }
                session.workload_pin = Some(result);
            }
            let compatibility = if overrides.compatibility {
                None
            } else {
                let result = engine.run_compatibility_check(&session.original, &session.target);
                if !result.passed {
                    return Err(refuse(&session.app, result.message));
                }
                Some(result)
            };
            let pre_upgrade = if overrides.pre_upgrade || session.is_rollback() {
                None
            } else {
                let result = engine.run_pre_upgrade_checks(timing);
                if !result.passed {
                    return Err(refuse(&session.app, result.message));
                }
                Some(result)
            };

            if compatibility.is_some() {
                session.compatibility = compatibility;
            }
            if pre_upgrade.is_some() {
                session.pre_upgrade = pre_upgrade;
                session.pre_upgrade_invoked = true;
            }
            session.checks_run = true;
            session.first_unit_forced = true;
            if let Some(installed) = &accepted {
                ctx.accept_workload(installed);
                ctx.note(format!("accepted workload {installed} on unit {pioneer}"));
            }
            ctx.note(format!(
                "force-upgrade-start on unit {pioneer} (ignore workload pin: {}, ignore compatibility: {}, ignore pre-upgrade: {})",
                overrides.workload_pin, overrides.compatibility, overrides.pre_upgrade
            ));
            Ok((pioneer, ctx.workload_name().to_string()))
        })?;

        info!(app = %self.controller.app(), pioneer, "gate checks bypassed");
        Ok(ActionOutcome {
            ordinal: pioneer,
            message: format!(
                "{workload} upgraded on unit {pioneer}. Starting {workload} on unit {pioneer}"
            ),
            decision,
        })
    }

    pub fn set_pause_policy(&self, raw: &str) -> RolloutResult<Decision> {
        self.controller.set_pause_policy(raw)
    }

    pub fn change_target(&self, target: &VersionPin) -> RolloutResult<Decision> {
        self.controller.change_target(target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::checks::{PrecheckFailed, Workload};
    use crate::ledger::VersionLedger;
    use refresh_core::{BlockReason, PlatformVariant, RolloutState};
    use refresh_state::{ApplicationRecord, StateStore};

    const APP: &str = "postgresql";

    struct Scripted {
        compatible: bool,
        precheck: Option<&'static str>,
    }

    impl Workload for Scripted {
        fn name(&self) -> &str {
            "PostgreSQL"
        }

        fn is_compatible(&self, _from: &VersionPin, _to: &VersionPin) -> bool {
            self.compatible
        }

        fn pre_upgrade_checks_after_first_unit(&self) -> Result<(), PrecheckFailed> {
            match self.precheck.and_then(PrecheckFailed::new) {
                Some(failed) => Err(failed),
                None => Ok(()),
            }
        }
    }

    fn v1() -> VersionPin {
        VersionPin::new("14/1.12.0", "sha256:aa", "14.11")
    }

    fn v2() -> VersionPin {
        VersionPin::new("14/1.13.0", "sha256:bb", "14.12")
    }

    fn gateway(
        variant: PlatformVariant,
        workload: Scripted,
    ) -> (StateStore, VersionLedger, ActionGateway) {
        let store = StateStore::open_in_memory().unwrap();
        let mut record = ApplicationRecord::new(APP, variant);
        record.target = Some(v1());
        record.original = Some(v1());
        record.workload_name = "PostgreSQL".to_string();
        record.resource_name = Some("postgresql-image".to_string());
        store.put_app(&record).unwrap();
        let ledger = VersionLedger::new(store.clone(), APP);
        for ordinal in 0..3 {
            ledger.register_unit(ordinal, None).unwrap();
        }
        let controller = RolloutController::new(store.clone(), APP, Arc::new(workload));
        (store, ledger, ActionGateway::new(controller))
    }

    fn skip(compatibility: bool, pre_upgrade: bool) -> GateOverrides {
        GateOverrides {
            compatibility,
            pre_upgrade,
            ..GateOverrides::default()
        }
    }

    fn passing() -> Scripted {
        Scripted {
            compatible: true,
            precheck: None,
        }
    }

    fn upgrade_healthy(store: &StateStore, ledger: &VersionLedger, ordinal: Ordinal) {
        let pin = v2();
        ledger
            .record_version_observed(ordinal, &pin.code, &pin.workload)
            .unwrap();
        store
            .update_unit(APP, ordinal, |u| {
                u.healthy = true;
                u.health_checked = true;
            })
            .unwrap();
    }

    #[test]
    fn pre_check_reports_rollback_command() {
        let (_, _, gateway) = gateway(PlatformVariant::Partition, passing());
        let report = gateway.request_pre_check(0).unwrap();
        assert_eq!(
            report.rollback_command,
            "refresh postgresql --revision 14/1.12.0 --resource postgresql-image=sha256:aa"
        );
        assert!(report.message.contains(&report.rollback_command));
    }

    #[test]
    fn pre_check_rejections() {
        let (_, _, gateway) = gateway(
            PlatformVariant::PerUnit,
            Scripted {
                compatible: true,
                precheck: Some("Backup in progress"),
            },
        );
        assert!(matches!(
            gateway.request_pre_check(2),
            Err(ActionError::WrongActor { .. })
        ));
        match gateway.request_pre_check(0) {
            Err(ActionError::CheckFailed { reason, .. }) => {
                assert_eq!(reason, "Pre-upgrade check failed: Backup in progress")
            }
            other => panic!("unexpected {other:?}"),
        }

        gateway.change_target(&v2()).unwrap();
        assert!(matches!(
            gateway.request_pre_check(0),
            Err(ActionError::AlreadyUpgrading)
        ));
    }

    #[test]
    fn force_start_requires_an_override() {
        let (_, _, gateway) = gateway(PlatformVariant::Partition, passing());
        // Before any session, and after one exists.
        assert!(matches!(
            gateway.force_start(2, GateOverrides::default()),
            Err(ActionError::NoOverrideSelected)
        ));
        gateway.change_target(&v2()).unwrap();
        assert!(matches!(
            gateway.force_start(1, GateOverrides::default()),
            Err(ActionError::NoOverrideSelected)
        ));
    }

    #[test]
    fn force_start_validates_session_and_actor() {
        let (_, _, gateway) = gateway(PlatformVariant::Partition, passing());
        assert!(matches!(
            gateway.force_start(2, skip(true, false)),
            Err(ActionError::NoUpgradeInProgress)
        ));
        gateway.change_target(&v2()).unwrap();
        assert!(matches!(
            gateway.force_start(0, skip(true, false)),
            Err(ActionError::WrongActor { .. })
        ));
    }

    #[test]
    fn force_start_rerun_failure_changes_nothing() {
        let (store, _, gateway) = gateway(
            PlatformVariant::PerUnit,
            Scripted {
                compatible: false,
                precheck: Some("Backup in progress"),
            },
        );
        gateway.change_target(&v2()).unwrap();
        let before = store.get_session(APP).unwrap();

        match gateway.force_start(2, skip(true, false)) {
            Err(ActionError::CheckFailed {
                reason,
                rollback_command,
            }) => {
                assert_eq!(reason, "Pre-upgrade check failed: Backup in progress");
                assert_eq!(rollback_command, "refresh postgresql --revision 14/1.12.0");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(store.get_session(APP).unwrap(), before);
    }

    #[test]
    fn force_start_releases_pioneer() {
        let (store, _, gateway) = gateway(
            PlatformVariant::PerUnit,
            Scripted {
                compatible: false,
                precheck: None,
            },
        );
        let decision = gateway.change_target(&v2()).unwrap();
        assert_eq!(
            decision.state,
            RolloutState::Blocked {
                reason: BlockReason::Incompatible
            }
        );

        let outcome = gateway.force_start(2, skip(true, false)).unwrap();
        assert_eq!(outcome.ordinal, 2);
        assert_eq!(
            outcome.message,
            "PostgreSQL upgraded on unit 2. Starting PostgreSQL on unit 2"
        );
        assert_eq!(outcome.decision.state, RolloutState::RollingOut { next: 2 });
        let session = store.get_session(APP).unwrap().unwrap();
        assert!(session.first_unit_forced);
        assert!(session.checks_run);

        assert!(matches!(
            gateway.force_start(2, skip(true, true)),
            Err(ActionError::AlreadyStarted)
        ));
    }

    /// Partition rollout whose pioneer came up with an unpinned workload.
    fn mismatched_pioneer() -> (StateStore, VersionLedger, ActionGateway) {
        let (store, ledger, gateway) = gateway(PlatformVariant::Partition, passing());
        gateway.change_target(&v2()).unwrap();
        ledger
            .record_version_observed(2, "14/1.13.0", "sha256:ff")
            .unwrap();
        let decision = gateway.controller().reconcile().unwrap();
        assert_eq!(
            decision.state,
            RolloutState::Blocked {
                reason: BlockReason::WorkloadMismatch
            }
        );
        (store, ledger, gateway)
    }

    #[test]
    fn workload_mismatch_needs_its_own_override() {
        let (store, ledger, gateway) = mismatched_pioneer();
        let session = store.get_session(APP).unwrap().unwrap();
        assert!(session.workload_pin.as_ref().is_some_and(|r| !r.passed));
        // Later gates are not attempted.
        assert!(session.compatibility.is_none());

        match gateway.force_start(2, skip(true, true)) {
            Err(ActionError::CheckFailed { reason, .. }) => assert!(reason.contains("sha256:ff")),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(store.get_session(APP).unwrap().unwrap(), session);

        // Redeployed with the pinned workload: the block clears by itself.
        ledger
            .record_version_observed(2, "14/1.13.0", "sha256:bb")
            .unwrap();
        let decision = gateway.controller().reconcile().unwrap();
        assert_eq!(decision.state, RolloutState::RollingOut { next: 2 });
        let session = store.get_session(APP).unwrap().unwrap();
        assert!(session.checks_run);
        assert!(!session.first_unit_forced);
        assert!(session.workload_pin.is_some_and(|r| r.passed));
    }

    #[test]
    fn force_start_accepts_installed_workload() {
        let (store, ledger, gateway) = mismatched_pioneer();
        let overrides = GateOverrides {
            workload_pin: true,
            ..GateOverrides::default()
        };

        let outcome = gateway.force_start(2, overrides).unwrap();
        assert_eq!(outcome.ordinal, 2);
        assert_eq!(outcome.decision.state, RolloutState::RollingOut { next: 2 });

        let record = ledger.record().unwrap();
        assert_eq!(record.target.unwrap().workload, "sha256:ff");
        let session = store.get_session(APP).unwrap().unwrap();
        assert_eq!(session.target.workload, "sha256:ff");
        assert_eq!(session.original, v1());
        assert!(session.first_unit_forced);
        // Compatibility and pre-upgrade still ran.
        assert!(session.compatibility.is_some_and(|r| r.passed));
        assert!(session.pre_upgrade.is_some_and(|r| r.passed));

        let units = ledger.units().unwrap();
        assert!(units[2].upgraded);
        assert!(!units[1].upgraded && !units[0].upgraded);
    }

    #[test]
    fn resume_error_order() {
        let (store, ledger, gateway) = gateway(PlatformVariant::Partition, passing());
        assert!(matches!(
            gateway.resume(0, false),
            Err(ActionError::NoUpgradeInProgress)
        ));

        gateway.change_target(&v2()).unwrap();
        assert!(matches!(
            gateway.resume(1, false),
            Err(ActionError::WrongActor { .. })
        ));
        // Checks have not run yet.
        assert!(matches!(
            gateway.resume(0, false),
            Err(ActionError::UnitUnhealthy(2))
        ));
        assert!(matches!(
            gateway.resume(0, true),
            Err(ActionError::ForceStartRequired { pioneer: 2 })
        ));

        upgrade_healthy(&store, &ledger, 2);
        let decision = gateway.controller().reconcile().unwrap();
        assert!(matches!(decision.state, RolloutState::Paused { .. }));

        gateway.set_pause_policy("none").unwrap();
        // The less restrictive policy released unit 1 already.
        assert!(matches!(
            gateway.resume(0, false),
            Err(ActionError::PolicyNotApplicable)
        ));
        assert!(matches!(
            gateway.resume(0, true),
            Err(ActionError::NothingToResume { ordinal: 1 })
        ));
    }

    #[test]
    fn resume_refuses_unhealthy_unless_ignored() {
        let (store, ledger, gateway) = gateway(PlatformVariant::Partition, passing());
        gateway.set_pause_policy("all").unwrap();
        gateway.change_target(&v2()).unwrap();
        let pin = v2();
        ledger
            .record_version_observed(2, &pin.code, &pin.workload)
            .unwrap();
        store
            .update_unit(APP, 2, |u| {
                u.healthy = false;
                u.health_checked = true;
            })
            .unwrap();
        let decision = gateway.controller().reconcile().unwrap();
        assert_eq!(
            decision.state,
            RolloutState::Blocked {
                reason: BlockReason::Unhealthy { ordinal: 2 }
            }
        );

        assert!(matches!(
            gateway.resume(0, false),
            Err(ActionError::UnitUnhealthy(2))
        ));
        let outcome = gateway.resume(0, true).unwrap();
        assert_eq!(outcome.ordinal, 1);
        assert_eq!(outcome.message, "Unit 1 is upgrading next");
        assert_eq!(outcome.decision.state, RolloutState::RollingOut { next: 1 });
        assert_eq!(outcome.decision.released_through, Some(1));
    }

    #[test]
    fn per_unit_resume_runs_on_next_unit() {
        let (store, ledger, gateway) = gateway(PlatformVariant::PerUnit, passing());
        gateway.change_target(&v2()).unwrap();
        upgrade_healthy(&store, &ledger, 2);
        let decision = gateway.controller().reconcile().unwrap();
        assert!(matches!(decision.state, RolloutState::Paused { .. }));

        assert!(matches!(
            gateway.resume(0, false),
            Err(ActionError::WrongActor { .. })
        ));
        let outcome = gateway.resume(1, false).unwrap();
        assert_eq!(outcome.message, "Upgrade resumed. Unit 1 is upgrading next");
        assert_eq!(
            outcome.decision.instruction,
            crate::strategy::ReleaseInstruction::AllowFrom { ordinal: 1 }
        );
    }
}
