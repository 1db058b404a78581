//! End-to-end rollouts against an in-memory store, with a simulated
//! platform that upgrades whatever it is allowed to.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use refresh_core::{BlockReason, Ordinal, PlatformVariant, RolloutState, VersionPin};
use refresh_health::{HealthAggregator, ProbeResult, StaticProbe};
use refresh_rollout::checks::default_compatibility;
use refresh_rollout::{
    ActionError, ActionGateway, Decision, GateOverrides, PrecheckFailed, ReleaseInstruction,
    ReleaseOrder, RolloutController, VersionLedger, Workload,
};
use refresh_state::{ApplicationRecord, StateStore};

const APP: &str = "postgresql";

const SKIP_COMPATIBILITY: GateOverrides = GateOverrides {
    workload_pin: false,
    compatibility: true,
    pre_upgrade: false,
};

fn v1() -> VersionPin {
    VersionPin::new("14/1.12.0", "sha256:aa", "14.11")
}

fn v2() -> VersionPin {
    VersionPin::new("14/1.13.0", "sha256:bb", "14.12")
}

/// Counts pre-upgrade check invocations; compatibility can be switched off.
struct Counting {
    compatible: AtomicBool,
    pre_upgrade_calls: AtomicUsize,
}

impl Counting {
    fn new(compatible: bool) -> Arc<Self> {
        Arc::new(Self {
            compatible: AtomicBool::new(compatible),
            pre_upgrade_calls: AtomicUsize::new(0),
        })
    }

    fn calls(&self) -> usize {
        self.pre_upgrade_calls.load(Ordering::SeqCst)
    }
}

impl Workload for Counting {
    fn name(&self) -> &str {
        "PostgreSQL"
    }

    fn is_compatible(&self, from: &VersionPin, to: &VersionPin) -> bool {
        self.compatible.load(Ordering::SeqCst) && default_compatibility(from, to)
    }

    fn pre_upgrade_checks_after_first_unit(&self) -> Result<(), PrecheckFailed> {
        self.pre_upgrade_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct Fleet {
    store: StateStore,
    ledger: VersionLedger,
    health: HealthAggregator,
    probe: StaticProbe,
    gateway: ActionGateway,
    /// Ordinals in the order the platform upgraded them.
    upgraded: Vec<Ordinal>,
}

impl Fleet {
    fn new(variant: PlatformVariant, size: u32, policy: &str, workload: Arc<Counting>) -> Self {
        let store = StateStore::open_in_memory().unwrap();
        let mut record = ApplicationRecord::new(APP, variant);
        record.target = Some(v1());
        record.original = Some(v1());
        record.pause_policy_raw = policy.to_string();
        record.workload_name = "PostgreSQL".to_string();
        record.resource_name = Some("postgresql-image".to_string());
        store.put_app(&record).unwrap();

        let ledger = VersionLedger::new(store.clone(), APP);
        for ordinal in 0..size {
            ledger.register_unit(ordinal, None).unwrap();
        }
        let probe = StaticProbe::new();
        probe.set_all(0..size, ProbeResult::Healthy);
        let health = HealthAggregator::new(store.clone(), APP, Arc::new(probe.clone()));
        let controller = RolloutController::new(store.clone(), APP, workload);

        Self {
            store,
            ledger,
            health,
            probe,
            gateway: ActionGateway::new(controller),
            upgraded: Vec::new(),
        }
    }

    fn controller(&self) -> &RolloutController {
        self.gateway.controller()
    }

    fn has_session(&self) -> bool {
        self.store.get_session(APP).unwrap().is_some()
    }

    fn diverged(&self) -> bool {
        self.ledger.units().unwrap().iter().any(|u| !u.upgraded)
    }

    /// The platform upgrades every released unit, then health is probed
    /// and the controller reconciles.
    async fn step(&mut self) -> Decision {
        let target = self.ledger.record().unwrap().target.unwrap();
        let mut units = self.ledger.units().unwrap();
        units.sort_by(|a, b| b.ordinal.cmp(&a.ordinal));
        for unit in units {
            let permission = self.controller().permission(unit.ordinal).unwrap();
            if !unit.upgraded && permission.may_upgrade {
                self.ledger
                    .record_version_observed(unit.ordinal, &target.code, &target.workload)
                    .unwrap();
                self.upgraded.push(unit.ordinal);
            }
        }
        self.health.refresh_all().await.unwrap();
        self.controller().reconcile().unwrap()
    }

    fn pioneer(&self) -> Option<Ordinal> {
        self.controller().load().unwrap().pioneer()
    }

    /// Scale up: the platform installs the new unit on the declared target.
    fn add_unit(&self, ordinal: Ordinal) {
        self.ledger.register_unit(ordinal, None).unwrap();
        self.probe.set(ordinal, ProbeResult::Healthy);
    }

    /// Unit that must run `resume-upgrade` for the variant.
    fn resume_actor(&self) -> Ordinal {
        let ctx = self.controller().load().unwrap();
        let (_, next) = ctx.next_outdated().unwrap();
        ctx.strategy().resume_actor(ctx.record.coordinator, next)
    }

    /// Step until the session closes, resuming on every pause.
    async fn drive(&mut self) -> usize {
        let mut pauses = 0;
        for _ in 0..50 {
            let decision = self.step().await;
            assert_eq!(self.has_session(), self.diverged());
            match decision.state {
                RolloutState::Complete | RolloutState::Idle => return pauses,
                RolloutState::Paused { .. } => {
                    pauses += 1;
                    let actor = self.resume_actor();
                    self.gateway.resume(actor, false).unwrap();
                }
                _ => {}
            }
        }
        panic!("rollout did not finish");
    }
}

#[tokio::test]
async fn release_order_is_descending() {
    for variant in [PlatformVariant::Partition, PlatformVariant::PerUnit] {
        for size in 1..=5 {
            let mut fleet = Fleet::new(variant, size, "none", Counting::new(true));
            fleet.controller().change_target(&v2()).unwrap();
            fleet.drive().await;

            let expected: Vec<Ordinal> = (0..size).rev().collect();
            assert_eq!(fleet.upgraded, expected, "{variant} fleet of {size}");
            assert!(!fleet.has_session());
        }
    }
}

#[tokio::test]
async fn policy_all_pauses_after_every_unit() {
    for size in 1..=5 {
        let mut fleet = Fleet::new(PlatformVariant::Partition, size, "all", Counting::new(true));
        fleet.controller().change_target(&v2()).unwrap();
        // The last unit closes the session instead of pausing.
        assert_eq!(fleet.drive().await, size as usize - 1, "fleet of {size}");
    }
}

#[tokio::test]
async fn policy_first_pauses_once() {
    for size in 2..=5 {
        let mut fleet =
            Fleet::new(PlatformVariant::Partition, size, "first", Counting::new(true));
        fleet.controller().change_target(&v2()).unwrap();
        assert_eq!(fleet.drive().await, 1, "fleet of {size}");
    }
}

#[tokio::test]
async fn rollback_never_runs_pre_upgrade_checks() {
    let workload = Counting::new(true);
    let mut fleet = Fleet::new(PlatformVariant::Partition, 3, "first", workload.clone());
    fleet.controller().change_target(&v2()).unwrap();
    let decision = fleet.step().await;
    assert!(matches!(decision.state, RolloutState::Paused { .. }));
    assert_eq!(workload.calls(), 1);

    fleet.controller().change_target(&v1()).unwrap();
    let session = fleet.store.get_session(APP).unwrap().unwrap();
    assert!(session.is_rollback());
    assert!(!session.pre_upgrade_invoked);

    fleet.drive().await;
    assert_eq!(workload.calls(), 1);
    assert!(!fleet.has_session());
    assert_eq!(fleet.ledger.record().unwrap().original, Some(v1()));
    // Only the pioneer had moved, so only the pioneer moved back.
    assert_eq!(fleet.upgraded, vec![2, 2]);
}

#[tokio::test]
async fn force_start_without_override_always_fails() {
    let mut fleet = Fleet::new(PlatformVariant::Partition, 3, "first", Counting::new(true));
    let no_override = |fleet: &Fleet| {
        for actor in 0..3 {
            assert!(matches!(
                fleet.gateway.force_start(actor, GateOverrides::default()),
                Err(ActionError::NoOverrideSelected)
            ));
        }
    };

    no_override(&fleet);
    fleet.controller().change_target(&v2()).unwrap();
    no_override(&fleet);
    fleet.step().await;
    no_override(&fleet);
    fleet.drive().await;
    no_override(&fleet);
}

#[tokio::test]
async fn session_exists_iff_units_diverge() {
    let mut fleet = Fleet::new(PlatformVariant::PerUnit, 4, "first", Counting::new(true));
    assert!(!fleet.has_session());
    fleet.controller().change_target(&v2()).unwrap();
    assert!(fleet.has_session());
    // drive() asserts the invariant after every step.
    fleet.drive().await;
    assert!(!fleet.has_session());
    assert!(!fleet.diverged());
}

#[tokio::test]
async fn reconcile_with_unchanged_inputs_is_stable() {
    let mut fleet = Fleet::new(PlatformVariant::Partition, 3, "first", Counting::new(true));
    fleet.controller().change_target(&v2()).unwrap();
    let paused = fleet.step().await;
    let audit = fleet.store.list_audit(APP).unwrap().len();

    for _ in 0..3 {
        assert_eq!(fleet.controller().reconcile().unwrap(), paused);
        assert_eq!(fleet.controller().evaluate().unwrap(), paused);
    }
    assert_eq!(fleet.store.list_audit(APP).unwrap().len(), audit);
}

#[tokio::test]
async fn three_units_policy_first() {
    let mut fleet = Fleet::new(PlatformVariant::Partition, 3, "first", Counting::new(true));
    let decision = fleet.controller().change_target(&v2()).unwrap();
    assert_eq!(decision.state, RolloutState::AwaitingFirstUnitChecks);
    assert!(fleet.controller().permission(2).unwrap().may_upgrade);
    assert!(!fleet.controller().permission(1).unwrap().may_upgrade);

    let decision = fleet.step().await;
    assert!(matches!(decision.state, RolloutState::Paused { .. }));
    assert_eq!(fleet.upgraded, vec![2]);
    let status = fleet.controller().status().unwrap();
    assert!(
        status
            .status
            .unwrap()
            .message
            .starts_with("Upgrading. Check units >=2 are healthy & run `resume-upgrade` on unit 0.")
    );

    let outcome = fleet.gateway.resume(0, false).unwrap();
    assert_eq!(outcome.ordinal, 1);
    assert_eq!(outcome.message, "Upgrade resumed. Unit 1 is upgrading next");

    let decision = fleet.step().await;
    assert_eq!(decision.state, RolloutState::RollingOut { next: 0 });
    let decision = fleet.step().await;
    assert_eq!(decision.state, RolloutState::Complete);
    assert_eq!(fleet.upgraded, vec![2, 1, 0]);
    assert!(!fleet.has_session());
    assert_eq!(fleet.controller().evaluate().unwrap().state, RolloutState::Idle);
}

#[tokio::test]
async fn incompatible_pioneer_needs_forced_start() {
    let workload = Counting::new(false);
    let mut fleet = Fleet::new(PlatformVariant::PerUnit, 3, "first", workload);
    let decision = fleet.controller().change_target(&v2()).unwrap();
    assert_eq!(
        decision.state,
        RolloutState::Blocked {
            reason: BlockReason::Incompatible
        }
    );
    assert_eq!(decision.instruction, ReleaseInstruction::HoldAll);

    assert!(matches!(
        fleet.gateway.resume(2, false),
        Err(ActionError::UnitUnhealthy(2))
    ));
    assert!(matches!(
        fleet.gateway.resume(2, true),
        Err(ActionError::ForceStartRequired { pioneer: 2 })
    ));
    // Nothing moved.
    assert_eq!(fleet.step().await.state, decision.state);
    assert!(fleet.upgraded.is_empty());

    let outcome = fleet.gateway.force_start(2, SKIP_COMPATIBILITY).unwrap();
    assert_eq!(outcome.decision.state, RolloutState::RollingOut { next: 2 });
    assert_eq!(
        outcome.decision.instruction,
        ReleaseInstruction::AllowFrom { ordinal: 2 }
    );
    let decision = fleet.step().await;
    assert!(matches!(decision.state, RolloutState::Paused { .. }));
    assert_eq!(fleet.upgraded, vec![2]);
}

#[tokio::test]
async fn policy_tightened_mid_upgrade_pauses_before_next_unit() {
    let mut fleet = Fleet::new(PlatformVariant::Partition, 4, "none", Counting::new(true));
    fleet.controller().change_target(&v2()).unwrap();
    let decision = fleet.step().await;
    assert_eq!(decision.state, RolloutState::RollingOut { next: 2 });

    // Unit 2 is released; it finishes, then the rollout stops before unit 1.
    fleet.gateway.set_pause_policy("all").unwrap();
    let decision = fleet.step().await;
    assert!(matches!(decision.state, RolloutState::Paused { .. }));
    assert_eq!(fleet.upgraded, vec![3, 2]);
    assert!(!fleet.controller().permission(1).unwrap().may_upgrade);
}

#[tokio::test]
async fn unhealthy_unit_blocks_until_overridden() {
    let mut fleet = Fleet::new(PlatformVariant::Partition, 3, "none", Counting::new(true));
    fleet.probe.set(2, ProbeResult::Unhealthy);
    fleet.controller().change_target(&v2()).unwrap();

    let decision = fleet.step().await;
    assert_eq!(
        decision.state,
        RolloutState::Blocked {
            reason: BlockReason::Unhealthy { ordinal: 2 }
        }
    );
    // Policy `none`: only the health override applies.
    assert!(matches!(
        fleet.gateway.resume(0, false),
        Err(ActionError::PolicyNotApplicable)
    ));
    let outcome = fleet.gateway.resume(0, true).unwrap();
    assert_eq!(outcome.ordinal, 1);

    fleet.probe.set(2, ProbeResult::Healthy);
    fleet.drive().await;
    assert_eq!(fleet.upgraded, vec![2, 1, 0]);
}

#[tokio::test]
async fn scale_up_before_checks_moves_the_pioneer() {
    let mut fleet = Fleet::new(PlatformVariant::PerUnit, 3, "first", Counting::new(false));
    let decision = fleet.controller().change_target(&v2()).unwrap();
    let blocked = RolloutState::Blocked {
        reason: BlockReason::Incompatible,
    };
    assert_eq!(decision.state, blocked);
    assert_eq!(fleet.pioneer(), Some(2));

    fleet.add_unit(3);
    let decision = fleet.controller().reconcile().unwrap();
    assert_eq!(decision.state, blocked);
    assert_eq!(fleet.pioneer(), Some(3));
    assert!(fleet.has_session());
    assert_eq!(fleet.has_session(), fleet.diverged());

    // The override now belongs to the new highest ordinal.
    match fleet.gateway.force_start(2, SKIP_COMPATIBILITY) {
        Err(ActionError::WrongActor { expected, .. }) => assert_eq!(expected, "unit 3"),
        other => panic!("unexpected {other:?}"),
    }
    assert!(matches!(
        fleet.gateway.resume(2, true),
        Err(ActionError::ForceStartRequired { pioneer: 3 })
    ));

    let outcome = fleet.gateway.force_start(3, SKIP_COMPATIBILITY).unwrap();
    assert_eq!(outcome.ordinal, 3);
    assert!(fleet.controller().permission(3).unwrap().workload_allowed_to_start);

    // Unit 3 counts as the first upgraded unit, so `first` pauses before 2.
    let decision = fleet.step().await;
    assert!(matches!(decision.state, RolloutState::Paused { .. }));
    assert!(fleet.upgraded.is_empty());
    assert_eq!(fleet.has_session(), fleet.diverged());

    assert_eq!(fleet.drive().await, 1);
    assert_eq!(fleet.upgraded, vec![2, 1, 0]);
    assert!(!fleet.has_session());
}

#[tokio::test]
async fn scale_up_on_partition_runs_checks_on_new_pioneer() {
    let workload = Counting::new(true);
    let mut fleet = Fleet::new(PlatformVariant::Partition, 3, "none", workload.clone());
    let decision = fleet.controller().change_target(&v2()).unwrap();
    assert_eq!(decision.state, RolloutState::AwaitingFirstUnitChecks);
    assert_eq!(workload.calls(), 0);

    // The new unit already runs the target, so its arrival is the
    // pioneer's upgrade.
    fleet.add_unit(3);
    let decision = fleet.controller().reconcile().unwrap();
    assert_eq!(fleet.pioneer(), Some(3));
    assert_eq!(workload.calls(), 1);
    assert_eq!(decision.state, RolloutState::RollingOut { next: 2 });
    assert_eq!(fleet.has_session(), fleet.diverged());

    assert!(matches!(
        fleet.gateway.force_start(2, SKIP_COMPATIBILITY),
        Err(ActionError::WrongActor { .. })
    ));
    assert!(matches!(
        fleet.gateway.force_start(3, SKIP_COMPATIBILITY),
        Err(ActionError::AlreadyStarted)
    ));

    fleet.drive().await;
    assert_eq!(fleet.upgraded, vec![2, 1, 0]);
    assert!(!fleet.has_session());
    assert!(!fleet.diverged());
}
