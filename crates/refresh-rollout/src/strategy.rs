//! Release strategies: how each platform variant lets units upgrade.
//!
//! Both variants release units strictly top-down by ordinal. They differ
//! in how a release is expressed, when the gate checks run, and which
//! unit an operator resumes from.

use refresh_core::{Ordinal, PlatformVariant};
use refresh_state::UnitState;
use serde::{Deserialize, Serialize};

/// When the gate checks run relative to the pioneer's upgrade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckTiming {
    /// Before the pioneer is released.
    BeforeAnyUnit,
    /// After the pioneer upgraded, before its workload starts.
    AfterFirstUnit,
}

/// What the platform is told.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ReleaseInstruction {
    /// Units with ordinal >= `partition` may upgrade.
    SetPartition { partition: Ordinal },
    /// Units with ordinal >= `ordinal` may proceed; the rest hold.
    AllowFrom { ordinal: Ordinal },
    /// No unit may upgrade.
    HoldAll,
}

pub trait ReleaseOrder: Send + Sync {
    fn variant(&self) -> PlatformVariant;

    /// Ordinals in release order: highest first.
    fn order(&self, units: &[UnitState]) -> Vec<Ordinal> {
        let mut ordinals: Vec<Ordinal> = units.iter().map(|u| u.ordinal).collect();
        ordinals.sort_unstable_by(|a, b| b.cmp(a));
        ordinals.dedup();
        ordinals
    }

    fn check_timing(&self) -> CheckTiming;

    /// Release when a session is created.
    fn initial_release(&self, order: &[Ordinal]) -> Option<Ordinal>;

    /// Release when the target changes mid-session.
    fn rearm_release(&self, current: Option<Ordinal>, order: &[Ordinal]) -> Option<Ordinal>;

    /// Instruction for the platform given the lowest released ordinal.
    /// `in_progress` is false when no session exists.
    fn instruction(
        &self,
        in_progress: bool,
        released_through: Option<Ordinal>,
        order: &[Ordinal],
    ) -> ReleaseInstruction;

    /// Unit that must invoke `resume-upgrade`.
    fn resume_actor(&self, coordinator: Ordinal, next: Ordinal) -> Ordinal;

    /// Human description of `resume_actor`, for error messages.
    fn resume_actor_label(&self) -> &'static str;
}

/// Ordinal partition (Kubernetes StatefulSet style).
///
/// The partition can only release from the top down, and is only ever
/// lowered within a session: lowering then quickly raising it can leave
/// an upgrading unit unable to start.
#[derive(Debug, Clone, Copy, Default)]
pub struct PartitionRelease;

impl ReleaseOrder for PartitionRelease {
    fn variant(&self) -> PlatformVariant {
        PlatformVariant::Partition
    }

    fn check_timing(&self) -> CheckTiming {
        CheckTiming::AfterFirstUnit
    }

    fn initial_release(&self, order: &[Ordinal]) -> Option<Ordinal> {
        order.first().copied()
    }

    fn rearm_release(&self, current: Option<Ordinal>, order: &[Ordinal]) -> Option<Ordinal> {
        // Never raise. Units already released follow the new target.
        current.or_else(|| self.initial_release(order))
    }

    fn instruction(
        &self,
        in_progress: bool,
        released_through: Option<Ordinal>,
        order: &[Ordinal],
    ) -> ReleaseInstruction {
        if !in_progress {
            return ReleaseInstruction::SetPartition { partition: 0 };
        }
        // The partition never exceeds the highest ordinal, otherwise a
        // target change would not reach any unit.
        let highest = order.first().copied().unwrap_or(0);
        ReleaseInstruction::SetPartition {
            partition: released_through.unwrap_or(highest).min(highest),
        }
    }

    fn resume_actor(&self, coordinator: Ordinal, _next: Ordinal) -> Ordinal {
        coordinator
    }

    fn resume_actor_label(&self) -> &'static str {
        "the coordinating unit"
    }
}

/// Each unit upgrades itself once told to proceed (machine style).
#[derive(Debug, Clone, Copy, Default)]
pub struct PerUnitRelease;

impl ReleaseOrder for PerUnitRelease {
    fn variant(&self) -> PlatformVariant {
        PlatformVariant::PerUnit
    }

    fn check_timing(&self) -> CheckTiming {
        CheckTiming::BeforeAnyUnit
    }

    fn initial_release(&self, _order: &[Ordinal]) -> Option<Ordinal> {
        None
    }

    fn rearm_release(&self, _current: Option<Ordinal>, _order: &[Ordinal]) -> Option<Ordinal> {
        None
    }

    fn instruction(
        &self,
        in_progress: bool,
        released_through: Option<Ordinal>,
        _order: &[Ordinal],
    ) -> ReleaseInstruction {
        match (in_progress, released_through) {
            (false, _) => ReleaseInstruction::AllowFrom { ordinal: 0 },
            (true, Some(ordinal)) => ReleaseInstruction::AllowFrom { ordinal },
            (true, None) => ReleaseInstruction::HoldAll,
        }
    }

    fn resume_actor(&self, _coordinator: Ordinal, next: Ordinal) -> Ordinal {
        // Each unit's agent can only advance itself.
        next
    }

    fn resume_actor_label(&self) -> &'static str {
        "the next unit to upgrade"
    }
}

/// Strategy for a platform variant.
pub fn for_variant(variant: PlatformVariant) -> &'static dyn ReleaseOrder {
    match variant {
        PlatformVariant::Partition => &PartitionRelease,
        PlatformVariant::PerUnit => &PerUnitRelease,
    }
}
