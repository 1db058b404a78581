//! Refresh rolling upgrades: one unit at a time, top ordinal first.
//!
//! This crate provides the upgrade rollout state machine for a fleet of
//! ordered, stateful units. A session exists while any unit runs versions
//! other than the declared target; the controller decides which unit may
//! upgrade next, gates the first unit on compatibility and pre-upgrade
//! checks, and pauses for the operator according to policy.
//!
//! # Components
//!
//! - **`ledger`**: Per-unit versions and whether each matches the target
//! - **`checks`**: Workload pin, compatibility and pre-upgrade gate checks
//! - **`strategy`**: Release order per platform variant (partition, per-unit)
//! - **`controller`**: Rollout state machine (derive, reconcile, commit)
//! - **`gateway`**: Operator actions (pre-check, resume, force start)
//! - **`status`**: Human-readable status lines and the rollback command
//!
//! # Flow
//!
//! ```text
//! platform event ──► VersionLedger ──► RolloutController::reconcile
//!                                         │  derive() (pure)
//!                                         │  CheckEngine (when due)
//!                                         ▼
//!                              StateStore::commit (compare-and-set)
//!                                         │
//!                                         ▼
//!                          ReleaseInstruction back to the platform
//!
//! operator action ──► ActionGateway ──► RolloutController::mutate
//! ```

pub mod checks;
pub mod controller;
pub mod error;
pub mod gateway;
pub mod ledger;
pub mod status;
pub mod strategy;

pub use checks::{CheckEngine, PrecheckFailed, Workload};
pub use controller::{
    Decision, Evaluation, INVALID_POLICY_WARNING, RolloutContext, RolloutController,
    UnitPermission, derive,
};
pub use error::{ActionError, LedgerError, RolloutError, RolloutResult};
pub use gateway::{ActionGateway, ActionOutcome, GateOverrides, PreCheckReport};
pub use ledger::VersionLedger;
pub use status::{StatusLevel, StatusLine, StatusReport, UnitStatus};
pub use strategy::{CheckTiming, PartitionRelease, PerUnitRelease, ReleaseInstruction, ReleaseOrder};
