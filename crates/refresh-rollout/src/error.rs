//! Error types for rollout operations.

use refresh_core::Ordinal;
use refresh_state::StateError;
use thiserror::Error;

pub type RolloutResult<T> = Result<T, RolloutError>;

/// Invalid input from the platform. Fatal: it indicates a platform bug.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("application {0} is not registered")]
    UnknownApplication(String),

    #[error("unit {app}/{ordinal} is not registered")]
    UnknownUnit { app: String, ordinal: Ordinal },

    #[error("state error: {0}")]
    State(#[from] StateError),
}

#[derive(Debug, Error)]
pub enum RolloutError {
    #[error("application {0} is not registered")]
    UnknownApplication(String),

    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("state error: {0}")]
    State(#[from] StateError),

    /// Units diverged from the target but nothing records what they ran before.
    #[error("application {0} has no original versions to roll back to")]
    MissingOriginalVersions(String),

    #[error("session for {app} kept changing; gave up after {attempts} attempts")]
    Contended { app: String, attempts: u32 },
}

/// Operator action rejected. Nothing was changed.
#[derive(Debug, Error)]
pub enum ActionError {
    #[error("must run {action} on {expected}")]
    WrongActor { action: &'static str, expected: String },

    #[error("upgrade already in progress")]
    AlreadyUpgrading,

    #[error("no upgrade in progress")]
    NoUpgradeInProgress,

    #[error("`pause_after_unit_upgrade` config is set to `none`. This action is not applicable.")]
    PolicyNotApplicable,

    #[error("unit {0} is unhealthy. Upgrade will not resume.")]
    UnitUnhealthy(Ordinal),

    #[error(
        "must run with at least one of `ignore_workload_pin_check`, `ignore_compatibility_checks` or `ignore_pre_upgrade_checks` set to true"
    )]
    NoOverrideSelected,

    #[error("gate checks have not passed on unit {pioneer}; run force-upgrade-start on unit {pioneer}")]
    ForceStartRequired { pioneer: Ordinal },

    #[error("upgrade already started")]
    AlreadyStarted,

    #[error("unit {ordinal} is already upgrading")]
    NothingToResume { ordinal: Ordinal },

    #[error("{reason}. Rollback by running `{rollback_command}`")]
    CheckFailed {
        reason: String,
        rollback_command: String,
    },

    #[error(transparent)]
    Rollout(#[from] RolloutError),
}

impl From<StateError> for ActionError {
    fn from(e: StateError) -> Self {
        ActionError::Rollout(RolloutError::State(e))
    }
}
