//! Version ledger: which versions each unit runs, and whether that is the
//! declared target.
//!
//! The ledger is the only writer of unit versions and of the `upgraded`
//! flag. Recording a changed version resets the unit's health verdict: a
//! unit must prove it is healthy again on every new version.

use refresh_core::{Ordinal, VersionPin};
use refresh_state::{ApplicationRecord, StateError, StateStore, UnitState, epoch_secs};
use tracing::{debug, info};

use crate::error::LedgerError;

pub type LedgerResult<T> = Result<T, LedgerError>;

#[derive(Clone)]
pub struct VersionLedger {
    store: StateStore,
    app: String,
}

impl VersionLedger {
    pub fn new(store: StateStore, app: &str) -> Self {
        Self {
            store,
            app: app.to_string(),
        }
    }

    pub fn record(&self) -> LedgerResult<ApplicationRecord> {
        self.store
            .get_app(&self.app)?
            .ok_or_else(|| LedgerError::UnknownApplication(self.app.clone()))
    }

    /// Register a unit (initial install or scale up). Idempotent.
    ///
    /// Without reported versions the unit is assumed to run the declared
    /// target, which is what the platform installs on new units.
    pub fn register_unit(
        &self,
        ordinal: Ordinal,
        versions: Option<(&str, &str)>,
    ) -> LedgerResult<UnitState> {
        let record = self.record()?;
        if let Some(existing) = self.store.get_unit(&self.app, ordinal)? {
            return Ok(existing);
        }

        let mut unit = UnitState::new(&self.app, ordinal);
        match (versions, &record.target) {
            (Some((code, workload)), _) => {
                unit.code_version = code.to_string();
                unit.workload_version = workload.to_string();
            }
            (None, Some(target)) => {
                unit.code_version = target.code.clone();
                unit.workload_version = target.workload.clone();
            }
            (None, None) => {}
        }
        unit.upgraded = is_upgraded(&unit, record.target.as_ref());
        self.store.put_unit(&unit)?;
        info!(app = %self.app, ordinal, upgraded = unit.upgraded, "unit registered");
        Ok(unit)
    }

    /// Remove a permanently decommissioned unit. Returns true if it existed.
    pub fn decommission_unit(&self, ordinal: Ordinal) -> LedgerResult<bool> {
        let existed = self.store.delete_unit(&self.app, ordinal)?;
        if existed {
            info!(app = %self.app, ordinal, "unit decommissioned");
        }
        Ok(existed)
    }

    /// Lifecycle notification: `ordinal` now runs these versions.
    pub fn record_version_observed(
        &self,
        ordinal: Ordinal,
        code_version: &str,
        workload_version: &str,
    ) -> LedgerResult<UnitState> {
        let record = self.record()?;
        let (unit, changed) = self
            .store
            .update_unit(&self.app, ordinal, |unit| {
                let changed = unit.code_version != code_version
                    || unit.workload_version != workload_version;
                if changed {
                    unit.code_version = code_version.to_string();
                    unit.workload_version = workload_version.to_string();
                    unit.healthy = false;
                    unit.health_checked = false;
                    unit.updated_at = epoch_secs();
                }
                unit.upgraded = is_upgraded(unit, record.target.as_ref());
                changed
            })
            .map_err(|e| match e {
                StateError::UnknownUnit { .. } => LedgerError::UnknownUnit {
                    app: self.app.clone(),
                    ordinal,
                },
                other => other.into(),
            })?;

        if changed {
            info!(
                app = %self.app,
                ordinal,
                code = %code_version,
                workload = %workload_version,
                upgraded = unit.upgraded,
                "unit version changed"
            );
        } else {
            debug!(app = %self.app, ordinal, "unit version unchanged");
        }
        Ok(unit)
    }

    /// Units in ascending ordinal order.
    pub fn units(&self) -> LedgerResult<Vec<UnitState>> {
        Ok(self.store.list_units(&self.app)?)
    }
}

// The controller evaluates a snapshot of record and units and commits it
// with the session, so the fleet-wide queries work on loaded data.

/// Declare new target versions and recompute every unit's `upgraded`.
/// Returns false when `target` is already declared.
pub fn declare_target(
    record: &mut ApplicationRecord,
    units: &mut [UnitState],
    target: &VersionPin,
) -> bool {
    if record.target.as_ref() == Some(target) {
        return false;
    }
    record.target = Some(target.clone());
    record.updated_at = epoch_secs();
    for unit in units {
        unit.upgraded = unit.runs(target);
    }
    true
}

pub fn all_up_to_date(units: &[UnitState]) -> bool {
    units.iter().all(|u| u.upgraded)
}

/// Position in `order` and ordinal of the first unit that does not run
/// the target.
pub fn next_outdated(units: &[UnitState], order: &[Ordinal]) -> Option<(usize, Ordinal)> {
    order.iter().copied().enumerate().find(|&(_, ordinal)| {
        units
            .iter()
            .any(|u| u.ordinal == ordinal && !u.upgraded)
    })
}

/// With no declared target there is nothing to upgrade to.
fn is_upgraded(unit: &UnitState, target: Option<&VersionPin>) -> bool {
    target.is_none_or(|t| unit.runs(t))
}
