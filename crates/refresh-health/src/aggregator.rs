//! Per-unit and application-wide health verdicts.

use std::sync::Arc;

use refresh_core::Ordinal;
use refresh_state::{StateError, StateStore};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::probe::{HealthProbe, ProbeResult};

pub type HealthResult<T> = Result<T, HealthError>;

#[derive(Debug, Error)]
pub enum HealthError {
    #[error("unit {app}/{ordinal} is not registered")]
    UnknownUnit { app: String, ordinal: Ordinal },

    #[error("state error: {0}")]
    State(#[from] StateError),
}

/// Computes health verdicts for one application's units.
#[derive(Clone)]
pub struct HealthAggregator {
    store: StateStore,
    app: String,
    probe: Arc<dyn HealthProbe>,
}

impl HealthAggregator {
    pub fn new(store: StateStore, app: &str, probe: Arc<dyn HealthProbe>) -> Self {
        Self {
            store,
            app: app.to_string(),
            probe,
        }
    }

    /// Probe one unit and store the verdict.
    ///
    /// If the unit's versions changed while the probe ran, the verdict
    /// belongs to the old version and is discarded.
    pub async fn refresh(&self, ordinal: Ordinal) -> HealthResult<bool> {
        let unit = self
            .store
            .get_unit(&self.app, ordinal)?
            .ok_or_else(|| self.unknown(ordinal))?;

        let result = self.probe.probe(&unit).await;

        let (stored, applied) = self
            .store
            .update_unit(&self.app, ordinal, |current| {
                if current.code_version != unit.code_version
                    || current.workload_version != unit.workload_version
                {
                    return false;
                }
                current.healthy = result.is_healthy();
                current.health_checked = true;
                true
            })
            .map_err(|e| match e {
                StateError::UnknownUnit { .. } => self.unknown(ordinal),
                other => other.into(),
            })?;

        if !applied {
            debug!(app = %self.app, ordinal, "unit changed version during probe; verdict discarded");
        } else if unit.healthy != stored.healthy {
            if stored.healthy {
                info!(app = %self.app, ordinal, "unit healthy");
            } else {
                warn!(app = %self.app, ordinal, ?result, "unit unhealthy");
            }
        }
        Ok(stored.healthy)
    }

    /// Store a verdict pushed by the workload itself.
    pub fn record(&self, ordinal: Ordinal, result: ProbeResult) -> HealthResult<bool> {
        let (stored, _) = self
            .store
            .update_unit(&self.app, ordinal, |unit| {
                unit.healthy = result.is_healthy();
                unit.health_checked = true;
            })
            .map_err(|e| match e {
                StateError::UnknownUnit { .. } => self.unknown(ordinal),
                other => other.into(),
            })?;
        debug!(app = %self.app, ordinal, healthy = stored.healthy, "health recorded");
        Ok(stored.healthy)
    }

    /// Probe every unit, then return [`Self::application_healthy`].
    pub async fn refresh_all(&self) -> HealthResult<bool> {
        let units = self.store.list_units(&self.app)?;
        for unit in units {
            match self.refresh(unit.ordinal).await {
                Ok(_) => {}
                // Decommissioned mid-sweep.
                Err(HealthError::UnknownUnit { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        self.application_healthy()
    }

    /// AND over the stored verdicts of every unit. An empty fleet is healthy.
    pub fn application_healthy(&self) -> HealthResult<bool> {
        Ok(self
            .store
            .list_units(&self.app)?
            .iter()
            .all(|unit| unit.healthy))
    }

    fn unknown(&self, ordinal: Ordinal) -> HealthError {
        HealthError::UnknownUnit {
            app: self.app.clone(),
            ordinal,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::{ProbeFuture, StaticProbe};
    use refresh_state::UnitState;

    fn seeded(ordinals: &[Ordinal]) -> StateStore {
        let store = StateStore::open_in_memory().unwrap();
        for &ordinal in ordinals {
            let mut unit = UnitState::new("postgresql", ordinal);
            unit.code_version = "14/1.12.0".to_string();
            unit.workload_version = "sha256:aa".to_string();
            store.put_unit(&unit).unwrap();
        }
        store
    }

    #[tokio::test]
    async fn refresh_stores_verdict() {
        let store = seeded(&[0, 1]);
        let probe = StaticProbe::new();
        probe.set(0, ProbeResult::Healthy);
        probe.set(1, ProbeResult::Unhealthy);
        let health = HealthAggregator::new(store.clone(), "postgresql", Arc::new(probe));

        assert!(health.refresh(0).await.unwrap());
        assert!(!health.refresh(1).await.unwrap());
        assert!(store.get_unit("postgresql", 0).unwrap().unwrap().healthy);
        assert!(!health.application_healthy().unwrap());
    }

    #[tokio::test]
    async fn failed_probe_counts_as_unhealthy() {
        let store = seeded(&[0]);
        let probe = StaticProbe::new();
        probe.set(0, ProbeResult::Failed);
        let health = HealthAggregator::new(store, "postgresql", Arc::new(probe));

        assert!(!health.refresh(0).await.unwrap());
    }

    #[tokio::test]
    async fn unknown_unit_is_rejected() {
        let store = seeded(&[0]);
        let health = HealthAggregator::new(store, "postgresql", Arc::new(StaticProbe::new()));
        assert!(matches!(
            health.refresh(9).await,
            Err(HealthError::UnknownUnit { ordinal: 9, .. })
        ));
        assert!(matches!(
            health.record(9, ProbeResult::Healthy),
            Err(HealthError::UnknownUnit { ordinal: 9, .. })
        ));
    }

    #[test]
    fn empty_fleet_is_healthy() {
        let store = StateStore::open_in_memory().unwrap();
        let health = HealthAggregator::new(store, "postgresql", Arc::new(StaticProbe::new()));
        assert!(health.application_healthy().unwrap());
    }

    /// Upgrades the unit while the probe is in flight.
    struct RacingProbe {
        store: StateStore,
    }

    impl HealthProbe for RacingProbe {
        fn probe<'a>(&'a self, unit: &'a UnitState) -> ProbeFuture<'a> {
            Box::pin(async move {
                let mut next = unit.clone();
                next.code_version = "14/1.13.0".to_string();
                next.healthy = false;
                self.store.put_unit(&next).unwrap();
                ProbeResult::Healthy
            })
        }
    }

    #[tokio::test]
    async fn verdict_for_stale_version_is_discarded() {
        let store = seeded(&[0]);
        let probe = RacingProbe {
            store: store.clone(),
        };
        let health = HealthAggregator::new(store.clone(), "postgresql", Arc::new(probe));

        assert!(!health.refresh(0).await.unwrap());
        assert!(!store.get_unit("postgresql", 0).unwrap().unwrap().healthy);
    }

    #[tokio::test]
    async fn refresh_all_ands_verdicts() {
        let store = seeded(&[0, 1, 2]);
        let probe = StaticProbe::new();
        probe.set_all([0, 1, 2], ProbeResult::Healthy);
        let health = HealthAggregator::new(store, "postgresql", Arc::new(probe.clone()));
        assert!(health.refresh_all().await.unwrap());

        probe.set(1, ProbeResult::Failed);
        assert!(!health.refresh_all().await.unwrap());
        assert!(!health.application_healthy().unwrap());
    }

    #[tokio::test]
    async fn refresh_all_reports_stored_verdicts() {
        let store = seeded(&[0]);
        let probe = RacingProbe {
            store: store.clone(),
        };
        let health = HealthAggregator::new(store, "postgresql", Arc::new(probe));

        // The probe said healthy, but for a version the unit no longer runs.
        assert!(!health.refresh_all().await.unwrap());
    }
}
