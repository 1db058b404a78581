//! Periodic health sweep.
//!
//! Probes every unit of every application, then reconciles each rollout
//! so an unhealthy upgraded unit blocks it and a recovered one lets it
//! continue.

use std::time::Duration;

use refresh_api::ApiState;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

pub struct HealthMonitor {
    state: ApiState,
}

impl HealthMonitor {
    pub fn new(state: ApiState) -> Self {
        Self { state }
    }

    /// One sweep over all applications. Failures are logged per application.
    pub async fn sweep(&self) -> anyhow::Result<()> {
        let apps = self.state.store.list_apps()?;
        for record in apps {
            let app = record.name;
            let healthy = match self.state.health(&app).refresh_all().await {
                Ok(healthy) => healthy,
                Err(e) => {
                    warn!(app = %app, error = %e, "health sweep failed");
                    continue;
                }
            };
            let _guard = self.state.writes.lock().await;
            match self.state.controller(&app).reconcile() {
                Ok(decision) => {
                    debug!(app = %app, healthy, state = %decision.state, "health sweep reconciled");
                }
                Err(e) => warn!(app = %app, error = %e, "reconcile after health sweep failed"),
            }
        }
        Ok(())
    }

    pub async fn run(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(interval_ms = interval.as_millis() as u64, "health monitor started");
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    if let Err(e) = self.sweep().await {
                        error!(error = %e, "health sweep failed");
                    }
                }
                _ = shutdown.changed() => {
                    info!("health monitor shutting down");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use refresh_core::{PlatformVariant, VersionPin};
    use refresh_health::{ProbeResult, StaticProbe};
    use refresh_state::{ApplicationRecord, StateStore};

    use crate::workload::ConfiguredWorkload;

    fn state(probe: StaticProbe) -> ApiState {
        let store = StateStore::open_in_memory().unwrap();
        let mut record = ApplicationRecord::new("mysql", PlatformVariant::PerUnit);
        let pin = VersionPin::new("8.0/1.0.0", "8.0.39", "8.0.39");
        record.target = Some(pin.clone());
        record.original = Some(pin);
        store.put_app(&record).unwrap();
        let state = ApiState::new(
            store,
            Arc::new(ConfiguredWorkload::new("MySQL", None)),
            Arc::new(probe),
        );
        for ordinal in 0..2 {
            state.ledger("mysql").register_unit(ordinal, None).unwrap();
        }
        state
    }

    #[tokio::test]
    async fn sweep_stores_probe_verdicts() {
        let probe = StaticProbe::new();
        probe.set_all([0, 1], ProbeResult::Healthy);
        probe.set(1, ProbeResult::Unhealthy);
        let state = state(probe);

        HealthMonitor::new(state.clone()).sweep().await.unwrap();

        let units = state.store.list_units("mysql").unwrap();
        assert!(units.iter().all(|u| u.health_checked));
        assert!(units[0].healthy);
        assert!(!units[1].healthy);
    }

    #[tokio::test]
    async fn run_stops_on_shutdown() {
        let monitor = HealthMonitor::new(state(StaticProbe::new()));
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(async move {
            monitor.run(Duration::from_secs(3600), rx).await;
        });
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
