//! refresh-api: REST API for Refresh.
//!
//! The platform reports unit versions and health here and polls whether a
//! unit may upgrade; operators change targets and policy and run the
//! rollout actions.
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | GET | `/api/v1/apps` | List applications |
//! | POST | `/api/v1/apps` | Register an application |
//! | GET | `/api/v1/apps/{app}` | Status report |
//! | POST | `/api/v1/apps/{app}/target` | Declare target versions |
//! | PUT | `/api/v1/apps/{app}/config` | Set `pause_after_unit_upgrade` |
//! | PUT | `/api/v1/apps/{app}/coordinator` | Designate the coordinating unit |
//! | POST | `/api/v1/apps/{app}/units` | Register a unit |
//! | DELETE | `/api/v1/apps/{app}/units/{ordinal}` | Decommission a unit |
//! | POST | `/api/v1/apps/{app}/units/{ordinal}/observed` | Unit now runs these versions |
//! | POST | `/api/v1/apps/{app}/units/{ordinal}/health` | Workload health report |
//! | GET | `/api/v1/apps/{app}/units/{ordinal}/permission` | May this unit upgrade / start? |
//! | POST | `/api/v1/apps/{app}/actions/pre-upgrade-check` | Readiness check |
//! | POST | `/api/v1/apps/{app}/actions/resume-upgrade` | Resume after a pause |
//! | POST | `/api/v1/apps/{app}/actions/force-upgrade-start` | Bypass gate checks |
//! | GET | `/api/v1/apps/{app}/audit` | Audit trail |

pub mod action_handlers;
pub mod handlers;

use std::sync::Arc;

use axum::Router;
use axum::routing::{delete, get, post, put};
use refresh_health::{HealthAggregator, HealthProbe};
use refresh_rollout::{ActionGateway, RolloutController, VersionLedger, Workload};
use refresh_state::StateStore;
use tokio::sync::Mutex;

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub store: StateStore,
    pub workload: Arc<dyn Workload>,
    pub probe: Arc<dyn HealthProbe>,
    /// Serializes every write in this process, so the daemon is the single
    /// coordinating writer of each session.
    pub writes: Arc<Mutex<()>>,
}

impl ApiState {
    pub fn new(store: StateStore, workload: Arc<dyn Workload>, probe: Arc<dyn HealthProbe>) -> Self {
        Self {
            store,
            workload,
            probe,
            writes: Arc::new(Mutex::new(())),
        }
    }

    pub fn controller(&self, app: &str) -> RolloutController {
        RolloutController::new(self.store.clone(), app, self.workload.clone())
    }

    pub fn gateway(&self, app: &str) -> ActionGateway {
        ActionGateway::new(self.controller(app))
    }

    pub fn ledger(&self, app: &str) -> VersionLedger {
        VersionLedger::new(self.store.clone(), app)
    }

    pub fn health(&self, app: &str) -> HealthAggregator {
        HealthAggregator::new(self.store.clone(), app, self.probe.clone())
    }
}

/// Build the complete API router.
pub fn build_router(state: ApiState) -> Router {
    let api_routes = Router::new()
        .route("/apps", get(handlers::list_apps).post(handlers::register_app))
        .route("/apps/{app}", get(handlers::get_status))
        .route("/apps/{app}/target", post(handlers::change_target))
        .route("/apps/{app}/config", put(handlers::set_config))
        .route("/apps/{app}/coordinator", put(handlers::set_coordinator))
        .route("/apps/{app}/units", post(handlers::register_unit))
        .route("/apps/{app}/units/{ordinal}", delete(handlers::decommission_unit))
        .route("/apps/{app}/units/{ordinal}/observed", post(handlers::version_observed))
        .route("/apps/{app}/units/{ordinal}/health", post(handlers::report_health))
        .route("/apps/{app}/units/{ordinal}/permission", get(handlers::permission))
        .route("/apps/{app}/audit", get(handlers::audit))
        .route(
            "/apps/{app}/actions/pre-upgrade-check",
            post(action_handlers::pre_upgrade_check),
        )
        .route(
            "/apps/{app}/actions/resume-upgrade",
            post(action_handlers::resume_upgrade),
        )
        .route(
            "/apps/{app}/actions/force-upgrade-start",
            post(action_handlers::force_upgrade_start),
        )
        .with_state(state);

    Router::new().nest("/api/v1", api_routes)
}
