//! Operator actions. Each names the unit it is run on; the gateway rejects
//! actions run on the wrong unit.

use axum::Json;
use axum::extract::{Path, State};
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use tracing::info;

use refresh_core::Ordinal;
use refresh_rollout::GateOverrides;

use crate::ApiState;
use crate::handlers::{ApiResponse, action_error};

#[derive(Debug, Deserialize)]
pub struct PreCheckRequest {
    pub unit: Ordinal,
}

#[derive(Debug, Deserialize)]
pub struct ResumeRequest {
    pub unit: Ordinal,
    #[serde(default)]
    pub ignore_health_of_upgraded_units: bool,
}

#[derive(Debug, Deserialize)]
pub struct ForceStartRequest {
    pub unit: Ordinal,
    /// Accept the workload the pioneer runs as the target's.
    #[serde(default)]
    pub ignore_workload_pin_check: bool,
    #[serde(default)]
    pub ignore_compatibility_checks: bool,
    #[serde(default)]
    pub ignore_pre_upgrade_checks: bool,
}

/// POST /api/v1/apps/{app}/actions/pre-upgrade-check
pub async fn pre_upgrade_check(
    State(state): State<ApiState>,
    Path(app): Path<String>,
    Json(req): Json<PreCheckRequest>,
) -> Response {
    info!(app = %app, unit = req.unit, "pre-upgrade-check requested");
    match state.gateway(&app).request_pre_check(req.unit) {
        Ok(report) => ApiResponse::ok(report).into_response(),
        Err(e) => action_error(&e),
    }
}

/// POST /api/v1/apps/{app}/actions/resume-upgrade
pub async fn resume_upgrade(
    State(state): State<ApiState>,
    Path(app): Path<String>,
    Json(req): Json<ResumeRequest>,
) -> Response {
    let _guard = state.writes.lock().await;
    match state
        .gateway(&app)
        .resume(req.unit, req.ignore_health_of_upgraded_units)
    {
        Ok(outcome) => ApiResponse::ok(outcome).into_response(),
        Err(e) => action_error(&e),
    }
}

/// POST /api/v1/apps/{app}/actions/force-upgrade-start
pub async fn force_upgrade_start(
    State(state): State<ApiState>,
    Path(app): Path<String>,
    Json(req): Json<ForceStartRequest>,
) -> Response {
    let _guard = state.writes.lock().await;
    let overrides = GateOverrides {
        workload_pin: req.ignore_workload_pin_check,
        compatibility: req.ignore_compatibility_checks,
        pre_upgrade: req.ignore_pre_upgrade_checks,
    };
    match state.gateway(&app).force_start(req.unit, overrides) {
        Ok(outcome) => ApiResponse::ok(outcome).into_response(),
        Err(e) => action_error(&e),
    }
}
