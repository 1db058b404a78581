//! REST API handlers for applications, units and the audit trail.
//!
//! Every write takes the process-wide write lock, applies the platform or
//! operator input, then reconciles the rollout so the response carries the
//! resulting decision.

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use refresh_core::{Ordinal, PlatformVariant, VersionPin, validate_app_name};
use refresh_health::{HealthError, ProbeResult};
use refresh_rollout::{ActionError, LedgerError, RolloutError};
use refresh_state::{ApplicationRecord, StateError};

use crate::ApiState;

/// Response wrapper for consistent API format.
#[derive(Serialize)]
pub(crate) struct ApiResponse<T: Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    pub(crate) fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }
}

pub(crate) fn error_response(msg: &str, status: StatusCode) -> Response {
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(msg.to_string()),
        }),
    )
        .into_response()
}

fn internal(e: &dyn std::fmt::Display) -> Response {
    warn!(error = %e, "request failed");
    error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR)
}

pub(crate) fn state_error(e: &StateError) -> Response {
    match e {
        StateError::UnknownUnit { .. } => error_response(&e.to_string(), StatusCode::NOT_FOUND),
        StateError::InvalidAppName(_) => error_response(&e.to_string(), StatusCode::BAD_REQUEST),
        StateError::Conflict { .. } => error_response(&e.to_string(), StatusCode::CONFLICT),
        _ => internal(e),
    }
}

pub(crate) fn ledger_error(e: &LedgerError) -> Response {
    match e {
        LedgerError::UnknownApplication(_) | LedgerError::UnknownUnit { .. } => {
            error_response(&e.to_string(), StatusCode::NOT_FOUND)
        }
        LedgerError::State(inner) => state_error(inner),
    }
}

pub(crate) fn rollout_error(e: &RolloutError) -> Response {
    match e {
        RolloutError::UnknownApplication(_) => error_response(&e.to_string(), StatusCode::NOT_FOUND),
        RolloutError::Ledger(inner) => ledger_error(inner),
        RolloutError::State(inner) => state_error(inner),
        RolloutError::Contended { .. } => error_response(&e.to_string(), StatusCode::CONFLICT),
        RolloutError::MissingOriginalVersions(_) => {
            error_response(&e.to_string(), StatusCode::UNPROCESSABLE_ENTITY)
        }
    }
}

/// Operator input errors never change state.
pub(crate) fn action_error(e: &ActionError) -> Response {
    let status = match e {
        ActionError::Rollout(inner) => return rollout_error(inner),
        ActionError::WrongActor { .. } => StatusCode::FORBIDDEN,
        ActionError::AlreadyUpgrading
        | ActionError::NoUpgradeInProgress
        | ActionError::AlreadyStarted
        | ActionError::NothingToResume { .. } => StatusCode::CONFLICT,
        ActionError::NoOverrideSelected | ActionError::PolicyNotApplicable => {
            StatusCode::BAD_REQUEST
        }
        ActionError::UnitUnhealthy(_)
        | ActionError::ForceStartRequired { .. }
        | ActionError::CheckFailed { .. } => StatusCode::UNPROCESSABLE_ENTITY,
    };
    error_response(&e.to_string(), status)
}

fn health_error(e: &HealthError) -> Response {
    match e {
        HealthError::UnknownUnit { .. } => error_response(&e.to_string(), StatusCode::NOT_FOUND),
        HealthError::State(inner) => state_error(inner),
    }
}

/// Reconcile and wrap `data` together with the resulting decision.
fn reconciled<T: Serialize>(state: &ApiState, app: &str, data: T, status: StatusCode) -> Response {
    match state.controller(app).reconcile() {
        Ok(decision) => (
            status,
            ApiResponse::ok(serde_json::json!({
                "result": data,
                "decision": decision,
            })),
        )
            .into_response(),
        Err(e) => rollout_error(&e),
    }
}

// ── Applications ───────────────────────────────────────────────

/// Request body to register an application.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterApp {
    pub name: String,
    pub variant: PlatformVariant,
    #[serde(default)]
    pub coordinator: Ordinal,
    #[serde(default)]
    pub pause_after_unit_upgrade: Option<String>,
    /// Versions every unit runs at registration.
    pub versions: VersionPin,
    #[serde(default)]
    pub workload_name: String,
    #[serde(default)]
    pub docs_url: String,
    #[serde(default)]
    pub resource_name: Option<String>,
}

impl RegisterApp {
    pub fn into_record(self) -> ApplicationRecord {
        let mut record = ApplicationRecord::new(&self.name, self.variant);
        record.coordinator = self.coordinator;
        if let Some(raw) = self.pause_after_unit_upgrade {
            record.pause_policy_raw = raw;
        }
        record.target = Some(self.versions.clone());
        record.original = Some(self.versions);
        record.workload_name = self.workload_name;
        record.docs_url = self.docs_url;
        record.resource_name = self.resource_name;
        record
    }
}

/// GET /api/v1/apps
pub async fn list_apps(State(state): State<ApiState>) -> Response {
    match state.store.list_apps() {
        Ok(apps) => ApiResponse::ok(apps).into_response(),
        Err(e) => state_error(&e),
    }
}

/// POST /api/v1/apps
pub async fn register_app(
    State(state): State<ApiState>,
    Json(req): Json<RegisterApp>,
) -> Response {
    if req.versions.code.is_empty() || req.versions.workload.is_empty() {
        return error_response(
            "versions.code and versions.workload are required",
            StatusCode::BAD_REQUEST,
        );
    }
    if let Err(e) = validate_app_name(&req.name) {
        return error_response(&e.to_string(), StatusCode::BAD_REQUEST);
    }
    let _guard = state.writes.lock().await;
    match state.store.get_app(&req.name) {
        Ok(Some(_)) => {
            return error_response("application already registered", StatusCode::CONFLICT);
        }
        Ok(None) => {}
        Err(e) => return state_error(&e),
    }
    let record = req.into_record();
    match state.store.put_app(&record) {
        Ok(()) => {
            info!(app = %record.name, variant = %record.variant, "application registered");
            (StatusCode::CREATED, ApiResponse::ok(record)).into_response()
        }
        Err(e) => state_error(&e),
    }
}

/// GET /api/v1/apps/{app}
pub async fn get_status(State(state): State<ApiState>, Path(app): Path<String>) -> Response {
    match state.controller(&app).status() {
        Ok(report) => ApiResponse::ok(report).into_response(),
        Err(e) => rollout_error(&e),
    }
}

/// POST /api/v1/apps/{app}/target
pub async fn change_target(
    State(state): State<ApiState>,
    Path(app): Path<String>,
    Json(target): Json<VersionPin>,
) -> Response {
    if target.code.is_empty() || target.workload.is_empty() {
        return error_response("code and workload are required", StatusCode::BAD_REQUEST);
    }
    let _guard = state.writes.lock().await;
    match state.controller(&app).change_target(&target) {
        Ok(decision) => ApiResponse::ok(decision).into_response(),
        Err(e) => rollout_error(&e),
    }
}

/// Config request body.
#[derive(Debug, Deserialize)]
pub struct ConfigRequest {
    pub pause_after_unit_upgrade: String,
}

/// PUT /api/v1/apps/{app}/config
///
/// Out-of-range values are stored and reported as a standing warning.
pub async fn set_config(
    State(state): State<ApiState>,
    Path(app): Path<String>,
    Json(req): Json<ConfigRequest>,
) -> Response {
    let _guard = state.writes.lock().await;
    match state
        .controller(&app)
        .set_pause_policy(&req.pause_after_unit_upgrade)
    {
        Ok(decision) => ApiResponse::ok(decision).into_response(),
        Err(e) => rollout_error(&e),
    }
}

/// Coordinator request body.
#[derive(Debug, Deserialize)]
pub struct CoordinatorRequest {
    pub unit: Ordinal,
}

/// PUT /api/v1/apps/{app}/coordinator
pub async fn set_coordinator(
    State(state): State<ApiState>,
    Path(app): Path<String>,
    Json(req): Json<CoordinatorRequest>,
) -> Response {
    let _guard = state.writes.lock().await;
    match state.controller(&app).set_coordinator(req.unit) {
        Ok(decision) => ApiResponse::ok(decision).into_response(),
        Err(e) => rollout_error(&e),
    }
}

// ── Units ──────────────────────────────────────────────────────

/// Unit registration body. Versions default to the declared target.
#[derive(Debug, Deserialize)]
pub struct RegisterUnitRequest {
    pub ordinal: Ordinal,
    #[serde(default)]
    pub code_version: Option<String>,
    #[serde(default)]
    pub workload_version: Option<String>,
}

/// POST /api/v1/apps/{app}/units
pub async fn register_unit(
    State(state): State<ApiState>,
    Path(app): Path<String>,
    Json(req): Json<RegisterUnitRequest>,
) -> Response {
    let versions = match (&req.code_version, &req.workload_version) {
        (Some(code), Some(workload)) => Some((code.as_str(), workload.as_str())),
        (None, None) => None,
        _ => {
            return error_response(
                "code_version and workload_version must be given together",
                StatusCode::BAD_REQUEST,
            );
        }
    };
    let _guard = state.writes.lock().await;
    match state.ledger(&app).register_unit(req.ordinal, versions) {
        Ok(unit) => reconciled(&state, &app, unit, StatusCode::CREATED),
        Err(e) => ledger_error(&e),
    }
}

/// DELETE /api/v1/apps/{app}/units/{ordinal}
pub async fn decommission_unit(
    State(state): State<ApiState>,
    Path((app, ordinal)): Path<(String, Ordinal)>,
) -> Response {
    let _guard = state.writes.lock().await;
    match state.ledger(&app).decommission_unit(ordinal) {
        Ok(true) => reconciled(&state, &app, "decommissioned", StatusCode::OK),
        Ok(false) => error_response("unit not found", StatusCode::NOT_FOUND),
        Err(e) => ledger_error(&e),
    }
}

/// Lifecycle notification body.
#[derive(Debug, Deserialize)]
pub struct ObservedRequest {
    pub code_version: String,
    pub workload_version: String,
}

/// POST /api/v1/apps/{app}/units/{ordinal}/observed
pub async fn version_observed(
    State(state): State<ApiState>,
    Path((app, ordinal)): Path<(String, Ordinal)>,
    Json(req): Json<ObservedRequest>,
) -> Response {
    let _guard = state.writes.lock().await;
    match state
        .ledger(&app)
        .record_version_observed(ordinal, &req.code_version, &req.workload_version)
    {
        Ok(unit) => reconciled(&state, &app, unit, StatusCode::OK),
        Err(e) => ledger_error(&e),
    }
}

/// Health report body.
#[derive(Debug, Deserialize)]
pub struct HealthRequest {
    pub healthy: bool,
}

/// POST /api/v1/apps/{app}/units/{ordinal}/health
pub async fn report_health(
    State(state): State<ApiState>,
    Path((app, ordinal)): Path<(String, Ordinal)>,
    Json(req): Json<HealthRequest>,
) -> Response {
    let result = if req.healthy {
        ProbeResult::Healthy
    } else {
        ProbeResult::Unhealthy
    };
    let _guard = state.writes.lock().await;
    match state.health(&app).record(ordinal, result) {
        Ok(healthy) => reconciled(&state, &app, healthy, StatusCode::OK),
        Err(e) => health_error(&e),
    }
}

/// GET /api/v1/apps/{app}/units/{ordinal}/permission
pub async fn permission(
    State(state): State<ApiState>,
    Path((app, ordinal)): Path<(String, Ordinal)>,
) -> Response {
    match state.controller(&app).permission(ordinal) {
        Ok(permission) => ApiResponse::ok(permission).into_response(),
        Err(e) => rollout_error(&e),
    }
}

// ── Audit ──────────────────────────────────────────────────────

/// GET /api/v1/apps/{app}/audit
pub async fn audit(State(state): State<ApiState>, Path(app): Path<String>) -> Response {
    match state.store.get_app(&app) {
        Ok(Some(_)) => {}
        Ok(None) => return error_response("application not found", StatusCode::NOT_FOUND),
        Err(e) => return state_error(&e),
    }
    match state.store.list_audit(&app) {
        Ok(entries) => ApiResponse::ok(entries).into_response(),
        Err(e) => state_error(&e),
    }
}
