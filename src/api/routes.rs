use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;
use serde_json::json;
use tracing::info;

use super::auth::is_authorized;
use super::state::AppState;
use crate::error::GridError;
use crate::killswitch::{LockdownLevel, Role};

#[derive(Debug, Deserialize)]
pub struct AuthQuery {
    token: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct LevelChangeRequest {
    pub level: u8,
    pub initiator: String,
    pub role: Role,
    #[serde(default)]
    pub reason: String,
}

#[derive(Debug, Deserialize)]
pub struct EmergencyRequest {
    pub initiator: String,
    pub role: Role,
    #[serde(default)]
    pub reason: String,
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    #[serde(default = "default_history_limit")]
    pub limit: usize,
    pub token: Option<String>,
}

fn default_history_limit() -> usize {
    50
}

#[derive(Debug, Deserialize)]
pub struct UnlockRequest {
    pub operator: String,
}

fn control_error(err: GridError) -> (StatusCode, Json<serde_json::Value>) {
    let status = match &err {
        GridError::InsufficientPrivilege | GridError::CannotDowngrade => StatusCode::FORBIDDEN,
        GridError::AlreadyAtLevel => StatusCode::CONFLICT,
        GridError::InvalidLevel(_) | GridError::InvalidStateTransition { .. } => {
            StatusCode::BAD_REQUEST
        }
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(json!({ "error": err.to_string() })))
}

fn parse_level(raw: u8) -> Result<LockdownLevel, (StatusCode, Json<serde_json::Value>)> {
    LockdownLevel::from_u8(raw).ok_or_else(|| control_error(GridError::InvalidLevel(raw)))
}

/// Liveness probe; unauthenticated by design.
pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "uptime_seconds": state.uptime_secs(),
        "engine": state.engine.status().as_str(),
        "killswitch_level": state.killswitch.level().as_str(),
        "observers": state.broadcaster.observer_count(),
    }))
}

/// Full platform status: kill switch, risk shield, engine, settlement,
/// proof guard, and venue connectivity.
pub async fn status(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(auth): Query<AuthQuery>,
) -> Result<impl IntoResponse, StatusCode> {
    if !is_authorized(&headers, auth.token.as_deref(), &state.auth_token) {
        return Err(StatusCode::UNAUTHORIZED);
    }

    let venues: serde_json::Value = state
        .grid
        .venue_status()
        .into_iter()
        .map(|(venue, status)| (venue.to_string(), serde_json::Value::String(status)))
        .collect::<serde_json::Map<_, _>>()
        .into();

    Ok(Json(json!({
        "killswitch": state.killswitch.status(),
        "risk": state.risk.status(),
        "engine": state.engine.report(),
        "settlement": state.settlement.status(),
        "zkp": state.zkp.stats(),
        "grid": {
            "venues": venues,
            "counters": state.grid.counters(),
        },
    })))
}

pub async fn escalate(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(auth): Query<AuthQuery>,
    Json(req): Json<LevelChangeRequest>,
) -> Result<impl IntoResponse, (StatusCode, Json<serde_json::Value>)> {
    if !is_authorized(&headers, auth.token.as_deref(), &state.auth_token) {
        return Err((StatusCode::UNAUTHORIZED, Json(json!({"error": "unauthorized"}))));
    }
    let level = parse_level(req.level)?;

    state
        .killswitch
        .set_level(level, &req.initiator, req.role, &req.reason)
        .map_err(control_error)?;

    info!(level = %level, initiator = %req.initiator, "kill switch escalated via API");
    Ok(Json(json!({ "status": state.killswitch.status() })))
}

pub async fn deescalate(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(auth): Query<AuthQuery>,
    Json(req): Json<LevelChangeRequest>,
) -> Result<impl IntoResponse, (StatusCode, Json<serde_json::Value>)> {
    if !is_authorized(&headers, auth.token.as_deref(), &state.auth_token) {
        return Err((StatusCode::UNAUTHORIZED, Json(json!({"error": "unauthorized"}))));
    }
    let level = parse_level(req.level)?;

    state
        .killswitch
        .deescalate(level, &req.initiator, req.role, &req.reason)
        .map_err(control_error)?;

    Ok(Json(json!({ "status": state.killswitch.status() })))
}

pub async fn emergency(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(auth): Query<AuthQuery>,
    Json(req): Json<EmergencyRequest>,
) -> Result<impl IntoResponse, (StatusCode, Json<serde_json::Value>)> {
    if !is_authorized(&headers, auth.token.as_deref(), &state.auth_token) {
        return Err((StatusCode::UNAUTHORIZED, Json(json!({"error": "unauthorized"}))));
    }

    state
        .killswitch
        .emergency_shutdown(&req.initiator, req.role, &req.reason)
        .map_err(control_error)?;

    Ok(Json(json!({ "status": state.killswitch.status() })))
}

pub async fn killswitch_history(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<HistoryQuery>,
) -> Result<impl IntoResponse, StatusCode> {
    if !is_authorized(&headers, query.token.as_deref(), &state.auth_token) {
        return Err(StatusCode::UNAUTHORIZED);
    }
    Ok(Json(json!({ "events": state.killswitch.history(query.limit) })))
}

/// Inbound settlement attestation. Accepted proofs admit the referenced
/// settlement; every rejection carries its structured reason.
pub async fn submit_proof(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(auth): Query<AuthQuery>,
    Json(proof): Json<crate::zkp::Proof>,
) -> Result<impl IntoResponse, (StatusCode, Json<serde_json::Value>)> {
    if !is_authorized(&headers, auth.token.as_deref(), &state.auth_token) {
        return Err((StatusCode::UNAUTHORIZED, Json(json!({"error": "unauthorized"}))));
    }

    match state.zkp.verify(&proof) {
        Ok(()) => Ok(Json(json!({
            "accepted": true,
            "proof_id": proof.id,
            "settlement_id": proof.settlement_id,
        }))),
        Err(GridError::ProofRejected(rejection)) => Err((
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(json!({
                "accepted": false,
                "proof_id": proof.id,
                "reason": rejection.to_string(),
            })),
        )),
        Err(err) => Err(control_error(err)),
    }
}

pub async fn release_safety_lock(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(auth): Query<AuthQuery>,
    Json(req): Json<UnlockRequest>,
) -> Result<impl IntoResponse, (StatusCode, Json<serde_json::Value>)> {
    if !is_authorized(&headers, auth.token.as_deref(), &state.auth_token) {
        return Err((StatusCode::UNAUTHORIZED, Json(json!({"error": "unauthorized"}))));
    }

    state
        .engine
        .release_safety_lock(&req.operator)
        .map_err(control_error)?;
    Ok(Json(json!({ "engine": state.engine.status().as_str() })))
}
