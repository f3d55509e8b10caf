//! REST API handlers
//!
//! Every authenticated route drives the lifecycle (`engine.tick()`) before
//! doing its own work, so the day state machine advances on traffic even if
//! the timer is wedged. Errors come back as `{"error": ...}` with the status
//! implied by their kind; auth failures carry no detail.

use axum::{
    extract::{Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tracing::error;

use gpubid_core::{password, Role, SchedError, SlotKey};
use gpubid_engine::admin::UserUpdate;
use gpubid_engine::{Engine, UsageReport};

use crate::auth::{self, SessionStore};
use crate::csv;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<Engine>,
    pub sessions: Arc<SessionStore>,
    /// Bearer token expected from the GPU monitor; ingest is refused when
    /// unset
    pub monitor_token: Option<String>,
}

/// Create the API router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/api/login", post(login))
        .route("/api/logout", post(logout))
        .route("/api/session", get(session))
        .route("/api/overview", get(overview))
        .route("/api/day", get(day))
        .route("/api/my/summary", get(my_summary))
        .route("/api/my/bids", get(my_bids))
        .route("/api/history/days", get(history_days))
        .route("/api/history/day", get(history_day))
        .route("/api/bid", post(bid))
        .route("/api/bid/bulk", post(bid_bulk))
        .route("/api/bid/undo", post(bid_undo))
        .route("/api/slot/release", post(release))
        .route("/api/slot/release-bulk", post(release_bulk))
        .route("/api/dismiss-outbid", post(dismiss_outbid))
        .route("/api/users/change-password", post(change_password))
        .route("/api/gpu-status", post(gpu_status))
        .route("/api/gpu-live-status", get(gpu_live_status))
        .route("/api/admin/users", get(admin_users))
        .route("/api/admin/users/create", post(admin_create_user))
        .route("/api/admin/users/update", post(admin_update_user))
        .route("/api/admin/users/bulk-update", post(admin_bulk_update_users))
        .route("/api/admin/users/password", post(admin_reset_password))
        .route("/api/admin/days", get(admin_days))
        .route("/api/admin/days/cleanup", post(admin_cleanup_days))
        .route("/api/admin/advance-day", post(admin_advance_day))
        .route(
            "/api/admin/transition-hour",
            get(admin_get_transition_hour).post(admin_set_transition_hour),
        )
        .route("/api/admin/reset-days", post(admin_reset_days))
        .route("/api/admin/clear-day-bids", post(admin_clear_day_bids))
        .route("/api/admin/export", get(admin_export_schedule))
        .route("/api/admin/export-usage", get(admin_export_usage))
        .route("/api/admin/export-all", get(admin_export_all))
        .with_state(state)
}

/// Engine errors mapped onto HTTP statuses
pub struct ApiError(SchedError);

impl From<SchedError> for ApiError {
    fn from(err: SchedError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self.0 {
            SchedError::Validation(_)
            | SchedError::Config(_)
            | SchedError::InsufficientCredits { .. } => {
                (StatusCode::BAD_REQUEST, self.0.to_string())
            }
            SchedError::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                "Authentication required".to_string(),
            ),
            SchedError::Forbidden(_) => (StatusCode::FORBIDDEN, "Forbidden".to_string()),
            SchedError::NotFound(_) => (StatusCode::NOT_FOUND, self.0.to_string()),
            SchedError::Conflict(_) => (StatusCode::CONFLICT, self.0.to_string()),
            SchedError::Storage(_)
            | SchedError::Io(_)
            | SchedError::Serialization(_)
            | SchedError::Internal(_) => {
                error!(error = %self.0, "Internal error");
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal error".to_string())
            }
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

async fn require_user(state: &AppState, headers: &HeaderMap) -> Result<(String, Role), ApiError> {
    let token = auth::session_token(headers).ok_or(SchedError::Unauthorized)?;
    let username = state
        .sessions
        .resolve(&token)
        .await
        .ok_or(SchedError::Unauthorized)?;
    Ok(state.engine.session_user(&username).await?)
}

async fn require_admin(state: &AppState, headers: &HeaderMap) -> Result<String, ApiError> {
    let (username, role) = require_user(state, headers).await?;
    if role != Role::Admin {
        return Err(SchedError::Forbidden("Admin privileges required".to_string()).into());
    }
    Ok(username)
}

#[derive(Debug, Deserialize)]
struct LoginRequest {
    username: String,
    password: String,
}

async fn login(
    State(state): State<AppState>,
    Json(req): Json<LoginRequest>,
) -> Result<Response, ApiError> {
    state.engine.tick().await?;
    let summary = state.engine.authenticate(&req.username, &req.password).await?;
    let token = state.sessions.create(&summary.username).await;
    Ok((
        StatusCode::OK,
        [(header::SET_COOKIE, auth::login_cookie(&token))],
        Json(json!({ "ok": true, "user": summary })),
    )
        .into_response())
}

async fn logout(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Some(token) = auth::session_token(&headers) {
        state.sessions.destroy(&token).await;
    }
    (
        StatusCode::OK,
        [(header::SET_COOKIE, auth::logout_cookie())],
        Json(json!({ "ok": true })),
    )
        .into_response()
}

async fn session(State(state): State<AppState>, headers: HeaderMap) -> Result<Response, ApiError> {
    match require_user(&state, &headers).await {
        Ok((username, _)) => {
            let summary = state.engine.user_summary_for(&username).await?;
            Ok(Json(json!({ "authenticated": true, "user": summary })).into_response())
        }
        Err(_) => Ok(Json(json!({ "authenticated": false })).into_response()),
    }
}

async fn overview(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let (username, _) = require_user(&state, &headers).await?;
    state.engine.tick().await?;
    Ok(Json(state.engine.overview(&username).await?).into_response())
}

#[derive(Debug, Deserialize)]
struct DayQuery {
    date: String,
}

async fn day(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<DayQuery>,
) -> Result<Response, ApiError> {
    let (username, _) = require_user(&state, &headers).await?;
    state.engine.tick().await?;
    Ok(Json(state.engine.day_view(&username, &query.date).await?).into_response())
}

async fn my_summary(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let (username, _) = require_user(&state, &headers).await?;
    state.engine.tick().await?;
    let days = state.engine.my_summary(&username).await?;
    Ok(Json(json!({ "days": days })).into_response())
}

#[derive(Debug, Deserialize)]
struct BidsQuery {
    limit: Option<usize>,
}

async fn my_bids(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<BidsQuery>,
) -> Result<Response, ApiError> {
    let (username, _) = require_user(&state, &headers).await?;
    let bids = state.engine.my_bids(&username, query.limit.unwrap_or(50)).await;
    Ok(Json(json!({ "bids": bids })).into_response())
}

async fn history_days(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    require_user(&state, &headers).await?;
    Ok(Json(json!({ "days": state.engine.history_days().await })).into_response())
}

async fn history_day(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<DayQuery>,
) -> Result<Response, ApiError> {
    let (username, _) = require_user(&state, &headers).await?;
    Ok(Json(state.engine.history_day(&username, &query.date).await?).into_response())
}

#[derive(Debug, Deserialize)]
struct SlotRequest {
    day: String,
    hour: u8,
    gpu: u32,
}

impl SlotRequest {
    fn key(&self) -> SlotKey {
        SlotKey::new(self.day.as_str(), self.hour, self.gpu)
    }
}

async fn bid(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<SlotRequest>,
) -> Result<Response, ApiError> {
    let (username, _) = require_user(&state, &headers).await?;
    state.engine.tick().await?;
    let outcome = state.engine.place_bid(&username, req.key()).await?;
    Ok(Json(json!({
        "ok": true,
        "price": outcome.price,
        "previous_winner": outcome.previous_winner,
        "previous_price": outcome.previous_price,
    }))
    .into_response())
}

#[derive(Debug, Deserialize)]
struct BulkBidRequest {
    bids: Vec<SlotRequest>,
}

async fn bid_bulk(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<BulkBidRequest>,
) -> Result<Response, ApiError> {
    let (username, _) = require_user(&state, &headers).await?;
    state.engine.tick().await?;
    let keys = req.bids.iter().map(SlotRequest::key).collect();
    let outcome = state.engine.place_bulk(&username, keys).await?;
    Ok(Json(json!({
        "ok": true,
        "results": outcome.results,
        "total_cost": outcome.total_cost,
    }))
    .into_response())
}

#[derive(Debug, Deserialize)]
struct UndoRequest {
    day: String,
    hour: u8,
    gpu: u32,
    previous_winner: Option<String>,
    #[serde(default)]
    previous_price: u32,
}

async fn bid_undo(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<UndoRequest>,
) -> Result<Response, ApiError> {
    let (username, _) = require_user(&state, &headers).await?;
    state.engine.tick().await?;
    state
        .engine
        .undo_bid(
            &username,
            SlotKey::new(req.day.as_str(), req.hour, req.gpu),
            req.previous_winner,
            req.previous_price,
        )
        .await?;
    Ok(Json(json!({ "ok": true, "reverted": true })).into_response())
}

async fn release(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<SlotRequest>,
) -> Result<Response, ApiError> {
    let (username, _) = require_user(&state, &headers).await?;
    state.engine.tick().await?;
    let outcome = state.engine.release_slot(&username, req.key()).await?;
    Ok(Json(json!({
        "ok": true,
        "released": true,
        "refund": outcome.refund,
        "new_balance": outcome.new_balance,
    }))
    .into_response())
}

#[derive(Debug, Deserialize)]
struct BulkReleaseRequest {
    slots: Vec<SlotRequest>,
}

async fn release_bulk(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<BulkReleaseRequest>,
) -> Result<Response, ApiError> {
    let (username, _) = require_user(&state, &headers).await?;
    state.engine.tick().await?;
    let keys = req.slots.iter().map(SlotRequest::key).collect();
    let outcome = state.engine.release_bulk(&username, keys).await?;
    Ok(Json(json!({
        "ok": true,
        "released_count": outcome.released,
        "total_refund": outcome.total_refund,
        "new_balance": outcome.new_balance,
    }))
    .into_response())
}

#[derive(Debug, Deserialize)]
struct DismissRequest {
    day: String,
}

async fn dismiss_outbid(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<DismissRequest>,
) -> Result<Response, ApiError> {
    let (username, _) = require_user(&state, &headers).await?;
    let dismissed = state.engine.dismiss_outbid(&username, &req.day).await?;
    Ok(Json(json!({ "ok": true, "dismissed": dismissed })).into_response())
}

#[derive(Debug, Deserialize)]
struct ChangePasswordRequest {
    old_password: String,
    new_password: String,
}

async fn change_password(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<ChangePasswordRequest>,
) -> Result<Response, ApiError> {
    let (username, _) = require_user(&state, &headers).await?;
    state
        .engine
        .change_password(&username, &req.old_password, &req.new_password)
        .await?;
    Ok(Json(json!({ "ok": true })).into_response())
}

async fn gpu_status(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(report): Json<UsageReport>,
) -> Result<Response, ApiError> {
    let Some(expected) = state.monitor_token.as_deref() else {
        return Err(SchedError::Validation(
            "GPU monitoring is not configured".to_string(),
        )
        .into());
    };
    let provided = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or(SchedError::Unauthorized)?;
    if !password::constant_time_str_eq(provided, expected) {
        return Err(SchedError::Unauthorized.into());
    }

    state.engine.tick().await?;
    let ingest = state.engine.ingest_usage(report).await?;
    Ok(Json(json!({
        "ok": true,
        "processed": ingest.processed,
        "slot": format!("{}T{:02}:00", ingest.day, ingest.hour),
        "server_time": ingest.server_time,
        "clock_skew_seconds": ingest.clock_skew_seconds,
    }))
    .into_response())
}

/// Public: no auth, read-only snapshot of the current hour
async fn gpu_live_status(State(state): State<AppState>) -> Response {
    Json(state.engine.live_status().await).into_response()
}

async fn admin_users(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    require_admin(&state, &headers).await?;
    Ok(Json(json!({ "users": state.engine.list_users().await })).into_response())
}

fn default_role() -> Role {
    Role::User
}

#[derive(Debug, Deserialize)]
struct CreateUserRequest {
    username: String,
    password: Option<String>,
    #[serde(default = "default_role")]
    role: Role,
    #[serde(default = "default_budget")]
    weekly_budget: u32,
}

fn default_budget() -> u32 {
    100
}

async fn admin_create_user(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<CreateUserRequest>,
) -> Result<Response, ApiError> {
    require_admin(&state, &headers).await?;
    // Password defaults to the username, to be changed at first login
    let password_input = req.password.clone().unwrap_or_else(|| req.username.clone());
    let user = state
        .engine
        .create_user(&req.username, &password_input, req.role, req.weekly_budget)
        .await?;
    Ok(Json(json!({ "ok": true, "user": user })).into_response())
}

#[derive(Debug, Deserialize)]
struct UpdateUserRequest {
    username: String,
    weekly_budget: Option<u32>,
    balance_delta: Option<i64>,
    enabled: Option<bool>,
}

async fn admin_update_user(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<UpdateUserRequest>,
) -> Result<Response, ApiError> {
    require_admin(&state, &headers).await?;
    state
        .engine
        .update_user(
            &req.username,
            UserUpdate {
                weekly_budget: req.weekly_budget,
                balance_delta: req.balance_delta,
                enabled: req.enabled,
            },
        )
        .await?;
    Ok(Json(json!({ "ok": true })).into_response())
}

#[derive(Debug, Deserialize)]
struct BulkUpdateUsersRequest {
    weekly_budget: Option<u32>,
    balance_delta: Option<i64>,
}

async fn admin_bulk_update_users(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<BulkUpdateUsersRequest>,
) -> Result<Response, ApiError> {
    require_admin(&state, &headers).await?;
    let updated = state
        .engine
        .bulk_update_users(UserUpdate {
            weekly_budget: req.weekly_budget,
            balance_delta: req.balance_delta,
            enabled: None,
        })
        .await?;
    Ok(Json(json!({ "ok": true, "updated": updated })).into_response())
}

#[derive(Debug, Deserialize)]
struct ResetPasswordRequest {
    username: String,
    password: String,
}

async fn admin_reset_password(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<ResetPasswordRequest>,
) -> Result<Response, ApiError> {
    require_admin(&state, &headers).await?;
    state.engine.set_user_password(&req.username, &req.password).await?;
    Ok(Json(json!({ "ok": true })).into_response())
}

async fn admin_days(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    require_admin(&state, &headers).await?;
    state.engine.tick().await?;
    Ok(Json(json!({ "days": state.engine.list_days().await? })).into_response())
}

#[derive(Debug, Deserialize)]
struct CleanupRequest {
    #[serde(default)]
    keep_count: usize,
}

async fn admin_cleanup_days(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<CleanupRequest>,
) -> Result<Response, ApiError> {
    require_admin(&state, &headers).await?;
    let deleted = state.engine.cleanup_days(req.keep_count).await?;
    Ok(Json(json!({
        "ok": true,
        "deleted_count": deleted.len(),
        "deleted_days": deleted,
    }))
    .into_response())
}

async fn admin_advance_day(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    require_admin(&state, &headers).await?;
    let outcome = state.engine.advance_day().await?;
    Ok(Json(json!({ "ok": true, "finalized": outcome.finalized, "executing": outcome.executing }))
        .into_response())
}

async fn admin_get_transition_hour(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    require_admin(&state, &headers).await?;
    Ok(Json(json!({
        "transition_hour": state.engine.transition_hour().await,
        "current_time": state.engine.clock().now().to_rfc3339(),
    }))
    .into_response())
}

#[derive(Debug, Deserialize)]
struct TransitionHourRequest {
    transition_hour: u8,
}

async fn admin_set_transition_hour(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<TransitionHourRequest>,
) -> Result<Response, ApiError> {
    require_admin(&state, &headers).await?;
    state.engine.set_transition_hour(req.transition_hour).await?;
    Ok(Json(json!({ "ok": true, "transition_hour": req.transition_hour })).into_response())
}

async fn admin_reset_days(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    require_admin(&state, &headers).await?;
    state.engine.reset_days().await?;
    Ok(Json(json!({ "ok": true })).into_response())
}

#[derive(Debug, Deserialize)]
struct ClearBidsRequest {
    day: String,
}

async fn admin_clear_day_bids(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<ClearBidsRequest>,
) -> Result<Response, ApiError> {
    require_admin(&state, &headers).await?;
    let cleared = state.engine.clear_day_bids(&req.day).await?;
    Ok(Json(json!({ "ok": true, "cleared": cleared })).into_response())
}

#[derive(Debug, Deserialize)]
struct ExportQuery {
    day: String,
}

fn csv_response(filename: String, body: String) -> Response {
    (
        [
            (header::CONTENT_TYPE, "text/csv; charset=utf-8".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{}\"", filename),
            ),
        ],
        body,
    )
        .into_response()
}

async fn admin_export_schedule(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<ExportQuery>,
) -> Result<Response, ApiError> {
    require_admin(&state, &headers).await?;
    let rows = state.engine.export_schedule(&query.day).await?;
    Ok(csv_response(
        format!("schedule_{}.csv", query.day),
        csv::schedule_csv(&rows),
    ))
}

async fn admin_export_usage(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<ExportQuery>,
) -> Result<Response, ApiError> {
    require_admin(&state, &headers).await?;
    let rows = state.engine.export_usage(&query.day).await?;
    Ok(csv_response(
        format!("usage_tracking_{}.csv", query.day),
        csv::usage_csv(&rows),
    ))
}

async fn admin_export_all(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    require_admin(&state, &headers).await?;
    let snapshot = state.engine.export_snapshot().await?;
    let stamp = state.engine.clock().now().format("%Y%m%d_%H%M%S");
    Ok((
        [
            (
                header::CONTENT_TYPE,
                "application/json; charset=utf-8".to_string(),
            ),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"gpubid_backup_{}.json\"", stamp),
            ),
        ],
        Json(snapshot),
    )
        .into_response())
}
