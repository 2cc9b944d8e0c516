use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use tracing::info;

use crate::api::{error_response, AppState, CurrentUser, Paginated};
use crate::store::{Run, RunFilters, RunStatus};
use crate::validation::ValidationOutcome;

#[derive(Debug, Deserialize)]
pub struct CreateRunRequest {
    pub question: String,
    pub chat_session_id: Option<i64>,
}

/// POST /agents/{id}/run: queue a question against an agent.
pub async fn create_run(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
    Path(agent_id): Path<i64>,
    Json(body): Json<CreateRunRequest>,
) -> Result<(StatusCode, Json<Run>), Response> {
    info!("Create run for agent {} by user {}", agent_id, user_id);
    let run = state
        .controller
        .create_run(user_id, agent_id, &body.question, body.chat_session_id)
        .await
        .map_err(error_response)?;
    Ok((StatusCode::ACCEPTED, Json(run)))
}

/// GET /runs/{id}: current state; the client polls this until a
/// terminal status appears.
pub async fn get_run(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
    Path(run_id): Path<i64>,
) -> Result<Json<Run>, Response> {
    match state.controller.get_run(user_id, run_id).map_err(error_response)? {
        Some(run) => Ok(Json(run)),
        None => Err((StatusCode::NOT_FOUND, "run not found").into_response()),
    }
}

#[derive(Debug, Deserialize)]
pub struct ListRunsQuery {
    #[serde(default = "default_page")]
    pub page: u32,
    #[serde(default = "default_per_page")]
    pub per_page: u32,
    pub agent_id: Option<i64>,
    pub chat_session_id: Option<i64>,
    pub status: Option<String>,
}

fn default_page() -> u32 {
    1
}

fn default_per_page() -> u32 {
    20
}

/// GET /runs: paginated, newest first.
pub async fn list_runs(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
    Query(query): Query<ListRunsQuery>,
) -> Result<Json<Paginated<Run>>, Response> {
    let status = match query.status.as_deref() {
        Some(raw) => Some(RunStatus::parse(raw).map_err(|_| {
            (StatusCode::BAD_REQUEST, format!("unknown status: {}", raw)).into_response()
        })?),
        None => None,
    };
    let filters = RunFilters {
        agent_id: query.agent_id,
        chat_session_id: query.chat_session_id,
        status,
    };
    let (items, pagination) = state
        .controller
        .list_runs(user_id, &filters, query.page, query.per_page)
        .map_err(error_response)?;
    Ok(Json(Paginated { items, pagination }))
}

#[derive(Debug, serde::Serialize)]
pub struct CancelResponse {
    pub cancelled: bool,
}

/// POST /runs/{id}/cancel: reaches queued runs only.
pub async fn cancel_run(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
    Path(run_id): Path<i64>,
) -> Result<Json<CancelResponse>, Response> {
    let cancelled = state.controller.cancel_run(user_id, run_id).map_err(error_response)?;
    Ok(Json(CancelResponse { cancelled }))
}

/// POST /runs/{id}/validate: judge-model scoring of a finished run.
pub async fn validate_run(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
    Path(run_id): Path<i64>,
) -> Result<Json<ValidationOutcome>, Response> {
    // Ownership first: never score (or acknowledge) someone else's run.
    if state.controller.get_run(user_id, run_id).map_err(error_response)?.is_none() {
        return Err((StatusCode::NOT_FOUND, "run not found").into_response());
    }
    let outcome = state.validation.score_run(run_id).await.map_err(error_response)?;
    Ok(Json(outcome))
}
