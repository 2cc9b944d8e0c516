use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use tracing::info;

use crate::api::{error_response, AppState, CurrentUser, Paginated};
use crate::store::{ChatSession, MessageRecord, SessionStatus};

#[derive(Debug, Deserialize)]
pub struct CreateSessionRequest {
    pub agent_id: i64,
    pub title: Option<String>,
}

/// POST /chat-sessions
pub async fn create_session(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
    Json(body): Json<CreateSessionRequest>,
) -> Result<(StatusCode, Json<ChatSession>), Response> {
    let owns = state
        .store
        .agents
        .user_owns_agent(user_id, body.agent_id)
        .map_err(error_response)?;
    if !owns {
        return Err((StatusCode::BAD_REQUEST, "unknown agent or not owner").into_response());
    }
    let title = body
        .title
        .unwrap_or_else(|| format!("Conversation {}", chrono::Utc::now().format("%Y-%m-%d %H:%M")));
    let session = state
        .store
        .sessions
        .create_session(user_id, body.agent_id, &title)
        .map_err(error_response)?;
    info!("Session {} created for agent {}", session.id, body.agent_id);
    Ok((StatusCode::CREATED, Json(session)))
}

/// GET /chat-sessions/{id}
pub async fn get_session(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
    Path(session_id): Path<i64>,
) -> Result<Json<ChatSession>, Response> {
    match state.store.sessions.get_session(session_id).map_err(error_response)? {
        Some(session) if session.user_id == user_id => Ok(Json(session)),
        _ => Err((StatusCode::NOT_FOUND, "chat session not found").into_response()),
    }
}

#[derive(Debug, Deserialize)]
pub struct PageQuery {
    #[serde(default = "default_page")]
    pub page: u32,
    #[serde(default = "default_per_page")]
    pub per_page: u32,
}

fn default_page() -> u32 {
    1
}

fn default_per_page() -> u32 {
    20
}

/// GET /agents/{id}/chat-sessions
pub async fn list_sessions(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
    Path(agent_id): Path<i64>,
    Query(query): Query<PageQuery>,
) -> Result<Json<Paginated<ChatSession>>, Response> {
    let (items, pagination) = state
        .store
        .sessions
        .list_for_agent(agent_id, user_id, query.page, query.per_page)
        .map_err(error_response)?;
    Ok(Json(Paginated { items, pagination }))
}

/// GET /chat-sessions/{id}/messages: newest page first.
pub async fn list_messages(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
    Path(session_id): Path<i64>,
    Query(query): Query<PageQuery>,
) -> Result<Json<Paginated<MessageRecord>>, Response> {
    let owned = state
        .store
        .sessions
        .session_owned_by(session_id, user_id)
        .map_err(error_response)?;
    if !owned {
        return Err((StatusCode::NOT_FOUND, "chat session not found").into_response());
    }
    let (items, pagination) = state
        .store
        .sessions
        .list_messages(session_id, query.page, query.per_page)
        .map_err(error_response)?;
    Ok(Json(Paginated { items, pagination }))
}

#[derive(Debug, Deserialize)]
pub struct UpdateSessionRequest {
    pub title: Option<String>,
    pub status: Option<String>,
}

/// PUT /chat-sessions/{id}
pub async fn update_session(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
    Path(session_id): Path<i64>,
    Json(body): Json<UpdateSessionRequest>,
) -> Result<Json<ChatSession>, Response> {
    let owned = state
        .store
        .sessions
        .session_owned_by(session_id, user_id)
        .map_err(error_response)?;
    if !owned {
        return Err((StatusCode::NOT_FOUND, "chat session not found").into_response());
    }
    let status = body.status.as_deref().map(SessionStatus::parse);
    state
        .store
        .sessions
        .update_session(session_id, body.title.as_deref(), status)
        .map_err(error_response)?;
    match state.store.sessions.get_session(session_id).map_err(error_response)? {
        Some(session) => Ok(Json(session)),
        None => Err((StatusCode::NOT_FOUND, "chat session not found").into_response()),
    }
}

/// DELETE /chat-sessions/{id}: messages and embeddings cascade.
pub async fn delete_session(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
    Path(session_id): Path<i64>,
) -> Result<StatusCode, Response> {
    let owned = state
        .store
        .sessions
        .session_owned_by(session_id, user_id)
        .map_err(error_response)?;
    if !owned {
        return Err((StatusCode::NOT_FOUND, "chat session not found").into_response());
    }
    state.store.sessions.delete_session(session_id).map_err(error_response)?;
    Ok(StatusCode::NO_CONTENT)
}
