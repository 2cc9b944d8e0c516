//! HTTP contract consumed by the frontend facade.
//!
//! Authentication lives outside the core: by the time a request gets
//! here the facade has validated the JWT and injected `x-user-id`.
//! Handlers only enforce ownership.

pub mod connection_api;
pub mod run_api;
pub mod session_api;

use async_trait::async_trait;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::controller::RunController;
use crate::error::CoreError;
use crate::store::{MetaStore, Pagination};
use crate::validation::ValidationHarness;

#[derive(Clone)]
pub struct AppState {
    pub controller: Arc<RunController>,
    pub store: Arc<MetaStore>,
    pub validation: Arc<ValidationHarness>,
    pub datasets_dir: PathBuf,
    pub connect_timeout: Duration,
}

/// Shared envelope for every paginated listing.
#[derive(Debug, Serialize)]
pub struct Paginated<T> {
    pub items: Vec<T>,
    pub pagination: Pagination,
}

/// The authenticated user id, injected by the facade after JWT
/// validation.
pub struct CurrentUser(pub i64);

#[async_trait]
impl<S> FromRequestParts<S> for CurrentUser
where
    S: Send + Sync,
{
    type Rejection = Response;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .headers
            .get("x-user-id")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<i64>().ok())
            .map(CurrentUser)
            .ok_or_else(|| {
                (StatusCode::UNAUTHORIZED, "missing or invalid x-user-id").into_response()
            })
    }
}

/// Maps core errors onto HTTP signals: caller mistakes are 4xx, broker
/// saturation is the transient 503 the client retries, everything else
/// is a 500.
pub fn error_response(e: CoreError) -> Response {
    let status = match &e {
        CoreError::InvalidInput(_) => StatusCode::BAD_REQUEST,
        CoreError::NotFound { .. } => StatusCode::NOT_FOUND,
        CoreError::BrokerSaturated => StatusCode::SERVICE_UNAVAILABLE,
        CoreError::Connect(_) | CoreError::Query(_) | CoreError::Schema(_) => {
            StatusCode::UNPROCESSABLE_ENTITY
        }
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, e.to_string()).into_response()
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(crate::metrics::get_metrics))
        .route("/connections/test", post(connection_api::test_connection))
        .route("/agents/:id/run", post(run_api::create_run))
        .route("/agents/:id/chat-sessions", get(session_api::list_sessions))
        .route("/runs", get(run_api::list_runs))
        .route("/runs/:id", get(run_api::get_run))
        .route("/runs/:id/cancel", post(run_api::cancel_run))
        .route("/runs/:id/validate", post(run_api::validate_run))
        .route("/chat-sessions", post(session_api::create_session))
        .route(
            "/chat-sessions/:id",
            get(session_api::get_session)
                .put(session_api::update_session)
                .delete(session_api::delete_session),
        )
        .route("/chat-sessions/:id/messages", get(session_api::list_messages))
        .with_state(state)
}

async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}
