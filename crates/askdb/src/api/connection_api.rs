use axum::extract::State;
use axum::Json;
use serde::Deserialize;
use serde_json::Value;
use tracing::info;

use crate::api::{AppState, CurrentUser};
use crate::connection::{ConnectionKind, ConnectionPayload, Engine, ProbeResult};

#[derive(Debug, Deserialize)]
pub struct TestConnectionRequest {
    pub kind: String,
    #[serde(flatten)]
    pub payload: Value,
}

/// POST /connections/test: probe a candidate connection before it is
/// saved. Always answers 200 with a verdict; malformed payloads are an
/// invalid verdict, not a server error.
pub async fn test_connection(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
    Json(body): Json<TestConnectionRequest>,
) -> Json<ProbeResult> {
    info!("Connection probe ({}) by user {}", body.kind, user_id);

    let kind = match ConnectionKind::parse(&body.kind) {
        Ok(kind) => kind,
        Err(e) => {
            return Json(ProbeResult {
                valid: false,
                message: e.to_string(),
                kind: ConnectionKind::Sqlite,
            })
        }
    };
    let payload = match ConnectionPayload::parse(kind, &body.payload) {
        Ok(payload) => payload,
        Err(e) => return Json(ProbeResult { valid: false, message: e.to_string(), kind }),
    };

    let result = Engine::probe(&payload, &state.datasets_dir, state.connect_timeout).await;
    Json(result)
}
