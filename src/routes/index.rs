use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::IndexResult;
use crate::state::AppState;

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct TriggerIndexRequest {
    pub force_reindex: bool,
}

/// Kick off a background full scan. Returns 202 immediately on accept; a
/// scan already in flight yields 409 without starting another.
pub async fn trigger_index(
    State(state): State<AppState>,
    Json(request): Json<TriggerIndexRequest>,
) -> IndexResult<(StatusCode, Json<Value>)> {
    state.indexer.spawn_full_scan(request.force_reindex)?;

    Ok((
        StatusCode::ACCEPTED,
        Json(json!({
            "message": "indexing started",
            "force_reindex": request.force_reindex,
        })),
    ))
}
