use axum::extract::State;
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::error::{IndexError, IndexResult};
use crate::state::AppState;
use crate::store::SearchHit;

/// Upper bound on requested results.
pub const MAX_TOP_K: usize = 100;

fn default_top_k() -> usize {
    10
}

#[derive(Debug, Deserialize)]
pub struct SearchRequest {
    pub query: String,
    #[serde(default = "default_top_k")]
    pub top_k: usize,
}

#[derive(Debug, Serialize)]
pub struct SearchResponse {
    pub results: Vec<SearchHit>,
}

fn validate(request: &SearchRequest) -> IndexResult<()> {
    if request.query.trim().is_empty() {
        return Err(IndexError::BadRequest("query must not be empty".into()));
    }
    if request.top_k == 0 || request.top_k > MAX_TOP_K {
        return Err(IndexError::BadRequest(format!(
            "top_k must be between 1 and {MAX_TOP_K}"
        )));
    }
    Ok(())
}

/// Synchronous semantic search. Runs outside the writer path; concurrency is
/// bounded by the state's semaphore.
pub async fn search(
    State(state): State<AppState>,
    Json(request): Json<SearchRequest>,
) -> IndexResult<Json<SearchResponse>> {
    validate(&request)?;

    let _permit = state
        .search_permits
        .acquire()
        .await
        .map_err(|e| IndexError::Internal(anyhow::anyhow!("search semaphore closed: {e}")))?;

    let results = state.indexer.search(&request.query, request.top_k).await?;
    Ok(Json(SearchResponse { results }))
}
