use std::path::Path;

use axum::extract::{Query, State};
use axum::Json;
use serde::Deserialize;

use crate::error::{IndexError, IndexResult};
use crate::state::AppState;
use crate::status::ProjectStatus;

#[derive(Debug, Deserialize, Default)]
pub struct StatusParams {
    /// When provided, must name the configured project root.
    pub project_path: Option<String>,
}

pub async fn get_status(
    State(state): State<AppState>,
    Query(params): Query<StatusParams>,
) -> IndexResult<Json<ProjectStatus>> {
    if let Some(requested) = &params.project_path {
        if !is_configured_root(requested, &state.settings.project_root) {
            return Err(IndexError::NotFound(requested.clone()));
        }
    }
    Ok(Json(state.indexer.status_snapshot()))
}

fn is_configured_root(requested: &str, configured: &Path) -> bool {
    if Path::new(requested) == configured {
        return true;
    }
    // Tolerate non-canonical spellings of the same directory.
    dunce::canonicalize(requested)
        .map(|c| c == configured)
        .unwrap_or(false)
}
