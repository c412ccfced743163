use axum::{
    routing::{get, post},
    Router,
};
use tower_http::{
    compression::CompressionLayer,
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use crate::routes;
use crate::state::AppState;

/// The transport surface: exactly three operations, all thin dispatchers
/// onto the indexer. Any other framing (stdio JSON-RPC, a tool protocol)
/// would bind to the same three handlers.
pub fn create_app(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/index", post(routes::index::trigger_index))
        .route("/search", post(routes::search::search))
        .route("/status", get(routes::status::get_status))
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(cors)
        .with_state(state)
}
