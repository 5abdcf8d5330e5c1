// Route definitions

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::trace::TraceLayer;

use crate::AppState;

mod api;
mod sync;

pub use api::{VehicleListQuery, MAX_PAGE_SIZE};

pub fn create_router(app_state: AppState) -> Router {
    let api_router = Router::new()
        .route("/vehicles", get(api::list_vehicles))
        .route("/vehicles/:id", get(api::get_vehicle))
        .route("/health", get(api::health))
        .route("/cache/stats", get(api::cache_stats))
        .route("/sync", post(sync::trigger_sync))
        .route("/sync/status", get(sync::sync_status))
        .route("/sync/summary", get(sync::sync_summary))
        .route("/sync/history", get(sync::sync_history))
        .route("/sync/ack", post(sync::acknowledge_sync))
        .with_state(app_state);

    Router::new()
        .nest("/api", api_router)
        .layer(TraceLayer::new_for_http())
}
