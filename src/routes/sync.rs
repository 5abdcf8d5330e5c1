// Handlers for the inventory sync endpoints

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Json},
};
use serde::Deserialize;
use serde_json::json;

use crate::context::CatalogContext;
use crate::error::{AppResult, CatalogError};
use crate::models::SyncTrigger;

#[derive(Debug, Default, Deserialize)]
pub struct TriggerQuery {
    /// Hold the response until the run is terminal
    #[serde(default)]
    pub wait: bool,
}

// A trigger during a running sync is answered with a notice, not an error
pub async fn trigger_sync(
    State(catalog): State<CatalogContext>,
    Query(query): Query<TriggerQuery>,
) -> AppResult<impl IntoResponse> {
    tracing::info!("[HANDLER] /api/sync - Manual sync requested (wait: {}).", query.wait);
    match catalog.tracker().trigger_sync(SyncTrigger::Manual) {
        Ok(operation) if query.wait => {
            let finished = catalog.tracker().wait_for_outcome(&operation.id).await?;
            tracing::info!("[HANDLER] /api/sync - sync {} completed", finished.id);
            Ok((
                StatusCode::OK,
                Json(json!({ "success": true, "started": true, "operation": finished })),
            ))
        }
        Ok(operation) => Ok((
            StatusCode::ACCEPTED,
            Json(json!({ "success": true, "started": true, "operation": operation })),
        )),
        Err(CatalogError::SyncAlreadyInProgress(id)) => {
            tracing::info!("[HANDLER] /api/sync - sync {} already running", id);
            Ok((
                StatusCode::OK,
                Json(json!({
                    "success": true,
                    "started": false,
                    "notice": format!("sync {} is already in progress", id),
                    "operation": catalog.tracker().get_status(),
                })),
            ))
        }
        Err(e) => Err(e.into()),
    }
}

pub async fn sync_status(State(catalog): State<CatalogContext>) -> impl IntoResponse {
    let tracker = catalog.tracker();
    Json(json!({
        "success": true,
        "state": tracker.state(),
        "operation": tracker.get_status(),
    }))
}

pub async fn sync_summary(State(catalog): State<CatalogContext>) -> impl IntoResponse {
    Json(json!({ "success": true, "summary": catalog.tracker().summary() }))
}

pub async fn sync_history(State(catalog): State<CatalogContext>) -> impl IntoResponse {
    Json(json!({ "success": true, "history": catalog.tracker().history() }))
}

pub async fn acknowledge_sync(State(catalog): State<CatalogContext>) -> impl IntoResponse {
    let acknowledged = catalog.tracker().acknowledge();
    Json(json!({
        "success": true,
        "acknowledged": acknowledged.is_some(),
        "operation": acknowledged,
    }))
}
