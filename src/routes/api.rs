// Handlers for the catalog endpoints

use axum::{
    extract::{Path, RawQuery, State},
    response::{IntoResponse, Json},
};
use serde::Serialize;
use serde_json::json;

use crate::context::CatalogContext;
use crate::error::{AppResult, CatalogError};
use crate::filter_codec;
use crate::models::{SearchRequest, SearchResultPage, SortOrder};

pub const MAX_PAGE_SIZE: u32 = 100;

const PAGE_PARAM: &str = "page";
const PAGE_SIZE_PARAM: &str = "pageSize";
const SORT_PARAM: &str = "sort";

/// A catalog listing request as it arrives on the query string: the filter parameters of the
/// location identifier plus `page`, `pageSize` and `sort`.
#[derive(Debug, Clone, PartialEq)]
pub struct VehicleListQuery {
    pub request: SearchRequest,
    // Canonical location of the filters alone
    pub location: String,
}

impl VehicleListQuery {
    /// Malformed paging or sort values fall back to defaults like unknown filter values do;
    /// only inverted ranges are rejected.
    pub fn parse(raw: Option<&str>, default_page_size: u32) -> Result<Self, CatalogError> {
        let mut params = filter_codec::parse_location(raw.unwrap_or(""));
        let page = params
            .remove(PAGE_PARAM)
            .and_then(|p| p.parse::<u32>().ok())
            .unwrap_or(1);
        let page_size = params
            .remove(PAGE_SIZE_PARAM)
            .and_then(|p| p.parse::<u32>().ok())
            .unwrap_or(default_page_size)
            .clamp(1, MAX_PAGE_SIZE);
        let sort = params
            .remove(SORT_PARAM)
            .and_then(|s| s.parse::<SortOrder>().ok())
            .unwrap_or_default();

        let filters = filter_codec::decode(params);
        let location = filter_codec::encode_location(&filters)?;
        Ok(Self {
            request: SearchRequest::new(filters, page, page_size, sort),
            location,
        })
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct VehiclePageResponse<'a> {
    success: bool,
    location: String,
    sort: String,
    total_pages: u32,
    #[serde(flatten)]
    page: &'a SearchResultPage,
}

pub async fn list_vehicles(
    State(catalog): State<CatalogContext>,
    RawQuery(query): RawQuery,
) -> AppResult<impl IntoResponse> {
    tracing::debug!("[HANDLER] /api/vehicles - query: {:?}", query);
    let parsed = VehicleListQuery::parse(query.as_deref(), catalog.settings().page_size)?;

    let page = catalog.cache().get(&parsed.request).await?;
    tracing::info!(
        "[HANDLER] /api/vehicles - location '{}', page {}: {} of {} vehicles",
        parsed.location,
        page.page(),
        page.items().len(),
        page.total_count()
    );

    let body = VehiclePageResponse {
        success: true,
        location: parsed.location,
        sort: parsed.request.sort.to_string(),
        total_pages: page.total_pages(),
        page: &page,
    };
    Ok(Json(serde_json::to_value(&body).map_err(anyhow::Error::from)?))
}

pub async fn get_vehicle(
    State(catalog): State<CatalogContext>,
    Path(id): Path<String>,
) -> AppResult<impl IntoResponse> {
    tracing::info!("[HANDLER] /api/vehicles/{} - Request received.", id);
    let vehicle = catalog.vehicle(&id).await?;
    Ok(Json(json!({ "success": true, "vehicle": vehicle })))
}

pub async fn health(State(catalog): State<CatalogContext>) -> impl IntoResponse {
    let upstream = catalog.test_connection().await;
    if !upstream {
        tracing::warn!("[HANDLER] /api/health - inventory provider unreachable");
    }
    Json(json!({ "success": true, "upstream": upstream }))
}

pub async fn cache_stats(State(catalog): State<CatalogContext>) -> impl IntoResponse {
    Json(json!({
        "success": true,
        "stalenessSecs": catalog.cache().staleness().as_secs(),
        "stats": catalog.cache().stats(),
    }))
}
