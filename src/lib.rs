// Dealer catalog engine: filter codec, cached inventory search, tracked inventory sync,
// and the HTTP surface exposing them.

use axum::extract::FromRef;

pub mod config;
pub mod context;
pub mod controller;
pub mod error;
pub mod filter_codec;
pub mod inventory;
pub mod memory;
pub mod models;
pub mod result_cache;
pub mod retry;
pub mod routes;
pub mod sync_tracker;

use crate::context::CatalogContext;

// Application state shared by the handlers
#[derive(Clone, FromRef)]
pub struct AppState {
    pub catalog: CatalogContext,
}

impl AppState {
    pub fn new(catalog: CatalogContext) -> Self {
        Self { catalog }
    }
}
