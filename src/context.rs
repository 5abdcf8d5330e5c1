// Wiring of the engine: one result cache, one sync tracker, and the glue between them.

use anyhow::{Context, Result};
use reqwest::Client;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::Settings;
use crate::controller::CatalogController;
use crate::error::CatalogError;
use crate::inventory::{HttpInventoryClient, InventoryProvider, SyncSource};
use crate::memory::{InMemoryInventory, SeedFileSync};
use crate::models::{SyncStatus, VehicleSummary};
use crate::result_cache::ResultCache;
use crate::retry::{RetryConfig, RetryingInventory};
use crate::sync_tracker::SyncTracker;

/// Shared engine services. Cheap to clone.
#[derive(Clone)]
pub struct CatalogContext {
    settings: Arc<Settings>,
    inventory: Arc<dyn InventoryProvider>,
    cache: Arc<ResultCache>,
    tracker: Arc<SyncTracker>,
}

impl CatalogContext {
    /// Builds the engine over the given collaborators. Inventory reads go through the retry
    /// policy configured in `settings`.
    pub fn new(
        settings: Arc<Settings>,
        inventory: Arc<dyn InventoryProvider>,
        sync_source: Arc<dyn SyncSource>,
    ) -> Self {
        let inventory: Arc<dyn InventoryProvider> = Arc::new(RetryingInventory::new(
            inventory,
            RetryConfig::from_settings(&settings),
        ));
        let cache = Arc::new(ResultCache::new(
            Arc::clone(&inventory),
            settings.cache_staleness(),
        ));
        let tracker = Arc::new(SyncTracker::new(sync_source, settings.sync_history_limit));
        Self {
            settings,
            inventory,
            cache,
            tracker,
        }
    }

    /// Production wiring: the REST client, or the seed file when one is configured.
    pub fn from_settings(settings: Arc<Settings>, http_client: Arc<Client>) -> Result<Self> {
        if let Some(seed) = settings.inventory_seed_file.clone() {
            let inventory = Arc::new(
                InMemoryInventory::from_json_file(&seed)
                    .context("Failed to load offline inventory")?,
            );
            info!("Serving inventory from seed file {}", seed);
            let sync = Arc::new(SeedFileSync::new(Arc::clone(&inventory), seed));
            return Ok(Self::new(settings, inventory, sync));
        }

        if settings.dealer_id.is_none() {
            warn!("No dealer_id configured; inventory requests will fail until it is set");
        }
        let client = Arc::new(HttpInventoryClient::new(http_client, &settings));
        info!("Using inventory API at {}", settings.inventory_api_url);
        Ok(Self::new(settings, client.clone(), client))
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn cache(&self) -> &Arc<ResultCache> {
        &self.cache
    }

    pub fn tracker(&self) -> &Arc<SyncTracker> {
        &self.tracker
    }

    /// A fresh view controller over the shared cache and tracker.
    pub fn controller(&self) -> CatalogController {
        CatalogController::new(
            Arc::clone(&self.cache),
            Arc::clone(&self.tracker),
            self.settings.page_size,
        )
    }

    pub async fn vehicle(&self, id: &str) -> Result<VehicleSummary, CatalogError> {
        match self.inventory.get_by_id(id).await {
            Ok(Some(vehicle)) => Ok(vehicle),
            Ok(None) => Err(CatalogError::NotFound(format!("vehicle {}", id))),
            Err(e) => Err(CatalogError::FetchFailed(e.to_string())),
        }
    }

    pub async fn test_connection(&self) -> bool {
        self.inventory.test_connection().await
    }

    /// Starts the background tasks: cache invalidation after each completed sync and, when an
    /// interval is configured, the sync scheduler.
    pub fn start_background(&self) -> Vec<JoinHandle<()>> {
        let mut tasks = vec![self.spawn_invalidation_listener()];
        if let Some(interval) = self.settings.sync_interval() {
            info!("Scheduled inventory sync every {:?}", interval);
            tasks.push(self.tracker.spawn_scheduler(interval));
        }
        tasks
    }

    fn spawn_invalidation_listener(&self) -> JoinHandle<()> {
        let mut updates = self.tracker.subscribe();
        let cache = Arc::clone(&self.cache);
        tokio::spawn(async move {
            let mut last_invalidated: Option<String> = None;
            while updates.changed().await.is_ok() {
                let completed = updates
                    .borrow_and_update()
                    .as_ref()
                    .filter(|op| op.status == SyncStatus::Completed)
                    .map(|op| op.id.clone());
                let Some(operation_id) = completed else {
                    continue;
                };
                if last_invalidated.as_deref() == Some(operation_id.as_str()) {
                    continue;
                }
                info!(operation_id = %operation_id, "Inventory changed, dropping cached pages");
                cache.invalidate_all();
                last_invalidated = Some(operation_id);
            }
            debug!("Sync tracker closed, invalidation listener stopped");
        })
    }
}
