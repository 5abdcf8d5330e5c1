// In-memory inventory provider.
// Serves a fixed vehicle list with local filtering, sorting and paging; used for
// offline/demo runs (seeded from a JSON file) and as the collaborator in tests.

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use std::cmp::Ordering as CmpOrdering;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use crate::error::InventoryError;
use crate::inventory::{InventoryProvider, SyncSource, SyncUpdate};
use crate::models::{
    FilterSet, LogLevel, SearchRequest, SearchResultPage, SortDirection, SortField,
    VehicleSummary,
};

pub struct InMemoryInventory {
    vehicles: RwLock<Vec<VehicleSummary>>,
    latency: Option<Duration>,
    search_calls: AtomicU64,
}

impl InMemoryInventory {
    pub fn new(vehicles: Vec<VehicleSummary>) -> Self {
        Self {
            vehicles: RwLock::new(vehicles),
            latency: None,
            search_calls: AtomicU64::new(0),
        }
    }

    // Simulated upstream latency per search
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read inventory seed file {}", path.display()))?;
        let vehicles: Vec<VehicleSummary> = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse inventory seed file {}", path.display()))?;
        tracing::info!("Loaded {} vehicles from {}", vehicles.len(), path.display());
        Ok(Self::new(vehicles))
    }

    pub fn replace_all(&self, vehicles: Vec<VehicleSummary>) {
        *self.vehicles.write().unwrap_or_else(PoisonError::into_inner) = vehicles;
    }

    pub fn len(&self) -> usize {
        self.vehicles.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn search_calls(&self) -> u64 {
        self.search_calls.load(Ordering::SeqCst)
    }
}

fn within<T: PartialOrd>(value: T, min: Option<T>, max: Option<T>) -> bool {
    min.is_none_or(|min| value >= min) && max.is_none_or(|max| value <= max)
}

pub fn matches(filters: &FilterSet, vehicle: &VehicleSummary) -> bool {
    (filters.make.is_empty() || filters.make.contains(&vehicle.make))
        && (filters.model.is_empty() || filters.model.contains(&vehicle.model))
        && within(vehicle.price, filters.price_min, filters.price_max)
        && within(vehicle.year, filters.year_min, filters.year_max)
        && within(vehicle.mileage, filters.mileage_min, filters.mileage_max)
        && (filters.fuel_type.is_empty() || filters.fuel_type.contains(&vehicle.fuel_type))
        && (filters.transmission.is_empty() || filters.transmission.contains(&vehicle.transmission))
        && (filters.body_type.is_empty()
            || vehicle.body_type.is_some_and(|b| filters.body_type.contains(&b)))
        && (!filters.is_luxury || vehicle.is_luxury)
        && filters.location_city.as_deref().is_none_or(|city| {
            vehicle
                .location_city
                .as_deref()
                .is_some_and(|v| v.eq_ignore_ascii_case(city))
        })
}

fn compare(field: SortField, a: &VehicleSummary, b: &VehicleSummary) -> CmpOrdering {
    match field {
        SortField::CreatedAt => a.created_at.cmp(&b.created_at),
        SortField::Price => a.price.cmp(&b.price),
        SortField::Year => a.year.cmp(&b.year),
        SortField::Mileage => a.mileage.cmp(&b.mileage),
    }
}

#[async_trait]
impl InventoryProvider for InMemoryInventory {
    async fn search(&self, request: &SearchRequest) -> Result<SearchResultPage, InventoryError> {
        self.search_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }

        let mut hits: Vec<VehicleSummary> = self
            .vehicles
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|v| matches(&request.filters, v))
            .cloned()
            .collect();

        // id as tie-breaker keeps paging deterministic
        hits.sort_by(|a, b| {
            let ordering = compare(request.sort.field, a, b).then_with(|| a.id.cmp(&b.id));
            match request.sort.direction {
                SortDirection::Asc => ordering,
                SortDirection::Desc => ordering.reverse(),
            }
        });

        let total = hits.len() as u64;
        let items = hits
            .into_iter()
            .skip(request.offset() as usize)
            .take(request.page_size as usize)
            .collect();
        Ok(SearchResultPage::new(items, total, request.page, request.page_size))
    }

    async fn get_by_id(&self, id: &str) -> Result<Option<VehicleSummary>, InventoryError> {
        Ok(self
            .vehicles
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|v| v.id == id)
            .cloned())
    }

    async fn test_connection(&self) -> bool {
        true
    }
}

/// Sync source for offline runs: re-reads the seed file and swaps the inventory contents.
pub struct SeedFileSync {
    inventory: Arc<InMemoryInventory>,
    path: PathBuf,
}

impl SeedFileSync {
    pub fn new(inventory: Arc<InMemoryInventory>, path: impl Into<PathBuf>) -> Self {
        Self {
            inventory,
            path: path.into(),
        }
    }
}

async fn reload_seed(inventory: Arc<InMemoryInventory>, path: PathBuf) -> Vec<SyncUpdate> {
    let content = match tokio::fs::read_to_string(&path).await {
        Ok(content) => content,
        Err(e) => return vec![SyncUpdate::Failed(format!("cannot read {}: {}", path.display(), e))],
    };
    let records: Vec<serde_json::Value> = match serde_json::from_str(&content) {
        Ok(records) => records,
        Err(e) => return vec![SyncUpdate::Failed(format!("cannot parse {}: {}", path.display(), e))],
    };

    let mut updates = vec![SyncUpdate::Total(records.len() as u64)];
    let mut vehicles = Vec::with_capacity(records.len());
    for (index, record) in records.into_iter().enumerate() {
        match serde_json::from_value::<VehicleSummary>(record) {
            Ok(vehicle) => vehicles.push(vehicle),
            Err(e) => updates.push(SyncUpdate::ItemFailed {
                item: format!("record {}", index),
                reason: e.to_string(),
            }),
        }
    }
    updates.push(SyncUpdate::Processed(vehicles.len() as u64));
    updates.push(SyncUpdate::Log {
        level: LogLevel::Info,
        message: format!("reloaded inventory from {}", path.display()),
    });
    inventory.replace_all(vehicles);
    updates.push(SyncUpdate::Completed);
    updates
}

impl SyncSource for SeedFileSync {
    fn run_sync(&self, _operation_id: &str) -> BoxStream<'static, SyncUpdate> {
        stream::once(reload_seed(Arc::clone(&self.inventory), self.path.clone()))
            .flat_map(stream::iter)
            .boxed()
    }
}
