// Data structures shared by the codec, the cache, the sync tracker and the HTTP surface
// e.g., FilterSet, SearchRequest, SearchResultPage, SyncOperation

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use strum_macros::{Display, EnumIter, EnumString, IntoStaticStr};

// Closed enum domains used in filters and sorting. The wire names are what appears in the
// location query string and in JSON; serde and strum must agree on them.

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
    Display, EnumString, EnumIter, IntoStaticStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum FuelType {
    Petrol,
    Diesel,
    Electric,
    Hybrid,
    PluginHybrid,
    Lpg,
    Cng,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
    Display, EnumString, EnumIter, IntoStaticStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Transmission {
    Manual,
    Automatic,
    SemiAutomatic,
    Cvt,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
    Display, EnumString, EnumIter, IntoStaticStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum BodyType {
    Sedan,
    Hatchback,
    StationWagon,
    Suv,
    Coupe,
    Convertible,
    Van,
    Pickup,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
    Display, EnumString, EnumIter, IntoStaticStr,
)]
#[serde(rename_all = "camelCase")]
#[strum(serialize_all = "camelCase")]
pub enum SortField {
    CreatedAt,
    Price,
    Year,
    Mileage,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
    Display, EnumString, EnumIter, IntoStaticStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum SortDirection {
    Asc,
    Desc,
}

// Structured search criteria.
// Set-valued fields use an empty set for "no constraint", so a present set is never empty.
// `is_luxury == false` likewise means "no constraint".
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FilterSet {
    pub make: BTreeSet<String>,
    pub model: BTreeSet<String>,
    pub price_min: Option<u32>,
    pub price_max: Option<u32>,
    pub year_min: Option<i32>,
    pub year_max: Option<i32>,
    pub mileage_min: Option<u32>,
    pub mileage_max: Option<u32>,
    pub fuel_type: BTreeSet<FuelType>,
    pub transmission: BTreeSet<Transmission>,
    pub body_type: BTreeSet<BodyType>,
    pub is_luxury: bool,
    pub location_city: Option<String>,
}

impl FilterSet {
    // Builder-style helpers used by the UI draft form and by tests.
    // Blank strings are dropped so the set never holds a value that encodes to nothing.
    pub fn with_make(mut self, make: impl Into<String>) -> Self {
        let make = make.into();
        if !make.is_empty() {
            self.make.insert(make);
        }
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        let model = model.into();
        if !model.is_empty() {
            self.model.insert(model);
        }
        self
    }

    pub fn with_price(mut self, min: Option<u32>, max: Option<u32>) -> Self {
        self.price_min = min;
        self.price_max = max;
        self
    }

    pub fn with_year(mut self, min: Option<i32>, max: Option<i32>) -> Self {
        self.year_min = min;
        self.year_max = max;
        self
    }

    pub fn with_mileage(mut self, min: Option<u32>, max: Option<u32>) -> Self {
        self.mileage_min = min;
        self.mileage_max = max;
        self
    }

    pub fn with_fuel_type(mut self, fuel: FuelType) -> Self {
        self.fuel_type.insert(fuel);
        self
    }

    pub fn with_transmission(mut self, transmission: Transmission) -> Self {
        self.transmission.insert(transmission);
        self
    }

    pub fn with_body_type(mut self, body: BodyType) -> Self {
        self.body_type.insert(body);
        self
    }

    pub fn luxury_only(mut self) -> Self {
        self.is_luxury = true;
        self
    }

    pub fn with_location(mut self, city: impl Into<String>) -> Self {
        let city = city.into();
        self.location_city = if city.is_empty() { None } else { Some(city) };
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SortOrder {
    pub field: SortField,
    pub direction: SortDirection,
}

impl SortOrder {
    pub fn new(field: SortField, direction: SortDirection) -> Self {
        Self { field, direction }
    }
}

impl Default for SortOrder {
    fn default() -> Self {
        Self {
            field: SortField::CreatedAt,
            direction: SortDirection::Desc,
        }
    }
}

// "price:asc" form used by the HTTP surface and the cache key
impl fmt::Display for SortOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.field, self.direction)
    }
}

impl FromStr for SortOrder {
    type Err = strum::ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (field, direction) = match s.split_once(':') {
            Some((field, direction)) => (field, direction),
            None => (s, "desc"),
        };
        Ok(Self {
            field: field.parse()?,
            direction: direction.parse()?,
        })
    }
}

// FilterSet + pagination + sort: the unit of cache keying
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchRequest {
    pub filters: FilterSet,
    pub page: u32,
    pub page_size: u32,
    pub sort: SortOrder,
}

impl SearchRequest {
    // page is 1-based and page_size is positive; zero values are lifted to 1
    pub fn new(filters: FilterSet, page: u32, page_size: u32, sort: SortOrder) -> Self {
        Self {
            filters,
            page: page.max(1),
            page_size: page_size.max(1),
            sort,
        }
    }

    // Zero-based offset of the first item on this page
    pub fn offset(&self) -> u64 {
        u64::from(self.page - 1) * u64::from(self.page_size)
    }
}

// Represents a single vehicle in the catalog list
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VehicleSummary {
    pub id: String,
    pub make: String,
    pub model: String,
    pub year: i32,
    pub price: u32,
    pub mileage: u32,
    pub fuel_type: FuelType,
    pub transmission: Transmission,
    pub body_type: Option<BodyType>,
    pub doors: Option<u8>,
    #[serde(default)]
    pub is_luxury: bool,
    pub location_city: Option<String>,
    pub image_url: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
}

// One immutable page of search results. Built once by `new`, never mutated afterwards;
// the cache shares it behind an Arc.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchResultPage {
    items: Vec<VehicleSummary>,
    total_count: u64,
    page: u32,
    page_size: u32,
    has_more: bool,
    fetched_at: DateTime<Utc>,
}

impl SearchResultPage {
    pub fn new(items: Vec<VehicleSummary>, total_count: u64, page: u32, page_size: u32) -> Self {
        let page = page.max(1);
        let page_size = page_size.max(1);
        Self {
            items,
            total_count,
            page,
            page_size,
            has_more: u64::from(page) * u64::from(page_size) < total_count,
            fetched_at: Utc::now(),
        }
    }

    pub fn empty(request: &SearchRequest) -> Self {
        Self::new(Vec::new(), 0, request.page, request.page_size)
    }

    pub fn items(&self) -> &[VehicleSummary] {
        &self.items
    }

    pub fn total_count(&self) -> u64 {
        self.total_count
    }

    pub fn page(&self) -> u32 {
        self.page
    }

    pub fn page_size(&self) -> u32 {
        self.page_size
    }

    pub fn has_more(&self) -> bool {
        self.has_more
    }

    pub fn fetched_at(&self) -> DateTime<Utc> {
        self.fetched_at
    }

    // ceil(total / page_size), never below 1 so an empty result still has a page to sit on
    pub fn total_pages(&self) -> u32 {
        let pages = self.total_count.div_ceil(u64::from(self.page_size)).max(1);
        u32::try_from(pages).unwrap_or(u32::MAX)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncTrigger {
    Manual,
    Scheduled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl SyncStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SyncStatus::Completed | SyncStatus::Failed)
    }

    pub fn is_active(&self) -> bool {
        matches!(self, SyncStatus::Pending | SyncStatus::Running)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncProgress {
    pub total: u64,
    pub processed: u64,
    pub failed: u64,
}

impl SyncProgress {
    pub fn accounted(&self) -> u64 {
        self.processed + self.failed
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncLogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
}

// One inventory-refresh run. Only the SyncTracker writes these.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncOperation {
    pub id: String,
    pub trigger: SyncTrigger,
    pub status: SyncStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub progress: SyncProgress,
    pub log_entries: Vec<SyncLogEntry>,
    // Reason reported by the sync source when the run failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
}

// Aggregate view shown in the catalog header ("last sync ... N cars available")
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatusSummary {
    pub last_sync: Option<DateTime<Utc>>,
    pub is_running: bool,
    pub total_items: u64,
    pub synced_items: u64,
    pub failed_items: u64,
    pub errors: Vec<String>,
    pub next_sync: Option<DateTime<Utc>>,
}
