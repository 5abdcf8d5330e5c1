//! Search result cache.
//!
//! Pages are keyed by the canonical form of their [`SearchRequest`] and served from memory
//! while younger than the staleness threshold. Concurrent misses for one key share a single
//! upstream fetch.
//!
//! # Flow
//!
//! ```text
//! get(request)
//!       │
//!       ▼
//! key = cache_key(request)
//!       │
//!       ├─→ entry younger than threshold → return cached page
//!       │
//!       ├─→ fetch in flight for key      → await the same fetch
//!       │
//!       └─→ otherwise                    → spawn fetch (with retries), hold the slot,
//!                                          store the page, clear the slot
//! ```
//!
//! Entries are never evicted by size. Staleness gates re-fetching and `invalidate*` drops
//! entries explicitly, e.g. after an inventory sync.

use futures::future::{BoxFuture, FutureExt, Shared};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::CatalogError;
use crate::filter_codec;
use crate::inventory::InventoryProvider;
use crate::models::{SearchRequest, SearchResultPage};

type FetchResult = Result<Arc<SearchResultPage>, CatalogError>;
type SharedFetch = Shared<BoxFuture<'static, FetchResult>>;

struct CacheEntry {
    page: Arc<SearchResultPage>,
    stored_at: Instant,
}

struct InFlight {
    id: u64,
    fetch: SharedFetch,
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<String, CacheEntry>,
    in_flight: HashMap<String, InFlight>,
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    coalesced: AtomicU64,
    fetches: AtomicU64,
    failures: AtomicU64,
}

/// Cache statistics
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    /// Served from a fresh entry
    pub hits: u64,
    /// Started a new fetch
    pub misses: u64,
    /// Attached to a fetch already in flight
    pub coalesced: u64,
    /// Upstream fetches started
    pub fetches: u64,
    /// Fetches that failed after all retries
    pub failures: u64,
    pub entry_count: usize,
    pub in_flight: usize,
}

pub struct ResultCache {
    provider: Arc<dyn InventoryProvider>,
    staleness: Duration,
    state: Arc<Mutex<CacheState>>,
    counters: Arc<Counters>,
    next_fetch_id: AtomicU64,
}

fn lock(state: &Mutex<CacheState>) -> MutexGuard<'_, CacheState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ResultCache {
    /// `provider` is expected to carry its own retry policy (see `RetryingInventory`);
    /// the fetch slot stays held for as long as the provider keeps retrying.
    pub fn new(provider: Arc<dyn InventoryProvider>, staleness: Duration) -> Self {
        Self {
            provider,
            staleness,
            state: Arc::new(Mutex::new(CacheState::default())),
            counters: Arc::new(Counters::default()),
            next_fetch_id: AtomicU64::new(1),
        }
    }

    pub fn staleness(&self) -> Duration {
        self.staleness
    }

    /// Returns the page for `request`, fetching it if missing or stale.
    ///
    /// Must be called within a tokio runtime: the fetch runs as its own task so it completes
    /// and fills the cache even if every caller stops waiting.
    pub async fn get(&self, request: &SearchRequest) -> FetchResult {
        let key = filter_codec::cache_key(request);

        let fetch = {
            let mut state = lock(&self.state);

            if let Some(entry) = state.entries.get(&key) {
                if entry.stored_at.elapsed() < self.staleness {
                    self.counters.hits.fetch_add(1, Ordering::Relaxed);
                    debug!(key = %key, "Result cache hit");
                    return Ok(Arc::clone(&entry.page));
                }
                debug!(key = %key, age = ?entry.stored_at.elapsed(), "Cached page is stale");
            }

            if let Some(in_flight) = state.in_flight.get(&key) {
                self.counters.coalesced.fetch_add(1, Ordering::Relaxed);
                debug!(key = %key, fetch_id = in_flight.id, "Joining in-flight fetch");
                in_flight.fetch.clone()
            } else {
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                let in_flight = self.start_fetch(key.clone(), request.clone());
                let fetch = in_flight.fetch.clone();
                state.in_flight.insert(key, in_flight);
                fetch
            }
        };

        fetch.await
    }

    // Called with the state lock held, so the spawned task cannot observe the slot before
    // it is registered.
    fn start_fetch(&self, key: String, request: SearchRequest) -> InFlight {
        let id = self.next_fetch_id.fetch_add(1, Ordering::Relaxed);
        let provider = Arc::clone(&self.provider);
        let state = Arc::clone(&self.state);
        let counters = Arc::clone(&self.counters);
        debug!(key = %key, fetch_id = id, "Starting upstream fetch");

        let task = tokio::spawn(async move {
            counters.fetches.fetch_add(1, Ordering::Relaxed);
            let result = provider.search(&request).await;

            let mut state = lock(&state);
            // The slot may have been cleared by an invalidation while we were fetching
            let owns_slot = state.in_flight.get(&key).is_some_and(|f| f.id == id);
            if owns_slot {
                state.in_flight.remove(&key);
            }

            match result {
                Ok(page) => {
                    let page = Arc::new(page);
                    if owns_slot {
                        state.entries.insert(
                            key,
                            CacheEntry {
                                page: Arc::clone(&page),
                                stored_at: Instant::now(),
                            },
                        );
                    } else {
                        debug!(key = %key, fetch_id = id, "Key invalidated during fetch, result not cached");
                    }
                    Ok(page)
                }
                Err(e) => {
                    counters.failures.fetch_add(1, Ordering::Relaxed);
                    warn!(key = %key, fetch_id = id, error = %e, "Upstream fetch failed");
                    Err(CatalogError::FetchFailed(e.to_string()))
                }
            }
        });

        let fetch = async move {
            match task.await {
                Ok(result) => result,
                Err(e) => Err(CatalogError::FetchFailed(format!("fetch task aborted: {}", e))),
            }
        }
        .boxed()
        .shared();

        InFlight { id, fetch }
    }

    /// Cached page regardless of age; used to keep the last good page visible after a failure.
    pub fn peek(&self, request: &SearchRequest) -> Option<Arc<SearchResultPage>> {
        let key = filter_codec::cache_key(request);
        lock(&self.state).entries.get(&key).map(|e| Arc::clone(&e.page))
    }

    /// Age of the cached entry for `request`, if any.
    pub fn age(&self, request: &SearchRequest) -> Option<Duration> {
        let key = filter_codec::cache_key(request);
        lock(&self.state).entries.get(&key).map(|e| e.stored_at.elapsed())
    }

    pub fn is_fresh(&self, request: &SearchRequest) -> bool {
        self.age(request).is_some_and(|age| age < self.staleness)
    }

    pub fn invalidate(&self, request: &SearchRequest) -> bool {
        self.invalidate_key(&filter_codec::cache_key(request))
    }

    /// Drops the entry and any in-flight slot for `key`. Waiters already attached to the
    /// fetch still receive its result; the next `get` starts over.
    pub fn invalidate_key(&self, key: &str) -> bool {
        let mut state = lock(&self.state);
        let had_entry = state.entries.remove(key).is_some();
        let had_fetch = state.in_flight.remove(key).is_some();
        debug!(key = %key, had_entry, had_fetch, "Invalidated cache key");
        had_entry || had_fetch
    }

    pub fn invalidate_all(&self) {
        let mut state = lock(&self.state);
        let entries = state.entries.len();
        state.entries.clear();
        state.in_flight.clear();
        debug!(entries, "Invalidated all cached pages");
    }

    pub fn stats(&self) -> CacheStats {
        let state = lock(&self.state);
        CacheStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            coalesced: self.counters.coalesced.load(Ordering::Relaxed),
            fetches: self.counters.fetches.load(Ordering::Relaxed),
            failures: self.counters.failures.load(Ordering::Relaxed),
            entry_count: state.entries.len(),
            in_flight: state.in_flight.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::InventoryError;
    use crate::memory::fixtures::fleet;
    use crate::memory::InMemoryInventory;
    use crate::models::{FilterSet, SortOrder, VehicleSummary};
    use crate::retry::{RetryConfig, RetryingInventory};
    use async_trait::async_trait;
    use std::sync::atomic::AtomicU32;

    const STALENESS: Duration = Duration::from_secs(300);

    fn request(page: u32) -> SearchRequest {
        SearchRequest::new(
            FilterSet::default().with_make("BMW"),
            page,
            20,
            SortOrder::default(),
        )
    }

    fn cache_over(inventory: Arc<InMemoryInventory>) -> ResultCache {
        ResultCache::new(inventory, STALENESS)
    }

    // Fails the first `failures` calls, then answers with an empty page
    struct FlakyInventory {
        failures: u32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl InventoryProvider for FlakyInventory {
        async fn search(&self, request: &SearchRequest) -> Result<SearchResultPage, InventoryError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(10)).await;
            if n < self.failures {
                Err(InventoryError::Transport("connection reset".into()))
            } else {
                Ok(SearchResultPage::empty(request))
            }
        }

        async fn get_by_id(&self, _id: &str) -> Result<Option<VehicleSummary>, InventoryError> {
            Ok(None)
        }

        async fn test_connection(&self) -> bool {
            true
        }
    }

    fn fast_retry(max_retries: u32) -> RetryConfig {
        RetryConfig {
            max_retries,
            initial_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(20),
            factor: 2.0,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_identical_requests_share_one_fetch() {
        let inventory =
            Arc::new(InMemoryInventory::new(fleet(30)).with_latency(Duration::from_millis(50)));
        let cache = cache_over(Arc::clone(&inventory));

        let (first, second) = (request(1), request(1));
        let (a, b) = tokio::join!(cache.get(&first), cache.get(&second));
        let (a, b) = (a.unwrap(), b.unwrap());

        assert_eq!(inventory.search_calls(), 1);
        assert!(Arc::ptr_eq(&a, &b));
        let stats = cache.stats();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.coalesced, 1);
        assert_eq!(stats.in_flight, 0);
        assert_eq!(stats.entry_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn different_keys_fetch_independently() {
        let inventory = Arc::new(InMemoryInventory::new(fleet(30)));
        let cache = cache_over(Arc::clone(&inventory));

        let (first, second) = (request(1), request(2));
        let (a, b) = tokio::join!(cache.get(&first), cache.get(&second));
        assert_eq!(a.unwrap().page(), 1);
        assert_eq!(b.unwrap().page(), 2);
        assert_eq!(inventory.search_calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn fresh_entries_are_served_from_memory() {
        let inventory = Arc::new(InMemoryInventory::new(fleet(30)));
        let cache = cache_over(Arc::clone(&inventory));

        let first = cache.get(&request(1)).await.unwrap();
        tokio::time::advance(Duration::from_secs(299)).await;
        let second = cache.get(&request(1)).await.unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(inventory.search_calls(), 1);
        assert_eq!(cache.stats().hits, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_entry_triggers_exactly_one_refetch() {
        let inventory = Arc::new(InMemoryInventory::new(fleet(30)));
        let cache = cache_over(Arc::clone(&inventory));

        let first = cache.get(&request(1)).await.unwrap();
        tokio::time::advance(STALENESS + Duration::from_secs(1)).await;
        assert!(!cache.is_fresh(&request(1)));

        let refreshed = cache.get(&request(1)).await.unwrap();
        let again = cache.get(&request(1)).await.unwrap();

        assert_eq!(inventory.search_calls(), 2);
        assert!(!Arc::ptr_eq(&first, &refreshed));
        assert!(Arc::ptr_eq(&refreshed, &again));
        assert!(refreshed.fetched_at() >= first.fetched_at());
        assert_eq!(cache.age(&request(1)), Some(Duration::ZERO));
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_are_retried_within_one_slot() {
        let flaky = Arc::new(FlakyInventory {
            failures: 2,
            calls: AtomicU32::new(0),
        });
        let provider = Arc::new(RetryingInventory::new(Arc::clone(&flaky), fast_retry(3)));
        let cache = ResultCache::new(provider, STALENESS);

        let (first, second) = (request(1), request(1));
        let (a, b) = tokio::join!(cache.get(&first), cache.get(&second));
        assert!(a.is_ok());
        assert!(b.is_ok());
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 3);
        assert_eq!(cache.stats().fetches, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_fail_all_waiters_and_clear_the_slot() {
        let flaky = Arc::new(FlakyInventory {
            failures: u32::MAX,
            calls: AtomicU32::new(0),
        });
        let provider = Arc::new(RetryingInventory::new(Arc::clone(&flaky), fast_retry(2)));
        let cache = ResultCache::new(provider, STALENESS);

        let (first, second) = (request(1), request(1));
        let (a, b) = tokio::join!(cache.get(&first), cache.get(&second));
        assert!(matches!(a, Err(CatalogError::FetchFailed(ref m)) if m.contains("connection reset")));
        assert_eq!(a, b);
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 3);

        let stats = cache.stats();
        assert_eq!(stats.in_flight, 0);
        assert_eq!(stats.entry_count, 0);
        assert_eq!(stats.failures, 1);

        // A later call starts a fresh fetch with a fresh retry budget
        assert!(cache.get(&request(1)).await.is_err());
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn invalidation_forces_refetch() {
        let inventory = Arc::new(InMemoryInventory::new(fleet(30)));
        let cache = cache_over(Arc::clone(&inventory));

        cache.get(&request(1)).await.unwrap();
        cache.get(&request(2)).await.unwrap();
        assert!(cache.invalidate(&request(1)));
        assert!(!cache.invalidate(&request(1)));

        cache.get(&request(1)).await.unwrap();
        cache.get(&request(2)).await.unwrap();
        assert_eq!(inventory.search_calls(), 3);

        cache.invalidate_all();
        assert_eq!(cache.stats().entry_count, 0);
        cache.get(&request(2)).await.unwrap();
        assert_eq!(inventory.search_calls(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn result_of_invalidated_fetch_is_not_cached() {
        let inventory =
            Arc::new(InMemoryInventory::new(fleet(30)).with_latency(Duration::from_millis(50)));
        let cache = Arc::new(cache_over(Arc::clone(&inventory)));

        let waiter = {
            let cache = Arc::clone(&cache);
            tokio::spawn(async move { cache.get(&request(1)).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        cache.invalidate_all();

        // The attached waiter still gets its page
        assert!(waiter.await.unwrap().is_ok());
        assert!(cache.peek(&request(1)).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn abandoned_fetch_still_fills_the_cache() {
        let inventory =
            Arc::new(InMemoryInventory::new(fleet(30)).with_latency(Duration::from_millis(50)));
        let cache = cache_over(Arc::clone(&inventory));

        let abandoned = tokio::time::timeout(Duration::from_millis(10), cache.get(&request(1))).await;
        assert!(abandoned.is_err());

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(cache.peek(&request(1)).is_some());
        cache.get(&request(1)).await.unwrap();
        assert_eq!(inventory.search_calls(), 1);
    }
}
