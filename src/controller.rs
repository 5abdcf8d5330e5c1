// Catalog controller: keeps the location identifier, the draft filter form and the rendered
// page consistent, and owns the pagination state.
//
// Filter edits go draft -> apply -> encode -> location -> cache lookup. Results arrive on a
// background task; a result whose request is no longer the current one is dropped on arrival.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;
use tracing::{debug, info};

use crate::error::CatalogError;
use crate::filter_codec;
use crate::models::{
    FilterSet, SearchRequest, SearchResultPage, SortOrder, SyncOperation, SyncStatusSummary,
    SyncTrigger,
};
use crate::result_cache::ResultCache;
use crate::sync_tracker::SyncTracker;

/// What the results area shows.
#[derive(Debug, Clone, PartialEq)]
pub enum ResultsState {
    Idle,
    // A fetch is pending; the previous page stays on screen meanwhile
    Loading { previous: Option<Arc<SearchResultPage>> },
    Ready(Arc<SearchResultPage>),
    // Recoverable "try again" state
    Failed {
        error: CatalogError,
        last_good: Option<Arc<SearchResultPage>>,
    },
}

impl ResultsState {
    pub fn is_loading(&self) -> bool {
        matches!(self, ResultsState::Loading { .. })
    }

    /// The page to display, including a retained page while loading or after a failure.
    pub fn page(&self) -> Option<&Arc<SearchResultPage>> {
        match self {
            ResultsState::Idle => None,
            ResultsState::Loading { previous } => previous.as_ref(),
            ResultsState::Ready(page) => Some(page),
            ResultsState::Failed { last_good, .. } => last_good.as_ref(),
        }
    }

    pub fn error(&self) -> Option<&CatalogError> {
        match self {
            ResultsState::Failed { error, .. } => Some(error),
            _ => None,
        }
    }
}

struct ViewState {
    location: String,
    filters: FilterSet,
    draft: FilterSet,
    page: u32,
    sort: SortOrder,
    results: ResultsState,
    // Bumped on every issued request; a result tagged with an older value is stale
    generation: u64,
    issued: Option<SearchRequest>,
    // Request the displayed page (ready, previous or last good) was fetched for
    shown: Option<SearchRequest>,
}

// Same filters, sort and page size: pages of one listing share a total
fn same_listing(a: &SearchRequest, b: &SearchRequest) -> bool {
    a.filters == b.filters && a.sort == b.sort && a.page_size == b.page_size
}

pub struct CatalogController {
    cache: Arc<ResultCache>,
    tracker: Arc<SyncTracker>,
    page_size: u32,
    view: Arc<Mutex<ViewState>>,
    updates: Arc<watch::Sender<ResultsState>>,
}

fn lock(view: &Mutex<ViewState>) -> MutexGuard<'_, ViewState> {
    view.lock().unwrap_or_else(PoisonError::into_inner)
}

impl CatalogController {
    pub fn new(cache: Arc<ResultCache>, tracker: Arc<SyncTracker>, page_size: u32) -> Self {
        let (updates, _) = watch::channel(ResultsState::Idle);
        Self {
            cache,
            tracker,
            page_size: page_size.max(1),
            view: Arc::new(Mutex::new(ViewState {
                location: String::new(),
                filters: FilterSet::default(),
                draft: FilterSet::default(),
                page: 1,
                sort: SortOrder::default(),
                results: ResultsState::Idle,
                generation: 0,
                issued: None,
                shown: None,
            })),
            updates: Arc::new(updates),
        }
    }

    // --- Read side ---

    pub fn location(&self) -> String {
        lock(&self.view).location.clone()
    }

    pub fn current_filters(&self) -> FilterSet {
        lock(&self.view).filters.clone()
    }

    pub fn draft(&self) -> FilterSet {
        lock(&self.view).draft.clone()
    }

    pub fn current_page(&self) -> u32 {
        lock(&self.view).page
    }

    pub fn current_sort(&self) -> SortOrder {
        lock(&self.view).sort
    }

    pub fn page_size(&self) -> u32 {
        self.page_size
    }

    pub fn current_request(&self) -> SearchRequest {
        let view = lock(&self.view);
        self.request_for(&view)
    }

    pub fn results(&self) -> ResultsState {
        lock(&self.view).results.clone()
    }

    /// Receives every results transition.
    pub fn subscribe(&self) -> watch::Receiver<ResultsState> {
        self.updates.subscribe()
    }

    /// Waits until the current fetch (if any) has settled and returns the outcome.
    pub async fn settled(&self) -> ResultsState {
        let mut rx = self.subscribe();
        let settled = match rx.wait_for(|state| !state.is_loading()).await {
            Ok(state) => state.clone(),
            // The sender lives in self, so the channel cannot close while we borrow it
            Err(_) => self.results(),
        };
        settled
    }

    pub fn sync_status(&self) -> Option<SyncOperation> {
        self.tracker.get_status()
    }

    pub fn sync_summary(&self) -> SyncStatusSummary {
        self.tracker.summary()
    }

    pub fn sync_updates(&self) -> watch::Receiver<Option<SyncOperation>> {
        self.tracker.subscribe()
    }

    // --- Mutations ---

    /// Loads the view for a location identifier (initial load, back/forward navigation).
    /// A location whose ranges are inverted is rejected and the view is left untouched.
    pub fn navigate(&self, location: &str) -> Result<(), CatalogError> {
        let filters = filter_codec::decode_location(location);
        let canonical = filter_codec::encode_location(&filters)?;
        let mut view = lock(&self.view);
        view.draft = filters.clone();
        self.commit(view, filters, canonical);
        Ok(())
    }

    /// Edits the draft form without touching the location or the results.
    pub fn update_draft(&self, edit: impl FnOnce(&mut FilterSet)) {
        edit(&mut lock(&self.view).draft);
    }

    pub fn apply_draft(&self) -> Result<(), CatalogError> {
        let draft = self.draft();
        self.apply_filters(draft)
    }

    /// Validates and applies filters: new location, page back to 1, results reloaded.
    /// On `InvalidFilterRange` nothing changes, so the form can show the error inline.
    pub fn apply_filters(&self, draft: FilterSet) -> Result<(), CatalogError> {
        let location = filter_codec::encode_location(&draft)?;
        let mut view = lock(&self.view);
        view.draft = draft.clone();
        self.commit(view, draft, location);
        Ok(())
    }

    pub fn clear_filters(&self) {
        let mut view = lock(&self.view);
        view.draft = FilterSet::default();
        self.commit(view, FilterSet::default(), String::new());
    }

    fn commit(&self, mut view: MutexGuard<'_, ViewState>, filters: FilterSet, location: String) {
        if view.location != location {
            info!(location = %location, "Catalog location changed");
        }
        view.filters = filters;
        view.location = location;
        view.page = 1;
        self.load(view);
    }

    /// Moves `delta` pages, clamped to [1, last page]. Returns the resulting page.
    /// The last page is only known from a page of the current listing; until one has loaded
    /// (e.g. while new filters are loading) only the lower bound applies and forward moves
    /// are held.
    pub fn change_page(&self, delta: i64) -> u32 {
        let mut view = lock(&self.view);
        let current = self.request_for(&view);
        let last_page = match (view.shown.as_ref(), view.results.page()) {
            (Some(shown), Some(page)) if same_listing(shown, &current) => page.total_pages(),
            _ => view.page,
        };
        let target = (i64::from(view.page) + delta).clamp(1, i64::from(last_page.max(1)));
        let target = u32::try_from(target).unwrap_or(1);

        if target == view.page {
            debug!(page = target, delta, "Page change clamped to current page");
            return target;
        }
        view.page = target;
        self.load(view);
        target
    }

    /// Applies a new sort order and goes back to page 1.
    pub fn change_sort(&self, order: SortOrder) {
        let mut view = lock(&self.view);
        view.sort = order;
        view.page = 1;
        self.load(view);
    }

    /// "Try again": drops the cached page for the current request and fetches it anew.
    pub fn reload(&self) {
        let mut view = lock(&self.view);
        let request = self.request_for(&view);
        self.cache.invalidate(&request);
        view.issued = None;
        self.load(view);
    }

    pub fn trigger_sync(&self) -> Result<SyncOperation, CatalogError> {
        self.tracker.trigger_sync(SyncTrigger::Manual)
    }

    fn request_for(&self, view: &ViewState) -> SearchRequest {
        SearchRequest::new(view.filters.clone(), view.page, self.page_size, view.sort)
    }

    // Issues the view's current request unless an identical one is already loading or shown
    // fresh. Must be called within a tokio runtime.
    fn load(&self, mut view: MutexGuard<'_, ViewState>) {
        let request = self.request_for(&view);
        if view.issued.as_ref() == Some(&request) {
            let unchanged = match &view.results {
                ResultsState::Loading { .. } => true,
                ResultsState::Ready(_) => self.cache.is_fresh(&request),
                _ => false,
            };
            if unchanged {
                debug!("Request unchanged, nothing to load");
                return;
            }
        }

        view.generation += 1;
        let generation = view.generation;
        let previous = view.results.page().cloned();
        view.issued = Some(request.clone());
        view.results = ResultsState::Loading {
            previous: previous.clone(),
        };
        self.updates.send_replace(view.results.clone());
        drop(view);

        let cache = Arc::clone(&self.cache);
        let shared_view = Arc::clone(&self.view);
        let updates = Arc::clone(&self.updates);
        tokio::spawn(async move {
            let result = cache.get(&request).await;

            let mut view = lock(&shared_view);
            if view.generation != generation {
                debug!(generation, current = view.generation, "Discarding result of superseded request");
                return;
            }
            let results = match result {
                Ok(page) => {
                    view.shown = Some(request);
                    ResultsState::Ready(page)
                }
                Err(error) => {
                    let last_good = match previous {
                        Some(page) => Some(page),
                        None => {
                            let cached = cache.peek(&request);
                            if cached.is_some() {
                                view.shown = Some(request);
                            }
                            cached
                        }
                    };
                    ResultsState::Failed { error, last_good }
                }
            };
            view.results = results;
            updates.send_replace(view.results.clone());
        });
    }
}
