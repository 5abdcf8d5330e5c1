// Contracts for the upstream inventory collaborators and the REST client that implements them.
// The engine only depends on the traits; HttpInventoryClient is what the binary wires in.

use async_trait::async_trait;
use futures::channel::mpsc;
use futures::stream::{BoxStream, StreamExt};
use reqwest::{Client, Method, RequestBuilder, StatusCode};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

use crate::config::Settings;
use crate::error::InventoryError;
use crate::filter_codec;
use crate::models::{LogLevel, SearchRequest, SearchResultPage, VehicleSummary};

const API_KEY_HEADER: &str = "X-Api-Key";
// Consecutive failed status polls tolerated before a running import is declared lost
const MAX_POLL_FAILURES: u32 = 3;

/// Read access to the dealer inventory. Fallible and possibly slow.
#[async_trait]
pub trait InventoryProvider: Send + Sync {
    async fn search(&self, request: &SearchRequest) -> Result<SearchResultPage, InventoryError>;
    async fn get_by_id(&self, id: &str) -> Result<Option<VehicleSummary>, InventoryError>;
    async fn test_connection(&self) -> bool;
}

// Blanket impl so Arc<dyn InventoryProvider> can be wrapped by decorators
#[async_trait]
impl<P: InventoryProvider + ?Sized> InventoryProvider for Arc<P> {
    async fn search(&self, request: &SearchRequest) -> Result<SearchResultPage, InventoryError> {
        (**self).search(request).await
    }

    async fn get_by_id(&self, id: &str) -> Result<Option<VehicleSummary>, InventoryError> {
        (**self).get_by_id(id).await
    }

    async fn test_connection(&self) -> bool {
        (**self).test_connection().await
    }
}

/// One progress event of an inventory synchronization run.
/// A well-formed stream ends with exactly one `Completed` or `Failed`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncUpdate {
    // Number of records the run will process, once known
    Total(u64),
    // This many records were imported successfully
    Processed(u64),
    // One record could not be imported; the run continues
    ItemFailed { item: String, reason: String },
    Log { level: LogLevel, message: String },
    Completed,
    // Unrecoverable; the whole run failed
    Failed(String),
}

/// Performs the data movement of a sync run and reports progress.
pub trait SyncSource: Send + Sync {
    fn run_sync(&self, operation_id: &str) -> BoxStream<'static, SyncUpdate>;
}

// --- REST implementation ---

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct ListingsResponse {
    items: Vec<VehicleSummary>,
    total_count: u64,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct ImportStarted {
    import_id: String,
}

#[derive(Deserialize, Debug, PartialEq, Eq, Clone, Copy)]
#[serde(rename_all = "lowercase")]
enum ImportState {
    Queued,
    Running,
    Completed,
    Failed,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct ImportItemError {
    item: String,
    reason: String,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct ImportStatus {
    state: ImportState,
    total: Option<u64>,
    #[serde(default)]
    processed: u64,
    #[serde(default)]
    errors: Vec<ImportItemError>,
    message: Option<String>,
}

// Client for the dealer inventory REST API
#[derive(Clone)]
pub struct HttpInventoryClient {
    http_client: Arc<Client>,
    base_url: String,
    api_key: Option<String>,
    dealer_id: Option<String>,
    timeout: Duration,
    poll_interval: Duration,
}

impl HttpInventoryClient {
    pub fn new(http_client: Arc<Client>, settings: &Settings) -> Self {
        Self {
            http_client,
            base_url: settings.inventory_api_url.trim_end_matches('/').to_string(),
            api_key: settings.inventory_api_key.clone(),
            dealer_id: settings.dealer_id.clone(),
            timeout: settings.request_timeout(),
            poll_interval: settings.sync_poll_interval(),
        }
    }

    fn dealer_url(&self, path: &str) -> Result<String, InventoryError> {
        let dealer_id = self
            .dealer_id
            .as_deref()
            .filter(|id| !id.is_empty())
            .ok_or(InventoryError::NotConfigured("dealer_id"))?;
        Ok(format!("{}/v1/dealers/{}/{}", self.base_url, dealer_id, path))
    }

    fn request(&self, method: Method, url: &str) -> RequestBuilder {
        let builder = self
            .http_client
            .request(method, url)
            .timeout(self.timeout)
            .header("Accept", "application/json");
        match &self.api_key {
            Some(key) => builder.header(API_KEY_HEADER, key),
            None => builder,
        }
    }

    async fn start_import(&self, operation_id: &str) -> Result<String, InventoryError> {
        let url = self.dealer_url("imports")?;
        let started: ImportStarted = self
            .request(Method::POST, &url)
            .json(&json!({ "operationId": operation_id }))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(started.import_id)
    }

    async fn import_status(&self, import_id: &str) -> Result<ImportStatus, InventoryError> {
        let url = self.dealer_url(&format!("imports/{}", import_id))?;
        let status = self
            .request(Method::GET, &url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(status)
    }

    // Drives one upstream import and forwards progress as per-item updates
    async fn drive_import(self, operation_id: String, tx: mpsc::UnboundedSender<SyncUpdate>) {
        let send = |update: SyncUpdate| {
            // The tracker dropping the receiver just means nobody is listening anymore
            let _ = tx.unbounded_send(update);
        };

        let import_id = match self.start_import(&operation_id).await {
            Ok(id) => id,
            Err(e) => {
                tracing::error!(operation_id = %operation_id, error = %e, "Failed to start upstream import");
                send(SyncUpdate::Failed(format!("could not start import: {}", e)));
                return;
            }
        };
        tracing::info!(operation_id = %operation_id, import_id = %import_id, "Upstream import started");
        send(SyncUpdate::Log {
            level: LogLevel::Info,
            message: format!("upstream import {} started", import_id),
        });

        let mut total_sent = false;
        let mut processed_seen = 0u64;
        let mut errors_seen = 0usize;
        let mut poll_failures = 0u32;

        loop {
            tokio::time::sleep(self.poll_interval).await;

            let status = match self.import_status(&import_id).await {
                Ok(status) => {
                    poll_failures = 0;
                    status
                }
                Err(e) => {
                    poll_failures += 1;
                    tracing::warn!(import_id = %import_id, attempt = poll_failures, error = %e, "Import status poll failed");
                    if poll_failures >= MAX_POLL_FAILURES {
                        send(SyncUpdate::Failed(format!("lost contact with import {}: {}", import_id, e)));
                        return;
                    }
                    send(SyncUpdate::Log {
                        level: LogLevel::Warn,
                        message: format!("status poll failed: {}", e),
                    });
                    continue;
                }
            };

            if let (false, Some(total)) = (total_sent, status.total) {
                send(SyncUpdate::Total(total));
                total_sent = true;
            }
            if status.processed > processed_seen {
                send(SyncUpdate::Processed(status.processed - processed_seen));
                processed_seen = status.processed;
            }
            for error in status.errors.iter().skip(errors_seen) {
                send(SyncUpdate::ItemFailed {
                    item: error.item.clone(),
                    reason: error.reason.clone(),
                });
            }
            errors_seen = errors_seen.max(status.errors.len());

            match status.state {
                ImportState::Queued | ImportState::Running => continue,
                ImportState::Completed => {
                    send(SyncUpdate::Completed);
                    return;
                }
                ImportState::Failed => {
                    let reason = status
                        .message
                        .unwrap_or_else(|| "upstream import failed".to_string());
                    send(SyncUpdate::Failed(reason));
                    return;
                }
            }
        }
    }
}

#[async_trait]
impl InventoryProvider for HttpInventoryClient {
    async fn search(&self, request: &SearchRequest) -> Result<SearchResultPage, InventoryError> {
        let url = self.dealer_url("listings")?;
        let mut query: Vec<(&str, String)> = filter_codec::canonical_pairs(&request.filters);
        query.push(("page", request.page.to_string()));
        query.push(("pageSize", request.page_size.to_string()));
        query.push(("sort", request.sort.to_string()));
        tracing::debug!(url = %url, ?query, "Searching upstream inventory");

        let response: ListingsResponse = self
            .request(Method::GET, &url)
            .query(&query)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let mut items = response.items;
        items.truncate(request.page_size as usize);
        Ok(SearchResultPage::new(
            items,
            response.total_count,
            request.page,
            request.page_size,
        ))
    }

    async fn get_by_id(&self, id: &str) -> Result<Option<VehicleSummary>, InventoryError> {
        let url = self.dealer_url(&format!("listings/{}", id))?;
        let response = self.request(Method::GET, &url).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let vehicle = response.error_for_status()?.json().await?;
        Ok(Some(vehicle))
    }

    async fn test_connection(&self) -> bool {
        let url = format!("{}/v1/health", self.base_url);
        match self.request(Method::GET, &url).send().await {
            Ok(response) => {
                let ok = response.status().is_success();
                if !ok {
                    tracing::warn!(status = %response.status(), "Inventory API health check failed");
                }
                ok
            }
            Err(e) => {
                tracing::warn!(error = %e, "Inventory API unreachable");
                false
            }
        }
    }
}

impl SyncSource for HttpInventoryClient {
    fn run_sync(&self, operation_id: &str) -> BoxStream<'static, SyncUpdate> {
        let (tx, rx) = mpsc::unbounded();
        tokio::spawn(self.clone().drive_import(operation_id.to_string(), tx));
        rx.boxed()
    }
}
