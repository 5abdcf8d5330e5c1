//! Retry with exponential backoff for upstream inventory calls.
//!
//! [`RetryingInventory`] wraps any [`InventoryProvider`] so every `search` is retried with its
//! own backoff state. Retries for one request never delay another.

use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::config::Settings;
use crate::error::InventoryError;
use crate::filter_codec;
use crate::inventory::InventoryProvider;
use crate::models::{SearchRequest, SearchResultPage, VehicleSummary};

#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Retries after the first attempt; 3 means at most 4 attempts.
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::query()
    }
}

impl RetryConfig {
    /// Quick retry for catalog queries: 3 retries with fast backoff, then let the caller decide.
    #[must_use]
    pub fn query() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(2),
            factor: 2.0,
        }
    }

    /// Single attempt, no waiting
    #[must_use]
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            factor: 1.0,
        }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            max_retries: settings.fetch_max_retries,
            initial_delay: Duration::from_millis(settings.retry_initial_delay_ms),
            max_delay: Duration::from_millis(settings.retry_max_delay_ms),
            factor: 2.0,
        }
    }

    fn next_delay(&self, current: Duration) -> Duration {
        current.mul_f64(self.factor).min(self.max_delay)
    }
}

/// Retries every error.
pub async fn retry<F, Fut, T, E>(operation_name: &str, config: &RetryConfig, operation: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    retry_if(operation_name, config, operation, |_| true).await
}

/// Retries only errors for which `should_retry` holds; any other error is returned at once.
pub async fn retry_if<F, Fut, T, E, P>(
    operation_name: &str,
    config: &RetryConfig,
    mut operation: F,
    should_retry: P,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    P: Fn(&E) -> bool,
{
    let mut delay = config.initial_delay;
    let mut retries = 0;

    loop {
        match operation().await {
            Ok(val) => {
                if retries > 0 {
                    info!(operation = operation_name, retries, "Operation succeeded after retries");
                }
                return Ok(val);
            }
            Err(err) if !should_retry(&err) => {
                debug!(operation = operation_name, error = %err, "Operation failed, not retryable");
                return Err(err);
            }
            Err(err) => {
                if retries >= config.max_retries {
                    if config.max_retries > 0 {
                        warn!(operation = operation_name, retries, error = %err, "Operation failed, retries exhausted");
                    }
                    return Err(err);
                }
                retries += 1;
                warn!(
                    operation = operation_name,
                    retry = retries,
                    max_retries = config.max_retries,
                    error = %err,
                    ?delay,
                    "Operation failed, retrying"
                );
                sleep(delay).await;
                delay = config.next_delay(delay);
            }
        }
    }
}

// Decorator adding retry to an inventory provider. Only transient upstream errors are retried.
pub struct RetryingInventory<P> {
    inner: P,
    config: RetryConfig,
}

impl<P> RetryingInventory<P> {
    pub fn new(inner: P, config: RetryConfig) -> Self {
        Self { inner, config }
    }
}

#[async_trait]
impl<P: InventoryProvider> InventoryProvider for RetryingInventory<P> {
    async fn search(&self, request: &SearchRequest) -> Result<SearchResultPage, InventoryError> {
        let name = format!("search {}", filter_codec::cache_key(request));
        retry_if(
            &name,
            &self.config,
            || self.inner.search(request),
            InventoryError::is_transient,
        )
        .await
    }

    async fn get_by_id(&self, id: &str) -> Result<Option<VehicleSummary>, InventoryError> {
        let name = format!("get vehicle {}", id);
        retry_if(
            &name,
            &self.config,
            || self.inner.get_by_id(id),
            InventoryError::is_transient,
        )
        .await
    }

    // A connection check reports the current state; retrying would hide it
    async fn test_connection(&self) -> bool {
        self.inner.test_connection().await
    }
}
