// Settings loaded with the 'config' crate from defaults, an optional config.toml,
// and CATALOG__-prefixed environment variables (e.g. CATALOG__DEALER_ID).

use anyhow::Result;
use config::{Config, Environment, File};
use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    #[serde(default = "default_server_address")]
    pub server_address: String,

    // Upstream inventory provider
    #[serde(default = "default_inventory_api_url")]
    pub inventory_api_url: String,
    #[serde(default)]
    pub inventory_api_key: Option<String>,
    #[serde(default)]
    pub dealer_id: Option<String>,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    // JSON vehicle list served instead of the REST API (offline/demo mode)
    #[serde(default)]
    pub inventory_seed_file: Option<String>,

    // Catalog paging & result cache
    #[serde(default = "default_page_size")]
    pub page_size: u32,
    #[serde(default = "default_cache_staleness_secs")]
    pub cache_staleness_secs: u64,
    #[serde(default = "default_fetch_max_retries")]
    pub fetch_max_retries: u32,
    #[serde(default = "default_retry_initial_delay_ms")]
    pub retry_initial_delay_ms: u64,
    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,

    // Inventory sync
    #[serde(default = "default_sync_history_limit")]
    pub sync_history_limit: usize,
    #[serde(default)]
    pub sync_interval_secs: Option<u64>, // None disables scheduled syncs
    #[serde(default = "default_sync_poll_interval_ms")]
    pub sync_poll_interval_ms: u64,
}

fn default_server_address() -> String { "127.0.0.1:3000".to_string() }
fn default_inventory_api_url() -> String { "https://api.autoscout24.com".to_string() }
fn default_request_timeout_secs() -> u64 { 10 }
fn default_page_size() -> u32 { 20 }
fn default_cache_staleness_secs() -> u64 { 5 * 60 }
fn default_fetch_max_retries() -> u32 { 3 }
fn default_retry_initial_delay_ms() -> u64 { 200 }
fn default_retry_max_delay_ms() -> u64 { 2000 }
fn default_sync_history_limit() -> usize { 10 }
fn default_sync_poll_interval_ms() -> u64 { 1000 }

impl Default for Settings {
    fn default() -> Self {
        Self {
            server_address: default_server_address(),
            inventory_api_url: default_inventory_api_url(),
            inventory_api_key: None,
            dealer_id: None,
            request_timeout_secs: default_request_timeout_secs(),
            inventory_seed_file: None,
            page_size: default_page_size(),
            cache_staleness_secs: default_cache_staleness_secs(),
            fetch_max_retries: default_fetch_max_retries(),
            retry_initial_delay_ms: default_retry_initial_delay_ms(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
            sync_history_limit: default_sync_history_limit(),
            sync_interval_secs: None,
            sync_poll_interval_ms: default_sync_poll_interval_ms(),
        }
    }
}

impl Settings {
    pub fn new() -> Result<Self> {
        dotenv::dotenv().ok(); // Load .env file if present

        let builder = Config::builder()
            // Load from a configuration file (e.g., config.toml)
            .add_source(File::with_name("config").required(false))
            // Load from environment variables (e.g., CATALOG__PAGE_SIZE)
            .add_source(
                Environment::with_prefix("CATALOG")
                    .prefix_separator("__")
                    .separator("__"),
            );

        let settings = builder.build()?.try_deserialize()?;
        Ok(settings)
    }

    pub fn cache_staleness(&self) -> Duration {
        Duration::from_secs(self.cache_staleness_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn sync_interval(&self) -> Option<Duration> {
        self.sync_interval_secs
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }

    pub fn sync_poll_interval(&self) -> Duration {
        Duration::from_millis(self.sync_poll_interval_ms)
    }
}
