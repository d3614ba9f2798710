//! Engine configuration, layered from an optional `configuration` file
//! and `APP__`-prefixed environment variables.

use serde::Deserialize;
use std::time::Duration;
use sync_core::config::Common;
use sync_core::{RetryConfig, SyncError};

#[derive(Debug, Deserialize, Clone)]
pub struct EngineConfig {
    #[serde(flatten)]
    pub common: Common,
    pub database: DatabaseConfig,
    pub storage: StorageConfig,
    pub authority: AuthorityConfig,
    #[serde(default)]
    pub sync: SyncSettings,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    /// SQLite is single-writer; one pooled connection serializes writers
    /// and avoids busy-snapshot failures under concurrent ingestion.
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    pub document_path: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AuthorityConfig {
    pub base_url: String,
    #[serde(default = "default_timeout_secs")]
    pub request_timeout_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SyncSettings {
    #[serde(default = "default_max_window_days")]
    pub max_window_days: u32,
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Whether invoices of the payment type produce movements.
    #[serde(default)]
    pub include_payment_invoices: bool,
    /// Whether deferred-payment (PPD) invoices produce movements.
    #[serde(default = "default_true")]
    pub include_deferred: bool,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            max_window_days: default_max_window_days(),
            worker_count: default_worker_count(),
            max_retries: default_max_retries(),
            include_payment_invoices: false,
            include_deferred: true,
        }
    }
}

fn default_max_connections() -> u32 {
    1
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_max_window_days() -> u32 {
    30
}

fn default_worker_count() -> usize {
    4
}

fn default_max_retries() -> u32 {
    3
}

fn default_true() -> bool {
    true
}

impl EngineConfig {
    pub fn load() -> Result<Self, SyncError> {
        sync_core::config::load()
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.authority.request_timeout_secs)
    }

    pub fn retry(&self) -> RetryConfig {
        RetryConfig::with_max_retries(self.sync.max_retries)
    }
}
