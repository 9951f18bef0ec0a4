//! Client configuration, persisted in the store's `data` partition.

use crate::error::{SyncError, SyncResult};
use caixa_store::{Partition, PersistentStore};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// Key under which the configuration is stored.
pub const CONFIG_KEY: &str = "api_config";

/// Configuration for the API client and the sync machinery around it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Primary server (usually the store's LAN server).
    pub base_url: String,

    /// Secondary server, tried once when the primary cannot be reached.
    pub fallback_url: Option<String>,

    /// Per-request timeout in milliseconds.
    pub timeout_ms: u64,

    /// Failed delivery attempts before a queued operation is marked `error`.
    pub retry_attempts: u32,

    /// Informational only: retries happen on the next drain pass, not after a sleep.
    pub retry_delay_ms: u64,

    /// Interval between health probes (seconds).
    pub health_check_interval_secs: u64,

    /// Interval between automatic drain passes (seconds).
    pub sync_interval_secs: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:3333".to_string(),
            fallback_url: None,
            timeout_ms: 10_000,
            retry_attempts: 3,
            retry_delay_ms: 1_000,
            health_check_interval_secs: 30,
            sync_interval_secs: 30,
        }
    }
}

impl ApiConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs)
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_secs)
    }

    /// Checks URLs and numeric bounds.
    pub fn validate(&self) -> SyncResult<()> {
        validate_url("base_url", &self.base_url)?;
        if let Some(fallback) = &self.fallback_url {
            validate_url("fallback_url", fallback)?;
        }
        if self.timeout_ms == 0 {
            return Err(SyncError::Config("timeout_ms must be greater than zero".into()));
        }
        if self.retry_attempts == 0 {
            return Err(SyncError::Config("retry_attempts must be at least 1".into()));
        }
        if self.health_check_interval_secs == 0 || self.sync_interval_secs == 0 {
            return Err(SyncError::Config("intervals must be greater than zero".into()));
        }
        Ok(())
    }

    /// Loads the persisted configuration, or the defaults when none was saved.
    pub async fn load(store: &PersistentStore) -> SyncResult<Self> {
        match store.get_json::<ApiConfig>(Partition::Data, CONFIG_KEY).await? {
            Some(config) => Ok(config),
            None => {
                debug!("no saved api config, using defaults");
                Ok(Self::default())
            }
        }
    }

    /// Validates and persists this configuration.
    pub async fn save(&self, store: &PersistentStore) -> SyncResult<()> {
        self.validate()?;
        store.set_json(Partition::Data, CONFIG_KEY, self, None).await?;
        Ok(())
    }
}

fn validate_url(field: &str, url: &str) -> SyncResult<()> {
    let trimmed = url.trim();
    if trimmed.is_empty() {
        return Err(SyncError::Config(format!("{field} is empty")));
    }
    if !(trimmed.starts_with("http://") || trimmed.starts_with("https://")) {
        return Err(SyncError::Config(format!(
            "{field} must start with http:// or https://, got {trimmed}"
        )));
    }
    Ok(())
}

/// Drops trailing slashes so `base + "/api/x"` never doubles up.
pub(crate) fn normalize_base_url(url: &str) -> String {
    url.trim().trim_end_matches('/').to_string()
}
