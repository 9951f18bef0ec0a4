use caixa_store::{Partition, PersistentStore};
use caixa_sync::config::CONFIG_KEY;
use caixa_sync::{ApiConfig, SyncError};
use pretty_assertions::assert_eq;
use std::time::Duration;

#[test]
fn default_base_url() {
    let config = ApiConfig::default();
    assert_eq!(config.base_url, "http://localhost:3333");
    assert!(config.fallback_url.is_none());
}

#[test]
fn default_timeout_and_retries() {
    let config = ApiConfig::default();
    assert_eq!(config.timeout(), Duration::from_millis(10_000));
    assert_eq!(config.retry_attempts, 3);
    assert_eq!(config.retry_delay_ms, 1_000);
}

#[test]
fn default_intervals() {
    let config = ApiConfig::default();
    assert_eq!(config.health_check_interval(), Duration::from_secs(30));
    assert_eq!(config.sync_interval(), Duration::from_secs(30));
}

#[test]
fn defaults_are_valid() {
    assert!(ApiConfig::default().validate().is_ok());
}

#[test]
fn rejects_non_http_base_url() {
    let config = ApiConfig {
        base_url: "ftp://10.0.0.2".into(),
        ..ApiConfig::default()
    };
    assert!(matches!(config.validate(), Err(SyncError::Config(_))));
}

#[test]
fn rejects_empty_fallback_url() {
    let config = ApiConfig {
        fallback_url: Some("  ".into()),
        ..ApiConfig::default()
    };
    assert!(matches!(config.validate(), Err(SyncError::Config(_))));
}

#[test]
fn rejects_zero_timeout() {
    let config = ApiConfig {
        timeout_ms: 0,
        ..ApiConfig::default()
    };
    assert!(config.validate().is_err());
}

#[test]
fn rejects_zero_retry_attempts() {
    let config = ApiConfig {
        retry_attempts: 0,
        ..ApiConfig::default()
    };
    let err = config.validate().unwrap_err();
    assert!(err.to_string().contains("retry_attempts"));
}

#[test]
fn rejects_zero_interval() {
    let config = ApiConfig {
        sync_interval_secs: 0,
        ..ApiConfig::default()
    };
    assert!(config.validate().is_err());
}

#[test]
fn partial_json_fills_defaults() {
    let config: ApiConfig =
        serde_json::from_str(r#"{"base_url": "http://192.168.0.10:3333", "retry_attempts": 5}"#)
            .unwrap();
    assert_eq!(config.base_url, "http://192.168.0.10:3333");
    assert_eq!(config.retry_attempts, 5);
    assert_eq!(config.timeout_ms, 10_000);
}

// --- Persistence ---

#[tokio::test]
async fn load_without_saved_config_returns_defaults() {
    let store = PersistentStore::open_in_memory().unwrap();
    let config = ApiConfig::load(&store).await.unwrap();
    assert_eq!(config, ApiConfig::default());
}

#[tokio::test]
async fn save_then_load() {
    let store = PersistentStore::open_in_memory().unwrap();
    let config = ApiConfig {
        base_url: "http://192.168.0.10:3333".into(),
        fallback_url: Some("https://caixa.example.com".into()),
        retry_attempts: 2,
        ..ApiConfig::default()
    };
    config.save(&store).await.unwrap();

    assert_eq!(ApiConfig::load(&store).await.unwrap(), config);
    assert!(store.get(Partition::Data, CONFIG_KEY).await.unwrap().is_some());
}

#[tokio::test]
async fn save_rejects_invalid_config() {
    let store = PersistentStore::open_in_memory().unwrap();
    let config = ApiConfig {
        base_url: "localhost".into(),
        ..ApiConfig::default()
    };
    assert!(config.save(&store).await.is_err());
    assert!(store.get(Partition::Data, CONFIG_KEY).await.unwrap().is_none());
}
