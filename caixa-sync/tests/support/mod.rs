//! Shared helpers for tests against a wiremock server.
#![allow(dead_code)]

use caixa_store::PersistentStore;
use caixa_sync::{ApiClient, ApiConfig, ResponseCache};
use std::sync::Arc;
use std::time::Duration;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// Config pointed at `base_url` with short timeouts suitable for tests.
pub fn config_for(base_url: &str) -> ApiConfig {
    ApiConfig {
        base_url: base_url.to_string(),
        timeout_ms: 2_000,
        ..ApiConfig::default()
    }
}

/// A URL nothing listens on: the port is bound once, then released.
pub fn dead_url() -> String {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
    let port = listener.local_addr().expect("addr").port();
    drop(listener);
    format!("http://127.0.0.1:{port}")
}

pub fn memory_store() -> PersistentStore {
    PersistentStore::open_in_memory().expect("in-memory store")
}

pub fn client(store: &PersistentStore, config: ApiConfig) -> Arc<ApiClient> {
    Arc::new(ApiClient::new(config, ResponseCache::new(store.clone())).expect("client"))
}

/// Mounts `GET /api/health -> {"status": "ok"}`.
pub async fn mount_health(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/api/health"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({ "status": "ok" })))
        .mount(server)
        .await;
}

/// Mounts `POST /api/sync` answering `status`.
pub async fn mount_sync(server: &MockServer, status: u16) {
    Mock::given(method("POST"))
        .and(path("/api/sync"))
        .respond_with(ResponseTemplate::new(status))
        .mount(server)
        .await;
}

/// Polls `condition` every 10ms until it holds or `within` elapses.
pub async fn eventually<F>(within: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + within;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
