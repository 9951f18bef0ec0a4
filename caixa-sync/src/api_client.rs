//! HTTP client for the Caixa server.
//!
//! Every call is bounded by a timeout. When the primary server cannot be
//! reached at all, the same request is retried once against the fallback URL.
//! Outcomes are folded into [`ApiResponse`] instead of being returned as
//! errors, so callers branch on `error`/`status`.

use crate::cache::{cache_key, ResponseCache};
use crate::config::{normalize_base_url, ApiConfig};
use crate::error::SyncResult;
use crate::types::*;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT};
use reqwest::{Client, Method, StatusCode};
use serde_json::Value;
use std::sync::{Mutex, MutexGuard, PoisonError, RwLock};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

pub const HEALTH_ENDPOINT: &str = "/api/health";
pub const SYNC_ENDPOINT: &str = "/api/sync";
pub const HEALTH_TIMEOUT: Duration = Duration::from_secs(5);

/// Which server answered most recently.
struct EndpointState {
    current_url: String,
    using_fallback: bool,
}

/// Outcome of one attempt against one base URL.
enum Attempt {
    Answered { status: StatusCode, body: String },
    Unreachable(String),
}

/// HTTP client with primary/fallback failover.
pub struct ApiClient {
    client: Client,
    config: RwLock<ApiConfig>,
    endpoint: Mutex<EndpointState>,
    cache: ResponseCache,
}

impl ApiClient {
    pub fn new(config: ApiConfig, cache: ResponseCache) -> SyncResult<Self> {
        config.validate()?;
        let client = Client::builder().build()?;
        let current_url = normalize_base_url(&config.base_url);

        Ok(Self {
            client,
            config: RwLock::new(config),
            endpoint: Mutex::new(EndpointState {
                current_url,
                using_fallback: false,
            }),
            cache,
        })
    }

    /// Snapshot of the active configuration.
    pub fn config(&self) -> ApiConfig {
        self.config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Replaces the whole configuration (after validating it).
    pub fn set_config(&self, config: ApiConfig) -> SyncResult<()> {
        config.validate()?;
        let base = normalize_base_url(&config.base_url);
        *self.config.write().unwrap_or_else(PoisonError::into_inner) = config;
        self.record_endpoint(base, false);
        Ok(())
    }

    pub fn set_base_url(&self, url: &str) -> SyncResult<()> {
        let mut config = self.config();
        config.base_url = url.to_string();
        self.set_config(config)
    }

    pub fn set_fallback_url(&self, url: Option<&str>) -> SyncResult<()> {
        let mut config = self.config();
        config.fallback_url = url.map(str::to_string);
        self.set_config(config)
    }

    pub fn set_timeout(&self, timeout: Duration) -> SyncResult<()> {
        let mut config = self.config();
        config.timeout_ms = timeout.as_millis() as u64;
        self.set_config(config)
    }

    /// URL of the server that answered last, and whether it was the fallback.
    pub fn current_endpoint(&self) -> (String, bool) {
        let endpoint = self.lock_endpoint();
        (endpoint.current_url.clone(), endpoint.using_fallback)
    }

    pub fn cache(&self) -> &ResponseCache {
        &self.cache
    }

    // ── Requests ──

    /// Sends a request, failing over to the fallback URL on network errors.
    pub async fn request(&self, endpoint: &str, options: RequestOptions) -> ApiResponse {
        let config = self.config();
        let primary = normalize_base_url(&config.base_url);
        let timeout = options.timeout.unwrap_or_else(|| config.timeout());

        let (base, using_fallback, status, body) =
            match self.attempt(&primary, endpoint, &options, timeout).await {
                Attempt::Answered { status, body } => (primary, false, status, body),
                Attempt::Unreachable(reason) => {
                    let Some(fallback) = config.fallback_url.as_deref().map(normalize_base_url)
                    else {
                        warn!("{} {endpoint} unreachable at {primary}: {reason}", options.method);
                        return ApiResponse::unreachable();
                    };

                    warn!("primary {primary} unreachable ({reason}), retrying on fallback {fallback}");
                    match self.attempt(&fallback, endpoint, &options, timeout).await {
                        Attempt::Answered { status, body } => (fallback, true, status, body),
                        Attempt::Unreachable(reason) => {
                            warn!("fallback {fallback} unreachable too: {reason}");
                            return ApiResponse::unreachable();
                        }
                    }
                }
            };

        self.record_endpoint(base, using_fallback);
        let response = classify(status, &body);
        debug!("{} {endpoint} -> {}", options.method, response.status);

        if response.is_ok() {
            self.after_success(endpoint, &options, &response).await;
        }
        response
    }

    pub async fn get(&self, endpoint: &str) -> ApiResponse {
        self.request(endpoint, RequestOptions::get()).await
    }

    /// GET whose successful response is written through to the cache.
    pub async fn get_cached(&self, endpoint: &str, ttl: Duration) -> ApiResponse {
        self.request(endpoint, RequestOptions::get().cached(ttl)).await
    }

    pub async fn get_with_query(&self, endpoint: &str, query: &[(&str, &str)]) -> ApiResponse {
        let options = query
            .iter()
            .fold(RequestOptions::get(), |opts, (k, v)| opts.with_query(*k, *v));
        self.request(endpoint, options).await
    }

    pub async fn post(&self, endpoint: &str, body: Value) -> ApiResponse {
        self.request(endpoint, RequestOptions::post(body)).await
    }

    pub async fn put(&self, endpoint: &str, body: Value) -> ApiResponse {
        self.request(endpoint, RequestOptions::put(body)).await
    }

    pub async fn patch(&self, endpoint: &str, body: Value) -> ApiResponse {
        self.request(endpoint, RequestOptions::patch(body)).await
    }

    pub async fn delete(&self, endpoint: &str) -> ApiResponse {
        self.request(endpoint, RequestOptions::delete()).await
    }

    /// Reads a cached GET response without touching the network.
    ///
    /// This is the only path that serves cached data; `request` never does.
    pub async fn read_cached(
        &self,
        endpoint: &str,
        query: &[(String, String)],
    ) -> SyncResult<Option<ApiResponse>> {
        let key = cache_key(&Method::GET, endpoint, query);
        Ok(self.cache.get(&key).await?.map(ApiResponse::cached))
    }

    /// Probes the health endpoint with a short timeout.
    pub async fn health_check(&self) -> HealthCheck {
        let started = Instant::now();
        let response = self
            .request(HEALTH_ENDPOINT, RequestOptions::get().with_timeout(HEALTH_TIMEOUT))
            .await;
        let latency_ms = started.elapsed().as_millis() as u64;
        let (url, using_fallback) = self.current_endpoint();

        HealthCheck {
            ok: response.is_ok(),
            latency_ms,
            url,
            using_fallback,
        }
    }

    // ── Internals ──

    async fn attempt(
        &self,
        base: &str,
        endpoint: &str,
        options: &RequestOptions,
        timeout: Duration,
    ) -> Attempt {
        let url = format!("{base}{endpoint}");
        let mut request = self
            .client
            .request(options.method.clone(), &url)
            .headers(build_headers(&options.headers));
        if !options.query.is_empty() {
            request = request.query(&options.query);
        }
        if let Some(body) = &options.body {
            request = request.json(body);
        }

        let call = async {
            let response = request.send().await?;
            let status = response.status();
            let body = response.text().await?;
            Ok::<_, reqwest::Error>((status, body))
        };

        // Dropping the future on timeout aborts the in-flight call.
        match tokio::time::timeout(timeout, call).await {
            Ok(Ok((status, body))) => Attempt::Answered { status, body },
            Ok(Err(e)) => Attempt::Unreachable(e.to_string()),
            Err(_) => Attempt::Unreachable(format!("timed out after {}ms", timeout.as_millis())),
        }
    }

    async fn after_success(&self, endpoint: &str, options: &RequestOptions, response: &ApiResponse) {
        if options.method == Method::GET {
            let (Some(ttl), Some(data)) = (options.cache_ttl, &response.data) else {
                return;
            };
            let key = cache_key(&Method::GET, endpoint, &options.query);
            if let Err(e) = self.cache.put(&key, data, ttl).await {
                warn!("cache write for {key} failed: {e}");
            }
        } else if let Err(e) = self.cache.invalidate_resource(endpoint).await {
            warn!("cache invalidation for {endpoint} failed: {e}");
        }
    }

    fn record_endpoint(&self, url: String, using_fallback: bool) {
        let mut endpoint = self.lock_endpoint();
        endpoint.current_url = url;
        endpoint.using_fallback = using_fallback;
    }

    fn lock_endpoint(&self) -> MutexGuard<'_, EndpointState> {
        self.endpoint.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// JSON defaults plus caller headers; caller values win. Invalid headers are skipped.
fn build_headers(extra: &[(String, String)]) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
    for (name, value) in extra {
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => {
                headers.insert(name, value);
            }
            _ => warn!("skipping invalid header {name}"),
        }
    }
    headers
}

/// Maps an HTTP answer onto the uniform response shape.
fn classify(status: StatusCode, body: &str) -> ApiResponse {
    let code = status.as_u16();

    if status.is_success() {
        let trimmed = body.trim();
        if trimmed.is_empty() {
            return ApiResponse::success(code, None);
        }
        let data = serde_json::from_str(trimmed)
            .unwrap_or_else(|_| Value::String(trimmed.to_string()));
        return ApiResponse::success(code, Some(data));
    }

    if status == StatusCode::NOT_FOUND {
        return ApiResponse::failure(code, NOT_FOUND_MESSAGE);
    }

    let message = serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| v.get("message").and_then(Value::as_str).map(str::to_string))
        .unwrap_or_else(|| format!("Error {code}"));
    ApiResponse::failure(code, message)
}
