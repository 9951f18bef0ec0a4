//! Shared types for sync operations.

use chrono::{DateTime, Utc};
use reqwest::Method;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

/// Error text for a request no server answered (status 0).
pub const UNREACHABLE_MESSAGE: &str = "server unreachable";

/// Error text for HTTP 404.
pub const NOT_FOUND_MESSAGE: &str = "resource not found";

// ── Queue ──

/// Kind of mutation recorded in the queue.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OperationType {
    Insert,
    Update,
    Delete,
}

/// Delivery state of a queued operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationStatus {
    Pending,
    Syncing,
    /// Wire compatibility only: confirmed operations are deleted from the
    /// queue, so no entry is ever stored with this status.
    Synced,
    Error,
}

impl fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OperationStatus::Pending => "pending",
            OperationStatus::Syncing => "syncing",
            OperationStatus::Synced => "synced",
            OperationStatus::Error => "error",
        };
        f.write_str(s)
    }
}

/// A mutation that has not yet been confirmed by the server.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncOperation {
    pub id: String,
    #[serde(rename = "type")]
    pub op_type: OperationType,
    /// Resource/collection the mutation targets (e.g. `"clientes"`).
    pub table: String,
    pub payload: Map<String, Value>,
    /// Client-side id of an entity rendered before the server confirmed it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_id: Option<String>,
    pub status: OperationStatus,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl SyncOperation {
    /// Creates a pending operation with a fresh time-ordered id.
    pub fn new(
        op_type: OperationType,
        table: impl Into<String>,
        payload: Map<String, Value>,
        local_id: Option<String>,
    ) -> Self {
        Self {
            id: Uuid::now_v7().to_string(),
            op_type,
            table: table.into(),
            payload,
            local_id,
            status: OperationStatus::Pending,
            retry_count: 0,
            error_message: None,
            created_at: Utc::now(),
        }
    }

    /// True for entries a drain pass will attempt.
    ///
    /// `Syncing` is included: a drain holds the only in-flight slot, so an
    /// entry still marked `Syncing` when a pass starts was left behind by an
    /// interrupted process.
    pub fn is_drainable(&self) -> bool {
        matches!(
            self.status,
            OperationStatus::Pending | OperationStatus::Error | OperationStatus::Syncing
        )
    }

    /// Puts the entry back to a fresh pending state.
    pub fn reset(&mut self) {
        self.status = OperationStatus::Pending;
        self.retry_count = 0;
        self.error_message = None;
    }
}

/// Per-operation failure reported by a drain pass.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DrainError {
    pub id: String,
    pub error: String,
}

/// Outcome of one drain pass.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DrainResult {
    pub success: bool,
    pub synced_count: usize,
    pub failed_count: usize,
    pub errors: Vec<DrainError>,
    /// True when the pass did nothing because another pass was running.
    #[serde(default)]
    pub skipped: bool,
}

impl DrainResult {
    pub fn skipped() -> Self {
        Self {
            skipped: true,
            ..Self::default()
        }
    }

    pub(crate) fn record_success(&mut self) {
        self.synced_count += 1;
    }

    pub(crate) fn record_failure(&mut self, id: impl Into<String>, error: impl Into<String>) {
        self.failed_count += 1;
        self.success = false;
        self.errors.push(DrainError {
            id: id.into(),
            error: error.into(),
        });
    }
}

impl Default for DrainResult {
    fn default() -> Self {
        Self {
            success: true,
            synced_count: 0,
            failed_count: 0,
            errors: Vec::new(),
            skipped: false,
        }
    }
}

// ── API ──

/// Uniform result of an API call. `status == 0` means no server answered.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiResponse {
    pub data: Option<Value>,
    pub error: Option<String>,
    pub status: u16,
    pub from_cache: bool,
}

impl ApiResponse {
    pub fn success(status: u16, data: Option<Value>) -> Self {
        Self {
            data,
            error: None,
            status,
            from_cache: false,
        }
    }

    pub fn failure(status: u16, error: impl Into<String>) -> Self {
        Self {
            data: None,
            error: Some(error.into()),
            status,
            from_cache: false,
        }
    }

    pub fn unreachable() -> Self {
        Self::failure(0, UNREACHABLE_MESSAGE)
    }

    pub fn cached(data: Value) -> Self {
        Self {
            data: Some(data),
            error: None,
            status: 200,
            from_cache: true,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }

    pub fn is_unreachable(&self) -> bool {
        self.status == 0
    }

    pub fn is_not_found(&self) -> bool {
        self.status == 404
    }

    /// Decodes `data` into `T`. `None` on failure or when there is no payload.
    pub fn decode<T: DeserializeOwned>(&self) -> Option<T> {
        self.data
            .as_ref()
            .and_then(|data| serde_json::from_value(data.clone()).ok())
    }
}

/// Per-call options for [`ApiClient::request`](crate::api_client::ApiClient::request).
#[derive(Clone, Debug)]
pub struct RequestOptions {
    pub method: Method,
    pub body: Option<Value>,
    pub headers: Vec<(String, String)>,
    pub query: Vec<(String, String)>,
    /// Overrides the configured timeout.
    pub timeout: Option<Duration>,
    /// For GET: write a successful response through to the cache with this TTL.
    pub cache_ttl: Option<Duration>,
}

impl RequestOptions {
    pub fn new(method: Method) -> Self {
        Self {
            method,
            body: None,
            headers: Vec::new(),
            query: Vec::new(),
            timeout: None,
            cache_ttl: None,
        }
    }

    pub fn get() -> Self {
        Self::new(Method::GET)
    }

    pub fn post(body: Value) -> Self {
        Self::new(Method::POST).with_body(body)
    }

    pub fn put(body: Value) -> Self {
        Self::new(Method::PUT).with_body(body)
    }

    pub fn patch(body: Value) -> Self {
        Self::new(Method::PATCH).with_body(body)
    }

    pub fn delete() -> Self {
        Self::new(Method::DELETE)
    }

    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_query(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((name.into(), value.into()));
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn cached(mut self, ttl: Duration) -> Self {
        self.cache_ttl = Some(ttl);
        self
    }
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self::get()
    }
}

/// Result of a health probe.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthCheck {
    pub ok: bool,
    pub latency_ms: u64,
    /// Endpoint that last answered, after this probe.
    pub url: String,
    pub using_fallback: bool,
}

// ── Connection ──

/// Connection picture shown to the user. Derived, never persisted.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionState {
    pub is_online: bool,
    pub is_api_available: bool,
    /// Round trip of the last successful probe, in milliseconds.
    pub api_latency: Option<u64>,
    pub last_check: Option<DateTime<Utc>>,
    pub is_checking: bool,
    pub current_url: String,
    pub is_using_fallback: bool,
}

impl ConnectionState {
    pub fn initial(is_online: bool, current_url: impl Into<String>) -> Self {
        Self {
            is_online,
            is_api_available: false,
            api_latency: None,
            last_check: None,
            is_checking: false,
            current_url: current_url.into(),
            is_using_fallback: false,
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        if !self.is_online {
            ConnectionStatus::Offline
        } else if self.is_api_available {
            ConnectionStatus::Online
        } else if self.last_check.is_none() {
            ConnectionStatus::Checking
        } else {
            ConnectionStatus::ServerUnavailable
        }
    }
}

/// Indicator states the UI must keep distinguishable.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    /// No probe has completed yet.
    Checking,
    /// The platform reports no network.
    Offline,
    /// Network is up but the server did not answer.
    ServerUnavailable,
    Online,
}
