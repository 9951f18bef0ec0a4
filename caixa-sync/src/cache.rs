//! Read-through response cache over the store's `cache` partition.
//!
//! Entries are written only as a side effect of successful live GETs. The API
//! client never answers a failed request from here; reading the cache is an
//! explicit, separate call.

use crate::error::SyncResult;
use caixa_store::{Partition, PersistentStore};
use reqwest::Method;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

/// Builds the deterministic cache key for a request.
///
/// Query pairs are sorted so `?a=1&b=2` and `?b=2&a=1` share one entry.
pub fn cache_key(method: &Method, endpoint: &str, query: &[(String, String)]) -> String {
    let mut key = format!("{}:{}", method.as_str(), endpoint);
    if !query.is_empty() {
        let mut pairs: Vec<String> = query
            .iter()
            .map(|(k, v)| format!("{}={}", urlencoding::encode(k), urlencoding::encode(v)))
            .collect();
        pairs.sort();
        key.push('?');
        key.push_str(&pairs.join("&"));
    }
    key
}

/// Root of a resource path: `/api/produtos/42?x=1` becomes `/api/produtos`.
fn resource_root(endpoint: &str) -> &str {
    let path = endpoint.split('?').next().unwrap_or(endpoint);
    let mut slashes = path.match_indices('/').map(|(i, _)| i);
    // Skip the leading slash and the one after "api".
    match (slashes.next(), slashes.next(), slashes.next()) {
        (Some(0), Some(_), Some(third)) => &path[..third],
        _ => path,
    }
}

/// TTL cache for GET responses.
#[derive(Clone, Debug)]
pub struct ResponseCache {
    store: PersistentStore,
}

impl ResponseCache {
    pub fn new(store: PersistentStore) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &PersistentStore {
        &self.store
    }

    pub async fn get(&self, key: &str) -> SyncResult<Option<Value>> {
        Ok(self.store.get(Partition::Cache, key).await?)
    }

    pub async fn put(&self, key: &str, value: &Value, ttl: Duration) -> SyncResult<()> {
        self.store.set(Partition::Cache, key, value, Some(ttl)).await?;
        Ok(())
    }

    pub async fn invalidate(&self, key: &str) -> SyncResult<bool> {
        Ok(self.store.delete(Partition::Cache, key).await?)
    }

    /// Drops every cached GET under the resource `endpoint` belongs to, so a
    /// write to `/api/produtos/42` also evicts the `/api/produtos` listing.
    pub async fn invalidate_resource(&self, endpoint: &str) -> SyncResult<usize> {
        let root = resource_root(endpoint);
        let prefix = format!("{}:{}", Method::GET.as_str(), root);

        let mut removed = 0;
        for (key, _) in self.store.list_all(Partition::Cache).await? {
            let Some(rest) = key.strip_prefix(&prefix) else {
                continue;
            };
            if rest.is_empty() || rest.starts_with('/') || rest.starts_with('?') {
                if self.store.delete(Partition::Cache, &key).await? {
                    removed += 1;
                }
            }
        }
        if removed > 0 {
            debug!("evicted {removed} cached responses under {root}");
        }
        Ok(removed)
    }

    pub async fn clear(&self) -> SyncResult<()> {
        self.store.clear(Partition::Cache).await?;
        Ok(())
    }
}
