//! Cache API: named stores of request → response snapshots.
//!
//! Storage goes through [`CacheBackend`]; each key is written atomically and
//! concurrent writes to the same key resolve last-write-wins.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use bytes::Bytes;
use hashbrown::HashMap;
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use pulse_common::{PulseError, Result};
use pulse_net::{Request, Response, ResponseType};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, trace};
use url::Url;

// ==================== Descriptor ====================

/// Identity of a cached entry.
///
/// Only GET requests are cached, and they are keyed by URL alone, so no
/// request headers take part in matching.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestDescriptor {
    pub method: String,
    pub url: String,
}

impl RequestDescriptor {
    /// Descriptor for a GET of `url`. Fragments never reach the server and
    /// are dropped.
    pub fn get(url: &Url) -> Self {
        let mut url = url.clone();
        url.set_fragment(None);
        Self {
            method: Method::GET.to_string(),
            url: url.into(),
        }
    }

    pub fn from_request(request: &Request) -> Self {
        let mut descriptor = Self::get(&request.url);
        descriptor.method = request.method.to_string();
        descriptor
    }

    /// Storage key.
    pub fn key(&self) -> String {
        format!("{} {}", self.method, self.url)
    }
}

// ==================== Entry ====================

/// A stored response snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub descriptor: RequestDescriptor,

    /// Response status.
    pub status: u16,

    /// Response headers.
    pub headers: HashMap<String, String>,

    /// Response body.
    #[serde(with = "body_base64")]
    pub body: Vec<u8>,

    /// Cached at timestamp (ms since epoch).
    pub cached_at: u64,

    /// Stored by the install-time precache rather than at runtime.
    #[serde(default)]
    pub precached: bool,
}

impl CacheEntry {
    /// Snapshot a live response. The entry owns a copy of everything it needs.
    pub fn from_response(descriptor: RequestDescriptor, response: &Response) -> Self {
        let headers = response
            .headers
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();

        Self {
            descriptor,
            status: response.status.as_u16(),
            headers,
            body: response.body.to_vec(),
            cached_at: now_millis(),
            precached: false,
        }
    }

    pub fn precached(mut self) -> Self {
        self.precached = true;
        self
    }

    pub fn key(&self) -> String {
        self.descriptor.key()
    }

    pub fn age(&self) -> Duration {
        Duration::from_millis(now_millis().saturating_sub(self.cached_at))
    }

    /// Whether a lookup may use this entry. Precached entries never expire.
    pub fn is_fresh(&self, max_age: Option<Duration>) -> bool {
        match max_age {
            Some(limit) if !self.precached => self.age() <= limit,
            _ => true,
        }
    }

    /// Rebuild a response for `request` from the snapshot.
    pub fn to_response(&self, request: &Request) -> Response {
        let mut headers = HeaderMap::new();
        for (name, value) in &self.headers {
            if let (Ok(n), Ok(v)) = (
                HeaderName::try_from(name.as_str()),
                HeaderValue::try_from(value.as_str()),
            ) {
                headers.insert(n, v);
            }
        }

        Response {
            request_id: request.id,
            url: request.url.clone(),
            status: StatusCode::from_u16(self.status).unwrap_or(StatusCode::OK),
            headers,
            response_type: ResponseType::Basic,
            body: Bytes::from(self.body.clone()),
        }
    }
}

pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

mod body_base64 {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(body: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(body))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

// ==================== Backend ====================

/// Storage underneath [`CacheStorage`].
#[async_trait]
pub trait CacheBackend: Send + Sync {
    /// Create a store; no-op if it exists.
    async fn create_store(&self, name: &str) -> Result<()>;

    async fn has_store(&self, name: &str) -> Result<bool>;

    async fn store_names(&self) -> Result<Vec<String>>;

    /// Delete a store and all its entries. Returns whether it existed.
    async fn delete_store(&self, name: &str) -> Result<bool>;

    async fn get(&self, store: &str, key: &str) -> Result<Option<CacheEntry>>;

    /// Insert or replace an entry. Fails if the store does not exist.
    async fn put(&self, store: &str, entry: CacheEntry) -> Result<()>;

    async fn delete(&self, store: &str, key: &str) -> Result<bool>;

    async fn entries(&self, store: &str) -> Result<Vec<CacheEntry>>;
}

/// In-process backend.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    stores: RwLock<HashMap<String, HashMap<String, CacheEntry>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CacheBackend for MemoryBackend {
    async fn create_store(&self, name: &str) -> Result<()> {
        self.stores
            .write()
            .await
            .entry(name.to_string())
            .or_default();
        Ok(())
    }

    async fn has_store(&self, name: &str) -> Result<bool> {
        Ok(self.stores.read().await.contains_key(name))
    }

    async fn store_names(&self) -> Result<Vec<String>> {
        let mut names: Vec<String> = self.stores.read().await.keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    async fn delete_store(&self, name: &str) -> Result<bool> {
        Ok(self.stores.write().await.remove(name).is_some())
    }

    async fn get(&self, store: &str, key: &str) -> Result<Option<CacheEntry>> {
        Ok(self
            .stores
            .read()
            .await
            .get(store)
            .and_then(|entries| entries.get(key))
            .cloned())
    }

    async fn put(&self, store: &str, entry: CacheEntry) -> Result<()> {
        let mut stores = self.stores.write().await;
        let entries = stores
            .get_mut(store)
            .ok_or_else(|| PulseError::NotFound(format!("cache store {store}")))?;
        entries.insert(entry.key(), entry);
        Ok(())
    }

    async fn delete(&self, store: &str, key: &str) -> Result<bool> {
        Ok(self
            .stores
            .write()
            .await
            .get_mut(store)
            .is_some_and(|entries| entries.remove(key).is_some()))
    }

    async fn entries(&self, store: &str) -> Result<Vec<CacheEntry>> {
        Ok(self
            .stores
            .read()
            .await
            .get(store)
            .map(|entries| entries.values().cloned().collect())
            .unwrap_or_default())
    }
}

// ==================== Cache ====================

/// Handle to one named store.
#[derive(Clone)]
pub struct Cache {
    name: String,
    backend: Arc<dyn CacheBackend>,
}

impl std::fmt::Debug for Cache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cache").field("name", &self.name).finish()
    }
}

impl Cache {
    /// Cache name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Match a request.
    pub async fn match_request(&self, descriptor: &RequestDescriptor) -> Result<Option<CacheEntry>> {
        let entry = self.backend.get(&self.name, &descriptor.key()).await?;
        trace!(cache = %self.name, key = %descriptor.key(), hit = entry.is_some(), "Cache lookup");
        Ok(entry)
    }

    /// Add entry.
    pub async fn put(&self, entry: CacheEntry) -> Result<()> {
        debug!(cache = %self.name, key = %entry.key(), bytes = entry.body.len(), "Cache put");
        self.backend.put(&self.name, entry).await
    }

    /// Delete entry.
    pub async fn delete(&self, descriptor: &RequestDescriptor) -> Result<bool> {
        self.backend.delete(&self.name, &descriptor.key()).await
    }

    /// Descriptors of all entries.
    pub async fn keys(&self) -> Result<Vec<RequestDescriptor>> {
        Ok(self
            .backend
            .entries(&self.name)
            .await?
            .into_iter()
            .map(|e| e.descriptor)
            .collect())
    }

    /// Evict the oldest runtime entries until at most `max` remain.
    /// Precached entries are never evicted.
    pub async fn evict_runtime_entries(&self, max: usize) -> Result<usize> {
        let mut runtime: Vec<CacheEntry> = self
            .backend
            .entries(&self.name)
            .await?
            .into_iter()
            .filter(|e| !e.precached)
            .collect();
        if runtime.len() <= max {
            return Ok(0);
        }

        runtime.sort_by_key(|e| e.cached_at);
        let excess = runtime.len() - max;
        let mut evicted = 0;
        for entry in runtime.into_iter().take(excess) {
            if self.backend.delete(&self.name, &entry.key()).await? {
                evicted += 1;
            }
        }
        debug!(cache = %self.name, evicted, "Evicted runtime entries");
        Ok(evicted)
    }
}

// ==================== Cache Storage ====================

/// Cache storage (the `caches` global).
#[derive(Clone)]
pub struct CacheStorage {
    backend: Arc<dyn CacheBackend>,
}

impl CacheStorage {
    pub fn new(backend: Arc<dyn CacheBackend>) -> Self {
        Self { backend }
    }

    /// Storage that lives only as long as the process.
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryBackend::new()))
    }

    /// Open a cache (creates if doesn't exist).
    pub async fn open(&self, name: &str) -> Result<Cache> {
        self.backend.create_store(name).await?;
        Ok(self.handle(name))
    }

    /// Open a cache only if it already exists.
    pub async fn get(&self, name: &str) -> Result<Option<Cache>> {
        if self.backend.has_store(name).await? {
            Ok(Some(self.handle(name)))
        } else {
            Ok(None)
        }
    }

    /// Check if cache exists.
    pub async fn has(&self, name: &str) -> Result<bool> {
        self.backend.has_store(name).await
    }

    /// Delete a cache.
    pub async fn delete(&self, name: &str) -> Result<bool> {
        let existed = self.backend.delete_store(name).await?;
        if existed {
            debug!(cache = %name, "Cache deleted");
        }
        Ok(existed)
    }

    /// Get all cache names.
    pub async fn keys(&self) -> Result<Vec<String>> {
        self.backend.store_names().await
    }

    fn handle(&self, name: &str) -> Cache {
        Cache {
            name: name.to_string(),
            backend: Arc::clone(&self.backend),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(url: &str, body: &str) -> CacheEntry {
        let request = Request::get(Url::parse(url).unwrap());
        let response = Response::new(
            &request,
            StatusCode::OK,
            HeaderMap::new(),
            Bytes::from(body.to_string()),
        );
        CacheEntry::from_response(RequestDescriptor::from_request(&request), &response)
    }

    #[test]
    fn test_descriptor_drops_fragment() {
        let a = RequestDescriptor::get(&Url::parse("https://example.com/index.html#top").unwrap());
        let b = RequestDescriptor::get(&Url::parse("https://example.com/index.html").unwrap());
        assert_eq!(a, b);
        assert_eq!(a.key(), "GET https://example.com/index.html");
    }

    #[test]
    fn test_descriptor_distinguishes_method() {
        let url = Url::parse("https://example.com/analyze").unwrap();
        let post = Request::post(url.clone(), Bytes::new());
        assert_ne!(
            RequestDescriptor::from_request(&post),
            RequestDescriptor::get(&url)
        );
    }

    #[test]
    fn test_entry_is_snapshot() {
        let request = Request::get(Url::parse("https://example.com/a.css").unwrap());
        let mut response = Response::new(
            &request,
            StatusCode::OK,
            HeaderMap::new(),
            Bytes::from_static(b"original"),
        );
        response
            .headers
            .insert("content-type", HeaderValue::from_static("text/css"));
        let entry = CacheEntry::from_response(RequestDescriptor::get(&request.url), &response);

        response.body = Bytes::from_static(b"changed");
        assert_eq!(entry.body, b"original");

        let rebuilt = entry.to_response(&request);
        assert_eq!(rebuilt.body, Bytes::from_static(b"original"));
        assert_eq!(rebuilt.content_type(), Some("text/css"));
    }

    #[test]
    fn test_freshness() {
        let mut stale = entry("https://example.com/a", "a");
        stale.cached_at = now_millis() - 120_000;
        assert!(stale.is_fresh(None));
        assert!(!stale.is_fresh(Some(Duration::from_secs(60))));

        let pinned = stale.clone().precached();
        assert!(pinned.is_fresh(Some(Duration::from_secs(60))));
    }

    #[test]
    fn test_entry_serializes_body_as_base64() {
        let e = entry("https://example.com/a", "hi");
        let json = serde_json::to_value(&e).unwrap();
        assert_eq!(json["body"], "aGk=");
        let back: CacheEntry = serde_json::from_value(json).unwrap();
        assert_eq!(back, e);
    }

    #[tokio::test]
    async fn test_cache_storage() {
        let storage = CacheStorage::in_memory();

        assert!(!storage.has("ip-v1").await.unwrap());
        assert!(storage.get("ip-v1").await.unwrap().is_none());

        storage.open("ip-v1").await.unwrap();
        assert!(storage.has("ip-v1").await.unwrap());

        assert!(storage.delete("ip-v1").await.unwrap());
        assert!(!storage.has("ip-v1").await.unwrap());
        assert!(!storage.delete("ip-v1").await.unwrap());
    }

    #[tokio::test]
    async fn test_cache_put_and_match() {
        let storage = CacheStorage::in_memory();
        let cache = storage.open("ip-v2").await.unwrap();

        let e = entry("https://example.com/style.css", "body{}");
        cache.put(e.clone()).await.unwrap();

        let hit = cache.match_request(&e.descriptor).await.unwrap();
        assert_eq!(hit.unwrap().body, b"body{}");

        let miss = RequestDescriptor::get(&Url::parse("https://example.com/other.css").unwrap());
        assert!(cache.match_request(&miss).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_last_write_wins() {
        let storage = CacheStorage::in_memory();
        let cache = storage.open("ip-v2").await.unwrap();

        cache.put(entry("https://example.com/a", "one")).await.unwrap();
        cache.put(entry("https://example.com/a", "two")).await.unwrap();

        assert_eq!(cache.keys().await.unwrap().len(), 1);
        let d = RequestDescriptor::get(&Url::parse("https://example.com/a").unwrap());
        assert_eq!(cache.match_request(&d).await.unwrap().unwrap().body, b"two");
    }

    #[tokio::test]
    async fn test_concurrent_puts_for_different_keys() {
        let storage = CacheStorage::in_memory();
        let cache = storage.open("ip-v2").await.unwrap();

        let puts = (0..16).map(|i| {
            let cache = cache.clone();
            async move {
                cache
                    .put(entry(&format!("https://example.com/{i}"), "x"))
                    .await
            }
        });
        for result in futures::future::join_all(puts).await {
            result.unwrap();
        }

        assert_eq!(cache.keys().await.unwrap().len(), 16);
    }

    #[tokio::test]
    async fn test_put_into_deleted_store_fails() {
        let storage = CacheStorage::in_memory();
        let cache = storage.open("ip-v1").await.unwrap();
        storage.delete("ip-v1").await.unwrap();

        let err = cache.put(entry("https://example.com/a", "a")).await.unwrap_err();
        assert!(matches!(err, PulseError::NotFound(_)));
        assert!(!storage.has("ip-v1").await.unwrap());
    }

    #[tokio::test]
    async fn test_evict_runtime_entries_keeps_precached() {
        let storage = CacheStorage::in_memory();
        let cache = storage.open("ip-v2").await.unwrap();

        cache
            .put(entry("https://example.com/index.html", "shell").precached())
            .await
            .unwrap();
        for (i, age) in [30_000u64, 20_000, 10_000].iter().enumerate() {
            let mut e = entry(&format!("https://example.com/data/{i}"), "d");
            e.cached_at = now_millis() - age;
            cache.put(e).await.unwrap();
        }

        assert_eq!(cache.evict_runtime_entries(2).await.unwrap(), 1);

        let keys: Vec<String> = cache.keys().await.unwrap().into_iter().map(|d| d.url).collect();
        assert_eq!(keys.len(), 3);
        assert!(keys.contains(&"https://example.com/index.html".to_string()));
        assert!(!keys.contains(&"https://example.com/data/0".to_string()));
    }
}
