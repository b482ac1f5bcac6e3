//! Fetch interception: decide cache-vs-network per request.
//!
//! Routing is a small decision table ([`FetchRoute::classify`]); handling each
//! route never fails outward. Every intercepted request resolves to a
//! [`FetchResponse`], falling back to the offline document and finally to a
//! network-error response.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use hashbrown::HashMap;
use http::StatusCode;
use pulse_common::{with_timeout, OptionExt, PulseError};
use pulse_core::WorkerConfig;
use pulse_net::{Fetcher, NetError, Request, Response};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::cache::{CacheEntry, CacheStorage, RequestDescriptor};
use crate::WorkerEvent;

// ==================== Fetch Event ====================

/// A fetch event.
#[derive(Debug, Clone)]
pub struct FetchEvent {
    /// The request being made.
    pub request: Request,

    /// Fires when the page goes away mid-request.
    pub signal: Option<CancellationToken>,
}

impl FetchEvent {
    pub fn new(request: Request) -> Self {
        Self {
            request,
            signal: None,
        }
    }

    pub fn with_signal(mut self, signal: CancellationToken) -> Self {
        self.signal = Some(signal);
        self
    }
}

/// Where an intercepted response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseSource {
    Cache,
    Network,
    OfflineFallback,
    /// Nothing could answer; the page sees a failed fetch.
    NetworkError,
}

/// Fetch event response.
#[derive(Debug, Clone)]
pub struct FetchResponse {
    /// Status code (0 for a network error).
    pub status: u16,

    /// Status text.
    pub status_text: String,

    /// Response headers.
    pub headers: HashMap<String, String>,

    /// Response body.
    pub body: Bytes,

    pub source: ResponseSource,
}

impl FetchResponse {
    /// Create a network error response.
    pub fn network_error() -> Self {
        Self {
            status: 0,
            status_text: "Network Error".to_string(),
            headers: HashMap::new(),
            body: Bytes::new(),
            source: ResponseSource::NetworkError,
        }
    }

    /// Create a response from cache entry.
    pub fn from_cache(entry: &CacheEntry, source: ResponseSource) -> Self {
        Self {
            status: entry.status,
            status_text: status_text(entry.status),
            headers: entry.headers.clone(),
            body: Bytes::from(entry.body.clone()),
            source,
        }
    }

    pub fn from_network(response: &Response) -> Self {
        Self {
            status: response.status.as_u16(),
            status_text: status_text(response.status.as_u16()),
            headers: response
                .headers
                .iter()
                .filter_map(|(n, v)| v.to_str().ok().map(|v| (n.as_str().to_string(), v.to_string())))
                .collect(),
            body: response.body.clone(),
            source: ResponseSource::Network,
        }
    }

    pub fn is_network_error(&self) -> bool {
        self.source == ResponseSource::NetworkError
    }

    /// Convert for the page. A network-error response makes the page's
    /// fetch reject.
    pub fn into_response(self, request: &Request) -> Result<Response, NetError> {
        if self.is_network_error() {
            return Err(NetError::RequestFailed(format!(
                "{} unavailable offline",
                request.url
            )));
        }
        let status = StatusCode::from_u16(self.status)
            .map_err(|e| NetError::RequestFailed(e.to_string()))?;
        let entry = CacheEntry {
            descriptor: RequestDescriptor::from_request(request),
            status: self.status,
            headers: self.headers,
            body: self.body.to_vec(),
            cached_at: 0,
            precached: false,
        };
        let mut response = entry.to_response(request);
        response.status = status;
        Ok(response)
    }
}

fn status_text(status: u16) -> String {
    StatusCode::from_u16(status)
        .ok()
        .and_then(|s| s.canonical_reason())
        .unwrap_or("")
        .to_string()
}

// ==================== Routing ====================

/// How a request is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchRoute {
    /// Not a GET: straight to the network, never cached, offline fallback
    /// on failure.
    NetworkOnly,
    /// Cross-origin GET: left to the host.
    Bypass,
    /// Same-origin GET: cache, then network (stored on success), then
    /// offline fallback.
    CacheFirst,
}

impl FetchRoute {
    pub fn classify(request: &Request, config: &WorkerConfig) -> Self {
        if !request.is_safe_read() {
            FetchRoute::NetworkOnly
        } else if !config.is_same_origin(&request.url) {
            FetchRoute::Bypass
        } else {
            FetchRoute::CacheFirst
        }
    }
}

/// Fetch with the configured deadline, aborting early if `signal` fires.
/// Expiry and abort both surface as network failures.
pub(crate) async fn fetch_bounded(
    fetcher: &dyn Fetcher,
    request: &Request,
    timeout: Option<Duration>,
    signal: Option<&CancellationToken>,
) -> Result<Response, NetError> {
    let bounded = async {
        match timeout {
            Some(limit) => with_timeout(limit, || fetcher.fetch(request))
                .await
                .map_err(|_| NetError::Timeout(limit))
                .and_then(|result| result),
            None => fetcher.fetch(request).await,
        }
    };

    match signal {
        Some(token) => {
            tokio::select! {
                biased;
                _ = token.cancelled() => Err(NetError::Cancelled),
                result = bounded => result,
            }
        }
        None => bounded.await,
    }
}

// ==================== Interceptor ====================

/// Applies the worker's caching policy to fetch events.
pub struct Interceptor {
    config: Arc<WorkerConfig>,
    storage: CacheStorage,
    fetcher: Arc<dyn Fetcher>,
    event_tx: Option<mpsc::Sender<WorkerEvent>>,
}

impl Interceptor {
    pub fn new(config: Arc<WorkerConfig>, storage: CacheStorage, fetcher: Arc<dyn Fetcher>) -> Self {
        Self {
            config,
            storage,
            fetcher,
            event_tx: None,
        }
    }

    pub fn with_events(mut self, event_tx: mpsc::Sender<WorkerEvent>) -> Self {
        self.event_tx = Some(event_tx);
        self
    }

    /// Handle fetch event. `None` means the request is not intercepted and
    /// the host performs it.
    pub async fn handle(&self, event: &FetchEvent) -> Option<FetchResponse> {
        let request = &event.request;
        let route = FetchRoute::classify(request, &self.config);
        trace!(url = %request.url, method = %request.method, ?route, "Intercepting request");

        match route {
            FetchRoute::Bypass => None,
            FetchRoute::NetworkOnly => Some(match self.network(event).await {
                Ok(response) => FetchResponse::from_network(&response),
                Err(_) => self.offline_fallback(request).await,
            }),
            FetchRoute::CacheFirst => Some(self.cache_first(event).await),
        }
    }

    async fn cache_first(&self, event: &FetchEvent) -> FetchResponse {
        let request = &event.request;
        let descriptor = RequestDescriptor::get(&request.url);

        if let Some(entry) = self.lookup(&descriptor).await {
            debug!(url = %request.url, "Served from cache");
            return FetchResponse::from_cache(&entry, ResponseSource::Cache);
        }

        match self.network(event).await {
            Ok(response) => {
                if response.is_cacheable() {
                    self.store(descriptor, &response).await;
                } else {
                    trace!(url = %request.url, status = %response.status, "Response not cacheable");
                }
                FetchResponse::from_network(&response)
            }
            Err(_) => self.offline_fallback(request).await,
        }
    }

    async fn network(&self, event: &FetchEvent) -> Result<Response, NetError> {
        let result = fetch_bounded(
            self.fetcher.as_ref(),
            &event.request,
            self.config.fetch_timeout(),
            event.signal.as_ref(),
        )
        .await;
        if let Err(ref e) = result {
            warn!(
                url = %event.request.url,
                error = %e,
                network_failure = e.is_network_failure(),
                "Network fetch failed"
            );
        }
        result
    }

    /// Look up a fresh entry in the current store. Storage errors degrade to
    /// a miss.
    async fn lookup(&self, descriptor: &RequestDescriptor) -> Option<CacheEntry> {
        let cache_name = self.config.cache_name();
        let lookup = async {
            match self.storage.get(&cache_name).await? {
                Some(cache) => cache.match_request(descriptor).await,
                None => Ok::<_, PulseError>(None),
            }
        };

        match lookup.await {
            Ok(Some(entry)) if entry.is_fresh(self.config.runtime_cache.max_age()) => Some(entry),
            Ok(Some(_)) => {
                debug!(key = %descriptor.key(), "Cached entry expired");
                None
            }
            Ok(None) => None,
            Err(e) => {
                warn!(key = %descriptor.key(), error = %e, category = e.category(), "Cache read failed");
                None
            }
        }
    }

    /// Best-effort write of a response snapshot into the current store.
    async fn store(&self, descriptor: RequestDescriptor, response: &Response) {
        let cache_name = self.config.cache_name();
        let entry = CacheEntry::from_response(descriptor, response);
        let key = entry.key();

        let write = async {
            let cache = self
                .storage
                .get(&cache_name)
                .await?
                .ok_or_not_found(format!("cache store {cache_name}"))?;
            cache.put(entry).await?;
            if let Some(max) = self.config.runtime_cache.max_entries {
                cache.evict_runtime_entries(max).await?;
            }
            Ok::<_, PulseError>(())
        };

        if let Err(e) = write.await {
            warn!(key = %key, error = %e, "Cache write failed");
        }
    }

    async fn offline_fallback(&self, request: &Request) -> FetchResponse {
        let fallback = match self.config.offline_fallback_url() {
            Ok(url) => url,
            Err(e) => {
                warn!(error = %e, "No offline fallback URL");
                return FetchResponse::network_error();
            }
        };

        match self.lookup(&RequestDescriptor::get(&fallback)).await {
            Some(entry) => {
                debug!(url = %request.url, fallback = %fallback, "Serving offline fallback");
                if let Some(ref tx) = self.event_tx {
                    let served = WorkerEvent::OfflineFallbackServed {
                        url: request.url.clone(),
                    };
                    if let Err(e) = tx.try_send(served) {
                        trace!(error = %e, "Worker event dropped");
                    }
                }
                FetchResponse::from_cache(&entry, ResponseSource::OfflineFallback)
            }
            None => {
                warn!(url = %request.url, "Offline fallback missing from cache");
                FetchResponse::network_error()
            }
        }
    }
}
