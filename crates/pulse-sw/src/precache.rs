//! Install-time precache of the core asset manifest.
//!
//! All-or-nothing: every manifest URL is fetched before anything is written,
//! and the install only succeeds once every entry is readable back from the
//! current store.

use futures::future::try_join_all;
use pulse_core::WorkerConfig;
use pulse_net::{Fetcher, Request, Response};
use tracing::{debug, info, warn};
use url::Url;

use crate::cache::{CacheEntry, CacheStorage, RequestDescriptor};
use crate::intercept::fetch_bounded;
use crate::ServiceWorkerError;

/// Fetch and store every manifest entry in the current store.
///
/// Returns the number of assets stored.
pub async fn precache(
    config: &WorkerConfig,
    storage: &CacheStorage,
    fetcher: &dyn Fetcher,
) -> Result<usize, ServiceWorkerError> {
    let cache_name = config.cache_name();
    let urls = config.manifest_urls()?;
    info!(cache = %cache_name, assets = urls.len(), "Precaching core assets");

    let fetches = urls.iter().map(|url| fetch_asset(config, fetcher, url));
    let responses = try_join_all(fetches).await?;

    let existed = storage.has(&cache_name).await?;
    let cache = storage.open(&cache_name).await?;

    for (url, response) in urls.iter().zip(&responses) {
        let entry = CacheEntry::from_response(RequestDescriptor::get(url), response).precached();
        if let Err(e) = cache.put(entry).await {
            warn!(url = %url, error = %e, "Failed to store precached asset");
        }
    }

    for url in &urls {
        let stored = cache
            .match_request(&RequestDescriptor::get(url))
            .await
            .ok()
            .flatten()
            .is_some();
        if !stored {
            if !existed {
                if let Err(e) = storage.delete(&cache_name).await {
                    warn!(cache = %cache_name, error = %e, "Failed to discard partial store");
                }
            }
            return Err(ServiceWorkerError::InstallFailed {
                url: url.to_string(),
                reason: "asset missing from cache after install".to_string(),
            });
        }
    }

    info!(cache = %cache_name, assets = urls.len(), "Precache complete");
    Ok(urls.len())
}

async fn fetch_asset(
    config: &WorkerConfig,
    fetcher: &dyn Fetcher,
    url: &Url,
) -> Result<Response, ServiceWorkerError> {
    let request = Request::get(url.clone());
    let response = fetch_bounded(fetcher, &request, config.fetch_timeout(), None)
        .await
        .map_err(|e| ServiceWorkerError::InstallFailed {
            url: url.to_string(),
            reason: e.to_string(),
        })?;

    if !response.is_cacheable() {
        return Err(ServiceWorkerError::InstallFailed {
            url: url.to_string(),
            reason: format!("status {}", response.status),
        });
    }
    debug!(url = %url, bytes = response.body.len(), "Fetched core asset");
    Ok(response)
}
