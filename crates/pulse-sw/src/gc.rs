//! Activation-time garbage collection of superseded cache stores.

use futures::future::try_join_all;
use pulse_core::WorkerConfig;
use tracing::{debug, info};

use crate::cache::CacheStorage;
use crate::ServiceWorkerError;

/// Delete every store this application owns except the current one.
///
/// Stores under other prefixes are left alone. Afterwards the current store
/// exists (it is created empty if it was somehow missing). Returns the names
/// of the deleted stores.
pub async fn collect_stale_stores(
    config: &WorkerConfig,
    storage: &CacheStorage,
) -> Result<Vec<String>, ServiceWorkerError> {
    let current = config.cache_name();
    let stale: Vec<String> = storage
        .keys()
        .await?
        .into_iter()
        .filter(|name| config.owns_store(name) && *name != current)
        .collect();

    try_join_all(stale.iter().map(|name| storage.delete(name))).await?;
    storage.open(&current).await?;

    if stale.is_empty() {
        debug!(cache = %current, "No stale stores");
    } else {
        info!(cache = %current, deleted = ?stale, "Deleted stale stores");
    }
    Ok(stale)
}
