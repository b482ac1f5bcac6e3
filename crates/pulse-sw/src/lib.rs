//! # Pulse Service Worker
//!
//! Offline cache worker for the InsightPulse client.
//!
//! ## Features
//!
//! - **Lifecycle**: install, activate, fetch
//! - **Cache API**: named, versioned stores mapping requests to responses
//! - **Precache**: all-or-nothing install of the core asset manifest
//! - **Garbage collection**: one application store survives activation
//! - **Fetch interception**: cache-first for same-origin GETs, network for
//!   everything else, offline fallback when the network fails
//!
//! ## Architecture
//!
//! ```text
//! Registration
//!     ├── installing (OfflineWorker)
//!     ├── waiting (OfflineWorker)
//!     └── active (OfflineWorker)
//!             └── Interceptor ── Fetcher (network)
//!
//! CacheStorage (caches)
//!     └── Cache ("ip-v2")
//!             └── RequestDescriptor → CacheEntry
//! ```

use pulse_common::PulseError;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use url::Url;

pub mod cache;
pub mod disk;
pub mod gc;
pub mod intercept;
pub mod precache;
pub mod registration;
pub mod worker;

#[cfg(test)]
mod test_support;

pub use cache::{Cache, CacheBackend, CacheEntry, CacheStorage, MemoryBackend, RequestDescriptor};
pub use disk::DiskBackend;
pub use intercept::{FetchEvent, FetchResponse, FetchRoute, Interceptor, ResponseSource};
pub use registration::{ControlledFetcher, Registration, EVENT_BUFFER};
pub use worker::OfflineWorker;

// ==================== Errors ====================

/// Errors that can occur in service worker operations.
#[derive(Error, Debug)]
pub enum ServiceWorkerError {
    #[error("Install failed at {url}: {reason}")]
    InstallFailed { url: String, reason: String },

    #[error("State error: {0}")]
    StateError(String),

    #[error(transparent)]
    Pulse(#[from] PulseError),
}

// ==================== Types ====================

/// Unique identifier for a worker instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ServiceWorkerId(u64);

impl ServiceWorkerId {
    fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

/// Service worker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ServiceWorkerState {
    /// Created, nothing run yet.
    #[default]
    Parsed,
    /// Precaching the manifest.
    Installing,
    /// Precached, waiting for activation.
    Installed,
    /// Removing stale stores.
    Activating,
    /// Active and controlling pages.
    Activated,
    /// Replaced or failed to install.
    Redundant,
}

/// Notifications emitted while workers move through their lifecycle.
#[derive(Debug, Clone)]
pub enum WorkerEvent {
    /// State changed.
    StateChange {
        worker_id: ServiceWorkerId,
        cache_name: String,
        new_state: ServiceWorkerState,
    },
    /// Install stored the whole manifest.
    Precached { cache_name: String, assets: usize },
    /// Activation deleted superseded stores.
    StoresDeleted { names: Vec<String> },
    /// A request was answered with the offline document.
    OfflineFallbackServed { url: Url },
}
