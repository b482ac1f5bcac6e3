//! Worker configuration
//!
//! Everything the offline worker needs to know is fixed when it starts: the
//! application origin, the cache generation and the core asset manifest.
//! `WorkerConfig::default()` carries the compiled-in values.

use pulse_common::{PulseError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tracing::debug;
use url::Url;

const DEFAULT_ORIGIN: &str = "http://127.0.0.1:5500/";
const DEFAULT_API_BASE: &str = "http://127.0.0.1:8000/";
const DEFAULT_CACHE_PREFIX: &str = "ip-";
const DEFAULT_CACHE_VERSION: &str = "v2";
const DEFAULT_OFFLINE_FALLBACK: &str = "/offline.html";
const DEFAULT_FETCH_TIMEOUT_MS: u64 = 10_000;

const CORE_ASSETS: &[&str] = &[
    "/",
    "/index.html",
    "/style.css",
    "/script.js",
    "/manifest.json",
    "/icons/icon-192.png",
    "/icons/icon-512.png",
    DEFAULT_OFFLINE_FALLBACK,
];

/// Tag identifying a generation of cached assets.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheVersion(String);

impl CacheVersion {
    pub fn new(tag: impl Into<String>) -> Self {
        Self(tag.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CacheVersion {
    fn from(tag: &str) -> Self {
        Self::new(tag)
    }
}

/// Ordered set of core asset paths, relative to the application origin.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "Vec<String>", into = "Vec<String>")]
pub struct AssetManifest(Vec<String>);

impl AssetManifest {
    /// Build a manifest, dropping repeated entries but keeping first-seen order.
    pub fn new<I, S>(paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut unique: Vec<String> = Vec::new();
        for path in paths {
            let path = path.into();
            if !unique.contains(&path) {
                unique.push(path);
            }
        }
        Self(unique)
    }

    pub fn paths(&self) -> &[String] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn contains(&self, path: &str) -> bool {
        self.0.iter().any(|p| p == path)
    }

    /// Resolve every entry against `origin`.
    pub fn resolve(&self, origin: &Url) -> Result<Vec<Url>> {
        self.0
            .iter()
            .map(|path| {
                origin.join(path).map_err(|e| {
                    PulseError::config_with_source(format!("bad manifest entry {path:?}"), e)
                })
            })
            .collect()
    }
}

impl From<Vec<String>> for AssetManifest {
    fn from(paths: Vec<String>) -> Self {
        Self::new(paths)
    }
}

impl From<AssetManifest> for Vec<String> {
    fn from(manifest: AssetManifest) -> Self {
        manifest.0
    }
}

/// Optional bounds on responses cached at runtime. Precached assets are
/// never subject to these.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeCacheConfig {
    /// Entries older than this are treated as misses.
    pub max_age_secs: Option<u64>,

    /// Oldest runtime entries are evicted past this count.
    pub max_entries: Option<usize>,
}

impl RuntimeCacheConfig {
    pub fn max_age(&self) -> Option<Duration> {
        self.max_age_secs.map(Duration::from_secs)
    }
}

/// Immutable configuration handed to the offline worker at startup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Origin of the pages the worker controls.
    pub origin: Url,

    /// Base URL of the sentiment API.
    pub api_base: Url,

    /// Prefix shared by every cache store this application owns.
    pub cache_prefix: String,

    /// Current cache generation.
    pub cache_version: CacheVersion,

    /// Core assets precached at install time.
    pub manifest: AssetManifest,

    /// Document served when neither cache nor network can answer.
    pub offline_fallback: String,

    /// Upper bound on a single network fetch, in milliseconds.
    pub fetch_timeout_ms: Option<u64>,

    /// Bounds for runtime-cached responses.
    pub runtime_cache: RuntimeCacheConfig,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            origin: static_url(DEFAULT_ORIGIN),
            api_base: static_url(DEFAULT_API_BASE),
            cache_prefix: DEFAULT_CACHE_PREFIX.to_string(),
            cache_version: CacheVersion::new(DEFAULT_CACHE_VERSION),
            manifest: AssetManifest::new(CORE_ASSETS.iter().copied()),
            offline_fallback: DEFAULT_OFFLINE_FALLBACK.to_string(),
            fetch_timeout_ms: Some(DEFAULT_FETCH_TIMEOUT_MS),
            runtime_cache: RuntimeCacheConfig::default(),
        }
    }
}

impl WorkerConfig {
    /// Load a configuration from JSON. Missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        debug!(cache = %config.cache_name(), assets = config.manifest.len(), "Loaded worker config");
        Ok(config)
    }

    /// Name of the cache store for the current version.
    pub fn cache_name(&self) -> String {
        format!("{}{}", self.cache_prefix, self.cache_version)
    }

    /// Whether a store name belongs to this application.
    pub fn owns_store(&self, name: &str) -> bool {
        name.starts_with(&self.cache_prefix)
    }

    pub fn fetch_timeout(&self) -> Option<Duration> {
        self.fetch_timeout_ms.map(Duration::from_millis)
    }

    /// Whether `url` shares scheme, host and port with the controlled pages.
    pub fn is_same_origin(&self, url: &Url) -> bool {
        url.origin() == self.origin.origin()
    }

    /// Manifest entries as absolute URLs.
    pub fn manifest_urls(&self) -> Result<Vec<Url>> {
        self.manifest.resolve(&self.origin)
    }

    pub fn offline_fallback_url(&self) -> Result<Url> {
        self.origin.join(&self.offline_fallback).map_err(|e| {
            PulseError::config_with_source(
                format!("bad offline fallback {:?}", self.offline_fallback),
                e,
            )
        })
    }

    /// Absolute URL of an API endpoint, e.g. `auth/login`.
    pub fn api_url(&self, endpoint: &str) -> Result<Url> {
        let mut base = self.api_base.clone();
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        base.join(endpoint.trim_start_matches('/')).map_err(|e| {
            PulseError::config_with_source(format!("bad API endpoint {endpoint:?}"), e)
        })
    }

    /// Whether the offline document is precached with the manifest. When it
    /// is not, offline misses resolve to a network error.
    pub fn fallback_precached(&self) -> bool {
        match (self.offline_fallback_url(), self.manifest_urls()) {
            (Ok(fallback), Ok(urls)) => urls.contains(&fallback),
            _ => false,
        }
    }

    /// Check the invariants the worker relies on.
    pub fn validate(&self) -> Result<()> {
        if self.cache_prefix.is_empty() {
            return Err(PulseError::config("cache prefix must not be empty"));
        }
        if self.cache_version.as_str().is_empty() {
            return Err(PulseError::config("cache version must not be empty"));
        }
        if self.manifest.is_empty() {
            return Err(PulseError::config("asset manifest must not be empty"));
        }
        for url in self.manifest_urls()? {
            if !self.is_same_origin(&url) {
                return Err(PulseError::config(format!(
                    "manifest entry {url} is not on origin {}",
                    self.origin
                )));
            }
        }
        if self.fetch_timeout_ms == Some(0) {
            return Err(PulseError::config("fetch timeout must be positive"));
        }
        Ok(())
    }
}

fn static_url(literal: &str) -> Url {
    Url::parse(literal).expect("compiled-in URL literal is valid")
}
