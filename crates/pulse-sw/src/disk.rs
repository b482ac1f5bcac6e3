//! Disk-backed cache storage.
//!
//! Layout: `<root>/<store>/<sha256(key)>.json`, with the store name
//! percent-encoded into a single path component. An entry is written to a
//! temporary file in the same directory and renamed into place, so a reader
//! sees either the old entry or the new one.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use pulse_common::{PulseError, Result, ResultExt};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::cache::{CacheBackend, CacheEntry};

const ENTRY_EXT: &str = "json";

/// Backend persisting each store as a directory of JSON entries.
#[derive(Debug, Clone)]
pub struct DiskBackend {
    root: PathBuf,
}

impl DiskBackend {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn store_dir(&self, name: &str) -> Result<PathBuf> {
        if matches!(name, "" | "." | "..") {
            return Err(PulseError::InvalidArgument(format!(
                "cache store name {name:?}"
            )));
        }
        Ok(self.root.join(urlencoding::encode(name).as_ref()))
    }

    fn entry_path(&self, store: &str, key: &str) -> Result<PathBuf> {
        let digest = hex::encode(Sha256::digest(key.as_bytes()));
        Ok(self.store_dir(store)?.join(format!("{digest}.{ENTRY_EXT}")))
    }

    async fn read_entry(path: &Path) -> Result<Option<CacheEntry>> {
        match tokio::fs::read(path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(PulseError::cache_with_source(
                format!("reading {}", path.display()),
                e,
            )),
        }
    }
}

fn temp_suffix() -> String {
    static COUNTER: AtomicU64 = AtomicU64::new(1);
    format!(
        "tmp-{}-{}",
        std::process::id(),
        COUNTER.fetch_add(1, Ordering::Relaxed)
    )
}

#[async_trait]
impl CacheBackend for DiskBackend {
    async fn create_store(&self, name: &str) -> Result<()> {
        let dir = self.store_dir(name)?;
        tokio::fs::create_dir_all(&dir)
            .await
            .context(format!("creating {}", dir.display()))
    }

    async fn has_store(&self, name: &str) -> Result<bool> {
        let dir = self.store_dir(name)?;
        match tokio::fs::metadata(&dir).await {
            Ok(meta) => Ok(meta.is_dir()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(PulseError::cache_with_source(
                format!("inspecting {}", dir.display()),
                e,
            )),
        }
    }

    async fn store_names(&self) -> Result<Vec<String>> {
        let mut dir = match tokio::fs::read_dir(&self.root).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(PulseError::cache_with_source(
                    format!("listing {}", self.root.display()),
                    e,
                ))
            }
        };

        let mut names = Vec::new();
        while let Some(item) = dir.next_entry().await? {
            if !item.file_type().await?.is_dir() {
                continue;
            }
            let file_name = item.file_name();
            match file_name.to_str().map(urlencoding::decode) {
                Some(Ok(name)) => names.push(name.into_owned()),
                _ => debug!(dir = ?file_name, "Skipping foreign directory"),
            }
        }
        names.sort();
        Ok(names)
    }

    async fn delete_store(&self, name: &str) -> Result<bool> {
        let dir = self.store_dir(name)?;
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(PulseError::cache_with_source(
                format!("removing {}", dir.display()),
                e,
            )),
        }
    }

    async fn get(&self, store: &str, key: &str) -> Result<Option<CacheEntry>> {
        Self::read_entry(&self.entry_path(store, key)?).await
    }

    async fn put(&self, store: &str, entry: CacheEntry) -> Result<()> {
        if !self.has_store(store).await? {
            return Err(PulseError::NotFound(format!("cache store {store}")));
        }

        let path = self.entry_path(store, &entry.key())?;
        let tmp = path.with_extension(temp_suffix());
        let bytes = serde_json::to_vec(&entry)?;

        tokio::fs::write(&tmp, &bytes)
            .await
            .context(format!("writing {}", tmp.display()))?;
        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            if let Err(cleanup) = tokio::fs::remove_file(&tmp).await {
                warn!(path = %tmp.display(), error = %cleanup, "Failed to remove temp entry");
            }
            return Err(PulseError::cache_with_source(
                format!("committing {}", path.display()),
                e,
            ));
        }

        debug!(store, path = %path.display(), bytes = bytes.len(), "Entry written");
        Ok(())
    }

    async fn delete(&self, store: &str, key: &str) -> Result<bool> {
        let path = self.entry_path(store, key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(PulseError::cache_with_source(
                format!("removing {}", path.display()),
                e,
            )),
        }
    }

    async fn entries(&self, store: &str) -> Result<Vec<CacheEntry>> {
        let dir_path = self.store_dir(store)?;
        let mut dir = match tokio::fs::read_dir(&dir_path).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(PulseError::cache_with_source(
                    format!("listing {}", dir_path.display()),
                    e,
                ))
            }
        };

        let mut entries = Vec::new();
        while let Some(item) = dir.next_entry().await? {
            let path = item.path();
            if path.extension().and_then(|e| e.to_str()) != Some(ENTRY_EXT) {
                continue;
            }
            if let Some(entry) = Self::read_entry(&path).await? {
                entries.push(entry);
            }
        }
        Ok(entries)
    }
}
