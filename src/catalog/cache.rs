//! Lookup results persisted across runs, keyed by source and query.

use crate::catalog::{CandidateSource, SourceError, normalize_name};
use crate::models::{CatalogCandidate, SourceKind};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::{fs, sync::Mutex};
use tracing::{debug, info, warn};

pub const CACHE_FILE: &str = "lookup_cache.json";

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("lookup cache I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("lookup cache encoding failed: {0}")]
    Encode(#[from] serde_json::Error),
}

struct Entries {
    lookups: BTreeMap<String, Vec<CatalogCandidate>>,
    dirty: bool,
}

pub struct LookupCache {
    path: PathBuf,
    entries: Mutex<Entries>,
}

impl LookupCache {
    pub fn in_dir(dir: &Path) -> PathBuf {
        dir.join(CACHE_FILE)
    }

    /// Reads the cache at `path`. A missing or unreadable file starts an
    /// empty cache.
    pub async fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let lookups = match fs::read_to_string(&path).await {
            Ok(raw) => match serde_json::from_str::<BTreeMap<String, Vec<CatalogCandidate>>>(&raw) {
                Ok(lookups) => lookups,
                Err(err) => {
                    warn!(target = "tcgsync.catalog", path = %path.display(), error = %err, "lookup cache unreadable; starting empty");
                    BTreeMap::new()
                }
            },
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(err) => {
                warn!(target = "tcgsync.catalog", path = %path.display(), error = %err, "lookup cache unreadable; starting empty");
                BTreeMap::new()
            }
        };
        debug!(target = "tcgsync.catalog", path = %path.display(), entries = lookups.len(), "lookup cache loaded");
        Self {
            path,
            entries: Mutex::new(Entries {
                lookups,
                dirty: false,
            }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn get(&self, key: &str) -> Option<Vec<CatalogCandidate>> {
        self.entries.lock().await.lookups.get(key).cloned()
    }

    pub async fn insert(&self, key: String, candidates: Vec<CatalogCandidate>) {
        let mut entries = self.entries.lock().await;
        entries.lookups.insert(key, candidates);
        entries.dirty = true;
    }

    #[cfg(test)]
    pub async fn entry_count(&self) -> usize {
        self.entries.lock().await.lookups.len()
    }

    /// Writes the cache when it changed since the last load or save. The
    /// file is replaced whole, never partially written.
    pub async fn save(&self) -> Result<(), CacheError> {
        let mut entries = self.entries.lock().await;
        if !entries.dirty {
            return Ok(());
        }
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).await?;
        }
        let body = serde_json::to_vec_pretty(&entries.lookups)?;
        let staging = self.path.with_extension("json.tmp");
        fs::write(&staging, body).await?;
        fs::rename(&staging, &self.path).await?;
        entries.dirty = false;
        info!(target = "tcgsync.catalog", path = %self.path.display(), entries = entries.lookups.len(), "lookup cache saved");
        Ok(())
    }
}

/// Wraps a source so repeated queries are answered from the cache. Only
/// non-empty answers are stored; failures are never cached.
pub struct CachedSource {
    inner: Box<dyn CandidateSource>,
    cache: Arc<LookupCache>,
}

impl CachedSource {
    pub fn new(inner: Box<dyn CandidateSource>, cache: Arc<LookupCache>) -> Self {
        Self { inner, cache }
    }

    fn name_key(kind: SourceKind, name: &str) -> String {
        format!("{}:{}", kind.as_str(), normalize_name(name))
    }

    fn printing_key(kind: SourceKind, printing: &str) -> String {
        format!("{}:printing:{}", kind.as_str(), printing.trim().to_ascii_lowercase())
    }

    async fn cached<F>(&self, key: String, fetch: F) -> Result<Vec<CatalogCandidate>, SourceError>
    where
        F: Future<Output = Result<Vec<CatalogCandidate>, SourceError>> + Send,
    {
        if let Some(hit) = self.cache.get(&key).await {
            debug!(target = "tcgsync.catalog", key = %key, "lookup cache hit");
            return Ok(hit);
        }
        let found = fetch.await?;
        if !found.is_empty() {
            self.cache.insert(key, found.clone()).await;
        }
        Ok(found)
    }
}

#[async_trait]
impl CandidateSource for CachedSource {
    fn kind(&self) -> SourceKind {
        self.inner.kind()
    }

    async fn lookup(&self, name: &str) -> Result<Vec<CatalogCandidate>, SourceError> {
        let key = Self::name_key(self.kind(), name);
        self.cached(key, self.inner.lookup(name)).await
    }

    async fn lookup_printing(&self, printing: &str) -> Result<Vec<CatalogCandidate>, SourceError> {
        let key = Self::printing_key(self.kind(), printing);
        self.cached(key, self.inner.lookup_printing(printing)).await
    }
}
