//! Append-only resume cursor. The last recorded identifier is the boundary a
//! restarted run resumes from.

use crate::models::CatalogId;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::{fs, io::AsyncWriteExt, sync::Mutex};
use tracing::{debug, warn};
use uuid::Uuid;

pub const PROGRESS_FILE: &str = "progress.jsonl";

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("checkpoint I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("checkpoint encoding failed: {0}")]
    Encode(#[from] serde_json::Error),
}

#[async_trait]
pub trait Checkpoint: Send + Sync {
    /// Persists `id` as completed. Returns only once the record is durable.
    async fn record(&self, id: &CatalogId) -> Result<(), CheckpointError>;

    async fn last(&self) -> Result<Option<CatalogId>, CheckpointError>;
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProgressRecord {
    pub product_id: CatalogId,
    pub report_file: String,
    pub run_id: Uuid,
    pub timestamp: DateTime<Utc>,
}

pub struct FileCheckpoint {
    path: PathBuf,
    run_id: Uuid,
    report_file: String,
    // Serialises appends from this process.
    lock: Mutex<()>,
}

impl FileCheckpoint {
    pub fn new(path: impl Into<PathBuf>, run_id: Uuid, report_file: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            run_id,
            report_file: report_file.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn in_dir(dir: &Path, run_id: Uuid, report_file: impl Into<String>) -> Self {
        Self::new(dir.join(PROGRESS_FILE), run_id, report_file)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Last well-formed record in the file. A torn trailing line left by a
    /// crash mid-write is ignored.
    pub async fn last_record(&self) -> Result<Option<ProgressRecord>, CheckpointError> {
        let raw = match fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let mut last = None;
        for (index, line) in raw.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<ProgressRecord>(line) {
                Ok(record) => last = Some(record),
                Err(err) => {
                    warn!(target = "tcgsync.execute", line = index + 1, error = %err, "skipping malformed checkpoint line")
                }
            }
        }
        Ok(last)
    }
}

#[async_trait]
impl Checkpoint for FileCheckpoint {
    async fn record(&self, id: &CatalogId) -> Result<(), CheckpointError> {
        let _guard = self.lock.lock().await;
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).await?;
        }
        let record = ProgressRecord {
            product_id: id.clone(),
            report_file: self.report_file.clone(),
            run_id: self.run_id,
            timestamp: Utc::now(),
        };
        let mut line = serde_json::to_string(&record)?;
        line.push('\n');
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        file.sync_data().await?;
        debug!(target = "tcgsync.execute", product_id = %id, "checkpoint recorded");
        Ok(())
    }

    async fn last(&self) -> Result<Option<CatalogId>, CheckpointError> {
        Ok(self.last_record().await?.map(|r| r.product_id))
    }
}

#[derive(Default)]
pub struct MemoryCheckpoint {
    ids: Mutex<Vec<CatalogId>>,
}

impl MemoryCheckpoint {
    pub async fn recorded(&self) -> Vec<CatalogId> {
        self.ids.lock().await.clone()
    }
}

#[async_trait]
impl Checkpoint for MemoryCheckpoint {
    async fn record(&self, id: &CatalogId) -> Result<(), CheckpointError> {
        self.ids.lock().await.push(id.clone());
        Ok(())
    }

    async fn last(&self) -> Result<Option<CatalogId>, CheckpointError> {
        Ok(self.ids.lock().await.last().cloned())
    }
}
