use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use hotdeal_core::CrawlJob;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

use crate::{JobStore, StoreError};

#[derive(Debug, Default, Serialize, Deserialize)]
struct JobsDocument {
    #[serde(default)]
    jobs: Vec<CrawlJob>,
}

/// Job registry persisted as one JSON document. Every write replaces the
/// whole file through a temp file and rename.
#[derive(Debug)]
pub struct FileJobStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl FileJobStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read_document(&self) -> Result<BTreeMap<String, CrawlJob>, StoreError> {
        let raw = match fs::read(&self.path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(err) => return Err(err.into()),
        };
        if raw.iter().all(u8::is_ascii_whitespace) {
            return Ok(BTreeMap::new());
        }
        let doc: JobsDocument = serde_json::from_slice(&raw)
            .map_err(|err| StoreError::Corrupt(format!("{}: {err}", self.path.display())))?;
        Ok(doc.jobs.into_iter().map(|job| (job.id.clone(), job)).collect())
    }

    async fn write_document(&self, jobs: BTreeMap<String, CrawlJob>) -> Result<(), StoreError> {
        let doc = JobsDocument {
            jobs: jobs.into_values().collect(),
        };
        let bytes = serde_json::to_vec_pretty(&doc)?;

        let parent = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&parent).await?;

        let temp_path = parent.join(format!(".jobs.{}.tmp", Uuid::new_v4()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await?;
        file.write_all(&bytes).await?;
        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, &self.path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err.into());
        }
        debug!(path = %self.path.display(), jobs = doc.jobs.len(), "job registry written");
        Ok(())
    }
}

#[async_trait]
impl JobStore for FileJobStore {
    async fn load_all(&self) -> Result<Vec<CrawlJob>, StoreError> {
        Ok(self.read_document().await?.into_values().collect())
    }

    async fn put(&self, job: &CrawlJob) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        let mut jobs = self.read_document().await?;
        jobs.insert(job.id.clone(), job.clone());
        self.write_document(jobs).await
    }

    async fn delete(&self, job_id: &str) -> Result<bool, StoreError> {
        let _guard = self.write_lock.lock().await;
        let mut jobs = self.read_document().await?;
        if jobs.remove(job_id).is_none() {
            return Ok(false);
        }
        self.write_document(jobs).await?;
        Ok(true)
    }
}

#[derive(Debug, Default)]
pub struct MemoryJobStore {
    jobs: Mutex<BTreeMap<String, CrawlJob>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn load_all(&self) -> Result<Vec<CrawlJob>, StoreError> {
        Ok(self.jobs.lock().await.values().cloned().collect())
    }

    async fn put(&self, job: &CrawlJob) -> Result<(), StoreError> {
        self.jobs.lock().await.insert(job.id.clone(), job.clone());
        Ok(())
    }

    async fn delete(&self, job_id: &str) -> Result<bool, StoreError> {
        Ok(self.jobs.lock().await.remove(job_id).is_some())
    }
}
