//! One durable log directory per project, created on first use.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use dashmap::DashMap;
use lib0::encoding::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, error, info};

use crate::error::{SyncError, SyncResult};
use crate::id::ProjectKey;
use crate::local::decode_records;

/// Registry of the per-project backing stores under one root directory
pub struct BackingStores {
    root: PathBuf,
    projects: DashMap<ProjectKey, Arc<ProjectLog>>,
}

impl BackingStores {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            projects: DashMap::new(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Backing store of a project, provisioned on first access
    pub async fn open(&self, project: &ProjectKey) -> SyncResult<Arc<ProjectLog>> {
        if let Some(log) = self.projects.get(project) {
            return Ok(log.clone());
        }

        let dir = self
            .root
            .join(URL_SAFE_NO_PAD.encode(project.owner()))
            .join(URL_SAFE_NO_PAD.encode(project.project()));
        if let Err(e) = tokio::fs::create_dir_all(&dir).await {
            error!("Cannot provision store for {} at {:?}: {}", project, dir, e);
            return Err(SyncError::StoreUnavailable {
                project: project.to_string(),
            });
        }

        let log = self
            .projects
            .entry(project.clone())
            .or_insert_with(|| {
                info!("Opened backing store for {}", project);
                Arc::new(ProjectLog::new(dir))
            })
            .clone();
        Ok(log)
    }

    /// Number of projects opened so far
    pub fn project_count(&self) -> usize {
        self.projects.len()
    }
}

/// Append-only logs of every document in one project.
///
/// Access to one document's log is serialized, so concurrent appends never
/// interleave partial records.
pub struct ProjectLog {
    dir: PathBuf,
    locks: DashMap<String, Arc<Mutex<()>>>,
    counts: DashMap<String, usize>,
}

impl ProjectLog {
    fn new(dir: PathBuf) -> Self {
        Self {
            dir,
            locks: DashMap::new(),
            counts: DashMap::new(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, key: &str) -> PathBuf {
        self.dir
            .join(format!("{}.ylog", URL_SAFE_NO_PAD.encode(key)))
    }

    fn lock(&self, key: &str) -> Arc<Mutex<()>> {
        self.locks.entry(key.to_string()).or_default().clone()
    }

    /// Every record stored under `key`, oldest first
    pub async fn read(&self, key: &str) -> SyncResult<Vec<Vec<u8>>> {
        let lock = self.lock(key);
        let _guard = lock.lock().await;
        self.read_unlocked(key).await
    }

    async fn read_unlocked(&self, key: &str) -> SyncResult<Vec<Vec<u8>>> {
        let path = self.path(key);
        match tokio::fs::read(&path).await {
            Ok(data) => Ok(decode_records(&data, &path)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    /// Append one record, returns the number of records now stored
    pub async fn append(&self, key: &str, record: &[u8]) -> SyncResult<usize> {
        let lock = self.lock(key);
        let _guard = lock.lock().await;

        let mut encoder: Vec<u8> = Vec::new();
        Write::write_buf(&mut encoder, record);

        let cached = self.counts.get(key).map(|count| *count);
        let stored = match cached {
            Some(count) => count,
            None => self.read_unlocked(key).await?.len(),
        };

        let path = self.path(key);
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        file.write_all(&encoder).await?;
        file.sync_data().await?;
        drop(file);

        let count = stored + 1;
        self.counts.insert(key.to_string(), count);
        debug!("Appended record {} to {:?}", count, path);
        Ok(count)
    }

    /// Rewrite the log of `key` as the single record `merge` builds from the
    /// current records
    pub async fn compact(
        &self,
        key: &str,
        merge: impl FnOnce(&[Vec<u8>]) -> SyncResult<Vec<u8>>,
    ) -> SyncResult<()> {
        let lock = self.lock(key);
        let _guard = lock.lock().await;

        let records = self.read_unlocked(key).await?;
        let merged = merge(&records)?;
        let mut encoder: Vec<u8> = Vec::new();
        Write::write_buf(&mut encoder, &merged);

        let path = self.path(key);
        let tmp = path.with_extension("ylog.tmp");
        tokio::fs::write(&tmp, &encoder).await?;
        tokio::fs::rename(&tmp, &path).await?;
        self.counts.insert(key.to_string(), 1);
        info!("Compacted {} records of '{}'", records.len(), key);
        Ok(())
    }
}
