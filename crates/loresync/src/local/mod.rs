//! Durable per-document local store used while offline.
//!
//! Updates are appended to one log file per document. Writes are buffered in a
//! [`WriteQueue`] and committed by a debounced background task or an explicit
//! [`LocalPersistence::flush`]. Destroying an adapter requires the [`Flushed`]
//! token that only a successful flush hands out.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use lib0::decoding::{Cursor, Read};
use lib0::encoding::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::AsyncWriteExt;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};
use tracing::{debug, info, warn};

use crate::error::{SyncError, SyncResult};
use crate::id::DocumentId;

/// Number of stored records above which the log is rewritten as one state update
pub const COMPACTION_THRESHOLD: usize = 500;

/// Root directory holding the local logs of all documents
#[derive(Debug, Clone)]
pub struct LocalStore {
    root: PathBuf,
}

impl LocalStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of the log belonging to a document
    pub fn log_path(&self, id: &DocumentId) -> PathBuf {
        let name = URL_SAFE_NO_PAD.encode(id.composite_key());
        self.root.join(format!("{}.ylog", name))
    }

    /// Open the adapter of a document and load everything stored for it.
    ///
    /// Completes once the stored state is fully read; a document that was never
    /// stored yields an empty initial state.
    pub async fn open(
        &self,
        id: &DocumentId,
        debounce: Duration,
    ) -> SyncResult<(LocalPersistence, InitialState)> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|e| SyncError::LocalStore(format!("cannot create {:?}: {}", self.root, e)))?;

        let path = self.log_path(id);
        let updates = read_log(&path).await?;
        debug!(
            "Loaded {} stored updates for '{}' from {:?}",
            updates.len(),
            id,
            path
        );

        let queue = Arc::new(WriteQueue {
            path,
            pending: Mutex::new(Vec::new()),
            notify: Notify::new(),
            io: tokio::sync::Mutex::new(()),
        });
        let flusher = tokio::spawn(run_flusher(queue.clone(), debounce, id.to_string()));

        Ok((
            LocalPersistence {
                id: id.to_string(),
                queue,
                flusher,
                released: AtomicBool::new(false),
            },
            InitialState { updates },
        ))
    }
}

/// State materialized from the local store when a document is opened
#[derive(Debug, Default)]
pub struct InitialState {
    pub updates: Vec<Vec<u8>>,
}

impl InitialState {
    pub fn is_empty(&self) -> bool {
        self.updates.is_empty()
    }
}

/// Proof that every buffered write has been committed.
///
/// Only [`LocalPersistence::flush`] creates one, and
/// [`LocalPersistence::destroy`] consumes it, so an adapter cannot be
/// destroyed with writes it never tried to commit.
#[derive(Debug)]
pub struct Flushed {
    _private: (),
}

/// Buffered writes waiting to be appended to the log
pub struct WriteQueue {
    path: PathBuf,
    pending: Mutex<Vec<Vec<u8>>>,
    notify: Notify,
    io: tokio::sync::Mutex<()>,
}

impl WriteQueue {
    fn push(&self, update: Vec<u8>) {
        if let Ok(mut pending) = self.pending.lock() {
            pending.push(update);
        }
        self.notify.notify_one();
    }

    fn len(&self) -> usize {
        self.pending.lock().map(|p| p.len()).unwrap_or(0)
    }

    fn take(&self) -> Vec<Vec<u8>> {
        self.pending
            .lock()
            .map(|mut pending| std::mem::take(&mut *pending))
            .unwrap_or_default()
    }

    fn restore(&self, mut updates: Vec<Vec<u8>>) {
        if let Ok(mut pending) = self.pending.lock() {
            updates.append(&mut pending);
            *pending = updates;
        }
    }

    /// Append every pending update to the log. Writes are serialized, and on
    /// failure the updates go back to the front of the queue.
    async fn commit(&self) -> SyncResult<usize> {
        let _io = self.io.lock().await;
        let updates = self.take();
        if updates.is_empty() {
            return Ok(0);
        }

        let mut encoder: Vec<u8> = Vec::new();
        for update in &updates {
            Write::write_buf(&mut encoder, update);
        }

        match append(&self.path, &encoder).await {
            Ok(()) => Ok(updates.len()),
            Err(e) => {
                self.restore(updates);
                Err(SyncError::LocalStore(format!(
                    "cannot append to {:?}: {}",
                    self.path, e
                )))
            }
        }
    }
}

async fn append(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    file.write_all(bytes).await?;
    file.sync_data().await
}

async fn read_log(path: &Path) -> SyncResult<Vec<Vec<u8>>> {
    let data = match tokio::fs::read(path).await {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => {
            return Err(SyncError::LocalStore(format!(
                "cannot read {:?}: {}",
                path, e
            )))
        }
    };
    Ok(decode_records(&data, path))
}

/// Decode length-prefixed records. A torn record at the tail is dropped.
pub(crate) fn decode_records(data: &[u8], origin: &Path) -> Vec<Vec<u8>> {
    let mut decoder = Cursor::new(data);
    let mut records = Vec::new();
    while decoder.has_content() {
        match decoder.read_buf() {
            Ok(record) => records.push(record.to_vec()),
            Err(e) => {
                warn!("Ignoring truncated record at the end of {:?}: {}", origin, e);
                break;
            }
        }
    }
    records
}

async fn run_flusher(queue: Arc<WriteQueue>, debounce: Duration, id: String) {
    loop {
        queue.notify.notified().await;
        // Coalesce bursts of edits into one append
        sleep(debounce).await;
        match queue.commit().await {
            Ok(0) => {}
            Ok(count) => debug!("Committed {} buffered updates for '{}'", count, id),
            Err(e) => warn!("Deferred write for '{}' failed: {}", id, e),
        }
    }
}

/// Local persistence adapter of one open document
pub struct LocalPersistence {
    id: String,
    queue: Arc<WriteQueue>,
    flusher: JoinHandle<()>,
    released: AtomicBool,
}

impl Drop for LocalPersistence {
    fn drop(&mut self) {
        self.flusher.abort();
    }
}

impl LocalPersistence {
    /// Buffer an update. It reaches the disk on the next debounced commit or flush.
    pub fn enqueue(&self, update: Vec<u8>) {
        if self.released.load(Ordering::Acquire) {
            debug!("Ignoring update for released adapter of '{}'", self.id);
            return;
        }
        self.queue.push(update);
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    /// Number of updates not yet committed
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// Commit every buffered write, waiting until it is on disk
    pub async fn flush(&self) -> SyncResult<Flushed> {
        let count = self.queue.commit().await?;
        if count > 0 {
            debug!("Flushed {} updates for '{}'", count, self.id);
        }
        Ok(Flushed { _private: () })
    }

    /// Replace the whole log with a single state update
    pub async fn compact(&self, state: Vec<u8>) -> SyncResult<()> {
        let _io = self.queue.io.lock().await;
        let mut encoder: Vec<u8> = Vec::new();
        Write::write_buf(&mut encoder, &state);

        let tmp = self.queue.path.with_extension("ylog.tmp");
        tokio::fs::write(&tmp, &encoder).await?;
        tokio::fs::rename(&tmp, &self.queue.path).await?;
        info!("Compacted local log of '{}'", self.id);
        Ok(())
    }

    /// Release the adapter after a successful flush
    pub fn destroy(&self, _flushed: Flushed) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        self.flusher.abort();
        let left = self.queue.len();
        if left > 0 {
            warn!(
                "{} updates for '{}' arrived after the final flush",
                left, self.id
            );
        }
        debug!("Destroyed local adapter for '{}'", self.id);
    }

    /// Release the adapter without a flush, dropping whatever is still buffered
    pub fn abandon(&self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        self.flusher.abort();
        let dropped = self.queue.len();
        if dropped > 0 {
            warn!(
                "Dropping {} unflushed updates for '{}'",
                dropped, self.id
            );
        }
    }
}
