use std::path::PathBuf;
use tracing::{debug, info, warn};
use yrs::updates::decoder::Decode;
use yrs::{Doc, ReadTxn, StateVector, Transact, Update};

use super::backing::BackingStores;
use crate::error::{SyncError, SyncResult};
use crate::id::ProjectKey;

/// Durable server-side document store
///
/// Every document lives in the backing store of its project under its
/// composite key. Each persisted record is the full document state, so
/// loading merges all records and compaction keeps only the merged state.
pub struct DocumentStore {
    backing: BackingStores,
    compaction_threshold: usize,
}

impl DocumentStore {
    pub fn new(root: impl Into<PathBuf>, compaction_threshold: usize) -> Self {
        Self {
            backing: BackingStores::new(root),
            compaction_threshold,
        }
    }

    pub fn backing(&self) -> &BackingStores {
        &self.backing
    }

    /// Load a document, or an empty one if nothing was stored for it yet
    pub async fn load_or_create(&self, project: &ProjectKey, document_id: &str) -> SyncResult<Doc> {
        let key = project.document(document_id)?.composite_key();
        let log = self.backing.open(project).await?;
        let records = log.read(&key).await?;

        let doc = Doc::new();
        let applied = apply_records(&doc, &records);
        debug!("Loaded '{}' from {} of {} records", key, applied, records.len());
        Ok(doc)
    }

    /// Append the full current state of `doc`
    pub async fn persist(&self, doc: &Doc, project: &ProjectKey, document_id: &str) -> SyncResult<()> {
        let state = doc
            .transact()
            .encode_state_as_update_v1(&StateVector::default());
        self.persist_state(project, document_id, state).await
    }

    /// Append an already encoded full state
    pub async fn persist_state(
        &self,
        project: &ProjectKey,
        document_id: &str,
        state: Vec<u8>,
    ) -> SyncResult<()> {
        let key = project.document(document_id)?.composite_key();
        let log = self.backing.open(project).await?;
        let count = log.append(&key, &state).await?;

        if count > self.compaction_threshold {
            log.compact(&key, merge_records).await?;
        }
        info!("Persisted '{}' ({} bytes)", key, state.len());
        Ok(())
    }

    /// Load a document, apply an update to it and persist the result
    pub async fn apply_update(
        &self,
        project: &ProjectKey,
        document_id: &str,
        update: &[u8],
    ) -> SyncResult<Doc> {
        // Decoded updates are not Send, so nothing decoded lives across an await
        decode_update(update)?;
        let doc = self.load_or_create(project, document_id).await?;
        {
            let decoded = decode_update(update)?;
            let mut txn = doc.transact_mut();
            txn.apply_update(decoded);
        }
        self.persist(&doc, project, document_id).await?;
        Ok(doc)
    }
}

pub(crate) fn decode_update(update: &[u8]) -> SyncResult<Update> {
    Update::decode_v1(update).map_err(|e| SyncError::Decode(format!("invalid update: {}", e)))
}

fn apply_records(doc: &Doc, records: &[Vec<u8>]) -> usize {
    let mut applied = 0;
    let mut txn = doc.transact_mut();
    for record in records {
        match Update::decode_v1(record) {
            Ok(update) => {
                txn.apply_update(update);
                applied += 1;
            }
            Err(e) => warn!("Skipping unreadable record: {}", e),
        }
    }
    applied
}

/// Merge full-state records into one
fn merge_records(records: &[Vec<u8>]) -> SyncResult<Vec<u8>> {
    let doc = Doc::new();
    apply_records(&doc, records);
    let state = doc
        .transact()
        .encode_state_as_update_v1(&StateVector::default());
    Ok(state)
}
