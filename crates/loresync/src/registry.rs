use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{broadcast, watch, OnceCell};
use tracing::{debug, info};

use crate::awareness::UserInfo;
use crate::channel::Transport;
use crate::config::ClientConfig;
use crate::connection::{DocumentConnection, Notice, Wiring};
use crate::content::{export_from, import_into, Node};
use crate::error::{SyncError, SyncResult};
use crate::id::DocumentId;
use crate::local::LocalStore;
use crate::status::SyncStatus;

/// Slot of one document id. Concurrent opens share the cell, so the local
/// load runs once and every caller gets the same connection.
type Slot = Arc<OnceCell<Arc<DocumentConnection>>>;

/// Options of a single `open` call
#[derive(Debug, Clone, Default)]
pub struct OpenOptions {
    /// Presence metadata of the consumer binding to the document
    pub user: Option<UserInfo>,
}

impl OpenOptions {
    /// Bind a consumer with the given display name
    pub fn with_user(name: impl Into<String>) -> Self {
        Self {
            user: Some(UserInfo::new(name)),
        }
    }
}

struct RegistryInner {
    config: ClientConfig,
    store: LocalStore,
    transport: Arc<dyn Transport>,
    entries: DashMap<String, Slot>,
    generation: AtomicU64,
    notices: broadcast::Sender<Notice>,
}

/// Table of open document connections, at most one per document id
///
/// The registry owns every connection it opens and tears them down on
/// [`ConnectionRegistry::close`] or [`ConnectionRegistry::close_all`].
#[derive(Clone)]
pub struct ConnectionRegistry {
    inner: Arc<RegistryInner>,
}

impl ConnectionRegistry {
    /// Create an empty registry connecting through `transport`
    pub fn new(config: ClientConfig, transport: Arc<dyn Transport>) -> Self {
        let (notices, _) = broadcast::channel(64);
        Self {
            inner: Arc::new(RegistryInner {
                store: LocalStore::new(config.local_store_path.clone()),
                config,
                transport,
                entries: DashMap::new(),
                generation: AtomicU64::new(0),
                notices,
            }),
        }
    }

    /// Registry connecting over WebSocket
    #[cfg(feature = "client")]
    pub fn with_websocket(config: ClientConfig) -> Self {
        Self::new(config, Arc::new(crate::channel::WebSocketTransport::new()))
    }

    /// Get the client configuration
    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// Open a document, or return the connection already open for its id.
    ///
    /// The consumer in `options` is bound only once per connection; opening
    /// an already bound document again changes nothing.
    pub async fn open(
        &self,
        id: &DocumentId,
        options: OpenOptions,
    ) -> SyncResult<Arc<DocumentConnection>> {
        if let Some(user) = &options.user {
            if user.name.trim().is_empty() {
                return Err(SyncError::MissingInput("display name".to_string()));
            }
        }

        let key = id.composite_key();
        let slot = self.inner.entries.entry(key.clone()).or_default().clone();

        let result = slot
            .get_or_try_init(|| self.connect(id.clone(), key.clone()))
            .await
            .cloned();
        let connection = match result {
            Ok(connection) => connection,
            Err(e) => {
                self.inner
                    .entries
                    .remove_if(&key, |_, current| Arc::ptr_eq(current, &slot));
                return Err(e);
            }
        };

        if let Some(user) = options.user {
            if !connection.bind_consumer(user) {
                debug!("'{}' already has a bound consumer", id);
            }
        }
        Ok(connection)
    }

    /// Parse a colon-delimited id and open it. Malformed ids fail before any
    /// connection attempt.
    pub async fn open_str(
        &self,
        raw: &str,
        options: OpenOptions,
    ) -> SyncResult<Arc<DocumentConnection>> {
        let id = DocumentId::parse(raw)?;
        self.open(&id, options).await
    }

    async fn connect(&self, id: DocumentId, key: String) -> SyncResult<Arc<DocumentConnection>> {
        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let registry = Arc::downgrade(&self.inner);
        let wiring = Wiring {
            generation,
            membership: Box::new(move || is_member(&registry, &key, generation)),
            notices: self.inner.notices.clone(),
            transport: self.inner.transport.clone(),
        };
        DocumentConnection::open(id, &self.inner.store, &self.inner.config, wiring).await
    }

    /// Get the open connection of a document
    pub fn get(&self, id: &DocumentId) -> Option<Arc<DocumentConnection>> {
        self.inner
            .entries
            .get(&id.composite_key())
            .and_then(|slot| slot.get().cloned())
    }

    /// Check whether a document has an open connection
    pub fn is_open(&self, id: &DocumentId) -> bool {
        self.get(id).is_some()
    }

    /// Ids of every open document
    pub fn open_documents(&self) -> Vec<DocumentId> {
        self.inner
            .entries
            .iter()
            .filter_map(|entry| entry.value().get().map(|c| c.id().clone()))
            .collect()
    }

    /// Number of open connections
    pub fn connection_count(&self) -> usize {
        self.open_documents().len()
    }

    /// Tear down one connection. Returns false when the id was not open.
    ///
    /// An open of the same id still loading is waited for, and the
    /// connection it produces is closed.
    pub async fn close(&self, id: &DocumentId) -> bool {
        let slot = self
            .inner
            .entries
            .get(&id.composite_key())
            .map(|slot| slot.clone());
        let connection = match slot {
            Some(slot) => slot
                .get_or_try_init(|| async {
                    Err(SyncError::MissingInput(format!("document '{}' is not open", id)))
                })
                .await
                .ok()
                .cloned(),
            None => None,
        };
        let Some(connection) = connection else {
            debug!("Attempted to close '{}' which is not open", id);
            return false;
        };
        connection.cancel_reconnect();
        self.finish(&connection).await;
        true
    }

    /// Tear down every connection. All reconnect timers are cancelled before
    /// the first connection is destroyed.
    pub async fn close_all(&self) {
        let connections: Vec<_> = self
            .inner
            .entries
            .iter()
            .filter_map(|entry| entry.value().get().cloned())
            .collect();

        for connection in &connections {
            connection.cancel_reconnect();
        }
        for connection in &connections {
            self.finish(connection).await;
        }
        info!("Closed {} connections", connections.len());
    }

    async fn finish(&self, connection: &Arc<DocumentConnection>) {
        connection.teardown().await;
        self.inner
            .entries
            .remove_if(&connection.id().composite_key(), |_, slot| {
                slot.get().is_some_and(|c| Arc::ptr_eq(c, connection))
            });
    }

    /// Reactive status of an open document
    pub fn status(&self, id: &DocumentId) -> Option<watch::Receiver<SyncStatus>> {
        self.get(id).map(|c| c.status())
    }

    /// Current status, `Unavailable` for documents that are not open
    pub fn current_status(&self, id: &DocumentId) -> SyncStatus {
        self.get(id)
            .map(|c| c.current_status())
            .unwrap_or(SyncStatus::Unavailable)
    }

    /// Whether an open document has local changes the remote has not confirmed
    pub fn has_unsynced_changes(&self, id: &DocumentId) -> bool {
        self.get(id).is_some_and(|c| c.has_unsynced_changes())
    }

    /// Structural snapshot of an open document's content
    pub fn content(&self, id: &DocumentId) -> Option<Vec<Node>> {
        self.get(id).map(|c| export_from(&c))
    }

    /// Replace the content of an open document with parsed markup
    pub fn import(&self, id: &DocumentId, markup: &str) -> SyncResult<()> {
        let connection = self.get(id).ok_or_else(|| {
            SyncError::MissingInput(format!("document '{}' is not open", id))
        })?;
        import_into(&connection, markup)
    }

    /// Tell every channel the network is back
    pub fn network_restored(&self) {
        for entry in self.inner.entries.iter() {
            if let Some(connection) = entry.value().get() {
                connection.network_restored();
            }
        }
    }

    /// Subscribe to authentication and retry notices of every connection
    pub fn subscribe_notices(&self) -> broadcast::Receiver<Notice> {
        self.inner.notices.subscribe()
    }
}

/// A slot still loading counts as a member, its connection may already be
/// running its first channel attempt.
fn is_member(registry: &Weak<RegistryInner>, key: &str, generation: u64) -> bool {
    let Some(registry) = registry.upgrade() else {
        return false;
    };
    registry
        .entries
        .get(key)
        .is_some_and(|slot| slot.get().map_or(true, |c| c.generation() == generation))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::mock::MockTransport;
    use crate::config::RetryConfig;
    use crate::content::Node;
    use tempfile::TempDir;
    use tokio::time::{timeout, Duration};

    fn doc_id() -> DocumentId {
        DocumentId::parse("alice:saga:chapter-1").unwrap()
    }

    fn registry(temp_dir: &TempDir, transport: &MockTransport, remote: bool) -> ConnectionRegistry {
        let mut config = ClientConfig::new(temp_dir.path())
            .with_write_debounce(Duration::from_secs(3600))
            .with_retry(RetryConfig {
                initial_delay_ms: 20,
                ..RetryConfig::default()
            });
        if remote {
            config = config.with_endpoint("ws://sync.test/sync").unwrap();
        }
        ConnectionRegistry::new(config, Arc::new(transport.clone()))
    }

    async fn wait_synced(connection: &DocumentConnection) {
        let mut status = connection.status();
        timeout(
            Duration::from_secs(5),
            status.wait_for(|s| *s == SyncStatus::Synced),
        )
        .await
        .expect("never synced")
        .unwrap();
    }

    #[tokio::test]
    async fn test_close_waits_for_loading_open() {
        let temp_dir = TempDir::new().unwrap();
        let transport = MockTransport::new();
        let registry = registry(&temp_dir, &transport, false);
        let id = doc_id();

        let opening = {
            let registry = registry.clone();
            let id = id.clone();
            tokio::spawn(async move { registry.open(&id, OpenOptions::default()).await })
        };
        while !registry.inner.entries.contains_key(&id.composite_key()) {
            tokio::task::yield_now().await;
        }

        assert!(registry.close(&id).await);
        assert!(!registry.is_open(&id));

        let connection = opening.await.unwrap().unwrap();
        assert!(connection.is_closed());
        assert_eq!(registry.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_malformed_id_never_connects() {
        let temp_dir = TempDir::new().unwrap();
        let transport = MockTransport::new();
        let registry = registry(&temp_dir, &transport, true);

        let result = registry.open_str("alice::chapter", OpenOptions::default()).await;
        assert!(matches!(result, Err(SyncError::InvalidDocumentId { .. })));
        assert_eq!(registry.connection_count(), 0);
        assert_eq!(transport.connects(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_opens_share_one_connection() {
        let temp_dir = TempDir::new().unwrap();
        let transport = MockTransport::new();
        let registry = registry(&temp_dir, &transport, true);

        let opens: Vec<_> = (0..8)
            .map(|_| {
                let registry = registry.clone();
                tokio::spawn(async move {
                    registry.open(&doc_id(), OpenOptions::default()).await
                })
            })
            .collect();
        let mut connections = Vec::new();
        for open in opens {
            connections.push(open.await.unwrap().unwrap());
        }

        assert!(connections
            .iter()
            .all(|c| Arc::ptr_eq(c, &connections[0])));
        wait_synced(&connections[0]).await;
        assert_eq!(transport.connects(), 1);
        assert_eq!(registry.connection_count(), 1);
        registry.close_all().await;
    }

    #[tokio::test]
    async fn test_second_open_keeps_first_consumer() {
        let temp_dir = TempDir::new().unwrap();
        let transport = MockTransport::new();
        let registry = registry(&temp_dir, &transport, false);

        let first = registry
            .open(&doc_id(), OpenOptions::with_user("Alice"))
            .await
            .unwrap();
        let second = registry
            .open(&doc_id(), OpenOptions::with_user("Mallory"))
            .await
            .unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert!(!second.bind_consumer(UserInfo::new("Eve")));
        registry.close_all().await;
    }

    #[tokio::test]
    async fn test_close_flushes_pending_writes() {
        let temp_dir = TempDir::new().unwrap();
        let transport = MockTransport::new();
        let registry = registry(&temp_dir, &transport, false);

        registry.open(&doc_id(), OpenOptions::default()).await.unwrap();
        registry
            .import(&doc_id(), "<paragraph>unsaved <bold>words</bold></paragraph>")
            .unwrap();
        assert!(registry.close(&doc_id()).await);
        assert!(!registry.is_open(&doc_id()));
        assert!(!registry.close(&doc_id()).await);

        registry.open(&doc_id(), OpenOptions::default()).await.unwrap();
        let content = registry.content(&doc_id()).unwrap();
        assert_eq!(content.len(), 1);
        assert!(matches!(&content[0], Node::Element { tag, .. } if tag == "paragraph"));
        registry.close_all().await;
    }

    #[tokio::test]
    async fn test_closed_connection_never_reconnects() {
        let temp_dir = TempDir::new().unwrap();
        let transport = MockTransport::new();
        let registry = registry(&temp_dir, &transport, true);

        let connection = registry.open(&doc_id(), OpenOptions::default()).await.unwrap();
        wait_synced(&connection).await;
        registry.close(&doc_id()).await;

        transport.drop_links();
        registry.network_restored();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(transport.connects(), 1);
        assert_eq!(registry.current_status(&doc_id()), SyncStatus::Unavailable);
    }

    #[tokio::test]
    async fn test_reopen_after_close_is_a_fresh_connection() {
        let temp_dir = TempDir::new().unwrap();
        let transport = MockTransport::new();
        let registry = registry(&temp_dir, &transport, true);

        let first = registry.open(&doc_id(), OpenOptions::default()).await.unwrap();
        wait_synced(&first).await;
        registry.close(&doc_id()).await;

        let second = registry.open(&doc_id(), OpenOptions::default()).await.unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert!(second.generation() > first.generation());
        wait_synced(&second).await;
        assert_eq!(transport.connects(), 2);
        registry.close_all().await;
    }

    #[tokio::test]
    async fn test_close_all_tears_down_everything() {
        let temp_dir = TempDir::new().unwrap();
        let transport = MockTransport::new();
        let registry = registry(&temp_dir, &transport, true);

        let ids: Vec<DocumentId> = ["alice:saga:one", "alice:saga:two", "bob:notes:one"]
            .iter()
            .map(|raw| DocumentId::parse(raw).unwrap())
            .collect();
        for id in &ids {
            let connection = registry.open(id, OpenOptions::default()).await.unwrap();
            wait_synced(&connection).await;
        }
        assert_eq!(registry.connection_count(), 3);

        registry.close_all().await;
        assert_eq!(registry.connection_count(), 0);
        assert!(ids.iter().all(|id| !registry.is_open(id)));
    }
}
