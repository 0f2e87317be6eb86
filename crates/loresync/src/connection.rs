//! One open document: its replicated state, local adapter, remote channel and
//! status, wired together.
//!
//! Every mutation goes through [`DocumentConnection::transact`], which tags it
//! with an [`UpdateOrigin`] and routes the produced update: it is always queued
//! to the local adapter, and unless it came from the channel it is forwarded to
//! the channel and marks the document as having unsynced changes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{
    Doc, ReadTxn, StateVector, Transact, Transaction, TransactionMut, Update, XmlFragmentRef,
};

use crate::awareness::{Awareness, AwarenessEntry, CursorPosition, UserInfo};
use crate::channel::{
    endpoint_for, ChannelEvent, ChannelHost, ChannelOptions, ChannelState, RemoteChannel,
    Transport,
};
use crate::config::ClientConfig;
use crate::error::{SyncError, SyncResult};
use crate::id::DocumentId;
use crate::local::{LocalPersistence, LocalStore, COMPACTION_THRESHOLD};
use crate::protocol::Frame;
use crate::status::{StatusEvent, StatusTracker, SyncStatus};

/// Name of the root fragment holding the structured content
pub const CONTENT_ROOT: &str = "content";

/// Encoding of an update that changes nothing
const EMPTY_UPDATE: [u8; 2] = [0, 0];

/// Where a mutation came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UpdateOrigin {
    /// Edit made by a consumer of the connection
    Local,
    /// Update received over the remote channel
    Channel,
    /// Content replaced by the converter
    Import,
}

impl UpdateOrigin {
    /// Transaction origin tag seen by document observers
    pub fn tag(self) -> &'static str {
        match self {
            UpdateOrigin::Local => "loresync:local",
            UpdateOrigin::Channel => "loresync:channel",
            UpdateOrigin::Import => "loresync:import",
        }
    }
}

/// Connection-level notifications that need the consumer's attention
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    /// The endpoint refused the credentials, the channel will not retry
    AuthenticationFailed { id: DocumentId, reason: String },
    /// Automatic reconnects stopped until the network is reported restored
    RetriesExhausted { id: DocumentId },
}

/// Checks whether a connection is still the registered one for its id
pub(crate) type Membership = Box<dyn Fn() -> bool + Send + Sync>;

/// Registry-provided pieces a connection is built with
pub(crate) struct Wiring {
    pub generation: u64,
    pub membership: Membership,
    pub notices: broadcast::Sender<Notice>,
    pub transport: Arc<dyn Transport>,
}

pub struct DocumentConnection {
    id: DocumentId,
    generation: u64,
    doc: Doc,
    txn_lock: Mutex<()>,
    local: LocalPersistence,
    channel: Mutex<Option<RemoteChannel>>,
    status: StatusTracker,
    unsynced: AtomicBool,
    awareness: Mutex<Awareness>,
    consumer_bound: AtomicBool,
    closed: AtomicBool,
    membership: Membership,
    notices: broadcast::Sender<Notice>,
}

impl DocumentConnection {
    /// Load the document from the local store, then start its remote channel
    /// when an endpoint is configured.
    pub(crate) async fn open(
        id: DocumentId,
        store: &LocalStore,
        config: &ClientConfig,
        wiring: Wiring,
    ) -> SyncResult<Arc<Self>> {
        let (local, initial) = store.open(&id, config.write_debounce()).await?;

        let doc = Doc::new();
        {
            let mut txn = doc.transact_mut();
            for (index, stored) in initial.updates.iter().enumerate() {
                match Update::decode_v1(stored) {
                    Ok(update) => {
                        txn.apply_update(update);
                    }
                    Err(e) => warn!(
                        "Skipping unreadable stored update {} of '{}': {}",
                        index, id, e
                    ),
                }
            }
        }

        if initial.updates.len() > COMPACTION_THRESHOLD {
            let state = doc
                .transact()
                .encode_state_as_update_v1(&StateVector::default());
            if let Err(e) = local.compact(state).await {
                warn!("Could not compact local log of '{}': {}", id, e);
            }
        }

        let status = StatusTracker::new();
        status.apply(StatusEvent::LocalLoaded);
        info!(
            "Opened '{}' with {} stored updates",
            id,
            initial.updates.len()
        );

        let awareness = Awareness::new(doc.client_id());
        let connection = Arc::new(Self {
            id,
            generation: wiring.generation,
            doc,
            txn_lock: Mutex::new(()),
            local,
            channel: Mutex::new(None),
            status,
            unsynced: AtomicBool::new(false),
            awareness: Mutex::new(awareness),
            consumer_bound: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            membership: wiring.membership,
            notices: wiring.notices,
        });

        if let Some(base) = &config.endpoint {
            let options = ChannelOptions {
                endpoint: endpoint_for(base, &connection.id, config.access_token.as_deref()),
                handshake_timeout: config.handshake_timeout(),
                retry: config.retry.clone(),
            };
            let host: Arc<dyn ChannelHost> = connection.clone();
            let channel = RemoteChannel::spawn(Arc::downgrade(&host), wiring.transport, options);
            if let Ok(mut slot) = connection.channel.lock() {
                *slot = Some(channel);
            }
        }

        Ok(connection)
    }

    /// Get the document id
    pub fn id(&self) -> &DocumentId {
        &self.id
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }

    fn txn_guard(&self) -> MutexGuard<'_, ()> {
        self.txn_lock.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run a mutation against the content root in one transaction and route
    /// the resulting update according to `origin`.
    pub fn transact<R>(
        &self,
        origin: UpdateOrigin,
        f: impl FnOnce(&mut TransactionMut<'_>, &XmlFragmentRef) -> R,
    ) -> R {
        let (result, update) = {
            let _guard = self.txn_guard();
            let root = self.doc.get_or_insert_xml_fragment(CONTENT_ROOT);
            let mut txn = self.doc.transact_mut_with(origin.tag());
            let result = f(&mut txn, &root);
            let update = txn.encode_update_v1();
            drop(txn);
            (result, update)
        };
        self.route_update(origin, update);
        result
    }

    /// Read the content root
    pub fn read<R>(&self, f: impl FnOnce(&Transaction<'_>, &XmlFragmentRef) -> R) -> R {
        let _guard = self.txn_guard();
        let root = self.doc.get_or_insert_xml_fragment(CONTENT_ROOT);
        let txn = self.doc.transact();
        f(&txn, &root)
    }

    fn route_update(&self, origin: UpdateOrigin, update: Vec<u8>) {
        if update == EMPTY_UPDATE {
            return;
        }
        if self.closed.load(Ordering::Acquire) {
            debug!("Update on closed connection '{}' is not routed", self.id);
            return;
        }

        self.local.enqueue(update.clone());
        if origin == UpdateOrigin::Channel {
            return;
        }
        self.unsynced.store(true, Ordering::Release);
        if let Ok(channel) = self.channel.lock() {
            if let Some(channel) = channel.as_ref() {
                channel.send(Frame::Update(update));
            }
        }
    }

    /// Full state of the document as one update
    pub fn full_state(&self) -> Vec<u8> {
        let _guard = self.txn_guard();
        self.doc
            .transact()
            .encode_state_as_update_v1(&StateVector::default())
    }

    /// Apply an update from any source other than the channel
    pub fn apply_update(&self, origin: UpdateOrigin, update: &[u8]) -> SyncResult<()> {
        let update = Update::decode_v1(update)
            .map_err(|e| SyncError::Decode(format!("invalid update: {}", e)))?;
        self.transact(origin, |txn, _| {
            txn.apply_update(update);
        });
        Ok(())
    }

    /// Watch the sync status
    pub fn status(&self) -> watch::Receiver<SyncStatus> {
        self.status.watch()
    }

    /// Get the current sync status
    pub fn current_status(&self) -> SyncStatus {
        self.status.get()
    }

    /// Subscribe to every status transition, in order
    pub fn subscribe_transitions(&self) -> broadcast::Receiver<SyncStatus> {
        self.status.subscribe_transitions()
    }

    /// Whether local changes were made since the channel last connected
    pub fn has_unsynced_changes(&self) -> bool {
        self.unsynced.load(Ordering::Acquire)
    }

    /// State of the remote channel, `None` without an endpoint
    pub fn channel_state(&self) -> Option<ChannelState> {
        self.channel
            .lock()
            .ok()
            .and_then(|channel| channel.as_ref().map(|c| c.state()))
    }

    /// Attach the consumer's presence metadata. Only the first call has an
    /// effect, later calls return false.
    pub fn bind_consumer(&self, user: UserInfo) -> bool {
        if self.consumer_bound.swap(true, Ordering::AcqRel) {
            return false;
        }
        let update = match self.awareness.lock() {
            Ok(mut awareness) => {
                awareness.set_user(user);
                awareness.encode_local()
            }
            Err(_) => return false,
        };
        self.send_frame(Frame::Awareness(update));
        true
    }

    /// Publish the local cursor to peers
    pub fn set_cursor(&self, cursor: Option<CursorPosition>) -> bool {
        let update = match self.awareness.lock() {
            Ok(mut awareness) => {
                if !awareness.set_cursor(cursor) {
                    return false;
                }
                awareness.encode_local()
            }
            Err(_) => return false,
        };
        self.send_frame(Frame::Awareness(update));
        true
    }

    /// Presence entries of the other connected clients
    pub fn peers(&self) -> Vec<AwarenessEntry> {
        self.awareness
            .lock()
            .map(|awareness| awareness.peers())
            .unwrap_or_default()
    }

    fn send_frame(&self, frame: Frame) {
        if let Ok(channel) = self.channel.lock() {
            if let Some(channel) = channel.as_ref() {
                channel.send(frame);
            }
        }
    }

    /// Commit buffered local writes
    pub async fn flush(&self) -> SyncResult<()> {
        self.local.flush().await.map(|_| ())
    }

    /// Stop scheduled reconnects
    pub fn cancel_reconnect(&self) {
        if let Ok(channel) = self.channel.lock() {
            if let Some(channel) = channel.as_ref() {
                channel.cancel_reconnect();
            }
        }
    }

    /// Retry the remote right away if the channel is disconnected
    pub fn network_restored(&self) {
        if let Ok(channel) = self.channel.lock() {
            if let Some(channel) = channel.as_ref() {
                channel.network_restored();
            }
        }
    }

    /// Release everything the connection holds, in order: reconnect timer,
    /// awareness, channel link, channel task, local writes, document.
    pub(crate) async fn teardown(&self) {
        self.cancel_reconnect();

        let farewell = match self.awareness.lock() {
            Ok(mut awareness) => {
                awareness.clear_local();
                awareness.clear_peers();
                Some(awareness.encode_local())
            }
            Err(_) => None,
        };
        if let Some(update) = farewell {
            self.send_frame(Frame::Awareness(update));
        }

        let channel = match self.channel.lock() {
            Ok(mut slot) => {
                if let Some(channel) = slot.as_ref() {
                    channel.disconnect();
                }
                slot.take()
            }
            Err(_) => None,
        };
        if let Some(channel) = channel {
            channel.destroy().await;
        }

        match self.local.flush().await {
            Ok(flushed) => self.local.destroy(flushed),
            Err(e) => {
                warn!("Final flush of '{}' failed: {}", self.id, e);
                self.local.abandon();
            }
        }

        self.closed.store(true, Ordering::Release);
        info!("Closed '{}'", self.id);
    }

    /// Whether the connection has been torn down
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl ChannelHost for DocumentConnection {
    fn document_id(&self) -> &DocumentId {
        &self.id
    }

    fn state_vector(&self) -> Vec<u8> {
        let _guard = self.txn_guard();
        self.doc.transact().state_vector().encode_v1()
    }

    fn diff_since(&self, state_vector: &[u8]) -> SyncResult<Vec<u8>> {
        let state_vector = StateVector::decode_v1(state_vector)
            .map_err(|e| SyncError::Decode(format!("invalid state vector: {}", e)))?;
        let _guard = self.txn_guard();
        Ok(self.doc.transact().encode_diff_v1(&state_vector))
    }

    fn apply_remote(&self, update: &[u8]) -> SyncResult<()> {
        self.apply_update(UpdateOrigin::Channel, update)
    }

    fn local_awareness(&self) -> Vec<u8> {
        self.awareness
            .lock()
            .map(|awareness| awareness.encode_local())
            .unwrap_or_default()
    }

    fn apply_awareness(&self, update: &[u8]) {
        if let Ok(mut awareness) = self.awareness.lock() {
            if let Err(e) = awareness.apply_update(update) {
                debug!("Ignoring awareness update for '{}': {}", self.id, e);
            }
        }
    }

    fn is_registered(&self) -> bool {
        !self.is_closed() && (self.membership)()
    }

    fn on_channel_event(&self, event: &ChannelEvent) {
        match event {
            ChannelEvent::Connecting { .. } => {
                self.status.apply(StatusEvent::ChannelConnecting);
            }
            ChannelEvent::Connected => {
                self.unsynced.store(false, Ordering::Release);
                self.status.apply(StatusEvent::ChannelConnected);
            }
            ChannelEvent::Disconnected { .. } => {
                if let Ok(mut awareness) = self.awareness.lock() {
                    awareness.clear_peers();
                }
                self.status.apply(StatusEvent::ChannelDisconnected);
            }
            ChannelEvent::AuthFailed { reason } => {
                if let Ok(mut awareness) = self.awareness.lock() {
                    awareness.clear_peers();
                }
                self.status.apply(StatusEvent::AuthFailed);
                let _ = self.notices.send(Notice::AuthenticationFailed {
                    id: self.id.clone(),
                    reason: reason.clone(),
                });
            }
            ChannelEvent::RetriesExhausted => {
                let _ = self.notices.send(Notice::RetriesExhausted {
                    id: self.id.clone(),
                });
            }
            ChannelEvent::RetryScheduled { .. } | ChannelEvent::Closed => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::mock::{MockTransport, Reply};
    use crate::config::RetryConfig;
    use crate::content::{export_from, import_into, Node};
    use tempfile::TempDir;
    use tokio::time::{timeout, Duration};
    use yrs::XmlFragment;

    fn doc_id() -> DocumentId {
        DocumentId::parse("alice:saga:chapter-1").unwrap()
    }

    fn config(temp_dir: &TempDir, remote: bool) -> ClientConfig {
        let config = ClientConfig::new(temp_dir.path())
            .with_write_debounce(Duration::from_secs(3600))
            .with_retry(RetryConfig {
                initial_delay_ms: 20,
                ..RetryConfig::default()
            });
        if remote {
            config.with_endpoint("ws://sync.test/sync").unwrap()
        } else {
            config
        }
    }

    async fn open(
        temp_dir: &TempDir,
        remote: bool,
        transport: &MockTransport,
    ) -> (Arc<DocumentConnection>, broadcast::Receiver<Notice>) {
        let (notices, notice_rx) = broadcast::channel(16);
        let connection = DocumentConnection::open(
            doc_id(),
            &LocalStore::new(temp_dir.path()),
            &config(temp_dir, remote),
            Wiring {
                generation: 1,
                membership: Box::new(|| true),
                notices,
                transport: Arc::new(transport.clone()),
            },
        )
        .await
        .unwrap();
        (connection, notice_rx)
    }

    async fn wait_status(connection: &DocumentConnection, expected: SyncStatus) {
        let mut status = connection.status();
        timeout(Duration::from_secs(5), status.wait_for(|s| *s == expected))
            .await
            .expect("status not reached")
            .unwrap();
    }

    #[tokio::test]
    async fn test_local_only_connection() {
        let temp_dir = TempDir::new().unwrap();
        let (connection, _) = open(&temp_dir, false, &MockTransport::new()).await;

        assert_eq!(connection.current_status(), SyncStatus::Local);
        assert_eq!(connection.channel_state(), None);
        assert!(!connection.has_unsynced_changes());

        import_into(&connection, "<paragraph>offline draft</paragraph>").unwrap();
        assert!(connection.has_unsynced_changes());
        connection.teardown().await;
    }

    #[tokio::test]
    async fn test_connect_sequence_and_flag() {
        let temp_dir = TempDir::new().unwrap();
        let transport = MockTransport::new();
        let (connection, _) = open(&temp_dir, true, &transport).await;

        let mut transitions = connection.subscribe_transitions();
        assert_eq!(connection.current_status(), SyncStatus::Local);
        import_into(&connection, "<paragraph>before sync</paragraph>").unwrap();
        assert!(connection.has_unsynced_changes());

        assert_eq!(transitions.recv().await.unwrap(), SyncStatus::Syncing);
        assert_eq!(transitions.recv().await.unwrap(), SyncStatus::Synced);
        assert!(!connection.has_unsynced_changes());

        // The handshake carries the offline edit to the server
        let mut server_children = 0;
        for _ in 0..100 {
            let server = Doc::new();
            {
                let mut txn = server.transact_mut();
                txn.apply_update(Update::decode_v1(&transport.state()).unwrap());
            }
            let root = server.get_or_insert_xml_fragment(CONTENT_ROOT);
            server_children = root.len(&server.transact());
            if server_children == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(server_children, 1);
        connection.teardown().await;
    }

    #[tokio::test]
    async fn test_remote_updates_do_not_flag_changes() {
        let temp_dir = TempDir::new().unwrap();
        let transport = MockTransport::new();
        let (connection, _) = open(&temp_dir, true, &transport).await;
        wait_status(&connection, SyncStatus::Synced).await;

        let remote = Doc::new();
        let root = remote.get_or_insert_xml_fragment(CONTENT_ROOT);
        let update = {
            let mut txn = remote.transact_mut();
            crate::content::convert::replace_content(
                &mut txn,
                &root,
                &[Node::element("paragraph", vec![Node::text("from a peer")])],
            );
            txn.encode_update_v1()
        };
        transport.push(Frame::Update(update));

        for _ in 0..100 {
            if !export_from(&connection).is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(
            export_from(&connection),
            vec![Node::element("paragraph", vec![Node::text("from a peer")])]
        );
        assert!(!connection.has_unsynced_changes());
        connection.teardown().await;
    }

    #[tokio::test]
    async fn test_drop_goes_offline_and_auth_failure_notifies() {
        let temp_dir = TempDir::new().unwrap();
        let transport = MockTransport::new();
        transport.script(Reply::Accept);
        transport.script(Reply::Refuse("HTTP error: 403 Forbidden".to_string()));
        let (connection, mut notices) = open(&temp_dir, true, &transport).await;
        wait_status(&connection, SyncStatus::Synced).await;

        let mut transitions = connection.subscribe_transitions();
        transport.drop_links();
        assert_eq!(transitions.recv().await.unwrap(), SyncStatus::Offline);
        assert_eq!(transitions.recv().await.unwrap(), SyncStatus::Syncing);
        assert_eq!(transitions.recv().await.unwrap(), SyncStatus::Unavailable);

        let notice = timeout(Duration::from_secs(5), notices.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(notice, Notice::AuthenticationFailed { .. }));
        assert_eq!(transport.connects(), 2);
        connection.teardown().await;
    }

    #[tokio::test]
    async fn test_teardown_persists_and_stops_routing() {
        let temp_dir = TempDir::new().unwrap();
        let transport = MockTransport::new();
        let (connection, _) = open(&temp_dir, false, &transport).await;
        import_into(&connection, "<heading level=\"2\">Kept</heading>").unwrap();

        connection.teardown().await;
        assert!(connection.is_closed());
        connection.transact(UpdateOrigin::Local, |txn, root| {
            root.push_back(txn, yrs::XmlElementPrelim::empty("paragraph"));
        });

        let (reopened, _) = open(&temp_dir, false, &transport).await;
        let content = export_from(&reopened);
        assert_eq!(content.len(), 1);
        assert!(matches!(&content[0], Node::Element { tag, .. } if tag == "heading"));
        reopened.teardown().await;
    }

    #[tokio::test]
    async fn test_consumer_binds_once_and_reaches_peers() {
        let temp_dir = TempDir::new().unwrap();
        let transport = MockTransport::new();
        let (connection, _) = open(&temp_dir, true, &transport).await;
        wait_status(&connection, SyncStatus::Synced).await;

        assert!(connection.bind_consumer(UserInfo::new("Alice")));
        assert!(!connection.bind_consumer(UserInfo::new("Mallory")));
        assert!(connection.set_cursor(Some(CursorPosition { anchor: 1, head: 4 })));

        let mut peer = Awareness::new(99);
        peer.set_user(UserInfo::new("Bob"));
        transport.push(Frame::Awareness(peer.encode_local()));
        for _ in 0..100 {
            if !connection.peers().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(connection.peers()[0].display_name, "Bob");

        connection.teardown().await;
        assert!(connection.peers().is_empty());
        let sent: Vec<Frame> = transport
            .received()
            .into_iter()
            .filter(|f| matches!(f, Frame::Awareness(_)))
            .collect();
        // Opening state, user, cursor and the farewell
        assert_eq!(sent.len(), 4);
        let Frame::Awareness(last) = &sent[3] else {
            unreachable!()
        };
        let farewell = crate::awareness::AwarenessUpdate::decode(last).unwrap();
        assert_eq!(farewell.entries[0].2, "null");
    }
}
