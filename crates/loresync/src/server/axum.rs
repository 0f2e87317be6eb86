use axum::{
    extract::ws::{rejection::WebSocketUpgradeRejection, Message, WebSocket, WebSocketUpgrade},
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{broadcast, mpsc, OnceCell};
use tracing::{debug, error, info, warn};
use uuid::Uuid;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Doc, ReadTxn, StateVector, Transact};

use super::store::{decode_update, DocumentStore};
use crate::awareness::AwarenessUpdate;
use crate::error::{SyncError, SyncResult};
use crate::id::{DocumentId, ProjectKey};
use crate::protocol::Frame;

/// Path of the sync endpoint
pub const SYNC_PATH: &str = "/sync";

const EMPTY_UPDATE: [u8; 2] = [0, 0];

type RoomSlot = Arc<OnceCell<Arc<Room>>>;

/// Axum state of the sync endpoint
#[derive(Clone)]
pub struct SyncState {
    store: Arc<DocumentStore>,
    rooms: Arc<DashMap<String, RoomSlot>>,
    access_token: Option<Arc<str>>,
}

impl SyncState {
    /// Create a new sync state over a document store
    pub fn new(store: Arc<DocumentStore>) -> Self {
        Self {
            store,
            rooms: Arc::new(DashMap::new()),
            access_token: None,
        }
    }

    /// Require clients to present `token`
    pub fn with_access_token(mut self, token: impl Into<String>) -> Self {
        self.access_token = Some(token.into().into());
        self
    }

    /// Get the document store
    pub fn store(&self) -> &Arc<DocumentStore> {
        &self.store
    }

    /// Number of documents with connected peers
    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    fn authorized(&self, token: Option<&str>) -> bool {
        match &self.access_token {
            Some(expected) => token == Some(expected.as_ref()),
            None => true,
        }
    }

    /// Room of a document with one more peer counted in it
    async fn join(&self, id: &DocumentId) -> SyncResult<Arc<Room>> {
        let key = id.composite_key();
        loop {
            let slot = self.rooms.entry(key.clone()).or_default().clone();
            let loaded = slot
                .get_or_try_init(|| Room::load(&self.store, id.clone()))
                .await
                .cloned();
            let room = match loaded {
                Ok(room) => room,
                Err(e) => {
                    self.rooms
                        .remove_if(&key, |_, current| Arc::ptr_eq(current, &slot));
                    return Err(e);
                }
            };

            // Counted while the map entry is held, so a concurrent leave
            // cannot evict the room in between
            let joined = self.rooms.get(&key).is_some_and(|current| {
                if Arc::ptr_eq(&current, &slot) {
                    room.peers.fetch_add(1, Ordering::SeqCst);
                    true
                } else {
                    false
                }
            });
            if joined {
                return Ok(room);
            }
        }
    }

    fn leave(&self, room: &Arc<Room>) {
        room.peers.fetch_sub(1, Ordering::SeqCst);
        let removed = self.rooms.remove_if(&room.id.composite_key(), |_, slot| {
            room.peers.load(Ordering::SeqCst) == 0
                && slot.get().is_some_and(|current| Arc::ptr_eq(current, room))
        });
        if removed.is_some() {
            debug!("Room of '{}' is empty, unloaded", room.id);
        }
    }
}

/// Query parameters of the sync endpoint
#[derive(Debug, Deserialize)]
pub struct SyncParams {
    pub doc: Option<String>,
    pub token: Option<String>,
}

/// Create a router with the sync endpoint at [`SYNC_PATH`]
pub fn router_with_sync(store: Arc<DocumentStore>) -> Router {
    router_with_sync_state(SyncState::new(store))
}

/// Create a router with the sync endpoint using an existing [`SyncState`]
pub fn router_with_sync_state(state: SyncState) -> Router {
    Router::new()
        .route(SYNC_PATH, get(sync_handler))
        .with_state(state)
}

async fn sync_handler(
    Query(params): Query<SyncParams>,
    State(state): State<SyncState>,
    upgrade: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    if !state.authorized(params.token.as_deref()) {
        warn!("Rejected sync request with invalid token");
        return (StatusCode::UNAUTHORIZED, "401 Unauthorized: invalid access token").into_response();
    }
    let Some(raw_id) = params.doc else {
        return (StatusCode::BAD_REQUEST, "missing doc parameter").into_response();
    };
    let id = match DocumentId::parse(&raw_id) {
        Ok(id) => id,
        Err(e) => return (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
    };
    let upgrade = match upgrade {
        Ok(upgrade) => upgrade,
        Err(rejection) => return rejection.into_response(),
    };
    let room = match state.join(&id).await {
        Ok(room) => room,
        Err(e) => {
            error!("Cannot open room for '{}': {}", id, e);
            return (StatusCode::SERVICE_UNAVAILABLE, e.to_string()).into_response();
        }
    };

    upgrade.on_upgrade(move |socket| serve_socket(socket, state, room))
}

#[derive(Clone)]
struct RoomFrame {
    sender: Uuid,
    bytes: Arc<[u8]>,
}

/// Live state of one document shared by its connected peers
pub struct Room {
    id: DocumentId,
    project: ProjectKey,
    doc: Doc,
    txn_lock: Mutex<()>,
    write_lock: tokio::sync::Mutex<()>,
    frames: broadcast::Sender<RoomFrame>,
    awareness: Mutex<HashMap<u64, (u32, String)>>,
    peers: AtomicUsize,
}

impl Room {
    async fn load(store: &DocumentStore, id: DocumentId) -> SyncResult<Arc<Room>> {
        let project = id.project_key();
        let doc = store.load_or_create(&project, id.document()).await?;
        let (frames, _) = broadcast::channel(256);
        info!("Loaded room for '{}'", id);
        Ok(Arc::new(Room {
            id,
            project,
            doc,
            txn_lock: Mutex::new(()),
            write_lock: tokio::sync::Mutex::new(()),
            frames,
            awareness: Mutex::new(HashMap::new()),
            peers: AtomicUsize::new(0),
        }))
    }

    /// Get the document id
    pub fn id(&self) -> &DocumentId {
        &self.id
    }

    fn txn(&self) -> MutexGuard<'_, ()> {
        self.txn_lock.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn subscribe(&self) -> broadcast::Receiver<RoomFrame> {
        self.frames.subscribe()
    }

    fn publish(&self, sender: Uuid, frame: Frame) {
        // No other peers is fine
        let _ = self.frames.send(RoomFrame {
            sender,
            bytes: frame.encode().into(),
        });
    }

    fn state_vector(&self) -> Vec<u8> {
        let _guard = self.txn();
        self.doc.transact().state_vector().encode_v1()
    }

    fn full_state(&self) -> Vec<u8> {
        let _guard = self.txn();
        self.doc
            .transact()
            .encode_state_as_update_v1(&StateVector::default())
    }

    fn diff(&self, state_vector: &[u8]) -> SyncResult<Vec<u8>> {
        let state_vector = StateVector::decode_v1(state_vector)
            .map_err(|e| SyncError::Decode(format!("invalid state vector: {}", e)))?;
        let _guard = self.txn();
        Ok(self.doc.transact().encode_diff_v1(&state_vector))
    }

    /// Apply a peer's update, persist the document, then fan the update out
    async fn apply(&self, store: &DocumentStore, sender: Uuid, update: &[u8]) -> SyncResult<()> {
        if update == EMPTY_UPDATE {
            return Ok(());
        }
        decode_update(update)?;

        let _write = self.write_lock.lock().await;
        let state = {
            let decoded = decode_update(update)?;
            let _guard = self.txn();
            {
                let mut txn = self.doc.transact_mut();
                txn.apply_update(decoded);
            }
            self.doc
                .transact()
                .encode_state_as_update_v1(&StateVector::default())
        };
        store
            .persist_state(&self.project, self.id.document(), state)
            .await?;
        self.publish(sender, Frame::Update(update.to_vec()));
        Ok(())
    }

    fn apply_awareness(
        &self,
        sender: Uuid,
        data: &[u8],
        announced: &mut HashSet<u64>,
    ) -> SyncResult<()> {
        let update = AwarenessUpdate::decode(data)?;
        if let Ok(mut entries) = self.awareness.lock() {
            for (client_id, clock, json) in &update.entries {
                if json == "null" {
                    entries.remove(client_id);
                } else {
                    entries.insert(*client_id, (*clock, json.clone()));
                }
                announced.insert(*client_id);
            }
        }
        self.publish(sender, Frame::Awareness(data.to_vec()));
        Ok(())
    }

    fn awareness_snapshot(&self) -> Option<Vec<u8>> {
        let entries = self.awareness.lock().ok()?;
        if entries.is_empty() {
            return None;
        }
        let update = AwarenessUpdate {
            entries: entries
                .iter()
                .map(|(id, (clock, json))| (*id, *clock, json.clone()))
                .collect(),
        };
        Some(update.encode())
    }

    /// Drop the entries a departed peer announced and tell everyone else
    fn remove_clients(&self, sender: Uuid, clients: &HashSet<u64>) {
        let removed: Vec<(u64, u32)> = match self.awareness.lock() {
            Ok(mut entries) => clients
                .iter()
                .filter_map(|id| entries.remove(id).map(|(clock, _)| (*id, clock + 1)))
                .collect(),
            Err(_) => return,
        };
        if !removed.is_empty() {
            debug!("Removing {} awareness entries from '{}'", removed.len(), self.id);
            self.publish(sender, Frame::Awareness(AwarenessUpdate::removal(removed).encode()));
        }
    }
}

async fn serve_socket(socket: WebSocket, state: SyncState, room: Arc<Room>) {
    let peer = Uuid::new_v4();
    info!("Peer {} joined '{}'", peer, room.id);

    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();

    let sender_task = tokio::spawn(async move {
        while let Some(bytes) = rx.recv().await {
            if let Err(e) = ws_sender.send(Message::Binary(bytes.into())).await {
                debug!("Failed to send to peer {}: {}", peer, e);
                break;
            }
        }
        let _ = ws_sender.close().await;
    });

    let forward_task = {
        let tx = tx.clone();
        let room = room.clone();
        let mut frames = room.subscribe();
        tokio::spawn(async move {
            loop {
                match frames.recv().await {
                    Ok(frame) if frame.sender != peer => {
                        if tx.send(frame.bytes.to_vec()).is_err() {
                            break;
                        }
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(
                            "Peer {} lagged behind by {} frames, resending full state",
                            peer, skipped
                        );
                        let _ = tx.send(Frame::Update(room.full_state()).encode());
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    };

    let mut announced = HashSet::new();
    while let Some(message) = ws_receiver.next().await {
        match message {
            Ok(Message::Binary(data)) => {
                if let Err(e) = handle_frame(&state, &room, peer, &data, &tx, &mut announced).await {
                    warn!("Frame from peer {} failed: {}", peer, e);
                }
            }
            Ok(Message::Close(_)) => {
                debug!("Peer {} closed the connection", peer);
                break;
            }
            Ok(Message::Text(_)) => warn!("Ignoring text message from peer {}", peer),
            Ok(_) => {}
            Err(e) => {
                debug!("WebSocket error for peer {}: {}", peer, e);
                break;
            }
        }
    }

    room.remove_clients(peer, &announced);
    forward_task.abort();
    drop(tx);
    let _ = sender_task.await;
    state.leave(&room);
    info!("Peer {} left '{}'", peer, room.id);
}

async fn handle_frame(
    state: &SyncState,
    room: &Room,
    peer: Uuid,
    data: &[u8],
    tx: &mpsc::UnboundedSender<Vec<u8>>,
    announced: &mut HashSet<u64>,
) -> SyncResult<()> {
    match Frame::decode(data)? {
        Frame::SyncStep1(state_vector) => {
            let _ = tx.send(Frame::SyncStep2(room.diff(&state_vector)?).encode());
            let _ = tx.send(Frame::SyncStep1(room.state_vector()).encode());
            if let Some(snapshot) = room.awareness_snapshot() {
                let _ = tx.send(Frame::Awareness(snapshot).encode());
            }
        }
        Frame::SyncStep2(update) | Frame::Update(update) => {
            room.apply(&state.store, peer, &update).await?;
        }
        Frame::Awareness(update) => room.apply_awareness(peer, &update, announced)?,
        Frame::QueryAwareness => {
            if let Some(snapshot) = room.awareness_snapshot() {
                let _ = tx.send(Frame::Awareness(snapshot).encode());
            }
        }
        Frame::PermissionDenied(reason) => {
            debug!("Ignoring permission denied from peer {}: {}", peer, reason);
        }
    }
    Ok(())
}
