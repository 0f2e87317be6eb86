//! In-memory transport whose peer behaves like a minimal sync server.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use url::Url;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Doc, ReadTxn, StateVector, Transact, Update};

use super::{Link, Transport};
use crate::error::{SyncError, SyncResult};
use crate::protocol::Frame;

/// How the peer answers one connect call
pub(crate) enum Reply {
    /// Run the sync handshake
    Accept,
    /// Fail the connect with this transport error text
    Refuse(String),
    /// Accept the link but never answer
    Silent,
    /// Accept the link, then refuse access with a permission-denied frame
    Deny(String),
}

#[derive(Clone)]
pub(crate) struct MockTransport {
    inner: Arc<Peer>,
}

struct Peer {
    script: Mutex<VecDeque<Reply>>,
    connects: AtomicUsize,
    received: Mutex<Vec<Frame>>,
    links: Mutex<Vec<(mpsc::UnboundedSender<Vec<u8>>, CancellationToken)>>,
    doc: Doc,
}

impl MockTransport {
    pub(crate) fn new() -> Self {
        Self {
            inner: Arc::new(Peer {
                script: Mutex::new(VecDeque::new()),
                connects: AtomicUsize::new(0),
                received: Mutex::new(Vec::new()),
                links: Mutex::new(Vec::new()),
                doc: Doc::new(),
            }),
        }
    }

    /// Queue the answer of a future connect; with nothing queued connects are accepted
    pub(crate) fn script(&self, reply: Reply) {
        self.inner.script.lock().unwrap().push_back(reply);
    }

    pub(crate) fn connects(&self) -> usize {
        self.inner.connects.load(Ordering::SeqCst)
    }

    /// Every frame clients have sent, in order
    pub(crate) fn received(&self) -> Vec<Frame> {
        self.inner.received.lock().unwrap().clone()
    }

    /// Merge a document into the peer's state
    pub(crate) fn seed(&self, source: &Doc) {
        let update = source
            .transact()
            .encode_state_as_update_v1(&StateVector::default());
        self.inner.apply(&update);
    }

    /// Full state held by the peer
    pub(crate) fn state(&self) -> Vec<u8> {
        self.inner
            .doc
            .transact()
            .encode_state_as_update_v1(&StateVector::default())
    }

    /// Send a frame to every live link
    pub(crate) fn push(&self, frame: Frame) {
        for (tx, _) in self.inner.links.lock().unwrap().iter() {
            let _ = tx.send(frame.encode());
        }
    }

    /// Drop every live link as if the network went away
    pub(crate) fn drop_links(&self) {
        for (_, closed) in self.inner.links.lock().unwrap().drain(..) {
            closed.cancel();
        }
    }
}

impl Peer {
    fn apply(&self, update: &[u8]) {
        if let Ok(update) = Update::decode_v1(update) {
            let mut txn = self.doc.transact_mut();
            txn.apply_update(update);
        }
    }

    fn answer(&self, frame: &Frame) -> Vec<Frame> {
        match frame {
            Frame::SyncStep1(sv) => {
                let sv = StateVector::decode_v1(sv).unwrap_or_default();
                let txn = self.doc.transact();
                vec![
                    Frame::SyncStep2(txn.encode_diff_v1(&sv)),
                    Frame::SyncStep1(txn.state_vector().encode_v1()),
                ]
            }
            Frame::SyncStep2(update) | Frame::Update(update) => {
                self.apply(update);
                Vec::new()
            }
            _ => Vec::new(),
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(&self, _endpoint: &Url) -> SyncResult<Box<dyn Link>> {
        self.inner.connects.fetch_add(1, Ordering::SeqCst);
        let reply = self
            .inner
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Reply::Accept);

        let (tx, rx) = mpsc::unbounded_channel();
        let closed = CancellationToken::new();
        let answers = match reply {
            Reply::Refuse(text) => return Err(SyncError::from_transport_text(text)),
            Reply::Accept => true,
            Reply::Silent => false,
            Reply::Deny(reason) => {
                let _ = tx.send(Frame::PermissionDenied(reason).encode());
                false
            }
        };
        self.inner
            .links
            .lock()
            .unwrap()
            .push((tx.clone(), closed.clone()));

        Ok(Box::new(MockLink {
            peer: self.inner.clone(),
            to_client: tx,
            incoming: rx,
            closed,
            answers,
        }))
    }
}

struct MockLink {
    peer: Arc<Peer>,
    to_client: mpsc::UnboundedSender<Vec<u8>>,
    incoming: mpsc::UnboundedReceiver<Vec<u8>>,
    closed: CancellationToken,
    answers: bool,
}

#[async_trait]
impl Link for MockLink {
    async fn send(&mut self, frame: Vec<u8>) -> SyncResult<()> {
        if self.closed.is_cancelled() {
            return Err(SyncError::Transport("link closed".to_string()));
        }
        let frame = Frame::decode(&frame)?;
        self.peer.received.lock().unwrap().push(frame.clone());
        if self.answers {
            for reply in self.peer.answer(&frame) {
                let _ = self.to_client.send(reply.encode());
            }
        }
        Ok(())
    }

    async fn recv(&mut self) -> Option<SyncResult<Vec<u8>>> {
        tokio::select! {
            _ = self.closed.cancelled() => None,
            frame = self.incoming.recv() => frame.map(Ok),
        }
    }

    async fn close(&mut self) -> SyncResult<()> {
        self.closed.cancel();
        Ok(())
    }
}
