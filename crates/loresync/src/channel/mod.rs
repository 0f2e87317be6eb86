//! Remote sync channel of one document.
//!
//! A channel owns a background driver task that connects through a
//! [`Transport`], runs the sync handshake, pumps frames in both directions and
//! reconnects with exponential backoff. The driver talks to its document
//! through the [`ChannelHost`] trait and only holds a weak reference to it.

mod reconnect;
mod transport;
#[cfg(feature = "client")]
mod websocket;

#[cfg(test)]
pub(crate) mod mock;

pub use reconnect::ReconnectController;
pub use transport::{endpoint_for, Link, Transport};
#[cfg(feature = "client")]
pub use websocket::WebSocketTransport;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Duration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::config::RetryConfig;
use crate::error::SyncResult;
use crate::id::DocumentId;
use crate::protocol::Frame;

/// Time a destroyed channel gets to wind down before its task is aborted
const DESTROY_GRACE: Duration = Duration::from_secs(5);

/// Lifecycle of a remote channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelState {
    Idle,
    Connecting,
    Connected,
    Disconnected,
    Closed,
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ChannelState::Idle => "idle",
            ChannelState::Connecting => "connecting",
            ChannelState::Connected => "connected",
            ChannelState::Disconnected => "disconnected",
            ChannelState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Notifications a channel delivers to its host
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    Connecting { attempt: u32 },
    /// Handshake completed, the remote state has been applied
    Connected,
    Disconnected { reason: String },
    RetryScheduled { attempt: u32, delay: Duration },
    /// Automatic reconnects stopped until the network is reported restored
    RetriesExhausted,
    /// Terminal: the remote refused our credentials
    AuthFailed { reason: String },
    Closed,
}

/// The document side of a channel
pub trait ChannelHost: Send + Sync {
    fn document_id(&self) -> &DocumentId;

    /// Encoded state vector of the local document
    fn state_vector(&self) -> Vec<u8>;

    /// Update holding everything missing from a peer's state vector
    fn diff_since(&self, state_vector: &[u8]) -> SyncResult<Vec<u8>>;

    fn apply_remote(&self, update: &[u8]) -> SyncResult<()>;

    /// Encoded awareness update of the local client
    fn local_awareness(&self) -> Vec<u8>;

    fn apply_awareness(&self, update: &[u8]);

    /// Whether the host is still the live connection for its document id.
    /// Checked before every reconnect attempt.
    fn is_registered(&self) -> bool;

    fn on_channel_event(&self, event: &ChannelEvent);
}

/// Where and how a channel connects
#[derive(Debug, Clone)]
pub struct ChannelOptions {
    pub endpoint: Url,
    pub handshake_timeout: Duration,
    pub retry: RetryConfig,
}

/// Handle of a running channel
pub struct RemoteChannel {
    state: watch::Receiver<ChannelState>,
    outgoing: mpsc::UnboundedSender<Frame>,
    reconnect: CancellationToken,
    shutdown: CancellationToken,
    restored: Arc<Notify>,
    task: JoinHandle<()>,
}

impl RemoteChannel {
    /// Start the driver task, the first connection attempt begins immediately
    pub fn spawn(
        host: Weak<dyn ChannelHost>,
        transport: Arc<dyn Transport>,
        options: ChannelOptions,
    ) -> Self {
        let (state_tx, state) = watch::channel(ChannelState::Idle);
        let (outgoing, outgoing_rx) = mpsc::unbounded_channel();
        let reconnect = CancellationToken::new();
        let shutdown = CancellationToken::new();
        let restored = Arc::new(Notify::new());

        let driver = Driver {
            host,
            transport,
            controller: ReconnectController::new(options.retry.clone()),
            options,
            state: state_tx,
            outgoing: outgoing_rx,
            reconnect: reconnect.clone(),
            shutdown: shutdown.clone(),
            restored: restored.clone(),
        };
        let task = tokio::spawn(driver.run());

        Self {
            state,
            outgoing,
            reconnect,
            shutdown,
            restored,
            task,
        }
    }

    pub fn state(&self) -> ChannelState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ChannelState> {
        self.state.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ChannelState::Connected
    }

    /// Queue a frame for the peer. Frames are only accepted while a link is
    /// being established or up; anything else is covered by the next handshake.
    pub fn send(&self, frame: Frame) -> bool {
        match self.state() {
            ChannelState::Connecting | ChannelState::Connected => self.outgoing.send(frame).is_ok(),
            _ => false,
        }
    }

    /// Cancel any scheduled reconnect and stop reconnecting after the current link
    pub fn cancel_reconnect(&self) {
        self.reconnect.cancel();
    }

    /// Retry right away with a fresh attempt counter, also after the attempts
    /// were exhausted
    pub fn network_restored(&self) {
        if self.state() == ChannelState::Disconnected {
            self.restored.notify_one();
        }
    }

    /// Close the link. Queued frames are still delivered first.
    pub fn disconnect(&self) {
        self.reconnect.cancel();
        self.shutdown.cancel();
    }

    /// Disconnect and wait for the driver task to finish
    pub async fn destroy(mut self) {
        self.disconnect();
        if timeout(DESTROY_GRACE, &mut self.task).await.is_err() {
            warn!("Channel driver did not stop in time, aborting it");
            self.task.abort();
        }
    }
}

enum SessionEnd {
    Shutdown,
    AuthFailed(String),
    Dropped(String),
}

enum Wake {
    Retry,
    Restored,
    Stop,
}

struct Driver {
    host: Weak<dyn ChannelHost>,
    transport: Arc<dyn Transport>,
    options: ChannelOptions,
    controller: ReconnectController,
    state: watch::Sender<ChannelState>,
    outgoing: mpsc::UnboundedReceiver<Frame>,
    reconnect: CancellationToken,
    shutdown: CancellationToken,
    restored: Arc<Notify>,
}

impl Driver {
    fn set_state(&self, state: ChannelState) {
        self.state.send_replace(state);
    }

    async fn run(mut self) {
        loop {
            if self.shutdown.is_cancelled() {
                break;
            }
            let Some(host) = self.host.upgrade() else {
                break;
            };
            if !host.is_registered() {
                debug!(
                    "'{}' is no longer registered, channel stops",
                    host.document_id()
                );
                break;
            }

            self.set_state(ChannelState::Connecting);
            host.on_channel_event(&ChannelEvent::Connecting {
                attempt: self.controller.attempt(),
            });

            match self.session(&host).await {
                SessionEnd::Shutdown => break,
                SessionEnd::AuthFailed(reason) => {
                    error!(
                        "Authentication failed for '{}': {}",
                        host.document_id(),
                        reason
                    );
                    self.reconnect.cancel();
                    self.set_state(ChannelState::Disconnected);
                    host.on_channel_event(&ChannelEvent::AuthFailed { reason });
                    break;
                }
                SessionEnd::Dropped(reason) => {
                    info!("Channel of '{}' dropped: {}", host.document_id(), reason);
                    self.set_state(ChannelState::Disconnected);
                    host.on_channel_event(&ChannelEvent::Disconnected { reason });
                }
            }

            if self.shutdown.is_cancelled() || self.reconnect.is_cancelled() {
                break;
            }
            if !host.is_registered() {
                debug!(
                    "'{}' was closed while disconnected, not reconnecting",
                    host.document_id()
                );
                break;
            }

            let delay = self.controller.next_delay();
            match delay {
                Some(delay) => {
                    debug!(
                        "Reconnecting '{}' in {:?} (attempt {})",
                        host.document_id(),
                        delay,
                        self.controller.attempt()
                    );
                    host.on_channel_event(&ChannelEvent::RetryScheduled {
                        attempt: self.controller.attempt(),
                        delay,
                    });
                }
                None => {
                    warn!(
                        "Giving up on '{}' until the network is restored",
                        host.document_id()
                    );
                    host.on_channel_event(&ChannelEvent::RetriesExhausted);
                }
            }
            drop(host);

            match self.wait(delay).await {
                Wake::Retry => {}
                Wake::Restored => self.controller.reset(),
                Wake::Stop => break,
            }
        }

        self.set_state(ChannelState::Closed);
        if let Some(host) = self.host.upgrade() {
            host.on_channel_event(&ChannelEvent::Closed);
        }
    }

    async fn wait(&self, delay: Option<Duration>) -> Wake {
        let timer = async {
            match delay {
                Some(delay) => sleep(delay).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::select! {
            _ = timer => Wake::Retry,
            _ = self.restored.notified() => Wake::Restored,
            _ = self.reconnect.cancelled() => Wake::Stop,
            _ = self.shutdown.cancelled() => Wake::Stop,
        }
    }

    async fn session(&mut self, host: &Arc<dyn ChannelHost>) -> SessionEnd {
        let handshake_timeout = self.options.handshake_timeout;
        let shutdown = self.shutdown.clone();

        let connected = tokio::select! {
            result = timeout(handshake_timeout, self.transport.connect(&self.options.endpoint)) => result,
            _ = shutdown.cancelled() => return SessionEnd::Shutdown,
        };
        let mut link = match connected {
            Ok(Ok(link)) => link,
            Ok(Err(e)) if e.is_auth() => return SessionEnd::AuthFailed(e.to_string()),
            Ok(Err(e)) => return SessionEnd::Dropped(e.to_string()),
            Err(_) => return SessionEnd::Dropped("connect timed out".to_string()),
        };

        // The handshake below covers anything queued before the link was up
        while self.outgoing.try_recv().is_ok() {}

        let opening = [
            Frame::SyncStep1(host.state_vector()),
            Frame::Awareness(host.local_awareness()),
        ];
        for frame in opening {
            if let Err(e) = link.send(frame.encode()).await {
                return SessionEnd::Dropped(e.to_string());
            }
        }

        let deadline = sleep(handshake_timeout);
        tokio::pin!(deadline);
        let mut synced = false;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    self.close_link(link.as_mut()).await;
                    return SessionEnd::Shutdown;
                }
                _ = &mut deadline, if !synced => {
                    let _ = link.close().await;
                    return SessionEnd::Dropped("sync handshake timed out".to_string());
                }
                frame = self.outgoing.recv() => {
                    let Some(frame) = frame else {
                        self.close_link(link.as_mut()).await;
                        return SessionEnd::Shutdown;
                    };
                    if let Err(e) = link.send(frame.encode()).await {
                        return SessionEnd::Dropped(e.to_string());
                    }
                }
                incoming = link.recv() => {
                    let bytes = match incoming {
                        None => return SessionEnd::Dropped("closed by peer".to_string()),
                        Some(Err(e)) if e.is_auth() => return SessionEnd::AuthFailed(e.to_string()),
                        Some(Err(e)) => return SessionEnd::Dropped(e.to_string()),
                        Some(Ok(bytes)) => bytes,
                    };
                    let frame = match Frame::decode(&bytes) {
                        Ok(frame) => frame,
                        Err(e) => {
                            warn!("Ignoring frame for '{}': {}", host.document_id(), e);
                            continue;
                        }
                    };

                    let reply = match frame {
                        Frame::SyncStep1(state_vector) => match host.diff_since(&state_vector) {
                            Ok(update) => Some(Frame::SyncStep2(update)),
                            Err(e) => {
                                warn!("Cannot answer sync step 1 for '{}': {}", host.document_id(), e);
                                None
                            }
                        },
                        Frame::SyncStep2(update) => {
                            if let Err(e) = host.apply_remote(&update) {
                                warn!("Rejected sync step 2 for '{}': {}", host.document_id(), e);
                            }
                            if !synced {
                                synced = true;
                                self.controller.reset();
                                self.set_state(ChannelState::Connected);
                                info!("'{}' is connected", host.document_id());
                                host.on_channel_event(&ChannelEvent::Connected);
                            }
                            None
                        }
                        Frame::Update(update) => {
                            if let Err(e) = host.apply_remote(&update) {
                                warn!("Rejected remote update for '{}': {}", host.document_id(), e);
                            }
                            None
                        }
                        Frame::Awareness(update) => {
                            host.apply_awareness(&update);
                            None
                        }
                        Frame::QueryAwareness => Some(Frame::Awareness(host.local_awareness())),
                        Frame::PermissionDenied(reason) => {
                            let _ = link.close().await;
                            return SessionEnd::AuthFailed(reason);
                        }
                    };

                    if let Some(reply) = reply {
                        if let Err(e) = link.send(reply.encode()).await {
                            return SessionEnd::Dropped(e.to_string());
                        }
                    }
                }
            }
        }
    }

    /// Deliver what is still queued, then close
    async fn close_link(&mut self, link: &mut dyn Link) {
        while let Ok(frame) = self.outgoing.try_recv() {
            if link.send(frame.encode()).await.is_err() {
                break;
            }
        }
        if let Err(e) = link.close().await {
            debug!("Error while closing link: {}", e);
        }
    }
}
