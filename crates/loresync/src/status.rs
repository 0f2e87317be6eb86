use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{broadcast, watch};
use tracing::debug;

/// Per-document synchronization status visible to consumers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    /// No usable local copy exists
    Unavailable,
    /// Local copy exists, no attempt to reach the remote yet
    Local,
    /// Remote handshake in progress
    Syncing,
    /// Remote channel confirmed connected
    Synced,
    /// Remote unreachable, local copy usable
    Offline,
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SyncStatus::Unavailable => "unavailable",
            SyncStatus::Local => "local",
            SyncStatus::Syncing => "syncing",
            SyncStatus::Synced => "synced",
            SyncStatus::Offline => "offline",
        };
        f.write_str(name)
    }
}

/// Events emitted by the local adapter and the remote channel.
///
/// These are the only inputs of the status state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusEvent {
    LocalLoaded,
    LocalFailed,
    ChannelConnecting,
    ChannelConnected,
    ChannelDisconnected,
    AuthFailed,
}

impl SyncStatus {
    /// Compute the next status for an event.
    ///
    /// `has_local` tells whether a local copy has been materialized, which decides
    /// between `Offline` and `Unavailable` when the channel drops.
    pub fn next(self, event: StatusEvent, has_local: bool) -> SyncStatus {
        match (self, event) {
            (SyncStatus::Unavailable, StatusEvent::LocalLoaded) => SyncStatus::Local,
            (current, StatusEvent::LocalLoaded) => current,
            (_, StatusEvent::LocalFailed) => SyncStatus::Unavailable,
            (_, StatusEvent::ChannelConnecting) => SyncStatus::Syncing,
            // Synced is only reachable through Syncing
            (SyncStatus::Syncing, StatusEvent::ChannelConnected) => SyncStatus::Synced,
            (current, StatusEvent::ChannelConnected) => current,
            (SyncStatus::Syncing | SyncStatus::Synced, StatusEvent::ChannelDisconnected) => {
                if has_local {
                    SyncStatus::Offline
                } else {
                    SyncStatus::Unavailable
                }
            }
            (current, StatusEvent::ChannelDisconnected) => current,
            (_, StatusEvent::AuthFailed) => SyncStatus::Unavailable,
        }
    }
}

/// Reactive holder of one document's status.
///
/// The current value is exposed through a `watch` channel, every transition is
/// also published on a broadcast channel so observers can see the full sequence.
pub struct StatusTracker {
    current: watch::Sender<SyncStatus>,
    transitions: broadcast::Sender<SyncStatus>,
    has_local: AtomicBool,
}

impl StatusTracker {
    pub fn new() -> Self {
        let (current, _) = watch::channel(SyncStatus::Unavailable);
        let (transitions, _) = broadcast::channel(64);
        Self {
            current,
            transitions,
            has_local: AtomicBool::new(false),
        }
    }

    pub fn get(&self) -> SyncStatus {
        *self.current.borrow()
    }

    /// Feed an event into the state machine, returns the resulting status
    pub fn apply(&self, event: StatusEvent) -> SyncStatus {
        match event {
            StatusEvent::LocalLoaded => self.has_local.store(true, Ordering::Release),
            StatusEvent::LocalFailed => self.has_local.store(false, Ordering::Release),
            _ => {}
        }
        let has_local = self.has_local.load(Ordering::Acquire);

        let mut changed = None;
        self.current.send_if_modified(|status| {
            let next = status.next(event, has_local);
            if next == *status {
                return false;
            }
            debug!("Status {} -> {} on {:?}", status, next, event);
            *status = next;
            changed = Some(next);
            true
        });

        if let Some(next) = changed {
            // No subscribers is fine
            let _ = self.transitions.send(next);
        }
        self.get()
    }

    /// Receiver of the current status
    pub fn watch(&self) -> watch::Receiver<SyncStatus> {
        self.current.subscribe()
    }

    /// Receiver of every status transition in order
    pub fn subscribe_transitions(&self) -> broadcast::Receiver<SyncStatus> {
        self.transitions.subscribe()
    }
}

impl Default for StatusTracker {
    fn default() -> Self {
        Self::new()
    }
}
