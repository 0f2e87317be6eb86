//! # loresync
//!
//! Offline-first synchronization of collaboratively edited documents.
//!
//! A [`ConnectionRegistry`] keeps at most one [`DocumentConnection`] per
//! document. Each connection owns a replicated document, persists every
//! change to a local store and exchanges updates with a sync server over a
//! reconnecting channel. The [`server`] module provides that server: durable
//! per-project document stores and an Axum sync endpoint.

pub mod awareness;
pub mod channel;
pub mod config;
pub mod connection;
pub mod content;
pub mod error;
pub mod id;
pub mod local;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod status;

// Re-exports for convenience
pub use awareness::{AwarenessEntry, CursorPosition, UserInfo};
pub use channel::{ChannelState, Link, Transport};
pub use config::{ClientConfig, RetryConfig, ServerConfig};
pub use connection::{DocumentConnection, Notice, UpdateOrigin};
pub use content::{AttrValue, Mark, Node};
pub use error::{SyncError, SyncResult};
pub use id::{DocumentId, ProjectKey};
pub use protocol::Frame;
pub use registry::{ConnectionRegistry, OpenOptions};
pub use server::DocumentStore;
pub use status::{StatusEvent, SyncStatus};

#[cfg(feature = "client")]
pub use channel::WebSocketTransport;

#[cfg(feature = "axum")]
pub use server::{router_with_sync, router_with_sync_state, SyncState};
