//! Server side: per-project backing stores, the durable document store and
//! the sync endpoint peers connect to.

pub mod backing;
pub mod store;

#[cfg(feature = "axum")]
pub mod axum;

pub use backing::{BackingStores, ProjectLog};
pub use store::DocumentStore;

#[cfg(feature = "axum")]
pub use self::axum::{router_with_sync, router_with_sync_state, Room, SyncParams, SyncState, SYNC_PATH};
