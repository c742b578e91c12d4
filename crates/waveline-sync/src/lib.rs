//! waveline-sync — the offline-first data core of the Waveline podcast app.
//!
//! The engine keeps an on-device SQLite store usable without connectivity
//! and eventually consistent with the remote backend:
//!
//! - [`store::LocalStore`] — durable, indexed, transactional table storage
//!   with the dirty-flag discipline baked into its write paths.
//! - [`sync::SyncCoordinator`] — pull (remote→local merge under
//!   last-write-wins) and push (dirty-row upload) per `(entity, scope)`,
//!   single-flighted so concurrent callers share one network call.
//! - [`repo::Repository`] — per-entity façade for the UI: subscriptions,
//!   optimistic mutations with background push, and write-through mutations
//!   with snapshot rollback.
//! - [`reactive::ChangeBus`] — coalesced, channel-based change notifications
//!   for every committed write, local or remote.
//!
//! Construction is plain dependency injection: open one [`LocalStore`] at
//! startup, wrap it in a coordinator with a [`sync::SyncTransport`], and
//! hand both to each repository.
//!
//! ```no_run
//! use std::sync::Arc;
//! use waveline_sync::{waveline_entities, HttpTransport, LocalStore, Repository, SyncCoordinator};
//!
//! # async fn demo() -> waveline_sync::Result<()> {
//! let store = Arc::new(LocalStore::open("waveline.db", waveline_entities())?);
//! let transport = Arc::new(HttpTransport::new("https://api.waveline.app/v1")?);
//! let coordinator = Arc::new(SyncCoordinator::new(Arc::clone(&store), transport));
//!
//! let comments = Repository::new(Arc::clone(&store), Arc::clone(&coordinator), "comments")?;
//! let mut sub = comments.subscribe(Some("ep-42"))?;
//! while let Some(_rows) = sub.next().await {
//!     // render
//! }
//! # Ok(())
//! # }
//! ```

pub mod entity;
pub mod error;
pub mod reactive;
pub mod repo;
pub mod store;
pub mod sync;
pub mod types;

pub use entity::{waveline_entities, EntityDef};
pub use error::{Result, StoreError, SyncError, TransportError, ValidationError, WavelineError};
pub use reactive::{ChangeBus, ChangeOrigin, ChangeSet, SubscriptionFilter};
pub use repo::{RecordsSubscription, Repository};
pub use store::LocalStore;
pub use sync::{
    HttpTransport, Scope, SyncCoordinator, SyncOutcome, SyncStatusBoard, SyncTransport,
};
pub use types::{Record, RecordSyncState, RemoteRecord, WriteOptions};
