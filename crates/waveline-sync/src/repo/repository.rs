//! Repository — optimistic reads and writes over one entity.
//!
//! The store and coordinator handles are injected at construction and shared
//! across repositories; a repository adds no state beyond its subscription
//! bookkeeping. Mutations apply locally first and return synchronously; a
//! background push is scheduled after every mutation. The write-through
//! variants trade that for an explicit remote round-trip with rollback.
//!
//! Repositories must be constructed and used inside a tokio runtime —
//! subscriptions and scheduled pushes spawn background tasks.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;

use crate::entity::{EntityDef, UNSCOPED_KEY};
use crate::error::Result;
use crate::reactive::SubscriptionFilter;
use crate::store::LocalStore;
use crate::sync::{Scope, SyncCoordinator, SyncOutcome};
use crate::types::{Record, RecordSyncState, WriteOptions};

struct ScopeWatch {
    subscribers: usize,
    pull_task: Option<AbortHandle>,
}

pub struct Repository {
    store: Arc<LocalStore>,
    coordinator: Arc<SyncCoordinator>,
    def: Arc<EntityDef>,
    watchers: Arc<Mutex<HashMap<String, ScopeWatch>>>,
}

impl Repository {
    pub fn new(
        store: Arc<LocalStore>,
        coordinator: Arc<SyncCoordinator>,
        entity: &str,
    ) -> Result<Self> {
        let def = Arc::clone(store.entity(entity)?);
        Ok(Self {
            store,
            coordinator,
            def,
            watchers: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    pub fn entity(&self) -> &str {
        &self.def.name
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    pub fn get(&self, id: &str) -> Result<Option<Record>> {
        self.store.get(&self.def.name, id)
    }

    pub fn list(&self, scope: Option<&str>) -> Result<Vec<Record>> {
        self.store.list(&self.def.name, scope)
    }

    /// Subscribe to the ordered records of a scope.
    ///
    /// Emits the current local result immediately, then re-emits whenever a
    /// matching change lands on the bus — local write or remote merge alike.
    /// Also kicks off a best-effort background pull that never blocks the
    /// initial emission; the pull is aborted when the scope's last
    /// subscriber cancels.
    pub fn subscribe(&self, scope: Option<&str>) -> Result<RecordsSubscription> {
        let scope_key = scope.unwrap_or(UNSCOPED_KEY).to_string();
        let entity = self.def.name.clone();

        let initial = self.store.list(&entity, scope)?;
        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(initial);

        let filter = if self.def.scope_field.is_some() && scope_key != UNSCOPED_KEY {
            SubscriptionFilter::scoped(&entity, &scope_key)
        } else {
            SubscriptionFilter::entity(&entity)
        };
        let mut bus_sub = self.store.bus().subscribe(filter);

        // Bridge: one re-query + emission per coalesced change set.
        let bridge = {
            let store = Arc::clone(&self.store);
            let entity = entity.clone();
            let scope_key = scope_key.clone();
            tokio::spawn(async move {
                while bus_sub.recv().await.is_some() {
                    let scope = (scope_key != UNSCOPED_KEY).then_some(scope_key.as_str());
                    match store.list(&entity, scope) {
                        Ok(rows) => {
                            if tx.send(rows).is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            tracing::warn!(entity = %entity, error = %e, "subscription re-query failed");
                            break;
                        }
                    }
                }
            })
        };

        self.watch_scope(&scope_key);

        let watchers = Arc::clone(&self.watchers);
        let bridge_handle = bridge.abort_handle();
        let scope_for_cancel = scope_key.clone();
        let on_cancel = Box::new(move || {
            bridge_handle.abort();
            let mut map = watchers.lock();
            if let Some(watch) = map.get_mut(&scope_for_cancel) {
                watch.subscribers = watch.subscribers.saturating_sub(1);
                if watch.subscribers == 0 {
                    if let Some(pull) = watch.pull_task.take() {
                        pull.abort();
                    }
                    map.remove(&scope_for_cancel);
                }
            }
        });

        Ok(RecordsSubscription {
            rx,
            on_cancel: Some(on_cancel),
        })
    }

    // -----------------------------------------------------------------------
    // Optimistic mutations
    // -----------------------------------------------------------------------

    /// Create a record. Applies locally, returns synchronously, schedules a
    /// background push.
    pub fn create(&self, data: Value) -> Result<Record> {
        let record = self
            .store
            .insert_local(&self.def.name, data, &WriteOptions::default())?;
        self.spawn_push(&record);
        Ok(record)
    }

    /// Patch a record. Applies locally, returns the new state synchronously,
    /// schedules a background push.
    pub fn mutate(&self, id: &str, patch: Value) -> Result<Record> {
        let record =
            self.store
                .patch_local(&self.def.name, id, &patch, &WriteOptions::default())?;
        self.spawn_push(&record);
        Ok(record)
    }

    /// Tombstone a record. The tombstone syncs like any other local edit.
    pub fn delete(&self, id: &str) -> Result<Record> {
        let record = self
            .store
            .delete_local(&self.def.name, id, &WriteOptions::default())?;
        self.spawn_push(&record);
        Ok(record)
    }

    // -----------------------------------------------------------------------
    // Write-through mutations
    // -----------------------------------------------------------------------

    /// Create with immediate remote confirmation.
    ///
    /// Applies optimistically, uploads directly, and on remote failure rolls
    /// the store back to its pre-mutation state (here: no record) before
    /// propagating the error. Subscribers see exactly two notifications on
    /// failure: the optimistic apply and the rollback.
    pub async fn create_write_through(&self, data: Value) -> Result<Record> {
        let record = self
            .store
            .insert_local(&self.def.name, data, &WriteOptions::default())?;
        let scope = self.scope_of(&record);

        match self.coordinator.write_through(&scope, &record).await {
            Ok(synced_at) => self.finalize_write_through(record, synced_at),
            Err(e) => {
                self.store.restore(&self.def.name, &record.id, None)?;
                Err(e.into())
            }
        }
    }

    /// Patch with immediate remote confirmation; rolls back to the
    /// pre-mutation snapshot on remote failure.
    pub async fn mutate_write_through(&self, id: &str, patch: Value) -> Result<Record> {
        let snapshot = self.store.get_any(&self.def.name, id)?;
        let record =
            self.store
                .patch_local(&self.def.name, id, &patch, &WriteOptions::default())?;
        let scope = self.scope_of(&record);

        match self.coordinator.write_through(&scope, &record).await {
            Ok(synced_at) => self.finalize_write_through(record, synced_at),
            Err(e) => {
                self.store
                    .restore(&self.def.name, id, snapshot.as_ref())?;
                Err(e.into())
            }
        }
    }

    // -----------------------------------------------------------------------
    // Sync surface
    // -----------------------------------------------------------------------

    /// Explicit pull for a scope (pull-to-refresh).
    pub async fn refresh(&self, scope: Option<&str>) -> SyncOutcome {
        let scope = Scope::new(
            self.def.name.clone(),
            scope.unwrap_or(UNSCOPED_KEY).to_string(),
        );
        self.coordinator.pull(&scope).await
    }

    pub fn sync_state(&self, id: &str) -> Result<RecordSyncState> {
        self.coordinator.record_sync_state(&self.def.name, id)
    }

    // -----------------------------------------------------------------------
    // Internal
    // -----------------------------------------------------------------------

    fn scope_of(&self, record: &Record) -> Scope {
        Scope::new(self.def.name.clone(), self.def.scope_key_of(&record.data))
    }

    fn spawn_push(&self, record: &Record) {
        let coordinator = Arc::clone(&self.coordinator);
        let scope = self.scope_of(record);
        tokio::spawn(async move {
            coordinator.schedule_push(&scope).await;
        });
    }

    /// First subscriber of a scope triggers its background pull.
    fn watch_scope(&self, scope_key: &str) {
        let mut map = self.watchers.lock();
        let watch = map.entry(scope_key.to_string()).or_insert(ScopeWatch {
            subscribers: 0,
            pull_task: None,
        });
        watch.subscribers += 1;
        if watch.subscribers == 1 {
            let coordinator = Arc::clone(&self.coordinator);
            let scope = Scope::new(self.def.name.clone(), scope_key.to_string());
            let task = tokio::spawn(async move {
                coordinator.pull(&scope).await;
            });
            watch.pull_task = Some(task.abort_handle());
        }
    }

    fn finalize_write_through(&self, record: Record, synced_at: i64) -> Result<Record> {
        self.store.mark_synced_many(
            &self.def.name,
            &[(record.id.clone(), record.updated_at)],
            synced_at,
        )?;
        Ok(self
            .store
            .get_any(&self.def.name, &record.id)?
            .unwrap_or(record))
    }
}

/// Owned handle to a repository subscription: the cancellation token plus
/// the receiving end of the result stream.
pub struct RecordsSubscription {
    rx: mpsc::UnboundedReceiver<Vec<Record>>,
    on_cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl RecordsSubscription {
    /// Await the next emission (the first resolves immediately with the
    /// local query result). Returns `None` once cancelled and drained.
    pub async fn next(&mut self) -> Option<Vec<Record>> {
        self.rx.recv().await
    }

    /// Non-blocking poll.
    pub fn try_next(&mut self) -> Option<Vec<Record>> {
        self.rx.try_recv().ok()
    }

    /// Cancel the subscription: detaches it from the bus, and aborts the
    /// scope's background pull if this was its last subscriber.
    pub fn cancel(&mut self) {
        if let Some(f) = self.on_cancel.take() {
            f();
        }
        self.rx.close();
    }
}

impl Drop for RecordsSubscription {
    fn drop(&mut self) {
        if let Some(f) = self.on_cancel.take() {
            f();
        }
    }
}
