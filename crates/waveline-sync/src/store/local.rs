//! LocalStore — entity-aware storage with the dirty-flag discipline.
//!
//! All writes go through here. The repository's mutation path always marks
//! rows dirty; only [`LocalStore::apply_remote`] (pull merge) and
//! [`LocalStore::mark_synced_many`] (push acknowledgement) may clear the
//! flag. Every committed transaction publishes exactly one coalesced
//! [`ChangeSet`] on the bus, after the transaction has returned.
//!
//! All methods are synchronous SQLite operations. Async callers block the
//! current thread for the duration of the (fast, local) store call.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

use crate::entity::{EntityDef, META_FIELDS, UNSCOPED_KEY};
use crate::error::{FieldError, Result, StoreError, ValidationError};
use crate::reactive::{ChangeBus, ChangeOrigin, ChangeSet, ChangedRecord};
use crate::store::merge::{self, MergeDecision};
use crate::store::sqlite::{ListQuery, SqliteBackend};
use crate::types::{
    now_ms, MergeReport, MergedRecord, Record, RecordError, RemoteRecord, WriteOptions,
};

pub struct LocalStore {
    backend: SqliteBackend,
    entities: HashMap<String, Arc<EntityDef>>,
    bus: Arc<ChangeBus>,
}

impl LocalStore {
    /// Open a file-backed store and register `entities`.
    pub fn open(path: &str, entities: Vec<Arc<EntityDef>>) -> Result<Self> {
        Self::with_backend(SqliteBackend::open(path)?, entities)
    }

    /// Open an in-memory store (tests).
    pub fn open_in_memory(entities: Vec<Arc<EntityDef>>) -> Result<Self> {
        Self::with_backend(SqliteBackend::open_in_memory()?, entities)
    }

    fn with_backend(backend: SqliteBackend, entities: Vec<Arc<EntityDef>>) -> Result<Self> {
        backend.initialize(&entities)?;
        Ok(Self {
            backend,
            entities: entities
                .into_iter()
                .map(|def| (def.name.clone(), def))
                .collect(),
            bus: Arc::new(ChangeBus::new()),
        })
    }

    pub fn bus(&self) -> &Arc<ChangeBus> {
        &self.bus
    }

    pub fn entity(&self, name: &str) -> Result<&Arc<EntityDef>> {
        self.entities
            .get(name)
            .ok_or_else(|| StoreError::EntityNotRegistered(name.to_string()).into())
    }

    pub fn entity_defs(&self) -> Vec<Arc<EntityDef>> {
        self.entities.values().cloned().collect()
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    /// Point lookup, excluding tombstones.
    pub fn get(&self, entity: &str, id: &str) -> Result<Option<Record>> {
        self.entity(entity)?;
        Ok(self.backend.get_raw(entity, id)?.filter(|r| !r.deleted))
    }

    /// Point lookup including tombstones (snapshots, sync state).
    pub fn get_any(&self, entity: &str, id: &str) -> Result<Option<Record>> {
        self.entity(entity)?;
        self.backend.get_raw(entity, id)
    }

    /// Ordered listing, optionally filtered to one scope. Tombstones are
    /// excluded.
    pub fn list(&self, entity: &str, scope: Option<&str>) -> Result<Vec<Record>> {
        let def = self.entity(entity)?;
        let query = ListQuery {
            scope: scope_filter(def, scope),
            include_deleted: false,
        };
        self.backend.scan_raw(entity, &query, &def.order_by)
    }

    /// Live rows changed after `since`, oldest change first (e.g. "what's
    /// new since the screen was last rendered").
    pub fn updated_since(&self, entity: &str, since: i64) -> Result<Vec<Record>> {
        self.entity(entity)?;
        self.backend.scan_updated_since_raw(entity, since)
    }

    /// Rows with unsynced local changes, oldest mutation first.
    pub fn dirty_records(&self, entity: &str, scope: Option<&str>) -> Result<Vec<Record>> {
        let def = self.entity(entity)?;
        let scope = scope_filter(def, scope);
        self.backend
            .scan_dirty_raw(entity, scope.as_ref().map(|(f, k)| (f.as_str(), k.as_str())))
    }

    // -----------------------------------------------------------------------
    // Local mutation path — always marks dirty
    // -----------------------------------------------------------------------

    /// Create a record from a local mutation. Starts dirty and unsynced.
    pub fn insert_local(&self, entity: &str, data: Value, opts: &WriteOptions) -> Result<Record> {
        let def = Arc::clone(self.entity(entity)?);
        validate_data(&def, &data)?;

        let id = opts
            .id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::now_v7().to_string());
        let now = opts.timestamp.unwrap_or_else(now_ms);
        let record = Record {
            id,
            entity: entity.to_string(),
            data,
            created_at: now,
            updated_at: now,
            synced_at: None,
            needs_sync: true,
            deleted: false,
        };

        self.backend.transaction(|backend| {
            if backend.get_raw(entity, &record.id)?.is_some() {
                return Err(ValidationError::single(
                    entity,
                    "id",
                    format!("duplicate id \"{}\"", record.id),
                )
                .into());
            }
            backend.put_raw(&record)
        })?;

        self.publish_one(&def, ChangeOrigin::Local, &record);
        Ok(record)
    }

    /// Apply a shallow patch to an existing record's data. Bumps
    /// `updated_at` and marks the row dirty.
    pub fn patch_local(
        &self,
        entity: &str,
        id: &str,
        patch: &Value,
        opts: &WriteOptions,
    ) -> Result<Record> {
        let def = Arc::clone(self.entity(entity)?);
        let patch_obj = patch.as_object().ok_or_else(|| {
            ValidationError::single(entity, "patch", "patch must be a JSON object")
        })?;
        for key in patch_obj.keys() {
            if META_FIELDS.contains(&key.as_str()) {
                return Err(StoreError::ImmutableField {
                    entity: entity.to_string(),
                    id: id.to_string(),
                    field: key.clone(),
                }
                .into());
            }
        }

        let now = opts.timestamp.unwrap_or_else(now_ms);
        let record = self.backend.transaction(|backend| {
            let mut record = backend
                .get_raw(entity, id)?
                .filter(|r| !r.deleted)
                .ok_or_else(|| StoreError::NotFound {
                    entity: entity.to_string(),
                    id: id.to_string(),
                })?;

            if let Some(obj) = record.data.as_object_mut() {
                for (k, v) in patch_obj {
                    obj.insert(k.clone(), v.clone());
                }
            }
            validate_data(&def, &record.data)?;

            record.updated_at = now;
            record.needs_sync = true;
            backend.put_raw(&record)?;
            Ok(record)
        })?;

        self.publish_one(&def, ChangeOrigin::Local, &record);
        Ok(record)
    }

    /// Tombstone a record locally. The tombstone is dirty and will be pushed
    /// like any other local edit.
    pub fn delete_local(&self, entity: &str, id: &str, opts: &WriteOptions) -> Result<Record> {
        let def = Arc::clone(self.entity(entity)?);
        let now = opts.timestamp.unwrap_or_else(now_ms);

        let record = self.backend.transaction(|backend| {
            let mut record = backend
                .get_raw(entity, id)?
                .filter(|r| !r.deleted)
                .ok_or_else(|| StoreError::NotFound {
                    entity: entity.to_string(),
                    id: id.to_string(),
                })?;
            record.deleted = true;
            record.updated_at = now;
            record.needs_sync = true;
            backend.put_raw(&record)?;
            Ok(record)
        })?;

        self.publish_one(&def, ChangeOrigin::Local, &record);
        Ok(record)
    }

    /// Rollback primitive for optimistic write-through mutations: put the row
    /// back to `prior`, or remove it entirely when it did not exist before.
    pub fn restore(&self, entity: &str, id: &str, prior: Option<&Record>) -> Result<()> {
        let def = Arc::clone(self.entity(entity)?);

        let affected = self.backend.transaction(|backend| match prior {
            Some(record) => {
                backend.put_raw(record)?;
                Ok(Some(record.clone()))
            }
            None => {
                let current = backend.get_raw(entity, id)?;
                backend.remove_raw(entity, id)?;
                Ok(current)
            }
        })?;

        if let Some(record) = affected {
            tracing::warn!(entity, id, "rolled back optimistic mutation");
            self.publish_one(&def, ChangeOrigin::Local, &record);
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Sync path — the only writers allowed to clear the dirty flag
    // -----------------------------------------------------------------------

    /// Merge a batch of remote records in one transaction, then publish one
    /// coalesced `Remote` change set for everything that changed.
    pub fn apply_remote(
        &self,
        entity: &str,
        remote: &[RemoteRecord],
        pull_time: i64,
    ) -> Result<MergeReport> {
        let def = Arc::clone(self.entity(entity)?);
        let mut report = MergeReport::default();

        self.backend.transaction(|backend| {
            for incoming in remote {
                if !incoming.data.is_object() {
                    report.errors.push(RecordError {
                        id: incoming.id.clone(),
                        entity: entity.to_string(),
                        error: "remote data is not a JSON object".to_string(),
                    });
                    continue;
                }
                let local = backend.get_raw(entity, &incoming.id)?;
                let (decision, action) =
                    merge::decide(entity, local.as_ref(), incoming, pull_time);
                let scope_key = match &decision {
                    MergeDecision::Write(record) => {
                        let key = def.scope_key_of(&record.data);
                        backend.put_raw(record)?;
                        key
                    }
                    MergeDecision::Skip => local
                        .as_ref()
                        .map_or_else(|| UNSCOPED_KEY.to_string(), |r| def.scope_key_of(&r.data)),
                };
                report.applied.push(MergedRecord {
                    id: incoming.id.clone(),
                    action,
                    scope_key,
                });
            }
            Ok(())
        })?;

        let changed: Vec<ChangedRecord> = report
            .changed()
            .map(|m| ChangedRecord {
                id: m.id.clone(),
                scope_key: m.scope_key.clone(),
            })
            .collect();
        tracing::debug!(
            entity,
            applied = changed.len(),
            skipped = report.applied.len() - changed.len(),
            "applied remote batch"
        );
        if !changed.is_empty() {
            self.bus.publish(&ChangeSet {
                entity: entity.to_string(),
                origin: ChangeOrigin::Remote,
                records: changed,
            });
        }
        Ok(report)
    }

    /// Clear the dirty flag for acknowledged rows, in one transaction.
    ///
    /// Each entry carries the `updated_at` captured when the row was read for
    /// upload; a row mutated again mid-flight no longer matches and stays
    /// dirty. Returns the ids actually cleared.
    pub fn mark_synced_many(
        &self,
        entity: &str,
        acks: &[(String, i64)],
        synced_at: i64,
    ) -> Result<Vec<String>> {
        let def = Arc::clone(self.entity(entity)?);

        let cleared = self.backend.transaction(|backend| {
            let mut cleared: Vec<Record> = Vec::new();
            for (id, expected_updated_at) in acks {
                let Some(mut record) = backend.get_raw(entity, id)? else {
                    continue;
                };
                if !record.needs_sync || record.updated_at != *expected_updated_at {
                    continue;
                }
                record.needs_sync = false;
                record.synced_at = Some(synced_at.max(record.updated_at));
                backend.put_raw(&record)?;
                cleared.push(record);
            }
            Ok(cleared)
        })?;

        if !cleared.is_empty() {
            self.bus.publish(&ChangeSet {
                entity: entity.to_string(),
                origin: ChangeOrigin::Local,
                records: cleared
                    .iter()
                    .map(|r| ChangedRecord {
                        id: r.id.clone(),
                        scope_key: def.scope_key_of(&r.data),
                    })
                    .collect(),
            });
        }
        Ok(cleared.into_iter().map(|r| r.id).collect())
    }

    // -----------------------------------------------------------------------
    // Cursors
    // -----------------------------------------------------------------------

    pub fn cursor(&self, entity: &str, scope_key: &str) -> Result<i64> {
        Ok(self
            .backend
            .get_meta(&cursor_key(entity, scope_key))?
            .and_then(|s| s.parse().ok())
            .unwrap_or(0))
    }

    pub fn set_cursor(&self, entity: &str, scope_key: &str, value: i64) -> Result<()> {
        self.backend
            .set_meta(&cursor_key(entity, scope_key), &value.to_string())
    }

    /// Scope keys that have a stored pull cursor for `entity`.
    pub fn cursor_scope_keys(&self, entity: &str) -> Result<Vec<String>> {
        let prefix = format!("cursor:{entity}:");
        Ok(self
            .backend
            .meta_keys(&prefix)?
            .into_iter()
            .filter_map(|k| k.strip_prefix(&prefix).map(str::to_string))
            .collect())
    }

    // -----------------------------------------------------------------------
    // Maintenance
    // -----------------------------------------------------------------------

    /// Hard-remove tombstones (local maintenance only; never synced).
    pub fn purge_tombstones(&self, entity: &str, older_than_ms: Option<i64>) -> Result<usize> {
        self.entity(entity)?;
        self.backend.purge_tombstones_raw(entity, older_than_ms)
    }

    // -----------------------------------------------------------------------
    // Internal
    // -----------------------------------------------------------------------

    fn publish_one(&self, def: &EntityDef, origin: ChangeOrigin, record: &Record) {
        self.bus.publish(&ChangeSet {
            entity: def.name.clone(),
            origin,
            records: vec![ChangedRecord {
                id: record.id.clone(),
                scope_key: def.scope_key_of(&record.data),
            }],
        });
    }
}

fn cursor_key(entity: &str, scope_key: &str) -> String {
    format!("cursor:{entity}:{scope_key}")
}

fn scope_filter(def: &EntityDef, scope: Option<&str>) -> Option<(String, String)> {
    match (&def.scope_field, scope) {
        (Some(field), Some(key)) if key != UNSCOPED_KEY => {
            Some((field.clone(), key.to_string()))
        }
        _ => None,
    }
}

/// Required-field validation: every declared field must be present and
/// non-null. All failures are reported at once.
fn validate_data(def: &EntityDef, data: &Value) -> Result<(), ValidationError> {
    let Some(obj) = data.as_object() else {
        return Err(ValidationError::single(
            &def.name,
            "data",
            "record data must be a JSON object",
        ));
    };
    let missing: Vec<FieldError> = def
        .required
        .iter()
        .filter(|f| obj.get(f.as_str()).is_none_or(Value::is_null))
        .map(|f| FieldError {
            field: f.clone(),
            reason: "required field is missing".to_string(),
        })
        .collect();
    if missing.is_empty() {
        Ok(())
    } else {
        Err(ValidationError::new(&def.name, missing))
    }
}
