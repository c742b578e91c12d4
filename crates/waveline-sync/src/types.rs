//! Core record types shared by the store, sync, and repository layers.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A synchronizable record as held in the local store.
///
/// `data` carries the entity-specific fields; the remaining columns are the
/// sync metadata every table shares. Timestamps are logical unix-epoch
/// milliseconds set by the writer that produced the current value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub id: String,
    pub entity: String,
    pub data: Value,
    pub created_at: i64,
    pub updated_at: i64,
    /// Last time this exact state was confirmed accepted by the remote.
    pub synced_at: Option<i64>,
    /// Dirty flag — the record holds a local change not yet confirmed remotely.
    pub needs_sync: bool,
    /// Soft tombstone. Synced like any other column.
    pub deleted: bool,
}

impl Record {
    /// Whether the dirty/synced metadata is internally consistent:
    /// a clean record must carry a confirmation time at least as new as its
    /// last mutation.
    pub fn sync_metadata_consistent(&self) -> bool {
        self.needs_sync || self.synced_at.is_some_and(|s| s >= self.updated_at)
    }
}

/// A record as exchanged with the remote backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteRecord {
    pub id: String,
    pub data: Value,
    pub created_at: i64,
    pub updated_at: i64,
    #[serde(default)]
    pub deleted: bool,
}

impl RemoteRecord {
    /// Wire form of a local record for push.
    pub fn from_local(record: &Record) -> Self {
        Self {
            id: record.id.clone(),
            data: record.data.clone(),
            created_at: record.created_at,
            updated_at: record.updated_at,
            deleted: record.deleted,
        }
    }
}

/// Overrides for a local write. The defaults (generated id, wall-clock
/// timestamp) are what production callers want; tests pin both.
#[derive(Debug, Clone, Default)]
pub struct WriteOptions {
    /// Use this id instead of generating one.
    pub id: Option<String>,
    /// Use this logical timestamp instead of the current wall clock.
    pub timestamp: Option<i64>,
}

/// Error associated with a specific record inside a batch operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordError {
    pub id: String,
    pub entity: String,
    pub error: String,
}

/// What a pull merge did with a single remote record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeAction {
    Inserted,
    Updated,
    Deleted,
    /// Local dirty copy won under last-write-wins; the remote record was
    /// ignored.
    Skipped,
}

/// Per-record outcome of a pull merge.
#[derive(Debug, Clone)]
pub struct MergedRecord {
    pub id: String,
    pub action: MergeAction,
    /// Scope key of the affected record, for change routing.
    pub scope_key: String,
}

/// Aggregated outcome of applying one batch of remote records.
#[derive(Debug, Clone, Default)]
pub struct MergeReport {
    pub applied: Vec<MergedRecord>,
    pub errors: Vec<RecordError>,
}

impl MergeReport {
    /// Records that actually changed local state (everything but skips).
    pub fn changed(&self) -> impl Iterator<Item = &MergedRecord> {
        self.applied
            .iter()
            .filter(|m| m.action != MergeAction::Skipped)
    }
}

/// Where a record sits in its push lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordSyncState {
    /// Created locally, never confirmed by the remote.
    LocalOnly,
    /// An upload containing this record is in flight.
    Pushing,
    /// Clean — the remote has confirmed the current state.
    Synced,
    /// Dirty again after having been synced at least once.
    PendingUpdate,
}

/// Current wall clock as logical milliseconds.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
