//! Pull-merge decision logic.
//!
//! Pure functions: given the local copy (if any) and an incoming remote
//! record, decide what to persist. Conflicts between a dirty local copy and
//! a remote edit are resolved by last-write-wins on `updated_at`; on exact
//! equality the local pending edit wins and stays dirty, so the outcome is
//! deterministic on every device for the same pair of timestamps.

use crate::types::{MergeAction, Record, RemoteRecord};

/// What the store should do with one remote record.
pub enum MergeDecision {
    /// Persist this row (insert or overwrite). Merged rows are always clean:
    /// `needs_sync = false`, `synced_at = pull_time`.
    Write(Record),
    /// Leave the local row untouched — its pending push wins.
    Skip,
}

/// Materialize a remote record as a clean local row.
fn remote_to_record(entity: &str, remote: &RemoteRecord, pull_time: i64) -> Record {
    Record {
        id: remote.id.clone(),
        entity: entity.to_string(),
        data: remote.data.clone(),
        created_at: remote.created_at,
        updated_at: remote.updated_at,
        synced_at: Some(pull_time),
        needs_sync: false,
        deleted: remote.deleted,
    }
}

/// Decide how to apply `remote` against `local`.
///
/// A merge never sets `needs_sync` on a clean record: every written row
/// comes out clean, and a dirty row is either superseded wholesale (clean
/// afterwards) or skipped (unchanged).
pub fn decide(
    entity: &str,
    local: Option<&Record>,
    remote: &RemoteRecord,
    pull_time: i64,
) -> (MergeDecision, MergeAction) {
    let action = if remote.deleted {
        MergeAction::Deleted
    } else {
        MergeAction::Updated
    };

    match local {
        // Absent locally: insert as clean.
        None => (
            MergeDecision::Write(remote_to_record(entity, remote, pull_time)),
            if remote.deleted {
                MergeAction::Deleted
            } else {
                MergeAction::Inserted
            },
        ),
        // Locally clean: the remote is authoritative.
        Some(rec) if !rec.needs_sync => (
            MergeDecision::Write(remote_to_record(entity, remote, pull_time)),
            action,
        ),
        // Locally dirty: last-write-wins. Strictly-newer remote supersedes
        // the unsynced local edit and clears the dirty flag; otherwise the
        // pending push wins.
        Some(rec) => {
            if remote.updated_at > rec.updated_at {
                (
                    MergeDecision::Write(remote_to_record(entity, remote, pull_time)),
                    action,
                )
            } else {
                (MergeDecision::Skip, MergeAction::Skipped)
            }
        }
    }
}
