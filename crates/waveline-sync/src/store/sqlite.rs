//! SQLite row storage for the local store.
//!
//! Uses rusqlite (bundled). The connection is protected by a
//! `parking_lot::ReentrantMutex<RefCell<Connection>>` so that `transaction()`
//! can hold the lock while calling the closure, which also needs to lock in
//! order to execute SQL. All write transactions are therefore serialized;
//! readers observe either the pre- or post-state of a transaction.

use std::cell::{Cell, RefCell};

use parking_lot::ReentrantMutex;
use rusqlite::{params, OptionalExtension};
use serde_json::Value;

use crate::entity::{EntityDef, OrderBy, SortDir};
use crate::error::{Result, StoreError, WavelineError};
use crate::types::Record;

/// Schema version written to `meta('schema:version')`. Migrations are
/// append-only: bump this and add a `migrate_vN` step, never edit old steps.
const SCHEMA_VERSION: i64 = 1;

const SELECT_COLS: &str = "SELECT entity, id, data, created_at, updated_at, \
     synced_at, needs_sync, deleted FROM records";

fn storage_err(e: rusqlite::Error) -> WavelineError {
    WavelineError::Store(StoreError::Sqlite(e))
}

/// Filter for `scan_raw`.
#[derive(Debug, Clone, Default)]
pub struct ListQuery {
    /// Equality filter on a data field: `(field, value)`.
    pub scope: Option<(String, String)>,
    pub include_deleted: bool,
}

pub struct SqliteBackend {
    conn: ReentrantMutex<RefCell<rusqlite::Connection>>,
}

impl SqliteBackend {
    /// Open a file-backed database.
    pub fn open(path: &str) -> Result<Self> {
        let conn = rusqlite::Connection::open(path).map_err(storage_err)?;
        Ok(Self {
            conn: ReentrantMutex::new(RefCell::new(conn)),
        })
    }

    /// Open an in-memory database (tests, previews).
    pub fn open_in_memory() -> Result<Self> {
        let conn = rusqlite::Connection::open_in_memory().map_err(storage_err)?;
        Ok(Self {
            conn: ReentrantMutex::new(RefCell::new(conn)),
        })
    }

    /// Apply pragmas, run pending migrations, and create per-entity indexes.
    pub fn initialize(&self, entities: &[std::sync::Arc<EntityDef>]) -> Result<()> {
        {
            let guard = self.conn.lock();
            let conn = guard.borrow();

            conn.execute_batch(
                "PRAGMA journal_mode=WAL;
                 PRAGMA synchronous=NORMAL;
                 PRAGMA busy_timeout=5000;",
            )
            .map_err(storage_err)?;

            conn.execute_batch(
                "CREATE TABLE IF NOT EXISTS meta (
                    key   TEXT PRIMARY KEY,
                    value TEXT NOT NULL
                );",
            )
            .map_err(storage_err)?;

            let version = read_schema_version(&conn).map_err(storage_err)?;
            if version < 1 {
                migrate_v1(&conn).map_err(storage_err)?;
            }

            conn.execute(
                "INSERT OR REPLACE INTO meta (key, value) VALUES ('schema:version', ?1)",
                params![SCHEMA_VERSION.to_string()],
            )
            .map_err(storage_err)?;
        }

        for def in entities {
            self.create_entity_indexes(def)?;
        }

        tracing::info!(schema_version = SCHEMA_VERSION, "local store initialized");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Raw record I/O
    // -----------------------------------------------------------------------

    pub fn get_raw(&self, entity: &str, id: &str) -> Result<Option<Record>> {
        let row = {
            let guard = self.conn.lock();
            let conn = guard.borrow();
            let mut stmt = conn
                .prepare_cached(&format!(
                    "{SELECT_COLS} WHERE entity = ?1 AND id = ?2"
                ))
                .map_err(storage_err)?;
            stmt.query_row(params![entity, id], row_to_raw)
                .optional()
                .map_err(storage_err)?
        };
        row.map(raw_to_record).transpose()
    }

    pub fn put_raw(&self, record: &Record) -> Result<()> {
        let data_str = serde_json::to_string(&record.data)
            .map_err(|e| WavelineError::Internal(format!("serialize data: {e}")))?;
        let guard = self.conn.lock();
        let conn = guard.borrow();
        conn.execute(
            "INSERT OR REPLACE INTO records \
             (entity, id, data, created_at, updated_at, synced_at, needs_sync, deleted) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                record.entity,
                record.id,
                data_str,
                record.created_at,
                record.updated_at,
                record.synced_at,
                record.needs_sync as i64,
                record.deleted as i64,
            ],
        )
        .map_err(storage_err)?;
        Ok(())
    }

    /// Hard-remove a row. Used only for rolling back a never-synced
    /// optimistic insert and for tombstone purging — never by the sync path.
    pub fn remove_raw(&self, entity: &str, id: &str) -> Result<bool> {
        let guard = self.conn.lock();
        let conn = guard.borrow();
        let n = conn
            .execute(
                "DELETE FROM records WHERE entity = ?1 AND id = ?2",
                params![entity, id],
            )
            .map_err(storage_err)?;
        Ok(n > 0)
    }

    /// Scan records of an entity, optionally filtered to one scope value,
    /// ordered per `order`. Ties are broken by `id` so ordering is stable.
    pub fn scan_raw(
        &self,
        entity: &str,
        query: &ListQuery,
        order: &OrderBy,
    ) -> Result<Vec<Record>> {
        let mut conditions = vec!["entity = ?1".to_string()];
        if !query.include_deleted {
            conditions.push("deleted = 0".to_string());
        }
        if query.scope.is_some() {
            conditions.push("json_extract(data, ?2) = ?3".to_string());
        }

        let sql = format!(
            "{SELECT_COLS} WHERE {} ORDER BY {}, id ASC",
            conditions.join(" AND "),
            order_clause(order),
        );

        let rows = {
            let guard = self.conn.lock();
            let conn = guard.borrow();
            let mut stmt = conn.prepare_cached(&sql).map_err(storage_err)?;
            let mapped = match &query.scope {
                Some((field, value)) => stmt.query_map(
                    params![entity, format!("$.{field}"), value],
                    row_to_raw,
                ),
                None => stmt.query_map(params![entity], row_to_raw),
            }
            .map_err(storage_err)?;
            let collected: rusqlite::Result<Vec<RawRow>> = mapped.collect();
            collected.map_err(storage_err)?
        };

        rows.into_iter().map(raw_to_record).collect()
    }

    /// Scan rows with unpushed local changes, optionally within one scope.
    /// Tombstones are included — deletes sync too.
    pub fn scan_dirty_raw(
        &self,
        entity: &str,
        scope: Option<(&str, &str)>,
    ) -> Result<Vec<Record>> {
        let sql = match scope {
            Some(_) => format!(
                "{SELECT_COLS} WHERE entity = ?1 AND needs_sync = 1 \
                 AND json_extract(data, ?2) = ?3 ORDER BY updated_at ASC, id ASC"
            ),
            None => format!(
                "{SELECT_COLS} WHERE entity = ?1 AND needs_sync = 1 \
                 ORDER BY updated_at ASC, id ASC"
            ),
        };

        let rows = {
            let guard = self.conn.lock();
            let conn = guard.borrow();
            let mut stmt = conn.prepare_cached(&sql).map_err(storage_err)?;
            let mapped = match scope {
                Some((field, value)) => {
                    stmt.query_map(params![entity, format!("$.{field}"), value], row_to_raw)
                }
                None => stmt.query_map(params![entity], row_to_raw),
            }
            .map_err(storage_err)?;
            let collected: rusqlite::Result<Vec<RawRow>> = mapped.collect();
            collected.map_err(storage_err)?
        };

        rows.into_iter().map(raw_to_record).collect()
    }

    /// Ordered range query over the `updated_at` index: live rows changed
    /// after `since`, oldest change first.
    pub fn scan_updated_since_raw(&self, entity: &str, since: i64) -> Result<Vec<Record>> {
        let rows = {
            let guard = self.conn.lock();
            let conn = guard.borrow();
            let mut stmt = conn
                .prepare_cached(&format!(
                    "{SELECT_COLS} WHERE entity = ?1 AND deleted = 0 AND updated_at > ?2 \
                     ORDER BY updated_at ASC, id ASC"
                ))
                .map_err(storage_err)?;
            let mapped = stmt
                .query_map(params![entity, since], row_to_raw)
                .map_err(storage_err)?;
            let collected: rusqlite::Result<Vec<RawRow>> = mapped.collect();
            collected.map_err(storage_err)?
        };
        rows.into_iter().map(raw_to_record).collect()
    }

    /// Remove tombstones, optionally only those deleted before
    /// `now - older_than_ms`. Returns the number of rows purged.
    pub fn purge_tombstones_raw(&self, entity: &str, older_than_ms: Option<i64>) -> Result<usize> {
        let guard = self.conn.lock();
        let conn = guard.borrow();
        let n = match older_than_ms {
            Some(age) => {
                let cutoff = crate::types::now_ms() - age;
                conn.execute(
                    "DELETE FROM records WHERE entity = ?1 AND deleted = 1 AND updated_at < ?2",
                    params![entity, cutoff],
                )
            }
            None => conn.execute(
                "DELETE FROM records WHERE entity = ?1 AND deleted = 1",
                params![entity],
            ),
        }
        .map_err(storage_err)?;
        Ok(n)
    }

    // -----------------------------------------------------------------------
    // Metadata
    // -----------------------------------------------------------------------

    pub fn get_meta(&self, key: &str) -> Result<Option<String>> {
        let guard = self.conn.lock();
        let conn = guard.borrow();
        let mut stmt = conn
            .prepare_cached("SELECT value FROM meta WHERE key = ?1")
            .map_err(storage_err)?;
        stmt.query_row(params![key], |row| row.get::<_, String>(0))
            .optional()
            .map_err(storage_err)
    }

    pub fn set_meta(&self, key: &str, value: &str) -> Result<()> {
        let guard = self.conn.lock();
        let conn = guard.borrow();
        conn.execute(
            "INSERT OR REPLACE INTO meta (key, value) VALUES (?1, ?2)",
            params![key, value],
        )
        .map_err(storage_err)?;
        Ok(())
    }

    /// All meta keys starting with `prefix` (cursor enumeration).
    pub fn meta_keys(&self, prefix: &str) -> Result<Vec<String>> {
        let guard = self.conn.lock();
        let conn = guard.borrow();
        let mut stmt = conn
            .prepare_cached("SELECT key FROM meta WHERE key LIKE ?1 ORDER BY key")
            .map_err(storage_err)?;
        let rows = stmt
            .query_map(params![format!("{prefix}%")], |row| row.get::<_, String>(0))
            .map_err(storage_err)?;
        let keys: rusqlite::Result<Vec<String>> = rows.collect();
        keys.map_err(storage_err)
    }

    // -----------------------------------------------------------------------
    // Transactions
    // -----------------------------------------------------------------------

    /// Execute `f` inside a savepoint: commit on `Ok`, roll back on `Err`.
    ///
    /// Savepoints compose with outer transactions; each invocation gets a
    /// unique name so nesting is safe. The `ReentrantMutex` lets the closure
    /// re-acquire the lock for its own SQL calls.
    pub fn transaction<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Self) -> Result<T>,
    {
        thread_local! {
            static SP_COUNTER: Cell<u64> = const { Cell::new(0) };
        }
        let sp_name = SP_COUNTER.with(|c| {
            let n = c.get();
            c.set(n + 1);
            format!("sp_{n}")
        });

        // Hold the lock across the whole savepoint so no reader observes the
        // intermediate state of a multi-row write.
        let guard = self.conn.lock();
        guard
            .borrow()
            .execute(&format!("SAVEPOINT {sp_name}"), [])
            .map_err(storage_err)?;

        match f(self) {
            Ok(v) => {
                guard
                    .borrow()
                    .execute(&format!("RELEASE SAVEPOINT {sp_name}"), [])
                    .map_err(|e| {
                        let _ = guard
                            .borrow()
                            .execute(&format!("ROLLBACK TO SAVEPOINT {sp_name}"), []);
                        WavelineError::Store(StoreError::Transaction {
                            message: "RELEASE SAVEPOINT failed".to_string(),
                            source: Some(Box::new(e)),
                        })
                    })?;
                Ok(v)
            }
            Err(e) => {
                let _ = guard
                    .borrow()
                    .execute(&format!("ROLLBACK TO SAVEPOINT {sp_name}"), []);
                let _ = guard
                    .borrow()
                    .execute(&format!("RELEASE SAVEPOINT {sp_name}"), []);
                Err(e)
            }
        }
    }

    // -----------------------------------------------------------------------
    // Internal
    // -----------------------------------------------------------------------

    fn create_entity_indexes(&self, def: &EntityDef) -> Result<()> {
        let guard = self.conn.lock();
        let conn = guard.borrow();

        let mut fields: Vec<&String> = def.indexed.iter().collect();
        if let Some(scope) = &def.scope_field {
            if !def.indexed.contains(scope) {
                fields.push(scope);
            }
        }

        for field in fields {
            let sql = format!(
                "CREATE INDEX IF NOT EXISTS idx_{}_{} ON records \
                 (entity, json_extract(data, '$.{}'))",
                def.name, field, field
            );
            conn.execute_batch(&sql).map_err(storage_err)?;
        }
        Ok(())
    }
}

// ============================================================================
// Schema migrations (append-only)
// ============================================================================

fn read_schema_version(conn: &rusqlite::Connection) -> rusqlite::Result<i64> {
    let v: Option<String> = conn
        .query_row(
            "SELECT value FROM meta WHERE key = 'schema:version'",
            [],
            |row| row.get(0),
        )
        .optional()?;
    Ok(v.and_then(|s| s.parse().ok()).unwrap_or(0))
}

/// v1: the records table. Every entity shares it, keyed `(entity, id)`, with
/// the standard sync metadata columns.
fn migrate_v1(conn: &rusqlite::Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS records (
            entity     TEXT NOT NULL,
            id         TEXT NOT NULL,
            data       TEXT NOT NULL DEFAULT '{}',
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            synced_at  INTEGER,
            needs_sync INTEGER NOT NULL DEFAULT 0,
            deleted    INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (entity, id)
        );
        CREATE INDEX IF NOT EXISTS idx_records_dirty
            ON records(entity, needs_sync);
        CREATE INDEX IF NOT EXISTS idx_records_updated
            ON records(entity, updated_at);",
    )
}

// ============================================================================
// Row mapping
// ============================================================================

struct RawRow {
    entity: String,
    id: String,
    data: String,
    created_at: i64,
    updated_at: i64,
    synced_at: Option<i64>,
    needs_sync: i64,
    deleted: i64,
}

fn row_to_raw(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawRow> {
    Ok(RawRow {
        entity: row.get(0)?,
        id: row.get(1)?,
        data: row.get(2)?,
        created_at: row.get(3)?,
        updated_at: row.get(4)?,
        synced_at: row.get(5)?,
        needs_sync: row.get(6)?,
        deleted: row.get(7)?,
    })
}

fn raw_to_record(raw: RawRow) -> Result<Record> {
    let data: Value = serde_json::from_str(&raw.data).map_err(|e| {
        WavelineError::Store(StoreError::Corruption {
            entity: raw.entity.clone(),
            id: raw.id.clone(),
            column: "data".to_string(),
            source: Box::new(e),
        })
    })?;
    Ok(Record {
        id: raw.id,
        entity: raw.entity,
        data,
        created_at: raw.created_at,
        updated_at: raw.updated_at,
        synced_at: raw.synced_at,
        needs_sync: raw.needs_sync != 0,
        deleted: raw.deleted != 0,
    })
}

fn order_clause(order: &OrderBy) -> String {
    let dir = match order.dir {
        SortDir::Asc => "ASC",
        SortDir::Desc => "DESC",
    };
    // created_at / updated_at are real columns; everything else lives in data.
    let expr = match order.field.as_str() {
        "created_at" | "updated_at" => order.field.clone(),
        field => format!("json_extract(data, '$.{field}')"),
    };
    format!("{expr} {dir}")
}
