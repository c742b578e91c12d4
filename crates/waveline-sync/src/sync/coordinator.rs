//! SyncCoordinator — pull/pushes one `(entity, scope_key)` at a time.
//!
//! Mutual exclusion is single-flight per scope and phase: the first caller
//! runs the network operation, every caller that arrives while it is in
//! flight is handed the same outcome through a queued oneshot sender instead
//! of issuing a duplicate network call. Different scopes run in parallel.
//!
//! Public methods never return `Err` — failures are collected in
//! `SyncOutcome.errors` and mirrored on the status board.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::entity::UNSCOPED_KEY;
use crate::error::{TransportError, TransportErrorKind};
use crate::store::LocalStore;
use crate::types::{now_ms, Record, RecordSyncState, RemoteRecord};

use super::status::{ScopePhase, SyncStatusBoard};
use super::types::{Scope, SyncErrorEvent, SyncOutcome, SyncPhase, SyncTransport};

/// Tuning knobs for the coordinator.
#[derive(Debug, Clone)]
pub struct CoordinatorOptions {
    /// Rows per upload request.
    pub push_batch_size: usize,
    /// How long a scheduled push waits before collecting dirty rows, so a
    /// burst of mutations lands in one batch.
    pub push_debounce_ms: u64,
}

impl Default for CoordinatorOptions {
    fn default() -> Self {
        Self {
            push_batch_size: 50,
            push_debounce_ms: 25,
        }
    }
}

type FlightMap = Arc<Mutex<HashMap<Scope, Vec<oneshot::Sender<SyncOutcome>>>>>;

pub struct SyncCoordinator {
    store: Arc<LocalStore>,
    transport: Arc<dyn SyncTransport>,
    status: Arc<SyncStatusBoard>,
    opts: CoordinatorOptions,
    pull_flights: FlightMap,
    push_flights: FlightMap,
    /// `(entity, id)` pairs with an upload currently in flight.
    pushing: Mutex<HashSet<(String, String)>>,
}

impl SyncCoordinator {
    pub fn new(store: Arc<LocalStore>, transport: Arc<dyn SyncTransport>) -> Self {
        Self::with_options(store, transport, CoordinatorOptions::default())
    }

    pub fn with_options(
        store: Arc<LocalStore>,
        transport: Arc<dyn SyncTransport>,
        mut opts: CoordinatorOptions,
    ) -> Self {
        opts.push_batch_size = opts.push_batch_size.max(1);
        Self {
            store,
            transport,
            status: Arc::new(SyncStatusBoard::new()),
            opts,
            pull_flights: Arc::new(Mutex::new(HashMap::new())),
            push_flights: Arc::new(Mutex::new(HashMap::new())),
            pushing: Mutex::new(HashSet::new()),
        }
    }

    pub fn status(&self) -> &Arc<SyncStatusBoard> {
        &self.status
    }

    // -----------------------------------------------------------------------
    // Public API
    // -----------------------------------------------------------------------

    /// Pull remote changes for a scope into the local store.
    pub async fn pull(&self, scope: &Scope) -> SyncOutcome {
        match join_or_lead(&self.pull_flights, scope) {
            FlightRole::Join(rx) => await_leader(rx, scope, SyncPhase::Pull).await,
            FlightRole::Lead(guard) => {
                let outcome = self.pull_impl(scope).await;
                guard.complete(&outcome);
                outcome
            }
        }
    }

    /// Upload dirty rows of a scope.
    pub async fn push(&self, scope: &Scope) -> SyncOutcome {
        match join_or_lead(&self.push_flights, scope) {
            FlightRole::Join(rx) => await_leader(rx, scope, SyncPhase::Push).await,
            FlightRole::Lead(guard) => {
                let outcome = self.push_impl(scope).await;
                guard.complete(&outcome);
                outcome
            }
        }
    }

    /// Full pull+push pass for one scope.
    pub async fn sync(&self, scope: &Scope) -> SyncOutcome {
        let mut outcome = self.pull(scope).await;
        outcome.merge(self.push(scope).await);
        outcome
    }

    /// Sync every known scope: scopes with dirty rows plus scopes that have
    /// pulled before (a stored cursor).
    pub async fn sync_all(&self) -> HashMap<Scope, SyncOutcome> {
        let mut results = HashMap::new();
        for def in self.store.entity_defs() {
            let mut keys: HashSet<String> = HashSet::new();
            if def.scope_field.is_none() {
                keys.insert(UNSCOPED_KEY.to_string());
            } else {
                if let Ok(dirty) = self.store.dirty_records(&def.name, None) {
                    for record in &dirty {
                        keys.insert(def.scope_key_of(&record.data));
                    }
                }
                if let Ok(cursors) = self.store.cursor_scope_keys(&def.name) {
                    keys.extend(cursors);
                }
            }
            for key in keys {
                let scope = Scope::new(def.name.clone(), key);
                let outcome = self.sync(&scope).await;
                results.insert(scope, outcome);
            }
        }
        results
    }

    /// Background push used after local mutations. Waits out the debounce so
    /// a burst of mutations lands in one batch, and skips scopes inside
    /// their backoff window — the rows stay dirty and the next pass retries.
    pub async fn schedule_push(&self, scope: &Scope) -> Option<SyncOutcome> {
        if self.status.should_defer(scope, now_ms()) {
            tracing::debug!(%scope, "push deferred by backoff");
            return None;
        }
        tokio::time::sleep(tokio::time::Duration::from_millis(self.opts.push_debounce_ms)).await;
        Some(self.push(scope).await)
    }

    /// Remote write for a write-through mutation: upload one record and
    /// return the confirmation time. The caller finalizes or rolls back
    /// local state.
    pub async fn write_through(
        &self,
        scope: &Scope,
        record: &Record,
    ) -> Result<i64, TransportError> {
        let key = (record.entity.clone(), record.id.clone());
        self.pushing.lock().insert(key.clone());
        let result = self
            .transport
            .upsert_batch(&scope.entity, &[RemoteRecord::from_local(record)])
            .await;
        self.pushing.lock().remove(&key);

        let outcomes = result?;
        let accepted = outcomes.iter().any(|o| o.id == record.id && o.accepted);
        if accepted {
            Ok(now_ms())
        } else {
            let reason = outcomes
                .iter()
                .find(|o| o.id == record.id)
                .and_then(|o| o.error.clone())
                .unwrap_or_else(|| "record not acknowledged".to_string());
            Err(TransportError::permanent(reason))
        }
    }

    /// Lift auth suspensions after a credential refresh.
    pub fn credentials_refreshed(&self) {
        self.status.resume_all();
    }

    /// Where a record sits in its push lifecycle.
    pub fn record_sync_state(&self, entity: &str, id: &str) -> crate::error::Result<RecordSyncState> {
        let record = self.store.get_any(entity, id)?.ok_or_else(|| {
            crate::error::StoreError::NotFound {
                entity: entity.to_string(),
                id: id.to_string(),
            }
        })?;
        let in_flight = self
            .pushing
            .lock()
            .contains(&(entity.to_string(), id.to_string()));
        Ok(match (record.needs_sync, record.synced_at, in_flight) {
            (true, _, true) => RecordSyncState::Pushing,
            (false, _, _) => RecordSyncState::Synced,
            (true, None, false) => RecordSyncState::LocalOnly,
            (true, Some(_), false) => RecordSyncState::PendingUpdate,
        })
    }

    // -----------------------------------------------------------------------
    // Pull implementation
    // -----------------------------------------------------------------------

    async fn pull_impl(&self, scope: &Scope) -> SyncOutcome {
        let mut outcome = SyncOutcome::default();
        if self.check_suspended(scope, SyncPhase::Pull, &mut outcome) {
            return outcome;
        }
        self.status.set_phase(scope, ScopePhase::Pulling);

        let since = match self.store.cursor(&scope.entity, &scope.key) {
            Ok(v) => v,
            Err(e) => {
                self.store_error(scope, SyncPhase::Pull, None, &e, &mut outcome);
                return outcome;
            }
        };

        let records = match self.transport.list(&scope.entity, &scope.key, since).await {
            Ok(records) => records,
            Err(e) => {
                self.transport_error(scope, SyncPhase::Pull, e, &mut outcome);
                return outcome;
            }
        };

        if !records.is_empty() {
            let pull_time = now_ms();
            let report = match self.store.apply_remote(&scope.entity, &records, pull_time) {
                Ok(report) => report,
                Err(e) => {
                    // Cursor is not advanced — the batch will be re-pulled.
                    self.store_error(scope, SyncPhase::Pull, None, &e, &mut outcome);
                    return outcome;
                }
            };
            outcome.pulled = report.changed().count();
            for err in &report.errors {
                outcome.errors.push(SyncErrorEvent {
                    phase: SyncPhase::Pull,
                    scope: scope.clone(),
                    id: Some(err.id.clone()),
                    message: err.error.clone(),
                    kind: TransportErrorKind::Permanent,
                });
            }

            // Forward-only cursor advance.
            let latest = records.iter().map(|r| r.updated_at).max().unwrap_or(since);
            if latest > since {
                if let Err(e) = self.store.set_cursor(&scope.entity, &scope.key, latest) {
                    self.store_error(scope, SyncPhase::Pull, None, &e, &mut outcome);
                    return outcome;
                }
            }
        }

        tracing::debug!(%scope, pulled = outcome.pulled, "pull pass complete");
        self.status.record_success(scope);
        outcome
    }

    // -----------------------------------------------------------------------
    // Push implementation
    // -----------------------------------------------------------------------

    async fn push_impl(&self, scope: &Scope) -> SyncOutcome {
        let mut outcome = SyncOutcome::default();
        if self.check_suspended(scope, SyncPhase::Push, &mut outcome) {
            return outcome;
        }
        self.status.set_phase(scope, ScopePhase::Pushing);

        let dirty = match self.store.dirty_records(&scope.entity, Some(&scope.key)) {
            Ok(rows) => rows,
            Err(e) => {
                self.store_error(scope, SyncPhase::Push, None, &e, &mut outcome);
                return outcome;
            }
        };
        if dirty.is_empty() {
            self.status.record_success(scope);
            return outcome;
        }

        // TOCTOU guard: remember each row's updated_at at upload time so an
        // ack cannot clear a row that was mutated again mid-flight.
        let snapshots: HashMap<&str, i64> = dirty
            .iter()
            .map(|r| (r.id.as_str(), r.updated_at))
            .collect();

        let flight_keys: Vec<(String, String)> = dirty
            .iter()
            .map(|r| (r.entity.clone(), r.id.clone()))
            .collect();
        {
            let mut pushing = self.pushing.lock();
            pushing.extend(flight_keys.iter().cloned());
        }

        let mut transport_failed = false;
        for chunk in dirty.chunks(self.opts.push_batch_size) {
            let outbound: Vec<RemoteRecord> = chunk.iter().map(RemoteRecord::from_local).collect();
            let results = match self.transport.upsert_batch(&scope.entity, &outbound).await {
                Ok(results) => results,
                Err(e) => {
                    // Remaining rows stay dirty; next pass retries them.
                    self.transport_error(scope, SyncPhase::Push, e, &mut outcome);
                    transport_failed = true;
                    break;
                }
            };

            let now = now_ms();
            let mut acks: Vec<(String, i64)> = Vec::new();
            for result in &results {
                if result.accepted {
                    if let Some(updated_at) = snapshots.get(result.id.as_str()) {
                        acks.push((result.id.clone(), *updated_at));
                    }
                } else {
                    outcome.errors.push(SyncErrorEvent {
                        phase: SyncPhase::Push,
                        scope: scope.clone(),
                        id: Some(result.id.clone()),
                        message: result
                            .error
                            .clone()
                            .unwrap_or_else(|| "record rejected by remote".to_string()),
                        kind: TransportErrorKind::Permanent,
                    });
                }
            }

            match self.store.mark_synced_many(&scope.entity, &acks, now) {
                Ok(cleared) => outcome.pushed += cleared.len(),
                Err(e) => {
                    self.store_error(scope, SyncPhase::Push, None, &e, &mut outcome);
                    break;
                }
            }
        }

        {
            let mut pushing = self.pushing.lock();
            for key in &flight_keys {
                pushing.remove(key);
            }
        }

        if !transport_failed {
            self.status.record_success(scope);
        }
        tracing::debug!(%scope, pushed = outcome.pushed, errors = outcome.errors.len(), "push pass complete");
        outcome
    }

    // -----------------------------------------------------------------------
    // Error routing
    // -----------------------------------------------------------------------

    fn check_suspended(&self, scope: &Scope, phase: SyncPhase, outcome: &mut SyncOutcome) -> bool {
        if self.status.is_suspended(scope) {
            outcome.errors.push(SyncErrorEvent {
                phase,
                scope: scope.clone(),
                id: None,
                message: "sync suspended pending credential refresh".to_string(),
                kind: TransportErrorKind::Auth,
            });
            true
        } else {
            false
        }
    }

    fn transport_error(
        &self,
        scope: &Scope,
        phase: SyncPhase,
        error: TransportError,
        outcome: &mut SyncOutcome,
    ) {
        match error.kind {
            TransportErrorKind::Auth => {
                tracing::warn!(%scope, "auth failure, suspending scope");
                self.status.suspend(scope, &error.message);
            }
            TransportErrorKind::Network => {
                self.status.record_failure(scope, &error.message, now_ms());
            }
            TransportErrorKind::Permanent => {
                self.status.record_failure(scope, &error.message, now_ms());
            }
        }
        self.status.set_phase(scope, ScopePhase::Idle);
        outcome.errors.push(SyncErrorEvent {
            phase,
            scope: scope.clone(),
            id: None,
            message: error.message,
            kind: error.kind,
        });
    }

    fn store_error(
        &self,
        scope: &Scope,
        phase: SyncPhase,
        id: Option<String>,
        error: &crate::error::WavelineError,
        outcome: &mut SyncOutcome,
    ) {
        self.status.record_failure(scope, &error.to_string(), now_ms());
        outcome.errors.push(SyncErrorEvent {
            phase,
            scope: scope.clone(),
            id,
            message: error.to_string(),
            kind: TransportErrorKind::Permanent,
        });
    }
}

// ============================================================================
// Single-flight plumbing
// ============================================================================

enum FlightRole {
    /// This caller runs the operation and distributes the outcome.
    Lead(FlightGuard),
    /// An operation is already in flight — await its outcome.
    Join(oneshot::Receiver<SyncOutcome>),
}

/// Clears the flight entry when the leader finishes — including when the
/// leading task is aborted, so joiners are never left hanging.
struct FlightGuard {
    flights: FlightMap,
    scope: Scope,
    done: bool,
}

impl FlightGuard {
    fn complete(mut self, outcome: &SyncOutcome) {
        let waiters = self.flights.lock().remove(&self.scope).unwrap_or_default();
        for tx in waiters {
            let _ = tx.send(outcome.clone());
        }
        self.done = true;
    }
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        // Leader was cancelled mid-flight. Joiners see the cancellation via a
        // dropped sender rather than a fabricated outcome.
        let _ = self.flights.lock().remove(&self.scope);
    }
}

fn join_or_lead(flights: &FlightMap, scope: &Scope) -> FlightRole {
    let mut map = flights.lock();
    if let Some(waiters) = map.get_mut(scope) {
        let (tx, rx) = oneshot::channel();
        waiters.push(tx);
        FlightRole::Join(rx)
    } else {
        map.insert(scope.clone(), Vec::new());
        FlightRole::Lead(FlightGuard {
            flights: Arc::clone(flights),
            scope: scope.clone(),
            done: false,
        })
    }
}

async fn await_leader(
    rx: oneshot::Receiver<SyncOutcome>,
    scope: &Scope,
    phase: SyncPhase,
) -> SyncOutcome {
    match rx.await {
        Ok(outcome) => outcome,
        Err(_) => {
            // The in-flight operation was cancelled before completing.
            let mut outcome = SyncOutcome::default();
            outcome.errors.push(SyncErrorEvent {
                phase,
                scope: scope.clone(),
                id: None,
                message: "in-flight operation was cancelled".to_string(),
                kind: TransportErrorKind::Network,
            });
            outcome
        }
    }
}
