//! Shared test fixtures: mock transports and an in-memory remote backend.
#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Semaphore;

use waveline_sync::error::TransportError;
use waveline_sync::sync::{SyncTransport, UpsertOutcome};
use waveline_sync::{waveline_entities, LocalStore, RemoteRecord};

pub fn init_tracing() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "warn".into()),
            )
            .with_test_writer()
            .try_init();
    });
}

pub fn open_store() -> Arc<LocalStore> {
    init_tracing();
    Arc::new(LocalStore::open_in_memory(waveline_entities()).expect("store opens"))
}

// ============================================================================
// MockTransport
// ============================================================================

#[derive(Clone)]
pub struct ListCall {
    pub entity: String,
    pub scope: String,
    pub since: i64,
}

#[derive(Clone)]
pub struct PushCall {
    pub entity: String,
    pub records: Vec<RemoteRecord>,
}

type ListFn =
    dyn Fn(&str, &str, i64) -> Result<Vec<RemoteRecord>, TransportError> + Send + Sync;
type PushFn =
    dyn Fn(&str, &[RemoteRecord]) -> Result<Vec<UpsertOutcome>, TransportError> + Send + Sync;

struct MockInner {
    list_calls: Vec<ListCall>,
    push_calls: Vec<PushCall>,
    list_response: Option<Box<ListFn>>,
    push_response: Option<Box<PushFn>>,
}

/// Scriptable transport. Defaults: `list` returns nothing, `upsert_batch`
/// acks every row. Optional gates block the call until the test releases a
/// permit.
pub struct MockTransport {
    inner: Mutex<MockInner>,
    list_gate: Option<Semaphore>,
    push_gate: Option<Semaphore>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(MockInner {
                list_calls: Vec::new(),
                push_calls: Vec::new(),
                list_response: None,
                push_response: None,
            }),
            list_gate: None,
            push_gate: None,
        }
    }

    /// Make `list` wait for a permit from [`release_list`] before returning.
    ///
    /// [`release_list`]: MockTransport::release_list
    pub fn gated_list(mut self) -> Self {
        self.list_gate = Some(Semaphore::new(0));
        self
    }

    pub fn gated_push(mut self) -> Self {
        self.push_gate = Some(Semaphore::new(0));
        self
    }

    pub fn release_list(&self, n: usize) {
        if let Some(gate) = &self.list_gate {
            gate.add_permits(n);
        }
    }

    pub fn release_push(&self, n: usize) {
        if let Some(gate) = &self.push_gate {
            gate.add_permits(n);
        }
    }

    pub fn on_list(
        &self,
        f: impl Fn(&str, &str, i64) -> Result<Vec<RemoteRecord>, TransportError>
            + Send
            + Sync
            + 'static,
    ) {
        self.inner.lock().list_response = Some(Box::new(f));
    }

    pub fn on_push(
        &self,
        f: impl Fn(&str, &[RemoteRecord]) -> Result<Vec<UpsertOutcome>, TransportError>
            + Send
            + Sync
            + 'static,
    ) {
        self.inner.lock().push_response = Some(Box::new(f));
    }

    pub fn list_calls(&self) -> Vec<ListCall> {
        self.inner.lock().list_calls.clone()
    }

    pub fn push_calls(&self) -> Vec<PushCall> {
        self.inner.lock().push_calls.clone()
    }
}

#[async_trait]
impl SyncTransport for MockTransport {
    async fn list(
        &self,
        entity: &str,
        scope_key: &str,
        since: i64,
    ) -> Result<Vec<RemoteRecord>, TransportError> {
        if let Some(gate) = &self.list_gate {
            let permit = gate.acquire().await.expect("gate open");
            permit.forget();
        }
        let mut inner = self.inner.lock();
        inner.list_calls.push(ListCall {
            entity: entity.to_string(),
            scope: scope_key.to_string(),
            since,
        });
        match &inner.list_response {
            Some(f) => f(entity, scope_key, since),
            None => Ok(Vec::new()),
        }
    }

    async fn upsert_batch(
        &self,
        entity: &str,
        records: &[RemoteRecord],
    ) -> Result<Vec<UpsertOutcome>, TransportError> {
        if let Some(gate) = &self.push_gate {
            let permit = gate.acquire().await.expect("gate open");
            permit.forget();
        }
        let mut inner = self.inner.lock();
        inner.push_calls.push(PushCall {
            entity: entity.to_string(),
            records: records.to_vec(),
        });
        match &inner.push_response {
            Some(f) => f(entity, records),
            None => Ok(records
                .iter()
                .map(|r| UpsertOutcome {
                    id: r.id.clone(),
                    accepted: true,
                    error: None,
                })
                .collect()),
        }
    }
}

// ============================================================================
// InMemoryRemote — a tiny server for round-trip tests
// ============================================================================

/// Server-side state shared between "devices" in round-trip tests. Applies
/// last-write-wins on upsert, exactly like the production backend.
pub struct InMemoryRemote {
    scope_fields: HashMap<String, Option<String>>,
    records: Mutex<HashMap<String, BTreeMap<String, RemoteRecord>>>,
}

impl InMemoryRemote {
    pub fn new() -> Self {
        let scope_fields = waveline_entities()
            .into_iter()
            .map(|def| (def.name.clone(), def.scope_field.clone()))
            .collect();
        Self {
            scope_fields,
            records: Mutex::new(HashMap::new()),
        }
    }

    pub fn record_count(&self, entity: &str) -> usize {
        self.records
            .lock()
            .get(entity)
            .map_or(0, BTreeMap::len)
    }
}

#[async_trait]
impl SyncTransport for InMemoryRemote {
    async fn list(
        &self,
        entity: &str,
        scope_key: &str,
        since: i64,
    ) -> Result<Vec<RemoteRecord>, TransportError> {
        let scope_field = self.scope_fields.get(entity).cloned().flatten();
        let records = self.records.lock();
        Ok(records
            .get(entity)
            .map(|table| {
                table
                    .values()
                    .filter(|r| r.updated_at > since)
                    .filter(|r| match (&scope_field, scope_key) {
                        (Some(field), key) if key != "*" => {
                            r.data.get(field).and_then(|v| v.as_str()) == Some(key)
                        }
                        _ => true,
                    })
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn upsert_batch(
        &self,
        entity: &str,
        records: &[RemoteRecord],
    ) -> Result<Vec<UpsertOutcome>, TransportError> {
        let mut tables = self.records.lock();
        let table = tables.entry(entity.to_string()).or_default();
        Ok(records
            .iter()
            .map(|incoming| {
                let keep_incoming = table
                    .get(&incoming.id)
                    .is_none_or(|existing| incoming.updated_at >= existing.updated_at);
                if keep_incoming {
                    table.insert(incoming.id.clone(), incoming.clone());
                }
                UpsertOutcome {
                    id: incoming.id.clone(),
                    accepted: true,
                    error: None,
                }
            })
            .collect())
    }
}
