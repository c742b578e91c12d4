//! Sync-specific types: the transport trait, the scope unit, and outcome
//! structures.

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{TransportError, TransportErrorKind};
use crate::types::RemoteRecord;

/// The unit pull/push mutual exclusion and batching are applied over:
/// one entity plus one scope key (e.g. all comments of one episode).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Scope {
    pub entity: String,
    pub key: String,
}

impl Scope {
    pub fn new(entity: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            entity: entity.into(),
            key: key.into(),
        }
    }

    /// The whole-table scope for entities without a scope field.
    pub fn unscoped(entity: impl Into<String>) -> Self {
        Self::new(entity, crate::entity::UNSCOPED_KEY)
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.entity, self.key)
    }
}

/// Network layer against the remote backend. Implementations handle the
/// actual protocol; [`HttpTransport`] is the production one, tests plug in
/// mocks.
///
/// [`HttpTransport`]: crate::sync::http::HttpTransport
#[async_trait]
pub trait SyncTransport: Send + Sync {
    /// Incremental pull: records of `entity` within `scope_key` whose
    /// `updated_at` is newer than `since`.
    async fn list(
        &self,
        entity: &str,
        scope_key: &str,
        since: i64,
    ) -> Result<Vec<RemoteRecord>, TransportError>;

    /// Batch upload of dirty records. Returns one outcome per row; rows
    /// missing from the response are treated as not accepted.
    async fn upsert_batch(
        &self,
        entity: &str,
        records: &[RemoteRecord],
    ) -> Result<Vec<UpsertOutcome>, TransportError>;
}

/// Per-row result of an upsert batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpsertOutcome {
    pub id: String,
    pub accepted: bool,
    #[serde(default)]
    pub error: Option<String>,
}

/// Which phase of a sync pass an error occurred in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    Pull,
    Push,
}

/// A sync error event — accumulated in [`SyncOutcome::errors`] and mirrored
/// on the status board, never thrown into the caller's read path.
#[derive(Debug, Clone)]
pub struct SyncErrorEvent {
    pub phase: SyncPhase,
    pub scope: Scope,
    pub id: Option<String>,
    pub message: String,
    pub kind: TransportErrorKind,
}

/// Aggregated result of a sync pass (pull, push, or both).
#[derive(Debug, Clone, Default)]
pub struct SyncOutcome {
    pub pushed: usize,
    pub pulled: usize,
    pub errors: Vec<SyncErrorEvent>,
}

impl SyncOutcome {
    pub fn merge(&mut self, other: SyncOutcome) {
        self.pushed += other.pushed;
        self.pulled += other.pulled;
        self.errors.extend(other.errors);
    }

    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }
}
