use std::fmt;
use thiserror::Error;

// ---------------------------------------------------------------------------
// ValidationError
// ---------------------------------------------------------------------------

/// A single field-level failure inside a [`ValidationError`].
#[derive(Debug, Clone)]
pub struct FieldError {
    pub field: String,
    pub reason: String,
}

impl fmt::Display for FieldError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{}\": {}", self.field, self.reason)
    }
}

/// A write was rejected before touching storage — missing required fields or
/// a duplicate `id`. Never retried; surfaced synchronously to the caller.
#[derive(Debug, Clone)]
pub struct ValidationError {
    pub entity: String,
    pub errors: Vec<FieldError>,
}

impl ValidationError {
    pub fn new(entity: impl Into<String>, errors: Vec<FieldError>) -> Self {
        Self {
            entity: entity.into(),
            errors,
        }
    }

    pub fn single(
        entity: impl Into<String>,
        field: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::new(
            entity,
            vec![FieldError {
                field: field.into(),
                reason: reason.into(),
            }],
        )
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Validation failed for \"{}\":", self.entity)?;
        for e in &self.errors {
            write!(f, "\n  - {e}")?;
        }
        Ok(())
    }
}

impl std::error::Error for ValidationError {}

// ---------------------------------------------------------------------------
// StoreError
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Record not found: {entity}/{id}")]
    NotFound { entity: String, id: String },

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("Cannot modify immutable field \"{field}\" on {entity}/{id}")]
    ImmutableField {
        entity: String,
        id: String,
        field: String,
    },

    #[error("Store corruption in {entity}/{id}: failed to parse \"{column}\" column")]
    Corruption {
        entity: String,
        id: String,
        column: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("Entity \"{0}\" was not registered when the store was opened.")]
    EntityNotRegistered(String),

    #[error("Transaction error: {message}")]
    Transaction {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
}

// ---------------------------------------------------------------------------
// TransportError
// ---------------------------------------------------------------------------

/// Classification of remote-call failures. Drives retry and suspension
/// behavior in the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    /// Remote unreachable, timeout, or 5xx. Retried with backoff on the next
    /// scheduled pass; affected rows stay dirty.
    Network,
    /// Expired or invalid credential. Suspends sync for the scope until
    /// credentials are refreshed.
    Auth,
    /// The remote rejected the payload. Not retried.
    Permanent,
}

#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct TransportError {
    pub message: String,
    pub kind: TransportErrorKind,
}

impl TransportError {
    pub fn network(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: TransportErrorKind::Network,
        }
    }

    pub fn auth(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: TransportErrorKind::Auth,
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: TransportErrorKind::Permanent,
        }
    }
}

// ---------------------------------------------------------------------------
// SyncError
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("Sync suspended for scope {0} pending credential refresh")]
    Suspended(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

// ---------------------------------------------------------------------------
// WavelineError — top-level rollup
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum WavelineError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<ValidationError> for WavelineError {
    fn from(e: ValidationError) -> Self {
        Self::Store(StoreError::Validation(e))
    }
}

impl From<TransportError> for WavelineError {
    fn from(e: TransportError) -> Self {
        Self::Sync(SyncError::Transport(e))
    }
}

/// Convenience alias — the default error type is `WavelineError`.
pub type Result<T, E = WavelineError> = std::result::Result<T, E>;

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
