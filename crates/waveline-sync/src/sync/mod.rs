//! Push/pull reconciliation against the remote backend.

pub mod coordinator;
pub mod http;
pub mod status;
pub mod types;

pub use coordinator::{CoordinatorOptions, SyncCoordinator};
pub use http::HttpTransport;
pub use status::{ScopePhase, ScopeStatus, StatusEvent, SyncStatusBoard};
pub use types::{Scope, SyncErrorEvent, SyncOutcome, SyncPhase, SyncTransport, UpsertOutcome};
