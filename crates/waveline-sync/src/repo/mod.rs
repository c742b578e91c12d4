//! Per-entity repositories — the surface the UI layer consumes.

pub mod repository;

pub use repository::{RecordsSubscription, Repository};
