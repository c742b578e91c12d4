//! ChangeSet — one committed store transaction's worth of changes.
//!
//! The store publishes exactly one `ChangeSet` per committed write
//! transaction or merge batch, after the transaction has returned. Writes
//! inside one transaction are therefore always coalesced into a single
//! notification per subscriber.

/// Where a change originated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeOrigin {
    /// A local mutation through the repository write path.
    Local,
    /// A pull merge applied remote state.
    Remote,
}

/// One affected record, with its scope key for subscription routing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangedRecord {
    pub id: String,
    pub scope_key: String,
}

/// All records affected by one committed transaction or merge batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeSet {
    pub entity: String,
    pub origin: ChangeOrigin,
    pub records: Vec<ChangedRecord>,
}

impl ChangeSet {
    pub fn ids(&self) -> Vec<&str> {
        self.records.iter().map(|r| r.id.as_str()).collect()
    }
}
