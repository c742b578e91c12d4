//! Reactive notification layer: coalesced change events and the
//! publish/subscribe bus that delivers them.

pub mod bus;
pub mod event;

pub use bus::{BusSubscription, ChangeBus, SubscriptionFilter, SubscriptionId};
pub use event::{ChangeOrigin, ChangeSet, ChangedRecord};
