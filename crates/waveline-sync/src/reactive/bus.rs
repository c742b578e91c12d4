//! ChangeBus — explicit publish/subscribe over [`ChangeSet`]s.
//!
//! Subscriptions are pure message passing: each subscriber owns an unbounded
//! receiver, and `publish` enqueues one message per matching subscription.
//! Nothing runs re-entrantly inside the write that triggered the event — the
//! publisher only enqueues, it never calls back into subscriber code.
//!
//! Cancellation removes the sender under the registry lock, so once
//! `cancel()` returns no further messages are enqueued for that subscription.
//! Messages already sitting in the channel are dropped with the receiver.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::event::ChangeSet;

/// A subscription id returned by [`ChangeBus::subscribe`] that can be passed
/// to [`ChangeBus::cancel`].
pub type SubscriptionId = u64;

/// What a subscription wants to hear about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionFilter {
    pub entity: String,
    /// `None` — every scope of the entity.
    pub scope_key: Option<String>,
    /// `None` — every record matching the scope.
    pub record_id: Option<String>,
}

impl SubscriptionFilter {
    /// Every change to an entity.
    pub fn entity(entity: impl Into<String>) -> Self {
        Self {
            entity: entity.into(),
            scope_key: None,
            record_id: None,
        }
    }

    /// Changes within one scope of an entity.
    pub fn scoped(entity: impl Into<String>, scope_key: impl Into<String>) -> Self {
        Self {
            entity: entity.into(),
            scope_key: Some(scope_key.into()),
            record_id: None,
        }
    }

    /// Changes to a single record.
    pub fn record(entity: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            entity: entity.into(),
            scope_key: None,
            record_id: Some(id.into()),
        }
    }

    /// Whether any record in `set` matches this filter.
    pub fn matches(&self, set: &ChangeSet) -> bool {
        if set.entity != self.entity {
            return false;
        }
        set.records.iter().any(|r| {
            self.scope_key
                .as_ref()
                .is_none_or(|scope| &r.scope_key == scope)
                && self.record_id.as_ref().is_none_or(|id| &r.id == id)
        })
    }
}

struct BusSub {
    id: SubscriptionId,
    filter: SubscriptionFilter,
    tx: mpsc::UnboundedSender<ChangeSet>,
}

/// The process-wide change bus. One instance per [`LocalStore`].
///
/// [`LocalStore`]: crate::store::LocalStore
pub struct ChangeBus {
    subs: Mutex<Vec<BusSub>>,
    next_id: AtomicU64,
}

impl ChangeBus {
    pub fn new() -> Self {
        Self {
            subs: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a subscription and return its handle.
    ///
    /// The handle cancels the subscription on drop; [`BusSubscription::recv`]
    /// yields one [`ChangeSet`] per committed transaction that matched.
    pub fn subscribe(self: &Arc<Self>, filter: SubscriptionFilter) -> BusSubscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        self.subs.lock().push(BusSub { id, filter, tx });
        BusSubscription {
            id,
            rx,
            bus: Some(Arc::clone(self)),
        }
    }

    /// Remove the subscription. After this returns, no further messages are
    /// enqueued for it. Safe to call for an already-removed id.
    pub fn cancel(&self, id: SubscriptionId) {
        self.subs.lock().retain(|s| s.id != id);
    }

    /// Deliver `set` to every matching subscription.
    ///
    /// Senders are snapshotted under the lock and the lock is released before
    /// sending; a send is a plain enqueue, so publishing never blocks on or
    /// re-enters subscriber code. Subscriptions whose receiver was dropped
    /// are pruned.
    pub fn publish(&self, set: &ChangeSet) {
        if set.records.is_empty() {
            return;
        }
        let matching: Vec<(SubscriptionId, mpsc::UnboundedSender<ChangeSet>)> = {
            let subs = self.subs.lock();
            subs.iter()
                .filter(|s| s.filter.matches(set))
                .map(|s| (s.id, s.tx.clone()))
                .collect()
        };

        let mut dead = Vec::new();
        for (id, tx) in matching {
            if tx.send(set.clone()).is_err() {
                dead.push(id);
            }
        }
        if !dead.is_empty() {
            self.subs.lock().retain(|s| !dead.contains(&s.id));
        }
    }

    /// Number of live subscriptions.
    pub fn len(&self) -> usize {
        self.subs.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.subs.lock().is_empty()
    }
}

impl Default for ChangeBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Owned handle to a bus subscription: the cancellation token and the
/// receiving end of the change channel.
pub struct BusSubscription {
    id: SubscriptionId,
    rx: mpsc::UnboundedReceiver<ChangeSet>,
    bus: Option<Arc<ChangeBus>>,
}

impl BusSubscription {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Await the next matching change. Returns `None` once cancelled and
    /// drained.
    pub async fn recv(&mut self) -> Option<ChangeSet> {
        self.rx.recv().await
    }

    /// Non-blocking poll, for synchronous consumers.
    pub fn try_recv(&mut self) -> Option<ChangeSet> {
        self.rx.try_recv().ok()
    }

    /// Cancel the subscription. Guarantees no further messages are enqueued
    /// once this returns.
    pub fn cancel(&mut self) {
        if let Some(bus) = self.bus.take() {
            bus.cancel(self.id);
        }
        self.rx.close();
    }
}

impl Drop for BusSubscription {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.take() {
            bus.cancel(self.id);
        }
    }
}
