//! Per-scope sync status — the observable signal the UI reads instead of
//! catching sync errors.
//!
//! Network failures never surface as thrown errors on the repository call
//! path; they land here, with the backoff bookkeeping the scheduled passes
//! consult. Consumers either poll [`SyncStatusBoard::status`] or listen on
//! the broadcast channel from [`SyncStatusBoard::watch`].

use std::collections::HashMap;

use parking_lot::Mutex;
use tokio::sync::broadcast;

use super::types::Scope;

const BACKOFF_BASE_MS: i64 = 1_000;
const BACKOFF_CAP_MS: i64 = 300_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScopePhase {
    #[default]
    Idle,
    Pulling,
    Pushing,
}

#[derive(Debug, Clone, Default)]
pub struct ScopeStatus {
    pub phase: ScopePhase,
    pub consecutive_failures: u32,
    /// Earliest time (ms) a scheduled pass should retry this scope.
    pub next_retry_at: Option<i64>,
    /// Set on auth failure; cleared when credentials are refreshed.
    pub suspended: bool,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct StatusEvent {
    pub scope: Scope,
    pub status: ScopeStatus,
}

pub struct SyncStatusBoard {
    scopes: Mutex<HashMap<Scope, ScopeStatus>>,
    tx: broadcast::Sender<StatusEvent>,
}

impl SyncStatusBoard {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(64);
        Self {
            scopes: Mutex::new(HashMap::new()),
            tx,
        }
    }

    /// Current status of a scope (default idle for unseen scopes).
    pub fn status(&self, scope: &Scope) -> ScopeStatus {
        self.scopes.lock().get(scope).cloned().unwrap_or_default()
    }

    /// Subscribe to status changes.
    pub fn watch(&self) -> broadcast::Receiver<StatusEvent> {
        self.tx.subscribe()
    }

    pub fn set_phase(&self, scope: &Scope, phase: ScopePhase) {
        self.update(scope, |s| s.phase = phase);
    }

    /// Record a failed pass: bump the failure count and move the retry
    /// horizon out exponentially.
    pub fn record_failure(&self, scope: &Scope, message: &str, now: i64) {
        self.update(scope, |s| {
            s.phase = ScopePhase::Idle;
            s.consecutive_failures += 1;
            s.next_retry_at = Some(now + backoff_ms(s.consecutive_failures));
            s.last_error = Some(message.to_string());
        });
    }

    /// Record a successful pass: clear failures and the retry horizon.
    pub fn record_success(&self, scope: &Scope) {
        self.update(scope, |s| {
            s.phase = ScopePhase::Idle;
            s.consecutive_failures = 0;
            s.next_retry_at = None;
            s.last_error = None;
        });
    }

    /// Suspend the scope after an auth failure.
    pub fn suspend(&self, scope: &Scope, message: &str) {
        self.update(scope, |s| {
            s.phase = ScopePhase::Idle;
            s.suspended = true;
            s.last_error = Some(message.to_string());
        });
    }

    pub fn is_suspended(&self, scope: &Scope) -> bool {
        self.scopes
            .lock()
            .get(scope)
            .is_some_and(|s| s.suspended)
    }

    /// Lift every auth suspension (credentials were refreshed).
    pub fn resume_all(&self) {
        let mut scopes = self.scopes.lock();
        let mut resumed = Vec::new();
        for (scope, status) in scopes.iter_mut() {
            if status.suspended {
                status.suspended = false;
                status.last_error = None;
                resumed.push(StatusEvent {
                    scope: scope.clone(),
                    status: status.clone(),
                });
            }
        }
        drop(scopes);
        for event in resumed {
            let _ = self.tx.send(event);
        }
    }

    /// Whether a scheduled pass should wait out the backoff window.
    pub fn should_defer(&self, scope: &Scope, now: i64) -> bool {
        self.scopes
            .lock()
            .get(scope)
            .and_then(|s| s.next_retry_at)
            .is_some_and(|at| now < at)
    }

    fn update(&self, scope: &Scope, f: impl FnOnce(&mut ScopeStatus)) {
        let status = {
            let mut scopes = self.scopes.lock();
            let status = scopes.entry(scope.clone()).or_default();
            f(status);
            status.clone()
        };
        let _ = self.tx.send(StatusEvent {
            scope: scope.clone(),
            status,
        });
    }
}

impl Default for SyncStatusBoard {
    fn default() -> Self {
        Self::new()
    }
}

fn backoff_ms(failures: u32) -> i64 {
    let shift = failures.saturating_sub(1).min(16);
    (BACKOFF_BASE_MS << shift).min(BACKOFF_CAP_MS)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        assert_eq!(backoff_ms(1), 1_000);
        assert_eq!(backoff_ms(2), 2_000);
        assert_eq!(backoff_ms(3), 4_000);
        assert_eq!(backoff_ms(30), BACKOFF_CAP_MS);
    }

    #[test]
    fn failure_then_success_clears_retry_horizon() {
        let board = SyncStatusBoard::new();
        let scope = Scope::new("comments", "ep-1");

        board.record_failure(&scope, "connection refused", 1_000);
        assert!(board.should_defer(&scope, 1_500));
        assert!(!board.should_defer(&scope, 2_500));

        board.record_success(&scope);
        assert!(!board.should_defer(&scope, 1_500));
        assert_eq!(board.status(&scope).consecutive_failures, 0);
    }

    #[test]
    fn suspension_is_lifted_by_resume_all() {
        let board = SyncStatusBoard::new();
        let scope = Scope::new("comments", "ep-1");
        board.suspend(&scope, "token expired");
        assert!(board.is_suspended(&scope));
        board.resume_all();
        assert!(!board.is_suspended(&scope));
    }
}
